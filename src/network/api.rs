//! JSON bodies of the client transaction API.
//!
//! Keys, hashes and payload bytes travel as standard base64. Anything that
//! fails to parse is a validation error, reported as 400.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::TransactionError;
use crate::payload::EncodedPayload;
use crate::pipeline::{DecryptedPayload, PrivacyOptions, SendRequest};
use crate::transaction_manager::{
    ReceiveResponse, SendResponse, SendSignedRequest, StoreRawRequest, StoreRawResponse,
};
use crate::types::{MessageHash, PrivacyGroupId, PrivacyMode, PublicKey};

/// Privacy fields shared by `/send`, `/sendsignedtx` and `/encodedpayload/create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyJson {
    #[serde(default)]
    pub privacy_flag: u8,
    #[serde(default)]
    pub affected_contract_transactions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_hash: Option<String>,
    #[serde(default)]
    pub mandatory_recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_group_id: Option<String>,
}

impl PrivacyJson {
    pub fn to_options(&self) -> Result<PrivacyOptions, TransactionError> {
        let privacy_mode = PrivacyMode::from_code(self.privacy_flag).ok_or_else(|| {
            TransactionError::Validation(format!("Unknown privacy flag {}", self.privacy_flag))
        })?;

        let affected_transactions = self
            .affected_contract_transactions
            .iter()
            .map(|h| parse_hash(h))
            .collect::<Result<Vec<_>, _>>()?;
        let mandatory_recipients = self
            .mandatory_recipients
            .iter()
            .map(|k| parse_key(k))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let exec_hash = match &self.exec_hash {
            Some(encoded) => decode_base64("execHash", encoded)?,
            None => Vec::new(),
        };
        let privacy_group_id = match &self.privacy_group_id {
            Some(encoded) => Some(PrivacyGroupId::from_bytes(decode_base64(
                "privacyGroupId",
                encoded,
            )?)),
            None => None,
        };

        Ok(PrivacyOptions {
            privacy_mode,
            affected_transactions,
            exec_hash,
            mandatory_recipients,
            privacy_group_id,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendJson {
    pub payload: String,
    /// Defaults to the node's default key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(flatten)]
    pub privacy: PrivacyJson,
}

impl SendJson {
    pub fn into_request(self, default_sender: PublicKey) -> Result<SendRequest, TransactionError> {
        let sender = match &self.from {
            Some(key) => parse_key(key)?,
            None => default_sender,
        };
        let recipients = parse_keys(&self.to)?;
        let privacy = self.privacy.to_options()?;
        let payload = decode_base64("payload", &self.payload)?;

        Ok(SendRequest::new(payload, sender, recipients).with_privacy(privacy))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSignedJson {
    pub hash: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(flatten)]
    pub privacy: PrivacyJson,
}

impl SendSignedJson {
    pub fn into_request(self) -> Result<SendSignedRequest, TransactionError> {
        Ok(SendSignedRequest {
            hash: parse_hash(&self.hash)?,
            recipients: parse_keys(&self.to)?,
            privacy: self.privacy.to_options()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRawJson {
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl StoreRawJson {
    pub fn into_request(self) -> Result<StoreRawRequest, TransactionError> {
        Ok(StoreRawRequest {
            payload: decode_base64("payload", &self.payload)?,
            sender: self.from.as_deref().map(parse_key).transpose()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponseJson {
    pub key: String,
    pub sender_key: String,
    pub managed_parties: Vec<String>,
}

impl From<&SendResponse> for SendResponseJson {
    fn from(response: &SendResponse) -> Self {
        Self {
            key: response.hash.to_base64(),
            sender_key: response.sender.to_base64(),
            managed_parties: encode_keys(&response.managed_parties),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRawResponseJson {
    pub key: String,
}

impl From<&StoreRawResponse> for StoreRawResponseJson {
    fn from(response: &StoreRawResponse) -> Self {
        Self {
            key: response.hash.to_base64(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveResponseJson {
    pub payload: String,
    pub sender_key: String,
    pub privacy_flag: u8,
    pub exec_hash: String,
    pub affected_contract_transactions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy_group_id: Option<String>,
    pub managed_parties: Vec<String>,
}

impl From<&ReceiveResponse> for ReceiveResponseJson {
    fn from(response: &ReceiveResponse) -> Self {
        Self {
            payload: BASE64.encode(&response.payload),
            sender_key: response.sender.to_base64(),
            privacy_flag: response.privacy_mode.code(),
            exec_hash: BASE64.encode(&response.exec_hash),
            affected_contract_transactions: encode_hashes(&response.affected_transactions),
            privacy_group_id: response
                .privacy_group_id
                .as_ref()
                .map(|id| BASE64.encode(id.as_bytes())),
            managed_parties: encode_keys(&response.managed_parties),
        }
    }
}

/// Plaintext of a payload opened by `/encodedpayload/decrypt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptResponseJson {
    pub payload: String,
    pub recipient_key: String,
    pub privacy_flag: u8,
    pub exec_hash: String,
    pub affected_contract_transactions: Vec<String>,
}

impl DecryptResponseJson {
    pub fn new(payload: &EncodedPayload, decrypted: &DecryptedPayload) -> Self {
        Self {
            payload: BASE64.encode(&decrypted.plaintext),
            recipient_key: decrypted.key.to_base64(),
            privacy_flag: payload.privacy_mode().code(),
            exec_hash: BASE64.encode(payload.exec_hash()),
            affected_contract_transactions: encode_hashes(&decrypted.affected_transactions),
        }
    }
}

pub fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, TransactionError> {
    serde_json::from_slice(body)
        .map_err(|e| TransactionError::Validation(format!("Invalid request body: {}", e)))
}

pub fn parse_key(encoded: &str) -> Result<PublicKey, TransactionError> {
    PublicKey::from_base64(encoded)
        .map_err(|e| TransactionError::Validation(format!("Invalid key {}: {}", encoded, e.0)))
}

pub fn parse_hash(encoded: &str) -> Result<MessageHash, TransactionError> {
    let hash = MessageHash::from_base64(encoded)
        .map_err(|e| TransactionError::Validation(format!("Invalid hash {}: {}", encoded, e)))?;
    if hash.as_bytes().is_empty() {
        return Err(TransactionError::Validation("Empty hash".to_string()));
    }
    Ok(hash)
}

/// Decode one percent-encoded path segment or query value. Base64 `/` must
/// arrive as `%2F`; `+` is kept literally.
pub fn percent_decode(value: &str) -> Result<String, TransactionError> {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| TransactionError::Validation(format!("Invalid percent-encoding: {}", e)))
}

/// First value of `name` in a raw query string, percent-decoded.
pub fn query_param(query: &str, name: &str) -> Result<Option<String>, TransactionError> {
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name {
            return percent_decode(value).map(Some);
        }
    }
    Ok(None)
}

fn parse_keys(encoded: &[String]) -> Result<Vec<PublicKey>, TransactionError> {
    encoded.iter().map(|k| parse_key(k)).collect()
}

fn decode_base64(field: &str, encoded: &str) -> Result<Vec<u8>, TransactionError> {
    BASE64
        .decode(encoded.trim())
        .map_err(|e| TransactionError::Validation(format!("Invalid base64 in {}: {}", field, e)))
}

pub fn encode_keys<'a>(keys: impl IntoIterator<Item = &'a PublicKey>) -> Vec<String> {
    keys.into_iter().map(PublicKey::to_base64).collect()
}

fn encode_hashes<'a>(hashes: impl IntoIterator<Item = &'a MessageHash>) -> Vec<String> {
    hashes.into_iter().map(MessageHash::to_base64).collect()
}
