//! Stateless send and decrypt steps shared by the transaction manager and by
//! callers that own their own storage and distribution.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::enclave::Enclave;
use crate::error::{EnclaveError, TransactionError};
use crate::payload::{EncodedPayload, PrivacyMetadata};
use crate::privacy::PrivacyValidator;
use crate::types::{MessageHash, PrivacyGroupId, PrivacyMode, PublicKey};

/// Privacy settings of an outbound transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivacyOptions {
    pub privacy_mode: PrivacyMode,
    pub affected_transactions: Vec<MessageHash>,
    pub exec_hash: Vec<u8>,
    pub mandatory_recipients: BTreeSet<PublicKey>,
    pub privacy_group_id: Option<PrivacyGroupId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub payload: Vec<u8>,
    pub sender: PublicKey,
    pub recipients: Vec<PublicKey>,
    pub privacy: PrivacyOptions,
}

impl SendRequest {
    pub fn new(payload: impl Into<Vec<u8>>, sender: PublicKey, recipients: Vec<PublicKey>) -> Self {
        Self {
            payload: payload.into(),
            sender,
            recipients,
            privacy: PrivacyOptions::default(),
        }
    }

    pub fn with_privacy(mut self, privacy: PrivacyOptions) -> Self {
        self.privacy = privacy;
        self
    }
}

/// Final recipient list and metadata for an outbound transaction.
#[derive(Debug, Clone)]
pub struct PreparedSend {
    pub recipients: Vec<PublicKey>,
    pub metadata: PrivacyMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedPayload {
    pub plaintext: Vec<u8>,
    pub key: PublicKey,
    /// Affected transactions this node holds and can itself decrypt.
    pub affected_transactions: BTreeSet<MessageHash>,
}

pub struct PayloadPipeline {
    enclave: Arc<dyn Enclave>,
    privacy: Arc<dyn PrivacyValidator>,
}

impl PayloadPipeline {
    pub fn new(enclave: Arc<dyn Enclave>, privacy: Arc<dyn PrivacyValidator>) -> Self {
        Self { enclave, privacy }
    }

    /// Requested recipients, then the sender, then (for standard sends) the
    /// enclave's forwarding keys. First occurrence wins.
    pub fn resolve_recipients(
        &self,
        sender: &PublicKey,
        requested: &[PublicKey],
        mode: PrivacyMode,
    ) -> Vec<PublicKey> {
        let forwarding = if mode == PrivacyMode::StandardPrivate {
            self.enclave.forwarding_keys()
        } else {
            BTreeSet::new()
        };

        let mut recipients = Vec::with_capacity(requested.len() + 1 + forwarding.len());
        for key in requested
            .iter()
            .chain(std::iter::once(sender))
            .chain(forwarding.iter())
        {
            if !recipients.contains(key) {
                recipients.push(*key);
            }
        }
        recipients
    }

    /// Resolve recipients, validate the privacy settings and derive the
    /// metadata handed to the enclave.
    pub async fn prepare(
        &self,
        sender: &PublicKey,
        requested: &[PublicKey],
        options: &PrivacyOptions,
    ) -> Result<PreparedSend, TransactionError> {
        let recipients = self.resolve_recipients(sender, requested, options.privacy_mode);

        let affected = self
            .privacy
            .find_affected_from_refs(&options.affected_transactions)
            .await?;
        self.privacy.validate_send_request(
            options.privacy_mode,
            &recipients,
            &options.mandatory_recipients,
            &affected,
        )?;

        let metadata = PrivacyMetadata::builder()
            .privacy_mode(options.privacy_mode)
            .affected_transactions(self.privacy.security_hashes(&affected, &recipients))
            .exec_hash(options.exec_hash.clone())
            .mandatory_recipients(options.mandatory_recipients.clone())
            .privacy_group_id(options.privacy_group_id.clone())
            .build()
            .map_err(|e| TransactionError::Validation(e.to_string()))?;

        Ok(PreparedSend {
            recipients,
            metadata,
        })
    }

    /// Encrypt a send request without persisting or distributing it.
    pub async fn create(&self, request: &SendRequest) -> Result<EncodedPayload, TransactionError> {
        let prepared = self
            .prepare(&request.sender, &request.recipients, &request.privacy)
            .await?;
        Ok(self.enclave.encrypt_payload(
            &request.payload,
            &request.sender,
            &prepared.recipients,
            &prepared.metadata,
        )?)
    }

    /// Decrypt with `recipient` if given (enclave errors propagate), otherwise
    /// with the first local key that works.
    pub async fn decrypt(
        &self,
        payload: &EncodedPayload,
        recipient: Option<PublicKey>,
    ) -> Result<DecryptedPayload, TransactionError> {
        let (key, plaintext) = match recipient {
            Some(key) => (key, self.decrypt_with(payload, &key)?),
            None => self.search_decrypt(payload)?,
        };
        let affected_transactions = self.visible_affected(payload, &key).await?;

        Ok(DecryptedPayload {
            plaintext,
            key,
            affected_transactions,
        })
    }

    /// Local keys worth trying, in the order they are tried.
    pub fn candidate_keys(&self, payload: &EncodedPayload) -> Vec<PublicKey> {
        let managed = self.enclave.managed_keys();

        if payload.is_legacy() {
            let sender = *payload.sender_key();
            let mut candidates = Vec::with_capacity(managed.len());
            if managed.contains(&sender) {
                candidates.push(sender);
            }
            candidates.extend(managed.into_iter().filter(|k| *k != sender));
            return candidates;
        }

        let listed: BTreeSet<&PublicKey> = payload.recipient_keys().iter().collect();
        managed
            .into_iter()
            .filter(|k| listed.contains(k))
            .collect()
    }

    /// Try every candidate key until one decrypts.
    pub fn search_decrypt(
        &self,
        payload: &EncodedPayload,
    ) -> Result<(PublicKey, Vec<u8>), TransactionError> {
        for key in self.candidate_keys(payload) {
            match self.decrypt_with(payload, &key) {
                Ok(plaintext) => return Ok((key, plaintext)),
                Err(e) => debug!("Key {} cannot decrypt {}: {}", key, payload.message_hash(), e),
            }
        }
        Err(TransactionError::RecipientKeyNotFound(
            payload.message_hash().to_base64(),
        ))
    }

    /// Decrypt with one key. Legacy payloads carry no key list, so each of
    /// their boxes is tried in turn.
    pub fn decrypt_with(
        &self,
        payload: &EncodedPayload,
        key: &PublicKey,
    ) -> Result<Vec<u8>, EnclaveError> {
        if !payload.is_legacy() || payload.recipient_boxes().len() <= 1 {
            return self.enclave.decrypt(payload, key);
        }

        let mut last_error = EnclaveError::MissingRecipientBox(key.to_base64());
        for index in 0..payload.recipient_boxes().len() {
            if let Some(single) = payload.with_single_box(index) {
                match self.enclave.decrypt(&single, key) {
                    Ok(plaintext) => return Ok(plaintext),
                    Err(e) => last_error = e,
                }
            }
        }
        Err(last_error)
    }

    /// Local keys able to open some box of a legacy payload.
    pub fn legacy_managed_parties(&self, payload: &EncodedPayload) -> BTreeSet<PublicKey> {
        self.candidate_keys(payload)
            .into_iter()
            .filter(|key| self.decrypt_with(payload, key).is_ok())
            .collect()
    }

    /// Affected transactions this node stores and can decrypt itself. Each is
    /// tried with `preferred` first, then with any other local key, since its
    /// recipient set may differ from the primary payload's.
    pub async fn visible_affected(
        &self,
        payload: &EncodedPayload,
        preferred: &PublicKey,
    ) -> Result<BTreeSet<MessageHash>, TransactionError> {
        let refs: Vec<MessageHash> = payload
            .affected_contract_transactions()
            .keys()
            .map(MessageHash::from)
            .collect();
        if refs.is_empty() {
            return Ok(BTreeSet::new());
        }

        let known = self.privacy.find_affected_from_refs(&refs).await?;
        Ok(known
            .into_iter()
            .filter(|tx| {
                self.decrypt_with(&tx.payload, preferred).is_ok()
                    || self.search_decrypt(&tx.payload).is_ok()
            })
            .map(|tx| MessageHash::from(&tx.hash))
            .collect())
    }
}
