//! Identifiers shared across the transaction engine.
//!
//! Keys and hashes are opaque byte values compared by value. Everything that
//! is shown to an operator (logs, errors, JSON) is rendered as standard base64.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::InvalidKeyError;

/// Length in bytes of a participant key.
pub const KEY_LENGTH: usize = 32;

/// A participant's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; KEY_LENGTH]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, InvalidKeyError> {
        let array: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| {
            InvalidKeyError(format!(
                "expected {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, InvalidKeyError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| InvalidKeyError(format!("bad base64: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

/// Digest of a payload's ciphertext. Primary identity of a stored transaction;
/// it does not change when recipients are added.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageHash(Vec<u8>);

impl MessageHash {
    /// SHA-512 of the ciphertext.
    pub fn of(cipher_text: &[u8]) -> Self {
        Self(Sha512::digest(cipher_text).to_vec())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        BASE64.decode(encoded.trim()).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageHash({})", self.to_base64())
    }
}

/// Reference to an affected transaction, carried inside another payload.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxHash(Vec<u8>);

impl TxHash {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }
}

impl From<&MessageHash> for TxHash {
    fn from(hash: &MessageHash) -> Self {
        Self(hash.0.clone())
    }
}

impl From<&TxHash> for MessageHash {
    fn from(hash: &TxHash) -> Self {
        Self(hash.0.clone())
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", self.to_base64())
    }
}

/// Digest binding a recipient set to an affected transaction's ciphertext.
///
/// Two nodes that agree on who may see the affected transaction derive the
/// same value, so a mismatch exposes a disagreement about visibility.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityHash(Vec<u8>);

impl SecurityHash {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Derive from an (ordered, deduplicated) recipient set and a ciphertext.
    pub fn derive(recipients: &BTreeSet<PublicKey>, cipher_text: &[u8]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update((recipients.len() as u64).to_be_bytes());
        for key in recipients {
            hasher.update(key.as_bytes());
        }
        hasher.update(cipher_text);
        Self(hasher.finalize().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecurityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecurityHash({})", BASE64.encode(&self.0))
    }
}

/// Privacy policy attached to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PrivacyMode {
    #[default]
    StandardPrivate,
    PartyProtection,
    MandatoryRecipients,
    PrivateStateValidation,
}

impl PrivacyMode {
    pub fn code(self) -> u8 {
        match self {
            PrivacyMode::StandardPrivate => 0,
            PrivacyMode::PartyProtection => 1,
            PrivacyMode::MandatoryRecipients => 2,
            PrivacyMode::PrivateStateValidation => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PrivacyMode::StandardPrivate),
            1 => Some(PrivacyMode::PartyProtection),
            2 => Some(PrivacyMode::MandatoryRecipients),
            3 => Some(PrivacyMode::PrivateStateValidation),
            _ => None,
        }
    }
}

impl fmt::Display for PrivacyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrivacyMode::StandardPrivate => "STANDARD_PRIVATE",
            PrivacyMode::PartyProtection => "PARTY_PROTECTION",
            PrivacyMode::MandatoryRecipients => "MANDATORY_RECIPIENTS",
            PrivacyMode::PrivateStateValidation => "PRIVATE_STATE_VALIDATION",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrivacyGroupId(Vec<u8>);

impl PrivacyGroupId {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Master key sealed for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipientBox(Vec<u8>);

impl RecipientBox {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Nonce(Vec<u8>);

impl Nonce {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
