use thiserror::Error;

use crate::types::MessageHash;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Enclave error: {0}")]
    Enclave(#[from] EnclaveError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by send, receive and store operations.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// A privacy-mode rule was violated by the request or payload.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Privacy violation: {0}")]
    PrivacyViolation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("No suitable recipient keys found to decrypt payload for {0}")]
    RecipientKeyNotFound(String),

    #[error("Operation invalid. Transaction found is not a mandatory recipients privacy type")]
    MandatoryRecipientsNotAvailable,

    #[error("Enclave error: {0}")]
    Enclave(#[from] EnclaveError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid payload: {0}")]
    Payload(#[from] PayloadError),
}

impl TransactionError {
    pub fn message_not_found(hash: &MessageHash) -> Self {
        TransactionError::NotFound(format!("Message with hash {} was not found", hash))
    }

    pub fn raw_not_found(hash: &MessageHash) -> Self {
        TransactionError::NotFound(format!("Raw message with hash {} was not found", hash))
    }
}

#[derive(Error, Debug)]
pub enum EnclaveError {
    #[error("Key not managed by this enclave: {0}")]
    KeyNotManaged(String),

    #[error("Recipient box missing for key {0}")]
    MissingRecipientBox(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("Invalid payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to open {name} database: {source}")]
    DatabaseOpen {
        name: String,
        #[source]
        source: sled::Error,
    },

    #[error("Database operation failed: {0}")]
    DatabaseOp(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Record {0} already exists")]
    AlreadyExists(String),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Decoded payload is invalid: {0}")]
    Invalid(#[from] PayloadError),
}

/// Construction-time validation failures for payloads and metadata.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("{boxes} recipient boxes for {keys} recipient keys")]
    BoxKeyMismatch { boxes: usize, keys: usize },

    #[error("mandatory recipients must be a subset of the recipient keys")]
    MandatoryNotRecipient,

    #[error("mandatory recipients are only allowed for MANDATORY_RECIPIENTS")]
    UnexpectedMandatoryRecipients,

    #[error("execution hash is required for PRIVATE_STATE_VALIDATION")]
    MissingExecHash,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid public key: {0}")]
pub struct InvalidKeyError(pub String);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("Peer {url} responded with status {status}")]
    Status { url: String, status: u16 },

    #[error("Request to {0} timed out")]
    Timeout(String),
}

/// Failures of the peer-discovery protocol.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    #[error("Received payload is not a validation challenge")]
    NotAChallenge,

    #[error("No managed key found among the challenge recipients")]
    NoManagedRecipient,

    #[error("Malformed party info: {0}")]
    Malformed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Enclave error: {0}")]
    Enclave(#[from] EnclaveError),
}
