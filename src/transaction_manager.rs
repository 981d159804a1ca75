//! Send, receive and store orchestration.
//!
//! Outbound: validate → encrypt → persist → publish, with publishing only
//! ever triggered from the post-commit callback. Inbound: resolve affected
//! transactions → security-hash check → payload validation → merge into the
//! stored record under a per-hash lock.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::codec::PayloadCodec;
use crate::enclave::Enclave;
use crate::error::TransactionError;
use crate::payload::{EncodedPayload, EncryptedRawTransaction, EncryptedTransaction};
use crate::pipeline::{PayloadPipeline, PrivacyOptions};
use crate::privacy::PrivacyValidator;
use crate::publisher::PayloadPublisher;
use crate::storage::RecordStore;
use crate::types::{MessageHash, PrivacyGroupId, PrivacyMode, PublicKey, TxHash};

pub use crate::pipeline::SendRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSignedRequest {
    /// Hash of a previously stored raw transaction.
    pub hash: MessageHash,
    pub recipients: Vec<PublicKey>,
    pub privacy: PrivacyOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResponse {
    pub hash: MessageHash,
    pub sender: PublicKey,
    pub managed_parties: BTreeSet<PublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub hash: MessageHash,
    pub recipient: Option<PublicKey>,
    pub raw: bool,
}

impl ReceiveRequest {
    pub fn new(hash: MessageHash) -> Self {
        Self {
            hash,
            recipient: None,
            raw: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveResponse {
    pub payload: Vec<u8>,
    pub sender: PublicKey,
    pub privacy_mode: PrivacyMode,
    /// Only set for private state validation.
    pub exec_hash: Vec<u8>,
    pub affected_transactions: BTreeSet<MessageHash>,
    pub privacy_group_id: Option<PrivacyGroupId>,
    pub managed_parties: BTreeSet<PublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRawRequest {
    pub payload: Vec<u8>,
    /// Defaults to the enclave's default key.
    pub sender: Option<PublicKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRawResponse {
    pub hash: MessageHash,
}

/// Serializes read-modify-write sequences per message hash.
#[derive(Default)]
pub struct HashLocks {
    locks: Arc<DashMap<MessageHash, Arc<Mutex<()>>>>,
}

impl HashLocks {
    pub async fn lock(&self, hash: &MessageHash) -> HashLockGuard {
        let mutex = self.locks.entry(hash.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        HashLockGuard {
            guard: Some(guard),
            hash: hash.clone(),
            locks: self.locks.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct HashLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    hash: MessageHash,
    locks: Arc<DashMap<MessageHash, Arc<Mutex<()>>>>,
}

impl Drop for HashLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Entry is only referenced by the map once nobody holds or awaits it
        self.locks
            .remove_if(&self.hash, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

pub struct TransactionManager {
    enclave: Arc<dyn Enclave>,
    encrypted_store: Arc<dyn RecordStore<EncryptedTransaction>>,
    raw_store: Arc<dyn RecordStore<EncryptedRawTransaction>>,
    privacy: Arc<dyn PrivacyValidator>,
    publisher: Arc<dyn PayloadPublisher>,
    pipeline: PayloadPipeline,
    codec: PayloadCodec,
    locks: HashLocks,
}

impl TransactionManager {
    pub fn new(
        enclave: Arc<dyn Enclave>,
        encrypted_store: Arc<dyn RecordStore<EncryptedTransaction>>,
        raw_store: Arc<dyn RecordStore<EncryptedRawTransaction>>,
        privacy: Arc<dyn PrivacyValidator>,
        publisher: Arc<dyn PayloadPublisher>,
        codec: PayloadCodec,
    ) -> Self {
        let pipeline = PayloadPipeline::new(enclave.clone(), privacy.clone());
        Self {
            enclave,
            encrypted_store,
            raw_store,
            privacy,
            publisher,
            pipeline,
            codec,
            locks: HashLocks::default(),
        }
    }

    pub fn pipeline(&self) -> &PayloadPipeline {
        &self.pipeline
    }

    pub async fn send(&self, request: SendRequest) -> Result<SendResponse, TransactionError> {
        let prepared = self
            .pipeline
            .prepare(&request.sender, &request.recipients, &request.privacy)
            .await?;

        let payload = self.enclave.encrypt_payload(
            &request.payload,
            &request.sender,
            &prepared.recipients,
            &prepared.metadata,
        )?;

        self.persist_and_publish(payload, &prepared.recipients).await
    }

    /// Send a raw transaction stored earlier with `store_raw`.
    pub async fn send_signed_transaction(
        &self,
        request: SendSignedRequest,
    ) -> Result<SendResponse, TransactionError> {
        let raw = self
            .raw_store
            .retrieve_by_hash(&request.hash)
            .await?
            .ok_or_else(|| TransactionError::raw_not_found(&request.hash))?;

        let prepared = self
            .pipeline
            .prepare(&raw.sender, &request.recipients, &request.privacy)
            .await?;

        let payload = self.enclave.encrypt_raw_payload(
            &raw.to_raw_transaction(),
            &prepared.recipients,
            &prepared.metadata,
        )?;

        self.persist_and_publish(payload, &prepared.recipients).await
    }

    async fn persist_and_publish(
        &self,
        payload: EncodedPayload,
        recipients: &[PublicKey],
    ) -> Result<SendResponse, TransactionError> {
        let hash = payload.message_hash();
        let sender = *payload.sender_key();
        let record = EncryptedTransaction::new(&payload, self.codec)?;

        let managed = self.enclave.managed_keys();
        let managed_parties: BTreeSet<PublicKey> = recipients
            .iter()
            .filter(|k| managed.contains(k))
            .copied()
            .collect();
        let remote: Vec<PublicKey> = recipients
            .iter()
            .filter(|k| !managed.contains(k))
            .copied()
            .collect();

        let publisher = self.publisher.clone();
        self.encrypted_store
            .save_with_callback(
                record,
                Box::new(move || publisher.publish(&payload, &remote)),
            )
            .await?;

        info!(
            "✓ Stored outbound transaction {} for {} recipients",
            hash,
            recipients.len()
        );

        Ok(SendResponse {
            hash,
            sender,
            managed_parties,
        })
    }

    /// Encrypt a payload to its sender alone and keep it for a later signed send.
    pub async fn store_raw(
        &self,
        request: StoreRawRequest,
    ) -> Result<StoreRawResponse, TransactionError> {
        let sender = request
            .sender
            .unwrap_or_else(|| self.enclave.default_public_key());
        let raw = self.enclave.encrypt_raw(&request.payload, &sender)?;

        let record = EncryptedRawTransaction::from_raw(raw);
        let hash = record.hash.clone();
        self.raw_store.save(record).await?;
        debug!("Stored raw transaction {}", hash);

        Ok(StoreRawResponse { hash })
    }

    pub async fn receive(
        &self,
        request: ReceiveRequest,
    ) -> Result<ReceiveResponse, TransactionError> {
        if request.raw {
            return self.receive_raw(&request.hash).await;
        }

        let payload = self.load_payload(&request.hash).await?;

        let (key, plaintext) = match request.recipient {
            Some(key) => {
                let plaintext = self.pipeline.decrypt_with(&payload, &key).map_err(|e| {
                    debug!("Requested key {} cannot decrypt {}: {}", key, request.hash, e);
                    TransactionError::RecipientKeyNotFound(request.hash.to_base64())
                })?;
                (key, plaintext)
            }
            None => self.pipeline.search_decrypt(&payload)?,
        };

        let managed_parties = if payload.is_legacy() {
            self.pipeline.legacy_managed_parties(&payload)
        } else {
            let managed = self.enclave.managed_keys();
            payload
                .recipient_keys()
                .iter()
                .filter(|k| managed.contains(k))
                .copied()
                .collect()
        };

        let affected_transactions = self.pipeline.visible_affected(&payload, &key).await?;

        let exec_hash = if payload.privacy_mode() == PrivacyMode::PrivateStateValidation {
            payload.exec_hash().to_vec()
        } else {
            Vec::new()
        };

        Ok(ReceiveResponse {
            payload: plaintext,
            sender: *payload.sender_key(),
            privacy_mode: payload.privacy_mode(),
            exec_hash,
            affected_transactions,
            privacy_group_id: payload.privacy_group_id().cloned(),
            managed_parties,
        })
    }

    async fn receive_raw(&self, hash: &MessageHash) -> Result<ReceiveResponse, TransactionError> {
        let record = self
            .raw_store
            .retrieve_by_hash(hash)
            .await?
            .ok_or_else(|| TransactionError::message_not_found(hash))?;

        let plaintext = self.enclave.decrypt_raw(&record.to_raw_transaction())?;
        let managed_parties = if self.enclave.managed_keys().contains(&record.sender) {
            BTreeSet::from([record.sender])
        } else {
            BTreeSet::new()
        };

        Ok(ReceiveResponse {
            payload: plaintext,
            sender: record.sender,
            privacy_mode: PrivacyMode::StandardPrivate,
            exec_hash: Vec::new(),
            affected_transactions: BTreeSet::new(),
            privacy_group_id: None,
            managed_parties,
        })
    }

    /// Store a payload received from another node.
    ///
    /// Returns the payload's hash even when the payload is ignored because it
    /// is inconsistent with the affected transactions known here.
    pub async fn store_payload(
        &self,
        payload: EncodedPayload,
    ) -> Result<MessageHash, TransactionError> {
        let hash = payload.message_hash();
        let tx_hash = TxHash::from(&hash);
        let _guard = self.locks.lock(&hash).await;

        let affected = self.privacy.resolve_affected_from_payload(&payload).await?;
        let invalid = self.enclave.find_invalid_security_hashes(&payload, &affected);

        // Fails outright for private state validation, strips otherwise
        let payload = self
            .privacy
            .sanitise(&tx_hash, &payload, &invalid)
            .map_err(|e| {
                warn!("🚫 Rejected transaction {}: {}", hash, e);
                e
            })?;

        if !self.privacy.validate_payload(&tx_hash, &payload, &affected) {
            return Ok(hash);
        }

        let sender = *payload.sender_key();
        if self.enclave.managed_keys().contains(&sender) {
            // One of our own transactions coming back: it must open for us
            match payload.recipient_keys().first() {
                Some(key) => {
                    self.enclave.decrypt(&payload, key)?;
                }
                // Keyless boxes: any of them may be the one sealed for a local key
                None => {
                    self.pipeline.search_decrypt(&payload)?;
                }
            }
        }

        match self.encrypted_store.retrieve_by_hash(&hash).await? {
            None => {
                let record = EncryptedTransaction::new(&payload, self.codec)?;
                self.encrypted_store.save(record).await?;
                info!("✓ Stored new transaction {} from {}", hash, sender);
            }
            Some(record) => {
                let existing = record.payload()?;
                self.merge_into(&hash, record.codec, &existing, &payload)
                    .await?;
            }
        }

        Ok(hash)
    }

    async fn merge_into(
        &self,
        hash: &MessageHash,
        codec: PayloadCodec,
        existing: &EncodedPayload,
        incoming: &EncodedPayload,
    ) -> Result<(), TransactionError> {
        if existing.cipher_text() != incoming.cipher_text() {
            warn!("⚠️ Ciphertext mismatch for stored transaction {}", hash);
            return Err(TransactionError::Conflict(
                "Invalid existing transaction".to_string(),
            ));
        }

        let psv = existing.privacy_mode() == PrivacyMode::PrivateStateValidation
            || incoming.privacy_mode() == PrivacyMode::PrivateStateValidation;
        if psv {
            let incoming_keys: BTreeSet<&PublicKey> = incoming.recipient_keys().iter().collect();
            if existing
                .recipient_keys()
                .iter()
                .any(|k| !incoming_keys.contains(k))
            {
                warn!("🚫 Recipient set of {} shrank on re-delivery", hash);
                return Err(TransactionError::Validation(
                    "expected recipient not found".to_string(),
                ));
            }
        }

        match existing.merge_recipient_boxes(incoming)? {
            Some(merged) => {
                self.encrypted_store
                    .update(EncryptedTransaction {
                        hash: hash.clone(),
                        encoded_payload: codec.encode(&merged)?,
                        codec,
                    })
                    .await?;
                info!(
                    "✓ Merged recipient boxes into {} ({} boxes)",
                    hash,
                    merged.recipient_boxes().len()
                );
            }
            None => debug!("Transaction {} already up to date", hash),
        }
        Ok(())
    }

    /// Removing an unknown hash is not an error.
    pub async fn delete(&self, hash: &MessageHash) -> Result<(), TransactionError> {
        let _guard = self.locks.lock(hash).await;
        self.encrypted_store.delete(hash).await?;
        info!("Deleted transaction {}", hash);
        Ok(())
    }

    pub async fn is_sender(&self, hash: &MessageHash) -> Result<bool, TransactionError> {
        let payload = self.load_payload(hash).await?;
        Ok(self.enclave.managed_keys().contains(payload.sender_key()))
    }

    pub async fn get_participants(
        &self,
        hash: &MessageHash,
    ) -> Result<Vec<PublicKey>, TransactionError> {
        let payload = self.load_payload(hash).await?;
        Ok(payload.recipient_keys().to_vec())
    }

    pub async fn get_mandatory_recipients(
        &self,
        hash: &MessageHash,
    ) -> Result<BTreeSet<PublicKey>, TransactionError> {
        let payload = self.load_payload(hash).await?;
        if payload.privacy_mode() != PrivacyMode::MandatoryRecipients {
            return Err(TransactionError::MandatoryRecipientsNotAvailable);
        }
        Ok(payload.mandatory_recipients().clone())
    }

    pub async fn upcheck(&self) -> bool {
        let encrypted = self.encrypted_store.upcheck().await;
        let raw = self.raw_store.upcheck().await;
        encrypted && raw
    }

    pub fn default_public_key(&self) -> PublicKey {
        self.enclave.default_public_key()
    }

    async fn load_payload(&self, hash: &MessageHash) -> Result<EncodedPayload, TransactionError> {
        let record = self
            .encrypted_store
            .retrieve_by_hash(hash)
            .await?
            .ok_or_else(|| TransactionError::message_not_found(hash))?;
        Ok(record.payload()?)
    }
}
