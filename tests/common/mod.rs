//! Test doubles shared by the integration suites.
#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use privtx::codec::PayloadCodec;
use privtx::enclave::Enclave;
use privtx::error::{EnclaveError, StorageError, TransportError};
use privtx::network::client::PeerClient;
use privtx::network::party_info::PartyInfoService;
use privtx::network::peer_validator::{PeerDiscoveryValidator, VALIDATE_PATH};
use privtx::payload::{
    EncodedPayload, EncryptedRawTransaction, EncryptedTransaction, PrivacyMetadata, RawTransaction,
};
use privtx::privacy::StorePrivacyValidator;
use privtx::publisher::PayloadPublisher;
use privtx::storage::{InMemoryStore, OnCommit, Record, RecordStore};
use privtx::transaction_manager::TransactionManager;
use privtx::types::{MessageHash, Nonce, PublicKey, RecipientBox};

pub const CIPHERTEXT: &[u8] = b"CIPHERTEXT";
pub const PLAINTEXT: &[u8] = b"PAYLOAD";

pub fn key(n: u8) -> PublicKey {
    PublicKey::from_bytes([n; 32])
}

/// Box that only `key` can open in the stub enclave.
pub fn box_for(key: &PublicKey) -> RecipientBox {
    RecipientBox::from_bytes(key.as_bytes().to_vec())
}

/// Enclave with a fixed ciphertext. A recipient box "opens" for a managed key
/// when its bytes are that key's bytes.
pub struct StubEnclave {
    default_key: PublicKey,
    managed: BTreeSet<PublicKey>,
    forwarding: BTreeSet<PublicKey>,
    cipher_text: Vec<u8>,
    plaintext: Vec<u8>,
}

impl StubEnclave {
    pub fn new(managed: impl IntoIterator<Item = PublicKey>) -> Self {
        let managed: Vec<PublicKey> = managed.into_iter().collect();
        Self {
            default_key: managed.first().copied().unwrap_or_else(|| key(0)),
            managed: managed.into_iter().collect(),
            forwarding: BTreeSet::new(),
            cipher_text: CIPHERTEXT.to_vec(),
            plaintext: PLAINTEXT.to_vec(),
        }
    }

    pub fn with_forwarding_keys(mut self, keys: impl IntoIterator<Item = PublicKey>) -> Self {
        self.forwarding = keys.into_iter().collect();
        self
    }

    pub fn with_cipher_text(mut self, cipher_text: &[u8]) -> Self {
        self.cipher_text = cipher_text.to_vec();
        self
    }

    fn build(
        &self,
        sender: &PublicKey,
        cipher_text: Vec<u8>,
        recipients: &[PublicKey],
        metadata: &PrivacyMetadata,
    ) -> Result<EncodedPayload, EnclaveError> {
        Ok(EncodedPayload::builder()
            .sender_key(*sender)
            .cipher_text(cipher_text)
            .cipher_text_nonce(Nonce::from_bytes(vec![1; 12]))
            .recipient_nonce(Nonce::from_bytes(vec![2; 12]))
            .recipient_keys(recipients.to_vec())
            .recipient_boxes(recipients.iter().map(box_for).collect())
            .privacy_metadata(metadata)
            .build()?)
    }
}

impl Enclave for StubEnclave {
    fn default_public_key(&self) -> PublicKey {
        self.default_key
    }

    fn managed_keys(&self) -> BTreeSet<PublicKey> {
        self.managed.clone()
    }

    fn forwarding_keys(&self) -> BTreeSet<PublicKey> {
        self.forwarding.clone()
    }

    fn encrypt_payload(
        &self,
        _message: &[u8],
        sender: &PublicKey,
        recipients: &[PublicKey],
        metadata: &PrivacyMetadata,
    ) -> Result<EncodedPayload, EnclaveError> {
        self.build(sender, self.cipher_text.clone(), recipients, metadata)
    }

    fn encrypt_raw_payload(
        &self,
        raw: &RawTransaction,
        recipients: &[PublicKey],
        metadata: &PrivacyMetadata,
    ) -> Result<EncodedPayload, EnclaveError> {
        self.build(&raw.from, raw.encrypted_payload.clone(), recipients, metadata)
    }

    fn encrypt_raw(
        &self,
        _message: &[u8],
        sender: &PublicKey,
    ) -> Result<RawTransaction, EnclaveError> {
        Ok(RawTransaction {
            encrypted_payload: self.cipher_text.clone(),
            encrypted_key: sender.as_bytes().to_vec(),
            nonce: Nonce::from_bytes(vec![3; 12]),
            from: *sender,
        })
    }

    fn decrypt(&self, payload: &EncodedPayload, key: &PublicKey) -> Result<Vec<u8>, EnclaveError> {
        if !self.managed.contains(key) {
            return Err(EnclaveError::KeyNotManaged(key.to_base64()));
        }
        let opens = if payload.is_legacy() {
            payload.recipient_boxes().iter().any(|b| *b == box_for(key))
        } else {
            payload.recipient_box_for(key) == Some(&box_for(key))
        };
        if opens {
            Ok(self.plaintext.clone())
        } else {
            Err(EnclaveError::DecryptionFailed)
        }
    }

    fn decrypt_raw(&self, raw: &RawTransaction) -> Result<Vec<u8>, EnclaveError> {
        if self.managed.contains(&raw.from) {
            Ok(self.plaintext.clone())
        } else {
            Err(EnclaveError::KeyNotManaged(raw.from.to_base64()))
        }
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    calls: Mutex<Vec<(EncodedPayload, Vec<PublicKey>)>>,
}

impl RecordingPublisher {
    pub fn calls(&self) -> Vec<(EncodedPayload, Vec<PublicKey>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl PayloadPublisher for RecordingPublisher {
    fn publish(&self, payload: &EncodedPayload, recipients: &[PublicKey]) {
        self.calls
            .lock()
            .unwrap()
            .push((payload.clone(), recipients.to_vec()));
    }
}

/// Wraps a store and reports it as down, or counts reads, as needed.
pub struct CountingStore<R> {
    inner: InMemoryStore<R>,
    up: bool,
    reads: Mutex<usize>,
}

impl<R> CountingStore<R> {
    pub fn up() -> Self {
        Self {
            inner: InMemoryStore::new(),
            up: true,
            reads: Mutex::new(0),
        }
    }

    pub fn down() -> Self {
        Self {
            up: false,
            ..Self::up()
        }
    }

    pub fn reads(&self) -> usize {
        *self.reads.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl<R: Record> RecordStore<R> for CountingStore<R> {
    async fn save(&self, record: R) -> Result<(), StorageError> {
        self.inner.save(record).await
    }

    async fn save_with_callback(&self, record: R, on_commit: OnCommit) -> Result<(), StorageError> {
        self.inner.save_with_callback(record, on_commit).await
    }

    async fn update(&self, record: R) -> Result<(), StorageError> {
        self.inner.update(record).await
    }

    async fn delete(&self, hash: &MessageHash) -> Result<(), StorageError> {
        self.inner.delete(hash).await
    }

    async fn retrieve_by_hash(&self, hash: &MessageHash) -> Result<Option<R>, StorageError> {
        *self.reads.lock().unwrap() += 1;
        self.inner.retrieve_by_hash(hash).await
    }

    async fn find_by_hashes(&self, hashes: &[MessageHash]) -> Result<Vec<R>, StorageError> {
        *self.reads.lock().unwrap() += 1;
        self.inner.find_by_hashes(hashes).await
    }

    async fn upcheck(&self) -> bool {
        self.up
    }
}

pub struct Node {
    pub manager: Arc<TransactionManager>,
    pub encrypted: Arc<CountingStore<EncryptedTransaction>>,
    pub raw: Arc<CountingStore<EncryptedRawTransaction>>,
    pub publisher: Arc<RecordingPublisher>,
}

impl Node {
    pub fn new(enclave: impl Enclave + 'static) -> Self {
        Self::with_stores(
            Arc::new(enclave),
            Arc::new(CountingStore::up()),
            Arc::new(CountingStore::up()),
        )
    }

    pub fn with_stores(
        enclave: Arc<dyn Enclave>,
        encrypted: Arc<CountingStore<EncryptedTransaction>>,
        raw: Arc<CountingStore<EncryptedRawTransaction>>,
    ) -> Self {
        let publisher = Arc::new(RecordingPublisher::default());
        let manager = Arc::new(TransactionManager::new(
            enclave,
            encrypted.clone(),
            raw.clone(),
            Arc::new(StorePrivacyValidator::new(encrypted.clone())),
            publisher.clone(),
            PayloadCodec::Bincode,
        ));
        Self {
            manager,
            encrypted,
            raw,
            publisher,
        }
    }

    pub async fn stored(&self, hash: &MessageHash) -> Option<EncodedPayload> {
        self.encrypted
            .retrieve_by_hash(hash)
            .await
            .unwrap()
            .map(|record| record.payload().unwrap())
    }
}

/// How a scripted peer answers.
#[derive(Clone)]
pub enum PeerBehaviour {
    /// Answers validation challenges with the given enclave.
    Honest(Arc<dyn Enclave>),
    /// Answers every challenge with the same wrong bytes.
    WrongAnswer,
    /// Every request fails at the transport level.
    Unreachable,
    /// Honest, but only after the delay.
    Slow(Duration, Arc<dyn Enclave>),
}

#[derive(Default)]
pub struct ScriptedPeerClient {
    peers: Mutex<HashMap<String, PeerBehaviour>>,
    party_infos: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<(String, String)>>,
}

impl ScriptedPeerClient {
    pub fn with_peer(self, url: &str, behaviour: PeerBehaviour) -> Self {
        self.peers
            .lock()
            .unwrap()
            .insert(url.trim_end_matches('/').to_string(), behaviour);
        self
    }

    /// Reply to `POST /partyinfo` on `url` with `reply`.
    pub fn with_party_info(self, url: &str, reply: Vec<u8>) -> Self {
        self.party_infos
            .lock()
            .unwrap()
            .insert(url.trim_end_matches('/').to_string(), reply);
        self
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }

    fn answer(enclave: Arc<dyn Enclave>, url: &str, body: &[u8]) -> Result<Vec<u8>, TransportError> {
        let responder = PeerDiscoveryValidator::new(
            enclave,
            Arc::new(ScriptedPeerClient::default()),
            Arc::new(PartyInfoService::new(url, Vec::<PublicKey>::new(), Vec::new())),
            PayloadCodec::Bincode,
            Duration::from_secs(1),
            1,
        );
        responder
            .answer_challenge(body)
            .map_err(|e| TransportError::Status {
                url: format!("{} ({})", url, e),
                status: 400,
            })
    }
}

#[async_trait::async_trait]
impl PeerClient for ScriptedPeerClient {
    async fn post(
        &self,
        base_url: &str,
        path: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        let url = base_url.trim_end_matches('/').to_string();
        self.requests
            .lock()
            .unwrap()
            .push((url.clone(), path.to_string()));

        if path == "partyinfo" {
            let reply = self.party_infos.lock().unwrap().get(&url).cloned();
            return reply.ok_or_else(|| TransportError::Request {
                url,
                reason: "connection refused".to_string(),
            });
        }

        let behaviour = self.peers.lock().unwrap().get(&url).cloned();
        match (behaviour, path) {
            (Some(PeerBehaviour::Honest(enclave)), VALIDATE_PATH) => {
                Self::answer(enclave, &url, &body)
            }
            (Some(PeerBehaviour::Slow(delay, enclave)), VALIDATE_PATH) => {
                tokio::time::sleep(delay).await;
                Self::answer(enclave, &url, &body)
            }
            (Some(PeerBehaviour::WrongAnswer), VALIDATE_PATH) => Ok(vec![b'0'; 64]),
            _ => Err(TransportError::Request {
                url,
                reason: "connection refused".to_string(),
            }),
        }
    }
}
