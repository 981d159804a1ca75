//! Key custody and payload sealing.
//!
//! A payload is encrypted once under a random master key. The master key is
//! then sealed separately for every recipient with a key derived from an
//! X25519 agreement between the sender and that recipient. Because the
//! agreement is symmetric, either side can open the same box: the sender
//! with its own secret, a recipient with theirs.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce as AesNonce};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::error::EnclaveError;
use crate::payload::{AffectedTransaction, EncodedPayload, PrivacyMetadata, RawTransaction};
use crate::types::{Nonce, PublicKey, RecipientBox, SecurityHash, TxHash};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LENGTH: usize = 12;
const BOX_CONTEXT: &[u8] = b"privtx/recipient-box/v1";
const KEY_FILE_VERSION: u32 = 1;

/// Cryptographic boundary of the node.
pub trait Enclave: Send + Sync {
    fn default_public_key(&self) -> PublicKey;

    fn managed_keys(&self) -> BTreeSet<PublicKey>;

    /// Keys that every standard transaction is additionally sent to.
    fn forwarding_keys(&self) -> BTreeSet<PublicKey>;

    fn encrypt_payload(
        &self,
        message: &[u8],
        sender: &PublicKey,
        recipients: &[PublicKey],
        metadata: &PrivacyMetadata,
    ) -> Result<EncodedPayload, EnclaveError>;

    /// Seal an already encrypted raw transaction for a recipient list.
    fn encrypt_raw_payload(
        &self,
        raw: &RawTransaction,
        recipients: &[PublicKey],
        metadata: &PrivacyMetadata,
    ) -> Result<EncodedPayload, EnclaveError>;

    fn encrypt_raw(&self, message: &[u8], sender: &PublicKey)
        -> Result<RawTransaction, EnclaveError>;

    /// Fails if `key` cannot open its box in `payload`.
    fn decrypt(&self, payload: &EncodedPayload, key: &PublicKey) -> Result<Vec<u8>, EnclaveError>;

    fn decrypt_raw(&self, raw: &RawTransaction) -> Result<Vec<u8>, EnclaveError>;

    /// Affected transactions whose security hash, as claimed by `payload`,
    /// does not match the one derived locally from the recipients both
    /// transactions share.
    fn find_invalid_security_hashes(
        &self,
        payload: &EncodedPayload,
        affected: &[AffectedTransaction],
    ) -> BTreeSet<TxHash> {
        let recipients: BTreeSet<PublicKey> = payload.recipient_keys().iter().copied().collect();

        affected
            .iter()
            .filter(|tx| {
                let shared: BTreeSet<PublicKey> = tx
                    .payload
                    .recipient_keys()
                    .iter()
                    .filter(|k| recipients.contains(k))
                    .copied()
                    .collect();
                let expected = SecurityHash::derive(&shared, tx.payload.cipher_text());
                payload.affected_contract_transactions().get(&tx.hash) != Some(&expected)
            })
            .map(|tx| tx.hash.clone())
            .collect()
    }
}

/// Enclave holding its key pairs in process memory.
pub struct LocalEnclave {
    keys: BTreeMap<PublicKey, StaticSecret>,
    default_key: PublicKey,
    forwarding_keys: BTreeSet<PublicKey>,
}

impl LocalEnclave {
    /// Generate `count` fresh key pairs. The first becomes the default key.
    pub fn generate(count: usize) -> Result<Self, EnclaveError> {
        let secrets = (0..count.max(1))
            .map(|_| StaticSecret::random_from_rng(OsRng))
            .collect();
        Self::from_secrets(secrets)
    }

    pub fn from_secrets(secrets: Vec<StaticSecret>) -> Result<Self, EnclaveError> {
        let mut keys = BTreeMap::new();
        let mut default_key = None;
        for secret in secrets {
            let public = PublicKey::from_bytes(X25519Public::from(&secret).to_bytes());
            default_key.get_or_insert(public);
            keys.insert(public, secret);
        }
        let default_key =
            default_key.ok_or_else(|| EnclaveError::KeyFile("no keys configured".to_string()))?;

        Ok(Self {
            keys,
            default_key,
            forwarding_keys: BTreeSet::new(),
        })
    }

    pub fn with_forwarding_keys(mut self, keys: BTreeSet<PublicKey>) -> Self {
        self.forwarding_keys = keys;
        self
    }

    /// Load the key file at `path`, creating it with one fresh key if missing.
    pub fn load_or_generate<P: AsRef<Path>>(
        path: P,
        password: Option<&str>,
    ) -> Result<Self, EnclaveError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path, password);
        }

        let enclave = Self::generate(1)?;
        enclave.save(path, password)?;
        tracing::info!(
            "🔑 Generated new key {} at {}",
            enclave.default_key,
            path.display()
        );
        Ok(enclave)
    }

    pub fn load<P: AsRef<Path>>(path: P, password: Option<&str>) -> Result<Self, EnclaveError> {
        let contents = fs::read(path.as_ref())?;
        let file: KeyFile = serde_json::from_slice(&contents)
            .map_err(|e| EnclaveError::KeyFile(format!("Failed to parse key file: {}", e)))?;

        if file.version != KEY_FILE_VERSION {
            return Err(EnclaveError::KeyFile(format!(
                "Unsupported key file version {}",
                file.version
            )));
        }

        let mut secrets = Vec::with_capacity(file.keys.len());
        for stored in &file.keys {
            let secret = stored.unlock(password)?;
            let public = PublicKey::from_bytes(X25519Public::from(&secret).to_bytes());
            if public.to_base64() != stored.public_key {
                return Err(EnclaveError::KeyFile(format!(
                    "Public key {} does not match its secret",
                    stored.public_key
                )));
            }
            secrets.push(secret);
        }

        Self::from_secrets(secrets)
    }

    /// Write all key pairs to `path`, sealing secrets when a password is given.
    pub fn save<P: AsRef<Path>>(&self, path: P, password: Option<&str>) -> Result<(), EnclaveError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Default key first so it stays the default after a reload
        let mut ordered = vec![self.default_key];
        ordered.extend(self.keys.keys().filter(|k| **k != self.default_key));

        let mut keys = Vec::with_capacity(ordered.len());
        for public in ordered {
            let secret = self
                .keys
                .get(&public)
                .ok_or_else(|| EnclaveError::KeyNotManaged(public.to_base64()))?;
            keys.push(StoredKey::seal(public, secret, password)?);
        }

        let contents = serde_json::to_vec_pretty(&KeyFile {
            version: KEY_FILE_VERSION,
            keys,
        })
        .map_err(|e| EnclaveError::KeyFile(format!("Failed to serialize: {}", e)))?;

        // Write atomically
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &contents)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    fn secret(&self, key: &PublicKey) -> Result<&StaticSecret, EnclaveError> {
        self.keys
            .get(key)
            .ok_or_else(|| EnclaveError::KeyNotManaged(key.to_base64()))
    }

    /// Key sealing the master key between `local` and `other`.
    fn box_key(
        &self,
        local: &PublicKey,
        other: &PublicKey,
    ) -> Result<Zeroizing<[u8; 32]>, EnclaveError> {
        let secret = self.secret(local)?;
        let shared = secret.diffie_hellman(&X25519Public::from(*other.as_bytes()));

        let mut mac = <HmacSha256 as Mac>::new_from_slice(shared.as_bytes())
            .map_err(|_| EnclaveError::EncryptionFailed)?;
        mac.update(BOX_CONTEXT);

        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&mac.finalize().into_bytes());
        Ok(key)
    }

    /// Pick the side of the agreement this enclave holds a secret for.
    fn open_box_key(
        &self,
        sender: &PublicKey,
        recipient: &PublicKey,
    ) -> Result<Zeroizing<[u8; 32]>, EnclaveError> {
        if self.keys.contains_key(recipient) {
            self.box_key(recipient, sender)
        } else if self.keys.contains_key(sender) {
            self.box_key(sender, recipient)
        } else {
            Err(EnclaveError::KeyNotManaged(recipient.to_base64()))
        }
    }

    fn seal_for_recipients(
        &self,
        sender: &PublicKey,
        recipients: &[PublicKey],
        master_key: &[u8; 32],
        recipient_nonce: &[u8; NONCE_LENGTH],
    ) -> Result<Vec<RecipientBox>, EnclaveError> {
        recipients
            .iter()
            .map(|recipient| {
                let key = self.box_key(sender, recipient)?;
                seal(&key, recipient_nonce, master_key).map(RecipientBox::from_bytes)
            })
            .collect()
    }

    fn open_raw_master_key(&self, raw: &RawTransaction) -> Result<Zeroizing<[u8; 32]>, EnclaveError> {
        let key = self.box_key(&raw.from, &raw.from)?;
        let opened = Zeroizing::new(open(&key, raw.nonce.as_bytes(), &raw.encrypted_key)?);
        to_master_key(&opened)
    }
}

impl Enclave for LocalEnclave {
    fn default_public_key(&self) -> PublicKey {
        self.default_key
    }

    fn managed_keys(&self) -> BTreeSet<PublicKey> {
        self.keys.keys().copied().collect()
    }

    fn forwarding_keys(&self) -> BTreeSet<PublicKey> {
        self.forwarding_keys.clone()
    }

    fn encrypt_payload(
        &self,
        message: &[u8],
        sender: &PublicKey,
        recipients: &[PublicKey],
        metadata: &PrivacyMetadata,
    ) -> Result<EncodedPayload, EnclaveError> {
        let master_key = random_key();
        let nonce = random_nonce();
        let recipient_nonce = random_nonce();

        let cipher_text = seal(&master_key, &nonce, message)?;
        let boxes = self.seal_for_recipients(sender, recipients, &master_key, &recipient_nonce)?;

        Ok(EncodedPayload::builder()
            .sender_key(*sender)
            .cipher_text(cipher_text)
            .cipher_text_nonce(Nonce::from_bytes(nonce.to_vec()))
            .recipient_boxes(boxes)
            .recipient_nonce(Nonce::from_bytes(recipient_nonce.to_vec()))
            .recipient_keys(recipients.to_vec())
            .privacy_metadata(metadata)
            .build()?)
    }

    fn encrypt_raw_payload(
        &self,
        raw: &RawTransaction,
        recipients: &[PublicKey],
        metadata: &PrivacyMetadata,
    ) -> Result<EncodedPayload, EnclaveError> {
        let master_key = self.open_raw_master_key(raw)?;
        let recipient_nonce = random_nonce();
        let boxes = self.seal_for_recipients(&raw.from, recipients, &master_key, &recipient_nonce)?;

        Ok(EncodedPayload::builder()
            .sender_key(raw.from)
            .cipher_text(raw.encrypted_payload.clone())
            .cipher_text_nonce(raw.nonce.clone())
            .recipient_boxes(boxes)
            .recipient_nonce(Nonce::from_bytes(recipient_nonce.to_vec()))
            .recipient_keys(recipients.to_vec())
            .privacy_metadata(metadata)
            .build()?)
    }

    fn encrypt_raw(
        &self,
        message: &[u8],
        sender: &PublicKey,
    ) -> Result<RawTransaction, EnclaveError> {
        let master_key = random_key();
        let nonce = random_nonce();

        // Payload and key are sealed under different keys, so one nonce serves both
        let encrypted_payload = seal(&master_key, &nonce, message)?;
        let sender_key = self.box_key(sender, sender)?;
        let encrypted_key = seal(&sender_key, &nonce, master_key.as_slice())?;

        Ok(RawTransaction {
            encrypted_payload,
            encrypted_key,
            nonce: Nonce::from_bytes(nonce.to_vec()),
            from: *sender,
        })
    }

    fn decrypt(&self, payload: &EncodedPayload, key: &PublicKey) -> Result<Vec<u8>, EnclaveError> {
        let index = if payload.is_legacy() {
            0
        } else {
            payload
                .recipient_keys()
                .iter()
                .position(|k| k == key)
                .ok_or_else(|| EnclaveError::MissingRecipientBox(key.to_base64()))?
        };
        let sealed = payload
            .recipient_boxes()
            .get(index)
            .ok_or_else(|| EnclaveError::MissingRecipientBox(key.to_base64()))?;

        let box_key = self.open_box_key(payload.sender_key(), key)?;
        let opened = Zeroizing::new(open(
            &box_key,
            payload.recipient_nonce().as_bytes(),
            sealed.as_bytes(),
        )?);
        let master_key = to_master_key(&opened)?;

        open(
            &master_key,
            payload.cipher_text_nonce().as_bytes(),
            payload.cipher_text(),
        )
    }

    fn decrypt_raw(&self, raw: &RawTransaction) -> Result<Vec<u8>, EnclaveError> {
        let master_key = self.open_raw_master_key(raw)?;
        open(&master_key, raw.nonce.as_bytes(), &raw.encrypted_payload)
    }
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    keys: Vec<StoredKey>,
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    public_key: String,
    /// Base64 secret, sealed under the password key when `lock` is present.
    secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lock: Option<KeyLock>,
}

#[derive(Serialize, Deserialize)]
struct KeyLock {
    salt: String,
    nonce: String,
}

impl StoredKey {
    fn seal(
        public: PublicKey,
        secret: &StaticSecret,
        password: Option<&str>,
    ) -> Result<Self, EnclaveError> {
        let secret_bytes = Zeroizing::new(secret.to_bytes());

        let (secret, lock) = match password {
            None => (BASE64.encode(secret_bytes.as_slice()), None),
            Some(password) => {
                let mut salt = [0u8; 16];
                OsRng.fill_bytes(&mut salt);
                let nonce = random_nonce();
                let key = password_key(password, &salt)?;
                let sealed = seal(&key, &nonce, secret_bytes.as_slice())?;
                (
                    BASE64.encode(sealed),
                    Some(KeyLock {
                        salt: BASE64.encode(salt),
                        nonce: BASE64.encode(nonce),
                    }),
                )
            }
        };

        Ok(Self {
            public_key: public.to_base64(),
            secret,
            lock,
        })
    }

    fn unlock(&self, password: Option<&str>) -> Result<StaticSecret, EnclaveError> {
        let stored = BASE64
            .decode(&self.secret)
            .map_err(|e| EnclaveError::KeyFile(format!("Bad secret encoding: {}", e)))?;

        let plain = match (&self.lock, password) {
            (None, _) => Zeroizing::new(stored),
            (Some(_), None) => {
                return Err(EnclaveError::KeyFile(format!(
                    "Key {} is locked and no password was supplied",
                    self.public_key
                )))
            }
            (Some(lock), Some(password)) => {
                let salt = BASE64
                    .decode(&lock.salt)
                    .map_err(|e| EnclaveError::KeyFile(format!("Bad salt encoding: {}", e)))?;
                let nonce = BASE64
                    .decode(&lock.nonce)
                    .map_err(|e| EnclaveError::KeyFile(format!("Bad nonce encoding: {}", e)))?;
                let key = password_key(password, &salt)?;
                Zeroizing::new(open(&key, &nonce, &stored).map_err(|_| {
                    EnclaveError::KeyFile(format!("Wrong password for key {}", self.public_key))
                })?)
            }
        };

        let bytes: [u8; 32] = plain.as_slice().try_into().map_err(|_| {
            EnclaveError::KeyFile(format!("Secret for {} has wrong length", self.public_key))
        })?;
        Ok(StaticSecret::from(bytes))
    }
}

fn password_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, EnclaveError> {
    let mut output = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, output.as_mut_slice())
        .map_err(|e| EnclaveError::KeyFile(format!("Key derivation failed: {}", e)))?;
    Ok(output)
}

fn random_key() -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(key.as_mut_slice());
    key
}

fn random_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn to_master_key(bytes: &[u8]) -> Result<Zeroizing<[u8; 32]>, EnclaveError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| EnclaveError::DecryptionFailed)?;
    Ok(Zeroizing::new(array))
}

fn seal(key: &[u8; 32], nonce: &[u8; NONCE_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>, EnclaveError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EnclaveError::EncryptionFailed)?;
    cipher
        .encrypt(AesNonce::from_slice(nonce), plaintext)
        .map_err(|_| EnclaveError::EncryptionFailed)
}

fn open(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, EnclaveError> {
    if nonce.len() != NONCE_LENGTH {
        return Err(EnclaveError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EnclaveError::DecryptionFailed)?;
    cipher
        .decrypt(AesNonce::from_slice(nonce), ciphertext)
        .map_err(|_| EnclaveError::DecryptionFailed)
}
