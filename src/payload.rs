//! Payload and persisted-record types.
//!
//! `EncodedPayload` is immutable once built. Every construction path goes
//! through `EncodedPayloadBuilder::build`, which rejects structurally invalid
//! payloads up front, so code holding an `EncodedPayload` can rely on:
//!
//! - `recipient_boxes[i]` belongs to `recipient_keys[i]` whenever keys are present
//! - mandatory recipients are a subset of the recipient keys (and empty
//!   outside `MandatoryRecipients`)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::codec::PayloadCodec;
use crate::error::{CodecError, PayloadError};
use crate::types::{
    MessageHash, Nonce, PrivacyGroupId, PrivacyMode, PublicKey, RecipientBox, SecurityHash,
    TxHash,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedPayload {
    sender_key: PublicKey,
    cipher_text: Vec<u8>,
    cipher_text_nonce: Nonce,
    recipient_boxes: Vec<RecipientBox>,
    recipient_nonce: Nonce,
    recipient_keys: Vec<PublicKey>,
    privacy_mode: PrivacyMode,
    affected_contract_transactions: BTreeMap<TxHash, SecurityHash>,
    exec_hash: Vec<u8>,
    mandatory_recipients: BTreeSet<PublicKey>,
    privacy_group_id: Option<PrivacyGroupId>,
}

impl EncodedPayload {
    pub fn builder() -> EncodedPayloadBuilder {
        EncodedPayloadBuilder::default()
    }

    pub fn sender_key(&self) -> &PublicKey {
        &self.sender_key
    }

    pub fn cipher_text(&self) -> &[u8] {
        &self.cipher_text
    }

    pub fn cipher_text_nonce(&self) -> &Nonce {
        &self.cipher_text_nonce
    }

    pub fn recipient_boxes(&self) -> &[RecipientBox] {
        &self.recipient_boxes
    }

    pub fn recipient_nonce(&self) -> &Nonce {
        &self.recipient_nonce
    }

    /// May be empty for payloads received from nodes that do not disclose keys.
    pub fn recipient_keys(&self) -> &[PublicKey] {
        &self.recipient_keys
    }

    pub fn privacy_mode(&self) -> PrivacyMode {
        self.privacy_mode
    }

    pub fn affected_contract_transactions(&self) -> &BTreeMap<TxHash, SecurityHash> {
        &self.affected_contract_transactions
    }

    pub fn exec_hash(&self) -> &[u8] {
        &self.exec_hash
    }

    pub fn mandatory_recipients(&self) -> &BTreeSet<PublicKey> {
        &self.mandatory_recipients
    }

    pub fn privacy_group_id(&self) -> Option<&PrivacyGroupId> {
        self.privacy_group_id.as_ref()
    }

    pub fn message_hash(&self) -> MessageHash {
        MessageHash::of(&self.cipher_text)
    }

    pub fn is_legacy(&self) -> bool {
        self.recipient_keys.is_empty()
    }

    /// Box sealed for `key`, if both the key and its box are present.
    pub fn recipient_box_for(&self, key: &PublicKey) -> Option<&RecipientBox> {
        self.recipient_keys
            .iter()
            .position(|k| k == key)
            .and_then(|index| self.recipient_boxes.get(index))
    }

    /// Re-checks the builder rules. Used after deserialization, which bypasses
    /// the builder.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if !self.recipient_keys.is_empty() && self.recipient_boxes.len() > self.recipient_keys.len()
        {
            return Err(PayloadError::BoxKeyMismatch {
                boxes: self.recipient_boxes.len(),
                keys: self.recipient_keys.len(),
            });
        }

        if self.privacy_mode == PrivacyMode::MandatoryRecipients {
            let keys: BTreeSet<&PublicKey> = self.recipient_keys.iter().collect();
            if !self.mandatory_recipients.iter().all(|m| keys.contains(m)) {
                return Err(PayloadError::MandatoryNotRecipient);
            }
        } else if !self.mandatory_recipients.is_empty() {
            return Err(PayloadError::UnexpectedMandatoryRecipients);
        }

        Ok(())
    }

    /// Copy of this payload carrying only `recipient`'s box.
    ///
    /// Standard transactions disclose only the recipient's own key. Every other
    /// mode keeps the full key list with `recipient` moved to the front, since
    /// receivers recompute security hashes and mandatory-recipient checks from
    /// it. Returns `None` if `recipient` has no box in this payload.
    pub fn for_recipient(&self, recipient: &PublicKey) -> Option<EncodedPayload> {
        let recipient_box = self.recipient_box_for(recipient)?.clone();

        let recipient_keys = if self.privacy_mode == PrivacyMode::StandardPrivate {
            vec![*recipient]
        } else {
            std::iter::once(*recipient)
                .chain(self.recipient_keys.iter().copied().filter(|k| k != recipient))
                .collect()
        };

        Some(EncodedPayload {
            recipient_boxes: vec![recipient_box],
            recipient_keys,
            ..self.clone()
        })
    }

    /// Copy of a legacy payload reduced to the box at `index`.
    pub(crate) fn with_single_box(&self, index: usize) -> Option<EncodedPayload> {
        let recipient_box = self.recipient_boxes.get(index)?.clone();
        Some(EncodedPayload {
            recipient_boxes: vec![recipient_box],
            ..self.clone()
        })
    }

    /// Copy without the given affected-transaction entries.
    pub(crate) fn without_affected(&self, remove: &BTreeSet<TxHash>) -> EncodedPayload {
        let affected_contract_transactions = self
            .affected_contract_transactions
            .iter()
            .filter(|(hash, _)| !remove.contains(*hash))
            .map(|(hash, security)| (hash.clone(), security.clone()))
            .collect();

        EncodedPayload {
            affected_contract_transactions,
            ..self.clone()
        }
    }

    /// Merge `incoming`'s recipient boxes into this payload.
    ///
    /// Only boxes for keys not already boxed here are added, everything else is
    /// kept from `self`. Legacy payloads (no keys) collect byte-distinct boxes.
    /// Returns `Ok(None)` when `incoming` adds nothing. The caller is
    /// responsible for checking that both payloads share a ciphertext.
    pub fn merge_recipient_boxes(
        &self,
        incoming: &EncodedPayload,
    ) -> Result<Option<EncodedPayload>, PayloadError> {
        if self.is_legacy() {
            let mut boxes = self.recipient_boxes.clone();
            for candidate in &incoming.recipient_boxes {
                if !boxes.contains(candidate) {
                    boxes.push(candidate.clone());
                }
            }
            if boxes.len() == self.recipient_boxes.len() {
                return Ok(None);
            }
            return EncodedPayloadBuilder::from_payload(self)
                .recipient_boxes(boxes)
                .build()
                .map(Some);
        }

        // Keyless boxes cannot be attributed to a key.
        if incoming.is_legacy() {
            return Ok(None);
        }

        let mut keys: Vec<PublicKey> = Vec::new();
        let mut boxes: Vec<RecipientBox> = Vec::new();
        for (key, sealed) in self.recipient_keys.iter().zip(&self.recipient_boxes) {
            keys.push(*key);
            boxes.push(sealed.clone());
        }
        for (key, sealed) in incoming.recipient_keys.iter().zip(&incoming.recipient_boxes) {
            if !keys.contains(key) {
                keys.push(*key);
                boxes.push(sealed.clone());
            }
        }

        if boxes.len() == self.recipient_boxes.len() {
            return Ok(None);
        }

        // Unboxed keys trail the boxed ones.
        for key in self.recipient_keys.iter().chain(&incoming.recipient_keys) {
            if !keys.contains(key) {
                keys.push(*key);
            }
        }

        EncodedPayloadBuilder::from_payload(self)
            .recipient_keys(keys)
            .recipient_boxes(boxes)
            .build()
            .map(Some)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EncodedPayloadBuilder {
    sender_key: Option<PublicKey>,
    cipher_text: Option<Vec<u8>>,
    cipher_text_nonce: Nonce,
    recipient_boxes: Vec<RecipientBox>,
    recipient_nonce: Nonce,
    recipient_keys: Vec<PublicKey>,
    privacy_mode: PrivacyMode,
    affected_contract_transactions: BTreeMap<TxHash, SecurityHash>,
    exec_hash: Vec<u8>,
    mandatory_recipients: BTreeSet<PublicKey>,
    privacy_group_id: Option<PrivacyGroupId>,
}

impl EncodedPayloadBuilder {
    pub fn from_payload(payload: &EncodedPayload) -> Self {
        let payload = payload.clone();
        Self {
            sender_key: Some(payload.sender_key),
            cipher_text: Some(payload.cipher_text),
            cipher_text_nonce: payload.cipher_text_nonce,
            recipient_boxes: payload.recipient_boxes,
            recipient_nonce: payload.recipient_nonce,
            recipient_keys: payload.recipient_keys,
            privacy_mode: payload.privacy_mode,
            affected_contract_transactions: payload.affected_contract_transactions,
            exec_hash: payload.exec_hash,
            mandatory_recipients: payload.mandatory_recipients,
            privacy_group_id: payload.privacy_group_id,
        }
    }

    pub fn sender_key(mut self, key: PublicKey) -> Self {
        self.sender_key = Some(key);
        self
    }

    pub fn cipher_text(mut self, cipher_text: impl Into<Vec<u8>>) -> Self {
        self.cipher_text = Some(cipher_text.into());
        self
    }

    pub fn cipher_text_nonce(mut self, nonce: Nonce) -> Self {
        self.cipher_text_nonce = nonce;
        self
    }

    pub fn recipient_boxes(mut self, boxes: Vec<RecipientBox>) -> Self {
        self.recipient_boxes = boxes;
        self
    }

    pub fn recipient_box(mut self, recipient_box: RecipientBox) -> Self {
        self.recipient_boxes.push(recipient_box);
        self
    }

    pub fn recipient_nonce(mut self, nonce: Nonce) -> Self {
        self.recipient_nonce = nonce;
        self
    }

    pub fn recipient_keys(mut self, keys: Vec<PublicKey>) -> Self {
        self.recipient_keys = keys;
        self
    }

    pub fn recipient_key(mut self, key: PublicKey) -> Self {
        self.recipient_keys.push(key);
        self
    }

    pub fn privacy_mode(mut self, mode: PrivacyMode) -> Self {
        self.privacy_mode = mode;
        self
    }

    pub fn affected_contract_transactions(
        mut self,
        affected: BTreeMap<TxHash, SecurityHash>,
    ) -> Self {
        self.affected_contract_transactions = affected;
        self
    }

    pub fn exec_hash(mut self, exec_hash: impl Into<Vec<u8>>) -> Self {
        self.exec_hash = exec_hash.into();
        self
    }

    pub fn mandatory_recipients(mut self, mandatory: BTreeSet<PublicKey>) -> Self {
        self.mandatory_recipients = mandatory;
        self
    }

    pub fn privacy_group_id(mut self, group: Option<PrivacyGroupId>) -> Self {
        self.privacy_group_id = group;
        self
    }

    /// Apply every field of `metadata` at once.
    pub fn privacy_metadata(self, metadata: &PrivacyMetadata) -> Self {
        self.privacy_mode(metadata.privacy_mode())
            .affected_contract_transactions(metadata.affected_transactions().clone())
            .exec_hash(metadata.exec_hash().to_vec())
            .mandatory_recipients(metadata.mandatory_recipients().clone())
            .privacy_group_id(metadata.privacy_group_id().cloned())
    }

    pub fn build(self) -> Result<EncodedPayload, PayloadError> {
        let payload = EncodedPayload {
            sender_key: self.sender_key.ok_or(PayloadError::MissingField("sender_key"))?,
            cipher_text: self.cipher_text.ok_or(PayloadError::MissingField("cipher_text"))?,
            cipher_text_nonce: self.cipher_text_nonce,
            recipient_boxes: self.recipient_boxes,
            recipient_nonce: self.recipient_nonce,
            recipient_keys: self.recipient_keys,
            privacy_mode: self.privacy_mode,
            affected_contract_transactions: self.affected_contract_transactions,
            exec_hash: self.exec_hash,
            mandatory_recipients: self.mandatory_recipients,
            privacy_group_id: self.privacy_group_id,
        };
        payload.validate()?;
        Ok(payload)
    }
}

/// Privacy settings handed to the enclave alongside a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivacyMetadata {
    privacy_mode: PrivacyMode,
    affected_transactions: BTreeMap<TxHash, SecurityHash>,
    exec_hash: Vec<u8>,
    mandatory_recipients: BTreeSet<PublicKey>,
    privacy_group_id: Option<PrivacyGroupId>,
}

impl PrivacyMetadata {
    pub fn builder() -> PrivacyMetadataBuilder {
        PrivacyMetadataBuilder::default()
    }

    pub fn standard() -> Self {
        Self {
            privacy_mode: PrivacyMode::StandardPrivate,
            affected_transactions: BTreeMap::new(),
            exec_hash: Vec::new(),
            mandatory_recipients: BTreeSet::new(),
            privacy_group_id: None,
        }
    }

    pub fn privacy_mode(&self) -> PrivacyMode {
        self.privacy_mode
    }

    pub fn affected_transactions(&self) -> &BTreeMap<TxHash, SecurityHash> {
        &self.affected_transactions
    }

    pub fn exec_hash(&self) -> &[u8] {
        &self.exec_hash
    }

    pub fn mandatory_recipients(&self) -> &BTreeSet<PublicKey> {
        &self.mandatory_recipients
    }

    pub fn privacy_group_id(&self) -> Option<&PrivacyGroupId> {
        self.privacy_group_id.as_ref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrivacyMetadataBuilder {
    privacy_mode: PrivacyMode,
    affected_transactions: BTreeMap<TxHash, SecurityHash>,
    exec_hash: Vec<u8>,
    mandatory_recipients: BTreeSet<PublicKey>,
    privacy_group_id: Option<PrivacyGroupId>,
}

impl PrivacyMetadataBuilder {
    pub fn privacy_mode(mut self, mode: PrivacyMode) -> Self {
        self.privacy_mode = mode;
        self
    }

    pub fn affected_transactions(mut self, affected: BTreeMap<TxHash, SecurityHash>) -> Self {
        self.affected_transactions = affected;
        self
    }

    pub fn exec_hash(mut self, exec_hash: impl Into<Vec<u8>>) -> Self {
        self.exec_hash = exec_hash.into();
        self
    }

    pub fn mandatory_recipients(mut self, mandatory: BTreeSet<PublicKey>) -> Self {
        self.mandatory_recipients = mandatory;
        self
    }

    pub fn privacy_group_id(mut self, group: Option<PrivacyGroupId>) -> Self {
        self.privacy_group_id = group;
        self
    }

    pub fn build(self) -> Result<PrivacyMetadata, PayloadError> {
        if self.privacy_mode == PrivacyMode::PrivateStateValidation && self.exec_hash.is_empty() {
            return Err(PayloadError::MissingExecHash);
        }
        Ok(PrivacyMetadata {
            privacy_mode: self.privacy_mode,
            affected_transactions: self.affected_transactions,
            exec_hash: self.exec_hash,
            mandatory_recipients: self.mandatory_recipients,
            privacy_group_id: self.privacy_group_id,
        })
    }
}

/// Payload encrypted to its sender alone, awaiting a later signed send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub encrypted_payload: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub nonce: Nonce,
    pub from: PublicKey,
}

/// Stored encoded payload. The bytes stay in the codec they arrived in;
/// `codec` records which one so old records remain readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedTransaction {
    pub hash: MessageHash,
    pub encoded_payload: Vec<u8>,
    pub codec: PayloadCodec,
}

impl EncryptedTransaction {
    pub fn new(payload: &EncodedPayload, codec: PayloadCodec) -> Result<Self, CodecError> {
        Ok(Self {
            hash: payload.message_hash(),
            encoded_payload: codec.encode(payload)?,
            codec,
        })
    }

    pub fn payload(&self) -> Result<EncodedPayload, CodecError> {
        self.codec.decode(&self.encoded_payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRawTransaction {
    pub hash: MessageHash,
    pub encrypted_payload: Vec<u8>,
    pub encrypted_key: Vec<u8>,
    pub nonce: Nonce,
    pub sender: PublicKey,
}

impl EncryptedRawTransaction {
    pub fn from_raw(raw: RawTransaction) -> Self {
        Self {
            hash: MessageHash::of(&raw.encrypted_payload),
            encrypted_payload: raw.encrypted_payload,
            encrypted_key: raw.encrypted_key,
            nonce: raw.nonce,
            sender: raw.from,
        }
    }

    pub fn to_raw_transaction(&self) -> RawTransaction {
        RawTransaction {
            encrypted_payload: self.encrypted_payload.clone(),
            encrypted_key: self.encrypted_key.clone(),
            nonce: self.nonce.clone(),
            from: self.sender,
        }
    }
}

/// A stored transaction referenced by another one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffectedTransaction {
    pub hash: TxHash,
    pub payload: EncodedPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> PublicKey {
        PublicKey::from_bytes([n; 32])
    }

    fn sealed(n: u8) -> RecipientBox {
        RecipientBox::from_bytes(vec![n; 8])
    }

    fn payload(keys: Vec<PublicKey>, boxes: Vec<RecipientBox>) -> EncodedPayload {
        EncodedPayload::builder()
            .sender_key(key(1))
            .cipher_text(b"CIPHERTEXT".to_vec())
            .recipient_keys(keys)
            .recipient_boxes(boxes)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_sender_and_cipher_text() {
        let missing_sender = EncodedPayload::builder().cipher_text(b"x".to_vec()).build();
        assert_eq!(
            missing_sender.unwrap_err(),
            PayloadError::MissingField("sender_key")
        );

        let missing_cipher = EncodedPayload::builder().sender_key(key(1)).build();
        assert_eq!(
            missing_cipher.unwrap_err(),
            PayloadError::MissingField("cipher_text")
        );
    }

    #[test]
    fn test_builder_rejects_more_boxes_than_keys() {
        let result = EncodedPayload::builder()
            .sender_key(key(1))
            .cipher_text(b"x".to_vec())
            .recipient_keys(vec![key(2)])
            .recipient_boxes(vec![sealed(2), sealed(3)])
            .build();
        assert_eq!(
            result.unwrap_err(),
            PayloadError::BoxKeyMismatch { boxes: 2, keys: 1 }
        );
    }

    #[test]
    fn test_builder_enforces_mandatory_subset() {
        let result = EncodedPayload::builder()
            .sender_key(key(1))
            .cipher_text(b"x".to_vec())
            .privacy_mode(PrivacyMode::MandatoryRecipients)
            .recipient_keys(vec![key(2)])
            .mandatory_recipients([key(3)].into_iter().collect())
            .build();
        assert_eq!(result.unwrap_err(), PayloadError::MandatoryNotRecipient);

        let result = EncodedPayload::builder()
            .sender_key(key(1))
            .cipher_text(b"x".to_vec())
            .privacy_mode(PrivacyMode::PartyProtection)
            .recipient_keys(vec![key(2)])
            .mandatory_recipients([key(2)].into_iter().collect())
            .build();
        assert_eq!(
            result.unwrap_err(),
            PayloadError::UnexpectedMandatoryRecipients
        );
    }

    #[test]
    fn test_metadata_requires_exec_hash_for_psv() {
        let result = PrivacyMetadata::builder()
            .privacy_mode(PrivacyMode::PrivateStateValidation)
            .build();
        assert_eq!(result.unwrap_err(), PayloadError::MissingExecHash);

        let ok = PrivacyMetadata::builder()
            .privacy_mode(PrivacyMode::PrivateStateValidation)
            .exec_hash(b"exec".to_vec())
            .build()
            .unwrap();
        assert_eq!(ok.exec_hash(), b"exec");
    }

    #[test]
    fn test_merge_adds_only_new_keys() {
        let existing = payload(vec![key(2)], vec![sealed(2)]);
        let incoming = payload(vec![key(3), key(2)], vec![sealed(3), sealed(9)]);

        let merged = existing.merge_recipient_boxes(&incoming).unwrap().unwrap();
        assert_eq!(merged.recipient_keys(), &[key(2), key(3)]);
        // key(2) keeps its original box
        assert_eq!(merged.recipient_boxes(), &[sealed(2), sealed(3)]);
    }

    #[test]
    fn test_merge_returns_none_when_nothing_new() {
        let existing = payload(vec![key(2), key(3)], vec![sealed(2), sealed(3)]);
        let incoming = payload(vec![key(3)], vec![sealed(3)]);
        assert!(existing.merge_recipient_boxes(&incoming).unwrap().is_none());
    }

    #[test]
    fn test_merge_legacy_appends_distinct_boxes() {
        let existing = payload(vec![], vec![sealed(2)]);
        let incoming = payload(vec![], vec![sealed(2), sealed(3)]);

        let merged = existing.merge_recipient_boxes(&incoming).unwrap().unwrap();
        assert!(merged.recipient_keys().is_empty());
        assert_eq!(merged.recipient_boxes(), &[sealed(2), sealed(3)]);
    }

    #[test]
    fn test_merge_keeps_unboxed_keys_after_boxed() {
        let existing = EncodedPayload::builder()
            .sender_key(key(1))
            .cipher_text(b"CIPHERTEXT".to_vec())
            .privacy_mode(PrivacyMode::PrivateStateValidation)
            .recipient_keys(vec![key(2), key(3), key(4)])
            .recipient_boxes(vec![sealed(2)])
            .build()
            .unwrap();
        let incoming = EncodedPayloadBuilder::from_payload(&existing)
            .recipient_keys(vec![key(4), key(2), key(3)])
            .recipient_boxes(vec![sealed(4)])
            .build()
            .unwrap();

        let merged = existing.merge_recipient_boxes(&incoming).unwrap().unwrap();
        assert_eq!(merged.recipient_keys(), &[key(2), key(4), key(3)]);
        assert_eq!(merged.recipient_boxes(), &[sealed(2), sealed(4)]);
        assert_eq!(merged.recipient_box_for(&key(4)), Some(&sealed(4)));
        assert_eq!(merged.recipient_box_for(&key(3)), None);
    }

    #[test]
    fn test_for_recipient_standard_discloses_single_key() {
        let full = payload(vec![key(2), key(3)], vec![sealed(2), sealed(3)]);
        let trimmed = full.for_recipient(&key(3)).unwrap();
        assert_eq!(trimmed.recipient_keys(), &[key(3)]);
        assert_eq!(trimmed.recipient_boxes(), &[sealed(3)]);
        assert!(full.for_recipient(&key(7)).is_none());
    }

    #[test]
    fn test_for_recipient_keeps_key_list_outside_standard() {
        let full = EncodedPayload::builder()
            .sender_key(key(1))
            .cipher_text(b"CIPHERTEXT".to_vec())
            .privacy_mode(PrivacyMode::MandatoryRecipients)
            .recipient_keys(vec![key(2), key(3)])
            .recipient_boxes(vec![sealed(2), sealed(3)])
            .mandatory_recipients([key(2)].into_iter().collect())
            .build()
            .unwrap();

        let trimmed = full.for_recipient(&key(3)).unwrap();
        assert_eq!(trimmed.recipient_keys(), &[key(3), key(2)]);
        assert_eq!(trimmed.recipient_boxes(), &[sealed(3)]);
        assert!(trimmed.validate().is_ok());
    }

    #[test]
    fn test_raw_record_hash_is_digest_of_encrypted_payload() {
        let raw = RawTransaction {
            encrypted_payload: b"ENCRYPTED".to_vec(),
            encrypted_key: b"KEY".to_vec(),
            nonce: Nonce::from_bytes(vec![0; 24]),
            from: key(1),
        };
        let record = EncryptedRawTransaction::from_raw(raw.clone());
        assert_eq!(record.hash, MessageHash::of(b"ENCRYPTED"));
        assert_eq!(record.to_raw_transaction(), raw);
    }
}
