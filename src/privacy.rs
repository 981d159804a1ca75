//! Privacy-mode rules and affected-transaction consistency checks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::TransactionError;
use crate::payload::{AffectedTransaction, EncodedPayload, EncryptedTransaction};
use crate::storage::RecordStore;
use crate::types::{MessageHash, PrivacyMode, PublicKey, SecurityHash, TxHash};

#[async_trait::async_trait]
pub trait PrivacyValidator: Send + Sync {
    /// Reject a send whose privacy settings are inconsistent with its
    /// recipients or with the transactions it affects.
    fn validate_send_request(
        &self,
        mode: PrivacyMode,
        recipients: &[PublicKey],
        mandatory_recipients: &BTreeSet<PublicKey>,
        affected: &[AffectedTransaction],
    ) -> Result<(), TransactionError>;

    /// Load the referenced transactions. Unknown references are dropped.
    async fn find_affected_from_refs(
        &self,
        refs: &[MessageHash],
    ) -> Result<Vec<AffectedTransaction>, TransactionError>;

    /// Load the transactions an inbound payload claims to affect.
    async fn resolve_affected_from_payload(
        &self,
        payload: &EncodedPayload,
    ) -> Result<Vec<AffectedTransaction>, TransactionError>;

    /// Security hash of each affected transaction as seen by `recipients`.
    fn security_hashes(
        &self,
        affected: &[AffectedTransaction],
        recipients: &[PublicKey],
    ) -> BTreeMap<TxHash, SecurityHash> {
        let recipients: BTreeSet<PublicKey> = recipients.iter().copied().collect();
        affected
            .iter()
            .map(|tx| {
                let shared: BTreeSet<PublicKey> = tx
                    .payload
                    .recipient_keys()
                    .iter()
                    .filter(|k| recipients.contains(k))
                    .copied()
                    .collect();
                (
                    tx.hash.clone(),
                    SecurityHash::derive(&shared, tx.payload.cipher_text()),
                )
            })
            .collect()
    }

    async fn resolve_affected_from_refs(
        &self,
        refs: &[MessageHash],
        recipients: &[PublicKey],
    ) -> Result<BTreeMap<TxHash, SecurityHash>, TransactionError> {
        let affected = self.find_affected_from_refs(refs).await?;
        Ok(self.security_hashes(&affected, recipients))
    }

    /// Whether an inbound payload is consistent with the affected transactions
    /// this node knows. `false` means the payload should be ignored.
    fn validate_payload(
        &self,
        hash: &TxHash,
        payload: &EncodedPayload,
        affected: &[AffectedTransaction],
    ) -> bool;

    /// Strip affected-transaction entries the enclave flagged as invalid.
    fn sanitise(
        &self,
        hash: &TxHash,
        payload: &EncodedPayload,
        invalid: &BTreeSet<TxHash>,
    ) -> Result<EncodedPayload, TransactionError>;
}

/// Validator backed by the node's encrypted-transaction store.
pub struct StorePrivacyValidator {
    store: Arc<dyn RecordStore<EncryptedTransaction>>,
}

impl StorePrivacyValidator {
    pub fn new(store: Arc<dyn RecordStore<EncryptedTransaction>>) -> Self {
        Self { store }
    }

    async fn load(
        &self,
        hashes: &[MessageHash],
    ) -> Result<BTreeMap<MessageHash, EncodedPayload>, TransactionError> {
        let records = self.store.find_by_hashes(hashes).await?;
        let mut found = BTreeMap::new();
        for record in records {
            let payload = record.payload()?;
            found.insert(record.hash, payload);
        }
        Ok(found)
    }
}

#[async_trait::async_trait]
impl PrivacyValidator for StorePrivacyValidator {
    fn validate_send_request(
        &self,
        mode: PrivacyMode,
        recipients: &[PublicKey],
        mandatory_recipients: &BTreeSet<PublicKey>,
        affected: &[AffectedTransaction],
    ) -> Result<(), TransactionError> {
        if mode == PrivacyMode::MandatoryRecipients {
            if mandatory_recipients.is_empty() {
                return Err(TransactionError::Validation(
                    "Missing mandatory recipients data".to_string(),
                ));
            }
            if !mandatory_recipients.iter().all(|m| recipients.contains(m)) {
                return Err(TransactionError::Validation(
                    "One or more mandatory recipients not included in the participant list"
                        .to_string(),
                ));
            }
        } else if !mandatory_recipients.is_empty() {
            return Err(TransactionError::Validation(
                "Mandatory recipients data only applicable for MANDATORY_RECIPIENTS privacy mode"
                    .to_string(),
            ));
        }

        if affected.iter().any(|tx| tx.payload.privacy_mode() != mode) {
            return Err(TransactionError::Validation(
                "Privacy metadata mismatched with affected transactions".to_string(),
            ));
        }

        if mode == PrivacyMode::PrivateStateValidation {
            let expected: BTreeSet<&PublicKey> = recipients.iter().collect();
            for tx in affected {
                let theirs: BTreeSet<&PublicKey> = tx.payload.recipient_keys().iter().collect();
                if theirs != expected {
                    return Err(TransactionError::Validation(format!(
                        "Recipients mismatched for affected transaction {}",
                        tx.hash
                    )));
                }
            }
        }

        if mode == PrivacyMode::MandatoryRecipients {
            for tx in affected {
                if !tx.payload.mandatory_recipients().is_subset(mandatory_recipients) {
                    return Err(TransactionError::Validation(format!(
                        "Mandatory recipients of affected transaction {} not included",
                        tx.hash
                    )));
                }
            }
        }

        Ok(())
    }

    async fn find_affected_from_refs(
        &self,
        refs: &[MessageHash],
    ) -> Result<Vec<AffectedTransaction>, TransactionError> {
        let found = self.load(refs).await?;

        let mut affected = Vec::with_capacity(found.len());
        for reference in refs {
            match found.get(reference) {
                Some(payload) => affected.push(AffectedTransaction {
                    hash: TxHash::from(reference),
                    payload: payload.clone(),
                }),
                None => warn!("⚠️ Affected transaction {} not found, dropping reference", reference),
            }
        }
        Ok(affected)
    }

    async fn resolve_affected_from_payload(
        &self,
        payload: &EncodedPayload,
    ) -> Result<Vec<AffectedTransaction>, TransactionError> {
        let refs: Vec<MessageHash> = payload
            .affected_contract_transactions()
            .keys()
            .map(MessageHash::from)
            .collect();
        if refs.is_empty() {
            return Ok(Vec::new());
        }

        let found = self.load(&refs).await?;
        let mut affected = Vec::with_capacity(found.len());
        for reference in &refs {
            match found.get(reference) {
                Some(known) => affected.push(AffectedTransaction {
                    hash: TxHash::from(reference),
                    payload: known.clone(),
                }),
                None if payload.privacy_mode() == PrivacyMode::PrivateStateValidation => {
                    return Err(TransactionError::PrivacyViolation(format!(
                        "Unable to find affected transaction {}",
                        reference
                    )));
                }
                None => debug!("Affected transaction {} not known locally", reference),
            }
        }
        Ok(affected)
    }

    fn validate_payload(
        &self,
        hash: &TxHash,
        payload: &EncodedPayload,
        affected: &[AffectedTransaction],
    ) -> bool {
        let mode = payload.privacy_mode();
        if mode == PrivacyMode::StandardPrivate {
            return true;
        }

        if let Some(mismatched) = affected.iter().find(|tx| tx.payload.privacy_mode() != mode) {
            info!(
                "Ignoring {} transaction {}: affected transaction {} is {}",
                mode,
                hash,
                mismatched.hash,
                mismatched.payload.privacy_mode()
            );
            return false;
        }

        let sender = payload.sender_key();
        if let Some(unaware) = affected
            .iter()
            .find(|tx| !tx.payload.recipient_keys().contains(sender))
        {
            info!(
                "Ignoring transaction {}: sender is not a participant of affected transaction {}",
                hash, unaware.hash
            );
            return false;
        }

        true
    }

    fn sanitise(
        &self,
        hash: &TxHash,
        payload: &EncodedPayload,
        invalid: &BTreeSet<TxHash>,
    ) -> Result<EncodedPayload, TransactionError> {
        if invalid.is_empty() {
            return Ok(payload.clone());
        }

        if payload.privacy_mode() == PrivacyMode::PrivateStateValidation {
            return Err(TransactionError::PrivacyViolation(format!(
                "Invalid security hashes identified for PSC TX {}. Invalid ACOTHs: {}",
                hash,
                join_hashes(invalid)
            )));
        }

        warn!(
            "⚠️ Removing invalid security hashes from transaction {}: {}",
            hash,
            join_hashes(invalid)
        );
        Ok(payload.without_affected(invalid))
    }
}

pub(crate) fn join_hashes(hashes: &BTreeSet<TxHash>) -> String {
    hashes
        .iter()
        .map(|h| h.to_base64())
        .collect::<Vec<_>>()
        .join(",")
}
