//! Admission control for peer announcements.
//!
//! A recipient (key, url) is only believed if the node at `url` can decrypt a
//! fresh challenge encrypted to `key`. An announcement whose sender cannot
//! prove ownership of at least one key at its own url is rejected entirely.
//! Keys held by this node are skipped: a peer could relay our own challenge
//! back to us and pass it.

use futures_util::stream::{self, StreamExt};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::codec::PayloadCodec;
use crate::enclave::Enclave;
use crate::error::{DiscoveryError, TransportError};
use crate::network::client::PeerClient;
use crate::network::party_info::{normalize_url, PartyInfo, PartyInfoService, Recipient};
use crate::payload::PrivacyMetadata;

pub const VALIDATE_PATH: &str = "partyinfo/validate";

const CHALLENGE_BYTES: usize = 32;

pub struct PeerDiscoveryValidator {
    enclave: Arc<dyn Enclave>,
    client: Arc<dyn PeerClient>,
    party_info: Arc<PartyInfoService>,
    codec: PayloadCodec,
    timeout: Duration,
    max_concurrent: usize,
}

impl PeerDiscoveryValidator {
    pub fn new(
        enclave: Arc<dyn Enclave>,
        client: Arc<dyn PeerClient>,
        party_info: Arc<PartyInfoService>,
        codec: PayloadCodec,
        timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            enclave,
            client,
            party_info,
            codec,
            timeout,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Challenge every announced recipient, then merge the ones that answered
    /// into the local view. Returns the merged view.
    pub async fn validate_and_merge(
        &self,
        announced: PartyInfo,
    ) -> Result<PartyInfo, DiscoveryError> {
        let challenge = new_challenge();
        let total = announced.recipients.len();
        let own_url = self.party_info.url().await;

        // Our own keys are never taken from a peer, nor do they vouch for it
        let candidates: Vec<Recipient> = announced
            .recipients
            .iter()
            .filter(|r| {
                if !self.party_info.is_local_key(&r.key) {
                    return true;
                }
                if !normalize_url(&r.url).eq_ignore_ascii_case(&own_url) {
                    warn!(
                        "🚫 {} announced local key {} at {}",
                        announced.url, r.key, r.url
                    );
                }
                false
            })
            .cloned()
            .collect();

        let valid: Vec<Recipient> = stream::iter(candidates)
            .map(|recipient| {
                let challenge = challenge.as_str();
                async move {
                    match self.challenge_recipient(&recipient, challenge).await {
                        Ok(true) => Some(recipient),
                        Ok(false) => {
                            debug!(
                                "Recipient {} at {} returned a wrong answer",
                                recipient.key, recipient.url
                            );
                            None
                        }
                        Err(e) => {
                            debug!(
                                "Recipient {} at {} failed validation: {}",
                                recipient.key, recipient.url, e
                            );
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.max_concurrent)
            .filter_map(|r| async move { r })
            .collect()
            .await;

        let sender_url = normalize_url(&announced.url);
        let sender_proven = valid
            .iter()
            .any(|r| normalize_url(&r.url).eq_ignore_ascii_case(&sender_url));
        if !sender_proven {
            warn!(
                "🚫 Rejected party info from {}: no key at its own url passed validation",
                announced.url
            );
            return Err(DiscoveryError::SecurityViolation(format!(
                "No key found for url {}",
                announced.url
            )));
        }

        info!(
            "✓ Validated {}/{} recipients announced by {}",
            valid.len(),
            total,
            announced.url
        );

        Ok(self
            .party_info
            .merge(&announced.url, valid, announced.parties)
            .await)
    }

    /// Encrypt the challenge to the recipient's key and check its answer.
    async fn challenge_recipient(
        &self,
        recipient: &Recipient,
        challenge: &str,
    ) -> Result<bool, DiscoveryError> {
        let payload = self.enclave.encrypt_payload(
            challenge.as_bytes(),
            &self.enclave.default_public_key(),
            &[recipient.key],
            &PrivacyMetadata::standard(),
        )?;
        let body = self.codec.encode(&payload)?;

        let answer = tokio::time::timeout(
            self.timeout,
            self.client.post(&recipient.url, VALIDATE_PATH, body),
        )
        .await
        .map_err(|_| TransportError::Timeout(recipient.url.clone()))??;

        Ok(answer.ct_eq(challenge.as_bytes()).into())
    }

    /// Answer a challenge sent by another node: decrypt with the local key it
    /// was encrypted to and return the plaintext, provided it looks like a
    /// challenge.
    pub fn answer_challenge(&self, body: &[u8]) -> Result<Vec<u8>, DiscoveryError> {
        let payload = self.codec.decode(body)?;
        let managed = self.enclave.managed_keys();

        let key = payload
            .recipient_keys()
            .iter()
            .find(|k| managed.contains(k))
            .copied()
            .ok_or(DiscoveryError::NoManagedRecipient)?;

        let plaintext = self.enclave.decrypt(&payload, &key)?;
        if !is_challenge(&plaintext) {
            warn!(
                "⚠️ Refused to answer validation request from {}: not a challenge",
                payload.sender_key()
            );
            return Err(DiscoveryError::NotAChallenge);
        }
        Ok(plaintext)
    }
}

fn new_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_challenge(plaintext: &[u8]) -> bool {
    plaintext.len() == CHALLENGE_BYTES * 2 && plaintext.iter().all(|b| b.is_ascii_hexdigit())
}
