//! Distribution of committed payloads to remote recipients.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec::PayloadCodec;
use crate::network::client::PeerClient;
use crate::network::party_info::PartyInfoService;
use crate::payload::EncodedPayload;
use crate::types::PublicKey;

/// Fire-and-forget delivery. Called from the storage post-commit callback, so
/// it must not block and cannot fail the send that triggered it.
pub trait PayloadPublisher: Send + Sync {
    fn publish(&self, payload: &EncodedPayload, recipients: &[PublicKey]);
}

/// Pushes each recipient its own trimmed copy over `POST /push`.
pub struct HttpPayloadPublisher {
    client: Arc<dyn PeerClient>,
    party_info: Arc<PartyInfoService>,
    codec: PayloadCodec,
}

impl HttpPayloadPublisher {
    pub fn new(
        client: Arc<dyn PeerClient>,
        party_info: Arc<PartyInfoService>,
        codec: PayloadCodec,
    ) -> Self {
        Self {
            client,
            party_info,
            codec,
        }
    }
}

impl PayloadPublisher for HttpPayloadPublisher {
    fn publish(&self, payload: &EncodedPayload, recipients: &[PublicKey]) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    "⚠️ No runtime available, {} not published",
                    payload.message_hash()
                );
                return;
            }
        };

        for recipient in recipients {
            let Some(trimmed) = payload.for_recipient(recipient) else {
                warn!(
                    "⚠️ No recipient box for {} in {}, skipping",
                    recipient,
                    payload.message_hash()
                );
                continue;
            };

            let recipient = *recipient;
            let client = self.client.clone();
            let party_info = self.party_info.clone();
            let codec = self.codec;

            handle.spawn(async move {
                let hash = trimmed.message_hash();
                let Some(url) = party_info.url_for_key(&recipient).await else {
                    warn!("⚠️ Unknown url for recipient {}, {} not pushed", recipient, hash);
                    return;
                };

                let body = match codec.encode(&trimmed) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("⚠️ Failed to encode {} for {}: {}", hash, recipient, e);
                        return;
                    }
                };

                match client.post(&url, "push", body).await {
                    Ok(_) => debug!("Pushed {} to {} at {}", hash, recipient, url),
                    Err(e) => warn!("⚠️ Push of {} to {} failed: {}", hash, url, e),
                }
            });
        }
    }
}
