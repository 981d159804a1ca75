//! Periodic party-info exchange with every known peer.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DiscoveryError;
use crate::network::client::PeerClient;
use crate::network::party_info::{PartyInfo, PartyInfoService};
use crate::network::peer_validator::PeerDiscoveryValidator;

pub const PARTY_INFO_PATH: &str = "partyinfo";

pub struct PartyInfoPoller {
    party_info: Arc<PartyInfoService>,
    validator: Arc<PeerDiscoveryValidator>,
    client: Arc<dyn PeerClient>,
    interval: Duration,
}

impl PartyInfoPoller {
    pub fn new(
        party_info: Arc<PartyInfoService>,
        validator: Arc<PeerDiscoveryValidator>,
        client: Arc<dyn PeerClient>,
        interval: Duration,
    ) -> Self {
        Self {
            party_info,
            validator,
            client,
            interval,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("🔄 Party info poller started (every {:?})", self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Party info poller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let updated = self.poll_once().await;
                    debug!("Party info poll round finished, {} peers updated", updated);
                }
            }
        }
    }

    /// Announce ourselves to every known peer and merge what they answer.
    /// Returns the number of peers whose answer was accepted.
    pub async fn poll_once(&self) -> usize {
        let ours = match self.party_info.get().await.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("⚠️ Could not encode local party info: {}", e);
                return 0;
            }
        };

        let mut updated = 0;
        for url in self.party_info.peer_urls().await {
            match self.exchange(&url, ours.clone()).await {
                Ok(()) => updated += 1,
                Err(e) => debug!("Party info exchange with {} failed: {}", url, e),
            }
        }
        updated
    }

    async fn exchange(&self, url: &str, ours: Vec<u8>) -> Result<(), DiscoveryError> {
        let response = self.client.post(url, PARTY_INFO_PATH, ours).await?;
        let theirs = PartyInfo::decode(&response)?;
        self.validator.validate_and_merge(theirs).await?;
        Ok(())
    }
}
