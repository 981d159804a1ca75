//! This node's view of the network: which urls serve which keys, and which
//! peers are known.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::DiscoveryError;
use crate::types::PublicKey;

/// Strip the trailing slash so that `http://a/` and `http://a` compare equal.
pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Recipient {
    pub key: PublicKey,
    pub url: String,
}

impl Recipient {
    pub fn new(key: PublicKey, url: &str) -> Self {
        Self {
            key,
            url: normalize_url(url),
        }
    }
}

/// A known peer. Identity is the url alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Party {
    pub url: String,
    /// Unix seconds of the last successful exchange.
    pub last_contacted: Option<i64>,
}

impl Party {
    pub fn new(url: &str) -> Self {
        Self {
            url: normalize_url(url),
            last_contacted: None,
        }
    }
}

impl PartialEq for Party {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for Party {}

impl PartialOrd for Party {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Party {
    fn cmp(&self, other: &Self) -> Ordering {
        self.url.cmp(&other.url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyInfo {
    pub url: String,
    pub recipients: BTreeSet<Recipient>,
    pub parties: BTreeSet<Party>,
}

impl PartyInfo {
    pub fn new(url: &str) -> Self {
        Self {
            url: normalize_url(url),
            recipients: BTreeSet::new(),
            parties: BTreeSet::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DiscoveryError> {
        bincode::serialize(self).map_err(|e| DiscoveryError::Malformed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DiscoveryError> {
        bincode::deserialize(bytes).map_err(|e| DiscoveryError::Malformed(e.to_string()))
    }

    pub fn url_for_key(&self, key: &PublicKey) -> Option<&str> {
        self.recipients
            .iter()
            .find(|r| r.key == *key)
            .map(|r| r.url.as_str())
    }

    /// Add or move keys. A key maps to exactly one url; the newest wins.
    pub fn merge_recipients(&mut self, recipients: impl IntoIterator<Item = Recipient>) {
        for recipient in recipients {
            self.recipients.retain(|r| r.key != recipient.key);
            self.recipients
                .insert(Recipient::new(recipient.key, &recipient.url));
        }
    }

    /// Add unknown parties. Existing entries keep their contact time.
    pub fn merge_parties(&mut self, parties: impl IntoIterator<Item = Party>) {
        for party in parties.into_iter().map(|p| Party::new(&p.url)) {
            if party.url != self.url && !self.parties.contains(&party) {
                self.parties.insert(party);
            }
        }
    }

    pub fn mark_contacted(&mut self, url: &str, at: i64) {
        let party = Party {
            url: normalize_url(url),
            last_contacted: Some(at),
        };
        if party.url != self.url {
            self.parties.replace(party);
        }
    }

    /// Document served on `GET /partyinfo`.
    pub fn to_json(&self) -> Value {
        let peers: Vec<Value> = self
            .parties
            .iter()
            .map(|p| {
                let last_contact = p
                    .last_contacted
                    .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                    .map(|at| at.to_rfc3339());
                json!({ "url": p.url, "lastContact": last_contact })
            })
            .collect();
        let keys: Vec<Value> = self
            .recipients
            .iter()
            .map(|r| json!({ "key": r.key.to_base64(), "url": r.url }))
            .collect();

        json!({ "url": self.url, "peers": peers, "keys": keys })
    }
}

/// Owner of the process-wide `PartyInfo`. Every change goes through one lock,
/// so merges never interleave.
///
/// Keys held by the local enclave are pinned to this node's url. A known
/// remote key only moves when the node at its current url says so.
pub struct PartyInfoService {
    state: Mutex<PartyInfo>,
    local_keys: BTreeSet<PublicKey>,
}

impl PartyInfoService {
    pub fn new(
        url: &str,
        local_keys: impl IntoIterator<Item = PublicKey>,
        bootstrap: impl IntoIterator<Item = String>,
    ) -> Self {
        let local_keys: BTreeSet<PublicKey> = local_keys.into_iter().collect();
        let mut info = PartyInfo::new(url);
        let own_url = info.url.clone();
        info.merge_recipients(local_keys.iter().map(|k| Recipient::new(*k, &own_url)));
        info.merge_parties(bootstrap.into_iter().map(|u| Party::new(&u)));
        Self {
            state: Mutex::new(info),
            local_keys,
        }
    }

    pub fn is_local_key(&self, key: &PublicKey) -> bool {
        self.local_keys.contains(key)
    }

    pub async fn get(&self) -> PartyInfo {
        self.state.lock().await.clone()
    }

    pub async fn url(&self) -> String {
        self.state.lock().await.url.clone()
    }

    /// Merge validated recipients and announced parties, and record contact
    /// with `from_url`. Returns the merged view.
    pub async fn merge(
        &self,
        from_url: &str,
        recipients: impl IntoIterator<Item = Recipient>,
        parties: impl IntoIterator<Item = Party>,
    ) -> PartyInfo {
        let from_url = normalize_url(from_url);
        let mut state = self.state.lock().await;
        let admitted: Vec<Recipient> = recipients
            .into_iter()
            .filter(|r| self.admits(&state, &from_url, r))
            .collect();
        state.merge_recipients(admitted);
        state.merge_parties(parties);
        state.mark_contacted(&from_url, chrono::Utc::now().timestamp());
        state.clone()
    }

    pub async fn url_for_key(&self, key: &PublicKey) -> Option<String> {
        self.state.lock().await.url_for_key(key).map(str::to_string)
    }

    fn admits(&self, state: &PartyInfo, from_url: &str, recipient: &Recipient) -> bool {
        let claimed = normalize_url(&recipient.url);

        if self.is_local_key(&recipient.key) {
            if !claimed.eq_ignore_ascii_case(&state.url) {
                warn!(
                    "🚫 Refused to map local key {} to {} (announced by {})",
                    recipient.key, claimed, from_url
                );
            }
            return false;
        }

        match state.url_for_key(&recipient.key) {
            Some(current)
                if !current.eq_ignore_ascii_case(&claimed)
                    && !current.eq_ignore_ascii_case(from_url) =>
            {
                warn!(
                    "🚫 Refused to move key {} from {} to {}: announced by {}",
                    recipient.key, current, claimed, from_url
                );
                false
            }
            _ => true,
        }
    }

    /// Urls of every known peer other than this node.
    pub async fn peer_urls(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.parties.iter().map(|p| p.url.clone()).collect()
    }
}
