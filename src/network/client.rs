use std::time::Duration;

use crate::error::TransportError;

/// Outbound requests to other nodes.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync {
    /// POST `body` to `path` on the node at `base_url` and return the response body.
    async fn post(&self, base_url: &str, path: &str, body: Vec<u8>)
        -> Result<Vec<u8>, TransportError>;
}

pub fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

pub struct HttpPeerClient {
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl PeerClient for HttpPeerClient {
    async fn post(
        &self,
        base_url: &str,
        path: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        let url = join_url(base_url, path);

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(url.clone())
                } else {
                    TransportError::Request {
                        url: url.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| TransportError::Request {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}
