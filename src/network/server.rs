//! Minimal HTTP/1.1 endpoint for the peer protocol, served over raw TCP.
//!
//! One request per connection; responses always close the connection. The
//! same listener carries the peer routes (`/push`, `/partyinfo`) and the
//! client transaction API (`/send`, `/transaction/{hash}`, ...).

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::PayloadCodec;
use crate::error::{DiscoveryError, TransactionError};
use crate::network::api::{self, SendJson, SendSignedJson, StoreRawJson};
use crate::network::party_info::{PartyInfo, PartyInfoService};
use crate::network::peer_validator::PeerDiscoveryValidator;
use crate::transaction_manager::{ReceiveRequest, TransactionManager};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Time a client gets to deliver a complete request.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    /// Raw query string without the `?`, empty when absent.
    pub query: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl HttpResponse {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.into().into_bytes(),
        }
    }

    fn bytes(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: "application/octet-stream",
            body,
        }
    }

    fn json(value: &serde_json::Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
        }
    }

    fn serialized<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(e) => Self::text(500, e.to_string()),
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            409 => "Conflict",
            413 => "Payload Too Large",
            503 => "Service Unavailable",
            _ => "Internal Server Error",
        }
    }

    fn to_wire(&self) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n",
            self.status,
            self.reason(),
            self.content_type,
            self.body.len()
        )
        .into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

pub struct PeerServer {
    manager: Arc<TransactionManager>,
    party_info: Arc<PartyInfoService>,
    validator: Arc<PeerDiscoveryValidator>,
    codec: PayloadCodec,
    read_timeout: Duration,
}

impl PeerServer {
    pub fn new(
        manager: Arc<TransactionManager>,
        party_info: Arc<PartyInfoService>,
        validator: Arc<PeerDiscoveryValidator>,
        codec: PayloadCodec,
    ) -> Self {
        Self {
            manager,
            party_info,
            validator,
            codec,
            read_timeout: REQUEST_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), std::io::Error> {
        info!("✓ Peer server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Peer server stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (socket, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("⚠️ Accept failed: {}", e);
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(socket, addr).await {
                            debug!("Connection from {} ended with error: {}", addr, e);
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        mut socket: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), std::io::Error> {
        let response = match read_request_within(&mut socket, self.read_timeout).await? {
            Ok(request) => {
                debug!("{} {} from {}", request.method, request.path, addr);
                self.handle(request).await
            }
            Err(response) => response,
        };

        socket.write_all(&response.to_wire()).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Route one request.
    pub async fn handle(&self, request: HttpRequest) -> HttpResponse {
        if let Some(rest) = request.path.strip_prefix("/transaction/") {
            return self
                .transaction(&request.method, rest, &request.query)
                .await
                .unwrap_or_else(|e| transaction_error_response(&e));
        }

        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/upcheck") => {
                if self.manager.upcheck().await {
                    HttpResponse::text(200, "I'm up!")
                } else {
                    HttpResponse::text(503, "Storage unavailable")
                }
            }
            ("POST", "/push") => self.push(&request.body).await,
            ("GET", "/partyinfo") => HttpResponse::json(&self.party_info.get().await.to_json()),
            ("POST", "/partyinfo") => self.announce(&request.body).await,
            ("POST", "/partyinfo/validate") => match self.validator.answer_challenge(&request.body) {
                Ok(answer) => HttpResponse::bytes(200, answer),
                Err(e) => discovery_error_response(&e),
            },
            ("POST", "/send") => respond(self.send(&request.body).await),
            ("POST", "/sendsignedtx") => respond(self.send_signed(&request.body).await),
            ("POST", "/storeraw") => respond(self.store_raw(&request.body).await),
            ("POST", "/encodedpayload/create") => {
                respond(self.create_payload(&request.body).await)
            }
            ("POST", "/encodedpayload/decrypt") => {
                respond(self.decrypt_payload(&request.body, &request.query).await)
            }
            (
                _,
                "/upcheck" | "/push" | "/partyinfo" | "/partyinfo/validate" | "/send"
                | "/sendsignedtx" | "/storeraw" | "/encodedpayload/create"
                | "/encodedpayload/decrypt",
            ) => HttpResponse::text(405, "Method not allowed"),
            _ => HttpResponse::text(404, "Not found"),
        }
    }

    /// `/transaction/{hash}[/action]`. The hash is percent-encoded base64.
    async fn transaction(
        &self,
        method: &str,
        rest: &str,
        query: &str,
    ) -> Result<HttpResponse, TransactionError> {
        let (encoded, action) = match rest.split_once('/') {
            Some((hash, action)) => (hash, Some(action)),
            None => (rest, None),
        };
        if !matches!(
            action,
            None | Some("isSender" | "participants" | "mandatory")
        ) {
            return Ok(HttpResponse::text(404, "Not found"));
        }
        let expected = if action.is_none() && method == "DELETE" {
            "DELETE"
        } else {
            "GET"
        };
        if method != expected {
            return Ok(HttpResponse::text(405, "Method not allowed"));
        }

        let hash = api::parse_hash(&api::percent_decode(encoded)?)?;
        match (method, action) {
            ("DELETE", _) => {
                self.manager.delete(&hash).await?;
                Ok(HttpResponse::text(204, ""))
            }
            (_, Some("isSender")) => {
                let sender = self.manager.is_sender(&hash).await?;
                Ok(HttpResponse::text(200, sender.to_string()))
            }
            (_, Some("participants")) => {
                let participants = self.manager.get_participants(&hash).await?;
                Ok(HttpResponse::text(200, api::encode_keys(&participants).join(",")))
            }
            (_, Some("mandatory")) => {
                let mandatory = self.manager.get_mandatory_recipients(&hash).await?;
                Ok(HttpResponse::text(200, api::encode_keys(&mandatory).join(",")))
            }
            _ => {
                let recipient = api::query_param(query, "to")?
                    .map(|key| api::parse_key(&key))
                    .transpose()?;
                let raw = api::query_param(query, "isRaw")?
                    .is_some_and(|value| value.eq_ignore_ascii_case("true"));
                let response = self
                    .manager
                    .receive(ReceiveRequest {
                        hash,
                        recipient,
                        raw,
                    })
                    .await?;
                Ok(HttpResponse::serialized(
                    200,
                    &api::ReceiveResponseJson::from(&response),
                ))
            }
        }
    }

    async fn send(&self, body: &[u8]) -> Result<HttpResponse, TransactionError> {
        let request = api::decode_json::<SendJson>(body)?
            .into_request(self.manager.default_public_key())?;
        let response = self.manager.send(request).await?;
        Ok(HttpResponse::serialized(
            201,
            &api::SendResponseJson::from(&response),
        ))
    }

    async fn send_signed(&self, body: &[u8]) -> Result<HttpResponse, TransactionError> {
        let request = api::decode_json::<SendSignedJson>(body)?.into_request()?;
        let response = self.manager.send_signed_transaction(request).await?;
        Ok(HttpResponse::serialized(
            201,
            &api::SendResponseJson::from(&response),
        ))
    }

    async fn store_raw(&self, body: &[u8]) -> Result<HttpResponse, TransactionError> {
        let request = api::decode_json::<StoreRawJson>(body)?.into_request()?;
        let response = self.manager.store_raw(request).await?;
        Ok(HttpResponse::serialized(
            200,
            &api::StoreRawResponseJson::from(&response),
        ))
    }

    /// Encrypt without storing or publishing; the body of the reply is the
    /// payload in its JSON encoding.
    async fn create_payload(&self, body: &[u8]) -> Result<HttpResponse, TransactionError> {
        let request = api::decode_json::<SendJson>(body)?
            .into_request(self.manager.default_public_key())?;
        let payload = self.manager.pipeline().create(&request).await?;
        let mut response = HttpResponse::bytes(200, PayloadCodec::Json.encode(&payload)?);
        response.content_type = "application/json";
        Ok(response)
    }

    /// Open a JSON-encoded payload, with the key named by `?to=` if given.
    async fn decrypt_payload(
        &self,
        body: &[u8],
        query: &str,
    ) -> Result<HttpResponse, TransactionError> {
        let payload = PayloadCodec::Json.decode(body)?;
        let recipient = api::query_param(query, "to")?
            .map(|key| api::parse_key(&key))
            .transpose()?;
        let decrypted = self.manager.pipeline().decrypt(&payload, recipient).await?;
        Ok(HttpResponse::serialized(
            200,
            &api::DecryptResponseJson::new(&payload, &decrypted),
        ))
    }

    async fn push(&self, body: &[u8]) -> HttpResponse {
        let payload = match self.codec.decode(body) {
            Ok(payload) => payload,
            Err(e) => return HttpResponse::text(400, e.to_string()),
        };
        match self.manager.store_payload(payload).await {
            Ok(hash) => HttpResponse::text(201, hash.to_base64()),
            Err(e) => transaction_error_response(&e),
        }
    }

    async fn announce(&self, body: &[u8]) -> HttpResponse {
        let announced = match PartyInfo::decode(body) {
            Ok(info) => info,
            Err(e) => return discovery_error_response(&e),
        };
        match self.validator.validate_and_merge(announced).await {
            Ok(merged) => match merged.encode() {
                Ok(bytes) => HttpResponse::bytes(200, bytes),
                Err(e) => discovery_error_response(&e),
            },
            Err(e) => discovery_error_response(&e),
        }
    }
}

fn respond(result: Result<HttpResponse, TransactionError>) -> HttpResponse {
    result.unwrap_or_else(|e| transaction_error_response(&e))
}

pub fn transaction_error_response(error: &TransactionError) -> HttpResponse {
    let status = match error {
        TransactionError::Validation(_)
        | TransactionError::Payload(_)
        | TransactionError::Codec(_) => 400,
        TransactionError::PrivacyViolation(_) => 403,
        TransactionError::NotFound(_) | TransactionError::RecipientKeyNotFound(_) => 404,
        TransactionError::Conflict(_) => 409,
        TransactionError::MandatoryRecipientsNotAvailable => 400,
        TransactionError::Enclave(_) | TransactionError::Storage(_) => 500,
    };
    HttpResponse::text(status, error.to_string())
}

pub fn discovery_error_response(error: &DiscoveryError) -> HttpResponse {
    let status = match error {
        DiscoveryError::SecurityViolation(_) => 403,
        DiscoveryError::NotAChallenge
        | DiscoveryError::NoManagedRecipient
        | DiscoveryError::Malformed(_)
        | DiscoveryError::Codec(_) => 400,
        DiscoveryError::Enclave(_) => 403,
        DiscoveryError::Transport(_) => 500,
    };
    HttpResponse::text(status, error.to_string())
}

/// `read_request` bounded by `limit`. A client that stalls gets a 408.
async fn read_request_within<R: AsyncRead + Unpin>(
    stream: &mut R,
    limit: Duration,
) -> Result<Result<HttpRequest, HttpResponse>, std::io::Error> {
    match tokio::time::timeout(limit, read_request(stream)).await {
        Ok(result) => result,
        Err(_) => Ok(Err(HttpResponse::text(408, "Request timeout"))),
    }
}

/// Read one request. The outer error is an I/O failure; the inner error is a
/// response to send back for a malformed request.
async fn read_request<R: AsyncRead + Unpin>(
    socket: &mut R,
) -> Result<Result<HttpRequest, HttpResponse>, std::io::Error> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_HEADER_BYTES {
            return Ok(Err(HttpResponse::text(413, "Headers too large")));
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(Err(HttpResponse::text(400, "Incomplete request")));
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = match parse_head(&buffer[..header_end]) {
        Some(head) => head,
        None => return Ok(Err(HttpResponse::text(400, "Malformed request"))),
    };
    if head.content_length > MAX_BODY_BYTES {
        return Ok(Err(HttpResponse::text(413, "Body too large")));
    }

    let mut body = buffer[header_end + 4..].to_vec();
    while body.len() < head.content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(Err(HttpResponse::text(400, "Incomplete body")));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(head.content_length);

    Ok(Ok(HttpRequest {
        method: head.method,
        path: head.path,
        query: head.query,
        body,
    }))
}

struct RequestHead {
    method: String,
    path: String,
    query: String,
    content_length: usize,
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(head: &[u8]) -> Option<RequestHead> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");

    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_ascii_uppercase();
    let target = request_line.next()?;
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
    .to_string();

    let mut content_length = 0;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok()?;
            }
        }
    }

    Some(RequestHead {
        method,
        path,
        query: query.to_string(),
        content_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_head() {
        let head = parse_head(
            b"POST /partyinfo/validate/?x=1 HTTP/1.1\r\nHost: a\r\nContent-Length: 12",
        )
        .unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/partyinfo/validate");
        assert_eq!(head.query, "x=1");
        assert_eq!(head.content_length, 12);
    }

    #[test]
    fn test_parse_head_rejects_bad_length() {
        assert!(parse_head(b"POST /push HTTP/1.1\r\nContent-Length: lots").is_none());
        assert!(parse_head(b"").is_none());
    }

    #[tokio::test]
    async fn test_read_request_from_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"POST /storeraw?from=a%2Fb HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody")
            .await
            .unwrap();

        let request = read_request_within(&mut server, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.path, "/storeraw");
        assert_eq!(request.query, "from=a%2Fb");
        assert_eq!(request.body, b"body".to_vec());
    }

    #[tokio::test]
    async fn test_stalled_request_times_out() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        // Header never terminated, connection held open
        client.write_all(b"GET /upcheck HTTP/1.1\r\n").await.unwrap();

        let response = read_request_within(&mut server, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(response.status, 408);
        assert!(String::from_utf8(response.to_wire())
            .unwrap()
            .starts_with("HTTP/1.1 408 Request Timeout\r\n"));
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(14));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn test_response_wire_format() {
        let wire = HttpResponse::text(201, "abc").to_wire();
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));
    }

    #[test]
    fn test_error_status_mapping() {
        let conflict = TransactionError::Conflict("Invalid existing transaction".into());
        assert_eq!(transaction_error_response(&conflict).status, 409);
        let violation = TransactionError::PrivacyViolation("missing".into());
        assert_eq!(transaction_error_response(&violation).status, 403);
        let rejected = DiscoveryError::SecurityViolation("No key found for url x".into());
        assert_eq!(discovery_error_response(&rejected).status, 403);
    }
}
