//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted via a trait so any library (reqwest,
//! hyper, a platform networking stack) can be injected. Bodies are CBOR.
//!
//! | Status            | Mapped to                                  |
//! |-------------------|--------------------------------------------|
//! | 2xx               | decoded response                           |
//! | 401, 403          | `SyncError::AuthenticationFailed`          |
//! | 409, 412          | version-conflict `ServerRejection`         |
//! | 400, 422          | validation `ServerRejection`               |
//! | 408, 429, 5xx     | retryable `SyncError::Transport`           |
//! | other             | non-retryable `SyncError::Transport`       |

use crate::error::{SyncError, SyncResult};
use crate::transport::{MockTransport, SyncTransport};
use async_trait::async_trait;
use fieldsync_protocol::{
    CborMessage, ChangesRequest, ChangesResponse, PushRecordRequest, PushRecordResponse,
    PushRejection, RejectionKind, UploadRequest, UploadResponse,
};
use parking_lot::RwLock;
use std::sync::Arc;

const CHANGES_PATH: &str = "/sync/changes";
const RECORDS_PATH: &str = "/sync/records";
const ATTACHMENTS_PATH: &str = "/sync/attachments";

/// A raw HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. An `Err` means
/// the request never produced a response (DNS, connect, reset).
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with a CBOR body.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, String>;
}

/// HTTP-based sync transport.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync server (e.g., "https://sync.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &SyncError) {
        *self.last_error.write() = Some(err.to_string());
    }

    async fn post_cbor<Req, Res>(&self, path: &str, request: &Req) -> SyncResult<Res>
    where
        Req: CborMessage + Sync,
        Res: CborMessage,
    {
        let body = request
            .encode()
            .map_err(|e| SyncError::Protocol(format!("failed to encode request: {e}")))?;

        let url = format!("{}{}", self.base_url, path);
        let result = match self.client.post(&url, body).await {
            Ok(response) => map_response(response),
            Err(message) => Err(SyncError::transport_retryable(message)),
        };

        match &result {
            Ok(_) => *self.last_error.write() = None,
            Err(err) => {
                tracing::debug!(url = %url, error = %err, "request failed");
                self.set_error(err);
            }
        }
        result
    }
}

fn body_text(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        "no details".to_string()
    } else {
        text.chars().take(200).collect()
    }
}

/// Maps an HTTP response to a decoded message or a typed error.
fn map_response<Res: CborMessage>(response: HttpResponse) -> SyncResult<Res> {
    let status = response.status;
    match status {
        200..=299 => Res::decode(&response.body)
            .map_err(|e| SyncError::Protocol(format!("failed to decode response: {e}"))),
        401 | 403 => Err(SyncError::AuthenticationFailed(body_text(&response.body))),
        409 | 412 => Err(match PushRejection::decode(&response.body) {
            Ok(rejection) => SyncError::version_conflict(rejection.message, rejection.current),
            Err(_) => SyncError::version_conflict(body_text(&response.body), None),
        }),
        400 | 422 => {
            let message = PushRejection::decode(&response.body)
                .map(|r| r.message)
                .unwrap_or_else(|_| body_text(&response.body));
            Err(SyncError::validation(message))
        }
        408 | 429 | 500..=599 => Err(SyncError::transport_retryable(format!(
            "server returned {status}"
        ))),
        _ => Err(SyncError::transport_fatal(format!(
            "unexpected status {status}: {}",
            body_text(&response.body)
        ))),
    }
}

#[async_trait]
impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn changes_since(&self, request: &ChangesRequest) -> SyncResult<ChangesResponse> {
        self.post_cbor(CHANGES_PATH, request).await
    }

    async fn push_record(&self, request: &PushRecordRequest) -> SyncResult<PushRecordResponse> {
        self.post_cbor(RECORDS_PATH, request).await
    }

    async fn upload_attachment(&self, request: &UploadRequest) -> SyncResult<UploadResponse> {
        self.post_cbor(ATTACHMENTS_PATH, request).await
    }
}

/// Trait for servers that can handle loopback requests.
#[async_trait]
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request and returns the response.
    async fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse;
}

#[async_trait]
impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    async fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse {
        (**self).handle_post(path, body).await
    }
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing the HTTP mapping without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse, String> {
        // Extract path from URL
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        Ok(self.server.handle_post(path, &body).await)
    }
}

fn encoded<M: CborMessage>(status: u16, message: &M) -> HttpResponse {
    match message.encode() {
        Ok(body) => HttpResponse::new(status, body),
        Err(e) => HttpResponse::new(500, e.to_string().into_bytes()),
    }
}

fn error_response(err: SyncError) -> HttpResponse {
    match err {
        SyncError::AuthenticationFailed(message) => HttpResponse::new(401, message.into_bytes()),
        SyncError::ServerRejection {
            kind,
            message,
            current,
        } => {
            let status = match kind {
                RejectionKind::VersionConflict => 409,
                RejectionKind::Validation => 422,
            };
            let rejection = PushRejection {
                kind,
                message,
                current: current.map(|c| *c),
            };
            encoded(status, &rejection)
        }
        SyncError::Transport {
            message,
            retryable: true,
        } => HttpResponse::new(503, message.into_bytes()),
        SyncError::Timeout => HttpResponse::new(408, Vec::new()),
        other => HttpResponse::new(500, other.to_string().into_bytes()),
    }
}

fn respond<M: CborMessage>(result: SyncResult<M>) -> HttpResponse {
    match result {
        Ok(response) => encoded(200, &response),
        Err(err) => error_response(err),
    }
}

fn bad_request(err: impl std::fmt::Display) -> HttpResponse {
    HttpResponse::new(400, err.to_string().into_bytes())
}

#[async_trait]
impl LoopbackServer for MockTransport {
    async fn handle_post(&self, path: &str, body: &[u8]) -> HttpResponse {
        match path {
            CHANGES_PATH => match ChangesRequest::decode(body) {
                Ok(request) => respond(self.changes_since(&request).await),
                Err(e) => bad_request(e),
            },
            RECORDS_PATH => match PushRecordRequest::decode(body) {
                Ok(request) => respond(self.push_record(&request).await),
                Err(e) => bad_request(e),
            },
            ATTACHMENTS_PATH => match UploadRequest::decode(body) {
                Ok(request) => respond(self.upload_attachment(&request).await),
                Err(e) => bad_request(e),
            },
            _ => HttpResponse::new(404, b"not found".to_vec()),
        }
    }
}
