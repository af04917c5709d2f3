//! HTTP-client abstraction for Vigil.
//!
//! Vigil does not own the network. The application hands it something that
//! implements [`HttpClient`]; Vigil wraps it with the bearer/401
//! interceptors and uses it to reach the auth backend.
//!
//! # Feature Flags
//!
//! - `reqwest` (default): [`ReqwestClient`], an `HttpClient` backed by
//!   `reqwest`.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

mod error;
#[cfg(feature = "reqwest")]
mod reqwest_client;

pub use error::TransportError;
#[cfg(feature = "reqwest")]
pub use reqwest_client::ReqwestClient;

/// Name of the header carrying the bearer credential.
pub const AUTHORIZATION: &str = "authorization";

/// Counter for generating unique request IDs.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a request, carried across a replay so both
/// attempts show up under the same ID in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Allocates the next process-wide request ID.
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// An outgoing request.
///
/// Header names are stored lowercased so lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Process-wide request ID, kept across replays.
    pub id: RequestId,
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    headers: BTreeMap<String, String>,
    /// Request body, if any.
    pub body: Option<Vec<u8>>,
    /// Set once the request has been replayed after a credential refresh.
    /// A 401 on a retried request is final.
    pub retried: bool,
}

impl HttpRequest {
    /// Creates a request with no headers and no body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            id: RequestId::next(),
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
            retried: false,
        }
    }

    /// Shorthand for a `GET` request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// Shorthand for a `POST` request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// Sets a header (builder style).
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Sets a JSON body and the matching content type (builder style).
    #[must_use]
    pub fn with_json_body(mut self, body: Vec<u8>) -> Self {
        self.set_header("content-type", "application/json");
        self.body = Some(body);
        self
    }

    /// Sets or replaces a header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Looks up a header by (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// All headers, lowercased names.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `true` if an `Authorization` header is already present.
    pub fn has_authorization(&self) -> bool {
        self.headers.contains_key(AUTHORIZATION)
    }

    /// Sets `Authorization: Bearer <token>`, replacing any existing value.
    pub fn set_bearer(&mut self, token: &str) {
        self.set_header(AUTHORIZATION, format!("Bearer {token}"));
    }

    /// Sets the bearer credential (builder style).
    #[must_use]
    pub fn with_bearer(mut self, token: &str) -> Self {
        self.set_bearer(token);
        self
    }

    /// The bearer credential, if the `Authorization` header carries one.
    pub fn bearer(&self) -> Option<&str> {
        self.header(AUTHORIZATION)
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, lowercased names.
    pub headers: BTreeMap<String, String>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with the given status and body.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `true` for 401 Unauthorized.
    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    /// The body as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Sends a request and waits for its response.
///
/// # Trait bounds
///
/// - `Send + Sync + 'static` → the client is shared between the interceptor
///   wrapper and the auth backend for the lifetime of the application.
/// - The returned future is `Send` so it can run inside spawned tasks
///   (heartbeats and background refreshes).
///
/// A non-2xx status is NOT an error at this layer: the interceptor needs to
/// see 401s as responses.
pub trait HttpClient: Send + Sync + 'static {
    /// Sends `request` and returns the response.
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send;
}

impl<C: HttpClient> HttpClient for std::sync::Arc<C> {
    fn send(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send {
        (**self).send(request)
    }
}
