//! [`AuthBackend`] over plain HTTP + JSON.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;
use vigil_protocol::{
    AccessToken, Codec, Credentials, JsonCodec, PreferencePatch, RefreshToken, Session, TokenPair,
};
use vigil_transport::{HttpClient, HttpRequest, HttpResponse};

use crate::{AuthBackend, BackendError};

/// Where the five auth calls go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEndpoints {
    /// Scheme, host, and optional prefix, without a trailing slash.
    pub base_url: String,
    pub login: String,
    pub logout: String,
    pub refresh: String,
    pub heartbeat: String,
    pub preferences: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self::new("http://localhost")
    }
}

impl AuthEndpoints {
    /// The standard `/auth/*` paths under `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            login: "/auth/login".into(),
            logout: "/auth/logout".into(),
            refresh: "/auth/refresh".into(),
            heartbeat: "/auth/heartbeat".into(),
            preferences: "/auth/preferences".into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[derive(Serialize)]
struct RefreshBody {
    current_time: String,
}

/// Talks to an auth service through any [`HttpClient`].
///
/// Every call is a `POST` with a JSON body. Authenticated calls carry the
/// access credential as a bearer; refresh carries the refresh credential
/// instead. A non-2xx answer becomes [`BackendError::Rejected`] with the
/// response body as the message; a transport failure becomes
/// [`BackendError::Unreachable`].
#[derive(Debug, Clone)]
pub struct HttpAuthBackend<C> {
    client: C,
    endpoints: AuthEndpoints,
    codec: JsonCodec,
}

impl<C: HttpClient> HttpAuthBackend<C> {
    pub fn new(client: C, endpoints: AuthEndpoints) -> Self {
        Self {
            client,
            endpoints,
            codec: JsonCodec,
        }
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<HttpRequest, BackendError> {
        let bytes = self
            .codec
            .encode(body)
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        Ok(HttpRequest::post(self.endpoints.url(path)).with_json_body(bytes))
    }

    async fn call(&self, request: HttpRequest) -> Result<HttpResponse, BackendError> {
        let id = request.id;
        let url = request.url.clone();
        let response = self
            .client
            .send(request)
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        debug!(%id, %url, status = response.status, "auth call answered");

        if response.is_success() {
            Ok(response)
        } else {
            Err(BackendError::Rejected {
                status: response.status,
                message: response.text(),
            })
        }
    }
}

impl<C: HttpClient> AuthBackend for HttpAuthBackend<C> {
    async fn login(&self, credentials: &Credentials) -> Result<Session, BackendError> {
        let request = self.post(&self.endpoints.login, credentials)?;
        let response = self.call(request).await?;
        let session: Session = self
            .codec
            .decode(&response.body)
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        session
            .validate()
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        Ok(session)
    }

    async fn logout(&self, session: Option<&Session>) -> Result<(), BackendError> {
        let mut request = self.post(&self.endpoints.logout, &serde_json::json!({}))?;
        if let Some(session) = session {
            request.set_bearer(session.access_token.as_str());
        }
        self.call(request).await.map(drop)
    }

    async fn refresh(
        &self,
        now: DateTime<Utc>,
        refresh_token: &RefreshToken,
    ) -> Result<TokenPair, BackendError> {
        let body = RefreshBody {
            current_time: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let request = self
            .post(&self.endpoints.refresh, &body)?
            .with_bearer(refresh_token.as_str());
        let response = self.call(request).await?;
        let pair: TokenPair = self
            .codec
            .decode(&response.body)
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        if pair.access_token.is_empty() || pair.refresh_token.is_empty() {
            return Err(BackendError::InvalidResponse(
                "refresh returned an empty credential".into(),
            ));
        }
        Ok(pair)
    }

    async fn heartbeat(&self, access_token: &AccessToken) -> Result<(), BackendError> {
        let request = self
            .post(&self.endpoints.heartbeat, &serde_json::json!({}))?
            .with_bearer(access_token.as_str());
        self.call(request).await.map(drop)
    }

    async fn update_preferences(
        &self,
        access_token: &AccessToken,
        patch: &PreferencePatch,
    ) -> Result<(), BackendError> {
        let request = self
            .post(&self.endpoints.preferences, patch)?
            .with_bearer(access_token.as_str());
        self.call(request).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::TimeZone;
    use vigil_transport::{Method, TransportError};

    use super::*;

    /// Records every request and answers from a fixed script.
    #[derive(Default)]
    struct ScriptedClient {
        sent: Mutex<Vec<HttpRequest>>,
        reply: Mutex<Option<Result<HttpResponse, TransportError>>>,
    }

    impl ScriptedClient {
        fn answering(status: u16, body: &str) -> Arc<Self> {
            let client = Self::default();
            *client.reply.lock().unwrap() = Some(Ok(HttpResponse::new(status, body)));
            Arc::new(client)
        }

        fn failing(err: TransportError) -> Arc<Self> {
            let client = Self::default();
            *client.reply.lock().unwrap() = Some(Err(err));
            Arc::new(client)
        }

        fn last(&self) -> HttpRequest {
            self.sent.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl HttpClient for ScriptedClient {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            self.sent.lock().unwrap().push(request);
            self.reply
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Ok(HttpResponse::new(200, "{}")))
        }
    }

    fn backend(client: &Arc<ScriptedClient>) -> HttpAuthBackend<Arc<ScriptedClient>> {
        HttpAuthBackend::new(Arc::clone(client), AuthEndpoints::new("https://api.test/"))
    }

    #[test]
    fn test_endpoints_trim_trailing_slash() {
        let endpoints = AuthEndpoints::new("https://api.test/");
        assert_eq!(endpoints.url(&endpoints.login), "https://api.test/auth/login");
    }

    #[tokio::test]
    async fn test_login_decodes_session() {
        let client = ScriptedClient::answering(
            200,
            r#"{"name":"ada","access_token":"a.b.c","refresh_token":"r1"}"#,
        );
        let session = backend(&client)
            .login(&Credentials::new("ada", "pw"))
            .await
            .unwrap();

        assert_eq!(session.access_token.as_str(), "a.b.c");
        let sent = client.last();
        assert_eq!(sent.method, Method::Post);
        assert_eq!(sent.url, "https://api.test/auth/login");
        assert!(!sent.has_authorization());
    }

    #[tokio::test]
    async fn test_login_rejection_keeps_status_and_body() {
        let client = ScriptedClient::answering(401, "bad credentials");
        let err = backend(&client)
            .login(&Credentials::new("ada", "nope"))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            BackendError::Rejected {
                status: 401,
                message: "bad credentials".into()
            }
        );
    }

    #[tokio::test]
    async fn test_login_with_blank_token_is_invalid() {
        let client = ScriptedClient::answering(200, r#"{"access_token":"","refresh_token":"r"}"#);
        let err = backend(&client)
            .login(&Credentials::new("ada", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_refresh_sends_refresh_bearer_and_time() {
        let client = ScriptedClient::answering(200, r#"{"access_token":"a2","refresh_token":"r2"}"#);
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();

        let pair = backend(&client)
            .refresh(now, &RefreshToken::new("r1"))
            .await
            .unwrap();

        assert_eq!(pair.access_token.as_str(), "a2");
        let sent = client.last();
        assert_eq!(sent.url, "https://api.test/auth/refresh");
        assert_eq!(sent.bearer(), Some("r1"));
        let body: serde_json::Value = serde_json::from_slice(sent.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["current_time"], "2026-03-01T12:00:00.000Z");
    }

    #[tokio::test]
    async fn test_transport_failure_is_unreachable() {
        let client = ScriptedClient::failing(TransportError::Timeout);
        let err = backend(&client)
            .heartbeat(&AccessToken::new("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_logout_without_session_sends_no_bearer() {
        let client = ScriptedClient::answering(204, "");
        backend(&client).logout(None).await.unwrap();
        assert!(!client.last().has_authorization());
    }

    #[tokio::test]
    async fn test_preferences_carry_patch_and_access_bearer() {
        let client = ScriptedClient::answering(200, "{}");
        let mut patch = PreferencePatch::new();
        patch.insert("dark_mode".into(), true.into());

        backend(&client)
            .update_preferences(&AccessToken::new("a1"), &patch)
            .await
            .unwrap();

        let sent = client.last();
        assert_eq!(sent.url, "https://api.test/auth/preferences");
        assert_eq!(sent.bearer(), Some("a1"));
        let body: serde_json::Value = serde_json::from_slice(sent.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["dark_mode"], true);
    }
}
