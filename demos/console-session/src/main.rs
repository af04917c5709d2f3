use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde_json::json;
use vigil::prelude::*;
use vigil::telemetry;

// ---------------------------------------------------------------------------
// In-process auth backend
// ---------------------------------------------------------------------------

/// Mints JWT-shaped tokens with a real `iat` claim. The signature is fake.
#[derive(Default)]
struct DemoBackend {
    minted: AtomicU64,
}

impl DemoBackend {
    fn mint(&self, user: &str, issued_at: DateTime<Utc>) -> String {
        let jti = self.minted.fetch_add(1, Ordering::Relaxed);
        let claims = json!({ "sub": user, "iat": issued_at.timestamp(), "jti": jti });
        format!("e30.{}.demo", URL_SAFE_NO_PAD.encode(claims.to_string()))
    }
}

impl AuthBackend for DemoBackend {
    async fn login(&self, credentials: &Credentials) -> Result<Session, BackendError> {
        if credentials.password != "hunter2" {
            return Err(BackendError::Rejected { status: 401, message: "wrong password".into() });
        }
        let user = &credentials.username;
        Ok(Session::new(self.mint(user, Utc::now()), format!("refresh-{user}"))
            .with_attribute("username", user.clone()))
    }

    async fn logout(&self, _session: Option<&Session>) -> Result<(), BackendError> {
        Ok(())
    }

    async fn refresh(&self, now: DateTime<Utc>, refresh_token: &RefreshToken) -> Result<TokenPair, BackendError> {
        let Some(user) = refresh_token.as_str().strip_prefix("refresh-") else {
            return Err(BackendError::Rejected { status: 401, message: "unknown refresh token".into() });
        };
        Ok(TokenPair {
            access_token: AccessToken::new(self.mint(user, now)),
            refresh_token: RefreshToken::new(format!("refresh-{user}")),
        })
    }

    async fn heartbeat(&self, _access_token: &AccessToken) -> Result<(), BackendError> {
        Ok(())
    }

    async fn update_preferences(&self, _access_token: &AccessToken, patch: &PreferencePatch) -> Result<(), BackendError> {
        tracing::info!(keys = patch.len(), "backend stored preferences");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process API server
// ---------------------------------------------------------------------------

/// Answers 401 to revoked bearers, 200 to the rest.
#[derive(Default)]
struct DemoApi {
    revoked: Mutex<HashSet<String>>,
}

impl DemoApi {
    fn revoke(&self, token: &AccessToken) {
        self.revoked.lock().unwrap_or_else(|e| e.into_inner()).insert(token.as_str().to_owned());
    }
}

impl HttpClient for DemoApi {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let revoked = match request.bearer() {
            Some(token) => self.revoked.lock().unwrap_or_else(|e| e.into_inner()).contains(token),
            None => true,
        };
        if revoked {
            return Ok(HttpResponse::new(401, r#"{"error":"unauthorized"}"#));
        }
        Ok(HttpResponse::new(200, format!(r#"{{"url":"{}","retried":{}}}"#, request.url, request.retried)))
    }
}

// ---------------------------------------------------------------------------
// Terminal dialogs
// ---------------------------------------------------------------------------

/// Prints every alert. Always chooses to stay signed in.
struct ConsolePresenter;

impl AlertPresenter for ConsolePresenter {
    async fn show_warning(&self, prompt: WarningPrompt) -> WarningDecision {
        println!("[warning] session ends in {}s, staying signed in", prompt.remaining.as_secs());
        WarningDecision::Continue
    }

    async fn show_expired(&self) {
        println!("[expired] your session has ended");
    }

    fn show_info(&self, message: &str) {
        println!("[info] {message}");
    }
}

// ---------------------------------------------------------------------------
// Walkthrough
// ---------------------------------------------------------------------------

type Demo = SessionOrchestrator<DemoBackend, FileStore, ConsolePresenter>;

fn orchestrator(dir: impl Into<std::path::PathBuf>) -> Arc<Demo> {
    SessionOrchestrator::builder()
        .session_key("console.session")
        .activity_key("console.last_activity")
        .build(DemoBackend::default(), FileStore::new(dir), ConsolePresenter)
}

async fn run(orchestrator: &Arc<Demo>) -> Result<HttpResponse, VigilError> {
    match orchestrator.initialize().await {
        InitOutcome::Rehydrated => println!("restored previous session"),
        InitOutcome::Discarded => println!("stored session was unreadable, discarded"),
        InitOutcome::SignedOut => println!("no stored session"),
    }
    if let Some(notice) = orchestrator.take_expired_notice() {
        println!("{notice}");
    }

    if !orchestrator.is_authenticated() {
        if let Err(e) = orchestrator.login(&Credentials::new("ada", "guess")).await {
            println!("login refused: {e}");
        }
        orchestrator.login(&Credentials::new("ada", "hunter2")).await?;
    }
    println!("signed in as {:?}", orchestrator.current_session().and_then(|s| s.attribute("username").cloned()));

    // The server revokes the current credential; the client refreshes and replays.
    let api = Arc::new(DemoApi::default());
    if let Some(token) = orchestrator.access_token() {
        api.revoke(&token);
    }
    let client = AuthorizedClient::new(Arc::clone(&api), Arc::clone(orchestrator));
    let response = client.send(HttpRequest::get("https://api.example.test/me")).await?;
    println!("GET /me -> {} {}", response.status, response.text());

    orchestrator.activity_bus().input(InputKind::Keyboard);

    let mut preferences = PreferencePatch::new();
    preferences.insert("theme".into(), json!("dark"));
    orchestrator.update_preferences(&preferences).await?;

    orchestrator.logout().await;
    println!("signed out");
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing();
    let orchestrator = orchestrator(std::env::temp_dir().join("vigil-console-session"));
    run(&orchestrator).await?;
    orchestrator.shutdown();
    Ok(())
}
