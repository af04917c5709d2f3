//! End-to-end tests for the session orchestrator: rehydration, login,
//! logout, the request hooks, and the inactivity wiring.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde_json::json;
use vigil::prelude::*;
use vigil_protocol::{Codec, JsonCodec, TokenPair};
use vigil_session::SessionPatch;

// =========================================================================
// Mocks
// =========================================================================

fn jwt(iat: i64) -> String {
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"ada","iat":{iat}}}"#));
    format!("e30.{payload}.sig")
}

fn fresh_token() -> String {
    jwt(Utc::now().timestamp())
}

fn stale_token() -> String {
    jwt(Utc::now().timestamp() - 3600)
}

#[derive(Default)]
struct MockBackend {
    reject_login: AtomicBool,
    fail_refresh: AtomicBool,
    fail_best_effort: AtomicBool,
    refresh_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    heartbeat_calls: AtomicUsize,
    preference_patches: Mutex<Vec<PreferencePatch>>,
}

impl MockBackend {
    fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

impl AuthBackend for MockBackend {
    async fn login(&self, credentials: &Credentials) -> Result<Session, BackendError> {
        if self.reject_login.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected {
                status: 401,
                message: "bad credentials".into(),
            });
        }
        Ok(Session::new(fresh_token(), "r-0").with_attribute("name", credentials.username.clone()))
    }

    async fn logout(&self, _session: Option<&Session>) -> Result<(), BackendError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_best_effort.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable("offline".into()));
        }
        Ok(())
    }

    async fn refresh(
        &self,
        _now: DateTime<Utc>,
        _refresh_token: &RefreshToken,
    ) -> Result<TokenPair, BackendError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(100)).await;
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected {
                status: 401,
                message: "refresh revoked".into(),
            });
        }
        Ok(TokenPair {
            access_token: AccessToken::new(format!("{}-{n}", fresh_token())),
            refresh_token: RefreshToken::new(format!("r-{n}")),
        })
    }

    async fn heartbeat(&self, _access_token: &AccessToken) -> Result<(), BackendError> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_best_effort.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable("offline".into()));
        }
        Ok(())
    }

    async fn update_preferences(
        &self,
        _access_token: &AccessToken,
        patch: &PreferencePatch,
    ) -> Result<(), BackendError> {
        self.preference_patches.lock().unwrap().push(patch.clone());
        if self.fail_best_effort.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable("offline".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockPresenter {
    expired: AtomicUsize,
}

impl AlertPresenter for MockPresenter {
    async fn show_warning(&self, _prompt: WarningPrompt) -> WarningDecision {
        std::future::pending().await
    }

    async fn show_expired(&self) {
        self.expired.fetch_add(1, Ordering::SeqCst);
    }

    fn show_info(&self, _message: &str) {}
}

/// API server stand-in. Scripted statuses are used first; after that it
/// answers 401 to revoked bearers and 200 to everything else.
#[derive(Default)]
struct MockApi {
    statuses: Mutex<VecDeque<u16>>,
    revoked: Mutex<HashSet<String>>,
    seen: Mutex<Vec<HttpRequest>>,
}

impl MockApi {
    fn script(&self, statuses: &[u16]) {
        self.statuses.lock().unwrap().extend(statuses);
    }

    fn revoke(&self, token: &str) {
        self.revoked.lock().unwrap().insert(token.to_owned());
    }

    fn seen(&self) -> Vec<HttpRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl HttpClient for MockApi {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.seen.lock().unwrap().push(request.clone());
        let scripted = self.statuses.lock().unwrap().pop_front();
        let status = scripted.unwrap_or_else(|| {
            let revoked = self.revoked.lock().unwrap();
            match request.bearer() {
                Some(token) if revoked.contains(token) => 401,
                _ => 200,
            }
        });
        Ok(HttpResponse::new(status, "body"))
    }
}

// =========================================================================
// Fixture
// =========================================================================

type Orchestrator = SessionOrchestrator<Arc<MockBackend>, Arc<MemoryStore>, Arc<MockPresenter>>;

const SESSION_KEY: &str = "vigil.session";
const ACTIVITY_KEY: &str = "vigil.last_activity";

struct Fixture {
    orchestrator: Arc<Orchestrator>,
    backend: Arc<MockBackend>,
    store: Arc<MemoryStore>,
    presenter: Arc<MockPresenter>,
}

fn fixture() -> Fixture {
    let backend = Arc::new(MockBackend::default());
    let store = Arc::new(MemoryStore::new());
    let presenter = Arc::new(MockPresenter::default());
    let orchestrator = SessionOrchestrator::builder().build(
        Arc::clone(&backend),
        Arc::clone(&store),
        Arc::clone(&presenter),
    );
    Fixture {
        orchestrator,
        backend,
        store,
        presenter,
    }
}

fn persist(store: &MemoryStore, session: &Session) {
    store.insert(SESSION_KEY, JsonCodec.encode(session).unwrap());
}

fn persisted(store: &MemoryStore) -> Option<Session> {
    store
        .get(SESSION_KEY)
        .map(|bytes| JsonCodec.decode(&bytes).unwrap())
}

type Client = AuthorizedClient<Arc<MockApi>, Arc<MockBackend>, Arc<MemoryStore>, Arc<MockPresenter>>;

fn client(fx: &Fixture, api: &Arc<MockApi>) -> Client {
    AuthorizedClient::new(Arc::clone(api), Arc::clone(&fx.orchestrator))
}

async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

async fn logged_in() -> Fixture {
    let fx = fixture();
    fx.orchestrator
        .login(&Credentials::new("ada", "secret"))
        .await
        .unwrap();
    fx
}

// =========================================================================
// Rehydration
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_initialize_without_record_is_signed_out() {
    let fx = fixture();

    assert_eq!(fx.orchestrator.initialize().await, InitOutcome::SignedOut);

    assert!(!fx.orchestrator.is_authenticated());
    assert!(!fx.orchestrator.snapshot().is_loading);
    assert!(!fx.orchestrator.scheduler().is_running());
}

#[tokio::test(start_paused = true)]
async fn test_initialize_discards_unparseable_record() {
    let fx = fixture();
    fx.store.insert(SESSION_KEY, b"{not json".to_vec());

    assert_eq!(fx.orchestrator.initialize().await, InitOutcome::Discarded);

    assert!(!fx.orchestrator.is_authenticated());
    assert!(fx.store.get(SESSION_KEY).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_initialize_discards_record_without_access_token() {
    let fx = fixture();
    fx.store
        .insert(SESSION_KEY, br#"{"name":"ada","refresh_token":"r"}"#.to_vec());

    assert_eq!(fx.orchestrator.initialize().await, InitOutcome::Discarded);

    assert!(!fx.orchestrator.is_authenticated());
    assert!(fx.store.get(SESSION_KEY).is_none());
    assert_eq!(fx.backend.refresh_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_initialize_with_valid_credential_skips_refresh() {
    let fx = fixture();
    persist(&fx.store, &Session::new(fresh_token(), "r-0"));

    assert_eq!(fx.orchestrator.initialize().await, InitOutcome::Rehydrated);
    assert!(fx.orchestrator.is_authenticated());
    assert!(fx.orchestrator.scheduler().is_running());

    settle().await;
    assert_eq!(fx.backend.refresh_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_initialize_with_expired_credential_refreshes_once() {
    let fx = fixture();
    let stored = Session::new(stale_token(), "r-0").with_attribute("name", "ada");
    persist(&fx.store, &stored);

    assert_eq!(fx.orchestrator.initialize().await, InitOutcome::Rehydrated);
    // Optimistic: authenticated before the check completes.
    assert!(fx.orchestrator.is_authenticated());

    settle().await;
    assert_eq!(fx.backend.refresh_calls(), 1);
    let session = fx.orchestrator.current_session().unwrap();
    assert_eq!(session.refresh_token.as_str(), "r-1");
    assert_eq!(session.attribute("name"), Some(&json!("ada")));
    assert_eq!(persisted(&fx.store), Some(session));
}

#[tokio::test(start_paused = true)]
async fn test_initialize_with_unrenewable_credential_logs_out() {
    let fx = fixture();
    fx.backend.fail_refresh.store(true, Ordering::SeqCst);
    persist(&fx.store, &Session::new(stale_token(), "r-0"));

    assert_eq!(fx.orchestrator.initialize().await, InitOutcome::Rehydrated);
    settle().await;

    assert!(!fx.orchestrator.is_authenticated());
    assert!(fx.store.is_empty());
    assert!(!fx.orchestrator.scheduler().is_running());
    assert_eq!(
        fx.orchestrator.take_expired_notice(),
        Some(ExpiredNotice::RefreshFailed)
    );
}

// =========================================================================
// Login / logout
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_login_persists_and_starts_scheduler() {
    let fx = fixture();

    let session = fx
        .orchestrator
        .login(&Credentials::new("ada", "secret"))
        .await
        .unwrap();

    assert!(fx.orchestrator.is_authenticated());
    assert_eq!(fx.orchestrator.current_session(), Some(session.clone()));
    assert_eq!(persisted(&fx.store), Some(session));
    assert!(fx.orchestrator.scheduler().is_running());
    assert_eq!(fx.orchestrator.scheduler().phase(), SchedulerPhase::Active);
    assert!(fx.orchestrator.snapshot().timers_armed());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_login_changes_nothing() {
    let fx = fixture();
    fx.backend.reject_login.store(true, Ordering::SeqCst);

    let err = fx
        .orchestrator
        .login(&Credentials::new("ada", "wrong"))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        VigilError::Session(SessionError::AuthenticationRejected("bad credentials".into()))
    );
    assert!(!fx.orchestrator.is_authenticated());
    assert!(fx.store.is_empty());
    assert!(!fx.orchestrator.scheduler().is_running());
}

#[tokio::test(start_paused = true)]
async fn test_logout_is_unconditional() {
    let fx = logged_in().await;
    fx.backend.fail_best_effort.store(true, Ordering::SeqCst);
    settle().await;
    assert!(fx.store.get(ACTIVITY_KEY).is_some());

    fx.orchestrator.logout().await;

    assert!(!fx.orchestrator.is_authenticated());
    assert!(fx.store.is_empty(), "session and activity records removed");
    assert!(!fx.orchestrator.scheduler().is_running());
    assert!(!fx.orchestrator.snapshot().is_logging_out);
    assert!(!fx.orchestrator.snapshot().timers_armed());
    assert_eq!(fx.backend.logout_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_logout_twice_pings_backend_once() {
    let fx = logged_in().await;

    fx.orchestrator.logout().await;
    fx.orchestrator.logout().await;

    assert_eq!(fx.backend.logout_calls.load(Ordering::SeqCst), 1);
    assert!(!fx.orchestrator.is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_user_logout_leaves_no_notice() {
    let fx = logged_in().await;

    fx.orchestrator.logout().await;

    assert_eq!(fx.orchestrator.take_expired_notice(), None);
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_see_login_and_logout() {
    let fx = fixture();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = fx
        .orchestrator
        .subscribe(move |snapshot| sink.lock().unwrap().push(snapshot.is_authenticated()));

    fx.orchestrator
        .login(&Credentials::new("ada", "secret"))
        .await
        .unwrap();
    fx.orchestrator.logout().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&true));
    assert_eq!(seen.last(), Some(&false));
}

// =========================================================================
// Inactivity wiring
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_inactivity_forces_logout_with_notice() {
    let fx = logged_in().await;

    tokio::time::sleep(Duration::from_secs(60 * 60 + 1)).await;

    assert!(!fx.orchestrator.is_authenticated());
    assert!(fx.store.is_empty());
    assert!(!fx.orchestrator.scheduler().is_running());
    assert_eq!(fx.presenter.expired.load(Ordering::SeqCst), 1);
    assert_eq!(
        fx.orchestrator.take_expired_notice(),
        Some(ExpiredNotice::Inactivity)
    );
    assert_eq!(fx.orchestrator.take_expired_notice(), None);
    // Heartbeats from 10 min on reached the backend through the hooks.
    assert!(fx.backend.heartbeat_calls.load(Ordering::SeqCst) >= 5);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_keeps_persisted_session() {
    let fx = logged_in().await;

    fx.orchestrator.shutdown();

    assert!(!fx.orchestrator.scheduler().is_running());
    assert!(persisted(&fx.store).is_some());
}

// =========================================================================
// Best-effort calls
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_heartbeat_failure_is_swallowed() {
    let fx = logged_in().await;
    fx.backend.fail_best_effort.store(true, Ordering::SeqCst);

    fx.orchestrator.send_heartbeat().await;

    assert_eq!(fx.backend.heartbeat_calls.load(Ordering::SeqCst), 1);
    assert!(fx.orchestrator.is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_without_session_is_skipped() {
    let fx = fixture();
    fx.orchestrator.send_heartbeat().await;
    assert_eq!(fx.backend.heartbeat_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_update_preferences_merges_persists_and_syncs() {
    let fx = logged_in().await;
    fx.backend.fail_best_effort.store(true, Ordering::SeqCst);
    let mut patch = PreferencePatch::new();
    patch.insert("dark_mode".into(), json!(true));

    let session = fx.orchestrator.update_preferences(&patch).await.unwrap();

    assert_eq!(
        session.preferences().and_then(|p| p.get("dark_mode")),
        Some(&json!(true))
    );
    assert_eq!(persisted(&fx.store), Some(session.clone()));
    assert_eq!(fx.orchestrator.current_session(), Some(session));
    assert_eq!(*fx.backend.preference_patches.lock().unwrap(), vec![patch]);
}

#[tokio::test(start_paused = true)]
async fn test_update_preferences_requires_session() {
    let fx = fixture();
    let err = fx
        .orchestrator
        .update_preferences(&PreferencePatch::new())
        .await
        .unwrap_err();
    assert_eq!(err, VigilError::Session(SessionError::NotAuthenticated));
}

// =========================================================================
// Request hooks
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_prepare_request_attaches_bearer() {
    let fx = logged_in().await;
    let token = fx.orchestrator.access_token().unwrap();

    let mut request = HttpRequest::get("http://api/items");
    fx.orchestrator.prepare_request(&mut request).unwrap();

    assert_eq!(request.bearer(), Some(token.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_prepare_request_keeps_existing_authorization() {
    let fx = logged_in().await;

    let mut request = HttpRequest::get("http://api/items").with_bearer("service-key");
    fx.orchestrator.prepare_request(&mut request).unwrap();

    assert_eq!(request.bearer(), Some("service-key"));
}

#[tokio::test(start_paused = true)]
async fn test_requests_rejected_while_logging_out() {
    let fx = logged_in().await;
    let api = Arc::new(MockApi::default());
    fx.orchestrator
        .state()
        .set_state(SessionPatch::new().logging_out(true));

    let err = client(&fx, &api)
        .send(HttpRequest::get("http://api/items"))
        .await
        .unwrap_err();

    assert_eq!(err, VigilError::RequestRejected);
    assert!(api.seen().is_empty(), "request never left the process");
}

#[tokio::test(start_paused = true)]
async fn test_401_refreshes_once_and_replays() {
    let fx = logged_in().await;
    let api = Arc::new(MockApi::default());
    let original = fx.orchestrator.access_token().unwrap();
    api.revoke(original.as_str());

    let response = client(&fx, &api)
        .send(HttpRequest::get("http://api/items"))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(fx.backend.refresh_calls(), 1);
    let seen = api.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].bearer(), Some(original.as_str()));
    assert!(!seen[0].retried);
    assert_eq!(seen[1].id, seen[0].id);
    assert!(seen[1].retried);
    assert_eq!(
        seen[1].bearer(),
        fx.orchestrator.access_token().as_ref().map(AccessToken::as_str)
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_401s_share_one_refresh() {
    let fx = logged_in().await;
    let api = Arc::new(MockApi::default());
    api.revoke(fx.orchestrator.access_token().unwrap().as_str());
    let client = client(&fx, &api);

    let (a, b, c) = tokio::join!(
        client.send(HttpRequest::get("http://api/a")),
        client.send(HttpRequest::get("http://api/b")),
        client.send(HttpRequest::get("http://api/c")),
    );

    assert_eq!(a.unwrap().status, 200);
    assert_eq!(b.unwrap().status, 200);
    assert_eq!(c.unwrap().status, 200);
    assert_eq!(fx.backend.refresh_calls(), 1);
    assert_eq!(api.seen().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_401_after_relogin_does_not_reuse_earlier_refresh() {
    let fx = logged_in().await;
    let stale = tokio::spawn(fx.orchestrator.coordinator().refresh());
    tokio::time::sleep(Duration::from_millis(10)).await;

    fx.orchestrator.logout().await;
    fx.orchestrator
        .login(&Credentials::new("bob", "secret"))
        .await
        .unwrap();
    let api = Arc::new(MockApi::default());
    api.script(&[401]);

    let response = client(&fx, &api)
        .send(HttpRequest::get("http://api/items"))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(stale.await.unwrap(), Err(SessionError::LoggingOut));
    assert_eq!(fx.backend.refresh_calls(), 2, "bob got his own exchange");
    let live = fx.orchestrator.current_session().unwrap();
    assert_eq!(live.attribute("name"), Some(&json!("bob")));
    assert!(live.access_token.as_str().ends_with("-2"));
    assert_eq!(api.seen()[1].bearer(), Some(live.access_token.as_str()));
    assert_eq!(persisted(&fx.store), Some(live));
}

#[tokio::test(start_paused = true)]
async fn test_preference_update_during_refresh_is_kept() {
    let fx = logged_in().await;
    let pending = tokio::spawn(fx.orchestrator.coordinator().refresh());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut patch = PreferencePatch::new();
    patch.insert("lang".into(), json!("de"));
    fx.orchestrator.update_preferences(&patch).await.unwrap();
    let renewed = pending.await.unwrap().unwrap();

    let lang = |s: &Session| s.preferences().and_then(|p| p.get("lang")).cloned();
    assert_eq!(lang(&renewed), Some(json!("de")));
    assert!(renewed.access_token.as_str().ends_with("-1"));
    assert_eq!(fx.orchestrator.current_session(), Some(renewed.clone()));
    assert_eq!(persisted(&fx.store), Some(renewed));
}

#[tokio::test(start_paused = true)]
async fn test_401_after_replay_logs_out() {
    let fx = logged_in().await;
    let api = Arc::new(MockApi::default());
    api.script(&[401, 401]);

    let err = client(&fx, &api)
        .send(HttpRequest::get("http://api/items"))
        .await
        .unwrap_err();

    assert_eq!(err, VigilError::Unauthorized);
    assert_eq!(fx.backend.refresh_calls(), 1, "no second refresh");
    assert_eq!(api.seen().len(), 2);
    assert!(!fx.orchestrator.is_authenticated());
    assert_eq!(
        fx.orchestrator.take_expired_notice(),
        Some(ExpiredNotice::RefreshFailed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_401_with_failed_refresh_logs_out() {
    let fx = logged_in().await;
    fx.backend.fail_refresh.store(true, Ordering::SeqCst);
    let api = Arc::new(MockApi::default());
    api.script(&[401]);

    let err = client(&fx, &api)
        .send(HttpRequest::get("http://api/items"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        VigilError::Session(SessionError::RefreshFailed(_))
    ));
    assert_eq!(api.seen().len(), 1, "nothing replayed");
    assert!(!fx.orchestrator.is_authenticated());
    assert!(fx.store.is_empty());
    assert_eq!(
        fx.orchestrator.take_expired_notice(),
        Some(ExpiredNotice::RefreshFailed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_401_without_session_is_delivered() {
    let fx = fixture();
    let api = Arc::new(MockApi::default());
    api.script(&[401]);

    let response = client(&fx, &api)
        .send(HttpRequest::get("http://api/public"))
        .await
        .unwrap();

    assert_eq!(response.status, 401);
    assert_eq!(fx.backend.refresh_calls(), 0);
    assert_eq!(fx.orchestrator.take_expired_notice(), None);
}
