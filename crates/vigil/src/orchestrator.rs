//! `SessionOrchestrator`: the one object the application talks to.
//!
//! It owns the session state, the token coordinator, and the inactivity
//! scheduler, and wires them together:
//!
//! ```text
//!                    ┌──────────────────────────┐
//!   login/logout ──► │   SessionOrchestrator    │ ◄── HTTP request/response hooks
//!                    └───┬──────────┬───────────┘
//!                        │          │  force_logout / send_heartbeat
//!                        ▼          ▼        (OrchestratorHooks)
//!               TokenCoordinator  InactivityScheduler ──► AlertPresenter
//!                        │          │
//!                        └──► SessionState ◄──┘
//! ```
//!
//! The scheduler holds a weak reference back to the orchestrator, so the
//! orchestrator is always built inside an `Arc` (see [`OrchestratorBuilder`]).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_activity::{
    ActivityBus, AlertPresenter, InactivityScheduler, InputKind, LogoutReason, SchedulerHooks,
};
use vigil_protocol::{AccessToken, Credentials, PreferencePatch, Session};
use vigil_session::{
    AuthBackend, PersistedStore, SessionError, SessionPatch, SessionSnapshot, SessionState,
    Subscription, TokenCoordinator,
};
use vigil_transport::{HttpRequest, HttpResponse};

use crate::client::ResponseAction;
use crate::notice::NoticeSlot;
use crate::{ExpiredNotice, VigilConfig, VigilError};

/// What [`SessionOrchestrator::initialize`] found in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Nothing was persisted.
    SignedOut,
    /// A record was persisted but unusable; it was removed.
    Discarded,
    /// A record was restored. Its credential is checked in the background.
    Rehydrated,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a [`SessionOrchestrator`].
///
/// ```rust,ignore
/// let orchestrator = SessionOrchestrator::builder()
///     .session_key("acme.session")
///     .build(backend, FileStore::new(dir), presenter);
/// orchestrator.initialize().await;
/// ```
#[derive(Debug, Default)]
pub struct OrchestratorBuilder {
    config: VigilConfig,
    bus: Option<ActivityBus>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: VigilConfig) -> Self {
        self.config = config;
        self
    }

    pub fn session_key(mut self, key: impl Into<String>) -> Self {
        self.config.session_key = key.into();
        self
    }

    pub fn activity_key(mut self, key: impl Into<String>) -> Self {
        self.config.activity_key = key.into();
        self
    }

    pub fn access_validity(mut self, validity: Duration) -> Self {
        self.config.access_validity = validity;
        self
    }

    /// Listens on an existing bus instead of creating one.
    pub fn activity_bus(mut self, bus: ActivityBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Builds the orchestrator. Nothing is read from storage until
    /// [`initialize`](SessionOrchestrator::initialize).
    pub fn build<B, S, P>(
        self,
        backend: B,
        store: S,
        presenter: P,
    ) -> Arc<SessionOrchestrator<B, S, P>>
    where
        B: AuthBackend,
        S: PersistedStore,
        P: AlertPresenter,
    {
        let config = self.config.validated();
        let state = SessionState::new();
        let coordinator = Arc::new(TokenCoordinator::new(
            Arc::new(backend),
            Arc::new(store),
            state.clone(),
            config.coordinator_config(),
        ));
        let bus = self.bus.unwrap_or_default();
        let presenter = Arc::new(presenter);

        Arc::new_cyclic(|weak| {
            let hooks = Arc::new(OrchestratorHooks {
                orchestrator: weak.clone(),
            });
            let scheduler =
                InactivityScheduler::new(Arc::clone(&coordinator), presenter, hooks, bus)
                    .with_activity_key(config.activity_key.clone());
            SessionOrchestrator {
                config,
                coordinator,
                state,
                scheduler,
                expired: NoticeSlot::default(),
                rehydration: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Top-level session manager. See the [module docs](self).
///
/// # Trait bounds
///
/// - `B: AuthBackend`: login, logout, refresh, heartbeat, preferences.
/// - `S: PersistedStore`: where the session and activity records live.
/// - `P: AlertPresenter`: the warning and expiry dialogs.
pub struct SessionOrchestrator<B, S, P> {
    config: VigilConfig,
    coordinator: Arc<TokenCoordinator<B, S>>,
    state: SessionState,
    scheduler: InactivityScheduler<B, S, P, OrchestratorHooks<B, S, P>>,
    expired: NoticeSlot,
    rehydration: Mutex<Option<JoinHandle<()>>>,
    /// Serializes login and logout.
    lifecycle: tokio::sync::Mutex<()>,
}

impl<B, S, P> std::fmt::Debug for SessionOrchestrator<B, S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl SessionOrchestrator<(), (), ()> {
    /// Starts building an orchestrator.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }
}

impl<B, S, P> SessionOrchestrator<B, S, P>
where
    B: AuthBackend,
    S: PersistedStore,
    P: AlertPresenter,
{
    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Restores the persisted session, if there is a usable one.
    ///
    /// Never fails. A missing record leaves the state signed out; an
    /// unreadable one is removed first. A valid record is trusted at once:
    /// the state becomes authenticated and the scheduler starts, and a
    /// background task then checks the access credential, refreshing it
    /// if it has expired and logging out if that refresh fails.
    pub async fn initialize(self: &Arc<Self>) -> InitOutcome {
        self.state.set_state(SessionPatch::new().loading(true));

        let session = match self.coordinator.load_session().await {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!("no persisted session");
                self.state.set_state(SessionPatch::new().loading(false));
                return InitOutcome::SignedOut;
            }
            Err(e) => {
                warn!(error = %e, "discarding persisted session");
                if let Err(e) = self.coordinator.forget_session().await {
                    warn!(error = %e, "could not remove persisted session");
                }
                self.state
                    .set_state(SessionPatch::new().session(None).loading(false));
                return InitOutcome::Discarded;
            }
        };

        info!("session rehydrated");
        let epoch = self
            .state
            .set_state(SessionPatch::new().sign_in(session).loading(false))
            .epoch;
        self.scheduler.start();

        let orchestrator = Arc::clone(self);
        let check = tokio::spawn(async move { orchestrator.verify_rehydrated(epoch).await });
        if let Some(previous) = lock(&self.rehydration).replace(check) {
            previous.abort();
        }
        InitOutcome::Rehydrated
    }

    async fn verify_rehydrated(&self, epoch: u64) {
        if self.coordinator.is_valid() {
            debug!("rehydrated access credential still valid");
            return;
        }
        debug!("rehydrated access credential expired, refreshing");
        match self.coordinator.refresh().await {
            Ok(_) => info!("rehydrated session renewed"),
            Err(SessionError::LoggingOut) => debug!("logout began during rehydration check"),
            Err(e) => {
                // A login or logout since startup owns the session now.
                if self.state.get_state().epoch != epoch {
                    debug!(error = %e, "rehydration check superseded");
                    return;
                }
                warn!(error = %e, "rehydrated session could not be renewed");
                self.force_logout(LogoutReason::RefreshFailed).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Login / logout
    // -----------------------------------------------------------------------

    /// Signs in, persists the session, and starts the inactivity clock.
    ///
    /// On failure nothing changes.
    ///
    /// # Errors
    /// - [`SessionError::AuthenticationRejected`] (wrapped) when the
    ///   backend refuses the credentials.
    /// - [`VigilError::Backend`] when it cannot be reached.
    /// - [`SessionError::Storage`] (wrapped) when the session cannot be
    ///   persisted.
    pub async fn login(&self, credentials: &Credentials) -> Result<Session, VigilError> {
        let _lifecycle = self.lifecycle.lock().await;

        let session = self
            .coordinator
            .backend()
            .login(credentials)
            .await
            .map_err(VigilError::from_login)?;
        session.validate()?;
        self.coordinator.sign_in(&session).await?;

        if self.scheduler.is_running() {
            self.scheduler.update_activity().await?;
        } else {
            self.scheduler.start();
        }
        info!(user = %credentials.username, "logged in");
        Ok(session)
    }

    /// Signs out. Safe to call at any time, any number of times.
    ///
    /// Marks the state as logging out (which blocks outgoing requests),
    /// stops the scheduler, tells the backend, then clears every persisted
    /// record and resets the state, whatever the backend said.
    pub async fn logout(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let snapshot = self
            .state
            .set_state(SessionPatch::new().logging_out(true));
        self.scheduler.stop();
        self.coordinator.abandon_refresh();

        if let Some(session) = snapshot.session.as_ref() {
            if let Err(e) = self.coordinator.backend().logout(Some(session)).await {
                warn!(error = %SessionError::Transient(e.to_string()), "logout ping failed");
            }
        }
        if let Err(e) = self.coordinator.clear_records().await {
            warn!(error = %e, "could not clear persisted records");
        }

        self.state.reset();
        info!("logged out");
    }

    /// Logs out on the system's initiative and leaves an
    /// [`ExpiredNotice`] for the login view (unless the user asked).
    pub async fn force_logout(&self, reason: LogoutReason) {
        info!(%reason, "forcing logout");
        if let Some(notice) = ExpiredNotice::for_reason(reason) {
            self.expired.set(notice);
        }
        self.logout().await;
    }

    // -----------------------------------------------------------------------
    // Best-effort calls
    // -----------------------------------------------------------------------

    /// Pings the backend so it knows the client is alive. Failures are
    /// logged, never returned.
    pub async fn send_heartbeat(&self) {
        let snapshot = self.state.get_state();
        if snapshot.is_logging_out {
            return;
        }
        let Some(token) = snapshot.access_token() else {
            debug!("no session, heartbeat skipped");
            return;
        };
        match self.coordinator.backend().heartbeat(token).await {
            Ok(()) => debug!("heartbeat sent"),
            Err(e) => warn!(error = %SessionError::Transient(e.to_string()), "heartbeat failed"),
        }
    }

    /// Merges `patch` into the live session's preferences and publishes
    /// it, persists the live session, then syncs the patch to the backend.
    /// The sync is best effort.
    ///
    /// # Errors
    /// [`SessionError::NotAuthenticated`] without a session,
    /// [`SessionError::LoggingOut`] during a logout, or a storage error.
    pub async fn update_preferences(
        &self,
        patch: &PreferencePatch,
    ) -> Result<Session, VigilError> {
        let mut refusal = SessionError::NotAuthenticated;
        let applied = self.state.set_state_if(|snap| {
            if snap.is_logging_out {
                refusal = SessionError::LoggingOut;
                return None;
            }
            let mut session = snap.session.clone()?;
            session.merge_preferences(patch);
            Some(SessionPatch::new().session(Some(session)))
        });
        let Some(snapshot) = applied else {
            return Err(refusal.into());
        };
        let session = self.coordinator.persist_live(snapshot.epoch).await?;

        if let Err(e) = self
            .coordinator
            .backend()
            .update_preferences(&session.access_token, patch)
            .await
        {
            warn!(error = %SessionError::Transient(e.to_string()), "preference sync failed");
        }
        Ok(session)
    }

    // -----------------------------------------------------------------------
    // Request hooks
    // -----------------------------------------------------------------------

    /// Outgoing-request hook.
    ///
    /// Attaches the access credential unless the request already carries
    /// an `Authorization` header, and counts the request as user activity.
    ///
    /// # Errors
    /// [`VigilError::RequestRejected`] while a logout is in progress.
    pub fn prepare_request(&self, request: &mut HttpRequest) -> Result<(), VigilError> {
        let snapshot = self.state.get_state();
        if snapshot.is_logging_out {
            debug!(request = %request.id, "request rejected during logout");
            return Err(VigilError::RequestRejected);
        }
        if let Some(token) = snapshot.access_token() {
            if !request.has_authorization() {
                request.set_bearer(token.as_str());
            }
            self.scheduler.notify_activity(InputKind::Request);
        }
        Ok(())
    }

    /// Incoming-response hook.
    ///
    /// A 401 on a first attempt triggers one credential refresh; the
    /// request comes back as [`ResponseAction::Replay`] carrying the new
    /// credential. Every other response is delivered as-is, including a
    /// 401 when no session is live.
    ///
    /// # Errors
    /// - [`VigilError::Unauthorized`]: 401 on a replayed request. The
    ///   session is logged out.
    /// - [`VigilError::Session`]: the refresh failed. The session is
    ///   logged out.
    /// - [`VigilError::RequestRejected`]: a logout began meanwhile.
    pub async fn intercept_response(
        &self,
        request: &HttpRequest,
        response: HttpResponse,
    ) -> Result<ResponseAction, VigilError> {
        if !response.is_unauthorized() {
            return Ok(ResponseAction::Deliver(response));
        }
        let snapshot = self.state.get_state();
        if snapshot.is_logging_out {
            return Err(VigilError::RequestRejected);
        }
        if !snapshot.is_authenticated() {
            return Ok(ResponseAction::Deliver(response));
        }
        if request.retried {
            warn!(request = %request.id, "401 after refresh, giving up");
            self.force_logout(LogoutReason::RefreshFailed).await;
            return Err(VigilError::Unauthorized);
        }

        debug!(request = %request.id, "401, refreshing credential");
        match self.coordinator.refresh().await {
            Ok(session) => {
                let mut replay = request.clone();
                replay.retried = true;
                replay.set_bearer(session.access_token.as_str());
                Ok(ResponseAction::Replay(replay))
            }
            Err(SessionError::LoggingOut) => Err(VigilError::RequestRejected),
            Err(e) => {
                warn!(error = %e, "refresh after 401 failed");
                self.force_logout(LogoutReason::RefreshFailed).await;
                Err(e.into())
            }
        }
    }
}

impl<B, S, P> SessionOrchestrator<B, S, P> {
    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.state.get_state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.get_state().is_authenticated()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.state.get_state().session.clone()
    }

    pub fn access_token(&self) -> Option<AccessToken> {
        self.state.get_state().access_token().cloned()
    }

    /// Calls `listener` with every new snapshot until the subscription is
    /// dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(
        &self,
        listener: impl Fn(&SessionSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        self.state.subscribe(listener)
    }

    /// Why the last session was ended for the user, if it was. Returns it
    /// once.
    pub fn take_expired_notice(&self) -> Option<ExpiredNotice> {
        self.expired.take()
    }

    /// Where the UI reports input and visibility changes.
    pub fn activity_bus(&self) -> &ActivityBus {
        self.scheduler.bus()
    }

    pub fn scheduler(&self) -> &InactivityScheduler<B, S, P, OrchestratorHooks<B, S, P>> {
        &self.scheduler
    }

    pub fn coordinator(&self) -> &Arc<TokenCoordinator<B, S>> {
        &self.coordinator
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &VigilConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Disposal
    // -----------------------------------------------------------------------

    /// Stops the scheduler and any background check. The persisted session
    /// stays, so the next start can rehydrate it.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        if let Some(check) = lock(&self.rehydration).take() {
            check.abort();
        }
        info!("session orchestrator shut down");
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// The scheduler's way back into its orchestrator.
///
/// Holds a weak reference: once the orchestrator is dropped, hooks do
/// nothing.
pub struct OrchestratorHooks<B, S, P> {
    orchestrator: Weak<SessionOrchestrator<B, S, P>>,
}

impl<B, S, P> SchedulerHooks for OrchestratorHooks<B, S, P>
where
    B: AuthBackend,
    S: PersistedStore,
    P: AlertPresenter,
{
    async fn force_logout(&self, reason: LogoutReason) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator.force_logout(reason).await;
        }
    }

    async fn send_heartbeat(&self) {
        if let Some(orchestrator) = self.orchestrator.upgrade() {
            orchestrator.send_heartbeat().await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
