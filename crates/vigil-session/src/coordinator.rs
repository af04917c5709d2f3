//! Access-credential validity and the single-flight refresh exchange.
//!
//! # Single flight
//!
//! Three different parts of the app can decide the access credential needs
//! renewing: the scheduler's periodic tick, the 401 interceptor, and the
//! user pressing "continue" on the expiry warning. They can all do so at
//! once. The refresh credential is rotated by every exchange, so two
//! concurrent exchanges would race and the loser would hold a revoked
//! credential.
//!
//! [`TokenCoordinator::refresh`] therefore keeps at most one exchange in
//! flight for the whole process. The first caller creates it and parks a
//! [`Shared`] handle to it in a slot; every later caller clones that handle
//! and awaits the same outcome. The exchange clears the slot itself when it
//! finishes, so the next refresh after that starts fresh.
//!
//! An exchange belongs to the session [epoch](crate::SessionSnapshot::epoch)
//! it started in. A caller in a later epoch never joins it, and its result
//! is only written into the live session and the store if that epoch is
//! still current. The new pair is applied to the session as it is *then*,
//! so changes made during the exchange survive.
//!
//! ```text
//! caller A ──┐
//! caller B ──┼──► [ in-flight slot ] ──► one backend.refresh() ──► same Result
//! caller C ──┘
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tracing::{debug, warn};
use vigil_protocol::{
    Codec, IssuedAtExtractor, JsonCodec, RefreshToken, Session, UnverifiedClaims,
};

use crate::{AuthBackend, PersistedStore, SessionError, SessionPatch, SessionState};

/// Default storage key for the persisted session record.
pub const DEFAULT_SESSION_KEY: &str = "vigil.session";

/// Default lifetime of an access credential, counted from its issued-at.
pub const DEFAULT_ACCESS_VALIDITY: Duration = Duration::from_secs(60);

/// Settings for a [`TokenCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Storage key the session record is written under.
    pub session_key: String,
    /// How long an access credential is trusted after its issued-at.
    pub access_validity: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            session_key: DEFAULT_SESSION_KEY.to_owned(),
            access_validity: DEFAULT_ACCESS_VALIDITY,
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Session, SessionError>>>;

struct InFlight {
    id: u64,
    epoch: u64,
    exchange: SharedRefresh,
}

/// Decides whether the access credential is still good and renews it.
pub struct TokenCoordinator<B, S> {
    backend: Arc<B>,
    store: Arc<S>,
    state: SessionState,
    codec: JsonCodec,
    extractor: Arc<dyn IssuedAtExtractor>,
    config: CoordinatorConfig,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    next_flight: AtomicU64,
    /// Held across every write of the session record.
    records: Arc<tokio::sync::Mutex<()>>,
}

impl<B, S> std::fmt::Debug for TokenCoordinator<B, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCoordinator")
            .field("config", &self.config)
            .field("refresh_in_flight", &lock(&self.in_flight).is_some())
            .finish_non_exhaustive()
    }
}

impl<B: AuthBackend, S: PersistedStore> TokenCoordinator<B, S> {
    /// Creates a coordinator reading issued-at claims with
    /// [`UnverifiedClaims`].
    pub fn new(
        backend: Arc<B>,
        store: Arc<S>,
        state: SessionState,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            backend,
            store,
            state,
            codec: JsonCodec,
            extractor: Arc::new(UnverifiedClaims),
            config,
            in_flight: Arc::new(Mutex::new(None)),
            next_flight: AtomicU64::new(1),
            records: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Replaces the issued-at reader (builder style).
    #[must_use]
    pub fn with_extractor(mut self, extractor: impl IssuedAtExtractor) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Validity
    // -----------------------------------------------------------------------

    /// `true` if the current access credential is still inside its
    /// validity window.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// [`is_valid`](Self::is_valid) against an explicit clock.
    ///
    /// Valid means `now < issued_at + access_validity`. No session, an
    /// unreadable credential, or a missing claim all count as invalid.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let snapshot = self.state.get_state();
        let Some(token) = snapshot.access_token() else {
            return false;
        };

        let issued_at = match self.extractor.extract_issued_at(token.as_str()) {
            Ok(at) => at,
            Err(e) => {
                debug!(error = %e, "access credential unreadable, treating as expired");
                return false;
            }
        };
        let Ok(validity) = TimeDelta::from_std(self.config.access_validity) else {
            return false;
        };
        issued_at
            .checked_add_signed(validity)
            .is_some_and(|expires_at| now < expires_at)
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// `true` while an exchange is outstanding.
    pub fn is_refresh_in_flight(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    /// Forgets the exchange in flight, if any. Its callers still get its
    /// result, but later callers start a new exchange.
    pub fn abandon_refresh(&self) {
        if let Some(flight) = lock(&self.in_flight).take() {
            debug!(flight = flight.id, "refresh abandoned");
        }
    }

    /// Exchanges the refresh credential for a new pair, persists the
    /// renewed session, and publishes it to the state.
    ///
    /// Concurrent callers share one exchange and all receive its result.
    ///
    /// # Errors
    /// - [`SessionError::NoRefreshCredential`]: no session, or a blank
    ///   refresh credential.
    /// - [`SessionError::RefreshFailed`]: the backend refused or could not
    ///   be reached. The caller must force a logout.
    /// - [`SessionError::LoggingOut`]: a logout began, or another sign-in
    ///   replaced the session, before or during the exchange. Nothing was
    ///   written.
    pub fn refresh(
        &self,
    ) -> impl Future<Output = Result<Session, SessionError>> + Send + use<B, S> {
        self.refresh_at(Utc::now())
    }

    /// [`refresh`](Self::refresh) reporting `now` to the backend.
    ///
    /// A caller joining an exchange already in flight gets that exchange's
    /// result; its own `now` is not used.
    pub fn refresh_at(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Session, SessionError>> + Send + use<B, S> {
        let mut slot = lock(&self.in_flight);
        let epoch = self.state.get_state().epoch;
        if let Some(flight) = slot.as_ref() {
            if flight.epoch == epoch {
                debug!(flight = flight.id, "joining in-flight refresh");
                return flight.exchange.clone();
            }
            debug!(flight = flight.id, "in-flight refresh belongs to an earlier session");
        }

        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let exchange = Exchange {
            backend: Arc::clone(&self.backend),
            store: Arc::clone(&self.store),
            state: self.state.clone(),
            codec: self.codec,
            session_key: self.config.session_key.clone(),
            records: Arc::clone(&self.records),
        };
        let in_flight = Arc::clone(&self.in_flight);

        let shared = async move {
            let result = exchange.run(now, epoch).await;
            let mut slot = lock(&in_flight);
            if slot.as_ref().is_some_and(|f| f.id == id) {
                *slot = None;
            }
            result
        }
        .boxed()
        .shared();

        debug!(flight = id, "starting refresh");
        *slot = Some(InFlight {
            id,
            epoch,
            exchange: shared.clone(),
        });
        shared
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Reads the persisted session.
    ///
    /// # Errors
    /// [`SessionError::MalformedPersistedSession`] if the record does not
    /// decode or fails validation; [`SessionError::Storage`] if the store
    /// could not be read.
    pub async fn load_session(&self) -> Result<Option<Session>, SessionError> {
        let Some(bytes) = self.store.load(&self.config.session_key).await? else {
            return Ok(None);
        };
        let session: Session = self
            .codec
            .decode(&bytes)
            .map_err(|e| SessionError::MalformedPersistedSession(e.to_string()))?;
        session
            .validate()
            .map_err(|e| SessionError::MalformedPersistedSession(e.to_string()))?;
        Ok(Some(session))
    }

    /// Writes `session` under the session key.
    pub async fn persist_session(&self, session: &Session) -> Result<(), SessionError> {
        let _records = self.records.lock().await;
        let bytes = self.codec.encode(session)?;
        self.store.save(&self.config.session_key, bytes).await
    }

    /// Persists `session` and publishes it as a new sign-in, as one step
    /// with respect to other record writes.
    pub async fn sign_in(&self, session: &Session) -> Result<(), SessionError> {
        let _records = self.records.lock().await;
        let bytes = self.codec.encode(session)?;
        self.store.save(&self.config.session_key, bytes).await?;
        self.state.set_state(
            SessionPatch::new()
                .sign_in(session.clone())
                .loading(false)
                .logging_out(false),
        );
        Ok(())
    }

    /// Writes the live session if it still belongs to `epoch`.
    ///
    /// # Errors
    /// [`SessionError::LoggingOut`] if a logout began or another sign-in
    /// replaced the session; nothing is written then.
    pub async fn persist_live(&self, epoch: u64) -> Result<Session, SessionError> {
        persist_live(
            &*self.store,
            &self.records,
            self.codec,
            &self.state,
            &self.config.session_key,
            epoch,
        )
        .await
    }

    /// Deletes the session record only.
    pub async fn forget_session(&self) -> Result<(), SessionError> {
        let _records = self.records.lock().await;
        self.store.remove(&self.config.session_key).await
    }

    /// Deletes every record the store holds.
    pub async fn clear_records(&self) -> Result<(), SessionError> {
        let _records = self.records.lock().await;
        self.store.clear().await
    }
}

async fn persist_live<S: PersistedStore>(
    store: &S,
    records: &tokio::sync::Mutex<()>,
    codec: JsonCodec,
    state: &SessionState,
    key: &str,
    epoch: u64,
) -> Result<Session, SessionError> {
    let _records = records.lock().await;
    let snapshot = state.get_state();
    let session = match snapshot.session.as_ref() {
        Some(session) if snapshot.epoch == epoch && !snapshot.is_logging_out => session.clone(),
        _ => return Err(SessionError::LoggingOut),
    };
    store.save(key, codec.encode(&session)?).await?;
    Ok(session)
}

/// Everything one refresh exchange needs, owned so the future is `'static`.
struct Exchange<B, S> {
    backend: Arc<B>,
    store: Arc<S>,
    state: SessionState,
    codec: JsonCodec,
    session_key: String,
    records: Arc<tokio::sync::Mutex<()>>,
}

impl<B: AuthBackend, S: PersistedStore> Exchange<B, S> {
    async fn run(self, now: DateTime<Utc>, epoch: u64) -> Result<Session, SessionError> {
        let snapshot = self.state.get_state();
        if snapshot.epoch != epoch {
            return Err(SessionError::LoggingOut);
        }
        let refresh_token = match snapshot.session.as_ref() {
            Some(session) if !session.refresh_token.is_empty() => session.refresh_token.clone(),
            _ => return Err(SessionError::NoRefreshCredential),
        };
        if snapshot.is_logging_out {
            return Err(SessionError::LoggingOut);
        }

        self.state.set_state(SessionPatch::new().refreshing(true));
        let result = self.renew(now, epoch, &refresh_token).await;

        match &result {
            Ok(_) => debug!("refresh succeeded"),
            Err(e) => {
                warn!(error = %e, "refresh failed");
                // A later epoch owns the flag.
                self.state.set_state_if(|snap| {
                    (snap.epoch == epoch).then(|| SessionPatch::new().refreshing(false))
                });
            }
        }
        result
    }

    async fn renew(
        &self,
        now: DateTime<Utc>,
        epoch: u64,
        refresh_token: &RefreshToken,
    ) -> Result<Session, SessionError> {
        let pair = self
            .backend
            .refresh(now, refresh_token)
            .await
            .map_err(|e| SessionError::RefreshFailed(e.to_string()))?;

        let applied = self.state.set_state_if(|snap| {
            if snap.epoch != epoch || snap.is_logging_out {
                return None;
            }
            let renewed = snap.session.as_ref()?.with_tokens(pair);
            Some(SessionPatch::new().session(Some(renewed)).refreshing(false))
        });
        if applied.is_none() {
            return Err(SessionError::LoggingOut);
        }

        match persist_live(
            &*self.store,
            &self.records,
            self.codec,
            &self.state,
            &self.session_key,
            epoch,
        )
        .await
        {
            Ok(session) => Ok(session),
            Err(SessionError::LoggingOut) => Err(SessionError::LoggingOut),
            Err(e) => {
                // The backend already rotated the pair; keep it in memory.
                warn!(error = %e, "could not persist refreshed session");
                let snapshot = self.state.get_state();
                match snapshot.session.as_ref() {
                    Some(session) if snapshot.epoch == epoch => Ok(session.clone()),
                    _ => Err(SessionError::LoggingOut),
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
