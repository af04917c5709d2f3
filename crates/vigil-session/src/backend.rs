//! The auth backend seam.
//!
//! Vigil never decides who a user is. It hands credentials to an
//! [`AuthBackend`] and keeps whatever session comes back. Production code
//! uses [`HttpAuthBackend`](crate::HttpAuthBackend); tests use a mock.

use std::future::Future;

use chrono::{DateTime, Utc};
use vigil_protocol::{AccessToken, Credentials, PreferencePatch, RefreshToken, Session, TokenPair};

use crate::BackendError;

/// The five calls Vigil makes to the authentication service.
///
/// # Trait bounds
///
/// - `Send + Sync + 'static` → the backend is shared behind an `Arc` by the
///   coordinator, the scheduler, and the orchestrator.
/// - Futures are `Send` → refreshes and heartbeats run in spawned tasks.
///
/// Only [`login`](Self::login) and [`refresh`](Self::refresh) have results
/// that change what Vigil does. The other three are best effort: their
/// errors are logged and dropped by the caller.
pub trait AuthBackend: Send + Sync + 'static {
    /// Exchanges credentials for a session.
    fn login(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Session, BackendError>> + Send;

    /// Tells the backend the session is over. `session` is `None` when the
    /// client logs out without one (e.g. after a failed rehydration).
    fn logout(
        &self,
        session: Option<&Session>,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Exchanges the refresh credential for a new pair. `now` is the
    /// client's wall-clock time, sent along for server-side skew checks.
    fn refresh(
        &self,
        now: DateTime<Utc>,
        refresh_token: &RefreshToken,
    ) -> impl Future<Output = Result<TokenPair, BackendError>> + Send;

    /// Keep-alive ping.
    fn heartbeat(
        &self,
        access_token: &AccessToken,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Pushes a preference change to the server.
    fn update_preferences(
        &self,
        access_token: &AccessToken,
        patch: &PreferencePatch,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

impl<B: AuthBackend> AuthBackend for std::sync::Arc<B> {
    fn login(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<Session, BackendError>> + Send {
        (**self).login(credentials)
    }

    fn logout(
        &self,
        session: Option<&Session>,
    ) -> impl Future<Output = Result<(), BackendError>> + Send {
        (**self).logout(session)
    }

    fn refresh(
        &self,
        now: DateTime<Utc>,
        refresh_token: &RefreshToken,
    ) -> impl Future<Output = Result<TokenPair, BackendError>> + Send {
        (**self).refresh(now, refresh_token)
    }

    fn heartbeat(
        &self,
        access_token: &AccessToken,
    ) -> impl Future<Output = Result<(), BackendError>> + Send {
        (**self).heartbeat(access_token)
    }

    fn update_preferences(
        &self,
        access_token: &AccessToken,
        patch: &PreferencePatch,
    ) -> impl Future<Output = Result<(), BackendError>> + Send {
        (**self).update_preferences(access_token, patch)
    }
}
