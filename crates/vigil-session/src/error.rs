//! Error types for the session layer.

use vigil_protocol::ProtocolError;

/// Errors returned by an [`AuthBackend`](crate::AuthBackend).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend answered and said no (bad credentials, revoked refresh
    /// credential, expired session).
    #[error("rejected by backend (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The backend could not be reached.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend answered with something we could not understand.
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

/// Errors that can occur during session management.
///
/// These cover the full lifecycle of a client session: rehydration, login,
/// refresh, best-effort pings, and persistence. `Clone` because one refresh
/// outcome is handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The persisted record is corrupt or has an unexpected shape.
    /// Callers treat this as "logged out" and clear storage.
    #[error("malformed persisted session: {0}")]
    MalformedPersistedSession(String),

    /// A refresh was requested but no refresh credential is held.
    #[error("no refresh credential available")]
    NoRefreshCredential,

    /// The refresh exchange was rejected or could not complete. The caller
    /// must force a logout.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// The login endpoint rejected the supplied credentials.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// A best-effort call (heartbeat, logout ping, preference sync) failed.
    /// Logged by the caller, never escalated.
    #[error("best-effort call failed: {0}")]
    Transient(String),

    /// Reading or writing the persisted record failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A logout is in progress; the operation was abandoned.
    #[error("logout in progress")]
    LoggingOut,

    /// The operation needs a live session and there is none.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Encoding or decoding session data failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
