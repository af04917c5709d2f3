//! Unified error type for Vigil.

use vigil_activity::SchedulerError;
use vigil_protocol::ProtocolError;
use vigil_session::{BackendError, SessionError};
use vigil_transport::TransportError;

/// Top-level error that wraps every layer's errors.
///
/// `#[from]` on each wrapping variant lets `?` convert sub-crate errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VigilError {
    /// Sending a request failed before any response arrived.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Encoding or decoding failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Session lifecycle failure (refresh, storage, authentication).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The auth backend could not be reached or answered nonsense.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The inactivity scheduler is not running.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A request was attempted while a logout is in progress. It never
    /// left the process.
    #[error("request rejected: logout in progress")]
    RequestRejected,

    /// The server answered 401 again after the credential was renewed.
    #[error("unauthorized after credential refresh")]
    Unauthorized,
}

impl VigilError {
    /// Maps a login failure: a refusal becomes
    /// [`SessionError::AuthenticationRejected`], anything else stays a
    /// backend error.
    pub(crate) fn from_login(error: BackendError) -> Self {
        match error {
            BackendError::Rejected { message, .. } => {
                Self::Session(SessionError::AuthenticationRejected(message))
            }
            other => Self::Backend(other),
        }
    }
}
