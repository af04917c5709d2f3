//! Callbacks from the scheduler back into its owner.

use std::fmt;
use std::future::Future;

/// Why the scheduler is ending the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogoutReason {
    /// The user picked "log out" in the warning.
    UserRequested,
    /// The inactivity deadline passed.
    Inactivity,
    /// Credentials could not be renewed.
    RefreshFailed,
}

impl LogoutReason {
    /// `true` if the user should be shown the "session expired" alert.
    /// A logout the user asked for needs no explanation.
    pub fn notifies_user(self) -> bool {
        !matches!(self, Self::UserRequested)
    }
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::UserRequested => "user requested",
            Self::Inactivity => "inactivity",
            Self::RefreshFailed => "refresh failed",
        };
        f.write_str(text)
    }
}

/// What the scheduler asks its owner to do.
///
/// The owner is usually the session orchestrator. Hooks run in their own
/// task, so a `force_logout` that stops the scheduler does not cancel
/// itself halfway.
pub trait SchedulerHooks: Send + Sync + 'static {
    /// Tear the session down.
    fn force_logout(&self, reason: LogoutReason) -> impl Future<Output = ()> + Send;

    /// Send a best-effort keep-alive.
    fn send_heartbeat(&self) -> impl Future<Output = ()> + Send;
}
