//! The UI seam for session alerts.
//!
//! Vigil decides *when* the user must be told something; the application
//! decides *how*. A desktop app might open a modal, a terminal app might
//! print and read a line, a test records the call. All of them implement
//! [`AlertPresenter`].

use std::future::Future;
use std::time::Duration;

/// What the user chose in the expiry warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningDecision {
    /// Keep the session: refresh credentials and reset the clock.
    Continue,
    /// End the session now.
    Logout,
}

/// Parameters for the expiry warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarningPrompt {
    /// Time left before the session expires on its own.
    pub remaining: Duration,
    /// Whether the prompt may be closed without answering. Always `false`:
    /// the user must pick [`Continue`](WarningDecision::Continue) or
    /// [`Logout`](WarningDecision::Logout).
    pub allow_dismiss: bool,
}

impl WarningPrompt {
    pub fn new(remaining: Duration) -> Self {
        Self {
            remaining,
            allow_dismiss: false,
        }
    }
}

/// Shows session alerts to the user.
///
/// # Trait bounds
///
/// - `Send + Sync + 'static` → the presenter is shared with the scheduler
///   task and outlives any single dialog.
/// - Dialog futures are `Send` → they run in their own spawned task so the
///   expiry timer keeps running while the user decides.
///
/// # Example
///
/// ```rust
/// use vigil_activity::{AlertPresenter, WarningDecision, WarningPrompt};
///
/// /// Always keeps the session alive. Handy for kiosks and demos.
/// struct AlwaysContinue;
///
/// impl AlertPresenter for AlwaysContinue {
///     async fn show_warning(&self, _prompt: WarningPrompt) -> WarningDecision {
///         WarningDecision::Continue
///     }
///
///     async fn show_expired(&self) {}
///
///     fn show_info(&self, message: &str) {
///         println!("{message}");
///     }
/// }
/// ```
pub trait AlertPresenter: Send + Sync + 'static {
    /// Asks the user whether to keep the session. Resolves once they
    /// answer. If the session expires first, the future is dropped.
    fn show_warning(&self, prompt: WarningPrompt) -> impl Future<Output = WarningDecision> + Send;

    /// Tells the user the session has ended. Resolves once acknowledged.
    fn show_expired(&self) -> impl Future<Output = ()> + Send;

    /// Shows a passing notice. Must not block.
    fn show_info(&self, message: &str);
}

impl<P: AlertPresenter> AlertPresenter for std::sync::Arc<P> {
    fn show_warning(&self, prompt: WarningPrompt) -> impl Future<Output = WarningDecision> + Send {
        (**self).show_warning(prompt)
    }

    fn show_expired(&self) -> impl Future<Output = ()> + Send {
        (**self).show_expired()
    }

    fn show_info(&self, message: &str) {
        (**self).show_info(message);
    }
}
