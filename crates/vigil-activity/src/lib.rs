//! Inactivity tracking for Vigil.
//!
//! A signed-in user who walks away should not stay signed in forever, and
//! one who is still working should never be logged out under their hands.
//! This crate decides which is which:
//!
//! 1. **Signals** ([`ActivityBus`], [`UiSignal`]): the UI reports input and
//!    foreground/background changes.
//! 2. **Scheduler** ([`InactivityScheduler`]): an actor task that owns the
//!    four session timers and runs the warning/expiry state machine.
//! 3. **Seams** ([`AlertPresenter`], [`SchedulerHooks`]): how the scheduler
//!    talks to the user and to its owner.
//!
//! # Timeline of an idle session
//!
//! ```text
//! t=0      activity          timers armed
//! t=10m    heartbeat         (every 10 min, not reset by activity)
//! t=50m    refresh           (every 50 min, not reset by activity)
//! t=55m    warning shown     user picks Continue or Logout
//! t=60m    expired           force_logout(Inactivity) + show_expired
//! ```

#![allow(async_fn_in_trait)]

mod error;
mod hooks;
mod presenter;
mod scheduler;
mod signals;

pub use error::SchedulerError;
pub use hooks::{LogoutReason, SchedulerHooks};
pub use presenter::{AlertPresenter, WarningDecision, WarningPrompt};
pub use scheduler::{
    ACTIVITY_DEBOUNCE, DEFAULT_ACTIVITY_KEY, HEARTBEAT_INTERVAL, INACTIVITY_TIMEOUT,
    InactivityScheduler, REFRESH_INTERVAL, RENEWED_MESSAGE, SchedulerPhase, WARNING_AFTER,
    WARNING_LEAD,
};
pub use signals::{ActivityBus, InputKind, UiSignal, Visibility};
