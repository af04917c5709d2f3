//! Errors from the scheduler handle.

/// Errors returned by [`InactivityScheduler`](crate::InactivityScheduler)
/// operations that talk to the running scheduler task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler is stopped (or stopped while the request was pending).
    #[error("inactivity scheduler is not running")]
    NotRunning,
}
