//! Cancellable scheduled tasks for Vigil.
//!
//! A session keeps four timers alive while the user is signed in: a warning
//! before the inactivity deadline, the deadline itself, a periodic
//! credential refresh, and a heartbeat. This crate owns the mechanics:
//!
//! - [`TimerHandle`]: one scheduled task (one-shot or repeating) with an
//!   explicit [`CancellationToken`].
//! - [`TimerGroup`]: the four handles armed together and cancelled
//!   together. There is no way to hold a partial group.
//! - [`TimerFired`]: what a timer delivers when it goes off.
//!
//! # Stale firings
//!
//! Timers never run session logic themselves. When one goes off it posts a
//! [`TimerFired`] carrying the group's `generation` to the owner's channel.
//! The owner compares that generation with its live group and drops
//! anything older. Cancellation stops the sleeping task; the generation check
//! covers the window where a task already woke up but its message has not
//! been handled yet. Together they guarantee a re-armed group never sees a
//! firing from the group it replaced.
//!
//! # Integration
//!
//! ```ignore
//! let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
//! let group = TimerGroup::arm(generation, &plan, &fired_tx);
//! loop {
//!     tokio::select! {
//!         Some(fired) = fired_rx.recv() => {
//!             if fired.generation != group.generation() { continue; }
//!             /* handle fired.kind */
//!         }
//!     }
//! }
//! ```

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Shortest period a repeating timer accepts.
const MIN_PERIOD: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Timer kinds and firings
// ---------------------------------------------------------------------------

/// Which of the four session timers this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Hard inactivity deadline. Fires once.
    Inactivity,
    /// "About to expire" prompt. Fires once.
    Warning,
    /// Proactive credential refresh. Repeats.
    Refresh,
    /// Best-effort keep-alive ping. Repeats.
    Heartbeat,
}

impl TimerKind {
    /// All four kinds, in arming order.
    pub const ALL: [TimerKind; 4] = [
        TimerKind::Inactivity,
        TimerKind::Warning,
        TimerKind::Refresh,
        TimerKind::Heartbeat,
    ];
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactivity => "inactivity",
            Self::Warning => "warning",
            Self::Refresh => "refresh",
            Self::Heartbeat => "heartbeat",
        };
        f.write_str(name)
    }
}

/// Delivered to the owner's channel when a timer goes off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    /// Which timer fired.
    pub kind: TimerKind,
    /// Generation of the group the timer belonged to.
    pub generation: u64,
}

/// Channel the timers post their firings to.
pub type FiredSender = mpsc::UnboundedSender<TimerFired>;

// ---------------------------------------------------------------------------
// TimerHandle
// ---------------------------------------------------------------------------

/// Handle to one scheduled task.
///
/// Cheap to clone: clones share the same cancellation token, so cancelling
/// any clone cancels the task. Dropping a handle does NOT cancel it;
/// cancellation is always explicit.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    kind: TimerKind,
    generation: u64,
    token: CancellationToken,
}

impl TimerHandle {
    /// Schedules a one-shot timer that fires after `delay`.
    pub fn once(kind: TimerKind, generation: u64, delay: Duration, fired: &FiredSender) -> Self {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let tx = fired.clone();
        let deadline = Instant::now() + delay;

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = task_token.cancelled() => {}
                _ = time::sleep_until(deadline) => {
                    if !task_token.is_cancelled() {
                        trace!(%kind, generation, "timer fired");
                        let _ = tx.send(TimerFired { kind, generation });
                    }
                }
            }
        });

        Self {
            kind,
            generation,
            token,
        }
    }

    /// Schedules a repeating timer: first after `first`, then every
    /// `period`. A late tick is delayed, never bunched.
    pub fn repeating(
        kind: TimerKind,
        generation: u64,
        first: Duration,
        period: Duration,
        fired: &FiredSender,
    ) -> Self {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let tx = fired.clone();
        // `interval_at` panics on a zero period.
        let period = period.max(MIN_PERIOD);
        let mut interval = time::interval_at(Instant::now() + first, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = interval.tick() => {
                        if task_token.is_cancelled() {
                            break;
                        }
                        trace!(%kind, generation, "timer fired");
                        if tx.send(TimerFired { kind, generation }).is_err() {
                            // Owner is gone; nobody left to notify.
                            break;
                        }
                    }
                }
            }
        });

        Self {
            kind,
            generation,
            token,
        }
    }

    /// Which timer this is.
    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    /// Generation of the group this timer was armed with.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancels the task. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `true` once [`cancel`](Self::cancel) has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// TimerPlan
// ---------------------------------------------------------------------------

/// Delays for arming a [`TimerGroup`], all measured from "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerPlan {
    /// Until the inactivity deadline.
    pub inactivity_in: Duration,
    /// Until the warning prompt.
    pub warning_in: Duration,
    /// Until the next refresh tick.
    pub refresh_in: Duration,
    /// Period between refresh ticks.
    pub refresh_every: Duration,
    /// Until the next heartbeat tick.
    pub heartbeat_in: Duration,
    /// Period between heartbeat ticks.
    pub heartbeat_every: Duration,
}

/// Time from `now` until the next tick of a cadence that started at
/// `anchor` and repeats every `period`.
///
/// Lets a repeating timer be re-created without shifting its phase: the
/// new timer picks up exactly where the old one would have fired. Returns
/// `period` when `now` sits exactly on a tick (that tick belongs to the old
/// timer) and when `period` is zero.
pub fn next_tick_in(anchor: Instant, period: Duration, now: Instant) -> Duration {
    if period.is_zero() {
        return period;
    }
    let elapsed = now.saturating_duration_since(anchor);
    let period_ns = period.as_nanos();
    let into_period = elapsed.as_nanos() % period_ns;
    // `into_period < period_ns` and `period` fit a `Duration`, so the
    // remainder does too.
    Duration::from_nanos((period_ns - into_period) as u64)
}

// ---------------------------------------------------------------------------
// TimerGroup
// ---------------------------------------------------------------------------

/// The four session timers, armed and cancelled as one unit.
///
/// A group only exists fully armed. Owners that need "no timers" hold
/// `Option<TimerGroup>` and store `None`.
#[derive(Debug, Clone)]
pub struct TimerGroup {
    generation: u64,
    inactivity: TimerHandle,
    warning: TimerHandle,
    refresh: TimerHandle,
    heartbeat: TimerHandle,
}

impl TimerGroup {
    /// Arms all four timers under `generation`.
    pub fn arm(generation: u64, plan: &TimerPlan, fired: &FiredSender) -> Self {
        let group = Self {
            generation,
            inactivity: TimerHandle::once(
                TimerKind::Inactivity,
                generation,
                plan.inactivity_in,
                fired,
            ),
            warning: TimerHandle::once(TimerKind::Warning, generation, plan.warning_in, fired),
            refresh: TimerHandle::repeating(
                TimerKind::Refresh,
                generation,
                plan.refresh_in,
                plan.refresh_every,
                fired,
            ),
            heartbeat: TimerHandle::repeating(
                TimerKind::Heartbeat,
                generation,
                plan.heartbeat_in,
                plan.heartbeat_every,
                fired,
            ),
        };
        trace!(
            generation,
            warning_in_s = plan.warning_in.as_secs(),
            inactivity_in_s = plan.inactivity_in.as_secs(),
            "timer group armed"
        );
        group
    }

    /// The generation every timer in this group carries.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancels all four timers.
    pub fn cancel(&self) {
        for handle in self.handles() {
            handle.cancel();
        }
    }

    /// The handle for one timer.
    pub fn get(&self, kind: TimerKind) -> &TimerHandle {
        match kind {
            TimerKind::Inactivity => &self.inactivity,
            TimerKind::Warning => &self.warning,
            TimerKind::Refresh => &self.refresh,
            TimerKind::Heartbeat => &self.heartbeat,
        }
    }

    /// All four handles, in [`TimerKind::ALL`] order.
    pub fn handles(&self) -> [&TimerHandle; 4] {
        [
            &self.inactivity,
            &self.warning,
            &self.refresh,
            &self.heartbeat,
        ]
    }

    /// How many of the four timers have not been cancelled.
    pub fn live_count(&self) -> usize {
        self.handles().iter().filter(|h| !h.is_cancelled()).count()
    }
}
