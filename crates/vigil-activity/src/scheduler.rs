//! The inactivity scheduler: an actor task that owns the session timers.
//!
//! Everything that can change the inactivity clock goes through one task:
//! timer firings, UI signals from the [`ActivityBus`], explicit
//! [`update_activity`](InactivityScheduler::update_activity) calls, and the
//! user's answer to the expiry warning. The task handles them one at a
//! time, so the warning/expiry state machine never sees two events at once.
//!
//! ```text
//!           55 min idle                    5 more min / "log out"
//! ACTIVE ───────────────► WARNING_SHOWN ─────────────────────────► EXPIRED
//!   ▲                          │
//!   └──────── "continue" ──────┘   (refresh succeeded; clock reset)
//! ```
//!
//! Bus input resets the clock only while ACTIVE. While the warning is up the
//! deadline keeps running underneath it; pointer noise cannot dismiss it.
//! An explicit [`update_activity`](InactivityScheduler::update_activity)
//! (a fresh login, say) closes the warning and returns to ACTIVE.
//! The refresh and heartbeat timers keep their own cadence, anchored when
//! the scheduler started, and are never pushed back by activity.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use vigil_protocol::{ActivityRecord, Codec, JsonCodec};
use vigil_session::{AuthBackend, PersistedStore, SessionError, SessionState, TokenCoordinator};
use vigil_timer::{FiredSender, TimerFired, TimerGroup, TimerKind, TimerPlan, next_tick_in};

use crate::{
    ActivityBus, AlertPresenter, InputKind, LogoutReason, SchedulerError, SchedulerHooks, UiSignal,
    Visibility, WarningDecision, WarningPrompt,
};

/// Idle time after which the session expires.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How long before expiry the warning appears.
pub const WARNING_LEAD: Duration = Duration::from_secs(5 * 60);

/// Idle time after which the warning appears.
pub const WARNING_AFTER: Duration = Duration::from_secs(55 * 60);

/// Cadence of the proactive credential refresh.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(50 * 60);

/// Cadence of the keep-alive heartbeat.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Bus input signals closer together than this re-arm the timers once.
pub const ACTIVITY_DEBOUNCE: Duration = Duration::from_secs(1);

/// Default storage key for the last-activity record.
pub const DEFAULT_ACTIVITY_KEY: &str = "vigil.last_activity";

/// Shown after a returning user's expired session was renewed.
pub const RENEWED_MESSAGE: &str = "Welcome back. Your session was renewed.";

const COMMAND_BUFFER: usize = 32;

/// Where the warning/expiry state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerPhase {
    /// Not started, or stopped.
    Stopped,
    /// Running; activity resets the clock.
    Active,
    /// The expiry warning is on screen.
    WarningShown,
    /// The session expired; a forced logout is under way.
    Expired,
}

impl fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Active => "active",
            Self::WarningShown => "warning_shown",
            Self::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// Requests from the handle to the actor. Each carries a reply channel so
/// the caller can wait until the actor has handled it.
enum Command {
    Activity {
        at: Instant,
        reply: oneshot::Sender<()>,
    },
    Visibility {
        visibility: Visibility,
        reply: oneshot::Sender<()>,
    },
}

struct Running {
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to the inactivity scheduler.
///
/// [`start`](Self::start) spawns the actor task and arms the timer group;
/// [`stop`](Self::stop) cancels the task and clears the group. Both are
/// idempotent, and the scheduler can be started again after a stop.
/// Dropping the handle stops it.
pub struct InactivityScheduler<B, S, P, H> {
    coordinator: Arc<TokenCoordinator<B, S>>,
    state: SessionState,
    presenter: Arc<P>,
    hooks: Arc<H>,
    bus: ActivityBus,
    activity_key: String,
    generations: Arc<AtomicU64>,
    phase: Arc<watch::Sender<SchedulerPhase>>,
    running: Mutex<Option<Running>>,
}

impl<B, S, P, H> fmt::Debug for InactivityScheduler<B, S, P, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InactivityScheduler")
            .field("phase", &self.phase())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<B, S, P, H> InactivityScheduler<B, S, P, H>
where
    B: AuthBackend,
    S: PersistedStore,
    P: AlertPresenter,
    H: SchedulerHooks,
{
    /// Creates a stopped scheduler.
    pub fn new(
        coordinator: Arc<TokenCoordinator<B, S>>,
        presenter: Arc<P>,
        hooks: Arc<H>,
        bus: ActivityBus,
    ) -> Self {
        let state = coordinator.state().clone();
        let (phase, _) = watch::channel(SchedulerPhase::Stopped);
        Self {
            coordinator,
            state,
            presenter,
            hooks,
            bus,
            activity_key: DEFAULT_ACTIVITY_KEY.to_owned(),
            generations: Arc::new(AtomicU64::new(0)),
            phase: Arc::new(phase),
            running: Mutex::new(None),
        }
    }

    /// Stores the last-activity record under `key` (builder style).
    #[must_use]
    pub fn with_activity_key(mut self, key: impl Into<String>) -> Self {
        self.activity_key = key.into();
        self
    }

    /// Starts listening for activity and arms the four timers, recording
    /// "now" as the latest activity. Does nothing if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let shutdown = CancellationToken::new();
        {
            let mut running = lock(&self.running);
            if running.is_some() {
                debug!("inactivity scheduler already running");
                return;
            }
            *running = Some(Running {
                commands: commands_tx,
                shutdown: shutdown.clone(),
            });
        }

        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let (decisions_tx, decisions_rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let mut actor = Actor {
            coordinator: Arc::clone(&self.coordinator),
            state: self.state.clone(),
            presenter: Arc::clone(&self.presenter),
            hooks: Arc::clone(&self.hooks),
            activity_key: self.activity_key.clone(),
            generations: Arc::clone(&self.generations),
            generation: 0,
            phase_tx: Arc::clone(&self.phase),
            phase: SchedulerPhase::Active,
            commands: commands_rx,
            signals: self.bus.subscribe(),
            fired_tx,
            fired_rx,
            decisions_tx,
            decisions_rx,
            shutdown,
            cadence_anchor: now,
            refresh_due: now + REFRESH_INTERVAL,
            heartbeat_due: now + HEARTBEAT_INTERVAL,
            last_signal_rearm: None,
            dialog: None,
        };

        actor.publish_phase(SchedulerPhase::Active);
        actor.rearm(now);
        tokio::spawn(actor.run());
        info!("inactivity scheduler started");
    }

    /// Records activity now and re-arms the timer group, waiting until
    /// the scheduler has done so. An open warning is closed.
    ///
    /// Ignored after the session expired.
    ///
    /// # Errors
    /// [`SchedulerError::NotRunning`] if the scheduler is stopped.
    pub async fn update_activity(&self) -> Result<(), SchedulerError> {
        let commands = self.commands()?;
        let (reply, done) = oneshot::channel();
        commands
            .send(Command::Activity {
                at: Instant::now(),
                reply,
            })
            .await
            .map_err(|_| SchedulerError::NotRunning)?;
        done.await.map_err(|_| SchedulerError::NotRunning)
    }

    /// Reacts to the app moving to the foreground or background, waiting
    /// until the scheduler has handled it.
    ///
    /// On returning to the foreground, with `idle` the time since the last
    /// activity:
    ///
    /// | `idle`            | action                                          |
    /// |-------------------|-------------------------------------------------|
    /// | ≥ 60 min          | refresh; on success reset the clock and tell the user, else expire |
    /// | 55 to 60 min      | show the warning                                |
    /// | < 55 min          | refresh and heartbeat in the background, errors ignored |
    ///
    /// # Errors
    /// [`SchedulerError::NotRunning`] if the scheduler is stopped.
    pub async fn handle_visibility_change(
        &self,
        visibility: Visibility,
    ) -> Result<(), SchedulerError> {
        let commands = self.commands()?;
        let (reply, done) = oneshot::channel();
        commands
            .send(Command::Visibility { visibility, reply })
            .await
            .map_err(|_| SchedulerError::NotRunning)?;
        done.await.map_err(|_| SchedulerError::NotRunning)
    }

    fn commands(&self) -> Result<mpsc::Sender<Command>, SchedulerError> {
        lock(&self.running)
            .as_ref()
            .map(|r| r.commands.clone())
            .ok_or(SchedulerError::NotRunning)
    }
}

impl<B, S, P, H> InactivityScheduler<B, S, P, H> {
    /// Stops the actor, drops the activity subscription, and clears the
    /// timer group. Does nothing if not running.
    pub fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        running.shutdown.cancel();
        self.state.clear_timers();
        self.phase.send_replace(SchedulerPhase::Stopped);
        info!("inactivity scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.borrow()
    }

    /// A receiver that observes every phase change.
    pub fn watch_phase(&self) -> watch::Receiver<SchedulerPhase> {
        self.phase.subscribe()
    }

    /// The bus this scheduler listens on.
    pub fn bus(&self) -> &ActivityBus {
        &self.bus
    }

    /// Reports user input without waiting. Counts only while
    /// [`Active`](SchedulerPhase::Active).
    pub fn notify_activity(&self, kind: InputKind) {
        self.bus.input(kind);
    }
}

impl<B, S, P, H> Drop for InactivityScheduler<B, S, P, H> {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Actor<B, S, P, H> {
    coordinator: Arc<TokenCoordinator<B, S>>,
    state: SessionState,
    presenter: Arc<P>,
    hooks: Arc<H>,
    activity_key: String,
    /// Shared across restarts so a new actor never reuses a generation.
    generations: Arc<AtomicU64>,
    /// Generation of the last group this actor installed.
    generation: u64,
    phase_tx: Arc<watch::Sender<SchedulerPhase>>,
    phase: SchedulerPhase,
    commands: mpsc::Receiver<Command>,
    signals: broadcast::Receiver<UiSignal>,
    fired_tx: FiredSender,
    fired_rx: mpsc::UnboundedReceiver<TimerFired>,
    decisions_tx: mpsc::UnboundedSender<WarningDecision>,
    decisions_rx: mpsc::UnboundedReceiver<WarningDecision>,
    shutdown: CancellationToken,
    /// Refresh and heartbeat ticks are measured from here.
    cadence_anchor: Instant,
    /// When the next refresh tick is owed. A re-armed group fires at once
    /// if this has passed.
    refresh_due: Instant,
    heartbeat_due: Instant,
    last_signal_rearm: Option<Instant>,
    dialog: Option<JoinHandle<()>>,
}

impl<B, S, P, H> Actor<B, S, P, H>
where
    B: AuthBackend,
    S: PersistedStore,
    P: AlertPresenter,
    H: SchedulerHooks,
{
    async fn run(mut self) {
        self.persist_activity().await;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(fired) = self.fired_rx.recv() => self.handle_fired(fired).await,
                Some(decision) = self.decisions_rx.recv() => self.handle_decision(decision).await,
                signal = next_signal(&mut self.signals) => self.handle_signal(signal).await,
            }
        }

        if let Some(dialog) = self.dialog.take() {
            dialog.abort();
        }
        debug!("inactivity scheduler task exited");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Activity { at, reply } => {
                if self.phase == SchedulerPhase::WarningShown {
                    debug!("explicit activity closes the warning");
                    if let Some(dialog) = self.dialog.take() {
                        dialog.abort();
                    }
                    self.publish_phase(SchedulerPhase::Active);
                }
                self.record_activity(at).await;
                let _ = reply.send(());
            }
            Command::Visibility { visibility, reply } => {
                self.handle_visibility(visibility).await;
                let _ = reply.send(());
            }
        }
    }

    /// `None` means signals were dropped because this task fell behind.
    async fn handle_signal(&mut self, signal: Option<UiSignal>) {
        match signal {
            Some(UiSignal::Visibility(visibility)) => self.handle_visibility(visibility).await,
            Some(UiSignal::Input(_)) | None => {
                if self.phase != SchedulerPhase::Active {
                    trace!(phase = %self.phase, "input ignored");
                    return;
                }
                let now = Instant::now();
                if self
                    .last_signal_rearm
                    .is_some_and(|at| now.saturating_duration_since(at) < ACTIVITY_DEBOUNCE)
                {
                    return;
                }
                self.last_signal_rearm = Some(now);
                self.record_activity(now).await;
            }
        }
    }

    async fn handle_fired(&mut self, fired: TimerFired) {
        let live = self.state.get_state().timers.as_ref().map(TimerGroup::generation);
        if live != Some(fired.generation) {
            debug!(
                kind = %fired.kind,
                generation = fired.generation,
                ?live,
                "stale timer firing dropped"
            );
            return;
        }

        match fired.kind {
            TimerKind::Warning => self.show_warning(),
            TimerKind::Inactivity => self.expire(LogoutReason::Inactivity),
            TimerKind::Refresh => {
                let now = Instant::now();
                self.refresh_due =
                    now + next_tick_in(self.cadence_anchor, REFRESH_INTERVAL, now);
                self.periodic_refresh().await;
            }
            TimerKind::Heartbeat => {
                let now = Instant::now();
                self.heartbeat_due =
                    now + next_tick_in(self.cadence_anchor, HEARTBEAT_INTERVAL, now);
                let hooks = Arc::clone(&self.hooks);
                tokio::spawn(async move { hooks.send_heartbeat().await });
            }
        }
    }

    async fn handle_decision(&mut self, decision: WarningDecision) {
        if self.phase != SchedulerPhase::WarningShown {
            debug!(?decision, phase = %self.phase, "late warning decision ignored");
            return;
        }
        self.dialog = None;

        match decision {
            WarningDecision::Continue => {
                info!("user chose to stay signed in");
                match self.coordinator.refresh().await {
                    Ok(_) => {
                        self.publish_phase(SchedulerPhase::Active);
                        self.record_activity(Instant::now()).await;
                    }
                    Err(SessionError::LoggingOut) => debug!("logout began during refresh"),
                    Err(e) => {
                        warn!(error = %e, "refresh after warning failed");
                        self.expire(LogoutReason::RefreshFailed);
                    }
                }
            }
            WarningDecision::Logout => self.expire(LogoutReason::UserRequested),
        }
    }

    async fn handle_visibility(&mut self, visibility: Visibility) {
        if visibility == Visibility::Background {
            debug!("moved to background");
            return;
        }
        if self.phase == SchedulerPhase::Expired {
            return;
        }

        let now = Instant::now();
        let idle = now.saturating_duration_since(self.state.get_state().last_activity_at);

        if idle >= INACTIVITY_TIMEOUT {
            info!(idle_s = idle.as_secs(), "returned after the inactivity deadline");
            match self.coordinator.refresh().await {
                Ok(_) => {
                    if let Some(dialog) = self.dialog.take() {
                        dialog.abort();
                    }
                    self.publish_phase(SchedulerPhase::Active);
                    self.record_activity(Instant::now()).await;
                    self.presenter.show_info(RENEWED_MESSAGE);
                }
                Err(SessionError::LoggingOut) => debug!("logout began during refresh"),
                Err(e) => {
                    warn!(error = %e, "could not renew session on return");
                    self.expire(LogoutReason::Inactivity);
                }
            }
        } else if idle >= WARNING_AFTER {
            self.show_warning();
        } else {
            debug!(idle_s = idle.as_secs(), "foreground: background refresh and heartbeat");
            let refresh = self.coordinator.refresh();
            let hooks = Arc::clone(&self.hooks);
            tokio::spawn(async move {
                if let Err(e) = refresh.await {
                    debug!(error = %e, "opportunistic refresh failed");
                }
                hooks.send_heartbeat().await;
            });
        }
    }

    async fn periodic_refresh(&mut self) {
        debug!("periodic refresh");
        match self.coordinator.refresh().await {
            Ok(_) => {}
            Err(SessionError::LoggingOut) => debug!("logout began during refresh"),
            Err(e) => {
                warn!(error = %e, "periodic refresh failed");
                self.expire(LogoutReason::RefreshFailed);
            }
        }
    }

    /// Opens the warning in its own task. Only from `Active`.
    fn show_warning(&mut self) {
        if self.phase != SchedulerPhase::Active {
            return;
        }
        let idle = Instant::now().saturating_duration_since(self.state.get_state().last_activity_at);
        let remaining = INACTIVITY_TIMEOUT.saturating_sub(idle);
        self.publish_phase(SchedulerPhase::WarningShown);
        info!(remaining_s = remaining.as_secs(), "showing inactivity warning");

        let presenter = Arc::clone(&self.presenter);
        let decisions = self.decisions_tx.clone();
        self.dialog = Some(tokio::spawn(async move {
            let decision = presenter.show_warning(WarningPrompt::new(remaining)).await;
            let _ = decisions.send(decision);
        }));
    }

    /// Terminal: clears the timers, closes the warning, and hands the
    /// logout to the owner.
    fn expire(&mut self, reason: LogoutReason) {
        if self.phase == SchedulerPhase::Expired || self.shutdown.is_cancelled() {
            return;
        }
        self.publish_phase(SchedulerPhase::Expired);
        info!(%reason, "session expired");

        self.state.retire_timers(self.generation);
        if let Some(dialog) = self.dialog.take() {
            dialog.abort();
        }

        let hooks = Arc::clone(&self.hooks);
        let presenter = Arc::clone(&self.presenter);
        tokio::spawn(async move {
            hooks.force_logout(reason).await;
            if reason.notifies_user() {
                presenter.show_expired().await;
            }
        });
    }

    async fn record_activity(&mut self, at: Instant) {
        if self.phase == SchedulerPhase::Expired {
            debug!("activity after expiry ignored");
            return;
        }
        self.rearm(at);
        self.persist_activity().await;
    }

    /// Moves `last_activity_at` to `at` and swaps in a fresh timer group.
    fn rearm(&mut self, at: Instant) {
        let last = self.state.touch(at);
        let now = Instant::now();
        let idle = now.saturating_duration_since(last);
        let plan = TimerPlan {
            inactivity_in: INACTIVITY_TIMEOUT.saturating_sub(idle),
            warning_in: WARNING_AFTER.saturating_sub(idle),
            refresh_in: self.refresh_due.saturating_duration_since(now),
            refresh_every: REFRESH_INTERVAL,
            heartbeat_in: self.heartbeat_due.saturating_duration_since(now),
            heartbeat_every: HEARTBEAT_INTERVAL,
        };

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let group = TimerGroup::arm(generation, &plan, &self.fired_tx);
        if self
            .state
            .install_timers(group, || !self.shutdown.is_cancelled())
        {
            self.generation = generation;
            trace!(generation, "timers re-armed");
        } else {
            debug!("scheduler stopped while re-arming, timers discarded");
        }
    }

    async fn persist_activity(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let record = ActivityRecord::new(Utc::now());
        let result = match JsonCodec.encode(&record) {
            Ok(bytes) => {
                self.coordinator
                    .store()
                    .save(&self.activity_key, bytes)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(error = %e, "could not persist last activity");
        }
    }

    /// Publishes `phase` unless the scheduler has been stopped, in which
    /// case the handle already published `Stopped`.
    fn publish_phase(&mut self, phase: SchedulerPhase) {
        self.phase = phase;
        let shutdown = &self.shutdown;
        self.phase_tx.send_if_modified(|current| {
            if shutdown.is_cancelled() || *current == phase {
                return false;
            }
            *current = phase;
            true
        });
    }
}

async fn next_signal(signals: &mut broadcast::Receiver<UiSignal>) -> Option<UiSignal> {
    match signals.recv().await {
        Ok(signal) => Some(signal),
        Err(RecvError::Lagged(skipped)) => {
            debug!(skipped, "activity signals dropped, counting as input");
            None
        }
        Err(RecvError::Closed) => std::future::pending().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
