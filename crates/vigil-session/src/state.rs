//! Observable session state.
//!
//! [`SessionState`] is the single source of truth the rest of the
//! application reads: who is signed in, whether a refresh or logout is in
//! progress, when the user was last active, and which timers are armed.
//! It does no I/O. Writers hand it a [`SessionPatch`]; it merges the patch,
//! swaps in a new immutable [`SessionSnapshot`], and calls every subscriber
//! with that snapshot, synchronously and in subscription order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::time::Instant;
use vigil_protocol::{AccessToken, Session};
use vigil_timer::TimerGroup;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// An immutable view of the session at one point in time.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// The live session, if signed in.
    pub session: Option<Session>,
    /// A rehydration or login is in progress.
    pub is_loading: bool,
    /// A refresh exchange is outstanding.
    pub is_refreshing: bool,
    /// A logout has started. Requests must not leave the process while set.
    pub is_logging_out: bool,
    /// Most recent user activity. Never moves backwards.
    pub last_activity_at: Instant,
    /// The four inactivity timers: all armed, or none.
    pub timers: Option<TimerGroup>,
    /// Bumped by every sign-in and every reset. Work started under one
    /// epoch must not write into another.
    pub epoch: u64,
}

impl SessionSnapshot {
    /// The shape a fresh (or freshly reset) state starts in.
    pub fn initial() -> Self {
        Self {
            session: None,
            is_loading: false,
            is_refreshing: false,
            is_logging_out: false,
            last_activity_at: Instant::now(),
            timers: None,
            epoch: 0,
        }
    }

    /// `true` if a session is live.
    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    /// The current access credential, if signed in.
    pub fn access_token(&self) -> Option<&AccessToken> {
        self.session.as_ref().map(|s| &s.access_token)
    }

    /// `true` while the timer group is armed.
    pub fn timers_armed(&self) -> bool {
        self.timers.is_some()
    }
}

// ---------------------------------------------------------------------------
// Patch
// ---------------------------------------------------------------------------

/// A partial update. Every `Some` field replaces the snapshot's value.
///
/// The timer group is replaced as a whole: a patch cannot arm two timers
/// and leave the other two absent.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub session: Option<Option<Session>>,
    pub is_loading: Option<bool>,
    pub is_refreshing: Option<bool>,
    pub is_logging_out: Option<bool>,
    pub last_activity_at: Option<Instant>,
    pub timers: Option<Option<TimerGroup>>,
    /// Start a new epoch. Set by [`sign_in`](Self::sign_in).
    pub begins_epoch: bool,
}

impl SessionPatch {
    /// An empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn session(mut self, session: Option<Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// Installs `session` as a new sign-in, starting a new epoch with no
    /// refresh outstanding.
    #[must_use]
    pub fn sign_in(mut self, session: Session) -> Self {
        self.session = Some(Some(session));
        self.begins_epoch = true;
        self
    }

    #[must_use]
    pub fn loading(mut self, value: bool) -> Self {
        self.is_loading = Some(value);
        self
    }

    #[must_use]
    pub fn refreshing(mut self, value: bool) -> Self {
        self.is_refreshing = Some(value);
        self
    }

    #[must_use]
    pub fn logging_out(mut self, value: bool) -> Self {
        self.is_logging_out = Some(value);
        self
    }

    #[must_use]
    pub fn last_activity_at(mut self, at: Instant) -> Self {
        self.last_activity_at = Some(at);
        self
    }

    #[must_use]
    pub fn timers(mut self, timers: Option<TimerGroup>) -> Self {
        self.timers = Some(timers);
        self
    }

    /// Applies the patch, returning the timer group it displaced (if any).
    fn apply(self, snapshot: &mut SessionSnapshot) -> Option<TimerGroup> {
        if let Some(session) = self.session {
            snapshot.session = session;
        }
        if self.begins_epoch {
            // Exchanges from the old epoch can no longer clear the flag.
            snapshot.epoch += 1;
            snapshot.is_refreshing = false;
        }
        if let Some(v) = self.is_loading {
            snapshot.is_loading = v;
        }
        if let Some(v) = self.is_refreshing {
            snapshot.is_refreshing = v;
        }
        if let Some(v) = self.is_logging_out {
            snapshot.is_logging_out = v;
        }
        if let Some(at) = self.last_activity_at {
            snapshot.last_activity_at = snapshot.last_activity_at.max(at);
        }
        match self.timers {
            Some(next) => std::mem::replace(&mut snapshot.timers, next),
            None => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

type Listener = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;

struct Registry {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

struct Inner {
    snapshot: Mutex<Arc<SessionSnapshot>>,
    registry: Mutex<Registry>,
}

/// Reactive container for the current [`SessionSnapshot`].
///
/// Cheap to clone; clones share the same state and subscribers.
#[derive(Clone)]
pub struct SessionState {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("snapshot", &self.get_state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    /// Creates a state in its [initial](SessionSnapshot::initial) shape.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                snapshot: Mutex::new(Arc::new(SessionSnapshot::initial())),
                registry: Mutex::new(Registry {
                    next_id: 0,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    /// The current snapshot.
    pub fn get_state(&self) -> Arc<SessionSnapshot> {
        Arc::clone(&lock(&self.inner.snapshot))
    }

    /// Merges `patch` into the current snapshot and notifies subscribers
    /// with the result.
    ///
    /// `last_activity_at` only ever moves forward: an older instant in the
    /// patch is ignored. A timer group displaced by the patch is cancelled,
    /// so replacing the group can never leave the old timers running.
    pub fn set_state(&self, patch: SessionPatch) -> Arc<SessionSnapshot> {
        self.update(|snapshot| patch.apply(snapshot))
    }

    /// Builds a patch from the current snapshot and applies it, with no
    /// other write in between. Returns `None`, and notifies nobody, when
    /// `change` declines.
    pub fn set_state_if(
        &self,
        change: impl FnOnce(&SessionSnapshot) -> Option<SessionPatch>,
    ) -> Option<Arc<SessionSnapshot>> {
        let (next, displaced) = {
            let mut current = lock(&self.inner.snapshot);
            let patch = change(&current)?;
            let mut next = SessionSnapshot::clone(&current);
            let displaced = patch.apply(&mut next);
            let next = Arc::new(next);
            *current = Arc::clone(&next);
            (next, displaced)
        };
        Some(self.publish(next, displaced))
    }

    /// Records activity at `at` and returns the resulting
    /// `last_activity_at` (which is `at` unless a later instant was already
    /// recorded).
    pub fn touch(&self, at: Instant) -> Instant {
        self.set_state(SessionPatch::new().last_activity_at(at))
            .last_activity_at
    }

    /// Cancels the armed timer group, marks timers absent, and notifies.
    pub fn clear_timers(&self) {
        self.set_state(SessionPatch::new().timers(None));
    }

    /// Installs `group` as the live timer group if `still_wanted()` holds,
    /// cancelling the group it replaces. Otherwise cancels `group` and
    /// leaves the state alone. Returns whether the group was installed.
    ///
    /// The check runs under the same lock as [`clear_timers`], so a
    /// concurrent stop either sees the new group and clears it, or makes
    /// the check fail.
    ///
    /// [`clear_timers`]: Self::clear_timers
    pub fn install_timers(&self, group: TimerGroup, still_wanted: impl FnOnce() -> bool) -> bool {
        let mut installed = false;
        self.update(|snapshot| {
            if still_wanted() {
                installed = true;
                snapshot.timers.replace(group)
            } else {
                group.cancel();
                None
            }
        });
        installed
    }

    /// Cancels and removes the live group only if it carries `generation`.
    /// Returns whether it did.
    pub fn retire_timers(&self, generation: u64) -> bool {
        let mut retired = false;
        self.update(|snapshot| {
            if snapshot
                .timers
                .as_ref()
                .is_some_and(|g| g.generation() == generation)
            {
                retired = true;
                snapshot.timers.take()
            } else {
                None
            }
        });
        retired
    }

    /// Cancels any timers and returns to the initial shape, in a new epoch.
    pub fn reset(&self) {
        self.update(|snapshot| {
            let displaced = snapshot.timers.take();
            let epoch = snapshot.epoch + 1;
            *snapshot = SessionSnapshot::initial();
            snapshot.epoch = epoch;
            displaced
        });
    }

    /// Registers `listener`. It is called after every change, with the new
    /// snapshot, until the returned [`Subscription`] is dropped or
    /// [unsubscribed](Subscription::unsubscribe).
    ///
    /// Listeners run on the writer's task while no internal lock is held,
    /// so they may read the state; they should not block.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(
        &self,
        listener: impl Fn(&SessionSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        let mut registry = lock(&self.inner.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.push((id, Arc::new(listener)));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    /// Number of registered listeners.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.registry).listeners.len()
    }

    /// Swaps in a modified snapshot, cancels whatever timer group `change`
    /// hands back, then notifies.
    fn update(
        &self,
        change: impl FnOnce(&mut SessionSnapshot) -> Option<TimerGroup>,
    ) -> Arc<SessionSnapshot> {
        let (next, displaced) = {
            let mut current = lock(&self.inner.snapshot);
            let mut next = SessionSnapshot::clone(&current);
            let displaced = change(&mut next);
            let next = Arc::new(next);
            *current = Arc::clone(&next);
            (next, displaced)
        };
        self.publish(next, displaced)
    }

    fn publish(
        &self,
        next: Arc<SessionSnapshot>,
        displaced: Option<TimerGroup>,
    ) -> Arc<SessionSnapshot> {
        if let Some(group) = displaced {
            let still_live = next
                .timers
                .as_ref()
                .is_some_and(|g| g.generation() == group.generation());
            if !still_live {
                group.cancel();
            }
        }

        self.notify(&next);
        next
    }

    fn notify(&self, snapshot: &SessionSnapshot) {
        let listeners: Vec<Listener> = lock(&self.inner.registry)
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }
}

/// Handle returned by [`SessionState::subscribe`].
///
/// Dropping it unsubscribes.
pub struct Subscription {
    inner: Weak<Inner>,
    id: Option<u64>,
}

impl Subscription {
    /// Removes the listener. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        let (Some(id), Some(inner)) = (self.id.take(), self.inner.upgrade()) else {
            return;
        };
        lock(&inner.registry).listeners.retain(|(lid, _)| *lid != id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Locks a std mutex, recovering the data if a listener panicked while it
/// was held.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use vigil_timer::TimerPlan;

    fn plan() -> TimerPlan {
        TimerPlan {
            inactivity_in: Duration::from_secs(60),
            warning_in: Duration::from_secs(55),
            refresh_in: Duration::from_secs(50),
            refresh_every: Duration::from_secs(50),
            heartbeat_in: Duration::from_secs(10),
            heartbeat_every: Duration::from_secs(10),
        }
    }

    // =====================================================================
    // set_state / get_state
    // =====================================================================

    #[test]
    fn test_new_state_is_initial_shape() {
        let state = SessionState::new();
        let snap = state.get_state();
        assert!(snap.session.is_none());
        assert!(!snap.is_loading && !snap.is_refreshing && !snap.is_logging_out);
        assert!(!snap.timers_armed());
    }

    #[test]
    fn test_set_state_replaces_only_patched_fields() {
        let state = SessionState::new();
        state.set_state(SessionPatch::new().session(Some(Session::new("a", "r"))));
        state.set_state(SessionPatch::new().refreshing(true));

        let snap = state.get_state();
        assert!(snap.is_refreshing);
        assert!(snap.is_authenticated(), "session should survive an unrelated patch");
        assert_eq!(snap.access_token().map(AccessToken::as_str), Some("a"));
    }

    #[test]
    fn test_old_snapshots_are_immutable() {
        let state = SessionState::new();
        let before = state.get_state();
        state.set_state(SessionPatch::new().loading(true));
        assert!(!before.is_loading);
        assert!(state.get_state().is_loading);
    }

    #[test]
    fn test_last_activity_never_moves_backwards() {
        let state = SessionState::new();
        let later = Instant::now() + Duration::from_secs(30);
        assert_eq!(state.touch(later), later);

        let earlier = later - Duration::from_secs(10);
        assert_eq!(state.touch(earlier), later);
        assert_eq!(state.get_state().last_activity_at, later);
    }

    #[test]
    fn test_set_state_if_declining_leaves_state_alone() {
        let state = SessionState::new();
        let calls = Arc::new(Mutex::new(0));
        let _sub = {
            let calls = Arc::clone(&calls);
            state.subscribe(move |_| *calls.lock().unwrap() += 1)
        };

        assert!(state.set_state_if(|_| None).is_none());
        let applied = state.set_state_if(|snap| {
            (!snap.is_loading).then(|| SessionPatch::new().loading(true))
        });

        assert!(applied.is_some_and(|snap| snap.is_loading));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_sign_in_and_reset_start_new_epochs() {
        let state = SessionState::new();
        let start = state.get_state().epoch;

        state.set_state(SessionPatch::new().refreshing(true));
        state.set_state(SessionPatch::new().sign_in(Session::new("a", "r")));
        assert!(!state.get_state().is_refreshing);
        let signed_in = state.get_state().epoch;
        state.set_state(SessionPatch::new().session(Some(Session::new("b", "r2"))));
        assert_eq!(state.get_state().epoch, signed_in, "a token swap keeps the epoch");

        state.reset();
        let after_reset = state.get_state().epoch;

        assert!(start < signed_in && signed_in < after_reset);
    }

    // =====================================================================
    // subscribe
    // =====================================================================

    #[test]
    fn test_listeners_get_new_snapshot_in_subscription_order() {
        let state = SessionState::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = {
            let seen = Arc::clone(&seen);
            state.subscribe(move |snap| seen.lock().unwrap().push(("first", snap.is_loading)))
        };
        let s2 = {
            let seen = Arc::clone(&seen);
            state.subscribe(move |snap| seen.lock().unwrap().push(("second", snap.is_loading)))
        };

        state.set_state(SessionPatch::new().loading(true));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", true), ("second", true)]
        );
        drop((s1, s2));
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let state = SessionState::new();
        let calls = Arc::new(Mutex::new(0));
        let sub = {
            let calls = Arc::clone(&calls);
            state.subscribe(move |_| *calls.lock().unwrap() += 1)
        };

        state.set_state(SessionPatch::new().loading(true));
        sub.unsubscribe();
        state.set_state(SessionPatch::new().loading(false));

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(state.subscriber_count(), 0);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let state = SessionState::new();
        {
            let _sub = state.subscribe(|_| {});
            assert_eq!(state.subscriber_count(), 1);
        }
        assert_eq!(state.subscriber_count(), 0);
    }

    #[test]
    fn test_listener_may_read_state() {
        let state = SessionState::new();
        let reader = state.clone();
        let observed = Arc::new(Mutex::new(None));
        let _sub = {
            let observed = Arc::clone(&observed);
            state.subscribe(move |_| {
                *observed.lock().unwrap() = Some(reader.get_state().is_logging_out);
            })
        };

        state.set_state(SessionPatch::new().logging_out(true));
        assert_eq!(*observed.lock().unwrap(), Some(true));
    }

    // =====================================================================
    // timers
    // =====================================================================

    #[tokio::test(start_paused = true)]
    async fn test_clear_timers_cancels_and_notifies() {
        let state = SessionState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let group = TimerGroup::arm(1, &plan(), &tx);
        state.set_state(SessionPatch::new().timers(Some(group.clone())));

        let notified = Arc::new(Mutex::new(false));
        let _sub = {
            let notified = Arc::clone(&notified);
            state.subscribe(move |snap| *notified.lock().unwrap() = !snap.timers_armed())
        };

        state.clear_timers();

        assert_eq!(group.live_count(), 0);
        assert!(!state.get_state().timers_armed());
        assert!(*notified.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_group_cancels_the_old_one() {
        let state = SessionState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let old = TimerGroup::arm(1, &plan(), &tx);
        let new = TimerGroup::arm(2, &plan(), &tx);

        state.set_state(SessionPatch::new().timers(Some(old.clone())));
        state.set_state(SessionPatch::new().timers(Some(new.clone())));

        assert_eq!(old.live_count(), 0);
        assert_eq!(new.live_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_re_setting_same_group_keeps_it_live() {
        let state = SessionState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let group = TimerGroup::arm(1, &plan(), &tx);

        state.set_state(SessionPatch::new().timers(Some(group.clone())));
        state.set_state(SessionPatch::new().timers(Some(group.clone())));

        assert_eq!(group.live_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_timers_respects_guard() {
        let state = SessionState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = TimerGroup::arm(1, &plan(), &tx);
        let refused = TimerGroup::arm(2, &plan(), &tx);

        assert!(state.install_timers(first.clone(), || true));
        assert!(!state.install_timers(refused.clone(), || false));

        assert_eq!(refused.live_count(), 0, "a refused group is cancelled");
        assert_eq!(first.live_count(), 4);
        let live = state.get_state().timers.as_ref().map(TimerGroup::generation);
        assert_eq!(live, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retire_timers_only_touches_matching_generation() {
        let state = SessionState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let group = TimerGroup::arm(7, &plan(), &tx);
        state.set_state(SessionPatch::new().timers(Some(group.clone())));

        assert!(!state.retire_timers(6));
        assert_eq!(group.live_count(), 4);

        assert!(state.retire_timers(7));
        assert_eq!(group.live_count(), 0);
        assert!(!state.get_state().timers_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_timers_and_drops_session() {
        let state = SessionState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let group = TimerGroup::arm(1, &plan(), &tx);
        state.set_state(
            SessionPatch::new()
                .session(Some(Session::new("a", "r")))
                .logging_out(true)
                .timers(Some(group.clone())),
        );

        state.reset();

        let snap = state.get_state();
        assert!(snap.session.is_none());
        assert!(!snap.is_logging_out);
        assert!(snap.timers.is_none());
        assert_eq!(group.live_count(), 0);
    }
}
