//! User-activity and visibility signals.
//!
//! The UI layer translates whatever its toolkit reports (mouse moves, key
//! presses, window focus) into [`UiSignal`]s and emits them on an
//! [`ActivityBus`]. The scheduler subscribes while it runs and drops its
//! subscription when stopped.

use std::fmt;

use tokio::sync::broadcast;

/// Default number of signals buffered per subscriber.
const DEFAULT_CAPACITY: usize = 64;

/// Kind of user input that counts as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Pointer,
    Keyboard,
    Touch,
    Scroll,
    Click,
    /// An API request sent on the user's behalf.
    Request,
}

/// Whether the application is in front of the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Foreground,
    Background,
}

/// One signal from the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiSignal {
    Input(InputKind),
    Visibility(Visibility),
}

impl fmt::Display for UiSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input(kind) => write!(f, "input:{kind:?}"),
            Self::Visibility(v) => write!(f, "visibility:{v:?}"),
        }
    }
}

/// Broadcast channel for [`UiSignal`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ActivityBus {
    sender: broadcast::Sender<UiSignal>,
}

impl Default for ActivityBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A bus buffering up to `capacity` signals per subscriber. A slow
    /// subscriber that falls further behind skips the oldest ones.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes a signal. Returns how many subscribers received it; zero
    /// (nobody listening) is not an error.
    pub fn emit(&self, signal: UiSignal) -> usize {
        self.sender.send(signal).unwrap_or(0)
    }

    /// Shorthand for `emit(UiSignal::Input(kind))`.
    pub fn input(&self, kind: InputKind) -> usize {
        self.emit(UiSignal::Input(kind))
    }

    /// Shorthand for `emit(UiSignal::Visibility(visibility))`.
    pub fn visibility(&self, visibility: Visibility) -> usize {
        self.emit(UiSignal::Visibility(visibility))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiSignal> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
