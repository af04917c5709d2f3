//! Orchestrator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use vigil_activity::DEFAULT_ACTIVITY_KEY;
use vigil_session::{CoordinatorConfig, DEFAULT_ACCESS_VALIDITY, DEFAULT_SESSION_KEY};

/// Settings for a [`SessionOrchestrator`](crate::SessionOrchestrator).
///
/// The inactivity timings are constants in `vigil_activity`, not settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Storage key of the persisted session record.
    ///
    /// Default: `"vigil.session"`.
    pub session_key: String,

    /// Storage key of the last-activity record.
    ///
    /// Default: `"vigil.last_activity"`.
    pub activity_key: String,

    /// How long an access credential is usable after its issued-at claim.
    ///
    /// Default: 60 seconds.
    pub access_validity: Duration,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            session_key: DEFAULT_SESSION_KEY.to_owned(),
            activity_key: DEFAULT_ACTIVITY_KEY.to_owned(),
            access_validity: DEFAULT_ACCESS_VALIDITY,
        }
    }
}

impl VigilConfig {
    /// Returns a copy with unusable values replaced by their defaults.
    ///
    /// Each correction is logged at `warn`.
    #[must_use]
    pub fn validated(mut self) -> Self {
        if self.session_key.trim().is_empty() {
            warn!("blank session key, using default");
            self.session_key = DEFAULT_SESSION_KEY.to_owned();
        }
        if self.activity_key.trim().is_empty() {
            warn!("blank activity key, using default");
            self.activity_key = DEFAULT_ACTIVITY_KEY.to_owned();
        }
        if self.activity_key == self.session_key {
            warn!(key = %self.session_key, "session and activity keys collide, using defaults");
            self.session_key = DEFAULT_SESSION_KEY.to_owned();
            self.activity_key = DEFAULT_ACTIVITY_KEY.to_owned();
        }
        if self.access_validity.is_zero() {
            warn!("zero access validity, using default");
            self.access_validity = DEFAULT_ACCESS_VALIDITY;
        }
        self
    }

    /// The part of this config the token coordinator needs.
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            session_key: self.session_key.clone(),
            access_validity: self.access_validity,
        }
    }
}
