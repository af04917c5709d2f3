//! The "your session expired" signal handed to the next login view.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use vigil_activity::LogoutReason;

/// Why the previous session ended without the user asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiredNotice {
    /// Nobody used the app until the inactivity deadline passed.
    Inactivity,
    /// Credentials could not be renewed.
    RefreshFailed,
}

impl ExpiredNotice {
    /// The notice a forced logout leaves behind. A logout the user asked
    /// for leaves none.
    pub fn for_reason(reason: LogoutReason) -> Option<Self> {
        match reason {
            LogoutReason::UserRequested => None,
            LogoutReason::Inactivity => Some(Self::Inactivity),
            LogoutReason::RefreshFailed => Some(Self::RefreshFailed),
        }
    }

    /// Text for the login view.
    pub fn message(self) -> &'static str {
        match self {
            Self::Inactivity => "You were signed out after a period of inactivity.",
            Self::RefreshFailed => "Your session expired. Please sign in again.",
        }
    }
}

impl fmt::Display for ExpiredNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Holds at most one notice until it is read.
#[derive(Debug, Default)]
pub(crate) struct NoticeSlot(Mutex<Option<ExpiredNotice>>);

impl NoticeSlot {
    /// Overwrites any unread notice.
    pub(crate) fn set(&self, notice: ExpiredNotice) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(notice);
    }

    pub(crate) fn take(&self) -> Option<ExpiredNotice> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_logout_leaves_no_notice() {
        assert_eq!(ExpiredNotice::for_reason(LogoutReason::UserRequested), None);
        assert_eq!(
            ExpiredNotice::for_reason(LogoutReason::Inactivity),
            Some(ExpiredNotice::Inactivity)
        );
        assert_eq!(
            ExpiredNotice::for_reason(LogoutReason::RefreshFailed),
            Some(ExpiredNotice::RefreshFailed)
        );
    }

    #[test]
    fn test_slot_is_read_once() {
        let slot = NoticeSlot::default();
        slot.set(ExpiredNotice::Inactivity);
        slot.set(ExpiredNotice::RefreshFailed);
        assert_eq!(slot.take(), Some(ExpiredNotice::RefreshFailed));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn test_notice_serializes_snake_case() {
        let json = serde_json::to_string(&ExpiredNotice::RefreshFailed).unwrap();
        assert_eq!(json, r#""refresh_failed""#);
    }
}
