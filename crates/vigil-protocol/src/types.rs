//! Core data types: the session record and the values exchanged with the
//! auth backend.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProtocolError;

/// Attribute under which client-held preference toggles are stored inside
/// the session's identity attributes.
pub const PREFERENCES_ATTRIBUTE: &str = "preferences";

/// A partial set of preference toggles, merged key-by-key into the stored
/// preferences.
pub type PreferencePatch = Map<String, Value>;

// ---------------------------------------------------------------------------
// Bearer credentials
// ---------------------------------------------------------------------------

/// Short-lived bearer credential attached to every authorized request.
///
/// Opaque to the client except for its embedded issued-at claim, which the
/// session layer reads (without verifying) to decide whether the credential
/// is still usable.
///
/// `Debug` is redacted so the credential never ends up in logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

/// Long-lived bearer credential used only to mint new access credentials.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshToken(String);

macro_rules! bearer_impls {
    ($ty:ident) => {
        impl $ty {
            /// Wraps a raw bearer string.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// The raw bearer string, for building an `Authorization` header.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// `true` if the credential is an empty string.
            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($ty), "(<{} bytes>)"), self.0.len())
            }
        }

        impl From<&str> for $ty {
            fn from(raw: &str) -> Self {
                Self::new(raw)
            }
        }

        impl From<String> for $ty {
            fn from(raw: String) -> Self {
                Self::new(raw)
            }
        }
    };
}

bearer_impls!(AccessToken);
bearer_impls!(RefreshToken);

/// A freshly minted credential pair returned by the refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// The new access credential.
    pub access_token: AccessToken,
    /// The new refresh credential. Refresh rotates both.
    pub refresh_token: RefreshToken,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// The authenticated identity record.
///
/// Holds opaque identity/profile attributes plus the two bearer
/// credentials. The JSON shape is flat, which is exactly the persisted
/// record:
///
/// ```json
/// { "id": 42, "name": "ada", "access_token": "…", "refresh_token": "…" }
/// ```
///
/// A session is created by login or rehydration, replaced wholesale on every
/// refresh (see [`Session::with_tokens`]), and dropped on logout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Identity and profile attributes. Opaque to Vigil, apart from
    /// [`PREFERENCES_ATTRIBUTE`].
    #[serde(flatten)]
    pub attributes: Map<String, Value>,

    /// Current access credential.
    pub access_token: AccessToken,

    /// Current refresh credential.
    pub refresh_token: RefreshToken,
}

impl Session {
    /// Creates a session with no identity attributes.
    pub fn new(
        access_token: impl Into<AccessToken>,
        refresh_token: impl Into<RefreshToken>,
    ) -> Self {
        Self {
            attributes: Map::new(),
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Adds an identity attribute (builder style).
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Looks up an identity attribute.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Returns the same identity carrying a new credential pair.
    ///
    /// Refresh never patches one token in place: both are replaced together
    /// so a half-rotated record can never be persisted.
    #[must_use]
    pub fn with_tokens(&self, pair: TokenPair) -> Self {
        Self {
            attributes: self.attributes.clone(),
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
        }
    }

    /// Checks the structural rules a rehydrated record must satisfy.
    ///
    /// Deserialization already guarantees both credential fields exist;
    /// this rejects records where they are present but blank.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidSession`] naming the empty field.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.access_token.is_empty() {
            return Err(ProtocolError::InvalidSession("access_token is empty".into()));
        }
        if self.refresh_token.is_empty() {
            return Err(ProtocolError::InvalidSession("refresh_token is empty".into()));
        }
        Ok(())
    }

    /// The stored preference toggles, if any.
    pub fn preferences(&self) -> Option<&Map<String, Value>> {
        self.attributes
            .get(PREFERENCES_ATTRIBUTE)
            .and_then(Value::as_object)
    }

    /// Merges a partial set of toggles into the stored preferences.
    ///
    /// Keys in `patch` overwrite existing ones; other keys are kept. A
    /// non-object value under [`PREFERENCES_ATTRIBUTE`] is replaced.
    pub fn merge_preferences(&mut self, patch: &PreferencePatch) {
        let entry = self
            .attributes
            .entry(PREFERENCES_ATTRIBUTE)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(prefs) = entry {
            for (key, value) in patch {
                prefs.insert(key.clone(), value.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// What the user typed into the login form.
///
/// `Debug` omits the password.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Account identifier (username or email).
    pub username: String,
    /// Secret.
    pub password: String,
}

impl Credentials {
    /// Creates login credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Activity record
// ---------------------------------------------------------------------------

/// The persisted "last seen" timestamp, written on every recorded activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Wall-clock time of the most recent user activity.
    pub last_activity_at: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(last_activity_at: DateTime<Utc>) -> Self {
        Self { last_activity_at }
    }
}
