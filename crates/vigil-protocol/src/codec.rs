//! Codec trait and the JSON implementation used for the persisted record.
//!
//! The session layer never calls `serde_json` directly. It asks a [`Codec`]
//! to turn a [`Session`](crate::Session) into bytes before handing them to
//! storage, and back again on startup. Swapping the format (say, to an
//! encrypted envelope) means writing a new codec, not touching callers.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes Rust values to bytes and decodes them back.
///
/// `Send + Sync + 'static` because the codec lives inside the token
/// coordinator, which is shared across tasks for the lifetime of the
/// application.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decode`] if the bytes are malformed or do
    /// not match the expected shape.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// The persisted record is JSON-shaped: identity attributes at the top
/// level next to `access_token` and `refresh_token`.
///
/// ## Example
///
/// ```rust
/// use vigil_protocol::{Codec, JsonCodec, Session};
///
/// let codec = JsonCodec;
/// let session: Session = codec
///     .decode(br#"{"name":"ada","access_token":"a.b.c","refresh_token":"r"}"#)
///     .unwrap();
/// assert_eq!(session.attribute("name").and_then(|v| v.as_str()), Some("ada"));
///
/// let bytes = codec.encode(&session).unwrap();
/// let again: Session = codec.decode(&bytes).unwrap();
/// assert_eq!(session, again);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}
