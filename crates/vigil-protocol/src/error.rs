//! Error types for the protocol layer.

/// Errors that can occur while encoding, decoding, or inspecting session
/// data.
///
/// Every variant carries a rendered message instead of the source error so
/// the type stays `Clone`. The session layer hands one refresh outcome to
/// many waiters, and that outcome may contain a `ProtocolError`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[error("encode failed: {0}")]
    Encode(String),

    /// Deserialization failed (turning bytes into a Rust type).
    ///
    /// Common causes: malformed JSON, a missing `access_token` or
    /// `refresh_token`, or a value of the wrong type.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The credential is not shaped like a claim-bearing token
    /// (`header.payload.signature`), or its payload is not valid
    /// base64url JSON.
    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    /// The credential decoded but does not carry the named claim.
    #[error("credential is missing the `{0}` claim")]
    MissingClaim(&'static str),

    /// The record decoded but violates a structural rule, e.g. an empty
    /// bearer string.
    #[error("invalid session: {0}")]
    InvalidSession(String),
}
