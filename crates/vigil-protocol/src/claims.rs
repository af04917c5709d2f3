//! Issued-at claim extraction.
//!
//! Access credentials are claim-bearing tokens (`header.payload.signature`,
//! each segment base64url). The client only needs one fact out of them: when
//! the credential was issued. Authenticity is the backend's job, so the
//! default extractor reads the payload without checking the signature.
//!
//! Callers go through the [`IssuedAtExtractor`] trait. A deployment that
//! wants real verification plugs in its own extractor; nothing else changes.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::ProtocolError;

/// Reads the issued-at instant out of an access credential.
pub trait IssuedAtExtractor: Send + Sync + 'static {
    /// Returns when `credential` was issued.
    ///
    /// # Errors
    /// Returns [`ProtocolError::MalformedCredential`] if the credential
    /// cannot be decoded, or [`ProtocolError::MissingClaim`] if it carries
    /// no usable `iat`.
    fn extract_issued_at(&self, credential: &str) -> Result<DateTime<Utc>, ProtocolError>;
}

/// Decodes the payload segment and reads `iat`, without verifying the
/// signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnverifiedClaims;

impl IssuedAtExtractor for UnverifiedClaims {
    fn extract_issued_at(&self, credential: &str) -> Result<DateTime<Utc>, ProtocolError> {
        extract_issued_at(credential)
    }
}

/// Reads the `iat` claim of a claim-bearing credential without verifying it.
///
/// Accepts `iat` as an integer or a float number of seconds since the Unix
/// epoch. Padding on the payload segment is tolerated.
///
/// # Errors
/// See [`IssuedAtExtractor::extract_issued_at`].
pub fn extract_issued_at(credential: &str) -> Result<DateTime<Utc>, ProtocolError> {
    let mut segments = credential.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(ProtocolError::MalformedCredential(
            "expected three dot-separated segments".into(),
        ));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ProtocolError::MalformedCredential(format!("payload is not base64url: {e}")))?;

    let claims: Value = serde_json::from_slice(&bytes)
        .map_err(|e| ProtocolError::MalformedCredential(format!("payload is not JSON: {e}")))?;

    let seconds = match claims.get("iat") {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .ok_or(ProtocolError::MissingClaim("iat"))?,
        _ => return Err(ProtocolError::MissingClaim("iat")),
    };

    DateTime::from_timestamp(seconds, 0).ok_or(ProtocolError::MissingClaim("iat"))
}
