//! Data model for Vigil.
//!
//! This crate defines what a client session looks like at rest and on the
//! wire, without knowing anything about timers, networking, or UI:
//!
//! - **Types** ([`Session`], [`AccessToken`], [`RefreshToken`],
//!   [`TokenPair`], [`Credentials`], [`ActivityRecord`]): the
//!   authenticated identity record and the values exchanged with the auth
//!   backend.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how a session is turned
//!   into the persisted blob and back.
//! - **Claims** ([`IssuedAtExtractor`], [`extract_issued_at`]): reading the
//!   issued-at claim out of an access credential for expiry reasoning.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Architecture
//!
//! ```text
//! Transport (bytes) → Protocol (Session) → Session layer (state, refresh)
//! ```

mod claims;
mod codec;
mod error;
mod types;

pub use claims::{IssuedAtExtractor, UnverifiedClaims, extract_issued_at};
pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use types::{
    AccessToken, ActivityRecord, Credentials, PREFERENCES_ATTRIBUTE, PreferencePatch,
    RefreshToken, Session, TokenPair,
};
