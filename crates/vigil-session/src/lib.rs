//! Session state and credential lifecycle for Vigil.
//!
//! This crate holds everything about a session that doesn't depend on
//! timers or the UI:
//!
//! 1. **State**: [`SessionState`], the observable snapshot every other
//!    component reads and writes.
//! 2. **Refresh**: [`TokenCoordinator`], which knows whether the access
//!    credential is still good and runs the single-flight refresh exchange.
//! 3. **Seams**: [`AuthBackend`] (who the user is) and [`PersistedStore`]
//!    (where the session survives a restart), with [`HttpAuthBackend`],
//!    [`MemoryStore`] and [`FileStore`] as ready-made implementations.
//!
//! # How it fits in the stack
//!
//! ```text
//! vigil (above)           ← orchestrator: login, logout, rehydration, interceptors
//!     ↕
//! vigil-activity (above)  ← inactivity scheduler drives refresh and expiry
//!     ↕
//! vigil-session (this crate)
//!     ↕
//! vigil-protocol / vigil-transport / vigil-timer (below)
//! ```

#![allow(async_fn_in_trait)]

mod backend;
mod coordinator;
mod error;
mod http_backend;
mod state;
mod store;

pub use backend::AuthBackend;
pub use coordinator::{
    CoordinatorConfig, DEFAULT_ACCESS_VALIDITY, DEFAULT_SESSION_KEY, TokenCoordinator,
};
pub use error::{BackendError, SessionError};
pub use http_backend::{AuthEndpoints, HttpAuthBackend};
pub use state::{SessionPatch, SessionSnapshot, SessionState, Subscription};
pub use store::{FileStore, MemoryStore, PersistedStore};
