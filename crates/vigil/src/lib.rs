//! # Vigil
//!
//! Session and token lifecycle manager for long-lived interactive clients.
//!
//! Vigil keeps a user signed in across a long session: it restores the
//! session on startup, renews short-lived access credentials before and
//! after they expire, watches for inactivity, warns before a forced logout,
//! and retries requests that failed with 401 once a credential is renewed.
//!
//! The application provides three collaborators and gets back one
//! [`SessionOrchestrator`]:
//!
//! | Collaborator | Trait | Shipped implementations |
//! |---|---|---|
//! | Auth backend | [`AuthBackend`](vigil_session::AuthBackend) | [`HttpAuthBackend`](vigil_session::HttpAuthBackend) |
//! | Storage | [`PersistedStore`](vigil_session::PersistedStore) | [`MemoryStore`](vigil_session::MemoryStore), [`FileStore`](vigil_session::FileStore) |
//! | Dialogs | [`AlertPresenter`](vigil_activity::AlertPresenter) | none; this is the UI |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vigil::prelude::*;
//!
//! let backend = HttpAuthBackend::new(ReqwestClient::new()?, AuthEndpoints::new(base_url));
//! let orchestrator = SessionOrchestrator::builder().build(backend, FileStore::new(dir), MyDialogs);
//! orchestrator.initialize().await;
//! if !orchestrator.is_authenticated() {
//!     orchestrator.login(&Credentials::new("ada", "secret")).await?;
//! }
//! let api = AuthorizedClient::new(ReqwestClient::new()?, orchestrator.clone());
//! let response = api.send(HttpRequest::get(format!("{base_url}/me"))).await?;
//! ```

mod client;
mod config;
mod error;
mod notice;
mod orchestrator;
pub mod telemetry;

pub use client::{AuthorizedClient, ResponseAction};
pub use config::VigilConfig;
pub use error::VigilError;
pub use notice::ExpiredNotice;
pub use orchestrator::{InitOutcome, OrchestratorBuilder, OrchestratorHooks, SessionOrchestrator};

/// Everything an application usually needs.
pub mod prelude {
    pub use crate::{
        AuthorizedClient, ExpiredNotice, InitOutcome, ResponseAction, SessionOrchestrator,
        VigilConfig, VigilError,
    };
    pub use vigil_activity::{
        ActivityBus, AlertPresenter, InputKind, LogoutReason, SchedulerPhase, UiSignal,
        Visibility, WarningDecision, WarningPrompt,
    };
    pub use vigil_protocol::{
        AccessToken, Credentials, PreferencePatch, RefreshToken, Session, TokenPair,
    };
    pub use vigil_session::{
        AuthBackend, AuthEndpoints, BackendError, FileStore, HttpAuthBackend, MemoryStore,
        PersistedStore, SessionError, SessionSnapshot,
    };
    #[cfg(feature = "reqwest")]
    pub use vigil_transport::ReqwestClient;
    pub use vigil_transport::{HttpClient, HttpRequest, HttpResponse, TransportError};
}
