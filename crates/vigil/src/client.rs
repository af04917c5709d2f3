//! An HTTP client with the orchestrator's request/response hooks applied.

use std::sync::Arc;

use tracing::debug;
use vigil_activity::AlertPresenter;
use vigil_session::{AuthBackend, PersistedStore};
use vigil_transport::{HttpClient, HttpRequest, HttpResponse};

use crate::{SessionOrchestrator, VigilError};

/// What to do with a response after the incoming hook has seen it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAction {
    /// Hand the response to the caller.
    Deliver(HttpResponse),
    /// Send this request again. It carries the renewed credential and is
    /// marked as retried.
    Replay(HttpRequest),
}

/// Wraps any [`HttpClient`] so every request goes through
/// [`prepare_request`](SessionOrchestrator::prepare_request) and every
/// response through
/// [`intercept_response`](SessionOrchestrator::intercept_response).
///
/// A request is sent at most twice: once, and once more after a 401 led
/// to a successful refresh.
pub struct AuthorizedClient<C, B, S, P> {
    inner: C,
    orchestrator: Arc<SessionOrchestrator<B, S, P>>,
}

impl<C, B, S, P> AuthorizedClient<C, B, S, P>
where
    C: HttpClient,
    B: AuthBackend,
    S: PersistedStore,
    P: AlertPresenter,
{
    pub fn new(inner: C, orchestrator: Arc<SessionOrchestrator<B, S, P>>) -> Self {
        Self {
            inner,
            orchestrator,
        }
    }

    /// Sends `request` with the current credential.
    ///
    /// # Errors
    /// Whatever the hooks or the inner client return; see
    /// [`SessionOrchestrator::intercept_response`].
    pub async fn send(&self, mut request: HttpRequest) -> Result<HttpResponse, VigilError> {
        loop {
            self.orchestrator.prepare_request(&mut request)?;
            let response = self.inner.send(request.clone()).await?;
            match self
                .orchestrator
                .intercept_response(&request, response)
                .await?
            {
                ResponseAction::Deliver(response) => return Ok(response),
                ResponseAction::Replay(replay) => {
                    debug!(request = %replay.id, "replaying with renewed credential");
                    request = replay;
                }
            }
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn orchestrator(&self) -> &Arc<SessionOrchestrator<B, S, P>> {
        &self.orchestrator
    }
}
