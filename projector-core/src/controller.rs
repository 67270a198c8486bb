//! The single owned session slot the command layer talks to.
//!
//! At most one [`StreamingSession`] exists at a time. Start and stop hold
//! the slot lock for their whole duration, so a stop that waits for teardown
//! also keeps a concurrent start out until the old session is gone.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{SignalingError, StreamError};
use crate::stream::{
    ClientId, PeerConnector, PipelineFactory, SessionConfig, SessionDescription, StreamingSession,
};

pub struct StreamController {
    factory: Arc<dyn PipelineFactory>,
    connector: Arc<dyn PeerConnector>,
    config: SessionConfig,
    shutdown: CancellationToken,
    session: Mutex<Option<Arc<StreamingSession>>>,
}

impl StreamController {
    pub fn new(
        factory: Arc<dyn PipelineFactory>,
        connector: Arc<dyn PeerConnector>,
        config: SessionConfig,
    ) -> Self {
        Self::with_shutdown(factory, connector, config, CancellationToken::new())
    }

    /// Sessions get a child of `shutdown`, so cancelling it ends them.
    pub fn with_shutdown(
        factory: Arc<dyn PipelineFactory>,
        connector: Arc<dyn PeerConnector>,
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            factory,
            connector,
            config,
            shutdown,
            session: Mutex::new(None),
        }
    }

    /// Start a session. Fails with [`StreamError::AlreadyRunning`] if one is live.
    pub async fn start(&self) -> Result<(), StreamError> {
        let mut slot = self.session.lock().await;
        if let Some(current) = slot.as_ref() {
            if !current.is_finished() {
                return Err(StreamError::AlreadyRunning);
            }
            if let Some(finished) = slot.take() {
                reap(&finished).await;
            }
        }

        let session = StreamingSession::start(
            Arc::clone(&self.factory),
            Arc::clone(&self.connector),
            self.config.clone(),
            self.shutdown.child_token(),
        )
        .await?;
        *slot = Some(Arc::new(session));
        Ok(())
    }

    /// Stop the live session and wait for its teardown.
    ///
    /// Fails with [`StreamError::AlreadyStopped`] if no session is live,
    /// including one that already ended on its own.
    pub async fn stop(&self) -> Result<(), StreamError> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.take() else {
            return Err(StreamError::AlreadyStopped);
        };
        if session.is_finished() {
            reap(&session).await;
            return Err(StreamError::AlreadyStopped);
        }
        session.stop().await
    }

    pub async fn is_streaming(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.is_streaming())
    }

    /// The live session, if any. The slot lock is released on return.
    pub async fn running_session(&self) -> Option<Arc<StreamingSession>> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|s| s.is_streaming())
            .map(Arc::clone)
    }

    /// Register `client` and wait for its offer. `None` when not streaming,
    /// including a stop that lands while the offer is being built.
    pub async fn request_offer(&self, client: ClientId) -> Result<Option<String>, SignalingError> {
        let Some(session) = self.running_session().await else {
            return Ok(None);
        };
        match session.request_offer(client).await {
            Ok(offer) => Ok(Some(offer)),
            Err(SignalingError::NotStreaming(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Apply `answer` for `client`. Returns `false` (ignored) when not streaming.
    pub async fn set_answer(
        &self,
        client: ClientId,
        answer: &serde_json::Value,
    ) -> Result<bool, SignalingError> {
        let Some(session) = self.running_session().await else {
            return Ok(false);
        };
        let answer = SessionDescription::from_value(answer)?;
        session.set_answer(client, &answer).await?;
        Ok(true)
    }

    /// Cancel the shutdown token and tear down any live session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            info!("shutting down streaming session");
            reap(&session).await;
        }
    }
}

async fn reap(session: &StreamingSession) {
    if let Err(e) = session.stop().await {
        warn!(error = %e, "previous session ended with an error");
    }
}
