//! Streaming session: the capture worker and its signaling surface.
//!
//! A session builds its pipeline on a dedicated blocking worker
//! (`spawn_blocking`) and runs one frame per iteration:
//!
//! 1. cancellation requested → exit;
//! 2. `should_stream` cleared → exit;
//! 3. no connected receiver → sleep [`SessionConfig::idle_backoff`], retry;
//! 4. otherwise [`MediaPipeline::pump`].
//!
//! Teardown always runs on the worker: the pipeline is dropped (releasing
//! every native handle), remaining receivers are closed, and the stop signal
//! is raised exactly once.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, SetupError, SignalingError, StreamError};
use crate::stream::peer::PeerConnector;
use crate::stream::pipeline::{MediaPipeline, PipelineFactory, Pump};
use crate::stream::registry::{OfferPending, ReceiverRegistry};
use crate::stream::sink::TransportSink;
use crate::stream::types::{ClientId, DEFAULT_SSRC, KeyframeRequest, SessionDescription, StreamState};

// ── SessionConfig ────────────────────────────────────────────────

/// Configuration for [`StreamingSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// SSRC stamped on every outgoing packet.
    pub ssrc: u32,
    /// Sleep between checks while nobody is watching.
    pub idle_backoff: Duration,
    /// Packets buffered per receiver.
    pub queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ssrc: DEFAULT_SSRC,
            idle_backoff: Duration::from_millis(100),
            queue_depth: crate::stream::registry::DEFAULT_QUEUE_DEPTH,
        }
    }
}

// ── StopSignal ───────────────────────────────────────────────────

/// Raises the stop-completion signal when dropped.
struct StopSignal(watch::Sender<bool>);

impl Drop for StopSignal {
    fn drop(&mut self) {
        self.0.send_replace(true);
        debug!("stop signal raised");
    }
}

// ── StreamingSession ─────────────────────────────────────────────

/// One running relay instance.
///
/// # Lifetime
///
/// Created by [`start`](Self::start), which returns only once the pipeline
/// is fully set up. Ends after [`stop`](Self::stop), cancellation, or a
/// fatal pipeline error; [`wait_stopped`](Self::wait_stopped) observes the
/// end of teardown.
pub struct StreamingSession {
    registry: Arc<ReceiverRegistry>,
    connector: Arc<dyn PeerConnector>,
    cancel: CancellationToken,
    stopped: watch::Receiver<bool>,
    worker: Mutex<Option<JoinHandle<Result<(), PipelineError>>>>,
}

impl StreamingSession {
    /// Build the pipeline on a fresh worker and start streaming.
    ///
    /// `cancel` is owned by the caller; cancelling it ends the session.
    pub async fn start(
        factory: Arc<dyn PipelineFactory>,
        connector: Arc<dyn PeerConnector>,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> Result<Self, StreamError> {
        let registry = ReceiverRegistry::with_queue_depth(KeyframeRequest::new(), config.queue_depth);
        registry.set_stream_state(StreamState::Starting);

        let (setup_tx, setup_rx) = oneshot::channel();
        let (stopped_tx, stopped) = watch::channel(false);

        let worker = {
            let registry = Arc::clone(&registry);
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                run_worker(factory, registry, config, cancel, setup_tx, StopSignal(stopped_tx))
            })
        };

        match setup_rx.await {
            Ok(Ok(())) => {
                info!("streaming session started");
                Ok(Self {
                    registry,
                    connector,
                    cancel,
                    stopped,
                    worker: Mutex::new(Some(worker)),
                })
            }
            Ok(Err(e)) => {
                error!(error = %e, "streaming setup failed");
                // The worker has already torn down; wait for it to exit.
                let _ = worker.await;
                Err(StreamError::Setup(e))
            }
            Err(_) => match worker.await {
                Err(e) => Err(StreamError::from(e)),
                Ok(_) => Err(StreamError::Worker("worker exited before setup".into())),
            },
        }
    }

    pub fn state(&self) -> StreamState {
        self.registry.stream_state()
    }

    /// The running flag as seen by the worker.
    pub fn is_streaming(&self) -> bool {
        self.registry.should_stream()
    }

    /// `true` once teardown has completed.
    pub fn is_finished(&self) -> bool {
        *self.stopped.borrow()
    }

    pub fn registry(&self) -> &Arc<ReceiverRegistry> {
        &self.registry
    }

    /// Ask the worker to exit after the current iteration.
    pub fn request_stop(&self) -> bool {
        let requested = self.registry.request_stop();
        if requested {
            info!("stop requested");
        }
        requested
    }

    /// Cancel the session's token.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolve once teardown has finished.
    pub async fn wait_stopped(&self) {
        let mut stopped = self.stopped.clone();
        // Err means the sender is gone, which only happens after it fired.
        let _ = stopped.wait_for(|done| *done).await;
    }

    /// Request a stop, wait for teardown, and report how the loop ended.
    ///
    /// Calling this again returns `Ok(())` once the worker was joined.
    pub async fn stop(&self) -> Result<(), StreamError> {
        self.request_stop();
        self.wait_stopped().await;
        let worker = self.worker.lock().take();
        match worker {
            Some(worker) => {
                worker.await??;
                Ok(())
            }
            None => Ok(()),
        }
    }

    // ── Signaling ───────────────────────────────────────────────

    /// Build a receiver for `client` and start its negotiation.
    ///
    /// The returned [`OfferPending`] resolves once the offer is cached. A
    /// stop that lands while the peer is being opened makes this fail with
    /// [`SignalingError::NotStreaming`].
    pub async fn register_receiver(&self, client: ClientId) -> Result<OfferPending, SignalingError> {
        let events = self.registry.events_for(client);
        let peer = self.connector.open(events.clone()).await?;
        let link = Arc::clone(&peer.link);
        let pending = self.registry.insert(&events, peer)?;

        if let Err(e) = link.start_negotiation().await {
            warn!(%client, error = %e, "negotiation failed to start");
            self.registry.remove_exact(&events);
            return Err(e);
        }
        Ok(pending)
    }

    /// The cached `{type, sdp}` offer for `client`.
    pub fn offer(&self, client: ClientId) -> Result<String, SignalingError> {
        self.registry.offer(client)
    }

    /// Register, wait for gathering to complete, and return the offer.
    pub async fn request_offer(&self, client: ClientId) -> Result<String, SignalingError> {
        self.register_receiver(client).await?.wait().await?;
        self.offer(client)
    }

    pub async fn set_answer(
        &self,
        client: ClientId,
        answer: &SessionDescription,
    ) -> Result<(), SignalingError> {
        let link = self.registry.link(client)?;
        link.apply_answer(answer).await?;
        self.registry.mark_answer_applied(client);
        debug!(%client, "answer applied");
        Ok(())
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        // A session dropped without `stop` must not leave the worker running.
        if !self.is_finished() {
            self.registry.request_stop();
            self.cancel.cancel();
        }
    }
}

// ── Worker ───────────────────────────────────────────────────────

fn run_worker(
    factory: Arc<dyn PipelineFactory>,
    registry: Arc<ReceiverRegistry>,
    config: SessionConfig,
    cancel: CancellationToken,
    setup: oneshot::Sender<Result<(), SetupError>>,
    stopped: StopSignal,
) -> Result<(), PipelineError> {
    let _stopped = stopped;

    let sink = TransportSink::new(Arc::clone(&registry), config.ssrc);
    let keyframes = registry.keyframes().clone();
    let mut pipeline = match factory.open(sink, keyframes) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            registry.set_stream_state(StreamState::Stopped);
            let _ = setup.send(Err(e));
            return Ok(());
        }
    };

    registry.set_stream_state(StreamState::Running);
    if setup.send(Ok(())).is_err() {
        warn!("session start was abandoned");
        registry.request_stop();
    }

    let outcome = run_loop(pipeline.as_mut(), &registry, &cancel, config.idle_backoff);

    drop(pipeline);
    let closed = registry.clear();
    registry.set_stream_state(StreamState::Stopped);
    match &outcome {
        Ok(()) => info!(receivers_closed = closed, "streaming session stopped"),
        Err(e) => error!(error = %e, receivers_closed = closed, "streaming session failed"),
    }
    outcome
}

fn run_loop(
    pipeline: &mut dyn MediaPipeline,
    registry: &ReceiverRegistry,
    cancel: &CancellationToken,
    idle_backoff: Duration,
) -> Result<(), PipelineError> {
    let mut delivered: u64 = 0;
    let mut idle = false;

    loop {
        if cancel.is_cancelled() {
            info!("cancellation requested");
            return Ok(());
        }
        let gate = registry.gate();
        if !gate.should_stream {
            return Ok(());
        }
        if gate.connected == 0 {
            if !idle {
                debug!("no connected receivers, idling");
                idle = true;
            }
            std::thread::sleep(idle_backoff);
            continue;
        }
        idle = false;

        match pipeline.pump()? {
            Pump::Delivered => {
                delivered += 1;
                if delivered % 300 == 0 {
                    debug!(frames = delivered, receivers = gate.connected, "streaming");
                }
            }
            Pump::NeedMoreInput => continue,
        }
    }
}
