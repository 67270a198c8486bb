//! Receiver registry: the set of remote viewers and the session flags.
//!
//! Peer-connection callbacks never touch a receiver directly. They push a
//! [`PeerEvent`] through their [`PeerEvents`] handle and the registry drains
//! its inbox under the same lock the fan-out snapshot takes. The soft
//! `should_stream` flag and the [`StreamState`] live behind that lock too.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::SignalingError;
use crate::stream::peer::{MediaTrack, OpenedPeer, PeerLink};
use crate::stream::types::{
    ClientId, GatheringState, KeyframeRequest, PeerState, ReceiverPhase, SessionDescription,
    StreamState,
};

/// Packets buffered per receiver before the sink starts dropping.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

// ── Events ───────────────────────────────────────────────────────

/// Something a peer connection reported.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    StateChanged(PeerState),
    GatheringChanged(GatheringState),
    /// Gathering finished; carries the final local description.
    GatheringComplete(SessionDescription),
    TrackOpened,
    TrackClosed,
    /// The viewer asked for a keyframe (PLI/FIR).
    KeyframeRequested,
}

/// Callback-side handle for one receiver.
///
/// Holds the registry weakly, so a callback outliving its session is a no-op.
#[derive(Clone)]
pub struct PeerEvents {
    client: ClientId,
    receiver: u64,
    registry: Weak<ReceiverRegistry>,
}

impl PeerEvents {
    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn emit(&self, event: PeerEvent) {
        match self.registry.upgrade() {
            Some(registry) => registry.dispatch(self.client, self.receiver, event),
            None => trace!(client = %self.client, ?event, "event after session end"),
        }
    }
}

impl fmt::Debug for PeerEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEvents")
            .field("client", &self.client)
            .field("receiver", &self.receiver)
            .finish()
    }
}

/// Resolves once the receiver's offer has been cached.
pub struct OfferPending {
    client: ClientId,
    ready: oneshot::Receiver<()>,
}

impl OfferPending {
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Fails with [`SignalingError::ReceiverGone`] if the receiver is removed
    /// before gathering completes.
    pub async fn wait(self) -> Result<(), SignalingError> {
        let client = self.client;
        self.ready
            .await
            .map_err(|_| SignalingError::ReceiverGone(client))
    }
}

// ── Registry state ───────────────────────────────────────────────

struct Receiver {
    id: u64,
    client: ClientId,
    link: Arc<dyn PeerLink>,
    packets: mpsc::Sender<Bytes>,
    closed: CancellationToken,
    phase: ReceiverPhase,
    offer: Option<String>,
    connected: bool,
    offer_ready: Option<oneshot::Sender<()>>,
}

struct Envelope {
    client: ClientId,
    receiver: u64,
    event: PeerEvent,
}

struct RegistryState {
    should_stream: bool,
    stream_state: StreamState,
    receivers: HashMap<ClientId, Receiver>,
    inbox: VecDeque<Envelope>,
}

impl RegistryState {
    /// Apply one event. Returns the receiver if the event removed it.
    fn apply(&mut self, envelope: Envelope, keyframes: &KeyframeRequest) -> Option<Receiver> {
        let Envelope {
            client,
            receiver,
            event,
        } = envelope;

        let Some(entry) = self
            .receivers
            .get_mut(&client)
            .filter(|entry| entry.id == receiver)
        else {
            trace!(%client, ?event, "event for a receiver that is gone");
            return None;
        };

        match event {
            PeerEvent::StateChanged(state) if state.is_terminal() => {
                info!(%client, ?state, "receiver left");
                return self.receivers.remove(&client);
            }
            PeerEvent::StateChanged(PeerState::Connected) => {
                entry.connected = true;
                entry.phase = ReceiverPhase::Connected;
                info!(%client, "receiver connected");
            }
            PeerEvent::StateChanged(state) => {
                debug!(%client, ?state, "peer state changed");
            }
            PeerEvent::GatheringChanged(GatheringState::InProgress) => {
                if entry.phase == ReceiverPhase::New {
                    entry.phase = ReceiverPhase::GatheringIce;
                }
            }
            PeerEvent::GatheringChanged(state) => {
                debug!(%client, ?state, "gathering state changed");
            }
            PeerEvent::GatheringComplete(desc) => {
                if entry.offer.is_some() {
                    debug!(%client, "duplicate gathering completion ignored");
                    return None;
                }
                match desc.to_json() {
                    Ok(offer) => {
                        entry.offer = Some(offer);
                        if matches!(entry.phase, ReceiverPhase::New | ReceiverPhase::GatheringIce)
                        {
                            entry.phase = ReceiverPhase::OfferReady;
                        }
                        if let Some(ready) = entry.offer_ready.take() {
                            let _ = ready.send(());
                        }
                        debug!(%client, "offer ready");
                    }
                    Err(e) => {
                        warn!(%client, error = %e, "could not serialize local description");
                        entry.offer_ready = None;
                    }
                }
            }
            PeerEvent::TrackOpened => {
                keyframes.request();
                debug!(%client, "track opened, keyframe requested");
            }
            PeerEvent::KeyframeRequested => {
                keyframes.request();
                trace!(%client, "viewer requested keyframe");
            }
            PeerEvent::TrackClosed => {
                info!(%client, "track closed");
                return self.receivers.remove(&client);
            }
        }
        None
    }
}

/// Gate consulted by the worker loop once per iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopGate {
    pub should_stream: bool,
    pub connected: usize,
}

// ── ReceiverRegistry ─────────────────────────────────────────────

/// All receivers of one streaming session.
pub struct ReceiverRegistry {
    state: Mutex<RegistryState>,
    keyframes: KeyframeRequest,
    next_receiver: AtomicU64,
    queue_depth: usize,
    runtime: Option<Handle>,
}

impl ReceiverRegistry {
    pub fn new(keyframes: KeyframeRequest) -> Arc<Self> {
        Self::with_queue_depth(keyframes, DEFAULT_QUEUE_DEPTH)
    }

    /// Must be called from within a Tokio runtime for packet forwarding and
    /// peer shutdown to run.
    pub fn with_queue_depth(keyframes: KeyframeRequest, queue_depth: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState {
                should_stream: false,
                stream_state: StreamState::Stopped,
                receivers: HashMap::new(),
                inbox: VecDeque::new(),
            }),
            keyframes,
            next_receiver: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
            runtime: Handle::try_current().ok(),
        })
    }

    pub fn keyframes(&self) -> &KeyframeRequest {
        &self.keyframes
    }

    /// Event handle for a receiver about to be built for `client`.
    pub fn events_for(self: &Arc<Self>, client: ClientId) -> PeerEvents {
        PeerEvents {
            client,
            receiver: self.next_receiver.fetch_add(1, Ordering::Relaxed),
            registry: Arc::downgrade(self),
        }
    }

    /// Insert the receiver built for `events`, replacing any previous
    /// receiver of the same client.
    ///
    /// Fails with [`SignalingError::NotStreaming`] once the session has left
    /// `Running`; the peer is closed in that case.
    pub fn insert(
        &self,
        events: &PeerEvents,
        peer: OpenedPeer,
    ) -> Result<OfferPending, SignalingError> {
        let client = events.client;
        let (packets, queue) = mpsc::channel(self.queue_depth);
        let (ready_tx, ready) = oneshot::channel();
        let closed = CancellationToken::new();
        let track = peer.track;

        let receiver = Receiver {
            id: events.receiver,
            client,
            link: peer.link,
            packets,
            closed: closed.clone(),
            phase: ReceiverPhase::New,
            offer: None,
            connected: false,
            offer_ready: Some(ready_tx),
        };

        let replaced = {
            let mut state = self.state.lock();
            if !state.should_stream {
                drop(state);
                warn!(%client, "session not streaming, receiver rejected");
                self.retire(receiver);
                return Err(SignalingError::NotStreaming(client));
            }
            state.receivers.insert(client, receiver)
        };
        self.spawn(forward_packets(client, track, queue, closed));
        if let Some(old) = replaced {
            info!(%client, "replacing existing receiver");
            self.retire(old);
        }
        debug!(%client, "receiver registered");

        Ok(OfferPending { client, ready })
    }

    /// Queue an event and drain the inbox.
    pub fn dispatch(&self, client: ClientId, receiver: u64, event: PeerEvent) {
        let retired = {
            let mut state = self.state.lock();
            state.inbox.push_back(Envelope {
                client,
                receiver,
                event,
            });
            let mut retired = Vec::new();
            while let Some(envelope) = state.inbox.pop_front() {
                retired.extend(state.apply(envelope, &self.keyframes));
            }
            retired
        };
        for receiver in retired {
            self.retire(receiver);
        }
    }

    /// The cached offer for `client`.
    pub fn offer(&self, client: ClientId) -> Result<String, SignalingError> {
        let state = self.state.lock();
        let receiver = state
            .receivers
            .get(&client)
            .ok_or(SignalingError::NoReceiver(client))?;
        receiver
            .offer
            .clone()
            .ok_or(SignalingError::OfferNotReady(client))
    }

    pub fn link(&self, client: ClientId) -> Result<Arc<dyn PeerLink>, SignalingError> {
        self.state
            .lock()
            .receivers
            .get(&client)
            .map(|r| Arc::clone(&r.link))
            .ok_or(SignalingError::NoReceiver(client))
    }

    pub fn mark_answer_applied(&self, client: ClientId) {
        if let Some(r) = self.state.lock().receivers.get_mut(&client) {
            if r.phase == ReceiverPhase::OfferReady {
                r.phase = ReceiverPhase::AnswerApplied;
            }
        }
    }

    pub fn phase(&self, client: ClientId) -> Option<ReceiverPhase> {
        self.state.lock().receivers.get(&client).map(|r| r.phase)
    }

    pub fn is_connected(&self, client: ClientId) -> bool {
        self.state
            .lock()
            .receivers
            .get(&client)
            .is_some_and(|r| r.connected)
    }

    /// Snapshot of the packet queues of every connected receiver.
    pub fn connected_queues(&self) -> Vec<(ClientId, mpsc::Sender<Bytes>)> {
        self.state
            .lock()
            .receivers
            .values()
            .filter(|r| r.connected)
            .map(|r| (r.client, r.packets.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connected_count(&self) -> usize {
        self.state
            .lock()
            .receivers
            .values()
            .filter(|r| r.connected)
            .count()
    }

    /// Remove `client`'s receiver. Returns `false` if there was none.
    pub fn remove(&self, client: ClientId) -> bool {
        let removed = self.state.lock().receivers.remove(&client);
        match removed {
            Some(receiver) => {
                self.retire(receiver);
                true
            }
            None => false,
        }
    }

    /// Remove `client`'s receiver only if it is still the one built for `events`.
    pub(crate) fn remove_exact(&self, events: &PeerEvents) -> bool {
        let removed = {
            let mut state = self.state.lock();
            match state.receivers.get(&events.client) {
                Some(r) if r.id == events.receiver => state.receivers.remove(&events.client),
                _ => None,
            }
        };
        match removed {
            Some(receiver) => {
                self.retire(receiver);
                true
            }
            None => false,
        }
    }

    /// Remove every receiver and close its peer connection.
    pub fn clear(&self) -> usize {
        let drained: Vec<Receiver> = {
            let mut state = self.state.lock();
            state.inbox.clear();
            state.receivers.drain().map(|(_, r)| r).collect()
        };
        let count = drained.len();
        for receiver in drained {
            self.retire(receiver);
        }
        count
    }

    // ── Session flags ───────────────────────────────────────────

    pub fn should_stream(&self) -> bool {
        self.state.lock().should_stream
    }

    pub fn stream_state(&self) -> StreamState {
        self.state.lock().stream_state
    }

    pub(crate) fn set_stream_state(&self, stream_state: StreamState) {
        let mut state = self.state.lock();
        state.stream_state = stream_state;
        state.should_stream = stream_state == StreamState::Running;
    }

    /// Flip `should_stream` off. Returns `false` if it already was.
    pub(crate) fn request_stop(&self) -> bool {
        let mut state = self.state.lock();
        if !state.should_stream {
            return false;
        }
        state.should_stream = false;
        state.stream_state = StreamState::StoppingRequested;
        true
    }

    pub(crate) fn gate(&self) -> LoopGate {
        let state = self.state.lock();
        LoopGate {
            should_stream: state.should_stream,
            connected: state.receivers.values().filter(|r| r.connected).count(),
        }
    }

    // ── Internals ───────────────────────────────────────────────

    fn retire(&self, receiver: Receiver) {
        let Receiver {
            client,
            link,
            closed,
            ..
        } = receiver;
        closed.cancel();
        self.spawn(async move {
            link.close().await;
            debug!(%client, "peer connection closed");
        });
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match &self.runtime {
            Some(runtime) => {
                runtime.spawn(task);
            }
            None => warn!("no runtime available, receiver task not started"),
        }
    }
}

/// Drain one receiver's queue into its track, in order.
async fn forward_packets(
    client: ClientId,
    track: Arc<dyn MediaTrack>,
    mut queue: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
) {
    let mut failures: u64 = 0;
    loop {
        let packet = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            packet = queue.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        if let Err(e) = track.write_packet(&packet).await {
            failures += 1;
            if failures == 1 || failures % 100 == 0 {
                debug!(%client, failures, error = %e, "track write failed");
            }
        }
    }
    trace!(%client, "packet forwarder finished");
}
