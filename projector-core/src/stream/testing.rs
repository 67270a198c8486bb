//! Test doubles for the peer and pipeline seams.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{PipelineError, SetupError, SignalingError};
use crate::stream::peer::{MediaTrack, OpenedPeer, PeerConnector, PeerLink};
use crate::stream::pipeline::{MediaPipeline, PipelineFactory, Pump};
use crate::stream::registry::{PeerEvent, PeerEvents, ReceiverRegistry};
use crate::stream::sink::TransportSink;
use crate::stream::types::{
    ClientId, GatheringState, KeyframeRequest, SessionDescription, StreamState,
};

pub fn offer_for(client: ClientId) -> SessionDescription {
    SessionDescription::new(
        "offer",
        format!("v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=-\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n", client.as_u64()),
    )
}

/// A registry in the `Running` state, accepting receivers.
pub fn live_registry() -> Arc<ReceiverRegistry> {
    live_registry_with_depth(crate::stream::registry::DEFAULT_QUEUE_DEPTH)
}

pub fn live_registry_with_depth(queue_depth: usize) -> Arc<ReceiverRegistry> {
    let registry = ReceiverRegistry::with_queue_depth(KeyframeRequest::new(), queue_depth);
    registry.set_stream_state(StreamState::Running);
    registry
}

/// A 12-byte RTP header followed by `payload`.
pub fn rtp_packet(seq: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x80, 96];
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes());
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

// ── Peers ────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct PacketLog(Arc<Mutex<Vec<Vec<u8>>>>);

impl PacketLog {
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Poll until at least `count` packets arrived.
    pub async fn wait_for(&self, count: usize) -> bool {
        for _ in 0..200 {
            if self.len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

pub struct FakeTrack(PacketLog);

impl FakeTrack {
    pub fn new() -> (Self, PacketLog) {
        let log = PacketLog::default();
        (Self(log.clone()), log)
    }
}

#[async_trait]
impl MediaTrack for FakeTrack {
    async fn write_packet(&self, packet: &[u8]) -> Result<(), SignalingError> {
        self.0.0.lock().push(packet.to_vec());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLink {
    events: Option<PeerEvents>,
    negotiations: AtomicUsize,
    closes: AtomicUsize,
    answers: Mutex<Vec<SessionDescription>>,
}

impl FakeLink {
    /// A link that completes gathering as soon as negotiation starts.
    pub fn gathering(events: PeerEvents) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    pub fn negotiations(&self) -> usize {
        self.negotiations.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn answers(&self) -> Vec<SessionDescription> {
        self.answers.lock().clone()
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn start_negotiation(&self) -> Result<(), SignalingError> {
        self.negotiations.fetch_add(1, Ordering::SeqCst);
        if let Some(events) = &self.events {
            events.emit(PeerEvent::GatheringChanged(GatheringState::InProgress));
            events.emit(PeerEvent::GatheringComplete(offer_for(events.client())));
        }
        Ok(())
    }

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), SignalingError> {
        if answer.kind != "answer" && answer.kind != "pranswer" {
            return Err(SignalingError::MalformedDescription(format!(
                "unexpected type `{}`",
                answer.kind
            )));
        }
        self.answers.lock().push(answer.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out [`FakeLink`]s and remembering them per client.
#[derive(Default)]
pub struct FakeConnector {
    manual: bool,
    peers: Mutex<Vec<(PeerEvents, Arc<FakeLink>, PacketLog)>>,
}

impl FakeConnector {
    /// Links never complete gathering on their own.
    pub fn manual() -> Self {
        Self {
            manual: true,
            ..Self::default()
        }
    }

    pub fn peer(&self, client: ClientId) -> Option<(PeerEvents, Arc<FakeLink>, PacketLog)> {
        self.peers
            .lock()
            .iter()
            .rev()
            .find(|(events, ..)| events.client() == client)
            .cloned()
    }

    pub fn opened(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn open(&self, events: PeerEvents) -> Result<OpenedPeer, SignalingError> {
        let link = Arc::new(if self.manual {
            FakeLink::default()
        } else {
            FakeLink::gathering(events.clone())
        });
        let (track, log) = FakeTrack::new();
        self.peers
            .lock()
            .push((events, Arc::clone(&link), log));
        Ok(OpenedPeer {
            link,
            track: Arc::new(track),
        })
    }
}

// ── Pipelines ────────────────────────────────────────────────────

/// Counters shared between a [`FakeFactory`] and its pipelines.
#[derive(Clone, Default)]
pub struct PipelineProbe {
    pub opens: Arc<AtomicUsize>,
    pub pumps: Arc<AtomicUsize>,
    pub teardowns: Arc<AtomicUsize>,
    pub keyframes: Arc<AtomicUsize>,
}

impl PipelineProbe {
    pub fn pumps(&self) -> usize {
        self.pumps.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub enum FakeBehaviour {
    /// Emit one RTP packet per pump.
    Packets,
    /// Fail at setup.
    FailSetup(SetupError),
    /// Fail on the given pump (1-based).
    FailAt(usize),
}

pub struct FakeFactory {
    pub probe: PipelineProbe,
    behaviour: FakeBehaviour,
}

impl FakeFactory {
    pub fn new(behaviour: FakeBehaviour) -> Self {
        Self {
            probe: PipelineProbe::default(),
            behaviour,
        }
    }
}

impl PipelineFactory for FakeFactory {
    fn open(
        &self,
        sink: TransportSink,
        keyframes: KeyframeRequest,
    ) -> Result<Box<dyn MediaPipeline>, SetupError> {
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        if let FakeBehaviour::FailSetup(e) = &self.behaviour {
            return Err(e.clone());
        }
        Ok(Box::new(FakePipeline {
            sink,
            keyframes,
            probe: self.probe.clone(),
            behaviour: self.behaviour.clone(),
            seq: 0,
        }))
    }
}

struct FakePipeline {
    sink: TransportSink,
    keyframes: KeyframeRequest,
    probe: PipelineProbe,
    behaviour: FakeBehaviour,
    seq: u16,
}

impl MediaPipeline for FakePipeline {
    fn pump(&mut self) -> Result<Pump, PipelineError> {
        let n = self.probe.pumps.fetch_add(1, Ordering::SeqCst) + 1;
        if let FakeBehaviour::FailAt(at) = self.behaviour {
            if n >= at {
                return Err(PipelineError::Encode("injected".into()));
            }
        }
        if self.keyframes.take() {
            self.probe.keyframes.fetch_add(1, Ordering::SeqCst);
        }
        self.seq = self.seq.wrapping_add(1);
        // Encoder-chosen SSRC; the sink must overwrite it.
        let packet = rtp_packet(self.seq, 0xdead_beef, &[0u8; 32]);
        self.sink.handle_write(&packet);
        std::thread::sleep(Duration::from_millis(1));
        Ok(Pump::Delivered)
    }
}

impl Drop for FakePipeline {
    fn drop(&mut self) {
        self.probe.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}
