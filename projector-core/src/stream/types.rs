//! Common value types shared across the relay.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::SignalingError;

/// SSRC stamped on every outgoing RTP packet.
pub const DEFAULT_SSRC: u32 = 42;

/// RTP payload type advertised for VP9 and configured on the muxer.
pub const VP9_PAYLOAD_TYPE: u8 = 96;

/// RTP clock rate for video.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

// ── ClientId ─────────────────────────────────────────────────────

/// Identity of a command-channel client.
///
/// Receivers refer to their client by this value only; the connection itself
/// is owned by the command layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

impl ClientId {
    /// Allocate a fresh, process-unique identity.
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

// ── SessionDescription ───────────────────────────────────────────

/// The `{type, sdp}` envelope exchanged on the command channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(kind: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            sdp: sdp.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::MalformedDescription(e.to_string()))
    }

    /// Parse an envelope, rejecting missing fields and empty SDP.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, SignalingError> {
        let desc: Self = serde_json::from_value(value.clone())
            .map_err(|e| SignalingError::MalformedDescription(e.to_string()))?;
        if desc.sdp.trim().is_empty() {
            return Err(SignalingError::MalformedDescription("empty sdp".into()));
        }
        Ok(desc)
    }
}

// ── Peer and receiver states ─────────────────────────────────────

/// Peer-connection state as reported by the transport library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// States after which the receiver is removed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    InProgress,
    Complete,
}

/// Signaling progress of one receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverPhase {
    New,
    GatheringIce,
    OfferReady,
    AnswerApplied,
    Connected,
}

/// Lifecycle of the streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Starting,
    Running,
    StoppingRequested,
}

// ── KeyframeRequest ──────────────────────────────────────────────

/// Pending-keyframe flag shared between peer callbacks and the encoder.
///
/// Any number of requests before the next frame collapse into one intra
/// frame.
#[derive(Debug, Clone, Default)]
pub struct KeyframeRequest(Arc<AtomicBool>);

impl KeyframeRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume the pending request, if any.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
