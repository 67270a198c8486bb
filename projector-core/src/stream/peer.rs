//! Seams between the receiver registry and the WebRTC library.
//!
//! The registry only ever talks to these traits. [`WebRtcConnector`]
//! (`stream::rtc`) is the production implementation; tests plug in doubles.
//!
//! [`WebRtcConnector`]: crate::stream::WebRtcConnector

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SignalingError;
use crate::stream::registry::PeerEvents;
use crate::stream::types::SessionDescription;

/// Send side of a receiver's outbound video track.
#[async_trait]
pub trait MediaTrack: Send + Sync {
    /// Write one RTP packet to the track.
    async fn write_packet(&self, packet: &[u8]) -> Result<(), SignalingError>;
}

/// Control side of a receiver's peer connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create the local offer and begin ICE gathering.
    ///
    /// Completion is reported asynchronously as a
    /// [`PeerEvent::GatheringComplete`](crate::stream::PeerEvent::GatheringComplete).
    async fn start_negotiation(&self) -> Result<(), SignalingError>;

    /// Apply the viewer's answer as the remote description.
    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), SignalingError>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// A freshly built peer connection with its send-only track attached.
pub struct OpenedPeer {
    pub link: Arc<dyn PeerLink>,
    pub track: Arc<dyn MediaTrack>,
}

/// Builds one peer connection per receiver.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Build a connection and install its callbacks, which report through
    /// `events`. Must not start negotiation.
    async fn open(&self, events: PeerEvents) -> Result<OpenedPeer, SignalingError>;
}
