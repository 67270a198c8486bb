//! # projector-core
//!
//! Screen-capture-to-WebRTC relay for the text projector.
//!
//! This crate contains:
//! - **Stream pipeline**: FFmpeg window capture, VP9 encoding and RTP muxing
//!   into a custom I/O sink (`stream::capture`, `stream::encoder`, `stream::pipeline`)
//! - **Fan-out**: `TransportSink` stamping a fixed SSRC and forwarding packets
//!   to every connected viewer
//! - **Receivers**: `ReceiverRegistry`, the per-viewer peer connections and
//!   their signaling state, driven by an event inbox
//! - **Streaming task**: `StreamingSession`, the blocking capture loop with
//!   cooperative cancellation and confirmed teardown
//! - **Controller**: `StreamController`, the single owned session slot used by
//!   the command layer
//! - **Protocol**: JSON command parsing and replies for the signaling messages
//! - **Error**: typed, `thiserror`-based error hierarchy

pub mod controller;
pub mod error;
pub mod protocol;
pub mod stream;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use controller::StreamController;
pub use error::{PipelineError, ProtocolError, SetupError, SignalingError, StreamError};
pub use protocol::{CommandHandler, Reply, StreamCommand};
pub use stream::{
    ClientId, FfmpegPipelineFactory, KeyframeRequest, MediaPipeline, MediaTrack, OpenedPeer,
    PeerConnector, PeerEvent, PeerEvents, PeerLink, PeerState, PipelineConfig, PipelineFactory,
    Pump, ReceiverRegistry, RtcConfig, SessionConfig, SessionDescription, StreamState,
    StreamingSession, TransportSink, WebRtcConnector,
};
