//! Screen relay pipeline.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | Shared value types (`ClientId`, `SessionDescription`, states) |
//! | `ffmpeg` | Owned wrappers over raw FFmpeg handles |
//! | [`capture`] | Window capture, decoder and YUV420P converter |
//! | [`encoder`] | VP9 encoder + RTP muxer on a custom I/O sink |
//! | [`pipeline`] | `MediaPipeline` trait and the FFmpeg pipeline |
//! | [`sink`] | SSRC stamping and fan-out to connected receivers |
//! | [`registry`] | Receivers, peer event inbox, session flags |
//! | [`peer`] | Traits separating the registry from WebRTC |
//! | [`rtc`] | `webrtc-rs` implementation of the peer traits |
//! | [`service`] | `StreamingSession` worker lifecycle and signaling |

pub mod capture;
pub mod encoder;
mod ffmpeg;
pub mod peer;
pub mod pipeline;
pub mod registry;
pub mod rtc;
pub mod service;
pub mod sink;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use capture::CaptureConfig;
pub use encoder::EncoderConfig;
pub use peer::{MediaTrack, OpenedPeer, PeerConnector, PeerLink};
pub use pipeline::{FfmpegPipelineFactory, MediaPipeline, PipelineConfig, PipelineFactory, Pump};
pub use registry::{OfferPending, PeerEvent, PeerEvents, ReceiverRegistry};
pub use rtc::{RtcConfig, WebRtcConnector};
pub use service::{SessionConfig, StreamingSession};
pub use sink::TransportSink;
pub use types::{
    ClientId, DEFAULT_SSRC, GatheringState, KeyframeRequest, PeerState, ReceiverPhase,
    SessionDescription, StreamState,
};
