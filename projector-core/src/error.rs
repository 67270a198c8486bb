//! Domain-specific error types for the screen relay.
//!
//! Errors are grouped by where they surface:
//! - [`SetupError`] at start time, before the session reaches `Running`;
//! - [`PipelineError`] mid-stream, fatal to the current session only;
//! - [`SignalingError`] per signaling request, never touching the session;
//! - [`StreamError`] for the command layer driving start/stop;
//! - [`ProtocolError`] for command lines that cannot be parsed.
//!
//! "Need more input" from the codecs is not an error at all; it is reported
//! as [`Pump::NeedMoreInput`](crate::stream::Pump::NeedMoreInput) and retried.

use thiserror::Error;

use crate::stream::ClientId;

// ── SetupError ───────────────────────────────────────────────────

/// A capture, encoder or muxer configuration step failed.
///
/// Every variant names the step, so a failed start can be told apart on the
/// command channel.
#[derive(Debug, Clone, Error)]
pub enum SetupError {
    /// FFmpeg could not be initialised.
    #[error("ffmpeg initialisation failed: {0}")]
    Init(String),

    /// The capture device (e.g. `gdigrab`) is not compiled into FFmpeg.
    #[error("capture input format `{0}` not found")]
    InputFormatNotFound(String),

    /// A capture option could not be stored.
    #[error("invalid capture option {key}={value}: {reason}")]
    CaptureOption {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// The capture device refused to open the target.
    #[error("could not open capture target `{target}`: {reason}")]
    CaptureOpen { target: String, reason: String },

    /// Stream probing failed.
    #[error("could not probe capture stream: {0}")]
    StreamProbe(String),

    /// The capture opened but carries no video stream.
    #[error("capture produced no video stream")]
    NoVideoStream,

    /// No decoder exists for the captured stream's codec.
    #[error("no decoder for the captured stream")]
    DecoderNotFound,

    /// The decoder context could not be allocated, configured or opened.
    #[error("decoder setup failed: {0}")]
    DecoderOpen(String),

    /// The RTP output context could not be allocated.
    #[error("RTP muxer allocation failed: {0}")]
    MuxerAlloc(String),

    /// The custom write buffer or I/O context could not be allocated.
    #[error("custom I/O context allocation failed")]
    IoAlloc,

    /// The encoder is not compiled into FFmpeg.
    #[error("encoder `{0}` not found")]
    EncoderNotFound(&'static str),

    /// The muxer refused a new output stream.
    #[error("output stream allocation failed")]
    StreamAlloc,

    /// Codec parameters could not be negotiated between encoder and stream.
    #[error("encoder parameter negotiation failed: {0}")]
    EncoderParameters(String),

    /// The encoder refused to open with the configured options.
    #[error("encoder open failed: {0}")]
    EncoderOpen(String),

    /// The RTP muxer header could not be written.
    #[error("muxer header write failed: {0}")]
    MuxerHeader(String),

    /// The colorspace/size converter could not be created.
    #[error("scaler setup failed for {width}x{height}")]
    Scaler { width: i32, height: i32 },

    /// A packet or frame buffer could not be allocated.
    #[error("{0} allocation failed")]
    Allocation(&'static str),
}

// ── PipelineError ────────────────────────────────────────────────

/// A read/decode/convert/encode/mux step failed while streaming.
///
/// Fatal to the current session, which then tears down.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("capture read failed: {0}")]
    Read(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("frame conversion failed: {0}")]
    Convert(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("mux failed: {0}")]
    Mux(String),
}

// ── SignalingError ───────────────────────────────────────────────

/// A register/get-offer/set-answer request could not be served.
#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    /// No receiver is registered for the client.
    #[error("no receiver registered for {0}")]
    NoReceiver(ClientId),

    /// The receiver exists but ICE gathering has not completed yet.
    #[error("offer for {0} is not ready, ICE gathering still in progress")]
    OfferNotReady(ClientId),

    /// The receiver disappeared before its offer became available.
    #[error("receiver for {0} was removed before its offer was ready")]
    ReceiverGone(ClientId),

    /// The session stopped before the receiver could be registered.
    #[error("cannot register {0}, the session is not streaming")]
    NotStreaming(ClientId),

    /// The `{type, sdp}` envelope was missing fields or had the wrong type.
    #[error("malformed session description: {0}")]
    MalformedDescription(String),

    /// The peer-connection library reported a failure.
    #[error("peer connection error: {0}")]
    Peer(String),
}

// ── ProtocolError ────────────────────────────────────────────────

/// A command line could not be understood.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("command must be a JSON object")]
    NotAnObject,

    #[error("`{key}` must be {expected}")]
    InvalidField {
        key: &'static str,
        expected: &'static str,
    },

    #[error("unknown `{key}` target `{value}`")]
    UnknownTarget { key: &'static str, value: String },

    #[error("no recognised command")]
    NoCommand,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e.to_string())
    }
}

// ── StreamError ──────────────────────────────────────────────────

/// Start/stop failures reported to the command layer.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("could not start the streaming server, probably it's already running")]
    AlreadyRunning,

    #[error("could not stop the streaming server, probably it's already stopped")]
    AlreadyStopped,

    #[error("setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),

    /// The worker ended without reporting (panic or runtime shutdown).
    #[error("stream worker failed: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for StreamError {
    fn from(e: tokio::task::JoinError) -> Self {
        StreamError::Worker(e.to_string())
    }
}

impl From<webrtc::Error> for SignalingError {
    fn from(e: webrtc::Error) -> Self {
        SignalingError::Peer(e.to_string())
    }
}
