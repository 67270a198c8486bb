//! One-frame-at-a-time capture → convert → encode → mux pipeline.
//!
//! | Stage | Type |
//! |-------|------|
//! | capture + decode | `CaptureSource` |
//! | YUV420P conversion | `Scaler` |
//! | VP9 encode + RTP mux | `RtpOutput` |
//! | fan-out | [`TransportSink`] |
//!
//! The streaming worker only sees the [`MediaPipeline`] trait, so the loop
//! logic is testable without a display or codec.

use std::ffi::c_int;

use ffmpeg_next::ffi;
use tracing::{debug, info};

use crate::error::{PipelineError, SetupError};
use crate::stream::capture::{CaptureConfig, CaptureSource, Scaler};
use crate::stream::encoder::{EncoderConfig, RtpOutput};
use crate::stream::ffmpeg::{self, Frame, Packet};
use crate::stream::sink::TransportSink;
use crate::stream::types::KeyframeRequest;

/// Outcome of one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    /// At least one packet reached the sink.
    Delivered,
    /// The codecs need more input before producing output.
    NeedMoreInput,
}

/// A running pipeline. Lives on the streaming worker thread only.
pub trait MediaPipeline {
    /// Run one read/decode/convert/encode/mux step.
    fn pump(&mut self) -> Result<Pump, PipelineError>;
}

/// Builds a pipeline for each session.
pub trait PipelineFactory: Send + Sync {
    /// Called on the worker thread. All handles acquired before a failure are
    /// released before returning the error.
    fn open(
        &self,
        sink: TransportSink,
        keyframes: KeyframeRequest,
    ) -> Result<Box<dyn MediaPipeline>, SetupError>;
}

/// Parameters of the FFmpeg pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
}

// ── FFmpeg pipeline ──────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct FfmpegPipelineFactory {
    config: PipelineConfig,
}

impl FfmpegPipelineFactory {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }
}

impl PipelineFactory for FfmpegPipelineFactory {
    fn open(
        &self,
        sink: TransportSink,
        keyframes: KeyframeRequest,
    ) -> Result<Box<dyn MediaPipeline>, SetupError> {
        ffmpeg::init()?;
        Ok(Box::new(FfmpegPipeline::open(&self.config, sink, keyframes)?))
    }
}

struct FfmpegPipeline {
    // Field order is release order.
    scaler: Scaler,
    packet: Packet,
    decoded: Frame,
    converted: Frame,
    capture: CaptureSource,
    output: RtpOutput,
    keyframes: KeyframeRequest,
    next_pts: i64,
}

impl FfmpegPipeline {
    fn open(
        config: &PipelineConfig,
        sink: TransportSink,
        keyframes: KeyframeRequest,
    ) -> Result<Self, SetupError> {
        let capture = CaptureSource::open(&config.capture)?;
        let output = RtpOutput::open(&config.encoder, sink)?;

        let width = config.encoder.width as c_int;
        let height = config.encoder.height as c_int;
        let scaler = Scaler::new(capture.geometry(), width, height)?;
        let packet = Packet::alloc("capture packet")?;
        let decoded = Frame::alloc("decoded frame")?;
        let converted = Frame::picture("converted frame", width, height, Scaler::OUTPUT_FORMAT)?;

        info!("pipeline ready");
        Ok(Self {
            scaler,
            packet,
            decoded,
            converted,
            capture,
            output,
            keyframes,
            next_pts: 0,
        })
    }
}

impl MediaPipeline for FfmpegPipeline {
    fn pump(&mut self) -> Result<Pump, PipelineError> {
        if !self.capture.feed(&mut self.packet)? {
            return Ok(Pump::NeedMoreInput);
        }

        let mut muxed = 0;
        while self.capture.receive(&mut self.decoded)? {
            let (.., format) = self.capture.geometry();
            let converted = self.scaler.convert(&self.decoded, format, &mut self.converted);
            self.decoded.unref();
            converted?;

            unsafe {
                let frame = self.converted.as_ptr();
                (*frame).pts = self.next_pts;
                (*frame).pict_type = if self.keyframes.take() {
                    debug!(pts = self.next_pts, "forcing keyframe");
                    ffi::AVPictureType::AV_PICTURE_TYPE_I
                } else {
                    ffi::AVPictureType::AV_PICTURE_TYPE_NONE
                };
            }
            self.next_pts += 1;
            muxed += self.output.encode(&self.converted)?;
        }

        Ok(if muxed > 0 {
            Pump::Delivered
        } else {
            Pump::NeedMoreInput
        })
    }
}

impl Drop for FfmpegPipeline {
    fn drop(&mut self) {
        let sink = self.output.sink();
        info!(
            frames = self.next_pts,
            ssrc = sink.ssrc(),
            forwarded = sink.forwarded(),
            dropped = sink.dropped(),
            "pipeline teardown"
        );
    }
}
