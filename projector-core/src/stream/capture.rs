//! Window capture and pixel-format conversion.
//!
//! The capture device is an FFmpeg input format (`gdigrab`, `x11grab`,
//! `avfoundation`) opened with a fixed profile. Decoded frames are converted
//! to YUV420P at the encoder resolution by [`Scaler`].

use std::ffi::c_int;
use std::ptr::{self, NonNull};

use ffmpeg_next::ffi;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, SetupError};
use crate::stream::ffmpeg::{
    CodecContext, Frame, Options, Packet, av_error, c_string, needs_input, released,
};

/// Default window title targeted on Windows.
pub const DEFAULT_WINDOW_TITLE: &str = "SimpleTextProjector";

/// Capture device parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// FFmpeg input format name.
    pub device: String,
    /// Device-specific target: window title, X display, or device index.
    pub target: String,
    pub framerate: u32,
    pub width: u32,
    pub height: u32,
    /// Probe buffer size, as an FFmpeg size string (`100M`).
    pub probe_size: String,
    pub draw_mouse: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let (device, target) = platform_default();
        Self {
            device: device.into(),
            target,
            framerate: 30,
            width: 1920,
            height: 1080,
            probe_size: "100M".into(),
            draw_mouse: false,
        }
    }
}

#[cfg(target_os = "windows")]
fn platform_default() -> (&'static str, String) {
    ("gdigrab", format!("title={DEFAULT_WINDOW_TITLE}"))
}

#[cfg(target_os = "macos")]
fn platform_default() -> (&'static str, String) {
    ("avfoundation", "1:none".into())
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn platform_default() -> (&'static str, String) {
    ("x11grab", ":0.0".into())
}

impl CaptureConfig {
    /// Device options in the order they are applied.
    pub fn options(&self) -> Vec<(&'static str, String)> {
        let cursor_key = if self.device == "avfoundation" {
            "capture_cursor"
        } else {
            "draw_mouse"
        };
        let mut options = vec![("framerate", self.framerate.to_string())];
        if self.device == "gdigrab" {
            options.push(("offset_x", "0".into()));
            options.push(("offset_y", "0".into()));
        }
        options.push(("video_size", format!("{}x{}", self.width, self.height)));
        options.push(("probesize", self.probe_size.clone()));
        options.push((cursor_key, if self.draw_mouse { "1" } else { "0" }.into()));
        options
    }
}

// ── CaptureSource ────────────────────────────────────────────────

struct InputContext(NonNull<ffi::AVFormatContext>);

impl InputContext {
    fn as_ptr(&self) -> *mut ffi::AVFormatContext {
        self.0.as_ptr()
    }
}

impl Drop for InputContext {
    fn drop(&mut self) {
        let mut raw = self.0.as_ptr();
        unsafe { ffi::avformat_close_input(&mut raw) };
        released("capture_input", raw.is_null());
    }
}

/// An open capture device and its decoder.
pub(crate) struct CaptureSource {
    // Field order is release order.
    input: InputContext,
    decoder: CodecContext,
    stream_index: c_int,
}

impl CaptureSource {
    pub fn open(config: &CaptureConfig) -> Result<Self, SetupError> {
        let device = c_string(&config.device)
            .map_err(|_| SetupError::InputFormatNotFound(config.device.clone()))?;
        let format = unsafe { ffi::av_find_input_format(device.as_ptr()) };
        if format.is_null() {
            return Err(SetupError::InputFormatNotFound(config.device.clone()));
        }

        let mut options = Options::new();
        for (key, value) in config.options() {
            if let Err(reason) = options.set(key, &value) {
                return Err(SetupError::CaptureOption { key, value, reason });
            }
        }

        let target = c_string(&config.target).map_err(|reason| SetupError::CaptureOpen {
            target: config.target.clone(),
            reason,
        })?;
        let mut raw: *mut ffi::AVFormatContext = ptr::null_mut();
        let ret = unsafe {
            ffi::avformat_open_input(&mut raw, target.as_ptr(), format, options.as_mut_ptr())
        };
        if ret < 0 {
            return Err(SetupError::CaptureOpen {
                target: config.target.clone(),
                reason: av_error(ret),
            });
        }
        let input = NonNull::new(raw)
            .map(InputContext)
            .ok_or_else(|| SetupError::CaptureOpen {
                target: config.target.clone(),
                reason: "no context returned".into(),
            })?;
        for key in options.leftover_keys() {
            warn!(device = %config.device, key, "capture option not recognised");
        }

        let ret = unsafe { ffi::avformat_find_stream_info(input.as_ptr(), ptr::null_mut()) };
        if ret < 0 {
            return Err(SetupError::StreamProbe(av_error(ret)));
        }

        let stream_index = unsafe {
            ffi::av_find_best_stream(
                input.as_ptr(),
                ffi::AVMediaType::AVMEDIA_TYPE_VIDEO,
                -1,
                -1,
                ptr::null_mut(),
                0,
            )
        };
        if stream_index < 0 {
            return Err(SetupError::NoVideoStream);
        }

        let params = unsafe { (**(*input.as_ptr()).streams.add(stream_index as usize)).codecpar };
        let codec = unsafe { ffi::avcodec_find_decoder((*params).codec_id) };
        if codec.is_null() {
            return Err(SetupError::DecoderNotFound);
        }
        let decoder = CodecContext::alloc(codec, "decoder")
            .ok_or_else(|| SetupError::DecoderOpen("context allocation failed".into()))?;

        let ret = unsafe { ffi::avcodec_parameters_to_context(decoder.as_ptr(), params) };
        if ret < 0 {
            return Err(SetupError::DecoderOpen(av_error(ret)));
        }
        let ret = unsafe { ffi::avcodec_open2(decoder.as_ptr(), codec, ptr::null_mut()) };
        if ret < 0 {
            return Err(SetupError::DecoderOpen(av_error(ret)));
        }

        let source = Self {
            input,
            decoder,
            stream_index,
        };
        let (width, height, format) = source.geometry();
        info!(
            device = %config.device,
            target = %config.target,
            width,
            height,
            ?format,
            "capture opened"
        );
        Ok(source)
    }

    /// Decoder output size and pixel format.
    pub fn geometry(&self) -> (c_int, c_int, ffi::AVPixelFormat) {
        let ctx = self.decoder.as_ptr();
        unsafe { ((*ctx).width, (*ctx).height, (*ctx).pix_fmt) }
    }

    /// Read one packet and feed it to the decoder.
    ///
    /// Returns `false` when the device had nothing ready or the packet was
    /// not for the video stream.
    pub fn feed(&mut self, packet: &mut Packet) -> Result<bool, PipelineError> {
        let ret = unsafe { ffi::av_read_frame(self.input.as_ptr(), packet.as_ptr()) };
        if ret == ffi::AVERROR(libc::EAGAIN) {
            return Ok(false);
        }
        if ret < 0 {
            return Err(PipelineError::Read(av_error(ret)));
        }
        if unsafe { (*packet.as_ptr()).stream_index } != self.stream_index {
            packet.unref();
            return Ok(false);
        }

        let ret = unsafe { ffi::avcodec_send_packet(self.decoder.as_ptr(), packet.as_ptr()) };
        packet.unref();
        if ret < 0 && !needs_input(ret) {
            return Err(PipelineError::Decode(av_error(ret)));
        }
        Ok(true)
    }

    /// Take the next decoded frame. Returns `false` on "need more input".
    pub fn receive(&mut self, frame: &mut Frame) -> Result<bool, PipelineError> {
        let ret = unsafe { ffi::avcodec_receive_frame(self.decoder.as_ptr(), frame.as_ptr()) };
        if needs_input(ret) {
            return Ok(false);
        }
        if ret < 0 {
            return Err(PipelineError::Decode(av_error(ret)));
        }
        Ok(true)
    }
}

// ── Scaler ───────────────────────────────────────────────────────

/// Converts decoded frames to YUV420P at the target size.
pub(crate) struct Scaler {
    // Null after a failed rebuild; `sws_freeContext` accepts null.
    ctx: *mut ffi::SwsContext,
    source: (c_int, c_int, ffi::AVPixelFormat),
    width: c_int,
    height: c_int,
}

impl Scaler {
    pub const OUTPUT_FORMAT: ffi::AVPixelFormat = ffi::AVPixelFormat::AV_PIX_FMT_YUV420P;

    pub fn new(
        source: (c_int, c_int, ffi::AVPixelFormat),
        width: c_int,
        height: c_int,
    ) -> Result<Self, SetupError> {
        let (src_w, src_h, src_fmt) = source;
        let ctx = unsafe {
            ffi::sws_getContext(
                src_w,
                src_h,
                src_fmt,
                width,
                height,
                Self::OUTPUT_FORMAT,
                ffi::SWS_BICUBIC as c_int,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null(),
            )
        };
        if ctx.is_null() {
            return Err(SetupError::Scaler {
                width: src_w,
                height: src_h,
            });
        }
        Ok(Self {
            ctx,
            source,
            width,
            height,
        })
    }

    /// Convert `src` into `dst`. Rebuilds the context if the source geometry
    /// changed (e.g. the captured window was resized).
    pub fn convert(
        &mut self,
        src: &Frame,
        src_format: ffi::AVPixelFormat,
        dst: &mut Frame,
    ) -> Result<(), PipelineError> {
        let s = src.as_ptr();
        let d = dst.as_ptr();
        let geometry = unsafe { ((*s).width, (*s).height, src_format) };
        if geometry != self.source || self.ctx.is_null() {
            self.rebuild(geometry)?;
        }

        let ret = unsafe { ffi::av_frame_make_writable(d) };
        if ret < 0 {
            return Err(PipelineError::Convert(av_error(ret)));
        }
        let rows = unsafe {
            ffi::sws_scale(
                self.ctx,
                (*s).data.as_ptr() as *const *const u8,
                (*s).linesize.as_ptr(),
                0,
                geometry.1,
                (*d).data.as_ptr(),
                (*d).linesize.as_ptr(),
            )
        };
        if rows <= 0 {
            return Err(PipelineError::Convert(format!("sws_scale returned {rows}")));
        }
        Ok(())
    }

    fn rebuild(&mut self, geometry: (c_int, c_int, ffi::AVPixelFormat)) -> Result<(), PipelineError> {
        let (src_w, src_h, src_fmt) = geometry;
        let ctx = unsafe {
            ffi::sws_getCachedContext(
                self.ctx,
                src_w,
                src_h,
                src_fmt,
                self.width,
                self.height,
                Self::OUTPUT_FORMAT,
                ffi::SWS_BICUBIC as c_int,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null(),
            )
        };
        // The old context is freed by this call either way.
        self.ctx = ctx;
        if ctx.is_null() {
            return Err(PipelineError::Convert(format!(
                "no conversion from {src_w}x{src_h} {src_fmt:?}"
            )));
        }
        self.source = geometry;
        debug!(width = src_w, height = src_h, "scaler rebuilt");
        Ok(())
    }
}

impl Drop for Scaler {
    fn drop(&mut self) {
        // A failed rebuild already lost the context.
        let live = !self.ctx.is_null();
        unsafe { ffi::sws_freeContext(self.ctx) };
        self.ctx = ptr::null_mut();
        released("scaler", live);
    }
}
