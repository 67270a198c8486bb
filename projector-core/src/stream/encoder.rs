//! VP9 encoder and RTP muxer writing through a custom I/O sink.
//!
//! The muxer never touches a socket: its `AVIOContext` calls
//! [`write_packet`], which hands every packetized unit to the
//! [`TransportSink`].

use std::ffi::{c_int, c_void};
use std::ptr::{self, NonNull};

use ffmpeg_next::ffi;
use tracing::{info, warn};

use crate::error::{PipelineError, SetupError};
use crate::stream::ffmpeg::{
    CodecContext, Frame, Options, Packet, av_error, c_string, needs_input, released,
};
use crate::stream::sink::TransportSink;
use crate::stream::types::VP9_PAYLOAD_TYPE;

/// Size of the buffer the muxer writes into before calling back.
pub const IO_BUFFER_SIZE: usize = 4096;

const ENCODER_NAME: &str = "libvpx-vp9";

/// Encoder and packetizer parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Target bitrate in bits per second.
    pub bitrate: i64,
    /// Frames between forced keyframes.
    pub gop_size: u32,
    /// libvpx `quality` (deadline) option.
    pub quality: String,
    /// libvpx `speed` (cpu-used) option.
    pub speed: u32,
    /// Largest RTP packet handed to the sink.
    pub max_packet_size: u32,
    pub payload_type: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            framerate: 30,
            bitrate: 3_000_000,
            gop_size: 30,
            quality: "realtime".into(),
            speed: 6,
            max_packet_size: 1200,
            payload_type: VP9_PAYLOAD_TYPE,
        }
    }
}

impl EncoderConfig {
    pub fn codec_options(&self) -> Vec<(&'static str, String)> {
        vec![
            ("quality", self.quality.clone()),
            ("speed", self.speed.to_string()),
        ]
    }

    pub fn muxer_options(&self) -> Vec<(&'static str, String)> {
        vec![
            ("payload_type", self.payload_type.to_string()),
            ("rtpflags", "skip_rtcp".into()),
        ]
    }
}

// ── Custom I/O ───────────────────────────────────────────────────

/// Muxer write callback. `opaque` is the boxed [`TransportSink`].
unsafe extern "C" fn write_packet(opaque: *mut c_void, buf: *const u8, buf_size: c_int) -> c_int {
    if opaque.is_null() || buf.is_null() || buf_size <= 0 {
        return 0;
    }
    let sink = unsafe { &*(opaque as *const TransportSink) };
    let packet = unsafe { std::slice::from_raw_parts(buf, buf_size as usize) };
    sink.handle_write(packet) as c_int
}

struct CustomIo {
    ctx: NonNull<ffi::AVIOContext>,
    sink: *mut TransportSink,
}

impl CustomIo {
    fn new(sink: TransportSink, max_packet_size: u32) -> Result<Self, SetupError> {
        let buffer = unsafe { ffi::av_malloc(IO_BUFFER_SIZE) } as *mut u8;
        if buffer.is_null() {
            return Err(SetupError::IoAlloc);
        }
        let sink = Box::into_raw(Box::new(sink));
        let ctx = unsafe {
            ffi::avio_alloc_context(
                buffer,
                IO_BUFFER_SIZE as c_int,
                1,
                sink.cast(),
                None,
                Some(write_packet),
                None,
            )
        };
        let Some(ctx) = NonNull::new(ctx) else {
            unsafe {
                ffi::av_free(buffer.cast());
                drop(Box::from_raw(sink));
            }
            return Err(SetupError::IoAlloc);
        };
        unsafe { (*ctx.as_ptr()).max_packet_size = max_packet_size as c_int };
        Ok(Self { ctx, sink })
    }

    fn as_ptr(&self) -> *mut ffi::AVIOContext {
        self.ctx.as_ptr()
    }
}

impl Drop for CustomIo {
    fn drop(&mut self) {
        let mut raw = self.ctx.as_ptr();
        unsafe {
            // The buffer may have been reallocated by FFmpeg; free the current one.
            ffi::av_freep(ptr::addr_of_mut!((*raw).buffer).cast());
            ffi::avio_context_free(&mut raw);
            drop(Box::from_raw(self.sink));
        }
        released("custom_io", raw.is_null());
    }
}

// ── Muxer ────────────────────────────────────────────────────────

struct Muxer {
    ctx: NonNull<ffi::AVFormatContext>,
    header_written: bool,
}

impl Muxer {
    fn rtp() -> Result<Self, SetupError> {
        let mut raw: *mut ffi::AVFormatContext = ptr::null_mut();
        let ret = unsafe {
            ffi::avformat_alloc_output_context2(&mut raw, ptr::null(), c"rtp".as_ptr(), ptr::null())
        };
        if ret < 0 {
            return Err(SetupError::MuxerAlloc(av_error(ret)));
        }
        NonNull::new(raw)
            .map(|ctx| Self {
                ctx,
                header_written: false,
            })
            .ok_or_else(|| SetupError::MuxerAlloc("no context returned".into()))
    }

    fn as_ptr(&self) -> *mut ffi::AVFormatContext {
        self.ctx.as_ptr()
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        let raw = self.ctx.as_ptr();
        let mut trailer_ok = true;
        unsafe {
            if self.header_written {
                let ret = ffi::av_write_trailer(raw);
                if ret < 0 {
                    trailer_ok = false;
                    warn!(error = %av_error(ret), "muxer trailer write failed");
                }
            }
            // Custom I/O is released separately.
            (*raw).pb = ptr::null_mut();
            ffi::avformat_free_context(raw);
        }
        released("muxer", trailer_ok);
    }
}

// ── RtpOutput ────────────────────────────────────────────────────

/// Encoder plus RTP muxer for one session.
pub(crate) struct RtpOutput {
    // Field order is release order: the trailer needs the custom I/O alive.
    muxer: Muxer,
    io: CustomIo,
    encoder: CodecContext,
    encoded: Packet,
    stream_time_base: ffi::AVRational,
}

impl RtpOutput {
    pub fn open(config: &EncoderConfig, sink: TransportSink) -> Result<Self, SetupError> {
        // Locals drop in reverse: on an early return the muxer goes before
        // the I/O its trailer writes through.
        let io = CustomIo::new(sink, config.max_packet_size)?;
        let mut muxer = Muxer::rtp()?;
        unsafe {
            let ctx = muxer.as_ptr();
            (*ctx).pb = io.as_ptr();
            (*ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;
            (*ctx).strict_std_compliance = ffi::FF_COMPLIANCE_EXPERIMENTAL as c_int;
        }

        let name = c_string(ENCODER_NAME).map_err(|_| SetupError::EncoderNotFound(ENCODER_NAME))?;
        let mut codec = unsafe { ffi::avcodec_find_encoder_by_name(name.as_ptr()) };
        if codec.is_null() {
            codec = unsafe { ffi::avcodec_find_encoder(ffi::AVCodecID::AV_CODEC_ID_VP9) };
        }
        if codec.is_null() {
            return Err(SetupError::EncoderNotFound(ENCODER_NAME));
        }

        let stream = unsafe { ffi::avformat_new_stream(muxer.as_ptr(), ptr::null()) };
        if stream.is_null() {
            return Err(SetupError::StreamAlloc);
        }

        let encoder = CodecContext::alloc(codec, "encoder")
            .ok_or_else(|| SetupError::EncoderOpen("context allocation failed".into()))?;
        let frame_rate = ffi::AVRational {
            num: config.framerate as c_int,
            den: 1,
        };
        unsafe {
            let enc = encoder.as_ptr();
            (*enc).codec_id = ffi::AVCodecID::AV_CODEC_ID_VP9;
            (*enc).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
            (*enc).width = config.width as c_int;
            (*enc).height = config.height as c_int;
            (*enc).pix_fmt = ffi::AVPixelFormat::AV_PIX_FMT_YUV420P;
            (*enc).bit_rate = config.bitrate;
            (*enc).gop_size = config.gop_size as c_int;
            (*enc).framerate = frame_rate;
            (*enc).time_base = ffi::AVRational {
                num: 1,
                den: frame_rate.num,
            };
            (*enc).strict_std_compliance = ffi::FF_COMPLIANCE_EXPERIMENTAL as c_int;
            if (*(*muxer.as_ptr()).oformat).flags & ffi::AVFMT_GLOBALHEADER as c_int != 0 {
                (*enc).flags |= ffi::AV_CODEC_FLAG_GLOBAL_HEADER as c_int;
            }
        }

        let mut codec_options = Options::new();
        for (key, value) in config.codec_options() {
            codec_options.set(key, &value).map_err(SetupError::EncoderOpen)?;
        }
        let ret = unsafe { ffi::avcodec_open2(encoder.as_ptr(), codec, codec_options.as_mut_ptr()) };
        if ret < 0 {
            return Err(SetupError::EncoderOpen(av_error(ret)));
        }
        for key in codec_options.leftover_keys() {
            warn!(key, "encoder option not recognised");
        }

        // After open, so extradata is copied rather than shared.
        let ret = unsafe { ffi::avcodec_parameters_from_context((*stream).codecpar, encoder.as_ptr()) };
        if ret < 0 {
            return Err(SetupError::EncoderParameters(av_error(ret)));
        }
        unsafe { (*stream).time_base = (*encoder.as_ptr()).time_base };

        let encoded = Packet::alloc("encoded packet")?;
        let mut muxer_options = Options::new();
        for (key, value) in config.muxer_options() {
            muxer_options.set(key, &value).map_err(SetupError::MuxerHeader)?;
        }
        let ret = unsafe { ffi::avformat_write_header(muxer.as_ptr(), muxer_options.as_mut_ptr()) };
        if ret < 0 {
            return Err(SetupError::MuxerHeader(av_error(ret)));
        }
        muxer.header_written = true;

        let stream_time_base = unsafe { (*stream).time_base };
        info!(
            codec = ENCODER_NAME,
            width = config.width,
            height = config.height,
            bitrate = config.bitrate,
            max_packet_size = config.max_packet_size,
            "rtp output ready"
        );

        Ok(Self {
            muxer,
            io,
            encoder,
            encoded,
            stream_time_base,
        })
    }

    /// Encode one frame and mux every packet the encoder releases.
    ///
    /// Returns the number of packets muxed; zero means the encoder is still
    /// buffering.
    pub fn encode(&mut self, frame: &Frame) -> Result<usize, PipelineError> {
        let enc = self.encoder.as_ptr();
        let ret = unsafe { ffi::avcodec_send_frame(enc, frame.as_ptr()) };
        if ret < 0 && !needs_input(ret) {
            return Err(PipelineError::Encode(av_error(ret)));
        }

        let mut muxed = 0;
        loop {
            let ret = unsafe { ffi::avcodec_receive_packet(enc, self.encoded.as_ptr()) };
            if needs_input(ret) {
                break;
            }
            if ret < 0 {
                return Err(PipelineError::Encode(av_error(ret)));
            }
            let ret = unsafe {
                let pkt = self.encoded.as_ptr();
                ffi::av_packet_rescale_ts(pkt, (*enc).time_base, self.stream_time_base);
                (*pkt).stream_index = 0;
                ffi::av_write_frame(self.muxer.as_ptr(), pkt)
            };
            self.encoded.unref();
            if ret < 0 {
                return Err(PipelineError::Mux(av_error(ret)));
            }
            muxed += 1;
        }
        Ok(muxed)
    }

    /// Access to the sink behind the custom I/O.
    pub fn sink(&self) -> &TransportSink {
        unsafe { &*self.io.sink }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codec_parameters() {
        let config = EncoderConfig::default();
        assert_eq!((config.width, config.height, config.framerate), (1920, 1080, 30));
        assert_eq!(config.max_packet_size, 1200);
        assert!(config.codec_options().contains(&("quality", "realtime".to_string())));
        assert!(config.codec_options().contains(&("speed", "6".to_string())));
    }

    #[test]
    fn muxer_matches_sdp_payload_type() {
        let options = EncoderConfig::default().muxer_options();
        assert!(options.contains(&("payload_type", "96".to_string())));
        assert!(options.contains(&("rtpflags", "skip_rtcp".to_string())));
    }

    #[test]
    fn write_callback_consumes_whole_buffer() {
        use crate::stream::registry::ReceiverRegistry;
        use crate::stream::types::{DEFAULT_SSRC, KeyframeRequest};

        let sink = TransportSink::new(ReceiverRegistry::new(KeyframeRequest::new()), DEFAULT_SSRC);
        let packet = crate::stream::testing::rtp_packet(1, 5, &[0; 100]);
        let consumed = unsafe {
            write_packet(
                &sink as *const TransportSink as *mut c_void,
                packet.as_ptr(),
                packet.len() as c_int,
            )
        };
        assert_eq!(consumed as usize, packet.len());
    }
}
