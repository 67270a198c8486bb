//! Owned wrappers over the raw FFmpeg handles shared by capture and encode.
//!
//! Each wrapper frees its handle on drop, checks the result, and reports it
//! through [`released`].

use std::ffi::{CStr, CString, c_int};
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use ffmpeg_next::ffi;
use tracing::{debug, warn};

use crate::error::SetupError;

/// Human-readable text for an FFmpeg error code.
pub(crate) fn av_error(code: c_int) -> String {
    ffmpeg_next::Error::from(code).to_string()
}

/// `EAGAIN` / `EOF` from the send/receive codec API: feed more input.
pub(crate) fn needs_input(code: c_int) -> bool {
    code == ffi::AVERROR(libc::EAGAIN) || code == ffi::AVERROR_EOF
}

pub(crate) fn c_string(value: &str) -> Result<CString, String> {
    CString::new(value).map_err(|_| format!("`{value}` contains a NUL byte"))
}

/// Log the outcome of freeing one native handle.
pub(crate) fn released(handle: &'static str, ok: bool) {
    if ok {
        debug!(handle, "released");
    } else {
        warn!(handle, "release failed");
    }
    #[cfg(test)]
    release_log::record(handle, ok);
}


/// Register devices and codecs once per process.
pub(crate) fn init() -> Result<(), SetupError> {
    static INIT: OnceLock<Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| {
        ffmpeg_next::init().map_err(|e| e.to_string())?;
        ffmpeg_next::util::log::set_level(ffmpeg_next::util::log::Level::Warning);
        Ok(())
    })
    .clone()
    .map_err(SetupError::Init)
}

// ── Options ──────────────────────────────────────────────────────

/// An `AVDictionary` of options passed to an open call.
pub(crate) struct Options(*mut ffi::AVDictionary);

impl Options {
    pub fn new() -> Self {
        Self(ptr::null_mut())
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        let key = c_string(key)?;
        let value = c_string(value)?;
        let ret = unsafe { ffi::av_dict_set(&mut self.0, key.as_ptr(), value.as_ptr(), 0) };
        if ret < 0 {
            return Err(av_error(ret));
        }
        Ok(())
    }

    pub fn as_mut_ptr(&mut self) -> *mut *mut ffi::AVDictionary {
        &mut self.0
    }

    /// Keys the consumer did not recognise (left in the dictionary after open).
    pub fn leftover_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        let mut entry: *const ffi::AVDictionaryEntry = ptr::null();
        loop {
            entry = unsafe {
                ffi::av_dict_get(
                    self.0,
                    c"".as_ptr(),
                    entry,
                    ffi::AV_DICT_IGNORE_SUFFIX as c_int,
                )
            };
            if entry.is_null() {
                break;
            }
            let key = unsafe { CStr::from_ptr((*entry).key) };
            keys.push(key.to_string_lossy().into_owned());
        }
        keys
    }
}

impl Drop for Options {
    fn drop(&mut self) {
        unsafe { ffi::av_dict_free(&mut self.0) };
    }
}

// ── Packet / Frame ───────────────────────────────────────────────

pub(crate) struct Packet {
    raw: NonNull<ffi::AVPacket>,
    label: &'static str,
}

impl Packet {
    pub fn alloc(label: &'static str) -> Result<Self, SetupError> {
        NonNull::new(unsafe { ffi::av_packet_alloc() })
            .map(|raw| Self { raw, label })
            .ok_or(SetupError::Allocation(label))
    }

    pub fn as_ptr(&self) -> *mut ffi::AVPacket {
        self.raw.as_ptr()
    }

    pub fn unref(&mut self) {
        unsafe { ffi::av_packet_unref(self.raw.as_ptr()) };
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        let mut raw = self.raw.as_ptr();
        unsafe { ffi::av_packet_free(&mut raw) };
        released(self.label, raw.is_null());
    }
}

pub(crate) struct Frame {
    raw: NonNull<ffi::AVFrame>,
    label: &'static str,
}

impl Frame {
    pub fn alloc(label: &'static str) -> Result<Self, SetupError> {
        NonNull::new(unsafe { ffi::av_frame_alloc() })
            .map(|raw| Self { raw, label })
            .ok_or(SetupError::Allocation(label))
    }

    /// A frame with its own picture buffer.
    pub fn picture(
        label: &'static str,
        width: c_int,
        height: c_int,
        format: ffi::AVPixelFormat,
    ) -> Result<Self, SetupError> {
        let frame = Self::alloc(label)?;
        unsafe {
            let raw = frame.as_ptr();
            (*raw).width = width;
            (*raw).height = height;
            (*raw).format = format as c_int;
            if ffi::av_frame_get_buffer(raw, 0) < 0 {
                return Err(SetupError::Allocation(label));
            }
        }
        Ok(frame)
    }

    pub fn as_ptr(&self) -> *mut ffi::AVFrame {
        self.raw.as_ptr()
    }

    pub fn unref(&mut self) {
        unsafe { ffi::av_frame_unref(self.raw.as_ptr()) };
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        let mut raw = self.raw.as_ptr();
        unsafe { ffi::av_frame_free(&mut raw) };
        released(self.label, raw.is_null());
    }
}

// ── CodecContext ─────────────────────────────────────────────────

pub(crate) struct CodecContext {
    raw: NonNull<ffi::AVCodecContext>,
    label: &'static str,
}

impl CodecContext {
    pub fn alloc(codec: *const ffi::AVCodec, label: &'static str) -> Option<Self> {
        NonNull::new(unsafe { ffi::avcodec_alloc_context3(codec) }).map(|raw| Self { raw, label })
    }

    pub fn as_ptr(&self) -> *mut ffi::AVCodecContext {
        self.raw.as_ptr()
    }
}

impl Drop for CodecContext {
    fn drop(&mut self) {
        let mut raw = self.raw.as_ptr();
        unsafe { ffi::avcodec_free_context(&mut raw) };
        released(self.label, raw.is_null());
    }
}
