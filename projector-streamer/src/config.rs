//! Configuration for the projector streamer.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use projector_core::stream::{CaptureConfig, EncoderConfig};
use projector_core::{PipelineConfig, RtcConfig, SessionConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Command channel settings.
    pub network: NetworkConfig,
    /// Screen capture settings.
    pub capture: CaptureSettings,
    /// VP9/RTP encoder settings.
    pub encoder: EncoderSettings,
    /// Peer connection settings.
    pub webrtc: WebRtcSettings,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Command channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the JSON command listener binds to.
    pub listen_address: String,
    /// TCP port of the command listener.
    pub listen_port: u16,
}

/// Screen capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// FFmpeg input device: "gdigrab", "x11grab", "avfoundation".
    pub device: String,
    /// Device target, e.g. `title=SimpleTextProjector` for gdigrab.
    pub target: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// FFmpeg probe size string.
    pub probe_size: String,
    pub draw_mouse: bool,
}

/// Encoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// Target bitrate in kilobits per second.
    pub bitrate_kbps: u32,
    /// Frames between keyframes.
    pub gop_size: u32,
    /// libvpx deadline: "realtime", "good", "best".
    pub quality: String,
    /// libvpx cpu-used, 0 (slowest) to 8.
    pub speed: u32,
    /// Maximum RTP packet size in bytes.
    pub max_packet_size: u32,
    /// SSRC stamped on every packet.
    pub ssrc: u32,
}

/// Peer connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcSettings {
    /// STUN server URLs. Empty means host candidates only.
    pub stun_urls: Vec<String>,
    /// Sleep between checks while no viewer is connected, in milliseconds.
    pub idle_backoff_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".into(),
            listen_port: 9980,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        Self {
            device: capture.device,
            target: capture.target,
            fps: capture.framerate,
            width: capture.width,
            height: capture.height,
            probe_size: capture.probe_size,
            draw_mouse: capture.draw_mouse,
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        let encoder = EncoderConfig::default();
        Self {
            bitrate_kbps: (encoder.bitrate / 1000) as u32,
            gop_size: encoder.gop_size,
            quality: encoder.quality,
            speed: encoder.speed,
            max_packet_size: encoder.max_packet_size,
            ssrc: projector_core::stream::DEFAULT_SSRC,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl StreamerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// The command listener address.
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.network.listen_address, self.network.listen_port).parse()
    }

    /// Capture and encoder settings for the FFmpeg pipeline.
    ///
    /// The encoder always runs at the capture geometry and frame rate.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        let capture = CaptureConfig {
            device: self.capture.device.clone(),
            target: self.capture.target.clone(),
            framerate: self.capture.fps.clamp(1, 120),
            width: self.capture.width.max(2),
            height: self.capture.height.max(2),
            probe_size: self.capture.probe_size.clone(),
            draw_mouse: self.capture.draw_mouse,
        };
        let encoder = EncoderConfig {
            width: capture.width,
            height: capture.height,
            framerate: capture.framerate,
            bitrate: i64::from(self.encoder.bitrate_kbps.max(1)) * 1000,
            gop_size: self.encoder.gop_size.max(1),
            quality: self.encoder.quality.clone(),
            speed: self.encoder.speed.min(8),
            max_packet_size: self.encoder.max_packet_size.clamp(256, 1500),
            ..EncoderConfig::default()
        };
        PipelineConfig { capture, encoder }
    }

    pub fn to_rtc_config(&self) -> RtcConfig {
        RtcConfig {
            stun_servers: self.webrtc.stun_urls.clone(),
            ..RtcConfig::default()
        }
    }

    pub fn to_session_config(&self) -> SessionConfig {
        let mut session = SessionConfig {
            ssrc: self.encoder.ssrc,
            ..SessionConfig::default()
        };
        if self.webrtc.idle_backoff_ms > 0 {
            session.idle_backoff = Duration::from_millis(self.webrtc.idle_backoff_ms);
        }
        session
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&StreamerConfig::default()).unwrap();
        assert!(text.contains("listen_port"));
        assert!(text.contains("bitrate_kbps"));
        assert!(text.contains("stun_urls"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&StreamerConfig::default()).unwrap();
        let parsed: StreamerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.listen_port, 9980);
        assert_eq!(parsed.capture.fps, 30);
        assert_eq!(parsed.encoder.ssrc, 42);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: StreamerConfig = toml::from_str(
            r#"
            [encoder]
            bitrate_kbps = 1500

            [webrtc]
            stun_urls = ["stun:stun.l.google.com:19302"]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.encoder.bitrate_kbps, 1500);
        assert_eq!(parsed.encoder.speed, 6);
        assert_eq!(parsed.capture.width, 1920);
        assert_eq!(parsed.to_rtc_config().stun_servers.len(), 1);
    }

    #[test]
    fn pipeline_config_follows_capture_geometry() {
        let mut cfg = StreamerConfig::default();
        cfg.capture.width = 1280;
        cfg.capture.height = 720;
        cfg.capture.fps = 500;
        cfg.encoder.bitrate_kbps = 2500;
        let pipeline = cfg.to_pipeline_config();
        assert_eq!(pipeline.encoder.width, 1280);
        assert_eq!(pipeline.encoder.height, 720);
        assert_eq!(pipeline.capture.framerate, 120);
        assert_eq!(pipeline.encoder.framerate, 120);
        assert_eq!(pipeline.encoder.bitrate, 2_500_000);
    }

    #[test]
    fn session_config_uses_ssrc_and_backoff() {
        let mut cfg = StreamerConfig::default();
        cfg.encoder.ssrc = 7;
        assert_eq!(cfg.to_session_config().idle_backoff, Duration::from_millis(100));
        cfg.webrtc.idle_backoff_ms = 20;
        let session = cfg.to_session_config();
        assert_eq!(session.ssrc, 7);
        assert_eq!(session.idle_backoff, Duration::from_millis(20));
    }

    #[test]
    fn listen_addr_parses() {
        let addr = StreamerConfig::default().listen_addr().unwrap();
        assert_eq!(addr.port(), 9980);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = StreamerConfig::load(Path::new("/nonexistent/projector-streamer.toml"));
        assert_eq!(cfg.network.listen_port, 9980);
    }
}
