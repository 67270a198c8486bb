//! Projector streamer entry point.
//!
//! ```text
//! projector-streamer                   Run in the foreground
//! projector-streamer --config <path>   Load a custom config TOML
//! projector-streamer --listen <addr>   Override the command listen address
//! projector-streamer --gen-config      Write default config to stdout
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use projector_core::{CommandHandler, FfmpegPipelineFactory, StreamController, WebRtcConnector};
use projector_streamer::config::StreamerConfig;
use projector_streamer::service::CommandService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "projector-streamer", about = "Projector screen relay over WebRTC")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "projector-streamer.toml")]
    config: PathBuf,

    /// Command channel address, overriding the config file.
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&StreamerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let config = StreamerConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let listen = match cli.listen {
        Some(addr) => addr,
        None => config.listen_addr()?,
    };
    let pipeline = config.to_pipeline_config();

    info!("projector-streamer v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "capture: {} {} @ {}x{} {} fps",
        pipeline.capture.device,
        pipeline.capture.target,
        pipeline.capture.width,
        pipeline.capture.height,
        pipeline.capture.framerate
    );
    info!("encoder: VP9 {} kbps", pipeline.encoder.bitrate / 1000);
    info!("STUN servers: {}", config.webrtc.stun_urls.len());

    let shutdown = CancellationToken::new();
    let connector = WebRtcConnector::new(config.to_rtc_config())?;
    let controller = Arc::new(StreamController::with_shutdown(
        Arc::new(FfmpegPipelineFactory::new(pipeline)),
        Arc::new(connector),
        config.to_session_config(),
        shutdown.clone(),
    ));
    let service = CommandService::new(CommandHandler::new(Arc::clone(&controller)), shutdown.clone());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl-C received, shutting down");
            shutdown.cancel();
        });
    }

    service.run(listen).await?;
    controller.shutdown().await;
    info!("projector-streamer stopped");

    Ok(())
}
