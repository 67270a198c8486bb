//! Command channel service.
//!
//! Accepts TCP connections and speaks newline-delimited JSON: every line is
//! one command message, every reply is written back as one line. Each
//! connection is one signaling client with its own [`ClientId`].

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use projector_core::{ClientId, CommandHandler, Reply};

/// Longest accepted command line; SDP answers run to a few kilobytes.
pub const MAX_LINE_LENGTH: usize = 256 * 1024;

// ── CommandService ───────────────────────────────────────────────

/// The JSON command listener.
pub struct CommandService {
    handler: CommandHandler,
    shutdown: CancellationToken,
}

impl CommandService {
    pub fn new(handler: CommandHandler, shutdown: CancellationToken) -> Self {
        Self { handler, shutdown }
    }

    /// Bind `addr` and serve until the shutdown token is cancelled.
    pub async fn run(&self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("command channel listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = self.shutdown.cancelled() => break,
            };

            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            let client = ClientId::next();
            info!(%client, %peer, "command client connected");
            let handler = self.handler.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                serve_client(stream, client, handler.clone(), shutdown).await;
                // The viewer goes away with its command connection.
                if let Some(session) = handler.controller().running_session().await {
                    session.registry().remove(client);
                }
                info!(%client, %peer, "command client disconnected");
            });
        }

        info!("command channel stopped");
        Ok(())
    }
}

async fn serve_client(
    stream: TcpStream,
    client: ClientId,
    handler: CommandHandler,
    shutdown: CancellationToken,
) {
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let next = tokio::select! {
            next = lines.next() => next,
            _ = shutdown.cancelled() => break,
        };

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                // The codec discards the rest of the line and keeps going.
                warn!(%client, "command line too long");
                let reply = Reply::error(LinesCodecError::MaxLineLengthExceeded);
                if lines.send(reply.to_json()).await.is_err() {
                    break;
                }
                continue;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                debug!(%client, error = %e, "command stream failed");
                break;
            }
            None => break,
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(%client, len = line.len(), "command received");

        for reply in handler.handle_line(client, line).await {
            if let Err(e) = lines.send(reply.to_json()).await {
                debug!(%client, error = %e, "reply not delivered");
                return;
            }
        }
    }
}
