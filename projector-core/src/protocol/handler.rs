//! Executes parsed commands against a [`StreamController`].

use std::sync::Arc;

use tracing::{debug, warn};

use crate::controller::StreamController;
use crate::protocol::stream::{Reply, StreamCommand, parse_commands};
use crate::stream::ClientId;

/// Per-process command executor, shared by every client connection.
#[derive(Clone)]
pub struct CommandHandler {
    controller: Arc<StreamController>,
}

impl CommandHandler {
    pub fn new(controller: Arc<StreamController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<StreamController> {
        &self.controller
    }

    /// Handle one message line; returns the replies in command order.
    pub async fn handle_line(&self, client: ClientId, line: &str) -> Vec<Reply> {
        let commands = match parse_commands(line) {
            Ok(commands) => commands,
            Err(e) => {
                debug!(%client, error = %e, "unparseable command");
                return vec![Reply::error(e)];
            }
        };

        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            if let Some(reply) = self.execute(client, command).await {
                replies.push(reply);
            }
        }
        replies
    }

    /// Run a single command. `None` means the command produces no reply.
    pub async fn execute(&self, client: ClientId, command: StreamCommand) -> Option<Reply> {
        let reply = match command {
            StreamCommand::SetStreaming(true) => match self.controller.start().await {
                Ok(()) => Reply::success(),
                Err(e) => {
                    warn!(%client, error = %e, "start rejected");
                    Reply::error(e)
                }
            },
            StreamCommand::SetStreaming(false) => match self.controller.stop().await {
                Ok(()) => Reply::success(),
                Err(e) => {
                    warn!(%client, error = %e, "stop rejected");
                    Reply::error(e)
                }
            },
            StreamCommand::Ping => Reply::pong(),
            StreamCommand::GetStream => self.stream_status(client).await,
            StreamCommand::SetAnswer(answer) => {
                match self.controller.set_answer(client, &answer).await {
                    Ok(true) => Reply::success(),
                    Ok(false) => return None,
                    Err(e) => {
                        warn!(%client, error = %e, "answer rejected");
                        Reply::error(e)
                    }
                }
            }
        };
        Some(reply)
    }

    async fn stream_status(&self, client: ClientId) -> Reply {
        match self.controller.request_offer(client).await {
            Ok(None) => Reply::not_streaming(),
            Ok(Some(offer)) => match serde_json::from_str(&offer) {
                Ok(offer) => Reply::Status {
                    is_streaming: true,
                    offer: Some(offer),
                },
                Err(e) => Reply::error(format!("cached offer is not JSON: {e}")),
            },
            Err(e) => {
                warn!(%client, error = %e, "offer unavailable");
                Reply::error(e)
            }
        }
    }
}
