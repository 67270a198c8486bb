//! JSON command protocol for the stream relay.
//!
//! A command is one JSON object. Each recognised key contributes a
//! command, so `{"stream": true, "get": "stream"}` starts streaming and then
//! asks for an offer.
//!
//! | Message | Reply |
//! |---------|-------|
//! | `{"stream": true}` / `{"stream": false}` | `{"success": true}` or error |
//! | `{"get": "stream"}` | `{"isStreaming": bool, "offer"?: {type, sdp}}` |
//! | `{"get": "ping"}` | `{"pong": true}` |
//! | `{"set": "answer", "answer": {type, sdp}}` | `{"success": true}`, error, or nothing when not streaming |
//!
//! Errors are `{"error": true, "message": "..."}`.

pub mod handler;
pub mod stream;

pub use handler::CommandHandler;
pub use stream::{Reply, StreamCommand, parse_commands};
