//! # projector-streamer: screen relay host
//!
//! Runs the screen-capture-to-WebRTC relay behind a newline-delimited JSON
//! command channel over TCP. Viewers ask for an offer with
//! `{"get": "stream"}`, answer with `{"set": "answer", ...}`, and the
//! projector window is streamed to them as VP9 over RTP.
//!
//! Configuration comes from a TOML file (see [`config::StreamerConfig`]).

pub mod config;
pub mod service;
