//! Transport sink: the muxer's write callback target.
//!
//! Every packet the RTP muxer emits lands in [`TransportSink::handle_write`],
//! gets the session SSRC stamped in, and is queued to each connected
//! receiver. The sink never blocks and never mutates the registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

use crate::stream::registry::ReceiverRegistry;

/// Size of the RTP fixed header.
pub const RTP_HEADER_LEN: usize = 12;

const SSRC_OFFSET: usize = 8;

/// RTCP packet types (SR, RR, SDES, BYE, APP) share the second byte with
/// the RTP marker/payload-type field.
fn is_rtcp(packet: &[u8]) -> bool {
    (200..=204).contains(&packet[1])
}

/// Overwrite the SSRC field (bytes 8..12, big-endian).
pub fn stamp_ssrc(packet: &mut [u8], ssrc: u32) -> bool {
    match packet.get_mut(SSRC_OFFSET..SSRC_OFFSET + 4) {
        Some(field) => {
            field.copy_from_slice(&ssrc.to_be_bytes());
            true
        }
        None => false,
    }
}

pub fn read_ssrc(packet: &[u8]) -> Option<u32> {
    let field = packet.get(SSRC_OFFSET..SSRC_OFFSET + 4)?;
    Some(u32::from_be_bytes([field[0], field[1], field[2], field[3]]))
}

/// Fan-out target handed to the pipeline.
pub struct TransportSink {
    registry: Arc<ReceiverRegistry>,
    ssrc: u32,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl TransportSink {
    pub fn new(registry: Arc<ReceiverRegistry>, ssrc: u32) -> Self {
        Self {
            registry,
            ssrc,
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Consume one muxer write. Always reports the whole buffer as consumed.
    pub fn handle_write(&self, buf: &[u8]) -> usize {
        let consumed = buf.len();
        if consumed < RTP_HEADER_LEN {
            trace!(len = consumed, "short write skipped");
            return consumed;
        }
        if is_rtcp(buf) {
            trace!(packet_type = buf[1], "rtcp write skipped");
            return consumed;
        }

        let mut packet = BytesMut::from(buf);
        stamp_ssrc(&mut packet, self.ssrc);
        let packet: Bytes = packet.freeze();

        for (client, queue) in self.registry.connected_queues() {
            match queue.try_send(packet.clone()) {
                Ok(()) => {
                    self.forwarded.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped == 1 || dropped % 500 == 0 {
                        warn!(%client, dropped, "receiver queue full, packet dropped");
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(%client, "receiver queue closed");
                }
            }
        }
        consumed
    }

    /// Packets queued to receivers so far.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
