// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! The seam to the external JS execution worker.
//!
//! The worker process speaks binary framed messages over a socket the host
//! owns; the consumer core only needs somewhere to hand events and a view of
//! the worker's queue depths for backpressure.

use byteorder::{BigEndian, ByteOrder};

use crate::dcp::DcpEvent;

/// A doc-timer firing to be forwarded to the worker.
#[derive(Clone, Debug, Default)]
pub struct TimerEvent {
    pub vb: u16,
    pub seq_no: u64,
    pub doc_id: String,
    pub callback: String,
}

/// Queue depths reported by the worker side, compared against the configured
/// caps before the router takes another event.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerQueueSizes {
    pub agg_queue_size: u64,
    pub timer_queue_size: u64,
    pub agg_queue_mem: u64,
}

/// Downstream sink for events the consumer decides to forward.
pub trait WorkerSink: Send + Sync + 'static {
    fn send_mutation(&self, event: &DcpEvent);
    fn send_deletion(&self, event: &DcpEvent);
    fn send_timer(&self, timer: &TimerEvent);
    /// Echo an effective log-level change into the worker.
    fn send_log_level(&self, level: &str);
    fn queue_sizes(&self) -> WorkerQueueSizes;
}

/// Kinds of framed messages a sink implementation writes to the worker
/// socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Mutation = 1,
    Deletion = 2,
    Timer = 3,
    LogLevel = 4,
}

/// Encode one message: `[1B kind][4B BE meta len][meta][4B BE payload len]
/// [payload]`. Sink implementations share this so both sides agree on the
/// frame layout.
pub fn encode_frame(kind: MessageKind, meta: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 8 + meta.len() + payload.len());
    buf.push(kind as u8);
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, meta.len() as u32);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(meta);
    BigEndian::write_u32(&mut len, payload.len() as u32);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_layout() {
        let frame = encode_frame(MessageKind::Mutation, b"k", b"value");
        assert_eq!(frame[0], 1);
        assert_eq!(BigEndian::read_u32(&frame[1..5]), 1);
        assert_eq!(&frame[5..6], b"k");
        assert_eq!(BigEndian::read_u32(&frame[6..10]), 5);
        assert_eq!(&frame[10..], b"value");
    }

    #[test]
    fn test_encode_frame_empty_sections() {
        let frame = encode_frame(MessageKind::LogLevel, b"", b"");
        assert_eq!(frame.len(), 9);
        assert_eq!(frame[0], 4);
    }
}
