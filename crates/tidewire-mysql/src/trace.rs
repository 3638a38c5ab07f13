//! Bounded wire trace.
//!
//! When `trace_packets` is configured, each physical connection keeps the
//! last N packet summaries in a ring. Entries carry a capped preview of
//! the payload, never the payload itself, so large transfers cost a
//! fixed amount of memory.

use std::collections::VecDeque;
use std::fmt::Write;

/// Bytes of payload kept per entry.
pub const PREVIEW_BYTES: usize = 32;

/// Direction of a traced packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// Summary of one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub direction: Direction,
    pub sequence_id: u8,
    /// Full payload length
    pub length: usize,
    /// First [`PREVIEW_BYTES`] of the payload
    pub preview: Vec<u8>,
}

impl TraceEntry {
    /// Hex rendering of the preview, with `..` when truncated.
    pub fn hex_preview(&self) -> String {
        let mut out = hex(&self.preview);
        if self.length > self.preview.len() {
            out.push_str("..");
        }
        out
    }
}

/// Render bytes as lowercase hex.
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Fixed-capacity ring of recent packets.
#[derive(Debug, Clone)]
pub struct WireTrace {
    capacity: usize,
    entries: VecDeque<TraceEntry>,
    total: u64,
}

impl WireTrace {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.clamp(1, 1024)),
            total: 0,
        }
    }

    /// Record a packet, evicting the oldest entry when full.
    pub fn record(&mut self, direction: Direction, sequence_id: u8, payload: &[u8]) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        let entry = TraceEntry {
            direction,
            sequence_id,
            length: payload.len(),
            preview: payload[..payload.len().min(PREVIEW_BYTES)].to_vec(),
        };
        tracing::trace!(
            direction = ?direction,
            seq = sequence_id,
            len = entry.length,
            preview = %entry.hex_preview(),
            "packet"
        );
        self.entries.push_back(entry);
        self.total += 1;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Packets recorded since creation, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.total
    }

    /// Entries from oldest to newest.
    pub fn entries(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_stays_bounded() {
        let mut trace = WireTrace::new(4);
        let big = vec![0xAB; 1 << 20];
        for seq in 0..10u8 {
            trace.record(Direction::Sent, seq, &big);
        }
        assert_eq!(trace.len(), 4);
        assert_eq!(trace.total_recorded(), 10);
        let seqs: Vec<u8> = trace.entries().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![6, 7, 8, 9]);
        assert!(trace.entries().all(|e| e.preview.len() == PREVIEW_BYTES));
        assert!(trace.entries().all(|e| e.length == 1 << 20));
    }

    #[test]
    fn preview_marks_truncation() {
        let mut trace = WireTrace::new(2);
        trace.record(Direction::Received, 1, &[0x00, 0x01]);
        trace.record(Direction::Received, 2, &[0xFF; 40]);
        let previews: Vec<String> = trace.entries().map(TraceEntry::hex_preview).collect();
        assert_eq!(previews[0], "0001");
        assert!(previews[1].ends_with(".."));
        assert_eq!(previews[1].len(), PREVIEW_BYTES * 2 + 2);
    }
}
