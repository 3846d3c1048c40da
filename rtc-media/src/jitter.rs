//! Video jitter buffer: a fixed-capacity ring of RTP packets keyed
//! by sequence number, reassembling frame boundaries before handing the
//! concatenated payload to a decoder.
//!
//! Grounded on aiortc's `jitterbuffer.py` ring-buffer-with-origin shape
//! (`add`/`peek`/`remove`/reset-on-large-jump), extended with a
//! first-packet/marker-bit frame-completion scan over raw RTP packets
//! rather than aiortc's per-packet depacketize-before-buffer approach, so
//! the depacketizer runs once per completed frame instead of once per
//! packet.

use bytes::{Bytes, BytesMut};

/// Sequence numbers further behind the buffer's origin than this are
/// treated as late arrivals and discarded rather than triggering a reset.
pub const MAX_MISORDER: i32 = 100;
/// Sequence numbers this far ahead of the origin force a resynchronization
/// (the sender presumably restarted or we missed a very long run).
pub const MAX_DROPOUT: i32 = 3000;

#[derive(Debug, Clone)]
struct Slot {
    sequence_number: u16,
    timestamp: u32,
    first_in_frame: bool,
    marker: bool,
    payload: Bytes,
}

/// One reassembled coded frame, ready for a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterFrame {
    pub payload: Bytes,
    pub first_sequence_number: u16,
    pub timestamp: u32,
}

/// Ring buffer of capacity `C` (default 128, the configurable RTP
/// jitter-buffer capacity), origined on the first packet it sees.
pub struct JitterBuffer {
    capacity: usize,
    slots: Vec<Option<Slot>>,
    head: usize,
    origin: Option<u16>,
}

impl JitterBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: vec![None; capacity],
            head: 0,
            origin: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn reset(&mut self) {
        self.head = 0;
        self.origin = None;
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// Inserts one RTP packet's payload, positioned by `sequence_number`
    /// relative to the buffer's origin. Returns every contiguous completed
    /// frame the insertion makes available, oldest first (normally at most
    /// one, but a burst of reordered packets can complete several at once).
    pub fn add(
        &mut self,
        sequence_number: u16,
        timestamp: u32,
        first_in_frame: bool,
        marker: bool,
        payload: Bytes,
    ) -> Vec<JitterFrame> {
        let origin = match self.origin {
            None => {
                self.origin = Some(sequence_number);
                sequence_number
            }
            Some(origin) => {
                let delta = sequence_number.wrapping_sub(origin) as i16 as i32;
                if delta <= -MAX_MISORDER {
                    self.reset();
                    self.origin = Some(sequence_number);
                    sequence_number
                } else if delta < 0 {
                    // Late arrival within tolerance: below the window, drop.
                    return Vec::new();
                } else {
                    origin
                }
            }
        };

        let delta = sequence_number.wrapping_sub(origin) as i16 as i32;
        if delta >= self.capacity as i32 {
            if delta > MAX_DROPOUT {
                self.reset();
                self.origin = Some(sequence_number);
            } else {
                return Vec::new();
            }
        }

        let delta = sequence_number.wrapping_sub(self.origin.unwrap()) as i16 as i32;
        if !(0..self.capacity as i32).contains(&delta) {
            return Vec::new();
        }
        let pos = (self.head + delta as usize) % self.capacity;
        self.slots[pos] = Some(Slot { sequence_number, timestamp, first_in_frame, marker, payload });

        self.drain_complete_frames()
    }

    /// Scans forward from `head` for a run starting at a `first_in_frame`
    /// packet and ending at a `marker` packet with no gaps in between,
    /// advancing `head`/`origin` past every frame it emits.
    fn drain_complete_frames(&mut self) -> Vec<JitterFrame> {
        let mut frames = Vec::new();
        loop {
            let Some(first) = self.slots[self.head].as_ref() else { break };
            if !first.first_in_frame {
                // Stale fragment from a frame we can never complete (its
                // start already scrolled out); drop it and keep scanning.
                self.slots[self.head] = None;
                self.advance_origin(1);
                continue;
            }
            let mut end_offset = None;
            for offset in 0..self.capacity {
                let pos = (self.head + offset) % self.capacity;
                match &self.slots[pos] {
                    Some(slot) if slot.marker => {
                        end_offset = Some(offset);
                        break;
                    }
                    Some(_) => continue,
                    None => break,
                }
            }
            let Some(end_offset) = end_offset else { break };

            let mut payload = BytesMut::new();
            for offset in 0..=end_offset {
                let pos = (self.head + offset) % self.capacity;
                let slot = self.slots[pos].take().unwrap();
                payload.extend_from_slice(&slot.payload);
                if offset == 0 {
                    frames.push(JitterFrame {
                        payload: Bytes::new(),
                        first_sequence_number: slot.sequence_number,
                        timestamp: slot.timestamp,
                    });
                }
            }
            let last = frames.last_mut().unwrap();
            last.payload = payload.freeze();
            self.advance_origin(end_offset + 1);
        }
        frames
    }

    fn advance_origin(&mut self, count: usize) {
        self.head = (self.head + count) % self.capacity;
        if let Some(origin) = self.origin.as_mut() {
            *origin = origin.wrapping_add(count as u16);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pkt(seq: u16, first: bool, marker: bool, data: &[u8]) -> (u16, u32, bool, bool, Bytes) {
        (seq, 1000, first, marker, Bytes::copy_from_slice(data))
    }

    #[test]
    fn single_packet_frame_emits_immediately() {
        let mut jb = JitterBuffer::new(128);
        let (seq, ts, f, m, payload) = pkt(1, true, true, b"frame1");
        let frames = jb.add(seq, ts, f, m, payload);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, Bytes::from_static(b"frame1"));
        assert_eq!(frames[0].first_sequence_number, 1);
    }

    #[test]
    fn multi_packet_frame_waits_for_marker() {
        let mut jb = JitterBuffer::new(128);
        let (s, t, f, m, p) = pkt(1, true, false, b"AAA");
        assert!(jb.add(s, t, f, m, p).is_empty());
        let (s, t, f, m, p) = pkt(2, false, true, b"BBB");
        let frames = jb.add(s, t, f, m, p);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, Bytes::from_static(b"AAABBB"));
    }

    #[test]
    fn reordered_packets_still_complete() {
        let mut jb = JitterBuffer::new(128);
        let (s, t, f, m, p) = pkt(2, false, true, b"BBB");
        assert!(jb.add(s, t, f, m, p).is_empty());
        let (s, t, f, m, p) = pkt(1, true, false, b"AAA");
        let frames = jb.add(s, t, f, m, p);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, Bytes::from_static(b"AAABBB"));
    }

    #[test]
    fn large_jump_beyond_dropout_resets_and_reorigins() {
        let mut jb = JitterBuffer::new(128);
        let (s, t, f, m, p) = pkt(1, true, false, b"A");
        jb.add(s, t, f, m, p);
        let (s, t, f, m, p) = pkt(1 + (MAX_DROPOUT as u16) + 1, true, true, b"B");
        let frames = jb.add(s, t, f, m, p);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, Bytes::from_static(b"B"));
    }

    #[test]
    fn far_late_arrival_dropped() {
        let mut jb = JitterBuffer::new(128);
        let (s, t, f, m, p) = pkt(200, true, true, b"A");
        jb.add(s, t, f, m, p);
        let (s, t, f, m, p) = pkt(1, true, true, b"late");
        assert!(jb.add(s, t, f, m, p).is_empty());
    }
}
