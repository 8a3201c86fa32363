//! Ring-buffered stream resynchronizer.
//!
//! The RS-485 line delivers bytes with no alignment guarantee: frames can
//! arrive split across reads, preceded by line noise, or truncated when
//! another node wins the bus. [`StreamResync`] buffers arrivals in a fixed
//! 512-byte ring and yields only frames that pass structural and checksum
//! validation, discarding garbage one byte at a time so that a corrupted
//! frame can never mask a valid one that overlaps it.

use crate::frame::{self, FRAME_OVERHEAD, MAX_FRAME_LEN, PREAMBLE};

/// Ring capacity. Several worst-case frames plus slack for bursts.
pub const RING_CAPACITY: usize = 512;
/// On overflow, everything but this many trailing bytes is dropped.
const OVERFLOW_KEEP: usize = 64;

// ── Counters ──────────────────────────────────────────────────────────────────

/// Monotonic link statistics. Owned by the resynchronizer, copied out by
/// the poller after each drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkCounters {
    /// Bytes offered via `push`, including any later dropped.
    pub bytes_in: u64,
    /// Frames extracted with a valid checksum.
    pub frames_ok: u64,
    /// Candidate frames discarded for a checksum mismatch.
    pub bad_checksum: u64,
    /// Times a push exceeded capacity and the buffer was trimmed.
    pub overflow: u64,
    /// Times leading garbage was discarded to recover a preamble.
    pub resync: u64,
}

// ── Ring buffer ───────────────────────────────────────────────────────────────

/// Fixed-capacity byte ring with frame extraction.
pub struct StreamResync {
    buf: [u8; RING_CAPACITY],
    head: usize,
    count: usize,
    counters: LinkCounters,
}

impl Default for StreamResync {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamResync {
    pub fn new() -> Self {
        Self {
            buf: [0; RING_CAPACITY],
            head: 0,
            count: 0,
            counters: LinkCounters::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn counters(&self) -> LinkCounters {
        self.counters
    }

    /// Drop all buffered bytes. Used when the UART reports receiver overrun,
    /// since the ring then holds a stream with an unknowable gap in it.
    pub fn clear(&mut self) {
        self.head = 0;
        self.count = 0;
    }

    fn at(&self, idx: usize) -> u8 {
        self.buf[(self.head + idx) % RING_CAPACITY]
    }

    fn pop(&mut self, n: usize) {
        let n = n.min(self.count);
        self.head = (self.head + n) % RING_CAPACITY;
        self.count -= n;
    }

    fn push_byte(&mut self, b: u8) {
        self.buf[(self.head + self.count) % RING_CAPACITY] = b;
        self.count += 1;
    }

    /// Accept a byte arrival. A push that would exceed capacity first trims
    /// the buffer to its most recent [`OVERFLOW_KEEP`] bytes; the sender
    /// retries on the next poll, so losing the older stream is acceptable.
    pub fn push(&mut self, bytes: &[u8]) {
        self.counters.bytes_in += bytes.len() as u64;

        let mut incoming = bytes;
        if self.count + incoming.len() > RING_CAPACITY {
            self.counters.overflow += 1;
            if self.count > OVERFLOW_KEEP {
                self.pop(self.count - OVERFLOW_KEEP);
            }
            // A single arrival larger than the remaining space keeps only
            // its newest bytes as well.
            let room = RING_CAPACITY - self.count;
            if incoming.len() > room {
                incoming = &incoming[incoming.len() - room..];
            }
        }
        for &b in incoming {
            self.push_byte(b);
        }
    }

    fn find_preamble(&self) -> Option<usize> {
        if self.count < PREAMBLE.len() {
            return None;
        }
        (0..=self.count - PREAMBLE.len()).find(|&p| {
            self.at(p) == PREAMBLE[0]
                && self.at(p + 1) == PREAMBLE[1]
                && self.at(p + 2) == PREAMBLE[2]
        })
    }

    /// Extract the next complete, checksum-valid frame into `out`, returning
    /// its length. Returns `None` when no complete frame is buffered yet.
    pub fn try_take_frame(&mut self, out: &mut [u8; MAX_FRAME_LEN]) -> Option<usize> {
        loop {
            if self.count < FRAME_OVERHEAD {
                return None;
            }

            let pre = match self.find_preamble() {
                Some(p) => p,
                None => {
                    // Keep the trailing two bytes: they may be the start of a
                    // preamble split across the arrival boundary.
                    self.pop(self.count - 2);
                    return None;
                }
            };
            if pre > 0 {
                self.pop(pre);
                self.counters.resync += 1;
                continue;
            }

            // Preamble at the head; next byte must open the header.
            if self.at(3) != frame::START_BYTE {
                self.pop(1);
                continue;
            }

            let required = FRAME_OVERHEAD + self.at(8) as usize;
            if required > MAX_FRAME_LEN {
                self.pop(1);
                continue;
            }
            if self.count < required {
                return None;
            }

            for i in 0..required {
                out[i] = self.at(i);
            }
            match frame::validate_checksum(&out[..required]) {
                Ok(()) => {
                    self.pop(required);
                    self.counters.frames_ok += 1;
                    return Some(required);
                }
                Err(_) => {
                    self.pop(1);
                    self.counters.bad_checksum += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{build, ACTION_STATUS_REQUEST, ACTION_STATUS_RESPONSE};

    fn status_request() -> Vec<u8> {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let len = build(&mut buf, 144, 16, ACTION_STATUS_REQUEST, &[]).unwrap();
        buf[..len].to_vec()
    }

    #[test]
    fn clean_frame_comes_straight_out() {
        let mut rs = StreamResync::new();
        let wire = status_request();
        rs.push(&wire);

        let mut out = [0u8; MAX_FRAME_LEN];
        let len = rs.try_take_frame(&mut out).unwrap();
        assert_eq!(&out[..len], &wire[..]);
        assert!(rs.is_empty());
        assert_eq!(rs.counters().frames_ok, 1);
        assert_eq!(rs.counters().resync, 0);
    }

    #[test]
    fn resyncs_past_leading_garbage() {
        let mut rs = StreamResync::new();
        let mut wire = vec![0xAA, 0xBB];
        wire.extend_from_slice(&status_request());
        rs.push(&wire);

        let mut out = [0u8; MAX_FRAME_LEN];
        let len = rs.try_take_frame(&mut out).unwrap();
        assert_eq!(&out[..len], &status_request()[..]);
        assert_eq!(rs.len(), 0);
        assert_eq!(rs.counters().resync, 1);
    }

    #[test]
    fn arbitrary_garbage_prefix_yields_exactly_one_frame() {
        // No preamble inside the prefix, by construction.
        let garbage = [0x01, 0x02, 0x03, 0xFE, 0x7F, 0x00, 0x00, 0x13];
        let mut rs = StreamResync::new();
        rs.push(&garbage);
        rs.push(&status_request());

        let mut out = [0u8; MAX_FRAME_LEN];
        let mut frames = 0;
        while rs.try_take_frame(&mut out).is_some() {
            frames += 1;
        }
        assert_eq!(frames, 1);
    }

    #[test]
    fn frame_split_across_pushes() {
        let wire = status_request();
        let mut rs = StreamResync::new();
        let mut out = [0u8; MAX_FRAME_LEN];

        rs.push(&wire[..5]);
        assert!(rs.try_take_frame(&mut out).is_none());
        rs.push(&wire[5..]);
        let len = rs.try_take_frame(&mut out).unwrap();
        assert_eq!(&out[..len], &wire[..]);
    }

    #[test]
    fn preamble_split_across_arrival_boundary_survives_discard() {
        let wire = status_request();
        let mut rs = StreamResync::new();
        let mut out = [0u8; MAX_FRAME_LEN];

        // Garbage long enough to trigger the no-preamble discard, ending in
        // the first two preamble bytes.
        let mut first = vec![0x11u8; 12];
        first.extend_from_slice(&[0xFF, 0x00]);
        rs.push(&first);
        assert!(rs.try_take_frame(&mut out).is_none());

        rs.push(&wire[2..]);
        let len = rs.try_take_frame(&mut out).unwrap();
        assert_eq!(&out[..len], &wire[..]);
    }

    #[test]
    fn bad_checksum_discards_one_byte_and_counts() {
        let mut wire = status_request();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let mut rs = StreamResync::new();
        rs.push(&wire);
        let mut out = [0u8; MAX_FRAME_LEN];
        assert!(rs.try_take_frame(&mut out).is_none());
        assert_eq!(rs.counters().bad_checksum, 1);
        assert_eq!(rs.counters().frames_ok, 0);
        // Retrying the remaining bytes must not conjure a second frame.
        assert!(rs.try_take_frame(&mut out).is_none());
    }

    #[test]
    fn oversized_length_claim_is_skipped() {
        // Preamble + A5 header claiming a 200-byte payload, then a real frame.
        let mut wire = vec![0xFF, 0x00, 0xFF, 0xA5, 0x00, 0x90, 0x10, 0x12, 200];
        wire.extend_from_slice(&status_request());
        let mut rs = StreamResync::new();
        rs.push(&wire);

        let mut out = [0u8; MAX_FRAME_LEN];
        let len = rs.try_take_frame(&mut out).unwrap();
        assert_eq!(&out[..len], &status_request()[..]);
    }

    #[test]
    fn overflow_keeps_newest_bytes() {
        let mut rs = StreamResync::new();
        rs.push(&[0x55u8; RING_CAPACITY]);
        // Second push overflows; buffer is trimmed, then the frame fits.
        rs.push(&status_request());
        assert_eq!(rs.counters().overflow, 1);

        let mut out = [0u8; MAX_FRAME_LEN];
        let len = rs.try_take_frame(&mut out).unwrap();
        assert_eq!(&out[..len], &status_request()[..]);
    }

    #[test]
    fn every_yielded_frame_validates() {
        // Mixed soup: garbage, a corrupt frame, two good frames, truncation.
        let good = status_request();
        let mut corrupt = good.clone();
        corrupt[7] ^= 0xFF;

        let mut soup = Vec::new();
        soup.extend_from_slice(&[0x00, 0xA5, 0xFF]);
        soup.extend_from_slice(&corrupt);
        soup.extend_from_slice(&good);
        soup.extend_from_slice(&good[..6]);
        soup.extend_from_slice(&good);

        let mut rs = StreamResync::new();
        rs.push(&soup);
        let mut out = [0u8; MAX_FRAME_LEN];
        let mut yielded = 0;
        while let Some(len) = rs.try_take_frame(&mut out) {
            crate::frame::validate_structure(&out[..len]).unwrap();
            crate::frame::validate_checksum(&out[..len]).unwrap();
            yielded += 1;
        }
        assert_eq!(yielded, 2);
    }

    #[test]
    fn response_frame_with_payload_round_trips() {
        let payload: Vec<u8> = (0..41).map(|i| i as u8).collect();
        let mut buf = [0u8; MAX_FRAME_LEN];
        let len = build(&mut buf, 16, 144, ACTION_STATUS_RESPONSE, &payload).unwrap();

        let mut rs = StreamResync::new();
        rs.push(&buf[..len]);
        let mut out = [0u8; MAX_FRAME_LEN];
        let got = rs.try_take_frame(&mut out).unwrap();
        assert_eq!(&out[..got], &buf[..len]);
    }
}
