//! Module D — Capture-Timestamp Attributor (spec §4.D).
//!
//! Providers echo back text, not the capture time of the audio that
//! produced it. This keeps a FIFO of `(captureTs, durationMs, seq)` per
//! ingress stream and hands the oldest one out whenever a transcript
//! arrives, so latency can be computed as `now - captureTs` without the
//! provider needing to round-trip anything.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureRecord {
    pub capture_ts: f64,
    pub duration_ms: f32,
    pub seq: u32,
}

/// Tracks capture timestamps for one ingress stream and attributes an
/// origin capture time to each transcript as it arrives.
#[derive(Debug, Default)]
pub struct CaptureAttributor {
    queue: VecDeque<CaptureRecord>,
    next_extrapolated_ts: Option<f64>,
}

impl CaptureAttributor {
    pub fn new() -> Self {
        CaptureAttributor::default()
    }

    pub fn record_chunk(&mut self, capture_ts: f64, duration_ms: f32, seq: u32) {
        self.queue.push_back(CaptureRecord {
            capture_ts,
            duration_ms,
            seq,
        });
    }

    /// Attribute a transcript to the oldest unconsumed chunk. If the queue
    /// has been drained (the provider is behind, or ahead, of its input),
    /// extrapolate from the last known chunk's end instead of stalling.
    pub fn attribute(&mut self) -> f64 {
        if let Some(record) = self.queue.pop_front() {
            self.next_extrapolated_ts = Some(record.capture_ts + record.duration_ms as f64);
            record.capture_ts
        } else if let Some(ts) = self.next_extrapolated_ts {
            ts
        } else {
            0.0
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn attributes_in_fifo_order() {
        let mut a = CaptureAttributor::new();
        a.record_chunk(1000.0, 250.0, 0);
        a.record_chunk(1250.0, 250.0, 1);
        assert_eq!(a.attribute(), 1000.0);
        assert_eq!(a.attribute(), 1250.0);
    }

    #[test]
    fn extrapolates_when_queue_drained() {
        let mut a = CaptureAttributor::new();
        a.record_chunk(1000.0, 250.0, 0);
        assert_eq!(a.attribute(), 1000.0);
        // No more chunks recorded; a second transcript still needs a ts.
        assert_eq!(a.attribute(), 1250.0);
        assert_eq!(a.attribute(), 1250.0);
    }

    #[test]
    fn returns_zero_before_any_chunk_recorded() {
        let mut a = CaptureAttributor::new();
        assert_eq!(a.attribute(), 0.0);
    }

    #[test]
    fn pending_reflects_unconsumed_count() {
        let mut a = CaptureAttributor::new();
        a.record_chunk(0.0, 100.0, 0);
        a.record_chunk(100.0, 100.0, 1);
        assert_eq!(a.pending(), 2);
        a.attribute();
        assert_eq!(a.pending(), 1);
    }
}
