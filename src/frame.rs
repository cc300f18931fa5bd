//! Module A — Frame Codec (spec §4.A, §6).
//!
//! Fixed 16-byte little-endian header followed by mono 16-bit PCM payload.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

pub const HEADER_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidFrame {
    #[error("frame shorter than the 16-byte header (got {0} bytes)")]
    TooShort(usize),
    #[error("payload length {0} is not a multiple of 2")]
    OddPayload(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub seq: u32,
    pub capture_ts: f64,
    pub duration_ms: f32,
    pub payload: Vec<u8>,
}

impl AudioFrame {
    /// Decode the wire header + PCM payload (spec §6 layout).
    pub fn decode(bytes: &[u8]) -> Result<Self, InvalidFrame> {
        if bytes.len() < HEADER_LEN {
            return Err(InvalidFrame::TooShort(bytes.len()));
        }
        let payload = &bytes[HEADER_LEN..];
        if payload.len() % 2 != 0 {
            return Err(InvalidFrame::OddPayload(payload.len()));
        }
        let seq = LittleEndian::read_u32(&bytes[0..4]);
        let capture_ts = LittleEndian::read_f64(&bytes[4..12]);
        let duration_ms = LittleEndian::read_f32(&bytes[12..16]);
        Ok(AudioFrame {
            seq,
            capture_ts,
            duration_ms,
            payload: payload.to_vec(),
        })
    }

    /// Encode back to wire format. Used only by tests and the replay file
    /// reader; the live ingress path never re-encodes, and the voice-mode
    /// return path sends raw PCM with no header (spec §4.A).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_LEN + self.payload.len()];
        LittleEndian::write_u32(&mut out[0..4], self.seq);
        LittleEndian::write_f64(&mut out[4..12], self.capture_ts);
        LittleEndian::write_f32(&mut out[12..16], self.duration_ms);
        out[HEADER_LEN..].copy_from_slice(&self.payload);
        out
    }

    pub fn sample_count(&self) -> usize {
        self.payload.len() / 2
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_frame() -> AudioFrame {
        AudioFrame {
            seq: 42,
            capture_ts: 1_700_000_000_123.5,
            duration_ms: 250.0,
            payload: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let frame = sample_frame();
        let decoded = AudioFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rejects_short_input() {
        let err = AudioFrame::decode(&[0u8; 10]).unwrap_err();
        assert_eq!(err, InvalidFrame::TooShort(10));
    }

    #[test]
    fn rejects_odd_payload_length() {
        let mut bytes = sample_frame().encode();
        bytes.pop();
        let err = AudioFrame::decode(&bytes).unwrap_err();
        assert_eq!(err, InvalidFrame::OddPayload(3));
    }

    #[test]
    fn accepts_empty_payload() {
        let frame = AudioFrame {
            seq: 0,
            capture_ts: 0.0,
            duration_ms: 0.0,
            payload: vec![],
        };
        let decoded = AudioFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.sample_count(), 0);
    }
}
