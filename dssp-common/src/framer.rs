//! DSSP data link layer
//!
//! A message is protected by a little-endian CRC16 trailer and then COBS
//! stuffed, so a zero byte can only ever appear as a frame delimiter on the
//! wire. [`FrameDecoder`] reassembles frames from arbitrary read chunks.

use crc::{Crc, CRC_16_IBM_3740};
use tracing::trace;

/// Seed used for every DSSP checksum
pub const CRC16_INITIAL: u16 = 0xFFFF;

/// Largest encoded frame body the decoder will buffer before giving up on it
pub const MAX_FRAME_LEN: usize = 1024;

/// CRC-16/CCITT-FALSE: polynomial 0x1021, no reflection
const DSSP_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

pub fn crc16(initial: u16, bytes: &[u8]) -> u16 {
    let mut digest = DSSP_CRC.digest_with_initial(initial);
    digest.update(bytes);
    digest.finalize()
}

/// Zero-stuff `payload` into a self delimited frame.
///
/// The output starts with a zero to flush any partial frame the receiver may
/// be holding, and ends with the zero terminator.
pub fn cobs_encode(payload: &[u8]) -> Vec<u8> {
    let stuffed = cobs::encode_vec(payload);
    let mut encoded = Vec::with_capacity(stuffed.len() + 2);
    encoded.push(0);
    encoded.extend_from_slice(&stuffed);
    encoded.push(0);
    encoded
}

/// Undo [`cobs_encode`] for a frame body with both delimiters removed.
///
/// Returns `None` when the body is not valid COBS.
pub fn cobs_decode(body: &[u8]) -> Option<Vec<u8>> {
    // A delimiter inside the body would end the frame early
    if body.contains(&0) {
        return None;
    }
    cobs::decode_vec(body).ok()
}

/// Wrap a gateway message into a complete DSSP frame.
pub fn encode(message: &[u8]) -> Vec<u8> {
    let crc = crc16(CRC16_INITIAL, message);
    let mut protected = Vec::with_capacity(message.len() + 2);
    protected.extend_from_slice(message);
    protected.extend_from_slice(&crc.to_le_bytes());
    cobs_encode(&protected)
}

/// Check the CRC trailer of a decoded frame, returning the message without it.
fn strip_checksum(mut frame: Vec<u8>) -> Option<Vec<u8>> {
    if frame.len() < 2 {
        return None;
    }

    let split = frame.len() - 2;
    let received = u16::from_le_bytes([frame[split], frame[split + 1]]);
    if crc16(CRC16_INITIAL, &frame[..split]) != received {
        return None;
    }

    frame.truncate(split);
    Some(frame)
}

/// Stateful frame reassembler for an incoming byte stream
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    in_frame: bool,
    in_overflow: bool,
    max_len: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_len),
            in_frame: false,
            in_overflow: false,
            max_len,
        }
    }

    /// Feed a chunk of received bytes.
    ///
    /// Returns every complete frame in the chunk whose checksum verified,
    /// with the checksum removed. Corrupt frames are dropped.
    pub fn process(&mut self, input: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for &byte in input {
            if byte != 0 {
                if self.in_overflow {
                    continue;
                }
                if self.buffer.len() >= self.max_len {
                    trace!("DSSP frame exceeded {} bytes, discarding", self.max_len);
                    self.buffer.clear();
                    self.in_frame = false;
                    self.in_overflow = true;
                    continue;
                }
                // The leading zero is optional, anything else may start a frame
                self.in_frame = true;
                self.buffer.push(byte);
                continue;
            }

            self.in_overflow = false;
            if !self.in_frame {
                self.buffer.clear();
                continue;
            }

            self.in_frame = false;
            let valid = cobs_decode(&self.buffer).and_then(strip_checksum);
            self.buffer.clear();

            match valid {
                Some(frame) => frames.push(frame),
                None => trace!("Dropping DSSP frame with bad framing or checksum"),
            }
        }

        frames
    }

    /// Forget any partially received frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.in_frame = false;
        self.in_overflow = false;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
