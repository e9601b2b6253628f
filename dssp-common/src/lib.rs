//! # DSSP Common Library
//!
//! Shared DSSP protocol implementation used by both the host gateway
//! and the mock gateway node used for testing.
//!
//! This library provides:
//! - DSSP framing (COBS stuffing with a CRC16 trailer)
//! - Gateway transport message encoding/decoding, including segmented SDO
//! - Typed SDO payloads and gateway error codes

pub mod framer;
pub mod payload;
pub mod transport;

// Re-export commonly used types for convenience
pub use framer::{cobs_decode, cobs_encode, crc16, FrameDecoder, CRC16_INITIAL};
pub use payload::{parse_payload, PayloadError, PayloadType, Value};
pub use transport::{ErrorCode, GatewayMessage, SdoCommand, SdoMessage, TransportCodec};
