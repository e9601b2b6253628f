// transport.rs - gateway transport protocol carried inside DSSP frames
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::framer::{crc16, CRC16_INITIAL};
use crate::payload::PayloadType;

/// First byte of every gateway transport message
pub const TYPE_FIELD: u8 = 0x10;

/// Set in byte 1 for raw CAN messages
const CAN_FLAG: u8 = 0x80;
const NODE_MASK: u8 = 0x7F;

/// Bit 31 of the segment offset field flags the final segment
const LAST_SEGMENT_FLAG: u32 = 0x8000_0000;
const OFFSET_MASK: u32 = 0x7FFF_FFFF;

/// Command byte of acknowledge messages
pub const CMD_ACK: u8 = 0;

/// SDO command specifiers of the gateway transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SdoCommand {
    /// Expedited write, the whole value in one message
    Download = 1,
    /// Read request
    Upload = 2,
    /// Read response
    UploadResponse = 3,
    /// One chunk of a segmented write
    DownloadSegment = 5,
    /// One chunk of a segmented read response
    UploadResponseSegment = 6,
}

impl SdoCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Download),
            2 => Some(Self::Upload),
            3 => Some(Self::UploadResponse),
            5 => Some(Self::DownloadSegment),
            6 => Some(Self::UploadResponseSegment),
            _ => None,
        }
    }

    /// Whether this message answers an outstanding upload request
    pub fn is_upload_response(self) -> bool {
        matches!(self, Self::UploadResponse | Self::UploadResponseSegment)
    }
}

/// Gateway error codes reported in acknowledge messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    InvalidConfig,
    Driver,
    InvalidMessage,
    InvalidCommand,
    ObjectRead,
    ObjectWrite,
    ObjectAccess,
    ObjectRange,
    SdoAbort,
    SdoInvalidRead,
    SdoInvalidWrite,
    Can,
    /// No response from the node, also raised locally when retries run out
    NoResponse,
    Unknown,
    /// A code outside the known table
    Unrecognized(u16),
}

impl ErrorCode {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::InvalidConfig,
            2 => Self::Driver,
            3 => Self::InvalidMessage,
            4 => Self::InvalidCommand,
            5 => Self::ObjectRead,
            6 => Self::ObjectWrite,
            7 => Self::ObjectAccess,
            8 => Self::ObjectRange,
            9 => Self::SdoAbort,
            10 => Self::SdoInvalidRead,
            11 => Self::SdoInvalidWrite,
            12 => Self::Can,
            254 => Self::NoResponse,
            255 => Self::Unknown,
            other => Self::Unrecognized(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 0,
            Self::InvalidConfig => 1,
            Self::Driver => 2,
            Self::InvalidMessage => 3,
            Self::InvalidCommand => 4,
            Self::ObjectRead => 5,
            Self::ObjectWrite => 6,
            Self::ObjectAccess => 7,
            Self::ObjectRange => 8,
            Self::SdoAbort => 9,
            Self::SdoInvalidRead => 10,
            Self::SdoInvalidWrite => 11,
            Self::Can => 12,
            Self::NoResponse => 254,
            Self::Unknown => 255,
            Self::Unrecognized(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Human-readable description of the code
    pub fn description(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidConfig => "Invalid gateway configuration",
            Self::Driver => "Driver layer error",
            Self::InvalidMessage => "Invalid message",
            Self::InvalidCommand => "Invalid command",
            Self::ObjectRead => "Object could not be read",
            Self::ObjectWrite => "Object could not be written",
            Self::ObjectAccess => "Object access not permitted",
            Self::ObjectRange => "Object value out of range",
            Self::SdoAbort => "SDO transfer was aborted by node",
            Self::SdoInvalidRead => "SDO invalid read operation",
            Self::SdoInvalidWrite => "SDO invalid write operation",
            Self::Can => "CAN error",
            Self::NoResponse => "No response from node",
            Self::Unknown => "An unknown error was reported",
            Self::Unrecognized(_) => "Unknown error code",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// SDO part of a gateway message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoMessage {
    pub node: u8,
    pub command: SdoCommand,
    pub index: u16,
    pub subindex: u8,
    pub payload_type: PayloadType,
    pub payload: Vec<u8>,
    /// Byte offset of a segment, 31 bits on the wire
    pub offset: u32,
    /// Final segment of a transfer, always true for unsegmented messages
    pub last: bool,
}

impl SdoMessage {
    /// Read request for `index:subindex`
    pub fn upload(node: u8, index: u16, subindex: u8, payload_type: PayloadType, offset: u32) -> Self {
        Self {
            node,
            command: SdoCommand::Upload,
            index,
            subindex,
            payload_type,
            payload: Vec::new(),
            offset,
            last: true,
        }
    }

    /// Write request; picks segmented framing unless this is a single
    /// complete transfer starting at offset zero.
    pub fn download(
        node: u8,
        index: u16,
        subindex: u8,
        payload_type: PayloadType,
        payload: Vec<u8>,
        offset: u32,
        last: bool,
    ) -> Self {
        let command = if offset == 0 && last {
            SdoCommand::Download
        } else {
            SdoCommand::DownloadSegment
        };
        Self {
            node,
            command,
            index,
            subindex,
            payload_type,
            payload,
            offset,
            last,
        }
    }
}

/// A message of the gateway transport protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayMessage {
    Ack { error_code: u16 },
    Sdo(SdoMessage),
    Can { cob_id: u32, payload: Vec<u8> },
}

impl GatewayMessage {
    pub fn ack(code: ErrorCode) -> Self {
        Self::Ack { error_code: code.code() }
    }

    /// Whether receiving this message frees the wire for the next request
    pub fn releases_permit(&self) -> bool {
        match self {
            Self::Ack { .. } => true,
            Self::Sdo(sdo) => sdo.command.is_upload_response(),
            Self::Can { .. } => false,
        }
    }

    /// Payload type of the upload response this request may draw
    pub fn response_type(&self) -> Option<PayloadType> {
        match self {
            Self::Sdo(sdo) if matches!(sdo.command, SdoCommand::Upload | SdoCommand::DownloadSegment) => {
                Some(sdo.payload_type)
            }
            _ => None,
        }
    }
}

impl From<SdoMessage> for GatewayMessage {
    fn from(sdo: SdoMessage) -> Self {
        Self::Sdo(sdo)
    }
}

fn put_offset(bytes: &mut Vec<u8>, offset: u32, last: bool) {
    let mut field = offset & OFFSET_MASK;
    if last {
        field |= LAST_SEGMENT_FLAG;
    }
    bytes.extend_from_slice(&field.to_le_bytes());
}

fn get_offset(bytes: &[u8]) -> Option<(u32, bool)> {
    let field = u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?);
    Some((field & OFFSET_MASK, field & LAST_SEGMENT_FLAG != 0))
}

/// Strip the two byte trailer that closes upload responses and device CAN messages
fn strip_trailer(bytes: &[u8]) -> Option<&[u8]> {
    bytes.len().checked_sub(2).map(|end| &bytes[..end])
}

/// Encoder/decoder for gateway transport messages.
///
/// Upload responses do not carry their payload type. The sender stores the
/// type of the request it is about to put on the wire with
/// [`set_response_type`](Self::set_response_type) and the codec applies it
/// when a response is decoded. The slot is atomic because the transmit and
/// receive loops run on separate tasks.
///
/// Raw CAN messages coming from the gateway end with a two byte trailer that
/// host messages do not have. A host codec strips it on decode; a device
/// codec appends it on encode.
#[derive(Debug)]
pub struct TransportCodec {
    response_type: AtomicU8,
    device: bool,
}

impl TransportCodec {
    /// Codec for the host side of the link
    pub fn new() -> Self {
        Self {
            response_type: AtomicU8::new(PayloadType::Domain as u8),
            device: false,
        }
    }

    /// Codec for the gateway side of the link
    pub fn device() -> Self {
        Self {
            device: true,
            ..Self::new()
        }
    }

    /// Payload type that will be applied to the next decoded upload response
    pub fn response_type(&self) -> PayloadType {
        PayloadType::from_u8(self.response_type.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn set_response_type(&self, payload_type: PayloadType) {
        self.response_type.store(payload_type as u8, Ordering::Release);
    }

    pub fn encode(&self, message: &GatewayMessage) -> Vec<u8> {
        match message {
            GatewayMessage::Ack { error_code } => {
                let [lo, hi] = error_code.to_le_bytes();
                vec![TYPE_FIELD, 0, CMD_ACK, lo, hi]
            }
            GatewayMessage::Can { cob_id, payload } => {
                let mut bytes = Vec::with_capacity(8 + payload.len());
                bytes.extend_from_slice(&[TYPE_FIELD, CAN_FLAG]);
                bytes.extend_from_slice(&cob_id.to_le_bytes());
                bytes.extend_from_slice(payload);
                if self.device {
                    bytes.extend_from_slice(&crc16(CRC16_INITIAL, payload).to_le_bytes());
                }
                bytes
            }
            GatewayMessage::Sdo(sdo) => self.encode_sdo(sdo),
        }
    }

    fn encode_sdo(&self, sdo: &SdoMessage) -> Vec<u8> {
        let [idx_lo, idx_hi] = sdo.index.to_le_bytes();
        let mut bytes = Vec::with_capacity(13 + sdo.payload.len());
        bytes.extend_from_slice(&[
            TYPE_FIELD,
            sdo.node & NODE_MASK,
            sdo.command as u8,
            idx_lo,
            idx_hi,
            sdo.subindex,
        ]);

        match sdo.command {
            SdoCommand::Download => {
                bytes.push(sdo.payload_type as u8);
                bytes.extend_from_slice(&sdo.payload);
            }
            SdoCommand::DownloadSegment => {
                bytes.push(sdo.payload_type as u8);
                put_offset(&mut bytes, sdo.offset, sdo.last);
                bytes.extend_from_slice(&sdo.payload);
            }
            SdoCommand::Upload => {
                bytes.push(sdo.payload_type as u8);
                if sdo.offset != 0 {
                    put_offset(&mut bytes, sdo.offset, false);
                }
            }
            SdoCommand::UploadResponse => {
                bytes.extend_from_slice(&sdo.payload);
                bytes.extend_from_slice(&crc16(CRC16_INITIAL, &sdo.payload).to_le_bytes());
            }
            SdoCommand::UploadResponseSegment => {
                put_offset(&mut bytes, sdo.offset, sdo.last);
                bytes.extend_from_slice(&sdo.payload);
                bytes.extend_from_slice(&crc16(CRC16_INITIAL, &sdo.payload).to_le_bytes());
            }
        }
        bytes
    }

    /// Decode a validated frame. Anything that is not a well formed gateway
    /// message yields `None`.
    pub fn decode(&self, frame: &[u8]) -> Option<GatewayMessage> {
        if frame.first() != Some(&TYPE_FIELD) || frame.len() < 3 {
            return None;
        }

        if frame[1] & CAN_FLAG != 0 {
            let cob_id = u32::from_le_bytes(frame.get(2..6)?.try_into().ok()?);
            let body = &frame[6..];
            let payload = if self.device { body } else { strip_trailer(body)? };
            return Some(GatewayMessage::Can {
                cob_id,
                payload: payload.to_vec(),
            });
        }

        if frame[2] == CMD_ACK {
            let lo = *frame.get(3)?;
            let hi = frame.get(4).copied().unwrap_or(0);
            return Some(GatewayMessage::Ack {
                error_code: u16::from_le_bytes([lo, hi]),
            });
        }

        let command = SdoCommand::from_u8(frame[2])?;
        if frame.len() < 6 {
            return None;
        }
        let node = frame[1] & NODE_MASK;
        let index = u16::from_le_bytes([frame[3], frame[4]]);
        let subindex = frame[5];
        let body = &frame[6..];

        let mut sdo = SdoMessage {
            node,
            command,
            index,
            subindex,
            payload_type: PayloadType::Domain,
            payload: Vec::new(),
            offset: 0,
            last: true,
        };

        match command {
            SdoCommand::Download => {
                sdo.payload_type = PayloadType::from_u8(*body.first()?)?;
                sdo.payload = body[1..].to_vec();
            }
            SdoCommand::DownloadSegment => {
                sdo.payload_type = PayloadType::from_u8(*body.first()?)?;
                let (offset, last) = get_offset(&body[1..])?;
                sdo.offset = offset;
                sdo.last = last;
                sdo.payload = body[5..].to_vec();
            }
            SdoCommand::Upload => {
                sdo.payload_type = PayloadType::from_u8(*body.first()?)?;
                if let Some((offset, _)) = get_offset(&body[1..]) {
                    sdo.offset = offset;
                }
            }
            SdoCommand::UploadResponse => {
                sdo.payload_type = self.response_type();
                sdo.payload = strip_trailer(body)?.to_vec();
            }
            SdoCommand::UploadResponseSegment => {
                sdo.payload_type = self.response_type();
                let (offset, last) = get_offset(body)?;
                sdo.offset = offset;
                sdo.last = last;
                sdo.payload = strip_trailer(&body[4..])?.to_vec();
            }
        }

        Some(GatewayMessage::Sdo(sdo))
    }
}

impl Default for TransportCodec {
    fn default() -> Self {
        Self::new()
    }
}
