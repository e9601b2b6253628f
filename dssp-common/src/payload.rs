// payload.rs - typed SDO payloads carried by gateway messages
use std::fmt;
use thiserror::Error;

/// Gateway payload types, as carried in the `ptype` byte of SDO requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PayloadType {
    Bool = 0,
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Int64 = 4,
    Uint8 = 5,
    Uint16 = 6,
    Uint32 = 7,
    Uint64 = 8,
    Real32 = 9,
    Real64 = 10,
    String = 11,
    #[default]
    Domain = 12,
}

impl PayloadType {
    /// Encoded width in bytes, `None` for the variable length types.
    pub fn width(self) -> Option<usize> {
        match self {
            Self::Bool | Self::Int8 | Self::Uint8 => Some(1),
            Self::Int16 | Self::Uint16 => Some(2),
            Self::Int32 | Self::Uint32 | Self::Real32 => Some(4),
            Self::Int64 | Self::Uint64 | Self::Real64 => Some(8),
            Self::String | Self::Domain => None,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Bool),
            1 => Some(Self::Int8),
            2 => Some(Self::Int16),
            3 => Some(Self::Int32),
            4 => Some(Self::Int64),
            5 => Some(Self::Uint8),
            6 => Some(Self::Uint16),
            7 => Some(Self::Uint32),
            8 => Some(Self::Uint64),
            9 => Some(Self::Real32),
            10 => Some(Self::Real64),
            11 => Some(Self::String),
            12 => Some(Self::Domain),
            _ => None,
        }
    }
}

/// A decoded SDO value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Domain(Vec<u8>),
}

impl Value {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Self::Bool(_) => PayloadType::Bool,
            Self::I8(_) => PayloadType::Int8,
            Self::I16(_) => PayloadType::Int16,
            Self::I32(_) => PayloadType::Int32,
            Self::I64(_) => PayloadType::Int64,
            Self::U8(_) => PayloadType::Uint8,
            Self::U16(_) => PayloadType::Uint16,
            Self::U32(_) => PayloadType::Uint32,
            Self::U64(_) => PayloadType::Uint64,
            Self::F32(_) => PayloadType::Real32,
            Self::F64(_) => PayloadType::Real64,
            Self::String(_) => PayloadType::String,
            Self::Domain(_) => PayloadType::Domain,
        }
    }

    /// Little-endian payload bytes for a download
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Bool(v) => vec![*v as u8],
            Self::I8(v) => v.to_le_bytes().to_vec(),
            Self::I16(v) => v.to_le_bytes().to_vec(),
            Self::I32(v) => v.to_le_bytes().to_vec(),
            Self::I64(v) => v.to_le_bytes().to_vec(),
            Self::U8(v) => vec![*v],
            Self::U16(v) => v.to_le_bytes().to_vec(),
            Self::U32(v) => v.to_le_bytes().to_vec(),
            Self::U64(v) => v.to_le_bytes().to_vec(),
            Self::F32(v) => v.to_le_bytes().to_vec(),
            Self::F64(v) => v.to_le_bytes().to_vec(),
            Self::String(v) => v.as_bytes().to_vec(),
            Self::Domain(v) => v.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::I8(v) => write!(f, "{}", v),
            Self::I16(v) => write!(f, "{}", v),
            Self::I32(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
            Self::U8(v) => write!(f, "{}", v),
            Self::U16(v) => write!(f, "{}", v),
            Self::U32(v) => write!(f, "{}", v),
            Self::U64(v) => write!(f, "{}", v),
            Self::F32(v) => write!(f, "{}", v),
            Self::F64(v) => write!(f, "{}", v),
            Self::String(v) => write!(f, "{}", v),
            Self::Domain(v) => write!(f, "{:02X?}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("{payload_type:?} needs {expected} bytes, got {actual}")]
    Length {
        payload_type: PayloadType,
        expected: usize,
        actual: usize,
    },
    #[error("payload is not valid text: {0}")]
    Text(String),
}

fn fixed<const N: usize>(payload: &[u8], payload_type: PayloadType) -> Result<[u8; N], PayloadError> {
    payload.try_into().map_err(|_| PayloadError::Length {
        payload_type,
        expected: N,
        actual: payload.len(),
    })
}

/// Decode a response payload according to the type that was requested
pub fn parse_payload(payload: &[u8], payload_type: PayloadType) -> Result<Value, PayloadError> {
    let value = match payload_type {
        PayloadType::Bool => Value::Bool(fixed::<1>(payload, payload_type)?[0] != 0),
        PayloadType::Int8 => Value::I8(i8::from_le_bytes(fixed(payload, payload_type)?)),
        PayloadType::Int16 => Value::I16(i16::from_le_bytes(fixed(payload, payload_type)?)),
        PayloadType::Int32 => Value::I32(i32::from_le_bytes(fixed(payload, payload_type)?)),
        PayloadType::Int64 => Value::I64(i64::from_le_bytes(fixed(payload, payload_type)?)),
        PayloadType::Uint8 => Value::U8(fixed::<1>(payload, payload_type)?[0]),
        PayloadType::Uint16 => Value::U16(u16::from_le_bytes(fixed(payload, payload_type)?)),
        PayloadType::Uint32 => Value::U32(u32::from_le_bytes(fixed(payload, payload_type)?)),
        PayloadType::Uint64 => Value::U64(u64::from_le_bytes(fixed(payload, payload_type)?)),
        PayloadType::Real32 => Value::F32(f32::from_le_bytes(fixed(payload, payload_type)?)),
        PayloadType::Real64 => Value::F64(f64::from_le_bytes(fixed(payload, payload_type)?)),
        PayloadType::String => {
            let text = std::str::from_utf8(payload).map_err(|e| PayloadError::Text(e.to_string()))?;
            Value::String(text.trim_end_matches('\0').to_string())
        }
        PayloadType::Domain => Value::Domain(payload.to_vec()),
    };
    Ok(value)
}
