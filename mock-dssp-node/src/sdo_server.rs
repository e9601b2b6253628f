//! SDO server answering gateway transport requests for one node

use std::collections::HashMap;

use dssp_common::{ErrorCode, GatewayMessage, PayloadType, SdoCommand, SdoMessage};
use tracing::{debug, info, warn};

use crate::object_dictionary::ObjectDictionary;

/// Largest payload sent in a single upload response
pub const DEFAULT_SEGMENT_SIZE: usize = 32;

const NMT_COB_ID: u32 = 0x000;
const HEARTBEAT_COB_ID: u32 = 0x700;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtState {
    PreOperational,
    Operational,
    Stopped,
}

pub struct SdoServer {
    node_id: u8,
    object_dict: ObjectDictionary,
    segment_size: usize,
    nmt_state: NmtState,
    /// Segmented downloads in progress, keyed by (index, subindex)
    downloads: HashMap<(u16, u8), Vec<u8>>,
}

impl SdoServer {
    pub fn new(node_id: u8, object_dict: ObjectDictionary) -> Self {
        Self {
            node_id,
            object_dict,
            segment_size: DEFAULT_SEGMENT_SIZE,
            nmt_state: NmtState::PreOperational,
            downloads: HashMap::new(),
        }
    }

    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size.max(1);
        self
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn nmt_state(&self) -> NmtState {
        self.nmt_state
    }

    pub fn object_dict(&self) -> &ObjectDictionary {
        &self.object_dict
    }

    /// Handle a message from the host.
    ///
    /// Returns the messages to send back, which may be none.
    pub fn handle(&mut self, message: &GatewayMessage) -> Vec<GatewayMessage> {
        match message {
            GatewayMessage::Sdo(sdo) => {
                if sdo.node != self.node_id || self.nmt_state == NmtState::Stopped {
                    return Vec::new();
                }
                match sdo.command {
                    SdoCommand::Upload => vec![self.upload(sdo)],
                    SdoCommand::Download => vec![self.download(sdo)],
                    SdoCommand::DownloadSegment => vec![self.download_segment(sdo)],
                    SdoCommand::UploadResponse | SdoCommand::UploadResponseSegment => {
                        debug!("Ignoring upload response sent by host");
                        Vec::new()
                    }
                }
            }
            GatewayMessage::Can { cob_id, payload } => self.raw_can(*cob_id, payload),
            GatewayMessage::Ack { .. } => Vec::new(),
        }
    }

    fn upload(&self, request: &SdoMessage) -> GatewayMessage {
        let Some((data, payload_type)) = self.object_dict.get(request.index, request.subindex) else {
            warn!("Object not found: 0x{:04X}:{:02X}", request.index, request.subindex);
            return GatewayMessage::ack(ErrorCode::ObjectRead);
        };
        debug!(
            "Upload 0x{:04X}:{:02X} offset {} ({:?}, {} bytes)",
            request.index, request.subindex, request.offset, payload_type, data.len()
        );

        let mut response = SdoMessage {
            node: self.node_id,
            command: SdoCommand::UploadResponse,
            index: request.index,
            subindex: request.subindex,
            payload_type,
            payload: Vec::new(),
            offset: 0,
            last: true,
        };

        let fixed = payload_type.width().is_some();
        if fixed || (request.offset == 0 && !needs_segments(payload_type, data.len(), self.segment_size)) {
            response.payload = data;
            return response.into();
        }

        let start = request.offset as usize;
        if start > data.len() {
            return GatewayMessage::ack(ErrorCode::ObjectRange);
        }
        let end = (start + self.segment_size).min(data.len());
        response.command = SdoCommand::UploadResponseSegment;
        response.offset = request.offset;
        response.last = end == data.len();
        response.payload = data[start..end].to_vec();
        response.into()
    }

    fn download(&mut self, request: &SdoMessage) -> GatewayMessage {
        self.downloads.remove(&(request.index, request.subindex));
        self.store(request.index, request.subindex, request.payload.clone())
    }

    fn download_segment(&mut self, request: &SdoMessage) -> GatewayMessage {
        let key = (request.index, request.subindex);
        if request.offset == 0 {
            self.downloads.insert(key, Vec::new());
        }

        let Some(buffer) = self.downloads.get_mut(&key) else {
            warn!("Segment at offset {} without a transfer in progress", request.offset);
            return GatewayMessage::ack(ErrorCode::SdoInvalidWrite);
        };
        if request.offset as usize != buffer.len() {
            warn!("Segment offset {} does not follow {} received bytes", request.offset, buffer.len());
            self.downloads.remove(&key);
            return GatewayMessage::ack(ErrorCode::SdoInvalidWrite);
        }
        buffer.extend_from_slice(&request.payload);

        if !request.last {
            return GatewayMessage::ack(ErrorCode::Ok);
        }
        let data = self.downloads.remove(&key).unwrap_or_default();
        self.store(request.index, request.subindex, data)
    }

    fn store(&mut self, index: u16, subindex: u8, data: Vec<u8>) -> GatewayMessage {
        let len = data.len();
        match self.object_dict.write(index, subindex, data) {
            Ok(()) => {
                info!("Stored {} bytes to 0x{:04X}:{:02X}", len, index, subindex);
                GatewayMessage::ack(ErrorCode::Ok)
            }
            Err(code) => {
                warn!("Write to 0x{:04X}:{:02X} rejected: {}", index, subindex, code);
                GatewayMessage::ack(code)
            }
        }
    }

    fn raw_can(&mut self, cob_id: u32, payload: &[u8]) -> Vec<GatewayMessage> {
        if cob_id != NMT_COB_ID {
            debug!("CAN 0x{:03X} {:02X?}", cob_id, payload);
            return vec![GatewayMessage::ack(ErrorCode::Ok)];
        }

        let (Some(&command), Some(&target)) = (payload.first(), payload.get(1)) else {
            return vec![GatewayMessage::ack(ErrorCode::InvalidMessage)];
        };
        let addressed = target == 0 || target == self.node_id;

        match command {
            0x81 | 0x82 => {
                if addressed {
                    info!("NMT reset (0x{:02X})", command);
                    self.nmt_state = NmtState::PreOperational;
                    self.downloads.clear();
                    // Boot-up message
                    return vec![GatewayMessage::Can {
                        cob_id: HEARTBEAT_COB_ID + self.node_id as u32,
                        payload: vec![0x00],
                    }];
                }
                Vec::new()
            }
            0x01 | 0x02 | 0x80 => {
                if addressed {
                    self.nmt_state = match command {
                        0x01 => NmtState::Operational,
                        0x02 => NmtState::Stopped,
                        _ => NmtState::PreOperational,
                    };
                    info!("NMT state {:?}", self.nmt_state);
                }
                vec![GatewayMessage::ack(ErrorCode::Ok)]
            }
            _ => vec![GatewayMessage::ack(ErrorCode::InvalidCommand)],
        }
    }
}

/// Variable length objects above the segment size are uploaded in segments
fn needs_segments(payload_type: PayloadType, len: usize, segment_size: usize) -> bool {
    payload_type.width().is_none() && len > segment_size
}
