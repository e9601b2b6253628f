//! DSSP link serving one or more simulated nodes over a byte stream

use std::io;

use dssp_common::{framer, FrameDecoder, GatewayMessage, TransportCodec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::sdo_server::SdoServer;

/// Nodes reachable behind the simulated gateway
#[derive(Default)]
pub struct MockBus {
    nodes: Vec<SdoServer>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, node: SdoServer) -> Self {
        self.add_node(node);
        self
    }

    pub fn add_node(&mut self, node: SdoServer) {
        self.nodes.retain(|existing| existing.node_id() != node.node_id());
        self.nodes.push(node);
    }

    pub fn node_ids(&self) -> Vec<u8> {
        self.nodes.iter().map(SdoServer::node_id).collect()
    }

    /// Pass a host message to every node.
    ///
    /// Raw CAN frames reach all nodes but are acknowledged once.
    pub fn handle(&mut self, message: &GatewayMessage) -> Vec<GatewayMessage> {
        let mut replies = Vec::new();
        let mut acked = false;
        for node in &mut self.nodes {
            for reply in node.handle(message) {
                if matches!(reply, GatewayMessage::Ack { .. }) && matches!(message, GatewayMessage::Can { .. }) {
                    if acked {
                        continue;
                    }
                    acked = true;
                }
                replies.push(reply);
            }
        }
        replies
    }
}

impl From<SdoServer> for MockBus {
    fn from(node: SdoServer) -> Self {
        Self::new().with_node(node)
    }
}

/// Serve the bus until the host closes the stream
pub async fn serve<T>(mut io: T, bus: impl Into<MockBus>) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut bus = bus.into();
    let codec = TransportCodec::device();
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 256];

    info!("Serving nodes {:?}", bus.node_ids());
    loop {
        let n = io.read(&mut buf).await?;
        if n == 0 {
            info!("Host closed the link");
            return Ok(());
        }

        for frame in decoder.process(&buf[..n]) {
            let Some(message) = codec.decode(&frame) else {
                debug!("Dropping undecodable frame {:02X?}", frame);
                continue;
            };
            debug!("<- {:?}", message);

            for reply in bus.handle(&message) {
                debug!("-> {:?}", reply);
                io.write_all(&framer::encode(&codec.encode(&reply))).await?;
            }
            io.flush().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_dictionary::ObjectDictionary;
    use dssp_common::{ErrorCode, PayloadType, SdoMessage};

    fn node(node_id: u8) -> SdoServer {
        let mut od = ObjectDictionary::new();
        od.add_test_objects();
        SdoServer::new(node_id, od)
    }

    #[test]
    fn raw_can_is_acknowledged_once() {
        let mut bus = MockBus::new().with_node(node(2)).with_node(node(3));
        let replies = bus.handle(&GatewayMessage::Can { cob_id: 0, payload: vec![0x01, 0] });
        assert_eq!(replies, vec![GatewayMessage::ack(ErrorCode::Ok)]);
    }

    #[test]
    fn sdo_reaches_addressed_node_only() {
        let mut bus = MockBus::new().with_node(node(2)).with_node(node(3));
        let replies = bus.handle(&SdoMessage::upload(3, 0x1017, 0, PayloadType::Uint16, 0).into());
        assert_eq!(replies.len(), 1);
        assert!(matches!(&replies[0], GatewayMessage::Sdo(sdo) if sdo.node == 3));
        assert!(bus.handle(&SdoMessage::upload(9, 0x1017, 0, PayloadType::Uint16, 0).into()).is_empty());
    }

    #[tokio::test]
    async fn answers_framed_requests() {
        let (mut host, device) = tokio::io::duplex(1024);
        let server = tokio::spawn(serve(device, node(16)));

        let codec = TransportCodec::new();
        let request = codec.encode(&SdoMessage::upload(16, 0x1017, 0, PayloadType::Uint16, 0).into());
        assert_eq!(request, vec![0x10, 0x10, 0x02, 0x17, 0x10, 0x00, 0x06]);
        codec.set_response_type(PayloadType::Uint16);
        host.write_all(&framer::encode(&request)).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 64];
        let frames = loop {
            let n = host.read(&mut buf).await.unwrap();
            let frames = decoder.process(&buf[..n]);
            if !frames.is_empty() {
                break frames;
            }
        };
        match codec.decode(&frames[0]) {
            Some(GatewayMessage::Sdo(sdo)) => {
                assert_eq!(sdo.payload, vec![0xE8, 0x03]);
                assert_eq!(sdo.payload_type, PayloadType::Uint16);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        drop(host);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn can_replies_carry_the_trailer() {
        let (mut host, device) = tokio::io::duplex(1024);
        let server = tokio::spawn(serve(device, node(16)));

        let reset = GatewayMessage::Can { cob_id: 0, payload: vec![0x81, 16] };
        host.write_all(&framer::encode(&TransportCodec::new().encode(&reset))).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 64];
        let frame = loop {
            let n = host.read(&mut buf).await.unwrap();
            if let Some(frame) = decoder.process(&buf[..n]).into_iter().next() {
                break frame;
            }
        };
        let crc = framer::crc16(framer::CRC16_INITIAL, &[0x00]).to_le_bytes();
        assert_eq!(frame, vec![0x10, 0x80, 0x10, 0x07, 0x00, 0x00, 0x00, crc[0], crc[1]]);
        assert_eq!(
            TransportCodec::new().decode(&frame),
            Some(GatewayMessage::Can { cob_id: 0x710, payload: vec![0x00] })
        );

        drop(host);
        server.await.unwrap().unwrap();
    }
}
