// End-to-end tests of the CANopen client against the mock gateway node
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dssp_gateway::{
    CanOpenGateway, ErrorCode, GatewayConfig, GatewayError, GatewayHandler, GatewayMessage, PayloadType, Value,
};
use mock_dssp_node::{serve, test_node, MockBus};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> GatewayConfig {
    GatewayConfig {
        response_timeout_ms: 50,
        retries: 1,
        request_timeout_ms: 2_000,
        ..GatewayConfig::default()
    }
}

fn connect_with(bus: MockBus, handler: Option<Arc<dyn GatewayHandler>>) -> CanOpenGateway {
    connect_configured(bus, &test_config(), handler)
}

fn connect_configured(bus: MockBus, config: &GatewayConfig, handler: Option<Arc<dyn GatewayHandler>>) -> CanOpenGateway {
    init_logging();
    let (host, device) = tokio::io::duplex(4096);
    tokio::spawn(serve(device, bus));
    CanOpenGateway::with_transport(host, config, handler)
}

fn connect(node_ids: &[u8]) -> CanOpenGateway {
    let mut bus = MockBus::new();
    for &node_id in node_ids {
        bus.add_node(test_node(node_id));
    }
    connect_with(bus, None)
}

#[derive(Default)]
struct Recorder {
    received: Mutex<Vec<GatewayMessage>>,
    confirmed: Mutex<Vec<ErrorCode>>,
}

impl GatewayHandler for Recorder {
    fn on_receive(&self, message: &GatewayMessage) {
        self.received.lock().unwrap().push(message.clone());
    }

    fn on_confirm(&self, code: ErrorCode) {
        self.confirmed.lock().unwrap().push(code);
    }
}

#[tokio::test]
async fn upload_heartbeat_time() {
    let gateway = connect(&[16]);

    let (value, last) = gateway.upload(16, 0x1017, 0, PayloadType::Uint16, 0).await.unwrap();
    assert_eq!(value, Value::U16(1000));
    assert!(last);

    let (name, _) = gateway.upload(16, 0x1008, 0, PayloadType::String, 0).await.unwrap();
    assert_eq!(name, Value::String("MockDsspNode".to_string()));
}

#[tokio::test]
async fn write_then_read_back() {
    let gateway = connect(&[16]);

    gateway.write(16, 0x1017, 0, &Value::U16(2500)).await.unwrap();
    let (value, _) = gateway.upload(16, 0x1017, 0, PayloadType::Uint16, 0).await.unwrap();
    assert_eq!(value, Value::U16(2500));
}

#[tokio::test]
async fn remote_errors_are_surfaced() {
    let gateway = connect(&[16]);

    let missing = gateway.upload(16, 0x6000, 0, PayloadType::Uint8, 0).await;
    assert!(matches!(missing, Err(GatewayError::Remote(ErrorCode::ObjectRead))));

    let read_only = gateway.write(16, 0x1000, 0, &Value::U32(7)).await;
    assert!(matches!(read_only, Err(GatewayError::Remote(ErrorCode::ObjectAccess))));

    let wrong_width = gateway.write(16, 0x1017, 0, &Value::U8(7)).await;
    assert!(matches!(wrong_width, Err(GatewayError::Remote(ErrorCode::ObjectRange))));

    // The link is still usable afterwards
    assert!(gateway.upload(16, 0x1017, 0, PayloadType::Uint16, 0).await.is_ok());
}

#[tokio::test]
async fn absent_node_times_out_after_retries() {
    let gateway = connect(&[16]);

    let result = gateway.upload(33, 0x1017, 0, PayloadType::Uint16, 0).await;
    assert!(matches!(result, Err(GatewayError::Timeout)));

    let stats = gateway.stats();
    assert_eq!(stats.tx_count, 1);
    assert_eq!(stats.retransmissions, 1);
    assert_eq!(stats.tx_ack, 0);
}

#[tokio::test]
async fn late_no_response_does_not_fail_the_next_request() {
    // The request gives up well before the session stops retransmitting
    let config = GatewayConfig {
        response_timeout_ms: 100,
        retries: 2,
        request_timeout_ms: 150,
        ..GatewayConfig::default()
    };
    let recorder = Arc::new(Recorder::default());
    let gateway = connect_configured(MockBus::from(test_node(16)), &config, Some(recorder.clone()));

    let result = gateway.upload(33, 0x1017, 0, PayloadType::Uint16, 0).await;
    assert!(matches!(result, Err(GatewayError::Timeout)));

    gateway.write(16, 0x1017, 0, &Value::U16(4242)).await.unwrap();
    let (value, _) = gateway.upload(16, 0x1017, 0, PayloadType::Uint16, 0).await.unwrap();
    assert_eq!(value, Value::U16(4242));

    assert_eq!(
        *recorder.confirmed.lock().unwrap(),
        vec![ErrorCode::NoResponse, ErrorCode::Ok]
    );
}

#[tokio::test]
async fn invalid_node_ids_are_rejected() {
    let gateway = connect(&[16]);

    assert!(matches!(
        gateway.upload(0, 0x1017, 0, PayloadType::Uint16, 0).await,
        Err(GatewayError::InvalidNode(0))
    ));
    assert!(matches!(gateway.add_node(128), Err(GatewayError::InvalidNode(128))));
    assert_eq!(gateway.stats().tx_count, 0);
}

#[tokio::test]
async fn domain_upload_follows_segments() {
    let gateway = connect(&[16]);

    let data = gateway.upload_domain(16, 0x1F50, 1).await.unwrap();
    assert_eq!(data, (0..100u8).collect::<Vec<_>>());

    // A single segment reports whether more data follows
    let (chunk, last) = gateway.upload(16, 0x1F50, 1, PayloadType::Domain, 32).await.unwrap();
    assert_eq!(chunk, Value::Domain((32..64u8).collect()));
    assert!(!last);
}

#[tokio::test]
async fn segmented_download_reconstructs_payload() {
    let gateway = connect(&[16]);

    let image: Vec<u8> = (0..70u8).rev().collect();
    gateway.download_domain(16, 0x1F50, 1, &image, 32).await.unwrap();
    assert_eq!(gateway.upload_domain(16, 0x1F50, 1).await.unwrap(), image);

    // Exact multiple of the chunk size ends with an empty closing segment
    let image: Vec<u8> = (0..64u8).map(|b| b ^ 0x5A).collect();
    gateway.download_domain(16, 0x1F50, 1, &image, 16).await.unwrap();
    assert_eq!(gateway.upload_domain(16, 0x1F50, 1).await.unwrap(), image);
}

#[tokio::test]
async fn manual_segments() {
    let gateway = connect(&[16]);

    gateway.download(16, 0x1F50, 1, PayloadType::Domain, b"abc", 0, false).await.unwrap();
    gateway.download(16, 0x1F50, 1, PayloadType::Domain, b"def", 3, true).await.unwrap();
    assert_eq!(gateway.upload_domain(16, 0x1F50, 1).await.unwrap(), b"abcdef".to_vec());

    // A gap in the offsets is refused
    gateway.download(16, 0x1F50, 1, PayloadType::Domain, b"xy", 0, false).await.unwrap();
    let gap = gateway.download(16, 0x1F50, 1, PayloadType::Domain, b"z", 5, true).await;
    assert!(matches!(gap, Err(GatewayError::Remote(ErrorCode::SdoInvalidWrite))));
}

#[tokio::test]
async fn stopped_node_stops_answering() {
    let gateway = connect(&[16]);

    gateway.stop(16).await.unwrap();
    let result = gateway.upload(16, 0x1017, 0, PayloadType::Uint16, 0).await;
    assert!(matches!(result, Err(GatewayError::Timeout)));

    gateway.start(16).await.unwrap();
    assert!(gateway.upload(16, 0x1017, 0, PayloadType::Uint16, 0).await.is_ok());

    gateway.preop(16).await.unwrap();
    gateway.heartbeat(16).await.unwrap();
}

#[tokio::test]
async fn reset_is_fire_and_forget() {
    let recorder = Arc::new(Recorder::default());
    let gateway = connect_with(MockBus::from(test_node(16)), Some(recorder.clone()));

    gateway.reset_node(16).await.unwrap();

    // The next request waits until the reset frame is settled
    let (value, _) = gateway.upload(16, 0x1017, 0, PayloadType::Uint16, 0).await.unwrap();
    assert_eq!(value, Value::U16(1000));

    let received = recorder.received.lock().unwrap().clone();
    assert!(received.contains(&GatewayMessage::Can { cob_id: 0x710, payload: vec![0x00] }));
    assert!(recorder.confirmed.lock().unwrap().contains(&ErrorCode::NoResponse));
}

#[tokio::test]
async fn user_handler_sees_confirmations() {
    let recorder = Arc::new(Recorder::default());
    let gateway = connect_with(MockBus::from(test_node(16)), Some(recorder.clone()));

    gateway.write(16, 0x2003, 1, &Value::U16(0x0006)).await.unwrap();
    gateway.upload(16, 0x2003, 1, PayloadType::Uint16, 0).await.unwrap();

    assert_eq!(*recorder.confirmed.lock().unwrap(), vec![ErrorCode::Ok]);
    let received = recorder.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert!(matches!(&received[0], GatewayMessage::Sdo(sdo) if sdo.payload == vec![0x06, 0x00]));
}

#[tokio::test]
async fn scan_finds_present_nodes() {
    let gateway = connect(&[2, 5, 9]);

    let found = gateway.scan(12).await;
    assert_eq!(found, BTreeSet::from([2, 5, 9]));
    assert_eq!(gateway.session().response_timeout(), Duration::from_millis(50));

    gateway.reset_scan();
    assert!(gateway.scanned_nodes().is_empty());

    // Regular traffic records nodes too
    gateway.upload(5, 0x1017, 0, PayloadType::Uint16, 0).await.unwrap();
    assert_eq!(gateway.scanned_nodes(), BTreeSet::from([5]));
}

#[tokio::test]
async fn cancelled_scan_restores_response_timeout() {
    let gateway = connect(&[16]);

    let cancelled = tokio::time::timeout(Duration::from_millis(5), gateway.scan(127)).await;
    assert!(cancelled.is_err());
    assert_eq!(gateway.session().response_timeout(), Duration::from_millis(50));

    // Let the frame the scan left on the wire run out of retries
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(gateway.upload(16, 0x1017, 0, PayloadType::Uint16, 0).await.is_ok());
}

#[tokio::test]
async fn node_handle_reads_and_writes() {
    let gateway = connect(&[4]);
    let node = gateway.add_node(4).unwrap();
    assert_eq!(node.node_id(), 4);

    let other = node.clone();
    other.write(0x1017, 0, &Value::U16(250)).await.unwrap();
    assert_eq!(node.read(0x1017, 0, PayloadType::Uint16).await.unwrap(), Value::U16(250));

    node.write_domain(0x1F50, 1, &[9; 40], 32).await.unwrap();
    assert_eq!(node.read_domain(0x1F50, 1).await.unwrap(), vec![9; 40]);
}

#[tokio::test]
async fn closed_gateway_refuses_requests() {
    let gateway = connect(&[16]);
    gateway.close().await;

    let result = gateway.upload(16, 0x1017, 0, PayloadType::Uint16, 0).await;
    assert!(matches!(result, Err(GatewayError::Closed)));
}

#[tokio::test]
async fn raw_post_keeps_requests_in_order() {
    let recorder = Arc::new(Recorder::default());
    let gateway = connect_with(MockBus::from(test_node(16)), Some(recorder.clone()));

    gateway
        .post(GatewayMessage::Can { cob_id: 0x201, payload: vec![1, 2, 3] })
        .await
        .unwrap();
    gateway.write(16, 0x1017, 0, &Value::U16(100)).await.unwrap();

    assert_eq!(*recorder.confirmed.lock().unwrap(), vec![ErrorCode::Ok, ErrorCode::Ok]);
    assert_eq!(gateway.stats().tx_ack, 2);
}
