// connect.rs
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dssp_common::{
    parse_payload, ErrorCode, GatewayMessage, PayloadType, SdoMessage, Value,
};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::session::{GatewayHandler, GatewaySession, SessionOptions, SessionStats};

/// Object read by the node scanner (device type)
const SCAN_INDEX: u16 = 0x1000;
const SCAN_SUBINDEX: u8 = 0;
/// Extra wait for a confirmation on top of the session's retransmissions
const CONFIRM_GRACE: Duration = Duration::from_millis(50);

/// COB-ID of NMT commands
const NMT_COB_ID: u32 = 0x000;
/// Base COB-ID of heartbeat messages
const HEARTBEAT_COB_ID: u32 = 0x700;

/// NMT command specifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    Start = 0x01,
    Stop = 0x02,
    PreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

impl NmtCommand {
    /// Resets are not acknowledged by a node that is restarting
    fn is_reset(self) -> bool {
        matches!(self, Self::ResetNode | Self::ResetCommunication)
    }
}

fn check_node(node_id: u8) -> Result<(), GatewayError> {
    if (1..=127).contains(&node_id) {
        Ok(())
    } else {
        Err(GatewayError::InvalidNode(node_id))
    }
}

/// The request currently on the wire
struct PendingRequest {
    /// `(node, index, subindex)` an upload response must match
    expected: Option<(u8, u16, u8)>,
    confirm: Option<oneshot::Sender<ErrorCode>>,
    response: Option<oneshot::Sender<SdoMessage>>,
}

/// Handler side of the client, shared with the session tasks
struct ClientState {
    pending: Mutex<Option<PendingRequest>>,
    scanned: Mutex<BTreeSet<u8>>,
    user: Option<Arc<dyn GatewayHandler>>,
}

impl ClientState {
    fn arm(&self, request: PendingRequest) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(request);
        }
    }

    fn disarm(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = None;
        }
    }
}

impl GatewayHandler for ClientState {
    fn on_receive(&self, message: &GatewayMessage) {
        // The user sees the message before a waiting request resumes
        if let Some(user) = &self.user {
            user.on_receive(message);
        }

        if let GatewayMessage::Sdo(sdo) = message {
            if let Ok(mut scanned) = self.scanned.lock() {
                scanned.insert(sdo.node);
            }

            if sdo.command.is_upload_response() {
                if let Ok(mut pending) = self.pending.lock() {
                    if let Some(request) = pending.as_mut() {
                        if request.expected == Some((sdo.node, sdo.index, sdo.subindex)) {
                            if let Some(confirm) = request.confirm.take() {
                                let _ = confirm.send(ErrorCode::Ok);
                            }
                            if let Some(response) = request.response.take() {
                                let _ = response.send(sdo.clone());
                            }
                        } else {
                            debug!(
                                "Ignoring upload response from node {} for 0x{:04X}:{:02X}",
                                sdo.node, sdo.index, sdo.subindex
                            );
                        }
                    }
                }
            }
        }
    }

    fn on_confirm(&self, code: ErrorCode) {
        if let Some(user) = &self.user {
            user.on_confirm(code);
        }

        if let Ok(mut pending) = self.pending.lock() {
            if let Some(request) = pending.as_mut() {
                if let Some(confirm) = request.confirm.take() {
                    let _ = confirm.send(code);
                }
            }
        }
    }
}

/// Clears the pending request when dropped
struct Disarm(Arc<ClientState>);

impl Drop for Disarm {
    fn drop(&mut self) {
        self.0.disarm();
    }
}

/// A request holding the wire until its outcome is known
struct InFlight {
    // Disarm before the wire is handed to the next request
    _disarm: Disarm,
    _guard: OwnedMutexGuard<()>,
    confirm: oneshot::Receiver<ErrorCode>,
    response: Option<oneshot::Receiver<SdoMessage>>,
    /// Longest the session may still spend retransmitting the frame
    settle: Duration,
}

impl InFlight {
    /// Wait for the acknowledgement, and the response if one was requested
    async fn finish(mut self, timeout: Duration) -> Result<Option<SdoMessage>, GatewayError> {
        let deadline = Instant::now() + timeout;

        let outcome = tokio::time::timeout_at(deadline, &mut self.confirm).await;
        let code = match outcome {
            Ok(Ok(code)) => code,
            Ok(Err(_)) => return Err(GatewayError::Closed),
            Err(_) => {
                self.settle_in_background();
                return Err(GatewayError::Timeout);
            }
        };
        GatewayError::check(code)?;

        let Some(response) = self.response else {
            return Ok(None);
        };
        match tokio::time::timeout_at(deadline, response).await {
            Ok(Ok(sdo)) => Ok(Some(sdo)),
            Ok(Err(_)) => Err(GatewayError::Closed),
            Err(_) => Err(GatewayError::Timeout),
        }
    }

    /// Keep the wire reserved until the session has given up on the frame,
    /// so its late outcome cannot complete the next request
    fn settle_in_background(mut self) {
        tokio::spawn(async move {
            match tokio::time::timeout(self.settle, &mut self.confirm).await {
                Ok(Ok(code)) => debug!("Confirmation after the request timed out: {}", code),
                Ok(Err(_)) => {}
                Err(_) => warn!("Frame still unconfirmed {:?} after its request timed out", self.settle),
            }
        });
    }
}

/// Puts the regular response timeout back when a scan ends or is cancelled
struct RestoreTimeout<'a> {
    session: &'a GatewaySession,
    timeout: Duration,
}

impl Drop for RestoreTimeout<'_> {
    fn drop(&mut self) {
        self.session.set_response_timeout(self.timeout);
    }
}

struct GatewayInner {
    session: GatewaySession,
    state: Arc<ClientState>,
    request_lock: Arc<AsyncMutex<()>>,
    request_timeout: Duration,
    scan_timeout: Duration,
    local_node_id: u8,
}

/// CANopen client on top of a DSSP gateway session.
///
/// Requests are serialized: one upload/download/NMT command is outstanding at
/// a time, matching the single unacknowledged frame allowed on the wire.
#[derive(Clone)]
pub struct CanOpenGateway {
    inner: Arc<GatewayInner>,
}

impl CanOpenGateway {
    /// Open the serial port named in the configuration
    pub fn open(config: &GatewayConfig) -> Result<Self, GatewayError> {
        Self::open_with_handler(config, None)
    }

    /// Like [`open`](Self::open), forwarding every indication and confirmation
    /// to `handler` as well
    pub fn open_with_handler(
        config: &GatewayConfig,
        handler: Option<Arc<dyn GatewayHandler>>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let state = Self::client_state(handler);
        let session = GatewaySession::open_serial(
            &config.port,
            config.baud_rate,
            SessionOptions::from(config),
            state.clone(),
        )?;
        Ok(Self::from_session(session, state, config))
    }

    /// Run the client over an arbitrary byte stream
    pub fn with_transport<T>(io: T, config: &GatewayConfig, handler: Option<Arc<dyn GatewayHandler>>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let state = Self::client_state(handler);
        let session = GatewaySession::new(io, SessionOptions::from(config), state.clone());
        Self::from_session(session, state, config)
    }

    fn client_state(user: Option<Arc<dyn GatewayHandler>>) -> Arc<ClientState> {
        Arc::new(ClientState {
            pending: Mutex::new(None),
            scanned: Mutex::new(BTreeSet::new()),
            user,
        })
    }

    fn from_session(session: GatewaySession, state: Arc<ClientState>, config: &GatewayConfig) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                session,
                state,
                request_lock: Arc::new(AsyncMutex::new(())),
                request_timeout: config.request_timeout(),
                scan_timeout: config.scan_timeout(),
                local_node_id: config.local_node_id,
            }),
        }
    }

    /// Get a handle bound to one node
    pub fn add_node(&self, node_id: u8) -> Result<NodeHandle, GatewayError> {
        check_node(node_id)?;
        Ok(NodeHandle {
            node_id,
            gateway: self.clone(),
        })
    }

    /// Post a raw message without waiting for its outcome.
    ///
    /// The message still queues behind any request in progress.
    pub async fn post(&self, message: GatewayMessage) -> Result<(), GatewayError> {
        self.fire_and_forget(message).await
    }

    pub fn session(&self) -> &GatewaySession {
        &self.inner.session
    }

    pub fn stats(&self) -> SessionStats {
        self.inner.session.stats()
    }

    pub async fn close(&self) {
        self.inner.session.close().await;
    }

    /// Take the wire, arm the pending request and post `message`
    async fn begin(&self, message: GatewayMessage, expect_response: bool) -> Result<InFlight, GatewayError> {
        let guard = self.inner.request_lock.clone().lock_owned().await;

        let expected = match &message {
            GatewayMessage::Sdo(sdo) if expect_response => Some((sdo.node, sdo.index, sdo.subindex)),
            _ => None,
        };
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (response_tx, response_rx) = if expect_response {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.inner.state.arm(PendingRequest {
            expected,
            confirm: Some(confirm_tx),
            response: response_tx,
        });
        let session = &self.inner.session;
        let in_flight = InFlight {
            _disarm: Disarm(self.inner.state.clone()),
            _guard: guard,
            confirm: confirm_rx,
            response: response_rx,
            settle: session.response_timeout() * (session.retries() + 1) + CONFIRM_GRACE,
        };

        self.inner.session.post(&message)?;
        Ok(in_flight)
    }

    async fn transact(
        &self,
        message: GatewayMessage,
        expect_response: bool,
        timeout: Duration,
    ) -> Result<Option<SdoMessage>, GatewayError> {
        self.begin(message, expect_response).await?.finish(timeout).await
    }

    /// Post without waiting; the wire stays reserved until the outcome is in
    async fn fire_and_forget(&self, message: GatewayMessage) -> Result<(), GatewayError> {
        let in_flight = self.begin(message, false).await?;
        let timeout = self.inner.request_timeout;
        tokio::spawn(async move {
            if let Err(e) = in_flight.finish(timeout).await {
                debug!("Unconfirmed command: {}", e);
            }
        });
        Ok(())
    }

    async fn upload_with_timeout(
        &self,
        node_id: u8,
        index: u16,
        subindex: u8,
        payload_type: PayloadType,
        offset: u32,
        timeout: Duration,
    ) -> Result<(Value, bool), GatewayError> {
        check_node(node_id)?;
        let request = SdoMessage::upload(node_id, index, subindex, payload_type, offset);
        let response = self
            .transact(request.into(), true, timeout)
            .await?
            .ok_or_else(|| GatewayError::UnexpectedResponse("no upload response".to_string()))?;

        let value = parse_payload(&response.payload, payload_type)?;
        let last = payload_type != PayloadType::Domain || response.last;
        Ok((value, last))
    }

    /// Read `index:subindex` from a node.
    ///
    /// Returns the decoded value and, for domain transfers, whether this was
    /// the last segment. Continue a domain read at `offset + chunk length`
    /// until `last` is true.
    pub async fn upload(
        &self,
        node_id: u8,
        index: u16,
        subindex: u8,
        payload_type: PayloadType,
        offset: u32,
    ) -> Result<(Value, bool), GatewayError> {
        self.upload_with_timeout(node_id, index, subindex, payload_type, offset, self.inner.request_timeout)
            .await
    }

    /// Read a complete domain object, following segments until the last one
    pub async fn upload_domain(&self, node_id: u8, index: u16, subindex: u8) -> Result<Vec<u8>, GatewayError> {
        let mut data = Vec::new();
        loop {
            let offset = u32::try_from(data.len())
                .map_err(|_| GatewayError::UnexpectedResponse("domain too large".to_string()))?;
            let (value, last) = self.upload(node_id, index, subindex, PayloadType::Domain, offset).await?;
            let Value::Domain(chunk) = value else {
                return Err(GatewayError::UnexpectedResponse("domain upload returned a scalar".to_string()));
            };
            if chunk.is_empty() && !last {
                return Err(GatewayError::UnexpectedResponse("empty segment before the last".to_string()));
            }
            data.extend_from_slice(&chunk);
            if last {
                return Ok(data);
            }
        }
    }

    /// Write `payload` to `index:subindex`.
    ///
    /// A single transfer is used when `offset == 0 && last`, otherwise the
    /// payload is sent as one segment of a larger write.
    #[allow(clippy::too_many_arguments)]
    pub async fn download(
        &self,
        node_id: u8,
        index: u16,
        subindex: u8,
        payload_type: PayloadType,
        payload: &[u8],
        offset: u32,
        last: bool,
    ) -> Result<(), GatewayError> {
        check_node(node_id)?;
        let request = SdoMessage::download(node_id, index, subindex, payload_type, payload.to_vec(), offset, last);
        self.transact(request.into(), false, self.inner.request_timeout).await?;
        Ok(())
    }

    /// Write a typed value in a single transfer
    pub async fn write(&self, node_id: u8, index: u16, subindex: u8, value: &Value) -> Result<(), GatewayError> {
        self.download(node_id, index, subindex, value.payload_type(), &value.to_bytes(), 0, true)
            .await
    }

    /// Write a domain object in `chunk_size` segments.
    ///
    /// Every chunk but the last is sent with `last = false`; the closing
    /// segment carries `last = true` and is empty when the data divides
    /// evenly into chunks.
    pub async fn download_domain(
        &self,
        node_id: u8,
        index: u16,
        subindex: u8,
        data: &[u8],
        chunk_size: usize,
    ) -> Result<(), GatewayError> {
        if chunk_size == 0 {
            return Err(GatewayError::Config("chunk size must be greater than zero".to_string()));
        }
        if data.len() <= chunk_size {
            return self.download(node_id, index, subindex, PayloadType::Domain, data, 0, true).await;
        }

        let mut offset = 0usize;
        let mut chunks = data.chunks(chunk_size).peekable();
        while let Some(chunk) = chunks.next() {
            // A short chunk can close the transfer by itself
            let last = chunks.peek().is_none() && chunk.len() < chunk_size;
            self.download(node_id, index, subindex, PayloadType::Domain, chunk, offset as u32, last)
                .await?;
            offset += chunk.len();
        }
        if data.len() % chunk_size == 0 {
            self.download(node_id, index, subindex, PayloadType::Domain, &[], offset as u32, true)
                .await?;
        }
        Ok(())
    }

    /// Send an NMT command to a node.
    ///
    /// Start, stop and pre-operational wait for the acknowledgement; resets are
    /// posted without waiting since the node may restart before answering.
    pub async fn nmt(&self, node_id: u8, command: NmtCommand) -> Result<(), GatewayError> {
        let message = GatewayMessage::Can {
            cob_id: NMT_COB_ID,
            payload: vec![command as u8, node_id],
        };
        info!("NMT {:?} -> node {}", command, node_id);

        if command.is_reset() {
            self.fire_and_forget(message).await
        } else {
            self.transact(message, false, self.inner.request_timeout).await?;
            Ok(())
        }
    }

    pub async fn start(&self, node_id: u8) -> Result<(), GatewayError> {
        self.nmt(node_id, NmtCommand::Start).await
    }

    pub async fn stop(&self, node_id: u8) -> Result<(), GatewayError> {
        self.nmt(node_id, NmtCommand::Stop).await
    }

    pub async fn preop(&self, node_id: u8) -> Result<(), GatewayError> {
        self.nmt(node_id, NmtCommand::PreOperational).await
    }

    pub async fn reset_node(&self, node_id: u8) -> Result<(), GatewayError> {
        self.nmt(node_id, NmtCommand::ResetNode).await
    }

    pub async fn reset_comm(&self, node_id: u8) -> Result<(), GatewayError> {
        self.nmt(node_id, NmtCommand::ResetCommunication).await
    }

    /// Send a heartbeat from the local node id carrying `node_id`
    pub async fn heartbeat(&self, node_id: u8) -> Result<(), GatewayError> {
        let message = GatewayMessage::Can {
            cob_id: HEARTBEAT_COB_ID + self.inner.local_node_id as u32,
            payload: vec![node_id],
        };
        self.transact(message, false, self.inner.request_timeout).await?;
        Ok(())
    }

    /// Read the device type of node ids `1..=limit` and return every node
    /// that has answered.
    ///
    /// The response timeout is shortened for the duration of the scan, so
    /// absent nodes cost only a few milliseconds each. Nodes answering after
    /// their read timed out are still recorded.
    pub async fn scan(&self, limit: u8) -> BTreeSet<u8> {
        let session = &self.inner.session;
        let _restore = RestoreTimeout {
            session,
            timeout: session.response_timeout(),
        };
        session.set_response_timeout(self.inner.scan_timeout);
        let read_timeout = self.inner.scan_timeout * (session.retries() + 1) + CONFIRM_GRACE;

        for node_id in 1..=limit.min(127) {
            let result = self
                .upload_with_timeout(node_id, SCAN_INDEX, SCAN_SUBINDEX, PayloadType::Uint32, 0, read_timeout)
                .await;
            match result {
                Ok(_) => debug!("Node {} answered scan", node_id),
                Err(GatewayError::Timeout) | Err(GatewayError::Remote(_)) | Err(GatewayError::Payload(_)) => {}
                Err(e) => {
                    warn!("Scan stopped at node {}: {}", node_id, e);
                    break;
                }
            }
        }

        self.scanned_nodes()
    }

    /// Nodes seen since the last [`reset_scan`](Self::reset_scan)
    pub fn scanned_nodes(&self) -> BTreeSet<u8> {
        self.inner
            .state
            .scanned
            .lock()
            .map(|nodes| nodes.clone())
            .unwrap_or_default()
    }

    pub fn reset_scan(&self) {
        if let Ok(mut nodes) = self.inner.state.scanned.lock() {
            nodes.clear();
        }
    }
}

/// Handle for communicating with a specific node
#[derive(Clone)]
pub struct NodeHandle {
    node_id: u8,
    gateway: CanOpenGateway,
}

impl NodeHandle {
    /// Get the node ID for this handle
    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub async fn read(&self, index: u16, subindex: u8, payload_type: PayloadType) -> Result<Value, GatewayError> {
        let (value, _) = self.gateway.upload(self.node_id, index, subindex, payload_type, 0).await?;
        Ok(value)
    }

    pub async fn write(&self, index: u16, subindex: u8, value: &Value) -> Result<(), GatewayError> {
        self.gateway.write(self.node_id, index, subindex, value).await
    }

    pub async fn read_domain(&self, index: u16, subindex: u8) -> Result<Vec<u8>, GatewayError> {
        self.gateway.upload_domain(self.node_id, index, subindex).await
    }

    pub async fn write_domain(&self, index: u16, subindex: u8, data: &[u8], chunk_size: usize) -> Result<(), GatewayError> {
        self.gateway.download_domain(self.node_id, index, subindex, data, chunk_size).await
    }

    pub async fn nmt(&self, command: NmtCommand) -> Result<(), GatewayError> {
        self.gateway.nmt(self.node_id, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmt_specifiers() {
        assert_eq!(NmtCommand::Start as u8, 0x01);
        assert_eq!(NmtCommand::Stop as u8, 0x02);
        assert_eq!(NmtCommand::PreOperational as u8, 0x80);
        assert_eq!(NmtCommand::ResetNode as u8, 0x81);
        assert_eq!(NmtCommand::ResetCommunication as u8, 0x82);
        assert!(NmtCommand::ResetNode.is_reset());
        assert!(!NmtCommand::Stop.is_reset());
    }

    #[test]
    fn node_range() {
        assert!(check_node(1).is_ok());
        assert!(check_node(127).is_ok());
        assert!(matches!(check_node(0), Err(GatewayError::InvalidNode(0))));
        assert!(matches!(check_node(128), Err(GatewayError::InvalidNode(128))));
    }

    #[test]
    fn upload_response_completes_matching_request_only() {
        let state = CanOpenGateway::client_state(None);
        let (confirm_tx, mut confirm_rx) = oneshot::channel();
        let (response_tx, mut response_rx) = oneshot::channel();
        state.arm(PendingRequest {
            expected: Some((4, 0x1000, 0)),
            confirm: Some(confirm_tx),
            response: Some(response_tx),
        });

        let mut other = SdoMessage::upload(5, 0x1000, 0, PayloadType::Uint32, 0);
        other.command = dssp_common::SdoCommand::UploadResponse;
        state.on_receive(&other.clone().into());
        assert!(confirm_rx.try_recv().is_err());

        let mut matching = other;
        matching.node = 4;
        state.on_receive(&matching.clone().into());
        assert_eq!(confirm_rx.try_recv().unwrap(), ErrorCode::Ok);
        assert_eq!(response_rx.try_recv().unwrap(), matching);

        let scanned = state.scanned.lock().unwrap().clone();
        assert_eq!(scanned.into_iter().collect::<Vec<_>>(), vec![4, 5]);
    }
}
