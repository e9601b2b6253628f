// session.rs - DSSP gateway session over a half-duplex byte stream
//
// One receive task and one transmit task share the session state. The
// transmit task keeps at most one frame unacknowledged on the wire: after
// writing a frame it waits on the ack permit, which the receive task releases
// when an Ack or an upload response arrives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, trace, warn};

use dssp_common::{framer, ErrorCode, FrameDecoder, GatewayMessage, PayloadType, TransportCodec};

use crate::config::GatewayConfig;
use crate::error::GatewayError;

const READ_CHUNK: usize = 256;
const IO_RETRY_DELAY: Duration = Duration::from_millis(10);

/// A framed message waiting for the wire, with the payload type its upload
/// response will be decoded as
type Outgoing = (Vec<u8>, Option<PayloadType>);

/// Receive indication and transmit confirmation hooks of a session.
///
/// Both are called from the receive or transmit task, so they should return
/// quickly and must not block on the session themselves.
pub trait GatewayHandler: Send + Sync {
    /// A non-Ack message arrived
    fn on_receive(&self, _message: &GatewayMessage) {}

    /// The outcome of the frame on the wire: the code of an Ack, or
    /// [`ErrorCode::NoResponse`] once all retries went unanswered
    fn on_confirm(&self, _code: ErrorCode) {}
}

/// Handler that ignores everything
pub struct NoopHandler;

impl GatewayHandler for NoopHandler {}

/// Timing of the acknowledge discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub response_timeout: Duration,
    pub retries: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(3),
            retries: 2,
        }
    }
}

impl From<&GatewayConfig> for SessionOptions {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            response_timeout: config.response_timeout(),
            retries: config.retries,
        }
    }
}

/// Snapshot of the session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Distinct frames put on the wire
    pub tx_count: u64,
    /// Acknowledgements received
    pub tx_ack: u64,
    /// Non-Ack messages received
    pub rx_count: u64,
    pub retransmissions: u64,
}

/// One-at-a-time gate over the wire
struct AckPermit {
    semaphore: Semaphore,
}

impl AckPermit {
    fn new() -> Self {
        Self {
            semaphore: Semaphore::new(0),
        }
    }

    /// Drop any stale release before a new frame goes out
    fn arm(&self) {
        while let Ok(permit) = self.semaphore.try_acquire() {
            permit.forget();
        }
    }

    fn release(&self) {
        if self.semaphore.available_permits() == 0 {
            self.semaphore.add_permits(1);
        }
    }

    async fn wait(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                true
            }
            _ => false,
        }
    }
}

struct Shared {
    codec: TransportCodec,
    permit: AckPermit,
    tx_count: AtomicU64,
    tx_ack: AtomicU64,
    rx_count: AtomicU64,
    retransmissions: AtomicU64,
    last_received: Mutex<Option<GatewayMessage>>,
    response_timeout_us: AtomicU64,
    retries: u32,
    handler: Arc<dyn GatewayHandler>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn response_timeout(&self) -> Duration {
        Duration::from_micros(self.response_timeout_us.load(Ordering::Relaxed))
    }

    fn dispatch(&self, frame: &[u8]) {
        let Some(message) = self.codec.decode(frame) else {
            debug!("Ignoring frame that is not a gateway message: {:02X?}", frame);
            return;
        };
        trace!("Received {:?}", message);

        if message.releases_permit() {
            self.permit.release();
        }

        match message {
            GatewayMessage::Ack { error_code } => {
                self.tx_ack.fetch_add(1, Ordering::Relaxed);
                self.handler.on_confirm(ErrorCode::from_code(error_code));
            }
            message => {
                self.rx_count.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut slot) = self.last_received.lock() {
                    *slot = Some(message.clone());
                }
                self.handler.on_receive(&message);
            }
        }
    }
}

/// Errors after which the byte stream cannot recover
fn is_fatal(error: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

/// A gateway session: framing, acknowledge, retry and dispatch over one byte
/// stream.
pub struct GatewaySession {
    shared: Arc<Shared>,
    tx_queue: mpsc::UnboundedSender<Outgoing>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewaySession {
    /// Start a session over an already open byte stream.
    ///
    /// Must be called from within a tokio runtime; the receive and transmit
    /// loops are spawned onto it.
    pub fn new<T>(io: T, options: SessionOptions, handler: Arc<dyn GatewayHandler>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            codec: TransportCodec::new(),
            permit: AckPermit::new(),
            tx_count: AtomicU64::new(0),
            tx_ack: AtomicU64::new(0),
            rx_count: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            last_received: Mutex::new(None),
            response_timeout_us: AtomicU64::new(options.response_timeout.as_micros() as u64),
            retries: options.retries,
            handler,
            shutdown,
        });

        let (reader, writer) = tokio::io::split(io);
        let (tx_queue, queue_rx) = mpsc::unbounded_channel();

        let receive_task = tokio::spawn(receive_loop(reader, shared.clone()));
        let transmit_task = tokio::spawn(transmit_loop(writer, queue_rx, shared.clone()));

        Self {
            shared,
            tx_queue,
            tasks: Mutex::new(vec![receive_task, transmit_task]),
        }
    }

    /// Open a serial port and start a session on it
    pub fn open_serial(
        port: &str,
        baud_rate: u32,
        options: SessionOptions,
        handler: Arc<dyn GatewayHandler>,
    ) -> Result<Self, GatewayError> {
        let stream = tokio_serial::new(port, baud_rate)
            .open_native_async()
            .map_err(|source| GatewayError::Open {
                port: port.to_string(),
                source,
            })?;
        info!("Opened DSSP gateway on {} at {} baud", port, baud_rate);
        Ok(Self::new(stream, options, handler))
    }

    /// Queue a message for transmission.
    ///
    /// Returns once the frame is queued; the outcome is reported through
    /// [`GatewayHandler::on_confirm`].
    pub fn post(&self, message: &GatewayMessage) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        let frame = framer::encode(&self.shared.codec.encode(message));
        trace!("Posting {:?} as {} byte frame", message, frame.len());
        self.tx_queue
            .send((frame, message.response_type()))
            .map_err(|_| GatewayError::Closed)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            tx_count: self.shared.tx_count.load(Ordering::Relaxed),
            tx_ack: self.shared.tx_ack.load(Ordering::Relaxed),
            rx_count: self.shared.rx_count.load(Ordering::Relaxed),
            retransmissions: self.shared.retransmissions.load(Ordering::Relaxed),
        }
    }

    /// The most recent non-Ack message
    pub fn last_received(&self) -> Option<GatewayMessage> {
        self.shared.last_received.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn response_timeout(&self) -> Duration {
        self.shared.response_timeout()
    }

    /// Change how long the transmit loop waits for each acknowledgement.
    /// Takes effect from the next wait.
    pub fn set_response_timeout(&self, timeout: Duration) {
        self.shared
            .response_timeout_us
            .store(timeout.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn retries(&self) -> u32 {
        self.shared.retries
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Stop both loops, wait for them to finish and shut the stream down.
    pub async fn close(&self) {
        self.shared.shutdown.send_replace(true);

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                error!("Gateway task failed: {}", e);
            }
        }
        info!("Gateway session closed");
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Sends queued frames one at a time, retransmitting until acknowledged
async fn transmit_loop<W>(mut writer: W, mut queue: mpsc::UnboundedReceiver<Outgoing>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    let mut shutdown = shared.shutdown.subscribe();

    'frames: loop {
        let (frame, response_type) = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            next = queue.recv() => match next {
                Some(outgoing) => outgoing,
                None => break,
            },
        };

        shared.permit.arm();
        // Responses on the wire now belong to this frame
        if let Some(payload_type) = response_type {
            shared.codec.set_response_type(payload_type);
        }
        shared.tx_count.fetch_add(1, Ordering::Relaxed);
        let mut retries_left = shared.retries;

        loop {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                if is_fatal(&e) {
                    error!("Serial write failed, stopping transmit loop: {}", e);
                    break 'frames;
                }
                warn!("Serial write failed: {}", e);
            }

            let acked = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break 'frames,
                acked = shared.permit.wait(shared.response_timeout()) => acked,
            };
            if acked {
                break;
            }

            if retries_left == 0 {
                warn!("No response after {} retries, dropping frame", shared.retries);
                shared.handler.on_confirm(ErrorCode::NoResponse);
                break;
            }
            retries_left -= 1;
            shared.retransmissions.fetch_add(1, Ordering::Relaxed);
            debug!("No response within {:?}, retransmitting", shared.response_timeout());
        }
    }

    shared.shutdown.send_replace(true);
    if let Err(e) = writer.shutdown().await {
        debug!("Error shutting down serial writer: {}", e);
    }
    debug!("Leaving transmit loop");
}

/// Reassembles frames from the stream and dispatches decoded messages
async fn receive_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut shutdown = shared.shutdown.subscribe();
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let read = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                info!("Serial stream closed by peer");
                break;
            }
            Ok(n) => {
                for frame in decoder.process(&buf[..n]) {
                    shared.dispatch(&frame);
                }
            }
            Err(e) if is_fatal(&e) => {
                error!("Serial read failed, stopping receive loop: {}", e);
                break;
            }
            Err(e) => {
                warn!("Serial read failed: {}", e);
                tokio::time::sleep(IO_RETRY_DELAY).await;
            }
        }
    }

    shared.shutdown.send_replace(true);
    debug!("Leaving receive loop");
}
