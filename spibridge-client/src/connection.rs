//! Connection management and the single-transaction engine.
//!
//! A bridge answers exactly one command at a time and its responses carry no
//! correlation id, so the connection admits at most one outstanding
//! transaction. The slot and the receive accumulation buffer live behind a
//! single lock: [`Connection::send`] claims the slot and the read loop feeds
//! the reassembler and settles the slot under that same lock.

use crate::error::ClientError;
use crate::stream::{BridgeAddr, BridgeStream};
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use spibridge_protocol::opcodes::opcode_name;
use spibridge_protocol::{Command, DecodedFrame, Reassembler};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};

/// Default read buffer size (4 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4 * 1024;

/// Minimum read buffer size.
pub const MIN_READ_BUFFER_SIZE: usize = 64;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Reply = Result<Bytes, ClientError>;

/// What to do with bytes that arrive while no transaction is outstanding.
///
/// Neither policy applies to bytes the engine can attribute to an earlier
/// frame: padding still owed by a frame that completed early is skipped, and
/// after a transaction is abandoned everything up to the next send is
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleBytePolicy {
    /// Keep them; they become the start of the next response.
    #[default]
    Buffer,
    /// Drop them.
    Discard,
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bridge address used by [`Connection::connect`].
    pub addr: BridgeAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Upper bound on waiting for a response in [`Connection::request`].
    /// `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
    /// Read buffer size for transport reads.
    pub read_buffer_size: usize,
    /// Handling of unsolicited receive data.
    pub idle_bytes: IdleBytePolicy,
}

impl ConnectionConfig {
    pub fn new(addr: BridgeAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(30)),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            idle_bytes: IdleBytePolicy::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn without_request_timeout(mut self) -> Self {
        self.request_timeout = None;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_idle_byte_policy(mut self, policy: IdleBytePolicy) -> Self {
        self.idle_bytes = policy;
        self
    }
}

/// The in-flight transaction.
struct Transaction {
    id: u64,
    opcode: u8,
    expected_len: u16,
    reply: oneshot::Sender<Reply>,
}

impl Transaction {
    /// Validates the decoded frame against this request and settles it.
    fn settle(self, frame: DecodedFrame) {
        let result = validate(self.opcode, self.expected_len, frame);
        match &result {
            Ok(payload) => tracing::debug!(
                "Transaction id={} completed ({} bytes)",
                self.id,
                payload.len()
            ),
            Err(e) => tracing::debug!("Transaction id={} failed: {}", self.id, e),
        }
        self.finish(result);
    }

    fn finish(self, result: Reply) {
        if self.reply.send(result).is_err() {
            tracing::debug!("Transaction id={} settled with no waiter", self.id);
        }
    }
}

fn validate(opcode: u8, expected_len: u16, frame: DecodedFrame) -> Reply {
    if !frame.is_success() {
        return Err(ClientError::DeviceError {
            opcode,
            status: frame.status.as_byte(),
        });
    }
    if frame.declared_len != expected_len {
        return Err(ClientError::LengthMismatch {
            expected: expected_len,
            declared: frame.declared_len,
        });
    }
    Ok(frame.payload)
}

enum Slot {
    Idle,
    Awaiting(Transaction),
}

/// Transaction slot plus receive accumulation buffer.
struct Engine {
    slot: Slot,
    reassembler: Reassembler,
    /// Bytes of the last frame still to come after it completed early.
    owed: usize,
    /// Set when a transaction is abandoned; cleared by the next send.
    discard_idle: bool,
}

impl Engine {
    fn new() -> Self {
        Self {
            slot: Slot::Idle,
            reassembler: Reassembler::new(),
            owed: 0,
            discard_idle: false,
        }
    }

    /// Forgets everything received so far and hands back the outstanding
    /// transaction, if any.
    fn reset(&mut self) -> Option<Transaction> {
        self.reassembler.clear();
        self.owed = 0;
        self.discard_idle = false;
        self.take_transaction()
    }

    fn is_busy(&self) -> bool {
        matches!(self.slot, Slot::Awaiting(_))
    }

    fn take_transaction(&mut self) -> Option<Transaction> {
        match std::mem::replace(&mut self.slot, Slot::Idle) {
            Slot::Awaiting(txn) => Some(txn),
            Slot::Idle => None,
        }
    }

    /// Feeds a received chunk. Returns the transaction together with its
    /// frame once the frame is complete; the slot is already idle by then.
    fn feed(
        &mut self,
        mut chunk: &[u8],
        policy: IdleBytePolicy,
    ) -> Option<(Transaction, DecodedFrame)> {
        if self.owed > 0 {
            let skip = self.owed.min(chunk.len());
            self.owed -= skip;
            chunk = &chunk[skip..];
            tracing::debug!(
                "Skipped {} trailing bytes of the previous frame ({} still due)",
                skip,
                self.owed
            );
            if chunk.is_empty() {
                return None;
            }
        }

        let expected_len = match &self.slot {
            Slot::Awaiting(txn) => txn.expected_len,
            Slot::Idle => {
                if self.discard_idle {
                    tracing::debug!(
                        "Discarding {} bytes after an abandoned transaction",
                        chunk.len()
                    );
                    return None;
                }
                match policy {
                    IdleBytePolicy::Buffer => {
                        self.reassembler.feed(chunk);
                        tracing::debug!(
                            "Buffered {} unsolicited bytes ({} pending)",
                            chunk.len(),
                            self.reassembler.buffered()
                        );
                    }
                    IdleBytePolicy::Discard => {
                        tracing::warn!("Discarding {} unsolicited bytes", chunk.len());
                    }
                }
                return None;
            }
        };

        self.reassembler.feed(chunk);
        let buffered = self.reassembler.buffered();
        let frame = self.reassembler.try_frame(expected_len)?;

        let wire_len = frame.wire_len(expected_len);
        if buffered > wire_len {
            tracing::debug!("Dropping {} bytes past end of frame", buffered - wire_len);
        } else {
            self.owed = wire_len - buffered;
        }

        self.take_transaction().map(|txn| (txn, frame))
    }
}

/// A response that has not arrived yet.
///
/// Resolves to the response data, or to the reason the transaction failed.
#[must_use = "the transaction slot stays occupied until the response is awaited or times out"]
pub struct PendingResponse {
    id: u64,
    rx: oneshot::Receiver<Reply>,
}

impl PendingResponse {
    /// Transaction id, for logging.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingResponse {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without a reply: the slot was torn down.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::TransportClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Releases the slot if `send` is dropped before the frame is written.
struct SlotGuard<'a> {
    conn: &'a Connection,
    id: u64,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.abandon(self.id);
        }
    }
}

/// A connection to a bridge.
pub struct Connection {
    config: ConnectionConfig,
    /// Write half of the transport.
    writer: Mutex<Option<BoxedWriter>>,
    /// Read half of the transport, taken by the read loop.
    reader: Mutex<Option<BoxedReader>>,
    /// Single serialization point for the slot and the accumulation buffer.
    engine: SyncMutex<Engine>,
    /// Next transaction id.
    next_id: AtomicU64,
    /// Is a transport attached?
    connected: AtomicBool,
    /// Set to `true` to stop the read loop.
    shutdown: watch::Sender<bool>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            engine: SyncMutex::new(Engine::new()),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connects to the configured bridge address.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            BridgeStream::connect(&self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })??;

        tracing::info!("Connected to bridge at {} ({})", self.config.addr, stream.kind());
        self.attach(stream).await;
        Ok(())
    }

    /// Adopts an already-open transport.
    ///
    /// Any transaction still outstanding from a previous transport is settled
    /// as [`ClientError::TransportClosed`].
    pub async fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(Box::new(write_half));
        *self.reader.lock().await = Some(Box::new(read_half));

        let stale = self.engine.lock().reset();
        if let Some(txn) = stale {
            txn.finish(Err(ClientError::TransportClosed));
        }

        self.shutdown.send_replace(false);
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Starts a transaction.
    ///
    /// Fails with [`ClientError::Busy`] before touching the transport if
    /// another transaction is outstanding. Otherwise writes the command
    /// (header, then payload) and returns a handle for the response.
    pub async fn send(&self, command: &Command) -> Result<PendingResponse, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }

        let header = command.encode_header()?;
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut engine = self.engine.lock();
            if engine.is_busy() {
                tracing::debug!(
                    "Rejecting opcode {:#04x}: transaction outstanding",
                    command.opcode()
                );
                return Err(ClientError::Busy);
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            engine.discard_idle = false;
            engine.slot = Slot::Awaiting(Transaction {
                id,
                opcode: command.opcode(),
                expected_len: command.read_len(),
                reply: tx,
            });
            id
        };

        let mut guard = SlotGuard {
            conn: self,
            id,
            armed: true,
        };

        tracing::debug!(
            "Sending id={} opcode={:#04x} ({}) write={} read={} wait_busy={}",
            id,
            command.opcode(),
            opcode_name(command.opcode()).unwrap_or("?"),
            command.write_data().len(),
            command.read_len(),
            command.wait_busy()
        );

        self.write_frame(&header, command.write_data()).await?;
        guard.armed = false;

        Ok(PendingResponse { id, rx })
    }

    /// Sends a command and waits for its response, bounded by the
    /// configured request timeout.
    ///
    /// On timeout the slot is released and any partially received frame is
    /// discarded, along with the rest of it should it arrive late.
    pub async fn request(&self, command: &Command) -> Result<Bytes, ClientError> {
        let mut pending = self.send(command).await?;

        let Some(limit) = self.config.request_timeout else {
            return pending.await;
        };

        match tokio::time::timeout(limit, &mut pending).await {
            Ok(result) => result,
            Err(_) => {
                if self.abandon(pending.id) {
                    tracing::warn!(
                        "Transaction id={} opcode={:#04x} timed out after {:?}",
                        pending.id,
                        command.opcode(),
                        limit
                    );
                    Err(ClientError::Timeout)
                } else {
                    // Settled between the timer firing and the abandon.
                    pending.await
                }
            }
        }
    }

    async fn write_frame(&self, header: &[u8], payload: &[u8]) -> Result<(), ClientError> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(header).await?;
        if !payload.is_empty() {
            writer.write_all(payload).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Releases the slot if it still holds transaction `id`, discarding the
    /// accumulation buffer. Whatever the bridge still sends for it is dropped
    /// until the next send. Returns whether anything was released.
    fn abandon(&self, id: u64) -> bool {
        let mut engine = self.engine.lock();
        match &engine.slot {
            Slot::Awaiting(txn) if txn.id == id => {
                engine.take_transaction();
                engine.reassembler.clear();
                engine.discard_idle = true;
                true
            }
            _ => false,
        }
    }

    /// Feeds one received chunk through the reassembler and settles the
    /// outstanding transaction if its frame is complete.
    fn on_chunk(&self, chunk: &[u8]) {
        let completed = self.engine.lock().feed(chunk, self.config.idle_bytes);
        if let Some((txn, frame)) = completed {
            txn.settle(frame);
        }
    }

    /// Marks the transport gone and fails the outstanding transaction.
    fn on_transport_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let orphan = self.engine.lock().reset();
        if let Some(txn) = orphan {
            tracing::warn!(
                "Transport closed with transaction id={} outstanding",
                txn.id
            );
            txn.finish(Err(ClientError::TransportClosed));
        }
    }

    /// Drains the transport's receive side (call this in a background task).
    ///
    /// Returns `Ok(())` after [`close`](Self::close), or the reason the
    /// transport ended otherwise.
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(ClientError::NotConnected)?;
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        tracing::debug!("read_loop started");
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let n = tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow_and_update() {
                        tracing::debug!("read_loop: shutdown requested");
                        self.on_transport_closed();
                        return Ok(());
                    }
                    continue;
                }

                result = reader.read(&mut buf) => match result {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!("read_loop: read error: {}", e);
                        self.on_transport_closed();
                        return Err(ClientError::Io(e));
                    }
                },
            };

            if n == 0 {
                tracing::debug!("read_loop: transport closed");
                self.on_transport_closed();
                return Err(ClientError::TransportClosed);
            }

            tracing::debug!("read_loop: received {} bytes", n);
            self.on_chunk(&buf[..n]);
        }
    }

    /// Returns whether a transport is attached.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns whether a transaction is outstanding.
    pub fn is_busy(&self) -> bool {
        self.engine.lock().is_busy()
    }

    /// Returns the number of received bytes not yet consumed by a frame.
    pub fn buffered(&self) -> usize {
        self.engine.lock().reassembler.buffered()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");

        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        if let Some(mut writer) = self.writer.lock().await.take() {
            tracing::debug!("Shutting down writer");
            let _ = writer.shutdown().await;
        }
        let _ = self.reader.lock().await.take();

        self.on_transport_closed();
        tracing::debug!("Connection closed");
        Ok(())
    }
}
