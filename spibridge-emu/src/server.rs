//! Bridge emulator: serves an [`EmulatedFlash`] over the bridge wire protocol.

use crate::error::EmuError;
use crate::flash::EmulatedFlash;
use parking_lot::Mutex;
use spibridge_protocol::opcodes::opcode_name;
use spibridge_protocol::{Command, CommandDecoder, Response, DEFAULT_BRIDGE_PORT};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// A chip shared by every connection to one emulator.
pub type SharedFlash = Arc<Mutex<EmulatedFlash>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_BRIDGE_PORT)),
            max_connections: 16,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub commands_total: AtomicU64,
    pub device_errors_total: AtomicU64,
}

/// TCP front end for an emulated chip.
pub struct BridgeServer {
    config: ServerConfig,
    flash: SharedFlash,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl BridgeServer {
    /// Creates a new server around `flash`.
    pub fn new(config: ServerConfig, flash: EmulatedFlash) -> Self {
        Self::with_shared(config, Arc::new(Mutex::new(flash)))
    }

    /// Creates a new server around a chip that may also be reached elsewhere.
    pub fn with_shared(config: ServerConfig, flash: SharedFlash) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            flash,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), EmuError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), EmuError> {
        let local = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Bridge emulator listening on {}", local);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            tcp_stream.set_nodelay(true).ok();

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let flash = self.flash.clone();
                            let stats = self.stats.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                tracing::info!("Client connected: {}", addr);
                                let peer = addr.to_string();
                                let shutdown = async move {
                                    let _ = conn_shutdown.recv().await;
                                };

                                let result =
                                    handle_connection(tcp_stream, &peer, flash, &stats, shutdown).await;
                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Bridge emulator shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn flash(&self) -> SharedFlash {
        self.flash.clone()
    }
}

/// Serves the bridge protocol on any byte stream until it closes.
pub async fn serve_stream<S>(stream: S, flash: SharedFlash) -> Result<(), EmuError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stats = ServerStats::default();
    handle_connection(stream, "stream", flash, &stats, std::future::pending()).await
}

/// Starts an emulator task on one end of an in-memory pipe and returns the
/// other end.
pub fn spawn_duplex(flash: EmulatedFlash) -> DuplexStream {
    spawn_duplex_shared(Arc::new(Mutex::new(flash)))
}

/// Like [`spawn_duplex`] for a chip shared with other connections.
pub fn spawn_duplex_shared(flash: SharedFlash) -> DuplexStream {
    let (host, bridge) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        if let Err(e) = serve_stream(bridge, flash).await {
            tracing::debug!("In-process bridge stopped: {}", e);
        }
    });
    host
}

/// Executes one command against the chip and builds the reply.
fn dispatch(flash: &Mutex<EmulatedFlash>, cmd: &Command, peer: &str, stats: &ServerStats) -> Response {
    stats.commands_total.fetch_add(1, Ordering::Relaxed);

    let name = opcode_name(cmd.opcode()).unwrap_or("?");
    tracing::debug!(
        "[{}] Command {:#04x} ({}) write={} read={} wait_busy={}",
        peer,
        cmd.opcode(),
        name,
        cmd.write_data().len(),
        cmd.read_len(),
        cmd.wait_busy()
    );

    match flash.lock().execute(cmd) {
        Ok(data) => Response::ok(data),
        Err(e) => {
            stats.device_errors_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("[{}] {} failed: {}", peer, name, e);
            Response::error().padded_to(cmd.read_len())
        }
    }
}

async fn handle_connection<S, F>(
    mut stream: S,
    peer: &str,
    flash: SharedFlash,
    stats: &ServerStats,
    shutdown: F,
) -> Result<(), EmuError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let mut decoder = CommandDecoder::new();
    let mut buf = [0u8; 8192];
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                tracing::debug!("[{}] Shutdown signal received", peer);
                return Err(EmuError::ShuttingDown);
            }

            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        tracing::debug!("[{}] Connection closed by host", peer);
                        return Ok(());
                    }
                    Ok(n) => {
                        tracing::trace!("[{}] Received {} bytes", peer, n);
                        decoder.extend(&buf[..n]);
                    }
                    Err(e) => {
                        tracing::debug!("[{}] Read error: {}", peer, e);
                        return Err(EmuError::Io(e));
                    }
                }
            }
        }

        // A malformed header leaves the stream unsynchronized; drop the peer.
        while let Some(cmd) = decoder.decode_command()? {
            let response = dispatch(&flash, &cmd, peer, stats);
            let bytes = response.encode()?;
            stream.write_all(&bytes).await?;
        }
        stream.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::FlashConfig;
    use spibridge_protocol::{opcodes, Reassembler};
    use tokio::net::TcpStream;

    async fn roundtrip<S>(stream: &mut S, cmd: &Command) -> Vec<u8>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&cmd.encode().unwrap()).await.unwrap();

        let mut reassembler = Reassembler::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "bridge closed early");
            reassembler.feed(&buf[..n]);
            if let Some(frame) = reassembler.try_frame(cmd.read_len()) {
                let mut out = vec![frame.status.as_byte()];
                out.extend_from_slice(&frame.declared_len.to_le_bytes());
                out.extend_from_slice(&frame.payload);
                return out;
            }
        }
    }

    #[tokio::test]
    async fn test_duplex_jedec() {
        let mut stream = spawn_duplex(EmulatedFlash::new(FlashConfig::default()));
        let reply = roundtrip(&mut stream, &Command::read(opcodes::JEDEC_ID, 3)).await;
        assert_eq!(reply, vec![0x00, 0x03, 0x00, 0xEF, 0x40, 0x18]);
    }

    #[tokio::test]
    async fn test_device_error_frame() {
        let mut stream = spawn_duplex(EmulatedFlash::new(FlashConfig::default()));
        let cmd = Command::write(opcodes::SECTOR_ERASE, vec![0, 0, 0]).with_wait_busy();
        let reply = roundtrip(&mut stream, &cmd).await;
        assert_eq!(reply, vec![0x01, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_failed_read_reply_fills_read_len() {
        let mut stream = spawn_duplex(EmulatedFlash::new(FlashConfig::default()));

        let mut wire = Command::read(0xFE, 2).encode().unwrap();
        wire.extend_from_slice(&Command::read(opcodes::READ_STATUS_REG2, 1).encode().unwrap());
        stream.write_all(&wire).await.unwrap();

        let mut reply = [0u8; 9];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(
            reply,
            [0x01, 0x02, 0x00, 0xFF, 0xFF, 0x00, 0x01, 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn test_pipelined_commands_answered_in_order() {
        let mut stream = spawn_duplex(EmulatedFlash::new(FlashConfig::default()));

        let mut wire = Command::new(opcodes::WRITE_ENABLE).encode().unwrap();
        wire.extend_from_slice(&Command::read(opcodes::READ_STATUS_REG1, 1).encode().unwrap());
        stream.write_all(&wire).await.unwrap();

        let mut reply = [0u8; 7];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02]);
    }

    #[tokio::test]
    async fn test_malformed_header_drops_connection() {
        let flash = Arc::new(Mutex::new(EmulatedFlash::new(FlashConfig::default())));
        let (mut host, bridge) = tokio::io::duplex(1024);
        let task = tokio::spawn(serve_stream(bridge, flash));

        host.write_all(&[0x9F, 0x07, 0x00, 0x00, 0x03, 0x00]).await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(EmuError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_tcp_server_and_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Arc::new(BridgeServer::new(
            ServerConfig::new(addr),
            EmulatedFlash::new(FlashConfig::default()),
        ));
        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.serve(listener).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let reply = roundtrip(&mut stream, &Command::read(opcodes::READ_STATUS_REG2, 1)).await;
        assert_eq!(reply, vec![0x00, 0x01, 0x00, 0x00]);
        assert!(server.is_running());
        assert_eq!(server.stats().commands_total.load(Ordering::Relaxed), 1);

        server.shutdown();
        handle.await.unwrap().unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_shared_flash_visible_across_connections() {
        let flash = Arc::new(Mutex::new(EmulatedFlash::new(FlashConfig::default())));
        let mut a = spawn_duplex_shared(flash.clone());
        let mut b = spawn_duplex_shared(flash.clone());

        roundtrip(&mut a, &Command::new(opcodes::WRITE_ENABLE)).await;
        let reply = roundtrip(&mut b, &Command::read(opcodes::READ_STATUS_REG1, 1)).await;
        assert_eq!(reply[3], 0x02);
    }
}
