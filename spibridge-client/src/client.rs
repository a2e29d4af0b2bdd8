//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use bytes::Bytes;
use parking_lot::Mutex;
use spibridge_protocol::{opcodes, Command};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

/// Largest read issued as a single transaction by [`Client::read_data`].
pub const READ_CHUNK_SIZE: usize = 4096;

/// Page size accepted by [`Client::page_program`].
pub const PAGE_SIZE: usize = 256;

/// Highest address reachable with a 3-byte address.
pub const MAX_ADDRESS: u32 = 0x00FF_FFFF;

/// JEDEC identification triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JedecId {
    pub manufacturer: u8,
    pub memory_type: u8,
    pub capacity: u8,
}

impl JedecId {
    fn from_bytes(bytes: &[u8]) -> Result<Self, ClientError> {
        match bytes {
            [manufacturer, memory_type, capacity] => Ok(Self {
                manufacturer: *manufacturer,
                memory_type: *memory_type,
                capacity: *capacity,
            }),
            _ => Err(ClientError::LengthMismatch {
                expected: 3,
                declared: bytes.len() as u16,
            }),
        }
    }

    /// Chip size implied by the capacity code (`2^capacity` bytes), if it
    /// looks like a sensible exponent.
    pub fn capacity_bytes(&self) -> Option<u64> {
        (10..=32)
            .contains(&self.capacity)
            .then(|| 1u64 << self.capacity)
    }
}

impl fmt::Display for JedecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X} {:02X} {:02X}",
            self.manufacturer, self.memory_type, self.capacity
        )
    }
}

fn address_bytes(addr: u32) -> Result<[u8; 3], ClientError> {
    if addr > MAX_ADDRESS {
        return Err(ClientError::InvalidArgument(format!(
            "address {:#x} exceeds 24-bit range",
            addr
        )));
    }
    let [_, hi, mid, lo] = addr.to_be_bytes();
    Ok([hi, mid, lo])
}

fn check_span(addr: u32, len: usize) -> Result<(), ClientError> {
    let end = addr as u64 + len as u64;
    if end > MAX_ADDRESS as u64 + 1 {
        return Err(ClientError::InvalidArgument(format!(
            "range {:#x}+{} exceeds 24-bit address space",
            addr, len
        )));
    }
    Ok(())
}

/// High-level client for a SPI flash bridge.
pub struct Client {
    conn: Arc<Connection>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
            read_task: Mutex::new(None),
        }
    }

    /// Connects to the bridge and starts the background read loop.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await?;
        self.spawn_read_loop();
        Ok(())
    }

    /// Adopts an open transport and starts the background read loop.
    pub async fn attach<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.conn.attach(stream).await;
        self.spawn_read_loop();
    }

    fn spawn_read_loop(&self) {
        let conn = self.conn.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = conn.read_loop().await {
                tracing::debug!("read loop ended: {}", e);
            }
        });
        if let Some(previous) = self.read_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection and stops the read loop.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await?;
        let task = self.read_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Sends an arbitrary command and returns the response data.
    pub async fn raw(&self, command: &Command) -> Result<Bytes, ClientError> {
        self.conn.request(command).await
    }

    // =========================================================================
    // Identification
    // =========================================================================

    /// Reads the JEDEC manufacturer / memory type / capacity triple.
    pub async fn read_jedec_id(&self) -> Result<JedecId, ClientError> {
        let data = self.raw(&Command::read(opcodes::JEDEC_ID, 3)).await?;
        JedecId::from_bytes(&data)
    }

    /// Reads the 64-bit factory unique id.
    pub async fn read_unique_id(&self) -> Result<[u8; 8], ClientError> {
        // Four dummy bytes precede the id.
        let cmd = Command::read(opcodes::READ_UNIQUE_ID, 8).with_write_data(vec![0u8; 4]);
        let data = self.raw(&cmd).await?;
        <[u8; 8]>::try_from(&data[..]).map_err(|_| ClientError::LengthMismatch {
            expected: 8,
            declared: data.len() as u16,
        })
    }

    /// Reads `len` bytes of the SFDP table starting at `addr`.
    pub async fn read_sfdp(&self, addr: u32, len: u16) -> Result<Bytes, ClientError> {
        let mut write = address_bytes(addr)?.to_vec();
        write.push(0); // dummy
        self.raw(&Command::read(opcodes::READ_SFDP, len).with_write_data(write))
            .await
    }

    // =========================================================================
    // Status and write control
    // =========================================================================

    /// Reads status register 1.
    pub async fn read_status(&self) -> Result<u8, ClientError> {
        self.read_register(opcodes::READ_STATUS_REG1).await
    }

    /// Reads status register 2.
    pub async fn read_status2(&self) -> Result<u8, ClientError> {
        self.read_register(opcodes::READ_STATUS_REG2).await
    }

    async fn read_register(&self, opcode: u8) -> Result<u8, ClientError> {
        let data = self.raw(&Command::read(opcode, 1)).await?;
        data.first().copied().ok_or(ClientError::LengthMismatch {
            expected: 1,
            declared: 0,
        })
    }

    pub async fn write_enable(&self) -> Result<(), ClientError> {
        self.raw(&Command::new(opcodes::WRITE_ENABLE)).await?;
        Ok(())
    }

    pub async fn write_disable(&self) -> Result<(), ClientError> {
        self.raw(&Command::new(opcodes::WRITE_DISABLE)).await?;
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads `len` bytes starting at `addr`, split into transactions of at
    /// most [`READ_CHUNK_SIZE`] bytes.
    pub async fn read_data(&self, addr: u32, len: usize) -> Result<Vec<u8>, ClientError> {
        self.read_chunked(opcodes::READ_DATA, addr, len, false).await
    }

    /// Like [`read_data`](Self::read_data) but uses FAST_READ (one dummy
    /// byte after the address).
    pub async fn fast_read(&self, addr: u32, len: usize) -> Result<Vec<u8>, ClientError> {
        self.read_chunked(opcodes::FAST_READ, addr, len, true).await
    }

    async fn read_chunked(
        &self,
        opcode: u8,
        addr: u32,
        len: usize,
        dummy: bool,
    ) -> Result<Vec<u8>, ClientError> {
        check_span(addr, len)?;

        let mut out = Vec::with_capacity(len);
        let mut offset = 0usize;
        while offset < len {
            let chunk = (len - offset).min(READ_CHUNK_SIZE);
            let mut write = address_bytes(addr + offset as u32)?.to_vec();
            if dummy {
                write.push(0);
            }
            let cmd = Command::read(opcode, chunk as u16).with_write_data(write);
            let data = self.raw(&cmd).await?;
            out.extend_from_slice(&data);
            offset += chunk;
        }

        tracing::debug!("Read {} bytes from {:#08x}", out.len(), addr);
        Ok(out)
    }

    // =========================================================================
    // Program / erase
    // =========================================================================

    /// Programs up to one page. The bridge waits for the chip to go idle
    /// before answering. Issue [`write_enable`](Self::write_enable) first.
    pub async fn page_program(&self, addr: u32, data: &[u8]) -> Result<(), ClientError> {
        if data.is_empty() || data.len() > PAGE_SIZE {
            return Err(ClientError::InvalidArgument(format!(
                "page program takes 1..={} bytes, got {}",
                PAGE_SIZE,
                data.len()
            )));
        }
        check_span(addr, data.len())?;

        let mut write = Vec::with_capacity(3 + data.len());
        write.extend_from_slice(&address_bytes(addr)?);
        write.extend_from_slice(data);

        let cmd = Command::write(opcodes::PAGE_PROGRAM, write).with_wait_busy();
        self.raw(&cmd).await?;
        Ok(())
    }

    /// Erases the 4 KiB sector containing `addr`.
    pub async fn sector_erase(&self, addr: u32) -> Result<(), ClientError> {
        self.erase(opcodes::SECTOR_ERASE, addr).await
    }

    /// Erases the 32 KiB block containing `addr`.
    pub async fn block_erase_32k(&self, addr: u32) -> Result<(), ClientError> {
        self.erase(opcodes::BLOCK_ERASE_32K, addr).await
    }

    /// Erases the 64 KiB block containing `addr`.
    pub async fn block_erase_64k(&self, addr: u32) -> Result<(), ClientError> {
        self.erase(opcodes::BLOCK_ERASE_64K, addr).await
    }

    async fn erase(&self, opcode: u8, addr: u32) -> Result<(), ClientError> {
        let cmd = Command::write(opcode, address_bytes(addr)?.to_vec()).with_wait_busy();
        self.raw(&cmd).await?;
        Ok(())
    }

    /// Erases the whole chip.
    pub async fn chip_erase(&self) -> Result<(), ClientError> {
        self.raw(&Command::new(opcodes::CHIP_ERASE).with_wait_busy())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Power / reset
    // =========================================================================

    /// Software reset (enable-reset followed by reset).
    pub async fn reset(&self) -> Result<(), ClientError> {
        self.raw(&Command::new(opcodes::ENABLE_RESET)).await?;
        self.raw(&Command::new(opcodes::RESET)).await?;
        Ok(())
    }

    pub async fn power_down(&self) -> Result<(), ClientError> {
        self.raw(&Command::new(opcodes::POWER_DOWN)).await?;
        Ok(())
    }

    pub async fn release_power_down(&self) -> Result<(), ClientError> {
        self.raw(&Command::new(opcodes::RELEASE_POWER_DOWN)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BridgeAddr;
    use spibridge_emu::{spawn_duplex, EmulatedFlash, FlashConfig};

    async fn emulated() -> Client {
        let flash = EmulatedFlash::new(FlashConfig::default());
        let stream = spawn_duplex(flash);
        let config = ConnectionConfig::new(BridgeAddr::Tcp("127.0.0.1:7420".to_string()));
        let client = Client::new(config);
        client.attach(stream).await;
        client
    }

    #[test]
    fn test_address_bytes() {
        assert_eq!(address_bytes(0x123456).unwrap(), [0x12, 0x34, 0x56]);
        assert_eq!(address_bytes(0).unwrap(), [0, 0, 0]);
        assert!(matches!(
            address_bytes(0x0100_0000),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_check_span() {
        assert!(check_span(0xFF_FF00, 256).is_ok());
        assert!(check_span(0xFF_FF00, 257).is_err());
    }

    #[test]
    fn test_jedec_id() {
        let id = JedecId::from_bytes(&[0xEF, 0x40, 0x18]).unwrap();
        assert_eq!(id.to_string(), "EF 40 18");
        assert_eq!(id.capacity_bytes(), Some(16 * 1024 * 1024));
        assert!(JedecId::from_bytes(&[0xEF]).is_err());
    }

    #[tokio::test]
    async fn test_read_jedec_id() {
        let client = emulated().await;
        let id = client.read_jedec_id().await.unwrap();
        assert_eq!(
            id,
            JedecId {
                manufacturer: 0xEF,
                memory_type: 0x40,
                capacity: 0x18
            }
        );
        client.close().await.unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_erased_chip_reads_ff() {
        let client = emulated().await;
        let data = client.read_data(0, 256).await.unwrap();
        assert_eq!(data.len(), 256);
        assert!(data.iter().all(|&b| b == 0xFF));
    }

    #[tokio::test]
    async fn test_program_requires_write_enable() {
        let client = emulated().await;
        let result = client.page_program(0x1000, &[1, 2, 3]).await;
        assert!(matches!(
            result,
            Err(ClientError::DeviceError {
                opcode: opcodes::PAGE_PROGRAM,
                ..
            })
        ));
        // Connection survives a device error.
        assert!(client.read_status().await.is_ok());
    }

    #[tokio::test]
    async fn test_program_erase_cycle() {
        let client = emulated().await;

        client.write_enable().await.unwrap();
        assert_eq!(client.read_status().await.unwrap() & 0x02, 0x02);
        client.page_program(0x1000, &[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();
        assert_eq!(client.read_status().await.unwrap() & 0x03, 0);

        assert_eq!(
            client.read_data(0x1000, 4).await.unwrap(),
            vec![0xDE, 0xAD, 0xBE, 0xEF]
        );
        assert_eq!(
            client.fast_read(0x1002, 2).await.unwrap(),
            vec![0xBE, 0xEF]
        );

        client.write_enable().await.unwrap();
        client.sector_erase(0x1000).await.unwrap();
        assert_eq!(client.read_data(0x1000, 4).await.unwrap(), vec![0xFF; 4]);
    }

    #[tokio::test]
    async fn test_chunked_read_spans_transactions() {
        let client = emulated().await;

        let page: Vec<u8> = (0..=255u8).collect();
        for i in 0..20u32 {
            client.write_enable().await.unwrap();
            client.page_program(i * 256, &page).await.unwrap();
        }

        let len = READ_CHUNK_SIZE + 1000;
        let data = client.read_data(0, len).await.unwrap();
        assert_eq!(data.len(), len);
        assert!(data.iter().enumerate().all(|(i, &b)| b == (i % 256) as u8));
    }

    #[tokio::test]
    async fn test_page_program_bounds() {
        let client = emulated().await;
        assert!(matches!(
            client.page_program(0, &[]).await,
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.page_program(0, &[0u8; PAGE_SIZE + 1]).await,
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(!client.connection().is_busy());
    }

    #[tokio::test]
    async fn test_power_down_blocks_reads() {
        let client = emulated().await;
        client.power_down().await.unwrap();
        assert!(matches!(
            client.read_jedec_id().await,
            Err(ClientError::DeviceError { .. })
        ));
        client.release_power_down().await.unwrap();
        assert!(client.read_jedec_id().await.is_ok());
    }

    #[tokio::test]
    async fn test_identification_helpers() {
        let client = emulated().await;

        let uid = client.read_unique_id().await.unwrap();
        assert_ne!(uid, [0xFF; 8]);

        let sfdp = client.read_sfdp(0, 4).await.unwrap();
        assert_eq!(&sfdp[..], b"SFDP");

        client.reset().await.unwrap();
        assert_eq!(client.read_status2().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_opcode_is_device_error() {
        let client = emulated().await;
        let result = client.raw(&Command::read(0xFE, 1)).await;
        assert!(matches!(
            result,
            Err(ClientError::DeviceError { opcode: 0xFE, .. })
        ));
    }
}
