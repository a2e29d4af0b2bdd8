//! In-memory SPI NOR flash chip.
//!
//! Models the behavior a bridge observes from a typical 3-byte-address
//! serial flash: erased cells read `0xFF`, programming can only clear bits,
//! writes and erases need the write-enable latch, and every operation
//! completes instantly (BUSY never reads back as set).

use bytes::Bytes;
use spibridge_protocol::{opcodes, Command};
use thiserror::Error;

/// Status register 1: write in progress.
pub const SR1_BUSY: u8 = 0x01;
/// Status register 1: write enable latch.
pub const SR1_WEL: u8 = 0x02;
/// Status register 1 bits a WRSR may change.
const SR1_WRITABLE: u8 = 0xFC;

/// Smallest supported chip (64 KiB).
pub const MIN_FLASH_SIZE: usize = 64 * 1024;
/// Largest chip a 3-byte address can reach (16 MiB).
pub const MAX_FLASH_SIZE: usize = 16 * 1024 * 1024;

pub const PAGE_SIZE: usize = 256;
pub const SECTOR_SIZE: usize = 4 * 1024;
pub const BLOCK_32K_SIZE: usize = 32 * 1024;
pub const BLOCK_64K_SIZE: usize = 64 * 1024;

/// Security register count and size.
const SECURITY_REGS: usize = 3;
const SECURITY_REG_SIZE: usize = 256;

/// Offset of the basic flash parameter table in the SFDP space.
const SFDP_BFPT_OFFSET: usize = 0x80;
const SFDP_SIZE: usize = 0x100;

/// Reasons the emulated chip refuses a command.
///
/// All of these surface on the wire as a failure status byte.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlashError {
    #[error("unsupported opcode {0:#04x}")]
    UnsupportedOpcode(u8),

    #[error("write enable latch not set")]
    WriteNotEnabled,

    #[error("address {addr:#08x} outside {size}-byte array")]
    OutOfRange { addr: usize, size: usize },

    #[error("opcode {opcode:#04x} needs at least {needed} write bytes, got {got}")]
    ShortWrite { opcode: u8, needed: usize, got: usize },

    #[error("page program of {0} bytes exceeds page size")]
    PageOverflow(usize),

    #[error("device is in deep power-down")]
    PoweredDown,

    #[error("reset not preceded by enable-reset")]
    ResetNotEnabled,
}

/// Chip identity and geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashConfig {
    /// Manufacturer, memory type, capacity.
    pub jedec_id: [u8; 3],
    /// Array size in bytes.
    pub size: usize,
    /// Factory unique id.
    pub unique_id: [u8; 8],
}

impl Default for FlashConfig {
    /// A 128 Mbit Winbond-style part.
    fn default() -> Self {
        Self {
            jedec_id: [0xEF, 0x40, 0x18],
            size: MAX_FLASH_SIZE,
            unique_id: [0xD2, 0x63, 0x48, 0x1C, 0x2B, 0x57, 0x41, 0x30],
        }
    }
}

impl FlashConfig {
    /// Legacy device id byte returned by RELEASE_POWER_DOWN and DEVICE_ID.
    pub fn device_id(&self) -> u8 {
        self.jedec_id[2].wrapping_sub(1)
    }
}

/// An emulated flash chip.
pub struct EmulatedFlash {
    config: FlashConfig,
    memory: Vec<u8>,
    security: [[u8; SECURITY_REG_SIZE]; SECURITY_REGS],
    sfdp: [u8; SFDP_SIZE],
    status1: u8,
    status2: u8,
    volatile_sr_write: bool,
    reset_enabled: bool,
    powered_down: bool,
}

impl EmulatedFlash {
    /// Creates an erased chip.
    pub fn new(config: FlashConfig) -> Self {
        let sfdp = build_sfdp(config.size);
        Self {
            memory: vec![0xFF; config.size],
            security: [[0xFF; SECURITY_REG_SIZE]; SECURITY_REGS],
            sfdp,
            status1: 0,
            status2: 0,
            volatile_sr_write: false,
            reset_enabled: false,
            powered_down: false,
            config,
        }
    }

    /// Creates a chip whose array starts with `image`; the rest is erased.
    pub fn with_image(config: FlashConfig, image: &[u8]) -> Result<Self, FlashError> {
        if image.len() > config.size {
            return Err(FlashError::OutOfRange {
                addr: image.len(),
                size: config.size,
            });
        }
        let mut flash = Self::new(config);
        flash.memory[..image.len()].copy_from_slice(image);
        Ok(flash)
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// Raw array contents.
    pub fn contents(&self) -> &[u8] {
        &self.memory
    }

    pub fn status1(&self) -> u8 {
        self.status1
    }

    pub fn is_powered_down(&self) -> bool {
        self.powered_down
    }

    /// Executes one command and returns exactly `read_len` response bytes.
    pub fn execute(&mut self, cmd: &Command) -> Result<Bytes, FlashError> {
        let opcode = cmd.opcode();
        let write = cmd.write_data();
        let read_len = cmd.read_len() as usize;

        // RESET must immediately follow ENABLE_RESET.
        let reset_armed = std::mem::take(&mut self.reset_enabled);

        if self.powered_down && opcode != opcodes::RELEASE_POWER_DOWN {
            return Err(FlashError::PoweredDown);
        }

        let mut out: Vec<u8> = match opcode {
            opcodes::WRITE_ENABLE => {
                self.status1 |= SR1_WEL;
                Vec::new()
            }
            opcodes::WRITE_DISABLE => {
                self.status1 &= !SR1_WEL;
                Vec::new()
            }
            opcodes::VOLATILE_SR_WRITE_ENABLE => {
                self.volatile_sr_write = true;
                Vec::new()
            }
            opcodes::READ_STATUS_REG1 => vec![self.status1; read_len],
            opcodes::READ_STATUS_REG2 => vec![self.status2; read_len],
            opcodes::WRITE_STATUS_REG => {
                self.write_status(write)?;
                Vec::new()
            }

            opcodes::READ_DATA => {
                let addr = self.address(opcode, write, 3)?;
                self.read_array(addr, read_len)
            }
            opcodes::FAST_READ => {
                let addr = self.address(opcode, write, 4)?;
                self.read_array(addr, read_len)
            }

            opcodes::PAGE_PROGRAM => {
                let addr = self.address(opcode, write, 3)?;
                self.page_program(addr, &write[3..])?;
                Vec::new()
            }
            opcodes::SECTOR_ERASE => {
                self.erase_region(opcode, write, SECTOR_SIZE)?;
                Vec::new()
            }
            opcodes::BLOCK_ERASE_32K => {
                self.erase_region(opcode, write, BLOCK_32K_SIZE)?;
                Vec::new()
            }
            opcodes::BLOCK_ERASE_64K => {
                self.erase_region(opcode, write, BLOCK_64K_SIZE)?;
                Vec::new()
            }
            opcodes::CHIP_ERASE | opcodes::CHIP_ERASE_ALT => {
                self.require_wel()?;
                self.memory.fill(0xFF);
                tracing::debug!("Chip erased");
                Vec::new()
            }
            // Operations finish instantly, so there is never anything to suspend.
            opcodes::ERASE_PROGRAM_SUSPEND | opcodes::ERASE_PROGRAM_RESUME => Vec::new(),

            opcodes::POWER_DOWN => {
                self.powered_down = true;
                Vec::new()
            }
            opcodes::RELEASE_POWER_DOWN => {
                self.powered_down = false;
                vec![self.config.device_id(); read_len]
            }

            opcodes::DEVICE_ID => {
                let ids = [self.config.jedec_id[0], self.config.device_id()];
                cycle(&ids, read_len)
            }
            opcodes::JEDEC_ID => cycle(&self.config.jedec_id, read_len),
            opcodes::READ_UNIQUE_ID => {
                require_len(opcode, write, 4)?;
                cycle(&self.config.unique_id, read_len)
            }
            opcodes::READ_SFDP => {
                let addr = be24(opcode, write, 4)?;
                (0..read_len)
                    .map(|i| self.sfdp.get(addr + i).copied().unwrap_or(0xFF))
                    .collect()
            }

            opcodes::ERASE_SECURITY_REG => {
                let reg = self.security_reg(opcode, write, 3)?;
                self.require_wel()?;
                self.security[reg].fill(0xFF);
                Vec::new()
            }
            opcodes::READ_SECURITY_REG => {
                let reg = self.security_reg(opcode, write, 4)?;
                let offset = be24(opcode, write, 4)? & (SECURITY_REG_SIZE - 1);
                (0..read_len)
                    .map(|i| self.security[reg][(offset + i) % SECURITY_REG_SIZE])
                    .collect()
            }

            opcodes::ENABLE_RESET => {
                self.reset_enabled = true;
                Vec::new()
            }
            opcodes::RESET => {
                if !reset_armed {
                    return Err(FlashError::ResetNotEnabled);
                }
                self.status1 &= !(SR1_WEL | SR1_BUSY);
                self.volatile_sr_write = false;
                tracing::debug!("Device reset");
                Vec::new()
            }

            other => return Err(FlashError::UnsupportedOpcode(other)),
        };

        // Bytes clocked past the command's output read back as idle-high.
        out.resize(read_len, 0xFF);
        Ok(Bytes::from(out))
    }

    fn require_wel(&self) -> Result<(), FlashError> {
        if self.status1 & SR1_WEL == 0 {
            return Err(FlashError::WriteNotEnabled);
        }
        Ok(())
    }

    fn address(&self, opcode: u8, write: &[u8], needed: usize) -> Result<usize, FlashError> {
        let addr = be24(opcode, write, needed)?;
        if addr >= self.config.size {
            return Err(FlashError::OutOfRange {
                addr,
                size: self.config.size,
            });
        }
        Ok(addr)
    }

    fn security_reg(&self, opcode: u8, write: &[u8], needed: usize) -> Result<usize, FlashError> {
        let addr = be24(opcode, write, needed)?;
        // Registers live at 0x001000, 0x002000, 0x003000.
        match addr >> 12 {
            n @ 1..=3 => Ok(n - 1),
            _ => Err(FlashError::OutOfRange {
                addr,
                size: SECURITY_REGS * SECURITY_REG_SIZE,
            }),
        }
    }

    /// Sequential reads wrap at the end of the array.
    fn read_array(&self, addr: usize, len: usize) -> Vec<u8> {
        let size = self.memory.len();
        (0..len).map(|i| self.memory[(addr + i) % size]).collect()
    }

    fn page_program(&mut self, addr: usize, data: &[u8]) -> Result<(), FlashError> {
        if data.len() > PAGE_SIZE {
            return Err(FlashError::PageOverflow(data.len()));
        }
        self.require_wel()?;

        // Data past the end of the page wraps to its start.
        let page = addr & !(PAGE_SIZE - 1);
        let offset = addr & (PAGE_SIZE - 1);
        for (i, byte) in data.iter().enumerate() {
            let at = page + (offset + i) % PAGE_SIZE;
            self.memory[at] &= *byte;
        }

        self.status1 &= !SR1_WEL;
        tracing::debug!("Programmed {} bytes at {:#08x}", data.len(), addr);
        Ok(())
    }

    fn erase_region(&mut self, opcode: u8, write: &[u8], size: usize) -> Result<(), FlashError> {
        let addr = self.address(opcode, write, 3)?;
        self.require_wel()?;

        let start = addr & !(size - 1);
        let end = (start + size).min(self.memory.len());
        self.memory[start..end].fill(0xFF);

        self.status1 &= !SR1_WEL;
        tracing::debug!("Erased {:#08x}..{:#08x}", start, end);
        Ok(())
    }

    fn write_status(&mut self, write: &[u8]) -> Result<(), FlashError> {
        require_len(opcodes::WRITE_STATUS_REG, write, 1)?;
        if self.status1 & SR1_WEL == 0 && !self.volatile_sr_write {
            return Err(FlashError::WriteNotEnabled);
        }

        self.status1 = (self.status1 & !SR1_WRITABLE) | (write[0] & SR1_WRITABLE);
        if let Some(&sr2) = write.get(1) {
            self.status2 = sr2;
        }

        self.status1 &= !SR1_WEL;
        self.volatile_sr_write = false;
        Ok(())
    }
}

fn require_len(opcode: u8, write: &[u8], needed: usize) -> Result<(), FlashError> {
    if write.len() < needed {
        return Err(FlashError::ShortWrite {
            opcode,
            needed,
            got: write.len(),
        });
    }
    Ok(())
}

/// Big-endian 24-bit address at the start of `write`.
fn be24(opcode: u8, write: &[u8], needed: usize) -> Result<usize, FlashError> {
    require_len(opcode, write, needed)?;
    Ok(((write[0] as usize) << 16) | ((write[1] as usize) << 8) | write[2] as usize)
}

fn cycle(source: &[u8], len: usize) -> Vec<u8> {
    source.iter().copied().cycle().take(len).collect()
}

/// Minimal SFDP space: header, one parameter header, and the first two
/// dwords of the basic flash parameter table.
fn build_sfdp(size: usize) -> [u8; SFDP_SIZE] {
    let mut sfdp = [0xFF; SFDP_SIZE];

    sfdp[0..4].copy_from_slice(b"SFDP");
    sfdp[4] = 0x06; // minor revision
    sfdp[5] = 0x01; // major revision
    sfdp[6] = 0x00; // parameter headers - 1
    sfdp[7] = 0xFF;

    // Parameter header 0: JEDEC basic table, 2 dwords at 0x80.
    sfdp[8..16].copy_from_slice(&[
        0x00,
        0x06,
        0x01,
        0x02,
        SFDP_BFPT_OFFSET as u8,
        0x00,
        0x00,
        0xFF,
    ]);

    // 4 KiB erase supported via 0x20, 3-byte addressing.
    let dword1: u32 = 0xFFF1_20E5;
    // Density in bits, minus one.
    let bits = (size as u64 * 8).saturating_sub(1);
    let dword2: u32 = bits.min(u32::MAX as u64) as u32;
    sfdp[SFDP_BFPT_OFFSET..SFDP_BFPT_OFFSET + 4].copy_from_slice(&dword1.to_le_bytes());
    sfdp[SFDP_BFPT_OFFSET + 4..SFDP_BFPT_OFFSET + 8].copy_from_slice(&dword2.to_le_bytes());

    sfdp
}
