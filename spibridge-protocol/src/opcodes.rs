//! SPI flash opcode vocabulary understood by the bridge's target chips.
//!
//! The engine never interprets these; they are passed through as the first
//! byte of a command frame.

// ============================================================================
// Write control
// ============================================================================

/// Write Enable - sets the WEL bit, required before program/erase
pub const WRITE_ENABLE: u8 = 0x06;
/// Volatile Status Register Write Enable
pub const VOLATILE_SR_WRITE_ENABLE: u8 = 0x50;
/// Write Disable - clears the WEL bit
pub const WRITE_DISABLE: u8 = 0x04;

// ============================================================================
// Status registers
// ============================================================================

/// Read Status Register 1
pub const READ_STATUS_REG1: u8 = 0x05;
/// Read Status Register 2
pub const READ_STATUS_REG2: u8 = 0x35;
/// Write Status Register
pub const WRITE_STATUS_REG: u8 = 0x01;

// ============================================================================
// Program / erase
// ============================================================================

/// Page Program (up to 256 bytes)
pub const PAGE_PROGRAM: u8 = 0x02;
/// Sector Erase (4 KiB)
pub const SECTOR_ERASE: u8 = 0x20;
/// Block Erase (32 KiB)
pub const BLOCK_ERASE_32K: u8 = 0x52;
/// Block Erase (64 KiB)
pub const BLOCK_ERASE_64K: u8 = 0xD8;
/// Chip Erase
pub const CHIP_ERASE: u8 = 0xC7;
/// Chip Erase (alternate opcode)
pub const CHIP_ERASE_ALT: u8 = 0x60;
/// Erase/Program Suspend
pub const ERASE_PROGRAM_SUSPEND: u8 = 0x75;
/// Erase/Program Resume
pub const ERASE_PROGRAM_RESUME: u8 = 0x7A;

// ============================================================================
// Power
// ============================================================================

/// Deep Power-Down
pub const POWER_DOWN: u8 = 0xB9;
/// Release from Deep Power-Down / Device ID
pub const RELEASE_POWER_DOWN: u8 = 0xAB;

// ============================================================================
// Reads
// ============================================================================

/// Read Data (3-byte address)
pub const READ_DATA: u8 = 0x03;
/// Fast Read (3-byte address + dummy byte)
pub const FAST_READ: u8 = 0x0B;

// ============================================================================
// Identification
// ============================================================================

/// Manufacturer/Device ID
pub const DEVICE_ID: u8 = 0x90;
/// JEDEC ID (manufacturer + memory type + capacity)
pub const JEDEC_ID: u8 = 0x9F;
/// Read Unique ID
pub const READ_UNIQUE_ID: u8 = 0x4B;
/// Read SFDP Register
pub const READ_SFDP: u8 = 0x5A;

// ============================================================================
// Security registers
// ============================================================================

/// Erase Security Register
pub const ERASE_SECURITY_REG: u8 = 0x42;
/// Read Security Register
pub const READ_SECURITY_REG: u8 = 0x48;

// ============================================================================
// Mode / reset
// ============================================================================

/// Enable QPI mode
pub const ENABLE_QPI: u8 = 0x38;
/// Enable Reset - must precede RESET
pub const ENABLE_RESET: u8 = 0x66;
/// Reset Device
pub const RESET: u8 = 0x99;

/// Returns a short mnemonic for a known opcode.
pub fn opcode_name(opcode: u8) -> Option<&'static str> {
    let name = match opcode {
        WRITE_ENABLE => "WREN",
        VOLATILE_SR_WRITE_ENABLE => "VWREN",
        WRITE_DISABLE => "WRDI",
        READ_STATUS_REG1 => "RDSR1",
        READ_STATUS_REG2 => "RDSR2",
        WRITE_STATUS_REG => "WRSR",
        PAGE_PROGRAM => "PP",
        SECTOR_ERASE => "SE",
        BLOCK_ERASE_32K => "BE32",
        BLOCK_ERASE_64K => "BE64",
        CHIP_ERASE => "CE",
        CHIP_ERASE_ALT => "CE_ALT",
        ERASE_PROGRAM_SUSPEND => "SUSPEND",
        ERASE_PROGRAM_RESUME => "RESUME",
        POWER_DOWN => "DP",
        RELEASE_POWER_DOWN => "RDP",
        READ_DATA => "READ",
        FAST_READ => "FAST_READ",
        DEVICE_ID => "REMS",
        JEDEC_ID => "RDID",
        READ_UNIQUE_ID => "RUID",
        READ_SFDP => "RDSFDP",
        ERASE_SECURITY_REG => "ERSCUR",
        READ_SECURITY_REG => "RDSCUR",
        ENABLE_QPI => "EQPI",
        ENABLE_RESET => "RSTEN",
        RESET => "RST",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_names() {
        assert_eq!(opcode_name(JEDEC_ID), Some("RDID"));
        assert_eq!(opcode_name(READ_DATA), Some("READ"));
        assert_eq!(opcode_name(CHIP_ERASE_ALT), Some("CE_ALT"));
        assert_eq!(opcode_name(0xFE), None);
    }
}
