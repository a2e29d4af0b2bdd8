//! Command execution.

use crate::{Commands, EraseSize};
use colored::Colorize;
use spibridge_client::client::PAGE_SIZE;
use spibridge_client::Client;
use spibridge_protocol::Command;

pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl => Ok(String::new()),

        Commands::Id => {
            let id = client.read_jedec_id().await?;
            let capacity = id
                .capacity_bytes()
                .map(format_bytes)
                .unwrap_or_else(|| "unknown size".to_string());
            Ok(format!("JEDEC id {} ({})", id.to_string().cyan(), capacity))
        }

        Commands::Status => {
            let sr1 = client.read_status().await?;
            let sr2 = client.read_status2().await?;
            let mut flags = Vec::new();
            if sr1 & 0x01 != 0 {
                flags.push("BUSY");
            }
            if sr1 & 0x02 != 0 {
                flags.push("WEL");
            }
            Ok(format!(
                "SR1 {:#04x} [{}]  SR2 {:#04x}",
                sr1,
                flags.join(" "),
                sr2
            ))
        }

        Commands::Uid => {
            let uid = client.read_unique_id().await?;
            Ok(hex::encode_upper(uid).cyan().to_string())
        }

        Commands::Sfdp { len } => {
            let data = client.read_sfdp(0, len).await?;
            Ok(hexdump(0, &data))
        }

        Commands::Read {
            addr,
            len,
            output,
            fast,
        } => {
            let addr = parse_u32(&addr)?;
            let len = parse_len(&len)?;
            let data = if fast {
                client.fast_read(addr, len).await?
            } else {
                client.read_data(addr, len).await?
            };

            match output {
                Some(path) => {
                    std::fs::write(&path, &data)?;
                    Ok(format!(
                        "{} {} to {}",
                        "Wrote".green(),
                        format_bytes(data.len() as u64),
                        path.display()
                    ))
                }
                None => Ok(hexdump(addr, &data)),
            }
        }

        Commands::Program { addr, data } => {
            let addr = parse_u32(&addr)?;
            let data = parse_data(&data)?;
            if data.is_empty() {
                return Err("nothing to program".into());
            }

            // Never let a chunk cross a page boundary; the chip would wrap.
            let mut offset = 0usize;
            while offset < data.len() {
                let at = addr + offset as u32;
                let room = PAGE_SIZE - (at as usize % PAGE_SIZE);
                let chunk = room.min(data.len() - offset);
                client.write_enable().await?;
                client.page_program(at, &data[offset..offset + chunk]).await?;
                offset += chunk;
            }

            Ok(format!(
                "{} {} at {:#08x}",
                "Programmed".green(),
                format_bytes(data.len() as u64),
                addr
            ))
        }

        Commands::Erase { addr, size } => {
            let addr = parse_u32(&addr)?;
            client.write_enable().await?;
            let what = match size {
                EraseSize::Sector => {
                    client.sector_erase(addr).await?;
                    format!("4 KiB sector at {:#08x}", addr & !0xFFF)
                }
                EraseSize::Block32 => {
                    client.block_erase_32k(addr).await?;
                    format!("32 KiB block at {:#08x}", addr & !0x7FFF)
                }
                EraseSize::Block64 => {
                    client.block_erase_64k(addr).await?;
                    format!("64 KiB block at {:#08x}", addr & !0xFFFF)
                }
                EraseSize::Chip => {
                    client.chip_erase().await?;
                    "whole chip".to_string()
                }
            };
            Ok(format!("{} {}", "Erased".green(), what))
        }

        Commands::Raw {
            opcode,
            write,
            read,
            wait_busy,
        } => {
            let opcode = parse_u8(&opcode)?;
            let mut command = Command::read(opcode, read);
            if let Some(write) = write {
                command = command.with_write_data(parse_hex(&write)?);
            }
            if wait_busy {
                command = command.with_wait_busy();
            }

            let data = client.raw(&command).await?;
            if data.is_empty() {
                Ok("OK".green().to_string())
            } else {
                Ok(hexdump(0, &data))
            }
        }

        Commands::Reset => {
            client.reset().await?;
            Ok(format!("{}", "Reset".green()))
        }

        Commands::Sleep => {
            client.power_down().await?;
            Ok(format!("{}", "Powered down".green()))
        }

        Commands::Wake => {
            client.release_power_down().await?;
            Ok(format!("{}", "Released from power-down".green()))
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 && bytes % (1024 * 1024) == 0 {
        format!("{} MiB", bytes / (1024 * 1024))
    } else if bytes >= 1024 && bytes % 1024 == 0 {
        format!("{} KiB", bytes / 1024)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Classic 16-bytes-per-line dump with an ASCII column.
pub fn hexdump(base: u32, data: &[u8]) -> String {
    let mut out = String::new();
    for (i, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| hex::encode([*b])).collect();
        let ascii: String = line
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        out.push_str(&format!(
            "{}  {:<47}  |{}|\n",
            format!("{:08x}", base as usize + i * 16).dimmed(),
            hex.join(" "),
            ascii
        ));
    }
    out.pop();
    out
}

pub fn parse_u32(s: &str) -> Result<u32, Box<dyn std::error::Error>> {
    let s = s.trim();
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => s.parse()?,
    };
    Ok(value)
}

fn parse_u8(s: &str) -> Result<u8, Box<dyn std::error::Error>> {
    let value = parse_u32(s)?;
    u8::try_from(value).map_err(|_| format!("'{}' does not fit in a byte", s).into())
}

/// Lengths accept `K` / `M` suffixes.
pub fn parse_len(s: &str) -> Result<usize, Box<dyn std::error::Error>> {
    let s = s.trim();
    let (num, mul) = match s.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some('K') => (&s[..s.len() - 1], 1024),
        Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    Ok(parse_u32(num)? as usize * mul)
}

fn parse_hex(s: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let cleaned: String = s
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    Ok(hex::decode(cleaned)?)
}

fn parse_data(arg: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    match arg.strip_prefix('@') {
        Some(path) => Ok(std::fs::read(path)?),
        None => parse_hex(arg),
    }
}
