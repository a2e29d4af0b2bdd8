//! spibridge-cli - Command-line interface for SPI flash bridges
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use spibridge_client::{BridgeAddr, Client, ConnectionConfig};
use spibridge_emu::{spawn_duplex, EmulatedFlash, FlashConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spibridge-cli")]
#[command(about = "Drive a SPI flash chip through a serial bridge")]
#[command(version)]
struct Cli {
    /// Bridge address (host:port, tcp:host:port or unix:/path)
    #[arg(short, long, env = "SPIBRIDGE_ADDR", default_value = "127.0.0.1:7420")]
    addr: String,

    /// Response timeout in milliseconds (0 waits forever)
    #[arg(short, long, env = "SPIBRIDGE_TIMEOUT_MS", default_value_t = 30_000)]
    timeout_ms: u64,

    /// Talk to an in-process emulated chip instead of a bridge
    #[arg(long)]
    emulate: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start interactive REPL
    Repl,

    /// Read the JEDEC id
    Id,

    /// Read both status registers
    Status,

    /// Read the factory unique id
    Uid,

    /// Dump the start of the SFDP table
    Sfdp {
        /// Bytes to read
        #[arg(short, long, default_value_t = 16)]
        len: u16,
    },

    /// Read flash contents
    Read {
        /// Start address (decimal or 0x-prefixed hex)
        addr: String,

        /// Number of bytes (suffixes K and M accepted)
        len: String,

        /// Write raw bytes to this file instead of printing a hex dump
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Use FAST_READ
        #[arg(long)]
        fast: bool,
    },

    /// Program data (hex bytes, or @file for a file's contents)
    Program {
        /// Start address
        addr: String,

        /// Hex string such as `deadbeef`, or `@path`
        data: String,
    },

    /// Erase a region
    Erase {
        /// Any address inside the region
        #[arg(default_value = "0")]
        addr: String,

        /// Region size
        #[arg(short, long, value_enum, default_value_t = EraseSize::Sector)]
        size: EraseSize,
    },

    /// Send an arbitrary command
    Raw {
        /// Opcode byte
        opcode: String,

        /// Write payload as hex
        #[arg(short, long)]
        write: Option<String>,

        /// Bytes to read back
        #[arg(short, long, default_value_t = 0)]
        read: u16,

        /// Ask the bridge to wait for the chip to go idle
        #[arg(long)]
        wait_busy: bool,
    },

    /// Software reset
    Reset,

    /// Enter deep power-down
    Sleep,

    /// Release from deep power-down
    Wake,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseSize {
    #[value(name = "4k")]
    Sector,
    #[value(name = "32k")]
    Block32,
    #[value(name = "64k")]
    Block64,
    Chip,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let addr = BridgeAddr::parse(&cli.addr)?;
    let mut config = ConnectionConfig::new(addr);
    config = if cli.timeout_ms == 0 {
        config.without_request_timeout()
    } else {
        config.with_request_timeout(Duration::from_millis(cli.timeout_ms))
    };
    let client = Client::new(config);

    let target = if cli.emulate {
        client
            .attach(spawn_duplex(EmulatedFlash::new(FlashConfig::default())))
            .await;
        "emulated chip".to_string()
    } else {
        client.connect().await.map_err(|e| {
            eprintln!("{}: {}", "Connection failed".red(), e);
            e
        })?;
        cli.addr.clone()
    };

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(&client, &target).await?;
        }
        Some(cmd) => match commands::execute(&client, cmd).await {
            Ok(output) => {
                if !output.is_empty() {
                    println!("{}", output);
                }
            }
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                let _ = client.close().await;
                std::process::exit(1);
            }
        },
    }

    client.close().await?;
    Ok(())
}
