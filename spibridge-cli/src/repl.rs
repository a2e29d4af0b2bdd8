//! Interactive REPL.

use crate::commands;
use crate::{Commands, EraseSize};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use spibridge_client::Client;
use std::path::PathBuf;

const HELP_TEXT: &str = r#"
Available commands:
  help                            Show this help

  id                              Read the JEDEC id
  status                          Read status registers
  uid                             Read the unique id
  sfdp [len]                      Dump the SFDP header

  read <addr> <len>               Hex dump flash contents
  fread <addr> <len>              Same, using FAST_READ
  program <addr> <hex>            Program bytes (write enable is automatic)
  erase <addr> [4k|32k|64k|chip]  Erase a region

  wren, wrdi                      Set / clear the write enable latch
  raw <opcode> [hex] [read_len]   Send an arbitrary command
  reset                           Software reset
  sleep, wake                     Enter / leave deep power-down

  quit, exit                      Exit the REPL
"#;

enum Line {
    Command(Commands),
    WriteEnable,
    WriteDisable,
    Help,
    Usage(&'static str),
    Quit,
}

pub async fn run(client: &Client, target: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "spibridge CLI".bold().cyan());
    println!("{} {}", "Connected to".green(), target);

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = history_path();
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "spi>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(client, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }

                if !client.is_connected() {
                    println!("{}", "Bridge connection lost.".red());
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    println!("{}", "Disconnected.".dimmed());
    Ok(())
}

fn history_path() -> PathBuf {
    home::home_dir()
        .map(|h| h.join(".spibridge_history"))
        .unwrap_or_else(|| ".spibridge_history".into())
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    match parse_line(line) {
        Line::Quit => Ok(None),
        Line::Help => Ok(Some(HELP_TEXT.to_string())),
        Line::Usage(usage) => Ok(Some(format!("Usage: {}", usage))),
        Line::WriteEnable => {
            client.write_enable().await?;
            Ok(Some("WEL set".green().to_string()))
        }
        Line::WriteDisable => {
            client.write_disable().await?;
            Ok(Some("WEL cleared".green().to_string()))
        }
        Line::Command(cmd) => commands::execute(client, cmd).await.map(Some),
    }
}

fn parse_line(line: &str) -> Line {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((cmd, args)) = parts.split_first() else {
        return Line::Help;
    };
    let arg = |i: usize| args.get(i).map(|s| s.to_string());

    match cmd.to_lowercase().as_str() {
        "help" | "?" => Line::Help,
        "quit" | "exit" | "q" => Line::Quit,

        "id" | "rdid" => Line::Command(Commands::Id),
        "status" | "rdsr" => Line::Command(Commands::Status),
        "uid" => Line::Command(Commands::Uid),
        "sfdp" => match arg(0).map(|s| s.parse::<u16>()) {
            None => Line::Command(Commands::Sfdp { len: 16 }),
            Some(Ok(len)) => Line::Command(Commands::Sfdp { len }),
            Some(Err(_)) => Line::Usage("sfdp [len]"),
        },

        name @ ("read" | "fread") => match (arg(0), arg(1)) {
            (Some(addr), Some(len)) => Line::Command(Commands::Read {
                addr,
                len,
                output: None,
                fast: name == "fread",
            }),
            _ => Line::Usage("read <addr> <len>"),
        },

        "program" | "pp" => match (arg(0), args.get(1..)) {
            (Some(addr), Some(rest)) if !rest.is_empty() => Line::Command(Commands::Program {
                addr,
                data: rest.concat(),
            }),
            _ => Line::Usage("program <addr> <hex>"),
        },

        "erase" => {
            let size = match arg(1).as_deref().map(str::to_lowercase).as_deref() {
                None | Some("4k") => EraseSize::Sector,
                Some("32k") => EraseSize::Block32,
                Some("64k") => EraseSize::Block64,
                Some("chip") => EraseSize::Chip,
                Some(_) => return Line::Usage("erase <addr> [4k|32k|64k|chip]"),
            };
            match arg(0) {
                Some(addr) => Line::Command(Commands::Erase { addr, size }),
                None => Line::Usage("erase <addr> [4k|32k|64k|chip]"),
            }
        }

        "wren" => Line::WriteEnable,
        "wrdi" => Line::WriteDisable,

        "raw" => {
            let Some(opcode) = arg(0) else {
                return Line::Usage("raw <opcode> [hex] [read_len]");
            };
            let read = match arg(2).map(|s| s.parse::<u16>()) {
                None => 0,
                Some(Ok(n)) => n,
                Some(Err(_)) => return Line::Usage("raw <opcode> [hex] [read_len]"),
            };
            Line::Command(Commands::Raw {
                opcode,
                write: arg(1).filter(|w| w != "-"),
                read,
                wait_busy: false,
            })
        }

        "reset" => Line::Command(Commands::Reset),
        "sleep" => Line::Command(Commands::Sleep),
        "wake" => Line::Command(Commands::Wake),

        _ => Line::Usage("unknown command, type 'help'"),
    }
}
