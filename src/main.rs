use std::num::NonZeroU8;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::info;

use stkflash::command::{PARAM_HW_VER, PARAM_SW_MAJOR, PARAM_SW_MINOR, get_parameter, sign_on};
use stkflash::hex::DEFAULT_LINE_SIZE;
use stkflash::logging::{LogFormat, LogLevel, init_logging};
use stkflash::{CommandError, DecodeOptions, HexError, HexImage, Transport, UnsupportedRecords};

#[derive(Parser, Debug)]
#[command(name = "stkflash", about = "STK500v2 programmer client and Intel-HEX tool")]
struct Args {
    #[arg(
        long,
        value_enum,
        env = "STKFLASH_LOG_LEVEL",
        default_value = "warn",
        global = true
    )]
    log_level: LogLevel,

    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode one or more HEX files into a single image and re-encode it.
    Merge {
        /// Input files, each optionally placed at an offset (e.g. boot.hex@0x1E000)
        #[arg(value_name = "FILE[@OFFSET]", required = true)]
        inputs: Vec<HexInput>,

        /// Data bytes per output line
        #[arg(long, value_name = "N", default_value_t = DEFAULT_LINE_SIZE)]
        line_size: NonZeroU8,

        /// Write to this file instead of stdout
        #[arg(long, short, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Fail on record types other than data, EOF and extended address
        #[arg(long)]
        strict: bool,
    },

    /// Print size information about a HEX file.
    Info {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Sign on to the programmer and print its identity.
    SignOn {
        /// Serial port path
        #[arg(
            long,
            value_name = "PORT",
            env = "STKFLASH_PORT",
            default_value = "/dev/ttyACM0"
        )]
        port: String,

        #[arg(
            long,
            value_name = "BAUD",
            env = "STKFLASH_BAUD",
            default_value_t = 115_200u32
        )]
        baud: u32,

        /// Sequence number of the first request; later requests count up from it
        #[arg(long, value_name = "SEQ", default_value_t = 1u8)]
        sequence: u8,

        /// Per-read timeout in milliseconds
        #[arg(
            long,
            value_name = "MS",
            env = "STKFLASH_TIMEOUT_MS",
            default_value_t = 1000u64
        )]
        timeout_ms: u64,
    },
}

/// A HEX file path with an optional load offset.
#[derive(Clone, Debug)]
struct HexInput {
    path: PathBuf,
    offset: usize,
}

impl FromStr for HexInput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((path, offset)) = s.rsplit_once('@') else {
            return Ok(Self {
                path: s.into(),
                offset: 0,
            });
        };
        let parsed = match offset.strip_prefix("0x").or_else(|| offset.strip_prefix("0X")) {
            Some(digits) => usize::from_str_radix(digits, 16),
            None => offset.parse(),
        };
        let offset = parsed.map_err(|e| format!("invalid offset `{offset}`: {e}"))?;
        Ok(Self {
            path: path.into(),
            offset,
        })
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("corrupt firmware image: {0}")]
    Hex(#[from] HexError),

    #[error("{0}")]
    Command(#[from] CommandError),

    #[error("failed to open serial port: {0}")]
    Serial(#[from] serialport::Error),
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_format, args.log_level);

    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Command(CommandError::Transport(e))) if e.is_unresponsive() => {
            eprintln!("error: programmer not responding: {e}");
            eprintln!("Check that the programmer is plugged in and the correct port is selected.");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}

fn run(command: Command) -> Result<(), CliError> {
    match command {
        Command::Merge {
            inputs,
            line_size,
            output,
            strict,
        } => {
            let options = DecodeOptions {
                unsupported: if strict {
                    UnsupportedRecords::Reject
                } else {
                    UnsupportedRecords::Ignore
                },
            };

            let mut image = HexImage::new();
            for input in &inputs {
                info!(path = %input.path.display(), offset = input.offset, "loading");
                image.load_with(&input.path, input.offset, options)?;
            }

            match output {
                Some(path) => {
                    image.save(&path, line_size)?;
                    println!("Wrote {} bytes to '{}'", image.len(), path.display());
                }
                None => print!("{}", image.encode(line_size)),
            }
        }

        Command::Info { file } => {
            let mut image = HexImage::new();
            image.load(&file, 0)?;
            println!("File:      {}", file.display());
            println!("Length:    {} bytes (0x{:X})", image.len(), image.len());
            println!("Populated: {} bytes", image.populated());
        }

        Command::SignOn {
            port,
            baud,
            sequence,
            timeout_ms,
        } => {
            let timeout = Duration::from_millis(timeout_ms);
            let serial = serialport::new(&port, baud).timeout(timeout).open()?;
            let mut transport = Transport::new(serial);

            println!("Signing on to programmer at {} ({} baud)...", port, baud);
            let signature = sign_on(&mut transport, sequence, timeout)?;
            println!("Signature: {}", signature);

            let hw = get_parameter(&mut transport, sequence.wrapping_add(1), PARAM_HW_VER, timeout)?;
            let major =
                get_parameter(&mut transport, sequence.wrapping_add(2), PARAM_SW_MAJOR, timeout)?;
            let minor =
                get_parameter(&mut transport, sequence.wrapping_add(3), PARAM_SW_MINOR, timeout)?;
            println!("Hardware:  {}", hw);
            println!("Firmware:  {}.{:02}", major, minor);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_input_without_offset() {
        let input: HexInput = "firmware.hex".parse().unwrap();
        assert_eq!(input.path, PathBuf::from("firmware.hex"));
        assert_eq!(input.offset, 0);
    }

    #[test]
    fn hex_input_with_hex_and_decimal_offsets() {
        let input: HexInput = "boot.hex@0x1E000".parse().unwrap();
        assert_eq!(input.path, PathBuf::from("boot.hex"));
        assert_eq!(input.offset, 0x1E000);

        let input: HexInput = "boot.hex@256".parse().unwrap();
        assert_eq!(input.offset, 256);
    }

    #[test]
    fn hex_input_rejects_bad_offset() {
        assert!("boot.hex@0xZZ".parse::<HexInput>().is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
