use thiserror::Error;

use crate::transport::{Mismatch, RecvState};

/// Errors raised while exchanging a frame with the programmer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A read returned fewer bytes than the current state needed before the
    /// read timeout elapsed.
    #[error("timed out in {state:?}: expected {expected} bytes, received {received}")]
    Timeout {
        state: RecvState,
        expected: usize,
        received: usize,
    },

    /// Too many framing mismatches in one receive attempt.
    #[error("gave up after {retries} framing retries (last: {last})")]
    RetriesExhausted { retries: u32, last: Mismatch },

    /// The payload does not fit in the 16-bit length field.
    #[error("payload too large ({len} bytes, max {max})", max = u16::MAX)]
    PayloadTooLarge { len: usize },

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True for the kinds that mean the hardware is not answering properly,
    /// as opposed to a local I/O or usage problem.
    pub fn is_unresponsive(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. } | TransportError::RetriesExhausted { .. }
        )
    }
}

/// Errors raised while decoding Intel-HEX text. `line` is 1-based.
#[derive(Debug, Error)]
pub enum HexError {
    #[error("line {line}: {reason}: {content:?}")]
    Format {
        line: usize,
        content: String,
        reason: &'static str,
    },

    #[error("line {line}: checksum failed (sum 0x{computed:02X}): {content:?}")]
    Checksum {
        line: usize,
        content: String,
        computed: u8,
    },

    #[error("line {line}: unsupported record type 0x{record_type:02X}")]
    UnsupportedRecord { line: usize, record_type: u8 },

    #[error("hex file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the STK500v2 command helpers.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The answer did not echo the command id or was too short.
    #[error("unexpected answer to command 0x{command:02X}: {answer:02X?}")]
    UnexpectedAnswer { command: u8, answer: Vec<u8> },

    #[error("command 0x{command:02X} failed with status 0x{status:02X}")]
    Failed { command: u8, status: u8 },
}
