//! Library for talking to STK500v2 AVR programmers.
//! Provides the framed request/response transport, the programmer command
//! vocabulary and an Intel-HEX image codec.

pub mod checksum;
pub mod command;
pub mod error;
pub mod frame;
pub mod hex;
pub mod logging;
pub mod transport;

pub use error::{CommandError, HexError, TransportError};
pub use hex::{DecodeOptions, HexImage, UnsupportedRecords};
pub use transport::{ByteStream, MAX_RETRIES, Transport};
