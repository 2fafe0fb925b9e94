use crate::checksum::xor_checksum;
use crate::error::TransportError;

/// First byte of every frame.
pub const MESSAGE_START: u8 = 0x1B;
/// Separator between the header and the payload.
pub const TOKEN: u8 = 0x0E;
/// Start, sequence, two length bytes and token.
pub const HEADER_LEN: usize = 5;

pub struct Frame<'a> {
    pub sequence: u8,
    pub payload: &'a [u8],
}

impl Frame<'_> {
    /// Build the raw frame sent to the programmer.
    /// Layout (payload.len() + 6 bytes total):
    /// [0]     MESSAGE_START
    /// [1]     sequence
    /// [2..4)  payload length, big-endian
    /// [4]     TOKEN
    /// [5..n)  payload
    /// [n]     XOR of every preceding byte
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        let len = u16::try_from(self.payload.len()).map_err(|_| {
            TransportError::PayloadTooLarge {
                len: self.payload.len(),
            }
        })?;

        let mut frame = Vec::with_capacity(HEADER_LEN + self.payload.len() + 1);
        frame.push(MESSAGE_START);
        frame.push(self.sequence);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.push(TOKEN);
        frame.extend_from_slice(self.payload);
        frame.push(xor_checksum(&frame));

        Ok(frame)
    }
}
