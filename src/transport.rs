//! Request/response exchange with an STK500v2 programmer.
//!
//! One call to [`Transport::send_and_receive`] writes a single frame and then
//! runs the receive state machine until it either collects a response frame
//! carrying the same sequence number, runs out of retries, or a read times
//! out. Framing noise (bytes before the start marker, a foreign sequence
//! number, a bad token or a bad checksum) sends the machine back to
//! [`RecvState::AwaitStart`] and costs one retry. A read that yields nothing
//! is never noise: it fails the call immediately.

use std::fmt;
use std::io::{self, ErrorKind};
use std::time::Duration;

use tracing::{debug, trace};

use crate::checksum::xor_checksum;
use crate::error::TransportError;
use crate::frame::{Frame, HEADER_LEN, MESSAGE_START, TOKEN};

pub type Result<T> = std::result::Result<T, TransportError>;

/// Framing mismatches tolerated within one receive attempt.
///
/// Every byte discarded while hunting for the start marker counts, including
/// the tail of a rejected frame. A stale answer for an earlier sequence with
/// a payload of 10 bytes or more therefore exhausts the budget on its own
/// before the matching answer is read.
pub const MAX_RETRIES: u32 = 10;

/// Duplex byte channel the engine talks through.
///
/// `read` returns however many bytes arrived before the read timeout
/// elapsed; `Ok(0)` and `ErrorKind::TimedOut` both mean nothing arrived.
pub trait ByteStream {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

impl ByteStream for Box<dyn serialport::SerialPort> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        io::Write::write_all(self.as_mut(), bytes)?;
        io::Write::flush(self.as_mut())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self.as_mut(), buf)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.as_mut().set_timeout(timeout)?;
        Ok(())
    }
}

impl<S: ByteStream + ?Sized> ByteStream for &mut S {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        (**self).set_read_timeout(timeout)
    }
}

/// Receive state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    AwaitStart,
    AwaitSequence,
    AwaitLength,
    AwaitToken,
    AwaitPayload,
    AwaitChecksum,
}

/// Why a receive attempt was restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mismatch {
    StartMarker { found: u8 },
    Sequence { expected: u8, actual: u8 },
    Token { found: u8 },
    /// XOR over the whole frame including the trailer; zero when valid.
    Checksum { residue: u8 },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::StartMarker { found } => {
                write!(f, "expected start marker 0x{MESSAGE_START:02X}, got 0x{found:02X}")
            }
            Mismatch::Sequence { expected, actual } => {
                write!(f, "expected sequence {expected}, got {actual}")
            }
            Mismatch::Token { found } => {
                write!(f, "expected token 0x{TOKEN:02X}, got 0x{found:02X}")
            }
            Mismatch::Checksum { residue } => {
                write!(f, "checksum mismatch (residue 0x{residue:02X})")
            }
        }
    }
}

enum Step {
    Continue,
    Restart(Mismatch),
    Done(Vec<u8>),
}

/// One receive attempt. Owns the bytes accumulated since the last start
/// marker; dropped when the call returns.
struct Receiver<'a, S: ?Sized> {
    stream: &'a mut S,
    sequence: u8,
    state: RecvState,
    frame: Vec<u8>,
    payload_len: usize,
    retries: u32,
}

impl<'a, S: ByteStream + ?Sized> Receiver<'a, S> {
    fn new(stream: &'a mut S, sequence: u8) -> Self {
        Self {
            stream,
            sequence,
            state: RecvState::AwaitStart,
            frame: Vec::with_capacity(HEADER_LEN + 1),
            payload_len: 0,
            retries: 0,
        }
    }

    fn run(mut self) -> Result<Vec<u8>> {
        loop {
            match self.step()? {
                Step::Continue => {}
                Step::Done(payload) => return Ok(payload),
                Step::Restart(mismatch) => {
                    self.retries += 1;
                    if self.retries > MAX_RETRIES {
                        return Err(TransportError::RetriesExhausted {
                            retries: self.retries,
                            last: mismatch,
                        });
                    }
                    debug!(retries = self.retries, %mismatch, "resynchronising");
                    self.state = RecvState::AwaitStart;
                }
            }
        }
    }

    fn step(&mut self) -> Result<Step> {
        match self.state {
            RecvState::AwaitStart => {
                self.frame.clear();
                let found = self.read_byte()?;
                if found != MESSAGE_START {
                    return Ok(Step::Restart(Mismatch::StartMarker { found }));
                }
                self.state = RecvState::AwaitSequence;
            }
            RecvState::AwaitSequence => {
                let actual = self.read_byte()?;
                if actual != self.sequence {
                    return Ok(Step::Restart(Mismatch::Sequence {
                        expected: self.sequence,
                        actual,
                    }));
                }
                self.state = RecvState::AwaitLength;
            }
            RecvState::AwaitLength => {
                self.fill(2)?;
                let n = self.frame.len();
                self.payload_len = u16::from_be_bytes([self.frame[n - 2], self.frame[n - 1]]).into();
                self.state = RecvState::AwaitToken;
            }
            RecvState::AwaitToken => {
                let found = self.read_byte()?;
                if found != TOKEN {
                    return Ok(Step::Restart(Mismatch::Token { found }));
                }
                self.state = RecvState::AwaitPayload;
            }
            RecvState::AwaitPayload => {
                self.fill(self.payload_len)?;
                self.state = RecvState::AwaitChecksum;
            }
            RecvState::AwaitChecksum => {
                self.read_byte()?;
                let residue = xor_checksum(&self.frame);
                if residue != 0 {
                    return Ok(Step::Restart(Mismatch::Checksum { residue }));
                }
                let payload = self.frame[HEADER_LEN..HEADER_LEN + self.payload_len].to_vec();
                return Ok(Step::Done(payload));
            }
        }
        Ok(Step::Continue)
    }

    fn read_byte(&mut self) -> Result<u8> {
        self.fill(1)?;
        Ok(self.frame[self.frame.len() - 1])
    }

    /// Append exactly `count` bytes from the stream to the frame.
    fn fill(&mut self, count: usize) -> Result<()> {
        let start = self.frame.len();
        self.frame.resize(start + count, 0);

        let mut received = 0;
        while received < count {
            match self.stream.read(&mut self.frame[start + received..]) {
                Ok(0) => return Err(self.timeout(count, received)),
                Ok(n) => received += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    return Err(self.timeout(count, received));
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }

        trace!(state = ?self.state, bytes = ?&self.frame[start..], "received");
        Ok(())
    }

    fn timeout(&self, expected: usize, received: usize) -> TransportError {
        debug!(state = ?self.state, expected, received, retries = self.retries, "read timed out");
        TransportError::Timeout {
            state: self.state,
            expected,
            received,
        }
    }
}

/// Frame transport over an exclusively owned byte stream.
///
/// The caller picks the sequence number for every exchange; nothing here
/// advances it.
pub struct Transport<S> {
    stream: S,
}

impl<S: ByteStream> Transport<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Send `payload` framed with `sequence` and wait for the response frame
    /// echoing that sequence. `timeout` applies to every read.
    pub fn send_and_receive(
        &mut self,
        sequence: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let raw = Frame { sequence, payload }.to_bytes()?;

        self.stream.set_read_timeout(timeout)?;
        debug!(sequence, len = payload.len(), "sending frame");
        trace!(bytes = ?raw, "sent");
        self.stream.write_all(&raw)?;

        let answer = Receiver::new(&mut self.stream, sequence).run()?;
        debug!(sequence, len = answer.len(), "received frame");
        Ok(answer)
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
