//! STK500v2 command vocabulary (Atmel AVR068).
//!
//! The transport carries these as opaque payload bytes; the values must match
//! what real programmer hardware expects.

use std::time::Duration;

use tracing::debug;

use crate::error::CommandError;
use crate::transport::{ByteStream, Transport};

pub type Result<T> = std::result::Result<T, CommandError>;

// General commands
pub const CMD_SIGN_ON: u8 = 0x01;
pub const CMD_SET_PARAMETER: u8 = 0x02;
pub const CMD_GET_PARAMETER: u8 = 0x03;
pub const CMD_SET_DEVICE_PARAMETERS: u8 = 0x04;
pub const CMD_OSCCAL: u8 = 0x05;
pub const CMD_LOAD_ADDRESS: u8 = 0x06;
pub const CMD_FIRMWARE_UPGRADE: u8 = 0x07;

// ISP commands
pub const CMD_ENTER_PROGMODE_ISP: u8 = 0x10;
pub const CMD_LEAVE_PROGMODE_ISP: u8 = 0x11;
pub const CMD_CHIP_ERASE_ISP: u8 = 0x12;
pub const CMD_PROGRAM_FLASH_ISP: u8 = 0x13;
pub const CMD_READ_FLASH_ISP: u8 = 0x14;
pub const CMD_PROGRAM_EEPROM_ISP: u8 = 0x15;
pub const CMD_READ_EEPROM_ISP: u8 = 0x16;
pub const CMD_PROGRAM_FUSE_ISP: u8 = 0x17;
pub const CMD_READ_FUSE_ISP: u8 = 0x18;
pub const CMD_PROGRAM_LOCK_ISP: u8 = 0x19;
pub const CMD_READ_LOCK_ISP: u8 = 0x1A;
pub const CMD_READ_SIGNATURE_ISP: u8 = 0x1B;
pub const CMD_READ_OSCCAL_ISP: u8 = 0x1C;
pub const CMD_SPI_MULTI: u8 = 0x1D;

// Status codes
pub const STATUS_CMD_OK: u8 = 0x00;
pub const STATUS_CMD_TOUT: u8 = 0x80;
pub const STATUS_RDY_BSY_TOUT: u8 = 0x81;
pub const STATUS_SET_PARAM_MISSING: u8 = 0x82;
pub const STATUS_CMD_FAILED: u8 = 0xC0;
pub const STATUS_CKSUM_ERROR: u8 = 0xC1;
pub const STATUS_CMD_UNKNOWN: u8 = 0xC9;

/// Answer id sent by the programmer when it received a corrupt frame.
pub const ANSWER_CKSUM_ERROR: u8 = 0xB0;

// Parameters
pub const PARAM_BUILD_NUMBER_LOW: u8 = 0x80;
pub const PARAM_BUILD_NUMBER_HIGH: u8 = 0x81;
pub const PARAM_HW_VER: u8 = 0x90;
pub const PARAM_SW_MAJOR: u8 = 0x91;
pub const PARAM_SW_MINOR: u8 = 0x92;
pub const PARAM_VTARGET: u8 = 0x94;
pub const PARAM_VADJUST: u8 = 0x95;
pub const PARAM_OSC_PSCALE: u8 = 0x96;
pub const PARAM_OSC_CMATCH: u8 = 0x97;
pub const PARAM_SCK_DURATION: u8 = 0x98;
pub const PARAM_TOPCARD_DETECT: u8 = 0x9A;
pub const PARAM_STATUS: u8 = 0x9C;
pub const PARAM_DATA: u8 = 0x9D;
pub const PARAM_RESET_POLARITY: u8 = 0x9E;
pub const PARAM_CONTROLLER_INIT: u8 = 0x9F;

/// Send `request` (command id first) and check that the answer echoes the
/// command id followed by `STATUS_CMD_OK`. Returns the bytes after the status.
pub fn execute<S: ByteStream>(
    transport: &mut Transport<S>,
    sequence: u8,
    request: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>> {
    let command = request.first().copied().unwrap_or_default();
    let answer = transport.send_and_receive(sequence, request, timeout)?;

    if let [id, status, rest @ ..] = answer.as_slice() {
        if *id == command {
            if *status == STATUS_CMD_OK {
                return Ok(rest.to_vec());
            }
            debug!(command, status, "command failed");
            return Err(CommandError::Failed {
                command,
                status: *status,
            });
        }
    }
    Err(CommandError::UnexpectedAnswer { command, answer })
}

/// Ask the programmer for its signature string, e.g. `AVRISP_2`.
pub fn sign_on<S: ByteStream>(
    transport: &mut Transport<S>,
    sequence: u8,
    timeout: Duration,
) -> Result<String> {
    let body = execute(transport, sequence, &[CMD_SIGN_ON], timeout)?;
    if let Some((&len, signature)) = body.split_first() {
        if let Some(signature) = signature.get(..usize::from(len)) {
            return Ok(String::from_utf8_lossy(signature).into_owned());
        }
    }
    Err(CommandError::UnexpectedAnswer {
        command: CMD_SIGN_ON,
        answer: body,
    })
}

/// Read a single programmer parameter.
pub fn get_parameter<S: ByteStream>(
    transport: &mut Transport<S>,
    sequence: u8,
    parameter: u8,
    timeout: Duration,
) -> Result<u8> {
    let body = execute(transport, sequence, &[CMD_GET_PARAMETER, parameter], timeout)?;
    match body.first() {
        Some(&value) => Ok(value),
        None => Err(CommandError::UnexpectedAnswer {
            command: CMD_GET_PARAMETER,
            answer: body,
        }),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transport::tests::{ScriptedStream, frame};

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn sign_on_returns_signature() {
        let answer = frame(1, b"\x01\x00\x08AVRISP_2");
        let mut transport = Transport::new(ScriptedStream::new(answer));

        let signature = sign_on(&mut transport, 1, TIMEOUT).unwrap();

        assert_eq!(signature, "AVRISP_2");
        assert_eq!(transport.get_ref().written, frame(1, &[CMD_SIGN_ON]));
    }

    #[test]
    fn get_parameter_returns_value() {
        let answer = frame(2, &[CMD_GET_PARAMETER, STATUS_CMD_OK, 0x0A]);
        let mut transport = Transport::new(ScriptedStream::new(answer));

        let value = get_parameter(&mut transport, 2, PARAM_SW_MAJOR, TIMEOUT).unwrap();

        assert_eq!(value, 0x0A);
        assert_eq!(
            transport.get_ref().written,
            frame(2, &[CMD_GET_PARAMETER, PARAM_SW_MAJOR])
        );
    }

    #[test]
    fn failed_status_is_reported() {
        let answer = frame(3, &[CMD_ENTER_PROGMODE_ISP, STATUS_CMD_FAILED]);
        let mut transport = Transport::new(ScriptedStream::new(answer));

        let result = execute(&mut transport, 3, &[CMD_ENTER_PROGMODE_ISP], TIMEOUT);

        assert_matches!(
            result,
            Err(CommandError::Failed {
                command: CMD_ENTER_PROGMODE_ISP,
                status: STATUS_CMD_FAILED,
            })
        );
    }

    #[test]
    fn checksum_answer_is_unexpected() {
        let answer = frame(4, &[ANSWER_CKSUM_ERROR, STATUS_CKSUM_ERROR]);
        let mut transport = Transport::new(ScriptedStream::new(answer));

        let result = execute(&mut transport, 4, &[CMD_SIGN_ON], TIMEOUT);

        assert_matches!(
            result,
            Err(CommandError::UnexpectedAnswer { command: CMD_SIGN_ON, answer })
                if answer == vec![ANSWER_CKSUM_ERROR, STATUS_CKSUM_ERROR]
        );
    }

    #[test]
    fn truncated_signature_is_unexpected() {
        let answer = frame(1, b"\x01\x00\x08AVR");
        let mut transport = Transport::new(ScriptedStream::new(answer));

        let result = sign_on(&mut transport, 1, TIMEOUT);

        assert_matches!(result, Err(CommandError::UnexpectedAnswer { .. }));
    }

    #[test]
    fn transport_errors_pass_through() {
        let mut transport = Transport::new(ScriptedStream::new(Vec::new()));

        let result = sign_on(&mut transport, 1, TIMEOUT);

        assert_matches!(result, Err(CommandError::Transport(e)) if e.is_unresponsive());
    }
}
