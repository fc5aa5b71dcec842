//! Exception response translation
//!
//! An exception response is a PDU whose function code has the high bit set,
//! followed by exactly one exception code byte. Exceptions are terminal: the
//! slave actively processed and rejected the request.

use std::fmt;

use tracing::debug;

use crate::constants::EXCEPTION_OFFSET;
use crate::error::{ModbusError, ModbusResult};

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusException {
    /// 0x01: function not implemented or not allowed in the current state
    IllegalFunction,
    /// 0x02: reference does not exist or range exceeds the register bounds
    IllegalDataAddress,
    /// 0x03: structural fault in the request values
    IllegalDataValue,
    /// 0x04: unrecoverable fault in the slave
    SlaveDeviceFailure,
    /// 0x05: accepted, long-running processing
    Acknowledge,
    /// 0x06: slave busy with an uninterruptible operation
    SlaveDeviceBusy,
    /// 0x07: slave cannot perform the requested program function
    NegativeAcknowledge,
    /// 0x08: parity error in extended memory
    MemoryParityError,
    /// 0x0A: gateway could not allocate a path
    GatewayPathUnavailable,
    /// 0x0B: gateway target failed to respond
    GatewayTargetNoResponse,
    /// Any code outside the table
    Unknown(u8),
}

impl ModbusException {
    /// Map a wire code to its kind; unrecognised codes map to [`Self::Unknown`]
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::SlaveDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::SlaveDeviceBusy,
            0x07 => Self::NegativeAcknowledge,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetNoResponse,
            other => Self::Unknown(other),
        }
    }

    /// Wire code
    pub fn code(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::SlaveDeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::SlaveDeviceBusy => 0x06,
            Self::NegativeAcknowledge => 0x07,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetNoResponse => 0x0B,
            Self::Unknown(code) => code,
        }
    }

    /// Human-readable description
    pub fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal Function",
            Self::IllegalDataAddress => "Illegal Data Address",
            Self::IllegalDataValue => "Illegal Data Value",
            Self::SlaveDeviceFailure => "Slave Device Failure",
            Self::Acknowledge => "Acknowledge",
            Self::SlaveDeviceBusy => "Slave Device Busy",
            Self::NegativeAcknowledge => "Negative Acknowledge",
            Self::MemoryParityError => "Memory Parity Error",
            Self::GatewayPathUnavailable => "Gateway Path Unavailable",
            Self::GatewayTargetNoResponse => "Gateway Target Device Failed to Respond",
            Self::Unknown(_) => "Unknown Exception",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), self.code())
    }
}

/// Check whether a function code byte flags an exception
#[inline]
pub fn is_exception_code(function_code: u8) -> bool {
    function_code & EXCEPTION_OFFSET != 0
}

/// Classify a response PDU as normal or exception.
///
/// Returns `Ok(())` for a normal response and `Err(ModbusError::Exception)`
/// for an exception response. An exception PDU that is not exactly two bytes
/// long is a framing fault.
pub fn translate(pdu: &[u8]) -> ModbusResult<()> {
    let Some(&fc) = pdu.first() else {
        return Err(ModbusError::frame("Empty response PDU"));
    };

    if !is_exception_code(fc) {
        return Ok(());
    }

    if pdu.len() != 2 {
        return Err(ModbusError::frame(format!(
            "Exception response must be 2 bytes, got {}",
            pdu.len()
        )));
    }

    let function = fc & !EXCEPTION_OFFSET;
    let exception = ModbusException::from_code(pdu[1]);
    debug!("Exception response: FC={:02X}, {}", function, exception);
    Err(ModbusError::exception(function, exception))
}

/// Build an exception response PDU (slave side, tests)
pub fn exception_pdu(function: u8, exception: ModbusException) -> [u8; 2] {
    [function | EXCEPTION_OFFSET, exception.code()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_map_exactly() {
        let table = [
            (0x01, ModbusException::IllegalFunction),
            (0x02, ModbusException::IllegalDataAddress),
            (0x03, ModbusException::IllegalDataValue),
            (0x04, ModbusException::SlaveDeviceFailure),
            (0x06, ModbusException::SlaveDeviceBusy),
            (0x07, ModbusException::NegativeAcknowledge),
            (0x0B, ModbusException::GatewayTargetNoResponse),
        ];
        for (code, kind) in table {
            let err = translate(&[0x83, code]).unwrap_err();
            assert_eq!(err.exception_kind(), Some(kind));
            assert_eq!(kind.code(), code);
        }
    }

    #[test]
    fn test_unknown_code_is_catch_all() {
        let err = translate(&[0x81, 0x42]).unwrap_err();
        match err {
            ModbusError::Exception {
                function,
                exception,
            } => {
                assert_eq!(function, 0x01);
                assert_eq!(exception, ModbusException::Unknown(0x42));
            }
            other => panic!("expected exception, got {other:?}"),
        }
    }

    #[test]
    fn test_normal_response_passes() {
        assert!(translate(&[0x03, 0x02, 0x00, 0x01]).is_ok());
    }

    #[test]
    fn test_malformed_exception_is_frame_fault() {
        assert!(matches!(translate(&[0x83]), Err(ModbusError::Frame { .. })));
        assert!(matches!(
            translate(&[0x83, 0x02, 0x00]),
            Err(ModbusError::Frame { .. })
        ));
        assert!(matches!(translate(&[]), Err(ModbusError::Frame { .. })));
    }

    #[test]
    fn test_exception_pdu() {
        assert_eq!(
            exception_pdu(0x10, ModbusException::IllegalDataValue),
            [0x90, 0x03]
        );
    }

    #[test]
    fn test_every_code_decodes_without_fault() {
        for code in 0..=u8::MAX {
            let kind = ModbusException::from_code(code);
            assert_eq!(kind.code(), code);
        }
    }
}
