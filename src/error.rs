//! Error types for the Modbus master
//!
//! Errors fall into three disjoint families:
//!
//! | Family | Variants | Retried |
//! |--------|----------|---------|
//! | Local validation | `InvalidArgument`, `InvalidFunction`, `Configuration` | never |
//! | Transport / framing | `Timeout`, `Frame`, `Protocol`, `Connection`, `Io` | up to the retry budget |
//! | Protocol exception | `Exception` | never |
//!
//! Once the retry budget is spent the last transport fault is wrapped in
//! [`ModbusError::CommunicationFailure`].

use thiserror::Error;

use crate::exception::ModbusException;
use crate::retry::FailureClass;

/// Result type used throughout the crate
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus master error
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModbusError {
    /// Caller-supplied arguments violate the function's shape constraints
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Function code outside the supported set
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Invalid configuration value
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// No complete response within the deadline
    #[error("Timeout during {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Malformed frame: checksum, header, delimiter or length fault
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Well-framed message with inconsistent content
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Transport not connected or connection lost
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Transport-reported I/O error
    #[error("I/O error: {message}")]
    Io { message: String },

    /// The slave processed and rejected the request
    #[error("Modbus exception on function 0x{function:02X}: {exception}")]
    Exception {
        function: u8,
        exception: ModbusException,
    },

    /// Retry budget exhausted
    #[error("Communication failure after {attempts} attempts: {last}")]
    CommunicationFailure {
        attempts: u32,
        #[source]
        last: Box<ModbusError>,
    },

    /// The caller cancelled the transaction or the master shut down
    #[error("Transaction cancelled")]
    Cancelled,
}

impl ModbusError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn exception(function: u8, exception: ModbusException) -> Self {
        Self::Exception {
            function,
            exception,
        }
    }

    /// Failure class consulted by the retry controller
    pub fn class(&self) -> FailureClass {
        match self {
            Self::InvalidArgument { .. }
            | Self::InvalidFunction { .. }
            | Self::Configuration { .. } => FailureClass::Validation,
            Self::Timeout { .. } => FailureClass::Timeout,
            Self::Frame { .. } | Self::Protocol { .. } => FailureClass::Framing,
            Self::Connection { .. } | Self::Io { .. } => FailureClass::Transport,
            Self::Exception { .. } => FailureClass::Exception,
            Self::CommunicationFailure { .. } | Self::Cancelled => FailureClass::Terminal,
        }
    }

    /// Local validation fault, raised before anything reached the transport
    pub fn is_validation(&self) -> bool {
        self.class() == FailureClass::Validation
    }

    /// Well-formed exception response from the slave
    pub fn is_exception(&self) -> bool {
        matches!(self, Self::Exception { .. })
    }

    /// Could not talk to the device
    pub fn is_communication_failure(&self) -> bool {
        matches!(self, Self::CommunicationFailure { .. })
    }

    /// Exception kind, if the slave rejected the request
    pub fn exception_kind(&self) -> Option<ModbusException> {
        match self {
            Self::Exception { exception, .. } => Some(*exception),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => Self::connection(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_families_are_disjoint() {
        assert_eq!(
            ModbusError::invalid_argument("bad").class(),
            FailureClass::Validation
        );
        assert_eq!(ModbusError::timeout("read", 10).class(), FailureClass::Timeout);
        assert_eq!(ModbusError::frame("crc").class(), FailureClass::Framing);
        assert_eq!(ModbusError::protocol("fc").class(), FailureClass::Framing);
        assert_eq!(ModbusError::io("eof").class(), FailureClass::Transport);
        assert_eq!(
            ModbusError::exception(3, ModbusException::IllegalDataAddress).class(),
            FailureClass::Exception
        );
    }

    #[test]
    fn test_communication_failure_keeps_last_error() {
        let err = ModbusError::CommunicationFailure {
            attempts: 4,
            last: Box::new(ModbusError::timeout("read response", 3000)),
        };
        assert!(err.is_communication_failure());
        assert!(err.to_string().contains("4 attempts"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_io_error_mapping() {
        let err: ModbusError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, ModbusError::Connection { .. }));

        let err: ModbusError = std::io::Error::other("weird").into();
        assert!(matches!(err, ModbusError::Io { .. }));
    }

    #[test]
    fn test_exception_kind() {
        let err = ModbusError::exception(1, ModbusException::SlaveDeviceBusy);
        assert!(err.is_exception());
        assert_eq!(err.exception_kind(), Some(ModbusException::SlaveDeviceBusy));
        assert_eq!(ModbusError::Cancelled.exception_kind(), None);
    }
}
