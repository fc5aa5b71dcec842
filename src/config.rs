//! # Master Configuration
//!
//! Settings consumed by the connection worker. Every field has an explicit
//! default taken from the canonical protocol constants; loading these values
//! from files or the environment is left to the application.

use std::time::Duration;

use crate::constants::{
    DEFAULT_MAX_IN_FLIGHT, DEFAULT_PORT, DEFAULT_RECONNECTING, DEFAULT_RETRIES, DEFAULT_TIMEOUT,
    DEFAULT_TRANSMIT_DELAY, FIRST_TRANSACTION_ID, MAX_TRANSACTION_ID,
};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::SerialEncoding;
use crate::retry::RetryPolicy;

/// Modbus master configuration.
///
/// # Example
///
/// ```rust
/// use modbus_master::ModbusConfig;
/// use std::time::Duration;
///
/// let config = ModbusConfig::new()
///     .with_timeout(Duration::from_millis(500))
///     .with_retries(1)
///     .with_reconnect(true);
///
/// assert_eq!(config.retry_policy().max_attempts(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusConfig {
    /// TCP port used when an address has none
    pub port: u16,
    /// Response deadline per attempt
    pub timeout: Duration,
    /// Attempts after the first
    pub retries: u32,
    /// Reopen the transport after a timeout
    pub reconnect: bool,
    /// Serial line encoding
    pub serial_encoding: SerialEncoding,
    /// Highest TCP transaction id before wrapping
    pub max_transaction_id: u16,
    /// Pause before every transmission
    pub transmit_delay: Duration,
    /// Cap on concurrently awaiting TCP transactions
    pub max_in_flight: usize,
    /// Hex dump of every frame at info level
    pub packet_logging: bool,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            reconnect: DEFAULT_RECONNECTING,
            serial_encoding: SerialEncoding::default(),
            max_transaction_id: MAX_TRANSACTION_ID,
            transmit_delay: DEFAULT_TRANSMIT_DELAY,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            packet_logging: false,
        }
    }
}

impl ModbusConfig {
    /// Configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_serial_encoding(mut self, encoding: SerialEncoding) -> Self {
        self.serial_encoding = encoding;
        self
    }

    pub fn with_max_transaction_id(mut self, max: u16) -> Self {
        self.max_transaction_id = max;
        self
    }

    pub fn with_transmit_delay(mut self, delay: Duration) -> Self {
        self.transmit_delay = delay;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn with_packet_logging(mut self, enabled: bool) -> Self {
        self.packet_logging = enabled;
        self
    }

    /// Retry policy derived from `retries` and `reconnect`
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, self.reconnect)
    }

    /// Reject values the worker cannot run with
    pub fn validate(&self) -> ModbusResult<()> {
        if self.timeout.is_zero() {
            return Err(ModbusError::configuration("timeout must be non-zero"));
        }
        if self.max_transaction_id < FIRST_TRANSACTION_ID {
            return Err(ModbusError::configuration(format!(
                "max_transaction_id must be at least {}",
                FIRST_TRANSACTION_ID
            )));
        }
        if self.max_in_flight == 0 {
            return Err(ModbusError::configuration("max_in_flight must be at least 1"));
        }
        if self.max_in_flight > self.max_transaction_id as usize {
            return Err(ModbusError::configuration(format!(
                "max_in_flight {} exceeds the {} available transaction ids",
                self.max_in_flight, self.max_transaction_id
            )));
        }
        Ok(())
    }
}
