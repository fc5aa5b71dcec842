//! Retry and reconnect policy
//!
//! Pure decision logic: the connection worker classifies a failed attempt and
//! asks [`RetryPolicy::decide`] what to do next.

use crate::constants::{DEFAULT_RECONNECTING, DEFAULT_RETRIES};
use crate::error::ModbusError;

/// Failure classes the retry controller distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Rejected locally before transmission
    Validation,
    /// No complete response before the deadline
    Timeout,
    /// Checksum, length, header or echo fault
    Framing,
    /// The transport reported an I/O error or end of stream
    Transport,
    /// Frame that matches no awaiting transaction
    StrayFrame,
    /// The slave answered with an exception response
    Exception,
    /// Already final: exhausted budget or cancellation
    Terminal,
}

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Send again, reconnecting the transport first when `reconnect` is set
    Retry { reconnect: bool },
    /// Not a fault of any transaction; drop it
    Ignore,
    /// Hand the failure to the caller
    Surface,
}

/// Retry budget and reconnect behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub retries: u32,
    /// Reopen the transport after a timeout
    pub reconnect: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            reconnect: DEFAULT_RECONNECTING,
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, reconnect: bool) -> Self {
        Self { retries, reconnect }
    }

    /// Total number of sends a transaction may make
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Decide the next step for a failure of `class`.
    ///
    /// A transport error can only be retried over a fresh connection, so
    /// without reconnect support it surfaces immediately.
    pub fn decide(
        &self,
        class: FailureClass,
        retries_remaining: u32,
        supports_reconnect: bool,
    ) -> RetryAction {
        match class {
            FailureClass::StrayFrame => RetryAction::Ignore,
            FailureClass::Validation | FailureClass::Exception | FailureClass::Terminal => {
                RetryAction::Surface
            }
            _ if retries_remaining == 0 => RetryAction::Surface,
            FailureClass::Timeout => RetryAction::Retry {
                reconnect: self.reconnect && supports_reconnect,
            },
            FailureClass::Framing => RetryAction::Retry { reconnect: false },
            FailureClass::Transport if supports_reconnect => RetryAction::Retry { reconnect: true },
            FailureClass::Transport => RetryAction::Surface,
        }
    }

    /// Final error for a transaction whose last attempt failed with `last`.
    ///
    /// Transport-family faults become [`ModbusError::CommunicationFailure`];
    /// exceptions and local faults pass through untouched.
    pub fn exhausted(&self, attempts: u32, last: ModbusError) -> ModbusError {
        match last.class() {
            FailureClass::Timeout | FailureClass::Framing | FailureClass::Transport => {
                ModbusError::CommunicationFailure {
                    attempts,
                    last: Box::new(last),
                }
            }
            _ => last,
        }
    }
}
