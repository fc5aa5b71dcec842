//! # Modbus Master - Async Modbus Transaction Engine
//!
//! A Modbus master (client) for TCP and serial lines. One background task per
//! connection owns the byte stream and runs every transaction through the same
//! pipeline:
//!
//! ```text
//! Request -> validate -> PDU -> framed ADU -> transport
//!                                                 |
//! Response <- exception check <- id match <- streaming frame decode
//! ```
//!
//! Failed attempts go through one retry/reconnect policy.
//!
//! ## Features
//!
//! - **Four framings**: Modbus TCP (MBAP), RTU (CRC-16), ASCII (LRC) and Binary
//! - **Concurrent TCP transactions**: ids 1..=32767, matched out of order
//! - **Retry control**: per-attempt deadline, retry budget, optional reconnect
//! - **Local validation**: malformed requests never reach the wire
//! - **Monitoring**: per-connection statistics and hex packet logging
//!
//! ## Supported Function Codes
//!
//! | Code | Function | TCP | Serial |
//! |------|----------|-----|--------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x07 | Read Exception Status | ✅ | ✅ |
//! | 0x08 | Diagnostics | ✅ | ✅ |
//! | 0x0B | Get Comm Event Counter | ✅ | ✅ |
//! | 0x0C | Get Comm Event Log | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//! | 0x11 | Report Slave ID | ✅ | ✅ |
//! | 0x14 | Read File Record | ✅ | ✅ |
//! | 0x15 | Write File Record | ✅ | ✅ |
//! | 0x16 | Mask Write Register | ✅ | ✅ |
//! | 0x17 | Read/Write Multiple Registers | ✅ | ✅ |
//! | 0x18 | Read FIFO Queue | ✅ | ✅ |
//! | 0x2B | Read Device Identification (MEI 0x0E) | ✅ | ✅ |
//!
//! Codes 0x07, 0x08, 0x0B, 0x0C and 0x11 are defined for serial lines only;
//! they are still sent over TCP when asked, for gateways that forward them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_master::{ModbusClient, ModbusConfig, ModbusResult, ModbusTcpClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let config = ModbusConfig::default()
//!         .with_timeout(Duration::from_secs(1))
//!         .with_retries(2);
//!     let client = ModbusTcpClient::from_address("127.0.0.1:502", config).await?;
//!
//!     // Read holding registers
//!     let values = client.read_03(1, 0, 10).await?;
//!     println!("Read registers: {:?}", values);
//!
//!     // Write single register
//!     client.write_06(1, 100, 0x1234).await?;
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on official specification
pub mod constants;

/// Function codes, requests and responses
pub mod protocol;

/// Stack-allocated PDU, request/response encoding and parsing
pub mod pdu;

/// Exception codes and exception response detection
pub mod exception;

/// ADU framing for TCP, RTU, ASCII and Binary
pub mod frame;

// ============================================================================
// Transaction engine
// ============================================================================

/// Transaction id allocation and pending-transaction bookkeeping
pub mod transaction;

/// Retry and reconnect policy
pub mod retry;

/// Master configuration
pub mod config;

/// Byte-stream transports for TCP and serial lines
pub mod transport;

/// Connection worker and master handle
pub mod master;

/// High-level client API
pub mod client;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use modbus_master::tokio) ===
pub use tokio;

// === Core client API ===
pub use client::{CommEventLog, ModbusClient, ModbusTcpClient};
pub use master::{ModbusMaster, PendingRequest};

#[cfg(feature = "serial")]
pub use client::ModbusSerialClient;

// === Error handling ===
pub use error::{ModbusError, ModbusResult};
pub use retry::{FailureClass, RetryAction, RetryPolicy};

// === Core types ===
pub use config::ModbusConfig;
pub use exception::ModbusException;
pub use frame::{Adu, FrameDecoder, FrameEncoding, SerialEncoding};
pub use protocol::{
    DeviceIdCode, DeviceIdentification, DeviceObject, FileRecord, FileRecordRef, ModbusFunction,
    Request, Response, SlaveId,
};

// === Transports and monitoring ===
pub use transport::{ModbusTransport, TcpTransport, TransportStats};

#[cfg(feature = "serial")]
pub use transport::{SerialConfig, SerialTransport};

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_TRANSACTION_ID, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};

// === PDU (advanced usage) ===
pub use pdu::{ModbusPdu, PduBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Modbus Master v{} - async Modbus transaction engine", VERSION)
}
