//! Modbus protocol constants based on official specification
//!
//! These constants are derived from the official Modbus specification:
//! - Maximum PDU size: 253 bytes (inherited from RS485 ADU limit of 256 bytes)
//! - Register/coil limits are calculated to fit within the PDU size constraint
//!
//! Function codes and exception codes are not listed here; they live in the
//! closed enums [`ModbusFunction`](crate::protocol::ModbusFunction) and
//! [`ModbusException`](crate::exception::ModbusException).

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Modbus MBAP header length for TCP
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1) = 7 bytes
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// This is the fundamental limit inherited from RS485 implementation:
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
/// = 1 (Unit ID) + 253 (Max PDU) = 254 bytes
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Maximum serial ADU length in bytes
pub const MAX_MESSAGE_LENGTH: usize = 256;

/// Offset added to a function code to flag an exception response.
/// The last valid function code is therefore 127.
pub const EXCEPTION_OFFSET: u8 = 0x80;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04 (Read Holding/Input Registers)
///
/// Calculation for response PDU:
/// - Function Code: 1 byte
/// - Byte Count: 1 byte
/// - Register Data: N × 2 bytes
/// - Total: 1 + 1 + (N × 2) ≤ 253
/// - Therefore: N ≤ (253 - 2) / 2 = 125.5 → 125 registers
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Calculation for request PDU:
/// - Function Code: 1 byte
/// - Starting Address: 2 bytes
/// - Quantity of Registers: 2 bytes
/// - Byte Count: 1 byte
/// - Register Values: N × 2 bytes
/// - Total: 1 + 2 + 2 + 1 + (N × 2) ≤ 253
/// - Therefore: N ≤ (253 - 6) / 2 = 123.5 → 123 registers
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Maximum number of registers written by FC23 (Read/Write Multiple Registers)
///
/// Request PDU: FC(1) + read addr(2) + read qty(2) + write addr(2)
/// + write qty(2) + byte count(1) + N × 2 ≤ 253 → N ≤ 121
pub const MAX_READ_WRITE_REGISTERS: usize = 121;

/// Maximum number of registers a FIFO queue may return (FC24)
pub const MAX_FIFO_COUNT: usize = 31;

// ============================================================================
// Coil Operation Limits
// ============================================================================

/// Maximum number of coils for FC01/FC02 (Read Coils/Discrete Inputs)
///
/// Calculation for response PDU:
/// - Function Code: 1 byte
/// - Byte Count: 1 byte
/// - Coil Data: ceil(N / 8) bytes
/// - Total: 1 + 1 + ceil(N / 8) ≤ 253
/// - Therefore: ceil(N / 8) ≤ 251, N ≤ 251 × 8 = 2008
/// - Modbus allows N ≤ 2000 (rounded for practical use)
pub const MAX_READ_COILS: usize = 2000;

/// Maximum number of bits in a multiple read/write of discretes or coils
pub const MAX_BITS: usize = MAX_READ_COILS;

/// Maximum number of coils for FC15 (Write Multiple Coils)
///
/// Calculation for request PDU:
/// - Function Code: 1 byte
/// - Starting Address: 2 bytes
/// - Quantity of Outputs: 2 bytes
/// - Byte Count: 1 byte
/// - Coil Values: ceil(N / 8) bytes
/// - Total: 1 + 2 + 2 + 1 + ceil(N / 8) ≤ 253
/// - Therefore: ceil(N / 8) ≤ 247, N ≤ 247 × 8 = 1976
/// - Modbus allows N ≤ 1968 (0x7B0, conservative practical limit)
pub const MAX_WRITE_COILS: usize = 1968;

/// Word representation of the coil state ON
pub const COIL_ON: u16 = 0xFF00;

/// Word representation of the coil state OFF
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// File Records and Device Identification
// ============================================================================

/// Reference type carried by every FC20/FC21 sub-request
pub const FILE_RECORD_REFERENCE_TYPE: u8 = 0x06;

/// Highest record number within a file
pub const MAX_FILE_RECORD_NUMBER: u16 = 0x270F;

/// Largest FC20 request byte count: 35 sub-requests of 7 bytes each
pub const MAX_FILE_READ_REQUEST_BYTES: usize = 0xF5;

/// MEI type of Read Device Identification, carried in FC43
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;

// ============================================================================
// Transaction Identifiers
// ============================================================================

/// Highest transaction identifier handed out.
///
/// Servers must echo whatever the client sends, but the value is capped at the
/// signed 16-bit maximum because some servers treat it as a signed value.
pub const MAX_TRANSACTION_ID: u16 = i16::MAX as u16;

/// Transaction identifier used by serial encodings, which carry no id field.
/// Never issued to a TCP transaction.
pub const DEFAULT_TRANSACTION_ID: u16 = 0;

/// First identifier issued after wrapping past [`MAX_TRANSACTION_ID`]
pub const FIRST_TRANSACTION_ID: u16 = DEFAULT_TRANSACTION_ID + 1;

/// Protocol identifier carried in every MBAP header
pub const DEFAULT_PROTOCOL_ID: u16 = 0;

// ============================================================================
// Defaults
// ============================================================================

/// Modbus TCP default port
pub const DEFAULT_PORT: u16 = 502;

/// Default response timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Default response timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(DEFAULT_TIMEOUT_MS);

/// Default number of retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 3;

/// Reconnection is off unless configured
pub const DEFAULT_RECONNECTING: bool = false;

/// Default delay before each transmission
pub const DEFAULT_TRANSMIT_DELAY: Duration = Duration::ZERO;

/// Default cap on concurrently outstanding TCP transactions
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

// ============================================================================
// Serial Framing Markers
// ============================================================================

/// ASCII frame start
pub const ASCII_FRAME_START: u8 = b':';

/// ASCII frame terminator
pub const ASCII_FRAME_END: [u8; 2] = [b'\r', b'\n'];

/// Binary frame start marker
pub const BIN_FRAME_START: u8 = b'{';

/// Binary frame end marker
pub const BIN_FRAME_END: u8 = b'}';
