//! Modbus function codes and typed request/response messages
//!
//! Every supported function code is one variant of [`Request`] and one variant
//! of [`Response`], each carrying its own field set. Wire encoding lives in
//! [`crate::pdu`].

use crate::constants::{
    COIL_OFF, COIL_ON, MAX_BITS, MAX_FILE_READ_REQUEST_BYTES, MAX_FILE_RECORD_NUMBER, MAX_PDU_SIZE,
    MAX_READ_REGISTERS, MAX_READ_WRITE_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};

/// Modbus slave/unit identifier
pub type SlaveId = u8;

/// Supported Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModbusFunction {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    ReadExceptionStatus = 0x07,
    Diagnostics = 0x08,
    GetCommEventCounter = 0x0B,
    GetCommEventLog = 0x0C,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
    ReportSlaveId = 0x11,
    ReadFileRecord = 0x14,
    WriteFileRecord = 0x15,
    MaskWriteRegister = 0x16,
    ReadWriteMultipleRegisters = 0x17,
    ReadFifoQueue = 0x18,
    /// Encapsulated interface transport, MEI type 0x0E only
    ReadDeviceIdentification = 0x2B,
}

impl ModbusFunction {
    /// Wire code
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire code. Exception codes (high bit set) are rejected.
    pub fn from_u8(code: u8) -> ModbusResult<Self> {
        Ok(match code {
            0x01 => Self::ReadCoils,
            0x02 => Self::ReadDiscreteInputs,
            0x03 => Self::ReadHoldingRegisters,
            0x04 => Self::ReadInputRegisters,
            0x05 => Self::WriteSingleCoil,
            0x06 => Self::WriteSingleRegister,
            0x07 => Self::ReadExceptionStatus,
            0x08 => Self::Diagnostics,
            0x0B => Self::GetCommEventCounter,
            0x0C => Self::GetCommEventLog,
            0x0F => Self::WriteMultipleCoils,
            0x10 => Self::WriteMultipleRegisters,
            0x11 => Self::ReportSlaveId,
            0x14 => Self::ReadFileRecord,
            0x15 => Self::WriteFileRecord,
            0x16 => Self::MaskWriteRegister,
            0x17 => Self::ReadWriteMultipleRegisters,
            0x18 => Self::ReadFifoQueue,
            0x2B => Self::ReadDeviceIdentification,
            other => return Err(ModbusError::invalid_function(other)),
        })
    }

    /// Human-readable name
    pub fn description(self) -> &'static str {
        match self {
            Self::ReadCoils => "Read Coils",
            Self::ReadDiscreteInputs => "Read Discrete Inputs",
            Self::ReadHoldingRegisters => "Read Holding Registers",
            Self::ReadInputRegisters => "Read Input Registers",
            Self::WriteSingleCoil => "Write Single Coil",
            Self::WriteSingleRegister => "Write Single Register",
            Self::ReadExceptionStatus => "Read Exception Status",
            Self::Diagnostics => "Diagnostics",
            Self::GetCommEventCounter => "Get Comm Event Counter",
            Self::GetCommEventLog => "Get Comm Event Log",
            Self::WriteMultipleCoils => "Write Multiple Coils",
            Self::WriteMultipleRegisters => "Write Multiple Registers",
            Self::ReportSlaveId => "Report Slave ID",
            Self::ReadFileRecord => "Read File Record",
            Self::WriteFileRecord => "Write File Record",
            Self::MaskWriteRegister => "Mask Write Register",
            Self::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
            Self::ReadFifoQueue => "Read FIFO Queue",
            Self::ReadDeviceIdentification => "Read Device Identification",
        }
    }

    /// Functions defined for serial lines only
    pub fn is_serial_only(self) -> bool {
        matches!(
            self,
            Self::ReadExceptionStatus
                | Self::Diagnostics
                | Self::GetCommEventCounter
                | Self::GetCommEventLog
                | Self::ReportSlaveId
        )
    }
}

impl std::fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), self.to_u8())
    }
}

/// One record group to read with FC20
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecordRef {
    /// 1..=0xFFFF
    pub file_number: u16,
    /// 0..=0x270F
    pub record_number: u16,
    /// Registers to read
    pub record_length: u16,
}

/// One record group written with FC21; the slave echoes it back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub file_number: u16,
    pub record_number: u16,
    pub data: Vec<u16>,
}

/// Access level of a Read Device Identification request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceIdCode {
    /// Vendor name, product code, revision
    Basic = 0x01,
    /// Basic plus vendor URL, product name, model and application name
    Regular = 0x02,
    /// Regular plus private objects
    Extended = 0x03,
    /// One specific object
    Specific = 0x04,
}

impl DeviceIdCode {
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Basic),
            0x02 => Some(Self::Regular),
            0x03 => Some(Self::Extended),
            0x04 => Some(Self::Specific),
            _ => None,
        }
    }
}

/// One identification object: id and raw value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceObject {
    pub id: u8,
    pub value: Vec<u8>,
}

/// Reply to Read Device Identification.
///
/// When `more_follows` is set, ask again with `next_object_id` to get the
/// rest of the objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentification {
    pub read_code: DeviceIdCode,
    pub conformity_level: u8,
    pub more_follows: bool,
    pub next_object_id: u8,
    pub objects: Vec<DeviceObject>,
}

/// A Modbus request, one variant per function code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// FC01
    ReadCoils { address: u16, quantity: u16 },
    /// FC02
    ReadDiscreteInputs { address: u16, quantity: u16 },
    /// FC03
    ReadHoldingRegisters { address: u16, quantity: u16 },
    /// FC04
    ReadInputRegisters { address: u16, quantity: u16 },
    /// FC05. `value` is the raw wire word and must be [`COIL_ON`] or [`COIL_OFF`].
    WriteSingleCoil { address: u16, value: u16 },
    /// FC06
    WriteSingleRegister { address: u16, value: u16 },
    /// FC07 (serial only)
    ReadExceptionStatus,
    /// FC08 (serial only)
    Diagnostics { sub_function: u16, data: u16 },
    /// FC11 (serial only)
    GetCommEventCounter,
    /// FC12 (serial only)
    GetCommEventLog,
    /// FC15
    WriteMultipleCoils { address: u16, coils: Vec<bool> },
    /// FC16
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
    /// FC17 (serial only)
    ReportSlaveId,
    /// FC20
    ReadFileRecord { records: Vec<FileRecordRef> },
    /// FC21
    WriteFileRecord { records: Vec<FileRecord> },
    /// FC22
    MaskWriteRegister {
        address: u16,
        and_mask: u16,
        or_mask: u16,
    },
    /// FC23: the write block is applied before the read block is read
    ReadWriteMultipleRegisters {
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: Vec<u16>,
    },
    /// FC24
    ReadFifoQueue { address: u16 },
    /// FC43, MEI type 0x0E
    ReadDeviceIdentification { read_code: DeviceIdCode, object_id: u8 },
}

impl Request {
    /// Write single coil request from a boolean state
    pub fn write_single_coil(address: u16, on: bool) -> Self {
        Self::WriteSingleCoil {
            address,
            value: if on { COIL_ON } else { COIL_OFF },
        }
    }

    /// Function code of this request
    pub fn function(&self) -> ModbusFunction {
        match self {
            Self::ReadCoils { .. } => ModbusFunction::ReadCoils,
            Self::ReadDiscreteInputs { .. } => ModbusFunction::ReadDiscreteInputs,
            Self::ReadHoldingRegisters { .. } => ModbusFunction::ReadHoldingRegisters,
            Self::ReadInputRegisters { .. } => ModbusFunction::ReadInputRegisters,
            Self::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil,
            Self::WriteSingleRegister { .. } => ModbusFunction::WriteSingleRegister,
            Self::ReadExceptionStatus => ModbusFunction::ReadExceptionStatus,
            Self::Diagnostics { .. } => ModbusFunction::Diagnostics,
            Self::GetCommEventCounter => ModbusFunction::GetCommEventCounter,
            Self::GetCommEventLog => ModbusFunction::GetCommEventLog,
            Self::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils,
            Self::WriteMultipleRegisters { .. } => ModbusFunction::WriteMultipleRegisters,
            Self::ReportSlaveId => ModbusFunction::ReportSlaveId,
            Self::ReadFileRecord { .. } => ModbusFunction::ReadFileRecord,
            Self::WriteFileRecord { .. } => ModbusFunction::WriteFileRecord,
            Self::MaskWriteRegister { .. } => ModbusFunction::MaskWriteRegister,
            Self::ReadWriteMultipleRegisters { .. } => ModbusFunction::ReadWriteMultipleRegisters,
            Self::ReadFifoQueue { .. } => ModbusFunction::ReadFifoQueue,
            Self::ReadDeviceIdentification { .. } => ModbusFunction::ReadDeviceIdentification,
        }
    }

    /// Check the request's shape constraints.
    ///
    /// A failure here is a local validation fault: the request never reaches
    /// the transport.
    pub fn validate(&self) -> ModbusResult<()> {
        match self {
            Self::ReadCoils { address, quantity } | Self::ReadDiscreteInputs { address, quantity } => {
                check_range(self.function(), *address, *quantity as usize, MAX_BITS)
            }
            Self::ReadHoldingRegisters { address, quantity }
            | Self::ReadInputRegisters { address, quantity } => {
                check_range(self.function(), *address, *quantity as usize, MAX_READ_REGISTERS)
            }
            Self::WriteSingleCoil { value, .. } => {
                if *value == COIL_ON || *value == COIL_OFF {
                    Ok(())
                } else {
                    Err(ModbusError::invalid_argument(format!(
                        "Coil value 0x{:04X} is neither ON (0x{:04X}) nor OFF (0x{:04X})",
                        value, COIL_ON, COIL_OFF
                    )))
                }
            }
            Self::WriteMultipleCoils { address, coils } => {
                check_range(self.function(), *address, coils.len(), MAX_WRITE_COILS)
            }
            Self::WriteMultipleRegisters { address, values } => {
                check_range(self.function(), *address, values.len(), MAX_WRITE_REGISTERS)
            }
            Self::ReadWriteMultipleRegisters {
                read_address,
                read_quantity,
                write_address,
                values,
            } => {
                check_range(
                    self.function(),
                    *read_address,
                    *read_quantity as usize,
                    MAX_READ_REGISTERS,
                )?;
                check_range(
                    self.function(),
                    *write_address,
                    values.len(),
                    MAX_READ_WRITE_REGISTERS,
                )
            }
            Self::ReadFileRecord { records } => {
                check_group_count(self.function(), records.len())?;
                for record in records {
                    check_file_record(self.function(), record.file_number, record.record_number)?;
                    if record.record_length == 0 {
                        return Err(ModbusError::invalid_argument(
                            "Read File Record: record length must be at least 1",
                        ));
                    }
                }
                let request_bytes = records.len() * 7;
                let response_len: usize = 2 + records
                    .iter()
                    .map(|r| 2 + 2 * r.record_length as usize)
                    .sum::<usize>();
                if request_bytes > MAX_FILE_READ_REQUEST_BYTES || response_len > MAX_PDU_SIZE {
                    return Err(ModbusError::invalid_argument(format!(
                        "Read File Record: {} groups asking for a {} byte reply exceed the PDU limit",
                        records.len(),
                        response_len
                    )));
                }
                Ok(())
            }
            Self::WriteFileRecord { records } => {
                check_group_count(self.function(), records.len())?;
                for record in records {
                    check_file_record(self.function(), record.file_number, record.record_number)?;
                    if record.data.is_empty() {
                        return Err(ModbusError::invalid_argument(
                            "Write File Record: record data must not be empty",
                        ));
                    }
                }
                let request_len: usize = 2 + records.iter().map(|r| 7 + 2 * r.data.len()).sum::<usize>();
                if request_len > MAX_PDU_SIZE {
                    return Err(ModbusError::invalid_argument(format!(
                        "Write File Record: {} byte request exceeds the PDU limit",
                        request_len
                    )));
                }
                Ok(())
            }
            Self::WriteSingleRegister { .. }
            | Self::ReadExceptionStatus
            | Self::Diagnostics { .. }
            | Self::GetCommEventCounter
            | Self::GetCommEventLog
            | Self::ReportSlaveId
            | Self::MaskWriteRegister { .. }
            | Self::ReadFifoQueue { .. }
            | Self::ReadDeviceIdentification { .. } => Ok(()),
        }
    }
}

/// Quantity must be 1..=max and the addressed block must not run past 0xFFFF
fn check_range(function: ModbusFunction, address: u16, quantity: usize, max: usize) -> ModbusResult<()> {
    if quantity == 0 || quantity > max {
        return Err(ModbusError::invalid_argument(format!(
            "{}: quantity {} out of range 1..={}",
            function.description(),
            quantity,
            max
        )));
    }
    if address as usize + quantity > 0x1_0000 {
        return Err(ModbusError::invalid_argument(format!(
            "{}: address {} + quantity {} exceeds the 16-bit address space",
            function.description(),
            address,
            quantity
        )));
    }
    Ok(())
}

fn check_group_count(function: ModbusFunction, count: usize) -> ModbusResult<()> {
    if count == 0 {
        return Err(ModbusError::invalid_argument(format!(
            "{}: at least one record group is required",
            function.description()
        )));
    }
    Ok(())
}

fn check_file_record(function: ModbusFunction, file_number: u16, record_number: u16) -> ModbusResult<()> {
    if file_number == 0 {
        return Err(ModbusError::invalid_argument(format!(
            "{}: file number 0 is reserved",
            function.description()
        )));
    }
    if record_number > MAX_FILE_RECORD_NUMBER {
        return Err(ModbusError::invalid_argument(format!(
            "{}: record number {} above 0x{:04X}",
            function.description(),
            record_number,
            MAX_FILE_RECORD_NUMBER
        )));
    }
    Ok(())
}

/// A successful Modbus response, one variant per function code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadCoils(Vec<bool>),
    ReadDiscreteInputs(Vec<bool>),
    ReadHoldingRegisters(Vec<u16>),
    ReadInputRegisters(Vec<u16>),
    WriteSingleCoil { address: u16, value: u16 },
    WriteSingleRegister { address: u16, value: u16 },
    ReadExceptionStatus(u8),
    Diagnostics { sub_function: u16, data: u16 },
    GetCommEventCounter { status: u16, event_count: u16 },
    GetCommEventLog {
        status: u16,
        event_count: u16,
        message_count: u16,
        events: Vec<u8>,
    },
    WriteMultipleCoils { address: u16, quantity: u16 },
    WriteMultipleRegisters { address: u16, quantity: u16 },
    /// Device-specific slave id, run indicator and additional data
    ReportSlaveId(Vec<u8>),
    /// Record data per requested group, in request order
    ReadFileRecord(Vec<Vec<u16>>),
    WriteFileRecord(Vec<FileRecord>),
    MaskWriteRegister {
        address: u16,
        and_mask: u16,
        or_mask: u16,
    },
    /// Registers from the read block
    ReadWriteMultipleRegisters(Vec<u16>),
    ReadFifoQueue(Vec<u16>),
    ReadDeviceIdentification(DeviceIdentification),
}

impl Response {
    /// Function code of this response
    pub fn function(&self) -> ModbusFunction {
        match self {
            Self::ReadCoils(_) => ModbusFunction::ReadCoils,
            Self::ReadDiscreteInputs(_) => ModbusFunction::ReadDiscreteInputs,
            Self::ReadHoldingRegisters(_) => ModbusFunction::ReadHoldingRegisters,
            Self::ReadInputRegisters(_) => ModbusFunction::ReadInputRegisters,
            Self::WriteSingleCoil { .. } => ModbusFunction::WriteSingleCoil,
            Self::WriteSingleRegister { .. } => ModbusFunction::WriteSingleRegister,
            Self::ReadExceptionStatus(_) => ModbusFunction::ReadExceptionStatus,
            Self::Diagnostics { .. } => ModbusFunction::Diagnostics,
            Self::GetCommEventCounter { .. } => ModbusFunction::GetCommEventCounter,
            Self::GetCommEventLog { .. } => ModbusFunction::GetCommEventLog,
            Self::WriteMultipleCoils { .. } => ModbusFunction::WriteMultipleCoils,
            Self::WriteMultipleRegisters { .. } => ModbusFunction::WriteMultipleRegisters,
            Self::ReportSlaveId(_) => ModbusFunction::ReportSlaveId,
            Self::ReadFileRecord(_) => ModbusFunction::ReadFileRecord,
            Self::WriteFileRecord(_) => ModbusFunction::WriteFileRecord,
            Self::MaskWriteRegister { .. } => ModbusFunction::MaskWriteRegister,
            Self::ReadWriteMultipleRegisters(_) => ModbusFunction::ReadWriteMultipleRegisters,
            Self::ReadFifoQueue(_) => ModbusFunction::ReadFifoQueue,
            Self::ReadDeviceIdentification(_) => ModbusFunction::ReadDeviceIdentification,
        }
    }

    /// Bit values of a FC01/FC02 response
    pub fn into_bits(self) -> ModbusResult<Vec<bool>> {
        match self {
            Self::ReadCoils(bits) | Self::ReadDiscreteInputs(bits) => Ok(bits),
            other => Err(ModbusError::protocol(format!(
                "Expected a bit response, got {}",
                other.function()
            ))),
        }
    }

    /// Register values of a FC03/FC04/FC23/FC24 response
    pub fn into_registers(self) -> ModbusResult<Vec<u16>> {
        match self {
            Self::ReadHoldingRegisters(regs)
            | Self::ReadInputRegisters(regs)
            | Self::ReadWriteMultipleRegisters(regs)
            | Self::ReadFifoQueue(regs) => Ok(regs),
            other => Err(ModbusError::protocol(format!(
                "Expected a register response, got {}",
                other.function()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_code_roundtrip() {
        for code in 0u8..=0x7F {
            if let Ok(function) = ModbusFunction::from_u8(code) {
                assert_eq!(function.to_u8(), code);
            }
        }
        assert!(ModbusFunction::from_u8(0x83).is_err());
        assert!(ModbusFunction::from_u8(0x09).is_err());
        assert_eq!(
            ModbusFunction::from_u8(0x2B).unwrap(),
            ModbusFunction::ReadDeviceIdentification
        );
    }

    #[test]
    fn test_read_quantity_limits() {
        let ok = Request::ReadCoils {
            address: 0,
            quantity: MAX_BITS as u16,
        };
        assert!(ok.validate().is_ok());

        let too_many_bits = Request::ReadDiscreteInputs {
            address: 0,
            quantity: 2001,
        };
        assert!(too_many_bits.validate().unwrap_err().is_validation());

        let too_many_regs = Request::ReadHoldingRegisters {
            address: 0,
            quantity: 126,
        };
        assert!(too_many_regs.validate().unwrap_err().is_validation());

        let zero = Request::ReadInputRegisters {
            address: 0,
            quantity: 0,
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_address_overflow_rejected() {
        let req = Request::ReadHoldingRegisters {
            address: 0xFFFF,
            quantity: 2,
        };
        assert!(req.validate().is_err());

        let req = Request::ReadHoldingRegisters {
            address: 0xFFFF,
            quantity: 1,
        };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_coil_value_patterns() {
        assert!(Request::write_single_coil(1, true).validate().is_ok());
        assert!(Request::write_single_coil(1, false).validate().is_ok());

        let bad = Request::WriteSingleCoil {
            address: 1,
            value: 0x00FF,
        };
        assert!(matches!(
            bad.validate(),
            Err(ModbusError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_write_multiple_limits() {
        let coils = Request::WriteMultipleCoils {
            address: 0,
            coils: vec![true; 1969],
        };
        assert!(coils.validate().is_err());

        let regs = Request::WriteMultipleRegisters {
            address: 0,
            values: vec![0; 123],
        };
        assert!(regs.validate().is_ok());

        let empty = Request::WriteMultipleRegisters {
            address: 0,
            values: vec![],
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_read_write_multiple_limits() {
        let req = Request::ReadWriteMultipleRegisters {
            read_address: 0,
            read_quantity: 125,
            write_address: 10,
            values: vec![0; 122],
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_file_record_limits() {
        let group = |record_number, record_length| FileRecordRef {
            file_number: 4,
            record_number,
            record_length,
        };
        assert!(Request::ReadFileRecord { records: vec![group(1, 2)] }.validate().is_ok());
        assert!(Request::ReadFileRecord { records: vec![] }.validate().is_err());
        assert!(Request::ReadFileRecord { records: vec![group(0x2710, 1)] }.validate().is_err());
        assert!(Request::ReadFileRecord { records: vec![group(0, 0)] }.validate().is_err());
        // 2 groups of 124 registers cannot come back in one PDU
        assert!(Request::ReadFileRecord { records: vec![group(0, 124); 2] }
            .validate()
            .is_err());

        let reserved = FileRecord {
            file_number: 0,
            record_number: 1,
            data: vec![1],
        };
        assert!(Request::WriteFileRecord { records: vec![reserved] }
            .validate()
            .unwrap_err()
            .is_validation());

        let too_long = FileRecord {
            file_number: 1,
            record_number: 0,
            data: vec![0; 123],
        };
        assert!(Request::WriteFileRecord { records: vec![too_long] }.validate().is_err());
    }

    #[test]
    fn test_device_id_codes() {
        for code in 1..=4 {
            assert_eq!(DeviceIdCode::from_u8(code).unwrap().to_u8(), code);
        }
        assert_eq!(DeviceIdCode::from_u8(0), None);
        assert_eq!(DeviceIdCode::from_u8(5), None);
    }

    #[test]
    fn test_response_accessors() {
        let resp = Response::ReadHoldingRegisters(vec![1, 2]);
        assert_eq!(resp.function(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(resp.clone().into_registers().unwrap(), vec![1, 2]);
        assert!(resp.into_bits().is_err());
    }
}
