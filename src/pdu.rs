//! Modbus PDU buffer, builder and per-function wire layouts
//!
//! The PDU uses a fixed-size stack array to avoid heap allocation. Request and
//! response PDUs are built and parsed here; all multi-byte fields are
//! big-endian regardless of host byte order.

use std::fmt;

use tracing::debug;

use crate::constants::{
    EXCEPTION_OFFSET, FILE_RECORD_REFERENCE_TYPE, MAX_FIFO_COUNT, MAX_PDU_SIZE, MEI_READ_DEVICE_ID,
};
use crate::error::{ModbusError, ModbusResult};
use crate::exception;
use crate::protocol::{
    DeviceIdCode, DeviceIdentification, DeviceObject, FileRecord, FileRecordRef, ModbusFunction,
    Request, Response,
};

/// High-performance PDU with stack-allocated fixed array
#[derive(Clone)]
pub struct ModbusPdu {
    /// Fixed-size buffer (stack)
    data: [u8; MAX_PDU_SIZE],
    /// Actual data length
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice
    #[inline]
    pub fn from_slice(data: &[u8]) -> ModbusResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::frame(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::invalid_argument("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.extend(&value.to_be_bytes())
    }

    /// Extend with a byte slice
    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> ModbusResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::invalid_argument(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// Get immutable data slice
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Get current length
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        if self.len > 0 {
            Some(self.data[0])
        } else {
            None
        }
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(exception::is_exception_code)
            .unwrap_or(false)
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ModbusPdu {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ModbusPdu {}

impl fmt::Debug for ModbusPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModbusPdu").field(&self.as_slice()).finish()
    }
}

impl AsRef<[u8]> for ModbusPdu {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    /// Create a new builder
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    /// Set function code
    #[inline]
    pub fn function_code(mut self, fc: u8) -> ModbusResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    /// Add address
    #[inline]
    pub fn address(self, addr: u16) -> ModbusResult<Self> {
        self.word(addr)
    }

    /// Add quantity
    #[inline]
    pub fn quantity(self, qty: u16) -> ModbusResult<Self> {
        self.word(qty)
    }

    /// Add a big-endian word
    #[inline]
    pub fn word(mut self, value: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(value)?;
        Ok(self)
    }

    /// Add big-endian words
    pub fn words(mut self, values: &[u16]) -> ModbusResult<Self> {
        for &value in values {
            self.pdu.push_u16(value)?;
        }
        Ok(self)
    }

    /// Add a byte
    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    /// Add data
    #[inline]
    pub fn data(mut self, data: &[u8]) -> ModbusResult<Self> {
        self.pdu.extend(data)?;
        Ok(self)
    }

    /// Build the PDU
    #[inline]
    pub fn build(self) -> ModbusPdu {
        match self.pdu.function_code().map(ModbusFunction::from_u8) {
            Some(Ok(function)) => debug!(
                "PDU built: FC={:02X} ({}), total_len={}",
                function.to_u8(),
                function.description(),
                self.pdu.len()
            ),
            _ => debug!("PDU built: len={}", self.pdu.len()),
        }

        self.pdu
    }
}

/// Sequential big-endian reader over a PDU
struct PduReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PduReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> ModbusResult<&'a [u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(ModbusError::frame(format!(
                "PDU truncated: need {} bytes, have {}",
                end,
                self.data.len()
            )));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> ModbusResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> ModbusResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn words(&mut self, count: usize) -> ModbusResult<Vec<u16>> {
        let raw = self.bytes(count * 2)?;
        Ok(raw
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Trailing bytes are a length fault
    fn finish(self) -> ModbusResult<()> {
        if self.pos != self.data.len() {
            return Err(ModbusError::frame(format!(
                "PDU length mismatch: expected {} bytes, got {}",
                self.pos,
                self.data.len()
            )));
        }
        Ok(())
    }
}

/// Pack bits LSB-first into bytes
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

/// Unpack `count` bits LSB-first from bytes
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes.get(i / 8).is_some_and(|b| b & (1 << (i % 8)) != 0))
        .collect()
}

fn read_bit_block(r: &mut PduReader<'_>, quantity: u16) -> ModbusResult<Vec<bool>> {
    let byte_count = r.u8()? as usize;
    let expected = (quantity as usize).div_ceil(8);
    if byte_count != expected {
        return Err(ModbusError::frame(format!(
            "Byte count {} does not match {} bits (expected {})",
            byte_count, quantity, expected
        )));
    }
    Ok(unpack_bits(r.bytes(byte_count)?, quantity as usize))
}

fn read_register_block(r: &mut PduReader<'_>, quantity: u16) -> ModbusResult<Vec<u16>> {
    let byte_count = r.u8()? as usize;
    if byte_count != quantity as usize * 2 {
        return Err(ModbusError::frame(format!(
            "Byte count {} does not match {} registers",
            byte_count, quantity
        )));
    }
    r.words(quantity as usize)
}

fn read_reference_type(r: &mut PduReader<'_>) -> ModbusResult<()> {
    let reference = r.u8()?;
    if reference != FILE_RECORD_REFERENCE_TYPE {
        return Err(ModbusError::frame(format!(
            "File record reference type 0x{:02X}, expected 0x{:02X}",
            reference, FILE_RECORD_REFERENCE_TYPE
        )));
    }
    Ok(())
}

/// Byte-counted FC21 record groups; the request and its echo share the layout
fn read_file_records(r: &mut PduReader<'_>) -> ModbusResult<Vec<FileRecord>> {
    let byte_count = r.u8()? as usize;
    let mut block = PduReader::new(r.bytes(byte_count)?);
    let mut records = Vec::new();
    while block.remaining() > 0 {
        read_reference_type(&mut block)?;
        let file_number = block.u16()?;
        let record_number = block.u16()?;
        let record_length = block.u16()? as usize;
        records.push(FileRecord {
            file_number,
            record_number,
            data: block.words(record_length)?,
        });
    }
    Ok(records)
}

fn put_file_records(b: PduBuilder, records: &[FileRecord]) -> ModbusResult<PduBuilder> {
    let byte_count: usize = records.iter().map(|r| 7 + 2 * r.data.len()).sum();
    let mut b = b.byte(byte_count as u8)?;
    for record in records {
        b = b
            .byte(FILE_RECORD_REFERENCE_TYPE)?
            .word(record.file_number)?
            .word(record.record_number)?
            .quantity(record.data.len() as u16)?
            .words(&record.data)?;
    }
    Ok(b)
}

fn check_echo(function: ModbusFunction, field: &str, expected: u16, actual: u16) -> ModbusResult<()> {
    if expected != actual {
        return Err(ModbusError::protocol(format!(
            "{} echo mismatch on {}: sent 0x{:04X}, got 0x{:04X}",
            function.description(),
            field,
            expected,
            actual
        )));
    }
    Ok(())
}

impl Request {
    /// Encode the request into a PDU.
    ///
    /// Validates first, so a malformed request never produces bytes.
    pub fn to_pdu(&self) -> ModbusResult<ModbusPdu> {
        self.validate()?;

        let b = PduBuilder::new().function_code(self.function().to_u8())?;
        let pdu = match self {
            Self::ReadCoils { address, quantity }
            | Self::ReadDiscreteInputs { address, quantity }
            | Self::ReadHoldingRegisters { address, quantity }
            | Self::ReadInputRegisters { address, quantity } => {
                b.address(*address)?.quantity(*quantity)?.build()
            }
            Self::WriteSingleCoil { address, value }
            | Self::WriteSingleRegister { address, value } => b.address(*address)?.word(*value)?.build(),
            Self::ReadExceptionStatus
            | Self::GetCommEventCounter
            | Self::GetCommEventLog
            | Self::ReportSlaveId => b.build(),
            Self::Diagnostics { sub_function, data } => b.word(*sub_function)?.word(*data)?.build(),
            Self::WriteMultipleCoils { address, coils } => {
                let packed = pack_bits(coils);
                b.address(*address)?
                    .quantity(coils.len() as u16)?
                    .byte(packed.len() as u8)?
                    .data(&packed)?
                    .build()
            }
            Self::WriteMultipleRegisters { address, values } => b
                .address(*address)?
                .quantity(values.len() as u16)?
                .byte((values.len() * 2) as u8)?
                .words(values)?
                .build(),
            Self::MaskWriteRegister {
                address,
                and_mask,
                or_mask,
            } => b.address(*address)?.word(*and_mask)?.word(*or_mask)?.build(),
            Self::ReadWriteMultipleRegisters {
                read_address,
                read_quantity,
                write_address,
                values,
            } => b
                .address(*read_address)?
                .quantity(*read_quantity)?
                .address(*write_address)?
                .quantity(values.len() as u16)?
                .byte((values.len() * 2) as u8)?
                .words(values)?
                .build(),
            Self::ReadFifoQueue { address } => b.address(*address)?.build(),
            Self::ReadFileRecord { records } => {
                let mut b = b.byte((records.len() * 7) as u8)?;
                for record in records {
                    b = b
                        .byte(FILE_RECORD_REFERENCE_TYPE)?
                        .word(record.file_number)?
                        .word(record.record_number)?
                        .quantity(record.record_length)?;
                }
                b.build()
            }
            Self::WriteFileRecord { records } => put_file_records(b, records)?.build(),
            Self::ReadDeviceIdentification { read_code, object_id } => b
                .byte(MEI_READ_DEVICE_ID)?
                .byte(read_code.to_u8())?
                .byte(*object_id)?
                .build(),
        };
        Ok(pdu)
    }

    /// Decode a request PDU (slave side).
    ///
    /// Rejects byte counts that disagree with the quantity field and any
    /// request that fails [`Request::validate`].
    pub fn from_pdu(pdu: &[u8]) -> ModbusResult<Self> {
        let mut r = PduReader::new(pdu);
        let function = ModbusFunction::from_u8(r.u8()?)?;

        let request = match function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters => {
                let address = r.u16()?;
                let quantity = r.u16()?;
                match function {
                    ModbusFunction::ReadCoils => Self::ReadCoils { address, quantity },
                    ModbusFunction::ReadDiscreteInputs => Self::ReadDiscreteInputs { address, quantity },
                    ModbusFunction::ReadHoldingRegisters => {
                        Self::ReadHoldingRegisters { address, quantity }
                    }
                    _ => Self::ReadInputRegisters { address, quantity },
                }
            }
            ModbusFunction::WriteSingleCoil => {
                let address = r.u16()?;
                let value = r.u16()?;
                Self::WriteSingleCoil { address, value }
            }
            ModbusFunction::WriteSingleRegister => {
                let address = r.u16()?;
                let value = r.u16()?;
                Self::WriteSingleRegister { address, value }
            }
            ModbusFunction::ReadExceptionStatus => Self::ReadExceptionStatus,
            ModbusFunction::Diagnostics => {
                let sub_function = r.u16()?;
                let data = r.u16()?;
                Self::Diagnostics { sub_function, data }
            }
            ModbusFunction::GetCommEventCounter => Self::GetCommEventCounter,
            ModbusFunction::GetCommEventLog => Self::GetCommEventLog,
            ModbusFunction::WriteMultipleCoils => {
                let address = r.u16()?;
                let quantity = r.u16()?;
                let coils = read_bit_block(&mut r, quantity)?;
                Self::WriteMultipleCoils { address, coils }
            }
            ModbusFunction::WriteMultipleRegisters => {
                let address = r.u16()?;
                let quantity = r.u16()?;
                let values = read_register_block(&mut r, quantity)?;
                Self::WriteMultipleRegisters { address, values }
            }
            ModbusFunction::ReportSlaveId => Self::ReportSlaveId,
            ModbusFunction::MaskWriteRegister => {
                let address = r.u16()?;
                let and_mask = r.u16()?;
                let or_mask = r.u16()?;
                Self::MaskWriteRegister {
                    address,
                    and_mask,
                    or_mask,
                }
            }
            ModbusFunction::ReadWriteMultipleRegisters => {
                let read_address = r.u16()?;
                let read_quantity = r.u16()?;
                let write_address = r.u16()?;
                let write_quantity = r.u16()?;
                let values = read_register_block(&mut r, write_quantity)?;
                Self::ReadWriteMultipleRegisters {
                    read_address,
                    read_quantity,
                    write_address,
                    values,
                }
            }
            ModbusFunction::ReadFifoQueue => Self::ReadFifoQueue { address: r.u16()? },
            ModbusFunction::ReadFileRecord => {
                let byte_count = r.u8()? as usize;
                if byte_count % 7 != 0 {
                    return Err(ModbusError::frame(format!(
                        "Read File Record byte count {} is not a multiple of 7",
                        byte_count
                    )));
                }
                let mut records = Vec::with_capacity(byte_count / 7);
                for _ in 0..byte_count / 7 {
                    read_reference_type(&mut r)?;
                    records.push(FileRecordRef {
                        file_number: r.u16()?,
                        record_number: r.u16()?,
                        record_length: r.u16()?,
                    });
                }
                Self::ReadFileRecord { records }
            }
            ModbusFunction::WriteFileRecord => Self::WriteFileRecord {
                records: read_file_records(&mut r)?,
            },
            ModbusFunction::ReadDeviceIdentification => {
                let mei = r.u8()?;
                if mei != MEI_READ_DEVICE_ID {
                    return Err(ModbusError::frame(format!("Unsupported MEI type 0x{:02X}", mei)));
                }
                let code = r.u8()?;
                let read_code = DeviceIdCode::from_u8(code).ok_or_else(|| {
                    ModbusError::frame(format!("Invalid read device id code 0x{:02X}", code))
                })?;
                Self::ReadDeviceIdentification {
                    read_code,
                    object_id: r.u8()?,
                }
            }
        };

        r.finish()?;
        request.validate()?;
        Ok(request)
    }
}

impl Response {
    /// Decode a response PDU against the request that produced it.
    ///
    /// The function code, with the exception bit masked off, must match the
    /// request before an exception PDU is translated. Every length must agree
    /// exactly with the request's quantities; there is no partial success.
    pub fn from_pdu(request: &Request, pdu: &[u8]) -> ModbusResult<Self> {
        let function = request.function();
        if let Some(&fc) = pdu.first() {
            if exception::is_exception_code(fc) && fc & !EXCEPTION_OFFSET != function.to_u8() {
                return Err(ModbusError::protocol(format!(
                    "Exception for function {:02X} in reply to {:02X}",
                    fc & !EXCEPTION_OFFSET,
                    function.to_u8()
                )));
            }
        }
        exception::translate(pdu)?;

        let mut r = PduReader::new(pdu);
        let fc = r.u8()?;
        if fc != function.to_u8() {
            return Err(ModbusError::protocol(format!(
                "Function code mismatch: expected {:02X}, got {:02X}",
                function.to_u8(),
                fc
            )));
        }

        let response = match request {
            Request::ReadCoils { quantity, .. } => Self::ReadCoils(read_bit_block(&mut r, *quantity)?),
            Request::ReadDiscreteInputs { quantity, .. } => {
                Self::ReadDiscreteInputs(read_bit_block(&mut r, *quantity)?)
            }
            Request::ReadHoldingRegisters { quantity, .. } => {
                Self::ReadHoldingRegisters(read_register_block(&mut r, *quantity)?)
            }
            Request::ReadInputRegisters { quantity, .. } => {
                Self::ReadInputRegisters(read_register_block(&mut r, *quantity)?)
            }
            Request::WriteSingleCoil { address, value } => {
                let echoed_address = r.u16()?;
                let echoed_value = r.u16()?;
                check_echo(function, "address", *address, echoed_address)?;
                check_echo(function, "value", *value, echoed_value)?;
                Self::WriteSingleCoil {
                    address: echoed_address,
                    value: echoed_value,
                }
            }
            Request::WriteSingleRegister { address, value } => {
                let echoed_address = r.u16()?;
                let echoed_value = r.u16()?;
                check_echo(function, "address", *address, echoed_address)?;
                check_echo(function, "value", *value, echoed_value)?;
                Self::WriteSingleRegister {
                    address: echoed_address,
                    value: echoed_value,
                }
            }
            Request::ReadExceptionStatus => Self::ReadExceptionStatus(r.u8()?),
            Request::Diagnostics { sub_function, .. } => {
                let echoed = r.u16()?;
                check_echo(function, "sub-function", *sub_function, echoed)?;
                Self::Diagnostics {
                    sub_function: echoed,
                    data: r.u16()?,
                }
            }
            Request::GetCommEventCounter => {
                let status = r.u16()?;
                let event_count = r.u16()?;
                Self::GetCommEventCounter {
                    status,
                    event_count,
                }
            }
            Request::GetCommEventLog => {
                let byte_count = r.u8()? as usize;
                if byte_count < 6 {
                    return Err(ModbusError::frame(format!(
                        "Comm event log byte count {} below minimum of 6",
                        byte_count
                    )));
                }
                let status = r.u16()?;
                let event_count = r.u16()?;
                let message_count = r.u16()?;
                let events = r.bytes(byte_count - 6)?.to_vec();
                Self::GetCommEventLog {
                    status,
                    event_count,
                    message_count,
                    events,
                }
            }
            Request::WriteMultipleCoils { address, coils } => {
                let echoed_address = r.u16()?;
                let quantity = r.u16()?;
                check_echo(function, "address", *address, echoed_address)?;
                check_echo(function, "quantity", coils.len() as u16, quantity)?;
                Self::WriteMultipleCoils {
                    address: echoed_address,
                    quantity,
                }
            }
            Request::WriteMultipleRegisters { address, values } => {
                let echoed_address = r.u16()?;
                let quantity = r.u16()?;
                check_echo(function, "address", *address, echoed_address)?;
                check_echo(function, "quantity", values.len() as u16, quantity)?;
                Self::WriteMultipleRegisters {
                    address: echoed_address,
                    quantity,
                }
            }
            Request::ReportSlaveId => {
                let byte_count = r.u8()? as usize;
                Self::ReportSlaveId(r.bytes(byte_count)?.to_vec())
            }
            Request::MaskWriteRegister {
                address,
                and_mask,
                or_mask,
            } => {
                let echoed_address = r.u16()?;
                let echoed_and = r.u16()?;
                let echoed_or = r.u16()?;
                check_echo(function, "address", *address, echoed_address)?;
                check_echo(function, "and mask", *and_mask, echoed_and)?;
                check_echo(function, "or mask", *or_mask, echoed_or)?;
                Self::MaskWriteRegister {
                    address: echoed_address,
                    and_mask: echoed_and,
                    or_mask: echoed_or,
                }
            }
            Request::ReadWriteMultipleRegisters { read_quantity, .. } => {
                Self::ReadWriteMultipleRegisters(read_register_block(&mut r, *read_quantity)?)
            }
            Request::ReadFifoQueue { .. } => {
                let byte_count = r.u16()? as usize;
                let fifo_count = r.u16()? as usize;
                if fifo_count > MAX_FIFO_COUNT || byte_count != 2 + fifo_count * 2 {
                    return Err(ModbusError::frame(format!(
                        "FIFO byte count {} inconsistent with {} registers",
                        byte_count, fifo_count
                    )));
                }
                Self::ReadFifoQueue(r.words(fifo_count)?)
            }
            Request::ReadFileRecord { records } => {
                let byte_count = r.u8()? as usize;
                let expected: usize = records.iter().map(|g| 2 + 2 * g.record_length as usize).sum();
                if byte_count != expected {
                    return Err(ModbusError::frame(format!(
                        "File record byte count {} does not match {} requested groups (expected {})",
                        byte_count,
                        records.len(),
                        expected
                    )));
                }
                let mut groups = Vec::with_capacity(records.len());
                for group in records {
                    let length = r.u8()? as usize;
                    if length != 1 + 2 * group.record_length as usize {
                        return Err(ModbusError::frame(format!(
                            "File record group length {} does not match {} registers",
                            length, group.record_length
                        )));
                    }
                    read_reference_type(&mut r)?;
                    groups.push(r.words(group.record_length as usize)?);
                }
                Self::ReadFileRecord(groups)
            }
            Request::WriteFileRecord { records } => {
                let echoed = read_file_records(&mut r)?;
                if &echoed != records {
                    return Err(ModbusError::protocol(
                        "Write File Record echo does not match the records sent",
                    ));
                }
                Self::WriteFileRecord(echoed)
            }
            Request::ReadDeviceIdentification { read_code, .. } => {
                check_echo(function, "MEI type", MEI_READ_DEVICE_ID.into(), r.u8()?.into())?;
                check_echo(function, "read code", read_code.to_u8().into(), r.u8()?.into())?;
                let conformity_level = r.u8()?;
                let more_follows = match r.u8()? {
                    0x00 => false,
                    0xFF => true,
                    other => {
                        return Err(ModbusError::frame(format!(
                            "More-follows flag 0x{:02X} is neither 0x00 nor 0xFF",
                            other
                        )))
                    }
                };
                let next_object_id = r.u8()?;
                let count = r.u8()? as usize;
                let mut objects = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = r.u8()?;
                    let len = r.u8()? as usize;
                    objects.push(DeviceObject {
                        id,
                        value: r.bytes(len)?.to_vec(),
                    });
                }
                Self::ReadDeviceIdentification(DeviceIdentification {
                    read_code: *read_code,
                    conformity_level,
                    more_follows,
                    next_object_id,
                    objects,
                })
            }
        };

        r.finish()?;
        debug!(
            "PDU parsed: FC={:02X} ({}), data_len={}",
            fc,
            function.description(),
            pdu.len() - 1
        );
        Ok(response)
    }

    /// Encode the response into a PDU (slave side, tests)
    pub fn to_pdu(&self) -> ModbusResult<ModbusPdu> {
        let b = PduBuilder::new().function_code(self.function().to_u8())?;
        let pdu = match self {
            Self::ReadCoils(bits) | Self::ReadDiscreteInputs(bits) => {
                let packed = pack_bits(bits);
                b.byte(packed.len() as u8)?.data(&packed)?.build()
            }
            Self::ReadHoldingRegisters(regs)
            | Self::ReadInputRegisters(regs)
            | Self::ReadWriteMultipleRegisters(regs) => {
                b.byte((regs.len() * 2) as u8)?.words(regs)?.build()
            }
            Self::WriteSingleCoil { address, value } | Self::WriteSingleRegister { address, value } => {
                b.address(*address)?.word(*value)?.build()
            }
            Self::ReadExceptionStatus(status) => b.byte(*status)?.build(),
            Self::Diagnostics { sub_function, data } => b.word(*sub_function)?.word(*data)?.build(),
            Self::GetCommEventCounter {
                status,
                event_count,
            } => b.word(*status)?.word(*event_count)?.build(),
            Self::GetCommEventLog {
                status,
                event_count,
                message_count,
                events,
            } => b
                .byte((6 + events.len()) as u8)?
                .word(*status)?
                .word(*event_count)?
                .word(*message_count)?
                .data(events)?
                .build(),
            Self::WriteMultipleCoils { address, quantity }
            | Self::WriteMultipleRegisters { address, quantity } => {
                b.address(*address)?.quantity(*quantity)?.build()
            }
            Self::ReportSlaveId(data) => b.byte(data.len() as u8)?.data(data)?.build(),
            Self::MaskWriteRegister {
                address,
                and_mask,
                or_mask,
            } => b.address(*address)?.word(*and_mask)?.word(*or_mask)?.build(),
            Self::ReadFifoQueue(regs) => b
                .word((2 + regs.len() * 2) as u16)?
                .word(regs.len() as u16)?
                .words(regs)?
                .build(),
            Self::ReadFileRecord(groups) => {
                let byte_count: usize = groups.iter().map(|g| 2 + 2 * g.len()).sum();
                let mut b = b.byte(byte_count as u8)?;
                for group in groups {
                    b = b
                        .byte((1 + 2 * group.len()) as u8)?
                        .byte(FILE_RECORD_REFERENCE_TYPE)?
                        .words(group)?;
                }
                b.build()
            }
            Self::WriteFileRecord(records) => put_file_records(b, records)?.build(),
            Self::ReadDeviceIdentification(ident) => {
                let mut b = b
                    .byte(MEI_READ_DEVICE_ID)?
                    .byte(ident.read_code.to_u8())?
                    .byte(ident.conformity_level)?
                    .byte(if ident.more_follows { 0xFF } else { 0x00 })?
                    .byte(ident.next_object_id)?
                    .byte(ident.objects.len() as u8)?;
                for object in &ident.objects {
                    b = b.byte(object.id)?.byte(object.value.len() as u8)?.data(&object.value)?;
                }
                b.build()
            }
        };
        Ok(pdu)
    }
}

/// Which side of the exchange a PDU belongs to; shapes differ per direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduDirection {
    /// Master to slave
    Request,
    /// Slave to master
    Response,
}

/// Total PDU length implied by its leading bytes.
///
/// Returns `Ok(None)` while more header bytes are needed. Used by the
/// streaming frame decoder for encodings without a length field.
pub fn expected_pdu_len(direction: PduDirection, head: &[u8]) -> ModbusResult<Option<usize>> {
    let Some(&fc) = head.first() else {
        return Ok(None);
    };

    if direction == PduDirection::Response && fc & EXCEPTION_OFFSET != 0 {
        return Ok(Some(2));
    }

    let function = ModbusFunction::from_u8(fc)
        .map_err(|_| ModbusError::frame(format!("Unsupported function code 0x{:02X} in frame", fc)))?;

    // (offset of the byte count field, width of that field, bytes before payload)
    let counted = |offset: usize, wide: bool| -> Option<usize> {
        if wide {
            let hi = *head.get(offset)? as usize;
            let lo = *head.get(offset + 1)? as usize;
            Some(offset + 2 + ((hi << 8) | lo))
        } else {
            head.get(offset).map(|&bc| offset + 1 + bc as usize)
        }
    };

    let len = match (direction, function) {
        (PduDirection::Request, f) => match f {
            ModbusFunction::ReadExceptionStatus
            | ModbusFunction::GetCommEventCounter
            | ModbusFunction::GetCommEventLog
            | ModbusFunction::ReportSlaveId => Some(1),
            ModbusFunction::ReadFifoQueue => Some(3),
            ModbusFunction::MaskWriteRegister => Some(7),
            ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters => counted(5, false),
            ModbusFunction::ReadWriteMultipleRegisters => counted(9, false),
            ModbusFunction::ReadFileRecord | ModbusFunction::WriteFileRecord => counted(1, false),
            ModbusFunction::ReadDeviceIdentification => Some(4),
            _ => Some(5),
        },
        (PduDirection::Response, f) => match f {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters
            | ModbusFunction::GetCommEventLog
            | ModbusFunction::ReportSlaveId
            | ModbusFunction::ReadWriteMultipleRegisters
            | ModbusFunction::ReadFileRecord
            | ModbusFunction::WriteFileRecord => counted(1, false),
            ModbusFunction::ReadExceptionStatus => Some(2),
            ModbusFunction::MaskWriteRegister => Some(7),
            ModbusFunction::ReadFifoQueue => counted(1, true),
            ModbusFunction::ReadDeviceIdentification => device_id_len(head),
            _ => Some(5),
        },
    };

    match len {
        Some(n) if n > MAX_PDU_SIZE => Err(ModbusError::frame(format!(
            "Implied PDU length {} exceeds maximum {}",
            n, MAX_PDU_SIZE
        ))),
        other => Ok(other),
    }
}

/// Device identification replies carry no byte count: walk the object list
fn device_id_len(head: &[u8]) -> Option<usize> {
    let count = *head.get(6)? as usize;
    let mut len = 7;
    for _ in 0..count {
        if len > MAX_PDU_SIZE {
            break;
        }
        len += 2 + *head.get(len + 1)? as usize;
    }
    Some(len)
}
