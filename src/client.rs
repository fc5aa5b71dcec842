//! High-level Modbus client API
//!
//! Typed, per-function-code methods over a [`ModbusMaster`]. The master owns
//! framing, transaction ids, deadlines and retries; this module only turns
//! arguments into a [`Request`] and the [`Response`] back into plain values.
//!
//! Because every method takes `&self`, one client can be shared between tasks
//! and its requests run concurrently (over TCP, up to
//! [`ModbusConfig::max_in_flight`] at a time).
//!
//! # API Naming Convention
//!
//! This library provides a **dual-track API**:
//!
//! | Function Code | Primary Name | Semantic Alias |
//! |---------------|--------------|----------------|
//! | 0x01 | `read_01()` | `read_coils()` |
//! | 0x02 | `read_02()` | `read_discrete_inputs()` |
//! | 0x03 | `read_03()` | `read_holding_registers()` |
//! | 0x04 | `read_04()` | `read_input_registers()` |
//! | 0x05 | `write_05()` | `write_single_coil()` |
//! | 0x06 | `write_06()` | `write_single_register()` |
//! | 0x07 | `read_07()` | `read_exception_status()` |
//! | 0x08 | `diagnostics_08()` | `diagnostics()` |
//! | 0x0B | `read_0b()` | `get_comm_event_counter()` |
//! | 0x0C | `read_0c()` | `get_comm_event_log()` |
//! | 0x0F | `write_0f()` | `write_multiple_coils()` |
//! | 0x10 | `write_10()` | `write_multiple_registers()` |
//! | 0x11 | `read_11()` | `report_slave_id()` |
//! | 0x14 | `read_14()` | `read_file_record()` |
//! | 0x15 | `write_15()` | `write_file_record()` |
//! | 0x16 | `write_16()` | `mask_write_register()` |
//! | 0x17 | `read_write_17()` | `read_write_multiple_registers()` |
//! | 0x18 | `read_18()` | `read_fifo_queue()` |
//! | 0x2B / 0x0E | `read_2b()` | `read_device_identification()` |
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use modbus_master::{ModbusClient, ModbusConfig, ModbusResult, ModbusTcpClient};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let client = ModbusTcpClient::from_address("127.0.0.1:502", ModbusConfig::default()).await?;
//!
//!     // Read 10 holding registers from slave 1, starting at address 0
//!     let registers = client.read_03(1, 0, 10).await?;
//!     println!("Registers: {:?}", registers);
//!
//!     // Write a value to register 100
//!     client.write_06(1, 100, 0x1234).await?;
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::net::{IpAddr, SocketAddr};

use crate::config::ModbusConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::FrameEncoding;
use crate::master::ModbusMaster;
use crate::protocol::{
    DeviceIdCode, DeviceIdentification, FileRecord, FileRecordRef, Request, Response, SlaveId,
};
use crate::transport::{TcpTransport, TransportStats};

#[cfg(feature = "serial")]
use crate::transport::{SerialConfig, SerialTransport};

/// Reply to Get Comm Event Log (0x0C)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommEventLog {
    pub status: u16,
    pub event_count: u16,
    pub message_count: u16,
    /// Most recent event first
    pub events: Vec<u8>,
}

fn unexpected<T>(response: Response) -> ModbusResult<T> {
    Err(ModbusError::protocol(format!(
        "Unexpected response: {}",
        response.function()
    )))
}

/// Trait defining the interface for Modbus client operations.
///
/// Implementors only provide [`ModbusClient::execute`]; every function-code
/// method is built on it.
///
/// # Implemented By
///
/// - [`ModbusMaster`] - any transport and encoding
/// - [`ModbusTcpClient`] - Modbus TCP client
/// - [`ModbusSerialClient`] - serial line client (requires `serial` feature)
///
/// # Protocol Limits
///
/// Requests beyond these limits fail locally with
/// [`ModbusError::InvalidArgument`] and are never sent:
///
/// | Operation | Limit |
/// |-----------|-------|
/// | Read Coils (0x01) | 2000 coils |
/// | Read Discrete Inputs (0x02) | 2000 bits |
/// | Read Holding Registers (0x03) | 125 registers |
/// | Read Input Registers (0x04) | 125 registers |
/// | Write Multiple Coils (0x0F) | 1968 coils |
/// | Write Multiple Registers (0x10) | 123 registers |
/// | Read/Write Multiple Registers (0x17) | 125 read, 121 written |
pub trait ModbusClient: Send + Sync {
    /// Send a raw request and wait for its response.
    fn execute(
        &self,
        slave_id: SlaveId,
        request: Request,
    ) -> impl Future<Output = ModbusResult<Response>> + Send;

    /// Read coils (function code 0x01).
    ///
    /// # Arguments
    ///
    /// * `slave_id` - The Modbus slave/unit ID
    /// * `address` - Starting coil address (0-65535)
    /// * `quantity` - Number of coils to read (1-2000)
    fn read_01(
        &self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send {
        async move {
            self.execute(slave_id, Request::ReadCoils { address, quantity })
                .await?
                .into_bits()
        }
    }

    /// Read discrete inputs (function code 0x02).
    fn read_02(
        &self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send {
        async move {
            self.execute(slave_id, Request::ReadDiscreteInputs { address, quantity })
                .await?
                .into_bits()
        }
    }

    /// Read holding registers (function code 0x03).
    ///
    /// Reads the contents of a contiguous block of holding registers.
    /// This is the most commonly used function for reading process data.
    ///
    /// # Arguments
    ///
    /// * `slave_id` - The Modbus slave/unit ID
    /// * `address` - Starting register address (0-65535)
    /// * `quantity` - Number of registers to read (1-125)
    fn read_03(
        &self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        async move {
            self.execute(slave_id, Request::ReadHoldingRegisters { address, quantity })
                .await?
                .into_registers()
        }
    }

    /// Read input registers (function code 0x04).
    fn read_04(
        &self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        async move {
            self.execute(slave_id, Request::ReadInputRegisters { address, quantity })
                .await?
                .into_registers()
        }
    }

    /// Write single coil (function code 0x05).
    fn write_05(
        &self,
        slave_id: SlaveId,
        address: u16,
        value: bool,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        async move {
            self.execute(slave_id, Request::write_single_coil(address, value))
                .await
                .map(|_| ())
        }
    }

    /// Write single register (function code 0x06).
    fn write_06(
        &self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        async move {
            self.execute(slave_id, Request::WriteSingleRegister { address, value })
                .await
                .map(|_| ())
        }
    }

    /// Read exception status (function code 0x07, serial line only).
    fn read_07(&self, slave_id: SlaveId) -> impl Future<Output = ModbusResult<u8>> + Send {
        async move {
            match self.execute(slave_id, Request::ReadExceptionStatus).await? {
                Response::ReadExceptionStatus(status) => Ok(status),
                other => unexpected(other),
            }
        }
    }

    /// Diagnostics (function code 0x08, serial line only). Returns the data
    /// word echoed or produced by the sub-function.
    fn diagnostics_08(
        &self,
        slave_id: SlaveId,
        sub_function: u16,
        data: u16,
    ) -> impl Future<Output = ModbusResult<u16>> + Send {
        async move {
            match self
                .execute(slave_id, Request::Diagnostics { sub_function, data })
                .await?
            {
                Response::Diagnostics { data, .. } => Ok(data),
                other => unexpected(other),
            }
        }
    }

    /// Get comm event counter (function code 0x0B). Returns `(status, event_count)`.
    fn read_0b(&self, slave_id: SlaveId) -> impl Future<Output = ModbusResult<(u16, u16)>> + Send {
        async move {
            match self.execute(slave_id, Request::GetCommEventCounter).await? {
                Response::GetCommEventCounter { status, event_count } => Ok((status, event_count)),
                other => unexpected(other),
            }
        }
    }

    /// Get comm event log (function code 0x0C).
    fn read_0c(&self, slave_id: SlaveId) -> impl Future<Output = ModbusResult<CommEventLog>> + Send {
        async move {
            match self.execute(slave_id, Request::GetCommEventLog).await? {
                Response::GetCommEventLog {
                    status,
                    event_count,
                    message_count,
                    events,
                } => Ok(CommEventLog {
                    status,
                    event_count,
                    message_count,
                    events,
                }),
                other => unexpected(other),
            }
        }
    }

    /// Write multiple coils (function code 0x0F).
    fn write_0f(
        &self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        let coils = values.to_vec();
        async move {
            self.execute(slave_id, Request::WriteMultipleCoils { address, coils })
                .await
                .map(|_| ())
        }
    }

    /// Write multiple registers (function code 0x10).
    fn write_10(
        &self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        let values = values.to_vec();
        async move {
            self.execute(slave_id, Request::WriteMultipleRegisters { address, values })
                .await
                .map(|_| ())
        }
    }

    /// Report slave id (function code 0x11). Returns the device-specific bytes.
    fn read_11(&self, slave_id: SlaveId) -> impl Future<Output = ModbusResult<Vec<u8>>> + Send {
        async move {
            match self.execute(slave_id, Request::ReportSlaveId).await? {
                Response::ReportSlaveId(data) => Ok(data),
                other => unexpected(other),
            }
        }
    }

    /// Read file record (function code 0x14). Returns the registers of each
    /// group, in the order requested.
    fn read_14(
        &self,
        slave_id: SlaveId,
        records: &[FileRecordRef],
    ) -> impl Future<Output = ModbusResult<Vec<Vec<u16>>>> + Send {
        let records = records.to_vec();
        async move {
            match self.execute(slave_id, Request::ReadFileRecord { records }).await? {
                Response::ReadFileRecord(groups) => Ok(groups),
                other => unexpected(other),
            }
        }
    }

    /// Write file record (function code 0x15).
    fn write_15(
        &self,
        slave_id: SlaveId,
        records: &[FileRecord],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        let records = records.to_vec();
        async move {
            self.execute(slave_id, Request::WriteFileRecord { records })
                .await
                .map(|_| ())
        }
    }

    /// Mask write register (function code 0x16).
    ///
    /// The slave stores `(current AND and_mask) OR (or_mask AND NOT and_mask)`.
    fn write_16(
        &self,
        slave_id: SlaveId,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        async move {
            self.execute(
                slave_id,
                Request::MaskWriteRegister {
                    address,
                    and_mask,
                    or_mask,
                },
            )
            .await
            .map(|_| ())
        }
    }

    /// Read/write multiple registers (function code 0x17).
    ///
    /// The write block is applied before the read block is read.
    fn read_write_17(
        &self,
        slave_id: SlaveId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        let values = values.to_vec();
        async move {
            self.execute(
                slave_id,
                Request::ReadWriteMultipleRegisters {
                    read_address,
                    read_quantity,
                    write_address,
                    values,
                },
            )
            .await?
            .into_registers()
        }
    }

    /// Read FIFO queue (function code 0x18).
    fn read_18(
        &self,
        slave_id: SlaveId,
        address: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        async move {
            self.execute(slave_id, Request::ReadFifoQueue { address })
                .await?
                .into_registers()
        }
    }

    /// Read device identification (function code 0x2B, MEI type 0x0E).
    ///
    /// Start with `object_id` 0; if the reply has `more_follows` set, call
    /// again with its `next_object_id`.
    fn read_2b(
        &self,
        slave_id: SlaveId,
        read_code: DeviceIdCode,
        object_id: u8,
    ) -> impl Future<Output = ModbusResult<DeviceIdentification>> + Send {
        async move {
            match self
                .execute(slave_id, Request::ReadDeviceIdentification { read_code, object_id })
                .await?
            {
                Response::ReadDeviceIdentification(ident) => Ok(ident),
                other => unexpected(other),
            }
        }
    }

    /// Check if the client is connected.
    fn is_connected(&self) -> bool;

    /// Close the client connection. Requests still in flight fail.
    fn close(&self) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Get transport statistics.
    fn get_stats(&self) -> TransportStats;

    // ========================================================================
    // Semantic aliases
    // ========================================================================

    /// Alias for [`read_01`](Self::read_01)
    fn read_coils(
        &self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send {
        self.read_01(slave_id, address, quantity)
    }

    /// Alias for [`read_02`](Self::read_02)
    fn read_discrete_inputs(
        &self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<bool>>> + Send {
        self.read_02(slave_id, address, quantity)
    }

    /// Alias for [`read_03`](Self::read_03)
    fn read_holding_registers(
        &self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        self.read_03(slave_id, address, quantity)
    }

    /// Alias for [`read_04`](Self::read_04)
    fn read_input_registers(
        &self,
        slave_id: SlaveId,
        address: u16,
        quantity: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        self.read_04(slave_id, address, quantity)
    }

    /// Alias for [`write_05`](Self::write_05)
    fn write_single_coil(
        &self,
        slave_id: SlaveId,
        address: u16,
        value: bool,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_05(slave_id, address, value)
    }

    /// Alias for [`write_06`](Self::write_06)
    fn write_single_register(
        &self,
        slave_id: SlaveId,
        address: u16,
        value: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_06(slave_id, address, value)
    }

    /// Alias for [`read_07`](Self::read_07)
    fn read_exception_status(&self, slave_id: SlaveId) -> impl Future<Output = ModbusResult<u8>> + Send {
        self.read_07(slave_id)
    }

    /// Alias for [`diagnostics_08`](Self::diagnostics_08)
    fn diagnostics(
        &self,
        slave_id: SlaveId,
        sub_function: u16,
        data: u16,
    ) -> impl Future<Output = ModbusResult<u16>> + Send {
        self.diagnostics_08(slave_id, sub_function, data)
    }

    /// Alias for [`read_0b`](Self::read_0b)
    fn get_comm_event_counter(
        &self,
        slave_id: SlaveId,
    ) -> impl Future<Output = ModbusResult<(u16, u16)>> + Send {
        self.read_0b(slave_id)
    }

    /// Alias for [`read_0c`](Self::read_0c)
    fn get_comm_event_log(
        &self,
        slave_id: SlaveId,
    ) -> impl Future<Output = ModbusResult<CommEventLog>> + Send {
        self.read_0c(slave_id)
    }

    /// Alias for [`write_0f`](Self::write_0f)
    fn write_multiple_coils(
        &self,
        slave_id: SlaveId,
        address: u16,
        values: &[bool],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_0f(slave_id, address, values)
    }

    /// Alias for [`write_10`](Self::write_10)
    fn write_multiple_registers(
        &self,
        slave_id: SlaveId,
        address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_10(slave_id, address, values)
    }

    /// Alias for [`read_11`](Self::read_11)
    fn report_slave_id(&self, slave_id: SlaveId) -> impl Future<Output = ModbusResult<Vec<u8>>> + Send {
        self.read_11(slave_id)
    }

    /// Alias for [`read_14`](Self::read_14)
    fn read_file_record(
        &self,
        slave_id: SlaveId,
        records: &[FileRecordRef],
    ) -> impl Future<Output = ModbusResult<Vec<Vec<u16>>>> + Send {
        self.read_14(slave_id, records)
    }

    /// Alias for [`write_15`](Self::write_15)
    fn write_file_record(
        &self,
        slave_id: SlaveId,
        records: &[FileRecord],
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_15(slave_id, records)
    }

    /// Alias for [`write_16`](Self::write_16)
    fn mask_write_register(
        &self,
        slave_id: SlaveId,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> impl Future<Output = ModbusResult<()>> + Send {
        self.write_16(slave_id, address, and_mask, or_mask)
    }

    /// Alias for [`read_write_17`](Self::read_write_17)
    fn read_write_multiple_registers(
        &self,
        slave_id: SlaveId,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        self.read_write_17(slave_id, read_address, read_quantity, write_address, values)
    }

    /// Alias for [`read_18`](Self::read_18)
    fn read_fifo_queue(
        &self,
        slave_id: SlaveId,
        address: u16,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send {
        self.read_18(slave_id, address)
    }

    /// Alias for [`read_2b`](Self::read_2b)
    fn read_device_identification(
        &self,
        slave_id: SlaveId,
        read_code: DeviceIdCode,
        object_id: u8,
    ) -> impl Future<Output = ModbusResult<DeviceIdentification>> + Send {
        self.read_2b(slave_id, read_code, object_id)
    }
}

impl ModbusClient for ModbusMaster {
    fn execute(
        &self,
        slave_id: SlaveId,
        request: Request,
    ) -> impl Future<Output = ModbusResult<Response>> + Send {
        ModbusMaster::execute(self, slave_id, request)
    }

    fn is_connected(&self) -> bool {
        ModbusMaster::is_connected(self)
    }

    fn close(&self) -> impl Future<Output = ModbusResult<()>> + Send {
        ModbusMaster::close(self)
    }

    fn get_stats(&self) -> TransportStats {
        ModbusMaster::get_stats(self)
    }
}

/// Modbus TCP client
#[derive(Debug, Clone)]
pub struct ModbusTcpClient {
    master: ModbusMaster,
    server: SocketAddr,
}

impl ModbusTcpClient {
    /// Connect to `addr` and start the connection worker.
    ///
    /// `config.timeout` bounds the connect as well as each response.
    pub async fn connect(addr: SocketAddr, config: ModbusConfig) -> ModbusResult<Self> {
        config.validate()?;
        let transport = TcpTransport::connect(addr, config.timeout).await?;
        let master = ModbusMaster::spawn(transport, FrameEncoding::Tcp, config)?;
        Ok(Self { master, server: addr })
    }

    /// Connect to `"host:port"`, or to a bare IP address on `config.port`
    pub async fn from_address(addr: &str, config: ModbusConfig) -> ModbusResult<Self> {
        let addr = parse_address(addr, config.port)?;
        Self::connect(addr, config).await
    }

    /// Get the server address
    pub fn server_address(&self) -> SocketAddr {
        self.server
    }

    /// The underlying master handle, for raw [`Request`] submission
    pub fn master(&self) -> &ModbusMaster {
        &self.master
    }
}

fn parse_address(addr: &str, default_port: u16) -> ModbusResult<SocketAddr> {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return Ok(socket);
    }
    addr.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|e| ModbusError::configuration(format!("Invalid address '{}': {}", addr, e)))
}

impl ModbusClient for ModbusTcpClient {
    fn execute(
        &self,
        slave_id: SlaveId,
        request: Request,
    ) -> impl Future<Output = ModbusResult<Response>> + Send {
        self.master.execute(slave_id, request)
    }

    fn is_connected(&self) -> bool {
        self.master.is_connected()
    }

    fn close(&self) -> impl Future<Output = ModbusResult<()>> + Send {
        self.master.close()
    }

    fn get_stats(&self) -> TransportStats {
        self.master.get_stats()
    }
}

/// Serial line client; `config.serial_encoding` selects ASCII, RTU or Binary
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct ModbusSerialClient {
    master: ModbusMaster,
    port: String,
}

#[cfg(feature = "serial")]
impl ModbusSerialClient {
    /// Open the port and start the connection worker
    pub fn open(serial: SerialConfig, config: ModbusConfig) -> ModbusResult<Self> {
        config.validate()?;
        let port = serial.port.clone();
        let transport = SerialTransport::open(serial)?;
        let master = ModbusMaster::spawn_serial(transport, config)?;
        Ok(Self { master, port })
    }

    /// 8N1 on `port` at `baud_rate`
    pub fn new(port: &str, baud_rate: u32, config: ModbusConfig) -> ModbusResult<Self> {
        Self::open(SerialConfig::new(port, baud_rate), config)
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn master(&self) -> &ModbusMaster {
        &self.master
    }
}

#[cfg(feature = "serial")]
impl ModbusClient for ModbusSerialClient {
    fn execute(
        &self,
        slave_id: SlaveId,
        request: Request,
    ) -> impl Future<Output = ModbusResult<Response>> + Send {
        self.master.execute(slave_id, request)
    }

    fn is_connected(&self) -> bool {
        self.master.is_connected()
    }

    fn close(&self) -> impl Future<Output = ModbusResult<()>> + Send {
        self.master.close()
    }

    fn get_stats(&self) -> TransportStats {
        self.master.get_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{self, Adu, FrameDecoder};
    use crate::pdu::ModbusPdu;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;

    /// Answer each request with the PDU `respond` returns, until EOF
    fn spawn_slave<F>(mut stream: DuplexStream, encoding: FrameEncoding, respond: F)
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::request(encoding);
            let mut buf = BytesMut::new();
            loop {
                while let Some(adu) = decoder.decode(&mut buf).unwrap() {
                    let pdu = respond(adu.pdu.as_slice());
                    let reply = Adu::new(adu.transaction_id, adu.unit_id, ModbusPdu::from_slice(&pdu).unwrap());
                    let bytes = frame::encode(encoding, &reply).unwrap();
                    stream.write_all(&bytes).await.unwrap();
                }
                if stream.read_buf(&mut buf).await.unwrap() == 0 {
                    return;
                }
            }
        });
    }

    fn tcp_master(respond: impl Fn(&[u8]) -> Vec<u8> + Send + 'static) -> ModbusMaster {
        let (client, server) = tokio::io::duplex(512);
        spawn_slave(server, FrameEncoding::Tcp, respond);
        ModbusMaster::spawn(client, FrameEncoding::Tcp, ModbusConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_read_coils_trims_padding() {
        let master = tcp_master(|_| vec![0x01, 0x02, 0b1100_1101, 0xFF]);
        let coils = master.read_coils(1, 0x13, 10).await.unwrap();
        assert_eq!(
            coils,
            vec![true, false, true, true, false, false, true, true, true, true]
        );
    }

    #[tokio::test]
    async fn test_writes_accept_echo() {
        // Echo the request PDU, which is the correct reply for FC05/06/16
        let master = tcp_master(|pdu| pdu.to_vec());
        master.write_05(1, 0xAC, true).await.unwrap();
        master.write_06(1, 0x01, 0x0003).await.unwrap();
        master.write_16(1, 0x04, 0x00F2, 0x0025).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_multiple_registers() {
        let master = tcp_master(|pdu| pdu[..5].to_vec());
        master.write_multiple_registers(1, 0x01, &[0x000A, 0x0102]).await.unwrap();
        assert_eq!(master.get_stats().responses_received, 1);
    }

    #[tokio::test]
    async fn test_serial_only_functions_over_rtu() {
        let (client, server) = tokio::io::duplex(512);
        spawn_slave(server, FrameEncoding::Rtu, |pdu| match pdu[0] {
            0x07 => vec![0x07, 0x6D],
            0x0B => vec![0x0B, 0xFF, 0xFF, 0x01, 0x08],
            0x11 => vec![0x11, 0x03, 0x2A, 0xFF, 0x01],
            _ => vec![pdu[0] | 0x80, 0x01],
        });
        let config = ModbusConfig::default().with_serial_encoding("rtu".parse().unwrap());
        let master = ModbusMaster::spawn_serial(client, config).unwrap();

        assert_eq!(master.read_exception_status(17).await.unwrap(), 0x6D);
        assert_eq!(master.get_comm_event_counter(17).await.unwrap(), (0xFFFF, 0x0108));
        assert_eq!(master.report_slave_id(17).await.unwrap(), vec![0x2A, 0xFF, 0x01]);

        let err = master.read_fifo_queue(17, 0x04DE).await.unwrap_err();
        assert!(err.is_exception());
    }

    #[tokio::test]
    async fn test_file_records_and_device_identification_over_rtu() {
        let (client, server) = tokio::io::duplex(512);
        spawn_slave(server, FrameEncoding::Rtu, |pdu| match pdu[0] {
            0x14 => vec![0x14, 0x06, 0x05, 0x06, 0x0D, 0xFE, 0x00, 0x20],
            0x15 => pdu.to_vec(),
            0x2B => {
                let mut reply = vec![0x2B, 0x0E, 0x01, 0x01, 0xFF, 0x02, 0x02];
                reply.extend_from_slice(&[0x00, 0x04]);
                reply.extend_from_slice(b"ACME");
                reply.extend_from_slice(&[0x01, 0x02]);
                reply.extend_from_slice(b"X1");
                reply
            }
            _ => vec![pdu[0] | 0x80, 0x01],
        });
        let config = ModbusConfig::default().with_serial_encoding("rtu".parse().unwrap());
        let master = ModbusMaster::spawn_serial(client, config).unwrap();

        let groups = master
            .read_file_record(
                2,
                &[FileRecordRef {
                    file_number: 4,
                    record_number: 1,
                    record_length: 2,
                }],
            )
            .await
            .unwrap();
        assert_eq!(groups, vec![vec![0x0DFE, 0x0020]]);

        let record = FileRecord {
            file_number: 4,
            record_number: 7,
            data: vec![0x06AF, 0x04BE],
        };
        master.write_file_record(2, &[record]).await.unwrap();

        let ident = master
            .read_device_identification(2, DeviceIdCode::Basic, 0)
            .await
            .unwrap();
        assert!(ident.more_follows);
        assert_eq!(ident.next_object_id, 0x02);
        assert_eq!(ident.objects.len(), 2);
        assert_eq!(ident.objects[0].value, b"ACME".to_vec());
    }

    #[tokio::test]
    async fn test_shared_client_runs_concurrently() {
        let master = tcp_master(|pdu| {
            // Reply with the start address as the only register
            vec![0x03, 0x02, pdu[1], pdu[2]]
        });
        let (a, b) = tokio::join!(master.read_03(1, 7, 1), master.read_03(1, 9, 1));
        assert_eq!(a.unwrap(), vec![7]);
        assert_eq!(b.unwrap(), vec![9]);
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("10.0.0.5:1502", 502).unwrap(),
            "10.0.0.5:1502".parse().unwrap()
        );
        assert_eq!(
            parse_address("10.0.0.5", 502).unwrap(),
            "10.0.0.5:502".parse().unwrap()
        );
        assert!(matches!(
            parse_address("not-an-address", 502),
            Err(ModbusError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_tcp_client_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            socket.read_exact(&mut request).await.unwrap();
            let mut reply = request[..4].to_vec();
            reply.extend_from_slice(&[0x00, 0x05, request[6], 0x03, 0x02, 0x00, 0x2A]);
            socket.write_all(&reply).await.unwrap();
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });

        let client = ModbusTcpClient::connect(addr, ModbusConfig::default()).await.unwrap();
        assert_eq!(client.server_address(), addr);
        assert_eq!(client.read_holding_registers(1, 0, 1).await.unwrap(), vec![42]);

        client.close().await.unwrap();
        assert!(!client.is_connected());
    }
}
