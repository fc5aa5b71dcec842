//! End-to-end transactions against scripted slaves on in-memory and TCP streams

use std::time::Duration;

use bytes::BytesMut;
use modbus_master::frame;
use modbus_master::{
    Adu, FrameDecoder, FrameEncoding, ModbusClient, ModbusConfig, ModbusError, ModbusException,
    ModbusMaster, ModbusPdu, ModbusTcpClient, Request,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Scripted slave side of a connection
struct Slave<S> {
    stream: S,
    encoding: FrameEncoding,
    decoder: FrameDecoder,
    buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Slave<S> {
    fn new(stream: S, encoding: FrameEncoding) -> Self {
        Self {
            stream,
            encoding,
            decoder: FrameDecoder::request(encoding),
            buf: BytesMut::new(),
        }
    }

    /// Next request frame, or None at end of stream
    async fn next(&mut self) -> Option<Adu> {
        loop {
            if let Some(adu) = self.decoder.decode(&mut self.buf).unwrap() {
                return Some(adu);
            }
            if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                return None;
            }
        }
    }

    async fn reply_with_id(&mut self, transaction_id: u16, unit_id: u8, pdu: &[u8]) {
        let adu = Adu::new(transaction_id, unit_id, ModbusPdu::from_slice(pdu).unwrap());
        let bytes = frame::encode(self.encoding, &adu).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    async fn reply(&mut self, request: &Adu, pdu: &[u8]) {
        self.reply_with_id(request.transaction_id, request.unit_id, pdu).await;
    }

    /// Count the remaining requests until the master hangs up
    async fn drain(&mut self) -> usize {
        let mut seen = 0;
        while self.next().await.is_some() {
            seen += 1;
        }
        seen
    }
}

fn duplex_master(encoding: FrameEncoding, config: ModbusConfig) -> (ModbusMaster, Slave<DuplexStream>) {
    let (client, server) = tokio::io::duplex(1024);
    let master = ModbusMaster::spawn(client, encoding, config).unwrap();
    (master, Slave::new(server, encoding))
}

fn read_ten() -> Request {
    Request::ReadHoldingRegisters {
        address: 0,
        quantity: 10,
    }
}

#[tokio::test(start_paused = true)]
async fn mismatched_transaction_ids_exhaust_the_retry_budget() {
    let config = ModbusConfig::default().with_timeout(Duration::from_millis(200));
    let (master, mut slave) = duplex_master(FrameEncoding::Tcp, config);

    let server = tokio::spawn(async move {
        let mut seen = 0;
        while let Some(request) = slave.next().await {
            seen += 1;
            let mut pdu = vec![0x03, 20];
            pdu.extend_from_slice(&[0u8; 20]);
            let wrong_id = request.transaction_id.wrapping_add(1000);
            slave.reply_with_id(wrong_id, request.unit_id, &pdu).await;
        }
        seen
    });

    let err = master.execute(1, read_ten()).await.unwrap_err();
    match err {
        ModbusError::CommunicationFailure { attempts, last } => {
            assert_eq!(attempts, 4);
            assert!(matches!(*last, ModbusError::Timeout { .. }));
        }
        other => panic!("expected communication failure, got {other:?}"),
    }

    let stats = master.get_stats();
    assert_eq!(stats.requests_sent, 4);
    assert_eq!(stats.stray_frames, 4);
    assert_eq!(stats.responses_received, 0);

    master.close().await.unwrap();
    assert_eq!(server.await.unwrap(), 4);
}

#[tokio::test]
async fn invalid_coil_value_never_touches_the_transport() {
    let (master, mut slave) = duplex_master(FrameEncoding::Tcp, ModbusConfig::default());

    let err = master
        .execute(
            1,
            Request::WriteSingleCoil {
                address: 0,
                value: 0x1234,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ModbusError::InvalidArgument { .. }));

    master.close().await.unwrap();
    assert_eq!(slave.drain().await, 0);
    assert_eq!(master.get_stats().requests_sent, 0);
}

#[tokio::test]
async fn exception_is_surfaced_without_retrying() {
    let (master, mut slave) = duplex_master(FrameEncoding::Tcp, ModbusConfig::default());

    let server = tokio::spawn(async move {
        let request = slave.next().await.unwrap();
        slave.reply(&request, &[0x83, 0x02]).await;
        1 + slave.drain().await
    });

    let err = master.read_holding_registers(1, 0xFFF0, 10).await.unwrap_err();
    assert_eq!(err.exception_kind(), Some(ModbusException::IllegalDataAddress));
    assert_eq!(master.get_stats().exceptions, 1);

    master.close().await.unwrap();
    assert_eq!(server.await.unwrap(), 1);
}

#[tokio::test]
async fn unknown_exception_code_is_still_an_exception() {
    let (master, mut slave) = duplex_master(FrameEncoding::Rtu, ModbusConfig::default());

    tokio::spawn(async move {
        let request = slave.next().await.unwrap();
        slave.reply(&request, &[0x86, 0x42]).await;
        slave.drain().await
    });

    let err = master.write_single_register(3, 1, 7).await.unwrap_err();
    assert_eq!(err.exception_kind(), Some(ModbusException::Unknown(0x42)));
}

#[tokio::test]
async fn concurrent_requests_are_matched_out_of_order() {
    let (master, mut slave) = duplex_master(FrameEncoding::Tcp, ModbusConfig::default());

    tokio::spawn(async move {
        let first = slave.next().await.unwrap();
        let second = slave.next().await.unwrap();
        assert_ne!(first.transaction_id, second.transaction_id);

        // Answer the later request first; each reply carries its start address
        for request in [&second, &first] {
            let pdu = request.pdu.as_slice();
            slave.reply(request, &[0x04, 0x02, pdu[1], pdu[2]]).await;
        }
        slave.drain().await
    });

    let a = master
        .submit(1, Request::ReadInputRegisters { address: 100, quantity: 1 })
        .unwrap();
    let b = master
        .submit(1, Request::ReadInputRegisters { address: 200, quantity: 1 })
        .unwrap();

    assert_eq!(a.await.unwrap().into_registers().unwrap(), vec![100]);
    assert_eq!(b.await.unwrap().into_registers().unwrap(), vec![200]);
}

#[tokio::test(start_paused = true)]
async fn cancelled_request_is_never_sent() {
    let config = ModbusConfig::default().with_serial_encoding("ascii".parse().unwrap());
    let (client, server) = tokio::io::duplex(1024);
    let master = ModbusMaster::spawn_serial(client, config).unwrap();
    let mut slave = Slave::new(server, FrameEncoding::Ascii);
    let (go, wait) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let request = slave.next().await.unwrap();
        wait.await.unwrap();
        slave.reply(&request, &[0x06, 0x00, 0x01, 0x00, 0x03]).await;
        1 + slave.drain().await
    });

    let first = master
        .submit(1, Request::WriteSingleRegister { address: 1, value: 3 })
        .unwrap();
    // Serial lines carry one transaction at a time, so this one is queued
    let second = master
        .submit(1, Request::WriteSingleRegister { address: 2, value: 4 })
        .unwrap();
    second.cancel();

    // Let the worker settle before the slave answers
    tokio::time::sleep(Duration::from_millis(10)).await;
    go.send(()).unwrap();

    first.await.unwrap();
    master.close().await.unwrap();
    assert_eq!(server.await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn corrupted_serial_reply_is_retried() {
    let config = ModbusConfig::default()
        .with_serial_encoding("rtu".parse().unwrap())
        .with_timeout(Duration::from_millis(500));
    let (client, server) = tokio::io::duplex(1024);
    let master = ModbusMaster::spawn_serial(client, config).unwrap();
    let mut slave = Slave::new(server, FrameEncoding::Rtu);

    tokio::spawn(async move {
        let request = slave.next().await.unwrap();
        // Valid reply with one payload bit flipped, so the CRC no longer matches
        let adu = Adu::new(0, request.unit_id, ModbusPdu::from_slice(&[0x03, 0x02, 0x00, 0x2A]).unwrap());
        let mut bytes = frame::encode(FrameEncoding::Rtu, &adu).unwrap();
        bytes[4] ^= 0x01;
        slave.stream.write_all(&bytes).await.unwrap();

        let retry = slave.next().await.unwrap();
        slave.reply(&retry, &[0x03, 0x02, 0x00, 0x2A]).await;
        slave.drain().await
    });

    let regs = master.read_holding_registers(9, 0, 1).await.unwrap();
    assert_eq!(regs, vec![42]);
    let stats = master.get_stats();
    assert_eq!(stats.requests_sent, 2);
    assert_eq!(stats.retries, 1);
}

#[tokio::test]
async fn tcp_client_reconnects_after_the_server_hangs_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        // First connection: take the request and hang up
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 12];
        socket.read_exact(&mut request).await.unwrap();
        drop(socket);

        // Second connection: answer properly
        let (socket, _) = listener.accept().await.unwrap();
        let mut slave = Slave::new(socket, FrameEncoding::Tcp);
        let request = slave.next().await.unwrap();
        slave.reply(&request, &[0x03, 0x02, 0x12, 0x34]).await;
        slave.drain().await
    });

    let config = ModbusConfig::default().with_timeout(Duration::from_secs(2));
    let client = ModbusTcpClient::connect(addr, config).await.unwrap();

    let regs = client.read_03(1, 0, 1).await.unwrap();
    assert_eq!(regs, vec![0x1234]);

    let stats = client.get_stats();
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.requests_sent, 2);
    client.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn late_reply_to_cancelled_serial_request_is_not_misattributed() {
    let config = ModbusConfig::default()
        .with_serial_encoding("rtu".parse().unwrap())
        .with_timeout(Duration::from_millis(500));
    let (client, server) = tokio::io::duplex(1024);
    let master = ModbusMaster::spawn_serial(client, config).unwrap();
    let mut slave = Slave::new(server, FrameEncoding::Rtu);
    let (go, wait) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let first = slave.next().await.unwrap();
        wait.await.unwrap();
        slave.reply(&first, &[0x03, 0x02, 0xAA, 0xAA]).await;

        // Only sent once the slow reply has cleared the line
        let second = slave.next().await.unwrap();
        assert_eq!(&second.pdu.as_slice()[1..3], &200u16.to_be_bytes());
        slave.reply(&second, &[0x03, 0x02, 0xBB, 0xBB]).await;
        2 + slave.drain().await
    });

    let first = master
        .submit(1, Request::ReadHoldingRegisters { address: 100, quantity: 1 })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    first.cancel();

    let second = master
        .submit(1, Request::ReadHoldingRegisters { address: 200, quantity: 1 })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(master.get_stats().requests_sent, 1);
    go.send(()).unwrap();

    let regs = second.await.unwrap().into_registers().unwrap();
    assert_eq!(regs, vec![0xBBBB]);

    let stats = master.get_stats();
    assert_eq!(stats.requests_sent, 2);
    assert_eq!(stats.stray_frames, 1);
    assert_eq!(stats.responses_received, 1);

    master.close().await.unwrap();
    assert_eq!(server.await.unwrap(), 2);
}

#[tokio::test]
async fn timeout_with_reconnect_retries_on_a_fresh_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // First connection: swallow the request and stay silent
        let (mut silent, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 12];
        silent.read_exact(&mut request).await.unwrap();

        let (socket, _) = listener.accept().await.unwrap();
        let mut slave = Slave::new(socket, FrameEncoding::Tcp);
        let retry = slave.next().await.unwrap();
        assert_ne!(retry.transaction_id, u16::from_be_bytes([request[0], request[1]]));
        slave.reply(&retry, &[0x03, 0x02, 0x00, 0x07]).await;
        drop(silent);
        1 + slave.drain().await
    });

    let config = ModbusConfig::default()
        .with_timeout(Duration::from_millis(300))
        .with_reconnect(true);
    let client = ModbusTcpClient::connect(addr, config).await.unwrap();

    assert_eq!(client.read_03(1, 0, 1).await.unwrap(), vec![7]);

    let stats = client.get_stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.requests_sent, 2);

    client.close().await.unwrap();
    assert_eq!(server.await.unwrap(), 1);
}
