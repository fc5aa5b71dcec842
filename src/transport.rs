//! Byte-stream transports
//!
//! The master needs nothing from a transport except an ordered byte stream
//! and, optionally, a way to reopen it. Framing, correlation and retries all
//! live above this layer, so a transport is any `AsyncRead + AsyncWrite`
//! stream that implements [`ModbusTransport`].
//!
//! | Transport | Reconnect | Feature |
//! |-----------|-----------|---------|
//! | [`TcpTransport`] | yes | - |
//! | `tokio::net::TcpStream` | no | - |
//! | `tokio::io::DuplexStream` | no | - |
//! | `SerialTransport` | yes | `serial` |

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::SlaveId;

/// Transport layer abstraction for the connection worker.
///
/// Implementations are plain byte streams. The worker is the only reader and
/// the only writer.
pub trait ModbusTransport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Short name for logs
    fn name(&self) -> String {
        "stream".to_string()
    }

    /// Whether [`ModbusTransport::reconnect`] can succeed
    fn supports_reconnect(&self) -> bool {
        false
    }

    /// Close and reopen the underlying connection
    fn reconnect(&mut self) -> impl Future<Output = ModbusResult<()>> + Send {
        async { Err(ModbusError::connection("Transport does not support reconnect")) }
    }
}

/// Plain socket without reconnect
impl ModbusTransport for TcpStream {
    fn name(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => format!("tcp://{}", addr),
            Err(_) => "tcp".to_string(),
        }
    }
}

/// In-memory pipe, for simulators and tests
impl ModbusTransport for tokio::io::DuplexStream {
    fn name(&self) -> String {
        "duplex".to_string()
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is not connected")
}

/// Modbus TCP transport with reconnect support
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    address: SocketAddr,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Connect to a Modbus TCP server
    pub async fn connect(address: SocketAddr, connect_timeout: Duration) -> ModbusResult<Self> {
        let stream = Self::open(address, connect_timeout).await?;
        Ok(Self {
            stream: Some(stream),
            address,
            connect_timeout,
        })
    }

    async fn open(address: SocketAddr, connect_timeout: Duration) -> ModbusResult<TcpStream> {
        let stream = timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| ModbusError::timeout(format!("connect to {}", address), connect_timeout.as_millis() as u64))?
            .map_err(|e| ModbusError::connection(format!("Failed to connect to {}: {}", address, e)))?;

        // Small request frames; latency matters more than batching
        stream
            .set_nodelay(true)
            .map_err(|e| ModbusError::connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

        debug!("Connected to {}", address);
        Ok(stream)
    }

    /// Server address
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl ModbusTransport for TcpTransport {
    fn name(&self) -> String {
        format!("tcp://{}", self.address)
    }

    fn supports_reconnect(&self) -> bool {
        true
    }

    async fn reconnect(&mut self) -> ModbusResult<()> {
        self.stream = None;
        let stream = Self::open(self.address, self.connect_timeout)
            .await
            .map_err(|e| ModbusError::connection(format!("Failed to reconnect to {}: {}", self.address, e)))?;
        self.stream = Some(stream);
        Ok(())
    }
}

impl AsyncRead for TcpTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Err(not_connected())),
        }
    }
}

impl AsyncWrite for TcpTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Err(not_connected())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(feature = "serial")]
pub use serial::{SerialConfig, SerialTransport};

#[cfg(feature = "serial")]
mod serial {
    use super::*;

    /// Serial line settings
    #[derive(Debug, Clone)]
    pub struct SerialConfig {
        pub port: String,
        pub baud_rate: u32,
        pub data_bits: tokio_serial::DataBits,
        pub stop_bits: tokio_serial::StopBits,
        pub parity: tokio_serial::Parity,
    }

    impl SerialConfig {
        /// 8N1 at the given baud rate
        pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
            Self {
                port: port.into(),
                baud_rate,
                data_bits: tokio_serial::DataBits::Eight,
                stop_bits: tokio_serial::StopBits::One,
                parity: tokio_serial::Parity::None,
            }
        }

        pub fn with_data_bits(mut self, data_bits: tokio_serial::DataBits) -> Self {
            self.data_bits = data_bits;
            self
        }

        pub fn with_stop_bits(mut self, stop_bits: tokio_serial::StopBits) -> Self {
            self.stop_bits = stop_bits;
            self
        }

        pub fn with_parity(mut self, parity: tokio_serial::Parity) -> Self {
            self.parity = parity;
            self
        }
    }

    /// Serial line transport; the encoding (ASCII, RTU, Binary) is chosen by
    /// the master, not here
    pub struct SerialTransport {
        port: Option<tokio_serial::SerialStream>,
        config: SerialConfig,
    }

    impl SerialTransport {
        /// Open the serial port
        pub fn open(config: SerialConfig) -> ModbusResult<Self> {
            let port = Self::open_port(&config)?;
            Ok(Self {
                port: Some(port),
                config,
            })
        }

        fn open_port(config: &SerialConfig) -> ModbusResult<tokio_serial::SerialStream> {
            let builder = tokio_serial::new(&config.port, config.baud_rate)
                .data_bits(config.data_bits)
                .stop_bits(config.stop_bits)
                .parity(config.parity);

            tokio_serial::SerialStream::open(&builder).map_err(|e| {
                ModbusError::connection(format!("Failed to open serial port {}: {}", config.port, e))
            })
        }

        pub fn config(&self) -> &SerialConfig {
            &self.config
        }
    }

    impl ModbusTransport for SerialTransport {
        fn name(&self) -> String {
            format!("serial://{}@{}", self.config.port, self.config.baud_rate)
        }

        fn supports_reconnect(&self) -> bool {
            true
        }

        async fn reconnect(&mut self) -> ModbusResult<()> {
            self.port = None;
            self.port = Some(Self::open_port(&self.config)?);
            Ok(())
        }
    }

    impl AsyncRead for SerialTransport {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.get_mut().port.as_mut() {
                Some(port) => Pin::new(port).poll_read(cx, buf),
                None => Poll::Ready(Err(not_connected())),
            }
        }
    }

    impl AsyncWrite for SerialTransport {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            match self.get_mut().port.as_mut() {
                Some(port) => Pin::new(port).poll_write(cx, buf),
                None => Poll::Ready(Err(not_connected())),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut().port.as_mut() {
                Some(port) => Pin::new(port).poll_flush(cx),
                None => Poll::Ready(Err(not_connected())),
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            match self.get_mut().port.as_mut() {
                Some(port) => Pin::new(port).poll_shutdown(cx),
                None => Poll::Ready(Ok(())),
            }
        }
    }
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub reconnects: u64,
    pub exceptions: u64,
    pub stray_frames: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Lock-free counters shared between the worker and its handles
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub requests_sent: AtomicU64,
    pub responses_received: AtomicU64,
    pub errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub retries: AtomicU64,
    pub reconnects: AtomicU64,
    pub exceptions: AtomicU64,
    pub stray_frames: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl StatsCounters {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            stray_frames: self.stray_frames.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Format raw bytes as hex string for packet logging
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log packet with direction and encoding tag
pub fn log_packet(direction: &str, data: &[u8], protocol: &str, unit_id: Option<SlaveId>) {
    let hex_string = format_hex_packet(data);
    match unit_id {
        Some(id) => info!("[MODBUS-{}] {} unit:{} {}", protocol, direction, id, hex_string),
        None => info!("[MODBUS-{}] {} {}", protocol, direction, hex_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_format_hex_packet() {
        assert_eq!(format_hex_packet(&[0x00, 0x01, 0xAB]), "00 01 AB");
        assert_eq!(format_hex_packet(&[]), "");
    }

    #[test]
    fn test_stats_snapshot() {
        let counters = StatsCounters::default();
        StatsCounters::incr(&counters.requests_sent);
        StatsCounters::add(&counters.bytes_sent, 12);
        let stats = counters.snapshot();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.bytes_sent, 12);
        assert_eq!(stats.errors, 0);
    }

    #[tokio::test]
    async fn test_duplex_has_no_reconnect() {
        let (mut a, _b) = tokio::io::duplex(64);
        assert!(!a.supports_reconnect());
        assert!(a.reconnect().await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_transport_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 4];
                socket.read_exact(&mut buf).await.unwrap();
                socket.write_all(&buf).await.unwrap();
            }
        });

        let mut transport = TcpTransport::connect(addr, Duration::from_secs(1)).await.unwrap();
        assert!(transport.supports_reconnect());
        assert_eq!(transport.name(), format!("tcp://{}", addr));

        for round in 0..2 {
            transport.write_all(&[1, 2, 3, 4]).await.unwrap();
            let mut echo = [0u8; 4];
            transport.read_exact(&mut echo).await.unwrap();
            assert_eq!(echo, [1, 2, 3, 4]);
            if round == 0 {
                transport.reconnect().await.unwrap();
            }
        }
        assert!(transport.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpTransport::connect(addr, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ModbusError::Connection { .. }));
    }
}
