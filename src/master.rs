//! Connection worker and master handle
//!
//! One tokio task per connection owns the transport, the read buffer and the
//! [`TransactionManager`]. Callers talk to it through a cloneable
//! [`ModbusMaster`] handle; each submitted request gets a one-shot completion
//! channel wrapped in a [`PendingRequest`].
//!
//! The worker loop waits on three things at once:
//!
//! - new commands from handles (submit, cancel, close)
//! - bytes from the transport, fed through the streaming frame decoder
//! - the earliest response deadline
//!
//! All writes happen in the worker, between those waits, so frames never
//! interleave on the wire.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::ModbusConfig;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{self, Adu, FrameDecoder, FrameEncoding};
use crate::protocol::{Request, Response, SlaveId};
use crate::transaction::{FailOutcome, FrameMatch, Ticket, TransactionManager};
use crate::transport::{log_packet, ModbusTransport, StatsCounters, TransportStats};

const READ_BUFFER_CAPACITY: usize = 1024;

type Reply = oneshot::Sender<ModbusResult<Response>>;

enum Command {
    Submit {
        request_id: u64,
        unit_id: SlaveId,
        request: Request,
        reply: Reply,
    },
    Cancel(u64),
    Close(oneshot::Sender<()>),
}

/// Handle to a running connection worker.
///
/// Cheap to clone; all clones share the same connection. The worker shuts
/// down on [`ModbusMaster::close`] or when the last handle is dropped.
///
/// # Example
///
/// ```rust,no_run
/// use modbus_master::{FrameEncoding, ModbusConfig, ModbusMaster, Request, TcpTransport};
/// use std::time::Duration;
///
/// # async fn example() -> modbus_master::ModbusResult<()> {
/// let transport = TcpTransport::connect("127.0.0.1:502".parse().unwrap(), Duration::from_secs(3)).await?;
/// let master = ModbusMaster::spawn(transport, FrameEncoding::Tcp, ModbusConfig::default())?;
///
/// let response = master
///     .execute(1, Request::ReadHoldingRegisters { address: 0, quantity: 10 })
///     .await?;
/// println!("{:?}", response.into_registers()?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ModbusMaster {
    commands: mpsc::UnboundedSender<Command>,
    stats: Arc<StatsCounters>,
    next_request_id: Arc<AtomicU64>,
    encoding: FrameEncoding,
}

impl std::fmt::Debug for ModbusMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusMaster")
            .field("encoding", &self.encoding)
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl ModbusMaster {
    /// Start a worker for `transport`. Must be called within a Tokio runtime.
    pub fn spawn<T: ModbusTransport>(
        transport: T,
        encoding: FrameEncoding,
        config: ModbusConfig,
    ) -> ModbusResult<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(StatsCounters::default());
        let worker = Worker::new(transport, encoding, config, stats.clone());

        info!("Modbus master started on {} ({})", worker.name, encoding);
        tokio::spawn(worker.run(rx));

        Ok(Self {
            commands: tx,
            stats,
            next_request_id: Arc::new(AtomicU64::new(0)),
            encoding,
        })
    }

    /// Start a worker on a serial line using `config.serial_encoding`
    pub fn spawn_serial<T: ModbusTransport>(transport: T, config: ModbusConfig) -> ModbusResult<Self> {
        let encoding = config.serial_encoding.into();
        Self::spawn(transport, encoding, config)
    }

    /// Queue a request.
    ///
    /// The request is validated here, so a malformed request fails
    /// immediately and nothing reaches the worker or the transport.
    pub fn submit(&self, unit_id: SlaveId, request: Request) -> ModbusResult<PendingRequest> {
        request.validate()?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Submit {
                request_id,
                unit_id,
                request,
                reply,
            })
            .map_err(|_| ModbusError::connection("Modbus master is closed"))?;

        Ok(PendingRequest {
            request_id,
            rx,
            commands: self.commands.clone(),
            finished: false,
        })
    }

    /// Submit and wait for the outcome
    pub async fn execute(&self, unit_id: SlaveId, request: Request) -> ModbusResult<Response> {
        self.submit(unit_id, request)?.await
    }

    /// Stop the worker. Outstanding requests fail with a connection error.
    pub async fn close(&self) -> ModbusResult<()> {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Close(ack)).is_ok() {
            let _ = done.await;
        }
        Ok(())
    }

    /// Whether the worker is still running
    pub fn is_connected(&self) -> bool {
        !self.commands.is_closed()
    }

    pub fn encoding(&self) -> FrameEncoding {
        self.encoding
    }

    pub fn get_stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}

/// A submitted request.
///
/// Resolves to the response or the final error. Dropping it before it
/// resolves cancels the transaction.
#[must_use = "dropping a PendingRequest cancels it"]
pub struct PendingRequest {
    request_id: u64,
    rx: oneshot::Receiver<ModbusResult<Response>>,
    commands: mpsc::UnboundedSender<Command>,
    finished: bool,
}

impl PendingRequest {
    /// Withdraw the request. Other transactions are not affected.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Future for PendingRequest {
    type Output = ModbusResult<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                this.finished = true;
                Poll::Ready(result.unwrap_or_else(|_| {
                    Err(ModbusError::connection("Modbus master shut down"))
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.commands.send(Command::Cancel(self.request_id));
        }
    }
}

struct Waiter {
    request_id: u64,
    reply: Reply,
}

struct Worker<T> {
    transport: T,
    name: String,
    encoding: FrameEncoding,
    decoder: FrameDecoder,
    manager: TransactionManager,
    config: ModbusConfig,
    stats: Arc<StatsCounters>,
    read_buf: BytesMut,
    /// False after end of stream or a failed reconnect
    readable: bool,
    waiters: HashMap<Ticket, Waiter>,
    tickets: HashMap<u64, Ticket>,
}

impl<T: ModbusTransport> Worker<T> {
    fn new(transport: T, encoding: FrameEncoding, config: ModbusConfig, stats: Arc<StatsCounters>) -> Self {
        Self {
            name: transport.name(),
            transport,
            encoding,
            decoder: FrameDecoder::response(encoding),
            manager: TransactionManager::new(encoding.is_serial(), &config),
            config,
            stats,
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            readable: true,
            waiters: HashMap::new(),
            tickets: HashMap::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            self.dispatch_ready().await;

            let deadline = self.manager.next_deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Submit { request_id, unit_id, request, reply }) => {
                        self.on_submit(request_id, unit_id, request, reply);
                    }
                    Some(Command::Cancel(request_id)) => self.on_cancel(request_id),
                    Some(Command::Close(ack)) => {
                        commands.close();
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                result = self.transport.read_buf(&mut self.read_buf), if self.readable => {
                    self.on_read(result).await;
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_deadline().await;
                }
            }
        }
    }

    fn on_submit(&mut self, request_id: u64, unit_id: SlaveId, request: Request, reply: Reply) {
        match self.manager.submit(unit_id, request) {
            Ok(ticket) => {
                self.waiters.insert(ticket, Waiter { request_id, reply });
                self.tickets.insert(request_id, ticket);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn on_cancel(&mut self, request_id: u64) {
        if let Some(ticket) = self.tickets.remove(&request_id) {
            self.waiters.remove(&ticket);
            if self.manager.cancel(ticket) {
                debug!("Request {} cancelled", request_id);
            }
        }
    }

    /// Write every frame the manager allows right now
    async fn dispatch_ready(&mut self) {
        while self.manager.can_dispatch() {
            if !self.config.transmit_delay.is_zero() {
                sleep(self.config.transmit_delay).await;
            }

            let Some(dispatch) = self.manager.next_dispatch(Instant::now()) else {
                break;
            };

            match frame::encode(self.encoding, &dispatch.adu) {
                Ok(bytes) => {
                    if self.config.packet_logging {
                        log_packet("send", &bytes, self.encoding.name(), Some(dispatch.adu.unit_id));
                    }
                    if let Err(e) = self.write_frame(&bytes).await {
                        self.on_transport_error(e).await;
                    }
                }
                Err(e) => {
                    self.fail_ticket(dispatch.ticket, e).await;
                }
            }
        }
    }

    async fn write_frame(&mut self, bytes: &[u8]) -> ModbusResult<()> {
        let limit = self.manager.timeout();
        let transport = &mut self.transport;
        let write = async move {
            transport.write_all(bytes).await?;
            transport.flush().await
        };

        match timeout(limit, write).await {
            Ok(Ok(())) => {
                StatsCounters::incr(&self.stats.requests_sent);
                StatsCounters::add(&self.stats.bytes_sent, bytes.len());
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                // Part of the frame may already be on the wire, so the
                // stream is as good as broken
                StatsCounters::incr(&self.stats.timeouts);
                Err(ModbusError::connection(format!(
                    "Write to {} timed out after {} ms",
                    self.name,
                    limit.as_millis()
                )))
            }
        }
    }

    async fn on_read(&mut self, result: std::io::Result<usize>) {
        match result {
            Ok(0) => {
                self.on_transport_error(ModbusError::connection(format!(
                    "Connection closed by {}",
                    self.name
                )))
                .await
            }
            Ok(n) => {
                StatsCounters::add(&self.stats.bytes_received, n);
                if self.config.packet_logging {
                    let start = self.read_buf.len() - n;
                    log_packet("receive", &self.read_buf[start..], self.encoding.name(), None);
                }
                self.drain_frames().await;
            }
            Err(e) => self.on_transport_error(e.into()).await,
        }
    }

    async fn drain_frames(&mut self) {
        loop {
            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(adu)) => self.on_frame(adu).await,
                Ok(None) => break,
                Err(e) => {
                    debug!("Undecodable frame from {}: {}", self.name, e);
                    StatsCounters::incr(&self.stats.errors);
                    // No id to attribute the fault to: every awaiting
                    // transaction lost its reply
                    self.fail_awaiting(&e);
                }
            }
        }
    }

    async fn on_frame(&mut self, adu: Adu) {
        let ticket = match self.manager.match_frame(&adu) {
            FrameMatch::Matched(ticket) => ticket,
            FrameMatch::Stray => {
                StatsCounters::incr(&self.stats.stray_frames);
                return;
            }
        };
        if self.manager.is_orphaned(ticket) {
            debug!("Discarding late reply to a cancelled request from unit {}", adu.unit_id);
            StatsCounters::incr(&self.stats.stray_frames);
            self.manager.complete(ticket);
            return;
        }
        let Some(request) = self.manager.request(ticket) else {
            return;
        };

        StatsCounters::incr(&self.stats.responses_received);
        match Response::from_pdu(request, adu.pdu.as_slice()) {
            Ok(response) => {
                self.manager.complete(ticket);
                self.resolve(ticket, Ok(response));
            }
            Err(e) => {
                if e.is_exception() {
                    StatsCounters::incr(&self.stats.exceptions);
                }
                self.fail_ticket(ticket, e).await;
            }
        }
    }

    async fn on_deadline(&mut self) {
        let limit = self.manager.timeout().as_millis() as u64;
        for ticket in self.manager.expired(Instant::now()) {
            if self.encoding.is_serial() {
                // Half a reply from the timed-out exchange must not prefix the next one
                self.read_buf.clear();
            }
            // A ticket already failed by a reconnect earlier in this pass is
            // not charged again
            if self.fail_ticket(ticket, ModbusError::timeout("read response", limit)).await {
                StatsCounters::incr(&self.stats.timeouts);
            }
        }
    }

    /// Fail one attempt; reconnect first if the policy asks for it.
    /// Returns whether the attempt was charged.
    async fn fail_ticket(&mut self, ticket: Ticket, error: ModbusError) -> bool {
        let supports_reconnect = self.transport.supports_reconnect();
        match self.manager.fail(ticket, error, supports_reconnect) {
            Some(FailOutcome::Retry { reconnect }) => {
                StatsCounters::incr(&self.stats.retries);
                if reconnect {
                    self.reconnect().await;
                    self.fail_awaiting(&ModbusError::connection("Connection reset by reconnect"));
                }
                true
            }
            Some(FailOutcome::Surface(e)) => {
                StatsCounters::incr(&self.stats.errors);
                self.resolve(ticket, Err(e));
                true
            }
            Some(FailOutcome::Ignored) | None => false,
        }
    }

    /// Fail every awaiting transaction without reconnecting.
    /// Returns true if any of them asked for a reconnect.
    fn fail_awaiting(&mut self, error: &ModbusError) -> bool {
        let supports_reconnect = self.transport.supports_reconnect();
        let mut wants_reconnect = false;

        for ticket in self.manager.invalidate_awaiting() {
            match self.manager.fail(ticket, error.clone(), supports_reconnect) {
                Some(FailOutcome::Retry { reconnect }) => {
                    StatsCounters::incr(&self.stats.retries);
                    wants_reconnect |= reconnect;
                }
                Some(FailOutcome::Surface(e)) => {
                    StatsCounters::incr(&self.stats.errors);
                    self.resolve(ticket, Err(e));
                }
                Some(FailOutcome::Ignored) | None => {}
            }
        }
        wants_reconnect
    }

    /// The stream is broken: fail everything awaiting, then reopen if possible
    async fn on_transport_error(&mut self, error: ModbusError) {
        warn!("Transport {} failed: {}", self.name, error);
        StatsCounters::incr(&self.stats.errors);
        self.readable = false;
        self.read_buf.clear();

        self.fail_awaiting(&error);
        if self.transport.supports_reconnect() {
            self.reconnect().await;
        }
    }

    async fn reconnect(&mut self) {
        StatsCounters::incr(&self.stats.reconnects);
        self.read_buf.clear();
        match self.transport.reconnect().await {
            Ok(()) => {
                info!("Reconnected {}", self.name);
                self.readable = true;
            }
            Err(e) => {
                warn!("Reconnect of {} failed: {}", self.name, e);
                self.readable = false;
            }
        }
    }

    fn resolve(&mut self, ticket: Ticket, result: ModbusResult<Response>) {
        if let Some(waiter) = self.waiters.remove(&ticket) {
            self.tickets.remove(&waiter.request_id);
            let _ = waiter.reply.send(result);
        }
    }

    async fn shutdown(&mut self) {
        for ticket in self.manager.drain() {
            self.resolve(ticket, Err(ModbusError::connection("Modbus master closed")));
        }
        if let Err(e) = self.transport.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.name, e);
        }
        info!("Modbus master on {} stopped", self.name);
    }
}
