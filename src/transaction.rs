//! Transaction manager
//!
//! Tracks every submitted request from submission to completion: assigns
//! transaction ids, correlates decoded frames with awaiting transactions,
//! keeps per-attempt deadlines and applies the retry policy to failures.
//!
//! The manager is synchronous and owns no I/O. The connection worker drives
//! it with the current time and the frames it reads.
//!
//! ```text
//! submit ──► Pending ──dispatch──► AwaitingResponse ──► Completed
//!               ▲                        │
//!               └──── Retrying ◄─────────┴──────────► Failed
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ModbusConfig;
use crate::constants::{DEFAULT_TRANSACTION_ID, FIRST_TRANSACTION_ID};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::Adu;
use crate::pdu::ModbusPdu;
use crate::protocol::{Request, SlaveId};
use crate::retry::{RetryAction, RetryPolicy};

/// Internal handle for a submitted transaction, stable across retries
pub type Ticket = u64;

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Queued, never sent
    Pending,
    /// Sent; waiting for a matching frame or the deadline
    AwaitingResponse,
    /// An attempt failed and the transaction is queued to be sent again
    Retrying,
    Completed,
    Failed,
}

#[derive(Debug)]
struct Transaction {
    unit_id: SlaveId,
    request: Request,
    pdu: ModbusPdu,
    transaction_id: u16,
    state: TransactionState,
    attempts: u32,
    retries_remaining: u32,
    deadline: Option<Instant>,
    /// Cancelled while a serial reply may still arrive; holds the line until
    /// that reply or the deadline
    orphaned: bool,
}

/// A frame ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub ticket: Ticket,
    pub adu: Adu,
    /// 1 for the first send
    pub attempt: u32,
}

/// Result of correlating a decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMatch {
    Matched(Ticket),
    /// No awaiting transaction claims the frame
    Stray,
}

/// What became of a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Queued again; reconnect the transport first if asked
    Retry { reconnect: bool },
    /// Removed; deliver this error to the caller
    Surface(ModbusError),
    /// Left as it was
    Ignored,
}

/// Pending table, id allocator and deadline tracker for one connection
#[derive(Debug)]
pub struct TransactionManager {
    serial: bool,
    max_transaction_id: u16,
    max_in_flight: usize,
    timeout: Duration,
    policy: RetryPolicy,
    next_id: u16,
    next_ticket: Ticket,
    transactions: HashMap<Ticket, Transaction>,
    queue: VecDeque<Ticket>,
    awaiting: HashMap<u16, Ticket>,
}

impl TransactionManager {
    /// Manager for a TCP connection (`serial == false`) or a serial line
    pub fn new(serial: bool, config: &ModbusConfig) -> Self {
        Self {
            serial,
            max_transaction_id: config.max_transaction_id,
            max_in_flight: if serial { 1 } else { config.max_in_flight },
            timeout: config.timeout,
            policy: config.retry_policy(),
            next_id: FIRST_TRANSACTION_ID,
            next_ticket: 0,
            transactions: HashMap::new(),
            queue: VecDeque::new(),
            awaiting: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a request. Builds its PDU now, so an invalid request is
    /// rejected before it is queued.
    pub fn submit(&mut self, unit_id: SlaveId, request: Request) -> ModbusResult<Ticket> {
        let pdu = request.to_pdu()?;
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        self.transactions.insert(
            ticket,
            Transaction {
                unit_id,
                request,
                pdu,
                transaction_id: DEFAULT_TRANSACTION_ID,
                state: TransactionState::Pending,
                attempts: 0,
                retries_remaining: self.policy.retries,
                deadline: None,
                orphaned: false,
            },
        );
        self.queue.push_back(ticket);
        Ok(ticket)
    }

    /// Next frame to send, if the in-flight limit allows one
    pub fn next_dispatch(&mut self, now: Instant) -> Option<Dispatch> {
        if self.awaiting.len() >= self.max_in_flight {
            return None;
        }

        let ticket = loop {
            let ticket = self.queue.pop_front()?;
            if self.transactions.contains_key(&ticket) {
                break ticket;
            }
        };

        let Some(transaction_id) = self.allocate_id() else {
            self.queue.push_front(ticket);
            return None;
        };

        let deadline = now + self.timeout;
        let tx = self.transactions.get_mut(&ticket)?;
        tx.transaction_id = transaction_id;
        tx.state = TransactionState::AwaitingResponse;
        tx.attempts += 1;
        tx.deadline = Some(deadline);
        self.awaiting.insert(transaction_id, ticket);

        debug!(
            "Dispatch ticket {} as transaction {} (attempt {}, unit {})",
            ticket, transaction_id, tx.attempts, tx.unit_id
        );

        Some(Dispatch {
            ticket,
            adu: Adu::new(transaction_id, tx.unit_id, tx.pdu.clone()),
            attempt: tx.attempts,
        })
    }

    /// Next free id: 1..=max then wrap, skipping ids still awaiting
    fn allocate_id(&mut self) -> Option<u16> {
        if self.serial {
            return Some(DEFAULT_TRANSACTION_ID);
        }

        for _ in 0..self.max_transaction_id {
            let id = self.next_id;
            self.next_id = if id >= self.max_transaction_id {
                FIRST_TRANSACTION_ID
            } else {
                id + 1
            };
            if !self.awaiting.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    /// Find the awaiting transaction a decoded frame answers
    pub fn match_frame(&self, adu: &Adu) -> FrameMatch {
        let key = if self.serial {
            DEFAULT_TRANSACTION_ID
        } else {
            adu.transaction_id
        };

        match self.awaiting.get(&key) {
            Some(&ticket)
                if self
                    .transactions
                    .get(&ticket)
                    .is_some_and(|tx| tx.unit_id == adu.unit_id) =>
            {
                FrameMatch::Matched(ticket)
            }
            _ => {
                debug!(
                    "Stray frame: transaction {}, unit {}",
                    adu.transaction_id, adu.unit_id
                );
                FrameMatch::Stray
            }
        }
    }

    /// Request behind a ticket
    pub fn request(&self, ticket: Ticket) -> Option<&Request> {
        self.transactions.get(&ticket).map(|tx| &tx.request)
    }

    pub fn state(&self, ticket: Ticket) -> Option<TransactionState> {
        self.transactions.get(&ticket).map(|tx| tx.state)
    }

    pub fn attempts(&self, ticket: Ticket) -> Option<u32> {
        self.transactions.get(&ticket).map(|tx| tx.attempts)
    }

    /// Whether the ticket was cancelled but still holds the serial line
    pub fn is_orphaned(&self, ticket: Ticket) -> bool {
        self.transactions.get(&ticket).is_some_and(|tx| tx.orphaned)
    }

    fn release(&mut self, ticket: Ticket) {
        if let Some(tx) = self.transactions.get_mut(&ticket) {
            if tx.state == TransactionState::AwaitingResponse
                && self.awaiting.get(&tx.transaction_id) == Some(&ticket)
            {
                self.awaiting.remove(&tx.transaction_id);
            }
            tx.deadline = None;
        }
    }

    /// Finish a transaction whose response decoded cleanly
    pub fn complete(&mut self, ticket: Ticket) -> bool {
        self.release(ticket);
        match self.transactions.remove(&ticket) {
            Some(mut tx) => {
                tx.state = TransactionState::Completed;
                debug!(
                    "Transaction {} {:?} after {} attempt(s)",
                    tx.transaction_id, tx.state, tx.attempts
                );
                true
            }
            None => false,
        }
    }

    /// Apply the retry policy to a failed attempt.
    ///
    /// Returns `None` unless the ticket is awaiting a response, so a ticket
    /// that was already re-queued is never charged twice. An orphan is
    /// retired instead of charged.
    pub fn fail(
        &mut self,
        ticket: Ticket,
        error: ModbusError,
        supports_reconnect: bool,
    ) -> Option<FailOutcome> {
        let tx = self.transactions.get(&ticket)?;
        if tx.state != TransactionState::AwaitingResponse {
            return None;
        }
        if tx.orphaned {
            debug!("Cancelled transaction released the line: {}", error);
            self.complete(ticket);
            return None;
        }
        let action = self
            .policy
            .decide(error.class(), tx.retries_remaining, supports_reconnect);

        match action {
            RetryAction::Ignore => Some(FailOutcome::Ignored),
            RetryAction::Retry { reconnect } => {
                self.release(ticket);
                let tx = self.transactions.get_mut(&ticket)?;
                tx.retries_remaining -= 1;
                tx.state = TransactionState::Retrying;
                warn!(
                    "Attempt {} of transaction {} failed: {}; {} retries left{}",
                    tx.attempts,
                    tx.transaction_id,
                    error,
                    tx.retries_remaining,
                    if reconnect { ", reconnecting" } else { "" }
                );
                self.queue.push_front(ticket);
                Some(FailOutcome::Retry { reconnect })
            }
            RetryAction::Surface => {
                self.release(ticket);
                let mut tx = self.transactions.remove(&ticket)?;
                tx.state = TransactionState::Failed;
                self.queue.retain(|&t| t != ticket);
                debug!(
                    "Transaction {} {:?} after {} attempt(s): {}",
                    tx.transaction_id, tx.state, tx.attempts, error
                );
                Some(FailOutcome::Surface(self.policy.exhausted(tx.attempts, error)))
            }
        }
    }

    /// Awaiting transactions whose deadline has passed
    pub fn expired(&self, now: Instant) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self
            .awaiting
            .values()
            .copied()
            .filter(|ticket| {
                self.transactions
                    .get(ticket)
                    .and_then(|tx| tx.deadline)
                    .is_some_and(|deadline| deadline <= now)
            })
            .collect();
        tickets.sort_unstable();
        tickets
    }

    /// Earliest deadline among awaiting transactions
    pub fn next_deadline(&self) -> Option<Instant> {
        self.awaiting
            .values()
            .filter_map(|ticket| self.transactions.get(ticket).and_then(|tx| tx.deadline))
            .min()
    }

    /// Drop a transaction wherever it is; other transactions are untouched.
    ///
    /// On a serial line replies carry no id, so a transaction already on the
    /// wire keeps the line as an orphan until its reply arrives or its
    /// deadline passes. Otherwise that reply would answer the next request.
    pub fn cancel(&mut self, ticket: Ticket) -> bool {
        self.queue.retain(|&t| t != ticket);
        let Some(tx) = self.transactions.get_mut(&ticket) else {
            return false;
        };
        if tx.orphaned {
            return false;
        }
        if self.serial && tx.state == TransactionState::AwaitingResponse {
            debug!("Cancelled transaction keeps the line until its deadline");
            tx.orphaned = true;
            return true;
        }
        self.release(ticket);
        self.transactions.remove(&ticket).is_some()
    }

    /// Every awaiting ticket, oldest first. Used when the connection is reset.
    pub fn invalidate_awaiting(&self) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self.awaiting.values().copied().collect();
        tickets.sort_unstable();
        tickets
    }

    /// Remove everything; returns the tickets that were still open
    pub fn drain(&mut self) -> Vec<Ticket> {
        self.awaiting.clear();
        self.queue.clear();
        let mut tickets: Vec<Ticket> = self.transactions.drain().map(|(t, _)| t).collect();
        tickets.sort_unstable();
        tickets
    }

    /// Whether [`TransactionManager::next_dispatch`] has work it may send now
    pub fn can_dispatch(&self) -> bool {
        self.awaiting.len() < self.max_in_flight && !self.queue.is_empty()
    }

    pub fn awaiting_len(&self) -> usize {
        self.awaiting.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModbusError;
    use crate::exception::ModbusException;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn read_request() -> Request {
        Request::ReadHoldingRegisters {
            address: 0,
            quantity: 10,
        }
    }

    fn tcp(config: ModbusConfig) -> TransactionManager {
        TransactionManager::new(false, &config)
    }

    #[test]
    fn test_submit_rejects_invalid_request() {
        let mut tm = tcp(ModbusConfig::default());
        let bad = Request::WriteSingleCoil {
            address: 0,
            value: 0x1234,
        };
        assert!(tm.submit(1, bad).unwrap_err().is_validation());
        assert!(tm.is_idle());
    }

    #[test]
    fn test_dispatch_assigns_ids_from_one() {
        let mut tm = tcp(ModbusConfig::default());
        let now = Instant::now();
        let a = tm.submit(1, read_request()).unwrap();
        let b = tm.submit(1, read_request()).unwrap();

        let da = tm.next_dispatch(now).unwrap();
        let db = tm.next_dispatch(now).unwrap();
        assert_eq!((da.ticket, da.adu.transaction_id, da.attempt), (a, 1, 1));
        assert_eq!((db.ticket, db.adu.transaction_id), (b, 2));
        assert_eq!(tm.state(a), Some(TransactionState::AwaitingResponse));
        assert!(tm.next_dispatch(now).is_none());
    }

    #[test]
    fn test_ids_wrap_to_first_and_skip_awaiting() {
        let mut tm = tcp(ModbusConfig::default().with_max_transaction_id(3).with_max_in_flight(3));
        let now = Instant::now();

        let first = tm.submit(1, read_request()).unwrap();
        assert_eq!(tm.next_dispatch(now).unwrap().adu.transaction_id, 1);
        for expected in [2, 3] {
            let t = tm.submit(1, read_request()).unwrap();
            let d = tm.next_dispatch(now).unwrap();
            assert_eq!(d.adu.transaction_id, expected);
            assert!(tm.complete(t));
        }

        // 1 is still awaiting, so the wrap skips it
        tm.submit(1, read_request()).unwrap();
        assert_eq!(tm.next_dispatch(now).unwrap().adu.transaction_id, 2);

        assert!(tm.complete(first));
        tm.submit(1, read_request()).unwrap();
        assert_eq!(tm.next_dispatch(now).unwrap().adu.transaction_id, 3);
        tm.submit(1, read_request()).unwrap();
        assert_eq!(tm.next_dispatch(now).unwrap().adu.transaction_id, 1);
    }

    #[test]
    fn test_in_flight_limit() {
        let mut tm = tcp(ModbusConfig::default().with_max_in_flight(2));
        let now = Instant::now();
        for _ in 0..3 {
            tm.submit(1, read_request()).unwrap();
        }
        assert!(tm.next_dispatch(now).is_some());
        assert!(tm.next_dispatch(now).is_some());
        assert!(tm.next_dispatch(now).is_none());
        assert_eq!(tm.awaiting_len(), 2);
        assert_eq!(tm.queued_len(), 1);
    }

    #[test]
    fn test_serial_one_awaiting_fifo() {
        let mut tm = TransactionManager::new(true, &ModbusConfig::default());
        let now = Instant::now();
        let a = tm.submit(1, read_request()).unwrap();
        let b = tm.submit(2, read_request()).unwrap();

        let d = tm.next_dispatch(now).unwrap();
        assert_eq!(d.ticket, a);
        assert_eq!(d.adu.transaction_id, DEFAULT_TRANSACTION_ID);
        assert!(tm.next_dispatch(now).is_none());

        assert!(tm.complete(a));
        assert_eq!(tm.next_dispatch(now).unwrap().ticket, b);
    }

    #[test]
    fn test_match_frame() {
        let mut tm = tcp(ModbusConfig::default());
        let now = Instant::now();
        let t = tm.submit(7, read_request()).unwrap();
        let d = tm.next_dispatch(now).unwrap();

        assert_eq!(tm.match_frame(&d.adu), FrameMatch::Matched(t));

        let wrong_id = Adu { transaction_id: 99, ..d.adu.clone() };
        assert_eq!(tm.match_frame(&wrong_id), FrameMatch::Stray);

        let wrong_unit = Adu { unit_id: 8, ..d.adu };
        assert_eq!(tm.match_frame(&wrong_unit), FrameMatch::Stray);
    }

    #[test]
    fn test_serial_match_checks_unit() {
        let mut tm = TransactionManager::new(true, &ModbusConfig::default());
        let t = tm.submit(3, read_request()).unwrap();
        let d = tm.next_dispatch(Instant::now()).unwrap();
        assert_eq!(tm.match_frame(&d.adu), FrameMatch::Matched(t));
        assert_eq!(
            tm.match_frame(&Adu { unit_id: 4, ..d.adu }),
            FrameMatch::Stray
        );
    }

    #[test]
    fn test_deadlines() {
        let mut tm = tcp(ModbusConfig::default().with_timeout(Duration::from_millis(100)));
        let start = Instant::now();
        let a = tm.submit(1, read_request()).unwrap();
        tm.next_dispatch(start).unwrap();
        let b = tm.submit(1, read_request()).unwrap();
        tm.next_dispatch(start + Duration::from_millis(50)).unwrap();

        assert_eq!(tm.next_deadline(), Some(start + Duration::from_millis(100)));
        assert!(tm.expired(start + Duration::from_millis(99)).is_empty());
        assert_eq!(tm.expired(start + Duration::from_millis(100)), vec![a]);
        assert_eq!(tm.expired(start + Duration::from_millis(200)), vec![a, b]);
    }

    #[test]
    fn test_timeout_retries_with_fresh_id_then_exhausts() {
        let mut tm = tcp(ModbusConfig::default().with_retries(2));
        let now = Instant::now();
        let t = tm.submit(1, read_request()).unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            let d = tm.next_dispatch(now).unwrap();
            ids.push(d.adu.transaction_id);
            let outcome = tm.fail(t, ModbusError::timeout("read response", 3000), false);
            assert_eq!(outcome, Some(FailOutcome::Retry { reconnect: false }));
            assert_eq!(tm.state(t), Some(TransactionState::Retrying));
        }

        let d = tm.next_dispatch(now).unwrap();
        assert_eq!(d.attempt, 3);
        ids.push(d.adu.transaction_id);
        assert_eq!(ids, vec![1, 2, 3]);

        match tm.fail(t, ModbusError::timeout("read response", 3000), false) {
            Some(FailOutcome::Surface(ModbusError::CommunicationFailure { attempts, .. })) => {
                assert_eq!(attempts, 3)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(tm.is_idle());
        assert_eq!(tm.awaiting_len(), 0);
    }

    #[test]
    fn test_exception_surfaces_without_retry() {
        let mut tm = tcp(ModbusConfig::default());
        let t = tm.submit(1, read_request()).unwrap();
        tm.next_dispatch(Instant::now()).unwrap();
        let exc = ModbusError::exception(3, ModbusException::IllegalDataAddress);
        assert_eq!(tm.fail(t, exc.clone(), true), Some(FailOutcome::Surface(exc)));
        assert_eq!(tm.attempts(t), None);
    }

    #[test]
    fn test_retry_goes_to_front_of_queue() {
        let mut tm = TransactionManager::new(true, &ModbusConfig::default());
        let now = Instant::now();
        let a = tm.submit(1, read_request()).unwrap();
        let _b = tm.submit(1, read_request()).unwrap();
        tm.next_dispatch(now).unwrap();
        tm.fail(a, ModbusError::frame("crc"), false);
        // Already queued again: a second fault is not charged
        assert_eq!(tm.fail(a, ModbusError::frame("crc"), false), None);
        assert!(tm.can_dispatch());
        assert_eq!(tm.next_dispatch(now).unwrap().ticket, a);
        assert!(!tm.can_dispatch());
    }

    #[test]
    fn test_cancel_releases_id_only_for_that_transaction() {
        let mut tm = tcp(ModbusConfig::default());
        let now = Instant::now();
        let a = tm.submit(1, read_request()).unwrap();
        let b = tm.submit(1, read_request()).unwrap();
        let queued = tm.submit(1, read_request()).unwrap();
        let da = tm.next_dispatch(now).unwrap();
        let db = tm.next_dispatch(now).unwrap();

        assert!(tm.cancel(a));
        assert!(tm.cancel(queued));
        assert!(!tm.cancel(a));
        assert_eq!(tm.match_frame(&da.adu), FrameMatch::Stray);
        assert_eq!(tm.match_frame(&db.adu), FrameMatch::Matched(b));
        assert_eq!(tm.awaiting_len(), 1);
        assert_eq!(tm.queued_len(), 0);
    }

    #[test]
    fn test_serial_cancel_holds_line_until_reply_or_deadline() {
        let mut tm = TransactionManager::new(true, &ModbusConfig::default());
        let now = Instant::now();
        let a = tm.submit(1, read_request()).unwrap();
        let b = tm.submit(1, read_request()).unwrap();
        let d = tm.next_dispatch(now).unwrap();

        assert!(tm.cancel(a));
        assert!(tm.is_orphaned(a));
        assert!(!tm.can_dispatch());
        assert!(tm.next_dispatch(now).is_none());

        // The late reply still belongs to the cancelled transaction
        assert_eq!(tm.match_frame(&d.adu), FrameMatch::Matched(a));
        assert!(tm.complete(a));
        assert_eq!(tm.next_dispatch(now).unwrap().ticket, b);
    }

    #[test]
    fn test_orphan_deadline_retires_without_retry() {
        let mut tm = TransactionManager::new(true, &ModbusConfig::default().with_retries(3));
        let now = Instant::now();
        let a = tm.submit(1, read_request()).unwrap();
        tm.next_dispatch(now).unwrap();
        assert!(tm.cancel(a));
        assert!(!tm.cancel(a));

        assert_eq!(tm.expired(now + tm.timeout()), vec![a]);
        assert_eq!(tm.fail(a, ModbusError::timeout("read response", 3000), false), None);
        assert!(tm.is_idle());
        assert_eq!(tm.awaiting_len(), 0);
    }

    #[test]
    fn test_invalidate_and_drain() {
        let mut tm = tcp(ModbusConfig::default());
        let now = Instant::now();
        let a = tm.submit(1, read_request()).unwrap();
        let b = tm.submit(1, read_request()).unwrap();
        let c = tm.submit(1, read_request()).unwrap();
        tm.next_dispatch(now).unwrap();
        tm.next_dispatch(now).unwrap();

        assert_eq!(tm.invalidate_awaiting(), vec![a, b]);
        assert_eq!(tm.drain(), vec![a, b, c]);
        assert!(tm.is_idle());
    }

    proptest! {
        #[test]
        fn prop_awaiting_ids_are_unique(ops in prop::collection::vec(any::<bool>(), 1..300)) {
            let mut tm = tcp(ModbusConfig::default().with_max_transaction_id(8).with_max_in_flight(8));
            let now = Instant::now();
            let mut live: Vec<(Ticket, u16)> = Vec::new();

            for dispatch in ops {
                if dispatch || live.is_empty() {
                    tm.submit(1, read_request()).unwrap();
                    if let Some(d) = tm.next_dispatch(now) {
                        prop_assert!(d.adu.transaction_id >= FIRST_TRANSACTION_ID);
                        prop_assert!(d.adu.transaction_id <= 8);
                        live.push((d.ticket, d.adu.transaction_id));
                    }
                } else {
                    let (ticket, _) = live.remove(0);
                    prop_assert!(tm.complete(ticket));
                }
                let ids: HashSet<u16> = live.iter().map(|&(_, id)| id).collect();
                prop_assert_eq!(ids.len(), live.len());
            }
        }
    }
}
