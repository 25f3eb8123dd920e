//! The seam between the connection pool and a broker client.
//!
//! A [`Connector`] creates one [`Producer`] handle per pool slot. The pool hands records to
//! the handle with [`Producer::try_send`]; the client reports every record it accepted
//! exactly once through the slot's [`DeliverySink`], and the pool drains those reports when
//! the caller polls.

use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::trace;

use capa_wire::produce::Status;

use crate::PacketBuffer;

/// A packet owned by a broker client while it is in flight.
#[derive(Debug)]
pub struct Record {
    /// Index of the slot this record was submitted on.
    slot: usize,
    /// Per-slot submission sequence number.
    seq: u64,
    /// The publisher's share of the packet.
    buffer: PacketBuffer,
    /// The broker client's queue slot. Released when the record is dropped, which for a
    /// reported record happens when its completion is polled.
    permit: Option<OwnedSemaphorePermit>,
}

impl Record {
    pub(crate) fn new(slot: usize, seq: u64, buffer: PacketBuffer) -> Self {
        Self { slot, seq, buffer, permit: None }
    }

    /// Ties a queue permit to the record.
    pub(crate) fn hold(&mut self, permit: OwnedSemaphorePermit) {
        self.permit = Some(permit);
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The record key: the packet capture timestamp in epoch microseconds.
    #[inline]
    pub fn key(&self) -> u64 {
        self.buffer.timestamp_micros()
    }

    #[inline]
    pub fn buffer(&self) -> &PacketBuffer {
        &self.buffer
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Why a record accepted by a broker client was not delivered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Broker rejected the message: {0}")]
    Rejected(Status),
    #[error("Broker connection lost and retries exhausted")]
    Disconnected,
    #[error("Message timed out before delivery")]
    TimedOut,
    #[error("Compression failed: {0}")]
    Compression(String),
    #[error("Producer shut down before delivery")]
    Shutdown,
}

/// The outcome of one record, written by the broker client.
#[derive(Debug)]
pub struct Delivery {
    pub(crate) record: Record,
    pub(crate) result: Result<(), DeliveryError>,
}

/// The completion side of a slot. Broker clients report every record they accepted here,
/// in the order they complete.
#[derive(Debug, Clone)]
pub struct DeliverySink {
    slot: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl DeliverySink {
    /// Reports the outcome of a record. Never blocks.
    ///
    /// If the pool is already gone the record is dropped, releasing its buffer share.
    pub fn report(&self, record: Record, result: Result<(), DeliveryError>) {
        if let Err(e) = self.tx.send(Delivery { record, result }) {
            trace!(slot = self.slot, seq = e.0.record.seq, "Pool closed, dropping delivery report");
        }
    }

    /// The slot this sink belongs to.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Creates the completion queue of a slot.
pub(crate) fn completion_queue(slot: usize) -> (DeliverySink, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeliverySink { slot, tx }, rx)
}

/// Why a broker client refused a record. Every variant hands the record back.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The local outbound queue is full. Recoverable: try again after polling.
    #[error("Local queue full")]
    QueueFull(Record),
    #[error("Message too large: {size} bytes, max {max}")]
    MessageTooLarge { record: Record, size: usize, max: usize },
    #[error("Message rejected: {reason}")]
    Rejected { record: Record, reason: String },
    /// The client can no longer accept records. The pool recreates the slot's handle.
    #[error("Producer closed")]
    Closed(Record),
}

impl EnqueueError {
    /// Takes the refused record back.
    pub fn into_record(self) -> Record {
        match self {
            Self::QueueFull(record) | Self::Closed(record) => record,
            Self::MessageTooLarge { record, .. } | Self::Rejected { record, .. } => record,
        }
    }

    #[inline]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::QueueFull(_))
    }
}

/// A broker-client handle bound to one pool slot.
pub trait Producer: Send + Sync + 'static {
    /// Enqueues a record for asynchronous delivery. Must never block on I/O.
    ///
    /// On `Ok`, the client owns the record and must eventually report it on the slot's
    /// [`DeliverySink`]. A reported record keeps its queue capacity until the pool polls
    /// its completion.
    fn try_send(&self, record: Record) -> Result<(), EnqueueError>;

    /// Asks the client to transmit anything it holds back for batching as soon as possible.
    /// Must not block.
    fn flush(&self) {}
}

/// Creates broker-client handles for pool slots.
pub trait Connector: Send + Sync + 'static {
    type Producer: Producer;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates the handle for `slot`, reporting completions on `sink`.
    fn connect(&self, slot: usize, sink: DeliverySink) -> Result<Self::Producer, Self::Error>;
}
