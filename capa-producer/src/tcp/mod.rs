//! Broker client speaking the capa produce protocol over TCP.
//!
//! Every slot gets its own [`TcpProducer`] handle backed by a driver task on a Tokio runtime.
//! The handle only does bounded, non-blocking work: it takes a queue permit and forwards
//! the record to the driver, which batches records onto the connection, matches
//! acknowledgements and reconnects when the broker goes away.

use std::sync::Arc;

use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{mpsc, Semaphore},
};
use tracing::Instrument;

use crate::{
    client::{Connector, DeliverySink, EnqueueError, Producer, Record},
    ProducerOptions,
};

mod driver;
use driver::{Command, Pending, ProducerDriver};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("No Tokio runtime available to drive broker connections")]
    NoRuntime,
    #[error("No broker endpoints configured")]
    NoBrokers,
    #[error("Invalid broker endpoint {0:?}, expected host:port")]
    InvalidBroker(String),
    #[error("No topic configured")]
    NoTopic,
    #[error("Topic is {0} bytes long, at most 65535 are allowed")]
    TopicTooLong(usize),
    #[error("Queue size must be at least 1")]
    ZeroQueueSize,
}

/// Creates [`TcpProducer`]s, spawning their drivers on a Tokio runtime.
///
/// Slot `i` connects to broker `i % brokers.len()`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    options: Arc<ProducerOptions>,
    handle: Handle,
}

impl TcpConnector {
    /// Creates a connector that spawns drivers on the current Tokio runtime.
    pub fn new(options: ProducerOptions) -> Result<Self, ConnectError> {
        let handle = Handle::try_current().map_err(|_| ConnectError::NoRuntime)?;
        Ok(Self::with_handle(options, handle))
    }

    /// Creates a connector that spawns drivers on the runtime behind `handle`. Use this
    /// when the pool is opened from a thread outside the runtime.
    pub fn with_handle(options: ProducerOptions, handle: Handle) -> Self {
        Self { options: Arc::new(options), handle }
    }

    #[inline]
    pub fn options(&self) -> &ProducerOptions {
        &self.options
    }
}

impl Connector for TcpConnector {
    type Producer = TcpProducer;
    type Error = ConnectError;

    fn connect(&self, slot: usize, sink: DeliverySink) -> Result<TcpProducer, ConnectError> {
        validate(&self.options)?;

        let broker = self.options.brokers[slot % self.options.brokers.len()].clone();
        let (to_driver, from_producer) = mpsc::unbounded_channel();

        // Timers are bound to the runtime they are created on.
        let _guard = self.handle.enter();
        let span = tracing::debug_span!("producer", slot, broker = %broker);
        let driver = ProducerDriver::new(broker, Arc::clone(&self.options), from_producer, sink);
        self.handle.spawn(driver.instrument(span));

        Ok(TcpProducer {
            to_driver,
            permits: Arc::new(Semaphore::new(self.options.queue_size)),
            queue_size: self.options.queue_size,
            max_message_size: self.options.max_message_size,
        })
    }
}

fn validate(options: &ProducerOptions) -> Result<(), ConnectError> {
    if options.brokers.is_empty() {
        return Err(ConnectError::NoBrokers);
    }

    for broker in &options.brokers {
        let valid = broker
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());

        if !valid {
            return Err(ConnectError::InvalidBroker(broker.clone()));
        }
    }

    if options.topic.is_empty() {
        return Err(ConnectError::NoTopic);
    }

    if options.topic.len() > u16::MAX as usize {
        return Err(ConnectError::TopicTooLong(options.topic.len()));
    }

    if options.queue_size == 0 {
        return Err(ConnectError::ZeroQueueSize);
    }

    Ok(())
}

/// The handle of one slot's TCP broker client.
///
/// Dropping the handle stops its driver; records it still holds are failed with
/// [`DeliveryError::Shutdown`](crate::DeliveryError::Shutdown).
#[derive(Debug)]
pub struct TcpProducer {
    to_driver: mpsc::UnboundedSender<Command>,
    /// One permit per record held by the driver or awaiting a poll.
    permits: Arc<Semaphore>,
    queue_size: usize,
    max_message_size: usize,
}

impl TcpProducer {
    /// Number of records the driver holds right now, reported but unpolled ones included.
    pub fn queued(&self) -> usize {
        self.queue_size.saturating_sub(self.permits.available_permits())
    }
}

impl Producer for TcpProducer {
    fn try_send(&self, mut record: Record) -> Result<(), EnqueueError> {
        if record.len() > self.max_message_size {
            let size = record.len();
            return Err(EnqueueError::MessageTooLarge { record, size, max: self.max_message_size });
        }

        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return Err(EnqueueError::QueueFull(record));
        };
        record.hold(permit);

        if let Err(mpsc::error::SendError(Command::Send(pending))) =
            self.to_driver.send(Command::Send(Pending::new(record)))
        {
            return Err(EnqueueError::Closed(pending.into_record()));
        }

        Ok(())
    }

    fn flush(&self) {
        let _ = self.to_driver.send(Command::Flush);
    }
}
