//! In-process broker clients and brokers for tests and benchmarks.
//!
//! [`MockConnector`] creates broker-client handles that keep records in a bounded queue
//! until the test completes or fails them (or acknowledges them right away). A completed
//! record keeps its place in the queue's capacity until the pool polls it. [`MockBroker`]
//! is a TCP listener speaking the produce protocol, for exercising the
//! [`TcpConnector`](crate::tcp::TcpConnector) end to end.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, Semaphore},
    task::{JoinHandle, JoinSet},
};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use capa_wire::produce::{self, Ack, BrokerCodec, Status};

use crate::client::{Connector, DeliveryError, DeliverySink, EnqueueError, Producer, Record};

#[derive(Debug, Error)]
#[error("Connect to slot {0} refused")]
pub struct MockConnectError(pub usize);

/// Creates [`MockProducer`]s and keeps a handle to every queue it created, so tests can
/// complete records and inspect what was sent.
#[derive(Debug, Clone)]
pub struct MockConnector {
    inner: Arc<ConnectorInner>,
}

#[derive(Debug)]
struct ConnectorInner {
    capacity: usize,
    auto_ack: bool,
    max_message_size: Option<usize>,
    refused: Mutex<HashSet<usize>>,
    /// The most recent queue of each slot.
    queues: Mutex<HashMap<usize, Arc<MockQueue>>>,
    connects: AtomicUsize,
}

impl MockConnector {
    /// Creates a connector whose producers hold at most `capacity` records each, counting
    /// completed records the pool has not polled yet.
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, false, None)
    }

    /// Creates a connector whose producers acknowledge every record on enqueue.
    pub fn auto_ack() -> Self {
        Self::build(usize::MAX, true, None)
    }

    /// Refuses records larger than `max` bytes on enqueue.
    pub fn with_max_message_size(self, max: usize) -> Self {
        Self::build(self.inner.capacity, self.inner.auto_ack, Some(max))
    }

    fn build(capacity: usize, auto_ack: bool, max_message_size: Option<usize>) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                capacity,
                auto_ack,
                max_message_size,
                refused: Mutex::new(HashSet::new()),
                queues: Mutex::new(HashMap::new()),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    /// Makes connecting `slot` fail (or succeed again).
    pub fn refuse(&self, slot: usize, refuse: bool) {
        let mut refused = self.inner.refused.lock();
        if refuse {
            refused.insert(slot);
        } else {
            refused.remove(&slot);
        }
    }

    /// The queue behind the current producer of `slot`.
    pub fn queue(&self, slot: usize) -> Option<Arc<MockQueue>> {
        self.inner.queues.lock().get(&slot).cloned()
    }

    /// Number of producers created so far.
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::Relaxed)
    }
}

impl Connector for MockConnector {
    type Producer = MockProducer;
    type Error = MockConnectError;

    fn connect(&self, slot: usize, sink: DeliverySink) -> Result<MockProducer, MockConnectError> {
        if self.inner.refused.lock().contains(&slot) {
            return Err(MockConnectError(slot));
        }

        let permits =
            (!self.inner.auto_ack).then(|| Arc::new(Semaphore::new(self.inner.capacity)));
        let queue = Arc::new(MockQueue {
            slot,
            permits,
            auto_ack: self.inner.auto_ack,
            max_message_size: self.inner.max_message_size,
            records: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            flushes: AtomicUsize::new(0),
            sink,
        });

        self.inner.queues.lock().insert(slot, Arc::clone(&queue));
        self.inner.connects.fetch_add(1, Ordering::Relaxed);

        Ok(MockProducer { queue })
    }
}

/// The records held by one [`MockProducer`].
#[derive(Debug)]
pub struct MockQueue {
    slot: usize,
    /// One permit per record held or awaiting a poll. `None` for auto-acknowledging queues.
    permits: Option<Arc<Semaphore>>,
    auto_ack: bool,
    max_message_size: Option<usize>,
    records: Mutex<VecDeque<Record>>,
    closed: AtomicBool,
    flushes: AtomicUsize,
    sink: DeliverySink,
}

impl MockQueue {
    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Acknowledges the `n` oldest records. Returns how many were acknowledged.
    pub fn complete(&self, n: usize) -> usize {
        self.finish(n, || Ok(()))
    }

    /// Acknowledges every held record.
    pub fn complete_all(&self) -> usize {
        self.complete(usize::MAX)
    }

    /// Fails the `n` oldest records with `error`. Returns how many were failed.
    pub fn fail(&self, n: usize, error: DeliveryError) -> usize {
        self.finish(n, || Err(error.clone()))
    }

    fn finish(&self, n: usize, result: impl Fn() -> Result<(), DeliveryError>) -> usize {
        let drained: Vec<_> = {
            let mut records = self.records.lock();
            let n = n.min(records.len());
            records.drain(..n).collect()
        };

        let count = drained.len();
        for record in drained {
            self.sink.report(record, result());
        }

        count
    }

    /// Makes every further enqueue fail with [`EnqueueError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of flush requests received.
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Sequence numbers of the held records, oldest first.
    pub fn seqs(&self) -> Vec<u64> {
        self.records.lock().iter().map(Record::seq).collect()
    }
}

/// A broker-client handle backed by a [`MockQueue`]. Records still held when the handle is
/// dropped are failed with [`DeliveryError::Shutdown`].
#[derive(Debug)]
pub struct MockProducer {
    queue: Arc<MockQueue>,
}

impl Producer for MockProducer {
    fn try_send(&self, mut record: Record) -> Result<(), EnqueueError> {
        let queue = &self.queue;

        if queue.is_closed() {
            return Err(EnqueueError::Closed(record));
        }

        if let Some(max) = queue.max_message_size {
            if record.len() > max {
                let size = record.len();
                return Err(EnqueueError::MessageTooLarge { record, size, max });
            }
        }

        if queue.auto_ack {
            queue.sink.report(record, Ok(()));
            return Ok(());
        }

        if let Some(permits) = &queue.permits {
            let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
                return Err(EnqueueError::QueueFull(record));
            };
            record.hold(permit);
        }

        queue.records.lock().push_back(record);
        Ok(())
    }

    fn flush(&self) {
        self.queue.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for MockProducer {
    fn drop(&mut self) {
        self.queue.close();
        let failed = self.queue.fail(usize::MAX, DeliveryError::Shutdown);
        if failed > 0 {
            debug!(slot = self.queue.slot, failed, "Mock producer dropped with held records");
        }
    }
}

/// A produce-protocol broker on a local TCP port. Acknowledges every message it receives
/// in order, unless told otherwise.
#[derive(Debug)]
pub struct MockBroker {
    addr: SocketAddr,
    shared: Arc<BrokerShared>,
    kick: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct BrokerShared {
    received: Mutex<Vec<produce::Message>>,
    rejected_topics: Mutex<HashSet<Bytes>>,
    /// Acks are withheld while this is set.
    silent: AtomicBool,
    connections: AtomicUsize,
}

impl MockBroker {
    /// Binds the broker to `addr`, e.g. `127.0.0.1:0`, and starts accepting connections.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(BrokerShared::default());
        let (kick, _) = broadcast::channel(1);

        let task = tokio::spawn(accept_loop(listener, Arc::clone(&shared), kick.clone()));
        debug!(%addr, "Mock broker listening");

        Ok(Self { addr, shared, kick, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// All messages received so far, in arrival order.
    pub fn received(&self) -> Vec<produce::Message> {
        self.shared.received.lock().clone()
    }

    pub fn received_count(&self) -> usize {
        self.shared.received.lock().len()
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Answers messages on `topic` with [`Status::UnknownTopic`].
    pub fn reject_topic(&self, topic: &str) {
        self.shared.rejected_topics.lock().insert(Bytes::copy_from_slice(topic.as_bytes()));
    }

    /// Stops (or resumes) acknowledging messages. Messages are still recorded.
    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::Relaxed);
    }

    /// Drops every open connection. The listener keeps accepting new ones.
    pub fn kick_connections(&self) {
        let _ = self.kick.send(());
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<BrokerShared>,
    kick: broadcast::Sender<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else {
                    break;
                };

                shared.connections.fetch_add(1, Ordering::Relaxed);
                trace!(%peer, "Mock broker accepted connection");
                connections.spawn(serve(stream, Arc::clone(&shared), kick.subscribe()));
            }
            Some(_) = connections.join_next() => {}
        }
    }
}

async fn serve(stream: TcpStream, shared: Arc<BrokerShared>, mut kick: broadcast::Receiver<()>) {
    let mut framed = Framed::new(stream, BrokerCodec::new());

    loop {
        let msg = tokio::select! {
            _ = kick.recv() => break,
            msg = framed.next() => msg,
        };

        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(err = ?e, "Mock broker failed to decode message");
                break;
            }
            None => break,
        };

        let status = if shared.rejected_topics.lock().contains(msg.topic()) {
            Status::UnknownTopic
        } else {
            Status::Ok
        };

        let seq = msg.seq();
        shared.received.lock().push(msg);

        if shared.silent.load(Ordering::Relaxed) {
            continue;
        }

        if let Err(e) = framed.send(Ack::new(seq, status)).await {
            debug!(err = ?e, "Mock broker failed to send ack");
            break;
        }
    }
}
