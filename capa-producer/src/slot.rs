use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::{
    client::{completion_queue, Connector, Delivery, DeliveryError, DeliverySink, Record},
    stats::SlotCounters,
    EnqueueError, PacketBuffer, PoolError, Producer, SlotStats,
};

/// The outcome of one record, as handed to
/// [`ConnectionPool::poll_with`](crate::ConnectionPool::poll_with).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// The slot the record was sent on.
    pub slot: usize,
    /// Per-slot submission sequence number.
    pub seq: u64,
    /// The record key (capture timestamp in epoch microseconds).
    pub key: u64,
    /// Payload length in bytes.
    pub len: usize,
    /// `Ok` if the broker acknowledged the record.
    pub result: Result<(), DeliveryError>,
}

/// One entry of the pool: a broker-client handle, its completion queue and its counters.
pub(crate) struct Slot<P> {
    index: usize,
    /// The broker-client handle. `None` once the slot has been shut down.
    producer: ArcSwapOption<P>,
    /// Handed to replacement handles on reconnect.
    sink: DeliverySink,
    /// Completions written by the broker client. Taken on shutdown.
    completions: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    counters: SlotCounters,
    next_seq: AtomicU64,
    /// Set while the broker client's local queue is full.
    backpressured: AtomicBool,
}

impl<P: Producer> Slot<P> {
    /// Creates slot `index`, connecting its broker-client handle.
    pub(crate) fn connect<C>(index: usize, connector: &C) -> Result<Self, C::Error>
    where
        C: Connector<Producer = P>,
    {
        let (sink, completions) = completion_queue(index);
        let producer = connector.connect(index, sink.clone())?;

        Ok(Self {
            index,
            producer: ArcSwapOption::from_pointee(producer),
            sink,
            completions: Mutex::new(Some(completions)),
            counters: SlotCounters::default(),
            next_seq: AtomicU64::new(0),
            backpressured: AtomicBool::new(false),
        })
    }

    /// Hands `buffers` to the broker client in order. Returns how many were consumed.
    ///
    /// Stops at the first buffer refused for lack of local queue space; that buffer and
    /// everything after it stay with the caller. Any other refusal counts the buffer as
    /// failed and consumed.
    pub(crate) fn send<C>(
        &self,
        buffers: &[PacketBuffer],
        connector: &C,
    ) -> Result<usize, PoolError>
    where
        C: Connector<Producer = P>,
    {
        let Some(mut producer) = self.producer.load_full() else {
            return Err(PoolError::NotInitialized);
        };

        let mut consumed = 0;
        for buffer in buffers {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let record = Record::new(self.index, seq, buffer.clone());

            self.counters.reserve();
            match producer.try_send(record) {
                Ok(()) => self.counters.on_submitted(),
                Err(EnqueueError::QueueFull(record)) => {
                    self.counters.unreserve();
                    self.counters.on_backpressure();
                    drop(record);

                    if self.backpressured.swap(true, Ordering::Relaxed) {
                        trace!(slot = self.index, seq, consumed, "Local queue full");
                    } else {
                        warn!(slot = self.index, consumed, "Local queue full, pushing back");
                    }

                    return Ok(consumed);
                }
                Err(e) => {
                    // A reservation already abandoned by `close` was counted as failed there.
                    if self.counters.unreserve() {
                        self.counters.on_send_failed();
                    }
                    debug!(slot = self.index, seq, err = %e, "Broker client refused packet");

                    if matches!(e, EnqueueError::Closed(_)) {
                        if let Some(replacement) = self.reconnect(&producer, connector) {
                            producer = replacement;
                        }
                    }
                }
            }

            consumed += 1;
        }

        if consumed > 0 {
            self.backpressured.store(false, Ordering::Relaxed);
        }

        Ok(consumed)
    }

    /// Replaces a closed broker-client handle. Returns `None` if a new handle could not be
    /// created or the slot was shut down in the meantime.
    fn reconnect<C>(&self, closed: &Arc<P>, connector: &C) -> Option<Arc<P>>
    where
        C: Connector<Producer = P>,
    {
        let replacement = match connector.connect(self.index, self.sink.clone()) {
            Ok(producer) => Arc::new(producer),
            Err(e) => {
                warn!(slot = self.index, err = %e, "Failed to recreate broker client");
                return None;
            }
        };

        let current = Some(Arc::clone(closed));
        let previous = self.producer.compare_and_swap(&current, Some(Arc::clone(&replacement)));
        let swapped = match (&*previous, &current) {
            (Some(previous), Some(current)) => Arc::ptr_eq(previous, current),
            _ => false,
        };

        if !swapped {
            debug!(slot = self.index, "Slot changed while reconnecting, discarding new client");
            return None;
        }

        self.counters.on_reconnect();
        info!(slot = self.index, "Recreated broker client");
        Some(replacement)
    }

    /// Asks the broker client to transmit everything it holds back.
    pub(crate) fn flush(&self) {
        let producer = self.producer.load();
        if let Some(producer) = &*producer {
            producer.flush();
        }
    }

    /// Drains up to `budget` completions, calling `report` for each. Returns the number
    /// drained. Returns `0` without waiting if another thread is draining this slot.
    pub(crate) fn poll<F>(&self, budget: usize, report: &mut F) -> usize
    where
        F: FnMut(&DeliveryReport),
    {
        let Some(mut completions) = self.completions.try_lock() else {
            return 0;
        };
        let Some(rx) = completions.as_mut() else {
            return 0;
        };

        let mut drained = 0;
        while drained < budget {
            let Ok(delivery) = rx.try_recv() else {
                break;
            };

            self.complete(delivery, report);
            drained += 1;
        }

        drained
    }

    fn complete<F>(&self, delivery: Delivery, report: &mut F)
    where
        F: FnMut(&DeliveryReport),
    {
        let Delivery { record, result } = delivery;

        match result {
            Ok(()) => self.counters.on_delivered(record.len()),
            Err(ref e) => {
                self.counters.on_delivery_failed();
                debug!(slot = self.index, seq = record.seq(), err = %e, "Packet delivery failed");
            }
        }

        report(&DeliveryReport {
            slot: self.index,
            seq: record.seq(),
            key: record.key(),
            len: record.len(),
            result,
        });
    }

    /// Drops the broker-client handle, drains the completions it leaves behind and counts
    /// whatever is still unreported as failed. Returns the number of abandoned records.
    pub(crate) fn shutdown(&self) -> usize {
        drop(self.producer.swap(None));

        let mut completions = self.completions.lock();
        if let Some(mut rx) = completions.take() {
            while let Ok(delivery) = rx.try_recv() {
                self.complete(delivery, &mut |_| {});
            }
        }

        self.counters.abandon_in_flight()
    }

    #[inline]
    pub(crate) fn in_flight(&self) -> usize {
        self.counters.in_flight()
    }

    #[inline]
    pub(crate) fn stats(&self) -> SlotStats {
        self.counters.snapshot()
    }
}
