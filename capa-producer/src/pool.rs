use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    slot::{DeliveryReport, Slot},
    Connector, PacketBuffer, PoolError, PoolOptions, PoolStats, SlotStats,
};

/// How long `close` sleeps between polls while waiting for outstanding records.
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A fixed-size pool of broker-client handles that publishes packet batches.
///
/// Every slot has its own broker client, completion queue and counters. Slots are
/// independent: a caller that keeps each capture worker on its own slot never contends
/// with the others. All operations take `&self`, so the pool can be shared across worker
/// threads behind an `Arc`.
///
/// ```no_run
/// use capa_producer::{
///     tcp::TcpConnector, ConnectionPool, PacketBuffer, PoolOptions, ProducerOptions,
/// };
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let connector = TcpConnector::new(ProducerOptions::new(["127.0.0.1:9092"], "pcap"))?;
/// let pool = ConnectionPool::open(4, connector, PoolOptions::default())?;
///
/// let batch = vec![PacketBuffer::new(vec![0u8; 64]); 32];
/// let sent = pool.send(&batch, 0)?;
/// pool.poll()?;
///
/// let stats = pool.close()?;
/// println!("sent {sent}, delivered {}", stats.delivered);
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<C: Connector> {
    connector: C,
    options: PoolOptions,
    slots: Box<[Slot<C::Producer>]>,
    open: AtomicBool,
}

impl<C: Connector> ConnectionPool<C> {
    /// Opens a pool with `num_connections` slots, creating one broker-client handle per slot.
    ///
    /// Either every slot comes up or none does: handles created before a failing slot are
    /// torn down again.
    pub fn open(
        num_connections: usize,
        connector: C,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        if num_connections == 0 {
            return Err(PoolError::NoSlots);
        }

        let mut slots = Vec::with_capacity(num_connections);
        for index in 0..num_connections {
            match Slot::connect(index, &connector) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    warn!(slot = index, err = %e, "Failed to create broker client");
                    for slot in &slots {
                        slot.shutdown();
                    }

                    return Err(PoolError::Init { slot: index, source: Box::new(e) });
                }
            }
        }

        info!(slots = num_connections, "Opened connection pool");

        let slots = slots.into_boxed_slice();
        Ok(Self { connector, options, slots, open: AtomicBool::new(true) })
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always `false`: a pool has at least one slot.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether the pool still accepts operations.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// The options the pool was opened with.
    #[inline]
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// The connector the slots were created with.
    #[inline]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Publishes `buffers`, in order, on `slot`. Returns how many were consumed; the rest
    /// were not taken because the slot's local queue filled up and may be resent after a
    /// [`poll`](Self::poll).
    ///
    /// Consumed buffers are either in flight or already counted as failed. The pool keeps
    /// its own share of each in-flight buffer and drops it once the completion is polled.
    /// If the broker client reports itself closed, the slot's handle is recreated and the
    /// rest of the batch goes to the new handle.
    pub fn send(&self, buffers: &[PacketBuffer], slot: usize) -> Result<usize, PoolError> {
        self.ensure_open()?;
        self.slot(slot)?.send(buffers, &self.connector)
    }

    /// Drains pending completions on every slot without blocking, up to the configured
    /// budget per slot. Returns the number of completions serviced.
    pub fn poll(&self) -> Result<usize, PoolError> {
        self.poll_with(|_| {})
    }

    /// Like [`poll`](Self::poll), calling `report` for every serviced completion. Reports
    /// of one slot are handed out in completion order.
    pub fn poll_with<F>(&self, mut report: F) -> Result<usize, PoolError>
    where
        F: FnMut(&DeliveryReport),
    {
        self.ensure_open()?;
        Ok(self.poll_slots(&mut report))
    }

    /// Returns the pool-wide statistics.
    pub fn stats(&self) -> Result<PoolStats, PoolError> {
        self.ensure_open()?;
        Ok(self.collect_stats())
    }

    /// Returns the statistics of a single slot.
    pub fn slot_stats(&self, slot: usize) -> Result<SlotStats, PoolError> {
        self.ensure_open()?;
        Ok(self.slot(slot)?.stats())
    }

    /// Flushes every slot and waits up to the configured flush timeout for outstanding
    /// records, then tears the pool down and returns the final statistics. Records still
    /// unacknowledged at the deadline are counted as failed.
    ///
    /// Blocks the calling thread while waiting. Broker clients that are driven by an async
    /// runtime must not depend on this thread to make progress.
    ///
    /// After `close`, every operation returns [`PoolError::NotInitialized`].
    pub fn close(&self) -> Result<PoolStats, PoolError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Err(PoolError::NotInitialized);
        }

        debug!(slots = self.slots.len(), "Closing connection pool");
        for slot in self.slots.iter() {
            slot.flush();
        }

        let deadline = Instant::now() + self.options.flush_timeout;
        loop {
            self.poll_slots(&mut |_| {});

            let outstanding: usize = self.slots.iter().map(Slot::in_flight).sum();
            if outstanding == 0 {
                break;
            }

            if Instant::now() >= deadline {
                warn!(outstanding, timeout = ?self.options.flush_timeout, "Flush timed out");
                break;
            }

            thread::sleep(CLOSE_POLL_INTERVAL);
        }

        let abandoned: usize = self.slots.iter().map(Slot::shutdown).sum();
        if abandoned > 0 {
            warn!(abandoned, "Counted unacknowledged packets as failed");
        }

        let stats = self.collect_stats();
        info!(
            submitted = stats.submitted,
            delivered = stats.delivered,
            failed = stats.failed,
            "Closed connection pool"
        );

        Ok(stats)
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(PoolError::NotInitialized)
        }
    }

    fn slot(&self, slot: usize) -> Result<&Slot<C::Producer>, PoolError> {
        self.slots.get(slot).ok_or(PoolError::InvalidSlot { slot, slots: self.slots.len() })
    }

    fn poll_slots<F>(&self, report: &mut F) -> usize
    where
        F: FnMut(&DeliveryReport),
    {
        let budget = self.options.poll_budget.max(1);
        self.slots.iter().map(|slot| slot.poll(budget, report)).sum()
    }

    fn collect_stats(&self) -> PoolStats {
        PoolStats::from_slots(self.slots.len(), self.slots.iter().map(Slot::stats).sum())
    }
}

impl<C: Connector> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                debug!(err = %e, "Failed to close connection pool on drop");
            }
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("slots", &self.slots.len())
            .field("open", &self.is_open())
            .field("options", &self.options)
            .finish()
    }
}
