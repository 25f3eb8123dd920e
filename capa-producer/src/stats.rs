use std::{
    iter::Sum,
    ops::Add,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

/// Counters of a single slot. These are shared between the send path, the poller and
/// readers of the stats, and are only ever updated with relaxed atomics.
#[derive(Debug, Default)]
pub(crate) struct SlotCounters {
    /// Records accepted by the broker client.
    submitted: AtomicU64,
    /// Records the broker acknowledged.
    delivered: AtomicU64,
    /// Records rejected on enqueue, failed by the broker client, or abandoned on close.
    failed: AtomicU64,
    /// Payload bytes of delivered records.
    bytes_delivered: AtomicU64,
    /// Number of `send` calls cut short by a full local queue.
    backpressure: AtomicU64,
    /// Number of times the broker-client handle was recreated.
    reconnects: AtomicU64,
    /// Records submitted whose completion has not been drained yet.
    in_flight: AtomicUsize,
}

impl SlotCounters {
    /// Reserves in-flight depth for a record about to be handed to the broker client. The
    /// client may report the record before `try_send` even returns, so the depth has to be
    /// taken first.
    #[inline]
    pub(crate) fn reserve(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Gives back a reservation for a record the broker client refused. Returns `false` if
    /// the depth was already zero because [`abandon_in_flight`](Self::abandon_in_flight)
    /// took it.
    #[inline]
    pub(crate) fn unreserve(&self) -> bool {
        self.release()
    }

    /// Decrements the in-flight depth without wrapping below zero.
    #[inline]
    fn release(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| depth.checked_sub(1))
            .is_ok()
    }

    #[inline]
    pub(crate) fn on_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_delivered(&self, bytes: usize) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.bytes_delivered.fetch_add(bytes as u64, Ordering::Relaxed);
        self.release();
    }

    /// A submitted record failed asynchronously.
    #[inline]
    pub(crate) fn on_delivery_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.release();
    }

    /// A record was refused by the broker client before being submitted.
    #[inline]
    pub(crate) fn on_send_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_backpressure(&self) {
        self.backpressure.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts everything still in flight as failed and resets the depth. Returns how many
    /// records were abandoned.
    pub(crate) fn abandon_in_flight(&self) -> usize {
        let abandoned = self.in_flight.swap(0, Ordering::Relaxed);
        self.failed.fetch_add(abandoned as u64, Ordering::Relaxed);
        abandoned
    }

    #[inline]
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> SlotStats {
        SlotStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            backpressure: self.backpressure.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            queue_depth: self.in_flight.load(Ordering::Relaxed) as u64,
        }
    }
}

/// A point-in-time snapshot of one slot's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    /// Records accepted by the broker client.
    pub submitted: u64,
    /// Records acknowledged by the broker.
    pub delivered: u64,
    /// Records refused on enqueue, failed after submission, or abandoned on close.
    pub failed: u64,
    /// Payload bytes of delivered records.
    pub bytes_delivered: u64,
    /// Number of `send` calls cut short by a full local queue.
    pub backpressure: u64,
    /// Number of times the broker-client handle was recreated.
    pub reconnects: u64,
    /// Records submitted whose completion has not been polled yet.
    pub queue_depth: u64,
}

impl Add for SlotStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            submitted: self.submitted + rhs.submitted,
            delivered: self.delivered + rhs.delivered,
            failed: self.failed + rhs.failed,
            bytes_delivered: self.bytes_delivered + rhs.bytes_delivered,
            backpressure: self.backpressure + rhs.backpressure,
            reconnects: self.reconnects + rhs.reconnects,
            queue_depth: self.queue_depth + rhs.queue_depth,
        }
    }
}

impl Sum for SlotStats {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// Pool-wide delivery statistics, summed over every slot.
///
/// All counters are monotonic except `queue_depth`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of slots in the pool.
    pub slots: usize,
    /// Records accepted by the broker clients.
    pub submitted: u64,
    /// Records acknowledged by the broker.
    pub delivered: u64,
    /// Records that failed: refused on enqueue, failed after submission, or still
    /// unacknowledged when the pool was closed.
    pub failed: u64,
    pub bytes_delivered: u64,
    /// Number of `send` calls cut short by a full local queue.
    pub backpressure: u64,
    pub reconnects: u64,
    /// Records currently owned by the broker clients or awaiting a poll.
    pub queue_depth: u64,
}

impl PoolStats {
    pub(crate) fn from_slots(slots: usize, total: SlotStats) -> Self {
        Self {
            slots,
            submitted: total.submitted,
            delivered: total.delivered,
            failed: total.failed,
            bytes_delivered: total.bytes_delivered,
            backpressure: total.backpressure,
            reconnects: total.reconnects,
            queue_depth: total.queue_depth,
        }
    }

    /// Records whose outcome is known.
    #[inline]
    pub fn completed(&self) -> u64 {
        self.delivered + self.failed
    }
}
