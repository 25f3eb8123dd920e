use thiserror::Error;

/// Errors returned by [`ConnectionPool`](crate::ConnectionPool) operations.
///
/// Delivery outcomes never show up here: they are absorbed into the slot counters and
/// surface through [`ConnectionPool::stats`](crate::ConnectionPool::stats).
#[derive(Debug, Error)]
pub enum PoolError {
    /// A slot's broker-client handle could not be created. No pool was built.
    #[error("Failed to initialize slot {slot}: {source}")]
    Init {
        slot: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The pool was opened with zero slots.
    #[error("A connection pool needs at least one slot")]
    NoSlots,
    /// The operation was invoked after the pool was closed.
    #[error("Connection pool is not initialized")]
    NotInitialized,
    /// The slot index is out of range. Nothing was consumed.
    #[error("Invalid slot index {slot}, pool has {slots} slots")]
    InvalidSlot { slot: usize, slots: usize },
}
