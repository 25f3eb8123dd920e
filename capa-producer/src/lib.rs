//! Batched packet publishing over a fixed pool of broker connections.
//!
//! A [`ConnectionPool`] owns one broker-client handle per slot. Capture workers hand
//! batches of [`PacketBuffer`]s to [`ConnectionPool::send`]; the broker clients deliver them
//! asynchronously and report every outcome on the slot's completion queue, which
//! [`ConnectionPool::poll`] drains. Outcomes surface only through the pool statistics.
//!
//! The broker client behind a slot is pluggable through [`Connector`]. [`tcp`] provides
//! the client for the capa produce protocol; [`mock`] provides in-process stand-ins.

mod backoff;

mod buffer;
pub use buffer::{PacketBuffer, PacketMeta};

pub mod client;
pub use client::{Connector, DeliveryError, DeliverySink, EnqueueError, Producer, Record};

mod config;
pub use config::{Config, ConfigError, PoolOptions, ProducerOptions};

mod error;
pub use error::PoolError;

pub mod mock;

mod pool;
pub use pool::ConnectionPool;

mod slot;
pub use slot::DeliveryReport;

mod stats;
pub use stats::{PoolStats, SlotStats};

pub mod tcp;
