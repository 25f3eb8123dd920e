//! Wire formats spoken between a capa producer and a broker.
//!
//! - [`produce`]: produce frames (client to broker) and delivery acks (broker to client).
//! - [`compression`]: per-message payload compression codecs.

pub mod compression;
pub mod produce;
