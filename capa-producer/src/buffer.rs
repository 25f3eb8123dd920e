use std::{fmt, ops::Deref, sync::Arc};

use bytes::Bytes;

use capa_common::unix_micros;

/// Capture metadata attached to a packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMeta {
    /// Capture timestamp in microseconds since the UNIX epoch. Published as the record key.
    pub timestamp_micros: u64,
    /// Length of the packet on the wire. Can exceed the captured length when the capture
    /// engine truncates packets to a snap length.
    pub orig_len: u32,
}

/// A captured packet, shared between the capture engine and the publisher.
///
/// Cloning a `PacketBuffer` takes another share of the same bytes; the bytes are freed when
/// the last share is dropped.
///
/// ## Release contract
/// The publisher takes one share per buffer it hands to a broker client and drops it when
/// the delivery completion for that buffer is drained by
/// [`ConnectionPool::poll`](crate::ConnectionPool::poll), or immediately when the buffer is
/// rejected. The caller's own handle is never touched, so the caller may drop or reuse
/// it at any point.
#[derive(Clone)]
pub struct PacketBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    data: Bytes,
    meta: PacketMeta,
}

impl PacketBuffer {
    /// Wraps captured bytes, stamping them with the current time.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let meta = PacketMeta { timestamp_micros: unix_micros(), orig_len: orig_len(data.len()) };
        Self::with_meta(data, meta)
    }

    /// Wraps captured bytes with explicit capture metadata.
    pub fn with_meta(data: impl Into<Bytes>, meta: PacketMeta) -> Self {
        Self { inner: Arc::new(Inner { data: data.into(), meta }) }
    }

    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.inner.data
    }

    #[inline]
    pub fn meta(&self) -> &PacketMeta {
        &self.inner.meta
    }

    #[inline]
    pub fn timestamp_micros(&self) -> u64 {
        self.inner.meta.timestamp_micros
    }

    /// Number of captured bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Number of live shares of this buffer, the caller's included.
    #[inline]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

/// Wire length of a packet captured whole, saturating at `u32::MAX`.
#[inline]
fn orig_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl Deref for PacketBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.inner.data
    }
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.inner.data
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len())
            .field("meta", self.meta())
            .field("shares", &self.ref_count())
            .finish()
    }
}
