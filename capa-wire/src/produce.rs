use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::compression::CompressionType;

/// The ID of a produce frame on the wire.
const PRODUCE_WIRE_ID: u8 = 0x05;
/// The ID of a delivery ack frame on the wire.
const ACK_WIRE_ID: u8 = 0x06;

/// Fixed part of a produce frame header: wire ID, topic size, sequence, compression, key,
/// payload size.
const PRODUCE_HEADER_LEN: usize = 1 + 2 + 4 + 1 + 8 + 4;
/// Wire ID, sequence, status.
const ACK_LEN: usize = 1 + 4 + 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Invalid wire ID: {0}")]
    WireId(u8),
    #[error("Invalid compression type: {0}")]
    Compression(u8),
    #[error("Invalid ack status: {0}")]
    Status(u8),
    #[error("Topic too large: {0} bytes, max 65535")]
    TopicTooLarge(usize),
    #[error("Payload too large: {0} bytes, max 4GiB")]
    PayloadTooLarge(usize),
}

/// A produce frame: one captured packet bound for a topic.
#[derive(Debug, Clone)]
pub struct Message {
    header: Header,
    /// The (possibly compressed) packet bytes.
    payload: Bytes,
}

impl Message {
    /// Creates a new uncompressed produce frame. The key is the packet capture timestamp in
    /// epoch microseconds.
    #[inline]
    pub fn new(seq: u32, topic: Bytes, key: u64, payload: Bytes) -> Self {
        Self::with_compression(seq, topic, key, payload, CompressionType::None)
    }

    /// Creates a new produce frame whose payload was compressed with `compression`.
    #[inline]
    pub fn with_compression(
        seq: u32,
        topic: Bytes,
        key: u64,
        payload: Bytes,
        compression: CompressionType,
    ) -> Self {
        Self {
            header: Header { topic, seq, compression, key, size: payload.len() },
            payload,
        }
    }

    #[inline]
    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    #[inline]
    pub fn topic(&self) -> &Bytes {
        &self.header.topic
    }

    #[inline]
    pub fn key(&self) -> u64 {
        self.header.key
    }

    #[inline]
    pub fn compression(&self) -> CompressionType {
        self.header.compression
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Size of the encoded frame in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        PRODUCE_HEADER_LEN + self.header.topic.len() + self.payload.len()
    }
}

#[derive(Debug, Clone)]
struct Header {
    topic: Bytes,
    seq: u32,
    compression: CompressionType,
    key: u64,
    size: usize,
}

/// Delivery outcome reported by the broker for one produce frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    UnknownTopic = 1,
    MessageTooLarge = 2,
    Rejected = 3,
}

impl Status {
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl TryFrom<u8> for Status {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::UnknownTopic),
            2 => Ok(Self::MessageTooLarge),
            3 => Ok(Self::Rejected),
            _ => Err(value),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::UnknownTopic => "unknown topic",
            Self::MessageTooLarge => "message too large",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// An ack frame. Brokers ack frames of one connection in the order they were received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    seq: u32,
    status: Status,
}

impl Ack {
    #[inline]
    pub fn new(seq: u32, status: Status) -> Self {
        Self { seq, status }
    }

    #[inline]
    pub fn seq(&self) -> u32 {
        self.seq
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }
}

/// Client side codec: encodes produce frames, decodes acks.
#[derive(Debug, Default)]
pub struct Codec;

impl Codec {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<Message> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let topic_len = item.header.topic.len();
        let topic_size = u16::try_from(topic_len).map_err(|_| Error::TopicTooLarge(topic_len))?;
        let payload_len = item.payload.len();
        let size = u32::try_from(payload_len).map_err(|_| Error::PayloadTooLarge(payload_len))?;

        dst.reserve(item.size());

        dst.put_u8(PRODUCE_WIRE_ID);
        dst.put_u16(topic_size);
        dst.put(item.header.topic);
        dst.put_u32(item.header.seq);
        dst.put_u8(item.header.compression as u8);
        dst.put_u64(item.header.key);
        dst.put_u32(size);
        dst.put(item.payload);

        Ok(())
    }
}

impl Decoder for Codec {
    type Item = Ack;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        // Check the wire ID before waiting on the rest of the frame.
        if src[0] != ACK_WIRE_ID {
            return Err(Error::WireId(src[0]));
        }

        if src.len() < ACK_LEN {
            return Ok(None);
        }

        src.advance(1);
        let seq = src.get_u32();
        let status = Status::try_from(src.get_u8()).map_err(Error::Status)?;

        Ok(Some(Ack { seq, status }))
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Header,
    Payload(Option<Header>),
}

/// Broker side codec: decodes produce frames, encodes acks.
#[derive(Debug, Default)]
pub struct BrokerCodec {
    /// The current state of the decoder.
    state: State,
}

impl BrokerCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for BrokerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Header => {
                    if src.is_empty() {
                        return Ok(None);
                    }

                    let wire_id = src[0];
                    if wire_id != PRODUCE_WIRE_ID {
                        return Err(Error::WireId(wire_id));
                    }

                    if src.len() < 3 {
                        return Ok(None);
                    }

                    let topic_size = u16::from_be_bytes([src[1], src[2]]) as usize;

                    // Wait for the whole header, topic included.
                    if src.len() < PRODUCE_HEADER_LEN + topic_size {
                        return Ok(None);
                    }

                    src.advance(3);
                    let topic = src.split_to(topic_size).freeze();
                    let seq = src.get_u32();
                    let compression =
                        CompressionType::try_from(src.get_u8()).map_err(Error::Compression)?;
                    let key = src.get_u64();
                    let size = src.get_u32() as usize;

                    self.state =
                        State::Payload(Some(Header { topic, seq, compression, key, size }));
                }
                State::Payload(ref mut header) => {
                    let size = header.as_ref().map(|h| h.size).unwrap_or_default();
                    if src.len() < size {
                        return Ok(None);
                    }

                    let Some(header) = header.take() else {
                        self.state = State::Header;
                        continue;
                    };

                    let payload = src.split_to(size).freeze();
                    self.state = State::Header;

                    return Ok(Some(Message { header, payload }));
                }
            }
        }
    }
}

impl Encoder<Ack> for BrokerCodec {
    type Error = Error;

    fn encode(&mut self, item: Ack, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(ACK_LEN);
        dst.put_u8(ACK_WIRE_ID);
        dst.put_u32(item.seq);
        dst.put_u8(item.status as u8);

        Ok(())
    }
}
