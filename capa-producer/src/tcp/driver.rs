use std::{
    collections::VecDeque,
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{interval, Interval, MissedTickBehavior},
};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

use capa_wire::{
    compression::{CompressionType, Compressor},
    produce,
};

use crate::{
    backoff::ExponentialBackoff,
    client::{DeliveryError, DeliverySink, Record},
    ProducerOptions,
};

/// How often held records are checked against the message timeout.
const EXPIRY_INTERVAL: Duration = Duration::from_millis(100);

type ConnectTask = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

pub(super) enum Command {
    Send(Pending),
    Flush,
}

/// A record held by the driver.
pub(super) struct Pending {
    record: Record,
    enqueued: Instant,
    /// Number of times the record was requeued after losing its connection.
    attempts: u32,
    /// Sequence number on the connection it was last written to.
    wire_seq: u32,
}

impl Pending {
    pub(super) fn new(record: Record) -> Self {
        Self { record, enqueued: Instant::now(), attempts: 0, wire_seq: 0 }
    }

    pub(super) fn into_record(self) -> Record {
        self.record
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        self.enqueued.elapsed() >= timeout
    }
}

enum ConnectionState {
    Active { channel: Framed<TcpStream, produce::Codec> },
    Inactive { backoff: ExponentialBackoff },
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error(transparent)]
    Wire(#[from] produce::Error),
    #[error("Connection closed by broker")]
    Closed,
    #[error("Acknowledgement {0} without an outstanding message")]
    UnexpectedAck(u32),
    #[error("Acknowledgement out of order: expected {expected}, got {got}")]
    OutOfOrder { expected: u32, got: u32 },
}

/// Drives one broker connection, represented as a [`Future`].
///
/// Records arrive from the [`TcpProducer`](super::TcpProducer) handle and are written in
/// order. The broker acknowledges every message in the order it was written, so
/// acknowledgements are matched against the oldest unacknowledged record. When the
/// connection is lost, unacknowledged records are put back at the front of the backlog
/// and resent on the next connection.
#[must_use = "This future must be spawned"]
pub(super) struct ProducerDriver {
    broker: String,
    options: Arc<ProducerOptions>,
    topic: Bytes,
    compressor: Option<Compressor>,
    from_producer: mpsc::UnboundedReceiver<Command>,
    sink: DeliverySink,
    conn: ConnectionState,
    /// The in-progress connection attempt, if any.
    conn_task: Option<ConnectTask>,
    /// Records waiting to be written, oldest first.
    backlog: VecDeque<Pending>,
    /// Records written on the current connection and not acknowledged yet, oldest first.
    unacked: VecDeque<Pending>,
    next_seq: u32,
    linger: Option<Interval>,
    expiry: Interval,
    flush_requested: bool,
}

impl ProducerDriver {
    /// Creates the driver and starts connecting right away. Must be called within a Tokio
    /// runtime context.
    pub(super) fn new(
        broker: String,
        options: Arc<ProducerOptions>,
        from_producer: mpsc::UnboundedReceiver<Command>,
        sink: DeliverySink,
    ) -> Self {
        let compressor = (options.compression != CompressionType::None)
            .then(|| Compressor::new(options.compression, options.compression_level));

        let linger = options.linger.map(|linger| {
            let mut linger = interval(linger);
            linger.set_missed_tick_behavior(MissedTickBehavior::Delay);
            linger
        });

        let mut expiry = interval(EXPIRY_INTERVAL);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let conn_task = Some(connect(broker.clone(), options.connect_timeout));

        Self {
            topic: Bytes::from(options.topic.clone()),
            conn: ConnectionState::Inactive { backoff: ExponentialBackoff::from(&*options) },
            broker,
            options,
            compressor,
            from_producer,
            sink,
            conn_task,
            backlog: VecDeque::new(),
            unacked: VecDeque::new(),
            next_seq: 0,
            linger,
            expiry,
            flush_requested: false,
        }
    }

    #[inline]
    fn fail(&self, pending: Pending, error: DeliveryError) {
        self.sink.report(pending.record, Err(error));
    }

    /// Fails every held record, oldest first.
    fn fail_all(&mut self, error: DeliveryError) {
        let held = self.unacked.len() + self.backlog.len();
        if held > 0 {
            warn!(held, err = %error, "Failing held records");
        }

        while let Some(pending) = self.unacked.pop_front() {
            self.fail(pending, error.clone());
        }

        while let Some(pending) = self.backlog.pop_front() {
            self.fail(pending, error.clone());
        }
    }

    /// Stops accepting commands and fails every held record, including those still queued
    /// in the command channel.
    fn shutdown(&mut self, error: DeliveryError) {
        self.from_producer.close();
        while let Ok(command) = self.from_producer.try_recv() {
            if let Command::Send(pending) = command {
                self.backlog.push_back(pending);
            }
        }

        self.fail_all(error);
    }

    /// Fails backlog records that exceeded the message timeout. Resets the connection if
    /// the oldest unacknowledged record has, since the broker stopped responding.
    fn expire(&mut self) {
        let timeout = self.options.message_timeout;

        while self.backlog.front().is_some_and(|pending| pending.is_expired(timeout)) {
            if let Some(pending) = self.backlog.pop_front() {
                self.fail(pending, DeliveryError::TimedOut);
            }
        }

        if self.unacked.front().is_some_and(|pending| pending.is_expired(timeout)) {
            let unacked = self.unacked.len();
            warn!(unacked, "Broker stopped acknowledging, resetting connection");
            self.reset_connection();
        }
    }

    /// Drops the current connection and puts unacknowledged records back in front of the
    /// backlog. Records out of retries or time are failed instead.
    fn reset_connection(&mut self) {
        let timeout = self.options.message_timeout;
        let mut requeue = VecDeque::with_capacity(self.unacked.len());

        while let Some(mut pending) = self.unacked.pop_front() {
            if pending.is_expired(timeout) {
                self.fail(pending, DeliveryError::TimedOut);
            } else if pending.attempts >= self.options.max_retries {
                self.fail(pending, DeliveryError::Disconnected);
            } else {
                pending.attempts += 1;
                requeue.push_back(pending);
            }
        }

        debug!(requeued = requeue.len(), "Requeueing unacknowledged records");
        while let Some(pending) = requeue.pop_back() {
            self.backlog.push_front(pending);
        }

        self.conn = ConnectionState::Inactive { backoff: ExponentialBackoff::from(&*self.options) };
        self.conn_task = None;
    }

    /// Writes the backlog, flushes when due and reads acknowledgements. Returns `true` if
    /// any progress was made.
    fn poll_active(&mut self, cx: &mut Context<'_>) -> Result<bool, ConnectionError> {
        let ConnectionState::Active { ref mut channel } = self.conn else {
            return Ok(false);
        };

        let mut progress = false;

        while !self.backlog.is_empty() {
            match channel.poll_ready_unpin(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Err(e.into()),
                Poll::Pending => break,
            }

            let Some(mut pending) = self.backlog.pop_front() else {
                break;
            };

            let seq = self.next_seq;
            let compressor = self.compressor.as_ref();
            let min_size = self.options.min_compress_size;
            let msg = match encode(&self.topic, seq, &pending.record, compressor, min_size) {
                Ok(msg) => msg,
                Err(e) => {
                    let error = DeliveryError::Compression(e.to_string());
                    self.sink.report(pending.record, Err(error));
                    progress = true;
                    continue;
                }
            };

            if let Err(e) = channel.start_send_unpin(msg) {
                self.backlog.push_front(pending);
                return Err(e.into());
            }

            trace!(seq, key = pending.record.key(), "Wrote message");
            pending.wire_seq = seq;
            self.next_seq = seq.wrapping_add(1);
            self.unacked.push_back(pending);
            progress = true;
        }

        if channel.write_buffer().is_empty() {
            self.flush_requested = false;
        } else {
            let linger_elapsed = match self.linger {
                Some(ref mut linger) => linger.poll_tick(cx).is_ready(),
                None => true,
            };

            let batch_full = channel.write_buffer().len() >= self.options.batch_size;
            if self.flush_requested || linger_elapsed || batch_full {
                match channel.poll_flush_unpin(cx) {
                    Poll::Ready(Ok(())) => {
                        trace!(unacked = self.unacked.len(), "Flushed connection");
                        self.flush_requested = false;
                    }
                    Poll::Ready(Err(e)) => return Err(e.into()),
                    Poll::Pending => {}
                }
            }
        }

        loop {
            match channel.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(ack))) => {
                    let Some(pending) = self.unacked.pop_front() else {
                        return Err(ConnectionError::UnexpectedAck(ack.seq()));
                    };

                    if pending.wire_seq != ack.seq() {
                        let expected = pending.wire_seq;
                        self.unacked.push_front(pending);
                        return Err(ConnectionError::OutOfOrder { expected, got: ack.seq() });
                    }

                    let result = if ack.status().is_ok() {
                        Ok(())
                    } else {
                        debug!(seq = ack.seq(), status = %ack.status(), "Broker rejected message");
                        Err(DeliveryError::Rejected(ack.status()))
                    };

                    self.sink.report(pending.record, result);
                    progress = true;
                }
                Poll::Ready(Some(Err(e))) => return Err(e.into()),
                Poll::Ready(None) => return Err(ConnectionError::Closed),
                Poll::Pending => break,
            }
        }

        Ok(progress)
    }
}

impl Future for ProducerDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            match this.from_producer.poll_recv(cx) {
                Poll::Ready(Some(Command::Send(pending))) => {
                    this.backlog.push_back(pending);
                    continue;
                }
                Poll::Ready(Some(Command::Flush)) => {
                    this.flush_requested = true;
                    continue;
                }
                Poll::Ready(None) => {
                    debug!("Producer handle dropped, shutting down");
                    this.shutdown(DeliveryError::Shutdown);
                    return Poll::Ready(());
                }
                Poll::Pending => {}
            }

            if this.expiry.poll_tick(cx).is_ready() {
                this.expire();
            }

            if let Some(task) = this.conn_task.as_mut() {
                match task.poll_unpin(cx) {
                    Poll::Ready(Ok(stream)) => {
                        info!("Connected to broker");
                        this.conn_task = None;
                        this.next_seq = 0;
                        let channel = Framed::new(stream, produce::Codec::new());
                        this.conn = ConnectionState::Active { channel };
                        continue;
                    }
                    Poll::Ready(Err(e)) => {
                        warn!(err = ?e, "Failed to connect to broker");
                        this.conn_task = None;
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            if let ConnectionState::Inactive { ref mut backoff } = this.conn {
                match backoff.poll_next_unpin(cx) {
                    Poll::Ready(Some(delay)) => {
                        debug!(?delay, "Reconnecting to broker");
                        let timeout = this.options.connect_timeout;
                        this.conn_task = Some(connect(this.broker.clone(), timeout));
                        continue;
                    }
                    Poll::Ready(None) => {
                        error!("Exceeded maximum reconnect attempts, giving up");
                        this.shutdown(DeliveryError::Disconnected);
                        return Poll::Ready(());
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            match this.poll_active(cx) {
                Ok(true) => continue,
                Ok(false) => return Poll::Pending,
                Err(e) => {
                    warn!(err = %e, unacked = this.unacked.len(), "Broker connection failed");
                    this.reset_connection();
                }
            }
        }
    }
}

fn connect(broker: String, timeout: Duration) -> ConnectTask {
    Box::pin(async move {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(broker.as_str()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        stream.set_nodelay(true)?;
        Ok(stream)
    })
}

/// Builds the wire message of a record, compressing payloads of at least
/// `min_compress_size` bytes if a compressor is configured.
fn encode(
    topic: &Bytes,
    seq: u32,
    record: &Record,
    compressor: Option<&Compressor>,
    min_compress_size: usize,
) -> io::Result<produce::Message> {
    let payload = record.buffer().data().clone();

    match compressor {
        Some(compressor) if payload.len() >= min_compress_size => {
            let compressed = compressor.compress(&payload)?;
            Ok(produce::Message::with_compression(
                seq,
                topic.clone(),
                record.key(),
                compressed,
                compressor.compression_type(),
            ))
        }
        _ => Ok(produce::Message::new(seq, topic.clone(), record.key(), payload)),
    }
}
