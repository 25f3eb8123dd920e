use std::{fs, path::Path, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::{debug, warn};

use capa_common::{constants::MiB, millis};
use capa_wire::compression::CompressionType;

/// The default flush grace period on close.
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
/// The default number of completions drained per slot per poll.
const DEFAULT_POLL_BUDGET: usize = 1024;
/// The default number of records a slot's broker client may hold.
const DEFAULT_QUEUE_SIZE: usize = 100_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue { key: String, value: String, reason: String },
    #[error("Malformed line {line}: {content:?}")]
    Malformed { line: usize, content: String },
}

/// Options of the connection pool itself.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// How long [`close`](crate::ConnectionPool::close) waits for outstanding records.
    pub flush_timeout: Duration,
    /// The maximum number of completions drained per slot by one
    /// [`poll`](crate::ConnectionPool::poll). Values below 1 are treated as 1.
    pub poll_budget: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self { flush_timeout: DEFAULT_FLUSH_TIMEOUT, poll_budget: DEFAULT_POLL_BUDGET }
    }
}

impl PoolOptions {
    /// Sets the flush grace period used on close.
    pub fn flush_timeout(mut self, flush_timeout: Duration) -> Self {
        self.flush_timeout = flush_timeout;
        self
    }

    /// Sets the maximum number of completions drained per slot per poll. Clamped to at
    /// least 1.
    pub fn poll_budget(mut self, poll_budget: usize) -> Self {
        self.poll_budget = poll_budget.max(1);
        self
    }
}

/// Options of the TCP broker client, applied to every slot.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    /// Broker endpoints as `host:port`. Slot `i` connects to `brokers[i % brokers.len()]`.
    pub brokers: Vec<String>,
    /// The topic packets are published to.
    pub topic: String,
    /// The maximum number of records a slot's client holds before refusing more.
    pub queue_size: usize,
    /// How long written records may sit in the write buffer before being flushed. If this
    /// is `None`, the connection is flushed after every write burst.
    pub linger: Option<Duration>,
    /// Write buffer size in bytes that triggers a flush regardless of the linger.
    pub batch_size: usize,
    pub compression: CompressionType,
    /// Codec specific level. `None` uses the codec default.
    pub compression_level: Option<i32>,
    /// Payloads smaller than this are sent uncompressed.
    pub min_compress_size: usize,
    /// Records larger than this are refused on enqueue.
    pub max_message_size: usize,
    /// Records not acknowledged within this time are failed.
    pub message_timeout: Duration,
    /// How many times an unacknowledged record is resent after a connection loss.
    pub max_retries: u32,
    /// The initial reconnect backoff, doubled on every failed attempt.
    pub retry_backoff: Duration,
    /// Consecutive failed reconnects before the client gives up. `None` retries forever.
    pub reconnect_attempts: Option<usize>,
    pub connect_timeout: Duration,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            topic: String::new(),
            queue_size: DEFAULT_QUEUE_SIZE,
            linger: Some(Duration::from_millis(5)),
            batch_size: 64 * 1024,
            compression: CompressionType::None,
            compression_level: None,
            min_compress_size: 512,
            max_message_size: MiB as usize,
            message_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_millis(100),
            reconnect_attempts: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ProducerOptions {
    /// Creates options publishing to `topic` on the given brokers.
    pub fn new<S>(brokers: impl IntoIterator<Item = S>, topic: impl Into<String>) -> Self
    where
        S: Into<String>,
    {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            topic: topic.into(),
            ..Default::default()
        }
    }

    /// Sets the per-slot queue size.
    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    /// Sets the linger. `None` flushes after every write burst.
    pub fn linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Enables payload compression with the codec's default level.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    pub fn min_compress_size(mut self, min_compress_size: usize) -> Self {
        self.min_compress_size = min_compress_size;
        self
    }

    pub fn max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn message_timeout(mut self, message_timeout: Duration) -> Self {
        self.message_timeout = message_timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn reconnect_attempts(mut self, reconnect_attempts: usize) -> Self {
        self.reconnect_attempts = Some(reconnect_attempts);
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// Complete publisher configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pool: PoolOptions,
    pub producer: ProducerOptions,
}

impl Config {
    /// Loads a properties file, see [`Config::from_properties`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading producer configuration");
        Self::from_properties(&fs::read_to_string(path)?)
    }

    /// Parses `key = value` lines using broker-client property names, e.g.
    ///
    /// ```text
    /// bootstrap.servers = 10.0.0.1:9092,10.0.0.2:9092
    /// topic = pcap
    /// queue.buffering.max.messages = 200000
    /// linger.ms = 10
    /// compression.codec = lz4
    /// ```
    ///
    /// Blank lines and lines starting with `#` are skipped. Unknown keys are logged and
    /// ignored.
    pub fn from_properties(input: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (idx, raw) in input.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Malformed { line: idx + 1, content: raw.to_string() });
            };

            config.set(key.trim(), value.trim())?;
        }

        Ok(config)
    }

    /// Applies a single property.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let producer = &mut self.producer;

        match key {
            "bootstrap.servers" | "metadata.broker.list" => {
                producer.brokers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            "topic" => producer.topic = value.to_string(),
            "queue.buffering.max.messages" => producer.queue_size = parse(key, value)?,
            "queue.buffering.max.ms" | "linger.ms" => {
                let ms: u64 = parse(key, value)?;
                producer.linger = (ms > 0).then(|| millis(ms));
            }
            "batch.size" => producer.batch_size = parse(key, value)?,
            "compression.codec" | "compression.type" => producer.compression = parse(key, value)?,
            "compression.level" => {
                let level: i32 = parse(key, value)?;
                producer.compression_level = (level >= 0).then_some(level);
            }
            "compression.min.bytes" => producer.min_compress_size = parse(key, value)?,
            "message.max.bytes" => producer.max_message_size = parse(key, value)?,
            "message.timeout.ms" => producer.message_timeout = millis(parse(key, value)?),
            "message.send.max.retries" | "retries" => producer.max_retries = parse(key, value)?,
            "retry.backoff.ms" => producer.retry_backoff = millis(parse(key, value)?),
            "reconnect.max.attempts" => {
                let attempts: usize = parse(key, value)?;
                producer.reconnect_attempts = (attempts > 0).then_some(attempts);
            }
            "socket.connection.setup.timeout.ms" => {
                producer.connect_timeout = millis(parse(key, value)?)
            }
            "pool.flush.timeout.ms" => self.pool.flush_timeout = millis(parse(key, value)?),
            "pool.poll.budget" => self.pool.poll_budget = parse::<usize>(key, value)?.max(1),
            _ => warn!(key, value, "Ignoring unknown producer property"),
        }

        Ok(())
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}
