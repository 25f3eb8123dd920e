use std::time::Duration;

use capa_producer::{
    mock::MockBroker,
    tcp::{ConnectError, TcpConnector},
    ConnectionPool, DeliveryError, PoolError, PoolOptions, PoolStats, ProducerOptions,
};
use capa_wire::{
    compression::{decompress, CompressionType},
    produce::Status,
};
use tokio::{task::block_in_place, time::sleep};

use crate::packets;

const TOPIC: &str = "pcap";

fn options(broker: &MockBroker) -> ProducerOptions {
    ProducerOptions::new([broker.local_addr().to_string()], TOPIC)
        .linger(Some(Duration::from_millis(1)))
        .retry_backoff(Duration::from_millis(10))
}

fn open(
    slots: usize,
    options: ProducerOptions,
    flush_timeout: Duration,
) -> ConnectionPool<TcpConnector> {
    let connector = TcpConnector::new(options).unwrap();
    let pool_options = PoolOptions::default().flush_timeout(flush_timeout);
    ConnectionPool::open(slots, connector, pool_options).unwrap()
}

/// Polls until `done` holds for the pool stats, failing after five seconds.
async fn poll_until(
    pool: &ConnectionPool<TcpConnector>,
    done: impl Fn(&PoolStats) -> bool,
) -> PoolStats {
    let wait = async {
        loop {
            pool.poll().unwrap();
            let stats = pool.stats().unwrap();
            if done(&stats) {
                return stats;
            }

            sleep(Duration::from_millis(5)).await;
        }
    };

    tokio::time::timeout(Duration::from_secs(5), wait).await.expect("timed out polling the pool")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn packets_reach_the_broker() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MockBroker::bind("127.0.0.1:0").await.unwrap();
    let pool = open(2, options(&broker), Duration::from_secs(1));

    let first = packets(100, 128, 1_000);
    let second = packets(100, 128, 2_000);
    assert_eq!(pool.send(&first, 0).unwrap(), 100);
    assert_eq!(pool.send(&second, 1).unwrap(), 100);

    let stats = poll_until(&pool, |stats| stats.delivered == 200).await;
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.bytes_delivered, 200 * 128);
    assert_eq!(stats.queue_depth, 0);
    assert!(first.iter().chain(&second).all(|packet| packet.ref_count() == 1));

    let received = broker.received();
    assert_eq!(received.len(), 200);
    assert!(received.iter().all(|msg| msg.topic() == TOPIC.as_bytes()));

    // Each connection carries one slot, in order.
    let mut first_keys: Vec<u64> =
        received.iter().map(|msg| msg.key()).filter(|key| *key < 2_000).collect();
    let sorted = {
        let mut keys = first_keys.clone();
        keys.sort_unstable();
        keys
    };
    assert_eq!(first_keys, sorted);
    first_keys.dedup();
    assert_eq!(first_keys.len(), 100);

    let payload = received.iter().find(|msg| msg.key() == 1_005).unwrap().payload().clone();
    assert_eq!(&payload[..], &first[5][..]);

    let stats = block_in_place(|| pool.close()).unwrap();
    assert_eq!(stats.delivered, 200);
    assert_eq!(broker.connections(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn three_packets_end_to_end() {
    let broker = MockBroker::bind("127.0.0.1:0").await.unwrap();
    let pool = open(2, options(&broker), Duration::from_secs(1));

    assert_eq!(pool.send(&packets(3, 64, 0), 0).unwrap(), 3);
    let stats = poll_until(&pool, |stats| stats.completed() == 3).await;
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.delivered, 3);

    let stats = block_in_place(|| pool.close()).unwrap();
    assert_eq!(stats.failed, 0);
    assert_eq!(broker.received_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_bursts_are_written_in_order() {
    let broker = MockBroker::bind("127.0.0.1:0").await.unwrap();
    let pool = open(1, options(&broker).batch_size(1024 * 1024), Duration::from_secs(1));

    // Far more than the write buffer's backpressure boundary.
    let burst = packets(500, 4096, 0);
    assert_eq!(pool.send(&burst, 0).unwrap(), 500);

    let stats = poll_until(&pool, |stats| stats.delivered == 500).await;
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.bytes_delivered, 500 * 4096);

    let keys: Vec<u64> = broker.received().iter().map(|msg| msg.key()).collect();
    assert_eq!(keys, (0..500).collect::<Vec<u64>>());

    block_in_place(|| pool.close()).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn payloads_are_compressed() {
    let broker = MockBroker::bind("127.0.0.1:0").await.unwrap();
    let options = options(&broker).compression(CompressionType::Lz4).min_compress_size(256);
    let pool = open(1, options, Duration::from_secs(1));

    let small = packets(1, 64, 0);
    let large = packets(1, 4096, 1);
    pool.send(&small, 0).unwrap();
    pool.send(&large, 0).unwrap();

    poll_until(&pool, |stats| stats.delivered == 2).await;

    let received = broker.received();
    assert_eq!(received[0].compression(), CompressionType::None);
    assert_eq!(&received[0].payload()[..], &small[0][..]);

    assert_eq!(received[1].compression(), CompressionType::Lz4);
    let restored = decompress(CompressionType::Lz4, received[1].payload()).unwrap();
    assert_eq!(&restored[..], &large[0][..]);

    block_in_place(|| pool.close()).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn acknowledged_packets_hold_capacity_until_polled() {
    let broker = MockBroker::bind("127.0.0.1:0").await.unwrap();
    let pool = open(1, options(&broker).queue_size(4), Duration::from_secs(1));

    let mut accepted = 0;
    for round in 0..10 {
        accepted += pool.send(&packets(4, 32, round * 4), 0).unwrap();
        sleep(Duration::from_millis(10)).await;
    }

    // Wait for the broker to acknowledge everything it was sent.
    let wait = async {
        while broker.received_count() < 4 {
            sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(accepted, 4);
    assert_eq!(pool.send(&packets(1, 32, 100), 0).unwrap(), 0);
    assert_eq!(pool.stats().unwrap().queue_depth, 4);

    poll_until(&pool, |stats| stats.delivered == 4).await;
    assert_eq!(pool.send(&packets(4, 32, 200), 0).unwrap(), 4);

    block_in_place(|| pool.close()).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broker_rejections_are_failures() {
    let broker = MockBroker::bind("127.0.0.1:0").await.unwrap();
    broker.reject_topic(TOPIC);
    let pool = open(1, options(&broker), Duration::from_secs(1));

    pool.send(&packets(10, 32, 0), 0).unwrap();

    let mut results = Vec::new();
    let wait = async {
        while results.len() < 10 {
            pool.poll_with(|report| results.push(report.result.clone())).unwrap();
            sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap();

    assert!(results.iter().all(|r| *r == Err(DeliveryError::Rejected(Status::UnknownTopic))));

    let stats = pool.stats().unwrap();
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.failed, 10);

    block_in_place(|| pool.close()).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_reconnects_after_connection_loss() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MockBroker::bind("127.0.0.1:0").await.unwrap();
    let pool = open(1, options(&broker), Duration::from_secs(1));

    pool.send(&packets(10, 32, 0), 0).unwrap();
    poll_until(&pool, |stats| stats.delivered == 10).await;

    broker.kick_connections();
    sleep(Duration::from_millis(20)).await;

    pool.send(&packets(10, 32, 10), 0).unwrap();
    let stats = poll_until(&pool, |stats| stats.delivered == 20).await;
    assert_eq!(stats.failed, 0);
    assert!(broker.connections() >= 2);

    block_in_place(|| pool.close()).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unacknowledged_packets_time_out() {
    let broker = MockBroker::bind("127.0.0.1:0").await.unwrap();
    broker.set_silent(true);

    let options = options(&broker).message_timeout(Duration::from_millis(200)).max_retries(0);
    let pool = open(1, options, Duration::from_secs(1));

    pool.send(&packets(5, 32, 0), 0).unwrap();
    let stats = poll_until(&pool, |stats| stats.failed == 5).await;
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(broker.received_count(), 5);

    block_in_place(|| pool.close()).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_broker_fails_packets() {
    // Reserve a port nobody listens on.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let options = ProducerOptions::new([addr.to_string()], TOPIC)
        .retry_backoff(Duration::from_millis(5))
        .reconnect_attempts(2);
    let pool = open(1, options, Duration::from_millis(100));

    pool.send(&packets(5, 32, 0), 0).unwrap();
    let stats = poll_until(&pool, |stats| stats.failed == 5).await;
    assert_eq!(stats.delivered, 0);

    // The driver gave up, so the next send recreates the client.
    sleep(Duration::from_millis(20)).await;
    pool.send(&packets(1, 32, 5), 0).unwrap();
    assert_eq!(pool.stats().unwrap().reconnects, 1);

    let stats = block_in_place(|| pool.close()).unwrap();
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.queue_depth, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_abandons_after_flush_timeout() {
    let broker = MockBroker::bind("127.0.0.1:0").await.unwrap();
    broker.set_silent(true);
    let pool = open(1, options(&broker), Duration::from_millis(100));

    let batch = packets(8, 32, 0);
    pool.send(&batch, 0).unwrap();

    let stats = block_in_place(|| pool.close()).unwrap();
    assert_eq!(stats.submitted, 8);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.failed, 8);
    assert_eq!(stats.queue_depth, 0);
    assert!(matches!(pool.send(&batch, 0), Err(PoolError::NotInitialized)));
}

#[tokio::test]
async fn invalid_broker_fails_open() {
    let connector = TcpConnector::new(ProducerOptions::new(["no-port"], TOPIC)).unwrap();
    let err = ConnectionPool::open(2, connector, PoolOptions::default()).unwrap_err();

    let PoolError::Init { slot, source } = err else {
        panic!("expected an init error");
    };
    assert_eq!(slot, 0);
    assert!(matches!(
        source.downcast_ref::<ConnectError>(),
        Some(ConnectError::InvalidBroker(broker)) if broker == "no-port"
    ));
}

#[test]
fn connector_can_use_an_explicit_runtime() {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
    let connector = TcpConnector::with_handle(
        ProducerOptions::new(["127.0.0.1:1"], TOPIC).reconnect_attempts(1),
        runtime.handle().clone(),
    );

    let options = PoolOptions::default().flush_timeout(Duration::from_millis(10));
    let pool = ConnectionPool::open(1, connector, options).unwrap();
    assert_eq!(pool.len(), 1);

    let stats = pool.close().unwrap();
    assert_eq!(stats.submitted, 0);
}
