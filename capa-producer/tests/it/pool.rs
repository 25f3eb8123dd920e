use std::{sync::Arc, thread, time::Duration};

use capa_producer::{mock::MockConnector, ConnectionPool, DeliveryError, PoolError, PoolOptions};

use crate::packets;

fn open(slots: usize, connector: MockConnector) -> ConnectionPool<MockConnector> {
    let options = PoolOptions::default().flush_timeout(Duration::from_millis(50));
    ConnectionPool::open(slots, connector, options).unwrap()
}

#[test]
fn open_needs_slots() {
    let err =
        ConnectionPool::open(0, MockConnector::auto_ack(), PoolOptions::default()).unwrap_err();
    assert!(matches!(err, PoolError::NoSlots));
}

#[test]
fn open_is_all_or_nothing() {
    let _ = tracing_subscriber::fmt::try_init();

    let connector = MockConnector::new(16);
    connector.refuse(2, true);

    let err = ConnectionPool::open(4, connector.clone(), PoolOptions::default()).unwrap_err();
    assert!(matches!(err, PoolError::Init { slot: 2, .. }));

    // The slots that did come up were torn down again.
    assert_eq!(connector.connects(), 2);
    assert!(connector.queue(0).unwrap().is_closed());
    assert!(connector.queue(1).unwrap().is_closed());
    assert!(connector.queue(3).is_none());
}

#[test]
fn batch_is_delivered_and_released() {
    let _ = tracing_subscriber::fmt::try_init();

    let pool = open(4, MockConnector::auto_ack());
    let batch = packets(10, 100, 0);

    assert_eq!(pool.send(&batch, 1).unwrap(), 10);
    assert!(batch.iter().all(|packet| packet.ref_count() == 2));

    let stats = pool.stats().unwrap();
    assert_eq!(stats.slots, 4);
    assert_eq!(stats.submitted, 10);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.queue_depth, 10);

    assert_eq!(pool.poll().unwrap(), 10);
    assert!(batch.iter().all(|packet| packet.ref_count() == 1));

    let stats = pool.stats().unwrap();
    assert_eq!(stats.delivered, 10);
    assert_eq!(stats.bytes_delivered, 1000);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.queue_depth, 0);

    let slot = pool.slot_stats(1).unwrap();
    assert_eq!(slot.delivered, 10);
    assert_eq!(pool.slot_stats(0).unwrap().submitted, 0);

    assert_eq!(pool.poll().unwrap(), 0);
}

#[test]
fn empty_batch_is_a_no_op() {
    let pool = open(1, MockConnector::auto_ack());
    assert_eq!(pool.send(&[], 0).unwrap(), 0);
    assert_eq!(pool.stats().unwrap().submitted, 0);
}

#[test]
fn invalid_slot_consumes_nothing() {
    let pool = open(2, MockConnector::auto_ack());
    let batch = packets(3, 10, 0);

    let err = pool.send(&batch, 2).unwrap_err();
    assert!(matches!(err, PoolError::InvalidSlot { slot: 2, slots: 2 }));
    assert!(batch.iter().all(|packet| packet.ref_count() == 1));

    assert!(matches!(pool.slot_stats(7), Err(PoolError::InvalidSlot { slot: 7, .. })));
    assert_eq!(pool.stats().unwrap().submitted, 0);
}

#[test]
fn full_queue_stops_the_batch() {
    let _ = tracing_subscriber::fmt::try_init();

    let connector = MockConnector::new(3);
    let pool = open(1, connector.clone());
    let batch = packets(5, 10, 0);

    assert_eq!(pool.send(&batch, 0).unwrap(), 3);

    // The unconsumed tail is untouched.
    assert_eq!(batch[3].ref_count(), 1);
    assert_eq!(batch[4].ref_count(), 1);

    let stats = pool.stats().unwrap();
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.backpressure, 1);
    assert_eq!(stats.failed, 0);

    assert_eq!(pool.send(&batch[3..], 0).unwrap(), 0);
    assert_eq!(pool.stats().unwrap().backpressure, 2);

    // Completed records keep their capacity until they are polled.
    let queue = connector.queue(0).unwrap();
    assert_eq!(queue.complete(3), 3);
    assert_eq!(pool.send(&batch[3..], 0).unwrap(), 0);
    assert_eq!(pool.poll().unwrap(), 3);

    assert_eq!(pool.send(&batch[3..], 0).unwrap(), 2);
    assert_eq!(pool.stats().unwrap().submitted, 5);
}

#[test]
fn unpolled_completions_hold_capacity() {
    let connector = MockConnector::new(2);
    let pool = open(1, connector.clone());
    let queue = connector.queue(0).unwrap();

    let mut accepted = 0;
    for round in 0..5 {
        accepted += pool.send(&packets(2, 10, round * 2), 0).unwrap();
        queue.complete_all();
    }

    assert_eq!(accepted, 2);
    let stats = pool.stats().unwrap();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.queue_depth, 2);
    assert_eq!(stats.backpressure, 4);

    assert_eq!(pool.poll().unwrap(), 2);
    assert_eq!(pool.send(&packets(2, 10, 10), 0).unwrap(), 2);
}

#[test]
fn refused_packets_count_as_failed() {
    let connector = MockConnector::auto_ack().with_max_message_size(50);
    let pool = open(1, connector);

    let mut batch = packets(2, 10, 0);
    batch.insert(1, packets(1, 100, 10).remove(0));

    assert_eq!(pool.send(&batch, 0).unwrap(), 3);
    assert_eq!(batch[1].ref_count(), 1);

    pool.poll().unwrap();
    let stats = pool.stats().unwrap();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.queue_depth, 0);
}

#[test]
fn asynchronous_failures_are_counted() {
    let connector = MockConnector::new(16);
    let pool = open(1, connector.clone());
    let batch = packets(4, 10, 0);

    assert_eq!(pool.send(&batch, 0).unwrap(), 4);

    let queue = connector.queue(0).unwrap();
    queue.complete(1);
    queue.fail(2, DeliveryError::TimedOut);
    queue.complete(1);

    let mut results = Vec::new();
    pool.poll_with(|report| results.push(report.result.clone())).unwrap();

    assert_eq!(
        results,
        vec![Ok(()), Err(DeliveryError::TimedOut), Err(DeliveryError::TimedOut), Ok(())]
    );

    let stats = pool.stats().unwrap();
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.completed(), stats.submitted);
}

#[test]
fn closed_client_is_recreated() {
    let _ = tracing_subscriber::fmt::try_init();

    let connector = MockConnector::new(16);
    let pool = open(2, connector.clone());
    let batch = packets(3, 10, 0);

    assert_eq!(pool.send(&batch, 1).unwrap(), 3);
    let old = connector.queue(1).unwrap();
    old.close();

    // The first packet hits the closed client, the rest go to its replacement.
    assert_eq!(pool.send(&batch, 1).unwrap(), 3);
    assert_eq!(connector.connects(), 3);

    let new = connector.queue(1).unwrap();
    assert!(!new.is_closed());
    assert_eq!(new.len(), 2);

    new.complete_all();
    pool.poll().unwrap();

    let stats = pool.slot_stats(1).unwrap();
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.submitted, 5);
    assert_eq!(stats.delivered, 2);
    // One refused by the closed client, three abandoned when it was dropped.
    assert_eq!(stats.failed, 4);
    assert_eq!(stats.queue_depth, 0);
}

#[test]
fn failed_reconnect_keeps_consuming() {
    let connector = MockConnector::new(16);
    let pool = open(1, connector.clone());

    connector.queue(0).unwrap().close();
    connector.refuse(0, true);

    let batch = packets(3, 10, 0);
    assert_eq!(pool.send(&batch, 0).unwrap(), 3);

    let stats = pool.stats().unwrap();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.reconnects, 0);
    assert!(batch.iter().all(|packet| packet.ref_count() == 1));

    connector.refuse(0, false);
    assert_eq!(pool.send(&batch, 0).unwrap(), 3);
    assert_eq!(pool.stats().unwrap().reconnects, 1);
    assert_eq!(pool.stats().unwrap().submitted, 2);
}

#[test]
fn reports_keep_submission_order() {
    let connector = MockConnector::new(1024);
    let pool = open(2, connector.clone());

    for round in 0..4 {
        for slot in 0..2 {
            let base = (round * 100 + slot * 1000) as u64;
            assert_eq!(pool.send(&packets(25, 16, base), slot).unwrap(), 25);
        }
    }

    connector.queue(0).unwrap().complete_all();
    connector.queue(1).unwrap().complete_all();

    let mut seqs = [Vec::new(), Vec::new()];
    let mut keys = [Vec::new(), Vec::new()];
    pool.poll_with(|report| {
        seqs[report.slot].push(report.seq);
        keys[report.slot].push(report.key);
    })
    .unwrap();

    for slot in 0..2 {
        assert_eq!(seqs[slot], (0..100).collect::<Vec<u64>>());
        assert!(keys[slot].windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn poll_respects_budget() {
    let options = PoolOptions::default().poll_budget(2);
    let pool = ConnectionPool::open(2, MockConnector::auto_ack(), options).unwrap();

    pool.send(&packets(5, 10, 0), 0).unwrap();
    pool.send(&packets(1, 10, 0), 1).unwrap();

    assert_eq!(pool.poll().unwrap(), 3);
    assert_eq!(pool.poll().unwrap(), 2);
    assert_eq!(pool.poll().unwrap(), 1);
    assert_eq!(pool.poll().unwrap(), 0);
    assert_eq!(pool.stats().unwrap().delivered, 6);
}

#[test]
fn zero_poll_budget_still_drains() {
    let options = PoolOptions { poll_budget: 0, flush_timeout: Duration::from_secs(5) };
    let pool = ConnectionPool::open(1, MockConnector::auto_ack(), options).unwrap();

    pool.send(&packets(3, 10, 0), 0).unwrap();
    assert_eq!(pool.poll().unwrap(), 1);

    let start = std::time::Instant::now();
    let stats = pool.close().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.failed, 0);
}

#[test]
fn close_waits_for_outstanding_packets() {
    let _ = tracing_subscriber::fmt::try_init();

    let connector = MockConnector::new(64);
    let options = PoolOptions::default().flush_timeout(Duration::from_secs(5));
    let pool = ConnectionPool::open(1, connector.clone(), options).unwrap();
    let batch = packets(20, 10, 0);

    assert_eq!(pool.send(&batch, 0).unwrap(), 20);

    let queue = connector.queue(0).unwrap();
    let acker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        queue.complete_all()
    });

    let stats = pool.close().unwrap();
    assert_eq!(acker.join().unwrap(), 20);

    assert_eq!(stats.delivered, 20);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.queue_depth, 0);
    assert!(connector.queue(0).unwrap().flushes() >= 1);
    assert!(batch.iter().all(|packet| packet.ref_count() == 1));
}

#[test]
fn close_counts_unacknowledged_as_failed() {
    let connector = MockConnector::new(64);
    let pool = open(2, connector.clone());
    let batch = packets(10, 10, 0);

    assert_eq!(pool.send(&batch, 0).unwrap(), 10);
    connector.queue(0).unwrap().complete(4);

    let stats = pool.close().unwrap();
    assert_eq!(stats.submitted, 10);
    assert_eq!(stats.delivered, 4);
    assert_eq!(stats.failed, 6);
    assert_eq!(stats.queue_depth, 0);
    assert!(batch.iter().all(|packet| packet.ref_count() == 1));
}

#[test]
fn closed_pool_is_not_initialized() {
    let pool = open(1, MockConnector::auto_ack());
    pool.close().unwrap();

    assert!(!pool.is_open());
    assert!(matches!(pool.send(&packets(1, 10, 0), 0), Err(PoolError::NotInitialized)));
    assert!(matches!(pool.poll(), Err(PoolError::NotInitialized)));
    assert!(matches!(pool.stats(), Err(PoolError::NotInitialized)));
    assert!(matches!(pool.slot_stats(0), Err(PoolError::NotInitialized)));
    assert!(matches!(pool.close(), Err(PoolError::NotInitialized)));
}

#[test]
fn drop_releases_held_packets() {
    let connector = MockConnector::new(64);
    let pool = open(1, connector.clone());
    let batch = packets(8, 10, 0);

    assert_eq!(pool.send(&batch, 0).unwrap(), 8);
    drop(pool);

    assert!(connector.queue(0).unwrap().is_empty());
    assert!(batch.iter().all(|packet| packet.ref_count() == 1));
}

#[test]
fn workers_publish_concurrently() {
    let _ = tracing_subscriber::fmt::try_init();

    const WORKERS: usize = 4;
    const BATCHES: usize = 50;
    const BATCH: usize = 32;

    let pool = Arc::new(open(WORKERS, MockConnector::new(256)));
    let connector = pool.connector().clone();

    let workers: Vec<_> = (0..WORKERS)
        .map(|slot| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for round in 0..BATCHES {
                    let batch = packets(BATCH, 64, (round * BATCH) as u64);
                    let mut sent = 0;
                    while sent < batch.len() {
                        sent += pool.send(&batch[sent..], slot).unwrap();
                        pool.poll().unwrap();
                    }
                }
            })
        })
        .collect();

    let acker = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let total = (WORKERS * BATCHES * BATCH) as u64;
            while pool.stats().unwrap().delivered < total {
                for slot in 0..WORKERS {
                    if let Some(queue) = connector.queue(slot) {
                        queue.complete_all();
                    }
                }
                pool.poll().unwrap();
                thread::yield_now();
            }
        })
    };

    for worker in workers {
        worker.join().unwrap();
    }
    acker.join().unwrap();

    let stats = pool.close().unwrap();
    let total = (WORKERS * BATCHES * BATCH) as u64;
    assert_eq!(stats.submitted, total);
    assert_eq!(stats.delivered, total);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.bytes_delivered, total * 64);
}

#[test]
fn fresh_pool_has_zero_counters() {
    for slots in [1, 3, 16] {
        let pool = open(slots, MockConnector::auto_ack());
        let stats = pool.stats().unwrap();

        assert_eq!(stats.slots, slots);
        assert_eq!(stats, capa_producer::PoolStats { slots, ..Default::default() });
        assert_eq!(pool.poll().unwrap(), 0);
        assert_eq!(pool.stats().unwrap(), stats);
    }
}

#[test]
fn three_packets_end_to_end() {
    let connector = MockConnector::new(16);
    let pool = open(2, connector.clone());

    assert_eq!(pool.send(&packets(3, 64, 0), 0).unwrap(), 3);
    connector.queue(0).unwrap().complete_all();

    while pool.stats().unwrap().completed() < 3 {
        pool.poll().unwrap();
    }

    assert_eq!(pool.stats().unwrap().submitted, 3);
    let stats = pool.close().unwrap();
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.failed, 0);
}
