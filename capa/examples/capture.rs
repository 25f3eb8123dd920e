//! Publishes synthetic packets from several capture workers to a local broker.

use std::{sync::Arc, thread, time::Duration};

use bytes::Bytes;
use rand::Rng;
use tracing::{info, warn};

use capa::{
    mock::MockBroker, tcp::TcpConnector, ConnectionPool, PacketBuffer, PoolOptions,
    ProducerOptions,
};

const WORKERS: usize = 4;
const BURSTS: usize = 100;
const BURST_SIZE: usize = 32;

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = MockBroker::bind("127.0.0.1:0").await.unwrap();
    info!(addr = %broker.local_addr(), "Broker listening");

    let options = ProducerOptions::new([broker.local_addr().to_string()], "pcap")
        .linger(Some(Duration::from_millis(5)))
        .compression(capa::compression::CompressionType::Lz4);
    let connector = TcpConnector::new(options).unwrap();
    let pool = Arc::new(ConnectionPool::open(WORKERS, connector, PoolOptions::default()).unwrap());

    // Capture workers run on their own threads, one slot each.
    let workers: Vec<_> = (0..WORKERS)
        .map(|slot| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..BURSTS {
                    let burst: Vec<PacketBuffer> = (0..BURST_SIZE)
                        .map(|_| {
                            let len = rng.gen_range(64..1514);
                            let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                            PacketBuffer::new(Bytes::from(data))
                        })
                        .collect();

                    let mut sent = 0;
                    while sent < burst.len() {
                        sent += pool.send(&burst[sent..], slot).unwrap();
                        pool.poll().unwrap();
                    }

                    thread::sleep(Duration::from_millis(1));
                }
            })
        })
        .collect();

    for worker in workers {
        if worker.join().is_err() {
            warn!("Capture worker panicked");
        }
    }

    let stats = tokio::task::block_in_place(|| pool.close()).unwrap();
    info!(
        submitted = stats.submitted,
        delivered = stats.delivered,
        failed = stats.failed,
        bytes = stats.bytes_delivered,
        received = broker.received_count(),
        "Done"
    );
}
