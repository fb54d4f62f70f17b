use psg_client::{Config, Queue, StaticServers};
use std::{net::SocketAddr, sync::Once};

pub fn setup() {
    static ONCE: Once = Once::new();

    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing_subscriber::filter::LevelFilter::TRACE)
            .with_test_writer()
            .try_init();
    });
}

/// A queue sending to the given servers from a single I/O thread.
pub fn queue(servers: &[SocketAddr], config: Config) -> Queue {
    setup();

    Queue::builder(StaticServers::new(servers.iter().copied()))
        .config(config.num_io(1))
        .build()
        .unwrap()
}
