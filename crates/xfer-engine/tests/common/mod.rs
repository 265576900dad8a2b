#![allow(dead_code)]

use std::sync::mpsc;

use tracing_subscriber::EnvFilter;
use xfer_engine::device::{BackendKind, Platform, PlatformConfig, Queue};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn platform(backend: BackendKind) -> Platform {
    init_tracing();
    Platform::new(PlatformConfig {
        backend,
        device_count: 2,
        ..PlatformConfig::default()
    })
    .unwrap()
}

pub fn emulated() -> Platform {
    platform(BackendKind::Emulated)
}

/// Holds a queue's worker inside a task until opened (or dropped).
///
/// Only meaningful on the emulated backend; host-only queues run tasks inline.
pub struct Gate(mpsc::Sender<()>);

impl Gate {
    pub fn block(queue: &Queue) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        queue
            .enqueue(move || {
                let _ = rx.recv();
            })
            .unwrap();
        Gate(tx)
    }

    pub fn open(self) {
        let _ = self.0.send(());
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
