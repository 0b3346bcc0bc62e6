//! Copy progress reporting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives progress from copy requests. Called inline from the request
/// task, so implementations must not block.
pub trait ProgressHandler: Send + Sync {
    /// Called after every completed source read, including empty ones.
    fn on_bytes_read(&self, bytes_read: u64);
}

/// Handler that totals reads and bytes.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    bytes_read: AtomicU64,
    reads: AtomicU64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Number of completed reads.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

impl ProgressHandler for ProgressCounter {
    fn on_bytes_read(&self, bytes_read: u64) {
        self.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }
}
