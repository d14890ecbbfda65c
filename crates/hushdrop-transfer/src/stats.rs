//! Transfer counters shared between a session's worker and the coordinator.
//! All fields are atomic so polling callers never wait on the worker.

use std::sync::atomic::{AtomicU64, Ordering};

const UNKNOWN_TOTAL: u64 = u64::MAX;

/// Point-in-time view of a session's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub bytes_transferred: u64,
    /// Known on the sending side only.
    pub total_bytes: Option<u64>,
}

impl ProgressSnapshot {
    /// Progress as a fraction 0.0 - 1.0, if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_transferred as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

pub struct SessionStats {
    total_bytes: AtomicU64,
    bytes_transferred: AtomicU64,
    last_reported: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Self {
        SessionStats {
            total_bytes: AtomicU64::new(UNKNOWN_TOTAL),
            bytes_transferred: AtomicU64::new(0),
            last_reported: AtomicU64::new(0),
        }
    }

    pub fn set_total(&self, bytes: u64) {
        self.total_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn total(&self) -> Option<u64> {
        match self.total_bytes.load(Ordering::Relaxed) {
            UNKNOWN_TOTAL => None,
            total => Some(total),
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    /// Store the running byte count. Returns true when at least `interval`
    /// bytes have passed since the last reported value.
    pub fn record(&self, bytes: u64, interval: u64) -> bool {
        self.bytes_transferred.store(bytes, Ordering::Relaxed);
        let last = self.last_reported.load(Ordering::Relaxed);
        if bytes.saturating_sub(last) >= interval.max(1) {
            self.last_reported.store(bytes, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_transferred: self.bytes_transferred(),
            total_bytes: self.total(),
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}
