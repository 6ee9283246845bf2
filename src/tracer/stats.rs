use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{RecordKind, RECORD_KIND_CARDINALITY};

/// Lock-free per-RecordKind counters.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct EventStats {
    counts: [AtomicU64; RECORD_KIND_CARDINALITY],
    decode_errors: AtomicU64,
}

impl EventStats {
    /// Create a new zeroed EventStats.
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            decode_errors: AtomicU64::new(0),
        }
    }

    /// Increment the counter for the given record kind by one.
    pub fn record(&self, kind: RecordKind) {
        if let Some(counter) = self.counts.get(kind as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count one record that failed to decode.
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(RecordKind, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = RecordKind::from_u8(i as u8) {
                    result.push((kind, v));
                }
            }
        }

        result
    }

    /// Atomically read and reset the decode error counter.
    pub fn take_decode_errors(&self) -> u64 {
        self.decode_errors.swap(0, Ordering::Relaxed)
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}
