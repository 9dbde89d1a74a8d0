use std::sync::atomic::{AtomicU64, Ordering};

/// Consecutive malformed records tolerated before the streak is reported.
pub const MALFORMED_STREAK_LIMIT: u32 = 3;

/// Lock-free counters for the ingestion pipeline.
///
/// Cumulative totals feed the exporter's counters; `take_interval()` reads
/// and resets the per-interval view used by the periodic log line.
#[derive(Debug, Default)]
pub struct PipelineStats {
    decoded: AtomicU64,
    decode_errors: AtomicU64,
    incomplete: AtomicU64,
    streak_resets: AtomicU64,
    interval_decoded: AtomicU64,
    interval_failed: AtomicU64,
}

/// Cumulative totals at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineTotals {
    pub decoded: u64,
    pub decode_errors: u64,
    pub incomplete: u64,
    pub streak_resets: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decoded(&self) {
        self.decoded.fetch_add(1, Ordering::Relaxed);
        self.interval_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        self.interval_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A record cut off by the end of the stream.
    pub fn record_incomplete(&self) {
        self.incomplete.fetch_add(1, Ordering::Relaxed);
        self.interval_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_streak_reset(&self) {
        self.streak_resets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> PipelineTotals {
        PipelineTotals {
            decoded: self.decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            incomplete: self.incomplete.load(Ordering::Relaxed),
            streak_resets: self.streak_resets.load(Ordering::Relaxed),
        }
    }

    /// Atomically read and reset the interval counters as `(decoded, failed)`.
    pub fn take_interval(&self) -> (u64, u64) {
        (
            self.interval_decoded.swap(0, Ordering::Relaxed),
            self.interval_failed.swap(0, Ordering::Relaxed),
        )
    }
}

/// Tracks consecutive malformed records.
#[derive(Debug, Default)]
pub struct MalformedTracker {
    streak: u32,
}

impl MalformedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a malformed record. Returns true when the streak reached
    /// [`MALFORMED_STREAK_LIMIT`]; the streak is reset to zero in that case.
    pub fn record_failure(&mut self) -> bool {
        self.streak += 1;
        if self.streak >= MALFORMED_STREAK_LIMIT {
            self.streak = 0;
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.streak = 0;
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}
