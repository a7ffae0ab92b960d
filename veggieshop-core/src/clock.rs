//! Injectable time sources
//!
//! The platform separates wall-clock time (TTLs, timestamps, watermarks) from
//! monotonic time (rate limiting, backoff). Both are traits so tests can drive
//! them manually.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;

/// Wall-clock time source (epoch milliseconds)
pub trait WallClock: Send + Sync {
    /// Current time as epoch milliseconds
    fn now_millis(&self) -> i64;

    /// Current time as a UTC timestamp
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_millis())
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Monotonic time source (nanoseconds since an arbitrary origin)
pub trait MonotonicClock: Send + Sync {
    fn now_nanos(&self) -> u64;
}

/// Production clock backed by the OS
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

static MONOTONIC_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

impl WallClock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl MonotonicClock for SystemClock {
    fn now_nanos(&self) -> u64 {
        MONOTONIC_ORIGIN.elapsed().as_nanos() as u64
    }
}

/// Manually driven clock for tests
///
/// Implements both clock traits so a single instance can drive TTL sweeps and
/// token-bucket refills deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Arc<Self> {
        Arc::new(Self {
            millis: AtomicI64::new(start_millis),
            nanos: AtomicU64::new(0),
        })
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, delta: i64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
        self.nanos
            .fetch_add((delta.max(0) as u64) * 1_000_000, Ordering::SeqCst);
    }

    pub fn advance_nanos(&self, delta: u64) {
        self.nanos.fetch_add(delta, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

impl MonotonicClock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}
