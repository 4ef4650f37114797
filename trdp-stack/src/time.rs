//! Injected clock.
//!
//! Every deadline in the engine is computed on the monotonic clock so a
//! wall-clock step during a session never perturbs intervals. Wall time
//! is consulted only for sessionId generation.

use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait TimeProvider: Send + Sync + Debug {
    fn now_instant(&self) -> Instant;
    fn now_unix_ms(&self) -> i64;
}

/// The OS clock pair.
#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_unix_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A manual clock for deterministic tests.
#[derive(Debug)]
pub struct ManualTimeProvider {
    instant: RwLock<Instant>,
    unix_ms: RwLock<i64>,
}

impl ManualTimeProvider {
    pub fn new(instant: Instant, unix_ms: i64) -> Self {
        Self {
            instant: RwLock::new(instant),
            unix_ms: RwLock::new(unix_ms),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.write().unwrap() += duration;
        *self.unix_ms.write().unwrap() += duration.as_millis() as i64;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        *self.instant.read().unwrap()
    }

    fn now_unix_ms(&self) -> i64 {
        *self.unix_ms.read().unwrap()
    }
}
