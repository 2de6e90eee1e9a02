#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use tapeline::clock::Clock;

/// Deterministic clock for archival tests: starts where the test says and
/// only moves when told.
pub struct FakeClock {
    now_ns: AtomicU64,
}

impl FakeClock {
    pub fn at(now_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(now_ns),
        }
    }

    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.now_ns
            .fetch_add(secs * 1_000_000_000, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}

/// 2024-06-01T00:00:00Z in nanoseconds.
pub const JUNE_1: u64 = 1_717_200_000_000_000_000;

pub const SECOND: u64 = 1_000_000_000;
