//! Process-wide compile counters.
//!
//! Only the local-compile path touches the active/max/time counters; cache
//! hits and forwarded jobs have their own tallies.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free compile statistics shared by every connection task.
#[derive(Debug, Default)]
pub struct CompileStats {
    active: AtomicU64,
    max_active: AtomicU64,
    compile_time_us: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    forwarded: AtomicU64,
    cache_hits: AtomicU64,
}

/// Point-in-time copy of [`CompileStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active: u64,
    pub max_active: u64,
    pub compile_time_ms: u64,
    pub completed: u64,
    pub failed: u64,
    pub forwarded: u64,
    pub cache_hits: u64,
}

impl CompileStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles currently running on this server.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Count a local compile as active until the guard is dropped.
    pub fn track(&self) -> CompileGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_active.fetch_max(now, Ordering::Relaxed);
        CompileGuard {
            stats: self,
            started: Instant::now(),
            succeeded: false,
        }
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active: self.active.load(Ordering::Relaxed),
            max_active: self.max_active.load(Ordering::Relaxed),
            compile_time_ms: self.compile_time_us.load(Ordering::Relaxed) / 1000,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active counter and books the elapsed time on drop.
///
/// A guard dropped without [`CompileGuard::succeeded`] counts as a failure.
#[must_use = "the compile is only counted while the guard is alive"]
pub struct CompileGuard<'a> {
    stats: &'a CompileStats,
    started: Instant,
    succeeded: bool,
}

impl CompileGuard<'_> {
    pub fn succeeded(mut self) {
        self.succeeded = true;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for CompileGuard<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_micros() as u64;
        self.stats
            .compile_time_us
            .fetch_add(elapsed, Ordering::Relaxed);
        if self.succeeded {
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.active.fetch_sub(1, Ordering::AcqRel);
    }
}
