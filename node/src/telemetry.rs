use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::Serialize;

const RECENT_FAILURES: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub peer: String,
    pub reason: String,
    pub at_unix_ms: u64,
}

#[derive(Debug)]
pub struct SyncTelemetry {
    start: Instant,
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    importing_attempts: AtomicU64,
    last_attempt_ms: AtomicU64,
    recent_failures: RwLock<VecDeque<SyncFailure>>,
}

impl Default for SyncTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTelemetry {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            importing_attempts: AtomicU64::new(0),
            last_attempt_ms: AtomicU64::new(0),
            recent_failures: RwLock::new(VecDeque::with_capacity(RECENT_FAILURES)),
        }
    }

    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, imported: bool, elapsed: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        if imported {
            self.importing_attempts.fetch_add(1, Ordering::Relaxed);
        }
        self.last_attempt_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, peer: String, reason: String, elapsed: Duration) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.last_attempt_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
        let at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut recent = self.recent_failures.write();
        if recent.len() == RECENT_FAILURES {
            recent.pop_front();
        }
        recent.push_back(SyncFailure {
            peer,
            reason,
            at_unix_ms,
        });
    }

    pub fn snapshot(&self) -> SyncTelemetrySnapshot {
        SyncTelemetrySnapshot {
            uptime_secs: self.start.elapsed().as_secs(),
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            importing_attempts: self.importing_attempts.load(Ordering::Relaxed),
            last_attempt_ms: self.last_attempt_ms.load(Ordering::Relaxed),
            recent_failures: self.recent_failures.read().iter().cloned().collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncTelemetrySnapshot {
    pub uptime_secs: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub importing_attempts: u64,
    pub last_attempt_ms: u64,
    pub recent_failures: Vec<SyncFailure>,
}
