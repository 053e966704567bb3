use std::sync::atomic::{AtomicI64, Ordering};

/// Wall-clock source used for every expiry check (sessions, grants, tokens).
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 { chrono::Utc::now().timestamp() }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self { Self { now: AtomicI64::new(start) } }
    pub fn advance(&self, secs: i64) { self.now.fetch_add(secs, Ordering::SeqCst); }
    pub fn set(&self, at: i64) { self.now.store(at, Ordering::SeqCst); }
}

impl Clock for ManualClock {
    fn now_unix(&self) -> i64 { self.now.load(Ordering::SeqCst) }
}
