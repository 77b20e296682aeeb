//! Lightweight process counters, mirroring the teacher's `NetMetrics` shape
//! (a struct of atomics, no external metrics crate) scaled down to what this
//! service's delivery/auth surface actually needs.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct NetMetrics {
    pub auth_failures: AtomicU64,
    pub delivery_attempts: AtomicU64,
    pub delivery_success: AtomicU64,
    pub delivery_dead: AtomicU64,
}

impl NetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_attempt(&self) {
        self.delivery_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_success(&self) {
        self.delivery_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_dead(&self) {
        self.delivery_dead.fetch_add(1, Ordering::Relaxed);
    }
}
