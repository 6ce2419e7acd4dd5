//! Operational counters for the session server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cheap cloneable counters, shared across gateway and coordinator threads.
/// Exposed to clients through the `stats` message.
#[derive(Clone, Default)]
pub struct ServerMetrics {
    pub committed_mutations: Arc<AtomicU64>,
    pub conflict_rejections: Arc<AtomicU64>,
    pub validation_rejections: Arc<AtomicU64>,
    pub permission_denials: Arc<AtomicU64>,
    pub persistence_failures: Arc<AtomicU64>,
    pub connections_closed_parse_failures: Arc<AtomicU64>,
    pub connections_closed_oversize: Arc<AtomicU64>,
    pub connections_refused_limit: Arc<AtomicU64>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
