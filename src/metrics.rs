//! Event and metric tables
//!
//! The console page renders three tables: named event counters (stable
//! strings, incremented all over the dispatch pipeline), per-backend
//! traffic counters, and a snapshot of the live connections. All three
//! are proxy-scoped; none survive a restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

/// Named event counters.
#[derive(Default)]
pub struct Events {
    counters: DashMap<String, u64>,
}

impl Events {
    pub fn record(&self, event: &str) {
        *self.counters.entry(event.to_string()).or_insert(0) += 1;
    }

    pub fn count(&self, event: &str) -> u64 {
        self.counters.get(event).map(|v| *v).unwrap_or(0)
    }

    /// Sorted snapshot for the console.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut out: Vec<_> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        out.sort();
        out
    }
}

/// Traffic counters for one backend.
#[derive(Default)]
pub struct BackendMetrics {
    pub connections: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
}

/// Per-backend metrics, keyed by the backend's first server name.
#[derive(Default)]
pub struct Metrics {
    backends: DashMap<String, Arc<BackendMetrics>>,
}

impl Metrics {
    pub fn backend(&self, key: &str) -> Arc<BackendMetrics> {
        Arc::clone(
            &self
                .backends
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(BackendMetrics::default())),
        )
    }

    pub fn record_connection(&self, key: &str) {
        self.backend(key).connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, key: &str, received: u64, sent: u64) {
        let m = self.backend(key);
        m.bytes_received.fetch_add(received, Ordering::Relaxed);
        m.bytes_sent.fetch_add(sent, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Vec<BackendMetricsSnapshot> {
        let mut out: Vec<_> = self
            .backends
            .iter()
            .map(|e| BackendMetricsSnapshot {
                backend: e.key().clone(),
                connections: e.connections.load(Ordering::Relaxed),
                bytes_received: e.bytes_received.load(Ordering::Relaxed),
                bytes_sent: e.bytes_sent.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by(|a, b| a.backend.cmp(&b.backend));
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendMetricsSnapshot {
    pub backend: String,
    pub connections: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// One row of the console's live-connection table.
#[derive(Debug, Clone, Serialize)]
pub struct ConnSnapshot {
    pub peer: String,
    pub server_name: String,
    pub mode: String,
    pub age: Duration,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}
