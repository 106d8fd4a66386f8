use crate::mappings::RequestType;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TypeStats {
    pub ticks: u64,
    pub requests_sent: u64,
    pub responses_processed: u64,
    pub router_errors: u64,
    pub correlation_errors: u64,
    pub strategy_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub request_types: BTreeMap<String, TypeStats>,
    pub skipped_ticks: BTreeMap<String, u64>,
    pub crl_refreshes: u64,
    pub crl_refresh_failures: u64,
}

/// Process-wide counters shared by every scheduled job.
pub struct PipelineMonitor {
    pub per_type: DashMap<RequestType, TypeStats>,
    pub skipped: DashMap<String, u64>,
    pub crl_refreshes: AtomicU64,
    pub crl_refresh_failures: AtomicU64,
    pub start_time: Instant,
}

impl Default for PipelineMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMonitor {
    pub fn new() -> Self {
        Self {
            per_type: DashMap::with_capacity(RequestType::ALL.len()),
            skipped: DashMap::new(),
            crl_refreshes: AtomicU64::new(0),
            crl_refresh_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_tick(&self, request_type: RequestType) {
        self.per_type.entry(request_type).or_default().ticks += 1;
    }

    pub fn record_sent(&self, request_type: RequestType, count: usize) {
        self.per_type.entry(request_type).or_default().requests_sent += count as u64;
    }

    pub fn record_processed(&self, request_type: RequestType, processed: usize, strategy_failures: usize) {
        let mut stats = self.per_type.entry(request_type).or_default();
        stats.responses_processed += processed as u64;
        stats.strategy_errors += strategy_failures as u64;
    }

    pub fn record_router_error(&self, request_type: RequestType) {
        self.per_type.entry(request_type).or_default().router_errors += 1;
    }

    pub fn record_correlation_error(&self, request_type: RequestType) {
        self.per_type.entry(request_type).or_default().correlation_errors += 1;
    }

    pub fn record_skipped(&self, job: &str) {
        *self.skipped.entry(job.to_string()).or_insert(0) += 1;
    }

    pub fn skipped_for(&self, job: &str) -> u64 {
        self.skipped.get(job).map(|v| *v).unwrap_or(0)
    }

    pub fn record_crl_refresh(&self, refreshed: usize, failed: usize) {
        self.crl_refreshes.fetch_add(refreshed as u64, Ordering::Relaxed);
        self.crl_refresh_failures.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn stats(&self, request_type: RequestType) -> TypeStats {
        self.per_type.get(&request_type).map(|s| s.clone()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            request_types: self
                .per_type
                .iter()
                .map(|kv| (kv.key().api_name().to_string(), kv.value().clone()))
                .collect(),
            skipped_ticks: self.skipped.iter().map(|kv| (kv.key().clone(), *kv.value())).collect(),
            crl_refreshes: self.crl_refreshes.load(Ordering::Relaxed),
            crl_refresh_failures: self.crl_refresh_failures.load(Ordering::Relaxed),
        }
    }

    /// Logs one summary line plus one line per request type that has seen traffic.
    pub fn emit(&self) {
        let snapshot = self.snapshot();
        let skipped: u64 = snapshot.skipped_ticks.values().sum();
        info!(
            "Uptime {}s | CRL refreshes {} (failed {}) | skipped ticks {}",
            snapshot.uptime_secs, snapshot.crl_refreshes, snapshot.crl_refresh_failures, skipped
        );
        for (name, s) in &snapshot.request_types {
            info!(
                "  {:<16} ticks {:>6} | sent {:>7} | processed {:>7} | router err {:>4} | correlation err {:>4} | strategy err {:>4}",
                name, s.ticks, s.requests_sent, s.responses_processed, s.router_errors, s.correlation_errors, s.strategy_errors
            );
        }
    }
}
