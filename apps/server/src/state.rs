//! Process state and running totals.

use sentinel_alerts::CycleReport;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Totals across cycles.
#[derive(Debug)]
pub struct EngineStats {
    pub cycles_run: AtomicU64,
    pub cycles_failed: AtomicU64,
    pub triggers: AtomicU64,
    pub rate_limited: AtomicU64,
    pub deliveries_sent: AtomicU64,
    pub deliveries_failed: AtomicU64,
    started_at: Instant,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self {
            cycles_run: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            triggers: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            deliveries_sent: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }
}

impl EngineStats {
    pub fn record_cycle(&self, report: &CycleReport) {
        self.cycles_run.fetch_add(1, Ordering::Relaxed);
        self.triggers
            .fetch_add(report.triggered.len() as u64, Ordering::Relaxed);
        self.rate_limited
            .fetch_add(report.rate_limited.len() as u64, Ordering::Relaxed);
        self.deliveries_sent
            .fetch_add(report.deliveries_sent() as u64, Ordering::Relaxed);
        self.deliveries_failed
            .fetch_add(report.deliveries_failed() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            cycles_run: self.cycles_run.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            triggers: self.triggers.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            deliveries_sent: self.deliveries_sent.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSummary {
    pub uptime_secs: u64,
    pub cycles_run: u64,
    pub cycles_failed: u64,
    pub triggers: u64,
    pub rate_limited: u64,
    pub deliveries_sent: u64,
    pub deliveries_failed: u64,
}

/// Shared process state.
#[derive(Debug, Default)]
pub struct AppState {
    running: AtomicBool,
    pub stats: EngineStats,
}

impl AppState {
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub type SharedState = Arc<AppState>;

pub fn create_state() -> SharedState {
    Arc::new(AppState::default())
}
