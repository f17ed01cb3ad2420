use std::time::{Duration, Instant};

/// Process-wide counters, owned and mutated only by the main loop.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub completed: u64,
    pub failed: u64,
    /// Failed control-plane requests (every attempt counts).
    pub connection_errors: u64,
    /// Tasks that failed because of the child process.
    pub scraping_errors: u64,
    started_at: Instant,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerStats {
    pub fn new() -> Self {
        Self {
            completed: 0,
            failed: 0,
            connection_errors: 0,
            scraping_errors: 0,
            started_at: Instant::now(),
        }
    }

    pub fn record_completed(&mut self) {
        self.completed += 1;
    }

    pub fn record_failed(&mut self, child_failure: bool) {
        self.failed += 1;
        if child_failure {
            self.scraping_errors += 1;
        }
    }

    pub fn record_connection_errors(&mut self, count: u64) {
        self.connection_errors += count;
    }

    pub fn record_connection_error(&mut self) {
        self.record_connection_errors(1);
    }

    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn log_summary(&self) {
        tracing::info!(
            completed = self.completed,
            failed = self.failed,
            connection_errors = self.connection_errors,
            scraping_errors = self.scraping_errors,
            uptime_secs = self.uptime().as_secs(),
            "Worker stats",
        );
    }
}
