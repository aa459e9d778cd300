// Fri Oct 16 2026 - Alex

use crate::engine::result::JobStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live counters owned by a pipeline and updated by its workers.
#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
    busy_nanos: AtomicU64,
}

impl PipelineCounters {
    pub(crate) fn record_submit(&self, count: u64) {
        self.submitted.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_discard(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, status: &JobStatus, elapsed: Duration) {
        match status {
            JobStatus::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            JobStatus::Failed(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            JobStatus::Pending | JobStatus::Discarded => return,
        }

        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.busy_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PipelineStats {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let executed = completed + failed;
        let busy_nanos = self.busy_nanos.load(Ordering::Relaxed);

        PipelineStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed,
            failed,
            discarded: self.discarded.load(Ordering::Relaxed),
            average_job_time_ms: if executed == 0 {
                0.0
            } else {
                busy_nanos as f64 / executed as f64 / 1_000_000.0
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub discarded: u64,
    pub average_job_time_ms: f64,
}

impl PipelineStats {
    pub fn executed(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn success_rate(&self) -> f64 {
        let executed = self.executed();
        if executed == 0 {
            0.0
        } else {
            self.completed as f64 / executed as f64
        }
    }

    /// Folds another snapshot in, weighting the average by executed jobs.
    pub fn merge(&mut self, other: &PipelineStats) {
        let total = self.executed() + other.executed();
        if total > 0 {
            self.average_job_time_ms = (self.average_job_time_ms * self.executed() as f64
                + other.average_job_time_ms * other.executed() as f64)
                / total as f64;
        }

        self.submitted += other.submitted;
        self.completed += other.completed;
        self.failed += other.failed;
        self.discarded += other.discarded;
    }
}
