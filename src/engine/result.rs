// Fri Oct 16 2026 - Alex

use crate::engine::error::ErrorKind;
use crate::engine::job::JobId;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a job's callable did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    Error(String),
    Panic(String),
}

impl JobFailure {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Runtime
    }

    pub fn message(&self) -> &str {
        match self {
            JobFailure::Error(msg) | JobFailure::Panic(msg) => msg,
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobFailure::Error(e) => write!(f, "Job returned an error: {}", e),
            JobFailure::Panic(e) => write!(f, "Job panicked: {}", e),
        }
    }
}

impl std::error::Error for JobFailure {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Completed,
    Failed(JobFailure),
    Discarded,
}

impl JobStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, JobStatus::Failed(_))
    }

    pub fn is_discarded(&self) -> bool {
        matches!(self, JobStatus::Discarded)
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match self {
            JobStatus::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Completion record shared between a job and every handle observing it.
#[derive(Debug)]
pub(crate) struct Completion {
    finished: AtomicBool,
    status: Mutex<JobStatus>,
    settled: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            finished: AtomicBool::new(false),
            status: Mutex::new(JobStatus::Pending),
            settled: Condvar::new(),
        }
    }

    /// Records the terminal status. Returns false if one was already recorded.
    pub(crate) fn settle(&self, outcome: JobStatus) -> bool {
        let mut status = self.status.lock();
        if !status.is_pending() {
            return false;
        }

        let finished = !outcome.is_discarded();
        *status = outcome;
        if finished {
            self.finished.store(true, Ordering::Release);
        }
        self.settled.notify_all();
        true
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn status(&self) -> JobStatus {
        self.status.lock().clone()
    }
}

/// Cloneable view of a submitted job's completion.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    completion: Arc<Completion>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId, completion: Arc<Completion>) -> Self {
        Self { id, completion }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }

    pub fn status(&self) -> JobStatus {
        self.completion.status()
    }

    /// Blocks until the job has run or has been discarded.
    pub fn wait(&self) -> JobStatus {
        let mut status = self.completion.status.lock();
        while status.is_pending() {
            self.completion.settled.wait(&mut status);
        }
        status.clone()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobStatus> {
        let deadline = Instant::now() + timeout;
        let mut status = self.completion.status.lock();

        while status.is_pending() {
            if self.completion.settled.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }

        if status.is_pending() {
            None
        } else {
            Some(status.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_settles_once() {
        let completion = Completion::new();
        assert!(!completion.is_finished());

        assert!(completion.settle(JobStatus::Completed));
        assert!(!completion.settle(JobStatus::Failed(JobFailure::Error("late".to_string()))));
        assert!(completion.is_finished());
        assert_eq!(completion.status(), JobStatus::Completed);
    }

    #[test]
    fn test_discarded_is_not_finished() {
        let completion = Arc::new(Completion::new());
        let handle = JobHandle::new(JobId(1), completion.clone());

        completion.settle(JobStatus::Discarded);
        assert!(!handle.is_finished());
        assert_eq!(handle.wait(), JobStatus::Discarded);
    }

    #[test]
    fn test_wait_timeout_on_pending_job() {
        let handle = JobHandle::new(JobId(2), Arc::new(Completion::new()));
        assert_eq!(handle.wait_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_failure_kind() {
        let failure = JobFailure::Panic("boom".to_string());
        assert_eq!(failure.kind(), ErrorKind::Runtime);
        assert_eq!(failure.message(), "boom");
        assert_eq!(failure.to_string(), "Job panicked: boom");
    }
}
