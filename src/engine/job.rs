// Fri Oct 16 2026 - Alex

use crate::engine::result::{Completion, JobFailure, JobHandle, JobStatus};
use crate::engine::worker::WorkerId;
use std::any::Any;
use std::cmp::Ordering;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub type JobPriority = u8;

type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single deferred unit of work.
///
/// A job is move-only: whoever holds it owns the right to run it, and the
/// wrapped closure is consumed by the first call to [`Job::execute`].
pub struct Job {
    id: JobId,
    priority: JobPriority,
    affinity: Option<WorkerId>,
    sequence: u64,
    task: Option<Task>,
    completion: Arc<Completion>,
}

impl Job {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::fallible(move || {
            f();
            Ok(())
        })
    }

    pub fn fallible<F>(f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        Self {
            id: JobId(NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::SeqCst)),
            priority: 0,
            affinity: None,
            sequence: 0,
            task: Some(Box::new(f)),
            completion: Arc::new(Completion::new()),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_affinity(mut self, worker: WorkerId) -> Self {
        self.affinity = Some(worker);
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    pub fn affinity(&self) -> Option<WorkerId> {
        self.affinity
    }

    /// Position in its pipeline's submission order, zero until pushed.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub(crate) fn clear_affinity(&mut self) {
        self.affinity = None;
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle::new(self.id, self.completion.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }

    pub fn status(&self) -> JobStatus {
        self.completion.status()
    }

    /// Runs the wrapped closure. Errors and panics are contained here and
    /// recorded as a failed status; the job counts as finished either way.
    pub fn execute(&mut self) -> JobStatus {
        let Some(task) = self.task.take() else {
            log::warn!("Job {} has already been executed", self.id);
            return self.completion.status();
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(())) => JobStatus::Completed,
            Ok(Err(e)) => {
                log::error!("Job {} failed: {:#}", self.id, e);
                JobStatus::Failed(JobFailure::Error(format!("{:#}", e)))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("Job {} panicked: {}", self.id, message);
                JobStatus::Failed(JobFailure::Panic(message))
            }
        };

        self.completion.settle(outcome.clone());
        outcome
    }

    /// Drops the job without running it.
    pub fn discard(mut self) {
        self.task = None;
        self.completion.settle(JobStatus::Discarded);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.completion.settle(JobStatus::Discarded);
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("affinity", &self.affinity)
            .field("sequence", &self.sequence)
            .field("status", &self.completion.status())
            .finish()
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Greater means scheduled earlier: higher priority first, then earlier submission.
impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn test_job_executes_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut job = Job::new(move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });

        assert!(!job.is_finished());
        assert_eq!(job.execute(), JobStatus::Completed);
        assert!(job.is_finished());

        assert_eq!(job.execute(), JobStatus::Completed);
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn test_failing_job_is_finished_with_error() {
        let mut job = Job::fallible(|| anyhow::bail!("asset missing"));
        assert!(!job.is_finished());

        let status = job.execute();
        assert!(job.is_finished());
        assert_eq!(status, JobStatus::Failed(JobFailure::Error("asset missing".to_string())));
    }

    #[test]
    fn test_panicking_job_is_contained() {
        let mut job = Job::new(|| panic!("physics step exploded"));
        let handle = job.handle();

        let status = job.execute();
        assert!(handle.is_finished());
        assert_eq!(status, JobStatus::Failed(JobFailure::Panic("physics step exploded".to_string())));
        assert_eq!(handle.status(), status);
    }

    #[test]
    fn test_dropped_job_reports_discarded() {
        let job = Job::new(|| {});
        let handle = job.handle();
        drop(job);

        assert!(!handle.is_finished());
        assert_eq!(handle.status(), JobStatus::Discarded);
    }

    #[test]
    fn test_ordering_prefers_priority_then_submission() {
        let mut low = Job::new(|| {}).with_priority(1);
        let mut high = Job::new(|| {}).with_priority(5);
        let mut high_later = Job::new(|| {}).with_priority(5);
        low.set_sequence(1);
        high.set_sequence(2);
        high_later.set_sequence(3);

        assert!(high > low);
        assert!(high > high_later);
        assert!(high_later > low);
    }

    #[test]
    fn test_builder_metadata() {
        let job = Job::new(|| {}).with_priority(9).with_affinity(WorkerId(4));
        assert_eq!(job.priority(), 9);
        assert_eq!(job.affinity(), Some(WorkerId(4)));
        assert_eq!(job.sequence(), 0);
    }
}
