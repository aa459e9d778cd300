// Fri Oct 16 2026 - Alex

use crate::engine::error::{SchedulerError, SchedulerResult};
use crate::engine::job::Job;
use crate::engine::result::JobHandle;
use crate::engine::stats::{PipelineCounters, PipelineStats};
use crate::engine::worker::{Worker, WorkerId, WorkerOptions};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PipelineId(pub u32);

impl PipelineId {
    pub const DEFAULT: PipelineId = PipelineId(0);
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How [`Pipeline::sort_jobs`] reorders the jobs pending at the time of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStrategy {
    #[default]
    Fifo,
    Lifo,
    Priority,
}

impl ScheduleStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ScheduleStrategy::Fifo => "fifo",
            ScheduleStrategy::Lifo => "lifo",
            ScheduleStrategy::Priority => "priority",
        }
    }
}

impl FromStr for ScheduleStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fifo" => Ok(ScheduleStrategy::Fifo),
            "lifo" => Ok(ScheduleStrategy::Lifo),
            "priority" => Ok(ScheduleStrategy::Priority),
            other => Err(format!("Unknown schedule strategy: {}", other)),
        }
    }
}

/// Record of a worker lent from one pipeline to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Loan {
    pub lender: PipelineId,
    pub borrower: PipelineId,
    pub worker: WorkerId,
}

/// A worker handed to [`Pipeline::transfer_in_worker`] that was not accepted.
#[derive(Debug)]
pub struct RejectedWorker {
    pub worker: Worker,
    pub error: SchedulerError,
}

pub(crate) struct PipelineState {
    pub(crate) jobs: VecDeque<Job>,
    pub(crate) workers: Vec<Worker>,
    pub(crate) loans: Vec<Loan>,
    pub(crate) borrowed: Vec<Loan>,
    pub(crate) accepting: bool,
    pub(crate) paused: bool,
    pub(crate) in_flight: usize,
    next_sequence: u64,
}

impl PipelineState {
    fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
            workers: Vec::new(),
            loans: Vec::new(),
            borrowed: Vec::new(),
            accepting: true,
            paused: false,
            in_flight: 0,
            next_sequence: 0,
        }
    }

    /// Removes the first job `worker` may run: one affined to it if it is
    /// dedicated, otherwise the first unaffined job.
    pub(crate) fn claim(&mut self, worker: WorkerId, dedicated: bool) -> Option<Job> {
        if self.paused {
            return None;
        }

        let unaffined = || self.jobs.iter().position(|job| job.affinity().is_none());
        let index = if dedicated {
            self.jobs
                .iter()
                .position(|job| job.affinity() == Some(worker))
                .or_else(unaffined)
        } else {
            unaffined()
        };

        index.and_then(|i| self.jobs.remove(i))
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.jobs.is_empty() && self.in_flight == 0
    }

    fn is_borrowed(&self, worker: WorkerId) -> bool {
        self.borrowed.iter().any(|loan| loan.worker == worker)
    }

    fn owned_count(&self) -> usize {
        self.workers.iter().filter(|w| !self.is_borrowed(w.id())).count()
    }

    /// An idle worker this pipeline owns and may give away. Dedicated workers
    /// stay home so their affined jobs always have a runner.
    fn idle_owned_worker(&self) -> Option<usize> {
        self.workers
            .iter()
            .position(|w| !self.is_borrowed(w.id()) && !w.is_busy() && !w.is_dedicated())
    }

    fn has_dedicated(&self, worker: WorkerId) -> bool {
        self.workers.iter().any(|w| w.id() == worker && w.is_dedicated())
    }

    fn clear_affinity_for(&mut self, worker: WorkerId) {
        for job in self.jobs.iter_mut().filter(|job| job.affinity() == Some(worker)) {
            job.clear_affinity();
        }
    }

    fn enqueue(&mut self, pipeline: PipelineId, mut job: Job) -> JobHandle {
        if let Some(worker) = job.affinity() {
            if !self.has_dedicated(worker) {
                log::warn!(
                    "Job {} prefers worker {}, which is not a dedicated worker of pipeline {}, dropping the affinity",
                    job.id(),
                    worker,
                    pipeline
                );
                job.clear_affinity();
            }
        }

        self.next_sequence += 1;
        job.set_sequence(self.next_sequence);
        let handle = job.handle();
        self.jobs.push_back(job);
        handle
    }
}

pub(crate) struct PipelineShared {
    pub(crate) id: PipelineId,
    pub(crate) state: Mutex<PipelineState>,
    /// Signalled on every push, resume, re-parenting and shutdown.
    pub(crate) available: Condvar,
    /// Signalled whenever the pipeline becomes drained.
    pub(crate) drained: Condvar,
    pub(crate) counters: PipelineCounters,
}

/// A queue of pending jobs plus the workers draining it.
///
/// One mutex guards the pending jobs, the worker set and the loan records.
/// Operations touching two pipelines lock them in ascending id order.
pub struct Pipeline {
    shared: Arc<PipelineShared>,
    options: WorkerOptions,
}

impl Pipeline {
    pub fn new(id: PipelineId, workers: usize, options: &WorkerOptions) -> SchedulerResult<Self> {
        let pipeline = Self {
            shared: Arc::new(PipelineShared {
                id,
                state: Mutex::new(PipelineState::new()),
                available: Condvar::new(),
                drained: Condvar::new(),
                counters: PipelineCounters::default(),
            }),
            options: options.clone(),
        };

        pipeline.add_workers(workers)?;
        log::debug!("Pipeline {} created with {} workers", id, workers);
        Ok(pipeline)
    }

    pub fn id(&self) -> PipelineId {
        self.shared.id
    }

    pub(crate) fn shared(&self) -> &Arc<PipelineShared> {
        &self.shared
    }

    pub fn add_workers(&self, count: usize) -> SchedulerResult<Vec<WorkerId>> {
        let mut spawned = Vec::with_capacity(count);
        for _ in 0..count {
            spawned.push(Worker::spawn(&self.options, Some(self.shared.clone()))?);
        }

        let mut state = self.shared.state.lock();
        if !state.accepting {
            drop(state);
            return self.refuse(SchedulerError::ShuttingDown(self.id()));
        }

        let ids = spawned.iter().map(|w| w.id()).collect();
        state.workers.extend(spawned);
        Ok(ids)
    }

    pub fn push_job(&self, job: Job) -> SchedulerResult<JobHandle> {
        let mut state = self.shared.state.lock();
        if !state.accepting {
            drop(state);
            log::warn!("Pipeline {} is shutting down, rejecting job {}", self.id(), job.id());
            return Err(SchedulerError::ShuttingDown(self.id()));
        }

        let handle = state.enqueue(self.id(), job);
        let affine = state.jobs.back().map_or(false, |job| job.affinity().is_some());
        self.shared.counters.record_submit(1);

        // Only the matching dedicated worker can take an affined job.
        if affine {
            self.shared.available.notify_all();
        } else {
            self.shared.available.notify_one();
        }

        Ok(handle)
    }

    pub fn push_jobs(&self, jobs: Vec<Job>) -> SchedulerResult<Vec<JobHandle>> {
        let mut state = self.shared.state.lock();
        if !state.accepting {
            drop(state);
            log::warn!("Pipeline {} is shutting down, rejecting {} jobs", self.id(), jobs.len());
            return Err(SchedulerError::ShuttingDown(self.id()));
        }

        let id = self.id();
        let handles: Vec<JobHandle> = jobs.into_iter().map(|job| state.enqueue(id, job)).collect();
        self.shared.counters.record_submit(handles.len() as u64);
        self.shared.available.notify_all();
        Ok(handles)
    }

    /// Takes the head of the pending sequence without waiting.
    pub fn pop_job(&self) -> Option<Job> {
        let mut state = self.shared.state.lock();
        let job = state.jobs.pop_front();
        if job.is_some() && state.is_drained() {
            self.shared.drained.notify_all();
        }
        job
    }

    /// Reorders the jobs pending right now. Jobs pushed afterwards are
    /// appended in submission order until the next call.
    pub fn sort_jobs(&self, strategy: ScheduleStrategy) {
        let mut state = self.shared.state.lock();
        match strategy {
            ScheduleStrategy::Fifo => {}
            ScheduleStrategy::Lifo => state.jobs.make_contiguous().reverse(),
            ScheduleStrategy::Priority => state.jobs.make_contiguous().sort_by(|a, b| b.cmp(a)),
        }
        log::debug!(
            "Pipeline {} sorted {} pending jobs ({})",
            self.id(),
            state.jobs.len(),
            strategy.name()
        );
    }

    pub fn pause(&self) {
        self.shared.state.lock().paused = true;
    }

    pub fn resume(&self) {
        let mut state = self.shared.state.lock();
        state.paused = false;
        self.shared.available.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    /// True when nothing is pending. Workers may still be running jobs.
    pub fn is_idle(&self) -> bool {
        self.shared.state.lock().jobs.is_empty()
    }

    /// True when nothing is pending and no job is in flight.
    pub fn is_drained(&self) -> bool {
        self.shared.state.lock().is_drained()
    }

    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();

        while !state.is_drained() {
            if self.shared.drained.wait_until(&mut state, deadline).timed_out() {
                return state.is_drained();
            }
        }

        true
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.state.lock().accepting
    }

    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().workers.len()
    }

    pub fn busy_count(&self) -> usize {
        self.shared.state.lock().workers.iter().filter(|w| w.is_busy()).count()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.shared.state.lock().workers.iter().map(|w| w.id()).collect()
    }

    /// Workers this pipeline has lent out.
    pub fn loans(&self) -> Vec<Loan> {
        self.shared.state.lock().loans.clone()
    }

    /// Workers this pipeline is currently borrowing.
    pub fn borrowed(&self) -> Vec<Loan> {
        self.shared.state.lock().borrowed.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.counters.snapshot()
    }

    /// Marks an idle, undedicated worker as dedicated and returns its id, for use
    /// as a job affinity.
    pub fn request_dedicated_worker(&self) -> SchedulerResult<WorkerId> {
        let state = self.shared.state.lock();
        if let Some(worker) = state
            .workers
            .iter()
            .find(|w| !state.is_borrowed(w.id()) && !w.is_dedicated() && !w.is_busy())
        {
            worker.set_dedicated(true);
            log::info!("Pipeline {} dedicated worker {}", self.id(), worker.id());
            return Ok(worker.id());
        }

        drop(state);
        self.refuse(SchedulerError::NoIdleWorker(self.id()))
    }

    /// Clears the dedication; jobs still waiting for this worker lose their
    /// affinity so any worker can run them.
    pub fn release_dedicated_worker(&self, worker: WorkerId) -> SchedulerResult<()> {
        let mut state = self.shared.state.lock();
        let found = state
            .workers
            .iter()
            .find(|w| w.id() == worker && w.is_dedicated())
            .map(|w| w.set_dedicated(false))
            .is_some();

        if !found {
            drop(state);
            return self.refuse(SchedulerError::UnknownWorker { pipeline: self.id(), worker });
        }

        state.clear_affinity_for(worker);
        self.shared.available.notify_all();
        log::info!("Pipeline {} released worker {}", self.id(), worker);
        Ok(())
    }

    /// Removes one idle worker from this pipeline and parks it.
    pub fn transfer_out_worker(&self) -> SchedulerResult<Worker> {
        let mut state = self.shared.state.lock();
        let Some(index) = state.idle_owned_worker() else {
            drop(state);
            return self.refuse(SchedulerError::NoIdleWorker(self.id()));
        };

        let worker = state.workers.remove(index);
        if let Err(e) = worker.reset(None) {
            state.workers.insert(index, worker);
            drop(state);
            return self.refuse(e);
        }
        worker.set_dedicated(false);
        state.clear_affinity_for(worker.id());
        self.shared.available.notify_all();

        log::debug!("Pipeline {} released worker {}", self.id(), worker.id());
        Ok(worker)
    }

    /// Adopts a worker. Busy workers are refused and handed back.
    pub fn transfer_in_worker(&self, worker: Worker) -> Result<(), RejectedWorker> {
        let mut state = self.shared.state.lock();
        if !state.accepting {
            drop(state);
            let error = SchedulerError::ShuttingDown(self.id());
            log::warn!("Pipeline {}: {}", self.id(), error);
            return Err(RejectedWorker { worker, error });
        }

        if let Err(error) = worker.reset(Some(self.shared.clone())) {
            drop(state);
            return Err(RejectedWorker { worker, error });
        }

        log::debug!("Pipeline {} adopted worker {}", self.id(), worker.id());
        state.workers.push(worker);
        Ok(())
    }

    /// Moves one idle worker from this pipeline to `target` and records the loan.
    pub fn borrow_worker(&self, target: &Pipeline) -> SchedulerResult<Loan> {
        if self.id() == target.id() {
            return self.refuse(SchedulerError::SamePipeline(self.id()));
        }

        let (mut mine, mut theirs) = lock_pair(&self.shared, &target.shared);
        let refusal = if !mine.accepting {
            Some(SchedulerError::ShuttingDown(self.id()))
        } else if !theirs.accepting {
            Some(SchedulerError::ShuttingDown(target.id()))
        } else if mine.owned_count() <= 1 {
            Some(SchedulerError::LastWorker(self.id()))
        } else {
            None
        };
        if let Some(error) = refusal {
            drop((mine, theirs));
            return self.refuse(error);
        }

        let Some(index) = mine.idle_owned_worker() else {
            drop((mine, theirs));
            return self.refuse(SchedulerError::NoIdleWorker(self.id()));
        };

        let worker = mine.workers.remove(index);
        if let Err(e) = worker.reset(Some(target.shared.clone())) {
            mine.workers.insert(index, worker);
            drop((mine, theirs));
            return self.refuse(e);
        }
        self.shared.available.notify_all();

        let loan = Loan {
            lender: self.id(),
            borrower: target.id(),
            worker: worker.id(),
        };
        mine.loans.push(loan);
        theirs.borrowed.push(loan);
        theirs.workers.push(worker);
        target.shared.available.notify_all();

        log::debug!("Pipeline {} lent worker {} to pipeline {}", self.id(), loan.worker, target.id());
        Ok(loan)
    }

    /// Recalls the workers lent to `borrower`, matching loans by identity.
    /// Returns how many came back; busy workers stay on loan.
    pub fn call_return_worker(&self, borrower: &Pipeline) -> SchedulerResult<usize> {
        if self.id() == borrower.id() {
            return self.refuse(SchedulerError::SamePipeline(self.id()));
        }

        let (mut mine, mut theirs) = lock_pair(&self.shared, &borrower.shared);
        let outstanding: Vec<Loan> = mine
            .loans
            .iter()
            .filter(|loan| loan.borrower == borrower.id())
            .copied()
            .collect();

        if outstanding.is_empty() {
            drop((mine, theirs));
            return self.refuse(SchedulerError::NoLoan {
                lender: self.id(),
                borrower: borrower.id(),
            });
        }

        let mut returned = 0;
        let mut still_busy = None;

        for loan in outstanding {
            let Some(index) = theirs.workers.iter().position(|w| w.id() == loan.worker) else {
                log::warn!("Worker {} on loan to pipeline {} no longer exists", loan.worker, loan.borrower);
                mine.loans.retain(|l| *l != loan);
                continue;
            };

            if theirs.workers[index].reset(Some(self.shared.clone())).is_err() {
                still_busy.get_or_insert(loan.worker);
                continue;
            }

            let worker = theirs.workers.remove(index);
            mine.loans.retain(|l| *l != loan);
            theirs.borrowed.retain(|l| *l != loan);
            mine.workers.push(worker);
            returned += 1;
        }

        if returned > 0 {
            borrower.shared.available.notify_all();
            self.shared.available.notify_all();
            log::debug!("Pipeline {} recalled {} workers from pipeline {}", self.id(), returned, borrower.id());
        }

        match still_busy {
            Some(worker) if returned == 0 => Err(SchedulerError::WorkerBusy(worker)),
            _ => Ok(returned),
        }
    }

    /// Drops loan records that point at `borrower`, for when it is gone.
    pub(crate) fn forget_loans_to(&self, borrower: PipelineId) -> usize {
        let mut state = self.shared.state.lock();
        let before = state.loans.len();
        state.loans.retain(|loan| loan.borrower != borrower);
        before - state.loans.len()
    }

    /// Keeps the workers borrowed from `lender` for good, for when it is gone.
    pub(crate) fn adopt_loans_from(&self, lender: PipelineId) -> usize {
        let mut state = self.shared.state.lock();
        let before = state.borrowed.len();
        state.borrowed.retain(|loan| loan.lender != lender);
        before - state.borrowed.len()
    }

    pub(crate) fn close(&self) {
        self.shared.state.lock().accepting = false;
    }

    /// Stops accepting jobs, discards the queued ones, then stops and joins
    /// every worker. Jobs already running finish first. Returns the number
    /// of workers joined.
    pub fn shutdown(&self) -> usize {
        let (discarded, workers) = {
            let mut state = self.shared.state.lock();
            state.accepting = false;
            let jobs: Vec<Job> = state.jobs.drain(..).collect();
            let workers = std::mem::take(&mut state.workers);
            state.borrowed.clear();
            (jobs, workers)
        };

        if !discarded.is_empty() {
            log::warn!(
                "Pipeline {} shutting down with {} queued jobs, discarding them",
                self.id(),
                discarded.len()
            );
            self.shared.counters.record_discard(discarded.len() as u64);
            for job in discarded {
                job.discard();
            }
        }

        for worker in &workers {
            worker.request_stop();
        }
        let joined = workers.len();
        drop(workers);

        self.shared.drained.notify_all();
        if joined > 0 {
            log::debug!("Pipeline {} joined {} workers", self.id(), joined);
        }
        joined
    }

    fn refuse<T>(&self, error: SchedulerError) -> SchedulerResult<T> {
        log::warn!("Pipeline {}: {}", self.id(), error);
        Err(error)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Pipeline")
            .field("id", &self.shared.id)
            .field("pending", &state.jobs.len())
            .field("workers", &state.workers.len())
            .field("loans", &state.loans)
            .field("borrowed", &state.borrowed)
            .field("accepting", &state.accepting)
            .finish()
    }
}

fn lock_pair<'a>(
    first: &'a PipelineShared,
    second: &'a PipelineShared,
) -> (MutexGuard<'a, PipelineState>, MutexGuard<'a, PipelineState>) {
    if first.id < second.id {
        let a = first.state.lock();
        let b = second.state.lock();
        (a, b)
    } else {
        let b = second.state.lock();
        let a = first.state.lock();
        (a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::result::JobStatus;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier};
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn pipeline(id: u32, workers: usize) -> Pipeline {
        Pipeline::new(PipelineId(id), workers, &WorkerOptions::default()).unwrap()
    }

    fn popped_priorities(pipeline: &Pipeline) -> Vec<u8> {
        std::iter::from_fn(|| pipeline.pop_job()).map(|job| job.priority()).collect()
    }

    #[test]
    fn test_fifo_preserves_submission_order() {
        let p = pipeline(1, 0);
        for priority in [3, 1, 2] {
            p.push_job(Job::new(|| {}).with_priority(priority)).unwrap();
        }

        p.sort_jobs(ScheduleStrategy::Fifo);
        assert_eq!(popped_priorities(&p), vec![3, 1, 2]);
        assert!(p.pop_job().is_none());
    }

    #[test]
    fn test_lifo_reverses_pending_jobs() {
        let p = pipeline(1, 0);
        for priority in [1, 2, 3] {
            p.push_job(Job::new(|| {}).with_priority(priority)).unwrap();
        }

        p.sort_jobs(ScheduleStrategy::Lifo);
        assert_eq!(popped_priorities(&p), vec![3, 2, 1]);
    }

    #[test]
    fn test_priority_sort_is_strictly_descending() {
        let p = pipeline(1, 0);
        for priority in [4, 9, 0, 7, 2, 5] {
            p.push_job(Job::new(|| {}).with_priority(priority)).unwrap();
        }

        p.sort_jobs(ScheduleStrategy::Priority);
        assert_eq!(popped_priorities(&p), vec![9, 7, 5, 4, 2, 0]);
    }

    #[test]
    fn test_priority_sort_is_stable() {
        let p = pipeline(1, 0);
        let mut ids = Vec::new();
        for priority in [1, 5, 1, 5, 1] {
            let job = Job::new(|| {}).with_priority(priority);
            ids.push((priority, job.id()));
            p.push_job(job).unwrap();
        }

        p.sort_jobs(ScheduleStrategy::Priority);
        let popped: Vec<_> = std::iter::from_fn(|| p.pop_job()).map(|j| j.id()).collect();
        let expected: Vec<_> = ids
            .iter()
            .filter(|(p, _)| *p == 5)
            .chain(ids.iter().filter(|(p, _)| *p == 1))
            .map(|(_, id)| *id)
            .collect();
        assert_eq!(popped, expected);
    }

    #[test]
    fn test_jobs_after_sort_are_appended_unsorted() {
        let p = pipeline(1, 0);
        p.push_job(Job::new(|| {}).with_priority(1)).unwrap();
        p.push_job(Job::new(|| {}).with_priority(5)).unwrap();
        p.sort_jobs(ScheduleStrategy::Priority);
        p.push_job(Job::new(|| {}).with_priority(9)).unwrap();

        assert_eq!(popped_priorities(&p), vec![5, 1, 9]);
    }

    #[test]
    fn test_push_after_shutdown_is_refused() {
        let p = pipeline(1, 1);
        assert_eq!(p.shutdown(), 1);

        let result = p.push_job(Job::new(|| {}));
        assert_eq!(result.unwrap_err(), SchedulerError::ShuttingDown(PipelineId(1)));
        assert!(!p.is_accepting());
    }

    #[test]
    fn test_shutdown_discards_queued_jobs() {
        let p = pipeline(1, 2);
        p.pause();
        let handles: Vec<_> = (0..3).map(|_| p.push_job(Job::new(|| {})).unwrap()).collect();

        assert_eq!(p.shutdown(), 2);
        for handle in handles {
            assert_eq!(handle.status(), JobStatus::Discarded);
            assert!(!handle.is_finished());
        }
        assert_eq!(p.stats().discarded, 3);
        assert_eq!(p.worker_count(), 0);
    }

    #[test]
    fn test_idle_and_drained_are_distinct() {
        let p = pipeline(1, 1);
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        p.push_job(Job::new(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }))
        .unwrap();
        started_rx.recv_timeout(TIMEOUT).unwrap();

        assert!(p.is_idle());
        assert!(!p.is_drained());
        assert_eq!(p.busy_count(), 1);

        release_tx.send(()).unwrap();
        assert!(p.wait_until_drained(TIMEOUT));
        assert!(p.is_drained());
        assert_eq!(p.busy_count(), 0);
    }

    #[test]
    fn test_paused_pipeline_holds_jobs() {
        let p = pipeline(1, 1);
        p.pause();
        let handle = p.push_job(Job::new(|| {})).unwrap();

        assert_eq!(handle.wait_timeout(Duration::from_millis(50)), None);
        assert_eq!(p.pending_count(), 1);

        p.resume();
        assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobStatus::Completed));
    }

    #[test]
    fn test_borrow_and_return_restore_worker_counts() {
        let a = pipeline(1, 2);
        let b = pipeline(2, 1);

        let loan = a.borrow_worker(&b).unwrap();
        assert_eq!(loan.lender, PipelineId(1));
        assert_eq!(loan.borrower, PipelineId(2));
        assert_eq!(a.worker_count(), 1);
        assert_eq!(b.worker_count(), 2);
        assert_eq!(a.loans(), vec![loan]);
        assert_eq!(b.borrowed(), vec![loan]);

        assert_eq!(a.call_return_worker(&b), Ok(1));
        assert_eq!(a.worker_count(), 2);
        assert_eq!(b.worker_count(), 1);
        assert!(a.loans().is_empty());
        assert!(b.borrowed().is_empty());
    }

    #[test]
    fn test_borrowed_worker_runs_borrower_jobs() {
        let a = pipeline(1, 2);
        let b = pipeline(2, 0);
        a.borrow_worker(&b).unwrap();

        let handle = b.push_job(Job::new(|| {})).unwrap();
        assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobStatus::Completed));
    }

    #[test]
    fn test_return_matches_loans_by_borrower() {
        let a = pipeline(1, 3);
        let b = pipeline(2, 1);
        let c = pipeline(3, 1);

        let to_b = a.borrow_worker(&b).unwrap();
        let to_c = a.borrow_worker(&c).unwrap();

        assert_eq!(a.call_return_worker(&c), Ok(1));
        assert_eq!(a.loans(), vec![to_b]);
        assert!(a.worker_ids().contains(&to_c.worker));
        assert!(b.worker_ids().contains(&to_b.worker));
        assert_eq!(c.worker_count(), 1);
    }

    #[test]
    fn test_return_without_loan_is_refused() {
        let a = pipeline(1, 2);
        let b = pipeline(2, 1);

        let err = a.call_return_worker(&b).unwrap_err();
        assert_eq!(err, SchedulerError::NoLoan { lender: PipelineId(1), borrower: PipelineId(2) });
        assert_eq!(a.worker_count(), 2);
        assert_eq!(b.worker_count(), 1);
    }

    #[test]
    fn test_last_worker_is_never_lent() {
        let a = pipeline(1, 1);
        let b = pipeline(2, 1);

        assert_eq!(a.borrow_worker(&b), Err(SchedulerError::LastWorker(PipelineId(1))));
        assert_eq!(a.borrow_worker(&a), Err(SchedulerError::SamePipeline(PipelineId(1))));
    }

    #[test]
    fn test_borrowed_worker_is_not_relent() {
        let a = pipeline(1, 2);
        let b = pipeline(2, 1);
        let c = pipeline(3, 1);
        let loan = a.borrow_worker(&b).unwrap();

        // b owns one worker of its own, so it may not lend anything.
        assert_eq!(b.borrow_worker(&c), Err(SchedulerError::LastWorker(PipelineId(2))));
        assert!(b.worker_ids().contains(&loan.worker));
    }

    #[test]
    fn test_transfer_out_and_in() {
        let a = pipeline(1, 2);
        let b = pipeline(2, 0);

        let worker = a.transfer_out_worker().unwrap();
        let id = worker.id();
        assert_eq!(a.worker_count(), 1);

        let handle = b.push_job(Job::new(|| {})).unwrap();
        b.transfer_in_worker(worker).unwrap();
        assert_eq!(b.worker_ids(), vec![id]);
        assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobStatus::Completed));
    }

    #[test]
    fn test_transfer_in_refuses_busy_worker() {
        let home = pipeline(1, 0);
        let other = pipeline(2, 0);
        let worker = Worker::spawn(&WorkerOptions::default(), Some(home.shared().clone())).unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        home.push_job(Job::new(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }))
        .unwrap();
        started_rx.recv_timeout(TIMEOUT).unwrap();

        let rejected = other.transfer_in_worker(worker).unwrap_err();
        assert_eq!(rejected.error, SchedulerError::WorkerBusy(rejected.worker.id()));
        assert_eq!(other.worker_count(), 0);

        release_tx.send(()).unwrap();
        assert!(home.wait_until_drained(TIMEOUT));
        drop(rejected);
    }

    #[test]
    fn test_affined_jobs_run_on_dedicated_worker() {
        let p = pipeline(1, 3);
        let dedicated = p.request_dedicated_worker().unwrap();
        let expected = format!("job-worker-{}", dedicated);

        p.pause();
        let runners = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..6 {
            let runners = runners.clone();
            p.push_job(Job::new(move || {
                let name = thread::current().name().unwrap_or_default().to_string();
                runners.lock().push(name);
            })
            .with_affinity(dedicated))
            .unwrap();
        }
        p.resume();

        assert!(p.wait_until_drained(TIMEOUT));
        let runners = runners.lock();
        assert_eq!(runners.len(), 6);
        assert!(runners.iter().all(|name| *name == expected));
    }

    #[test]
    fn test_release_dedicated_worker_frees_affined_jobs() {
        let p = pipeline(1, 2);
        let dedicated = p.request_dedicated_worker().unwrap();
        let other = p.worker_ids().into_iter().find(|id| *id != dedicated).unwrap();

        p.pause();
        let handle = p.push_job(Job::new(|| {}).with_affinity(dedicated)).unwrap();
        assert!(p.shared().state.lock().claim(other, false).is_none());

        p.release_dedicated_worker(dedicated).unwrap();
        assert_eq!(p.shared().state.lock().jobs[0].affinity(), None);
        assert_eq!(
            p.release_dedicated_worker(other),
            Err(SchedulerError::UnknownWorker { pipeline: PipelineId(1), worker: other })
        );

        p.resume();
        assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobStatus::Completed));
    }

    #[test]
    fn test_dedicated_worker_is_never_lent() {
        let a = pipeline(1, 2);
        let b = pipeline(2, 1);
        let dedicated = a.request_dedicated_worker().unwrap();

        let loan = a.borrow_worker(&b).unwrap();
        assert_ne!(loan.worker, dedicated);
        assert!(a.worker_ids().contains(&dedicated));

        let handle = a.push_job(Job::new(|| {}).with_affinity(dedicated)).unwrap();
        assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobStatus::Completed));
        assert_eq!(a.release_dedicated_worker(dedicated), Ok(()));

        let c = pipeline(3, 2);
        let d = pipeline(4, 1);
        c.request_dedicated_worker().unwrap();
        c.request_dedicated_worker().unwrap();
        assert_eq!(c.borrow_worker(&d), Err(SchedulerError::NoIdleWorker(PipelineId(3))));
        assert_eq!(d.worker_count(), 1);
    }

    #[test]
    fn test_transfer_out_keeps_affined_jobs_runnable() {
        let p = pipeline(1, 2);
        let dedicated = p.request_dedicated_worker().unwrap();

        p.pause();
        let handle = p.push_job(Job::new(|| {}).with_affinity(dedicated)).unwrap();

        let departed = p.transfer_out_worker().unwrap();
        assert_ne!(departed.id(), dedicated);
        assert_eq!(
            p.transfer_out_worker().unwrap_err(),
            SchedulerError::NoIdleWorker(PipelineId(1))
        );

        p.resume();
        assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobStatus::Completed));
        assert!(p.wait_until_drained(TIMEOUT));
    }

    #[test]
    fn test_unknown_affinity_is_dropped() {
        let p = pipeline(1, 2);
        let plain = p.worker_ids()[0];

        p.pause();
        p.push_job(Job::new(|| {}).with_affinity(plain)).unwrap();
        p.push_jobs(vec![Job::new(|| {}).with_affinity(WorkerId(99_999))]).unwrap();
        let handle = p.push_job(Job::new(|| {}).with_affinity(WorkerId(99_999))).unwrap();
        assert!(p.shared().state.lock().jobs.iter().all(|job| job.affinity().is_none()));

        p.resume();
        assert_eq!(handle.wait_timeout(TIMEOUT), Some(JobStatus::Completed));
        assert!(p.wait_until_drained(TIMEOUT));
    }

    #[test]
    fn test_busy_loaned_worker_stays_on_loan() {
        let a = pipeline(1, 2);
        let b = pipeline(2, 0);
        let loan = a.borrow_worker(&b).unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        b.push_job(Job::new(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }))
        .unwrap();
        started_rx.recv_timeout(TIMEOUT).unwrap();

        assert_eq!(a.call_return_worker(&b), Err(SchedulerError::WorkerBusy(loan.worker)));
        assert_eq!(a.loans(), vec![loan]);
        assert_eq!(b.borrowed(), vec![loan]);
        assert_eq!(b.worker_ids(), vec![loan.worker]);

        release_tx.send(()).unwrap();
        assert!(b.wait_until_drained(TIMEOUT));
        assert_eq!(a.call_return_worker(&b), Ok(1));
        assert_eq!(a.worker_count(), 2);
        assert!(a.loans().is_empty());
    }

    #[test]
    fn test_stress_many_submitters() {
        const SUBMITTERS: usize = 8;
        const PER_SUBMITTER: usize = 1_250;
        const TOTAL: usize = SUBMITTERS * PER_SUBMITTER;

        let p = pipeline(1, 4);
        let runs: Arc<Vec<AtomicU32>> = Arc::new((0..TOTAL).map(|_| AtomicU32::new(0)).collect());
        let finished = Arc::new(AtomicUsize::new(0));
        let barrier = Barrier::new(SUBMITTERS);

        let handles: Vec<JobHandle> = thread::scope(|scope| {
            let submitters: Vec<_> = (0..SUBMITTERS)
                .map(|s| {
                    let (p, runs, finished, barrier) = (&p, &runs, &finished, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        (0..PER_SUBMITTER)
                            .map(|i| {
                                let slot = s * PER_SUBMITTER + i;
                                let runs = runs.clone();
                                let finished = finished.clone();
                                p.push_job(Job::new(move || {
                                    runs[slot].fetch_add(1, Ordering::SeqCst);
                                    finished.fetch_add(1, Ordering::SeqCst);
                                }))
                                .unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            submitters.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        assert!(p.wait_until_drained(Duration::from_secs(60)));
        assert!(p.is_idle());
        assert_eq!(p.busy_count(), 0);
        assert_eq!(finished.load(Ordering::SeqCst), TOTAL);
        assert!(runs.iter().all(|count| count.load(Ordering::SeqCst) == 1));
        assert_eq!(handles.iter().filter(|h| h.is_finished()).count(), TOTAL);

        let stats = p.stats();
        assert_eq!(stats.submitted, TOTAL as u64);
        assert_eq!(stats.completed, TOTAL as u64);
    }
}
