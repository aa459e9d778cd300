// Fri Oct 16 2026 - Alex

use crate::config::SchedulerConfig;
use crate::engine::error::{SchedulerError, SchedulerResult};
use crate::engine::job::Job;
use crate::engine::pipeline::PipelineShared;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u32);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Executing,
    Stopped,
}

/// Thread settings applied to every worker a pipeline spawns.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            thread_name_prefix: "job-worker".to_string(),
            stack_size: None,
        }
    }
}

impl From<&SchedulerConfig> for WorkerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            thread_name_prefix: config.thread_name_prefix.clone(),
            stack_size: config.worker_stack_size,
        }
    }
}

struct Control {
    pipeline: Option<Arc<PipelineShared>>,
    busy: bool,
    stop: bool,
    dedicated: bool,
}

impl Control {
    fn is_bound_to(&self, pipeline: &Arc<PipelineShared>) -> bool {
        self.pipeline
            .as_ref()
            .map_or(false, |bound| Arc::ptr_eq(bound, pipeline))
    }
}

struct WorkerShared {
    id: WorkerId,
    control: Mutex<Control>,
    parked: Condvar,
    executed: AtomicU64,
}

/// One dedicated OS thread draining jobs from the pipeline it is bound to.
///
/// Lock order is always pipeline state first, then the worker's control
/// lock. The control lock guards both the busy flag and the binding, so a
/// worker can only be re-parented while it is provably idle.
pub struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(
        options: &WorkerOptions,
        pipeline: Option<Arc<PipelineShared>>,
    ) -> SchedulerResult<Self> {
        static NEXT_ID: AtomicU32 = AtomicU32::new(1);

        let id = WorkerId(NEXT_ID.fetch_add(1, Ordering::SeqCst));
        let shared = Arc::new(WorkerShared {
            id,
            control: Mutex::new(Control {
                pipeline,
                busy: false,
                stop: false,
                dedicated: false,
            }),
            parked: Condvar::new(),
            executed: AtomicU64::new(0),
        });

        let mut builder = thread::Builder::new().name(format!("{}-{}", options.thread_name_prefix, id));
        if let Some(stack_size) = options.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let thread_shared = shared.clone();
        let handle = builder
            .spawn(move || thread_shared.run())
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;

        Ok(Self {
            shared,
            thread: Some(handle),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn is_busy(&self) -> bool {
        self.shared.control.lock().busy
    }

    pub fn is_dedicated(&self) -> bool {
        self.shared.control.lock().dedicated
    }

    pub fn state(&self) -> WorkerState {
        let ctl = self.shared.control.lock();
        if ctl.stop {
            WorkerState::Stopped
        } else if ctl.busy {
            WorkerState::Executing
        } else {
            WorkerState::Idle
        }
    }

    pub fn jobs_executed(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_dedicated(&self, dedicated: bool) {
        self.shared.control.lock().dedicated = dedicated;
    }

    /// Re-parents the worker onto `target`, or parks it when `target` is `None`.
    ///
    /// The caller must hold the state lock of the pipeline the worker is
    /// currently bound to (if any) and notify that pipeline afterwards, so a
    /// worker waiting there wakes up and notices the new binding.
    pub(crate) fn reset(&self, target: Option<Arc<PipelineShared>>) -> SchedulerResult<()> {
        let mut ctl = self.shared.control.lock();
        if ctl.busy {
            log::warn!("Refusing to re-parent worker {} while it is executing a job", self.shared.id);
            return Err(SchedulerError::WorkerBusy(self.shared.id));
        }

        ctl.pipeline = target;
        self.shared.parked.notify_all();
        Ok(())
    }

    /// Requests a stop and joins the thread. A job already running finishes first.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };

        self.request_stop();
        if handle.join().is_err() {
            log::error!("Worker {} thread terminated abnormally", self.shared.id);
        }
    }

    pub(crate) fn request_stop(&self) {
        let bound = self.shared.control.lock().pipeline.clone();

        // Flip the flag under the pipeline lock so a worker between its check
        // and its wait cannot miss the notification.
        if let Some(pipeline) = bound {
            let _state = pipeline.state.lock();
            self.shared.control.lock().stop = true;
            pipeline.available.notify_all();
        }

        let mut ctl = self.shared.control.lock();
        ctl.stop = true;
        self.shared.parked.notify_all();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("jobs_executed", &self.jobs_executed())
            .finish()
    }
}

impl WorkerShared {
    fn run(&self) {
        log::debug!("Worker {} started", self.id);

        while let Some(pipeline) = self.wait_for_binding() {
            if let Some(job) = self.claim_from(&pipeline) {
                self.execute(&pipeline, job);
            }
        }

        log::debug!("Worker {} stopped", self.id);
    }

    fn wait_for_binding(&self) -> Option<Arc<PipelineShared>> {
        let mut ctl = self.control.lock();
        loop {
            if ctl.stop {
                return None;
            }
            if let Some(pipeline) = &ctl.pipeline {
                return Some(pipeline.clone());
            }
            self.parked.wait(&mut ctl);
        }
    }

    /// Blocks on the pipeline until a job this worker may run shows up.
    /// Returns `None` when the worker is stopped or re-parented meanwhile.
    fn claim_from(&self, pipeline: &Arc<PipelineShared>) -> Option<Job> {
        let mut state = pipeline.state.lock();
        loop {
            {
                let mut ctl = self.control.lock();
                if ctl.stop {
                    return None;
                }
                if !ctl.is_bound_to(pipeline) {
                    drop(ctl);
                    // Pass on a wakeup this worker may have consumed.
                    if !state.jobs.is_empty() {
                        pipeline.available.notify_one();
                    }
                    return None;
                }
                if let Some(job) = state.claim(self.id, ctl.dedicated) {
                    ctl.busy = true;
                    state.in_flight += 1;
                    return Some(job);
                }
            }
            pipeline.available.wait(&mut state);
        }
    }

    fn execute(&self, pipeline: &Arc<PipelineShared>, mut job: Job) {
        let started = Instant::now();
        let status = job.execute();
        drop(job);

        self.executed.fetch_add(1, Ordering::Relaxed);
        pipeline.counters.record_outcome(&status, started.elapsed());

        let mut state = pipeline.state.lock();
        state.in_flight -= 1;
        self.control.lock().busy = false;
        if state.is_drained() {
            pipeline.drained.notify_all();
        }
    }
}
