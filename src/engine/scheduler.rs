// Fri Oct 16 2026 - Alex

use crate::config::SchedulerConfig;
use crate::engine::error::{SchedulerError, SchedulerResult};
use crate::engine::job::{Job, JobPriority};
use crate::engine::pipeline::{Loan, Pipeline, PipelineId, ScheduleStrategy};
use crate::engine::result::JobHandle;
use crate::engine::stats::PipelineStats;
use crate::engine::worker::{WorkerId, WorkerOptions};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

pub type SchedulerHandle = Arc<Scheduler>;

static LIVE_SCHEDULER: Lazy<Mutex<Weak<Scheduler>>> = Lazy::new(|| Mutex::new(Weak::new()));

struct Registry {
    pipelines: BTreeMap<PipelineId, Arc<Pipeline>>,
    next_id: u32,
    available_workers: usize,
    destroyed: bool,
}

impl Registry {
    fn get(&self, id: PipelineId) -> SchedulerResult<&Arc<Pipeline>> {
        self.pipelines.get(&id).ok_or(SchedulerError::UnknownPipeline(id))
    }
}

/// Owns every pipeline and the worker budget they share.
///
/// The registry lock is always taken before any pipeline lock.
pub struct Scheduler {
    config: SchedulerConfig,
    options: WorkerOptions,
    registry: Mutex<Registry>,
}

impl Scheduler {
    /// Builds the scheduler, or hands back the one that is already live.
    pub fn create(config: SchedulerConfig) -> SchedulerResult<SchedulerHandle> {
        let mut live = LIVE_SCHEDULER.lock();
        if let Some(existing) = live.upgrade().filter(|s| !s.is_destroyed()) {
            log::warn!("Scheduler is already live, returning the existing instance");
            return Ok(existing);
        }

        if let Err(e) = config.validate() {
            log::error!("Cannot create scheduler: {}", e);
            return Err(SchedulerError::InvalidConfig(e));
        }

        let scheduler = Arc::new(Self::new(config)?);
        *live = Arc::downgrade(&scheduler);
        log::info!(
            "Scheduler created with a budget of {} workers",
            scheduler.config.worker_budget
        );
        Ok(scheduler)
    }

    /// Tears down every pipeline and frees the slot for a later `create`.
    pub fn destroy(handle: SchedulerHandle) {
        handle.teardown();

        {
            let mut live = LIVE_SCHEDULER.lock();
            if std::ptr::eq(live.as_ptr(), Arc::as_ptr(&handle)) {
                *live = Weak::new();
            }
        }

        log::info!("Scheduler destroyed");
    }

    fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        let options = WorkerOptions::from(&config);
        let default = Pipeline::new(PipelineId::DEFAULT, config.default_pipeline_workers, &options)?;

        let mut pipelines = BTreeMap::new();
        pipelines.insert(PipelineId::DEFAULT, Arc::new(default));

        Ok(Self {
            registry: Mutex::new(Registry {
                pipelines,
                next_id: PipelineId::DEFAULT.0 + 1,
                available_workers: config.worker_budget - config.default_pipeline_workers,
                destroyed: false,
            }),
            options,
            config,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.registry.lock().destroyed
    }

    pub fn available_workers(&self) -> usize {
        self.registry.lock().available_workers
    }

    pub fn pipeline_ids(&self) -> Vec<PipelineId> {
        self.registry.lock().pipelines.keys().copied().collect()
    }

    /// Allocates a pipeline with one worker taken from the budget.
    pub fn create_new_pipeline(&self) -> SchedulerResult<PipelineId> {
        let mut registry = self.live_registry()?;
        if registry.available_workers == 0 {
            drop(registry);
            return refuse(SchedulerError::BudgetExhausted {
                requested: 1,
                available: 0,
            });
        }

        let id = PipelineId(registry.next_id);
        let pipeline = Pipeline::new(id, 1, &self.options)?;
        registry.next_id += 1;
        registry.available_workers -= 1;
        registry.pipelines.insert(id, Arc::new(pipeline));

        log::info!("Created pipeline {}", id);
        Ok(id)
    }

    pub fn grow_pipeline(&self, id: PipelineId, count: usize) -> SchedulerResult<Vec<WorkerId>> {
        let mut registry = self.live_registry()?;
        if registry.available_workers < count {
            let available = registry.available_workers;
            drop(registry);
            return refuse(SchedulerError::BudgetExhausted {
                requested: count,
                available,
            });
        }

        let pipeline = match registry.get(id) {
            Ok(pipeline) => pipeline.clone(),
            Err(e) => {
                drop(registry);
                return refuse(e);
            }
        };

        let added = pipeline.add_workers(count)?;
        registry.available_workers -= added.len();
        Ok(added)
    }

    /// Discards the pipeline's queued jobs, joins its workers and returns
    /// them to the budget. Workers it lent out come home first.
    pub fn destroy_pipeline(&self, id: PipelineId) -> SchedulerResult<()> {
        if id == PipelineId::DEFAULT {
            return refuse(SchedulerError::DefaultPipeline);
        }

        let registry = self.live_registry()?;
        self.remove_pipeline(registry, id)
    }

    /// Like [`Scheduler::destroy_pipeline`], but refuses while the pipeline
    /// still has pending or running jobs.
    pub fn destroy_pipeline_if_drained(&self, id: PipelineId) -> SchedulerResult<()> {
        if id == PipelineId::DEFAULT {
            return refuse(SchedulerError::DefaultPipeline);
        }

        let registry = self.live_registry()?;
        let drained = match registry.get(id) {
            Ok(pipeline) => pipeline.is_drained(),
            Err(e) => {
                drop(registry);
                return refuse(e);
            }
        };

        if !drained {
            drop(registry);
            return refuse(SchedulerError::NotDrained(id));
        }

        self.remove_pipeline(registry, id)
    }

    fn remove_pipeline(&self, mut registry: MutexGuard<'_, Registry>, id: PipelineId) -> SchedulerResult<()> {
        let Some(pipeline) = registry.pipelines.remove(&id) else {
            drop(registry);
            return refuse(SchedulerError::UnknownPipeline(id));
        };
        pipeline.close();

        let borrowers: BTreeSet<PipelineId> = pipeline.loans().iter().map(|l| l.borrower).collect();
        for borrower in borrowers {
            if let Some(other) = registry.pipelines.get(&borrower) {
                if let Err(e) = pipeline.call_return_worker(other) {
                    log::debug!("Pipeline {} left workers with pipeline {}: {}", id, borrower, e);
                }
            }
        }

        let lenders: BTreeSet<PipelineId> = pipeline.borrowed().iter().map(|l| l.lender).collect();
        for lender in lenders {
            if let Some(other) = registry.pipelines.get(&lender) {
                if let Err(e) = other.call_return_worker(&pipeline) {
                    log::debug!("Pipeline {} kept workers of pipeline {}: {}", id, lender, e);
                }
            }
        }

        for other in registry.pipelines.values() {
            let forgotten = other.forget_loans_to(id);
            let adopted = other.adopt_loans_from(id);
            if forgotten + adopted > 0 {
                log::warn!(
                    "Pipeline {} lost {} lent workers and kept {} borrowed workers when pipeline {} was destroyed",
                    other.id(),
                    forgotten,
                    adopted,
                    id
                );
            }
        }
        drop(registry);

        // Joining waits for in-flight jobs, which may themselves call back
        // into the scheduler, so the registry lock is released first.
        let joined = pipeline.shutdown();
        self.registry.lock().available_workers += joined;

        log::info!("Destroyed pipeline {} ({} workers returned)", id, joined);
        Ok(())
    }

    pub fn submit(&self, job: Job) -> SchedulerResult<JobHandle> {
        self.submit_to(job, PipelineId::DEFAULT)
    }

    pub fn submit_to(&self, job: Job, id: PipelineId) -> SchedulerResult<JobHandle> {
        let registry = self.live_registry()?;
        match registry.pipelines.get(&id) {
            Some(pipeline) => pipeline.push_job(job),
            None => {
                drop(registry);
                log::warn!("Cannot submit job {} to unknown pipeline {}", job.id(), id);
                Err(SchedulerError::UnknownPipeline(id))
            }
        }
    }

    pub fn submit_fn<F>(
        &self,
        f: F,
        priority: JobPriority,
        affinity: Option<WorkerId>,
        id: PipelineId,
    ) -> SchedulerResult<JobHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut job = Job::new(f).with_priority(priority);
        if let Some(worker) = affinity {
            job = job.with_affinity(worker);
        }
        self.submit_to(job, id)
    }

    pub fn submit_batch(&self, jobs: Vec<Job>, id: PipelineId) -> SchedulerResult<Vec<JobHandle>> {
        let registry = self.live_registry()?;
        match registry.get(id) {
            Ok(pipeline) => pipeline.push_jobs(jobs),
            Err(e) => {
                drop(registry);
                refuse(e)
            }
        }
    }

    /// Applies the same reorder to every pipeline's pending jobs.
    pub fn sort_jobs(&self, strategy: ScheduleStrategy) -> SchedulerResult<()> {
        let registry = self.live_registry()?;
        for pipeline in registry.pipelines.values() {
            pipeline.sort_jobs(strategy);
        }
        Ok(())
    }

    pub fn sort_all_default(&self) -> SchedulerResult<()> {
        self.sort_jobs(self.config.default_strategy)
    }

    pub fn borrow_worker(&self, lender: PipelineId, borrower: PipelineId) -> SchedulerResult<Loan> {
        self.with_pair(lender, borrower, |l, b| l.borrow_worker(b))
    }

    pub fn call_return_worker(&self, lender: PipelineId, borrower: PipelineId) -> SchedulerResult<usize> {
        self.with_pair(lender, borrower, |l, b| l.call_return_worker(b))
    }

    pub fn request_dedicated_worker(&self, id: PipelineId) -> SchedulerResult<WorkerId> {
        self.with_pipeline(id, |p| p.request_dedicated_worker())
    }

    pub fn release_dedicated_worker(&self, id: PipelineId, worker: WorkerId) -> SchedulerResult<()> {
        self.with_pipeline(id, |p| p.release_dedicated_worker(worker))
    }

    pub fn pause_pipeline(&self, id: PipelineId) -> SchedulerResult<()> {
        self.with_pipeline(id, |p| {
            p.pause();
            Ok(())
        })
    }

    pub fn resume_pipeline(&self, id: PipelineId) -> SchedulerResult<()> {
        self.with_pipeline(id, |p| {
            p.resume();
            Ok(())
        })
    }

    pub fn pending_count(&self, id: PipelineId) -> SchedulerResult<usize> {
        self.with_pipeline(id, |p| Ok(p.pending_count()))
    }

    pub fn worker_count(&self, id: PipelineId) -> SchedulerResult<usize> {
        self.with_pipeline(id, |p| Ok(p.worker_count()))
    }

    pub fn is_idle(&self, id: PipelineId) -> SchedulerResult<bool> {
        self.with_pipeline(id, |p| Ok(p.is_idle()))
    }

    pub fn is_drained(&self, id: PipelineId) -> SchedulerResult<bool> {
        self.with_pipeline(id, |p| Ok(p.is_drained()))
    }

    pub fn pipeline_stats(&self, id: PipelineId) -> SchedulerResult<PipelineStats> {
        self.with_pipeline(id, |p| Ok(p.stats()))
    }

    pub fn total_stats(&self) -> PipelineStats {
        let registry = self.registry.lock();
        let mut total = PipelineStats::default();
        for pipeline in registry.pipelines.values() {
            total.merge(&pipeline.stats());
        }
        total
    }

    /// Waits until every pipeline has nothing pending and nothing running.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let pipelines: Vec<Arc<Pipeline>> = self.registry.lock().pipelines.values().cloned().collect();

        pipelines.iter().all(|pipeline| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            pipeline.wait_until_drained(remaining)
        })
    }

    fn live_registry(&self) -> SchedulerResult<MutexGuard<'_, Registry>> {
        let registry = self.registry.lock();
        if registry.destroyed {
            drop(registry);
            return refuse(SchedulerError::Destroyed);
        }
        Ok(registry)
    }

    fn with_pipeline<T>(
        &self,
        id: PipelineId,
        f: impl FnOnce(&Pipeline) -> SchedulerResult<T>,
    ) -> SchedulerResult<T> {
        let registry = self.live_registry()?;
        match registry.get(id) {
            Ok(pipeline) => f(pipeline),
            Err(e) => {
                drop(registry);
                refuse(e)
            }
        }
    }

    fn with_pair<T>(
        &self,
        first: PipelineId,
        second: PipelineId,
        f: impl FnOnce(&Pipeline, &Pipeline) -> SchedulerResult<T>,
    ) -> SchedulerResult<T> {
        let registry = self.live_registry()?;
        let pair = registry.get(first).and_then(|a| registry.get(second).map(|b| (a, b)));
        match pair {
            Ok((a, b)) => f(a, b),
            Err(e) => {
                drop(registry);
                refuse(e)
            }
        }
    }

    fn teardown(&self) {
        let pipelines = {
            let mut registry = self.registry.lock();
            if registry.destroyed {
                return;
            }
            registry.destroyed = true;
            std::mem::take(&mut registry.pipelines)
        };

        for pipeline in pipelines.values().rev() {
            pipeline.shutdown();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("Scheduler")
            .field("pipelines", &registry.pipelines.keys().collect::<Vec<_>>())
            .field("available_workers", &registry.available_workers)
            .field("destroyed", &registry.destroyed)
            .finish()
    }
}

fn refuse<T>(error: SchedulerError) -> SchedulerResult<T> {
    log::warn!("Scheduler: {}", error);
    Err(error)
}
