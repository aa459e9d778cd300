// Fri Oct 16 2026 - Alex

use crate::engine::pipeline::PipelineId;
use crate::engine::worker::WorkerId;
use thiserror::Error;

/// Coarse classification of everything that can go wrong in the job core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad identifiers, exhausted budget, unusable configuration.
    Configuration,
    /// The operation is not legal in the current state of a worker or pipeline.
    State,
    /// A job's own callable failed.
    Runtime,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(PipelineId),

    #[error("Worker budget exhausted: {requested} requested, {available} available")]
    BudgetExhausted { requested: usize, available: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("The default pipeline cannot be destroyed")]
    DefaultPipeline,

    #[error("Scheduler has been destroyed")]
    Destroyed,

    #[error("Worker {0} is busy")]
    WorkerBusy(WorkerId),

    #[error("No idle worker available in pipeline {0}")]
    NoIdleWorker(PipelineId),

    #[error("Pipeline {0} is shutting down")]
    ShuttingDown(PipelineId),

    #[error("No loan recorded from pipeline {lender} to pipeline {borrower}")]
    NoLoan { lender: PipelineId, borrower: PipelineId },

    #[error("Pipeline {0} still has pending or in-flight jobs")]
    NotDrained(PipelineId),

    #[error("Pipeline {0} cannot lend a worker to itself")]
    SamePipeline(PipelineId),

    #[error("Pipeline {0} cannot give up its last worker")]
    LastWorker(PipelineId),

    #[error("Worker {worker} is not owned by pipeline {pipeline}")]
    UnknownWorker { pipeline: PipelineId, worker: WorkerId },

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::UnknownPipeline(_)
            | SchedulerError::BudgetExhausted { .. }
            | SchedulerError::InvalidConfig(_)
            | SchedulerError::DefaultPipeline
            | SchedulerError::Destroyed => ErrorKind::Configuration,
            SchedulerError::WorkerBusy(_)
            | SchedulerError::NoIdleWorker(_)
            | SchedulerError::ShuttingDown(_)
            | SchedulerError::NoLoan { .. }
            | SchedulerError::NotDrained(_)
            | SchedulerError::SamePipeline(_)
            | SchedulerError::LastWorker(_)
            | SchedulerError::UnknownWorker { .. }
            | SchedulerError::Spawn(_) => ErrorKind::State,
        }
    }

    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    pub fn is_state(&self) -> bool {
        self.kind() == ErrorKind::State
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
