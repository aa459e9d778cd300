// Fri Oct 16 2026 - Alex

pub mod cli;
pub mod config;
pub mod engine;

pub use config::{ConfigError, SchedulerConfig};
pub use engine::{
    Job, JobHandle, JobStatus, Pipeline, PipelineId, ScheduleStrategy, Scheduler, SchedulerError,
    SchedulerHandle, SchedulerResult, WorkerId,
};
