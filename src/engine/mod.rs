// Fri Oct 16 2026 - Alex

pub mod error;
pub mod job;
pub mod pipeline;
pub mod result;
pub mod scheduler;
pub mod stats;
pub mod worker;

pub use error::{ErrorKind, SchedulerError, SchedulerResult};
pub use job::{Job, JobId, JobPriority};
pub use pipeline::{Loan, Pipeline, PipelineId, RejectedWorker, ScheduleStrategy};
pub use result::{JobFailure, JobHandle, JobStatus};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use stats::PipelineStats;
pub use worker::{Worker, WorkerId, WorkerOptions, WorkerState};
