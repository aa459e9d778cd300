// Fri Oct 16 2026 - Alex

use crate::engine::pipeline::ScheduleStrategy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Total number of worker threads shared by every pipeline.
    pub worker_budget: usize,
    pub default_pipeline_workers: usize,
    pub thread_name_prefix: String,
    pub worker_stack_size: Option<usize>,
    pub default_strategy: ScheduleStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_budget: num_cpus::get(),
            default_pipeline_workers: 1,
            thread_name_prefix: "job-worker".to_string(),
            worker_stack_size: None,
            default_strategy: ScheduleStrategy::Fifo,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_budget(mut self, budget: usize) -> Self {
        self.worker_budget = budget;
        self
    }

    pub fn with_default_pipeline_workers(mut self, workers: usize) -> Self {
        self.default_pipeline_workers = workers;
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_worker_stack_size(mut self, bytes: usize) -> Self {
        self.worker_stack_size = Some(bytes);
        self
    }

    pub fn with_default_strategy(mut self, strategy: ScheduleStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.worker_budget == 0 {
            return Err("worker_budget must be greater than 0".to_string());
        }
        if self.default_pipeline_workers == 0 {
            return Err("default_pipeline_workers must be greater than 0".to_string());
        }
        if self.default_pipeline_workers > self.worker_budget {
            return Err(format!(
                "default_pipeline_workers ({}) exceeds worker_budget ({})",
                self.default_pipeline_workers, self.worker_budget
            ));
        }
        if self.thread_name_prefix.is_empty() {
            return Err("thread_name_prefix must not be empty".to_string());
        }
        if let Some(0) = self.worker_stack_size {
            return Err("worker_stack_size must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let ext = path.extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        if !ext.eq_ignore_ascii_case("json") {
            return Err(ConfigError::UnsupportedFormat(ext.to_string()));
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        serde_json::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))
    }
}
