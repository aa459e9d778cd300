// Fri Oct 16 2026 - Alex

use crate::engine::pipeline::ScheduleStrategy;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "job-pipelines")]
#[command(author = "Alex")]
#[command(version = "1.0.0")]
#[command(about = "Multi-pipeline job scheduler with a shared worker budget", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Push synthetic jobs through a few pipelines and report their stats
    Run(RunArgs),
    /// Print the effective scheduler config as JSON
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    #[arg(short, long, default_value = "3")]
    pub pipelines: usize,

    #[arg(short, long, default_value = "200")]
    pub jobs: usize,

    /// Overrides the worker budget from the config
    #[arg(short, long)]
    pub budget: Option<usize>,

    #[arg(short, long, default_value = "priority")]
    pub strategy: ScheduleStrategy,

    /// Every Nth job fails on purpose, 0 disables
    #[arg(long, default_value = "25")]
    pub fail_every: usize,

    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl RunArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.pipelines == 0 {
            return Err("At least one pipeline is required".to_string());
        }
        if self.jobs == 0 {
            return Err("Job count must be at least 1".to_string());
        }
        if let Some(0) = self.budget {
            return Err("Worker budget must be at least 1".to_string());
        }
        if let Some(path) = &self.config {
            if !path.exists() {
                return Err(format!("Config file does not exist: {:?}", path));
            }
        }
        Ok(())
    }
}
