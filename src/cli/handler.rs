// Fri Oct 16 2026 - Alex

use super::args::{Args, Command, ConfigArgs, RunArgs};
use crate::config::SchedulerConfig;
use crate::engine::{Job, JobHandle, JobPriority, PipelineId, PipelineStats, Scheduler, SchedulerHandle};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct CommandHandler;

impl CommandHandler {
    pub fn new() -> Self {
        Self
    }

    pub fn execute(&self, args: Args) -> anyhow::Result<()> {
        self.setup_logging(&args)?;

        match args.command {
            Command::Run(run_args) => self.handle_run(run_args, args.quiet),
            Command::Config(config_args) => self.handle_config(config_args),
        }
    }

    fn setup_logging(&self, args: &Args) -> anyhow::Result<()> {
        let level = if args.quiet {
            log::LevelFilter::Error
        } else {
            match args.log_level.to_lowercase().as_str() {
                "trace" => log::LevelFilter::Trace,
                "debug" => log::LevelFilter::Debug,
                "info" => log::LevelFilter::Info,
                "warn" => log::LevelFilter::Warn,
                "error" => log::LevelFilter::Error,
                _ => log::LevelFilter::Info,
            }
        };

        env_logger::Builder::new()
            .filter_level(level)
            .format_timestamp(None)
            .try_init()?;

        Ok(())
    }

    fn load_config(&self, path: Option<&Path>) -> anyhow::Result<SchedulerConfig> {
        match path {
            Some(path) => Ok(SchedulerConfig::from_json_file(path)?),
            None => Ok(SchedulerConfig::default()),
        }
    }

    fn handle_config(&self, args: ConfigArgs) -> anyhow::Result<()> {
        let config = self.load_config(args.config.as_deref())?;
        config.validate().map_err(|e| anyhow::anyhow!(e))?;
        println!("{}", config.to_json()?);
        Ok(())
    }

    fn handle_run(&self, args: RunArgs, quiet: bool) -> anyhow::Result<()> {
        args.validate().map_err(|e| anyhow::anyhow!(e))?;

        let mut config = self.load_config(args.config.as_deref())?.with_default_strategy(args.strategy);
        if let Some(budget) = args.budget {
            config = config.with_worker_budget(budget);
        }

        let scheduler = Scheduler::create(config)?;
        let result = self.run_workload(&scheduler, &args, quiet);
        Scheduler::destroy(scheduler);
        result
    }

    fn run_workload(&self, scheduler: &SchedulerHandle, args: &RunArgs, quiet: bool) -> anyhow::Result<()> {
        let started = Instant::now();

        let mut pipelines = vec![PipelineId::DEFAULT];
        while pipelines.len() < args.pipelines {
            match scheduler.create_new_pipeline() {
                Ok(id) => pipelines.push(id),
                Err(e) => {
                    log::warn!("Stopping at {} pipelines: {}", pipelines.len(), e);
                    break;
                }
            }
        }

        // Hand whatever budget is left to the default pipeline.
        let spare = scheduler.available_workers();
        if spare > 0 {
            scheduler.grow_pipeline(PipelineId::DEFAULT, spare)?;
        }

        if !quiet {
            println!(
                "{} Running {} jobs across {} pipelines ({} strategy)",
                "[*]".blue(),
                args.jobs,
                pipelines.len(),
                args.strategy.name()
            );
        }

        for &id in &pipelines {
            scheduler.pause_pipeline(id)?;
        }

        let mut handles = Vec::with_capacity(args.jobs);
        for index in 0..args.jobs {
            let id = pipelines[index % pipelines.len()];
            handles.push(scheduler.submit_to(synthetic_job(index, args.fail_every), id)?);
        }

        scheduler.sort_all_default()?;
        for &id in &pipelines {
            scheduler.resume_pipeline(id)?;
        }

        let progress = (!args.no_progress && !quiet).then(|| progress_bar(handles.len() as u64)).transpose()?;
        self.track(&handles, progress.as_ref());

        if !scheduler.wait_idle(IDLE_TIMEOUT) {
            anyhow::bail!("Pipelines did not drain within {}s", IDLE_TIMEOUT.as_secs());
        }
        if let Some(bar) = &progress {
            bar.finish_with_message("Complete!");
        }

        if !quiet {
            self.print_stats(scheduler, &pipelines)?;
            println!(
                "{} Finished in {:.2}s",
                "[+]".green(),
                started.elapsed().as_secs_f64()
            );
        }

        Ok(())
    }

    fn track(&self, handles: &[JobHandle], progress: Option<&ProgressBar>) {
        let Some(bar) = progress else {
            return;
        };

        let deadline = Instant::now() + IDLE_TIMEOUT;
        loop {
            let settled = handles.iter().filter(|h| !h.status().is_pending()).count();
            bar.set_position(settled as u64);
            if settled == handles.len() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn print_stats(&self, scheduler: &SchedulerHandle, pipelines: &[PipelineId]) -> anyhow::Result<()> {
        println!();
        println!("{}", "Pipeline Stats".cyan().bold());
        println!("{}", "-".repeat(64).cyan());

        for &id in pipelines {
            let stats = scheduler.pipeline_stats(id)?;
            let workers = scheduler.worker_count(id)?;
            print_row(&format!("pipeline {}", id), workers, &stats);
        }

        println!("{}", "-".repeat(64).cyan());
        print_row("total", scheduler.config().worker_budget, &scheduler.total_stats());
        Ok(())
    }
}

impl Default for CommandHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn print_row(label: &str, workers: usize, stats: &PipelineStats) {
    let rate = format!("{:.1}%", stats.success_rate() * 100.0);
    let rate = if stats.failed == 0 { rate.green() } else { rate.yellow() };

    println!(
        "  {:<12} workers {:>3}  done {:>6}  failed {:>4}  avg {:>8.3}ms  ok {}",
        label.cyan(),
        workers,
        stats.completed,
        stats.failed.to_string().red(),
        stats.average_job_time_ms,
        rate
    );
}

fn progress_bar(total: u64) -> anyhow::Result<ProgressBar> {
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")?
        .progress_chars("█▓▒░ ");

    let bar = ProgressBar::new(total);
    bar.set_style(style);
    bar.set_message("Running jobs...");
    Ok(bar)
}

/// A small checksum loop standing in for real work.
fn synthetic_job(index: usize, fail_every: usize) -> Job {
    let priority = (index % 10) as JobPriority;
    let fails = fail_every > 0 && (index + 1) % fail_every == 0;

    Job::fallible(move || {
        let mut checksum: u64 = index as u64;
        for round in 0..20_000u64 {
            checksum = checksum.rotate_left(5) ^ round.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        }
        std::hint::black_box(checksum);

        if fails {
            anyhow::bail!("synthetic job {} failed on purpose", index);
        }
        Ok(())
    })
    .with_priority(priority)
}
