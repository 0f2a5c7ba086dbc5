use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, NaiveDate, Utc};
use fs2::FileExt;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::models::{ProcessMode, ProcessSummary, RunConfiguration};
use crate::processor::AccountProcessor;
use crate::run_config;

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    AlreadyRunning,
    Skipped(String),
    Completed(ProcessSummary),
}

/// Cron expressions (seconds first, UTC) for the two passes.
#[derive(Debug, Clone)]
pub struct Schedules {
    pub today_cron: String,
    pub full_cron: String,
    pub batch_size: usize,
}

/// Holds the flag, and the mode's lock file when there is one, for as long as a run is
/// in progress. The lock file keeps a manual run in another process out as well.
struct RunLatch<'a> {
    flag: &'a AtomicBool,
    lock: Option<File>,
}

impl<'a> RunLatch<'a> {
    fn acquire(flag: &'a AtomicBool, lock_path: Option<&Path>) -> Result<Option<Self>> {
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(None);
        }
        let mut latch = Self { flag, lock: None };
        let Some(path) = lock_path else {
            return Ok(Some(latch));
        };
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                latch.lock = Some(file);
                Ok(Some(latch))
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                debug!("{} is held by another process", path.display());
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
        }
    }
}

impl Drop for RunLatch<'_> {
    fn drop(&mut self) {
        if let Some(file) = &self.lock {
            if let Err(e) = FileExt::unlock(file) {
                warn!("Failed to release run lock: {}", e);
            }
        }
        self.flag.store(false, Ordering::Release);
    }
}

fn lock_file_name(mode: ProcessMode) -> &'static str {
    match mode {
        ProcessMode::RefreshToday => "tft-leaderboard-today.lock",
        ProcessMode::FullWindow => "tft-leaderboard-full.lock",
    }
}

/// Why a pass should not run today, if there is a reason.
pub fn skip_reason(config: &RunConfiguration, today: NaiveDate, grace_days: u64) -> Option<String> {
    if config.is_stop_job {
        return Some("processing is stopped".to_string());
    }
    let cutoff = config
        .end_date
        .checked_add_days(Days::new(grace_days))
        .unwrap_or(NaiveDate::MAX);
    (today > cutoff).then(|| format!("campaign ended on {}", config.end_date))
}

/// Single-flight wrapper around the processor, one latch per pass.
pub struct Scheduler {
    processor: AccountProcessor,
    run_config_path: PathBuf,
    grace_days: u64,
    lock_dir: Option<PathBuf>,
    today_running: AtomicBool,
    full_running: AtomicBool,
}

impl Scheduler {
    pub fn new(processor: AccountProcessor, run_config_path: PathBuf, grace_days: u64) -> Self {
        Self {
            processor,
            run_config_path,
            grace_days,
            lock_dir: None,
            today_running: AtomicBool::new(false),
            full_running: AtomicBool::new(false),
        }
    }

    /// Also single-flights each pass across processes through lock files in `dir`.
    pub fn with_lock_dir(mut self, dir: PathBuf) -> Self {
        self.lock_dir = Some(dir);
        self
    }

    fn lock_path(&self, mode: ProcessMode) -> Option<PathBuf> {
        self.lock_dir
            .as_ref()
            .map(|dir| dir.join(lock_file_name(mode)))
    }

    fn latch(&self, mode: ProcessMode) -> &AtomicBool {
        match mode {
            ProcessMode::RefreshToday => &self.today_running,
            ProcessMode::FullWindow => &self.full_running,
        }
    }

    pub async fn trigger(&self, mode: ProcessMode, batch_size: usize) -> Result<TriggerOutcome> {
        self.trigger_at(mode, batch_size, Utc::now()).await
    }

    pub async fn trigger_at(
        &self,
        mode: ProcessMode,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<TriggerOutcome> {
        let lock_path = self.lock_path(mode);
        let Some(_latch) = RunLatch::acquire(self.latch(mode), lock_path.as_deref())? else {
            info!("{:?} pass already running, ignoring trigger", mode);
            return Ok(TriggerOutcome::AlreadyRunning);
        };

        let config = run_config::load(&self.run_config_path)?;
        let today = now.date_naive();
        if let Some(reason) = skip_reason(&config, today, self.grace_days) {
            info!("Skipping {:?} pass: {}", mode, reason);
            return Ok(TriggerOutcome::Skipped(reason));
        }

        let summary = self
            .processor
            .process_batch(&config, batch_size, mode, today, now)
            .await?;
        info!(
            "{:?} pass finished, {} accounts processed",
            mode, summary.total_accounts
        );
        Ok(TriggerOutcome::Completed(summary))
    }

    /// Registers both passes on a new job scheduler. The caller starts and stops it.
    pub async fn schedule(self: Arc<Self>, schedules: &Schedules) -> Result<JobScheduler> {
        let sched = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        let jobs = [
            (schedules.today_cron.as_str(), ProcessMode::RefreshToday),
            (schedules.full_cron.as_str(), ProcessMode::FullWindow),
        ];
        for (cron, mode) in jobs {
            let scheduler = self.clone();
            let batch_size = schedules.batch_size;
            let job = Job::new_async(cron, move |_uuid, _l| {
                let scheduler = scheduler.clone();
                Box::pin(async move {
                    match scheduler.trigger(mode, batch_size).await {
                        Ok(TriggerOutcome::Completed(_)) | Ok(TriggerOutcome::Skipped(_)) => {}
                        Ok(TriggerOutcome::AlreadyRunning) => {
                            warn!("{:?} tick overlapped a running pass", mode)
                        }
                        Err(e) => error!("{:?} pass failed: {:#}", mode, e),
                    }
                })
            })
            .with_context(|| format!("Invalid cron expression '{}'", cron))?;
            sched
                .add(job)
                .await
                .with_context(|| format!("Failed to add {:?} job", mode))?;
            info!("Scheduled {:?} pass at '{}'", mode, cron);
        }
        Ok(sched)
    }
}
