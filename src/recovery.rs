use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::UpscaleError;
use crate::job::{JobStatus, JobStore};
use crate::orchestrator::Orchestrator;

/// Progress callback: percentage plus a human-readable phase label.
pub type ProgressFn = Arc<dyn Fn(u8, &str) + Send + Sync>;

/// Consecutive failed advance attempts the watcher rides out before giving
/// up. A one-off storage or backend hiccup should not demote the job to
/// sweeper-cadence progress.
const ADVANCE_ERROR_BUDGET: u32 = 3;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Cadence of the primary status poll.
    pub poll_interval: Duration,
    /// Consecutive polls without a version change before the watcher suspects
    /// a lost completion signal.
    pub stale_polls: u32,
    /// Extra wall-clock grace after the stale threshold before reconciling.
    pub stale_grace: Duration,
    /// Hard cap on the watch; the job is failed when it expires.
    pub timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            stale_polls: 10,
            stale_grace: Duration::from_secs(30),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Drives one job to a terminal state: polls, advances, detects staleness, and
/// falls back to direct backend reconciliation when the job stops moving.
pub struct JobWatcher {
    orchestrator: Arc<Orchestrator>,
    config: WatchConfig,
}

impl JobWatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, config: WatchConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub async fn wait(
        &self,
        job_id: &str,
        on_progress: Option<ProgressFn>,
    ) -> Result<JobStatus, UpscaleError> {
        let started = Instant::now();
        let mut last_version = u64::MAX;
        let mut flat_polls: u32 = 0;
        let mut stale_since: Option<Instant> = None;
        let mut last_reported: Option<(u8, String)> = None;
        let mut advance_errors: u32 = 0;

        loop {
            if started.elapsed() > self.config.timeout {
                self.orchestrator.fail_with_timeout(job_id)?;
                return Err(UpscaleError::Timeout(self.config.timeout));
            }

            let status = match self.orchestrator.advance(job_id).await {
                Ok(status) => {
                    advance_errors = 0;
                    status
                }
                Err(e @ UpscaleError::NotFound(_)) => return Err(e),
                Err(e) => {
                    advance_errors += 1;
                    if advance_errors >= ADVANCE_ERROR_BUDGET {
                        return Err(e);
                    }
                    warn!(
                        "job {} advance failed ({}/{}): {}",
                        job_id, advance_errors, ADVANCE_ERROR_BUDGET, e
                    );
                    sleep(self.config.poll_interval).await;
                    continue;
                }
            };
            let snap = self
                .orchestrator
                .store()
                .snapshot(job_id)
                .ok_or_else(|| UpscaleError::NotFound(job_id.to_string()))?;

            if let Some(cb) = &on_progress {
                let report = (snap.progress(), phase_label(status).to_string());
                if last_reported.as_ref() != Some(&report) {
                    cb(report.0, &report.1);
                    last_reported = Some(report);
                }
            }

            if status.is_terminal() {
                return Ok(status);
            }

            // Staleness: the version counter moves on every store write, so a
            // run of flat polls means nothing at all is happening underneath.
            if snap.version == last_version {
                flat_polls += 1;
            } else {
                flat_polls = 0;
                stale_since = None;
                last_version = snap.version;
            }
            if flat_polls >= self.config.stale_polls {
                let since = *stale_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.config.stale_grace {
                    warn!(
                        "job {} stale for {} polls, reconciling with backend",
                        job_id, flat_polls
                    );
                    self.orchestrator.reconcile_job(job_id).await?;
                    flat_polls = 0;
                    stale_since = None;
                }
            }

            sleep(self.config.poll_interval).await;
        }
    }
}

fn phase_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "queued",
        JobStatus::Processing => "upscaling",
        JobStatus::NeedsSplit => "splitting",
        JobStatus::TilesReady => "stitching",
        JobStatus::Completed => "complete",
        JobStatus::PartialSuccess => "complete (partial)",
        JobStatus::Failed => "failed",
    }
}

/// Background reconciliation sweep over every in-flight job. Catches jobs
/// whose watcher died (process restart, dropped client) and keeps them moving.
pub fn spawn_sweeper(
    orchestrator: Arc<Orchestrator>,
    store: Arc<JobStore>,
    cadence: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(cadence);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tick.tick().await;
            let jobs = store.in_flight();
            if jobs.is_empty() {
                continue;
            }
            info!("reconciliation sweep: {} in-flight jobs", jobs.len());
            for job_id in jobs {
                if let Err(e) = orchestrator.advance(&job_id).await {
                    warn!("sweep: job {} advance failed: {}", job_id, e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_config_defaults() {
        let c = WatchConfig::default();
        assert_eq!(c.poll_interval, Duration::from_secs(2));
        assert_eq!(c.stale_polls, 10);
        assert_eq!(c.stale_grace, Duration::from_secs(30));
    }

    #[test]
    fn test_phase_labels_cover_all_states() {
        for s in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::NeedsSplit,
            JobStatus::TilesReady,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::PartialSuccess,
        ] {
            assert!(!phase_label(s).is_empty());
        }
    }
}
