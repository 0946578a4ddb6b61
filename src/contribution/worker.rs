//! Recovery Worker
//!
//! Background worker that re-drives contributions left at a non-terminal step.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::engine::ContributionEngine;
use super::error::ContributionError;
use crate::config::WorkerSettings;

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan for unfinished contributions
    pub scan_interval: Duration,
    /// Maximum contributions to re-drive per scan
    pub batch_size: usize,
    /// Retry count above which a contribution is reported as stuck
    pub retry_warn_threshold: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerSettings::default().into()
    }
}

impl From<WorkerSettings> for WorkerConfig {
    fn from(settings: WorkerSettings) -> Self {
        Self {
            scan_interval: Duration::from_secs(settings.scan_interval_secs),
            batch_size: settings.batch_size,
            retry_warn_threshold: settings.retry_warn_threshold,
        }
    }
}

pub struct RecoveryWorker {
    engine: Arc<ContributionEngine>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(engine: Arc<ContributionEngine>, config: WorkerConfig) -> Self {
        Self { engine, config }
    }

    /// Run the recovery loop forever
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting recovery worker"
        );

        loop {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// Run a single scan; returns how many contributions reached a terminal step
    pub async fn scan_and_recover(&self) -> Result<usize, ContributionError> {
        let pending = self
            .engine
            .store()
            .get_not_completed_contributions(self.config.batch_size)
            .await?;

        if pending.is_empty() {
            debug!("No unfinished contributions");
            return Ok(0);
        }

        info!(count = pending.len(), "Found unfinished contributions");

        let mut finished = 0;
        for contribution in &pending {
            if contribution.retry_count > self.config.retry_warn_threshold {
                warn!(
                    contribution_id = %contribution.contribution_id,
                    step = %contribution.step,
                    retry_count = contribution.retry_count,
                    "Contribution stuck with many retries"
                );
            }

            let result = self.engine.retry(contribution).await;
            let stored = self
                .engine
                .store()
                .get_contribution_info(contribution.contribution_id)
                .await?;

            match stored {
                Some(after) if after.step.is_terminal() => {
                    info!(
                        contribution_id = %contribution.contribution_id,
                        old_step = %contribution.step,
                        new_step = %after.step,
                        "Contribution recovered"
                    );
                    finished += 1;
                }
                _ => debug!(
                    contribution_id = %contribution.contribution_id,
                    result = %result,
                    "Contribution still pending"
                ),
            }
        }

        if finished > 0 {
            info!(count = finished, "Recovered contributions this scan");
        }
        Ok(finished)
    }
}
