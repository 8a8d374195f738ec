//! Background execution garbage collector.
//!
//! Each pass first forces stale non-terminal executions to `timeout`, then
//! deletes terminal executions past retention in bounded batches. Updates and
//! deletes are conditioned on current state, so overlapping passes from
//! several control-plane instances are harmless.

use agentfield_core::config::ExecutionCleanupConfig;
use agentfield_core::types::*;
use agentfield_core::{ControlPlaneError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executions::ExecutionRecordStore;
use crate::storage::StorageProvider;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionReport {
    pub timed_out: usize,
    pub deleted: usize,
}

pub struct ExecutionGarbageCollector {
    storage: Arc<dyn StorageProvider>,
    records: Arc<ExecutionRecordStore>,
    config: ExecutionCleanupConfig,
}

fn chrono_duration(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d)
        .map_err(|e| ControlPlaneError::config(format!("invalid cleanup duration: {}", e)))
}

impl ExecutionGarbageCollector {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        records: Arc<ExecutionRecordStore>,
        config: ExecutionCleanupConfig,
    ) -> Self {
        Self {
            storage,
            records,
            config,
        }
    }

    /// Run the collector loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Execution cleanup disabled");
            return;
        }
        info!(
            interval_secs = self.config.cleanup_interval_secs,
            batch_size = self.config.batch_size,
            retention_secs = self.config.retention_period_secs,
            "Execution garbage collector started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.cleanup_interval()) => {
                    if let Err(e) = self.collect(Utc::now()).await {
                        error!(error = %e, "Execution garbage collection failed");
                    }
                }
            }
        }
        info!("Execution garbage collector stopped");
    }

    /// One full pass: stale timeouts first, then retention.
    pub async fn collect(&self, now: DateTime<Utc>) -> Result<CollectionReport> {
        let timed_out = self.time_out_stale(now).await?;
        let deleted = self.delete_expired(now).await?;
        if timed_out > 0 || deleted > 0 {
            info!(timed_out, deleted, "Execution garbage collection pass finished");
        }
        Ok(CollectionReport { timed_out, deleted })
    }

    async fn time_out_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale_after = self.config.stale_execution_timeout();
        let cutoff = now - chrono_duration(stale_after)?;
        let message = format!(
            "execution exceeded stale timeout of {}s without an update",
            stale_after.as_secs()
        );
        let batch = self.config.batch_size.max(1);

        let mut total = 0;
        loop {
            let stale = self.storage.list_stale_executions(cutoff, batch).await?;
            let mut timed_out = 0;
            for record in &stale {
                let mut changed = false;
                let result = self
                    .records
                    .update(&record.execution_id, |current| {
                        let mut next = current.clone();
                        // Re-checked against the latest row; a fresh update wins.
                        changed = !current.is_terminal() && current.updated_at < cutoff;
                        if changed {
                            next.mark_terminal_error(ExecutionStatus::Timeout, message.clone(), now)?;
                        }
                        Ok(next)
                    })
                    .await;
                match result {
                    Ok(_) if changed => {
                        warn!(execution_id = %record.execution_id, "Stale execution forced to timeout");
                        timed_out += 1;
                    }
                    Ok(_) => {}
                    Err(e) if e.is_not_found() || e.is_retryable() => {
                        debug!(execution_id = %record.execution_id, error = %e, "Stale execution changed underneath collector");
                    }
                    Err(e) => return Err(e),
                }
            }
            total += timed_out;
            if stale.len() < batch || timed_out == 0 {
                break;
            }
        }
        Ok(total)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let keep_for = self
            .config
            .retention_period()
            .max(self.config.preserve_recent_duration());
        let cutoff = now - chrono_duration(keep_for)?;
        let batch = self.config.batch_size.max(1);

        let mut total = 0;
        loop {
            let ids = self.storage.list_expired_executions(cutoff, batch).await?;
            if ids.is_empty() {
                break;
            }
            let deleted = self.storage.delete_executions(&ids, cutoff).await?;
            total += deleted;
            if ids.len() < batch || deleted == 0 {
                break;
            }
            debug!(deleted, batch_size = batch, "Cleanup batch filled; continuing immediately");
        }
        Ok(total)
    }
}
