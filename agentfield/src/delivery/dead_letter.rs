//! Dead-letter store access and redrive.
//!
//! Redrive is only ever triggered by an operator or scheduler; the delivery
//! pipeline never replays dead letters on its own. Each redrive call makes
//! exactly one attempt per entry, oldest first. A successful attempt deletes
//! the entry; a failed one bumps `retry_count` and leaves the payload intact.

use agentfield_core::types::*;
use agentfield_core::{ControlPlaneError, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backoff::RetryPolicy;
use super::retry::WebhookDelivery;
use super::transport::WebhookRequest;
use crate::storage::StorageProvider;

pub struct DeadLetterManager {
    storage: Arc<dyn StorageProvider>,
    delivery: Arc<WebhookDelivery>,
    observability_policy: RetryPolicy,
    execution_policy: RetryPolicy,
}

impl DeadLetterManager {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        delivery: Arc<WebhookDelivery>,
        observability_policy: RetryPolicy,
        execution_policy: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            delivery,
            observability_policy,
            execution_policy,
        }
    }

    pub async fn enqueue(&self, entry: DeadLetterEntry) -> Result<i64> {
        let event_type = entry.event_type.clone();
        let retry_count = entry.retry_count;
        let id = self.storage.insert_dead_letter(entry).await?;
        info!(dead_letter_id = id, event_type = %event_type, retry_count, "Delivery dead-lettered");
        Ok(id)
    }

    pub async fn list(&self, query: &DeadLetterQuery) -> Result<DeadLetterListResponse> {
        let entries = self
            .storage
            .list_dead_letters(query.effective_limit(), query.offset.unwrap_or(0))
            .await?;
        let total_count = self.storage.count_dead_letters().await?;
        Ok(DeadLetterListResponse {
            entries,
            total_count,
        })
    }

    pub async fn count(&self) -> Result<usize> {
        self.storage.count_dead_letters().await
    }

    pub async fn clear(&self) -> Result<usize> {
        let cleared = self.storage.clear_dead_letters().await?;
        info!(cleared, "Dead-letter queue cleared");
        Ok(cleared)
    }

    pub async fn redrive(&self, target: RedriveTarget) -> Result<RedriveResponse> {
        let mut entries = match target {
            RedriveTarget::All => self.storage.list_dead_letters(usize::MAX, 0).await?,
            RedriveTarget::Ids(ids) => {
                let mut found = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.storage.get_dead_letter(id).await? {
                        Some(entry) => found.push(entry),
                        None => return Err(ControlPlaneError::not_found("dead letter", id.to_string())),
                    }
                }
                found
            }
        };
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut processed = 0;
        let mut failed = 0;
        for entry in entries {
            match self.redrive_one(&entry).await {
                Ok(()) => {
                    self.storage.delete_dead_letter(entry.id).await?;
                    processed += 1;
                }
                Err(message) => {
                    debug!(dead_letter_id = entry.id, error = %message, "Redrive attempt failed");
                    self.storage
                        .record_redrive_failure(entry.id, &message)
                        .await?;
                    failed += 1;
                }
            }
        }

        let response = RedriveResponse::new(processed, failed);
        info!(processed, failed, "Dead-letter redrive finished");
        Ok(response)
    }

    async fn redrive_one(&self, entry: &DeadLetterEntry) -> std::result::Result<(), String> {
        match &entry.destination {
            DeadLetterDestination::Observability => {
                let config = self
                    .storage
                    .get_observability_webhook()
                    .await
                    .map_err(|e| e.to_string())?
                    .filter(|c| c.enabled)
                    .ok_or_else(|| "observability webhook is not configured".to_string())?;

                let batch = ObservabilityEventBatch::new(
                    vec![ObservabilityEvent {
                        event_type: entry.event_type.clone(),
                        event_source: entry.event_source.clone(),
                        timestamp: entry.event_timestamp,
                        data: entry.payload.clone(),
                    }],
                    Utc::now(),
                );
                let request = WebhookRequest::json(&config.url, &batch, config.secret.clone(), config.headers.clone())
                    .map_err(|e| e.to_string())?;
                self.delivery
                    .attempt_once(&request, &self.observability_policy)
                    .await
            }
            DeadLetterDestination::ExecutionWebhook { execution_id } => {
                let hook = self
                    .storage
                    .get_execution_webhook(execution_id)
                    .await
                    .map_err(|e| e.to_string())?
                    .ok_or_else(|| format!("no webhook registered for execution {}", execution_id))?;

                let request = WebhookRequest::json(&hook.url, &entry.payload, hook.secret.clone(), hook.headers.clone())
                    .map_err(|e| e.to_string())?;
                self.delivery
                    .attempt_once(&request, &self.execution_policy)
                    .await?;

                let mut delivered = hook.clone();
                delivered.status = ExecutionWebhookStatus::Delivered;
                delivered.last_error = None;
                delivered.updated_at = Utc::now();
                if let Err(e) = self
                    .storage
                    .put_execution_webhook(delivered, Some(hook.version))
                    .await
                {
                    warn!(execution_id = %execution_id, error = %e, "Failed to mark redriven webhook delivered");
                }
                Ok(())
            }
        }
    }
}
