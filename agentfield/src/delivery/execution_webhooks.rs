//! Per-execution callback delivery.
//!
//! The dispatcher follows the execution bus losslessly. When an execution with
//! a registered callback reaches a terminal state it posts the result to the
//! callback URL, tracking progress on the stored registration. Exhausted
//! deliveries are dead-lettered with an `execution_webhook` destination.

use agentfield_core::types::*;
use agentfield_core::{ControlPlaneError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::backoff::RetryPolicy;
use super::dead_letter::DeadLetterManager;
use super::retry::{DeliveryObserver, DeliveryOutcome, DeliveryState, WebhookDelivery};
use super::transport::WebhookRequest;
use crate::events::ExecutionBus;
use crate::storage::{MAX_UPDATE_ATTEMPTS, StorageProvider};

pub const SOURCE_EXECUTION_WEBHOOK: &str = "execution_webhook";

pub struct ExecutionWebhookDispatcher {
    storage: Arc<dyn StorageProvider>,
    delivery: Arc<WebhookDelivery>,
    dead_letters: Arc<DeadLetterManager>,
    policy: RetryPolicy,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl ExecutionWebhookDispatcher {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        delivery: Arc<WebhookDelivery>,
        dead_letters: Arc<DeadLetterManager>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            delivery,
            dead_letters,
            policy,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Store a callback registration for an execution.
    pub async fn register(
        &self,
        execution_id: &str,
        request: ExecutionWebhookRequest,
    ) -> Result<ExecutionWebhook> {
        let hook = ExecutionWebhook::register(execution_id, request, Utc::now())?;
        let stored = self.storage.put_execution_webhook(hook, None).await?;
        debug!(execution_id = %execution_id, url = %stored.url, "Execution webhook registered");
        Ok(stored)
    }

    pub async fn get(&self, execution_id: &str) -> Result<Option<ExecutionWebhook>> {
        self.storage.get_execution_webhook(execution_id).await
    }

    /// Follow the execution bus and deliver callbacks for terminal records.
    pub fn start(self: &Arc<Self>, bus: &ExecutionBus) {
        let mut subscription = bus.subscribe_lossless();
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    next = subscription.recv() => match next {
                        Some(event) => event,
                        None => break,
                    },
                };
                if event.record.status.is_terminal() {
                    this.spawn_delivery(event.record);
                }
            }
        });
    }

    fn spawn_delivery(self: &Arc<Self>, record: ExecutionRecord) {
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            if let Err(e) = this.deliver(&record).await {
                warn!(execution_id = %record.execution_id, error = %e, "Execution webhook dispatch failed");
            }
        });
    }

    /// Re-queue delivery of a finished execution's callback.
    pub async fn retry(self: &Arc<Self>, execution_id: &str) -> Result<ExecutionWebhook> {
        let record = self
            .storage
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ControlPlaneError::not_found("execution", execution_id))?;
        if !record.status.is_terminal() {
            return Err(ControlPlaneError::validation(format!(
                "execution {} has not finished",
                execution_id
            )));
        }

        let hook = self
            .update_hook(execution_id, |hook| {
                if matches!(
                    hook.status,
                    ExecutionWebhookStatus::InFlight | ExecutionWebhookStatus::Retrying
                ) {
                    return Err(ControlPlaneError::conflict(format!(
                        "webhook for execution {} is already being delivered",
                        hook.execution_id
                    )));
                }
                hook.status = ExecutionWebhookStatus::Pending;
                hook.attempt_count = 0;
                hook.last_error = None;
                Ok(())
            })
            .await?;

        info!(execution_id = %execution_id, "Execution webhook re-queued");
        self.spawn_delivery(record);
        Ok(hook)
    }

    async fn deliver(&self, record: &ExecutionRecord) -> Result<()> {
        let Some(hook) = self.storage.get_execution_webhook(&record.execution_id).await? else {
            return Ok(());
        };
        if hook.status.is_final() {
            debug!(execution_id = %record.execution_id, status = ?hook.status, "Execution webhook already settled");
            return Ok(());
        }

        let payload = ExecutionWebhookPayload::from_record(record, Utc::now());
        let request = WebhookRequest::json(&hook.url, &payload, hook.secret.clone(), hook.headers.clone())?;
        let observer = HookObserver {
            storage: Arc::clone(&self.storage),
            execution_id: record.execution_id.clone(),
        };

        let report = self
            .delivery
            .deliver(&request, &self.policy, &observer, &self.cancel)
            .await;

        match report.outcome {
            DeliveryOutcome::Delivered => {
                info!(execution_id = %record.execution_id, attempts = report.attempts, "Execution webhook delivered");
            }
            DeliveryOutcome::Exhausted | DeliveryOutcome::Cancelled => {
                let error = report
                    .last_error
                    .unwrap_or_else(|| "delivery did not complete".to_string());
                if report.outcome == DeliveryOutcome::Cancelled {
                    // Shutdown interrupted the retries; the observer never saw a final state.
                    observer
                        .on_state(DeliveryState::Exhausted, report.attempts, Some(&error))
                        .await;
                }
                let entry = DeadLetterEntry::new(
                    DeadLetterDestination::ExecutionWebhook {
                        execution_id: record.execution_id.clone(),
                    },
                    payload.event.clone(),
                    SOURCE_EXECUTION_WEBHOOK,
                    payload.timestamp,
                    serde_json::to_value(&payload)?,
                    error,
                    report.attempts,
                );
                self.dead_letters.enqueue(entry).await?;
            }
        }
        Ok(())
    }

    async fn update_hook<F>(&self, execution_id: &str, apply: F) -> Result<ExecutionWebhook>
    where
        F: Fn(&mut ExecutionWebhook) -> Result<()> + Send,
    {
        update_hook(self.storage.as_ref(), execution_id, apply).await
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn update_hook<F>(
    storage: &dyn StorageProvider,
    execution_id: &str,
    apply: F,
) -> Result<ExecutionWebhook>
where
    F: Fn(&mut ExecutionWebhook) -> Result<()> + Send,
{
    for _ in 0..MAX_UPDATE_ATTEMPTS {
        let current = storage
            .get_execution_webhook(execution_id)
            .await?
            .ok_or_else(|| ControlPlaneError::not_found("execution webhook", execution_id))?;
        let mut next = current.clone();
        apply(&mut next)?;
        next.updated_at = Utc::now();
        match storage.put_execution_webhook(next, Some(current.version)).await {
            Ok(stored) => return Ok(stored),
            Err(e) if e.is_retryable() => continue,
            Err(e) => return Err(e),
        }
    }
    Err(ControlPlaneError::conflict(format!(
        "execution webhook {} update did not converge",
        execution_id
    )))
}

/// Mirrors delivery state onto the stored registration.
struct HookObserver {
    storage: Arc<dyn StorageProvider>,
    execution_id: String,
}

#[async_trait]
impl DeliveryObserver for HookObserver {
    async fn on_state(&self, state: DeliveryState, attempts: u32, error: Option<&str>) {
        let status = match state {
            DeliveryState::Pending => ExecutionWebhookStatus::Pending,
            DeliveryState::InFlight => ExecutionWebhookStatus::InFlight,
            DeliveryState::Retrying => ExecutionWebhookStatus::Retrying,
            DeliveryState::Delivered => ExecutionWebhookStatus::Delivered,
            DeliveryState::Exhausted => ExecutionWebhookStatus::Exhausted,
        };
        let error = error.map(str::to_string);
        let result = update_hook(self.storage.as_ref(), &self.execution_id, |hook| {
            hook.status = status;
            hook.attempt_count = attempts;
            if state == DeliveryState::InFlight {
                hook.last_attempt_at = Some(Utc::now());
            }
            if error.is_some() {
                hook.last_error = error.clone();
            } else if state == DeliveryState::Delivered {
                hook.last_error = None;
            }
            Ok(())
        })
        .await;
        if let Err(e) = result {
            warn!(execution_id = %self.execution_id, error = %e, "Failed to record webhook state");
        }
    }
}
