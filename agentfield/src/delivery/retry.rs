//! Delivery of a single webhook payload with retry.
//!
//! Per-delivery state machine:
//!
//! ```text
//! pending → in-flight → delivered
//!              │
//!              ├──▶ retrying → in-flight …
//!              └──▶ exhausted
//! ```
//!
//! Global worker permits are held only for the duration of one HTTP call. A
//! per-destination permit is held for the whole delivery, so a stalled
//! destination can occupy at most its own quota and never the shared pool.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backoff::RetryPolicy;
use super::transport::{WebhookRequest, WebhookTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Retrying,
    Delivered,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Exhausted,
    /// Shut down before the delivery finished.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub outcome: DeliveryOutcome,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Notified on every state change of a delivery.
#[async_trait]
pub trait DeliveryObserver: Send + Sync {
    async fn on_state(&self, state: DeliveryState, attempts: u32, error: Option<&str>);
}

pub struct NoopObserver;

#[async_trait]
impl DeliveryObserver for NoopObserver {
    async fn on_state(&self, _: DeliveryState, _: u32, _: Option<&str>) {}
}

/// Bounded worker pool with per-destination isolation.
pub struct DeliveryPool {
    workers: Arc<Semaphore>,
    destinations: DashMap<String, Arc<Semaphore>>,
    per_destination: usize,
}

impl DeliveryPool {
    pub fn new(workers: usize, per_destination: usize) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(workers.max(1))),
            destinations: DashMap::new(),
            per_destination: per_destination.max(1),
        }
    }

    fn destination_key(url: &str) -> String {
        match url::Url::parse(url) {
            Ok(parsed) => match parsed.host_str() {
                Some(host) => format!(
                    "{}://{}:{}",
                    parsed.scheme(),
                    host,
                    parsed.port_or_known_default().unwrap_or(0)
                ),
                None => url.to_string(),
            },
            Err(_) => url.to_string(),
        }
    }

    async fn acquire_destination(&self, url: &str) -> DestinationPermit<'_> {
        let key = Self::destination_key(url);
        let semaphore = self
            .destinations
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_destination)))
            .clone();
        DestinationPermit {
            permit: semaphore.acquire_owned().await.ok(),
            pool: self,
            key,
        }
    }

    /// Forget a destination nobody holds or waits on.
    fn evict_idle(&self, key: &str) {
        self.destinations.remove_if(key, |_, semaphore| {
            Arc::strong_count(semaphore) == 1 && semaphore.available_permits() == self.per_destination
        });
    }

    /// Destinations with a delivery in flight or waiting.
    pub fn tracked_destinations(&self) -> usize {
        self.destinations.len()
    }

    async fn acquire_worker(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.workers).acquire_owned().await.ok()
    }

    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }
}

/// Per-destination slot; the destination is forgotten on release once idle.
struct DestinationPermit<'a> {
    permit: Option<OwnedSemaphorePermit>,
    pool: &'a DeliveryPool,
    key: String,
}

impl Drop for DestinationPermit<'_> {
    fn drop(&mut self) {
        self.permit.take();
        self.pool.evict_idle(&self.key);
    }
}

/// Runs deliveries through a transport under a retry policy.
pub struct WebhookDelivery {
    transport: Arc<dyn WebhookTransport>,
    pool: Arc<DeliveryPool>,
}

impl WebhookDelivery {
    pub fn new(transport: Arc<dyn WebhookTransport>, pool: Arc<DeliveryPool>) -> Self {
        Self { transport, pool }
    }

    pub fn transport(&self) -> &Arc<dyn WebhookTransport> {
        &self.transport
    }

    /// Exactly one attempt, used by redrive.
    pub async fn attempt_once(&self, request: &WebhookRequest, policy: &RetryPolicy) -> Result<(), String> {
        let _destination = self.pool.acquire_destination(&request.url).await;
        let _worker = self.pool.acquire_worker().await;
        self.transport
            .send(request, policy.timeout)
            .await
            .map_err(|e| e.to_string())
    }

    /// Deliver with retry until delivered, exhausted or cancelled.
    pub async fn deliver(
        &self,
        request: &WebhookRequest,
        policy: &RetryPolicy,
        observer: &dyn DeliveryObserver,
        cancel: &CancellationToken,
    ) -> DeliveryReport {
        observer.on_state(DeliveryState::Pending, 0, None).await;
        let _destination = self.pool.acquire_destination(&request.url).await;

        let mut last_error = None;
        for attempt in 1..=policy.max_attempts {
            if cancel.is_cancelled() {
                return DeliveryReport {
                    outcome: DeliveryOutcome::Cancelled,
                    attempts: attempt - 1,
                    last_error: last_error.or_else(|| Some("delivery cancelled by shutdown".to_string())),
                };
            }

            observer.on_state(DeliveryState::InFlight, attempt, None).await;
            let result = {
                let _worker = self.pool.acquire_worker().await;
                self.transport.send(request, policy.timeout).await
            };

            match result {
                Ok(()) => {
                    observer.on_state(DeliveryState::Delivered, attempt, None).await;
                    return DeliveryReport {
                        outcome: DeliveryOutcome::Delivered,
                        attempts: attempt,
                        last_error: None,
                    };
                }
                Err(e) => {
                    let message = e.to_string();
                    if attempt >= policy.max_attempts {
                        warn!(url = %request.url, attempts = attempt, error = %message, "Webhook delivery exhausted");
                        observer
                            .on_state(DeliveryState::Exhausted, attempt, Some(&message))
                            .await;
                        return DeliveryReport {
                            outcome: DeliveryOutcome::Exhausted,
                            attempts: attempt,
                            last_error: Some(message),
                        };
                    }

                    let delay = policy.backoff_for(attempt);
                    debug!(
                        url = %request.url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Webhook delivery failed, retrying"
                    );
                    observer
                        .on_state(DeliveryState::Retrying, attempt, Some(&message))
                        .await;
                    last_error = Some(message);

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return DeliveryReport {
                                outcome: DeliveryOutcome::Cancelled,
                                attempts: attempt,
                                last_error,
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        // Only reachable with max_attempts == 0.
        DeliveryReport {
            outcome: DeliveryOutcome::Exhausted,
            attempts: 0,
            last_error,
        }
    }
}
