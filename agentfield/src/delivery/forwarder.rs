//! Observability webhook forwarder.
//!
//! Subscribes losslessly to the execution, reasoner, workflow-run and node
//! buses, normalises events into a queue of `queue_size`, batches them
//! (`batch_size` events or `batch_timeout` after the first one) and hands
//! each batch to the delivery pool. At most `worker_count` batches are in
//! flight; while all slots are busy the queue fills and further events are
//! dropped and counted. Every accepted event ends up either delivered or in
//! the dead-letter store, also when the forwarder shuts down mid-retry.

use agentfield_core::config::ObservabilityConfig;
use agentfield_core::types::*;
use agentfield_core::{ControlPlaneError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::backoff::RetryPolicy;
use super::dead_letter::DeadLetterManager;
use super::normalize;
use super::retry::{DeliveryOutcome, NoopObserver, WebhookDelivery};
use super::transport::WebhookRequest;
use crate::events::{EventBuses, Subscription};
use crate::storage::{MAX_UPDATE_ATTEMPTS, StorageProvider};

/// Forwarder counters.
pub struct ForwarderStats {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    queue_depth: AtomicUsize,
    last_forwarded_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl ForwarderStats {
    fn new() -> Self {
        Self {
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            last_forwarded_at: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    fn record_delivered(&self, count: usize) {
        self.forwarded.fetch_add(count as u64, Ordering::Relaxed);
        *self.last_forwarded_at.lock() = Some(Utc::now());
    }

    fn record_dead_lettered(&self, count: usize, error: &str) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    fn settle(&self, count: usize) {
        // Saturating: a reload may race with settlement of an old batch.
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(count)));
    }
}

pub struct ObservabilityForwarder {
    config: ObservabilityConfig,
    policy: RetryPolicy,
    storage: Arc<dyn StorageProvider>,
    delivery: Arc<WebhookDelivery>,
    dead_letters: Arc<DeadLetterManager>,
    webhook: RwLock<Option<ObservabilityWebhookConfig>>,
    stats: ForwarderStats,
    sender: mpsc::Sender<ObservabilityEvent>,
    receiver: Mutex<Option<mpsc::Receiver<ObservabilityEvent>>>,
    batch_slots: Arc<Semaphore>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl ObservabilityForwarder {
    pub fn new(
        config: ObservabilityConfig,
        storage: Arc<dyn StorageProvider>,
        delivery: Arc<WebhookDelivery>,
        dead_letters: Arc<DeadLetterManager>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_size.max(1));
        let batch_slots = Arc::new(Semaphore::new(config.worker_count.max(1)));
        Self {
            policy: RetryPolicy::for_observability(&config),
            config,
            storage,
            delivery,
            dead_letters,
            webhook: RwLock::new(None),
            stats: ForwarderStats::new(),
            sender,
            receiver: Mutex::new(Some(receiver)),
            batch_slots,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Re-read the webhook configuration from storage.
    pub async fn reload(&self) -> Result<()> {
        let config = self.storage.get_observability_webhook().await?;
        match &config {
            Some(c) if c.enabled => info!(url = %c.url, "Observability forwarding enabled"),
            Some(_) => info!("Observability webhook configured but disabled"),
            None => debug!("No observability webhook configured"),
        }
        *self.webhook.write() = config;
        Ok(())
    }

    /// Create or replace the global webhook configuration, then reload.
    pub async fn configure(&self, request: WebhookConfigRequest) -> Result<ObservabilityWebhookConfig> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let existing = self.storage.get_observability_webhook().await?;
            let next = ObservabilityWebhookConfig::apply(existing.as_ref(), request.clone(), Utc::now())?;
            match self
                .storage
                .put_observability_webhook(next, existing.as_ref().map(|e| e.version))
                .await
            {
                Ok(stored) => {
                    self.reload().await?;
                    return Ok(stored);
                }
                Err(e) if e.is_retryable() || matches!(e, ControlPlaneError::AlreadyExists { .. }) => {
                    debug!("Observability webhook changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ControlPlaneError::conflict(
            "observability webhook update did not converge",
        ))
    }

    /// Remove the webhook configuration. Returns whether one existed.
    pub async fn remove(&self) -> Result<bool> {
        let removed = self.storage.delete_observability_webhook().await?;
        self.reload().await?;
        Ok(removed)
    }

    /// The stored configuration with the secret redacted.
    pub async fn config_view(&self) -> Result<Option<WebhookConfigView>> {
        Ok(self
            .storage
            .get_observability_webhook()
            .await?
            .map(|c| c.view()))
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook.read().as_ref().is_some_and(|c| c.enabled)
    }

    /// Counters plus the dead-letter store size, which survives restarts
    /// and shrinks on redrive.
    pub async fn status(&self) -> ForwarderStatus {
        let dead_letter_count = match self.dead_letters.count().await {
            Ok(count) => count as u64,
            Err(e) => {
                warn!(error = %e, "Failed to count dead letters");
                0
            }
        };
        let webhook = self.webhook.read();
        ForwarderStatus {
            enabled: webhook.as_ref().is_some_and(|c| c.enabled),
            webhook_url: webhook.as_ref().map(|c| c.url.clone()),
            queue_depth: self.stats.queue_depth.load(Ordering::Relaxed),
            events_forwarded: self.stats.forwarded.load(Ordering::Relaxed),
            events_dropped: self.stats.dropped.load(Ordering::Relaxed),
            dead_letter_count,
            last_forwarded_at: *self.stats.last_forwarded_at.lock(),
            last_error: self.stats.last_error.lock().clone(),
        }
    }

    /// Batches currently handed to the delivery pool.
    pub fn in_flight_batches(&self) -> usize {
        self.config.worker_count.max(1) - self.batch_slots.available_permits()
    }

    /// Accept an event for forwarding. Ignored while forwarding is disabled,
    /// dropped when the queue is full.
    pub fn enqueue(&self, event: ObservabilityEvent) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.stats.queue_depth.fetch_add(1, Ordering::Relaxed);
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.stats.settle(1);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event_type = %event.event_type, "Observability event dropped: queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Batcher already gone; shutdown drains what it can.
                self.stats.settle(1);
                warn!("Observability event arrived after forwarder shutdown");
                false
            }
        }
    }

    /// Subscribe to the buses and start the batcher. Idempotent.
    pub async fn start(self: &Arc<Self>, buses: &EventBuses) -> Result<()> {
        let Some(receiver) = self.receiver.lock().take() else {
            return Ok(());
        };
        self.reload().await?;

        self.spawn_pump(buses.executions.subscribe_lossless(), |e| {
            Some(normalize::execution_event(&e))
        });
        self.spawn_pump(buses.reasoners.subscribe_lossless(), |e| {
            Some(normalize::reasoner_event(&e))
        });
        self.spawn_pump(buses.workflow_runs.subscribe_lossless(), |e| {
            Some(normalize::workflow_run_event(&e))
        });
        self.spawn_pump(buses.nodes.subscribe_lossless(), |e| normalize::node_event(&e));

        let this = Arc::clone(self);
        self.tasks.spawn(async move { this.run_batcher(receiver).await });

        info!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout_ms,
            workers = self.config.worker_count,
            queue_size = self.config.queue_size,
            "Observability forwarder started"
        );
        Ok(())
    }

    fn spawn_pump<T, F>(self: &Arc<Self>, mut subscription: Subscription<T>, convert: F)
    where
        T: Clone + Send + 'static,
        F: Fn(T) -> Option<ObservabilityEvent> + Send + 'static,
    {
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    next = subscription.recv() => match next {
                        Some(event) => {
                            if let Some(envelope) = convert(event) {
                                this.enqueue(envelope);
                            }
                        }
                        None => break,
                    }
                }
            }
            // Whatever reached the subscription before shutdown is still forwarded.
            while let Some(event) = subscription.try_recv() {
                if let Some(envelope) = convert(event) {
                    this.enqueue(envelope);
                }
            }
        });
    }

    async fn run_batcher(self: Arc<Self>, mut receiver: mpsc::Receiver<ObservabilityEvent>) {
        let batch_size = self.config.batch_size.max(1);
        let batch_timeout = self.config.batch_timeout();

        loop {
            let first = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            let mut batch = vec![first];
            let deadline = tokio::time::sleep(batch_timeout);
            tokio::pin!(deadline);
            while batch.len() < batch_size {
                tokio::select! {
                    _ = &mut deadline => break,
                    _ = self.cancel.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(event) => batch.push(event),
                        None => break,
                    },
                }
            }

            // Wait for a free slot; the queue absorbs events meanwhile.
            let slot = tokio::select! {
                permit = Arc::clone(&self.batch_slots).acquire_owned() => permit.ok(),
                _ = self.cancel.cancelled() => None,
            };
            match slot {
                Some(permit) => self.dispatch(batch, permit),
                None => {
                    let count = batch.len();
                    self.dead_letter(batch, 0, "forwarder stopped before delivery").await;
                    self.stats.settle(count);
                    break;
                }
            }
        }

        // Let the pumps finish handing over, then dead-letter the remainder.
        tokio::task::yield_now().await;
        let mut leftovers = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            leftovers.push(event);
        }
        receiver.close();
        if !leftovers.is_empty() {
            let count = leftovers.len();
            self.dead_letter(leftovers, 0, "forwarder stopped before delivery").await;
            self.stats.settle(count);
        }
        debug!("Observability batcher stopped");
    }

    /// Hand a batch to the pool; the spawned task owns it and its slot until
    /// it is settled.
    fn dispatch(self: &Arc<Self>, events: Vec<ObservabilityEvent>, slot: OwnedSemaphorePermit) {
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            let _slot = slot;
            let count = events.len();
            let webhook = this.webhook.read().clone().filter(|c| c.enabled);

            let Some(webhook) = webhook else {
                this.dead_letter(events, 0, "observability webhook disabled before delivery")
                    .await;
                this.stats.settle(count);
                return;
            };

            let batch = ObservabilityEventBatch::new(events, Utc::now());
            let request = match WebhookRequest::json(
                &webhook.url,
                &batch,
                webhook.secret.clone(),
                webhook.headers.clone(),
            ) {
                Ok(r) => r,
                Err(e) => {
                    this.dead_letter(batch.events, 0, &e.to_string()).await;
                    this.stats.settle(count);
                    return;
                }
            };

            let report = this
                .delivery
                .deliver(&request, &this.policy, &NoopObserver, &this.cancel)
                .await;

            match report.outcome {
                DeliveryOutcome::Delivered => {
                    debug!(batch_id = %batch.batch_id, events = count, attempts = report.attempts, "Observability batch delivered");
                    this.stats.record_delivered(count);
                }
                DeliveryOutcome::Exhausted | DeliveryOutcome::Cancelled => {
                    let error = report
                        .last_error
                        .unwrap_or_else(|| "delivery did not complete".to_string());
                    this.dead_letter(batch.events, report.attempts, &error).await;
                }
            }
            this.stats.settle(count);
        });
    }

    async fn dead_letter(&self, events: Vec<ObservabilityEvent>, attempts: u32, error: &str) {
        let count = events.len();
        for event in events {
            let entry = DeadLetterEntry::new(
                DeadLetterDestination::Observability,
                event.event_type,
                event.event_source,
                event.timestamp,
                event.data,
                error,
                attempts,
            );
            if let Err(e) = self.dead_letters.enqueue(entry).await {
                warn!(error = %e, "Failed to persist dead-lettered observability event");
            }
        }
        self.stats.record_dead_lettered(count, error);
    }

    /// Stop pumps and batcher, dead-letter anything still in flight, and wait.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Observability forwarder stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::retry::DeliveryPool;
    use crate::delivery::retry::tests::ScriptedTransport;
    use crate::delivery::transport::WebhookTransport;
    use crate::storage::{DeadLetterStore, MemoryStorage, WebhookStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::future::Future;
    use std::time::Duration;

    /// Destination that never answers before the request timeout.
    struct StalledTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl WebhookTransport for StalledTransport {
        async fn send(&self, _: &WebhookRequest, timeout: Duration) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(timeout).await;
            Err(ControlPlaneError::timeout("destination did not answer"))
        }
    }

    async fn setup(
        transport: Arc<ScriptedTransport>,
        configure: bool,
    ) -> (Arc<ObservabilityForwarder>, EventBuses, Arc<MemoryStorage>) {
        let config = ObservabilityConfig {
            max_retry_backoff_ms: 4_000,
            ..Default::default()
        };
        setup_with(transport, configure, config).await
    }

    async fn setup_with(
        transport: Arc<dyn WebhookTransport>,
        configure: bool,
        config: ObservabilityConfig,
    ) -> (Arc<ObservabilityForwarder>, EventBuses, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        if configure {
            let webhook = ObservabilityWebhookConfig::apply(
                None,
                WebhookConfigRequest {
                    url: "http://hooks.test/events".into(),
                    secret: Some("s3cret".into()),
                    headers: Some([("X-Team".to_string(), "ops".to_string())].into()),
                    enabled: None,
                },
                Utc::now(),
            )
            .unwrap();
            storage.put_observability_webhook(webhook, None).await.unwrap();
        }

        let delivery = Arc::new(WebhookDelivery::new(transport, Arc::new(DeliveryPool::new(2, 2))));
        let policy = RetryPolicy::for_observability(&config);
        let dead_letters = Arc::new(DeadLetterManager::new(
            storage.clone(),
            delivery.clone(),
            policy,
            policy,
        ));
        let forwarder = Arc::new(ObservabilityForwarder::new(
            config,
            storage.clone(),
            delivery,
            dead_letters,
        ));
        let buses = EventBuses::new(100);
        forwarder.start(&buses).await.unwrap();
        (forwarder, buses, storage)
    }

    fn execution_event(id: &str) -> ExecutionEvent {
        let mut record = ExecutionRecord::new(id, "node-1", "plan", json!({}), Utc::now());
        record.mark_succeeded(json!("ok"), Utc::now()).unwrap();
        ExecutionEvent {
            record,
            previous_status: Some(ExecutionStatus::Running),
            timestamp: Utc::now(),
        }
    }

    async fn wait_until<F, Fut>(condition: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..600 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_are_batched_and_signed() {
        let transport = Arc::new(ScriptedTransport::always(true));
        let (forwarder, buses, _) = setup(transport.clone(), true).await;

        for i in 0..3 {
            buses.executions.publish(execution_event(&format!("e{}", i)));
        }
        let f = &forwarder;
        wait_until(move || async move { f.status().await.events_forwarded == 3 }).await;

        {
            let calls = transport.calls.lock();
            assert_eq!(calls.len(), 1);
            let request = &calls[0].1;
            assert!(request.signature().unwrap().starts_with("sha256="));
            assert_eq!(request.headers.get("X-Team").map(String::as_str), Some("ops"));

            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            assert_eq!(body["event_count"], 3);
            assert_eq!(body["events"][0]["event_source"], "execution");
            assert_eq!(body["events"][0]["event_type"], "execution.completed");
        }

        let status = forwarder.status().await;
        assert_eq!(status.queue_depth, 0);
        assert!(status.last_forwarded_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reasoner_events_are_forwarded() {
        let transport = Arc::new(ScriptedTransport::always(true));
        let (forwarder, buses, _) = setup(transport.clone(), true).await;

        let mut record = ExecutionRecord::new("e1", "node-1", "plan", json!({}), Utc::now());
        record.mark_running(Utc::now()).unwrap();
        record.mark_succeeded(json!("ok"), Utc::now()).unwrap();
        buses
            .reasoners
            .publish(ReasonerEvent::for_record(&record, Utc::now()).unwrap());
        let f = &forwarder;
        wait_until(move || async move { f.status().await.events_forwarded == 1 }).await;

        let body: serde_json::Value =
            serde_json::from_slice(&transport.calls.lock()[0].1.body).unwrap();
        let event = &body["events"][0];
        assert_eq!(event["event_source"], "reasoner");
        assert_eq!(event["event_type"], "reasoner.completed");
        assert_eq!(event["data"]["reasoner_id"], "plan");
        assert_eq!(event["data"]["node_id"], "node-1");
        assert_eq!(event["data"]["status"], "succeeded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_batch_is_dead_lettered() {
        let transport = Arc::new(ScriptedTransport::always(false));
        let (forwarder, buses, storage) = setup(transport.clone(), true).await;

        buses.executions.publish(execution_event("e1"));
        let f = &forwarder;
        wait_until(move || async move { f.status().await.dead_letter_count == 1 }).await;

        assert_eq!(transport.call_count(), 3);
        let entries = storage.list_dead_letters(10, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 3);
        assert_eq!(entries[0].event_type, "execution.completed");

        let status = forwarder.status().await;
        assert_eq!(status.events_dropped, 1);
        assert_eq!(status.events_forwarded, 0);
        assert!(status.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_count_tracks_the_store() {
        let transport = Arc::new(ScriptedTransport::always(false));
        let (forwarder, buses, storage) = setup(transport.clone(), true).await;

        // Left over from an earlier process.
        storage
            .insert_dead_letter(DeadLetterEntry::new(
                DeadLetterDestination::Observability,
                "node.offline",
                "node",
                Utc::now(),
                json!({}),
                "503",
                3,
            ))
            .await
            .unwrap();
        assert_eq!(forwarder.status().await.dead_letter_count, 1);

        buses.executions.publish(execution_event("e1"));
        let f = &forwarder;
        wait_until(move || async move { f.status().await.dead_letter_count == 2 }).await;

        forwarder.dead_letters.clear().await.unwrap();
        let status = forwarder.status().await;
        assert_eq!(status.dead_letter_count, 0);
        assert_eq!(status.events_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_destination_bounds_in_flight_batches() {
        let transport = Arc::new(StalledTransport {
            calls: AtomicUsize::new(0),
        });
        let config = ObservabilityConfig {
            batch_size: 1,
            worker_count: 2,
            queue_size: 4,
            ..Default::default()
        };
        let (forwarder, buses, storage) = setup_with(transport.clone(), true, config).await;

        for i in 0..20 {
            buses.executions.publish(execution_event(&format!("e{}", i)));
        }
        let f = &forwarder;
        let t = &transport;
        wait_until(move || async move {
            f.in_flight_batches() == 2 && t.calls.load(Ordering::SeqCst) == 2
        })
        .await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(forwarder.in_flight_batches(), 2);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        let status = forwarder.status().await;
        // Two in flight, one waiting for a slot, the rest queued.
        assert!(status.queue_depth <= 2 + 1 + 4, "queue depth {}", status.queue_depth);
        assert!(status.events_dropped > 0);
        assert_eq!(status.queue_depth as u64 + status.events_dropped, 20);

        // Everything accepted is accounted for on shutdown.
        let accepted = status.queue_depth;
        forwarder.shutdown().await;
        let entries = storage.list_dead_letters(100, 0).await.unwrap();
        assert_eq!(entries.len(), accepted);
        assert_eq!(forwarder.in_flight_batches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_heartbeats_are_not_forwarded() {
        let transport = Arc::new(ScriptedTransport::always(true));
        let (forwarder, buses, _) = setup(transport.clone(), true).await;

        let base = NodeEvent {
            kind: NodeEventKind::Heartbeat,
            node_id: "n1".into(),
            phase: NodePhase::Ready,
            health_score: 100.0,
            timestamp: Utc::now(),
        };
        buses.nodes.publish(base.clone());
        buses.nodes.publish(NodeEvent {
            kind: NodeEventKind::Offline,
            ..base
        });
        let f = &forwarder;
        wait_until(move || async move { f.status().await.events_forwarded == 1 }).await;

        let body: serde_json::Value =
            serde_json::from_slice(&transport.calls.lock()[0].1.body).unwrap();
        assert_eq!(body["events"][0]["event_type"], "node.offline");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_forwarder_ignores_events() {
        let transport = Arc::new(ScriptedTransport::always(true));
        let (forwarder, buses, _) = setup(transport.clone(), false).await;

        buses.executions.publish(execution_event("e1"));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.call_count(), 0);
        let status = forwarder.status().await;
        assert!(!status.enabled);
        assert_eq!(status.queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_retry_dead_letters_batch() {
        let transport = Arc::new(ScriptedTransport::always(false));
        let (forwarder, buses, storage) = setup(transport.clone(), true).await;

        buses.executions.publish(execution_event("e1"));
        let t = &transport;
        wait_until(move || async move { t.call_count() == 1 }).await;

        forwarder.shutdown().await;
        let entries = storage.list_dead_letters(10, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 1);
    }
}
