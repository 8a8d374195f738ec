//! Control-plane wiring.
//!
//! [`ControlPlane`] owns one instance of every service, connected through a
//! shared [`StorageProvider`] and the [`EventBuses`]. Outbound HTTP goes
//! through [`Collaborators`] so tests can swap in scripted transports.

use agentfield_core::config::ControlPlaneConfig;
use agentfield_core::{ControlPlaneError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use crate::delivery::{
    DeadLetterManager, DeliveryPool, ExecutionWebhookDispatcher, HttpTransport, ObservabilityForwarder,
    RetryPolicy, WebhookDelivery, WebhookTransport,
};
use crate::events::EventBuses;
use crate::executions::{
    AgentInvoker, AuditTrail, ExecutionAuditHook, ExecutionRecordStore, ExecutionService, HttpAgentInvoker,
    LogAuditHook,
};
use crate::gc::ExecutionGarbageCollector;
use crate::nodes::{HttpShutdownNotifier, LeaseManager, ShutdownNotifier, ShutdownProtocol, ShutdownTimeouts};
use crate::storage::{MemoryStorage, StorageProvider};
use crate::workflow::WorkflowTracker;

/// Everything the control plane calls out to.
pub struct Collaborators {
    pub webhook_transport: Arc<dyn WebhookTransport>,
    pub agent_invoker: Arc<dyn AgentInvoker>,
    pub shutdown_notifier: Arc<dyn ShutdownNotifier>,
    pub audit_hooks: Vec<Arc<dyn ExecutionAuditHook>>,
}

impl Collaborators {
    /// Real HTTP clients, with a log-only audit hook.
    pub fn http(config: &ControlPlaneConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("agentfield/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ControlPlaneError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            webhook_transport: Arc::new(HttpTransport::new(
                client.clone(),
                config.observability.response_body_limit,
            )),
            agent_invoker: Arc::new(HttpAgentInvoker::new(client.clone())),
            shutdown_notifier: Arc::new(HttpShutdownNotifier::new(client)),
            audit_hooks: vec![Arc::new(LogAuditHook)],
        })
    }
}

pub struct ControlPlane {
    pub config: ControlPlaneConfig,
    pub storage: Arc<dyn StorageProvider>,
    pub buses: EventBuses,
    pub nodes: Arc<LeaseManager>,
    pub workflows: Arc<WorkflowTracker>,
    pub records: Arc<ExecutionRecordStore>,
    pub executions: Arc<ExecutionService>,
    pub webhooks: Arc<ExecutionWebhookDispatcher>,
    pub dead_letters: Arc<DeadLetterManager>,
    pub forwarder: Arc<ObservabilityForwarder>,
    pub gc: Arc<ExecutionGarbageCollector>,
    audit: AuditTrail,
    started: AtomicBool,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl ControlPlane {
    pub fn new(
        config: ControlPlaneConfig,
        storage: Arc<dyn StorageProvider>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;

        let buses = EventBuses::new(config.event_bus.subscriber_capacity);

        let nodes = Arc::new(LeaseManager::new(
            Arc::clone(&storage),
            buses.nodes.clone(),
            config.lease.clone(),
            // Remote nodes only get the HTTP stage; no local process to signal.
            ShutdownProtocol::new(
                collaborators.shutdown_notifier,
                None,
                ShutdownTimeouts::from_lease_config(&config.lease),
            ),
        ));

        let workflows = Arc::new(WorkflowTracker::new(
            Arc::clone(&storage),
            buses.workflow_executions.clone(),
            buses.workflow_runs.clone(),
            config.workflow.max_depth,
        ));
        let records = Arc::new(ExecutionRecordStore::new(
            Arc::clone(&storage),
            buses.executions.clone(),
            Arc::clone(&workflows),
        ));

        let pool = Arc::new(DeliveryPool::new(
            config.observability.worker_count,
            config.observability.per_destination_concurrency,
        ));
        let delivery = Arc::new(WebhookDelivery::new(collaborators.webhook_transport, pool));
        let observability_policy = RetryPolicy::for_observability(&config.observability);
        let execution_policy = RetryPolicy::for_execution_webhooks(&config.execution_queue);

        let dead_letters = Arc::new(DeadLetterManager::new(
            Arc::clone(&storage),
            Arc::clone(&delivery),
            observability_policy,
            execution_policy,
        ));
        let forwarder = Arc::new(ObservabilityForwarder::new(
            config.observability.clone(),
            Arc::clone(&storage),
            Arc::clone(&delivery),
            Arc::clone(&dead_letters),
        ));
        let webhooks = Arc::new(ExecutionWebhookDispatcher::new(
            Arc::clone(&storage),
            delivery,
            Arc::clone(&dead_letters),
            execution_policy,
        ));

        let executions = Arc::new(ExecutionService::new(
            Arc::clone(&records),
            Arc::clone(&nodes),
            collaborators.agent_invoker,
            Arc::clone(&webhooks),
            buses.executions.clone(),
            buses.reasoners.clone(),
            config.execution_queue.clone(),
        ));
        let gc = Arc::new(ExecutionGarbageCollector::new(
            Arc::clone(&storage),
            Arc::clone(&records),
            config.execution_cleanup.clone(),
        ));

        Ok(Self {
            config,
            storage,
            buses,
            nodes,
            workflows,
            records,
            executions,
            webhooks,
            dead_letters,
            forwarder,
            gc,
            audit: AuditTrail::new(collaborators.audit_hooks),
            started: AtomicBool::new(false),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// In-memory control plane with real HTTP collaborators.
    pub fn in_memory(config: ControlPlaneConfig) -> Result<Self> {
        let collaborators = Collaborators::http(&config)?;
        Self::new(config, Arc::new(MemoryStorage::new()), collaborators)
    }

    /// Start subscribers, workers and background loops. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.forwarder.start(&self.buses).await?;
        self.webhooks.start(&self.buses.executions);
        self.audit.start(&self.buses.executions);
        self.executions.start();

        self.tasks
            .spawn(Arc::clone(&self.nodes).run_sweeper(self.cancel.clone()));
        self.tasks
            .spawn(Arc::clone(&self.gc).run(self.cancel.clone()));

        info!(
            lease_seconds = self.config.lease.lease_seconds,
            async_workers = self.config.execution_queue.async_worker_count,
            "Control plane started"
        );
        Ok(())
    }

    /// Stop in dependency order: no new executions, then flush deliveries.
    pub async fn shutdown(&self) {
        info!("Control plane shutting down");
        self.executions.shutdown().await;
        self.webhooks.shutdown().await;
        self.forwarder.shutdown().await;
        self.audit.shutdown().await;

        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Control plane stopped");
    }
}
