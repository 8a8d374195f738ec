//! Node lease manager.
//!
//! A node is online iff `now < lease_expires_at` and it has not been marked
//! offline. Renewal sets the expiry to exactly `now + lease_seconds`. Expiry
//! is detected lazily on read and by a periodic sweep; a missed renewal is a
//! state transition, never an error.

use agentfield_core::config::LeaseConfig;
use agentfield_core::types::*;
use agentfield_core::{ControlPlaneError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::shutdown::{ShutdownOutcome, ShutdownProtocol};
use crate::events::NodeBus;
use crate::storage::{MAX_UPDATE_ATTEMPTS, StorageProvider};

pub struct LeaseManager {
    storage: Arc<dyn StorageProvider>,
    bus: NodeBus,
    config: LeaseConfig,
    shutdown: ShutdownProtocol,
}

fn validate_base_url(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ControlPlaneError::validation(format!("invalid base_url '{}': {}", raw, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ControlPlaneError::validation("base_url must use http or https"));
    }
    Ok(())
}

impl LeaseManager {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        bus: NodeBus,
        config: LeaseConfig,
        shutdown: ShutdownProtocol,
    ) -> Self {
        Self {
            storage,
            bus,
            config,
            shutdown,
        }
    }

    pub fn lease_seconds(&self) -> u64 {
        self.config.lease_seconds
    }

    fn lease_response(&self, node: &AgentNode) -> LeaseResponse {
        LeaseResponse::for_node(node, self.config.lease_seconds)
    }

    /// Fetch-apply-persist with bounded retry. Returns the row before and after.
    async fn update_node<F>(&self, id: &str, mut apply: F) -> Result<(AgentNode, AgentNode)>
    where
        F: FnMut(&mut AgentNode) -> Result<()> + Send,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let current = self
                .storage
                .get_node(id)
                .await?
                .ok_or_else(|| ControlPlaneError::not_found("node", id))?;
            let mut next = current.clone();
            apply(&mut next)?;

            match self.storage.put_node(next, Some(current.version)).await {
                Ok(stored) => return Ok((current, stored)),
                Err(e) if e.is_retryable() => {
                    debug!(node_id = %id, attempt, "Node update lost a race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ControlPlaneError::conflict(format!(
            "node {} update did not converge after {} attempts",
            id, MAX_UPDATE_ATTEMPTS
        )))
    }

    pub async fn register(&self, request: RegisterNodeRequest) -> Result<LeaseResponse> {
        self.register_at(request, Utc::now()).await
    }

    /// Upsert a node and start its lease.
    ///
    /// Rejected with `Conflict` when the id is held by a live node declaring
    /// different capabilities.
    pub async fn register_at(&self, request: RegisterNodeRequest, now: DateTime<Utc>) -> Result<LeaseResponse> {
        if request.id.trim().is_empty() {
            return Err(ControlPlaneError::validation("node id is required"));
        }
        validate_base_url(&request.base_url)?;
        if let Some(pid) = request.process_id {
            crate::nodes::shutdown::validate_pid(pid)?;
        }
        let capabilities = request.capabilities();

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let existing = self.storage.get_node(&request.id).await?;
            if let Some(live) = existing.as_ref().filter(|n| n.is_online(now)) {
                if !live.capabilities.same_as(&capabilities) {
                    return Err(ControlPlaneError::conflict(format!(
                        "node {} is already registered with a live lease and different capabilities",
                        request.id
                    )));
                }
            }

            let mut node = AgentNode {
                id: request.id.clone(),
                base_url: request.base_url.trim_end_matches('/').to_string(),
                agent_version: request.agent_version.clone(),
                capabilities: capabilities.clone(),
                phase: NodePhase::Starting,
                health_score: 100.0,
                process_id: request.process_id,
                registered_at: now,
                last_heartbeat: now,
                lease_expires_at: now,
                pending_actions: Vec::new(),
                version: 0,
            };
            node.renew_lease(now, self.config.lease_seconds);

            match self
                .storage
                .put_node(node, existing.as_ref().map(|n| n.version))
                .await
            {
                Ok(stored) => {
                    info!(
                        node_id = %stored.id,
                        reasoners = stored.capabilities.reasoners.len(),
                        skills = stored.capabilities.skills.len(),
                        "Node registered"
                    );
                    self.bus
                        .publish(NodeEvent::new(NodeEventKind::Registered, &stored, now));
                    return Ok(self.lease_response(&stored));
                }
                Err(e) if e.is_retryable() || matches!(e, ControlPlaneError::AlreadyExists { .. }) => {
                    debug!(node_id = %request.id, attempt, "Registration raced another writer, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ControlPlaneError::conflict(format!(
            "registration of node {} did not converge",
            request.id
        )))
    }

    pub async fn renew(&self, node_id: &str, update: NodeStatusUpdate) -> Result<LeaseResponse> {
        self.renew_at(node_id, update, Utc::now()).await
    }

    /// Extend the lease to `now + lease_seconds` and apply the status fields.
    pub async fn renew_at(
        &self,
        node_id: &str,
        update: NodeStatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<LeaseResponse> {
        if let Some(score) = update.health_score {
            if !(0.0..=100.0).contains(&score) {
                return Err(ControlPlaneError::validation(format!(
                    "health_score must be between 0 and 100, got {}",
                    score
                )));
            }
        }

        let lease_seconds = self.config.lease_seconds;
        let (before, after) = self
            .update_node(node_id, |node| {
                match update.phase {
                    Some(phase) => node.phase = phase,
                    None if node.phase == NodePhase::Offline => node.phase = NodePhase::Ready,
                    None => {}
                }
                if let Some(score) = update.health_score {
                    node.health_score = score;
                }
                node.renew_lease(now, lease_seconds);
                Ok(())
            })
            .await?;

        if !before.is_online(now) && after.is_online(now) {
            info!(node_id = %node_id, "Node back online");
            self.bus.publish(NodeEvent::new(NodeEventKind::Online, &after, now));
        }
        if before.phase != after.phase {
            self.bus
                .publish(NodeEvent::new(NodeEventKind::StatusChanged, &after, now));
        }
        self.bus
            .publish(NodeEvent::new(NodeEventKind::Heartbeat, &after, now));

        Ok(self.lease_response(&after))
    }

    /// Remove an acknowledged pending action. Counts as a renewal.
    pub async fn ack_action(&self, node_id: &str, action_id: &str) -> Result<LeaseResponse> {
        let now = Utc::now();
        let lease_seconds = self.config.lease_seconds;
        let (_, after) = self
            .update_node(node_id, |node| {
                let idx = node
                    .pending_actions
                    .iter()
                    .position(|a| a.action_id == action_id)
                    .ok_or_else(|| ControlPlaneError::not_found("pending action", action_id))?;
                node.pending_actions.remove(idx);
                node.renew_lease(now, lease_seconds);
                Ok(())
            })
            .await?;

        debug!(node_id = %node_id, action_id = %action_id, "Pending action acknowledged");
        Ok(self.lease_response(&after))
    }

    pub async fn shutdown(&self, node_id: &str, reason: Option<String>) -> Result<NodeShutdownResponse> {
        self.shutdown_at(node_id, reason, Utc::now()).await
    }

    /// Cooperative shutdown: queue a `shutdown` action, call the node's
    /// shutdown endpoint, and expire the lease early if it does not answer.
    pub async fn shutdown_at(
        &self,
        node_id: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<NodeShutdownResponse> {
        let (_, node) = self
            .update_node(node_id, |node| {
                let already_queued = node
                    .pending_actions
                    .iter()
                    .any(|a| a.action == NodeActionKind::Shutdown);
                if !already_queued {
                    node.pending_actions.push(PendingAction {
                        action_id: uuid::Uuid::new_v4().to_string(),
                        action: NodeActionKind::Shutdown,
                        reason: reason.clone(),
                        created_at: now,
                    });
                }
                Ok(())
            })
            .await?;
        self.bus
            .publish(NodeEvent::new(NodeEventKind::ShutdownRequested, &node, now));

        // No lock or transaction is held across the remote call.
        let outcome = self.shutdown.run(&node.shutdown_url(), None, reason).await;

        if outcome == ShutdownOutcome::Graceful {
            return Ok(NodeShutdownResponse {
                node_id: node.id.clone(),
                acknowledged: true,
                phase: node.phase,
                lease: self.lease_response(&node),
            });
        }

        warn!(node_id = %node_id, outcome = ?outcome, "Node did not acknowledge shutdown, expiring lease");
        let (before, after) = self
            .update_node(node_id, |node| {
                node.phase = NodePhase::Offline;
                node.lease_expires_at = now;
                Ok(())
            })
            .await?;
        if before.phase != NodePhase::Offline {
            self.bus.publish(NodeEvent::new(NodeEventKind::Offline, &after, now));
        }

        Ok(NodeShutdownResponse {
            node_id: after.id.clone(),
            acknowledged: false,
            phase: after.phase,
            lease: LeaseResponse {
                lease_seconds: 0,
                next_lease_renewal: after.lease_expires_at,
                pending_actions: after.pending_actions.clone(),
            },
        })
    }

    /// Mark the node offline if its lease has lapsed. Returns the current row.
    async fn expire_if_due(&self, node: AgentNode, now: DateTime<Utc>) -> Result<AgentNode> {
        if !node.lease_expired(now) || node.phase == NodePhase::Offline {
            return Ok(node);
        }

        let (before, after) = self
            .update_node(&node.id, |n| {
                if n.lease_expired(now) {
                    n.phase = NodePhase::Offline;
                }
                Ok(())
            })
            .await?;

        if before.phase != NodePhase::Offline && after.phase == NodePhase::Offline {
            info!(node_id = %after.id, lease_expired_at = %after.lease_expires_at, "Node lease expired, marked offline");
            self.bus.publish(NodeEvent::new(NodeEventKind::Offline, &after, now));
        }
        Ok(after)
    }

    pub async fn get_node(&self, node_id: &str) -> Result<AgentNode> {
        self.get_node_at(node_id, Utc::now()).await
    }

    pub async fn get_node_at(&self, node_id: &str, now: DateTime<Utc>) -> Result<AgentNode> {
        let node = self
            .storage
            .get_node(node_id)
            .await?
            .ok_or_else(|| ControlPlaneError::not_found("node", node_id))?;
        self.expire_if_due(node, now).await
    }

    pub async fn list_nodes(&self) -> Result<Vec<AgentNode>> {
        let now = Utc::now();
        let mut nodes = Vec::new();
        for node in self.storage.list_nodes().await? {
            nodes.push(self.expire_if_due(node, now).await?);
        }
        Ok(nodes)
    }

    /// Mark every lapsed node offline. Returns the ids that transitioned.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut expired = Vec::new();
        for node in self.storage.list_nodes().await? {
            if node.phase == NodePhase::Offline || !node.lease_expired(now) {
                continue;
            }
            let id = node.id.clone();
            match self.expire_if_due(node, now).await {
                Ok(n) if n.phase == NodePhase::Offline => expired.push(id),
                Ok(_) => {}
                Err(e) => warn!(node_id = %id, error = %e, "Failed to expire node lease"),
            }
        }
        Ok(expired)
    }

    /// Periodic sweep until `cancel` fires.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.config.sweep_interval();
        info!(interval_secs = interval.as_secs(), "Lease sweeper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    match self.sweep(Utc::now()).await {
                        Ok(expired) if !expired.is_empty() => {
                            info!(count = expired.len(), "Lease sweep marked nodes offline");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Lease sweep failed"),
                    }
                }
            }
        }
        info!("Lease sweeper stopped");
    }
}
