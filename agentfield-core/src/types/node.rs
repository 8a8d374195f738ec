//! Agent node registration and lease types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase reported by a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodePhase {
    #[default]
    Starting,
    Ready,
    Degraded,
    Offline,
}

impl NodePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        }
    }
}

/// Reasoners and skills a node declares on registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NodeCapabilities {
    #[serde(default)]
    pub reasoners: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
}

impl NodeCapabilities {
    /// Order-insensitive comparison.
    pub fn same_as(&self, other: &NodeCapabilities) -> bool {
        let mut a = (self.reasoners.clone(), self.skills.clone());
        let mut b = (other.reasoners.clone(), other.skills.clone());
        a.0.sort();
        a.1.sort();
        b.0.sort();
        b.1.sort();
        a == b
    }

    pub fn has_reasoner(&self, reasoner_id: &str) -> bool {
        self.reasoners.iter().any(|r| r == reasoner_id)
    }
}

/// Control-plane initiated request a node picks up on its next lease call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingAction {
    pub action_id: String,
    pub action: NodeActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeActionKind {
    Shutdown,
}

/// A registered agent node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentNode {
    pub id: String,
    pub base_url: String,
    #[serde(default)]
    pub agent_version: Option<String>,
    pub capabilities: NodeCapabilities,
    pub phase: NodePhase,
    pub health_score: f64,
    /// Local process id when the node runs on the same host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    #[serde(default)]
    pub pending_actions: Vec<PendingAction>,
    /// Row version for compare-and-swap writes.
    #[serde(default)]
    pub version: u64,
}

impl AgentNode {
    /// A node is online iff its lease has not expired and it was not marked offline.
    pub fn is_online(&self, now: DateTime<Utc>) -> bool {
        self.phase != NodePhase::Offline && now < self.lease_expires_at
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.lease_expires_at
    }

    /// Reset the lease to exactly `now + lease_seconds`, saturating at the
    /// latest representable instant.
    pub fn renew_lease(&mut self, now: DateTime<Utc>, lease_seconds: u64) {
        self.last_heartbeat = now;
        self.lease_expires_at = i64::try_from(lease_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    pub fn shutdown_url(&self) -> String {
        format!("{}/shutdown", self.base_url.trim_end_matches('/'))
    }
}

/// Body of `POST /api/v1/nodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub id: String,
    pub base_url: String,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub reasoners: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub process_id: Option<u32>,
}

impl RegisterNodeRequest {
    pub fn capabilities(&self) -> NodeCapabilities {
        NodeCapabilities {
            reasoners: self.reasoners.clone(),
            skills: self.skills.clone(),
        }
    }
}

/// Body of `PATCH /api/v1/nodes/{id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeStatusUpdate {
    #[serde(default)]
    pub phase: Option<NodePhase>,
    #[serde(default)]
    pub health_score: Option<f64>,
}

/// Body of `POST /api/v1/nodes/{id}/actions/ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionAckRequest {
    pub action_id: String,
}

/// Body of `POST /api/v1/nodes/{id}/shutdown`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeShutdownRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Lease granted to a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaseResponse {
    pub lease_seconds: u64,
    pub next_lease_renewal: DateTime<Utc>,
    #[serde(default)]
    pub pending_actions: Vec<PendingAction>,
}

impl LeaseResponse {
    pub fn for_node(node: &AgentNode, lease_seconds: u64) -> Self {
        Self {
            lease_seconds,
            next_lease_renewal: node.lease_expires_at,
            pending_actions: node.pending_actions.clone(),
        }
    }
}

/// Result of `POST /api/v1/nodes/{id}/shutdown`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeShutdownResponse {
    pub node_id: String,
    /// Whether the node's own shutdown endpoint accepted the request.
    pub acknowledged: bool,
    pub phase: NodePhase,
    #[serde(flatten)]
    pub lease: LeaseResponse,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventKind {
    Registered,
    Online,
    Offline,
    StatusChanged,
    Heartbeat,
    ShutdownRequested,
}

/// Published on the node bus whenever lease state changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    pub node_id: String,
    pub phase: NodePhase,
    pub health_score: f64,
    pub timestamp: DateTime<Utc>,
}

impl NodeEvent {
    pub fn new(kind: NodeEventKind, node: &AgentNode, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            node_id: node.id.clone(),
            phase: node.phase,
            health_score: node.health_score,
            timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self.kind {
            NodeEventKind::Registered => "node.registered",
            NodeEventKind::Online => "node.online",
            NodeEventKind::Offline => "node.offline",
            NodeEventKind::StatusChanged => "node.status_changed",
            NodeEventKind::Heartbeat => "node.heartbeat",
            NodeEventKind::ShutdownRequested => "node.shutdown_requested",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(now: DateTime<Utc>) -> AgentNode {
        AgentNode {
            id: "node-1".into(),
            base_url: "http://localhost:8001/".into(),
            agent_version: None,
            capabilities: NodeCapabilities::default(),
            phase: NodePhase::Ready,
            health_score: 100.0,
            process_id: None,
            registered_at: now,
            last_heartbeat: now,
            lease_expires_at: now,
            pending_actions: Vec::new(),
            version: 1,
        }
    }

    #[test]
    fn test_online_boundary_is_exclusive() {
        let now = Utc::now();
        let mut n = node(now);
        n.renew_lease(now, 30);
        assert!(n.is_online(now + Duration::seconds(29)));
        assert!(!n.is_online(now + Duration::seconds(30)));
    }

    #[test]
    fn test_oversized_lease_saturates() {
        let now = Utc::now();
        let mut n = node(now);
        n.renew_lease(now, u64::MAX);
        assert_eq!(n.lease_expires_at, DateTime::<Utc>::MAX_UTC);
        n.renew_lease(now, i64::MAX as u64);
        assert!(n.is_online(now + Duration::days(365)));
    }

    #[test]
    fn test_capability_comparison_ignores_order() {
        let a = NodeCapabilities {
            reasoners: vec!["plan".into(), "summarize".into()],
            skills: vec![],
        };
        let b = NodeCapabilities {
            reasoners: vec!["summarize".into(), "plan".into()],
            skills: vec![],
        };
        assert!(a.same_as(&b));
    }

    #[test]
    fn test_shutdown_url_trims_trailing_slash() {
        assert_eq!(node(Utc::now()).shutdown_url(), "http://localhost:8001/shutdown");
    }
}
