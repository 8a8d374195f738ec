//! Escalating node shutdown.
//!
//! ```text
//! http-shutdown-attempt ──ok──────────────────────────────▶ Graceful
//!        │ error / timeout
//!        ▼
//!   signal-attempt ──exited within grace──────────────────▶ Exited
//!        │ still alive
//!        ▼
//!    force-kill ──────────────────────────────────────────▶ ForceKilled
//! ```
//!
//! The control plane itself only runs the first stage against remote nodes.
//! The signal stages need a [`ProcessController`] for a process on this host.

use agentfield_core::{ControlPlaneError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownStage {
    HttpShutdownAttempt,
    SignalAttempt,
    ForceKill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOutcome {
    /// The node acknowledged its shutdown endpoint.
    Graceful,
    /// The process exited after the termination signal.
    Exited,
    /// The process was still alive after the grace period and was killed.
    ForceKilled,
    /// HTTP failed and no local process could be signalled.
    Unreachable,
}

/// Body posted to a node's `/shutdown` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeShutdownNotice {
    pub graceful: bool,
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// First stage: ask the node to stop over HTTP.
#[async_trait]
pub trait ShutdownNotifier: Send + Sync {
    async fn notify(&self, shutdown_url: &str, notice: &NodeShutdownNotice, timeout: Duration)
    -> Result<()>;
}

/// Signal stages for a process on this host.
pub trait ProcessController: Send + Sync {
    fn terminate(&self, pid: u32) -> Result<()>;

    fn is_alive(&self, pid: u32) -> bool;

    fn kill(&self, pid: u32) -> Result<()>;
}

pub struct HttpShutdownNotifier {
    client: reqwest::Client,
}

impl HttpShutdownNotifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ShutdownNotifier for HttpShutdownNotifier {
    async fn notify(
        &self,
        shutdown_url: &str,
        notice: &NodeShutdownNotice,
        timeout: Duration,
    ) -> Result<()> {
        let response = self
            .client
            .post(shutdown_url)
            .json(notice)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ControlPlaneError::timeout(format!("shutdown request to {}", shutdown_url))
                } else {
                    ControlPlaneError::delivery(format!("shutdown request to {}: {}", shutdown_url, e))
                }
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ControlPlaneError::delivery(format!(
                "shutdown request to {} returned {}",
                shutdown_url,
                response.status()
            )))
        }
    }
}

/// Check that `pid` names a single process.
///
/// `kill(2)` treats 0 as the caller's process group and negative values as
/// groups or every process, so only `1..=i32::MAX` is accepted.
pub fn validate_pid(pid: u32) -> Result<i32> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(raw),
        _ => Err(ControlPlaneError::validation(format!(
            "process id {} does not name a single process",
            pid
        ))),
    }
}

/// Signals through `kill(2)`.
#[cfg(unix)]
pub struct SignalProcessController;

#[cfg(unix)]
impl SignalProcessController {
    fn send(pid: u32, signal: Option<nix::sys::signal::Signal>) -> Result<()> {
        use nix::unistd::Pid;

        let raw = validate_pid(pid)?;
        nix::sys::signal::kill(Pid::from_raw(raw), signal).map_err(|e| {
            ControlPlaneError::Other(anyhow::anyhow!("Failed to signal process {}: {}", pid, e))
        })
    }
}

#[cfg(unix)]
impl ProcessController for SignalProcessController {
    fn terminate(&self, pid: u32) -> Result<()> {
        Self::send(pid, Some(nix::sys::signal::Signal::SIGTERM))
    }

    fn is_alive(&self, pid: u32) -> bool {
        // A null signal checks existence without delivering anything.
        Self::send(pid, None).is_ok()
    }

    fn kill(&self, pid: u32) -> Result<()> {
        Self::send(pid, Some(nix::sys::signal::Signal::SIGKILL))
    }
}

/// Default controller for the current platform, if signals are supported.
pub fn platform_process_controller() -> Option<Arc<dyn ProcessController>> {
    #[cfg(unix)]
    {
        Some(Arc::new(SignalProcessController))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownTimeouts {
    pub http_timeout: Duration,
    pub signal_grace: Duration,
    pub poll_interval: Duration,
    /// Drain time advertised to the node in the notice.
    pub drain_seconds: u64,
}

impl Default for ShutdownTimeouts {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(10),
            signal_grace: Duration::from_secs(3),
            poll_interval: Duration::from_millis(100),
            drain_seconds: 30,
        }
    }
}

impl ShutdownTimeouts {
    pub fn from_lease_config(config: &agentfield_core::config::LeaseConfig) -> Self {
        Self {
            http_timeout: config.shutdown_ack_timeout(),
            signal_grace: config.signal_grace(),
            drain_seconds: config.lease_seconds,
            ..Default::default()
        }
    }
}

/// Runs the escalation for one node.
pub struct ShutdownProtocol {
    notifier: Arc<dyn ShutdownNotifier>,
    process: Option<Arc<dyn ProcessController>>,
    timeouts: ShutdownTimeouts,
}

impl ShutdownProtocol {
    pub fn new(
        notifier: Arc<dyn ShutdownNotifier>,
        process: Option<Arc<dyn ProcessController>>,
        timeouts: ShutdownTimeouts,
    ) -> Self {
        Self {
            notifier,
            process,
            timeouts,
        }
    }

    pub async fn run(&self, shutdown_url: &str, pid: Option<u32>, reason: Option<String>) -> ShutdownOutcome {
        let notice = NodeShutdownNotice {
            graceful: true,
            timeout_seconds: self.timeouts.drain_seconds,
            reason,
        };

        debug!(stage = ?ShutdownStage::HttpShutdownAttempt, url = shutdown_url, "Requesting node shutdown");
        match self
            .notifier
            .notify(shutdown_url, &notice, self.timeouts.http_timeout)
            .await
        {
            Ok(()) => {
                info!(url = shutdown_url, "Node acknowledged shutdown request");
                return ShutdownOutcome::Graceful;
            }
            Err(e) => warn!(url = shutdown_url, error = %e, "HTTP shutdown failed"),
        }

        let (Some(pid), Some(process)) = (pid, self.process.as_ref()) else {
            return ShutdownOutcome::Unreachable;
        };
        if let Err(e) = validate_pid(pid) {
            warn!(pid, error = %e, "Refusing to signal");
            return ShutdownOutcome::Unreachable;
        }

        debug!(stage = ?ShutdownStage::SignalAttempt, pid, "Sending termination signal");
        if let Err(e) = process.terminate(pid) {
            warn!(pid, error = %e, "Termination signal failed");
        }

        let deadline = tokio::time::Instant::now() + self.timeouts.signal_grace;
        while tokio::time::Instant::now() < deadline {
            if !process.is_alive(pid) {
                info!(pid, "Process exited after termination signal");
                return ShutdownOutcome::Exited;
            }
            tokio::time::sleep(self.timeouts.poll_interval).await;
        }
        if !process.is_alive(pid) {
            return ShutdownOutcome::Exited;
        }

        warn!(stage = ?ShutdownStage::ForceKill, pid, "Process still alive after grace period, killing");
        if let Err(e) = process.kill(pid) {
            warn!(pid, error = %e, "Force kill failed");
        }
        ShutdownOutcome::ForceKilled
    }
}
