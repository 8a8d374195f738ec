//! Execution routing.
//!
//! Resolves `agent.reasoner` targets against live nodes, creates the record
//! and its workflow step, calls the agent under `agent_call_timeout`, and
//! drives the record to a terminal state. Async executions go through a
//! bounded queue served by a fixed number of workers; a full queue fails the
//! execution immediately instead of blocking the request.

use agentfield_core::config::ExecutionQueueConfig;
use agentfield_core::types::*;
use agentfield_core::{ControlPlaneError, Result};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::invoker::{AgentCall, AgentInvoker, AgentReply};
use super::store::ExecutionRecordStore;
use crate::delivery::ExecutionWebhookDispatcher;
use crate::events::{ExecutionBus, ReasonerBus};
use crate::nodes::LeaseManager;

pub const QUEUE_FULL_MESSAGE: &str = "async execution queue is full";

struct AsyncJob {
    call: AgentCall,
}

/// How an agent call ended, before it is written to the record.
enum CallOutcome {
    Succeeded(Value),
    Failed(String),
    TimedOut(String),
    /// Accepted by the agent; completion arrives as a status report.
    Pending,
}

pub struct ExecutionService {
    records: Arc<ExecutionRecordStore>,
    nodes: Arc<LeaseManager>,
    invoker: Arc<dyn AgentInvoker>,
    webhooks: Arc<ExecutionWebhookDispatcher>,
    bus: ExecutionBus,
    reasoners: ReasonerBus,
    config: ExecutionQueueConfig,
    queue: mpsc::Sender<AsyncJob>,
    receiver: Mutex<Option<mpsc::Receiver<AsyncJob>>>,
    in_flight: DashMap<String, CancellationToken>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl ExecutionService {
    pub fn new(
        records: Arc<ExecutionRecordStore>,
        nodes: Arc<LeaseManager>,
        invoker: Arc<dyn AgentInvoker>,
        webhooks: Arc<ExecutionWebhookDispatcher>,
        bus: ExecutionBus,
        reasoners: ReasonerBus,
        config: ExecutionQueueConfig,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(config.async_queue_capacity.max(1));
        Self {
            records,
            nodes,
            invoker,
            webhooks,
            bus,
            reasoners,
            config,
            queue,
            receiver: Mutex::new(Some(receiver)),
            in_flight: DashMap::new(),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn records(&self) -> &Arc<ExecutionRecordStore> {
        &self.records
    }

    pub fn webhooks(&self) -> &Arc<ExecutionWebhookDispatcher> {
        &self.webhooks
    }

    fn publish_reasoner(&self, record: &ExecutionRecord) {
        if let Some(event) = ReasonerEvent::for_record(record, Utc::now()) {
            self.reasoners.publish(event);
        }
    }

    /// Start the async workers. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let Some(mut receiver) = self.receiver.lock().take() else {
            return;
        };
        let workers = Arc::new(Semaphore::new(self.config.async_worker_count.max(1)));
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(job) => job,
                        None => break,
                    },
                };
                let permit = tokio::select! {
                    _ = this.cancel.cancelled() => {
                        this.abandon(job).await;
                        break;
                    }
                    permit = Arc::clone(&workers).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let worker = Arc::clone(&this);
                this.tasks.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = worker.run_call(job.call, false).await {
                        warn!(error = %e, "Async execution failed");
                    }
                });
            }

            receiver.close();
            while let Ok(job) = receiver.try_recv() {
                this.abandon(job).await;
            }
        });
        info!(
            workers = self.config.async_worker_count,
            capacity = self.config.async_queue_capacity,
            "Async execution workers started"
        );
    }

    async fn abandon(&self, job: AsyncJob) {
        let id = job.call.execution_id;
        if let Err(e) = self
            .finish(&id, CallOutcome::Failed("control plane shut down before execution started".into()))
            .await
        {
            warn!(execution_id = %id, error = %e, "Failed to fail abandoned execution");
        }
    }

    /// Resolve the target, create the record and attach it to its workflow.
    async fn prepare(&self, target: &str, request: &ExecuteRequest) -> Result<(ExecutionRecord, AgentCall)> {
        let target: ExecutionTarget = target.parse()?;
        let node = self.nodes.get_node(&target.agent_node_id).await?;
        let now = Utc::now();
        if !node.is_online(now) {
            return Err(ControlPlaneError::unavailable(format!(
                "agent node {} is offline",
                node.id
            )));
        }
        if !node.capabilities.has_reasoner(&target.reasoner_id) {
            return Err(ControlPlaneError::not_found(
                "reasoner",
                format!("{}.{}", target.agent_node_id, target.reasoner_id),
            ));
        }

        let mut record = ExecutionRecord::new(
            format!("exec_{}", uuid::Uuid::new_v4().simple()),
            &node.id,
            &target.reasoner_id,
            request.input.clone(),
            now,
        );
        let workflow = self
            .records
            .workflows()
            .plan(&mut record, request.run_id.clone(), request.parent_execution_id.clone())
            .await?;
        let stored = self.records.create(record, workflow).await?;

        let call = AgentCall {
            base_url: node.base_url.clone(),
            reasoner_id: stored.reasoner_id.clone(),
            execution_id: stored.execution_id.clone(),
            run_id: stored.run_id.clone(),
            parent_execution_id: stored.parent_execution_id.clone(),
            input: stored.input.clone(),
        };
        Ok((stored, call))
    }

    /// Run an execution to completion and return the final record.
    pub async fn execute_sync(&self, target: &str, request: ExecuteRequest) -> Result<ExecutionRecord> {
        let (record, call) = self.prepare(target, &request).await?;
        debug!(execution_id = %record.execution_id, target, "Executing synchronously");
        self.run_call(call, true).await
    }

    /// Queue an execution and return immediately.
    pub async fn execute_async(&self, target: &str, request: ExecuteRequest) -> Result<AsyncExecuteResponse> {
        let (record, call) = self.prepare(target, &request).await?;

        // Registration problems never fail the execution itself.
        let (webhook_registered, webhook_error) = match request.webhook {
            Some(hook) => match self.webhooks.register(&record.execution_id, hook).await {
                Ok(_) => (true, None),
                Err(e) => {
                    warn!(execution_id = %record.execution_id, error = %e, "Execution webhook rejected");
                    (false, Some(e.to_string()))
                }
            },
            None => (false, None),
        };

        if let Err(e) = self.queue.try_send(AsyncJob { call }) {
            let message = match e {
                mpsc::error::TrySendError::Full(_) => QUEUE_FULL_MESSAGE,
                mpsc::error::TrySendError::Closed(_) => "async execution queue is closed",
            };
            warn!(execution_id = %record.execution_id, "{}", message);
            self.finish(&record.execution_id, CallOutcome::Failed(message.to_string()))
                .await?;
            return Err(ControlPlaneError::unavailable(message));
        }

        Ok(AsyncExecuteResponse {
            execution_id: record.execution_id,
            run_id: record.run_id,
            status: record.status,
            webhook_registered,
            webhook_error,
        })
    }

    /// Call the agent for a prepared execution.
    ///
    /// With `wait_for_report` an agent that answers 202 is awaited until it
    /// reports a terminal status or the call deadline passes.
    async fn run_call(&self, call: AgentCall, wait_for_report: bool) -> Result<ExecutionRecord> {
        let id = call.execution_id.clone();
        let running = self
            .records
            .update(&id, |current| {
                let mut next = current.clone();
                next.mark_running(Utc::now())?;
                Ok(next)
            })
            .await;
        match running {
            Ok(record) => self.publish_reasoner(&record),
            Err(ControlPlaneError::Conflict(_)) => {
                debug!(execution_id = %id, "Execution finished before it started, skipping agent call");
                return self.records.get(&id).await;
            }
            Err(e) => return Err(e),
        }

        let token = self.cancel.child_token();
        self.in_flight.insert(id.clone(), token.clone());
        let outcome = self.call_agent(&call, &token, wait_for_report).await;
        self.in_flight.remove(&id);

        match outcome {
            CallOutcome::Pending => self.records.get(&id).await,
            outcome => self.finish(&id, outcome).await,
        }
    }

    async fn call_agent(&self, call: &AgentCall, token: &CancellationToken, wait_for_report: bool) -> CallOutcome {
        let timeout = self.config.agent_call_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        // Subscribe before calling so a fast status report is not missed.
        let mut reports = wait_for_report.then(|| self.bus.subscribe_lossless());

        let reply = tokio::select! {
            _ = token.cancelled() => {
                return CallOutcome::Failed("execution interrupted before the agent replied".into());
            }
            reply = tokio::time::timeout(timeout, self.invoker.invoke(call, timeout)) => reply,
        };

        match reply {
            Err(_) | Ok(Err(ControlPlaneError::Timeout(_))) => CallOutcome::TimedOut(format!(
                "agent call exceeded {}s",
                timeout.as_secs()
            )),
            Ok(Err(e)) => CallOutcome::Failed(e.to_string()),
            Ok(Ok(AgentReply::Completed(result))) => CallOutcome::Succeeded(result),
            Ok(Ok(AgentReply::Accepted)) => {
                let Some(reports) = reports.as_mut() else {
                    return CallOutcome::Pending;
                };
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return CallOutcome::Pending,
                        _ = tokio::time::sleep_until(deadline) => {
                            return CallOutcome::TimedOut(format!(
                                "agent did not report completion within {}s",
                                timeout.as_secs()
                            ));
                        }
                        event = reports.recv() => match event {
                            Some(event)
                                if event.record.execution_id == call.execution_id
                                    && event.record.is_terminal() =>
                            {
                                return CallOutcome::Pending;
                            }
                            Some(_) => {}
                            None => return CallOutcome::Pending,
                        },
                    }
                }
            }
        }
    }

    /// Write a call outcome. An execution that already reached a different
    /// terminal state (a cancel, a status report) keeps it.
    async fn finish(&self, id: &str, outcome: CallOutcome) -> Result<ExecutionRecord> {
        let mut changed = false;
        let result = self
            .records
            .update(id, |current| {
                let mut next = current.clone();
                let now = Utc::now();
                changed = match &outcome {
                    CallOutcome::Succeeded(result) => next.mark_succeeded(result.clone(), now)?,
                    CallOutcome::Failed(message) => {
                        next.mark_terminal_error(ExecutionStatus::Failed, message.clone(), now)?
                    }
                    CallOutcome::TimedOut(message) => {
                        next.mark_terminal_error(ExecutionStatus::Timeout, message.clone(), now)?
                    }
                    CallOutcome::Pending => false,
                };
                Ok(next)
            })
            .await;

        match result {
            Ok(record) => {
                if changed {
                    self.publish_reasoner(&record);
                }
                info!(
                    execution_id = %id,
                    status = %record.status,
                    duration_ms = ?record.duration_ms(),
                    "Execution finished"
                );
                Ok(record)
            }
            Err(ControlPlaneError::Conflict(_)) => {
                debug!(execution_id = %id, "Execution already terminal, keeping its status");
                self.records.get(id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel an execution and interrupt its agent call if one is running.
    pub async fn cancel(&self, execution_id: &str) -> Result<ExecutionRecord> {
        let mut changed = false;
        let record = self
            .records
            .update(execution_id, |current| {
                let mut next = current.clone();
                changed =
                    next.mark_terminal_error(ExecutionStatus::Cancelled, "cancelled by request", Utc::now())?;
                Ok(next)
            })
            .await?;
        if changed {
            self.publish_reasoner(&record);
        }
        if let Some((_, token)) = self.in_flight.remove(execution_id) {
            token.cancel();
        }
        info!(execution_id = %execution_id, "Execution cancelled");
        Ok(record)
    }

    /// Apply a status reported by the agent node running the execution.
    pub async fn report_status(&self, execution_id: &str, report: ExecutionStatusReport) -> Result<ExecutionRecord> {
        if report.status == ExecutionStatus::Queued {
            return Err(ControlPlaneError::validation(
                "an execution cannot be reported back to queued",
            ));
        }
        let mut changed = false;
        let record = self
            .records
            .update(execution_id, |current| {
                let mut next = current.clone();
                let now = Utc::now();
                changed = match report.status {
                    ExecutionStatus::Running => next.mark_running(now)?,
                    ExecutionStatus::Succeeded => {
                        next.mark_succeeded(report.result.clone().unwrap_or(Value::Null), now)?
                    }
                    status => next.mark_terminal_error(
                        status,
                        report
                            .error
                            .clone()
                            .unwrap_or_else(|| format!("agent reported {}", status)),
                        now,
                    )?,
                };
                Ok(next)
            })
            .await?;
        if changed {
            self.publish_reasoner(&record);
        }
        Ok(record)
    }

    /// Stop the workers. Calls in flight are interrupted and failed; queued
    /// executions are failed without being started.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Execution service stopped");
    }
}
