pub mod context;
pub mod events;
pub mod factory;

pub use context::{ExecutionContext, ExecutionContextSummary};
pub use factory::{EphemeralWorkerFactory, PooledWorkerFactory, WorkerAcquisitionError, WorkerFactory};

use crate::comms::{DisconnectCause, WorkerChannel, WorkerEvent};
use crate::engine::context::ContextStore;
use crate::engine::events::{EventHub, LogHub};
use crate::provider::ProvisioningError;
use crate::repo::{JobRepository, RepoError, WorkerRepository};
use crate::scheduler::{Scheduler, SchedulingError};
use crate::service::quota::{QuotaError, QuotaService};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use hodei_common::model::{
    Execution, ExecutionEvent, ExecutionEventKind, ExecutionId, ExecutionStatus, InvalidTransition,
    Job, JobId, JobStatus, LogChunk, LogStream, PoolId, ProviderKind, QuotaViolation,
    ResourcePool, ResourceUsage, ViolationAction, Worker, WorkerCapabilities, WorkerId,
    WorkerStatus,
};
use hodei_wire::message::{orchestrator_message, CancelSignal, ExecutionAssignment, OrchestratorMessage};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub cancel_grace: Duration,
    pub retry_delay: Duration,
    pub per_execution_log_bytes: usize,
    pub max_retained_contexts: usize,
    /// Per-subscriber buffer of the event fan-out.
    pub event_buffer: usize,
    /// Ring capacity of the log fan-out.
    pub log_ring_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            per_execution_log_bytes: 10_000_000,
            max_retained_contexts: 256,
            event_buffer: 256,
            log_ring_capacity: 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),
    #[error("quota exceeded for pool {pool_id}")]
    QuotaExceeded {
        pool_id: PoolId,
        violations: Vec<QuotaViolation>,
    },
    #[error("admission deferred: soft quota of pool {pool_id} reached")]
    AdmissionDeferred { pool_id: PoolId },
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("execution not found: {0}")]
    NotFound(ExecutionId),
    #[error("execution already terminal: {0}")]
    AlreadyTerminal(ExecutionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationState {
    /// Signal sent; the worker has the grace period to wind down.
    Pending,
    /// Torn down immediately.
    Forced,
}

#[derive(Debug, Clone)]
enum TerminalOutcome {
    WorkerResult {
        success: bool,
        exit_code: i32,
        details: String,
    },
    WorkerLost {
        cause: String,
    },
    AcquisitionFailed {
        error: String,
        retryable: bool,
    },
    ForcedCancel {
        reason: String,
    },
}

#[derive(Debug, Clone)]
struct CancelRequest {
    reason: String,
    force: bool,
}

struct ActiveExecution {
    job_id: JobId,
    pool_id: PoolId,
    pool_kind: ProviderKind,
    worker_id: Option<WorkerId>,
    quota_request: ResourceUsage,
    cancel: Option<CancelRequest>,
    cancel_token: CancellationToken,
}

/// Owns a job from admission through its terminal state: placement, quota,
/// worker acquisition, the assignment, relaying status and logs, and the
/// terminal bookkeeping. Everything the engine knows about workers flows
/// through the worker channel and the demuxed event stream.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    jobs: Arc<dyn JobRepository>,
    workers: Arc<dyn WorkerRepository>,
    scheduler: Arc<Scheduler>,
    quota: Arc<QuotaService>,
    channel: Arc<dyn WorkerChannel>,
    factories: HashMap<ProviderKind, Arc<dyn WorkerFactory>>,
    active: Mutex<HashMap<ExecutionId, ActiveExecution>>,
    contexts: Mutex<ContextStore>,
    events: EventHub,
    logs: LogHub,
    config: EngineConfig,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        workers: Arc<dyn WorkerRepository>,
        scheduler: Arc<Scheduler>,
        quota: Arc<QuotaService>,
        channel: Arc<dyn WorkerChannel>,
        factories: HashMap<ProviderKind, Arc<dyn WorkerFactory>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                jobs,
                workers,
                scheduler,
                quota,
                channel,
                factories,
                active: Mutex::new(HashMap::new()),
                contexts: Mutex::new(ContextStore::new(config.max_retained_contexts)),
                events: EventHub::new(config.event_buffer),
                logs: LogHub::new(config.log_ring_capacity),
                config,
            }),
        }
    }

    /// Consumes the demuxed worker events. Spawn exactly once.
    pub fn spawn_dispatcher(&self, mut events: mpsc::Receiver<WorkerEvent>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                engine.handle_worker_event(event).await;
            }
            debug!("worker event channel closed, dispatcher stopping");
        })
    }

    /// Admits one job for execution: persists it as queued, places it,
    /// claims quota, and hands off to asynchronous worker acquisition.
    /// Placement and quota failures surface here; later failures land on
    /// the execution and job records.
    pub async fn submit(&self, job: Job) -> Result<ExecutionId, ExecutionError> {
        let inner = &self.inner;
        let mut job = job;
        if inner.jobs.find_by_id(&job.id).await?.is_none() {
            inner.jobs.save(&job).await?;
        }
        job.update_status(JobStatus::Queued)?;

        let execution = Execution::new(job.id.clone());
        let execution_id = execution.id.clone();
        job.latest_execution_id = Some(execution_id.clone());
        inner.jobs.update(&job).await?;
        inner.contexts.lock().unwrap().insert(ExecutionContext::new(
            execution,
            inner.config.per_execution_log_bytes,
        ));
        self.lifecycle_event(&execution_id, "job queued").await;

        let pool = match inner.scheduler.select_pool(&job, None).await {
            Ok(pool) => pool,
            Err(err) => {
                // placement errors are transient capacity conditions and
                // retried, except for a misconfigured strategy name
                let retryable = !matches!(err, SchedulingError::UnknownStrategy(_));
                self.fail_before_start(&execution_id, &mut job, &err.to_string(), retryable)
                    .await;
                return Err(err.into());
            }
        };
        self.lifecycle_event(&execution_id, &format!("pool selected: {}", pool.name))
            .await;

        let request = ResourceUsage {
            cpu_cores: job.resource_requirements.cpu_cores,
            memory_bytes: job.resource_requirements.memory_bytes,
            concurrent_jobs: 1,
            disk_bytes: job.resource_requirements.disk_bytes,
        };
        match inner.quota.try_allocate(&pool.id, &request).await {
            Err(QuotaError::Exceeded { pool_id, violations }) => {
                self.fail_before_start(&execution_id, &mut job, "pool quota exceeded", false)
                    .await;
                return Err(ExecutionError::QuotaExceeded {
                    pool_id,
                    violations,
                });
            }
            Ok(outcome) if outcome.action == ViolationAction::Queued => {
                // job stays queued for a later attempt; the tentative
                // execution never started
                inner.contexts.lock().unwrap().remove(&execution_id);
                job.latest_execution_id = None;
                inner.jobs.update(&job).await?;
                return Err(ExecutionError::AdmissionDeferred {
                    pool_id: pool.id.clone(),
                });
            }
            Ok(_) => {}
        }

        job.update_status(JobStatus::Scheduled)?;
        inner.jobs.update(&job).await?;

        let cancel_token = CancellationToken::new();
        inner.active.lock().unwrap().insert(
            execution_id.clone(),
            ActiveExecution {
                job_id: job.id.clone(),
                pool_id: pool.id.clone(),
                pool_kind: pool.kind,
                worker_id: None,
                quota_request: request,
                cancel: None,
                cancel_token: cancel_token.clone(),
            },
        );

        let engine = self.clone();
        let spawned_execution_id = execution_id.clone();
        tokio::spawn(async move {
            engine
                .acquire_and_assign(spawned_execution_id, job, pool, cancel_token)
                .await;
        });

        Ok(execution_id)
    }

    /// Requests cancellation. Without `force` the worker gets the grace
    /// period to report back before the engine tears it down.
    pub async fn cancel(
        &self,
        execution_id: &ExecutionId,
        reason: &str,
        force: bool,
    ) -> Result<CancellationState, ExecutionError> {
        let inner = &self.inner;
        let (worker_id, cancel_token) = {
            let mut active = inner.active.lock().unwrap();
            match active.get_mut(execution_id) {
                Some(entry) => {
                    entry.cancel = Some(CancelRequest {
                        reason: reason.to_string(),
                        force,
                    });
                    (entry.worker_id.clone(), entry.cancel_token.clone())
                }
                None => {
                    let terminal = inner
                        .contexts
                        .lock()
                        .unwrap()
                        .get(execution_id)
                        .map(|context| context.execution.status.is_terminal())
                        .unwrap_or(false);
                    return Err(if terminal {
                        ExecutionError::AlreadyTerminal(execution_id.clone())
                    } else {
                        ExecutionError::NotFound(execution_id.clone())
                    });
                }
            }
        };

        info!(execution_id = %execution_id, force, "cancellation requested");
        // aborts provisioning still in flight; harmless later
        cancel_token.cancel();

        if let Some(worker_id) = &worker_id {
            let signal = OrchestratorMessage {
                payload: Some(orchestrator_message::Payload::CancelSignal(CancelSignal {
                    execution_id: execution_id.to_string(),
                    reason: reason.to_string(),
                    grace_ms: inner.config.cancel_grace.as_millis() as u64,
                })),
            };
            if !inner.channel.send_to(worker_id, signal).await {
                self.finalize(
                    execution_id,
                    TerminalOutcome::WorkerLost {
                        cause: "worker disconnected before the cancel signal".to_string(),
                    },
                )
                .await;
                return Ok(CancellationState::Forced);
            }
        }

        if force {
            self.finalize(
                execution_id,
                TerminalOutcome::ForcedCancel {
                    reason: reason.to_string(),
                },
            )
            .await;
            return Ok(CancellationState::Forced);
        }

        let engine = self.clone();
        let pending_execution = execution_id.clone();
        let grace = inner.config.cancel_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_cancelling = engine
                .inner
                .active
                .lock()
                .unwrap()
                .get(&pending_execution)
                .is_some_and(|entry| entry.cancel.is_some());
            if still_cancelling {
                warn!(execution_id = %pending_execution, "cancellation grace expired, forcing teardown");
                engine
                    .finalize(
                        &pending_execution,
                        TerminalOutcome::ForcedCancel {
                            reason: "cancellation grace expired".to_string(),
                        },
                    )
                    .await;
            }
        });
        Ok(CancellationState::Pending)
    }

    pub fn active_executions(&self) -> Vec<ExecutionContextSummary> {
        self.inner.contexts.lock().unwrap().active_summaries()
    }

    pub fn execution_context(&self, execution_id: &ExecutionId) -> Option<ExecutionContext> {
        self.inner
            .contexts
            .lock()
            .unwrap()
            .get(execution_id)
            .cloned()
    }

    /// Infinite stream of execution events; the subscriber is
    /// back-pressured, never skipped.
    pub async fn events(&self) -> BoxStream<'static, ExecutionEvent> {
        self.inner.events.subscribe().await
    }

    /// Infinite stream of log chunks; slow subscribers lose the oldest
    /// chunks instead of slowing the engine.
    pub fn logs(&self) -> BoxStream<'static, LogChunk> {
        self.inner.logs.subscribe()
    }

    async fn acquire_and_assign(
        &self,
        execution_id: ExecutionId,
        mut job: Job,
        pool: ResourcePool,
        cancel_token: CancellationToken,
    ) {
        let inner = &self.inner;
        let Some(factory) = inner.factories.get(&pool.kind).cloned() else {
            self.finalize(
                &execution_id,
                TerminalOutcome::AcquisitionFailed {
                    error: format!("no worker factory for provider kind {}", pool.kind),
                    retryable: false,
                },
            )
            .await;
            return;
        };

        let acquired = tokio::select! {
            _ = cancel_token.cancelled() => {
                self.finalize(
                    &execution_id,
                    TerminalOutcome::ForcedCancel {
                        reason: "cancelled while acquiring a worker".to_string(),
                    },
                )
                .await;
                return;
            }
            acquired = factory.acquire(&pool, &job) => acquired,
        };
        let mut worker = match acquired {
            Ok(worker) => worker,
            Err(err) => {
                let retryable = !matches!(
                    err,
                    WorkerAcquisitionError::Provisioning(ProvisioningError::InvalidSpec(_))
                );
                self.finalize(
                    &execution_id,
                    TerminalOutcome::AcquisitionFailed {
                        error: err.to_string(),
                        retryable,
                    },
                )
                .await;
                return;
            }
        };

        if let Err(err) = worker.assign_execution(execution_id.clone(), job.resource_requirements)
        {
            factory.release(&worker, true).await;
            self.finalize(
                &execution_id,
                TerminalOutcome::AcquisitionFailed {
                    error: err.to_string(),
                    retryable: true,
                },
            )
            .await;
            return;
        }
        if let Err(err) = inner.workers.save(&worker).await {
            factory.release(&worker, true).await;
            self.finalize(
                &execution_id,
                TerminalOutcome::AcquisitionFailed {
                    error: err.to_string(),
                    retryable: true,
                },
            )
            .await;
            return;
        }

        // the execution may have been torn down, or a cancellation may have
        // raced the acquisition; never assign in either case
        enum Admission {
            Proceed,
            Cancelling,
            Gone,
        }
        let admission = {
            let mut active = inner.active.lock().unwrap();
            match active.get_mut(&execution_id) {
                Some(entry) if entry.cancel.is_some() => Admission::Cancelling,
                Some(entry) => {
                    entry.worker_id = Some(worker.id.clone());
                    Admission::Proceed
                }
                None => Admission::Gone,
            }
        };
        match admission {
            Admission::Proceed => {}
            Admission::Cancelling => {
                if worker.release_execution().is_ok() {
                    let _ = inner.workers.save(&worker).await;
                }
                factory.release(&worker, false).await;
                self.finalize(
                    &execution_id,
                    TerminalOutcome::ForcedCancel {
                        reason: "cancelled while acquiring a worker".to_string(),
                    },
                )
                .await;
                return;
            }
            Admission::Gone => {
                if worker.release_execution().is_ok() {
                    let _ = inner.workers.save(&worker).await;
                }
                factory.release(&worker, true).await;
                return;
            }
        }

        {
            let mut contexts = inner.contexts.lock().unwrap();
            if let Some(context) = contexts.get_mut(&execution_id) {
                context.execution.worker_id = Some(worker.id.clone());
                let _ = context.execution.update_status(ExecutionStatus::Running);
            }
        }
        if let Err(err) = self.update_job_status(&mut job, JobStatus::Running).await {
            warn!(job_id = %job.id, %err, "failed to mark job running");
        }
        self.lifecycle_event(&execution_id, &format!("worker assigned: {}", worker.id))
            .await;

        let assignment = OrchestratorMessage {
            payload: Some(orchestrator_message::Payload::ExecutionAssignment(
                ExecutionAssignment {
                    execution_id: execution_id.to_string(),
                    job_id: job.id.to_string(),
                    definition: Some(job.payload.clone().into()),
                },
            )),
        };
        if !inner.channel.send_to(&worker.id, assignment).await {
            self.finalize(
                &execution_id,
                TerminalOutcome::WorkerLost {
                    cause: "worker disconnected before the assignment".to_string(),
                },
            )
            .await;
            return;
        }
        info!(execution_id = %execution_id, worker_id = %worker.id, "assignment sent");
    }

    async fn handle_worker_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Registered {
                worker_id,
                pool_id,
                capabilities,
            } => self.on_registered(worker_id, pool_id, capabilities).await,
            WorkerEvent::HeartbeatReceived { worker_id, at } => {
                self.on_heartbeat(worker_id, at).await
            }
            WorkerEvent::StatusUpdated {
                execution_id,
                kind,
                message,
                metadata,
                ..
            } => self.on_status(execution_id, kind, message, metadata).await,
            WorkerEvent::LogChunkReceived {
                execution_id,
                stream,
                payload,
                ..
            } => self.on_log(execution_id, stream, payload).await,
            WorkerEvent::ResultReceived {
                execution_id,
                success,
                exit_code,
                details,
                ..
            } => {
                self.finalize(
                    &execution_id,
                    TerminalOutcome::WorkerResult {
                        success,
                        exit_code,
                        details,
                    },
                )
                .await
            }
            WorkerEvent::Disconnected { worker_id, cause } => {
                self.on_disconnected(worker_id, cause).await
            }
        }
    }

    async fn on_registered(
        &self,
        worker_id: WorkerId,
        pool_id: PoolId,
        capabilities: WorkerCapabilities,
    ) {
        let inner = &self.inner;
        let now = Utc::now();
        match inner.workers.find_by_id(&worker_id).await {
            Ok(Some(mut worker)) => {
                if worker.status == WorkerStatus::Provisioning {
                    worker.capabilities = capabilities;
                    if let Err(err) = worker.update_status(WorkerStatus::Idle) {
                        warn!(worker_id = %worker_id, %err, "registration in unexpected state");
                    }
                }
                worker.record_heartbeat(now);
                if let Err(err) = inner.workers.save(&worker).await {
                    warn!(worker_id = %worker_id, %err, "failed to persist registration");
                }
            }
            Ok(None) => {
                // a pooled worker that was started out of band
                let mut worker = Worker::new(pool_id.clone(), capabilities);
                worker.id = worker_id.clone();
                if let Err(err) = worker.update_status(WorkerStatus::Idle) {
                    warn!(worker_id = %worker_id, %err, "fresh worker in unexpected state");
                }
                worker.record_heartbeat(now);
                if let Err(err) = inner.workers.save(&worker).await {
                    warn!(worker_id = %worker_id, %err, "failed to persist new worker");
                }
                info!(worker_id = %worker_id, pool_id = %pool_id, "externally started worker joined");
            }
            Err(err) => warn!(worker_id = %worker_id, %err, "worker lookup failed"),
        }
    }

    async fn on_heartbeat(&self, worker_id: WorkerId, at: DateTime<Utc>) {
        if let Ok(Some(mut worker)) = self.inner.workers.find_by_id(&worker_id).await {
            worker.record_heartbeat(at);
            if let Err(err) = self.inner.workers.save(&worker).await {
                warn!(worker_id = %worker_id, %err, "failed to persist heartbeat");
            }
        }
    }

    async fn on_status(
        &self,
        execution_id: ExecutionId,
        kind: ExecutionEventKind,
        message: String,
        metadata: HashMap<String, String>,
    ) {
        // the timestamp is assigned at append time, under the hub lock, to
        // give every subscriber one stable server-side order
        self.inner
            .events
            .publish_ordered(|| {
                let event = ExecutionEvent {
                    execution_id: execution_id.clone(),
                    kind,
                    message,
                    metadata,
                    timestamp: Utc::now(),
                };
                let mut contexts = self.inner.contexts.lock().unwrap();
                match contexts.get_mut(&execution_id) {
                    Some(context) => {
                        context.append_event(event.clone());
                        Some(event)
                    }
                    None => {
                        debug!(execution_id = %execution_id, "status update for unknown execution");
                        None
                    }
                }
            })
            .await;
    }

    async fn on_log(&self, execution_id: ExecutionId, stream: LogStream, payload: Bytes) {
        let chunk = LogChunk {
            execution_id: execution_id.clone(),
            stream,
            payload,
            timestamp: Utc::now(),
        };
        {
            let mut contexts = self.inner.contexts.lock().unwrap();
            match contexts.get_mut(&execution_id) {
                Some(context) => context.append_log(chunk.clone()),
                None => {
                    debug!(execution_id = %execution_id, "log chunk for unknown execution");
                    return;
                }
            }
        }
        self.inner.logs.publish(chunk);
    }

    async fn on_disconnected(&self, worker_id: WorkerId, cause: DisconnectCause) {
        let inner = &self.inner;
        let execution_id = {
            let active = inner.active.lock().unwrap();
            active
                .iter()
                .find(|(_, entry)| entry.worker_id.as_ref() == Some(&worker_id))
                .map(|(execution_id, _)| execution_id.clone())
        };
        if let Some(execution_id) = execution_id {
            let description = match &cause {
                DisconnectCause::HeartbeatTimeout => "heartbeats stopped".to_string(),
                DisconnectCause::Protocol(detail) => format!("protocol error: {detail}"),
                DisconnectCause::ConnectionClosed => "connection closed".to_string(),
                DisconnectCause::ShuttingDown => "session shut down".to_string(),
            };
            self.finalize(
                &execution_id,
                TerminalOutcome::WorkerLost { cause: description },
            )
            .await;
        }

        if let Ok(Some(mut worker)) = inner.workers.find_by_id(&worker_id).await {
            if !worker.status.is_terminal() {
                worker.execution_id = None;
                let result = match cause {
                    DisconnectCause::Protocol(_) | DisconnectCause::HeartbeatTimeout => {
                        worker.update_status(WorkerStatus::Error)
                    }
                    DisconnectCause::ConnectionClosed | DisconnectCause::ShuttingDown => worker
                        .update_status(WorkerStatus::Terminating)
                        .and_then(|()| worker.update_status(WorkerStatus::Terminated)),
                };
                if let Err(err) = result {
                    warn!(worker_id = %worker_id, %err, "disconnect in unexpected worker state");
                }
                if let Err(err) = inner.workers.save(&worker).await {
                    warn!(worker_id = %worker_id, %err, "failed to persist worker teardown");
                }
            }
        }
    }

    /// Single terminal bookkeeping path. Removing the active entry first
    /// makes this run at most once per execution, which keeps allocation
    /// and deallocation paired exactly.
    async fn finalize(&self, execution_id: &ExecutionId, outcome: TerminalOutcome) {
        let inner = &self.inner;
        let Some(entry) = inner.active.lock().unwrap().remove(execution_id) else {
            debug!(execution_id = %execution_id, "terminal signal for an execution no longer active");
            return;
        };
        entry.cancel_token.cancel();
        let cancel_requested = entry.cancel.is_some();

        let (status, exit_code, failure, retryable) = match &outcome {
            TerminalOutcome::WorkerResult {
                success,
                exit_code,
                details,
            } => {
                if *success {
                    (ExecutionStatus::Completed, Some(*exit_code), None, false)
                } else if cancel_requested {
                    (
                        ExecutionStatus::Cancelled,
                        Some(*exit_code),
                        Some(details.clone()),
                        false,
                    )
                } else {
                    (
                        ExecutionStatus::Failed,
                        Some(*exit_code),
                        Some(details.clone()),
                        true,
                    )
                }
            }
            TerminalOutcome::WorkerLost { cause } => {
                if cancel_requested {
                    (
                        ExecutionStatus::Cancelled,
                        None,
                        Some(format!("worker lost: {cause}")),
                        false,
                    )
                } else {
                    (
                        ExecutionStatus::Failed,
                        None,
                        Some(format!("worker lost: {cause}")),
                        true,
                    )
                }
            }
            TerminalOutcome::AcquisitionFailed { error, retryable } => (
                ExecutionStatus::Failed,
                None,
                Some(error.clone()),
                *retryable,
            ),
            TerminalOutcome::ForcedCancel { reason } => (
                ExecutionStatus::Cancelled,
                None,
                Some(reason.clone()),
                false,
            ),
        };

        {
            let mut contexts = inner.contexts.lock().unwrap();
            if let Some(context) = contexts.get_mut(execution_id) {
                if context.execution.worker_id.is_none() {
                    context.execution.worker_id = entry.worker_id.clone();
                }
                if let Err(err) = context.execution.update_status(status) {
                    warn!(execution_id = %execution_id, %err, "terminal status rejected");
                }
                context.execution.exit_code = exit_code;
                context.execution.failure = failure.clone();
            }
            contexts.mark_terminal(execution_id);
        }
        self.lifecycle_event(execution_id, &format!("execution {status}"))
            .await;

        if let Some(worker_id) = &entry.worker_id {
            self.settle_worker(worker_id, &entry, &outcome).await;
        }

        inner.quota.deallocate(&entry.pool_id, &entry.quota_request).await;

        match inner.jobs.find_by_id(&entry.job_id).await {
            Ok(Some(mut job)) => {
                let job_status = match status {
                    ExecutionStatus::Completed => JobStatus::Completed,
                    ExecutionStatus::Cancelled => JobStatus::Cancelled,
                    _ => JobStatus::Failed,
                };
                if let Err(err) = self.update_job_status(&mut job, job_status).await {
                    warn!(job_id = %job.id, %err, "failed to record job terminal status");
                }
                info!(
                    execution_id = %execution_id,
                    job_id = %job.id,
                    status = %status,
                    failure = failure.as_deref().unwrap_or(""),
                    "execution finished"
                );
                if job_status == JobStatus::Failed && retryable && job.can_retry() {
                    self.lifecycle_event(execution_id, "retry scheduled").await;
                    self.schedule_retry(job);
                }
            }
            Ok(None) => warn!(job_id = %entry.job_id, "job vanished before terminal bookkeeping"),
            Err(err) => warn!(job_id = %entry.job_id, %err, "job lookup failed during finalize"),
        }
    }

    async fn settle_worker(
        &self,
        worker_id: &WorkerId,
        entry: &ActiveExecution,
        outcome: &TerminalOutcome,
    ) {
        let inner = &self.inner;
        let factory = inner.factories.get(&entry.pool_kind).cloned();
        let worker = match inner.workers.find_by_id(worker_id).await {
            Ok(Some(worker)) => worker,
            _ => return,
        };

        match outcome {
            TerminalOutcome::WorkerResult { .. } => {
                let mut worker = worker;
                if worker.is_busy() && worker.release_execution().is_ok() {
                    if let Err(err) = inner.workers.save(&worker).await {
                        warn!(worker_id = %worker_id, %err, "failed to persist worker release");
                    }
                }
                if let Some(factory) = factory {
                    factory.release(&worker, false).await;
                }
            }
            TerminalOutcome::ForcedCancel { .. } => {
                let mut worker = worker;
                worker.execution_id = None;
                if let Err(err) = worker.update_status(WorkerStatus::Draining) {
                    warn!(worker_id = %worker_id, %err, "worker refused draining");
                }
                if let Err(err) = inner.workers.save(&worker).await {
                    warn!(worker_id = %worker_id, %err, "failed to persist draining worker");
                }
                if let Some(factory) = factory {
                    factory.release(&worker, true).await;
                }
            }
            TerminalOutcome::WorkerLost { .. } | TerminalOutcome::AcquisitionFailed { .. } => {
                // the disconnect handler owns the worker record; only the
                // backing instance is reclaimed here
                if let Some(factory) = factory {
                    factory.release(&worker, true).await;
                }
            }
        }
    }

    async fn fail_before_start(
        &self,
        execution_id: &ExecutionId,
        job: &mut Job,
        details: &str,
        retryable: bool,
    ) {
        let inner = &self.inner;
        {
            let mut contexts = inner.contexts.lock().unwrap();
            if let Some(context) = contexts.get_mut(execution_id) {
                let _ = context.execution.update_status(ExecutionStatus::Failed);
                context.execution.failure = Some(details.to_string());
            }
            contexts.mark_terminal(execution_id);
        }
        self.lifecycle_event(execution_id, &format!("execution failed: {details}"))
            .await;

        if let Err(err) = self.update_job_status(job, JobStatus::Failed).await {
            warn!(job_id = %job.id, %err, "failed to record admission failure");
        }
        if retryable && job.can_retry() {
            self.lifecycle_event(execution_id, "retry scheduled").await;
            self.schedule_retry(job.clone());
        }
    }

    fn schedule_retry(&self, job: Job) {
        let engine = self.clone();
        let delay = self.inner.config.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut job = job;
            if let Err(err) = job.retry() {
                warn!(job_id = %job.id, %err, "retry no longer possible");
                return;
            }
            if let Err(err) = engine.inner.jobs.update(&job).await {
                warn!(job_id = %job.id, %err, "failed to persist retried job");
                return;
            }
            info!(job_id = %job.id, retry_count = job.retry_count, "resubmitting failed job");
            if let Err(err) = engine.submit(job).await {
                warn!(%err, "retry submission failed");
            }
        });
    }

    async fn update_job_status(
        &self,
        job: &mut Job,
        status: JobStatus,
    ) -> Result<(), ExecutionError> {
        // re-read to avoid clobbering concurrent mutations of the record
        if let Some(fresh) = self.inner.jobs.find_by_id(&job.id).await? {
            *job = fresh;
        }
        job.update_status(status)?;
        self.inner.jobs.update(job).await?;
        Ok(())
    }

    async fn lifecycle_event(&self, execution_id: &ExecutionId, message: &str) {
        self.inner
            .events
            .publish_ordered(|| {
                let event = ExecutionEvent {
                    execution_id: execution_id.clone(),
                    kind: ExecutionEventKind::Custom,
                    message: message.to_string(),
                    metadata: HashMap::from([(
                        "origin".to_string(),
                        "orchestrator".to_string(),
                    )]),
                    timestamp: Utc::now(),
                };
                let mut contexts = self.inner.contexts.lock().unwrap();
                if let Some(context) = contexts.get_mut(execution_id) {
                    context.append_event(event.clone());
                }
                Some(event)
            })
            .await;
    }
}
