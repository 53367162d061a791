use crate::comms::{DisconnectCause, WorkerChannel, WorkerEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hodei_common::model::{ExecutionId, PoolId, WorkerId};
use hodei_wire::message::OrchestratorMessage;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Orchestrator-side state of one live worker session.
pub struct WorkerSessionHandle {
    pub worker_id: WorkerId,
    pub pool_id: PoolId,
    pub registered_at: DateTime<Utc>,
    outbound: mpsc::Sender<OrchestratorMessage>,
    last_heartbeat: Mutex<DateTime<Utc>>,
    current_execution: Mutex<Option<ExecutionId>>,
    disconnect_cause: Mutex<Option<DisconnectCause>>,
    cancel: CancellationToken,
}

impl WorkerSessionHandle {
    pub fn new(
        worker_id: WorkerId,
        pool_id: PoolId,
        outbound: mpsc::Sender<OrchestratorMessage>,
    ) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            pool_id,
            registered_at: now,
            outbound,
            last_heartbeat: Mutex::new(now),
            current_execution: Mutex::new(None),
            disconnect_cause: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        *self.last_heartbeat.lock().unwrap()
    }

    pub fn record_heartbeat(&self, at: DateTime<Utc>) {
        *self.last_heartbeat.lock().unwrap() = at;
    }

    pub fn current_execution(&self) -> Option<ExecutionId> {
        self.current_execution.lock().unwrap().clone()
    }

    pub fn set_current_execution(&self, execution_id: Option<ExecutionId>) {
        *self.current_execution.lock().unwrap() = execution_id;
    }

    /// Records why the session is being torn down and wakes its tasks. The
    /// first recorded cause wins.
    pub fn shutdown(&self, cause: DisconnectCause) {
        let mut slot = self.disconnect_cause.lock().unwrap();
        if slot.is_none() {
            *slot = Some(cause);
        }
        drop(slot);
        self.cancel.cancel();
    }

    pub fn take_cause(&self, fallback: DisconnectCause) -> DisconnectCause {
        self.disconnect_cause
            .lock()
            .unwrap()
            .take()
            .unwrap_or(fallback)
    }
}

/// Owns the map of live sessions. Sessions register after a valid
/// handshake and remove themselves when their tasks wind down.
pub struct WorkerManager {
    sessions: RwLock<HashMap<WorkerId, Arc<WorkerSessionHandle>>>,
    events_tx: mpsc::Sender<WorkerEvent>,
    registrations: broadcast::Sender<WorkerId>,
}

impl WorkerManager {
    pub fn new(events_tx: mpsc::Sender<WorkerEvent>) -> Self {
        let (registrations, _) = broadcast::channel(64);
        Self {
            sessions: RwLock::new(HashMap::new()),
            events_tx,
            registrations,
        }
    }

    /// Adds a freshly registered session. A second session for the same
    /// worker id is rejected; the first connection stays authoritative.
    pub fn register(&self, handle: Arc<WorkerSessionHandle>) -> Result<(), String> {
        let mut sessions = self.sessions.write().unwrap();
        if sessions.contains_key(&handle.worker_id) {
            return Err(format!("worker already connected: {}", handle.worker_id));
        }
        sessions.insert(handle.worker_id.clone(), handle.clone());
        drop(sessions);
        let _ = self.registrations.send(handle.worker_id.clone());
        debug!(worker_id = %handle.worker_id, pool_id = %handle.pool_id, "worker session registered");
        Ok(())
    }

    pub fn session(&self, worker_id: &WorkerId) -> Option<Arc<WorkerSessionHandle>> {
        self.sessions.read().unwrap().get(worker_id).cloned()
    }

    /// Called by the session task as its last act; removes the session and
    /// tells the engine why it went away.
    pub async fn finish_session(&self, worker_id: &WorkerId, cause: DisconnectCause) {
        let removed = self.sessions.write().unwrap().remove(worker_id);
        if removed.is_some() {
            debug!(worker_id = %worker_id, ?cause, "worker session closed");
            self.emit(WorkerEvent::Disconnected {
                worker_id: worker_id.clone(),
                cause,
            })
            .await;
        }
    }

    pub async fn emit(&self, event: WorkerEvent) {
        if self.events_tx.send(event).await.is_err() {
            warn!("worker event dropped: engine dispatcher is gone");
        }
    }

    /// Flags every session as lost when its heartbeats stop. The scan runs
    /// forever; spawn it once at startup.
    pub async fn run_heartbeat_watchdog(self: Arc<Self>, lost_timeout: Duration) {
        let scan_interval = Duration::from_secs(5).min(lost_timeout);
        let lost_after = chrono::Duration::from_std(lost_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let mut ticker = tokio::time::interval(scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let stale: Vec<Arc<WorkerSessionHandle>> = {
                let sessions = self.sessions.read().unwrap();
                sessions
                    .values()
                    // lost only when the heartbeat age strictly exceeds the timeout
                    .filter(|handle| now - handle.last_heartbeat() > lost_after)
                    .cloned()
                    .collect()
            };
            for handle in stale {
                warn!(
                    worker_id = %handle.worker_id,
                    last_heartbeat = %handle.last_heartbeat(),
                    "worker lost: heartbeats stopped"
                );
                handle.shutdown(DisconnectCause::HeartbeatTimeout);
            }
        }
    }
}

#[async_trait]
impl WorkerChannel for WorkerManager {
    async fn send_to(&self, worker_id: &WorkerId, message: OrchestratorMessage) -> bool {
        // look up under the read lock, send outside of it
        let outbound = match self.sessions.read().unwrap().get(worker_id) {
            Some(handle) => handle.outbound.clone(),
            None => return false,
        };
        outbound.send(message).await.is_ok()
    }

    async fn broadcast(&self, message: OrchestratorMessage) -> usize {
        let outbounds: Vec<mpsc::Sender<OrchestratorMessage>> = self
            .sessions
            .read()
            .unwrap()
            .values()
            .map(|handle| handle.outbound.clone())
            .collect();
        let mut delivered = 0;
        for outbound in outbounds {
            if outbound.send(message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn disconnect(&self, worker_id: &WorkerId) {
        if let Some(handle) = self.session(worker_id) {
            handle.shutdown(DisconnectCause::ShuttingDown);
        }
    }

    fn connected_workers(&self) -> BTreeSet<WorkerId> {
        self.sessions.read().unwrap().keys().cloned().collect()
    }

    async fn await_worker(&self, worker_id: &WorkerId, timeout: Duration) -> bool {
        // subscribe before checking to close the race with registration
        let mut registrations = self.registrations.subscribe();
        if self.session(worker_id).is_some() {
            return true;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, registrations.recv()).await {
                Ok(Ok(registered)) if &registered == worker_id => return true,
                Ok(Ok(_)) => continue,
                // lagged subscribers re-check the map instead of giving up
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    if self.session(worker_id).is_some() {
                        return true;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return false,
                Err(_) => return false,
            }
        }
    }
}
