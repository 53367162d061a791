use crate::comms::manager::{WorkerManager, WorkerSessionHandle};
use crate::comms::{DisconnectCause, WorkerEvent};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use hodei_common::model::{ExecutionId, PoolId, WorkerId};
use hodei_wire::codec::OrchestratorCodec;
use hodei_wire::message::{
    orchestrator_message, worker_message, EventKind, LogStreamKind, OrchestratorMessage,
    WorkerMessage,
};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct SessionParams {
    /// The registration must be the first frame, within this window.
    pub registration_timeout: Duration,
    /// Interval handed to the worker in the registration ack.
    pub heartbeat_interval: Duration,
}

const OUTBOUND_QUEUE_DEPTH: usize = 128;

/// Drives one worker connection from accept to teardown. The first inbound
/// frame must be a registration; everything after flows through the demux
/// into the engine's event channel.
pub async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<WorkerManager>,
    params: SessionParams,
) {
    let mut framed = Framed::new(stream, OrchestratorCodec::new());

    let register = match tokio::time::timeout(params.registration_timeout, framed.next()).await {
        Ok(Some(Ok(WorkerMessage {
            payload: Some(worker_message::Payload::Register(register)),
        }))) => register,
        Ok(Some(Ok(_))) => {
            warn!(%peer, "protocol error: first frame was not a registration");
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(%peer, %err, "protocol error during handshake");
            return;
        }
        Ok(None) => {
            debug!(%peer, "connection closed before registration");
            return;
        }
        Err(_) => {
            warn!(%peer, "registration timed out");
            return;
        }
    };

    let Some(capabilities) = register.capabilities else {
        warn!(%peer, "protocol error: registration without capabilities");
        return;
    };
    if register.worker_id.is_empty() || register.pool_id.is_empty() {
        warn!(%peer, "protocol error: registration without worker or pool id");
        return;
    }
    let worker_id = WorkerId::from(register.worker_id.clone());
    let pool_id = PoolId::from(register.pool_id.clone());

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let handle = Arc::new(WorkerSessionHandle::new(
        worker_id.clone(),
        pool_id.clone(),
        outbound_tx,
    ));
    if let Err(err) = manager.register(handle.clone()) {
        warn!(%peer, %err, "rejecting duplicate worker session");
        return;
    }

    let ack = OrchestratorMessage::register_ack(
        register.worker_id.clone(),
        params.heartbeat_interval.as_millis() as u64,
    );
    if framed.send(ack).await.is_err() {
        manager
            .finish_session(&worker_id, DisconnectCause::ConnectionClosed)
            .await;
        return;
    }

    info!(worker_id = %worker_id, pool_id = %pool_id, %peer, "worker registered");
    manager
        .emit(WorkerEvent::Registered {
            worker_id: worker_id.clone(),
            pool_id,
            capabilities: capabilities.into(),
        })
        .await;

    let (sink, frames) = framed.split();
    let writer = tokio::spawn(write_loop(sink, outbound_rx, handle.clone()));

    // panics in message handling must not reach the engine; they close this
    // session as a protocol failure instead
    let outcome = AssertUnwindSafe(read_loop(frames, manager.clone(), handle.clone()))
        .catch_unwind()
        .await;
    let fallback = match outcome {
        Ok(cause) => cause,
        Err(_) => DisconnectCause::Protocol("panic in session handler".to_string()),
    };
    let cause = handle.take_cause(fallback);

    handle.cancel_token().cancel();
    let _ = writer.await;
    manager.finish_session(&worker_id, cause).await;
}

async fn read_loop(
    mut frames: SplitStream<Framed<TcpStream, OrchestratorCodec>>,
    manager: Arc<WorkerManager>,
    handle: Arc<WorkerSessionHandle>,
) -> DisconnectCause {
    let cancel = handle.cancel_token();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return DisconnectCause::ShuttingDown,
            frame = frames.next() => match frame {
                None => return DisconnectCause::ConnectionClosed,
                Some(Err(err)) => return DisconnectCause::Protocol(err.to_string()),
                Some(Ok(message)) => {
                    if let Some(cause) = handle_message(&manager, &handle, message).await {
                        return cause;
                    }
                }
            }
        }
    }
}

/// `Some(cause)` means the message violated the protocol and the session
/// must close.
async fn handle_message(
    manager: &WorkerManager,
    handle: &WorkerSessionHandle,
    message: WorkerMessage,
) -> Option<DisconnectCause> {
    use worker_message::Payload;
    let payload = match message.payload {
        Some(payload) => payload,
        None => return Some(DisconnectCause::Protocol("empty frame".to_string())),
    };
    match payload {
        Payload::Register(_) => {
            Some(DisconnectCause::Protocol("duplicate registration".to_string()))
        }
        Payload::Heartbeat(heartbeat) => {
            if heartbeat.worker_id != handle.worker_id.as_str() {
                return Some(DisconnectCause::Protocol(
                    "heartbeat for a different worker".to_string(),
                ));
            }
            let now = Utc::now();
            handle.record_heartbeat(now);
            manager
                .emit(WorkerEvent::HeartbeatReceived {
                    worker_id: handle.worker_id.clone(),
                    at: now,
                })
                .await;
            None
        }
        Payload::StatusUpdate(update) => {
            let execution_id = ExecutionId::from(update.execution_id.clone());
            if let Some(cause) = check_execution(handle, &execution_id, "status update") {
                return Some(cause);
            }
            let Ok(kind) = EventKind::try_from(update.event) else {
                return Some(DisconnectCause::Protocol(format!(
                    "unknown event kind: {}",
                    update.event
                )));
            };
            manager
                .emit(WorkerEvent::StatusUpdated {
                    worker_id: handle.worker_id.clone(),
                    execution_id,
                    kind: kind.into(),
                    message: update.message,
                    metadata: update.metadata,
                })
                .await;
            None
        }
        Payload::LogChunk(chunk) => {
            let execution_id = ExecutionId::from(chunk.execution_id.clone());
            if let Some(cause) = check_execution(handle, &execution_id, "log chunk") {
                return Some(cause);
            }
            let Ok(stream) = LogStreamKind::try_from(chunk.stream) else {
                return Some(DisconnectCause::Protocol(format!(
                    "unknown log stream: {}",
                    chunk.stream
                )));
            };
            manager
                .emit(WorkerEvent::LogChunkReceived {
                    worker_id: handle.worker_id.clone(),
                    execution_id,
                    stream: stream.into(),
                    payload: chunk.payload,
                })
                .await;
            None
        }
        Payload::ExecutionResult(result) => {
            let execution_id = ExecutionId::from(result.execution_id.clone());
            if let Some(cause) = check_execution(handle, &execution_id, "execution result") {
                return Some(cause);
            }
            // terminal for this execution id; nothing else may follow for it
            handle.set_current_execution(None);
            manager
                .emit(WorkerEvent::ResultReceived {
                    worker_id: handle.worker_id.clone(),
                    execution_id,
                    success: result.success,
                    exit_code: result.exit_code,
                    details: result.details,
                })
                .await;
            None
        }
    }
}

fn check_execution(
    handle: &WorkerSessionHandle,
    execution_id: &ExecutionId,
    what: &str,
) -> Option<DisconnectCause> {
    match handle.current_execution() {
        Some(current) if &current == execution_id => None,
        _ => Some(DisconnectCause::Protocol(format!(
            "{what} for an execution this worker does not hold: {execution_id}"
        ))),
    }
}

async fn write_loop(
    mut sink: SplitSink<Framed<TcpStream, OrchestratorCodec>, OrchestratorMessage>,
    mut outbound: mpsc::Receiver<OrchestratorMessage>,
    handle: Arc<WorkerSessionHandle>,
) {
    let cancel = handle.cancel_token();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                None => break,
                Some(message) => {
                    // note the assignment before it leaves, so inbound
                    // traffic for it validates from the first chunk
                    if let Some(orchestrator_message::Payload::ExecutionAssignment(assignment)) =
                        &message.payload
                    {
                        handle.set_current_execution(Some(ExecutionId::from(
                            assignment.execution_id.clone(),
                        )));
                    }
                    if sink.send(message).await.is_err() {
                        handle.shutdown(DisconnectCause::ConnectionClosed);
                        break;
                    }
                }
            }
        }
    }
    let _ = sink.close().await;
}
