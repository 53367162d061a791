pub mod manager;
pub mod server;
pub mod session;

pub use manager::WorkerManager;
pub use server::{serve_worker_streams, StreamServerParams};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hodei_common::model::{
    ExecutionEventKind, ExecutionId, LogStream, PoolId, WorkerCapabilities, WorkerId,
};
use hodei_wire::message::OrchestratorMessage;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Demultiplexed inbound traffic and session lifecycle notifications, in
/// arrival order per worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Registered {
        worker_id: WorkerId,
        pool_id: PoolId,
        capabilities: WorkerCapabilities,
    },
    HeartbeatReceived {
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },
    StatusUpdated {
        worker_id: WorkerId,
        execution_id: ExecutionId,
        kind: ExecutionEventKind,
        message: String,
        metadata: HashMap<String, String>,
    },
    LogChunkReceived {
        worker_id: WorkerId,
        execution_id: ExecutionId,
        stream: LogStream,
        payload: Bytes,
    },
    ResultReceived {
        worker_id: WorkerId,
        execution_id: ExecutionId,
        success: bool,
        exit_code: i32,
        details: String,
    },
    Disconnected {
        worker_id: WorkerId,
        cause: DisconnectCause,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    ConnectionClosed,
    /// Malformed or out-of-sequence traffic; the stream is closed and the
    /// worker's execution reclaimed.
    Protocol(String),
    HeartbeatTimeout,
    ShuttingDown,
}

/// Engine-facing surface of the communication layer. The engine talks to
/// workers only through this and the demuxed event stream; it never touches
/// a raw session.
#[async_trait]
pub trait WorkerChannel: Send + Sync {
    /// `false` when the worker has no live session.
    async fn send_to(&self, worker_id: &WorkerId, message: OrchestratorMessage) -> bool;

    /// Number of workers the message was delivered to.
    async fn broadcast(&self, message: OrchestratorMessage) -> usize;

    fn disconnect(&self, worker_id: &WorkerId);

    fn connected_workers(&self) -> BTreeSet<WorkerId>;

    /// Waits for a worker to register, up to `timeout`.
    async fn await_worker(&self, worker_id: &WorkerId, timeout: Duration) -> bool;
}
