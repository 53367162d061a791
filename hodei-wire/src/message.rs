use std::collections::HashMap;

/// Everything a worker may send to the orchestrator. The first message on any
/// stream must be `Register`; anything else closes the stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerMessage {
    #[prost(oneof = "worker_message::Payload", tags = "1, 2, 3, 4, 5")]
    pub payload: Option<worker_message::Payload>,
}

pub mod worker_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Register(super::RegisterRequest),
        #[prost(message, tag = "2")]
        Heartbeat(super::Heartbeat),
        #[prost(message, tag = "3")]
        StatusUpdate(super::StatusUpdate),
        #[prost(message, tag = "4")]
        LogChunk(super::LogChunk),
        #[prost(message, tag = "5")]
        ExecutionResult(super::ExecutionResult),
    }
}

/// Everything the orchestrator may send to a worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OrchestratorMessage {
    #[prost(oneof = "orchestrator_message::Payload", tags = "1, 2, 3, 4")]
    pub payload: Option<orchestrator_message::Payload>,
}

pub mod orchestrator_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        RegisterAck(super::RegisterAck),
        #[prost(message, tag = "2")]
        ExecutionAssignment(super::ExecutionAssignment),
        #[prost(message, tag = "3")]
        CancelSignal(super::CancelSignal),
        #[prost(message, tag = "4")]
        ShutdownSignal(super::ShutdownSignal),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterRequest {
    #[prost(string, tag = "1")]
    pub worker_id: String,
    #[prost(string, tag = "2")]
    pub pool_id: String,
    #[prost(message, optional, tag = "3")]
    pub capabilities: Option<Capabilities>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Capabilities {
    #[prost(double, tag = "1")]
    pub cpu_cores: f64,
    #[prost(uint64, tag = "2")]
    pub memory_bytes: u64,
    #[prost(uint64, tag = "3")]
    pub storage_bytes: u64,
    #[prost(string, repeated, tag = "4")]
    pub platforms: Vec<String>,
    #[prost(string, repeated, tag = "5")]
    pub runtimes: Vec<String>,
    #[prost(uint32, tag = "6")]
    pub max_concurrent_jobs: u32,
    #[prost(string, repeated, tag = "7")]
    pub features: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {
    #[prost(string, tag = "1")]
    pub worker_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusUpdate {
    #[prost(string, tag = "1")]
    pub execution_id: String,
    #[prost(enumeration = "EventKind", tag = "2")]
    pub event: i32,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(map = "string, string", tag = "4")]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogChunk {
    #[prost(string, tag = "1")]
    pub execution_id: String,
    #[prost(enumeration = "LogStreamKind", tag = "2")]
    pub stream: i32,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: ::bytes::Bytes,
}

/// Terminal message for an execution id. The worker must not send anything
/// else for the same execution afterwards.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionResult {
    #[prost(string, tag = "1")]
    pub execution_id: String,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(int32, tag = "3")]
    pub exit_code: i32,
    #[prost(string, tag = "4")]
    pub details: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterAck {
    #[prost(string, tag = "1")]
    pub worker_id: String,
    #[prost(uint64, tag = "2")]
    pub heartbeat_interval_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionAssignment {
    #[prost(string, tag = "1")]
    pub execution_id: String,
    #[prost(string, tag = "2")]
    pub job_id: String,
    #[prost(message, optional, tag = "3")]
    pub definition: Option<ExecutionDefinition>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelSignal {
    #[prost(string, tag = "1")]
    pub execution_id: String,
    #[prost(string, tag = "2")]
    pub reason: String,
    #[prost(uint64, tag = "3")]
    pub grace_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShutdownSignal {
    #[prost(string, tag = "1")]
    pub reason: String,
}

/// The task payload carried by an assignment. The orchestrator never
/// interprets its contents; the worker picks an executor per variant.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExecutionDefinition {
    #[prost(oneof = "execution_definition::Task", tags = "1, 2, 3")]
    pub task: Option<execution_definition::Task>,
}

pub mod execution_definition {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Task {
        #[prost(message, tag = "1")]
        Shell(super::ShellTask),
        #[prost(message, tag = "2")]
        Script(super::ScriptTask),
        #[prost(message, tag = "3")]
        Pipeline(super::PipelineTask),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShellTask {
    #[prost(string, repeated, tag = "1")]
    pub commands: Vec<String>,
    #[prost(bool, tag = "2")]
    pub allow_failure: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScriptTask {
    #[prost(string, tag = "1")]
    pub content: String,
    #[prost(map = "string, string", tag = "2")]
    pub parameters: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PipelineTask {
    #[prost(message, repeated, tag = "1")]
    pub stages: Vec<PipelineStage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PipelineStage {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, repeated, tag = "2")]
    pub commands: Vec<String>,
    #[prost(bool, tag = "3")]
    pub allow_failure: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EventKind {
    StageStarted = 0,
    StageCompleted = 1,
    StageFailed = 2,
    StepStarted = 3,
    StepCompleted = 4,
    StepFailed = 5,
    ArtifactGenerated = 6,
    CheckpointCreated = 7,
    RecoveryInitiated = 8,
    ProgressUpdate = 9,
    Custom = 10,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LogStreamKind {
    Stdout = 0,
    Stderr = 1,
}

impl WorkerMessage {
    pub fn register(worker_id: impl Into<String>, pool_id: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            payload: Some(worker_message::Payload::Register(RegisterRequest {
                worker_id: worker_id.into(),
                pool_id: pool_id.into(),
                capabilities: Some(capabilities),
            })),
        }
    }

    pub fn heartbeat(worker_id: impl Into<String>) -> Self {
        Self {
            payload: Some(worker_message::Payload::Heartbeat(Heartbeat {
                worker_id: worker_id.into(),
            })),
        }
    }
}

impl OrchestratorMessage {
    pub fn register_ack(worker_id: impl Into<String>, heartbeat_interval_ms: u64) -> Self {
        Self {
            payload: Some(orchestrator_message::Payload::RegisterAck(RegisterAck {
                worker_id: worker_id.into(),
                heartbeat_interval_ms,
            })),
        }
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self {
            payload: Some(orchestrator_message::Payload::ShutdownSignal(ShutdownSignal {
                reason: reason.into(),
            })),
        }
    }
}
