use super::{ExecutionId, InvalidTransition, JobId, WorkerId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, target: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, target),
            (Pending, Running | Failed | Cancelled) | (Running, Completed | Failed | Cancelled)
        )
    }
}

impl Display for ExecutionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One attempt to run one job on one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub worker_id: Option<WorkerId>,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(job_id: JobId) -> Self {
        Self {
            id: ExecutionId::generate(),
            job_id,
            worker_id: None,
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            exit_code: None,
            failure: None,
            created_at: Utc::now(),
        }
    }

    pub fn update_status(&mut self, target: ExecutionStatus) -> Result<(), InvalidTransition> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_transition_to(target) {
            return Err(InvalidTransition::new("execution", self.status, target));
        }
        let now = Utc::now();
        match target {
            ExecutionStatus::Running => self.started_at = Some(now),
            _ if target.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = target;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventKind {
    StageStarted,
    StageCompleted,
    StageFailed,
    StepStarted,
    StepCompleted,
    StepFailed,
    ArtifactGenerated,
    CheckpointCreated,
    RecoveryInitiated,
    ProgressUpdate,
    Custom,
}

impl From<hodei_wire::message::EventKind> for ExecutionEventKind {
    fn from(value: hodei_wire::message::EventKind) -> Self {
        use hodei_wire::message::EventKind as Wire;
        match value {
            Wire::StageStarted => ExecutionEventKind::StageStarted,
            Wire::StageCompleted => ExecutionEventKind::StageCompleted,
            Wire::StageFailed => ExecutionEventKind::StageFailed,
            Wire::StepStarted => ExecutionEventKind::StepStarted,
            Wire::StepCompleted => ExecutionEventKind::StepCompleted,
            Wire::StepFailed => ExecutionEventKind::StepFailed,
            Wire::ArtifactGenerated => ExecutionEventKind::ArtifactGenerated,
            Wire::CheckpointCreated => ExecutionEventKind::CheckpointCreated,
            Wire::RecoveryInitiated => ExecutionEventKind::RecoveryInitiated,
            Wire::ProgressUpdate => ExecutionEventKind::ProgressUpdate,
            Wire::Custom => ExecutionEventKind::Custom,
        }
    }
}

impl From<ExecutionEventKind> for hodei_wire::message::EventKind {
    fn from(value: ExecutionEventKind) -> Self {
        use hodei_wire::message::EventKind as Wire;
        match value {
            ExecutionEventKind::StageStarted => Wire::StageStarted,
            ExecutionEventKind::StageCompleted => Wire::StageCompleted,
            ExecutionEventKind::StageFailed => Wire::StageFailed,
            ExecutionEventKind::StepStarted => Wire::StepStarted,
            ExecutionEventKind::StepCompleted => Wire::StepCompleted,
            ExecutionEventKind::StepFailed => Wire::StepFailed,
            ExecutionEventKind::ArtifactGenerated => Wire::ArtifactGenerated,
            ExecutionEventKind::CheckpointCreated => Wire::CheckpointCreated,
            ExecutionEventKind::RecoveryInitiated => Wire::RecoveryInitiated,
            ExecutionEventKind::ProgressUpdate => Wire::ProgressUpdate,
            ExecutionEventKind::Custom => Wire::Custom,
        }
    }
}

/// Timestamped fact attached to an execution. The timestamp is assigned by
/// the orchestrator when the event is appended to the execution context,
/// giving subscribers a stable server-side order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: ExecutionId,
    pub kind: ExecutionEventKind,
    pub message: String,
    /// Advisory payload, e.g. a progress percentage. Never interpreted.
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl From<hodei_wire::message::LogStreamKind> for LogStream {
    fn from(value: hodei_wire::message::LogStreamKind) -> Self {
        match value {
            hodei_wire::message::LogStreamKind::Stdout => LogStream::Stdout,
            hodei_wire::message::LogStreamKind::Stderr => LogStream::Stderr,
        }
    }
}

/// One chunk of worker output. Chunks are ordered per execution and stream.
#[derive(Debug, Clone, PartialEq)]
pub struct LogChunk {
    pub execution_id: ExecutionId,
    pub stream: LogStream,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// Task payload of a job. Opaque to the orchestrator beyond the variant tag;
/// the worker picks an executor per variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionDefinition {
    Shell {
        commands: Vec<String>,
        allow_failure: bool,
    },
    Script {
        content: String,
        parameters: HashMap<String, String>,
    },
    Pipeline {
        stages: Vec<PipelineStage>,
    },
}

impl ExecutionDefinition {
    pub fn shell<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecutionDefinition::Shell {
            commands: commands.into_iter().map(Into::into).collect(),
            allow_failure: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub name: String,
    pub commands: Vec<String>,
    pub allow_failure: bool,
}

impl From<ExecutionDefinition> for hodei_wire::message::ExecutionDefinition {
    fn from(value: ExecutionDefinition) -> Self {
        use hodei_wire::message as wire;
        let task = match value {
            ExecutionDefinition::Shell {
                commands,
                allow_failure,
            } => wire::execution_definition::Task::Shell(wire::ShellTask {
                commands,
                allow_failure,
            }),
            ExecutionDefinition::Script {
                content,
                parameters,
            } => wire::execution_definition::Task::Script(wire::ScriptTask {
                content,
                parameters,
            }),
            ExecutionDefinition::Pipeline { stages } => {
                wire::execution_definition::Task::Pipeline(wire::PipelineTask {
                    stages: stages
                        .into_iter()
                        .map(|stage| wire::PipelineStage {
                            name: stage.name,
                            commands: stage.commands,
                            allow_failure: stage.allow_failure,
                        })
                        .collect(),
                })
            }
        };
        wire::ExecutionDefinition { task: Some(task) }
    }
}

impl TryFrom<hodei_wire::message::ExecutionDefinition> for ExecutionDefinition {
    type Error = String;

    fn try_from(value: hodei_wire::message::ExecutionDefinition) -> Result<Self, Self::Error> {
        use hodei_wire::message as wire;
        match value.task.ok_or("Missing field: task")? {
            wire::execution_definition::Task::Shell(task) => Ok(ExecutionDefinition::Shell {
                commands: task.commands,
                allow_failure: task.allow_failure,
            }),
            wire::execution_definition::Task::Script(task) => Ok(ExecutionDefinition::Script {
                content: task.content,
                parameters: task.parameters,
            }),
            wire::execution_definition::Task::Pipeline(task) => Ok(ExecutionDefinition::Pipeline {
                stages: task
                    .stages
                    .into_iter()
                    .map(|stage| PipelineStage {
                        name: stage.name,
                        commands: stage.commands,
                        allow_failure: stage.allow_failure,
                    })
                    .collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn executions_cannot_resurrect() {
        let mut execution = Execution::new(JobId::generate());
        execution.update_status(ExecutionStatus::Running).unwrap();
        execution.update_status(ExecutionStatus::Completed).unwrap();
        let err = execution.update_status(ExecutionStatus::Running).unwrap_err();
        assert_eq!(err.entity, "execution");
        assert_eq!(execution.status, ExecutionStatus::Completed);
    }

    #[test]
    fn pending_executions_can_fail_before_running() {
        let mut execution = Execution::new(JobId::generate());
        execution.update_status(ExecutionStatus::Failed).unwrap();
        assert!(execution.started_at.is_none());
        assert!(execution.completed_at.is_some());
    }

    #[test]
    fn definition_survives_the_wire_shape() {
        let definition = ExecutionDefinition::Pipeline {
            stages: vec![PipelineStage {
                name: "build".to_string(),
                commands: vec!["make".to_string()],
                allow_failure: false,
            }],
        };
        let wire: hodei_wire::message::ExecutionDefinition = definition.clone().into();
        assert_eq!(ExecutionDefinition::try_from(wire).unwrap(), definition);
    }
}
