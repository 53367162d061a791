use super::{ExecutionId, InvalidTransition, PoolId, ResourceRequirements, WorkerId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Provisioning,
    Idle,
    Busy,
    Draining,
    Maintenance,
    Terminating,
    Terminated,
    Error,
}

impl WorkerStatus {
    /// `Terminated` and `Error` are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerStatus::Terminated | WorkerStatus::Error)
    }

    pub fn can_transition_to(&self, target: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, target),
            (Provisioning, Idle | Terminating | Error)
                | (Idle, Busy | Draining | Maintenance | Terminating | Error)
                | (Busy, Idle | Draining | Terminating | Error)
                | (Draining, Idle | Terminating | Error)
                | (Maintenance, Idle | Terminating | Error)
                | (Terminating, Terminated | Error)
        )
    }
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Provisioning => "provisioning",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Maintenance => "maintenance",
            WorkerStatus::Terminating => "terminating",
            WorkerStatus::Terminated => "terminated",
            WorkerStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// What a worker advertises at registration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkerCapabilities {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
    pub platforms: Vec<String>,
    pub runtimes: Vec<String>,
    pub max_concurrent_jobs: u32,
    pub features: Vec<String>,
}

impl WorkerCapabilities {
    pub fn satisfies(&self, requirements: &ResourceRequirements) -> bool {
        self.cpu_cores >= requirements.cpu_cores
            && self.memory_bytes >= requirements.memory_bytes
            && self.storage_bytes >= requirements.disk_bytes
    }
}

impl From<hodei_wire::message::Capabilities> for WorkerCapabilities {
    fn from(value: hodei_wire::message::Capabilities) -> Self {
        Self {
            cpu_cores: value.cpu_cores,
            memory_bytes: value.memory_bytes,
            storage_bytes: value.storage_bytes,
            platforms: value.platforms,
            runtimes: value.runtimes,
            max_concurrent_jobs: value.max_concurrent_jobs,
            features: value.features,
        }
    }
}

impl From<WorkerCapabilities> for hodei_wire::message::Capabilities {
    fn from(value: WorkerCapabilities) -> Self {
        Self {
            cpu_cores: value.cpu_cores,
            memory_bytes: value.memory_bytes,
            storage_bytes: value.storage_bytes,
            platforms: value.platforms,
            runtimes: value.runtimes,
            max_concurrent_jobs: value.max_concurrent_jobs,
            features: value.features,
        }
    }
}

/// One unit of execution capacity within a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub pool_id: PoolId,
    /// Set exactly while the worker is `Busy`.
    pub execution_id: Option<ExecutionId>,
    pub status: WorkerStatus,
    pub capabilities: WorkerCapabilities,
    pub allocation: Option<ResourceRequirements>,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(pool_id: PoolId, capabilities: WorkerCapabilities) -> Self {
        let now = Utc::now();
        Self {
            id: WorkerId::generate(),
            pool_id,
            execution_id: None,
            status: WorkerStatus::Provisioning,
            capabilities,
            allocation: None,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn update_status(&mut self, target: WorkerStatus) -> Result<(), InvalidTransition> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_transition_to(target) {
            return Err(InvalidTransition::new("worker", self.status, target));
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.status == WorkerStatus::Busy
    }

    /// Idle -> Busy, pinning the execution to this worker.
    pub fn assign_execution(
        &mut self,
        execution_id: ExecutionId,
        allocation: ResourceRequirements,
    ) -> Result<(), InvalidTransition> {
        if self.status != WorkerStatus::Idle {
            return Err(InvalidTransition::new("worker", self.status, WorkerStatus::Busy));
        }
        self.update_status(WorkerStatus::Busy)?;
        self.execution_id = Some(execution_id);
        self.allocation = Some(allocation);
        Ok(())
    }

    /// Busy -> Idle, returning the execution that was pinned.
    pub fn release_execution(&mut self) -> Result<ExecutionId, InvalidTransition> {
        if self.status != WorkerStatus::Busy {
            return Err(InvalidTransition::new("worker", self.status, WorkerStatus::Idle));
        }
        let execution_id = self
            .execution_id
            .take()
            .ok_or_else(|| InvalidTransition::new("worker", self.status, WorkerStatus::Idle))?;
        self.update_status(WorkerStatus::Idle)?;
        self.allocation = None;
        Ok(execution_id)
    }

    pub fn record_heartbeat(&mut self, at: DateTime<Utc>) {
        self.last_heartbeat = at;
        self.updated_at = at;
    }

    /// Healthy until the heartbeat age strictly exceeds the timeout; a
    /// heartbeat landing exactly on the boundary still counts.
    pub fn is_healthy(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_heartbeat <= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn worker() -> Worker {
        let mut worker = Worker::new(PoolId::generate(), WorkerCapabilities::default());
        worker.update_status(WorkerStatus::Idle).unwrap();
        worker
    }

    #[test]
    fn busy_iff_execution_assigned() {
        let mut worker = worker();
        assert!(!worker.is_busy());
        assert_eq!(worker.execution_id, None);

        let execution_id = ExecutionId::generate();
        worker
            .assign_execution(execution_id.clone(), ResourceRequirements::new(1.0, 1024))
            .unwrap();
        assert!(worker.is_busy());
        assert_eq!(worker.execution_id, Some(execution_id.clone()));

        let released = worker.release_execution().unwrap();
        assert_eq!(released, execution_id);
        assert!(!worker.is_busy());
        assert_eq!(worker.execution_id, None);
    }

    #[test]
    fn double_assignment_is_rejected() {
        let mut worker = worker();
        worker
            .assign_execution(ExecutionId::generate(), ResourceRequirements::default())
            .unwrap();
        let err = worker
            .assign_execution(ExecutionId::generate(), ResourceRequirements::default())
            .unwrap_err();
        assert_eq!(err.from, "busy");
    }

    #[test]
    fn release_requires_busy() {
        let mut worker = worker();
        assert!(worker.release_execution().is_err());
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let mut worker = worker();
        worker.update_status(WorkerStatus::Error).unwrap();
        assert!(worker.update_status(WorkerStatus::Idle).is_err());
        assert!(worker.update_status(WorkerStatus::Terminating).is_err());
    }

    #[test]
    fn heartbeat_at_exactly_the_timeout_boundary_is_healthy() {
        let mut worker = worker();
        let now = Utc::now();
        let timeout = Duration::seconds(300);

        worker.record_heartbeat(now - timeout);
        assert!(worker.is_healthy(now, timeout));

        worker.record_heartbeat(now - timeout - Duration::nanoseconds(1));
        assert!(!worker.is_healthy(now, timeout));
    }
}
