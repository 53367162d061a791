use super::{ExecutionDefinition, ExecutionId, InvalidTransition, JobId, PoolId, ResourceRequirements, TemplateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, target),
            (Pending, Queued | Cancelled)
                // Failed is reachable before Running when placement or
                // admission fails for a queued job
                | (Queued, Scheduled | Running | Failed | Cancelled)
                | (Scheduled, Running | Failed | Cancelled)
                | (Running, Completed | Failed | Cancelled)
                | (Failed, Pending)
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Pinned template a job was instantiated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub template_id: TemplateId,
    pub version: semver::Version,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStateError {
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error("retry budget exhausted: {retry_count}/{max_retries}")]
    RetryExhausted { retry_count: u32, max_retries: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub namespace: String,
    pub template: Option<TemplateRef>,
    /// Task payload handed to the worker verbatim; the orchestrator never
    /// looks inside beyond the variant tag.
    pub payload: ExecutionDefinition,
    pub parameters: HashMap<String, String>,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub resource_requirements: ResourceRequirements,
    /// Pins the job to one pool; placement fails rather than falling back
    /// elsewhere when the pool cannot host it.
    pub target_pool_id: Option<PoolId>,
    pub latest_execution_id: Option<ExecutionId>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        payload: ExecutionDefinition,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            name: name.into(),
            namespace: namespace.into(),
            template: None,
            payload,
            parameters: HashMap::new(),
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            retry_count: 0,
            max_retries: 0,
            resource_requirements: ResourceRequirements::default(),
            target_pool_id: None,
            latest_execution_id: None,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            completed_at: None,
        }
    }

    /// Guarded mutator; same-status updates are accepted as no-ops.
    pub fn update_status(&mut self, target: JobStatus) -> Result<(), InvalidTransition> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_transition_to(target) {
            return Err(InvalidTransition::new("job", self.status, target));
        }
        let now = Utc::now();
        match target {
            JobStatus::Scheduled => self.scheduled_at = Some(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(now)
            }
            _ => {}
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    /// Moves a failed job back to `Pending`, consuming one unit of retry
    /// budget. Cancelled jobs are never retried.
    pub fn retry(&mut self) -> Result<(), JobStateError> {
        if self.status != JobStatus::Failed {
            return Err(InvalidTransition::new("job", self.status, JobStatus::Pending).into());
        }
        if self.retry_count >= self.max_retries {
            return Err(JobStateError::RetryExhausted {
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        self.update_status(JobStatus::Pending)?;
        self.retry_count += 1;
        self.scheduled_at = None;
        self.completed_at = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn job() -> Job {
        Job::new("build", "default", ExecutionDefinition::shell(["true"]), "tests")
    }

    #[test]
    fn lifecycle_follows_the_transition_table() {
        let mut job = job();
        job.update_status(JobStatus::Queued).unwrap();
        job.update_status(JobStatus::Scheduled).unwrap();
        job.update_status(JobStatus::Running).unwrap();
        job.update_status(JobStatus::Completed).unwrap();
        assert!(job.status.is_terminal());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn forbidden_transitions_leave_state_unchanged() {
        let mut job = job();
        let err = job.update_status(JobStatus::Completed).unwrap_err();
        assert_eq!(err.entity, "job");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.completed_at, None);
    }

    #[test]
    fn same_status_update_is_a_noop() {
        let mut job = job();
        job.update_status(JobStatus::Queued).unwrap();
        let before = job.clone();
        job.update_status(JobStatus::Queued).unwrap();
        assert_eq!(job, before);
    }

    #[test]
    fn retry_respects_the_budget() {
        let mut job = job();
        job.max_retries = 1;
        job.update_status(JobStatus::Queued).unwrap();
        job.update_status(JobStatus::Running).unwrap();
        job.update_status(JobStatus::Failed).unwrap();

        job.retry().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.completed_at, None);

        job.update_status(JobStatus::Queued).unwrap();
        job.update_status(JobStatus::Running).unwrap();
        job.update_status(JobStatus::Failed).unwrap();
        let err = job.retry().unwrap_err();
        assert!(matches!(err, JobStateError::RetryExhausted { retry_count: 1, max_retries: 1 }));
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn cancelled_jobs_are_terminal() {
        let mut job = job();
        job.max_retries = 3;
        job.update_status(JobStatus::Cancelled).unwrap();
        assert!(job.retry().is_err());
        assert!(job.update_status(JobStatus::Pending).is_err());
    }
}
