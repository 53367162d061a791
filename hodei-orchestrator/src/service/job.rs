use crate::repo::{JobRepository, RepoError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use hodei_common::model::{
    ExecutionDefinition, InvalidTransition, Job, JobId, JobPriority, JobStateError, JobStatus,
    PoolId, ResourceRequirements, TemplateRef,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error("invalid job: {}", errors.join(", "))]
    Validation { errors: Vec<String> },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    State(#[from] JobStateError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl From<InvalidTransition> for JobServiceError {
    fn from(value: InvalidTransition) -> Self {
        JobServiceError::State(value.into())
    }
}

#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub name: String,
    pub namespace: String,
    pub payload: ExecutionDefinition,
    pub parameters: HashMap<String, String>,
    pub priority: JobPriority,
    pub max_retries: u32,
    pub resource_requirements: ResourceRequirements,
    pub target_pool_id: Option<PoolId>,
    pub template: Option<TemplateRef>,
    pub created_by: String,
}

impl CreateJobRequest {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        payload: ExecutionDefinition,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            payload,
            parameters: HashMap::new(),
            priority: JobPriority::Normal,
            max_retries: 0,
            resource_requirements: ResourceRequirements::default(),
            target_pool_id: None,
            template: None,
            created_by: created_by.into(),
        }
    }
}

/// Admission and lifecycle of jobs that are not currently executing. Running
/// jobs are cancelled through the execution engine, which owns the worker
/// side of the conversation.
#[async_trait]
pub trait JobService: Send + Sync {
    async fn create(&self, request: CreateJobRequest) -> Result<Job, JobServiceError>;

    async fn get(&self, id: &JobId) -> Result<Job, JobServiceError>;

    async fn find_by_name(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Job>, JobServiceError>;

    fn list(
        &self,
        page: u32,
        page_size: u32,
        status: Option<JobStatus>,
        namespace: Option<String>,
    ) -> BoxStream<'static, Result<Job, RepoError>>;

    async fn update_status(&self, id: &JobId, status: JobStatus) -> Result<Job, JobServiceError>;

    /// New attempt for a failed job within its retry budget.
    async fn retry(&self, id: &JobId) -> Result<Job, JobServiceError>;

    /// Cancels a job that has not reached a worker yet.
    async fn cancel(&self, id: &JobId) -> Result<Job, JobServiceError>;
}

pub struct JobServiceDefault {
    job_repo: Arc<dyn JobRepository>,
}

impl JobServiceDefault {
    pub fn new(job_repo: Arc<dyn JobRepository>) -> Self {
        Self { job_repo }
    }

    fn validate(request: &CreateJobRequest) -> Result<(), JobServiceError> {
        let mut errors = Vec::new();
        if request.name.trim().is_empty() {
            errors.push("name must not be blank".to_string());
        }
        if request.namespace.trim().is_empty() {
            errors.push("namespace must not be blank".to_string());
        }
        if request.created_by.trim().is_empty() {
            errors.push("created_by must not be blank".to_string());
        }
        if request.resource_requirements.cpu_cores < 0.0 {
            errors.push("cpu request must not be negative".to_string());
        }
        if let ExecutionDefinition::Shell { commands, .. } = &request.payload {
            if commands.is_empty() {
                errors.push("shell payload must carry at least one command".to_string());
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(JobServiceError::Validation { errors })
        }
    }
}

#[async_trait]
impl JobService for JobServiceDefault {
    async fn create(&self, request: CreateJobRequest) -> Result<Job, JobServiceError> {
        Self::validate(&request)?;
        if self
            .job_repo
            .exists_by_name(&request.name, &request.namespace)
            .await?
        {
            return Err(JobServiceError::Conflict(format!(
                "job already exists: {}/{}",
                request.namespace, request.name
            )));
        }

        let mut job = Job::new(
            request.name,
            request.namespace,
            request.payload,
            request.created_by,
        );
        job.parameters = request.parameters;
        job.priority = request.priority;
        job.max_retries = request.max_retries;
        job.resource_requirements = request.resource_requirements;
        job.target_pool_id = request.target_pool_id;
        job.template = request.template;

        self.job_repo.save(&job).await?;
        info!(job_id = %job.id, name = %job.name, namespace = %job.namespace, "job admitted");
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> Result<Job, JobServiceError> {
        self.job_repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| JobServiceError::NotFound(id.clone()))
    }

    async fn find_by_name(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Job>, JobServiceError> {
        Ok(self.job_repo.find_by_name(name, namespace).await?)
    }

    fn list(
        &self,
        page: u32,
        page_size: u32,
        status: Option<JobStatus>,
        namespace: Option<String>,
    ) -> BoxStream<'static, Result<Job, RepoError>> {
        self.job_repo.list(page, page_size, status, namespace)
    }

    async fn update_status(&self, id: &JobId, status: JobStatus) -> Result<Job, JobServiceError> {
        let mut job = self.get(id).await?;
        job.update_status(status)?;
        self.job_repo.update(&job).await?;
        Ok(job)
    }

    async fn retry(&self, id: &JobId) -> Result<Job, JobServiceError> {
        let mut job = self.get(id).await?;
        job.retry()?;
        self.job_repo.update(&job).await?;
        info!(job_id = %job.id, retry_count = job.retry_count, "job queued for retry");
        Ok(job)
    }

    async fn cancel(&self, id: &JobId) -> Result<Job, JobServiceError> {
        let mut job = self.get(id).await?;
        if job.status.is_terminal() {
            return Err(JobServiceError::State(
                InvalidTransition::new("job", job.status, JobStatus::Cancelled).into(),
            ));
        }
        job.update_status(JobStatus::Cancelled)?;
        self.job_repo.update(&job).await?;
        info!(job_id = %job.id, "job cancelled before execution");
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::InMemoryJobRepository;
    use test_r::test;

    fn service() -> JobServiceDefault {
        JobServiceDefault::new(Arc::new(InMemoryJobRepository::new()))
    }

    fn request(name: &str) -> CreateJobRequest {
        CreateJobRequest::new(name, "default", ExecutionDefinition::shell(["true"]), "tests")
    }

    #[test]
    async fn blank_names_are_rejected_with_all_errors() {
        let service = service();
        let mut bad = request("");
        bad.namespace = " ".to_string();
        let err = service.create(bad).await.unwrap_err();
        match err {
            JobServiceError::Validation { errors } => assert_eq!(errors.len(), 2),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    async fn duplicate_names_conflict_within_a_namespace() {
        let service = service();
        service.create(request("nightly")).await.unwrap();
        assert!(matches!(
            service.create(request("nightly")).await,
            Err(JobServiceError::Conflict(_))
        ));
    }

    #[test]
    async fn cancel_is_allowed_from_any_non_terminal_state() {
        let service = service();
        let job = service.create(request("nightly")).await.unwrap();
        let cancelled = service.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        // cancelling again hits the terminal-state guard
        assert!(matches!(
            service.cancel(&job.id).await,
            Err(JobServiceError::State(_))
        ));
    }

    #[test]
    async fn manual_retry_follows_the_budget() {
        let service = service();
        let mut create = request("nightly");
        create.max_retries = 1;
        let job = service.create(create).await.unwrap();

        service.update_status(&job.id, JobStatus::Queued).await.unwrap();
        service.update_status(&job.id, JobStatus::Running).await.unwrap();
        service.update_status(&job.id, JobStatus::Failed).await.unwrap();

        let retried = service.retry(&job.id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.retry_count, 1);
    }
}
