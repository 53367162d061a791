use crate::repo::{RepoError, TemplateRepository};
use crate::service::job::{CreateJobRequest, JobServiceError};
use async_trait::async_trait;
use hodei_common::model::{
    ExecutionDefinition, InvalidTransition, JobPriority, PoolId, ResourceRequirements, Template,
    TemplateId, TemplateRef, TemplateStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum TemplateServiceError {
    #[error("invalid template: {}", errors.join(", "))]
    Validation { errors: Vec<String> },
    #[error("template not found: {0}")]
    NotFound(String),
    #[error("template conflict: {0}")]
    Conflict(String),
    #[error("template not instantiable: {0}")]
    NotInstantiable(String),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[derive(Debug, Clone)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub payload: ExecutionDefinition,
    pub default_parameters: HashMap<String, String>,
    pub resource_requirements: ResourceRequirements,
    pub created_by: String,
}

#[derive(Debug, Clone, Default)]
pub struct InstantiateRequest {
    pub job_name: String,
    pub namespace: String,
    pub parameters: HashMap<String, String>,
    pub priority: JobPriority,
    pub max_retries: u32,
    pub target_pool_id: Option<PoolId>,
    pub created_by: String,
}

#[async_trait]
pub trait TemplateService: Send + Sync {
    /// Registers a new draft; `(name, version)` must be unique and the
    /// version a valid semantic version.
    async fn create_draft(
        &self,
        request: CreateTemplateRequest,
    ) -> Result<Template, TemplateServiceError>;

    async fn get(&self, id: &TemplateId) -> Result<Template, TemplateServiceError>;

    async fn find(
        &self,
        name: &str,
        version: &semver::Version,
    ) -> Result<Option<Template>, TemplateServiceError>;

    async fn versions(&self, name: &str) -> Result<Vec<Template>, TemplateServiceError>;

    async fn search(&self, query: &str) -> Result<Vec<Template>, TemplateServiceError>;

    /// Draft -> Validating.
    async fn submit_for_validation(&self, id: &TemplateId)
        -> Result<Template, TemplateServiceError>;

    /// Validating -> Published on success, back to Draft on failure.
    async fn complete_validation(
        &self,
        id: &TemplateId,
        valid: bool,
    ) -> Result<Template, TemplateServiceError>;

    async fn deprecate(&self, id: &TemplateId) -> Result<Template, TemplateServiceError>;

    async fn archive(&self, id: &TemplateId) -> Result<Template, TemplateServiceError>;

    /// Builds an admission request from a published template; template
    /// defaults are overlaid with the caller's parameters.
    async fn instantiate(
        &self,
        id: &TemplateId,
        request: InstantiateRequest,
    ) -> Result<CreateJobRequest, TemplateServiceError>;
}

pub struct TemplateServiceDefault {
    template_repo: Arc<dyn TemplateRepository>,
}

impl TemplateServiceDefault {
    pub fn new(template_repo: Arc<dyn TemplateRepository>) -> Self {
        Self { template_repo }
    }

    async fn transition(
        &self,
        id: &TemplateId,
        status: TemplateStatus,
    ) -> Result<Template, TemplateServiceError> {
        let mut template = self.get(id).await?;
        template.update_status(status)?;
        self.template_repo.save(&template).await?;
        Ok(template)
    }
}

#[async_trait]
impl TemplateService for TemplateServiceDefault {
    async fn create_draft(
        &self,
        request: CreateTemplateRequest,
    ) -> Result<Template, TemplateServiceError> {
        let mut errors = Vec::new();
        if request.name.trim().is_empty() {
            errors.push("name must not be blank".to_string());
        }
        let version = match semver::Version::parse(&request.version) {
            Ok(version) => Some(version),
            Err(err) => {
                errors.push(format!("invalid version '{}': {err}", request.version));
                None
            }
        };
        if !errors.is_empty() {
            return Err(TemplateServiceError::Validation { errors });
        }
        let version = version.ok_or_else(|| TemplateServiceError::Validation {
            errors: vec!["invalid version".to_string()],
        })?;

        if self
            .template_repo
            .exists_by_name_and_version(&request.name, &version)
            .await?
        {
            return Err(TemplateServiceError::Conflict(format!(
                "template already exists: {}@{version}",
                request.name
            )));
        }

        let mut template = Template::new(request.name, version, request.payload, request.created_by);
        template.description = request.description;
        template.default_parameters = request.default_parameters;
        template.resource_requirements = request.resource_requirements;
        self.template_repo.save(&template).await?;
        info!(template_id = %template.id, name = %template.name, version = %template.version, "template drafted");
        Ok(template)
    }

    async fn get(&self, id: &TemplateId) -> Result<Template, TemplateServiceError> {
        self.template_repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| TemplateServiceError::NotFound(id.to_string()))
    }

    async fn find(
        &self,
        name: &str,
        version: &semver::Version,
    ) -> Result<Option<Template>, TemplateServiceError> {
        Ok(self
            .template_repo
            .find_by_name_and_version(name, version)
            .await?)
    }

    async fn versions(&self, name: &str) -> Result<Vec<Template>, TemplateServiceError> {
        Ok(self.template_repo.find_by_name(name).await?)
    }

    async fn search(&self, query: &str) -> Result<Vec<Template>, TemplateServiceError> {
        Ok(self.template_repo.search(query).await?)
    }

    async fn submit_for_validation(
        &self,
        id: &TemplateId,
    ) -> Result<Template, TemplateServiceError> {
        self.transition(id, TemplateStatus::Validating).await
    }

    async fn complete_validation(
        &self,
        id: &TemplateId,
        valid: bool,
    ) -> Result<Template, TemplateServiceError> {
        let target = if valid {
            TemplateStatus::Published
        } else {
            TemplateStatus::Draft
        };
        self.transition(id, target).await
    }

    async fn deprecate(&self, id: &TemplateId) -> Result<Template, TemplateServiceError> {
        self.transition(id, TemplateStatus::Deprecated).await
    }

    async fn archive(&self, id: &TemplateId) -> Result<Template, TemplateServiceError> {
        self.transition(id, TemplateStatus::Archived).await
    }

    async fn instantiate(
        &self,
        id: &TemplateId,
        request: InstantiateRequest,
    ) -> Result<CreateJobRequest, TemplateServiceError> {
        let template = self.get(id).await?;
        if !template.is_instantiable() {
            return Err(TemplateServiceError::NotInstantiable(format!(
                "{}@{} is {}",
                template.name, template.version, template.status
            )));
        }

        let mut parameters = template.default_parameters.clone();
        parameters.extend(request.parameters);

        let mut job_request = CreateJobRequest::new(
            request.job_name,
            request.namespace,
            template.payload.clone(),
            request.created_by,
        );
        job_request.parameters = parameters;
        job_request.priority = request.priority;
        job_request.max_retries = request.max_retries;
        job_request.resource_requirements = template.resource_requirements;
        job_request.target_pool_id = request.target_pool_id;
        job_request.template = Some(TemplateRef {
            template_id: template.id.clone(),
            version: template.version.clone(),
        });

        self.template_repo.update_statistics(&template.id, 1).await?;
        Ok(job_request)
    }
}

impl From<TemplateServiceError> for JobServiceError {
    fn from(value: TemplateServiceError) -> Self {
        match value {
            TemplateServiceError::Validation { errors } => JobServiceError::Validation { errors },
            TemplateServiceError::Conflict(message) => JobServiceError::Conflict(message),
            TemplateServiceError::Repo(err) => JobServiceError::Repo(err),
            other => JobServiceError::Conflict(other.to_string()),
        }
    }
}
