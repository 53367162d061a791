use crate::repo::RepoError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use hodei_common::model::{Job, JobId, JobStatus, TemplateId};
use std::collections::HashMap;
use std::sync::RwLock;

/// Jobs are kept forever; `delete` exists for administrative cleanup only.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn save(&self, job: &Job) -> Result<(), RepoError>;

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, RepoError>;

    async fn find_by_name(&self, name: &str, namespace: &str) -> Result<Option<Job>, RepoError>;

    fn list(
        &self,
        page: u32,
        page_size: u32,
        status: Option<JobStatus>,
        namespace: Option<String>,
    ) -> BoxStream<'static, Result<Job, RepoError>>;

    async fn update(&self, job: &Job) -> Result<(), RepoError>;

    async fn delete(&self, id: &JobId) -> Result<(), RepoError>;

    async fn exists_by_name(&self, name: &str, namespace: &str) -> Result<bool, RepoError>;

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, RepoError>;

    async fn find_by_template_id(&self, template_id: &TemplateId) -> Result<Vec<Job>, RepoError>;
}

#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_snapshot(&self) -> Vec<Job> {
        let jobs = self.jobs.read().unwrap();
        let mut snapshot: Vec<Job> = jobs.values().cloned().collect();
        snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshot
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn save(&self, job: &Job) -> Result<(), RepoError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(RepoError::UniqueViolation(format!("job {}", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, RepoError> {
        Ok(self.jobs.read().unwrap().get(id).cloned())
    }

    async fn find_by_name(&self, name: &str, namespace: &str) -> Result<Option<Job>, RepoError> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .values()
            .find(|job| job.name == name && job.namespace == namespace)
            .cloned())
    }

    fn list(
        &self,
        page: u32,
        page_size: u32,
        status: Option<JobStatus>,
        namespace: Option<String>,
    ) -> BoxStream<'static, Result<Job, RepoError>> {
        let jobs = self
            .sorted_snapshot()
            .into_iter()
            .filter(move |job| status.is_none_or(|status| job.status == status))
            .filter(move |job| {
                namespace
                    .as_deref()
                    .is_none_or(|namespace| job.namespace == namespace)
            })
            .skip(page as usize * page_size as usize)
            .take(page_size as usize)
            .map(Ok)
            .collect::<Vec<_>>();
        futures::stream::iter(jobs).boxed()
    }

    async fn update(&self, job: &Job) -> Result<(), RepoError> {
        let mut jobs = self.jobs.write().unwrap();
        if !jobs.contains_key(&job.id) {
            return Err(RepoError::NotFound(format!("job {}", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete(&self, id: &JobId) -> Result<(), RepoError> {
        self.jobs
            .write()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RepoError::NotFound(format!("job {id}")))
    }

    async fn exists_by_name(&self, name: &str, namespace: &str) -> Result<bool, RepoError> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .values()
            .any(|job| job.name == name && job.namespace == namespace))
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, RepoError> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|job| job.status == status)
            .count() as u64)
    }

    async fn find_by_template_id(&self, template_id: &TemplateId) -> Result<Vec<Job>, RepoError> {
        Ok(self
            .sorted_snapshot()
            .into_iter()
            .filter(|job| {
                job.template
                    .as_ref()
                    .is_some_and(|template| &template.template_id == template_id)
            })
            .collect())
    }
}
