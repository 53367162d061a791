use crate::repo::RepoError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hodei_common::model::{
    Artifact, ArtifactId, ArtifactStatus, ArtifactType, ExecutionId, JobId, PoolId,
};
use std::collections::HashMap;
use std::sync::RwLock;

#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    async fn save(&self, artifact: &Artifact) -> Result<(), RepoError>;

    async fn find_by_id(&self, id: &ArtifactId) -> Result<Option<Artifact>, RepoError>;

    async fn find_by_job_id(&self, job_id: &JobId) -> Result<Vec<Artifact>, RepoError>;

    async fn find_by_execution_id(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<Artifact>, RepoError>;

    async fn find_by_pool_id(&self, pool_id: &PoolId) -> Result<Vec<Artifact>, RepoError>;

    async fn find_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<Artifact>, RepoError>;

    async fn find_versions_by_name(&self, name: &str) -> Result<Vec<String>, RepoError>;

    async fn find_by_status(&self, status: ArtifactStatus) -> Result<Vec<Artifact>, RepoError>;

    async fn find_expired_artifacts(&self, now: DateTime<Utc>) -> Result<Vec<Artifact>, RepoError>;

    async fn find_by_type(&self, artifact_type: ArtifactType) -> Result<Vec<Artifact>, RepoError>;

    async fn delete_by_id(&self, id: &ArtifactId) -> Result<(), RepoError>;

    async fn update_status(&self, id: &ArtifactId, status: ArtifactStatus)
        -> Result<(), RepoError>;

    async fn count_by_pool(&self, pool_id: &PoolId) -> Result<u64, RepoError>;

    async fn get_total_size_by_pool(&self, pool_id: &PoolId) -> Result<u64, RepoError>;
}

#[derive(Default)]
pub struct InMemoryArtifactRepository {
    artifacts: RwLock<HashMap<ArtifactId, Artifact>>,
}

impl InMemoryArtifactRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(&self, filter: impl Fn(&Artifact) -> bool) -> Vec<Artifact> {
        let artifacts = self.artifacts.read().unwrap();
        let mut result: Vec<Artifact> = artifacts
            .values()
            .filter(|artifact| filter(artifact))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        result
    }
}

#[async_trait]
impl ArtifactRepository for InMemoryArtifactRepository {
    async fn save(&self, artifact: &Artifact) -> Result<(), RepoError> {
        self.artifacts
            .write()
            .unwrap()
            .insert(artifact.id.clone(), artifact.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &ArtifactId) -> Result<Option<Artifact>, RepoError> {
        Ok(self.artifacts.read().unwrap().get(id).cloned())
    }

    async fn find_by_job_id(&self, job_id: &JobId) -> Result<Vec<Artifact>, RepoError> {
        Ok(self.sorted(|artifact| &artifact.job_id == job_id))
    }

    async fn find_by_execution_id(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<Artifact>, RepoError> {
        Ok(self.sorted(|artifact| &artifact.execution_id == execution_id))
    }

    async fn find_by_pool_id(&self, pool_id: &PoolId) -> Result<Vec<Artifact>, RepoError> {
        Ok(self.sorted(|artifact| &artifact.pool_id == pool_id))
    }

    async fn find_by_name_and_version(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<Artifact>, RepoError> {
        Ok(self
            .artifacts
            .read()
            .unwrap()
            .values()
            .find(|artifact| artifact.name == name && artifact.version == version)
            .cloned())
    }

    async fn find_versions_by_name(&self, name: &str) -> Result<Vec<String>, RepoError> {
        Ok(self
            .sorted(|artifact| artifact.name == name)
            .into_iter()
            .map(|artifact| artifact.version)
            .collect())
    }

    async fn find_by_status(&self, status: ArtifactStatus) -> Result<Vec<Artifact>, RepoError> {
        Ok(self.sorted(|artifact| artifact.status == status))
    }

    async fn find_expired_artifacts(&self, now: DateTime<Utc>) -> Result<Vec<Artifact>, RepoError> {
        Ok(self.sorted(|artifact| {
            artifact.is_expired(now) && artifact.status != ArtifactStatus::Deleted
        }))
    }

    async fn find_by_type(&self, artifact_type: ArtifactType) -> Result<Vec<Artifact>, RepoError> {
        Ok(self.sorted(|artifact| artifact.artifact_type == artifact_type))
    }

    async fn delete_by_id(&self, id: &ArtifactId) -> Result<(), RepoError> {
        self.artifacts
            .write()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RepoError::NotFound(format!("artifact {id}")))
    }

    async fn update_status(
        &self,
        id: &ArtifactId,
        status: ArtifactStatus,
    ) -> Result<(), RepoError> {
        let mut artifacts = self.artifacts.write().unwrap();
        let artifact = artifacts
            .get_mut(id)
            .ok_or_else(|| RepoError::NotFound(format!("artifact {id}")))?;
        artifact
            .update_status(status)
            .map_err(|err| RepoError::OperationFailed(err.to_string()))
    }

    async fn count_by_pool(&self, pool_id: &PoolId) -> Result<u64, RepoError> {
        Ok(self
            .artifacts
            .read()
            .unwrap()
            .values()
            .filter(|artifact| &artifact.pool_id == pool_id)
            .count() as u64)
    }

    async fn get_total_size_by_pool(&self, pool_id: &PoolId) -> Result<u64, RepoError> {
        Ok(self
            .artifacts
            .read()
            .unwrap()
            .values()
            .filter(|artifact| &artifact.pool_id == pool_id)
            .map(|artifact| artifact.size_bytes)
            .sum())
    }
}
