use crate::repo::{RepoError, ResourcePoolRepository, WorkerRepository};
use async_trait::async_trait;
use chrono::Utc;
use hodei_common::model::{
    InvalidTransition, PoolId, PoolStatus, PoolUtilization, ProviderKind, ResourcePool,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum PoolServiceError {
    #[error("pool not found: {0}")]
    NotFound(PoolId),
    #[error("pool conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("resource monitor failed: {0}")]
    Monitor(String),
}

/// Produces utilization snapshots for pools of one provider kind.
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    async fn snapshot(&self, pool: &ResourcePool) -> Result<PoolUtilization, String>;
}

/// Pool registry plus cached utilization lookups.
#[async_trait]
pub trait ResourcePoolService: Send + Sync {
    async fn create_pool(&self, pool: ResourcePool) -> Result<ResourcePool, PoolServiceError>;

    async fn get_pool(&self, id: &PoolId) -> Result<Option<ResourcePool>, PoolServiceError>;

    async fn list_pools(&self) -> Result<Vec<ResourcePool>, PoolServiceError>;

    async fn active_pools(&self) -> Result<Vec<ResourcePool>, PoolServiceError>;

    async fn update_status(
        &self,
        id: &PoolId,
        status: PoolStatus,
    ) -> Result<ResourcePool, PoolServiceError>;

    async fn delete_pool(&self, id: &PoolId) -> Result<(), PoolServiceError>;

    /// Fresh-enough snapshot; results within the TTL are served from cache.
    /// The numbers are advisory, so staleness within the TTL is acceptable.
    async fn utilization(&self, pool: &ResourcePool) -> Result<PoolUtilization, PoolServiceError>;
}

pub struct ResourcePoolServiceDefault {
    pool_repo: Arc<dyn ResourcePoolRepository>,
    monitors: HashMap<ProviderKind, Arc<dyn ResourceMonitor>>,
    cache: Mutex<HashMap<PoolId, (PoolUtilization, Instant)>>,
    cache_ttl: Duration,
}

impl ResourcePoolServiceDefault {
    pub fn new(
        pool_repo: Arc<dyn ResourcePoolRepository>,
        monitors: HashMap<ProviderKind, Arc<dyn ResourceMonitor>>,
    ) -> Self {
        Self {
            pool_repo,
            monitors,
            cache: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(2),
        }
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }
}

#[async_trait]
impl ResourcePoolService for ResourcePoolServiceDefault {
    async fn create_pool(&self, pool: ResourcePool) -> Result<ResourcePool, PoolServiceError> {
        let existing = self.pool_repo.find_all().await?;
        if existing.iter().any(|p| p.name == pool.name && p.id != pool.id) {
            return Err(PoolServiceError::Conflict(format!(
                "pool name already in use: {}",
                pool.name
            )));
        }
        self.pool_repo.save(&pool).await?;
        info!(pool_id = %pool.id, name = %pool.name, kind = %pool.kind, "pool registered");
        Ok(pool)
    }

    async fn get_pool(&self, id: &PoolId) -> Result<Option<ResourcePool>, PoolServiceError> {
        Ok(self.pool_repo.find_by_id(id).await?)
    }

    async fn list_pools(&self) -> Result<Vec<ResourcePool>, PoolServiceError> {
        Ok(self.pool_repo.find_all().await?)
    }

    async fn active_pools(&self) -> Result<Vec<ResourcePool>, PoolServiceError> {
        Ok(self.pool_repo.find_active().await?)
    }

    async fn update_status(
        &self,
        id: &PoolId,
        status: PoolStatus,
    ) -> Result<ResourcePool, PoolServiceError> {
        let mut pool = self
            .pool_repo
            .find_by_id(id)
            .await?
            .ok_or_else(|| PoolServiceError::NotFound(id.clone()))?;
        pool.update_status(status)?;
        self.pool_repo.save(&pool).await?;
        Ok(pool)
    }

    async fn delete_pool(&self, id: &PoolId) -> Result<(), PoolServiceError> {
        self.pool_repo.delete(id).await?;
        self.cache.lock().unwrap().remove(id);
        Ok(())
    }

    async fn utilization(&self, pool: &ResourcePool) -> Result<PoolUtilization, PoolServiceError> {
        if let Some((snapshot, taken_at)) = self.cache.lock().unwrap().get(&pool.id) {
            if taken_at.elapsed() < self.cache_ttl {
                return Ok(*snapshot);
            }
        }

        let monitor = self
            .monitors
            .get(&pool.kind)
            .ok_or_else(|| PoolServiceError::Monitor(format!("no monitor for kind {}", pool.kind)))?;
        let snapshot = monitor
            .snapshot(pool)
            .await
            .map_err(PoolServiceError::Monitor)?;
        self.cache
            .lock()
            .unwrap()
            .insert(pool.id.clone(), (snapshot, Instant::now()));
        Ok(snapshot)
    }
}

/// Derives utilization from the worker registry: busy workers carry their
/// allocation, totals come from the pool's capacity snapshot.
pub struct WorkerBackedResourceMonitor {
    worker_repo: Arc<dyn WorkerRepository>,
}

impl WorkerBackedResourceMonitor {
    pub fn new(worker_repo: Arc<dyn WorkerRepository>) -> Self {
        Self { worker_repo }
    }
}

#[async_trait]
impl ResourceMonitor for WorkerBackedResourceMonitor {
    async fn snapshot(&self, pool: &ResourcePool) -> Result<PoolUtilization, String> {
        let workers = self
            .worker_repo
            .find_by_pool(&pool.id)
            .await
            .map_err(|err| err.to_string())?;

        let mut used_cpu = 0.0;
        let mut used_memory = 0u64;
        let mut used_disk = 0u64;
        let mut running_jobs = 0u32;
        for worker in workers.iter().filter(|worker| worker.is_busy()) {
            running_jobs += 1;
            if let Some(allocation) = &worker.allocation {
                used_cpu += allocation.cpu_cores;
                used_memory += allocation.memory_bytes;
                used_disk += allocation.disk_bytes;
            }
        }

        Ok(PoolUtilization {
            total_cpu_cores: pool.capacity.total_cpu_cores,
            used_cpu_cores: used_cpu,
            total_memory_bytes: pool.capacity.total_memory_bytes,
            used_memory_bytes: used_memory,
            total_disk_bytes: pool.capacity.total_disk_bytes,
            used_disk_bytes: used_disk,
            running_jobs,
            queued_jobs: 0,
            timestamp: Utc::now(),
        })
    }
}

/// Serves pre-set snapshots; pools backed by externally-metered
/// infrastructure push their numbers here.
#[derive(Default)]
pub struct StaticResourceMonitor {
    snapshots: Mutex<HashMap<PoolId, PoolUtilization>>,
}

impl StaticResourceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pool_id: PoolId, utilization: PoolUtilization) {
        self.snapshots.lock().unwrap().insert(pool_id, utilization);
    }
}

#[async_trait]
impl ResourceMonitor for StaticResourceMonitor {
    async fn snapshot(&self, pool: &ResourcePool) -> Result<PoolUtilization, String> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .get(&pool.id)
            .copied()
            .unwrap_or_else(|| PoolUtilization::idle(&pool.capacity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{InMemoryResourcePoolRepository, InMemoryWorkerRepository};
    use hodei_common::model::{
        PoolCapacity, ResourceRequirements, Worker, WorkerCapabilities, WorkerStatus,
    };
    use test_r::test;

    fn service_with_worker_monitor(
        worker_repo: Arc<InMemoryWorkerRepository>,
    ) -> ResourcePoolServiceDefault {
        let mut monitors: HashMap<ProviderKind, Arc<dyn ResourceMonitor>> = HashMap::new();
        monitors.insert(
            ProviderKind::Local,
            Arc::new(WorkerBackedResourceMonitor::new(worker_repo)),
        );
        ResourcePoolServiceDefault::new(Arc::new(InMemoryResourcePoolRepository::new()), monitors)
    }

    #[test]
    async fn duplicate_pool_names_are_rejected() {
        let service = service_with_worker_monitor(Arc::new(InMemoryWorkerRepository::new()));
        let pool = ResourcePool::new("p1", ProviderKind::Local, PoolCapacity::default());
        service.create_pool(pool).await.unwrap();
        let duplicate = ResourcePool::new("p1", ProviderKind::Local, PoolCapacity::default());
        assert!(matches!(
            service.create_pool(duplicate).await,
            Err(PoolServiceError::Conflict(_))
        ));
    }

    #[test]
    async fn utilization_reflects_busy_workers() {
        let worker_repo = Arc::new(InMemoryWorkerRepository::new());
        let service = service_with_worker_monitor(worker_repo.clone());

        let capacity = PoolCapacity {
            total_cpu_cores: 4.0,
            total_memory_bytes: 8_000,
            total_disk_bytes: 0,
            total_workers: 2,
        };
        let pool = service
            .create_pool(ResourcePool::new("p1", ProviderKind::Local, capacity))
            .await
            .unwrap();

        let mut worker = Worker::new(pool.id.clone(), WorkerCapabilities::default());
        worker.update_status(WorkerStatus::Idle).unwrap();
        worker
            .assign_execution(
                hodei_common::model::ExecutionId::generate(),
                ResourceRequirements::new(1.0, 2_000),
            )
            .unwrap();
        worker_repo.save(&worker).await.unwrap();

        let utilization = service.utilization(&pool).await.unwrap();
        assert_eq!(utilization.used_cpu_cores, 1.0);
        assert_eq!(utilization.used_memory_bytes, 2_000);
        assert_eq!(utilization.running_jobs, 1);
        assert_eq!(utilization.available_cpu_cores(), 3.0);
    }
}
