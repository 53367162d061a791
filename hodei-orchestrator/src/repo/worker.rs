use crate::repo::RepoError;
use async_trait::async_trait;
use hodei_common::model::{PoolId, Worker, WorkerId, WorkerStatus};
use std::collections::HashMap;
use std::sync::RwLock;

#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// Upsert; worker records follow the live state of the fleet.
    async fn save(&self, worker: &Worker) -> Result<(), RepoError>;

    async fn find_by_id(&self, id: &WorkerId) -> Result<Option<Worker>, RepoError>;

    /// Idle workers, across all pools, sorted by id.
    async fn find_available(&self) -> Result<Vec<Worker>, RepoError>;

    async fn find_by_pool(&self, pool_id: &PoolId) -> Result<Vec<Worker>, RepoError>;

    async fn delete(&self, id: &WorkerId) -> Result<(), RepoError>;
}

#[derive(Default)]
pub struct InMemoryWorkerRepository {
    workers: RwLock<HashMap<WorkerId, Worker>>,
}

impl InMemoryWorkerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(&self, filter: impl Fn(&Worker) -> bool) -> Vec<Worker> {
        let workers = self.workers.read().unwrap();
        let mut result: Vec<Worker> = workers.values().filter(|worker| filter(worker)).cloned().collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }
}

#[async_trait]
impl WorkerRepository for InMemoryWorkerRepository {
    async fn save(&self, worker: &Worker) -> Result<(), RepoError> {
        self.workers
            .write()
            .unwrap()
            .insert(worker.id.clone(), worker.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &WorkerId) -> Result<Option<Worker>, RepoError> {
        Ok(self.workers.read().unwrap().get(id).cloned())
    }

    async fn find_available(&self) -> Result<Vec<Worker>, RepoError> {
        Ok(self.sorted(|worker| worker.status == WorkerStatus::Idle))
    }

    async fn find_by_pool(&self, pool_id: &PoolId) -> Result<Vec<Worker>, RepoError> {
        Ok(self.sorted(|worker| &worker.pool_id == pool_id))
    }

    async fn delete(&self, id: &WorkerId) -> Result<(), RepoError> {
        self.workers
            .write()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RepoError::NotFound(format!("worker {id}")))
    }
}
