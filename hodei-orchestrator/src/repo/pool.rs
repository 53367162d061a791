use crate::repo::RepoError;
use async_trait::async_trait;
use hodei_common::model::{PoolId, ResourcePool};
use std::collections::HashMap;
use std::sync::RwLock;

#[async_trait]
pub trait ResourcePoolRepository: Send + Sync {
    /// Upsert; the pool registry is small and mutated in place.
    async fn save(&self, pool: &ResourcePool) -> Result<(), RepoError>;

    async fn find_by_id(&self, id: &PoolId) -> Result<Option<ResourcePool>, RepoError>;

    async fn find_active(&self) -> Result<Vec<ResourcePool>, RepoError>;

    async fn find_all(&self) -> Result<Vec<ResourcePool>, RepoError>;

    async fn delete(&self, id: &PoolId) -> Result<(), RepoError>;
}

#[derive(Default)]
pub struct InMemoryResourcePoolRepository {
    pools: RwLock<HashMap<PoolId, ResourcePool>>,
}

impl InMemoryResourcePoolRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(&self, filter: impl Fn(&ResourcePool) -> bool) -> Vec<ResourcePool> {
        let pools = self.pools.read().unwrap();
        let mut result: Vec<ResourcePool> = pools.values().filter(|pool| filter(pool)).cloned().collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }
}

#[async_trait]
impl ResourcePoolRepository for InMemoryResourcePoolRepository {
    async fn save(&self, pool: &ResourcePool) -> Result<(), RepoError> {
        self.pools
            .write()
            .unwrap()
            .insert(pool.id.clone(), pool.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &PoolId) -> Result<Option<ResourcePool>, RepoError> {
        Ok(self.pools.read().unwrap().get(id).cloned())
    }

    async fn find_active(&self) -> Result<Vec<ResourcePool>, RepoError> {
        Ok(self.sorted(|pool| pool.can_accept_jobs()))
    }

    async fn find_all(&self) -> Result<Vec<ResourcePool>, RepoError> {
        Ok(self.sorted(|_| true))
    }

    async fn delete(&self, id: &PoolId) -> Result<(), RepoError> {
        self.pools
            .write()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RepoError::NotFound(format!("pool {id}")))
    }
}
