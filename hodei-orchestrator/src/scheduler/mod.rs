pub mod strategy;

pub use strategy::{builtin_strategies, PlacementStrategy, PoolCandidate};

use crate::service::pool::ResourcePoolService;
use hodei_common::model::{Job, PoolId, PoolUtilization, ResourcePool};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulingError {
    #[error("no active pools available")]
    NoActivePools,
    #[error("requested pool {0} cannot host the job")]
    RequestedPoolInsufficient(PoolId),
    #[error("no pool can host the job")]
    NoEligiblePool,
    #[error("unknown placement strategy: {0}")]
    UnknownStrategy(String),
    #[error("scheduling failed: {0}")]
    Internal(String),
}

/// Turns a pending job into a pool choice: active pools are filtered by
/// remaining capacity, the named strategy picks one of the survivors. The
/// whole decision is deterministic for identical inputs.
pub struct Scheduler {
    pool_service: Arc<dyn ResourcePoolService>,
    strategies: HashMap<String, Arc<dyn PlacementStrategy>>,
    default_strategy: String,
}

impl Scheduler {
    pub fn new(pool_service: Arc<dyn ResourcePoolService>, default_strategy: &str) -> Self {
        let strategies = builtin_strategies();
        if !strategies.contains_key(default_strategy) {
            warn!(
                "configured default strategy '{default_strategy}' is unknown, \
                 falling back to leastloaded"
            );
        }
        let default_strategy = if strategies.contains_key(default_strategy) {
            default_strategy.to_string()
        } else {
            "leastloaded".to_string()
        };
        Self {
            pool_service,
            strategies,
            default_strategy,
        }
    }

    pub fn available_strategies(&self) -> BTreeSet<String> {
        self.strategies.keys().cloned().collect()
    }

    pub async fn select_pool(
        &self,
        job: &Job,
        strategy_name: Option<&str>,
    ) -> Result<ResourcePool, SchedulingError> {
        let active = self
            .pool_service
            .active_pools()
            .await
            .map_err(|err| SchedulingError::Internal(err.to_string()))?;
        if active.is_empty() {
            return Err(SchedulingError::NoActivePools);
        }

        // an explicitly requested pool either fits or the job fails; it
        // never silently falls back to another pool
        if let Some(target) = &job.target_pool_id {
            let pool = active
                .iter()
                .find(|pool| &pool.id == target)
                .ok_or_else(|| SchedulingError::RequestedPoolInsufficient(target.clone()))?;
            let utilization = self
                .pool_service
                .utilization(pool)
                .await
                .map_err(|err| SchedulingError::Internal(err.to_string()))?;
            return if Self::fits(job, pool, &utilization) {
                Ok(pool.clone())
            } else {
                Err(SchedulingError::RequestedPoolInsufficient(target.clone()))
            };
        }

        let mut candidates = Vec::new();
        for pool in active {
            // snapshots are best-effort; a pool whose monitor fails is
            // skipped for this round rather than failing the placement
            let utilization = match self.pool_service.utilization(&pool).await {
                Ok(utilization) => utilization,
                Err(err) => {
                    warn!(pool_id = %pool.id, %err, "skipping pool without utilization snapshot");
                    continue;
                }
            };
            if Self::fits(job, &pool, &utilization) {
                candidates.push(PoolCandidate { pool, utilization });
            }
        }
        if candidates.is_empty() {
            return Err(SchedulingError::NoEligiblePool);
        }
        candidates.sort_by(|a, b| a.pool.id.cmp(&b.pool.id));

        let name = strategy_name.unwrap_or(&self.default_strategy);
        let strategy = self
            .strategies
            .get(name)
            .ok_or_else(|| SchedulingError::UnknownStrategy(name.to_string()))?;
        let chosen = strategy
            .select(&candidates)
            .ok_or(SchedulingError::NoEligiblePool)?;
        debug!(job_id = %job.id, pool_id = %chosen.pool.id, strategy = name, "pool selected");
        Ok(chosen.pool.clone())
    }

    fn fits(job: &Job, pool: &ResourcePool, utilization: &PoolUtilization) -> bool {
        let requirements = &job.resource_requirements;
        utilization.available_cpu_cores() >= requirements.cpu_cores
            && utilization.available_memory_bytes() >= requirements.memory_bytes
            && pool
                .policies
                .max_jobs
                .is_none_or(|max_jobs| utilization.running_jobs < max_jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{InMemoryResourcePoolRepository, ResourcePoolRepository};
    use crate::service::pool::{ResourceMonitor, ResourcePoolServiceDefault, StaticResourceMonitor};
    use chrono::Utc;
    use hodei_common::model::{
        ExecutionDefinition, PoolCapacity, PoolStatus, ProviderKind, ResourceRequirements,
    };
    use std::time::Duration;
    use test_r::test;

    struct Fixture {
        pool_repo: Arc<InMemoryResourcePoolRepository>,
        monitor: Arc<StaticResourceMonitor>,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        let pool_repo = Arc::new(InMemoryResourcePoolRepository::new());
        let monitor = Arc::new(StaticResourceMonitor::new());
        let mut monitors: HashMap<ProviderKind, Arc<dyn ResourceMonitor>> = HashMap::new();
        monitors.insert(ProviderKind::Local, monitor.clone());
        let pool_service = Arc::new(
            ResourcePoolServiceDefault::new(pool_repo.clone(), monitors)
                .with_cache_ttl(Duration::ZERO),
        );
        let scheduler = Scheduler::new(pool_service, "leastloaded");
        Fixture {
            pool_repo,
            monitor,
            scheduler,
        }
    }

    async fn add_pool(fixture: &Fixture, name: &str, used_cpu: f64) -> ResourcePool {
        let capacity = PoolCapacity {
            total_cpu_cores: 4.0,
            total_memory_bytes: 8_192,
            total_disk_bytes: 0,
            total_workers: 4,
        };
        let mut pool = ResourcePool::new(name, ProviderKind::Local, capacity);
        pool.id = PoolId(name.to_string());
        pool.update_status(PoolStatus::Active).unwrap();
        fixture.pool_repo.save(&pool).await.unwrap();
        fixture.monitor.set(
            pool.id.clone(),
            PoolUtilization {
                total_cpu_cores: 4.0,
                used_cpu_cores: used_cpu,
                total_memory_bytes: 8_192,
                used_memory_bytes: 0,
                total_disk_bytes: 0,
                used_disk_bytes: 0,
                running_jobs: 0,
                queued_jobs: 0,
                timestamp: Utc::now(),
            },
        );
        pool
    }

    fn job(cpu: f64) -> Job {
        let mut job = Job::new("j", "default", ExecutionDefinition::shell(["true"]), "tests");
        job.resource_requirements = ResourceRequirements::new(cpu, 1_024);
        job
    }

    #[test]
    async fn empty_registry_means_no_active_pools() {
        let fixture = fixture();
        assert_eq!(
            fixture.scheduler.select_pool(&job(1.0), None).await,
            Err(SchedulingError::NoActivePools)
        );
    }

    #[test]
    async fn jobs_too_large_for_every_pool_are_rejected() {
        let fixture = fixture();
        add_pool(&fixture, "p1", 3.9).await;
        add_pool(&fixture, "p2", 3.8).await;
        assert_eq!(
            fixture.scheduler.select_pool(&job(2.0), None).await,
            Err(SchedulingError::NoEligiblePool)
        );
    }

    #[test]
    async fn explicit_pool_never_falls_back() {
        let fixture = fixture();
        let full = add_pool(&fixture, "p1", 4.0).await;
        add_pool(&fixture, "p2", 0.0).await;

        let mut pinned = job(1.0);
        pinned.target_pool_id = Some(full.id.clone());
        assert_eq!(
            fixture.scheduler.select_pool(&pinned, None).await,
            Err(SchedulingError::RequestedPoolInsufficient(full.id))
        );
    }

    #[test]
    async fn explicit_pool_with_room_is_honored() {
        let fixture = fixture();
        add_pool(&fixture, "p1", 0.0).await;
        let target = add_pool(&fixture, "p2", 1.0).await;

        let mut pinned = job(1.0);
        pinned.target_pool_id = Some(target.id.clone());
        let chosen = fixture.scheduler.select_pool(&pinned, None).await.unwrap();
        assert_eq!(chosen.id, target.id);
    }

    #[test]
    async fn placement_is_deterministic_for_identical_inputs() {
        let fixture = fixture();
        add_pool(&fixture, "p1", 2.0).await;
        add_pool(&fixture, "p2", 1.0).await;

        let job = job(1.0);
        let first = fixture.scheduler.select_pool(&job, None).await.unwrap();
        let second = fixture.scheduler.select_pool(&job, None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.id.as_str(), "p2");
    }

    #[test]
    async fn unknown_strategy_is_reported() {
        let fixture = fixture();
        add_pool(&fixture, "p1", 0.0).await;
        assert_eq!(
            fixture.scheduler.select_pool(&job(1.0), Some("spread")).await,
            Err(SchedulingError::UnknownStrategy("spread".to_string()))
        );
    }

    #[test]
    async fn exposes_the_builtin_strategy_names() {
        let fixture = fixture();
        let names = fixture.scheduler.available_strategies();
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["binpacking", "greedy", "leastloaded", "roundrobin"]
        );
    }
}
