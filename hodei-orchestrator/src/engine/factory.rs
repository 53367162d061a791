use crate::comms::WorkerChannel;
use crate::provider::{
    InstanceProvider, InstanceSpec, InstanceType, ProvisioningError, WORKER_LABEL,
};
use crate::repo::{RepoError, WorkerRepository};
use async_trait::async_trait;
use hodei_common::model::{
    InstanceId, Job, ResourcePool, Worker, WorkerCapabilities, WorkerId, WorkerStatus,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum WorkerAcquisitionError {
    #[error("no idle worker available in pool {0}")]
    NoIdleWorker(String),
    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Brings a worker into existence (or picks an existing one) for a single
/// execution. One strategy per pool kind.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn acquire(&self, pool: &ResourcePool, job: &Job) -> Result<Worker, WorkerAcquisitionError>;

    /// Called when the execution reaches a terminal state. `teardown`
    /// forces destruction of the backing instance.
    async fn release(&self, worker: &Worker, teardown: bool);
}

/// Reuses already-connected workers; pools of this kind run a durable
/// worker fleet that outlives executions.
pub struct PooledWorkerFactory {
    workers: Arc<dyn WorkerRepository>,
    channel: Arc<dyn WorkerChannel>,
    /// Workers handed out but not yet released; keeps two concurrent
    /// acquisitions from picking the same idle worker.
    reserved: Mutex<std::collections::HashSet<WorkerId>>,
}

impl PooledWorkerFactory {
    pub fn new(workers: Arc<dyn WorkerRepository>, channel: Arc<dyn WorkerChannel>) -> Self {
        Self {
            workers,
            channel,
            reserved: Mutex::new(std::collections::HashSet::new()),
        }
    }
}

#[async_trait]
impl WorkerFactory for PooledWorkerFactory {
    async fn acquire(&self, pool: &ResourcePool, job: &Job) -> Result<Worker, WorkerAcquisitionError> {
        let connected = self.channel.connected_workers();
        let candidates = self.workers.find_by_pool(&pool.id).await?;
        let mut reserved = self.reserved.lock().unwrap();
        let chosen = candidates
            .into_iter()
            .filter(|worker| worker.status == WorkerStatus::Idle)
            .filter(|worker| connected.contains(&worker.id))
            .filter(|worker| !reserved.contains(&worker.id))
            .find(|worker| worker.capabilities.satisfies(&job.resource_requirements));
        match chosen {
            Some(worker) => {
                reserved.insert(worker.id.clone());
                debug!(worker_id = %worker.id, pool_id = %pool.id, "idle worker picked");
                Ok(worker)
            }
            None => Err(WorkerAcquisitionError::NoIdleWorker(pool.id.to_string())),
        }
    }

    async fn release(&self, worker: &Worker, teardown: bool) {
        self.reserved.lock().unwrap().remove(&worker.id);
        if teardown {
            // pooled workers only go away when a forced teardown asks for it
            self.channel.disconnect(&worker.id);
        }
    }
}

/// One fresh instance per execution. The instance is provisioned, the
/// worker inside it dials back and registers, and the instance is destroyed
/// when the execution ends.
pub struct EphemeralWorkerFactory {
    provider: Arc<dyn InstanceProvider>,
    workers: Arc<dyn WorkerRepository>,
    channel: Arc<dyn WorkerChannel>,
    registration_timeout: Duration,
    instances: Mutex<HashMap<WorkerId, InstanceId>>,
}

impl EphemeralWorkerFactory {
    pub fn new(
        provider: Arc<dyn InstanceProvider>,
        workers: Arc<dyn WorkerRepository>,
        channel: Arc<dyn WorkerChannel>,
        registration_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            workers,
            channel,
            registration_timeout,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn spec_for(job: &Job, worker_id: &WorkerId, pool: &ResourcePool) -> InstanceSpec {
        let requirements = &job.resource_requirements;
        let instance_type =
            InstanceType::smallest_covering(requirements.cpu_cores, requirements.memory_bytes);
        let mut spec = InstanceSpec::new(instance_type);
        spec.env
            .insert("HODEI_WORKER_ID".to_string(), worker_id.to_string());
        spec.env.insert("HODEI_POOL_ID".to_string(), pool.id.to_string());
        spec.labels
            .insert(WORKER_LABEL.to_string(), worker_id.to_string());
        spec
    }
}

#[async_trait]
impl WorkerFactory for EphemeralWorkerFactory {
    async fn acquire(&self, pool: &ResourcePool, job: &Job) -> Result<Worker, WorkerAcquisitionError> {
        let worker_id = WorkerId::generate();
        let spec = Self::spec_for(job, &worker_id, pool);
        let (cpu_cores, memory_bytes) = spec.instance_type.resources();

        let mut worker = Worker::new(
            pool.id.clone(),
            WorkerCapabilities {
                cpu_cores,
                memory_bytes,
                max_concurrent_jobs: 1,
                ..WorkerCapabilities::default()
            },
        );
        worker.id = worker_id.clone();
        self.workers.save(&worker).await?;

        let instance = match self.provider.provision(&pool.id, &spec).await {
            Ok(instance) => instance,
            Err(err) => {
                worker.update_status(WorkerStatus::Error).ok();
                self.workers.save(&worker).await.ok();
                return Err(err.into());
            }
        };
        self.instances
            .lock()
            .unwrap()
            .insert(worker_id.clone(), instance.id.clone());
        info!(worker_id = %worker_id, instance_id = %instance.id, pool_id = %pool.id, "worker instance provisioned");

        if !self
            .channel
            .await_worker(&worker_id, self.registration_timeout)
            .await
        {
            warn!(worker_id = %worker_id, "worker never registered, tearing the instance down");
            if let Err(err) = self.provider.terminate(&instance.id).await {
                warn!(instance_id = %instance.id, %err, "failed to terminate orphaned instance");
            }
            self.instances.lock().unwrap().remove(&worker_id);
            worker.update_status(WorkerStatus::Error).ok();
            self.workers.save(&worker).await.ok();
            return Err(ProvisioningError::Timeout.into());
        }

        // the session is up; the registered-event handler may not have
        // caught up with the repository yet, so settle the state here
        let mut registered = self
            .workers
            .find_by_id(&worker_id)
            .await?
            .unwrap_or(worker);
        if registered.status == WorkerStatus::Provisioning {
            registered
                .update_status(WorkerStatus::Idle)
                .map_err(|err| RepoError::OperationFailed(err.to_string()))?;
            registered.record_heartbeat(chrono::Utc::now());
            self.workers.save(&registered).await?;
        }
        Ok(registered)
    }

    async fn release(&self, worker: &Worker, _teardown: bool) {
        // every execution gets a fresh instance, so release always tears down
        self.channel.disconnect(&worker.id);
        let instance_id = self.instances.lock().unwrap().remove(&worker.id);
        if let Some(instance_id) = instance_id {
            if let Err(err) = self.provider.terminate(&instance_id).await {
                warn!(worker_id = %worker.id, instance_id = %instance_id, %err, "instance teardown failed");
            }
        }
    }
}
