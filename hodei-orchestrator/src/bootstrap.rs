use crate::comms::{WorkerChannel, WorkerEvent, WorkerManager};
use crate::config::{InfrastructureConfig, OrchestratorConfig};
use crate::engine::{
    EngineConfig, EphemeralWorkerFactory, ExecutionEngine, PooledWorkerFactory, WorkerFactory,
};
use crate::provider::{ContainerDaemonProvider, DeadlineInstanceProvider, InstanceProvider, LocalProvider};
use crate::repo::{
    ArtifactRepository, InMemoryArtifactRepository, InMemoryJobRepository,
    InMemoryResourcePoolRepository, InMemoryTemplateRepository, InMemoryWorkerRepository,
    JobRepository, ResourcePoolRepository, TemplateRepository, WorkerRepository,
};
use crate::scheduler::Scheduler;
use crate::service::job::{JobService, JobServiceDefault};
use crate::service::pool::{
    ResourceMonitor, ResourcePoolService, ResourcePoolServiceDefault, WorkerBackedResourceMonitor,
};
use crate::service::quota::QuotaService;
use crate::service::template::{TemplateService, TemplateServiceDefault};
use hodei_common::model::ProviderKind;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const WORKER_EVENT_QUEUE_DEPTH: usize = 1024;

/// The whole object graph, wired once at startup. The only process-wide
/// mutable state is the worker session map, owned by the manager the engine
/// talks through.
pub struct Services {
    pub job_repo: Arc<dyn JobRepository>,
    pub worker_repo: Arc<dyn WorkerRepository>,
    pub pool_repo: Arc<dyn ResourcePoolRepository>,
    pub template_repo: Arc<dyn TemplateRepository>,
    pub artifact_repo: Arc<dyn ArtifactRepository>,
    pub job_service: Arc<dyn JobService>,
    pub template_service: Arc<dyn TemplateService>,
    pub pool_service: Arc<dyn ResourcePoolService>,
    pub quota: Arc<QuotaService>,
    pub scheduler: Arc<Scheduler>,
    pub worker_manager: Arc<WorkerManager>,
    /// Deadline-wrapped provider adapters, keyed by the pool kind they
    /// serve; the entry point for administrative scaling.
    pub providers: HashMap<ProviderKind, Arc<dyn InstanceProvider>>,
    pub engine: ExecutionEngine,
    pub dispatcher: JoinHandle<()>,
    pub heartbeat_watchdog: JoinHandle<()>,
}

impl Services {
    pub async fn new(config: &OrchestratorConfig) -> Result<Self, String> {
        let job_repo: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new());
        let worker_repo: Arc<dyn WorkerRepository> = Arc::new(InMemoryWorkerRepository::new());
        let pool_repo: Arc<dyn ResourcePoolRepository> =
            Arc::new(InMemoryResourcePoolRepository::new());
        let template_repo: Arc<dyn TemplateRepository> =
            Arc::new(InMemoryTemplateRepository::new());
        let artifact_repo: Arc<dyn ArtifactRepository> =
            Arc::new(InMemoryArtifactRepository::new());

        let (events_tx, events_rx) = mpsc::channel::<WorkerEvent>(WORKER_EVENT_QUEUE_DEPTH);
        let worker_manager = Arc::new(WorkerManager::new(events_tx));

        let worker_monitor: Arc<dyn ResourceMonitor> =
            Arc::new(WorkerBackedResourceMonitor::new(worker_repo.clone()));
        let mut monitors: HashMap<ProviderKind, Arc<dyn ResourceMonitor>> = HashMap::new();
        for kind in [
            ProviderKind::ContainerDaemon,
            ProviderKind::ClusterApi,
            ProviderKind::CloudVendors,
            ProviderKind::Local,
        ] {
            monitors.insert(kind, worker_monitor.clone());
        }
        let pool_service: Arc<dyn ResourcePoolService> =
            Arc::new(ResourcePoolServiceDefault::new(pool_repo.clone(), monitors));

        let scheduler = Arc::new(Scheduler::new(
            pool_service.clone(),
            &config.scheduler.default_strategy,
        ));
        let quota = Arc::new(QuotaService::new(
            config.quota.soft_limit_action,
            config.quota.alert_thresholds.clone(),
        ));

        let channel: Arc<dyn WorkerChannel> = worker_manager.clone();
        let mut providers: HashMap<ProviderKind, Arc<dyn InstanceProvider>> = HashMap::new();
        providers.insert(
            ProviderKind::Local,
            Arc::new(DeadlineInstanceProvider::new(
                Arc::new(LocalProvider::new()),
                config.provider.provision_timeout,
                config.provider.terminate_timeout,
            )),
        );
        let mut factories: HashMap<ProviderKind, Arc<dyn WorkerFactory>> = HashMap::new();
        factories.insert(
            ProviderKind::Local,
            Arc::new(PooledWorkerFactory::new(worker_repo.clone(), channel.clone())),
        );
        match &config.infrastructure {
            InfrastructureConfig::Local(_) => {}
            InfrastructureConfig::ContainerDaemon(daemon_config) => {
                let provider: Arc<dyn InstanceProvider> = Arc::new(DeadlineInstanceProvider::new(
                    Arc::new(ContainerDaemonProvider::new(
                        daemon_config.clone(),
                        config.provider.retries.clone(),
                    )),
                    config.provider.provision_timeout,
                    config.provider.terminate_timeout,
                ));
                providers.insert(ProviderKind::ContainerDaemon, provider.clone());
                factories.insert(
                    ProviderKind::ContainerDaemon,
                    Arc::new(EphemeralWorkerFactory::new(
                        provider,
                        worker_repo.clone(),
                        channel.clone(),
                        config.worker.registration_timeout,
                    )),
                );
            }
            InfrastructureConfig::ClusterApi(cluster_config) => {
                #[cfg(feature = "kubernetes")]
                {
                    let client = kube::Client::try_default()
                        .await
                        .map_err(|err| format!("failed to build cluster client: {err}"))?;
                    let provider: Arc<dyn InstanceProvider> =
                        Arc::new(DeadlineInstanceProvider::new(
                            Arc::new(crate::provider::ClusterApiProvider::new(
                                client,
                                cluster_config.clone(),
                            )),
                            config.provider.provision_timeout,
                            config.provider.terminate_timeout,
                        ));
                    providers.insert(ProviderKind::ClusterApi, provider.clone());
                    factories.insert(
                        ProviderKind::ClusterApi,
                        Arc::new(EphemeralWorkerFactory::new(
                            provider,
                            worker_repo.clone(),
                            channel.clone(),
                            config.worker.registration_timeout,
                        )),
                    );
                }
                #[cfg(not(feature = "kubernetes"))]
                {
                    let _ = cluster_config;
                    return Err(
                        "infrastructure.kind = cluster_api requires the kubernetes feature"
                            .to_string(),
                    );
                }
            }
        }

        let engine = ExecutionEngine::new(
            job_repo.clone(),
            worker_repo.clone(),
            scheduler.clone(),
            quota.clone(),
            channel,
            factories,
            EngineConfig {
                cancel_grace: config.execution.cancel_grace,
                retry_delay: config.execution.retry_delay,
                per_execution_log_bytes: config.logs.per_execution_buffer_bytes,
                max_retained_contexts: config.execution.max_retained_contexts,
                ..EngineConfig::default()
            },
        );
        let dispatcher = engine.spawn_dispatcher(events_rx);
        let heartbeat_watchdog = tokio::spawn(
            worker_manager
                .clone()
                .run_heartbeat_watchdog(config.worker.lost_timeout),
        );

        let job_service: Arc<dyn JobService> = Arc::new(JobServiceDefault::new(job_repo.clone()));
        let template_service: Arc<dyn TemplateService> =
            Arc::new(TemplateServiceDefault::new(template_repo.clone()));

        Ok(Self {
            job_repo,
            worker_repo,
            pool_repo,
            template_repo,
            artifact_repo,
            job_service,
            template_service,
            pool_service,
            quota,
            scheduler,
            worker_manager,
            providers,
            engine,
            dispatcher,
            heartbeat_watchdog,
        })
    }
}
