use futures::{SinkExt, StreamExt};
use hodei_common::model::{
    ExecutionDefinition, ExecutionId, Job, PoolCapacity, PoolId, PoolStatus, ProviderKind,
    ResourcePool, ResourceRequirements, Worker, WorkerCapabilities, WorkerStatus,
};
use hodei_orchestrator::bootstrap::Services;
use hodei_orchestrator::comms::{serve_worker_streams, StreamServerParams, WorkerChannel};
use hodei_orchestrator::config::OrchestratorConfig;
use hodei_orchestrator::engine::ExecutionError;
use hodei_orchestrator::service::job::CreateJobRequest;
use hodei_wire::codec::WorkerCodec;
use hodei_wire::message::{
    orchestrator_message, worker_message, Capabilities, EventKind, ExecutionAssignment,
    ExecutionResult, LogChunk, LogStreamKind, StatusUpdate, WorkerMessage,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub const GIB: u64 = 1024 * 1024 * 1024;

pub struct TestCluster {
    pub services: Services,
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub server: JoinHandle<()>,
}

pub async fn start_cluster(tweak: impl FnOnce(&mut OrchestratorConfig)) -> TestCluster {
    let mut config = OrchestratorConfig::default();
    config.execution.cancel_grace = Duration::from_secs(1);
    config.execution.retry_delay = Duration::from_millis(100);
    tweak(&mut config);

    let services = Services::new(&config).await.expect("failed to wire services");
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_worker_streams(
        listener,
        services.worker_manager.clone(),
        StreamServerParams {
            registration_timeout: config.worker.registration_timeout,
            heartbeat_interval: config.worker.heartbeat_interval,
        },
        shutdown.clone(),
    ));
    TestCluster {
        services,
        addr,
        shutdown,
        server,
    }
}

impl TestCluster {
    pub async fn add_active_pool(&self, name: &str, cpu: f64, memory: u64) -> ResourcePool {
        let mut pool = ResourcePool::new(
            name,
            ProviderKind::Local,
            PoolCapacity {
                total_cpu_cores: cpu,
                total_memory_bytes: memory,
                total_disk_bytes: 0,
                total_workers: 8,
            },
        );
        pool.id = PoolId(name.to_string());
        let pool = self.services.pool_service.create_pool(pool).await.unwrap();
        self.services
            .pool_service
            .update_status(&pool.id, PoolStatus::Active)
            .await
            .unwrap()
    }

    /// Seeds a busy worker so the pool's utilization snapshot shows load.
    pub async fn seed_busy_worker(&self, pool_id: &PoolId, name: &str, cpu: f64, memory: u64) {
        let mut worker = Worker::new(
            pool_id.clone(),
            WorkerCapabilities {
                cpu_cores: cpu,
                memory_bytes: memory,
                max_concurrent_jobs: 1,
                ..WorkerCapabilities::default()
            },
        );
        worker.id = hodei_common::model::WorkerId(name.to_string());
        worker.update_status(WorkerStatus::Idle).unwrap();
        worker
            .assign_execution(
                ExecutionId::generate(),
                ResourceRequirements::new(cpu, memory),
            )
            .unwrap();
        self.services.worker_repo.save(&worker).await.unwrap();
    }

    pub async fn submit_shell_job(
        &self,
        name: &str,
        cpu: f64,
        memory: u64,
        max_retries: u32,
        target_pool_id: Option<PoolId>,
    ) -> (Job, Result<ExecutionId, ExecutionError>) {
        let mut request = CreateJobRequest::new(
            name,
            "default",
            ExecutionDefinition::shell(["echo hello"]),
            "tests",
        );
        request.resource_requirements = ResourceRequirements::new(cpu, memory);
        request.max_retries = max_retries;
        request.target_pool_id = target_pool_id;
        let job = self.services.job_service.create(request).await.unwrap();
        let submitted = self.services.engine.submit(job.clone()).await;
        (job, submitted)
    }

    pub async fn wait_for_idle_worker(&self, name: &str) {
        assert!(
            self.wait_worker_status(name, WorkerStatus::Idle, Duration::from_secs(5))
                .await,
            "worker {name} never became idle"
        );
    }

    pub async fn job_status(
        &self,
        job_id: &hodei_common::model::JobId,
    ) -> hodei_common::model::JobStatus {
        self.services
            .job_repo
            .find_by_id(job_id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    pub async fn worker_status(&self, name: &str) -> Option<WorkerStatus> {
        self.services
            .worker_repo
            .find_by_id(&hodei_common::model::WorkerId(name.to_string()))
            .await
            .unwrap()
            .map(|worker| worker.status)
    }

    pub async fn wait_job_status(
        &self,
        job_id: &hodei_common::model::JobId,
        status: hodei_common::model::JobStatus,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.job_status(job_id).await == status {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn wait_worker_status(
        &self,
        name: &str,
        status: WorkerStatus,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.worker_status(name).await == Some(status) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn wait_quota_zero(&self, pool_id: &PoolId, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.services.quota.usage(pool_id).await.is_zero() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn wait_no_sessions(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.services.worker_manager.connected_workers().is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Worker side of the wire contract, scripted by the tests.
pub struct TestWorker {
    framed: Framed<TcpStream, WorkerCodec>,
    pub worker_id: String,
}

impl TestWorker {
    pub async fn connect(addr: SocketAddr, worker_id: &str, pool_id: &PoolId) -> TestWorker {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, WorkerCodec::new());
        framed
            .send(WorkerMessage::register(
                worker_id,
                pool_id.to_string(),
                Capabilities {
                    cpu_cores: 4.0,
                    memory_bytes: 8 * GIB,
                    storage_bytes: 10 * GIB,
                    platforms: vec!["linux/amd64".to_string()],
                    runtimes: vec!["shell".to_string()],
                    max_concurrent_jobs: 1,
                    features: vec![],
                },
            ))
            .await
            .unwrap();

        let ack = tokio::time::timeout(Duration::from_secs(5), framed.next())
            .await
            .expect("no registration ack")
            .expect("stream closed during handshake")
            .expect("handshake frame failed to decode");
        match ack.payload {
            Some(orchestrator_message::Payload::RegisterAck(ack)) => {
                assert_eq!(ack.worker_id, worker_id);
            }
            other => panic!("expected a registration ack, got {other:?}"),
        }
        TestWorker {
            framed,
            worker_id: worker_id.to_string(),
        }
    }

    pub async fn raw_connect(addr: SocketAddr) -> Framed<TcpStream, WorkerCodec> {
        Framed::new(TcpStream::connect(addr).await.unwrap(), WorkerCodec::new())
    }

    pub async fn next_payload(
        &mut self,
        timeout: Duration,
    ) -> Option<orchestrator_message::Payload> {
        match tokio::time::timeout(timeout, self.framed.next()).await {
            Ok(Some(Ok(message))) => message.payload,
            _ => None,
        }
    }

    pub async fn expect_assignment(&mut self, timeout: Duration) -> ExecutionAssignment {
        match self.next_payload(timeout).await {
            Some(orchestrator_message::Payload::ExecutionAssignment(assignment)) => assignment,
            other => panic!("expected an assignment, got {other:?}"),
        }
    }

    /// Waits for an assignment while heartbeating, so the worker survives
    /// aggressive lost-worker timeouts configured by a test.
    pub async fn expect_assignment_with_heartbeats(
        &mut self,
        timeout: Duration,
        heartbeat_every: Duration,
    ) -> ExecutionAssignment {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout(heartbeat_every, self.framed.next()).await {
                Ok(Some(Ok(message))) => match message.payload {
                    Some(orchestrator_message::Payload::ExecutionAssignment(assignment)) => {
                        return assignment;
                    }
                    _ => continue,
                },
                Ok(_) => panic!("stream closed while waiting for an assignment"),
                Err(_) => {
                    if tokio::time::Instant::now() >= deadline {
                        panic!("no assignment within {timeout:?}");
                    }
                    self.send_heartbeat().await;
                }
            }
        }
    }

    pub async fn send_heartbeat(&mut self) {
        self.framed
            .send(WorkerMessage::heartbeat(self.worker_id.clone()))
            .await
            .unwrap();
    }

    pub async fn send_stdout(&mut self, execution_id: &str, payload: &str) {
        self.framed
            .send(WorkerMessage {
                payload: Some(worker_message::Payload::LogChunk(LogChunk {
                    execution_id: execution_id.to_string(),
                    stream: LogStreamKind::Stdout as i32,
                    payload: bytes::Bytes::from(payload.to_string()),
                })),
            })
            .await
            .unwrap();
    }

    pub async fn send_status(&mut self, execution_id: &str, event: EventKind, message: &str) {
        self.framed
            .send(WorkerMessage {
                payload: Some(worker_message::Payload::StatusUpdate(StatusUpdate {
                    execution_id: execution_id.to_string(),
                    event: event as i32,
                    message: message.to_string(),
                    metadata: HashMap::new(),
                })),
            })
            .await
            .unwrap();
    }

    pub async fn send_result(
        &mut self,
        execution_id: &str,
        success: bool,
        exit_code: i32,
        details: &str,
    ) {
        self.framed
            .send(WorkerMessage {
                payload: Some(worker_message::Payload::ExecutionResult(ExecutionResult {
                    execution_id: execution_id.to_string(),
                    success,
                    exit_code,
                    details: details.to_string(),
                })),
            })
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, message: WorkerMessage) {
        self.framed.send(message).await.unwrap();
    }

    /// True once the orchestrator closed this stream; pending frames are
    /// drained on the way.
    pub async fn closed(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match tokio::time::timeout(remaining, self.framed.next()).await {
                Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }
}
