use hodei_common::config::{ConfigLoader, RetryConfig};
use hodei_common::tracing::TracingConfig;
use hodei_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub tracing: TracingConfig,
    pub listener: ListenerConfig,
    pub infrastructure: InfrastructureConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub execution: ExecutionConfig,
    pub quota: QuotaConfig,
    pub logs: LogsConfig,
    pub provider: ProviderConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("hodei-orchestrator"),
            listener: ListenerConfig::default(),
            infrastructure: InfrastructureConfig::default(),
            worker: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
            execution: ExecutionConfig::default(),
            quota: QuotaConfig::default(),
            logs: LogsConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

impl SafeDisplay for OrchestratorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "listener:");
        let _ = writeln!(&mut result, "{}", self.listener.to_safe_string_indented());
        let _ = writeln!(&mut result, "infrastructure:");
        let _ = writeln!(&mut result, "{}", self.infrastructure.to_safe_string_indented());
        let _ = writeln!(&mut result, "worker:");
        let _ = writeln!(&mut result, "{}", self.worker.to_safe_string_indented());
        let _ = writeln!(&mut result, "scheduler:");
        let _ = writeln!(&mut result, "{}", self.scheduler.to_safe_string_indented());
        let _ = writeln!(&mut result, "execution:");
        let _ = writeln!(&mut result, "{}", self.execution.to_safe_string_indented());
        let _ = writeln!(&mut result, "quota:");
        let _ = writeln!(&mut result, "{}", self.quota.to_safe_string_indented());
        let _ = writeln!(&mut result, "logs:");
        let _ = writeln!(&mut result, "{}", self.logs.to_safe_string_indented());
        let _ = writeln!(&mut result, "provider:");
        let _ = writeln!(&mut result, "{}", self.provider.to_safe_string_indented());
        result
    }
}

/// Bind address of the worker stream listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
}

impl ListenerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9655,
        }
    }
}

impl SafeDisplay for ListenerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "host: {}", self.host);
        let _ = writeln!(&mut result, "port: {}", self.port);
        result
    }
}

/// Selects the provider adapter the orchestrator provisions workers with.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InfrastructureConfig {
    ContainerDaemon(ContainerDaemonConfig),
    ClusterApi(ClusterApiConfig),
    Local(LocalInfrastructureConfig),
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        InfrastructureConfig::Local(LocalInfrastructureConfig::default())
    }
}

impl SafeDisplay for InfrastructureConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        match self {
            InfrastructureConfig::ContainerDaemon(inner) => {
                let _ = writeln!(&mut result, "container daemon:");
                let _ = writeln!(&mut result, "{}", inner.to_safe_string_indented());
            }
            InfrastructureConfig::ClusterApi(inner) => {
                let _ = writeln!(&mut result, "cluster api:");
                let _ = writeln!(&mut result, "{}", inner.to_safe_string_indented());
            }
            InfrastructureConfig::Local(_) => {
                let _ = writeln!(&mut result, "local");
            }
        }
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerDaemonConfig {
    /// HTTP endpoint of the container daemon API.
    pub endpoint: String,
    pub default_image: String,
    pub network: Option<String>,
    /// Extra environment passed to every worker container, e.g. the
    /// orchestrator address the worker should dial back to.
    pub worker_env: std::collections::HashMap<String, String>,
}

impl Default for ContainerDaemonConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:2375".to_string(),
            default_image: "hodei/worker:latest".to_string(),
            network: None,
            worker_env: std::collections::HashMap::new(),
        }
    }
}

impl SafeDisplay for ContainerDaemonConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "endpoint: {}", self.endpoint);
        let _ = writeln!(&mut result, "default image: {}", self.default_image);
        let _ = writeln!(&mut result, "network: {:?}", self.network);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterApiConfig {
    pub namespace: String,
    pub default_image: String,
    pub worker_env: std::collections::HashMap<String, String>,
}

impl Default for ClusterApiConfig {
    fn default() -> Self {
        Self {
            namespace: "hodei".to_string(),
            default_image: "hodei/worker:latest".to_string(),
            worker_env: std::collections::HashMap::new(),
        }
    }
}

impl SafeDisplay for ClusterApiConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "namespace: {}", self.namespace);
        let _ = writeln!(&mut result, "default image: {}", self.default_image);
        result
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalInfrastructureConfig {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Heartbeat age past which a worker no longer counts as healthy.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Interval workers are told to heartbeat at.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Silence on a live session after which the worker is considered lost
    /// and its execution reclaimed.
    #[serde(with = "humantime_serde")]
    pub lost_timeout: Duration,
    /// How long a freshly provisioned worker gets to dial back and register.
    #[serde(with = "humantime_serde")]
    pub registration_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            lost_timeout: Duration::from_secs(90),
            registration_timeout: Duration::from_secs(60),
        }
    }
}

impl SafeDisplay for WorkerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "heartbeat timeout: {:?}", self.heartbeat_timeout);
        let _ = writeln!(&mut result, "heartbeat interval: {:?}", self.heartbeat_interval);
        let _ = writeln!(&mut result, "lost timeout: {:?}", self.lost_timeout);
        let _ = writeln!(&mut result, "registration timeout: {:?}", self.registration_timeout);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub default_strategy: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_strategy: "leastloaded".to_string(),
        }
    }
}

impl SafeDisplay for SchedulerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "default strategy: {}", self.default_strategy);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// How long a cancelled worker gets to finish cleanly before teardown.
    #[serde(with = "humantime_serde")]
    pub cancel_grace: Duration,
    /// Delay before a failed job is resubmitted under its retry budget.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Terminal execution contexts retained for inspection.
    pub max_retained_contexts: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            max_retained_contexts: 256,
        }
    }
}

impl SafeDisplay for ExecutionConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "cancel grace: {:?}", self.cancel_grace);
        let _ = writeln!(&mut result, "retry delay: {:?}", self.retry_delay);
        let _ = writeln!(&mut result, "max retained contexts: {}", self.max_retained_contexts);
        result
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftLimitAction {
    AllowWithWarning,
    Queue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub soft_limit_action: SoftLimitAction,
    /// Usage ratios that trigger notifications without blocking.
    pub alert_thresholds: Vec<f64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            soft_limit_action: SoftLimitAction::AllowWithWarning,
            alert_thresholds: vec![0.8, 0.9],
        }
    }
}

impl SafeDisplay for QuotaConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "soft limit action: {:?}", self.soft_limit_action);
        let _ = writeln!(&mut result, "alert thresholds: {:?}", self.alert_thresholds);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogsConfig {
    /// In-memory log cap per execution; older chunks are evicted beyond it.
    pub per_execution_buffer_bytes: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            per_execution_buffer_bytes: 10_000_000,
        }
    }
}

impl SafeDisplay for LogsConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "per-execution buffer bytes: {}",
            self.per_execution_buffer_bytes
        );
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(with = "humantime_serde")]
    pub provision_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub terminate_timeout: Duration,
    pub retries: RetryConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provision_timeout: Duration::from_secs(60),
            terminate_timeout: Duration::from_secs(30),
            retries: RetryConfig::default(),
        }
    }
}

impl SafeDisplay for ProviderConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "provision timeout: {:?}", self.provision_timeout);
        let _ = writeln!(&mut result, "terminate timeout: {:?}", self.terminate_timeout);
        let _ = writeln!(&mut result, "retries:");
        let _ = writeln!(&mut result, "{}", self.retries.to_safe_string_indented());
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<OrchestratorConfig> {
    ConfigLoader::new(&PathBuf::from("config/hodei-orchestrator.toml"))
}
