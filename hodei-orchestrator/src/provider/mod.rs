pub mod docker;
#[cfg(feature = "kubernetes")]
pub mod kubernetes;
pub mod local;

pub use docker::ContainerDaemonProvider;
#[cfg(feature = "kubernetes")]
pub use kubernetes::ClusterApiProvider;
pub use local::LocalProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hodei_common::model::{InstanceId, PoolId, ProviderKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    #[error("invalid instance spec: {0}")]
    InvalidSpec(String),
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),
    #[error("provider call timed out")]
    Timeout,
    #[error("provider quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("instance not found: {0}")]
    NotFound(String),
}

/// Size tier of a requested instance; the adapter maps tiers onto concrete
/// resource requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceType {
    Small,
    Medium,
    Large,
    XLarge,
    Custom { cpu_cores: f64, memory_bytes: u64 },
}

impl InstanceType {
    pub const STANDARD_TIERS: [InstanceType; 4] = [
        InstanceType::Small,
        InstanceType::Medium,
        InstanceType::Large,
        InstanceType::XLarge,
    ];

    /// (cpu cores, memory bytes) backing the tier.
    pub fn resources(&self) -> (f64, u64) {
        const GIB: u64 = 1024 * 1024 * 1024;
        match self {
            InstanceType::Small => (1.0, 2 * GIB),
            InstanceType::Medium => (2.0, 4 * GIB),
            InstanceType::Large => (4.0, 8 * GIB),
            InstanceType::XLarge => (8.0, 16 * GIB),
            InstanceType::Custom {
                cpu_cores,
                memory_bytes,
            } => (*cpu_cores, *memory_bytes),
        }
    }

    /// Smallest standard tier covering the request, or a custom instance
    /// when even the largest tier is too small.
    pub fn smallest_covering(cpu_cores: f64, memory_bytes: u64) -> InstanceType {
        for tier in InstanceType::STANDARD_TIERS {
            let (tier_cpu, tier_memory) = tier.resources();
            if tier_cpu >= cpu_cores && tier_memory >= memory_bytes {
                return tier;
            }
        }
        InstanceType::Custom {
            cpu_cores,
            memory_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub instance_type: InstanceType,
    /// Empty means the adapter's configured default image.
    pub image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InstanceSpec {
    pub fn new(instance_type: InstanceType) -> Self {
        Self {
            instance_type,
            image: String::new(),
            command: Vec::new(),
            env: HashMap::new(),
            labels: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub pool_id: PoolId,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
}

/// Result of a scaling pass; mixed partial failure keeps the successes and
/// the failure messages apart.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScalingResult {
    pub provisioned: Vec<InstanceId>,
    pub terminated: Vec<InstanceId>,
    pub failures: Vec<String>,
}

/// Label every adapter attaches to instances it manages.
pub const POOL_LABEL: &str = "hodei.pool";
pub const WORKER_LABEL: &str = "hodei.worker";
pub const MANAGED_LABEL: &str = "hodei.managed";

#[async_trait]
pub trait InstanceProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn provision(
        &self,
        pool_id: &PoolId,
        spec: &InstanceSpec,
    ) -> Result<Instance, ProvisioningError>;

    async fn terminate(&self, instance_id: &InstanceId) -> Result<(), ProvisioningError>;

    async fn status(&self, instance_id: &InstanceId) -> Result<InstanceStatus, ProvisioningError>;

    async fn list(&self, pool_id: &PoolId) -> Result<Vec<Instance>, ProvisioningError>;

    async fn scale(
        &self,
        pool_id: &PoolId,
        target_count: u32,
    ) -> Result<ScalingResult, ProvisioningError>;

    async fn available_instance_types(
        &self,
        pool_id: &PoolId,
    ) -> Result<Vec<InstanceType>, ProvisioningError>;
}

/// Three-way scaling diff: how many to provision and which to terminate.
/// Surplus instances are terminated oldest first.
pub fn scaling_plan(mut current: Vec<Instance>, target_count: u32) -> (u32, Vec<InstanceId>) {
    let current_count = current.len() as u32;
    if target_count >= current_count {
        return (target_count - current_count, Vec::new());
    }
    current.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    let surplus = (current_count - target_count) as usize;
    let to_terminate = current
        .into_iter()
        .take(surplus)
        .map(|instance| instance.id)
        .collect();
    (0, to_terminate)
}

/// Wraps an adapter so every call carries a deadline. Cancelling the caller
/// drops the in-flight future; the deadline converts hangs into `Timeout`.
pub struct DeadlineInstanceProvider {
    inner: Arc<dyn InstanceProvider>,
    provision_timeout: Duration,
    terminate_timeout: Duration,
}

impl DeadlineInstanceProvider {
    pub fn new(
        inner: Arc<dyn InstanceProvider>,
        provision_timeout: Duration,
        terminate_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            provision_timeout,
            terminate_timeout,
        }
    }

    async fn with_deadline<T>(
        deadline: Duration,
        call: impl Future<Output = Result<T, ProvisioningError>>,
    ) -> Result<T, ProvisioningError> {
        tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| ProvisioningError::Timeout)?
    }
}

#[async_trait]
impl InstanceProvider for DeadlineInstanceProvider {
    fn kind(&self) -> ProviderKind {
        self.inner.kind()
    }

    async fn provision(
        &self,
        pool_id: &PoolId,
        spec: &InstanceSpec,
    ) -> Result<Instance, ProvisioningError> {
        Self::with_deadline(self.provision_timeout, self.inner.provision(pool_id, spec)).await
    }

    async fn terminate(&self, instance_id: &InstanceId) -> Result<(), ProvisioningError> {
        Self::with_deadline(self.terminate_timeout, self.inner.terminate(instance_id)).await
    }

    async fn status(&self, instance_id: &InstanceId) -> Result<InstanceStatus, ProvisioningError> {
        Self::with_deadline(self.terminate_timeout, self.inner.status(instance_id)).await
    }

    async fn list(&self, pool_id: &PoolId) -> Result<Vec<Instance>, ProvisioningError> {
        Self::with_deadline(self.provision_timeout, self.inner.list(pool_id)).await
    }

    async fn scale(
        &self,
        pool_id: &PoolId,
        target_count: u32,
    ) -> Result<ScalingResult, ProvisioningError> {
        // a scaling pass makes several provider calls; budget accordingly
        let budget = self.provision_timeout * target_count.max(1);
        Self::with_deadline(budget, self.inner.scale(pool_id, target_count)).await
    }

    async fn available_instance_types(
        &self,
        pool_id: &PoolId,
    ) -> Result<Vec<InstanceType>, ProvisioningError> {
        Self::with_deadline(
            self.terminate_timeout,
            self.inner.available_instance_types(pool_id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    fn instance(id: &str, age_seconds: i64) -> Instance {
        Instance {
            id: InstanceId(id.to_string()),
            pool_id: PoolId("p1".to_string()),
            status: InstanceStatus::Running,
            created_at: Utc::now() - chrono::Duration::seconds(age_seconds),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn scale_up_provisions_the_difference() {
        let (to_provision, to_terminate) = scaling_plan(vec![instance("a", 10)], 3);
        assert_eq!(to_provision, 2);
        assert!(to_terminate.is_empty());
    }

    #[test]
    fn scale_down_terminates_the_oldest_surplus() {
        let current = vec![instance("young", 10), instance("old", 100), instance("mid", 50)];
        let (to_provision, to_terminate) = scaling_plan(current, 1);
        assert_eq!(to_provision, 0);
        assert_eq!(
            to_terminate,
            vec![InstanceId("old".to_string()), InstanceId("mid".to_string())]
        );
    }

    #[test]
    fn instance_tiers_cover_requests_tightly() {
        assert_eq!(
            InstanceType::smallest_covering(1.5, 1024),
            InstanceType::Medium
        );
        assert_eq!(
            InstanceType::smallest_covering(0.5, 1024),
            InstanceType::Small
        );
        let huge = InstanceType::smallest_covering(64.0, 1024);
        assert!(matches!(huge, InstanceType::Custom { .. }));
    }
}
