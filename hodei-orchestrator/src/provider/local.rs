use crate::provider::{
    scaling_plan, Instance, InstanceProvider, InstanceSpec, InstanceStatus, InstanceType,
    ProvisioningError, ScalingResult, MANAGED_LABEL, POOL_LABEL,
};
use async_trait::async_trait;
use chrono::Utc;
use hodei_common::model::{InstanceId, PoolId, ProviderKind};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Bookkeeping-only adapter for pools whose workers are started out of band
/// and pooled across executions. Provisioning just records a logical
/// instance; nothing is launched.
#[derive(Default)]
pub struct LocalProvider {
    instances: RwLock<HashMap<InstanceId, Instance>>,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn provision(
        &self,
        pool_id: &PoolId,
        spec: &InstanceSpec,
    ) -> Result<Instance, ProvisioningError> {
        let mut labels = spec.labels.clone();
        labels.insert(POOL_LABEL.to_string(), pool_id.to_string());
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        let instance = Instance {
            id: InstanceId(uuid::Uuid::new_v4().to_string()),
            pool_id: pool_id.clone(),
            status: InstanceStatus::Running,
            created_at: Utc::now(),
            labels,
        };
        self.instances
            .write()
            .unwrap()
            .insert(instance.id.clone(), instance.clone());
        debug!(instance_id = %instance.id, pool_id = %pool_id, "local instance recorded");
        Ok(instance)
    }

    async fn terminate(&self, instance_id: &InstanceId) -> Result<(), ProvisioningError> {
        self.instances
            .write()
            .unwrap()
            .remove(instance_id)
            .map(|_| ())
            .ok_or_else(|| ProvisioningError::NotFound(instance_id.to_string()))
    }

    async fn status(&self, instance_id: &InstanceId) -> Result<InstanceStatus, ProvisioningError> {
        self.instances
            .read()
            .unwrap()
            .get(instance_id)
            .map(|instance| instance.status)
            .ok_or_else(|| ProvisioningError::NotFound(instance_id.to_string()))
    }

    async fn list(&self, pool_id: &PoolId) -> Result<Vec<Instance>, ProvisioningError> {
        let mut instances: Vec<Instance> = self
            .instances
            .read()
            .unwrap()
            .values()
            .filter(|instance| &instance.pool_id == pool_id)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    async fn scale(
        &self,
        pool_id: &PoolId,
        target_count: u32,
    ) -> Result<ScalingResult, ProvisioningError> {
        let current = self.list(pool_id).await?;
        let (to_provision, to_terminate) = scaling_plan(current, target_count);

        let mut result = ScalingResult::default();
        for _ in 0..to_provision {
            match self
                .provision(pool_id, &InstanceSpec::new(InstanceType::Small))
                .await
            {
                Ok(instance) => result.provisioned.push(instance.id),
                Err(err) => result.failures.push(err.to_string()),
            }
        }
        for instance_id in to_terminate {
            match self.terminate(&instance_id).await {
                Ok(()) => result.terminated.push(instance_id),
                Err(err) => result.failures.push(err.to_string()),
            }
        }
        Ok(result)
    }

    async fn available_instance_types(
        &self,
        _pool_id: &PoolId,
    ) -> Result<Vec<InstanceType>, ProvisioningError> {
        Ok(InstanceType::STANDARD_TIERS.to_vec())
    }
}
