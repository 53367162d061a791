use crate::config::ClusterApiConfig;
use crate::provider::{
    scaling_plan, Instance, InstanceProvider, InstanceSpec, InstanceStatus, InstanceType,
    ProvisioningError, ScalingResult, MANAGED_LABEL, POOL_LABEL,
};
use async_trait::async_trait;
use chrono::Utc;
use hodei_common::model::{InstanceId, PoolId, ProviderKind};
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::Api;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// One pod per instance against a cluster API server.
pub struct ClusterApiProvider {
    pods: Api<Pod>,
    config: ClusterApiConfig,
}

fn api_error(err: kube::Error, context: &str) -> ProvisioningError {
    match err {
        kube::Error::Api(response) if response.code == 404 => {
            ProvisioningError::NotFound(format!("{context}: {}", response.message))
        }
        kube::Error::Api(response) if response.code == 422 => {
            ProvisioningError::InvalidSpec(format!("{context}: {}", response.message))
        }
        kube::Error::Api(response) if response.code == 403 => {
            ProvisioningError::QuotaExceeded(format!("{context}: {}", response.message))
        }
        other => ProvisioningError::ProvisioningFailed(format!("{context}: {other}")),
    }
}

fn map_phase(pod: &Pod) -> InstanceStatus {
    match pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
    {
        Some("Pending") => InstanceStatus::Starting,
        Some("Running") => InstanceStatus::Running,
        Some("Succeeded") => InstanceStatus::Stopped,
        Some("Failed") => InstanceStatus::Failed,
        _ => InstanceStatus::Unknown,
    }
}

fn to_instance(pod: Pod, pool_id: &PoolId) -> Instance {
    let status = map_phase(&pod);
    let labels: BTreeMap<String, String> = pod.metadata.labels.unwrap_or_default();
    Instance {
        id: InstanceId(pod.metadata.name.unwrap_or_default()),
        pool_id: pool_id.clone(),
        status,
        created_at: pod
            .metadata
            .creation_timestamp
            .map(|timestamp| timestamp.0)
            .unwrap_or_else(Utc::now),
        labels: labels.into_iter().collect(),
    }
}

impl ClusterApiProvider {
    pub fn new(client: kube::Client, config: ClusterApiConfig) -> Self {
        let pods = Api::namespaced(client, &config.namespace);
        Self { pods, config }
    }

    fn build_pod(&self, pool_id: &PoolId, spec: &InstanceSpec) -> Result<Pod, ProvisioningError> {
        let image = if spec.image.is_empty() {
            self.config.default_image.clone()
        } else {
            spec.image.clone()
        };
        if image.is_empty() {
            return Err(ProvisioningError::InvalidSpec("image is required".to_string()));
        }

        let (cpu_cores, memory_bytes) = spec.instance_type.resources();
        let mut labels: BTreeMap<String, String> = spec.labels.clone().into_iter().collect();
        labels.insert(POOL_LABEL.to_string(), pool_id.to_string());
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let mut env: Vec<EnvVar> = self
            .config
            .worker_env
            .iter()
            .chain(spec.env.iter())
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..EnvVar::default()
            })
            .collect();
        env.sort_by(|a, b| a.name.cmp(&b.name));

        let limits = BTreeMap::from([
            (
                "cpu".to_string(),
                Quantity(format!("{}m", (cpu_cores * 1000.0) as u64)),
            ),
            ("memory".to_string(), Quantity(memory_bytes.to_string())),
        ]);

        let name = format!(
            "hodei-worker-{}",
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        );
        Ok(Pod {
            metadata: ObjectMeta {
                name: Some(name),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "worker".to_string(),
                    image: Some(image),
                    command: if spec.command.is_empty() {
                        None
                    } else {
                        Some(spec.command.clone())
                    },
                    env: Some(env),
                    resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
                        limits: Some(limits.clone()),
                        requests: Some(limits),
                        ..Default::default()
                    }),
                    ..Container::default()
                }],
                restart_policy: Some("Never".to_string()),
                ..PodSpec::default()
            }),
            ..Pod::default()
        })
    }
}

#[async_trait]
impl InstanceProvider for ClusterApiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ClusterApi
    }

    async fn provision(
        &self,
        pool_id: &PoolId,
        spec: &InstanceSpec,
    ) -> Result<Instance, ProvisioningError> {
        let pod = self.build_pod(pool_id, spec)?;
        let created = self
            .pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(|err| api_error(err, "create pod"))?;
        info!(pod = ?created.metadata.name, pool_id = %pool_id, "pod provisioned");
        Ok(to_instance(created, pool_id))
    }

    async fn terminate(&self, instance_id: &InstanceId) -> Result<(), ProvisioningError> {
        self.pods
            .delete(instance_id.as_str(), &DeleteParams::default())
            .await
            .map_err(|err| api_error(err, "delete pod"))?;
        debug!(pod = %instance_id, "pod terminated");
        Ok(())
    }

    async fn status(&self, instance_id: &InstanceId) -> Result<InstanceStatus, ProvisioningError> {
        let pod = self
            .pods
            .get(instance_id.as_str())
            .await
            .map_err(|err| api_error(err, "get pod"))?;
        Ok(map_phase(&pod))
    }

    async fn list(&self, pool_id: &PoolId) -> Result<Vec<Instance>, ProvisioningError> {
        let params = ListParams::default().labels(&format!("{POOL_LABEL}={pool_id}"));
        let pods = self
            .pods
            .list(&params)
            .await
            .map_err(|err| api_error(err, "list pods"))?;
        Ok(pods
            .items
            .into_iter()
            .map(|pod| to_instance(pod, pool_id))
            .collect())
    }

    async fn scale(
        &self,
        pool_id: &PoolId,
        target_count: u32,
    ) -> Result<ScalingResult, ProvisioningError> {
        let current = self.list(pool_id).await?;
        let (to_provision, to_terminate) = scaling_plan(current, target_count);

        let mut result = ScalingResult::default();
        let mut spec = InstanceSpec::new(InstanceType::Small);
        spec.env = self.config.worker_env.clone();
        for _ in 0..to_provision {
            match self.provision(pool_id, &spec).await {
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
