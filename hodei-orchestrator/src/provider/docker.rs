use crate::config::ContainerDaemonConfig;
use crate::provider::{
    scaling_plan, Instance, InstanceProvider, InstanceSpec, InstanceStatus, InstanceType,
    ProvisioningError, ScalingResult, MANAGED_LABEL, POOL_LABEL,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hodei_common::config::RetryConfig;
use hodei_common::model::{InstanceId, PoolId, ProviderKind};
use hodei_common::retries::with_retries;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// One short-lived container per execution, driven through the container
/// daemon's HTTP API.
pub struct ContainerDaemonProvider {
    http: reqwest::Client,
    config: ContainerDaemonConfig,
    retries: RetryConfig,
}

#[derive(Deserialize)]
struct CreateContainerResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Created")]
    created: i64,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

#[derive(Deserialize)]
struct InspectContainerResponse {
    #[serde(rename = "State")]
    state: ContainerState,
}

#[derive(Deserialize)]
struct ContainerState {
    #[serde(rename = "Status")]
    status: String,
}

fn map_state(state: &str) -> InstanceStatus {
    match state {
        "created" | "restarting" => InstanceStatus::Starting,
        "running" | "paused" => InstanceStatus::Running,
        "removing" => InstanceStatus::Stopping,
        "exited" => InstanceStatus::Stopped,
        "dead" => InstanceStatus::Failed,
        _ => InstanceStatus::Unknown,
    }
}

fn transport_error(err: reqwest::Error) -> ProvisioningError {
    ProvisioningError::ProvisioningFailed(format!("container daemon unreachable: {err}"))
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

impl ContainerDaemonProvider {
    pub fn new(config: ContainerDaemonConfig, retries: RetryConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            retries,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.endpoint.trim_end_matches('/'))
    }

    async fn api_error(response: reqwest::Response, context: &str) -> ProvisioningError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            400 => ProvisioningError::InvalidSpec(format!("{context}: {body}")),
            404 => ProvisioningError::NotFound(format!("{context}: {body}")),
            _ => ProvisioningError::ProvisioningFailed(format!("{context}: {status} {body}")),
        }
    }

    fn default_spec(&self) -> InstanceSpec {
        let mut spec = InstanceSpec::new(InstanceType::Small);
        spec.env = self.config.worker_env.clone();
        spec
    }
}

#[async_trait]
impl InstanceProvider for ContainerDaemonProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ContainerDaemon
    }

    async fn provision(
        &self,
        pool_id: &PoolId,
        spec: &InstanceSpec,
    ) -> Result<Instance, ProvisioningError> {
        let image = if spec.image.is_empty() {
            self.config.default_image.clone()
        } else {
            spec.image.clone()
        };
        if image.is_empty() {
            return Err(ProvisioningError::InvalidSpec("image is required".to_string()));
        }

        let (cpu_cores, memory_bytes) = spec.instance_type.resources();
        let mut labels = spec.labels.clone();
        labels.insert(POOL_LABEL.to_string(), pool_id.to_string());
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let mut env: Vec<String> = self
            .config
            .worker_env
            .iter()
            .chain(spec.env.iter())
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        env.sort();

        let mut host_config = serde_json::json!({
            "NanoCpus": (cpu_cores * 1_000_000_000.0) as i64,
            "Memory": memory_bytes as i64,
        });
        if let Some(network) = &self.config.network {
            host_config["NetworkMode"] = serde_json::Value::String(network.clone());
        }
        let mut body = serde_json::json!({
            "Image": image,
            "Env": env,
            "Labels": &labels,
            "HostConfig": host_config,
        });
        if !spec.command.is_empty() {
            body["Cmd"] = serde_json::json!(spec.command);
        }

        let name = format!("hodei-worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let response = self
            .http
            .post(self.url("containers/create"))
            .query(&[("name", name.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(Self::api_error(response, "create container").await);
        }
        let created: CreateContainerResponse =
            response.json().await.map_err(transport_error)?;

        let response = self
            .http
            .post(self.url(&format!("containers/{}/start", created.id)))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            let error = Self::api_error(response, "start container").await;
            // leave no half-started container behind
            let _ = self.terminate(&InstanceId(created.id.clone())).await;
            return Err(error);
        }

        info!(container = %created.id, pool_id = %pool_id, "container provisioned");
        Ok(Instance {
            id: InstanceId(created.id),
            pool_id: pool_id.clone(),
            status: InstanceStatus::Starting,
            created_at: Utc::now(),
            labels,
        })
    }

    async fn terminate(&self, instance_id: &InstanceId) -> Result<(), ProvisioningError> {
        let response = self
            .http
            .post(self.url(&format!("containers/{instance_id}/stop")))
            .query(&[("t", "10")])
            .send()
            .await
            .map_err(transport_error)?;
        // 304 means the container was already stopped
        if !response.status().is_success() && response.status().as_u16() != 304 {
            return Err(Self::api_error(response, "stop container").await);
        }

        let response = self
            .http
            .delete(self.url(&format!("containers/{instance_id}")))
            .query(&[("force", "true")])
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(Self::api_error(response, "remove container").await);
        }
        debug!(container = %instance_id, "container terminated");
        Ok(())
    }

    async fn status(&self, instance_id: &InstanceId) -> Result<InstanceStatus, ProvisioningError> {
        let client = self.http.clone();
        let url = self.url(&format!("containers/{instance_id}/json"));
        let response = with_retries(
            "inspect container",
            &self.retries,
            move || {
                let client = client.clone();
                let url = url.clone();
                async move { client.get(url).send().await }
            },
            is_transient,
        )
        .await
        .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(Self::api_error(response, "inspect container").await);
        }
        let inspected: InspectContainerResponse =
            response.json().await.map_err(transport_error)?;
        Ok(map_state(&inspected.state.status))
    }

    async fn list(&self, pool_id: &PoolId) -> Result<Vec<Instance>, ProvisioningError> {
        let filters =
            serde_json::json!({ "label": [format!("{POOL_LABEL}={pool_id}")] }).to_string();
        let client = self.http.clone();
        let url = self.url("containers/json");
        let response = with_retries(
            "list containers",
            &self.retries,
            move || {
                let client = client.clone();
                let url = url.clone();
                let filters = filters.clone();
                async move {
                    client
                        .get(url)
                        .query(&[("all", "true"), ("filters", filters.as_str())])
                        .send()
                        .await
                }
            },
            is_transient,
        )
        .await
        .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(Self::api_error(response, "list containers").await);
        }
        let summaries: Vec<ContainerSummary> = response.json().await.map_err(transport_error)?;
        Ok(summaries
            .into_iter()
            .map(|summary| Instance {
                id: InstanceId(summary.id),
                pool_id: pool_id.clone(),
                status: map_state(&summary.state),
                created_at: DateTime::from_timestamp(summary.created, 0)
                    .unwrap_or_else(Utc::now),
                labels: summary.labels,
            })
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
        let spec = self.default_spec();
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
