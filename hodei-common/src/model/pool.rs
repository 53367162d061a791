use super::{InvalidTransition, PoolId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Backend serving a pool's compute. One provider adapter per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    ContainerDaemon,
    ClusterApi,
    CloudVendors,
    Local,
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderKind::ContainerDaemon => "container_daemon",
            ProviderKind::ClusterApi => "cluster_api",
            ProviderKind::CloudVendors => "cloud_vendors",
            ProviderKind::Local => "local",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container_daemon" => Ok(ProviderKind::ContainerDaemon),
            "cluster_api" => Ok(ProviderKind::ClusterApi),
            "cloud_vendors" => Ok(ProviderKind::CloudVendors),
            "local" => Ok(ProviderKind::Local),
            _ => Err(format!("Invalid provider kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Provisioning,
    Active,
    Draining,
    Maintenance,
    Error,
}

impl PoolStatus {
    pub fn can_transition_to(&self, target: PoolStatus) -> bool {
        use PoolStatus::*;
        matches!(
            (self, target),
            (Provisioning, Active | Error)
                | (Active, Draining | Maintenance | Error)
                | (Draining, Active | Maintenance)
                | (Maintenance, Active)
                | (Error, Active)
        )
    }
}

impl Display for PoolStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PoolStatus::Provisioning => "provisioning",
            PoolStatus::Active => "active",
            PoolStatus::Draining => "draining",
            PoolStatus::Maintenance => "maintenance",
            PoolStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Scaling bounds, placement selectors and cost caps for one pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolPolicies {
    pub min_workers: u32,
    pub max_workers: u32,
    /// Concurrent job ceiling; `None` leaves the pool unbounded.
    pub max_jobs: Option<u32>,
    pub placement_selectors: HashMap<String, String>,
    pub cost_cap_per_hour: Option<f64>,
}

impl Default for PoolPolicies {
    fn default() -> Self {
        Self {
            min_workers: 0,
            max_workers: 10,
            max_jobs: None,
            placement_selectors: HashMap::new(),
            cost_cap_per_hour: None,
        }
    }
}

/// Point-in-time view of what a pool can hold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct PoolCapacity {
    pub total_cpu_cores: f64,
    pub total_memory_bytes: u64,
    pub total_disk_bytes: u64,
    pub total_workers: u32,
}

/// A named set of compute resources served by one provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub id: PoolId,
    pub name: String,
    pub kind: ProviderKind,
    /// Provider-specific settings, interpreted only by the matching adapter.
    pub provider_config: serde_json::Value,
    pub policies: PoolPolicies,
    pub status: PoolStatus,
    pub capacity: PoolCapacity,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourcePool {
    pub fn new(name: impl Into<String>, kind: ProviderKind, capacity: PoolCapacity) -> Self {
        let now = Utc::now();
        Self {
            id: PoolId::generate(),
            name: name.into(),
            kind,
            provider_config: serde_json::Value::Null,
            policies: PoolPolicies::default(),
            status: PoolStatus::Provisioning,
            capacity,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn update_status(&mut self, target: PoolStatus) -> Result<(), InvalidTransition> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_transition_to(target) {
            return Err(InvalidTransition::new("pool", self.status, target));
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn can_accept_jobs(&self) -> bool {
        self.status == PoolStatus::Active
    }
}

/// Best-effort utilization snapshot of one pool. Staleness within the cache
/// TTL is acceptable; the scheduler treats these numbers as advisory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolUtilization {
    pub total_cpu_cores: f64,
    pub used_cpu_cores: f64,
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub total_disk_bytes: u64,
    pub used_disk_bytes: u64,
    pub running_jobs: u32,
    pub queued_jobs: u32,
    pub timestamp: DateTime<Utc>,
}

impl PoolUtilization {
    pub fn idle(capacity: &PoolCapacity) -> Self {
        Self {
            total_cpu_cores: capacity.total_cpu_cores,
            used_cpu_cores: 0.0,
            total_memory_bytes: capacity.total_memory_bytes,
            used_memory_bytes: 0,
            total_disk_bytes: capacity.total_disk_bytes,
            used_disk_bytes: 0,
            running_jobs: 0,
            queued_jobs: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn cpu_utilization(&self) -> f64 {
        if self.total_cpu_cores <= 0.0 {
            0.0
        } else {
            self.used_cpu_cores / self.total_cpu_cores
        }
    }

    pub fn memory_utilization(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            0.0
        } else {
            self.used_memory_bytes as f64 / self.total_memory_bytes as f64
        }
    }

    pub fn available_cpu_cores(&self) -> f64 {
        (self.total_cpu_cores - self.used_cpu_cores).max(0.0)
    }

    pub fn available_memory_bytes(&self) -> u64 {
        self.total_memory_bytes.saturating_sub(self.used_memory_bytes)
    }
}
