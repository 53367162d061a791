use super::PoolId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Resource dimensions a quota constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    CpuCores,
    MemoryBytes,
    ConcurrentJobs,
    DiskBytes,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::CpuCores => "cpu_cores",
            ResourceKind::MemoryBytes => "memory_bytes",
            ResourceKind::ConcurrentJobs => "concurrent_jobs",
            ResourceKind::DiskBytes => "disk_bytes",
        };
        write!(f, "{s}")
    }
}

/// Current consumption counters of one pool. Also used as the allocation
/// delta of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceUsage {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub concurrent_jobs: u32,
    pub disk_bytes: u64,
}

impl ResourceUsage {
    pub fn is_zero(&self) -> bool {
        self.cpu_cores == 0.0
            && self.memory_bytes == 0
            && self.concurrent_jobs == 0
            && self.disk_bytes == 0
    }

    /// Monotonic addition.
    pub fn allocate(&self, request: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu_cores: self.cpu_cores + request.cpu_cores,
            memory_bytes: self.memory_bytes + request.memory_bytes,
            concurrent_jobs: self.concurrent_jobs + request.concurrent_jobs,
            disk_bytes: self.disk_bytes + request.disk_bytes,
        }
    }

    /// Never drives a counter below zero.
    pub fn deallocate(&self, request: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu_cores: (self.cpu_cores - request.cpu_cores).max(0.0),
            memory_bytes: self.memory_bytes.saturating_sub(request.memory_bytes),
            concurrent_jobs: self.concurrent_jobs.saturating_sub(request.concurrent_jobs),
            disk_bytes: self.disk_bytes.saturating_sub(request.disk_bytes),
        }
    }
}

/// Per-pool resource ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_cpu_cores: f64,
    pub max_memory_bytes: u64,
    pub max_concurrent_jobs: u32,
    pub max_disk_bytes: u64,
}

impl QuotaLimits {
    pub fn unlimited() -> Self {
        Self {
            max_cpu_cores: f64::INFINITY,
            max_memory_bytes: u64::MAX,
            max_concurrent_jobs: u32::MAX,
            max_disk_bytes: u64::MAX,
        }
    }
}

/// `usage + request <= limits` is the sole admission predicate.
pub fn can_allocate(usage: &ResourceUsage, request: &ResourceUsage, limits: &QuotaLimits) -> bool {
    let next = usage.allocate(request);
    next.cpu_cores <= limits.max_cpu_cores
        && next.memory_bytes <= limits.max_memory_bytes
        && next.concurrent_jobs <= limits.max_concurrent_jobs
        && next.disk_bytes <= limits.max_disk_bytes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ViolationSeverity {
    /// Low < 10%, Medium 10-20%, High 20-50%, Critical > 50% excess.
    pub fn classify(excess_percent: f64) -> Self {
        if excess_percent < 10.0 {
            ViolationSeverity::Low
        } else if excess_percent < 20.0 {
            ViolationSeverity::Medium
        } else if excess_percent <= 50.0 {
            ViolationSeverity::High
        } else {
            ViolationSeverity::Critical
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaViolation {
    pub resource: ResourceKind,
    pub limit: f64,
    pub current: f64,
    pub excess_percent: f64,
    pub severity: ViolationSeverity,
}

impl QuotaViolation {
    fn new(resource: ResourceKind, limit: f64, current: f64) -> Self {
        let excess_percent = if limit > 0.0 {
            (current - limit) / limit * 100.0
        } else {
            100.0
        };
        Self {
            resource,
            limit,
            current,
            excess_percent,
            severity: ViolationSeverity::classify(excess_percent),
        }
    }
}

/// Dimensions where `usage` exceeds `limits`.
pub fn violations(usage: &ResourceUsage, limits: &QuotaLimits) -> Vec<QuotaViolation> {
    let mut violations = Vec::new();
    if usage.cpu_cores > limits.max_cpu_cores {
        violations.push(QuotaViolation::new(
            ResourceKind::CpuCores,
            limits.max_cpu_cores,
            usage.cpu_cores,
        ));
    }
    if usage.memory_bytes > limits.max_memory_bytes {
        violations.push(QuotaViolation::new(
            ResourceKind::MemoryBytes,
            limits.max_memory_bytes as f64,
            usage.memory_bytes as f64,
        ));
    }
    if usage.concurrent_jobs > limits.max_concurrent_jobs {
        violations.push(QuotaViolation::new(
            ResourceKind::ConcurrentJobs,
            limits.max_concurrent_jobs as f64,
            usage.concurrent_jobs as f64,
        ));
    }
    if usage.disk_bytes > limits.max_disk_bytes {
        violations.push(QuotaViolation::new(
            ResourceKind::DiskBytes,
            limits.max_disk_bytes as f64,
            usage.disk_bytes as f64,
        ));
    }
    violations
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaAlert {
    pub resource: ResourceKind,
    /// Usage ratio that tripped the alert, e.g. 0.8.
    pub threshold: f64,
    pub current_ratio: f64,
}

/// Usage ratios that crossed any of the configured thresholds. Alerts carry
/// no enforcement weight; they only trigger notifications.
pub fn alerts(usage: &ResourceUsage, limits: &QuotaLimits, thresholds: &[f64]) -> Vec<QuotaAlert> {
    let ratios = [
        (ResourceKind::CpuCores, ratio(usage.cpu_cores, limits.max_cpu_cores)),
        (
            ResourceKind::MemoryBytes,
            ratio(usage.memory_bytes as f64, limits.max_memory_bytes as f64),
        ),
        (
            ResourceKind::ConcurrentJobs,
            ratio(usage.concurrent_jobs as f64, limits.max_concurrent_jobs as f64),
        ),
        (
            ResourceKind::DiskBytes,
            ratio(usage.disk_bytes as f64, limits.max_disk_bytes as f64),
        ),
    ];
    let mut alerts = Vec::new();
    for (resource, current_ratio) in ratios {
        // report the highest threshold crossed per dimension
        if let Some(threshold) = thresholds
            .iter()
            .copied()
            .filter(|threshold| current_ratio >= *threshold)
            .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))))
        {
            alerts.push(QuotaAlert {
                resource,
                threshold,
                current_ratio,
            });
        }
    }
    alerts
}

fn ratio(current: f64, limit: f64) -> f64 {
    if limit <= 0.0 || limit.is_infinite() {
        0.0
    } else {
        current / limit
    }
}

/// What enforcement decided for a single allocation request. Callers act on
/// the action; they never re-derive the decision from the raw numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationAction {
    Blocked,
    AllowedWithWarning,
    Queued,
    ScaledUp,
    NotificationSent,
    NoAction,
}

/// Per-pool quota: hard limits, optional soft limits, alert thresholds and
/// the running usage counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolQuota {
    pub pool_id: PoolId,
    pub limits: QuotaLimits,
    /// Crossing these warns (or queues, per configuration) without blocking.
    pub soft_limits: Option<QuotaLimits>,
    pub alert_thresholds: Vec<f64>,
    pub usage: ResourceUsage,
    pub updated_at: DateTime<Utc>,
}

impl PoolQuota {
    pub fn new(pool_id: PoolId, limits: QuotaLimits) -> Self {
        Self {
            pool_id,
            limits,
            soft_limits: None,
            alert_thresholds: vec![0.8, 0.9],
            usage: ResourceUsage::default(),
            updated_at: Utc::now(),
        }
    }

    pub fn unlimited(pool_id: PoolId) -> Self {
        Self::new(pool_id, QuotaLimits::unlimited())
    }
}
