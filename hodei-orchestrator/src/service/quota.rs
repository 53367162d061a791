use crate::config::SoftLimitAction;
use hodei_common::model::quota::{alerts, can_allocate, violations};
use hodei_common::model::{
    PoolId, PoolQuota, QuotaAlert, QuotaLimits, QuotaViolation, ResourceUsage, ViolationAction,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// What enforcement decided for one allocation. Admission callers act on the
/// action and never re-derive the decision from the raw counters.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaCheckOutcome {
    pub action: ViolationAction,
    pub violations: Vec<QuotaViolation>,
    pub alerts: Vec<QuotaAlert>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QuotaError {
    #[error("quota exceeded for pool {pool_id}")]
    Exceeded {
        pool_id: PoolId,
        violations: Vec<QuotaViolation>,
    },
}

/// Owns every pool's quota. The per-pool mutex is held across the
/// check-and-apply pair; admission is never decomposed.
pub struct QuotaService {
    soft_limit_action: SoftLimitAction,
    alert_thresholds: Vec<f64>,
    quotas: std::sync::Mutex<HashMap<PoolId, Arc<tokio::sync::Mutex<PoolQuota>>>>,
}

impl QuotaService {
    pub fn new(soft_limit_action: SoftLimitAction, alert_thresholds: Vec<f64>) -> Self {
        Self {
            soft_limit_action,
            alert_thresholds,
            quotas: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Pools without explicit limits run unlimited but still track usage, so
    /// allocation bookkeeping stays symmetric.
    fn handle(&self, pool_id: &PoolId) -> Arc<tokio::sync::Mutex<PoolQuota>> {
        let mut quotas = self.quotas.lock().unwrap();
        quotas
            .entry(pool_id.clone())
            .or_insert_with(|| {
                let mut quota = PoolQuota::unlimited(pool_id.clone());
                quota.alert_thresholds = self.alert_thresholds.clone();
                Arc::new(tokio::sync::Mutex::new(quota))
            })
            .clone()
    }

    pub async fn set_limits(
        &self,
        pool_id: &PoolId,
        limits: QuotaLimits,
        soft_limits: Option<QuotaLimits>,
    ) {
        let handle = self.handle(pool_id);
        let mut quota = handle.lock().await;
        quota.limits = limits;
        quota.soft_limits = soft_limits;
    }

    pub async fn try_allocate(
        &self,
        pool_id: &PoolId,
        request: &ResourceUsage,
    ) -> Result<QuotaCheckOutcome, QuotaError> {
        let handle = self.handle(pool_id);
        let mut quota = handle.lock().await;

        if !can_allocate(&quota.usage, request, &quota.limits) {
            let attempted = quota.usage.allocate(request);
            let violations = violations(&attempted, &quota.limits);
            warn!(pool_id = %pool_id, ?violations, "allocation blocked by pool quota");
            return Err(QuotaError::Exceeded {
                pool_id: pool_id.clone(),
                violations,
            });
        }

        let mut action = ViolationAction::NoAction;
        let mut soft_violations = Vec::new();
        if let Some(soft_limits) = &quota.soft_limits {
            if !can_allocate(&quota.usage, request, soft_limits) {
                let attempted = quota.usage.allocate(request);
                soft_violations = violations(&attempted, soft_limits);
                action = match self.soft_limit_action {
                    SoftLimitAction::AllowWithWarning => ViolationAction::AllowedWithWarning,
                    SoftLimitAction::Queue => ViolationAction::Queued,
                };
            }
        }

        if action == ViolationAction::Queued {
            // nothing applied; the caller requeues the work
            return Ok(QuotaCheckOutcome {
                action,
                violations: soft_violations,
                alerts: Vec::new(),
            });
        }

        quota.usage = quota.usage.allocate(request);
        quota.updated_at = chrono::Utc::now();

        let alerts = alerts(&quota.usage, &quota.limits, &quota.alert_thresholds);
        if !alerts.is_empty() {
            warn!(pool_id = %pool_id, ?alerts, "pool quota thresholds crossed");
        }
        if action == ViolationAction::AllowedWithWarning {
            warn!(pool_id = %pool_id, ?soft_violations, "allocation over the soft limit");
        } else {
            debug!(pool_id = %pool_id, usage = ?quota.usage, "quota allocated");
        }

        Ok(QuotaCheckOutcome {
            action,
            violations: soft_violations,
            alerts,
        })
    }

    pub async fn deallocate(&self, pool_id: &PoolId, request: &ResourceUsage) {
        let handle = self.handle(pool_id);
        let mut quota = handle.lock().await;
        quota.usage = quota.usage.deallocate(request);
        quota.updated_at = chrono::Utc::now();
        debug!(pool_id = %pool_id, usage = ?quota.usage, "quota released");
    }

    pub async fn usage(&self, pool_id: &PoolId) -> ResourceUsage {
        let handle = self.handle(pool_id);
        let quota = handle.lock().await;
        quota.usage
    }

    pub async fn violations(&self, pool_id: &PoolId) -> Vec<QuotaViolation> {
        let handle = self.handle(pool_id);
        let quota = handle.lock().await;
        violations(&quota.usage, &quota.limits)
    }

    pub async fn alerts(&self, pool_id: &PoolId) -> Vec<QuotaAlert> {
        let handle = self.handle(pool_id);
        let quota = handle.lock().await;
        alerts(&quota.usage, &quota.limits, &quota.alert_thresholds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hodei_common::model::ViolationSeverity;
    use test_r::test;

    fn request() -> ResourceUsage {
        ResourceUsage {
            cpu_cores: 2.0,
            memory_bytes: 2_000,
            concurrent_jobs: 1,
            disk_bytes: 0,
        }
    }

    fn limits(max_jobs: u32) -> QuotaLimits {
        QuotaLimits {
            max_cpu_cores: 4.0,
            max_memory_bytes: 8_000,
            max_concurrent_jobs: max_jobs,
            max_disk_bytes: u64::MAX,
        }
    }

    #[test]
    async fn blocked_allocations_do_not_change_usage() {
        let service = QuotaService::new(SoftLimitAction::AllowWithWarning, vec![]);
        let pool_id = PoolId::generate();
        service.set_limits(&pool_id, limits(1), None).await;

        service.try_allocate(&pool_id, &request()).await.unwrap();
        let err = service.try_allocate(&pool_id, &request()).await.unwrap_err();
        let QuotaError::Exceeded { violations, .. } = err;
        assert!(!violations.is_empty());
        assert!(violations.iter().all(|v| v.severity <= ViolationSeverity::Critical));

        // usage still reflects exactly one admitted request
        assert_eq!(service.usage(&pool_id).await.concurrent_jobs, 1);
    }

    #[test]
    async fn allocate_deallocate_is_symmetric() {
        let service = QuotaService::new(SoftLimitAction::AllowWithWarning, vec![]);
        let pool_id = PoolId::generate();
        service.set_limits(&pool_id, limits(10), None).await;

        service.try_allocate(&pool_id, &request()).await.unwrap();
        service.try_allocate(&pool_id, &request()).await.unwrap();
        service.deallocate(&pool_id, &request()).await;
        service.deallocate(&pool_id, &request()).await;
        assert!(service.usage(&pool_id).await.is_zero());
    }

    #[test]
    async fn soft_limits_warn_but_admit() {
        let service = QuotaService::new(SoftLimitAction::AllowWithWarning, vec![]);
        let pool_id = PoolId::generate();
        service
            .set_limits(&pool_id, limits(10), Some(limits(1)))
            .await;

        service.try_allocate(&pool_id, &request()).await.unwrap();
        let outcome = service.try_allocate(&pool_id, &request()).await.unwrap();
        assert_eq!(outcome.action, ViolationAction::AllowedWithWarning);
        assert_eq!(service.usage(&pool_id).await.concurrent_jobs, 2);
    }

    #[test]
    async fn soft_limits_can_queue_instead() {
        let service = QuotaService::new(SoftLimitAction::Queue, vec![]);
        let pool_id = PoolId::generate();
        service
            .set_limits(&pool_id, limits(10), Some(limits(1)))
            .await;

        service.try_allocate(&pool_id, &request()).await.unwrap();
        let outcome = service.try_allocate(&pool_id, &request()).await.unwrap();
        assert_eq!(outcome.action, ViolationAction::Queued);
        // a queued request must not consume quota
        assert_eq!(service.usage(&pool_id).await.concurrent_jobs, 1);
    }
}
