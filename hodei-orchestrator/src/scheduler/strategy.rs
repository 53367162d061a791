use hodei_common::model::{PoolUtilization, ResourcePool};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A pool that passed the capacity filter, paired with the snapshot it was
/// judged on.
#[derive(Debug, Clone)]
pub struct PoolCandidate {
    pub pool: ResourcePool,
    pub utilization: PoolUtilization,
}

/// Pure choice over a pre-filtered candidate set. Candidates arrive sorted
/// by pool id and every implementation must be deterministic for identical
/// inputs; ties break towards the lexicographically smallest pool id.
pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select<'a>(&self, candidates: &'a [PoolCandidate]) -> Option<&'a PoolCandidate>;
}

pub fn builtin_strategies() -> HashMap<String, Arc<dyn PlacementStrategy>> {
    let strategies: Vec<Arc<dyn PlacementStrategy>> = vec![
        Arc::new(RoundRobin::new()),
        Arc::new(Greedy),
        Arc::new(LeastLoaded),
        Arc::new(BinPacking),
    ];
    strategies
        .into_iter()
        .map(|strategy| (strategy.name().to_string(), strategy))
        .collect()
}

/// Rotates over the sorted candidate list; the strategy owns the monotone
/// counter driving the rotation.
pub struct RoundRobin {
    counter: AtomicU64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl PlacementStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn select<'a>(&self, candidates: &'a [PoolCandidate]) -> Option<&'a PoolCandidate> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) as usize % candidates.len();
        candidates.get(index)
    }
}

/// Lowest `max(cpu, memory)` utilization wins.
pub struct Greedy;

impl PlacementStrategy for Greedy {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn select<'a>(&self, candidates: &'a [PoolCandidate]) -> Option<&'a PoolCandidate> {
        candidates
            .iter()
            .min_by(|a, b| dominant_utilization(a).total_cmp(&dominant_utilization(b)))
    }
}

/// Lowest average of cpu, memory and job-slot pressure wins; equal averages
/// fall back to the lowest peak dimension, so the balanced pool beats the
/// skewed ones.
pub struct LeastLoaded;

impl PlacementStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "leastloaded"
    }

    fn select<'a>(&self, candidates: &'a [PoolCandidate]) -> Option<&'a PoolCandidate> {
        candidates.iter().min_by(|a, b| {
            Self::score(a)
                .total_cmp(&Self::score(b))
                .then_with(|| dominant_utilization(a).total_cmp(&dominant_utilization(b)))
        })
    }
}

impl LeastLoaded {
    fn score(candidate: &PoolCandidate) -> f64 {
        let job_pressure = match candidate.pool.policies.max_jobs {
            Some(max_jobs) if max_jobs > 0 => {
                candidate.utilization.running_jobs as f64 / max_jobs as f64
            }
            _ => 0.0,
        };
        (candidate.utilization.cpu_utilization()
            + candidate.utilization.memory_utilization()
            + job_pressure)
            / 3.0
    }
}

/// Prefers pools filled into the 0.4..=0.7 band, penalizing the near-empty
/// and the near-full; ties break towards the fullest candidate below 0.8.
/// Pools at or above 0.8 are never picked.
pub struct BinPacking;

impl BinPacking {
    const FULL: f64 = 0.8;
    const BAND_LOW: f64 = 0.4;
    const BAND_HIGH: f64 = 0.7;
}

impl PlacementStrategy for BinPacking {
    fn name(&self) -> &'static str {
        "binpacking"
    }

    fn select<'a>(&self, candidates: &'a [PoolCandidate]) -> Option<&'a PoolCandidate> {
        candidates
            .iter()
            .map(|candidate| (candidate, dominant_utilization(candidate)))
            .filter(|(_, utilization)| *utilization < Self::FULL)
            .min_by(|(_, a), (_, b)| {
                let a_out_of_band = !(Self::BAND_LOW..=Self::BAND_HIGH).contains(a);
                let b_out_of_band = !(Self::BAND_LOW..=Self::BAND_HIGH).contains(b);
                a_out_of_band
                    .cmp(&b_out_of_band)
                    // fuller is better below the ceiling
                    .then_with(|| b.total_cmp(a))
            })
            .map(|(candidate, _)| candidate)
    }
}

fn dominant_utilization(candidate: &PoolCandidate) -> f64 {
    candidate
        .utilization
        .cpu_utilization()
        .max(candidate.utilization.memory_utilization())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hodei_common::model::{PoolCapacity, ProviderKind, ResourcePool};
    use test_r::test;

    fn candidate(name: &str, cpu_util: f64, mem_util: f64) -> PoolCandidate {
        let capacity = PoolCapacity {
            total_cpu_cores: 10.0,
            total_memory_bytes: 10_000,
            total_disk_bytes: 0,
            total_workers: 10,
        };
        let mut pool = ResourcePool::new(name, ProviderKind::Local, capacity);
        pool.id = hodei_common::model::PoolId(name.to_string());
        PoolCandidate {
            pool,
            utilization: PoolUtilization {
                total_cpu_cores: 10.0,
                used_cpu_cores: cpu_util * 10.0,
                total_memory_bytes: 10_000,
                used_memory_bytes: (mem_util * 10_000.0) as u64,
                total_disk_bytes: 0,
                used_disk_bytes: 0,
                running_jobs: 0,
                queued_jobs: 0,
                timestamp: Utc::now(),
            },
        }
    }

    fn picked<'a>(strategy: &dyn PlacementStrategy, candidates: &'a [PoolCandidate]) -> &'a str {
        strategy
            .select(candidates)
            .map(|candidate| candidate.pool.id.as_str())
            .unwrap_or("<none>")
    }

    // one shared scenario: a is memory-heavy, c is cpu-heavy, b is balanced
    fn skewed_candidates() -> Vec<PoolCandidate> {
        vec![
            candidate("a", 0.1, 0.9),
            candidate("b", 0.5, 0.5),
            candidate("c", 0.9, 0.1),
        ]
    }

    #[test]
    fn greedy_picks_the_lowest_peak() {
        let candidates = skewed_candidates();
        assert_eq!(picked(&Greedy, &candidates), "b");
    }

    #[test]
    fn binpacking_picks_the_only_candidate_in_band() {
        let candidates = skewed_candidates();
        assert_eq!(picked(&BinPacking, &candidates), "b");
    }

    #[test]
    fn binpacking_never_picks_nearly_full_pools() {
        let candidates = vec![candidate("a", 0.85, 0.1), candidate("b", 0.8, 0.2)];
        assert!(BinPacking.select(&candidates).is_none());
    }

    #[test]
    fn binpacking_tie_breaks_by_highest_utilization_below_the_ceiling() {
        let candidates = vec![
            candidate("a", 0.1, 0.0),
            candidate("b", 0.75, 0.0),
            candidate("c", 0.3, 0.0),
        ];
        // nobody is in the band; the fullest below 0.8 wins
        assert_eq!(picked(&BinPacking, &candidates), "b");
    }

    #[test]
    fn roundrobin_cycles_in_id_order() {
        let candidates = skewed_candidates();
        let strategy = RoundRobin::new();
        let rotation: Vec<&str> = (0..4).map(|_| picked(&strategy, &candidates)).collect();
        assert_eq!(rotation, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn leastloaded_prefers_the_lowest_average() {
        let candidates = vec![
            candidate("a", 0.6, 0.6),
            candidate("b", 0.2, 0.3),
            candidate("c", 0.9, 0.1),
        ];
        assert_eq!(picked(&LeastLoaded, &candidates), "b");
    }

    #[test]
    fn leastloaded_breaks_average_ties_towards_the_balanced_pool() {
        // all three averages are identical; the lowest peak dimension wins
        let candidates = skewed_candidates();
        assert_eq!(picked(&LeastLoaded, &candidates), "b");
    }

    #[test]
    fn leastloaded_counts_job_slot_pressure() {
        let mut a = candidate("a", 0.5, 0.5);
        a.pool.policies.max_jobs = Some(10);
        a.utilization.running_jobs = 10;
        let mut b = candidate("b", 0.5, 0.5);
        b.pool.policies.max_jobs = Some(10);
        b.utilization.running_jobs = 1;
        assert_eq!(picked(&LeastLoaded, &[a, b]), "b");
    }

    #[test]
    fn strategies_tie_break_towards_the_smallest_pool_id() {
        let candidates = vec![
            candidate("a", 0.5, 0.5),
            candidate("b", 0.5, 0.5),
            candidate("c", 0.5, 0.5),
        ];
        assert_eq!(picked(&Greedy, &candidates), "a");
        assert_eq!(picked(&LeastLoaded, &candidates), "a");
        assert_eq!(picked(&BinPacking, &candidates), "a");
    }
}
