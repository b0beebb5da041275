use std::fmt::Debug;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::domain::model::cluster_node::WorkerCandidate;
use crate::error::{ConversionError, DispatchError};

/// Constraints a candidate must meet for one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRequirements {
    pub worker_group: String,
}

impl HostRequirements {
    pub fn group(worker_group: impl Into<String>) -> Self {
        Self { worker_group: worker_group.into() }
    }
}

/// Picks one worker out of the live candidates.
///
/// `select` filters by group and drops busy workers, the strategy only ever
/// sees a non-empty slice.
pub trait HostSelector: Debug + Send + Sync {
    fn choose<'a>(&self, candidates: &[&'a WorkerCandidate]) -> &'a WorkerCandidate;

    fn select<'a>(&self, candidates: &'a [WorkerCandidate], requirements: &HostRequirements) -> Result<&'a WorkerCandidate, DispatchError> {
        let eligible: Vec<&WorkerCandidate> =
            candidates.iter().filter(|c| c.group == requirements.worker_group && !c.is_busy()).collect();

        if eligible.is_empty() {
            return Err(DispatchError::NoAvailableHost { group: requirements.worker_group.clone() });
        }
        Ok(self.choose(&eligible))
    }
}

/// Cycles through the candidates. The cursor is shared by all callers and wraps.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
}

impl HostSelector for RoundRobinSelector {
    fn choose<'a>(&self, candidates: &[&'a WorkerCandidate]) -> &'a WorkerCandidate {
        let position = self.cursor.fetch_add(1, Ordering::Relaxed);
        candidates[position % candidates.len()]
    }
}

#[derive(Debug, Default)]
pub struct RandomSelector;

impl HostSelector for RandomSelector {
    fn choose<'a>(&self, candidates: &[&'a WorkerCandidate]) -> &'a WorkerCandidate {
        candidates[rand::rng().random_range(0..candidates.len())]
    }
}

/// Picks proportionally to the configured host weight. If every weight is
/// zero the pick is uniform.
#[derive(Debug, Default)]
pub struct WeightedRandomSelector;

impl WeightedRandomSelector {
    fn pick_index(weights: &[u32], roll: u64) -> usize {
        let mut cumulative = 0u64;
        for (index, weight) in weights.iter().enumerate() {
            cumulative += *weight as u64;
            if roll < cumulative {
                return index;
            }
        }
        weights.len() - 1
    }
}

impl HostSelector for WeightedRandomSelector {
    fn choose<'a>(&self, candidates: &[&'a WorkerCandidate]) -> &'a WorkerCandidate {
        let weights: Vec<u32> = candidates.iter().map(|c| c.weight()).collect();
        let total: u64 = weights.iter().map(|w| *w as u64).sum();

        let mut rng = rand::rng();
        if total == 0 {
            return candidates[rng.random_range(0..candidates.len())];
        }
        candidates[Self::pick_index(&weights, rng.random_range(0..total))]
    }
}

/// Picks the least loaded worker relative to its weight. Ties are broken
/// uniformly at random.
#[derive(Debug, Default)]
pub struct LowerWeightSelector;

impl LowerWeightSelector {
    /// Lower is better. Pending tasks per exec thread plus cpu load, scaled
    /// down by the host weight.
    pub fn load_score(candidate: &WorkerCandidate) -> f64 {
        let hb = &candidate.heartbeat;
        let queue = hb.pending_tasks as f64 / hb.exec_threads.max(1) as f64;
        let load = queue + hb.cpu_load_avg.max(0.0);
        load / (hb.host_weight.max(1) as f64 / 100.0)
    }
}

impl HostSelector for LowerWeightSelector {
    fn choose<'a>(&self, candidates: &[&'a WorkerCandidate]) -> &'a WorkerCandidate {
        let scores: Vec<f64> = candidates.iter().map(|c| Self::load_score(c)).collect();
        let best = scores.iter().copied().fold(f64::INFINITY, f64::min);

        let tied: Vec<usize> = scores.iter().enumerate().filter(|(_, s)| (*s - best).abs() < f64::EPSILON).map(|(i, _)| i).collect();
        let index = match tied.len() {
            0 => 0,
            1 => tied[0],
            n => tied[rand::rng().random_range(0..n)],
        };
        candidates[index]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostSelectorType {
    RoundRobin,
    Random,
    WeightedRandom,
    #[default]
    LowerWeight,
}

impl HostSelectorType {
    pub fn get_instance(&self) -> Box<dyn HostSelector> {
        match self {
            HostSelectorType::RoundRobin => Box::new(RoundRobinSelector::default()),
            HostSelectorType::Random => Box::new(RandomSelector),
            HostSelectorType::WeightedRandom => Box::new(WeightedRandomSelector),
            HostSelectorType::LowerWeight => Box::new(LowerWeightSelector),
        }
    }
}

impl FromStr for HostSelectorType {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(HostSelectorType::RoundRobin),
            "random" => Ok(HostSelectorType::Random),
            "weighted_random" => Ok(HostSelectorType::WeightedRandom),
            "lower_weight" => Ok(HostSelectorType::LowerWeight),
            _ => Err(ConversionError::UnknownHostSelector(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::cluster_node::{HeartbeatInfo, NodeRole, ServerStatus};
    use crate::domain::utils::id::Host;
    use std::collections::HashMap;

    fn worker(host: &str, group: &str, weight: u32) -> WorkerCandidate {
        WorkerCandidate {
            host: Host::new(host),
            group: group.to_string(),
            heartbeat: HeartbeatInfo {
                role: NodeRole::Worker,
                host: Host::new(host),
                startup_time: 0,
                report_time: 0,
                cpu_load_avg: 0.0,
                available_memory_mb: 1024,
                exec_threads: 4,
                host_weight: weight,
                pending_tasks: 0,
                process_id: 1,
                server_status: ServerStatus::Normal,
            },
        }
    }

    const ALL: [HostSelectorType; 4] =
        [HostSelectorType::RoundRobin, HostSelectorType::Random, HostSelectorType::WeightedRandom, HostSelectorType::LowerWeight];

    #[test]
    fn single_candidate_is_always_chosen() {
        let candidates = vec![worker("w1:1", "default", 100)];
        for typ in ALL {
            let selector = typ.get_instance();
            for _ in 0..10 {
                assert_eq!(selector.select(&candidates, &HostRequirements::group("default")).unwrap().host, Host::new("w1:1"));
            }
        }
    }

    #[test]
    fn no_candidates_is_no_available_host() {
        for typ in ALL {
            let err = typ.get_instance().select(&[], &HostRequirements::group("default")).unwrap_err();
            assert!(matches!(err, DispatchError::NoAvailableHost { ref group } if group == "default"));
        }
    }

    #[test]
    fn busy_and_foreign_group_workers_are_filtered() {
        let mut busy = worker("w1:1", "default", 100);
        busy.heartbeat.server_status = ServerStatus::Busy;
        let candidates = vec![busy, worker("w2:1", "gpu", 100), worker("w3:1", "default", 100)];

        for typ in ALL {
            let chosen = typ.get_instance().select(&candidates, &HostRequirements::group("default")).unwrap();
            assert_eq!(chosen.host, Host::new("w3:1"));
        }
        assert!(RandomSelector.select(&candidates[..2], &HostRequirements::group("default")).is_err());
    }

    #[test]
    fn round_robin_cycles_and_wraps() {
        let candidates = vec![worker("a:1", "default", 1), worker("b:1", "default", 1), worker("c:1", "default", 1)];
        let selector = RoundRobinSelector::default();
        let requirements = HostRequirements::group("default");

        let picks: Vec<String> = (0..6).map(|_| selector.select(&candidates, &requirements).unwrap().host.to_string()).collect();
        assert_eq!(picks, vec!["a:1", "b:1", "c:1", "a:1", "b:1", "c:1"]);
    }

    #[test]
    fn all_zero_weights_fall_back_to_uniform() {
        let candidates = vec![worker("a:1", "default", 0), worker("b:1", "default", 0), worker("c:1", "default", 0)];
        let requirements = HostRequirements::group("default");
        let mut counts: HashMap<String, usize> = HashMap::new();

        for _ in 0..3000 {
            let chosen = WeightedRandomSelector.select(&candidates, &requirements).unwrap();
            *counts.entry(chosen.host.to_string()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!(*count > 700, "distribution too skewed: {:?}", counts);
        }
    }

    #[test]
    fn weighted_pick_respects_cumulative_bounds() {
        let weights = [0, 3, 1];
        assert_eq!(WeightedRandomSelector::pick_index(&weights, 0), 1);
        assert_eq!(WeightedRandomSelector::pick_index(&weights, 2), 1);
        assert_eq!(WeightedRandomSelector::pick_index(&weights, 3), 2);
    }

    #[test]
    fn lower_weight_prefers_idle_worker() {
        let mut loaded = worker("a:1", "default", 100);
        loaded.heartbeat.pending_tasks = 8;
        loaded.heartbeat.cpu_load_avg = 2.0;
        let candidates = vec![loaded, worker("b:1", "default", 100)];

        for _ in 0..10 {
            let chosen = LowerWeightSelector.select(&candidates, &HostRequirements::group("default")).unwrap();
            assert_eq!(chosen.host, Host::new("b:1"));
        }
    }

    #[test]
    fn parses_selector_names() {
        assert_eq!("round_robin".parse::<HostSelectorType>(), Ok(HostSelectorType::RoundRobin));
        assert_eq!("Weighted-Random".parse::<HostSelectorType>(), Ok(HostSelectorType::WeightedRandom));
        assert!("fastest".parse::<HostSelectorType>().is_err());
    }
}
