/// Cluster selection with pluggable load balancing strategies
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{ClusterConfig, LoadBalancingAlgorithm};
use crate::registry::Server;

/// Trait for load balancing strategies
///
/// `candidates` only ever holds servers that can accept a request.
pub trait LoadBalancingStrategy: Send + Sync {
    /// Select a server for the given request key
    fn select(&self, candidates: &[Arc<Server>], key: &[u8]) -> Option<Arc<Server>>;
}

/// Round-robin load balancing strategy
#[derive(Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select(&self, candidates: &[Arc<Server>], _key: &[u8]) -> Option<Arc<Server>> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].clone())
    }
}

/// Least connections load balancing strategy
#[derive(Default)]
pub struct LeastConnectionsStrategy;

impl LoadBalancingStrategy for LeastConnectionsStrategy {
    fn select(&self, candidates: &[Arc<Server>], _key: &[u8]) -> Option<Arc<Server>> {
        candidates
            .iter()
            .min_by_key(|server| server.in_flight())
            .cloned()
    }
}

/// Weighted round-robin load balancing strategy
///
/// Walks the cumulative weights instead of materialising a weighted list,
/// since the candidate set changes with liveness.
#[derive(Default)]
pub struct WeightedRoundRobinStrategy {
    counter: AtomicUsize,
}

impl LoadBalancingStrategy for WeightedRoundRobinStrategy {
    fn select(&self, candidates: &[Arc<Server>], _key: &[u8]) -> Option<Arc<Server>> {
        let total: usize = candidates.iter().map(|s| s.weight as usize).sum();
        if total == 0 {
            return candidates.first().cloned();
        }

        let mut slot = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        for server in candidates {
            let weight = server.weight as usize;
            if slot < weight {
                return Some(server.clone());
            }
            slot -= weight;
        }
        None
    }
}

/// IP hash load balancing strategy
#[derive(Default)]
pub struct IpHashStrategy;

impl IpHashStrategy {
    /// Hash the IP address to select a server
    fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = ahash::AHasher::default();
        key.hash(&mut hasher);
        hasher.finish()
    }
}

impl LoadBalancingStrategy for IpHashStrategy {
    fn select(&self, candidates: &[Arc<Server>], key: &[u8]) -> Option<Arc<Server>> {
        if candidates.is_empty() {
            return None;
        }
        let index = (Self::hash_key(key) as usize) % candidates.len();
        Some(candidates[index].clone())
    }
}

/// Random load balancing strategy
#[derive(Default)]
pub struct RandomStrategy;

impl LoadBalancingStrategy for RandomStrategy {
    fn select(&self, candidates: &[Arc<Server>], _key: &[u8]) -> Option<Arc<Server>> {
        if candidates.is_empty() {
            return None;
        }
        let index = rand::random::<usize>() % candidates.len();
        Some(candidates[index].clone())
    }
}

/// Build the strategy for an algorithm
pub fn strategy_for(algorithm: LoadBalancingAlgorithm) -> Box<dyn LoadBalancingStrategy> {
    match algorithm {
        LoadBalancingAlgorithm::RoundRobin => Box::<RoundRobinStrategy>::default(),
        LoadBalancingAlgorithm::LeastConnections => Box::new(LeastConnectionsStrategy),
        LoadBalancingAlgorithm::WeightedRoundRobin => {
            Box::<WeightedRoundRobinStrategy>::default()
        }
        LoadBalancingAlgorithm::IpHash => Box::new(IpHashStrategy),
        LoadBalancingAlgorithm::Random => Box::new(RandomStrategy),
    }
}

/// A named pool of interchangeable servers
pub struct ClusterRuntime {
    /// Cluster identifier
    pub id: u64,
    /// Human readable name
    pub name: String,
    /// Member server ids
    pub servers: Vec<u64>,
    /// Configured algorithm
    pub algorithm: LoadBalancingAlgorithm,
    strategy: Box<dyn LoadBalancingStrategy>,
}

impl std::fmt::Debug for ClusterRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRuntime")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("servers", &self.servers)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl ClusterRuntime {
    /// Create a cluster runtime from configuration
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            servers: config.servers.clone(),
            algorithm: config.algorithm,
            strategy: strategy_for(config.algorithm),
        }
    }

    /// Pick one live member; `None` when no member can take the request
    ///
    /// Members missing from `registry` (removed concurrently) are skipped.
    pub fn select(&self, registry: &HashMap<u64, Arc<Server>>, key: &[u8]) -> Option<Arc<Server>> {
        let candidates: Vec<Arc<Server>> = self
            .servers
            .iter()
            .filter_map(|id| registry.get(id))
            .filter(|server| server.can_accept())
            .cloned()
            .collect();

        self.strategy.select(&candidates, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn registry(weights: &[u32]) -> HashMap<u64, Arc<Server>> {
        weights
            .iter()
            .enumerate()
            .map(|(i, weight)| {
                let id = i as u64 + 1;
                let server = Server::new(&ServerConfig {
                    id,
                    address: format!("127.0.0.1:{}", 9000 + id),
                    weight: *weight,
                    max_connections: None,
                    health_check: None,
                });
                (id, Arc::new(server))
            })
            .collect()
    }

    fn cluster(servers: Vec<u64>, algorithm: LoadBalancingAlgorithm) -> ClusterRuntime {
        ClusterRuntime::new(&ClusterConfig {
            id: 1,
            name: "test".to_string(),
            servers,
            algorithm,
        })
    }

    #[test]
    fn test_round_robin_alternates() {
        let registry = registry(&[1, 1]);
        let cluster = cluster(vec![1, 2], LoadBalancingAlgorithm::RoundRobin);

        let first = cluster.select(&registry, b"").unwrap().id;
        let second = cluster.select(&registry, b"").unwrap().id;
        assert_ne!(first, second);
        assert_eq!(cluster.select(&registry, b"").unwrap().id, first);
    }

    #[test]
    fn test_only_live_servers_selected() {
        let registry = registry(&[1, 1]);
        registry[&1].mark_dead();
        let cluster = cluster(vec![1, 2], LoadBalancingAlgorithm::RoundRobin);

        for _ in 0..4 {
            assert_eq!(cluster.select(&registry, b"").unwrap().id, 2);
        }

        registry[&2].mark_dead();
        assert!(cluster.select(&registry, b"").is_none());
    }

    #[test]
    fn test_missing_member_skipped() {
        let registry = registry(&[1]);
        let cluster = cluster(vec![1, 42], LoadBalancingAlgorithm::Random);
        for _ in 0..8 {
            assert_eq!(cluster.select(&registry, b"").unwrap().id, 1);
        }
    }

    #[test]
    fn test_weighted_round_robin_distribution() {
        let registry = registry(&[3, 1]);
        let cluster = cluster(vec![1, 2], LoadBalancingAlgorithm::WeightedRoundRobin);

        let mut counts = HashMap::new();
        for _ in 0..8 {
            let id = cluster.select(&registry, b"").unwrap().id;
            *counts.entry(id).or_insert(0) += 1;
        }
        assert_eq!(counts[&1], 6);
        assert_eq!(counts[&2], 2);
    }

    #[test]
    fn test_ip_hash_is_sticky() {
        let registry = registry(&[1, 1, 1]);
        let cluster = cluster(vec![1, 2, 3], LoadBalancingAlgorithm::IpHash);
        let key = [10, 0, 0, 7];
        let first = cluster.select(&registry, &key).unwrap().id;
        for _ in 0..5 {
            assert_eq!(cluster.select(&registry, &key).unwrap().id, first);
        }
    }

    #[test]
    fn test_least_connections_prefers_idle() {
        let registry = registry(&[1, 1]);
        let cluster = cluster(vec![1, 2], LoadBalancingAlgorithm::LeastConnections);
        let _busy = registry[&1].begin_request();
        assert_eq!(cluster.select(&registry, b"").unwrap().id, 2);
    }
}
