/// Point-in-time routing state and its atomically swapped store
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::ApiRuntime;
use crate::config::{ApiConfig, ClusterConfig, Config, RoutingConfig, ServerConfig};
use crate::error::DispatchError;
use crate::load_balancer::ClusterRuntime;
use crate::registry::Server;
use crate::routes::RouteTrie;
use crate::routing::{RoutingRule, RoutingTable};

/// Change delivered by the config feed
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    PutApi(ApiConfig),
    RemoveApi(u64),
    PutCluster(ClusterConfig),
    RemoveCluster(u64),
    PutServer(ServerConfig),
    RemoveServer(u64),
    PutRouting(RoutingConfig),
    RemoveRouting(u64),
}

impl ConfigEvent {
    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            ConfigEvent::PutApi(c) => format!("put api {}", c.id),
            ConfigEvent::RemoveApi(id) => format!("remove api {}", id),
            ConfigEvent::PutCluster(c) => format!("put cluster {}", c.id),
            ConfigEvent::RemoveCluster(id) => format!("remove cluster {}", id),
            ConfigEvent::PutServer(c) => format!("put server {}", c.id),
            ConfigEvent::RemoveServer(id) => format!("remove server {}", id),
            ConfigEvent::PutRouting(c) => format!("put routing {}", c.id),
            ConfigEvent::RemoveRouting(id) => format!("remove routing {}", id),
        }
    }
}

/// Immutable snapshot of APIs, clusters, servers and routing rules
///
/// Entries are shared `Arc`s; a change clones the maps and replaces whole
/// entries, so a request holding a snapshot never sees a partial update.
#[derive(Debug, Clone, Default)]
pub struct RoutingState {
    pub version: u64,
    pub apis: HashMap<u64, Arc<ApiRuntime>>,
    pub clusters: HashMap<u64, Arc<ClusterRuntime>>,
    pub servers: HashMap<u64, Arc<Server>>,
    pub routings: RoutingTable,
    pub routes: Arc<RouteTrie>,
}

impl RoutingState {
    /// Build the initial state from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut state = Self::default();
        for server in &config.servers {
            state.servers.insert(server.id, Arc::new(Server::new(server)));
        }
        for cluster in &config.clusters {
            state
                .clusters
                .insert(cluster.id, Arc::new(ClusterRuntime::new(cluster)));
        }
        for api in &config.apis {
            let runtime =
                ApiRuntime::new(api).with_context(|| format!("Failed to load API '{}'", api.name))?;
            state.apis.insert(api.id, Arc::new(runtime));
        }
        for routing in &config.routings {
            let rule = RoutingRule::new(routing)
                .with_context(|| format!("Failed to load routing '{}'", routing.name))?;
            state.routings.put(rule);
        }
        state.rebuild_routes()?;

        debug!(
            "Loaded routing state: {} apis, {} clusters, {} servers, {} routings",
            state.apis.len(),
            state.clusters.len(),
            state.servers.len(),
            state.routings.len()
        );
        Ok(state)
    }

    fn rebuild_routes(&mut self) -> Result<()> {
        let mut apis: Vec<&Arc<ApiRuntime>> = self.apis.values().collect();
        apis.sort_by_key(|api| api.id);

        let mut routes = RouteTrie::new();
        for api in apis {
            routes
                .insert(&api.path, api.id)
                .with_context(|| format!("Failed to register API '{}'", api.name))?;
        }
        self.routes = Arc::new(routes);
        Ok(())
    }

    /// Apply one config change to this (private) copy
    pub fn apply(&mut self, event: &ConfigEvent) -> Result<()> {
        match event {
            ConfigEvent::PutApi(config) => {
                let runtime = ApiRuntime::new(config)?;
                self.apis.insert(config.id, Arc::new(runtime));
                self.rebuild_routes()?;
            }
            ConfigEvent::RemoveApi(id) => {
                if self.apis.remove(id).is_some() {
                    self.rebuild_routes()?;
                }
            }
            ConfigEvent::PutCluster(config) => {
                self.clusters
                    .insert(config.id, Arc::new(ClusterRuntime::new(config)));
            }
            ConfigEvent::RemoveCluster(id) => {
                self.clusters.remove(id);
            }
            ConfigEvent::PutServer(config) => {
                let server = match self.servers.get(&config.id) {
                    Some(previous) => Server::replacing(config, previous),
                    None => Server::new(config),
                };
                self.servers.insert(config.id, Arc::new(server));
            }
            ConfigEvent::RemoveServer(id) => {
                self.servers.remove(id);
            }
            ConfigEvent::PutRouting(config) => {
                self.routings.put(RoutingRule::new(config)?);
            }
            ConfigEvent::RemoveRouting(id) => {
                self.routings.remove(*id);
            }
        }
        Ok(())
    }

    /// Pick a live server of `cluster` for a request
    ///
    /// A cluster missing from this snapshot is handled like one without
    /// live servers.
    pub fn select_server(&self, cluster: u64, key: &[u8]) -> Result<Arc<Server>, DispatchError> {
        self.clusters
            .get(&cluster)
            .and_then(|runtime| runtime.select(&self.servers, key))
            .ok_or(DispatchError::NoLiveServer { cluster })
    }
}

/// Holder of the current [`RoutingState`]
///
/// Readers take a snapshot without blocking; writers are serialized and
/// publish a complete new snapshot.
pub struct RoutingStore {
    current: ArcSwap<RoutingState>,
    writer: Mutex<()>,
}

impl RoutingStore {
    pub fn new(state: RoutingState) -> Self {
        Self {
            current: ArcSwap::from_pointee(state),
            writer: Mutex::new(()),
        }
    }

    /// Current snapshot, valid for as long as the caller holds it
    pub fn snapshot(&self) -> Arc<RoutingState> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Apply a config change and publish the resulting snapshot
    ///
    /// On error the current snapshot stays in place.
    pub fn apply(&self, event: &ConfigEvent) -> Result<u64> {
        let _guard = self.writer.lock();
        let mut next = RoutingState::clone(&self.current.load());
        next.apply(event)
            .with_context(|| format!("Failed to apply config event: {}", event.describe()))?;
        next.version += 1;
        let version = next.version;
        self.current.store(Arc::new(next));
        info!("Applied config event ({}), version {}", event.describe(), version);
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ApiStatus, GatewayConfig, HealthCheckConfig, LoadBalancingAlgorithm, MetricsConfig,
        NodeConfig, RoutingStatus, RoutingStrategy,
    };

    fn server(id: u64) -> ServerConfig {
        ServerConfig {
            id,
            address: format!("127.0.0.1:{}", 9000 + id),
            weight: 1,
            max_connections: None,
            health_check: None,
        }
    }

    fn api(id: u64, path: &str, cluster: u64) -> ApiConfig {
        ApiConfig {
            id,
            name: format!("api-{}", id),
            path: path.to_string(),
            methods: None,
            host: None,
            status: ApiStatus::Up,
            use_default: false,
            nodes: vec![NodeConfig::new(cluster)],
        }
    }

    fn config() -> Config {
        Config {
            gateway: GatewayConfig {
                http_addr: "127.0.0.1:8080".parse().unwrap(),
                request_timeout: None,
                max_body_size: 1024,
                upgrade_sock: "/tmp/test.sock".to_string(),
            },
            health_check: HealthCheckConfig::default(),
            metrics: MetricsConfig::default(),
            servers: vec![server(1), server(2)],
            clusters: vec![ClusterConfig {
                id: 10,
                name: "c1".to_string(),
                servers: vec![1, 2],
                algorithm: LoadBalancingAlgorithm::RoundRobin,
            }],
            apis: vec![api(100, "/orders/{id}", 10)],
            routings: vec![RoutingConfig {
                id: 1,
                name: "canary".to_string(),
                api: Some(100),
                cluster: 10,
                strategy: RoutingStrategy::Copy,
                status: RoutingStatus::Up,
                condition: None,
                traffic_rate: 100,
            }],
        }
    }

    #[test]
    fn test_from_config() {
        let state = RoutingState::from_config(&config()).unwrap();
        assert_eq!(state.apis.len(), 1);
        assert_eq!(state.routes.len(), 1);
        assert_eq!(state.routes.find("/orders/1", |_, _| {}), Some(100));
        assert!(state.select_server(10, b"").is_ok());
        assert_eq!(
            state.select_server(99, b"").unwrap_err(),
            DispatchError::NoLiveServer { cluster: 99 }
        );
    }

    #[test]
    fn test_apply_replaces_snapshot() {
        let store = RoutingStore::new(RoutingState::from_config(&config()).unwrap());
        let before = store.snapshot();

        store
            .apply(&ConfigEvent::PutApi(api(101, "/users/{id}", 10)))
            .unwrap();
        store.apply(&ConfigEvent::RemoveCluster(10)).unwrap();

        let after = store.snapshot();
        assert_eq!(store.version(), 2);
        assert_eq!(after.routes.find("/users/1", |_, _| {}), Some(101));
        assert!(after.clusters.is_empty());

        // in-flight holders of the old snapshot are unaffected
        assert_eq!(before.version, 0);
        assert!(before.clusters.contains_key(&10));
        assert_eq!(before.routes.find("/users/1", |_, _| {}), None);
        assert!(before.select_server(10, b"").is_ok());
    }

    #[test]
    fn test_failed_event_keeps_state() {
        let store = RoutingStore::new(RoutingState::from_config(&config()).unwrap());
        let result = store.apply(&ConfigEvent::PutApi(api(101, "/orders/{id}", 10)));
        assert!(result.is_err());
        assert_eq!(store.version(), 0);
        assert_eq!(store.snapshot().apis.len(), 1);
    }

    #[test]
    fn test_server_update_keeps_liveness() {
        let store = RoutingStore::new(RoutingState::from_config(&config()).unwrap());
        store.snapshot().servers[&1].mark_dead();

        let mut updated = server(1);
        updated.weight = 5;
        store.apply(&ConfigEvent::PutServer(updated)).unwrap();

        let state = store.snapshot();
        assert_eq!(state.servers[&1].weight, 5);
        assert!(!state.servers[&1].is_live());
    }

    #[test]
    fn test_routing_events() {
        let store = RoutingStore::new(RoutingState::from_config(&config()).unwrap());
        store.apply(&ConfigEvent::RemoveRouting(1)).unwrap();
        assert!(store.snapshot().routings.is_empty());
        store.apply(&ConfigEvent::RemoveApi(100)).unwrap();
        assert!(store.snapshot().routes.is_empty());
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        use std::thread;

        let store = Arc::new(RoutingStore::new(
            RoutingState::from_config(&config()).unwrap(),
        ));
        let mut handles = vec![];

        let writer = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for i in 0..50 {
                let event = if i % 2 == 0 {
                    ConfigEvent::RemoveServer(2)
                } else {
                    ConfigEvent::PutServer(server(2))
                };
                writer.apply(&event).unwrap();
            }
        }));

        for _ in 0..4 {
            let reader = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let state = reader.snapshot();
                    // a selected server always belongs to the same snapshot
                    if let Ok(server) = state.select_server(10, b"") {
                        assert!(state.servers.contains_key(&server.id));
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.version(), 50);
    }
}
