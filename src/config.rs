/// Configuration management for the dispatch core
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    pub gateway: GatewayConfig,
    /// Health check configuration
    pub health_check: HealthCheckConfig,
    /// Metrics and monitoring configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Backend server instances
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Pools of interchangeable servers
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    /// Externally reachable API definitions
    #[serde(default)]
    pub apis: Vec<ApiConfig>,
    /// Dynamic traffic rules
    #[serde(default)]
    pub routings: Vec<RoutingConfig>,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP listening address
    pub http_addr: SocketAddr,
    /// Upper bound for a whole request, including every node and retry
    #[serde(with = "humantime_serde", default)]
    pub request_timeout: Option<Duration>,
    /// Maximum accepted request body size
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Upgrade socket path for zero downtime reloads
    #[serde(default = "default_upgrade_sock")]
    pub upgrade_sock: String,
}

/// Backend server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server identifier
    pub id: u64,
    /// Network address (`host:port`)
    pub address: String,
    /// Server weight (for weighted algorithms)
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Maximum concurrent requests to this server
    pub max_connections: Option<usize>,
    /// Health check override for this server
    pub health_check: Option<ServerHealthCheckConfig>,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster identifier
    pub id: u64,
    /// Human readable name
    pub name: String,
    /// Member server ids
    #[serde(default)]
    pub servers: Vec<u64>,
    /// Load balancing algorithm
    #[serde(default)]
    pub algorithm: LoadBalancingAlgorithm,
}

/// Load balancing algorithms
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    /// Round-robin algorithm
    #[default]
    RoundRobin,
    /// Least connections algorithm
    LeastConnections,
    /// Weighted round-robin algorithm
    WeightedRoundRobin,
    /// IP hash algorithm
    IpHash,
    /// Random algorithm
    Random,
}

/// API status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiStatus {
    #[default]
    Up,
    Down,
}

/// API definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API identifier
    pub id: u64,
    /// Human readable name
    pub name: String,
    /// URL pattern, e.g. `/orders/{id}`
    pub path: String,
    /// HTTP methods to match (any when absent)
    pub methods: Option<Vec<String>>,
    /// Host header to match
    pub host: Option<String>,
    /// Whether the API is served
    #[serde(default)]
    pub status: ApiStatus,
    /// Serve default values for every node without calling any backend
    #[serde(default)]
    pub use_default: bool,
    /// Backend calls, in declaration order
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

/// One backend call within an API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Target cluster
    pub cluster: u64,
    /// URL rewrite template, e.g. `/v2/orders/$(param.id)`
    pub url_rewrite: Option<String>,
    /// Aggregation key when the API has several nodes
    pub attr_name: Option<String>,
    /// Retry policy
    pub retry: Option<RetryStrategy>,
    /// Fallback response
    pub default_value: Option<DefaultValue>,
    /// Always serve the default value for this node
    #[serde(default)]
    pub use_default: bool,
    /// Per-call timeout
    #[serde(with = "humantime_serde", default = "default_node_timeout")]
    pub timeout: Duration,
}

/// Retry policy for a node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Statuses that trigger a retry; empty means any error status
    #[serde(default)]
    pub codes: Vec<u16>,
    /// Maximum number of retries after the first attempt
    #[serde(default = "default_retry_times")]
    pub max_times: u32,
    /// Pause before each retry
    #[serde(with = "humantime_serde", default)]
    pub interval: Duration,
}

/// Static fallback response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultValue {
    /// Status used when this value is the whole response
    #[serde(default = "default_status")]
    pub status: u16,
    /// Response body
    #[serde(default)]
    pub body: String,
    /// Response headers
    #[serde(default)]
    pub headers: Vec<HeaderConfig>,
    /// `Set-Cookie` values
    #[serde(default)]
    pub cookies: Vec<String>,
}

/// Name/value header pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderConfig {
    pub name: String,
    pub value: String,
}

/// Routing strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Replace the primary destination
    Split,
    /// Duplicate traffic to a secondary destination
    Copy,
}

/// Routing rule status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStatus {
    #[default]
    Up,
    Down,
}

/// Routing rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Rule identifier, also its evaluation priority (ascending)
    pub id: u64,
    /// Human readable name
    pub name: String,
    /// Target API, all APIs when absent
    pub api: Option<u64>,
    /// Cluster receiving the matched traffic
    pub cluster: u64,
    /// Split or copy
    pub strategy: RoutingStrategy,
    /// Enabled or disabled
    #[serde(default)]
    pub status: RoutingStatus,
    /// Match condition, always true when absent
    pub condition: Option<String>,
    /// Percentage of matching requests the rule applies to
    #[serde(default = "default_traffic_rate")]
    pub traffic_rate: u8,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Global health check interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Health check timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Number of consecutive failures before marking unhealthy
    pub failure_threshold: u32,
    /// Number of consecutive successes before marking healthy
    pub success_threshold: u32,
}

/// Server-specific health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHealthCheckConfig {
    /// Health check type
    pub check_type: HealthCheckType,
    /// Health check path (for HTTP checks)
    pub path: Option<String>,
    /// Expected status code (for HTTP checks)
    pub expected_status: Option<u16>,
    /// Custom interval for this server
    #[serde(with = "humantime_serde", default)]
    pub interval: Option<Duration>,
}

/// Health check types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckType {
    /// TCP connection health check
    Tcp,
    /// HTTP health check
    Http,
}

/// Metrics and monitoring configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics
    #[serde(default)]
    pub prometheus: bool,
    /// Metrics server address
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config file: {}", path))?
        } else if path.ends_with(".toml") {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config file: {}", path))?
        } else if path.ends_with(".json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config file: {}", path))?
        } else {
            return Err(anyhow!(
                "Unsupported config file format. Supported formats: .yaml, .yml, .toml, .json"
            ));
        };

        Ok(config)
    }

    /// Validate referential integrity of the configuration
    pub fn validate(&self) -> Result<()> {
        let server_ids = unique_ids("server", self.servers.iter().map(|s| s.id))?;
        let cluster_ids = unique_ids("cluster", self.clusters.iter().map(|c| c.id))?;
        let api_ids = unique_ids("api", self.apis.iter().map(|a| a.id))?;
        unique_ids("routing", self.routings.iter().map(|r| r.id))?;

        for cluster in &self.clusters {
            if let Some(missing) = cluster.servers.iter().find(|id| !server_ids.contains(id)) {
                return Err(anyhow!(
                    "Cluster '{}' references non-existent server {}",
                    cluster.name,
                    missing
                ));
            }
        }

        for api in &self.apis {
            api.validate()?;
            if let Some(node) = api.nodes.iter().find(|n| !cluster_ids.contains(&n.cluster)) {
                return Err(anyhow!(
                    "API '{}' references non-existent cluster {}",
                    api.name,
                    node.cluster
                ));
            }
        }

        for routing in &self.routings {
            routing.validate()?;
            if !cluster_ids.contains(&routing.cluster) {
                return Err(anyhow!(
                    "Routing '{}' references non-existent cluster {}",
                    routing.name,
                    routing.cluster
                ));
            }
            if let Some(api) = routing.api {
                if !api_ids.contains(&api) {
                    return Err(anyhow!(
                        "Routing '{}' references non-existent api {}",
                        routing.name,
                        api
                    ));
                }
            }
        }

        Ok(())
    }
}

impl ApiConfig {
    /// Checks that only depend on the API itself
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(anyhow!(
                "API '{}' path '{}' must start with '/'",
                self.name,
                self.path
            ));
        }

        if self.nodes.is_empty() {
            return Err(anyhow!("API '{}' needs at least one node", self.name));
        }

        if self.nodes.len() > 1 {
            let mut names = HashSet::with_capacity(self.nodes.len());
            for node in &self.nodes {
                let name = node.attr_name.as_deref().unwrap_or_default();
                if name.is_empty() {
                    return Err(anyhow!(
                        "API '{}' has several nodes, each one needs an attr_name",
                        self.name
                    ));
                }
                if !names.insert(name) {
                    return Err(anyhow!(
                        "API '{}' uses attr_name '{}' twice",
                        self.name,
                        name
                    ));
                }
            }
        }

        Ok(())
    }
}

impl RoutingConfig {
    /// Checks that only depend on the rule itself
    pub fn validate(&self) -> Result<()> {
        if self.traffic_rate > 100 {
            return Err(anyhow!(
                "Routing '{}' traffic_rate must be within 0..=100, got {}",
                self.name,
                self.traffic_rate
            ));
        }
        Ok(())
    }
}

fn unique_ids(kind: &str, ids: impl Iterator<Item = u64>) -> Result<HashSet<u64>> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(anyhow!("Duplicate {} id: {}", kind, id));
        }
    }
    Ok(seen)
}

// Default value functions
fn default_weight() -> u32 {
    1
}

fn default_status() -> u16 {
    200
}

fn default_retry_times() -> u32 {
    1
}

fn default_traffic_rate() -> u8 {
    100
}

fn default_node_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_body_size() -> usize {
    4 * 1024 * 1024 // 4MB
}

fn default_upgrade_sock() -> String {
    "/tmp/lumen_upgrade.sock".to_string()
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
            failure_threshold: 3,
            success_threshold: 1,
        }
    }
}

impl NodeConfig {
    /// Node targeting a cluster with every optional policy unset
    pub fn new(cluster: u64) -> Self {
        Self {
            cluster,
            url_rewrite: None,
            attr_name: None,
            retry: None,
            default_value: None,
            use_default: false,
            timeout: default_node_timeout(),
        }
    }
}
