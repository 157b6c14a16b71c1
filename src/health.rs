/// Health check system for backend servers
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use log::{debug, info, warn};
use parking_lot::RwLock;
use pingora_timeout::{sleep, timeout};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::net::TcpStream;

use crate::{
    config::{HealthCheckConfig, HealthCheckType, ServerHealthCheckConfig},
    registry::Server,
    state::RoutingStore,
};

/// Health check status for a backend server
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Whether the server is currently live
    pub live: bool,
    /// Number of consecutive failures
    pub consecutive_failures: u32,
    /// Number of consecutive successes
    pub consecutive_successes: u32,
    /// Time of the last probe
    pub last_check: Option<Instant>,
    /// Last error message (if any)
    pub last_error: Option<String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            live: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check: None,
            last_error: None,
        }
    }
}

impl HealthStatus {
    /// Fold one probe result into the counters
    ///
    /// Returns the new verdict when it flipped.
    fn record(&mut self, result: &Result<()>, thresholds: &HealthCheckConfig) -> Option<bool> {
        self.last_check = Some(Instant::now());
        match result {
            Ok(()) => {
                self.consecutive_successes += 1;
                self.consecutive_failures = 0;
                self.last_error = None;
                if !self.live && self.consecutive_successes >= thresholds.success_threshold {
                    self.live = true;
                    return Some(true);
                }
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
                self.last_error = Some(e.to_string());
                if self.live && self.consecutive_failures >= thresholds.failure_threshold {
                    self.live = false;
                    return Some(false);
                }
            }
        }
        None
    }
}

/// Health checker for one server id
///
/// The server entry is looked up in the current snapshot on every probe, so
/// config updates that replace the entry keep being checked.
pub struct ServerHealthChecker {
    server_id: u64,
    address: String,
    config: ServerHealthCheckConfig,
    status: Arc<RwLock<HealthStatus>>,
    running: Arc<AtomicBool>,
}

impl ServerHealthChecker {
    /// Create a new health checker for a server
    pub fn new(server: &Server, config: ServerHealthCheckConfig) -> Self {
        let status = HealthStatus {
            live: server.is_live(),
            ..HealthStatus::default()
        };
        Self {
            server_id: server.id,
            address: server.address.clone(),
            config,
            status: Arc::new(RwLock::new(status)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start health checking for this server with jittered scheduling
    pub fn start(&self, store: Arc<RoutingStore>, global_config: &HealthCheckConfig) {
        if self.running.swap(true, Ordering::Relaxed) {
            return; // Already running
        }

        let server_id = self.server_id;
        let address = self.address.clone();
        let config = self.config.clone();
        let global_config = global_config.clone();
        let status = self.status.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let base_interval = config.interval.unwrap_or(global_config.interval);

            // Add jitter to prevent thundering herd
            let jitter = rand::random::<f64>() * 0.2; // ±10% jitter
            let check_interval =
                Duration::from_secs_f64(base_interval.as_secs_f64() * (0.9 + jitter));

            info!(
                "Starting health checks for server {} at {} (interval: {:?})",
                server_id, address, check_interval
            );

            // Initial random delay to spread out health checks
            sleep(Duration::from_millis(rand::random::<u64>() % 1000)).await;

            while running.load(Ordering::Relaxed) {
                let Some(server) = store.snapshot().servers.get(&server_id).cloned() else {
                    debug!("Server {} left the registry, stopping its checks", server_id);
                    break;
                };

                let check_start = Instant::now();
                let result = probe(&server.address, &config, global_config.timeout).await;
                let check_duration = check_start.elapsed();

                let live = {
                    let mut guard = status.write();
                    match guard.record(&result, &global_config) {
                        Some(true) => {
                            info!("Server {} at {} is now live", server_id, server.address);
                            server.mark_live();
                        }
                        Some(false) => {
                            warn!(
                                "Server {} at {} is now dead: {}",
                                server_id,
                                server.address,
                                guard.last_error.as_deref().unwrap_or_default()
                            );
                            server.mark_dead();
                        }
                        None => {}
                    }
                    guard.live
                };

                // Dead servers are probed twice as often
                let sleep_duration = if live {
                    check_interval
                } else {
                    check_interval / 2
                }
                .saturating_sub(check_duration);

                if sleep_duration > Duration::ZERO {
                    sleep(sleep_duration).await;
                }
            }

            running.store(false, Ordering::Relaxed);
            info!("Health checks stopped for server {}", server_id);
        });
    }

    /// Stop health checking
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Get current health status
    pub fn get_status(&self) -> HealthStatus {
        self.status.read().clone()
    }
}

/// Run a single probe against `address`
async fn probe(
    address: &str,
    config: &ServerHealthCheckConfig,
    check_timeout: Duration,
) -> Result<()> {
    match config.check_type {
        HealthCheckType::Tcp => tcp_health_check(address, check_timeout).await,
        HealthCheckType::Http => {
            http_health_check(
                address,
                config.path.as_deref().unwrap_or("/health"),
                config.expected_status.unwrap_or(200),
                check_timeout,
            )
            .await
        }
    }
}

/// Perform TCP health check
async fn tcp_health_check(address: &str, check_timeout: Duration) -> Result<()> {
    debug!("Performing TCP health check for {}", address);

    timeout(check_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| anyhow!("TCP health check timeout"))?
        .map_err(|e| anyhow!("TCP connection failed: {}", e))?;

    Ok(())
}

/// Perform HTTP health check
async fn http_health_check(
    address: &str,
    path: &str,
    expected_status: u16,
    check_timeout: Duration,
) -> Result<()> {
    debug!(
        "Performing HTTP health check for {} (path: {}, expected status: {})",
        address, path, expected_status
    );

    let client = reqwest::Client::builder()
        .timeout(check_timeout)
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

    let response = client
        .get(format!("http://{}{}", address, path))
        .send()
        .await
        .map_err(|e| anyhow!("HTTP request failed: {}", e))?;

    let status_code = response.status().as_u16();
    if status_code == expected_status {
        Ok(())
    } else {
        Err(anyhow!(
            "HTTP health check failed: expected status {}, got {}",
            expected_status,
            status_code
        ))
    }
}

/// Manager for all health checks
///
/// Only servers that carry a health check configuration are probed; the
/// others stay live.
pub struct HealthCheckManager {
    /// Global health check configuration
    config: HealthCheckConfig,
    /// Source of server entries
    store: Arc<RoutingStore>,
    /// Health checkers by server id
    checkers: DashMap<u64, Arc<ServerHealthChecker>>,
    /// Whether health checks are running
    running: AtomicBool,
}

impl HealthCheckManager {
    /// Create a new health check manager with a checker per configured server
    pub fn new(config: HealthCheckConfig, store: Arc<RoutingStore>) -> Self {
        let manager = Self {
            config,
            store,
            checkers: DashMap::new(),
            running: AtomicBool::new(false),
        };

        for server in manager.store.snapshot().servers.values() {
            manager.insert_checker(server);
        }
        info!("Initialized {} health checkers", manager.checkers.len());
        manager
    }

    fn insert_checker(&self, server: &Server) -> Option<Arc<ServerHealthChecker>> {
        let config = server.health_check.clone()?;
        let checker = Arc::new(ServerHealthChecker::new(server, config));
        if let Some(previous) = self.checkers.insert(server.id, checker.clone()) {
            previous.stop();
        }
        Some(checker)
    }

    /// Start all health checks
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Ok(()); // Already running
        }

        for entry in self.checkers.iter() {
            entry.value().start(self.store.clone(), &self.config);
        }

        info!(
            "Health check manager started with {} checkers",
            self.checkers.len()
        );
        Ok(())
    }

    /// Stop all health checks
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return; // Already stopped
        }

        for entry in self.checkers.iter() {
            entry.value().stop();
        }

        info!("Health check manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Add or replace the checker of a server that was put by a config event
    pub fn add_server_checker(&self, server_id: u64) {
        let Some(server) = self.store.snapshot().servers.get(&server_id).cloned() else {
            return;
        };

        match self.insert_checker(&server) {
            Some(checker) => {
                if self.running.load(Ordering::Relaxed) {
                    checker.start(self.store.clone(), &self.config);
                }
                debug!("Added health checker for server {}", server_id);
            }
            None => self.remove_server_checker(server_id),
        }
    }

    /// Remove the checker of a server
    pub fn remove_server_checker(&self, server_id: u64) {
        if let Some((_, checker)) = self.checkers.remove(&server_id) {
            checker.stop();
            debug!("Removed health checker for server {}", server_id);
        }
    }

    /// Get health status for a specific server
    pub fn get_server_health_status(&self, server_id: u64) -> Option<HealthStatus> {
        self.checkers
            .get(&server_id)
            .map(|checker| checker.get_status())
    }

    pub fn checker_count(&self) -> usize {
        self.checkers.len()
    }

    /// Live/dead counts over every server of the current snapshot
    pub fn get_health_stats(&self) -> HealthStats {
        let mut stats = HealthStats::default();
        for server in self.store.snapshot().servers.values() {
            stats.total_servers += 1;
            if server.is_live() {
                stats.live_servers += 1;
            } else {
                stats.dead_servers += 1;
            }
        }
        stats
    }
}

/// Health statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthStats {
    pub total_servers: u32,
    pub live_servers: u32,
    pub dead_servers: u32,
}

impl HealthStats {
    /// Get health percentage
    pub fn health_percentage(&self) -> f64 {
        if self.total_servers == 0 {
            100.0
        } else {
            (self.live_servers as f64 / self.total_servers as f64) * 100.0
        }
    }
}
