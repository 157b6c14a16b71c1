/// Backend server runtimes and their liveness
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use crate::config::{ServerConfig, ServerHealthCheckConfig};

/// One concrete backend instance
///
/// Liveness is flipped by the health checker and read lock-free by the
/// cluster selector, so a probe in flight never delays selection.
#[derive(Debug)]
pub struct Server {
    /// Server identifier
    pub id: u64,
    /// Network address (`host:port`)
    pub address: String,
    /// Server weight (for weighted algorithms)
    pub weight: u32,
    /// Maximum concurrent requests
    pub max_connections: Option<usize>,
    /// Health check override
    pub health_check: Option<ServerHealthCheckConfig>,
    live: AtomicBool,
    stats: ServerStats,
}

/// Request and latency statistics for a server
#[derive(Debug, Default)]
pub struct ServerStats {
    requests: AtomicU64,
    failures: AtomicU64,
    in_flight: AtomicUsize,
    latency_micros: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub failures: u64,
    pub in_flight: usize,
    pub latency_micros: u64,
}

impl Server {
    /// Create a new server, live until a probe says otherwise
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            id: config.id,
            address: config.address.clone(),
            weight: config.weight,
            max_connections: config.max_connections,
            health_check: config.health_check.clone(),
            live: AtomicBool::new(true),
            stats: ServerStats::default(),
        }
    }

    /// Create a replacement entry that keeps the liveness of `previous`
    pub fn replacing(config: &ServerConfig, previous: &Server) -> Self {
        let server = Self::new(config);
        server.live.store(previous.is_live(), Ordering::Relaxed);
        server
    }

    /// Whether the last probe verdict is "live"
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    /// Mark server as live
    pub fn mark_live(&self) {
        self.live.store(true, Ordering::Relaxed);
    }

    /// Mark server as dead
    pub fn mark_dead(&self) {
        self.live.store(false, Ordering::Relaxed);
    }

    /// Check if the server can take another request
    pub fn can_accept(&self) -> bool {
        if !self.is_live() {
            return false;
        }

        match self.max_connections {
            Some(max_conn) => self.stats.in_flight.load(Ordering::Relaxed) < max_conn,
            None => true,
        }
    }

    /// Current number of requests in flight
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::Relaxed)
    }

    /// Record the start of a forwarded request; the guard records its end
    pub fn begin_request(&self) -> RequestGuard<'_> {
        self.stats.in_flight.fetch_add(1, Ordering::Relaxed);
        RequestGuard {
            server: self,
            started: Instant::now(),
            failed: false,
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.stats.requests.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            in_flight: self.stats.in_flight.load(Ordering::Relaxed),
            latency_micros: self.stats.latency_micros.load(Ordering::Relaxed),
        }
    }
}

/// Tracks one in-flight request against a [`Server`]
pub struct RequestGuard<'a> {
    server: &'a Server,
    started: Instant,
    failed: bool,
}

impl RequestGuard<'_> {
    /// Count this request as failed when it completes
    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        let stats = &self.server.stats;
        stats.in_flight.fetch_sub(1, Ordering::Relaxed);
        stats.requests.fetch_add(1, Ordering::Relaxed);
        stats
            .latency_micros
            .fetch_add(self.started.elapsed().as_micros() as u64, Ordering::Relaxed);
        if self.failed {
            stats.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}
