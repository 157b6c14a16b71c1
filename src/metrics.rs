/// Metrics collection for the dispatch core
use anyhow::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::time::Duration;

const DURATION_BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Metrics collector for the gateway
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Registry,

    // Request metrics
    /// Total number of requests
    requests_total: IntCounter,
    /// Number of requests in flight
    requests_in_flight: IntGauge,
    /// Request duration histogram
    request_duration: Histogram,
    /// Responses by status class
    responses_total: IntCounterVec,
    /// Requests matching no API
    no_route_total: IntCounter,

    // Upstream metrics
    /// Total number of forwarded requests, retries and copies included
    upstream_requests_total: IntCounter,
    /// Forwarded requests that failed or returned an error status
    upstream_errors_total: IntCounter,
    /// Upstream response time histogram
    upstream_duration: Histogram,
    /// Retry attempts
    retries_total: IntCounter,
    /// Node contributions served from a default value
    default_fallbacks_total: IntCounter,
    /// Copy requests by outcome
    copy_requests_total: IntCounterVec,
    /// Nodes without a live server
    no_live_server_total: IntCounter,
    /// Routing rule conditions that failed to evaluate
    rule_errors_total: IntCounter,

    // Server metrics
    /// Number of live servers
    live_servers: IntGauge,
    /// Number of dead servers
    dead_servers: IntGauge,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create a metrics collector registering into `registry`
    pub fn with_registry(registry: Registry) -> Result<Self> {

        let requests_total = IntCounter::with_opts(Opts::new(
            "gateway_requests_total",
            "Total number of HTTP requests processed by the gateway",
        ))?;
        registry.register(Box::new(requests_total.clone()))?;

        let requests_in_flight = IntGauge::with_opts(Opts::new(
            "gateway_requests_in_flight",
            "Number of HTTP requests currently being processed",
        ))?;
        registry.register(Box::new(requests_in_flight.clone()))?;

        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        // Status classes keep cardinality bounded
        let responses_total = IntCounterVec::new(
            Opts::new(
                "gateway_responses_total",
                "Total number of responses by HTTP status class",
            ),
            &["class"],
        )?;
        registry.register(Box::new(responses_total.clone()))?;

        let no_route_total = IntCounter::with_opts(Opts::new(
            "gateway_no_route_total",
            "Total number of requests that matched no API",
        ))?;
        registry.register(Box::new(no_route_total.clone()))?;

        let upstream_requests_total = IntCounter::with_opts(Opts::new(
            "gateway_upstream_requests_total",
            "Total number of requests sent to backend servers",
        ))?;
        registry.register(Box::new(upstream_requests_total.clone()))?;

        let upstream_errors_total = IntCounter::with_opts(Opts::new(
            "gateway_upstream_errors_total",
            "Total number of failed backend requests",
        ))?;
        registry.register(Box::new(upstream_errors_total.clone()))?;

        let upstream_duration = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_upstream_duration_seconds",
                "Backend request duration in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(upstream_duration.clone()))?;

        let retries_total = IntCounter::with_opts(Opts::new(
            "gateway_retries_total",
            "Total number of backend retries",
        ))?;
        registry.register(Box::new(retries_total.clone()))?;

        let default_fallbacks_total = IntCounter::with_opts(Opts::new(
            "gateway_default_fallbacks_total",
            "Total number of node results served from a default value",
        ))?;
        registry.register(Box::new(default_fallbacks_total.clone()))?;

        let copy_requests_total = IntCounterVec::new(
            Opts::new(
                "gateway_copy_requests_total",
                "Total number of copied requests by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(copy_requests_total.clone()))?;

        let no_live_server_total = IntCounter::with_opts(Opts::new(
            "gateway_no_live_server_total",
            "Total number of node dispatches without a live server",
        ))?;
        registry.register(Box::new(no_live_server_total.clone()))?;

        let rule_errors_total = IntCounter::with_opts(Opts::new(
            "gateway_routing_rule_errors_total",
            "Total number of routing rule evaluation failures",
        ))?;
        registry.register(Box::new(rule_errors_total.clone()))?;

        let live_servers = IntGauge::with_opts(Opts::new(
            "gateway_live_servers",
            "Number of backend servers currently live",
        ))?;
        registry.register(Box::new(live_servers.clone()))?;

        let dead_servers = IntGauge::with_opts(Opts::new(
            "gateway_dead_servers",
            "Number of backend servers currently dead",
        ))?;
        registry.register(Box::new(dead_servers.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            requests_in_flight,
            request_duration,
            responses_total,
            no_route_total,
            upstream_requests_total,
            upstream_errors_total,
            upstream_duration,
            retries_total,
            default_fallbacks_total,
            copy_requests_total,
            no_live_server_total,
            rule_errors_total,
            live_servers,
            dead_servers,
        })
    }

    /// Record a new request
    pub fn record_request(&self) {
        self.requests_total.inc();
        self.requests_in_flight.inc();
    }

    /// Record a completed response
    pub fn record_response(&self, status_code: u16, duration: Duration) {
        self.requests_in_flight.dec();
        self.request_duration.observe(duration.as_secs_f64());

        let class = match status_code {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            500..=599 => "5xx",
            _ => "other",
        };
        self.responses_total.with_label_values(&[class]).inc();
    }

    /// Record a request that matched no API
    pub fn record_no_route(&self) {
        self.no_route_total.inc();
    }

    /// Record a forwarded request
    pub fn record_upstream_request(&self) {
        self.upstream_requests_total.inc();
    }

    /// Record a failed forwarded request
    pub fn record_upstream_error(&self) {
        self.upstream_errors_total.inc();
    }

    /// Record upstream response duration
    pub fn record_upstream_duration(&self, duration: Duration) {
        self.upstream_duration.observe(duration.as_secs_f64());
    }

    pub fn record_retry(&self) {
        self.retries_total.inc();
    }

    pub fn record_default_fallback(&self) {
        self.default_fallbacks_total.inc();
    }

    /// Record the outcome of a copy request
    pub fn record_copy(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.copy_requests_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_no_live_server(&self) {
        self.no_live_server_total.inc();
    }

    pub fn record_rule_errors(&self, count: usize) {
        self.rule_errors_total.inc_by(count as u64);
    }

    /// Update server liveness gauges
    pub fn update_server_health(&self, live: i64, dead: i64) {
        self.live_servers.set(live);
        self.dead_servers.set(dead);
    }

    /// Get the metrics registry for Prometheus exposition
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get current metrics snapshot
    pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.get(),
            requests_in_flight: self.requests_in_flight.get(),
            no_route_total: self.no_route_total.get(),
            upstream_requests_total: self.upstream_requests_total.get(),
            upstream_errors_total: self.upstream_errors_total.get(),
            retries_total: self.retries_total.get(),
            default_fallbacks_total: self.default_fallbacks_total.get(),
            copy_success_total: self.copy_requests_total.with_label_values(&["success"]).get(),
            copy_failure_total: self.copy_requests_total.with_label_values(&["failure"]).get(),
            no_live_server_total: self.no_live_server_total.get(),
            rule_errors_total: self.rule_errors_total.get(),
            live_servers: self.live_servers.get(),
            dead_servers: self.dead_servers.get(),
        }
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Snapshot of current metrics values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_in_flight: i64,
    pub no_route_total: u64,
    pub upstream_requests_total: u64,
    pub upstream_errors_total: u64,
    pub retries_total: u64,
    pub default_fallbacks_total: u64,
    pub copy_success_total: u64,
    pub copy_failure_total: u64,
    pub no_live_server_total: u64,
    pub rule_errors_total: u64,
    pub live_servers: i64,
    pub dead_servers: i64,
}

impl MetricsSnapshot {
    /// Share of forwarded requests that succeeded
    pub fn upstream_success_rate(&self) -> f64 {
        if self.upstream_requests_total == 0 {
            100.0
        } else {
            let ok = self
                .upstream_requests_total
                .saturating_sub(self.upstream_errors_total);
            (ok as f64 / self.upstream_requests_total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_request();
        metrics.record_upstream_request();
        metrics.record_upstream_request();
        metrics.record_upstream_error();
        metrics.record_retry();
        metrics.record_copy(true);
        metrics.record_rule_errors(2);
        metrics.record_response(200, Duration::from_millis(5));

        let snapshot = metrics.get_metrics_snapshot();
        assert_eq!(snapshot.requests_total, 1);
        assert_eq!(snapshot.requests_in_flight, 0);
        assert_eq!(snapshot.upstream_requests_total, 2);
        assert_eq!(snapshot.retries_total, 1);
        assert_eq!(snapshot.copy_success_total, 1);
        assert_eq!(snapshot.copy_failure_total, 0);
        assert_eq!(snapshot.rule_errors_total, 2);
        assert_eq!(snapshot.upstream_success_rate(), 50.0);
    }

    #[test]
    fn test_export() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.record_request();
        metrics.record_response(503, Duration::from_millis(1));
        let text = metrics.export_metrics().unwrap();
        assert!(text.contains("gateway_requests_total 1"));
        assert!(text.contains("gateway_responses_total{class=\"5xx\"} 1"));
    }
}
