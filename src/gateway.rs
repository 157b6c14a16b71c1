/// Lumen gateway: request handling and the Pingora serving front
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, HeaderValue, StatusCode};
use log::{debug, error, info, warn};
use pingora_core::{
    server::{configuration::Opt, Server},
    upstreams::peer::HttpPeer,
    Result as PingoraResult,
};
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{
    aggregate::{render_json, MultiContext},
    api::ApiRuntime,
    config::Config,
    context::{DispatchRequest, Exchange, GatewayResponse, RequestContext},
    dispatcher::{Dispatcher, NodeOutput, Plan},
    error::{DispatchError, ForwardError},
    executor::{Forwarder, HttpForwarder, NodeExecutor},
    filter::FilterChain,
    health::HealthCheckManager,
    metrics::MetricsCollector,
    state::{ConfigEvent, RoutingState, RoutingStore},
};

const GATEWAY_HEADER: &str = "Lumen/1.0";
const X_REQUEST_ID_HEADER: &str = "x-request-id";

/// Response for a dispatch error that reached the caller
fn error_response(e: &DispatchError) -> GatewayResponse {
    let status = e.status_code();
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Error");
    GatewayResponse::plain(status, reason)
}

/// Lumen API gateway
#[derive(Clone)]
pub struct ApiGateway {
    /// Configuration
    config: Arc<Config>,
    /// Current routing state
    store: Arc<RoutingStore>,
    /// Request to plan
    dispatcher: Arc<Dispatcher>,
    /// Plan execution
    executor: NodeExecutor,
    /// Filters run around dispatch
    filters: FilterChain,
    /// Health check manager
    health_check_manager: Arc<HealthCheckManager>,
    /// Metrics collector
    metrics_collector: Arc<MetricsCollector>,
    /// Request ID counter
    request_counter: Arc<AtomicU64>,
}

impl ApiGateway {
    /// Create a gateway forwarding over HTTP
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let forwarder = Arc::new(HttpForwarder::new()?);
        Self::with_forwarder(config, forwarder).await
    }

    /// Create a gateway with a custom forwarder
    ///
    /// Must be called within a tokio runtime; health checks start right away.
    pub async fn with_forwarder(config: Arc<Config>, forwarder: Arc<dyn Forwarder>) -> Result<Self> {
        config.validate()?;

        let state = RoutingState::from_config(&config).context("Failed to build routing state")?;
        let store = Arc::new(RoutingStore::new(state));

        let metrics_collector = Arc::new(if config.metrics.prometheus {
            // exposed by the Pingora prometheus service
            MetricsCollector::with_registry(prometheus::default_registry().clone())?
        } else {
            MetricsCollector::new()?
        });

        let health_check_manager = Arc::new(HealthCheckManager::new(
            config.health_check.clone(),
            store.clone(),
        ));
        health_check_manager.start()?;

        let gateway = Self {
            dispatcher: Arc::new(Dispatcher::new(store.clone())),
            executor: NodeExecutor::new(forwarder, metrics_collector.clone()),
            filters: FilterChain::new(),
            config,
            store,
            health_check_manager,
            metrics_collector,
            request_counter: Arc::new(AtomicU64::new(0)),
        };
        gateway.spawn_health_gauges();
        Ok(gateway)
    }

    /// Replace the filter chain
    pub fn with_filters(mut self, filters: FilterChain) -> Self {
        self.filters = filters;
        self
    }

    pub fn store(&self) -> &Arc<RoutingStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics_collector
    }

    pub fn health(&self) -> &Arc<HealthCheckManager> {
        &self.health_check_manager
    }

    /// Fresh context for a request from `client_addr`
    pub fn new_context(&self, client_addr: std::net::SocketAddr) -> RequestContext {
        let counter = self.request_counter.fetch_add(1, Ordering::Relaxed);
        RequestContext::new(client_addr, counter)
    }

    /// Keep the live/dead gauges in step with server liveness
    fn spawn_health_gauges(&self) {
        let health = self.health_check_manager.clone();
        let metrics = self.metrics_collector.clone();
        let interval = self.config.health_check.interval;
        tokio::spawn(async move {
            while health.is_running() {
                let stats = health.get_health_stats();
                metrics.update_server_health(stats.live_servers as i64, stats.dead_servers as i64);
                debug!(
                    "{}/{} servers live ({:.1}%)",
                    stats.live_servers,
                    stats.total_servers,
                    stats.health_percentage()
                );
                pingora_timeout::sleep(interval).await;
            }
        });
    }

    /// Apply a config change and keep health checkers in step
    pub fn apply_event(&self, event: &ConfigEvent) -> Result<u64> {
        let version = self.store.apply(event)?;
        match event {
            ConfigEvent::PutServer(server) => self.health_check_manager.add_server_checker(server.id),
            ConfigEvent::RemoveServer(id) => self.health_check_manager.remove_server_checker(*id),
            _ => {}
        }
        Ok(version)
    }

    /// Apply config events from `events` until the sender goes away
    pub fn spawn_config_watcher(&self, mut events: mpsc::Receiver<ConfigEvent>) -> JoinHandle<()> {
        let gateway = self.clone();
        tokio::spawn(async move {
            info!("Config watcher started");
            while let Some(event) = events.recv().await {
                if let Err(e) = gateway.apply_event(&event) {
                    error!("{:#}", e);
                }
            }
            info!("Config watcher stopped");
        })
    }

    /// Stop background work
    pub fn shutdown(&self) {
        self.health_check_manager.stop();
        let snapshot = self.metrics_collector.get_metrics_snapshot();
        info!(
            "Lumen stopped after {} requests, {} upstream calls ({:.1}% succeeded)",
            snapshot.requests_total,
            snapshot.upstream_requests_total,
            snapshot.upstream_success_rate()
        );
    }

    /// Dispatch one fully read request
    ///
    /// `gateway.request_timeout` bounds the backend work; nodes still running
    /// when it passes contribute their default value.
    pub async fn handle(&self, ctx: &mut RequestContext, request: DispatchRequest) -> GatewayResponse {
        let deadline = self
            .config
            .gateway
            .request_timeout
            .map(|limit| Instant::now() + limit);

        if let Some(mut response) = self.filters.pre(ctx, &request) {
            self.filters.post(ctx, &mut response);
            ctx.status = Some(response.status);
            return response;
        }

        let mut response = match self.dispatcher.plan(ctx, &request) {
            None => {
                warn!(
                    "{}: no api found for {} {}",
                    ctx.request_id,
                    request.method(),
                    request.path()
                );
                self.metrics_collector.record_no_route();
                error_response(&DispatchError::NoRouteMatch)
            }
            Some(plan) => {
                if plan.rule_errors > 0 {
                    self.metrics_collector.record_rule_errors(plan.rule_errors);
                }
                let exchange = Arc::new(Exchange::new(ctx, request));
                if plan.is_forced_default() {
                    self.forced_default(&plan.api)
                } else if plan.api.is_multi() {
                    self.dispatch_multi(plan, exchange, deadline).await
                } else {
                    self.dispatch_single(plan, exchange, deadline).await
                }
            }
        };

        if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
            response.headers.insert(X_REQUEST_ID_HEADER, value);
        }
        self.filters.post(ctx, &mut response);
        ctx.status = Some(response.status);
        response
    }

    /// Every node answers with its default value
    fn forced_default(&self, api: &ApiRuntime) -> GatewayResponse {
        if api.is_multi() {
            let mut headers = HeaderMap::new();
            let mut parts = BTreeMap::new();
            for node in &api.nodes {
                self.metrics_collector.record_default_fallback();
                let output = NodeOutput::default_for(node);
                for (name, value) in output.headers.iter() {
                    headers.append(name.clone(), value.clone());
                }
                parts.insert(node.attr_name.clone(), output.body);
            }
            return Self::aggregated(headers, &parts);
        }

        match api.nodes.first() {
            Some(node) => {
                self.metrics_collector.record_default_fallback();
                let output = NodeOutput::default_for(node);
                GatewayResponse::new(output.status, output.headers, output.body)
            }
            None => GatewayResponse::plain(503, "Service Unavailable"),
        }
    }

    async fn dispatch_single(
        &self,
        plan: Plan,
        exchange: Arc<Exchange>,
        deadline: Option<Instant>,
    ) -> GatewayResponse {
        let Plan { state, mut nodes, .. } = plan;
        let Some(mut dn) = nodes.pop() else {
            return GatewayResponse::plain(503, "Service Unavailable");
        };

        let execution = self.executor.execute(&state, &exchange, &mut dn);
        let finished = match deadline {
            Some(deadline) => pingora_timeout::timeout(remaining(deadline), execution)
                .await
                .is_ok(),
            None => {
                execution.await;
                true
            }
        };

        if !finished {
            warn!(
                "{}: dispatch node {} unfinished at request deadline",
                exchange.request_id, dn.node.index
            );
            if dn.node.default_value.is_none() {
                return error_response(&DispatchError::Upstream(ForwardError::Timeout));
            }
            self.metrics_collector.record_default_fallback();
            let output = NodeOutput::default_for(&dn.node);
            return GatewayResponse::new(output.status, output.headers, output.body);
        }

        if let Some(e) = dn.failure() {
            warn!("{}: dispatch failed: {}", exchange.request_id, e);
        }

        let output = dn.output(false);
        GatewayResponse::new(output.status, output.headers, output.body)
    }

    /// Run every node concurrently and merge their bodies
    async fn dispatch_multi(
        &self,
        plan: Plan,
        exchange: Arc<Exchange>,
        deadline: Option<Instant>,
    ) -> GatewayResponse {
        let Plan {
            state, api, nodes, ..
        } = plan;
        let multi = Arc::new(MultiContext::new(nodes.len()));

        for mut dn in nodes {
            let executor = self.executor.clone();
            let state = state.clone();
            let exchange = exchange.clone();
            let multi = multi.clone();
            tokio::spawn(async move {
                executor.execute(&state, &exchange, &mut dn).await;
                if let Some(e) = dn.failure() {
                    warn!(
                        "{}: dispatch node {} failed: {}",
                        exchange.request_id, dn.node.index, e
                    );
                }
                let output = dn.output(true);
                multi.add_headers(output.headers);
                multi.complete_part(&dn.node.attr_name, output.body);
            });
        }

        let limit = match deadline {
            Some(deadline) => api.max_duration().min(remaining(deadline)),
            None => api.max_duration(),
        };
        if !multi.join(limit).await {
            warn!(
                "{}: api {} gave up on {} nodes after {:?}",
                exchange.request_id,
                api.name,
                multi.remaining(),
                limit
            );
        }
        let mut parts = multi.parts();
        let mut headers = multi.headers();
        for node in &api.nodes {
            if parts.contains_key(&node.attr_name) {
                continue;
            }
            let body = if node.default_value.is_some() {
                self.metrics_collector.record_default_fallback();
                let output = NodeOutput::default_for(node);
                for (name, value) in output.headers.iter() {
                    headers.append(name.clone(), value.clone());
                }
                output.body
            } else {
                Bytes::new()
            };
            parts.insert(node.attr_name.clone(), body);
        }

        Self::aggregated(headers, &parts)
    }

    fn aggregated(mut headers: HeaderMap, parts: &BTreeMap<String, Bytes>) -> GatewayResponse {
        match render_json(parts) {
            Ok(body) => {
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                GatewayResponse::new(200, headers, body)
            }
            Err(e) => {
                error!("Failed to render aggregated response: {}", e);
                GatewayResponse::plain(500, "Internal Server Error")
            }
        }
    }

    /// Read the whole request body, bounded by `max_body_size`
    async fn read_body(&self, session: &mut Session) -> PingoraResult<Option<Bytes>> {
        let limit = self.config.gateway.max_body_size;
        let mut body = BytesMut::new();
        while let Some(chunk) = session.read_request_body().await? {
            if body.len() + chunk.len() > limit {
                return Ok(None);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(Some(body.freeze()))
    }

    async fn write_response(
        &self,
        session: &mut Session,
        response: GatewayResponse,
    ) -> PingoraResult<()> {
        let mut header = ResponseHeader::build(response.status, Some(response.headers.len() + 2))?;
        for (name, value) in response.headers.iter() {
            header.append_header(name.clone(), value.clone())?;
        }
        header.insert_header(header::CONTENT_LENGTH, response.body.len().to_string())?;
        header.insert_header("x-gateway", GATEWAY_HEADER)?;

        session
            .write_response_header(Box::new(header), false)
            .await?;
        session
            .write_response_body(Some(response.body), true)
            .await?;
        Ok(())
    }

    /// Start the Lumen server
    pub fn run(&self, daemon: bool) -> Result<()> {
        info!("Starting Lumen API gateway server");

        let opt = Opt {
            daemon,
            ..Opt::default()
        };
        let mut server = Server::new(Some(opt))?;
        if let Some(conf) = Arc::get_mut(&mut server.configuration) {
            conf.upgrade_sock = self.config.gateway.upgrade_sock.clone();
        }
        server.bootstrap();

        let mut proxy_service =
            pingora_proxy::http_proxy_service(&server.configuration, self.clone());
        proxy_service.add_tcp(&self.config.gateway.http_addr.to_string());
        info!("HTTP server listening on {}", self.config.gateway.http_addr);
        server.add_service(proxy_service);

        if self.config.metrics.prometheus {
            if let Some(metrics_addr) = &self.config.metrics.metrics_addr {
                let mut metrics_service =
                    pingora_core::services::listening::Service::prometheus_http_service();
                metrics_service.add_tcp(&metrics_addr.to_string());
                server.add_service(metrics_service);
                info!("Metrics server listening on {}", metrics_addr);
            }
        }

        info!("Lumen API gateway started, {} apis loaded", self.store.snapshot().apis.len());

        // blocks forever
        server.run_forever();
    }
}

/// Time left until `deadline`, zero once passed
fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[async_trait]
impl ProxyHttp for ApiGateway {
    type CTX = RequestContext;

    fn new_ctx(&self) -> Self::CTX {
        // client address filled in by early_request_filter
        let request_counter = self.request_counter.fetch_add(1, Ordering::Relaxed);
        RequestContext::unbound(request_counter)
    }

    async fn early_request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<()> {
        if let Some(inet_addr) = session.client_addr().and_then(|addr| addr.as_inet()) {
            ctx.client_addr = *inet_addr;
        }

        debug!(
            "Processing request {} from {}",
            ctx.request_id, ctx.client_addr
        );
        Ok(())
    }

    /// Dispatch the request and answer it; nothing is proxied by Pingora itself
    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<bool> {
        self.metrics_collector.record_request();

        let Some(body) = self.read_body(session).await? else {
            warn!("{}: request body exceeds limit", ctx.request_id);
            ctx.status = Some(413);
            self.write_response(session, GatewayResponse::plain(413, "Payload Too Large"))
                .await?;
            return Ok(true);
        };

        let request = DispatchRequest::new(session.req_header().clone(), body);
        let response = self.handle(ctx, request).await;

        self.write_response(session, response).await?;
        Ok(true)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> PingoraResult<Box<HttpPeer>> {
        error!("{}: request reached upstream selection", ctx.request_id);
        Err(pingora_core::Error::new_str("Requests are answered in request_filter"))
    }

    async fn logging(
        &self,
        session: &mut Session,
        e: Option<&pingora_core::Error>,
        ctx: &mut Self::CTX,
    ) {
        let status_code = ctx
            .status
            .or_else(|| session.response_written().map(|resp| resp.status.as_u16()))
            .unwrap_or(0);
        let duration = ctx.duration();
        self.metrics_collector.record_response(status_code, duration);

        let log_level = if status_code >= 500 {
            log::Level::Error
        } else if status_code >= 400 {
            log::Level::Warn
        } else {
            log::Level::Info
        };

        log::log!(
            log_level,
            "Request {} completed: {} {} -> {} ({}ms) [api {}]",
            ctx.request_id,
            session.req_header().method,
            session.req_header().uri.path(),
            status_code,
            duration.as_millis(),
            ctx.api_id
                .map_or_else(|| "none".to_string(), |id| id.to_string())
        );

        if let Some(error) = e {
            error!("Request {} encountered error: {}", ctx.request_id, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ApiConfig, ApiStatus, ClusterConfig, DefaultValue, GatewayConfig, HeaderConfig,
        HealthCheckConfig, MetricsConfig, NodeConfig, RetryStrategy, RoutingConfig, RoutingStatus, RoutingStrategy,
        ServerConfig,
    };
    use crate::error::ForwardError;
    use crate::executor::tests::MockForwarder;
    use pingora_http::RequestHeader;
    use serde_json::Value;
    use std::time::Duration;

    fn server(id: u64) -> ServerConfig {
        ServerConfig {
            id,
            address: format!("s{}:80", id),
            weight: 1,
            max_connections: None,
            health_check: None,
        }
    }

    fn cluster(id: u64, servers: Vec<u64>) -> ClusterConfig {
        ClusterConfig {
            id,
            name: format!("c{}", id),
            servers,
            algorithm: Default::default(),
        }
    }

    fn api(id: u64, path: &str, nodes: Vec<NodeConfig>) -> ApiConfig {
        ApiConfig {
            id,
            name: format!("api-{}", id),
            path: path.to_string(),
            methods: None,
            host: None,
            status: ApiStatus::Up,
            use_default: false,
            nodes,
        }
    }

    fn node(cluster: u64, attr_name: &str) -> NodeConfig {
        let mut node = NodeConfig::new(cluster);
        node.attr_name = Some(attr_name.to_string());
        node
    }

    fn empty_default() -> DefaultValue {
        DefaultValue {
            status: 200,
            body: "{}".to_string(),
            headers: vec![],
            cookies: vec![],
        }
    }

    fn config(apis: Vec<ApiConfig>, routings: Vec<RoutingConfig>) -> Config {
        Config {
            gateway: GatewayConfig {
                http_addr: "127.0.0.1:8080".parse().unwrap(),
                request_timeout: None,
                max_body_size: 1024,
                upgrade_sock: "/tmp/test.sock".to_string(),
            },
            health_check: HealthCheckConfig::default(),
            metrics: MetricsConfig::default(),
            servers: vec![server(1), server(2), server(3)],
            clusters: vec![cluster(1, vec![1]), cluster(2, vec![2]), cluster(3, vec![3])],
            apis,
            routings,
        }
    }

    async fn gateway(config: Config, forwarder: Arc<MockForwarder>) -> ApiGateway {
        ApiGateway::with_forwarder(Arc::new(config), forwarder)
            .await
            .unwrap()
    }

    async fn get(gateway: &ApiGateway, path: &str) -> (RequestContext, GatewayResponse) {
        let header = RequestHeader::build("GET", path.as_bytes(), None).unwrap();
        let mut ctx = gateway.new_context("10.1.1.1:5000".parse().unwrap());
        let response = gateway
            .handle(&mut ctx, DispatchRequest::new(header, Bytes::new()))
            .await;
        (ctx, response)
    }

    fn json(response: &GatewayResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[tokio::test]
    async fn test_no_route_is_404() {
        let forwarder = Arc::new(MockForwarder::default());
        let gateway = gateway(
            config(vec![api(1, "/orders/{id}", vec![NodeConfig::new(1)])], vec![]),
            forwarder.clone(),
        )
        .await;

        let (ctx, response) = get(&gateway, "/missing").await;
        assert_eq!(response.status, 404);
        assert_eq!(ctx.status, Some(404));
        assert!(response.headers.contains_key(X_REQUEST_ID_HEADER));
        assert_eq!(forwarder.call_count(), 0);
        assert_eq!(gateway.metrics().get_metrics_snapshot().no_route_total, 1);
    }

    #[tokio::test]
    async fn test_single_node_passthrough() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.push("s1:80", 200, r#"{"id":42}"#);
        let gateway = gateway(
            config(vec![api(1, "/orders/{id}", vec![NodeConfig::new(1)])], vec![]),
            forwarder.clone(),
        )
        .await;

        let (ctx, response) = get(&gateway, "/orders/42").await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(br#"{"id":42}"#));
        assert_eq!(
            response.headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert!(!response.headers.contains_key(header::CONTENT_LENGTH));
        assert_eq!(ctx.api_id, Some(1));
        assert_eq!(forwarder.calls_to("s1:80"), vec!["/orders/42"]);
    }

    #[tokio::test]
    async fn test_backend_error_status_propagates() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.push("s1:80", 500, "boom");
        let gateway = gateway(
            config(vec![api(1, "/a", vec![NodeConfig::new(1)])], vec![]),
            forwarder,
        )
        .await;

        let (_, response) = get(&gateway, "/a").await;
        assert_eq!(response.status, 500);
        assert_eq!(response.body, Bytes::from_static(b"boom"));
    }

    #[tokio::test]
    async fn test_api_use_default_makes_no_call() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.always("s1:80", 200);
        let mut fenced = api(1, "/a", vec![NodeConfig::new(1)]);
        fenced.use_default = true;
        fenced.nodes[0].default_value = Some(empty_default());
        let gateway = gateway(config(vec![fenced], vec![]), forwarder.clone()).await;

        let (_, response) = get(&gateway, "/a").await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"{}"));
        assert_eq!(forwarder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_forced_default_multi_keeps_headers_and_cookies() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.always("s1:80", 200);
        forwarder.always("s2:80", 200);
        let mut user = node(1, "user");
        user.default_value = Some(DefaultValue {
            body: r#"{"id":0}"#.to_string(),
            headers: vec![HeaderConfig {
                name: "x-fallback".to_string(),
                value: "user".to_string(),
            }],
            cookies: vec!["seen=1; Path=/".to_string()],
            ..empty_default()
        });
        let mut orders = node(2, "orders");
        orders.default_value = Some(DefaultValue {
            body: "[]".to_string(),
            cookies: vec!["cart=0".to_string()],
            ..empty_default()
        });
        let mut fenced = api(1, "/dashboard", vec![user, orders]);
        fenced.use_default = true;
        let gateway = gateway(config(vec![fenced], vec![]), forwarder.clone()).await;

        let (_, response) = get(&gateway, "/dashboard").await;
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("x-fallback").unwrap(), "user");
        let cookies: Vec<_> = response
            .headers
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies, vec!["seen=1; Path=/", "cart=0"]);
        let value = json(&response);
        assert_eq!(value["user"]["id"], 0);
        assert_eq!(value["orders"], serde_json::json!([]));
        assert_eq!(forwarder.call_count(), 0);
        assert_eq!(
            gateway.metrics().get_metrics_snapshot().default_fallbacks_total,
            2
        );
    }

    #[tokio::test]
    async fn test_request_timeout_serves_single_default() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.push("s1:80", 200, r#"{"late":true}"#);
        forwarder.delay("s1:80", Duration::from_millis(500));
        let mut slow = NodeConfig::new(1);
        slow.timeout = Duration::from_secs(1);
        slow.default_value = Some(empty_default());
        let mut config = config(vec![api(1, "/a", vec![slow])], vec![]);
        config.gateway.request_timeout = Some(Duration::from_millis(50));
        let gateway = gateway(config, forwarder).await;

        let started = Instant::now();
        let (ctx, response) = get(&gateway, "/a").await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"{}"));
        assert_eq!(ctx.status, Some(200));
        assert_eq!(
            gateway.metrics().get_metrics_snapshot().default_fallbacks_total,
            1
        );
    }

    #[tokio::test]
    async fn test_request_timeout_without_default_is_504() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.push("s1:80", 200, "late");
        forwarder.delay("s1:80", Duration::from_millis(500));
        let mut slow = NodeConfig::new(1);
        slow.timeout = Duration::from_secs(1);
        let mut config = config(vec![api(1, "/a", vec![slow])], vec![]);
        config.gateway.request_timeout = Some(Duration::from_millis(50));
        let gateway = gateway(config, forwarder).await;

        let (_, response) = get(&gateway, "/a").await;
        assert_eq!(response.status, 504);
    }

    #[tokio::test]
    async fn test_request_timeout_keeps_finished_parts() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.push("s1:80", 200, r#"{"id":1}"#);
        forwarder.push("s2:80", 200, r#"["late"]"#);
        forwarder.delay("s2:80", Duration::from_millis(500));
        forwarder.push("s3:80", 200, r#""late""#);
        forwarder.delay("s3:80", Duration::from_millis(500));

        let mut nodes = vec![node(1, "user"), node(2, "orders"), node(3, "notes")];
        for node in &mut nodes {
            node.timeout = Duration::from_secs(1);
        }
        nodes[1].default_value = Some(DefaultValue {
            body: "[]".to_string(),
            ..empty_default()
        });
        let mut config = config(vec![api(1, "/dashboard", nodes)], vec![]);
        config.gateway.request_timeout = Some(Duration::from_millis(80));
        let gateway = gateway(config, forwarder).await;

        let started = Instant::now();
        let (_, response) = get(&gateway, "/dashboard").await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(response.status, 200);
        let value = json(&response);
        assert_eq!(value.as_object().unwrap().len(), 3);
        assert_eq!(value["user"]["id"], 1);
        assert_eq!(value["orders"], serde_json::json!([]));
        assert!(value["notes"].is_null());
    }

    #[tokio::test]
    async fn test_multi_node_aggregation() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.push("s1:80", 200, r#"{"id":1}"#);
        forwarder.push("s2:80", 200, "plain");
        forwarder.push("s3:80", 200, "");
        let gateway = gateway(
            config(
                vec![api(
                    1,
                    "/dashboard",
                    vec![node(1, "user"), node(2, "note"), node(3, "empty")],
                )],
                vec![],
            ),
            forwarder.clone(),
        )
        .await;

        let (_, response) = get(&gateway, "/dashboard").await;
        assert_eq!(response.status, 200);
        assert_eq!(
            response.headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let value = json(&response);
        assert_eq!(value.as_object().unwrap().len(), 3);
        assert_eq!(value["user"]["id"], 1);
        assert_eq!(value["note"], "plain");
        assert!(value["empty"].is_null());
        assert_eq!(forwarder.call_count(), 3);
    }

    #[tokio::test]
    async fn test_multi_node_failure_isolated() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.push("s1:80", 200, r#"{"id":1}"#);
        forwarder.push_error("s2:80", ForwardError::Io("refused".to_string()));
        let mut failing = node(2, "orders");
        failing.default_value = Some(DefaultValue {
            body: "[]".to_string(),
            ..empty_default()
        });
        let gateway = gateway(
            config(
                vec![api(1, "/dashboard", vec![node(1, "user"), failing])],
                vec![],
            ),
            forwarder,
        )
        .await;

        let (_, response) = get(&gateway, "/dashboard").await;
        assert_eq!(response.status, 200);
        let value = json(&response);
        assert_eq!(value["user"]["id"], 1);
        assert_eq!(value["orders"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_multi_node_slow_node_served_default() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.push("s1:80", 200, r#"{"id":1}"#);
        forwarder.push("s2:80", 200, r#"{"late":true}"#);
        forwarder.delay("s2:80", Duration::from_millis(300));

        let mut fast = node(1, "user");
        fast.timeout = Duration::from_millis(50);
        let mut slow = node(2, "orders");
        slow.timeout = Duration::from_millis(60);
        slow.default_value = Some(empty_default());
        let gateway = gateway(
            config(vec![api(1, "/dashboard", vec![fast, slow])], vec![]),
            forwarder,
        )
        .await;

        let (_, response) = get(&gateway, "/dashboard").await;
        let value = json(&response);
        assert_eq!(value["user"]["id"], 1);
        assert_eq!(value["orders"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.push("s1:80", 503, "");
        forwarder.push("s1:80", 200, "ok");
        let mut retried = NodeConfig::new(1);
        retried.retry = Some(RetryStrategy {
            codes: vec![503],
            max_times: 2,
            interval: Duration::from_millis(1),
        });
        let gateway = gateway(
            config(vec![api(1, "/a", vec![retried])], vec![]),
            forwarder.clone(),
        )
        .await;

        let (_, response) = get(&gateway, "/a").await;
        assert_eq!(response.status, 200);
        assert_eq!(forwarder.calls_to("s1:80").len(), 2);
        assert_eq!(gateway.metrics().get_metrics_snapshot().retries_total, 1);
    }

    #[tokio::test]
    async fn test_zero_live_servers_serves_default() {
        let forwarder = Arc::new(MockForwarder::default());
        let mut fallback = NodeConfig::new(1);
        fallback.default_value = Some(empty_default());
        let gateway = gateway(
            config(vec![api(1, "/orders/{id}", vec![fallback])], vec![]),
            forwarder.clone(),
        )
        .await;
        gateway.store().snapshot().servers[&1].mark_dead();

        let (_, response) = get(&gateway, "/orders/42").await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"{}"));
        assert_eq!(forwarder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_live_servers_without_default_is_503() {
        let forwarder = Arc::new(MockForwarder::default());
        let gateway = gateway(
            config(vec![api(1, "/a", vec![NodeConfig::new(1)])], vec![]),
            forwarder,
        )
        .await;
        gateway.store().snapshot().servers[&1].mark_dead();

        let (_, response) = get(&gateway, "/a").await;
        assert_eq!(response.status, 503);
    }

    #[tokio::test]
    async fn test_split_and_copy_rules() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.always("s1:80", 200);
        forwarder.always("s2:80", 201);
        forwarder.always("s3:80", 500);
        let routings = vec![
            RoutingConfig {
                id: 1,
                name: "split".to_string(),
                api: Some(1),
                cluster: 2,
                strategy: RoutingStrategy::Split,
                status: RoutingStatus::Up,
                condition: Some(r#"param.id == "42""#.to_string()),
                traffic_rate: 100,
            },
            RoutingConfig {
                id: 2,
                name: "shadow".to_string(),
                api: Some(1),
                cluster: 3,
                strategy: RoutingStrategy::Copy,
                status: RoutingStatus::Up,
                condition: None,
                traffic_rate: 100,
            },
        ];
        let gateway = gateway(
            config(vec![api(1, "/orders/{id}", vec![NodeConfig::new(1)])], routings),
            forwarder.clone(),
        )
        .await;

        let (_, response) = get(&gateway, "/orders/42").await;
        assert_eq!(response.status, 201);

        // the copy backend fails, the primary answer is unaffected
        let (_, response) = get(&gateway, "/orders/7").await;
        assert_eq!(response.status, 200);
        for _ in 0..50 {
            if forwarder.calls_to("s3:80").len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(forwarder.calls_to("s3:80"), vec!["/orders/7"]);
    }

    #[tokio::test]
    async fn test_config_watcher_applies_events() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.always("s2:80", 200);
        let gateway = gateway(config(vec![], vec![]), forwarder).await;

        let (tx, rx) = mpsc::channel(8);
        let watcher = gateway.spawn_config_watcher(rx);
        tx.send(ConfigEvent::PutApi(api(5, "/users/{id}", vec![NodeConfig::new(2)])))
            .await
            .unwrap();
        // invalid event is logged and skipped
        tx.send(ConfigEvent::PutApi(api(6, "no-slash", vec![NodeConfig::new(2)])))
            .await
            .unwrap();
        drop(tx);
        watcher.await.unwrap();

        assert_eq!(gateway.store().version(), 1);
        let (_, response) = get(&gateway, "/users/9").await;
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_request_id_and_client_ip_attr() {
        let forwarder = Arc::new(MockForwarder::default());
        forwarder.always("s1:80", 200);
        let gateway = gateway(
            config(vec![api(1, "/a", vec![NodeConfig::new(1)])], vec![]),
            forwarder,
        )
        .await;

        let (ctx, response) = get(&gateway, "/a").await;
        assert_eq!(
            response.headers.get(X_REQUEST_ID_HEADER).unwrap(),
            ctx.request_id.as_str()
        );
        assert_eq!(ctx.attr(crate::context::ATTR_CLIENT_REAL_IP), Some("10.1.1.1"));
        gateway.shutdown();
    }
}
