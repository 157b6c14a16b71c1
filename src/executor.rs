/// Node execution: forwarding, retries, default values and copy traffic
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method};
use log::{debug, info, warn};
use pingora_timeout::{sleep, timeout};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::ApiNode;
use crate::context::Exchange;
use crate::dispatcher::{DispatchNode, HOP_HEADERS};
use crate::error::{DispatchError, ForwardError};
use crate::metrics::MetricsCollector;
use crate::registry::Server;
use crate::state::RoutingState;

/// Response returned by a backend
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Request as sent to one backend server
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path and query string
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    /// Clone the inbound request for `node`, targeting `dest`
    ///
    /// A rewrite template that renders non-empty replaces path and query,
    /// and the host becomes the destination address.
    pub fn build(exchange: &Exchange, node: &ApiNode, dest: &Server) -> Self {
        let request = &exchange.request;
        let mut uri = match request.header.uri.path_and_query() {
            Some(pq) => pq.as_str().to_string(),
            None => request.path().to_string(),
        };

        let mut headers = request.header.headers.clone();
        for name in &HOP_HEADERS {
            headers.remove(name);
        }
        if let Ok(value) = HeaderValue::from_str(&exchange.request_id) {
            headers.insert("x-request-id", value);
        }

        if let Some(rewrite) = &node.rewrite {
            let rendered = rewrite.render(&exchange.expr_context());
            if !rendered.is_empty() {
                debug!(
                    "{}: dispatch node {} rewrite url with {} to {}",
                    exchange.request_id,
                    node.index,
                    rewrite.source(),
                    rendered
                );
                uri = rendered;
                if let Ok(host) = HeaderValue::from_str(&dest.address) {
                    headers.insert(header::HOST, host);
                }
            }
        }

        Self {
            method: request.header.method.clone(),
            uri,
            headers,
            body: request.body.clone(),
        }
    }
}

/// Sends one request to one server
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(
        &self,
        server: &Server,
        request: OutboundRequest,
    ) -> Result<BackendResponse, ForwardError>;
}

/// HTTP/1.1 forwarder backed by a pooled reqwest client
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

fn forward_error(e: reqwest::Error) -> ForwardError {
    if e.is_timeout() {
        ForwardError::Timeout
    } else {
        ForwardError::Io(e.to_string())
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        server: &Server,
        request: OutboundRequest,
    ) -> Result<BackendResponse, ForwardError> {
        let url = format!("http://{}{}", server.address, request.uri);
        let response = self
            .client
            .request(request.method, url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(forward_error)?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(forward_error)?;

        Ok(BackendResponse {
            status,
            headers,
            body,
        })
    }
}

/// Executes dispatch descriptors against backends
#[derive(Clone)]
pub struct NodeExecutor {
    forwarder: Arc<dyn Forwarder>,
    metrics: Arc<MetricsCollector>,
}

impl NodeExecutor {
    pub fn new(forwarder: Arc<dyn Forwarder>, metrics: Arc<MetricsCollector>) -> Self {
        Self { forwarder, metrics }
    }

    /// Run one descriptor to completion
    ///
    /// Fills in response or error; retries re-select servers of the
    /// descriptor's cluster from `state`.
    pub async fn execute(&self, state: &RoutingState, exchange: &Arc<Exchange>, dn: &mut DispatchNode) {
        let request_id = &exchange.request_id;

        if dn.node.use_default {
            debug!(
                "{}: dispatch node {} use default force",
                request_id, dn.node.index
            );
            self.metrics.record_default_fallback();
            return;
        }

        if let Some(copy_to) = dn.copy_to.take() {
            self.spawn_copy(exchange.clone(), dn.node.clone(), copy_to);
        }

        loop {
            let Some(dest) = dn.dest.clone() else {
                warn!(
                    "{}: dispatch node {} has no live server in cluster {}",
                    request_id, dn.node.index, dn.cluster
                );
                self.metrics.record_no_live_server();
                dn.response = None;
                dn.error = Some(DispatchError::NoLiveServer {
                    cluster: dn.cluster,
                });
                break;
            };

            let request = OutboundRequest::build(exchange, &dn.node, &dest);
            dn.attempts += 1;
            match self.forward_once(&dest, request, dn.node.timeout).await {
                Ok(response) => {
                    dn.error = None;
                    dn.response = Some(response);
                }
                Err(e) => {
                    warn!(
                        "{}: dispatch node {} to {} failed: {}",
                        request_id, dn.node.index, dest.address, e
                    );
                    dn.response = None;
                    dn.error = Some(e.into());
                }
            }

            if !dn.has_error() {
                break;
            }
            if dn.attempts > dn.node.max_retries() || !dn.node.should_retry(dn.status()) {
                break;
            }

            let interval = dn.node.retry.as_ref().map_or(Duration::ZERO, |r| r.interval);
            debug!(
                "{}: dispatch node {} retry {} after {:?}",
                request_id, dn.node.index, dn.attempts, interval
            );
            self.metrics.record_retry();
            if !interval.is_zero() {
                sleep(interval).await;
            }
            dn.dest = state.select_server(dn.cluster, &exchange.lb_key).ok();
        }

        if dn.uses_default() {
            info!(
                "{}: dispatch node {} falls back to its default value",
                request_id, dn.node.index
            );
            self.metrics.record_default_fallback();
        }
    }

    /// Forward once, bounded by `limit`, accounting server stats and metrics
    async fn forward_once(
        &self,
        server: &Server,
        request: OutboundRequest,
        limit: Duration,
    ) -> Result<BackendResponse, ForwardError> {
        self.metrics.record_upstream_request();
        let mut guard = server.begin_request();
        let started = Instant::now();

        let result = match timeout(limit, self.forwarder.forward(server, request)).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout),
        };

        self.metrics.record_upstream_duration(started.elapsed());
        if !matches!(&result, Ok(response) if response.status < 400) {
            guard.fail();
            self.metrics.record_upstream_error();
        }
        result
    }

    /// Send a copy of the request to `to` in the background
    ///
    /// The outcome is logged and counted only.
    fn spawn_copy(&self, exchange: Arc<Exchange>, node: ApiNode, to: Arc<Server>) {
        let executor = self.clone();
        tokio::spawn(async move {
            let request = OutboundRequest::build(&exchange, &node, &to);
            let result = executor.forward_once(&to, request, node.timeout).await;
            match result {
                Ok(response) => {
                    executor.metrics.record_copy(response.status < 400);
                    debug!(
                        "{}: copy of node {} to {} returned {}",
                        exchange.request_id, node.index, to.address, response.status
                    );
                }
                Err(e) => {
                    executor.metrics.record_copy(false);
                    warn!(
                        "{}: copy of node {} to {} failed: {}",
                        exchange.request_id, node.index, to.address, e
                    );
                }
            }
        });
    }
}
