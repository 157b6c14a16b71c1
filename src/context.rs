/// Per-request state shared by filters, the planner and node executors
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue};
use pingora_http::RequestHeader;
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use crate::expr::ExprContext;

/// Attribute set by the prepare filter with the resolved client address
pub const ATTR_CLIENT_REAL_IP: &str = "client_real_ip";

/// Inbound request as consumed by the dispatch core
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Request line and headers
    pub header: RequestHeader,
    /// Fully read request body
    pub body: Bytes,
}

impl DispatchRequest {
    pub fn new(header: RequestHeader, body: Bytes) -> Self {
        Self { header, body }
    }

    pub fn method(&self) -> &str {
        self.header.method.as_str()
    }

    pub fn path(&self) -> &str {
        self.header.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.header.uri.query()
    }

    /// Host header, falling back to the URI authority
    pub fn host(&self) -> Option<&str> {
        self.header_value("host")
            .or_else(|| self.header.uri.authority().map(|a| a.as_str()))
    }

    /// First value of a header, if it is valid UTF-8
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.header
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
    }

    /// Look up a query string parameter
    pub fn query_param(&self, name: &str) -> Option<Cow<'_, str>> {
        let query = self.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Look up a cookie sent by the client
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header
            .headers
            .get_all("cookie")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}

/// Response assembled by the gateway for one request
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl GatewayResponse {
    pub fn new(status: u16, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Plain text response
    pub fn plain(status: u16, body: &'static str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        Self::new(status, headers, Bytes::from_static(body.as_bytes()))
    }
}

/// Request context that carries information throughout the request lifecycle
#[derive(Debug)]
pub struct RequestContext {
    /// Request start time
    pub start_time: Instant,
    /// Client socket address
    pub client_addr: SocketAddr,
    /// Unique request ID for tracing
    pub request_id: String,
    /// Matched API, once planning succeeded
    pub api_id: Option<u64>,
    /// Final response status, once written
    pub status: Option<u16>,
    attrs: HashMap<String, String>,
    params: Vec<(String, String)>,
}

impl RequestContext {
    /// Create a new request context with a compact request ID
    pub fn new(client_addr: SocketAddr, request_counter: u64) -> Self {
        let request_id = format!(
            "req-{:016x}-{:08x}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
            request_counter
        );

        Self {
            start_time: Instant::now(),
            client_addr,
            request_id,
            api_id: None,
            status: None,
            attrs: HashMap::new(),
            params: Vec::new(),
        }
    }

    /// Context for a request whose peer address is not known yet
    pub fn unbound(request_counter: u64) -> Self {
        Self::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            request_counter,
        )
    }

    /// Get request duration
    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Set a request-scoped attribute
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(key.into(), value.into());
    }

    /// Get a request-scoped attribute
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn attrs(&self) -> &HashMap<String, String> {
        &self.attrs
    }

    /// Record a path parameter extracted by the route matcher
    pub fn add_param(&mut self, name: &str, value: &str) {
        self.params.push((name.to_string(), value.to_string()));
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Drop parameters of a previous match attempt
    pub fn clear_params(&mut self) {
        self.params.clear();
    }

    /// Client address used for load balancing
    ///
    /// Prefers the address resolved by the prepare filter.
    pub fn client_ip(&self) -> IpAddr {
        self.attr(ATTR_CLIENT_REAL_IP)
            .and_then(|ip| ip.parse().ok())
            .unwrap_or_else(|| self.client_addr.ip())
    }

    /// Load balancing key derived from the client address
    pub fn lb_key(&self) -> Vec<u8> {
        match self.client_ip() {
            IpAddr::V4(ipv4) => ipv4.octets().to_vec(),
            IpAddr::V6(ipv6) => ipv6.octets().to_vec(),
        }
    }

    /// Expression view over this context and `request`
    pub fn expr_context<'a>(&'a self, request: &'a DispatchRequest) -> ExprContext<'a> {
        ExprContext {
            request,
            params: &self.params,
            attrs: &self.attrs,
        }
    }
}

/// Immutable per-request inputs shared by concurrently running node tasks
#[derive(Debug)]
pub struct Exchange {
    pub request_id: String,
    pub request: DispatchRequest,
    pub lb_key: Vec<u8>,
    params: Vec<(String, String)>,
    attrs: HashMap<String, String>,
}

impl Exchange {
    /// Freeze the context state planning produced, together with the request
    pub fn new(ctx: &RequestContext, request: DispatchRequest) -> Self {
        Self {
            request_id: ctx.request_id.clone(),
            lb_key: ctx.lb_key(),
            params: ctx.params.clone(),
            attrs: ctx.attrs.clone(),
            request,
        }
    }

    pub fn expr_context(&self) -> ExprContext<'_> {
        ExprContext {
            request: &self.request,
            params: &self.params,
            attrs: &self.attrs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str) -> DispatchRequest {
        let mut header = RequestHeader::build("GET", path.as_bytes(), None).unwrap();
        header.insert_header("host", "api.example.com").unwrap();
        header
            .insert_header("cookie", "session=abc; theme=dark")
            .unwrap();
        DispatchRequest::new(header, Bytes::new())
    }

    #[test]
    fn test_request_accessors() {
        let req = request("/orders/42?expand=items&q=a%20b");
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/orders/42");
        assert_eq!(req.host(), Some("api.example.com"));
        assert_eq!(req.query_param("expand").as_deref(), Some("items"));
        assert_eq!(req.query_param("q").as_deref(), Some("a b"));
        assert_eq!(req.query_param("missing"), None);
        assert_eq!(req.cookie("theme"), Some("dark"));
        assert_eq!(req.cookie("nope"), None);
    }

    #[test]
    fn test_attrs_and_client_ip() {
        let mut ctx = RequestContext::new("10.0.0.1:5000".parse().unwrap(), 1);
        assert!(ctx.request_id.starts_with("req-"));
        assert_eq!(ctx.lb_key(), vec![10, 0, 0, 1]);

        ctx.set_attr(ATTR_CLIENT_REAL_IP, "192.168.1.9");
        assert_eq!(ctx.attr(ATTR_CLIENT_REAL_IP), Some("192.168.1.9"));
        assert_eq!(ctx.lb_key(), vec![192, 168, 1, 9]);

        ctx.set_attr(ATTR_CLIENT_REAL_IP, "garbage");
        assert_eq!(ctx.client_ip(), "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_exchange_freezes_params() {
        let mut ctx = RequestContext::unbound(7);
        ctx.add_param("id", "42");
        let exchange = Exchange::new(&ctx, request("/orders/42"));
        ctx.clear_params();
        assert_eq!(exchange.expr_context().param("id"), Some("42"));
    }
}
