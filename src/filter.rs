/// Filter chain run around every dispatch
use log::debug;
use std::net::IpAddr;
use std::sync::Arc;

use crate::context::{DispatchRequest, GatewayResponse, RequestContext, ATTR_CLIENT_REAL_IP};

/// Result of a filter's pre hook
#[derive(Debug)]
pub enum FilterOutcome {
    /// Keep processing the request
    Continue,
    /// Stop and answer with this response
    Respond(GatewayResponse),
}

/// Hook into the request lifecycle
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs before planning
    fn pre(&self, ctx: &mut RequestContext, request: &DispatchRequest) -> FilterOutcome;

    /// Runs after the response was assembled
    fn post(&self, _ctx: &mut RequestContext, _response: &mut GatewayResponse) {}
}

/// Stores request facts other filters and rule conditions rely on
///
/// Must run first in the chain.
pub struct PrepareFilter;

impl PrepareFilter {
    /// Client address as reported by proxies in front of the gateway
    fn client_real_ip(ctx: &RequestContext, request: &DispatchRequest) -> IpAddr {
        let forwarded = request
            .header_value("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());

        forwarded
            .or_else(|| request.header_value("x-real-ip").map(str::trim))
            .and_then(|ip| ip.parse().ok())
            .unwrap_or_else(|| ctx.client_addr.ip())
    }
}

impl Filter for PrepareFilter {
    fn name(&self) -> &'static str {
        "prepare"
    }

    fn pre(&self, ctx: &mut RequestContext, request: &DispatchRequest) -> FilterOutcome {
        let ip = Self::client_real_ip(ctx, request);
        ctx.set_attr(ATTR_CLIENT_REAL_IP, ip.to_string());
        FilterOutcome::Continue
    }
}

/// Ordered list of filters
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    /// Chain holding only the prepare filter
    pub fn new() -> Self {
        Self {
            filters: vec![Arc::new(PrepareFilter)],
        }
    }

    /// Append a filter to the end of the chain
    pub fn with(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run pre hooks in order; the first response stops the chain
    pub fn pre(&self, ctx: &mut RequestContext, request: &DispatchRequest) -> Option<GatewayResponse> {
        for filter in &self.filters {
            if let FilterOutcome::Respond(response) = filter.pre(ctx, request) {
                debug!(
                    "{}: filter {} answered with status {}",
                    ctx.request_id,
                    filter.name(),
                    response.status
                );
                return Some(response);
            }
        }
        None
    }

    /// Run post hooks in reverse order
    pub fn post(&self, ctx: &mut RequestContext, response: &mut GatewayResponse) {
        for filter in self.filters.iter().rev() {
            filter.post(ctx, response);
        }
    }
}
