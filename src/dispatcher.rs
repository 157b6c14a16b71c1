/// Dispatch planning: API match, server selection and routing rules
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName};
use log::debug;
use std::sync::Arc;

use crate::api::{ApiNode, ApiRuntime};
use crate::config::RoutingStrategy;
use crate::context::{DispatchRequest, RequestContext};
use crate::error::DispatchError;
use crate::executor::BackendResponse;
use crate::registry::Server;
use crate::state::{RoutingState, RoutingStore};

/// Headers dropped from node responses merged into an aggregated response
pub const MULTI_RESULTS_REMOVE_HEADERS: [HeaderName; 5] = [
    header::CONTENT_LENGTH,
    header::CONTENT_TYPE,
    header::DATE,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
];

/// Hop-by-hop headers never relayed from a backend
pub const HOP_HEADERS: [HeaderName; 3] = [
    header::CONTENT_LENGTH,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
];

/// Per-request, per-node dispatch descriptor
#[derive(Debug)]
pub struct DispatchNode {
    /// Node definition
    pub node: ApiNode,
    /// Cluster used for selection and retries
    pub cluster: u64,
    /// Primary destination
    pub dest: Option<Arc<Server>>,
    /// Destination receiving a copy of the request
    pub copy_to: Option<Arc<Server>>,
    /// Last backend response
    pub response: Option<BackendResponse>,
    /// Last transport or selection error
    pub error: Option<DispatchError>,
    /// Number of forwarded attempts
    pub attempts: u32,
}

/// What a node contributes to the final response
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub from_default: bool,
}

impl NodeOutput {
    /// Output made of the node's default value
    ///
    /// A node forced to its default without one configured contributes an
    /// empty `200`.
    pub fn default_for(node: &ApiNode) -> Self {
        let Some(default) = &node.default_value else {
            return Self {
                status: 200,
                headers: HeaderMap::new(),
                body: Bytes::new(),
                from_default: true,
            };
        };

        let mut headers = HeaderMap::with_capacity(default.headers.len() + default.cookies.len());
        for (name, value) in &default.headers {
            headers.append(name.clone(), value.clone());
        }
        for cookie in &default.cookies {
            headers.append(header::SET_COOKIE, cookie.clone());
        }

        Self {
            status: default.status,
            headers,
            body: default.body.clone(),
            from_default: true,
        }
    }
}

impl DispatchNode {
    pub fn new(node: ApiNode) -> Self {
        Self {
            cluster: node.cluster,
            node,
            dest: None,
            copy_to: None,
            response: None,
            error: None,
            attempts: 0,
        }
    }

    /// Status of the last backend response
    pub fn status(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.status)
    }

    /// Transport failure or error status
    pub fn has_error(&self) -> bool {
        self.error.is_some() || self.status().is_some_and(|status| status >= 400)
    }

    /// Whether the default value replaces the backend response
    pub fn uses_default(&self) -> bool {
        self.node.use_default || (self.has_error() && self.node.default_value.is_some())
    }

    /// Error surfaced to the caller, if the node failed without a fallback
    pub fn failure(&self) -> Option<DispatchError> {
        if self.uses_default() {
            return None;
        }
        match (&self.error, self.status()) {
            (Some(error), _) => Some(error.clone()),
            (None, Some(status)) if status >= 400 => Some(DispatchError::BackendStatus(status)),
            _ => None,
        }
    }

    /// Final contribution of this node
    ///
    /// `aggregated` strips headers that only make sense for a single body.
    pub fn output(&self, aggregated: bool) -> NodeOutput {
        if self.uses_default() {
            return NodeOutput::default_for(&self.node);
        }

        match &self.response {
            Some(response) => {
                let mut headers = response.headers.clone();
                let removed: &[HeaderName] = if aggregated {
                    &MULTI_RESULTS_REMOVE_HEADERS
                } else {
                    &HOP_HEADERS
                };
                for name in removed {
                    headers.remove(name);
                }
                NodeOutput {
                    status: response.status,
                    headers,
                    body: response.body.clone(),
                    from_default: false,
                }
            }
            None => NodeOutput {
                status: self
                    .error
                    .as_ref()
                    .map_or(502, DispatchError::status_code),
                headers: HeaderMap::new(),
                body: Bytes::new(),
                from_default: false,
            },
        }
    }
}

/// Matched API and its per-node descriptors
///
/// Owns the snapshot it was planned against; retries and copies select
/// servers from the same snapshot.
pub struct Plan {
    pub state: Arc<RoutingState>,
    pub api: Arc<ApiRuntime>,
    /// Empty when the API is forced to its default values
    pub nodes: Vec<DispatchNode>,
    /// Routing rules whose condition failed to evaluate
    pub rule_errors: usize,
}

impl Plan {
    /// API serves its default values without calling any backend
    pub fn is_forced_default(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Turns a request into a [`Plan`] against the current routing state
pub struct Dispatcher {
    store: Arc<RoutingStore>,
}

impl Dispatcher {
    pub fn new(store: Arc<RoutingStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RoutingStore> {
        &self.store
    }

    /// Match the request to an API and build one descriptor per node
    ///
    /// Path parameters of the match are stored into `ctx`. Returns `None`
    /// when no API matches.
    pub fn plan(&self, ctx: &mut RequestContext, request: &DispatchRequest) -> Option<Plan> {
        let state = self.store.snapshot();

        ctx.clear_params();
        let api = state
            .routes
            .find(request.path(), |name, value| ctx.add_param(name, value))
            .and_then(|id| state.apis.get(&id))
            .filter(|api| api.matches(request))
            .cloned();

        let Some(api) = api else {
            ctx.clear_params();
            debug!(
                "{}: no api matches {} {}",
                ctx.request_id,
                request.method(),
                request.path()
            );
            return None;
        };

        ctx.api_id = Some(api.id);

        if api.use_default {
            debug!(
                "{}: match api {}, and use default force",
                ctx.request_id, api.name
            );
            return Some(Plan {
                state,
                api,
                nodes: Vec::new(),
                rule_errors: 0,
            });
        }

        let key = ctx.lb_key();
        let mut rule_errors = 0;
        let mut nodes = Vec::with_capacity(api.nodes.len());
        for node in &api.nodes {
            let mut dn = DispatchNode::new(node.clone());
            dn.dest = state.select_server(node.cluster, &key).ok();
            rule_errors += Self::adjust_by_routing(&state, &api, &mut dn, ctx, request, &key);

            debug!(
                "{}: api {} node {} dispatched to {}",
                ctx.request_id,
                api.name,
                node.index,
                dn.dest.as_ref().map_or("none", |s| s.address.as_str())
            );
            nodes.push(dn);
        }

        Some(Plan {
            state,
            api,
            nodes,
            rule_errors,
        })
    }

    /// Apply the first matching routing rule to a descriptor
    fn adjust_by_routing(
        state: &RoutingState,
        api: &ApiRuntime,
        dn: &mut DispatchNode,
        ctx: &RequestContext,
        request: &DispatchRequest,
        key: &[u8],
    ) -> usize {
        let expr_ctx = ctx.expr_context(request);
        let (rule, errors) = state
            .routings
            .first_match(api.id, &expr_ctx, &ctx.request_id);

        if let Some(rule) = rule {
            let server = state.select_server(rule.cluster, key).ok();
            match rule.strategy {
                RoutingStrategy::Split => {
                    dn.cluster = rule.cluster;
                    dn.dest = server;
                }
                RoutingStrategy::Copy => dn.copy_to = server,
            }
        }
        errors
    }
}
