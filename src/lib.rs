//! Lumen - request-dispatch core of an API gateway
//!
//! Lumen maps inbound HTTP requests to configured APIs and fans them out
//! to backend clusters, built on Cloudflare's Pingora framework:
//! - Segment trie route matching with path parameters
//! - Cluster load balancing over live servers, with health checking
//! - Split and copy routing rules with conditional expressions
//! - Per-node URL rewrite, retries and default values
//! - Concurrent multi-node dispatch aggregated into one JSON response
//! - Prometheus metrics collection

pub mod aggregate;
pub mod api;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod expr;
pub mod filter;
pub mod gateway;
pub mod health;
pub mod load_balancer;
pub mod metrics;
pub mod registry;
pub mod routes;
pub mod routing;
pub mod state;

pub use config::*;
pub use context::{DispatchRequest, GatewayResponse, RequestContext};
pub use dispatcher::{DispatchNode, Dispatcher, Plan};
pub use error::{DispatchError, ForwardError};
pub use executor::{BackendResponse, Forwarder, HttpForwarder, NodeExecutor, OutboundRequest};
pub use gateway::ApiGateway;
pub use routes::RouteTrie;
pub use state::{ConfigEvent, RoutingState, RoutingStore};
