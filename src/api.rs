/// Compiled API definitions
use anyhow::{anyhow, Result};
use bytes::Bytes;
use http::{HeaderName, HeaderValue};
use regex::Regex;
use std::time::Duration;

use crate::config::{ApiConfig, ApiStatus, DefaultValue, NodeConfig, RetryStrategy};
use crate::context::DispatchRequest;
use crate::expr::Template;
use crate::routes::glob_to_regex;

/// Default value with headers parsed once
#[derive(Debug, Clone)]
pub struct DefaultPayload {
    pub status: u16,
    pub body: Bytes,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub cookies: Vec<HeaderValue>,
}

impl DefaultPayload {
    fn new(config: &DefaultValue) -> Result<Self> {
        let headers = config
            .headers
            .iter()
            .map(|h| {
                let name = HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(|e| anyhow!("Invalid default header name '{}': {}", h.name, e))?;
                let value = HeaderValue::from_str(&h.value)
                    .map_err(|e| anyhow!("Invalid default header value for '{}': {}", h.name, e))?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>>>()?;

        let cookies = config
            .cookies
            .iter()
            .map(|c| {
                HeaderValue::from_str(c).map_err(|e| anyhow!("Invalid default cookie '{}': {}", c, e))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            status: config.status,
            body: Bytes::from(config.body.clone()),
            headers,
            cookies,
        })
    }
}

/// One backend call of an API
#[derive(Debug, Clone)]
pub struct ApiNode {
    /// Position within the API
    pub index: usize,
    /// Target cluster
    pub cluster: u64,
    /// Aggregation key
    pub attr_name: String,
    /// Compiled URL rewrite
    pub rewrite: Option<Template>,
    /// Retry policy
    pub retry: Option<RetryStrategy>,
    /// Fallback response
    pub default_value: Option<DefaultPayload>,
    /// Always serve the default value
    pub use_default: bool,
    /// Per-call timeout
    pub timeout: Duration,
}

impl ApiNode {
    fn new(index: usize, config: &NodeConfig) -> Result<Self> {
        let rewrite = config
            .url_rewrite
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(Template::compile)
            .transpose()?;
        let default_value = config
            .default_value
            .as_ref()
            .map(DefaultPayload::new)
            .transpose()?;

        Ok(Self {
            index,
            cluster: config.cluster,
            attr_name: config.attr_name.clone().unwrap_or_default(),
            rewrite,
            retry: config.retry.clone(),
            default_value,
            use_default: config.use_default,
            timeout: config.timeout,
        })
    }

    /// Worst-case time this node may take, retries included
    pub fn max_duration(&self) -> Duration {
        match &self.retry {
            Some(retry) => {
                self.timeout * (retry.max_times + 1) + retry.interval * retry.max_times
            }
            None => self.timeout,
        }
    }

    /// Whether `status` qualifies for another attempt
    pub fn should_retry(&self, status: Option<u16>) -> bool {
        let Some(retry) = &self.retry else {
            return false;
        };
        match status {
            Some(status) => retry.codes.is_empty() || retry.codes.contains(&status),
            None => true,
        }
    }

    /// Retry bound; zero without a strategy
    pub fn max_retries(&self) -> u32 {
        self.retry.as_ref().map_or(0, |r| r.max_times)
    }
}

/// Compiled API definition
#[derive(Debug)]
pub struct ApiRuntime {
    pub id: u64,
    pub name: String,
    pub path: String,
    pub status: ApiStatus,
    pub use_default: bool,
    pub nodes: Vec<ApiNode>,
    methods: Option<Vec<String>>,
    host_regex: Option<Regex>,
}

impl ApiRuntime {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        config.validate()?;

        let host_regex = config
            .host
            .as_deref()
            .map(|host| {
                Regex::new(&glob_to_regex(&host.to_ascii_lowercase()))
                    .map_err(|e| anyhow!("Invalid host pattern '{}': {}", host, e))
            })
            .transpose()?;

        let nodes = config
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| {
                ApiNode::new(index, node)
                    .map_err(|e| anyhow!("API '{}' node {}: {}", config.name, index, e))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            path: config.path.clone(),
            status: config.status,
            use_default: config.use_default,
            nodes,
            methods: config.methods.clone(),
            host_regex,
        })
    }

    /// Secondary predicate checked after the path matched
    pub fn matches(&self, req: &DispatchRequest) -> bool {
        if self.status == ApiStatus::Down {
            return false;
        }

        if let Some(methods) = &self.methods {
            let method = req.method();
            if !methods.iter().any(|m| m == "*" || m.eq_ignore_ascii_case(method)) {
                return false;
            }
        }

        if let Some(host_regex) = &self.host_regex {
            let host = req.host().map(|h| h.split(':').next().unwrap_or(h));
            match host {
                Some(host) if host_regex.is_match(&host.to_ascii_lowercase()) => {}
                _ => return false,
            }
        }

        true
    }

    pub fn is_multi(&self) -> bool {
        self.nodes.len() > 1
    }

    /// Upper bound for joining every node of this API
    pub fn max_duration(&self) -> Duration {
        self.nodes
            .iter()
            .map(ApiNode::max_duration)
            .max()
            .unwrap_or_default()
    }
}
