/// Fan-in of multi-node results into one JSON response
use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Shared per-request collector of node bodies
///
/// Every node task calls [`MultiContext::complete_part`] exactly once; the
/// request task waits in [`MultiContext::join`].
#[derive(Debug)]
pub struct MultiContext {
    parts: Mutex<BTreeMap<String, Bytes>>,
    headers: Mutex<HeaderMap>,
    remaining: AtomicUsize,
    done: Notify,
}

impl MultiContext {
    pub fn new(expected: usize) -> Self {
        Self {
            parts: Mutex::new(BTreeMap::new()),
            headers: Mutex::new(HeaderMap::new()),
            remaining: AtomicUsize::new(expected),
            done: Notify::new(),
        }
    }

    /// Store the body of one node under its attribute name
    pub fn complete_part(&self, attr_name: &str, body: Bytes) {
        self.parts.lock().insert(attr_name.to_string(), body);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.done.notify_one();
        }
    }

    /// Merge response headers of a node into the combined response
    pub fn add_headers(&self, headers: HeaderMap) {
        let mut merged = self.headers.lock();
        for (name, value) in headers.iter() {
            merged.append(name.clone(), value.clone());
        }
    }

    pub fn headers(&self) -> HeaderMap {
        self.headers.lock().clone()
    }

    /// Nodes that have not completed yet
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Wait until every node completed or `limit` passed
    ///
    /// Returns whether all nodes completed.
    pub async fn join(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while self.remaining() > 0 {
            if tokio::time::timeout_at(deadline, self.done.notified())
                .await
                .is_err()
            {
                return self.remaining() == 0;
            }
        }
        true
    }

    /// Whether `attr_name` has been completed
    pub fn contains(&self, attr_name: &str) -> bool {
        self.parts.lock().contains_key(attr_name)
    }

    /// Copy of the parts collected so far
    pub fn parts(&self) -> BTreeMap<String, Bytes> {
        self.parts.lock().clone()
    }
}

/// Render collected parts as a JSON object keyed by attribute name
///
/// JSON bodies are embedded as values, other bodies as strings and empty
/// bodies as `null`.
pub fn render_json(parts: &BTreeMap<String, Bytes>) -> Result<Bytes, serde_json::Error> {
    let object: Map<String, Value> = parts
        .iter()
        .map(|(name, body)| (name.clone(), body_value(body)))
        .collect();
    serde_json::to_vec(&Value::Object(object)).map(Bytes::from)
}

fn body_value(body: &Bytes) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}
