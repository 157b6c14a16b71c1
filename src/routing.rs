/// Dynamic traffic rules (split / copy)
use anyhow::{anyhow, Result};
use log::{debug, warn};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{RoutingConfig, RoutingStatus, RoutingStrategy};
use crate::error::DispatchError;
use crate::expr::{Condition, ExprContext};

/// Compiled routing rule
#[derive(Debug)]
pub struct RoutingRule {
    pub id: u64,
    pub name: String,
    /// Target API, all APIs when `None`
    pub api: Option<u64>,
    /// Cluster receiving the matched traffic
    pub cluster: u64,
    pub strategy: RoutingStrategy,
    pub status: RoutingStatus,
    /// Percentage of matching requests the rule applies to
    pub traffic_rate: u8,
    condition: Option<Condition>,
}

impl RoutingRule {
    pub fn new(config: &RoutingConfig) -> Result<Self> {
        config.validate()?;
        let condition = config
            .condition
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(Condition::compile)
            .transpose()
            .map_err(|e| anyhow!("Routing '{}': {}", config.name, e))?;

        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            api: config.api,
            cluster: config.cluster,
            strategy: config.strategy,
            status: config.status,
            traffic_rate: config.traffic_rate,
            condition,
        })
    }

    pub fn is_up(&self) -> bool {
        self.status == RoutingStatus::Up
    }

    pub fn targets(&self, api: u64) -> bool {
        self.api.map_or(true, |target| target == api)
    }

    /// Evaluate the match condition against a request
    pub fn matches(&self, ctx: &ExprContext<'_>) -> Result<bool, DispatchError> {
        let Some(condition) = &self.condition else {
            return Ok(true);
        };
        condition
            .eval(ctx)
            .map_err(|e| DispatchError::RuleEvaluation {
                rule: self.id,
                reason: format!("{} in '{}'", e, condition.source()),
            })
    }

    /// Sample the traffic rate
    fn admits(&self, rng: &mut impl Rng) -> bool {
        match self.traffic_rate {
            0 => false,
            rate if rate >= 100 => true,
            rate => rng.gen_range(0..100u8) < rate,
        }
    }
}

/// Set of rules ordered by ascending id
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    rules: BTreeMap<u64, Arc<RoutingRule>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a rule
    pub fn put(&mut self, rule: RoutingRule) {
        self.rules.insert(rule.id, Arc::new(rule));
    }

    pub fn remove(&mut self, id: u64) -> Option<Arc<RoutingRule>> {
        self.rules.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First enabled rule (lowest id) for `api` that matches the request
    ///
    /// A rule whose condition fails to evaluate counts as not matching.
    /// The second value is the number of such failures.
    pub fn first_match(
        &self,
        api: u64,
        ctx: &ExprContext<'_>,
        request_id: &str,
    ) -> (Option<Arc<RoutingRule>>, usize) {
        let mut errors = 0;
        let mut rng = rand::thread_rng();
        for rule in self.rules.values() {
            if !rule.is_up() || !rule.targets(api) {
                continue;
            }

            match rule.matches(ctx) {
                Ok(true) if rule.admits(&mut rng) => {
                    debug!(
                        "{}: match routing '{}', {:?} traffic to cluster {}",
                        request_id, rule.name, rule.strategy, rule.cluster
                    );
                    return (Some(rule.clone()), errors);
                }
                Ok(_) => {}
                Err(e) => {
                    errors += 1;
                    warn!("{}: {}", request_id, e);
                }
            }
        }
        (None, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DispatchRequest;
    use bytes::Bytes;
    use pingora_http::RequestHeader;
    use std::collections::HashMap;

    fn rule(id: u64, api: Option<u64>, condition: Option<&str>) -> RoutingConfig {
        RoutingConfig {
            id,
            name: format!("rule-{}", id),
            api,
            cluster: 100 + id,
            strategy: RoutingStrategy::Split,
            status: RoutingStatus::Up,
            condition: condition.map(str::to_string),
            traffic_rate: 100,
        }
    }

    fn table(configs: Vec<RoutingConfig>) -> RoutingTable {
        let mut table = RoutingTable::new();
        for config in configs {
            table.put(RoutingRule::new(&config).unwrap());
        }
        table
    }

    fn first(table: &RoutingTable, api: u64, canary: Option<&[u8]>) -> (Option<u64>, usize) {
        let mut header = RequestHeader::build("GET", b"/", None).unwrap();
        if let Some(value) = canary {
            header
                .insert_header("x-canary", http::HeaderValue::from_bytes(value).unwrap())
                .unwrap();
        }
        let request = DispatchRequest::new(header, Bytes::new());
        let attrs = HashMap::new();
        let ctx = ExprContext {
            request: &request,
            params: &[],
            attrs: &attrs,
        };
        let (rule, errors) = table.first_match(api, &ctx, "req-test");
        (rule.map(|r| r.id), errors)
    }

    #[test]
    fn test_first_match_by_ascending_id() {
        let table = table(vec![
            rule(30, None, None),
            rule(10, Some(1), Some(r#"header.x-canary == "1""#)),
            rule(20, Some(1), None),
        ]);

        assert_eq!(first(&table, 1, Some(b"1")), (Some(10), 0));
        assert_eq!(first(&table, 1, None), (Some(20), 0));
        assert_eq!(first(&table, 2, None), (Some(30), 0));
    }

    #[test]
    fn test_disabled_and_zero_rate_rules_skipped() {
        let mut down = rule(1, None, None);
        down.status = RoutingStatus::Down;
        let mut closed = rule(2, None, None);
        closed.traffic_rate = 0;
        let table = table(vec![down, closed, rule(3, None, None)]);

        assert_eq!(first(&table, 1, None), (Some(3), 0));
    }

    #[test]
    fn test_evaluation_error_is_no_match() {
        let table = table(vec![
            rule(1, None, Some(r#"header.x-canary == "1""#)),
            rule(2, None, None),
        ]);
        assert_eq!(first(&table, 1, Some(b"\xff")), (Some(2), 1));
    }

    #[test]
    fn test_no_match() {
        let table = table(vec![rule(1, Some(9), None)]);
        assert_eq!(first(&table, 1, None), (None, 0));
        assert!(RoutingTable::new().is_empty());
    }

    #[test]
    fn test_traffic_rate_is_a_percentage() {
        let mut rng = rand::thread_rng();
        for rate in [1u8, 20, 50, 90] {
            let mut config = rule(1, None, None);
            config.traffic_rate = rate;
            let rule = RoutingRule::new(&config).unwrap();

            let draws = 100_000;
            let admitted = (0..draws).filter(|_| rule.admits(&mut rng)).count();
            let share = admitted as f64 * 100.0 / draws as f64;
            assert!(
                (share - rate as f64).abs() < 1.0,
                "rate {} admitted {:.2}%",
                rate,
                share
            );
        }
    }

    #[test]
    fn test_invalid_condition_rejected() {
        assert!(RoutingRule::new(&rule(1, None, Some("header.x =="))).is_err());
    }
}
