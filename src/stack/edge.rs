use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::security::group_id;
use super::Error;
use crate::template::intrinsic::{get_att, reference};
use crate::template::{Resource, Resources};

pub const LOAD_BALANCER: &str = "ALB";
pub const LISTENER: &str = "ALBHttpListener";
pub const LISTENER_PORT: u16 = 80;

const MIN_PRIORITY: u32 = 1;
const MAX_PRIORITY: u32 = 50_000;

#[derive(Debug, Clone)]
pub struct EdgeLayer {
    pub listener: String,
    pub resources: Resources,
}

pub fn dns_name() -> Value {
    get_att(LOAD_BALANCER, "DNSName")
}

/// One internet-facing load balancer in the public subnets with a single
/// HTTP listener answering 404 when no rule matches.
pub fn build_edge(public_subnets: Vec<Value>, public_routes: &[String], edge_group: &str) -> EdgeLayer {
    let mut resources = Resources::new();

    let mut load_balancer = Resource::new(
        "AWS::ElasticLoadBalancingV2::LoadBalancer",
        json!({
            "LoadBalancerAttributes": [{ "Key": "deletion_protection.enabled", "Value": "false" }],
            "Scheme": "internet-facing",
            "SecurityGroups": [group_id(edge_group)],
            "Subnets": public_subnets,
            "Type": "application",
        }),
    );
    for route in public_routes {
        load_balancer = load_balancer.depends_on(route.clone());
    }
    resources.insert(LOAD_BALANCER.to_string(), load_balancer);

    resources.insert(
        LISTENER.to_string(),
        Resource::new(
            "AWS::ElasticLoadBalancingV2::Listener",
            json!({
                "DefaultActions": [{
                    "FixedResponseConfig": {
                        "ContentType": "text/plain",
                        "MessageBody": "Not Found",
                        "StatusCode": "404",
                    },
                    "Type": "fixed-response",
                }],
                "LoadBalancerArn": reference(LOAD_BALANCER),
                "Port": LISTENER_PORT,
                "Protocol": "HTTP",
            }),
        ),
    );

    tracing::debug!("Built edge layer");

    EdgeLayer {
        listener: LISTENER.to_string(),
        resources,
    }
}

/// A path-based forwarding rule one service asks the listener for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerRoute {
    pub service: String,
    pub rule_id: String,
    pub priority: u32,
    pub path_patterns: Vec<String>,
    pub target_group: String,
}

/// Listener rules keyed by priority. The provider evaluates them in
/// ascending order and the first match wins.
#[derive(Debug, Default)]
pub struct ListenerRuleTable {
    routes: BTreeMap<u32, ListenerRoute>,
}

impl ListenerRuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, route: ListenerRoute) -> Result<(), Error> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&route.priority) {
            return Err(Error::ListenerPriorityOutOfRange {
                service: route.service,
                priority: route.priority,
            });
        }
        if let Some(existing) = self.routes.get(&route.priority) {
            return Err(Error::DuplicateListenerPriority {
                priority: route.priority,
                service: route.service,
                existing: existing.service.clone(),
            });
        }

        self.routes.insert(route.priority, route);
        Ok(())
    }

    /// Routes in evaluation order.
    pub fn routes(&self) -> impl Iterator<Item = &ListenerRoute> {
        self.routes.values()
    }

    pub fn render(&self, listener: &str) -> Resources {
        self.routes()
            .map(|route| {
                let rule = Resource::new(
                    "AWS::ElasticLoadBalancingV2::ListenerRule",
                    json!({
                        "Actions": [{
                            "TargetGroupArn": reference(&route.target_group),
                            "Type": "forward",
                        }],
                        "Conditions": [{
                            "Field": "path-pattern",
                            "PathPatternConfig": { "Values": route.path_patterns },
                        }],
                        "ListenerArn": reference(listener),
                        "Priority": route.priority,
                    }),
                );
                (route.rule_id.clone(), rule)
            })
            .collect()
    }
}
