//! The three security groups and the reachability lattice between them.
//!
//! Only the edge group faces the internet. Hosts accept traffic from the edge
//! and from each other; Fargate tasks accept traffic from the edge only.

use serde_json::{json, Value};

use crate::template::intrinsic::{get_att, reference};
use crate::template::{Resource, Resources, Template};

pub const EDGE_GROUP: &str = "ALBSecurityGroup";
pub const HOST_GROUP: &str = "ECSSecurityGroup";
pub const FARGATE_GROUP: &str = "FargateSecurityGroup";

const ANY_IPV4: &str = "0.0.0.0/0";
const PUBLIC_PORTS: [u16; 2] = [80, 443];

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Security group {group} is reachable from the internet through {rule}")]
    PubliclyReachable { group: String, rule: String },

    #[error("Security group {group} accepts traffic from {source_group} through {rule}")]
    UnexpectedSource {
        group: String,
        source_group: String,
        rule: String,
    },
}

#[derive(Debug, Clone)]
pub struct SecurityLayer {
    pub edge_group: String,
    pub host_group: String,
    pub fargate_group: String,
    pub resources: Resources,
}

pub fn group_id(logical_id: &str) -> Value {
    get_att(logical_id, "GroupId")
}

pub fn build_security_groups(stack_id: &str, vpc: &str) -> SecurityLayer {
    let mut resources = Resources::new();

    let public_ingress: Vec<Value> = PUBLIC_PORTS
        .iter()
        .map(|port| {
            json!({
                "CidrIp": ANY_IPV4,
                "Description": format!("Allow {} traffic from anywhere", if *port == 80 { "HTTP" } else { "HTTPS" }),
                "FromPort": port,
                "IpProtocol": "tcp",
                "ToPort": port,
            })
        })
        .collect();

    // Outbound rules towards the targets are added per service.
    resources.insert(
        EDGE_GROUP.to_string(),
        Resource::new(
            "AWS::EC2::SecurityGroup",
            json!({
                "GroupDescription": format!("{}/{}: Security group for the ALB", stack_id, EDGE_GROUP),
                "VpcId": reference(vpc),
                "SecurityGroupIngress": public_ingress,
                "SecurityGroupEgress": [{
                    "CidrIp": "255.255.255.255/32",
                    "Description": "Disallow all traffic",
                    "FromPort": 252,
                    "IpProtocol": "icmp",
                    "ToPort": 86,
                }],
            }),
        ),
    );

    for (group, description) in [
        (HOST_GROUP, "Security group for the ECS hosts"),
        (FARGATE_GROUP, "Security group for Fargate tasks"),
    ] {
        resources.insert(
            group.to_string(),
            Resource::new(
                "AWS::EC2::SecurityGroup",
                json!({
                    "GroupDescription": format!("{}/{}: {}", stack_id, group, description),
                    "VpcId": reference(vpc),
                    "SecurityGroupEgress": [{
                        "CidrIp": ANY_IPV4,
                        "Description": "Allow all outbound traffic by default",
                        "IpProtocol": "-1",
                    }],
                }),
            ),
        );
    }

    insert_all_tcp_ingress(&mut resources, HOST_GROUP, EDGE_GROUP, "Allow all TCP traffic from ALB");
    insert_all_tcp_ingress(
        &mut resources,
        HOST_GROUP,
        HOST_GROUP,
        "Allow all TCP traffic between ECS hosts",
    );
    insert_all_tcp_ingress(&mut resources, FARGATE_GROUP, EDGE_GROUP, "Allow all TCP traffic from ALB");

    tracing::debug!(stack = stack_id, "Built security layer");

    SecurityLayer {
        edge_group: EDGE_GROUP.to_string(),
        host_group: HOST_GROUP.to_string(),
        fargate_group: FARGATE_GROUP.to_string(),
        resources,
    }
}

fn insert_all_tcp_ingress(resources: &mut Resources, group: &str, source: &str, description: &str) {
    let logical_id = format!("{}From{}AllTcp", group, source);
    resources.insert(
        logical_id,
        Resource::new(
            "AWS::EC2::SecurityGroupIngress",
            json!({
                "GroupId": group_id(group),
                "SourceSecurityGroupId": group_id(source),
                "IpProtocol": "tcp",
                "FromPort": 0,
                "ToPort": 65535,
                "Description": description,
            }),
        ),
    );
}

/// Opens the edge group towards one target port range of a compute group.
pub fn edge_egress(
    edge_group: &str,
    target_group: &str,
    from_port: u16,
    to_port: u16,
    description: &str,
) -> Resource {
    Resource::new(
        "AWS::EC2::SecurityGroupEgress",
        json!({
            "GroupId": group_id(edge_group),
            "DestinationSecurityGroupId": group_id(target_group),
            "IpProtocol": "tcp",
            "FromPort": from_port,
            "ToPort": to_port,
            "Description": description,
        }),
    )
}

fn referenced_group(value: &Value) -> Option<&str> {
    value
        .get("Fn::GetAtt")
        .and_then(|attribute| attribute.get(0))
        .and_then(Value::as_str)
}

fn allowed_sources(group: &str) -> &'static [&'static str] {
    match group {
        HOST_GROUP => &[EDGE_GROUP, HOST_GROUP],
        FARGATE_GROUP => &[EDGE_GROUP],
        _ => &[],
    }
}

/// Checks the finished template against the reachability lattice: only the
/// edge group takes internet traffic, and compute groups only take traffic
/// from the sources the lattice allows.
pub fn verify_reachability(template: &Template) -> Result<(), Error> {
    for (logical_id, resource) in template.resources_of_type("AWS::EC2::SecurityGroup") {
        if logical_id == EDGE_GROUP {
            continue;
        }
        let inline_rules = resource
            .property("SecurityGroupIngress")
            .and_then(Value::as_array)
            .map(|rules| rules.as_slice())
            .unwrap_or_default();
        for rule in inline_rules {
            if rule.get("CidrIp").is_some() || rule.get("CidrIpv6").is_some() {
                return Err(Error::PubliclyReachable {
                    group: logical_id.clone(),
                    rule: rule.to_string(),
                });
            }
        }
    }

    for (logical_id, rule) in template.resources_of_type("AWS::EC2::SecurityGroupIngress") {
        let group = match rule.property("GroupId").and_then(referenced_group) {
            Some(group) => group,
            None => continue,
        };
        if group == EDGE_GROUP {
            continue;
        }

        if rule.property("CidrIp").is_some() || rule.property("CidrIpv6").is_some() {
            return Err(Error::PubliclyReachable {
                group: group.to_string(),
                rule: logical_id.clone(),
            });
        }

        let source = rule
            .property("SourceSecurityGroupId")
            .and_then(referenced_group)
            .unwrap_or("unknown");
        if !allowed_sources(group).contains(&source) {
            return Err(Error::UnexpectedSource {
                group: group.to_string(),
                source_group: source.to_string(),
                rule: logical_id.clone(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{build_security_groups, verify_reachability, Error, EDGE_GROUP, FARGATE_GROUP, HOST_GROUP};
    use crate::template::{Resource, Template};
    use serde_json::json;

    fn template() -> Template {
        let mut template = Template::new("test");
        template
            .insert_all(build_security_groups("Test", "VPC").resources)
            .unwrap();
        template
    }

    #[test]
    fn builds_exactly_three_groups() {
        assert_eq!(3, template().count_of_type("AWS::EC2::SecurityGroup"));
    }

    #[test]
    fn edge_group_accepts_http_and_https_from_anywhere() {
        let template = template();
        let ingress = template.resources[EDGE_GROUP]
            .property("SecurityGroupIngress")
            .unwrap()
            .as_array()
            .unwrap()
            .clone();

        let ports: Vec<u64> = ingress
            .iter()
            .map(|rule| rule["FromPort"].as_u64().unwrap())
            .collect();
        assert_eq!(vec![80, 443], ports);
        assert_eq!(true, ingress.iter().all(|rule| rule["CidrIp"] == "0.0.0.0/0"));
    }

    #[test]
    fn built_lattice_holds() {
        assert_eq!(Ok(()), verify_reachability(&template()));
    }

    #[test]
    fn detects_public_ingress_on_compute_group() {
        let mut template = template();
        template.resources.insert(
            "Leak".to_string(),
            Resource::new(
                "AWS::EC2::SecurityGroupIngress",
                json!({
                    "GroupId": { "Fn::GetAtt": [FARGATE_GROUP, "GroupId"] },
                    "CidrIp": "0.0.0.0/0",
                    "IpProtocol": "tcp",
                    "FromPort": 8080,
                    "ToPort": 8080,
                }),
            ),
        );

        assert_eq!(
            Err(Error::PubliclyReachable {
                group: FARGATE_GROUP.to_string(),
                rule: "Leak".to_string(),
            }),
            verify_reachability(&template)
        );
    }

    #[test]
    fn detects_fargate_reachable_from_hosts() {
        let mut template = template();
        template.resources.insert(
            "HostsToTasks".to_string(),
            Resource::new(
                "AWS::EC2::SecurityGroupIngress",
                json!({
                    "GroupId": { "Fn::GetAtt": [FARGATE_GROUP, "GroupId"] },
                    "SourceSecurityGroupId": { "Fn::GetAtt": [HOST_GROUP, "GroupId"] },
                    "IpProtocol": "tcp",
                    "FromPort": 0,
                    "ToPort": 65535,
                }),
            ),
        );

        match verify_reachability(&template).err().unwrap() {
            Error::UnexpectedSource { source_group, .. } => assert_eq!(HOST_GROUP, source_group),
            _ => panic!("Expected `UnexpectedSource` error"),
        }
    }
}
