use serde_json::{json, Value};
use std::net::Ipv4Addr;

use crate::template::intrinsic::{availability_zone, get_att, join, reference, region};
use crate::template::{Resource, Resources};

pub const ZONE_COUNT: usize = 2;
pub const SUBNET_CIDR_MASK: u8 = 24;
pub const FLOW_LOG_RETENTION_DAYS: u32 = 30;

const VPC_BASE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 0);
const VPC_CIDR_MASK: u8 = 16;

pub const VPC: &str = "VPC";
const INTERNET_GATEWAY: &str = "VPCIGW";
const GATEWAY_ATTACHMENT: &str = "VPCVPCGW";
const S3_ENDPOINT: &str = "VPCS3Endpoint";
const FLOW_LOG: &str = "VpcFlowLog";
const FLOW_LOG_GROUP: &str = "VpcFlowLogsGroup";
const FLOW_LOG_ROLE: &str = "VpcFlowLogIAMRole";
const FLOW_LOG_POLICY: &str = "VpcFlowLogIAMRoleDefaultPolicy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetKind {
    Public,
    Private,
}

impl SubnetKind {
    fn label(&self) -> &'static str {
        match self {
            SubnetKind::Public => "Public",
            SubnetKind::Private => "Private",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub kind: SubnetKind,
    pub zone: usize,
    pub logical_id: String,
    pub route_table: String,
    pub cidr: String,
}

#[derive(Debug, Clone)]
pub struct NetworkLayer {
    pub vpc: String,
    pub public_subnets: Vec<Subnet>,
    pub private_subnets: Vec<Subnet>,
    /// Public default routes; internet-facing resources must wait for them.
    pub public_routes: Vec<String>,
    pub resources: Resources,
}

impl NetworkLayer {
    pub fn public_subnet_refs(&self) -> Vec<Value> {
        self.public_subnets
            .iter()
            .map(|subnet| reference(&subnet.logical_id))
            .collect()
    }

    pub fn private_subnet_refs(&self) -> Vec<Value> {
        self.private_subnets
            .iter()
            .map(|subnet| reference(&subnet.logical_id))
            .collect()
    }
}

/// The `index`-th subnet of `mask` bits carved from the start of the VPC range.
fn subnet_cidr(index: usize, mask: u8) -> String {
    let step = 1u32 << (32 - u32::from(mask));
    let base = u32::from(VPC_BASE) + step * index as u32;
    format!("{}/{}", Ipv4Addr::from(base), mask)
}

fn name_tag(stack_id: &str, logical_id: &str) -> Value {
    json!([{ "Key": "Name", "Value": format!("{}/{}", stack_id, logical_id) }])
}

pub fn build_network(stack_id: &str) -> NetworkLayer {
    let mut resources = Resources::new();

    resources.insert(
        VPC.to_string(),
        Resource::new(
            "AWS::EC2::VPC",
            json!({
                "CidrBlock": format!("{}/{}", VPC_BASE, VPC_CIDR_MASK),
                "EnableDnsHostnames": true,
                "EnableDnsSupport": true,
                "InstanceTenancy": "default",
                "Tags": name_tag(stack_id, VPC),
            }),
        ),
    );
    resources.insert(
        INTERNET_GATEWAY.to_string(),
        Resource::new(
            "AWS::EC2::InternetGateway",
            json!({ "Tags": name_tag(stack_id, VPC) }),
        ),
    );
    resources.insert(
        GATEWAY_ATTACHMENT.to_string(),
        Resource::new(
            "AWS::EC2::VPCGatewayAttachment",
            json!({
                "VpcId": reference(VPC),
                "InternetGatewayId": reference(INTERNET_GATEWAY),
            }),
        ),
    );

    let mut public_subnets = Vec::with_capacity(ZONE_COUNT);
    let mut private_subnets = Vec::with_capacity(ZONE_COUNT);
    let mut public_routes = Vec::with_capacity(ZONE_COUNT);
    let mut cidr_index = 0;

    for kind in [SubnetKind::Public, SubnetKind::Private] {
        for zone in 0..ZONE_COUNT {
            let logical_id = format!("VPC{}Subnet{}", kind.label(), zone + 1);
            let subnet = Subnet {
                kind,
                zone,
                route_table: format!("{}RouteTable", logical_id),
                cidr: subnet_cidr(cidr_index, SUBNET_CIDR_MASK),
                logical_id,
            };
            cidr_index += 1;

            resources.insert(
                subnet.logical_id.clone(),
                Resource::new(
                    "AWS::EC2::Subnet",
                    json!({
                        "VpcId": reference(VPC),
                        "AvailabilityZone": availability_zone(zone),
                        "CidrBlock": subnet.cidr,
                        "MapPublicIpOnLaunch": kind == SubnetKind::Public,
                        "Tags": [
                            { "Key": "Name", "Value": format!("{}/{}", stack_id, subnet.logical_id) },
                            { "Key": "SubnetType", "Value": kind.label() },
                        ],
                    }),
                ),
            );
            resources.insert(
                subnet.route_table.clone(),
                Resource::new(
                    "AWS::EC2::RouteTable",
                    json!({
                        "VpcId": reference(VPC),
                        "Tags": name_tag(stack_id, &subnet.logical_id),
                    }),
                ),
            );
            resources.insert(
                format!("{}RouteTableAssociation", subnet.logical_id),
                Resource::new(
                    "AWS::EC2::SubnetRouteTableAssociation",
                    json!({
                        "RouteTableId": reference(&subnet.route_table),
                        "SubnetId": reference(&subnet.logical_id),
                    }),
                ),
            );

            match kind {
                SubnetKind::Public => {
                    let route = format!("{}DefaultRoute", subnet.logical_id);
                    resources.insert(
                        route.clone(),
                        Resource::new(
                            "AWS::EC2::Route",
                            json!({
                                "RouteTableId": reference(&subnet.route_table),
                                "DestinationCidrBlock": "0.0.0.0/0",
                                "GatewayId": reference(INTERNET_GATEWAY),
                            }),
                        )
                        .depends_on(GATEWAY_ATTACHMENT),
                    );
                    public_routes.push(route);

                    let eip = format!("{}EIP", subnet.logical_id);
                    resources.insert(
                        eip.clone(),
                        Resource::new(
                            "AWS::EC2::EIP",
                            json!({
                                "Domain": "vpc",
                                "Tags": name_tag(stack_id, &subnet.logical_id),
                            }),
                        ),
                    );
                    resources.insert(
                        nat_gateway_id(zone),
                        Resource::new(
                            "AWS::EC2::NatGateway",
                            json!({
                                "SubnetId": reference(&subnet.logical_id),
                                "AllocationId": get_att(&eip, "AllocationId"),
                                "Tags": name_tag(stack_id, &subnet.logical_id),
                            }),
                        )
                        .depends_on(format!("{}DefaultRoute", subnet.logical_id))
                        .depends_on(format!("{}RouteTableAssociation", subnet.logical_id)),
                    );
                    public_subnets.push(subnet);
                }
                SubnetKind::Private => {
                    // Egress leaves through the NAT gateway of the same zone.
                    resources.insert(
                        format!("{}DefaultRoute", subnet.logical_id),
                        Resource::new(
                            "AWS::EC2::Route",
                            json!({
                                "RouteTableId": reference(&subnet.route_table),
                                "DestinationCidrBlock": "0.0.0.0/0",
                                "NatGatewayId": reference(&nat_gateway_id(zone)),
                            }),
                        ),
                    );
                    private_subnets.push(subnet);
                }
            }
        }
    }

    let route_tables: Vec<Value> = public_subnets
        .iter()
        .chain(private_subnets.iter())
        .map(|subnet| reference(&subnet.route_table))
        .collect();
    resources.insert(
        S3_ENDPOINT.to_string(),
        Resource::new(
            "AWS::EC2::VPCEndpoint",
            json!({
                "ServiceName": join("", vec![Value::from("com.amazonaws."), region(), Value::from(".s3")]),
                "VpcEndpointType": "Gateway",
                "VpcId": reference(VPC),
                "RouteTableIds": route_tables,
            }),
        ),
    );

    insert_flow_log(&mut resources);

    tracing::debug!(
        stack = stack_id,
        subnets = public_subnets.len() + private_subnets.len(),
        "Built network layer"
    );

    NetworkLayer {
        vpc: VPC.to_string(),
        public_subnets,
        private_subnets,
        public_routes,
        resources,
    }
}

fn nat_gateway_id(zone: usize) -> String {
    format!("VPCPublicSubnet{}NATGateway", zone + 1)
}

fn insert_flow_log(resources: &mut Resources) {
    resources.insert(
        FLOW_LOG_GROUP.to_string(),
        Resource::new(
            "AWS::Logs::LogGroup",
            json!({ "RetentionInDays": FLOW_LOG_RETENTION_DAYS }),
        )
        .destroy_on_removal(),
    );
    resources.insert(
        FLOW_LOG_ROLE.to_string(),
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": {
                    "Statement": [{
                        "Action": "sts:AssumeRole",
                        "Effect": "Allow",
                        "Principal": { "Service": "vpc-flow-logs.amazonaws.com" },
                    }],
                    "Version": "2012-10-17",
                },
            }),
        ),
    );
    resources.insert(
        FLOW_LOG_POLICY.to_string(),
        Resource::new(
            "AWS::IAM::Policy",
            json!({
                "PolicyDocument": {
                    "Statement": [
                        {
                            "Action": ["logs:CreateLogStream", "logs:DescribeLogStreams", "logs:PutLogEvents"],
                            "Effect": "Allow",
                            "Resource": get_att(FLOW_LOG_GROUP, "Arn"),
                        },
                        {
                            "Action": "iam:PassRole",
                            "Effect": "Allow",
                            "Resource": get_att(FLOW_LOG_ROLE, "Arn"),
                        },
                    ],
                    "Version": "2012-10-17",
                },
                "PolicyName": FLOW_LOG_POLICY,
                "Roles": [reference(FLOW_LOG_ROLE)],
            }),
        ),
    );
    resources.insert(
        FLOW_LOG.to_string(),
        Resource::new(
            "AWS::EC2::FlowLog",
            json!({
                "ResourceId": reference(VPC),
                "ResourceType": "VPC",
                "TrafficType": "ALL",
                "LogDestinationType": "cloud-watch-logs",
                "LogGroupName": reference(FLOW_LOG_GROUP),
                "DeliverLogsPermissionArn": get_att(FLOW_LOG_ROLE, "Arn"),
            }),
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::{build_network, subnet_cidr, FLOW_LOG_GROUP};
    use crate::template::DeletionPolicy;
    use serde_json::json;

    fn count(layer: &super::NetworkLayer, resource_type: &str) -> usize {
        layer
            .resources
            .values()
            .filter(|resource| resource.resource_type == resource_type)
            .count()
    }

    #[test]
    fn two_zones_with_public_and_private_subnets() {
        let layer = build_network("Test");

        assert_eq!(1, count(&layer, "AWS::EC2::VPC"));
        assert_eq!(4, count(&layer, "AWS::EC2::Subnet"));
        assert_eq!(2, count(&layer, "AWS::EC2::NatGateway"));
        assert_eq!(1, count(&layer, "AWS::EC2::VPCEndpoint"));
        assert_eq!(2, layer.public_subnets.len());
        assert_eq!(2, layer.private_subnets.len());
    }

    #[test]
    fn subnets_are_carved_in_order() {
        assert_eq!("10.0.0.0/24", subnet_cidr(0, 24));
        assert_eq!("10.0.3.0/24", subnet_cidr(3, 24));

        let layer = build_network("Test");
        let cidrs: Vec<&str> = layer
            .public_subnets
            .iter()
            .chain(layer.private_subnets.iter())
            .map(|subnet| subnet.cidr.as_str())
            .collect();
        assert_eq!(vec!["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/24", "10.0.3.0/24"], cidrs);
    }

    #[test]
    fn private_subnets_route_through_nat_in_same_zone() {
        let layer = build_network("Test");

        for subnet in &layer.private_subnets {
            let route = &layer.resources[&format!("{}DefaultRoute", subnet.logical_id)];
            let nat_id = route.property("NatGatewayId").unwrap()["Ref"].as_str().unwrap();
            let nat = &layer.resources[nat_id];
            let nat_subnet = nat.property("SubnetId").unwrap()["Ref"].as_str().unwrap();

            let public = layer
                .public_subnets
                .iter()
                .find(|public| public.logical_id == nat_subnet)
                .unwrap();
            assert_eq!(subnet.zone, public.zone);
        }
    }

    #[test]
    fn s3_endpoint_covers_every_route_table() {
        let layer = build_network("Test");
        let endpoint = &layer.resources["VPCS3Endpoint"];

        assert_eq!(&json!("Gateway"), endpoint.property("VpcEndpointType").unwrap());
        assert_eq!(4, endpoint.property("RouteTableIds").unwrap().as_array().unwrap().len());
    }

    #[test]
    fn flow_log_group_is_destroyed_with_stack() {
        let layer = build_network("Test");
        let group = &layer.resources[FLOW_LOG_GROUP];

        assert_eq!(&json!(30), group.property("RetentionInDays").unwrap());
        assert_eq!(Some(DeletionPolicy::Delete), group.deletion_policy);
        assert_eq!(
            &json!("ALL"),
            layer.resources["VpcFlowLog"].property("TrafficType").unwrap()
        );
    }
}
