use serde_json::{json, Value};

use super::security::group_id;
use crate::config::EnvironmentConfig;
use crate::template::intrinsic::{base64, get_att, join, managed_policy_arn, reference};
use crate::template::{Parameter, Resource, Resources};

pub const CLUSTER: &str = "ECSCluster";
pub const AUTO_SCALING_GROUP: &str = "ECSAutoScalingGroup";
pub const CAPACITY_PROVIDER: &str = "AsgCapacityProvider";
pub const CAPACITY_PROVIDER_ASSOCIATIONS: &str = "ECSClusterCapacityProviderAssociations";

const INSTANCE_ROLE: &str = "ECSRole";
const INSTANCE_PROFILE: &str = "ECSInstanceProfile";
const LAUNCH_TEMPLATE: &str = "ECSLaunchTemplate";

pub const AMI_PARAMETER: &str = "EcsOptimizedArm64Ami";
const AMI_SSM_PATH: &str = "/aws/service/ecs/optimized-ami/amazon-linux-2/arm64/recommended/image_id";

pub const ON_DEMAND_BASE_CAPACITY: u32 = 1;
pub const ON_DEMAND_PERCENTAGE_ABOVE_BASE: u32 = 25;
const MANAGED_SCALING_TARGET_CAPACITY: u32 = 100;

const INSTANCE_MANAGED_POLICIES: [&str; 3] = [
    "service-role/AmazonEC2ContainerServiceforEC2Role",
    "AmazonSSMManagedInstanceCore",
    "CloudWatchAgentServerPolicy",
];

#[derive(Debug, Clone)]
pub struct CapacityLayer {
    pub cluster: String,
    pub cluster_name: String,
    /// Services placed on the EC2 hosts must wait for this association.
    pub associations: String,
    pub ami_parameter: (String, Parameter),
    pub resources: Resources,
}

pub fn cluster_name(stack_id: &str) -> String {
    format!("{}-cluster", stack_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSize {
    pub min: u32,
    pub desired: u32,
    pub max: u32,
}

/// Desired and minimum follow the cluster size; the group may double.
pub fn group_size(config: &EnvironmentConfig) -> GroupSize {
    GroupSize {
        min: config.cluster_size,
        desired: config.cluster_size,
        max: config.cluster_size * 2,
    }
}

fn service_role(service: &str) -> Value {
    json!({
        "Statement": [{
            "Action": "sts:AssumeRole",
            "Effect": "Allow",
            "Principal": { "Service": service },
        }],
        "Version": "2012-10-17",
    })
}

pub fn build_capacity(
    stack_id: &str,
    config: &EnvironmentConfig,
    private_subnets: Vec<Value>,
    host_group: &str,
) -> CapacityLayer {
    let mut resources = Resources::new();
    let name = cluster_name(stack_id);

    resources.insert(
        CLUSTER.to_string(),
        Resource::new(
            "AWS::ECS::Cluster",
            json!({
                "ClusterName": name,
                "ClusterSettings": [{ "Name": "containerInsights", "Value": "enabled" }],
            }),
        ),
    );

    let managed_policies: Vec<Value> = INSTANCE_MANAGED_POLICIES
        .iter()
        .map(|policy| managed_policy_arn(policy))
        .collect();
    resources.insert(
        INSTANCE_ROLE.to_string(),
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": service_role("ec2.amazonaws.com"),
                "ManagedPolicyArns": managed_policies,
            }),
        ),
    );
    resources.insert(
        INSTANCE_PROFILE.to_string(),
        Resource::new(
            "AWS::IAM::InstanceProfile",
            json!({ "Roles": [reference(INSTANCE_ROLE)] }),
        ),
    );

    // Spot draining lets the agent move tasks off before the instance is reclaimed.
    let user_data = join(
        "",
        vec![
            Value::from("#!/bin/bash\necho ECS_CLUSTER="),
            reference(CLUSTER),
            Value::from(
                " >> /etc/ecs/ecs.config\nsudo iptables --insert FORWARD 1 --in-interface docker+ --destination 169.254.169.254/32 --jump DROP\nsudo service iptables save\necho ECS_AWSVPC_BLOCK_IMDS=true >> /etc/ecs/ecs.config\necho ECS_ENABLE_SPOT_INSTANCE_DRAINING=true >> /etc/ecs/ecs.config",
            ),
        ],
    );
    resources.insert(
        LAUNCH_TEMPLATE.to_string(),
        Resource::new(
            "AWS::EC2::LaunchTemplate",
            json!({
                "LaunchTemplateData": {
                    "IamInstanceProfile": { "Arn": get_att(INSTANCE_PROFILE, "Arn") },
                    "ImageId": reference(AMI_PARAMETER),
                    "InstanceType": config.instance_type,
                    "SecurityGroupIds": [group_id(host_group)],
                    "UserData": base64(user_data),
                    "MetadataOptions": { "HttpTokens": "required" },
                },
            }),
        )
        .depends_on(INSTANCE_ROLE),
    );

    let overrides: Vec<Value> = config
        .instance_type_overrides()
        .into_iter()
        .map(|instance_type| json!({ "InstanceType": instance_type }))
        .collect();

    let mut distribution = json!({
        "OnDemandBaseCapacity": ON_DEMAND_BASE_CAPACITY,
        "OnDemandPercentageAboveBaseCapacity": ON_DEMAND_PERCENTAGE_ABOVE_BASE,
        "SpotAllocationStrategy": "capacity-optimized",
    });
    if let Some(price) = &config.spot_max_price {
        distribution["SpotMaxPrice"] = Value::from(price.clone());
    }

    let size = group_size(config);
    resources.insert(
        AUTO_SCALING_GROUP.to_string(),
        Resource::new(
            "AWS::AutoScaling::AutoScalingGroup",
            json!({
                "MinSize": size.min.to_string(),
                "MaxSize": size.max.to_string(),
                "DesiredCapacity": size.desired.to_string(),
                "VPCZoneIdentifier": private_subnets,
                "NewInstancesProtectedFromScaleIn": true,
                "MixedInstancesPolicy": {
                    "InstancesDistribution": distribution,
                    "LaunchTemplate": {
                        "LaunchTemplateSpecification": {
                            "LaunchTemplateId": reference(LAUNCH_TEMPLATE),
                            "Version": get_att(LAUNCH_TEMPLATE, "DefaultVersionNumber"),
                        },
                        "Overrides": overrides,
                    },
                },
            }),
        )
        .with_update_policy(json!({
            "AutoScalingScheduledAction": { "IgnoreUnmodifiedGroupSizeProperties": true },
        })),
    );

    resources.insert(
        CAPACITY_PROVIDER.to_string(),
        Resource::new(
            "AWS::ECS::CapacityProvider",
            json!({
                "AutoScalingGroupProvider": {
                    "AutoScalingGroupArn": reference(AUTO_SCALING_GROUP),
                    "ManagedScaling": {
                        "Status": "ENABLED",
                        "TargetCapacity": MANAGED_SCALING_TARGET_CAPACITY,
                    },
                    "ManagedTerminationProtection": "ENABLED",
                },
            }),
        ),
    );
    resources.insert(
        CAPACITY_PROVIDER_ASSOCIATIONS.to_string(),
        Resource::new(
            "AWS::ECS::ClusterCapacityProviderAssociations",
            json!({
                "Cluster": reference(CLUSTER),
                "CapacityProviders": [reference(CAPACITY_PROVIDER), "FARGATE", "FARGATE_SPOT"],
                "DefaultCapacityProviderStrategy": [],
            }),
        ),
    );

    let ami_parameter = Parameter {
        parameter_type: String::from("AWS::SSM::Parameter::Value<AWS::EC2::Image::Id>"),
        default: String::from(AMI_SSM_PATH),
        description: Some(String::from("ECS-optimized Amazon Linux 2 AMI for ARM64 hosts")),
    };

    tracing::debug!(
        stack = stack_id,
        instance_type = %config.instance_type,
        min = size.min,
        max = size.max,
        "Built capacity layer"
    );

    CapacityLayer {
        cluster: CLUSTER.to_string(),
        cluster_name: name,
        associations: CAPACITY_PROVIDER_ASSOCIATIONS.to_string(),
        ami_parameter: (AMI_PARAMETER.to_string(), ami_parameter),
        resources,
    }
}

#[cfg(test)]
mod tests {
    use super::{build_capacity, group_size, GroupSize, AUTO_SCALING_GROUP, CAPACITY_PROVIDER, CLUSTER};
    use crate::config::{EnvironmentConfig, EnvironmentType};
    use serde_json::{json, Value};

    fn overrides(config: &EnvironmentConfig) -> Vec<String> {
        let layer = build_capacity("Test", config, vec![], "Hosts");
        layer.resources[AUTO_SCALING_GROUP]
            .property("MixedInstancesPolicy")
            .unwrap()["LaunchTemplate"]["Overrides"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["InstanceType"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn development_group_size() {
        let config = EnvironmentConfig::builtin(EnvironmentType::Development);
        assert_eq!(GroupSize { min: 2, desired: 2, max: 4 }, group_size(&config));

        let layer = build_capacity("Test", &config, vec![], "Hosts");
        let group = &layer.resources[AUTO_SCALING_GROUP];
        assert_eq!(&json!("2"), group.property("MinSize").unwrap());
        assert_eq!(&json!("2"), group.property("DesiredCapacity").unwrap());
        assert_eq!(&json!("4"), group.property("MaxSize").unwrap());
    }

    #[test]
    fn production_group_size() {
        let config = EnvironmentConfig::builtin(EnvironmentType::Production);
        assert_eq!(GroupSize { min: 4, desired: 4, max: 8 }, group_size(&config));
    }

    #[test]
    fn overrides_start_with_configured_type() {
        for environment in EnvironmentType::ALL {
            let config = EnvironmentConfig::builtin(environment);
            let types = overrides(&config);
            assert_eq!(config.instance_type, types[0]);
            assert_eq!(vec!["c6g.large", "r6g.large"], types[1..].to_vec());
        }
    }

    #[test]
    fn spot_alternatives_are_configurable() {
        let mut config = EnvironmentConfig::builtin(EnvironmentType::Development);
        config.spot_instance_types = vec![String::from("c7g.large")];
        config.spot_max_price = None;

        assert_eq!(vec!["t4g.medium", "c7g.large"], overrides(&config));

        let layer = build_capacity("Test", &config, vec![], "Hosts");
        let distribution = &layer.resources[AUTO_SCALING_GROUP]
            .property("MixedInstancesPolicy")
            .unwrap()["InstancesDistribution"];
        assert_eq!(Value::Null, distribution["SpotMaxPrice"]);
        assert_eq!(json!(1), distribution["OnDemandBaseCapacity"]);
        assert_eq!(json!(25), distribution["OnDemandPercentageAboveBaseCapacity"]);
        assert_eq!(json!("capacity-optimized"), distribution["SpotAllocationStrategy"]);
    }

    #[test]
    fn capacity_provider_protects_and_drains() {
        let config = EnvironmentConfig::builtin(EnvironmentType::Development);
        let layer = build_capacity("EcsRefarchDev", &config, vec![], "Hosts");

        let provider = layer.resources[CAPACITY_PROVIDER]
            .property("AutoScalingGroupProvider")
            .unwrap();
        assert_eq!(json!("ENABLED"), provider["ManagedTerminationProtection"]);

        let user_data = serde_json::to_string(
            &layer.resources["ECSLaunchTemplate"].property("LaunchTemplateData").unwrap()["UserData"],
        )
        .unwrap();
        assert_eq!(true, user_data.contains("ECS_ENABLE_SPOT_INSTANCE_DRAINING=true"));

        assert_eq!("EcsRefarchDev-cluster", layer.cluster_name);
        assert_eq!(
            &json!("EcsRefarchDev-cluster"),
            layer.resources[CLUSTER].property("ClusterName").unwrap()
        );
    }
}
