use serde_json::{json, Value};

use super::edge::dns_name;
use super::service::{service_url, ARCHITECTURE};
use crate::template::intrinsic::reference;
use crate::template::{Output, Resource, Resources};

pub const AGENT_CONFIG_PARAMETER: &str = "ECSCloudWatchParameter";

const METRICS_INTERVAL_SECONDS: u32 = 60;
const HOST_LOG_RETENTION_DAYS: u32 = 30;
const HOST_LOG_FILES: [(&str, &str); 3] = [
    ("/var/log/messages", "/var/log/messages"),
    ("/var/log/docker", "/var/log/docker"),
    ("/var/log/ecs/ecs-agent.log", "/var/log/ecs-agent"),
];

/// CloudWatch agent document for the container hosts. Static apart from the
/// cluster name used to prefix the host log groups.
pub fn agent_config(cluster_name: &str) -> Value {
    let collect_list: Vec<Value> = HOST_LOG_FILES
        .iter()
        .map(|(file_path, group_suffix)| {
            json!({
                "file_path": file_path,
                "log_group_name": format!("{}-{}", cluster_name, group_suffix),
                "log_stream_name": "{instance_id}",
                "retention_in_days": HOST_LOG_RETENTION_DAYS,
            })
        })
        .collect();

    json!({
        "agent": {
            "metrics_collection_interval": METRICS_INTERVAL_SECONDS,
            "run_as_user": "root",
        },
        "logs": {
            "logs_collected": {
                "files": { "collect_list": collect_list },
            },
        },
        "metrics": {
            "namespace": "ECS/ContainerInsights",
            "append_dimensions": {
                "AutoScalingGroupName": "${aws:AutoScalingGroupName}",
                "InstanceId": "${aws:InstanceId}",
                "InstanceType": "${aws:InstanceType}",
            },
            "metrics_collected": {
                "cpu": {
                    "measurement": ["cpu_usage_idle", "cpu_usage_iowait", "cpu_usage_user", "cpu_usage_system"],
                    "metrics_collection_interval": METRICS_INTERVAL_SECONDS,
                    "totalcpu": false,
                },
                "disk": {
                    "measurement": ["used_percent", "inodes_free"],
                    "metrics_collection_interval": METRICS_INTERVAL_SECONDS,
                    "resources": ["/"],
                },
                "mem": {
                    "measurement": ["mem_used_percent"],
                    "metrics_collection_interval": METRICS_INTERVAL_SECONDS,
                },
            },
        },
    })
}

pub fn build_agent_parameter(cluster_name: &str) -> Result<Resources, serde_json::Error> {
    let document = serde_json::to_string(&agent_config(cluster_name))?;

    let mut resources = Resources::new();
    resources.insert(
        AGENT_CONFIG_PARAMETER.to_string(),
        Resource::new(
            "AWS::SSM::Parameter",
            json!({
                "Name": format!("AmazonCloudWatch-{}-ECS", cluster_name),
                "Type": "String",
                "Value": document,
            }),
        ),
    );

    Ok(resources)
}

pub fn build_outputs(cluster: &str) -> Vec<(String, Output)> {
    vec![
        (
            String::from("LoadBalancerDNS"),
            Output {
                value: dns_name(),
                description: String::from("DNS name of the load balancer"),
            },
        ),
        (
            String::from("ProductServiceUrl"),
            Output {
                value: service_url("/products"),
                description: String::from("URL of the product service"),
            },
        ),
        (
            String::from("WebsiteServiceUrl"),
            Output {
                value: service_url("/"),
                description: String::from("URL of the website service"),
            },
        ),
        (
            String::from("ClusterName"),
            Output {
                value: reference(cluster),
                description: String::from("Name of the ECS cluster"),
            },
        ),
        (
            String::from("Architecture"),
            Output {
                value: Value::from(ARCHITECTURE),
                description: String::from("CPU architecture being used"),
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::{agent_config, build_agent_parameter, build_outputs, AGENT_CONFIG_PARAMETER};
    use serde_json::{json, Value};

    #[test]
    fn agent_config_prefixes_host_log_groups() {
        let config = agent_config("EcsRefarchDev-cluster");
        let files = config["logs"]["logs_collected"]["files"]["collect_list"]
            .as_array()
            .unwrap();

        assert_eq!(3, files.len());
        assert_eq!(json!("EcsRefarchDev-cluster-/var/log/ecs-agent"), files[2]["log_group_name"]);
        assert_eq!(true, files.iter().all(|file| file["retention_in_days"] == 30));
        assert_eq!(json!(60), config["agent"]["metrics_collection_interval"]);
    }

    #[test]
    fn parameter_holds_agent_document_as_string() {
        let resources = build_agent_parameter("EcsRefarchProd-cluster").unwrap();
        let parameter = &resources[AGENT_CONFIG_PARAMETER];

        assert_eq!(
            &json!("AmazonCloudWatch-EcsRefarchProd-cluster-ECS"),
            parameter.property("Name").unwrap()
        );
        let document: Value =
            serde_json::from_str(parameter.property("Value").unwrap().as_str().unwrap()).unwrap();
        assert_eq!(agent_config("EcsRefarchProd-cluster"), document);
    }

    #[test]
    fn outputs_include_urls_and_architecture() {
        let outputs = build_outputs("ECSCluster");
        let names: Vec<&str> = outputs.iter().map(|(name, _)| name.as_str()).collect();

        assert_eq!(
            vec!["LoadBalancerDNS", "ProductServiceUrl", "WebsiteServiceUrl", "ClusterName", "Architecture"],
            names
        );
        assert_eq!(json!("ARM64"), outputs[4].1.value);
        assert_eq!(
            json!({ "Fn::Join": ["", ["http://", { "Fn::GetAtt": ["ALB", "DNSName"] }, "/products"]] }),
            outputs[1].1.value
        );
    }
}
