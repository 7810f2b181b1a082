//! Per-service resources: roles, log group, task definition, target group,
//! listener route, ECS service and task-count auto scaling.

use serde_json::{json, Value};

use super::edge::{dns_name, ListenerRoute};
use super::security::{edge_egress, group_id};
use super::Error;
use crate::config::EnvironmentConfig;
use crate::template::intrinsic::{get_att, join, managed_policy_arn, reference, region, sub};
use crate::template::{Resource, Resources};

pub const SAMPLE_IMAGE: &str = "public.ecr.aws/aws-containers/amazon-ecs-sample:latest";
pub const ARCHITECTURE: &str = "ARM64";
pub const LOG_RETENTION_DAYS: u32 = 30;

pub const SCALE_IN_COOLDOWN_SECONDS: u32 = 300;
pub const SCALE_OUT_COOLDOWN_SECONDS: u32 = 60;
pub const DEREGISTRATION_DELAY_SECONDS: u32 = 30;

const EPHEMERAL_PORT_RANGE: (u16, u16) = (32768, 65535);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchType {
    Fargate,
    Ec2,
}

impl LaunchType {
    fn compatibility(&self) -> &'static str {
        match self {
            LaunchType::Fargate => "FARGATE",
            LaunchType::Ec2 => "EC2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    AwsVpc,
    Bridge,
}

impl NetworkMode {
    fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::AwsVpc => "awsvpc",
            NetworkMode::Bridge => "bridge",
        }
    }

    /// Tasks with their own interface register by IP; bridged tasks by instance.
    fn target_type(&self) -> &'static str {
        match self {
            NetworkMode::AwsVpc => "ip",
            NetworkMode::Bridge => "instance",
        }
    }
}

/// Container liveness check run by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHealthCheck {
    pub command: String,
    pub interval_seconds: u32,
    pub timeout_seconds: u32,
    pub retries: u32,
    pub start_period_seconds: u32,
}

impl ContainerHealthCheck {
    pub fn curl(url: &str) -> Self {
        Self {
            command: format!("curl -f {} || exit 1", url),
            interval_seconds: 30,
            timeout_seconds: 5,
            retries: 3,
            start_period_seconds: 60,
        }
    }
}

/// Load balancer health check, independent of the container one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHealthCheck {
    pub path: String,
    pub interval_seconds: u32,
    pub timeout_seconds: u32,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl TargetHealthCheck {
    pub fn http(path: &str) -> Self {
        Self {
            path: path.to_string(),
            interval_seconds: 30,
            timeout_seconds: 5,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskSizing {
    /// Task-level CPU units and memory (MiB).
    Task { cpu: u32, memory: u32 },
    /// Container-level CPU units and soft memory reservation (MiB).
    Container { cpu: u32, memory_reservation: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEnv {
    Literal(String),
    Region,
    ProductServiceUrl,
}

impl ContainerEnv {
    fn render(&self) -> Value {
        match self {
            ContainerEnv::Literal(value) => Value::from(value.clone()),
            ContainerEnv::Region => region(),
            ContainerEnv::ProductServiceUrl => service_url("/products"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Fargate capacity providers and their weights.
    Fargate { strategy: Vec<(String, u32)> },
    /// EC2 hosts matching `constraint`, spread over each field in order.
    Ec2 { constraint: String, spread: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    /// Prefix of every logical id this service owns.
    pub logical_prefix: String,
    pub launch_type: LaunchType,
    pub cpu_architecture: String,
    pub network_mode: NetworkMode,
    pub image: String,
    pub container_port: u16,
    /// `Some(0)`, or `None` in bridge mode, asks for a dynamic host port.
    pub host_port: Option<u16>,
    pub sizing: TaskSizing,
    pub container_health_check: ContainerHealthCheck,
    pub health_check: TargetHealthCheck,
    pub path_patterns: Vec<String>,
    pub listener_priority: u32,
    pub desired_count: u32,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub cpu_target_percent: u32,
    pub memory_target_percent: Option<u32>,
    pub environment: Vec<(String, ContainerEnv)>,
    pub placement: Placement,
}

impl ServiceSpec {
    /// Fargate service sized by the environment.
    pub fn product(config: &EnvironmentConfig) -> Self {
        Self {
            name: String::from("product-service"),
            logical_prefix: String::from("Product"),
            launch_type: LaunchType::Fargate,
            cpu_architecture: String::from(ARCHITECTURE),
            network_mode: NetworkMode::AwsVpc,
            image: String::from(SAMPLE_IMAGE),
            container_port: 8080,
            host_port: None,
            sizing: TaskSizing::Task {
                cpu: config.fargate_task_cpu,
                memory: config.fargate_task_memory,
            },
            container_health_check: ContainerHealthCheck::curl("http://localhost:8080/health"),
            health_check: TargetHealthCheck::http("/health"),
            path_patterns: vec![String::from("/products"), String::from("/products/*")],
            listener_priority: 10,
            desired_count: 2,
            min_capacity: 2,
            max_capacity: 10,
            cpu_target_percent: 70,
            memory_target_percent: Some(80),
            environment: vec![
                (String::from("AWS_REGION"), ContainerEnv::Region),
                (String::from("ARCHITECTURE"), ContainerEnv::Literal(String::from(ARCHITECTURE))),
            ],
            placement: Placement::Fargate {
                strategy: vec![(String::from("FARGATE_SPOT"), 2), (String::from("FARGATE"), 1)],
            },
        }
    }

    /// Bridge-mode service on the Graviton hosts with a fixed reservation.
    pub fn website() -> Self {
        Self {
            name: String::from("website-service"),
            logical_prefix: String::from("Website"),
            launch_type: LaunchType::Ec2,
            cpu_architecture: String::from(ARCHITECTURE),
            network_mode: NetworkMode::Bridge,
            image: String::from(SAMPLE_IMAGE),
            container_port: 80,
            host_port: Some(0),
            sizing: TaskSizing::Container {
                cpu: 256,
                memory_reservation: 256,
            },
            container_health_check: ContainerHealthCheck::curl("http://localhost/"),
            health_check: TargetHealthCheck::http("/"),
            path_patterns: vec![String::from("/")],
            listener_priority: 1,
            desired_count: 2,
            min_capacity: 2,
            max_capacity: 10,
            cpu_target_percent: 70,
            memory_target_percent: None,
            environment: vec![
                (String::from("PRODUCT_SERVICE_URL"), ContainerEnv::ProductServiceUrl),
                (String::from("AWS_REGION"), ContainerEnv::Region),
                (String::from("ARCHITECTURE"), ContainerEnv::Literal(String::from(ARCHITECTURE))),
            ],
            placement: Placement::Ec2 {
                constraint: String::from("attribute:ecs.cpu-architecture == arm64"),
                spread: vec![
                    String::from("instanceId"),
                    String::from("attribute:ecs.availability-zone"),
                ],
            },
        }
    }

    fn invalid(&self, field: &str, message: String) -> Error {
        Error::InvalidServiceSpec {
            service: self.name.clone(),
            field: field.to_string(),
            message,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.min_capacity == 0 {
            return Err(self.invalid("min_capacity", String::from("must be at least 1")));
        }
        if self.min_capacity > self.max_capacity {
            return Err(self.invalid(
                "max_capacity",
                format!("{} is below min_capacity {}", self.max_capacity, self.min_capacity),
            ));
        }
        if !(self.min_capacity..=self.max_capacity).contains(&self.desired_count) {
            return Err(self.invalid(
                "desired_count",
                format!(
                    "{} is outside [{}, {}]",
                    self.desired_count, self.min_capacity, self.max_capacity
                ),
            ));
        }
        if !(1..=100).contains(&self.cpu_target_percent) {
            return Err(self.invalid(
                "cpu_target_percent",
                format!("{} is not a percentage", self.cpu_target_percent),
            ));
        }
        if let Some(memory) = self.memory_target_percent {
            if !(1..=100).contains(&memory) {
                return Err(self.invalid(
                    "memory_target_percent",
                    format!("{} is not a percentage", memory),
                ));
            }
        }
        if self.path_patterns.is_empty() {
            return Err(self.invalid("path_patterns", String::from("at least one pattern is required")));
        }
        if self.container_port == 0 {
            return Err(self.invalid("container_port", String::from("must not be 0")));
        }
        if !self.health_check.path.starts_with('/') {
            return Err(self.invalid(
                "health_check.path",
                format!("`{}` must start with `/`", self.health_check.path),
            ));
        }
        match (&self.launch_type, &self.network_mode, &self.sizing, &self.placement) {
            (LaunchType::Fargate, NetworkMode::AwsVpc, TaskSizing::Task { .. }, Placement::Fargate { .. }) => {}
            (LaunchType::Ec2, NetworkMode::Bridge, _, Placement::Ec2 { .. }) => {}
            (LaunchType::Fargate, ..) => {
                return Err(self.invalid(
                    "launch_type",
                    String::from("Fargate services need awsvpc networking, task sizing and a Fargate placement"),
                ))
            }
            (LaunchType::Ec2, ..) => {
                return Err(self.invalid(
                    "network_mode",
                    String::from("EC2 services need bridge networking and an EC2 placement"),
                ))
            }
        }
        if let (NetworkMode::AwsVpc, Some(port)) = (&self.network_mode, self.host_port) {
            if port != self.container_port {
                return Err(self.invalid(
                    "host_port",
                    format!("{} must equal container_port {} in awsvpc mode", port, self.container_port),
                ));
            }
        }

        Ok(())
    }

    /// Host port the container is published on. Bridge mode without an
    /// explicit port gets a dynamic one.
    fn published_host_port(&self) -> Option<u16> {
        match (self.network_mode, self.host_port) {
            (NetworkMode::Bridge, None) => Some(0),
            (_, host_port) => host_port,
        }
    }

    fn id(&self, suffix: &str) -> String {
        format!("{}{}", self.logical_prefix, suffix)
    }

    pub fn service_id(&self) -> String {
        self.id("Service")
    }

    pub fn target_group_id(&self) -> String {
        self.id("TargetGroup")
    }

    pub fn rule_id(&self) -> String {
        self.id("Rule")
    }

    pub fn log_group_id(&self) -> String {
        self.id("ServiceLogGroup")
    }

    pub fn route(&self) -> ListenerRoute {
        ListenerRoute {
            service: self.name.clone(),
            rule_id: self.rule_id(),
            priority: self.listener_priority,
            path_patterns: self.path_patterns.clone(),
            target_group: self.target_group_id(),
        }
    }
}

pub fn service_url(path: &str) -> Value {
    join("", vec![Value::from("http://"), dns_name(), Value::from(path)])
}

/// Logical ids of the shared resources a service plugs into.
#[derive(Debug, Clone)]
pub struct ServiceContext<'a> {
    pub stack_id: &'a str,
    pub vpc: &'a str,
    pub cluster: &'a str,
    pub private_subnets: Vec<Value>,
    pub edge_group: &'a str,
    /// Group the service's tasks or hosts run in.
    pub task_group: &'a str,
    /// Cluster capacity association every service waits for.
    pub host_capacity: &'a str,
}

fn task_assume_role() -> Value {
    json!({
        "Statement": [{
            "Action": "sts:AssumeRole",
            "Effect": "Allow",
            "Principal": { "Service": "ecs-tasks.amazonaws.com" },
        }],
        "Version": "2012-10-17",
    })
}

fn container_definition(spec: &ServiceSpec) -> Value {
    let mut port_mapping = json!({ "ContainerPort": spec.container_port, "Protocol": "tcp" });
    if let Some(host_port) = spec.published_host_port() {
        port_mapping["HostPort"] = Value::from(host_port);
    }

    let mut environment: Vec<Value> = spec
        .environment
        .iter()
        .map(|(name, value)| json!({ "Name": name, "Value": value.render() }))
        .collect();
    environment.sort_by(|a, b| a["Name"].as_str().cmp(&b["Name"].as_str()));

    let check = &spec.container_health_check;
    let mut container = json!({
        "Name": spec.name,
        "Image": spec.image,
        "Essential": true,
        "PortMappings": [port_mapping],
        "HealthCheck": {
            "Command": ["CMD-SHELL", check.command],
            "Interval": check.interval_seconds,
            "Timeout": check.timeout_seconds,
            "Retries": check.retries,
            "StartPeriod": check.start_period_seconds,
        },
        "LogConfiguration": {
            "LogDriver": "awslogs",
            "Options": {
                "awslogs-group": reference(&spec.log_group_id()),
                "awslogs-stream-prefix": spec.name,
                "awslogs-region": region(),
            },
        },
        "Environment": environment,
    });
    if let TaskSizing::Container { cpu, memory_reservation } = spec.sizing {
        container["Cpu"] = Value::from(cpu);
        container["MemoryReservation"] = Value::from(memory_reservation);
    }

    container
}

fn scaling_policy(spec: &ServiceSpec, target: &str, metric: &str, percent: u32) -> Resource {
    Resource::new(
        "AWS::ApplicationAutoScaling::ScalingPolicy",
        json!({
            "PolicyName": format!("{}{}", spec.logical_prefix, metric),
            "PolicyType": "TargetTrackingScaling",
            "ScalingTargetId": reference(target),
            "TargetTrackingScalingPolicyConfiguration": {
                "PredefinedMetricSpecification": {
                    "PredefinedMetricType": format!("ECSServiceAverage{}", metric),
                },
                "ScaleInCooldown": SCALE_IN_COOLDOWN_SECONDS,
                "ScaleOutCooldown": SCALE_OUT_COOLDOWN_SECONDS,
                "TargetValue": percent,
            },
        }),
    )
}

pub fn build_service(spec: &ServiceSpec, context: &ServiceContext<'_>) -> Result<Resources, Error> {
    spec.validate()?;

    let mut resources = Resources::new();
    let execution_role = spec.id("TaskExecutionRole");
    let task_role = spec.id("TaskRole");
    let task_role_policy = spec.id("TaskRoleDefaultPolicy");
    let log_group = spec.log_group_id();
    let task_definition = spec.id("TaskDefinition");
    let target_group = spec.target_group_id();
    let service = spec.service_id();
    let scalable_target = spec.id("ScalableTarget");

    // Pulls the image and writes logs on the task's behalf.
    resources.insert(
        execution_role.clone(),
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": task_assume_role(),
                "ManagedPolicyArns": [managed_policy_arn("service-role/AmazonECSTaskExecutionRolePolicy")],
            }),
        ),
    );

    // What the application itself may call.
    resources.insert(
        task_role.clone(),
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": task_assume_role(),
                "ManagedPolicyArns": [managed_policy_arn("AmazonSSMReadOnlyAccess")],
            }),
        ),
    );
    resources.insert(
        task_role_policy.clone(),
        Resource::new(
            "AWS::IAM::Policy",
            json!({
                "PolicyDocument": {
                    "Statement": [{
                        "Action": ["xray:PutTelemetryRecords", "xray:PutTraceSegments"],
                        "Effect": "Allow",
                        "Resource": "*",
                    }],
                    "Version": "2012-10-17",
                },
                "PolicyName": task_role_policy,
                "Roles": [reference(&task_role)],
            }),
        ),
    );

    resources.insert(
        log_group.clone(),
        Resource::new(
            "AWS::Logs::LogGroup",
            json!({ "RetentionInDays": LOG_RETENTION_DAYS }),
        )
        .destroy_on_removal(),
    );

    let mut task = json!({
        "ContainerDefinitions": [container_definition(spec)],
        "ExecutionRoleArn": get_att(&execution_role, "Arn"),
        "Family": format!("{}{}", context.stack_id, task_definition),
        "NetworkMode": spec.network_mode.as_str(),
        "RequiresCompatibilities": [spec.launch_type.compatibility()],
        "RuntimePlatform": {
            "CpuArchitecture": spec.cpu_architecture,
            "OperatingSystemFamily": "LINUX",
        },
        "TaskRoleArn": get_att(&task_role, "Arn"),
    });
    if let TaskSizing::Task { cpu, memory } = spec.sizing {
        task["Cpu"] = Value::from(cpu.to_string());
        task["Memory"] = Value::from(memory.to_string());
    }
    resources.insert(task_definition.clone(), Resource::new("AWS::ECS::TaskDefinition", task));

    let health = &spec.health_check;
    resources.insert(
        target_group.clone(),
        Resource::new(
            "AWS::ElasticLoadBalancingV2::TargetGroup",
            json!({
                "HealthCheckIntervalSeconds": health.interval_seconds,
                "HealthCheckPath": health.path,
                "HealthCheckTimeoutSeconds": health.timeout_seconds,
                "HealthyThresholdCount": health.healthy_threshold,
                "UnhealthyThresholdCount": health.unhealthy_threshold,
                "Port": spec.container_port,
                "Protocol": "HTTP",
                "TargetGroupAttributes": [
                    { "Key": "deregistration_delay.timeout_seconds", "Value": DEREGISTRATION_DELAY_SECONDS.to_string() },
                    { "Key": "stickiness.enabled", "Value": "false" },
                ],
                "TargetType": spec.network_mode.target_type(),
                "VpcId": reference(context.vpc),
            }),
        ),
    );

    let (from_port, to_port) = match spec.published_host_port() {
        Some(0) => EPHEMERAL_PORT_RANGE,
        Some(port) => (port, port),
        None => (spec.container_port, spec.container_port),
    };
    resources.insert(
        spec.id("AlbEgress"),
        edge_egress(
            context.edge_group,
            context.task_group,
            from_port,
            to_port,
            &format!("Load balancer to {}", spec.name),
        ),
    );

    let mut properties = json!({
        "Cluster": reference(context.cluster),
        "TaskDefinition": reference(&task_definition),
        "DesiredCount": spec.desired_count,
        "DeploymentConfiguration": {
            "DeploymentCircuitBreaker": { "Enable": true, "Rollback": true },
            "MaximumPercent": 200,
            "MinimumHealthyPercent": 50,
        },
        "DeploymentController": { "Type": "ECS" },
        "EnableECSManagedTags": true,
        "PropagateTags": "SERVICE",
        "HealthCheckGracePeriodSeconds": spec.container_health_check.start_period_seconds,
        "LoadBalancers": [{
            "ContainerName": spec.name,
            "ContainerPort": spec.container_port,
            "TargetGroupArn": reference(&target_group),
        }],
    });
    match &spec.placement {
        Placement::Fargate { strategy } => {
            properties["NetworkConfiguration"] = json!({
                "AwsvpcConfiguration": {
                    "AssignPublicIp": "DISABLED",
                    "SecurityGroups": [group_id(context.task_group)],
                    "Subnets": context.private_subnets,
                },
            });
            properties["PlatformVersion"] = Value::from("LATEST");
            properties["CapacityProviderStrategy"] = strategy
                .iter()
                .map(|(provider, weight)| json!({ "CapacityProvider": provider, "Weight": weight }))
                .collect();
        }
        Placement::Ec2 { constraint, spread } => {
            properties["LaunchType"] = Value::from(spec.launch_type.compatibility());
            properties["PlacementConstraints"] = json!([{ "Type": "memberOf", "Expression": constraint }]);
            properties["PlacementStrategies"] = spread
                .iter()
                .map(|field| json!({ "Type": "spread", "Field": field }))
                .collect();
        }
    }
    // Both the host capacity provider and the Fargate providers are attached
    // to the cluster by the association.
    let ecs_service = Resource::new("AWS::ECS::Service", properties)
        .depends_on(context.host_capacity)
        .depends_on(spec.rule_id())
        .depends_on(task_role_policy);
    resources.insert(service.clone(), ecs_service);

    resources.insert(
        scalable_target.clone(),
        Resource::new(
            "AWS::ApplicationAutoScaling::ScalableTarget",
            json!({
                "MaxCapacity": spec.max_capacity,
                "MinCapacity": spec.min_capacity,
                "ResourceId": join("", vec![
                    Value::from("service/"),
                    reference(context.cluster),
                    Value::from("/"),
                    get_att(&service, "Name"),
                ]),
                "RoleARN": sub("arn:${AWS::Partition}:iam::${AWS::AccountId}:role/aws-service-role/ecs.application-autoscaling.amazonaws.com/AWSServiceRoleForApplicationAutoScaling_ECSService"),
                "ScalableDimension": "ecs:service:DesiredCount",
                "ServiceNamespace": "ecs",
            }),
        ),
    );
    resources.insert(
        spec.id("CpuScaling"),
        scaling_policy(spec, &scalable_target, "CPUUtilization", spec.cpu_target_percent),
    );
    if let Some(percent) = spec.memory_target_percent {
        resources.insert(
            spec.id("MemoryScaling"),
            scaling_policy(spec, &scalable_target, "MemoryUtilization", percent),
        );
    }

    tracing::debug!(
        service = %spec.name,
        launch_type = spec.launch_type.compatibility(),
        priority = spec.listener_priority,
        resources = resources.len(),
        "Built service"
    );

    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::{build_service, NetworkMode, ServiceContext, ServiceSpec};
    use crate::config::{EnvironmentConfig, EnvironmentType};
    use crate::stack::Error;
    use crate::template::Resources;
    use serde_json::{json, Value};

    fn context(task_group: &'static str) -> ServiceContext<'static> {
        ServiceContext {
            stack_id: "Test",
            vpc: "VPC",
            cluster: "ECSCluster",
            private_subnets: vec![json!({ "Ref": "Private1" }), json!({ "Ref": "Private2" })],
            edge_group: "ALBSecurityGroup",
            task_group,
            host_capacity: "Associations",
        }
    }

    fn product() -> Resources {
        let config = EnvironmentConfig::builtin(EnvironmentType::Development);
        build_service(&ServiceSpec::product(&config), &context("FargateSecurityGroup")).unwrap()
    }

    fn website() -> Resources {
        build_service(&ServiceSpec::website(), &context("ECSSecurityGroup")).unwrap()
    }

    fn property<'a>(built: &'a Resources, id: &str, name: &str) -> &'a Value {
        built[id].property(name).unwrap()
    }

    #[test]
    fn fargate_task_follows_environment_sizing() {
        let built = product();

        assert_eq!(&json!("256"), property(&built, "ProductTaskDefinition", "Cpu"));
        assert_eq!(&json!("512"), property(&built, "ProductTaskDefinition", "Memory"));
        assert_eq!(
            &json!({ "CpuArchitecture": "ARM64", "OperatingSystemFamily": "LINUX" }),
            property(&built, "ProductTaskDefinition", "RuntimePlatform")
        );
        assert_eq!(
            &json!(["FARGATE"]),
            property(&built, "ProductTaskDefinition", "RequiresCompatibilities")
        );
    }

    #[test]
    fn ec2_task_reserves_fixed_container_resources() {
        let built = website();
        let container = &property(&built, "WebsiteTaskDefinition", "ContainerDefinitions")[0];

        assert_eq!(json!(256), container["Cpu"]);
        assert_eq!(json!(256), container["MemoryReservation"]);
        assert_eq!(json!(0), container["PortMappings"][0]["HostPort"]);
        assert_eq!(None, built["WebsiteTaskDefinition"].property("Cpu"));
        assert_eq!(
            &json!("bridge"),
            property(&built, "WebsiteTaskDefinition", "NetworkMode")
        );
    }

    #[test]
    fn container_and_target_health_checks() {
        let built = product();
        let container = &property(&built, "ProductTaskDefinition", "ContainerDefinitions")[0];

        assert_eq!(
            json!({
                "Command": ["CMD-SHELL", "curl -f http://localhost:8080/health || exit 1"],
                "Interval": 30,
                "Timeout": 5,
                "Retries": 3,
                "StartPeriod": 60,
            }),
            container["HealthCheck"]
        );
        assert_eq!(&json!("/health"), property(&built, "ProductTargetGroup", "HealthCheckPath"));
        assert_eq!(&json!("ip"), property(&built, "ProductTargetGroup", "TargetType"));
        assert_eq!(
            &json!({ "Key": "deregistration_delay.timeout_seconds", "Value": "30" }),
            &property(&built, "ProductTargetGroup", "TargetGroupAttributes")[0]
        );
    }

    #[test]
    fn services_roll_back_failed_deployments() {
        for (built, service) in [(product(), "ProductService"), (website(), "WebsiteService")] {
            let service = property(&built, service, "DeploymentConfiguration");
            assert_eq!(
                json!({ "Enable": true, "Rollback": true }),
                service["DeploymentCircuitBreaker"]
            );
        }
    }

    #[test]
    fn scaling_cooldowns_are_asymmetric() {
        let built = product();
        let cpu = property(&built, "ProductCpuScaling", "TargetTrackingScalingPolicyConfiguration");
        let memory = property(&built, "ProductMemoryScaling", "TargetTrackingScalingPolicyConfiguration");

        assert_eq!(json!(300), cpu["ScaleInCooldown"]);
        assert_eq!(json!(60), cpu["ScaleOutCooldown"]);
        assert_eq!(json!(70), cpu["TargetValue"]);
        assert_eq!(json!(80), memory["TargetValue"]);
        assert_eq!(&json!(2), property(&built, "ProductScalableTarget", "MinCapacity"));
        assert_eq!(&json!(10), property(&built, "ProductScalableTarget", "MaxCapacity"));

        assert_eq!(false, website().contains_key("WebsiteMemoryScaling"));
    }

    #[test]
    fn website_is_pinned_to_arm64_hosts_and_spread() {
        let built = website();

        assert_eq!(
            &json!([{ "Type": "memberOf", "Expression": "attribute:ecs.cpu-architecture == arm64" }]),
            property(&built, "WebsiteService", "PlacementConstraints")
        );
        assert_eq!(
            &json!([
                { "Type": "spread", "Field": "instanceId" },
                { "Type": "spread", "Field": "attribute:ecs.availability-zone" }
            ]),
            property(&built, "WebsiteService", "PlacementStrategies")
        );
        assert_eq!(&json!("EC2"), property(&built, "WebsiteService", "LaunchType"));
    }

    #[test]
    fn product_runs_on_fargate_spot_first() {
        let built = product();

        assert_eq!(
            &json!([
                { "CapacityProvider": "FARGATE_SPOT", "Weight": 2 },
                { "CapacityProvider": "FARGATE", "Weight": 1 }
            ]),
            property(&built, "ProductService", "CapacityProviderStrategy")
        );
        assert_eq!(
            json!("DISABLED"),
            property(&built, "ProductService", "NetworkConfiguration")["AwsvpcConfiguration"]["AssignPublicIp"]
        );
    }

    #[test]
    fn edge_egress_matches_target_ports() {
        let product = product();
        let website = website();

        assert_eq!(&json!(8080), property(&product, "ProductAlbEgress", "FromPort"));
        assert_eq!(&json!(32768), property(&website, "WebsiteAlbEgress", "FromPort"));
        assert_eq!(&json!(65535), property(&website, "WebsiteAlbEgress", "ToPort"));
    }

    #[test]
    fn task_role_is_scoped_to_tracing() {
        let built = product();
        let statement = &property(&built, "ProductTaskRoleDefaultPolicy", "PolicyDocument")["Statement"][0];

        assert_eq!(json!(["xray:PutTelemetryRecords", "xray:PutTraceSegments"]), statement["Action"]);
        assert_eq!(2, built.values().filter(|r| r.resource_type == "AWS::IAM::Role").count());
    }

    #[test]
    fn rejects_inconsistent_capacity_bounds() {
        let mut spec = ServiceSpec::website();
        spec.desired_count = 12;

        match build_service(&spec, &context("ECSSecurityGroup")).err().unwrap() {
            Error::InvalidServiceSpec { field, .. } => assert_eq!("desired_count", field),
            _ => panic!("Expected `InvalidServiceSpec` error"),
        }

        let mut spec = ServiceSpec::website();
        spec.min_capacity = 0;
        assert_eq!(true, spec.validate().is_err());
    }

    #[test]
    fn rejects_fargate_in_bridge_mode() {
        let config = EnvironmentConfig::builtin(EnvironmentType::Production);
        let mut spec = ServiceSpec::product(&config);
        spec.network_mode = NetworkMode::Bridge;

        assert_eq!(true, spec.validate().is_err());
    }

    #[test]
    fn rejects_ec2_service_in_awsvpc_mode() {
        let mut spec = ServiceSpec::website();
        spec.network_mode = NetworkMode::AwsVpc;
        spec.host_port = None;

        match build_service(&spec, &context("ECSSecurityGroup")).err().unwrap() {
            Error::InvalidServiceSpec { field, .. } => assert_eq!("network_mode", field),
            _ => panic!("Expected `InvalidServiceSpec` error"),
        }
    }

    #[test]
    fn rejects_awsvpc_host_port_mismatch() {
        let config = EnvironmentConfig::builtin(EnvironmentType::Development);
        let mut spec = ServiceSpec::product(&config);
        spec.host_port = Some(80);

        match spec.validate().err().unwrap() {
            Error::InvalidServiceSpec { field, .. } => assert_eq!("host_port", field),
            _ => panic!("Expected `InvalidServiceSpec` error"),
        }
    }

    #[test]
    fn bridge_without_host_port_is_dynamic() {
        let mut spec = ServiceSpec::website();
        spec.host_port = None;
        let built = build_service(&spec, &context("ECSSecurityGroup")).unwrap();

        let container = &property(&built, "WebsiteTaskDefinition", "ContainerDefinitions")[0];
        assert_eq!(json!(0), container["PortMappings"][0]["HostPort"]);
        assert_eq!(&json!(32768), property(&built, "WebsiteAlbEgress", "FromPort"));
        assert_eq!(&json!(65535), property(&built, "WebsiteAlbEgress", "ToPort"));
    }
}
