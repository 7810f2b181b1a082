//! Topology builder: turns a stack identity and an environment config into a
//! complete template.
//!
//! Layers are built top-down, each one only referencing logical ids handed
//! out by the layers above it:
//!
//! | Layer | Builder |
//! |-------|---------|
//! | network | [`network::build_network`] |
//! | security | [`security::build_security_groups`] |
//! | edge | [`edge::build_edge`] |
//! | compute | [`capacity::build_capacity`], [`service::build_service`] |
//! | observability | [`observability::build_agent_parameter`], [`observability::build_outputs`] |
//!
//! Every validation happens before the template is assembled, so a failing
//! build never yields a partial template.

pub mod capacity;
pub mod edge;
pub mod network;
pub mod observability;
pub mod security;
pub mod service;

use validator::Validate;

use crate::config::{self, EnvironmentConfig, StackIdentity};
use crate::template::{self, apply_tags, Template};
use edge::ListenerRuleTable;
use service::{ServiceContext, ServiceSpec};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Invalid environment {environment}: {message}")]
    InvalidEnvironment {
        environment: String,
        message: String,
    },

    #[error("Invalid service {service}: {field}: {message}")]
    InvalidServiceSpec {
        service: String,
        field: String,
        message: String,
    },

    #[error("Listener priority {priority} requested by {service} is already used by {existing}")]
    DuplicateListenerPriority {
        priority: u32,
        service: String,
        existing: String,
    },

    #[error("Listener priority {priority} requested by {service} is outside 1..=50000")]
    ListenerPriorityOutOfRange { service: String, priority: u32 },

    #[error("Template error: {0}")]
    Template(#[from] template::Error),

    #[error("Security lattice violated: {0}")]
    Security(#[from] security::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// The two services every environment runs.
pub fn default_services(config: &EnvironmentConfig) -> Vec<ServiceSpec> {
    vec![ServiceSpec::product(config), ServiceSpec::website()]
}

pub fn build_stack(identity: &StackIdentity, config: &EnvironmentConfig) -> Result<Template, Error> {
    build_stack_with_services(identity, config, &default_services(config))
}

pub fn build_stack_with_services(
    identity: &StackIdentity,
    config: &EnvironmentConfig,
    services: &[ServiceSpec],
) -> Result<Template, Error> {
    if let Err(error) = config.validate() {
        return Err(Error::InvalidEnvironment {
            environment: identity.environment_type.to_string(),
            message: error.to_string(),
        });
    }

    let mut routes = ListenerRuleTable::new();
    for spec in services {
        spec.validate()?;
        routes.register(spec.route())?;
    }

    let stack_id = identity.id.as_str();
    let network = network::build_network(stack_id);
    let security = security::build_security_groups(stack_id, &network.vpc);
    let edge = edge::build_edge(
        network.public_subnet_refs(),
        &network.public_routes,
        &security.edge_group,
    );
    let capacity = capacity::build_capacity(
        stack_id,
        config,
        network.private_subnet_refs(),
        &security.host_group,
    );

    let mut built_services = Vec::with_capacity(services.len());
    for spec in services {
        let task_group = match spec.launch_type {
            service::LaunchType::Fargate => security.fargate_group.as_str(),
            service::LaunchType::Ec2 => security.host_group.as_str(),
        };
        let context = ServiceContext {
            stack_id,
            vpc: &network.vpc,
            cluster: &capacity.cluster,
            private_subnets: network.private_subnet_refs(),
            edge_group: &security.edge_group,
            task_group,
            host_capacity: &capacity.associations,
        };
        built_services.push(service::build_service(spec, &context)?);
    }

    let agent_parameter = observability::build_agent_parameter(&capacity.cluster_name)
        .map_err(|error| Error::Serialization(error.to_string()))?;

    let mut template = Template::new(identity.description.clone());
    let (parameter_id, parameter) = capacity.ami_parameter;
    template.parameters.insert(parameter_id, parameter);
    template.insert_all(network.resources)?;
    template.insert_all(security.resources)?;
    template.insert_all(edge.resources)?;
    template.insert_all(routes.render(&edge.listener))?;
    template.insert_all(capacity.resources)?;
    for resources in built_services {
        template.insert_all(resources)?;
    }
    template.insert_all(agent_parameter)?;
    template
        .outputs
        .extend(observability::build_outputs(&capacity.cluster));

    security::verify_reachability(&template)?;
    apply_tags(&mut template, &config::global_tags());

    tracing::info!(
        stack = stack_id,
        environment = %identity.environment_type,
        resources = template.resources.len(),
        services = template.count_of_type("AWS::ECS::Service"),
        "Synthesized stack"
    );

    Ok(template)
}
