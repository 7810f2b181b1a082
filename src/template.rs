//! CloudFormation template model.
//!
//! Every map is a `BTreeMap` (and `serde_json::Map` is built without
//! `preserve_order`), so the same input always serializes to the same bytes.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const FORMAT_VERSION: &str = "2010-09-09";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Logical id {0} is declared twice")]
    DuplicateLogicalId(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,

    pub description: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Parameter>,

    pub resources: BTreeMap<String, Resource>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Output>,
}

impl Template {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            description: description.into(),
            parameters: BTreeMap::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Merges a layer's resources, refusing to overwrite an existing logical id.
    pub fn insert_all(&mut self, resources: Resources) -> Result<(), Error> {
        for (logical_id, resource) in resources {
            if self.resources.contains_key(&logical_id) {
                return Err(Error::DuplicateLogicalId(logical_id));
            }
            self.resources.insert(logical_id, resource);
        }

        Ok(())
    }

    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Resource)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, resource)| resource.resource_type == resource_type)
    }

    pub fn count_of_type(&self, resource_type: &str) -> usize {
        self.resources_of_type(resource_type).count()
    }
}

pub type Resources = BTreeMap<String, Resource>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeletionPolicy {
    Delete,
    Retain,
    Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,

    pub properties: Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<DeletionPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<Value>,
}

impl Resource {
    pub fn new(resource_type: &str, properties: Value) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            properties,
            depends_on: Vec::new(),
            deletion_policy: None,
            update_replace_policy: None,
            update_policy: None,
        }
    }

    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        let logical_id = logical_id.into();
        if !self.depends_on.contains(&logical_id) {
            self.depends_on.push(logical_id);
            self.depends_on.sort();
        }
        self
    }

    /// Deleted together with the stack, including on replacement.
    pub fn destroy_on_removal(mut self) -> Self {
        self.deletion_policy = Some(DeletionPolicy::Delete);
        self.update_replace_policy = Some(DeletionPolicy::Delete);
        self
    }

    pub fn with_update_policy(mut self, policy: Value) -> Self {
        self.update_policy = Some(policy);
        self
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Value,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    #[serde(rename = "Type")]
    pub parameter_type: String,
    pub default: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

pub mod intrinsic {
    use serde_json::{json, Value};

    pub fn reference(logical_id: &str) -> Value {
        json!({ "Ref": logical_id })
    }

    pub fn get_att(logical_id: &str, attribute: &str) -> Value {
        json!({ "Fn::GetAtt": [logical_id, attribute] })
    }

    pub fn join(separator: &str, parts: Vec<Value>) -> Value {
        json!({ "Fn::Join": [separator, parts] })
    }

    pub fn sub(template: &str) -> Value {
        json!({ "Fn::Sub": template })
    }

    pub fn base64(value: Value) -> Value {
        json!({ "Fn::Base64": value })
    }

    /// The `index`-th availability zone of the deployment region.
    pub fn availability_zone(index: usize) -> Value {
        json!({ "Fn::Select": [index, { "Fn::GetAZs": "" }] })
    }

    pub fn region() -> Value {
        reference("AWS::Region")
    }

    pub fn managed_policy_arn(name: &str) -> Value {
        join(
            "",
            vec![
                Value::from("arn:"),
                reference("AWS::Partition"),
                Value::from(format!(":iam::aws:policy/{}", name)),
            ],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

enum TagFormat {
    KeyValueList,
    StringMap,
    PropagatedList,
}

fn tag_format(resource_type: &str) -> Option<TagFormat> {
    match resource_type {
        "AWS::AutoScaling::AutoScalingGroup" => Some(TagFormat::PropagatedList),
        "AWS::SSM::Parameter" => Some(TagFormat::StringMap),
        "AWS::EC2::VPC"
        | "AWS::EC2::Subnet"
        | "AWS::EC2::RouteTable"
        | "AWS::EC2::InternetGateway"
        | "AWS::EC2::EIP"
        | "AWS::EC2::NatGateway"
        | "AWS::EC2::SecurityGroup"
        | "AWS::EC2::FlowLog"
        | "AWS::Logs::LogGroup"
        | "AWS::IAM::Role"
        | "AWS::ElasticLoadBalancingV2::LoadBalancer"
        | "AWS::ElasticLoadBalancingV2::TargetGroup"
        | "AWS::ECS::Cluster"
        | "AWS::ECS::CapacityProvider"
        | "AWS::ECS::TaskDefinition"
        | "AWS::ECS::Service" => Some(TagFormat::KeyValueList),
        _ => None,
    }
}

/// Applies `tags` to every taggable resource of a finished template.
///
/// Runs after the whole graph is built; a tag already carried by a resource
/// under the same key is replaced. Tags end up sorted by key.
pub fn apply_tags(template: &mut Template, tags: &[Tag]) {
    for resource in template.resources.values_mut() {
        let format = match tag_format(&resource.resource_type) {
            Some(format) => format,
            None => continue,
        };
        let properties = match resource.properties.as_object_mut() {
            Some(properties) => properties,
            None => continue,
        };

        match format {
            TagFormat::StringMap => {
                let entry = properties
                    .entry("Tags")
                    .or_insert_with(|| Value::Object(Default::default()));
                if let Some(map) = entry.as_object_mut() {
                    for tag in tags {
                        map.insert(tag.key.clone(), Value::from(tag.value.clone()));
                    }
                }
            }
            TagFormat::KeyValueList | TagFormat::PropagatedList => {
                let propagate = matches!(format, TagFormat::PropagatedList);
                let mut merged: BTreeMap<String, Value> = properties
                    .get("Tags")
                    .and_then(Value::as_array)
                    .map(|existing| {
                        existing
                            .iter()
                            .filter_map(|tag| {
                                let key = tag.get("Key")?.as_str()?.to_string();
                                Some((key, tag.clone()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                for tag in tags {
                    let rendered = if propagate {
                        json!({ "Key": tag.key, "Value": tag.value, "PropagateAtLaunch": true })
                    } else {
                        json!({ "Key": tag.key, "Value": tag.value })
                    };
                    merged.insert(tag.key.clone(), rendered);
                }

                properties.insert(
                    "Tags".to_string(),
                    Value::Array(merged.into_values().collect()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::intrinsic::{availability_zone, managed_policy_arn, reference};
    use super::{apply_tags, Error, Resource, Resources, Tag, Template};
    use serde_json::json;

    fn tags() -> Vec<Tag> {
        vec![Tag::new("Project", "EcsRefarch"), Tag::new("ManagedBy", "test")]
    }

    #[test]
    fn rejects_duplicate_logical_ids() {
        let mut template = Template::new("test");
        let mut first = Resources::new();
        first.insert("VPC".to_string(), Resource::new("AWS::EC2::VPC", json!({})));
        template.insert_all(first.clone()).unwrap();

        let result = template.insert_all(first);
        assert_eq!(Err(Error::DuplicateLogicalId("VPC".to_string())), result);
    }

    #[test]
    fn tags_key_value_resources_sorted_by_key() {
        let mut template = Template::new("test");
        let mut resources = Resources::new();
        resources.insert(
            "VPC".to_string(),
            Resource::new(
                "AWS::EC2::VPC",
                json!({ "Tags": [{ "Key": "Name", "Value": "Stack/VPC" }] }),
            ),
        );
        template.insert_all(resources).unwrap();

        apply_tags(&mut template, &tags());

        let rendered = template.resources["VPC"].property("Tags").unwrap();
        assert_eq!(
            &json!([
                { "Key": "ManagedBy", "Value": "test" },
                { "Key": "Name", "Value": "Stack/VPC" },
                { "Key": "Project", "Value": "EcsRefarch" }
            ]),
            rendered
        );
    }

    #[test]
    fn tags_use_the_format_of_each_resource_type() {
        let mut template = Template::new("test");
        let mut resources = Resources::new();
        resources.insert(
            "Param".to_string(),
            Resource::new("AWS::SSM::Parameter", json!({ "Type": "String" })),
        );
        resources.insert(
            "Group".to_string(),
            Resource::new("AWS::AutoScaling::AutoScalingGroup", json!({})),
        );
        resources.insert(
            "Rule".to_string(),
            Resource::new("AWS::ElasticLoadBalancingV2::ListenerRule", json!({})),
        );
        template.insert_all(resources).unwrap();

        apply_tags(&mut template, &tags());

        assert_eq!(
            &json!({ "ManagedBy": "test", "Project": "EcsRefarch" }),
            template.resources["Param"].property("Tags").unwrap()
        );
        assert_eq!(
            &json!({ "Key": "ManagedBy", "Value": "test", "PropagateAtLaunch": true }),
            &template.resources["Group"].property("Tags").unwrap()[0]
        );
        assert_eq!(None, template.resources["Rule"].property("Tags"));
    }

    #[test]
    fn intrinsics_render_provider_syntax() {
        assert_eq!(json!({ "Ref": "VPC" }), reference("VPC"));
        assert_eq!(
            json!({ "Fn::Select": [1, { "Fn::GetAZs": "" }] }),
            availability_zone(1)
        );
        assert_eq!(
            json!({ "Fn::Join": ["", ["arn:", { "Ref": "AWS::Partition" }, ":iam::aws:policy/AmazonSSMReadOnlyAccess"]] }),
            managed_policy_arn("AmazonSSMReadOnlyAccess")
        );
    }

    #[test]
    fn serializes_with_provider_field_names() {
        let template = Template::new("desc");
        let rendered = serde_json::to_value(&template).unwrap();
        assert_eq!(
            json!({ "AWSTemplateFormatVersion": "2010-09-09", "Description": "desc", "Resources": {} }),
            rendered
        );
    }
}
