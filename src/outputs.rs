use aws_config::meta::region::RegionProviderChain;
use aws_sdk_cloudformation::model::Output;
use aws_types::region::Region;
use futures::future::try_join_all;
use std::collections::BTreeMap;

use crate::config::DEFAULT_REGION;

/// Output key to value, for one stack.
pub type StackOutputs = BTreeMap<String, String>;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),

    #[error("Stack {0} not found")]
    NotFoundError(String),
}

pub struct Stack {
    pub stack_name: String,

    client: aws_sdk_cloudformation::Client,
}

impl Stack {
    /// Builds a client for `region`, falling back to the default provider
    /// chain and then to the default region.
    pub async fn new(stack_name: String, region: Option<String>) -> Self {
        let region_provider = RegionProviderChain::first_try(region.map(Region::new))
            .or_default_provider()
            .or_else(DEFAULT_REGION);

        let sdk_config = aws_config::from_env().region(region_provider).load().await;
        let client = aws_sdk_cloudformation::Client::new(&sdk_config);

        Self { stack_name, client }
    }

    pub async fn get_outputs(&self) -> Result<Vec<Output>, Error> {
        let result = self
            .client
            .describe_stacks()
            .stack_name(&self.stack_name)
            .send()
            .await;

        let result = match result {
            Ok(data) => data,
            Err(aws_sdk_cloudformation::types::SdkError::ServiceError { err, .. }) => {
                return Err(Error::ServiceError(err.to_string()));
            }
            Err(err) => return Err(Error::UnknownError(err.to_string())),
        };

        let stack = match result.stacks().unwrap_or_default().first() {
            Some(stack) => stack,
            None => return Err(Error::NotFoundError(self.stack_name.clone())),
        };

        let outputs = stack.outputs().unwrap_or_default().to_vec();
        tracing::debug!(stack = %self.stack_name, outputs = outputs.len(), "Fetched stack outputs");

        Ok(outputs)
    }
}

/// Keeps the outputs that carry both a key and a value.
pub fn collect_outputs(outputs: &[Output]) -> StackOutputs {
    outputs
        .iter()
        .filter_map(|output| match (output.output_key(), output.output_value()) {
            (Some(key), Some(value)) => Some((key.to_string(), value.to_string())),
            _ => None,
        })
        .collect()
}

/// Fetches the outputs of every stack concurrently, keyed by stack name.
pub async fn fetch_all(
    stack_names: &[String],
    region: Option<String>,
) -> Result<BTreeMap<String, StackOutputs>, Error> {
    let fetches = stack_names.iter().map(|stack_name| {
        let region = region.clone();
        async move {
            let stack = Stack::new(stack_name.clone(), region).await;
            let outputs = stack.get_outputs().await?;
            Ok::<_, Error>((stack.stack_name, collect_outputs(&outputs)))
        }
    });

    Ok(try_join_all(fetches).await?.into_iter().collect())
}

/// Flattens per-stack outputs into one map. Keys of a single stack are kept
/// as they are; with several stacks each key is prefixed by its stack name.
pub fn merge_outputs(per_stack: BTreeMap<String, StackOutputs>) -> StackOutputs {
    if per_stack.len() == 1 {
        return per_stack.into_values().next().unwrap_or_default();
    }

    per_stack
        .into_iter()
        .flat_map(|(stack_name, outputs)| {
            outputs
                .into_iter()
                .map(move |(key, value)| (format!("{}{}", stack_name, key), value))
        })
        .collect()
}
