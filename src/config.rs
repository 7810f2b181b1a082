use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::{fmt, fs, io, path::Path};
use validator::{Validate, ValidationError};

use crate::template::Tag;

pub const DEFAULT_REGION: &str = "us-east-1";

pub const PROJECT_TAG: (&str, &str) = ("Project", "EcsRefarch");
pub const MANAGED_BY_TAG: (&str, &str) = ("ManagedBy", "ecs-refarch-synth");

const DEFAULT_SPOT_INSTANCE_TYPES: [&str; 2] = ["c6g.large", "r6g.large"];
const DEFAULT_SPOT_MAX_PRICE: &str = "0.10";

/// Fargate CPU units and the task memory (MiB) each tier accepts.
const FARGATE_SIZES: [(u32, &[u32]); 7] = [
    (256, &[512, 1024, 2048]),
    (512, &[1024, 2048, 3072, 4096]),
    (1024, &[2048, 3072, 4096, 5120, 6144, 7168, 8192]),
    (2048, &[4096, 5120, 6144, 7168, 8192, 9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384]),
    (4096, &[8192, 9216, 10240, 11264, 12288, 13312, 14336, 15360, 16384, 17408, 18432, 19456, 20480, 21504, 22528, 23552, 24576, 25600, 26624, 27648, 28672, 29696, 30720]),
    (8192, &[16384, 20480, 24576, 28672, 32768, 36864, 40960, 45056, 49152, 53248, 57344, 61440]),
    (16384, &[32768, 40960, 49152, 57344, 65536, 73728, 81920, 90112, 98304, 106496, 114688, 122880]),
];

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Validation errors: {0}")]
    ValidationError(String),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentType {
    Development,
    Production,
}

impl EnvironmentType {
    pub const ALL: [EnvironmentType; 2] = [EnvironmentType::Development, EnvironmentType::Production];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Development => "development",
            EnvironmentType::Production => "production",
        }
    }

    pub fn identity(&self) -> StackIdentity {
        match self {
            EnvironmentType::Development => StackIdentity {
                id: String::from("EcsRefarchDev"),
                environment_type: *self,
                description: String::from(
                    "ECS Reference Architecture with Graviton (Development)",
                ),
            },
            EnvironmentType::Production => StackIdentity {
                id: String::from("EcsRefarchProd"),
                environment_type: *self,
                description: String::from(
                    "ECS Reference Architecture with Graviton (Production)",
                ),
            },
        }
    }
}

impl fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackIdentity {
    pub id: String,
    pub environment_type: EnvironmentType,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[validate(schema(function = "validate_environment", skip_on_field_errors = false))]
pub struct EnvironmentConfig {
    #[validate(custom = "validate_graviton_instance_type")]
    pub instance_type: String,

    #[validate(range(min = 1, max = 500))]
    pub cluster_size: u32,

    #[validate(custom = "validate_fargate_cpu")]
    pub fargate_task_cpu: u32,

    pub fargate_task_memory: u32,

    /// Alternatives offered to the spot allocator after `instance_type`.
    #[serde(default = "default_spot_instance_types")]
    #[validate(custom = "validate_spot_instance_types")]
    pub spot_instance_types: Vec<String>,

    /// On-demand price cap in USD per hour, as a decimal string.
    #[serde(default = "default_spot_max_price")]
    #[validate(custom = "validate_spot_max_price")]
    pub spot_max_price: Option<String>,
}

impl EnvironmentConfig {
    pub fn new(
        instance_type: &str,
        cluster_size: u32,
        fargate_task_cpu: u32,
        fargate_task_memory: u32,
    ) -> Self {
        Self {
            instance_type: instance_type.to_string(),
            cluster_size,
            fargate_task_cpu,
            fargate_task_memory,
            spot_instance_types: default_spot_instance_types(),
            spot_max_price: default_spot_max_price(),
        }
    }

    pub fn builtin(environment: EnvironmentType) -> Self {
        match environment {
            EnvironmentType::Development => Self::new("t4g.medium", 2, 256, 512),
            EnvironmentType::Production => Self::new("m6g.large", 4, 512, 1024),
        }
    }

    /// The configured type first, then the spot alternatives.
    pub fn instance_type_overrides(&self) -> Vec<String> {
        std::iter::once(self.instance_type.clone())
            .chain(self.spot_instance_types.iter().cloned())
            .collect()
    }
}

fn default_spot_instance_types() -> Vec<String> {
    DEFAULT_SPOT_INSTANCE_TYPES
        .iter()
        .map(|instance_type| instance_type.to_string())
        .collect()
}

fn default_spot_max_price() -> Option<String> {
    Some(String::from(DEFAULT_SPOT_MAX_PRICE))
}

pub type EnvironmentTable = BTreeMap<EnvironmentType, EnvironmentConfig>;

pub fn builtin_table() -> EnvironmentTable {
    EnvironmentType::ALL
        .iter()
        .map(|environment| (*environment, EnvironmentConfig::builtin(*environment)))
        .collect()
}

/// Loads the environment table, letting entries of the YAML file at `path`
/// replace the built-in ones. Every entry is validated before returning.
pub fn parse(path: Option<&Path>) -> Result<EnvironmentTable, Error> {
    let mut table = builtin_table();

    if let Some(path) = path {
        let contents = match fs::read_to_string(path) {
            Ok(raw_contents) => Ok(raw_contents),
            Err(error) => match error.kind() {
                io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
                _ => Err(Error::Unknown(error.to_string())),
            },
        }?;

        let overrides: EnvironmentTable = match serde_yaml::from_str(&contents) {
            Ok(data) => Ok(data),
            Err(error) => Err(Error::ParsingError(error.to_string())),
        }?;

        tracing::debug!(path = %path.display(), entries = overrides.len(), "Loaded environment overrides");
        table.extend(overrides);
    }

    validate_table(&table)?;

    Ok(table)
}

pub fn validate_table(table: &EnvironmentTable) -> Result<(), Error> {
    for (environment, config) in table {
        match config.validate() {
            Ok(_) => (),
            Err(error) => {
                return Err(Error::ValidationError(format!("{}: {}", environment, error)))
            }
        }
    }

    Ok(())
}

pub fn global_tags() -> Vec<Tag> {
    vec![
        Tag::new(PROJECT_TAG.0, PROJECT_TAG.1),
        Tag::new(MANAGED_BY_TAG.0, MANAGED_BY_TAG.1),
    ]
}

/// Account and region a synthesized stack is meant for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentTarget {
    pub account: Option<String>,
    pub region: String,
}

impl DeploymentTarget {
    pub fn new(account: Option<String>, region: Option<String>) -> Self {
        Self {
            account: account.filter(|account| !account.is_empty()),
            region: region
                .filter(|region| !region.is_empty())
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
        }
    }

    pub fn environment_uri(&self) -> String {
        let account = self.account.as_deref().unwrap_or("unknown-account");
        format!("aws://{}/{}", account, self.region)
    }
}

pub fn fargate_memory_options(cpu: u32) -> Option<&'static [u32]> {
    FARGATE_SIZES
        .iter()
        .find(|(tier, _)| *tier == cpu)
        .map(|(_, memory)| *memory)
}

/// Graviton families carry a `g` right after the generation digit
/// (`t4g`, `m6g`, `c7gn`, `r6gd`).
fn is_graviton_instance_type(instance_type: &str) -> bool {
    let (family, size) = match instance_type.split_once('.') {
        Some(parts) => parts,
        None => return false,
    };
    if size.is_empty() || !size.chars().all(|c| c.is_ascii_alphanumeric()) {
        return false;
    }

    let generation = match family.find(|c: char| c.is_ascii_digit()) {
        Some(position) if position > 0 => position,
        _ => return false,
    };
    if !family[..generation].chars().all(|c| c.is_ascii_lowercase()) {
        return false;
    }

    family[generation + 1..].starts_with('g')
}

fn validate_graviton_instance_type(instance_type: &str) -> Result<(), ValidationError> {
    if !is_graviton_instance_type(instance_type) {
        let mut error = ValidationError::new("graviton_instance_type");
        error.message = Some(Cow::from(format!(
            "`{}` is not an ARM64 (Graviton) instance type",
            instance_type
        )));
        return Err(error);
    }

    Ok(())
}

fn validate_spot_instance_types(instance_types: &[String]) -> Result<(), ValidationError> {
    for instance_type in instance_types {
        validate_graviton_instance_type(instance_type)?;
    }

    Ok(())
}

fn validate_spot_max_price(price: &str) -> Result<(), ValidationError> {
    let well_formed = !price.is_empty()
        && price.chars().all(|c| c.is_ascii_digit() || c == '.')
        && price.matches('.').count() <= 1;

    match price.parse::<f64>() {
        Ok(value) if well_formed && value > 0.0 => Ok(()),
        _ => {
            let mut error = ValidationError::new("spot_max_price");
            error.message = Some(Cow::from(format!(
                "spot_max_price `{}` is not a positive decimal",
                price
            )));
            Err(error)
        }
    }
}

fn validate_fargate_cpu(cpu: u32) -> Result<(), ValidationError> {
    if fargate_memory_options(cpu).is_none() {
        let mut error = ValidationError::new("fargate_task_cpu");
        error.message = Some(Cow::from(format!(
            "{} is not a Fargate CPU tier",
            cpu
        )));
        return Err(error);
    }

    Ok(())
}

fn validate_fargate_sizing(config: &EnvironmentConfig) -> Result<(), ValidationError> {
    let options = match fargate_memory_options(config.fargate_task_cpu) {
        Some(options) => options,
        // Reported by the field validator.
        None => return Ok(()),
    };

    if !options.contains(&config.fargate_task_memory) {
        let mut error = ValidationError::new("fargate_task_memory");
        error.message = Some(Cow::from(format!(
            "fargate_task_memory {} MiB is not accepted for fargate_task_cpu {}",
            config.fargate_task_memory, config.fargate_task_cpu
        )));
        return Err(error);
    }

    Ok(())
}

fn validate_unique_overrides(config: &EnvironmentConfig) -> Result<(), ValidationError> {
    let mut seen = std::collections::BTreeSet::new();
    for instance_type in config.instance_type_overrides() {
        if !seen.insert(instance_type.clone()) {
            let mut error = ValidationError::new("spot_instance_types");
            error.message = Some(Cow::from(format!(
                "spot_instance_types repeats `{}`",
                instance_type
            )));
            return Err(error);
        }
    }

    Ok(())
}

fn validate_environment(config: &EnvironmentConfig) -> Result<(), ValidationError> {
    validate_fargate_sizing(config)?;
    validate_unique_overrides(config)
}
