use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use validator::{Validate, ValidationError};

use crate::config::DeploymentTarget;
use crate::template::Template;

pub const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_VERSION: &str = "21.0.0";
const STACK_ARTIFACT: &str = "aws:cloudformation:stack";

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Could not write {path}: {message}")]
    WriteError { path: String, message: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Validation errors: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TemplateFormat {
    Json,
    Yaml,
}

impl TemplateFormat {
    fn extension(&self) -> &'static str {
        match self {
            TemplateFormat::Json => "json",
            TemplateFormat::Yaml => "yaml",
        }
    }
}

#[derive(Debug, Serialize)]
struct Manifest {
    version: &'static str,
    artifacts: BTreeMap<String, Artifact>,
}

#[derive(Debug, Serialize)]
struct Artifact {
    #[serde(rename = "type")]
    artifact_type: &'static str,
    environment: String,
    properties: ArtifactProperties,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactProperties {
    template_file: String,
}

fn write_contents(path: &Path, contents: String) -> Result<(), Error> {
    match fs::write(path, contents) {
        Ok(_) => Ok(()),
        Err(error) => Err(Error::WriteError {
            path: path.display().to_string(),
            message: error.to_string(),
        }),
    }
}

pub fn template_file_name(stack_id: &str, format: TemplateFormat) -> String {
    format!("{}.template.{}", stack_id, format.extension())
}

fn render_template(template: &Template, format: TemplateFormat) -> Result<String, Error> {
    match format {
        TemplateFormat::Json => serde_json::to_string_pretty(template)
            .map_err(|error| Error::SerializationError(error.to_string())),
        TemplateFormat::Yaml => serde_yaml::to_string(template)
            .map_err(|error| Error::SerializationError(error.to_string())),
    }
}

fn render_manifest(
    stacks: &[(String, Template)],
    target: &DeploymentTarget,
    format: TemplateFormat,
) -> Result<String, Error> {
    let artifacts = stacks
        .iter()
        .map(|(stack_id, _)| {
            (
                stack_id.clone(),
                Artifact {
                    artifact_type: STACK_ARTIFACT,
                    environment: target.environment_uri(),
                    properties: ArtifactProperties {
                        template_file: template_file_name(stack_id, format),
                    },
                },
            )
        })
        .collect();
    let manifest = Manifest {
        version: MANIFEST_VERSION,
        artifacts,
    };

    serde_json::to_string_pretty(&manifest).map_err(|error| Error::SerializationError(error.to_string()))
}

/// Writes every stack template plus the manifest into `out_dir`.
///
/// Everything is rendered before the first file is touched. If a write
/// fails, the files already written by this call are removed again.
pub fn write_assembly(
    out_dir: &Path,
    stacks: &[(String, Template)],
    target: &DeploymentTarget,
    format: TemplateFormat,
) -> Result<Vec<PathBuf>, Error> {
    let mut pending = Vec::with_capacity(stacks.len() + 1);
    for (stack_id, template) in stacks {
        pending.push((
            out_dir.join(template_file_name(stack_id, format)),
            render_template(template, format)?,
        ));
    }
    pending.push((out_dir.join(MANIFEST_FILE), render_manifest(stacks, target, format)?));

    let mut written: Vec<PathBuf> = Vec::with_capacity(pending.len());
    for (path, contents) in pending {
        if let Err(error) = write_contents(&path, contents) {
            for path in &written {
                if let Err(cleanup) = fs::remove_file(path) {
                    tracing::warn!(path = %path.display(), error = %cleanup, "Could not remove partial output");
                }
            }
            return Err(error);
        }
        tracing::debug!(path = %path.display(), "Wrote assembly file");
        written.push(path);
    }

    Ok(written)
}

/// Stack outputs as a flat `{ key: value }` object.
pub fn write_json(path: &Path, outputs: &BTreeMap<String, String>) -> Result<(), Error> {
    let contents = serde_json::to_string_pretty(outputs)
        .map_err(|error| Error::SerializationError(error.to_string()))?;

    write_contents(path, contents)
}

/// Stack outputs as `process.env` typings.
pub fn write_file_typings(path: &Path, outputs: &BTreeMap<String, String>) -> Result<(), Error> {
    let entries = outputs.keys().fold(String::new(), |mut acc, output_key| {
        acc.push_str(&format!("    {}: string;\n", output_key));
        acc
    });

    let contents = format!(
        "declare namespace NodeJS {{\n  interface ProcessEnv {{\n{}  }}\n}}\n",
        entries
    );
    write_contents(path, contents)
}

/// Destination files for fetched stack outputs.
#[derive(Debug, Clone, Validate)]
pub struct OutputFiles {
    #[validate(custom = "validate_json_file")]
    pub json: PathBuf,

    #[validate(custom = "validate_typescript_file")]
    pub typescript: PathBuf,
}

impl OutputFiles {
    pub fn write(&self, outputs: &BTreeMap<String, String>) -> Result<(), Error> {
        if let Err(error) = self.validate() {
            return Err(Error::ValidationError(error.to_string()));
        }

        write_json(&self.json, outputs)?;
        write_file_typings(&self.typescript, outputs)?;

        tracing::info!(
            json = %self.json.display(),
            typescript = %self.typescript.display(),
            outputs = outputs.len(),
            "Wrote stack outputs"
        );
        Ok(())
    }
}

fn validate_extension(path: &Path, expected: &str, label: &str) -> Result<(), ValidationError> {
    match path.extension() {
        Some(extension) if extension == expected => Ok(()),
        _ => {
            let mut error = ValidationError::new("file_extension");
            error.message = Some(Cow::from(format!(
                "The {} file location has to end with `.{}`",
                label, expected
            )));
            Err(error)
        }
    }
}

fn validate_json_file(path: &Path) -> Result<(), ValidationError> {
    validate_extension(path, "json", "JSON")
}

fn validate_typescript_file(path: &Path) -> Result<(), ValidationError> {
    validate_extension(path, "ts", "TypeScript")
}
