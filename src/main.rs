//! ecs-refarch-synth: synthesizes the Graviton ECS reference architecture
//! into CloudFormation templates and fetches the outputs of deployed stacks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;
use tracing::info;

mod config;
mod outputs;
mod stack;
mod template;
mod writer;

use config::{DeploymentTarget, EnvironmentType, DEFAULT_REGION};
use writer::{OutputFiles, TemplateFormat};

#[derive(Parser, Debug)]
#[command(name = "ecs-refarch-synth")]
#[command(about = "Graviton ECS reference architecture synthesizer")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EnvironmentSelection {
    Development,
    Production,
    All,
}

impl EnvironmentSelection {
    fn environments(&self) -> Vec<EnvironmentType> {
        match self {
            EnvironmentSelection::Development => vec![EnvironmentType::Development],
            EnvironmentSelection::Production => vec![EnvironmentType::Production],
            EnvironmentSelection::All => EnvironmentType::ALL.to_vec(),
        }
    }
}

#[derive(clap::Args, Debug)]
struct SynthArgs {
    /// Environment(s) to synthesize
    #[arg(short, long, value_enum, default_value = "all")]
    environment: EnvironmentSelection,

    /// YAML file overriding the built-in environment table
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory receiving the templates and the manifest
    #[arg(short, long, default_value = "cdk.out")]
    output_dir: PathBuf,

    /// Template serialization format
    #[arg(short, long, value_enum, default_value = "json")]
    format: TemplateFormat,

    /// Target account recorded in the manifest
    #[arg(long, env = "CDK_DEFAULT_ACCOUNT")]
    account: Option<String>,

    /// Target region recorded in the manifest
    #[arg(long, env = "CDK_DEFAULT_REGION", default_value = DEFAULT_REGION)]
    region: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Synthesize stack templates into the output directory
    Synth(SynthArgs),

    /// Fetch the outputs of deployed stacks into JSON and TypeScript files
    Outputs {
        /// Environment(s) whose stacks are queried
        #[arg(short, long, value_enum, default_value = "development")]
        environment: EnvironmentSelection,

        /// Output JSON file
        #[arg(long)]
        json: PathBuf,

        /// Output TypeScript typings file
        #[arg(long)]
        typescript: PathBuf,

        /// AWS region (default provider chain if not specified)
        #[arg(long)]
        region: Option<String>,
    },

    /// Print the resolved environment table
    List {
        /// YAML file overriding the built-in environment table
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&e);
        std::process::exit(1);
    }
}

fn print_error(error: &anyhow::Error) {
    let _ = write_error(&mut std::io::stderr().lock(), error);
}

/// Writes the error followed by each of its causes.
fn write_error(out: &mut impl std::io::Write, error: &anyhow::Error) -> std::io::Result<()> {
    writeln!(out, "\x1b[1;31merror:\x1b[0m {}", error)?;
    for cause in error.chain().skip(1) {
        writeln!(out, "  \x1b[33mcaused by:\x1b[0m {}", cause)?;
    }

    Ok(())
}

async fn run() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    match args.command {
        Command::Synth(synth_args) => handle_synth(synth_args)?,
        Command::Outputs {
            environment,
            json,
            typescript,
            region,
        } => handle_outputs(environment, OutputFiles { json, typescript }, region).await?,
        Command::List { config } => handle_list(config)?,
    }

    Ok(())
}

fn handle_synth(args: SynthArgs) -> Result<()> {
    let written = synthesize(&args)?;
    info!(
        output_dir = %args.output_dir.display(),
        files = written.len(),
        "Synthesized cloud assembly"
    );

    Ok(())
}

/// Builds every selected stack and only writes once all of them succeeded.
fn synthesize(args: &SynthArgs) -> Result<Vec<PathBuf>> {
    let table = config::parse(args.config.as_deref()).context("Failed to load environments")?;
    let target = DeploymentTarget::new(args.account.clone(), Some(args.region.clone()));

    let mut stacks = Vec::new();
    for environment in args.environment.environments() {
        let identity = environment.identity();
        let environment_config = table
            .get(&environment)
            .with_context(|| format!("No configuration for environment {}", environment))?;
        let template = stack::build_stack(&identity, environment_config)
            .with_context(|| format!("Failed to synthesize {}", identity.id))?;
        stacks.push((identity.id, template));
    }

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;
    let written = writer::write_assembly(&args.output_dir, &stacks, &target, args.format)?;
    for (stack_id, template) in &stacks {
        info!(stack = %stack_id, resources = template.resources.len(), "Wrote template");
    }
    info!(environment = %target.environment_uri(), "Wrote manifest");

    Ok(written)
}

async fn handle_outputs(
    selection: EnvironmentSelection,
    files: OutputFiles,
    region: Option<String>,
) -> Result<()> {
    let stack_names: Vec<String> = selection
        .environments()
        .iter()
        .map(|environment| environment.identity().id)
        .collect();
    info!(stacks = ?stack_names, region = ?region, "Fetching stack outputs");

    let per_stack = outputs::fetch_all(&stack_names, region).await?;
    files.write(&outputs::merge_outputs(per_stack))?;

    Ok(())
}

fn handle_list(config: Option<PathBuf>) -> Result<()> {
    let table = config::parse(config.as_deref()).context("Failed to load environments")?;

    println!(
        "{:<12} {:<16} {:<14} {:<6} {:<8} {:<8} {}",
        "ENVIRONMENT", "STACK", "INSTANCE", "HOSTS", "CPU", "MEMORY", "SPOT"
    );
    println!("{}", "-".repeat(90));
    for (environment, environment_config) in &table {
        println!(
            "{:<12} {:<16} {:<14} {:<6} {:<8} {:<8} {}",
            environment.as_str(),
            environment.identity().id,
            environment_config.instance_type,
            environment_config.cluster_size,
            environment_config.fargate_task_cpu,
            environment_config.fargate_task_memory,
            environment_config.spot_instance_types.join(","),
        );
    }

    Ok(())
}
