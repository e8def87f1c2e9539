mod config;
mod plan_cmds;
mod shell_task;

#[cfg(test)]
mod test_util;

use anyhow::Context;
use clap::{Parser, Subcommand};

use config::{ConfigFile, EngineSection, WeaveConfig};

#[derive(Parser)]
#[command(name = "weave", about = "Parallel workflow execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a weave config file (resource totals, default concurrency)
    Init {
        /// Named resource total, repeatable (e.g. --resource cpu=8)
        #[arg(long = "resource")]
        resources: Vec<String>,
        /// Default concurrency limit for workflows that don't set their own
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Workflow definition management
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Show the resolved engine configuration
    Status,
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Parse and validate a workflow TOML file without running it
    Validate {
        /// Path to the workflow TOML file
        file: String,
    },
    /// Parse a workflow TOML file and run it to completion
    Run {
        /// Path to the workflow TOML file
        file: String,
        /// Named resource total, repeatable (e.g. --resource cpu=8);
        /// overrides the config file and WEAVE_RESOURCES for this run
        #[arg(long = "resource")]
        resources: Vec<String>,
        /// Overrides the config file and WEAVE_MAX_CONCURRENCY for this run
        #[arg(long)]
        max_concurrency: Option<usize>,
    },
}

fn cmd_init(resources: &[String], max_concurrency: Option<usize>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let mut resource_map = std::collections::HashMap::new();
    for entry in resources {
        let (name, amount) = config::parse_resource_arg(entry)?;
        resource_map.insert(name, amount);
    }

    let cfg = ConfigFile {
        engine: EngineSection {
            resources: resource_map,
            default_concurrency: max_concurrency,
        },
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  engine.resources = {:?}", cfg.engine.resources);
    println!("  engine.default_concurrency = {:?}", cfg.engine.default_concurrency);
    Ok(())
}

fn cmd_status() -> anyhow::Result<()> {
    let config = WeaveConfig::resolve(&[], None).context("failed to resolve engine configuration")?;
    println!("config file: {}", config::config_path().display());
    if config.resource_totals.is_empty() {
        println!("resources: none configured (every resource is unbounded)");
    } else {
        let mut names: Vec<&String> = config.resource_totals.keys().collect();
        names.sort();
        println!("resources:");
        for name in names {
            println!("  {name}: {:?}", config.resource_totals[name]);
        }
    }
    match config.default_concurrency {
        Some(limit) => println!("default concurrency: {limit}"),
        None => println!("default concurrency: unbounded"),
    }
    println!();
    println!("weave has no background daemon: this reflects configuration only,");
    println!("not any workflow currently in flight in another process.");
    Ok(())
}

fn printing_subscriber(event: &weave_core::Event) {
    tracing::info!(event = event.name(), workflow_id = %event.workflow_id(), "lifecycle event");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            resources,
            max_concurrency,
            force,
        } => {
            cmd_init(&resources, max_concurrency, force)?;
        }
        Commands::Plan { command } => match command {
            PlanCommands::Validate { file } => {
                plan_cmds::run_validate(&file)?;
            }
            PlanCommands::Run {
                file,
                resources,
                max_concurrency,
            } => {
                plan_cmds::run_plan(&file, &resources, max_concurrency).await?;
            }
        },
        Commands::Status => {
            cmd_status()?;
        }
    }

    Ok(())
}
