//! Command-line interface for sagabus.
//!
//! Provides commands for inspecting feature activation, the assembled
//! pipelines, saga metadata from a type manifest, and the resolved
//! configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{self, ResolvedConfig};
use crate::core::{Endpoint, EndpointConfiguration, FeatureState, Pipeline};
use crate::features::InMemoryDispatcher;
use crate::sagas::{SagaFinderDefinition, SagaManifest};

/// sagabus - Message-driven endpoint runtime
#[derive(Parser, Debug)]
#[command(name = "sagabus")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to .sagabus/config.yaml discovery)
    #[arg(long, global = true, env = "SAGABUS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show which built-in features activate and why
    Features {
        /// Register an in-memory dispatcher so the send side can activate
        #[arg(long)]
        with_dispatcher: bool,

        /// Print the activation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the ordered steps of the receive and send pipelines
    Pipeline {
        /// Print the steps as JSON
        #[arg(long)]
        json: bool,
    },

    /// Analyse the sagas declared in a type manifest
    Sagas {
        /// Path to the YAML type manifest
        manifest: PathBuf,

        /// Print the metadata as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;

        match self.command {
            Commands::Features { with_dispatcher, json } => show_features(&config, with_dispatcher, json).await,
            Commands::Pipeline { json } => show_pipeline(&config, json).await,
            Commands::Sagas { manifest, json } => show_sagas(&manifest, json),
            Commands::Config => show_config(&config),
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<ResolvedConfig> {
    match path {
        Some(path) => config::load_from(path),
        None => Ok(config::config()?.clone()),
    }
}

fn endpoint_configuration(config: &ResolvedConfig, with_dispatcher: bool) -> Result<EndpointConfiguration> {
    let mut configuration = EndpointConfiguration::from_config(config)?;
    if with_dispatcher {
        configuration.use_dispatcher(Arc::new(InMemoryDispatcher::new()));
    }
    Ok(configuration)
}

/// Print the activation report
async fn show_features(config: &ResolvedConfig, with_dispatcher: bool, json: bool) -> Result<()> {
    let endpoint = Endpoint::start(endpoint_configuration(config, with_dispatcher)?).await?;
    let report = endpoint.activation_report().clone();
    endpoint.stop().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{:<32} {:<10} {:<20}", "FEATURE", "DEFAULT", "STATE");
    println!("{}", "-".repeat(75));

    for feature in &report.features {
        let state = match &feature.state {
            FeatureState::Active => "active".to_string(),
            FeatureState::Disabled => "disabled".to_string(),
            FeatureState::PrerequisitesNotMet { .. } => "prerequisites-not-met".to_string(),
            FeatureState::DependenciesNotMet { .. } => "dependencies-not-met".to_string(),
        };
        let default = if feature.enabled_by_default { "on" } else { "off" };
        println!("{:<32} {:<10} {:<20}", feature.name, default, state);

        match &feature.state {
            FeatureState::PrerequisitesNotMet { reasons } => {
                for reason in reasons {
                    println!("  - {}", reason);
                }
            }
            FeatureState::DependenciesNotMet { unmet } => {
                println!("  - requires: {}", unmet.join(", "));
            }
            _ => {}
        }
    }

    println!();
    println!("Activation order: {}", report.activation_order.join(" -> "));
    Ok(())
}

/// Print both pipelines
async fn show_pipeline(config: &ResolvedConfig, json: bool) -> Result<()> {
    let endpoint = Endpoint::start(endpoint_configuration(config, true)?).await?;
    let receive = endpoint.receive_pipeline().clone();
    let send = endpoint.send_pipeline().clone();
    endpoint.stop().await?;

    if json {
        let steps = serde_json::json!({
            "receive": receive.describe(),
            "send": send.describe(),
        });
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(());
    }

    print_pipeline("Receive pipeline", &receive);
    println!();
    print_pipeline("Send pipeline", &send);
    Ok(())
}

fn print_pipeline(title: &str, pipeline: &Pipeline) {
    println!("{} (root: {})", title, pipeline.root());
    println!("{:<4} {:<52} {:<18} {}", "#", "STEP", "STAGE", "DESCRIPTION");
    println!("{}", "-".repeat(110));

    for (index, step) in pipeline.describe().iter().enumerate() {
        let id = if step.connector {
            format!("{} (connector)", step.id)
        } else {
            step.id.clone()
        };
        println!("{:<4} {:<52} {:<18} {}", index + 1, id, step.stage.to_string(), step.description);
    }
}

/// Print saga metadata from a manifest
fn show_sagas(manifest_path: &std::path::Path, json: bool) -> Result<()> {
    let manifest = SagaManifest::from_file(manifest_path)?;
    let metadata = manifest
        .metadata()
        .with_context(|| format!("Invalid saga declarations in {}", manifest_path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&metadata)?);
        return Ok(());
    }

    if metadata.is_empty() {
        println!("No sagas found");
        return Ok(());
    }

    for saga in metadata.iter() {
        println!("Saga: {}", saga.saga_type);
        println!("  Data: {}", saga.entity_type);

        if saga.correlation_properties.is_empty() {
            println!("  Correlation properties: (none)");
        } else {
            println!("  Correlation properties:");
            for property in &saga.correlation_properties {
                println!("    {}: {}", property.name, property.type_name);
            }
        }

        println!("  Messages:");
        for message in &saga.associated_messages {
            let starts = if message.is_allowed_to_start_saga { " (starts saga)" } else { "" };
            println!("    {}{}", message.message_type, starts);
        }

        println!("  Finders:");
        for finder in &saga.finders {
            match finder {
                SagaFinderDefinition::Property {
                    message_type,
                    message_property,
                    saga_property,
                } => println!("    {}.{} -> {}", message_type, message_property, saga_property),
                SagaFinderDefinition::Custom {
                    message_type,
                    finder_type,
                } => println!("    {} -> {} (custom)", message_type, finder_type),
            }
        }
        println!();
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("sagabus configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Endpoint:    {}", cfg.endpoint_name);
    println!();
    println!("Features:");
    println!(
        "  Enabled:  {}",
        if cfg.features.enable.is_empty() { "(none)".to_string() } else { cfg.features.enable.join(", ") }
    );
    println!(
        "  Disabled: {}",
        if cfg.features.disable.is_empty() { "(none)".to_string() } else { cfg.features.disable.join(", ") }
    );
    println!();
    println!("Settings:");
    if cfg.settings.is_empty() {
        println!("  (none)");
    } else {
        for (key, value) in &cfg.settings {
            println!("  {}: {}", key, value);
        }
    }
    println!();
    println!("Receive circuit breaker:");
    println!("  Time to wait:    {}s", cfg.circuit_breaker.time_to_wait_seconds);
    println!("  Failure backoff: {}ms", cfg.circuit_breaker.failure_backoff_millis);

    Ok(())
}
