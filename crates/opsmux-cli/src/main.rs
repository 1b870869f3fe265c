//! opsmux CLI - one MCP endpoint in front of many DevOps providers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use opsmux_core::credentials::remediation_hint;
use opsmux_core::{Config, CredentialCheck, CredentialValidator, EnvCredentialValidator};
use opsmux_mcp::McpServer;
use opsmux_proxy::ProviderRegistry;
use tracing_subscriber::EnvFilter;

/// Replacement shown for secrets in `config show`.
const MASK: &str = "********";

#[derive(Parser)]
#[command(name = "opsmux")]
#[command(author, version, about = "opsmux - MCP proxy for DevOps providers", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the merged providers over MCP on stdio
    Serve,

    /// Connect every provider once and print their status as JSON
    Status,

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the config file location
    Path,

    /// Show the current configuration with secrets masked
    Show,

    /// Check the configuration and provider credentials
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the MCP protocol, logs go to stderr
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };

    match cli.command {
        Some(Commands::Serve) => serve(&config_path).await?,
        Some(Commands::Status) => status(&config_path).await?,
        Some(Commands::Config { command }) => match command {
            ConfigCommands::Path => println!("{}", config_path.display()),
            ConfigCommands::Show => show_config(&config_path)?,
            ConfigCommands::Validate => validate_config(&config_path)?,
        },
        None => {
            println!("opsmux - MCP proxy for DevOps providers");
            println!("Run with --help for usage information");
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load_from(path).with_context(|| format!("loading {}", path.display()))
}

async fn serve(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    if !config.has_any_provider() {
        tracing::warn!(path = %config_path.display(), "No providers configured");
    }

    let registry = ProviderRegistry::from_config(&config)?;
    registry.initialize_all().await;

    let mut server = McpServer::new(Arc::new(registry.clone()));
    tracing::info!("Serving MCP on stdio");
    let result = tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            Ok(())
        }
    };

    registry.shutdown().await;
    result?;
    Ok(())
}

async fn status(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let registry = ProviderRegistry::from_config(&config)?;
    registry.initialize_all().await;

    let report = registry.status_report();
    registry.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn show_config(config_path: &Path) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    for provider in config.providers.values_mut() {
        for value in provider.env.values_mut().chain(provider.headers.values_mut()) {
            *value = MASK.to_string();
        }
    }

    println!("# {}", config_path.display());
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn validate_config(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;

    let validator = EnvCredentialValidator::new();
    let mut missing = 0;
    for (id, provider) in config.enabled_providers() {
        match validator.validate(id, provider) {
            CredentialCheck::Valid => println!("  {}: ok", id),
            CredentialCheck::Missing { env_var, reason } => {
                missing += 1;
                println!("  {}: {}", id, reason);
                println!("    {}", remediation_hint(id, &env_var));
            }
        }
    }

    if missing > 0 {
        anyhow::bail!("{} provider(s) have unusable credentials", missing);
    }
    println!("Configuration is valid");
    Ok(())
}
