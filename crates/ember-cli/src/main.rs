//! Ember CLI - run the event bus demo workflow and inspect configuration.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ember_config::{Config, LoadOptions};

mod commands;
pub mod config_bridge;

use commands::{config, demo};

/// Ember - hierarchical event bus with chain cancellation
#[derive(Parser)]
#[command(name = "ember")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format: pretty (default) or json
    #[arg(long, global = true, default_value = "pretty")]
    format: String,

    /// Extra configuration file, merged above the user config
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a three-step workflow through a chainable bus
    Demo {
        /// Interrupt the conversation while the second step is in flight
        #[arg(long)]
        interrupt: bool,
    },

    /// View and validate configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the resolved configuration with source annotations
    Show {
        /// Output format: toml (default) or json
        #[arg(long, default_value = "toml")]
        format: String,

        /// Only show one section (bus, middleware, retry, logging)
        #[arg(long)]
        section: Option<String>,
    },
    /// Validate the configuration and list loaded files
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_file: cli.config.clone(),
        ..LoadOptions::default()
    };

    // Logging comes up before anything else; a bad config still gets a
    // logger so the error itself is reported.
    let loaded = Config::load_with(&options);
    let mut log_config = match &loaded {
        Ok(resolved) => config_bridge::to_log_config(&resolved.config)?,
        Err(_) => ember_telemetry::LogConfig::new("warn")
            .with_format(ember_telemetry::LogFormat::Compact),
    };
    if cli.verbose {
        "debug".clone_into(&mut log_config.level);
    }
    if let Err(e) = ember_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    match cli.command {
        Commands::Demo { interrupt } => {
            let resolved = loaded?;
            demo::run_demo(&resolved.config, interrupt, &cli.format).await?;
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show { format, section } => {
                config::show_config(&loaded?, &format, section.as_deref())?;
            },
            ConfigCommands::Validate => config::validate_config(loaded),
        },
    }

    Ok(())
}
