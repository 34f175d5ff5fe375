//! CLI handlers for the `ember config` subcommand.

use anyhow::Result;
use ember_config::{ConfigResult, ResolvedConfig, ShowFormat};

/// Show the resolved configuration with source annotations.
pub(crate) fn show_config(
    resolved: &ResolvedConfig,
    format: &str,
    section: Option<&str>,
) -> Result<()> {
    let show_format: ShowFormat = format.parse()?;

    let output = resolved
        .show(show_format, section)
        .map_err(|e| anyhow::anyhow!("failed to format config: {e}"))?;

    println!("{output}");
    Ok(())
}

/// Report whether the configuration loaded and validated.
pub(crate) fn validate_config(loaded: ConfigResult<ResolvedConfig>) {
    match loaded {
        Ok(resolved) => {
            println!("Configuration is valid.");
            if !resolved.loaded_files.is_empty() {
                println!("\nLoaded files:");
                for path in &resolved.loaded_files {
                    println!("  - {path}");
                }
            }
            println!("\nEnvironment variable fallbacks:");
            for var in ember_config::env::supported_env_vars() {
                println!("  {var}");
            }
        },
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        },
    }
}
