//! Environment variable fallbacks.
//!
//! Env vars are **fallback**, not override: they only fill fields that no
//! config file set. A field still holding its compiled-in default counts as
//! unset.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources};

/// Name of the variable pointing at an alternate config directory.
pub const EMBER_HOME_VAR: &str = "EMBER_HOME";

#[derive(Debug, Clone, Copy)]
enum EnvKind {
    Integer,
    String,
}

/// Mapping from environment variable name to config field path.
struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: EnvKind,
}

/// All supported `EMBER_*` env var mappings.
const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "EMBER_MAX_CONCURRENT_HANDLERS",
        field_path: "bus.max_concurrent_handlers",
        kind: EnvKind::Integer,
    },
    EnvMapping {
        var_name: "EMBER_MAX_HISTORY_SIZE",
        field_path: "bus.max_history_size",
        kind: EnvKind::Integer,
    },
    EnvMapping {
        var_name: "EMBER_RETRY_MAX_RETRIES",
        field_path: "retry.max_retries",
        kind: EnvKind::Integer,
    },
    EnvMapping {
        var_name: "EMBER_RETRY_BASE_DELAY_MS",
        field_path: "retry.base_delay_ms",
        kind: EnvKind::Integer,
    },
    EnvMapping {
        var_name: "EMBER_LOG_LEVEL",
        field_path: "logging.level",
        kind: EnvKind::String,
    },
    EnvMapping {
        var_name: "EMBER_LOG_FORMAT",
        field_path: "logging.format",
        kind: EnvKind::String,
    },
];

/// Names of every env var consulted as a fallback.
#[must_use]
pub fn supported_env_vars() -> Vec<&'static str> {
    ENV_MAPPINGS.iter().map(|m| m.var_name).collect()
}

/// Apply environment variable fallbacks to fields that no config file set.
///
/// Returns the number of env vars applied.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] if a numeric variable does not parse.
pub fn apply_env_fallbacks<S: ::std::hash::BuildHasher>(
    merged: &mut toml::Value,
    sources: &mut FieldSources,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<usize> {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        let set_by_file = sources
            .get(mapping.field_path)
            .is_some_and(|layer| *layer != ConfigLayer::Defaults);
        if set_by_file {
            continue;
        }

        let Some(raw) = env_vars.get(mapping.var_name) else {
            continue;
        };

        debug!(
            var = mapping.var_name,
            field = mapping.field_path,
            "applying env var fallback"
        );

        let value = coerce(mapping, raw)?;
        set_field(merged, mapping.field_path, value);
        sources.insert(mapping.field_path.to_owned(), ConfigLayer::Environment);
        count = count.saturating_add(1);
    }

    Ok(count)
}

fn coerce(mapping: &EnvMapping, raw: &str) -> ConfigResult<toml::Value> {
    match mapping.kind {
        EnvKind::Integer => raw
            .trim()
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|e| ConfigError::EnvError {
                var_name: mapping.var_name.to_owned(),
                message: format!("expected an integer, got '{raw}': {e}"),
            }),
        EnvKind::String => Ok(toml::Value::String(raw.trim().to_owned())),
    }
}

/// Set a field in the TOML tree, creating intermediate tables as needed.
fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return;
    };

    let mut current = root;
    for segment in segments {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        current = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }

    if let Some(table) = current.as_table_mut() {
        table.insert(leaf.to_owned(), value);
    }
}

/// Collect all current environment variables into a map.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars().collect()
}
