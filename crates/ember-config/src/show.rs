//! Source-annotated display for `config show`.
//!
//! Prints the resolved configuration with annotations showing which layer
//! (defaults, user, file, env) set each value.

use std::fmt::Write as _;

use crate::error::{ConfigError, ConfigResult};
use crate::merge::FieldSources;
use crate::types::Config;

/// A resolved configuration together with source annotations.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The final merged configuration.
    pub config: Config,
    /// Dotted field path → which layer set the value.
    pub field_sources: FieldSources,
    /// Config file paths that were loaded (in precedence order).
    pub loaded_files: Vec<String>,
}

/// Output format for `config show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowFormat {
    /// TOML with inline comments showing source.
    Toml,
    /// JSON (for programmatic consumption).
    Json,
}

impl std::str::FromStr for ShowFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::RenderError(format!(
                "unknown format '{other}', expected toml or json"
            ))),
        }
    }
}

impl ResolvedConfig {
    /// Wrap a configuration that was built in code, with no source tracking.
    #[must_use]
    pub fn unsourced(config: Config) -> Self {
        Self {
            config,
            field_sources: FieldSources::new(),
            loaded_files: Vec::new(),
        }
    }

    /// Render the resolved config, optionally limited to one section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownSection`] for a section that does not
    /// exist, or [`ConfigError::RenderError`] if serialization fails.
    pub fn show(&self, format: ShowFormat, section: Option<&str>) -> ConfigResult<String> {
        match format {
            ShowFormat::Toml => self.show_toml(section),
            ShowFormat::Json => self.show_json(section),
        }
    }

    fn section_value(&self, section: &str) -> ConfigResult<toml::Value> {
        let val = toml::Value::try_from(&self.config)
            .map_err(|e| ConfigError::RenderError(e.to_string()))?;
        val.as_table()
            .and_then(|t| t.get(section))
            .cloned()
            .ok_or_else(|| ConfigError::UnknownSection(section.to_owned()))
    }

    fn show_toml(&self, section: Option<&str>) -> ConfigResult<String> {
        let toml_str = if let Some(section_name) = section {
            let section_val = self.section_value(section_name)?;
            toml::to_string_pretty(&section_val)
        } else {
            toml::to_string_pretty(&self.config)
        }
        .map_err(|e| ConfigError::RenderError(e.to_string()))?;

        let mut output = String::new();
        output.push_str("# Resolved Ember Configuration\n");
        output.push_str("# Source annotations: [defaults] [user] [file] [env]\n");

        if !self.loaded_files.is_empty() {
            output.push_str("#\n# Loaded files (in precedence order):\n");
            for (i, path) in self.loaded_files.iter().enumerate() {
                let _ = writeln!(output, "#   {}. {path}", i.saturating_add(1));
            }
        }
        output.push('\n');

        let mut table = section.unwrap_or("").to_owned();
        for line in toml_str.lines() {
            let trimmed = line.trim();
            if let Some(header) = trimmed
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
            {
                table = match section {
                    Some(s) => format!("{s}.{header}"),
                    None => header.to_owned(),
                };
            }

            if let Some(annotation) = self.annotate_line(trimmed, &table) {
                let _ = writeln!(output, "{line}  # {annotation}");
            } else {
                output.push_str(line);
                output.push('\n');
            }
        }

        Ok(output)
    }

    fn show_json(&self, section: Option<&str>) -> ConfigResult<String> {
        let rendered = if let Some(section_name) = section {
            serde_json::to_string_pretty(&self.section_value(section_name)?)
        } else {
            serde_json::to_string_pretty(&self.config)
        };
        rendered.map_err(|e| ConfigError::RenderError(e.to_string()))
    }

    /// Source annotation for a `key = value` line inside `table`.
    fn annotate_line(&self, trimmed: &str, table: &str) -> Option<String> {
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('[') {
            return None;
        }

        let key = trimmed.split('=').next()?.trim();
        let field_path = if table.is_empty() {
            key.to_owned()
        } else {
            format!("{table}.{key}")
        };

        self.field_sources
            .get(&field_path)
            .map(|layer| format!("[{layer}]"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::ConfigLayer;

    fn sourced() -> ResolvedConfig {
        let mut resolved = ResolvedConfig::unsourced(Config::default());
        resolved
            .field_sources
            .insert("bus.max_history_size".to_owned(), ConfigLayer::User);
        resolved
            .field_sources
            .insert("logging.level".to_owned(), ConfigLayer::Environment);
        resolved.loaded_files.push("/home/u/.ember/config.toml".to_owned());
        resolved
    }

    #[test]
    fn test_show_toml_annotates_sources() {
        let output = sourced().show(ShowFormat::Toml, None).unwrap();
        assert!(output.contains("Resolved Ember Configuration"));
        assert!(output.contains("1. /home/u/.ember/config.toml"));
        assert!(output.contains("max_history_size = 1000  # [user]"));
        assert!(output.contains("level = \"info\"  # [env]"));
    }

    #[test]
    fn test_show_section() {
        let output = sourced().show(ShowFormat::Toml, Some("bus")).unwrap();
        assert!(output.contains("max_concurrent_handlers"));
        assert!(output.contains("# [user]"));
        assert!(!output.contains("backoff_factor"));
    }

    #[test]
    fn test_show_json() {
        let output = sourced().show(ShowFormat::Json, None).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["retry"]["max_retries"], 3);

        let section = sourced().show(ShowFormat::Json, Some("middleware")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&section).unwrap();
        assert_eq!(value["error_isolation"], true);
    }

    #[test]
    fn test_unknown_section() {
        assert!(matches!(
            sourced().show(ShowFormat::Json, Some("nope")),
            Err(ConfigError::UnknownSection(_))
        ));
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("TOML".parse::<ShowFormat>().unwrap(), ShowFormat::Toml);
        assert_eq!("json".parse::<ShowFormat>().unwrap(), ShowFormat::Json);
        assert!("yaml".parse::<ShowFormat>().is_err());
    }
}
