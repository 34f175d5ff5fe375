//! Configuration validation rules.

use tracing::warn;

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Accepted values for `logging.level`.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
/// Accepted values for `logging.format`.
pub const LOG_FORMATS: &[&str] = &["pretty", "compact", "json", "full"];

/// Validate a fully merged configuration.
///
/// # Errors
///
/// Returns the first [`ConfigError::ValidationError`] found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    if config.bus.max_concurrent_handlers == 0 {
        return Err(invalid(
            "bus.max_concurrent_handlers",
            "must be at least 1",
        ));
    }
    if config.bus.max_history_size == 0 {
        return Err(invalid("bus.max_history_size", "must be at least 1"));
    }
    if config.bus.default_conversation_id.trim().is_empty() {
        return Err(invalid("bus.default_conversation_id", "must not be empty"));
    }
    if config.bus.default_agent_id.trim().is_empty() {
        return Err(invalid("bus.default_agent_id", "must not be empty"));
    }

    if config.retry.max_retries == 0 {
        return Err(invalid(
            "retry.max_retries",
            "must be at least 1 (it counts the first attempt)",
        ));
    }
    let factor = config.retry.backoff_factor;
    if !factor.is_finite() || factor < 1.0 {
        return Err(invalid(
            "retry.backoff_factor",
            &format!("must be a finite number >= 1.0, got {factor}"),
        ));
    }
    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        return Err(invalid(
            "retry.max_delay_ms",
            "must not be smaller than retry.base_delay_ms",
        ));
    }

    let level = config.logging.level.to_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(invalid(
            "logging.level",
            &format!(
                "'{}' is not one of {}",
                config.logging.level,
                LOG_LEVELS.join(", ")
            ),
        ));
    }
    let format = config.logging.format.to_lowercase();
    if !LOG_FORMATS.contains(&format.as_str()) {
        return Err(invalid(
            "logging.format",
            &format!(
                "'{}' is not one of {}",
                config.logging.format,
                LOG_FORMATS.join(", ")
            ),
        ));
    }

    if !config.middleware.error_isolation {
        warn!("error_isolation middleware disabled; handler errors will escape publish()");
    }

    Ok(())
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(result: ConfigResult<()>) -> String {
        match result {
            Err(ConfigError::ValidationError { field, .. }) => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = Config::default();
        config.bus.max_concurrent_handlers = 0;
        assert_eq!(field_of(validate(&config)), "bus.max_concurrent_handlers");

        let mut config = Config::default();
        config.bus.max_history_size = 0;
        assert_eq!(field_of(validate(&config)), "bus.max_history_size");

        let mut config = Config::default();
        config.retry.max_retries = 0;
        assert_eq!(field_of(validate(&config)), "retry.max_retries");
    }

    #[test]
    fn test_backoff_factor_rules() {
        let mut config = Config::default();
        config.retry.backoff_factor = 0.5;
        assert_eq!(field_of(validate(&config)), "retry.backoff_factor");

        config.retry.backoff_factor = f64::NAN;
        assert_eq!(field_of(validate(&config)), "retry.backoff_factor");

        config.retry.backoff_factor = 1.0;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_log_level_and_format() {
        let mut config = Config::default();
        config.logging.level = "WARN".to_owned();
        assert!(validate(&config).is_ok());

        config.logging.level = "loud".to_owned();
        assert_eq!(field_of(validate(&config)), "logging.level");

        let mut config = Config::default();
        config.logging.format = "xml".to_owned();
        assert_eq!(field_of(validate(&config)), "logging.format");
    }

    #[test]
    fn test_disabled_isolation_is_allowed() {
        let mut config = Config::default();
        config.middleware.error_isolation = false;
        assert!(validate(&config).is_ok());
    }
}
