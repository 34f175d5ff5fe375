//! Test harness helpers.

use tracing_subscriber::EnvFilter;

/// Set up test logging at `warn`, or whatever `RUST_LOG` asks for.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Set up test logging with an explicit filter (e.g. `"ember_events=debug"`).
pub fn init_test_logging_with(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        init_test_logging_with("ember_events=debug");
        init_test_logging_with("not a valid [directive");
        init_test_logging();
    }
}
