//! Structured logging for prediction hosts.
//!
//! Installs a `tracing` subscriber with a human-readable console layer and, in
//! debug builds, a JSON file layer that keeps a post-mortem record of
//! rollbacks, discarded payloads and input-buffer faults. The filter honours
//! `RUST_LOG` first, then the configured log level.

use std::path::Path;

use nebula_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when neither `RUST_LOG` nor the config name a level.
pub const DEFAULT_FILTER: &str = "info,nebula_predict=info";

/// File name of the JSON log written in debug builds.
pub const LOG_FILE_NAME: &str = "nebula-predict.log";

/// Build the filter directive string for a config.
///
/// An empty `log_level` falls back to [`DEFAULT_FILTER`]. With
/// `print_reconciles` set, the reconcile target is raised to `debug` so every
/// rollback decision is visible.
pub fn filter_directives(config: Option<&Config>) -> String {
    let Some(config) = config else {
        return DEFAULT_FILTER.to_string();
    };
    let mut directives = if config.debug.log_level.is_empty() {
        DEFAULT_FILTER.to_string()
    } else {
        config.debug.log_level.clone()
    };
    if config.debug.print_reconciles {
        directives.push_str(",nebula_predict::world=debug");
    }
    directives
}

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file (debug builds only)
/// * `debug_build` - enables the file layer
/// * `config` - optional configuration supplying the log level
///
/// ```no_run
/// use nebula_log::init_logging;
///
/// init_logging(Some(std::path::Path::new("./logs")), true, None);
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let directives = filter_directives(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directives));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(false)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE_NAME))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        return;
    }

    subscriber.init();
}

/// `EnvFilter` built from [`DEFAULT_FILTER`].
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_contains_engine_target() {
        let filter_str = format!("{}", default_env_filter());
        assert!(filter_str.contains("nebula_predict=info"));
        assert!(filter_str.contains("info"));
    }

    #[test]
    fn test_directives_without_config() {
        assert_eq!(filter_directives(None), DEFAULT_FILTER);
    }

    #[test]
    fn test_directives_follow_config_level() {
        let mut config = Config::default();
        config.debug.log_level = "warn,nebula_demo=debug".to_string();
        assert_eq!(filter_directives(Some(&config)), "warn,nebula_demo=debug");

        config.debug.log_level.clear();
        assert_eq!(filter_directives(Some(&config)), DEFAULT_FILTER);
    }

    #[test]
    fn test_print_reconciles_raises_world_target() {
        let mut config = Config::default();
        config.debug.print_reconciles = true;
        let directives = filter_directives(Some(&config));
        assert!(directives.starts_with("info"));
        assert!(directives.ends_with("nebula_predict::world=debug"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_env_filter_parsing() {
        let valid_filters = [
            "info",
            "debug,nebula_predict=trace",
            "warn,nebula_predict::replication=debug",
            "error",
        ];
        for filter_str in &valid_filters {
            assert!(
                EnvFilter::try_new(*filter_str).is_ok(),
                "Failed to parse filter: {}",
                filter_str
            );
        }
    }

    #[test]
    fn test_log_file_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_file_path = temp_dir.path().join(LOG_FILE_NAME);
        std::fs::write(&log_file_path, "{}\n").unwrap();
        let contents = std::fs::read_to_string(&log_file_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert!(parsed.is_object());
    }
}
