//! Bootstrap utilities for the strata binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the STRATA_LOG environment variable.
///
/// Defaults to "info" level if STRATA_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Configuration file path from `--config <path>` or the first positional
/// argument. `STRATA_CONFIG` is honored later by `Config::load`.
pub fn parse_config_path() -> Option<String> {
    config_path_from_args(std::env::args().skip(1))
}

fn config_path_from_args(mut args: impl Iterator<Item = String>) -> Option<String> {
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
        if !arg.starts_with('-') {
            return Some(arg);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_config_path_flag() {
        assert_eq!(
            config_path_from_args(args(&["--config", "strata.yaml"])),
            Some("strata.yaml".to_string())
        );
        assert_eq!(
            config_path_from_args(args(&["--config=other.yaml"])),
            Some("other.yaml".to_string())
        );
    }

    #[test]
    fn test_config_path_positional() {
        assert_eq!(
            config_path_from_args(args(&["conf/strata.yaml"])),
            Some("conf/strata.yaml".to_string())
        );
    }

    #[test]
    fn test_config_path_absent() {
        assert_eq!(config_path_from_args(args(&[])), None);
        assert_eq!(config_path_from_args(args(&["--verbose"])), None);
    }
}
