use std::str::FromStr;

use env_logger::Env;
use log::LevelFilter;

pub const DEFAULT_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL.to_string(),
        }
    }
}

/// Installs the process logger. `RUST_LOG` wins over `level`. A second call
/// is a no-op.
pub fn init(config: &LogConfig) -> Result<(), String> {
    parse_level(&config.level)?;
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(config.level.as_str()))
        .format_timestamp_millis()
        .try_init();
    Ok(())
}

pub fn parse_level(level: &str) -> Result<LevelFilter, String> {
    LevelFilter::from_str(level.trim()).map_err(|_| format!("unknown log level '{}'", level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert_eq!(parse_level("info"), Ok(LevelFilter::Info));
        assert_eq!(parse_level(" DEBUG "), Ok(LevelFilter::Debug));
        assert_eq!(parse_level("off"), Ok(LevelFilter::Off));
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = LogConfig::default();
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
        assert!(init(&LogConfig {
            level: "verbose".to_string()
        })
        .is_err());
    }
}
