use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use thiserror::Error;

use crate::net::broadcast::ResolverSettings;
use crate::net::dispatch::DispatchSettings;
use crate::net::game::ServerVersion;
use crate::net::registry::DEFAULT_MAX_VARIABLE_LENGTH;
use crate::net::schema::Epoch;
use crate::net::session::SessionTable;
use crate::telemetry::logging::{self, LogConfig};

pub const PACKET_DB_ENV: &str = "MAPWIRE_PACKET_DB";
pub const EPOCH_ENV: &str = "MAPWIRE_EPOCH";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Relative paths resolve against the config file's directory.
    pub packet_db: PathBuf,
    /// Epoch given to every accepted connection.
    pub default_epoch: u32,
    pub area_size: u16,
    pub chat_area_shrink: u16,
    pub max_variable_length: u16,
    pub frames_per_turn: usize,
    pub auth_offense_limit: usize,
    pub auth_offense_window_ms: u64,
    pub offense_table_capacity: usize,
    pub max_sessions: usize,
    pub trace_dir: PathBuf,
    pub log_level: String,
    pub server_version: ServerVersion,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            packet_db: PathBuf::from("db/packet_db.yml"),
            default_epoch: 20040705,
            area_size: 14,
            chat_area_shrink: 5,
            max_variable_length: DEFAULT_MAX_VARIABLE_LENGTH,
            frames_per_turn: 8,
            auth_offense_limit: 5,
            auth_offense_window_ms: 10_000,
            offense_table_capacity: 1024,
            max_sessions: 1024,
            trace_dir: PathBuf::from("trace"),
            log_level: logging::DEFAULT_LEVEL.to_string(),
            server_version: ServerVersion::default(),
        }
    }
}

impl EngineConfig {
    /// Reads a YAML config, applies environment overrides and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: EngineConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_env()?;
        config.resolve_paths(base);
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
                path: "<inline>".to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = env_value(PACKET_DB_ENV) {
            self.packet_db = PathBuf::from(value);
        }
        if let Some(value) = env_value(EPOCH_ENV) {
            self.default_epoch = value.parse().map_err(|_| ConfigError::Invalid {
                field: "default_epoch",
                reason: format!("{EPOCH_ENV}='{value}' is not a number"),
            })?;
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.packet_db.is_relative() {
            self.packet_db = base.join(&self.packet_db);
        }
        if self.trace_dir.is_relative() {
            self.trace_dir = base.join(&self.trace_dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.area_size == 0 {
            return Err(ConfigError::Invalid {
                field: "area_size",
                reason: "must be positive".to_string(),
            });
        }
        if self.chat_area_shrink > self.area_size {
            return Err(ConfigError::Invalid {
                field: "chat_area_shrink",
                reason: format!("{} exceeds area_size {}", self.chat_area_shrink, self.area_size),
            });
        }
        if self.max_variable_length < 4 {
            return Err(ConfigError::Invalid {
                field: "max_variable_length",
                reason: "cannot hold a variable frame header".to_string(),
            });
        }
        if self.frames_per_turn == 0 {
            return Err(ConfigError::Invalid {
                field: "frames_per_turn",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::Invalid {
                field: "max_sessions",
                reason: "must be positive".to_string(),
            });
        }
        logging::parse_level(&self.log_level).map_err(|reason| ConfigError::Invalid {
            field: "log_level",
            reason,
        })?;
        Ok(())
    }

    pub fn epoch(&self) -> Epoch {
        Epoch(self.default_epoch)
    }

    /// Session table sized by `max_sessions`.
    pub fn session_table(&self) -> SessionTable {
        SessionTable::new(self.max_sessions)
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            frames_per_turn: self.frames_per_turn,
            auth_offense_limit: self.auth_offense_limit,
            auth_offense_window: Duration::from_millis(self.auth_offense_window_ms),
            offense_table_capacity: self.offense_table_capacity,
            resolver: ResolverSettings {
                area_size: self.area_size,
                chat_area_shrink: self.chat_area_shrink,
            },
            version: self.server_version,
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[derive(Debug, Parser)]
#[command(name = "mapwire", about = "Map server packet engine tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load the config and packet db, then print a per-epoch summary.
    Check { config: PathBuf },
    /// Replay a raw client byte capture and print every decoded frame.
    Decode {
        config: PathBuf,
        capture: PathBuf,
        /// Client epoch of the capture; defaults to the config's.
        #[arg(long)]
        epoch: Option<u32>,
        /// Do not treat the capture as already logged in.
        #[arg(long)]
        anonymous: bool,
    },
}

impl Cli {
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        Cli::try_parse_from(args).map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_takes_defaults() {
        let config = EngineConfig::from_yaml_str("{}").expect("config");
        assert_eq!(config, EngineConfig::default());
        let settings = config.dispatch_settings();
        assert_eq!(settings.resolver.chat_radius(), 9);
        assert_eq!(settings.auth_offense_window, Duration::from_secs(10));
    }

    #[test]
    fn session_table_honors_max_sessions() {
        let config = EngineConfig::from_yaml_str("max_sessions: 2").expect("config");
        let mut sessions = config.session_table();
        assert!(sessions.accept(config.epoch()).is_some());
        assert!(sessions.accept(config.epoch()).is_some());
        assert_eq!(sessions.accept(config.epoch()), None);
        assert!(matches!(
            EngineConfig::from_yaml_str("max_sessions: 0"),
            Err(ConfigError::Invalid {
                field: "max_sessions",
                ..
            })
        ));
    }

    #[test]
    fn overrides_and_rejections() {
        let config = EngineConfig::from_yaml_str(
            "area_size: 20\nframes_per_turn: 2\nserver_version: { major: 3 }\n",
        )
        .expect("config");
        assert_eq!(config.area_size, 20);
        assert_eq!(config.server_version.major, 3);
        assert_eq!(config.server_version.server_type, 8);

        assert!(matches!(
            EngineConfig::from_yaml_str("chat_area_shrink: 30"),
            Err(ConfigError::Invalid {
                field: "chat_area_shrink",
                ..
            })
        ));
        assert!(matches!(
            EngineConfig::from_yaml_str("log_level: chatty"),
            Err(ConfigError::Invalid {
                field: "log_level",
                ..
            })
        ));
        assert!(matches!(
            EngineConfig::from_yaml_str("area_sise: 3"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = std::env::temp_dir().join(format!("mapwire-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("mapwire.yml");
        std::fs::write(&path, "packet_db: packets.yml\n").expect("write");
        let config = EngineConfig::load(&path).expect("load");
        if std::env::var(PACKET_DB_ENV).is_err() {
            assert_eq!(config.packet_db, dir.join("packets.yml"));
        }
        assert_eq!(config.trace_dir, dir.join("trace"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn cli_parses_subcommands() {
        let args: Vec<String> = ["mapwire", "decode", "cfg.yml", "cap.bin", "--epoch", "20031231"]
            .iter()
            .map(|arg| arg.to_string())
            .collect();
        let cli = Cli::from_args(&args).expect("cli");
        match cli.command {
            Command::Decode {
                epoch, anonymous, ..
            } => {
                assert_eq!(epoch, Some(20031231));
                assert!(!anonymous);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(Cli::from_args(&["mapwire".to_string()]).is_err());
    }
}
