use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::frame_buffer::DisplayConfig;
use crate::streaming::ScanOptions;
use crate::transport::ConnectionConfig;

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub scan: ScanOptions,
    pub display: DisplayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Load configuration with layered fallbacks: defaults, then the file, then
/// `RUSTY_BEAM__*` environment variables.
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        for path in ["rusty_beam.toml", "config.toml"] {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // e.g. RUSTY_BEAM__CONNECTION__PORT=2018
    builder = builder.add_source(
        Environment::with_prefix("RUSTY_BEAM")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize::<AppConfig>()
}

/// Like [`load_config`], falling back to defaults on any error
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.connection.port, 2017);
        assert_eq!(config.scan.latency, 65536);
        assert_eq!(config.scan.window, 32);
        assert_eq!(config.display.fps, 60.0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("rusty_beam_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("beam.toml");
        std::fs::write(
            &path,
            r#"
[connection]
host = "10.0.0.5"
read_timeout = 2.5

[scan]
latency = 4096
output = "eight_bit"

[logging]
level = "debug"
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert_eq!(config.connection.host, "10.0.0.5");
        assert_eq!(config.connection.port, 2017);
        assert_eq!(config.connection.read_timeout, Duration::from_millis(2500));
        assert_eq!(config.scan.latency, 4096);
        assert_eq!(config.scan.window, 32);
        assert_eq!(config.scan.output, crate::types::OutputMode::EightBit);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let missing = Path::new("/nonexistent/rusty_beam.toml");
        assert!(load_config(Some(missing)).is_err());
        assert_eq!(load_config_or_default(Some(missing)), AppConfig::default());
    }
}
