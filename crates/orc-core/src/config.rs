//! Layered configuration for the orchestrator daemon (Section 6.3).
//!
//! Four layers, lowest to highest precedence: built-in defaults, an
//! optional base `config.toml`, an optional environment-specific overlay
//! `config.<env>.toml` (env picked by `ORCD_ENV`, default `development`),
//! and process environment variables prefixed `ORCD_`. Unlike a
//! dynamic-dictionary merge, every key is matched against a known field;
//! an unrecognised key is a hard error rather than a silent warning.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4780,
            cors_origin: "*".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data: PathBuf,
    pub workloads: PathBuf,
    /// Filesystem root outside of which workers may not write; `"*"`
    /// disables the sandbox entirely.
    pub allowed_write_path: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data: PathBuf::from("data"),
            workloads: PathBuf::from("workloads"),
            allowed_write_path: "*".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub default_model: String,
    pub use_mock: bool,
    pub concurrency: usize,
    pub retries: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            default_model: "sonnet".to_string(),
            use_mock: false,
            concurrency: 1,
            retries: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ExecWorkerConfig {
    pub timeout: u64,
    pub shell: String,
}

impl Default for ExecWorkerConfig {
    fn default() -> Self {
        Self {
            timeout: 30_000,
            shell: "/bin/sh".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FetchWorkerConfig {
    pub timeout: u64,
    pub user_agent: String,
}

impl Default for FetchWorkerConfig {
    fn default() -> Self {
        Self {
            timeout: 15_000,
            user_agent: "orcd/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub exec: ExecWorkerConfig,
    pub fetch: FetchWorkerConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Top-level configuration, one field per Section 6.3 option group.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub ai: AiConfig,
    pub workers: WorkersConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn defaults() -> Self {
        Self::default()
    }

    /// Build the fully layered configuration from a config directory and
    /// the process environment, per Section 6.3.
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::defaults();

        let base = config_dir.join("config.toml");
        if base.is_file() {
            config.merge_file(&base)?;
        }

        let env_name = std::env::var("ORCD_ENV").unwrap_or_else(|_| "development".to_string());
        let overlay = config_dir.join(format!("config.{env_name}.toml"));
        if overlay.is_file() {
            config.merge_file(&overlay)?;
        }

        config.merge_env()?;
        Ok(config)
    }

    pub fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        self.merge_toml_str(&content, path)
    }

    fn merge_toml_str(&mut self, content: &str, path: &Path) -> Result<(), ConfigError> {
        let value: toml::Value =
            toml::from_str(content).map_err(|source| ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
        let Some(table) = value.as_table() else {
            return Ok(());
        };
        for (section, section_value) in table {
            let Some(section_table) = section_value.as_table() else {
                return Err(ConfigError::UnknownKey(section.clone()));
            };
            for (key, v) in section_table {
                self.apply_table_value(section, key, v)?;
            }
        }
        Ok(())
    }

    fn apply_table_value(&mut self, section: &str, key: &str, value: &toml::Value) -> Result<(), ConfigError> {
        let full_key = || format!("{section}.{key}");
        match (section, key) {
            ("server", "port") => {
                self.server.port = value.as_integer().and_then(|v| u16::try_from(v).ok()).ok_or_else(|| {
                    ConfigError::InvalidValue {
                        key: full_key(),
                        value: value.to_string(),
                    }
                })?
            }
            ("server", "cors_origin") | ("server", "corsOrigin") => {
                self.server.cors_origin = as_string(value, full_key)?
            }
            ("paths", "data") => self.paths.data = PathBuf::from(as_string(value, full_key)?),
            ("paths", "workloads") => self.paths.workloads = PathBuf::from(as_string(value, full_key)?),
            ("paths", "allowed_write_path") | ("paths", "allowedWritePath") => {
                self.paths.allowed_write_path = as_string(value, full_key)?
            }
            ("ai", "default_model") | ("ai", "defaultModel") => {
                self.ai.default_model = as_string(value, full_key)?
            }
            ("ai", "use_mock") | ("ai", "useMock") => self.ai.use_mock = as_bool(value, full_key)?,
            ("ai", "concurrency") => {
                self.ai.concurrency = value.as_integer().and_then(|v| usize::try_from(v).ok()).ok_or_else(|| {
                    ConfigError::InvalidValue {
                        key: full_key(),
                        value: value.to_string(),
                    }
                })?
            }
            ("ai", "retries") => {
                self.ai.retries = value.as_integer().and_then(|v| u32::try_from(v).ok()).ok_or_else(|| {
                    ConfigError::InvalidValue {
                        key: full_key(),
                        value: value.to_string(),
                    }
                })?
            }
            ("workers", "exec") => {
                let Some(sub) = value.as_table() else {
                    return Err(ConfigError::UnknownKey(full_key()));
                };
                for (k, v) in sub {
                    self.apply_table_value("workers.exec", k, v)?;
                }
            }
            ("workers", "fetch") => {
                let Some(sub) = value.as_table() else {
                    return Err(ConfigError::UnknownKey(full_key()));
                };
                for (k, v) in sub {
                    self.apply_table_value("workers.fetch", k, v)?;
                }
            }
            ("workers.exec", "timeout") => {
                self.workers.exec.timeout = value.as_integer().and_then(|v| u64::try_from(v).ok()).ok_or_else(|| {
                    ConfigError::InvalidValue {
                        key: full_key(),
                        value: value.to_string(),
                    }
                })?
            }
            ("workers.exec", "shell") => self.workers.exec.shell = as_string(value, full_key)?,
            ("workers.fetch", "timeout") => {
                self.workers.fetch.timeout = value.as_integer().and_then(|v| u64::try_from(v).ok()).ok_or_else(|| {
                    ConfigError::InvalidValue {
                        key: full_key(),
                        value: value.to_string(),
                    }
                })?
            }
            ("workers.fetch", "user_agent") | ("workers.fetch", "userAgent") => {
                self.workers.fetch.user_agent = as_string(value, full_key)?
            }
            ("logging", "level") => self.logging.level = as_string(value, full_key)?,
            _ => return Err(ConfigError::UnknownKey(full_key())),
        }
        Ok(())
    }

    /// Final overlay: process environment variables prefixed `ORCD_`, e.g.
    /// `ORCD_SERVER_PORT`, `ORCD_PATHS_DATA`.
    fn merge_env(&mut self) -> Result<(), ConfigError> {
        for (name, value) in std::env::vars() {
            let Some(rest) = name.strip_prefix("ORCD_") else {
                continue;
            };
            if rest == "ENV" {
                continue;
            }
            self.apply_env_var(rest, &value)?;
        }
        Ok(())
    }

    fn apply_env_var(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let lower = key.to_lowercase();
        let full_key = || lower.replace('_', ".");
        match lower.as_str() {
            "server_port" => {
                self.server.port = value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: full_key(),
                    value: value.to_string(),
                })?
            }
            "server_cors_origin" => self.server.cors_origin = value.to_string(),
            "paths_data" => self.paths.data = PathBuf::from(value),
            "paths_workloads" => self.paths.workloads = PathBuf::from(value),
            "paths_allowed_write_path" => self.paths.allowed_write_path = value.to_string(),
            "ai_default_model" => self.ai.default_model = value.to_string(),
            "ai_use_mock" => {
                self.ai.use_mock = parse_env_bool(value).ok_or_else(|| ConfigError::InvalidValue {
                    key: full_key(),
                    value: value.to_string(),
                })?
            }
            "ai_concurrency" => {
                self.ai.concurrency = value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: full_key(),
                    value: value.to_string(),
                })?
            }
            "ai_retries" => {
                self.ai.retries = value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: full_key(),
                    value: value.to_string(),
                })?
            }
            "workers_exec_timeout" => {
                self.workers.exec.timeout = value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: full_key(),
                    value: value.to_string(),
                })?
            }
            "workers_exec_shell" => self.workers.exec.shell = value.to_string(),
            "workers_fetch_timeout" => {
                self.workers.fetch.timeout = value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: full_key(),
                    value: value.to_string(),
                })?
            }
            "workers_fetch_user_agent" => self.workers.fetch.user_agent = value.to_string(),
            "logging_level" => self.logging.level = value.to_string(),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

fn as_string(value: &toml::Value, full_key: impl Fn() -> String) -> Result<String, ConfigError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: full_key(),
            value: value.to_string(),
        })
}

fn as_bool(value: &toml::Value, full_key: impl Fn() -> String) -> Result<bool, ConfigError> {
    value.as_bool().ok_or_else(|| ConfigError::InvalidValue {
        key: full_key(),
        value: value.to_string(),
    })
}

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::defaults();
        assert_eq!(config.server.port, 4780);
        assert_eq!(config.ai.concurrency, 1);
        assert_eq!(config.paths.allowed_write_path, "*");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn merge_toml_overrides_nested_fields() {
        let mut config = Config::defaults();
        let toml_str = r#"
[server]
port = 9090

[workers.exec]
timeout = 5000
"#;
        config
            .merge_toml_str(toml_str, Path::new("test.toml"))
            .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.workers.exec.timeout, 5000);
        assert_eq!(config.workers.exec.shell, "/bin/sh");
    }

    #[test]
    fn unknown_top_level_key_is_an_error() {
        let mut config = Config::defaults();
        let toml_str = "bogus = 1";
        let err = config
            .merge_toml_str(toml_str, Path::new("test.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(_)));
    }

    #[test]
    fn unknown_nested_key_is_an_error() {
        let mut config = Config::defaults();
        let toml_str = "[server]\nbogus = 1";
        let err = config
            .merge_toml_str(toml_str, Path::new("test.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(_)));
    }

    #[test]
    fn env_overlay_wins_over_file() {
        std::env::set_var("ORCD_SERVER_PORT", "7777");
        let mut config = Config::defaults();
        config.merge_env().unwrap();
        std::env::remove_var("ORCD_SERVER_PORT");
        assert_eq!(config.server.port, 7777);
    }
}
