use serde::Deserialize;
use std::{env, path::Path, path::PathBuf};
use thiserror::Error;

use crate::gmail::DEFAULT_API_BASE;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub gmail: GmailConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub port: u16,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub database: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub export_traces: bool,
}

/// Connection settings for the Gmail label sync. When disabled, label changes
/// are only applied to the local store.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct GmailConfig {
    pub enabled: bool,
    pub api_base: String,
    pub user_id: String,
    pub access_token: String,
    pub timeout_secs: u64,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: DEFAULT_API_BASE.to_string(),
            user_id: "me".to_string(),
            access_token: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct EngineConfig {
    /// Upper bound on messages processed in parallel by the action executor.
    pub action_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            action_concurrency: 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid APP_PORT override: {0}")]
    InvalidPort(std::num::ParseIntError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        cfg.check()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("APP_PORT") {
            self.app.port = port.parse().map_err(ConfigError::InvalidPort)?;
        }

        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        if let Ok(token) = env::var("GMAIL_ACCESS_TOKEN") {
            self.gmail.access_token = token;
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker_path(&mut self.paths.database)?;
        if let Some(endpoint) = &mut self.telemetry.otlp_endpoint {
            apply_env_marker(endpoint)?;
        }
        // Only an enabled sync needs its credentials resolved.
        if self.gmail.enabled {
            apply_env_marker(&mut self.gmail.api_base)?;
            apply_env_marker(&mut self.gmail.user_id)?;
            apply_env_marker(&mut self.gmail.access_token)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        let database_string = self.paths.database.to_string_lossy().to_string();
        let database = shellexpand::tilde(&database_string);
        self.paths.database = PathBuf::from(database.as_ref());
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.engine.action_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "engine.action_concurrency must be at least 1".to_string(),
            ));
        }
        if self.gmail.enabled && self.gmail.access_token.is_empty() {
            return Err(ConfigError::Invalid(
                "gmail.access_token is required when gmail sync is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}
