use enhancer_contracts::DisplayMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub lookup: Lookup,
    #[serde(default)]
    pub relay: Relay,
    #[serde(default)]
    pub display: Display,
    pub store: Store,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lookup {
    pub feed_endpoint: String,
    #[serde(default = "default_key_param")]
    pub key_param: String,
    pub timeout_ms: u64,
}

/// Boundary relay settings. A missing `request_timeout_ms` waits for a reply
/// indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: Option<u64>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Display {
    #[serde(default)]
    pub mode: DisplayMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
    #[serde(default)]
    pub label_max_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_key_param() -> String {
    "channel_id".to_string()
}

fn default_request_timeout_ms() -> Option<u64> {
    Some(15_000)
}

fn default_queue_capacity() -> usize {
    256
}

fn default_log_filter() -> String {
    "info".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    parse_and_validate(&config_text)
}

pub fn parse_and_validate(config_text: &str) -> Result<Config, ConfigError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if !cfg.lookup.feed_endpoint.starts_with("http://")
        && !cfg.lookup.feed_endpoint.starts_with("https://")
    {
        return Err(ConfigError::UnsupportedConfig(format!(
            "lookup.feed_endpoint={} must be an http(s) URL",
            cfg.lookup.feed_endpoint
        )));
    }
    if cfg.lookup.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "lookup.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.relay.request_timeout_ms == Some(0) {
        return Err(ConfigError::UnsupportedConfig(
            "relay.request_timeout_ms must be >= 1 when set".to_string(),
        ));
    }
    if cfg.relay.queue_capacity == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "relay.queue_capacity must be >= 1".to_string(),
        ));
    }
    Ok(())
}
