pub mod validation;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Deployment profile. Selects the default continuation ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Development,
    Production,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::Development => write!(f, "development"),
            Profile::Production => write!(f, "production"),
        }
    }
}

impl Profile {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(Profile::Production),
            "development" | "dev" => Some(Profile::Development),
            _ => None,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub profile: Profile,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_max_blocking_threads: Option<usize>,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_max_body_bytes() -> usize {
    50 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            profile: Profile::default(),
            max_body_bytes: default_max_body_bytes(),
            runtime_worker_threads: None,
            runtime_max_blocking_threads: None,
        }
    }
}

/// Upstream assistant service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_fp")]
    pub fp: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_upstream_headers")]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(default)]
    pub http_use_env_proxy: bool,
}

fn default_upstream_url() -> String {
    "https://leaves.mintlify.com/api/assistant/mintlify/message".to_string()
}
fn default_fp() -> String {
    "mintlify".to_string()
}
fn default_upstream_headers() -> BTreeMap<String, String> {
    [
        ("accept", "*/*"),
        ("accept-language", "en-US,en;q=0.9"),
        ("origin", "https://mintlify.com"),
        ("referer", "https://mintlify.com/"),
        (
            "user-agent",
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36",
        ),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            fp: default_fp(),
            proxy: None,
            headers: default_upstream_headers(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            http_use_env_proxy: false,
        }
    }
}

/// Continuation policy knobs. Defaults reproduce the stock stopping policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationConfig {
    #[serde(default = "default_completion_marker")]
    pub completion_marker: String,
    /// Ceiling on rounds; `None` picks the profile default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_continuations: Option<u32>,
    #[serde(default = "default_short_output_chars")]
    pub short_output_chars: usize,
    #[serde(default = "default_likely_complete_chars")]
    pub likely_complete_chars: usize,
    #[serde(default = "default_forced_stop_round")]
    pub forced_stop_round: u32,
    #[serde(default = "default_context_window_chars")]
    pub context_window_chars: usize,
    #[serde(default = "default_long_round_chars")]
    pub long_round_chars: usize,
    #[serde(default = "default_continue_delay_ms")]
    pub continue_delay_ms: u64,
    #[serde(default = "default_long_round_delay_ms")]
    pub long_round_delay_ms: u64,
    #[serde(default = "default_fragment_buffer")]
    pub fragment_buffer: usize,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_completion_marker() -> String {
    "<built>".to_string()
}
fn default_short_output_chars() -> usize {
    1_000
}
fn default_likely_complete_chars() -> usize {
    3_000
}
fn default_forced_stop_round() -> u32 {
    2
}
fn default_context_window_chars() -> usize {
    2_000
}
fn default_long_round_chars() -> usize {
    10_000
}
fn default_continue_delay_ms() -> u64 {
    2_000
}
fn default_long_round_delay_ms() -> u64 {
    3_000
}
fn default_fragment_buffer() -> usize {
    64
}
fn default_keepalive_interval_secs() -> u64 {
    10
}

const PRODUCTION_MAX_CONTINUATIONS: u32 = 3;
const DEVELOPMENT_MAX_CONTINUATIONS: u32 = 15;

impl ContinuationConfig {
    /// Round ceiling after applying the profile default.
    #[must_use]
    pub fn effective_max_continuations(&self, profile: Profile) -> u32 {
        self.max_continuations.unwrap_or(match profile {
            Profile::Production => PRODUCTION_MAX_CONTINUATIONS,
            Profile::Development => DEVELOPMENT_MAX_CONTINUATIONS,
        })
    }
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            completion_marker: default_completion_marker(),
            max_continuations: None,
            short_output_chars: default_short_output_chars(),
            likely_complete_chars: default_likely_complete_chars(),
            forced_stop_round: default_forced_stop_round(),
            context_window_chars: default_context_window_chars(),
            long_round_chars: default_long_round_chars(),
            continue_delay_ms: default_continue_delay_ms(),
            long_round_delay_ms: default_long_round_delay_ms(),
            fragment_buffer: default_fragment_buffer(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            system_prompt: None,
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_tokenizer_model")]
    pub tokenizer_model: String,
    #[serde(default = "default_response_model")]
    pub response_model: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_tokenizer_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_response_model() -> String {
    "mintlify".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            tokenizer_model: default_tokenizer_model(),
            response_model: default_response_model(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub continuation: ContinuationConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_yaml::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration like [`load_config`], falling back to defaults when the
/// file does not exist, then apply environment overrides and re-validate.
///
/// # Errors
///
/// Same as [`load_config`], except a missing file is not an error.
pub fn load_config_with_env(path: &str) -> Result<AppConfig, ConfigError> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => serde_yaml::from_str(&contents)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(err) => return Err(err.into()),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Apply `PORT`, `HOST`, `STITCH_PROFILE` and `STITCH_LOG_LEVEL` overrides.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when an override cannot be parsed.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("PORT") {
        config.server.port = port
            .trim()
            .parse()
            .map_err(|_| ConfigError::Validation(format!("PORT is not a valid port: {port}")))?;
    }
    if let Some(host) = lookup("HOST") {
        config.server.host = host;
    }
    if let Some(profile) = lookup("STITCH_PROFILE") {
        config.server.profile = Profile::parse(&profile).ok_or_else(|| {
            ConfigError::Validation(format!("STITCH_PROFILE has unknown value '{profile}'"))
        })?;
    }
    if let Some(level) = lookup("STITCH_LOG_LEVEL") {
        config.features.log_level = level;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.profile, Profile::Development);
        assert_eq!(config.continuation.completion_marker, "<built>");
        assert_eq!(config.upstream.fp, "mintlify");
    }

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.max_body_bytes, 50 * 1024 * 1024);
        assert_eq!(config.continuation.short_output_chars, 1_000);
        assert_eq!(config.continuation.likely_complete_chars, 3_000);
        assert_eq!(config.continuation.keepalive_interval_secs, 10);
        assert!(config.upstream.headers.contains_key("user-agent"));
    }

    #[test]
    fn test_profile_selects_max_continuations() {
        let continuation = ContinuationConfig::default();
        assert_eq!(
            continuation.effective_max_continuations(Profile::Production),
            3
        );
        assert_eq!(
            continuation.effective_max_continuations(Profile::Development),
            15
        );

        let pinned = ContinuationConfig {
            max_continuations: Some(7),
            ..ContinuationConfig::default()
        };
        assert_eq!(pinned.effective_max_continuations(Profile::Production), 7);
    }

    #[test]
    fn test_profile_serde() {
        let json = serde_json::to_string(&Profile::Production).unwrap();
        assert_eq!(json, "\"production\"");
        let profile: Profile = serde_yaml::from_str("development").unwrap();
        assert_eq!(profile, Profile::Development);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, |key| match key {
            "PORT" => Some("9100".to_string()),
            "STITCH_PROFILE" => Some("prod".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.profile, Profile::Production);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_env_override_rejects_bad_port() {
        let mut config = AppConfig::default();
        let err = apply_env_overrides(&mut config, |key| {
            (key == "PORT").then(|| "eighty".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = load_config_with_env("definitely-not-here.yaml").unwrap();
        assert_eq!(config.continuation.forced_stop_round, 2);
    }
}
