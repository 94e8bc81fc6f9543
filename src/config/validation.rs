use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream(config)?;
    validate_continuation(config)?;
    validate_log_level(config)?;
    validate_system_prompt(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.max_body_bytes == 0 {
        return Err(validation_err(
            "server.max_body_bytes must be greater than 0",
        ));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    if let Some(max_blocking_threads) = server.runtime_max_blocking_threads {
        if max_blocking_threads == 0 {
            return Err(validation_err(
                "server.runtime_max_blocking_threads must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    validate_http_url("upstream.url", Some(upstream.url.as_str()))?;
    validate_http_url("upstream.proxy", upstream.proxy.as_deref())?;
    if upstream.fp.trim().is_empty() {
        return Err(validation_err("upstream.fp cannot be empty"));
    }
    if upstream.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "upstream.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    for name in upstream.headers.keys() {
        if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
            return Err(validation_err(format!(
                "upstream.headers contains an invalid header name '{name}'"
            )));
        }
    }
    Ok(())
}

fn validate_http_url(field_name: &str, value: Option<&str>) -> Result<(), ConfigError> {
    let Some(value) = value.map(str::trim) else {
        return Ok(());
    };
    if value.is_empty() {
        return Err(validation_err(format!(
            "{field_name} cannot be empty when set"
        )));
    }
    let parsed = url::Url::parse(value)
        .map_err(|err| validation_err(format!("{field_name} is not a valid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "{field_name} must use http:// or https://"
        )));
    }
    Ok(())
}

fn validate_continuation(config: &AppConfig) -> Result<(), ConfigError> {
    let continuation = &config.continuation;
    if continuation.completion_marker.trim().is_empty() {
        return Err(validation_err(
            "continuation.completion_marker cannot be empty",
        ));
    }
    if continuation.effective_max_continuations(config.server.profile) == 0 {
        return Err(validation_err(
            "continuation.max_continuations must be greater than 0",
        ));
    }
    if continuation.context_window_chars == 0 {
        return Err(validation_err(
            "continuation.context_window_chars must be greater than 0",
        ));
    }
    if continuation.fragment_buffer == 0 {
        return Err(validation_err(
            "continuation.fragment_buffer must be greater than 0",
        ));
    }
    if continuation.keepalive_interval_secs == 0 {
        return Err(validation_err(
            "continuation.keepalive_interval_secs must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}

fn validate_system_prompt(config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(ref prompt) = config.continuation.system_prompt {
        if prompt.trim().is_empty() {
            return Err(validation_err(
                "continuation.system_prompt cannot be empty when set",
            ));
        }
    }
    Ok(())
}
