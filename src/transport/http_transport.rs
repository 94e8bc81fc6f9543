use std::time::Duration;

use futures_util::StreamExt;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::HeaderMap;

use crate::config::UpstreamConfig;
use crate::error::GatewayError;
use crate::protocol::upstream::UpstreamPayload;
use crate::util::truncate_for_log;

use super::{UpstreamByteStream, UpstreamTransport};

/// Upstream error bodies are cut to this many bytes before surfacing.
const ERROR_BODY_MAX_BYTES: usize = 512;

fn build_reqwest_client(config: &UpstreamConfig) -> Result<reqwest::Client, GatewayError> {
    let pool_idle_timeout = if config.http_pool_idle_timeout_secs == 0 {
        None
    } else {
        Some(Duration::from_secs(config.http_pool_idle_timeout_secs))
    };

    // No request timeout: long generations are bounded by the round policy.
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.http_pool_max_idle_per_host.max(1))
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = config.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| GatewayError::Config(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !config.http_use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| GatewayError::Config(format!("Failed to build HTTP client: {err}")))
}

fn build_headers(config: &UpstreamConfig) -> Result<HeaderMap, GatewayError> {
    let mut headers = HeaderMap::with_capacity(config.headers.len() + 1);
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| GatewayError::Config(format!("Invalid header name '{name}': {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| GatewayError::Config(format!("Invalid value for '{name}': {err}")))?;
        headers.insert(name, value);
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// reqwest-backed transport posting payloads to the configured upstream URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: url::Url,
    headers: HeaderMap,
}

impl HttpTransport {
    /// Build the client, parsed URL and header set once.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when the URL, proxy or headers are invalid.
    pub fn new(config: &UpstreamConfig) -> Result<Self, GatewayError> {
        let url = url::Url::parse(&config.url)
            .map_err(|err| GatewayError::Config(format!("Invalid upstream URL: {err}")))?;
        Ok(Self {
            client: build_reqwest_client(config)?,
            url,
            headers: build_headers(config)?,
        })
    }
}

impl UpstreamTransport for HttpTransport {
    async fn open_round(
        &self,
        payload: &UpstreamPayload,
    ) -> Result<UpstreamByteStream, GatewayError> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| GatewayError::Internal(format!("Failed to encode payload: {err}")))?;

        let response = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                body = %truncate_for_log(&text, ERROR_BODY_MAX_BYTES),
                "upstream returned error status"
            );
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                message: truncate_for_log(&text, ERROR_BODY_MAX_BYTES),
            });
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| GatewayError::Transport(err.to_string())));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_parses_url_and_headers() {
        let transport = HttpTransport::new(&UpstreamConfig::default()).unwrap();
        assert_eq!(transport.url.scheme(), "https");
        assert_eq!(
            transport.headers.get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert!(transport.headers.contains_key("user-agent"));
    }

    #[test]
    fn test_proxy_client_builds() {
        let config = UpstreamConfig {
            proxy: Some("http://127.0.0.1:8080".to_string()),
            ..UpstreamConfig::default()
        };
        assert!(HttpTransport::new(&config).is_ok());
    }

    #[test]
    fn test_invalid_header_value_is_config_error() {
        let mut config = UpstreamConfig::default();
        config
            .headers
            .insert("x-test".to_string(), "bad\nvalue".to_string());
        assert!(matches!(
            HttpTransport::new(&config),
            Err(GatewayError::Config(_))
        ));
    }
}
