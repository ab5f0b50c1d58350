use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::config::{RetryConfig, WebDavConfig};
use crate::errors::WebDavError;

/// Capabilities advertised by the server on OPTIONS.
#[derive(Debug, Clone)]
pub struct ServerCapabilities {
    pub dav_compliance: String,
    pub allowed_methods: String,
    pub server_software: Option<String>,
    pub supports_etag: bool,
    pub supports_locking: bool,
}

/// Authenticated HTTP transport for WebDAV requests with retry and
/// backoff for transient failures.
#[derive(Clone)]
pub struct WebDavConnection {
    client: Client,
    config: WebDavConfig,
    retry_config: RetryConfig,
}

impl WebDavConnection {
    pub fn new(config: WebDavConfig, retry_config: RetryConfig) -> Result<Self, WebDavError> {
        config.validate()?;
        let client = Client::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            client,
            config,
            retry_config,
        })
    }

    pub fn config(&self) -> &WebDavConfig {
        &self.config
    }

    /// Gets the absolute URL for a decoded path relative to the WebDAV
    /// base, percent-encoding each segment.
    pub fn url_for_path(&self, path: &str) -> String {
        let base_url = self.config.webdav_url();
        let clean_path = path.trim_start_matches('/');

        if clean_path.is_empty() {
            return base_url;
        }

        let encoded = clean_path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/{}", base_url.trim_end_matches('/'), encoded)
    }

    /// Issues an authenticated request, retrying transient failures with
    /// exponential backoff. 2xx and 207 responses are returned to the
    /// caller; anything else becomes a typed `WebDavError`.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        headers: &[(&str, &str)],
    ) -> Result<reqwest::Response, WebDavError> {
        let mut attempt = 0;
        let mut delay = self.retry_config.initial_delay_ms;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .basic_auth(&self.config.username, Some(&self.config.password));

            if let Some(ref body_content) = body {
                request = request.body(body_content.clone());
            }

            for (key, value) in headers {
                request = request.header(*key, *value);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() || status == StatusCode::MULTI_STATUS {
                        return Ok(response);
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS
                        && attempt < self.retry_config.max_retries
                    {
                        warn!(
                            "Rate limited on {}, backing off for {}ms (attempt {}/{})",
                            url,
                            self.retry_config.rate_limit_backoff_ms,
                            attempt + 1,
                            self.retry_config.max_retries
                        );
                        sleep(Duration::from_millis(self.retry_config.rate_limit_backoff_ms))
                            .await;
                        attempt += 1;
                        continue;
                    }

                    if status.is_server_error() && attempt < self.retry_config.max_retries {
                        warn!(
                            "Server error {} on {}, retrying in {}ms (attempt {}/{})",
                            status,
                            url,
                            delay,
                            attempt + 1,
                            self.retry_config.max_retries
                        );

                        sleep(Duration::from_millis(delay)).await;
                        delay = next_delay(delay, &self.retry_config);
                        attempt += 1;
                        continue;
                    }

                    let message = response.text().await.unwrap_or_default();
                    return Err(WebDavError::from_status(status, &method, url, message));
                }
                Err(e) => {
                    if attempt < self.retry_config.max_retries {
                        warn!(
                            "Request error on {}: {}, retrying in {}ms (attempt {}/{})",
                            url,
                            e,
                            delay,
                            attempt + 1,
                            self.retry_config.max_retries
                        );

                        sleep(Duration::from_millis(delay)).await;
                        delay = next_delay(delay, &self.retry_config);
                        attempt += 1;
                        continue;
                    }

                    return Err(WebDavError::Request(e));
                }
            }
        }
    }

    /// Probes server capabilities with an OPTIONS request.
    pub async fn capabilities(&self) -> Result<ServerCapabilities, WebDavError> {
        let url = self.config.webdav_url();
        let response = self.request(Method::OPTIONS, &url, None, &[]).await?;

        let dav_header = response
            .headers()
            .get("dav")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let allow_header = response
            .headers()
            .get("allow")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let server_header = response
            .headers()
            .get("server")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        debug!("DAV compliance: '{}', allow: '{}'", dav_header, allow_header);

        Ok(ServerCapabilities {
            supports_etag: dav_header.contains('1') || dav_header.contains('2'),
            supports_locking: dav_header.contains('2'),
            dav_compliance: dav_header,
            allowed_methods: allow_header,
            server_software: server_header,
        })
    }
}

fn next_delay(delay: u64, retry_config: &RetryConfig) -> u64 {
    std::cmp::min(
        (delay as f64 * retry_config.backoff_multiplier) as u64,
        retry_config.max_delay_ms,
    )
}
