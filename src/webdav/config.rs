use crate::errors::WebDavError;

/// WebDAV server configuration
#[derive(Debug, Clone)]
pub struct WebDavConfig {
    pub server_url: String,
    pub username: String,
    pub password: String,
    pub timeout_seconds: u64,
    pub server_type: Option<String>, // "nextcloud", "owncloud", "generic"
}

/// Retry configuration for WebDAV operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub rate_limit_backoff_ms: u64, // Additional backoff for 429 responses
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            rate_limit_backoff_ms: 5000,
        }
    }
}

impl WebDavConfig {
    pub fn new(server_url: String, username: String, password: String) -> Self {
        Self {
            server_url,
            username,
            password,
            timeout_seconds: 30,
            server_type: None,
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), WebDavError> {
        if self.server_url.is_empty() {
            return Err(WebDavError::Config("server URL cannot be empty".into()));
        }

        if self.username.is_empty() {
            return Err(WebDavError::Config("username cannot be empty".into()));
        }

        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(WebDavError::Config(
                "server URL must start with http:// or https://".into(),
            ));
        }

        Ok(())
    }

    /// Returns the base URL for WebDAV operations, accounting for
    /// server-specific path prefixes.
    pub fn webdav_url(&self) -> String {
        let mut url = self.server_url.trim_end_matches('/').to_string();

        match self.server_type.as_deref() {
            Some("nextcloud") => {
                if !url.contains("/remote.php/dav/files/") {
                    url.push_str(&format!("/remote.php/dav/files/{}", self.username));
                }
            }
            Some("owncloud") => {
                if !url.contains("/remote.php/webdav") {
                    url.push_str("/remote.php/webdav");
                }
            }
            _ => {
                // Generic WebDAV - use the URL as provided
            }
        }

        url
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }
}
