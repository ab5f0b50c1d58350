//! Typed WebDAV verbs over the authenticated connection. Each method maps
//! one protocol operation; multistatus bodies are parsed via [`super::xml`].

use futures_util::StreamExt;
use reqwest::Method;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::connection::{ServerCapabilities, WebDavConnection};
use super::xml::{self, ResourceProps};
use crate::errors::WebDavError;

/// PROPFIND Depth header values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Depth {
    fn header_value(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        }
    }
}

/// Outcome of a PUT, carrying the ETag the server assigned (when sent).
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub etag: Option<String>,
}

#[derive(Clone)]
pub struct WebDavClient {
    connection: WebDavConnection,
}

impl WebDavClient {
    pub fn new(connection: WebDavConnection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &WebDavConnection {
        &self.connection
    }

    pub fn url_for_path(&self, path: &str) -> String {
        self.connection.url_for_path(path)
    }

    fn ext_method(name: &'static str) -> Result<Method, WebDavError> {
        Method::from_bytes(name.as_bytes())
            .map_err(|_| WebDavError::Config(format!("invalid method token {}", name)))
    }

    /// Queries properties of a resource and, for Depth 1/infinity, its
    /// members.
    pub async fn propfind(
        &self,
        path: &str,
        depth: Depth,
    ) -> Result<Vec<ResourceProps>, WebDavError> {
        let url = self.url_for_path(path);
        debug!("PROPFIND {} (depth {})", url, depth.header_value());

        let response = self
            .connection
            .request(
                Self::ext_method("PROPFIND")?,
                &url,
                Some(xml::PROPFIND_BODY.as_bytes().to_vec()),
                &[
                    ("Depth", depth.header_value()),
                    ("Content-Type", "application/xml"),
                ],
            )
            .await?;

        let body = response.text().await?;
        xml::parse_multistatus(&body)
    }

    /// Downloads a resource into memory.
    pub async fn get(&self, path: &str) -> Result<Vec<u8>, WebDavError> {
        let url = self.url_for_path(path);
        debug!("GET {}", url);

        let response = self.connection.request(Method::GET, &url, None, &[]).await?;
        let content = response.bytes().await?;
        Ok(content.to_vec())
    }

    /// Downloads a resource, streaming it to a local file.
    pub async fn get_to_file(&self, path: &str, local: &Path) -> Result<u64, WebDavError> {
        let url = self.url_for_path(path);
        debug!("GET {} -> {}", url, local.display());

        let response = self.connection.request(Method::GET, &url, None, &[]).await?;

        let mut file = tokio::fs::File::create(local).await.map_err(|e| {
            WebDavError::Config(format!("cannot create {}: {}", local.display(), e))
        })?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(|e| {
                WebDavError::Config(format!("cannot write {}: {}", local.display(), e))
            })?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| {
            WebDavError::Config(format!("cannot flush {}: {}", local.display(), e))
        })?;

        Ok(written)
    }

    /// Uploads a resource body.
    pub async fn put(
        &self,
        path: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<PutOutcome, WebDavError> {
        let url = self.url_for_path(path);
        debug!("PUT {} ({} bytes)", url, body.len());

        let content_type = content_type.unwrap_or("application/octet-stream");
        let response = self
            .connection
            .request(
                Method::PUT,
                &url,
                Some(body),
                &[("Content-Type", content_type)],
            )
            .await?;

        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Ok(PutOutcome { etag })
    }

    /// Uploads a local file, guessing the content type from the name.
    pub async fn put_file(&self, path: &str, local: &Path) -> Result<PutOutcome, WebDavError> {
        let body = tokio::fs::read(local).await.map_err(|e| {
            WebDavError::Config(format!("cannot read {}: {}", local.display(), e))
        })?;

        let mime = mime_guess::from_path(local).first_or_octet_stream();
        self.put(path, body, Some(mime.essence_str())).await
    }

    /// Creates a collection.
    pub async fn mkcol(&self, path: &str) -> Result<(), WebDavError> {
        let url = self.url_for_path(path);
        debug!("MKCOL {}", url);

        self.connection
            .request(Self::ext_method("MKCOL")?, &url, None, &[])
            .await?;
        Ok(())
    }

    /// Deletes a resource or collection (collections are removed
    /// recursively by the server).
    pub async fn delete(&self, path: &str) -> Result<(), WebDavError> {
        let url = self.url_for_path(path);
        debug!("DELETE {}", url);

        let response = self
            .connection
            .request(Method::DELETE, &url, None, &[])
            .await?;
        self.check_multistatus(response, &url).await
    }

    /// Copies a resource server-side.
    pub async fn copy(&self, from: &str, to: &str, overwrite: bool) -> Result<(), WebDavError> {
        self.copy_or_move(Self::ext_method("COPY")?, from, to, overwrite)
            .await
    }

    /// Moves (renames) a resource server-side.
    pub async fn move_to(&self, from: &str, to: &str, overwrite: bool) -> Result<(), WebDavError> {
        self.copy_or_move(Self::ext_method("MOVE")?, from, to, overwrite)
            .await
    }

    async fn copy_or_move(
        &self,
        method: Method,
        from: &str,
        to: &str,
        overwrite: bool,
    ) -> Result<(), WebDavError> {
        let url = self.url_for_path(from);
        let destination = self.url_for_path(to);
        debug!("{} {} -> {}", method, url, destination);

        let response = self
            .connection
            .request(
                method,
                &url,
                None,
                &[
                    ("Destination", destination.as_str()),
                    ("Overwrite", if overwrite { "T" } else { "F" }),
                ],
            )
            .await?;
        self.check_multistatus(response, &url).await
    }

    /// Sets and removes dead properties on a resource.
    pub async fn proppatch(
        &self,
        path: &str,
        set: &[(&str, &str)],
        remove: &[&str],
    ) -> Result<(), WebDavError> {
        let url = self.url_for_path(path);
        debug!("PROPPATCH {}", url);

        let body = xml::proppatch_body(set, remove);
        let response = self
            .connection
            .request(
                Self::ext_method("PROPPATCH")?,
                &url,
                Some(body.into_bytes()),
                &[("Content-Type", "application/xml")],
            )
            .await?;
        self.check_multistatus(response, &url).await
    }

    /// Takes an exclusive write lock, returning the lock token.
    pub async fn lock(
        &self,
        path: &str,
        owner: &str,
        timeout_seconds: u64,
    ) -> Result<String, WebDavError> {
        let url = self.url_for_path(path);
        debug!("LOCK {}", url);

        let timeout = format!("Second-{}", timeout_seconds);
        let body = xml::lock_body(owner);
        let response = self
            .connection
            .request(
                Self::ext_method("LOCK")?,
                &url,
                Some(body.into_bytes()),
                &[
                    ("Timeout", timeout.as_str()),
                    ("Content-Type", "application/xml"),
                    ("Depth", "0"),
                ],
            )
            .await?;

        // Prefer the Lock-Token header; fall back to the response body.
        if let Some(token) = response
            .headers()
            .get("lock-token")
            .and_then(|v| v.to_str().ok())
        {
            return Ok(token.trim_start_matches('<').trim_end_matches('>').to_string());
        }

        let body = response.text().await?;
        xml::parse_lock_token(&body)?.ok_or(WebDavError::MissingLockToken { url })
    }

    /// Releases a lock taken with [`Self::lock`].
    pub async fn unlock(&self, path: &str, token: &str) -> Result<(), WebDavError> {
        let url = self.url_for_path(path);
        debug!("UNLOCK {}", url);

        let token_header = format!("<{}>", token.trim_start_matches('<').trim_end_matches('>'));
        self.connection
            .request(
                Self::ext_method("UNLOCK")?,
                &url,
                None,
                &[("Lock-Token", token_header.as_str())],
            )
            .await?;
        Ok(())
    }

    /// Probes server capabilities with OPTIONS.
    pub async fn capabilities(&self) -> Result<ServerCapabilities, WebDavError> {
        self.connection.capabilities().await
    }

    /// A 207 on DELETE/COPY/MOVE/PROPPATCH reports per-resource failures;
    /// surface the first one as the operation's error.
    async fn check_multistatus(
        &self,
        response: reqwest::Response,
        url: &str,
    ) -> Result<(), WebDavError> {
        if response.status() != reqwest::StatusCode::MULTI_STATUS {
            return Ok(());
        }

        let body = response.text().await?;
        let entries = xml::parse_multistatus(&body)?;
        for entry in entries {
            let failure = entry
                .status
                .filter(|s| *s >= 400)
                .or(entry.propstat_failure.filter(|s| *s >= 400));
            if let Some(status) = failure {
                return Err(WebDavError::UnexpectedStatus {
                    status,
                    url: format!("{} ({})", url, entry.decoded_href()),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_header_values() {
        assert_eq!(Depth::Zero.header_value(), "0");
        assert_eq!(Depth::One.header_value(), "1");
        assert_eq!(Depth::Infinity.header_value(), "infinity");
    }
}
