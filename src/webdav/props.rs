//! Helpers layered on the client: existence and resource-type queries,
//! single live-property access, and listings keyed by path relative to
//! the WebDAV base.

use chrono::{DateTime, Utc};
use url::Url;

use super::client::{Depth, WebDavClient};
use super::xml::ResourceProps;
use crate::errors::WebDavError;

/// A multistatus entry resolved to a path relative to the WebDAV base.
#[derive(Debug, Clone)]
pub struct ListedResource {
    pub path: String,
    pub props: ResourceProps,
}

impl WebDavClient {
    /// True when the resource exists on the server.
    pub async fn exists(&self, path: &str) -> Result<bool, WebDavError> {
        match self.propfind(path, Depth::Zero).await {
            Ok(_) => Ok(true),
            Err(WebDavError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// True when the resource is a collection.
    pub async fn is_collection(&self, path: &str) -> Result<bool, WebDavError> {
        let props = self.props(path).await?;
        Ok(props.is_collection)
    }

    /// Properties of a single resource (Depth 0).
    pub async fn props(&self, path: &str) -> Result<ResourceProps, WebDavError> {
        let url = self.url_for_path(path);
        self.propfind(path, Depth::Zero)
            .await?
            .into_iter()
            .next()
            .ok_or(WebDavError::NotFound { url })
    }

    pub async fn etag(&self, path: &str) -> Result<Option<String>, WebDavError> {
        Ok(self.props(path).await?.etag)
    }

    pub async fn last_modified(&self, path: &str) -> Result<Option<DateTime<Utc>>, WebDavError> {
        Ok(self.props(path).await?.last_modified)
    }

    pub async fn content_length(&self, path: &str) -> Result<Option<i64>, WebDavError> {
        Ok(self.props(path).await?.content_length)
    }

    pub async fn content_type(&self, path: &str) -> Result<Option<String>, WebDavError> {
        Ok(self.props(path).await?.content_type)
    }

    /// Sets a single dead property in the DAV: namespace.
    pub async fn set_property(
        &self,
        path: &str,
        name: &str,
        value: &str,
    ) -> Result<(), WebDavError> {
        self.proppatch(path, &[(name, value)], &[]).await
    }

    /// Removes a single dead property.
    pub async fn remove_property(&self, path: &str, name: &str) -> Result<(), WebDavError> {
        self.proppatch(path, &[], &[name]).await
    }

    /// Lists the members of a collection (Depth 1, the collection itself
    /// excluded), with paths relative to the WebDAV base.
    pub async fn list(&self, path: &str) -> Result<Vec<ListedResource>, WebDavError> {
        let base = self.connection().config().webdav_url();
        let entries = self.propfind(path, Depth::One).await?;

        let self_path = normalize_relative(path);
        let mut members = Vec::new();
        for props in entries {
            let Some(relative) = href_to_relative(&base, &props.href) else {
                continue;
            };
            if relative == self_path {
                continue;
            }
            members.push(ListedResource {
                path: relative,
                props,
            });
        }
        Ok(members)
    }
}

/// Strips leading/trailing slashes so relative paths compare cleanly.
pub fn normalize_relative(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// Resolves a multistatus href (absolute path or full URL, possibly
/// percent-encoded) to a path relative to the WebDAV base URL. Returns
/// `None` when the href lies outside the base.
pub fn href_to_relative(base_url: &str, href: &str) -> Option<String> {
    let base_path = match Url::parse(base_url) {
        Ok(url) => url.path().to_string(),
        Err(_) => base_url.to_string(),
    };
    let base_path = decode(&base_path);
    let base_path = base_path.trim_end_matches('/');

    let href_path = match Url::parse(href) {
        Ok(url) => url.path().to_string(),
        // Relative reference: multistatus hrefs are absolute paths
        Err(_) => href.to_string(),
    };
    let href_path = decode(&href_path);

    let remainder = href_path.strip_prefix(base_path)?;
    if !remainder.is_empty() && !remainder.starts_with('/') {
        // "/webdavother" must not match a base of "/webdav"
        return None;
    }

    Some(normalize_relative(remainder))
}

fn decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}
