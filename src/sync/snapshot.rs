//! Per-run snapshots of the two trees being reconciled: the remote
//! collection (breadth-first PROPFIND walk) and the local directory
//! (walkdir). Paths are relative, `/`-separated, with no leading slash.

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::SyncError;
use crate::webdav::{Depth, WebDavClient};
use crate::webdav::props::href_to_relative;

/// Directory holding the state database and trash; never synchronized.
pub const STATE_DIR_NAME: &str = ".davmirror";

/// One file in the remote tree.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub path: String,
    pub etag: Option<String>,
    pub modified: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
}

/// Snapshot of the remote collection tree.
#[derive(Debug, Clone, Default)]
pub struct RemoteTree {
    /// Files keyed by relative path
    pub files: BTreeMap<String, RemoteEntry>,
    /// Relative paths of collections (root excluded)
    pub collections: BTreeSet<String>,
}

/// One file in the local tree.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub path: String,
    /// Last modification time in whole seconds since the epoch
    pub modified: i64,
    pub size: u64,
}

/// Compiles exclusion globs matched against relative paths.
pub fn build_excludes(patterns: &[String]) -> Result<GlobSet, SyncError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| SyncError::BadPattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| SyncError::BadPattern {
        pattern: patterns.join(","),
        message: e.to_string(),
    })
}

/// Walks the remote tree one collection at a time (Depth 1 per request;
/// Depth infinity is widely rejected).
pub async fn snapshot_remote(
    client: &WebDavClient,
    excludes: &GlobSet,
) -> Result<RemoteTree, SyncError> {
    let base = client.connection().config().webdav_url();
    let mut tree = RemoteTree::default();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(String::new());

    while let Some(collection) = queue.pop_front() {
        let entries = client.propfind(&collection, Depth::One).await?;

        for props in entries {
            let Some(relative) = href_to_relative(&base, &props.href) else {
                warn!("Ignoring out-of-base href: {}", props.href);
                continue;
            };
            if relative == collection || relative.is_empty() {
                continue; // the collection reports itself at Depth 1
            }
            if excludes.is_match(&relative) || relative == STATE_DIR_NAME {
                debug!("Excluded remote entry: {}", relative);
                continue;
            }

            if props.is_collection {
                tree.collections.insert(relative.clone());
                queue.push_back(relative);
            } else {
                tree.files.insert(
                    relative.clone(),
                    RemoteEntry {
                        path: relative,
                        etag: props.etag.clone(),
                        modified: props.last_modified,
                        content_type: props.content_type.clone(),
                    },
                );
            }
        }
    }

    debug!(
        "Remote snapshot: {} files, {} collections",
        tree.files.len(),
        tree.collections.len()
    );
    Ok(tree)
}

/// Walks the local root, yielding files keyed by relative path. The
/// state directory and excluded paths are invisible to the diff.
pub fn snapshot_local(
    root: &Path,
    excludes: &GlobSet,
) -> Result<BTreeMap<String, LocalEntry>, SyncError> {
    if !root.is_dir() {
        return Err(SyncError::BadLocalRoot(root.display().to_string()));
    }

    let mut entries = BTreeMap::new();

    for item in WalkDir::new(root).follow_links(false) {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                warn!("Skipping unreadable local entry: {}", e);
                continue;
            }
        };

        let relative = match item.path().strip_prefix(root) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if relative == STATE_DIR_NAME || relative.starts_with(&format!("{}/", STATE_DIR_NAME)) {
            continue;
        }
        if excludes.is_match(&relative) {
            debug!("Excluded local entry: {}", relative);
            continue;
        }

        if !item.file_type().is_file() {
            continue;
        }

        let metadata = item
            .metadata()
            .map_err(|e| SyncError::io(&relative, e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "metadata unavailable")
            })))?;

        entries.insert(
            relative.clone(),
            LocalEntry {
                path: relative,
                modified: file_mtime(&metadata),
                size: metadata.len(),
            },
        );
    }

    debug!("Local snapshot: {} files", entries.len());
    Ok(entries)
}

/// Modification time in whole seconds. Sub-second precision is dropped
/// so values round-trip through the state database unchanged.
pub fn file_mtime(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
