//! Three-way reconciliation of a local directory tree against a remote
//! WebDAV collection, diffing both against the persisted last-known
//! state. Classification is pure; application is sequential with
//! per-file error containment.

use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::observer::{Conflict, ConflictKind, Resolution, SyncEvent, SyncObserver};
use super::snapshot::{
    self, build_excludes, snapshot_local, snapshot_remote, LocalEntry, RemoteEntry, RemoteTree,
    STATE_DIR_NAME,
};
use super::state::{RemoteFileState, StateDb};
use crate::errors::{SyncError, WebDavError};
use crate::webdav::WebDavClient;

/// Which way changes propagate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local changes propagate to the remote collection
    Up,
    /// Remote changes propagate to the local tree
    Down,
    /// Changes propagate both ways
    #[default]
    Both,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub direction: Direction,
    pub dry_run: bool,
    pub detect_renames: bool,
    pub excludes: Vec<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            direction: Direction::Both,
            dry_run: false,
            detect_renames: true,
            excludes: Vec::new(),
        }
    }
}

/// Counters for one completed pass.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub uploaded: usize,
    pub downloaded: usize,
    pub deleted_remote: usize,
    pub trashed_local: usize,
    pub renamed: usize,
    pub conflicts_resolved: usize,
    pub conflicts_skipped: usize,
    pub errors: usize,
}

impl SyncSummary {
    /// True when the pass left divergences or failures behind.
    pub fn has_failures(&self) -> bool {
        self.errors > 0 || self.conflicts_skipped > 0
    }
}

/// One planned mutation, produced by classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Upload { path: String },
    Download { path: String },
    DeleteRemote { path: String },
    TrashLocal { path: String },
    RenameLocal { from: String, to: String },
    Conflicted(Conflict),
    /// Deleted on both sides; only the state rows remain to drop
    Forget { path: String },
}

impl Change {
    fn path(&self) -> &str {
        match self {
            Change::Upload { path }
            | Change::Download { path }
            | Change::DeleteRemote { path }
            | Change::TrashLocal { path }
            | Change::Forget { path } => path,
            Change::RenameLocal { from, .. } => from,
            Change::Conflicted(c) => &c.path,
        }
    }
}

fn local_changed(entry: Option<&LocalEntry>, prior: Option<&i64>) -> bool {
    match (entry, prior) {
        (Some(e), Some(p)) => e.modified != *p,
        (Some(_), None) => true,
        _ => false,
    }
}

/// ETags are opaque and compared verbatim; without them the comparison
/// degrades to whole-second mtimes, and with neither the entry counts
/// as changed.
fn remote_changed(entry: Option<&RemoteEntry>, prior: Option<&RemoteFileState>) -> bool {
    let Some(entry) = entry else { return false };
    let Some(prior) = prior else { return true };

    match (&entry.etag, &prior.etag) {
        (Some(a), Some(b)) => a != b,
        _ => match (entry.modified.map(|d| d.timestamp()), prior.modified) {
            (Some(a), Some(b)) => a != b,
            _ => true,
        },
    }
}

/// Detects remote renames: a tracked path vanished while an untracked
/// path appeared with the same ETag. Requires the local copy at the old
/// path to be unchanged and the new path to be locally free.
fn detect_renames(
    local: &HashMap<String, LocalEntry>,
    remote: &RemoteTree,
    prior_local: &HashMap<String, i64>,
    prior_remote: &HashMap<String, RemoteFileState>,
) -> (Vec<Change>, HashSet<String>) {
    let mut appeared: HashMap<&str, Vec<&str>> = HashMap::new();
    for (path, entry) in &remote.files {
        if prior_remote.contains_key(path) {
            continue;
        }
        if let Some(etag) = entry.etag.as_deref() {
            appeared.entry(etag).or_default().push(path);
        }
    }

    let mut changes = Vec::new();
    let mut handled = HashSet::new();

    // BTreeMap-ordered old paths keep detection deterministic.
    let mut gone: Vec<(&String, &RemoteFileState)> = prior_remote
        .iter()
        .filter(|(path, _)| !remote.files.contains_key(*path))
        .collect();
    gone.sort_by(|a, b| a.0.cmp(b.0));

    for (old_path, prior_state) in gone {
        let Some(etag) = prior_state.etag.as_deref() else {
            continue;
        };
        if local_changed(local.get(old_path), prior_local.get(old_path)) {
            continue;
        }
        if !local.contains_key(old_path) {
            continue;
        }

        let Some(candidates) = appeared.get_mut(etag) else {
            continue;
        };
        let Some(position) = candidates.iter().position(|p| !local.contains_key(*p)) else {
            continue;
        };
        let new_path = candidates.remove(position).to_string();

        handled.insert(old_path.clone());
        handled.insert(new_path.clone());
        changes.push(Change::RenameLocal {
            from: old_path.clone(),
            to: new_path,
        });
    }

    (changes, handled)
}

/// Classifies every path in the union of the four maps into planned
/// changes. Pure; the engine applies the result.
pub fn classify(
    local: &HashMap<String, LocalEntry>,
    remote: &RemoteTree,
    prior_local: &HashMap<String, i64>,
    prior_remote: &HashMap<String, RemoteFileState>,
    direction: Direction,
    renames: bool,
) -> Vec<Change> {
    let (mut changes, handled) =
        if renames && direction != Direction::Up {
            detect_renames(local, remote, prior_local, prior_remote)
        } else {
            (Vec::new(), HashSet::new())
        };

    let mut paths: BTreeSet<&String> = BTreeSet::new();
    paths.extend(local.keys());
    paths.extend(remote.files.keys());
    paths.extend(prior_local.keys());
    paths.extend(prior_remote.keys());

    for path in paths {
        if handled.contains(path.as_str()) {
            continue;
        }

        let local_entry = local.get(path);
        let remote_entry = remote.files.get(path);
        let in_prior_local = prior_local.contains_key(path);
        let in_prior_remote = prior_remote.contains_key(path);

        let lc = local_changed(local_entry, prior_local.get(path));
        let rc = remote_changed(remote_entry, prior_remote.get(path));
        let local_deleted = in_prior_local && local_entry.is_none();
        let remote_deleted = in_prior_remote && remote_entry.is_none();

        let conflict = |kind| {
            Change::Conflicted(Conflict {
                path: path.clone(),
                kind,
            })
        };

        let change = match (local_entry.is_some(), remote_entry.is_some(), direction) {
            (true, true, Direction::Both) => match (lc, rc) {
                (true, true) => Some(conflict(ConflictKind::Update)),
                (true, false) => Some(Change::Upload { path: path.clone() }),
                (false, true) => Some(Change::Download { path: path.clone() }),
                (false, false) => None,
            },
            (true, false, Direction::Both) => {
                if remote_deleted {
                    if lc {
                        Some(conflict(ConflictKind::DeleteRemote))
                    } else {
                        Some(Change::TrashLocal { path: path.clone() })
                    }
                } else {
                    Some(Change::Upload { path: path.clone() })
                }
            }
            (false, true, Direction::Both) => {
                if local_deleted {
                    if rc {
                        Some(conflict(ConflictKind::DeleteLocal))
                    } else {
                        Some(Change::DeleteRemote { path: path.clone() })
                    }
                } else {
                    Some(Change::Download { path: path.clone() })
                }
            }

            (true, true, Direction::Up) => match (lc, rc) {
                (true, true) => Some(conflict(ConflictKind::Update)),
                (true, false) => Some(Change::Upload { path: path.clone() }),
                _ => None,
            },
            (true, false, Direction::Up) => Some(Change::Upload { path: path.clone() }),
            (false, true, Direction::Up) => {
                if local_deleted {
                    if rc {
                        Some(conflict(ConflictKind::DeleteLocal))
                    } else {
                        Some(Change::DeleteRemote { path: path.clone() })
                    }
                } else {
                    None
                }
            }

            (true, true, Direction::Down) => match (rc, lc) {
                (true, true) => Some(conflict(ConflictKind::Update)),
                (true, false) => Some(Change::Download { path: path.clone() }),
                _ => None,
            },
            (false, true, Direction::Down) => Some(Change::Download { path: path.clone() }),
            (true, false, Direction::Down) => {
                if remote_deleted {
                    if lc {
                        Some(conflict(ConflictKind::DeleteRemote))
                    } else {
                        Some(Change::TrashLocal { path: path.clone() })
                    }
                } else {
                    None
                }
            }

            (false, false, _) => {
                if local_deleted || remote_deleted {
                    Some(Change::Forget { path: path.clone() })
                } else {
                    None
                }
            }
        };

        if let Some(change) = change {
            changes.push(change);
        }
    }

    changes
}

pub struct SyncEngine {
    client: WebDavClient,
    local_root: PathBuf,
    state: StateDb,
    options: SyncOptions,
    observer: Arc<dyn SyncObserver>,
}

impl SyncEngine {
    pub fn new(
        client: WebDavClient,
        local_root: PathBuf,
        state: StateDb,
        options: SyncOptions,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        Self {
            client,
            local_root,
            state,
            options,
            observer,
        }
    }

    /// Runs one synchronization pass.
    pub async fn run(&self) -> Result<SyncSummary, SyncError> {
        let remote_url = self.client.connection().config().webdav_url();
        self.observer.started(&self.local_root, &remote_url);

        let excludes = build_excludes(&self.options.excludes)?;
        let local = snapshot_local(&self.local_root, &excludes)?;
        let local: HashMap<String, LocalEntry> = local.into_iter().collect();
        let remote = snapshot_remote(&self.client, &excludes).await?;
        let prior_local = self.state.load_local().await?;
        let prior_remote = self.state.load_remote().await?;

        let changes = classify(
            &local,
            &remote,
            &prior_local,
            &prior_remote,
            self.options.direction,
            self.options.detect_renames,
        );
        info!("Classified {} changes", changes.len());

        let mut pass = Pass {
            engine: self,
            local: &local,
            prior_local: &prior_local,
            prior_remote: &prior_remote,
            new_local: local.iter().map(|(k, v)| (k.clone(), v.modified)).collect(),
            new_remote: remote
                .files
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        RemoteFileState {
                            modified: v.modified.map(|d| d.timestamp()),
                            etag: v.etag.clone(),
                        },
                    )
                })
                .collect(),
            known_collections: remote.collections.clone(),
            trash_stamp: Utc::now().format("%Y%m%d-%H%M%S").to_string(),
            summary: SyncSummary::default(),
        };

        for change in changes {
            pass.process(change).await;
        }

        let Pass {
            new_local,
            new_remote,
            mut summary,
            ..
        } = pass;

        if self.options.dry_run {
            info!("Dry run: state not persisted");
        } else {
            self.state.replace(&new_local, &new_remote).await?;
            self.state
                .record_sync(
                    &self.local_root.to_string_lossy(),
                    &remote_url,
                    Utc::now().timestamp(),
                )
                .await?;
        }

        if summary.conflicts_skipped > 0 {
            debug!("{} conflicts left unresolved", summary.conflicts_skipped);
        }
        Ok(summary)
    }
}

/// Mutable bookkeeping for one pass over the classified changes.
struct Pass<'a> {
    engine: &'a SyncEngine,
    local: &'a HashMap<String, LocalEntry>,
    prior_local: &'a HashMap<String, i64>,
    prior_remote: &'a HashMap<String, RemoteFileState>,
    new_local: HashMap<String, i64>,
    new_remote: HashMap<String, RemoteFileState>,
    known_collections: BTreeSet<String>,
    trash_stamp: String,
    summary: SyncSummary,
}

impl<'a> Pass<'a> {
    async fn process(&mut self, change: Change) {
        let (change, from_conflict) = match change {
            Change::Conflicted(conflict) => {
                match self.engine.observer.resolve(&conflict) {
                    Resolution::Skip => {
                        self.engine
                            .observer
                            .event(&SyncEvent::ConflictSkipped { conflict: conflict.clone() });
                        self.summary.conflicts_skipped += 1;
                        // Unresolved: keep prior rows so it resurfaces
                        self.restore_prior(&conflict.path);
                        return;
                    }
                    resolution => (
                        resolve_conflict(conflict, resolution == Resolution::UseLocal),
                        true,
                    ),
                }
            }
            change => (change, false),
        };

        let path = change.path().to_string();
        match self.apply(&change).await {
            Ok(()) => {
                if from_conflict {
                    self.summary.conflicts_resolved += 1;
                }
            }
            Err(e) => {
                self.engine.observer.error(&path, &e.to_string());
                self.summary.errors += 1;
                self.restore_prior(&path);
                if let Change::RenameLocal { to, .. } = &change {
                    self.restore_prior(to);
                }
            }
        }
    }

    async fn apply(&mut self, change: &Change) -> Result<(), SyncError> {
        let dry_run = self.engine.options.dry_run;

        match change {
            Change::Upload { path } => {
                if !dry_run {
                    self.upload(path).await?;
                }
                self.engine
                    .observer
                    .event(&SyncEvent::Uploaded { path: path.clone() });
                self.summary.uploaded += 1;
            }
            Change::Download { path } => {
                if !dry_run {
                    self.download(path).await?;
                }
                self.engine
                    .observer
                    .event(&SyncEvent::Downloaded { path: path.clone() });
                self.summary.downloaded += 1;
            }
            Change::DeleteRemote { path } => {
                if !dry_run {
                    match self.engine.client.delete(path).await {
                        Ok(()) | Err(WebDavError::NotFound { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                    self.new_remote.remove(path);
                    self.new_local.remove(path);
                }
                self.engine
                    .observer
                    .event(&SyncEvent::DeletedRemote { path: path.clone() });
                self.summary.deleted_remote += 1;
            }
            Change::TrashLocal { path } => {
                let trash_path = if dry_run {
                    self.trash_target(path)
                } else {
                    self.trash(path)?
                };
                self.engine.observer.event(&SyncEvent::TrashedLocal {
                    path: path.clone(),
                    trash_path,
                });
                self.summary.trashed_local += 1;
            }
            Change::RenameLocal { from, to } => {
                if !dry_run {
                    self.rename_local(from, to)?;
                }
                self.engine.observer.event(&SyncEvent::RenamedLocal {
                    from: from.clone(),
                    to: to.clone(),
                });
                self.summary.renamed += 1;
            }
            Change::Forget { path } => {
                if !dry_run {
                    self.new_local.remove(path);
                    self.new_remote.remove(path);
                }
            }
            Change::Conflicted(_) => unreachable!("resolved before apply"),
        }

        Ok(())
    }

    async fn upload(&mut self, path: &str) -> Result<(), SyncError> {
        let local_path = self.local_path(path)?;
        self.ensure_remote_parents(path).await?;

        let client = &self.engine.client;
        let outcome = match client.put_file(path, &local_path).await {
            // Version-controlled servers may refuse PUT on a stale
            // resource; delete and retry once.
            Err(WebDavError::MethodNotAllowed { .. }) => {
                debug!("PUT on {} not allowed, deleting and retrying once", path);
                client.delete(path).await?;
                client.put_file(path, &local_path).await?
            }
            outcome => outcome?,
        };

        let (etag, modified) = match outcome.etag {
            Some(etag) => (Some(etag), None),
            None => match client.props(path).await {
                Ok(props) => (props.etag, props.last_modified.map(|d| d.timestamp())),
                Err(_) => (None, None),
            },
        };

        self.new_remote
            .insert(path.to_string(), RemoteFileState { modified, etag });
        if let Some(entry) = self.local.get(path) {
            self.new_local.insert(path.to_string(), entry.modified);
        }
        Ok(())
    }

    async fn download(&mut self, path: &str) -> Result<(), SyncError> {
        let local_path = self.local_path(path)?;
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::io(path, e))?;
        }

        self.engine
            .client
            .get_to_file(path, &local_path)
            .await?;

        let metadata = std::fs::metadata(&local_path).map_err(|e| SyncError::io(path, e))?;
        self.new_local
            .insert(path.to_string(), snapshot::file_mtime(&metadata));
        Ok(())
    }

    fn trash(&mut self, path: &str) -> Result<String, SyncError> {
        let from = self.local_path(path)?;
        let target = self.trash_target(path);
        let to = self.engine.local_root.join(&target);

        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::io(path, e))?;
        }
        std::fs::rename(&from, &to).map_err(|e| SyncError::io(path, e))?;

        self.new_local.remove(path);
        self.new_remote.remove(path);
        Ok(target)
    }

    fn trash_target(&self, path: &str) -> String {
        format!("{}/trash/{}/{}", STATE_DIR_NAME, self.trash_stamp, path)
    }

    fn rename_local(&mut self, from: &str, to: &str) -> Result<(), SyncError> {
        let src = self.local_path(from)?;
        let dst = self.local_path(to)?;
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::io(to, e))?;
        }
        std::fs::rename(&src, &dst).map_err(|e| SyncError::io(from, e))?;

        self.new_local.remove(from);
        self.new_remote.remove(from);
        let metadata = std::fs::metadata(&dst).map_err(|e| SyncError::io(to, e))?;
        self.new_local
            .insert(to.to_string(), snapshot::file_mtime(&metadata));
        Ok(())
    }

    /// Creates missing ancestor collections before an upload. MKCOL on
    /// an existing collection answers 405.
    async fn ensure_remote_parents(&mut self, path: &str) -> Result<(), SyncError> {
        let mut prefix = String::new();
        let segments: Vec<&str> = path.split('/').collect();

        for segment in &segments[..segments.len().saturating_sub(1)] {
            if prefix.is_empty() {
                prefix = (*segment).to_string();
            } else {
                prefix = format!("{}/{}", prefix, segment);
            }

            if self.known_collections.contains(&prefix) {
                continue;
            }

            match self.engine.client.mkcol(&prefix).await {
                Ok(()) | Err(WebDavError::MethodNotAllowed { .. }) => {
                    self.known_collections.insert(prefix.clone());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn local_path(&self, path: &str) -> Result<PathBuf, SyncError> {
        if path.split('/').any(|seg| seg == "..") {
            return Err(SyncError::PathOutsideRoot(path.to_string()));
        }
        Ok(self
            .engine
            .local_root
            .join(path.split('/').collect::<PathBuf>()))
    }

    /// A failed or skipped entry keeps its previous state rows, so the
    /// next run sees the same divergence again.
    fn restore_prior(&mut self, path: &str) {
        match self.prior_local.get(path) {
            Some(v) => self.new_local.insert(path.to_string(), *v),
            None => self.new_local.remove(path),
        };
        match self.prior_remote.get(path) {
            Some(v) => self.new_remote.insert(path.to_string(), v.clone()),
            None => self.new_remote.remove(path),
        };
    }
}

/// Maps a resolved conflict onto the concrete change to apply.
fn resolve_conflict(conflict: Conflict, use_local: bool) -> Change {
    let path = conflict.path;
    match (conflict.kind, use_local) {
        (ConflictKind::Update, true) => Change::Upload { path },
        (ConflictKind::Update, false) => Change::Download { path },
        (ConflictKind::DeleteLocal, true) => Change::DeleteRemote { path },
        (ConflictKind::DeleteLocal, false) => Change::Download { path },
        (ConflictKind::DeleteRemote, true) => Change::Upload { path },
        (ConflictKind::DeleteRemote, false) => Change::TrashLocal { path },
    }
}
