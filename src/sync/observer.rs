//! Callbacks through which a run reports progress and asks for conflict
//! resolution. The CLI installs a policy-driven observer; detected
//! divergences never block the rest of the pass.

use std::path::Path;
use tracing::{error, info, warn};

/// Kind of divergence detected between the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Changed on both sides since the last sync
    Update,
    /// Deleted locally while the remote copy changed
    DeleteLocal,
    /// Deleted remotely while the local copy changed
    DeleteRemote,
}

/// A detected divergence awaiting resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub path: String,
    pub kind: ConflictKind,
}

/// How to settle a conflict: adopt the local side's history, the remote
/// side's, or leave both untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    UseLocal,
    UseRemote,
    Skip,
}

/// Fixed resolution policy for unattended runs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    PreferLocal,
    PreferRemote,
    /// Report and leave both sides untouched (the safe default)
    #[default]
    Skip,
}

impl ConflictPolicy {
    pub fn resolve(self, _conflict: &Conflict) -> Resolution {
        match self {
            ConflictPolicy::PreferLocal => Resolution::UseLocal,
            ConflictPolicy::PreferRemote => Resolution::UseRemote,
            ConflictPolicy::Skip => Resolution::Skip,
        }
    }
}

/// Progress events emitted while a pass runs.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Uploaded { path: String },
    Downloaded { path: String },
    DeletedRemote { path: String },
    TrashedLocal { path: String, trash_path: String },
    RenamedLocal { from: String, to: String },
    ConflictSkipped { conflict: Conflict },
}

/// Receiver for the engine's callbacks. Per-file errors are reported
/// here and the pass continues with the remaining entries.
pub trait SyncObserver: Send + Sync {
    fn started(&self, local_root: &Path, remote_url: &str);

    fn event(&self, event: &SyncEvent);

    fn error(&self, path: &str, message: &str);

    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

/// Observer used by the CLI: logs through `tracing` and applies a fixed
/// conflict policy.
#[derive(Debug, Default)]
pub struct PolicyObserver {
    policy: ConflictPolicy,
}

impl PolicyObserver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }
}

impl SyncObserver for PolicyObserver {
    fn started(&self, local_root: &Path, remote_url: &str) {
        info!("Synchronizing {} <-> {}", local_root.display(), remote_url);
    }

    fn event(&self, event: &SyncEvent) {
        match event {
            SyncEvent::Uploaded { path } => info!("Uploaded {}", path),
            SyncEvent::Downloaded { path } => info!("Downloaded {}", path),
            SyncEvent::DeletedRemote { path } => info!("Deleted remote {}", path),
            SyncEvent::TrashedLocal { path, trash_path } => {
                info!("Moved {} to trash ({})", path, trash_path)
            }
            SyncEvent::RenamedLocal { from, to } => info!("Renamed {} -> {}", from, to),
            SyncEvent::ConflictSkipped { conflict } => {
                warn!("Conflict left unresolved on {}: {:?}", conflict.path, conflict.kind)
            }
        }
    }

    fn error(&self, path: &str, message: &str) {
        error!("Failed on {}: {}", path, message);
    }

    fn resolve(&self, conflict: &Conflict) -> Resolution {
        let resolution = self.policy.resolve(conflict);
        warn!(
            "Conflict on {} ({:?}): resolving as {:?}",
            conflict.path, conflict.kind, resolution
        );
        resolution
    }
}
