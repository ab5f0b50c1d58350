use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

use crate::sync::{ConflictPolicy, Direction, SyncOptions, STATE_DIR_NAME};
use crate::webdav::WebDavConfig;

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

/// Runtime settings for one synchronized pair. Loadable from a JSON
/// profile file; the CLI overlays its flags on top.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub local_root: PathBuf,
    pub remote_url: String,
    pub username: String,
    /// Falls back to the DAVMIRROR_PASSWORD environment variable
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub server_type: Option<String>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub conflicts: ConflictPolicy,
    #[serde(default = "default_true")]
    pub detect_renames: bool,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub state_db: Option<PathBuf>,
}

impl Settings {
    pub fn from_profile(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read profile {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("invalid profile {}", path.display()))?;
        Ok(settings)
    }

    /// Resolves the password from the environment when the profile and
    /// CLI left it unset.
    pub fn resolve_password(&mut self) -> Result<()> {
        if self.password.is_none() {
            self.password = env::var("DAVMIRROR_PASSWORD").ok();
        }
        self.password
            .as_ref()
            .context("no password given (flag, profile, or DAVMIRROR_PASSWORD)")?;
        Ok(())
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.state_db
            .clone()
            .unwrap_or_else(|| self.local_root.join(STATE_DIR_NAME).join("state.db"))
    }

    pub fn webdav_config(&self) -> WebDavConfig {
        WebDavConfig {
            server_url: self.remote_url.clone(),
            username: self.username.clone(),
            password: self.password.clone().unwrap_or_default(),
            timeout_seconds: self.timeout_seconds,
            server_type: self.server_type.clone(),
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            direction: self.direction,
            dry_run: self.dry_run,
            detect_renames: self.detect_renames,
            excludes: self.exclude.clone(),
        }
    }
}
