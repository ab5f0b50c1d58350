use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use davmirror::config::Settings;
use davmirror::sync::{
    ConflictPolicy, Direction, PolicyObserver, StateDb, SyncEngine, SyncSummary,
};
use davmirror::webdav::{RetryConfig, WebDavClient, WebDavConnection};

/// Mirror a local directory tree against a remote WebDAV collection.
#[derive(Parser, Debug)]
#[command(name = "davmirror", version, about)]
struct Args {
    /// Local directory to synchronize
    local_root: Option<PathBuf>,

    /// Remote WebDAV collection URL
    remote_url: Option<String>,

    /// JSON profile file providing the settings below
    #[arg(long)]
    profile: Option<PathBuf>,

    #[arg(short, long)]
    username: Option<String>,

    /// Password (prefer the DAVMIRROR_PASSWORD environment variable)
    #[arg(short, long)]
    password: Option<String>,

    /// Server type hint: nextcloud, owncloud or generic
    #[arg(long)]
    server_type: Option<String>,

    /// Direction changes propagate in
    #[arg(short, long, value_enum)]
    direction: Option<Direction>,

    /// Policy for conflicting changes
    #[arg(short, long, value_enum)]
    conflicts: Option<ConflictPolicy>,

    /// Disable ETag-based rename detection
    #[arg(long)]
    no_renames: bool,

    /// Glob of relative paths to leave out (repeatable)
    #[arg(short = 'x', long = "exclude")]
    excludes: Vec<String>,

    /// Classify and report without changing anything
    #[arg(long)]
    dry_run: bool,

    /// HTTP timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// State database location (default: <local_root>/.davmirror/state.db)
    #[arg(long)]
    state_db: Option<PathBuf>,
}

impl Args {
    /// Profile first, flags on top.
    fn into_settings(self) -> Result<Settings> {
        let mut settings = match &self.profile {
            Some(path) => Settings::from_profile(path)?,
            None => Settings {
                local_root: self
                    .local_root
                    .clone()
                    .context("missing local directory (argument or --profile)")?,
                remote_url: self
                    .remote_url
                    .clone()
                    .context("missing remote URL (argument or --profile)")?,
                username: self
                    .username
                    .clone()
                    .context("missing --username (or --profile)")?,
                password: None,
                server_type: None,
                direction: Direction::default(),
                conflicts: ConflictPolicy::default(),
                detect_renames: true,
                exclude: Vec::new(),
                dry_run: false,
                timeout_seconds: 30,
                state_db: None,
            },
        };

        if let Some(local_root) = self.local_root {
            settings.local_root = local_root;
        }
        if let Some(remote_url) = self.remote_url {
            settings.remote_url = remote_url;
        }
        if let Some(username) = self.username {
            settings.username = username;
        }
        if let Some(password) = self.password {
            settings.password = Some(password);
        }
        if let Some(server_type) = self.server_type {
            settings.server_type = Some(server_type);
        }
        if let Some(direction) = self.direction {
            settings.direction = direction;
        }
        if let Some(conflicts) = self.conflicts {
            settings.conflicts = conflicts;
        }
        if self.no_renames {
            settings.detect_renames = false;
        }
        settings.exclude.extend(self.excludes);
        if self.dry_run {
            settings.dry_run = true;
        }
        if let Some(timeout) = self.timeout {
            settings.timeout_seconds = timeout;
        }
        if let Some(state_db) = self.state_db {
            settings.state_db = Some(state_db);
        }

        settings.resolve_password()?;
        Ok(settings)
    }
}

async fn run(settings: Settings) -> Result<SyncSummary> {
    let connection = WebDavConnection::new(settings.webdav_config(), RetryConfig::default())?;
    let client = WebDavClient::new(connection);

    let state_path = settings.state_db_path();
    if let Some(parent) = state_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let state = StateDb::open(&state_path).await?;

    let observer = Arc::new(PolicyObserver::new(settings.conflicts));
    let engine = SyncEngine::new(
        client,
        settings.local_root.clone(),
        state,
        settings.sync_options(),
        observer,
    );

    Ok(engine.run().await?)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("davmirror=info")),
        )
        .init();

    let args = Args::parse();
    let settings = match args.into_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(2);
        }
    };

    match run(settings).await {
        Ok(summary) => {
            info!(
                "Done: {} up, {} down, {} renamed, {} deleted remotely, {} trashed, \
                 {} conflicts resolved, {} conflicts skipped, {} errors",
                summary.uploaded,
                summary.downloaded,
                summary.renamed,
                summary.deleted_remote,
                summary.trashed_local,
                summary.conflicts_resolved,
                summary.conflicts_skipped,
                summary.errors,
            );
            if summary.has_failures() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("Synchronization failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
