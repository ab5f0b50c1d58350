//! End-to-end sync passes against a stubbed WebDAV server and a temp
//! directory standing in for the local tree.

use std::collections::HashMap;
use std::sync::Arc;

use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use davmirror::sync::snapshot::file_mtime;
use davmirror::sync::{
    ConflictPolicy, Direction, PolicyObserver, RemoteFileState, StateDb, SyncEngine, SyncOptions,
};
use davmirror::webdav::{RetryConfig, WebDavClient, WebDavConfig, WebDavConnection};

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 1,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
        rate_limit_backoff_ms: 1,
    }
}

fn client_for(server: &MockServer) -> WebDavClient {
    let config = WebDavConfig::new(
        format!("{}/dav", server.uri()),
        "alice".to_string(),
        "secret".to_string(),
    );
    let connection = WebDavConnection::new(config, fast_retry()).expect("connection");
    WebDavClient::new(connection)
}

fn engine_for(
    server: &MockServer,
    root: &TempDir,
    state: StateDb,
    options: SyncOptions,
) -> SyncEngine {
    engine_with_policy(server, root, state, options, ConflictPolicy::Skip)
}

fn engine_with_policy(
    server: &MockServer,
    root: &TempDir,
    state: StateDb,
    options: SyncOptions,
    policy: ConflictPolicy,
) -> SyncEngine {
    SyncEngine::new(
        client_for(server),
        root.path().to_path_buf(),
        state,
        options,
        Arc::new(PolicyObserver::new(policy)),
    )
}

/// A Depth-1 multistatus for the collection at `/dav/` containing the
/// given `(name, etag, last_modified)` files.
fn listing(files: &[(&str, &str, &str)]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0"?>
        <d:multistatus xmlns:d="DAV:">
            <d:response>
                <d:href>/dav/</d:href>
                <d:propstat>
                    <d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop>
                    <d:status>HTTP/1.1 200 OK</d:status>
                </d:propstat>
            </d:response>"#,
    );
    for (name, etag, modified) in files {
        xml.push_str(&format!(
            r#"
            <d:response>
                <d:href>/dav/{name}</d:href>
                <d:propstat>
                    <d:prop>
                        <d:getetag>{etag}</d:getetag>
                        <d:getlastmodified>{modified}</d:getlastmodified>
                        <d:resourcetype/>
                    </d:prop>
                    <d:status>HTTP/1.1 200 OK</d:status>
                </d:propstat>
            </d:response>"#
        ));
    }
    xml.push_str("</d:multistatus>");
    xml
}

async fn mount_listing(server: &MockServer, files: &[(&str, &str, &str)]) {
    Mock::given(method("PROPFIND"))
        .and(path("/dav"))
        .respond_with(ResponseTemplate::new(207).set_body_raw(listing(files), "application/xml"))
        .mount(server)
        .await;
}

const LASTMOD: &str = "Mon, 01 Jan 2024 12:00:00 GMT";

#[tokio::test]
async fn downloads_new_remote_file() {
    let server = MockServer::start().await;
    mount_listing(&server, &[("note.txt", "\"n1\"", LASTMOD)]).await;
    Mock::given(method("GET"))
        .and(path("/dav/note.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    let state = StateDb::open_in_memory().await.unwrap();
    let engine = engine_for(&server, &root, state.clone(), SyncOptions::default());

    let summary = engine.run().await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert!(!summary.has_failures());
    assert_eq!(
        std::fs::read_to_string(root.path().join("note.txt")).unwrap(),
        "hello"
    );

    let remote = state.load_remote().await.unwrap();
    assert_eq!(remote["note.txt"].etag.as_deref(), Some("\"n1\""));
    assert!(state.load_local().await.unwrap().contains_key("note.txt"));
}

#[tokio::test]
async fn uploads_new_local_file() {
    let server = MockServer::start().await;
    mount_listing(&server, &[]).await;
    Mock::given(method("PUT"))
        .and(path("/dav/draft.txt"))
        .respond_with(ResponseTemplate::new(201).insert_header("ETag", "\"d1\""))
        .expect(1)
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("draft.txt"), "content").unwrap();
    let state = StateDb::open_in_memory().await.unwrap();
    let engine = engine_for(&server, &root, state.clone(), SyncOptions::default());

    let summary = engine.run().await.unwrap();

    assert_eq!(summary.uploaded, 1);
    let remote = state.load_remote().await.unwrap();
    assert_eq!(remote["draft.txt"].etag.as_deref(), Some("\"d1\""));
}

#[tokio::test]
async fn upload_creates_missing_remote_collections() {
    let server = MockServer::start().await;
    mount_listing(&server, &[]).await;
    Mock::given(method("MKCOL"))
        .and(path("/dav/docs"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/dav/docs/a.txt"))
        .respond_with(ResponseTemplate::new(201).insert_header("ETag", "\"a1\""))
        .expect(1)
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    std::fs::create_dir(root.path().join("docs")).unwrap();
    std::fs::write(root.path().join("docs/a.txt"), "x").unwrap();
    let state = StateDb::open_in_memory().await.unwrap();
    let engine = engine_for(&server, &root, state, SyncOptions::default());

    let summary = engine.run().await.unwrap();
    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.errors, 0);
}

#[tokio::test]
async fn refused_put_is_deleted_and_retried_once() {
    let server = MockServer::start().await;
    mount_listing(&server, &[]).await;
    Mock::given(method("PUT"))
        .and(path("/dav/stale.txt"))
        .respond_with(ResponseTemplate::new(405))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/dav/stale.txt"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/dav/stale.txt"))
        .respond_with(ResponseTemplate::new(201).insert_header("ETag", "\"s2\""))
        .expect(1)
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("stale.txt"), "v2").unwrap();
    let state = StateDb::open_in_memory().await.unwrap();
    let engine = engine_for(&server, &root, state.clone(), SyncOptions::default());

    let summary = engine.run().await.unwrap();
    assert_eq!(summary.uploaded, 1);
    assert_eq!(summary.errors, 0);

    let remote = state.load_remote().await.unwrap();
    assert_eq!(remote["stale.txt"].etag.as_deref(), Some("\"s2\""));
}

#[tokio::test]
async fn local_delete_propagates_to_remote() {
    let server = MockServer::start().await;
    mount_listing(&server, &[("old.txt", "\"o1\"", LASTMOD)]).await;
    Mock::given(method("DELETE"))
        .and(path("/dav/old.txt"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    let state = StateDb::open_in_memory().await.unwrap();
    let prior_local = HashMap::from([("old.txt".to_string(), 100_i64)]);
    let prior_remote = HashMap::from([(
        "old.txt".to_string(),
        RemoteFileState {
            modified: None,
            etag: Some("\"o1\"".to_string()),
        },
    )]);
    state.replace(&prior_local, &prior_remote).await.unwrap();

    let engine = engine_for(&server, &root, state.clone(), SyncOptions::default());
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.deleted_remote, 1);
    assert!(state.load_local().await.unwrap().is_empty());
    assert!(state.load_remote().await.unwrap().is_empty());
}

#[tokio::test]
async fn remote_delete_moves_local_file_to_trash() {
    let server = MockServer::start().await;
    mount_listing(&server, &[]).await;

    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("kept.txt"), "precious").unwrap();
    let mtime = file_mtime(&std::fs::metadata(root.path().join("kept.txt")).unwrap());

    let state = StateDb::open_in_memory().await.unwrap();
    let prior_local = HashMap::from([("kept.txt".to_string(), mtime)]);
    let prior_remote = HashMap::from([(
        "kept.txt".to_string(),
        RemoteFileState {
            modified: None,
            etag: Some("\"k1\"".to_string()),
        },
    )]);
    state.replace(&prior_local, &prior_remote).await.unwrap();

    let engine = engine_for(&server, &root, state.clone(), SyncOptions::default());
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.trashed_local, 1);
    assert!(!root.path().join("kept.txt").exists());

    // The file is preserved under the state directory's trash tree.
    let mut trashed = Vec::new();
    for entry in walkdir::WalkDir::new(root.path().join(".davmirror/trash")) {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            trashed.push(entry.path().to_path_buf());
        }
    }
    assert_eq!(trashed.len(), 1);
    assert_eq!(std::fs::read_to_string(&trashed[0]).unwrap(), "precious");
    assert!(state.load_local().await.unwrap().is_empty());
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let server = MockServer::start().await;
    mount_listing(&server, &[("note.txt", "\"n1\"", LASTMOD)]).await;
    // No GET mock: a real download attempt would fail the run.

    let root = TempDir::new().unwrap();
    let state = StateDb::open_in_memory().await.unwrap();
    let options = SyncOptions {
        dry_run: true,
        ..SyncOptions::default()
    };
    let engine = engine_for(&server, &root, state.clone(), options);

    let summary = engine.run().await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert!(!root.path().join("note.txt").exists());
    assert!(state.load_local().await.unwrap().is_empty());
    assert!(state.load_remote().await.unwrap().is_empty());
}

#[tokio::test]
async fn skipped_conflict_keeps_prior_state_rows() {
    let server = MockServer::start().await;
    mount_listing(&server, &[("shared.txt", "\"new\"", LASTMOD)]).await;

    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("shared.txt"), "local edit").unwrap();

    let state = StateDb::open_in_memory().await.unwrap();
    let prior_local = HashMap::from([("shared.txt".to_string(), 100_i64)]);
    let prior_remote = HashMap::from([(
        "shared.txt".to_string(),
        RemoteFileState {
            modified: None,
            etag: Some("\"old\"".to_string()),
        },
    )]);
    state.replace(&prior_local, &prior_remote).await.unwrap();

    let engine = engine_for(&server, &root, state.clone(), SyncOptions::default());
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.conflicts_skipped, 1);
    assert!(summary.has_failures());
    // Local and remote copies are both untouched.
    assert_eq!(
        std::fs::read_to_string(root.path().join("shared.txt")).unwrap(),
        "local edit"
    );

    let local = state.load_local().await.unwrap();
    let remote = state.load_remote().await.unwrap();
    assert_eq!(local["shared.txt"], 100);
    assert_eq!(remote["shared.txt"].etag.as_deref(), Some("\"old\""));
}

#[tokio::test]
async fn failed_conflict_resolution_counts_as_error_not_resolved() {
    let server = MockServer::start().await;
    mount_listing(&server, &[("shared.txt", "\"new\"", LASTMOD)]).await;
    Mock::given(method("GET"))
        .and(path("/dav/shared.txt"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("shared.txt"), "local edit").unwrap();

    let state = StateDb::open_in_memory().await.unwrap();
    let prior_local = HashMap::from([("shared.txt".to_string(), 100_i64)]);
    let prior_remote = HashMap::from([(
        "shared.txt".to_string(),
        RemoteFileState {
            modified: None,
            etag: Some("\"old\"".to_string()),
        },
    )]);
    state.replace(&prior_local, &prior_remote).await.unwrap();

    // Prefer-remote resolves the conflict as a download, which the
    // server then refuses.
    let engine = engine_with_policy(
        &server,
        &root,
        state.clone(),
        SyncOptions::default(),
        ConflictPolicy::PreferRemote,
    );
    let summary = engine.run().await.unwrap();

    assert_eq!(summary.conflicts_resolved, 0);
    assert_eq!(summary.errors, 1);

    // The divergence is still on record for the next pass.
    let remote = state.load_remote().await.unwrap();
    assert_eq!(remote["shared.txt"].etag.as_deref(), Some("\"old\""));
}

#[tokio::test]
async fn upward_sync_ignores_remote_additions() {
    let server = MockServer::start().await;
    mount_listing(&server, &[("theirs.txt", "\"t1\"", LASTMOD)]).await;
    // No GET mock: Up must never download.

    let root = TempDir::new().unwrap();
    let state = StateDb::open_in_memory().await.unwrap();
    let options = SyncOptions {
        direction: Direction::Up,
        ..SyncOptions::default()
    };
    let engine = engine_for(&server, &root, state.clone(), options);

    let summary = engine.run().await.unwrap();

    assert_eq!(summary.downloaded, 0);
    assert!(!root.path().join("theirs.txt").exists());
    // The remote file is still adopted into the known state.
    let remote = state.load_remote().await.unwrap();
    assert_eq!(remote["theirs.txt"].etag.as_deref(), Some("\"t1\""));
}

#[tokio::test]
async fn excluded_paths_are_invisible_to_the_pass() {
    let server = MockServer::start().await;
    mount_listing(&server, &[("skipme.tmp", "\"x\"", LASTMOD)]).await;

    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("local.tmp"), "scratch").unwrap();

    let state = StateDb::open_in_memory().await.unwrap();
    let options = SyncOptions {
        excludes: vec!["*.tmp".to_string()],
        ..SyncOptions::default()
    };
    let engine = engine_for(&server, &root, state.clone(), options);

    let summary = engine.run().await.unwrap();

    assert_eq!(summary.downloaded, 0);
    assert_eq!(summary.uploaded, 0);
    assert!(state.load_local().await.unwrap().is_empty());
    assert!(state.load_remote().await.unwrap().is_empty());
}

#[tokio::test]
async fn per_file_error_does_not_abort_the_pass() {
    let server = MockServer::start().await;
    mount_listing(
        &server,
        &[
            ("bad.txt", "\"b1\"", LASTMOD),
            ("good.txt", "\"g1\"", LASTMOD),
        ],
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/dav/bad.txt"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/dav/good.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fine".to_vec()))
        .mount(&server)
        .await;

    let root = TempDir::new().unwrap();
    let state = StateDb::open_in_memory().await.unwrap();
    let engine = engine_for(&server, &root, state.clone(), SyncOptions::default());

    let summary = engine.run().await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert_eq!(summary.errors, 1);
    assert!(summary.has_failures());
    assert!(root.path().join("good.txt").exists());
    assert!(!root.path().join("bad.txt").exists());

    // The failed path keeps no invented state row.
    let local = state.load_local().await.unwrap();
    assert!(local.contains_key("good.txt"));
    assert!(!local.contains_key("bad.txt"));
}

#[tokio::test]
async fn records_last_sync_timestamp() {
    let server = MockServer::start().await;
    mount_listing(&server, &[]).await;

    let root = TempDir::new().unwrap();
    let state = StateDb::open_in_memory().await.unwrap();
    let engine = engine_for(&server, &root, state.clone(), SyncOptions::default());
    engine.run().await.unwrap();

    let remote_url = format!("{}/dav", server.uri());
    let last = state
        .last_sync(&root.path().to_string_lossy(), &remote_url)
        .await
        .unwrap();
    assert!(last.is_some());
}
