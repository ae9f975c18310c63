//! Integration tests for the publish workflow and maintenance jobs.

mod common;

use common::fixtures::{make_zip, sha256_hex_upper};
use common::{TestServer, UPDATE_TOKEN};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use depot_server::jobs::maintenance;
use httpmock::MockServer;
use serde_json::{Value, json};
use std::io::Read;

fn client_zip() -> Vec<u8> {
    make_zip(&[("a.txt", b"hello"), ("b.txt", b"world")])
}

fn server_zip() -> Vec<u8> {
    make_zip(&[("bin/server", b"ELF server binary")])
}

async fn upload_file(
    server: &TestServer,
    fork: &str,
    version: &str,
    name: &str,
    data: &[u8],
) -> StatusCode {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/fork/{fork}/file"))
        .header("Authorization", format!("Bearer {UPDATE_TOKEN}"))
        .header("Robust-Cdn-Publish-File", name)
        .header("Robust-Cdn-Publish-Version", version)
        .body(Body::from(data.to_vec()))
        .unwrap();
    let (status, _, _) = server.send(request).await;
    status
}

#[tokio::test]
async fn multi_publish_makes_version_available() {
    let server = TestServer::new().await;
    server
        .publish_build(
            "wizards",
            "1.0.0",
            &[
                ("Client.zip", &client_zip()),
                ("Server_linux-x64.zip", &server_zip()),
            ],
        )
        .await;

    let (status, _, body) = server.get("/fork/wizards/manifest", &[]).await;
    assert_eq!(status, StatusCode::OK);
    let manifest: Value = serde_json::from_slice(&body).unwrap();

    let build = &manifest["builds"]["1.0.0"];
    assert!(build["time"].is_string());
    assert_eq!(
        build["client"]["url"].as_str().unwrap(),
        "http://localhost/fork/wizards/version/1.0.0/file/Client.zip"
    );
    assert_eq!(
        build["client"]["sha256"].as_str().unwrap(),
        sha256_hex_upper(&client_zip())
    );

    let server_entry = &build["server"]["linux-x64"];
    assert_eq!(
        server_entry["url"].as_str().unwrap(),
        "http://localhost/fork/wizards/version/1.0.0/file/Server_linux-x64.zip"
    );
    // The server zip was rewritten with build.json, so only shape checks.
    assert!(server_entry["sha256"].is_string());
    assert!(server_entry["size"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn fork_manifest_is_404_until_first_rebuild() {
    let server = TestServer::new().await;
    let (status, _, _) = server.get("/fork/wizards/manifest", &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn published_files_are_served_from_disk() {
    let server = TestServer::new().await;
    server.publish_build("wizards", "1.0.0", &[("Client.zip", &client_zip())]).await;

    let (status, headers, body) = server
        .get("/fork/wizards/version/1.0.0/file/Client.zip", &[])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-type").unwrap(), "application/zip");
    assert_eq!(body.as_ref(), &client_zip()[..]);

    let (status, _, _) = server
        .get("/fork/wizards/version/1.0.0/file/Missing.zip", &[])
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Path traversal in the file segment is rejected outright.
    let (status, _, _) = server
        .get("/fork/wizards/version/1.0.0/file/..%2Fsecret", &[])
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn double_publish_conflicts_without_mutation() {
    let server = TestServer::new().await;
    server.publish_build("wizards", "1.0.0", &[("Client.zip", &client_zip())]).await;

    let (status, _, _) = server
        .json(
            "POST",
            "/fork/wizards/start",
            json!({ "version": "1.0.0", "engineVersion": "220.1.0" }),
            Some(UPDATE_TOKEN),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // The published artifact is untouched.
    let (status, _, body) = server
        .get("/fork/wizards/version/1.0.0/file/Client.zip", &[])
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), &client_zip()[..]);
}

#[tokio::test]
async fn publish_endpoints_require_the_update_token() {
    let server = TestServer::new().await;
    let (status, _, _) = server
        .json(
            "POST",
            "/fork/wizards/start",
            json!({ "version": "1.0.0", "engineVersion": "220.1.0" }),
            Some("wrong-token"),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = server
        .json(
            "POST",
            "/fork/wizards/start",
            json!({ "version": "1.0.0", "engineVersion": "220.1.0" }),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Unknown forks 404 before any auth check.
    let (status, _, _) = server
        .json(
            "POST",
            "/fork/ghosts/start",
            json!({ "version": "1.0.0", "engineVersion": "220.1.0" }),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicate_file_upload_conflicts() {
    let server = TestServer::new().await;
    let (status, _, _) = server
        .json(
            "POST",
            "/fork/wizards/start",
            json!({ "version": "2.3.0", "engineVersion": "220.1.0" }),
            Some(UPDATE_TOKEN),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let zip = client_zip();
    assert_eq!(
        upload_file(&server, "wizards", "2.3.0", "Client.zip", &zip).await,
        StatusCode::NO_CONTENT
    );
    assert_eq!(
        upload_file(&server, "wizards", "2.3.0", "Client.zip", &zip).await,
        StatusCode::CONFLICT
    );

    // Invalid file names never touch the filesystem.
    assert_eq!(
        upload_file(&server, "wizards", "2.3.0", "../evil", &zip).await,
        StatusCode::BAD_REQUEST
    );

    // Uploads against a version that was never started are rejected.
    assert_eq!(
        upload_file(&server, "wizards", "9.9.9", "Client.zip", &zip).await,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn restarting_a_publish_aborts_the_previous_one() {
    let server = TestServer::new().await;
    let start = json!({ "version": "2.3.0", "engineVersion": "220.1.0" });

    let (status, _, _) = server
        .json("POST", "/fork/wizards/start", start.clone(), Some(UPDATE_TOKEN))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    upload_file(&server, "wizards", "2.3.0", "Client.zip", &client_zip()).await;
    upload_file(&server, "wizards", "2.3.0", "Server_linux-x64.zip", &server_zip()).await;

    // Second start for the same version: files gone, row replaced.
    let (status, _, _) = server
        .json("POST", "/fork/wizards/start", start, Some(UPDATE_TOKEN))
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let version_dir = server
        .state
        .publish_layout
        .version_dir("wizards", "2.3.0")
        .unwrap();
    let entries: Vec<_> = std::fs::read_dir(&version_dir).unwrap().collect();
    assert!(entries.is_empty(), "aborted publish files must be deleted");

    // Finishing with no client artifact aborts the publish with 422.
    let (status, _, _) = server
        .json(
            "POST",
            "/fork/wizards/finish",
            json!({ "version": "2.3.0" }),
            Some(UPDATE_TOKEN),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let fork_id = server.state.publish.fork("wizards").await.unwrap().unwrap().id;
    assert!(
        server.state.publish.in_progress(fork_id, "2.3.0").await.unwrap().is_none(),
        "aborted publish row must be removed"
    );
    assert!(!version_dir.exists(), "aborted publish directory must be removed");
}

#[tokio::test]
async fn finish_injects_build_json_into_server_zips() {
    let server = TestServer::new().await;
    server
        .publish_build(
            "wizards",
            "1.0.0",
            &[
                ("Client.zip", &client_zip()),
                ("Server_linux-x64.zip", &server_zip()),
            ],
        )
        .await;

    let path = server
        .state
        .publish_layout
        .artifact_path("wizards", "1.0.0", "Server_linux-x64.zip")
        .unwrap();
    let mut archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();

    let mut build_json = String::new();
    archive
        .by_name("build.json")
        .unwrap()
        .read_to_string(&mut build_json)
        .unwrap();
    let build: Value = serde_json::from_str(&build_json).unwrap();

    assert_eq!(build["version"], "1.0.0");
    assert_eq!(build["fork_id"], "wizards");
    assert_eq!(build["engine_version"], "220.1.0");
    assert_eq!(build["hash"], Value::String(sha256_hex_upper(&client_zip())));
    assert_eq!(
        build["download"].as_str().unwrap(),
        "http://localhost/fork/{FORK_ID}/version/{FORK_VERSION}/file/Client.zip"
    );
    assert_eq!(
        build["manifest_url"].as_str().unwrap(),
        "http://localhost/fork/{FORK_ID}/version/{FORK_VERSION}/manifest"
    );

    // The manifest hash in build.json matches what the download endpoint
    // later serves for the ingested version.
    let (_, headers, _) = server.get("/fork/wizards/version/1.0.0/manifest", &[]).await;
    assert_eq!(
        build["manifest_hash"].as_str().unwrap(),
        headers.get("x-manifest-hash").unwrap().to_str().unwrap()
    );

    // The original payload survived the rewrite.
    let mut payload = String::new();
    archive.by_name("bin/server").unwrap().read_to_string(&mut payload).unwrap();
    assert_eq!(payload, "ELF server binary");
}

#[tokio::test]
async fn one_shot_publish_pulls_archive() {
    let mock = MockServer::start_async().await;
    let outer = make_zip(&[
        ("Client.zip", client_zip().as_slice()),
        ("Server_linux-x64.zip", server_zip().as_slice()),
        ("README.txt", b"not an artifact"),
    ]);
    let archive_mock = mock
        .mock_async(|when, then| {
            when.method("GET").path("/build.zip");
            then.status(200).body(outer.clone());
        })
        .await;

    let server = TestServer::new().await;
    let (status, _, _) = server
        .json(
            "POST",
            "/fork/wizards/publish",
            json!({
                "archive": mock.url("/build.zip"),
                "version": "3.0.0",
                "engineVersion": "220.1.0",
            }),
            Some(UPDATE_TOKEN),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    archive_mock.assert_async().await;

    server.run_update("wizards").await;

    let (status, _, body) = server.get("/fork/wizards/manifest", &[]).await;
    assert_eq!(status, StatusCode::OK);
    let manifest: Value = serde_json::from_slice(&body).unwrap();
    assert!(manifest["builds"]["3.0.0"]["server"]["linux-x64"].is_object());

    let (status, _, _) = server.get("/fork/wizards/version/3.0.0/manifest", &[]).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn one_shot_publish_without_client_is_rejected() {
    let mock = MockServer::start_async().await;
    let outer = make_zip(&[("Server_linux-x64.zip", server_zip().as_slice())]);
    mock.mock_async(|when, then| {
        when.method("GET").path("/build.zip");
        then.status(200).body(outer.clone());
    })
    .await;

    let server = TestServer::new().await;
    let (status, _, _) = server
        .json(
            "POST",
            "/fork/wizards/publish",
            json!({
                "archive": mock.url("/build.zip"),
                "version": "3.0.0",
                "engineVersion": "220.1.0",
            }),
            Some(UPDATE_TOKEN),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The failed publish left nothing behind.
    let version_dir = server
        .state
        .publish_layout
        .version_dir("wizards", "3.0.0")
        .unwrap();
    assert!(!version_dir.exists());
}

#[tokio::test]
async fn watchdogs_are_notified_after_availability() {
    let mock = MockServer::start_async().await;
    let notify_mock = mock
        .mock_async(|when, then| {
            when.method("POST").path("/instances/main/update");
            then.status(204);
        })
        .await;

    let mock_url = mock.base_url();
    let server = TestServer::with_config(move |config| {
        let fork = config.forks.get_mut("wizards").unwrap();
        fork.notify_watchdogs.push(depot_core::config::WatchdogConfig {
            url: mock_url,
            instance: "main".to_string(),
            api_token: "watchdog-token".to_string(),
        });
    })
    .await;

    server.publish_build("wizards", "1.0.0", &[("Client.zip", &client_zip())]).await;

    // Exactly one of the background worker and the direct update run flips
    // availability and notifies; the other sees nothing to do. Poll, since
    // the winner may still have its POST in flight.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        if notify_mock.hits_async().await >= 1 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("watchdog was never notified");
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn stale_publishes_are_aborted_by_the_maintenance_job() {
    let server = TestServer::with_config(|config| {
        // Timeout zero: everything in progress is immediately stale.
        config.publish.in_progress_publish_timeout_minutes = 0;
    })
    .await;

    let (status, _, _) = server
        .json(
            "POST",
            "/fork/wizards/start",
            json!({ "version": "2.3.0", "engineVersion": "220.1.0" }),
            Some(UPDATE_TOKEN),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    upload_file(&server, "wizards", "2.3.0", "Client.zip", &client_zip()).await;

    maintenance::abort_stale_publishes(&server.job_context()).await.unwrap();

    let fork_id = server.state.publish.fork("wizards").await.unwrap().unwrap().id;
    assert!(server.state.publish.in_progress(fork_id, "2.3.0").await.unwrap().is_none());
    let version_dir = server
        .state
        .publish_layout
        .version_dir("wizards", "2.3.0")
        .unwrap();
    assert!(!version_dir.exists());
}

#[tokio::test]
async fn prune_job_deletes_aged_builds() {
    let server = TestServer::with_config(|config| {
        config.forks.get_mut("wizards").unwrap().prune_builds_days = 1;
    })
    .await;
    server.publish_build("wizards", "1.0.0", &[("Client.zip", &client_zip())]).await;

    // A fresh build survives pruning.
    maintenance::prune_builds(&server.job_context()).await.unwrap();
    let fork_id = server.state.publish.fork("wizards").await.unwrap().unwrap().id;
    assert!(server.state.publish.version_exists(fork_id, "1.0.0").await.unwrap());

    // Backdate an old build directly in the store and give it a directory.
    let old_time = time::OffsetDateTime::now_utc() - time::Duration::days(3);
    let mut tx = server.state.publish.begin().await.unwrap();
    depot_db::PublishStore::insert_version(
        &mut tx,
        fork_id,
        "0.9.0",
        old_time,
        "219.0.0",
        "Client.zip",
        &[0u8; 32],
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    let old_dir = server.state.publish_layout.version_dir("wizards", "0.9.0").unwrap();
    std::fs::create_dir_all(&old_dir).unwrap();

    maintenance::prune_builds(&server.job_context()).await.unwrap();

    assert!(!server.state.publish.version_exists(fork_id, "0.9.0").await.unwrap());
    assert!(!old_dir.exists());
    assert!(server.state.publish.version_exists(fork_id, "1.0.0").await.unwrap());
}
