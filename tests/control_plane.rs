//! End-to-end tests driving the agent against an in-process fake control
//! plane and a stub engine executable.

#![cfg(unix)]

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use palisade_agent::agent::commands::{AgentCommand, BackupTrigger, CommandDispatcher};
use palisade_agent::agent::state::SharedState;
use palisade_agent::agent::Agent;
use palisade_agent::config::Config;
use palisade_agent::control::reporter::LogReporter;
use palisade_agent::control::{ApiClient, RemoteBackupConfig};
use palisade_agent::engine::{RepositoryConfig, ResticWrapper};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct ControlPlane {
    config_hits: usize,
    /// Config responses report `configured: false` for this many hits.
    unconfigured_hits: usize,
    /// Extra fields merged into the next heartbeat responses, one per tick.
    heartbeat_commands: VecDeque<Value>,
    logs: Vec<Value>,
    snapshot_posts: Vec<Value>,
    restore_posts: Vec<Value>,
    last_user_agent: Option<String>,
    last_authorization: Option<String>,
}

type Shared = Arc<Mutex<ControlPlane>>;

async fn heartbeat_handler(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(_body): Json<Value>,
) -> Json<Value> {
    let mut cp = state.lock().unwrap();
    cp.last_user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    cp.last_authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut response = json!({
        "success": true,
        "command": "idle",
        "agentID": "agent-123",
    });
    if let Some(extra) = cp.heartbeat_commands.pop_front() {
        let target = response.as_object_mut().unwrap();
        for (key, value) in extra.as_object().unwrap() {
            target.insert(key.clone(), value.clone());
        }
    }
    Json(response)
}

async fn config_handler(State(state): State<Shared>) -> Json<Value> {
    let mut cp = state.lock().unwrap();
    cp.config_hits += 1;
    if cp.config_hits > cp.unconfigured_hits {
        Json(json!({
            "success": true,
            "configured": true,
            "endpoint": "s3.test.example",
            "bucket": "bucket-1",
            "region": "test-1",
            "accessKey": "AKIA",
            "secretKey": "shh",
            "repoPassword": "pw",
        }))
    } else {
        Json(json!({
            "success": true,
            "configured": false,
            "message": "pending setup",
        }))
    }
}

async fn log_handler(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    state.lock().unwrap().logs.push(body);
    Json(json!({"success": true}))
}

async fn snapshots_handler(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    state.lock().unwrap().snapshot_posts.push(body);
    Json(json!({"success": true}))
}

async fn restore_status_handler(
    State(state): State<Shared>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.lock().unwrap().restore_posts.push(body);
    Json(json!({"success": true}))
}

async fn spawn_control_plane(cp: Shared) -> String {
    let app = Router::new()
        .route("/api/agent/heartbeat", post(heartbeat_handler))
        .route("/api/agent/config", get(config_handler))
        .route("/api/agent/log", post(log_handler))
        .route("/api/agent/snapshots", post(snapshots_handler))
        .route("/api/restore/status", post(restore_status_handler))
        .with_state(cp);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Write a stub engine that records its invocations and speaks just enough
/// of the engine's JSON dialect for the agent.
fn write_stub_engine(dir: &Path, backup_sleep_secs: u64) -> PathBuf {
    let log = dir.join("calls.log");
    let marker = dir.join("repo-initialized");
    let body = format!(
        r#"#!/bin/sh
echo "$@" >> {log}
case "$1" in
  version)
    echo "restic 0.17.0 compiled with go1.22"
    exit 0
    ;;
  snapshots)
    if [ -f {marker} ]; then
      echo '[{{"id":"0123abcdef","short_id":"0123","time":"2025-06-01T02:00:00Z","hostname":"test-host","paths":["/data"],"tags":[]}}]'
      exit 0
    fi
    echo "Fatal: unable to open config file" >&2
    echo "Is there a repository at the following location?" >&2
    exit 1
    ;;
  init)
    touch {marker}
    exit 0
    ;;
  backup)
    sleep {sleep}
    echo '{{"message_type":"status","percent_done":1.0}}'
    echo '{{"message_type":"summary","files_new":5,"files_changed":1,"files_unmodified":10,"data_added":8192,"total_bytes_processed":65536,"total_duration":0.42,"snapshot_id":"cafe0123"}}'
    exit 0
    ;;
  restore)
    exit 0
    ;;
esac
exit 1
"#,
        log = log.display(),
        marker = marker.display(),
        sleep = backup_sleep_secs,
    );

    let path = dir.join("restic-stub");
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn engine_calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn test_config(base_url: String, engine_path: PathBuf, backup_path: PathBuf) -> Config {
    let mut config = Config::default();
    config.api.url = base_url;
    config.api.key = "test-api-key".to_string();
    config.api.heartbeat_interval_secs = 1;
    config.api.config_poll_interval_secs = 1;
    config.api.request_timeout_secs = 5;
    config.engine.path = engine_path;
    config.engine.operation_timeout_secs = 30;
    config.backup.path = backup_path;
    config
}

async fn wait_for(what: &str, secs: u64, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn backup_logs(cp: &Shared) -> Vec<Value> {
    cp.lock()
        .unwrap()
        .logs
        .iter()
        .filter(|l| l["logType"] == "backup")
        .cloned()
        .collect()
}

fn activity_logs(cp: &Shared) -> Vec<Value> {
    cp.lock()
        .unwrap()
        .logs
        .iter()
        .filter(|l| l["logType"] == "activity")
        .cloned()
        .collect()
}

#[tokio::test]
async fn test_configure_after_pending_ticks_then_initial_backup() {
    let cp: Shared = Arc::new(Mutex::new(ControlPlane {
        unconfigured_hits: 3,
        ..Default::default()
    }));
    let base_url = spawn_control_plane(cp.clone()).await;

    let dir = tempfile::TempDir::new().unwrap();
    let engine = write_stub_engine(dir.path(), 0);
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    std::fs::write(data.join("file.txt"), "payload").unwrap();

    let shutdown = CancellationToken::new();
    let agent = Agent::new(test_config(base_url, engine, data)).unwrap();
    let handle = tokio::spawn(agent.run(shutdown.clone()));

    wait_for("initial backup log", 20, || !backup_logs(&cp).is_empty()).await;

    // The control plane stayed unconfigured for three polls first.
    assert!(cp.lock().unwrap().config_hits >= 4);

    let log = backup_logs(&cp)[0].clone();
    assert_eq!(log["status"], "success");
    assert_eq!(log["agentID"], "agent-123");
    assert_eq!(log["filesNew"], 5);
    assert_eq!(log["dataAdded"], 8192);
    assert_eq!(log["durationSeconds"], 0.42);

    // Repository was initialized exactly once.
    let calls = engine_calls(dir.path());
    let inits = calls.iter().filter(|c| c.starts_with("init")).count();
    assert_eq!(inits, 1, "calls: {calls:?}");

    // Identifying headers rode on the requests.
    {
        let cp = cp.lock().unwrap();
        assert!(cp
            .last_user_agent
            .as_deref()
            .unwrap()
            .starts_with("palisade-agent/"));
        assert_eq!(cp.last_authorization.as_deref(), Some("Bearer test-api-key"));
    }

    // Once ready, the reconciler stops fetching.
    let hits_when_ready = cp.lock().unwrap().config_hits;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(cp.lock().unwrap().config_hits, hits_when_ready);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_duplicate_backup_triggers_skip_instead_of_overlap() {
    let cp: Shared = Arc::new(Mutex::new(ControlPlane::default()));
    let base_url = spawn_control_plane(cp.clone()).await;

    let dir = tempfile::TempDir::new().unwrap();
    let engine_path = write_stub_engine(dir.path(), 2);
    std::fs::write(dir.path().join("repo-initialized"), "").unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();

    let config = test_config(base_url, engine_path.clone(), data.clone());
    let state = SharedState::new("test-host".to_string());
    let client = Arc::new(ApiClient::new(&config.api).unwrap());
    let reporter = LogReporter::new(client, state.clone());

    let remote = RemoteBackupConfig {
        endpoint: "s3.test.example".to_string(),
        bucket: "bucket-1".to_string(),
        region: "test-1".to_string(),
        access_key: "AKIA".to_string(),
        secret_key: "shh".to_string(),
        repo_password: "pw".to_string(),
    };
    let repo = RepositoryConfig {
        endpoint: remote.endpoint.clone(),
        bucket: remote.bucket.clone(),
        path: "test-host".to_string(),
        region: remote.region.clone(),
        access_key: remote.access_key.clone(),
        secret_key: remote.secret_key.clone(),
        password: remote.repo_password.clone(),
    };
    let wrapper = ResticWrapper::new(engine_path, repo, Duration::from_secs(30))
        .await
        .unwrap();
    state.install_engine(Arc::new(wrapper), remote).await;

    let shutdown = CancellationToken::new();
    let (tx, rx) = mpsc::channel(16);
    let dispatcher = CommandDispatcher::new(state, reporter, data, shutdown.clone());
    let dispatcher_handle = tokio::spawn(dispatcher.run(rx, shutdown.clone()));

    tx.send(AgentCommand::BackupNow {
        trigger: BackupTrigger::Remote,
    })
    .await
    .unwrap();
    // Give the first backup a moment to claim the engine slot.
    tokio::time::sleep(Duration::from_millis(300)).await;
    tx.send(AgentCommand::BackupNow {
        trigger: BackupTrigger::Remote,
    })
    .await
    .unwrap();

    wait_for("one success and one skip", 20, || {
        !backup_logs(&cp).is_empty()
            && activity_logs(&cp)
                .iter()
                .any(|l| l["message"].as_str().unwrap_or("").contains("skipped"))
    })
    .await;

    let backups = engine_calls(dir.path())
        .iter()
        .filter(|c| c.starts_with("backup"))
        .count();
    assert_eq!(backups, 1, "second trigger must not reach the engine");
    assert_eq!(backup_logs(&cp).len(), 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), dispatcher_handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_missing_engine_leaves_agent_unconfigured_and_polling() {
    let cp: Shared = Arc::new(Mutex::new(ControlPlane::default()));
    let base_url = spawn_control_plane(cp.clone()).await;

    let dir = tempfile::TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();

    let shutdown = CancellationToken::new();
    let config = test_config(base_url, PathBuf::from("/nonexistent/restic-xyz"), data);
    let agent = Agent::new(config).unwrap();
    let handle = tokio::spawn(agent.run(shutdown.clone()));

    // The reconciler keeps re-probing on every poll instead of going ready.
    wait_for("repeated config polls", 20, || {
        cp.lock().unwrap().config_hits >= 3
    })
    .await;
    assert!(backup_logs(&cp).is_empty());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_snapshot_sync_and_restore_commands() {
    let cp: Shared = Arc::new(Mutex::new(ControlPlane::default()));
    let base_url = spawn_control_plane(cp.clone()).await;

    let dir = tempfile::TempDir::new().unwrap();
    let engine = write_stub_engine(dir.path(), 0);
    // Pre-initialized repository: listing succeeds straight away.
    std::fs::write(dir.path().join("repo-initialized"), "").unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir(&data).unwrap();
    let restore_target = dir.path().join("restored");

    let shutdown = CancellationToken::new();
    let agent = Agent::new(test_config(base_url, engine, data)).unwrap();
    let handle = tokio::spawn(agent.run(shutdown.clone()));

    // Wait until the initial backup is done so the engine slot is free.
    wait_for("initial backup log", 20, || !backup_logs(&cp).is_empty()).await;

    cp.lock()
        .unwrap()
        .heartbeat_commands
        .push_back(json!({"command": "sync_snapshots"}));
    cp.lock().unwrap().heartbeat_commands.push_back(json!({
        "command": "restore",
        "restoreConfig": {
            "requestID": "req-9",
            "snapshotID": "0123abcdef",
            "targetPath": restore_target.to_string_lossy(),
        },
    }));

    wait_for("snapshot sync post", 20, || {
        !cp.lock().unwrap().snapshot_posts.is_empty()
    })
    .await;
    wait_for("restore status post", 20, || {
        !cp.lock().unwrap().restore_posts.is_empty()
    })
    .await;

    {
        let cp = cp.lock().unwrap();
        let sync = &cp.snapshot_posts[0];
        assert_eq!(sync["agentID"], "agent-123");
        assert_eq!(sync["snapshots"][0]["shortID"], "0123");

        let restore = &cp.restore_posts[0];
        assert_eq!(restore["requestID"], "req-9");
        assert_eq!(restore["status"], "success");
    }

    let calls = engine_calls(dir.path());
    assert!(
        calls
            .iter()
            .any(|c| c.starts_with("restore 0123abcdef --target")),
        "calls: {calls:?}"
    );

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
