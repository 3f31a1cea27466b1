// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end agent tests: a real directory tree, a real checkpoint store,
//! and an in-memory transport standing in for the remote intake.

use ddtail::lifecycle::Agent;
use ddtail_config::AgentConfig;
use ddtail_sender::{decode_body, BatchTransport, MemoryTransport};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Fixture {
    logs: tempfile::TempDir,
    state: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Fixture {
        Fixture {
            logs: tempfile::tempdir().unwrap(),
            state: tempfile::tempdir().unwrap(),
        }
    }

    fn log_path(&self, name: &str) -> std::path::PathBuf {
        self.logs.path().join(name)
    }

    fn config(&self, source_overrides: serde_json::Value) -> AgentConfig {
        let mut source = serde_json::json!({
            "name": "app",
            "path_glob": format!("{}/*.log", self.logs.path().display()),
            "destination": "main",
            "multiline_timeout_ms": 100,
            "tags": [["env", "prod"]],
        });
        source
            .as_object_mut()
            .unwrap()
            .extend(source_overrides.as_object().unwrap().clone());
        serde_json::from_value(serde_json::json!({
            "sources": [source],
            "destinations": [{
                "name": "main",
                "endpoint": "https://intake.example.com/v1/batch",
                "max_batch_age_ms": 100,
            }],
            "checkpoint_dir": self.state.path().join("checkpoints"),
            "watch": { "poll_interval_secs": 0 },
            "exit_drain_secs": 2,
        }))
        .unwrap()
    }
}

/// Contents of every delivered data record (agent alarms and profiles are
/// filtered out), in delivery order.
fn delivered_contents(transport: &MemoryTransport) -> Vec<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut batches = transport.delivered();
    batches.sort_by_key(|b| b.sequence);
    for batch in batches {
        let payload = decode_body(&batch.body, batch.compressed).unwrap();
        if payload
            .tags
            .iter()
            .any(|t| t == "source:ddtail-agent")
        {
            continue;
        }
        for record in payload.records {
            out.push(record.fields);
        }
    }
    out
}

fn field<'a>(fields: &'a [(String, String)], key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn run_agent(
    config: AgentConfig,
    transport: Arc<MemoryTransport>,
) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let transport: Arc<dyn BatchTransport> = transport;
    let agent = Agent::new(config, None, Some(transport)).unwrap();
    let shutdown = CancellationToken::new();
    let reload = Arc::new(Notify::new());
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        agent.run(token, reload).await.unwrap();
    });
    (shutdown, handle)
}

async fn stop_agent(shutdown: CancellationToken, handle: tokio::task::JoinHandle<()>) {
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(30), handle)
        .await
        .expect("agent did not stop in time")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simple_tail() {
    let fixture = Fixture::new();
    fs::write(fixture.log_path("a.log"), b"alpha\nbeta\n").unwrap();

    let transport = MemoryTransport::new();
    let (shutdown, handle) =
        run_agent(fixture.config(serde_json::json!({})), transport.clone()).await;

    wait_for("two records", || delivered_contents(&transport).len() >= 2).await;
    let records = delivered_contents(&transport);
    assert_eq!(field(&records[0], "content"), Some("alpha"));
    assert_eq!(field(&records[1], "content"), Some("beta"));

    // The source's configured tag set and the per-record file path both
    // reach the wire.
    let payloads: Vec<_> = transport
        .delivered()
        .iter()
        .map(|b| decode_body(&b.body, b.compressed).unwrap())
        .filter(|p| !p.tags.iter().any(|t| t == "source:ddtail-agent"))
        .collect();
    assert!(!payloads.is_empty());
    assert!(payloads
        .iter()
        .all(|p| p.tags.contains(&"env:prod".to_owned())));
    assert!(payloads[0].records[0]
        .tags
        .iter()
        .any(|t| t.starts_with("path:") && t.ends_with("a.log")));

    stop_agent(shutdown, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multiline_start_mode() {
    let fixture = Fixture::new();
    fs::write(
        fixture.log_path("a.log"),
        b"E: one\n  at x\n  at y\nE: two\n  at z\n",
    )
    .unwrap();

    let transport = MemoryTransport::new();
    let config = fixture.config(serde_json::json!({
        "multiline": { "mode": "start", "start": "^E: " },
    }));
    let (shutdown, handle) = run_agent(config, transport.clone()).await;

    // The second record only closes via the multiline idle timeout.
    wait_for("two merged records", || {
        delivered_contents(&transport).len() >= 2
    })
    .await;
    let records = delivered_contents(&transport);
    assert_eq!(field(&records[0], "content"), Some("E: one\n  at x\n  at y"));
    assert_eq!(field(&records[1], "content"), Some("E: two\n  at z"));

    stop_agent(shutdown, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_resumes_without_duplicates() {
    let fixture = Fixture::new();
    fs::write(fixture.log_path("a.log"), b"first\n").unwrap();

    let transport = MemoryTransport::new();
    let config = fixture.config(serde_json::json!({}));
    let (shutdown, handle) = run_agent(config.clone(), transport.clone()).await;
    wait_for("first record", || !delivered_contents(&transport).is_empty()).await;
    stop_agent(shutdown, handle).await;

    // Append while the agent is down; the restart must pick up only the new
    // bytes.
    let mut contents = fs::read(fixture.log_path("a.log")).unwrap();
    contents.extend_from_slice(b"second\n");
    fs::write(fixture.log_path("a.log"), contents).unwrap();

    let transport2 = MemoryTransport::new();
    let (shutdown, handle) = run_agent(config, transport2.clone()).await;
    wait_for("second record", || {
        !delivered_contents(&transport2).is_empty()
    })
    .await;
    let records = delivered_contents(&transport2);
    assert_eq!(records.len(), 1);
    assert_eq!(field(&records[0], "content"), Some("second"));

    stop_agent(shutdown, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rotation_by_rename() {
    let fixture = Fixture::new();
    let path = fixture.log_path("a.log");
    fs::write(&path, b"old-line\n").unwrap();

    let transport = MemoryTransport::new();
    let (shutdown, handle) =
        run_agent(fixture.config(serde_json::json!({})), transport.clone()).await;
    wait_for("old record", || !delivered_contents(&transport).is_empty()).await;

    // Rename-aside rotation: the old inode moves, a new file takes the path.
    fs::rename(&path, fixture.log_path("a.log.1")).unwrap();
    fs::write(&path, b"new-line\n").unwrap();

    wait_for("new record", || {
        delivered_contents(&transport)
            .iter()
            .any(|r| field(r, "content") == Some("new-line"))
    })
    .await;
    let records = delivered_contents(&transport);
    let old_count = records
        .iter()
        .filter(|r| field(r, "content") == Some("old-line"))
        .count();
    assert_eq!(old_count, 1, "rotation must not re-send the old inode");

    stop_agent(shutdown, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_growing_file_is_followed() {
    let fixture = Fixture::new();
    let path = fixture.log_path("grow.log");
    fs::write(&path, b"one\n").unwrap();

    let transport = MemoryTransport::new();
    let (shutdown, handle) =
        run_agent(fixture.config(serde_json::json!({})), transport.clone()).await;
    wait_for("initial record", || {
        !delivered_contents(&transport).is_empty()
    })
    .await;

    let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
    std::io::Write::write_all(&mut f, b"two\nthree\n").unwrap();
    drop(f);

    wait_for("appended records", || delivered_contents(&transport).len() >= 3).await;
    let records = delivered_contents(&transport);
    let contents: Vec<&str> = records
        .iter()
        .filter_map(|r| field(r, "content"))
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);

    stop_agent(shutdown, handle).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_json_parser_end_to_end() {
    let fixture = Fixture::new();
    fs::write(
        fixture.log_path("a.log"),
        b"{\"level\":\"info\",\"msg\":\"ready\"}",
    )
    .unwrap();

    let transport = MemoryTransport::new();
    let config = fixture.config(serde_json::json!({
        "parser": { "type": "json" },
    }));
    let (shutdown, handle) = run_agent(config, transport.clone()).await;

    wait_for("json record", || !delivered_contents(&transport).is_empty()).await;
    let records = delivered_contents(&transport);
    assert_eq!(field(&records[0], "level"), Some("info"));
    assert_eq!(field(&records[0], "msg"), Some("ready"));

    stop_agent(shutdown, handle).await;
}

#[test]
fn test_store_lock_is_exclusive_while_running() {
    let fixture = Fixture::new();
    let config = fixture.config(serde_json::json!({}));
    let dir: &Path = &config.checkpoint_dir;
    let first = ddtail_checkpoint::CheckpointStore::open(dir).unwrap();
    assert!(matches!(
        ddtail_checkpoint::CheckpointStore::open(dir),
        Err(ddtail_checkpoint::StoreError::Locked(_))
    ));
    drop(first);
    assert!(ddtail_checkpoint::CheckpointStore::open(dir).is_ok());
}
