//! End-to-end tests of the control channel.
//!
//! These spin up the real Unix-socket server with a real maintenance
//! scheduler (pointing at an address nothing listens on) and drive it
//! with the real client, proving that framing, dispatch, and the error
//! taxonomy survive a full round trip.
//!
//! Each test gets its own socket in a fresh temporary directory. No
//! shared state, no test ordering dependencies.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use kneard_supervisor::control::{
    self, ControlClient, ControlContext, ControlRequest, MaintenanceParams,
};
use kneard_supervisor::exporter::{SharedSnapshot, Snapshot};
use kneard_supervisor::leader::SupervisorState;
use kneard_supervisor::maintenance::{IntentCell, MaintenanceIntent, MaintenanceKind,
    MaintenanceScheduler};

struct Harness {
    client: ControlClient,
    snapshot: SharedSnapshot,
    intent: IntentCell,
    shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

/// Starts a control server on a throwaway socket and connects a client.
async fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("kneard.sock");

    let snapshot: SharedSnapshot = Arc::new(RwLock::new(Snapshot::default()));
    let intent: IntentCell = Arc::new(Mutex::new(None));
    let scheduler = Arc::new(MaintenanceScheduler::new(
        PathBuf::from(dir.path()),
        // Nothing listens here; metrics-dependent calls fail fast.
        "127.0.0.1:1".parse().unwrap(),
        Arc::clone(&intent),
        Arc::clone(&snapshot),
    ));

    let listener = control::bind(&socket).expect("bind control socket");
    let ctx = ControlContext {
        snapshot: Arc::clone(&snapshot),
        scheduler,
    };
    let (shutdown, shutdown_rx) = watch::channel(false);
    tokio::spawn(control::serve(listener, ctx, shutdown_rx));

    let client = ControlClient::connect(&socket).await.expect("connect");
    Harness {
        client,
        snapshot,
        intent,
        shutdown,
        _dir: dir,
    }
}

#[tokio::test]
async fn active_validator_reports_none_then_the_holder() {
    let mut h = harness().await;

    let response = h
        .client
        .call(&ControlRequest::ActiveValidator { json: true })
        .await
        .unwrap();
    assert!(response.is_null());

    {
        let mut snapshot = h.snapshot.write();
        snapshot.state = SupervisorState::Validating;
        snapshot.active_validator = Some("kuutamod0".into());
    }

    let response = h
        .client
        .call(&ControlRequest::ActiveValidator { json: false })
        .await
        .unwrap();
    assert_eq!(response["Node"], "kuutamod0");
    assert_eq!(response["State"], "Validating");

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn maintenance_status_follows_the_intent_cell() {
    let mut h = harness().await;

    let response = h
        .client
        .call(&ControlRequest::MaintenanceStatus)
        .await
        .unwrap();
    assert!(response.is_null());

    *h.intent.lock() = Some(MaintenanceIntent {
        kind: MaintenanceKind::Shutdown,
        target_height: 1000,
        requested_at: std::time::Instant::now(),
        block: false,
    });

    let response = h
        .client
        .call(&ControlRequest::MaintenanceStatus)
        .await
        .unwrap();
    assert_eq!(response["kind"], "shutdown");
    assert_eq!(response["target_height"], 1000);

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn cancel_with_nothing_scheduled_is_a_precondition_error() {
    let mut h = harness().await;
    h.snapshot.write().neard_pid = Some(999_999);

    let response = h
        .client
        .call(&ControlRequest::Shutdown(MaintenanceParams {
            cancel: true,
            ..MaintenanceParams::default()
        }))
        .await
        .unwrap();
    assert_eq!(response["error"], "cancel_nothing");

    // Cancelling twice stays a no-op, same tag.
    let response = h
        .client
        .call(&ControlRequest::Shutdown(MaintenanceParams {
            cancel: true,
            ..MaintenanceParams::default()
        }))
        .await
        .unwrap();
    assert_eq!(response["error"], "cancel_nothing");

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn maintenance_without_child_is_unavailable() {
    let mut h = harness().await;

    let response = h
        .client
        .call(&ControlRequest::Restart(MaintenanceParams {
            schedule_at: Some(1000),
            ..MaintenanceParams::default()
        }))
        .await
        .unwrap();
    assert_eq!(response["error"], "unavailable");

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn a_bad_request_does_not_poison_the_connection() {
    let mut h = harness().await;

    // Hand-roll a garbage line through a raw socket to prove the server
    // answers with a parse error and keeps the stream usable.
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    let socket = h._dir.path().join("kneard.sock");
    let stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"this is not json\n").await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let response: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["error"], "parse");

    writer
        .write_all(b"{\"command\":\"self-destruct\"}\n")
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let response: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["error"], "unknown_command");

    // The same connection still serves valid requests.
    writer
        .write_all(b"{\"command\":\"maintenance-status\"}\n")
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    assert_eq!(line, "null");

    // And the original client connection is unaffected too.
    let response = h
        .client
        .call(&ControlRequest::MaintenanceStatus)
        .await
        .unwrap();
    assert!(response.is_null());

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn requests_can_interleave_across_connections() {
    let mut h = harness().await;
    let socket = h._dir.path().join("kneard.sock");
    let mut second = ControlClient::connect(&socket).await.unwrap();

    let first = h
        .client
        .call(&ControlRequest::MaintenanceStatus)
        .await
        .unwrap();
    let other = second
        .call(&ControlRequest::ActiveValidator { json: true })
        .await
        .unwrap();
    assert!(first.is_null());
    assert!(other.is_null());

    let _ = h.shutdown.send(true);
}
