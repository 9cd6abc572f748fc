//! # Maintenance Scheduling
//!
//! Plans restarts and shutdowns at a block height where this validator is
//! not scheduled to produce. neard re-reads `dyn_config.json` on SIGHUP
//! and applies `expected_shutdown` without restarting; once the head
//! reaches that height the process exits cleanly and the leader loop
//! decides, based on the recorded intent, whether to respawn (restart) or
//! to terminate the supervisor (shutdown).
//!
//! At most one intent is outstanding at a time. The intent cell is the
//! only piece of state shared between the control task (writer) and the
//! leader task (reader); both hold the mutex for moments only.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::MaintenanceError;
use crate::exporter::SharedSnapshot;
use crate::health::fetch_sample;
use crate::keys::atomic_write;
use crate::process::signal_reload;
use crate::settings::{
    DYN_CONFIG_FILE, MAINTENANCE_CONFIRM, MAINTENANCE_SEARCH_WINDOW, SCRAPE_TIMEOUT,
};

/// What should happen once the target height passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceKind {
    /// neard exits and is respawned in its previous role.
    Restart,
    /// neard exits and the supervisor follows it down.
    Shutdown,
}

impl std::fmt::Display for MaintenanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaintenanceKind::Restart => f.write_str("restart"),
            MaintenanceKind::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// One outstanding maintenance operation.
#[derive(Debug, Clone)]
pub struct MaintenanceIntent {
    pub kind: MaintenanceKind,
    pub target_height: u64,
    pub requested_at: Instant,
    /// Whether the requesting control call is blocking on completion.
    pub block: bool,
}

/// The shared intent cell.
pub type IntentCell = Arc<Mutex<Option<MaintenanceIntent>>>;

/// How the operator pinned the target height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSpec {
    /// Trust the operator's height verbatim.
    At(u64),
    /// Find the nearest window of this many production-free heights.
    Window(u64),
}

/// Finds the earliest height `t >= head + window` such that no height in
/// `[t, t + window)` is a production slot, searching no further than
/// `head + search_limit`.
pub fn pick_target_height(
    head: u64,
    window: u64,
    slots: &[u64],
    search_limit: u64,
) -> Result<u64, MaintenanceError> {
    let window = window.max(1);
    let limit = head + search_limit;
    let mut target = head + window;
    while target <= limit {
        match slots
            .iter()
            .find(|&&slot| slot >= target && slot < target + window)
        {
            None => return Ok(target),
            // Skip just past the colliding slot and try again.
            Some(&slot) => target = slot + 1,
        }
    }
    Err(MaintenanceError::NoSlot {
        head,
        window,
        search_limit,
    })
}

#[derive(Serialize, Deserialize)]
struct DynConfig {
    expected_shutdown: u64,
}

/// Drives neard's dynamic-config facility on behalf of control clients.
pub struct MaintenanceScheduler {
    neard_home: PathBuf,
    rpc_addr: SocketAddr,
    intent: IntentCell,
    snapshot: SharedSnapshot,
    http: reqwest::Client,
}

impl MaintenanceScheduler {
    pub fn new(
        neard_home: PathBuf,
        rpc_addr: SocketAddr,
        intent: IntentCell,
        snapshot: SharedSnapshot,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(SCRAPE_TIMEOUT)
            .build()
            .expect("building maintenance http client");
        Self {
            neard_home,
            rpc_addr,
            intent,
            snapshot,
            http,
        }
    }

    fn metrics_url(&self) -> String {
        format!("http://{}/metrics", self.rpc_addr)
    }

    fn current_pid(&self) -> Result<u32, MaintenanceError> {
        self.snapshot
            .read()
            .neard_pid
            .ok_or(MaintenanceError::NoProcess)
    }

    /// Schedules a restart or shutdown. Returns the target height. With
    /// `block`, resolves only after the child exit has been observed.
    pub async fn schedule(
        &self,
        kind: MaintenanceKind,
        spec: TargetSpec,
        block: bool,
    ) -> Result<u64, MaintenanceError> {
        if let Some(active) = self.intent.lock().as_ref() {
            return Err(MaintenanceError::AlreadyActive {
                kind: active.kind.to_string(),
                target_height: active.target_height,
            });
        }
        let pid = self.current_pid()?;

        let target = match spec {
            TargetSpec::At(height) => height,
            TargetSpec::Window(window) => {
                let sample = fetch_sample(&self.http, &self.metrics_url())
                    .await
                    .map_err(|e| MaintenanceError::Metrics(e.to_string()))?;
                let head = sample
                    .block_height()
                    .map_err(|e| MaintenanceError::Metrics(e.to_string()))?;
                let slots = sample.production_slots();
                pick_target_height(head, window, &slots, MAINTENANCE_SEARCH_WINDOW)?
            }
        };

        self.write_dyn_config(target)?;
        signal_reload(pid).map_err(|_| MaintenanceError::NoProcess)?;
        self.confirm_expected_shutdown(target).await?;

        info!(%kind, target_height = target, pid, "maintenance scheduled");
        *self.intent.lock() = Some(MaintenanceIntent {
            kind,
            target_height: target,
            requested_at: Instant::now(),
            block,
        });

        if block {
            self.wait_for_completion(pid).await;
        }
        Ok(target)
    }

    /// Cancels the outstanding intent, if any. Confirmed by watching the
    /// reload counter advance, since the expected-shutdown gauge returns
    /// to the same zero it had before any scheduling.
    pub async fn cancel(&self) -> Result<(), MaintenanceError> {
        if self.intent.lock().is_none() {
            return Err(MaintenanceError::CancelNothing);
        }
        let pid = self.current_pid()?;

        let baseline = match fetch_sample(&self.http, &self.metrics_url()).await {
            Ok(sample) => sample.config_reloads().unwrap_or(0),
            Err(_) => 0,
        };

        self.write_dyn_config(0)?;
        signal_reload(pid).map_err(|_| MaintenanceError::NoProcess)?;

        let deadline = Instant::now() + MAINTENANCE_CONFIRM;
        loop {
            if let Ok(sample) = fetch_sample(&self.http, &self.metrics_url()).await {
                let reloaded = sample.config_reloads().unwrap_or(0) > baseline;
                let cleared = matches!(sample.expected_shutdown(), Ok(None));
                if reloaded && cleared {
                    break;
                }
            }
            if Instant::now() >= deadline {
                return Err(MaintenanceError::NotConfirmed(MAINTENANCE_CONFIRM));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        info!(pid, "maintenance cancelled");
        *self.intent.lock() = None;
        Ok(())
    }

    /// The outstanding intent, if any.
    pub fn status(&self) -> Option<(MaintenanceKind, u64)> {
        self.intent
            .lock()
            .as_ref()
            .map(|intent| (intent.kind, intent.target_height))
    }

    fn write_dyn_config(&self, expected_shutdown: u64) -> Result<(), MaintenanceError> {
        let contents = serde_json::to_vec_pretty(&DynConfig { expected_shutdown })
            .expect("dyn config serializes");
        atomic_write(&self.neard_home.join(DYN_CONFIG_FILE), &contents)
            .map_err(|e| MaintenanceError::Metrics(format!("writing dynamic config: {e}")))
    }

    async fn confirm_expected_shutdown(&self, target: u64) -> Result<(), MaintenanceError> {
        let deadline = Instant::now() + MAINTENANCE_CONFIRM;
        loop {
            if let Ok(sample) = fetch_sample(&self.http, &self.metrics_url()).await {
                if sample.expected_shutdown().ok().flatten() == Some(target) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(MaintenanceError::NotConfirmed(MAINTENANCE_CONFIRM));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    /// Blocks until the published child pid is gone or different, meaning
    /// the scheduled exit has happened. Deliberately uncapped; the client
    /// opted into blocking.
    async fn wait_for_completion(&self, pid: u32) {
        loop {
            match self.snapshot.read().neard_pid {
                Some(current) if current == pid => {}
                _ => return,
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::Snapshot;
    use parking_lot::RwLock;

    // -- 1. Target height selection ----------------------------------------

    #[test]
    fn target_without_slots_is_head_plus_window() {
        assert_eq!(pick_target_height(100, 5, &[], 10_000).unwrap(), 105);
    }

    #[test]
    fn target_avoids_slots_inside_the_window() {
        // 105..110 collides with slot 107, so the window slides past it.
        let slots = vec![107];
        assert_eq!(pick_target_height(100, 5, &slots, 10_000).unwrap(), 108);
    }

    #[test]
    fn target_slides_past_consecutive_slots() {
        let slots = vec![105, 106, 107, 108, 109, 110];
        assert_eq!(pick_target_height(100, 5, &slots, 10_000).unwrap(), 111);
    }

    #[test]
    fn slots_behind_the_window_do_not_matter() {
        let slots = vec![50, 101, 104];
        assert_eq!(pick_target_height(100, 5, &slots, 10_000).unwrap(), 105);
    }

    #[test]
    fn dense_schedule_yields_no_slot() {
        // Every candidate window within the search range collides.
        let slots: Vec<u64> = (100..300).collect();
        let err = pick_target_height(100, 5, &slots, 100).unwrap_err();
        assert!(matches!(err, MaintenanceError::NoSlot { .. }));
    }

    #[test]
    fn zero_window_is_treated_as_one() {
        assert_eq!(pick_target_height(100, 0, &[], 10_000).unwrap(), 101);
    }

    // -- 2. Intent bookkeeping ----------------------------------------------

    fn scheduler_with(intent: IntentCell, pid: Option<u32>) -> MaintenanceScheduler {
        let snapshot = Arc::new(RwLock::new(Snapshot {
            neard_pid: pid,
            ..Snapshot::default()
        }));
        MaintenanceScheduler::new(
            PathBuf::from("/nonexistent"),
            "127.0.0.1:3030".parse().unwrap(),
            intent,
            snapshot,
        )
    }

    #[tokio::test]
    async fn cancel_without_intent_is_cancel_nothing() {
        let intent: IntentCell = Arc::new(Mutex::new(None));
        let scheduler = scheduler_with(Arc::clone(&intent), Some(1));
        let err = scheduler.cancel().await.unwrap_err();
        assert!(matches!(err, MaintenanceError::CancelNothing));
    }

    #[tokio::test]
    async fn schedule_refuses_a_second_intent() {
        let intent: IntentCell = Arc::new(Mutex::new(Some(MaintenanceIntent {
            kind: MaintenanceKind::Shutdown,
            target_height: 1000,
            requested_at: Instant::now(),
            block: false,
        })));
        let scheduler = scheduler_with(Arc::clone(&intent), Some(1));
        let err = scheduler
            .schedule(MaintenanceKind::Restart, TargetSpec::At(2000), false)
            .await
            .unwrap_err();
        match err {
            MaintenanceError::AlreadyActive {
                kind,
                target_height,
            } => {
                assert_eq!(kind, "shutdown");
                assert_eq!(target_height, 1000);
            }
            other => panic!("expected AlreadyActive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn schedule_without_child_is_unavailable() {
        let intent: IntentCell = Arc::new(Mutex::new(None));
        let scheduler = scheduler_with(intent, None);
        let err = scheduler
            .schedule(MaintenanceKind::Restart, TargetSpec::At(2000), false)
            .await
            .unwrap_err();
        assert!(matches!(err, MaintenanceError::NoProcess));
        assert_eq!(err.tag(), "unavailable");
    }

    // -- 3. Dynamic config shape --------------------------------------------

    #[test]
    fn dyn_config_wire_shape() {
        let json = serde_json::to_string(&DynConfig {
            expected_shutdown: 1000,
        })
        .unwrap();
        assert_eq!(json, r#"{"expected_shutdown":1000}"#);
    }
}
