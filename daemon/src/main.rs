// Copyright (c) 2026 Kuutamo. MIT License.
// See LICENSE for details.

//! # kneard — neard Failover Supervisor
//!
//! Entry point for the `kneard` daemon. Parses configuration, initializes
//! logging, wires the supervisor's tasks together, and runs the leader
//! state machine until a termination signal or a fatal error.
//!
//! Startup sequence:
//! 1.  Parse flags and `KUUTAMO_*` environment variables
//! 2.  Initialize logging
//! 3.  Raise our own out-of-memory score so neard dies first
//! 4.  Resolve and validate settings
//! 5.  Read neard's RPC address from its config
//! 6.  Create the shared snapshot, metrics, and maintenance intent cell
//! 7.  Bind the control socket and start serving it
//! 8.  Start the metrics exporter
//! 9.  Install the termination signal handler
//! 10. Run the leader state machine to completion
//! 11. Drain background tasks with a bounded deadline
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 unrecoverable
//! key error, 3 child repeatedly failed to become ready.

mod cli;
mod logging;

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::error::ErrorKind;
use clap::Parser;
use parking_lot::{Mutex, RwLock};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use kneard_supervisor::control::{self, ControlContext};
use kneard_supervisor::exporter::{self, ExporterState, Snapshot, SupervisorMetrics};
use kneard_supervisor::leader::Supervisor;
use kneard_supervisor::maintenance::{IntentCell, MaintenanceScheduler};
use kneard_supervisor::process::{rpc_addr, set_own_oom_score_adj};
use kneard_supervisor::settings::SELF_OOM_SCORE_ADJ;

use cli::KneardArgs;
use logging::LogFormat;

/// Upper bound on background task draining after the leader loop ends.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // --- 1. Parse configuration ---
    let args = match KneardArgs::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return 0;
        }
        Err(e) => {
            let _ = e.print();
            return 1;
        }
    };

    // --- 2. Logging ---
    let format = LogFormat::from_str_lossy(&args.log_format);
    logging::init_logging("kneard=info,kneard_supervisor=info", format);

    // --- 3. OOM preference ---
    if let Err(e) = set_own_oom_score_adj(SELF_OOM_SCORE_ADJ) {
        warn!(error = %e, "could not set own oom score");
    }

    // --- 4. Settings ---
    let settings = match args.into_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return 1;
        }
    };
    if let Err(e) = settings.validate() {
        error!(error = %e, "invalid configuration");
        return 1;
    }
    info!(
        node_id = %settings.node_id,
        consul = %settings.consul_url,
        neard_home = %settings.neard_home.display(),
        "starting kneard"
    );

    // --- 5. neard RPC address, stable across roles ---
    let neard_rpc = match rpc_addr(&settings.neard_home) {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "could not read neard rpc address");
            return 1;
        }
    };

    // --- 6. Shared state ---
    let metrics = Arc::new(SupervisorMetrics::new());
    let snapshot = Arc::new(RwLock::new(Snapshot::default()));
    let intent: IntentCell = Arc::new(Mutex::new(None));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    // --- 7. Control socket ---
    let scheduler = Arc::new(MaintenanceScheduler::new(
        settings.neard_home.clone(),
        neard_rpc,
        Arc::clone(&intent),
        Arc::clone(&snapshot),
    ));
    let listener = match control::bind(&settings.control_socket) {
        Ok(listener) => listener,
        Err(e) => {
            error!(
                path = %settings.control_socket.display(),
                error = %e,
                "could not bind control socket"
            );
            return 1;
        }
    };
    info!(path = %settings.control_socket.display(), "control socket bound");
    let control_ctx = ControlContext {
        snapshot: Arc::clone(&snapshot),
        scheduler,
    };
    let control_task = tokio::spawn(control::serve(
        listener,
        control_ctx,
        shutdown_rx.clone(),
    ));

    // --- 8. Exporter ---
    let exporter_state = ExporterState {
        metrics: Arc::clone(&metrics),
        snapshot: Arc::clone(&snapshot),
        started_at: Instant::now(),
    };
    let exporter_addr = settings.exporter_address;
    let exporter_task = tokio::spawn(exporter::serve(
        exporter_addr,
        exporter_state,
        shutdown_rx.clone(),
    ));

    // --- 9. Termination signals ---
    let signal_tx = Arc::clone(&shutdown_tx);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("termination signal received, shutting down");
        let _ = signal_tx.send(true);
    });

    // --- 10. The leader state machine ---
    let supervisor = match Supervisor::new(
        settings,
        neard_rpc,
        Arc::clone(&metrics),
        Arc::clone(&snapshot),
        intent,
        shutdown_rx,
    ) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "could not reach the coordination service");
            return 1;
        }
    };
    let result = supervisor.run().await;

    // --- 11. Drain ---
    let _ = shutdown_tx.send(true);
    let drain = async {
        let _ = control_task.await;
        let _ = exporter_task.await;
    };
    if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_err() {
        warn!("background tasks did not drain in time");
    }

    match result {
        Ok(()) => {
            info!("kneard stopped");
            0
        }
        Err(e) => e.exit_code(),
    }
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
