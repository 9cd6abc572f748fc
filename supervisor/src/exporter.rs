//! # Supervisor Exporter
//!
//! The supervisor's own observability surface: a small HTTP server with
//! the Prometheus metrics of the supervisor (not of neard) and the pid of
//! the managed child. Everything is served from a published snapshot plus
//! pre-registered metric handles; handlers never take long locks and
//! never talk to the child.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`]
//! under the `kneard` namespace.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tower_http::trace::TraceLayer;

use crate::leader::{SupervisorState, ALL_STATES};

/// Read-only view of the supervisor published for the HTTP handlers and
/// the control channel. Written only by the leader task.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Current leader state.
    pub state: SupervisorState,
    /// Pid of the managed neard, if one is running.
    pub neard_pid: Option<u32>,
    /// The node currently holding the validator lock, as last observed.
    pub active_validator: Option<String>,
}

pub type SharedSnapshot = Arc<RwLock<Snapshot>>;

/// Holds all Prometheus metric handles for the supervisor.
#[derive(Clone)]
pub struct SupervisorMetrics {
    registry: Registry,
    /// One-hot gauge family over the leader states.
    state: IntGaugeVec,
    /// Number of neard spawns since the supervisor started.
    pub neard_restarts: IntCounter,
    /// Supervisor uptime in seconds.
    uptime: IntGauge,
    /// Session renewals that failed (transient or otherwise).
    pub consul_session_renew_failures: IntCounter,
}

impl SupervisorMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("kneard".into()), None)
            .expect("failed to create prometheus registry");

        let state = IntGaugeVec::new(
            Opts::new("state", "Current supervisor state (one-hot)"),
            &["type"],
        )
        .expect("metric creation");
        registry
            .register(Box::new(state.clone()))
            .expect("metric registration");

        let neard_restarts = IntCounter::new(
            "neard_restarts",
            "Number of times neard was spawned by this supervisor",
        )
        .expect("metric creation");
        registry
            .register(Box::new(neard_restarts.clone()))
            .expect("metric registration");

        let uptime = IntGauge::new("uptime", "Supervisor uptime in seconds")
            .expect("metric creation");
        registry
            .register(Box::new(uptime.clone()))
            .expect("metric registration");

        let consul_session_renew_failures = IntCounter::new(
            "consul_session_renew_failures_total",
            "Coordination session renewals that failed",
        )
        .expect("metric creation");
        registry
            .register(Box::new(consul_session_renew_failures.clone()))
            .expect("metric registration");

        let metrics = Self {
            registry,
            state,
            neard_restarts,
            uptime,
            consul_session_renew_failures,
        };
        metrics.set_state(SupervisorState::Startup);
        metrics
    }

    /// Publishes the current state as a one-hot gauge family: exactly one
    /// of the `type` label values is 1 at any scrape point.
    pub fn set_state(&self, current: SupervisorState) {
        for state in ALL_STATES {
            self.state
                .with_label_values(&[state.as_str()])
                .set(i64::from(state == current));
        }
    }

    /// Encodes all registered metrics into the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for SupervisorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state of the exporter routes.
#[derive(Clone)]
pub struct ExporterState {
    pub metrics: Arc<SupervisorMetrics>,
    pub snapshot: SharedSnapshot,
    pub started_at: Instant,
}

/// Builds the exporter router.
pub fn router(state: ExporterState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/neard-pid", get(pid_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves the exporter until the shutdown channel fires.
pub async fn serve(
    addr: SocketAddr,
    state: ExporterState,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "exporter listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

async fn metrics_handler(State(state): State<ExporterState>) -> impl IntoResponse {
    state
        .metrics
        .uptime
        .set(state.started_at.elapsed().as_secs() as i64);
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

/// Plain-text pid of the managed neard; empty body when no child runs.
async fn pid_handler(State(state): State<ExporterState>) -> String {
    match state.snapshot.read().neard_pid {
        Some(pid) => pid.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gauge_value(encoded: &str, line_start: &str) -> Option<String> {
        encoded
            .lines()
            .find(|l| l.starts_with(line_start) && l.len() > line_start.len())
            .and_then(|l| l.split_whitespace().last().map(str::to_string))
    }

    // -- 1. One-hot state family -------------------------------------------

    #[test]
    fn state_gauges_are_one_hot() {
        let metrics = SupervisorMetrics::new();
        metrics.set_state(SupervisorState::Validating);
        let encoded = metrics.encode().unwrap();

        let mut sum = 0;
        for state in ALL_STATES {
            let line = format!("kneard_state{{type=\"{}\"}}", state.as_str());
            let value: i64 = gauge_value(&encoded, &line).unwrap().parse().unwrap();
            sum += value;
            if state == SupervisorState::Validating {
                assert_eq!(value, 1);
            } else {
                assert_eq!(value, 0);
            }
        }
        assert_eq!(sum, 1, "exactly one state gauge must be set");
    }

    #[test]
    fn state_transitions_move_the_hot_gauge() {
        let metrics = SupervisorMetrics::new();
        metrics.set_state(SupervisorState::Voting);
        metrics.set_state(SupervisorState::Registering);
        let encoded = metrics.encode().unwrap();
        assert_eq!(
            gauge_value(&encoded, "kneard_state{type=\"Voting\"}").unwrap(),
            "0"
        );
        assert_eq!(
            gauge_value(&encoded, "kneard_state{type=\"Registering\"}").unwrap(),
            "1"
        );
    }

    // -- 2. Restart counter -------------------------------------------------

    #[test]
    fn restart_counter_is_monotone() {
        let metrics = SupervisorMetrics::new();
        metrics.neard_restarts.inc();
        metrics.neard_restarts.inc();
        let encoded = metrics.encode().unwrap();
        assert_eq!(
            gauge_value(&encoded, "kneard_neard_restarts").unwrap(),
            "2"
        );
    }

    // -- 3. Namespace -------------------------------------------------------

    #[test]
    fn all_series_carry_the_kneard_namespace() {
        let metrics = SupervisorMetrics::new();
        let encoded = metrics.encode().unwrap();
        for line in encoded.lines().filter(|l| !l.starts_with('#')) {
            assert!(
                line.starts_with("kneard_"),
                "unexpected series outside namespace: {line}"
            );
        }
        assert!(encoded.contains("kneard_consul_session_renew_failures_total"));
        assert!(encoded.contains("kneard_uptime"));
    }

    // -- 4. Pid endpoint ----------------------------------------------------

    #[tokio::test]
    async fn pid_endpoint_renders_pid_or_empty() {
        let snapshot: SharedSnapshot = Arc::new(RwLock::new(Snapshot::default()));
        let state = ExporterState {
            metrics: Arc::new(SupervisorMetrics::new()),
            snapshot: Arc::clone(&snapshot),
            started_at: Instant::now(),
        };

        let body = pid_handler(State(state.clone())).await;
        assert_eq!(body, "");

        snapshot.write().neard_pid = Some(4242);
        let body = pid_handler(State(state)).await;
        assert_eq!(body, "4242");
    }
}
