//! # Leader State Machine
//!
//! The heart of the supervisor. A single task drives neard through the
//! six lifecycle states and is the only writer of the supervisor state,
//! the coordination lock, and the child process. Every iteration checks
//! the shutdown channel, reaps the child if it exited, keeps the session
//! renewed, and then does the work of the current state.
//!
//! ## Safety
//!
//! Two hosts can never both validate: Validating requires holding the
//! coordination lock, and the service guarantees mutual exclusion with a
//! quarantine after every loss. Whenever this supervisor merely suspects
//! its session is gone (renewals failing past half the TTL), it demotes
//! itself *before* re-competing, so the quarantine window is always
//! respected.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::consul::{with_retry, AcquireOutcome, ConsulClient, LockPayload, SessionId};
use crate::error::{ChildError, CoordinationError, KeyError};
use crate::exporter::{SharedSnapshot, SupervisorMetrics};
use crate::health::Scraper;
use crate::keys;
use crate::maintenance::{IntentCell, MaintenanceIntent, MaintenanceKind};
use crate::process::{NeardProcess, NeardRole};
use crate::settings::{
    Settings, CATCH_UP_GRACE, GRACEFUL_STOP, LOCK_DELAY, LOCK_KEY, MAX_SPAWN_FAILURES,
    SESSION_RENEW_GRACE, SESSION_RENEW_INTERVAL, SESSION_TTL, SYNC_POLL, VOTING_POLL,
};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Lifecycle state of the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SupervisorState {
    /// Validating keys, opening a session, spawning the first voter.
    #[default]
    Startup,
    /// Waiting for neard to catch up with the chain.
    Syncing,
    /// Competing for the validator lock.
    Registering,
    /// Watching the lock from the sidelines as a plain peer.
    Voting,
    /// Holding the lock and running neard with the validator key.
    Validating,
    /// Terminal: lock released, session destroyed, child stopped.
    Shutdown,
}

/// All states, in a fixed order, for one-hot metric publication.
pub const ALL_STATES: [SupervisorState; 6] = [
    SupervisorState::Startup,
    SupervisorState::Syncing,
    SupervisorState::Registering,
    SupervisorState::Voting,
    SupervisorState::Validating,
    SupervisorState::Shutdown,
];

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Startup => "Startup",
            SupervisorState::Syncing => "Syncing",
            SupervisorState::Registering => "Registering",
            SupervisorState::Voting => "Voting",
            SupervisorState::Validating => "Validating",
            SupervisorState::Shutdown => "Shutdown",
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Fatal errors
// ---------------------------------------------------------------------------

/// Conditions the state machine cannot recover from. Each maps onto a
/// documented daemon exit code.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error("neard failed to become ready {0} times in a row")]
    ChildUnrecoverable(u32),
}

impl FatalError {
    /// Exit code contract: 1 configuration/coordination, 2 key material,
    /// 3 child never became ready.
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::Coordination(_) => 1,
            FatalError::Key(_) => 2,
            FatalError::ChildUnrecoverable(_) => 3,
        }
    }
}

enum SpawnError {
    Key(KeyError),
    Child(ChildError),
}

enum SessionStatus {
    Healthy,
    Lost,
}

/// Renewal bookkeeping for the one live session.
struct SessionKeeper {
    id: SessionId,
    next_renew: Instant,
    failing_since: Option<Instant>,
}

impl SessionKeeper {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            next_renew: Instant::now() + SESSION_RENEW_INTERVAL,
            failing_since: None,
        }
    }

    fn mark_renewed(&mut self) {
        self.failing_since = None;
        self.next_renew = Instant::now() + SESSION_RENEW_INTERVAL;
    }

    /// Records a failed renewal and schedules a quick retry.
    fn note_failure(&mut self) {
        self.failing_since.get_or_insert_with(Instant::now);
        self.next_renew = Instant::now() + Duration::from_secs(1);
    }

    fn failing_longer_than(&self, grace: Duration) -> bool {
        matches!(self.failing_since, Some(since) if since.elapsed() >= grace)
    }
}

/// Decides what a child exit means given the outstanding maintenance
/// intent. A shutdown intent makes the exit terminal; a restart intent is
/// simply consumed and the normal respawn path runs.
fn exit_disposition(intent: &mut Option<MaintenanceIntent>) -> Option<SupervisorState> {
    match intent.take() {
        Some(i) if i.kind == MaintenanceKind::Shutdown => {
            info!(target_height = i.target_height, "scheduled shutdown complete");
            Some(SupervisorState::Shutdown)
        }
        Some(i) => {
            info!(target_height = i.target_height, "scheduled restart, respawning");
            None
        }
        None => None,
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns the leader loop and everything only it may touch.
pub struct Supervisor {
    settings: Settings,
    consul: ConsulClient,
    scraper: Scraper,
    metrics: Arc<SupervisorMetrics>,
    snapshot: SharedSnapshot,
    intent: IntentCell,
    shutdown: watch::Receiver<bool>,
    state: SupervisorState,
    session: Option<SessionKeeper>,
    process: Option<NeardProcess>,
    holds_lock: bool,
    spawn_failures: u32,
    spawned_once: bool,
}

impl Supervisor {
    pub fn new(
        settings: Settings,
        rpc_addr: std::net::SocketAddr,
        metrics: Arc<SupervisorMetrics>,
        snapshot: SharedSnapshot,
        intent: IntentCell,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, CoordinationError> {
        let consul = ConsulClient::new(&settings.consul_url, settings.consul_token.clone())?;
        Ok(Self {
            settings,
            consul,
            scraper: Scraper::new(rpc_addr),
            metrics,
            snapshot,
            intent,
            shutdown,
            state: SupervisorState::Startup,
            session: None,
            process: None,
            holds_lock: false,
            spawn_failures: 0,
            spawned_once: false,
        })
    }

    /// Runs the state machine to completion. Whatever the outcome, the
    /// lock is released, the session destroyed, and the child stopped
    /// before this returns.
    pub async fn run(mut self) -> Result<(), FatalError> {
        let result = self.drive().await;
        if let Err(e) = &result {
            error!(error = %e, "supervisor failed");
        }
        self.finalize().await;
        result
    }

    async fn drive(&mut self) -> Result<(), FatalError> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            let next = match self.state {
                SupervisorState::Startup => self.do_startup().await?,
                SupervisorState::Syncing => self.do_syncing().await?,
                SupervisorState::Registering => self.do_registering().await?,
                SupervisorState::Voting => self.do_voting().await?,
                SupervisorState::Validating => self.do_validating().await?,
                SupervisorState::Shutdown => return Ok(()),
            };
            if next != self.state {
                self.transition(next);
            }
        }
    }

    fn transition(&mut self, next: SupervisorState) {
        info!(from = %self.state, to = %next, "state transition");
        self.state = next;
        self.metrics.set_state(next);
        self.snapshot.write().state = next;
    }

    // -- Startup ------------------------------------------------------------

    async fn do_startup(&mut self) -> Result<SupervisorState, FatalError> {
        // The shared validator identity must be usable before anything
        // else; competing for a lock we cannot serve would be worse than
        // not competing at all.
        keys::load_key(&self.settings.validator_key)?;
        keys::load_key(&self.settings.validator_node_key)?;
        keys::load_key(&self.settings.voter_node_key)?;

        if !self.ensure_session().await? {
            return Ok(SupervisorState::Shutdown);
        }

        match self.start_neard(NeardRole::Voter).await {
            Ok(()) => Ok(SupervisorState::Syncing),
            Err(SpawnError::Key(e)) => Err(FatalError::Key(e)),
            Err(SpawnError::Child(e)) => {
                self.note_spawn_failure(e)?;
                self.tick(Duration::from_secs(1)).await;
                Ok(SupervisorState::Startup)
            }
        }
    }

    // -- Syncing ------------------------------------------------------------

    async fn do_syncing(&mut self) -> Result<SupervisorState, FatalError> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(SupervisorState::Shutdown);
            }
            if self.reap().is_some() {
                if let Some(next) = self.take_exit_disposition() {
                    return Ok(next);
                }
                return Ok(SupervisorState::Startup);
            }
            if let SessionStatus::Lost = self.renew_session().await {
                if !self.ensure_session().await? {
                    return Ok(SupervisorState::Shutdown);
                }
            }

            // The gauge flaps right after a spawn, so give the node time
            // to settle before believing it.
            let in_grace = self
                .process
                .as_ref()
                .is_some_and(|p| p.started_at.elapsed() < CATCH_UP_GRACE);
            match self.scraper.scrape().await {
                Ok(sample) if !in_grace => match sample.is_syncing() {
                    Ok(false) => {
                        info!("neard is synced");
                        return Ok(SupervisorState::Registering);
                    }
                    Ok(true) => debug!("neard still syncing"),
                    Err(e) => debug!(error = %e, "sync gauge unavailable"),
                },
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "scrape failed");
                    if !in_grace && self.scraper.is_unhealthy() {
                        warn!("neard metrics stale beyond budget, restarting child");
                        self.stop_child().await;
                        return Ok(SupervisorState::Startup);
                    }
                }
            }
            self.tick(SYNC_POLL).await;
        }
    }

    // -- Registering --------------------------------------------------------

    async fn do_registering(&mut self) -> Result<SupervisorState, FatalError> {
        let Some(session) = self.session.as_ref().map(|k| k.id.clone()) else {
            return Ok(SupervisorState::Startup);
        };
        let payload = LockPayload {
            node_id: self.settings.node_id.clone(),
        };

        // Knowing the previous holder decides whether promotion needs a
        // restart: reacquiring our own lock with a validator already
        // running must not bounce the process.
        let previous_holder = match self.read_lock_retrying().await {
            Ok(holder) => holder,
            Err(CoordinationError::Cancelled) => return Ok(SupervisorState::Shutdown),
            Err(e) => return Err(e.into()),
        };

        let outcome = {
            let consul = self.consul.clone();
            let session = session.clone();
            let payload = payload.clone();
            with_retry("acquire lock", &mut self.shutdown, move || {
                let consul = consul.clone();
                let session = session.clone();
                let payload = payload.clone();
                async move { consul.acquire(LOCK_KEY, &session, &payload).await }
            })
            .await
        };
        match outcome {
            Ok(AcquireOutcome::Acquired) => {
                self.holds_lock = true;
                self.snapshot.write().active_validator = Some(self.settings.node_id.clone());
                let already_validating = previous_holder.as_deref()
                    == Some(self.settings.node_id.as_str())
                    && self
                        .process
                        .as_ref()
                        .is_some_and(|p| p.role == NeardRole::Validator);
                if already_validating {
                    info!("reacquired our own lock, validator keeps running");
                    return Ok(SupervisorState::Validating);
                }
                info!("lock acquired, restarting neard as validator");
                match self.start_neard(NeardRole::Validator).await {
                    Ok(()) => Ok(SupervisorState::Validating),
                    Err(SpawnError::Key(e)) => Err(FatalError::Key(e)),
                    Err(SpawnError::Child(e)) => {
                        // Give the lock back so a healthy peer can take
                        // over while we start from scratch.
                        self.release_lock().await;
                        self.note_spawn_failure(e)?;
                        self.tick(Duration::from_secs(1)).await;
                        Ok(SupervisorState::Startup)
                    }
                }
            }
            Ok(AcquireOutcome::AlreadyHeld) => {
                debug!("lock already held, falling back to voting");
                Ok(SupervisorState::Voting)
            }
            Err(CoordinationError::Cancelled) => Ok(SupervisorState::Shutdown),
            Err(e) => Err(e.into()),
        }
    }

    // -- Voting -------------------------------------------------------------

    async fn do_voting(&mut self) -> Result<SupervisorState, FatalError> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(SupervisorState::Shutdown);
            }
            let exited = self.reap().is_some();
            if exited {
                if let Some(next) = self.take_exit_disposition() {
                    return Ok(next);
                }
            }
            // Also covers a previous respawn attempt that failed.
            if exited || self.process.is_none() {
                warn!("no neard running while voting, respawning");
                match self.start_neard(NeardRole::Voter).await {
                    Ok(()) => {}
                    Err(SpawnError::Key(e)) => return Err(FatalError::Key(e)),
                    Err(SpawnError::Child(e)) => {
                        self.note_spawn_failure(e)?;
                        self.tick(Duration::from_secs(1)).await;
                        continue;
                    }
                }
            }
            if let SessionStatus::Lost = self.renew_session().await {
                if !self.ensure_session().await? {
                    return Ok(SupervisorState::Shutdown);
                }
            }

            match self.consul.read(LOCK_KEY).await {
                Ok(holder) => {
                    let occupied = holder
                        .as_ref()
                        .and_then(|h| h.session.as_ref())
                        .is_some();
                    self.snapshot.write().active_validator = if occupied {
                        holder.and_then(|h| h.payload).map(|p| p.node_id)
                    } else {
                        None
                    };
                    if !occupied && self.is_synced().await {
                        info!("lock is free and node is synced, competing");
                        return Ok(SupervisorState::Registering);
                    }
                }
                Err(e) => debug!(error = %e, "lock read failed"),
            }
            self.tick(VOTING_POLL).await;
        }
    }

    // -- Validating ---------------------------------------------------------

    async fn do_validating(&mut self) -> Result<SupervisorState, FatalError> {
        let mut last_ownership_check = Instant::now();
        loop {
            if *self.shutdown.borrow() {
                return Ok(SupervisorState::Shutdown);
            }
            if let Some(status) = self.reap() {
                if let Some(next) = self.take_exit_disposition() {
                    return Ok(next);
                }
                warn!(%status, "neard exited while validating, releasing lock");
                self.release_lock().await;
                return Ok(SupervisorState::Startup);
            }

            if let SessionStatus::Lost = self.renew_session().await {
                warn!("session lost while validating, demoting");
                self.demote().await;
                return Ok(SupervisorState::Startup);
            }

            if last_ownership_check.elapsed() >= VOTING_POLL {
                last_ownership_check = Instant::now();
                let ours = self.session.as_ref().map(|k| k.id.0.clone());
                match self.consul.read(LOCK_KEY).await {
                    Ok(Some(holder)) if holder.session == ours => {}
                    Ok(_) => {
                        warn!("lock is no longer ours, demoting");
                        self.demote().await;
                        return Ok(SupervisorState::Startup);
                    }
                    Err(e) => debug!(error = %e, "lock read failed"),
                }
            }

            if self.scraper.scrape().await.is_err() && self.scraper.is_unhealthy() {
                warn!("neard metrics stale beyond budget while validating, demoting");
                self.demote().await;
                return Ok(SupervisorState::Startup);
            }
            self.tick(SYNC_POLL).await;
        }
    }

    // -- Shared machinery ---------------------------------------------------

    /// Sleeps for `period`, waking early when the shutdown channel fires.
    async fn tick(&mut self, period: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    /// Reaps the child if it has exited. Clears the published pid.
    fn reap(&mut self) -> Option<ExitStatus> {
        let status = self.process.as_mut()?.try_wait().ok().flatten()?;
        info!(%status, "reaped neard");
        self.process = None;
        self.snapshot.write().neard_pid = None;
        Some(status)
    }

    fn take_exit_disposition(&mut self) -> Option<SupervisorState> {
        let mut cell = self.intent.lock();
        exit_disposition(&mut cell)
    }

    async fn is_synced(&mut self) -> bool {
        match self.scraper.scrape().await {
            Ok(sample) => matches!(sample.is_syncing(), Ok(false)),
            Err(_) => false,
        }
    }

    /// Creates a session if none exists. Returns false when interrupted
    /// by shutdown.
    async fn ensure_session(&mut self) -> Result<bool, FatalError> {
        if self.session.is_some() {
            return Ok(true);
        }
        let name = format!("kneard-{}", self.settings.node_id);
        let consul = self.consul.clone();
        let created = with_retry("create session", &mut self.shutdown, move || {
            let consul = consul.clone();
            let name = name.clone();
            async move { consul.create_session(&name, SESSION_TTL, LOCK_DELAY).await }
        })
        .await;
        match created {
            Ok(id) => {
                info!(session = %id, "coordination session created");
                self.session = Some(SessionKeeper::new(id));
                Ok(true)
            }
            Err(CoordinationError::Cancelled) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Renews the session when due. `Lost` means the caller must assume
    /// the service may already have given the lock away.
    async fn renew_session(&mut self) -> SessionStatus {
        let Some(keeper) = self.session.as_mut() else {
            return SessionStatus::Lost;
        };
        if Instant::now() < keeper.next_renew {
            return if keeper.failing_longer_than(SESSION_RENEW_GRACE) {
                SessionStatus::Lost
            } else {
                SessionStatus::Healthy
            };
        }
        let id = keeper.id.clone();
        match self.consul.renew(&id).await {
            Ok(()) => {
                self.session
                    .as_mut()
                    .expect("session checked above")
                    .mark_renewed();
                SessionStatus::Healthy
            }
            Err(e) => {
                self.metrics.consul_session_renew_failures.inc();
                warn!(error = %e, "session renewal failed");
                match e {
                    CoordinationError::Transient(_) => {
                        let keeper = self.session.as_mut().expect("session checked above");
                        keeper.note_failure();
                        if keeper.failing_longer_than(SESSION_RENEW_GRACE) {
                            self.session = None;
                            SessionStatus::Lost
                        } else {
                            SessionStatus::Healthy
                        }
                    }
                    // The service no longer knows the session.
                    _ => {
                        self.session = None;
                        SessionStatus::Lost
                    }
                }
            }
        }
    }

    async fn read_lock_retrying(&mut self) -> Result<Option<String>, CoordinationError> {
        let consul = self.consul.clone();
        let holder = with_retry("read lock", &mut self.shutdown, move || {
            let consul = consul.clone();
            async move { consul.read(LOCK_KEY).await }
        })
        .await?;
        Ok(holder.and_then(|h| h.payload).map(|p| p.node_id))
    }

    /// Stops any running child and spawns a fresh one in `role`, with the
    /// keys staged first. Readiness is part of the contract: a child that
    /// never opens its ports is killed and reported as failed.
    async fn start_neard(&mut self, role: NeardRole) -> Result<(), SpawnError> {
        self.stop_child().await;
        match role {
            NeardRole::Voter => keys::stage_voter(&self.settings),
            NeardRole::Validator => keys::stage_validator(&self.settings),
        }
        .map_err(SpawnError::Key)?;

        let mut process = NeardProcess::spawn(&self.settings, role).map_err(SpawnError::Child)?;
        if self.spawned_once {
            self.metrics.neard_restarts.inc();
        }
        self.spawned_once = true;

        if let Err(e) = process.wait_ready().await {
            let _ = process.kill().await;
            return Err(SpawnError::Child(e));
        }
        self.snapshot.write().neard_pid = Some(process.pid);
        self.scraper.reset();
        self.spawn_failures = 0;
        self.process = Some(process);
        Ok(())
    }

    fn note_spawn_failure(&mut self, e: ChildError) -> Result<(), FatalError> {
        self.spawn_failures += 1;
        error!(error = %e, failures = self.spawn_failures, "neard failed to start");
        if self.spawn_failures >= MAX_SPAWN_FAILURES {
            Err(FatalError::ChildUnrecoverable(self.spawn_failures))
        } else {
            Ok(())
        }
    }

    async fn stop_child(&mut self) {
        if let Some(process) = self.process.take() {
            self.snapshot.write().neard_pid = None;
            if let Err(e) = process.stop(GRACEFUL_STOP).await {
                warn!(error = %e, "stopping neard failed");
            }
        }
    }

    /// Releases the lock if we hold it. Errors are logged and dropped;
    /// the session TTL is the backstop.
    async fn release_lock(&mut self) {
        if !self.holds_lock {
            return;
        }
        if let Some(keeper) = &self.session {
            if let Err(e) = self.consul.release(LOCK_KEY, &keeper.id).await {
                warn!(error = %e, "lock release failed, TTL expiry will reclaim it");
            }
        }
        self.holds_lock = false;
        let mut snapshot = self.snapshot.write();
        if snapshot.active_validator.as_deref() == Some(self.settings.node_id.as_str()) {
            snapshot.active_validator = None;
        }
    }

    /// Self-demotion: stop signing first, then give up the lock and the
    /// session. Re-acquisition happens from Startup, after the service's
    /// quarantine.
    async fn demote(&mut self) {
        self.stop_child().await;
        self.release_lock().await;
        if let Some(keeper) = self.session.take() {
            let _ = self.consul.destroy_session(&keeper.id).await;
        }
    }

    /// Terminal cleanup, run exactly once whatever path led here.
    async fn finalize(&mut self) {
        if self.state != SupervisorState::Shutdown {
            self.transition(SupervisorState::Shutdown);
        }
        self.release_lock().await;
        if let Some(keeper) = self.session.take() {
            if let Err(e) = self.consul.destroy_session(&keeper.id).await {
                debug!(error = %e, "session destroy failed");
            }
        }
        self.stop_child().await;
        info!("supervisor stopped");
    }
}
