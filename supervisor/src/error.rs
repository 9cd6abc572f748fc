//! Error types for the supervisor.
//!
//! Every subsystem returns its own typed error; only the leader state
//! machine converts errors into state transitions. Errors are logged once
//! at the point of conversion.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Errors in the startup configuration. Always fatal; the daemon exits
/// with code 1 before any child is spawned.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting was not provided via flag or environment.
    #[error("required setting {0} is missing")]
    Missing(&'static str),

    /// A setting was provided but could not be used.
    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// The flag or environment variable name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The Consul token file could not be read.
    #[error("failed to read token file {path}: {source}")]
    TokenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors around the on-disk neard key files.
///
/// Fatal at startup (exit code 2). Mid-run, a key error aborts the spawn
/// and drives the state machine to Shutdown.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The key file does not exist.
    #[error("key file {path} does not exist")]
    Missing { path: PathBuf },

    /// The key file exists but could not be read.
    #[error("failed to read key file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The key file is not valid neard key JSON.
    #[error("key file {path} is not a valid neard key: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Staging a key into the neard home failed. The write is
    /// temp-and-rename; a failure here leaves the previous file intact.
    #[error("failed to stage {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Faults talking to the coordination service.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Worth retrying: connection refused, timeout, HTTP 5xx.
    #[error("transient coordination failure: {0}")]
    Transient(String),

    /// Not worth retrying: authentication denied, malformed response,
    /// or a session that the service no longer knows about.
    #[error("permanent coordination failure: {0}")]
    Permanent(String),

    /// The retry loop was interrupted by the shutdown signal.
    #[error("coordination request cancelled by shutdown")]
    Cancelled,
}

/// Failures of the managed neard process.
#[derive(Debug, Error)]
pub enum ChildError {
    /// The process could not be started, or its home directory could not
    /// be prepared.
    #[error("failed to spawn neard: {0}")]
    FailedToSpawn(#[from] std::io::Error),

    /// The process started but its ports never accepted connections.
    #[error("neard did not become ready within {0:?}")]
    FailedToBecomeReady(Duration),

    /// The process exited.
    #[error("neard exited with {0}")]
    Exited(ExitStatus),
}

/// Failures scraping the managed neard's metrics endpoint.
///
/// Scrape failures are transient and leave the previous sample in place;
/// the leader only treats the child as unhealthy once staleness exceeds
/// its budget.
#[derive(Debug, Error)]
pub enum ScrapeError {
    /// The metrics endpoint could not be reached or returned an error.
    #[error("metrics endpoint unreachable: {0}")]
    Unreachable(String),

    /// A metric the supervisor depends on was absent from the scrape.
    #[error("metric {0} missing from scrape")]
    MissingMetric(&'static str),

    /// A metric was present but its value did not parse.
    #[error("metric {name} has unparsable value {value:?}")]
    BadValue {
        name: &'static str,
        value: String,
    },
}

/// Errors returned to control-channel clients for maintenance requests.
/// Never fatal to the supervisor.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    /// No run of `window` consecutive non-production heights exists within
    /// the bounded search range.
    #[error(
        "no maintenance window of {window} blocks found within {search_limit} blocks of head {head}"
    )]
    NoSlot {
        head: u64,
        window: u64,
        search_limit: u64,
    },

    /// A maintenance operation is already scheduled.
    #[error("a {kind} is already scheduled at block {target_height}")]
    AlreadyActive { kind: String, target_height: u64 },

    /// Cancel was requested but nothing is scheduled.
    #[error("no maintenance is scheduled")]
    CancelNothing,

    /// There is no running neard to reconfigure.
    #[error("no neard process is running")]
    NoProcess,

    /// The child's metrics could not be read while negotiating the target.
    #[error("could not read neard metrics: {0}")]
    Metrics(String),

    /// neard did not reflect the configuration change in its metrics.
    #[error("neard did not confirm the configuration change within {0:?}")]
    NotConfirmed(Duration),
}

impl MaintenanceError {
    /// The stable tag carried in control-channel error responses.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::NoSlot { .. } => "no_slot",
            Self::AlreadyActive { .. } => "already_active",
            Self::CancelNothing => "cancel_nothing",
            Self::NoProcess | Self::Metrics(_) => "unavailable",
            Self::NotConfirmed(_) => "not_confirmed",
        }
    }
}

/// Per-connection errors on the control channel. The connection stays
/// open; the next request is read normally.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The request line was not valid JSON for any known command.
    #[error("malformed control request: {0}")]
    Parse(String),

    /// The `command` field named something this supervisor does not serve.
    #[error("unknown control command: {0}")]
    UnknownCommand(String),
}

impl ControlError {
    /// The stable tag carried in control-channel error responses.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::UnknownCommand(_) => "unknown_command",
        }
    }
}
