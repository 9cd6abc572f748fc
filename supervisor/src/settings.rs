//! # Supervisor Settings & Tunables
//!
//! Every timeout, interval, and well-known path the supervisor relies on
//! lives here, next to the [`Settings`] struct that carries the per-host
//! configuration. The daemon parses flags and `KUUTAMO_*` environment
//! variables once at startup and hands the resulting `Settings` to every
//! component; nothing reads the environment after that.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Coordination service
// ---------------------------------------------------------------------------

/// Heartbeat budget of a coordination session. A session whose renewals
/// stop arriving is expired by the service after this long.
pub const SESSION_TTL: Duration = Duration::from_secs(15);

/// Quarantine the service enforces after a session loses the lock. No
/// session may re-acquire the key during this window, which is what makes
/// self-demotion safe.
pub const LOCK_DELAY: Duration = Duration::from_secs(10);

/// Renew cadence. One third of the TTL leaves two retries before expiry.
pub const SESSION_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// How long renewals may keep failing before the supervisor assumes the
/// session is gone and demotes itself. Half the TTL: pessimistic on
/// purpose, the service itself would wait the full TTL.
pub const SESSION_RENEW_GRACE: Duration = Duration::from_secs(7);

/// Key under which the current validator registers itself.
pub const LOCK_KEY: &str = "kuutamo/validator/lock";

/// Timeout for any single coordination HTTP call.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Child process
// ---------------------------------------------------------------------------

/// How long a freshly spawned neard may take to open its network and RPC
/// ports before the spawn is considered failed.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(180);

/// Grace period between SIGTERM and SIGKILL when stopping neard.
pub const GRACEFUL_STOP: Duration = Duration::from_secs(30);

/// Consecutive spawn-or-readiness failures after which the supervisor
/// gives up and exits with code 3.
pub const MAX_SPAWN_FAILURES: u32 = 3;

/// The supervisor's own out-of-memory score. The child is spawned with
/// [`CHILD_OOM_SCORE_ADJ`], which is strictly higher, so the kernel kills
/// neard before it kills the supervisor.
pub const SELF_OOM_SCORE_ADJ: i16 = 100;

/// Out-of-memory score applied to the spawned neard.
pub const CHILD_OOM_SCORE_ADJ: i16 = 1000;

// ---------------------------------------------------------------------------
// Health scraping
// ---------------------------------------------------------------------------

/// Timeout for a single scrape of neard's metrics endpoint.
pub const SCRAPE_TIMEOUT: Duration = Duration::from_secs(2);

/// How stale the last successful scrape may be before the child is
/// treated as unhealthy.
pub const SCRAPE_UNHEALTHY: Duration = Duration::from_secs(30);

/// Time after a spawn during which the sync gauge is ignored. neard
/// reports itself synced for a moment before it starts catching up.
pub const CATCH_UP_GRACE: Duration = Duration::from_secs(60);

/// Poll interval while waiting for the node to sync.
pub const SYNC_POLL: Duration = Duration::from_secs(1);

/// Poll interval of the lock key while voting, and of the lock ownership
/// check while validating.
pub const VOTING_POLL: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

/// How far ahead of the current head the maintenance scheduler will
/// search for a block-production gap before giving up.
pub const MAINTENANCE_SEARCH_WINDOW: u64 = 10_000;

/// How long neard may take to reflect a dynamic-config change in its
/// metrics before the control call fails.
pub const MAINTENANCE_CONFIRM: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Well-known file names inside the neard home
// ---------------------------------------------------------------------------

/// Network identity key used by the running neard.
pub const NODE_KEY_FILE: &str = "node_key.json";

/// Consensus signing key. Present iff the node is validating.
pub const VALIDATOR_KEY_FILE: &str = "validator_key.json";

/// neard's main configuration file, patched in place before each spawn.
pub const CONFIG_FILE: &str = "config.json";

/// Dynamic configuration file, reloaded by neard on SIGHUP.
pub const DYN_CONFIG_FILE: &str = "dyn_config.json";

/// Directory under the neard home for the child's date-stamped logs.
pub const LOG_DIR: &str = "logs";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Per-host configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Stable identifier of this supervisor; published in the lock payload.
    pub node_id: String,
    /// Base URL of the coordination service's HTTP API.
    pub consul_url: String,
    /// ACL token sent as `X-Consul-Token`, if the service requires one.
    pub consul_token: Option<String>,
    /// Bind address of the supervisor's own metrics exporter.
    pub exporter_address: SocketAddr,
    /// Network address neard binds while validating.
    pub validator_network_addr: SocketAddr,
    /// Network address neard binds while voting.
    pub voter_network_addr: SocketAddr,
    /// Path to the shared consensus signing key.
    pub validator_key: PathBuf,
    /// Path to the shared network identity used while validating.
    pub validator_node_key: PathBuf,
    /// Path to this host's private network identity used while voting.
    pub voter_node_key: PathBuf,
    /// neard's working directory. The supervisor owns writes to it.
    pub neard_home: PathBuf,
    /// Comma-separated bootstrap peers passed to neard.
    pub neard_bootnodes: Option<String>,
    /// Path of the local control socket.
    pub control_socket: PathBuf,
    /// Optional address advertised to peers instead of the bind address.
    pub public_address: Option<String>,
    /// The neard executable. Defaults to `neard` on PATH.
    pub neard_binary: PathBuf,
}

impl Settings {
    /// Cross-field validation beyond what argument parsing can express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::Missing("KUUTAMO_NODE_ID"));
        }
        if !(self.consul_url.starts_with("http://") || self.consul_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                name: "KUUTAMO_CONSUL_URL",
                reason: format!("not an http(s) URL: {}", self.consul_url),
            });
        }
        if !self.neard_home.is_dir() {
            return Err(ConfigError::Invalid {
                name: "KUUTAMO_NEARD_HOME",
                reason: format!("{} is not a directory", self.neard_home.display()),
            });
        }
        if !self.neard_home.join(CONFIG_FILE).is_file() {
            return Err(ConfigError::Invalid {
                name: "KUUTAMO_NEARD_HOME",
                reason: format!(
                    "{} does not contain {CONFIG_FILE}",
                    self.neard_home.display()
                ),
            });
        }
        Ok(())
    }
}

/// Reads a coordination ACL token from a file, stripping trailing
/// whitespace. Token files commonly end in a newline that must not become
/// part of the header value.
pub fn read_token_file(path: &Path) -> Result<String, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::TokenFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(raw.trim_end().to_string())
}
