//! # neard Process Supervision
//!
//! Spawns neard in the requested role, waits for it to open its ports,
//! and shuts it down on demand. Before each spawn the home's
//! `config.json` is patched in place so the network layer binds the
//! role-appropriate address; the RPC and metrics addresses are left
//! untouched so the scraper and exporter never need to re-resolve.
//!
//! The child's stdout and stderr go to a date-stamped log file under the
//! home. Its out-of-memory score is raised above the supervisor's own, so
//! that under memory pressure the kernel reaps neard and leaves the
//! supervisor alive to restart it.

use std::net::SocketAddr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::ChildError;
use crate::settings::{
    Settings, CHILD_OOM_SCORE_ADJ, CONFIG_FILE, LOG_DIR, READINESS_TIMEOUT,
};

/// The role a spawned neard plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeardRole {
    /// Holds the validator key and signs blocks.
    Validator,
    /// Plain peer without the validator key.
    Voter,
}

impl std::fmt::Display for NeardRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NeardRole::Validator => f.write_str("validator"),
            NeardRole::Voter => f.write_str("voter"),
        }
    }
}

/// A running neard under supervision.
pub struct NeardProcess {
    child: Child,
    pub pid: u32,
    pub role: NeardRole,
    pub started_at: Instant,
    /// Network address the child binds for this role.
    pub listen_addr: SocketAddr,
    /// RPC address, stable across roles. Doubles as the metrics address.
    pub rpc_addr: SocketAddr,
}

impl NeardProcess {
    /// Spawns neard in the given role. The caller must have staged the
    /// keys for that role beforehand.
    pub fn spawn(settings: &Settings, role: NeardRole) -> Result<Self, ChildError> {
        let listen_addr = match role {
            NeardRole::Validator => settings.validator_network_addr,
            NeardRole::Voter => settings.voter_network_addr,
        };
        let rpc_addr = patch_config(
            &settings.neard_home,
            listen_addr,
            settings.public_address.as_deref(),
        )?;

        let log_path = log_file_path(&settings.neard_home);
        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_err = log.try_clone()?;

        let mut command = Command::new(&settings.neard_binary);
        command
            .arg("--home")
            .arg(&settings.neard_home)
            .arg("run")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(bootnodes) = &settings.neard_bootnodes {
            command.arg("--boot-nodes").arg(bootnodes);
        }

        // If the supervisor dies without cleanup, the kernel takes the
        // child down with it. Elsewhere the shutdown path covers this.
        #[cfg(target_os = "linux")]
        unsafe {
            command.pre_exec(|| {
                nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }

        let child = command.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "child exited before spawn returned")
        })?;

        if let Err(e) = set_oom_score_adj(pid, CHILD_OOM_SCORE_ADJ) {
            // Not available on every platform; losing the preference is
            // survivable, losing the child is not.
            warn!(pid, error = %e, "could not raise neard oom score");
        }

        info!(pid, %role, %listen_addr, log = %log_path.display(), "spawned neard");
        Ok(Self {
            child,
            pid,
            role,
            started_at: Instant::now(),
            listen_addr,
            rpc_addr,
        })
    }

    /// Probes the role's network port and the RPC port until both accept
    /// connections or the readiness budget runs out. Detects a child that
    /// dies while we wait.
    pub async fn wait_ready(&mut self) -> Result<(), ChildError> {
        let deadline = Instant::now() + READINESS_TIMEOUT;
        let ports = [self.listen_addr, self.rpc_addr];
        for addr in ports {
            loop {
                if let Some(status) = self.child.try_wait()? {
                    return Err(ChildError::Exited(status));
                }
                if Instant::now() >= deadline {
                    return Err(ChildError::FailedToBecomeReady(READINESS_TIMEOUT));
                }
                match tokio::time::timeout(
                    Duration::from_secs(1),
                    tokio::net::TcpStream::connect(addr),
                )
                .await
                {
                    Ok(Ok(_)) => {
                        debug!(%addr, "port is accepting connections");
                        break;
                    }
                    _ => tokio::time::sleep(Duration::from_millis(500)).await,
                }
            }
        }
        Ok(())
    }

    /// Whether the child has exited; reaps it if so.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Asks neard to reload its dynamic configuration.
    pub fn reload_config(&self) -> std::io::Result<()> {
        signal_reload(self.pid)
    }

    /// Graceful stop: SIGTERM, wait up to `grace`, then SIGKILL. Always
    /// reaps the child and returns its exit status where one exists.
    pub async fn stop(mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        info!(pid = self.pid, role = %self.role, "stopping neard");
        let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(pid = self.pid, ?grace, "neard ignored SIGTERM, killing");
                self.child.start_kill()?;
                self.child.wait().await
            }
        }
    }

    /// Immediate SIGKILL and reap.
    pub async fn kill(mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        self.child.start_kill()?;
        self.child.wait().await
    }
}

/// Sends SIGHUP to a pid. Lives here rather than on [`NeardProcess`]
/// because the maintenance scheduler only knows the published pid.
pub fn signal_reload(pid: u32) -> std::io::Result<()> {
    kill(Pid::from_raw(pid as i32), Signal::SIGHUP)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

/// Reads the RPC address out of `config.json` without modifying it. The
/// daemon wires the scraper and the maintenance scheduler with this
/// before the first spawn.
pub fn rpc_addr(home: &Path) -> Result<SocketAddr, ChildError> {
    let raw = std::fs::read_to_string(home.join(CONFIG_FILE))?;
    let config: serde_json::Value = serde_json::from_str(&raw).map_err(invalid_data)?;
    config
        .get("rpc")
        .and_then(|rpc| rpc.get("addr"))
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| invalid_data("config.json has no rpc.addr"))?
        .parse()
        .map_err(invalid_data)
}

/// Patches `config.json` for a spawn: the network bind address follows
/// the role, the advertised address is set when configured, and every
/// other field (in particular the RPC and metrics addresses) is kept as
/// is. Returns the RPC address found in the config.
pub fn patch_config(
    home: &Path,
    listen_addr: SocketAddr,
    public_address: Option<&str>,
) -> Result<SocketAddr, ChildError> {
    let path = home.join(CONFIG_FILE);
    let raw = std::fs::read_to_string(&path)?;
    let mut config: serde_json::Value = serde_json::from_str(&raw).map_err(invalid_data)?;

    let network = config
        .get_mut("network")
        .and_then(serde_json::Value::as_object_mut)
        .ok_or_else(|| invalid_data("config.json has no network section"))?;
    network.insert(
        "addr".to_string(),
        serde_json::Value::String(listen_addr.to_string()),
    );
    match public_address {
        Some(addr) => {
            network.insert(
                "public_addrs".to_string(),
                serde_json::json!([addr]),
            );
        }
        None => {
            network.remove("public_addrs");
        }
    }

    let rpc_addr = config
        .get("rpc")
        .and_then(|rpc| rpc.get("addr"))
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| invalid_data("config.json has no rpc.addr"))?
        .parse()
        .map_err(invalid_data)?;

    let contents = serde_json::to_vec_pretty(&config).map_err(invalid_data)?;
    crate::keys::atomic_write(&path, &contents)?;
    Ok(rpc_addr)
}

fn invalid_data<E: ToString>(e: E) -> ChildError {
    ChildError::FailedToSpawn(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        e.to_string(),
    ))
}

fn log_file_path(home: &Path) -> std::path::PathBuf {
    let date = chrono::Local::now().format("%Y-%m-%d");
    home.join(LOG_DIR).join(format!("neard-{date}.log"))
}

/// Raises (or lowers) a process's out-of-memory score. Linux only; other
/// platforms report not-supported.
pub fn set_oom_score_adj(pid: u32, score: i16) -> std::io::Result<()> {
    let path = format!("/proc/{pid}/oom_score_adj");
    if !Path::new("/proc").is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "no procfs on this platform",
        ));
    }
    std::fs::write(path, score.to_string())
}

/// Applies the supervisor's own out-of-memory score. Called once at
/// daemon startup, before any child exists.
pub fn set_own_oom_score_adj(score: i16) -> std::io::Result<()> {
    set_oom_score_adj(std::process::id(), score)
}
