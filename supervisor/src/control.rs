//! # Local Control Channel
//!
//! A Unix stream socket over which operators drive the supervisor:
//! querying the active validator, scheduling restarts and shutdowns,
//! and cancelling them. Framing is newline-delimited JSON, one request
//! per line, one response per line; a failed request leaves the
//! connection usable for the next one.
//!
//! Authentication is filesystem permissions: the socket's containing
//! directory is created with mode 0700.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ControlError, MaintenanceError};
use crate::exporter::SharedSnapshot;
use crate::maintenance::{MaintenanceKind, MaintenanceScheduler, TargetSpec};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Parameters shared by the restart and shutdown commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceParams {
    /// Operator-chosen target height, trusted verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_at: Option<u64>,
    /// Maintenance window size; the supervisor picks the height.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<u64>,
    /// Cancel the outstanding operation instead of scheduling one.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancel: bool,
    /// Hold the connection until the operation has completed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub block: bool,
}

/// A control request, tagged by its `command` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum ControlRequest {
    /// Who currently holds the validator lock.
    ActiveValidator {
        #[serde(default)]
        json: bool,
    },
    /// The outstanding maintenance operation, if any.
    MaintenanceStatus,
    /// Schedule or cancel a restart at a maintenance height.
    Restart(MaintenanceParams),
    /// Schedule or cancel a shutdown at a maintenance height.
    Shutdown(MaintenanceParams),
}

/// Successful `active-validator` response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveValidator {
    #[serde(rename = "Node")]
    pub node: String,
    #[serde(rename = "State")]
    pub state: String,
}

/// Successful `maintenance-status` response body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceStatus {
    pub kind: MaintenanceKind,
    pub target_height: u64,
}

/// Error response body; `error` is a stable tag from the error taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    fn from_maintenance(e: &MaintenanceError) -> Self {
        Self {
            error: e.tag().to_string(),
            message: e.to_string(),
        }
    }

    fn from_control(e: &ControlError) -> Self {
        Self {
            error: e.tag().to_string(),
            message: e.to_string(),
        }
    }

    fn into_value(self) -> serde_json::Value {
        serde_json::to_value(self).expect("error body serializes")
    }
}

const KNOWN_COMMANDS: [&str; 4] = [
    "active-validator",
    "maintenance-status",
    "restart",
    "shutdown",
];

/// Parses one request line. Distinguishes an unknown `command` value from
/// a request that is malformed for a known command.
pub fn parse_request(line: &str) -> Result<ControlRequest, ControlError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| ControlError::Parse(e.to_string()))?;
    let command = value
        .get("command")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ControlError::Parse("missing command field".into()))?;
    if !KNOWN_COMMANDS.contains(&command) {
        return Err(ControlError::UnknownCommand(command.to_string()));
    }
    serde_json::from_value(value).map_err(|e| ControlError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Everything the request handlers need.
#[derive(Clone)]
pub struct ControlContext {
    pub snapshot: SharedSnapshot,
    pub scheduler: Arc<MaintenanceScheduler>,
}

/// Binds the control socket, replacing any stale file from a previous
/// run. The containing directory is created with owner-only permissions.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::DirBuilder::new().recursive(true).create(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
            }
        }
    }
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

/// Accepts control connections until the shutdown channel fires. Each
/// connection gets its own task so a blocking maintenance call does not
/// starve other clients.
pub async fn serve(
    listener: UnixListener,
    ctx: ControlContext,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("control channel listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(handle_connection(stream, ctx));
                    }
                    Err(e) => warn!(error = %e, "control accept failed"),
                }
            }
            changed = shutdown.changed() => {
                // A dropped sender counts as shutdown too.
                if changed.is_err() || *shutdown.borrow() {
                    debug!("control channel shutting down");
                    return;
                }
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, ctx: ControlContext) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_request(&line, &ctx).await;
        let mut encoded = response.to_string();
        encoded.push('\n');
        if writer.write_all(encoded.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Dispatches one request line to a response value.
pub async fn handle_request(line: &str, ctx: &ControlContext) -> serde_json::Value {
    let request = match parse_request(line) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "rejected control request");
            return ErrorBody::from_control(&e).into_value();
        }
    };
    match request {
        ControlRequest::ActiveValidator { json: _ } => {
            let snapshot = ctx.snapshot.read().clone();
            match snapshot.active_validator {
                Some(node) => serde_json::to_value(ActiveValidator {
                    node,
                    state: snapshot.state.to_string(),
                })
                .expect("response serializes"),
                None => serde_json::Value::Null,
            }
        }
        ControlRequest::MaintenanceStatus => match ctx.scheduler.status() {
            Some((kind, target_height)) => serde_json::to_value(MaintenanceStatus {
                kind,
                target_height,
            })
            .expect("response serializes"),
            None => serde_json::Value::Null,
        },
        ControlRequest::Restart(params) => {
            maintenance_call(ctx, MaintenanceKind::Restart, params).await
        }
        ControlRequest::Shutdown(params) => {
            maintenance_call(ctx, MaintenanceKind::Shutdown, params).await
        }
    }
}

async fn maintenance_call(
    ctx: &ControlContext,
    kind: MaintenanceKind,
    params: MaintenanceParams,
) -> serde_json::Value {
    if params.cancel {
        return match ctx.scheduler.cancel().await {
            Ok(()) => json!({ "target_height": 0 }),
            Err(e) => ErrorBody::from_maintenance(&e).into_value(),
        };
    }
    let spec = match (params.schedule_at, params.wait) {
        (Some(height), None) => TargetSpec::At(height),
        (None, Some(window)) => TargetSpec::Window(window),
        (None, None) => {
            return ErrorBody::from_control(&ControlError::Parse(
                "one of schedule_at, wait or cancel is required".into(),
            ))
            .into_value()
        }
        (Some(_), Some(_)) => {
            return ErrorBody::from_control(&ControlError::Parse(
                "schedule_at and wait are mutually exclusive".into(),
            ))
            .into_value()
        }
    };
    match ctx.scheduler.schedule(kind, spec, params.block).await {
        Ok(target_height) => json!({ "target_height": target_height }),
        Err(e) => ErrorBody::from_maintenance(&e).into_value(),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Client side of the control channel, used by the operator CLI.
pub struct ControlClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Sends one request and reads one response line.
    pub async fn call(
        &mut self,
        request: &ControlRequest,
    ) -> std::io::Result<serde_json::Value> {
        let mut line = serde_json::to_string(request).expect("request serializes");
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        let mut response = String::new();
        let n = self.reader.read_line(&mut response).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "control connection closed",
            ));
        }
        serde_json::from_str(&response).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })
    }
}

/// Default control socket path, shared between daemon and CLI defaults.
pub fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/lib/neard/kneard.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- 1. Request parsing -------------------------------------------------

    #[test]
    fn active_validator_request_round_trips() {
        let parsed = parse_request(r#"{"command":"active-validator","json":true}"#).unwrap();
        assert_eq!(parsed, ControlRequest::ActiveValidator { json: true });

        // The json flag defaults to off.
        let parsed = parse_request(r#"{"command":"active-validator"}"#).unwrap();
        assert_eq!(parsed, ControlRequest::ActiveValidator { json: false });
    }

    #[test]
    fn restart_request_carries_parameters() {
        let parsed =
            parse_request(r#"{"command":"restart","wait":3,"block":true}"#).unwrap();
        assert_eq!(
            parsed,
            ControlRequest::Restart(MaintenanceParams {
                schedule_at: None,
                wait: Some(3),
                cancel: false,
                block: true,
            })
        );
    }

    #[test]
    fn shutdown_cancel_round_trips() {
        let request = ControlRequest::Shutdown(MaintenanceParams {
            cancel: true,
            ..MaintenanceParams::default()
        });
        let line = serde_json::to_string(&request).unwrap();
        assert_eq!(line, r#"{"command":"shutdown","cancel":true}"#);
        assert_eq!(parse_request(&line).unwrap(), request);
    }

    #[test]
    fn unknown_commands_and_garbage_are_distinguished() {
        assert!(matches!(
            parse_request(r#"{"command":"frobnicate"}"#),
            Err(ControlError::UnknownCommand(_))
        ));
        assert!(matches!(
            parse_request("not json at all"),
            Err(ControlError::Parse(_))
        ));
        assert!(matches!(
            parse_request(r#"{"no_command": 1}"#),
            Err(ControlError::Parse(_))
        ));
    }

    // -- 2. Response shapes -------------------------------------------------

    #[test]
    fn active_validator_uses_capitalized_keys() {
        let body = ActiveValidator {
            node: "kuutamod0".into(),
            state: "Validating".into(),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["Node"], "kuutamod0");
        assert_eq!(value["State"], "Validating");
    }

    #[test]
    fn maintenance_status_wire_shape() {
        let value = serde_json::to_value(MaintenanceStatus {
            kind: MaintenanceKind::Shutdown,
            target_height: 1000,
        })
        .unwrap();
        assert_eq!(value["kind"], "shutdown");
        assert_eq!(value["target_height"], 1000);
    }
}
