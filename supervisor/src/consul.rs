//! # Coordination Client
//!
//! Minimal client for the Consul-compatible session and key-value HTTP
//! API. The supervisor only needs five verbs: create a session, renew it,
//! atomically acquire a well-known lock key, release it, and read the
//! current holder. Safety of the whole system rests on the service's
//! session semantics: a key acquired with `?acquire=<session>` belongs to
//! that session until it is released or the session dies, and after a
//! loss the key is quarantined for the configured lock delay.
//!
//! Callers drive retries through [`with_retry`], which backs off with
//! jitter and aborts when the shutdown channel fires.

use std::time::Duration;

use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use crate::error::CoordinationError;
use crate::settings::HTTP_TIMEOUT;

/// Opaque handle of a live coordination session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The JSON value stored under the lock key, visible to every observer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockPayload {
    pub node_id: String,
}

/// Result of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The key now belongs to our session.
    Acquired,
    /// Another session holds the key (or the lock delay is in force).
    AlreadyHeld,
}

/// What `read` observed under the lock key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    /// The stored payload, if it decoded as one.
    pub payload: Option<LockPayload>,
    /// The owning session. `None` means the key exists but the lock is
    /// free (released or expired).
    pub session: Option<String>,
}

#[derive(Serialize)]
struct SessionRequest {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "LockDelay")]
    lock_delay: String,
    #[serde(rename = "Behavior")]
    behavior: &'static str,
}

#[derive(Deserialize)]
struct SessionResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct KvEntry {
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "Session")]
    session: Option<String>,
}

/// Client for the coordination service. Cheap to clone; the underlying
/// HTTP connection pool is shared.
#[derive(Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ConsulClient {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, CoordinationError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| CoordinationError::Permanent(format!("building http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn put(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.put(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => req.header("X-Consul-Token", token),
            None => req,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.get(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => req.header("X-Consul-Token", token),
            None => req,
        }
    }

    /// Creates a session with the given TTL and lock delay. The session
    /// must be renewed at a fraction of the TTL to stay alive.
    pub async fn create_session(
        &self,
        name: &str,
        ttl: Duration,
        lock_delay: Duration,
    ) -> Result<SessionId, CoordinationError> {
        let body = SessionRequest {
            name: name.to_string(),
            ttl: format!("{}s", ttl.as_secs()),
            lock_delay: format!("{}s", lock_delay.as_secs()),
            behavior: "release",
        };
        let resp = self
            .put("/v1/session/create")
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest)?;
        let resp = classify_status(resp)?;
        let session: SessionResponse = resp
            .json()
            .await
            .map_err(|e| CoordinationError::Permanent(format!("decoding session response: {e}")))?;
        Ok(SessionId(session.id))
    }

    /// Renews a session. A 404 means the service already expired it; the
    /// caller must create a fresh session (and re-compete for the lock).
    pub async fn renew(&self, session: &SessionId) -> Result<(), CoordinationError> {
        let resp = self
            .put(&format!("/v1/session/renew/{session}"))
            .send()
            .await
            .map_err(classify_reqwest)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoordinationError::Permanent(format!(
                "session {session} no longer exists"
            )));
        }
        classify_status(resp)?;
        Ok(())
    }

    /// Destroys a session. Used on terminal shutdown; releasing the lock
    /// is implied by the session's release behavior.
    pub async fn destroy_session(&self, session: &SessionId) -> Result<(), CoordinationError> {
        let resp = self
            .put(&format!("/v1/session/destroy/{session}"))
            .send()
            .await
            .map_err(classify_reqwest)?;
        classify_status(resp)?;
        Ok(())
    }

    /// Atomic compare-and-set of the lock key. The service answers with a
    /// literal `true` or `false` body.
    pub async fn acquire(
        &self,
        key: &str,
        session: &SessionId,
        payload: &LockPayload,
    ) -> Result<AcquireOutcome, CoordinationError> {
        let resp = self
            .put(&format!("/v1/kv/{key}?acquire={session}"))
            .json(payload)
            .send()
            .await
            .map_err(classify_reqwest)?;
        let resp = classify_status(resp)?;
        let body = resp
            .text()
            .await
            .map_err(|e| CoordinationError::Transient(format!("reading acquire response: {e}")))?;
        match body.trim() {
            "true" => Ok(AcquireOutcome::Acquired),
            "false" => Ok(AcquireOutcome::AlreadyHeld),
            other => Err(CoordinationError::Permanent(format!(
                "unexpected acquire response: {other:?}"
            ))),
        }
    }

    /// Releases the lock key without touching the session.
    pub async fn release(&self, key: &str, session: &SessionId) -> Result<(), CoordinationError> {
        let resp = self
            .put(&format!("/v1/kv/{key}?release={session}"))
            .send()
            .await
            .map_err(classify_reqwest)?;
        classify_status(resp)?;
        Ok(())
    }

    /// Reads the lock key. `None` means the key does not exist at all.
    pub async fn read(&self, key: &str) -> Result<Option<LockHolder>, CoordinationError> {
        let resp = self
            .get(&format!("/v1/kv/{key}"))
            .send()
            .await
            .map_err(classify_reqwest)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = classify_status(resp)?;
        let entries: Vec<KvEntry> = resp
            .json()
            .await
            .map_err(|e| CoordinationError::Permanent(format!("decoding kv response: {e}")))?;
        let Some(entry) = entries.into_iter().next() else {
            return Ok(None);
        };
        let payload = entry
            .value
            .as_deref()
            .and_then(decode_payload);
        Ok(Some(LockHolder {
            payload,
            session: entry.session,
        }))
    }
}

/// The KV API returns values base64-encoded.
fn decode_payload(value: &str) -> Option<LockPayload> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(value).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn classify_reqwest(e: reqwest::Error) -> CoordinationError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        CoordinationError::Transient(e.to_string())
    } else {
        CoordinationError::Permanent(e.to_string())
    }
}

/// Maps HTTP status classes onto the retryability split: 5xx is worth
/// retrying, 403 (ACL denied) and other 4xx are not.
fn classify_status(resp: reqwest::Response) -> Result<reqwest::Response, CoordinationError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else if status.is_server_error() {
        Err(CoordinationError::Transient(format!("http status {status}")))
    } else {
        Err(CoordinationError::Permanent(format!("http status {status}")))
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Jittered exponential backoff. Each delay is the current base plus up
/// to 50% random jitter; the base doubles up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max,
        }
    }

    /// Returns the next delay and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        base + Duration::from_millis(jitter)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(8))
    }
}

/// Runs `f` until it succeeds, fails permanently, or the shutdown channel
/// fires. Transient failures are logged and retried with backoff.
pub async fn with_retry<T, F, Fut>(
    what: &str,
    shutdown: &mut watch::Receiver<bool>,
    mut f: F,
) -> Result<T, CoordinationError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CoordinationError>>,
{
    let mut backoff = Backoff::default();
    loop {
        if *shutdown.borrow() {
            return Err(CoordinationError::Cancelled);
        }
        match f().await {
            Ok(value) => return Ok(value),
            Err(CoordinationError::Transient(reason)) => {
                let delay = backoff.next_delay();
                warn!(%reason, operation = what, ?delay, "coordination request failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return Err(CoordinationError::Cancelled),
                }
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- 1. Payload encoding ------------------------------------------------

    #[test]
    fn lock_payload_wire_shape() {
        let payload = LockPayload {
            node_id: "kuutamod0".into(),
        };
        assert_eq!(
            serde_json::to_string(&payload).unwrap(),
            r#"{"node_id":"kuutamod0"}"#
        );
    }

    #[test]
    fn kv_values_decode_from_base64() {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(br#"{"node_id":"kuutamod1"}"#);
        let payload = decode_payload(&encoded).unwrap();
        assert_eq!(payload.node_id, "kuutamod1");
    }

    #[test]
    fn undecodable_kv_values_are_ignored() {
        assert!(decode_payload("definitely not base64!").is_none());
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"plain text");
        assert!(decode_payload(&encoded).is_none());
    }

    // -- 2. Session request shape ------------------------------------------

    #[test]
    fn session_request_uses_consul_field_names() {
        let req = SessionRequest {
            name: "kneard-node0".into(),
            ttl: "15s".into(),
            lock_delay: "10s".into(),
            behavior: "release",
        };
        let value: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["TTL"], "15s");
        assert_eq!(value["LockDelay"], "10s");
        assert_eq!(value["Behavior"], "release");
        assert_eq!(value["Name"], "kneard-node0");
    }

    // -- 3. Backoff ---------------------------------------------------------

    #[test]
    fn backoff_grows_and_saturates() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(151));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200));
        // Saturated at max from here on.
        for _ in 0..5 {
            let d = backoff.next_delay();
            assert!(d >= Duration::from_millis(400) && d <= Duration::from_millis(600));
        }
    }

    // -- 4. Retry driver ----------------------------------------------------

    #[tokio::test]
    async fn with_retry_returns_permanent_errors_immediately() {
        let (_tx, mut rx) = watch::channel(false);
        let mut calls = 0;
        let result: Result<(), _> = with_retry("test", &mut rx, || {
            calls += 1;
            async { Err(CoordinationError::Permanent("denied".into())) }
        })
        .await;
        assert!(matches!(result, Err(CoordinationError::Permanent(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn with_retry_stops_on_shutdown() {
        let (tx, mut rx) = watch::channel(true);
        let result: Result<(), _> = with_retry("test", &mut rx, || async {
            Err(CoordinationError::Transient("unreachable".into()))
        })
        .await;
        assert!(matches!(result, Err(CoordinationError::Cancelled)));
        drop(tx);
    }

    #[tokio::test]
    async fn with_retry_retries_transient_failures() {
        let (_tx, mut rx) = watch::channel(false);
        let mut calls = 0;
        let result = with_retry("test", &mut rx, || {
            calls += 1;
            let outcome = if calls < 3 {
                Err(CoordinationError::Transient("not yet".into()))
            } else {
                Ok(42u32)
            };
            async move { outcome }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }
}
