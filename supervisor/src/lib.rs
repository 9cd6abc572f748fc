// Copyright (c) 2026 Kuutamo. MIT License.
// See LICENSE for details.

//! # kneard-supervisor — Failover Supervision for neard
//!
//! Library behind the `kneard` daemon: a high-availability sidecar that
//! keeps exactly one host in a standby group running neard with the
//! validator key while everyone else runs a plain, non-signing peer.
//! Mutual exclusion is delegated to a Consul-compatible session and lock
//! API; the supervisor's job is to react fast and to never be the reason
//! two validators sign at once.
//!
//! ## Architecture
//!
//! The modules mirror the moving parts of the system:
//!
//! - **settings** — Configuration and every tunable constant.
//! - **error** — One typed error family per subsystem.
//! - **consul** — Sessions, the lock key, and retry policy.
//! - **keys** — Staging the right key files into neard's home.
//! - **process** — Spawning, probing, signalling, and stopping neard.
//! - **health** — Scraping neard's metrics into typed readings.
//! - **leader** — The six-state machine that owns all of the above.
//! - **maintenance** — Restarts and shutdowns at safe block heights.
//! - **control** — The local socket operators talk to.
//! - **exporter** — The supervisor's own metrics and the child's pid.
//!
//! ## Design rules
//!
//! 1. The leader task is the only writer of supervisor state, the lock,
//!    and the child. Everyone else reads snapshots.
//! 2. When in doubt about the session, demote first and re-compete
//!    later. The service's lock delay makes that safe.
//! 3. Key files are written atomically or not at all.
//! 4. Errors carry types; only the leader turns them into transitions.

pub mod consul;
pub mod control;
pub mod error;
pub mod exporter;
pub mod health;
pub mod keys;
pub mod leader;
pub mod maintenance;
pub mod process;
pub mod settings;
