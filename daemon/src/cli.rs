//! # CLI Interface
//!
//! Defines the command-line argument structure for the `kneard` daemon
//! using `clap` derive. Every flag is also readable from the matching
//! `KUUTAMO_*` environment variable, which is how production deployments
//! configure the supervisor; flags exist mostly for local testing.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use kneard_supervisor::error::ConfigError;
use kneard_supervisor::settings::{read_token_file, Settings};

/// High-availability supervisor for a neard validator.
///
/// Runs neard as a voting peer, competes for the validator lock in the
/// coordination service, and promotes the local neard to a signing
/// validator when the lock is won. Exposes a metrics exporter and a
/// local control socket for planned restarts and shutdowns.
#[derive(Parser, Debug)]
#[command(name = "kneard", about = "neard failover supervisor", version)]
pub struct KneardArgs {
    /// Base URL of the coordination service's HTTP API.
    #[arg(long, env = "KUUTAMO_CONSUL_URL", default_value = "http://localhost:8500")]
    pub consul_url: String,

    /// File containing the coordination ACL token. A trailing newline is
    /// stripped. Takes precedence over --consul-token.
    #[arg(long, env = "KUUTAMO_CONSUL_TOKEN_FILE")]
    pub consul_token_file: Option<PathBuf>,

    /// Coordination ACL token passed directly.
    ///
    /// Prefer --consul-token-file in production so the token never shows
    /// up in process listings.
    #[arg(long, env = "KUUTAMO_CONSUL_TOKEN")]
    pub consul_token: Option<String>,

    /// Stable identifier of this supervisor, published in the lock.
    #[arg(long, env = "KUUTAMO_NODE_ID", default_value = "node")]
    pub node_id: String,

    /// host:port the supervisor's own metrics exporter binds.
    #[arg(long, env = "KUUTAMO_EXPORTER_ADDRESS", default_value = "127.0.0.1:2233")]
    pub exporter_address: SocketAddr,

    /// host:port neard binds while validating.
    #[arg(
        long,
        env = "KUUTAMO_VALIDATOR_NETWORK_ADDR",
        default_value = "0.0.0.0:24567"
    )]
    pub validator_network_addr: SocketAddr,

    /// host:port neard binds while voting.
    #[arg(
        long,
        env = "KUUTAMO_VOTER_NETWORK_ADDR",
        default_value = "0.0.0.0:24568"
    )]
    pub voter_network_addr: SocketAddr,

    /// Path to the shared consensus signing key.
    #[arg(long, env = "KUUTAMO_VALIDATOR_KEY")]
    pub validator_key: PathBuf,

    /// Path to the shared network identity used while validating.
    #[arg(long, env = "KUUTAMO_VALIDATOR_NODE_KEY")]
    pub validator_node_key: PathBuf,

    /// Path to this host's private network identity used while voting.
    #[arg(long, env = "KUUTAMO_VOTER_NODE_KEY")]
    pub voter_node_key: PathBuf,

    /// neard's working directory. The supervisor stages keys and patches
    /// configuration files in here.
    #[arg(long, env = "KUUTAMO_NEARD_HOME")]
    pub neard_home: PathBuf,

    /// Comma-separated bootstrap peers passed to neard.
    #[arg(long, env = "KUUTAMO_NEARD_BOOTNODES")]
    pub neard_bootnodes: Option<String>,

    /// Path of the local control socket. Defaults to kneard.sock inside
    /// the neard home.
    #[arg(long, env = "KUUTAMO_CONTROL_SOCKET")]
    pub control_socket: Option<PathBuf>,

    /// Address advertised to peers instead of the bind address.
    #[arg(long, env = "KUUTAMO_PUBLIC_ADDRESS")]
    pub public_address: Option<String>,

    /// The neard executable to supervise.
    #[arg(long, env = "KUUTAMO_NEARD_BINARY", default_value = "neard")]
    pub neard_binary: PathBuf,

    /// Log output format: pretty or json.
    #[arg(long, env = "KUUTAMO_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

impl KneardArgs {
    /// Resolves the parsed arguments into the settings the library
    /// consumes. Reads the token file here so the rest of the program
    /// never touches the filesystem for configuration.
    pub fn into_settings(self) -> Result<Settings, ConfigError> {
        let consul_token = match &self.consul_token_file {
            Some(path) => Some(read_token_file(path)?),
            None => self.consul_token.clone(),
        };
        let control_socket = self
            .control_socket
            .clone()
            .unwrap_or_else(|| self.neard_home.join("kneard.sock"));
        Ok(Settings {
            node_id: self.node_id,
            consul_url: self.consul_url,
            consul_token,
            exporter_address: self.exporter_address,
            validator_network_addr: self.validator_network_addr,
            voter_network_addr: self.voter_network_addr,
            validator_key: self.validator_key,
            validator_node_key: self.validator_node_key,
            voter_node_key: self.voter_node_key,
            neard_home: self.neard_home,
            neard_bootnodes: self.neard_bootnodes,
            control_socket,
            public_address: self.public_address,
            neard_binary: self.neard_binary,
        })
    }
}
