//! # kneardctl — Operator CLI for kneard
//!
//! Talks to a running kneard supervisor over its local control socket.
//! Commands map one-to-one onto the control protocol; this binary only
//! parses arguments, frames requests, and renders responses.
//!
//! Exit codes: 0 success, 1 usage error, 2 remote or transport error,
//! 3 precondition failed (nothing to cancel).

use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{Args, Parser, Subcommand};

use kneard_supervisor::control::{
    default_socket_path, ControlClient, ControlRequest, MaintenanceParams,
};

/// Control a running kneard supervisor.
#[derive(Parser, Debug)]
#[command(name = "kneardctl", about = "Control a running kneard supervisor", version)]
struct KneardctlCli {
    /// Path of the kneard control socket.
    #[arg(long, env = "KUUTAMO_CONTROL_SOCKET")]
    control_socket: Option<PathBuf>,

    /// Print raw JSON responses instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show which node currently holds the validator lock.
    ActiveValidator,
    /// Show the outstanding maintenance operation, if any.
    MaintenanceStatus,
    /// Restart neard at a block height outside its production slots.
    Restart(MaintenanceArgs),
    /// Shut down neard (and the supervisor) at a safe block height.
    Shutdown(MaintenanceArgs),
    /// Shorthand for active-validator with human output.
    ShowValidator,
}

#[derive(Args, Debug)]
struct MaintenanceArgs {
    /// Exact target block height, trusted verbatim.
    #[arg(long, conflicts_with_all = ["wait", "cancel"])]
    schedule_at: Option<u64>,

    /// Size of the maintenance window in blocks; the supervisor picks
    /// the nearest production-free height.
    #[arg(long, conflicts_with = "cancel")]
    wait: Option<u64>,

    /// Cancel the outstanding operation instead of scheduling one.
    #[arg(long)]
    cancel: bool,

    /// Hold the connection until the operation has completed.
    #[arg(long)]
    block: bool,
}

impl MaintenanceArgs {
    fn to_params(&self) -> MaintenanceParams {
        MaintenanceParams {
            schedule_at: self.schedule_at,
            // Nothing specified means the smallest possible window.
            wait: match (self.schedule_at, self.wait, self.cancel) {
                (None, None, false) => Some(1),
                _ => self.wait,
            },
            cancel: self.cancel,
            block: self.block,
        }
    }
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = match KneardctlCli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return 0;
        }
        Err(e) => {
            let _ = e.print();
            return 1;
        }
    };

    let socket = cli
        .control_socket
        .clone()
        .unwrap_or_else(default_socket_path);
    let mut client = match ControlClient::connect(&socket).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("cannot reach kneard at {}: {e}", socket.display());
            return 2;
        }
    };

    let request = match &cli.command {
        Command::ActiveValidator | Command::ShowValidator => ControlRequest::ActiveValidator {
            json: cli.json,
        },
        Command::MaintenanceStatus => ControlRequest::MaintenanceStatus,
        Command::Restart(args) => ControlRequest::Restart(args.to_params()),
        Command::Shutdown(args) => ControlRequest::Shutdown(args.to_params()),
    };

    let response = match client.call(&request).await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("control request failed: {e}");
            return 2;
        }
    };

    if let Some(error) = response.get("error").and_then(serde_json::Value::as_str) {
        let message = response
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(error);
        eprintln!("{message}");
        return if error == "cancel_nothing" { 3 } else { 2 };
    }

    if cli.json {
        println!("{response}");
        return 0;
    }

    render(&cli.command, &response);
    0
}

fn render(command: &Command, response: &serde_json::Value) {
    match command {
        Command::ActiveValidator | Command::ShowValidator => {
            if response.is_null() {
                println!("None");
                return;
            }
            let node = response["Node"].as_str().unwrap_or("?");
            let state = response["State"].as_str().unwrap_or("?");
            println!("Validator: {node} ({state})");
        }
        Command::MaintenanceStatus => {
            if response.is_null() {
                println!("no maintenance setting now");
                return;
            }
            let kind = response["kind"].as_str().unwrap_or("?");
            let height = response["target_height"].as_u64().unwrap_or(0);
            println!("{kind} scheduled at block {height}");
        }
        Command::Restart(args) | Command::Shutdown(args) => {
            if args.cancel {
                println!("maintenance cancelled");
                return;
            }
            let height = response["target_height"].as_u64().unwrap_or(0);
            println!("scheduled at block {height}");
        }
    }
}
