//! `mtrpc-server` binary: load configuration, optionally print it, or run
//! the server to completion.
//!
//! The client proxy, CLI front-ends for calling procedures, the HTTP
//! front-end, and daemonization helpers are all out of scope (spec.md §1);
//! this binary is the one entry point the core itself ships, and it only
//! does what §6's configuration loading and signal wiring require.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use mtrpc_shared::config::ServerConfig;

#[derive(Debug, Parser)]
#[command(name = "mtrpc-server", about = "mtrpc JSON-RPC-over-AMQP server")]
struct Cli {
    /// Path to a TOML configuration file. Environment variables prefixed
    /// `MTRPC__` (double underscore between section and key) are layered on
    /// top regardless of whether this is given.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the fully resolved configuration as TOML and exit without
    /// connecting to a broker.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.print_config {
        let config = match ServerConfig::load(cli.config.as_deref()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("configuration error: {err}");
                return ExitCode::FAILURE;
            }
        };
        match toml::to_string_pretty(&config) {
            Ok(rendered) => {
                println!("{rendered}");
                return ExitCode::SUCCESS;
            }
            Err(err) => {
                eprintln!("failed to render configuration: {err}");
                return ExitCode::FAILURE;
            }
        }
    }

    match mtrpc_server::serve(cli.config.as_deref()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("server exited with an error: {err}");
            ExitCode::FAILURE
        }
    }
}
