//! Command-line flags for the `junction` binary.
//!
//! Splits flags that override the config file from an escape-hatch
//! subcommand for running without one at all.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "junction", about = "A routing-engine HTTP reverse proxy", version)]
pub struct Cli {
    /// Path to a TOML configuration file (listener address, poll interval,
    /// loopback cap). Route tables never live here; they come from a
    /// `DataClient`.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Overrides the configured listen address (host:port).
    #[arg(long)]
    pub listen: Option<String>,

    /// Overrides the configured route-table poll interval, in milliseconds.
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Overrides the configured loopback re-entry cap.
    #[arg(long)]
    pub loop_cap: Option<u32>,

    /// Number of OS threads pingora runs the proxy service on.
    #[arg(long)]
    pub threads: Option<usize>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serves routes built directly from the command line, bypassing the
    /// `DataClient` interface entirely. Handy for quick manual testing.
    Serve {
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        /// Route mappings in "path=target" form. A target starting with
        /// "http://" or "https://" proxies to that address; anything else is
        /// echoed back as a header on a locally shunted response.
        #[arg(short, long)]
        map: Vec<String>,
    },
}
