//! CLI argument definitions for posixd.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// posixd -- epoll and timerfd readiness core.
#[derive(Parser)]
#[command(
    name = "posixd",
    version,
    about = "posixd -- epoll and timerfd readiness core",
    long_about = "Drives the posixd readiness core from the command line: arms timerfds, \
                  waits on them through epoll, and reports the effective configuration."
)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, short, global = true, default_value = "config/default.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Arm a timerfd, wait on it through epoll and log each expiration.
    Timer {
        /// Initial expiration in milliseconds (defaults to `[demo]`).
        #[arg(long)]
        initial_ms: Option<u64>,

        /// Period in milliseconds; 0 for a one-shot timer.
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Number of epoll_wait + read rounds before exiting.
        #[arg(long)]
        reads: Option<u32>,
    },

    /// Show the effective configuration.
    Status,
}
