//! CLI surface: the daemon's own entrypoint plus a small amount of ambient
//! tooling for exercising the client core end to end.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon itself. Expects fds 0/1/2 already set up by whoever
    /// exec'd us (the client core's bootstrap path, or a test harness).
    Serve {
        /// Unix socket path this daemon is bound to (used for the unlink on
        /// exit and to find `multipty.toml`, not to bind a fresh socket).
        socket_path: PathBuf,
        /// Bind and accept at `socket_path` itself instead of inheriting
        /// fds 0/1 from a bootstrap shim. Only meant for tests and manual
        /// runs outside the client core's normal launch path.
        #[arg(long)]
        standalone: bool,
    },
    /// Attach-or-launch a daemon at `socket_path` and run one command under
    /// it, printing what happened. Not part of the wire protocol; exists so
    /// the client core can be exercised without a full interactive frontend.
    LaunchDemo {
        socket_path: PathBuf,
        /// Program to run inside the daemon-owned PTY.
        #[arg(default_value = "/bin/sh")]
        path: PathBuf,
        #[arg(trailing_var_arg = true)]
        argv: Vec<String>,
    },
}
