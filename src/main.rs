use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use multipty::args::{Args, Commands};
use multipty::client::{AttachOutcome, Client, ClientDelegate, LaunchResult};
use multipty::config::Config;
use multipty::message::{LaunchSpec, PROTOCOL_VERSION_1};
use multipty::{logging, server};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match args.command {
        Commands::Serve {
            socket_path,
            standalone,
        } => match run_serve(socket_path, standalone).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "daemon exited with error");
                ExitCode::FAILURE
            }
        },
        Commands::LaunchDemo {
            socket_path,
            path,
            argv,
        } => match run_launch_demo(socket_path, path, argv).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("launch-demo failed: {e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Daemon entrypoint: fds 0/1/2 are already set up by whoever exec'd us,
/// `socket_path` is `argv[1]`.
async fn run_serve(socket_path: PathBuf, standalone: bool) -> Result<()> {
    let config = Config::load_near(&socket_path)?;
    logging::init(&config.log_level);
    info!(path = %socket_path.display(), standalone, "starting daemon");
    if standalone {
        server::run_standalone(socket_path, config).await
    } else {
        server::run(socket_path, config).await
    }
}

/// Attach-or-launch a daemon, launch one program under it, wait for it to
/// exit, print the status. Not part of the wire protocol.
async fn run_launch_demo(socket_path: PathBuf, path: PathBuf, argv: Vec<String>) -> Result<()> {
    logging::init("info");
    let delegate = Arc::new(DemoDelegate);
    let client = match Client::attach_or_launch(&socket_path, PROTOCOL_VERSION_1, delegate).await {
        AttachOutcome::Success(client) => client,
        AttachOutcome::ConnectFailed(e) => anyhow::bail!("connect failed (retriable): {e}"),
        AttachOutcome::FatalError(e) => anyhow::bail!("fatal attach error: {e}"),
    };

    let path_str = path.to_string_lossy().to_string();
    let argv = if argv.is_empty() {
        vec![path_str.clone()]
    } else {
        argv
    };
    let spec = LaunchSpec {
        path: path_str,
        argv,
        envp: std::env::vars().map(|(k, v)| format!("{k}={v}")).collect(),
        width: 80,
        height: 24,
        is_utf8: true,
        pwd: std::env::current_dir()?.to_string_lossy().to_string(),
        unique_id: std::process::id() as i64,
    };

    match client.launch(spec).await? {
        LaunchResult::Spawned { pid, master_fd } => {
            println!("launched pid {pid} (master fd {master_fd})");
            loop {
                match client.wait(pid).await {
                    Ok(outcome) => {
                        println!("pid {} exited with raw status {}", outcome.pid, outcome.status);
                        break;
                    }
                    Err(multipty::error::ClientError::CanNotWait) => {
                        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                        continue;
                    }
                    Err(e) => anyhow::bail!("wait failed: {e}"),
                }
            }
        }
        LaunchResult::Failed => anyhow::bail!("daemon failed to launch {path:?}"),
    }
    Ok(())
}

struct DemoDelegate;

impl ClientDelegate for DemoDelegate {
    fn child_discovered(
        &self,
        pid: i32,
        spec: &multipty::message::LaunchSpec,
        terminated: bool,
        master_fd: std::os::fd::RawFd,
    ) {
        println!("discovered pid {pid} ({}), terminated={terminated}", spec.path);
        // This demo doesn't forward terminal I/O for reattached children.
        unsafe { libc::close(master_fd) };
    }

    fn child_terminated(&self, pid: i32) {
        println!("pid {pid} terminated");
    }
}
