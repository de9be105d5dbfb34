//! Server core, RPC handlers, and main loop.
//!
//! Startup inherits fd 0 = listening socket, fd 1 = first accepted
//! connection, fd 2 = a death-detection pipe (kept open, not polled: the
//! inner select loop watches exactly the self-pipe, the connection, and the
//! listener). The socket path is unlinked on exit.

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::child::ChildTable;
use crate::config::Config;
use crate::message::{
    ClientMessage, LaunchSpec, ServerMessage, PROTOCOL_VERSION_1, PROTOCOL_VERSION_REJECTED,
};
use crate::pty::{self, LaunchOutcome};
use crate::signals::ChildSignal;
use crate::sock::{SeqpacketConn, SeqpacketListener};

/// Owned server state, built once in `main` and threaded through every
/// handler. The `SIGCHLD` handler itself never touches this; it only
/// writes to the self-pipe.
pub struct ServerContext {
    children: ChildTable,
    socket_path: PathBuf,
    max_reported_children: i32,
}

impl ServerContext {
    pub fn new(socket_path: PathBuf, config: &Config) -> Self {
        Self {
            children: ChildTable::new(),
            socket_path,
            max_reported_children: config.max_reported_children,
        }
    }
}

impl Drop for ServerContext {
    fn drop(&mut self) {
        debug!(path = %self.socket_path.display(), "unlinking socket");
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Fds 0/1/2 are already set up by whoever exec'd us (the client core's
/// launch path, or a test harness). `argv[1]` is the socket path, asserted
/// by the caller before this is invoked.
pub async fn run(socket_path: PathBuf, config: Config) -> Result<()> {
    run_on_fds(socket_path, config, 0, 1).await
}

/// Bind and listen at `socket_path` itself instead of inheriting fds 0/1.
/// Production daemons are started by the client core's bootstrap, which
/// never needs this; this entry point exists for callers (tests, chiefly)
/// that want a daemon process with no prearranged fd table to talk to.
pub async fn run_standalone(socket_path: PathBuf, config: Config) -> Result<()> {
    let signal = ChildSignal::install().context("failed to install SIGCHLD self-pipe")?;
    let listener =
        SeqpacketListener::bind(&socket_path).context("failed to bind listener socket")?;
    let mut ctx = ServerContext::new(socket_path, &config);

    info!("entering main loop");
    let mut conn = listener.accept().await.context("failed to accept initial connection")?;
    loop {
        select_loop(&mut ctx, &signal, &listener, &conn).await;
        debug!("connection lost, calling accept");
        match listener.accept().await {
            Ok(next) => conn = next,
            Err(e) => {
                warn!(error = %e, "accept failed, shutting down");
                return Ok(());
            }
        }
    }
}

pub async fn run_on_fds(
    socket_path: PathBuf,
    config: Config,
    listener_fd: RawFd,
    initial_connection_fd: RawFd,
) -> Result<()> {
    let signal = ChildSignal::install().context("failed to install SIGCHLD self-pipe")?;
    let listener =
        SeqpacketListener::from_inherited(listener_fd).context("failed to wrap listener fd")?;
    let mut ctx = ServerContext::new(socket_path, &config);

    info!("entering main loop");
    let mut conn = SeqpacketConn::from_inherited(initial_connection_fd)
        .context("failed to wrap initial connection fd")?;
    loop {
        select_loop(&mut ctx, &signal, &listener, &conn).await;
        debug!("connection lost, calling accept");
        match listener.accept().await {
            Ok(next) => conn = next,
            Err(e) => {
                warn!(error = %e, "accept failed, shutting down");
                return Ok(());
            }
        }
    }
}

/// Serve `conn` until it disconnects or a hard I/O failure occurs, then
/// return so the outer loop can accept a fresh client.
async fn select_loop(
    ctx: &mut ServerContext,
    signal: &ChildSignal,
    listener: &SeqpacketListener,
    conn: &SeqpacketConn,
) {
    loop {
        tokio::select! {
            res = signal.wait() => {
                if res.is_err() || reap_and_report(ctx, conn).await.is_err() {
                    break;
                }
            }
            res = conn.recv_frame() => {
                match res {
                    Ok(Some((bytes, fd))) => {
                        if handle_request(ctx, conn, &bytes, fd).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("client disconnected");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "recv failed");
                        break;
                    }
                }
            }
            res = listener.accept() => {
                match res {
                    Ok(other) => reject_busy(&other).await,
                    Err(e) => warn!(error = %e, "stray accept failed"),
                }
            }
        }
    }
}

/// A second client attempted to attach while we are already serving one:
/// accept it just long enough to say no.
async fn reject_busy(conn: &SeqpacketConn) {
    debug!("received connection while already connected");
    let msg = ServerMessage::Handshake {
        protocol_version: PROTOCOL_VERSION_REJECTED,
        num_children: 0,
    };
    if let Ok(bytes) = msg.encode() {
        let _ = conn.send_frame(&bytes, None).await;
    }
}

/// SIGCHLD woke us: `waitpid(WNOHANG)` every non-terminated child, and emit
/// a `Termination` for any that collected. Never removes the record; that
/// is deferred to an explicit `Wait` so the client learns the exit status
/// first.
async fn reap_and_report(ctx: &mut ServerContext, conn: &SeqpacketConn) -> Result<()> {
    for pid in ctx.children.pids_awaiting_reap() {
        match waitpid_nohang_retrying(pid)? {
            Some(status) => {
                ctx.children.mark_terminated(pid, status);
                let msg = ServerMessage::Termination { pid: pid.as_raw() };
                conn.send_frame(&msg.encode()?, None).await?;
            }
            None => continue,
        }
    }
    Ok(())
}

fn waitpid_nohang_retrying(pid: Pid) -> Result<Option<i32>> {
    loop {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(pid.as_raw(), &mut status, libc::WNOHANG) };
        if ret > 0 {
            return Ok(Some(status));
        }
        if ret == 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err.into());
    }
}

async fn handle_request(
    ctx: &mut ServerContext,
    conn: &SeqpacketConn,
    bytes: &[u8],
    fd: Option<RawFd>,
) -> Result<()> {
    if let Some(fd) = fd {
        // Clients never attach ancillary data.
        let _ = unsafe { libc::close(fd) };
        bail!("client frame unexpectedly carried an fd");
    }
    let request = ClientMessage::decode(bytes).context("malformed client request")?;
    match request {
        ClientMessage::Handshake { client_max_version } => {
            handle_handshake(ctx, conn, client_max_version).await
        }
        ClientMessage::Launch(spec) => handle_launch(ctx, conn, spec).await,
        ClientMessage::Wait { pid } => handle_wait(ctx, conn, Pid::from_raw(pid)).await,
    }
}

async fn handle_handshake(
    ctx: &mut ServerContext,
    conn: &SeqpacketConn,
    client_max_version: i32,
) -> Result<()> {
    if client_max_version < PROTOCOL_VERSION_1 {
        warn!(client_max_version, "maximum protocol version too low");
        bail!("client max version {client_max_version} below minimum");
    }
    let num_children = (ctx.children.len() as i32).min(ctx.max_reported_children);
    let response = ServerMessage::Handshake {
        protocol_version: PROTOCOL_VERSION_1,
        num_children,
    };
    conn.send_frame(&response.encode()?, None).await?;
    report_children(ctx, conn).await
}

/// ReportChild messages precede any Launch/Wait response; the select loop
/// above does not dispatch further requests until this completes, because
/// `handle_request` (and thus `handle_handshake`) is awaited to completion
/// before the next `select!` iteration reads another frame.
///
/// Emits at most `ctx.max_reported_children` frames, matching the count
/// `handle_handshake` already advertised in its `Handshake` response.
async fn report_children(ctx: &ServerContext, conn: &SeqpacketConn) -> Result<()> {
    let total = (ctx.children.len() as i32).min(ctx.max_reported_children) as usize;
    for (i, child) in ctx.children.iter().take(total).enumerate() {
        let is_last = i + 1 == total;
        let msg = ServerMessage::ReportChild {
            is_last,
            pid: child.pid.as_raw(),
            spec: child.launch_spec.clone(),
            terminated: child.terminated,
        };
        conn.send_frame(&msg.encode()?, Some(child.master_fd))
            .await?;
    }
    Ok(())
}

async fn handle_launch(
    ctx: &mut ServerContext,
    conn: &SeqpacketConn,
    spec: LaunchSpec,
) -> Result<()> {
    match pty::launch(&spec) {
        LaunchOutcome::Success { pid, master_fd } => {
            info!(pid = pid.as_raw(), path = %spec.path, "launched child");
            ctx.children.insert(pid, master_fd, spec);
            let response = ServerMessage::Launch {
                status: 0,
                pid: pid.as_raw(),
            };
            conn.send_frame(&response.encode()?, Some(master_fd)).await
        }
        LaunchOutcome::Failure { errno } => {
            warn!(errno, path = %spec.path, "launch failed");
            let response = ServerMessage::Launch { status: -1, pid: 0 };
            conn.send_frame(&response.encode()?, None).await
        }
    }
}

async fn handle_wait(ctx: &mut ServerContext, conn: &SeqpacketConn, pid: Pid) -> Result<()> {
    let (status, errno) = match ctx.children.get(pid) {
        None => (0, -1),
        Some(child) if !child.terminated => (0, -2),
        Some(child) => (child.status, 0),
    };
    let response = ServerMessage::Wait {
        pid: pid.as_raw(),
        status,
        errno,
    };
    conn.send_frame(&response.encode()?, None).await?;
    if errno == 0 {
        ctx.children.remove(pid);
    }
    Ok(())
}
