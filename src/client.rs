//! Client core: attach-or-launch policy, FIFO per-kind continuations for the
//! request/response RPCs, and delegate callbacks for the two
//! server-initiated events (`ReportChild`, `Termination`).
//!
//! Owns the connection, spawns a background task to pump frames, and hands
//! them to a delegate trait instead of a fixed UI.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::pipe;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::message::{ClientMessage, LaunchSpec, ServerMessage, PROTOCOL_VERSION_1};
use crate::sock::{SeqpacketConn, SeqpacketListener};

/// Outcome of attaching to (or bootstrapping) a daemon: a trichotomy rather
/// than a plain `Result`, because `ConnectFailed` is transient and worth
/// retrying while `FatalError` is not.
pub enum AttachOutcome {
    Success(Client),
    /// The socket exists but nothing answered in the way attach expects;
    /// the caller may retry later.
    ConnectFailed(anyhow::Error),
    /// Protocol mismatch, a rejected handshake, or I/O lost mid-handshake.
    FatalError(anyhow::Error),
}

/// Server-initiated events a client cares about. Implemented as a trait with
/// no-op defaults, not a channel, so a caller that only wants one of the two
/// events doesn't have to match on the other.
pub trait ClientDelegate: Send + Sync + 'static {
    /// Called once per child reported during the handshake's `ReportChild`
    /// stream, and again for any child launched later in this session.
    /// `master_fd` is owned by the caller from this point forward.
    fn child_discovered(&self, pid: i32, spec: &LaunchSpec, terminated: bool, master_fd: RawFd) {
        let _ = (pid, spec, terminated, master_fd);
    }

    /// Called when the daemon reports a child's process exited. `Wait` has
    /// not been called yet; the caller decides when to reap the status.
    fn child_terminated(&self, pid: i32) {
        let _ = pid;
    }
}

/// Result of a `Launch` RPC: `Failed` carries no errno because the wire
/// protocol doesn't give the client one, only `status != 0`.
pub enum LaunchResult {
    Spawned { pid: i32, master_fd: RawFd },
    Failed,
}

/// Result of a successful `Wait` RPC; failures surface as `ClientError`.
pub struct WaitOutcome {
    pub pid: i32,
    pub status: i32,
}

type LaunchSender = oneshot::Sender<Result<LaunchResult, ClientError>>;
type WaitSender = oneshot::Sender<Result<WaitOutcome, ClientError>>;

#[derive(Default)]
struct Continuations {
    launch: Mutex<VecDeque<LaunchSender>>,
    wait: Mutex<VecDeque<WaitSender>>,
}

impl Continuations {
    fn fail_all(&self, make: impl Fn() -> ClientError) {
        for tx in self.launch.lock().unwrap().drain(..) {
            let _ = tx.send(Err(make()));
        }
        for tx in self.wait.lock().unwrap().drain(..) {
            let _ = tx.send(Err(make()));
        }
    }
}

/// A live attachment to a daemon. Cloning shares the same connection and
/// continuation queues; the background dispatch task keeps running until the
/// connection drops, at which point every outstanding continuation resolves
/// with `ConnectionLost`.
#[derive(Clone)]
pub struct Client {
    conn: Arc<SeqpacketConn>,
    continuations: Arc<Continuations>,
    /// Held only by the client that spawned the daemon itself, so the pipe's
    /// write end stays open for this process's lifetime; the daemon's read
    /// end sees EOF when this process exits, however it exits.
    _death_pipe_write: Option<Arc<OwnedFd>>,
}

impl Client {
    /// Connect to `socket_path`, launching a fresh daemon if nothing is
    /// listening yet. `client_max_version` is this build's highest
    /// understood protocol version, enforced by the handshake.
    pub async fn attach_or_launch(
        socket_path: &Path,
        client_max_version: i32,
        delegate: Arc<dyn ClientDelegate>,
    ) -> AttachOutcome {
        let (conn, death_pipe_write) = match SeqpacketConn::connect(socket_path) {
            Ok(conn) => (conn, None),
            Err(e) => {
                if !looks_like_nothing_listening(&e) {
                    return AttachOutcome::ConnectFailed(e);
                }
                match launch_daemon(socket_path) {
                    Ok((conn, death_pipe_write)) => (conn, Some(Arc::new(death_pipe_write))),
                    Err(e) => return AttachOutcome::FatalError(e),
                }
            }
        };
        Self::from_conn(conn, client_max_version, delegate, death_pipe_write).await
    }

    /// Connect to an already-running daemon at `socket_path`. Unlike
    /// [`Client::attach_or_launch`], never spawns one: a connect failure of
    /// any kind is `FatalError`. Used by callers (tests, a `list sessions`
    /// style command) that manage the daemon's lifecycle themselves.
    pub async fn connect_existing(
        socket_path: &Path,
        client_max_version: i32,
        delegate: Arc<dyn ClientDelegate>,
    ) -> AttachOutcome {
        let conn = match SeqpacketConn::connect(socket_path) {
            Ok(conn) => conn,
            Err(e) => return AttachOutcome::FatalError(e),
        };
        Self::from_conn(conn, client_max_version, delegate, None).await
    }

    async fn from_conn(
        conn: SeqpacketConn,
        client_max_version: i32,
        delegate: Arc<dyn ClientDelegate>,
        death_pipe_write: Option<Arc<OwnedFd>>,
    ) -> AttachOutcome {
        if let Err(e) = handshake(&conn, client_max_version, delegate.as_ref()).await {
            return AttachOutcome::FatalError(e);
        }

        let conn = Arc::new(conn);
        let continuations = Arc::new(Continuations::default());
        tokio::spawn(dispatch_loop(conn.clone(), continuations.clone(), delegate));

        AttachOutcome::Success(Client {
            conn,
            continuations,
            _death_pipe_write: death_pipe_write,
        })
    }

    /// Ask the daemon to fork/exec `spec` under a fresh PTY.
    pub async fn launch(&self, spec: LaunchSpec) -> Result<LaunchResult, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.continuations.launch.lock().unwrap().push_back(tx);
        if let Err(e) = self.send(ClientMessage::Launch(spec)).await {
            return Err(ClientError::ConnectionLost(e));
        }
        rx.await
            .unwrap_or_else(|_| Err(ClientError::ConnectionLost(anyhow::anyhow!("dropped"))))
    }

    /// Ask the daemon for a previously launched child's exit status.
    pub async fn wait(&self, pid: i32) -> Result<WaitOutcome, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.continuations.wait.lock().unwrap().push_back(tx);
        if let Err(e) = self.send(ClientMessage::Wait { pid }).await {
            return Err(ClientError::ConnectionLost(e));
        }
        rx.await
            .unwrap_or_else(|_| Err(ClientError::ConnectionLost(anyhow::anyhow!("dropped"))))
    }

    async fn send(&self, msg: ClientMessage) -> Result<()> {
        let (bytes, _fd) = msg.encode()?;
        self.conn.send_frame(&bytes, None).await
    }
}

/// `ENOENT` (no socket file) or `ECONNREFUSED` (stale socket file, nothing
/// listening) both mean "go bootstrap a daemon"; anything else (permission
/// denied, too many open files, ...) is a transient `ConnectFailed`.
fn looks_like_nothing_listening(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<Errno>()
            .is_some_and(|errno| matches!(errno, Errno::ENOENT | Errno::ECONNREFUSED))
    })
}

/// Fork a fresh daemon bound to `socket_path` and hand back the client's own
/// end of a socketpair already connected to it, skipping the accept-loop
/// round trip entirely for the very first connection.
///
/// The parent creates the listener socket, a SEQPACKET socketpair, and a
/// death-detection pipe; the child inherits them as fds 0/1/2 and re-execs
/// itself with `serve <socket_path>`. The pipe's write end stays with the
/// parent (this process): when this process exits for any reason, its copy
/// closes and the daemon's read end (fd 2) observes EOF.
fn launch_daemon(socket_path: &Path) -> Result<(SeqpacketConn, OwnedFd)> {
    let listener = SeqpacketListener::bind(socket_path).context("binding daemon listener")?;
    let (client_end, daemon_end) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .context("creating client/daemon socketpair")?;
    let (death_read, death_write) = pipe().context("creating death-detection pipe")?;

    let exe = std::env::current_exe().context("resolving own executable path")?;
    let socket_path_str = socket_path
        .to_str()
        .context("socket path is not valid UTF-8")?
        .to_owned();

    let listener_raw = listener.as_raw_fd();
    let daemon_end_raw = daemon_end.as_raw_fd();
    let death_read_raw = death_read.as_raw_fd();

    let mut cmd = std::process::Command::new(&exe);
    cmd.arg("serve").arg(&socket_path_str);
    // Safety: runs in the forked child on its single remaining thread,
    // immediately before exec, calling only async-signal-safe libc
    // functions, mirroring `pty.rs`'s `pre_exec` use.
    unsafe {
        cmd.pre_exec(move || {
            libc::dup2(listener_raw, 0);
            libc::dup2(daemon_end_raw, 1);
            libc::dup2(death_read_raw, 2);
            Ok(())
        });
    }
    let child = cmd.spawn().context("spawning daemon process")?;
    debug!(pid = child.id(), path = %socket_path.display(), "spawned daemon");

    // The parent no longer needs the listener or its copies of the fds the
    // child inherited via `dup2`: only the child's own table entries matter
    // from here on.
    drop(listener);
    drop(daemon_end);
    drop(death_read);

    let conn = SeqpacketConn::from_owned(client_end).context("wrapping client socketpair end")?;
    Ok((conn, death_write))
}

async fn handshake(
    conn: &SeqpacketConn,
    client_max_version: i32,
    delegate: &dyn ClientDelegate,
) -> Result<()> {
    let (bytes, _fd) = ClientMessage::Handshake {
        client_max_version,
    }
    .encode()?;
    conn.send_frame(&bytes, None).await?;

    let (bytes, _fd) = conn
        .recv_frame()
        .await?
        .context("connection closed before handshake response")?;
    match ServerMessage::decode(&bytes)? {
        ServerMessage::Handshake {
            protocol_version, ..
        } if protocol_version < PROTOCOL_VERSION_1 => {
            anyhow::bail!("daemon rejected handshake (version {protocol_version})")
        }
        ServerMessage::Handshake { num_children, .. } => {
            for _ in 0..num_children {
                let (bytes, fd) = conn
                    .recv_frame()
                    .await?
                    .context("connection closed mid-handshake ReportChild stream")?;
                match ServerMessage::decode(&bytes)? {
                    ServerMessage::ReportChild {
                        pid,
                        spec,
                        terminated,
                        is_last,
                    } => {
                        let master_fd = fd.context("ReportChild missing its master fd")?;
                        delegate.child_discovered(pid, &spec, terminated, master_fd);
                        if is_last {
                            break;
                        }
                    }
                    other => anyhow::bail!("expected ReportChild, got {:?}", other.rpc_type()),
                }
            }
            Ok(())
        }
        other => anyhow::bail!("expected Handshake response, got {:?}", other.rpc_type()),
    }
}

/// Pumps server-initiated frames for the lifetime of the connection: resolves
/// the oldest pending `Launch`/`Wait` continuation on a matching response
/// (FIFO: the daemon answers requests in the order it received them, so no
/// request id is threaded over the wire), and forwards `Termination`
/// straight to the delegate. On disconnect, every remaining continuation
/// resolves with `ConnectionLost`.
async fn dispatch_loop(
    conn: Arc<SeqpacketConn>,
    continuations: Arc<Continuations>,
    delegate: Arc<dyn ClientDelegate>,
) {
    loop {
        let (bytes, fd) = match conn.recv_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("daemon connection closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "daemon connection failed");
                break;
            }
        };
        let msg = match ServerMessage::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "malformed server frame");
                break;
            }
        };
        match msg {
            ServerMessage::Launch { status, pid } => {
                let result = if status == 0 {
                    match fd {
                        Some(master_fd) => Ok(LaunchResult::Spawned { pid, master_fd }),
                        None => {
                            warn!("Launch success response missing master fd");
                            break;
                        }
                    }
                } else {
                    Ok(LaunchResult::Failed)
                };
                if let Some(tx) = continuations.launch.lock().unwrap().pop_front() {
                    let _ = tx.send(result);
                }
            }
            ServerMessage::Wait { pid, status, errno } => {
                let result = match ClientError::from_wait_errno(errno) {
                    None => Ok(WaitOutcome { pid, status }),
                    Some(e) => Err(e),
                };
                if let Some(tx) = continuations.wait.lock().unwrap().pop_front() {
                    let _ = tx.send(result);
                }
            }
            ServerMessage::Termination { pid } => delegate.child_terminated(pid),
            ServerMessage::ReportChild { .. } | ServerMessage::Handshake { .. } => {
                warn!(rpc_type = ?msg.rpc_type(), "unexpected message outside handshake");
                break;
            }
        }
    }
    continuations.fail_all(|| ClientError::ConnectionLost(anyhow::anyhow!("connection lost")));
}
