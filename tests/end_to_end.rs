//! End-to-end tests, run against the real daemon binary over a real Unix
//! socket in a `tempfile` directory. Most spawn one daemon process and drive
//! it with the client core in-process; a couple additionally open a second
//! connection to exercise reattach and the busy-reject path.

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::process::{Child as OsChild, Command};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use multipty::client::{AttachOutcome, Client, ClientDelegate, LaunchResult};
use multipty::error::ClientError;
use multipty::message::{LaunchSpec, PROTOCOL_VERSION_1};

struct DaemonGuard {
    child: OsChild,
    socket_path: PathBuf,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Spawn the real `multipty` binary in `--standalone` mode (it binds and
/// accepts at `socket_path` itself instead of inheriting fds 0/1, which a
/// `cargo test` harness has no clean way to arrange).
async fn spawn_daemon(socket_path: &Path) -> DaemonGuard {
    let child = Command::new(env!("CARGO_BIN_EXE_multipty"))
        .arg("serve")
        .arg(socket_path)
        .arg("--standalone")
        .spawn()
        .expect("failed to spawn multipty daemon");

    for _ in 0..100 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(socket_path.exists(), "daemon never created its socket");

    DaemonGuard {
        child,
        socket_path: socket_path.to_path_buf(),
    }
}

#[derive(Default)]
struct RecordingDelegate {
    discovered: Mutex<Vec<(i32, bool)>>,
    terminated: Mutex<Vec<i32>>,
}

impl ClientDelegate for RecordingDelegate {
    fn child_discovered(&self, pid: i32, _spec: &LaunchSpec, terminated: bool, master_fd: RawFd) {
        self.discovered.lock().unwrap().push((pid, terminated));
        // We don't forward terminal I/O in these tests; just don't leak.
        unsafe { libc::close(master_fd) };
    }

    fn child_terminated(&self, pid: i32) {
        self.terminated.lock().unwrap().push(pid);
    }
}

fn echo_spec(message: &str) -> LaunchSpec {
    LaunchSpec {
        path: "/bin/sh".to_string(),
        argv: vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo {message}"),
        ],
        envp: vec!["PATH=/usr/bin:/bin".to_string()],
        width: 80,
        height: 24,
        is_utf8: true,
        pwd: "/tmp".to_string(),
        unique_id: 1,
    }
}

async fn connect(socket_path: &Path, delegate: Arc<dyn ClientDelegate>) -> Client {
    match Client::connect_existing(socket_path, PROTOCOL_VERSION_1, delegate).await {
        AttachOutcome::Success(client) => client,
        AttachOutcome::ConnectFailed(e) => panic!("connect failed: {e}"),
        AttachOutcome::FatalError(e) => panic!("fatal attach error: {e}"),
    }
}

/// Launch a child, it runs to completion, wait reports its exit status.
#[tokio::test]
async fn launch_and_wait_reports_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("multipty.sock");
    let _daemon = spawn_daemon(&socket_path).await;

    let delegate = Arc::new(RecordingDelegate::default());
    let client = connect(&socket_path, delegate).await;

    let (pid, master_fd) = match client.launch(echo_spec("hello")).await.unwrap() {
        LaunchResult::Spawned { pid, master_fd } => (pid, master_fd),
        LaunchResult::Failed => panic!("launch unexpectedly failed"),
    };
    unsafe { libc::close(master_fd) };

    let outcome = loop {
        match client.wait(pid).await {
            Ok(outcome) => break outcome,
            Err(ClientError::CanNotWait) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("unexpected wait error: {e}"),
        }
    };
    assert_eq!(outcome.pid, pid);
}

/// A launch with a bogus executable path fails cleanly, without taking down
/// the connection.
#[tokio::test]
async fn launch_failure_does_not_kill_connection() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("multipty.sock");
    let _daemon = spawn_daemon(&socket_path).await;

    let delegate = Arc::new(RecordingDelegate::default());
    let client = connect(&socket_path, delegate).await;

    let mut bad_spec = echo_spec("unused");
    bad_spec.path = "/no/such/executable-multipty-test".to_string();
    bad_spec.argv = vec!["no-such-executable".to_string()];

    let result = client.launch(bad_spec).await.unwrap();
    assert!(matches!(result, LaunchResult::Failed));

    // Connection still works after a failed launch.
    let (pid, master_fd) = match client.launch(echo_spec("still alive")).await.unwrap() {
        LaunchResult::Spawned { pid, master_fd } => (pid, master_fd),
        LaunchResult::Failed => panic!("second launch unexpectedly failed"),
    };
    assert!(pid > 0);
    unsafe { libc::close(master_fd) };
}

/// Waiting on a pid the daemon never launched reports `NoSuchChild`.
#[tokio::test]
async fn wait_on_unknown_pid() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("multipty.sock");
    let _daemon = spawn_daemon(&socket_path).await;

    let delegate = Arc::new(RecordingDelegate::default());
    let client = connect(&socket_path, delegate).await;

    let err = client.wait(999_999).await.unwrap_err();
    assert!(matches!(err, ClientError::NoSuchChild));
}

/// Waiting on a child that hasn't exited yet reports `CanNotWait`; once it
/// exits, the daemon reports `Termination` and the next `Wait` succeeds.
#[tokio::test]
async fn wait_on_live_child_then_after_exit() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("multipty.sock");
    let _daemon = spawn_daemon(&socket_path).await;

    let delegate = Arc::new(RecordingDelegate::default());
    let client = connect(&socket_path, delegate.clone()).await;

    let long_running = LaunchSpec {
        path: "/bin/sleep".to_string(),
        argv: vec!["sleep".to_string(), "30".to_string()],
        envp: vec![],
        width: 80,
        height: 24,
        is_utf8: true,
        pwd: "/tmp".to_string(),
        unique_id: 2,
    };
    let pid = match client.launch(long_running).await.unwrap() {
        LaunchResult::Spawned { pid, .. } => pid,
        LaunchResult::Failed => panic!("launch failed"),
    };

    let err = client.wait(pid).await.unwrap_err();
    assert!(matches!(err, ClientError::CanNotWait));

    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }

    for _ in 0..100 {
        if delegate.terminated.lock().unwrap().contains(&pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(delegate.terminated.lock().unwrap().contains(&pid));

    let outcome = client.wait(pid).await.unwrap();
    assert_eq!(outcome.pid, pid);
}

/// Reattaching (a fresh connection) is told about every previously launched,
/// still-tracked child via the handshake's `ReportChild` stream.
#[tokio::test]
async fn reattach_reports_existing_children() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("multipty.sock");
    let _daemon = spawn_daemon(&socket_path).await;

    let first_delegate = Arc::new(RecordingDelegate::default());
    let first = connect(&socket_path, first_delegate).await;
    let pid = match first
        .launch(LaunchSpec {
            path: "/bin/sleep".to_string(),
            argv: vec!["sleep".to_string(), "30".to_string()],
            envp: vec![],
            width: 80,
            height: 24,
            is_utf8: true,
            pwd: "/tmp".to_string(),
            unique_id: 3,
        })
        .await
        .unwrap()
    {
        LaunchResult::Spawned { pid, .. } => pid,
        LaunchResult::Failed => panic!("launch failed"),
    };
    drop(first);
    // Give the daemon's select loop a beat to notice the disconnect and
    // return to its accept loop before the next connection attempts.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second_delegate = Arc::new(RecordingDelegate::default());
    let second = connect(&socket_path, second_delegate.clone()).await;
    assert!(second_delegate
        .discovered
        .lock()
        .unwrap()
        .iter()
        .any(|(reported_pid, terminated)| *reported_pid == pid && !terminated));

    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    drop(second);
}

/// A second client attempting to attach while one is already connected gets
/// a rejected handshake rather than queueing or displacing the first.
#[tokio::test]
async fn second_client_is_rejected_while_busy() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("multipty.sock");
    let _daemon = spawn_daemon(&socket_path).await;

    let first_delegate = Arc::new(RecordingDelegate::default());
    let _first = connect(&socket_path, first_delegate).await;

    let second_delegate = Arc::new(RecordingDelegate::default());
    match Client::connect_existing(&socket_path, PROTOCOL_VERSION_1, second_delegate).await {
        AttachOutcome::FatalError(_) => {}
        AttachOutcome::Success(_) => panic!("second connection should have been rejected"),
        AttachOutcome::ConnectFailed(e) => panic!("unexpected connect failure: {e}"),
    }
}
