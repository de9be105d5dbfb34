//! PTY launch helper: pack a launch request into a fork+exec with a
//! controlling pseudo-terminal.
//!
//! Uses `pre_exec` to reset stdio/session/signals in the freshly forked
//! child (single remaining thread, about to exec), avoiding a hand-rolled
//! `fork()` and the post-fork allocator hazards that come with one in a
//! multi-threaded process.

use std::io;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::pty::{openpty, Winsize};
use nix::sys::termios::{self, SetArg};
use nix::unistd::Pid;

use crate::message::LaunchSpec;

/// Outcome of a launch attempt: success carries the pid and the parent's
/// copy of the PTY master; failure carries the errno observed from
/// `forkpty`/`execve`.
pub enum LaunchOutcome {
    Success { pid: Pid, master_fd: RawFd },
    Failure { errno: i32 },
}

pub fn launch(spec: &LaunchSpec) -> LaunchOutcome {
    match try_launch(spec) {
        Ok((pid, master_fd)) => LaunchOutcome::Success { pid, master_fd },
        Err(e) => LaunchOutcome::Failure {
            errno: e.raw_os_error().unwrap_or(libc::EIO),
        },
    }
}

fn try_launch(spec: &LaunchSpec) -> io::Result<(Pid, RawFd)> {
    let winsize = Winsize {
        ws_col: spec.width.clamp(1, u16::MAX as i32) as u16,
        ws_row: spec.height.clamp(1, u16::MAX as i32) as u16,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = openpty(Some(&winsize), None)?;
    let master_fd = pty.master.into_raw_fd();
    let slave_fd = pty.slave.into_raw_fd();

    set_utf8_mode(slave_fd, spec.is_utf8);

    if spec.argv.is_empty() {
        unsafe {
            libc::close(master_fd);
            libc::close(slave_fd);
        }
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty argv"));
    }

    let mut cmd = Command::new(&spec.path);
    cmd.arg0(&spec.argv[0]);
    cmd.args(&spec.argv[1..]);
    cmd.current_dir(&spec.pwd);
    cmd.env_clear();
    for entry in &spec.envp {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }

    // Safety: pre_exec runs in the forked child, on the single remaining
    // thread, immediately before exec. It only calls async-signal-safe
    // libc functions.
    unsafe {
        cmd.pre_exec(move || {
            libc::dup2(slave_fd, libc::STDIN_FILENO);
            libc::dup2(slave_fd, libc::STDOUT_FILENO);
            libc::dup2(slave_fd, libc::STDERR_FILENO);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            libc::setsid();
            libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0);
            for sig in [
                libc::SIGINT,
                libc::SIGQUIT,
                libc::SIGTERM,
                libc::SIGHUP,
                libc::SIGCHLD,
                libc::SIGPIPE,
                libc::SIGWINCH,
            ] {
                libc::signal(sig, libc::SIG_DFL);
            }
            Ok(())
        });
    }

    match cmd.spawn() {
        Ok(child) => {
            let pid = Pid::from_raw(child.id() as i32);
            // Parent's copy of the slave is no longer needed once the child
            // has inherited it across the fork.
            unsafe { libc::close(slave_fd) };
            Ok((pid, master_fd))
        }
        Err(e) => {
            unsafe {
                libc::close(master_fd);
                libc::close(slave_fd);
            }
            Err(e)
        }
    }
}

#[cfg(target_os = "linux")]
fn set_utf8_mode(slave_fd: RawFd, is_utf8: bool) {
    use std::os::fd::BorrowedFd;
    let fd = unsafe { BorrowedFd::borrow_raw(slave_fd) };
    if let Ok(mut attrs) = termios::tcgetattr(fd) {
        if is_utf8 {
            attrs.input_flags.insert(termios::InputFlags::IUTF8);
        } else {
            attrs.input_flags.remove(termios::InputFlags::IUTF8);
        }
        let _ = termios::tcsetattr(fd, SetArg::TCSANOW, &attrs);
    }
}

#[cfg(not(target_os = "linux"))]
fn set_utf8_mode(_slave_fd: RawFd, _is_utf8: bool) {
    // IUTF8 is a Linux-specific termios bit; other platforms negotiate
    // UTF-8 at the application layer instead.
}
