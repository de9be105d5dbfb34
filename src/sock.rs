//! SOCK_SEQPACKET Unix-domain socket wrapped for tokio, with SCM_RIGHTS
//! ancillary file-descriptor passing.
//!
//! `tokio::net::UnixListener`/`UnixStream` only speak `SOCK_STREAM` and have
//! no cmsg support, so fd passing is built directly on
//! `nix::sys::socket::{sendmsg, recvmsg}` against a raw, non-blocking fd,
//! bridged into the tokio reactor with `tokio::io::unix::AsyncFd`. SEQPACKET
//! gives us one syscall per message, so `codec.rs`'s TLV records need no
//! extra length prefix on top of them.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    accept, bind, connect, listen, recvmsg, sendmsg, socket, AddressFamily, ControlMessage,
    ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use tokio::io::unix::AsyncFd;

/// Frames are small (a handful of strings); this comfortably bounds argv/envp
/// for the launch requests this protocol carries.
const MAX_FRAME_BYTES: usize = 256 * 1024;

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).context("fcntl F_GETFL failed")?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).context("fcntl F_SETFL O_NONBLOCK failed")?;
    Ok(())
}

fn to_io_error(e: nix::Error) -> std::io::Error {
    std::io::Error::from(e)
}

/// The listening end of the daemon's socket (or the inherited fd 0).
pub struct SeqpacketListener {
    inner: AsyncFd<OwnedFd>,
}

impl SeqpacketListener {
    /// Bind and listen at `path`, unlinking a stale socket file first.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path).context("failed to unlink stale socket")?;
        }
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("socket() failed")?;
        set_nonblocking(fd.as_raw_fd())?;
        let addr = UnixAddr::new(path).context("invalid socket path")?;
        bind(fd.as_raw_fd(), &addr).context("bind() failed")?;
        listen(fd.as_raw_fd(), 1).context("listen() failed")?;
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    /// Wrap an fd inherited at process startup (already bound and listening).
    pub fn from_inherited(fd: RawFd) -> Result<Self> {
        set_nonblocking(fd)?;
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            inner: AsyncFd::new(owned)?,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }

    pub async fn accept(&self) -> Result<SeqpacketConn> {
        loop {
            let mut guard = self.inner.readable().await?;
            let listener_fd = self.inner.get_ref().as_raw_fd();
            match guard.try_io(|_| accept(listener_fd).map_err(to_io_error)) {
                Ok(Ok(fd)) => {
                    set_nonblocking(fd)?;
                    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                    return Ok(SeqpacketConn {
                        inner: AsyncFd::new(owned)?,
                    });
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

/// One connected SEQPACKET endpoint: either side of the client/server pair.
pub struct SeqpacketConn {
    inner: AsyncFd<OwnedFd>,
}

impl SeqpacketConn {
    pub fn connect(path: &Path) -> Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .context("socket() failed")?;
        let addr = UnixAddr::new(path).context("invalid socket path")?;
        connect(fd.as_raw_fd(), &addr).context("connect() failed")?;
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    /// Wrap an fd inherited at process startup (already connected).
    pub fn from_inherited(fd: RawFd) -> Result<Self> {
        set_nonblocking(fd)?;
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self {
            inner: AsyncFd::new(owned)?,
        })
    }

    /// Wrap an already-owned, already-connected fd, e.g. one half of a
    /// socketpair created for a daemon we just spawned ourselves.
    pub fn from_owned(fd: OwnedFd) -> Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }

    /// Send one complete frame, attaching `fd` as SCM_RIGHTS ancillary data
    /// if present. A short send is reported as an error, never retried.
    pub async fn send_frame(&self, bytes: &[u8], fd: Option<RawFd>) -> Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            let raw_fd = self.inner.get_ref().as_raw_fd();
            let iov = [IoSlice::new(bytes)];
            let fds = fd.map(|f| [f]);
            let cmsgs = match &fds {
                Some(fds) => vec![ControlMessage::ScmRights(fds)],
                None => vec![],
            };
            match guard.try_io(|_| {
                sendmsg::<()>(raw_fd, &iov, &cmsgs, MsgFlags::empty(), None).map_err(to_io_error)
            }) {
                Ok(Ok(n)) => {
                    if n != bytes.len() {
                        bail!("short write: sent {n} of {} bytes", bytes.len());
                    }
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one complete frame. Returns `Ok(None)` on orderly shutdown
    /// (the peer closed its end).
    pub async fn recv_frame(&self) -> Result<Option<(Vec<u8>, Option<RawFd>)>> {
        loop {
            let mut guard = self.inner.readable().await?;
            let raw_fd = self.inner.get_ref().as_raw_fd();
            let mut buf = vec![0u8; MAX_FRAME_BYTES];
            let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
            let io_result = guard.try_io(|_| {
                let mut iov = [IoSliceMut::new(&mut buf)];
                let msg = recvmsg::<()>(
                    raw_fd,
                    &mut iov,
                    Some(&mut cmsg_space),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(to_io_error)?;
                let fd = msg.cmsgs()?.find_map(|cmsg| match cmsg {
                    ControlMessageOwned::ScmRights(fds) if !fds.is_empty() => Some(fds[0]),
                    _ => None,
                });
                Ok((msg.bytes, fd))
            });

            match io_result {
                Ok(Ok((0, _))) => return Ok(None),
                Ok(Ok((n, fd))) => {
                    buf.truncate(n);
                    return Ok(Some((buf, fd)));
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}
