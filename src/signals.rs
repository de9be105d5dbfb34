//! SIGCHLD self-pipe, plus ignoring SIGHUP (survive the controlling client
//! crashing) and SIGPIPE (a broken client write should return an error, not
//! kill the daemon).
//!
//! `signal_hook::low_level::pipe::register` does the async-signal-safe
//! write internally and hands us a plain socket to poll, so no unsafe
//! handler code of our own is needed.

use std::os::unix::net::UnixStream as StdUnixStream;

use anyhow::{Context, Result};
use signal_hook::consts::SIGCHLD;
use tokio::io::unix::AsyncFd;

/// Read end of the SIGCHLD self-pipe, wired into the tokio reactor.
pub struct ChildSignal {
    inner: AsyncFd<StdUnixStream>,
}

impl ChildSignal {
    pub fn install() -> Result<Self> {
        ignore_sighup_sigpipe();

        let (read_half, write_half) =
            StdUnixStream::pair().context("failed to create self-pipe")?;
        read_half
            .set_nonblocking(true)
            .context("failed to set self-pipe nonblocking")?;
        write_half
            .set_nonblocking(true)
            .context("failed to set self-pipe nonblocking")?;
        // Safety: registered fd is written to only from the signal handler,
        // with an async-signal-safe write.
        unsafe {
            signal_hook::low_level::pipe::register(SIGCHLD, write_half)
                .context("failed to register SIGCHLD self-pipe")?;
        }

        Ok(Self {
            inner: AsyncFd::new(read_half)?,
        })
    }

    /// Resolves once a SIGCHLD has arrived since the last call. Drains the
    /// pipe so repeated signals coalesce into one wakeup.
    pub async fn wait(&self) -> Result<()> {
        use std::io::Read;
        loop {
            let mut guard = self.inner.readable().await?;
            let mut buf = [0u8; 64];
            match guard.try_io(|inner| {
                let mut stream: &StdUnixStream = inner.get_ref();
                stream.read(&mut buf)
            }) {
                Ok(Ok(0)) => anyhow::bail!("self-pipe closed"),
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

fn ignore_sighup_sigpipe() {
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
