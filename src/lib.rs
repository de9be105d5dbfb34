//! `multipty`: a long-lived daemon that owns PTY children across client
//! restarts, speaking a small length-prefixed TLV protocol over a SEQPACKET
//! Unix socket with SCM_RIGHTS fd-passing.

pub mod args;
pub mod child;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod pty;
pub mod server;
pub mod signals;
pub mod sock;
