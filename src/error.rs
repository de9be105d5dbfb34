//! Error kinds visible at the client API.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection lost")]
    ConnectionLost(#[source] anyhow::Error),

    #[error("no such child")]
    NoSuchChild,

    #[error("child has not terminated yet")]
    CanNotWait,

    #[error("unknown error: {0}")]
    Unknown(#[source] anyhow::Error),
}

impl ClientError {
    /// Map a server-reported `Wait` errno to the typed error.
    pub fn from_wait_errno(errno: i32) -> Option<Self> {
        match errno {
            0 => None,
            -1 => Some(ClientError::NoSuchChild),
            -2 => Some(ClientError::CanNotWait),
            other => Some(ClientError::Unknown(anyhow::anyhow!(
                "unexpected wait errno {other}"
            ))),
        }
    }
}
