//! Message schemas for the multi-server protocol: client-originated
//! `{Handshake, Launch, Wait}` and server-originated `{Handshake, Launch,
//! Wait, ReportChild, Termination}`. Field order within each schema is
//! canonical and enforced by the codec.

use anyhow::{bail, Result};

use crate::codec::{Decoder, Encoder};

pub const PROTOCOL_VERSION_1: i32 = 1;
pub const PROTOCOL_VERSION_REJECTED: i32 = -1;

/// A handshake response reports at most this many children.
pub const MAX_REPORTED_CHILDREN: i32 = 1024;

mod tags {
    pub const TYPE: i32 = 0;
    pub const HANDSHAKE_REQUEST_MAX_VERSION: i32 = 1;
    pub const HANDSHAKE_RESPONSE_PROTOCOL_VERSION: i32 = 2;
    pub const HANDSHAKE_RESPONSE_NUM_CHILDREN: i32 = 3;
    pub const LAUNCH_REQUEST_PATH: i32 = 4;
    pub const LAUNCH_REQUEST_ARGV: i32 = 5;
    pub const LAUNCH_REQUEST_ENVP: i32 = 6;
    pub const LAUNCH_REQUEST_WIDTH: i32 = 7;
    pub const LAUNCH_REQUEST_HEIGHT: i32 = 8;
    pub const LAUNCH_REQUEST_IS_UTF8: i32 = 9;
    pub const LAUNCH_REQUEST_PWD: i32 = 10;
    pub const LAUNCH_REQUEST_UNIQUE_ID: i32 = 11;
    pub const WAIT_REQUEST_PID: i32 = 12;
    pub const WAIT_RESPONSE_PID: i32 = 13;
    pub const WAIT_RESPONSE_STATUS: i32 = 14;
    pub const WAIT_RESPONSE_ERRNO: i32 = 15;
    pub const LAUNCH_RESPONSE_STATUS: i32 = 16;
    pub const LAUNCH_RESPONSE_PID: i32 = 17;
    pub const REPORT_CHILD_IS_LAST: i32 = 18;
    pub const REPORT_CHILD_PID: i32 = 19;
    pub const REPORT_CHILD_PATH: i32 = 20;
    pub const REPORT_CHILD_ARGV: i32 = 21;
    pub const REPORT_CHILD_ENVP: i32 = 22;
    pub const REPORT_CHILD_PWD: i32 = 23;
    pub const REPORT_CHILD_IS_UTF8: i32 = 24;
    pub const REPORT_CHILD_TERMINATED: i32 = 25;
    pub const TERMINATION_PID: i32 = 26;
}

/// The discriminant every frame opens with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcType {
    Handshake,
    Launch,
    Wait,
    ReportChild,
    Termination,
}

impl RpcType {
    fn to_i32(self) -> i32 {
        match self {
            RpcType::Handshake => 0,
            RpcType::Launch => 1,
            RpcType::Wait => 2,
            RpcType::ReportChild => 3,
            RpcType::Termination => 4,
        }
    }

    fn from_i32(v: i32) -> Result<Self> {
        Ok(match v {
            0 => RpcType::Handshake,
            1 => RpcType::Launch,
            2 => RpcType::Wait,
            3 => RpcType::ReportChild,
            4 => RpcType::Termination,
            other => bail!(crate::codec::ProtocolError::UnknownMessageTag(other)),
        })
    }
}

/// The full launch parameters, retained so a reattaching client can rebuild
/// its model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub path: String,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    pub width: i32,
    pub height: i32,
    pub is_utf8: bool,
    pub pwd: String,
    pub unique_id: i64,
}

impl LaunchSpec {
    fn encode_fields(&self, enc: &mut Encoder) -> Result<()> {
        enc.write_str(tags::LAUNCH_REQUEST_PATH, &self.path)?;
        enc.write_str_array(tags::LAUNCH_REQUEST_ARGV, &self.argv)?;
        enc.write_str_array(tags::LAUNCH_REQUEST_ENVP, &self.envp)?;
        enc.write_i32(tags::LAUNCH_REQUEST_WIDTH, self.width);
        enc.write_i32(tags::LAUNCH_REQUEST_HEIGHT, self.height);
        enc.write_i32(tags::LAUNCH_REQUEST_IS_UTF8, self.is_utf8 as i32);
        enc.write_str(tags::LAUNCH_REQUEST_PWD, &self.pwd)?;
        enc.write_i64(tags::LAUNCH_REQUEST_UNIQUE_ID, self.unique_id);
        Ok(())
    }

    fn decode_fields(dec: &mut Decoder) -> Result<Self> {
        Ok(Self {
            path: dec.read_str(tags::LAUNCH_REQUEST_PATH)?,
            argv: dec.read_str_array(tags::LAUNCH_REQUEST_ARGV)?,
            envp: dec.read_str_array(tags::LAUNCH_REQUEST_ENVP)?,
            width: dec.read_i32(tags::LAUNCH_REQUEST_WIDTH)?,
            height: dec.read_i32(tags::LAUNCH_REQUEST_HEIGHT)?,
            is_utf8: dec.read_i32(tags::LAUNCH_REQUEST_IS_UTF8)? != 0,
            pwd: dec.read_str(tags::LAUNCH_REQUEST_PWD)?,
            unique_id: dec.read_i64(tags::LAUNCH_REQUEST_UNIQUE_ID)?,
        })
    }
}

/// Client-originated messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Handshake { client_max_version: i32 },
    Launch(LaunchSpec),
    Wait { pid: i32 },
}

impl ClientMessage {
    pub fn rpc_type(&self) -> RpcType {
        match self {
            ClientMessage::Handshake { .. } => RpcType::Handshake,
            ClientMessage::Launch(_) => RpcType::Launch,
            ClientMessage::Wait { .. } => RpcType::Wait,
        }
    }

    pub fn encode(&self) -> Result<(Vec<u8>, Option<i32>)> {
        let mut enc = Encoder::new();
        enc.write_i32(tags::TYPE, self.rpc_type().to_i32());
        match self {
            ClientMessage::Handshake { client_max_version } => {
                enc.write_i32(
                    tags::HANDSHAKE_REQUEST_MAX_VERSION,
                    *client_max_version,
                );
            }
            ClientMessage::Launch(spec) => spec.encode_fields(&mut enc)?,
            ClientMessage::Wait { pid } => enc.write_i32(tags::WAIT_REQUEST_PID, *pid),
        }
        let (buf, fd) = enc.finish();
        Ok((buf, fd))
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        let rpc_type = RpcType::from_i32(dec.read_i32(tags::TYPE)?)?;
        let msg = match rpc_type {
            RpcType::Handshake => ClientMessage::Handshake {
                client_max_version: dec.read_i32(tags::HANDSHAKE_REQUEST_MAX_VERSION)?,
            },
            RpcType::Launch => ClientMessage::Launch(LaunchSpec::decode_fields(&mut dec)?),
            RpcType::Wait => ClientMessage::Wait {
                pid: dec.read_i32(tags::WAIT_REQUEST_PID)?,
            },
            RpcType::ReportChild | RpcType::Termination => {
                bail!("client may not originate {:?}", rpc_type)
            }
        };
        if !dec.is_empty() {
            bail!("trailing bytes after client message");
        }
        Ok(msg)
    }
}

/// Server-originated messages. `ReportChild` and a successful
/// `Launch` response additionally carry exactly one ancillary fd; that fd
/// travels alongside the byte buffer through `sock::SeqpacketConn`, not
/// inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Handshake {
        protocol_version: i32,
        num_children: i32,
    },
    Launch {
        status: i32,
        pid: i32,
    },
    Wait {
        pid: i32,
        status: i32,
        errno: i32,
    },
    ReportChild {
        is_last: bool,
        pid: i32,
        spec: LaunchSpec,
        terminated: bool,
    },
    Termination {
        pid: i32,
    },
}

impl ServerMessage {
    pub fn rpc_type(&self) -> RpcType {
        match self {
            ServerMessage::Handshake { .. } => RpcType::Handshake,
            ServerMessage::Launch { .. } => RpcType::Launch,
            ServerMessage::Wait { .. } => RpcType::Wait,
            ServerMessage::ReportChild { .. } => RpcType::ReportChild,
            ServerMessage::Termination { .. } => RpcType::Termination,
        }
    }

    /// Whether this message is expected to carry exactly one ancillary fd.
    pub fn expects_fd(&self) -> bool {
        match self {
            ServerMessage::Launch { status, .. } => *status == 0,
            ServerMessage::ReportChild { .. } => true,
            _ => false,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        enc.write_i32(tags::TYPE, self.rpc_type().to_i32());
        match self {
            ServerMessage::Handshake {
                protocol_version,
                num_children,
            } => {
                enc.write_i32(tags::HANDSHAKE_RESPONSE_PROTOCOL_VERSION, *protocol_version);
                enc.write_i32(tags::HANDSHAKE_RESPONSE_NUM_CHILDREN, *num_children);
            }
            ServerMessage::Launch { status, pid } => {
                enc.write_i32(tags::LAUNCH_RESPONSE_STATUS, *status);
                enc.write_i32(tags::LAUNCH_RESPONSE_PID, *pid);
            }
            ServerMessage::Wait { pid, status, errno } => {
                enc.write_i32(tags::WAIT_RESPONSE_PID, *pid);
                enc.write_i32(tags::WAIT_RESPONSE_STATUS, *status);
                enc.write_i32(tags::WAIT_RESPONSE_ERRNO, *errno);
            }
            ServerMessage::ReportChild {
                is_last,
                pid,
                spec,
                terminated,
            } => {
                enc.write_i32(tags::REPORT_CHILD_IS_LAST, *is_last as i32);
                enc.write_i32(tags::REPORT_CHILD_PID, *pid);
                enc.write_str(tags::REPORT_CHILD_PATH, &spec.path)?;
                enc.write_str_array(tags::REPORT_CHILD_ARGV, &spec.argv)?;
                enc.write_str_array(tags::REPORT_CHILD_ENVP, &spec.envp)?;
                enc.write_str(tags::REPORT_CHILD_PWD, &spec.pwd)?;
                enc.write_i32(tags::REPORT_CHILD_IS_UTF8, spec.is_utf8 as i32);
                enc.write_i32(tags::REPORT_CHILD_TERMINATED, *terminated as i32);
            }
            ServerMessage::Termination { pid } => {
                enc.write_i32(tags::TERMINATION_PID, *pid);
            }
        }
        let (buf, _fd) = enc.finish();
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        let rpc_type = RpcType::from_i32(dec.read_i32(tags::TYPE)?)?;
        let msg = match rpc_type {
            RpcType::Handshake => ServerMessage::Handshake {
                protocol_version: dec.read_i32(tags::HANDSHAKE_RESPONSE_PROTOCOL_VERSION)?,
                num_children: dec.read_i32(tags::HANDSHAKE_RESPONSE_NUM_CHILDREN)?,
            },
            RpcType::Launch => ServerMessage::Launch {
                status: dec.read_i32(tags::LAUNCH_RESPONSE_STATUS)?,
                pid: dec.read_i32(tags::LAUNCH_RESPONSE_PID)?,
            },
            RpcType::Wait => ServerMessage::Wait {
                pid: dec.read_i32(tags::WAIT_RESPONSE_PID)?,
                status: dec.read_i32(tags::WAIT_RESPONSE_STATUS)?,
                errno: dec.read_i32(tags::WAIT_RESPONSE_ERRNO)?,
            },
            RpcType::ReportChild => {
                let is_last = dec.read_i32(tags::REPORT_CHILD_IS_LAST)? != 0;
                let pid = dec.read_i32(tags::REPORT_CHILD_PID)?;
                let path = dec.read_str(tags::REPORT_CHILD_PATH)?;
                let argv = dec.read_str_array(tags::REPORT_CHILD_ARGV)?;
                let envp = dec.read_str_array(tags::REPORT_CHILD_ENVP)?;
                let pwd = dec.read_str(tags::REPORT_CHILD_PWD)?;
                let is_utf8 = dec.read_i32(tags::REPORT_CHILD_IS_UTF8)? != 0;
                let terminated = dec.read_i32(tags::REPORT_CHILD_TERMINATED)? != 0;
                ServerMessage::ReportChild {
                    is_last,
                    pid,
                    spec: LaunchSpec {
                        path,
                        argv,
                        envp,
                        width: 0,
                        height: 0,
                        is_utf8,
                        pwd,
                        unique_id: 0,
                    },
                    terminated,
                }
            }
            RpcType::Termination => ServerMessage::Termination {
                pid: dec.read_i32(tags::TERMINATION_PID)?,
            },
        };
        if !dec.is_empty() {
            bail!("trailing bytes after server message");
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> LaunchSpec {
        LaunchSpec {
            path: "/bin/sh".to_string(),
            argv: vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()],
            envp: vec!["PATH=/usr/bin:/bin".to_string()],
            width: 80,
            height: 24,
            is_utf8: true,
            pwd: "/tmp".to_string(),
            unique_id: 42,
        }
    }

    /// `ReportChild` doesn't carry width/height/unique_id, so only a spec
    /// whose values there are already the decoder's zero defaults survives
    /// `decode(encode(m)) == m` under the derived `PartialEq`.
    fn reportable_spec() -> LaunchSpec {
        LaunchSpec {
            width: 0,
            height: 0,
            unique_id: 0,
            ..sample_spec()
        }
    }

    #[test]
    fn client_messages_round_trip() {
        let msgs = vec![
            ClientMessage::Handshake {
                client_max_version: 1,
            },
            ClientMessage::Launch(sample_spec()),
            ClientMessage::Wait { pid: 123 },
        ];
        for msg in msgs {
            let (buf, fd) = msg.encode().unwrap();
            assert!(fd.is_none());
            assert_eq!(ClientMessage::decode(&buf).unwrap(), msg);
        }
    }

    #[test]
    fn server_messages_round_trip() {
        let msgs = vec![
            ServerMessage::Handshake {
                protocol_version: 1,
                num_children: 2,
            },
            ServerMessage::Launch {
                status: 0,
                pid: 555,
            },
            ServerMessage::Launch { status: -1, pid: 0 },
            ServerMessage::Wait {
                pid: 555,
                status: 0,
                errno: 0,
            },
            ServerMessage::ReportChild {
                is_last: true,
                pid: 555,
                spec: reportable_spec(),
                terminated: false,
            },
            ServerMessage::Termination { pid: 555 },
        ];
        for msg in msgs {
            let buf = msg.encode().unwrap();
            assert_eq!(ServerMessage::decode(&buf).unwrap(), msg);
        }
    }

    #[test]
    fn launch_success_expects_fd_launch_failure_does_not() {
        assert!(ServerMessage::Launch { status: 0, pid: 1 }.expects_fd());
        assert!(!ServerMessage::Launch { status: -1, pid: 0 }.expects_fd());
        assert!(!ServerMessage::Handshake {
            protocol_version: 1,
            num_children: 0
        }
        .expects_fd());
    }

    #[test]
    fn report_child_always_expects_fd() {
        let msg = ServerMessage::ReportChild {
            is_last: false,
            pid: 1,
            spec: sample_spec(),
            terminated: true,
        };
        assert!(msg.expects_fd());
    }

    #[test]
    fn unknown_rpc_tag_is_protocol_error() {
        let mut enc = Encoder::new();
        enc.write_i32(tags::TYPE, 99);
        let (buf, _) = enc.finish();
        assert!(ClientMessage::decode(&buf).is_err());
    }
}
