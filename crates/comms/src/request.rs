// crates/comms/src/request.rs
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use crate::frames::{Frame, Tag};

/// Presence bits for the descriptors escorting a spawn request, in the
/// order they are attached to the control message.
pub const FD_EXEC: u8 = 0b001;
pub const FD_COMMS: u8 = 0b010;
pub const FD_USER_NS: u8 = 0b100;

const MAX_STRINGS: u32 = 4096;
const MAX_STRING_LEN: u32 = 64 * 1024;

/// What to spawn. Produced and owned by the caller; the supervisor only
/// forwards it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnRequest {
    pub args: Vec<OsString>,
    pub envs: Vec<OsString>,
}

impl SpawnRequest {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        SpawnRequest {
            args: args.into_iter().map(Into::into).collect(),
            envs: Vec::new(),
        }
    }
}

/// A spawn request as it travels over the channel: the caller's request plus
/// the descriptor-presence mask and whether an intermediate process id is
/// wanted back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnPayload {
    pub request: SpawnRequest,
    pub fd_mask: u8,
    pub want_init: bool,
}

impl SpawnPayload {
    pub fn fd_count(&self) -> usize {
        self.fd_mask.count_ones() as usize
    }
}

/// The helper's answer: the spawned pid (or `-1` if the helper could not
/// spawn) and the intermediate pid (`-1` when absent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnReply {
    pub pid: i32,
    pub init_pid: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Spawn(SpawnPayload),
    Reply(SpawnReply),
}

fn write_os_strings<W: Write>(w: &mut W, strs: &[OsString]) -> io::Result<()> {
    w.write_u32::<BigEndian>(strs.len() as u32)?;
    for s in strs {
        let bytes = s.as_bytes();
        w.write_u32::<BigEndian>(bytes.len() as u32)?;
        w.write_all(bytes)?;
    }
    Ok(())
}

fn read_os_strings<R: Read>(r: &mut R) -> io::Result<Vec<OsString>> {
    let count = r.read_u32::<BigEndian>()?;
    if count > MAX_STRINGS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("string list too long: {count}"),
        ));
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = r.read_u32::<BigEndian>()?;
        if len > MAX_STRING_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("string too long: {len} bytes"),
            ));
        }
        let mut bytes = vec![0; len as usize];
        r.read_exact(&mut bytes)?;
        out.push(OsString::from_vec(bytes));
    }
    Ok(out)
}

impl Message {
    pub fn to_frame(&self) -> Frame {
        match self {
            Message::Spawn(payload) => {
                let mut buf = Vec::new();
                // Infallible: writing to a Vec.
                let _ = buf.write_u8(payload.fd_mask);
                let _ = buf.write_u8(payload.want_init as u8);
                let _ = write_os_strings(&mut buf, &payload.request.args);
                let _ = write_os_strings(&mut buf, &payload.request.envs);
                Frame::new(Tag::Spawn, buf)
            }
            Message::Reply(reply) => {
                let mut buf = Vec::new();
                let _ = buf.write_i32::<BigEndian>(reply.pid);
                let _ = buf.write_i32::<BigEndian>(reply.init_pid);
                Frame::new(Tag::Reply, buf)
            }
        }
    }

    pub fn from_frame(frame: Frame) -> io::Result<Message> {
        let mut r = frame.payload.as_slice();
        let msg = match frame.header.tag {
            Tag::Spawn => {
                let fd_mask = r.read_u8()?;
                if fd_mask & !(FD_EXEC | FD_COMMS | FD_USER_NS) != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unknown descriptor mask {fd_mask:#b}"),
                    ));
                }
                let want_init = r.read_u8()? != 0;
                let args = read_os_strings(&mut r)?;
                let envs = read_os_strings(&mut r)?;
                Message::Spawn(SpawnPayload {
                    request: SpawnRequest { args, envs },
                    fd_mask,
                    want_init,
                })
            }
            Tag::Reply => Message::Reply(SpawnReply {
                pid: r.read_i32::<BigEndian>()?,
                init_pid: r.read_i32::<BigEndian>()?,
            }),
        };
        if !r.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailing bytes after message",
            ));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_roundtrip() {
        let msg = Message::Spawn(SpawnPayload {
            request: SpawnRequest {
                args: vec!["/bin/true".into(), "-x".into()],
                envs: vec!["PATH=/bin".into()],
            },
            fd_mask: FD_EXEC | FD_COMMS,
            want_init: true,
        });
        let decoded = Message::from_frame(msg.to_frame()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn reply_roundtrip() {
        let msg = Message::Reply(SpawnReply {
            pid: 12345,
            init_pid: -1,
        });
        let decoded = Message::from_frame(msg.to_frame()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_mask_bit_errors() {
        let msg = Message::Spawn(SpawnPayload {
            request: SpawnRequest::default(),
            fd_mask: FD_EXEC,
            want_init: false,
        });
        let mut frame = msg.to_frame();
        frame.payload[0] = 0b1000;
        assert!(Message::from_frame(frame).is_err());
    }

    #[test]
    fn trailing_bytes_error() {
        let msg = Message::Reply(SpawnReply {
            pid: 1,
            init_pid: -1,
        });
        let mut frame = msg.to_frame();
        frame.payload.push(0);
        frame.header.len += 1;
        assert!(Message::from_frame(frame).is_err());
    }

    #[test]
    fn truncated_spawn_errors() {
        let msg = Message::Spawn(SpawnPayload {
            request: SpawnRequest::new(["/bin/sh"]),
            fd_mask: 0,
            want_init: false,
        });
        let mut frame = msg.to_frame();
        frame.payload.truncate(4);
        frame.header.len = 4;
        assert!(Message::from_frame(frame).is_err());
    }

    #[test]
    fn fd_count_follows_mask() {
        let payload = SpawnPayload {
            request: SpawnRequest::default(),
            fd_mask: FD_EXEC | FD_USER_NS,
            want_init: false,
        };
        assert_eq!(payload.fd_count(), 2);
    }
}
