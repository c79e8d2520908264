// crates/comms/src/lib.rs

pub mod channel;
pub mod frames;
pub mod request;

pub use channel::{CLIENT_COMMS_FD, Comms, MAX_PASSED_FDS};
pub use frames::{Frame, FrameCodec, FrameHeader, Tag, UnknownTag};
pub use request::{
    FD_COMMS, FD_EXEC, FD_USER_NS, Message, SpawnPayload, SpawnReply, SpawnRequest,
};
