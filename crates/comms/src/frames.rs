// crates/comms/src/frames.rs
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Read, Write};

pub trait FrameCodec: Sized {
    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()>;
    fn decode<R: Read>(r: &mut R) -> io::Result<Self>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Spawn = 0,
    Reply = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownTag(pub u8);

impl fmt::Display for UnknownTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown tag {}", self.0)
    }
}

impl std::error::Error for UnknownTag {}

impl From<UnknownTag> for io::Error {
    fn from(e: UnknownTag) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

impl TryFrom<u8> for Tag {
    type Error = UnknownTag;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Tag::Spawn),
            1 => Ok(Tag::Reply),
            other => Err(UnknownTag(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub tag: Tag,
    pub len: u32,
}

impl FrameHeader {
    pub fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.tag as u8)?;
        w.write_u32::<BigEndian>(self.len)?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let tag_byte = r.read_u8()?;
        let tag = Tag::try_from(tag_byte).map_err(io::Error::from)?;
        let len = r.read_u32::<BigEndian>()?;
        Ok(FrameHeader { tag, len })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(tag: Tag, payload: Vec<u8>) -> Self {
        Frame {
            header: FrameHeader {
                tag,
                len: payload.len() as u32,
            },
            payload,
        }
    }
}

impl FrameCodec for Frame {
    fn encode<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.header.encode(w)?;
        w.write_all(&self.payload)
    }

    fn decode<R: Read>(r: &mut R) -> io::Result<Self> {
        let header = FrameHeader::decode(r)?;
        if header.len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {} bytes", header.len),
            ));
        }
        let mut payload = vec![0; header.len as usize];
        r.read_exact(&mut payload)?;
        Ok(Frame { header, payload })
    }
}

// Spawn requests are small; anything bigger is a framing error, not data.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;
