use bytes::{Buf, Bytes};

use crate::decode::SftpDecode;
use crate::encode::SftpEncode;
use crate::CodecError as Error;

mod attrs;
mod data;
mod extended_reply;
mod extended_request;
mod handle;
mod name;
mod open;
mod path;
mod read;
mod rename;
mod status;
mod symlink;
mod version;
mod write;

pub mod ext;

pub use attrs::{ExtendedAttr, FileAttrs, FileOwner, FilePermisions, FileTime};
pub use data::Data;
pub use extended_reply::ExtendedReply;
pub use extended_request::ExtendedRequest;
pub use handle::{Handle, HandleAttrs};
pub use name::{Name, SingleName};
pub use open::{Open, PFlags};
pub use path::{Path, PathAttrs};
pub use read::Read;
pub use rename::Rename;
pub use status::{Status, StatusCode};
pub use symlink::Symlink;
pub use version::Version;
pub use write::Write;

pub type Init = Version;
pub type Close = Handle;
pub type LStat = Path;
pub type FStat = Handle;
pub type SetStat = PathAttrs;
pub type FSetStat = HandleAttrs;
pub type OpenDir = Path;
pub type ReadDir = Handle;
pub type Remove = Path;
pub type MkDir = PathAttrs;
pub type RmDir = Path;
pub type RealPath = Path;
pub type Stat = Path;
pub type ReadLink = Path;

#[derive(Debug, PartialEq, Eq, Clone)]
#[repr(u8)]
#[non_exhaustive]
pub enum Message {
    Init(Init) = 1,
    Version(Version) = 2,
    Open(Open) = 3,
    Close(Close) = 4,
    Read(Read) = 5,
    Write(Write) = 6,
    LStat(LStat) = 7,
    FStat(FStat) = 8,
    SetStat(SetStat) = 9,
    FSetStat(FSetStat) = 10,
    OpenDir(OpenDir) = 11,
    ReadDir(ReadDir) = 12,
    Remove(Remove) = 13,
    MkDir(MkDir) = 14,
    RmDir(RmDir) = 15,
    RealPath(RealPath) = 16,
    Stat(Stat) = 17,
    Rename(Rename) = 18,
    ReadLink(ReadLink) = 19,
    Symlink(Symlink) = 20,

    Status(Status) = 101,
    Handle(Handle) = 102,
    Data(Data) = 103,
    Name(Name) = 104,
    Attrs(FileAttrs) = 105,

    Extended(ExtendedRequest) = 200,
    ExtendedReply(ExtendedReply) = 201,
}

/// Wire type of `SSH_FXP_STATUS`, called out by name since every response
/// handler treats it specially regardless of the descriptor's respond mode.
pub(crate) const STATUS_KIND: u8 = 101;
/// Wire type of `SSH_FXP_DATA`, the one bulk-payload response manual-respond
/// descriptors stream directly off the transport.
pub(crate) const DATA_KIND: u8 = 103;

impl Message {
    fn kind(&self) -> u8 {
        match self {
            Self::Init(_) => 1,
            Self::Version(_) => 2,
            Self::Open(_) => 3,
            Self::Close(_) => 4,
            Self::Read(_) => 5,
            Self::Write(_) => 6,
            Self::LStat(_) => 7,
            Self::FStat(_) => 8,
            Self::SetStat(_) => 9,
            Self::FSetStat(_) => 10,
            Self::OpenDir(_) => 11,
            Self::ReadDir(_) => 12,
            Self::Remove(_) => 13,
            Self::MkDir(_) => 14,
            Self::RmDir(_) => 15,
            Self::RealPath(_) => 16,
            Self::Stat(_) => 17,
            Self::Rename(_) => 18,
            Self::ReadLink(_) => 19,
            Self::Symlink(_) => 20,
            Self::Status(_) => 101,
            Self::Handle(_) => 102,
            Self::Data(_) => 103,
            Self::Name(_) => 104,
            Self::Attrs(_) => 105,
            Self::Extended(_) => 200,
            Self::ExtendedReply(_) => 201,
        }
    }

    pub fn encode(&self, id: u32) -> Result<Bytes, Error> {
        let mut vec = Vec::with_capacity(16);

        let buf = &mut vec;

        // Reserve space for frame length
        u32::encode(0, buf)?;

        // Type of the message
        self.kind().encode(buf)?;

        // ID of the message or the version of the protocol
        match self {
            Self::Init(inner) => inner.version.encode(buf)?,
            Self::Version(inner) => inner.version.encode(buf)?,
            _ => id.encode(buf)?,
        }

        // Encode the rest of the frame
        match self {
            Self::Init(inner) => inner.encode(buf)?,
            Self::Version(inner) => inner.encode(buf)?,
            Self::Open(inner) => inner.encode(buf)?,
            Self::Close(inner) => inner.encode(buf)?,
            Self::Read(inner) => inner.encode(buf)?,
            Self::Write(inner) => inner.encode(buf)?,
            Self::LStat(inner) => inner.encode(buf)?,
            Self::FStat(inner) => inner.encode(buf)?,
            Self::SetStat(inner) => inner.encode(buf)?,
            Self::FSetStat(inner) => inner.encode(buf)?,
            Self::OpenDir(inner) => inner.encode(buf)?,
            Self::ReadDir(inner) => inner.encode(buf)?,
            Self::Remove(inner) => inner.encode(buf)?,
            Self::MkDir(inner) => inner.encode(buf)?,
            Self::RmDir(inner) => inner.encode(buf)?,
            Self::RealPath(inner) => inner.encode(buf)?,
            Self::Stat(inner) => inner.encode(buf)?,
            Self::Rename(inner) => inner.encode(buf)?,
            Self::ReadLink(inner) => inner.encode(buf)?,
            Self::Symlink(inner) => inner.encode(buf)?,
            Self::Status(inner) => inner.encode(buf)?,
            Self::Handle(inner) => inner.encode(buf)?,
            Self::Data(inner) => inner.encode(buf)?,
            Self::Name(inner) => inner.as_slice().encode(buf)?,
            Self::Attrs(inner) => inner.encode(buf)?,
            Self::Extended(inner) => inner.encode(buf)?,
            Self::ExtendedReply(inner) => inner.encode(buf)?,
        }

        // write frame length at the beginning of the frame
        let frame_length = (vec.len() - 4) as u32;
        let mut buf = vec.as_mut_slice();
        frame_length.encode(&mut buf)?;

        Ok(vec.into())
    }

    /// Reads the 9-byte prefix every frame begins with: length, type, and
    /// id (or, for `INIT`/`VERSION`, the protocol version in the id slot).
    /// Leaves the rest of the frame's bytes in `buf` for
    /// [`Message::decode_payload`].
    pub(crate) fn decode_header(buf: &mut dyn Buf) -> Result<(u32, u8, u32), Error> {
        let frame_length = u32::decode(buf)?;
        let kind = u8::decode(buf)?;
        let id = u32::decode(buf)?;
        Ok((frame_length, kind, id))
    }

    /// Decodes the remainder of a frame given the type and id/version
    /// already read via [`Message::decode_header`]. `buf` must carry exactly
    /// the frame's remaining bytes.
    pub(crate) fn decode_payload(kind: u8, id: u32, buf: &mut dyn Buf) -> Result<(u32, Self), Error> {
        match kind {
            1 => {
                let mut init = Init::decode(buf)?;
                init.version = id;
                Ok((0, Self::Init(init)))
            }
            2 => {
                let mut version = Version::decode(buf)?;
                version.version = id;
                Ok((0, Self::Version(version)))
            }
            3 => Ok((id, Self::Open(SftpDecode::decode(buf)?))),
            4 => Ok((id, Self::Close(SftpDecode::decode(buf)?))),
            5 => Ok((id, Self::Read(SftpDecode::decode(buf)?))),
            6 => Ok((id, Self::Write(SftpDecode::decode(buf)?))),
            7 => Ok((id, Self::LStat(SftpDecode::decode(buf)?))),
            8 => Ok((id, Self::FStat(SftpDecode::decode(buf)?))),
            9 => Ok((id, Self::SetStat(SftpDecode::decode(buf)?))),
            10 => Ok((id, Self::FSetStat(SftpDecode::decode(buf)?))),
            11 => Ok((id, Self::OpenDir(SftpDecode::decode(buf)?))),
            12 => Ok((id, Self::ReadDir(SftpDecode::decode(buf)?))),
            13 => Ok((id, Self::Remove(SftpDecode::decode(buf)?))),
            14 => Ok((id, Self::MkDir(SftpDecode::decode(buf)?))),
            15 => Ok((id, Self::RmDir(SftpDecode::decode(buf)?))),
            16 => Ok((id, Self::RealPath(SftpDecode::decode(buf)?))),
            17 => Ok((id, Self::Stat(SftpDecode::decode(buf)?))),
            18 => Ok((id, Self::Rename(SftpDecode::decode(buf)?))),
            19 => Ok((id, Self::ReadLink(SftpDecode::decode(buf)?))),
            20 => Ok((id, Self::Symlink(SftpDecode::decode(buf)?))),
            101 => Ok((id, Self::Status(SftpDecode::decode(buf)?))),
            102 => Ok((id, Self::Handle(SftpDecode::decode(buf)?))),
            103 => Ok((id, Self::Data(SftpDecode::decode(buf)?))),
            104 => Ok((id, Self::Name(SftpDecode::decode(buf)?))),
            105 => Ok((id, Self::Attrs(SftpDecode::decode(buf)?))),
            200 => Ok((id, Self::Extended(SftpDecode::decode(buf)?))),
            201 => Ok((id, Self::ExtendedReply(SftpDecode::decode(buf)?))),
            _ => Err(Error),
        }
    }

    pub fn decode(buf: &mut dyn Buf) -> Result<(u32, Self), Error> {
        let (frame_length, kind, id) = Self::decode_header(buf)?;

        // Limit the read to this very frame
        let mut buf = buf.take(frame_length.saturating_sub(5) as usize);
        Self::decode_payload(kind, id, &mut buf)
    }
}

impl From<Error> for Message {
    fn from(_: Error) -> Self {
        Message::Status(Status {
            code: StatusCode::BadMessage as u32,
            error: "Bad Message".into(),
            language: "en".into(),
        })
    }
}

impl From<std::io::Error> for Message {
    fn from(value: std::io::Error) -> Self {
        Self::Status(value.into())
    }
}

#[cfg(feature = "russh")]
impl From<russh::Error> for Message {
    fn from(value: russh::Error) -> Self {
        let status = match value {
            russh::Error::IO(io) => Status::from(io),
            other => StatusCode::Failure.to_status(other.to_string().into()),
        };
        Self::Status(status)
    }
}

macro_rules! strong_alias {
    ($new:ident: $existing:ty) => {
        #[derive(Debug, PartialEq, Eq, Clone)]
        pub struct $new($existing);

        impl crate::decode::SftpDecode for $new {
            fn decode(buf: &mut dyn bytes::Buf) -> Result<Self, crate::CodecError> {
                Ok($new(<$existing>::decode(buf)?))
            }
        }

        impl crate::encode::SftpEncode for &$new {
            fn encode(self, buf: &mut dyn bytes::BufMut) -> Result<(), crate::CodecError> {
                self.0.encode(buf)
            }
        }
    };
}

pub(self) use strong_alias;
