/*
SSH_FXP_ATTRS: 105
| u32: id | u32: attr flags | {if size in flags} u64: size | {if uid/gid in flags} u32 : uid | {if uid/gid in flags} u32 : gid | {if perm in flags} u32: perms | {if acmodtime in flags} u32: atime | {if acmodtime in flags} u32: mtime |

    Flags:
        SIZE: 0x00000001
        UIDGID: 0x00000002
        PERMISSIONS: 0x00000004
        ACMODTIME: 0x00000008

    File type: (on permission)
        FIFO: 0x1000
        CHR: 0x2000
        DIR: 0x4000
        BLK: 0x6000
        REG: 0x8000
        LNK: 0xA000
        NAM: 0x5000
 */

use bytes::Bytes;

use crate::decode::SftpDecode;
use crate::encode::SftpEncode;
use crate::CodecError as Error;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u32)]
#[non_exhaustive]
pub enum FilePermisions {
    // Permissions for others
    OX = 0x0001,
    OW = 0x0002,
    OR = 0x0004,
    // Permissions for group
    GX = 0x0008,
    GW = 0x0010,
    GR = 0x0020,
    // Permissions for user
    UX = 0x0040,
    UW = 0x0080,
    UR = 0x0100,
    // Special permissions
    SX = 0x0200,
    SW = 0x0400,
    SR = 0x0800,
    // File type
    FIFO = 0x1000,
    CHR = 0x2000,
    DIR = 0x4000,
    BLK = 0x6000,
    REG = 0x8000,
    LNK = 0xA000,
    NAM = 0x5000,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FileOwner {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FileTime {
    pub atime: u32,
    pub mtime: u32,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ExtendedAttr {
    pub ty: Bytes,
    pub data: Bytes,
}

#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub owner: Option<FileOwner>,
    pub perms: Option<u32>,
    pub time: Option<FileTime>,
    pub extended: Vec<ExtendedAttr>,
}

impl FileAttrs {
    /// File-type nibble at 0xF000 of `perms`, or 0 if perms are unknown.
    pub fn file_type(&self) -> u32 {
        self.perms.unwrap_or(0) & 0xF000
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FilePermisions::DIR as u32
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == FilePermisions::LNK as u32
    }

    pub fn is_regular(&self) -> bool {
        self.file_type() == FilePermisions::REG as u32
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u32)]
#[non_exhaustive]
enum AttrFlags {
    Size = 0x00000001,
    Owner = 0x00000002,
    Perms = 0x00000004,
    Time = 0x00000008,
    Extended = 0x80000000,
}

impl SftpDecode for FileAttrs {
    fn decode(buf: &mut dyn bytes::Buf) -> Result<Self, Error> {
        let mut attrs = FileAttrs::default();
        let attr_flags = u32::decode(buf)?;

        if (attr_flags & AttrFlags::Size as u32) != 0 {
            attrs.size = Some(u64::decode(buf)?);
        }
        if (attr_flags & AttrFlags::Owner as u32) != 0 {
            let uid = u32::decode(buf)?;
            let gid = u32::decode(buf)?;
            attrs.owner = Some(FileOwner { uid, gid });
        }
        if (attr_flags & AttrFlags::Perms as u32) != 0 {
            attrs.perms = Some(u32::decode(buf)?);
        }
        if (attr_flags & AttrFlags::Time as u32) != 0 {
            let atime = u32::decode(buf)?;
            let mtime = u32::decode(buf)?;
            attrs.time = Some(FileTime { atime, mtime });
        }
        if (attr_flags & AttrFlags::Extended as u32) != 0 {
            let count = u32::decode(buf)?;
            attrs.extended.reserve(count as usize);
            for _ in 0..count {
                let ty = Bytes::decode(buf)?;
                let data = Bytes::decode(buf)?;
                attrs.extended.push(ExtendedAttr { ty, data });
            }
        }

        Ok(attrs)
    }
}

impl SftpEncode for &FileAttrs {
    fn encode(self, buf: &mut dyn bytes::BufMut) -> Result<(), Error> {
        let mut attr_flags = 0u32;

        if self.size.is_some() {
            attr_flags |= AttrFlags::Size as u32;
        }
        if self.owner.is_some() {
            attr_flags |= AttrFlags::Owner as u32;
        }
        if self.perms.is_some() {
            attr_flags |= AttrFlags::Perms as u32;
        }
        if self.time.is_some() {
            attr_flags |= AttrFlags::Time as u32;
        }
        if !self.extended.is_empty() {
            attr_flags |= AttrFlags::Extended as u32;
        }

        attr_flags.encode(buf)?;

        if let Some(size) = self.size {
            size.encode(buf)?;
        }
        if let Some(owner) = self.owner {
            owner.uid.encode(buf)?;
            owner.gid.encode(buf)?;
        }
        if let Some(perms) = self.perms {
            perms.encode(buf)?;
        }
        if let Some(time) = self.time {
            time.atime.encode(buf)?;
            time.mtime.encode(buf)?;
        }
        if !self.extended.is_empty() {
            (self.extended.len() as u32).encode(buf)?;
            for ext in &self.extended {
                ext.ty.encode(buf)?;
                ext.data.encode(buf)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(attrs: &FileAttrs) -> FileAttrs {
        let mut buf = Vec::new();
        attrs.encode(&mut buf).unwrap();
        let mut slice = buf.as_slice();
        FileAttrs::decode(&mut slice).unwrap()
    }

    #[test]
    fn roundtrips_every_selected_field() {
        let attrs = FileAttrs {
            size: Some(42),
            owner: Some(FileOwner { uid: 1000, gid: 1000 }),
            perms: Some(0o100644),
            time: Some(FileTime { atime: 10, mtime: 20 }),
            extended: vec![ExtendedAttr {
                ty: Bytes::from_static(b"foo"),
                data: Bytes::from_static(b"bar"),
            }],
        };
        assert_eq!(roundtrip(&attrs), attrs);
    }

    #[test]
    fn roundtrips_empty_attrs() {
        let attrs = FileAttrs::default();
        assert_eq!(roundtrip(&attrs), attrs);
    }

    #[test]
    fn file_type_classification() {
        let mut attrs = FileAttrs {
            perms: Some(FilePermisions::DIR as u32 | 0o755),
            ..Default::default()
        };
        assert!(attrs.is_dir());
        attrs.perms = Some(FilePermisions::REG as u32 | 0o644);
        assert!(attrs.is_regular());
    }
}
