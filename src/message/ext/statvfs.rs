/*
statvfs@openssh.com / fstatvfs@openssh.com reply, carried as the `data` of
SSH_FXP_EXTENDED_REPLY:
| u64: f_bsize | u64: f_frsize | u64: f_blocks | u64: f_bfree | u64: f_bavail
| u64: f_files | u64: f_ffree | u64: f_favail | u64: f_fsid | u64: f_flag
| u64: f_namemax | u64: reserved |

The request side carries only a path (statvfs@openssh.com) or a handle
(fstatvfs@openssh.com), both already representable as `Path`/`Handle`.

ST_RDONLY and ST_NOSUID are the only bits OpenSSH defines for `f_flag`.
*/

use crate::decode::SftpDecode;
use crate::encode::SftpEncode;
use crate::CodecError as Error;

pub const ST_RDONLY: u64 = 0x1;
pub const ST_NOSUID: u64 = 0x2;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct StatVfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u64,
}

impl StatVfs {
    pub fn is_readonly(&self) -> bool {
        self.flag & ST_RDONLY != 0
    }
}

impl SftpDecode for StatVfs {
    fn decode(buf: &mut dyn bytes::Buf) -> Result<Self, Error> {
        let bsize = u64::decode(buf)?;
        let frsize = u64::decode(buf)?;
        let blocks = u64::decode(buf)?;
        let bfree = u64::decode(buf)?;
        let bavail = u64::decode(buf)?;
        let files = u64::decode(buf)?;
        let ffree = u64::decode(buf)?;
        let favail = u64::decode(buf)?;
        let fsid = u64::decode(buf)?;
        let flag = u64::decode(buf)?;
        let namemax = u64::decode(buf)?;
        let _reserved = u64::decode(buf)?;

        Ok(StatVfs {
            bsize,
            frsize,
            blocks,
            bfree,
            bavail,
            files,
            ffree,
            favail,
            fsid,
            flag,
            namemax,
        })
    }
}

impl SftpEncode for &StatVfs {
    fn encode(self, buf: &mut dyn bytes::BufMut) -> Result<(), Error> {
        self.bsize.encode(buf)?;
        self.frsize.encode(buf)?;
        self.blocks.encode(buf)?;
        self.bfree.encode(buf)?;
        self.bavail.encode(buf)?;
        self.files.encode(buf)?;
        self.ffree.encode(buf)?;
        self.favail.encode(buf)?;
        self.fsid.encode(buf)?;
        self.flag.encode(buf)?;
        self.namemax.encode(buf)?;
        0u64.encode(buf)?;

        Ok(())
    }
}
