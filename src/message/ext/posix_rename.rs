/*
posix-rename@openssh.com request, carried as the `data` of SSH_FXP_EXTENDED:
| u32: old path length | u8[old path length]: old path | u32: new path length | u8[new path length]: new path |
-> STATUS
*/

use bytes::Bytes;

use crate::decode::SftpDecode;
use crate::encode::SftpEncode;
use crate::CodecError as Error;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PosixRename {
    pub old_path: Bytes,
    pub new_path: Bytes,
}

impl SftpDecode for PosixRename {
    fn decode(buf: &mut dyn bytes::Buf) -> Result<Self, Error> {
        let old_path = Bytes::decode(buf)?;
        let new_path = Bytes::decode(buf)?;
        Ok(PosixRename { old_path, new_path })
    }
}

impl SftpEncode for &PosixRename {
    fn encode(self, buf: &mut dyn bytes::BufMut) -> Result<(), Error> {
        self.old_path.encode(buf)?;
        self.new_path.encode(buf)?;
        Ok(())
    }
}
