/*
fsync@openssh.com request, carried as the `data` of SSH_FXP_EXTENDED:
(HANDLE) | u32: handle length | u8[handle length]: handle |
-> STATUS
*/

use crate::decode::SftpDecode;
use crate::encode::SftpEncode;
use crate::message::Handle;
use crate::CodecError as Error;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Fsync {
    pub handle: Handle,
}

impl SftpDecode for Fsync {
    fn decode(buf: &mut dyn bytes::Buf) -> Result<Self, Error> {
        let handle = Handle::decode(buf)?;
        Ok(Fsync { handle })
    }
}

impl SftpEncode for &Fsync {
    fn encode(self, buf: &mut dyn bytes::BufMut) -> Result<(), Error> {
        self.handle.encode(buf)?;
        Ok(())
    }
}
