//! Typed helpers for the inner payload of `SSH_FXP_EXTENDED` / `SSH_FXP_EXTENDED_REPLY`
//! frames, for the extensions this engine understands:
//! `posix-rename@openssh.com`, `hardlink@openssh.com`, `statvfs@openssh.com`,
//! `fstatvfs@openssh.com` and `fsync@openssh.com`.
//!
//! The outer [`super::Message::Extended`]/[`super::Message::ExtendedReply`] variants only
//! carry a request name and an opaque data blob; these helpers encode/decode that blob.

mod fsync;
mod hardlink;
mod posix_rename;
mod statvfs;

pub use fsync::Fsync;
pub use hardlink::Hardlink;
pub use posix_rename::PosixRename;
pub use statvfs::StatVfs;

pub const POSIX_RENAME: &str = "posix-rename@openssh.com";
pub const HARDLINK: &str = "hardlink@openssh.com";
pub const STATVFS: &str = "statvfs@openssh.com";
pub const FSTATVFS: &str = "fstatvfs@openssh.com";
pub const FSYNC: &str = "fsync@openssh.com";
