use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{ClientConfig, ErrorHook};
use crate::conn::Connection;
use crate::decode::SftpDecode;
use crate::encode::SftpEncode;
use crate::error::Error;
use crate::file::File;
use crate::message::{
    ext, ExtendedRequest, FileAttrs, FileOwner, FileTime, Handle, Message, Name, Open, PFlags,
    PathAttrs, Rename, SingleName, Symlink,
};

/// Builds an [`SftpClient`], optionally installing a connection-loss callback
/// before performing the handshake.
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    on_error: Option<ErrorHook>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs a callback invoked from the reader task whenever the transport
    /// breaks or the server sends a malformed frame. Runs on the reader task, so
    /// it must not block.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub async fn connect<T>(self, io: T) -> Result<SftpClient, Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (conn, version) = Connection::connect(io, self.config.clone(), self.on_error).await?;
        let extensions = version.extensions.keys().cloned().collect();

        Ok(SftpClient {
            conn,
            config: self.config,
            extensions,
        })
    }

    #[cfg(feature = "russh")]
    pub async fn connect_russh(
        self,
        channel: russh::Channel<russh::client::Msg>,
    ) -> Result<SftpClient, Error> {
        let mut channel = channel;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(russh_to_error)?;
        self.connect(channel.into_stream()).await
    }
}

#[cfg(feature = "russh")]
fn russh_to_error(value: russh::Error) -> Error {
    match value {
        russh::Error::IO(io) => Error::Io(io),
        other => Error::Io(std::io::Error::new(std::io::ErrorKind::Other, other)),
    }
}

/// Client-side handle onto a single SFTP v3 session. Cheaply `Clone`-able;
/// every clone shares the same underlying connection and can issue requests
/// concurrently.
#[derive(Clone)]
pub struct SftpClient {
    pub(crate) conn: Connection,
    pub(crate) config: ClientConfig,
    pub(crate) extensions: Arc<BTreeSet<Bytes>>,
}

impl SftpClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub async fn connect<T>(io: T) -> Result<Self, Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::builder().connect(io).await
    }

    #[cfg(feature = "russh")]
    pub async fn connect_russh(channel: russh::Channel<russh::client::Msg>) -> Result<Self, Error> {
        Self::builder().connect_russh(channel).await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|ext| ext.as_ref() == name.as_bytes())
    }

    fn require_extension(&self, name: &'static str) -> Result<(), Error> {
        if self.supports_extension(name) {
            Ok(())
        } else {
            Err(Error::Unsupported(name))
        }
    }

    /// Has the server disconnected / has the reader task exited.
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    pub async fn closed(&self) {
        self.conn.closed().await
    }

    async fn expect_status(&self, message: Message) -> Result<(), Error> {
        match self.conn.request(message).await? {
            Message::Status(status) => status.to_result(()).map_err(Error::from),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    async fn expect_attrs(&self, message: Message) -> Result<FileAttrs, Error> {
        match self.conn.request(message).await? {
            Message::Attrs(attrs) => Ok(attrs),
            Message::Status(status) => Err(status.into()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    async fn expect_name(&self, message: Message) -> Result<Name, Error> {
        match self.conn.request(message).await? {
            Message::Name(name) => Ok(name),
            Message::Status(status) => Err(status.into()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    async fn expect_handle(&self, message: Message) -> Result<Handle, Error> {
        match self.conn.request(message).await? {
            Message::Handle(handle) => Ok(handle),
            Message::Status(status) => Err(status.into()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    async fn send_extended<T>(&self, name: &'static str, payload: &T) -> Result<Message, Error>
    where
        for<'a> &'a T: SftpEncode,
    {
        let mut buf = Vec::new();
        payload.encode(&mut buf)?;

        let request = Message::Extended(ExtendedRequest {
            request: Bytes::from_static(name.as_bytes()),
            data: Bytes::from(buf),
        });

        self.conn.request(request).await
    }

    async fn extended_status<T>(&self, name: &'static str, payload: &T) -> Result<(), Error>
    where
        for<'a> &'a T: SftpEncode,
    {
        match self.send_extended(name, payload).await? {
            Message::Status(status) => status.to_result(()).map_err(Error::from),
            Message::ExtendedReply(_) => Ok(()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    fn single_path(mut name: Name) -> Result<Bytes, Error> {
        if name.len() != 1 {
            return Err(Error::UnexpectedResponse);
        }
        Ok(name.remove(0).filename)
    }

    pub async fn stat(&self, path: impl Into<Bytes>) -> Result<FileAttrs, Error> {
        self.expect_attrs(Message::Stat(path.into())).await
    }

    pub async fn lstat(&self, path: impl Into<Bytes>) -> Result<FileAttrs, Error> {
        self.expect_attrs(Message::LStat(path.into())).await
    }

    pub async fn read_link(&self, path: impl Into<Bytes>) -> Result<Bytes, Error> {
        let name = self.expect_name(Message::ReadLink(path.into())).await?;
        Self::single_path(name)
    }

    pub async fn real_path(&self, path: impl Into<Bytes>) -> Result<Bytes, Error> {
        let name = self.expect_name(Message::RealPath(path.into())).await?;
        Self::single_path(name)
    }

    /// Resolves the server's notion of the current working directory, same as
    /// calling `real_path(".")`.
    pub async fn getwd(&self) -> Result<Bytes, Error> {
        self.real_path(Bytes::from_static(b".")).await
    }

    /// Creates `link_name` as a symlink pointing at `target`, i.e. the same
    /// argument order as `std::os::unix::fs::symlink`.
    ///
    /// OpenSSH's reference `sftp-server` swaps the two fields of
    /// `SSH_FXP_SYMLINK` when it unmarshals them, so every interoperable
    /// client sends `target` in the wire position nominally labeled
    /// "linkpath" and `link_name` in the one labeled "targetpath" to land in
    /// the server's actually-read fields. We bake that swap in here rather
    /// than pushing it onto callers.
    pub async fn symlink(
        &self,
        target: impl Into<Bytes>,
        link_name: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.expect_status(Message::Symlink(Symlink {
            link_path: target.into(),
            target_path: link_name.into(),
        }))
        .await
    }

    pub async fn rename(
        &self,
        old_path: impl Into<Bytes>,
        new_path: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.expect_status(Message::Rename(Rename {
            old_path: old_path.into(),
            new_path: new_path.into(),
        }))
        .await
    }

    /// Atomic same-filesystem rename via `posix-rename@openssh.com`, which
    /// unlike plain `SSH_FXP_RENAME` is allowed to overwrite an existing
    /// `new_path`.
    pub async fn posix_rename(
        &self,
        old_path: impl Into<Bytes>,
        new_path: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.require_extension(ext::POSIX_RENAME)?;
        let payload = ext::PosixRename {
            old_path: old_path.into(),
            new_path: new_path.into(),
        };
        self.extended_status(ext::POSIX_RENAME, &payload).await
    }

    /// Creates a hard link via `hardlink@openssh.com`.
    pub async fn link(
        &self,
        old_path: impl Into<Bytes>,
        new_path: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.require_extension(ext::HARDLINK)?;
        let payload = ext::Hardlink {
            old_path: old_path.into(),
            new_path: new_path.into(),
        };
        self.extended_status(ext::HARDLINK, &payload).await
    }

    pub async fn stat_vfs(&self, path: impl Into<Bytes>) -> Result<ext::StatVfs, Error> {
        self.require_extension(ext::STATVFS)?;
        let path: Bytes = path.into();
        match self.send_extended(ext::STATVFS, &path).await? {
            Message::ExtendedReply(reply) => {
                let mut slice = reply.data.as_ref();
                ext::StatVfs::decode(&mut slice).map_err(Error::from)
            }
            Message::Status(status) => Err(status.into()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Removes a file. OpenSSH's server (and some others) answer `REMOVE` on
    /// a directory with `FAILURE` rather than the more specific
    /// `FILE_IS_A_DIRECTORY`, so both codes -- along with `PERMISSION_DENIED`,
    /// which a handful of servers substitute for either -- fall back to a
    /// single `RMDIR` retry before giving up.
    pub async fn remove(&self, path: impl Into<Bytes>) -> Result<(), Error> {
        let path: Bytes = path.into();
        match self.expect_status(Message::Remove(path.clone())).await {
            Err(Error::Protocol(status)) if is_remove_retry_code(status.code) => {
                self.remove_directory(path).await
            }
            other => other,
        }
    }

    pub async fn mkdir(&self, path: impl Into<Bytes>) -> Result<(), Error> {
        self.mkdir_with_attrs(path, FileAttrs::default()).await
    }

    pub async fn mkdir_with_attrs(
        &self,
        path: impl Into<Bytes>,
        attrs: FileAttrs,
    ) -> Result<(), Error> {
        self.expect_status(Message::MkDir(PathAttrs {
            path: path.into(),
            attrs,
        }))
        .await
    }

    pub async fn remove_directory(&self, path: impl Into<Bytes>) -> Result<(), Error> {
        self.expect_status(Message::RmDir(path.into())).await
    }

    pub async fn chmod(&self, path: impl Into<Bytes>, perms: u32) -> Result<(), Error> {
        self.expect_status(Message::SetStat(PathAttrs {
            path: path.into(),
            attrs: FileAttrs {
                perms: Some(perms),
                ..Default::default()
            },
        }))
        .await
    }

    pub async fn chown(&self, path: impl Into<Bytes>, uid: u32, gid: u32) -> Result<(), Error> {
        self.expect_status(Message::SetStat(PathAttrs {
            path: path.into(),
            attrs: FileAttrs {
                owner: Some(FileOwner { uid, gid }),
                ..Default::default()
            },
        }))
        .await
    }

    pub async fn chtimes(
        &self,
        path: impl Into<Bytes>,
        atime: u32,
        mtime: u32,
    ) -> Result<(), Error> {
        self.expect_status(Message::SetStat(PathAttrs {
            path: path.into(),
            attrs: FileAttrs {
                time: Some(FileTime { atime, mtime }),
                ..Default::default()
            },
        }))
        .await
    }

    pub async fn truncate(&self, path: impl Into<Bytes>, size: u64) -> Result<(), Error> {
        self.expect_status(Message::SetStat(PathAttrs {
            path: path.into(),
            attrs: FileAttrs {
                size: Some(size),
                ..Default::default()
            },
        }))
        .await
    }

    async fn open_with_flags(
        &self,
        path: impl Into<Bytes>,
        pflags: u32,
        attrs: FileAttrs,
    ) -> Result<File, Error> {
        let path: Bytes = path.into();
        let handle = self
            .expect_handle(Message::Open(Open {
                filename: path.clone(),
                pflags,
                attrs,
            }))
            .await?;

        Ok(File::new(
            self.conn.clone(),
            path,
            handle,
            self.config.clone(),
            self.extensions.clone(),
        ))
    }

    pub async fn open(&self, path: impl Into<Bytes>) -> Result<File, Error> {
        self.open_with_flags(path, PFlags::READ as u32, FileAttrs::default())
            .await
    }

    /// Opens for writing, creating the file if absent and truncating it if
    /// present -- the usual meaning of "create" for an SFTP client.
    pub async fn create(&self, path: impl Into<Bytes>) -> Result<File, Error> {
        let pflags =
            PFlags::WRITE as u32 | PFlags::CREATE as u32 | PFlags::TRUNCATE as u32;
        self.open_with_flags(path, pflags, FileAttrs::default())
            .await
    }

    pub async fn open_dir(&self, path: impl Into<Bytes>) -> Result<Dir, Error> {
        let handle = self.expect_handle(Message::OpenDir(path.into())).await?;
        Ok(Dir {
            conn: self.conn.clone(),
            handle,
            buffer: Vec::new(),
            done: false,
        })
    }

    /// Drives a full `OPENDIR`/`READDIR*`/`CLOSE` loop and returns every entry
    /// the `filter` accepts, skipping `.` and `..` before the filter ever sees
    /// them. `deadline` bounds how long the loop may keep pulling pages from
    /// the server; it does not cancel an already-issued `READDIR`.
    pub async fn read_dir<F>(
        &self,
        path: impl Into<Bytes>,
        mut filter: F,
        deadline: Option<std::time::Instant>,
    ) -> Result<Vec<SingleName>, Error>
    where
        F: FnMut(&SingleName) -> FilterDecision,
    {
        let mut dir = self.open_dir(path).await?;
        let mut out = Vec::new();

        loop {
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    break;
                }
            }

            match dir.next_entry().await? {
                None => break,
                Some(entry) => {
                    if entry.filename.as_ref() == b"." || entry.filename.as_ref() == b".." {
                        continue;
                    }
                    match filter(&entry) {
                        FilterDecision::Accept => out.push(entry),
                        FilterDecision::Reject => {}
                        FilterDecision::Stop => break,
                    }
                }
            }
        }

        Ok(out)
    }

    /// Lists every entry of `path` other than `.`/`..`, with no filtering or
    /// deadline.
    pub async fn list_dir(&self, path: impl Into<Bytes>) -> Result<Vec<SingleName>, Error> {
        self.read_dir(path, |_| FilterDecision::Accept, None).await
    }

    /// Creates `path` and every missing ancestor directory, the way `mkdir -p`
    /// does. Existing directories along the way are not an error; an existing
    /// non-directory is.
    pub async fn mkdir_all(&self, path: impl AsRef<[u8]>) -> Result<(), Error> {
        let path = path.as_ref();

        match self.mkdir_idempotent(path).await? {
            None => return Ok(()),
            Some(no_such_file) => {
                let Some(parent_end) = path.iter().rposition(|&b| b == b'/').filter(|&i| i > 0)
                else {
                    return Err(no_such_file);
                };
                Box::pin(self.mkdir_all(&path[..parent_end])).await?;
            }
        }

        self.mkdir_idempotent(path).await?.map_or(Ok(()), |err| {
            // The parent was just created; a second NO_SUCH_FILE here would
            // mean the server is lying or racing with another remover.
            Err(err)
        })
    }

    /// Attempts `MKDIR` on `path`. Returns `Ok(None)` on success (including
    /// when `path` already exists as a directory), `Ok(Some(err))` when
    /// `path`'s parent is missing (`err` is the `NO_SUCH_FILE` the caller
    /// should surface if it has no parent left to create), or propagates any
    /// other failure -- including an existing non-directory at `path`, which
    /// must not be silently accepted as success.
    async fn mkdir_idempotent(&self, path: &[u8]) -> Result<Option<Error>, Error> {
        let path_bytes = Bytes::copy_from_slice(path);
        match self.mkdir(path_bytes.clone()).await {
            Ok(()) => Ok(None),
            Err(err) if is_no_such_file(&err) => Ok(Some(err)),
            Err(err) if is_already_exists(&err) => match self.stat(path_bytes).await {
                Ok(attrs) if attrs.is_dir() => Ok(None),
                _ => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Recursively removes `path`: files and symlinks are unlinked, directories
    /// are emptied depth-first and then removed. Reports the first error
    /// encountered but keeps trying to clean up siblings.
    pub async fn remove_all(&self, path: impl Into<Bytes>) -> Result<(), Error> {
        let path: Bytes = path.into();
        let attrs = match self.lstat(path.clone()).await {
            Ok(attrs) => attrs,
            Err(err) if is_no_such_file(&err) => return Ok(()),
            Err(err) => return Err(err),
        };

        if !attrs.is_dir() {
            return self.remove(path).await;
        }

        let mut dir = self.open_dir(path.clone()).await?;
        let mut first_error = None;

        loop {
            let entries = match dir.next_batch().await {
                Ok(entries) => entries,
                Err(Error::Protocol(status)) if status.is_eof() => break,
                Err(err) => {
                    first_error.get_or_insert(err);
                    break;
                }
            };
            if entries.is_empty() {
                break;
            }

            for entry in entries {
                if entry.filename.as_ref() == b"." || entry.filename.as_ref() == b".." {
                    continue;
                }
                let mut child = Vec::with_capacity(path.len() + 1 + entry.filename.len());
                child.extend_from_slice(&path);
                if !path.ends_with(b"/") {
                    child.push(b'/');
                }
                child.extend_from_slice(&entry.filename);

                let result = if entry.attrs.is_dir() {
                    Box::pin(self.remove_all(Bytes::from(child))).await
                } else {
                    self.remove(Bytes::from(child)).await
                };
                if let Err(err) = result {
                    first_error.get_or_insert(err);
                }
            }
        }

        drop(dir);

        if let Some(err) = first_error {
            return Err(err);
        }

        self.remove_directory(path).await
    }
}

/// Per-entry decision for [`SftpClient::read_dir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Keep the entry in the returned list.
    Accept,
    /// Drop the entry, keep paging.
    Reject,
    /// Drop the entry and stop paging immediately.
    Stop,
}

fn is_remove_retry_code(code: u32) -> bool {
    code == crate::StatusCode::Failure as u32
        || code == crate::StatusCode::FileIsADirectory as u32
        || code == crate::StatusCode::PermissionDenied as u32
}

fn is_no_such_file(err: &Error) -> bool {
    matches!(err, Error::Protocol(status) if status.code == crate::StatusCode::NoSuchFile as u32)
}

fn is_already_exists(err: &Error) -> bool {
    matches!(err, Error::Protocol(status) if status.code == crate::StatusCode::Failure as u32)
}

/// Open directory handle; yields batches of entries via repeated `READDIR`
/// requests until the server answers with an `EOF` status.
pub struct Dir {
    conn: Connection,
    handle: crate::message::Handle,
    buffer: Vec<crate::message::SingleName>,
    done: bool,
}

impl Dir {
    async fn next_batch(&mut self) -> Result<Vec<crate::message::SingleName>, Error> {
        match self.conn.request(Message::ReadDir(self.handle.clone())).await? {
            Message::Name(entries) => Ok(entries),
            Message::Status(status) => Err(status.into()),
            _ => Err(Error::UnexpectedResponse),
        }
    }

    /// Reads the next directory entry, transparently refilling from the server
    /// when the current batch is exhausted, and stopping at `EOF`.
    pub async fn next_entry(&mut self) -> Result<Option<crate::message::SingleName>, Error> {
        loop {
            if let Some(entry) = self.buffer.pop() {
                return Ok(Some(entry));
            }
            if self.done {
                return Ok(None);
            }

            match self.next_batch().await {
                Ok(mut entries) => {
                    entries.reverse();
                    self.buffer = entries;
                }
                Err(Error::Protocol(status)) if status.is_eof() => {
                    self.done = true;
                    return Ok(None);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Drop for Dir {
    fn drop(&mut self) {
        let conn = self.conn.clone();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let _ = conn.request(Message::Close(handle)).await;
        });
    }
}
