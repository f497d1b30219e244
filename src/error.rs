use crate::message::Status;

/// A frame that ran out of bytes, or whose length prefix made no sense.
///
/// Kept deliberately minimal: callers never need more detail than "this
/// buffer did not contain a well-formed SFTP frame" to classify it as
/// bad-message.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecError;

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("malformed or truncated SFTP frame")
    }
}

impl std::error::Error for CodecError {}

/// Errors surfaced by the engine to its callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] Status),

    #[error("connection lost")]
    ConnectionLost,

    #[error("operation on a closed file")]
    AlreadyClosed,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("short read followed by a full-size response")]
    MissingData,

    #[error("server sent an unexpected response type")]
    UnexpectedResponse,

    #[error("extension not supported by server: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// True for the terminal, connection-wide failure kind.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::ConnectionLost)
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(err) => err,
            Error::Protocol(status) => status.into(),
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}

#[cfg(feature = "russh")]
impl From<russh::Error> for Error {
    fn from(value: russh::Error) -> Self {
        match value {
            russh::Error::IO(io) => Error::Io(io),
            other => Error::Io(std::io::Error::new(std::io::ErrorKind::Other, other)),
        }
    }
}
