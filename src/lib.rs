mod client;
mod config;
mod conn;
mod decode;
mod descriptor;
mod encode;
mod error;
mod file;
mod message;

pub use client::{ClientBuilder, Dir, FilterDecision, SftpClient};
pub use config::{ClientConfig, ClientConfigBuilder, StatStrategy, MIN_MAX_PACKET};
pub use error::{CodecError, Error};
pub use file::File;
pub use message::*;
