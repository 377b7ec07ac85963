pub mod byte_pipe;
pub mod compression;
pub mod crypt_config;
pub mod error;
pub mod sha;
pub mod uri;

pub use error::{Error, ErrorKind, Result};
