use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnchiveError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("could not open {} -- {}", .path.display(), .source)]
    Open { path: PathBuf, source: io::Error },

    #[error("{0}")]
    Malformed(String),

    #[error("wrong passphrase")]
    WrongPassphrase,

    #[error("archive checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid secret key or archive format")]
    InvalidRecipient,

    #[error("passphrases don't match")]
    PassphraseMismatch,

    #[error("operation would clobber {}", .0.display())]
    Clobber(PathBuf),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadArgument(String),

    #[error("secret key version mismatch -- expected {expected}, got {found}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("not enough memory for key derivation")]
    OutOfMemory,
}

pub type Result<T> = std::result::Result<T, EnchiveError>;
