//! Error types that can be emitted from this library

use std::io;

use thiserror::Error;

/// Generic result type with ZipError as its error variant
pub type ZipResult<T> = Result<T, ZipError>;

/// Error type for Zip
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ZipError {
    /// An Error caused by I/O
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The archive is malformed: a required signature is missing or a
    /// header field is out of range
    #[error("invalid ZIP archive: {0}")]
    BadFormat(&'static str),

    /// The entry requires a password and none was supplied
    #[error("entry is encrypted and no password was supplied")]
    Encrypted,

    /// The supplied password does not match the entry's verification value
    #[error("invalid password")]
    InvalidPassword,

    /// An AES extra field requests an encryption strength other than
    /// AES-256
    #[error("unsupported encryption: {0}")]
    UnsupportedEncryption(&'static str),

    /// The stored compression method is not STORE, DEFLATE, or the AES
    /// wrapper
    #[error("unsupported compression method {0}")]
    UnsupportedCompression(u16),

    /// CRC-32 or HMAC verification failed at the end of an entry
    #[error("invalid signature: {0}")]
    InvalidSignature(&'static str),

    /// The writer already holds an entry with this name
    #[error("duplicated entry name: {0}")]
    DuplicatedName(String),

    /// The archive comment does not fit the 16-bit length field
    #[error("zip comment is too long ({0} bytes)")]
    ZipCommentTooLong(usize),

    /// An HTTP range source reported a non-success status
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    /// An HTTP source does not accept range requests
    #[error("HTTP server does not support range requests")]
    HttpRangeUnsupported,

    /// Mutually exclusive configuration options were both set
    #[error("configuration error: {0}")]
    Configuration(&'static str),
}

impl ZipError {
    pub(crate) fn io_other(message: &'static str) -> ZipError {
        ZipError::Io(io::Error::new(io::ErrorKind::Other, message))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(
            ZipError::DuplicatedName("a.txt".into()).to_string(),
            "duplicated entry name: a.txt"
        );
        assert_eq!(
            ZipError::BadFormat("missing end of central directory").to_string(),
            "invalid ZIP archive: missing end of central directory"
        );
    }
}
