use thiserror::Error;

use crate::ErrorCode;

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("TFTP error: {0}")]
    Tftp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0}")]
    Malformed(String),

    /// A protocol-level failure with an explicit TFTP error code attached,
    /// raised by an embedder's [`crate::session::Handler`] (e.g. a resolved
    /// path that doesn't exist, or one outside the served root) or by the
    /// session engine itself (unknown mode, peer abort, timeout budget).
    #[error("{1}")]
    Protocol(ErrorCode, String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TftpError {
    /// The TFTP error code and message this failure should be reported as,
    /// both to the peer (an ERROR datagram) and in `SessionStats::error`.
    /// Mirrors `fbtftp.base_handler.BaseHandler`'s `{code=1 if missing,
    /// else 0}` resolution-failure rule (spec.md §4.4.1) for errors that
    /// didn't already name an explicit code.
    pub fn as_protocol(&self) -> (ErrorCode, String) {
        match self {
            TftpError::Protocol(code, message) => (*code, message.clone()),
            TftpError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                (ErrorCode::FileNotFound, "File not found".to_string())
            }
            other => (ErrorCode::NotDefined, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TftpError>;
