use std::io;
use thiserror::Error;

/// Errors surfacing from the RDT layer.
///
/// `Integrity` and `Format` are scoped to a single datagram: the listener and the sender
///  log them and move on. `Transport` ends the loop that owns the failing socket, and
///  `ProtocolTimeout` ends one transfer without affecting any other.
#[derive(Debug, Error)]
pub enum RdtError {
    #[error("checksum mismatch")]
    Integrity,

    #[error("malformed datagram: {0}")]
    Format(String),

    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("no acknowledgement: {0}")]
    ProtocolTimeout(String),
}

impl RdtError {
    pub fn format(msg: impl Into<String>) -> RdtError {
        RdtError::Format(msg.into())
    }
}
