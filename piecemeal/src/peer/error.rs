use std::fmt;

pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};

pub(crate) type Result<T, E = PeerError> = std::result::Result<T, E>;

/// Error type returned on failed peer sessions.
///
/// This error is non-fatal so it should not be grouped with the global `Error`
/// type as it may be recovered from: it only ever ends the session in which it
/// occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum PeerError {
    /// The channel on which some component in engine was listening or sending
    /// died.
    Channel,
    /// The connection was closed before the peer sent its handshake.
    NoHandshake,
    /// Peer's torrent info hash did not match ours.
    InvalidInfoHash,
    /// An IO error ocurred, which includes malformed frames.
    Io(std::io::Error),
}

impl fmt::Display for PeerError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use PeerError::*;
        match self {
            Channel => write!(fmt, "channel error"),
            NoHandshake => write!(fmt, "connection closed before handshake"),
            InvalidInfoHash => write!(fmt, "invalid info hash"),
            Io(e) => write!(fmt, "{}", e),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<IoError> for PeerError {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl<T> From<SendError<T>> for PeerError {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
