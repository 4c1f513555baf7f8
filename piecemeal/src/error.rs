pub use serde_bencode::Error as BencodeError;
pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};

use std::fmt;

pub use crate::{disk::NewTorrentError, tracker::TrackerError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The engine level error type.
///
/// Errors that only concern a single peer session never end up here: those are
/// logged and terminate the session.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Holds bencode serialization or deserialization related errors.
    Bencode(BencodeError),
    /// The channel on which some component in engine was listening or sending
    /// died.
    Channel,
    /// The torrent metainfo is not semantically valid.
    InvalidMetainfo,
    /// The `pieces` field of the metainfo is not a multiple of 20.
    InvalidPieces,
    /// A piece index is past the last piece of the torrent.
    InvalidPieceIndex,
    /// Only single file torrents are supported.
    MultiFileUnsupported,
    /// Neither explicit seeds nor the tracker produced any peers.
    NoPeers,
    /// The torrent's storage could not be set up.
    Storage(NewTorrentError),
    /// The tracker could not be contacted or returned an error.
    Tracker(TrackerError),
    /// An IO error ocurred.
    Io(IoError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            Bencode(e) => write!(f, "{}", e),
            Channel => write!(f, "channel error"),
            InvalidMetainfo => write!(f, "invalid metainfo"),
            InvalidPieces => write!(f, "invalid pieces field in metainfo"),
            InvalidPieceIndex => write!(f, "invalid piece index"),
            MultiFileUnsupported => {
                write!(f, "multi-file torrents are not supported")
            }
            NoPeers => write!(f, "no peers to download from"),
            Storage(e) => write!(f, "storage error: {}", e),
            Tracker(e) => write!(f, "tracker error: {}", e),
            Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use Error::*;
        match self {
            Bencode(e) => Some(e),
            Io(e) => Some(e),
            Storage(e) => Some(e),
            Tracker(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Self::Io(e)
    }
}

impl From<BencodeError> for Error {
    fn from(e: BencodeError) -> Self {
        Self::Bencode(e)
    }
}

impl From<TrackerError> for Error {
    fn from(e: TrackerError) -> Self {
        Self::Tracker(e)
    }
}

impl From<NewTorrentError> for Error {
    fn from(e: NewTorrentError) -> Self {
        Self::Storage(e)
    }
}

impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Self::Channel
    }
}
