use std::fmt;

use crate::error::Error;

/// The disk IO result type.
pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type returned on failed torrent storage setup.
///
/// This error is non-fatal so it should not be grouped with the global `Error`
/// type as it may be recovered from.
#[derive(Debug)]
pub enum NewTorrentError {
    /// The file to download already exists in the download directory.
    AlreadyExists,
    /// The file to seed from does not have the length of the torrent.
    SourceLenMismatch { expected: u64, actual: u64 },
    /// IO error while allocating torrent.
    Io(std::io::Error),
}

impl From<std::io::Error> for NewTorrentError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AlreadyExists => {
                write!(fmt, "download file already exists")
            }
            Self::SourceLenMismatch { expected, actual } => write!(
                fmt,
                "source file is {} bytes long, expected {}",
                actual, expected
            ),
            Self::Io(e) => write!(fmt, "{}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {}

/// Error type returned on failed piece writes and on failure to assemble the
/// downloaded file.
///
/// This error is non-fatal so it should not be grouped with the global `Error`
/// type as it may be recovered from.
#[derive(Debug)]
pub(crate) enum WriteError {
    /// The piece index is invalid.
    InvalidPieceIndex,
    /// A piece file is missing or too short when assembling the download.
    MissingPiece(usize),
    /// An IO error ocurred.
    Io(std::io::Error),
}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(fmt, "invalid piece index"),
            Self::MissingPiece(index) => write!(fmt, "piece {} missing", index),
            Self::Io(e) => write!(fmt, "{}", e),
        }
    }
}

/// Error type returned on failed block reads.
///
/// This error is non-fatal so it should not be grouped with the global `Error`
/// type as it may be recovered from.
#[derive(Debug)]
pub(crate) enum ReadError {
    /// The block's piece index is invalid.
    InvalidPieceIndex,
    /// The block's offset or length in piece is invalid.
    InvalidBlockOffset,
    /// The block is valid within torrent but its data has not been downloaded
    /// yet or has been deleted.
    DataMissing,
    /// An IO error ocurred.
    Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::UnexpectedEof => {
                Self::DataMissing
            }
            _ => Self::Io(e),
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(fmt, "invalid piece index"),
            Self::InvalidBlockOffset => write!(fmt, "invalid block offset"),
            Self::DataMissing => write!(fmt, "torrent data missing"),
            Self::Io(e) => write!(fmt, "{}", e),
        }
    }
}
