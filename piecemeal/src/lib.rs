#[macro_use]
extern crate serde_derive;

pub mod alert;
pub mod bitfield;
pub mod conf;
mod disk;
mod download;
pub mod engine;
pub mod error;
pub mod metainfo;
mod peer;
mod piece_picker;
pub mod prelude;
mod scheduler;
mod storage_info;
mod torrent;
mod tracker;

pub use peer::{PeerError, Role};
pub use piece_picker::PieceState;
pub use torrent::stats::Progress;

/// The 20 byte arbitrary id of a BitTorrent client, advertised to peers and
/// trackers.
pub type PeerId = [u8; 20];
pub type Sha1Hash = [u8; 20];

/// The zero-based index of a piece in torrent.
pub type PieceIndex = usize;

/// This is the only block length we're dealing with: every block is this long,
/// except possibly the last block of a piece.
pub(crate) const BLOCK_LEN: u32 = 16000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes.
    pub len: u32,
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // all but the last block are exactly the block length, but the last one
    // may be shorter so we need to account for this by rounding up before
    // dividing
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}

/// Returns the length of the block at the given index in a piece of the given
/// length.
pub(crate) fn block_len(piece_len: u32, block_index: usize) -> u32 {
    let block_offset = block_index as u32 * BLOCK_LEN;
    debug_assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}
