use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

use crate::{block_count, block_len, BlockInfo, PieceIndex, Sha1Hash, BLOCK_LEN};

/// The maximum number of block requests a piece download may have outstanding
/// at any given time.
pub(crate) const MAX_IN_FLIGHT_BLOCKS: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockState {
    Required,
    Downloading,
    Available,
}

#[derive(Debug)]
struct Block {
    state: BlockState,
    len: u32,
    /// Set once the block is received.
    data: Option<Vec<u8>>,
}

/// Tracks the completion of an ongoing piece download and is used to request
/// missing blocks in piece.
///
/// A piece download is handed out by the scheduler to exactly one peer
/// session, which owns it until the piece is confirmed, cancelled, or the
/// session ends.
#[derive(Debug)]
pub(crate) struct PieceDownload {
    /// The piece's index.
    index: PieceIndex,
    /// The piece's length in bytes.
    len: u32,
    /// The blocks in this piece mapped to their offset within the piece. The
    /// map is sorted so that blocks are requested and assembled in ascending
    /// offset order.
    blocks: BTreeMap<u32, Block>,
    /// The number of blocks that are requested but not yet received.
    in_flight: usize,
}

impl PieceDownload {
    /// Creates a new piece download instance for the given piece.
    pub fn new(index: PieceIndex, len: u32) -> Self {
        let blocks = (0..block_count(len))
            .map(|i| {
                (
                    i as u32 * BLOCK_LEN,
                    Block {
                        state: BlockState::Required,
                        len: block_len(len, i),
                        data: None,
                    },
                )
            })
            .collect();
        Self {
            index,
            len,
            blocks,
            in_flight: 0,
        }
    }

    /// Returns the piece's length in bytes (test-only accessor).
    #[cfg(test)]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Returns the index of the piece that is downloaded.
    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Picks the first block that hasn't been requested yet and marks it as
    /// requested.
    ///
    /// Returns `None` if all blocks are requested or if the number of
    /// outstanding requests reached [`MAX_IN_FLIGHT_BLOCKS`].
    pub fn next_block_to_request(&mut self) -> Option<BlockInfo> {
        if self.in_flight >= MAX_IN_FLIGHT_BLOCKS {
            log::trace!(
                "Piece {} has {} blocks in flight, not picking more",
                self.index,
                self.in_flight
            );
            return None;
        }

        let (offset, block) = self
            .blocks
            .iter_mut()
            .find(|(_, b)| b.state == BlockState::Required)?;
        block.state = BlockState::Downloading;
        self.in_flight += 1;

        let info = BlockInfo {
            piece_index: self.index,
            offset: *offset,
            len: block.len,
        };
        log::trace!("Picked block {:?}", info);
        Some(info)
    }

    /// Marks a block handed out by [`Self::next_block_to_request`] as not
    /// requested, for when its request could not be sent.
    pub fn cancel_request(&mut self, info: &BlockInfo) {
        match self.blocks.get_mut(&info.offset) {
            Some(block)
                if info.piece_index == self.index
                    && block.state == BlockState::Downloading =>
            {
                block.state = BlockState::Required;
                self.in_flight -= 1;
                log::trace!("Cancelled request for block {:?}", info);
            }
            _ => log::warn!("Cannot cancel request for block {:?}", info),
        }
    }

    /// Stores a received block and marks it as available.
    ///
    /// Blocks of another piece, at an offset that is not a block boundary,
    /// that were not requested (or were already received), or whose length
    /// doesn't match the block's are dropped. Returns whether the block was
    /// accepted.
    pub fn on_block_received(
        &mut self,
        index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> bool {
        if index != self.index {
            log::warn!(
                "Received block of piece {} for piece {} download",
                index,
                self.index
            );
            return false;
        }

        let block = match self.blocks.get_mut(&offset) {
            Some(block) => block,
            None => {
                log::warn!(
                    "Received block at invalid offset {} in piece {}",
                    offset,
                    self.index
                );
                return false;
            }
        };

        if block.state != BlockState::Downloading {
            log::warn!(
                "Received piece {} block at offset {} in state {:?}",
                self.index,
                offset,
                block.state
            );
            return false;
        }

        if data.len() != block.len as usize {
            log::warn!(
                "Received piece {} block at offset {} with length {}, expected {}",
                self.index,
                offset,
                data.len(),
                block.len
            );
            return false;
        }

        block.data = Some(data);
        block.state = BlockState::Available;
        self.in_flight -= 1;
        log::trace!("Received piece {} block at offset {}", self.index, offset);

        true
    }

    /// Returns true if the piece has all blocks downloaded.
    pub fn is_complete(&self) -> bool {
        self.blocks
            .values()
            .all(|b| b.state == BlockState::Available)
    }

    /// Returns the concatenation of the received blocks in ascending offset
    /// order.
    ///
    /// Only meaningful once the download is complete, missing blocks are
    /// skipped.
    pub fn assembled_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len as usize);
        for data in self.blocks.values().filter_map(|b| b.data.as_ref()) {
            buf.extend_from_slice(data);
        }
        buf
    }

    /// Returns the SHA-1 hash of the assembled piece.
    pub fn content_hash(&self) -> Sha1Hash {
        let mut hasher = Sha1::new();
        for data in self.blocks.values().filter_map(|b| b.data.as_ref()) {
            hasher.update(data);
        }
        let mut hash = [0; 20];
        hash.copy_from_slice(&hasher.finalize());
        hash
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    // Fills a block with bytes unique to its offset so that a wrong assembly
    // order changes the hash.
    fn make_block_data(info: &BlockInfo) -> Vec<u8> {
        (0..info.len)
            .map(|i| ((info.offset + i) % 251) as u8)
            .collect()
    }

    // Tests that the blocks of a piece are split at the block length with a
    // shorter last block.
    #[test]
    fn test_block_layout() {
        let piece_len = 2 * BLOCK_LEN + 100;
        let mut download = PieceDownload::new(3, piece_len);

        let mut blocks = Vec::new();
        while let Some(block) = download.next_block_to_request() {
            blocks.push(block);
        }

        assert_eq!(
            blocks,
            vec![
                BlockInfo {
                    piece_index: 3,
                    offset: 0,
                    len: BLOCK_LEN
                },
                BlockInfo {
                    piece_index: 3,
                    offset: BLOCK_LEN,
                    len: BLOCK_LEN
                },
                BlockInfo {
                    piece_index: 3,
                    offset: 2 * BLOCK_LEN,
                    len: 100
                },
            ]
        );
        let total: u32 = blocks.iter().map(|b| b.len).sum();
        assert_eq!(total, piece_len);
    }

    // Tests that no more than the maximum number of blocks are outstanding at
    // any time, and that receiving a block frees up a slot.
    #[test]
    fn test_in_flight_window() {
        let piece_len = 25 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);

        let mut requested = Vec::new();
        while let Some(block) = download.next_block_to_request() {
            requested.push(block);
        }
        assert_eq!(requested.len(), MAX_IN_FLIGHT_BLOCKS);
        assert_eq!(download.in_flight, MAX_IN_FLIGHT_BLOCKS);

        // blocks are picked in ascending offset order
        for (i, block) in requested.iter().enumerate() {
            assert_eq!(block.offset, i as u32 * BLOCK_LEN);
        }

        // receiving one block allows exactly one more request
        let first = requested[0];
        assert!(download.on_block_received(
            first.piece_index,
            first.offset,
            make_block_data(&first)
        ));
        let next = download.next_block_to_request().unwrap();
        assert_eq!(next.offset, MAX_IN_FLIGHT_BLOCKS as u32 * BLOCK_LEN);
        assert!(download.next_block_to_request().is_none());
        assert!(download.in_flight <= MAX_IN_FLIGHT_BLOCKS);
    }

    // Tests that receiving every block, in an order different from the request
    // order, completes the piece and hashes the blocks in offset order.
    #[test]
    fn test_receive_all_blocks_out_of_order() {
        let piece_len = 5 * BLOCK_LEN + 7;
        let mut download = PieceDownload::new(1, piece_len);

        let mut blocks = Vec::new();
        while let Some(block) = download.next_block_to_request() {
            blocks.push(block);
        }
        assert_eq!(blocks.len(), block_count(piece_len));

        let expected: Vec<u8> =
            blocks.iter().flat_map(make_block_data).collect();

        for i in [3, 0, 5, 1, 4, 2] {
            let block = blocks[i];
            assert!(!download.is_complete());
            assert!(download.on_block_received(
                block.piece_index,
                block.offset,
                make_block_data(&block)
            ));
        }

        assert!(download.is_complete());
        assert_eq!(download.in_flight, 0);
        assert_eq!(download.assembled_bytes(), expected);

        let mut expected_hash = [0; 20];
        expected_hash.copy_from_slice(&Sha1::digest(&expected));
        assert_eq!(download.content_hash(), expected_hash);

        // nothing left to request
        assert!(download.next_block_to_request().is_none());
    }

    // Tests that blocks that don't belong to the download or were not
    // requested are dropped without changing its state.
    #[test]
    fn test_reject_invalid_blocks() {
        let mut download = PieceDownload::new(2, 2 * BLOCK_LEN);

        // not yet requested
        assert!(!download.on_block_received(2, 0, vec![0; BLOCK_LEN as usize]));

        let block = download.next_block_to_request().unwrap();
        let data = make_block_data(&block);

        // wrong piece
        assert!(!download.on_block_received(5, block.offset, data.clone()));
        // not a block boundary
        assert!(!download.on_block_received(2, 1, data.clone()));
        // wrong length
        assert!(!download.on_block_received(2, block.offset, vec![0; 10]));
        assert_eq!(download.in_flight, 1);

        assert!(download.on_block_received(2, block.offset, data.clone()));
        // duplicate
        assert!(!download.on_block_received(2, block.offset, data));
        assert_eq!(download.in_flight, 0);
        assert!(!download.is_complete());
    }

    // Tests that a block whose request was cancelled is picked again.
    #[test]
    fn test_cancel_request() {
        let mut download = PieceDownload::new(0, 3 * BLOCK_LEN);
        let first = download.next_block_to_request().unwrap();
        let second = download.next_block_to_request().unwrap();
        assert_eq!(download.in_flight, 2);

        download.cancel_request(&second);
        assert_eq!(download.in_flight, 1);
        // cancelling again has no effect
        download.cancel_request(&second);
        assert_eq!(download.in_flight, 1);

        assert_eq!(download.next_block_to_request(), Some(second));
        assert!(download.on_block_received(
            0,
            first.offset,
            make_block_data(&first)
        ));
        // a received block can't be cancelled
        download.cancel_request(&first);
        assert_eq!(download.in_flight, 1);
        let third = download.next_block_to_request().unwrap();
        assert_eq!(third.offset, 2 * BLOCK_LEN);
    }

    // Tests that repeatedly requesting blocks returns each block exactly once.
    #[test]
    fn test_pick_each_block_once() {
        let piece_len = 8 * BLOCK_LEN;
        let mut download = PieceDownload::new(0, piece_len);

        let mut picked = HashSet::new();
        loop {
            let block = match download.next_block_to_request() {
                Some(block) => block,
                None => break,
            };
            assert!(picked.insert(block.offset));
            assert!(download.on_block_received(
                0,
                block.offset,
                make_block_data(&block)
            ));
        }
        assert_eq!(picked.len(), block_count(piece_len));
        assert!(download.is_complete());
    }
}
