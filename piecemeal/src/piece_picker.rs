use rand::seq::IndexedRandom;

use crate::{
    bitfield::BitField, download::PieceDownload, error::*, PieceIndex,
    Sha1Hash,
};

/// The state of a single piece in the torrent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PieceState {
    /// We don't have the piece and nobody is downloading it.
    Required,
    /// The piece is being downloaded by exactly one peer session.
    Downloading,
    /// We have the piece and its hash has been verified.
    Available,
    /// The piece is being downloaded by multiple peer sessions at the same
    /// time.
    ///
    /// This is reserved for endgame mode: pieces in this state may still be
    /// picked and confirmed, but nothing currently puts a piece into it.
    Racing,
}

impl PieceState {
    /// Returns whether a piece in this state may be handed out to a peer
    /// session.
    fn is_pickable(self) -> bool {
        matches!(self, Self::Required | Self::Racing)
    }
}

/// The outcome of confirming a finished piece download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Confirmation {
    /// The piece was not being downloaded (e.g. it was released in the
    /// meantime or we already have it), so the download was dropped.
    Ignored,
    /// The piece's hash matched and the piece is now available.
    Valid,
    /// The piece's hash did not match and the piece needs to be downloaded
    /// again.
    Invalid,
}

/// Keeps track of the state of every piece in the torrent and picks which
/// piece to download next.
pub(crate) struct PiecePicker {
    /// The state of each piece, pre-allocated to the number of pieces in the
    /// torrent.
    pieces: Vec<PieceState>,
    /// The concatenation of the expected 20 byte SHA-1 hash of each piece.
    piece_hashes: Vec<u8>,
    /// The nominal length of a piece.
    piece_len: u32,
    /// The length of the whole download.
    download_len: u64,
}

impl PiecePicker {
    /// Creates a new piece picker in which all pieces are required.
    pub fn new(piece_hashes: Vec<u8>, piece_len: u32, download_len: u64) -> Self {
        debug_assert_eq!(piece_hashes.len() % 20, 0);
        let piece_count = piece_hashes.len() / 20;
        Self {
            pieces: vec![PieceState::Required; piece_count],
            piece_hashes,
            piece_len,
            download_len,
        }
    }

    pub fn download_len(&self) -> u64 {
        self.download_len
    }

    /// Returns the state of the piece at the given index.
    pub fn state(&self, index: PieceIndex) -> Option<PieceState> {
        self.pieces.get(index).copied()
    }

    /// Returns the state of every piece.
    pub fn states(&self) -> &[PieceState] {
        &self.pieces
    }

    /// Returns the expected hash of the piece at the given index.
    pub fn expected_hash(&self, index: PieceIndex) -> Option<Sha1Hash> {
        let pos = index * 20;
        let slice = self.piece_hashes.get(pos..pos + 20)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }

    /// Returns the length of the piece at the given index: the last piece is
    /// truncated to the remaining length of the download.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index >= self.pieces.len() {
            log::error!("Piece {} is invalid", index);
            return Err(Error::InvalidPieceIndex);
        }
        let offset = index as u64 * self.piece_len as u64;
        let remaining = self.download_len.saturating_sub(offset);
        Ok(std::cmp::min(remaining, self.piece_len as u64) as u32)
    }

    /// Picks a random piece that we still need and that the peer with the
    /// given bitfield has, and returns a new download for it.
    ///
    /// Returns `None` if the peer has none of the pieces we need (or all of
    /// them are already being downloaded).
    pub fn pick_piece(&mut self, peer_pieces: &BitField) -> Option<PieceDownload> {
        log::trace!("Picking next piece");

        let candidates: Vec<PieceIndex> = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(index, state)| {
                state.is_pickable() && peer_pieces.has_piece(*index)
            })
            .map(|(index, _)| index)
            .collect();

        // picking at random rather than in order spreads peers over different
        // pieces
        let index = match candidates.choose(&mut rand::rng()) {
            Some(index) => *index,
            None => {
                log::trace!("Could not pick piece");
                return None;
            }
        };
        let len = self.piece_len(index).ok()?;

        if self.pieces[index] != PieceState::Racing {
            self.pieces[index] = PieceState::Downloading;
        }
        log::trace!("Picked piece {} (length: {})", index, len);

        Some(PieceDownload::new(index, len))
    }

    /// Marks a piece that is being downloaded as required again, so that it
    /// may be picked again. Has no effect on pieces in any other state.
    pub fn cancel_piece(&mut self, index: PieceIndex) {
        if let Some(state) = self.pieces.get_mut(index) {
            if *state == PieceState::Downloading {
                log::debug!("Releasing piece {}", index);
                *state = PieceState::Required;
            }
        }
    }

    /// Releases every piece that is being downloaded.
    pub fn cancel_all(&mut self) {
        for index in 0..self.pieces.len() {
            self.cancel_piece(index);
        }
    }

    /// Verifies the finished piece download against its expected hash and
    /// updates the piece's state accordingly.
    pub fn confirm_piece(&mut self, download: &PieceDownload) -> Confirmation {
        let index = download.piece_index();
        match self.state(index) {
            Some(PieceState::Downloading) | Some(PieceState::Racing) => {}
            state => {
                log::debug!(
                    "Ignoring piece {} download in state {:?}",
                    index,
                    state
                );
                return Confirmation::Ignored;
            }
        }

        let hash = download.content_hash();
        if self.expected_hash(index) == Some(hash) {
            log::info!("Piece {} is valid", index);
            self.pieces[index] = PieceState::Available;
            Confirmation::Valid
        } else {
            log::warn!("Piece {} is NOT valid", index);
            self.pieces[index] = PieceState::Required;
            Confirmation::Invalid
        }
    }

    /// Marks the piece as available without downloading it, used for pieces
    /// that were verified on disk.
    pub fn received_piece(&mut self, index: PieceIndex) {
        debug_assert!(index < self.pieces.len());
        if let Some(state) = self.pieces.get_mut(index) {
            *state = PieceState::Available;
        }
    }

    /// Reverts an available piece to required, used when the piece could not
    /// be persisted.
    pub fn lost_piece(&mut self, index: PieceIndex) {
        if let Some(state) = self.pieces.get_mut(index) {
            if *state == PieceState::Available {
                *state = PieceState::Required;
            }
        }
    }

    /// Returns the number of pieces we have.
    pub fn count_available(&self) -> usize {
        self.pieces
            .iter()
            .filter(|s| **s == PieceState::Available)
            .count()
    }

    /// Returns whether we have all pieces.
    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|s| *s == PieceState::Available)
    }

    /// Returns the ratio of the pieces we have to all pieces in the torrent.
    pub fn progress_fraction(&self) -> f64 {
        if self.pieces.is_empty() {
            return 0.0;
        }
        self.count_available() as f64 / self.pieces.len() as f64
    }

    /// Returns the bitfield of the pieces we have.
    pub fn own_pieces(&self) -> BitField {
        BitField::from_pieces(
            self.pieces.len(),
            self.pieces
                .iter()
                .enumerate()
                .filter(|(_, s)| **s == PieceState::Available)
                .map(|(index, _)| index),
        )
    }
}
