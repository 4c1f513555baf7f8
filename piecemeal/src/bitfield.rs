use std::collections::BTreeSet;

use bitvec::prelude::{BitVec, Msb0};

use crate::PieceIndex;

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significants
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001`
/// would mean that the peer has pieces 0, 1, and 7).
///
/// The bitfield is built once from the raw bytes a peer sends and is not
/// updated afterwards. Its length is always a multiple of 8, as the wire
/// format doesn't convey the exact number of pieces.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitField {
    bits: BitVec<u8, Msb0>,
}

impl BitField {
    /// Creates a bitfield from the raw bytes of a `bitfield` message.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            bits: BitVec::from_slice(buf),
        }
    }

    /// Creates the bitfield advertising the given pieces, padded to a whole
    /// number of bytes.
    pub fn from_pieces(
        piece_count: usize,
        pieces: impl IntoIterator<Item = PieceIndex>,
    ) -> Self {
        let byte_count = (piece_count + 7) / 8;
        let mut bits = BitVec::repeat(false, byte_count * 8);
        for index in pieces {
            if index < piece_count {
                bits.set(index, true);
            }
        }
        Self { bits }
    }

    /// Returns whether the bitfield has the piece at the given index. Indices
    /// past the end of the bitfield are never available.
    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.bits.get(index).map(|bit| *bit).unwrap_or(false)
    }

    /// Returns the indices of all pieces set in the bitfield.
    pub fn available_indices(&self) -> BTreeSet<PieceIndex> {
        self.bits.iter_ones().collect()
    }

    /// Returns the number of bits in the bitfield.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Returns the raw bytes as they are sent over the wire.
    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that every bit of an arbitrary buffer maps to the piece at the same
    // position, counting from the most significant bit of the first byte.
    #[test]
    fn test_has_piece_matches_raw_bits() {
        let buf = [0b1100_0001, 0b0000_0000, 0b1010_1010, 0xff, 0x01];
        let bitfield = BitField::from_bytes(&buf);
        assert_eq!(bitfield.len(), buf.len() * 8);
        for i in 0..buf.len() * 8 {
            let expected = (buf[i / 8] >> (7 - i % 8)) & 1 == 1;
            assert_eq!(bitfield.has_piece(i), expected, "bit {}", i);
        }
    }

    #[test]
    fn test_has_piece_out_of_bounds() {
        let bitfield = BitField::from_bytes(&[0xff]);
        assert!(bitfield.has_piece(0));
        assert!(bitfield.has_piece(7));
        assert!(!bitfield.has_piece(8));
        assert!(!bitfield.has_piece(1000));

        let empty = BitField::from_bytes(&[]);
        assert!(empty.is_empty());
        assert!(!empty.has_piece(0));
    }

    #[test]
    fn test_available_indices() {
        let bitfield = BitField::from_bytes(&[0b1100_0001, 0b0100_0000]);
        let expected: BTreeSet<_> = [0, 1, 7, 9].iter().copied().collect();
        assert_eq!(bitfield.available_indices(), expected);
    }

    #[test]
    fn test_from_pieces() {
        let bitfield = BitField::from_pieces(10, vec![0, 3, 9, 42]);
        // 10 pieces need 2 bytes, and the out of bounds index is ignored
        assert_eq!(bitfield.as_bytes(), &[0b1001_0000, 0b0100_0000]);
        assert!(bitfield.has_piece(9));
        assert!(!bitfield.has_piece(42));

        let none = BitField::from_pieces(3, Vec::new());
        assert_eq!(none.as_bytes(), &[0]);
    }
}
