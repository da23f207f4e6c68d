//! Piece availability tracking.
//!
//! Each bit records whether an endpoint possesses a piece. Bits are
//! numbered from the high bit of the first byte. On the wire the
//! bitfield travels as a string of '0'/'1' characters, one per piece.

use tracing::warn;

/// A fixed-length bit vector, one bit per piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates a new empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        let byte_count = piece_count.div_ceil(8);
        Self {
            bits: vec![0; byte_count],
            piece_count,
        }
    }

    /// Creates a full bitfield (all pieces available).
    pub fn full(piece_count: usize) -> Self {
        let byte_count = piece_count.div_ceil(8);
        let mut bf = Self {
            bits: vec![0xFF; byte_count],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Decodes the wire form: a string of '0'/'1' characters.
    ///
    /// A length mismatch against `piece_count` is tolerated: short
    /// input is zero-padded, long input truncated. Any character other
    /// than '1' counts as a cleared bit.
    pub fn from_wire(encoded: &str, piece_count: usize) -> Self {
        if encoded.len() != piece_count {
            warn!(
                received = encoded.len(),
                expected = piece_count,
                "bitfield length mismatch, padding/truncating"
            );
        }
        let mut bf = Self::new(piece_count);
        for (i, ch) in encoded.chars().take(piece_count).enumerate() {
            if ch == '1' {
                bf.set(i);
            }
        }
        bf
    }

    /// Encodes to the wire form, length == piece count.
    pub fn to_wire(&self) -> String {
        (0..self.piece_count)
            .map(|i| if self.has(i) { '1' } else { '0' })
            .collect()
    }

    /// Returns true if the piece at the given index is available.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        (self.bits[byte_index] >> bit_index) & 1 == 1
    }

    /// Sets the bit for the piece at the given index.
    ///
    /// Out-of-range indices are ignored. Setting an already-set bit is
    /// a no-op, which makes concurrent duplicate sets harmless.
    pub fn set(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] |= 1 << bit_index;
    }

    /// Marks every piece as available.
    pub fn set_all(&mut self) {
        self.bits.fill(0xFF);
        self.clear_spare_bits();
    }

    /// Returns the number of pieces that are available.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Returns true if all pieces are available.
    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    /// Returns true if no pieces are available.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Returns the total number of pieces.
    pub fn piece_count(&self) -> usize {
        self.piece_count
    }

    /// Returns indices of all pieces that are not available, ascending.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.piece_count)
            .filter(|&i| !self.has(i))
            .map(|i| i as u32)
            .collect()
    }

    /// Returns indices this bitfield holds that `ours` is missing.
    ///
    /// The overlap drives interest decisions: non-empty means the other
    /// endpoint can supply pieces we still need.
    pub fn held_and_missing_from(&self, ours: &Bitfield) -> Vec<u32> {
        (0..self.piece_count)
            .filter(|&i| self.has(i) && !ours.has(i))
            .map(|i| i as u32)
            .collect()
    }

    /// Clears any spare bits in the last byte that don't correspond to pieces.
    fn clear_spare_bits(&mut self) {
        let spare = (self.bits.len() * 8) - self.piece_count;
        if spare > 0 && spare < 8 && !self.bits.is_empty() {
            let mask = 0xFFu8 << spare;
            let last = self.bits.len() - 1;
            self.bits[last] &= mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_bitfield_is_empty() {
        let bf = Bitfield::new(10);
        assert!(bf.is_empty());
        assert_eq!(bf.count(), 0);
        assert_eq!(bf.missing().len(), 10);
    }

    #[test]
    fn test_full_bitfield_is_complete() {
        let bf = Bitfield::full(11);
        assert!(bf.is_complete());
        assert_eq!(bf.count(), 11);
        assert!(bf.missing().is_empty());
    }

    #[test]
    fn test_set_and_has() {
        let mut bf = Bitfield::new(20);
        bf.set(0);
        bf.set(7);
        bf.set(19);
        assert!(bf.has(0));
        assert!(bf.has(7));
        assert!(bf.has(19));
        assert!(!bf.has(8));
        assert_eq!(bf.count(), 3);
    }

    #[test]
    fn test_set_out_of_range_is_ignored() {
        let mut bf = Bitfield::new(5);
        bf.set(5);
        bf.set(100);
        assert!(bf.is_empty());
        assert!(!bf.has(100));
    }

    #[test]
    fn test_set_is_idempotent() {
        let mut bf = Bitfield::new(8);
        bf.set(3);
        bf.set(3);
        assert_eq!(bf.count(), 1);
    }

    #[test]
    fn test_missing_and_held_partition_the_index_space() {
        let mut bf = Bitfield::new(9);
        bf.set(1);
        bf.set(4);
        bf.set(8);

        let missing = bf.missing();
        for index in 0..9u32 {
            let held = bf.has(index as usize);
            let listed_missing = missing.contains(&index);
            assert!(held != listed_missing, "index {index} in both or neither");
        }
    }

    #[test]
    fn test_wire_round_trip() {
        let mut bf = Bitfield::new(6);
        bf.set(0);
        bf.set(5);
        assert_eq!(bf.to_wire(), "100001");
        assert_eq!(Bitfield::from_wire("100001", 6), bf);
    }

    #[test]
    fn test_from_wire_pads_short_input() {
        let bf = Bitfield::from_wire("11", 5);
        assert!(bf.has(0));
        assert!(bf.has(1));
        assert!(!bf.has(2));
        assert_eq!(bf.count(), 2);
    }

    #[test]
    fn test_from_wire_truncates_long_input() {
        let bf = Bitfield::from_wire("111111", 3);
        assert_eq!(bf.count(), 3);
        assert_eq!(bf.piece_count(), 3);
    }

    #[test]
    fn test_overlap_with_our_missing_pieces() {
        let mut theirs = Bitfield::new(5);
        theirs.set(1);
        theirs.set(3);

        let mut ours = Bitfield::new(5);
        ours.set(1);

        assert_eq!(theirs.held_and_missing_from(&ours), vec![3]);
    }

    #[test]
    fn test_full_respects_spare_bits() {
        // 9 pieces occupy 2 bytes; the 7 spare bits must stay cleared
        let bf = Bitfield::full(9);
        assert_eq!(bf.count(), 9);
        assert!(!bf.has(9));
        assert!(!bf.has(15));
    }
}
