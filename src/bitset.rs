//! Compact bitset keys for splits (bipartitions) over a fixed taxon set.
//!
//! # Overview
//! Every internal edge of an unrooted tree splits the taxa into two groups.
//! We key the split by the group containing a designated reference taxon,
//! stored as a bitset where bit position `i` corresponds to taxon index `i`.
//!
//! # Example
//! For taxa [A, B, C, D] at indices [0, 1, 2, 3]:
//! - The side {A, C} → bitset `0b0101` (bits 0 and 2 set)
//! - Its complement {B, D} → bitset `0b1010`
//!
//! Only one of the two sides is kept; [`Bitset::canonicalize`] picks the
//! side whose reference bit is set, so equal splits compare equal.

use serde::{Deserialize, Serialize};

/// A fixed-width bitset keying one side of a split.
///
/// Internally stores bits in `Vec<u64>` words to support arbitrarily large
/// taxon sets. Each u64 word holds 64 taxon indices. All bitsets for a given
/// taxon set share the same word count, so word-wise operations line up.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Bitset(pub Vec<u64>);

/// Word count needed for `nbits` bit positions.
#[inline]
pub fn words_for(nbits: usize) -> usize {
    nbits.div_ceil(64)
}

impl Bitset {
    /// Creates a new bitset with all bits set to 0.
    ///
    /// # Parameters
    /// - `words`: Number of u64 words. Calculate as `(n_taxa + 63) / 64`,
    ///   or use [`words_for`].
    ///
    /// # Example
    /// ```
    /// # use supertree_mcmc::bitset::Bitset;
    /// // 100 taxa need 2 words (128 bits)
    /// let bs = Bitset::zeros(2);
    /// assert_eq!(bs.0.len(), 2);
    /// ```
    pub fn zeros(words: usize) -> Self {
        Bitset(vec![0u64; words])
    }

    /// Creates a bitset with exactly one bit set.
    ///
    /// # Example
    /// ```
    /// # use supertree_mcmc::bitset::Bitset;
    /// let bs = Bitset::one_hot(1, 5);
    /// assert_eq!(bs.0[0], 0b100000);
    /// ```
    pub fn one_hot(words: usize, idx: usize) -> Self {
        let mut bs = Bitset::zeros(words);
        bs.set(idx);
        bs
    }

    /// Creates a mask with the low `nbits` bits set.
    ///
    /// Used as the all-taxa mask when complementing split sides.
    ///
    /// # Example
    /// ```
    /// # use supertree_mcmc::bitset::Bitset;
    /// let mask = Bitset::low_mask(1, 5);
    /// assert_eq!(mask.0[0], 0b11111);
    /// ```
    pub fn low_mask(words: usize, nbits: usize) -> Self {
        let mut bs = Bitset(vec![0u64; words]);
        for w in 0..words {
            let lo = w * 64;
            if nbits >= lo + 64 {
                bs.0[w] = u64::MAX;
            } else if nbits > lo {
                bs.0[w] = (1u64 << (nbits - lo)) - 1;
            }
        }
        bs
    }

    /// Sets the bit at the given index to 1.
    #[inline]
    pub fn set(&mut self, idx: usize) {
        let word = idx >> 6;     // idx / 64
        let bit = idx & 63;      // idx % 64
        self.0[word] |= 1u64 << bit;
    }

    /// Returns whether the bit at the given index is set.
    ///
    /// # Example
    /// ```
    /// # use supertree_mcmc::bitset::Bitset;
    /// let mut bs = Bitset::zeros(1);
    /// bs.set(3);
    /// assert!(bs.get(3));
    /// assert!(!bs.get(2));
    /// ```
    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        let word = idx >> 6;
        let bit = idx & 63;
        (self.0[word] >> bit) & 1 == 1
    }

    /// Performs bitwise OR with another bitset (union operation).
    ///
    /// `self` becomes `self ∪ other`. This is how a node's split side is
    /// accumulated from its children during a postorder pass.
    #[inline]
    pub fn or_assign(&mut self, other: &Bitset) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a |= *b;
        }
    }

    /// Performs bitwise AND with another bitset (intersection operation).
    ///
    /// `self` becomes `self ∩ other`. Used to restrict a supertree split
    /// to the taxa present in one input tree.
    #[inline]
    pub fn and_assign(&mut self, other: &Bitset) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a &= *b;
        }
    }

    /// Returns `self ∩ other` without modifying either operand.
    #[inline]
    pub fn and(&self, other: &Bitset) -> Bitset {
        let mut out = self.clone();
        out.and_assign(other);
        out
    }

    /// Counts the number of set bits (population count).
    ///
    /// # Example
    /// ```
    /// # use supertree_mcmc::bitset::Bitset;
    /// let mut bs = Bitset::zeros(1);
    /// bs.set(0);
    /// bs.set(2);
    /// bs.set(5);
    /// assert_eq!(bs.count_ones(), 3);
    /// ```
    #[inline]
    pub fn count_ones(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Flips this side of the split to the other side, within `mask`.
    ///
    /// `mask` bounds the taxon universe; bits outside it stay 0.
    ///
    /// # Example
    /// ```
    /// # use supertree_mcmc::bitset::Bitset;
    /// let mask = Bitset::low_mask(1, 4);
    /// let mut bs = Bitset::zeros(1);
    /// bs.set(1);
    /// bs.set(2);
    /// bs.flip_within(&mask);
    /// assert_eq!(bs.0[0], 0b1001);
    /// ```
    #[inline]
    pub fn flip_within(&mut self, mask: &Bitset) {
        for (a, m) in self.0.iter_mut().zip(&mask.0) {
            *a = !*a & *m;
        }
    }

    /// Puts the split key in canonical form: the side containing the
    /// reference taxon `ref_idx`, within the universe `mask`.
    ///
    /// If the reference bit is already set this is a no-op; otherwise the
    /// key is flipped to the complementary side. After canonicalization two
    /// keys are equal iff they encode the same split.
    ///
    /// # Example
    /// ```
    /// # use supertree_mcmc::bitset::Bitset;
    /// let mask = Bitset::low_mask(1, 4);
    /// let mut a = Bitset::zeros(1);
    /// a.set(1); a.set(2);          // {B, C}
    /// let mut b = Bitset::zeros(1);
    /// b.set(0); b.set(3);          // {A, D}, same split
    /// a.canonicalize(0, &mask);
    /// b.canonicalize(0, &mask);
    /// assert_eq!(a, b);
    /// ```
    #[inline]
    pub fn canonicalize(&mut self, ref_idx: usize, mask: &Bitset) {
        if !self.get(ref_idx) {
            self.flip_within(mask);
        }
    }

    /// Iterates over the indices of set bits, in increasing order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(w, &word)| {
            let base = w * 64;
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(base + bit)
            })
        })
    }

    /// Reduces a global split key to the taxon subset given by
    /// `subset_positions`, re-indexing into the subset's local numbering.
    ///
    /// `subset_positions[j]` is the global index of local taxon `j`. The
    /// result is canonicalized on local taxon 0 and has
    /// `words_for(subset_positions.len())` words.
    pub fn reduce_to_subset(&self, subset_positions: &[usize]) -> Bitset {
        let n = subset_positions.len();
        let words = words_for(n);
        let mut out = Bitset::zeros(words);
        for (local, &global) in subset_positions.iter().enumerate() {
            if self.get(global) {
                out.set(local);
            }
        }
        let mask = Bitset::low_mask(words, n);
        out.canonicalize(0, &mask);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitset_basic() {
        let mut bs = Bitset::zeros(1);
        bs.set(0);
        bs.set(2);
        assert_eq!(bs.0[0], 0b0101);
        assert!(bs.get(0));
        assert!(!bs.get(1));
    }

    #[test]
    fn test_bitset_or_and() {
        let mut bs1 = Bitset::zeros(1);
        bs1.set(0);
        bs1.set(1);

        let mut bs2 = Bitset::zeros(1);
        bs2.set(1);
        bs2.set(2);

        let both = bs1.and(&bs2);
        assert_eq!(both.0[0], 0b0010);

        bs1.or_assign(&bs2);
        assert_eq!(bs1.0[0], 0b0111);
    }

    #[test]
    fn test_low_mask_multi_word() {
        let mask = Bitset::low_mask(2, 70);
        assert_eq!(mask.0[0], u64::MAX);
        assert_eq!(mask.0[1], 0b111111);
        assert_eq!(mask.count_ones(), 70);
    }

    #[test]
    fn test_flip_within_stays_in_mask() {
        let mask = Bitset::low_mask(2, 70);
        let mut bs = Bitset::zeros(2);
        bs.set(0);
        bs.set(69);
        bs.flip_within(&mask);
        assert_eq!(bs.count_ones(), 68);
        assert!(!bs.get(0));
        assert!(!bs.get(69));
        assert!(bs.get(1));
        // Nothing leaked past the universe.
        assert!(!bs.get(70));
        assert!(!bs.get(127));
    }

    /// Visual example: the two encodings of one split.
    ///
    /// ```text
    ///   A       C
    ///    \     /
    ///     *---*
    ///    /     \
    ///   B       D
    /// ```
    ///
    /// Taxon mapping: A=0, B=1, C=2, D=3. The middle edge splits
    /// {A, B} from {C, D}; both encodings canonicalize to `0b0011`.
    #[test]
    fn test_canonicalize_two_sides_agree() {
        let mask = Bitset::low_mask(1, 4);

        let mut side_ab = Bitset::zeros(1);
        side_ab.set(0);
        side_ab.set(1);

        let mut side_cd = Bitset::zeros(1);
        side_cd.set(2);
        side_cd.set(3);

        side_ab.canonicalize(0, &mask);
        side_cd.canonicalize(0, &mask);
        assert_eq!(side_ab, side_cd);
        assert_eq!(side_ab.0[0], 0b0011);
    }

    #[test]
    fn test_iter_ones() {
        let mut bs = Bitset::zeros(2);
        bs.set(0);
        bs.set(63);
        bs.set(64);
        bs.set(100);
        let idxs: Vec<usize> = bs.iter_ones().collect();
        assert_eq!(idxs, vec![0, 63, 64, 100]);
    }

    #[test]
    fn test_reduce_to_subset() {
        // Global taxa 0..6, subset keeps {1, 3, 4, 5} as local 0..4.
        let mut global = Bitset::zeros(1);
        global.set(3);
        global.set(4);

        let reduced = global.reduce_to_subset(&[1, 3, 4, 5]);
        // {3, 4} map to local {1, 2}; local bit 0 is unset, so the key
        // flips to the side containing local taxon 0: {0, 3}.
        assert_eq!(reduced.0[0], 0b1001);
    }

    #[test]
    fn test_reduce_canonical_bit_always_set() {
        let mut global = Bitset::zeros(1);
        global.set(0);
        global.set(2);
        let reduced = global.reduce_to_subset(&[0, 1, 2, 3]);
        assert!(reduced.get(0));
        assert_eq!(reduced.0[0], 0b0101);
    }
}
