pub mod basic;
#[cfg(test)]
mod checks;

use std::fmt::{Debug, Formatter};

/// Number of piece planes: 6 roles × {friendly, enemy}
pub const NUM_PLANES: usize = 12;

/// Total number of features: 12 planes × 64 squares
pub const NUM_FEATURES: usize = NUM_PLANES * 64;

/// Number of u64 words needed to pack all the features
pub const NUM_WORDS: usize = NUM_FEATURES / 64;

/// One-hot encoding of a position, one bit per (plane, square).
///
/// Every feature is either 0 or 1, so the vector is stored packed into
/// u64 words (the same layout used by the dataset cache) and expanded
/// to f32 when a batch is assembled.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FeatureVector {
    words: [u64; NUM_WORDS],
}

impl FeatureVector {
    pub fn zeros() -> Self {
        Self::default()
    }

    pub fn from_words(words: [u64; NUM_WORDS]) -> Self {
        Self { words }
    }

    pub fn words(&self) -> &[u64; NUM_WORDS] {
        &self.words
    }

    /// Activates a feature. Panics if the index is out of range
    pub fn set(&mut self, index: usize) {
        assert!(index < NUM_FEATURES, "feature index out of range: {}", index);
        self.words[index / 64] |= 1 << (index % 64);
    }

    pub fn is_active(&self, index: usize) -> bool {
        index < NUM_FEATURES && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Number of active (1.0) entries
    pub fn count_active(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Indices of the active entries, in increasing order
    pub fn active(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(i * 64 + bit)
            })
        })
    }

    /// Writes the dense representation into `out` (must be NUM_FEATURES long)
    pub fn write_dense(&self, out: &mut [f32]) {
        assert_eq!(out.len(), NUM_FEATURES);

        out.fill(0.0);
        for index in self.active() {
            out[index] = 1.0;
        }
    }

    pub fn to_dense(&self) -> Vec<f32> {
        let mut dense = vec![0.0; NUM_FEATURES];
        self.write_dense(&mut dense);
        dense
    }
}

impl Debug for FeatureVector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.active()).finish()
    }
}
