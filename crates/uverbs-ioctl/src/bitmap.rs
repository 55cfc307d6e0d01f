/// Fixed-size bitset indexed by a bucket-local attribute offset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct AttrBitmap {
    words: Box<[u64]>,
    len: usize,
}

impl AttrBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(64)].into_boxed_slice(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `false` for out-of-range bits.
    pub fn test(&self, bit: usize) -> bool {
        if bit >= self.len {
            return false;
        }
        self.words[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    /// Sets `bit` and returns its previous value. Out-of-range bits are ignored.
    pub fn set(&mut self, bit: usize) -> bool {
        if bit >= self.len {
            return false;
        }
        let word = &mut self.words[bit / 64];
        let mask = 1u64 << (bit % 64);
        let was_set = *word & mask != 0;
        *word |= mask;
        was_set
    }

    /// Lowest bit set in `self` but not in `other`; bits past `other`'s end count as unset.
    pub fn first_missing_from(&self, other: &AttrBitmap) -> Option<usize> {
        for (idx, &word) in self.words.iter().enumerate() {
            let covered = other.words.get(idx).copied().unwrap_or(0);
            let missing = word & !covered;
            if missing != 0 {
                return Some(idx * 64 + missing.trailing_zeros() as usize);
            }
        }
        None
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&bit| self.test(bit))
    }
}
