//! Compact set of pointer ids.

use std::fmt;

use super::MAX_POINTER_ID;

/// Set of pointer ids in `0..=MAX_POINTER_ID`, one bit per id.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PointerIdBits(u32);

impl PointerIdBits {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn from_ids<I: IntoIterator<Item = u32>>(ids: I) -> Self {
        let mut bits = Self::empty();
        for id in ids {
            bits.mark(id);
        }
        bits
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn has(self, id: u32) -> bool {
        id <= MAX_POINTER_ID && self.0 & (1 << id) != 0
    }

    pub fn mark(&mut self, id: u32) {
        if id <= MAX_POINTER_ID {
            self.0 |= 1 << id;
        }
    }

    pub fn clear(&mut self, id: u32) {
        if id <= MAX_POINTER_ID {
            self.0 &= !(1 << id);
        }
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn first(self) -> Option<u32> {
        (!self.is_empty()).then(|| self.0.trailing_zeros())
    }

    pub fn iter(self) -> impl Iterator<Item = u32> {
        (0..=MAX_POINTER_ID).filter(move |id| self.has(*id))
    }
}

impl fmt::Debug for PointerIdBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for PointerIdBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_clear() {
        let mut bits = PointerIdBits::empty();
        bits.mark(0);
        bits.mark(31);
        bits.mark(40);
        assert_eq!(bits.count(), 2);
        assert!(bits.has(31));
        assert!(!bits.has(40));
        assert_eq!(bits.first(), Some(0));

        bits.clear(0);
        assert_eq!(bits.first(), Some(31));
        assert_eq!(bits.iter().collect::<Vec<_>>(), vec![31]);
    }
}
