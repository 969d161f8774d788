//! Index set with O(1) insert, erase and uniform sampling.
//!
//! Backs the empty/candidate block partitions: a dense value vector for
//! sampling plus a position map for constant-time membership updates.

use fnv::FnvHashMap;
use rand::Rng;

#[derive(Debug, Clone, Default)]
pub struct IdxSet {
    items: Vec<usize>,
    pos: FnvHashMap<usize, usize>,
}

impl IdxSet {
    pub fn insert(&mut self, x: usize) -> bool {
        if self.pos.contains_key(&x) {
            return false;
        }
        self.pos.insert(x, self.items.len());
        self.items.push(x);
        true
    }

    pub fn erase(&mut self, x: usize) -> bool {
        match self.pos.remove(&x) {
            None => false,
            Some(i) => {
                let last = self.items.pop().unwrap();
                if last != x {
                    self.items[i] = last;
                    self.pos.insert(last, i);
                }
                true
            }
        }
    }

    #[inline]
    pub fn contains(&self, x: usize) -> bool {
        self.pos.contains_key(&x)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.items.iter().copied()
    }

    /// The most recently inserted surviving element.
    pub fn last(&self) -> Option<usize> {
        self.items.last().copied()
    }

    pub fn uniform_sample<R: Rng>(&self, rng: &mut R) -> usize {
        debug_assert!(!self.items.is_empty());
        self.items[rng.random_range(0..self.items.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn insert_erase_sample() {
        let mut s = IdxSet::default();
        assert!(s.insert(3));
        assert!(s.insert(5));
        assert!(!s.insert(3));
        assert_eq!(s.len(), 2);
        assert!(s.erase(3));
        assert!(!s.erase(3));
        assert!(s.contains(5) && !s.contains(3));

        let mut rng = SmallRng::seed_from_u64(0);
        for _ in 0..10 {
            assert_eq!(s.uniform_sample(&mut rng), 5);
        }
    }

    #[test]
    fn swap_remove_keeps_positions() {
        let mut s = IdxSet::default();
        for x in 0..10 {
            s.insert(x);
        }
        s.erase(0);
        for x in 1..10 {
            assert!(s.contains(x));
        }
        assert_eq!(s.len(), 9);
    }
}
