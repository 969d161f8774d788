//! Block-edge index: `(r, s)` block pair to block-multigraph edge id.
//!
//! Two interchangeable implementations behind one enum: a dense `B x B`
//! table (`EMat`) for bounded block counts and a hash index (`EHash`)
//! otherwise. Undirected graphs record both orientations, so lookups
//! never need to canonicalise.

use crate::graph::Multigraph;
use fnv::FnvHashMap;

/// Dense two-dimensional table.
#[derive(Debug, Clone)]
pub struct EMat {
    directed: bool,
    mat: Vec<Vec<Option<usize>>>,
}

/// Sparse hash table keyed on the ordered pair.
#[derive(Debug, Clone)]
pub struct EHash {
    directed: bool,
    map: FnvHashMap<(usize, usize), usize>,
}

/// The index variant is chosen once at state construction.
#[derive(Debug, Clone)]
pub enum EdgeIndex {
    Mat(EMat),
    Hash(EHash),
}

impl EdgeIndex {
    pub fn new(bg: &Multigraph, use_hash: bool) -> Self {
        let mut idx = if use_hash {
            EdgeIndex::Hash(EHash {
                directed: bg.is_directed(),
                map: FnvHashMap::default(),
            })
        } else {
            let b = bg.num_vertices();
            EdgeIndex::Mat(EMat {
                directed: bg.is_directed(),
                mat: vec![vec![None; b]; b],
            })
        };
        idx.sync(bg);
        idx
    }

    fn key(directed: bool, r: usize, s: usize) -> (usize, usize) {
        if !directed && s < r {
            (s, r)
        } else {
            (r, s)
        }
    }

    /// Edge id of the `(r, s)` block edge, if present in `bg`.
    #[inline]
    pub fn get_me(&self, r: usize, s: usize) -> Option<usize> {
        match self {
            EdgeIndex::Mat(m) => m.mat.get(r).and_then(|row| row.get(s)).copied().flatten(),
            EdgeIndex::Hash(h) => h.map.get(&Self::key(h.directed, r, s)).copied(),
        }
    }

    /// Record a freshly created `bg` edge.
    pub fn put_me(&mut self, r: usize, s: usize, e: usize) {
        match self {
            EdgeIndex::Mat(m) => {
                m.mat[r][s] = Some(e);
                if !m.directed {
                    m.mat[s][r] = Some(e);
                }
            }
            EdgeIndex::Hash(h) => {
                h.map.insert(Self::key(h.directed, r, s), e);
            }
        }
    }

    /// Drop the `(r, s)` mapping. Physical removal from `bg` stays with
    /// the caller (a coupled state may still own the edge).
    pub fn remove_me(&mut self, r: usize, s: usize) {
        match self {
            EdgeIndex::Mat(m) => {
                m.mat[r][s] = None;
                if !m.directed {
                    m.mat[s][r] = None;
                }
            }
            EdgeIndex::Hash(h) => {
                h.map.remove(&Self::key(h.directed, r, s));
            }
        }
    }

    /// Extend the index after blocks were added to `bg`.
    pub fn add_block(&mut self, bg: &Multigraph) {
        if let EdgeIndex::Mat(m) = self {
            let b = bg.num_vertices();
            for row in &mut m.mat {
                row.resize(b, None);
            }
            while m.mat.len() < b {
                m.mat.push(vec![None; b]);
            }
        }
    }

    /// Rebuild every entry from the current `bg` topology.
    pub fn sync(&mut self, bg: &Multigraph) {
        match self {
            EdgeIndex::Mat(m) => {
                let b = bg.num_vertices();
                m.mat.clear();
                m.mat.resize(b, vec![None; b]);
            }
            EdgeIndex::Hash(h) => h.map.clear(),
        }
        let edges: Vec<usize> = bg.edges().collect();
        for e in edges {
            let (r, s) = bg.endpoints(e);
            self.put_me(r, s, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bg() -> Multigraph {
        Multigraph::from_edges(3, false, &[(0, 1), (1, 2)])
    }

    #[test]
    fn both_variants_agree() {
        let g = bg();
        let mat = EdgeIndex::new(&g, false);
        let hash = EdgeIndex::new(&g, true);
        for r in 0..3 {
            for s in 0..3 {
                assert_eq!(mat.get_me(r, s), hash.get_me(r, s), "({}, {})", r, s);
            }
        }
        // undirected: both orientations resolve
        assert!(mat.get_me(1, 0).is_some());
        assert!(hash.get_me(1, 0).is_some());
        assert!(mat.get_me(0, 2).is_none());
    }

    #[test]
    fn put_and_remove() {
        let mut g = bg();
        let mut idx = EdgeIndex::new(&g, false);
        let e = g.add_edge(0, 2);
        idx.put_me(0, 2, e);
        assert_eq!(idx.get_me(2, 0), Some(e));
        idx.remove_me(0, 2);
        assert_eq!(idx.get_me(0, 2), None);
        assert_eq!(idx.get_me(2, 0), None);
    }

    #[test]
    fn add_block_grows_table() {
        let mut g = bg();
        let mut idx = EdgeIndex::new(&g, false);
        let r = g.add_vertex();
        idx.add_block(&g);
        let e = g.add_edge(r, 0);
        idx.put_me(r, 0, e);
        assert_eq!(idx.get_me(0, r), Some(e));
    }

    #[test]
    fn directed_orientation_matters() {
        let g = Multigraph::from_edges(2, true, &[(0, 1)]);
        for use_hash in [false, true] {
            let idx = EdgeIndex::new(&g, use_hash);
            assert!(idx.get_me(0, 1).is_some());
            assert!(idx.get_me(1, 0).is_none());
        }
    }
}
