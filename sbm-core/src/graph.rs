//! Owned multigraph with stable edge ids.
//!
//! This is the substrate for both the observed graph and the
//! block-contracted multigraph. Edge ids stay valid across removals
//! (dead ids go to a free list and are reused), which lets edge property
//! vectors and the block-edge index hold plain indices.
//!
//! Conventions:
//! - the `directed` flag is a runtime property of the graph;
//! - `out_edges` yields every incident edge exactly once, self-loops
//!   included;
//! - for undirected graphs `in_edges` is empty and weighted degrees count
//!   self-loops twice (so block in/out sums alias each other).

/// Sentinel for "no block" in move descriptions.
pub const NULL_BLOCK: usize = usize::MAX;

#[derive(Debug, Clone)]
struct EdgeRec {
    u: usize,
    v: usize,
    alive: bool,
}

/// A directed or undirected multigraph over `0..num_vertices()`.
#[derive(Debug, Clone)]
pub struct Multigraph {
    directed: bool,
    n_vertices: usize,
    edges: Vec<EdgeRec>,
    out_adj: Vec<Vec<usize>>,
    in_adj: Vec<Vec<usize>>,
    free: Vec<usize>,
    n_live: usize,
}

impl Multigraph {
    pub fn new(n: usize, directed: bool) -> Self {
        Multigraph {
            directed,
            n_vertices: n,
            edges: Vec::new(),
            out_adj: vec![Vec::new(); n],
            in_adj: vec![Vec::new(); n],
            free: Vec::new(),
            n_live: 0,
        }
    }

    /// Build from an edge list; edge ids are assigned in order.
    pub fn from_edges(n: usize, directed: bool, edges: &[(usize, usize)]) -> Self {
        let mut g = Multigraph::new(n, directed);
        for &(u, v) in edges {
            g.add_edge(u, v);
        }
        g
    }

    #[inline]
    pub fn is_directed(&self) -> bool {
        self.directed
    }

    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.n_vertices
    }

    /// Number of live edges.
    #[inline]
    pub fn num_edges(&self) -> usize {
        self.n_live
    }

    /// Upper bound on edge ids, for sizing property vectors.
    #[inline]
    pub fn edge_bound(&self) -> usize {
        self.edges.len()
    }

    pub fn add_vertex(&mut self) -> usize {
        self.out_adj.push(Vec::new());
        self.in_adj.push(Vec::new());
        self.n_vertices += 1;
        self.n_vertices - 1
    }

    pub fn add_edge(&mut self, u: usize, v: usize) -> usize {
        debug_assert!(u < self.n_vertices && v < self.n_vertices);
        let e = match self.free.pop() {
            Some(e) => {
                self.edges[e] = EdgeRec { u, v, alive: true };
                e
            }
            None => {
                self.edges.push(EdgeRec { u, v, alive: true });
                self.edges.len() - 1
            }
        };
        self.out_adj[u].push(e);
        if self.directed {
            self.in_adj[v].push(e);
        } else if v != u {
            self.out_adj[v].push(e);
        }
        self.n_live += 1;
        e
    }

    pub fn remove_edge(&mut self, e: usize) {
        debug_assert!(self.edges[e].alive);
        let (u, v) = (self.edges[e].u, self.edges[e].v);
        self.out_adj[u].retain(|&x| x != e);
        if self.directed {
            self.in_adj[v].retain(|&x| x != e);
        } else if v != u {
            self.out_adj[v].retain(|&x| x != e);
        }
        self.edges[e].alive = false;
        self.free.push(e);
        self.n_live -= 1;
    }

    #[inline]
    pub fn source(&self, e: usize) -> usize {
        self.edges[e].u
    }

    #[inline]
    pub fn target(&self, e: usize) -> usize {
        self.edges[e].v
    }

    #[inline]
    pub fn endpoints(&self, e: usize) -> (usize, usize) {
        (self.edges[e].u, self.edges[e].v)
    }

    /// The endpoint of `e` other than `w` (returns `w` for a self-loop).
    #[inline]
    pub fn opposite(&self, e: usize, w: usize) -> usize {
        let rec = &self.edges[e];
        if rec.u == w {
            rec.v
        } else {
            rec.u
        }
    }

    #[inline]
    pub fn is_loop(&self, e: usize) -> bool {
        self.edges[e].u == self.edges[e].v
    }

    #[inline]
    pub fn vertices(&self) -> std::ops::Range<usize> {
        0..self.n_vertices
    }

    /// Live edge ids.
    pub fn edges(&self) -> impl Iterator<Item = usize> + '_ {
        self.edges
            .iter()
            .enumerate()
            .filter(|(_, rec)| rec.alive)
            .map(|(e, _)| e)
    }

    /// Incident edges with `v` as source (undirected: all incident edges,
    /// self-loops once).
    #[inline]
    pub fn out_edges(&self, v: usize) -> impl Iterator<Item = usize> + '_ {
        self.out_adj[v].iter().copied()
    }

    /// In-edges of `v`; empty for undirected graphs.
    #[inline]
    pub fn in_edges(&self, v: usize) -> impl Iterator<Item = usize> + '_ {
        self.in_adj[v].iter().copied()
    }

    #[inline]
    pub fn out_degree(&self, v: usize) -> usize {
        self.out_adj[v].len()
    }

    #[inline]
    pub fn in_degree(&self, v: usize) -> usize {
        self.in_adj[v].len()
    }

    /// Unweighted total degree, counting self-loops twice in the
    /// undirected case.
    pub fn total_degree(&self, v: usize) -> usize {
        let loops = self.out_adj[v].iter().filter(|&&e| self.is_loop(e)).count();
        if self.directed {
            self.out_adj[v].len() + self.in_adj[v].len()
        } else {
            self.out_adj[v].len() + loops
        }
    }

    /// Any live edge between `u` and `v` (orientation-sensitive when
    /// directed). Linear in `deg(u)`; used by the check routines only.
    pub fn edge_between(&self, u: usize, v: usize) -> Option<usize> {
        self.out_adj[u]
            .iter()
            .copied()
            .find(|&e| self.opposite(e, u) == v && (!self.directed || self.target(e) == v))
    }
}

/// Grow a property vector so `idx` is addressable.
#[inline]
pub fn ensure_len<T: Clone + Default>(p: &mut Vec<T>, len: usize) {
    if p.len() < len {
        p.resize(len, T::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undirected_adjacency() {
        let g = Multigraph::from_edges(3, false, &[(0, 1), (1, 2), (2, 0)]);
        assert_eq!(g.num_edges(), 3);
        assert_eq!(g.out_degree(0), 2);
        assert_eq!(g.total_degree(1), 2);
        let nbrs: Vec<usize> = g.out_edges(0).map(|e| g.opposite(e, 0)).collect();
        assert_eq!(nbrs.len(), 2);
        assert!(nbrs.contains(&1) && nbrs.contains(&2));
    }

    #[test]
    fn undirected_self_loop_counts_twice() {
        let mut g = Multigraph::new(2, false);
        let e = g.add_edge(0, 0);
        g.add_edge(0, 1);
        assert!(g.is_loop(e));
        // the loop is stored once in the adjacency ...
        assert_eq!(g.out_degree(0), 2);
        // ... but the degree convention counts it twice
        assert_eq!(g.total_degree(0), 3);
    }

    #[test]
    fn directed_in_out() {
        let g = Multigraph::from_edges(3, true, &[(0, 1), (2, 1)]);
        assert_eq!(g.out_degree(0), 1);
        assert_eq!(g.in_degree(1), 2);
        assert_eq!(g.total_degree(1), 2);
    }

    #[test]
    fn edge_id_reuse() {
        let mut g = Multigraph::new(3, false);
        let e0 = g.add_edge(0, 1);
        let e1 = g.add_edge(1, 2);
        g.remove_edge(e0);
        assert_eq!(g.num_edges(), 1);
        let e2 = g.add_edge(0, 2);
        assert_eq!(e2, e0, "freed id is recycled");
        assert!(g.edges().count() == 2);
        assert_eq!(g.endpoints(e1), (1, 2));
    }

    #[test]
    fn edge_between_respects_orientation() {
        let g = Multigraph::from_edges(3, true, &[(0, 1)]);
        assert!(g.edge_between(0, 1).is_some());
        assert!(g.edge_between(1, 0).is_none());

        let h = Multigraph::from_edges(3, false, &[(0, 1)]);
        assert!(h.edge_between(1, 0).is_some());
    }
}
