//! Bookkeeping for the overlapping variant, where each original node
//! owns one half-edge vertex per incident edge and the half-edges carry
//! independent block labels.
//!
//! The central quantity is per-block node occupancy: `w_r` counts the
//! distinct original nodes with at least one half-edge labelled `r`,
//! which is what the per-block map below maintains incrementally.

use fnv::FnvHashMap;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct OverlapStats {
    /// half-edge vertex -> original node
    node_index: Vec<usize>,
    /// original node -> its half-edge vertices
    half_edges: Vec<Vec<usize>>,
    /// block -> node -> number of that node's half-edges in the block
    block_nodes: Vec<FnvHashMap<usize, usize>>,
}

impl OverlapStats {
    pub fn new(b: &[usize], node_index: Vec<usize>, half_edges: Vec<Vec<usize>>, b_count: usize) -> Self {
        let mut block_nodes = vec![FnvHashMap::default(); b_count];
        for (v, &node) in node_index.iter().enumerate() {
            *block_nodes[b[v]].entry(node).or_insert(0) += 1;
        }
        OverlapStats {
            node_index,
            half_edges,
            block_nodes,
        }
    }

    /// Number of original nodes.
    pub fn get_n(&self) -> usize {
        self.half_edges.len()
    }

    #[inline]
    pub fn get_node(&self, v: usize) -> usize {
        self.node_index[v]
    }

    #[inline]
    pub fn get_half_edges(&self, node: usize) -> &[usize] {
        &self.half_edges[node]
    }

    pub fn sample_half_edge<R: Rng>(&self, node: usize, rng: &mut R) -> usize {
        let hs = &self.half_edges[node];
        hs[rng.random_range(0..hs.len())]
    }

    /// Distinct original nodes represented in block `r`.
    pub fn get_block_size(&self, r: usize) -> usize {
        self.block_nodes[r].len()
    }

    pub fn add_half_edge(&mut self, v: usize, r: usize) {
        let node = self.node_index[v];
        *self.block_nodes[r].entry(node).or_insert(0) += 1;
    }

    pub fn remove_half_edge(&mut self, v: usize, r: usize) {
        let node = self.node_index[v];
        let cnt = self.block_nodes[r].get_mut(&node).expect("half-edge in block");
        *cnt -= 1;
        if *cnt == 0 {
            self.block_nodes[r].remove(&node);
        }
    }

    /// Block size after removing half-edge `v` from `r`.
    pub fn virtual_remove_size(&self, v: usize, r: usize) -> usize {
        let node = self.node_index[v];
        let size = self.block_nodes[r].len();
        match self.block_nodes[r].get(&node) {
            Some(&1) => size - 1,
            _ => size,
        }
    }

    /// Block size after adding half-edge `v` to `nr`.
    pub fn virtual_add_size(&self, v: usize, nr: usize) -> usize {
        let node = self.node_index[v];
        let size = self.block_nodes[nr].len();
        if self.block_nodes[nr].contains_key(&node) {
            size
        } else {
            size + 1
        }
    }

    pub fn add_block(&mut self) {
        self.block_nodes.push(FnvHashMap::default());
    }

    pub fn num_blocks(&self) -> usize {
        self.block_nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // two nodes: node 0 owns half-edges {0, 1}, node 1 owns {2, 3}
    fn stats(b: &[usize]) -> OverlapStats {
        OverlapStats::new(b, vec![0, 0, 1, 1], vec![vec![0, 1], vec![2, 3]], 3)
    }

    #[test]
    fn block_size_counts_nodes_not_half_edges() {
        let s = stats(&[0, 0, 0, 1]);
        // block 0 holds two half-edges of node 0 plus one of node 1
        assert_eq!(s.get_block_size(0), 2);
        assert_eq!(s.get_block_size(1), 1);
        assert_eq!(s.get_block_size(2), 0);
    }

    #[test]
    fn virtual_sizes() {
        let s = stats(&[0, 0, 0, 1]);
        // removing one of node 0's two half-edges leaves it represented
        assert_eq!(s.virtual_remove_size(0, 0), 2);
        // removing node 1's only half-edge in block 0 does not
        assert_eq!(s.virtual_remove_size(2, 0), 1);
        // node 0 is already in block 0
        assert_eq!(s.virtual_add_size(1, 0), 2);
        assert_eq!(s.virtual_add_size(3, 0), 2);
        assert_eq!(s.virtual_add_size(0, 2), 1);
    }

    #[test]
    fn add_remove_round_trip() {
        let mut s = stats(&[0, 0, 0, 1]);
        s.remove_half_edge(2, 0);
        assert_eq!(s.get_block_size(0), 1);
        s.add_half_edge(2, 2);
        assert_eq!(s.get_block_size(2), 1);
        s.remove_half_edge(2, 2);
        s.add_half_edge(2, 0);
        assert_eq!(s.get_block_size(0), 2);
        assert_eq!(s.get_block_size(2), 0);
    }
}
