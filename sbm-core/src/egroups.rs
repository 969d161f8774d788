//! Per-block weighted sampler over adjacent blocks, used by the informed
//! move proposal.
//!
//! For block `t`, sampling returns neighbour block `s` with probability
//! `m_ts / m_t` (both orientations in the directed case, self-loops
//! doubled in the undirected case — the same convention as the proposal
//! probability in `get_move_prob`). Weights live in a Fenwick tree so the
//! inner MCMC loop can keep the sampler in sync with `O(log B)` updates
//! instead of rebuilding it.
//!
//! Lifecycle: built lazily on first use, updated incrementally while a
//! controlled MCMC sweep is running, and dropped (`clear_egroups`) by any
//! mutation outside that loop.

use crate::graph::Multigraph;
use fnv::FnvHashMap;
use rand::Rng;

/// Weighted sampler over `(block, weight)` items backed by a Fenwick tree.
#[derive(Debug, Clone, Default)]
pub struct FenwickSampler {
    items: Vec<usize>,
    weights: Vec<f64>,
    pos: FnvHashMap<usize, usize>,
    tree: Vec<f64>,
}

impl FenwickSampler {
    fn tree_add(&mut self, mut i: usize, d: f64) {
        i += 1;
        while i <= self.items.len() {
            self.tree[i - 1] += d;
            i += i & i.wrapping_neg();
        }
    }

    fn total(&self) -> f64 {
        let mut s = 0.;
        let mut i = self.items.len();
        while i > 0 {
            s += self.tree[i - 1];
            i -= i & i.wrapping_neg();
        }
        s
    }

    /// Add `d` to the weight attached to `item`, inserting it on demand.
    pub fn adjust(&mut self, item: usize, d: f64) {
        match self.pos.get(&item) {
            Some(&i) => {
                self.weights[i] += d;
                self.tree_add(i, d);
            }
            None => {
                let i = self.items.len();
                self.items.push(item);
                self.weights.push(d);
                self.pos.insert(item, i);
                // node i+1 covers (i+1-lowbit, i+1]; seed it with the range sum
                let lowbit = (i + 1) & (i + 1).wrapping_neg();
                let stop = i + 1 - lowbit;
                let mut s = 0.;
                let mut j = i;
                while j > stop {
                    s += self.tree[j - 1];
                    j -= j & j.wrapping_neg();
                }
                self.tree.push(s + d);
            }
        }
    }

    pub fn weight(&self, item: usize) -> f64 {
        self.pos
            .get(&item)
            .map(|&i| self.weights[i])
            .unwrap_or(0.)
    }

    pub fn is_empty(&self) -> bool {
        self.total() <= 0.
    }

    /// Sample an item proportionally to its weight.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Option<usize> {
        let total = self.total();
        if total <= 0. {
            return None;
        }
        let mut x = rng.random::<f64>() * total;
        let mut i = 0usize;
        let mut mask = self.items.len().next_power_of_two();
        while mask > 0 {
            let j = i + mask;
            if j <= self.items.len() && self.tree[j - 1] < x {
                x -= self.tree[j - 1];
                i = j;
            }
            mask >>= 1;
        }
        // numerical slack can push past the last positive weight
        let mut i = i.min(self.items.len() - 1);
        while self.weights[i] <= 0. && i > 0 {
            i -= 1;
        }
        Some(self.items[i])
    }
}

/// One sampler per block, kept consistent with `bg` / `m_rs`.
#[derive(Debug, Clone)]
pub struct EGroups {
    groups: Vec<FenwickSampler>,
}

impl EGroups {
    /// Build from the current block multigraph and its edge counts.
    pub fn new(bg: &Multigraph, mrs: &[i64]) -> Self {
        let mut eg = EGroups {
            groups: vec![FenwickSampler::default(); bg.num_vertices()],
        };
        for e in bg.edges() {
            let (r, s) = bg.endpoints(e);
            eg.adjust(r, s, mrs[e] as f64);
        }
        eg
    }

    /// Apply a `(r, s) += d` edge-count change to the samplers.
    pub fn adjust(&mut self, r: usize, s: usize, d: f64) {
        if r == s {
            // a block self-loop is seen from both ends of each edge
            self.groups[r].adjust(r, 2. * d);
        } else {
            self.groups[r].adjust(s, d);
            self.groups[s].adjust(r, d);
        }
    }

    pub fn add_block(&mut self) {
        self.groups.push(FenwickSampler::default());
    }

    /// Sample the block at the far end of a random edge incident to `t`.
    pub fn sample_edge<R: Rng>(&self, t: usize, rng: &mut R) -> Option<usize> {
        self.groups[t].sample(rng)
    }

    /// Verify the samplers agree with `bg` / `m_rs`.
    pub fn check(&self, bg: &Multigraph, mrs: &[i64]) -> bool {
        let fresh = EGroups::new(bg, mrs);
        if fresh.groups.len() != self.groups.len() {
            return false;
        }
        for (t, g) in fresh.groups.iter().enumerate() {
            for (i, &s) in g.items.iter().enumerate() {
                if (self.groups[t].weight(s) - g.weights[i]).abs() > 1e-8 {
                    return false;
                }
            }
            for (i, &s) in self.groups[t].items.iter().enumerate() {
                if (g.weight(s) - self.groups[t].weights[i]).abs() > 1e-8 {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn fenwick_sampling_frequencies() {
        let mut s = FenwickSampler::default();
        s.adjust(7, 1.);
        s.adjust(3, 3.);
        s.adjust(5, 0.);
        let mut rng = SmallRng::seed_from_u64(7);
        let mut counts: FnvHashMap<usize, usize> = FnvHashMap::default();
        for _ in 0..4000 {
            *counts.entry(s.sample(&mut rng).unwrap()).or_insert(0) += 1;
        }
        assert_eq!(counts.get(&5), None, "zero weight never sampled");
        let c3 = counts[&3] as f64;
        let c7 = counts[&7] as f64;
        assert!((c3 / c7 - 3.).abs() < 0.5, "ratio {} off", c3 / c7);
    }

    #[test]
    fn fenwick_adjust_down_to_zero() {
        let mut s = FenwickSampler::default();
        s.adjust(0, 2.);
        s.adjust(1, 1.);
        s.adjust(0, -2.);
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(s.sample(&mut rng), Some(1));
        }
    }

    #[test]
    fn egroups_follow_block_graph() {
        let mut bg = Multigraph::new(2, false);
        let e0 = bg.add_edge(0, 1);
        let e1 = bg.add_edge(0, 0);
        let mut mrs = vec![0i64; bg.edge_bound()];
        mrs[e0] = 3;
        mrs[e1] = 1;
        let eg = EGroups::new(&bg, &mrs);
        assert!(eg.check(&bg, &mrs));
        // from block 1, only block 0 is reachable
        let mut rng = SmallRng::seed_from_u64(3);
        assert_eq!(eg.sample_edge(1, &mut rng), Some(0));
        // from block 0 the self-loop weighs double: 2 vs 3
        assert!((eg.groups[0].weight(0) - 2.).abs() < 1e-12);
        assert!((eg.groups[0].weight(1) - 3.).abs() < 1e-12);
    }

    #[test]
    fn check_detects_drift() {
        let mut bg = Multigraph::new(2, false);
        let e0 = bg.add_edge(0, 1);
        let mut mrs = vec![0i64; bg.edge_bound()];
        mrs[e0] = 2;
        let mut eg = EGroups::new(&bg, &mrs);
        assert!(eg.check(&bg, &mrs));
        eg.adjust(0, 1, 1.);
        assert!(!eg.check(&bg, &mrs));
    }
}
