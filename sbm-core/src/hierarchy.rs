//! Arena for a chain of coupled states (the nested SBM).
//!
//! Level 0 is either an ordinary or an overlapping state; every further
//! level is an ordinary `BlockState` whose graph mirrors the block
//! multigraph one level below. The chain is stored flat and operations
//! recurse by splitting off the tail slice, so each state reaches its
//! coupled counterpart by position instead of by pointer — the variant
//! dispatch happens once here, at the coupling boundary, and the inner
//! loops below stay statically typed.

use crate::block_state::{BlockState, StateOptions};
use crate::entropy::EntropyArgs;
use crate::errors::Result;
use crate::overlap_state::OverlapBlockState;
use rand::Rng;

/// The bottom of the chain.
#[derive(Debug, Clone)]
pub enum BaseState {
    Block(BlockState),
    Overlap(OverlapBlockState),
}

/// A chain of coupled SBM states sharing one move/propagation protocol.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    pub base: BaseState,
    pub upper: Vec<BlockState>,
}

impl Hierarchy {
    pub fn new(base: BaseState) -> Self {
        Hierarchy {
            base,
            upper: Vec::new(),
        }
    }

    pub fn from_block(state: BlockState) -> Self {
        Hierarchy::new(BaseState::Block(state))
    }

    pub fn from_overlap(state: OverlapBlockState) -> Self {
        Hierarchy::new(BaseState::Overlap(state))
    }

    /// Number of levels, the base included.
    pub fn depth(&self) -> usize {
        1 + self.upper.len()
    }

    pub fn base_block(&self) -> Option<&BlockState> {
        match &self.base {
            BaseState::Block(s) => Some(s),
            BaseState::Overlap(_) => None,
        }
    }

    pub fn base_block_mut(&mut self) -> Option<&mut BlockState> {
        match &mut self.base {
            BaseState::Block(s) => Some(s),
            BaseState::Overlap(_) => None,
        }
    }

    /// Stack a new top level with partition `b_upper` over the current
    /// top's blocks, and couple the current top to it with `ea`.
    pub fn couple_state(&mut self, b_upper: Vec<usize>, ea: EntropyArgs, opts: StateOptions) {
        let new_top = match self.upper.last() {
            Some(top) => top.overlying(b_upper, opts),
            None => match &self.base {
                BaseState::Block(s) => s.overlying(b_upper, opts),
                BaseState::Overlap(s) => s.overlying(b_upper, opts),
            },
        };
        match self.upper.last_mut() {
            Some(top) => top.couple_state(ea),
            None => match &mut self.base {
                BaseState::Block(s) => s.couple_state(ea),
                BaseState::Overlap(s) => s.couple_state(ea),
            },
        }
        self.upper.push(new_top);
    }

    /// Drop the top level.
    pub fn decouple_top(&mut self) {
        if self.upper.pop().is_some() {
            match self.upper.last_mut() {
                Some(top) => top.decouple_state(),
                None => match &mut self.base {
                    BaseState::Block(s) => s.decouple_state(),
                    BaseState::Overlap(s) => s.decouple_state(),
                },
            }
        }
    }

    // ---- base-level operations, propagated through the chain ----------

    pub fn move_vertex(&mut self, v: usize, nr: usize) -> Result<()> {
        match &mut self.base {
            BaseState::Block(s) => s.move_vertex(v, nr, &mut self.upper),
            BaseState::Overlap(s) => s.move_vertex(v, nr, &mut self.upper),
        }
    }

    pub fn virtual_move(&mut self, v: usize, r: usize, nr: usize, ea: &EntropyArgs) -> Result<f64> {
        match &mut self.base {
            BaseState::Block(s) => s.virtual_move(v, r, nr, ea, &mut self.upper),
            BaseState::Overlap(s) => s.virtual_move(v, r, nr, ea, &mut self.upper),
        }
    }

    pub fn sample_block<R: Rng>(&mut self, v: usize, c: f64, d: f64, rng: &mut R) -> usize {
        match &mut self.base {
            BaseState::Block(s) => s.sample_block(v, c, d, rng, &mut self.upper),
            BaseState::Overlap(s) => s.sample_block(v, c, d, rng, &mut self.upper),
        }
    }

    pub fn get_move_prob(
        &mut self,
        v: usize,
        r: usize,
        s: usize,
        c: f64,
        d: f64,
        reverse: bool,
    ) -> f64 {
        match &mut self.base {
            BaseState::Block(st) => st.get_move_prob(v, r, s, c, d, reverse),
            BaseState::Overlap(st) => st.get_move_prob(v, r, s, c, d, reverse),
        }
    }

    /// Entropy of the base level; with `propagate`, the whole chain.
    pub fn entropy(&self, ea: &EntropyArgs, propagate: bool) -> Result<f64> {
        match &self.base {
            BaseState::Block(s) => s.entropy(ea, &self.upper, propagate),
            BaseState::Overlap(s) => s.entropy(ea, &self.upper, propagate),
        }
    }

    pub fn check_edge_counts(&self) -> bool {
        match &self.base {
            BaseState::Block(s) => s.check_edge_counts(true, &self.upper),
            BaseState::Overlap(s) => s.check_edge_counts(true, &self.upper),
        }
    }

    pub fn check_node_counts(&self) -> bool {
        let base_ok = match &self.base {
            BaseState::Block(s) => s.check_node_counts(),
            BaseState::Overlap(s) => s.check_node_counts(),
        };
        base_ok && self.upper.iter().all(|s| s.check_node_counts())
    }

    /// Fully independent copy of the whole chain.
    pub fn deep_copy(&self) -> Hierarchy {
        self.clone()
    }

    /// Adopt block `r`'s labels and chain membership from another
    /// hierarchy, growing each level as needed (used when grafting a
    /// partition branch from a donor state).
    pub fn copy_branch(&mut self, r: usize, other: &Hierarchy) {
        let mut r_cur = r;
        for (level, src) in other.upper.iter().enumerate() {
            // make the block addressable at this level
            {
                let (bclabel_len, tail) = match (&mut self.base, level) {
                    (BaseState::Block(s), 0) => (s.bclabel.len(), None),
                    (BaseState::Overlap(s), 0) => (s.bclabel.len(), None),
                    _ => (0, Some(level - 1)),
                };
                match tail {
                    None => {
                        if r_cur >= bclabel_len {
                            let grow = r_cur + 1 - bclabel_len;
                            match &mut self.base {
                                BaseState::Block(s) => {
                                    s.add_block(grow, &mut self.upper);
                                }
                                BaseState::Overlap(s) => {
                                    s.add_block(grow, &mut self.upper);
                                }
                            }
                        }
                    }
                    Some(i) => {
                        let (cur, rest) = self.upper[i..].split_first_mut().unwrap();
                        if r_cur >= cur.bclabel.len() {
                            cur.add_block(r_cur + 1 - cur.bclabel.len(), rest);
                        }
                    }
                }
            }

            // copy the label and the membership one level up
            let donor_bclabel = if level == 0 {
                match &other.base {
                    BaseState::Block(s) => s.bclabel[r_cur],
                    BaseState::Overlap(s) => s.bclabel[r_cur],
                }
            } else {
                other.upper[level - 1].bclabel[r_cur]
            };
            match (&mut self.base, level) {
                (BaseState::Block(s), 0) => s.bclabel[r_cur] = donor_bclabel,
                (BaseState::Overlap(s), 0) => s.bclabel[r_cur] = donor_bclabel,
                _ => self.upper[level - 1].bclabel[r_cur] = donor_bclabel,
            }

            let next = src.b[r_cur];
            self.upper[level].b[r_cur] = next;
            self.upper[level].pclabel[r_cur] = src.pclabel[r_cur];
            r_cur = next;
        }
    }

    pub fn init_mcmc(&mut self, c: f64) {
        match &mut self.base {
            BaseState::Block(s) => s.init_mcmc(c),
            BaseState::Overlap(s) => s.init_mcmc(c),
        }
    }
}
