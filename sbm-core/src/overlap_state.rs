//! Overlapping SBM state over a half-edge graph.
//!
//! Vertices of `g` are half-edges: one per (edge, endpoint) pair of the
//! original graph, so every vertex touches exactly one edge. The
//! partition labels half-edges independently, and an original node
//! belongs to the union of its half-edges' blocks. Counters mirror
//! `BlockState` except that `w_r` counts distinct original nodes and the
//! degree/parallel corrections group half-edges by node.
//!
//! The dense formulation is undefined here and surfaces `NotSupported`.

use crate::block_state::{weighted_deg, BlockState};
use crate::egroups::EGroups;
use crate::emat::EdgeIndex;
use crate::entries::{move_entries, EntrySet, PropEntry};
use crate::entropy::{eterm, eterm_exact, vterm, vterm_exact, EntropyArgs};
use crate::errors::{Result, StateError};
use crate::graph::{ensure_len, Multigraph};
use crate::idx_set::IdxSet;
use crate::overlap_stats::OverlapStats;
use crate::partition_stats::{get_edges_dl, PartitionStats};
use crate::recs::parallel_term;
use fnv::{FnvHashMap, FnvHashSet};
use rand::Rng;
use sbm_util::{lgamma_fast, safelog_fast};
use std::mem;

/// Construction options for the overlapping state.
#[derive(Debug, Clone, Default)]
pub struct OverlapOptions {
    pub deg_corr: bool,
    pub use_hash: bool,
    pub b_count: Option<usize>,
    pub bclabel: Option<Vec<usize>>,
    pub pclabel: Option<Vec<usize>>,
}

#[derive(Debug, Clone)]
pub struct OverlapBlockState {
    pub g: Multigraph,
    pub bg: Multigraph,
    pub b: Vec<usize>,
    pub eweight: Vec<i64>,
    pub degs: Vec<(i64, i64)>,
    pub mrs: Vec<i64>,
    pub mrp: Vec<i64>,
    pub mrm: Vec<i64>,
    /// Distinct-node occupancy per block.
    pub wr: Vec<i64>,
    pub bclabel: Vec<usize>,
    pub pclabel: Vec<usize>,
    pub deg_corr: bool,
    pub e: i64,
    pub overlap_stats: OverlapStats,
    pub empty_groups: IdxSet,
    pub candidate_groups: IdxSet,
    pub emat: EdgeIndex,
    pub egroups: Option<EGroups>,
    pub egroups_update: bool,
    pub partition_stats: Vec<PartitionStats>,
    pub m_entries: EntrySet,
    pub coupled_ea: Option<EntropyArgs>,
}

impl OverlapBlockState {
    /// `node_index` maps each half-edge vertex of `g` to its original
    /// node; `half_edges` is the inverse.
    pub fn new(
        g: Multigraph,
        b: Vec<usize>,
        node_index: Vec<usize>,
        half_edges: Vec<Vec<usize>>,
        opts: OverlapOptions,
    ) -> Self {
        let directed = g.is_directed();
        let nv = g.num_vertices();
        assert_eq!(b.len(), nv);
        assert_eq!(node_index.len(), nv);

        let b_count = opts
            .b_count
            .unwrap_or_else(|| b.iter().copied().max().map_or(1, |m| m + 1));

        let mut eweight = vec![0i64; g.edge_bound()];
        for e in g.edges() {
            eweight[e] = 1;
        }
        let e_total: i64 = g.num_edges() as i64;

        sbm_util::init_cache(((nv as i64 + e_total) as usize + 2).max(1 << 10));
        sbm_util::init_q_cache(((e_total as usize) + 1).min(1 << 10));

        let degs: Vec<(i64, i64)> = (0..nv).map(|v| weighted_deg(&g, v, &eweight)).collect();

        let mut bg = Multigraph::new(b_count, directed);
        let mut mrs: Vec<i64> = Vec::new();
        let mut pair_edge: FnvHashMap<(usize, usize), usize> = FnvHashMap::default();
        for ei in g.edges() {
            let (u, v) = g.endpoints(ei);
            let (mut r, mut s) = (b[u], b[v]);
            if !directed && s < r {
                mem::swap(&mut r, &mut s);
            }
            let me = *pair_edge.entry((r, s)).or_insert_with(|| {
                let me = bg.add_edge(r, s);
                ensure_len(&mut mrs, bg.edge_bound());
                me
            });
            mrs[me] += eweight[ei];
        }

        let mut mrp = vec![0i64; b_count];
        let mut mrm = vec![0i64; b_count];
        for me in bg.edges() {
            let (r, s) = bg.endpoints(me);
            let d = mrs[me];
            if directed {
                mrp[r] += d;
                mrm[s] += d;
            } else {
                mrp[r] += d;
                mrp[s] += d;
                mrm[r] += d;
                mrm[s] += d;
            }
        }

        let overlap_stats = OverlapStats::new(&b, node_index, half_edges, b_count);

        let mut wr = vec![0i64; b_count];
        let mut empty_groups = IdxSet::default();
        let mut candidate_groups = IdxSet::default();
        for r in 0..b_count {
            wr[r] = overlap_stats.get_block_size(r) as i64;
            if wr[r] == 0 {
                empty_groups.insert(r);
            } else {
                candidate_groups.insert(r);
            }
        }

        let bclabel = opts.bclabel.unwrap_or_else(|| vec![0; b_count]);
        let pclabel = opts.pclabel.unwrap_or_else(|| vec![0; nv]);
        let emat = EdgeIndex::new(&bg, opts.use_hash);
        let m_entries = EntrySet::new(directed, 0);

        let mut state = OverlapBlockState {
            g,
            bg,
            b,
            eweight,
            degs,
            mrs,
            mrp,
            mrm,
            wr,
            bclabel,
            pclabel,
            deg_corr: opts.deg_corr,
            e: e_total,
            overlap_stats,
            empty_groups,
            candidate_groups,
            emat,
            egroups: None,
            egroups_update: true,
            partition_stats: Vec::new(),
            m_entries,
            coupled_ea: None,
        };
        state.init_partition_stats();
        state
    }

    /// Build the half-edge expansion of an ordinary graph: one vertex
    /// per edge endpoint, labels seeded from `b_nodes`.
    pub fn from_node_graph(
        g: &Multigraph,
        b_nodes: &[usize],
        opts: OverlapOptions,
    ) -> OverlapBlockState {
        let n = g.num_vertices();
        let mut node_index = Vec::new();
        let mut half_edges: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut hg = Multigraph::new(0, g.is_directed());
        let mut b = Vec::new();
        for e in g.edges() {
            let (u, v) = g.endpoints(e);
            let hu = hg.add_vertex();
            node_index.push(u);
            half_edges[u].push(hu);
            b.push(b_nodes[u]);
            let hv = hg.add_vertex();
            node_index.push(v);
            half_edges[v].push(hv);
            b.push(b_nodes[v]);
            hg.add_edge(hu, hv);
        }
        OverlapBlockState::new(hg, b, node_index, half_edges, opts)
    }

    /// Build the state for the next hierarchy level over this state's
    /// block multigraph.
    pub fn overlying(
        &self,
        b_upper: Vec<usize>,
        mut opts: crate::block_state::StateOptions,
    ) -> BlockState {
        assert_eq!(b_upper.len(), self.bg.num_vertices());
        opts.eweight = Some(self.mrs.clone());
        opts.vweight = Some(self.wr.iter().map(|&w| i64::from(w > 0)).collect());
        BlockState::new(self.bg.clone(), b_upper, opts)
    }

    // ====================================================================
    // Accessors
    // ====================================================================

    pub fn get_n(&self) -> usize {
        self.overlap_stats.get_n()
    }

    pub fn node_weight(&self, _v: usize) -> i64 {
        1
    }

    pub fn is_last(&self, v: usize) -> bool {
        self.overlap_stats.virtual_remove_size(v, self.b[v]) == 0
    }

    pub fn virtual_remove_size(&self, v: usize) -> usize {
        self.overlap_stats.virtual_remove_size(v, self.b[v])
    }

    pub fn total_actual_b(&self) -> usize {
        self.partition_stats.iter().map(|ps| ps.get_actual_b()).sum()
    }

    pub fn init_partition_stats(&mut self) {
        self.partition_stats.clear();
        let classes = self.pclabel.iter().copied().max().map_or(1, |m| m + 1);
        for _ in 0..classes {
            self.partition_stats.push(PartitionStats::new(
                self.bg.num_vertices(),
                self.e,
                self.g.is_directed(),
            ));
        }
        for v in self.g.vertices() {
            let (kin, kout) = self.degs[v];
            self.partition_stats[self.pclabel[v]].add_vertex(self.b[v], kin, kout, 1);
        }
    }

    // ====================================================================
    // State modification
    // ====================================================================

    fn get_move_entries(
        &self,
        v: usize,
        r: Option<usize>,
        nr: Option<usize>,
        m_entries: &mut EntrySet,
    ) {
        move_entries(
            v,
            r,
            nr,
            &self.b,
            &self.g,
            &self.eweight,
            m_entries,
            |_| false,
            None,
        );
    }

    fn apply_delta(&mut self, m_entries: &EntrySet, upper: &mut [BlockState]) {
        let coupled = self.coupled_ea.is_some() && !upper.is_empty();
        let mut applied: Vec<PropEntry> = Vec::new();

        let mut ops: Vec<(usize, usize, i64)> = Vec::new();
        m_entries.entries_op(&self.emat, |t, s, _me, d| {
            if d != 0 {
                ops.push((t, s, d));
            }
        });

        for (t, s, d) in ops {
            let me = match self.emat.get_me(t, s) {
                Some(me) => me,
                None => {
                    debug_assert!(d > 0);
                    let me = self.bg.add_edge(t, s);
                    ensure_len(&mut self.mrs, self.bg.edge_bound());
                    self.mrs[me] = 0;
                    self.emat.put_me(t, s, me);
                    if coupled {
                        let e2 = upper[0].mirror_g_add_edge(t, s);
                        debug_assert_eq!(e2, me);
                    }
                    me
                }
            };
            self.mrs[me] += d;
            debug_assert!(self.mrs[me] >= 0);
            if self.g.is_directed() {
                self.mrp[t] += d;
                self.mrm[s] += d;
            } else {
                self.mrp[t] += d;
                self.mrp[s] += d;
                self.mrm[t] += d;
                self.mrm[s] += d;
            }

            if self.egroups_update {
                if let Some(eg) = &mut self.egroups {
                    eg.adjust(t, s, d as f64);
                }
            }
            if coupled {
                upper[0].mirror_weight_change(me, t, s, d, &[], &[]);
            }
            if self.mrs[me] == 0 {
                self.emat.remove_me(t, s);
                self.bg.remove_edge(me);
                if coupled {
                    let (u0, rest) = upper.split_first_mut().unwrap();
                    u0.on_lower_edge_removed(me, rest);
                }
            }
            if coupled {
                applied.push(PropEntry {
                    u: t,
                    v: s,
                    me: self.emat.get_me(t, s),
                    delta: d,
                    rec: Vec::new(),
                });
            }
        }

        if coupled && !applied.is_empty() {
            let (u0, rest) = upper.split_first_mut().unwrap();
            u0.propagate_delta(&applied, rest);
        }
    }

    /// Add or remove one half-edge in block `r`.
    pub fn modify_vertex(&mut self, v: usize, r: usize, add: bool, upper: &mut [BlockState]) {
        if add && self.wr[r] == 0 {
            self.empty_groups.erase(r);
            self.candidate_groups.insert(r);
        }

        let mut me = mem::take(&mut self.m_entries);
        if add {
            self.get_move_entries(v, None, Some(r), &mut me);
        } else {
            self.get_move_entries(v, Some(r), None, &mut me);
        }
        self.apply_delta(&me, upper);
        self.m_entries = me;

        if add {
            self.overlap_stats.add_half_edge(v, r);
            self.b[v] = r;
        } else {
            self.overlap_stats.remove_half_edge(v, r);
        }
        self.wr[r] = self.overlap_stats.get_block_size(r) as i64;

        if !add && self.wr[r] == 0 {
            self.candidate_groups.erase(r);
            self.empty_groups.insert(r);
        }
    }

    pub fn add_vertex(&mut self, v: usize, r: usize, upper: &mut [BlockState]) {
        self.modify_vertex(v, r, true, upper);
    }

    pub fn remove_vertex(&mut self, v: usize, upper: &mut [BlockState]) {
        let r = self.b[v];
        self.modify_vertex(v, r, false, upper);
    }

    pub fn allow_move(&self, r: usize, nr: usize, upper: &[BlockState]) -> bool {
        if self.coupled_ea.is_some() {
            if let Some((u0, rest)) = upper.split_first() {
                let rr = u0.b[r];
                let ss = u0.b[nr];
                if rr != ss && !u0.allow_move(rr, ss, rest) {
                    return false;
                }
            }
        }
        self.bclabel[r] == self.bclabel[nr]
    }

    /// Move one half-edge to block `nr`.
    pub fn move_vertex(&mut self, v: usize, nr: usize, upper: &mut [BlockState]) -> Result<()> {
        let r = self.b[v];
        if r == nr {
            return Ok(());
        }
        if !self.allow_move(r, nr, upper) {
            return Err(StateError::ConstraintBarrier { r, nr });
        }

        let r_vacate = self.overlap_stats.virtual_remove_size(v, r) == 0;
        let nr_occupy = self.wr[nr] == 0;

        self.remove_vertex(v, upper);
        self.add_vertex(v, nr, upper);

        if self.coupled_ea.is_some() && !upper.is_empty() {
            if r_vacate {
                let (u0, rest) = upper.split_first_mut().unwrap();
                let hr = u0.b[r];
                u0.remove_partition_node(r, hr, rest);
                u0.set_vertex_weight(r, 0);
            }
            if nr_occupy {
                let (u0, rest) = upper.split_first_mut().unwrap();
                u0.set_vertex_weight(nr, 1);
                let hnr = u0.b[nr];
                u0.add_partition_node(nr, hnr, rest);
            }
        }

        let (kin, kout) = self.degs[v];
        let c = self.pclabel[v];
        self.partition_stats[c].remove_vertex(r, kin, kout, 1);
        self.partition_stats[c].add_vertex(nr, kin, kout, 1);
        Ok(())
    }

    pub fn set_partition(&mut self, bs: &[usize], upper: &mut [BlockState]) -> Result<()> {
        if bs.len() != self.g.num_vertices() {
            return Err(StateError::ShapeMismatch {
                what: "set_partition",
                left: bs.len(),
                right: self.g.num_vertices(),
            });
        }
        for v in 0..bs.len() {
            while bs[v] >= self.bg.num_vertices() {
                self.add_block(1, upper);
            }
            self.move_vertex(v, bs[v], upper)?;
        }
        Ok(())
    }

    pub fn add_block(&mut self, count: usize, upper: &mut [BlockState]) -> usize {
        let mut r = self.bg.num_vertices().saturating_sub(1);
        for _ in 0..count {
            r = self.bg.add_vertex();
            self.wr.push(0);
            self.mrp.push(0);
            self.mrm.push(0);
            self.bclabel.push(0);
            self.empty_groups.insert(r);
            self.overlap_stats.add_block();
            for ps in &mut self.partition_stats {
                ps.add_block();
            }
            if let Some(eg) = &mut self.egroups {
                eg.add_block();
            }
            if self.coupled_ea.is_some() {
                if let Some((u0, rest)) = upper.split_first_mut() {
                    u0.coupled_resize_vertex(rest);
                }
            }
        }
        self.emat.add_block(&self.bg);
        r
    }

    // ====================================================================
    // Virtual moves
    // ====================================================================

    fn entries_ds(&self, m_entries: &EntrySet, exact: bool) -> f64 {
        let directed = self.g.is_directed();
        let mut ds = 0.;
        m_entries.entries_op(&self.emat, |t, s, me, d| {
            let m_old = me.map_or(0, |me| self.mrs[me]);
            let m_new = m_old + d;
            if exact {
                ds += eterm_exact(t, s, m_new.max(0) as usize, directed)
                    - eterm_exact(t, s, m_old.max(0) as usize, directed);
            } else {
                ds += eterm(t, s, m_new.max(0) as usize, directed)
                    - eterm(t, s, m_old.max(0) as usize, directed);
            }
        });
        ds
    }

    fn virtual_move_sparse(
        &self,
        v: usize,
        nr: usize,
        multigraph: bool,
        exact: bool,
        m_entries: &EntrySet,
    ) -> f64 {
        let r = self.b[v];
        if r == nr {
            return 0.;
        }
        let directed = self.g.is_directed();
        let (kin, kout) = self.degs[v];

        let mut ds = self.entries_ds(m_entries, exact);

        let dwr = self.wr[r] - self.overlap_stats.virtual_remove_size(v, r) as i64;
        let dwnr = self.overlap_stats.virtual_add_size(v, nr) as i64 - self.wr[nr];

        if multigraph {
            ds += self.virtual_move_parallel_ds(v, r, nr);
        }

        let vt = |mrp: i64, mrm: i64, w: i64| -> f64 {
            if exact {
                vterm_exact(
                    mrp.max(0) as usize,
                    mrm.max(0) as usize,
                    w.max(0) as usize,
                    self.deg_corr,
                    directed,
                )
            } else {
                vterm(
                    mrp.max(0) as usize,
                    mrm.max(0) as usize,
                    w.max(0) as usize,
                    self.deg_corr,
                    directed,
                )
            }
        };

        ds += vt(self.mrp[r] - kout, self.mrm[r] - kin, self.wr[r] - dwr);
        ds += vt(self.mrp[nr] + kout, self.mrm[nr] + kin, self.wr[nr] + dwnr);
        ds -= vt(self.mrp[r], self.mrm[r], self.wr[r]);
        ds -= vt(self.mrp[nr], self.mrm[nr], self.wr[nr]);
        ds
    }

    /// Bundle key for parallel-edge grouping: canonical label pair plus
    /// the node-self-loop marker.
    fn bundle_key(&self, a: usize, b: usize, same_node: bool) -> (usize, usize, bool) {
        let (x, y) = if !self.g.is_directed() && b < a {
            (b, a)
        } else {
            (a, b)
        };
        (x, y, same_node && x == y)
    }

    /// Parallel-edge bundle sizes among edges joining nodes `i` and `j`.
    fn pair_bundles(&self, i: usize, j: usize) -> FnvHashMap<(usize, usize, bool), i64> {
        let mut counts: FnvHashMap<(usize, usize, bool), i64> = FnvHashMap::default();
        let mut seen: FnvHashSet<usize> = FnvHashSet::default();
        for &w in self.overlap_stats.get_half_edges(i) {
            let es: Vec<usize> = if self.g.is_directed() {
                self.g.out_edges(w).chain(self.g.in_edges(w)).collect()
            } else {
                self.g.out_edges(w).collect()
            };
            for e2 in es {
                if !seen.insert(e2) {
                    continue;
                }
                let (a, b) = self.g.endpoints(e2);
                let other = if a == w { b } else { a };
                if self.overlap_stats.get_node(other) != j {
                    continue;
                }
                let key = self.bundle_key(self.b[a], self.b[b], i == j);
                *counts.entry(key).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Change of the parallel-edge correction when half-edge `v` moves.
    pub fn virtual_move_parallel_ds(&self, v: usize, r: usize, nr: usize) -> f64 {
        let i = self.overlap_stats.get_node(v);
        let mut ds = 0.;
        let es: Vec<usize> = if self.g.is_directed() {
            self.g.out_edges(v).chain(self.g.in_edges(v)).collect()
        } else {
            self.g.out_edges(v).collect()
        };
        for e in es {
            let (a, b) = self.g.endpoints(e);
            let u = if a == v { b } else { a };
            let j = self.overlap_stats.get_node(u);
            let counts = self.pair_bundles(i, j);

            let (la, lb) = if a == v {
                (r, self.b[b])
            } else {
                (self.b[a], r)
            };
            let (na, nb) = if a == v {
                (nr, self.b[b])
            } else {
                (self.b[a], nr)
            };
            let old_key = self.bundle_key(la, lb, i == j);
            let new_key = self.bundle_key(na, nb, i == j);
            if old_key == new_key {
                continue;
            }
            let m_old = counts.get(&old_key).copied().unwrap_or(0);
            let m_new = counts.get(&new_key).copied().unwrap_or(0);
            ds += parallel_term(m_old - 1, old_key.2) - parallel_term(m_old, old_key.2);
            ds += parallel_term(m_new + 1, new_key.2) - parallel_term(m_new, new_key.2);
        }
        ds
    }

    /// Change of the grouped degree entropy when half-edge `v` moves.
    pub fn virtual_move_deg_ds(&self, v: usize, r: usize, nr: usize) -> f64 {
        let i = self.overlap_stats.get_node(v);
        let (kin, kout) = self.degs[v];
        let mut out_r = 0i64;
        let mut out_nr = 0i64;
        let mut in_r = 0i64;
        let mut in_nr = 0i64;
        for &w in self.overlap_stats.get_half_edges(i) {
            let (wkin, wkout) = self.degs[w];
            if self.b[w] == r {
                out_r += wkout;
                in_r += wkin;
            } else if self.b[w] == nr {
                out_nr += wkout;
                in_nr += wkin;
            }
        }
        let lg = |x: i64| lgamma_fast(x.max(0) as usize + 1);
        let mut ds = 0.;
        ds += lg(out_r) - lg(out_r - kout);
        ds += lg(in_r) - lg(in_r - kin);
        ds += lg(out_nr) - lg(out_nr + kout);
        ds += lg(in_nr) - lg(in_nr + kin);
        ds
    }

    /// Entropy delta of moving half-edge `v` from `r` to `nr` without
    /// mutating state; `+∞` for disallowed moves.
    pub fn virtual_move(
        &mut self,
        v: usize,
        r: usize,
        nr: usize,
        ea: &EntropyArgs,
        upper: &mut [BlockState],
    ) -> Result<f64> {
        if r == nr {
            return Ok(0.);
        }
        if !self.allow_move(r, nr, upper) {
            return Ok(f64::INFINITY);
        }

        let mut m_entries = mem::take(&mut self.m_entries);
        self.get_move_entries(v, Some(r), Some(nr), &mut m_entries);

        let res = (|| -> Result<f64> {
            let mut ds = 0.;
            if ea.adjacency {
                if ea.dense {
                    return Err(StateError::NotSupported(
                        "dense entropy for the overlapping model",
                    ));
                }
                ds = self.virtual_move_sparse(v, nr, ea.multigraph, ea.exact, &m_entries);
                if self.deg_corr && ea.deg_entropy {
                    ds += self.virtual_move_deg_ds(v, r, nr);
                }
            }

            let mut ds_dl = 0.;
            ds_dl += self.get_delta_partition_dl(v, r, nr, ea, upper);

            let (kin, kout) = self.degs[v];
            let c = self.pclabel[v];
            if self.deg_corr && ea.degree_dl {
                ds_dl += self.partition_stats[c].get_delta_deg_dl(
                    Some(r),
                    Some(nr),
                    kin,
                    kout,
                    1,
                    ea.degree_dl_kind,
                );
            }
            if ea.edges_dl {
                let actual_b = self.total_actual_b();
                ds_dl += self.partition_stats[c].get_delta_edges_dl(Some(r), Some(nr), 1, actual_b);
            }

            if self.coupled_ea.is_some() && !upper.is_empty() {
                let mut entries = mem::take(&mut m_entries.p_entries);
                entries.clear();
                m_entries.entries_op(&self.emat, |t, u2, me, delta| {
                    if delta == 0 {
                        return;
                    }
                    entries.push(PropEntry {
                        u: t,
                        v: u2,
                        me,
                        delta,
                        rec: Vec::new(),
                    });
                });

                let dr = if self.overlap_stats.virtual_remove_size(v, r) == 0 {
                    -1
                } else {
                    0
                };
                let dnr = if self.wr[nr] == 0 { 1 } else { 0 };
                if !entries.is_empty() || dr != 0 || dnr != 0 {
                    let cea = self.coupled_ea.unwrap();
                    let (u0, rest) = upper.split_first_mut().unwrap();
                    let mut dbdx: Vec<f64> = Vec::new();
                    ds_dl += u0
                        .propagate_entries_ds(r, nr, dr, dnr, &mut entries, &cea, &mut dbdx, 0, rest);
                }
                m_entries.p_entries = entries;
            }

            Ok(ds + ea.beta_dl * ds_dl)
        })();

        self.m_entries = m_entries;
        res
    }

    pub fn get_delta_partition_dl(
        &self,
        v: usize,
        r: usize,
        nr: usize,
        ea: &EntropyArgs,
        upper: &mut [BlockState],
    ) -> f64 {
        if r == nr {
            return 0.;
        }
        let mut ds = 0.;
        if ea.partition_dl {
            let c = self.pclabel[v];
            ds += self.partition_stats[c].get_delta_partition_dl(Some(r), Some(nr), 1);
        }

        if self.coupled_ea.is_some() && !upper.is_empty() {
            let r_vacate = self.overlap_stats.virtual_remove_size(v, r) == 0;
            let nr_occupy = self.wr[nr] == 0;
            let cea = self.coupled_ea.unwrap();
            let (u0, rest) = upper.split_first_mut().unwrap();
            if r_vacate && nr_occupy {
                let (hr, hnr) = (u0.b[r], u0.b[nr]);
                ds += u0.get_delta_partition_dl(r, Some(hr), Some(hnr), &cea, rest);
            } else {
                if r_vacate {
                    let hr = u0.b[r];
                    ds += u0.get_delta_partition_dl(r, Some(hr), None, &cea, rest);
                }
                if nr_occupy {
                    let hnr = u0.b[nr];
                    ds += u0.get_delta_partition_dl(nr, None, Some(hnr), &cea, rest);
                }
            }
        }
        ds
    }

    // ====================================================================
    // Proposals
    // ====================================================================

    /// Unlike the non-overlapping state, a fresh block is always
    /// allocated here.
    pub fn get_empty_block(&mut self, v: usize, upper: &mut [BlockState]) -> usize {
        let s = self.add_block(1, upper);
        let r = self.b[v];
        self.bclabel[s] = self.bclabel[r];
        if self.coupled_ea.is_some() {
            if let Some(u0) = upper.first_mut() {
                u0.b[s] = u0.b[r];
            }
        }
        s
    }

    /// Uniformise over the node's half-edges, then cross the underlying
    /// edge.
    pub fn random_neighbor<R: Rng>(&self, v: usize, rng: &mut R) -> usize {
        let node = self.overlap_stats.get_node(v);
        let w = self.overlap_stats.sample_half_edge(node, rng);
        let mut nbr = w;
        for e in self.g.out_edges(w) {
            nbr = self.g.opposite(e, w);
        }
        if self.g.is_directed() {
            for e in self.g.in_edges(w) {
                nbr = self.g.source(e);
            }
        }
        nbr
    }

    pub fn sample_block<R: Rng>(
        &mut self,
        v: usize,
        c: f64,
        d: f64,
        rng: &mut R,
        upper: &mut [BlockState],
    ) -> usize {
        if d > 0. && rng.random_bool(d) && self.candidate_groups.len() < self.g.num_vertices() {
            self.get_empty_block(v, upper);
            let s = self.empty_groups.uniform_sample(rng);
            let r = self.b[v];
            if self.coupled_ea.is_some() {
                if let Some((u0, rest)) = upper.split_first_mut() {
                    u0.sample_branch(s, r, rng, rest);
                }
            }
            self.bclabel[s] = self.bclabel[r];
            return s;
        }

        let mut s = self.candidate_groups.uniform_sample(rng);

        if !c.is_infinite() {
            let u = self.random_neighbor(v, rng);
            let t = self.b[u];
            let mut p_rand = 0.;
            if c > 0. {
                let b_f = self.candidate_groups.len() as f64;
                p_rand = if self.g.is_directed() {
                    c * b_f / ((self.mrp[t] + self.mrm[t]) as f64 + c * b_f)
                } else {
                    c * b_f / (self.mrp[t] as f64 + c * b_f)
                };
            }
            if c == 0. || !rng.random_bool(p_rand.clamp(0., 1.)) {
                if self.egroups.is_none() {
                    self.init_egroups();
                }
                if let Some(se) = self.egroups.as_ref().unwrap().sample_edge(t, rng) {
                    s = se;
                }
            }
        }
        s
    }

    pub fn sample_block_local<R: Rng>(&self, v: usize, rng: &mut R) -> usize {
        let u = self.random_neighbor(v, rng);
        let w = self.random_neighbor(u, rng);
        self.b[w]
    }

    /// Proposal log-probability, summed over every half-edge of the
    /// original node.
    pub fn get_move_prob(
        &mut self,
        v: usize,
        r: usize,
        s: usize,
        c: f64,
        d: f64,
        reverse: bool,
    ) -> f64 {
        let mut me_set = mem::take(&mut self.m_entries);
        let target = if reverse { r } else { s };
        self.get_move_entries(v, Some(self.b[v]), Some(target), &mut me_set);
        let p = self.get_move_prob_with(v, r, s, c, d, reverse, &me_set);
        self.m_entries = me_set;
        p
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get_move_prob_with(
        &self,
        v: usize,
        r: usize,
        s: usize,
        c: f64,
        mut d: f64,
        reverse: bool,
        m_entries: &EntrySet,
    ) -> f64 {
        let directed = self.g.is_directed();
        let mut b_count = self.candidate_groups.len();

        if reverse {
            if self.overlap_stats.virtual_remove_size(v, s) == 0 {
                return d.ln();
            }
            if self.wr[r] == 0 {
                b_count += 1;
            }
        } else if self.wr[s] == 0 {
            return d.ln();
        }

        if b_count == self.g.num_vertices() {
            d = 0.;
        }
        if c.is_infinite() {
            return (1. - d).ln() - safelog_fast(b_count);
        }

        let (kin, kout) = self.degs[v];
        let node = self.overlap_stats.get_node(v);
        let mut p = 0.;
        let mut w = 0usize;

        for &hv in self.overlap_stats.get_half_edges(node) {
            let es: Vec<usize> = if directed {
                self.g.out_edges(hv).chain(self.g.in_edges(hv)).collect()
            } else {
                self.g.out_edges(hv).collect()
            };
            for e in es {
                let u = self.g.opposite(e, hv);
                let mut t = self.b[u];
                if u == v {
                    t = r;
                }
                w += 1;

                let mut mts = m_entries
                    .get_me(t, s, &self.emat)
                    .map_or(0, |me| self.mrs[me]);
                let mut mtp = self.mrp[t];
                let mut mst = mts;
                let mut mtm = mtp;
                if directed {
                    mst = m_entries
                        .get_me(s, t, &self.emat)
                        .map_or(0, |me| self.mrs[me]);
                    mtm = self.mrm[t];
                }

                if reverse {
                    let dts = m_entries.get_delta(t, s);
                    let dst = if directed {
                        m_entries.get_delta(s, t)
                    } else {
                        dts
                    };
                    mts += dts;
                    mst += dst;
                    if t == s {
                        mtp -= kout;
                        mtm -= kin;
                    }
                    if t == r {
                        mtp += kout;
                        mtm += kin;
                    }
                }

                let b_f = b_count as f64;
                if directed {
                    p += ((mts + mst) as f64 + c) / ((mtp + mtm) as f64 + c * b_f);
                } else {
                    if t == s {
                        mts *= 2;
                    }
                    p += (mts as f64 + c) / (mtp as f64 + c * b_f);
                }
            }
        }

        if w > 0 {
            (1. - d).ln() + p.ln() - (w as f64).ln()
        } else {
            (1. - d).ln() - safelog_fast(b_count)
        }
    }

    // ====================================================================
    // Entropy
    // ====================================================================

    /// Parallel-edge correction over node-pair bundles.
    pub fn get_parallel_entropy(&self) -> f64 {
        let mut counts: FnvHashMap<(usize, usize, usize, usize, bool), i64> = FnvHashMap::default();
        for e in self.g.edges() {
            let (a, b) = self.g.endpoints(e);
            let (mut i, mut j) = (self.overlap_stats.get_node(a), self.overlap_stats.get_node(b));
            let (mut la, mut lb) = (self.b[a], self.b[b]);
            if !self.g.is_directed() && (j, lb) < (i, la) {
                mem::swap(&mut i, &mut j);
                mem::swap(&mut la, &mut lb);
            }
            let key = self.bundle_key(la, lb, i == j);
            *counts.entry((i, j, key.0, key.1, key.2)).or_insert(0) += 1;
        }
        counts
            .iter()
            .map(|(&(_, _, _, _, is_loop), &m)| parallel_term(m, is_loop))
            .sum()
    }

    pub fn sparse_entropy(&self, multigraph: bool, deg_entropy: bool, exact: bool) -> f64 {
        let directed = self.g.is_directed();
        let mut s = 0.;
        for me in self.bg.edges() {
            let (r, ss) = self.bg.endpoints(me);
            if exact {
                s += eterm_exact(r, ss, self.mrs[me].max(0) as usize, directed);
            } else {
                s += eterm(r, ss, self.mrs[me].max(0) as usize, directed);
            }
        }
        for r in self.bg.vertices() {
            let (mrp, mrm, w) = (
                self.mrp[r].max(0) as usize,
                self.mrm[r].max(0) as usize,
                self.wr[r].max(0) as usize,
            );
            if exact {
                s += vterm_exact(mrp, mrm, w, self.deg_corr, directed);
            } else {
                s += vterm(mrp, mrm, w, self.deg_corr, directed);
            }
        }

        if self.deg_corr && deg_entropy {
            let mut in_hist: FnvHashMap<usize, i64> = FnvHashMap::default();
            let mut out_hist: FnvHashMap<usize, i64> = FnvHashMap::default();
            for node in 0..self.overlap_stats.get_n() {
                in_hist.clear();
                out_hist.clear();
                for &hv in self.overlap_stats.get_half_edges(node) {
                    let (kin, kout) = self.degs[hv];
                    *in_hist.entry(self.b[hv]).or_insert(0) += kin;
                    *out_hist.entry(self.b[hv]).or_insert(0) += kout;
                }
                for &k in in_hist.values() {
                    s -= lgamma_fast(k.max(0) as usize + 1);
                }
                for &k in out_hist.values() {
                    s -= lgamma_fast(k.max(0) as usize + 1);
                }
            }
        }

        if multigraph {
            s += self.get_parallel_entropy();
        }
        s
    }

    /// Full description length; the dense formulation is undefined for
    /// the overlapping model.
    pub fn entropy(&self, ea: &EntropyArgs, upper: &[BlockState], propagate: bool) -> Result<f64> {
        let mut s = 0.;
        let mut s_dl = 0.;

        if ea.adjacency {
            if ea.dense {
                return Err(StateError::NotSupported(
                    "dense entropy for the overlapping model",
                ));
            }
            s = self.sparse_entropy(ea.multigraph, ea.deg_entropy, ea.exact);
            if !ea.exact {
                let e_total: i64 = self.g.edges().map(|e| self.eweight[e]).sum();
                if ea.multigraph {
                    s -= e_total as f64;
                } else {
                    s += e_total as f64;
                }
            }
        }

        if ea.partition_dl {
            s_dl += self
                .partition_stats
                .iter()
                .map(|ps| ps.get_partition_dl())
                .sum::<f64>();
        }
        if self.deg_corr && ea.degree_dl {
            s_dl += self
                .partition_stats
                .iter()
                .map(|ps| ps.get_deg_dl(ea.degree_dl_kind))
                .sum::<f64>();
        }
        if ea.edges_dl {
            s_dl += get_edges_dl(self.total_actual_b(), self.e, self.g.is_directed());
        }

        let mut total = s + s_dl * ea.beta_dl;
        if propagate && self.coupled_ea.is_some() {
            if let Some((u0, rest)) = upper.split_first() {
                total += u0.entropy(&self.coupled_ea.unwrap(), rest, true)?;
            }
        }
        Ok(total)
    }

    // ====================================================================
    // Checks and lifecycle
    // ====================================================================

    pub fn check_edge_counts(&self, use_emat: bool, upper: &[BlockState]) -> bool {
        let directed = self.g.is_directed();
        let mut fresh: FnvHashMap<(usize, usize), i64> = FnvHashMap::default();
        for e in self.g.edges() {
            let (u, v) = self.g.endpoints(e);
            let (mut r, mut s) = (self.b[u], self.b[v]);
            if !directed && s < r {
                mem::swap(&mut r, &mut s);
            }
            *fresh.entry((r, s)).or_insert(0) += self.eweight[e];
        }
        for (&(r, s), &m) in &fresh {
            if m == 0 {
                continue;
            }
            let me = if use_emat {
                self.emat.get_me(r, s)
            } else {
                self.bg.edge_between(r, s).or_else(|| self.bg.edge_between(s, r))
            };
            if me.map_or(0, |me| self.mrs[me]) != m {
                debug_assert!(false, "edge count mismatch");
                return false;
            }
        }
        for me in self.bg.edges() {
            let (mut r, mut s) = self.bg.endpoints(me);
            if !directed && s < r {
                mem::swap(&mut r, &mut s);
            }
            if fresh.get(&(r, s)).copied().unwrap_or(0) != self.mrs[me] {
                debug_assert!(false, "stale block edge");
                return false;
            }
        }
        if self.coupled_ea.is_some() {
            if let Some((u0, rest)) = upper.split_first() {
                if !u0.check_edge_counts(false, rest) {
                    return false;
                }
            }
        }
        true
    }

    pub fn check_node_counts(&self) -> bool {
        for r in self.bg.vertices() {
            if self.wr[r] != self.overlap_stats.get_block_size(r) as i64 {
                debug_assert!(false, "node count mismatch");
                return false;
            }
        }
        true
    }

    pub fn init_egroups(&mut self) {
        self.egroups = Some(EGroups::new(&self.bg, &self.mrs));
    }

    pub fn clear_egroups(&mut self) {
        self.egroups = None;
    }

    pub fn init_mcmc(&mut self, c: f64) {
        self.clear_egroups();
        if !c.is_infinite() {
            self.init_egroups();
        }
    }

    pub fn relax_update(&mut self, relax: bool, upper: &mut [BlockState]) {
        if let Some(eg) = &self.egroups {
            debug_assert!(eg.check(&self.bg, &self.mrs));
        }
        self.egroups_update = !relax;
        if self.coupled_ea.is_some() {
            if let Some((u0, rest)) = upper.split_first_mut() {
                u0.relax_update(relax, rest);
            }
        }
    }

    pub fn sync_emat(&mut self) {
        self.emat.sync(&self.bg);
    }

    /// Overwrite counters from `other`; like the ordinary state, the
    /// partition statistics are cleared and must be rebuilt by the
    /// caller.
    pub fn deep_assign(&mut self, other: &OverlapBlockState) {
        self.bg = other.bg.clone();
        self.mrs = other.mrs.clone();
        self.mrp = other.mrp.clone();
        self.mrm = other.mrm.clone();
        self.wr = other.wr.clone();
        self.b = other.b.clone();
        self.overlap_stats = other.overlap_stats.clone();
        self.candidate_groups = other.candidate_groups.clone();
        self.empty_groups = other.empty_groups.clone();
        self.emat = other.emat.clone();
        self.partition_stats.clear();
    }

    pub fn couple_state(&mut self, ea: EntropyArgs) {
        self.coupled_ea = Some(ea);
    }

    pub fn decouple_state(&mut self) {
        self.coupled_ea = None;
    }

    pub fn deep_copy(&self) -> OverlapBlockState {
        self.clone()
    }
}
