//! Move-delta accumulator: the sparse `(r, s) -> δm_rs` description of a
//! tentative single-vertex move, kept separate from the authoritative
//! counters.
//!
//! One instance per state is reused across every virtual move; `set_move`
//! resets the entry list without releasing capacity. Undirected pairs are
//! canonicalised to `(min, max)` so both orientations accumulate into one
//! entry. When edge covariates are active each entry carries the
//! per-covariate sums alongside the integer delta.

use crate::emat::EdgeIndex;
use crate::graph::{Multigraph, NULL_BLOCK};
use fnv::FnvHashMap;

/// One propagated entry handed to the coupled level: lower-level block
/// pair, the resolved lower `bg` edge, the weight delta and the
/// per-covariate delta.
#[derive(Debug, Clone)]
pub struct PropEntry {
    pub u: usize,
    pub v: usize,
    pub me: Option<usize>,
    pub delta: i64,
    pub rec: Vec<f64>,
}

/// Reusable sparse set of `(r, s) -> δ` entries for one proposed move.
#[derive(Debug, Clone, Default)]
pub struct EntrySet {
    directed: bool,
    n_recs: usize,
    r: usize,
    nr: usize,
    idx: FnvHashMap<(usize, usize), usize>,
    keys: Vec<(usize, usize)>,
    delta: Vec<i64>,
    // flattened entry-major [entry * n_recs + i]
    rec_delta: Vec<f64>,
    drec_delta: Vec<f64>,
    /// Scratch list consumed by `propagate_entries_dS` at the next level.
    pub p_entries: Vec<PropEntry>,
}

impl EntrySet {
    pub fn new(directed: bool, n_recs: usize) -> Self {
        EntrySet {
            directed,
            n_recs,
            r: NULL_BLOCK,
            nr: NULL_BLOCK,
            ..Default::default()
        }
    }

    /// Reset and declare the proposal `r -> nr`. Capacity is retained.
    pub fn set_move(&mut self, r: usize, nr: usize) {
        self.r = r;
        self.nr = nr;
        self.idx.clear();
        self.keys.clear();
        self.delta.clear();
        self.rec_delta.clear();
        self.drec_delta.clear();
    }

    pub fn get_move(&self) -> (usize, usize) {
        (self.r, self.nr)
    }

    #[inline]
    fn key(&self, t: usize, s: usize) -> (usize, usize) {
        if !self.directed && s < t {
            (s, t)
        } else {
            (t, s)
        }
    }

    #[inline]
    fn entry_index(&mut self, t: usize, s: usize) -> usize {
        let key = self.key(t, s);
        if let Some(&i) = self.idx.get(&key) {
            return i;
        }
        let i = self.keys.len();
        self.idx.insert(key, i);
        self.keys.push(key);
        self.delta.push(0);
        self.rec_delta.extend(std::iter::repeat(0.).take(self.n_recs));
        self.drec_delta.extend(std::iter::repeat(0.).take(self.n_recs));
        i
    }

    /// Accumulate `δ` into the `(t, s)` entry.
    pub fn insert_delta(&mut self, t: usize, s: usize, d: i64) {
        let i = self.entry_index(t, s);
        self.delta[i] += d;
    }

    /// Accumulate `δ` together with per-covariate contributions.
    pub fn insert_delta_rec(&mut self, t: usize, s: usize, d: i64, rec: &[f64], drec: &[f64]) {
        let i = self.entry_index(t, s);
        self.delta[i] += d;
        let base = i * self.n_recs;
        for (j, &x) in rec.iter().take(self.n_recs).enumerate() {
            self.rec_delta[base + j] += x;
        }
        for (j, &x) in drec.iter().take(self.n_recs).enumerate() {
            self.drec_delta[base + j] += x;
        }
    }

    /// Accumulated delta for `(t, s)`; zero when untouched.
    #[inline]
    pub fn get_delta(&self, t: usize, s: usize) -> i64 {
        match self.idx.get(&self.key(t, s)) {
            Some(&i) => self.delta[i],
            None => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Resolve the `bg` edge for `(t, s)` through the current index.
    #[inline]
    pub fn get_me(&self, t: usize, s: usize, emat: &EdgeIndex) -> Option<usize> {
        emat.get_me(t, s)
    }

    /// Enumerate `(t, s, resolved edge, δ)` against the current index.
    pub fn entries_op<F>(&self, emat: &EdgeIndex, mut f: F)
    where
        F: FnMut(usize, usize, Option<usize>, i64),
    {
        for (i, &(t, s)) in self.keys.iter().enumerate() {
            f(t, s, emat.get_me(t, s), self.delta[i]);
        }
    }

    /// Enumerate entries together with the covariate deltas.
    pub fn wentries_op<F>(&self, emat: &EdgeIndex, mut f: F)
    where
        F: FnMut(usize, usize, Option<usize>, i64, &[f64], &[f64]),
    {
        for (i, &(t, s)) in self.keys.iter().enumerate() {
            let base = i * self.n_recs;
            f(
                t,
                s,
                emat.get_me(t, s),
                self.delta[i],
                &self.rec_delta[base..base + self.n_recs],
                &self.drec_delta[base..base + self.n_recs],
            );
        }
    }
}

/// Fill `m_entries` with the `δm_rs` induced by moving `v` from `r` to
/// `nr` (`None` on either side expresses a pure removal/insertion).
///
/// `efilt` suppresses a subset of edges during batched operations. When
/// `recs` is given, per-covariate `(rec, drec)` deltas ride along.
#[allow(clippy::too_many_arguments)]
pub fn move_entries<F>(
    v: usize,
    r: Option<usize>,
    nr: Option<usize>,
    b: &[usize],
    g: &Multigraph,
    eweight: &[i64],
    m_entries: &mut EntrySet,
    efilt: F,
    recs: Option<(&[Vec<f64>], &[Vec<f64>])>,
) where
    F: Fn(usize) -> bool,
{
    m_entries.set_move(r.unwrap_or(NULL_BLOCK), nr.unwrap_or(NULL_BLOCK));

    let n_recs = recs.map(|(rc, _)| rc.len()).unwrap_or(0);
    let mut rec_buf = vec![0.; n_recs];
    let mut drec_buf = vec![0.; n_recs];

    let mut push = |m_entries: &mut EntrySet,
                    t: usize,
                    s: usize,
                    e: usize,
                    sign: f64,
                    d: i64,
                    rec_buf: &mut [f64],
                    drec_buf: &mut [f64]| {
        match recs {
            None => m_entries.insert_delta(t, s, d),
            Some((rec, drec)) => {
                for i in 0..n_recs {
                    rec_buf[i] = sign * rec[i][e];
                    drec_buf[i] = sign * drec[i][e];
                }
                m_entries.insert_delta_rec(t, s, d, rec_buf, drec_buf);
            }
        }
    };

    for e in g.out_edges(v) {
        if efilt(e) {
            continue;
        }
        let u = g.opposite(e, v);
        let ew = eweight[e];
        if u == v {
            if let Some(r) = r {
                push(m_entries, r, r, e, -1., -ew, &mut rec_buf, &mut drec_buf);
            }
            if let Some(nr) = nr {
                push(m_entries, nr, nr, e, 1., ew, &mut rec_buf, &mut drec_buf);
            }
        } else {
            let s = b[u];
            if let Some(r) = r {
                push(m_entries, r, s, e, -1., -ew, &mut rec_buf, &mut drec_buf);
            }
            if let Some(nr) = nr {
                push(m_entries, nr, s, e, 1., ew, &mut rec_buf, &mut drec_buf);
            }
        }
    }

    if g.is_directed() {
        for e in g.in_edges(v) {
            if efilt(e) {
                continue;
            }
            let u = g.source(e);
            if u == v {
                continue; // handled with the out-edges
            }
            let s = b[u];
            let ew = eweight[e];
            if let Some(r) = r {
                push(m_entries, s, r, e, -1., -ew, &mut rec_buf, &mut drec_buf);
            }
            if let Some(nr) = nr {
                push(m_entries, s, nr, e, 1., ew, &mut rec_buf, &mut drec_buf);
            }
        }
    }
}
