//! Rolling counters behind the partition, degree-sequence and edge-count
//! description lengths.
//!
//! One instance exists per constraint class (`pclabel` value); every
//! query has a static form (full sum over the counters) and a delta form
//! used by `virtual_move`. The delta forms never mutate state and agree
//! with `new − old` of the static forms to machine epsilon — that
//! consistency is what the whole MCMC relies on, and what the tests
//! at the bottom pin down.

use crate::entropy::DegreeDlKind;
use fnv::FnvHashMap;
use sbm_util::{lbinom, lgamma_fast, log_q, safelog_fast, xlogx_fast};

#[inline]
fn lgamma_i(n: i64) -> f64 {
    debug_assert!(n >= 0);
    lgamma_fast(n.max(0) as usize)
}

#[inline]
fn lbinom_i(n: i64, k: i64) -> f64 {
    if n <= 0 || k <= 0 || k >= n {
        return 0.;
    }
    lbinom(n as usize, k as usize)
}

/// Number of distinguishable block pairs for the edge-count matrix.
#[inline]
fn num_pairs(b: i64, directed: bool) -> i64 {
    if directed {
        b * b
    } else {
        b * (b + 1) / 2
    }
}

/// Description length of the global edge-count matrix: the number of ways
/// to distribute `e` edge endpoints over the `B`-block pair histogram.
pub fn get_edges_dl(b: usize, e: i64, directed: bool) -> f64 {
    lbinom_i(num_pairs(b as i64, directed) + e - 1, e)
}

/// Per-constraint-class partition statistics.
#[derive(Debug, Clone, Default)]
pub struct PartitionStats {
    /// Total vertex weight in this class
    n: i64,
    /// Total edge weight (shared across classes)
    e: i64,
    /// Non-empty blocks of this class
    actual_b: usize,
    total: Vec<i64>,
    ep: Vec<i64>,
    em: Vec<i64>,
    hist_out: Vec<FnvHashMap<i64, i64>>,
    hist_in: Vec<FnvHashMap<i64, i64>>,
    directed: bool,
}

impl PartitionStats {
    pub fn new(b_count: usize, e: i64, directed: bool) -> Self {
        PartitionStats {
            n: 0,
            e,
            actual_b: 0,
            total: vec![0; b_count],
            ep: vec![0; b_count],
            em: vec![0; b_count],
            hist_out: vec![FnvHashMap::default(); b_count],
            hist_in: vec![FnvHashMap::default(); b_count],
            directed,
        }
    }

    pub fn add_block(&mut self) {
        self.total.push(0);
        self.ep.push(0);
        self.em.push(0);
        self.hist_out.push(FnvHashMap::default());
        self.hist_in.push(FnvHashMap::default());
    }

    pub fn num_blocks(&self) -> usize {
        self.total.len()
    }

    pub fn get_actual_b(&self) -> usize {
        self.actual_b
    }

    pub fn get_n(&self) -> i64 {
        self.n
    }

    pub fn get_e(&self) -> i64 {
        self.e
    }

    /// Account for a global edge insertion (`dm > 0`) or removal.
    pub fn change_e(&mut self, dm: i64) {
        self.e += dm;
    }

    /// Register vertex weight `vw` with degrees `(kin, kout)` in block `r`.
    pub fn add_vertex(&mut self, r: usize, kin: i64, kout: i64, vw: i64) {
        if vw == 0 {
            return;
        }
        if self.total[r] == 0 {
            self.actual_b += 1;
        }
        self.total[r] += vw;
        self.n += vw;
        self.ep[r] += kout;
        self.em[r] += kin;
        *self.hist_out[r].entry(kout).or_insert(0) += vw;
        if self.directed {
            *self.hist_in[r].entry(kin).or_insert(0) += vw;
        }
    }

    /// Remove what the matching `add_vertex` registered.
    pub fn remove_vertex(&mut self, r: usize, kin: i64, kout: i64, vw: i64) {
        if vw == 0 {
            return;
        }
        self.total[r] -= vw;
        self.n -= vw;
        self.ep[r] -= kout;
        self.em[r] -= kin;
        if self.total[r] == 0 {
            self.actual_b -= 1;
        }
        let c = self.hist_out[r].entry(kout).or_insert(0);
        *c -= vw;
        if *c == 0 {
            self.hist_out[r].remove(&kout);
        }
        if self.directed {
            let c = self.hist_in[r].entry(kin).or_insert(0);
            *c -= vw;
            if *c == 0 {
                self.hist_in[r].remove(&kin);
            }
        }
    }

    // ---- partition description length ------------------------------------

    /// `ln C(N−1, B−1) + ln N! − Σ_r ln n_r! + ln N`
    pub fn get_partition_dl(&self) -> f64 {
        if self.n == 0 {
            return 0.;
        }
        let mut s = lbinom_i(self.n - 1, self.actual_b as i64 - 1);
        s += lgamma_i(self.n + 1);
        for &nr in &self.total {
            s -= lgamma_i(nr + 1);
        }
        s + safelog_fast(self.n as usize)
    }

    /// Delta of `get_partition_dl` for moving weight `vw` from `r` to `nr`
    /// (`None` on either side for pure removal/insertion). A zero weight
    /// is priced as one unit: that is how a block about to be occupied
    /// enters the coupled level, whose vertex weight flips to 1 only
    /// when the move is applied.
    pub fn get_delta_partition_dl(&self, r: Option<usize>, nr: Option<usize>, vw: i64) -> f64 {
        if r == nr {
            return 0.;
        }
        let vw = if vw == 0 { 1 } else { vw };
        let mut dn = 0i64;
        let mut s_b = 0.;
        let mut s_a = 0.;
        if let Some(r) = r {
            s_b -= lgamma_i(self.total[r] + 1);
            s_a -= lgamma_i(self.total[r] - vw + 1);
            dn -= vw;
        }
        if let Some(nr) = nr {
            s_b -= lgamma_i(self.total[nr] + 1);
            s_a -= lgamma_i(self.total[nr] + vw + 1);
            dn += vw;
        }

        let mut db = 0i64;
        if r.is_some_and(|r| self.total[r] == vw) {
            db -= 1;
        }
        if nr.is_some_and(|nr| self.total[nr] == 0) {
            db += 1;
        }

        let n_a = self.n + dn;
        if db != 0 || dn != 0 {
            s_b += lbinom_i(self.n - 1, self.actual_b as i64 - 1);
            s_a += lbinom_i(n_a - 1, self.actual_b as i64 + db - 1);
            s_b += lgamma_i(self.n + 1) + safelog_fast(self.n.max(0) as usize);
            s_a += lgamma_i(n_a + 1) + safelog_fast(n_a.max(0) as usize);
        }
        s_a - s_b
    }

    // ---- degree-sequence description length ------------------------------

    fn deg_dl_dir(
        &self,
        kind: DegreeDlKind,
        nr: i64,
        er: i64,
        hist: &FnvHashMap<i64, i64>,
    ) -> f64 {
        if nr == 0 {
            return 0.;
        }
        match kind {
            DegreeDlKind::Uniform => lbinom_i(nr + er - 1, er),
            DegreeDlKind::Distributed => {
                let mut s = log_q(er.max(0) as usize, nr.max(0) as usize);
                s += lgamma_i(nr + 1);
                for &cnt in hist.values() {
                    s -= lgamma_i(cnt + 1);
                }
                s
            }
            DegreeDlKind::Entropy => {
                let mut s = xlogx_fast(nr.max(0) as usize);
                for &cnt in hist.values() {
                    s -= xlogx_fast(cnt.max(0) as usize);
                }
                s
            }
        }
    }

    /// Static degree-sequence description length of this class.
    pub fn get_deg_dl(&self, kind: DegreeDlKind) -> f64 {
        let mut s = 0.;
        for r in 0..self.total.len() {
            s += self.deg_dl_dir(kind, self.total[r], self.ep[r], &self.hist_out[r]);
            if self.directed {
                s += self.deg_dl_dir(kind, self.total[r], self.em[r], &self.hist_in[r]);
            }
        }
        s
    }

    /// The same per-direction term with the counters shifted as if weight
    /// `vw` of degree `k` were added (`sign = +1`) or removed (`−1`).
    #[allow(clippy::too_many_arguments)]
    fn deg_dl_dir_shifted(
        &self,
        kind: DegreeDlKind,
        nr: i64,
        er: i64,
        hist: &FnvHashMap<i64, i64>,
        k: i64,
        vw: i64,
        sign: i64,
    ) -> f64 {
        let nr_a = nr + sign * vw;
        let er_a = er + sign * k;
        if nr_a == 0 {
            return 0.;
        }
        let cnt = hist.get(&k).copied().unwrap_or(0);
        let cnt_a = cnt + sign * vw;
        match kind {
            DegreeDlKind::Uniform => lbinom_i(nr_a + er_a - 1, er_a),
            DegreeDlKind::Distributed => {
                let mut s = log_q(er_a.max(0) as usize, nr_a.max(0) as usize);
                s += lgamma_i(nr_a + 1);
                for (&kk, &c) in hist.iter() {
                    if kk != k {
                        s -= lgamma_i(c + 1);
                    }
                }
                s -= lgamma_i(cnt_a + 1);
                s
            }
            DegreeDlKind::Entropy => {
                let mut s = xlogx_fast(nr_a.max(0) as usize);
                for (&kk, &c) in hist.iter() {
                    if kk != k {
                        s -= xlogx_fast(c.max(0) as usize);
                    }
                }
                s -= xlogx_fast(cnt_a.max(0) as usize);
                s
            }
        }
    }

    /// Delta of `get_deg_dl` for moving weight `vw` of degree `(kin, kout)`
    /// from `r` to `nr`.
    #[allow(clippy::too_many_arguments)]
    pub fn get_delta_deg_dl(
        &self,
        r: Option<usize>,
        nr: Option<usize>,
        kin: i64,
        kout: i64,
        vw: i64,
        kind: DegreeDlKind,
    ) -> f64 {
        if r == nr || vw == 0 {
            return 0.;
        }
        let mut ds = 0.;
        if let Some(r) = r {
            ds -= self.deg_dl_dir(kind, self.total[r], self.ep[r], &self.hist_out[r]);
            ds += self.deg_dl_dir_shifted(
                kind,
                self.total[r],
                self.ep[r],
                &self.hist_out[r],
                kout,
                vw,
                -1,
            );
            if self.directed {
                ds -= self.deg_dl_dir(kind, self.total[r], self.em[r], &self.hist_in[r]);
                ds += self.deg_dl_dir_shifted(
                    kind,
                    self.total[r],
                    self.em[r],
                    &self.hist_in[r],
                    kin,
                    vw,
                    -1,
                );
            }
        }
        if let Some(nr) = nr {
            ds -= self.deg_dl_dir(kind, self.total[nr], self.ep[nr], &self.hist_out[nr]);
            ds += self.deg_dl_dir_shifted(
                kind,
                self.total[nr],
                self.ep[nr],
                &self.hist_out[nr],
                kout,
                vw,
                1,
            );
            if self.directed {
                ds -= self.deg_dl_dir(kind, self.total[nr], self.em[nr], &self.hist_in[nr]);
                ds += self.deg_dl_dir_shifted(
                    kind,
                    self.total[nr],
                    self.em[nr],
                    &self.hist_in[nr],
                    kin,
                    vw,
                    1,
                );
            }
        }
        ds
    }

    // ---- edge-count description length -----------------------------------

    /// Delta of the global `get_edges_dl` when the move changes the total
    /// number of occupied blocks. `actual_b_total` is the sum over every
    /// class.
    pub fn get_delta_edges_dl(
        &self,
        r: Option<usize>,
        nr: Option<usize>,
        vw: i64,
        actual_b_total: usize,
    ) -> f64 {
        if r == nr || vw == 0 {
            return 0.;
        }
        let mut db = 0i64;
        if r.is_some_and(|r| self.total[r] == vw) {
            db -= 1;
        }
        if nr.is_some_and(|nr| self.total[nr] == 0) {
            db += 1;
        }
        if db == 0 {
            return 0.;
        }
        let b_a = (actual_b_total as i64 + db).max(0) as usize;
        get_edges_dl(b_a, self.e, self.directed) - get_edges_dl(actual_b_total, self.e, self.directed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        sbm_util::init_cache(1 << 12);
        sbm_util::init_q_cache(1 << 8);
    }

    fn sample_stats(directed: bool) -> PartitionStats {
        let mut ps = PartitionStats::new(3, 10, directed);
        // block 0: two vertices of degree (1, 2) and (0, 1)
        ps.add_vertex(0, 1, 2, 1);
        ps.add_vertex(0, 0, 1, 1);
        // block 1: one vertex of degree (2, 2)
        ps.add_vertex(1, 2, 2, 1);
        ps
    }

    #[test]
    fn actual_b_tracks_occupancy() {
        init();
        let mut ps = sample_stats(false);
        assert_eq!(ps.get_actual_b(), 2);
        ps.remove_vertex(1, 2, 2, 1);
        assert_eq!(ps.get_actual_b(), 1);
        ps.add_vertex(2, 0, 0, 1);
        assert_eq!(ps.get_actual_b(), 2);
    }

    #[test]
    fn partition_delta_matches_static() {
        init();
        for directed in [false, true] {
            let ps = sample_stats(directed);
            let before = ps.get_partition_dl();
            let delta = ps.get_delta_partition_dl(Some(0), Some(1), 1);

            let mut moved = ps.clone();
            moved.remove_vertex(0, 1, 2, 1);
            moved.add_vertex(1, 1, 2, 1);
            let after = moved.get_partition_dl();
            assert!(
                (delta - (after - before)).abs() < 1e-10,
                "delta {} vs {}",
                delta,
                after - before
            );
        }
    }

    #[test]
    fn partition_delta_handles_vacating_and_occupying() {
        init();
        let ps = sample_stats(false);
        // moving the sole occupant of block 1 into empty block 2
        let before = ps.get_partition_dl();
        let delta = ps.get_delta_partition_dl(Some(1), Some(2), 1);
        let mut moved = ps.clone();
        moved.remove_vertex(1, 2, 2, 1);
        moved.add_vertex(2, 2, 2, 1);
        assert!((delta - (moved.get_partition_dl() - before)).abs() < 1e-10);
    }

    #[test]
    fn deg_delta_matches_static_all_kinds() {
        init();
        for directed in [false, true] {
            for kind in [
                DegreeDlKind::Uniform,
                DegreeDlKind::Distributed,
                DegreeDlKind::Entropy,
            ] {
                let ps = sample_stats(directed);
                let before = ps.get_deg_dl(kind);
                let delta = ps.get_delta_deg_dl(Some(0), Some(1), 1, 2, 1, kind);
                let mut moved = ps.clone();
                moved.remove_vertex(0, 1, 2, 1);
                moved.add_vertex(1, 1, 2, 1);
                let after = moved.get_deg_dl(kind);
                assert!(
                    (delta - (after - before)).abs() < 1e-10,
                    "kind {:?} directed {}: {} vs {}",
                    kind,
                    directed,
                    delta,
                    after - before
                );
            }
        }
    }

    #[test]
    fn edges_dl_delta_only_on_occupancy_change() {
        init();
        let ps = sample_stats(false);
        // block 0 keeps an occupant: no change in B
        assert_eq!(ps.get_delta_edges_dl(Some(0), Some(1), 1, 2), 0.);
        // vacating block 1 changes B from 2 to 1
        let d = ps.get_delta_edges_dl(Some(1), Some(0), 1, 2);
        let expect = get_edges_dl(1, 10, false) - get_edges_dl(2, 10, false);
        assert!((d - expect).abs() < 1e-12);
    }

    #[test]
    fn partition_dl_formula() {
        init();
        // 3 vertices in 2 blocks (2, 1): C(2,1) + ln 3! - ln 2! - ln 1! + ln 3
        let ps = sample_stats(false);
        let expect = 2f64.ln() + 6f64.ln() - 2f64.ln() + 3f64.ln();
        assert!((ps.get_partition_dl() - expect).abs() < 1e-12);
    }
}
