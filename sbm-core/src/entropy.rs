//! Entropy terms and the `EntropyArgs` configuration object.
//!
//! The sparse description length decomposes into per-block-edge terms
//! (`eterm*`) plus per-block terms (`vterm*`); the dense (Poisson)
//! formulation prices each block pair by the number of possible
//! placements (`eterm_dense`). "Exact" variants use `ln Γ`, the
//! approximate ones Stirling (`x ln x`), with the global `±E` correction
//! applied by the caller.

use sbm_util::{lbinom_careful, lbinom_fast, lgamma_fast, safelog_fast, xlogx_fast};
use std::f64::consts::LN_2;

/// Which degree-sequence prior the degree description length uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DegreeDlKind {
    /// Uniform over degree sequences with fixed endpoint counts
    Uniform,
    /// Degree histogram priced by restricted partitions `q(e_r, n_r)`
    #[default]
    Distributed,
    /// Plug-in entropy of the degree histogram
    Entropy,
}

/// Term selection for `entropy` / `virtual_move`.
///
/// Mirrors the knobs of the description-length objective; `beta_dl`
/// scales every model-DL contribution relative to the data term.
#[derive(Debug, Clone, Copy)]
pub struct EntropyArgs {
    pub adjacency: bool,
    pub dense: bool,
    pub multigraph: bool,
    pub exact: bool,
    pub deg_entropy: bool,
    pub partition_dl: bool,
    pub degree_dl: bool,
    pub degree_dl_kind: DegreeDlKind,
    pub edges_dl: bool,
    pub recs: bool,
    pub bfield: bool,
    pub beta_dl: f64,
}

impl Default for EntropyArgs {
    fn default() -> Self {
        EntropyArgs {
            adjacency: true,
            dense: false,
            multigraph: true,
            exact: true,
            deg_entropy: true,
            partition_dl: true,
            degree_dl: true,
            degree_dl_kind: DegreeDlKind::Distributed,
            edges_dl: true,
            recs: true,
            bfield: true,
            beta_dl: 1.,
        }
    }
}

impl EntropyArgs {
    /// Data term only, with the exact (lgamma) adjacency form.
    pub fn adjacency_only() -> Self {
        EntropyArgs {
            adjacency: true,
            dense: false,
            multigraph: true,
            exact: true,
            deg_entropy: true,
            partition_dl: false,
            degree_dl: false,
            degree_dl_kind: DegreeDlKind::Distributed,
            edges_dl: false,
            recs: false,
            bfield: false,
            beta_dl: 1.,
        }
    }
}

/// Approximate per-edge sparse term `−m ln m`; an undirected diagonal
/// entry prices its doubled half-edge count at half weight.
#[inline]
pub fn eterm(r: usize, s: usize, mrs: usize, directed: bool) -> f64 {
    if directed || r != s {
        -xlogx_fast(mrs)
    } else {
        -xlogx_fast(2 * mrs) / 2.
    }
}

/// Exact per-edge sparse term `−ln m!`, with the `(2m)!! = 2^m m!`
/// correction on undirected diagonal entries.
#[inline]
pub fn eterm_exact(r: usize, s: usize, mrs: usize, directed: bool) -> f64 {
    let val = lgamma_fast(mrs + 1);
    if directed || r != s {
        -val
    } else {
        -val - mrs as f64 * LN_2
    }
}

/// Approximate per-block sparse term.
#[inline]
pub fn vterm(mrp: usize, mrm: usize, wr: usize, deg_corr: bool, directed: bool) -> f64 {
    let one = if directed { 1. } else { 0.5 };
    if deg_corr {
        one * (xlogx_fast(mrm) + xlogx_fast(mrp))
    } else {
        one * (mrm as f64 * safelog_fast(wr) + mrp as f64 * safelog_fast(wr))
    }
}

/// Exact per-block sparse term.
#[inline]
pub fn vterm_exact(mrp: usize, mrm: usize, wr: usize, deg_corr: bool, directed: bool) -> f64 {
    if deg_corr {
        if directed {
            lgamma_fast(mrp + 1) + lgamma_fast(mrm + 1)
        } else {
            lgamma_fast(mrp + 1)
        }
    } else if directed {
        (mrp + mrm) as f64 * safelog_fast(wr)
    } else {
        mrp as f64 * safelog_fast(wr)
    }
}

/// Dense per-block-pair term: the log-count of edge placements among the
/// possible endpoint pairs (the likelihood is the reciprocal count).
pub fn eterm_dense(
    r: usize,
    s: usize,
    ers: usize,
    wr_r: usize,
    wr_s: usize,
    multigraph: bool,
    directed: bool,
) -> f64 {
    // strictly the number of parallel-edge configurations is only defined
    // for simple graphs or multigraphs; the rest is extrapolation
    let nrns = if r != s {
        wr_r * wr_s
    } else if directed {
        wr_r * wr_r
    } else if multigraph {
        wr_r * (wr_r + 1) / 2
    } else {
        wr_r * (wr_r - 1) / 2
    };

    if multigraph {
        // sum of geometric sequences: C(n + m - 1, m)
        lbinom_careful((nrns + ers).saturating_sub(1) as f64, ers as f64)
    } else {
        lbinom_fast(nrns, ers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn diagonal_terms_halve() {
        sbm_util::init_cache(128);
        // off-diagonal: plain -m ln m
        assert_relative_eq!(eterm(0, 1, 3, false), -3. * 3f64.ln(), max_relative = 1e-12);
        // diagonal undirected: -(2m ln 2m)/2
        assert_relative_eq!(
            eterm(0, 0, 3, false),
            -(6. * 6f64.ln()) / 2.,
            max_relative = 1e-12
        );
        // directed diagonal is not special
        assert_relative_eq!(eterm(0, 0, 3, true), -3. * 3f64.ln(), max_relative = 1e-12);
    }

    #[test]
    fn exact_diagonal_double_factorial() {
        sbm_util::init_cache(128);
        // -ln((2m)!!) = -ln(2^m m!)
        let m = 4usize;
        let expect = -((2f64.powi(m as i32) * 24.).ln());
        assert_relative_eq!(eterm_exact(0, 0, m, false), expect, max_relative = 1e-12);
    }

    #[test]
    fn vterm_non_dc_counts_once_undirected() {
        sbm_util::init_cache(128);
        // undirected: mrp == mrm, the 1/2 factor collapses to a single count
        let v = vterm(6, 6, 3, false, false);
        assert_relative_eq!(v, 6. * 3f64.ln(), max_relative = 1e-12);
        assert_relative_eq!(
            vterm_exact(6, 6, 3, false, false),
            6. * 3f64.ln(),
            max_relative = 1e-12
        );
    }

    #[test]
    fn dense_counts_placements() {
        sbm_util::init_cache(128);
        // 2 blocks of sizes 3 and 2, 4 edges between: C(6, 4)
        assert_relative_eq!(
            eterm_dense(0, 1, 4, 3, 2, false, false),
            15f64.ln(),
            max_relative = 1e-10
        );
        // multigraph: C(6 + 4 - 1, 4) = C(9, 4) = 126
        assert_relative_eq!(
            eterm_dense(0, 1, 4, 3, 2, true, false),
            126f64.ln(),
            max_relative = 1e-10
        );
    }
}
