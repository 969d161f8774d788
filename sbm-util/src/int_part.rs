//! Restricted integer partitions: `log q(n, k)`, the log of the number of
//! partitions of `n` into at most `k` parts.
//!
//! `q` enters the "distributed" degree-sequence description length, where it
//! prices the degree histogram of a block given its size and edge endpoint
//! count. Below [`init_q_cache`]'s bound the recurrence
//! `q(n, k) = q(n − k, k) + q(n, k − 1)` is tabled in log space; above it a
//! two-regime asymptotic takes over (dense regime from the
//! Hardy–Ramanujan expansion, sparse regime from the binomial form).

use crate::cache::lgamma_fast;
use crate::util::{lbinom_fast, log_sum_exp};
use std::f64::consts::PI;
use std::sync::OnceLock;

struct QCache {
    n_max: usize,
    // row-major (n_max + 1) x (n_max + 1)
    table: Vec<f64>,
}

static Q_CACHE: OnceLock<QCache> = OnceLock::new();

/// Fill the `log q(n, k)` table for `n, k` in `0..=n_max`.
///
/// Idempotent; the table never shrinks or grows after the first call.
pub fn init_q_cache(n_max: usize) {
    Q_CACHE.get_or_init(|| {
        let w = n_max + 1;
        let mut table = vec![f64::NEG_INFINITY; w * w];
        for n in 1..=n_max {
            table[n * w + 1] = 0.; // q(n, 1) = 1
            for k in 2..=n_max {
                let mut v = table[n * w + k - 1];
                if n > k {
                    v = log_sum_exp(v, table[(n - k) * w + k]);
                } else if n == k {
                    // q(0, k) = 1
                    v = log_sum_exp(v, 0.);
                }
                table[n * w + k] = v;
            }
        }
        QCache { n_max, table }
    });
}

/// `log q(n, k)` with the spec's edge conventions: `n ≤ 0` or `k < 1`
/// yields 0, and `k > n` is clamped to `k = n`.
pub fn log_q(n: usize, k: usize) -> f64 {
    if n == 0 || k < 1 {
        return 0.;
    }
    let k = k.min(n);
    if let Some(c) = Q_CACHE.get() {
        if n <= c.n_max {
            return c.table[n * (c.n_max + 1) + k];
        }
    }
    log_q_approx(n, k)
}

fn log_q_approx(n: usize, k: usize) -> f64 {
    if k < ((n as f64).powf(0.25) as usize).max(1) {
        log_q_approx_small(n, k)
    } else {
        log_q_approx_big(n, k)
    }
}

/// Sparse regime `k ≪ n^{1/4}`: `q(n, k) ≈ C(n − 1, k − 1) / k!`.
fn log_q_approx_small(n: usize, k: usize) -> f64 {
    lbinom_fast(n - 1, k - 1) - lgamma_fast(k + 1)
}

/// Dense regime: Hardy–Ramanujan with the finite-`k` correction.
fn log_q_approx_big(n: usize, k: usize) -> f64 {
    let nf = n as f64;
    let c = PI * (2. / 3f64).sqrt();
    let mut s = 2. * c * nf.sqrt() - (4. * 3f64.sqrt() * nf).ln();
    if k < n {
        let x = k as f64 / nf.sqrt() - nf.ln() / c;
        s -= (2. / c) * (-c * x / 2.).exp();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // q(n, k) by direct enumeration of the recurrence in integer space
    fn q_exact(n: i64, k: i64) -> u64 {
        if n == 0 {
            return 1;
        }
        if n < 0 || k < 1 {
            return 0;
        }
        q_exact(n - k, k) + q_exact(n, k - 1)
    }

    #[test]
    fn cached_matches_exact_recurrence() {
        crate::init_cache(64);
        init_q_cache(40);
        for n in 1..=30usize {
            for k in 1..=30usize {
                let expect = (q_exact(n as i64, k.min(n) as i64) as f64).ln();
                assert_relative_eq!(log_q(n, k), expect, max_relative = 1e-10);
            }
        }
    }

    #[test]
    fn conventions() {
        init_q_cache(40);
        assert_eq!(log_q(0, 5), 0.);
        assert_eq!(log_q(7, 0), 0.);
        // k > n clamps to k = n
        assert_eq!(log_q(5, 100), log_q(5, 5));
    }

    #[test]
    fn asymptotic_tracks_exact_for_moderate_n() {
        // beyond the cache: the approximation should be within a few percent
        // in log space for dense k
        crate::init_cache(64);
        let n = 60usize;
        let exact = (q_exact(n as i64, n as i64) as f64).ln();
        let approx = log_q_approx_big(n, n);
        assert!(
            (exact - approx).abs() / exact < 0.05,
            "exact {} vs approx {}",
            exact,
            approx
        );
    }
}
