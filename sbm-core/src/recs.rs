//! Edge covariates ("recs") for the weighted SBM variants.
//!
//! Each covariate `i` attaches a real value `rec[i][e]` to every edge,
//! plus a running squared-deviation accumulator `drec[i][e]`. The state
//! keeps per-block-edge sums `brec` / `bdrec`; the data term prices each
//! block edge's covariate bundle with the marginal likelihood of a
//! normal observation model under a normal–inverse-chi-squared prior
//! with parameters `wparams = [m0, k0, v0, nu0]`.

use sbm_util::lgamma_fast;
use special::Gamma as SpecialGamma;
use std::f64::consts::PI;

/// Covariate observation models. Only the normal model survives in this
/// core; the enum is the extension point for the other families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightType {
    RealNormal,
}

/// Log marginal likelihood of `m` normal observations with sum `x` and
/// accumulated squared deviation `v`, under the conjugate
/// normal–inverse-chi-squared prior `(m0, k0, v0, nu0)`.
///
/// `epsilon` is the measurement precision: each observation contributes
/// `−ln ε` so the density integrates against the discretised data.
/// `m == 0` contributes nothing.
pub fn signed_w_log_p(m: i64, x: f64, v: f64, wp: &[f64], epsilon: f64) -> f64 {
    if m <= 0 {
        return 0.;
    }
    let n = m as f64;
    let (m0, k0, v0, nu0) = (wp[0], wp[1], wp[2], wp[3]);
    let k_n = k0 + n;
    let nu_n = nu0 + n;
    let v_n = (v0 * nu0 + v + ((n * k0) / k_n) * (m0 - x / n).powi(2)) / nu_n;
    SpecialGamma::ln_gamma(nu_n / 2.).0 - SpecialGamma::ln_gamma(nu0 / 2.).0
        + 0.5 * (k0.ln() - k_n.ln())
        + (nu0 / 2.) * (v0 * nu0).ln()
        - (nu_n / 2.) * (v_n * nu_n).ln()
        - (n / 2.) * PI.ln()
        - n * epsilon.ln()
}

/// Parallel-edge correction for one multi-edge bundle of weight `m`
/// (`is_loop` marks an undirected vertex self-loop, whose `(2m)!!`
/// pairings replace the plain `m!`).
#[inline]
pub fn parallel_term(m: i64, is_loop: bool) -> f64 {
    if m <= 1 {
        return 0.;
    }
    if is_loop {
        lgamma_fast(m as usize + 1) + m as f64 * std::f64::consts::LN_2
    } else {
        lgamma_fast(m as usize + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn empty_bundle_is_free() {
        assert_eq!(signed_w_log_p(0, 0., 0., &[0., 1., 1., 1.], 1e-6), 0.);
    }

    #[test]
    fn marginal_is_a_log_density() {
        // one observation: the marginal is a scaled Student-t, so the
        // log-density must decrease monotonically away from the prior mean
        let wp = [0., 1., 1., 1.];
        let near = signed_w_log_p(1, 0.1, 0., &wp, 1e-6);
        let far = signed_w_log_p(1, 3., 0., &wp, 1e-6);
        assert!(near > far);
    }

    #[test]
    fn additive_in_epsilon() {
        // halving epsilon adds m * ln 2
        let wp = [0., 1., 1., 1.];
        let a = signed_w_log_p(3, 1., 0.5, &wp, 1e-3);
        let b = signed_w_log_p(3, 1., 0.5, &wp, 5e-4);
        assert_relative_eq!(b - a, 3. * 2f64.ln(), max_relative = 1e-10);
    }

    #[test]
    fn parallel_terms() {
        sbm_util::init_cache(64);
        assert_eq!(parallel_term(1, false), 0.);
        assert_relative_eq!(parallel_term(3, false), 6f64.ln(), max_relative = 1e-12);
        // (2*2)!! = 8
        assert_relative_eq!(parallel_term(2, true), 8f64.ln(), max_relative = 1e-12);
    }
}
