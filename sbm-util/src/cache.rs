//! Integer-argument caches for `ln Γ(n)`, `x ln x` and `ln n`.
//!
//! The tables are filled once by [`init_cache`] and never mutated
//! afterwards, so concurrent readers need no synchronisation beyond the
//! `OnceLock` itself. Every accessor falls back to the exact formula when
//! the argument is outside the cached range or the cache was never
//! initialised.

use special::Gamma as SpecialGamma;
use std::sync::OnceLock;

struct Tables {
    lgamma: Vec<f64>,
    xlogx: Vec<f64>,
    log: Vec<f64>,
}

static TABLES: OnceLock<Tables> = OnceLock::new();

/// Fill the integer-argument tables for `n` in `0..=n_max`.
///
/// Idempotent: only the first call has any effect. Subsequent calls with a
/// larger `n_max` do not grow the tables; out-of-range arguments are served
/// by the exact formulas instead.
pub fn init_cache(n_max: usize) {
    TABLES.get_or_init(|| {
        let mut lgamma = Vec::with_capacity(n_max + 1);
        let mut xlogx = Vec::with_capacity(n_max + 1);
        let mut log = Vec::with_capacity(n_max + 1);
        for n in 0..=n_max {
            lgamma.push(if n == 0 {
                f64::INFINITY
            } else {
                SpecialGamma::ln_gamma(n as f64).0
            });
            xlogx.push(if n == 0 {
                0.
            } else {
                let x = n as f64;
                x * x.ln()
            });
            log.push(if n == 0 { 0. } else { (n as f64).ln() });
        }
        Tables { lgamma, xlogx, log }
    });
}

/// `ln Γ(n)` for a non-negative integer argument.
///
/// `lgamma_fast(0)` is `+∞` (the pole), `lgamma_fast(1) = lgamma_fast(2) = 0`.
#[inline]
pub fn lgamma_fast(n: usize) -> f64 {
    if let Some(t) = TABLES.get() {
        if n < t.lgamma.len() {
            return t.lgamma[n];
        }
    }
    if n == 0 {
        return f64::INFINITY;
    }
    SpecialGamma::ln_gamma(n as f64).0
}

/// `n ln n` for a non-negative integer, with `0 ln 0 = 0`.
#[inline]
pub fn xlogx_fast(n: usize) -> f64 {
    if let Some(t) = TABLES.get() {
        if n < t.xlogx.len() {
            return t.xlogx[n];
        }
    }
    let x = n as f64;
    if n == 0 {
        0.
    } else {
        x * x.ln()
    }
}

/// `ln n` for a non-negative integer, with `ln 0 = 0` by convention.
#[inline]
pub fn safelog_fast(n: usize) -> f64 {
    if let Some(t) = TABLES.get() {
        if n < t.log.len() {
            return t.log[n];
        }
    }
    if n == 0 {
        0.
    } else {
        (n as f64).ln()
    }
}

/// `ln x` with `ln 0 = 0` by convention.
#[inline]
pub fn safelog(x: f64) -> f64 {
    if x == 0. {
        0.
    } else {
        x.ln()
    }
}

/// `x ln x` with `0 ln 0 = 0`.
#[inline]
pub fn xlogx(x: f64) -> f64 {
    if x == 0. {
        0.
    } else {
        x * x.ln()
    }
}
