//! Numeric primitives for stochastic block model inference.
//!
//! Description-length objectives are sums of `ln Γ`, `x ln x` and
//! log-binomial terms evaluated at small integer arguments, millions of
//! times per MCMC sweep. This crate provides those functions backed by
//! process-wide integer-argument tables that are filled once
//! (`init_cache`) and read-only afterwards. Arguments beyond the cached
//! range fall back to the direct formula without touching the tables.

/// Cached `ln Γ(n)`, `x ln x` and `ln n` for integer arguments
pub mod cache;

/// Restricted integer partition counts `log q(n, k)`
pub mod int_part;

/// Log-binomials, log-beta and `log_sum_exp`
pub mod util;

pub use cache::{init_cache, lgamma_fast, safelog, safelog_fast, xlogx, xlogx_fast};
pub use int_part::{init_q_cache, log_q};
pub use util::{lbeta, lbinom, lbinom_careful, lbinom_fast, log_sum_exp, log_sum_exp_slice};
