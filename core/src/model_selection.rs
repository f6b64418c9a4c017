//! Information criteria for comparing fitted models.
//!
//! The log-likelihood may be passed with either sign; both functions work
//! on the minimized convention, `-LL ≥ 0`.

fn negative_log_likelihood(log_likelihood: f64) -> f64 {
    log_likelihood.abs()
}

/// AIC = 2k + 2·(−LL)
pub fn aic(k: usize, log_likelihood: f64) -> f64 {
    2.0 * k as f64 + 2.0 * negative_log_likelihood(log_likelihood)
}

/// BIC = k·ln(n) + 2·(−LL)
pub fn bic(k: usize, n: usize, log_likelihood: f64) -> f64 {
    k as f64 * (n as f64).ln() + 2.0 * negative_log_likelihood(log_likelihood)
}
