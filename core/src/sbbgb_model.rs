//! Shifted-beta-binomial/geometric-beta (S_BB-G/B) purchase and dropout
//! model for discrete transaction opportunities, homogeneous case.
//!
//! At each opportunity an alive customer buys with probability p, then
//! survives to the next opportunity with probability 1 − θ. For a customer
//! with x purchases, the last at opportunity t_x, over n opportunities:
//!
//!   L = p^x (1−p)^(n−x) (1−θ)^n
//!     + Σ_{j=0}^{n−t_x−1} p^x (1−p)^(t_x−x+j) θ (1−θ)^(t_x+j)
//!
//! Every term is built in log space and combined with log-sum-exp so
//! customers with many opportunities do not underflow.

use crate::{
    config::{EstimationConfig, ParamBound},
    error::{RetentionError, RetentionResult},
    fit::FitResult,
    incidence::CalibrationGroup,
    optimizer::minimize,
};

pub const MODEL_NAME: &str = "sbbgb";
pub const PARAMETER_NAMES: [&str; 2] = ["p", "theta"];

const MIN_PROB: f64 = 1e-9;

// ── Log-space helpers ────────────────────────────────────────────────────────

/// Streaming log-sum-exp.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogSumExp {
    max: f64,
    sum: f64,
}

impl LogSumExp {
    pub(crate) fn new() -> Self {
        Self { max: f64::NEG_INFINITY, sum: 0.0 }
    }

    pub(crate) fn add(&mut self, v: f64) {
        if v == f64::NEG_INFINITY {
            return;
        }
        if v > self.max {
            self.sum = self.sum * (self.max - v).exp() + 1.0;
            self.max = v;
        } else {
            self.sum += (v - self.max).exp();
        }
    }

    pub(crate) fn value(&self) -> f64 {
        if self.sum == 0.0 { f64::NEG_INFINITY } else { self.max + self.sum.ln() }
    }
}

/// k · ln(v), with 0 · ln(0) = 0.
fn times(k: u32, ln_v: f64) -> f64 {
    if k == 0 { 0.0 } else { k as f64 * ln_v }
}

/// ln C(n, k)
pub(crate) fn ln_choose(n: u32, k: u32) -> f64 {
    if k > n {
        return f64::NEG_INFINITY;
    }
    let k = k.min(n - k);
    (1..=k).map(|i| ((n - k + i) as f64 / i as f64).ln()).sum()
}

/// ln(1 + e^z) without overflow.
pub(crate) fn softplus(z: f64) -> f64 {
    z.max(0.0) + (-z.abs()).exp().ln_1p()
}

/// Logarithms of the four per-opportunity probabilities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogProbs {
    pub ln_p:       f64,
    pub ln_no_buy:  f64,
    pub ln_theta:   f64,
    pub ln_survive: f64,
}

impl LogProbs {
    pub fn from_probs(p: f64, theta: f64) -> RetentionResult<Self> {
        if !(0.0..=1.0).contains(&p) || !(0.0..=1.0).contains(&theta) {
            return Err(RetentionError::divergence(
                MODEL_NAME,
                "p and theta must lie in [0, 1]",
                &[p, theta],
            ));
        }
        Ok(Self {
            ln_p:       p.ln(),
            ln_no_buy:  (-p).ln_1p(),
            ln_theta:   theta.ln(),
            ln_survive: (-theta).ln_1p(),
        })
    }

    /// From logits, without ever forming p or θ: ln σ(a) = −softplus(−a).
    pub fn from_logits(logit_p: f64, logit_theta: f64) -> Self {
        Self {
            ln_p:       -softplus(-logit_p),
            ln_no_buy:  -softplus(logit_p),
            ln_theta:   -softplus(-logit_theta),
            ln_survive: -softplus(logit_theta),
        }
    }

    /// ln of the "alive through opportunity n" term; −∞ when x > n.
    pub(crate) fn ln_alive_term(&self, x: u32, n: u32) -> f64 {
        if x > n {
            return f64::NEG_INFINITY;
        }
        times(x, self.ln_p) + times(n - x, self.ln_no_buy) + times(n, self.ln_survive)
    }

    /// ln L(p, θ | x, t_x, n); −∞ for a history no customer can have.
    pub(crate) fn ln_likelihood(&self, x: u32, t_x: u32, n: u32) -> f64 {
        if validate_history(x, t_x, n).is_err() {
            return f64::NEG_INFINITY;
        }
        let mut acc = LogSumExp::new();
        acc.add(self.ln_alive_term(x, n));
        let ln_px = times(x, self.ln_p);
        for j in 0..(n - t_x) {
            acc.add(ln_px + times(t_x - x + j, self.ln_no_buy) + self.ln_theta + times(t_x + j, self.ln_survive));
        }
        acc.value()
    }

    /// ln P(X(n, n+n*) = x* | alive at n)
    pub fn ln_holdout_count_given_alive(&self, n_star: u32, x_star: u32) -> f64 {
        if x_star > n_star {
            return f64::NEG_INFINITY;
        }
        let ln_px = times(x_star, self.ln_p);
        let mut acc = LogSumExp::new();
        acc.add(ln_choose(n_star, x_star) + ln_px + times(n_star - x_star, self.ln_no_buy) + times(n_star, self.ln_survive));
        for i in x_star..n_star {
            acc.add(ln_choose(i, x_star) + ln_px + times(i - x_star, self.ln_no_buy) + self.ln_theta + times(i, self.ln_survive));
        }
        acc.value()
    }
}

/// Reject `(x, t_x, n)` combinations no purchase history can produce.
pub fn validate_history(x: u32, t_x: u32, n: u32) -> RetentionResult<()> {
    let consistent = t_x <= n && x <= t_x && (x > 0 || t_x == 0);
    if consistent {
        Ok(())
    } else {
        Err(RetentionError::InvalidData(format!(
            "impossible purchase history x={x}, t_x={t_x}, n={n}"
        )))
    }
}

fn validate_groups(groups: &[CalibrationGroup]) -> RetentionResult<()> {
    if groups.is_empty() {
        return Err(RetentionError::InsufficientData { model: MODEL_NAME, required: 1, actual: 0 });
    }
    for g in groups {
        validate_history(g.p1x, g.t_x, g.n)?;
        if !(g.weight.is_finite() && g.weight >= 0.0) {
            return Err(RetentionError::InvalidData(format!("group weight {} is not a count", g.weight)));
        }
    }
    Ok(())
}

pub(crate) fn total_weight(groups: &[CalibrationGroup]) -> usize {
    groups.iter().map(|g| g.weight).sum::<f64>().round() as usize
}

// ── Homogeneous model ────────────────────────────────────────────────────────

/// L(p, θ | x, t_x, n) for one customer.
pub fn individual_likelihood(p: f64, theta: f64, x: u32, t_x: u32, n: u32) -> RetentionResult<f64> {
    validate_history(x, t_x, n)?;
    Ok(LogProbs::from_probs(p, theta)?.ln_likelihood(x, t_x, n).exp())
}

/// weight · ln L for a group of identical customers.
pub fn group_log_likelihood(p: f64, theta: f64, group: &CalibrationGroup) -> RetentionResult<f64> {
    validate_history(group.p1x, group.t_x, group.n)?;
    let ln_l = LogProbs::from_probs(p, theta)?.ln_likelihood(group.p1x, group.t_x, group.n);
    Ok(weighted(group.weight, ln_l))
}

pub(crate) fn weighted(weight: f64, ln_l: f64) -> f64 {
    if weight == 0.0 { 0.0 } else { weight * ln_l }
}

/// Σ weight_i · ln L_i over all groups.
pub fn sample_log_likelihood(p: f64, theta: f64, groups: &[CalibrationGroup]) -> RetentionResult<f64> {
    validate_groups(groups)?;
    let lp = LogProbs::from_probs(p, theta)?;
    let ll: f64 = groups
        .iter()
        .map(|g| weighted(g.weight, lp.ln_likelihood(g.p1x, g.t_x, g.n)))
        .sum();
    if ll.is_nan() || ll == f64::NEG_INFINITY {
        return Err(RetentionError::divergence(MODEL_NAME, "sample likelihood is zero", &[p, theta]));
    }
    Ok(ll)
}

/// Maximum-likelihood (p, θ) shared by every customer.
pub fn fit_homogeneous(
    groups: &[CalibrationGroup],
    initial_guess: (f64, f64),
    config: &EstimationConfig,
) -> RetentionResult<FitResult> {
    validate_groups(groups)?;

    let default = ParamBound::new(MIN_PROB, 1.0 - MIN_PROB);
    let bounds = config.bounds_for(&PARAMETER_NAMES, &[default, default]);
    let objective = |x: &[f64]| -> RetentionResult<f64> { sample_log_likelihood(x[0], x[1], groups).map(|ll| -ll) };
    let outcome = minimize(
        &objective,
        &[initial_guess.0, initial_guess.1],
        &bounds,
        &config.optimizer,
        MODEL_NAME,
    )?;

    let fit = FitResult::from_outcome(MODEL_NAME, &PARAMETER_NAMES, &outcome, &bounds, total_weight(groups));
    log::info!(
        "sbbgb homogeneous fit: p={:.4} theta={:.4} LL={:.4} ({} groups, converged={})",
        outcome.x[0],
        outcome.x[1],
        fit.log_likelihood,
        groups.len(),
        fit.converged
    );
    Ok(fit)
}

/// P(alive at n | p, θ, x, t_x, n)
pub fn p_alive(p: f64, theta: f64, x: u32, t_x: u32, n: u32) -> RetentionResult<f64> {
    validate_history(x, t_x, n)?;
    let lp = LogProbs::from_probs(p, theta)?;
    Ok((lp.ln_alive_term(x, n) - lp.ln_likelihood(x, t_x, n)).exp())
}

/// P(X(n, n+n*) = x* | p, θ, alive at n)
pub fn prob_holdout_count_given_alive(p: f64, theta: f64, n_star: u32, x_star: u32) -> RetentionResult<f64> {
    Ok(LogProbs::from_probs(p, theta)?.ln_holdout_count_given_alive(n_star, x_star).exp())
}
