//! Shifted-beta-geometric (sBG) retention model for contractual cohorts.
//!
//! Each customer churns at the end of a period with a fixed probability θ;
//! θ ~ Beta(γ, δ) across the cohort. With P(T = t) the probability of
//! churning in period t:
//!
//!   P(T = 1) = γ / (γ + δ)
//!   P(T = t) = P(T = t−1) · (δ + t − 2) / (γ + δ + t − 1),  t ≥ 2
//!   S(t)     = 1 − Σ_{i ≤ t} P(T = i)
//!
//! RULE: The likelihood is never evaluated where Σ P(T = t) ≥ 1; that is
//! a ModelDivergence, not a NaN.

use crate::{
    cohort::CohortRetentionTable,
    config::{EstimationConfig, ParamBound},
    error::{RetentionError, RetentionResult},
    fit::FitResult,
    optimizer::minimize,
};
use serde::{Deserialize, Serialize};

pub const MODEL_NAME: &str = "sbg";
pub const PARAMETER_NAMES: [&str; 2] = ["gamma", "delta"];

/// Fewest observed periods, period 0 included, that identify (γ, δ).
pub const MIN_PERIODS: usize = 3;

const MIN_SHAPE: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SbgParams {
    pub gamma: f64,
    pub delta: f64,
}

impl SbgParams {
    pub fn new(gamma: f64, delta: f64) -> RetentionResult<Self> {
        if !(gamma > 0.0 && delta > 0.0 && gamma.is_finite() && delta.is_finite()) {
            return Err(RetentionError::divergence(
                MODEL_NAME,
                "gamma and delta must be positive and finite",
                &[gamma, delta],
            ));
        }
        Ok(Self { gamma, delta })
    }

    pub fn from_fit(fit: &FitResult) -> RetentionResult<Self> {
        match (fit.parameter("gamma"), fit.parameter("delta")) {
            (Some(gamma), Some(delta)) => Self::new(gamma, delta),
            _ => Err(RetentionError::InvalidData(format!(
                "fit '{}' carries no gamma/delta parameters",
                fit.model
            ))),
        }
    }

    /// P(T = t) for t = 1..=horizon.
    pub fn churn_probabilities(&self, horizon: usize) -> Vec<f64> {
        let mut p = Vec::with_capacity(horizon);
        for t in 1..=horizon {
            let next = match p.last() {
                None => self.gamma / (self.gamma + self.delta),
                Some(prev) => {
                    let t = t as f64;
                    prev * (self.delta + t - 2.0) / (self.gamma + self.delta + t - 1.0)
                }
            };
            p.push(next);
        }
        p
    }

    /// S(t) for t = 0..=horizon.
    pub fn survival(&self, horizon: usize) -> Vec<f64> {
        let mut s = Vec::with_capacity(horizon + 1);
        s.push(1.0);
        for p in self.churn_probabilities(horizon) {
            let prev = s[s.len() - 1];
            s.push(prev - p);
        }
        s
    }

    /// r(t) = S(t) / S(t−1) = (δ + t − 1) / (γ + δ + t − 1), t = 1..=horizon.
    pub fn retention_rates(&self, horizon: usize) -> Vec<f64> {
        (1..=horizon)
            .map(|t| {
                let t = t as f64;
                (self.delta + t - 1.0) / (self.gamma + self.delta + t - 1.0)
            })
            .collect()
    }

    /// E(Θ), the cohort's mean churn probability.
    pub fn mean_churn(&self) -> f64 {
        self.gamma / (self.gamma + self.delta)
    }

    /// Expected customers alive at t = 0..=horizon for a cohort of `cohort_size`.
    pub fn predict_alive(&self, horizon: usize, cohort_size: f64) -> Vec<f64> {
        self.survival(horizon).into_iter().map(|s| cohort_size * s).collect()
    }
}

/// Log-likelihood of a retention series under (γ, δ).
pub fn log_likelihood(gamma: f64, delta: f64, table: &CohortRetentionTable) -> RetentionResult<f64> {
    if table.len() < MIN_PERIODS {
        return Err(RetentionError::InsufficientData {
            model:    MODEL_NAME,
            required: MIN_PERIODS,
            actual:   table.len(),
        });
    }
    let params = SbgParams::new(gamma, delta)?;

    let p_churn = params.churn_probabilities(table.horizon());
    let mass: f64 = p_churn.iter().sum();
    if mass >= 1.0 {
        return Err(RetentionError::divergence(
            MODEL_NAME,
            format!("cumulative churn probability {mass} reached 1 within {} periods", table.horizon()),
            &[gamma, delta],
        ));
    }

    let mut ll = 0.0;
    for (t, (lost, p)) in table.lost().iter().zip(&p_churn).enumerate() {
        if *lost == 0.0 {
            continue;
        }
        if *p <= 0.0 {
            return Err(RetentionError::divergence(
                MODEL_NAME,
                format!("churn probability underflowed to 0 in period {}", t + 1),
                &[gamma, delta],
            ));
        }
        ll += lost * p.ln();
    }

    let survivors = table.alive()[table.horizon()];
    if survivors > 0.0 {
        ll += survivors * (1.0 - mass).ln();
    }

    Ok(ll)
}

/// Maximum-likelihood (γ, δ) on a training series.
pub fn fit(
    table: &CohortRetentionTable,
    initial_guess: (f64, f64),
    config: &EstimationConfig,
) -> RetentionResult<FitResult> {
    if table.len() < MIN_PERIODS {
        return Err(RetentionError::InsufficientData {
            model:    MODEL_NAME,
            required: MIN_PERIODS,
            actual:   table.len(),
        });
    }

    let bounds = config.bounds_for(&PARAMETER_NAMES, &[ParamBound::at_least(MIN_SHAPE); 2]);
    let objective = |x: &[f64]| -> RetentionResult<f64> { log_likelihood(x[0], x[1], table).map(|ll| -ll) };
    let outcome = minimize(
        &objective,
        &[initial_guess.0, initial_guess.1],
        &bounds,
        &config.optimizer,
        MODEL_NAME,
    )?;

    let fit = FitResult::from_outcome(MODEL_NAME, &PARAMETER_NAMES, &outcome, &bounds, table.cohort_size() as usize);
    let params = SbgParams::new(outcome.x[0], outcome.x[1])?;

    log::info!(
        "sbg fit: gamma={:.4} delta={:.4} LL={:.4} over {} periods (converged={})",
        params.gamma,
        params.delta,
        fit.log_likelihood,
        table.horizon(),
        fit.converged
    );

    Ok(fit.with_derived("mean_churn", params.mean_churn()))
}

/// `fit` over explicit `(period, alive)` columns.
pub fn fit_periods(
    train_periods: &[u32],
    train_alive: &[f64],
    initial_guess: (f64, f64),
    config: &EstimationConfig,
) -> RetentionResult<FitResult> {
    let table = CohortRetentionTable::from_columns(train_periods, train_alive)?;
    fit(&table, initial_guess, config)
}

/// Expected alive counts for t = 0..=horizon.
pub fn predict_alive(gamma: f64, delta: f64, horizon: usize, cohort_size: f64) -> RetentionResult<Vec<f64>> {
    Ok(SbgParams::new(gamma, delta)?.predict_alive(horizon, cohort_size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_churn_probability_is_mean_churn() {
        let params = SbgParams::new(0.7, 2.1).unwrap();
        let p = params.churn_probabilities(3);
        assert!((p[0] - 0.25).abs() < 1e-15);
        // P(T=2) = 0.25 · δ / (γ + δ + 1)
        assert!((p[1] - 0.25 * 2.1 / 3.8).abs() < 1e-15);
    }

    #[test]
    fn retention_rates_match_survival_ratio() {
        let params = SbgParams::new(1.3, 4.2).unwrap();
        let s = params.survival(6);
        for (t, r) in params.retention_rates(6).iter().enumerate() {
            assert!((r - s[t + 1] / s[t]).abs() < 1e-12, "period {}", t + 1);
        }
    }

    #[test]
    fn non_positive_shape_is_divergence() {
        assert!(SbgParams::new(0.0, 1.0).unwrap_err().is_divergence());
        assert!(predict_alive(1.0, -1.0, 3, 100.0).is_err());
    }
}
