//! Structured fit output shared by every model.

use crate::{
    config::ParamBound,
    model_selection::{aic, bic},
    optimizer::OptimizeOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A parameter this close to a finite bound is reported as a boundary solution.
pub const BOUNDARY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub model:               String,
    pub parameters:          BTreeMap<String, f64>,
    /// Maximized log-likelihood (≤ 0 for probability models).
    pub log_likelihood:      f64,
    pub converged:           bool,
    pub iterations:          usize,
    /// Number of observations used for BIC (customers or cohort members).
    pub n_observations:      usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub boundary_parameters: Vec<String>,
    /// Quantities computed from the fitted parameters; not counted in k.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub derived:             BTreeMap<String, f64>,
}

impl FitResult {
    /// Wrap an optimizer outcome whose value is the negative log-likelihood.
    pub fn from_outcome(
        model: &str,
        names: &[&str],
        outcome: &OptimizeOutcome,
        bounds: &[ParamBound],
        n_observations: usize,
    ) -> Self {
        let parameters = names
            .iter()
            .zip(&outcome.x)
            .map(|(name, value)| (name.to_string(), *value))
            .collect();

        let boundary_parameters: Vec<String> = names
            .iter()
            .zip(&outcome.x)
            .zip(bounds)
            .filter(|((_, v), b)| {
                let v = **v;
                (b.lower().is_finite() && v - b.lower() <= BOUNDARY_TOLERANCE)
                    || (b.upper().is_finite() && b.upper() - v <= BOUNDARY_TOLERANCE)
            })
            .map(|((name, _), _)| name.to_string())
            .collect();

        if !boundary_parameters.is_empty() {
            log::warn!("{model}: boundary solution for {boundary_parameters:?}");
        }

        Self {
            model: model.to_string(),
            parameters,
            log_likelihood: -outcome.value,
            converged: outcome.converged,
            iterations: outcome.iterations,
            n_observations,
            boundary_parameters,
            derived: BTreeMap::new(),
        }
    }

    pub fn parameter(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }

    /// Number of free parameters.
    pub fn k(&self) -> usize {
        self.parameters.len()
    }

    pub fn aic(&self) -> f64 {
        aic(self.k(), self.log_likelihood)
    }

    pub fn bic(&self) -> f64 {
        bic(self.k(), self.n_observations, self.log_likelihood)
    }

    pub fn with_derived(mut self, name: &str, value: f64) -> Self {
        self.derived.insert(name.to_string(), value);
        self
    }
}
