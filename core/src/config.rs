use crate::error::{RetentionError, RetentionResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Every parameter name a model may expose to `optimizer_bounds`.
pub const KNOWN_PARAMETERS: [&str; 11] = [
    "gamma", "delta",
    "p", "theta",
    "mu_p", "mu_theta", "var_p", "var_theta",
    "chol_pp", "chol_tp", "chol_tt",
];

// ── RFM aggregation ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RfmConfig {
    #[serde(default = "default_date_format")]
    pub date_format: String,
    /// Last calibration day, counted like PurchDay (1 = earliest date).
    pub calibration_boundary: u32,
    /// Days per reporting unit for t_x and T (7 = weeks).
    #[serde(default = "default_time_unit_divisor")]
    pub time_unit_divisor: u32,
    /// Currency units; customers above it are treated as resellers.
    #[serde(default)]
    pub unauthorized_spend_threshold: Option<f64>,
}

fn default_date_format() -> String { "%Y%m%d".into() }
fn default_time_unit_divisor() -> u32 { 7 }

// ── Contractual cohort ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortConfig {
    /// Renewal periods after period 0 used to fit the sBG model.
    #[serde(default = "default_training_periods")]
    pub training_periods: usize,
}

fn default_training_periods() -> usize { 4 }

impl Default for CohortConfig {
    fn default() -> Self {
        Self { training_periods: default_training_periods() }
    }
}

// ── Discrete incidence panel ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidenceConfig {
    /// Transaction opportunities in the calibration window.
    #[serde(default = "default_calibration_periods")]
    pub calibration_periods: usize,
}

fn default_calibration_periods() -> usize { 6 }

impl Default for IncidenceConfig {
    fn default() -> Self {
        Self { calibration_periods: default_calibration_periods() }
    }
}

// ── Estimation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Relative tolerance on the projected gradient norm.
    #[serde(default = "default_gradient_tolerance")]
    pub gradient_tolerance: f64,
    /// Relative tolerance on the change in objective between iterations.
    #[serde(default = "default_function_tolerance")]
    pub function_tolerance: f64,
    /// Cap on objective evaluations, gradient probes included.
    #[serde(default = "default_max_evaluations")]
    pub max_evaluations: usize,
}

fn default_max_iterations() -> usize { 500 }
fn default_max_evaluations() -> usize { 100_000 }
fn default_gradient_tolerance() -> f64 { 1e-7 }
fn default_function_tolerance() -> f64 { 1e-12 }

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations:     default_max_iterations(),
            gradient_tolerance: default_gradient_tolerance(),
            function_tolerance: default_function_tolerance(),
            max_evaluations:    default_max_evaluations(),
        }
    }
}

/// Box constraint for one parameter. A missing side is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ParamBound {
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
}

impl ParamBound {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower: Some(lower), upper: Some(upper) }
    }

    pub fn at_least(lower: f64) -> Self {
        Self { lower: Some(lower), upper: None }
    }

    pub fn free() -> Self {
        Self::default()
    }

    pub fn lower(&self) -> f64 {
        self.lower.unwrap_or(f64::NEG_INFINITY)
    }

    pub fn upper(&self) -> f64 {
        self.upper.unwrap_or(f64::INFINITY)
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.lower()).min(self.upper())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimationConfig {
    #[serde(default = "default_monte_carlo_draws")]
    pub monte_carlo_draws: usize,
    #[serde(default = "default_random_seed")]
    pub random_seed: u64,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Overrides for model default bounds, keyed by parameter name.
    #[serde(default)]
    pub optimizer_bounds: BTreeMap<String, ParamBound>,
}

fn default_monte_carlo_draws() -> usize { 100_000 }
fn default_random_seed() -> u64 { 42 }

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            monte_carlo_draws: default_monte_carlo_draws(),
            random_seed:       default_random_seed(),
            optimizer:         OptimizerConfig::default(),
            optimizer_bounds:  BTreeMap::new(),
        }
    }
}

impl EstimationConfig {
    /// Resolve bounds for a model's parameters: configured override if
    /// present, otherwise the model default.
    pub fn bounds_for(&self, names: &[&str], defaults: &[ParamBound]) -> Vec<ParamBound> {
        names
            .iter()
            .zip(defaults)
            .map(|(name, default)| self.optimizer_bounds.get(*name).copied().unwrap_or(*default))
            .collect()
    }
}

// ── Top level ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub rfm: Option<RfmConfig>,
    #[serde(default)]
    pub cohort: CohortConfig,
    #[serde(default)]
    pub incidence: IncidenceConfig,
    #[serde(default)]
    pub estimation: EstimationConfig,
}

impl AnalysisConfig {
    /// Load from a JSON file.
    /// In tests, use AnalysisConfig::default_test().
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config = Self::from_json_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config {path}: {e}"))?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> RetentionResult<Self> {
        let config: AnalysisConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// The RFM section, which carries the required calibration boundary.
    pub fn rfm(&self) -> RetentionResult<&RfmConfig> {
        self.rfm.as_ref().ok_or_else(|| {
            RetentionError::Configuration("missing `rfm` section (calibration_boundary is required)".into())
        })
    }

    pub fn validate(&self) -> RetentionResult<()> {
        if let Some(rfm) = &self.rfm {
            if rfm.calibration_boundary == 0 {
                return Err(RetentionError::Configuration(
                    "calibration_boundary must be >= 1 (PurchDay is 1-based)".into(),
                ));
            }
            if rfm.time_unit_divisor == 0 {
                return Err(RetentionError::Configuration("time_unit_divisor must be > 0".into()));
            }
            if let Some(threshold) = rfm.unauthorized_spend_threshold {
                if !threshold.is_finite() || threshold < 0.0 {
                    return Err(RetentionError::Configuration(format!(
                        "unauthorized_spend_threshold must be a non-negative amount, got {threshold}"
                    )));
                }
            }
        }

        if self.cohort.training_periods < 2 {
            return Err(RetentionError::Configuration(format!(
                "cohort.training_periods must be >= 2, got {}",
                self.cohort.training_periods
            )));
        }
        if self.incidence.calibration_periods == 0 {
            return Err(RetentionError::Configuration(
                "incidence.calibration_periods must be > 0".into(),
            ));
        }

        let est = &self.estimation;
        if est.monte_carlo_draws == 0 {
            return Err(RetentionError::Configuration("monte_carlo_draws must be > 0".into()));
        }
        if est.optimizer.max_iterations == 0 {
            return Err(RetentionError::Configuration("optimizer.max_iterations must be > 0".into()));
        }
        if est.optimizer.max_evaluations == 0 {
            return Err(RetentionError::Configuration("optimizer.max_evaluations must be > 0".into()));
        }
        for (name, bound) in &est.optimizer_bounds {
            if !KNOWN_PARAMETERS.contains(&name.as_str()) {
                return Err(RetentionError::Configuration(format!(
                    "optimizer_bounds: unknown parameter '{name}'"
                )));
            }
            if bound.lower() > bound.upper() {
                return Err(RetentionError::Configuration(format!(
                    "optimizer_bounds.{name}: lower {} > upper {}",
                    bound.lower(),
                    bound.upper()
                )));
            }
        }
        Ok(())
    }

    /// Small deterministic configuration for tests.
    pub fn default_test() -> Self {
        Self {
            rfm: Some(RfmConfig {
                date_format:                  default_date_format(),
                calibration_boundary:         273,
                time_unit_divisor:            7,
                unauthorized_spend_threshold: Some(4000.0),
            }),
            cohort: CohortConfig { training_periods: 4 },
            incidence: IncidenceConfig { calibration_periods: 6 },
            estimation: EstimationConfig {
                monte_carlo_draws: 5_000,
                random_seed:       0x5EED,
                optimizer:         OptimizerConfig::default(),
                optimizer_bounds:  BTreeMap::new(),
            },
        }
    }
}
