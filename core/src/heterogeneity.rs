//! Heterogeneous S_BB-G/B: (p, θ) vary across customers as a bivariate
//! logit-normal, integrated out by Monte-Carlo over a fixed draw matrix.
//!
//!   (logit p, logit θ)ᵀ = μ + L·z,   z ~ N(0, I₂)
//!
//! L is diagonal for the uncorrelated variant and lower-triangular for the
//! correlated one.
//!
//! RULE: The draw matrix lives in an EstimationContext that the caller
//! builds once and passes to every evaluation of a fit. Nothing here
//! samples on its own.

use nalgebra::{Cholesky, Matrix2};

use crate::{
    config::{EstimationConfig, ParamBound},
    error::{RetentionError, RetentionResult},
    fit::FitResult,
    incidence::CalibrationGroup,
    optimizer::minimize,
    rng::{DrawStream, SeedBank},
    sbbgb_model::{self, total_weight, validate_history, weighted, LogProbs, LogSumExp},
};

pub const UNCORRELATED_MODEL: &str = "sbbgb_uncorrelated";
pub const CORRELATED_MODEL: &str = "sbbgb_correlated";
/// Tag for draw-averaged predictions, which serve either variant.
pub const HETEROGENEOUS_MODEL: &str = "sbbgb_heterogeneous";
pub const UNCORRELATED_PARAMETERS: [&str; 4] = ["mu_p", "mu_theta", "var_p", "var_theta"];
pub const CORRELATED_PARAMETERS: [&str; 5] = ["mu_p", "mu_theta", "chol_pp", "chol_tp", "chol_tt"];

const PSD_TOLERANCE: f64 = 1e-12;
const START_SCALE: f64 = 0.5;

// ── Estimation context ───────────────────────────────────────────────────────

/// Standard-normal draw matrix shared read-only by every likelihood
/// evaluation of one estimation run.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimationContext {
    draws: Vec<[f64; 2]>,
    seed:  Option<u64>,
}

impl EstimationContext {
    pub fn new(seed: u64, draws: usize) -> RetentionResult<Self> {
        if draws == 0 {
            return Err(RetentionError::Configuration("monte_carlo_draws must be > 0".into()));
        }
        let mut rng = SeedBank::new(seed).for_stream(DrawStream::Heterogeneity);
        let matrix = (0..draws).map(|_| [rng.standard_normal(), rng.standard_normal()]).collect();
        log::debug!("estimation context: {draws} draws from seed {seed}");
        Ok(Self { draws: matrix, seed: Some(seed) })
    }

    pub fn from_config(config: &EstimationConfig) -> RetentionResult<Self> {
        Self::new(config.random_seed, config.monte_carlo_draws)
    }

    /// Use caller-supplied standard-normal pairs.
    pub fn from_draws(draws: Vec<[f64; 2]>) -> RetentionResult<Self> {
        if draws.is_empty() {
            return Err(RetentionError::Configuration("draw matrix is empty".into()));
        }
        if draws.iter().flatten().any(|z| !z.is_finite()) {
            return Err(RetentionError::InvalidData("draw matrix holds non-finite values".into()));
        }
        Ok(Self { draws, seed: None })
    }

    pub fn draws(&self) -> &[[f64; 2]] {
        &self.draws
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}

// ── Link and density ─────────────────────────────────────────────────────────

/// Logistic function, evaluated so neither branch overflows.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Density of a logit-normal variable with location `mu` and scale `sigma`.
pub fn logit_normal_pdf(x: f64, mu: f64, sigma: f64) -> f64 {
    if x <= 0.0 || x >= 1.0 || sigma <= 0.0 {
        return 0.0;
    }
    let z = (logit(x) - mu) / sigma;
    (-0.5 * z * z).exp() / (sigma * (2.0 * std::f64::consts::PI).sqrt() * x * (1.0 - x))
}

// ── Mixing distribution ──────────────────────────────────────────────────────

/// Bivariate logit-normal over (p, θ) in Cholesky form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogitNormal {
    pub mu_p:     f64,
    pub mu_theta: f64,
    pub chol_pp:  f64,
    pub chol_tp:  f64,
    pub chol_tt:  f64,
}

impl LogitNormal {
    pub fn logits(&self, z: [f64; 2]) -> (f64, f64) {
        (
            self.mu_p + self.chol_pp * z[0],
            self.mu_theta + self.chol_tp * z[0] + self.chol_tt * z[1],
        )
    }

    pub fn var_p(&self) -> f64 {
        self.chol_pp * self.chol_pp
    }

    pub fn var_theta(&self) -> f64 {
        self.chol_tp * self.chol_tp + self.chol_tt * self.chol_tt
    }

    pub fn cov_p_theta(&self) -> f64 {
        self.chol_pp * self.chol_tp
    }

    fn as_vec(&self) -> Vec<f64> {
        vec![self.mu_p, self.mu_theta, self.chol_pp, self.chol_tp, self.chol_tt]
    }

    fn log_probs(&self, ctx: &EstimationContext, model: &'static str) -> RetentionResult<Vec<LogProbs>> {
        let all_finite = [self.mu_p, self.mu_theta, self.chol_pp, self.chol_tp, self.chol_tt]
            .iter()
            .all(|v| v.is_finite());
        if !all_finite {
            return Err(RetentionError::divergence(model, "non-finite mixing parameters", &self.as_vec()));
        }
        Ok(ctx
            .draws()
            .iter()
            .map(|&z| {
                let (a, b) = self.logits(z);
                LogProbs::from_logits(a, b)
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UncorrelatedParams {
    pub mu_p:      f64,
    pub mu_theta:  f64,
    pub var_p:     f64,
    pub var_theta: f64,
}

impl UncorrelatedParams {
    pub fn new(mu_p: f64, mu_theta: f64, var_p: f64, var_theta: f64) -> Self {
        Self { mu_p, mu_theta, var_p, var_theta }
    }

    pub fn to_logit_normal(&self) -> RetentionResult<LogitNormal> {
        if !(self.var_p >= 0.0 && self.var_theta >= 0.0) {
            return Err(RetentionError::divergence(
                UNCORRELATED_MODEL,
                "variances must be non-negative",
                &[self.mu_p, self.mu_theta, self.var_p, self.var_theta],
            ));
        }
        Ok(LogitNormal {
            mu_p:     self.mu_p,
            mu_theta: self.mu_theta,
            chol_pp:  self.var_p.sqrt(),
            chol_tp:  0.0,
            chol_tt:  self.var_theta.sqrt(),
        })
    }
}

/// Lower Cholesky factor of [[var_p, cov], [cov, var_theta]], or None when
/// that matrix is not positive semi-definite.
fn covariance_factor(var_p: f64, var_theta: f64, cov: f64) -> Option<Matrix2<f64>> {
    if !(var_p >= 0.0 && var_theta >= 0.0 && cov.is_finite()) {
        return None;
    }
    // A zero leading variance leaves no pivot to divide by.
    if var_p == 0.0 {
        return (cov.abs() <= PSD_TOLERANCE).then(|| Matrix2::new(0.0, 0.0, 0.0, var_theta.sqrt()));
    }
    if let Some(chol) = Cholesky::new(Matrix2::new(var_p, cov, cov, var_theta)) {
        return Some(chol.unpack());
    }

    // Singular but semi-definite: zero var_theta or |corr| = 1.
    if var_p * var_theta - cov * cov < -PSD_TOLERANCE {
        return None;
    }
    let chol_pp = var_p.sqrt();
    let chol_tp = cov / chol_pp;
    let chol_tt = (var_theta - chol_tp * chol_tp).max(0.0).sqrt();
    Some(Matrix2::new(chol_pp, 0.0, chol_tp, chol_tt))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrelatedParams {
    pub mu_p:      f64,
    pub mu_theta:  f64,
    pub var_p:     f64,
    pub var_theta: f64,
    pub cov:       f64,
    factor:        Matrix2<f64>,
}

impl CorrelatedParams {
    /// Accepts the covariance only if it is positive semi-definite.
    pub fn from_covariance(mu_p: f64, mu_theta: f64, var_p: f64, var_theta: f64, cov: f64) -> RetentionResult<Self> {
        let factor = covariance_factor(var_p, var_theta, cov).ok_or_else(|| {
            RetentionError::divergence(
                CORRELATED_MODEL,
                format!("covariance is not positive semi-definite (det = {})", var_p * var_theta - cov * cov),
                &[mu_p, mu_theta, var_p, var_theta, cov],
            )
        })?;
        Ok(Self { mu_p, mu_theta, var_p, var_theta, cov, factor })
    }

    pub fn from_cholesky(mu_p: f64, mu_theta: f64, chol_pp: f64, chol_tp: f64, chol_tt: f64) -> Self {
        let factor = Matrix2::new(chol_pp, 0.0, chol_tp, chol_tt);
        let sigma = factor * factor.transpose();
        Self {
            mu_p,
            mu_theta,
            var_p:     sigma[(0, 0)],
            var_theta: sigma[(1, 1)],
            cov:       sigma[(1, 0)],
            factor,
        }
    }

    pub fn to_logit_normal(&self) -> LogitNormal {
        LogitNormal {
            mu_p:     self.mu_p,
            mu_theta: self.mu_theta,
            chol_pp:  self.factor[(0, 0)],
            chol_tp:  self.factor[(1, 0)],
            chol_tt:  self.factor[(1, 1)],
        }
    }

    pub fn correlation(&self) -> f64 {
        let scale = (self.var_p * self.var_theta).sqrt();
        if scale > 0.0 { self.cov / scale } else { 0.0 }
    }
}

// ── Monte-Carlo likelihood ───────────────────────────────────────────────────

fn validate_groups(groups: &[CalibrationGroup], model: &'static str) -> RetentionResult<()> {
    if groups.is_empty() {
        return Err(RetentionError::InsufficientData { model, required: 1, actual: 0 });
    }
    groups.iter().try_for_each(|g| validate_history(g.p1x, g.t_x, g.n))
}

/// Σ weight_i · ln( mean_d L_i(p_d, θ_d) )
///
/// `model` tags any error with the variant being estimated.
pub fn mc_log_likelihood(
    dist: &LogitNormal,
    groups: &[CalibrationGroup],
    ctx: &EstimationContext,
    model: &'static str,
) -> RetentionResult<f64> {
    validate_groups(groups, model)?;
    let per_draw = dist.log_probs(ctx, model)?;
    let ln_draws = (per_draw.len() as f64).ln();

    let mut ll = 0.0;
    for g in groups {
        let mut acc = LogSumExp::new();
        for lp in &per_draw {
            acc.add(lp.ln_likelihood(g.p1x, g.t_x, g.n));
        }
        ll += weighted(g.weight, acc.value() - ln_draws);
    }

    if ll.is_nan() || ll == f64::NEG_INFINITY {
        return Err(RetentionError::divergence(model, "simulated likelihood is zero", &dist.as_vec()));
    }
    Ok(ll)
}

/// Draw-averaged P(alive at n | x, t_x, n).
pub fn mc_p_alive(dist: &LogitNormal, x: u32, t_x: u32, n: u32, ctx: &EstimationContext) -> RetentionResult<f64> {
    validate_history(x, t_x, n)?;
    let mut alive = LogSumExp::new();
    let mut total = LogSumExp::new();
    for lp in dist.log_probs(ctx, HETEROGENEOUS_MODEL)? {
        alive.add(lp.ln_alive_term(x, n));
        total.add(lp.ln_likelihood(x, t_x, n));
    }
    Ok((alive.value() - total.value()).exp())
}

/// Draw-averaged P(X(n, n+n*) = x* | alive at n).
pub fn mc_prob_holdout_count_given_alive(
    dist: &LogitNormal,
    n_star: u32,
    x_star: u32,
    ctx: &EstimationContext,
) -> RetentionResult<f64> {
    let mut acc = LogSumExp::new();
    for lp in dist.log_probs(ctx, HETEROGENEOUS_MODEL)? {
        acc.add(lp.ln_holdout_count_given_alive(n_star, x_star));
    }
    Ok((acc.value() - (ctx.len() as f64).ln()).exp())
}

// ── Fitting ──────────────────────────────────────────────────────────────────

/// Starting logits from the homogeneous fit, kept away from 0 and 1.
fn starting_location(groups: &[CalibrationGroup], config: &EstimationConfig) -> RetentionResult<(f64, f64)> {
    let mut quick = config.clone();
    quick.optimizer_bounds.clear();
    let homogeneous = sbbgb_model::fit_homogeneous(groups, (0.5, 0.5), &quick)?;
    let p = homogeneous.parameter("p").unwrap_or(0.5).clamp(1e-4, 1.0 - 1e-4);
    let theta = homogeneous.parameter("theta").unwrap_or(0.5).clamp(1e-4, 1.0 - 1e-4);
    Ok((logit(p), logit(theta)))
}

/// Fit (μ_p, μ_θ, σ²_p, σ²_θ) with σ² ≥ 0.
pub fn fit_uncorrelated(
    groups: &[CalibrationGroup],
    ctx: &EstimationContext,
    config: &EstimationConfig,
) -> RetentionResult<FitResult> {
    validate_groups(groups, UNCORRELATED_MODEL)?;
    let (mu_p, mu_theta) = starting_location(groups, config)?;

    let defaults = [ParamBound::free(), ParamBound::free(), ParamBound::at_least(0.0), ParamBound::at_least(0.0)];
    let bounds = config.bounds_for(&UNCORRELATED_PARAMETERS, &defaults);
    let objective = |x: &[f64]| -> RetentionResult<f64> {
        let dist = UncorrelatedParams::new(x[0], x[1], x[2], x[3]).to_logit_normal()?;
        mc_log_likelihood(&dist, groups, ctx, UNCORRELATED_MODEL).map(|ll| -ll)
    };
    let outcome = minimize(
        &objective,
        &[mu_p, mu_theta, START_SCALE, START_SCALE],
        &bounds,
        &config.optimizer,
        UNCORRELATED_MODEL,
    )?;

    let fit = FitResult::from_outcome(UNCORRELATED_MODEL, &UNCORRELATED_PARAMETERS, &outcome, &bounds, total_weight(groups));
    log::info!(
        "{UNCORRELATED_MODEL} fit: {:?} LL={:.4} ({} draws, converged={})",
        fit.parameters,
        fit.log_likelihood,
        ctx.len(),
        fit.converged
    );
    Ok(fit)
}

/// Fit (μ_p, μ_θ) and the Cholesky factor of Σ; the implied covariance is
/// reported as derived values.
pub fn fit_correlated(
    groups: &[CalibrationGroup],
    ctx: &EstimationContext,
    config: &EstimationConfig,
) -> RetentionResult<FitResult> {
    validate_groups(groups, CORRELATED_MODEL)?;
    let (mu_p, mu_theta) = starting_location(groups, config)?;

    let defaults = [
        ParamBound::free(),
        ParamBound::free(),
        ParamBound::at_least(0.0),
        ParamBound::free(),
        ParamBound::at_least(0.0),
    ];
    let bounds = config.bounds_for(&CORRELATED_PARAMETERS, &defaults);
    let objective = |x: &[f64]| -> RetentionResult<f64> {
        let dist = LogitNormal { mu_p: x[0], mu_theta: x[1], chol_pp: x[2], chol_tp: x[3], chol_tt: x[4] };
        mc_log_likelihood(&dist, groups, ctx, CORRELATED_MODEL).map(|ll| -ll)
    };
    let start = [mu_p, mu_theta, START_SCALE.sqrt(), 0.0, START_SCALE.sqrt()];
    let outcome = minimize(&objective, &start, &bounds, &config.optimizer, CORRELATED_MODEL)?;

    let implied = CorrelatedParams::from_cholesky(outcome.x[0], outcome.x[1], outcome.x[2], outcome.x[3], outcome.x[4]);
    let fit = FitResult::from_outcome(CORRELATED_MODEL, &CORRELATED_PARAMETERS, &outcome, &bounds, total_weight(groups))
        .with_derived("var_p", implied.var_p)
        .with_derived("var_theta", implied.var_theta)
        .with_derived("cov_p_theta", implied.cov)
        .with_derived("corr_p_theta", implied.correlation());

    log::info!(
        "{CORRELATED_MODEL} fit: {:?} corr={:.4} LL={:.4} ({} draws, converged={})",
        fit.parameters,
        implied.correlation(),
        fit.log_likelihood,
        ctx.len(),
        fit.converged
    );
    Ok(fit)
}
