//! Bounded quasi-Newton minimizer shared by every model fit.
//!
//! Projected BFGS with a backtracking Armijo line search and
//! finite-difference gradients that never step outside the box.
//!
//! RULE: An objective that is undefined at a point returns Err (or a
//! non-finite value). The line search treats such a point as a rejected
//! step; only an undefined start or end point surfaces as ModelDivergence.

use std::cell::Cell;

use nalgebra::{DMatrix, DVector};

use crate::{
    config::{OptimizerConfig, ParamBound},
    error::{RetentionError, RetentionResult},
};

const FD_STEP:        f64 = 6.0e-6;
const ARMIJO_C1:      f64 = 1.0e-4;
const MAX_HALVINGS:   usize = 60;
const CURVATURE_EPS:  f64 = 1.0e-10;

/// A scalar function to minimize over a box.
pub trait Objective {
    fn value(&self, x: &[f64]) -> RetentionResult<f64>;

    fn gradient(&self, x: &[f64], bounds: &[ParamBound]) -> RetentionResult<Vec<f64>> {
        finite_difference_gradient(self, x, bounds)
    }
}

impl<F> Objective for F
where
    F: Fn(&[f64]) -> RetentionResult<f64>,
{
    fn value(&self, x: &[f64]) -> RetentionResult<f64> {
        self(x)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeOutcome {
    pub x:           Vec<f64>,
    pub value:       f64,
    pub iterations:  usize,
    pub evaluations: usize,
    pub converged:   bool,
}

/// Charges every objective evaluation against the run's budget. A
/// gradient costs two evaluations per coordinate.
struct Counted<'a, O: ?Sized> {
    inner: &'a O,
    calls: Cell<usize>,
}

impl<'a, O: Objective + ?Sized> Counted<'a, O> {
    fn new(inner: &'a O) -> Self {
        Self { inner, calls: Cell::new(0) }
    }

    fn calls(&self) -> usize {
        self.calls.get()
    }

    fn defined(&self, x: &DVector<f64>) -> Option<f64> {
        self.calls.set(self.calls.get() + 1);
        self.inner.value(x.as_slice()).ok().filter(|v| v.is_finite())
    }

    fn gradient(&self, x: &DVector<f64>, bounds: &[ParamBound]) -> RetentionResult<DVector<f64>> {
        self.calls.set(self.calls.get() + 2 * x.len());
        self.inner.gradient(x.as_slice(), bounds).map(DVector::from_vec)
    }
}

fn defined<O: Objective + ?Sized>(objective: &O, x: &[f64]) -> Option<f64> {
    objective.value(x).ok().filter(|v| v.is_finite())
}

/// Central differences where both neighbours are inside the box and
/// defined, one-sided otherwise.
pub fn finite_difference_gradient<O: Objective + ?Sized>(
    objective: &O,
    x: &[f64],
    bounds: &[ParamBound],
) -> RetentionResult<Vec<f64>> {
    let f0 = objective.value(x)?;
    let mut grad = vec![0.0; x.len()];
    let mut probe = x.to_vec();

    for i in 0..x.len() {
        let h = FD_STEP * x[i].abs().max(1.0);
        let bound = bounds.get(i).copied().unwrap_or_default();

        let mut eval_at = |xi: f64| -> Option<f64> {
            probe[i] = xi;
            let v = defined(objective, &probe);
            probe[i] = x[i];
            v
        };

        let up = if x[i] + h <= bound.upper() { eval_at(x[i] + h) } else { None };
        let down = if x[i] - h >= bound.lower() { eval_at(x[i] - h) } else { None };

        grad[i] = match (up, down) {
            (Some(fu), Some(fd)) => (fu - fd) / (2.0 * h),
            (Some(fu), None)     => (fu - f0) / h,
            (None, Some(fd))     => (f0 - fd) / h,
            (None, None)         => 0.0,
        };
    }
    Ok(grad)
}

fn project(x: &mut DVector<f64>, bounds: &[ParamBound]) {
    for (xi, b) in x.iter_mut().zip(bounds) {
        *xi = b.clamp(*xi);
    }
}

/// Components that sit on a bound with the gradient pushing outward.
fn active_set(x: &DVector<f64>, g: &DVector<f64>, bounds: &[ParamBound]) -> Vec<bool> {
    x.iter()
        .zip(g.iter())
        .zip(bounds)
        .map(|((&xi, &gi), b)| (xi <= b.lower() && gi > 0.0) || (xi >= b.upper() && gi < 0.0))
        .collect()
}

/// Zero the components flagged in `mask`.
fn free_part(v: &DVector<f64>, mask: &[bool]) -> DVector<f64> {
    DVector::from_iterator(v.len(), v.iter().zip(mask).map(|(&vi, &fixed)| if fixed { 0.0 } else { vi }))
}

/// H ← (I − ρ s yᵀ) H (I − ρ y sᵀ) + ρ s sᵀ
fn bfgs_update(h: &DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>) -> DMatrix<f64> {
    let rho = 1.0 / s.dot(y);
    let identity = DMatrix::<f64>::identity(s.len(), s.len());
    let left = &identity - s * y.transpose() * rho;
    let right = &identity - y * s.transpose() * rho;
    left * h * right + s * s.transpose() * rho
}

/// Minimize `objective` from `x0` inside `bounds`.
///
/// `model` names the caller in diagnostics and errors.
pub fn minimize<O: Objective + ?Sized>(
    objective: &O,
    x0: &[f64],
    bounds: &[ParamBound],
    config: &OptimizerConfig,
    model: &'static str,
) -> RetentionResult<OptimizeOutcome> {
    if x0.len() != bounds.len() {
        return Err(RetentionError::Configuration(format!(
            "{model}: {} starting values for {} bounds",
            x0.len(),
            bounds.len()
        )));
    }

    let n = x0.len();
    let objective = Counted::new(objective);
    let mut x = DVector::from_column_slice(x0);
    project(&mut x, bounds);

    let mut f = objective.defined(&x).ok_or_else(|| RetentionError::ModelDivergence {
        model,
        reason:     "objective undefined at the starting point".into(),
        params:     x.as_slice().to_vec(),
        iterations: 0,
    })?;
    let mut g = objective.gradient(&x, bounds)?;
    let mut h = DMatrix::<f64>::identity(n, n);
    let mut h_scaled = false;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < config.max_iterations {
        if objective.calls() >= config.max_evaluations {
            log::warn!("{model}: evaluation budget of {} spent after {iterations} iterations", config.max_evaluations);
            break;
        }
        iterations += 1;

        let active = active_set(&x, &g, bounds);
        let pg = free_part(&g, &active);
        if pg.amax() <= config.gradient_tolerance * f.abs().max(1.0) {
            converged = true;
            break;
        }

        let mut d = free_part(&(-(&h * &pg)), &active);
        if d.dot(&pg) >= 0.0 {
            h = DMatrix::identity(n, n);
            h_scaled = false;
            d = -pg.clone();
        }

        // Backtracking line search on the projected path.
        let mut alpha = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_HALVINGS {
            if objective.calls() >= config.max_evaluations {
                break;
            }
            let mut trial = &x + &d * alpha;
            project(&mut trial, bounds);
            let step = &trial - &x;
            if step.iter().all(|s| *s == 0.0) {
                break;
            }
            if let Some(ft) = objective.defined(&trial) {
                if ft <= f + ARMIJO_C1 * g.dot(&step) {
                    accepted = Some((trial, ft));
                    break;
                }
            }
            alpha *= 0.5;
        }

        let Some((x_new, f_new)) = accepted else {
            if h_scaled {
                log::debug!("{model}: line search failed at iteration {iterations}, resetting curvature");
                h = DMatrix::identity(n, n);
                h_scaled = false;
                continue;
            }
            log::debug!("{model}: no descent step from {:?} at iteration {iterations}", x.as_slice());
            break;
        };

        let g_new = objective.gradient(&x_new, bounds)?;
        let s = &x_new - &x;
        let y = &g_new - &g;

        let f_change = (f - f_new).abs();
        let became_active = active_set(&x_new, &g_new, bounds)
            .iter()
            .zip(&active)
            .any(|(&now, &before)| now && !before);

        x = x_new;
        g = g_new;
        let f_prev = f;
        f = f_new;

        log::debug!("{model}: iter {iterations} f={f:.10} alpha={alpha:.3e}");

        if f_change <= config.function_tolerance * f_prev.abs().max(f.abs()).max(1.0) {
            converged = true;
            break;
        }

        let sy = s.dot(&y);
        if became_active {
            h = DMatrix::identity(n, n);
            h_scaled = false;
        } else if sy > CURVATURE_EPS * s.norm() * y.norm() {
            if !h_scaled {
                h = DMatrix::identity(n, n) * (sy / y.norm_squared());
                h_scaled = true;
            }
            h = bfgs_update(&h, &s, &y);
        }
    }

    let x = x.as_slice().to_vec();
    if !f.is_finite() {
        return Err(RetentionError::ModelDivergence {
            model,
            reason: "objective undefined at the final point".into(),
            params: x,
            iterations,
        });
    }
    if !converged {
        log::warn!("{model}: optimizer stopped after {iterations} iterations without meeting tolerance");
    }

    Ok(OptimizeOutcome { x, value: f, iterations, evaluations: objective.calls(), converged })
}
