//! Seeded synthetic data drawn from the model processes, for parameter
//! recovery checks and demos.

use crate::{
    cohort::CohortRetentionTable,
    error::{RetentionError, RetentionResult},
    incidence::IncidencePanel,
    rng::{DrawStream, SeedBank},
    sbg_model::SbgParams,
};

/// A cohort whose members each draw θ ~ Beta(γ, δ) and churn at the end
/// of every period with probability θ.
pub fn simulate_cohort(
    params: SbgParams,
    cohort_size: usize,
    horizon: usize,
    seed: u64,
) -> RetentionResult<CohortRetentionTable> {
    if cohort_size == 0 {
        return Err(RetentionError::Configuration("cohort_size must be > 0".into()));
    }
    let mut rng = SeedBank::new(seed).for_stream(DrawStream::SyntheticCohort);
    let mut alive = vec![0.0; horizon + 1];

    for _ in 0..cohort_size {
        let theta = rng.beta(params.gamma, params.delta)?;
        alive[0] += 1.0;
        for count in alive.iter_mut().skip(1) {
            if rng.chance(theta) {
                break;
            }
            *count += 1.0;
        }
    }

    log::debug!("{}: simulated {cohort_size} customers over {horizon} periods", rng.name);
    CohortRetentionTable::from_alive(alive)
}

/// An incidence panel from the homogeneous purchase/dropout process:
/// at each opportunity an alive customer first dies with probability θ,
/// otherwise buys with probability p.
pub fn simulate_panel(
    p: f64,
    theta: f64,
    customers: usize,
    calibration_periods: usize,
    holdout_periods: usize,
    seed: u64,
) -> RetentionResult<IncidencePanel> {
    if !(0.0..=1.0).contains(&p) || !(0.0..=1.0).contains(&theta) {
        return Err(RetentionError::Configuration(format!("p={p} and theta={theta} must lie in [0, 1]")));
    }
    let mut rng = SeedBank::new(seed).for_stream(DrawStream::SyntheticPanel);
    let width = calibration_periods + holdout_periods;

    let mut ids = Vec::with_capacity(customers);
    let mut rows = Vec::with_capacity(customers);
    for customer in 0..customers {
        let mut row = vec![false; width];
        for slot in row.iter_mut() {
            if rng.chance(theta) {
                break;
            }
            *slot = rng.chance(p);
        }
        ids.push((customer + 1).to_string());
        rows.push(row);
    }

    log::debug!("{}: simulated {customers} customers over {width} opportunities", rng.name);
    IncidencePanel::new(ids, rows, calibration_periods)
}
