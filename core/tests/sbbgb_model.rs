use retention_core::{
    config::AnalysisConfig,
    incidence::{calibration_groups, CalibrationGroup},
    sbbgb_model::{
        fit_homogeneous, group_log_likelihood, individual_likelihood, p_alive,
        prob_holdout_count_given_alive, sample_log_likelihood,
    },
    simulate::simulate_panel,
};

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Route library logs through the test harness; repeat calls are no-ops.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn choose(n: u32, k: u32) -> f64 {
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

/// Every reachable (x, t_x) for n opportunities, weighted by its expected
/// head count among `size` customers. C(t_x−1, x−1) histories share each
/// (x, t_x) pair.
fn expected_groups(p: f64, theta: f64, n: u32, size: f64) -> Vec<CalibrationGroup> {
    init_logging();
    let mut groups = vec![CalibrationGroup::new(0, 0, n, size * individual_likelihood(p, theta, 0, 0, n).unwrap())];
    for t_x in 1..=n {
        for x in 1..=t_x {
            let l = individual_likelihood(p, theta, x, t_x, n).unwrap();
            groups.push(CalibrationGroup::new(x, t_x, n, size * choose(t_x - 1, x - 1) * l));
        }
    }
    groups
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// p=0.3, θ=0.2, n=6, x=2, t_x=3: one alive term plus three dropout terms,
/// summed by hand to 0.017751638016.
#[test]
fn homogeneous_likelihood_matches_reference() {
    let alive = 0.3f64.powi(2) * 0.7f64.powi(4) * 0.8f64.powi(6);
    let dropout: f64 = (0..3)
        .map(|j| 0.3f64.powi(2) * 0.7f64.powi(1 + j) * 0.2 * 0.8f64.powi(3 + j))
        .sum();

    let l = individual_likelihood(0.3, 0.2, 2, 3, 6).unwrap();
    assert!((l - (alive + dropout)).abs() < 1e-10, "L = {l}");
    assert!((l - 0.017751638016).abs() < 1e-10, "L = {l}");
}

/// Group contributions are weight · ln L.
#[test]
fn group_contribution_is_weighted_log() {
    let group = CalibrationGroup::new(2, 3, 6, 17.0);
    let contribution = group_log_likelihood(0.3, 0.2, &group).unwrap();
    assert!((contribution - 17.0 * 0.017751638016f64.ln()).abs() < 1e-9);
}

/// Long histories stay finite where the linear-space sum would underflow.
#[test]
fn long_histories_do_not_underflow() {
    let groups = [CalibrationGroup::new(900, 1900, 2000, 1.0)];
    let ll = sample_log_likelihood(0.45, 0.001, &groups).unwrap();
    assert!(ll.is_finite() && ll < -1000.0, "ll = {ll}");
}

/// Over every possible history the likelihoods form a distribution.
#[test]
fn likelihoods_sum_to_one_over_histories() {
    let total: f64 = expected_groups(0.35, 0.12, 7, 1.0).iter().map(|g| g.weight).sum();
    assert!((total - 1.0).abs() < 1e-12, "total = {total}");
}

#[test]
fn p_alive_matches_reference() {
    let pa = p_alive(0.3, 0.2, 2, 3, 6).unwrap();
    assert!((pa - 0.3191068728921968).abs() < 1e-12, "P(alive) = {pa}");
    assert_eq!(p_alive(0.3, 0.2, 4, 6, 6).unwrap(), 1.0, "a purchase at n proves the customer alive");
}

/// Holdout count probabilities given alive sum to 1 over x* = 0..=n*.
#[test]
fn holdout_count_distribution_sums_to_one() {
    let total: f64 = (0..=5)
        .map(|x| prob_holdout_count_given_alive(0.3, 0.2, 5, x).unwrap())
        .sum();
    assert!((total - 1.0).abs() < 1e-12, "total = {total}");

    let two = prob_holdout_count_given_alive(0.3, 0.2, 5, 2).unwrap();
    assert!((two - 0.153704448).abs() < 1e-12, "P(X*=2) = {two}");
}

/// Expected head counts are maximized at the generating parameters.
#[test]
fn fit_recovers_parameters_from_expected_counts() {
    let groups = expected_groups(0.4, 0.15, 6, 1000.0);
    let fit = fit_homogeneous(&groups, (0.5, 0.5), &AnalysisConfig::default_test().estimation).unwrap();

    let p = fit.parameter("p").unwrap();
    let theta = fit.parameter("theta").unwrap();
    assert!((p - 0.4).abs() < 1e-3, "p = {p}");
    assert!((theta - 0.15).abs() < 1e-3, "theta = {theta}");
    assert_eq!(fit.n_observations, 1000);
}

/// A simulated panel recovers its parameters within sampling error.
#[test]
fn fit_recovers_parameters_from_simulated_panel() {
    init_logging();
    let panel = simulate_panel(0.4, 0.15, 5_000, 6, 5, 77).unwrap();
    let groups = calibration_groups(&panel.rfm());
    let fit = fit_homogeneous(&groups, (0.5, 0.5), &AnalysisConfig::default_test().estimation).unwrap();

    let p = fit.parameter("p").unwrap();
    let theta = fit.parameter("theta").unwrap();
    assert!((p - 0.4).abs() < 0.03, "p = {p}");
    assert!((theta - 0.15).abs() < 0.03, "theta = {theta}");
}

#[test]
fn out_of_range_probability_is_divergence() {
    let groups = [CalibrationGroup::new(1, 1, 3, 1.0)];
    assert!(sample_log_likelihood(1.2, 0.1, &groups).unwrap_err().is_divergence());
    assert!(sample_log_likelihood(0.5, f64::NAN, &groups).unwrap_err().is_divergence());
}
