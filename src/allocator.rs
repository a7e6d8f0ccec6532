use crate::error::{PortfolioError, Result};
use crate::model::{factor_positive_definite, CovarianceMatrix, PerformanceTriple, ReturnVector, WeightsMapping};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────────────────────────────────────

/// Feasibility and optimality tolerance of the active-set solver, scaled by
/// the size of the problem's multipliers.
const SOLVER_TOLERANCE: f64 = 1e-12;

/// Active-set iterations allowed per asset before giving up.
const ITERATIONS_PER_ASSET: usize = 20;

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// Long-only, fully-invested allocation and its performance.
#[derive(Clone, Debug, PartialEq)]
pub struct Allocation {
    pub weights: WeightsMapping,
    pub performance: PerformanceTriple,
}

// ──────────────────────────────────────────────────────────────────────────────
// Optimizer: Max-Sharpe / Min-Volatility
// ──────────────────────────────────────────────────────────────────────────────

/// Maximum-Sharpe long-only allocation.
///
/// Solved as: minimise yᵀΣy subject to (μ − rf)ᵀy = 1, y ≥ 0, then w = y / Σy.
/// When no asset beats the risk-free rate but some have a positive expected
/// return, the minimum-volatility portfolio is returned instead. Weights below
/// `clean_cutoff` are zeroed and the rest renormalised before performance is
/// computed.
pub fn optimize(
    expected_return: &ReturnVector,
    covariance: &CovarianceMatrix,
    risk_free_rate: f64,
    clean_cutoff: f64,
) -> Result<Allocation> {
    check_inputs(expected_return, covariance, risk_free_rate)?;
    let mu = expected_return.values();

    let raw = if mu.iter().any(|m| *m > risk_free_rate) {
        let excess = mu.map(|m| m - risk_free_rate);
        solve_long_only(covariance.matrix(), &excess)?
    } else if mu.iter().any(|m| *m > 0.0) {
        warn!(
            "No asset beats the risk-free rate {:.4}; falling back to minimum volatility",
            risk_free_rate
        );
        solve_long_only(covariance.matrix(), &DVector::from_element(mu.len(), 1.0))?
    } else {
        return Err(PortfolioError::infeasible(
            "no asset has a positive expected return; max-Sharpe is undefined",
        ));
    };

    Ok(finish(raw, expected_return, covariance, risk_free_rate, clean_cutoff))
}

/// Global minimum-variance long-only allocation. Expected returns are only
/// used to report performance.
pub fn min_volatility(
    covariance: &CovarianceMatrix,
    expected_return: &ReturnVector,
    risk_free_rate: f64,
    clean_cutoff: f64,
) -> Result<Allocation> {
    check_inputs(expected_return, covariance, risk_free_rate)?;
    let ones = DVector::from_element(covariance.len(), 1.0);
    let raw = solve_long_only(covariance.matrix(), &ones)?;
    Ok(finish(raw, expected_return, covariance, risk_free_rate, clean_cutoff))
}

fn check_inputs(expected_return: &ReturnVector, covariance: &CovarianceMatrix, risk_free_rate: f64) -> Result<()> {
    covariance.ensure_aligned(expected_return)?;
    if expected_return.len() == 0 {
        return Err(PortfolioError::config("cannot allocate over an empty universe"));
    }
    if !risk_free_rate.is_finite() {
        return Err(PortfolioError::config(format!("risk-free rate is {}", risk_free_rate)));
    }
    Ok(())
}

fn finish(
    raw: DVector<f64>,
    expected_return: &ReturnVector,
    covariance: &CovarianceMatrix,
    risk_free_rate: f64,
    clean_cutoff: f64,
) -> Allocation {
    let total = raw.sum();
    let weights = clean_weights(&(raw / total), clean_cutoff);
    let performance = PerformanceTriple::evaluate(
        &weights,
        expected_return.values(),
        covariance.matrix(),
        risk_free_rate,
    );
    Allocation {
        weights: WeightsMapping::from_parts(covariance.symbols(), &weights),
        performance,
    }
}

/// Zeroes weights below `cutoff` and renormalises the rest to sum to one.
pub(crate) fn clean_weights(weights: &DVector<f64>, cutoff: f64) -> DVector<f64> {
    let kept = weights.map(|w| if w < cutoff { 0.0 } else { w });
    let total = kept.sum();
    if total <= 0.0 {
        return weights.clone();
    }
    kept / total
}

/// Minimises yᵀΣy subject to aᵀy = 1, y ≥ 0 with a primal active-set method.
///
/// Starts from the vertex of the asset with the largest `a`, solves the
/// equality-constrained problem on the free block by Cholesky, and either
/// releases the bound with the most negative multiplier or steps to the first
/// bound the step would cross.
fn solve_long_only(sigma: &DMatrix<f64>, a: &DVector<f64>) -> Result<DVector<f64>> {
    let n = a.len();
    let (start, best) = a.argmax();
    if best <= 0.0 {
        return Err(PortfolioError::infeasible("no asset has a positive objective coefficient"));
    }

    let mut y: DVector<f64> = DVector::zeros(n);
    y[start] = 1.0 / best;
    let mut free = vec![false; n];
    free[start] = true;

    for iteration in 0..ITERATIONS_PER_ASSET * n + 10 {
        let idx: Vec<usize> = (0..n).filter(|&i| free[i]).collect();
        let block = sigma.select_rows(&idx).select_columns(&idx);
        let a_free = a.select_rows(&idx);
        let chol = factor_positive_definite(block).ok_or_else(|| {
            PortfolioError::infeasible("covariance is not positive definite on the active assets")
        })?;
        let qa = chol.solve(&a_free);
        let denom = a_free.dot(&qa);
        if !denom.is_finite() || denom <= 0.0 {
            return Err(PortfolioError::infeasible("degenerate active set"));
        }

        let mut candidate: DVector<f64> = DVector::zeros(n);
        for (k, &i) in idx.iter().enumerate() {
            candidate[i] = qa[k] / denom;
        }
        let lambda = 1.0 / denom;
        let tol = SOLVER_TOLERANCE * (1.0 + lambda * a.amax());

        if idx.iter().all(|&i| candidate[i] >= -tol) {
            y = candidate.map(|v| v.max(0.0));
            let gradient = sigma * &y - a * lambda;
            let entering = (0..n)
                .filter(|&i| !free[i] && gradient[i] < -tol)
                .min_by(|&i, &j| gradient[i].total_cmp(&gradient[j]));
            match entering {
                Some(i) => free[i] = true,
                None => {
                    debug!("Active-set solver converged after {} iterations", iteration + 1);
                    return Ok(y);
                }
            }
        } else {
            // Step toward the candidate until the first free weight hits zero.
            let blocking = idx
                .iter()
                .copied()
                .filter(|&i| candidate[i] < 0.0)
                .map(|i| (i, y[i] / (y[i] - candidate[i])))
                .min_by(|l, r| l.1.total_cmp(&r.1));
            let Some((out, alpha)) = blocking else {
                return Err(PortfolioError::infeasible("active-set step found no blocking bound"));
            };
            y = &y + (&candidate - &y) * alpha;
            y[out] = 0.0;
            free[out] = false;
        }
    }

    Err(PortfolioError::infeasible("active-set solver did not converge"))
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::data::PriceMatrix;
    use crate::estimator;
    use crate::model::portfolio_variance;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Exp1, StandardNormal};

    fn scenario() -> (ReturnVector, CovarianceMatrix) {
        let prices = PriceMatrix::from_columns(&[
            ("BTC", &[100.0, 105.0, 102.0, 110.0]),
            ("ETH", &[100.0, 101.0, 104.0, 103.0]),
        ])
        .unwrap();
        estimator::estimate(&prices, &AnalysisConfig::default()).unwrap()
    }

    fn diagonal(names: &[&str], var: f64) -> CovarianceMatrix {
        let syms = names.iter().map(|s| s.to_string()).collect();
        CovarianceMatrix::new(syms, DMatrix::from_diagonal_element(names.len(), names.len(), var)).unwrap()
    }

    fn random_problem(rng: &mut StdRng, n: usize) -> (ReturnVector, CovarianceMatrix) {
        let f = DMatrix::from_fn(n + 3, n, |_, _| rng.sample::<f64, _>(StandardNormal));
        let sigma = f.transpose() * &f / 10.0 + DMatrix::from_diagonal_element(n, n, 0.01);
        let syms: Vec<String> = (0..n).map(|i| format!("A{}", i)).collect();
        let mut mu = DVector::from_fn(n, |_, _| 0.05 + 0.2 * rng.sample::<f64, _>(StandardNormal));
        mu[0] = mu[0].abs() + 0.01;
        (
            ReturnVector::new(syms.clone(), mu).unwrap(),
            CovarianceMatrix::new(syms, sigma).unwrap(),
        )
    }

    #[test]
    fn test_historical_max_sharpe_weights() {
        let (mu, cov) = scenario();
        let alloc = optimize(&mu, &cov, 0.0, 1e-4).unwrap();
        assert!((alloc.weights.get("BTC").unwrap() - 0.416335177).abs() < 1e-6);
        assert!((alloc.weights.get("ETH").unwrap() - 0.583664823).abs() < 1e-6);
        assert!((alloc.performance.sharpe_ratio - 19.046437276).abs() < 1e-5);
    }

    #[test]
    fn test_weights_are_long_only_and_sum_to_one() {
        let mut rng = StdRng::seed_from_u64(11);
        for n in 2..8 {
            let (mu, cov) = random_problem(&mut rng, n);
            let alloc = optimize(&mu, &cov, 0.0, 1e-4).unwrap();
            assert!((alloc.weights.sum() - 1.0).abs() < 1e-6, "sum {}", alloc.weights.sum());
            assert!(alloc.weights.iter().all(|(_, w)| w >= 0.0));
            assert_eq!(alloc.weights.iter().count(), n);
        }
    }

    #[test]
    fn test_no_sampled_portfolio_beats_max_sharpe() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            let (mu, cov) = random_problem(&mut rng, 5);
            let best = optimize(&mu, &cov, 0.0, 1e-4).unwrap().performance.sharpe_ratio;
            for _ in 0..2000 {
                let raw: DVector<f64> = DVector::from_fn(5, |_, _| {
                    if rng.gen_bool(0.3) { 0.0 } else { Exp1.sample(&mut rng) }
                });
                if raw.sum() <= 0.0 {
                    continue;
                }
                let w = &raw / raw.sum();
                let perf = PerformanceTriple::evaluate(&w, mu.values(), cov.matrix(), 0.0);
                assert!(
                    perf.sharpe_ratio <= best + 1e-6,
                    "sampled Sharpe {} beats optimum {}",
                    perf.sharpe_ratio,
                    best
                );
            }
        }
    }

    #[test]
    fn test_negative_asset_is_excluded() {
        let mu = ReturnVector::from_pairs(&[("A", 0.10), ("B", 0.20), ("C", -0.10)]).unwrap();
        let cov = diagonal(&["A", "B", "C"], 0.04);
        let alloc = optimize(&mu, &cov, 0.0, 1e-4).unwrap();
        assert!((alloc.weights.get("A").unwrap() - 1.0 / 3.0).abs() < 1e-9);
        assert!((alloc.weights.get("B").unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(alloc.weights.get("C"), Some(0.0));
    }

    #[test]
    fn test_dominated_correlated_asset_gets_zero() {
        let mu = ReturnVector::from_pairs(&[("A", 0.10), ("B", 0.05)]).unwrap();
        let m = DMatrix::from_row_slice(2, 2, &[0.04, 0.03, 0.03, 0.04]);
        let cov = CovarianceMatrix::new(vec!["A".into(), "B".into()], m).unwrap();
        let alloc = optimize(&mu, &cov, 0.0, 1e-4).unwrap();
        assert_eq!(alloc.weights.get("A"), Some(1.0));
        assert_eq!(alloc.weights.get("B"), Some(0.0));
    }

    #[test]
    fn test_min_volatility_two_assets() {
        let (mu, cov) = scenario();
        let alloc = min_volatility(&cov, &mu, 0.0, 1e-4).unwrap();
        assert!((alloc.weights.get("BTC").unwrap() - 0.317675337).abs() < 1e-6);
        let w = alloc.weights.to_vector();
        let equal = DVector::from_element(2, 0.5);
        assert!(portfolio_variance(&w, cov.matrix()) <= portfolio_variance(&equal, cov.matrix()));
    }

    #[test]
    fn test_falls_back_to_min_volatility_below_risk_free() {
        let (_, cov) = scenario();
        let mu = ReturnVector::from_pairs(&[("BTC", 0.01), ("ETH", 0.02)]).unwrap();
        let fallback = optimize(&mu, &cov, 0.05, 1e-4).unwrap();
        let min_vol = min_volatility(&cov, &mu, 0.05, 1e-4).unwrap();
        assert_eq!(fallback, min_vol);
    }

    #[test]
    fn test_all_non_positive_returns_are_infeasible() {
        let (_, cov) = scenario();
        let mu = ReturnVector::from_pairs(&[("BTC", -0.01), ("ETH", 0.0)]).unwrap();
        let err = optimize(&mu, &cov, 0.0, 1e-4).unwrap_err();
        assert!(matches!(err, PortfolioError::Infeasible(_)), "got {:?}", err);
    }

    #[test]
    fn test_riskless_asset_is_infeasible() {
        let mu = ReturnVector::from_pairs(&[("A", 0.10), ("B", 0.05)]).unwrap();
        let m = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.0]);
        let cov = CovarianceMatrix::new(vec!["A".into(), "B".into()], m).unwrap();
        assert!(matches!(optimize(&mu, &cov, 0.0, 1e-4), Err(PortfolioError::Infeasible(_))));
    }

    #[test]
    fn test_mismatched_universe_is_config_error() {
        let (_, cov) = scenario();
        let mu = ReturnVector::from_pairs(&[("ETH", 0.1), ("BTC", 0.2)]).unwrap();
        assert!(matches!(optimize(&mu, &cov, 0.0, 1e-4), Err(PortfolioError::Config(_))));
    }

    #[test]
    fn test_inputs_are_not_modified() {
        let (mu, cov) = scenario();
        let (mu_before, cov_before) = (mu.clone(), cov.clone());
        optimize(&mu, &cov, 0.0, 1e-4).unwrap();
        assert_eq!(mu, mu_before);
        assert_eq!(cov, cov_before);
    }

    #[test]
    fn test_clean_weights_drops_dust() {
        let w = DVector::from_vec(vec![0.6, 0.39995, 0.00005]);
        let cleaned = clean_weights(&w, 1e-4);
        assert_eq!(cleaned[2], 0.0);
        assert!((cleaned.sum() - 1.0).abs() < 1e-12);
        assert!(cleaned[0] > 0.6);
    }
}
