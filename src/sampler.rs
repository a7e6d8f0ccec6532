use crate::error::Result;
use crate::model::{portfolio_return, portfolio_variance, CovarianceMatrix, ReturnVector};
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// One randomly weighted portfolio in (volatility, return) space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FrontierPoint {
    pub volatility: f64,
    pub expected_return: f64,
}

/// Draws `n` long-only portfolios uniformly over the weight simplex and
/// reports where each lands. A seed makes the cloud reproducible.
pub fn sample(
    n: usize,
    expected_return: &ReturnVector,
    covariance: &CovarianceMatrix,
    seed: Option<u64>,
) -> Result<Vec<FrontierPoint>> {
    covariance.ensure_aligned(expected_return)?;
    if n == 0 || covariance.len() == 0 {
        return Ok(Vec::new());
    }

    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };

    let mu = expected_return.values();
    let sigma = covariance.matrix();
    Ok((0..n)
        .map(|_| {
            let w = generate_random_weights(mu.len(), &mut rng);
            FrontierPoint {
                volatility: portfolio_variance(&w, sigma).sqrt(),
                expected_return: portfolio_return(&w, mu),
            }
        })
        .collect())
}

/// Flat-Dirichlet weights: normalised Exp(1) draws.
fn generate_random_weights(n: usize, rng: &mut impl Rng) -> DVector<f64> {
    use rand_distr::{Distribution, Exp1};
    let raw: DVector<f64> = DVector::from_fn(n, |_, _| Exp1.sample(rng));
    let sum = raw.sum();
    raw / sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortfolioError;
    use nalgebra::DMatrix;

    fn inputs() -> (ReturnVector, CovarianceMatrix) {
        let mu = ReturnVector::from_pairs(&[("BTC", 0.30), ("ETH", 0.45), ("SOL", 0.60)]).unwrap();
        let m = DMatrix::from_row_slice(3, 3, &[0.36, 0.20, 0.22, 0.20, 0.49, 0.30, 0.22, 0.30, 0.81]);
        let cov = CovarianceMatrix::new(mu.symbols().to_vec(), m).unwrap();
        (mu, cov)
    }

    #[test]
    fn test_weights_sum_to_one() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let w = generate_random_weights(5, &mut rng);
            assert!((w.sum() - 1.0).abs() < 1e-10, "Weights should sum to 1.0, got {}", w.sum());
            assert!(w.iter().all(|&v| v >= 0.0), "Weights should be non-negative");
        }
    }

    #[test]
    fn test_seeded_cloud_is_reproducible() {
        let (mu, cov) = inputs();
        let a = sample(200, &mu, &cov, Some(42)).unwrap();
        let b = sample(200, &mu, &cov, Some(42)).unwrap();
        let c = sample(200, &mu, &cov, Some(43)).unwrap();
        assert_eq!(a.len(), 200);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_points_stay_inside_asset_bounds() {
        let (mu, cov) = inputs();
        for p in sample(500, &mu, &cov, None).unwrap() {
            assert!(p.expected_return >= 0.30 - 1e-12 && p.expected_return <= 0.60 + 1e-12);
            assert!(p.volatility > 0.0 && p.volatility <= 0.9 + 1e-12);
        }
    }

    #[test]
    fn test_zero_samples_and_mismatch() {
        let (mu, cov) = inputs();
        assert!(sample(0, &mu, &cov, Some(1)).unwrap().is_empty());

        let other = ReturnVector::from_pairs(&[("BTC", 0.30), ("ETH", 0.45)]).unwrap();
        assert!(matches!(sample(10, &other, &cov, Some(1)), Err(PortfolioError::Config(_))));
    }
}
