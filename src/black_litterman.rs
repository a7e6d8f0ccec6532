//! Black-Litterman posterior: blends the market-implied prior with absolute
//! investor views on single assets.
//!
//! Uncertainty of each view (Ω) is chosen before any linear algebra runs:
//!
//! - confidences supplied, one per view: Idzorek's method, where a confidence
//!   of 1 pins the posterior to the view and 0 leaves the prior untouched;
//! - no confidences: Ω proportional to the prior variance of each view;
//! - confidences supplied but the count does not match the views: the
//!   proportional Ω is used and the fallback is reported to the caller.
//!
//! The posterior is computed in the form that never inverts Ω, so fully
//! confident views (Ω = 0) are valid input.

use crate::error::{PortfolioError, Result};
use crate::model::{factor_positive_definite, CovarianceMatrix, ReturnVector, ViewSet};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

/// Which view-uncertainty construction produced a posterior.
#[derive(Clone, Debug, PartialEq)]
pub enum OmegaConstruction {
    /// No views were given; the prior passed straight through.
    NotNeeded,
    /// Confidence-driven (Idzorek) uncertainty.
    Idzorek,
    /// τ·diag(PΣPᵀ), no confidences supplied.
    Proportional,
    /// τ·diag(PΣPᵀ) because the confidence count did not match the views.
    ProportionalFallback { views: usize, confidences: usize },
}

impl OmegaConstruction {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::ProportionalFallback { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            Self::NotNeeded => "no views".to_string(),
            Self::Idzorek => "idzorek (per-view confidence)".to_string(),
            Self::Proportional => "proportional to prior variance".to_string(),
            Self::ProportionalFallback { views, confidences } => format!(
                "proportional fallback: {} confidences for {} views were ignored",
                confidences, views
            ),
        }
    }
}

/// Posterior estimates of a blend.
#[derive(Clone, Debug, PartialEq)]
pub struct Posterior {
    pub returns: ReturnVector,
    pub covariance: CovarianceMatrix,
    pub omega: OmegaConstruction,
}

/// Blends `prior` with `views`.
///
/// With no views the prior and covariance are returned unchanged. `tau`
/// scales the uncertainty of the prior itself.
pub fn blend(
    prior: &ReturnVector,
    covariance: &CovarianceMatrix,
    views: &ViewSet,
    confidences: Option<&[f64]>,
    tau: f64,
) -> Result<Posterior> {
    if !tau.is_finite() || tau <= 0.0 {
        return Err(PortfolioError::config(format!("tau must be positive, got {}", tau)));
    }
    covariance.ensure_aligned(prior)?;

    if views.is_empty() {
        if confidences.is_some_and(|c| !c.is_empty()) {
            warn!("Confidences supplied without any views; ignoring them");
        }
        return Ok(Posterior {
            returns: prior.clone(),
            covariance: covariance.clone(),
            omega: OmegaConstruction::NotNeeded,
        });
    }

    let n = covariance.len();
    let k = views.len();
    let mut picks = Vec::with_capacity(k);
    for (sym, _) in views.iter() {
        let idx = covariance
            .index_of(sym)
            .ok_or_else(|| PortfolioError::config(format!("view on {} which is not in the universe", sym)))?;
        picks.push(idx);
    }

    let sigma = covariance.matrix();
    if factor_positive_definite(sigma.clone()).is_none() {
        return Err(PortfolioError::config(
            "covariance matrix is not invertible; cannot blend views",
        ));
    }

    let method = select_omega(k, confidences)?;

    let p = DMatrix::from_fn(k, n, |row, col| if picks[row] == col { 1.0 } else { 0.0 });
    let q = DVector::from_iterator(k, views.iter().map(|(_, v)| v));
    let pi = prior.values();

    let view_variance = (&p * sigma * p.transpose()).diagonal();
    let omega = build_omega(&method, &view_variance, confidences, tau);

    // A view held with zero confidence has infinite uncertainty and drops out.
    let held: Vec<usize> = (0..k).filter(|&i| omega[i].is_finite()).collect();
    if held.len() < k {
        debug!("{} of {} views carry zero confidence and are ignored", k - held.len(), k);
    }
    if held.is_empty() {
        return Ok(Posterior {
            returns: prior.clone(),
            covariance: CovarianceMatrix::new(covariance.symbols().to_vec(), sigma * (1.0 + tau))?,
            omega: method,
        });
    }
    let p = p.select_rows(&held);
    let q = q.select_rows(&held);
    let omega = DMatrix::from_diagonal(&omega.select_rows(&held));

    let tau_sigma_pt = (sigma * p.transpose()) * tau;
    let a = &p * &tau_sigma_pt + omega;
    let a_chol = a
        .cholesky()
        .ok_or_else(|| PortfolioError::config("view system is singular; check the views"))?;

    let surprise = &q - &p * pi;
    let post_returns = pi + &tau_sigma_pt * a_chol.solve(&surprise);

    let shrink = &tau_sigma_pt * a_chol.solve(&tau_sigma_pt.transpose());
    let m = sigma * tau - shrink;
    let m = (&m + m.transpose()) * 0.5;
    let post_cov = sigma + m;

    debug!("Blended {} views with Ω: {}", held.len(), method.describe());
    for ((sym, view), idx) in views.iter().zip(&picks) {
        debug!(
            "  {}: prior {:+.4} view {:+.4} posterior {:+.4}",
            sym, pi[*idx], view, post_returns[*idx]
        );
    }

    Ok(Posterior {
        returns: ReturnVector::new(prior.symbols().to_vec(), post_returns)?,
        covariance: CovarianceMatrix::new(covariance.symbols().to_vec(), post_cov)?,
        omega: method,
    })
}

fn select_omega(views: usize, confidences: Option<&[f64]>) -> Result<OmegaConstruction> {
    match confidences {
        Some(c) if c.len() == views => {
            if let Some(bad) = c.iter().find(|v| !(0.0..=1.0).contains(*v)) {
                return Err(PortfolioError::config(format!(
                    "view confidence must be within [0, 1], got {}",
                    bad
                )));
            }
            Ok(OmegaConstruction::Idzorek)
        }
        Some(c) => {
            warn!(
                "{} confidences given for {} views; falling back to prior-variance view uncertainty",
                c.len(),
                views
            );
            Ok(OmegaConstruction::ProportionalFallback {
                views,
                confidences: c.len(),
            })
        }
        None => Ok(OmegaConstruction::Proportional),
    }
}

fn build_omega(
    method: &OmegaConstruction,
    view_variance: &DVector<f64>,
    confidences: Option<&[f64]>,
    tau: f64,
) -> DVector<f64> {
    match (method, confidences) {
        (OmegaConstruction::Idzorek, Some(conf)) => DVector::from_iterator(
            view_variance.len(),
            view_variance.iter().zip(conf).map(|(var, &c)| {
                if c == 0.0 {
                    f64::INFINITY
                } else {
                    tau * ((1.0 - c) / c) * var
                }
            }),
        ),
        _ => view_variance * tau,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::data::PriceMatrix;
    use crate::equilibrium;
    use crate::estimator;
    use crate::model::MarketCaps;

    fn scenario() -> (ReturnVector, CovarianceMatrix) {
        let prices = PriceMatrix::from_columns(&[
            ("BTC", &[100.0, 105.0, 102.0, 110.0]),
            ("ETH", &[100.0, 101.0, 104.0, 103.0]),
        ])
        .unwrap();
        let cfg = AnalysisConfig::default();
        let (_, cov) = estimator::estimate(&prices, &cfg).unwrap();
        let caps = MarketCaps::from_pairs(&[("BTC", 850.0), ("ETH", 280.0)]);
        let (pi, _) = equilibrium::implied_prior(&prices.row_mean(), &caps, &cov, &cfg).unwrap();
        (pi, cov)
    }

    fn eth_view() -> ViewSet {
        ViewSet::from_pairs(&[("ETH", 0.35)]).unwrap()
    }

    #[test]
    fn test_empty_views_are_identity() {
        let (pi, cov) = scenario();
        let post = blend(&pi, &cov, &ViewSet::empty(), None, 0.05).unwrap();
        assert_eq!(post.returns, pi);
        assert_eq!(post.covariance, cov);
        assert_eq!(post.omega, OmegaConstruction::NotNeeded);

        let post = blend(&pi, &cov, &ViewSet::empty(), Some(&[0.4]), 0.05).unwrap();
        assert_eq!(post.returns, pi);
    }

    #[test]
    fn test_confident_view_raises_posterior() {
        let (pi, cov) = scenario();
        let post = blend(&pi, &cov, &eth_view(), Some(&[0.9]), 0.05).unwrap();
        let prior_eth = pi.get("ETH").unwrap();
        let post_eth = post.returns.get("ETH").unwrap();
        assert!(post_eth > prior_eth, "posterior {} <= prior {}", post_eth, prior_eth);
        assert!((post_eth + 0.007521277).abs() < 1e-6, "posterior {}", post_eth);
        assert_eq!(post.omega, OmegaConstruction::Idzorek);
    }

    #[test]
    fn test_posterior_moves_monotonically_with_confidence() {
        let (pi, cov) = scenario();
        let mut last = f64::NEG_INFINITY;
        for conf in [0.0, 1e-12, 1e-9, 1e-6, 0.1, 0.3, 0.5, 0.7, 0.9, 0.99, 1.0] {
            let post = blend(&pi, &cov, &eth_view(), Some(&[conf]), 0.05).unwrap();
            let eth = post.returns.get("ETH").unwrap();
            assert!(eth >= last, "confidence {} gave {} < {}", conf, eth, last);
            last = eth;
        }
    }

    #[test]
    fn test_full_confidence_pins_view() {
        let (pi, cov) = scenario();
        let post = blend(&pi, &cov, &eth_view(), Some(&[1.0]), 0.05).unwrap();
        assert!((post.returns.get("ETH").unwrap() - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_zero_confidence_keeps_prior() {
        let (pi, cov) = scenario();
        let post = blend(&pi, &cov, &eth_view(), Some(&[0.0]), 0.05).unwrap();
        for (sym, prior) in pi.iter() {
            let got = post.returns.get(sym).unwrap();
            assert!((got - prior).abs() < 1e-6 * prior.abs().max(1.0), "{}: {} vs {}", sym, got, prior);
        }
    }

    #[test]
    fn test_zero_confidence_view_drops_out() {
        let (pi, cov) = scenario();
        let both = ViewSet::from_pairs(&[("BTC", 0.10), ("ETH", 0.35)]).unwrap();
        let mixed = blend(&pi, &cov, &both, Some(&[0.0, 0.9]), 0.05).unwrap();
        let alone = blend(&pi, &cov, &eth_view(), Some(&[0.9]), 0.05).unwrap();
        assert!((mixed.returns.values() - alone.returns.values()).amax() < 1e-12);
        assert!((mixed.covariance.matrix() - alone.covariance.matrix()).amax() < 1e-12);

        let none_held = blend(&pi, &cov, &eth_view(), Some(&[0.0]), 0.05).unwrap();
        let faint = blend(&pi, &cov, &eth_view(), Some(&[1e-12]), 0.05).unwrap();
        assert_eq!(none_held.returns, pi);
        assert!((faint.covariance.matrix() - none_held.covariance.matrix()).amax() < 1e-9);
    }

    #[test]
    fn test_default_omega_matches_even_confidence() {
        let (pi, cov) = scenario();
        let default = blend(&pi, &cov, &eth_view(), None, 0.05).unwrap();
        let even = blend(&pi, &cov, &eth_view(), Some(&[0.5]), 0.05).unwrap();
        assert_eq!(default.omega, OmegaConstruction::Proportional);
        assert!((default.returns.values() - even.returns.values()).amax() < 1e-12);
    }

    #[test]
    fn test_confidence_count_mismatch_falls_back() {
        let (pi, cov) = scenario();
        let fallback = blend(&pi, &cov, &eth_view(), Some(&[0.9, 0.2]), 0.05).unwrap();
        let default = blend(&pi, &cov, &eth_view(), None, 0.05).unwrap();
        assert_eq!(
            fallback.omega,
            OmegaConstruction::ProportionalFallback { views: 1, confidences: 2 }
        );
        assert!(fallback.omega.is_fallback());
        assert_eq!(fallback.returns, default.returns);
        assert_eq!(fallback.covariance, default.covariance);
    }

    #[test]
    fn test_posterior_covariance_not_below_prior() {
        let (pi, cov) = scenario();
        let post = blend(&pi, &cov, &eth_view(), Some(&[0.9]), 0.05).unwrap();
        let diff = post.covariance.matrix() - cov.matrix();
        for ev in diff.symmetric_eigenvalues().iter() {
            assert!(*ev >= -1e-12, "eigenvalue {} is negative", ev);
        }
    }

    #[test]
    fn test_rejects_unknown_view_and_bad_inputs() {
        let (pi, cov) = scenario();
        let sol = ViewSet::from_pairs(&[("SOL", 0.35)]).unwrap();
        assert!(matches!(blend(&pi, &cov, &sol, None, 0.05), Err(PortfolioError::Config(_))));
        assert!(matches!(
            blend(&pi, &cov, &eth_view(), Some(&[1.5]), 0.05),
            Err(PortfolioError::Config(_))
        ));
        assert!(matches!(blend(&pi, &cov, &eth_view(), None, 0.0), Err(PortfolioError::Config(_))));
    }

    #[test]
    fn test_rejects_singular_covariance() {
        let syms = vec!["BTC".to_string(), "ETH".to_string()];
        let cov = CovarianceMatrix::new(syms.clone(), DMatrix::from_element(2, 2, 0.04)).unwrap();
        let pi = ReturnVector::from_pairs(&[("BTC", 0.1), ("ETH", 0.1)]).unwrap();
        let err = blend(&pi, &cov, &eth_view(), None, 0.05).unwrap_err();
        assert!(matches!(err, PortfolioError::Config(_)), "got {:?}", err);
    }
}
