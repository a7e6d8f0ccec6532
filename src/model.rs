use crate::error::{PortfolioError, Result};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

fn ensure_unique(symbols: &[String], what: &str) -> Result<()> {
    let mut seen = HashSet::with_capacity(symbols.len());
    for s in symbols {
        if !seen.insert(s.as_str()) {
            return Err(PortfolioError::config(format!("{} lists {} more than once", what, s)));
        }
    }
    Ok(())
}

// ──────────────────────────────────────────────────────────────────────────────
// Expected returns
// ──────────────────────────────────────────────────────────────────────────────

/// Expected annual return per asset, in universe order.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnVector {
    symbols: Vec<String>,
    values: DVector<f64>,
}

impl ReturnVector {
    pub fn new(symbols: Vec<String>, values: DVector<f64>) -> Result<Self> {
        if symbols.len() != values.len() {
            return Err(PortfolioError::config(format!(
                "{} symbols but {} expected returns",
                symbols.len(),
                values.len()
            )));
        }
        ensure_unique(&symbols, "return vector")?;
        if let Some((sym, v)) = symbols.iter().zip(values.iter()).find(|(_, v)| !v.is_finite()) {
            return Err(PortfolioError::config(format!("expected return for {} is {}", sym, v)));
        }
        Ok(Self { symbols, values })
    }

    pub fn from_pairs(pairs: &[(&str, f64)]) -> Result<Self> {
        let symbols = pairs.iter().map(|(s, _)| s.to_string()).collect();
        let values = DVector::from_iterator(pairs.len(), pairs.iter().map(|(_, v)| *v));
        Self::new(symbols, values)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.symbols
            .iter()
            .position(|s| s == symbol)
            .map(|i| self.values[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.symbols
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Covariance
// ──────────────────────────────────────────────────────────────────────────────

/// Annualized covariance of asset returns, rows and columns in universe order.
#[derive(Clone, Debug, PartialEq)]
pub struct CovarianceMatrix {
    symbols: Vec<String>,
    matrix: DMatrix<f64>,
}

impl CovarianceMatrix {
    /// Builds a covariance matrix, rejecting shapes that do not match the
    /// universe and matrices that are not symmetric within rounding noise.
    pub fn new(symbols: Vec<String>, matrix: DMatrix<f64>) -> Result<Self> {
        let n = symbols.len();
        if matrix.nrows() != n || matrix.ncols() != n {
            return Err(PortfolioError::config(format!(
                "covariance is {}x{} for {} symbols",
                matrix.nrows(),
                matrix.ncols(),
                n
            )));
        }
        ensure_unique(&symbols, "covariance matrix")?;
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(PortfolioError::config("covariance contains non-finite entries"));
        }
        let scale = matrix.amax().max(1.0);
        for i in 0..n {
            if matrix[(i, i)] < -1e-12 * scale {
                return Err(PortfolioError::config(format!(
                    "negative variance {} for {}",
                    matrix[(i, i)],
                    symbols[i]
                )));
            }
            for j in (i + 1)..n {
                if (matrix[(i, j)] - matrix[(j, i)]).abs() > 1e-9 * scale {
                    return Err(PortfolioError::config(format!(
                        "covariance is not symmetric at ({}, {})",
                        symbols[i], symbols[j]
                    )));
                }
            }
        }
        let matrix = (&matrix + matrix.transpose()) * 0.5;
        Ok(Self { symbols, matrix })
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn index_of(&self, symbol: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s == symbol)
    }

    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        Some(self.matrix[(self.index_of(a)?, self.index_of(b)?)])
    }

    /// Both inputs must describe the same assets in the same order.
    pub fn ensure_aligned(&self, returns: &ReturnVector) -> Result<()> {
        if self.symbols != returns.symbols() {
            return Err(PortfolioError::config(format!(
                "expected returns cover {:?} but covariance covers {:?}",
                returns.symbols(),
                self.symbols
            )));
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Allocation outputs
// ──────────────────────────────────────────────────────────────────────────────

/// Long-only portfolio weights keyed by symbol, in universe order.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightsMapping {
    entries: Vec<(String, f64)>,
}

impl WeightsMapping {
    pub(crate) fn from_parts(symbols: &[String], weights: &DVector<f64>) -> Self {
        Self {
            entries: symbols.iter().cloned().zip(weights.iter().copied()).collect(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.entries.iter().find(|(s, _)| s == symbol).map(|(_, w)| *w)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.entries.iter().map(|(s, w)| (s.as_str(), *w))
    }

    pub fn sum(&self) -> f64 {
        self.entries.iter().map(|(_, w)| w).sum()
    }

    pub fn to_vector(&self) -> DVector<f64> {
        DVector::from_iterator(self.entries.len(), self.entries.iter().map(|(_, w)| *w))
    }
}

/// (expected annual return, annual volatility, Sharpe ratio) of a portfolio.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PerformanceTriple {
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
}

impl PerformanceTriple {
    pub fn evaluate(
        weights: &DVector<f64>,
        expected_return: &DVector<f64>,
        covariance: &DMatrix<f64>,
        risk_free_rate: f64,
    ) -> Self {
        let ret = portfolio_return(weights, expected_return);
        let vol = portfolio_variance(weights, covariance).sqrt();
        let sharpe_ratio = if vol > 1e-12 {
            (ret - risk_free_rate) / vol
        } else {
            0.0
        };
        Self {
            expected_return: ret,
            volatility: vol,
            sharpe_ratio,
        }
    }
}

pub fn portfolio_return(weights: &DVector<f64>, means: &DVector<f64>) -> f64 {
    weights.dot(means)
}

/// wᵀΣw, floored at zero to absorb rounding on near-singular matrices.
pub fn portfolio_variance(weights: &DVector<f64>, cov: &DMatrix<f64>) -> f64 {
    (cov * weights).dot(weights).max(0.0)
}

/// Relative pivot below which a symmetric matrix is treated as singular.
const PIVOT_TOLERANCE: f64 = 1e-12;

/// Cholesky factor of a symmetric matrix that is positive definite beyond
/// rounding. Every squared pivot must exceed `PIVOT_TOLERANCE` times the
/// matching diagonal entry, so exactly singular inputs that factor by luck
/// are rejected.
pub(crate) fn factor_positive_definite(m: DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    let diag = m.diagonal();
    let chol = m.cholesky()?;
    let l = chol.l_dirty();
    let well_posed = diag
        .iter()
        .enumerate()
        .all(|(i, &d)| d > 0.0 && l[(i, i)] * l[(i, i)] > PIVOT_TOLERANCE * d);
    well_posed.then_some(chol)
}

// ──────────────────────────────────────────────────────────────────────────────
// Investor inputs
// ──────────────────────────────────────────────────────────────────────────────

/// Capitalization proxy per symbol. Only relative sizes matter.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MarketCaps {
    caps: HashMap<String, f64>,
}

impl MarketCaps {
    pub fn new(caps: HashMap<String, f64>) -> Self {
        Self { caps }
    }

    pub fn from_pairs<S: AsRef<str>>(pairs: &[(S, f64)]) -> Self {
        Self {
            caps: pairs
                .iter()
                .map(|(s, v)| (s.as_ref().to_string(), *v))
                .collect(),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.caps.get(symbol).copied()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.caps.contains_key(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> + '_ {
        self.caps.keys().map(String::as_str)
    }
}

/// Absolute return views on single assets, in the order they were given.
///
/// Order matters: per-view confidences are matched to views by position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViewSet {
    views: Vec<(String, f64)>,
}

impl ViewSet {
    pub fn new(views: Vec<(String, f64)>) -> Result<Self> {
        let symbols: Vec<String> = views.iter().map(|(s, _)| s.clone()).collect();
        ensure_unique(&symbols, "view set")?;
        if let Some((sym, q)) = views.iter().find(|(_, q)| !q.is_finite()) {
            return Err(PortfolioError::config(format!("view on {} is {}", sym, q)));
        }
        Ok(Self { views })
    }

    pub fn from_pairs(pairs: &[(&str, f64)]) -> Result<Self> {
        Self::new(pairs.iter().map(|(s, q)| (s.to_string(), *q)).collect())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.views.iter().map(|(s, q)| (s.as_str(), *q))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_factor_rejects_singular_matrices() {
        let pd = DMatrix::from_row_slice(2, 2, &[0.04, 0.03, 0.03, 0.04]);
        assert!(factor_positive_definite(pd).is_some());

        let collinear = DMatrix::from_element(2, 2, 0.04);
        assert!(factor_positive_definite(collinear).is_none());

        let riskless = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.0]);
        assert!(factor_positive_definite(riskless).is_none());

        let rank_two = DMatrix::from_row_slice(3, 3, &[1.0, 0.5, 1.5, 0.5, 1.0, 1.5, 1.5, 1.5, 3.0]);
        assert!(factor_positive_definite(rank_two).is_none());
    }

    #[test]
    fn test_return_vector_lookup() {
        let r = ReturnVector::from_pairs(&[("BTC", 0.2), ("ETH", 0.3)]).unwrap();
        assert_eq!(r.get("ETH"), Some(0.3));
        assert_eq!(r.get("SOL"), None);
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_return_vector_rejects_duplicates_and_nan() {
        assert!(ReturnVector::from_pairs(&[("BTC", 0.2), ("BTC", 0.3)]).is_err());
        assert!(ReturnVector::from_pairs(&[("BTC", f64::NAN)]).is_err());
    }

    #[test]
    fn test_covariance_rejects_asymmetric() {
        let m = DMatrix::from_row_slice(2, 2, &[0.04, 0.01, 0.02, 0.09]);
        let err = CovarianceMatrix::new(syms(&["A", "B"]), m).unwrap_err();
        assert!(matches!(err, PortfolioError::Config(_)));
    }

    #[test]
    fn test_covariance_rejects_wrong_shape() {
        let m = DMatrix::from_element(3, 3, 0.01);
        assert!(CovarianceMatrix::new(syms(&["A", "B"]), m).is_err());
    }

    #[test]
    fn test_covariance_lookup() {
        let m = DMatrix::from_row_slice(2, 2, &[0.04, 0.01, 0.01, 0.09]);
        let cov = CovarianceMatrix::new(syms(&["A", "B"]), m).unwrap();
        assert_eq!(cov.get("B", "A"), Some(0.01));
        assert_eq!(cov.get("B", "B"), Some(0.09));
        assert_eq!(cov.get("C", "A"), None);
    }

    #[test]
    fn test_performance_triple() {
        let w = DVector::from_vec(vec![0.5, 0.5]);
        let mu = DVector::from_vec(vec![0.10, 0.20]);
        let cov = DMatrix::from_row_slice(2, 2, &[0.04, 0.0, 0.0, 0.04]);
        let perf = PerformanceTriple::evaluate(&w, &mu, &cov, 0.05);
        assert!((perf.expected_return - 0.15).abs() < 1e-12);
        assert!((perf.volatility - 0.02_f64.sqrt()).abs() < 1e-12);
        assert!((perf.sharpe_ratio - 0.10 / 0.02_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_view_set_preserves_order() {
        let views = ViewSet::from_pairs(&[("SOL", 0.35), ("ETH", 0.10)]).unwrap();
        let order: Vec<&str> = views.iter().map(|(s, _)| s).collect();
        assert_eq!(order, vec!["SOL", "ETH"]);
        assert!(ViewSet::from_pairs(&[("SOL", 0.1), ("SOL", 0.2)]).is_err());
        assert!(ViewSet::empty().is_empty());
    }
}
