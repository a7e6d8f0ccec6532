use crate::config::AnalysisConfig;
use crate::error::{PortfolioError, Result};
use crate::model::{CovarianceMatrix, MarketCaps, ReturnVector, WeightsMapping};
use nalgebra::DVector;
use tracing::{debug, warn};

/// Market-implied risk aversion δ = (annual excess return) / (annual variance)
/// of a benchmark price series.
pub fn market_implied_risk_aversion(benchmark: &[f64], frequency: f64, risk_free_rate: f64) -> Result<f64> {
    if benchmark.len() < 3 {
        return Err(PortfolioError::data(format!(
            "benchmark needs at least 3 prices, got {}",
            benchmark.len()
        )));
    }
    if let Some(p) = benchmark.iter().find(|p| !p.is_finite() || **p <= 0.0) {
        return Err(PortfolioError::data(format!("benchmark contains invalid price {}", p)));
    }

    let rets: Vec<f64> = benchmark.windows(2).map(|w| w[1] / w[0] - 1.0).collect();
    let n = rets.len() as f64;
    let mean = rets.iter().sum::<f64>() / n;
    let var = rets.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    if var <= f64::EPSILON * mean.abs().max(1e-12) {
        return Err(PortfolioError::data("benchmark returns have zero variance"));
    }

    let delta = (mean * frequency - risk_free_rate) / (var * frequency);
    if delta <= 0.0 {
        warn!("Benchmark implies non-positive risk aversion ({:.4}); the prior will favour low-cap assets", delta);
    }
    Ok(delta)
}

/// Cap-weighted shares of the given universe: cap_i / Σ caps.
///
/// Capitalizations for symbols outside the universe are ignored.
pub fn market_weights(caps: &MarketCaps, symbols: &[String]) -> Result<WeightsMapping> {
    let extra: Vec<&str> = caps.symbols().filter(|s| !symbols.iter().any(|u| u == s)).collect();
    if !extra.is_empty() {
        warn!("Ignoring market caps for symbols outside the universe: {:?}", extra);
    }

    let mut raw = Vec::with_capacity(symbols.len());
    for sym in symbols {
        let cap = caps
            .get(sym)
            .ok_or_else(|| PortfolioError::config(format!("no market cap for {}", sym)))?;
        if !cap.is_finite() || cap <= 0.0 {
            return Err(PortfolioError::config(format!("market cap for {} is {}", sym, cap)));
        }
        raw.push(cap);
    }

    let total: f64 = raw.iter().sum();
    if total <= 0.0 {
        return Err(PortfolioError::config(format!(
            "total market cap must be positive, got {}",
            total
        )));
    }

    let weights = DVector::from_iterator(raw.len(), raw.iter().map(|c| c / total));
    Ok(WeightsMapping::from_parts(symbols, &weights))
}

/// Reverse optimization: the expected returns under which the cap-weighted
/// portfolio is mean-variance optimal, π = δ·Σ·w_mkt + rf.
///
/// Returns the prior and the risk aversion δ used to build it.
pub fn implied_prior(
    benchmark: &[f64],
    caps: &MarketCaps,
    covariance: &CovarianceMatrix,
    cfg: &AnalysisConfig,
) -> Result<(ReturnVector, f64)> {
    let w_mkt = market_weights(caps, covariance.symbols())?;
    let delta = market_implied_risk_aversion(benchmark, cfg.frequency, cfg.risk_free_rate)?;
    debug!("Market-implied risk aversion δ = {:.4}", delta);

    let pi = (covariance.matrix() * w_mkt.to_vector()) * delta
        + DVector::from_element(covariance.len(), cfg.risk_free_rate);
    Ok((ReturnVector::new(covariance.symbols().to_vec(), pi)?, delta))
}
