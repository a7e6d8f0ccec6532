use crate::config::{AnalysisConfig, CovarianceMethod, ReturnMethod};
use crate::data::PriceMatrix;
use crate::error::{PortfolioError, Result};
use crate::model::{CovarianceMatrix, ReturnVector};
use nalgebra::{DMatrix, DVector};
use tracing::debug;

/// Estimates annualized expected returns and a shrunk covariance matrix from
/// a price history.
///
/// The raw sample covariance of a few hundred crypto returns is close to
/// singular, so the covariance always goes through a Ledoit-Wolf estimator.
pub fn estimate(prices: &PriceMatrix, cfg: &AnalysisConfig) -> Result<(ReturnVector, CovarianceMatrix)> {
    check_history(prices)?;

    let returns = prices.returns();
    let mu = expected_returns(&returns, cfg.frequency, cfg.return_method);

    let (shrunk, intensity) = match cfg.covariance_method {
        CovarianceMethod::LedoitWolf => ledoit_wolf(&returns),
        CovarianceMethod::ConstantCorrelation => ledoit_wolf_constant_correlation(&returns)?,
    };
    if shrunk.trace() <= 0.0 {
        return Err(PortfolioError::data("prices never move; covariance is identically zero"));
    }
    debug!(
        "Covariance shrinkage ({:?}) intensity {:.4} over {} returns",
        cfg.covariance_method,
        intensity,
        returns.nrows()
    );

    let symbols = prices.symbols().to_vec();
    Ok((
        ReturnVector::new(symbols.clone(), mu)?,
        CovarianceMatrix::new(symbols, shrunk * cfg.frequency)?,
    ))
}

fn check_history(prices: &PriceMatrix) -> Result<()> {
    let n = prices.n_assets();
    let t = prices.n_periods();
    if n < 2 {
        return Err(PortfolioError::data(format!("need at least 2 assets, got {}", n)));
    }
    prices.validate_prices()?;
    if t < n {
        return Err(PortfolioError::data(format!(
            "{} periods is fewer than the {} assets",
            t, n
        )));
    }
    if t < 3 {
        return Err(PortfolioError::data(format!(
            "need at least 3 periods to estimate dispersion, got {}",
            t
        )));
    }
    Ok(())
}

fn column_means(x: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_iterator(x.ncols(), x.column_iter().map(|c| c.mean()))
}

fn centered(x: &DMatrix<f64>) -> DMatrix<f64> {
    let means = column_means(x);
    DMatrix::from_fn(x.nrows(), x.ncols(), |r, c| x[(r, c)] - means[c])
}

/// Annualized expected return per column of a periodic returns matrix.
pub fn expected_returns(returns: &DMatrix<f64>, frequency: f64, method: ReturnMethod) -> DVector<f64> {
    match method {
        ReturnMethod::Arithmetic => column_means(returns) * frequency,
        ReturnMethod::Compounded => {
            let n = returns.nrows() as f64;
            DVector::from_iterator(
                returns.ncols(),
                returns.column_iter().map(|c| {
                    let growth: f64 = c.iter().map(|r| 1.0 + r).product();
                    growth.powf(frequency / n) - 1.0
                }),
            )
        }
    }
}

/// Ledoit-Wolf shrinkage toward a scaled identity.
///
/// Returns the shrunk (per-period) covariance and the shrinkage intensity in
/// [0, 1]. The target is `mu * I` where `mu` is the average sample variance.
pub fn ledoit_wolf(returns: &DMatrix<f64>) -> (DMatrix<f64>, f64) {
    let (t, p) = returns.shape();
    let (tf, pf) = (t as f64, p as f64);
    let x = centered(returns);
    let x2 = x.map(|v| v * v);

    let trace_sum = x2.sum() / tf;
    let mu = trace_sum / pf;

    let xtx = x.transpose() * &x;
    let delta_sum = xtx.map(|v| v * v).sum() / (tf * tf);
    let beta_sum = (x2.transpose() * &x2).sum();

    let beta = (beta_sum / tf - delta_sum) / (pf * tf);
    let delta = (delta_sum - 2.0 * mu * trace_sum + pf * mu * mu) / pf;
    let beta = beta.min(delta);
    let shrinkage = if beta <= 0.0 || delta <= 0.0 {
        0.0
    } else {
        (beta / delta).clamp(0.0, 1.0)
    };

    let emp_cov = xtx / tf;
    let target = DMatrix::identity(p, p) * mu;
    (emp_cov * (1.0 - shrinkage) + target * shrinkage, shrinkage)
}

/// Ledoit-Wolf shrinkage toward a constant-correlation target: sample
/// variances on the diagonal, the average pairwise correlation elsewhere.
pub fn ledoit_wolf_constant_correlation(returns: &DMatrix<f64>) -> Result<(DMatrix<f64>, f64)> {
    let (t, p) = returns.shape();
    let tf = t as f64;
    let x = centered(returns);
    let xtx = x.transpose() * &x;
    let s = &xtx / (tf - 1.0);

    let var = s.diagonal();
    if var.iter().any(|v| *v <= 0.0) {
        return Err(PortfolioError::data(
            "constant-correlation shrinkage needs every asset to have non-zero variance",
        ));
    }
    let std = var.map(f64::sqrt);

    let mut corr_sum = 0.0;
    for i in 0..p {
        for j in 0..p {
            corr_sum += s[(i, j)] / (std[i] * std[j]);
        }
    }
    let pf = p as f64;
    let r_bar = (corr_sum - pf) / (pf * (pf - 1.0));
    let target = DMatrix::from_fn(p, p, |i, j| {
        if i == j { var[i] } else { r_bar * std[i] * std[j] }
    });

    // Asymptotic variance of the sample covariance entries.
    let y = x.map(|v| v * v);
    let pi_mat = (y.transpose() * &y) / tf - (xtx.component_mul(&s) * (2.0 / tf)) + s.component_mul(&s);
    let pi_hat = pi_mat.sum();

    let help = &xtx / tf;
    let term1 = (x.map(|v| v * v * v).transpose() * &x) / tf;
    let mut rho_off = 0.0;
    for i in 0..p {
        for j in 0..p {
            if i == j {
                continue;
            }
            let theta = term1[(i, j)] - help[(i, i)] * s[(i, j)] - help[(i, j)] * var[i] + var[i] * s[(i, j)];
            rho_off += std[j] / std[i] * theta;
        }
    }
    let rho_hat = pi_mat.trace() + r_bar * rho_off;
    let gamma_hat = (&s - &target).norm_squared();

    let shrinkage = if gamma_hat <= f64::EPSILON * s.norm_squared() {
        0.0
    } else {
        ((pi_hat - rho_hat) / gamma_hat / tf).clamp(0.0, 1.0)
    };

    Ok((&target * shrinkage + &s * (1.0 - shrinkage), shrinkage))
}
