use crate::error::{PortfolioError, Result};
use anyhow::anyhow;
use tracing::warn;

/// Periods per year used to annualize daily statistics.
pub const TRADING_DAYS: f64 = 252.0;

/// Weight of the equilibrium prior in the Black-Litterman blend.
pub const DEFAULT_TAU: f64 = 0.05;

pub const DEFAULT_RISK_FREE_RATE: f64 = 0.0;

/// Weights below this are reported as exactly zero.
pub const CLEAN_WEIGHT_CUTOFF: f64 = 1e-4;

/// Number of random portfolios drawn for the frontier cloud.
pub const DEFAULT_FRONTIER_SAMPLES: usize = 1500;

/// Candles requested per symbol from the exchange.
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// Market proxy used for risk aversion when it is part of the universe.
pub const BENCHMARK_SYMBOL: &str = "BTC/USDT";

pub const DEFAULT_SYMBOLS: &[&str] = &["BTC/USDT", "ETH/USDT", "SOL/USDT", "BNB/USDT", "LINK/USDT"];

/// Approximate capitalizations in billions of USD. Refresh before relying on them.
pub const DEFAULT_MARKET_CAPS: &[(&str, f64)] = &[
    ("BTC/USDT", 850.0),
    ("ETH/USDT", 280.0),
    ("BNB/USDT", 45.0),
    ("SOL/USDT", 40.0),
    ("LINK/USDT", 8.0),
];

pub const DEFAULT_VIEWS: &[(&str, f64)] = &[("SOL/USDT", 0.35), ("ETH/USDT", 0.10)];

/// Parallel to `DEFAULT_VIEWS`.
pub const DEFAULT_VIEW_CONFIDENCES: &[f64] = &[0.8, 0.5];

const DEFAULT_BINANCE_URL: &str = "https://api.binance.com";

// ──────────────────────────────────────────────────────────────────────────────
// Analysis configuration
// ──────────────────────────────────────────────────────────────────────────────

/// How periodic returns are turned into an annual expected return.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReturnMethod {
    /// Mean periodic return times the annualization factor.
    #[default]
    Arithmetic,
    /// Geometric growth rate over the whole history, annualized.
    Compounded,
}

/// Structured target the sample covariance is shrunk toward.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CovarianceMethod {
    /// Scaled identity (average variance on the diagonal).
    #[default]
    LedoitWolf,
    /// Sample variances with a single average correlation off the diagonal.
    ConstantCorrelation,
}

/// Immutable settings for one analysis run.
///
/// Passed by reference into every pipeline stage; nothing in the pipeline
/// keeps state between calls.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalysisConfig {
    pub tau: f64,
    pub risk_free_rate: f64,
    /// Sampling periods per year (252 for daily candles).
    pub frequency: f64,
    pub clean_cutoff: f64,
    pub frontier_samples: usize,
    /// Seed for the frontier sampler; `None` draws from entropy.
    pub seed: Option<u64>,
    pub return_method: ReturnMethod,
    pub covariance_method: CovarianceMethod,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            tau: DEFAULT_TAU,
            risk_free_rate: DEFAULT_RISK_FREE_RATE,
            frequency: TRADING_DAYS,
            clean_cutoff: CLEAN_WEIGHT_CUTOFF,
            frontier_samples: DEFAULT_FRONTIER_SAMPLES,
            seed: None,
            return_method: ReturnMethod::default(),
            covariance_method: CovarianceMethod::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.tau.is_finite() || self.tau <= 0.0 {
            return Err(PortfolioError::config(format!(
                "tau must be a positive number, got {}",
                self.tau
            )));
        }
        if !self.frequency.is_finite() || self.frequency <= 0.0 {
            return Err(PortfolioError::config(format!(
                "annualization frequency must be positive, got {}",
                self.frequency
            )));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(PortfolioError::config("risk-free rate must be finite"));
        }
        if !(0.0..0.5).contains(&self.clean_cutoff) {
            return Err(PortfolioError::config(format!(
                "weight cleaning cutoff must be in [0, 0.5), got {}",
                self.clean_cutoff
            )));
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Price loader configuration
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct LoaderConfig {
    pub base_url: String,
    /// Pause between consecutive symbol requests.
    pub fetch_delay_ms: u64,
    pub retry_attempts: usize,
    pub timeout_secs: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BINANCE_URL.to_string(),
            fetch_delay_ms: 100,
            retry_attempts: 3,
            timeout_secs: 15,
        }
    }
}

impl LoaderConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let base_url = std::env::var("ALLOCATOR_BINANCE_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.base_url);

        Self {
            base_url,
            fetch_delay_ms: env_u64("ALLOCATOR_FETCH_DELAY_MS", defaults.fetch_delay_ms, 0, 5_000),
            retry_attempts: env_u64("ALLOCATOR_RETRY_ATTEMPTS", defaults.retry_attempts as u64, 1, 8)
                as usize,
            timeout_secs: env_u64("ALLOCATOR_TIMEOUT_SECS", defaults.timeout_secs, 1, 120),
        }
    }
}

fn env_u64(name: &str, default: u64, min: u64, max: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(v) => v.clamp(min, max),
            Err(_) => {
                warn!("Ignoring {}={} (not an integer); using {}", name, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Command-line value parsing
// ──────────────────────────────────────────────────────────────────────────────

pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Parses `SYMBOL=VALUE` pairs separated by commas, keeping input order.
pub fn parse_assignments(input: &str) -> anyhow::Result<Vec<(String, f64)>> {
    let mut out: Vec<(String, f64)> = Vec::new();
    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (sym, val) = part
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected SYMBOL=VALUE, got '{}'", part))?;
        let symbol = normalize_symbol(sym);
        if symbol.is_empty() {
            return Err(anyhow!("Empty symbol in '{}'", part));
        }
        let value = val
            .trim()
            .parse::<f64>()
            .map_err(|_| anyhow!("Invalid number '{}' for {}", val.trim(), symbol))?;
        if out.iter().any(|(s, _)| *s == symbol) {
            return Err(anyhow!("{} given more than once", symbol));
        }
        out.push((symbol, value));
    }
    Ok(out)
}

pub fn parse_number_list(input: &str) -> anyhow::Result<Vec<f64>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<f64>().map_err(|_| anyhow!("Invalid number '{}'", p)))
        .collect()
}
