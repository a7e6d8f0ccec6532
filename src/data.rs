use crate::config::LoaderConfig;
use crate::error::{PortfolioError, Result};
use anyhow::{Context, anyhow};
use chrono::{DateTime, Duration, Utc};
use nalgebra::DMatrix;
use rand::prelude::*;
use rand_distr::StandardNormal;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use tracing::{debug, info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Price matrix
// ──────────────────────────────────────────────────────────────────────────────

/// Closing prices, one row per period and one column per symbol.
///
/// `periods` are candle open times in milliseconds for fetched data; they only
/// need to be strictly increasing. Positivity is checked separately by
/// [`PriceMatrix::validate_prices`] so that malformed histories can still be
/// represented and rejected by the stage that consumes them.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceMatrix {
    symbols: Vec<String>,
    periods: Vec<i64>,
    prices: DMatrix<f64>,
}

impl PriceMatrix {
    pub fn new(symbols: Vec<String>, periods: Vec<i64>, prices: DMatrix<f64>) -> Result<Self> {
        if symbols.is_empty() {
            return Err(PortfolioError::data("price matrix has no symbols"));
        }
        if prices.ncols() != symbols.len() || prices.nrows() != periods.len() {
            return Err(PortfolioError::data(format!(
                "price matrix is {}x{} but has {} periods and {} symbols",
                prices.nrows(),
                prices.ncols(),
                periods.len(),
                symbols.len()
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = symbols.iter().find(|s| !seen.insert(s.as_str())) {
            return Err(PortfolioError::data(format!("symbol {} appears twice", dup)));
        }
        if periods.windows(2).any(|w| w[1] <= w[0]) {
            return Err(PortfolioError::data("periods must be strictly increasing"));
        }
        Ok(Self {
            symbols,
            periods,
            prices,
        })
    }

    /// Builds a matrix from per-symbol series of equal length, indexed by day.
    #[cfg(test)]
    pub(crate) fn from_columns(columns: &[(&str, &[f64])]) -> Result<Self> {
        let rows = columns.first().map(|(_, c)| c.len()).unwrap_or(0);
        if let Some((sym, col)) = columns.iter().find(|(_, c)| c.len() != rows) {
            return Err(PortfolioError::data(format!(
                "{} has {} prices, expected {}",
                sym,
                col.len(),
                rows
            )));
        }
        let symbols = columns.iter().map(|(s, _)| s.to_string()).collect();
        let periods = (0..rows as i64).map(|d| d * 86_400_000).collect();
        let prices = DMatrix::from_fn(rows, columns.len(), |r, c| columns[c].1[r]);
        Self::new(symbols, periods, prices)
    }

    /// Rejects physically impossible prices (zero, negative, NaN, infinite).
    pub fn validate_prices(&self) -> Result<()> {
        for (c, sym) in self.symbols.iter().enumerate() {
            if let Some(r) = (0..self.prices.nrows()).find(|&r| {
                let p = self.prices[(r, c)];
                !p.is_finite() || p <= 0.0
            }) {
                return Err(PortfolioError::data(format!(
                    "{} has invalid price {} at row {}",
                    sym,
                    self.prices[(r, c)],
                    r
                )));
            }
        }
        Ok(())
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn n_assets(&self) -> usize {
        self.symbols.len()
    }

    pub fn n_periods(&self) -> usize {
        self.periods.len()
    }

    pub fn column(&self, symbol: &str) -> Option<Vec<f64>> {
        let c = self.symbols.iter().position(|s| s == symbol)?;
        Some(self.prices.column(c).iter().copied().collect())
    }

    /// Equal-weighted average price per period, used as a stand-in benchmark.
    pub fn row_mean(&self) -> Vec<f64> {
        let n = self.n_assets() as f64;
        self.prices.row_iter().map(|row| row.sum() / n).collect()
    }

    /// Simple periodic returns, (periods - 1) x assets.
    pub fn returns(&self) -> DMatrix<f64> {
        let rows = self.n_periods().saturating_sub(1);
        DMatrix::from_fn(rows, self.n_assets(), |r, c| {
            self.prices[(r + 1, c)] / self.prices[(r, c)] - 1.0
        })
    }

    /// Splits one symbol out of the matrix, returning the rest and its series.
    pub fn take_column(&self, symbol: &str) -> Result<(PriceMatrix, Vec<f64>)> {
        let c = self
            .symbols
            .iter()
            .position(|s| s == symbol)
            .ok_or_else(|| PortfolioError::data(format!("{} is not in the price matrix", symbol)))?;
        let series = self.prices.column(c).iter().copied().collect();
        let symbols = self
            .symbols
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != c)
            .map(|(_, s)| s.clone())
            .collect();
        let rest = PriceMatrix::new(symbols, self.periods.clone(), self.prices.clone().remove_column(c))?;
        Ok((rest, series))
    }

    pub fn time_span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = DateTime::from_timestamp_millis(*self.periods.first()?)?;
        let last = DateTime::from_timestamp_millis(*self.periods.last()?)?;
        Some((first, last))
    }

    /// Deterministic correlated random walks for offline runs and tests.
    ///
    /// Every asset loads on a shared market factor so the series co-move the
    /// way crypto majors do; drift and idiosyncratic volatility vary by column.
    pub fn new_mock(symbols: &[String], periods: usize, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = symbols.len();
        let mut prices: DMatrix<f64> = DMatrix::zeros(periods, n);
        let mut current: Vec<f64> = (0..n).map(|i| 100.0 * (1.0 + i as f64)).collect();

        for r in 0..periods {
            let market: f64 = rng.sample(StandardNormal);
            for (c, price) in current.iter_mut().enumerate() {
                if r > 0 {
                    let drift = 0.0004 + 0.0002 * c as f64;
                    let beta = 0.8 + 0.1 * c as f64;
                    let idio: f64 = rng.sample(StandardNormal);
                    let ret = drift + 0.02 * beta * market + 0.015 * idio;
                    *price *= ret.exp();
                }
                prices[(r, c)] = *price;
            }
        }

        let start = Utc::now() - Duration::days(periods as i64);
        let start_ms = start.timestamp_millis() - start.timestamp_millis().rem_euclid(86_400_000);
        Self::new(
            symbols.to_vec(),
            (0..periods as i64).map(|d| start_ms + d * 86_400_000).collect(),
            prices,
        )
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Binance klines loader
// ──────────────────────────────────────────────────────────────────────────────

/// Candle width requested from the exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interval {
    Hour1,
    Hour4,
    Day1,
    Week1,
}

impl Interval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour1 => "1h",
            Self::Hour4 => "4h",
            Self::Day1 => "1d",
            Self::Week1 => "1w",
        }
    }

    /// Annualization factor for returns sampled at this interval.
    pub fn periods_per_year(self) -> f64 {
        match self {
            Self::Hour1 => 252.0 * 24.0,
            Self::Hour4 => 252.0 * 6.0,
            Self::Day1 => 252.0,
            Self::Week1 => 52.0,
        }
    }
}

impl FromStr for Interval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1h" => Ok(Self::Hour1),
            "4h" => Ok(Self::Hour4),
            "1d" => Ok(Self::Day1),
            "1w" => Ok(Self::Week1),
            other => Err(anyhow!("Unsupported interval '{}'. Allowed: 1h | 4h | 1d | 1w", other)),
        }
    }
}

/// `BTC/USDT` -> `BTCUSDT`.
pub fn exchange_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

/// Extracts (open time ms, close) pairs from a Binance klines payload.
pub fn parse_klines(symbol: &str, payload: &Value) -> anyhow::Result<Vec<(i64, f64)>> {
    if let Some(msg) = payload.get("msg").and_then(Value::as_str) {
        return Err(anyhow!("exchange rejected {}: {}", symbol, msg));
    }
    let rows = payload
        .as_array()
        .ok_or_else(|| anyhow!("unexpected klines payload for {}", symbol))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let open_time = row
            .get(0)
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("kline for {} has no open time", symbol))?;
        let close = match row.get(4) {
            Some(Value::String(s)) => s
                .parse::<f64>()
                .with_context(|| format!("close '{}' for {} is not a number", s, symbol))?,
            Some(v) => v
                .as_f64()
                .ok_or_else(|| anyhow!("close for {} is not a number", symbol))?,
            None => return Err(anyhow!("kline for {} has no close", symbol)),
        };
        if !close.is_finite() || close <= 0.0 {
            return Err(anyhow!("{} reported non-positive close {} at {}", symbol, close, open_time));
        }
        out.push((open_time, close));
    }
    out.sort_by_key(|(t, _)| *t);
    out.dedup_by_key(|(t, _)| *t);
    Ok(out)
}

/// Inner-joins per-symbol series on their timestamps so the matrix has no gaps.
pub fn align_series(series: &[(String, Vec<(i64, f64)>)]) -> Result<PriceMatrix> {
    let mut common: Option<BTreeSet<i64>> = None;
    for (_, points) in series {
        let stamps: BTreeSet<i64> = points.iter().map(|(t, _)| *t).collect();
        common = Some(match common {
            Some(acc) => acc.intersection(&stamps).copied().collect(),
            None => stamps,
        });
    }
    let periods: Vec<i64> = common.unwrap_or_default().into_iter().collect();

    let mut prices: DMatrix<f64> = DMatrix::zeros(periods.len(), series.len());
    for (c, (symbol, points)) in series.iter().enumerate() {
        let dropped = points.len().saturating_sub(periods.len());
        if dropped > 0 {
            warn!("{}: dropped {} periods not shared by every symbol", symbol, dropped);
        }
        for (t, close) in points {
            if let Ok(r) = periods.binary_search(t) {
                prices[(r, c)] = *close;
            }
        }
    }

    let symbols = series.iter().map(|(s, _)| s.clone()).collect();
    let matrix = PriceMatrix::new(symbols, periods, prices)?;
    matrix.validate_prices()?;
    Ok(matrix)
}

async fn retry_sleep(attempt: usize) {
    let millis = (250_u64 * attempt as u64).min(1500);
    tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
}

async fn fetch_klines(
    client: &reqwest::Client,
    cfg: &LoaderConfig,
    symbol: &str,
    interval: Interval,
    limit: usize,
) -> anyhow::Result<Vec<(i64, f64)>> {
    let url = format!(
        "{}/api/v3/klines?symbol={}&interval={}&limit={}",
        cfg.base_url,
        exchange_symbol(symbol),
        interval.as_str(),
        limit.clamp(1, 1000)
    );

    let attempts = cfg.retry_attempts.max(1);
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 1..=attempts {
        match client
            .get(&url)
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs))
            .send()
            .await
        {
            Ok(resp) => match resp.json::<Value>().await {
                Ok(payload) => return parse_klines(symbol, &payload),
                Err(err) => last_err = Some(err.into()),
            },
            Err(err) => last_err = Some(err.into()),
        }

        if attempt < attempts {
            warn!("Klines fetch retry for {} ({}/{})", symbol, attempt, attempts);
            retry_sleep(attempt).await;
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("klines fetch failed for {}", symbol)))
}

/// Fetches closing prices for every symbol and aligns them into one matrix.
///
/// Symbols are fetched one at a time with a pause between requests to stay
/// under the exchange rate limit.
pub async fn fetch_price_matrix(
    symbols: &[String],
    interval: Interval,
    limit: usize,
    cfg: &LoaderConfig,
) -> anyhow::Result<PriceMatrix> {
    if symbols.is_empty() {
        return Err(anyhow!("no symbols requested"));
    }
    let client = reqwest::Client::new();
    let mut series: Vec<(String, Vec<(i64, f64)>)> = Vec::with_capacity(symbols.len());

    for (idx, symbol) in symbols.iter().enumerate() {
        if series.iter().any(|(s, _)| s == symbol) {
            continue;
        }
        info!("Fetching {} ({} x {})...", symbol, limit, interval.as_str());
        let points = fetch_klines(&client, cfg, symbol, interval, limit)
            .await
            .with_context(|| format!("price fetch failed for {}", symbol))?;
        debug!("{}: {} candles", symbol, points.len());
        series.push((symbol.clone(), points));

        if idx + 1 < symbols.len() && cfg.fetch_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(cfg.fetch_delay_ms)).await;
        }
    }

    Ok(align_series(&series)?)
}
