use crate::allocator::{self, Allocation};
use crate::black_litterman::{self, OmegaConstruction};
use crate::config::{
    AnalysisConfig, LoaderConfig, BENCHMARK_SYMBOL, DEFAULT_MARKET_CAPS, DEFAULT_VIEWS,
    DEFAULT_VIEW_CONFIDENCES,
};
use crate::data::{self, Interval, PriceMatrix};
use crate::equilibrium;
use crate::error::{PortfolioError, Result};
use crate::estimator;
use crate::model::{CovarianceMatrix, MarketCaps, PerformanceTriple, ReturnVector, ViewSet};
use crate::sampler::{self, FrontierPoint};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────────────────────────────────────

/// Seed for synthetic prices in `--demo` runs when none is given.
pub const DEMO_SEED: u64 = 42;

/// Width of the console report box, excluding borders.
const REPORT_WIDTH: usize = 64;

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// Investor inputs for one analysis run.
#[derive(Clone, Debug, Default)]
pub struct AnalysisInputs {
    pub market_caps: MarketCaps,
    pub views: ViewSet,
    /// One per view, matched by position.
    pub confidences: Option<Vec<f64>>,
    /// Benchmark price series aligned with the price matrix rows. The
    /// equal-weighted row mean is used when absent.
    pub benchmark: Option<Vec<f64>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    Historical,
    Equilibrium,
    Blended,
}

impl StrategyKind {
    pub fn label(self) -> &'static str {
        match self {
            StrategyKind::Historical => "Historical",
            StrategyKind::Equilibrium => "Equilibrium",
            StrategyKind::Blended => "Blended",
        }
    }
}

/// Estimates a strategy allocated on, and the allocation itself.
#[derive(Clone, Debug, PartialEq)]
pub struct StrategyResult {
    pub expected_return: ReturnVector,
    pub covariance: CovarianceMatrix,
    pub allocation: Allocation,
}

pub type StrategyOutcome = std::result::Result<StrategyResult, PortfolioError>;

/// Everything one analysis run produced. Each strategy slot fails on its own.
#[derive(Clone, Debug)]
pub struct AnalysisReport {
    pub symbols: Vec<String>,
    pub periods: usize,
    pub span: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Historical estimates every strategy starts from.
    pub expected_return: ReturnVector,
    pub covariance: CovarianceMatrix,
    pub risk_free_rate: f64,
    pub risk_aversion: Option<f64>,
    pub omega: Option<OmegaConstruction>,
    pub views: ViewSet,
    pub confidences: Option<Vec<f64>>,
    pub historical: StrategyOutcome,
    pub equilibrium: StrategyOutcome,
    pub blended: StrategyOutcome,
    /// Lowest-volatility long-only portfolio, for reference against the cloud.
    pub min_volatility: Option<Allocation>,
    pub frontier: Vec<FrontierPoint>,
}

impl AnalysisReport {
    pub fn strategies(&self) -> [(StrategyKind, &StrategyOutcome); 3] {
        [
            (StrategyKind::Historical, &self.historical),
            (StrategyKind::Equilibrium, &self.equilibrium),
            (StrategyKind::Blended, &self.blended),
        ]
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Core: Three-Strategy Analysis
// ──────────────────────────────────────────────────────────────────────────────

/// Runs every strategy over one price history.
///
///   1. Estimates annual expected returns and a shrunk covariance
///   2. Historical: max-Sharpe on the estimates
///   3. Equilibrium: market-cap weights under the implied prior
///   4. Blended: max-Sharpe on the Black-Litterman posterior
///   5. Samples a random-portfolio cloud from the historical estimates
///
/// Only a failed estimation fails the run; strategy failures are kept in
/// their slot of the report.
pub fn run_analysis(prices: &PriceMatrix, inputs: &AnalysisInputs, cfg: &AnalysisConfig) -> Result<AnalysisReport> {
    cfg.validate()?;
    let (mu, cov) = estimator::estimate(prices, cfg)?;

    let historical = allocator::optimize(&mu, &cov, cfg.risk_free_rate, cfg.clean_cutoff).map(|allocation| {
        StrategyResult {
            expected_return: mu.clone(),
            covariance: cov.clone(),
            allocation,
        }
    });

    let benchmark = match &inputs.benchmark {
        Some(series) if series.len() != prices.n_periods() => Err(PortfolioError::data(format!(
            "benchmark has {} prices but the history has {} periods",
            series.len(),
            prices.n_periods()
        ))),
        Some(series) => Ok(series.clone()),
        None => Ok(prices.row_mean()),
    };
    let prior = benchmark.and_then(|b| equilibrium::implied_prior(&b, &inputs.market_caps, &cov, cfg));
    let risk_aversion = prior.as_ref().ok().map(|(_, delta)| *delta);

    let equilibrium = prior.clone().and_then(|(pi, _)| {
        let weights = equilibrium::market_weights(&inputs.market_caps, cov.symbols())?;
        let performance =
            PerformanceTriple::evaluate(&weights.to_vector(), pi.values(), cov.matrix(), cfg.risk_free_rate);
        Ok(StrategyResult {
            expected_return: pi,
            covariance: cov.clone(),
            allocation: Allocation { weights, performance },
        })
    });

    let mut omega = None;
    let blended = prior.and_then(|(pi, _)| {
        let posterior = black_litterman::blend(&pi, &cov, &inputs.views, inputs.confidences.as_deref(), cfg.tau)?;
        omega = Some(posterior.omega.clone());
        if posterior.omega == OmegaConstruction::NotNeeded {
            return equilibrium.clone();
        }
        let allocation =
            allocator::optimize(&posterior.returns, &posterior.covariance, cfg.risk_free_rate, cfg.clean_cutoff)?;
        Ok(StrategyResult {
            expected_return: posterior.returns,
            covariance: posterior.covariance,
            allocation,
        })
    });

    let min_volatility = match allocator::min_volatility(&cov, &mu, cfg.risk_free_rate, cfg.clean_cutoff) {
        Ok(alloc) => Some(alloc),
        Err(e) => {
            warn!("Minimum-volatility reference portfolio unavailable: {}", e);
            None
        }
    };
    let frontier = sampler::sample(cfg.frontier_samples, &mu, &cov, cfg.seed)?;

    let report = AnalysisReport {
        symbols: prices.symbols().to_vec(),
        periods: prices.n_periods(),
        span: prices.time_span(),
        expected_return: mu,
        covariance: cov,
        risk_free_rate: cfg.risk_free_rate,
        risk_aversion,
        omega,
        views: inputs.views.clone(),
        confidences: inputs.confidences.clone(),
        historical,
        equilibrium,
        blended,
        min_volatility,
        frontier,
    };
    for (kind, outcome) in report.strategies() {
        if let Err(e) = outcome {
            warn!("{} strategy failed: {}", kind.label(), e);
        }
    }
    Ok(report)
}

// ──────────────────────────────────────────────────────────────────────────────
// Inputs: Defaults for the Command Line
// ──────────────────────────────────────────────────────────────────────────────

/// The explicit benchmark, else the default market proxy when it is part of
/// the universe. `None` means the row mean is used.
pub fn resolve_benchmark(explicit: Option<String>, symbols: &[String]) -> Option<String> {
    explicit.or_else(|| {
        symbols
            .iter()
            .any(|s| s == BENCHMARK_SYMBOL)
            .then(|| BENCHMARK_SYMBOL.to_string())
    })
}

/// Built-in capitalizations, or equal caps when the universe leaves the
/// built-in table.
pub fn default_market_caps(symbols: &[String]) -> MarketCaps {
    let table = MarketCaps::from_pairs(DEFAULT_MARKET_CAPS);
    let missing: Vec<&String> = symbols.iter().filter(|s| !table.contains(s)).collect();
    if missing.is_empty() {
        return table;
    }
    warn!(
        "No built-in market cap for {:?}; using equal caps. Pass --caps to set them.",
        missing
    );
    MarketCaps::new(symbols.iter().map(|s| (s.clone(), 1.0)).collect::<HashMap<_, _>>())
}

/// Built-in views and their confidences, restricted to the universe.
pub fn default_views(symbols: &[String]) -> Result<(ViewSet, Vec<f64>)> {
    let (views, confidences): (Vec<(String, f64)>, Vec<f64>) = DEFAULT_VIEWS
        .iter()
        .zip(DEFAULT_VIEW_CONFIDENCES)
        .filter(|((sym, _), _)| symbols.iter().any(|s| s == sym))
        .map(|((sym, q), c)| ((sym.to_string(), *q), *c))
        .unzip();
    Ok((ViewSet::new(views)?, confidences))
}

fn split_benchmark(
    prices: PriceMatrix,
    universe: &[String],
    benchmark: Option<&str>,
) -> Result<(PriceMatrix, Option<Vec<f64>>)> {
    match benchmark {
        None => Ok((prices, None)),
        Some(b) if universe.iter().any(|s| s == b) => {
            let series = prices
                .column(b)
                .ok_or_else(|| PortfolioError::data(format!("no prices for benchmark {}", b)))?;
            Ok((prices, Some(series)))
        }
        Some(b) => {
            let (rest, series) = prices.take_column(b)?;
            Ok((rest, Some(series)))
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Top-Level Command: Run Portfolio Optimization
// ──────────────────────────────────────────────────────────────────────────────

/// What to fetch and how to present it.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub symbols: Vec<String>,
    pub benchmark: Option<String>,
    pub market_caps: MarketCaps,
    pub views: ViewSet,
    pub confidences: Option<Vec<f64>>,
    pub interval: Interval,
    pub limit: usize,
    /// Synthetic prices instead of the exchange.
    pub demo: bool,
    pub json: bool,
}

/// Full pipeline: fetch prices → analyse → print report.
pub async fn run_portfolio_optimization(
    opts: RunOptions,
    cfg: &AnalysisConfig,
    loader: &LoaderConfig,
) -> anyhow::Result<AnalysisReport> {
    info!(
        "=== Crypto Allocator ===\n  Assets: {:?}\n  Interval: {} x {}\n  Views: {}\n  τ: {}",
        opts.symbols,
        opts.limit,
        opts.interval.as_str(),
        opts.views.len(),
        cfg.tau
    );

    let mut request = opts.symbols.clone();
    if let Some(b) = &opts.benchmark {
        if !request.contains(b) {
            request.push(b.clone());
        }
    }

    // Step 1: Prices
    let fetched = if opts.demo {
        info!("Demo mode: generating {} synthetic periods", opts.limit);
        PriceMatrix::new_mock(&request, opts.limit, cfg.seed.unwrap_or(DEMO_SEED))?
    } else {
        data::fetch_price_matrix(&request, opts.interval, opts.limit, loader).await?
    };
    let (prices, benchmark) = split_benchmark(fetched, &opts.symbols, opts.benchmark.as_deref())?;

    // Step 2: Analyse
    let inputs = AnalysisInputs {
        market_caps: opts.market_caps,
        views: opts.views,
        confidences: opts.confidences,
        benchmark,
    };
    let report = run_analysis(&prices, &inputs, cfg)?;

    // Step 3: Print results
    if opts.json {
        println!("{}", report_json(&report)?);
    } else {
        print_report(&report);
    }

    Ok(report)
}

// ──────────────────────────────────────────────────────────────────────────────
// Presentation
// ──────────────────────────────────────────────────────────────────────────────

fn border(left: char, right: char) {
    println!("{}{}{}", left, "═".repeat(REPORT_WIDTH + 2), right);
}

fn line(text: &str) {
    println!("║ {:<width$} ║", text, width = REPORT_WIDTH);
}

fn pct(v: f64) -> String {
    format!("{:+.2}%", v * 100.0)
}

/// Pretty-prints the report to stdout.
pub fn print_report(report: &AnalysisReport) {
    println!();
    border('╔', '╗');
    line("             Crypto Allocator: Black-Litterman Report");
    border('╠', '╣');
    line(&format!("Assets: {}   Periods: {}", report.symbols.len(), report.periods));
    if let Some((start, end)) = report.span {
        line(&format!("History: {} → {}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d")));
    }
    if let Some(delta) = report.risk_aversion {
        line(&format!("Market-implied risk aversion δ: {:.3}", delta));
    }
    if let Some(omega) = &report.omega {
        line(&format!("View uncertainty: {}", omega.describe()));
        if omega.is_fallback() {
            line("⚠ Confidences did not match the views and were not used");
        }
    }

    border('╠', '╣');
    line("Asset           E[Ann.Ret]    Ann.Vol");
    border('╠', '╣');
    for (sym, mu) in report.expected_return.iter() {
        let vol = report.covariance.get(sym, sym).unwrap_or(0.0).sqrt();
        line(&format!("{:<14} {:>11}  {:>8.2}%", sym, pct(mu), vol * 100.0));
    }

    border('╠', '╣');
    line("Strategy        E[Ann.Ret]    Ann.Vol    Sharpe");
    border('╠', '╣');
    for (kind, outcome) in report.strategies() {
        match outcome {
            Ok(r) => {
                let p = &r.allocation.performance;
                line(&format!(
                    "{:<14} {:>10}  {:>9.2}%  {:>8.3}",
                    kind.label(),
                    pct(p.expected_return),
                    p.volatility * 100.0,
                    p.sharpe_ratio
                ));
            }
            Err(e) => line(&format!("{:<14} FAILED ({})", kind.label(), e.kind())),
        }
    }

    border('╠', '╣');
    line("Symbol          Historical   Equilibrium     Blended");
    border('╠', '╣');
    for sym in &report.symbols {
        let cells: Vec<String> = report
            .strategies()
            .iter()
            .map(|(_, outcome)| match outcome {
                Ok(r) => r
                    .allocation
                    .weights
                    .get(sym)
                    .map(|w| format!("{:.2}%", w * 100.0))
                    .unwrap_or_else(|| "-".to_string()),
                Err(_) => "-".to_string(),
            })
            .collect();
        line(&format!("{:<14} {:>11} {:>13} {:>11}", sym, cells[0], cells[1], cells[2]));
    }
    let totals: Vec<String> = report
        .strategies()
        .iter()
        .map(|(_, outcome)| match outcome {
            Ok(r) => format!("{:.2}%", r.allocation.weights.sum() * 100.0),
            Err(_) => "-".to_string(),
        })
        .collect();
    line(&format!("{:<14} {:>11} {:>13} {:>11}", "Total Invested", totals[0], totals[1], totals[2]));

    if !report.views.is_empty() {
        border('╠', '╣');
        line("Views Injected        Prior        View   Posterior  Conf.");
        for (i, (sym, q)) in report.views.iter().enumerate() {
            let prior = report.equilibrium.as_ref().ok().and_then(|r| r.expected_return.get(sym));
            let post = report.blended.as_ref().ok().and_then(|r| r.expected_return.get(sym));
            let conf = report
                .confidences
                .as_ref()
                .filter(|c| c.len() == report.views.len())
                .map(|c| format!("{:.0}%", c[i] * 100.0))
                .unwrap_or_else(|| "-".to_string());
            line(&format!(
                "  {:<14} {:>10} {:>10} {:>11} {:>6}",
                sym,
                prior.map(pct).unwrap_or_else(|| "-".to_string()),
                pct(q),
                post.map(pct).unwrap_or_else(|| "-".to_string()),
                conf
            ));
        }
    }

    if !report.frontier.is_empty() {
        border('╠', '╣');
        let vol_min = report.frontier.iter().map(|p| p.volatility).fold(f64::INFINITY, f64::min);
        let vol_max = report.frontier.iter().map(|p| p.volatility).fold(f64::NEG_INFINITY, f64::max);
        let ret_min = report.frontier.iter().map(|p| p.expected_return).fold(f64::INFINITY, f64::min);
        let ret_max = report.frontier.iter().map(|p| p.expected_return).fold(f64::NEG_INFINITY, f64::max);
        let best_sampled = report
            .frontier
            .iter()
            .filter(|p| p.volatility > 1e-12)
            .map(|p| (p.expected_return - report.risk_free_rate) / p.volatility)
            .fold(f64::NEG_INFINITY, f64::max);
        line(&format!("Random portfolios: {}", report.frontier.len()));
        line(&format!(
            "  Vol {:.2}%..{:.2}%   Return {}..{}",
            vol_min * 100.0,
            vol_max * 100.0,
            pct(ret_min),
            pct(ret_max)
        ));
        if let Ok(h) = &report.historical {
            line(&format!(
                "  Best sampled Sharpe {:.3} vs optimized {:.3}",
                best_sampled, h.allocation.performance.sharpe_ratio
            ));
        }
        if let Some(mv) = &report.min_volatility {
            line(&format!(
                "  Minimum-volatility portfolio: {:.2}% vol, {} return",
                mv.performance.volatility * 100.0,
                pct(mv.performance.expected_return)
            ));
        }
    }

    let failures: Vec<(StrategyKind, &PortfolioError)> = report
        .strategies()
        .into_iter()
        .filter_map(|(kind, outcome)| outcome.as_ref().err().map(|e| (kind, e)))
        .collect();
    if !failures.is_empty() {
        border('╠', '╣');
        for (kind, e) in failures {
            line(&format!("{}: {}", kind.label(), e));
        }
    }

    border('╚', '╝');
    println!();
    println!("⚠  Educational use only. Not financial advice.");
}

#[derive(Serialize)]
struct ReportJson<'a> {
    symbols: &'a [String],
    periods: usize,
    start: Option<String>,
    end: Option<String>,
    risk_free_rate: f64,
    risk_aversion: Option<f64>,
    view_uncertainty: Option<String>,
    views: Vec<ViewJson<'a>>,
    strategies: Vec<StrategyJson<'a>>,
    min_volatility: Option<Vec<AssetJson<'a>>>,
    frontier: &'a [FrontierPoint],
}

#[derive(Serialize)]
struct ViewJson<'a> {
    symbol: &'a str,
    expected_return: f64,
    confidence: Option<f64>,
}

#[derive(Serialize)]
struct AssetJson<'a> {
    symbol: &'a str,
    value: f64,
}

fn asset_values<'a>(pairs: impl Iterator<Item = (&'a str, f64)>) -> Vec<AssetJson<'a>> {
    pairs.map(|(symbol, value)| AssetJson { symbol, value }).collect()
}

#[derive(Serialize)]
struct StrategyJson<'a> {
    strategy: &'static str,
    expected_returns: Option<Vec<AssetJson<'a>>>,
    weights: Option<Vec<AssetJson<'a>>>,
    performance: Option<PerformanceTriple>,
    error_kind: Option<&'static str>,
    error: Option<String>,
}

/// Machine-readable rendering of the report.
pub fn report_json(report: &AnalysisReport) -> anyhow::Result<String> {
    let confidences = report
        .confidences
        .as_ref()
        .filter(|c| c.len() == report.views.len());
    let views = report
        .views
        .iter()
        .enumerate()
        .map(|(i, (symbol, expected_return))| ViewJson {
            symbol,
            expected_return,
            confidence: confidences.map(|c| c[i]),
        })
        .collect();
    let strategies = report
        .strategies()
        .into_iter()
        .map(|(kind, outcome)| match outcome {
            Ok(r) => StrategyJson {
                strategy: kind.label(),
                expected_returns: Some(asset_values(r.expected_return.iter())),
                weights: Some(asset_values(r.allocation.weights.iter())),
                performance: Some(r.allocation.performance),
                error_kind: None,
                error: None,
            },
            Err(e) => StrategyJson {
                strategy: kind.label(),
                expected_returns: None,
                weights: None,
                performance: None,
                error_kind: Some(e.kind()),
                error: Some(e.to_string()),
            },
        })
        .collect();

    let payload = ReportJson {
        symbols: &report.symbols,
        periods: report.periods,
        start: report.span.map(|(s, _)| s.to_rfc3339()),
        end: report.span.map(|(_, e)| e.to_rfc3339()),
        risk_free_rate: report.risk_free_rate,
        risk_aversion: report.risk_aversion,
        view_uncertainty: report.omega.as_ref().map(OmegaConstruction::describe),
        views,
        strategies,
        min_volatility: report.min_volatility.as_ref().map(|mv| asset_values(mv.weights.iter())),
        frontier: &report.frontier,
    };
    Ok(serde_json::to_string_pretty(&payload)?)
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
