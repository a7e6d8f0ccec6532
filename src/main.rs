mod allocator;
mod black_litterman;
mod config;
mod data;
mod equilibrium;
mod error;
mod estimator;
mod model;
mod portfolio;
mod sampler;

use anyhow::{bail, Context};
use clap::Parser;
use config::{
    normalize_symbol, parse_assignments, parse_number_list, AnalysisConfig, CovarianceMethod,
    LoaderConfig, ReturnMethod, CLEAN_WEIGHT_CUTOFF, DEFAULT_FRONTIER_SAMPLES, DEFAULT_HISTORY_LIMIT,
    DEFAULT_RISK_FREE_RATE, DEFAULT_SYMBOLS, DEFAULT_TAU,
};
use data::Interval;
use model::{MarketCaps, ViewSet};
use portfolio::RunOptions;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Crypto Allocator: Markowitz, market-equilibrium and Black-Litterman allocations for crypto assets",
    after_help = "EXAMPLES:
    # Default universe, built-in caps and views, live Binance prices
    cargo run --release

    # Offline run on synthetic prices
    cargo run --release -- --demo --seed 7

    # Custom universe and views with per-view confidence
    cargo run --release -- --symbols BTC/USDT,ETH/USDT,SOL/USDT \\
        --caps BTC/USDT=850,ETH/USDT=280,SOL/USDT=40 \\
        --views SOL/USDT=0.35 --confidences 0.8

    # Machine-readable output
    cargo run --release -- --demo --json"
)]
struct Args {
    /// Comma-separated trading pairs (default: BTC/USDT,ETH/USDT,SOL/USDT,BNB/USDT,LINK/USDT)
    #[arg(long)]
    symbols: Option<String>,

    /// Benchmark pair for market risk aversion (default: BTC/USDT when in the universe, else the equal-weighted average)
    #[arg(long)]
    benchmark: Option<String>,

    /// Market capitalizations as SYMBOL=VALUE pairs; only relative sizes matter
    #[arg(long)]
    caps: Option<String>,

    /// Absolute annual return views as SYMBOL=RETURN pairs. Pass "" for none.
    #[arg(long)]
    views: Option<String>,

    /// Comma-separated view confidences in [0, 1], one per view
    #[arg(long)]
    confidences: Option<String>,

    /// Uncertainty scale of the equilibrium prior
    #[arg(long, default_value_t = DEFAULT_TAU)]
    tau: f64,

    /// Annual risk-free rate
    #[arg(long, default_value_t = DEFAULT_RISK_FREE_RATE)]
    risk_free_rate: f64,

    /// Candle interval: 1h, 4h, 1d or 1w
    #[arg(long, default_value = "1d")]
    interval: String,

    /// Candles per symbol
    #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    limit: usize,

    /// Periods per year used for annualization (default: derived from --interval)
    #[arg(long)]
    frequency: Option<f64>,

    /// Random portfolios drawn for the frontier cloud
    #[arg(long, default_value_t = DEFAULT_FRONTIER_SAMPLES)]
    frontier_samples: usize,

    /// Seed for the frontier cloud and demo prices
    #[arg(long)]
    seed: Option<u64>,

    /// Use compounded (geometric) instead of arithmetic mean returns
    #[arg(long)]
    compounded: bool,

    /// Shrink covariance toward constant correlation instead of a scaled identity
    #[arg(long)]
    constant_correlation: bool,

    /// Use synthetic prices instead of fetching from the exchange
    #[arg(long)]
    demo: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn build_run(args: Args) -> anyhow::Result<(RunOptions, AnalysisConfig)> {
    let symbols: Vec<String> = match &args.symbols {
        Some(raw) => raw
            .split(',')
            .map(normalize_symbol)
            .filter(|s| !s.is_empty())
            .fold(Vec::new(), |mut acc: Vec<String>, s| {
                if !acc.contains(&s) {
                    acc.push(s);
                }
                acc
            }),
        None => DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
    };
    if symbols.len() < 2 {
        bail!("Portfolio optimization requires at least 2 symbols. Example: --symbols BTC/USDT,ETH/USDT");
    }

    let benchmark = portfolio::resolve_benchmark(args.benchmark.as_deref().map(normalize_symbol), &symbols);

    let market_caps = match &args.caps {
        Some(raw) => MarketCaps::from_pairs(&parse_assignments(raw).context("invalid --caps")?),
        None => portfolio::default_market_caps(&symbols),
    };

    let confidences = args
        .confidences
        .as_deref()
        .map(parse_number_list)
        .transpose()
        .context("invalid --confidences")?;
    let (views, confidences) = match &args.views {
        Some(raw) if raw.trim().is_empty() => (ViewSet::empty(), None),
        Some(raw) => (
            ViewSet::new(parse_assignments(raw).context("invalid --views")?)?,
            confidences,
        ),
        None => {
            let (views, defaults) = portfolio::default_views(&symbols)?;
            (views, confidences.or(Some(defaults)))
        }
    };

    let interval: Interval = args.interval.parse()?;
    let cfg = AnalysisConfig {
        tau: args.tau,
        risk_free_rate: args.risk_free_rate,
        frequency: args.frequency.unwrap_or_else(|| interval.periods_per_year()),
        clean_cutoff: CLEAN_WEIGHT_CUTOFF,
        frontier_samples: args.frontier_samples,
        seed: args.seed,
        return_method: if args.compounded {
            ReturnMethod::Compounded
        } else {
            ReturnMethod::Arithmetic
        },
        covariance_method: if args.constant_correlation {
            CovarianceMethod::ConstantCorrelation
        } else {
            CovarianceMethod::LedoitWolf
        },
    };
    cfg.validate()?;

    let opts = RunOptions {
        symbols,
        benchmark,
        market_caps,
        views,
        confidences,
        interval,
        limit: args.limit,
        demo: args.demo,
        json: args.json,
    };
    Ok((opts, cfg))
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crypto_allocator=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let (opts, cfg) = match build_run(args) {
        Ok(run) => run,
        Err(e) => {
            error!("Invalid arguments: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let loader = LoaderConfig::from_env();

    match portfolio::run_portfolio_optimization(opts, &cfg, &loader).await {
        Ok(report) => {
            let ok = report.strategies().iter().filter(|(_, o)| o.is_ok()).count();
            info!("Portfolio optimization completed: {} of 3 strategies succeeded.", ok);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Portfolio optimization failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> anyhow::Result<(RunOptions, AnalysisConfig)> {
        let mut full = vec!["crypto-allocator"];
        full.extend_from_slice(argv);
        build_run(Args::parse_from(full))
    }

    #[test]
    fn test_defaults() {
        let (opts, cfg) = parse(&[]).unwrap();
        assert_eq!(opts.symbols.len(), DEFAULT_SYMBOLS.len());
        assert_eq!(opts.benchmark.as_deref(), Some("BTC/USDT"));
        assert_eq!(opts.views.len(), 2);
        assert_eq!(opts.confidences, Some(vec![0.8, 0.5]));
        assert_eq!(cfg.frequency, 252.0);
        assert_eq!(cfg.tau, DEFAULT_TAU);
    }

    #[test]
    fn test_explicit_views_without_confidences() {
        let (opts, _) = parse(&["--symbols", "btc/usdt,eth/usdt", "--views", "ETH/USDT=0.2"]).unwrap();
        assert_eq!(opts.symbols, vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()]);
        assert_eq!(opts.views.len(), 1);
        assert_eq!(opts.confidences, None);
    }

    #[test]
    fn test_repeated_symbols_are_collapsed() {
        let (opts, _) = parse(&["--symbols", "BTC/USDT,btc/usdt,ETH/USDT", "--views", ""]).unwrap();
        assert_eq!(opts.symbols, vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()]);
        assert!(parse(&["--symbols", "BTC/USDT,BTC/USDT"]).is_err());
    }

    #[test]
    fn test_interval_drives_frequency() {
        let (_, cfg) = parse(&["--interval", "1w"]).unwrap();
        assert_eq!(cfg.frequency, 52.0);
        let (_, cfg) = parse(&["--interval", "1w", "--frequency", "365"]).unwrap();
        assert_eq!(cfg.frequency, 365.0);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        assert!(parse(&["--symbols", "BTC/USDT"]).is_err());
        assert!(parse(&["--tau", "0"]).is_err());
        assert!(parse(&["--interval", "3m"]).is_err());
        assert!(parse(&["--views", "SOL/USDT"]).is_err());
    }

    #[test]
    fn test_empty_views_disable_blending() {
        let (opts, _) = parse(&["--views", "", "--confidences", "0.4"]).unwrap();
        assert!(opts.views.is_empty());
        assert_eq!(opts.confidences, None);
    }
}
