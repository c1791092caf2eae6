mod allocation;
mod backtest;
mod config;
mod data;
mod error;
mod estimator;
mod holdings;
mod optimizer;
mod portfolio;

use anyhow::{Context, Result, bail};
use chrono::{Datelike, Utc};
use clap::Parser;
use config::EngineConfig;
use data::{DataProviderMode, PriceHistoryProvider, build_provider};
use error::OptimizeFailure;
use holdings::{HoldingsStore, InMemoryHoldingsStore, JsonHoldingsStore, parse_holding_arg};
use portfolio::{PortfolioEngine, WeightBasis, print_report};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Optifolio: max-Sharpe rebalancing proposals with whole-share allocation and backtest",
    after_help = "EXAMPLES:
    # Optimize a user's holdings from a JSON file, history since 2019
    cargo run --release -- --user alice --holdings holdings.json --start-year 2019

    # Inline holdings, offline synthetic prices, JSON output
    cargo run --release -- --holding AAPL:10:1890 --holding MSFT:5:2100 --provider synthetic --json

    # Value current weights at the latest close and export the report
    cargo run --release -- --user alice --holdings holdings.json --weight-basis latest-close --export report.json"
)]
struct Args {
    /// User whose holdings are optimized
    #[arg(long, default_value = "default")]
    user: String,

    /// First year of price history (history starts January 1st). Default: five years ago.
    #[arg(long)]
    start_year: Option<i32>,

    /// JSON holdings file: { "<user>": [ {symbol, shares, total_value} ] }
    #[arg(long, conflicts_with = "holding")]
    holdings: Option<PathBuf>,

    /// Inline holding as SYMBOL:SHARES:VALUE (repeatable)
    #[arg(long = "holding")]
    holding: Vec<String>,

    /// Annual risk-free rate, e.g. 0.04 (overrides OPTIFOLIO_RISK_FREE_RATE)
    #[arg(long)]
    risk_free_rate: Option<f64>,

    /// Price source: yahoo | synthetic (overrides OPTIFOLIO_DATA_PROVIDER)
    #[arg(long)]
    provider: Option<String>,

    /// Current-weight valuation: snapshot | latest-close (overrides OPTIFOLIO_WEIGHT_BASIS)
    #[arg(long)]
    weight_basis: Option<String>,

    /// Print the full report as JSON instead of the table
    #[arg(long)]
    json: bool,

    /// Also write the report as pretty JSON to this file
    #[arg(long)]
    export: Option<PathBuf>,
}

fn resolve_start_year(requested: Option<i32>) -> Result<i32> {
    let current = Utc::now().year();
    let year = requested.unwrap_or(current - 5);
    if !(config::EARLIEST_START_YEAR..=current).contains(&year) {
        bail!(
            "--start-year must be between {} and {}, got {}",
            config::EARLIEST_START_YEAR,
            current,
            year
        );
    }
    Ok(year)
}

fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut cfg = EngineConfig::from_env();
    if let Some(rate) = args.risk_free_rate {
        if !rate.is_finite() || !(-1.0..=1.0).contains(&rate) {
            bail!("--risk-free-rate must be an annual rate between -1 and 1, got {}", rate);
        }
        cfg.risk_free_rate = rate;
    }
    if let Some(ref provider) = args.provider {
        cfg.data_provider = DataProviderMode::parse_or_default(provider);
    }
    if let Some(ref basis) = args.weight_basis {
        cfg.weight_basis = WeightBasis::parse_or_default(basis);
    }
    Ok(cfg)
}

fn build_holdings_store(args: &Args) -> Result<Arc<dyn HoldingsStore>> {
    if let Some(ref path) = args.holdings {
        return Ok(Arc::new(JsonHoldingsStore::new(path.clone())));
    }
    if args.holding.is_empty() {
        bail!("No holdings given. Use --holdings <file> or --holding SYMBOL:SHARES:VALUE");
    }
    let holdings = args
        .holding
        .iter()
        .map(|raw| parse_holding_arg(raw))
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(InMemoryHoldingsStore::new().with_user(&args.user, holdings)))
}

async fn run(args: Args) -> Result<()> {
    let start_year = resolve_start_year(args.start_year)?;
    let cfg = build_config(&args)?;
    let store = build_holdings_store(&args)?;
    let provider: Arc<dyn PriceHistoryProvider> = Arc::from(build_provider(cfg.data_provider, &cfg.cache_dir));

    info!(
        "Config: provider={}, weight basis={}, timeout={:?}, concurrency={}",
        cfg.data_provider.as_str(),
        cfg.weight_basis.as_str(),
        cfg.fetch_timeout,
        cfg.fetch_concurrency
    );

    let engine = PortfolioEngine::new(store, provider, cfg);
    let report = match engine.optimize(&args.user, start_year).await {
        Ok(report) => report,
        Err(failure) => {
            error!("Optimization failed ({}): {}", failure.kind(), failure);
            return Err(failure.into());
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if let Some(ref path) = args.export {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Report written to {}", path.display());
    }
    Ok(())
}

/// Exit status for a failed run: 1 when the engine rejected the request,
/// 2 for setup and I/O errors.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<OptimizeFailure>() {
        Some(_) => 1,
        None => 2,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("optifolio=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    config::init_cpu_parallelism();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<OptimizeFailure>() {
                Some(failure) => eprintln!("{}", failure.user_message()),
                None => error!("{:#}", e),
            }
            ExitCode::from(exit_code(&e))
        }
    }
}
