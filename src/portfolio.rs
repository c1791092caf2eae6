use crate::allocation::allocate_greedy;
use crate::backtest::{ReturnSeries, compare};
use crate::config::EngineConfig;
use crate::data::{PriceHistoryProvider, PriceTable, fetch_price_table};
use crate::error::{EngineError, EngineResult, OptimizeFailure, Stage, StageExt};
use crate::estimator::{Exclusion, estimate};
use crate::holdings::{HoldingsStore, PortfolioSnapshot};
use crate::optimizer::{PortfolioPerformance, WeightVector, optimize_max_sharpe, performance};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────────────────────────────────────

/// How the current portfolio's weights are valued for the backtest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WeightBasis {
    /// Stored holding values from the snapshot.
    Snapshot,
    /// Shares revalued at the latest close in the price table.
    LatestClose,
}

impl WeightBasis {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::LatestClose => "latest-close",
        }
    }

    pub fn parse_or_default(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "snapshot" | "stored" => Self::Snapshot,
            "latest-close" | "latest" | "close" => Self::LatestClose,
            other => {
                warn!(
                    "Unknown OPTIFOLIO_WEIGHT_BASIS={} ; defaulting to snapshot. Allowed values: snapshot | latest-close",
                    other
                );
                Self::Snapshot
            }
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// One line of the rebalancing proposal.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AllocationRow {
    pub symbol: String,
    pub current_shares: u64,
    pub current_weight: f64,
    pub target_weight: f64,
    pub allocated_shares: u64,
    /// `None` when the symbol had no price data in the window.
    pub latest_price: Option<f64>,
}

/// Everything produced by one optimization request.
#[derive(Clone, Debug, Serialize)]
pub struct OptimizationReport {
    pub user_id: String,
    pub start_date: NaiveDate,
    pub risk_free_rate: f64,
    pub weight_basis: WeightBasis,
    pub rows: Vec<AllocationRow>,
    pub total_value: f64,
    pub leftover_cash: f64,
    pub current_performance: PortfolioPerformance,
    pub optimized_performance: PortfolioPerformance,
    pub current_series: ReturnSeries,
    pub optimized_series: ReturnSeries,
    pub excluded: Vec<Exclusion>,
}

impl OptimizationReport {
    pub fn row(&self, symbol: &str) -> Option<&AllocationRow> {
        self.rows.iter().find(|r| r.symbol == symbol)
    }
}

/// Weights of the portfolio as currently held.
pub fn current_weights(
    snapshot: &PortfolioSnapshot,
    table: &PriceTable,
    basis: WeightBasis,
) -> EngineResult<WeightVector> {
    let amounts: Vec<(String, f64)> = match basis {
        WeightBasis::Snapshot => snapshot
            .holdings()
            .iter()
            .map(|h| (h.symbol.clone(), h.current_value))
            .collect(),
        WeightBasis::LatestClose => {
            let latest = table.latest_prices();
            snapshot
                .holdings()
                .iter()
                .map(|h| {
                    let price = latest.get(&h.symbol).copied().unwrap_or(0.0);
                    (h.symbol.clone(), h.shares as f64 * price)
                })
                .collect()
        }
    };
    WeightVector::from_amounts(&amounts)
}

// ──────────────────────────────────────────────────────────────────────────────
// Top-Level Command: Run Portfolio Optimization
// ──────────────────────────────────────────────────────────────────────────────

/// Runs holdings → prices → estimation → optimization → allocation → backtest
/// for one user.
pub struct PortfolioEngine {
    holdings: Arc<dyn HoldingsStore>,
    prices: Arc<dyn PriceHistoryProvider>,
    config: EngineConfig,
}

impl PortfolioEngine {
    pub fn new(
        holdings: Arc<dyn HoldingsStore>,
        prices: Arc<dyn PriceHistoryProvider>,
        config: EngineConfig,
    ) -> Self {
        Self {
            holdings,
            prices,
            config,
        }
    }

    /// Builds the rebalancing proposal for `user_id` from history starting
    /// January 1st of `start_year`.
    ///
    /// Any failure aborts the request and is tagged with the stage it came from.
    pub async fn optimize(
        &self,
        user_id: &str,
        start_year: i32,
    ) -> Result<OptimizationReport, OptimizeFailure> {
        info!(
            "=== Portfolio optimization ===\n  User: {}\n  Start year: {}\n  Provider: {}\n  Risk-free: {:.2}%",
            user_id,
            start_year,
            self.prices.id(),
            self.config.risk_free_rate * 100.0
        );

        // Step 1: Holdings
        let snapshot = self.holdings.get_snapshot(user_id).await.at(Stage::Holdings)?;
        if snapshot.is_empty() {
            return Err(OptimizeFailure::new(Stage::Holdings, EngineError::EmptyUniverse));
        }
        let symbols = snapshot.symbols();

        // Step 2: Price history
        let start_date = NaiveDate::from_ymd_opt(start_year, 1, 1)
            .ok_or_else(|| EngineError::DataUnavailable(format!("invalid start year {}", start_year)))
            .at(Stage::PriceHistory)?;
        let table = fetch_price_table(
            self.prices.as_ref(),
            &symbols,
            start_date,
            self.config.fetch_concurrency,
            self.config.fetch_timeout,
        )
        .await
        .at(Stage::PriceHistory)?;

        let mut excluded: Vec<Exclusion> = symbols
            .iter()
            .filter(|s| table.series(s).is_none())
            .map(|s| {
                let err = EngineError::InsufficientHistory {
                    symbol: s.clone(),
                    observations: 0,
                };
                warn!("{}. Excluding from optimization.", err);
                Exclusion {
                    symbol: s.clone(),
                    kind: err.kind(),
                    reason: err.to_string(),
                }
            })
            .collect();

        // Step 3: Estimates
        let estimates = estimate(&table).at(Stage::Estimation)?;
        excluded.extend(estimates.excluded.iter().cloned());

        // Step 4: Optimize
        let rf = self.config.risk_free_rate;
        let target = optimize_max_sharpe(&estimates.expected_returns, &estimates.covariance, rf)
            .and_then(|raw| raw.clean())
            .at(Stage::Optimization)?;

        // Step 5: Allocate the current portfolio value
        let latest = table.latest_prices();
        let allocation =
            allocate_greedy(&target, &latest, snapshot.total_value()).at(Stage::Allocation)?;

        // Step 6: Backtest current vs proposed weights
        let basis = self.config.weight_basis;
        let current = current_weights(&snapshot, &table, basis).at(Stage::Backtest)?;
        let (current_series, optimized_series) =
            compare(&table, &current, &target).at(Stage::Backtest)?;

        let current_performance =
            performance(&current, &estimates.expected_returns, &estimates.covariance, rf);
        let optimized_performance =
            performance(&target, &estimates.expected_returns, &estimates.covariance, rf);

        let rows = snapshot
            .holdings()
            .iter()
            .map(|h| AllocationRow {
                symbol: h.symbol.clone(),
                current_shares: h.shares,
                current_weight: current.get(&h.symbol).unwrap_or(0.0),
                target_weight: target.get(&h.symbol).unwrap_or(0.0),
                allocated_shares: allocation.shares_of(&h.symbol),
                latest_price: latest.get(&h.symbol).copied(),
            })
            .collect();

        info!(
            "Optimization complete for {}: Sharpe {:.2} -> {:.2}, {} excluded",
            user_id,
            current_performance.sharpe_ratio,
            optimized_performance.sharpe_ratio,
            excluded.len()
        );

        Ok(OptimizationReport {
            user_id: user_id.to_string(),
            start_date,
            risk_free_rate: rf,
            weight_basis: basis,
            rows,
            total_value: snapshot.total_value(),
            leftover_cash: allocation.leftover_cash,
            current_performance,
            optimized_performance,
            current_series,
            optimized_series,
            excluded,
        })
    }
}

/// Pretty-prints the report to stdout.
pub fn print_report(report: &OptimizationReport) {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║              Optifolio Rebalancing Proposal                ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!(
        "║  User: {:<20}  History since: {}          ║",
        report.user_id, report.start_date
    );
    println!(
        "║  Portfolio Value : ${:>12.2}   Basis: {:<12}       ║",
        report.total_value,
        report.weight_basis.as_str()
    );
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║                      Current     Optimized                 ║");
    println!(
        "║  Exp. Annual Return  {:>+7.2}%    {:>+7.2}%                  ║",
        report.current_performance.expected_annual_return * 100.0,
        report.optimized_performance.expected_annual_return * 100.0
    );
    println!(
        "║  Annual Volatility   {:>7.2}%    {:>7.2}%                  ║",
        report.current_performance.annual_volatility * 100.0,
        report.optimized_performance.annual_volatility * 100.0
    );
    println!(
        "║  Sharpe Ratio        {:>7.2}     {:>7.2}                   ║",
        report.current_performance.sharpe_ratio,
        report.optimized_performance.sharpe_ratio
    );
    println!(
        "║  Backtest Growth     {:>7.3}x    {:>7.3}x                  ║",
        report.current_series.final_growth(),
        report.optimized_series.final_growth()
    );
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Symbol   Now%    Target%   Shares -> Target     Price     ║");
    println!("╠════════════════════════════════════════════════════════════╣");

    let mut sorted: Vec<&AllocationRow> = report.rows.iter().collect();
    sorted.sort_by(|a, b| b.target_weight.total_cmp(&a.target_weight));

    for row in sorted {
        let price = row
            .latest_price
            .map(|p| format!("${:>8.2}", p))
            .unwrap_or_else(|| "      n/a".to_string());
        println!(
            "║  {:<6} {:>6.2}%  {:>7.2}%   {:>6} -> {:<6}   {}  ║",
            row.symbol,
            row.current_weight * 100.0,
            row.target_weight * 100.0,
            row.current_shares,
            row.allocated_shares,
            price
        );
    }

    println!("╠════════════════════════════════════════════════════════════╣");
    println!(
        "║  Leftover Cash: ${:>12.2}                              ║",
        report.leftover_cash
    );
    if !report.excluded.is_empty() {
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Excluded:                                                 ║");
        for ex in &report.excluded {
            println!("║    {:<6} {}", ex.symbol, ex.kind.user_message());
        }
    }
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("⚠  Educational use only. Not financial advice.");
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SUM_TOLERANCE;
    use crate::data::{SymbolHistory, SyntheticProvider};
    use crate::error::ErrorKind;
    use crate::holdings::{Holding, InMemoryHoldingsStore};
    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Daily prices from 2024-01-02; each symbol may start some days in.
    struct FixedProvider {
        dates: Vec<NaiveDate>,
        prices: HashMap<String, (usize, Vec<f64>)>,
        fail: bool,
    }

    impl FixedProvider {
        fn new(prices: Vec<(&str, Vec<f64>)>) -> Self {
            Self::staggered(prices.into_iter().map(|(s, p)| (s, 0, p)).collect())
        }

        fn staggered(prices: Vec<(&str, usize, Vec<f64>)>) -> Self {
            let len = prices
                .iter()
                .map(|(_, first, p)| first + p.len())
                .max()
                .unwrap_or(0);
            let start = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
            Self {
                dates: (0..len).map(|i| start + chrono::Duration::days(i as i64)).collect(),
                prices: prices
                    .into_iter()
                    .map(|(s, first, p)| (s.to_string(), (first, p)))
                    .collect(),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Vec::new())
            }
        }
    }

    #[async_trait]
    impl PriceHistoryProvider for FixedProvider {
        fn id(&self) -> &'static str {
            "fixed"
        }

        async fn fetch_history(&self, symbol: &str, _start: NaiveDate) -> EngineResult<SymbolHistory> {
            if self.fail {
                return Err(EngineError::DataUnavailable("upstream down".into()));
            }
            let points = self
                .prices
                .get(symbol)
                .map(|(first, p)| {
                    self.dates[*first..]
                        .iter()
                        .copied()
                        .zip(p.iter().copied())
                        .collect()
                })
                .unwrap_or_default();
            Ok(SymbolHistory {
                symbol: symbol.to_string(),
                points,
            })
        }
    }

    fn holding(symbol: &str, shares: u64, value: f64) -> Holding {
        Holding {
            symbol: symbol.into(),
            shares,
            current_value: value,
        }
    }

    fn engine(holdings: Vec<Holding>, provider: impl PriceHistoryProvider + 'static) -> PortfolioEngine {
        let store = InMemoryHoldingsStore::new().with_user("alice", holdings);
        PortfolioEngine::new(Arc::new(store), Arc::new(provider), EngineConfig::default())
    }

    fn synthetic() -> SyntheticProvider {
        SyntheticProvider::with_end(7, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap())
    }

    #[tokio::test]
    async fn test_end_to_end_with_synthetic_prices() {
        let engine = engine(
            vec![
                holding("AAA", 10, 2_000.0),
                holding("BBB", 25, 3_000.0),
                holding("CCC", 5, 5_000.0),
            ],
            synthetic(),
        );
        let report = engine.optimize("alice", 2022).await.unwrap();

        assert_eq!(report.start_date, NaiveDate::from_ymd_opt(2022, 1, 1).unwrap());
        assert_eq!(report.rows.len(), 3);
        let weight_sum: f64 = report.rows.iter().map(|r| r.target_weight).sum();
        assert!((weight_sum - 1.0).abs() < SUM_TOLERANCE);
        assert!(report.rows.iter().all(|r| r.target_weight >= 0.0));

        let spent: f64 = report
            .rows
            .iter()
            .map(|r| r.allocated_shares as f64 * r.latest_price.unwrap())
            .sum();
        assert!(spent <= report.total_value + 1e-6);
        assert_relative_eq!(spent + report.leftover_cash, 10_000.0, epsilon = 1e-6);

        assert_eq!(report.current_series.dates.len(), report.optimized_series.dates.len());
        assert_eq!(report.current_series.cumulative_growth[0], 1.0);
        assert_eq!(report.optimized_series.cumulative_growth[0], 1.0);
        assert!(report.excluded.is_empty());
    }

    #[tokio::test]
    async fn test_same_inputs_same_report() {
        let holdings = vec![holding("AAA", 10, 2_000.0), holding("BBB", 25, 3_000.0)];
        let first = engine(holdings.clone(), synthetic()).optimize("alice", 2023).await.unwrap();
        let second = engine(holdings, synthetic()).optimize("alice", 2023).await.unwrap();
        assert_eq!(first.rows, second.rows);
        assert_eq!(first.leftover_cash, second.leftover_cash);
    }

    #[tokio::test]
    async fn test_single_symbol_gets_full_weight() {
        let engine = engine(vec![holding("SOLO", 3, 900.0)], synthetic());
        let report = engine.optimize("alice", 2023).await.unwrap();
        assert_eq!(report.row("SOLO").unwrap().target_weight, 1.0);
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_empty_universe() {
        let engine = engine(Vec::new(), synthetic());
        let err = engine.optimize("nobody", 2023).await.unwrap_err();
        assert_eq!(err.stage, Stage::Holdings);
        assert_eq!(err.kind(), ErrorKind::EmptyUniverse);
    }

    #[tokio::test]
    async fn test_provider_failure_is_tagged_with_stage() {
        let engine = engine(vec![holding("AAA", 1, 100.0)], FixedProvider::failing());
        let err = engine.optimize("alice", 2023).await.unwrap_err();
        assert_eq!(err.stage, Stage::PriceHistory);
        assert_eq!(err.kind(), ErrorKind::DataUnavailable);
        assert_eq!(err.user_message(), ErrorKind::DataUnavailable.user_message());
    }

    #[tokio::test]
    async fn test_late_listing_kept_and_one_day_listing_excluded() {
        let a: Vec<f64> = (0..60)
            .map(|i| 100.0 + i as f64 + if i % 3 == 0 { 2.0 } else { 0.0 })
            .collect();
        let b: Vec<f64> = (0..60).map(|i| 50.0 + (i % 5) as f64).collect();
        let late: Vec<f64> = (0..20)
            .map(|i| 30.0 + 0.1 * i as f64 + 0.5 * (i % 4) as f64)
            .collect();
        let provider = FixedProvider::staggered(vec![
            ("A", 0, a),
            ("B", 0, b),
            ("LATE", 40, late),
            ("DELISTED", 0, vec![25.0]),
        ]);
        let engine = engine(
            vec![
                holding("A", 10, 1_000.0),
                holding("B", 20, 1_000.0),
                holding("LATE", 30, 1_000.0),
                holding("DELISTED", 40, 1_000.0),
            ],
            provider,
        );
        let report = engine.optimize("alice", 2024).await.unwrap();

        let excluded: Vec<(&str, ErrorKind)> = report
            .excluded
            .iter()
            .map(|e| (e.symbol.as_str(), e.kind))
            .collect();
        assert_eq!(excluded, vec![("DELISTED", ErrorKind::InsufficientHistory)]);

        let delisted = report.row("DELISTED").unwrap();
        assert_eq!(delisted.target_weight, 0.0);
        assert_eq!(delisted.allocated_shares, 0);
        assert!(report.row("LATE").unwrap().latest_price.is_some());

        let weight_sum: f64 = report.rows.iter().map(|r| r.target_weight).sum();
        assert!((weight_sum - 1.0).abs() < SUM_TOLERANCE);
        assert!(report.rows.iter().all(|r| r.target_weight >= 0.0));
    }

    #[tokio::test]
    async fn test_symbol_without_data_is_reported_not_allocated() {
        let provider = FixedProvider::new(vec![
            ("A", vec![100.0, 102.0, 101.0, 105.0, 103.0, 108.0]),
            ("B", vec![50.0, 49.0, 51.0, 50.5, 52.0, 51.0]),
        ]);
        let engine = engine(
            vec![
                holding("A", 2, 200.0),
                holding("B", 4, 200.0),
                holding("GHOST", 1, 100.0),
            ],
            provider,
        );
        let report = engine.optimize("alice", 2024).await.unwrap();

        let ghost = report.row("GHOST").unwrap();
        assert_eq!(ghost.target_weight, 0.0);
        assert_eq!(ghost.allocated_shares, 0);
        assert_eq!(ghost.latest_price, None);
        assert_relative_eq!(ghost.current_weight, 0.2, epsilon = 1e-12);
        assert_eq!(report.excluded.len(), 1);
        assert_eq!(report.excluded[0].symbol, "GHOST");
        assert_eq!(report.excluded[0].kind, ErrorKind::InsufficientHistory);

        let weight_sum: f64 = report.rows.iter().map(|r| r.target_weight).sum();
        assert!((weight_sum - 1.0).abs() < SUM_TOLERANCE);
    }

    #[tokio::test]
    async fn test_all_symbols_without_data_fail_estimation() {
        let engine = engine(vec![holding("GHOST", 1, 100.0)], FixedProvider::new(Vec::new()));
        let err = engine.optimize("alice", 2024).await.unwrap_err();
        assert_eq!(err.stage, Stage::Estimation);
        assert_eq!(err.kind(), ErrorKind::EmptyUniverse);
    }

    #[test]
    fn test_current_weights_by_basis() {
        let snapshot = PortfolioSnapshot::new(vec![
            holding("A", 1, 100.0),
            holding("B", 1, 300.0),
        ])
        .unwrap();
        let table = PriceTable::from_columns(
            vec![
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            ],
            vec![("A".into(), vec![90.0, 200.0]), ("B".into(), vec![310.0, 200.0])],
        )
        .unwrap();

        let stored = current_weights(&snapshot, &table, WeightBasis::Snapshot).unwrap();
        assert_relative_eq!(stored.get("A").unwrap(), 0.25, epsilon = 1e-12);

        let revalued = current_weights(&snapshot, &table, WeightBasis::LatestClose).unwrap();
        assert_relative_eq!(revalued.get("A").unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(revalued.get("B").unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_weight_basis_parse() {
        assert_eq!(WeightBasis::parse_or_default("latest-close"), WeightBasis::LatestClose);
        assert_eq!(WeightBasis::parse_or_default(" LATEST_CLOSE "), WeightBasis::LatestClose);
        assert_eq!(WeightBasis::parse_or_default("snapshot"), WeightBasis::Snapshot);
        assert_eq!(WeightBasis::parse_or_default("bogus"), WeightBasis::Snapshot);
    }
}
