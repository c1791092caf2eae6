use crate::data::PriceTable;
use crate::error::{EngineError, EngineResult};
use crate::optimizer::WeightVector;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

/// Daily simple returns and their running growth factor over a date index.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReturnSeries {
    pub dates: Vec<NaiveDate>,
    pub simple_returns: Vec<f64>,
    pub cumulative_growth: Vec<f64>,
}

impl ReturnSeries {
    fn from_returns(dates: Vec<NaiveDate>, simple_returns: Vec<f64>) -> Self {
        let cumulative_growth = simple_returns
            .iter()
            .scan(1.0, |growth, r| {
                *growth *= 1.0 + r;
                Some(*growth)
            })
            .collect();
        Self {
            dates,
            simple_returns,
            cumulative_growth,
        }
    }

    /// Growth factor on the last date.
    pub fn final_growth(&self) -> f64 {
        self.cumulative_growth.last().copied().unwrap_or(1.0)
    }
}

/// Day-over-day returns aligned to the table's dates; index 0 and gaps are 0.
fn daily_returns(prices: &[Option<f64>]) -> Vec<f64> {
    let mut out = Vec::with_capacity(prices.len());
    if prices.is_empty() {
        return out;
    }
    out.push(0.0);
    out.extend(prices.windows(2).map(|w| match (w[0], w[1]) {
        (Some(prev), Some(next)) if prev > 0.0 => (next - prev) / prev,
        _ => 0.0,
    }));
    out
}

/// Return series of a single symbol, or `None` if it is not in the table.
pub fn symbol_series(table: &PriceTable, symbol: &str) -> Option<ReturnSeries> {
    let prices = table.series(symbol)?;
    Some(ReturnSeries::from_returns(
        table.dates().to_vec(),
        daily_returns(prices),
    ))
}

/// Fixed-weight, never-rebalanced portfolio series.
pub fn portfolio_series(table: &PriceTable, weights: &WeightVector) -> EngineResult<ReturnSeries> {
    if table.len() < 2 {
        return Err(EngineError::EmptyWindow { dates: table.len() });
    }
    let mut combined = vec![0.0; table.len()];
    for (symbol, weight) in weights.entries() {
        if *weight == 0.0 {
            continue;
        }
        // Absent symbols contribute nothing.
        let Some(series) = symbol_series(table, symbol) else {
            continue;
        };
        for (acc, r) in combined.iter_mut().zip(series.simple_returns) {
            *acc += weight * r;
        }
    }
    Ok(ReturnSeries::from_returns(table.dates().to_vec(), combined))
}

/// Backtests the current and proposed weights over the same window.
pub fn compare(
    table: &PriceTable,
    old_weights: &WeightVector,
    new_weights: &WeightVector,
) -> EngineResult<(ReturnSeries, ReturnSeries)> {
    let old = portfolio_series(table, old_weights)?;
    let new = portfolio_series(table, new_weights)?;
    info!(
        "Backtest over {} days: current {:.4}x, optimized {:.4}x",
        table.len(),
        old.final_growth(),
        new.final_growth()
    );
    Ok((old, new))
}
