use crate::config::TRADING_DAYS;
use crate::data::PriceTable;
use crate::error::{EngineError, EngineResult, ErrorKind};
use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

/// Relative size a negative eigenvalue may reach before the matrix is repaired.
const PSD_TOLERANCE: f64 = 1e-12;

/// Annualized mean return per symbol.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExpectedReturns {
    symbols: Vec<String>,
    values: Vec<f64>,
}

impl ExpectedReturns {
    pub fn new(symbols: Vec<String>, values: Vec<f64>) -> EngineResult<Self> {
        if symbols.len() != values.len() {
            return Err(EngineError::OptimizationInfeasible(format!(
                "{} symbols but {} expected returns",
                symbols.len(),
                values.len()
            )));
        }
        Ok(Self { symbols, values })
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Annualized covariance of daily simple returns. Symmetric, non-negative diagonal.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CovarianceMatrix {
    symbols: Vec<String>,
    values: Vec<Vec<f64>>,
}

impl CovarianceMatrix {
    pub fn new(symbols: Vec<String>, values: Vec<Vec<f64>>) -> EngineResult<Self> {
        let n = symbols.len();
        if values.len() != n || values.iter().any(|row| row.len() != n) {
            return Err(EngineError::OptimizationInfeasible(format!(
                "covariance matrix is not {}x{}",
                n, n
            )));
        }
        for i in 0..n {
            if values[i][i].is_nan() || values[i][i] < 0.0 {
                return Err(EngineError::OptimizationInfeasible(format!(
                    "negative or undefined variance for {}",
                    symbols[i]
                )));
            }
            for j in 0..i {
                let scale = values[i][j].abs().max(values[j][i].abs()).max(1.0);
                if (values[i][j] - values[j][i]).abs() > 1e-9 * scale {
                    return Err(EngineError::OptimizationInfeasible(format!(
                        "covariance matrix is not symmetric at ({}, {})",
                        symbols[i], symbols[j]
                    )));
                }
            }
        }
        Ok(Self { symbols, values })
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.values
    }
}

/// A symbol left out of the optimization, with the reason.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Exclusion {
    pub symbol: String,
    pub kind: ErrorKind,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct Estimates {
    pub expected_returns: ExpectedReturns,
    pub covariance: CovarianceMatrix,
    pub excluded: Vec<Exclusion>,
}

/// Daily simple returns; element `t` is the return from `t` to `t + 1`.
/// Undefined where either price is missing.
pub fn simple_returns(prices: &[Option<f64>]) -> Vec<Option<f64>> {
    prices
        .windows(2)
        .map(|w| match (w[0], w[1]) {
            (Some(prev), Some(next)) if prev > 0.0 => Some((next - prev) / prev),
            _ => None,
        })
        .collect()
}

/// Compound annual growth rate over the defined returns.
fn annualized_mean_return(returns: &[Option<f64>]) -> f64 {
    let valid: Vec<f64> = returns.iter().flatten().copied().collect();
    if valid.is_empty() {
        return 0.0;
    }
    let growth: f64 = valid.iter().map(|r| 1.0 + r).product();
    growth.powf(TRADING_DAYS / valid.len() as f64) - 1.0
}

/// Sample covariance over the dates where both returns are defined.
fn pairwise_covariance(a: &[Option<f64>], b: &[Option<f64>]) -> f64 {
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .zip(b.iter())
        .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
        .collect();
    let k = pairs.len();
    if k < 2 {
        return 0.0;
    }
    let mean_a = pairs.iter().map(|(x, _)| x).sum::<f64>() / k as f64;
    let mean_b = pairs.iter().map(|(_, y)| y).sum::<f64>() / k as f64;
    let sum: f64 = pairs
        .iter()
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum();
    sum / (k as f64 - 1.0)
}

/// Projects a symmetric estimate onto the positive semidefinite cone by
/// clipping negative eigenvalues to zero.
///
/// Pairwise-complete covariances built from staggered histories are not
/// guaranteed to be PSD. Matrices that already are come back unchanged.
fn clip_to_psd(symbols: &[String], cov: Vec<Vec<f64>>) -> Vec<Vec<f64>> {
    let n = cov.len();
    if n < 2 || cov.iter().flatten().any(|v| !v.is_finite()) {
        return cov;
    }
    let matrix = DMatrix::from_fn(n, n, |i, j| cov[i][j]);
    let Some(eigen) = matrix.try_symmetric_eigen(f64::EPSILON, 10_000) else {
        warn!("Covariance eigendecomposition did not converge; using raw estimate");
        return cov;
    };

    let smallest = eigen.eigenvalues.min();
    let scale = eigen.eigenvalues.amax().max(1.0);
    if smallest >= -PSD_TOLERANCE * scale {
        return cov;
    }
    warn!(
        "Covariance of {} is indefinite (smallest eigenvalue {:.3e}); clipping to PSD",
        symbols.join(", "),
        smallest
    );

    let clipped = eigen.eigenvalues.map(|v| v.max(0.0));
    let rebuilt =
        &eigen.eigenvectors * DMatrix::from_diagonal(&clipped) * eigen.eigenvectors.transpose();
    (0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    let value = 0.5 * (rebuilt[(i, j)] + rebuilt[(j, i)]);
                    if i == j { value.max(0.0) } else { value }
                })
                .collect()
        })
        .collect()
}

/// Derives annualized expected returns and covariance from a price table.
///
/// Symbols with fewer than two reported prices are excluded and reported; the
/// call only fails when nothing is left. Forward-filled prices do not count.
pub fn estimate(table: &PriceTable) -> EngineResult<Estimates> {
    let mut symbols = Vec::new();
    let mut returns = Vec::new();
    let mut excluded = Vec::new();

    for (symbol, column) in table.columns() {
        let observations = table.observations(symbol).unwrap_or(0);
        if observations < 2 {
            let err = EngineError::InsufficientHistory {
                symbol: symbol.to_string(),
                observations,
            };
            warn!("{}. Excluding from optimization.", err);
            excluded.push(Exclusion {
                symbol: symbol.to_string(),
                kind: err.kind(),
                reason: err.to_string(),
            });
            continue;
        }
        symbols.push(symbol.to_string());
        returns.push(simple_returns(column));
    }

    if symbols.is_empty() {
        return Err(EngineError::EmptyUniverse);
    }

    let means: Vec<f64> = returns.iter().map(|r| annualized_mean_return(r)).collect();

    let n = symbols.len();
    let upper: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|i| {
            (i..n)
                .map(|j| pairwise_covariance(&returns[i], &returns[j]) * TRADING_DAYS)
                .collect()
        })
        .collect();

    let mut cov = vec![vec![0.0; n]; n];
    for (i, row) in upper.iter().enumerate() {
        for (offset, &value) in row.iter().enumerate() {
            let j = i + offset;
            cov[i][j] = value;
            cov[j][i] = value;
        }
    }

    let cov = clip_to_psd(&symbols, cov);

    for (i, symbol) in symbols.iter().enumerate() {
        info!("  {}: E[r]={:.4}, σ={:.4}", symbol, means[i], cov[i][i].sqrt());
    }

    Ok(Estimates {
        expected_returns: ExpectedReturns::new(symbols.clone(), means)?,
        covariance: CovarianceMatrix::new(symbols, cov)?,
        excluded,
    })
}
