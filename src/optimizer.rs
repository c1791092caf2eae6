use crate::config::{
    MAX_SOLVER_ITERATIONS, RIDGE_MAX, RIDGE_START, SUM_TOLERANCE, WEIGHT_CUTOFF, WEIGHT_DECIMALS,
};
use crate::error::{EngineError, EngineResult};
use crate::estimator::{CovarianceMatrix, ExpectedReturns};
use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use tracing::{debug, info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Weight vectors
// ──────────────────────────────────────────────────────────────────────────────

/// Long-only, fully invested portfolio weights in universe order.
///
/// Every weight lies in `[0, 1]` and a non-empty vector sums to 1 within
/// `SUM_TOLERANCE`. The empty vector stands for "nothing to hold".
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeightVector {
    entries: Vec<(String, f64)>,
}

impl WeightVector {
    pub fn new(entries: Vec<(String, f64)>) -> EngineResult<Self> {
        for (idx, (symbol, weight)) in entries.iter().enumerate() {
            if !weight.is_finite() || *weight < 0.0 || *weight > 1.0 + SUM_TOLERANCE {
                return Err(EngineError::InvalidWeights(format!(
                    "{} has weight {} outside [0, 1]",
                    symbol, weight
                )));
            }
            if entries[..idx].iter().any(|(s, _)| s == symbol) {
                return Err(EngineError::InvalidWeights(format!("{} appears twice", symbol)));
            }
        }
        if !entries.is_empty() {
            let sum: f64 = entries.iter().map(|(_, w)| w).sum();
            if (sum - 1.0).abs() >= SUM_TOLERANCE {
                return Err(EngineError::InvalidWeights(format!(
                    "weights sum to {:.6}, expected 1",
                    sum
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Normalizes non-negative amounts (e.g. position values) into weights.
    pub fn from_amounts(amounts: &[(String, f64)]) -> EngineResult<Self> {
        let total: f64 = amounts.iter().map(|(_, v)| v.max(0.0)).sum();
        if !(total > 0.0) {
            return Ok(Self::empty());
        }
        Self::new(
            amounts
                .iter()
                .map(|(s, v)| (s.clone(), v.max(0.0) / total))
                .collect(),
        )
    }

    pub fn entries(&self) -> &[(String, f64)] {
        &self.entries
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, w)| *w)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes numerical noise: zeroes weights under `WEIGHT_CUTOFF`,
    /// renormalizes, rounds to `WEIGHT_DECIMALS` places and hands the rounding
    /// residual to the largest weight.
    pub fn clean(&self) -> EngineResult<Self> {
        if self.entries.is_empty() {
            return Ok(Self::empty());
        }

        let mut weights: Vec<f64> = self
            .entries
            .iter()
            .map(|(_, w)| if *w < WEIGHT_CUTOFF { 0.0 } else { *w })
            .collect();
        let kept: f64 = weights.iter().sum();
        if !(kept > 0.0) {
            return Err(EngineError::InvalidWeights(
                "every weight is below the cleaning cutoff".into(),
            ));
        }

        let scale = 10f64.powi(WEIGHT_DECIMALS);
        for w in weights.iter_mut() {
            *w = (*w / kept * scale).round() / scale;
        }

        let largest = weights
            .iter()
            .enumerate()
            .fold(0, |best, (i, w)| if *w > weights[best] { i } else { best });
        let residual = 1.0 - weights.iter().sum::<f64>();
        weights[largest] = ((weights[largest] + residual) * scale).round() / scale;

        Self::new(
            self.entries
                .iter()
                .zip(weights)
                .map(|((s, _), w)| (s.clone(), w.max(0.0)))
                .collect(),
        )
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Portfolio statistics
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PortfolioPerformance {
    pub expected_annual_return: f64,
    pub annual_volatility: f64,
    pub sharpe_ratio: f64,
}

fn portfolio_return(weights: &[f64], means: &[f64]) -> f64 {
    weights.iter().zip(means.iter()).map(|(w, r)| w * r).sum()
}

fn portfolio_variance(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
    let n = weights.len();
    let mut var = 0.0;
    for i in 0..n {
        for j in 0..n {
            var += weights[i] * weights[j] * cov[i][j];
        }
    }
    var
}

/// Expected return, volatility and Sharpe ratio of `weights`.
///
/// Symbols outside the estimated universe contribute nothing.
pub fn performance(
    weights: &WeightVector,
    mu: &ExpectedReturns,
    cov: &CovarianceMatrix,
    risk_free_rate: f64,
) -> PortfolioPerformance {
    let aligned: Vec<f64> = mu
        .symbols()
        .iter()
        .map(|s| weights.get(s).unwrap_or(0.0))
        .collect();
    let ret = portfolio_return(&aligned, mu.values());
    let vol = portfolio_variance(&aligned, cov.rows()).max(0.0).sqrt();
    let sharpe = if vol > 1e-8 {
        (ret - risk_free_rate) / vol
    } else {
        0.0
    };
    PortfolioPerformance {
        expected_annual_return: ret,
        annual_volatility: vol,
        sharpe_ratio: sharpe,
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Optimizer: max Sharpe via the tangency reformulation
// ──────────────────────────────────────────────────────────────────────────────

/// Maximizes `(wᵀμ − r_f) / sqrt(wᵀΣw)` over `Σw = 1`, `w ≥ 0`.
///
/// Solved as `min yᵀΣy` subject to `(μ − r_f)ᵀy = 1`, `y ≥ 0`, then
/// `w = y / Σy`. When no asset beats the risk-free rate the tangency problem
/// has no feasible point and the long-only minimum-variance portfolio is
/// returned instead. Weights are raw; call [`WeightVector::clean`] for display.
pub fn optimize_max_sharpe(
    mu: &ExpectedReturns,
    cov: &CovarianceMatrix,
    risk_free_rate: f64,
) -> EngineResult<WeightVector> {
    if mu.is_empty() {
        return Err(EngineError::OptimizationInfeasible("no assets to optimize".into()));
    }
    if cov.symbols() != mu.symbols() {
        return Err(EngineError::OptimizationInfeasible(
            "expected returns and covariance cover different symbols".into(),
        ));
    }
    let n = mu.len();
    if n == 1 {
        return WeightVector::new(vec![(mu.symbols()[0].clone(), 1.0)]);
    }

    info!("Optimizing max-Sharpe portfolio over {} assets (r_f={:.4})", n, risk_free_rate);

    let sigma = DMatrix::from_fn(n, n, |i, j| cov.rows()[i][j]);
    let q = regularize(sigma)?;

    let excess = DVector::from_fn(n, |i, _| mu.values()[i] - risk_free_rate);
    let y = if excess.iter().any(|a| *a > 0.0) {
        solve_budget_qp(&q, &excess)?
    } else {
        warn!(
            "No asset has expected return above the risk-free rate ({:.4}); using minimum-variance portfolio",
            risk_free_rate
        );
        solve_budget_qp(&q, &DVector::from_element(n, 1.0))?
    };

    let total: f64 = y.iter().map(|v| v.max(0.0)).sum();
    if !(total > 0.0) {
        return Err(EngineError::OptimizationInfeasible(
            "solver returned an all-zero portfolio".into(),
        ));
    }

    WeightVector::new(
        mu.symbols()
            .iter()
            .zip(y.iter())
            .map(|(s, v)| (s.clone(), (v.max(0.0) / total).min(1.0)))
            .collect(),
    )
}

/// Cholesky succeeds and the pivots are not wildly out of scale.
fn well_conditioned(q: &DMatrix<f64>) -> bool {
    match q.clone().cholesky() {
        Some(chol) => {
            let l = chol.l();
            let (lo, hi) = l
                .diagonal()
                .iter()
                .fold((f64::INFINITY, 0.0_f64), |(lo, hi), d| (lo.min(*d), hi.max(*d)));
            lo > 0.0 && lo / hi > 1e-7
        }
        None => false,
    }
}

/// Adds `ε·I` with growing ε until the matrix factorizes cleanly.
fn regularize(sigma: DMatrix<f64>) -> EngineResult<DMatrix<f64>> {
    if well_conditioned(&sigma) {
        return Ok(sigma);
    }
    let n = sigma.nrows();
    let mut eps = RIDGE_START;
    while eps <= RIDGE_MAX {
        let candidate = &sigma + DMatrix::identity(n, n) * eps;
        if well_conditioned(&candidate) {
            warn!("Covariance matrix is singular or ill-conditioned; added ridge ε={:e}", eps);
            return Ok(candidate);
        }
        eps *= 10.0;
    }
    Err(EngineError::OptimizationInfeasible(format!(
        "covariance matrix not positive definite even with ridge {:e}",
        RIDGE_MAX
    )))
}

/// Equality-constrained minimum of `yᵀQy` over the free indices, with
/// `aᵀy = 1` and every other coordinate fixed at zero.
fn solve_face(q: &DMatrix<f64>, a: &DVector<f64>, free: &[usize]) -> EngineResult<DVector<f64>> {
    let m = free.len();
    let q_ff = DMatrix::from_fn(m, m, |r, c| q[(free[r], free[c])]);
    let a_f = DVector::from_fn(m, |r, _| a[free[r]]);
    let chol = q_ff.cholesky().ok_or_else(|| {
        EngineError::OptimizationInfeasible("sub-problem is not positive definite".into())
    })?;
    let z = chol.solve(&a_f);
    let denom = a_f.dot(&z);
    if !(denom > 0.0) {
        return Err(EngineError::OptimizationInfeasible(
            "budget constraint is degenerate on the active face".into(),
        ));
    }
    let mut y = DVector::zeros(a.len());
    for (r, &i) in free.iter().enumerate() {
        y[i] = z[r] / denom;
    }
    Ok(y)
}

/// Primal active-set method for `min ½yᵀQy` s.t. `aᵀy = 1`, `y ≥ 0`.
///
/// `Q` must be positive definite. Starts from the single asset with the
/// largest `a`, so the iterate path is fully deterministic.
fn solve_budget_qp(q: &DMatrix<f64>, a: &DVector<f64>) -> EngineResult<DVector<f64>> {
    let n = a.len();
    let mut start: Option<usize> = None;
    for i in 0..n {
        if a[i] > 0.0 && start.is_none_or(|k| a[i] > a[k]) {
            start = Some(i);
        }
    }
    let Some(k) = start else {
        return Err(EngineError::OptimizationInfeasible(
            "no feasible point satisfies the budget constraint".into(),
        ));
    };

    let mut y = DVector::zeros(n);
    y[k] = 1.0 / a[k];
    let mut free = vec![false; n];
    free[k] = true;

    for iteration in 0..MAX_SOLVER_ITERATIONS {
        let free_idx: Vec<usize> = (0..n).filter(|&i| free[i]).collect();
        let target = solve_face(q, a, &free_idx)?;
        let step = &target - &y;

        if step.amax() > 1e-10 * y.amax().max(1.0) {
            // Move toward the face optimum, stopping at the first bound hit.
            let mut alpha = 1.0;
            let mut blocking = None;
            for &i in &free_idx {
                if step[i] < 0.0 {
                    let ratio = -y[i] / step[i];
                    if ratio < alpha {
                        alpha = ratio;
                        blocking = Some(i);
                    }
                }
            }
            y += &step * alpha;
            if let Some(i) = blocking {
                y[i] = 0.0;
                free[i] = false;
            }
            continue;
        }

        // Optimal on this face: release the bound with the most negative multiplier.
        y = target;
        let grad = q * &y;
        let lambda = y.dot(&grad);
        let tol = 1e-10 * (1.0 + lambda.abs());
        let mut release: Option<(usize, f64)> = None;
        for i in (0..n).filter(|&i| !free[i]) {
            let nu = grad[i] - lambda * a[i];
            if nu < -tol && release.is_none_or(|(_, best)| nu < best) {
                release = Some((i, nu));
            }
        }

        match release {
            Some((i, nu)) => {
                debug!("active set: releasing asset {} (multiplier {:.3e})", i, nu);
                free[i] = true;
            }
            None => {
                debug!("active set converged after {} iteration(s)", iteration + 1);
                return Ok(y);
            }
        }
    }

    Err(EngineError::OptimizationInfeasible(format!(
        "active-set solver did not converge in {} iterations",
        MAX_SOLVER_ITERATIONS
    )))
}
