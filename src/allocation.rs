use crate::error::{EngineError, EngineResult};
use crate::optimizer::WeightVector;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// Slack for floating-point comparisons against the remaining budget.
const FIT_EPS: f64 = 1e-9;

/// Whole-share allocation of a cash budget.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AllocationResult {
    /// Share count per symbol, in weight-vector order; skipped symbols hold 0.
    pub shares: Vec<(String, u64)>,
    pub leftover_cash: f64,
}

impl AllocationResult {
    fn all_zero(weights: &WeightVector, budget: f64) -> Self {
        Self {
            shares: weights.entries().iter().map(|(s, _)| (s.clone(), 0)).collect(),
            leftover_cash: budget,
        }
    }

    pub fn shares_of(&self, symbol: &str) -> u64 {
        self.shares
            .iter()
            .find(|(s, _)| s == symbol)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

/// Greedy conversion of target weights into whole shares.
///
/// First pass: in descending-weight order, buy `floor(weight · budget / price)`
/// shares of each symbol. Second pass: keep buying one share of whichever
/// affordable symbol is furthest below its dollar target until no
/// positive-weight symbol fits in the remaining cash. Ties go to the symbol
/// that comes first in descending-weight order.
pub fn allocate_greedy(
    weights: &WeightVector,
    latest_prices: &HashMap<String, f64>,
    budget: f64,
) -> EngineResult<AllocationResult> {
    if !budget.is_finite() || budget < 0.0 {
        return Err(EngineError::InvalidBudget(budget));
    }
    if budget == 0.0 || weights.is_empty() {
        return Ok(AllocationResult::all_zero(weights, budget));
    }

    let entries = weights.entries();
    let prices: Vec<Option<f64>> = entries
        .iter()
        .map(|(s, w)| {
            latest_prices
                .get(s)
                .copied()
                .filter(|p| *w > 0.0 && p.is_finite() && *p > 0.0)
        })
        .collect();

    // Stable sort keeps universe order among equal weights.
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| entries[b].1.total_cmp(&entries[a].1));

    let mut shares = vec![0u64; entries.len()];
    let mut remaining = budget;

    for &i in &order {
        let Some(price) = prices[i] else {
            continue;
        };
        let target = entries[i].1 * budget;
        let wanted = (target / price * (1.0 + 1e-12)).floor();
        let affordable = ((remaining + FIT_EPS) / price).floor();
        let units = wanted.min(affordable).max(0.0);
        shares[i] = units as u64;
        remaining -= units * price;
    }
    debug!("allocation first pass leaves {:.2} unallocated", remaining);

    loop {
        let mut pick: Option<(usize, f64)> = None;
        for &i in &order {
            let Some(price) = prices[i] else {
                continue;
            };
            if price > remaining + FIT_EPS {
                continue;
            }
            let shortfall = entries[i].1 * budget - shares[i] as f64 * price;
            if pick.is_none_or(|(_, best)| shortfall > best) {
                pick = Some((i, shortfall));
            }
        }
        let Some((i, _)) = pick else {
            break;
        };
        if let Some(price) = prices[i] {
            shares[i] += 1;
            remaining -= price;
        }
    }

    let result = AllocationResult {
        shares: entries
            .iter()
            .zip(shares)
            .map(|((s, _), n)| (s.clone(), n))
            .collect(),
        leftover_cash: remaining.max(0.0),
    };
    info!(
        "Allocated {:.2} of {:.2}; leftover {:.2}",
        budget - result.leftover_cash,
        budget,
        result.leftover_cash
    );
    Ok(result)
}
