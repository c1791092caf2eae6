use crate::error::{EngineError, EngineResult};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One position as stored by the account system.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub symbol: String,
    pub shares: u64,
    /// Stored market value; may predate today's prices.
    #[serde(alias = "total_value")]
    pub current_value: f64,
}

/// A user's holdings at one point in time.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PortfolioSnapshot {
    holdings: Vec<Holding>,
    total_value: f64,
}

impl PortfolioSnapshot {
    /// Normalizes symbols to upper case and merges duplicates, keeping first-seen order.
    pub fn new(raw: Vec<Holding>) -> EngineResult<Self> {
        let mut holdings: Vec<Holding> = Vec::with_capacity(raw.len());
        for holding in raw {
            let symbol = holding.symbol.trim().to_uppercase();
            if symbol.is_empty() {
                return Err(EngineError::HoldingsUnavailable("holding with empty symbol".into()));
            }
            if !holding.current_value.is_finite() || holding.current_value < 0.0 {
                return Err(EngineError::HoldingsUnavailable(format!(
                    "{} has invalid value {}",
                    symbol, holding.current_value
                )));
            }
            match holdings.iter_mut().find(|h| h.symbol == symbol) {
                Some(existing) => {
                    existing.shares += holding.shares;
                    existing.current_value += holding.current_value;
                }
                None => holdings.push(Holding { symbol, ..holding }),
            }
        }
        let total_value = holdings.iter().map(|h| h.current_value).sum();
        Ok(Self {
            holdings,
            total_value,
        })
    }

    pub fn holdings(&self) -> &[Holding] {
        &self.holdings
    }

    pub fn total_value(&self) -> f64 {
        self.total_value
    }

    pub fn is_empty(&self) -> bool {
        self.holdings.is_empty()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.holdings.iter().map(|h| h.symbol.clone()).collect()
    }
}

/// Read access to the account system's per-user holdings.
#[async_trait]
pub trait HoldingsStore: Send + Sync {
    async fn get_snapshot(&self, user_id: &str) -> EngineResult<PortfolioSnapshot>;
}

/// Holdings kept in memory, keyed by user id.
#[derive(Clone, Debug, Default)]
pub struct InMemoryHoldingsStore {
    users: HashMap<String, Vec<Holding>>,
}

impl InMemoryHoldingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: &str, holdings: Vec<Holding>) -> Self {
        self.users.insert(user_id.to_string(), holdings);
        self
    }
}

#[async_trait]
impl HoldingsStore for InMemoryHoldingsStore {
    async fn get_snapshot(&self, user_id: &str) -> EngineResult<PortfolioSnapshot> {
        let holdings = self.users.get(user_id).cloned().unwrap_or_default();
        PortfolioSnapshot::new(holdings)
    }
}

/// Holdings read from a JSON file of the form `{ "<user>": [ {symbol, shares, total_value} ] }`.
///
/// The file is re-read on every request.
#[derive(Clone, Debug)]
pub struct JsonHoldingsStore {
    path: PathBuf,
}

impl JsonHoldingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_file(path: &Path) -> Result<HashMap<String, Vec<Holding>>> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open holdings file {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("malformed holdings file {}", path.display()))
    }
}

#[async_trait]
impl HoldingsStore for JsonHoldingsStore {
    async fn get_snapshot(&self, user_id: &str) -> EngineResult<PortfolioSnapshot> {
        let mut users = Self::read_file(&self.path)
            .map_err(|e| EngineError::HoldingsUnavailable(format!("{:#}", e)))?;
        let holdings = users.remove(user_id).unwrap_or_else(|| {
            warn!("No holdings recorded for user {}", user_id);
            Vec::new()
        });
        info!("Loaded {} holding(s) for user {}", holdings.len(), user_id);
        PortfolioSnapshot::new(holdings)
    }
}

/// Parses `SYMBOL:SHARES:VALUE`, e.g. `AAPL:10:1890.50`.
pub fn parse_holding_arg(raw: &str) -> Result<Holding> {
    let parts: Vec<&str> = raw.split(':').map(str::trim).collect();
    let [symbol, shares, value] = parts.as_slice() else {
        return Err(anyhow!("Invalid holding '{}', expected SYMBOL:SHARES:VALUE", raw));
    };
    let shares = shares
        .parse::<u64>()
        .map_err(|_| anyhow!("Invalid share count in '{}'", raw))?;
    let current_value = value
        .parse::<f64>()
        .map_err(|_| anyhow!("Invalid value in '{}'", raw))?;
    Ok(Holding {
        symbol: symbol.to_string(),
        shares,
        current_value,
    })
}
