use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Stable tag for every failure the engine can surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InsufficientHistory,
    EmptyUniverse,
    OptimizationInfeasible,
    InvalidBudget,
    EmptyWindow,
    DataUnavailable,
    InvalidWeights,
    HoldingsUnavailable,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientHistory => "insufficient_history",
            Self::EmptyUniverse => "empty_universe",
            Self::OptimizationInfeasible => "optimization_infeasible",
            Self::InvalidBudget => "invalid_budget",
            Self::EmptyWindow => "empty_window",
            Self::DataUnavailable => "data_unavailable",
            Self::InvalidWeights => "invalid_weights",
            Self::HoldingsUnavailable => "holdings_unavailable",
        }
    }

    /// Message suitable for showing to an end user. Never carries internal detail.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::InsufficientHistory => {
                "Not enough price history for one of your stocks. Pick an earlier start year."
            }
            Self::EmptyUniverse => {
                "None of your holdings have usable price history. Buy some stocks or pick an earlier start year."
            }
            Self::OptimizationInfeasible => {
                "The optimizer could not find a valid allocation for these holdings. Try a different start year."
            }
            Self::InvalidBudget => "Your portfolio value is invalid, so shares cannot be allocated.",
            Self::EmptyWindow => {
                "The selected period has fewer than two trading days. Pick an earlier start year."
            }
            Self::DataUnavailable => {
                "Market data is currently unavailable. Please try again in a few minutes."
            }
            Self::InvalidWeights => "The computed portfolio weights were invalid. Please try again.",
            Self::HoldingsUnavailable => {
                "Your holdings could not be loaded. Please try again later."
            }
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the individual pipeline components.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient history for {symbol}: {observations} observation(s), need at least 2")]
    InsufficientHistory { symbol: String, observations: usize },

    #[error("no symbols left to optimize")]
    EmptyUniverse,

    #[error("optimization infeasible: {0}")]
    OptimizationInfeasible(String),

    #[error("invalid budget {0}: must be a finite amount >= 0")]
    InvalidBudget(f64),

    #[error("price window has {dates} date(s), need at least 2")]
    EmptyWindow { dates: usize },

    #[error("price data unavailable: {0}")]
    DataUnavailable(String),

    #[error("invalid weights: {0}")]
    InvalidWeights(String),

    #[error("holdings unavailable: {0}")]
    HoldingsUnavailable(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientHistory { .. } => ErrorKind::InsufficientHistory,
            Self::EmptyUniverse => ErrorKind::EmptyUniverse,
            Self::OptimizationInfeasible(_) => ErrorKind::OptimizationInfeasible,
            Self::InvalidBudget(_) => ErrorKind::InvalidBudget,
            Self::EmptyWindow { .. } => ErrorKind::EmptyWindow,
            Self::DataUnavailable(_) => ErrorKind::DataUnavailable,
            Self::InvalidWeights(_) => ErrorKind::InvalidWeights,
            Self::HoldingsUnavailable(_) => ErrorKind::HoldingsUnavailable,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Pipeline step that produced a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Holdings,
    PriceHistory,
    Estimation,
    Optimization,
    Allocation,
    Backtest,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Holdings => "holdings",
            Self::PriceHistory => "price history",
            Self::Estimation => "estimation",
            Self::Optimization => "optimization",
            Self::Allocation => "allocation",
            Self::Backtest => "backtest",
        };
        f.write_str(name)
    }
}

/// The single tagged failure returned by the orchestrator.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct OptimizeFailure {
    pub stage: Stage,
    #[source]
    pub source: EngineError,
}

impl OptimizeFailure {
    pub fn new(stage: Stage, source: EngineError) -> Self {
        Self { stage, source }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn user_message(&self) -> &'static str {
        self.kind().user_message()
    }
}

/// Tags an `EngineResult` with the stage it came from.
pub trait StageExt<T> {
    fn at(self, stage: Stage) -> Result<T, OptimizeFailure>;
}

impl<T> StageExt<T> for EngineResult<T> {
    fn at(self, stage: Stage) -> Result<T, OptimizeFailure> {
        self.map_err(|source| OptimizeFailure::new(stage, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_every_kind_has_distinct_user_message() {
        let kinds = [
            ErrorKind::InsufficientHistory,
            ErrorKind::EmptyUniverse,
            ErrorKind::OptimizationInfeasible,
            ErrorKind::InvalidBudget,
            ErrorKind::EmptyWindow,
            ErrorKind::DataUnavailable,
            ErrorKind::InvalidWeights,
            ErrorKind::HoldingsUnavailable,
        ];
        let messages: HashSet<&str> = kinds.iter().map(|k| k.user_message()).collect();
        assert_eq!(messages.len(), kinds.len());
    }

    #[test]
    fn test_failure_carries_originating_kind() {
        let result: EngineResult<()> = Err(EngineError::InvalidBudget(-5.0));
        let failure = result.at(Stage::Allocation).unwrap_err();
        assert_eq!(failure.stage, Stage::Allocation);
        assert_eq!(failure.kind(), ErrorKind::InvalidBudget);
        assert!(failure.to_string().starts_with("allocation stage failed"));
        assert!(!failure.user_message().contains("-5"));
    }
}
