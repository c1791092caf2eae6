use crate::data::DataProviderMode;
use crate::portfolio::WeightBasis;
use rayon::ThreadPoolBuilder;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

/// Annual trading days for annualization.
pub const TRADING_DAYS: f64 = 252.0;
/// Weights below this are treated as numerical noise and zeroed.
pub const WEIGHT_CUTOFF: f64 = 1e-4;
/// Decimal places kept by the clean step.
pub const WEIGHT_DECIMALS: i32 = 4;
/// Allowed deviation of a weight vector's sum from 1.
pub const SUM_TOLERANCE: f64 = 1e-4;
/// First ridge added to a covariance matrix that does not factorize.
pub const RIDGE_START: f64 = 1e-8;
/// Largest ridge tried before giving up.
pub const RIDGE_MAX: f64 = 1e-2;
/// Upper bound on active-set iterations, far above what N assets need.
pub const MAX_SOLVER_ITERATIONS: usize = 500;

pub const DEFAULT_RISK_FREE_RATE: f64 = 0.0;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;
pub const DEFAULT_CACHE_DIR: &str = ".cache";
/// Earliest history start year offered to users.
pub const EARLIEST_START_YEAR: i32 = 2000;

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

/// Runtime settings for one engine instance.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Annual risk-free rate used in the Sharpe objective.
    pub risk_free_rate: f64,
    /// Whole-request budget for price retrieval.
    pub fetch_timeout: Duration,
    /// Maximum symbols fetched at once.
    pub fetch_concurrency: usize,
    pub cache_dir: PathBuf,
    pub data_provider: DataProviderMode,
    pub weight_basis: WeightBasis,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: DEFAULT_RISK_FREE_RATE,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            data_provider: DataProviderMode::Yahoo,
            weight_basis: WeightBasis::Snapshot,
        }
    }
}

impl EngineConfig {
    /// Reads `OPTIFOLIO_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let risk_free_rate = lookup("OPTIFOLIO_RISK_FREE_RATE")
            .and_then(|v| parse_or_warn::<f64>("OPTIFOLIO_RISK_FREE_RATE", &v))
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(-1.0, 1.0))
            .unwrap_or(defaults.risk_free_rate);

        let fetch_timeout = lookup("OPTIFOLIO_FETCH_TIMEOUT_SECS")
            .and_then(|v| parse_or_warn::<u64>("OPTIFOLIO_FETCH_TIMEOUT_SECS", &v))
            .map(|v| Duration::from_secs(v.clamp(1, 600)))
            .unwrap_or(defaults.fetch_timeout);

        let fetch_concurrency = lookup("OPTIFOLIO_FETCH_CONCURRENCY")
            .and_then(|v| parse_or_warn::<usize>("OPTIFOLIO_FETCH_CONCURRENCY", &v))
            .map(|v| v.clamp(1, 32))
            .unwrap_or(defaults.fetch_concurrency);

        let cache_dir = lookup("OPTIFOLIO_CACHE_DIR")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let data_provider = lookup("OPTIFOLIO_DATA_PROVIDER")
            .map(|v| DataProviderMode::parse_or_default(&v))
            .unwrap_or(defaults.data_provider);

        let weight_basis = lookup("OPTIFOLIO_WEIGHT_BASIS")
            .map(|v| WeightBasis::parse_or_default(&v))
            .unwrap_or(defaults.weight_basis);

        Self {
            risk_free_rate,
            fetch_timeout,
            fetch_concurrency,
            cache_dir,
            data_provider,
            weight_basis,
        }
    }
}

fn parse_or_warn<T: std::str::FromStr>(name: &str, raw: &str) -> Option<T> {
    let trimmed = raw.trim();
    match trimmed.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparsable {}={} ; using default", name, trimmed);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_env_empty() {
        let cfg = EngineConfig::from_lookup(|_| None);
        assert_eq!(cfg.risk_free_rate, 0.0);
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS));
        assert_eq!(cfg.fetch_concurrency, DEFAULT_FETCH_CONCURRENCY);
        assert_eq!(cfg.data_provider, DataProviderMode::Yahoo);
        assert_eq!(cfg.weight_basis, WeightBasis::Snapshot);
    }

    #[test]
    fn test_env_values_are_parsed_and_clamped() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[
            ("OPTIFOLIO_RISK_FREE_RATE", " 0.02 "),
            ("OPTIFOLIO_FETCH_TIMEOUT_SECS", "100000"),
            ("OPTIFOLIO_FETCH_CONCURRENCY", "0"),
            ("OPTIFOLIO_CACHE_DIR", "/tmp/prices"),
            ("OPTIFOLIO_DATA_PROVIDER", "synthetic"),
            ("OPTIFOLIO_WEIGHT_BASIS", "latest-close"),
        ]));
        assert_eq!(cfg.risk_free_rate, 0.02);
        assert_eq!(cfg.fetch_timeout, Duration::from_secs(600));
        assert_eq!(cfg.fetch_concurrency, 1);
        assert_eq!(cfg.cache_dir, PathBuf::from("/tmp/prices"));
        assert_eq!(cfg.data_provider, DataProviderMode::Synthetic);
        assert_eq!(cfg.weight_basis, WeightBasis::LatestClose);
    }

    #[test]
    fn test_garbage_values_fall_back_to_defaults() {
        let cfg = EngineConfig::from_lookup(lookup_from(&[
            ("OPTIFOLIO_RISK_FREE_RATE", "abc"),
            ("OPTIFOLIO_FETCH_CONCURRENCY", "-3"),
            ("OPTIFOLIO_DATA_PROVIDER", "bloomberg"),
        ]));
        assert_eq!(cfg.risk_free_rate, DEFAULT_RISK_FREE_RATE);
        assert_eq!(cfg.fetch_concurrency, DEFAULT_FETCH_CONCURRENCY);
        assert_eq!(cfg.data_provider, DataProviderMode::Yahoo);
    }
}
