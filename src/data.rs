use crate::error::{EngineError, EngineResult};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, TimeZone, Utc, Weekday};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use rand::prelude::*;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataProviderMode {
    Yahoo,
    Synthetic,
}

impl DataProviderMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yahoo => "yahoo",
            Self::Synthetic => "synthetic",
        }
    }

    pub fn parse_or_default(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "yahoo" | "yfinance" => Self::Yahoo,
            "synthetic" | "mock" => Self::Synthetic,
            other => {
                warn!(
                    "Unknown OPTIFOLIO_DATA_PROVIDER={} ; defaulting to yahoo. Allowed values: yahoo | synthetic",
                    other
                );
                Self::Yahoo
            }
        }
    }
}

/// Raw daily adjusted closes for one symbol, as returned by a provider.
#[derive(Clone, Debug, Default)]
pub struct SymbolHistory {
    pub symbol: String,
    pub points: Vec<(NaiveDate, f64)>,
}

impl SymbolHistory {
    pub fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            points: Vec::new(),
        }
    }
}

/// Adjusted-close prices for several symbols on one shared date index.
///
/// `None` marks dates outside a symbol's observed range. Gaps between its
/// first and last observation are forward-filled when the table is built.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceTable {
    dates: Vec<NaiveDate>,
    symbols: Vec<String>,
    prices: Vec<Vec<Option<f64>>>,
    /// Prices actually reported per symbol, fills excluded.
    observations: Vec<usize>,
}

impl PriceTable {
    /// Aligns per-symbol histories on the union of their dates.
    ///
    /// Symbols without a single usable price are dropped. Symbol order follows
    /// the input order.
    pub fn from_histories(histories: Vec<SymbolHistory>) -> Self {
        let mut kept: Vec<(String, BTreeMap<NaiveDate, f64>)> = Vec::new();

        for history in histories {
            let series: BTreeMap<NaiveDate, f64> = history
                .points
                .into_iter()
                .filter(|(_, price)| price.is_finite() && *price > 0.0)
                .collect();

            if series.is_empty() {
                warn!("{}: no price data in window, dropping symbol", history.symbol);
                continue;
            }
            if kept.iter().any(|(s, _)| *s == history.symbol) {
                warn!("{}: duplicate history ignored", history.symbol);
                continue;
            }
            kept.push((history.symbol, series));
        }

        let dates: Vec<NaiveDate> = kept
            .iter()
            .flat_map(|(_, series)| series.keys().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut symbols = Vec::with_capacity(kept.len());
        let mut prices = Vec::with_capacity(kept.len());
        let mut observations = Vec::with_capacity(kept.len());
        for (symbol, series) in kept {
            // Non-empty, checked above.
            let (Some(&first), Some(&last_seen)) = (series.keys().next(), series.keys().next_back())
            else {
                continue;
            };
            let mut last = None;
            let column = dates
                .iter()
                .map(|date| {
                    if *date < first || *date > last_seen {
                        return None;
                    }
                    let value = series.get(date).copied().or(last);
                    last = value;
                    value
                })
                .collect();
            symbols.push(symbol);
            prices.push(column);
            observations.push(series.len());
        }

        Self {
            dates,
            symbols,
            prices,
            observations,
        }
    }

    /// Builds a table from equal-length columns; non-positive prices become gaps.
    #[cfg(test)]
    pub fn from_columns(dates: Vec<NaiveDate>, columns: Vec<(String, Vec<f64>)>) -> EngineResult<Self> {
        let mut symbols = Vec::with_capacity(columns.len());
        let mut prices: Vec<Vec<Option<f64>>> = Vec::with_capacity(columns.len());
        for (symbol, column) in columns {
            if column.len() != dates.len() {
                return Err(EngineError::DataUnavailable(format!(
                    "{} has {} prices for {} dates",
                    symbol,
                    column.len(),
                    dates.len()
                )));
            }
            symbols.push(symbol);
            prices.push(
                column
                    .into_iter()
                    .map(|p| (p.is_finite() && p > 0.0).then_some(p))
                    .collect(),
            );
        }
        let observations = prices
            .iter()
            .map(|column| column.iter().filter(|p| p.is_some()).count())
            .collect();
        Ok(Self {
            dates,
            symbols,
            prices,
            observations,
        })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty() || self.dates.is_empty()
    }

    pub fn series(&self, symbol: &str) -> Option<&[Option<f64>]> {
        self.symbols
            .iter()
            .position(|s| s == symbol)
            .map(|idx| self.prices[idx].as_slice())
    }

    /// Number of prices the provider actually reported for `symbol`.
    pub fn observations(&self, symbol: &str) -> Option<usize> {
        self.symbols
            .iter()
            .position(|s| s == symbol)
            .map(|idx| self.observations[idx])
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &[Option<f64>])> {
        self.symbols
            .iter()
            .zip(self.prices.iter())
            .map(|(s, p)| (s.as_str(), p.as_slice()))
    }

    /// Most recent available price per symbol.
    pub fn latest_prices(&self) -> HashMap<String, f64> {
        self.columns()
            .filter_map(|(symbol, column)| {
                column
                    .iter()
                    .rev()
                    .find_map(|p| *p)
                    .map(|p| (symbol.to_string(), p))
            })
            .collect()
    }
}

/// Source of daily adjusted-close history.
#[async_trait]
pub trait PriceHistoryProvider: Send + Sync {
    fn id(&self) -> &'static str;

    /// Returns the symbol's history from `start` to today. Unknown symbols come
    /// back with an empty history rather than an error.
    async fn fetch_history(&self, symbol: &str, start: NaiveDate) -> EngineResult<SymbolHistory>;
}

/// Fetches all symbols concurrently and aligns them into one table.
///
/// The whole retrieval shares one timeout; running out of time fails the
/// request with `DataUnavailable`.
pub async fn fetch_price_table(
    provider: &dyn PriceHistoryProvider,
    symbols: &[String],
    start: NaiveDate,
    concurrency: usize,
    timeout: std::time::Duration,
) -> EngineResult<PriceTable> {
    info!(
        "Fetching {} symbol(s) from {} since {} (concurrency={}, timeout={:?})",
        symbols.len(),
        provider.id(),
        start,
        concurrency,
        timeout
    );

    let fetches = stream::iter(symbols.iter())
        .map(|symbol| provider.fetch_history(symbol, start))
        .buffered(concurrency.max(1))
        .try_collect::<Vec<_>>();

    let histories = tokio::time::timeout(timeout, fetches)
        .await
        .map_err(|_| {
            EngineError::DataUnavailable(format!(
                "price retrieval from {} timed out after {:?}",
                provider.id(),
                timeout
            ))
        })??;

    let table = PriceTable::from_histories(histories);
    if table.is_empty() {
        warn!("No price history returned for any of {:?}", symbols);
    }
    info!(
        "Price table ready: {} symbol(s) x {} date(s)",
        table.symbols().len(),
        table.len()
    );
    Ok(table)
}

// ──────────────────────────────────────────────────────────────────────────────
// Yahoo Finance
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Serialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChart {
    result: Option<Vec<YahooResult>>,
    error: Option<YahooChartError>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChartError {
    code: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooResult {
    timestamp: Option<Vec<i64>>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
    adjclose: Option<Vec<YahooAdjClose>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooQuote {
    close: Vec<Option<f64>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooAdjClose {
    adjclose: Vec<Option<f64>>,
}

/// Daily adjusted closes from the Yahoo Finance chart API, cached on disk for a day.
pub struct YahooProvider {
    client: reqwest::Client,
    cache_dir: PathBuf,
    max_attempts: usize,
}

impl YahooProvider {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            cache_dir: cache_dir.into(),
            max_attempts: 3,
        }
    }

    fn cache_file(&self, symbol: &str, start: NaiveDate) -> PathBuf {
        self.cache_dir
            .join(format!("{}_{}.json", symbol, start.format("%Y-%m-%d")))
    }

    async fn load_or_fetch(&self, symbol: &str, start: NaiveDate) -> Result<Option<YahooChartResponse>> {
        if !self.cache_dir.exists() {
            std::fs::create_dir_all(&self.cache_dir)?;
        }
        let cache_file = self.cache_file(symbol, start);

        if cache_file.exists() {
            let modified = std::fs::metadata(&cache_file)?.modified()?;
            let age = std::time::SystemTime::now().duration_since(modified)?;
            if age.as_secs() < 86400 {
                info!("Loading {} from cache...", symbol);
                let file = std::fs::File::open(&cache_file)?;
                let reader = std::io::BufReader::new(file);
                return Ok(Some(serde_json::from_reader(reader)?));
            }
            info!("Cache expired for {}, fetching...", symbol);
        } else {
            info!("Cache miss for {}, fetching...", symbol);
        }

        self.fetch_from_api(symbol, start, &cache_file).await
    }

    async fn fetch_from_api(
        &self,
        symbol: &str,
        start: NaiveDate,
        cache_path: &Path,
    ) -> Result<Option<YahooChartResponse>> {
        let period1 = start
            .and_hms_opt(0, 0, 0)
            .map(|dt| Utc.from_utc_datetime(&dt).timestamp())
            .unwrap_or(0);
        let period2 = Utc::now().timestamp();
        let url = format!(
            "https://query1.finance.yahoo.com/v8/finance/chart/{}?period1={}&period2={}&interval=1d&events=div%2Csplits",
            symbol, period1, period2
        );

        let mut attempts = 0;
        loop {
            attempts += 1;
            let outcome = self
                .client
                .get(&url)
                .header("User-Agent", "Mozilla/5.0")
                .timeout(std::time::Duration::from_secs(15))
                .send()
                .await;

            match outcome {
                Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                    warn!("{}: unknown to Yahoo, treating as empty history", symbol);
                    return Ok(None);
                }
                Ok(resp) => match resp.error_for_status() {
                    Ok(ok_resp) => match ok_resp.json::<YahooChartResponse>().await {
                        Ok(resp_json) => {
                            let file = std::fs::File::create(cache_path)?;
                            let writer = std::io::BufWriter::new(file);
                            serde_json::to_writer(writer, &resp_json)?;
                            return Ok(Some(resp_json));
                        }
                        Err(e) => {
                            if attempts >= self.max_attempts {
                                return Err(e.into());
                            }
                            warn!(
                                "Failed to parse JSON for {} (attempt {}/{}): {}",
                                symbol, attempts, self.max_attempts, e
                            );
                        }
                    },
                    Err(e) => {
                        if attempts >= self.max_attempts {
                            return Err(e.into());
                        }
                        warn!(
                            "Yahoo returned an error status for {} (attempt {}/{}): {}",
                            symbol, attempts, self.max_attempts, e
                        );
                    }
                },
                Err(e) => {
                    if attempts >= self.max_attempts {
                        return Err(e.into());
                    }
                    warn!(
                        "Failed to fetch data for {} (attempt {}/{}): {}",
                        symbol, attempts, self.max_attempts, e
                    );
                }
            }

            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }
    }
}

fn chart_to_history(symbol: &str, response: YahooChartResponse) -> SymbolHistory {
    if let Some(err) = response.chart.error {
        warn!(
            "{}: Yahoo chart error {}: {}",
            symbol,
            err.code.unwrap_or_default(),
            err.description.unwrap_or_default()
        );
        return SymbolHistory::empty(symbol);
    }

    let Some(result) = response.chart.result.and_then(|r| r.into_iter().next()) else {
        return SymbolHistory::empty(symbol);
    };
    let timestamps = result.timestamp.unwrap_or_default();

    // Prefer split/dividend adjusted closes; raw closes only if Yahoo omits them.
    let closes = match result.indicators.adjclose.and_then(|a| a.into_iter().next()) {
        Some(adj) => adj.adjclose,
        None => result
            .indicators
            .quote
            .into_iter()
            .next()
            .map(|q| q.close)
            .unwrap_or_default(),
    };

    let points = timestamps
        .iter()
        .zip(closes)
        .filter_map(|(&ts, close)| {
            let date = Utc.timestamp_opt(ts, 0).single()?.date_naive();
            close.map(|c| (date, c))
        })
        .collect();

    SymbolHistory {
        symbol: symbol.to_string(),
        points,
    }
}

#[async_trait]
impl PriceHistoryProvider for YahooProvider {
    fn id(&self) -> &'static str {
        "yahoo"
    }

    async fn fetch_history(&self, symbol: &str, start: NaiveDate) -> EngineResult<SymbolHistory> {
        let response = self.load_or_fetch(symbol, start).await.map_err(|e| {
            EngineError::DataUnavailable(format!("Yahoo history fetch failed for {}: {}", symbol, e))
        })?;
        let history = match response {
            Some(resp) => chart_to_history(symbol, resp),
            None => SymbolHistory::empty(symbol),
        };
        debug!("{}: {} daily closes from Yahoo", symbol, history.points.len());
        Ok(history)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Synthetic data
// ──────────────────────────────────────────────────────────────────────────────

/// Offline provider producing deterministic geometric-Brownian price paths.
///
/// Each symbol gets its own drift and volatility derived from the seed and the
/// symbol name, so repeated runs see identical prices.
pub struct SyntheticProvider {
    seed: u64,
    end: NaiveDate,
}

impl SyntheticProvider {
    pub fn new(seed: u64) -> Self {
        Self::with_end(seed, Utc::now().date_naive())
    }

    pub fn with_end(seed: u64, end: NaiveDate) -> Self {
        Self { seed, end }
    }

    fn symbol_seed(&self, symbol: &str) -> u64 {
        // FNV-1a; std's hasher is randomized per process.
        symbol.bytes().fold(0xcbf2_9ce4_8422_2325_u64 ^ self.seed, |acc, b| {
            (acc ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        })
    }

    pub fn generate(&self, symbol: &str, start: NaiveDate) -> SymbolHistory {
        if symbol.trim().is_empty() || start > self.end {
            return SymbolHistory::empty(symbol);
        }

        let mut rng = StdRng::seed_from_u64(self.symbol_seed(symbol));
        let annual_drift: f64 = rng.gen_range(-0.05..0.25);
        let annual_vol: f64 = rng.gen_range(0.15..0.45);
        let daily_drift = annual_drift / 252.0;
        let daily_vol = annual_vol / 252.0_f64.sqrt();
        let Ok(shock) = Normal::new(0.0, 1.0) else {
            return SymbolHistory::empty(symbol);
        };

        let mut price: f64 = rng.gen_range(20.0..400.0);
        let mut points = Vec::new();
        let mut date = start;
        while date <= self.end {
            if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
                points.push((date, price));
                let z: f64 = shock.sample(&mut rng);
                price *= ((daily_drift - 0.5 * daily_vol * daily_vol) + daily_vol * z).exp();
            }
            date += Duration::days(1);
        }

        SymbolHistory {
            symbol: symbol.to_string(),
            points,
        }
    }
}

#[async_trait]
impl PriceHistoryProvider for SyntheticProvider {
    fn id(&self) -> &'static str {
        "synthetic"
    }

    async fn fetch_history(&self, symbol: &str, start: NaiveDate) -> EngineResult<SymbolHistory> {
        Ok(self.generate(symbol, start))
    }
}

pub fn build_provider(mode: DataProviderMode, cache_dir: &Path) -> Box<dyn PriceHistoryProvider> {
    match mode {
        DataProviderMode::Yahoo => Box::new(YahooProvider::new(cache_dir)),
        DataProviderMode::Synthetic => Box::new(SyntheticProvider::new(42)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_alignment_forward_fills_and_drops_empty() {
        let histories = vec![
            SymbolHistory {
                symbol: "AAA".into(),
                points: vec![(d(2024, 1, 2), 10.0), (d(2024, 1, 4), 12.0)],
            },
            SymbolHistory::empty("ZZZ"),
            SymbolHistory {
                symbol: "BBB".into(),
                points: vec![(d(2024, 1, 3), 5.0), (d(2024, 1, 4), f64::NAN)],
            },
        ];

        let table = PriceTable::from_histories(histories);
        assert_eq!(table.symbols(), &["AAA".to_string(), "BBB".to_string()]);
        assert_eq!(table.dates(), &[d(2024, 1, 2), d(2024, 1, 3), d(2024, 1, 4)]);
        assert_eq!(table.series("AAA").unwrap(), &[Some(10.0), Some(10.0), Some(12.0)]);
        // no fill past the last real price
        assert_eq!(table.series("BBB").unwrap(), &[None, Some(5.0), None]);
        assert_eq!(table.observations("AAA"), Some(2));
        assert_eq!(table.observations("BBB"), Some(1));
        assert!(table.series("ZZZ").is_none());

        let latest = table.latest_prices();
        assert_eq!(latest["AAA"], 12.0);
        assert_eq!(latest["BBB"], 5.0);
    }

    #[test]
    fn test_single_price_symbol_keeps_one_observation() {
        let start = d(2024, 1, 1);
        let histories = vec![
            SymbolHistory {
                symbol: "A".into(),
                points: (0..30)
                    .map(|i| (start + chrono::Duration::days(i), 100.0 + i as f64))
                    .collect(),
            },
            SymbolHistory {
                symbol: "DELISTED".into(),
                points: vec![(start, 50.0)],
            },
        ];

        let table = PriceTable::from_histories(histories);
        assert_eq!(table.len(), 30);
        assert_eq!(table.observations("A"), Some(30));
        assert_eq!(table.observations("DELISTED"), Some(1));
        let delisted = table.series("DELISTED").unwrap();
        assert_eq!(delisted[0], Some(50.0));
        assert!(delisted[1..].iter().all(Option::is_none));
        assert_eq!(table.latest_prices()["DELISTED"], 50.0);
    }

    #[test]
    fn test_from_columns_rejects_ragged_input() {
        let dates = vec![d(2024, 1, 2), d(2024, 1, 3)];
        let err = PriceTable::from_columns(dates, vec![("AAA".into(), vec![1.0])]).unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable(_)));
    }

    #[test]
    fn test_chart_prefers_adjusted_close() {
        let body = r#"{"chart":{"result":[{"timestamp":[1704205800,1704292200],
            "indicators":{"quote":[{"close":[100.0,101.0]}],"adjclose":[{"adjclose":[99.0,null]}]}}],"error":null}}"#;
        let response: YahooChartResponse = serde_json::from_str(body).unwrap();
        let history = chart_to_history("AAPL", response);
        assert_eq!(history.points.len(), 1);
        assert_eq!(history.points[0].1, 99.0);
    }

    #[test]
    fn test_chart_error_yields_empty_history() {
        let body = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;
        let response: YahooChartResponse = serde_json::from_str(body).unwrap();
        assert!(chart_to_history("NOPE", response).points.is_empty());
    }

    #[test]
    fn test_synthetic_is_deterministic_and_skips_weekends() {
        let provider = SyntheticProvider::with_end(7, d(2024, 3, 29));
        let a = provider.generate("MSFT", d(2024, 1, 1));
        let b = provider.generate("MSFT", d(2024, 1, 1));
        assert_eq!(a.points, b.points);
        assert!(a.points.iter().all(|(date, p)| {
            !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && *p > 0.0
        }));
        assert_ne!(a.points, provider.generate("AAPL", d(2024, 1, 1)).points);
    }

    struct SlowProvider;

    #[async_trait]
    impl PriceHistoryProvider for SlowProvider {
        fn id(&self) -> &'static str {
            "slow"
        }

        async fn fetch_history(&self, symbol: &str, _start: NaiveDate) -> EngineResult<SymbolHistory> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(SymbolHistory::empty(symbol))
        }
    }

    #[tokio::test]
    async fn test_fetch_timeout_is_data_unavailable() {
        let symbols = vec!["AAA".to_string()];
        let err = fetch_price_table(
            &SlowProvider,
            &symbols,
            d(2024, 1, 1),
            2,
            std::time::Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable(_)));
    }

    #[tokio::test]
    async fn test_fetch_keeps_requested_symbol_order() {
        let provider = SyntheticProvider::with_end(1, d(2024, 2, 1));
        let symbols = vec!["QQQ".to_string(), "AAPL".to_string(), "MSFT".to_string()];
        let table = fetch_price_table(
            &provider,
            &symbols,
            d(2024, 1, 1),
            3,
            std::time::Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(table.symbols(), symbols.as_slice());
        assert!(table.len() > 2);
    }
}
