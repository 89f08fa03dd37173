use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_QUOTE_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    StrongBuy,
    Buy,
    Hold,
    Unknown,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::StrongBuy => "Strong Buy",
            Recommendation::Buy => "Buy",
            Recommendation::Hold => "Hold",
            Recommendation::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StockRecord {
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
    pub recommendation: Recommendation,
    pub analysis: String,
}

/// Static ticker-to-record table, loaded once at process start.
/// Stands in for a real market-data backend.
#[derive(Debug)]
pub struct StockDataset {
    records: HashMap<&'static str, StockRecord>,
    unknown: StockRecord,
}

impl StockDataset {
    pub fn builtin() -> Self {
        let mut records = HashMap::new();
        records.insert(
            "AAPL",
            StockRecord {
                price: 187.32,
                change: 1.25,
                change_percent: 0.67,
                recommendation: Recommendation::Buy,
                analysis: "Strong fundamentals, consistent growth in services revenue, and \
                           upcoming product launches make AAPL an attractive investment."
                    .to_string(),
            },
        );
        records.insert(
            "MSFT",
            StockRecord {
                price: 415.56,
                change: 2.78,
                change_percent: 0.67,
                recommendation: Recommendation::StrongBuy,
                analysis: "Cloud business growth, AI initiatives, and strong enterprise \
                           presence position MSFT well for continued growth."
                    .to_string(),
            },
        );
        records.insert(
            "TSLA",
            StockRecord {
                price: 177.89,
                change: -3.45,
                change_percent: -1.9,
                recommendation: Recommendation::Hold,
                analysis: "Facing increased competition in the EV market, but strong \
                           innovation pipeline and energy business provide long-term potential."
                    .to_string(),
            },
        );
        records.insert(
            "AMZN",
            StockRecord {
                price: 178.75,
                change: 1.23,
                change_percent: 0.69,
                recommendation: Recommendation::Buy,
                analysis: "AWS growth, retail dominance, and expanding advertising business \
                           create multiple revenue streams with strong growth potential."
                    .to_string(),
            },
        );
        records.insert(
            "GOOGL",
            StockRecord {
                price: 142.65,
                change: 0.87,
                change_percent: 0.61,
                recommendation: Recommendation::Buy,
                analysis: "Search dominance, YouTube growth, and AI initiatives provide \
                           strong competitive advantages and revenue diversification."
                    .to_string(),
            },
        );

        let unknown = StockRecord {
            price: 0.0,
            change: 0.0,
            change_percent: 0.0,
            recommendation: Recommendation::Unknown,
            analysis: "I don't have data for this symbol. Please try a major stock like \
                       AAPL, MSFT, TSLA, AMZN, or GOOGL."
                .to_string(),
        };

        Self { records, unknown }
    }

    /// Case-sensitive exact lookup; misses fall back to the sentinel record.
    pub fn lookup(&self, symbol: &str) -> &StockRecord {
        self.records.get(symbol).unwrap_or(&self.unknown)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.records.contains_key(symbol)
    }
}

/// Dataset plus simulated lookup latency (a placeholder for the remote
/// data source the table will eventually come from).
#[derive(Debug)]
pub struct StockAnalyzer {
    dataset: StockDataset,
    delay: Duration,
}

impl StockAnalyzer {
    pub fn new(dataset: StockDataset, delay: Duration) -> Self {
        Self { dataset, delay }
    }

    /// Delay from QUOTE_DELAY_MS (default 1000ms; 0 disables it).
    pub fn from_env() -> Self {
        let delay_ms = std::env::var("QUOTE_DELAY_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_QUOTE_DELAY_MS);
        Self::new(StockDataset::builtin(), Duration::from_millis(delay_ms))
    }

    pub async fn analyze(&self, symbol: &str) -> &StockRecord {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.dataset.lookup(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_symbols_resolve() {
        let dataset = StockDataset::builtin();
        let aapl = dataset.lookup("AAPL");
        assert_eq!(aapl.price, 187.32);
        assert_eq!(aapl.recommendation, Recommendation::Buy);

        let msft = dataset.lookup("MSFT");
        assert_eq!(msft.recommendation, Recommendation::StrongBuy);
        assert!(dataset.contains("TSLA"));
    }

    #[test]
    fn unknown_symbol_gets_sentinel() {
        let dataset = StockDataset::builtin();
        let rec = dataset.lookup("ZZZZZ");
        assert_eq!(rec.price, 0.0);
        assert_eq!(rec.change, 0.0);
        assert_eq!(rec.recommendation, Recommendation::Unknown);
        assert!(rec.analysis.contains("I don't have data for this symbol"));
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let dataset = StockDataset::builtin();
        assert!(!dataset.contains("aapl"));
        assert_eq!(dataset.lookup("aapl").recommendation, Recommendation::Unknown);
    }

    #[tokio::test]
    async fn analyzer_with_zero_delay_resolves_immediately() {
        let analyzer = StockAnalyzer::new(StockDataset::builtin(), Duration::ZERO);
        let rec = analyzer.analyze("GOOGL").await;
        assert_eq!(rec.price, 142.65);
    }

    #[tokio::test(start_paused = true)]
    async fn analyzer_applies_simulated_delay() {
        let analyzer = StockAnalyzer::new(StockDataset::builtin(), Duration::from_secs(1));
        let started = tokio::time::Instant::now();
        let _ = analyzer.analyze("AMZN").await;
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
