use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// One OHLCV bar. Markets without volume report zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// RFC 3339 rendering of the bar open time, for display.
    pub fn datetime(&self) -> Option<String> {
        chrono::DateTime::<Utc>::from_timestamp(self.timestamp, 0)
            .map(|value| value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

/// Price and metadata snapshot for one symbol from the quote session. The
/// well-known numeric fields are lifted out; everything the server sent stays
/// available in `fields`.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteSnapshot {
    pub symbol: String,
    pub current_price: Option<f64>,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub volume: Option<f64>,
    pub last_trade_time: Option<i64>,
    pub fields: Map<String, Value>,
}

/// Bars extracted from one inbound envelope, grouped per series key in the
/// order the server sent them.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesUpdate {
    pub session: String,
    pub series: Vec<(String, Vec<Candle>)>,
}

impl SeriesUpdate {
    /// Bars belonging to one series key, in arrival order.
    pub fn bars_for<'a>(&'a self, series_key: &'a str) -> impl Iterator<Item = &'a Candle> {
        self.series
            .iter()
            .filter(move |(key, _)| key == series_key)
            .flat_map(|(_, candles)| candles.iter())
    }
}
