use serde_json::Value;

use crate::models::{Candle, QuoteSnapshot, SeriesUpdate};

/// Typed projection of one inbound envelope. Unknown verbs pass through as
/// `Raw` so debugging consumers see everything the server said.
#[derive(Debug, Clone)]
pub enum TvEvent {
    Series {
        historical: bool,
        update: SeriesUpdate,
    },
    Quote(QuoteSnapshot),
    QuoteCompleted {
        symbol: String,
    },
    SeriesLoading,
    SeriesCompleted,
    ProtocolError {
        code: String,
        message: String,
    },
    Raw(Value),
}

pub fn classify(envelope: Value) -> TvEvent {
    let method = envelope
        .get("m")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match method.as_str() {
        "du" => series_event(envelope, false),
        "timescale_update" => series_event(envelope, true),
        "qsd" => quote_event(envelope),
        "quote_completed" => quote_completed_event(envelope),
        "series_loading" => TvEvent::SeriesLoading,
        "series_completed" => TvEvent::SeriesCompleted,
        "protocol_error" => protocol_error_event(&envelope),
        _ => TvEvent::Raw(envelope),
    }
}

fn series_event(envelope: Value, historical: bool) -> TvEvent {
    match series_update(&envelope) {
        Some(update) => TvEvent::Series { historical, update },
        None => TvEvent::Raw(envelope),
    }
}

fn series_update(envelope: &Value) -> Option<SeriesUpdate> {
    let params = envelope.get("p")?.as_array()?;
    let payload = params.get(1)?.as_object()?;
    let session = params
        .first()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut series = Vec::with_capacity(payload.len());
    for (key, entry) in payload {
        let Some(items) = entry.get("s").and_then(Value::as_array) else {
            continue;
        };

        let mut candles: Vec<Candle> = Vec::with_capacity(items.len());
        for item in items {
            let Some(values) = item.get("v").and_then(Value::as_array) else {
                tracing::warn!(series_key = %key, "series item without `v` array, skipping");
                continue;
            };

            match parse_candle(values) {
                Some(candle) => {
                    // Successive items for the same timestamp describe the
                    // forming bar; the latest values win.
                    match candles.last_mut() {
                        Some(last) if last.timestamp == candle.timestamp => *last = candle,
                        _ => candles.push(candle),
                    }
                }
                None => {
                    tracing::warn!(
                        series_key = %key,
                        fields = values.len(),
                        "series item is missing ohlc values, skipping"
                    );
                }
            }
        }

        series.push((key.clone(), candles));
    }

    Some(SeriesUpdate { session, series })
}

fn parse_candle(values: &[Value]) -> Option<Candle> {
    if values.len() < 5 {
        return None;
    }

    Some(Candle {
        timestamp: values[0].as_f64()? as i64,
        open: values[1].as_f64()?,
        high: values[2].as_f64()?,
        low: values[3].as_f64()?,
        close: values[4].as_f64()?,
        volume: values.get(5).and_then(Value::as_f64).unwrap_or(0.0),
    })
}

fn quote_event(envelope: Value) -> TvEvent {
    match quote_snapshot(&envelope) {
        Some(snapshot) => TvEvent::Quote(snapshot),
        None => TvEvent::Raw(envelope),
    }
}

fn quote_snapshot(envelope: &Value) -> Option<QuoteSnapshot> {
    let payload = envelope.get("p")?.as_array()?.get(1)?.as_object()?;

    let symbol = payload
        .get("n")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let fields = payload
        .get("v")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    Some(QuoteSnapshot {
        symbol,
        current_price: fields.get("lp").and_then(Value::as_f64),
        change: fields.get("ch").and_then(Value::as_f64),
        change_percent: fields.get("chp").and_then(Value::as_f64),
        volume: fields.get("volume").and_then(Value::as_f64),
        last_trade_time: fields.get("lp_time").and_then(Value::as_i64),
        fields,
    })
}

fn quote_completed_event(envelope: Value) -> TvEvent {
    let symbol = envelope
        .get("p")
        .and_then(Value::as_array)
        .and_then(|p| p.get(1))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    TvEvent::QuoteCompleted { symbol }
}

/// Extracts code and message when the envelope is a `protocol_error`,
/// without consuming it. Used by the raw stream, which yields every other
/// envelope verbatim.
pub fn protocol_error_parts(envelope: &Value) -> Option<(String, String)> {
    if envelope.get("m").and_then(Value::as_str) != Some("protocol_error") {
        return None;
    }
    match protocol_error_event(envelope) {
        TvEvent::ProtocolError { code, message } => Some((code, message)),
        _ => None,
    }
}

fn protocol_error_event(envelope: &Value) -> TvEvent {
    let params = envelope.get("p").and_then(Value::as_array);

    let code = params
        .and_then(|p| p.first())
        .map(stringify_param)
        .unwrap_or_else(|| "protocol_error".to_string());
    let message = params
        .map(|p| {
            p.iter()
                .map(stringify_param)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|joined| !joined.is_empty())
        .unwrap_or_else(|| code.clone());

    TvEvent::ProtocolError { code, message }
}

fn stringify_param(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
