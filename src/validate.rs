use reqwest::{redirect, StatusCode};
use tokio::time::sleep;

use crate::{config::StreamConfig, errors::StreamError};

/// Validates the interval grammar: minutes ("1".."1440"), seconds ("1S".."60S"),
/// hours ("1H".."168H"), days ("D", "1D".."365D"), weeks ("W", "1W".."52W"),
/// months ("M", "1M".."12M"). Case-sensitive, no leading zeros.
pub fn validate_interval(interval: &str) -> Result<(), StreamError> {
    if interval.is_empty() {
        return Err(StreamError::InvalidInterval(
            "interval cannot be empty".to_string(),
        ));
    }

    if interval.bytes().all(|byte| byte.is_ascii_digit()) {
        return check_clause(interval, interval, None, 1440, "minute", "1", "1440");
    }

    if let Some(digits) = interval.strip_suffix('S') {
        return check_clause(interval, digits, None, 60, "second", "1S", "60S");
    }
    if let Some(digits) = interval.strip_suffix('H') {
        return check_clause(interval, digits, None, 168, "hour", "1H", "168H");
    }
    if let Some(digits) = interval.strip_suffix('D') {
        return check_clause(interval, digits, Some(1), 365, "day", "D", "365D");
    }
    if let Some(digits) = interval.strip_suffix('W') {
        return check_clause(interval, digits, Some(1), 52, "week", "W", "52W");
    }
    if let Some(digits) = interval.strip_suffix('M') {
        return check_clause(interval, digits, Some(1), 12, "month", "M", "12M");
    }

    Err(StreamError::InvalidInterval(format!(
        "unrecognized interval `{interval}`; expected minutes (1, 5, 240), seconds (15S), \
         hours (4H), days (D, 2D), weeks (W, 2W) or months (M, 6M)"
    )))
}

fn check_clause(
    interval: &str,
    digits: &str,
    default_when_empty: Option<u32>,
    max: u32,
    unit: &str,
    min_form: &str,
    max_form: &str,
) -> Result<(), StreamError> {
    let value = match parse_count(digits, default_when_empty) {
        Some(value) => value,
        None => {
            return Err(StreamError::InvalidInterval(format!(
                "`{interval}` is not a valid {unit} interval; expected {min_form} to {max_form}"
            )));
        }
    };

    if value < 1 || value > max {
        return Err(StreamError::InvalidInterval(format!(
            "{unit} interval `{interval}` is out of range; expected {min_form} to {max_form}"
        )));
    }

    Ok(())
}

fn parse_count(digits: &str, default_when_empty: Option<u32>) -> Option<u32> {
    if digits.is_empty() {
        return default_when_empty;
    }
    if !digits.as_bytes()[0].is_ascii_digit() || digits.as_bytes()[0] == b'0' {
        return None;
    }
    if !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// HTTP client used for symbol lookups. Redirects stay visible because a 301
/// from the lookup endpoint already confirms the symbol.
pub fn build_lookup_client(config: &StreamConfig) -> Result<reqwest::Client, StreamError> {
    reqwest::Client::builder()
        .timeout(config.validator_request_timeout)
        .user_agent(config.user_agent.clone())
        .redirect(redirect::Policy::none())
        .build()
        .map_err(|err| StreamError::Transport(format!("failed to build lookup client: {err}")))
}

/// Confirms the upstream knows the symbol before any websocket is dialed.
/// 200/301 accept, 404 rejects, anything else is retried with exponential
/// backoff until the attempt budget runs out.
pub async fn validate_symbol(
    client: &reqwest::Client,
    config: &StreamConfig,
    symbol: &str,
) -> Result<(), StreamError> {
    let trimmed = symbol.trim();
    if trimmed.is_empty() {
        return Err(StreamError::InvalidSymbol(
            "symbol cannot be empty".to_string(),
        ));
    }
    if let Some((exchange, name)) = trimmed.split_once(':') {
        if exchange.is_empty() || name.is_empty() {
            return Err(StreamError::InvalidSymbol(format!(
                "invalid symbol `{symbol}`; expected EXCHANGE:SYMBOL"
            )));
        }
    }

    let url = config
        .symbol_lookup_url
        .replace("{symbol}", &trimmed.replace(':', "%3A"));

    let mut delay = config.validator_base_delay;
    let attempts = config.validator_attempts.max(1);

    for attempt in 1..=attempts {
        match client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                if status == StatusCode::OK || status == StatusCode::MOVED_PERMANENTLY {
                    tracing::debug!(symbol = %trimmed, "symbol accepted by lookup");
                    return Ok(());
                }
                if status == StatusCode::NOT_FOUND {
                    return Err(StreamError::InvalidSymbol(format!(
                        "symbol `{trimmed}` is not known upstream"
                    )));
                }
                tracing::warn!(
                    symbol = %trimmed,
                    status = %status,
                    attempt,
                    "symbol lookup returned a transient status"
                );
            }
            Err(err) => {
                tracing::warn!(symbol = %trimmed, error = %err, attempt, "symbol lookup failed");
            }
        }

        if attempt < attempts {
            sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }

    Err(StreamError::Transport(format!(
        "symbol lookup for `{trimmed}` failed after {attempts} attempts"
    )))
}

/// Multi-symbol validation; accepted only when every symbol passes.
pub async fn validate_symbols(
    client: &reqwest::Client,
    config: &StreamConfig,
    symbols: &[String],
) -> Result<(), StreamError> {
    if symbols.is_empty() {
        return Err(StreamError::InvalidSymbol(
            "at least one symbol is required".to_string(),
        ));
    }

    for symbol in symbols {
        validate_symbol(client, config, symbol).await?;
    }

    Ok(())
}
