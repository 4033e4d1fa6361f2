use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_WS_URL: &str =
    "wss://data.tradingview.com/socket.io/websocket?from=chart%2FVEPYsueI%2F&type=chart";
const DEFAULT_SYMBOL_LOOKUP_URL: &str =
    "https://scanner.tradingview.com/symbol?symbol={symbol}&fields=market&no_404=false";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 6.3; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/107.0.0.0 Safari/537.36";

/// Tunables for one streaming connection. Every field has a default; the
/// lookup URL keeps a `{symbol}` placeholder filled by the symbol validator.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ws_url: String,
    pub symbol_lookup_url: String,
    pub user_agent: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub close_timeout: Duration,
    pub historical_timeout: Duration,
    pub validator_attempts: u32,
    pub validator_base_delay: Duration,
    pub validator_request_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            symbol_lookup_url: DEFAULT_SYMBOL_LOOKUP_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(10),
            historical_timeout: Duration::from_secs(30),
            validator_attempts: 3,
            validator_base_delay: Duration::from_secs(1),
            validator_request_timeout: Duration::from_secs(10),
        }
    }
}

impl StreamConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("TV_WS_URL") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                config.ws_url = trimmed.to_string();
            }
        }

        if let Ok(value) = std::env::var("TV_SYMBOL_LOOKUP_URL") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                config.symbol_lookup_url = trimmed.to_string();
            }
        }

        if let Ok(value) = std::env::var("TV_USER_AGENT") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                config.user_agent = trimmed.to_string();
            }
        }

        if let Some(value) = env_u64("TV_PING_INTERVAL_SECS")? {
            config.ping_interval = Duration::from_secs(value);
        }
        if let Some(value) = env_u64("TV_PING_TIMEOUT_SECS")? {
            config.ping_timeout = Duration::from_secs(value);
        }
        if let Some(value) = env_u64("TV_CLOSE_TIMEOUT_SECS")? {
            config.close_timeout = Duration::from_secs(value);
        }
        if let Some(value) = env_u64("TV_HISTORICAL_TIMEOUT_SECS")? {
            config.historical_timeout = Duration::from_secs(value);
        }
        if let Some(value) = env_u64("TV_VALIDATOR_ATTEMPTS")? {
            config.validator_attempts = value.max(1) as u32;
        }
        if let Some(value) = env_u64("TV_VALIDATOR_BASE_DELAY_MS")? {
            config.validator_base_delay = Duration::from_millis(value);
        }
        if let Some(value) = env_u64("TV_VALIDATOR_REQUEST_TIMEOUT_SECS")? {
            config.validator_request_timeout = Duration::from_secs(value);
        }

        Ok(config)
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => {
            let parsed = value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid {name} value: {value}"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_contract() {
        let config = StreamConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.ping_timeout, Duration::from_secs(10));
        assert_eq!(config.close_timeout, Duration::from_secs(10));
        assert_eq!(config.historical_timeout, Duration::from_secs(30));
        assert_eq!(config.validator_attempts, 3);
        assert_eq!(config.validator_base_delay, Duration::from_secs(1));
        assert!(config.ws_url.starts_with("wss://"));
        assert!(config.symbol_lookup_url.contains("{symbol}"));
    }
}
