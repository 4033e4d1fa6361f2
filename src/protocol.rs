use serde_json::{json, Value};

pub const UNAUTHORIZED_TOKEN: &str = "unauthorized_user_token";

/// Client-chosen keys the server echoes back to tag data belonging to one
/// subscription.
pub const SERIES_KEY: &str = "sds_1";
pub const SERIES_PARENT_KEY: &str = "s1";
pub const SYMBOL_KEY: &str = "sds_sym_1";
pub const STUDY_KEY: &str = "st1";

/// Pinned upstream study id; upstream may bump the version suffix.
pub const VOLUME_STUDY_ID: &str = "Volume@tv-basicstudies-241";

/// The quote-session field set, kept literal for upstream compatibility.
pub const QUOTE_FIELDS: [&str; 28] = [
    "base-currency-logoid",
    "ch",
    "chp",
    "currency-logoid",
    "currency_code",
    "current_session",
    "description",
    "exchange",
    "format",
    "fractional",
    "is_tradable",
    "language",
    "local_description",
    "logoid",
    "lp",
    "lp_time",
    "minmov",
    "minmove2",
    "original_name",
    "pricescale",
    "pro_name",
    "short_name",
    "type",
    "update_mode",
    "volume",
    "ask",
    "bid",
    "fundamentals",
];

/// Builds the compact JSON envelope for one protocol verb. serde_json keeps
/// object keys sorted, which places `m` before `p` as the server expects.
pub fn build_message(method: &str, params: &[Value]) -> String {
    json!({ "m": method, "p": params }).to_string()
}

/// The symbol descriptor embedded (as a JSON string) into `resolve_symbol`
/// and `quote_add_symbols`.
pub fn symbol_spec(symbol: &str) -> String {
    json!({ "adjustment": "splits", "symbol": symbol }).to_string()
}

/// Extended descriptor used by the multi-symbol ticker form.
pub fn ticker_symbol_spec(symbol: &str) -> String {
    json!({
        "adjustment": "splits",
        "currency-id": "USD",
        "session": "regular",
        "symbol": symbol,
    })
    .to_string()
}

/// Inputs for the server-side volume study.
pub fn volume_study_inputs() -> Value {
    json!({ "length": 20, "col_prev_close": "false" })
}
