use async_trait::async_trait;
use serde_json::Value;

use crate::{errors::StreamError, protocol, session};

/// Seam between the subscription driver and the transport; lets the opening
/// sequence run against a recording sink in tests.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, method: &str, params: &[Value]) -> Result<(), StreamError>;
}

/// The two server-side logical sessions multiplexed onto one websocket.
#[derive(Debug, Clone)]
pub struct SessionIds {
    pub chart: String,
    pub quote: String,
}

impl SessionIds {
    pub fn generate() -> Self {
        Self {
            chart: session::generate_session("cs_"),
            quote: session::generate_session("qs_"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub symbol: String,
    pub interval: String,
    pub bar_count: u32,
}

/// The fixed opening sequence, sent once per transport before any data is
/// read. Order matters; the server does not acknowledge individual steps.
pub async fn open_chart_session(
    sink: &dyn MessageSink,
    sessions: &SessionIds,
) -> Result<(), StreamError> {
    send(sink, "set_auth_token", vec![protocol::UNAUTHORIZED_TOKEN.into()]).await?;
    send(sink, "set_locale", vec!["en".into(), "US".into()]).await?;
    send(
        sink,
        "chart_create_session",
        vec![sessions.chart.as_str().into(), "".into()],
    )
    .await?;
    send(
        sink,
        "quote_create_session",
        vec![sessions.quote.as_str().into()],
    )
    .await?;
    send_quote_fields(sink, &sessions.quote).await?;
    hibernate(sink, &sessions.quote).await
}

/// Opening sequence for the multi-symbol ticker form: no chart session.
pub async fn open_quote_session(
    sink: &dyn MessageSink,
    quote_session: &str,
) -> Result<(), StreamError> {
    send(sink, "set_auth_token", vec![protocol::UNAUTHORIZED_TOKEN.into()]).await?;
    send(sink, "set_locale", vec!["en".into(), "US".into()]).await?;
    send(
        sink,
        "quote_create_session",
        vec![quote_session.into()],
    )
    .await?;
    send_quote_fields(sink, quote_session).await
}

/// Registers one candle subscription on both sessions.
pub async fn add_chart_symbol(
    sink: &dyn MessageSink,
    sessions: &SessionIds,
    subscription: &Subscription,
) -> Result<(), StreamError> {
    let spec = protocol::symbol_spec(&subscription.symbol);

    send(
        sink,
        "quote_add_symbols",
        vec![sessions.quote.as_str().into(), spec.as_str().into()],
    )
    .await?;
    send(
        sink,
        "resolve_symbol",
        vec![
            sessions.chart.as_str().into(),
            protocol::SYMBOL_KEY.into(),
            format!("={spec}").into(),
        ],
    )
    .await?;
    send(
        sink,
        "create_series",
        vec![
            sessions.chart.as_str().into(),
            protocol::SERIES_KEY.into(),
            protocol::SERIES_PARENT_KEY.into(),
            protocol::SYMBOL_KEY.into(),
            subscription.interval.as_str().into(),
            subscription.bar_count.into(),
            "".into(),
        ],
    )
    .await?;
    send(
        sink,
        "quote_fast_symbols",
        vec![
            sessions.quote.as_str().into(),
            subscription.symbol.as_str().into(),
        ],
    )
    .await?;
    send(
        sink,
        "create_study",
        vec![
            sessions.chart.as_str().into(),
            protocol::STUDY_KEY.into(),
            protocol::STUDY_KEY.into(),
            protocol::SERIES_KEY.into(),
            protocol::VOLUME_STUDY_ID.into(),
            protocol::volume_study_inputs(),
        ],
    )
    .await?;
    hibernate(sink, &sessions.quote).await
}

/// Quote-only subscription for a single symbol; no chart series is created.
pub async fn add_quote_symbol(
    sink: &dyn MessageSink,
    quote_session: &str,
    symbol: &str,
) -> Result<(), StreamError> {
    let spec = protocol::symbol_spec(symbol);

    send(
        sink,
        "quote_add_symbols",
        vec![quote_session.into(), spec.as_str().into()],
    )
    .await?;
    send(
        sink,
        "quote_fast_symbols",
        vec![quote_session.into(), symbol.into()],
    )
    .await?;
    hibernate(sink, quote_session).await
}

/// Multi-symbol ticker registration: one extended add per symbol, one batched
/// fast-symbols call, one final hibernate.
pub async fn add_ticker_symbols(
    sink: &dyn MessageSink,
    quote_session: &str,
    symbols: &[String],
) -> Result<(), StreamError> {
    for symbol in symbols {
        let spec = protocol::ticker_symbol_spec(symbol);
        send(
            sink,
            "quote_add_symbols",
            vec![quote_session.into(), spec.as_str().into()],
        )
        .await?;
    }

    let mut params: Vec<Value> = Vec::with_capacity(symbols.len() + 1);
    params.push(quote_session.into());
    params.extend(symbols.iter().map(|symbol| Value::from(symbol.as_str())));
    send(sink, "quote_fast_symbols", params).await?;

    hibernate(sink, quote_session).await
}

async fn send_quote_fields(
    sink: &dyn MessageSink,
    quote_session: &str,
) -> Result<(), StreamError> {
    let mut params: Vec<Value> = Vec::with_capacity(protocol::QUOTE_FIELDS.len() + 1);
    params.push(quote_session.into());
    params.extend(protocol::QUOTE_FIELDS.iter().map(|field| Value::from(*field)));
    send(sink, "quote_set_fields", params).await
}

async fn hibernate(sink: &dyn MessageSink, quote_session: &str) -> Result<(), StreamError> {
    send(sink, "quote_hibernate_all", vec![quote_session.into()]).await
}

/// Any send failure inside the sequences is fatal for the transport.
async fn send(
    sink: &dyn MessageSink,
    method: &str,
    params: Vec<Value>,
) -> Result<(), StreamError> {
    sink.send(method, &params).await.map_err(|err| match err {
        StreamError::HandshakeFailed(_) => err,
        other => StreamError::HandshakeFailed(format!("{method}: {other}")),
    })
}
