use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        RawQuery, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle, time::timeout};
use tv_market_stream::{frame, Candle, OhlcvClient, StreamConfig, StreamError};

#[derive(Clone)]
struct MockUpstreamState {
    connection_count: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
    script_trigger: &'static str,
    script: Arc<Vec<String>>,
    rejected_symbol: Option<&'static str>,
    transient_failures: Arc<AtomicUsize>,
}

impl MockUpstreamState {
    fn new(script_trigger: &'static str, script: Vec<String>) -> Self {
        Self {
            connection_count: Arc::new(AtomicUsize::new(0)),
            received: Arc::new(Mutex::new(Vec::new())),
            script_trigger,
            script: Arc::new(script),
            rejected_symbol: None,
            transient_failures: Arc::new(AtomicUsize::new(0)),
        }
    }
}

async fn spawn_server(state: MockUpstreamState) -> (String, oneshot::Sender<()>, JoinHandle<()>) {
    let app = Router::new()
        .route("/ws", get(upstream_ws_route))
        .route("/symbol", get(symbol_lookup_route))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener should expose address");
    let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_receiver.await;
            })
            .await
            .expect("server should run");
    });

    (format!("127.0.0.1:{}", addr.port()), shutdown_sender, task)
}

async fn upstream_ws_route(
    ws: WebSocketUpgrade,
    State(state): State<MockUpstreamState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| upstream_ws_handler(socket, state))
}

async fn upstream_ws_handler(mut socket: WebSocket, state: MockUpstreamState) {
    state.connection_count.fetch_add(1, Ordering::SeqCst);
    let mut script_sent = false;

    while let Some(message) = socket.recv().await {
        let Ok(message) = message else {
            break;
        };

        match message {
            AxumWsMessage::Text(text) => {
                state
                    .received
                    .lock()
                    .expect("received log should not be poisoned")
                    .push(text.to_string());

                if !script_sent && contains_method(&text, state.script_trigger) {
                    script_sent = true;
                    for payload in state.script.iter() {
                        let framed = frame::encode(payload);
                        if socket.send(AxumWsMessage::Text(framed.into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
            AxumWsMessage::Close(_) => break,
            _ => {}
        }
    }
}

fn contains_method(raw_message: &str, method: &str) -> bool {
    let Ok(frames) = frame::split_frames(raw_message) else {
        return false;
    };

    frames.iter().any(|payload| {
        serde_json::from_str::<Value>(payload)
            .ok()
            .and_then(|value| value.get("m").and_then(Value::as_str).map(ToString::to_string))
            .is_some_and(|m| m == method)
    })
}

async fn symbol_lookup_route(
    RawQuery(query): RawQuery,
    State(state): State<MockUpstreamState>,
) -> impl IntoResponse {
    if state
        .transient_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
            remaining.checked_sub(1)
        })
        .is_ok()
    {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    let query = query.unwrap_or_default();
    match state.rejected_symbol {
        Some(rejected) if query.contains(rejected) => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    }
}

fn test_config(bind: &str) -> StreamConfig {
    let mut config = StreamConfig::default();
    config.ws_url = format!("ws://{bind}/ws");
    config.symbol_lookup_url = format!("http://{bind}/symbol?symbol={{symbol}}");
    config.validator_base_delay = Duration::from_millis(10);
    config.close_timeout = Duration::from_millis(500);
    config
}

fn series_payload(method: &str, bars: &[(i64, f64)]) -> String {
    let items: Vec<Value> = bars
        .iter()
        .enumerate()
        .map(|(index, (timestamp, close))| {
            json!({
                "i": index,
                "v": [*timestamp, close - 0.5, close + 1.0, close - 1.0, *close, 42.0]
            })
        })
        .collect();

    json!({
        "m": method,
        "p": ["cs_mock", { "sds_1": { "s": items } }]
    })
    .to_string()
}

fn recorded_methods(state: &MockUpstreamState) -> Vec<String> {
    let received = state
        .received
        .lock()
        .expect("received log should not be poisoned");

    received
        .iter()
        .flat_map(|raw| {
            frame::split_frames(raw)
                .expect("client frames should be well formed")
                .into_iter()
                .filter_map(|payload| {
                    serde_json::from_str::<Value>(payload).ok().and_then(|value| {
                        value
                            .get("m")
                            .and_then(Value::as_str)
                            .map(ToString::to_string)
                    })
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

fn timestamps(candles: &[Candle]) -> Vec<i64> {
    candles.iter().map(|candle| candle.timestamp).collect()
}

#[tokio::test]
async fn historical_fetch_returns_sorted_backfill_and_stops_at_completion() {
    let script = vec![
        series_payload("timescale_update", &[(300, 3.0), (100, 1.0), (200, 2.0)]),
        json!({ "m": "series_completed", "p": ["cs_mock", "sds_1"] }).to_string(),
        series_payload("du", &[(400, 4.0)]),
    ];
    let state = MockUpstreamState::new("create_study", script);
    let (bind, shutdown, task) = spawn_server(state.clone()).await;

    let client = OhlcvClient::with_config(test_config(&bind)).expect("client should build");
    let candles = client
        .fetch_historical_candles("BINANCE:BTCUSDT", "1", 10)
        .await
        .expect("historical fetch should succeed");

    assert_eq!(timestamps(&candles), vec![100, 200, 300]);

    let expected_prefix = vec![
        "set_auth_token",
        "set_locale",
        "chart_create_session",
        "quote_create_session",
        "quote_set_fields",
        "quote_hibernate_all",
        "quote_add_symbols",
        "resolve_symbol",
        "create_series",
        "quote_fast_symbols",
        "create_study",
        "quote_hibernate_all",
    ];

    // The final hibernate may still be in flight when the fetch returns.
    let methods = timeout(Duration::from_secs(3), async {
        loop {
            let methods = recorded_methods(&state);
            if methods.len() >= expected_prefix.len() {
                return methods;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("every handshake message should reach the server");

    assert_eq!(&methods[..expected_prefix.len()], expected_prefix.as_slice());

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn candle_stream_yields_backfill_then_live_updates() {
    let script = vec![
        series_payload("timescale_update", &[(300, 3.0), (100, 1.0), (200, 2.0)]),
        json!({ "m": "series_completed", "p": ["cs_mock", "sds_1"] }).to_string(),
        series_payload("du", &[(400, 4.0)]),
    ];
    let state = MockUpstreamState::new("create_study", script);
    let (bind, shutdown, task) = spawn_server(state).await;

    let client = OhlcvClient::with_config(test_config(&bind)).expect("client should build");
    let mut stream = client
        .stream_candles("BINANCE:BTCUSDT", "1", 10)
        .await
        .expect("candle stream should open");

    let mut seen = Vec::new();
    for _ in 0..4 {
        let candle = timeout(Duration::from_secs(3), stream.next())
            .await
            .expect("stream should produce a candle in time")
            .expect("stream should not be exhausted")
            .expect("candle should not be an error");
        seen.push(candle.timestamp);
    }

    assert_eq!(seen, vec![100, 200, 300, 400]);

    stream.close().await;
    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn heartbeats_are_echoed_verbatim_and_never_surfaced() {
    let script = vec![
        "~h~1".to_string(),
        series_payload("du", &[(500, 5.0)]),
    ];
    let state = MockUpstreamState::new("create_study", script);
    let (bind, shutdown, task) = spawn_server(state.clone()).await;

    let client = OhlcvClient::with_config(test_config(&bind)).expect("client should build");
    let mut stream = client
        .stream_raw("BINANCE:BTCUSDT", "1", 10)
        .await
        .expect("raw stream should open");

    // The first envelope after the handshake must be the du, not the
    // heartbeat that preceded it.
    let envelope = timeout(Duration::from_secs(3), stream.next())
        .await
        .expect("raw stream should produce an envelope in time")
        .expect("raw stream should not be exhausted")
        .expect("envelope should not be an error");
    assert_eq!(envelope.get("m").and_then(Value::as_str), Some("du"));

    let echoed = timeout(Duration::from_secs(3), async {
        loop {
            {
                let received = state
                    .received
                    .lock()
                    .expect("received log should not be poisoned");
                if received.iter().any(|raw| raw == "~m~4~m~~h~1") {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(echoed.is_ok(), "heartbeat echo should reach the server");

    stream.close().await;
    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn protocol_error_terminates_the_stream() {
    let script = vec![json!({
        "m": "protocol_error",
        "p": ["critical_error", "wrong data format"]
    })
    .to_string()];
    let state = MockUpstreamState::new("create_study", script);
    let (bind, shutdown, task) = spawn_server(state).await;

    let client = OhlcvClient::with_config(test_config(&bind)).expect("client should build");
    let mut stream = client
        .stream_candles("BINANCE:BTCUSDT", "1", 10)
        .await
        .expect("candle stream should open");

    let err = timeout(Duration::from_secs(3), stream.next())
        .await
        .expect("stream should fail in time")
        .expect("stream should not be exhausted")
        .expect_err("protocol_error should surface as an error");

    match err {
        StreamError::Protocol { code, message } => {
            assert_eq!(code, "critical_error");
            assert!(message.contains("wrong data format"));
        }
        other => panic!("expected a protocol error, got {other}"),
    }

    assert!(
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("exhausted stream should answer immediately")
            .is_none(),
        "stream should be exhausted after a terminal error"
    );

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn historical_fetch_without_any_data_reports_no_data() {
    let state = MockUpstreamState::new("create_study", Vec::new());
    let (bind, shutdown, task) = spawn_server(state).await;

    let mut config = test_config(&bind);
    config.historical_timeout = Duration::from_millis(300);

    let client = OhlcvClient::with_config(config).expect("client should build");
    let err = client
        .fetch_historical_candles("BINANCE:BTCUSDT", "1", 10)
        .await
        .expect_err("fetch should time out");

    assert!(matches!(err, StreamError::NoData));

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn historical_fetch_with_partial_data_reports_timeout() {
    let script = vec![series_payload(
        "timescale_update",
        &[(100, 1.0), (200, 2.0)],
    )];
    let state = MockUpstreamState::new("create_study", script);
    let (bind, shutdown, task) = spawn_server(state).await;

    let mut config = test_config(&bind);
    config.historical_timeout = Duration::from_millis(300);

    let client = OhlcvClient::with_config(config).expect("client should build");
    let err = client
        .fetch_historical_candles("BINANCE:BTCUSDT", "1", 10)
        .await
        .expect_err("fetch should time out without series_completed");

    assert!(matches!(err, StreamError::Timeout));

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn rejected_symbol_prevents_the_websocket_dial() {
    let mut state = MockUpstreamState::new("create_study", Vec::new());
    state.rejected_symbol = Some("BADX");
    let (bind, shutdown, task) = spawn_server(state.clone()).await;

    let client = OhlcvClient::with_config(test_config(&bind)).expect("client should build");
    let err = client
        .stream_candles("BADX:NOPE", "1", 10)
        .await
        .expect_err("unknown symbol should be rejected");

    assert!(matches!(err, StreamError::InvalidSymbol(_)));
    assert_eq!(state.connection_count.load(Ordering::SeqCst), 0);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn symbol_lookup_retries_transient_failures() {
    let state = MockUpstreamState::new("create_study", Vec::new());
    state.transient_failures.store(2, Ordering::SeqCst);
    let (bind, shutdown, task) = spawn_server(state.clone()).await;

    let mut config = test_config(&bind);
    config.historical_timeout = Duration::from_millis(300);

    let client = OhlcvClient::with_config(config).expect("client should build");
    let err = client
        .fetch_historical_candles("BINANCE:BTCUSDT", "1", 10)
        .await
        .expect_err("fetch should pass validation and then time out on data");

    // Two 503s then a 200: validation succeeded, so the failure comes from
    // the empty data stream, not from the validator.
    assert!(matches!(err, StreamError::NoData));
    assert_eq!(state.connection_count.load(Ordering::SeqCst), 1);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn quote_stream_projects_qsd_frames() {
    let script = vec![
        json!({ "m": "quote_completed", "p": ["qs_mock", "BINANCE:BTCUSDT"] }).to_string(),
        json!({
            "m": "qsd",
            "p": ["qs_mock", {
                "n": "BINANCE:BTCUSDT",
                "s": "ok",
                "v": { "lp": 43000.5, "ch": 120.5, "chp": 0.28, "volume": 999.0, "lp_time": 1700000000 }
            }]
        })
        .to_string(),
    ];
    let state = MockUpstreamState::new("quote_fast_symbols", script);
    let (bind, shutdown, task) = spawn_server(state).await;

    let client = OhlcvClient::with_config(test_config(&bind)).expect("client should build");
    let mut stream = client
        .stream_quotes("BINANCE:BTCUSDT")
        .await
        .expect("quote stream should open");

    let quote = timeout(Duration::from_secs(3), stream.next())
        .await
        .expect("quote stream should produce a snapshot in time")
        .expect("quote stream should not be exhausted")
        .expect("snapshot should not be an error");

    assert_eq!(quote.symbol, "BINANCE:BTCUSDT");
    assert_eq!(quote.current_price, Some(43000.5));
    assert_eq!(quote.last_trade_time, Some(1700000000));

    stream.close().await;
    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn ticker_stream_batches_quote_subscriptions() {
    let script = vec![json!({
        "m": "qsd",
        "p": ["qs_mock", { "n": "NASDAQ:AAPL", "s": "ok", "v": { "lp": 190.1 } }]
    })
    .to_string()];
    let state = MockUpstreamState::new("quote_hibernate_all", script);
    let (bind, shutdown, task) = spawn_server(state.clone()).await;

    let client = OhlcvClient::with_config(test_config(&bind)).expect("client should build");
    let symbols = vec!["BINANCE:BTCUSDT".to_string(), "NASDAQ:AAPL".to_string()];
    let mut stream = client
        .stream_latest_trade_info(&symbols)
        .await
        .expect("ticker stream should open");

    let envelope = timeout(Duration::from_secs(3), stream.next())
        .await
        .expect("ticker stream should produce an envelope in time")
        .expect("ticker stream should not be exhausted")
        .expect("envelope should not be an error");
    assert_eq!(envelope.get("m").and_then(Value::as_str), Some("qsd"));

    let methods = recorded_methods(&state);
    assert_eq!(
        methods,
        vec![
            "set_auth_token",
            "set_locale",
            "quote_create_session",
            "quote_set_fields",
            "quote_add_symbols",
            "quote_add_symbols",
            "quote_fast_symbols",
            "quote_hibernate_all",
        ]
    );
    assert!(
        !methods.contains(&"chart_create_session".to_string()),
        "ticker form must not create a chart session"
    );

    stream.close().await;
    let _ = shutdown.send(());
    let _ = task.await;
}
