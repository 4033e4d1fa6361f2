use std::{env, time::Duration};

use anyhow::Context;
use tokio::time::sleep;
use tracing_subscriber::{fmt, EnvFilter};
use tv_market_stream::{OhlcvClient, StreamConfig};

const USAGE: &str = r#"Usage:
  cargo run --bin candle_stream -- <mode> [options]

Modes:
  candles      Stream live candles (historical backfill first)
  quotes       Stream quote snapshots
  history      Fetch the historical backfill and exit

Options:
  --symbol <EXCHANGE:SYMBOL>   Symbol to subscribe (default: BINANCE:BTCUSDT)
  --interval <interval>        Bar interval, e.g. 1, 15S, 4H, D (default: 1)
  --bars <count>               Historical bars to request (default: 10)
  --ws-url <url>               Websocket endpoint override
  --duration-secs <secs>       Stop after this duration
  --iterations <count>         Stop after this many updates

Examples:
  cargo run --bin candle_stream -- candles --symbol BINANCE:ETHUSDT --interval 5
  cargo run --bin candle_stream -- history --symbol NASDAQ:AAPL --interval D --bars 100
  cargo run --bin candle_stream -- quotes --symbol FX_IDC:EURUSD --iterations 20
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Candles,
    Quotes,
    History,
}

#[derive(Debug, Clone)]
struct Args {
    mode: Mode,
    symbol: String,
    interval: String,
    bars: u32,
    ws_url: Option<String>,
    duration_secs: Option<u64>,
    iterations: Option<u64>,
}

fn parse_args(args: &[String]) -> Result<Option<Args>, String> {
    let Some(mode_arg) = args.first() else {
        return Err("missing mode".to_string());
    };

    let mode = match mode_arg.as_str() {
        "candles" => Mode::Candles,
        "quotes" => Mode::Quotes,
        "history" => Mode::History,
        "--help" | "-h" | "help" => return Ok(None),
        other => return Err(format!("unknown mode `{other}`")),
    };

    let mut parsed = Args {
        mode,
        symbol: "BINANCE:BTCUSDT".to_string(),
        interval: "1".to_string(),
        bars: 10,
        ws_url: None,
        duration_secs: None,
        iterations: None,
    };

    let mut rest = args[1..].iter();
    while let Some(flag) = rest.next() {
        let mut value_for = |name: &str| {
            rest.next()
                .cloned()
                .ok_or_else(|| format!("{name} requires a value"))
        };

        match flag.as_str() {
            "--symbol" => parsed.symbol = value_for("--symbol")?,
            "--interval" => parsed.interval = value_for("--interval")?,
            "--bars" => {
                parsed.bars = value_for("--bars")?
                    .parse()
                    .map_err(|_| "--bars expects a positive integer".to_string())?;
            }
            "--ws-url" => parsed.ws_url = Some(value_for("--ws-url")?),
            "--duration-secs" => {
                parsed.duration_secs = Some(
                    value_for("--duration-secs")?
                        .parse()
                        .map_err(|_| "--duration-secs expects an integer".to_string())?,
                );
            }
            "--iterations" => {
                parsed.iterations = Some(
                    value_for("--iterations")?
                        .parse()
                        .map_err(|_| "--iterations expects an integer".to_string())?,
                );
            }
            other => return Err(format!("unknown option `{other}`")),
        }
    }

    Ok(Some(parsed))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let raw_args: Vec<String> = env::args().skip(1).collect();
    let args = match parse_args(&raw_args) {
        Ok(Some(args)) => args,
        Ok(None) => {
            print!("{USAGE}");
            return Ok(());
        }
        Err(err) => {
            eprintln!("error: {err}\n");
            print!("{USAGE}");
            std::process::exit(2);
        }
    };

    let mut config = StreamConfig::from_env().context("failed to load configuration")?;
    if let Some(ws_url) = &args.ws_url {
        config.ws_url = ws_url.clone();
    }

    let client = OhlcvClient::with_config(config).context("failed to build client")?;

    match args.mode {
        Mode::History => run_history(&client, &args).await,
        Mode::Candles => run_candles(&client, &args).await,
        Mode::Quotes => run_quotes(&client, &args).await,
    }
}

async fn run_history(client: &OhlcvClient, args: &Args) -> anyhow::Result<()> {
    let candles = client
        .fetch_historical_candles(&args.symbol, &args.interval, args.bars)
        .await
        .context("historical fetch failed")?;

    println!(
        "fetched {} bars for {} @ {}",
        candles.len(),
        args.symbol,
        args.interval
    );
    for candle in &candles {
        println!(
            "{}  o={:.8} h={:.8} l={:.8} c={:.8} v={:.2}",
            candle.datetime().unwrap_or_else(|| candle.timestamp.to_string()),
            candle.open,
            candle.high,
            candle.low,
            candle.close,
            candle.volume
        );
    }

    Ok(())
}

async fn run_candles(client: &OhlcvClient, args: &Args) -> anyhow::Result<()> {
    let mut stream = client
        .stream_candles(&args.symbol, &args.interval, args.bars)
        .await
        .context("failed to open candle stream")?;

    println!(
        "streaming {} @ {} (backfill {} bars)",
        args.symbol, args.interval, args.bars
    );

    let mut seen: u64 = 0;
    let stop_after = args.duration_secs.map(Duration::from_secs);
    let run = async {
        while let Some(update) = stream.next().await {
            let candle = update.context("candle stream failed")?;
            seen += 1;
            println!(
                "bar {}  {}  o={:.8} h={:.8} l={:.8} c={:.8} v={:.2}",
                seen,
                candle.datetime().unwrap_or_else(|| candle.timestamp.to_string()),
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume
            );

            if args.iterations.is_some_and(|limit| seen >= limit) {
                break;
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    match stop_after {
        Some(limit) => {
            tokio::select! {
                result = run => result?,
                _ = sleep(limit) => println!("duration limit reached"),
            }
        }
        None => run.await?,
    }

    Ok(())
}

async fn run_quotes(client: &OhlcvClient, args: &Args) -> anyhow::Result<()> {
    let mut stream = client
        .stream_quotes(&args.symbol)
        .await
        .context("failed to open quote stream")?;

    println!("streaming quotes for {}", args.symbol);

    let mut seen: u64 = 0;
    let stop_after = args.duration_secs.map(Duration::from_secs);
    let run = async {
        while let Some(update) = stream.next().await {
            let quote = update.context("quote stream failed")?;
            seen += 1;
            println!(
                "quote {}  {}  lp={:?} ch={:?} chp={:?} vol={:?}",
                seen,
                quote.symbol,
                quote.current_price,
                quote.change,
                quote.change_percent,
                quote.volume
            );

            if args.iterations.is_some_and(|limit| seen >= limit) {
                break;
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    match stop_after {
        Some(limit) => {
            tokio::select! {
                result = run => result?,
                _ = sleep(limit) => println!("duration limit reached"),
            }
        }
        None => run.await?,
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).init();
}
