use std::collections::{BTreeMap, VecDeque};

use serde_json::Value;
use tokio::time::{sleep_until, Instant};

use crate::{
    config::StreamConfig,
    demux::{self, TvEvent},
    errors::StreamError,
    handshake::{self, SessionIds, Subscription},
    models::{Candle, QuoteSnapshot},
    protocol, session,
    transport::Transport,
    validate,
};

/// Facade over the streaming pipeline. Every call owns its transport: one
/// websocket, one writer, one demux loop, released when the stream is dropped.
pub struct OhlcvClient {
    config: StreamConfig,
    lookup_client: reqwest::Client,
}

impl OhlcvClient {
    pub fn new() -> Result<Self, StreamError> {
        Self::with_config(StreamConfig::default())
    }

    pub fn with_config(config: StreamConfig) -> Result<Self, StreamError> {
        let lookup_client = validate::build_lookup_client(&config)?;
        Ok(Self {
            config,
            lookup_client,
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Live candle stream: the historical backfill first in timestamp order,
    /// then live updates as they arrive. Bars repeating a timestamp replace
    /// the previous values (the forming bar).
    pub async fn stream_candles(
        &self,
        symbol: &str,
        interval: &str,
        bar_count: u32,
    ) -> Result<CandleStream, StreamError> {
        validate::validate_interval(interval)?;
        validate::validate_symbol(&self.lookup_client, &self.config, symbol).await?;

        let mut transport = Transport::connect(&self.config).await?;
        let sessions = SessionIds::generate();
        let subscription = Subscription {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            bar_count,
        };

        let opened = async {
            handshake::open_chart_session(&transport, &sessions).await?;
            handshake::add_chart_symbol(&transport, &sessions, &subscription).await
        }
        .await;

        if let Err(err) = opened {
            transport.close().await;
            return Err(err);
        }

        Ok(CandleStream {
            transport,
            backfill: BTreeMap::new(),
            collecting_backfill: true,
            pending: VecDeque::new(),
            done: false,
        })
    }

    /// Collects the backfill for one subscription: drains the stream until the
    /// first `series_completed` with at least one bar, bounded by the
    /// historical timeout. The result is ascending and timestamp-unique.
    pub async fn fetch_historical_candles(
        &self,
        symbol: &str,
        interval: &str,
        bar_count: u32,
    ) -> Result<Vec<Candle>, StreamError> {
        validate::validate_interval(interval)?;
        validate::validate_symbol(&self.lookup_client, &self.config, symbol).await?;

        let mut transport = Transport::connect(&self.config).await?;
        let deadline = Instant::now() + self.config.historical_timeout;
        let sessions = SessionIds::generate();
        let subscription = Subscription {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            bar_count,
        };

        let opened = async {
            handshake::open_chart_session(&transport, &sessions).await?;
            handshake::add_chart_symbol(&transport, &sessions, &subscription).await
        }
        .await;

        if let Err(err) = opened {
            transport.close().await;
            return Err(err);
        }

        let mut collected: BTreeMap<i64, Candle> = BTreeMap::new();
        let mut completed = false;

        let outcome = loop {
            if completed && !collected.is_empty() {
                break Ok(());
            }

            let envelope = tokio::select! {
                _ = sleep_until(deadline) => {
                    break Err(if collected.is_empty() {
                        StreamError::NoData
                    } else {
                        StreamError::Timeout
                    });
                }
                envelope = transport.next_envelope() => envelope,
            };

            match envelope {
                Some(Ok(value)) => match demux::classify(value) {
                    TvEvent::Series { update, .. } => {
                        for candle in update.bars_for(protocol::SERIES_KEY) {
                            collected.insert(candle.timestamp, *candle);
                        }
                    }
                    TvEvent::SeriesCompleted => completed = true,
                    TvEvent::ProtocolError { code, message } => {
                        break Err(StreamError::Protocol { code, message });
                    }
                    _ => {}
                },
                Some(Err(err)) => break Err(err),
                None => {
                    break Err(StreamError::ConnectionClosed(
                        "stream ended before the series completed".to_string(),
                    ));
                }
            }
        };

        transport.close().await;
        outcome.map(|_| collected.into_values().collect())
    }

    /// Quote snapshots for one symbol; no chart series is consumed.
    pub async fn stream_quotes(&self, symbol: &str) -> Result<QuoteStream, StreamError> {
        validate::validate_symbol(&self.lookup_client, &self.config, symbol).await?;

        let mut transport = Transport::connect(&self.config).await?;
        let sessions = SessionIds::generate();

        let opened = async {
            handshake::open_chart_session(&transport, &sessions).await?;
            handshake::add_quote_symbol(&transport, &sessions.quote, symbol).await
        }
        .await;

        if let Err(err) = opened {
            transport.close().await;
            return Err(err);
        }

        Ok(QuoteStream {
            transport,
            done: false,
        })
    }

    /// Multi-symbol ticker: raw envelopes for a batched quote subscription.
    /// Callers project `qsd` frames themselves, typically via
    /// [`demux::classify`].
    pub async fn stream_latest_trade_info(
        &self,
        symbols: &[String],
    ) -> Result<RawStream, StreamError> {
        validate::validate_symbols(&self.lookup_client, &self.config, symbols).await?;

        let mut transport = Transport::connect(&self.config).await?;
        let quote_session = session::generate_session("qs_");

        let opened = async {
            handshake::open_quote_session(&transport, &quote_session).await?;
            handshake::add_ticker_symbols(&transport, &quote_session, symbols).await
        }
        .await;

        if let Err(err) = opened {
            transport.close().await;
            return Err(err);
        }

        Ok(RawStream {
            transport,
            done: false,
        })
    }

    /// Full candle subscription without projection; every decoded envelope is
    /// yielded. Intended for debugging and integration.
    pub async fn stream_raw(
        &self,
        symbol: &str,
        interval: &str,
        bar_count: u32,
    ) -> Result<RawStream, StreamError> {
        validate::validate_interval(interval)?;
        validate::validate_symbol(&self.lookup_client, &self.config, symbol).await?;

        let mut transport = Transport::connect(&self.config).await?;
        let sessions = SessionIds::generate();
        let subscription = Subscription {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            bar_count,
        };

        let opened = async {
            handshake::open_chart_session(&transport, &sessions).await?;
            handshake::add_chart_symbol(&transport, &sessions, &subscription).await
        }
        .await;

        if let Err(err) = opened {
            transport.close().await;
            return Err(err);
        }

        Ok(RawStream {
            transport,
            done: false,
        })
    }
}

/// Pull-based candle sequence. Dropping the stream tears the transport down.
#[derive(Debug)]
pub struct CandleStream {
    transport: Transport,
    backfill: BTreeMap<i64, Candle>,
    collecting_backfill: bool,
    pending: VecDeque<Candle>,
    done: bool,
}

impl CandleStream {
    /// Next candle, or a terminal error. Returns `None` once exhausted.
    ///
    /// Historical batches accumulate in a timestamp-keyed map until the first
    /// `series_completed` (or the first live update), so the backfill comes
    /// out globally ascending even when the server splits it across several
    /// `timescale_update` envelopes.
    pub async fn next(&mut self) -> Option<Result<Candle, StreamError>> {
        loop {
            if let Some(candle) = self.pending.pop_front() {
                return Some(Ok(candle));
            }
            if self.done {
                return None;
            }

            match self.transport.next_envelope().await {
                Some(Ok(envelope)) => match demux::classify(envelope) {
                    TvEvent::Series { historical, update } => {
                        let batch: Vec<Candle> =
                            update.bars_for(protocol::SERIES_KEY).copied().collect();
                        if historical && self.collecting_backfill {
                            for candle in batch {
                                self.backfill.insert(candle.timestamp, candle);
                            }
                        } else {
                            self.flush_backfill();
                            for candle in batch {
                                push_candle(&mut self.pending, candle);
                            }
                        }
                    }
                    TvEvent::SeriesCompleted => self.flush_backfill(),
                    TvEvent::ProtocolError { code, message } => {
                        return Some(self.fail(StreamError::Protocol { code, message }).await);
                    }
                    _ => {}
                },
                Some(Err(err)) => return Some(self.fail(err).await),
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    pub async fn close(mut self) {
        self.transport.close().await;
    }

    fn flush_backfill(&mut self) {
        if !self.collecting_backfill {
            return;
        }
        self.collecting_backfill = false;
        flush_backfill(&mut self.backfill, &mut self.pending);
    }

    async fn fail(&mut self, err: StreamError) -> Result<Candle, StreamError> {
        self.done = true;
        self.transport.close().await;
        Err(err)
    }
}

/// Pull-based quote snapshot sequence for a single symbol.
pub struct QuoteStream {
    transport: Transport,
    done: bool,
}

impl QuoteStream {
    pub async fn next(&mut self) -> Option<Result<QuoteSnapshot, StreamError>> {
        loop {
            if self.done {
                return None;
            }

            match self.transport.next_envelope().await {
                Some(Ok(envelope)) => match demux::classify(envelope) {
                    TvEvent::Quote(snapshot) => return Some(Ok(snapshot)),
                    TvEvent::QuoteCompleted { symbol } => {
                        tracing::debug!(symbol = %symbol, "quote subscription accepted");
                    }
                    TvEvent::ProtocolError { code, message } => {
                        self.done = true;
                        self.transport.close().await;
                        return Some(Err(StreamError::Protocol { code, message }));
                    }
                    _ => {}
                },
                Some(Err(err)) => {
                    self.done = true;
                    self.transport.close().await;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    pub async fn close(mut self) {
        self.transport.close().await;
    }
}

/// Unprojected envelope sequence; `protocol_error` still terminates it.
pub struct RawStream {
    transport: Transport,
    done: bool,
}

impl RawStream {
    pub async fn next(&mut self) -> Option<Result<Value, StreamError>> {
        if self.done {
            return None;
        }

        match self.transport.next_envelope().await {
            Some(Ok(envelope)) => {
                if let Some((code, message)) = demux::protocol_error_parts(&envelope) {
                    self.done = true;
                    self.transport.close().await;
                    return Some(Err(StreamError::Protocol { code, message }));
                }
                Some(Ok(envelope))
            }
            Some(Err(err)) => {
                self.done = true;
                self.transport.close().await;
                Some(Err(err))
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    pub async fn close(mut self) {
        self.transport.close().await;
    }
}

/// Drains the accumulated backfill map onto the pending queue in ascending
/// timestamp order. Map inserts already made the last received values win.
fn flush_backfill(backfill: &mut BTreeMap<i64, Candle>, pending: &mut VecDeque<Candle>) {
    for (_, candle) in std::mem::take(backfill) {
        push_candle(pending, candle);
    }
}

/// Appends one candle; a repeat of the tail timestamp replaces the tail, which
/// collapses duplicates at the backfill/live boundary before they are yielded.
fn push_candle(pending: &mut VecDeque<Candle>, candle: Candle) {
    match pending.back_mut() {
        Some(last) if last.timestamp == candle.timestamp => *last = candle,
        _ => pending.push_back(candle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(timestamp: i64, close: f64) -> Candle {
        Candle {
            timestamp,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    #[test]
    fn backfill_flushes_globally_sorted_across_batches() {
        let mut backfill = BTreeMap::new();
        for candle in [bar(300, 3.0), bar(100, 1.0)] {
            backfill.insert(candle.timestamp, candle);
        }
        for candle in [bar(250, 2.5), bar(200, 2.0)] {
            backfill.insert(candle.timestamp, candle);
        }

        let mut pending = VecDeque::new();
        flush_backfill(&mut backfill, &mut pending);

        let timestamps: Vec<i64> = pending.iter().map(|candle| candle.timestamp).collect();
        assert_eq!(timestamps, vec![100, 200, 250, 300]);
        assert!(backfill.is_empty());
    }

    #[test]
    fn duplicate_timestamps_keep_last_received_values() {
        let mut backfill = BTreeMap::new();
        for candle in [bar(100, 1.0), bar(200, 2.0), bar(200, 2.5)] {
            backfill.insert(candle.timestamp, candle);
        }

        let mut pending = VecDeque::new();
        flush_backfill(&mut backfill, &mut pending);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].close, 2.5);

        push_candle(&mut pending, bar(200, 2.9));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].close, 2.9);

        push_candle(&mut pending, bar(300, 3.0));
        assert_eq!(pending.len(), 3);
    }
}
