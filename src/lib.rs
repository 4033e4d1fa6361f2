//! Streaming client for TradingView's websocket market-data dialect: framed
//! `~m~N~m~` messages carrying JSON envelopes over separate quote and chart
//! sessions. The facade in [`client`] produces typed candles, quote snapshots
//! and raw envelopes; everything below it (codec, transport, handshake,
//! demultiplexer) is public for integration and debugging use.

pub mod client;
pub mod config;
pub mod demux;
pub mod errors;
pub mod frame;
pub mod handshake;
pub mod models;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod validate;

pub use client::{CandleStream, OhlcvClient, QuoteStream, RawStream};
pub use config::StreamConfig;
pub use demux::TvEvent;
pub use errors::StreamError;
pub use models::{Candle, QuoteSnapshot, SeriesUpdate};
