use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid interval: {0}")]
    InvalidInterval(String),
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),
    #[error("websocket is not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("server protocol error `{code}`: {message}")]
    Protocol { code: String, message: String },
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("historical request timed out before the series completed")]
    Timeout,
    #[error("historical request produced no data before the timeout")]
    NoData,
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
}
