use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        watch, Mutex,
    },
    task::JoinHandle,
    time::{interval_at, sleep_until, timeout, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::{config::StreamConfig, errors::StreamError, frame, handshake::MessageSink, protocol};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Owns one upstream websocket: a single serialized writer, a receive task
/// that strips heartbeats and decodes envelopes, and an idempotent close.
#[derive(Debug)]
pub struct Transport {
    writer: Arc<Mutex<WsSink>>,
    envelopes: UnboundedReceiver<Result<Value, StreamError>>,
    shutdown: watch::Sender<bool>,
    receiver_task: Option<JoinHandle<()>>,
    close_timeout: Duration,
}

impl Transport {
    pub async fn connect(config: &StreamConfig) -> Result<Self, StreamError> {
        let mut request = config
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|err| StreamError::Transport(format!("invalid websocket url: {err}")))?;

        let user_agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|err| StreamError::Transport(format!("invalid user agent: {err}")))?;

        let headers = request.headers_mut();
        headers.insert("Origin", HeaderValue::from_static("https://www.tradingview.com"));
        headers.insert("User-Agent", user_agent);
        headers.insert(
            "Accept-Encoding",
            HeaderValue::from_static("gzip, deflate, br, zstd"),
        );
        headers.insert(
            "Accept-Language",
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
        headers.insert("Pragma", HeaderValue::from_static("no-cache"));

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|err| StreamError::Transport(format!("websocket dial failed: {err}")))?;

        tracing::debug!(url = %config.ws_url, "websocket connected");

        let (sink, source) = stream.split();
        let writer = Arc::new(Mutex::new(sink));
        let (envelope_sender, envelopes) = unbounded_channel();
        let (shutdown, shutdown_receiver) = watch::channel(false);

        let receiver_task = tokio::spawn(run_receive_loop(
            source,
            writer.clone(),
            envelope_sender,
            shutdown_receiver,
            config.ping_interval,
            config.ping_timeout,
        ));

        Ok(Self {
            writer,
            envelopes,
            shutdown,
            receiver_task: Some(receiver_task),
            close_timeout: config.close_timeout,
        })
    }

    /// Frames and writes one envelope. Concurrent callers are serialized by
    /// the writer lock, so outbound frame order equals completed-send order.
    pub async fn send(&self, method: &str, params: &[Value]) -> Result<(), StreamError> {
        if *self.shutdown.borrow() {
            return Err(StreamError::NotConnected);
        }

        let framed = frame::encode(&protocol::build_message(method, params));
        self.writer
            .lock()
            .await
            .send(Message::Text(framed.into()))
            .await
            .map_err(|err| StreamError::Transport(format!("send failed: {err}")))
    }

    /// Next decoded inbound envelope. Heartbeats never surface here; a
    /// terminal error is yielded once, after which the stream is exhausted.
    pub async fn next_envelope(&mut self) -> Option<Result<Value, StreamError>> {
        self.envelopes.recv().await
    }

    /// Idempotent shutdown: stops the receive task, sends a best-effort close
    /// frame, and releases the socket within the close grace period.
    pub async fn close(&mut self) {
        let was_closed = self.shutdown.send_replace(true);

        if !was_closed {
            let writer = self.writer.clone();
            let _ = timeout(self.close_timeout, async move {
                let _ = writer.lock().await.send(Message::Close(None)).await;
            })
            .await;
        }

        if let Some(mut task) = self.receiver_task.take() {
            if timeout(self.close_timeout, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.receiver_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl MessageSink for Transport {
    async fn send(&self, method: &str, params: &[Value]) -> Result<(), StreamError> {
        Transport::send(self, method, params).await
    }
}

async fn run_receive_loop(
    mut source: WsSource,
    writer: Arc<Mutex<WsSink>>,
    envelopes: UnboundedSender<Result<Value, StreamError>>,
    mut shutdown: watch::Receiver<bool>,
    ping_interval: Duration,
    ping_timeout: Duration,
) {
    let mut ping_timer = interval_at(Instant::now() + ping_interval, ping_interval);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ping_timer.tick() => {
                if pong_deadline.is_some() {
                    continue;
                }
                if writer.lock().await.send(Message::Ping(Vec::new().into())).await.is_err() {
                    let _ = envelopes.send(Err(StreamError::ConnectionClosed(
                        "keep-alive ping failed to send".to_string(),
                    )));
                    break;
                }
                pong_deadline = Some(Instant::now() + ping_timeout);
            }
            _ = wait_for_deadline(pong_deadline) => {
                let _ = envelopes.send(Err(StreamError::ConnectionClosed(format!(
                    "no pong within {}s",
                    ping_timeout.as_secs()
                ))));
                break;
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if !process_payload(text.as_ref(), &writer, &envelopes).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(binary))) => match std::str::from_utf8(&binary) {
                        Ok(text) => {
                            if !process_payload(text, &writer, &envelopes).await {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "skipping non-utf8 binary frame");
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if writer.lock().await.send(Message::Pong(payload)).await.is_err() {
                            let _ = envelopes.send(Err(StreamError::ConnectionClosed(
                                "pong failed to send".to_string(),
                            )));
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Close(_))) => {
                        let _ = envelopes.send(Err(StreamError::ConnectionClosed(
                            "server closed the websocket".to_string(),
                        )));
                        break;
                    }
                    Some(Err(err)) => {
                        let _ = envelopes.send(Err(StreamError::ConnectionClosed(err.to_string())));
                        break;
                    }
                    None => {
                        let _ = envelopes.send(Err(StreamError::ConnectionClosed(
                            "websocket stream ended".to_string(),
                        )));
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Handles one inbound websocket message: splits frames, echoes heartbeats,
/// forwards JSON envelopes. Returns false when the loop must stop.
async fn process_payload(
    payload: &str,
    writer: &Arc<Mutex<WsSink>>,
    envelopes: &UnboundedSender<Result<Value, StreamError>>,
) -> bool {
    let frames = match frame::split_frames(payload) {
        Ok(frames) => frames,
        Err(err) => {
            tracing::error!(error = %err, payload = %truncate(payload, 120), "malformed inbound frame");
            let _ = envelopes.send(Err(err));
            return false;
        }
    };

    for body in frames {
        if frame::is_heartbeat(body) {
            tracing::trace!(heartbeat = %body, "echoing heartbeat");
            let echo = frame::encode(body);
            if writer
                .lock()
                .await
                .send(Message::Text(echo.into()))
                .await
                .is_err()
            {
                let _ = envelopes.send(Err(StreamError::ConnectionClosed(
                    "heartbeat echo failed to send".to_string(),
                )));
                return false;
            }
            continue;
        }

        match serde_json::from_str::<Value>(body) {
            Ok(envelope) => {
                if envelopes.send(Ok(envelope)).is_err() {
                    // Consumer dropped the stream; nothing left to feed.
                    return false;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, payload = %truncate(body, 120), "skipping non-JSON frame");
            }
        }
    }

    true
}

fn truncate(value: &str, max_len: usize) -> &str {
    if value.len() <= max_len {
        return value;
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
