//! WebSocket transport for the push channel.
//!
//! Thin wrapper around `tokio-tungstenite` that hides the stream generics
//! behind a [`WsWriter`]/[`WsReader`] pair suitable for `tokio::select!`
//! loops, plus the URL handling for the token-parameterized push address.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio_tungstenite::tungstenite;

use crate::constants::PUSH_TOKEN_PARAM;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    /// Answer a ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    /// Send a close frame and shut the sink.
    pub async fn close(mut self) -> Result<()> {
        if let Err(e) = self.sink.send(tungstenite::Message::Close(None)).await {
            log::debug!("[Push] Close frame not sent: {e}");
        }
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Pongs and raw frames are skipped.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            };
            return Some(Ok(match msg {
                tungstenite::Message::Text(text) => WsMessage::Text(text.to_string()),
                tungstenite::Message::Binary(data) => WsMessage::Binary(data.to_vec()),
                tungstenite::Message::Ping(data) => WsMessage::Ping(data.to_vec()),
                tungstenite::Message::Close(close_frame) => {
                    let (code, reason) = close_frame
                        .map_or((1005, String::new()), |cf| {
                            (cf.code.into(), cf.reason.to_string())
                        });
                    WsMessage::Close { code, reason }
                }
                tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_) => continue,
            }));
        }
    }
}

/// Open a WebSocket to `url` and split it into writer/reader halves.
pub async fn connect(url: &Url) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .with_context(|| format!("WebSocket connect to {} failed", redact(url)))?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Build the push address for `token`.
///
/// `http(s)` schemes become `ws(s)`; the token is appended as the `token`
/// query parameter, URL-encoded.
pub fn push_url(base: &str, token: &str) -> Result<Url> {
    let mut url = Url::parse(&http_to_ws_scheme(base))
        .with_context(|| format!("invalid push URL: {base}"))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        anyhow::bail!("unsupported push URL scheme: {}", url.scheme());
    }
    url.query_pairs_mut().append_pair(PUSH_TOKEN_PARAM, token);
    Ok(url)
}

/// Convert an HTTP(S) URL to WS(S) scheme. `ws://` and `wss://` pass through.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// URL with the token parameter masked, for logs.
pub fn redact(url: &Url) -> String {
    let mut masked = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == PUSH_TOKEN_PARAM { "***".into() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    masked.set_query(None);
    if !pairs.is_empty() {
        masked.query_pairs_mut().extend_pairs(pairs);
    }
    masked.to_string()
}
