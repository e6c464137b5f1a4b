//! Long-lived streaming connections to daemons.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use polar_core::{Error, Result};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
};
use tracing::{debug, info, warn};

/// Buffered messages per connection before slow subscribers lag.
const MESSAGE_BUFFER: usize = 256;

/// Pause between connection attempts.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Where and how to open a streaming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    /// `ws://` or `wss://` URL.
    pub url: String,
    /// Extra headers carrying auth material.
    pub headers: BTreeMap<String, String>,
    /// Connection attempts before giving up.
    pub attempts: u32,
    /// Text frame sent right after connecting, e.g. a streaming request body.
    pub opening_message: Option<String>,
}

/// An open streaming connection.
pub trait StreamConnection: Send + Sync {
    /// Receive text messages arriving after this call.
    fn subscribe(&self) -> broadcast::Receiver<String>;

    /// Whether the underlying connection is still open.
    fn is_connected(&self) -> bool;

    /// Close the connection and release its resources. Idempotent.
    fn disconnect(&self);
}

/// Opens streaming connections.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Connect to `target`, trying at most `target.attempts` times.
    async fn connect(&self, target: &StreamTarget) -> Result<Box<dyn StreamConnection>>;
}

/// [`StreamConnector`] speaking WebSocket.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    fn request(target: &StreamTarget) -> Result<Request<()>> {
        let mut request = target
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Configuration(format!("invalid stream url {}: {e}", target.url)))?;
        for (name, value) in &target.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Configuration(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Configuration(format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }

    fn tls() -> Result<Connector> {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| Error::Transport(format!("failed to create TLS connector: {e}")))?;
        Ok(Connector::NativeTls(tls))
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, target: &StreamTarget) -> Result<Box<dyn StreamConnection>> {
        let attempts = target.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            let request = Self::request(target)?;
            match connect_async_tls_with_config(request, None, false, Some(Self::tls()?)).await {
                Ok((mut socket, _response)) => {
                    info!(url = %target.url, attempt, "stream connected");
                    if let Some(message) = &target.opening_message {
                        socket
                            .send(Message::Text(message.clone()))
                            .await
                            .map_err(|e| Error::Transport(format!("{}: {e}", target.url)))?;
                    }
                    return Ok(Box::new(WsConnection::spawn(socket, target.url.clone())));
                }
                Err(e) => {
                    warn!(url = %target.url, attempt, attempts, error = %e, "stream connect failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(Error::Transport(format!(
            "could not connect to {} after {attempts} attempt(s): {last_error}",
            target.url
        )))
    }
}

/// A WebSocket whose frames are read by a background task.
struct WsConnection {
    messages: Mutex<Option<broadcast::Sender<String>>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WsConnection {
    fn spawn(socket: WebSocketStream<MaybeTlsStream<TcpStream>>, url: String) -> Self {
        let (tx, _) = broadcast::channel(MESSAGE_BUFFER);
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let sender = tx.clone();

        let task = tokio::spawn(async move {
            let (mut sink, mut frames) = socket.split();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    frame = frames.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            // No subscribers is fine, messages are fire-and-forget.
                            let _ = sender.send(text);
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            if let Ok(text) = String::from_utf8(bytes) {
                                let _ = sender.send(text);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(%url, error = %e, "stream read failed");
                            break;
                        }
                    }
                }
            }
            debug!(%url, "stream closed");
        });

        Self {
            messages: Mutex::new(Some(tx)),
            shutdown,
            task,
        }
    }
}

impl StreamConnection for WsConnection {
    fn subscribe(&self) -> broadcast::Receiver<String> {
        let guard = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map_or_else(
            || {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            },
            broadcast::Sender::subscribe,
        )
    }

    fn is_connected(&self) -> bool {
        !*self.shutdown.borrow() && !self.task.is_finished()
    }

    fn disconnect(&self) {
        self.shutdown.send_replace(true);
        // Subscriber streams end once the reader task drops its sender too.
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        // A requested shutdown lets the reader send its close frame first.
        if !*self.shutdown.borrow() {
            self.task.abort();
        }
    }
}
