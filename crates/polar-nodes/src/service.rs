//! The uniform Lightning service contract and the plumbing adapters share.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use polar_core::{
    Balances, Channel, ChannelEvent, ChannelPoint, CloseChannelRequest, Config,
    ConnectPeersReport, Error, InvoiceRequest, LightningNode, NodeAddress, NodeInfo,
    OpenChannelRequest, PayReceipt, PaymentRequest, Peer, PeerUri, Result,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use crate::listener::{ListenerCache, ListenerHandle};
use crate::resolver::{ConnectionConfig, ServiceKind, resolve};
use crate::transport::{HttpRequest, HttpTransport, Method, RequestBody};
use crate::wire::daemon_error;

/// Times `wait_until_online` asks for node info before giving up.
pub const ONLINE_ATTEMPTS: u32 = 30;

/// Pause between `wait_until_online` attempts.
pub const ONLINE_DELAY: Duration = Duration::from_secs(2);

/// Receives channel notifications pushed by a node.
pub type ChannelEventCallback = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Shared collaborators of every service.
#[derive(Clone)]
pub struct ServiceContext {
    config: Arc<Config>,
    transport: Arc<dyn HttpTransport>,
    listeners: Arc<ListenerCache>,
}

impl ServiceContext {
    /// Bundle the collaborators services are built from.
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn HttpTransport>,
        listeners: Arc<ListenerCache>,
    ) -> Self {
        Self {
            config,
            transport,
            listeners,
        }
    }

    /// Application configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process wide listener cache.
    #[must_use]
    pub const fn listeners(&self) -> &Arc<ListenerCache> {
        &self.listeners
    }

    /// Resolve the connection config `kind` uses for `node`.
    pub fn connection(&self, kind: ServiceKind, node: &LightningNode) -> Result<ConnectionConfig> {
        resolve(kind, node, &self.config)
    }

    /// Build a request for `path` below `conn`'s base URL.
    #[must_use]
    pub fn request(
        conn: &ConnectionConfig,
        method: Method,
        path: &str,
        body: RequestBody,
    ) -> HttpRequest {
        HttpRequest {
            method,
            url: conn.endpoint(path),
            headers: conn.headers.clone(),
            body,
            timeout: None,
            first_message_only: false,
        }
    }

    /// Send `request` for `node` and return the body of a successful reply.
    ///
    /// Error payloads become [`Error::Protocol`].
    pub async fn send(&self, node: &LightningNode, request: HttpRequest) -> Result<Value> {
        debug!(node = %node.name, method = %request.method, url = %request.url, "daemon request");
        let response = self.transport.send(request).await?;
        if let Some(error) = daemon_error(response.status, &response.body) {
            debug!(node = %node.name, status = response.status, %error, "daemon error");
            return Err(error);
        }
        Ok(response.body)
    }

    /// Shorthand for [`Self::request`] followed by [`Self::send`].
    pub async fn call(
        &self,
        node: &LightningNode,
        conn: &ConnectionConfig,
        method: Method,
        path: &str,
        body: RequestBody,
    ) -> Result<Value> {
        self.send(node, Self::request(conn, method, path, body)).await
    }

    /// The cached listener for `node`, connecting to `path` if needed.
    pub async fn listener(
        &self,
        node: &LightningNode,
        conn: &ConnectionConfig,
        path: &str,
        opening_message: Option<String>,
    ) -> Result<Arc<ListenerHandle>> {
        let mut target = conn.stream_target(path, self.config.connect_attempts);
        target.opening_message = opening_message;
        self.listeners.get_listener(node.endpoint_key(), &target).await
    }
}

/// Operations every Lightning daemon adapter provides.
///
/// Each call takes the node it is addressed to. Capabilities a daemon lacks
/// fail with [`Error::Unsupported`] instead of doing nothing.
#[async_trait]
pub trait LightningService: Send + Sync {
    /// Protocol dialect of this service.
    fn kind(&self) -> ServiceKind;

    /// Poll `get_info` until the node answers.
    ///
    /// Configuration and unsupported errors are returned immediately.
    async fn wait_until_online(&self, node: &LightningNode) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=ONLINE_ATTEMPTS {
            match self.get_info(node).await {
                Ok(_) => {
                    info!(node = %node.name, attempt, "node is online");
                    return Ok(());
                }
                Err(e @ (Error::Configuration(_) | Error::Unsupported { .. })) => return Err(e),
                Err(e) => {
                    debug!(node = %node.name, attempt, error = %e, "node not online yet");
                    last_error = Some(e);
                }
            }
            if attempt < ONLINE_ATTEMPTS {
                tokio::time::sleep(ONLINE_DELAY).await;
            }
        }
        Err(Error::Transport(format!(
            "node '{}' did not come online: {}",
            node.name,
            last_error.map_or_else(String::new, |e| e.to_string())
        )))
    }

    /// Identity and sync state.
    async fn get_info(&self, node: &LightningNode) -> Result<NodeInfo>;

    /// On-chain and channel balances in satoshis.
    async fn get_balances(&self, node: &LightningNode) -> Result<Balances>;

    /// A fresh on-chain address. Never empty.
    async fn get_new_address(&self, node: &LightningNode) -> Result<NodeAddress>;

    /// Open and pending channels.
    async fn get_channels(&self, node: &LightningNode) -> Result<Vec<Channel>>;

    /// Currently connected peers only.
    async fn get_peers(&self, node: &LightningNode) -> Result<Vec<Peer>>;

    /// Connect to every `pubkey@host:port` in `rpc_urls`.
    ///
    /// Already connected peers are not an error, and a failing target does
    /// not stop the others.
    async fn connect_peers(
        &self,
        node: &LightningNode,
        rpc_urls: &[String],
    ) -> Result<ConnectPeersReport>;

    /// Connect to the counterparty if needed, then open a channel to it.
    async fn open_channel(
        &self,
        from: &LightningNode,
        request: &OpenChannelRequest,
    ) -> Result<ChannelPoint>;

    /// Cooperatively close a channel.
    async fn close_channel(&self, node: &LightningNode, request: &CloseChannelRequest)
    -> Result<()>;

    /// Unilaterally close a channel.
    async fn force_close_channel(
        &self,
        node: &LightningNode,
        request: &CloseChannelRequest,
    ) -> Result<()>;

    /// Create a BOLT11 invoice and return its encoded form.
    async fn create_invoice(&self, node: &LightningNode, request: &InvoiceRequest)
    -> Result<String>;

    /// Pay `invoice`, with `amount` satoshis for amountless invoices.
    async fn pay_invoice(
        &self,
        node: &LightningNode,
        invoice: &str,
        amount: Option<u64>,
    ) -> Result<PayReceipt>;

    /// Decode a BOLT11 invoice.
    async fn decode_invoice(&self, node: &LightningNode, invoice: &str) -> Result<PaymentRequest>;

    /// Open the node's streaming connection.
    async fn add_listener_to_node(&self, node: &LightningNode) -> Result<()>;

    /// Close the node's streaming connection.
    async fn remove_listener(&self, node: &LightningNode) -> Result<()>;

    /// Deliver the node's channel notifications to `callback`.
    async fn subscribe_channel_events(
        &self,
        node: &LightningNode,
        callback: ChannelEventCallback,
    ) -> Result<()>;
}

/// Connect to each of `rpc_urls` that is not already among `connected`.
///
/// `connect` performs one daemon call. A daemon answering that the peer is
/// already connected counts as success.
pub async fn connect_each<F, Fut>(
    node: &LightningNode,
    connected: &[Peer],
    rpc_urls: &[String],
    mut connect: F,
) -> ConnectPeersReport
where
    F: FnMut(PeerUri) -> Fut + Send,
    Fut: Future<Output = Result<()>> + Send,
{
    let mut report = ConnectPeersReport::default();

    for rpc_url in rpc_urls {
        let uri: PeerUri = match rpc_url.parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(node = %node.name, peer = %rpc_url, error = %e, "skipping peer");
                report.failed.push((rpc_url.clone(), e.to_string()));
                continue;
            }
        };

        if connected.iter().any(|peer| peer.pubkey == uri.pubkey) {
            report.already_connected.push(uri.pubkey);
            continue;
        }

        let pubkey = uri.pubkey.clone();
        match connect(uri).await {
            Ok(()) => {
                info!(node = %node.name, peer = %pubkey, "connected to peer");
                report.connected.push(pubkey);
            }
            Err(e) if is_already_connected(&e) => report.already_connected.push(pubkey),
            Err(e) => {
                warn!(node = %node.name, peer = %rpc_url, error = %e, "failed to connect to peer");
                report.failed.push((rpc_url.clone(), e.to_string()));
            }
        }
    }

    report
}

fn is_already_connected(error: &Error) -> bool {
    matches!(error, Error::Protocol { message, .. }
        if message.to_ascii_lowercase().contains("already connected"))
}

/// Connect to the counterparty of an open request and return its URI.
///
/// A failed connection is not fatal here: the node may still reach the peer
/// on its own and the open call reports the real problem.
pub async fn prepare_open<S>(
    service: &S,
    from: &LightningNode,
    request: &OpenChannelRequest,
) -> Result<PeerUri>
where
    S: LightningService + ?Sized,
{
    let uri: PeerUri = request.to_rpc_url.parse()?;
    let report = service
        .connect_peers(from, std::slice::from_ref(&request.to_rpc_url))
        .await?;
    if !report.is_complete() {
        warn!(node = %from.name, peer = %uri, "opening channel without a confirmed peer connection");
    }
    Ok(uri)
}

/// Forward channel notifications from a listener to `callback`.
///
/// `parse` maps one raw message to an event; messages it ignores are
/// dropped. The task ends when the listener disconnects.
pub fn forward_channel_events(
    node: &LightningNode,
    listener: &ListenerHandle,
    parse: fn(&str) -> Option<ChannelEvent>,
    callback: ChannelEventCallback,
) -> JoinHandle<()> {
    let name = node.name.clone();
    let mut messages = listener.messages();

    tokio::spawn(async move {
        while let Some(message) = messages.next().await {
            match message {
                Ok(text) => {
                    if let Some(event) = parse(&text) {
                        debug!(node = %name, ?event, "channel event");
                        callback(event);
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(node = %name, skipped, "channel event subscriber lagged");
                }
            }
        }
        debug!(node = %name, "channel event stream ended");
    })
}
