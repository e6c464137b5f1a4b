//! Typed client for the rust-lightning (LDK server) REST API.
//!
//! Every endpoint is a JSON `POST` below `/v1/`. DTOs keep the daemon's
//! field names and units; converting them is the adapter's job.

use std::time::Duration;

use async_trait::async_trait;
use polar_core::{Error, LightningNode, PendingEvent, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::events::EventSource;
use crate::resolver::{ConnectionConfig, ServiceKind};
use crate::service::ServiceContext;
use crate::transport::{Method, RequestBody};

/// How long `wait_next` may block waiting for an event.
pub const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(300);

/// Generic acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OkResponse {
    /// Whether the daemon accepted the request.
    pub ok: bool,
}

/// Versions of the daemon's API and of the crates it is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    /// REST API version.
    pub api_version: String,
    /// Version of the server crate.
    pub api_crate_version: String,
    /// Version of the embedded LDK node crate.
    pub core_crate_version: String,
}

/// Runtime state of the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Whether the node has started.
    pub is_running: bool,
    /// Whether it accepts inbound peer connections.
    pub is_listening: bool,
    /// Height of the best block the wallet has seen.
    pub best_block_height: u32,
}

/// Identity of the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdResponse {
    /// Hex encoded public key.
    pub node_id: String,
}

/// Addresses the node listens on for peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListeningAddressesResponse {
    /// `host:port` entries.
    pub addresses: Vec<String>,
}

/// A fresh on-chain address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAddressResponse {
    /// Empty when the wallet could not derive one.
    #[serde(default)]
    pub address: String,
}

/// Wallet balances, all in satoshis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancesResponse {
    /// Confirmed and unconfirmed on-chain funds.
    pub total_onchain_balance_sats: u64,
    /// On-chain funds that can be spent now.
    pub spendable_onchain_balance_sats: u64,
    /// On-chain funds held back for anchor channel fee bumps.
    pub total_anchor_channels_reserve_sats: u64,
    /// Our side of every channel.
    pub total_lightning_balance_sats: u64,
}

/// A peer known to the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDetails {
    /// Peer public key.
    pub node_id: String,
    /// `host:port` the peer was reached at.
    pub address: String,
    /// Whether the node reconnects to it after a restart.
    pub is_persisted: bool,
    /// Whether a connection is live right now.
    pub is_connected: bool,
}

/// Body of `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectPeerBody {
    /// Peer public key.
    pub node_id: String,
    /// `host:port`
    pub address: String,
    /// Reconnect after restarts.
    pub persist: bool,
}

/// Body of `open`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelBody {
    /// Counterparty public key.
    pub node_id: String,
    /// `host:port`
    pub address: String,
    /// Channel capacity.
    pub channel_amount_sats: u64,
    /// Initial balance handed to the counterparty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_to_counterparty_msat: Option<u64>,
    /// Announce the channel to the network. Daemon default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announce: Option<bool>,
}

/// Reply to `open`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelResponse {
    /// 16 bytes, hex encoded.
    pub user_channel_id: String,
}

/// Body of `close` and `force_close`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseChannelBody {
    /// Id returned by `open`.
    pub user_channel_id: String,
    /// Public key of the channel's counterparty.
    pub counterparty_node_id: String,
}

/// Body of `receive`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveBody {
    /// Invoice amount.
    pub amount_msat: u64,
    /// Invoice description.
    pub description: String,
    /// Seconds until the invoice expires.
    pub expiry_secs: u32,
}

/// Body of `receive_var`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveVarBody {
    /// Invoice description.
    pub description: String,
    /// Seconds until the invoice expires.
    pub expiry_secs: u32,
}

/// Reply to `receive` and `receive_var`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveResponse {
    /// BOLT11 invoice.
    pub invoice: String,
}

/// Body of `pay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendBody {
    /// BOLT11 invoice.
    pub invoice: String,
}

/// Body of `pay_using_amount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendUsingAmountBody {
    /// Amountless BOLT11 invoice.
    pub invoice: String,
    /// Amount to pay.
    pub amount_msat: u64,
}

/// Extra TLV record attached to a keysend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTlv {
    /// Record type, at least 65536.
    #[serde(rename = "type")]
    pub tlv_type: u64,
    /// Hex encoded value.
    pub value_hex: String,
}

/// Body of `keysend`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysendBody {
    /// Recipient public key.
    pub counterparty_node_id: String,
    /// Amount to send.
    pub amount_msat: u64,
    /// Extra records for the recipient.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_tlvs: Vec<CustomTlv>,
}

/// Reply to the payment calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    /// 32 bytes, hex encoded.
    pub payment_id: String,
}

/// Who pays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentDirection {
    /// Received by this node.
    Inbound,
    /// Sent by this node.
    Outbound,
}

/// Progress of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    /// In flight.
    Pending,
    /// Settled.
    Succeeded,
    /// Given up on.
    Failed,
}

/// How a payment was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentKind {
    /// BOLT11 invoice.
    Bolt11,
    /// BOLT11 invoice paid through a just-in-time channel.
    Bolt11Jit,
    /// BOLT12 offer.
    Bolt12Offer,
    /// BOLT12 refund.
    Bolt12Refund,
    /// Keysend.
    Spontaneous,
    /// On-chain transaction.
    Onchain,
}

/// A payment as tracked by the daemon.
///
/// `preimage` and `counterparty_node_id` are only present on daemon builds
/// that report them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    /// Hex encoded payment id.
    pub id: String,
    /// Inbound or outbound.
    pub direction: PaymentDirection,
    /// Progress of the payment.
    pub status: PaymentStatus,
    /// Amount, absent for amountless payments still pending.
    #[serde(default)]
    pub amount_msat: Option<u64>,
    /// Payment method.
    pub kind: PaymentKind,
    /// Routing fee paid, once known.
    #[serde(default)]
    pub fee_paid_msat: Option<u64>,
    /// Hex encoded preimage, once settled.
    #[serde(default)]
    pub preimage: Option<String>,
    /// The other end of the payment.
    #[serde(default)]
    pub counterparty_node_id: Option<String>,
}

/// Client bound to one rust-lightning node.
pub struct RlnClient {
    ctx: ServiceContext,
    node: LightningNode,
    conn: ConnectionConfig,
}

impl RlnClient {
    /// Resolve `node`'s connection config and bind a client to it.
    pub fn new(ctx: ServiceContext, node: &LightningNode) -> Result<Self> {
        let conn = ctx.connection(ServiceKind::RustLightning, node)?;
        Ok(Self {
            ctx,
            node: node.clone(),
            conn,
        })
    }

    /// The node this client talks to.
    #[must_use]
    pub const fn node(&self) -> &LightningNode {
        &self.node
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        self.post_with_timeout(path, body, None).await
    }

    async fn post_with_timeout<T: DeserializeOwned>(
        &self,
        path: &str,
        body: Value,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let mut request = ServiceContext::request(
            &self.conn,
            Method::Post,
            &format!("/v1/{path}"),
            RequestBody::Json(body),
        );
        request.timeout = timeout;
        let json = self.ctx.send(&self.node, request).await?;
        serde_json::from_value(json.clone())
            .map_err(|e| Error::ResponseShape(format!("{path}: {e}: {json}")))
    }

    async fn post_dto<B: Serialize + Sync, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        self.post(path, serde_json::to_value(body)?).await
    }

    /// Liveness of the API server.
    pub async fn healthz(&self) -> Result<OkResponse> {
        self.post("healthz", json!({})).await
    }

    /// Whether the node has finished starting.
    pub async fn readyz(&self) -> Result<OkResponse> {
        self.post("readyz", json!({})).await
    }

    /// API and crate versions.
    pub async fn version(&self) -> Result<VersionResponse> {
        self.post("version", json!({})).await
    }

    /// Runtime state and best block.
    pub async fn status(&self) -> Result<StatusResponse> {
        self.post("status", json!({})).await
    }

    /// The node's public key.
    pub async fn node_id(&self) -> Result<NodeIdResponse> {
        self.post("node_id", json!({})).await
    }

    /// Addresses peers can reach the node on.
    pub async fn listening_addresses(&self) -> Result<ListeningAddressesResponse> {
        self.post("listening_addresses", json!({})).await
    }

    /// Derive a fresh on-chain address.
    pub async fn new_address(&self) -> Result<NewAddressResponse> {
        self.post("new_address", json!({})).await
    }

    /// Sync the on-chain wallet.
    pub async fn sync(&self) -> Result<OkResponse> {
        self.post("sync", json!({})).await
    }

    /// On-chain and channel balances.
    pub async fn balances(&self) -> Result<BalancesResponse> {
        self.post("balances", json!({})).await
    }

    /// Known peers, connected or not.
    pub async fn peers(&self) -> Result<Vec<PeerDetails>> {
        self.post("listpeers", json!({})).await
    }

    /// Connect to a peer.
    pub async fn connect(&self, body: &ConnectPeerBody) -> Result<OkResponse> {
        self.post_dto("connect", body).await
    }

    /// Open a channel. The funding txid is only reported later, as an event.
    pub async fn open(&self, body: &OpenChannelBody) -> Result<OpenChannelResponse> {
        self.post_dto("open", body).await
    }

    /// Close a channel cooperatively.
    pub async fn close(&self, body: &CloseChannelBody) -> Result<OkResponse> {
        self.post_dto("close", body).await
    }

    /// Broadcast our commitment and close unilaterally.
    pub async fn force_close(&self, body: &CloseChannelBody) -> Result<OkResponse> {
        self.post_dto("force_close", body).await
    }

    /// Create a fixed amount BOLT11 invoice.
    pub async fn receive(&self, body: &ReceiveBody) -> Result<ReceiveResponse> {
        self.post_dto("receive", body).await
    }

    /// Create a variable amount BOLT11 invoice.
    pub async fn receive_var(&self, body: &ReceiveVarBody) -> Result<ReceiveResponse> {
        self.post_dto("receive_var", body).await
    }

    /// Pay a BOLT11 invoice.
    pub async fn send(&self, body: &SendBody) -> Result<SendResponse> {
        self.post_dto("pay", body).await
    }

    /// Pay an amountless BOLT11 invoice.
    pub async fn send_using_amount(&self, body: &SendUsingAmountBody) -> Result<SendResponse> {
        self.post_dto("pay_using_amount", body).await
    }

    /// Spontaneous payment to a public key.
    pub async fn keysend(&self, body: &KeysendBody) -> Result<SendResponse> {
        self.post_dto("keysend", body).await
    }

    /// Look up a payment by id.
    pub async fn get_payment(&self, payment_id: &str) -> Result<PaymentDetails> {
        self.post("payment", json!({ "payment_id": payment_id })).await
    }

    /// Block until the daemon has an event queued and return it.
    pub async fn wait_next(&self) -> Result<PendingEvent> {
        self.post_with_timeout("events/wait_next", json!({}), Some(LONG_POLL_TIMEOUT))
            .await
    }

    /// Acknowledge the event returned by the last `wait_next`.
    pub async fn handled(&self) -> Result<OkResponse> {
        self.post("events/handled", json!({})).await
    }
}

#[async_trait]
impl EventSource for RlnClient {
    async fn wait_next(&self) -> Result<PendingEvent> {
        Self::wait_next(self).await
    }

    async fn handled(&self) -> Result<()> {
        if Self::handled(self).await?.ok {
            Ok(())
        } else {
            Err(Error::protocol("events/handled", "acknowledgment refused"))
        }
    }
}
