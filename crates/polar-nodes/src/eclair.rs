//! Eclair HTTP API adapter.

use async_trait::async_trait;
use polar_core::{
    Balances, Channel, ChannelEvent, ChannelPoint, CloseChannelRequest, ConnectPeersReport, Error,
    InvoiceRequest, LightningNode, NodeAddress, NodeInfo, OpenChannelRequest, PayReceipt,
    PaymentRequest, Peer, Result,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::resolver::{ConnectionConfig, ServiceKind};
use crate::service::{
    ChannelEventCallback, LightningService, ServiceContext, connect_each, forward_channel_events,
    prepare_open,
};
use crate::transport::{Method, RequestBody};
use crate::wire::{amount_at, count_at, msat_to_sat, required_amount, required_str, str_or_empty};

/// Event stream of the API server.
const EVENTS_PATH: &str = "/ws";

/// Talks to eclair through its HTTP API.
pub struct EclairService {
    ctx: ServiceContext,
}

impl EclairService {
    /// Create the service.
    pub const fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    fn conn(&self, node: &LightningNode) -> Result<ConnectionConfig> {
        self.ctx.connection(ServiceKind::Eclair, node)
    }

    async fn post(&self, node: &LightningNode, path: &str, form: &[(&str, String)]) -> Result<Value> {
        let conn = self.conn(node)?;
        let fields = form
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect();
        self.ctx
            .call(node, &conn, Method::Post, path, RequestBody::Form(fields))
            .await
    }

    async fn channels(&self, node: &LightningNode) -> Result<Vec<Value>> {
        let json = self.post(node, "/channels", &[]).await?;
        match json {
            Value::Array(channels) => Ok(channels),
            other => Err(Error::ResponseShape(format!("expected channel list: {other}"))),
        }
    }

    /// Resolve a `txid:index` channel point to eclair's channel id.
    async fn channel_id(&self, node: &LightningNode, request: &CloseChannelRequest) -> Result<String> {
        if request.funding_outpoint().is_err() {
            return Ok(request.channel_point.clone());
        }
        self.channels(node)
            .await?
            .iter()
            .find(|c| funding_outpoint(c).as_deref() == Some(request.channel_point.as_str()))
            .and_then(|c| c["channelId"].as_str())
            .map(ToString::to_string)
            .ok_or_else(|| {
                Error::InvalidInput(format!("no channel with funding outpoint {}", request.channel_point))
            })
    }

    async fn close(&self, node: &LightningNode, request: &CloseChannelRequest, force: bool) -> Result<()> {
        let channel_id = self.channel_id(node, request).await?;
        let path = if force { "/forceclose" } else { "/close" };
        self.post(node, path, &[("channelId", channel_id.clone())])
            .await?;
        info!(node = %node.name, channel = %channel_id, force, "channel close requested");
        Ok(())
    }
}

#[async_trait]
impl LightningService for EclairService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Eclair
    }

    async fn get_info(&self, node: &LightningNode) -> Result<NodeInfo> {
        let json = self.post(node, "/getinfo", &[]).await?;
        let pubkey = required_str(&json, "/nodeId", "nodeId")?;
        let channels = self.channels(node).await?;
        let count = |states: &[&str]| {
            let n = channels
                .iter()
                .filter(|c| c["state"].as_str().is_some_and(|s| states.contains(&s)))
                .count();
            u32::try_from(n).unwrap_or(u32::MAX)
        };

        Ok(NodeInfo {
            alias: str_or_empty(&json, "/alias"),
            rpc_url: node.p2p_uri(&pubkey),
            synced_to_chain: true,
            block_height: count_at(&json, "/blockHeight"),
            num_active_channels: count(&["NORMAL"]),
            num_pending_channels: count(&["WAIT_FOR_FUNDING_CONFIRMED", "WAIT_FOR_CHANNEL_READY"]),
            num_inactive_channels: count(&["OFFLINE"]),
            pubkey,
        })
    }

    async fn get_balances(&self, node: &LightningNode) -> Result<Balances> {
        let chain = self.post(node, "/onchainbalance", &[]).await?;
        let usable = self.post(node, "/usablebalances", &[]).await?;
        let channel_msat: u64 = usable
            .as_array()
            .into_iter()
            .flatten()
            .map(|b| amount_at(b, "/canSend"))
            .sum();
        let confirmed = amount_at(&chain, "/confirmed");
        let unconfirmed = amount_at(&chain, "/unconfirmed");

        Ok(Balances::from_sats(
            confirmed + unconfirmed,
            confirmed,
            unconfirmed,
            msat_to_sat(channel_msat),
        ))
    }

    async fn get_new_address(&self, node: &LightningNode) -> Result<NodeAddress> {
        let json = self.post(node, "/getnewaddress", &[]).await?;
        match json.as_str().filter(|address| !address.is_empty()) {
            Some(address) => Ok(NodeAddress {
                address: address.to_string(),
            }),
            None => Err(Error::ResponseShape(format!("no address in response: {json}"))),
        }
    }

    async fn get_channels(&self, node: &LightningNode) -> Result<Vec<Channel>> {
        Ok(self
            .channels(node)
            .await?
            .iter()
            .filter_map(|c| {
                let state = c["state"].as_str()?;
                let pending = match state {
                    "NORMAL" | "OFFLINE" | "SHUTDOWN" | "NEGOTIATING" | "CLOSING" => false,
                    "WAIT_FOR_FUNDING_CONFIRMED" | "WAIT_FOR_CHANNEL_READY" => true,
                    _ => return None,
                };
                let commitments = &c["data"]["commitments"];
                let capacity = first_amount(
                    commitments,
                    &["/active/0/fundingTx/amountSatoshis", "/commitInput/amountSatoshis"],
                );
                let local_msat = first_amount(
                    commitments,
                    &["/active/0/localCommit/spec/toLocal", "/localCommit/spec/toLocal"],
                );
                let remote_msat = first_amount(
                    commitments,
                    &["/active/0/localCommit/spec/toRemote", "/localCommit/spec/toRemote"],
                );
                let announced = ["/params/channelFlags/announceChannel", "/channelFlags/announceChannel"]
                    .iter()
                    .find_map(|p| commitments.pointer(p).and_then(Value::as_bool))
                    .unwrap_or(true);

                Some(Channel {
                    pending,
                    uniq_id: str_or_empty(c, "/channelId"),
                    channel_point: funding_outpoint(c).unwrap_or_default(),
                    pubkey: str_or_empty(c, "/nodeId"),
                    capacity: capacity.to_string(),
                    local_balance: msat_to_sat(local_msat).to_string(),
                    remote_balance: msat_to_sat(remote_msat).to_string(),
                    status: state.to_ascii_lowercase(),
                    is_private: !announced,
                })
            })
            .collect())
    }

    async fn get_peers(&self, node: &LightningNode) -> Result<Vec<Peer>> {
        let json = self.post(node, "/peers", &[]).await?;
        Ok(json
            .as_array()
            .into_iter()
            .flatten()
            .filter(|p| p["state"].as_str() == Some("CONNECTED"))
            .map(|p| Peer {
                pubkey: str_or_empty(p, "/nodeId"),
                address: str_or_empty(p, "/address"),
            })
            .collect())
    }

    async fn connect_peers(
        &self,
        node: &LightningNode,
        rpc_urls: &[String],
    ) -> Result<ConnectPeersReport> {
        let connected = self.get_peers(node).await?;
        Ok(connect_each(node, &connected, rpc_urls, |uri| async move {
            self.post(node, "/connect", &[("uri", uri.to_string())])
                .await
                .map(drop)
        })
        .await)
    }

    async fn open_channel(
        &self,
        from: &LightningNode,
        request: &OpenChannelRequest,
    ) -> Result<ChannelPoint> {
        let peer = prepare_open(self, from, request).await?;
        let push_msat = request
            .push_amount
            .unwrap_or(0)
            .checked_mul(1000)
            .ok_or_else(|| Error::InvalidInput("push amount overflows msat".into()))?;
        let reply = self
            .post(
                from,
                "/open",
                &[
                    ("nodeId", peer.pubkey),
                    ("fundingSatoshis", request.amount.to_string()),
                    ("pushMsat", push_msat.to_string()),
                    ("announceChannel", (!request.is_private).to_string()),
                ],
            )
            .await?;

        // "created channel <id> with fundingTxId=<txid> and fees=<sats> sat"
        let text = reply.as_str().unwrap_or_default();
        let channel_id = text
            .strip_prefix("created channel ")
            .and_then(|rest| rest.split_whitespace().next())
            .ok_or_else(|| Error::ResponseShape(format!("unexpected open response: {reply}")))?
            .to_string();

        let channel = self
            .post(from, "/channel", &[("channelId", channel_id.clone())])
            .await?;
        match funding_outpoint(&channel).and_then(|point| {
            let (txid, index) = point.split_once(':')?;
            Some((txid.to_string(), index.parse().ok()?))
        }) {
            Some((txid, output_index)) => Ok(ChannelPoint::Funded { txid, output_index }),
            None => {
                debug!(node = %from.name, channel = %channel_id, "funding outpoint not known yet");
                Ok(ChannelPoint::Incomplete { channel_id })
            }
        }
    }

    async fn close_channel(&self, node: &LightningNode, request: &CloseChannelRequest) -> Result<()> {
        self.close(node, request, false).await
    }

    async fn force_close_channel(
        &self,
        node: &LightningNode,
        request: &CloseChannelRequest,
    ) -> Result<()> {
        self.close(node, request, true).await
    }

    async fn create_invoice(&self, node: &LightningNode, request: &InvoiceRequest) -> Result<String> {
        let expiry = request
            .expiry_secs
            .unwrap_or(self.ctx.config().invoice_expiry_secs);
        let json = self
            .post(
                node,
                "/createinvoice",
                &[
                    ("amountMsat", request.amount_msat()?.to_string()),
                    ("description", request.description_for(node)),
                    ("expireIn", expiry.to_string()),
                ],
            )
            .await?;
        required_str(&json, "/serialized", "serialized invoice")
    }

    async fn pay_invoice(
        &self,
        node: &LightningNode,
        invoice: &str,
        amount: Option<u64>,
    ) -> Result<PayReceipt> {
        let mut form = vec![("invoice", invoice.to_string()), ("blocking", "true".to_string())];
        if let Some(amount) = amount {
            let msat = amount
                .checked_mul(1000)
                .ok_or_else(|| Error::InvalidInput("amount overflows msat".into()))?;
            form.push(("amountMsat", msat.to_string()));
        }
        let json = self.post(node, "/payinvoice", &form).await?;
        if json["type"].as_str() == Some("payment-failed") {
            let reason = json
                .pointer("/failures/0/t")
                .and_then(Value::as_str)
                .unwrap_or("payment failed");
            return Err(Error::protocol("payment-failed", reason));
        }

        Ok(PayReceipt {
            preimage: required_str(&json, "/paymentPreimage", "payment preimage")?,
            amount: msat_to_sat(required_amount(&json, "/recipientAmount", "recipient amount")?),
            destination: required_str(&json, "/recipientNodeId", "recipient node id")?,
        })
    }

    async fn decode_invoice(&self, node: &LightningNode, invoice: &str) -> Result<PaymentRequest> {
        let json = self
            .post(node, "/parseinvoice", &[("invoice", invoice.to_string())])
            .await?;

        Ok(PaymentRequest {
            payment_hash: required_str(&json, "/paymentHash", "paymentHash")?,
            amount_msat: amount_at(&json, "/amount"),
            expiry: amount_at(&json, "/expiry"),
            destination: required_str(&json, "/nodeId", "nodeId")?,
            description: json["description"].as_str().map(ToString::to_string),
        })
    }

    async fn add_listener_to_node(&self, node: &LightningNode) -> Result<()> {
        let conn = self.conn(node)?;
        self.ctx.listener(node, &conn, EVENTS_PATH, None).await.map(drop)
    }

    async fn remove_listener(&self, node: &LightningNode) -> Result<()> {
        self.ctx.listeners().remove_listener(node.endpoint_key()).await;
        Ok(())
    }

    async fn subscribe_channel_events(
        &self,
        node: &LightningNode,
        callback: ChannelEventCallback,
    ) -> Result<()> {
        let conn = self.conn(node)?;
        let listener = self.ctx.listener(node, &conn, EVENTS_PATH, None).await?;
        forward_channel_events(node, &listener, parse_channel_event, callback);
        Ok(())
    }
}

/// `txid:index` of a channel entry, across eclair versions.
fn funding_outpoint(channel: &Value) -> Option<String> {
    let commitments = &channel["data"]["commitments"];
    ["/active/0/fundingTx/outPoint", "/commitInput/outPoint"]
        .iter()
        .find_map(|p| commitments.pointer(p).and_then(Value::as_str))
        .filter(|point| !point.is_empty())
        .map(ToString::to_string)
}

fn first_amount(json: &Value, pointers: &[&str]) -> u64 {
    pointers
        .iter()
        .find(|p| json.pointer(p).is_some())
        .map_or(0, |p| amount_at(json, p))
}

/// Map one message of the event stream. Non-channel events are ignored.
pub fn parse_channel_event(message: &str) -> Option<ChannelEvent> {
    let json: Value = serde_json::from_str(message).ok()?;
    match json["type"].as_str()? {
        "channel-created" => Some(ChannelEvent::Pending),
        "channel-opened" => Some(ChannelEvent::Open),
        "channel-closed" => Some(ChannelEvent::Closed),
        "channel-state-changed" => Some(ChannelEvent::Unknown),
        _ => None,
    }
}
