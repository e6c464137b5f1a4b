//! LND REST adapter, also used for litd nodes.

use async_trait::async_trait;
use polar_core::{
    Balances, Channel, ChannelEvent, ChannelPoint, CloseChannelRequest, ConnectPeersReport, Error,
    InvoiceRequest, LightningNode, NodeAddress, NodeInfo, OpenChannelRequest, PayReceipt,
    PaymentRequest, Peer, Result,
};
use serde_json::{Value, json};
use tracing::info;

use crate::resolver::{ConnectionConfig, ServiceKind};
use crate::service::{
    ChannelEventCallback, LightningService, ServiceContext, connect_each, forward_channel_events,
    prepare_open,
};
use crate::transport::{Method, RequestBody};
use crate::wire::{
    amount_at, base64_to_hex, base64_txid_to_hex, count_at, hex_to_base64, required_str,
    str_or_empty,
};

/// Channel event stream of the REST proxy.
const CHANNEL_EVENTS_PATH: &str = "/v1/channels/subscribe?method=GET";

/// Talks to LND through its REST proxy.
pub struct LndService {
    ctx: ServiceContext,
}

impl LndService {
    /// Create the service.
    pub const fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    fn conn(&self, node: &LightningNode) -> Result<ConnectionConfig> {
        self.ctx.connection(ServiceKind::Lnd, node)
    }

    async fn get(&self, node: &LightningNode, path: &str) -> Result<Value> {
        let conn = self.conn(node)?;
        self.ctx
            .call(node, &conn, Method::Get, path, RequestBody::Empty)
            .await
    }

    async fn post(&self, node: &LightningNode, path: &str, body: Value) -> Result<Value> {
        let conn = self.conn(node)?;
        self.ctx
            .call(node, &conn, Method::Post, path, RequestBody::Json(body))
            .await
    }

    async fn close(&self, node: &LightningNode, request: &CloseChannelRequest, force: bool) -> Result<()> {
        let (txid, index) = request.funding_outpoint()?;
        let conn = self.conn(node)?;
        let path = format!("/v1/channels/{txid}/{index}?force={force}");
        // The close call streams updates until the channel is gone; the first
        // one confirms the close was accepted.
        let mut http = ServiceContext::request(&conn, Method::Delete, &path, RequestBody::Empty);
        http.first_message_only = true;
        self.ctx.send(node, http).await?;
        info!(node = %node.name, channel = %request.channel_point, force, "channel close requested");
        Ok(())
    }
}

#[async_trait]
impl LightningService for LndService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::Lnd
    }

    async fn get_info(&self, node: &LightningNode) -> Result<NodeInfo> {
        let json = self.get(node, "/v1/getinfo").await?;
        let pubkey = required_str(&json, "/identity_pubkey", "identity_pubkey")?;
        let rpc_url = json["uris"]
            .get(0)
            .and_then(Value::as_str)
            .map_or_else(|| node.p2p_uri(&pubkey), ToString::to_string);

        Ok(NodeInfo {
            alias: str_or_empty(&json, "/alias"),
            rpc_url,
            synced_to_chain: json["synced_to_chain"].as_bool().unwrap_or(false),
            block_height: count_at(&json, "/block_height"),
            num_active_channels: count_at(&json, "/num_active_channels"),
            num_pending_channels: count_at(&json, "/num_pending_channels"),
            num_inactive_channels: count_at(&json, "/num_inactive_channels"),
            pubkey,
        })
    }

    async fn get_balances(&self, node: &LightningNode) -> Result<Balances> {
        let chain = self.get(node, "/v1/balance/blockchain").await?;
        let channels = self.get(node, "/v1/balance/channels").await?;
        let channel = match channels.pointer("/local_balance/sat") {
            Some(_) => amount_at(&channels, "/local_balance/sat"),
            None => amount_at(&channels, "/balance"),
        };

        Ok(Balances::from_sats(
            amount_at(&chain, "/total_balance"),
            amount_at(&chain, "/confirmed_balance"),
            amount_at(&chain, "/unconfirmed_balance"),
            channel,
        ))
    }

    async fn get_new_address(&self, node: &LightningNode) -> Result<NodeAddress> {
        let json = self
            .get(node, "/v1/newaddress?type=WITNESS_PUBKEY_HASH")
            .await?;
        Ok(NodeAddress {
            address: required_str(&json, "/address", "address")?,
        })
    }

    async fn get_channels(&self, node: &LightningNode) -> Result<Vec<Channel>> {
        let open = self.get(node, "/v1/channels").await?;
        let pending = self.get(node, "/v1/channels/pending").await?;

        let mut channels: Vec<Channel> = open["channels"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|c| Channel {
                pending: false,
                uniq_id: str_or_empty(c, "/chan_id"),
                channel_point: str_or_empty(c, "/channel_point"),
                pubkey: str_or_empty(c, "/remote_pubkey"),
                capacity: amount_at(c, "/capacity").to_string(),
                local_balance: amount_at(c, "/local_balance").to_string(),
                remote_balance: amount_at(c, "/remote_balance").to_string(),
                status: if c["active"].as_bool().unwrap_or(false) {
                    "open"
                } else {
                    "inactive"
                }
                .to_string(),
                is_private: c["private"].as_bool().unwrap_or(false),
            })
            .collect();

        for (group, status) in [
            ("pending_open_channels", "opening"),
            ("waiting_close_channels", "waiting_close"),
            ("pending_force_closing_channels", "force_closing"),
        ] {
            let entries = pending[group].as_array().into_iter().flatten();
            channels.extend(entries.map(|entry| {
                let c = &entry["channel"];
                let channel_point = str_or_empty(c, "/channel_point");
                Channel {
                    pending: true,
                    uniq_id: channel_point.clone(),
                    channel_point,
                    pubkey: str_or_empty(c, "/remote_node_pub"),
                    capacity: amount_at(c, "/capacity").to_string(),
                    local_balance: amount_at(c, "/local_balance").to_string(),
                    remote_balance: amount_at(c, "/remote_balance").to_string(),
                    status: status.to_string(),
                    is_private: c["private"].as_bool().unwrap_or(false),
                }
            }));
        }

        Ok(channels)
    }

    async fn get_peers(&self, node: &LightningNode) -> Result<Vec<Peer>> {
        // LND only lists peers with a live connection.
        let json = self.get(node, "/v1/peers").await?;
        Ok(json["peers"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|p| Peer {
                pubkey: str_or_empty(p, "/pub_key"),
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
            let body = json!({ "addr": { "pubkey": uri.pubkey, "host": uri.address } });
            self.post(node, "/v1/peers", body).await.map(drop)
        })
        .await)
    }

    async fn open_channel(
        &self,
        from: &LightningNode,
        request: &OpenChannelRequest,
    ) -> Result<ChannelPoint> {
        let peer = prepare_open(self, from, request).await?;
        let body = json!({
            "node_pubkey": hex_to_base64(&peer.pubkey)?,
            "local_funding_amount": request.amount.to_string(),
            "push_sat": request.push_amount.unwrap_or(0).to_string(),
            "private": request.is_private,
        });
        let json = self.post(from, "/v1/channels", body).await?;

        let txid = match json["funding_txid_str"].as_str().filter(|s| !s.is_empty()) {
            Some(txid) => txid.to_string(),
            None => base64_txid_to_hex(&required_str(
                &json,
                "/funding_txid_bytes",
                "funding transaction id",
            )?)?,
        };
        Ok(ChannelPoint::Funded {
            txid,
            output_index: count_at(&json, "/output_index"),
        })
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
        let body = json!({
            "value": request.amount.to_string(),
            "memo": request.description_for(node),
            "expiry": expiry.to_string(),
        });
        let json = self.post(node, "/v1/invoices", body).await?;
        required_str(&json, "/payment_request", "payment_request")
    }

    async fn pay_invoice(
        &self,
        node: &LightningNode,
        invoice: &str,
        amount: Option<u64>,
    ) -> Result<PayReceipt> {
        let mut body = json!({ "payment_request": invoice });
        if let Some(amount) = amount {
            body["amt"] = json!(amount.to_string());
        }
        let json = self.post(node, "/v1/channels/transactions", body).await?;
        if let Some(error) = json["payment_error"].as_str().filter(|e| !e.is_empty()) {
            return Err(Error::protocol("payment_error", error));
        }

        let preimage = base64_to_hex(&required_str(&json, "/payment_preimage", "payment preimage")?)?;
        let route_total = amount_at(&json, "/payment_route/total_amt");
        let fees = amount_at(&json, "/payment_route/total_fees");
        let decoded = self.decode_invoice(node, invoice).await?;

        Ok(PayReceipt {
            preimage,
            amount: route_total.saturating_sub(fees),
            destination: decoded.destination,
        })
    }

    async fn decode_invoice(&self, node: &LightningNode, invoice: &str) -> Result<PaymentRequest> {
        let json = self.get(node, &format!("/v1/payreq/{invoice}")).await?;
        let amount_msat = match json.get("num_msat") {
            Some(_) => amount_at(&json, "/num_msat"),
            None => amount_at(&json, "/num_satoshis").saturating_mul(1000),
        };

        Ok(PaymentRequest {
            payment_hash: required_str(&json, "/payment_hash", "payment_hash")?,
            amount_msat,
            expiry: amount_at(&json, "/expiry"),
            destination: required_str(&json, "/destination", "destination")?,
            description: json["description"]
                .as_str()
                .filter(|d| !d.is_empty())
                .map(ToString::to_string),
        })
    }

    async fn add_listener_to_node(&self, node: &LightningNode) -> Result<()> {
        let conn = self.conn(node)?;
        self.ctx
            .listener(node, &conn, CHANNEL_EVENTS_PATH, Some("{}".into()))
            .await
            .map(drop)
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
        let listener = self
            .ctx
            .listener(node, &conn, CHANNEL_EVENTS_PATH, Some("{}".into()))
            .await?;
        forward_channel_events(node, &listener, parse_channel_event, callback);
        Ok(())
    }
}

/// Map one channel update of the REST stream.
pub fn parse_channel_event(message: &str) -> Option<ChannelEvent> {
    let json: Value = serde_json::from_str(message).ok()?;
    let kind = json.pointer("/result/type")?.as_str()?;
    Some(match kind {
        "PENDING_OPEN_CHANNEL" => ChannelEvent::Pending,
        "OPEN_CHANNEL" => ChannelEvent::Open,
        "CLOSED_CHANNEL" | "FULLY_RESOLVED_CHANNEL" => ChannelEvent::Closed,
        _ => ChannelEvent::Unknown,
    })
}
