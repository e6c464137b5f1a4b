//! Core Lightning adapter over clnrest.

use async_trait::async_trait;
use polar_core::{
    Balances, Channel, ChannelPoint, CloseChannelRequest, ConnectPeersReport, Error,
    InvoiceRequest, LightningNode, NodeAddress, NodeInfo, OpenChannelRequest, PayReceipt,
    PaymentRequest, Peer, Result,
};
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use crate::resolver::{ConnectionConfig, ServiceKind};
use crate::service::{
    ChannelEventCallback, LightningService, ServiceContext, connect_each, prepare_open,
};
use crate::transport::{Method, RequestBody};
use crate::wire::{
    amount_at, count_at, msat_to_sat, required_amount, required_str, str_or_empty,
};

/// Seconds lightningd waits for a mutual close before going on chain.
const FORCE_CLOSE_TIMEOUT_SECS: u32 = 1;

/// Talks to lightningd through clnrest.
pub struct CLightningService {
    ctx: ServiceContext,
}

impl CLightningService {
    /// Create the service.
    pub const fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    fn conn(&self, node: &LightningNode) -> Result<ConnectionConfig> {
        self.ctx.connection(ServiceKind::CLightning, node)
    }

    async fn rpc(&self, node: &LightningNode, method: &str, params: Value) -> Result<Value> {
        let conn = self.conn(node)?;
        self.ctx
            .call(
                node,
                &conn,
                Method::Post,
                &format!("/v1/{method}"),
                RequestBody::Json(params),
            )
            .await
    }

    /// lightningd closes by channel id, short channel id or peer id. A
    /// funding outpoint is translated to the channel id first.
    async fn close_target(&self, node: &LightningNode, request: &CloseChannelRequest) -> Result<String> {
        let Ok((txid, index)) = request.funding_outpoint() else {
            return Ok(request.channel_point.clone());
        };
        let json = self.rpc(node, "listpeerchannels", json!({})).await?;
        json["channels"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|c| {
                c["funding_txid"].as_str() == Some(txid)
                    && c["funding_outnum"].as_u64() == Some(u64::from(index))
            })
            .and_then(|c| c["channel_id"].as_str())
            .map(ToString::to_string)
            .ok_or_else(|| {
                Error::InvalidInput(format!("no channel with funding outpoint {}", request.channel_point))
            })
    }

    async fn close(&self, node: &LightningNode, request: &CloseChannelRequest, force: bool) -> Result<()> {
        let id = self.close_target(node, request).await?;
        let mut params = json!({ "id": id });
        if force {
            params["unilateraltimeout"] = json!(FORCE_CLOSE_TIMEOUT_SECS);
        }
        self.rpc(node, "close", params).await?;
        info!(node = %node.name, channel = %id, force, "channel close requested");
        Ok(())
    }
}

#[async_trait]
impl LightningService for CLightningService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::CLightning
    }

    async fn get_info(&self, node: &LightningNode) -> Result<NodeInfo> {
        let json = self.rpc(node, "getinfo", json!({})).await?;
        let pubkey = required_str(&json, "/id", "node id")?;
        let synced = json.get("warning_bitcoind_sync").is_none()
            && json.get("warning_lightningd_sync").is_none();

        Ok(NodeInfo {
            alias: str_or_empty(&json, "/alias"),
            rpc_url: node.p2p_uri(&pubkey),
            synced_to_chain: synced,
            block_height: count_at(&json, "/blockheight"),
            num_active_channels: count_at(&json, "/num_active_channels"),
            num_pending_channels: count_at(&json, "/num_pending_channels"),
            num_inactive_channels: count_at(&json, "/num_inactive_channels"),
            pubkey,
        })
    }

    async fn get_balances(&self, node: &LightningNode) -> Result<Balances> {
        let json = self.rpc(node, "listfunds", json!({})).await?;

        let (mut confirmed, mut unconfirmed) = (0_u64, 0_u64);
        for output in json["outputs"].as_array().into_iter().flatten() {
            let msat = amount_at(output, "/amount_msat");
            match output["status"].as_str() {
                Some("confirmed") => confirmed += msat,
                Some("unconfirmed") => unconfirmed += msat,
                _ => {}
            }
        }
        let channel: u64 = json["channels"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|c| c["state"].as_str() == Some("CHANNELD_NORMAL"))
            .map(|c| amount_at(c, "/our_amount_msat"))
            .sum();

        Ok(Balances::from_sats(
            msat_to_sat(confirmed + unconfirmed),
            msat_to_sat(confirmed),
            msat_to_sat(unconfirmed),
            msat_to_sat(channel),
        ))
    }

    async fn get_new_address(&self, node: &LightningNode) -> Result<NodeAddress> {
        let json = self
            .rpc(node, "newaddr", json!({ "addresstype": "bech32" }))
            .await?;
        Ok(NodeAddress {
            address: required_str(&json, "/bech32", "bech32 address")?,
        })
    }

    async fn get_channels(&self, node: &LightningNode) -> Result<Vec<Channel>> {
        let json = self.rpc(node, "listpeerchannels", json!({})).await?;
        Ok(json["channels"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|c| {
                let state = str_or_empty(c, "/state");
                let txid = str_or_empty(c, "/funding_txid");
                let channel_point = if txid.is_empty() {
                    String::new()
                } else {
                    format!("{txid}:{}", amount_at(c, "/funding_outnum"))
                };
                let total = amount_at(c, "/total_msat");
                let ours = amount_at(c, "/to_us_msat");
                Channel {
                    pending: state == "CHANNELD_AWAITING_LOCKIN" || state.starts_with("DUALOPEND"),
                    uniq_id: c["short_channel_id"]
                        .as_str()
                        .map_or_else(|| str_or_empty(c, "/channel_id"), ToString::to_string),
                    channel_point,
                    pubkey: str_or_empty(c, "/peer_id"),
                    capacity: msat_to_sat(total).to_string(),
                    local_balance: msat_to_sat(ours).to_string(),
                    remote_balance: msat_to_sat(total.saturating_sub(ours)).to_string(),
                    status: state.to_ascii_lowercase(),
                    is_private: c["private"].as_bool().unwrap_or(false),
                }
            })
            .collect())
    }

    async fn get_peers(&self, node: &LightningNode) -> Result<Vec<Peer>> {
        let json = self.rpc(node, "listpeers", json!({})).await?;
        Ok(json["peers"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|p| p["connected"].as_bool().unwrap_or(false))
            .map(|p| Peer {
                pubkey: str_or_empty(p, "/id"),
                address: p["netaddr"]
                    .get(0)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
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
            self.rpc(node, "connect", json!({ "id": uri.to_string() }))
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
        let params = json!({
            "id": peer.pubkey,
            "amount": request.amount,
            "push_msat": push_msat,
            "announce": !request.is_private,
        });
        let json = self.rpc(from, "fundchannel", params).await?;

        match json["txid"].as_str().filter(|txid| !txid.is_empty()) {
            Some(txid) => Ok(ChannelPoint::Funded {
                txid: txid.to_string(),
                output_index: count_at(&json, "/outnum"),
            }),
            None => Ok(ChannelPoint::Incomplete {
                channel_id: required_str(&json, "/channel_id", "channel id")?,
            }),
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
        let params = json!({
            "amount_msat": request.amount_msat()?,
            "label": Uuid::new_v4().to_string(),
            "description": request.description_for(node),
            "expiry": request.expiry_secs.unwrap_or(self.ctx.config().invoice_expiry_secs),
        });
        let json = self.rpc(node, "invoice", params).await?;
        required_str(&json, "/bolt11", "bolt11 invoice")
    }

    async fn pay_invoice(
        &self,
        node: &LightningNode,
        invoice: &str,
        amount: Option<u64>,
    ) -> Result<PayReceipt> {
        let mut params = json!({ "bolt11": invoice });
        if let Some(amount) = amount {
            let msat = amount
                .checked_mul(1000)
                .ok_or_else(|| Error::InvalidInput("amount overflows msat".into()))?;
            params["amount_msat"] = json!(msat);
        }
        let json = self.rpc(node, "pay", params).await?;

        Ok(PayReceipt {
            preimage: required_str(&json, "/payment_preimage", "payment preimage")?,
            amount: msat_to_sat(required_amount(&json, "/amount_msat", "amount_msat")?),
            destination: required_str(&json, "/destination", "destination")?,
        })
    }

    async fn decode_invoice(&self, node: &LightningNode, invoice: &str) -> Result<PaymentRequest> {
        let json = self.rpc(node, "decode", json!({ "string": invoice })).await?;
        if json["valid"].as_bool() == Some(false) {
            return Err(Error::InvalidInput(format!("invalid invoice: {invoice}")));
        }

        Ok(PaymentRequest {
            payment_hash: required_str(&json, "/payment_hash", "payment_hash")?,
            amount_msat: amount_at(&json, "/amount_msat"),
            expiry: amount_at(&json, "/expiry"),
            destination: required_str(&json, "/payee", "payee")?,
            description: json["description"].as_str().map(ToString::to_string),
        })
    }

    async fn add_listener_to_node(&self, node: &LightningNode) -> Result<()> {
        Err(Error::unsupported(node.implementation, "add_listener_to_node"))
    }

    async fn remove_listener(&self, node: &LightningNode) -> Result<()> {
        Err(Error::unsupported(node.implementation, "remove_listener"))
    }

    async fn subscribe_channel_events(
        &self,
        node: &LightningNode,
        _callback: ChannelEventCallback,
    ) -> Result<()> {
        Err(Error::unsupported(node.implementation, "subscribe_channel_events"))
    }
}
