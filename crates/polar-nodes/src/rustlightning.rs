//! rust-lightning (LDK server) adapter.
//!
//! The daemon has no push stream for channel updates. Channel events are
//! read from its pending event queue through an [`EventLoop`] per node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use polar_core::{
    Balances, Channel, ChannelPoint, CloseChannelRequest, ConnectPeersReport, EndpointKey, Error,
    InvoiceRequest, LightningNode, NodeAddress, NodeInfo, OpenChannelRequest, PayReceipt,
    PaymentRequest, Peer, PendingEvent, Result,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::events::{EventHandler, EventLoop, EventLoopHandle};
use crate::resolver::ServiceKind;
use crate::rln_client::{
    CloseChannelBody, ConnectPeerBody, OpenChannelBody, PaymentDetails, PaymentStatus,
    ReceiveBody, RlnClient, SendBody, SendUsingAmountBody,
};
use crate::service::{
    ChannelEventCallback, LightningService, ServiceContext, connect_each, prepare_open,
};
use crate::wire::msat_to_sat;

/// Times a sent payment is read back while it is still pending.
pub const PAYMENT_POLL_ATTEMPTS: u32 = 20;

/// Pause between reads of a pending payment.
pub const PAYMENT_POLL_DELAY: Duration = Duration::from_millis(250);

/// Talks to LDK server nodes.
pub struct RustLightningService {
    ctx: ServiceContext,
    consumers: Mutex<HashMap<EndpointKey, EventLoopHandle>>,
}

impl RustLightningService {
    /// Create the service.
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            consumers: Mutex::new(HashMap::new()),
        }
    }

    /// Typed client for `node`.
    pub fn client(&self, node: &LightningNode) -> Result<RlnClient> {
        RlnClient::new(self.ctx.clone(), node)
    }

    /// Consume `node`'s pending events with `handler`.
    ///
    /// Replaces any consumer already running for the node. The daemon only
    /// has one queue cursor, so the previous consumer is stopped, and its
    /// in-flight event handled and acknowledged, before the new one starts.
    pub async fn consume_events<H>(&self, node: &LightningNode, handler: H) -> Result<()>
    where
        H: EventHandler + 'static,
    {
        let client = Arc::new(self.client(node)?);
        let mut consumers = self.consumers.lock().await;
        if let Some(previous) = consumers.remove(&node.endpoint_key()) {
            info!(node = %node.name, "replacing event consumer");
            stop(&node.name, previous).await;
        }

        let handle = EventLoop::new(node.name.clone(), client, handler)
            .with_backoff(self.ctx.config().event_backoff())
            .spawn();
        consumers.insert(node.endpoint_key(), handle);
        Ok(())
    }

    /// Stop `node`'s event consumer. Returns whether one was running.
    pub async fn stop_consuming(&self, node: &LightningNode) -> bool {
        let handle = self.consumers.lock().await.remove(&node.endpoint_key());
        match handle {
            Some(handle) => {
                stop(&node.name, handle).await;
                true
            }
            None => false,
        }
    }

    /// Stop every event consumer.
    pub async fn cancel_all(&self) {
        let drained: Vec<(EndpointKey, EventLoopHandle)> =
            self.consumers.lock().await.drain().collect();
        for (key, handle) in drained {
            stop(&key.to_string(), handle).await;
        }
    }

    /// Whether an event consumer is running for `node`.
    pub async fn is_consuming(&self, node: &LightningNode) -> bool {
        self.consumers
            .lock()
            .await
            .get(&node.endpoint_key())
            .is_some_and(|handle| !handle.is_finished())
    }

    fn msat(sats: u64, what: &str) -> Result<u64> {
        sats.checked_mul(1000)
            .ok_or_else(|| Error::InvalidInput(format!("{what} of {sats} sats overflows msat")))
    }

    async fn close(&self, node: &LightningNode, request: &CloseChannelRequest, force: bool) -> Result<()> {
        let counterparty = request.counterparty.clone().ok_or_else(|| {
            Error::InvalidInput(format!(
                "closing channel {} on {} requires the counterparty pubkey",
                request.channel_point, node.implementation
            ))
        })?;
        let body = CloseChannelBody {
            user_channel_id: request.channel_point.clone(),
            counterparty_node_id: counterparty,
        };
        let client = self.client(node)?;
        let reply = if force {
            client.force_close(&body).await?
        } else {
            client.close(&body).await?
        };
        if !reply.ok {
            return Err(Error::protocol("close", "channel close refused"));
        }
        info!(node = %node.name, channel = %request.channel_point, force, "channel close requested");
        Ok(())
    }
}

#[async_trait]
impl LightningService for RustLightningService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::RustLightning
    }

    async fn get_info(&self, node: &LightningNode) -> Result<NodeInfo> {
        let client = self.client(node)?;
        let pubkey = client.node_id().await?.node_id;
        if pubkey.is_empty() {
            return Err(Error::ResponseShape("empty node_id".into()));
        }
        let status = client.status().await?;
        let peers = client.peers().await?;
        let active = peers.iter().filter(|p| p.is_connected).count();

        Ok(NodeInfo {
            alias: node.name.clone(),
            rpc_url: node.p2p_uri(&pubkey),
            synced_to_chain: status.is_running,
            block_height: status.best_block_height,
            num_active_channels: u32::try_from(active).unwrap_or(u32::MAX),
            num_pending_channels: 0,
            num_inactive_channels: 0,
            pubkey,
        })
    }

    async fn get_balances(&self, node: &LightningNode) -> Result<Balances> {
        let res = self.client(node)?.balances().await?;
        Ok(Balances::from_sats(
            res.total_onchain_balance_sats,
            res.spendable_onchain_balance_sats,
            res.total_onchain_balance_sats
                .saturating_sub(res.spendable_onchain_balance_sats),
            res.total_lightning_balance_sats,
        ))
    }

    async fn get_new_address(&self, node: &LightningNode) -> Result<NodeAddress> {
        let res = self.client(node)?.new_address().await?;
        if res.address.is_empty() {
            return Err(Error::ResponseShape(format!(
                "failed to create new address on '{}'",
                node.name
            )));
        }
        Ok(NodeAddress {
            address: res.address,
        })
    }

    async fn get_channels(&self, node: &LightningNode) -> Result<Vec<Channel>> {
        Err(Error::unsupported(node.implementation, "get_channels"))
    }

    async fn get_peers(&self, node: &LightningNode) -> Result<Vec<Peer>> {
        let peers = self.client(node)?.peers().await?;
        Ok(peers
            .into_iter()
            .filter(|p| p.is_connected)
            .map(|p| Peer {
                pubkey: p.node_id,
                address: p.address,
            })
            .collect())
    }

    async fn connect_peers(
        &self,
        node: &LightningNode,
        rpc_urls: &[String],
    ) -> Result<ConnectPeersReport> {
        let client = self.client(node)?;
        let connected = self.get_peers(node).await?;
        let client = &client;
        Ok(connect_each(node, &connected, rpc_urls, |uri| async move {
            let body = ConnectPeerBody {
                node_id: uri.pubkey,
                address: uri.address,
                persist: true,
            };
            client.connect(&body).await.map(drop)
        })
        .await)
    }

    async fn open_channel(
        &self,
        from: &LightningNode,
        request: &OpenChannelRequest,
    ) -> Result<ChannelPoint> {
        let peer = prepare_open(self, from, request).await?;
        let body = OpenChannelBody {
            node_id: peer.pubkey,
            address: peer.address,
            channel_amount_sats: request.amount,
            push_to_counterparty_msat: request
                .push_amount
                .map(|push| Self::msat(push, "push amount"))
                .transpose()?,
            announce: Some(!request.is_private),
        };
        let res = self.client(from)?.open(&body).await?;
        if res.user_channel_id.is_empty() {
            return Err(Error::ResponseShape("open returned no user_channel_id".into()));
        }

        // The funding transaction is only announced later, as a
        // ChannelPending event.
        Ok(ChannelPoint::Incomplete {
            channel_id: res.user_channel_id,
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
        let body = ReceiveBody {
            amount_msat: request.amount_msat()?,
            description: request.description_for(node),
            expiry_secs: request
                .expiry_secs
                .unwrap_or(self.ctx.config().invoice_expiry_secs),
        };
        let res = self.client(node)?.receive(&body).await?;
        if res.invoice.is_empty() {
            return Err(Error::ResponseShape("receive returned no invoice".into()));
        }
        Ok(res.invoice)
    }

    async fn pay_invoice(
        &self,
        node: &LightningNode,
        invoice: &str,
        amount: Option<u64>,
    ) -> Result<PayReceipt> {
        let client = self.client(node)?;
        let sent = match amount {
            Some(amount) => {
                let body = SendUsingAmountBody {
                    invoice: invoice.to_string(),
                    amount_msat: Self::msat(amount, "amount")?,
                };
                client.send_using_amount(&body).await?
            }
            None => {
                client
                    .send(&SendBody {
                        invoice: invoice.to_string(),
                    })
                    .await?
            }
        };

        let payment = settled_payment(&client, &sent.payment_id).await?;
        if payment.status == PaymentStatus::Failed {
            return Err(Error::protocol("payment-failed", format!("payment {} failed", payment.id)));
        }

        let mut missing = Vec::new();
        if payment.preimage.is_none() {
            missing.push("preimage");
        }
        if payment.amount_msat.is_none() {
            missing.push("amount_msat");
        }
        if payment.counterparty_node_id.is_none() {
            missing.push("counterparty_node_id");
        }
        match (payment.preimage, payment.amount_msat, payment.counterparty_node_id) {
            (Some(preimage), Some(amount_msat), Some(destination)) => Ok(PayReceipt {
                preimage,
                amount: msat_to_sat(amount_msat),
                destination,
            }),
            _ => Err(Error::ResponseShape(format!(
                "payment {} was sent but the daemon did not report {}",
                sent.payment_id,
                missing.join(", ")
            ))),
        }
    }

    async fn decode_invoice(&self, node: &LightningNode, _invoice: &str) -> Result<PaymentRequest> {
        Err(Error::unsupported(node.implementation, "decode_invoice"))
    }

    async fn add_listener_to_node(&self, node: &LightningNode) -> Result<()> {
        Err(Error::unsupported(node.implementation, "add_listener_to_node"))
    }

    /// Stops the node's event consumer, the only long-lived resource held
    /// for a rust-lightning node.
    async fn remove_listener(&self, node: &LightningNode) -> Result<()> {
        self.stop_consuming(node).await;
        Ok(())
    }

    async fn subscribe_channel_events(
        &self,
        node: &LightningNode,
        callback: ChannelEventCallback,
    ) -> Result<()> {
        self.consume_events(node, move |event: PendingEvent| {
            let callback = Arc::clone(&callback);
            async move {
                if let Some(channel_event) = event.channel_event() {
                    callback(channel_event);
                }
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
    }
}

async fn stop(name: &str, handle: EventLoopHandle) {
    if let Err(e) = handle.stop().await {
        warn!(node = %name, error = %e, "event consumer ended abnormally");
    }
}

/// Read back payment `payment_id` until it leaves the `Pending` state.
async fn settled_payment(client: &RlnClient, payment_id: &str) -> Result<PaymentDetails> {
    for attempt in 1..=PAYMENT_POLL_ATTEMPTS {
        let payment = client.get_payment(payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Ok(payment);
        }
        debug!(payment = %payment_id, attempt, "payment still pending");
        if attempt < PAYMENT_POLL_ATTEMPTS {
            tokio::time::sleep(PAYMENT_POLL_DELAY).await;
        }
    }
    Err(Error::protocol(
        "payment-pending",
        format!("payment {payment_id} is still in flight"),
    ))
}
