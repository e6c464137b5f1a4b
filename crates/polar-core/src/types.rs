//! Normalized values returned by every Lightning service.
//!
//! Amounts are satoshis unless a field name says otherwise. Daemon native
//! units never leak past the adapter that talked to the daemon.

use serde::{Deserialize, Serialize};

use crate::{Error, LightningNode, Result};

/// Summary information about a Lightning node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Identity public key.
    pub pubkey: String,
    /// Node alias.
    pub alias: String,
    /// `pubkey@host:port` URI peers use to connect.
    pub rpc_url: String,
    /// Is synced to chain.
    pub synced_to_chain: bool,
    /// Block height.
    pub block_height: u32,
    /// Number of active channels.
    pub num_active_channels: u32,
    /// Number of pending channels.
    pub num_pending_channels: u32,
    /// Number of inactive channels.
    pub num_inactive_channels: u32,
}

/// On-chain and channel balances as decimal strings of satoshis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    /// Total on-chain wallet balance.
    pub total: String,
    /// Confirmed, spendable on-chain balance.
    pub confirmed: String,
    /// Unconfirmed on-chain balance.
    pub unconfirmed: String,
    /// Balance held in channels.
    pub channel: String,
}

impl Balances {
    /// Build balances from satoshi amounts.
    #[must_use]
    pub fn from_sats(total: u64, confirmed: u64, unconfirmed: u64, channel: u64) -> Self {
        Self {
            total: total.to_string(),
            confirmed: confirmed.to_string(),
            unconfirmed: unconfirmed.to_string(),
            channel: channel.to_string(),
        }
    }
}

impl Default for Balances {
    fn default() -> Self {
        Self::from_sats(0, 0, 0, 0)
    }
}

/// A freshly generated on-chain address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    /// The address string.
    pub address: String,
}

/// A channel as seen from one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Whether the channel is still being negotiated or funded.
    pub pending: bool,
    /// Identifier unique among this node's channels.
    pub uniq_id: String,
    /// `txid:index` funding outpoint, empty when the daemon does not know it yet.
    pub channel_point: String,
    /// Counterparty public key.
    pub pubkey: String,
    /// Channel capacity.
    pub capacity: String,
    /// Local balance.
    pub local_balance: String,
    /// Remote balance.
    pub remote_balance: String,
    /// Daemon reported state, lower-cased.
    pub status: String,
    /// Whether the channel is unannounced.
    pub is_private: bool,
}

/// A connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Peer public key.
    pub pubkey: String,
    /// Network address of the peer.
    pub address: String,
}

/// Outcome of connecting to a set of peers.
///
/// Each target is attempted independently; one failure never stops the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectPeersReport {
    /// Peers a new connection was made to.
    pub connected: Vec<String>,
    /// Peers that were connected before the call.
    pub already_connected: Vec<String>,
    /// Peers that could not be connected, with the reason.
    pub failed: Vec<(String, String)>,
}

impl ConnectPeersReport {
    /// Whether every target ended up connected.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Parameters for opening a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    /// `pubkey@host:port` of the counterparty.
    pub to_rpc_url: String,
    /// Channel capacity in satoshis.
    pub amount: u64,
    /// Satoshis pushed to the counterparty on open.
    #[serde(default)]
    pub push_amount: Option<u64>,
    /// Open an unannounced channel.
    #[serde(default)]
    pub is_private: bool,
}

/// Reference to a channel returned by an open request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChannelPoint {
    /// The funding transaction is known.
    Funded {
        /// Funding transaction id.
        txid: String,
        /// Funding output index.
        output_index: u32,
    },
    /// The daemon accepted the open but reported no funding transaction.
    Incomplete {
        /// Daemon specific channel identifier.
        channel_id: String,
    },
}

impl ChannelPoint {
    /// Funding transaction id, if the daemon reported one.
    #[must_use]
    pub fn txid(&self) -> Option<&str> {
        match self {
            Self::Funded { txid, .. } => Some(txid),
            Self::Incomplete { .. } => None,
        }
    }

    /// Whether this reference carries a funding transaction.
    #[must_use]
    pub const fn is_funded(&self) -> bool {
        matches!(self, Self::Funded { .. })
    }
}

impl std::fmt::Display for ChannelPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Funded { txid, output_index } => write!(f, "{txid}:{output_index}"),
            Self::Incomplete { channel_id } => write!(f, "{channel_id} (unfunded)"),
        }
    }
}

/// Parameters for closing a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseChannelRequest {
    /// Channel point (`txid:index`) or daemon channel id.
    pub channel_point: String,
    /// Counterparty public key, required by daemons that key channels per peer.
    #[serde(default)]
    pub counterparty: Option<String>,
}

impl CloseChannelRequest {
    /// Close `channel_point` without naming the counterparty.
    pub fn new(channel_point: impl Into<String>) -> Self {
        Self {
            channel_point: channel_point.into(),
            counterparty: None,
        }
    }

    /// Split a `txid:index` channel point.
    pub fn funding_outpoint(&self) -> Result<(&str, u32)> {
        let (txid, index) = self.channel_point.split_once(':').ok_or_else(|| {
            Error::InvalidInput(format!(
                "channel point '{}' is not txid:index",
                self.channel_point
            ))
        })?;
        let index = index.parse().map_err(|_| {
            Error::InvalidInput(format!(
                "channel point '{}' has an invalid output index",
                self.channel_point
            ))
        })?;
        Ok((txid, index))
    }
}

/// Parameters for creating an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    /// Amount in satoshis.
    pub amount: u64,
    /// Invoice description.
    #[serde(default)]
    pub memo: Option<String>,
    /// Expiry in seconds, the configured default when absent.
    #[serde(default)]
    pub expiry_secs: Option<u32>,
}

impl InvoiceRequest {
    /// Invoice for `amount` satoshis with the default memo and expiry.
    #[must_use]
    pub const fn new(amount: u64) -> Self {
        Self {
            amount,
            memo: None,
            expiry_secs: None,
        }
    }

    /// Set the memo.
    #[must_use]
    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Set the expiry in seconds.
    #[must_use]
    pub const fn with_expiry(mut self, expiry_secs: u32) -> Self {
        self.expiry_secs = Some(expiry_secs);
        self
    }

    /// The memo, or a placeholder naming the receiving node.
    #[must_use]
    pub fn description_for(&self, node: &LightningNode) -> String {
        self.memo
            .clone()
            .filter(|memo| !memo.is_empty())
            .unwrap_or_else(|| format!("Payment to {}", node.name))
    }

    /// Amount in millisatoshis.
    pub fn amount_msat(&self) -> Result<u64> {
        self.amount
            .checked_mul(1000)
            .ok_or_else(|| Error::InvalidInput(format!("amount {} sats overflows msat", self.amount)))
    }
}

/// Receipt of a successful payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayReceipt {
    /// Payment preimage, hex encoded.
    pub preimage: String,
    /// Amount paid in satoshis.
    pub amount: u64,
    /// Destination public key.
    pub destination: String,
}

/// A decoded BOLT11 invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Payment hash.
    pub payment_hash: String,
    /// Amount in millisatoshis, zero for amountless invoices.
    pub amount_msat: u64,
    /// Expiry in seconds.
    pub expiry: u64,
    /// Destination public key.
    pub destination: String,
    /// Invoice description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Channel lifecycle notification pushed by a daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelEvent {
    /// A channel is being opened.
    Pending,
    /// A channel became usable.
    Open,
    /// A channel was closed.
    Closed,
    /// Any other channel update.
    Unknown,
}

/// A funding outpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutPoint {
    /// Transaction id.
    pub txid: String,
    /// Output index.
    pub vout: u32,
}

/// Head of a daemon's pending event queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PendingEvent {
    /// An outbound payment succeeded.
    PaymentSuccessful {
        /// Payment id, hex encoded.
        #[serde(default)]
        payment_id: Option<String>,
        /// Fee paid in millisatoshis.
        #[serde(default)]
        fee_paid_msat: Option<u64>,
    },
    /// An outbound payment failed.
    PaymentFailed {
        /// Payment id, hex encoded.
        #[serde(default)]
        payment_id: Option<String>,
    },
    /// An inbound payment arrived.
    PaymentReceived {
        /// Payment id, hex encoded.
        #[serde(default)]
        payment_id: Option<String>,
        /// Amount received in millisatoshis.
        amount_msat: u64,
    },
    /// A channel funding transaction was broadcast.
    ChannelPending {
        /// Funding outpoint.
        funding_txo: OutPoint,
    },
    /// A channel is ready for payments.
    ChannelReady {
        /// Local channel id.
        user_channel_id: String,
    },
    /// A channel was closed.
    ChannelClosed {
        /// Local channel id, when reported.
        #[serde(default)]
        user_channel_id: Option<String>,
    },
    /// Any event this layer does not model.
    Other {
        /// Daemon event name.
        kind: String,
    },
}

impl PendingEvent {
    /// Channel notification carried by this event, if any.
    #[must_use]
    pub const fn channel_event(&self) -> Option<ChannelEvent> {
        match self {
            Self::ChannelPending { .. } => Some(ChannelEvent::Pending),
            Self::ChannelReady { .. } => Some(ChannelEvent::Open),
            Self::ChannelClosed { .. } => Some(ChannelEvent::Closed),
            _ => None,
        }
    }
}
