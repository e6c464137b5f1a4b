//! Core types and configuration for the polar node services.
//!
//! This crate provides the node descriptor model, the normalized value types
//! every Lightning adapter returns, configuration management and the shared
//! error taxonomy used across the polar workspace.

mod config;
mod error;
mod node;
mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use node::{EndpointKey, Implementation, LightningNode, NodePaths, NodePorts, PeerUri};
pub use types::{
    Balances, Channel, ChannelEvent, ChannelPoint, CloseChannelRequest, ConnectPeersReport,
    InvoiceRequest, NodeAddress, NodeInfo, OpenChannelRequest, OutPoint, PayReceipt,
    PaymentRequest, Peer, PendingEvent,
};
