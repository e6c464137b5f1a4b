//! Lightning node services for Polar.
//!
//! This crate drives LND, litd, Core Lightning, eclair and rust-lightning
//! daemons through one [`LightningService`] contract, selected per node by
//! the [`LightningFactory`].

mod clightning;
mod eclair;
pub mod events;
mod factory;
pub mod listener;
mod lnd;
mod resolver;
pub mod rln_client;
mod rustlightning;
mod service;
pub mod stream;
pub mod transport;
mod wire;

pub use clightning::CLightningService;
pub use eclair::EclairService;
pub use events::{EventHandler, EventLoop, EventLoopHandle, EventSource, LoopState};
pub use factory::LightningFactory;
pub use listener::{ListenerCache, ListenerHandle};
pub use lnd::LndService;
pub use resolver::{ConnectionConfig, ServiceKind, resolve};
pub use rln_client::RlnClient;
pub use rustlightning::RustLightningService;
pub use service::{ChannelEventCallback, LightningService, ServiceContext};
pub use stream::{StreamConnection, StreamConnector, StreamTarget, WsConnector};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, RequestBody, ReqwestTransport};
