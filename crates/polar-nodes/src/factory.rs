//! Maps a node's implementation kind to the service that drives it.

use std::sync::Arc;

use polar_core::{Config, Implementation, LightningNode, Result};
use tracing::info;

use crate::clightning::CLightningService;
use crate::eclair::EclairService;
use crate::listener::ListenerCache;
use crate::lnd::LndService;
use crate::rustlightning::RustLightningService;
use crate::service::{LightningService, ServiceContext};
use crate::stream::{StreamConnector, WsConnector};
use crate::transport::{HttpTransport, ReqwestTransport};

/// The fixed set of services, built once.
///
/// LND and litd nodes share one [`LndService`]: litd serves the same REST
/// dialect in front of its embedded LND.
pub struct LightningFactory {
    lnd: Arc<LndService>,
    clightning: Arc<CLightningService>,
    eclair: Arc<EclairService>,
    rust_lightning: Arc<RustLightningService>,
    listeners: Arc<ListenerCache>,
}

impl LightningFactory {
    /// Build the services with the real HTTP and WebSocket transports.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let transport = ReqwestTransport::new(config.request_timeout())?;
        Ok(Self::with_transports(
            config,
            Arc::new(transport),
            Arc::new(WsConnector),
        ))
    }

    /// Build the services over the given transports.
    pub fn with_transports(
        config: Config,
        transport: Arc<dyn HttpTransport>,
        connector: Arc<dyn StreamConnector>,
    ) -> Self {
        let listeners = Arc::new(ListenerCache::new(connector));
        let ctx = ServiceContext::new(Arc::new(config), transport, Arc::clone(&listeners));

        Self {
            lnd: Arc::new(LndService::new(ctx.clone())),
            clightning: Arc::new(CLightningService::new(ctx.clone())),
            eclair: Arc::new(EclairService::new(ctx.clone())),
            rust_lightning: Arc::new(RustLightningService::new(ctx)),
            listeners,
        }
    }

    /// The service for `node`.
    #[must_use]
    pub fn get_service(&self, node: &LightningNode) -> Arc<dyn LightningService> {
        self.service_for(node.implementation)
    }

    /// The service for `implementation`. Always the same instance.
    #[must_use]
    pub fn service_for(&self, implementation: Implementation) -> Arc<dyn LightningService> {
        match implementation {
            Implementation::Lnd | Implementation::Litd => self.lnd.clone(),
            Implementation::CLightning => self.clightning.clone(),
            Implementation::Eclair => self.eclair.clone(),
            Implementation::RustLightning => self.rust_lightning.clone(),
        }
    }

    /// The rust-lightning service, for its event consumer controls.
    #[must_use]
    pub const fn rust_lightning(&self) -> &Arc<RustLightningService> {
        &self.rust_lightning
    }

    /// The listener cache shared by every service.
    #[must_use]
    pub const fn listeners(&self) -> &Arc<ListenerCache> {
        &self.listeners
    }

    /// Stop event consumers and close every listener.
    pub async fn shutdown(&self) {
        self.rust_lightning.cancel_all().await;
        self.listeners.clear_all().await;
        info!("lightning services shut down");
    }
}
