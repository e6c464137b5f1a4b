//! Connection config resolution.
//!
//! Turns a node descriptor into the base URL and auth headers a service needs
//! to reach the daemon. The only I/O is reading credential files that the
//! host application has already written.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use polar_core::{Config, Error, Implementation, LightningNode, Result};

use crate::stream::StreamTarget;

/// Eclair's API password in the images polar runs.
const ECLAIR_PASSWORD: &str = "eclairpw";

/// The protocol dialect a service speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// LND REST (also served by litd).
    Lnd,
    /// Core Lightning clnrest.
    CLightning,
    /// Eclair HTTP API.
    Eclair,
    /// LDK server REST.
    RustLightning,
}

impl ServiceKind {
    /// Whether nodes of `implementation` speak this dialect.
    #[must_use]
    pub const fn accepts(self, implementation: Implementation) -> bool {
        matches!(
            (self, implementation),
            (Self::Lnd, Implementation::Lnd | Implementation::Litd)
                | (Self::CLightning, Implementation::CLightning)
                | (Self::Eclair, Implementation::Eclair)
                | (Self::RustLightning, Implementation::RustLightning)
        )
    }

    /// Service name used in errors and logs.
    #[must_use]
    pub const fn service_name(self) -> &'static str {
        match self {
            Self::Lnd => "LndService",
            Self::CLightning => "CLightningService",
            Self::Eclair => "EclairService",
            Self::RustLightning => "RustLightningService",
        }
    }
}

/// Transport parameters for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Base URL without a trailing slash.
    pub url: String,
    /// Headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

impl ConnectionConfig {
    /// Full URL for `path` below the base URL.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url, path.trim_start_matches('/'))
    }

    /// WebSocket URL for `path`, mapping `http(s)` to `ws(s)`.
    #[must_use]
    pub fn websocket_url(&self, path: &str) -> String {
        let url = self.endpoint(path);
        if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            url
        }
    }

    /// Streaming target for `path` carrying this config's auth headers.
    #[must_use]
    pub fn stream_target(&self, path: &str, attempts: u32) -> StreamTarget {
        StreamTarget {
            url: self.websocket_url(path),
            headers: self.headers.clone(),
            attempts,
            opening_message: None,
        }
    }
}

/// Resolve the connection config `kind` uses to reach `node`.
///
/// Fails with [`Error::Configuration`] when `node` is not a `kind` node or a
/// required credential is missing, so one daemon's service can never be
/// pointed at another daemon's port.
pub fn resolve(kind: ServiceKind, node: &LightningNode, config: &Config) -> Result<ConnectionConfig> {
    if !kind.accepts(node.implementation) {
        return Err(Error::Configuration(format!(
            "{} cannot be used for '{}' nodes",
            kind.service_name(),
            node.implementation
        )));
    }

    let host = &config.host;
    let rest = node.ports.rest;
    let mut headers = BTreeMap::new();

    let url = match kind {
        ServiceKind::Lnd => {
            let path = required_path(node, node.paths.admin_macaroon.as_ref(), "adminMacaroon")?;
            let macaroon = read_bytes(&config.data_dir, path)?;
            headers.insert("Grpc-Metadata-macaroon".to_string(), hex::encode(macaroon));
            format!("https://{host}:{rest}")
        }
        ServiceKind::CLightning => {
            let path = required_path(node, node.paths.rune.as_ref(), "rune")?;
            headers.insert("Rune".to_string(), read_text(&config.data_dir, path)?);
            let scheme = if node.paths.tls_cert.is_some() {
                "https"
            } else {
                "http"
            };
            format!("{scheme}://{host}:{rest}")
        }
        ServiceKind::Eclair => {
            let token = STANDARD.encode(format!(":{ECLAIR_PASSWORD}"));
            headers.insert("Authorization".to_string(), format!("Basic {token}"));
            format!("http://{host}:{rest}")
        }
        ServiceKind::RustLightning => {
            if let Some(path) = node.paths.rune.as_ref() {
                headers.insert("Rune".to_string(), read_text(&config.data_dir, path)?);
            }
            format!("http://{host}:{rest}")
        }
    };

    Ok(ConnectionConfig { url, headers })
}

fn required_path<'a>(
    node: &LightningNode,
    path: Option<&'a PathBuf>,
    name: &str,
) -> Result<&'a PathBuf> {
    path.ok_or_else(|| {
        Error::Configuration(format!(
            "node '{}' ({}) has no {name} path",
            node.name, node.implementation
        ))
    })
}

fn read_bytes(data_dir: &Path, path: &Path) -> Result<Vec<u8>> {
    let full = data_dir.join(path);
    std::fs::read(&full).map_err(|e| {
        Error::Configuration(format!("failed to read {}: {e}", full.display()))
    })
}

fn read_text(data_dir: &Path, path: &Path) -> Result<String> {
    let bytes = read_bytes(data_dir, path)?;
    String::from_utf8(bytes)
        .map(|text| text.trim().to_string())
        .map_err(|e| Error::Configuration(format!("{} is not utf-8: {e}", path.display())))
}
