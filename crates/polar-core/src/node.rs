//! Lightning node descriptors.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Lightning implementation type.
///
/// Serialized with the names the host application stores on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Implementation {
    /// LND (Lightning Network Daemon).
    #[serde(rename = "LND")]
    Lnd,
    /// Core Lightning.
    #[serde(rename = "c-lightning")]
    CLightning,
    /// Eclair.
    #[serde(rename = "eclair")]
    Eclair,
    /// Lightning Terminal, an LND node with integrated tapd.
    #[serde(rename = "litd")]
    Litd,
    /// LDK based rust-lightning server.
    #[serde(rename = "rustlightning")]
    RustLightning,
}

impl Implementation {
    /// Get all available Lightning implementations.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Lnd,
            Self::CLightning,
            Self::Eclair,
            Self::Litd,
            Self::RustLightning,
        ]
    }

    /// Get the name used in node descriptors.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Lnd => "LND",
            Self::CLightning => "c-lightning",
            Self::Eclair => "eclair",
            Self::Litd => "litd",
            Self::RustLightning => "rustlightning",
        }
    }
}

impl std::fmt::Display for Implementation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Implementation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|imp| imp.as_str() == s)
            .ok_or_else(|| Error::Configuration(format!("unknown lightning implementation '{s}'")))
    }
}

/// Host ports published by a Lightning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePorts {
    /// REST API port.
    pub rest: u16,
    /// gRPC API port, absent for daemons without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grpc: Option<u16>,
    /// P2P/Peer port.
    pub p2p: u16,
    /// Web UI port (litd only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<u16>,
}

/// Credential material paths for a node.
///
/// Which entries are required depends on the implementation; the resolver
/// reports the missing one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePaths {
    /// TLS certificate of the REST endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<PathBuf>,
    /// LND admin macaroon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_macaroon: Option<PathBuf>,
    /// LND invoice macaroon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_macaroon: Option<PathBuf>,
    /// LND readonly macaroon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly_macaroon: Option<PathBuf>,
    /// Rune used by Core Lightning and rust-lightning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rune: Option<PathBuf>,
    /// Client certificate for mutual TLS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_client_cert: Option<PathBuf>,
    /// Client key for mutual TLS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_client_key: Option<PathBuf>,
    /// litd TLS certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lit_tls_cert: Option<PathBuf>,
    /// litd macaroon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lit_macaroon: Option<PathBuf>,
    /// Integrated tapd macaroon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap_macaroon: Option<PathBuf>,
}

/// A Lightning node as described by the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightningNode {
    /// Unique identifier.
    pub id: Uuid,
    /// Network this node belongs to.
    pub network_id: u32,
    /// Node name (alice, bob, ...).
    pub name: String,
    /// Lightning implementation.
    pub implementation: Implementation,
    /// Implementation version.
    pub version: String,
    /// Name of the Bitcoin backend node.
    pub backend_name: String,
    /// Published ports.
    pub ports: NodePorts,
    /// Credential material.
    #[serde(default)]
    pub paths: NodePaths,
}

impl LightningNode {
    /// Create a new node with default ports and no credential paths.
    pub fn new(
        network_id: u32,
        name: impl Into<String>,
        implementation: Implementation,
        ports: NodePorts,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            network_id,
            name: name.into(),
            implementation,
            version: String::new(),
            backend_name: "backend1".to_string(),
            ports,
            paths: NodePaths::default(),
        }
    }

    /// Set the credential paths.
    #[must_use]
    pub fn with_paths(mut self, paths: NodePaths) -> Self {
        self.paths = paths;
        self
    }

    /// Key of this node's streaming endpoint in the listener cache.
    #[must_use]
    pub const fn endpoint_key(&self) -> EndpointKey {
        EndpointKey {
            network_id: self.network_id,
            port: self.ports.rest,
        }
    }

    /// Peer URI other nodes use to reach this one inside the network.
    #[must_use]
    pub fn p2p_uri(&self, pubkey: &str) -> String {
        format!("{pubkey}@{}:{}", self.name, self.ports.p2p)
    }
}

/// Identity of a streaming endpoint.
///
/// Ports are only unique inside one network, so the network id is part of
/// the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointKey {
    /// Network the endpoint belongs to.
    pub network_id: u32,
    /// Published port of the endpoint.
    pub port: u16,
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network_id, self.port)
    }
}

/// A `pubkey@host:port` peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUri {
    /// Hex encoded node public key.
    pub pubkey: String,
    /// `host:port` the peer listens on.
    pub address: String,
}

impl PeerUri {
    /// Host part of the address.
    #[must_use]
    pub fn host(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map_or(self.address.as_str(), |(host, _)| host)
    }

    /// Port part of the address, if present and numeric.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }
}

impl FromStr for PeerUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (pubkey, address) = s
            .split_once('@')
            .ok_or_else(|| Error::InvalidInput(format!("peer uri '{s}' is not pubkey@host:port")))?;
        if pubkey.is_empty() || !pubkey.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidInput(format!(
                "peer uri '{s}' has an invalid pubkey"
            )));
        }
        if address.is_empty() {
            return Err(Error::InvalidInput(format!("peer uri '{s}' has no address")));
        }
        Ok(Self {
            pubkey: pubkey.to_string(),
            address: address.to_string(),
        })
    }
}

impl std::fmt::Display for PeerUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pubkey, self.address)
    }
}
