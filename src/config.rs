//! Serde configuration of a visor's transport stack.
//!
//! [`TransportConfig`] is the JSON document an operator writes. It turns into
//! a [`ClientFactory`] for the network clients and a [`ManagerConfig`] for
//! the transport manager.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::client::Client;
use crate::core::NetworkType;
use crate::crypto::{Keypair, PubKey};
use crate::network::{AddressResolver, ClientFactory, PkTable};
use crate::transport::{
    FileLogStore, LogStore, LogStoreError, Manager, ManagerBuilder, ManagerConfig, ManagerError,
    MemoryLogStore, MemoryTpd, PersistentTransport, TpdClient,
};

/// Errors loading or applying a [`TransportConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document is not valid configuration JSON.
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// The file log store could not be opened.
    #[error("log store: {0}")]
    LogStore(#[from] LogStoreError),

    /// A network is enabled but its backend cannot be built.
    #[error("network {0} is enabled but not configured")]
    Unconfigured(NetworkType),

    /// The manager rejected a client.
    #[error("manager: {0}")]
    Manager(#[from] ManagerError),
}

fn default_listen_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_networks() -> Vec<NetworkType> {
    vec![NetworkType::Stcp]
}

fn default_true() -> bool {
    true
}

/// `stcp` settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StcpConfig {
    /// Address raw TCP connections are accepted on.
    #[serde(default = "default_listen_addr")]
    pub listening_address: String,
    /// Static key to address table.
    #[serde(default)]
    pub pk_table: HashMap<PubKey, String>,
}

impl Default for StcpConfig {
    fn default() -> Self {
        Self {
            listening_address: default_listen_addr(),
            pk_table: HashMap::new(),
        }
    }
}

/// URLs of the discovery services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryUrls {
    /// Relay discovery.
    #[serde(default)]
    pub dmsg: Option<String>,
    /// Transport discovery.
    #[serde(default)]
    pub transport: Option<String>,
    /// Address resolver used by `stcpr` and `sudph`.
    #[serde(default)]
    pub address_resolver: Option<String>,
}

/// Where traffic counters are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStoreKind {
    /// Lost on restart.
    #[default]
    Memory,
    /// A JSON file under `location`.
    File,
}

/// Log store settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStoreConfig {
    /// Store kind.
    #[serde(rename = "type", default)]
    pub kind: LogStoreKind,
    /// Directory of the file store.
    #[serde(default)]
    pub location: PathBuf,
}

/// Transport stack configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Networks the manager starts clients for.
    #[serde(default = "default_networks")]
    pub networks: Vec<NetworkType>,
    /// `stcp` settings.
    #[serde(default)]
    pub stcp: StcpConfig,
    /// Address raw `stcpr` connections are accepted on.
    #[serde(default = "default_listen_addr")]
    pub stcpr_address: String,
    /// Address raw `sudph` datagrams are accepted on.
    #[serde(default = "default_listen_addr")]
    pub sudph_address: String,
    /// Discovery service URLs.
    #[serde(default)]
    pub discovery: DiscoveryUrls,
    /// Transports re-established periodically.
    #[serde(default)]
    pub persistent_transports: Vec<PersistentTransport>,
    /// Traffic log store.
    #[serde(default)]
    pub log_store: LogStoreConfig,
    /// Whether direct connections are encrypted.
    #[serde(default = "default_true")]
    pub encrypt: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            networks: default_networks(),
            stcp: StcpConfig::default(),
            stcpr_address: default_listen_addr(),
            sudph_address: default_listen_addr(),
            discovery: DiscoveryUrls::default(),
            persistent_transports: Vec::new(),
            log_store: LogStoreConfig::default(),
            encrypt: true,
        }
    }
}

impl TransportConfig {
    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Client factory for `keys`. `resolver` backs `stcpr` and `sudph`,
    /// `relay` backs `dmsg`.
    pub fn client_factory(
        &self,
        keys: Keypair,
        resolver: Option<Arc<dyn AddressResolver>>,
        relay: Option<Client>,
    ) -> ClientFactory {
        let mut factory = ClientFactory::new(keys);
        factory.stcp_addr = self.stcp.listening_address.clone();
        factory.stcpr_addr = self.stcpr_address.clone();
        factory.sudph_addr = self.sudph_address.clone();
        factory.pk_table = PkTable::new(
            self.stcp
                .pk_table
                .iter()
                .map(|(pk, addr)| (*pk, addr.clone())),
        );
        factory.resolver = resolver;
        factory.relay = relay;
        factory.encrypt = self.encrypt;
        factory
    }

    /// Open the configured log store.
    pub async fn log_store(&self) -> Result<Arc<dyn LogStore>, ConfigError> {
        Ok(match self.log_store.kind {
            LogStoreKind::Memory => Arc::new(MemoryLogStore::new()),
            LogStoreKind::File => Arc::new(FileLogStore::open(&self.log_store.location).await?),
        })
    }

    /// Transport discovery client: HTTP when a URL is set, in-memory otherwise.
    pub fn tpd(&self, keys: &Keypair) -> Arc<dyn TpdClient> {
        #[cfg(feature = "http")]
        if let Some(url) = &self.discovery.transport {
            let auth = crate::httpauth::AuthClient::new(url.clone(), keys.clone());
            return Arc::new(crate::transport::HttpTpd::new(auth));
        }
        let _ = keys;
        debug!("No transport discovery configured, using in-memory registry");
        Arc::new(MemoryTpd::new())
    }

    /// Address resolver client, when a URL is set.
    #[cfg(feature = "http")]
    pub fn address_resolver(&self, keys: &Keypair) -> Option<Arc<dyn AddressResolver>> {
        let url = self.discovery.address_resolver.as_ref()?;
        let auth = crate::httpauth::AuthClient::new(url.clone(), keys.clone());
        Some(Arc::new(crate::network::HttpResolver::new(auth)))
    }

    /// Manager configuration for `keys`.
    pub async fn manager_config(&self, keys: Keypair) -> Result<ManagerConfig, ConfigError> {
        let tpd = self.tpd(&keys);
        let log_store = self.log_store().await?;
        Ok(ManagerBuilder::new(keys)
            .tpd(tpd)
            .log_store(log_store)
            .persistent(self.persistent_transports.clone())
            .build())
    }

    /// Build a manager with a client for every enabled network.
    ///
    /// # Errors
    ///
    /// Fails with [`ConfigError::Unconfigured`] if an enabled network has no
    /// backend in `factory`.
    pub async fn build_manager(&self, factory: &ClientFactory) -> Result<Manager, ConfigError> {
        let manager = Manager::new(self.manager_config(factory.keys.clone()).await?);
        let mut networks = self.networks.clone();
        networks.sort();
        networks.dedup();
        for network in networks {
            let client = factory
                .make_client(network)
                .map_err(|_| ConfigError::Unconfigured(network))?;
            manager.add_client(client).await?;
        }
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = TransportConfig::from_json("{}").unwrap();
        assert_eq!(config, TransportConfig::default());
        assert!(config.encrypt);
        assert_eq!(config.networks, vec![NetworkType::Stcp]);
    }

    #[test]
    fn test_full_document() {
        let pk = Keypair::generate().pk();
        let json = format!(
            r#"{{
                "networks": ["stcp", "dmsg"],
                "stcp": {{
                    "listening_address": "127.0.0.1:7777",
                    "pk_table": {{ "{pk}": "10.0.0.2:7777" }}
                }},
                "discovery": {{ "transport": "http://tpd.local" }},
                "persistent_transports": [{{ "pk": "{pk}", "type": "stcp" }}],
                "log_store": {{ "type": "file", "location": "/var/lib/visor" }},
                "encrypt": false
            }}"#
        );
        let config = TransportConfig::from_json(&json).unwrap();
        assert_eq!(config.networks, vec![NetworkType::Stcp, NetworkType::Dmsg]);
        assert_eq!(config.stcp.pk_table.get(&pk).map(String::as_str), Some("10.0.0.2:7777"));
        assert_eq!(config.persistent_transports[0].network, NetworkType::Stcp);
        assert_eq!(config.log_store.kind, LogStoreKind::File);
        assert!(!config.encrypt);

        let factory = config.client_factory(Keypair::generate(), None, None);
        assert_eq!(factory.pk_table.addr(&pk), Some("10.0.0.2:7777"));
        assert_eq!(factory.stcp_addr, "127.0.0.1:7777");
        assert!(!factory.encrypt);
    }

    #[test]
    fn test_unknown_network_is_rejected() {
        let err = TransportConfig::from_json(r#"{"networks": ["carrier-pigeon"]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[tokio::test]
    async fn test_file_log_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransportConfig {
            log_store: LogStoreConfig {
                kind: LogStoreKind::File,
                location: dir.path().join("logs"),
            },
            ..TransportConfig::default()
        };
        config.log_store().await.unwrap();
        assert!(dir.path().join("logs").is_dir());
    }

    #[tokio::test]
    async fn test_build_manager() {
        let keys = Keypair::generate();
        let config = TransportConfig {
            stcp: StcpConfig {
                listening_address: "127.0.0.1:0".into(),
                pk_table: HashMap::new(),
            },
            ..TransportConfig::default()
        };
        let factory = config.client_factory(keys.clone(), None, None);
        let manager = config.build_manager(&factory).await.unwrap();
        assert_eq!(manager.networks(), vec![NetworkType::Stcp]);
        assert_eq!(manager.local_pk(), keys.pk());
        manager.close().await;

        let config = TransportConfig {
            networks: vec![NetworkType::Dmsg],
            ..TransportConfig::default()
        };
        let factory = config.client_factory(keys, None, None);
        assert!(matches!(
            config.build_manager(&factory).await,
            Err(ConfigError::Unconfigured(NetworkType::Dmsg))
        ));
    }
}
