//! Builds the network client for each configured backend.

use std::sync::Arc;

use super::{
    AddressResolver, Backend, GenericClient, GenericClientBuilder, NetworkClient, NetworkError,
    PkTable,
};
use crate::client::Client;
use crate::core::NetworkType;
use crate::crypto::Keypair;

/// Everything needed to construct network clients for one visor.
#[derive(Clone)]
pub struct ClientFactory {
    /// Local keys.
    pub keys: Keypair,
    /// Listening address of `stcp`.
    pub stcp_addr: String,
    /// Listening address of `stcpr`.
    pub stcpr_addr: String,
    /// Listening address of `sudph`.
    pub sudph_addr: String,
    /// Static table used by `stcp`.
    pub pk_table: PkTable,
    /// Resolver used by `stcpr` and `sudph`.
    pub resolver: Option<Arc<dyn AddressResolver>>,
    /// Relay client used as the `dmsg` backend.
    pub relay: Option<Client>,
    /// Whether direct connections are encrypted.
    pub encrypt: bool,
}

impl ClientFactory {
    /// A factory with no backends configured beyond an empty `stcp` table.
    pub fn new(keys: Keypair) -> Self {
        Self {
            keys,
            stcp_addr: "0.0.0.0:0".to_string(),
            stcpr_addr: "0.0.0.0:0".to_string(),
            sudph_addr: "0.0.0.0:0".to_string(),
            pk_table: PkTable::default(),
            resolver: None,
            relay: None,
            encrypt: true,
        }
    }

    fn generic(&self, backend: Backend, listen_addr: &str) -> Arc<dyn NetworkClient> {
        let config = GenericClientBuilder::new()
            .listen_addr(listen_addr)
            .encrypt(self.encrypt)
            .build();
        Arc::new(GenericClient::new(self.keys.clone(), backend, config))
    }

    /// Build the client for `network`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::UnknownNetwork`] if the backend it needs is
    /// not configured.
    pub fn make_client(&self, network: NetworkType) -> Result<Arc<dyn NetworkClient>, NetworkError> {
        let unknown = || NetworkError::UnknownNetwork(network);
        match network {
            NetworkType::Stcp => Ok(self.generic(Backend::Stcp(self.pk_table.clone()), &self.stcp_addr)),
            NetworkType::Stcpr => {
                let resolver = self.resolver.clone().ok_or_else(unknown)?;
                Ok(self.generic(Backend::Stcpr(resolver), &self.stcpr_addr))
            }
            NetworkType::Sudph => {
                let resolver = self.resolver.clone().ok_or_else(unknown)?;
                Ok(self.generic(Backend::Sudph(resolver), &self.sudph_addr))
            }
            NetworkType::Dmsg => {
                let relay = self.relay.clone().ok_or_else(unknown)?;
                Ok(Arc::new(relay))
            }
        }
    }

    /// Build every client whose backend is configured.
    pub fn make_all(&self) -> Vec<Arc<dyn NetworkClient>> {
        NetworkType::ALL
            .iter()
            .filter_map(|network| self.make_client(*network).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryResolver;

    #[test]
    fn test_missing_backends_are_unknown() {
        let factory = ClientFactory::new(Keypair::generate());
        assert_eq!(
            factory.make_client(NetworkType::Stcp).unwrap().network_type(),
            NetworkType::Stcp
        );
        assert!(matches!(
            factory.make_client(NetworkType::Stcpr),
            Err(NetworkError::UnknownNetwork(NetworkType::Stcpr))
        ));
        assert!(matches!(
            factory.make_client(NetworkType::Dmsg),
            Err(NetworkError::UnknownNetwork(NetworkType::Dmsg))
        ));
        assert_eq!(factory.make_all().len(), 1);
    }

    #[test]
    fn test_resolver_enables_stcpr_and_sudph() {
        let mut factory = ClientFactory::new(Keypair::generate());
        factory.resolver = Some(Arc::new(MemoryResolver::new()));
        let networks: Vec<_> = factory.make_all().iter().map(|c| c.network_type()).collect();
        assert_eq!(
            networks,
            vec![NetworkType::Stcp, NetworkType::Stcpr, NetworkType::Sudph]
        );
    }
}
