//! Address resolver: maps visor keys to reachable socket addresses for the
//! `stcpr` and `sudph` backends.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::NetworkType;
use crate::crypto::PubKey;
use crate::httpauth::AuthError;

/// Address resolver errors.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// No address is bound for the key.
    #[error("no entry for {0}")]
    NotFound(PubKey),

    /// The resolver refused or failed the request.
    #[error("resolver unavailable: {0}")]
    Unavailable(String),

    /// Authenticated request failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A body could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl ResolverError {
    /// Whether the key has no bound address.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Port and interface addresses a visor listens on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAddresses {
    /// Listening port.
    pub port: String,
    /// Interface addresses, without port.
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// What the resolver knows about a visor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisorData {
    /// Address the visor was seen from.
    pub remote_addr: String,
    /// Whether the visor shares the caller's network.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_local: bool,
    /// Addresses the visor reported when binding.
    #[serde(flatten)]
    pub local: LocalAddresses,
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

impl VisorData {
    /// Socket addresses to try, local ones first.
    pub fn candidates(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.is_local {
            out.extend(
                self.local
                    .addresses
                    .iter()
                    .map(|host| join_host_port(host, &self.local.port)),
            );
        }
        let has_port = self
            .remote_addr
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if has_port {
            out.push(self.remote_addr.clone());
        } else if !self.remote_addr.is_empty() {
            out.push(join_host_port(&self.remote_addr, &self.local.port));
        }
        out
    }
}

/// Client contract of the address resolver.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Where `pk` can be reached over `network`.
    async fn resolve(&self, network: NetworkType, pk: &PubKey) -> Result<VisorData, ResolverError>;

    /// Publish that `pk` listens for `network` at `local`.
    async fn bind(
        &self,
        network: NetworkType,
        pk: &PubKey,
        local: LocalAddresses,
    ) -> Result<(), ResolverError>;
}

/// In-process resolver.
#[derive(Clone, Default)]
pub struct MemoryResolver {
    entries: Arc<RwLock<HashMap<(NetworkType, PubKey), VisorData>>>,
}

impl MemoryResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entry directly.
    pub async fn insert(&self, network: NetworkType, pk: PubKey, data: VisorData) {
        self.entries.write().await.insert((network, pk), data);
    }
}

#[async_trait]
impl AddressResolver for MemoryResolver {
    async fn resolve(&self, network: NetworkType, pk: &PubKey) -> Result<VisorData, ResolverError> {
        self.entries
            .read()
            .await
            .get(&(network, *pk))
            .cloned()
            .ok_or(ResolverError::NotFound(*pk))
    }

    async fn bind(
        &self,
        network: NetworkType,
        pk: &PubKey,
        local: LocalAddresses,
    ) -> Result<(), ResolverError> {
        let host = local
            .addresses
            .first()
            .cloned()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let data = VisorData {
            remote_addr: join_host_port(&host, &local.port),
            is_local: false,
            local,
        };
        self.insert(network, *pk, data).await;
        Ok(())
    }
}

#[cfg(feature = "http")]
pub use http::HttpResolver;

#[cfg(feature = "http")]
mod http {
    use async_trait::async_trait;
    use reqwest::{Method, StatusCode};
    use tracing::debug;

    use super::{AddressResolver, LocalAddresses, ResolverError, VisorData};
    use crate::core::NetworkType;
    use crate::crypto::PubKey;
    use crate::httpauth::AuthClient;

    /// Address resolver reached over nonce-authenticated HTTP.
    pub struct HttpResolver {
        auth: AuthClient,
    }

    impl HttpResolver {
        /// Create a resolver client over `auth`.
        pub fn new(auth: AuthClient) -> Self {
            Self { auth }
        }
    }

    #[async_trait]
    impl AddressResolver for HttpResolver {
        async fn resolve(
            &self,
            network: NetworkType,
            pk: &PubKey,
        ) -> Result<VisorData, ResolverError> {
            let path = format!("/resolve/{network}/{pk}");
            let resp = self.auth.send(Method::GET, &path, None).await?;
            if resp.status == StatusCode::NOT_FOUND {
                return Err(ResolverError::NotFound(*pk));
            }
            if !resp.is_success() {
                return Err(ResolverError::Unavailable(format!(
                    "status {}: {}",
                    resp.status,
                    resp.error_message()
                )));
            }
            Ok(resp.json()?)
        }

        async fn bind(
            &self,
            network: NetworkType,
            _pk: &PubKey,
            local: LocalAddresses,
        ) -> Result<(), ResolverError> {
            let path = format!("/bind/{network}");
            let body = serde_json::to_vec(&local)?;
            let resp = self.auth.send(Method::POST, &path, Some(body)).await?;
            if !resp.is_success() {
                return Err(ResolverError::Unavailable(format!(
                    "status {}: {}",
                    resp.status,
                    resp.error_message()
                )));
            }
            debug!(network = %network, port = %local.port, "Bound to address resolver");
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use serde_json::json;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        use super::*;
        use crate::crypto::Keypair;

        async fn resolver(server: &MockServer, kp: &Keypair) -> HttpResolver {
            let auth = AuthClient::new(server.uri(), kp.clone());
            auth.set_nonce(0).await;
            HttpResolver::new(auth)
        }

        #[tokio::test]
        async fn test_resolve_and_not_found() {
            let server = MockServer::start().await;
            let kp = Keypair::generate();
            let known = Keypair::generate().pk();
            let unknown = Keypair::generate().pk();
            Mock::given(method("GET"))
                .and(path(format!("/resolve/stcpr/{known}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "remote_addr": "203.0.113.5:7777",
                    "port": "7777",
                    "addresses": ["192.168.1.4"]
                })))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path(format!("/resolve/stcpr/{unknown}")))
                .respond_with(ResponseTemplate::new(404))
                .mount(&server)
                .await;

            let r = resolver(&server, &kp).await;
            let data = r.resolve(NetworkType::Stcpr, &known).await.unwrap();
            assert_eq!(data.candidates(), vec!["203.0.113.5:7777".to_string()]);
            assert!(
                r.resolve(NetworkType::Stcpr, &unknown)
                    .await
                    .unwrap_err()
                    .is_not_found()
            );
        }

        #[tokio::test]
        async fn test_bind_posts_local_addresses() {
            let server = MockServer::start().await;
            let kp = Keypair::generate();
            Mock::given(method("POST"))
                .and(path("/bind/stcpr"))
                .and(wiremock::matchers::body_json(json!({
                    "port": "7777",
                    "addresses": ["10.0.0.2"]
                })))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;

            let r = resolver(&server, &kp).await;
            let local = LocalAddresses {
                port: "7777".into(),
                addresses: vec!["10.0.0.2".into()],
            };
            r.bind(NetworkType::Stcpr, &kp.pk(), local).await.unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn test_candidates_prefer_local() {
        let data = VisorData {
            remote_addr: "198.51.100.1".into(),
            is_local: true,
            local: LocalAddresses {
                port: "9000".into(),
                addresses: vec!["10.0.0.7".into(), "fe80::1".into()],
            },
        };
        assert_eq!(
            data.candidates(),
            vec![
                "10.0.0.7:9000".to_string(),
                "[fe80::1]:9000".to_string(),
                "198.51.100.1:9000".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_memory_bind_then_resolve() {
        let r = MemoryResolver::new();
        let pk = Keypair::generate().pk();
        assert!(r.resolve(NetworkType::Sudph, &pk).await.unwrap_err().is_not_found());

        let local = LocalAddresses {
            port: "4000".into(),
            addresses: vec![],
        };
        r.bind(NetworkType::Sudph, &pk, local).await.unwrap();
        let data = r.resolve(NetworkType::Sudph, &pk).await.unwrap();
        assert_eq!(data.candidates(), vec!["127.0.0.1:4000".to_string()]);
        assert!(r.resolve(NetworkType::Stcpr, &pk).await.is_err());
    }
}
