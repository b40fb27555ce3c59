//! Transport discovery client: where settled transports are registered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use super::{Entry, SignedEntry, Status};
use crate::crypto::PubKey;
use crate::httpauth::AuthError;

/// Transport discovery errors.
#[derive(Debug, Error)]
pub enum TpdError {
    /// The service answered with an error status.
    #[error("transport discovery returned status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error message from the body.
        message: String,
    },

    /// The service could not be reached.
    #[error("transport discovery unavailable: {0}")]
    Unavailable(String),

    /// Authenticated request failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// A body could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl TpdError {
    /// Whether the entry is already registered.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Status { status: 409, .. })
    }

    /// Whether the entry does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }

    fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }
}

/// Client contract of transport discovery.
#[async_trait]
pub trait TpdClient: Send + Sync {
    /// Register doubly signed entries.
    async fn register_transports(&self, entries: &[SignedEntry]) -> Result<(), TpdError>;

    /// Entry with the given ID.
    async fn transport_by_id(&self, id: Uuid) -> Result<Entry, TpdError>;

    /// Entries having `pk` as an edge.
    async fn transports_by_edge(&self, pk: &PubKey) -> Result<Vec<Entry>, TpdError>;

    /// Remove the entry with the given ID.
    async fn delete_transport(&self, id: Uuid) -> Result<(), TpdError>;

    /// Report which transports are up.
    async fn update_statuses(&self, statuses: &[Status]) -> Result<(), TpdError>;
}

/// In-process transport discovery.
#[derive(Debug, Default)]
pub struct MemoryTpd {
    entries: parking_lot::RwLock<HashMap<Uuid, SignedEntry>>,
    statuses: parking_lot::RwLock<HashMap<Uuid, bool>>,
    offline: AtomicBool,
}

impl MemoryTpd {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the service were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Stored entry with the given ID.
    pub fn signed_entry(&self, id: &Uuid) -> Option<SignedEntry> {
        self.entries.read().get(id).cloned()
    }

    /// Last reported status of `id`.
    pub fn status(&self, id: &Uuid) -> Option<bool> {
        self.statuses.read().get(id).copied()
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn check_online(&self) -> Result<(), TpdError> {
        if self.offline.load(Ordering::Acquire) {
            return Err(TpdError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TpdClient for MemoryTpd {
    async fn register_transports(&self, entries: &[SignedEntry]) -> Result<(), TpdError> {
        self.check_online()?;
        let mut stored = self.entries.write();
        for se in entries {
            let verified = se.entry.edges.iter().all(|edge| se.verify(edge));
            if !verified {
                return Err(TpdError::status(400, "invalid entry signature"));
            }
            if stored.contains_key(&se.entry.id) {
                return Err(TpdError::status(409, "transport already registered"));
            }
        }
        for se in entries {
            stored.insert(se.entry.id, se.clone());
        }
        Ok(())
    }

    async fn transport_by_id(&self, id: Uuid) -> Result<Entry, TpdError> {
        self.check_online()?;
        self.entries
            .read()
            .get(&id)
            .map(|se| se.entry.clone())
            .ok_or_else(|| TpdError::status(404, "transport not found"))
    }

    async fn transports_by_edge(&self, pk: &PubKey) -> Result<Vec<Entry>, TpdError> {
        self.check_online()?;
        Ok(self
            .entries
            .read()
            .values()
            .filter(|se| se.entry.has_edge(pk))
            .map(|se| se.entry.clone())
            .collect())
    }

    async fn delete_transport(&self, id: Uuid) -> Result<(), TpdError> {
        self.check_online()?;
        self.statuses.write().remove(&id);
        self.entries
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| TpdError::status(404, "transport not found"))
    }

    async fn update_statuses(&self, statuses: &[Status]) -> Result<(), TpdError> {
        self.check_online()?;
        let mut stored = self.statuses.write();
        for status in statuses {
            stored.insert(status.id, status.is_up);
        }
        Ok(())
    }
}

#[cfg(feature = "http")]
pub use http::HttpTpd;

#[cfg(feature = "http")]
mod http {
    use async_trait::async_trait;
    use reqwest::Method;
    use tracing::debug;
    use uuid::Uuid;

    use super::{TpdClient, TpdError};
    use crate::crypto::PubKey;
    use crate::httpauth::{AuthClient, AuthResponse};
    use crate::transport::{Entry, SignedEntry, Status};

    /// Transport discovery reached over nonce-authenticated HTTP.
    #[derive(Debug)]
    pub struct HttpTpd {
        auth: AuthClient,
    }

    impl HttpTpd {
        /// Create a client over `auth`.
        pub fn new(auth: AuthClient) -> Self {
            Self { auth }
        }

        async fn call(
            &self,
            method: Method,
            path: &str,
            body: Option<Vec<u8>>,
        ) -> Result<AuthResponse, TpdError> {
            let resp = self.auth.send(method, path, body).await?;
            if !resp.is_success() {
                return Err(TpdError::Status {
                    status: resp.status.as_u16(),
                    message: resp.error_message(),
                });
            }
            Ok(resp)
        }
    }

    #[async_trait]
    impl TpdClient for HttpTpd {
        async fn register_transports(&self, entries: &[SignedEntry]) -> Result<(), TpdError> {
            if entries.is_empty() {
                return Ok(());
            }
            let body = serde_json::to_vec(entries)?;
            self.call(Method::POST, "/transports/", Some(body)).await?;
            debug!(count = entries.len(), "Registered transports");
            Ok(())
        }

        async fn transport_by_id(&self, id: Uuid) -> Result<Entry, TpdError> {
            let resp = self
                .call(Method::GET, &format!("/transports/id:{id}"), None)
                .await?;
            Ok(resp.json()?)
        }

        async fn transports_by_edge(&self, pk: &PubKey) -> Result<Vec<Entry>, TpdError> {
            let resp = self
                .call(Method::GET, &format!("/transports/edge:{pk}"), None)
                .await?;
            Ok(resp.json()?)
        }

        async fn delete_transport(&self, id: Uuid) -> Result<(), TpdError> {
            self.call(Method::DELETE, &format!("/transports/id:{id}"), None)
                .await?;
            Ok(())
        }

        async fn update_statuses(&self, statuses: &[Status]) -> Result<(), TpdError> {
            if statuses.is_empty() {
                return Ok(());
            }
            let body = serde_json::to_vec(statuses)?;
            self.call(Method::POST, "/statuses", Some(body)).await?;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use serde_json::json;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        use super::*;
        use crate::core::NetworkType;
        use crate::crypto::Keypair;
        use crate::transport::Label;

        async fn client(server: &MockServer) -> HttpTpd {
            let auth = AuthClient::new(server.uri(), Keypair::generate());
            auth.set_nonce(1).await;
            HttpTpd::new(auth)
        }

        #[tokio::test]
        async fn test_register_and_lookup() {
            let server = MockServer::start().await;
            let ka = Keypair::generate();
            let kb = Keypair::generate();
            let entry = Entry::new(ka.pk(), kb.pk(), NetworkType::Stcpr, Label::User);
            let mut se = SignedEntry::new(entry.clone(), &ka).unwrap();
            se.sign(&kb).unwrap();

            Mock::given(method("POST"))
                .and(path("/transports/"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path(format!("/transports/id:{}", entry.id)))
                .respond_with(ResponseTemplate::new(200).set_body_json(&entry))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path(format!("/transports/edge:{}", ka.pk())))
                .respond_with(ResponseTemplate::new(200).set_body_json(vec![&entry]))
                .mount(&server)
                .await;

            let tpd = client(&server).await;
            tpd.register_transports(&[se]).await.unwrap();
            assert_eq!(tpd.transport_by_id(entry.id).await.unwrap(), entry);
            assert_eq!(tpd.transports_by_edge(&ka.pk()).await.unwrap(), vec![entry]);
        }

        #[tokio::test]
        async fn test_error_statuses() {
            let server = MockServer::start().await;
            let id = Uuid::new_v4();
            Mock::given(method("DELETE"))
                .and(path(format!("/transports/id:{id}")))
                .respond_with(
                    ResponseTemplate::new(404).set_body_json(json!({"error": "transport not found"})),
                )
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/transports/"))
                .respond_with(ResponseTemplate::new(409))
                .mount(&server)
                .await;

            let tpd = client(&server).await;
            let err = tpd.delete_transport(id).await.unwrap_err();
            assert!(err.is_not_found());

            let kp = Keypair::generate();
            let entry = Entry::new(kp.pk(), Keypair::generate().pk(), NetworkType::Dmsg, Label::User);
            let se = SignedEntry::new(entry, &kp).unwrap();
            assert!(tpd.register_transports(&[se]).await.unwrap_err().is_conflict());
        }
    }
}
