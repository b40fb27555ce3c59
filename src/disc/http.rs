//! HTTP client of the relay discovery service.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use super::client::republish;
use super::{DiscEntry, DiscoveryClient, DiscoveryError};
use crate::crypto::PubKey;

#[derive(Deserialize)]
struct HttpMessage {
    message: String,
}

/// Discovery reached over HTTP.
#[derive(Clone)]
pub struct HttpDiscovery {
    client: reqwest::Client,
    address: String,
    // Serializes put_entry so sequence bumps do not race.
    update: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl HttpDiscovery {
    /// Create a client for the discovery at `address`.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into().trim_end_matches('/').to_string();
        debug!(addr = %address, "Created discovery HTTP client");
        Self {
            client: reqwest::Client::new(),
            address,
            update: Default::default(),
        }
    }

    async fn error_from(resp: reqwest::Response) -> DiscoveryError {
        let status = resp.status();
        match resp.json::<HttpMessage>().await {
            Ok(msg) => DiscoveryError::from_message(&msg.message),
            Err(_) if status == StatusCode::NOT_FOUND => DiscoveryError::NotFound,
            Err(e) => DiscoveryError::Unavailable(format!("status {status}: {e}")),
        }
    }
}

fn unavailable(e: reqwest::Error) -> DiscoveryError {
    DiscoveryError::Unavailable(e.to_string())
}

#[async_trait]
impl DiscoveryClient for HttpDiscovery {
    async fn entry(&self, pk: &PubKey) -> Result<DiscEntry, DiscoveryError> {
        let url = format!("{}/dmsg-discovery/entry/{}", self.address, pk);
        let resp = self.client.get(&url).send().await.map_err(unavailable)?;
        if resp.status() != StatusCode::OK {
            return Err(Self::error_from(resp).await);
        }
        resp.json().await.map_err(unavailable)
    }

    async fn post_entry(&self, entry: &DiscEntry) -> Result<(), DiscoveryError> {
        let url = format!("{}/dmsg-discovery/entry/", self.address);
        let resp = self
            .client
            .post(&url)
            .query(&[("timeout", "true")])
            .json(entry)
            .send()
            .await
            .map_err(unavailable)?;
        if resp.status() != StatusCode::OK {
            let status = resp.status();
            let err = Self::error_from(resp).await;
            warn!(url = %url, status = %status, error = %err, "Discovery rejected entry");
            return Err(err);
        }
        Ok(())
    }

    async fn available_servers(&self) -> Result<Vec<DiscEntry>, DiscoveryError> {
        let url = format!("{}/dmsg-discovery/available_servers", self.address);
        let resp = self.client.get(&url).send().await.map_err(unavailable)?;
        if resp.status() != StatusCode::OK {
            return Err(Self::error_from(resp).await);
        }
        resp.json().await.map_err(unavailable)
    }

    async fn put_entry(
        &self,
        sk: &crate::crypto::SecKey,
        entry: &mut DiscEntry,
    ) -> Result<(), DiscoveryError> {
        let _guard = self.update.lock().await;
        republish(self, sk, entry).await
    }
}
