//! The relay client as a network backend.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::{NetworkClient, NetworkError, TransportListener};
use crate::client::Client;
use crate::core::{Addr, NetworkType, TransportConn};
use crate::crypto::PubKey;
use crate::relay::RelayError;

fn relay_error(err: RelayError, port: u16) -> NetworkError {
    match err {
        RelayError::PortOccupied => NetworkError::PortOccupied(port),
        RelayError::EntityClosed => NetworkError::Closed,
        other => NetworkError::Relay(other),
    }
}

#[async_trait]
impl NetworkClient for Client {
    async fn dial(&self, remote: PubKey, port: u16) -> Result<Arc<dyn TransportConn>, NetworkError> {
        let stream = Client::dial(self, Addr::new(remote, port))
            .await
            .map_err(|e| relay_error(e, port))?;
        Ok(stream as Arc<dyn TransportConn>)
    }

    async fn listen(&self, port: u16) -> Result<Arc<dyn TransportListener>, NetworkError> {
        let listener = Client::listen(self, port).map_err(|e| relay_error(e, port))?;
        Ok(listener as Arc<dyn TransportListener>)
    }

    async fn start(&self) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        let client = self.clone();
        tokio::spawn(async move { client.serve().await });
        Ok(())
    }

    async fn close(&self) {
        Client::close(self).await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn pk(&self) -> PubKey {
        Client::pk(self)
    }

    fn network_type(&self) -> NetworkType {
        NetworkType::Dmsg
    }
}
