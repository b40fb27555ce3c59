//! Reliable byte streams over UDP, carried by KCP.
//!
//! [`KcpAcceptor`] demultiplexes one UDP socket into a KCP session per
//! remote conversation; [`KcpDuplex::connect`] dials from a fresh socket.
//! KCP has no end-of-stream signal: a closed peer is noticed when its
//! session expires.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, watch};
use tokio_kcp::{KcpConfig, KcpListener, KcpNoDelayConfig, KcpStream};
use tracing::debug;

use crate::core::{Duplex, KCP_MTU, KCP_WINDOW_SIZE};

fn kcp_error(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::other(e)
}

/// KCP settings shared by dialers and acceptors.
pub fn kcp_config() -> KcpConfig {
    let mut config = KcpConfig::default();
    config.mtu = KCP_MTU;
    config.nodelay = KcpNoDelayConfig::fastest();
    config.wnd_size = (KCP_WINDOW_SIZE, KCP_WINDOW_SIZE);
    config.stream = true;
    config
}

/// One KCP session split into independently locked halves.
pub struct KcpDuplex {
    reader: Mutex<ReadHalf<KcpStream>>,
    writer: Mutex<WriteHalf<KcpStream>>,
    peer: SocketAddr,
    closed: watch::Sender<bool>,
}

impl KcpDuplex {
    fn new(stream: KcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer,
            closed: watch::channel(false).0,
        }
    }

    /// Dial `addr` from a fresh ephemeral socket.
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let peer = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, addr.to_string()))?;
        let stream = KcpStream::connect(&kcp_config(), peer)
            .await
            .map_err(kcp_error)?;
        Ok(Self::new(stream, peer))
    }

    /// Address of the remote socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Duplex for KcpDuplex {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(0);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            res = reader.read(buf) => res,
            _ = closed.wait_for(|c| *c) => Ok(0),
        }
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        if *self.closed.borrow() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await?;
        writer.flush().await
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        self.writer.lock().await.shutdown().await
    }
}

/// Accepts KCP sessions on one UDP socket.
pub struct KcpAcceptor {
    listener: Mutex<KcpListener>,
    local: SocketAddr,
    closed: watch::Sender<bool>,
}

impl KcpAcceptor {
    /// Bind a UDP socket on `addr`.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = KcpListener::bind(kcp_config(), addr)
            .await
            .map_err(kcp_error)?;
        let local = listener.local_addr()?;
        debug!(addr = %local, "Accepting KCP sessions");
        Ok(Self {
            listener: Mutex::new(listener),
            local,
            closed: watch::channel(false).0,
        })
    }

    /// Address of the UDP socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Next session opened by a remote.
    pub async fn accept(&self) -> io::Result<KcpDuplex> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let mut listener = self.listener.lock().await;
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.map_err(kcp_error)?;
                Ok(KcpDuplex::new(stream, peer))
            }
            _ = closed.wait_for(|c| *c) => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Stop accepting. Sessions already handed out stay open.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kcp_stream_round_trip() {
        let acceptor = KcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().to_string();

        let client = KcpDuplex::connect(&addr).await.unwrap();
        let payload: Vec<u8> = (0..64_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });
        let server = acceptor.accept().await.unwrap();
        assert_eq!(server.peer_addr().ip(), acceptor.local_addr().ip());
        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);

        let client = writer.await.unwrap();
        server.write_all(b"bye").await.unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bye");

        client.close().await.unwrap();
        client.close().await.unwrap();
        let mut rest = [0u8; 1];
        assert_eq!(client.read(&mut rest).await.unwrap(), 0);
        assert!(client.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_acceptor_stops_accepting() {
        let acceptor = std::sync::Arc::new(KcpAcceptor::bind("127.0.0.1:0").await.unwrap());
        let waiter = {
            let acceptor = std::sync::Arc::clone(&acceptor);
            tokio::spawn(async move { acceptor.accept().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        acceptor.close();

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(acceptor.accept().await.is_err());
    }
}
