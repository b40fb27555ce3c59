//! TCP byte streams behind the [`Duplex`] trait.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};

use crate::core::Duplex;

/// A TCP connection split into independently locked halves.
pub struct TcpDuplex {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
    local: SocketAddr,
    closed: watch::Sender<bool>,
}

impl TcpDuplex {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            peer,
            local,
            closed: watch::channel(false).0,
        })
    }

    /// Connect to `addr`.
    pub async fn connect(addr: &str) -> io::Result<Self> {
        Self::new(TcpStream::connect(addr).await?)
    }

    /// Address of the remote socket.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Address of the local socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[async_trait]
impl Duplex for TcpDuplex {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(0);
        }
        let mut reader = self.reader.lock().await;
        // A local close ends pending reads as end-of-stream.
        tokio::select! {
            res = reader.read(buf) => res,
            _ = closed.wait_for(|c| *c) => Ok(0),
        }
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        if *self.closed.borrow() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.writer.lock().await.write_all(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        // Shutting down the write half sends FIN, which ends the peer's reads.
        match self.writer.lock().await.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}
