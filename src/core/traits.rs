//! Core traits for the visor transport layer.
//!
//! Every byte stream in the crate (TCP halves, KCP sessions, Noise channels,
//! relay streams) is driven through [`Duplex`], which takes `&self` so one
//! connection can be shared between a reader task and concurrent writers.

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use super::addr::{Addr, NetworkType};

/// A full-duplex byte stream shared behind `&self`.
///
/// # Requirements
///
/// - `read` returning `Ok(0)` means end-of-stream
/// - `write_all` MUST write the whole buffer or fail
/// - `close` MUST be idempotent
#[async_trait]
pub trait Duplex: Send + Sync {
    /// Read up to `buf.len()` bytes, returning how many were read.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer.
    async fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// Close the stream.
    async fn close(&self) -> io::Result<()>;

    /// Fill `buf` completely or fail with `UnexpectedEof`.
    async fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            filled += n;
        }
        Ok(())
    }
}

/// A duplex stream addressed by `(public key, port)` on both ends.
///
/// This is what network clients hand to the transport layer.
pub trait TransportConn: Duplex {
    /// Local logical address.
    fn local_addr(&self) -> Addr;

    /// Remote logical address.
    fn remote_addr(&self) -> Addr;

    /// Backend the connection runs over.
    fn network_type(&self) -> NetworkType;
}

impl fmt::Debug for dyn TransportConn + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConn")
            .field("local", &self.local_addr())
            .field("remote", &self.remote_addr())
            .field("network", &self.network_type())
            .finish()
    }
}

/// Write `payload` preceded by its length as a big-endian u16.
pub async fn write_prefixed<D: Duplex + ?Sized>(io: &D, payload: &[u8]) -> io::Result<()> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds u16 length prefix", payload.len()),
        )
    })?;
    let mut buf = Vec::with_capacity(2 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    io.write_all(&buf).await
}

/// Read one frame written by [`write_prefixed`].
pub async fn read_prefixed<D: Duplex + ?Sized>(io: &D) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 2];
    io.read_exact(&mut len).await?;
    let mut buf = vec![0u8; u16::from_be_bytes(len) as usize];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

/// One end of an in-memory duplex pipe.
pub struct MemoryDuplex {
    reader: Mutex<ReadHalf<DuplexStream>>,
    writer: Mutex<WriteHalf<DuplexStream>>,
}

/// Create a connected pair of in-memory duplex streams.
///
/// `capacity` bounds the bytes buffered in each direction.
pub fn memory_pipe(capacity: usize) -> (MemoryDuplex, MemoryDuplex) {
    let (a, b) = tokio::io::duplex(capacity);
    (MemoryDuplex::new(a), MemoryDuplex::new(b))
}

impl MemoryDuplex {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

impl fmt::Debug for MemoryDuplex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDuplex").finish_non_exhaustive()
    }
}

#[async_trait]
impl Duplex for MemoryDuplex {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        self.writer.lock().await.write_all(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefixed_frames() {
        let (a, b) = memory_pipe(1024);
        write_prefixed(&a, b"hello").await.unwrap();
        write_prefixed(&a, b"").await.unwrap();

        assert_eq!(read_prefixed(&b).await.unwrap(), b"hello");
        assert!(read_prefixed(&b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prefixed_frame_too_long() {
        let (a, _b) = memory_pipe(16);
        let big = vec![0u8; u16::MAX as usize + 1];
        let err = write_prefixed(&a, &big).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    struct Fixed(MemoryDuplex);

    #[async_trait]
    impl Duplex for Fixed {
        async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf).await
        }

        async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
            self.0.write_all(buf).await
        }

        async fn close(&self) -> io::Result<()> {
            self.0.close().await
        }
    }

    impl TransportConn for Fixed {
        fn local_addr(&self) -> Addr {
            Addr::new(Default::default(), 45)
        }

        fn remote_addr(&self) -> Addr {
            Addr::new(Default::default(), 50000)
        }

        fn network_type(&self) -> NetworkType {
            NetworkType::Sudph
        }
    }

    #[test]
    fn test_connections_are_debug() {
        let (a, b) = memory_pipe(8);
        let conn: std::sync::Arc<dyn TransportConn> = std::sync::Arc::new(Fixed(a));
        let shown = format!("{conn:?}");
        assert!(shown.contains("TransportConn") && shown.contains("Sudph"));

        let failed: Result<std::sync::Arc<dyn TransportConn>, io::Error> =
            Err(io::ErrorKind::ConnectionRefused.into());
        assert_eq!(failed.unwrap_err().kind(), io::ErrorKind::ConnectionRefused);
        assert!(format!("{b:?}").starts_with("MemoryDuplex"));
    }

    #[tokio::test]
    async fn test_read_exact_eof() {
        let (a, b) = memory_pipe(16);
        a.write_all(b"ab").await.unwrap();
        a.close().await.unwrap();

        let mut buf = [0u8; 4];
        let err = b.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
