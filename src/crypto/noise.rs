//! Noise handshakes and encrypted duplex channels.
//!
//! Relay sessions use `Noise_XK`: the client knows the relay server's key in
//! advance and proves its own identity in the final message.
//!
//! ```text
//! Noise_XK(s, rs):
//!   <- s
//!   ...
//!   -> e, es
//!   <- e, ee
//!   -> s, se                # payload: initiator's Ed25519 public key
//! ```
//!
//! Raw transports that opt into encryption run `Noise_KK` after the address
//! negotiation, when both sides already know each other's key.
//!
//! ```text
//! Noise_KK(s, rs):
//!   -> s
//!   <- s
//!   ...
//!   -> e, es, ss
//!   <- e, ee, se
//! ```
//!
//! Every Noise message travels with a big-endian u16 length prefix.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use snow::{Builder, HandshakeState, TransportState};
use tokio::sync::Mutex;

use super::{Keypair, PubKey};
use crate::core::{
    CryptoError, Duplex, NOISE_MAX_MESSAGE_LEN, NOISE_MAX_PAYLOAD_LEN, read_prefixed,
    write_prefixed,
};

/// Noise pattern for relay sessions.
const XK_PATTERN: &str = "Noise_XK_25519_ChaChaPoly_BLAKE2s";

/// Noise pattern for encrypted raw transports.
const KK_PATTERN: &str = "Noise_KK_25519_ChaChaPoly_BLAKE2s";

fn builder<'a>(pattern: &str) -> Result<Builder<'a>, CryptoError> {
    let params = pattern
        .parse()
        .map_err(|e: snow::Error| CryptoError::HandshakeFailed(e.to_string()))?;
    Ok(Builder::new(params))
}

async fn send_handshake(
    io: &dyn Duplex,
    state: &mut HandshakeState,
    payload: &[u8],
) -> Result<(), CryptoError> {
    let mut buf = vec![0u8; NOISE_MAX_MESSAGE_LEN];
    let len = state
        .write_message(payload, &mut buf)
        .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
    write_prefixed(io, &buf[..len]).await?;
    Ok(())
}

async fn recv_handshake(
    io: &dyn Duplex,
    state: &mut HandshakeState,
) -> Result<Vec<u8>, CryptoError> {
    let msg = read_prefixed(io).await?;
    let mut payload = vec![0u8; NOISE_MAX_MESSAGE_LEN];
    let len = state
        .read_message(&msg, &mut payload)
        .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;
    payload.truncate(len);
    Ok(payload)
}

fn into_transport(state: HandshakeState) -> Result<TransportState, CryptoError> {
    state
        .into_transport_mode()
        .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))
}

/// Run the `Noise_XK` initiator over `io`.
///
/// `remote` is the responder's identity, known in advance.
pub async fn initiate_xk(
    io: Arc<dyn Duplex>,
    local: &Keypair,
    remote: &PubKey,
) -> Result<NoiseDuplex, CryptoError> {
    let private = local.sk().noise_private();
    let remote_static = remote.noise_public()?;
    let mut state = builder(XK_PATTERN)?
        .local_private_key(&private[..])
        .remote_public_key(&remote_static)
        .build_initiator()
        .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;

    send_handshake(io.as_ref(), &mut state, &[]).await?;
    recv_handshake(io.as_ref(), &mut state).await?;
    send_handshake(io.as_ref(), &mut state, local.pk().as_bytes()).await?;

    Ok(NoiseDuplex::new(io, into_transport(state)?, *remote))
}

/// Run the `Noise_XK` responder over `io`.
///
/// Returns the channel and the initiator's verified identity.
pub async fn respond_xk(
    io: Arc<dyn Duplex>,
    local: &Keypair,
) -> Result<(NoiseDuplex, PubKey), CryptoError> {
    let private = local.sk().noise_private();
    let mut state = builder(XK_PATTERN)?
        .local_private_key(&private[..])
        .build_responder()
        .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;

    recv_handshake(io.as_ref(), &mut state).await?;
    send_handshake(io.as_ref(), &mut state, &[]).await?;
    let claimed = recv_handshake(io.as_ref(), &mut state).await?;

    let remote = PubKey::from_slice(&claimed)?;
    let proven = state
        .get_remote_static()
        .ok_or_else(|| CryptoError::HandshakeFailed("no remote static key".into()))?;
    if proven != remote.noise_public()? {
        return Err(CryptoError::RemoteKeyMismatch);
    }

    Ok((NoiseDuplex::new(io, into_transport(state)?, remote), remote))
}

/// Run the `Noise_KK` initiator over `io`.
pub async fn initiate_kk(
    io: Arc<dyn Duplex>,
    local: &Keypair,
    remote: &PubKey,
) -> Result<NoiseDuplex, CryptoError> {
    let private = local.sk().noise_private();
    let remote_static = remote.noise_public()?;
    let mut state = builder(KK_PATTERN)?
        .local_private_key(&private[..])
        .remote_public_key(&remote_static)
        .build_initiator()
        .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;

    send_handshake(io.as_ref(), &mut state, &[]).await?;
    recv_handshake(io.as_ref(), &mut state).await?;

    Ok(NoiseDuplex::new(io, into_transport(state)?, *remote))
}

/// Run the `Noise_KK` responder over `io`.
pub async fn respond_kk(
    io: Arc<dyn Duplex>,
    local: &Keypair,
    remote: &PubKey,
) -> Result<NoiseDuplex, CryptoError> {
    let private = local.sk().noise_private();
    let remote_static = remote.noise_public()?;
    let mut state = builder(KK_PATTERN)?
        .local_private_key(&private[..])
        .remote_public_key(&remote_static)
        .build_responder()
        .map_err(|e| CryptoError::HandshakeFailed(e.to_string()))?;

    recv_handshake(io.as_ref(), &mut state).await?;
    send_handshake(io.as_ref(), &mut state, &[]).await?;

    Ok(NoiseDuplex::new(io, into_transport(state)?, *remote))
}

/// Decrypted bytes not yet handed to a reader.
struct ReadState {
    buf: Vec<u8>,
    pos: usize,
}

/// An encrypted duplex channel over another [`Duplex`].
///
/// Writes are split into Noise messages of at most
/// [`NOISE_MAX_PAYLOAD_LEN`] plaintext bytes. Encryption and the matching
/// write happen under one lock so nonces reach the wire in order.
pub struct NoiseDuplex {
    io: Arc<dyn Duplex>,
    state: parking_lot::Mutex<TransportState>,
    read: Mutex<ReadState>,
    write: Mutex<()>,
    remote: PubKey,
}

impl NoiseDuplex {
    fn new(io: Arc<dyn Duplex>, state: TransportState, remote: PubKey) -> Self {
        Self {
            io,
            state: parking_lot::Mutex::new(state),
            read: Mutex::new(ReadState {
                buf: Vec::new(),
                pos: 0,
            }),
            write: Mutex::new(()),
            remote,
        }
    }

    /// Identity of the remote party.
    pub fn remote_pk(&self) -> PubKey {
        self.remote
    }

    fn encrypt(&self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; chunk.len() + crate::core::NOISE_TAG_LEN];
        let len = self
            .state
            .lock()
            .write_message(chunk, &mut out)
            .map_err(|_| io::Error::other(CryptoError::EncryptionFailed))?;
        out.truncate(len);
        Ok(out)
    }

    fn decrypt(&self, msg: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; msg.len()];
        let len = self
            .state
            .lock()
            .read_message(msg, &mut out)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, CryptoError::DecryptionFailed))?;
        out.truncate(len);
        Ok(out)
    }
}

#[async_trait]
impl Duplex for NoiseDuplex {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut read = self.read.lock().await;
        while read.pos == read.buf.len() {
            let msg = match read_prefixed(self.io.as_ref()).await {
                Ok(msg) => msg,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e),
            };
            read.buf = self.decrypt(&msg)?;
            read.pos = 0;
        }
        let n = buf.len().min(read.buf.len() - read.pos);
        buf[..n].copy_from_slice(&read.buf[read.pos..read.pos + n]);
        read.pos += n;
        Ok(n)
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let _guard = self.write.lock().await;
        for chunk in buf.chunks(NOISE_MAX_PAYLOAD_LEN) {
            let msg = self.encrypt(chunk)?;
            write_prefixed(self.io.as_ref(), &msg).await?;
        }
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.io.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory_pipe;

    fn pipe() -> (Arc<dyn Duplex>, Arc<dyn Duplex>) {
        let (a, b) = memory_pipe(256 * 1024);
        (Arc::new(a), Arc::new(b))
    }

    #[tokio::test]
    async fn test_xk_handshake_and_transfer() {
        let client = Keypair::generate();
        let server = Keypair::generate();
        let (a, b) = pipe();

        let server_keys = server.clone();
        let responder = tokio::spawn(async move { respond_xk(b, &server_keys).await });
        let initiator = initiate_xk(a, &client, &server.pk()).await.unwrap();
        let (responder, learned) = responder.await.unwrap().unwrap();

        assert_eq!(learned, client.pk());
        assert_eq!(initiator.remote_pk(), server.pk());

        initiator.write_all(b"over noise").await.unwrap();
        let mut buf = [0u8; 10];
        responder.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over noise");
    }

    #[tokio::test]
    async fn test_xk_wrong_server_key_fails() {
        let client = Keypair::generate();
        let server = Keypair::generate();
        let impostor = Keypair::generate();
        let (a, b) = pipe();

        let responder = tokio::spawn(async move { respond_xk(b, &impostor).await });
        let initiator = initiate_xk(a.clone(), &client, &server.pk()).await;

        // Either side may be the first to notice the mismatch.
        let responder = responder.await.unwrap();
        assert!(initiator.is_err() || responder.is_err());
    }

    #[tokio::test]
    async fn test_kk_large_write_is_chunked() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let (a, b) = pipe();

        let (alice_pk, bob_keys) = (alice.pk(), bob.clone());
        let responder = tokio::spawn(async move { respond_kk(b, &bob_keys, &alice_pk).await });
        let initiator = initiate_kk(a, &alice, &bob.pk()).await.unwrap();
        let responder = responder.await.unwrap().unwrap();

        let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            initiator.write_all(&payload).await.unwrap();
            initiator
        });

        let mut got = vec![0u8; expected.len()];
        responder.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        writer.await.unwrap();
    }
}
