//! Address handshake run on every raw (non-relay) connection.
//!
//! ```text
//! initiator                         responder
//!     | -- frame0 "get_nonce" ------------> |
//!     | <------------ frame1 {nonce} ------ |
//!     | -- frame2 {src, dst, nonce, sig} -> |  verify nonce + sig, check dst port
//!     | <------------ frame3 {ok, err} ---- |
//! ```
//!
//! Every frame is length-prefixed; frames 1-3 are JSON.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{HandshakeError, NOT_LISTENING_MESSAGE};
use crate::core::{Addr, Duplex, read_prefixed, write_prefixed};
use crate::crypto::{Keypair, Sig};

/// Greeting sent by the initiator.
pub const HANDSHAKE_GREETING: &[u8] = b"get_nonce";

/// Size of the responder's challenge nonce.
pub const NONCE_SIZE: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct Frame1 {
    nonce: [u8; NONCE_SIZE],
}

/// The initiator's signed address claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame2 {
    /// Initiator address.
    pub src_addr: Addr,
    /// Address the initiator wants to reach.
    pub dst_addr: Addr,
    /// Nonce echoed from frame1.
    pub nonce: [u8; NONCE_SIZE],
    /// Signature by `src_addr.pk` over the frame with this field empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<Sig>,
}

impl Frame2 {
    fn signing_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let unsigned = Frame2 {
            sig: None,
            ..self.clone()
        };
        serde_json::to_vec(&unsigned)
    }

    /// Sign the frame with the source key.
    pub fn sign(&mut self, keys: &Keypair) -> Result<(), HandshakeError> {
        self.src_addr.pk = keys.pk();
        self.sig = Some(keys.sign(&self.signing_bytes()?));
        Ok(())
    }

    /// Check the echoed nonce and the signature.
    pub fn verify(&self, nonce: &[u8; NONCE_SIZE]) -> Result<(), HandshakeError> {
        if &self.nonce != nonce {
            return Err(HandshakeError::UnexpectedNonce);
        }
        let sig = self.sig.as_ref().ok_or(HandshakeError::InvalidSignature)?;
        self.src_addr
            .pk
            .verify(&self.signing_bytes()?, sig)
            .map_err(|_| HandshakeError::InvalidSignature)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame3 {
    ok: bool,
    #[serde(default)]
    err_msg: String,
}

async fn write_json<T: Serialize>(io: &dyn Duplex, frame: &T) -> Result<(), HandshakeError> {
    write_prefixed(io, &serde_json::to_vec(frame)?).await?;
    Ok(())
}

async fn read_json<T: for<'de> Deserialize<'de>>(io: &dyn Duplex) -> Result<T, HandshakeError> {
    Ok(serde_json::from_slice(&read_prefixed(io).await?)?)
}

/// Run the initiator side. Returns `(local, remote)` on success.
pub async fn initiate(
    io: &dyn Duplex,
    keys: &Keypair,
    local: Addr,
    remote: Addr,
) -> Result<(Addr, Addr), HandshakeError> {
    write_prefixed(io, HANDSHAKE_GREETING).await?;
    let f1: Frame1 = read_json(io).await?;

    let mut f2 = Frame2 {
        src_addr: local,
        dst_addr: remote,
        nonce: f1.nonce,
        sig: None,
    };
    f2.sign(keys)?;
    write_json(io, &f2).await?;

    let f3: Frame3 = read_json(io).await?;
    if !f3.ok {
        if f3.err_msg == NOT_LISTENING_MESSAGE {
            return Err(HandshakeError::NotListening);
        }
        return Err(HandshakeError::Rejected(f3.err_msg));
    }
    trace!(local = %f2.src_addr, remote = %remote, "Initiator handshake complete");
    Ok((f2.src_addr, remote))
}

/// Run the responder side. `check` may refuse the claimed addresses; the
/// refusal is reported to the initiator. Returns `(local, remote)`.
pub async fn respond<F>(io: &dyn Duplex, check: F) -> Result<(Addr, Addr), HandshakeError>
where
    F: Fn(&Frame2) -> Result<(), HandshakeError>,
{
    let greeting = read_prefixed(io).await?;
    if greeting != HANDSHAKE_GREETING {
        return Err(HandshakeError::BadGreeting(
            String::from_utf8_lossy(&greeting).into_owned(),
        ));
    }

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    write_json(io, &Frame1 { nonce }).await?;

    let f2: Frame2 = read_json(io).await?;
    f2.verify(&nonce)?;

    if let Err(e) = check(&f2) {
        let refusal = Frame3 {
            ok: false,
            err_msg: e.to_string(),
        };
        let _ = write_json(io, &refusal).await;
        return Err(e);
    }

    write_json(
        io,
        &Frame3 {
            ok: true,
            err_msg: String::new(),
        },
    )
    .await?;
    trace!(local = %f2.dst_addr, remote = %f2.src_addr, "Responder handshake complete");
    Ok((f2.dst_addr, f2.src_addr))
}
