//! Server side of a relay session.
//!
//! The server never terminates streams. Each stream is a pair of links, one
//! in the initiator's session under the initiator's (even) id and one in the
//! responder's session under a server-assigned (odd) id. Frames are copied
//! across the pair with the id rewritten.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::core::Duplex;
use crate::crypto::PubKey;
use crate::relay::{
    EntityCommon, Frame, FrameError, FrameType, HandshakeData, RelayError, is_initiator_id,
};

#[derive(Clone)]
struct Link {
    peer: Weak<ServerSession>,
    peer_id: u16,
}

/// A relay server's session with one client.
pub struct ServerSession {
    client_pk: PubKey,
    io: Arc<dyn Duplex>,
    links: parking_lot::Mutex<HashMap<u16, Link>>,
    next_id: parking_lot::Mutex<u16>,
    closed: AtomicBool,
    done: watch::Sender<bool>,
}

impl ServerSession {
    /// Wrap an established, encrypted connection from `client_pk`.
    pub fn new(client_pk: PubKey, io: Arc<dyn Duplex>) -> Self {
        Self {
            client_pk,
            io,
            links: parking_lot::Mutex::new(HashMap::new()),
            next_id: parking_lot::Mutex::new(1),
            closed: AtomicBool::new(false),
            done: watch::channel(false).0,
        }
    }

    /// Public key of the client.
    pub fn client_pk(&self) -> PubKey {
        self.client_pk
    }

    /// Number of stream ends routed through this session.
    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn send(&self, frame: Frame) -> Result<(), RelayError> {
        frame.write_to(self.io.as_ref()).await?;
        Ok(())
    }

    fn link(&self, id: u16) -> Option<Link> {
        self.links.lock().get(&id).cloned()
    }

    fn unlink(&self, id: u16) -> Option<Link> {
        self.links.lock().remove(&id)
    }

    /// Reserve an odd id and link it to `peer`'s `peer_id`.
    fn link_responder(&self, peer: Weak<ServerSession>, peer_id: u16) -> Result<u16, RelayError> {
        let mut links = self.links.lock();
        let mut next = self.next_id.lock();
        for _ in 0..=u16::MAX / 2 {
            let id = *next;
            *next = next.wrapping_add(2);
            if !links.contains_key(&id) {
                links.insert(id, Link { peer, peer_id });
                return Ok(id);
            }
        }
        Err(RelayError::NoFreeStreamId)
    }

    /// Route frames until the client disconnects or the session is closed.
    pub async fn serve(
        self: &Arc<Self>,
        sessions: &EntityCommon<ServerSession>,
    ) -> Result<(), RelayError> {
        let mut done = self.done.subscribe();
        let result = loop {
            let frame = tokio::select! {
                frame = Frame::read_from(self.io.as_ref()) => frame,
                _ = done.wait_for(|d| *d) => break Ok(()),
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break Ok(());
                }
                Err(e) => break Err(e.into()),
            };
            trace!(client = %self.client_pk, frame = %frame, "Received frame");
            if let Err(e) = self.handle_frame(frame, sessions).await {
                break Err(e);
            }
        };
        if let Err(e) = &result {
            debug!(client = %self.client_pk, error = %e, "Session serve loop stopped");
        }
        self.close().await;
        result
    }

    async fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        sessions: &EntityCommon<ServerSession>,
    ) -> Result<(), RelayError> {
        let id = frame.stream_id;
        match frame.frame_type {
            FrameType::Ok => Ok(()),
            FrameType::Request => self.handle_request(frame, sessions).await,
            FrameType::Close => {
                if let Some(link) = self.unlink(id) {
                    if let Some(peer) = link.peer.upgrade() {
                        peer.unlink(link.peer_id);
                        let _ = peer
                            .send(Frame::new(FrameType::Close, link.peer_id, frame.payload))
                            .await;
                    }
                }
                Ok(())
            }
            FrameType::Accept | FrameType::Fwd | FrameType::Ack => {
                let Some(link) = self.link(id) else {
                    if frame.frame_type == FrameType::Ack {
                        return Ok(());
                    }
                    return self.send(Frame::close(id)).await;
                };
                let forwarded = Frame::new(frame.frame_type, link.peer_id, frame.payload);
                let delivered = match link.peer.upgrade() {
                    Some(peer) => peer.send(forwarded).await.is_ok(),
                    None => false,
                };
                if !delivered {
                    self.unlink(id);
                    let code = RelayError::SessionClosed.code().unwrap_or_default();
                    return self.send(Frame::reject(id, code)).await;
                }
                Ok(())
            }
        }
    }

    async fn handle_request(
        self: &Arc<Self>,
        frame: Frame,
        sessions: &EntityCommon<ServerSession>,
    ) -> Result<(), RelayError> {
        let id = frame.stream_id;
        if !is_initiator_id(id) || self.links.lock().contains_key(&id) {
            return Err(RelayError::Protocol(format!(
                "client sent REQUEST with unusable stream id {id}"
            )));
        }

        let hd = match HandshakeData::from_bytes(&frame.payload) {
            Ok(hd) if hd.init_addr.pk == self.client_pk => hd,
            Ok(hd) => {
                debug!(id, init = %hd.init_addr, "Rejecting REQUEST with foreign initiator");
                return self.send(Frame::close(id)).await;
            }
            Err(e) => {
                debug!(id, error = %e, "Rejecting malformed REQUEST");
                return self.send(Frame::close(id)).await;
            }
        };

        let Some(target) = sessions.session(&hd.resp_addr.pk).await else {
            trace!(id, resp = %hd.resp_addr, "No session for REQUEST target");
            let code = RelayError::ReqNoSession.code().unwrap_or_default();
            return self.send(Frame::reject(id, code)).await;
        };

        let target_id = match target.link_responder(Arc::downgrade(self), id) {
            Ok(target_id) => target_id,
            Err(e) => {
                debug!(id, resp = %hd.resp_addr, error = %e, "Target session has no free ids");
                return self.send(Frame::close(id)).await;
            }
        };
        self.links.lock().insert(
            id,
            Link {
                peer: Arc::downgrade(&target),
                peer_id: target_id,
            },
        );

        let forwarded = Frame::new(FrameType::Request, target_id, frame.payload);
        if target.send(forwarded).await.is_err() {
            target.unlink(target_id);
            self.unlink(id);
            let code = RelayError::SessionClosed.code().unwrap_or_default();
            return self.send(Frame::reject(id, code)).await;
        }
        trace!(id, target_id, init = %hd.init_addr, resp = %hd.resp_addr, "Forwarded REQUEST");
        Ok(())
    }

    /// Close the session and tell the other end of every linked stream.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.done.send_replace(true);
        if let Err(e) = self.io.close().await {
            debug!(client = %self.client_pk, error = %e, "Failed to close session connection");
        }

        let links: Vec<Link> = self.links.lock().drain().map(|(_, l)| l).collect();
        let code = RelayError::SessionClosed.code().unwrap_or_default();
        for link in links {
            if let Some(peer) = link.peer.upgrade() {
                peer.unlink(link.peer_id);
                let _ = peer.send(Frame::reject(link.peer_id, code)).await;
            }
        }
        debug!(client = %self.client_pk, "Session closed");
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("client", &self.client_pk)
            .field("links", &self.link_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Addr, memory_pipe};
    use crate::crypto::Keypair;
    use crate::disc::MemoryDiscovery;
    use crate::relay::SessionCallbacks;

    struct Peer {
        pk: PubKey,
        session: Arc<ServerSession>,
        wire: Arc<dyn Duplex>,
    }

    async fn attach(common: &Arc<EntityCommon<ServerSession>>) -> Peer {
        let pk = Keypair::generate().pk();
        let (server_end, client_end) = memory_pipe(64 * 1024);
        let session = Arc::new(ServerSession::new(pk, Arc::new(server_end)));
        common.set_session(pk, Arc::clone(&session)).await;
        let (s, c) = (Arc::clone(&session), Arc::clone(common));
        tokio::spawn(async move { s.serve(&c).await });
        Peer {
            pk,
            session,
            wire: Arc::new(client_end),
        }
    }

    fn common() -> Arc<EntityCommon<ServerSession>> {
        Arc::new(EntityCommon::new(
            Keypair::generate(),
            Arc::new(MemoryDiscovery::new()),
            SessionCallbacks::default(),
        ))
    }

    #[tokio::test]
    async fn test_request_is_forwarded_with_rewritten_id() {
        let common = common();
        let a = attach(&common).await;
        let b = attach(&common).await;

        let hd = HandshakeData::new(Addr::new(a.pk, 50000), Addr::new(b.pk, 80), 1024);
        Frame::new(FrameType::Request, 4, hd.to_bytes().unwrap())
            .write_to(a.wire.as_ref())
            .await
            .unwrap();

        let got = Frame::read_from(b.wire.as_ref()).await.unwrap();
        assert_eq!(got.frame_type, FrameType::Request);
        assert_eq!(got.stream_id % 2, 1);
        let target_id = got.stream_id;

        Frame::new(FrameType::Fwd, target_id, b"pong".to_vec())
            .write_to(b.wire.as_ref())
            .await
            .unwrap();
        let got = Frame::read_from(a.wire.as_ref()).await.unwrap();
        assert_eq!(got.frame_type, FrameType::Fwd);
        assert_eq!(got.stream_id, 4);
        assert_eq!(got.payload, b"pong");

        Frame::close(4).write_to(a.wire.as_ref()).await.unwrap();
        let got = Frame::read_from(b.wire.as_ref()).await.unwrap();
        assert_eq!(got.frame_type, FrameType::Close);
        assert_eq!(got.stream_id, target_id);
        assert_eq!(a.session.link_count(), 0);
    }

    #[tokio::test]
    async fn test_request_without_target_session() {
        let common = common();
        let a = attach(&common).await;
        let absent = Keypair::generate().pk();

        let hd = HandshakeData::new(Addr::new(a.pk, 50000), Addr::new(absent, 80), 1024);
        Frame::new(FrameType::Request, 0, hd.to_bytes().unwrap())
            .write_to(a.wire.as_ref())
            .await
            .unwrap();

        let got = Frame::read_from(a.wire.as_ref()).await.unwrap();
        assert_eq!(got.frame_type, FrameType::Close);
        assert_eq!(got.close_reason(), 57);
    }

    #[tokio::test]
    async fn test_session_exit_notifies_linked_peers() {
        let common = common();
        let a = attach(&common).await;
        let b = attach(&common).await;

        let hd = HandshakeData::new(Addr::new(a.pk, 50000), Addr::new(b.pk, 80), 1024);
        Frame::new(FrameType::Request, 2, hd.to_bytes().unwrap())
            .write_to(a.wire.as_ref())
            .await
            .unwrap();
        let _ = Frame::read_from(b.wire.as_ref()).await.unwrap();

        b.session.close().await;
        let got = Frame::read_from(a.wire.as_ref()).await.unwrap();
        assert_eq!(got.frame_type, FrameType::Close);
        assert_eq!(got.stream_id, 2);
        assert_eq!(got.close_reason(), 11);
    }

    #[tokio::test]
    async fn test_odd_request_id_ends_session() {
        let common = common();
        let a = attach(&common).await;
        let hd = HandshakeData::new(Addr::new(a.pk, 1), Addr::new(a.pk, 2), 1024);
        Frame::new(FrameType::Request, 3, hd.to_bytes().unwrap())
            .write_to(a.wire.as_ref())
            .await
            .unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(a.wire.read(&mut buf).await.unwrap(), 0);
        assert!(a.session.is_closed());
    }
}
