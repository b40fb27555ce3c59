//! Client side of a relay session.
//!
//! A session is one Noise-encrypted TCP connection to a relay server. The
//! serve loop reads frames and routes them to streams; dialers register a
//! pending request and are answered by the serve loop once the responder
//! accepts or refuses.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

use super::Stream;
use crate::core::{Addr, Duplex, STREAM_HANDSHAKE_TIMEOUT};
use crate::crypto::PubKey;
use crate::network::Listener;
use crate::porter::{PortFreer, Porter};
use crate::relay::{Frame, FrameError, FrameType, HandshakeData, RelayError, is_initiator_id};

/// What a client's porter stores per port.
#[derive(Clone)]
pub enum PortEntry {
    /// A listener accepting streams on the port.
    Listener(Arc<Listener<Stream>>),
    /// The local end of a dialed stream.
    Dialed(Addr),
}

struct PendingDial {
    local: Addr,
    remote: Addr,
    freer: PortFreer,
    reply: oneshot::Sender<Result<Arc<Stream>, RelayError>>,
}

/// Removes a dial from the pending table unless the serve loop already
/// answered it. The port is released with the removed entry.
struct PendingGuard {
    session: Arc<ClientSession>,
    id: u16,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.session.pending.lock().remove(&self.id).is_none() {
            return;
        }
        trace!(id = self.id, "Withdrew stream request");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session = Arc::clone(&self.session);
        let id = self.id;
        handle.spawn(async move {
            if !session.is_closed() {
                let _ = session.send(Frame::close(id)).await;
            }
        });
    }
}

/// A client's session with one relay server.
pub struct ClientSession {
    local_pk: PubKey,
    server_pk: PubKey,
    io: Arc<dyn Duplex>,
    porter: Porter<PortEntry>,
    window: usize,
    streams: parking_lot::Mutex<HashMap<u16, Arc<Stream>>>,
    pending: parking_lot::Mutex<HashMap<u16, PendingDial>>,
    next_id: parking_lot::Mutex<u16>,
    closed: AtomicBool,
    done: watch::Sender<bool>,
}

impl ClientSession {
    pub(crate) fn new(
        local_pk: PubKey,
        server_pk: PubKey,
        io: Arc<dyn Duplex>,
        porter: Porter<PortEntry>,
        window: usize,
    ) -> Self {
        Self {
            local_pk,
            server_pk,
            io,
            porter,
            window,
            streams: parking_lot::Mutex::new(HashMap::new()),
            pending: parking_lot::Mutex::new(HashMap::new()),
            next_id: parking_lot::Mutex::new(0),
            closed: AtomicBool::new(false),
            done: watch::channel(false).0,
        }
    }

    /// Public key of the relay server.
    pub fn server_pk(&self) -> PubKey {
        self.server_pk
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn remove_stream(&self, id: u16) {
        self.streams.lock().remove(&id);
    }

    fn alloc_id(&self) -> Result<u16, RelayError> {
        let streams = self.streams.lock();
        let pending = self.pending.lock();
        let mut next = self.next_id.lock();
        for _ in 0..=u16::MAX / 2 {
            let id = *next;
            *next = next.wrapping_add(2);
            if !streams.contains_key(&id) && !pending.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(RelayError::NoFreeStreamId)
    }

    async fn send(&self, frame: Frame) -> Result<(), RelayError> {
        frame.write_to(self.io.as_ref()).await?;
        Ok(())
    }

    /// Open a stream to `remote` through this session's server.
    pub async fn dial_stream(self: &Arc<Self>, remote: Addr) -> Result<Arc<Stream>, RelayError> {
        if self.is_closed() {
            return Err(RelayError::SessionClosed);
        }
        let (port, freer) = self.porter.reserve_ephemeral(PortEntry::Dialed(remote))?;
        let local = Addr::new(self.local_pk, port);
        let id = self.alloc_id()?;

        let hd = HandshakeData::new(local, remote, self.window);
        let (reply, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingDial {
                local,
                remote,
                freer,
                reply,
            },
        );

        // Withdraws the request on every early exit, including cancellation.
        let _guard = PendingGuard {
            session: Arc::clone(self),
            id,
        };

        let request = Frame::new(FrameType::Request, id, hd.to_bytes()?);
        self.send(request).await?;
        trace!(id, local = %local, remote = %remote, "Sent stream request");

        match tokio::time::timeout(STREAM_HANDSHAKE_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::SessionClosed),
            Err(_) => Err(RelayError::Timeout("stream handshake")),
        }
    }

    /// Read and dispatch frames until the connection fails or the session
    /// is closed.
    pub async fn serve(self: &Arc<Self>) -> Result<(), RelayError> {
        let mut done = self.done.subscribe();
        let result = loop {
            let frame = tokio::select! {
                frame = Frame::read_from(self.io.as_ref()) => frame,
                _ = done.wait_for(|d| *d) => break Ok(()),
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break Err(RelayError::SessionClosed);
                }
                Err(e) => break Err(e.into()),
            };
            trace!(server = %self.server_pk, frame = %frame, "Received frame");
            if let Err(e) = self.handle_frame(frame).await {
                break Err(e);
            }
        };
        if let Err(e) = &result {
            debug!(server = %self.server_pk, error = %e, "Session serve loop stopped");
        }
        self.close().await;
        result
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<(), RelayError> {
        let id = frame.stream_id;
        match frame.frame_type {
            FrameType::Ok => Ok(()),
            FrameType::Request => self.handle_request(frame).await,
            FrameType::Accept => self.handle_accept(frame).await,
            FrameType::Fwd => {
                let stream = self.streams.lock().get(&id).cloned();
                match stream {
                    Some(stream) => {
                        if let Err(e) = stream.on_fwd(&frame.payload) {
                            warn!(id, error = %e, "Closing stream after FWD failure");
                            let _ = stream.close().await;
                        }
                        Ok(())
                    }
                    None => self.send(Frame::close(id)).await,
                }
            }
            FrameType::Ack => {
                let stream = self.streams.lock().get(&id).cloned();
                if let Some(stream) = stream {
                    let n = frame.ack_offset()?;
                    if let Err(e) = stream.on_ack(n) {
                        warn!(id, error = %e, "Closing stream after ACK failure");
                        let _ = stream.close().await;
                    }
                }
                Ok(())
            }
            FrameType::Close => {
                let pending = self.pending.lock().remove(&id);
                if let Some(pending) = pending {
                    let err = RelayError::from_code(frame.close_reason())
                        .unwrap_or_else(|| RelayError::Protocol("stream request rejected".into()));
                    let _ = pending.reply.send(Err(err));
                    return Ok(());
                }
                let stream = self.streams.lock().get(&id).cloned();
                if let Some(stream) = stream {
                    stream.close_remote();
                }
                Ok(())
            }
        }
    }

    async fn handle_request(self: &Arc<Self>, frame: Frame) -> Result<(), RelayError> {
        let id = frame.stream_id;
        if is_initiator_id(id) || self.streams.lock().contains_key(&id) {
            return Err(RelayError::Protocol(format!(
                "server sent REQUEST with unusable stream id {id}"
            )));
        }

        let hd = match HandshakeData::from_bytes(&frame.payload) {
            Ok(hd) => hd,
            Err(e) => {
                debug!(id, error = %e, "Rejecting malformed stream request");
                return self.send(Frame::close(id)).await;
            }
        };
        if hd.resp_addr.pk != self.local_pk {
            debug!(id, resp = %hd.resp_addr, "Rejecting stream request for another key");
            return self.send(Frame::close(id)).await;
        }

        let listener = match self.porter.port_value(hd.resp_addr.port) {
            Some(PortEntry::Listener(listener)) => listener,
            _ => {
                let code = RelayError::ReqNoListener.code().unwrap_or_default();
                return self.send(Frame::reject(id, code)).await;
            }
        };

        let stream = Arc::new(Stream::new(
            id,
            hd.resp_addr,
            hd.init_addr,
            self.window,
            hd.window_size(),
            Arc::clone(&self.io),
            Arc::downgrade(self),
            None,
        ));
        self.streams.lock().insert(id, Arc::clone(&stream));

        let accept = HandshakeData::new(hd.init_addr, hd.resp_addr, self.window);
        self.send(Frame::new(FrameType::Accept, id, accept.to_bytes()?))
            .await?;

        if let Err(e) = listener.introduce(Arc::clone(&stream)) {
            debug!(id, port = hd.resp_addr.port, error = %e, "Listener refused stream");
            let _ = stream.close().await;
        }
        Ok(())
    }

    async fn handle_accept(self: &Arc<Self>, frame: Frame) -> Result<(), RelayError> {
        let id = frame.stream_id;
        let pending = self.pending.lock().remove(&id);
        let Some(pending) = pending else {
            if self.streams.lock().contains_key(&id) {
                return Err(RelayError::Protocol(format!(
                    "duplicate ACCEPT for stream {id}"
                )));
            }
            return self.send(Frame::close(id)).await;
        };

        let hd = match HandshakeData::from_bytes(&frame.payload) {
            Ok(hd) if hd.init_addr == pending.local && hd.resp_addr == pending.remote => hd,
            Ok(_) => {
                let _ = pending.reply.send(Err(RelayError::Protocol(
                    "ACCEPT addresses do not match REQUEST".into(),
                )));
                return self.send(Frame::close(id)).await;
            }
            Err(e) => {
                let _ = pending.reply.send(Err(e.into()));
                return self.send(Frame::close(id)).await;
            }
        };

        let stream = Arc::new(Stream::new(
            id,
            pending.local,
            pending.remote,
            self.window,
            hd.window_size(),
            Arc::clone(&self.io),
            Arc::downgrade(self),
            Some(pending.freer),
        ));
        self.streams.lock().insert(id, Arc::clone(&stream));
        if let Err(Ok(stream)) = pending.reply.send(Ok(stream)) {
            // The dialer gave up while the ACCEPT was in flight.
            let _ = stream.close().await;
        }
        Ok(())
    }

    /// Close the session and every stream in it.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.done.send_replace(true);
        if let Err(e) = self.io.close().await {
            debug!(server = %self.server_pk, error = %e, "Failed to close session connection");
        }

        let streams: Vec<_> = self.streams.lock().drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.close_remote();
        }
        let pending: Vec<_> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for p in pending {
            let _ = p.reply.send(Err(RelayError::SessionClosed));
        }
        debug!(server = %self.server_pk, "Session closed");
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("server", &self.server_pk)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::{DEFAULT_WINDOW_SIZE, NetworkType, TransportConn, memory_pipe};
    use crate::crypto::Keypair;

    fn session(io: Arc<dyn Duplex>, window: usize) -> (Arc<ClientSession>, Porter<PortEntry>) {
        let porter = Porter::default();
        let session = Arc::new(ClientSession::new(
            Keypair::generate().pk(),
            Keypair::generate().pk(),
            io,
            porter.clone(),
            window,
        ));
        (session, porter)
    }

    #[tokio::test]
    async fn test_cancelled_dial_releases_port() {
        let (ours, server) = memory_pipe(64 * 1024);
        let (session, porter) = session(Arc::new(ours), DEFAULT_WINDOW_SIZE);
        let remote = Addr::new(Keypair::generate().pk(), 7);

        let dial =
            tokio::time::timeout(Duration::from_millis(100), session.dial_stream(remote)).await;
        assert!(dial.is_err());
        assert!(porter.is_empty());
        assert!(session.pending.lock().is_empty());

        let request = Frame::read_from(&server).await.unwrap();
        assert_eq!(request.frame_type, FrameType::Request);
        let close = Frame::read_from(&server).await.unwrap();
        assert_eq!(close.frame_type, FrameType::Close);
        assert_eq!(close.stream_id, request.stream_id);
    }

    #[tokio::test]
    async fn test_dial_on_closed_session_reserves_nothing() {
        let (ours, _server) = memory_pipe(1024);
        let (session, porter) = session(Arc::new(ours), DEFAULT_WINDOW_SIZE);
        session.close().await;
        let remote = Addr::new(Keypair::generate().pk(), 7);
        assert!(matches!(
            session.dial_stream(remote).await,
            Err(RelayError::SessionClosed)
        ));
        assert!(porter.is_empty());
    }

    #[tokio::test]
    async fn test_fwd_beyond_window_tears_stream_down() {
        let (ours, server) = memory_pipe(64 * 1024);
        let (session, porter) = session(Arc::new(ours), 16);
        let local = Addr::new(session.local_pk, 30);
        let listener = Arc::new(Listener::new(local, NetworkType::Dmsg));
        listener.bind_freer(
            porter
                .reserve(30, PortEntry::Listener(Arc::clone(&listener)))
                .unwrap(),
        );
        let serving = Arc::clone(&session);
        tokio::spawn(async move { serving.serve().await });

        let initiator = Addr::new(Keypair::generate().pk(), 50000);
        let hd = HandshakeData::new(initiator, local, DEFAULT_WINDOW_SIZE);
        Frame::new(FrameType::Request, 1, hd.to_bytes().unwrap())
            .write_to(&server)
            .await
            .unwrap();
        let accept = Frame::read_from(&server).await.unwrap();
        assert_eq!(accept.frame_type, FrameType::Accept);
        let stream = listener.accept().await.unwrap();
        assert_eq!(stream.remote_addr(), initiator);

        Frame::new(FrameType::Fwd, 1, vec![7; 32])
            .write_to(&server)
            .await
            .unwrap();
        let close = Frame::read_from(&server).await.unwrap();
        assert_eq!(close.frame_type, FrameType::Close);
        assert_eq!(close.stream_id, 1);

        let mut buf = [0u8; 8];
        assert!(matches!(stream.read(&mut buf).await, Ok(0) | Err(_)));
        assert!(session.streams.lock().is_empty());
        assert!(!session.is_closed());
    }
}
