//! Port reservation with release handles.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;

use crate::core::MIN_EPHEMERAL_PORT;

/// Errors returned by a [`Porter`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PorterError {
    /// Every port in the ephemeral range is reserved.
    #[error("no free ephemeral port")]
    NoFreePort,
}

struct Reservation<V> {
    id: u64,
    value: V,
}

struct PorterState<V> {
    ports: HashMap<u16, Reservation<V>>,
    next_ephemeral: u16,
    min_ephemeral: u16,
    next_id: u64,
}

impl<V> PorterState<V> {
    fn insert(&mut self, port: u16, value: V) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.ports.insert(port, Reservation { id, value });
        id
    }

    fn advance_ephemeral(&mut self) -> u16 {
        let port = self.next_ephemeral;
        self.next_ephemeral = if port == u16::MAX {
            self.min_ephemeral
        } else {
            port + 1
        };
        port
    }
}

/// A table of reserved ports.
///
/// Port 0 is never handed out. Cloning a `Porter` yields another handle to
/// the same table.
pub struct Porter<V> {
    state: Arc<Mutex<PorterState<V>>>,
}

impl<V> Clone for Porter<V> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<V: Clone + Send + 'static> Default for Porter<V> {
    fn default() -> Self {
        Self::new(MIN_EPHEMERAL_PORT)
    }
}

impl<V: Clone + Send + 'static> Porter<V> {
    /// Create a table whose ephemeral range starts at `min_ephemeral`.
    pub fn new(min_ephemeral: u16) -> Self {
        let min_ephemeral = min_ephemeral.max(1);
        Self {
            state: Arc::new(Mutex::new(PorterState {
                ports: HashMap::new(),
                next_ephemeral: min_ephemeral,
                min_ephemeral,
                next_id: 0,
            })),
        }
    }

    /// Reserve `port`, returning `None` if it is taken (or is port 0).
    pub fn reserve(&self, port: u16, value: V) -> Option<PortFreer> {
        let mut state = self.state.lock();
        if port == 0 || state.ports.contains_key(&port) {
            return None;
        }
        let id = state.insert(port, value);
        Some(self.freer(port, id))
    }

    /// Reserve the next free port of the ephemeral range.
    ///
    /// The scan wraps around once; a full range fails with
    /// [`PorterError::NoFreePort`].
    ///
    /// Takes no cancellation signal: the scan runs under one lock and never
    /// awaits. A caller cancelled after it returns releases the port by
    /// dropping the [`PortFreer`].
    pub fn reserve_ephemeral(&self, value: V) -> Result<(u16, PortFreer), PorterError> {
        let mut state = self.state.lock();
        let span = u32::from(u16::MAX - state.min_ephemeral) + 1;
        for _ in 0..span {
            let port = state.advance_ephemeral();
            if port != 0 && !state.ports.contains_key(&port) {
                let id = state.insert(port, value);
                drop(state);
                return Ok((port, self.freer(port, id)));
            }
        }
        Err(PorterError::NoFreePort)
    }

    /// Value stored at `port`, if reserved.
    pub fn port_value(&self, port: u16) -> Option<V> {
        self.state.lock().ports.get(&port).map(|r| r.value.clone())
    }

    /// Visit every reservation until `f` returns `false`.
    pub fn range_port_values(&self, mut f: impl FnMut(u16, &V) -> bool) {
        let snapshot: Vec<(u16, V)> = self
            .state
            .lock()
            .ports
            .iter()
            .map(|(port, r)| (*port, r.value.clone()))
            .collect();
        for (port, value) in &snapshot {
            if !f(*port, value) {
                break;
            }
        }
    }

    /// Drop every reservation, returning the stored values.
    ///
    /// Outstanding [`PortFreer`]s become no-ops.
    pub fn close_all(&self) -> Vec<(u16, V)> {
        self.state
            .lock()
            .ports
            .drain()
            .map(|(port, r)| (port, r.value))
            .collect()
    }

    /// Number of reserved ports.
    pub fn len(&self) -> usize {
        self.state.lock().ports.len()
    }

    /// Whether no port is reserved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn freer(&self, port: u16, id: u64) -> PortFreer {
        let weak: Weak<Mutex<PorterState<V>>> = Arc::downgrade(&self.state);
        let release: Box<dyn FnOnce() + Send> = Box::new(move || {
            let Some(state) = weak.upgrade() else {
                return;
            };
            // The removed value is dropped after the lock is released.
            let _removed = {
                let mut state = state.lock();
                if state.ports.get(&port).is_some_and(|r| r.id == id) {
                    state.ports.remove(&port)
                } else {
                    None
                }
            };
        });
        PortFreer {
            port,
            release: Mutex::new(Some(release)),
        }
    }
}

/// Releases one port reservation.
///
/// [`free`](Self::free) may be called any number of times; only the first
/// call has an effect. Dropping the freer releases the port as well.
pub struct PortFreer {
    port: u16,
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl PortFreer {
    /// The reserved port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Release the reservation.
    pub fn free(&self) {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }
}

impl Drop for PortFreer {
    fn drop(&mut self) {
        self.free();
    }
}

impl fmt::Debug for PortFreer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortFreer").field("port", &self.port).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_reserve_and_free() {
        let porter: Porter<&str> = Porter::default();

        let freer = porter.reserve(45, "listener").unwrap();
        assert!(porter.reserve(45, "other").is_none());
        assert_eq!(porter.port_value(45), Some("listener"));

        freer.free();
        freer.free();
        assert!(porter.port_value(45).is_none());
        assert!(porter.reserve(45, "other").is_some());
    }

    #[test]
    fn test_port_zero_is_never_reserved() {
        let porter: Porter<()> = Porter::default();
        assert!(porter.reserve(0, ()).is_none());
    }

    #[test]
    fn test_drop_releases() {
        let porter: Porter<()> = Porter::default();
        {
            let _freer = porter.reserve(7, ()).unwrap();
            assert_eq!(porter.len(), 1);
        }
        assert!(porter.is_empty());
    }

    #[test]
    fn test_ephemeral_skips_occupied() {
        let porter: Porter<u8> = Porter::new(60000);
        let _held = porter.reserve(60000, 0).unwrap();

        let (port, _freer) = porter.reserve_ephemeral(1).unwrap();
        assert_eq!(port, 60001);
        assert_eq!(porter.port_value(60001), Some(1));
    }

    #[test]
    fn test_ephemeral_exhaustion_and_wrap() {
        let porter: Porter<()> = Porter::new(u16::MAX - 1);

        let (a, fa) = porter.reserve_ephemeral(()).unwrap();
        let (b, _fb) = porter.reserve_ephemeral(()).unwrap();
        assert_eq!((a, b), (u16::MAX - 1, u16::MAX));
        assert_eq!(
            porter.reserve_ephemeral(()).unwrap_err(),
            PorterError::NoFreePort
        );

        fa.free();
        let (c, _fc) = porter.reserve_ephemeral(()).unwrap();
        assert_eq!(c, u16::MAX - 1);
    }

    #[test]
    fn test_stale_freer_after_close_all() {
        let porter: Porter<&str> = Porter::default();
        let stale = porter.reserve(80, "old").unwrap();

        let closed = porter.close_all();
        assert_eq!(closed, vec![(80, "old")]);

        let _fresh = porter.reserve(80, "new").unwrap();
        stale.free();
        assert_eq!(porter.port_value(80), Some("new"));
    }

    #[test]
    fn test_range_port_values_stops_early() {
        let porter: Porter<u16> = Porter::default();
        let _freers: Vec<_> = (1..=5).map(|p| porter.reserve(p, p).unwrap()).collect();

        let mut seen = 0;
        porter.range_port_values(|_, _| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
    }

    #[tokio::test]
    async fn test_aborted_holder_releases_ephemeral_port() {
        let porter: Porter<()> = Porter::default();
        let (reserved_tx, reserved_rx) = tokio::sync::oneshot::channel();
        let holder = {
            let porter = porter.clone();
            tokio::spawn(async move {
                let reserved = porter.reserve_ephemeral(()).unwrap();
                let _ = reserved_tx.send(reserved.0);
                std::future::pending::<()>().await;
                drop(reserved);
            })
        };
        let port = reserved_rx.await.unwrap();
        assert_eq!(porter.port_value(port), Some(()));

        holder.abort();
        assert!(holder.await.unwrap_err().is_cancelled());
        assert!(porter.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ephemeral_ports_are_unique() {
        let porter: Porter<()> = Porter::default();
        let mut handles = Vec::new();
        for _ in 0..64 {
            let porter = porter.clone();
            handles.push(tokio::spawn(async move {
                let mut held = Vec::new();
                for _ in 0..16 {
                    held.push(porter.reserve_ephemeral(()).unwrap());
                    tokio::task::yield_now().await;
                }
                held
            }));
        }

        let mut ports = HashSet::new();
        let mut freers = Vec::new();
        for handle in handles {
            for (port, freer) in handle.await.unwrap() {
                assert!(ports.insert(port), "port {port} reserved twice");
                freers.push(freer);
            }
        }
        assert_eq!(ports.len(), 64 * 16);
        assert_eq!(porter.len(), 64 * 16);
    }
}
