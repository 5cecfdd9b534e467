//! UDP server: one bound socket per reactor sharing a port via
//! `SO_REUSEPORT`, demultiplexing datagrams into per-peer sessions keyed by
//! a canonical peer address.
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;

use crate::error::{ErrorKind, SocketError};
use crate::pool::PollerPool;
use crate::reactor::{EventPoller, EventPollerHandle};
use crate::session::{next_session_id, Session, SessionHelper};
use crate::socket::{Socket, SocketConfig, SocketEnv, SocketKind};
use crate::task::DelayCancelHandle;
use crate::time::LocalDuration;

use super::DEFAULT_MANAGER_INTERVAL;

#[derive(Debug, Clone)]
pub struct UdpServerConfig {
    pub socket: SocketConfig,
    pub reuse: bool,
    pub manager_interval: LocalDuration,
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            reuse: true,
            manager_interval: DEFAULT_MANAGER_INTERVAL,
        }
    }
}

/// Canonical 18-byte peer key: port plus a 16-byte address, IPv4 mapped into
/// IPv4-in-IPv6 form so v4 and v6 peers share one key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    port: u16,
    addr: [u8; 16],
}

impl From<SocketAddr> for PeerKey {
    fn from(addr: SocketAddr) -> Self {
        let mapped = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            port: addr.port(),
            addr: mapped.octets(),
        }
    }
}

type SessionBuilder<S> = dyn Fn(SocketAddr) -> Arc<S> + Send + Sync;

/// One reactor's share of a UDP server. Sessions live in a map shared by the
/// primary and every clone, so a datagram observed on any reactor can find
/// (or create) the right session regardless of which reactor first saw that
/// peer.
pub struct UdpServer<S: Session + 'static> {
    reactor: EventPollerHandle,
    env: SocketEnv,
    config: UdpServerConfig,
    socket: Mutex<Option<Arc<Socket>>>,
    sessions: Arc<DashMap<PeerKey, Arc<SessionHelper<S>>>>,
    session_reactor: Arc<DashMap<PeerKey, EventPollerHandle>>,
    manager_timer: Mutex<Option<DelayCancelHandle>>,
    session_builder: Mutex<Option<Arc<SessionBuilder<S>>>>,
    clones: Mutex<Vec<Arc<UdpServer<S>>>>,
    server_token: Arc<()>,
}

impl<S: Session + 'static> UdpServer<S> {
    pub fn new(reactor: EventPollerHandle, env: SocketEnv, config: UdpServerConfig) -> Arc<Self> {
        Self::new_shared(reactor, env, config, Arc::new(DashMap::new()), Arc::new(DashMap::new()))
    }

    fn new_shared(
        reactor: EventPollerHandle,
        env: SocketEnv,
        config: UdpServerConfig,
        sessions: Arc<DashMap<PeerKey, Arc<SessionHelper<S>>>>,
        session_reactor: Arc<DashMap<PeerKey, EventPollerHandle>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            reactor,
            env,
            config,
            socket: Mutex::new(None),
            sessions,
            session_reactor,
            manager_timer: Mutex::new(None),
            session_builder: Mutex::new(None),
            clones: Mutex::new(Vec::new()),
            server_token: Arc::new(()),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Bind this server's reactor and every other reactor in `pool` to the
    /// same `port`, sharing it via `SO_REUSEPORT`.
    pub fn start(
        self: &Arc<Self>,
        pool: &PollerPool,
        port: u16,
        host: IpAddr,
        session_builder: impl Fn(SocketAddr) -> Arc<S> + Send + Sync + 'static,
    ) -> Result<(), SocketError> {
        let builder: Arc<SessionBuilder<S>> = Arc::new(session_builder);
        *self.session_builder.lock().unwrap() = Some(builder);
        self.bind_here(port, host)?;
        self.arm_manager_timer();

        let mut error = None;
        pool.for_each(|handle| {
            if handle.id() == self.reactor.id() {
                return;
            }
            let clone = UdpServer::new_shared(
                handle.clone(),
                self.env.clone(),
                self.config.clone(),
                self.sessions.clone(),
                self.session_reactor.clone(),
            );
            *clone.session_builder.lock().unwrap() = self.session_builder.lock().unwrap().clone();
            match clone.bind_here(port, host) {
                Ok(()) => {
                    clone.arm_manager_timer();
                    self.clones.lock().unwrap().push(clone);
                }
                Err(err) => error = Some(err),
            }
        });
        if let Some(err) = error {
            return Err(err);
        }
        Ok(())
    }

    fn bind_here(self: &Arc<Self>, port: u16, host: IpAddr) -> Result<(), SocketError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let this = self.clone();
        let reuse = self.config.reuse;
        self.reactor.spawn(move |poller| {
            let socket = Socket::new(SocketKind::Udp, this.reactor.clone(), this.config.socket.clone(), this.env.clone());
            let result = socket.bind_udp_socket(poller, port, host, reuse);
            if result.is_ok() {
                this.wire_socket(&socket);
                *this.socket.lock().unwrap() = Some(socket);
            }
            let _ = tx.send(result);
        });
        rx.recv().map_err(|_| SocketError::new(ErrorKind::Other, "reactor gone"))?
    }

    fn wire_socket(self: &Arc<Self>, socket: &Arc<Socket>) {
        let server = self.clone();
        socket.set_on_read(move |_sock, poller, data, peer| {
            let Some(peer) = peer else { return };
            server.on_datagram(poller, data, peer);
        });
    }

    fn on_datagram(self: &Arc<Self>, poller: &mut EventPoller, data: &[u8], peer: SocketAddr) {
        let key = PeerKey::from(peer);
        if let Some(entry) = self.sessions.get(&key) {
            let helper = entry.clone();
            drop(entry);
            match self.session_reactor.get(&key).map(|r| r.clone()) {
                Some(owner) if owner.id() != self.reactor.id() => {
                    let bytes = data.to_vec();
                    owner.spawn(move |poller| {
                        helper.session().on_recv(poller, &bytes, Some(peer));
                    });
                }
                _ => helper.session().on_recv(poller, data, Some(peer)),
            }
            return;
        }
        self.create_session(poller, data, peer, key);
    }

    fn create_session(self: &Arc<Self>, poller: &mut EventPoller, data: &[u8], peer: SocketAddr, key: PeerKey) {
        let Some(builder) = self.session_builder.lock().unwrap().clone() else {
            tracing::warn!("udp server received a datagram with no session builder installed");
            return;
        };
        let fd = self.socket.lock().unwrap().as_ref().and_then(|s| s.raw_fd()).unwrap_or(-1);
        let session = builder(peer);
        let id = next_session_id(fd);
        let server_weak: Weak<()> = Arc::downgrade(&self.server_token);
        let helper = SessionHelper::new(id, session.clone(), server_weak);

        self.sessions.insert(key, helper);
        self.session_reactor.insert(key, self.reactor.clone());

        session.on_recv(poller, data, Some(peer));
    }

    /// Remove a peer's session, notifying it with a shutdown error first.
    /// Exposed so a `Session` implementation can evict itself (e.g. on an
    /// idle timeout observed during `on_manager`).
    pub fn evict(&self, poller: &mut EventPoller, peer: SocketAddr) {
        let key = PeerKey::from(peer);
        if let Some((_, helper)) = self.sessions.remove(&key) {
            helper.session().on_err(poller, SocketError::new(ErrorKind::Shutdown, "session evicted"));
        }
        self.session_reactor.remove(&key);
    }

    fn on_manager_session(self: &Arc<Self>, poller: &mut EventPoller) {
        let snapshot: Vec<Arc<SessionHelper<S>>> = self
            .sessions
            .iter()
            .filter(|entry| {
                self.session_reactor
                    .get(entry.key())
                    .map(|owner| owner.id() == self.reactor.id())
                    .unwrap_or(false)
            })
            .map(|entry| entry.value().clone())
            .collect();
        for helper in snapshot {
            helper.session().on_manager(poller);
        }
    }

    fn arm_manager_timer(self: &Arc<Self>) {
        let this = self.clone();
        let interval = self.config.manager_interval;
        let timer = self.reactor.spawn_delayed(interval, move |poller| {
            this.on_manager_session(poller);
            interval.as_millis() as u64
        });
        *self.manager_timer.lock().unwrap() = Some(timer);
    }
}

impl<S: Session + 'static> Drop for UdpServer<S> {
    fn drop(&mut self) {
        if let Some(timer) = self.manager_timer.lock().unwrap().take() {
            timer.cancel();
        }
        if let Some(socket) = self.socket.lock().unwrap().take() {
            socket.close_socket();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_key_maps_v4_into_v6_space() {
        let v4: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:127.0.0.1]:9001".parse().unwrap();
        assert_eq!(PeerKey::from(v4), PeerKey::from(mapped));
    }

    #[test]
    fn distinct_ports_produce_distinct_keys() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:2".parse().unwrap();
        assert_ne!(PeerKey::from(a), PeerKey::from(b));
    }
}
