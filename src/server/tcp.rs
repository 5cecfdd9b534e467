//! TCP server: listens on one reactor, clones the listen FD to every other
//! reactor in the pool, and accepts independently on each.
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{ErrorKind, SocketError};
use crate::pool::PollerPool;
use crate::reactor::{EventPoller, EventPollerHandle};
use crate::session::{next_session_id, Session, SessionHelper};
use crate::socket::{Socket, SocketConfig, SocketEnv, SocketKind};
use crate::task::DelayCancelHandle;
use crate::time::LocalDuration;

use super::DEFAULT_MANAGER_INTERVAL;

#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    pub socket: SocketConfig,
    pub backlog: i32,
    pub manager_interval: LocalDuration,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            backlog: crate::socket::DEFAULT_LISTEN_BACKLOG,
            manager_interval: DEFAULT_MANAGER_INTERVAL,
        }
    }
}

type SessionBuilder<S> = dyn Fn(&Arc<Socket>) -> Arc<S> + Send + Sync;

/// A TCP server instance. `start` installs the primary listener and spawns
/// one clone per remaining reactor in the pool; each clone is itself a
/// `TcpServer`, reachable through `clones()` only for introspection — every
/// clone accepts and manages sessions independently on its own reactor.
pub struct TcpServer<S: Session + 'static> {
    reactor: EventPollerHandle,
    env: SocketEnv,
    config: TcpServerConfig,
    listener: Mutex<Option<Arc<Socket>>>,
    sessions: Mutex<HashMap<String, Arc<SessionHelper<S>>>>,
    manager_timer: Mutex<Option<DelayCancelHandle>>,
    in_manager_sweep: Mutex<bool>,
    pending_removals: Mutex<Vec<String>>,
    session_builder: Mutex<Option<Arc<SessionBuilder<S>>>>,
    clones: Mutex<Vec<Arc<TcpServer<S>>>>,
    server_token: Arc<()>,
}

impl<S: Session + 'static> TcpServer<S> {
    pub fn new(reactor: EventPollerHandle, env: SocketEnv, config: TcpServerConfig) -> Arc<Self> {
        Arc::new(Self {
            reactor,
            env,
            config,
            listener: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            manager_timer: Mutex::new(None),
            in_manager_sweep: Mutex::new(false),
            pending_removals: Mutex::new(Vec::new()),
            session_builder: Mutex::new(None),
            clones: Mutex::new(Vec::new()),
            server_token: Arc::new(()),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// The address this server's own listener is bound to. Mainly useful in
    /// tests that bind an ephemeral port (`port == 0`) and need to discover
    /// which one the kernel picked.
    pub fn local_address(&self) -> std::io::Result<SocketAddr> {
        self.listener
            .lock()
            .unwrap()
            .as_ref()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?
            .local_address()
    }

    pub fn clones(&self) -> Vec<Arc<TcpServer<S>>> {
        self.clones.lock().unwrap().clone()
    }

    /// Bind and listen on this server's own reactor, then clone the listener
    /// onto every other reactor in `pool`. `session_builder` is shared by
    /// the primary and every clone.
    pub fn start(
        self: &Arc<Self>,
        pool: &PollerPool,
        port: u16,
        host: IpAddr,
        session_builder: impl Fn(&Arc<Socket>) -> Arc<S> + Send + Sync + 'static,
    ) -> Result<(), SocketError> {
        let builder: Arc<SessionBuilder<S>> = Arc::new(session_builder);
        *self.session_builder.lock().unwrap() = Some(builder);
        self.listen_here(port, host)?;
        self.arm_manager_timer();

        let mut clone_errors = Vec::new();
        pool.for_each(|handle| {
            if handle.id() == self.reactor.id() {
                return;
            }
            let clone = TcpServer::new(handle.clone(), self.env.clone(), self.config.clone());
            *clone.session_builder.lock().unwrap() = self.session_builder.lock().unwrap().clone();
            let primary_listener = self.listener.lock().unwrap().clone();
            let Some(primary_listener) = primary_listener else { return };
            match clone.clone_from_listener(&primary_listener) {
                Ok(()) => {
                    clone.arm_manager_timer();
                    self.clones.lock().unwrap().push(clone);
                }
                Err(err) => clone_errors.push(err),
            }
        });
        if let Some(err) = clone_errors.into_iter().next() {
            return Err(err);
        }
        Ok(())
    }

    fn listen_here(self: &Arc<Self>, port: u16, host: IpAddr) -> Result<(), SocketError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let this = self.clone();
        let backlog = self.config.backlog;
        self.reactor.spawn(move |poller| {
            let socket = Socket::new(SocketKind::Tcp, this.reactor.clone(), this.config.socket.clone(), this.env.clone());
            let result = socket.listen(poller, port, host, backlog);
            if result.is_ok() {
                this.wire_listener(&socket);
                *this.listener.lock().unwrap() = Some(socket);
            }
            let _ = tx.send(result);
        });
        rx.recv().map_err(|_| SocketError::new(ErrorKind::Other, "reactor gone"))?
    }

    fn clone_from_listener(self: &Arc<Self>, primary_listener: &Arc<Socket>) -> Result<(), SocketError> {
        let cloned = primary_listener.clone_listener(self.reactor.clone(), self.config.socket.clone(), self.env.clone())?;
        self.wire_listener(&cloned);
        *self.listener.lock().unwrap() = Some(cloned);
        Ok(())
    }

    fn wire_listener(self: &Arc<Self>, listener: &Arc<Socket>) {
        let env = self.env.clone();
        let config = self.config.socket.clone();
        listener.set_on_create_socket(Box::new(move |reactor_handle| {
            Socket::new(SocketKind::Tcp, reactor_handle.clone(), config.clone(), env.clone())
        }));
        let server = self.clone();
        listener.set_on_accept(move |_listener, poller, peer| {
            server.on_accept_connection(poller, peer);
        });
    }

    fn on_accept_connection(self: &Arc<Self>, poller: &mut EventPoller, peer: Arc<Socket>) {
        let Some(builder) = self.session_builder.lock().unwrap().clone() else {
            tracing::warn!("tcp server accepted a connection with no session builder installed");
            return;
        };
        let session = builder(&peer);
        let id = next_session_id(peer.raw_fd().unwrap_or(-1));
        let server_weak: Weak<()> = Arc::downgrade(&self.server_token);
        let helper = SessionHelper::new(id.clone(), session.clone(), server_weak);
        self.sessions.lock().unwrap().insert(id.clone(), helper);

        let session_for_read = session.clone();
        peer.set_on_read(move |_sock, poller, data, peer_addr| {
            session_for_read.on_recv(poller, data, peer_addr);
        });

        let this = self.clone();
        let id_for_err = id;
        peer.set_on_err(move |_sock, poller, err| {
            session.on_err(poller, err);
            this.remove_session(&id_for_err);
            let _ = poller;
        });
    }

    fn remove_session(self: &Arc<Self>, id: &str) {
        if *self.in_manager_sweep.lock().unwrap() {
            self.pending_removals.lock().unwrap().push(id.to_string());
            return;
        }
        self.sessions.lock().unwrap().remove(id);
    }

    fn on_manager_session(self: &Arc<Self>, poller: &mut EventPoller) {
        *self.in_manager_sweep.lock().unwrap() = true;
        let snapshot: Vec<Arc<SessionHelper<S>>> = self.sessions.lock().unwrap().values().cloned().collect();
        for helper in snapshot {
            helper.session().on_manager(poller);
        }
        *self.in_manager_sweep.lock().unwrap() = false;

        let pending = std::mem::take(&mut *self.pending_removals.lock().unwrap());
        if pending.is_empty() {
            return;
        }
        let mut sessions = self.sessions.lock().unwrap();
        for id in pending {
            sessions.remove(&id);
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

impl<S: Session + 'static> Drop for TcpServer<S> {
    fn drop(&mut self) {
        if let Some(timer) = self.manager_timer.lock().unwrap().take() {
            timer.cancel();
        }
        if let Some(listener) = self.listener.lock().unwrap().take() {
            listener.close_socket();
        }
        self.sessions.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::DnsCache;
    use crate::worker::WorkerPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoSession {
        recv_count: AtomicUsize,
    }

    impl Session for EchoSession {
        fn on_recv(&self, _poller: &mut EventPoller, _data: &[u8], _peer: Option<SocketAddr>) {
            self.recv_count.fetch_add(1, Ordering::SeqCst);
        }
        fn on_err(&self, _poller: &mut EventPoller, _err: SocketError) {}
        fn on_manager(&self, _poller: &mut EventPoller) {}
    }

    fn env() -> SocketEnv {
        SocketEnv {
            dns: Arc::new(DnsCache::new()),
            worker: Arc::new(WorkerPool::new().unwrap()),
        }
    }

    #[test]
    fn start_binds_listener_and_has_no_sessions_yet() {
        let pool = PollerPool::start(crate::pool::PoolConfig { reactor_count: Some(1) }).unwrap();
        let primary = pool.get_poller(false);
        let server = TcpServer::<EchoSession>::new(primary, env(), TcpServerConfig::default());
        server
            .start(&pool, 0, "127.0.0.1".parse().unwrap(), |_sock| {
                Arc::new(EchoSession { recv_count: AtomicUsize::new(0) })
            })
            .unwrap();
        assert_eq!(server.session_count(), 0);
    }
}
