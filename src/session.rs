//! Per-connection session lifetime: the user-extension trait, its lifetime
//! holder bound to a server, and the process-wide id → session index.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::error::SocketError;
use crate::reactor::EventPoller;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Capability set a user-supplied connection object must implement. The
/// framework only ever reaches a session through this trait; everything
/// else about the type is opaque to it.
pub trait Session: Send + Sync {
    fn on_recv(&self, poller: &mut EventPoller, data: &[u8], peer: Option<SocketAddr>);
    fn on_err(&self, poller: &mut EventPoller, err: SocketError);
    fn on_manager(&self, poller: &mut EventPoller);
}

/// Object-safe form of [`Session`], implemented for every `T: Session` and
/// for [`SessionHelper`] itself, so [`SessionMap`] can hold one uniform
/// `Weak<dyn ErasedSession>` regardless of the concrete session type.
pub trait ErasedSession: Send + Sync {
    fn on_recv(&self, poller: &mut EventPoller, data: &[u8], peer: Option<SocketAddr>);
    fn on_err(&self, poller: &mut EventPoller, err: SocketError);
    fn on_manager(&self, poller: &mut EventPoller);
}

impl<T: Session> ErasedSession for T {
    fn on_recv(&self, poller: &mut EventPoller, data: &[u8], peer: Option<SocketAddr>) {
        Session::on_recv(self, poller, data, peer)
    }
    fn on_err(&self, poller: &mut EventPoller, err: SocketError) {
        Session::on_err(self, poller, err)
    }
    fn on_manager(&self, poller: &mut EventPoller) {
        Session::on_manager(self, poller)
    }
}

/// `<monotonic-counter>-<fd>`, computed once per accepted connection.
pub fn next_session_id(fd: std::os::unix::io::RawFd) -> String {
    let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{n}-{fd}")
}

/// Owns a session's lifetime, bound to the server that created it.
///
/// Inserts itself into [`SessionMap::global`] on construction and removes
/// itself on drop. Carries a weak reference to the owning server purely as a
/// liveness check: a caller on a teardown path that discovers the server is
/// already gone via [`SessionHelper::server_gone`] is expected to emit
/// [`SocketError::server_shutdown`] to the session itself before dropping
/// this helper, since `Drop` has no reactor to deliver that callback on.
pub struct SessionHelper<S: Session + 'static> {
    id: String,
    session: Arc<S>,
    server: Weak<()>,
}

impl<S: Session + 'static> SessionHelper<S> {
    pub fn new(id: String, session: Arc<S>, server: Weak<()>) -> Arc<Self> {
        let helper = Arc::new(Self {
            id: id.clone(),
            session,
            server,
        });
        let erased_strong: Arc<dyn ErasedSession> = helper.clone();
        let erased: Weak<dyn ErasedSession> = Arc::downgrade(&erased_strong);
        SessionMap::global().insert(id, erased);
        helper
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &Arc<S> {
        &self.session
    }

    /// `true` once the owning server has been dropped.
    pub fn server_gone(&self) -> bool {
        self.server.upgrade().is_none()
    }
}

impl<S: Session + 'static> ErasedSession for SessionHelper<S> {
    fn on_recv(&self, poller: &mut EventPoller, data: &[u8], peer: Option<SocketAddr>) {
        self.session.on_recv(poller, data, peer)
    }
    fn on_err(&self, poller: &mut EventPoller, err: SocketError) {
        self.session.on_err(poller, err)
    }
    fn on_manager(&self, poller: &mut EventPoller) {
        self.session.on_manager(poller)
    }
}

impl<S: Session + 'static> Drop for SessionHelper<S> {
    fn drop(&mut self) {
        SessionMap::global().remove(&self.id);
    }
}

/// Process-wide, thread-safe id → session index. A lookup that resolves to a
/// dead weak reference evicts the entry as a side effect.
pub struct SessionMap {
    entries: DashMap<String, Weak<dyn ErasedSession>>,
}

impl SessionMap {
    pub fn global() -> &'static SessionMap {
        static MAP: Lazy<SessionMap> = Lazy::new(|| SessionMap { entries: DashMap::new() });
        &MAP
    }

    fn insert(&self, id: String, session: Weak<dyn ErasedSession>) {
        self.entries.insert(id, session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ErasedSession>> {
        let upgraded = self.entries.get(id).and_then(|entry| entry.upgrade());
        if upgraded.is_none() {
            self.entries.remove(id);
        }
        upgraded
    }

    pub fn remove(&self, id: &str) {
        self.entries.remove(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        manager_calls: Mutex<u32>,
    }

    impl Session for Recorder {
        fn on_recv(&self, _poller: &mut EventPoller, _data: &[u8], _peer: Option<SocketAddr>) {}
        fn on_err(&self, _poller: &mut EventPoller, _err: SocketError) {}
        fn on_manager(&self, _poller: &mut EventPoller) {
            *self.manager_calls.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dead_weak_is_evicted_on_lookup() {
        let id = next_session_id(7);
        {
            let session = Arc::new(Recorder { manager_calls: Mutex::new(0) });
            let owner: Arc<()> = Arc::new(());
            let _helper = SessionHelper::new(id.clone(), session, Arc::downgrade(&owner));
            assert!(SessionMap::global().get(&id).is_some());
        }
        assert!(SessionMap::global().get(&id).is_none());
    }

    #[test]
    fn server_gone_reflects_owner_lifetime() {
        let id = next_session_id(9);
        let session = Arc::new(Recorder { manager_calls: Mutex::new(0) });
        let owner: Arc<()> = Arc::new(());
        let helper = SessionHelper::new(id, session, Arc::downgrade(&owner));
        assert!(!helper.server_gone());
        drop(owner);
        assert!(helper.server_gone());
    }

    #[test]
    fn session_ids_are_monotonic_and_include_fd() {
        let a = next_session_id(5);
        let b = next_session_id(5);
        assert!(a.ends_with("-5"));
        assert!(b.ends_with("-5"));
        assert_ne!(a, b);
    }
}
