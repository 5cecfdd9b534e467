//! The socket object: binds one file descriptor to exactly one reactor and
//! mediates every read, write, accept and connect callback for it.
//!
//! Grounded on this codebase's `dial`/`listen` helpers: build a nonblocking
//! FD with `socket2` (domain selection, `EINPROGRESS`/`EALREADY` handling,
//! keepalive tuning), then convert it into the matching `std::net` type and
//! drive it with ordinary `Read`/`Write`/`accept`/`recv_from` from then on.
//! Generalized from a single TCP-stream peer type into one object that also
//! answers for UDP sockets and listen sockets.
use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket as RawSocket, TcpKeepalive, Type};
use tracing::{trace, warn};

use crate::buffer::{BufferSendMsg, CompletionCallback, Destination, Payload};
use crate::dns::DnsCache;
use crate::error::{ErrorKind, SocketError};
use crate::reactor::{EventPoller, EventPollerHandle, Interest, Readiness};
use crate::time::LocalDuration;
use crate::worker::WorkerPool;

/// Default size of a socket's shared read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 256 * 1024;
/// Default time a socket may remain unable to flush its send buffer before
/// [`Socket::emit_err`] is triggered with [`ErrorKind::Timeout`].
pub const DEFAULT_MAX_SEND_BUFFER: LocalDuration = LocalDuration::from_secs(10);
/// Default `listen` backlog.
pub const DEFAULT_LISTEN_BACKLOG: i32 = 32;
/// Default TCP keepalive idle/interval/probe counts.
pub const DEFAULT_KEEPALIVE_IDLE: Duration = Duration::from_secs(120);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE_PROBES: u32 = 9;

/// Direction a TCP connection was established in. Purely informational; it
/// does not affect socket behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Udp,
}

/// Tunables shared by every socket built through a given [`SocketEnv`].
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub read_buffer_size: usize,
    pub max_send_buffer: LocalDuration,
    pub listen_backlog: i32,
    pub keepalive_idle: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_probes: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_send_buffer: DEFAULT_MAX_SEND_BUFFER,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            keepalive_idle: DEFAULT_KEEPALIVE_IDLE,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_probes: DEFAULT_KEEPALIVE_PROBES,
        }
    }
}

/// The ambient collaborators a socket reaches for when resolving names. Cheap
/// to clone; every socket in a process normally shares one.
#[derive(Clone)]
pub struct SocketEnv {
    pub dns: Arc<DnsCache>,
    pub worker: Arc<WorkerPool>,
}

type OnRead = Box<dyn FnMut(&Arc<Socket>, &mut EventPoller, &[u8], Option<SocketAddr>) + Send>;
type OnErr = Box<dyn FnMut(&Arc<Socket>, &mut EventPoller, SocketError) + Send>;
type OnFlush = Box<dyn FnMut(&Arc<Socket>, &mut EventPoller) + Send>;
type OnSendResult = Box<dyn FnMut(&Arc<Socket>, usize, bool) + Send>;
type OnAccept = Box<dyn FnMut(&Arc<Socket>, &mut EventPoller, Arc<Socket>) + Send>;
/// Produces a fresh, as-yet-unconnected peer socket bound to some reactor —
/// normally a pool-selected one. Used by the accept path and by the UDP
/// server's per-peer demux.
pub type OnCreateSocket = Box<dyn Fn(&EventPollerHandle) -> Arc<Socket> + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_read: Option<OnRead>,
    on_err: Option<OnErr>,
    on_flush: Option<OnFlush>,
    on_send_result: Option<OnSendResult>,
    on_accept: Option<OnAccept>,
    on_create_socket: Option<OnCreateSocket>,
}

/// The live file descriptor, in whichever std form matches how it's used.
enum Fd {
    Stream(TcpStream),
    Listener(TcpListener),
    Datagram(UdpSocket),
}

impl Fd {
    fn raw(&self) -> RawFd {
        match self {
            Fd::Stream(s) => s.as_raw_fd(),
            Fd::Listener(s) => s.as_raw_fd(),
            Fd::Datagram(s) => s.as_raw_fd(),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Fd::Stream(s) => s.local_addr(),
            Fd::Listener(s) => s.local_addr(),
            Fd::Datagram(s) => s.local_addr(),
        }
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Fd::Stream(s) => s.take_error(),
            Fd::Listener(s) => s.take_error(),
            Fd::Datagram(s) => s.take_error(),
        }
    }
}

struct State {
    fd: Option<Fd>,
    link: Option<Link>,
    recv_enabled: bool,
    waiting: Vec<(Payload, Destination, Option<CompletionCallback>)>,
    sending: VecDeque<BufferSendMsg>,
    peer_addr: Option<SocketAddr>,
    connect_timer: Option<crate::task::DelayCancelHandle>,
    unsendable_since: Option<crate::time::LocalTime>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            fd: None,
            link: None,
            recv_enabled: true,
            waiting: Vec::new(),
            sending: VecDeque::new(),
            peer_addr: None,
            connect_timer: None,
            unsendable_since: None,
        }
    }
}

/// Binds a single file descriptor to one reactor for its whole life.
///
/// Every method that mutates FD registration either takes `&mut EventPoller`
/// directly (meaning: call it on this socket's reactor thread) or posts to
/// that reactor itself and is safe to call from anywhere; see each method.
pub struct Socket {
    reactor: EventPollerHandle,
    kind: SocketKind,
    config: SocketConfig,
    env: SocketEnv,
    state: Mutex<State>,
    callbacks: Mutex<Callbacks>,
}

impl Socket {
    pub fn new(kind: SocketKind, reactor: EventPollerHandle, config: SocketConfig, env: SocketEnv) -> Arc<Self> {
        Arc::new(Self {
            reactor,
            kind,
            config,
            env,
            state: Mutex::new(State::default()),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn reactor(&self) -> &EventPollerHandle {
        &self.reactor
    }

    pub fn link(&self) -> Option<Link> {
        self.state.lock().unwrap().link
    }

    pub fn local_address(&self) -> io::Result<SocketAddr> {
        let state = self.state.lock().unwrap();
        state
            .fd
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?
            .local_addr()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().fd.is_some()
    }

    /// The raw FD backing this socket, if it's currently open. Used by the
    /// server shells to compute session identity strings.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.state.lock().unwrap().fd.as_ref().map(Fd::raw)
    }

    pub fn set_on_read(&self, cb: impl FnMut(&Arc<Socket>, &mut EventPoller, &[u8], Option<SocketAddr>) + Send + 'static) {
        self.callbacks.lock().unwrap().on_read = Some(Box::new(cb));
    }

    pub fn set_on_err(&self, cb: impl FnMut(&Arc<Socket>, &mut EventPoller, SocketError) + Send + 'static) {
        self.callbacks.lock().unwrap().on_err = Some(Box::new(cb));
    }

    pub fn set_on_flush(&self, cb: impl FnMut(&Arc<Socket>, &mut EventPoller) + Send + 'static) {
        self.callbacks.lock().unwrap().on_flush = Some(Box::new(cb));
    }

    pub fn set_on_send_result(&self, cb: impl FnMut(&Arc<Socket>, usize, bool) + Send + 'static) {
        self.callbacks.lock().unwrap().on_send_result = Some(Box::new(cb));
    }

    pub fn set_on_accept(&self, cb: impl FnMut(&Arc<Socket>, &mut EventPoller, Arc<Socket>) + Send + 'static) {
        self.callbacks.lock().unwrap().on_accept = Some(Box::new(cb));
    }

    pub fn set_on_create_socket(&self, cb: OnCreateSocket) {
        self.callbacks.lock().unwrap().on_create_socket = Some(cb);
    }

    /// Connect to `host:port`. `host` may be a literal address (resolved
    /// synchronously) or a name (resolved via [`SocketEnv::dns`] off the
    /// reactor thread). `on_done` fires exactly once, on the reactor thread,
    /// with either success or the terminal [`SocketError`].
    pub fn connect(
        self: &Arc<Self>,
        host: impl Into<String>,
        port: u16,
        timeout: LocalDuration,
        local: Option<SocketAddr>,
        on_done: impl FnOnce(&mut EventPoller, Result<(), SocketError>) + Send + 'static,
    ) {
        let host = host.into();
        let this = self.clone();
        let mut on_done = Some(on_done);
        self.reactor.spawn(move |poller| {
            this.close_socket_local(poller);

            if let Ok(ip) = host.parse::<IpAddr>() {
                this.connect_resolved(poller, SocketAddr::new(ip, port), timeout, local, on_done.take().unwrap());
                return;
            }

            let env = this.env.clone();
            let handle = this.reactor.clone();
            let this2 = this.clone();
            let on_done = on_done.take().unwrap();
            // Resolved on the shared worker pool's own runtime thread, not a
            // fresh OS thread per connect: the future below runs to
            // completion there and posts the outcome back onto this
            // socket's reactor.
            let _ = env.worker.handle().spawn(async move {
                let result = env.dns.resolve(&host).await;
                handle.spawn(move |poller| match result {
                    Ok(addrs) if !addrs.is_empty() => {
                        let addr = SocketAddr::new(addrs[0], port);
                        this2.connect_resolved(poller, addr, timeout, local, on_done);
                    }
                    Ok(_) => on_done(poller, Err(SocketError::new(ErrorKind::Dns, "empty dns response"))),
                    Err(err) => on_done(poller, Err(SocketError::new(ErrorKind::Dns, err.to_string()))),
                });
            });
        });
    }

    fn connect_resolved(
        self: &Arc<Self>,
        poller: &mut EventPoller,
        addr: SocketAddr,
        timeout: LocalDuration,
        local: Option<SocketAddr>,
        on_done: impl FnOnce(&mut EventPoller, Result<(), SocketError>) + Send + 'static,
    ) {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let build = (|| -> io::Result<TcpStream> {
            let sock = RawSocket::new(domain, Type::STREAM, None)?;
            if let Some(local) = local {
                sock.bind(&SockAddr::from(local))?;
            }
            sock.set_nonblocking(true)?;
            configure_keepalive(&sock, &self.config)?;
            match sock.connect(&SockAddr::from(addr)) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            Ok(sock.into())
        })();

        let stream = match build {
            Ok(stream) => stream,
            Err(err) => return on_done(poller, Err(SocketError::from(err))),
        };

        let fd = stream.as_raw_fd();
        {
            let mut state = self.state.lock().unwrap();
            state.fd = Some(Fd::Stream(stream));
            state.link = Some(Link::Outbound);
        }

        // Shared between the timeout timer and the write-readiness callback
        // below so whichever fires first can take and resolve it exactly
        // once; the reactor is single-threaded so there's no race to resolve,
        // only the bookkeeping of "don't call it twice".
        type OnDone = Box<dyn FnOnce(&mut EventPoller, Result<(), SocketError>) + Send>;
        let on_done: Arc<Mutex<Option<OnDone>>> = Arc::new(Mutex::new(Some(Box::new(on_done))));

        let this_timeout = self.clone();
        let on_done_timeout = on_done.clone();
        let timer = poller.handle().spawn_delayed(timeout, move |poller| {
            this_timeout.emit_err(SocketError::timeout("connect"));
            if let Some(done) = on_done_timeout.lock().unwrap().take() {
                done(poller, Err(SocketError::timeout("connect")));
            }
            0
        });
        self.state.lock().unwrap().connect_timer = Some(timer);

        let this_cb = self.clone();
        // One callback serves both phases so the fd is only ever registered
        // once: `connecting` gates the SO_ERROR check, and success just
        // switches interest and falls through to ordinary dispatch from then
        // on, rather than replacing the registration.
        let mut connecting = true;
        poller.add_event(
            fd,
            Interest::WRITE,
            Box::new(move |poller, readiness| {
                if connecting {
                    if !readiness.writable && !readiness.error {
                        return;
                    }
                    let so_error = {
                        let state = this_cb.state.lock().unwrap();
                        state.fd.as_ref().and_then(|fd| fd.take_error().ok().flatten())
                    };
                    if let Some(timer) = this_cb.state.lock().unwrap().connect_timer.take() {
                        timer.cancel();
                    }
                    match so_error {
                        Some(err) => {
                            this_cb.emit_err(SocketError::from(err));
                            if let Some(done) = on_done.lock().unwrap().take() {
                                done(poller, Err(SocketError::new(ErrorKind::Refused, "connect failed")));
                            }
                            return;
                        }
                        None => {
                            connecting = false;
                            poller.modify_event(fd, Interest::READ);
                            if let Some(done) = on_done.lock().unwrap().take() {
                                done(poller, Ok(()));
                            }
                            return;
                        }
                    }
                }
                this_cb.on_event(poller, readiness);
            }),
        );
    }

    /// Registers the normal read/write/error interest used once a connection
    /// is live: immediately for an accepted or bound socket.
    fn attach_operational(self: &Arc<Self>, poller: &mut EventPoller, fd: RawFd) {
        let this = self.clone();
        poller.add_event(
            fd,
            Interest::READ,
            Box::new(move |poller, readiness| this.on_event(poller, readiness)),
        );
    }

    fn on_event(self: &Arc<Self>, poller: &mut EventPoller, readiness: Readiness) {
        if readiness.readable {
            self.on_readable(poller);
        }
        if readiness.writable {
            self.flush_data(poller);
        }
        if readiness.hangup && !readiness.readable {
            self.emit_err(SocketError::new(ErrorKind::Eof, "hangup"));
        }
    }

    /// Bind and listen for TCP connections. Installs the accept path on
    /// Read|Error readiness.
    pub fn listen(self: &Arc<Self>, poller: &mut EventPoller, port: u16, local_ip: IpAddr, backlog: i32) -> Result<(), SocketError> {
        let domain = if local_ip.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let sock = RawSocket::new(domain, Type::STREAM, None).map_err(SocketError::from)?;
        sock.set_reuse_address(true).map_err(SocketError::from)?;
        sock.bind(&SockAddr::from(SocketAddr::new(local_ip, port))).map_err(SocketError::from)?;
        sock.listen(backlog).map_err(SocketError::from)?;
        sock.set_nonblocking(true).map_err(SocketError::from)?;
        let listener: TcpListener = sock.into();

        let fd = listener.as_raw_fd();
        {
            let mut state = self.state.lock().unwrap();
            state.fd = Some(Fd::Listener(listener));
        }

        let this = self.clone();
        poller.add_event(
            fd,
            Interest::READ,
            Box::new(move |poller, _readiness| this.accept_loop(poller, fd)),
        );
        Ok(())
    }

    /// Duplicate this listening socket's FD onto `target`, registering the
    /// same accept path there. Used by the TCP server to clone its listener
    /// across every reactor in the pool.
    pub fn clone_listener(self: &Arc<Self>, target: EventPollerHandle, config: SocketConfig, env: SocketEnv) -> Result<Arc<Socket>, SocketError> {
        let dup = {
            let state = self.state.lock().unwrap();
            match state.fd.as_ref() {
                Some(Fd::Listener(listener)) => listener.try_clone().map_err(SocketError::from)?,
                _ => return Err(SocketError::new(ErrorKind::Other, "socket not listening")),
            }
        };
        let clone = Socket::new(SocketKind::Tcp, target, config, env);
        let fd = dup.as_raw_fd();
        {
            let mut state = clone.state.lock().unwrap();
            state.fd = Some(Fd::Listener(dup));
        }
        let this = clone.clone();
        clone.reactor.spawn(move |poller| {
            poller.add_event(
                fd,
                Interest::READ,
                Box::new(move |poller, _readiness| this.accept_loop(poller, fd)),
            );
        });
        Ok(clone)
    }

    fn accept_loop(self: &Arc<Self>, poller: &mut EventPoller, listen_fd: RawFd) {
        loop {
            let accepted = {
                let state = self.state.lock().unwrap();
                match state.fd.as_ref() {
                    Some(Fd::Listener(listener)) => {
                        debug_assert_eq!(listener.as_raw_fd(), listen_fd);
                        listener.accept()
                    }
                    _ => return,
                }
            };
            let (conn, _addr) = match accepted {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(?err, "accept failed");
                    return;
                }
            };
            let conn = match configure_accepted(conn, &self.config) {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(?err, "failed to configure accepted socket");
                    continue;
                }
            };

            let Some(on_create_socket) = self.callbacks.lock().unwrap().on_create_socket.take() else {
                warn!("no on_create_socket callback installed, dropping connection");
                continue;
            };
            let peer = on_create_socket(&poller.handle());
            self.callbacks.lock().unwrap().on_create_socket = Some(on_create_socket);

            let fd = conn.as_raw_fd();
            {
                let mut peer_state = peer.state.lock().unwrap();
                peer_state.fd = Some(Fd::Stream(conn));
                peer_state.link = Some(Link::Inbound);
            }

            let guard = AttachGuard { socket: peer.clone(), fd };
            if let Some(on_accept) = self.callbacks.lock().unwrap().on_accept.as_mut() {
                on_accept(self, poller, peer.clone());
            }
            drop(guard);
        }
    }

    /// Bind a UDP socket. Installs read/write/error interest immediately.
    pub fn bind_udp_socket(self: &Arc<Self>, poller: &mut EventPoller, port: u16, local_ip: IpAddr, reuse: bool) -> Result<(), SocketError> {
        let domain = if local_ip.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let sock = RawSocket::new(domain, Type::DGRAM, None).map_err(SocketError::from)?;
        if reuse {
            sock.set_reuse_address(true).map_err(SocketError::from)?;
            sock.set_reuse_port(true).map_err(SocketError::from)?;
        }
        sock.bind(&SockAddr::from(SocketAddr::new(local_ip, port))).map_err(SocketError::from)?;
        sock.set_nonblocking(true).map_err(SocketError::from)?;
        let udp: UdpSocket = sock.into();

        let fd = udp.as_raw_fd();
        {
            let mut state = self.state.lock().unwrap();
            state.fd = Some(Fd::Datagram(udp));
        }
        self.attach_operational(poller, fd);
        Ok(())
    }

    /// Pin the kernel-level peer for a UDP socket, so `send` with no explicit
    /// destination goes to this address.
    pub fn bind_peer_addr(&self, addr: SocketAddr) -> io::Result<()> {
        debug_assert_eq!(self.kind, SocketKind::Udp);
        let mut state = self.state.lock().unwrap();
        if let Some(Fd::Datagram(udp)) = state.fd.as_ref() {
            udp.connect(addr)?;
        }
        state.peer_addr = Some(addr);
        Ok(())
    }

    fn on_readable(self: &Arc<Self>, poller: &mut EventPoller) {
        loop {
            if !self.state.lock().unwrap().recv_enabled {
                return;
            }
            let mut buf = vec![0u8; self.config.read_buffer_size];
            let outcome = {
                let mut state = self.state.lock().unwrap();
                match state.fd.as_mut() {
                    Some(Fd::Stream(stream)) => stream.read(&mut buf).map(|n| (n, None)),
                    Some(Fd::Datagram(udp)) => udp.recv_from(&mut buf).map(|(n, peer)| (n, Some(peer))),
                    _ => return,
                }
            };
            match outcome {
                Ok((0, _)) if self.kind == SocketKind::Tcp => {
                    self.emit_err(SocketError::new(ErrorKind::Eof, "peer performed orderly shutdown"));
                    return;
                }
                Ok((0, _)) => return,
                Ok((n, peer)) => {
                    buf.truncate(n);
                    if let Some(cb) = self.callbacks.lock().unwrap().on_read.as_mut() {
                        cb(self, poller, &buf, peer);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    if self.kind == SocketKind::Tcp {
                        self.emit_err(SocketError::from(err));
                    } else {
                        trace!(?err, "udp recv error, socket stays open");
                    }
                    return;
                }
            }
        }
    }

    /// Queue `payload` for sending. If `try_flush`, attempts to flush
    /// immediately when a live `&mut EventPoller` is supplied (i.e. the
    /// caller is already on this socket's reactor thread); otherwise the
    /// flush is posted.
    pub fn send(
        self: &Arc<Self>,
        poller: Option<&mut EventPoller>,
        payload: impl Into<Payload>,
        destination: Destination,
        try_flush: bool,
        on_complete: Option<CompletionCallback>,
    ) {
        self.state.lock().unwrap().waiting.push((payload.into(), destination, on_complete));
        if !try_flush {
            return;
        }
        match poller {
            Some(poller) => {
                self.flush_data(poller);
            }
            None => {
                let this = self.clone();
                self.reactor.spawn(move |poller| {
                    this.flush_data(poller);
                });
            }
        }
    }

    fn flush_data(self: &Arc<Self>, poller: &mut EventPoller) -> bool {
        loop {
            let mut state = self.state.lock().unwrap();

            if state.sending.is_empty() {
                if state.waiting.is_empty() {
                    let fd = state.fd.as_ref().map(Fd::raw);
                    drop(state);
                    if let Some(fd) = fd {
                        poller.modify_event(fd, Interest::READ);
                    }
                    if let Some(cb) = self.callbacks.lock().unwrap().on_flush.as_mut() {
                        cb(self, poller);
                    }
                    return true;
                }
                let waiting = std::mem::take(&mut state.waiting);
                state.sending.push_back(BufferSendMsg::from_waiting(waiting));
            }

            let Some(fd) = state.fd.as_ref().map(Fd::raw) else { return false };
            let peer_addr = state.peer_addr;
            let kind = self.kind;

            let send_result = {
                let socket_fd = state.fd.as_ref().unwrap();
                let head = state.sending.front().unwrap();
                let destination = head.head_destination().or(peer_addr);
                let slices = head.io_slices();
                send_vectored(socket_fd, kind, &slices, destination)
            };

            match send_result {
                Ok(n) => {
                    state.unsendable_since = None;
                    let remaining_before = state.sending.front().unwrap().remaining();
                    state.sending.front_mut().unwrap().re_offset(n);
                    if state.sending.front().map(|a| a.is_empty()).unwrap_or(false) {
                        state.sending.pop_front();
                    }
                    let done_for_now = n < remaining_before;
                    drop(state);
                    if let Some(cb) = self.callbacks.lock().unwrap().on_send_result.as_mut() {
                        cb(self, n, true);
                    }
                    if done_for_now {
                        poller.modify_event(fd, Interest::ALL);
                        return true;
                    }
                    // fully sent head aggregator; loop to drain the next one
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted => {
                    let since = *state.unsendable_since.get_or_insert_with(crate::time::LocalTime::now);
                    let timed_out = crate::time::LocalTime::now().duration_since(since) > self.config.max_send_buffer;
                    drop(state);
                    if timed_out {
                        self.emit_err(SocketError::timeout("send"));
                        return false;
                    }
                    poller.modify_event(fd, Interest::ALL);
                    return true;
                }
                Err(err) => {
                    if self.kind == SocketKind::Udp {
                        state.sending.pop_front();
                        continue;
                    }
                    drop(state);
                    self.emit_err(SocketError::from(err));
                    return false;
                }
            }
        }
    }

    /// Toggle the Read interest. Idempotent; must be called on this socket's
    /// reactor thread.
    pub fn enable_recv(&self, poller: &mut EventPoller, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        if state.recv_enabled == enabled {
            return;
        }
        state.recv_enabled = enabled;
        if let Some(fd) = state.fd.as_ref().map(Fd::raw) {
            let interest = if enabled { Interest::ALL } else { Interest::WRITE };
            drop(state);
            poller.modify_event(fd, interest);
        }
    }

    /// Close the FD without emitting an error. Safe to call from any thread.
    pub fn close_socket(self: &Arc<Self>) {
        let this = self.clone();
        self.reactor.spawn(move |poller| this.close_socket_local(poller));
    }

    fn close_socket_local(self: &Arc<Self>, poller: &mut EventPoller) {
        let mut state = self.state.lock().unwrap();
        state.connect_timer = None;
        if let Some(fd) = state.fd.take() {
            let raw = fd.raw();
            drop(fd);
            drop(state);
            poller.del_event(raw);
        }
    }

    /// Close the FD (synchronously) and post the user's `on_err` callback
    /// onto this socket's reactor. No-op if the FD is already gone.
    pub fn emit_err(self: &Arc<Self>, err: SocketError) -> bool {
        let fd = {
            let mut state = self.state.lock().unwrap();
            state.connect_timer = None;
            match state.fd.take() {
                Some(fd) => {
                    let raw = fd.raw();
                    drop(fd);
                    raw
                }
                None => return false,
            }
        };
        let this = self.clone();
        self.reactor.spawn(move |poller| {
            poller.del_event(fd);
            if let Some(cb) = this.callbacks.lock().unwrap().on_err.as_mut() {
                cb(&this, poller, err);
            }
        });
        true
    }
}

/// Ensures the freshly-accepted peer's read/write interest is installed on
/// its own reactor exactly once, after the user's `on_accept` callback has
/// finished configuring it — even if that reactor differs from the one the
/// accept happened on.
struct AttachGuard {
    socket: Arc<Socket>,
    fd: RawFd,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        // Always posted, even when the peer's reactor is this one: there's no
        // live `&mut EventPoller` to hand out from inside a `Drop` running on
        // another socket's accept loop.
        let socket = self.socket.clone();
        let fd = self.fd;
        let reactor = socket.reactor.clone();
        reactor.spawn(move |poller| {
            socket.attach_operational(poller, fd);
        });
    }
}

fn configure_keepalive(sock: &RawSocket, config: &SocketConfig) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(config.keepalive_idle)
        .with_interval(config.keepalive_interval);
    #[cfg(target_os = "linux")]
    let keepalive = keepalive.with_retries(config.keepalive_probes);
    sock.set_tcp_keepalive(&keepalive)
}

/// Apply accept-path tuning (nodelay, linger, keepalive, buffer sizes) to a
/// freshly-accepted stream, round-tripping through `socket2` for the options
/// `std::net::TcpStream` doesn't expose directly.
fn configure_accepted(conn: TcpStream, config: &SocketConfig) -> io::Result<TcpStream> {
    conn.set_nonblocking(true)?;
    conn.set_nodelay(true)?;
    let sock2 = unsafe { RawSocket::from_raw_fd(conn.into_raw_fd()) };
    sock2.set_linger(Some(Duration::from_secs(0)))?;
    sock2.set_send_buffer_size(config.read_buffer_size)?;
    sock2.set_recv_buffer_size(config.read_buffer_size)?;
    configure_keepalive(&sock2, config)?;
    Ok(sock2.into())
}

/// Send `slices` to `destination`, or to the socket's already-connected peer
/// if `destination` is `None`. TCP always has a connected peer, so it always
/// goes through `Write::write_vectored`; UDP goes through `sendmsg` so an
/// explicit per-payload destination can override the connected peer, if any.
///
/// `IoSlice` shares layout with `libc::iovec` on unix, which is what lets
/// `sendmsg` take it directly without copying.
fn send_vectored(fd: &Fd, kind: SocketKind, slices: &[IoSlice<'_>], destination: Option<SocketAddr>) -> io::Result<usize> {
    match (kind, fd) {
        (SocketKind::Tcp, Fd::Stream(stream)) => {
            let mut stream = stream;
            stream.write_vectored(slices)
        }
        (SocketKind::Udp, _) => {
            let raw = fd.raw();
            let sockaddr = destination.map(SockAddr::from);
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            if let Some(addr) = sockaddr.as_ref() {
                msg.msg_name = addr.as_ptr() as *mut libc::c_void;
                msg.msg_namelen = addr.len();
            }
            msg.msg_iov = slices.as_ptr() as *mut libc::iovec;
            msg.msg_iovlen = slices.len() as _;
            let n = unsafe { libc::sendmsg(raw, &msg, 0) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }
        _ => Err(io::Error::from(io::ErrorKind::NotConnected)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{EventPoller, ReactorConfig};

    fn env() -> SocketEnv {
        SocketEnv {
            dns: Arc::new(DnsCache::new()),
            worker: Arc::new(WorkerPool::new().unwrap()),
        }
    }

    #[test]
    fn fresh_socket_is_closed() {
        let poller = EventPoller::new(ReactorConfig::default()).unwrap();
        let handle = poller.handle();
        let sock = Socket::new(SocketKind::Tcp, handle, SocketConfig::default(), env());
        assert!(!sock.is_open());
        assert!(sock.local_address().is_err());
    }

    #[test]
    fn emit_err_on_closed_socket_is_noop() {
        let poller = EventPoller::new(ReactorConfig::default()).unwrap();
        let handle = poller.handle();
        let sock = Socket::new(SocketKind::Tcp, handle, SocketConfig::default(), env());
        assert!(!sock.emit_err(SocketError::new(ErrorKind::Other, "x")));
    }

    #[test]
    fn listen_binds_ephemeral_port() {
        let mut poller = EventPoller::new(ReactorConfig::default()).unwrap();
        let handle = poller.handle();
        let sock = Socket::new(SocketKind::Tcp, handle, SocketConfig::default(), env());
        sock.listen(&mut poller, 0, "127.0.0.1".parse().unwrap(), DEFAULT_LISTEN_BACKLOG)
            .unwrap();
        assert!(sock.local_address().is_ok());
    }

    #[test]
    fn bind_udp_socket_binds_ephemeral_port() {
        let mut poller = EventPoller::new(ReactorConfig::default()).unwrap();
        let handle = poller.handle();
        let sock = Socket::new(SocketKind::Udp, handle, SocketConfig::default(), env());
        sock.bind_udp_socket(&mut poller, 0, "127.0.0.1".parse().unwrap(), true).unwrap();
        assert!(sock.local_address().is_ok());
    }
}
