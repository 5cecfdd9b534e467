//! Binds a `TcpServer` with an echo session on a loopback ephemeral port and
//! drives it with a plain blocking `std::net::TcpStream` client.
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reactor_net::reactor::EventPoller;
use reactor_net::session::Session;
use reactor_net::socket::{Socket, SocketConfig, SocketEnv};
use reactor_net::{PoolConfig, PollerPool, SocketError, TcpServer, TcpServerConfig};

fn env() -> SocketEnv {
    SocketEnv {
        dns: Arc::new(reactor_net::dns::DnsCache::new()),
        worker: Arc::new(reactor_net::worker::WorkerPool::new().unwrap()),
    }
}

struct EchoSession {
    socket: Arc<Socket>,
    recv_count: AtomicUsize,
}

impl Session for EchoSession {
    fn on_recv(&self, poller: &mut EventPoller, data: &[u8], _peer: Option<SocketAddr>) {
        self.recv_count.fetch_add(1, Ordering::SeqCst);
        self.socket.send(Some(poller), data.to_vec(), None, true, None);
    }
    fn on_err(&self, _poller: &mut EventPoller, _err: SocketError) {}
    fn on_manager(&self, _poller: &mut EventPoller) {}
}

#[test]
fn echoes_bytes_back_to_client() {
    let pool = PollerPool::start(PoolConfig { reactor_count: Some(1) }).unwrap();
    let reactor = pool.get_poller(false);
    let server = TcpServer::<EchoSession>::new(reactor, env(), TcpServerConfig::default());

    server
        .start(&pool, 0, "127.0.0.1".parse().unwrap(), |socket| {
            Arc::new(EchoSession {
                socket: socket.clone(),
                recv_count: AtomicUsize::new(0),
            })
        })
        .unwrap();

    let addr = server.local_address().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"hello reactor").unwrap();

    let mut buf = [0u8; 32];
    let mut total = 0;
    while total < b"hello reactor".len() {
        let n = stream.read(&mut buf[total..]).unwrap();
        assert!(n > 0, "peer closed before echoing anything back");
        total += n;
    }
    assert_eq!(&buf[..total], b"hello reactor");
}

#[test]
fn supports_multiple_sequential_messages() {
    let pool = PollerPool::start(PoolConfig { reactor_count: Some(1) }).unwrap();
    let reactor = pool.get_poller(false);
    let config = TcpServerConfig {
        socket: SocketConfig::default(),
        ..TcpServerConfig::default()
    };
    let server = TcpServer::<EchoSession>::new(reactor, env(), config);

    server
        .start(&pool, 0, "127.0.0.1".parse().unwrap(), |socket| {
            Arc::new(EchoSession {
                socket: socket.clone(),
                recv_count: AtomicUsize::new(0),
            })
        })
        .unwrap();

    let addr = server.local_address().unwrap();
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    for msg in ["first", "second", "third"] {
        stream.write_all(msg.as_bytes()).unwrap();
        let mut buf = vec![0u8; msg.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, msg.as_bytes());
    }
}
