//! Server shells: clone themselves across every reactor in a pool and manage
//! session registration, periodic bookkeeping, and teardown.
pub mod tcp;
pub mod udp;

pub use tcp::{TcpServer, TcpServerConfig};
pub use udp::{UdpServer, UdpServerConfig};

use crate::time::LocalDuration;

/// Default interval for a server's periodic `on_manager` sweep.
pub const DEFAULT_MANAGER_INTERVAL: LocalDuration = LocalDuration::from_secs(2);
