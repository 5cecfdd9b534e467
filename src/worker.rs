//! Blocking-task offload used by [`crate::socket::Socket::connect`] for name
//! resolution, so a DNS lookup never stalls a reactor's readiness loop.
//!
//! This is deliberately thin: a single `tokio` current-thread runtime hosted
//! on its own OS thread, handing work to `tokio::task::spawn_blocking`'s own
//! pool. Anything heavier (bounded queues, worker metrics) belongs to the
//! application embedding this core, not to the networking core itself.
use std::future::Future;

use tokio::runtime::{Builder, Runtime};

/// Runs blocking or async closures off the reactor threads.
pub struct WorkerPool {
    runtime: Runtime,
}

impl WorkerPool {
    pub fn new() -> std::io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { runtime })
    }

    /// Run a blocking closure on a `tokio` blocking-pool thread, returning its
    /// result on the caller's thread once complete.
    pub fn run_blocking<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.runtime
            .block_on(async move { tokio::task::spawn_blocking(f).await })
            .expect("worker task panicked")
    }

    /// Run an async future (e.g. a DNS lookup) to completion on this pool's
    /// runtime, blocking the caller until it resolves.
    pub fn run<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        self.runtime.block_on(fut)
    }

    /// A handle that can be used to spawn work onto this pool's runtime from
    /// another thread without blocking the caller.
    pub fn handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_blocking_returns_value() {
        let pool = WorkerPool::new().unwrap();
        let result = pool.run_blocking(|| 2 + 2);
        assert_eq!(result, 4);
    }
}
