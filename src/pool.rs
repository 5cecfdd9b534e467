//! The poller pool: a process-wide set of reactors that load-balances work
//! and lets any thread discover "the reactor I'm already running on" or
//! "the least-loaded reactor" without coordination.
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::reactor::{EventPoller, EventPollerHandle, ReactorConfig};
use crate::time::LocalTime;

/// Tunables for a [`PollerPool`]. See [`ReactorConfig`] for the per-reactor
/// equivalent.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of reactors to start. `None` defaults to
    /// [`std::thread::available_parallelism`].
    pub reactor_count: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { reactor_count: None }
    }
}

/// A running pool of reactors, each on its own dedicated thread.
pub struct PollerPool {
    handles: Vec<EventPollerHandle>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl PollerPool {
    /// Start `config.reactor_count` (or hardware concurrency) reactors, each
    /// on its own thread.
    pub fn start(config: PoolConfig) -> std::io::Result<Self> {
        let count = config
            .reactor_count
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));

        let mut handles = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);

        for id in 0..count {
            let reactor_config = ReactorConfig {
                name: format!("reactor-{id}"),
                priority: None,
            };
            let poller = EventPoller::with_id(id, reactor_config)?;
            handles.push(poller.handle());
            let thread = std::thread::Builder::new()
                .name(format!("reactor-{id}"))
                .spawn(move || {
                    if let Err(err) = poller.run() {
                        tracing::error!(?err, id, "reactor loop exited with error");
                    }
                })?;
            threads.push(thread);
        }

        Ok(Self {
            handles,
            threads: Mutex::new(threads),
            next: AtomicUsize::new(0),
        })
    }

    pub fn reactor_count(&self) -> usize {
        self.handles.len()
    }

    /// Pick a reactor to hand work to. If `prefer_current` and the calling
    /// thread is already a reactor thread in this pool, returns that one;
    /// otherwise returns the least-loaded reactor.
    pub fn get_poller(&self, prefer_current: bool) -> EventPollerHandle {
        if prefer_current {
            if let Some(handle) = self.handles.iter().find(|h| h.is_current()) {
                return handle.clone();
            }
        }
        self.least_loaded()
    }

    fn least_loaded(&self) -> EventPollerHandle {
        self.handles
            .iter()
            .min_by(|a, b| a.load().partial_cmp(&b.load()).unwrap_or(std::cmp::Ordering::Equal))
            .cloned()
            .unwrap_or_else(|| {
                // Pool started with zero reactors; round-robin over an empty
                // set is impossible, so this only happens if `reactor_count`
                // was explicitly set to 0 — a misconfiguration the caller
                // owns, not something this method can recover from silently.
                panic!("poller pool has no reactors")
            })
    }

    /// Iterate every reactor in the pool, posting `cb` to each.
    pub fn for_each(&self, mut cb: impl FnMut(&EventPollerHandle)) {
        for handle in &self.handles {
            cb(handle);
        }
    }

    /// Sample wall-clock scheduling lag on every reactor: posts a task to
    /// each that records how long it took the reactor to run it, and
    /// `on_done` fires once every sample has been collected.
    pub fn get_executor_delay(&self, on_done: impl FnOnce(Vec<crate::time::LocalDuration>) + Send + 'static) {
        let count = self.handles.len();
        if count == 0 {
            on_done(Vec::new());
            return;
        }
        let samples: Arc<Mutex<Vec<crate::time::LocalDuration>>> = Arc::new(Mutex::new(Vec::with_capacity(count)));
        let on_done = Arc::new(Mutex::new(Some(on_done)));
        for handle in &self.handles {
            let posted_at = LocalTime::now();
            let samples = samples.clone();
            let on_done = on_done.clone();
            let total = count;
            handle.spawn(move |_poller| {
                let lag = LocalTime::now().duration_since(posted_at);
                let mut samples = samples.lock().unwrap();
                samples.push(lag);
                if samples.len() == total {
                    if let Some(cb) = on_done.lock().unwrap().take() {
                        cb(std::mem::take(&mut *samples));
                    }
                }
            });
        }
    }
}

/// Process-wide pool instance, started lazily on first access with default
/// configuration. Code that needs non-default tunables should construct its
/// own [`PollerPool`] instead of reaching for this.
pub static GLOBAL_POOL: once_cell::sync::Lazy<PollerPool> =
    once_cell::sync::Lazy::new(|| PollerPool::start(PoolConfig::default()).expect("failed to start poller pool"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_requested_reactor_count() {
        let pool = PollerPool::start(PoolConfig { reactor_count: Some(3) }).unwrap();
        assert_eq!(pool.reactor_count(), 3);
    }

    #[test]
    fn get_poller_picks_a_handle() {
        let pool = PollerPool::start(PoolConfig { reactor_count: Some(2) }).unwrap();
        let handle = pool.get_poller(false);
        assert!(pool.handles.iter().any(|h| h.id() == handle.id()));
    }
}
