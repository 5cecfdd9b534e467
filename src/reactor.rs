//! The event poller: a single-threaded reactor owning one readiness-notification
//! facility plus the task and delay queues described in [`crate::task`].
//!
//! Grounded on this codebase's `popol`-based peer-to-peer reactor: the same
//! `popol::Sources` + self-pipe waker shape, generalized from a fixed
//! `Source::{Peer,Listener,Waker}` enum keyed by peer address to an arbitrary
//! `RawFd → callback` map so any [`crate::socket::Socket`] can register itself.
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use tracing::{trace, warn};

use crate::task::{CancelHandle, DelayCancelHandle, DelayTask, DelayQueue, TaskQueue};
use crate::time::{LocalDuration, LocalTime};

/// Maximum amount of time to wait for I/O when no delay task is pending.
const WAIT_TIMEOUT: LocalDuration = LocalDuration::from_millis(60_000);

/// Readiness interests a socket may register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest { read: true, write: false };
    pub const WRITE: Interest = Interest { read: false, write: true };
    pub const ALL: Interest = Interest { read: true, write: true };
    pub const NONE: Interest = Interest { read: false, write: false };

    fn to_popol(self) -> popol::Interest {
        match (self.read, self.write) {
            (true, true) => popol::interest::ALL,
            (false, true) => popol::interest::WRITE,
            // `(false, false)` never reaches initial registration in practice;
            // READ is the harmless default if it ever does.
            _ => popol::interest::READ,
        }
    }
}

/// Readiness reported to a callback for one dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// Registration key for the underlying `popol` source set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Source {
    Fd(RawFd),
    Waker,
}

/// A socket's readiness callback. Invoked with the owning [`EventPoller`] (so
/// the callback may re-arm its own interest) and the readiness that fired.
pub type Callback = Box<dyn FnMut(&mut EventPoller, Readiness) + Send>;

/// Tunables for one reactor. See [`crate::pool::PoolConfig`] for the pool-wide
/// equivalent.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Human-readable name, used only in logs and thread naming.
    pub name: String,
    /// Thread priority hint; `None` leaves the OS default in place.
    pub priority: Option<i32>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            name: "reactor".to_string(),
            priority: None,
        }
    }
}

/// Rolling measure of sleep-vs-run time, used by the pool to pick the
/// least-loaded reactor.
#[derive(Default)]
pub struct LoadCounter {
    sleep_millis: AtomicU64,
    run_millis: AtomicU64,
}

impl LoadCounter {
    fn record_sleep(&self, d: LocalDuration) {
        self.sleep_millis
            .fetch_add(d.as_millis() as u64, Ordering::Relaxed);
    }

    fn record_run(&self, d: LocalDuration) {
        self.run_millis
            .fetch_add(d.as_millis() as u64, Ordering::Relaxed);
    }

    /// A dimensionless load figure: run time divided by total observed time.
    /// Reactors that have observed nothing yet report zero load, so a
    /// freshly-started reactor wins ties against a busy one.
    pub fn load(&self) -> f64 {
        let run = self.run_millis.load(Ordering::Relaxed) as f64;
        let sleep = self.sleep_millis.load(Ordering::Relaxed) as f64;
        if run + sleep == 0.0 {
            0.0
        } else {
            run / (run + sleep)
        }
    }
}

/// Shared, `Send + Sync` state reachable from any thread: the task queue, the
/// waker used to interrupt the blocking wait, and the load counter.
struct Shared {
    id: usize,
    name: String,
    tasks: std::sync::Mutex<TaskQueue>,
    waker: popol::Waker,
    load: LoadCounter,
}

/// A cheap, cloneable reference to a running [`EventPoller`], usable from any
/// thread to submit work.
///
/// This is the only channel through which another thread may influence a
/// reactor's state: everything it does ends up as a closure pushed onto the
/// task queue and woken via the self-pipe.
#[derive(Clone)]
pub struct EventPollerHandle {
    shared: Arc<Shared>,
}

impl EventPollerHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn load(&self) -> f64 {
        self.shared.load.load()
    }

    /// `true` if the current OS thread is this reactor's own thread.
    pub fn is_current(&self) -> bool {
        CURRENT_REACTOR.with(|cell| cell.get() == Some(self.shared.id))
    }

    /// Submit a one-shot task, to be run on the reactor thread in submission
    /// order relative to other `spawn` calls.
    ///
    /// If the caller is already on the reactor thread this still queues
    /// through the task list rather than running inline, to preserve the
    /// "callbacks run to completion, uninterrupted by re-entrant state
    /// mutation" rule; reactor-internal code that wants to run inline should
    /// call [`EventPoller`] methods directly instead of going through the
    /// handle.
    pub fn spawn(&self, task: impl FnOnce(&mut EventPoller) + Send + 'static) -> CancelHandle {
        let handle = self.shared.tasks.lock().unwrap().push_back(Box::new(task));
        let _ = self.shared.waker.wake();
        handle
    }

    /// Submit a task at the front of the queue, racing ahead of ordinary work.
    /// Used internally to schedule delay tasks.
    pub fn spawn_first(&self, task: impl FnOnce(&mut EventPoller) + Send + 'static) -> CancelHandle {
        let handle = self.shared.tasks.lock().unwrap().push_front(Box::new(task));
        let _ = self.shared.waker.wake();
        handle
    }

    /// Schedule a delayed task. The task body must return the next interval in
    /// milliseconds, or `0` to run exactly once.
    pub fn spawn_delayed(
        &self,
        delay: LocalDuration,
        task: impl FnMut(&mut EventPoller) -> u64 + Send + 'static,
    ) -> DelayCancelHandle {
        let task: DelayTask = Box::new(task);
        let (tx, rx) = std::sync::mpsc::channel();
        self.spawn_first(move |poller| {
            let handle = poller.delay.schedule(LocalTime::now(), delay, task);
            let _ = tx.send(handle);
        });
        // The delay queue only exists on the reactor thread, so the handle is
        // produced asynchronously; block the calling thread for the brief
        // moment it takes the reactor to drain one task-queue entry.
        rx.recv().expect("reactor dropped before scheduling delay task")
    }
}

thread_local! {
    static CURRENT_REACTOR: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

/// A single-threaded, non-blocking reactor: one readiness facility, one task
/// queue, one delay queue, one FD→callback map.
///
/// Exactly one thread may ever call [`EventPoller::run`] for a given instance;
/// everything else must go through an [`EventPollerHandle`].
pub struct EventPoller {
    shared: Arc<Shared>,
    sources: popol::Sources<Source>,
    callbacks: HashMap<RawFd, Callback>,
    delay: DelayQueue,
    exit: bool,
    owner_thread: Option<ThreadId>,
}

impl EventPoller {
    /// Construct a new reactor. Does not start the loop; call [`EventPoller::run`].
    pub fn new(config: ReactorConfig) -> io::Result<Self> {
        Self::with_id(0, config)
    }

    pub(crate) fn with_id(id: usize, config: ReactorConfig) -> io::Result<Self> {
        let mut sources = popol::Sources::new();
        let waker = popol::Waker::new(&mut sources, Source::Waker)?;

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                name: config.name,
                tasks: std::sync::Mutex::new(TaskQueue::new()),
                waker,
                load: LoadCounter::default(),
            }),
            sources,
            callbacks: HashMap::new(),
            delay: DelayQueue::new(),
            exit: false,
            owner_thread: None,
        })
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn load(&self) -> f64 {
        self.shared.load.load()
    }

    /// A cloneable handle other threads can use to submit work to this reactor.
    pub fn handle(&self) -> EventPollerHandle {
        EventPollerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Register interest for `fd`. Must be called on the reactor's own thread;
    /// cross-thread registration goes through `handle().spawn(...)`.
    pub fn add_event(&mut self, fd: RawFd, interest: Interest, callback: Callback) {
        self.assert_owner();
        self.sources
            .register(Source::Fd(fd), &FdRef(fd), interest.to_popol());
        self.callbacks.insert(fd, callback);
    }

    /// Rewrite the registered interest for `fd`. No-op if `fd` isn't registered.
    pub fn modify_event(&mut self, fd: RawFd, interest: Interest) {
        self.assert_owner();
        if let Some(source) = self.sources.get_mut(&Source::Fd(fd)) {
            if interest.read {
                source.set(popol::interest::READ);
            } else {
                source.unset(popol::interest::READ);
            }
            if interest.write {
                source.set(popol::interest::WRITE);
            } else {
                source.unset(popol::interest::WRITE);
            }
        }
    }

    /// Deregister `fd`. No-op if it wasn't registered.
    pub fn del_event(&mut self, fd: RawFd) {
        self.assert_owner();
        self.sources.unregister(&Source::Fd(fd));
        self.callbacks.remove(&fd);
    }

    fn assert_owner(&self) {
        if let Some(owner) = self.owner_thread {
            debug_assert_eq!(
                owner,
                std::thread::current().id(),
                "reactor state mutated from a thread other than its own"
            );
        }
    }

    /// Run the loop until a task throws the internal exit sentinel (see
    /// [`EventPoller::request_exit`]) or an unrecoverable I/O error occurs.
    pub fn run(mut self) -> io::Result<()> {
        self.owner_thread = Some(std::thread::current().id());
        CURRENT_REACTOR.with(|cell| cell.set(Some(self.shared.id)));

        let mut events = Vec::with_capacity(32);

        while !self.exit {
            self.tick(&mut events)?;
        }
        Ok(())
    }

    /// Request that the loop stop after the current iteration. Safe to call
    /// from a task running on the reactor thread.
    pub fn request_exit(&mut self) {
        self.exit = true;
    }

    /// Run exactly one readiness + task + delay cycle. Exposed so tests and
    /// the pool's delay-sampling probe can drive the loop deterministically.
    pub fn tick(&mut self, events: &mut Vec<popol::Event<Source>>) -> io::Result<()> {
        events.clear();

        let timeout = match self.delay.next_deadline() {
            Some(deadline) => {
                let now = LocalTime::now();
                if deadline <= now {
                    LocalDuration::ZERO
                } else {
                    deadline - now
                }
            }
            None => WAIT_TIMEOUT,
        };

        let sleep_start = LocalTime::now();
        let result = self.sources.wait_timeout(events, timeout.into());
        let run_start = LocalTime::now();
        self.shared.load.record_sleep(run_start - sleep_start);

        match result {
            Ok(_) => self.dispatch_events(events),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err),
        }

        self.drain_tasks();
        self.fire_delays();

        self.shared.load.record_run(LocalTime::now() - run_start);
        Ok(())
    }

    fn dispatch_events(&mut self, events: &mut Vec<popol::Event<Source>>) {
        for event in events.drain(..) {
            match event.key {
                Source::Waker => {
                    popol::Waker::reset(event.source).ok();
                }
                Source::Fd(fd) => {
                    if event.is_invalid() {
                        warn!(fd, "fd invalid on dispatch, deregistering");
                        self.del_event(fd);
                        continue;
                    }
                    let readiness = Readiness {
                        readable: event.is_readable(),
                        writable: event.is_writable(),
                        error: event.is_error(),
                        hangup: event.is_hangup(),
                    };
                    let Some(mut callback) = self.callbacks.remove(&fd) else {
                        trace!(fd, "readiness for unregistered fd, ignoring");
                        continue;
                    };
                    // Callback may re-register itself (e.g. del_event on error),
                    // so it's temporarily removed from the map during the call
                    // to avoid aliasing `self.callbacks` mutably twice.
                    callback(self, readiness);
                    if self.callbacks.contains_key(&fd) {
                        // Callback already replaced itself; leave it.
                    } else if self.sources.get(&Source::Fd(fd)).is_some() {
                        self.callbacks.insert(fd, callback);
                    }
                }
            }
        }
    }

    fn drain_tasks(&mut self) {
        let mut queue = self.shared.tasks.lock().unwrap();
        if queue.is_empty() {
            return;
        }
        let mut local = std::mem::take(&mut *queue);
        drop(queue);
        local.drain_into(self);
    }

    fn fire_delays(&mut self) {
        if self.delay.is_empty() {
            return;
        }
        let now = LocalTime::now();
        // Swapped out so `fire_expired` can take `&mut self` (the poller)
        // without aliasing `self.delay`. A nested `spawn_delayed` called from
        // a firing task only queues onto the shared task list, so it cannot
        // re-enter this method while `self.delay` is taken.
        let mut delay = std::mem::take(&mut self.delay);
        delay.fire_expired(now, self);
        self.delay = delay;
    }
}

/// Adapter so a bare `RawFd` can be registered with `popol::Sources`, which
/// wants an `AsRawFd`.
struct FdRef(RawFd);

impl std::os::unix::io::AsRawFd for FdRef {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_reactor_has_zero_load() {
        let poller = EventPoller::new(ReactorConfig::default()).unwrap();
        assert_eq!(poller.load(), 0.0);
    }

    #[test]
    fn handle_reports_current_thread() {
        let poller = EventPoller::new(ReactorConfig::default()).unwrap();
        let handle = poller.handle();
        assert!(!handle.is_current());
    }

    #[test]
    fn tick_drains_spawned_task() {
        let mut poller = EventPoller::new(ReactorConfig::default()).unwrap();
        let handle = poller.handle();
        let ran = Arc::new(std::sync::Mutex::new(false));
        let ran2 = ran.clone();
        handle.spawn(move |_| *ran2.lock().unwrap() = true);

        let mut events = Vec::new();
        poller.tick(&mut events).unwrap();

        assert!(*ran.lock().unwrap());
    }
}
