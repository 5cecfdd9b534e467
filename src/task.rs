//! Task queue and delay queue: the only way code on another thread may touch a
//! reactor's state.
//!
//! Every closure queued here eventually runs on the reactor's own thread — async
//! tasks exactly once, delay tasks each time their deadline elapses — and may
//! therefore both read and mutate the [`crate::reactor::EventPoller`] passed to
//! them without any additional locking.
use std::sync::{Arc, Mutex};

use crate::reactor::EventPoller;
use crate::time::{LocalDuration, LocalTime};

/// A one-shot unit of work submitted to a reactor.
pub type Task = Box<dyn FnOnce(&mut EventPoller) + Send>;

/// A recurring unit of work submitted to a reactor's delay queue.
///
/// Returns the next delay in milliseconds, or `0` to run exactly once.
pub type DelayTask = Box<dyn FnMut(&mut EventPoller) -> u64 + Send>;

/// A handle returned by [`crate::reactor::EventPoller::spawn`] and
/// [`crate::reactor::EventPoller::spawn_delayed`].
///
/// Dropping the handle does *not* cancel the task — call [`CancelHandle::cancel`]
/// explicitly. A race between `cancel` and the reactor popping the same slot is
/// resolved in favor of cancellation: the reactor observes an empty slot and
/// treats it as a no-op.
#[derive(Clone)]
pub struct CancelHandle {
    slot: Arc<Mutex<Option<Task>>>,
}

impl CancelHandle {
    /// Cancel the task. Idempotent; a no-op if the task already ran or was
    /// already cancelled.
    pub fn cancel(&self) {
        *self.slot.lock().unwrap() = None;
    }

    /// `true` if the task has neither run nor been cancelled yet.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }
}

/// A handle for a recurring delay task. See [`CancelHandle`].
#[derive(Clone)]
pub struct DelayCancelHandle {
    slot: Arc<Mutex<Option<DelayTask>>>,
}

impl DelayCancelHandle {
    pub fn cancel(&self) {
        *self.slot.lock().unwrap() = None;
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }
}

/// FIFO of one-shot closures pending execution on the reactor thread.
///
/// `async_first`-style submissions are modeled by [`TaskQueue::push_front`];
/// both kinds of submission share the same underlying deque so that a delayed
/// task raced ahead via `push_front` still interleaves correctly with plain
/// `push_back` submissions.
#[derive(Default)]
pub struct TaskQueue {
    tasks: std::collections::VecDeque<Arc<Mutex<Option<Task>>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue at the back (submission order), returning a cancel handle.
    pub fn push_back(&mut self, task: Task) -> CancelHandle {
        let slot = Arc::new(Mutex::new(Some(task)));
        self.tasks.push_back(slot.clone());
        CancelHandle { slot }
    }

    /// Enqueue at the front, so it races ahead of already-queued work.
    pub fn push_front(&mut self, task: Task) -> CancelHandle {
        let slot = Arc::new(Mutex::new(Some(task)));
        self.tasks.push_front(slot.clone());
        CancelHandle { slot }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drain and run every queued task against `poller`, in FIFO order.
    ///
    /// Tasks queued *during* this drain (e.g. a task that itself calls
    /// `spawn`) are not run in this pass — they wait for the next wakeup, which
    /// bounds the time a single readiness cycle can spend in task execution.
    pub fn drain_into(&mut self, poller: &mut EventPoller) {
        let pending: Vec<_> = self.tasks.drain(..).collect();
        for slot in pending {
            let task = slot.lock().unwrap().take();
            if let Some(task) = task {
                task(poller);
            }
        }
    }
}

/// Time-ordered map of cancelable, recurring closures.
///
/// Mirrors [`TaskQueue`] but keyed by absolute deadline instead of submission
/// order; entries that return a non-zero delay are reinserted at `now + delay`.
#[derive(Default)]
pub struct DelayQueue {
    entries: Vec<(LocalTime, u64, Arc<Mutex<Option<DelayTask>>>)>,
    next_seq: u64,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Schedule `task` to first run at `now + delay`.
    pub fn schedule(&mut self, now: LocalTime, delay: LocalDuration, task: DelayTask) -> DelayCancelHandle {
        let slot = Arc::new(Mutex::new(Some(task)));
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push((now + delay, seq, slot.clone()));
        DelayCancelHandle { slot }
    }

    /// Deadline of the earliest still-pending entry, if any.
    pub fn next_deadline(&self) -> Option<LocalTime> {
        self.entries.iter().map(|(t, _, _)| *t).min()
    }

    /// Run every entry whose deadline has elapsed, reinserting recurring ones.
    ///
    /// Entries with equal deadlines fire in insertion-sequence order, matching
    /// the tie-break rule in the reactor's step 5.
    pub fn fire_expired(&mut self, now: LocalTime, poller: &mut EventPoller) {
        let (due, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.entries)
                .into_iter()
                .partition(|(deadline, _, _)| *deadline <= now);
        self.entries = pending;

        let mut due = due;
        due.sort_unstable_by_key(|(_, seq, _)| *seq);

        for (_, _, slot) in due {
            let task = slot.lock().unwrap().take();
            let Some(mut task) = task else { continue };
            let next_delay = task(poller);
            if next_delay > 0 {
                *slot.lock().unwrap() = Some(task);
                let seq = self.next_seq;
                self.next_seq += 1;
                self.entries
                    .push((now + LocalDuration::from_millis(next_delay as u128), seq, slot));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::EventPoller;

    fn fresh_poller() -> EventPoller {
        EventPoller::new(crate::reactor::ReactorConfig::default()).unwrap()
    }

    #[test]
    fn cancelled_task_never_runs() {
        let mut poller = fresh_poller();
        let mut queue = TaskQueue::new();
        let ran = Arc::new(Mutex::new(false));
        let ran2 = ran.clone();
        let handle = queue.push_back(Box::new(move |_| *ran2.lock().unwrap() = true));
        handle.cancel();
        queue.drain_into(&mut poller);
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn one_shot_delay_task_runs_once() {
        let mut poller = fresh_poller();
        let mut queue = DelayQueue::new();
        let count = Arc::new(Mutex::new(0));
        let count2 = count.clone();
        let now = LocalTime::now();
        queue.schedule(
            now,
            LocalDuration::ZERO,
            Box::new(move |_| {
                *count2.lock().unwrap() += 1;
                0
            }),
        );
        queue.fire_expired(LocalTime::now(), &mut poller);
        queue.fire_expired(LocalTime::now(), &mut poller);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn recurring_delay_task_reschedules() {
        let mut poller = fresh_poller();
        let mut queue = DelayQueue::new();
        let count = Arc::new(Mutex::new(0));
        let count2 = count.clone();
        let now = LocalTime::now();
        queue.schedule(
            now,
            LocalDuration::ZERO,
            Box::new(move |_| {
                *count2.lock().unwrap() += 1;
                5
            }),
        );
        queue.fire_expired(LocalTime::now(), &mut poller);
        assert_eq!(queue.len(), 1);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn cancel_before_fire_leaves_default_return() {
        let mut poller = fresh_poller();
        let mut queue = DelayQueue::new();
        let now = LocalTime::now();
        let handle = queue.schedule(now, LocalDuration::from_millis(200), Box::new(|_| 0));
        handle.cancel();
        assert!(!handle.is_pending());
        queue.fire_expired(now + LocalDuration::from_millis(201), &mut poller);
    }
}
