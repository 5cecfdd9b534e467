//! Cancelling a delay task before its deadline must prevent its closure from
//! ever running.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reactor_net::time::LocalDuration;
use reactor_net::{PoolConfig, PollerPool};

#[test]
fn cancelled_task_never_fires() {
    let pool = PollerPool::start(PoolConfig { reactor_count: Some(1) }).unwrap();
    let reactor = pool.get_poller(false);

    let fired = Arc::new(AtomicBool::new(false));
    let fired_cb = fired.clone();

    let handle = reactor.spawn_delayed(LocalDuration::from_millis(300), move |_poller| {
        fired_cb.store(true, Ordering::SeqCst);
        0
    });

    assert!(handle.is_pending());
    handle.cancel();
    assert!(!handle.is_pending());

    std::thread::sleep(Duration::from_millis(600));
    assert!(!fired.load(Ordering::SeqCst), "cancelled delay task fired anyway");
}

#[test]
fn uncancelled_task_still_fires_as_control() {
    let pool = PollerPool::start(PoolConfig { reactor_count: Some(1) }).unwrap();
    let reactor = pool.get_poller(false);

    let fired = Arc::new(AtomicBool::new(false));
    let fired_cb = fired.clone();

    let _handle = reactor.spawn_delayed(LocalDuration::from_millis(200), move |_poller| {
        fired_cb.store(true, Ordering::SeqCst);
        0
    });

    let deadline = Instant::now() + Duration::from_secs(3);
    while !fired.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(fired.load(Ordering::SeqCst), "control task never fired");
}
