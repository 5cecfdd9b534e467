//! A repeating delay task should keep firing close to its requested interval
//! even under ordinary scheduling jitter.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reactor_net::time::LocalDuration;
use reactor_net::{PoolConfig, PollerPool};

#[test]
fn repeating_delay_fires_near_requested_interval() {
    let pool = PollerPool::start(PoolConfig { reactor_count: Some(1) }).unwrap();
    let reactor = pool.get_poller(false);

    let fires = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let count = Arc::new(AtomicUsize::new(0));

    let fires_cb = fires.clone();
    let count_cb = count.clone();
    let interval = LocalDuration::from_millis(500);
    let handle = reactor.spawn_delayed(interval, move |_poller| {
        fires_cb.lock().unwrap().push(Instant::now());
        count_cb.fetch_add(1, Ordering::SeqCst);
        500
    });

    let deadline = Instant::now() + Duration::from_secs(8);
    while count.load(Ordering::SeqCst) < 10 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    handle.cancel();

    let fires = fires.lock().unwrap();
    assert!(fires.len() >= 10, "expected at least 10 fires, got {}", fires.len());

    let gaps: Vec<Duration> = fires.windows(2).map(|w| w[1] - w[0]).collect();
    let mean_ms = gaps.iter().map(|g| g.as_millis() as f64).sum::<f64>() / gaps.len() as f64;
    assert!(
        (490.0..=600.0).contains(&mean_ms),
        "mean interval {mean_ms}ms out of expected [490, 600] range"
    );
}
