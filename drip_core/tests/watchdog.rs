use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use drip_core::config::WatchdogCfg;
use drip_core::watchdog::{Heartbeat, Watchdog};
use drip_traits::MonotonicClock;

fn short() -> WatchdogCfg {
    WatchdogCfg {
        timeout_ms: 40,
        max_missed: 2,
    }
}

#[test]
fn starved_watchdog_fires_its_hook_once() {
    let fired = Arc::new(AtomicU32::new(0));
    let seen = fired.clone();
    let wd = Watchdog::spawn(
        short(),
        MonotonicClock::new(),
        Heartbeat::new(),
        Box::new(move |n| {
            seen.fetch_add(n, Ordering::SeqCst);
        }),
    );
    let deadline = Instant::now() + Duration::from_secs(2);
    while !wd.has_expired() {
        assert!(Instant::now() < deadline, "watchdog never expired");
        std::thread::sleep(Duration::from_millis(10));
    }
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn fed_watchdog_never_fires() {
    let hb = Heartbeat::new();
    let wd = Watchdog::spawn(
        short(),
        MonotonicClock::new(),
        hb.clone(),
        Box::new(|_| panic!("fed watchdog expired")),
    );
    for _ in 0..30 {
        hb.feed();
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!wd.has_expired());
    assert!(hb.beats() >= 30);
}

#[test]
fn drop_joins_promptly() {
    let start = Instant::now();
    {
        let _wd = Watchdog::spawn(
            WatchdogCfg {
                timeout_ms: 200,
                max_missed: 3,
            },
            MonotonicClock::new(),
            Heartbeat::new(),
            Box::new(|_| {}),
        );
    }
    assert!(start.elapsed() < Duration::from_millis(500));
}
