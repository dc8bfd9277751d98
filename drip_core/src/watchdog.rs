//! Software watchdog for the monitoring loop.
//!
//! The loop feeds a [`Heartbeat`] once per completed cycle. A supervisor
//! thread checks it every quarter deadline; `max_missed` consecutive deadlines
//! without a beat fire the expiry hook, which is expected to restart the
//! device (the CLI exits the process).
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use drip_traits::Clock;
use tracing::{error, warn};

use crate::config::WatchdogCfg;

/// Feeding side, cloned into the loop.
#[derive(Debug, Clone, Default)]
pub struct Heartbeat(Arc<AtomicU64>);

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn feed(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn beats(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// A deadline passed without a beat; carries the consecutive count.
    Missed(u32),
    Expired,
}

/// Deadline bookkeeping, independent of threads and real time.
#[derive(Debug, Clone)]
pub struct WatchdogState {
    cfg: WatchdogCfg,
    seen: u64,
    window_start_ms: u64,
    missed: u32,
}

impl WatchdogState {
    pub fn new(cfg: WatchdogCfg, now_ms: u64) -> Self {
        Self {
            cfg: WatchdogCfg {
                timeout_ms: cfg.timeout_ms.max(1),
                max_missed: cfg.max_missed.max(1),
            },
            seen: 0,
            window_start_ms: now_ms,
            missed: 0,
        }
    }

    pub fn poll(&mut self, beats: u64, now_ms: u64) -> Verdict {
        if beats != self.seen {
            self.seen = beats;
            self.window_start_ms = now_ms;
            self.missed = 0;
            return Verdict::Healthy;
        }
        if now_ms.saturating_sub(self.window_start_ms) < self.cfg.timeout_ms {
            return Verdict::Healthy;
        }
        self.missed += 1;
        self.window_start_ms = now_ms;
        if self.missed >= self.cfg.max_missed {
            Verdict::Expired
        } else {
            Verdict::Missed(self.missed)
        }
    }
}

pub type ExpiryHook = Box<dyn FnOnce(u32) + Send>;

pub struct Watchdog {
    shutdown: Arc<AtomicBool>,
    expired: Arc<AtomicBool>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn<C: Clock + Send + 'static>(
        cfg: WatchdogCfg,
        clock: C,
        heartbeat: Heartbeat,
        on_expire: ExpiryHook,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let expired = Arc::new(AtomicBool::new(false));
        let (shutdown_t, expired_t) = (shutdown.clone(), expired.clone());
        let poll = Duration::from_millis((cfg.timeout_ms / 4).max(1));

        let join_handle = std::thread::spawn(move || {
            let epoch = clock.now();
            let mut state = WatchdogState::new(cfg, 0);
            let mut hook = Some(on_expire);
            while !shutdown_t.load(Ordering::Relaxed) {
                clock.sleep(poll);
                match state.poll(heartbeat.beats(), clock.ms_since(epoch)) {
                    Verdict::Healthy => {}
                    Verdict::Missed(n) => {
                        warn!(missed = n, timeout_ms = cfg.timeout_ms, "monitor cycle missed its deadline");
                    }
                    Verdict::Expired => {
                        error!(max_missed = cfg.max_missed, "watchdog expired");
                        expired_t.store(true, Ordering::Relaxed);
                        if let Some(h) = hook.take() {
                            h(cfg.max_missed);
                        }
                        break;
                    }
                }
            }
        });

        Self {
            shutdown,
            expired,
            join_handle: Some(join_handle),
        }
    }

    pub fn has_expired(&self) -> bool {
        self.expired.load(Ordering::Relaxed)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.join_handle.take() {
            if handle.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fed_watchdog_stays_healthy() {
        let mut st = WatchdogState::new(WatchdogCfg::default(), 0);
        for i in 1..100u64 {
            assert_eq!(st.poll(i, i * 1_000), Verdict::Healthy);
        }
    }

    #[test]
    fn expires_after_max_missed_deadlines() {
        let mut st = WatchdogState::new(
            WatchdogCfg {
                timeout_ms: 5_000,
                max_missed: 3,
            },
            0,
        );
        assert_eq!(st.poll(0, 4_999), Verdict::Healthy);
        assert_eq!(st.poll(0, 5_000), Verdict::Missed(1));
        assert_eq!(st.poll(0, 10_000), Verdict::Missed(2));
        assert_eq!(st.poll(0, 15_000), Verdict::Expired);
    }

    #[test]
    fn a_beat_clears_missed_count() {
        let mut st = WatchdogState::new(
            WatchdogCfg {
                timeout_ms: 100,
                max_missed: 2,
            },
            0,
        );
        assert_eq!(st.poll(0, 100), Verdict::Missed(1));
        assert_eq!(st.poll(1, 150), Verdict::Healthy);
        assert_eq!(st.poll(1, 250), Verdict::Missed(1));
    }
}
