//! Background load-cell sampling.
//!
//! Spawns a thread that owns the `LoadCell`, keeps the newest reading in a
//! bounded(1) channel, and tracks the last-ok timestamp for stall checks.
//! A failed conversion is forwarded as an invalid reading so the loop sees
//! the fault on its next cycle instead of waiting out its timeout.
//!
//! Each `Sampler` spawns exactly one thread that is shut down and joined when
//! the `Sampler` is dropped.
use crossbeam_channel as xch;
use drip_traits::LoadCell;
use drip_traits::clock::Clock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::hw_error::map_boxed;
use crate::types::WeightReading;

pub struct Sampler {
    rx: xch::Receiver<WeightReading>,
    last_ok: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    epoch: Instant,
    shutdown: Arc<AtomicBool>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl Sampler {
    /// Sample at `hz`, waiting at most `timeout` per conversion.
    pub fn spawn<L: LoadCell + Send + 'static, C: Clock + Send + Sync + 'static>(
        mut cell: L,
        hz: u32,
        timeout: Duration,
        clock: C,
    ) -> Self {
        let (tx, rx) = xch::bounded(1);
        // Producer-side handle used to evict an unread reading.
        let evict = rx.clone();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let last_ok = Arc::new(AtomicU64::new(0));
        let last_ok_clone = last_ok.clone();
        let errors = Arc::new(AtomicU64::new(0));
        let errors_clone = errors.clone();
        let period = Duration::from_micros(crate::util::period_us(hz));
        let epoch = clock.now();

        let join_handle = std::thread::spawn(move || {
            loop {
                if shutdown_clone.load(Ordering::Relaxed) {
                    tracing::debug!("Sampler thread received shutdown signal");
                    break;
                }

                let now = clock.ms_since(epoch);
                let ts = clock.tick_ms(epoch);
                let reading = match cell.read_grams(timeout) {
                    Ok(g) => {
                        last_ok_clone.store(now, Ordering::Relaxed);
                        WeightReading::new(g, ts)
                    }
                    Err(e) => {
                        let n = errors_clone.fetch_add(1, Ordering::Relaxed) + 1;
                        let mapped = map_boxed(&e);
                        tracing::debug!(error = %mapped, errors = n, "load cell read failed");
                        WeightReading::invalid(ts)
                    }
                };

                // Keep only the newest reading.
                if let Err(xch::TrySendError::Full(r)) = tx.try_send(reading) {
                    let _ = evict.try_recv();
                    let _ = tx.try_send(r);
                }

                if shutdown_clone.load(Ordering::Relaxed) {
                    break;
                }
                clock.sleep(period);
            }
            tracing::trace!("Sampler thread exiting cleanly");
        });

        Self {
            rx,
            last_ok,
            errors,
            epoch,
            shutdown,
            join_handle: Some(join_handle),
        }
    }

    /// Newest reading if one is waiting.
    pub fn latest(&self) -> Option<WeightReading> {
        self.rx.try_iter().last()
    }

    /// Wait at most `timeout` for a reading.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WeightReading> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Conversions that failed since spawn.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn stalled_for(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_ok.load(Ordering::Relaxed))
    }

    /// Stall using this sampler's epoch and a real monotonic clock.
    pub fn stalled_for_now(&self) -> u64 {
        let now_ms = {
            let dur = Instant::now().saturating_duration_since(self.epoch);
            let ms = dur.as_millis();
            (ms.min(u128::from(u64::MAX))) as u64
        };
        now_ms.saturating_sub(self.last_ok.load(Ordering::Relaxed))
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        // The thread exits between reads, or after the current read returns
        // (bounded by the sensor timeout).
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => {
                    tracing::trace!("Sampler thread joined successfully");
                }
                Err(e) => {
                    tracing::warn!(?e, "Sampler thread panicked during shutdown");
                }
            }
        }
    }
}
