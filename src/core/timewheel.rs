//! Bucketed timer wheel for lease expiry
//!
//! One periodic driver advances a cursor over `bucket_count` buckets, each one
//! `interval` wide. Leases land in the bucket their timeout maps to; when a
//! bucket comes up, expired leases fire and the rest are restashed by their
//! remaining time. Cancellation is lazy: the id goes into a set and the record
//! is dropped when its bucket is next visited.

use crate::config::WheelConfig;
use crate::error::{Result, VaultError};
use crossbeam::channel::{self, select, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Identifies a scheduled lease
pub type LeaseId = u64;

/// Timeouts longer than this are treated as this long
pub const MAX_TIMEOUT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + timeout`, clamped to [`MAX_TIMEOUT`] instead of overflowing
pub(crate) fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    let timeout = timeout.min(MAX_TIMEOUT);
    now.checked_add(timeout)
        .or_else(|| now.checked_add(Duration::from_secs(u32::MAX as u64)))
        .unwrap_or(now)
}

type LeaseCallback = Box<dyn FnOnce() + Send>;
type IdleHook = Arc<dyn Fn() + Send + Sync>;

struct LeaseRecord {
    id: LeaseId,
    expiration: Instant,
    callback: LeaseCallback,
}

struct WheelState {
    buckets: Vec<Vec<LeaseRecord>>,
    cursor: usize,
    next_id: LeaseId,
    /// Cancelled ids whose records are still sitting in a bucket
    cancelled: HashSet<LeaseId>,
    /// Ids scheduled and neither fired nor cancelled
    live: HashSet<LeaseId>,
    empty_ticks: u32,
    idle_fired: bool,
}

struct Driver {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct TimeWheel {
    interval: Duration,
    bucket_count: usize,
    idle_threshold: u32,
    state: Mutex<WheelState>,
    idle_hooks: Mutex<Vec<IdleHook>>,
    driver: Mutex<Option<Driver>>,
}

impl TimeWheel {
    pub fn new(interval: Duration, bucket_count: usize, idle_threshold: u32) -> Result<Self> {
        if interval.is_zero() {
            return Err(VaultError::Config(
                "wheel.interval_ms must be at least 1".to_string(),
            ));
        }
        if bucket_count == 0 {
            return Err(VaultError::Config(
                "wheel.bucket_count must be at least 1".to_string(),
            ));
        }
        if idle_threshold == 0 {
            return Err(VaultError::Config(
                "wheel.idle_threshold must be at least 1".to_string(),
            ));
        }

        Ok(TimeWheel {
            interval,
            bucket_count,
            idle_threshold,
            state: Mutex::new(WheelState {
                buckets: (0..bucket_count).map(|_| Vec::new()).collect(),
                cursor: 0,
                next_id: 1,
                cancelled: HashSet::new(),
                live: HashSet::new(),
                empty_ticks: 0,
                idle_fired: false,
            }),
            idle_hooks: Mutex::new(Vec::new()),
            driver: Mutex::new(None),
        })
    }

    pub fn from_config(config: &WheelConfig) -> Result<Self> {
        TimeWheel::new(
            Duration::from_millis(config.interval_ms),
            config.bucket_count,
            config.idle_threshold,
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Number of ticks ahead a lease with `remaining` time lands
    fn slots_for(&self, remaining: Duration) -> usize {
        let interval = self.interval.as_nanos();
        let slots = (remaining.as_nanos() + interval - 1) / interval;
        slots.max(1).min(usize::MAX as u128) as usize
    }

    /// Schedule `callback` to run once `timeout` has elapsed
    pub fn add<F>(&self, timeout: Duration, callback: F) -> LeaseId
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_at(Instant::now(), timeout, callback)
    }

    /// Schedule relative to an explicit `now`
    pub fn add_at<F>(&self, now: Instant, timeout: Duration, callback: F) -> LeaseId
    where
        F: FnOnce() + Send + 'static,
    {
        let timeout = timeout.min(MAX_TIMEOUT);
        let slots = self.slots_for(timeout);
        let mut state = self.state.lock();

        let id = state.next_id;
        state.next_id += 1;
        let bucket = (state.cursor + slots % self.bucket_count) % self.bucket_count;
        state.buckets[bucket].push(LeaseRecord {
            id,
            expiration: deadline_after(now, timeout),
            callback: Box::new(callback),
        });
        state.live.insert(id);

        trace!("Lease {} scheduled in bucket {} ({:?})", id, bucket, timeout);
        id
    }

    /// Cancel a pending lease; returns false if it already fired or was cancelled
    pub fn cancel(&self, id: LeaseId) -> bool {
        let mut state = self.state.lock();
        if state.live.remove(&id) {
            state.cancelled.insert(id);
            trace!("Lease {} cancelled", id);
            true
        } else {
            false
        }
    }

    /// Leases scheduled and not yet fired or cancelled
    pub fn outstanding(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Register a hook for when the wheel has been empty `idle_threshold` ticks
    pub fn on_idle<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.idle_hooks.lock().push(Arc::new(hook));
    }

    /// Advance one bucket; returns the number of callbacks fired
    pub fn tick(&self) -> usize {
        self.tick_at(Instant::now())
    }

    /// Advance one bucket as if the current time were `now`
    pub fn tick_at(&self, now: Instant) -> usize {
        let (due, went_idle) = {
            let mut state = self.state.lock();
            state.cursor = (state.cursor + 1) % self.bucket_count;
            let cursor = state.cursor;
            let bucket = std::mem::take(&mut state.buckets[cursor]);

            let mut due = Vec::new();
            for record in bucket {
                if state.cancelled.remove(&record.id) {
                    continue;
                }
                if record.expiration <= now {
                    state.live.remove(&record.id);
                    due.push(record);
                } else {
                    let slots = self.slots_for(record.expiration - now);
                    let target = (cursor + slots % self.bucket_count) % self.bucket_count;
                    state.buckets[target].push(record);
                }
            }

            if state.live.is_empty() {
                state.empty_ticks = state.empty_ticks.saturating_add(1);
            } else {
                state.empty_ticks = 0;
                state.idle_fired = false;
            }
            let went_idle = !state.idle_fired && state.empty_ticks >= self.idle_threshold;
            if went_idle {
                state.idle_fired = true;
            }
            (due, went_idle)
        };

        let fired = due.len();
        for record in due {
            let id = record.id;
            if panic::catch_unwind(AssertUnwindSafe(record.callback)).is_err() {
                error!("Lease {} callback panicked", id);
            }
        }

        if went_idle {
            debug!("Time wheel idle after {} empty ticks", self.idle_threshold);
            let hooks: Vec<IdleHook> = self.idle_hooks.lock().clone();
            for hook in hooks {
                if panic::catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                    error!("Time wheel idle hook panicked");
                }
            }
        }

        fired
    }

    /// Start the background driver ticking every `interval`
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let ticker = channel::tick(self.interval);
        let wheel = Arc::downgrade(self);

        let handle = thread::Builder::new()
            .name("blockvault-timewheel".to_string())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => match wheel.upgrade() {
                        Some(wheel) => {
                            wheel.tick();
                        }
                        None => break,
                    },
                    recv(stop_rx) -> _ => break,
                }
            })?;

        debug!("Time wheel driver started ({:?} interval)", self.interval);
        *driver = Some(Driver {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the background driver, if running
    pub fn stop(&self) {
        let driver = self.driver.lock().take();
        if let Some(Driver { stop, handle }) = driver {
            drop(stop);
            // The last strong reference may be released on the driver thread itself
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
            debug!("Time wheel driver stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.driver.lock().is_some()
    }
}

impl Drop for TimeWheel {
    fn drop(&mut self) {
        self.stop();
    }
}
