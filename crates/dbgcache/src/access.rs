//! Access-based lifetime tracking.
//!
//! Every cache entry embeds an [`AccessPoint`]. Consumers never hold entries directly; they hold
//! an [`Access`] token and touch the access point of every entry they read through it. While the
//! token is alive the entry's reference count stays above zero and eviction leaves it alone. Once
//! the token is closed, the entry becomes evictable after it has been idle for the configured
//! [`AccessPolicy`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;

use crate::stripe::Signal;

/// The time source shared by all caches of one context.
///
/// Besides wall time, the clock counts ticks, so that expiry can require a number of ticks to have
/// run in addition to a minimum idle time.
#[derive(Debug)]
pub struct Clock {
    start: Instant,
    tick: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            tick: AtomicU64::new(0),
        }
    }

    /// Microseconds since the clock was created.
    pub fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// The index of the current tick.
    pub fn tick_index(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// Starts a new tick and returns its index.
    pub fn advance(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// How long an unreferenced entry has to stay untouched before it may be evicted.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct AccessPolicy {
    /// Minimum time since the last touch or release.
    #[serde(with = "humantime_serde")]
    pub min_idle: Duration,
    /// Minimum number of ticks since the last touch or release.
    pub min_ticks: u64,
}

impl AccessPolicy {
    /// Evict as soon as the reference count drops to zero.
    pub const IMMEDIATE: Self = Self {
        min_idle: Duration::ZERO,
        min_ticks: 0,
    };

    pub const fn new(min_idle: Duration, min_ticks: u64) -> Self {
        Self {
            min_idle,
            min_ticks,
        }
    }
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 10)
    }
}

/// Reference count and last-touch stamps embedded in a cache entry.
#[derive(Debug)]
pub struct AccessPoint {
    refcount: AtomicU64,
    last_touch_us: AtomicU64,
    last_touch_tick: AtomicU64,
}

impl AccessPoint {
    /// Creates an unreferenced access point stamped with the current time.
    pub fn new(clock: &Clock) -> Self {
        Self {
            refcount: AtomicU64::new(0),
            last_touch_us: AtomicU64::new(clock.now_us()),
            last_touch_tick: AtomicU64::new(clock.tick_index()),
        }
    }

    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Records a use of the entry without taking a reference, restarting its idle countdown.
    pub(crate) fn stamp(&self, clock: &Clock) {
        self.last_touch_us.store(clock.now_us(), Ordering::Release);
        self.last_touch_tick
            .store(clock.tick_index(), Ordering::Release);
    }

    fn acquire(&self, clock: &Clock) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
        self.stamp(clock);
    }

    fn release(&self, clock: &Clock) {
        self.stamp(clock);
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether the entry owning this access point may be evicted.
    pub fn is_expired(&self, clock: &Clock, policy: &AccessPolicy) -> bool {
        if self.refcount() != 0 {
            return false;
        }
        let idle_us = policy.min_idle.as_micros() as u64;
        let last_us = self.last_touch_us.load(Ordering::Acquire);
        let last_tick = self.last_touch_tick.load(Ordering::Acquire);
        clock.now_us() >= last_us.saturating_add(idle_us)
            && clock.tick_index() >= last_tick.saturating_add(policy.min_ticks)
    }
}

#[derive(Debug)]
struct Touch {
    point: Arc<AccessPoint>,
    signal: Option<Arc<Signal>>,
}

/// A consumer's handle on everything it has read from the caches.
///
/// Dropping the token (or calling [`close`](Self::close)) releases every access point touched
/// through it, after which the touched entries start counting down towards expiry.
#[derive(Debug)]
pub struct Access {
    clock: Arc<Clock>,
    touches: Mutex<Vec<Touch>>,
}

impl Access {
    pub fn new(clock: Arc<Clock>) -> Self {
        Self {
            clock,
            touches: Mutex::new(Vec::new()),
        }
    }

    /// Takes a reference on `point` for the lifetime of this token.
    ///
    /// Callers must hold the stripe lock of the entry owning `point` so the entry cannot be
    /// evicted between lookup and touch. `signal` is notified when the reference is released.
    pub fn touch(&self, point: &Arc<AccessPoint>, signal: Option<&Arc<Signal>>) {
        point.acquire(&self.clock);
        self.touches.lock().push(Touch {
            point: Arc::clone(point),
            signal: signal.cloned(),
        });
    }

    /// The number of access points touched so far.
    pub fn touch_count(&self) -> usize {
        self.touches.lock().len()
    }

    /// Releases all references held by this token.
    pub fn close(self) {
        drop(self)
    }

    fn release_all(&self) {
        let touches = std::mem::take(&mut *self.touches.lock());
        for touch in touches {
            touch.point.release(&self.clock);
            if let Some(signal) = touch.signal {
                signal.notify();
            }
        }
    }
}

impl Drop for Access {
    fn drop(&mut self) {
        self.release_all();
    }
}
