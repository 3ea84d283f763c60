//! The worker pool ticks run on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

use crate::stripe::Signal;

/// A fixed pool of worker threads ("lanes") that cooperate on each tick.
///
/// The serial part of a tick runs on whichever lane [`install`](Self::install) picked; parallel
/// phases fan out with `rayon` parallel iterators and join before the next phase starts.
#[derive(Debug)]
pub struct Lanes {
    pool: ThreadPool,
}

impl Lanes {
    pub fn new(count: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(count.max(1))
            .thread_name(|index| format!("dbgcache-lane-{index}"))
            .build()?;
        Ok(Self { pool })
    }

    /// The number of lanes.
    pub fn count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `f` on the pool, so that parallel iterators inside it use the lanes.
    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(f)
    }

    /// Whether the calling thread is one of the lanes.
    ///
    /// Lanes must never block waiting for a tick to produce something, since they are the
    /// threads running it.
    pub fn is_lane_thread(&self) -> bool {
        self.pool.current_thread_index().is_some()
    }
}

/// Wakes the tick driver ahead of its next scheduled tick.
#[derive(Debug, Default)]
pub struct Wakeup {
    pending: AtomicBool,
    signal: Signal,
}

impl Wakeup {
    /// Asks for another tick as soon as possible.
    pub fn request(&self) {
        self.pending.store(true, Ordering::Release);
        self.signal.notify();
    }

    /// Waits until a tick was requested or `deadline` passes, and consumes the request.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        self.signal
            .wait_until(deadline, || self.pending.swap(false, Ordering::AcqRel))
    }
}
