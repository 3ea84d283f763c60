//! Builds all caches and drives their ticks.
//!
//! A [`CacheContext`] owns one instance of every cache plus the clock, lanes and wakeup they
//! share. Contexts are independent of each other, so tests can create as many as they like.
//! [`TickDriver`] runs the context's [`tick`](CacheContext::tick) on a background thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::access::{Access, Clock};
use crate::artifact::ArtifactCache;
use crate::config::Config;
use crate::content::ContentStore;
use crate::debug_info::{ConversionLauncher, DebugInfoCache, ProcessLauncher};
use crate::file_stream::FileStream;
use crate::lanes::{Lanes, Wakeup};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("failed to start {lanes} cache lanes")]
    Lanes {
        lanes: usize,
        #[source]
        source: rayon::ThreadPoolBuildError,
    },
    #[error("failed to spawn the tick driver")]
    Driver(#[source] std::io::Error),
}

/// All caches of one process, or of one test.
#[derive(Debug)]
pub struct CacheContext {
    clock: Arc<Clock>,
    lanes: Arc<Lanes>,
    wakeup: Arc<Wakeup>,
    tick_interval: Duration,
    artifacts: Arc<ArtifactCache>,
    content: Arc<ContentStore>,
    files: FileStream,
    debug_info: DebugInfoCache,
}

impl CacheContext {
    /// Creates all caches, converting debug info with the configured converter.
    pub fn new(config: &Config) -> Result<Self, ContextError> {
        let launcher = Arc::new(ProcessLauncher::new(&config.debug_info.converter));
        Self::with_launcher(config, launcher)
    }

    /// Creates all caches with a custom conversion launcher.
    pub fn with_launcher(
        config: &Config,
        launcher: Arc<dyn ConversionLauncher>,
    ) -> Result<Self, ContextError> {
        let lane_count = config.lane_count();
        let lanes = Lanes::new(lane_count).map_err(|source| ContextError::Lanes {
            lanes: lane_count,
            source,
        })?;
        let lanes = Arc::new(lanes);
        let clock = Arc::new(Clock::new());
        let wakeup = Arc::new(Wakeup::default());

        let artifacts = Arc::new(ArtifactCache::new(
            Arc::clone(&clock),
            Arc::clone(&lanes),
            Arc::clone(&wakeup),
            config.artifacts.registration_slots,
            config.artifacts.access,
        ));
        let content = Arc::new(ContentStore::new(
            Arc::clone(&clock),
            &config.content,
            lane_count,
        ));
        let files = FileStream::new(
            Arc::clone(&content),
            Arc::clone(&artifacts),
            &config.files,
            lane_count,
        );
        let debug_info = DebugInfoCache::new(
            Arc::clone(&clock),
            Arc::clone(&lanes),
            Arc::clone(&wakeup),
            &config.debug_info,
            launcher,
        );

        tracing::debug!(lanes = lane_count, "created cache context");
        Ok(Self {
            clock,
            lanes,
            wakeup,
            tick_interval: config.tick_interval,
            artifacts,
            content,
            files,
            debug_info,
        })
    }

    /// Creates a new access token.
    pub fn access(&self) -> Access {
        Access::new(Arc::clone(&self.clock))
    }

    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    pub fn lanes(&self) -> &Lanes {
        &self.lanes
    }

    pub fn artifacts(&self) -> &ArtifactCache {
        &self.artifacts
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    pub fn files(&self) -> &FileStream {
        &self.files
    }

    pub fn debug_info(&self) -> &DebugInfoCache {
        &self.debug_info
    }

    /// Runs one tick of every cache.
    ///
    /// File changes are detected first, so reads requested in this tick already see them.
    pub fn tick(&self) {
        let tick = self.clock.advance();
        let start = Instant::now();
        self.lanes.install(|| {
            timed("files", || self.files.tick());
            timed("artifacts", || self.artifacts.tick());
            timed("content", || self.content.tick());
            timed("debug_info", || self.debug_info.tick());
        });
        let elapsed = start.elapsed();
        tracing::trace!(tick, ?elapsed, "tick finished");
        metric!(timer("tick.duration") = elapsed);
    }
}

fn timed(cache: &'static str, f: impl FnOnce()) {
    let start = Instant::now();
    f();
    metric!(timer("tick.cache.duration") = start.elapsed(), "cache" => cache);
}

/// Ticks a [`CacheContext`] on a background thread until dropped.
#[derive(Debug)]
pub struct TickDriver {
    stop: Arc<AtomicBool>,
    context: Arc<CacheContext>,
    handle: Option<JoinHandle<()>>,
}

impl TickDriver {
    /// Starts ticking `context` every `tick_interval`, or sooner when a cache asks for it.
    pub fn spawn(context: Arc<CacheContext>) -> Result<Self, ContextError> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = std::thread::Builder::new()
            .name("dbgcache-tick".into())
            .spawn({
                let stop = Arc::clone(&stop);
                let context = Arc::clone(&context);
                move || {
                    tracing::debug!("tick driver started");
                    while !stop.load(Ordering::Acquire) {
                        context.tick();
                        let deadline = Instant::now() + context.tick_interval;
                        context.wakeup.wait_until(deadline);
                    }
                    tracing::debug!("tick driver stopped");
                }
            })
            .map_err(ContextError::Driver)?;
        Ok(Self {
            stop,
            context,
            handle: Some(handle),
        })
    }

    pub fn context(&self) -> &Arc<CacheContext> {
        &self.context
    }
}

impl Drop for TickDriver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.context.wakeup.request();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("tick driver panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_contexts() {
        let config = Config {
            lanes: Some(2),
            ..Default::default()
        };
        let first = CacheContext::new(&config).unwrap();
        let second = CacheContext::new(&config).unwrap();
        first.tick();
        first.tick();
        assert_eq!(first.clock().tick_index(), 2);
        assert_eq!(second.clock().tick_index(), 0);
        assert_eq!(first.lanes().count(), 2);
    }

    #[test]
    fn test_driver_ticks() {
        let config = Config {
            lanes: Some(1),
            tick_interval: Duration::from_millis(1),
            ..Default::default()
        };
        let context = Arc::new(CacheContext::new(&config).unwrap());
        let driver = TickDriver::spawn(Arc::clone(&context)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while context.clock().tick_index() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        drop(driver);
        let ticks = context.clock().tick_index();
        assert!(ticks >= 3);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(context.clock().tick_index(), ticks);
    }
}
