//! The debug info cache.
//!
//! Debug info is opened by key, converted to an RDI container by an external process when needed,
//! and memory mapped once the container is up to date. Loading happens entirely inside
//! [`tick`](DebugInfoCache::tick):
//!
//! 1. Requests from the high and low priority batches are turned into [`ConversionTask`]s. The
//!    `working_count` of an entry makes sure only one task per key exists.
//! 2. Tasks are advanced: analyzed, launched within the thread budget, and polled. Tasks waiting
//!    for budget launch in request order, except that high priority requests go first, including
//!    ones for a task that was already waiting as a regular request.
//! 3. Finished tasks are parsed in parallel on the lanes and committed to their entries.
//! 4. Entries nobody has open anymore are freed.
//!
//! Unlike the other caches, [`rdi_for_key`](DebugInfoCache::rdi_for_key) may block its caller
//! until the debug info is loaded, since symbolication and evaluation often need it right away.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::access::{Access, AccessPoint, AccessPolicy, Clock};
use crate::config::{DebugInfoConfig, available_cpus};
use crate::lanes::{Lanes, Wakeup};
use crate::stripe::StripeSet;

mod conversion;
mod key;
pub mod rdi;

pub use conversion::{
    ConversionLauncher, ConversionProcess, ConversionRequest, ProcessLauncher, is_rdi_stale,
    rdi_path_for, thread_budget,
};
pub use key::DebugInfoKey;
pub use rdi::ParsedDebugInfo;

use conversion::{ConversionTask, TaskStatus};

const HIGH_PRIORITY: usize = 0;
const LOW_PRIORITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DebugInfoError {
    #[error("debug info {0} is not open")]
    NotOpen(DebugInfoKey),
}

#[derive(Debug)]
struct DebugInfoEntry {
    key: DebugInfoKey,
    refcount: AtomicU64,
    batch_request_flags: [AtomicBool; 2],
    working_count: AtomicU64,
    completion_count: AtomicU64,
    access: Arc<AccessPoint>,
    parsed: Option<Arc<ParsedDebugInfo>>,
}

impl DebugInfoEntry {
    fn is_complete(&self) -> bool {
        self.completion_count.load(Ordering::Acquire) != 0
    }

    fn is_evictable(&self, clock: &Clock, policy: &AccessPolicy) -> bool {
        self.refcount.load(Ordering::Acquire) == 0
            && self.working_count.load(Ordering::Acquire) == 0
            && self.access.is_expired(clock, policy)
    }
}

#[derive(Debug)]
struct PathKeyEntry {
    path: PathBuf,
    min_timestamp: SystemTime,
    key: DebugInfoKey,
}

#[derive(Debug)]
struct KeyPathEntry {
    key: DebugInfoKey,
    path: PathBuf,
    min_timestamp: SystemTime,
}

/// See the [module docs](self).
#[derive(Debug)]
pub struct DebugInfoCache {
    clock: Arc<Clock>,
    lanes: Arc<Lanes>,
    wakeup: Arc<Wakeup>,
    launcher: Arc<dyn ConversionLauncher>,
    policy: AccessPolicy,
    compress: bool,
    conversion_timeout: Option<Duration>,
    cores: usize,
    max_conversion_threads: usize,
    entries: StripeSet<DebugInfoEntry>,
    path_keys: StripeSet<PathKeyEntry>,
    key_paths: StripeSet<KeyPathEntry>,
    batches: [Mutex<Vec<DebugInfoKey>>; 2],
    tasks: Mutex<Vec<ConversionTask>>,
    load_gen: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl DebugInfoCache {
    pub fn new(
        clock: Arc<Clock>,
        lanes: Arc<Lanes>,
        wakeup: Arc<Wakeup>,
        config: &DebugInfoConfig,
        launcher: Arc<dyn ConversionLauncher>,
    ) -> Self {
        let workers = lanes.count();
        let cores = available_cpus();
        Self {
            clock,
            lanes,
            wakeup,
            launcher,
            policy: config.access,
            compress: config.compress,
            conversion_timeout: config.conversion_timeout,
            cores,
            max_conversion_threads: config.max_conversion_threads.unwrap_or(cores * 8).max(1),
            entries: StripeSet::new(config.slots, workers),
            path_keys: StripeSet::new(config.key_slots, workers),
            key_paths: StripeSet::new(config.key_slots, workers),
            batches: Default::default(),
            tasks: Mutex::new(Vec::new()),
            load_gen: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the key for the debug info at `path`, which must be at least as new as
    /// `min_timestamp`.
    pub fn key_from_path_timestamp(&self, path: &Path, min_timestamp: SystemTime) -> DebugInfoKey {
        let (slot, stripe) = self.path_keys.locate(path);
        let memoized = stripe
            .read()
            .find(slot, |entry| {
                entry.path == path && min_timestamp <= entry.min_timestamp
            })
            .map(|entry| entry.key);
        if let Some(key) = memoized {
            return key;
        }

        let key = key::derive_key(path, min_timestamp);
        {
            let mut path_keys = stripe.write();
            match path_keys.find_mut(slot, |entry| entry.path == path) {
                Some(entry) => {
                    if entry.min_timestamp <= min_timestamp {
                        entry.min_timestamp = min_timestamp;
                        entry.key = key;
                    }
                }
                None => path_keys.insert(
                    slot,
                    PathKeyEntry {
                        path: path.to_owned(),
                        min_timestamp,
                        key,
                    },
                ),
            }
        }

        let (slot, stripe) = self.key_paths.locate(&key);
        let mut key_paths = stripe.write();
        match key_paths.find_mut(slot, |entry| entry.key == key) {
            Some(entry) => {
                if entry.min_timestamp <= min_timestamp {
                    entry.path = path.to_owned();
                    entry.min_timestamp = min_timestamp;
                }
            }
            None => key_paths.insert(
                slot,
                KeyPathEntry {
                    key,
                    path: path.to_owned(),
                    min_timestamp,
                },
            ),
        }
        tracing::trace!(path = %path.display(), %key, "derived debug info key");
        key
    }

    /// The path and minimum timestamp `key` was derived from.
    pub fn path_from_key(&self, key: DebugInfoKey) -> Option<(PathBuf, SystemTime)> {
        let (slot, stripe) = self.key_paths.locate(&key);
        stripe
            .read()
            .find(slot, |entry| entry.key == key)
            .map(|entry| (entry.path.clone(), entry.min_timestamp))
    }

    /// Every key derived so far.
    pub fn loaded_keys(&self) -> Vec<DebugInfoKey> {
        self.key_paths.filter_map_all(|entry| Some(entry.key))
    }

    /// Opens `key`, requesting a low priority load when it is opened for the first time.
    pub fn open(&self, key: DebugInfoKey) {
        if key.is_zero() {
            return;
        }
        let (slot, stripe) = self.entries.locate(&key);
        if let Some(entry) = stripe.read().find(slot, |entry| entry.key == key) {
            entry.refcount.fetch_add(1, Ordering::AcqRel);
            return;
        }

        let created = {
            let mut entries = stripe.write();
            match entries.find(slot, |entry| entry.key == key) {
                Some(entry) => {
                    entry.refcount.fetch_add(1, Ordering::AcqRel);
                    false
                }
                None => {
                    entries.insert(
                        slot,
                        DebugInfoEntry {
                            key,
                            refcount: AtomicU64::new(1),
                            batch_request_flags: [AtomicBool::new(false), AtomicBool::new(true)],
                            working_count: AtomicU64::new(0),
                            completion_count: AtomicU64::new(0),
                            access: Arc::new(AccessPoint::new(&self.clock)),
                            parsed: None,
                        },
                    );
                    true
                }
            }
        };
        if created {
            self.enqueue(LOW_PRIORITY, key);
        }
    }

    /// Closes one reference on `key`.
    ///
    /// This never blocks. The entry is freed by a later tick once nothing references it.
    pub fn close(&self, key: DebugInfoKey) -> Result<(), DebugInfoError> {
        let (slot, stripe) = self.entries.locate(&key);
        let entries = stripe.read();
        let entry = entries
            .find(slot, |entry| entry.key == key)
            .ok_or(DebugInfoError::NotOpen(key))?;
        entry
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
            .map_err(|_| DebugInfoError::NotOpen(key))?;
        Ok(())
    }

    /// Returns the loaded debug info for an open `key`.
    ///
    /// With `high_priority`, the load is moved ahead of regular requests. With a deadline, waits
    /// until the load completes or the deadline passes, unless called from a lane.
    pub fn rdi_for_key(
        &self,
        access: &Access,
        key: DebugInfoKey,
        high_priority: bool,
        deadline: Option<Instant>,
    ) -> Option<Arc<ParsedDebugInfo>> {
        let (slot, stripe) = self.entries.locate(&key);
        let request = {
            let entries = stripe.read();
            let entry = entries.find(slot, |entry| entry.key == key)?;
            access.touch(&entry.access, Some(stripe.signal()));
            if entry.is_complete() {
                return entry.parsed.clone();
            }
            high_priority
                && entry.batch_request_flags[HIGH_PRIORITY]
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
        };
        if request {
            self.enqueue(HIGH_PRIORITY, key);
        }

        let deadline = deadline?;
        if self.lanes.is_lane_thread() {
            return None;
        }
        let mut parsed = None;
        stripe.signal().wait_until(deadline, || {
            let entries = stripe.read();
            match entries.find(slot, |entry| entry.key == key) {
                Some(entry) if entry.is_complete() => {
                    parsed = entry.parsed.clone();
                    true
                }
                Some(_) => false,
                None => true,
            }
        });
        parsed
    }

    /// Bumped every time a load completes, successfully or not.
    pub fn load_gen(&self) -> u64 {
        self.load_gen.load(Ordering::Acquire)
    }

    /// The number of parsed debug infos still alive, including ones held by consumers after
    /// their entry was freed.
    pub fn mapped_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// The number of cached entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// The number of loads still converting or waiting for thread budget.
    pub fn pending_conversions(&self) -> usize {
        self.tasks.lock().len()
    }

    fn enqueue(&self, priority: usize, key: DebugInfoKey) {
        self.batches[priority].lock().push(key);
        self.wakeup.request();
    }

    /// Claims the load of `key`. Only one caller wins until the load is committed.
    fn claim(&self, key: DebugInfoKey) -> bool {
        let (slot, stripe) = self.entries.locate(&key);
        stripe
            .read()
            .find(slot, |entry| entry.key == key)
            .is_some_and(|entry| {
                !entry.is_complete()
                    && entry
                        .working_count
                        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
            })
    }

    /// Starts, polls and finishes conversions, loads finished ones and frees closed entries.
    pub fn tick(&self) {
        let mut requested = Vec::new();
        for (priority, batch) in self.batches.iter().enumerate() {
            let high_priority = priority == HIGH_PRIORITY;
            requested.extend(batch.lock().drain(..).map(|key| (key, high_priority)));
        }

        let mut orphans = Vec::new();
        let finished = {
            let mut tasks = self.tasks.lock();
            for (key, high_priority) in requested {
                if !self.claim(key) {
                    // a task waiting for thread budget jumps ahead once asked for urgently
                    if high_priority {
                        if let Some(task) = tasks.iter_mut().find(|task| task.key == key) {
                            task.high_priority = true;
                        }
                    }
                    continue;
                }
                match self.path_from_key(key) {
                    Some((path, min_timestamp)) => {
                        tasks.push(ConversionTask::new(key, path, min_timestamp, high_priority));
                    }
                    None => {
                        tracing::warn!(%key, "requested debug info without a known path");
                        orphans.push(key);
                    }
                }
            }

            let mut in_flight: usize = tasks
                .iter()
                .map(|task| match task.status {
                    TaskStatus::Active { threads, .. } => threads,
                    _ => 0,
                })
                .sum();
            // finished conversions release their threads before waiting tasks are considered
            let mut budget_freed = false;
            for task in tasks.iter_mut().filter(|task| task.is_active()) {
                budget_freed |= self.advance(task, &mut in_flight);
            }
            // high priority tasks get the thread budget first, otherwise tasks launch in order
            tasks.sort_by_key(|task| !task.high_priority);
            for task in tasks
                .iter_mut()
                .filter(|task| matches!(task.status, TaskStatus::Null))
            {
                self.advance(task, &mut in_flight);
            }

            let (finished, pending): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *tasks).into_iter().partition(ConversionTask::is_finished);
            let waiting = pending
                .iter()
                .any(|task| matches!(task.status, TaskStatus::Null));
            *tasks = pending;
            if budget_freed && waiting {
                // launch the waiting tasks without sitting out a full interval
                self.wakeup.request();
            }
            finished
        };

        for key in orphans {
            self.commit(key, None);
        }
        finished.into_par_iter().for_each(|task| {
            let parsed = self.load(&task);
            self.commit(task.key, parsed);
        });

        let freed = self
            .entries
            .sweep(|entry| entry.is_evictable(&self.clock, &self.policy));
        if !freed.is_empty() {
            tracing::debug!(entries = freed.len(), "freed debug info");
            metric!(counter("debug_info.freed") += freed.len() as i64);
        }
        metric!(gauge("debug_info.entries") = self.entries.len() as u64);
        metric!(gauge("debug_info.mapped") = self.mapped_count() as u64);
    }

    /// Moves `task` along its state machine. Returns whether it released conversion threads.
    fn advance(&self, task: &mut ConversionTask, in_flight: &mut usize) -> bool {
        let mut freed = false;
        let next = match &mut task.status {
            TaskStatus::Null => {
                if !is_rdi_stale(&task.rdi_path, task.min_timestamp) {
                    Some(TaskStatus::Done)
                } else if task.rdi_path == task.source {
                    tracing::error!(
                        path = %task.source.display(),
                        "debug info is an outdated or unreadable RDI file",
                    );
                    metric!(counter("debug_info.conversions.failed") += 1, "reason" => "stale_rdi");
                    Some(TaskStatus::Failed)
                } else {
                    self.launch(task, in_flight)
                }
            }
            TaskStatus::Active {
                process,
                started,
                threads,
            } => {
                let threads = *threads;
                let elapsed = started.elapsed();
                let status = match process.try_wait() {
                    Ok(Some(true)) if is_rdi_stale(&task.rdi_path, task.min_timestamp) => {
                        tracing::error!(
                            path = %task.source.display(),
                            rdi = %task.rdi_path.display(),
                            "conversion did not produce a valid RDI file",
                        );
                        metric!(counter("debug_info.conversions.failed") += 1, "reason" => "no_output");
                        Some(TaskStatus::Failed)
                    }
                    Ok(Some(true)) => {
                        tracing::debug!(path = %task.source.display(), ?elapsed, "conversion finished");
                        metric!(timer("debug_info.conversions.duration") = elapsed);
                        Some(TaskStatus::Done)
                    }
                    Ok(Some(false)) => {
                        tracing::error!(path = %task.source.display(), "conversion failed");
                        metric!(counter("debug_info.conversions.failed") += 1, "reason" => "exit_status");
                        Some(TaskStatus::Failed)
                    }
                    Ok(None) => match self.conversion_timeout {
                        Some(timeout) if elapsed >= timeout => {
                            if let Err(error) = process.kill() {
                                tracing::warn!(error = &error as &dyn std::error::Error, "failed to kill conversion");
                            }
                            tracing::error!(
                                path = %task.source.display(),
                                ?timeout,
                                "conversion timed out",
                            );
                            metric!(counter("debug_info.conversions.timed_out") += 1);
                            Some(TaskStatus::Failed)
                        }
                        _ => None,
                    },
                    Err(error) => {
                        let _ = process.kill();
                        tracing::error!(
                            path = %task.source.display(),
                            error = &error as &dyn std::error::Error,
                            "failed to poll conversion",
                        );
                        metric!(counter("debug_info.conversions.failed") += 1, "reason" => "poll");
                        Some(TaskStatus::Failed)
                    }
                };
                if status.is_some() {
                    *in_flight = in_flight.saturating_sub(threads);
                    freed = true;
                }
                status
            }
            TaskStatus::Done | TaskStatus::Failed => None,
        };
        if let Some(next) = next {
            task.status = next;
        }
        freed
    }

    /// Launches the conversion of a stale task, if the thread budget allows.
    fn launch(&self, task: &ConversionTask, in_flight: &mut usize) -> Option<TaskStatus> {
        let size = match std::fs::metadata(&task.source) {
            Ok(metadata) => metadata.len(),
            Err(error) => {
                tracing::error!(
                    path = %task.source.display(),
                    error = &error as &dyn std::error::Error,
                    "cannot read debug info",
                );
                metric!(counter("debug_info.conversions.failed") += 1, "reason" => "missing_source");
                return Some(TaskStatus::Failed);
            }
        };

        let threads = thread_budget(size, self.cores);
        if *in_flight > 0 && *in_flight + threads > self.max_conversion_threads {
            return None;
        }

        let request = ConversionRequest {
            source: task.source.clone(),
            output: task.rdi_path.clone(),
            thread_count: threads,
            compress: self.compress,
        };
        match self.launcher.launch(&request) {
            Ok(process) => {
                tracing::debug!(path = %task.source.display(), threads, "launched conversion");
                metric!(counter("debug_info.conversions.launched") += 1);
                *in_flight += threads;
                Some(TaskStatus::Active {
                    process,
                    started: Instant::now(),
                    threads,
                })
            }
            Err(error) => {
                tracing::error!(
                    path = %task.source.display(),
                    error = &error as &dyn std::error::Error,
                    "failed to launch conversion",
                );
                metric!(counter("debug_info.conversions.failed") += 1, "reason" => "launch");
                Some(TaskStatus::Failed)
            }
        }
    }

    fn load(&self, task: &ConversionTask) -> Option<Arc<ParsedDebugInfo>> {
        if !matches!(task.status, TaskStatus::Done) {
            return None;
        }
        match ParsedDebugInfo::open(&task.rdi_path) {
            Ok(parsed) => {
                metric!(counter("debug_info.parsed") += 1);
                metric!(time_raw("debug_info.payload_size") = parsed.payload().len() as u64);
                Some(Arc::new(parsed.tracked(&self.live)))
            }
            Err(error) => {
                tracing::error!(
                    path = %task.rdi_path.display(),
                    error = &error as &dyn std::error::Error,
                    "failed to load debug info",
                );
                metric!(counter("debug_info.conversions.failed") += 1, "reason" => "parse");
                None
            }
        }
    }

    fn commit(&self, key: DebugInfoKey, parsed: Option<Arc<ParsedDebugInfo>>) {
        let (slot, stripe) = self.entries.locate(&key);
        let replaced = {
            let mut entries = stripe.write();
            entries
                .find_mut(slot, |entry| entry.key == key)
                .and_then(|entry| {
                    let replaced = std::mem::replace(&mut entry.parsed, parsed);
                    entry.completion_count.fetch_add(1, Ordering::AcqRel);
                    entry.working_count.fetch_sub(1, Ordering::AcqRel);
                    replaced
                })
        };
        stripe.signal().notify();
        self.load_gen.fetch_add(1, Ordering::AcqRel);
        drop(replaced);
    }
}
