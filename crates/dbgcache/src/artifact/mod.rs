//! A generic cache of lazily produced artifacts.
//!
//! Any type implementing [`ArtifactProducer`] gets its own striped table inside the
//! [`ArtifactCache`], created the first time the producer is used. Lookups never run the
//! producer themselves: a miss creates an empty entry, queues a request and returns right away.
//! The next [`tick`](ArtifactCache::tick) runs all queued requests in parallel on the lanes and
//! commits their results.
//!
//! # Exclusive production
//!
//! Every entry carries a `working_count` which is nonzero while a request for its key is queued,
//! being produced, or waiting to be retried. Requests are only queued by whoever flips that count
//! from zero to one (or by whoever creates the entry in write mode), so a producer never runs
//! concurrently for the same key.
//!
//! # Generations
//!
//! Callers pass a generation number with every lookup. When it differs from the generation the
//! cached value was produced for, the value is reported as `stale` and production is requested
//! again. This is how the file cache forces re-reads once a file changed on disk.

use std::any::TypeId;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::access::{Access, AccessPolicy, Clock};
use crate::lanes::{Lanes, Wakeup};
use crate::stripe::{Signal, StripeSet, StripeTable};

mod registration;

use registration::{Entry, ErasedRegistration, PendingRequest, Registration, Request};

/// The minimum number of slots in every producer's table.
pub const MIN_SLOT_COUNT: usize = 256;

/// The outcome of a single [`ArtifactProducer::produce`] call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Produced<A> {
    /// The artifact was produced.
    Value(A),
    /// Production hit a transient condition and should be attempted again on the next tick.
    Retry,
}

/// Produces artifacts for the [`ArtifactCache`].
///
/// The first producer instance used with a given type is the one that runs for all keys of
/// that type.
pub trait ArtifactProducer: Send + Sync + 'static {
    type Key: Hash + Eq + Clone + Send + Sync + 'static;
    type Artifact: Clone + Send + Sync + 'static;

    /// Produces the artifact for `key`.
    ///
    /// This runs during a tick, on one of the lanes. It may use `rayon` to parallelize its own
    /// work, but must not block waiting for another tick.
    fn produce(&self, key: &Self::Key) -> Produced<Self::Artifact>;

    /// Called with every artifact the cache drops.
    fn destroy(&self, artifact: Self::Artifact) {
        drop(artifact);
    }

    /// The number of hash slots for this producer's table.
    fn slot_count(&self) -> usize {
        MIN_SLOT_COUNT
    }

    /// A name for logs and metrics.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Parameters of an [`ArtifactCache::lookup`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LookupParams {
    /// The generation the caller expects the artifact to be produced for.
    pub generation: u64,
    /// Do not return artifacts of another generation, unless the deadline passes.
    pub wait_for_fresh: bool,
    /// Block until the artifact is available or this instant passes.
    ///
    /// Ignored when called from a lane, as the tick producing the artifact could never run.
    pub deadline: Option<Instant>,
}

impl LookupParams {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            ..Default::default()
        }
    }

    pub fn deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn wait_for_fresh(mut self) -> Self {
        self.wait_for_fresh = true;
        self
    }
}

/// The result of an [`ArtifactCache::lookup`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lookup<V> {
    /// The cached artifact, if one has been produced yet.
    pub value: Option<V>,
    /// Whether `value` was produced for another generation than requested.
    pub stale: bool,
}

impl<V> Default for Lookup<V> {
    fn default() -> Self {
        Self {
            value: None,
            stale: false,
        }
    }
}

/// The cache-of-caches for all [`ArtifactProducer`]s.
pub struct ArtifactCache {
    clock: Arc<Clock>,
    lanes: Arc<Lanes>,
    wakeup: Arc<Wakeup>,
    policy: AccessPolicy,
    registrations: StripeSet<Arc<dyn ErasedRegistration>>,
    requests: Mutex<Vec<Box<dyn PendingRequest>>>,
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("policy", &self.policy)
            .field("pending_requests", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

impl ArtifactCache {
    pub fn new(
        clock: Arc<Clock>,
        lanes: Arc<Lanes>,
        wakeup: Arc<Wakeup>,
        registration_slots: usize,
        policy: AccessPolicy,
    ) -> Self {
        let registrations = StripeSet::new(registration_slots, lanes.count());
        Self {
            clock,
            lanes,
            wakeup,
            policy,
            registrations,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn find_registration<P: ArtifactProducer>(&self) -> Option<Arc<Registration<P>>> {
        let type_id = TypeId::of::<P>();
        let (slot, stripe) = self.registrations.locate(&type_id);
        let erased = stripe
            .read()
            .find(slot, |r| r.producer_type() == type_id)
            .cloned()?;
        erased.into_any().downcast::<Registration<P>>().ok()
    }

    fn registration<P: ArtifactProducer>(&self, producer: &Arc<P>) -> Option<Arc<Registration<P>>> {
        if let Some(registration) = self.find_registration::<P>() {
            registration.check_instance(producer);
            return Some(registration);
        }

        let type_id = TypeId::of::<P>();
        let (slot, stripe) = self.registrations.locate(&type_id);
        let erased = {
            let mut table = stripe.write();
            match table.find(slot, |r| r.producer_type() == type_id) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let registration: Arc<dyn ErasedRegistration> = Arc::new(
                        Registration::new(Arc::clone(producer), self.lanes.count()),
                    );
                    tracing::debug!(producer = producer.name(), "registered artifact producer");
                    table.insert(slot, Arc::clone(&registration));
                    registration
                }
            }
        };
        let registration = erased.into_any().downcast::<Registration<P>>().ok()?;
        registration.check_instance(producer);
        Some(registration)
    }

    /// Whether `producer` is the instance that produces all artifacts of its type.
    ///
    /// Returns `false` for instances of a type that is not registered yet.
    pub fn is_registered_instance<P: ArtifactProducer>(&self, producer: &Arc<P>) -> bool {
        self.find_registration::<P>()
            .is_some_and(|registration| Arc::ptr_eq(&registration.producer, producer))
    }

    fn enqueue<P: ArtifactProducer>(
        &self,
        registration: &Arc<Registration<P>>,
        key: &P::Key,
        generation: u64,
    ) {
        self.requests.lock().push(Box::new(Request {
            registration: Arc::clone(registration),
            key: key.clone(),
            generation,
        }));
        self.wakeup.request();
    }

    /// Looks up the artifact `producer` makes for `key`.
    ///
    /// On a miss, or when the cached artifact belongs to another generation, production is
    /// requested for the next tick. Without a deadline this never blocks.
    ///
    /// Artifacts are always produced by the first instance of `P` passed here. Later instances
    /// only select the table and are otherwise ignored, with a warning logged once.
    pub fn lookup<P: ArtifactProducer>(
        &self,
        access: &Access,
        producer: &Arc<P>,
        key: &P::Key,
        params: LookupParams,
    ) -> Lookup<P::Artifact> {
        let Some(registration) = self.registration(producer) else {
            return Lookup::default();
        };
        let (slot, stripe) = registration.table.locate(key);

        let mut lookup = None;
        let mut found = false;
        let mut need_request = false;
        {
            let table = stripe.read();
            if let Some(entry) = table.find(slot, |entry| entry.key == *key) {
                found = true;
                lookup = take_value(entry, access, stripe.signal(), &params, false);
                if entry.generation != params.generation || !entry.is_complete() {
                    need_request = entry.claim();
                }
                if lookup.is_none() {
                    entry.access.stamp(&self.clock);
                }
            }
        }

        if !found {
            let mut table = stripe.write();
            match table.find(slot, |entry| entry.key == *key) {
                Some(entry) => {
                    lookup = take_value(entry, access, stripe.signal(), &params, false);
                    if entry.generation != params.generation || !entry.is_complete() {
                        need_request = entry.claim();
                    }
                    if lookup.is_none() {
                        entry.access.stamp(&self.clock);
                    }
                }
                None => {
                    table.insert(slot, Entry::new(key.clone(), &self.clock));
                    need_request = true;
                }
            }
        }

        if need_request {
            self.enqueue(&registration, key, params.generation);
        }

        if lookup.is_none() {
            if let Some(deadline) = params.deadline {
                if self.lanes.is_lane_thread() {
                    tracing::trace!(
                        producer = producer.name(),
                        "not waiting for artifact on a lane thread"
                    );
                } else {
                    stripe.signal().wait_until(deadline, || {
                        let table = stripe.read();
                        let Some(entry) = table.find(slot, |entry| entry.key == *key) else {
                            return true;
                        };
                        lookup = take_value(entry, access, stripe.signal(), &params, false);
                        // a request for another generation may have finished, or a retrying
                        // request may have been abandoned in the meantime
                        if lookup.is_none() {
                            entry.access.stamp(&self.clock);
                            if entry.claim() {
                                self.enqueue(&registration, key, params.generation);
                            }
                        }
                        lookup.is_some()
                    });
                    if lookup.is_none() {
                        // out of time: settle for whatever generation is there
                        let table = stripe.read();
                        lookup =
                            find_value(&table, slot, key, access, stripe.signal(), &params, true);
                    }
                }
            }
        }

        lookup.unwrap_or_default()
    }

    /// Returns the artifact for `key`, or `None` while it is still being produced.
    pub fn artifact_for_key<P: ArtifactProducer>(
        &self,
        access: &Access,
        producer: &Arc<P>,
        key: &P::Key,
        generation: u64,
    ) -> Option<P::Artifact> {
        self.lookup(access, producer, key, LookupParams::new(generation))
            .value
    }

    /// The number of requests waiting for the next tick.
    pub fn pending_requests(&self) -> usize {
        self.requests.lock().len()
    }

    /// The number of entries cached for producer type `P`.
    pub fn entry_count<P: ArtifactProducer>(&self) -> usize {
        self.find_registration::<P>()
            .map_or(0, |registration| registration.table.len())
    }

    /// Evicts expired artifacts, then runs every queued request.
    pub fn tick(&self) {
        let registrations = self.registrations.filter_map_all(|r| Some(Arc::clone(r)));
        for registration in &registrations {
            let evicted = registration.evict(&self.clock, &self.policy);
            if evicted > 0 {
                tracing::trace!(producer = registration.name(), evicted, "evicted artifacts");
                metric!(counter("artifacts.evicted") += evicted as i64, "producer" => registration.name());
            }
            metric!(gauge("artifacts.entries") = registration.len() as u64, "producer" => registration.name());
        }

        let requests = std::mem::take(&mut *self.requests.lock());
        if requests.is_empty() {
            return;
        }
        let retries: Vec<_> = requests
            .into_par_iter()
            .filter_map(|request| request.run(&self.clock, &self.policy))
            .collect();
        if !retries.is_empty() {
            // retried requests still hold their entry's `working_count`
            self.requests.lock().extend(retries);
        }
    }
}

fn find_value<K: Eq, V: Clone>(
    table: &StripeTable<Entry<K, V>>,
    slot: usize,
    key: &K,
    access: &Access,
    signal: &Arc<Signal>,
    params: &LookupParams,
    allow_stale: bool,
) -> Option<Lookup<V>> {
    let entry = table.find(slot, |entry| entry.key == *key)?;
    take_value(entry, access, signal, params, allow_stale)
}

/// Reads the value out of `entry` if it satisfies `params`, touching its access point.
fn take_value<K, V: Clone>(
    entry: &Entry<K, V>,
    access: &Access,
    signal: &Arc<Signal>,
    params: &LookupParams,
    allow_stale: bool,
) -> Option<Lookup<V>> {
    if !entry.is_complete() {
        return None;
    }
    let stale = entry.generation != params.generation;
    if stale && params.wait_for_fresh && !allow_stale {
        return None;
    }
    let value = entry.value.clone()?;
    access.touch(&entry.access, Some(signal));
    Some(Lookup {
        value: Some(value),
        stale,
    })
}
