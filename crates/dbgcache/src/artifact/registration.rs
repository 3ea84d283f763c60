use std::any::{Any, TypeId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::access::{AccessPoint, AccessPolicy, Clock};
use crate::stripe::StripeSet;

use super::{ArtifactProducer, MIN_SLOT_COUNT, Produced};

pub(super) struct Entry<K, V> {
    pub key: K,
    pub value: Option<V>,
    pub generation: u64,
    /// Nonzero while a request for this key is queued or being produced.
    pub working_count: AtomicU64,
    pub completion_count: AtomicU64,
    pub access: Arc<AccessPoint>,
}

impl<K, V> Entry<K, V> {
    /// A new entry with its first request already claimed.
    pub fn new(key: K, clock: &Clock) -> Self {
        Self {
            key,
            value: None,
            generation: 0,
            working_count: AtomicU64::new(1),
            completion_count: AtomicU64::new(0),
            access: Arc::new(AccessPoint::new(clock)),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completion_count.load(Ordering::Acquire) != 0
    }

    /// Claims the right to enqueue a request, if nobody else holds it.
    pub fn claim(&self) -> bool {
        self.working_count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_evictable(&self, clock: &Clock, policy: &AccessPolicy) -> bool {
        self.working_count.load(Ordering::Acquire) == 0 && self.access.is_expired(clock, policy)
    }
}

/// The cache of one producer type.
pub(super) struct Registration<P: ArtifactProducer> {
    pub producer: Arc<P>,
    pub table: StripeSet<Entry<P::Key, P::Artifact>>,
    /// Set once another instance of `P` was seen.
    other_instance: AtomicBool,
}

impl<P: ArtifactProducer> Registration<P> {
    pub fn new(producer: Arc<P>, workers: usize) -> Self {
        let slot_count = producer.slot_count().max(MIN_SLOT_COUNT);
        Self {
            producer,
            table: StripeSet::new(slot_count, workers),
            other_instance: AtomicBool::new(false),
        }
    }

    /// Warns the first time `producer` is not the registered instance.
    pub fn check_instance(&self, producer: &Arc<P>) {
        if !Arc::ptr_eq(&self.producer, producer)
            && !self.other_instance.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                producer = self.producer.name(),
                "ignoring another instance of a registered artifact producer"
            );
        }
    }

    /// Stores a produced value and wakes everyone waiting on its stripe.
    pub fn commit(&self, key: &P::Key, generation: u64, value: P::Artifact) {
        let (slot, stripe) = self.table.locate(key);
        let replaced = {
            let mut table = stripe.write();
            match table.find_mut(slot, |entry| entry.key == *key) {
                Some(entry) => {
                    entry.generation = generation;
                    let replaced = entry.value.replace(value);
                    entry.working_count.fetch_sub(1, Ordering::AcqRel);
                    entry.completion_count.fetch_add(1, Ordering::AcqRel);
                    replaced
                }
                // entries with work in flight are never evicted, so this is unreachable in
                // practice
                None => Some(value),
            }
        };
        stripe.signal().notify();
        if let Some(replaced) = replaced {
            self.producer.destroy(replaced);
        }
    }

    /// Gives up retrying `key` once nobody asked for it within `policy`.
    ///
    /// Releases the entry's `working_count`, so the next sweep may evict it. Returns whether the
    /// request should be dropped.
    pub fn abandon_if_expired(&self, key: &P::Key, clock: &Clock, policy: &AccessPolicy) -> bool {
        let (slot, stripe) = self.table.locate(key);
        let abandoned = {
            let table = stripe.read();
            match table.find(slot, |entry| entry.key == *key) {
                Some(entry) if entry.access.is_expired(clock, policy) => {
                    entry.working_count.fetch_sub(1, Ordering::AcqRel);
                    true
                }
                Some(_) => false,
                None => return true,
            }
        };
        if abandoned {
            // waiters re-claim the entry
            stripe.signal().notify();
        }
        abandoned
    }
}

/// Type-erased view on a [`Registration`], used by the tick.
pub(super) trait ErasedRegistration: Send + Sync {
    fn producer_type(&self) -> TypeId;

    fn name(&self) -> &'static str;

    /// Evicts expired entries and returns how many were removed.
    fn evict(&self, clock: &Clock, policy: &AccessPolicy) -> usize;

    fn len(&self) -> usize;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<P: ArtifactProducer> ErasedRegistration for Registration<P> {
    fn producer_type(&self) -> TypeId {
        TypeId::of::<P>()
    }

    fn name(&self) -> &'static str {
        self.producer.name()
    }

    fn evict(&self, clock: &Clock, policy: &AccessPolicy) -> usize {
        let evicted = self
            .table
            .sweep(|entry| entry.is_evictable(clock, policy));
        let count = evicted.len();
        for entry in evicted {
            if let Some(value) = entry.value {
                self.producer.destroy(value);
            }
        }
        count
    }

    fn len(&self) -> usize {
        self.table.len()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A queued production request.
pub(super) trait PendingRequest: Send {
    /// Runs the producer. Returns the request back if it has to be retried.
    ///
    /// Retries of keys nobody asked for within `policy` are dropped instead.
    fn run(self: Box<Self>, clock: &Clock, policy: &AccessPolicy)
    -> Option<Box<dyn PendingRequest>>;
}

pub(super) struct Request<P: ArtifactProducer> {
    pub registration: Arc<Registration<P>>,
    pub key: P::Key,
    pub generation: u64,
}

impl<P: ArtifactProducer> PendingRequest for Request<P> {
    fn run(
        self: Box<Self>,
        clock: &Clock,
        policy: &AccessPolicy,
    ) -> Option<Box<dyn PendingRequest>> {
        let name = self.registration.producer.name();
        match self.registration.producer.produce(&self.key) {
            Produced::Value(value) => {
                metric!(counter("artifacts.produced") += 1, "producer" => name);
                self.registration
                    .commit(&self.key, self.generation, value);
                None
            }
            Produced::Retry if self.registration.abandon_if_expired(&self.key, clock, policy) => {
                tracing::trace!(producer = name, "abandoned artifact nobody asks for");
                metric!(counter("artifacts.abandoned") += 1, "producer" => name);
                None
            }
            Produced::Retry => {
                metric!(counter("artifacts.retried") += 1, "producer" => name);
                Some(self)
            }
        }
    }
}
