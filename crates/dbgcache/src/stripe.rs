//! Striped hash tables.
//!
//! Every cache in this crate keeps its entries in a [`StripeSet`]: a table of `slot_count` hash
//! slots which share a smaller number of stripes. A stripe owns a reader/writer lock over a
//! [`StripeTable`] (an arena with a free list plus one chain of arena indices per slot) and a
//! [`Signal`] which readers can block on while waiting for the table to change.
//!
//! Slots map to stripes with `slot % stripe_count`, so every slot is protected by exactly one
//! stripe lock while several slots may share the same one.

use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxBuildHasher;

/// Hashes a key for slot selection.
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> u64 {
    FxBuildHasher.hash_one(key)
}

/// A condition variable paired with its own mutex.
///
/// Waiters check their condition while holding the signal mutex, and notifiers always take that
/// mutex before broadcasting. As long as notifiers have released the stripe lock protecting the
/// condition before calling [`notify`](Self::notify), no wakeup can be lost.
#[derive(Debug, Default)]
pub struct Signal {
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Signal {
    /// Wakes every thread currently waiting on this signal.
    pub fn notify(&self) {
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }

    /// Blocks until `done` returns `true` or `deadline` passes.
    ///
    /// Returns the last result of `done`.
    pub fn wait_until(&self, deadline: Instant, mut done: impl FnMut() -> bool) -> bool {
        let mut guard = self.mutex.lock();
        loop {
            if done() {
                return true;
            }
            if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                return done();
            }
        }
    }
}

/// An arena of entries with a free list, chained into hash slots.
#[derive(Debug)]
pub struct StripeTable<E> {
    stripe_count: usize,
    entries: Vec<Option<E>>,
    free: Vec<usize>,
    chains: Vec<Vec<usize>>,
}

impl<E> StripeTable<E> {
    fn new(stripe_index: usize, stripe_count: usize, slot_count: usize) -> Self {
        let local_slots = (slot_count - stripe_index).div_ceil(stripe_count);
        Self {
            stripe_count,
            entries: Vec::new(),
            free: Vec::new(),
            chains: (0..local_slots).map(|_| Vec::new()).collect(),
        }
    }

    fn chain(&self, slot: usize) -> &[usize] {
        self.chains
            .get(slot / self.stripe_count)
            .map_or(&[] as &[usize], Vec::as_slice)
    }

    /// Iterates all entries chained into `slot`.
    pub fn iter_slot(&self, slot: usize) -> impl Iterator<Item = &E> {
        self.chain(slot)
            .iter()
            .filter_map(|&index| self.entries.get(index).and_then(Option::as_ref))
    }

    /// Finds the first entry in `slot` matching `pred`.
    pub fn find(&self, slot: usize, mut pred: impl FnMut(&E) -> bool) -> Option<&E> {
        self.iter_slot(slot).find(|entry| pred(entry))
    }

    /// Finds the first entry in `slot` matching `pred`, mutably.
    pub fn find_mut(&mut self, slot: usize, mut pred: impl FnMut(&E) -> bool) -> Option<&mut E> {
        let index = self
            .chain(slot)
            .iter()
            .copied()
            .find(|&index| self.entries[index].as_ref().is_some_and(&mut pred))?;
        self.entries[index].as_mut()
    }

    /// Links `entry` into `slot`, reusing a free arena cell if there is one.
    pub fn insert(&mut self, slot: usize, entry: E) {
        let index = match self.free.pop() {
            Some(index) => {
                self.entries[index] = Some(entry);
                index
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };
        if let Some(chain) = self.chains.get_mut(slot / self.stripe_count) {
            chain.push(index);
        }
    }

    /// Unlinks every entry in `slot` matching `pred` and returns them.
    pub fn remove_where(&mut self, slot: usize, mut pred: impl FnMut(&E) -> bool) -> Vec<E> {
        let Some(chain) = self.chains.get_mut(slot / self.stripe_count) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        chain.retain(|&index| {
            let matches = self.entries[index].as_ref().is_some_and(&mut pred);
            if matches {
                if let Some(entry) = self.entries[index].take() {
                    removed.push(entry);
                }
                self.free.push(index);
            }
            !matches
        });
        removed
    }

    /// Iterates every live entry in this stripe, regardless of slot.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.entries.iter().flatten()
    }

    /// The number of live entries in this stripe.
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    /// Whether this stripe holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One lock, arena and signal unit.
#[derive(Debug)]
pub struct Stripe<E> {
    table: RwLock<StripeTable<E>>,
    signal: Arc<Signal>,
}

impl<E> Stripe<E> {
    /// Acquires the stripe in read mode.
    pub fn read(&self) -> RwLockReadGuard<'_, StripeTable<E>> {
        self.table.read()
    }

    /// Acquires the stripe in write mode.
    pub fn write(&self) -> RwLockWriteGuard<'_, StripeTable<E>> {
        self.table.write()
    }

    /// The signal broadcast whenever an entry in this stripe completes.
    pub fn signal(&self) -> &Arc<Signal> {
        &self.signal
    }
}

/// A hash table of `slot_count` slots spread over `min(slot_count, workers)` stripes.
#[derive(Debug)]
pub struct StripeSet<E> {
    slot_count: usize,
    stripes: Box<[CachePadded<Stripe<E>>]>,
}

impl<E> StripeSet<E> {
    /// Creates a table with `slot_count` slots sized for `workers` concurrent threads.
    pub fn new(slot_count: usize, workers: usize) -> Self {
        let slot_count = slot_count.max(1);
        let stripe_count = slot_count.min(workers.max(1));
        let stripes = (0..stripe_count)
            .map(|index| {
                CachePadded::new(Stripe {
                    table: RwLock::new(StripeTable::new(index, stripe_count, slot_count)),
                    signal: Default::default(),
                })
            })
            .collect();
        Self {
            slot_count,
            stripes,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// The slot a key with the given hash lives in.
    pub fn slot_for_hash(&self, hash: u64) -> usize {
        (hash % self.slot_count as u64) as usize
    }

    /// The stripe protecting `slot`.
    pub fn stripe_for_slot(&self, slot: usize) -> &Stripe<E> {
        &self.stripes[slot % self.stripes.len()]
    }

    /// Returns the slot and its stripe for a key.
    pub fn locate<K: Hash + ?Sized>(&self, key: &K) -> (usize, &Stripe<E>) {
        let slot = self.slot_for_hash(hash_key(key));
        (slot, self.stripe_for_slot(slot))
    }

    /// The number of live entries across all stripes.
    ///
    /// Each stripe is locked in turn, so this is only a snapshot.
    pub fn len(&self) -> usize {
        self.stripes.iter().map(|stripe| stripe.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collects `f` over every live entry, locking one stripe at a time.
    pub fn filter_map_all<T>(&self, mut f: impl FnMut(&E) -> Option<T>) -> Vec<T> {
        let mut out = Vec::new();
        for stripe in self.stripes.iter() {
            out.extend(stripe.read().iter().filter_map(&mut f));
        }
        out
    }

    /// Removes every entry matching `pred`, visiting slots in parallel.
    ///
    /// Each slot is first scanned in read mode and only re-locked in write mode when something
    /// matched. `pred` is evaluated again under the write lock, so entries which stopped matching
    /// in between are kept.
    pub fn sweep<F>(&self, pred: F) -> Vec<E>
    where
        E: Send + Sync,
        F: Fn(&E) -> bool + Sync,
    {
        use rayon::prelude::*;

        (0..self.slot_count)
            .into_par_iter()
            .flat_map_iter(|slot| {
                let stripe = self.stripe_for_slot(slot);
                let has_work = stripe.read().iter_slot(slot).any(&pred);
                if has_work {
                    stripe.write().remove_where(slot, &pred)
                } else {
                    Vec::new()
                }
            })
            .collect()
    }
}
