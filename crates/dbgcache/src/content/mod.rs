//! The content-addressed hash store.
//!
//! Blobs of bytes are stored once per content hash. Logical identities address them through three
//! levels:
//!
//! - a [`Root`] is a coarse allocation scope, released as a whole;
//! - a [`ContentKey`] (`root` plus [`Id`]) is a stable identity within a root;
//! - each key keeps a history of the last [`HISTORY_SIZE`] hashes submitted for it.
//!
//! Only the newest [`STRONG_REF_COUNT`] hashes of a key hold a reference on their blob. Older
//! history entries remain readable via [`ContentStore::hash_from_key`], but their blobs may be
//! evicted once nothing else references them.
//!
//! Blobs have three kinds of references: strong key references, manual downstream references,
//! and the access points touched through [`Access`] tokens. A blob is evicted by the tick once
//! all three have dropped and its access point has expired.
//!
//! Locks are always taken in the order key, then root, then blob. Blob reference counts are
//! atomics, so adjusting them only needs a blob stripe read lock.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::access::{Access, AccessPoint, AccessPolicy, Clock};
use crate::config::ContentConfig;
use crate::stripe::StripeSet;

mod types;

pub use types::{ContentHash, ContentKey, Id, Root};

/// The number of hashes each key remembers.
pub const HISTORY_SIZE: usize = 64;

/// The number of most recent hashes per key that keep their blob alive.
pub const STRONG_REF_COUNT: u64 = 2;

/// The number of ids stored per chunk of a root's id list.
const ID_CHUNK_SIZE: usize = 1024;

/// Errors for operations that indicate a caller bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("root {0} is not allocated")]
    UnknownRoot(Root),
    #[error("no blob with hash {0}")]
    UnknownHash(ContentHash),
    #[error("downstream references of blob {0} are already zero")]
    DownstreamUnderflow(ContentHash),
}

/// Reference counts of a blob, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlobRefs {
    /// Strong references from key histories.
    pub key: u64,
    /// Manual references taken with [`ContentStore::downstream_inc`].
    pub downstream: u64,
}

#[derive(Debug)]
struct BlobEntry {
    hash: ContentHash,
    data: Bytes,
    key_refs: AtomicU64,
    downstream_refs: AtomicU64,
    access: Arc<AccessPoint>,
}

impl BlobEntry {
    fn is_evictable(&self, clock: &Clock, policy: &AccessPolicy) -> bool {
        self.key_refs.load(Ordering::Acquire) == 0
            && self.downstream_refs.load(Ordering::Acquire) == 0
            && self.access.is_expired(clock, policy)
    }
}

#[derive(Debug)]
struct KeyEntry {
    key: ContentKey,
    /// Number of hashes ever pushed; the newest lives at `(generation - 1) % HISTORY_SIZE`.
    generation: u64,
    history: Box<[ContentHash; HISTORY_SIZE]>,
}

impl KeyEntry {
    fn new(key: ContentKey) -> Self {
        Self {
            key,
            generation: 0,
            history: Box::new([ContentHash::ZERO; HISTORY_SIZE]),
        }
    }

    fn hash_at(&self, rewind: u64) -> ContentHash {
        if rewind >= self.generation || rewind >= HISTORY_SIZE as u64 {
            return ContentHash::ZERO;
        }
        let index = (self.generation - 1 - rewind) as usize % HISTORY_SIZE;
        self.history[index]
    }

    /// Pushes `hash` and returns the hash that dropped out of the strong window, if any.
    fn push(&mut self, hash: ContentHash) -> Option<ContentHash> {
        let expired = (self.generation >= STRONG_REF_COUNT).then(|| self.hash_at(STRONG_REF_COUNT - 1));
        self.history[self.generation as usize % HISTORY_SIZE] = hash;
        self.generation += 1;
        expired
    }

    /// The hashes currently holding strong references, newest first.
    fn strong_hashes(&self) -> impl Iterator<Item = ContentHash> + '_ {
        (0..STRONG_REF_COUNT.min(self.generation)).map(|rewind| self.hash_at(rewind))
    }
}

#[derive(Debug)]
struct RootEntry {
    root: Root,
    ids: Vec<Vec<Id>>,
}

impl RootEntry {
    fn register(&mut self, id: Id) {
        match self.ids.last_mut() {
            Some(chunk) if chunk.len() < ID_CHUNK_SIZE => chunk.push(id),
            _ => {
                let mut chunk = Vec::with_capacity(ID_CHUNK_SIZE);
                chunk.push(id);
                self.ids.push(chunk);
            }
        }
    }

    fn unregister(&mut self, id: Id) {
        for chunk in &mut self.ids {
            if let Some(position) = chunk.iter().position(|candidate| *candidate == id) {
                chunk.swap_remove(position);
                break;
            }
        }
        self.ids.retain(|chunk| !chunk.is_empty());
    }
}

/// See the [module docs](self).
pub struct ContentStore {
    clock: Arc<Clock>,
    blob_policy: AccessPolicy,
    next_root: AtomicU64,
    blobs: StripeSet<BlobEntry>,
    keys: StripeSet<KeyEntry>,
    roots: StripeSet<RootEntry>,
}

impl fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentStore")
            .field("blob_policy", &self.blob_policy)
            .field("blobs", &self.blobs.len())
            .field("keys", &self.keys.len())
            .field("roots", &self.roots.len())
            .finish()
    }
}

impl ContentStore {
    pub fn new(clock: Arc<Clock>, config: &ContentConfig, workers: usize) -> Self {
        Self {
            clock,
            blob_policy: config.blob_access,
            next_root: AtomicU64::new(1),
            blobs: StripeSet::new(config.blob_slots, workers),
            keys: StripeSet::new(config.key_slots, workers),
            roots: StripeSet::new(config.root_slots, workers),
        }
    }

    /// Allocates a new, empty root.
    pub fn root_alloc(&self) -> Root {
        let root = Root(self.next_root.fetch_add(1, Ordering::Relaxed));
        let (slot, stripe) = self.roots.locate(&root);
        stripe.write().insert(
            slot,
            RootEntry {
                root,
                ids: Vec::new(),
            },
        );
        tracing::trace!(%root, "allocated content root");
        root
    }

    /// Releases `root` and every key allocated under it.
    pub fn root_release(&self, root: Root) -> Result<(), ContentError> {
        let entry = {
            let (slot, stripe) = self.roots.locate(&root);
            stripe
                .write()
                .remove_where(slot, |entry| entry.root == root)
                .pop()
                .ok_or(ContentError::UnknownRoot(root))?
        };

        let mut released = 0usize;
        for id in entry.ids.into_iter().flatten() {
            if let Some(key) = self.remove_key(ContentKey { root, id }) {
                self.release_strong(&key);
                released += 1;
            }
        }
        tracing::trace!(%root, keys = released, "released content root");
        Ok(())
    }

    /// Stores `data` as the newest content of `key` and returns its hash.
    ///
    /// Identical data is stored once. Resubmitting the hash that is already the newest for `key`
    /// leaves the key's history untouched.
    pub fn submit_data(
        &self,
        key: ContentKey,
        data: impl Into<Bytes>,
    ) -> Result<ContentHash, ContentError> {
        let data = data.into();
        let hash = ContentHash::of(&data);
        self.acquire_blob(hash, data);

        // the reference to drop once the key lock is released
        let (released, result) = {
            let (slot, stripe) = self.keys.locate(&key);
            let mut keys = stripe.write();
            match keys.find_mut(slot, |entry| entry.key == key) {
                Some(entry) if entry.hash_at(0) == hash => (Some(hash), Ok(hash)),
                Some(entry) => (entry.push(hash), Ok(hash)),
                None if self.register_id(key) => {
                    let mut entry = KeyEntry::new(key);
                    let expired = entry.push(hash);
                    keys.insert(slot, entry);
                    (expired, Ok(hash))
                }
                None => (Some(hash), Err(ContentError::UnknownRoot(key.root))),
            }
        };

        if let Some(released) = released {
            self.release_blob(released);
        }
        if result.is_err() {
            tracing::warn!(%key, "rejected data submitted under an unknown root");
        }
        result
    }

    /// Releases a single key early, as if its root had been released.
    ///
    /// Returns whether the key existed.
    pub fn close_key(&self, key: ContentKey) -> bool {
        let Some(entry) = self.remove_key(key) else {
            return false;
        };
        let (slot, stripe) = self.roots.locate(&key.root);
        if let Some(root) = stripe
            .write()
            .find_mut(slot, |entry| entry.root == key.root)
        {
            root.unregister(key.id);
        }
        self.release_strong(&entry);
        true
    }

    /// Returns the hash submitted `rewind` submissions before the newest one.
    ///
    /// Returns [`ContentHash::ZERO`] for unknown keys and for history that was never recorded or
    /// has already been overwritten.
    pub fn hash_from_key(&self, key: ContentKey, rewind: u64) -> ContentHash {
        let (slot, stripe) = self.keys.locate(&key);
        stripe
            .read()
            .find(slot, |entry| entry.key == key)
            .map_or(ContentHash::ZERO, |entry| entry.hash_at(rewind))
    }

    /// The number of hashes ever recorded for `key`, or `0` if it is unknown.
    pub fn key_generation(&self, key: ContentKey) -> u64 {
        let (slot, stripe) = self.keys.locate(&key);
        stripe
            .read()
            .find(slot, |entry| entry.key == key)
            .map_or(0, |entry| entry.generation)
    }

    /// Returns the data stored under `hash` and keeps it alive until `access` is closed.
    pub fn data_from_hash(&self, access: &Access, hash: ContentHash) -> Option<Bytes> {
        if hash.is_zero() {
            return None;
        }
        let (slot, stripe) = self.blobs.locate(&hash);
        let blobs = stripe.read();
        let blob = blobs.find(slot, |blob| blob.hash == hash)?;
        access.touch(&blob.access, Some(stripe.signal()));
        Some(blob.data.clone())
    }

    /// Pins the blob with `hash` until the matching [`downstream_dec`](Self::downstream_dec).
    pub fn downstream_inc(&self, hash: ContentHash) -> Result<(), ContentError> {
        let (slot, stripe) = self.blobs.locate(&hash);
        let blobs = stripe.read();
        let blob = blobs
            .find(slot, |blob| blob.hash == hash)
            .ok_or(ContentError::UnknownHash(hash))?;
        blob.downstream_refs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drops a pin taken with [`downstream_inc`](Self::downstream_inc).
    pub fn downstream_dec(&self, hash: ContentHash) -> Result<(), ContentError> {
        let (slot, stripe) = self.blobs.locate(&hash);
        let blobs = stripe.read();
        let blob = blobs
            .find(slot, |blob| blob.hash == hash)
            .ok_or(ContentError::UnknownHash(hash))?;
        blob.downstream_refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
            .map_err(|_| ContentError::DownstreamUnderflow(hash))?;
        Ok(())
    }

    /// The reference counts of the blob with `hash`, if it is stored.
    pub fn blob_refs(&self, hash: ContentHash) -> Option<BlobRefs> {
        let (slot, stripe) = self.blobs.locate(&hash);
        let blobs = stripe.read();
        let blob = blobs.find(slot, |blob| blob.hash == hash)?;
        Some(BlobRefs {
            key: blob.key_refs.load(Ordering::Acquire),
            downstream: blob.downstream_refs.load(Ordering::Acquire),
        })
    }

    /// The number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Evicts all blobs without references whose access points have expired.
    pub fn tick(&self) {
        let evicted = self
            .blobs
            .sweep(|blob| blob.is_evictable(&self.clock, &self.blob_policy));
        if !evicted.is_empty() {
            let bytes: usize = evicted.iter().map(|blob| blob.data.len()).sum();
            tracing::trace!(blobs = evicted.len(), bytes, "evicted content blobs");
            metric!(counter("content.blobs.evicted") += evicted.len() as i64);
        }
        metric!(gauge("content.blobs") = self.blobs.len() as u64);
    }

    /// Takes one key reference on the blob for `hash`, inserting it if needed.
    fn acquire_blob(&self, hash: ContentHash, data: Bytes) {
        let (slot, stripe) = self.blobs.locate(&hash);
        {
            let blobs = stripe.read();
            if let Some(blob) = blobs.find(slot, |blob| blob.hash == hash) {
                blob.key_refs.fetch_add(1, Ordering::AcqRel);
                metric!(counter("content.blobs.deduplicated") += 1);
                return;
            }
        }

        let mut blobs = stripe.write();
        match blobs.find(slot, |blob| blob.hash == hash) {
            Some(blob) => {
                blob.key_refs.fetch_add(1, Ordering::AcqRel);
                metric!(counter("content.blobs.deduplicated") += 1);
            }
            None => {
                blobs.insert(
                    slot,
                    BlobEntry {
                        hash,
                        data,
                        key_refs: AtomicU64::new(1),
                        downstream_refs: AtomicU64::new(0),
                        access: Arc::new(AccessPoint::new(&self.clock)),
                    },
                );
                metric!(counter("content.blobs.inserted") += 1);
            }
        }
    }

    /// Drops one key reference from the blob for `hash`.
    fn release_blob(&self, hash: ContentHash) {
        let (slot, stripe) = self.blobs.locate(&hash);
        let blobs = stripe.read();
        let released = blobs.find(slot, |blob| blob.hash == hash).map(|blob| {
            blob.key_refs
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
                .is_ok()
        });
        debug_assert_eq!(released, Some(true), "lost a key reference of blob {hash}");
    }

    fn release_strong(&self, entry: &KeyEntry) {
        for hash in entry.strong_hashes() {
            self.release_blob(hash);
        }
    }

    /// Records `key.id` in its root. Must be called while holding the key's stripe lock.
    fn register_id(&self, key: ContentKey) -> bool {
        let (slot, stripe) = self.roots.locate(&key.root);
        let mut roots = stripe.write();
        match roots.find_mut(slot, |entry| entry.root == key.root) {
            Some(root) => {
                root.register(key.id);
                true
            }
            None => false,
        }
    }

    fn remove_key(&self, key: ContentKey) -> Option<KeyEntry> {
        let (slot, stripe) = self.keys.locate(&key);
        stripe
            .write()
            .remove_where(slot, |entry| entry.key == key)
            .pop()
    }
}
