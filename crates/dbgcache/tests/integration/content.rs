use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dbgcache::access::Clock;
use dbgcache::config::ContentConfig;
use dbgcache::content::{
    BlobRefs, ContentError, ContentHash, ContentKey, ContentStore, Id, Root, STRONG_REF_COUNT,
};
use proptest::prelude::*;

use crate::setup_context;

fn store() -> ContentStore {
    let config = ContentConfig {
        blob_slots: 128,
        key_slots: 128,
        root_slots: 16,
        ..Default::default()
    };
    ContentStore::new(Arc::new(Clock::new()), &config, 4)
}

#[test]
fn test_hello_world() {
    let context = setup_context(|_| {});
    let store = context.content();
    let root = store.root_alloc();
    let key = ContentKey::new(root, Id::new(1, 2));

    let hash1 = store.submit_data(key, "hello").unwrap();
    assert_eq!(store.hash_from_key(key, 0), hash1);

    let hash_world = store.submit_data(key, "world").unwrap();
    assert_eq!(store.hash_from_key(key, 0), hash_world);
    assert_eq!(store.hash_from_key(key, 1), hash1);
    assert_eq!(store.hash_from_key(key, 2), ContentHash::ZERO);

    let access = context.access();
    assert_eq!(
        store.data_from_hash(&access, hash_world).as_deref(),
        Some(&b"world"[..])
    );
    assert_eq!(store.data_from_hash(&access, ContentHash::ZERO), None);
}

#[test]
fn test_deduplication() {
    let store = store();
    let root = store.root_alloc();
    let first = ContentKey::new(root, Id::new(0, 1));
    let second = ContentKey::new(root, Id::new(0, 2));

    let hash = store.submit_data(first, vec![1, 2, 3]).unwrap();
    assert_eq!(store.submit_data(second, vec![1, 2, 3]).unwrap(), hash);
    assert_eq!(store.blob_count(), 1);
    assert_eq!(store.blob_refs(hash), Some(BlobRefs { key: 2, downstream: 0 }));
}

#[test]
fn test_released_root_evicts_blobs() {
    let context = setup_context(|config| {
        config.content.blob_access = dbgcache::access::AccessPolicy::new(Default::default(), 1);
    });
    let store = context.content();
    let root = store.root_alloc();
    for lo in 0..10 {
        store
            .submit_data(ContentKey::new(root, Id::new(0, lo)), lo.to_le_bytes().to_vec())
            .unwrap();
    }
    assert_eq!(store.blob_count(), 10);

    context.tick();
    context.tick();
    assert_eq!(store.blob_count(), 10);

    store.root_release(root).unwrap();
    context.tick();
    context.tick();
    assert_eq!(store.blob_count(), 0);
    assert_eq!(store.root_release(root), Err(ContentError::UnknownRoot(root)));
}

#[test]
fn test_concurrent_submit_and_release() {
    let store = store();
    let roots: Vec<Root> = (0..4).map(|_| store.root_alloc()).collect();
    let hashes: Vec<ContentHash> = (0..16u8).map(|byte| ContentHash::of(&[byte; 32])).collect();

    std::thread::scope(|scope| {
        for (index, root) in roots.iter().enumerate() {
            for writer in 0..3u64 {
                let store = &store;
                scope.spawn(move || {
                    for round in 0..300u64 {
                        let key = ContentKey::new(*root, Id::new(writer, round % 7));
                        let byte = ((round * 7 + writer) % 16) as u8;
                        match store.submit_data(key, vec![byte; 32]) {
                            Ok(_) | Err(ContentError::UnknownRoot(_)) => {}
                            Err(error) => panic!("unexpected error: {error}"),
                        }
                    }
                });
            }
            let store = &store;
            scope.spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(index as u64));
                store.root_release(*root).unwrap();
            });
        }
    });

    for hash in hashes {
        if let Some(refs) = store.blob_refs(hash) {
            assert_eq!(refs.key, 0, "blob {hash} still referenced");
        }
    }
}

#[derive(Clone, Debug)]
struct Submission {
    root: usize,
    id: u64,
    byte: u8,
}

fn submission() -> impl Strategy<Value = Submission> {
    (0..4usize, 0..6u64, 0..5u8).prop_map(|(root, id, byte)| Submission { root, id, byte })
}

/// Keeps the expected key histories, deduplicating resubmits of the newest hash.
#[derive(Default)]
struct Model {
    histories: BTreeMap<ContentKey, Vec<ContentHash>>,
}

impl Model {
    fn submit(&mut self, key: ContentKey, hash: ContentHash) {
        let history = self.histories.entry(key).or_default();
        if history.last() != Some(&hash) {
            history.push(hash);
        }
    }

    fn release(&mut self, root: Root) {
        self.histories.retain(|key, _| key.root != root);
    }

    fn expected_refs(&self) -> BTreeMap<ContentHash, u64> {
        let mut refs = BTreeMap::new();
        for history in self.histories.values() {
            for hash in history.iter().rev().take(STRONG_REF_COUNT as usize) {
                *refs.entry(*hash).or_default() += 1;
            }
        }
        refs
    }
}

fn check_refs(
    store: &ContentStore,
    model: &Model,
    seen: &BTreeSet<ContentHash>,
) -> Result<(), TestCaseError> {
    let expected = model.expected_refs();
    let mut total = 0;
    for hash in seen {
        let refs = store.blob_refs(*hash).map_or(0, |refs| refs.key);
        prop_assert_eq!(refs, expected.get(hash).copied().unwrap_or(0));
        total += refs;
    }
    let strong: u64 = model
        .histories
        .keys()
        .map(|key| store.key_generation(*key).min(STRONG_REF_COUNT))
        .sum();
    prop_assert_eq!(total, strong);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Blob key references always match the strong history slots pointing at them.
    #[test]
    fn prop_ref_count_conservation(
        submissions in prop::collection::vec(submission(), 0..120),
        release_order in Just(vec![0usize, 1, 2, 3]).prop_shuffle(),
    ) {
        let store = store();
        let clock = Arc::new(Clock::new());
        let roots: Vec<Root> = (0..4).map(|_| store.root_alloc()).collect();
        let mut model = Model::default();
        let mut seen = BTreeSet::new();

        for Submission { root, id, byte } in submissions {
            let key = ContentKey::new(roots[root], Id::new(root as u64, id));
            let data = vec![byte; 16 + byte as usize];
            let hash = store.submit_data(key, data.clone()).unwrap();
            prop_assert_eq!(hash, ContentHash::of(&data));
            model.submit(key, hash);
            seen.insert(hash);
            prop_assert_eq!(store.hash_from_key(key, 0), hash);
        }
        check_refs(&store, &model, &seen)?;

        // everything still referenced is readable
        let access = dbgcache::access::Access::new(clock);
        for hash in model.expected_refs().keys() {
            prop_assert!(store.data_from_hash(&access, *hash).is_some());
        }

        for index in release_order {
            store.root_release(roots[index]).unwrap();
            model.release(roots[index]);
            check_refs(&store, &model, &seen)?;
        }
        for hash in &seen {
            prop_assert_eq!(store.blob_refs(*hash).map_or(0, |refs| refs.key), 0);
        }
    }
}
