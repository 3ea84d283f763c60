use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dbgcache::access::AccessPolicy;
use dbgcache::artifact::{ArtifactProducer, LookupParams, Produced};
use dbgcache::context::TickDriver;

use crate::setup_context;

const KEYS: usize = 16;

/// Counts overlapping `produce` calls per key.
struct ExclusiveProducer {
    active: Vec<AtomicUsize>,
    overlaps: AtomicUsize,
    calls: AtomicUsize,
}

impl ExclusiveProducer {
    fn new() -> Self {
        Self {
            active: (0..KEYS).map(|_| AtomicUsize::new(0)).collect(),
            overlaps: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }
}

impl ArtifactProducer for ExclusiveProducer {
    type Key = usize;
    type Artifact = Arc<String>;

    fn produce(&self, key: &usize) -> Produced<Arc<String>> {
        if self.active[*key].fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_micros(200));
        self.active[*key].fetch_sub(1, Ordering::SeqCst);
        Produced::Value(Arc::new(format!("artifact {key}")))
    }
}

#[test]
fn test_at_most_one_producer_per_key() {
    let context = Arc::new(setup_context(|config| {
        config.tick_interval = Duration::from_millis(1);
    }));
    let producer = Arc::new(ExclusiveProducer::new());
    let driver = TickDriver::spawn(Arc::clone(&context)).unwrap();

    std::thread::scope(|scope| {
        for thread in 0..8 {
            let context = &context;
            let producer = &producer;
            scope.spawn(move || {
                for iteration in 0..200usize {
                    let access = context.access();
                    let key = (thread + iteration) % KEYS;
                    // new generations force re-production while other threads still look up
                    let generation = (iteration / 50) as u64;
                    context
                        .artifacts()
                        .artifact_for_key(&access, producer, &key, generation);
                    if iteration % 20 == 0 {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            });
        }
    });

    let access = context.access();
    let deadline = Instant::now() + Duration::from_secs(10);
    for key in 0..KEYS {
        let params = LookupParams::new(3).deadline(Some(deadline)).wait_for_fresh();
        let lookup = context.artifacts().lookup(&access, &producer, &key, params);
        assert_eq!(lookup.value.as_deref(), Some(&format!("artifact {key}")));
        assert!(!lookup.stale);
    }
    drop(driver);

    assert_eq!(producer.overlaps.load(Ordering::SeqCst), 0);
    assert!(producer.calls.load(Ordering::SeqCst) >= KEYS);
}

#[test]
fn test_value_survives_while_accessed() {
    let context = setup_context(|config| {
        config.artifacts.access = AccessPolicy::new(Duration::ZERO, 3);
    });
    let producer = Arc::new(ExclusiveProducer::new());

    let access = context.access();
    assert_eq!(context.artifacts().artifact_for_key(&access, &producer, &1, 0), None);
    context.tick();
    let value = context
        .artifacts()
        .artifact_for_key(&access, &producer, &1, 0)
        .unwrap();

    for _ in 0..20 {
        context.tick();
        let again = context
            .artifacts()
            .artifact_for_key(&access, &producer, &1, 0)
            .unwrap();
        assert_eq!(again, value);
    }
    assert_eq!(context.artifacts().entry_count::<ExclusiveProducer>(), 1);

    drop(access);
    for _ in 0..2 {
        context.tick();
        assert_eq!(context.artifacts().entry_count::<ExclusiveProducer>(), 1);
    }
    context.tick();
    assert_eq!(context.artifacts().entry_count::<ExclusiveProducer>(), 0);
    assert_eq!(producer.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_first_producer_instance_is_used() {
    let context = setup_context(|_| {});
    let first = Arc::new(ExclusiveProducer::new());
    let second = Arc::new(ExclusiveProducer::new());

    let access = context.access();
    context.artifacts().artifact_for_key(&access, &first, &0, 0);
    context.artifacts().artifact_for_key(&access, &second, &1, 0);
    context.tick();

    assert_eq!(first.calls.load(Ordering::SeqCst), 2);
    assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    assert!(context.artifacts().artifact_for_key(&access, &second, &1, 0).is_some());
    assert!(context.artifacts().is_registered_instance(&first));
    assert!(!context.artifacts().is_registered_instance(&second));
}

#[test]
fn test_deadline_waits_for_tick() {
    let context = Arc::new(setup_context(|config| {
        config.tick_interval = Duration::from_millis(5);
    }));
    let producer = Arc::new(ExclusiveProducer::new());
    let _driver = TickDriver::spawn(Arc::clone(&context)).unwrap();

    let access = context.access();
    let params = LookupParams::new(0).deadline(Some(Instant::now() + Duration::from_secs(10)));
    let lookup = context.artifacts().lookup(&access, &producer, &4, params);
    assert_eq!(lookup.value.as_deref().map(String::as_str), Some("artifact 4"));
}
