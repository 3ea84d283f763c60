use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dbgcache::context::{CacheContext, TickDriver};
use dbgcache::debug_info::rdi::write_container;
use dbgcache::debug_info::{
    ConversionLauncher, ConversionProcess, ConversionRequest, DebugInfoError, rdi_path_for,
};

use crate::{TempDir, set_mtime, setup_context_with_launcher, tempdir, write_file};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Behavior {
    /// Writes the container after the given number of polls.
    Convert(usize),
    /// Exits unsuccessfully without output.
    Fail,
    /// Never exits.
    Hang,
    /// Writes the container once the launcher's gate is opened.
    Gated,
}

/// Converts in-process by copying the source into an RDI container.
#[derive(Debug)]
struct FakeLauncher {
    behavior: Behavior,
    launches: AtomicUsize,
    killed: Arc<AtomicBool>,
    gate: Arc<AtomicBool>,
    requests: std::sync::Mutex<Vec<ConversionRequest>>,
}

impl FakeLauncher {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            launches: AtomicUsize::new(0),
            killed: Default::default(),
            gate: Default::default(),
            requests: Default::default(),
        })
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// The sources of all launched conversions, in launch order.
    fn launched_sources(&self) -> Vec<std::path::PathBuf> {
        let requests = self.requests.lock().unwrap();
        requests.iter().map(|request| request.source.clone()).collect()
    }
}

struct FakeProcess {
    request: ConversionRequest,
    behavior: Behavior,
    polls: usize,
    killed: Arc<AtomicBool>,
    gate: Arc<AtomicBool>,
}

impl FakeProcess {
    fn convert(&self) -> io::Result<Option<bool>> {
        let payload = std::fs::read(&self.request.source)?;
        let output = File::create(&self.request.output)?;
        write_container(output, &payload, self.request.compress)?;
        Ok(Some(true))
    }
}

impl ConversionProcess for FakeProcess {
    fn try_wait(&mut self) -> io::Result<Option<bool>> {
        self.polls += 1;
        match self.behavior {
            Behavior::Convert(polls) if self.polls >= polls => self.convert(),
            Behavior::Gated if self.gate.load(Ordering::SeqCst) => self.convert(),
            Behavior::Convert(_) | Behavior::Gated | Behavior::Hang => Ok(None),
            Behavior::Fail => Ok(Some(false)),
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl ConversionLauncher for FakeLauncher {
    fn launch(&self, request: &ConversionRequest) -> io::Result<Box<dyn ConversionProcess>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        Ok(Box::new(FakeProcess {
            request: request.clone(),
            behavior: self.behavior,
            polls: 0,
            killed: Arc::clone(&self.killed),
            gate: Arc::clone(&self.gate),
        }))
    }
}

fn source(dir: &TempDir, name: &str) -> std::path::PathBuf {
    write_file(dir, name, format!("native debug info of {name}"))
}

/// Ticks until the debug info cache completed `loads` loads in total.
fn tick_until_loaded(context: &CacheContext, loads: u64) {
    for _ in 0..100 {
        if context.debug_info().load_gen() >= loads {
            return;
        }
        context.tick();
    }
    panic!("debug info was not loaded");
}

fn mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

#[test]
fn test_convert_and_load() {
    let launcher = FakeLauncher::new(Behavior::Convert(2));
    let context = Arc::new(setup_context_with_launcher(
        |config| config.tick_interval = Duration::from_millis(2),
        launcher.clone(),
    ));
    let _driver = TickDriver::spawn(Arc::clone(&context)).unwrap();
    let dir = tempdir();
    let path = source(&dir, "app.pdb");
    let debug_info = context.debug_info();

    let key = debug_info.key_from_path_timestamp(&path, mtime(&path));
    debug_info.open(key);

    let access = context.access();
    let deadline = Instant::now() + Duration::from_secs(10);
    let parsed = debug_info
        .rdi_for_key(&access, key, true, Some(deadline))
        .unwrap();
    assert_eq!(parsed.payload(), b"native debug info of app.pdb");
    assert!(rdi_path_for(&path).exists());

    let requests = launcher.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].source, path);
    assert_eq!(requests[0].output, dir.path().join("app.rdi"));
    assert_eq!(requests[0].thread_count, 1);

    // a second open shares the loaded entry
    debug_info.open(key);
    let again = debug_info.rdi_for_key(&access, key, true, None).unwrap();
    assert!(Arc::ptr_eq(&parsed, &again));
    assert_eq!(launcher.launches(), 1);
}

#[test]
fn test_compressed_conversion() {
    let launcher = FakeLauncher::new(Behavior::Convert(1));
    let context = setup_context_with_launcher(|config| config.debug_info.compress = true, launcher);
    let dir = tempdir();
    let path = source(&dir, "packed.pdb");
    let debug_info = context.debug_info();

    let key = debug_info.key_from_path_timestamp(&path, UNIX_EPOCH);
    debug_info.open(key);
    tick_until_loaded(&context, 1);

    let access = context.access();
    let parsed = debug_info.rdi_for_key(&access, key, false, None).unwrap();
    assert!(parsed.header().is_packed());
    assert_eq!(parsed.payload(), b"native debug info of packed.pdb");
}

#[test]
fn test_fresh_rdi_skips_conversion() {
    let launcher = FakeLauncher::new(Behavior::Fail);
    let context = setup_context_with_launcher(|_| {}, launcher.clone());
    let dir = tempdir();
    let path = source(&dir, "cached.pdb");
    let mut container = Vec::new();
    write_container(&mut container, b"converted earlier", false).unwrap();
    write_file(&dir, "cached.rdi", container);

    let debug_info = context.debug_info();
    let key = debug_info.key_from_path_timestamp(&path, UNIX_EPOCH);
    debug_info.open(key);
    tick_until_loaded(&context, 1);

    let access = context.access();
    let parsed = debug_info.rdi_for_key(&access, key, false, None).unwrap();
    assert_eq!(parsed.payload(), b"converted earlier");
    assert_eq!(launcher.launches(), 0);
}

#[test]
fn test_outdated_rdi_is_converted_again() {
    let launcher = FakeLauncher::new(Behavior::Convert(1));
    let context = setup_context_with_launcher(|_| {}, launcher.clone());
    let dir = tempdir();
    let path = source(&dir, "old.pdb");
    let mut container = Vec::new();
    write_container(&mut container, b"outdated", false).unwrap();
    let rdi = write_file(&dir, "old.rdi", container);
    set_mtime(&rdi, UNIX_EPOCH + Duration::from_secs(1000));

    let debug_info = context.debug_info();
    let key = debug_info.key_from_path_timestamp(&path, mtime(&path));
    debug_info.open(key);
    tick_until_loaded(&context, 1);

    let access = context.access();
    let parsed = debug_info.rdi_for_key(&access, key, false, None).unwrap();
    assert_eq!(parsed.payload(), b"native debug info of old.pdb");
    assert_eq!(launcher.launches(), 1);
}

#[test]
fn test_failed_conversion() {
    let launcher = FakeLauncher::new(Behavior::Fail);
    let context = setup_context_with_launcher(|_| {}, launcher.clone());
    let dir = tempdir();
    let path = source(&dir, "broken.pdb");
    let debug_info = context.debug_info();

    let key = debug_info.key_from_path_timestamp(&path, UNIX_EPOCH);
    debug_info.open(key);
    tick_until_loaded(&context, 1);

    let access = context.access();
    let start = Instant::now();
    let deadline = start + Duration::from_secs(30);
    assert!(debug_info.rdi_for_key(&access, key, true, Some(deadline)).is_none());
    // completed loads do not make callers wait for their deadline
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(debug_info.pending_conversions(), 0);
    assert_eq!(launcher.launches(), 1);
}

#[test]
fn test_conversion_timeout() {
    let launcher = FakeLauncher::new(Behavior::Hang);
    let context = setup_context_with_launcher(
        |config| config.debug_info.conversion_timeout = Some(Duration::from_millis(20)),
        launcher.clone(),
    );
    let dir = tempdir();
    let path = source(&dir, "slow.pdb");
    let debug_info = context.debug_info();

    let key = debug_info.key_from_path_timestamp(&path, UNIX_EPOCH);
    debug_info.open(key);
    context.tick();
    assert_eq!(debug_info.pending_conversions(), 1);
    assert_eq!(debug_info.load_gen(), 0);

    std::thread::sleep(Duration::from_millis(30));
    context.tick();
    assert_eq!(debug_info.load_gen(), 1);
    assert_eq!(debug_info.pending_conversions(), 0);
    assert!(launcher.killed.load(Ordering::SeqCst));

    let access = context.access();
    assert!(debug_info.rdi_for_key(&access, key, false, None).is_none());
}

#[test]
fn test_thread_budget_limits_launches() {
    let launcher = FakeLauncher::new(Behavior::Hang);
    let context = setup_context_with_launcher(
        |config| {
            config.debug_info.max_conversion_threads = Some(1);
            config.debug_info.conversion_timeout = None;
        },
        launcher.clone(),
    );
    let dir = tempdir();
    let debug_info = context.debug_info();

    for name in ["one.pdb", "two.pdb"] {
        let path = source(&dir, name);
        let key = debug_info.key_from_path_timestamp(&path, UNIX_EPOCH);
        debug_info.open(key);
    }
    context.tick();
    context.tick();
    assert_eq!(launcher.launches(), 1);
    assert_eq!(debug_info.pending_conversions(), 2);
}

#[test]
fn test_high_priority_launches_first() {
    let launcher = FakeLauncher::new(Behavior::Gated);
    let context = setup_context_with_launcher(
        |config| {
            config.debug_info.max_conversion_threads = Some(1);
            config.debug_info.conversion_timeout = None;
        },
        launcher.clone(),
    );
    let dir = tempdir();
    let debug_info = context.debug_info();

    let paths: Vec<_> = ["first.pdb", "second.pdb", "third.pdb"]
        .into_iter()
        .map(|name| source(&dir, name))
        .collect();
    let keys: Vec<_> = paths
        .iter()
        .map(|path| debug_info.key_from_path_timestamp(path, UNIX_EPOCH))
        .collect();
    for key in &keys {
        debug_info.open(*key);
    }
    context.tick();
    assert_eq!(launcher.launched_sources(), vec![paths[0].clone()]);

    // the last one is needed right away, while the others still wait for budget
    let access = context.access();
    assert!(debug_info.rdi_for_key(&access, keys[2], true, None).is_none());
    launcher.gate.store(true, Ordering::SeqCst);
    context.tick();

    assert_eq!(
        launcher.launched_sources(),
        vec![paths[0].clone(), paths[2].clone()]
    );
    assert_eq!(debug_info.load_gen(), 1);
    assert_eq!(debug_info.pending_conversions(), 2);

    tick_until_loaded(&context, 3);
    assert_eq!(
        launcher.launched_sources(),
        vec![paths[0].clone(), paths[2].clone(), paths[1].clone()]
    );
}

#[test]
fn test_open_close_lifecycle() {
    let launcher = FakeLauncher::new(Behavior::Convert(1));
    let context = setup_context_with_launcher(|_| {}, launcher.clone());
    let dir = tempdir();
    let path = source(&dir, "cycle.pdb");
    let debug_info = context.debug_info();
    let key = debug_info.key_from_path_timestamp(&path, UNIX_EPOCH);

    assert_eq!(debug_info.close(key), Err(DebugInfoError::NotOpen(key)));

    for cycle in 1..=10 {
        debug_info.open(key);
        debug_info.close(key).unwrap();
        tick_until_loaded(&context, cycle);
        // the load completes and the entry is freed by the same tick
        assert_eq!(debug_info.entry_count(), 0);
        assert_eq!(debug_info.mapped_count(), 0);
    }
    // the first cycle converted, all later ones found the RDI file
    assert_eq!(launcher.launches(), 1);
    assert_eq!(debug_info.loaded_keys(), vec![key]);
}

#[test]
fn test_parsed_outlives_entry() {
    let launcher = FakeLauncher::new(Behavior::Convert(1));
    let context = setup_context_with_launcher(|_| {}, launcher);
    let dir = tempdir();
    let path = source(&dir, "held.pdb");
    let debug_info = context.debug_info();
    let key = debug_info.key_from_path_timestamp(&path, UNIX_EPOCH);

    debug_info.open(key);
    tick_until_loaded(&context, 1);
    let access = context.access();
    let parsed = debug_info.rdi_for_key(&access, key, false, None).unwrap();
    drop(access);
    debug_info.close(key).unwrap();
    context.tick();

    assert_eq!(debug_info.entry_count(), 0);
    assert_eq!(debug_info.mapped_count(), 1);
    drop(parsed);
    assert_eq!(debug_info.mapped_count(), 0);
}
