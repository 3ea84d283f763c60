use std::sync::Arc;
use std::time::{Duration, Instant};

use dbgcache::access::AccessPolicy;
use dbgcache::content::ContentHash;
use dbgcache::context::TickDriver;
use dbgcache::file_stream::FileRangeProducer;

use crate::{bump_mtime, setup_context, tempdir, write_file};

#[test]
fn test_read_range() {
    let context = setup_context(|_| {});
    let dir = tempdir();
    let path = write_file(&dir, "data.bin", b"0123456789");
    let files = context.files();

    let access = context.access();
    assert_eq!(files.data_from_path_range(&access, &path, 2..6, None), None);
    context.tick();
    let data = files.data_from_path_range(&access, &path, 2..6, None);
    assert_eq!(data.as_deref(), Some(&b"2345"[..]));

    // ranges past the end are clamped
    files.data_from_path_range(&access, &path, 8..100, None);
    context.tick();
    let data = files.data_from_path_range(&access, &path, 8..100, None);
    assert_eq!(data.as_deref(), Some(&b"89"[..]));
}

#[test]
fn test_same_key_for_same_range() {
    let context = setup_context(|_| {});
    let dir = tempdir();
    let path = write_file(&dir, "data.bin", b"abc");
    let files = context.files();

    let access = context.access();
    let key = files.key_from_path_range(&access, &path, 0..3, None);
    assert_eq!(key, files.key_from_path_range(&access, &path, 0..3, None));
    assert_ne!(key, files.key_from_path_range(&access, &path, 0..2, None));
    assert_eq!(key.root, files.root());
}

#[test]
fn test_staleness_round_trip() {
    let context = setup_context(|_| {});
    let dir = tempdir();
    let path = write_file(&dir, "source.c", b"int main() { return 0; }");
    let files = context.files();
    let range = 0..1024;

    let access = context.access();
    files.data_from_path_range(&access, &path, range.clone(), None);
    context.tick();
    let old = files
        .data_from_path_range(&access, &path, range.clone(), None)
        .unwrap();
    assert_eq!(&old[..], b"int main() { return 0; }");
    assert_eq!(files.path_generation(&path), 0);

    write_file(&dir, "source.c", b"int main() { return 1; }");
    bump_mtime(&path, Duration::from_secs(10));
    context.tick();
    assert_eq!(files.path_generation(&path), 1);

    // the first lookup after the change still sees the old bytes and requests a new read
    files.data_from_path_range(&access, &path, range.clone(), None);
    context.tick();
    let new = files
        .data_from_path_range(&access, &path, range.clone(), None)
        .unwrap();
    assert_eq!(&new[..], b"int main() { return 1; }");

    let key = files.key_from_path_range(&access, &path, range, None);
    assert_eq!(context.content().key_generation(key), 2);
    assert_eq!(context.content().hash_from_key(key, 1), ContentHash::of(&old));
}

#[test]
fn test_equivalent_paths_share_reads() {
    let context = setup_context(|_| {});
    let dir = tempdir();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    let path = write_file(&dir, "src/main.c", b"int x;");
    let dotted = dir.path().join("src/./main.c");
    let parent = dir.path().join("src/../src/main.c");
    let files = context.files();

    let access = context.access();
    let key = files.key_from_path_range(&access, &dotted, 0..6, None);
    assert_eq!(key, files.key_from_path_range(&access, &parent, 0..6, None));
    assert_eq!(key, files.content_key(&path, &(0..6)));
    assert_eq!(context.artifacts().pending_requests(), 1);

    context.tick();
    let data = files.data_from_path_range(&access, &path, 0..6, None);
    assert_eq!(data.as_deref(), Some(&b"int x;"[..]));
    assert_eq!(files.path_generation(&parent), files.path_generation(&path));
}

#[test]
fn test_deadline_sees_fresh_data() {
    let context = Arc::new(setup_context(|config| {
        config.tick_interval = Duration::from_millis(2);
    }));
    let _driver = TickDriver::spawn(Arc::clone(&context)).unwrap();
    let dir = tempdir();
    let path = write_file(&dir, "live.txt", b"first");
    let files = context.files();

    let access = context.access();
    let deadline = || Some(Instant::now() + Duration::from_secs(10));
    let data = files.data_from_path_range(&access, &path, 0..64, deadline());
    assert_eq!(data.as_deref(), Some(&b"first"[..]));

    write_file(&dir, "live.txt", b"second");
    bump_mtime(&path, Duration::from_secs(10));
    let waited = Instant::now() + Duration::from_secs(10);
    while files.path_generation(&path) == 0 && Instant::now() < waited {
        std::thread::sleep(Duration::from_millis(1));
    }
    let data = files.data_from_path_range(&access, &path, 0..64, deadline());
    assert_eq!(data.as_deref(), Some(&b"second"[..]));
}

#[test]
fn test_parallel_read() {
    let context = setup_context(|config| {
        config.files.parallel_read_threshold = 1024;
        config.files.read_chunk_size = 100;
    });
    let dir = tempdir();
    let contents: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let path = write_file(&dir, "large.bin", &contents);
    let files = context.files();

    let access = context.access();
    files.data_from_path_range(&access, &path, 17..9_999, None);
    context.tick();
    let data = files
        .data_from_path_range(&access, &path, 17..9_999, None)
        .unwrap();
    assert_eq!(&data[..], &contents[17..9_999]);
}

#[test]
fn test_directory_and_missing_file() {
    let context = setup_context(|_| {});
    let dir = tempdir();
    let files = context.files();
    let missing = dir.path().join("missing.bin");

    let access = context.access();
    files.data_from_path_range(&access, dir.path(), 0..10, None);
    files.data_from_path_range(&access, &missing, 0..10, None);
    context.tick();
    context.tick();

    let data = files.data_from_path_range(&access, dir.path(), 0..10, None);
    assert_eq!(data.as_deref(), Some(&b""[..]));
    assert_eq!(files.data_from_path_range(&access, &missing, 0..10, None), None);
    // the read of the missing file is retried while it is asked for
    assert_eq!(context.artifacts().pending_requests(), 1);
}

#[test]
fn test_missing_file_is_abandoned() {
    let context = setup_context(|config| {
        config.artifacts.access = AccessPolicy::new(Duration::ZERO, 2);
    });
    let dir = tempdir();
    let missing = dir.path().join("missing.bin");
    let files = context.files();

    let access = context.access();
    assert_eq!(files.data_from_path_range(&access, &missing, 0..10, None), None);
    drop(access);
    assert_eq!(context.artifacts().entry_count::<FileRangeProducer>(), 1);

    for _ in 0..4 {
        context.tick();
    }
    assert_eq!(context.artifacts().pending_requests(), 0);
    assert_eq!(context.artifacts().entry_count::<FileRangeProducer>(), 0);
}
