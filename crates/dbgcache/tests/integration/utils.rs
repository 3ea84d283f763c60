use std::sync::Arc;

use dbgcache::config::Config;
use dbgcache::context::CacheContext;
use dbgcache::debug_info::ConversionLauncher;
use dbgcache_test as test;

pub use test::{TempDir, bump_mtime, set_mtime, tempdir, write_file};

/// A test configuration with few lanes and small tables.
///
/// The `update_config` closure can modify any default configuration if needed before the
/// context is created.
pub fn test_config(update_config: impl FnOnce(&mut Config)) -> Config {
    let mut config = Config {
        lanes: Some(4),
        ..Default::default()
    };
    config.content.blob_slots = 256;
    config.content.key_slots = 256;
    config.content.root_slots = 64;
    config.files.path_slots = 64;
    config.debug_info.slots = 64;
    config.debug_info.key_slots = 64;
    update_config(&mut config);
    config
}

/// Setup tests and create a cache context.
pub fn setup_context(update_config: impl FnOnce(&mut Config)) -> CacheContext {
    test::setup();
    CacheContext::new(&test_config(update_config)).unwrap()
}

/// Setup tests and create a cache context converting debug info with `launcher`.
pub fn setup_context_with_launcher(
    update_config: impl FnOnce(&mut Config),
    launcher: Arc<dyn ConversionLauncher>,
) -> CacheContext {
    test::setup();
    CacheContext::with_launcher(&test_config(update_config), launcher).unwrap()
}
