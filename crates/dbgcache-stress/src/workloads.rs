use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use dbgcache::content::{ContentKey, Id, Root};
use dbgcache::context::CacheContext;
use dbgcache::debug_info::DebugInfoKey;

/// How long a single operation may wait for a tick.
const OPERATION_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Submits and reads back generated blobs.
    Content { keys: u64, size: usize },
    /// Reads ranges of the files in a directory.
    Files { path: PathBuf, range_size: u64 },
    /// Loads the debug info files in a directory.
    DebugInfo(PathBuf),
}

#[derive(Debug)]
pub enum ParsedPayload {
    Content {
        root: Root,
        keys: u64,
        size: usize,
    },
    Files {
        files: Vec<(PathBuf, u64)>,
        range_size: u64,
    },
    DebugInfo(Vec<DebugInfoKey>),
}

/// A prepared workload and the number of operations it ran.
#[derive(Debug)]
pub struct PreparedWorkload {
    payload: ParsedPayload,
    operations: AtomicUsize,
}

fn list_files(dir: &Path) -> Result<Vec<(PathBuf, u64)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            files.push((entry.path(), metadata.len()));
        }
    }
    if files.is_empty() {
        anyhow::bail!("no files in {}", dir.display());
    }
    files.sort();
    Ok(files)
}

pub fn prepare_payload(context: &CacheContext, payload: Payload) -> Result<PreparedWorkload> {
    let payload = match payload {
        Payload::Content { keys, size } => ParsedPayload::Content {
            root: context.content().root_alloc(),
            keys: keys.max(1),
            size,
        },
        Payload::Files { path, range_size } => ParsedPayload::Files {
            files: list_files(&path)?,
            range_size: range_size.max(1),
        },
        Payload::DebugInfo(path) => {
            let debug_info = context.debug_info();
            let keys = list_files(&path)?
                .into_iter()
                .map(|(path, _)| {
                    let key = debug_info.key_from_path_timestamp(&path, UNIX_EPOCH);
                    debug_info.open(key);
                    key
                })
                .collect();
            ParsedPayload::DebugInfo(keys)
        }
    };
    Ok(PreparedWorkload {
        payload,
        operations: AtomicUsize::new(0),
    })
}

pub fn process_payload(context: &CacheContext, workload: &PreparedWorkload) {
    let operation = workload.operations.fetch_add(1, Ordering::Relaxed);
    let access = context.access();
    let deadline = Some(Instant::now() + OPERATION_DEADLINE);

    match &workload.payload {
        ParsedPayload::Content { root, keys, size } => {
            let content = context.content();
            let key = ContentKey::new(*root, Id::new(0, operation as u64 % keys));
            // every key cycles through a handful of versions
            let data = vec![(operation / *keys as usize % 7) as u8; *size];
            if let Ok(hash) = content.submit_data(key, data) {
                content.data_from_hash(&access, hash);
            }
        }
        ParsedPayload::Files { files, range_size } => {
            let (path, len) = &files[operation % files.len()];
            let ranges = (len / range_size).max(1);
            let start = (operation as u64 / files.len() as u64 % ranges) * range_size;
            context
                .files()
                .data_from_path_range(&access, path, start..start + range_size, deadline);
        }
        ParsedPayload::DebugInfo(keys) => {
            let key = keys[operation % keys.len()];
            context
                .debug_info()
                .rdi_for_key(&access, key, true, deadline);
        }
    }
}
