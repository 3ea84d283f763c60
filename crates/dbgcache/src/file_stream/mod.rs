//! Cached reads of byte ranges from files on disk.
//!
//! A read of `(path, range)` maps to a fixed [`ContentKey`] under the file stream's own content
//! root. The bytes themselves are produced through the [`ArtifactCache`] and submitted into the
//! [`ContentStore`], so identical file contents are stored once.
//!
//! Every tracked path carries a generation which the [`tick`](FileStream::tick) bumps whenever the
//! file's modification time changes. Lookups pass that generation to the artifact cache, so a
//! changed file is read again on the next tick.

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use rayon::prelude::*;

use crate::access::Access;
use crate::artifact::{ArtifactCache, ArtifactProducer, LookupParams, Produced};
use crate::config::FilesConfig;
use crate::content::{ContentHash, ContentKey, ContentStore, Id, Root};
use crate::stripe::StripeSet;

#[derive(Clone, Debug)]
struct PathEntry {
    path: PathBuf,
    modified: Option<SystemTime>,
    size: u64,
    generation: u64,
}

/// The recorded state of all paths read so far.
#[derive(Debug)]
struct PathTable {
    entries: StripeSet<PathEntry>,
}

impl PathTable {
    fn generation(&self, path: &Path) -> u64 {
        let (slot, stripe) = self.entries.locate(path);
        stripe
            .read()
            .find(slot, |entry| entry.path == path)
            .map_or(0, |entry| entry.generation)
    }

    /// Records the stamp observed by a successful read.
    ///
    /// A stamp differing from the recorded one also counts as a change, so ranges read before the
    /// change are refreshed even if the tick never saw the old stamp go away.
    fn record(&self, path: &Path, modified: Option<SystemTime>, size: u64) {
        let (slot, stripe) = self.entries.locate(path);
        let mut entries = stripe.write();
        match entries.find_mut(slot, |entry| entry.path == path) {
            Some(entry) => {
                if entry.modified != modified || entry.size != size {
                    entry.modified = modified;
                    entry.size = size;
                    entry.generation += 1;
                    metric!(counter("files.generation_bumped") += 1);
                }
            }
            None => entries.insert(
                slot,
                PathEntry {
                    path: path.to_owned(),
                    modified,
                    size,
                    generation: 0,
                },
            ),
        }
    }
}

/// Lexically normalizes `path`: drops `.` components and folds `..` into the component before it.
///
/// Symbolic links are not resolved.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normalized.components().next_back() {
                Some(Component::Normal(_)) => {
                    normalized.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => normalized.push(".."),
            },
            component => normalized.push(component),
        }
    }
    if normalized.as_os_str().is_empty() {
        normalized.push(".");
    }
    normalized
}

/// The artifact key of a range read.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileRangeKey {
    pub path: PathBuf,
    pub range: Range<u64>,
    pub content_key: ContentKey,
}

/// Reads file ranges into the content store.
#[derive(Debug)]
pub struct FileRangeProducer {
    store: Arc<ContentStore>,
    paths: Arc<PathTable>,
    parallel_read_threshold: u64,
    read_chunk_size: u64,
}

impl FileRangeProducer {
    fn read_range(
        &self,
        file: &mut File,
        path: &Path,
        start: u64,
        len: u64,
    ) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0; len as usize];
        if len <= self.parallel_read_threshold {
            file.seek(SeekFrom::Start(start))?;
            file.read_exact(&mut buffer)?;
            return Ok(buffer);
        }

        let chunk_size = self.read_chunk_size.max(1) as usize;
        buffer
            .par_chunks_mut(chunk_size)
            .enumerate()
            .try_for_each(|(index, chunk)| {
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(start + (index * chunk_size) as u64))?;
                file.read_exact(chunk)
            })?;
        Ok(buffer)
    }

    fn submit(
        &self,
        key: &FileRangeKey,
        data: Vec<u8>,
        before: &Metadata,
    ) -> Produced<ContentHash> {
        match self.store.submit_data(key.content_key, data) {
            Ok(hash) => {
                self.paths
                    .record(&key.path, before.modified().ok(), before.len());
                Produced::Value(hash)
            }
            Err(error) => {
                tracing::error!(
                    path = %key.path.display(),
                    error = &error as &dyn std::error::Error,
                    "failed to store file contents",
                );
                Produced::Value(ContentHash::ZERO)
            }
        }
    }
}

impl ArtifactProducer for FileRangeProducer {
    type Key = FileRangeKey;
    type Artifact = ContentHash;

    fn produce(&self, key: &FileRangeKey) -> Produced<ContentHash> {
        let path = key.path.as_path();
        let before = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(error) => {
                tracing::trace!(path = %path.display(), %error, "cannot stat file, retrying");
                return Produced::Retry;
            }
        };
        if before.is_dir() {
            return self.submit(key, Vec::new(), &before);
        }

        let size = before.len();
        let start = key.range.start.min(size);
        let end = key.range.end.clamp(start, size);

        let data = File::open(path)
            .and_then(|mut file| self.read_range(&mut file, path, start, end - start));
        let data = match data {
            Ok(data) => data,
            Err(error) => {
                tracing::debug!(path = %path.display(), %error, "failed to read file, retrying");
                return Produced::Retry;
            }
        };

        let unchanged = fs::metadata(path).is_ok_and(|after| {
            after.len() == before.len() && after.modified().ok() == before.modified().ok()
        });
        if !unchanged {
            tracing::debug!(path = %path.display(), "file changed while reading, retrying");
            return Produced::Retry;
        }

        self.submit(key, data, &before)
    }

    fn slot_count(&self) -> usize {
        4096
    }

    fn name(&self) -> &'static str {
        "file_range"
    }
}

/// The file read cache.
#[derive(Debug)]
pub struct FileStream {
    root: Root,
    store: Arc<ContentStore>,
    artifacts: Arc<ArtifactCache>,
    producer: Arc<FileRangeProducer>,
    paths: Arc<PathTable>,
}

impl FileStream {
    /// Creates the file stream and allocates its content root.
    pub fn new(
        store: Arc<ContentStore>,
        artifacts: Arc<ArtifactCache>,
        config: &FilesConfig,
        workers: usize,
    ) -> Self {
        let root = store.root_alloc();
        let paths = Arc::new(PathTable {
            entries: StripeSet::new(config.path_slots, workers),
        });
        let producer = Arc::new(FileRangeProducer {
            store: Arc::clone(&store),
            paths: Arc::clone(&paths),
            parallel_read_threshold: config.parallel_read_threshold,
            read_chunk_size: config.read_chunk_size,
        });
        Self {
            root,
            store,
            artifacts,
            producer,
            paths,
        }
    }

    /// The content root all file contents are stored under.
    pub fn root(&self) -> Root {
        self.root
    }

    /// The content key `(path, range)` reads are stored under.
    pub fn content_key(&self, path: &Path, range: &Range<u64>) -> ContentKey {
        self.normalized_content_key(&normalize_path(path), range)
    }

    fn normalized_content_key(&self, path: &Path, range: &Range<u64>) -> ContentKey {
        let mut bytes = path.as_os_str().as_encoded_bytes().to_vec();
        bytes.extend_from_slice(&range.start.to_le_bytes());
        bytes.extend_from_slice(&range.end.to_le_bytes());
        ContentKey::new(self.root, Id::from_bytes(&bytes))
    }

    /// The current generation of `path`, or `0` if it was never read.
    pub fn path_generation(&self, path: &Path) -> u64 {
        self.paths.generation(&normalize_path(path))
    }

    /// Returns the content key for `(path, range)` and requests a read if needed.
    ///
    /// With a deadline, blocks until the contents of the current generation are stored or the
    /// deadline passes.
    pub fn key_from_path_range(
        &self,
        access: &Access,
        path: &Path,
        range: Range<u64>,
        deadline: Option<Instant>,
    ) -> ContentKey {
        let path = normalize_path(path);
        let content_key = self.normalized_content_key(&path, &range);
        let generation = self.paths.generation(&path);
        let key = FileRangeKey {
            path,
            range,
            content_key,
        };
        let params = LookupParams::new(generation)
            .deadline(deadline)
            .wait_for_fresh();
        self.artifacts
            .lookup(access, &self.producer, &key, params);
        content_key
    }

    /// Returns the newest stored contents of `(path, range)`.
    pub fn data_from_path_range(
        &self,
        access: &Access,
        path: &Path,
        range: Range<u64>,
        deadline: Option<Instant>,
    ) -> Option<Bytes> {
        let key = self.key_from_path_range(access, path, range, deadline);
        let hash = self.store.hash_from_key(key, 0);
        self.store.data_from_hash(access, hash)
    }

    /// Bumps the generation of every tracked path whose file changed on disk.
    pub fn tick(&self) {
        let recorded = self
            .paths
            .entries
            .filter_map_all(|entry| Some((entry.path.clone(), entry.modified)));

        let changed: Vec<_> = recorded
            .into_par_iter()
            .filter_map(|(path, modified)| {
                let metadata = fs::metadata(&path).ok();
                let current = metadata.as_ref().and_then(|m| m.modified().ok());
                (current != modified).then(|| {
                    let size = metadata.map_or(0, |m| m.len());
                    (path, modified, current, size)
                })
            })
            .collect();

        for (path, seen, current, size) in changed {
            let (slot, stripe) = self.paths.entries.locate(path.as_path());
            let mut entries = stripe.write();
            if let Some(entry) = entries.find_mut(slot, |entry| entry.path == path) {
                // a read may have recorded the new stamp in the meantime
                if entry.modified == seen {
                    entry.modified = current;
                    entry.size = size;
                    entry.generation += 1;
                    tracing::trace!(
                        path = %path.display(),
                        generation = entry.generation,
                        "file changed",
                    );
                    metric!(counter("files.generation_bumped") += 1);
                }
            }
        }
    }
}
