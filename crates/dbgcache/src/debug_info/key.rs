//! Derivation of [`DebugInfoKey`]s from debug info files.

use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use symbolic::common::{ByteView, DebugId};
use symbolic::debuginfo::{Archive, FileFormat};

/// Identifies a debug info file independently of where it is stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DebugInfoKey(pub u128);

impl DebugInfoKey {
    pub const ZERO: Self = Self(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DebugInfoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Computes the key for the debug info at `path`.
///
/// Up to date object files carrying a debug id (PDB GUIDs, ELF build ids, Mach-O UUIDs) are
/// identified by it, so the same file found in two places shares a key. Everything else is
/// identified by its path and `min_timestamp`.
pub(super) fn derive_key(path: &Path, min_timestamp: SystemTime) -> DebugInfoKey {
    let fresh = std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .is_ok_and(|modified| modified >= min_timestamp);
    if fresh {
        if let Some(debug_id) = read_debug_id(path) {
            return DebugInfoKey(debug_id.uuid().as_u128());
        }
    }
    fallback_key(path, min_timestamp)
}

/// Reads the debug id of the first object in the file at `path`.
fn read_debug_id(path: &Path) -> Option<DebugId> {
    let view = match ByteView::open(path) {
        Ok(view) => view,
        Err(error) => {
            tracing::trace!(path = %path.display(), %error, "failed to map debug info");
            return None;
        }
    };
    if Archive::peek(&view) == FileFormat::Unknown {
        return None;
    }

    let archive = match Archive::parse(&view) {
        Ok(archive) => archive,
        Err(error) => {
            tracing::trace!(path = %path.display(), %error, "failed to parse debug info");
            return None;
        }
    };
    let debug_id = match archive.objects().next()? {
        Ok(object) => object.debug_id(),
        Err(error) => {
            tracing::trace!(path = %path.display(), %error, "failed to parse object");
            return None;
        }
    };
    (!debug_id.is_nil()).then_some(debug_id)
}

fn fallback_key(path: &Path, min_timestamp: SystemTime) -> DebugInfoKey {
    let nanos = min_timestamp
        .duration_since(UNIX_EPOCH)
        .map_or(0, |since| since.as_nanos());
    let mut hasher = blake3::Hasher::new();
    hasher.update(path.as_os_str().as_encoded_bytes());
    hasher.update(&nanos.to_le_bytes());
    let mut bytes = [0; 16];
    bytes.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    DebugInfoKey(u128::from_le_bytes(bytes))
}
