//! On-disk cache of translated modules.
//!
//! Each module is stored as two files under the cache root:
//!
//! - `<name>.obj`: `PIP2` magic, format version, populate offset, code
//!   length and the code bytes, integers little endian
//! - `<name>.obj.meta`: JSON [`CacheMetadata`]
//!
//! Nothing here is fatal. Unreadable or stale entries are misses and
//! failed writes are logged.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::vm::services::Service;

const MAGIC: &[u8; 4] = b"PIP2";
pub const FORMAT_VERSION: u32 = 2;
const HEADER_LEN: usize = 16;

/// Sidecar describing a cached object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub format_version: u32,
    pub uses_task_subsystem: bool,
    /// Services the code calls; their trampolines are built on load.
    #[serde(default)]
    pub services: BTreeSet<Service>,
    #[serde(default)]
    pub function_count: usize,
    /// Hash of the image, pool and codegen options the code was built from.
    pub fingerprint: u64,
}

/// Translated code as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedObject {
    pub code: Vec<u8>,
    pub populate_offset: u32,
    pub metadata: CacheMetadata,
}

pub struct ObjectCache {
    root: PathBuf,
}

impl ObjectCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.obj"))
    }

    pub fn metadata_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.obj.meta"))
    }

    /// Read a cached module. Any problem is a miss.
    pub fn load(&self, name: &str) -> Option<CachedObject> {
        let meta_text = fs::read_to_string(self.metadata_path(name)).ok()?;
        let metadata: CacheMetadata = match serde_json::from_str(&meta_text) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(module = name, error = %err, "ignoring unreadable cache metadata");
                return None;
            }
        };
        if metadata.format_version != FORMAT_VERSION {
            return None;
        }

        let bytes = fs::read(self.object_path(name)).ok()?;
        let Some((populate_offset, code)) = decode_object(&bytes) else {
            warn!(module = name, "ignoring malformed cache object");
            return None;
        };
        Some(CachedObject {
            code: code.to_vec(),
            populate_offset,
            metadata,
        })
    }

    /// Write a module. Failures are logged and otherwise ignored.
    pub fn store(&self, name: &str, object: &CachedObject) {
        match self.try_store(name, object) {
            Ok(()) => info!(module = name, bytes = object.code.len(), "cached translated module"),
            Err(err) => warn!(module = name, error = %err, "failed to write cache entry"),
        }
    }

    fn try_store(&self, name: &str, object: &CachedObject) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.object_path(name), encode_object(object))?;
        let meta = serde_json::to_string_pretty(&object.metadata).map_err(io::Error::other)?;
        fs::write(self.metadata_path(name), meta)
    }
}

fn encode_object(object: &CachedObject) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + object.code.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&object.populate_offset.to_le_bytes());
    bytes.extend_from_slice(&(object.code.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&object.code);
    bytes
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes(raw.try_into().ok()?))
}

/// Populate offset and code of an object file.
fn decode_object(bytes: &[u8]) -> Option<(u32, &[u8])> {
    if bytes.get(..4)? != MAGIC || read_u32(bytes, 4)? != FORMAT_VERSION {
        return None;
    }
    let populate_offset = read_u32(bytes, 8)?;
    let len = read_u32(bytes, 12)? as usize;
    let code = bytes.get(HEADER_LEN..HEADER_LEN.checked_add(len)?)?;
    if code.is_empty() || populate_offset as usize >= code.len() {
        return None;
    }
    Some((populate_offset, code))
}
