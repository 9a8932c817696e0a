//! Caching of built navigation packages.
//!
//! Packages are keyed by a fingerprint of the input path and the options
//! that affect matching. Lookups go through a small in-memory LRU first and
//! then an optional durable store. Stored bytes are opaque JSON; anything
//! that fails to parse is treated as a miss.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use lru::LruCache;
use serde::Serialize;

use crate::types::{GeoPoint, NavPackage};

pub const KEY_PREFIX: &str = "navpkg_";
pub const MEMORY_CAPACITY: usize = 4;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |hash, &b| (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME))
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

/// Everything that changes the result of a build.
#[derive(Debug, Serialize)]
pub struct FingerprintInput<'a> {
    pub coords: Vec<[f64; 2]>,
    pub profile: &'a str,
    pub radius: f64,
    pub max_gap: f64,
    pub bearing_threshold: f64,
    pub downsample: f64,
    pub voice_units: &'a str,
    pub language: &'a str,
    pub tidy: bool,
    pub max_points: usize,
    pub dedupe: f64,
    pub chunk_overlap: usize,
    pub assume_speed: f64,
    pub waypoint_names: &'a [String],
}

impl FingerprintInput<'_> {
    /// Coordinates are rounded to 6 decimals so float noise does not split keys.
    pub fn rounded_coords(points: &[GeoPoint]) -> Vec<[f64; 2]> {
        points.iter().map(|p| [round6(p.latitude), round6(p.longitude)]).collect()
    }

    pub fn key(&self) -> String {
        // Serializing plain numbers and strings cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        format!("{KEY_PREFIX}{:016x}", fnv1a64(&json))
    }
}

/// Durable key/value storage for serialized packages.
pub trait PackageStore: Send + Sync {
    fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
    fn save(&self, key: &str, bytes: &[u8]) -> io::Result<()>;
}

/// One JSON file per key in a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl PackageStore for FileStore {
    fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        // Write then rename so a crash never leaves a half-written entry
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(tmp, path)
    }
}

/// Process-local store, mainly for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PackageStore for MemoryStore {
    fn load(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| io::Error::other("store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| io::Error::other("store lock poisoned"))?;
        entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Two-level package cache: in-memory LRU in front of an optional store.
pub struct PackageCache {
    memory: Mutex<LruCache<String, NavPackage>>,
    store: Option<Arc<dyn PackageStore>>,
}

impl Default for PackageCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PackageCache {
    pub fn new(store: Option<Arc<dyn PackageStore>>) -> Self {
        Self::with_capacity(MEMORY_CAPACITY, store)
    }

    pub fn with_capacity(capacity: usize, store: Option<Arc<dyn PackageStore>>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            store,
        }
    }

    pub fn get(&self, key: &str) -> Option<NavPackage> {
        if let Ok(mut memory) = self.memory.lock() {
            if let Some(pkg) = memory.get(key) {
                debug!("cache hit (memory) {key}");
                return Some(pkg.clone());
            }
        }

        let store = self.store.as_ref()?;
        let bytes = match store.load(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!("cache read failed for {key}: {e}");
                return None;
            }
        };
        match serde_json::from_slice::<NavPackage>(&bytes) {
            Ok(pkg) => {
                debug!("cache hit (store) {key}");
                if let Ok(mut memory) = self.memory.lock() {
                    memory.put(key.to_string(), pkg.clone());
                }
                Some(pkg)
            }
            Err(e) => {
                warn!("ignoring corrupt cache entry {key}: {e}");
                None
            }
        }
    }

    pub fn put(&self, key: &str, pkg: &NavPackage) {
        if let Ok(mut memory) = self.memory.lock() {
            memory.put(key.to_string(), pkg.clone());
        }
        let Some(store) = self.store.as_ref() else {
            return;
        };
        match serde_json::to_vec(pkg) {
            Ok(bytes) => {
                if let Err(e) = store.save(key, &bytes) {
                    warn!("cache write failed for {key}: {e}");
                }
            }
            Err(e) => warn!("could not serialize package {key}: {e}"),
        }
    }

    pub fn memory_len(&self) -> usize {
        self.memory.lock().map(|m| m.len()).unwrap_or(0)
    }
}
