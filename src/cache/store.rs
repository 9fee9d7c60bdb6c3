//! Two-tier blob store: bounded in-memory LRU over a directory of files.
//!
//! # Design Decisions
//! - One `RwLock` per store: lookups share it, writes are exclusive
//! - Memory hits do not bump LRU recency unless the write lock is free;
//!   lookups never wait for it
//! - Entries carry their write time; freshness is checked on read and
//!   nothing is swept
//! - Files are named `<namespace>_<sha256(key)>` under the cache directory

use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use lru::LruCache;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cache encode error: {0}")]
    Encode(#[source] bincode::Error),

    #[error("cache decode error: {0}")]
    Decode(#[source] bincode::Error),

    #[error("cache worker panicked: {0}")]
    Panicked(String),
}

/// Key-value storage behind the response cache.
///
/// Calls may block on file I/O; async callers run them on the blocking pool.
pub trait Store: Send + Sync {
    /// Fresh value for `key`, or `None` if absent or older than `ttl`.
    fn get(&self, namespace: &str, key: &str, ttl: Duration) -> Result<Option<Bytes>, CacheError>;

    fn set(&self, namespace: &str, key: &str, data: Bytes) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
struct MemEntry {
    written: SystemTime,
    data: Bytes,
}

pub struct DiskStore {
    dir: PathBuf,
    mem: RwLock<LruCache<String, MemEntry>>,
}

fn is_fresh(written: SystemTime, ttl: Duration) -> bool {
    let age = SystemTime::now()
        .duration_since(written)
        .unwrap_or(Duration::ZERO);
    age.as_secs() < ttl.as_secs()
}

fn mem_key(namespace: &str, key: &str) -> String {
    format!("{namespace}:{key}")
}

impl DiskStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, mem_items: usize) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let capacity = NonZeroUsize::new(mem_items).unwrap_or(NonZeroUsize::MIN);
        tracing::info!(dir = %dir.display(), mem_items = capacity.get(), "Cache store opened");
        Ok(Self {
            dir,
            mem: RwLock::new(LruCache::new(capacity)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// On-disk location of `key`. Both parts are hex so no vhost name can
    /// leave the cache directory.
    pub fn file_name(&self, namespace: &str, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir
            .join(format!("{}_{}", hex::encode(namespace), hex::encode(digest)))
    }

    pub fn mem_len(&self) -> usize {
        self.mem.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn read_file(&self, path: &Path, ttl: Duration) -> Result<Option<MemEntry>, CacheError> {
        let written = match fs::metadata(path) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !is_fresh(written, ttl) {
            return Ok(None);
        }
        let data = fs::read(path)?;
        Ok(Some(MemEntry {
            written,
            data: Bytes::from(data),
        }))
    }
}

impl Store for DiskStore {
    fn get(&self, namespace: &str, key: &str, ttl: Duration) -> Result<Option<Bytes>, CacheError> {
        let mkey = mem_key(namespace, key);

        let from_disk = {
            let mem = self.mem.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = mem.peek(&mkey) {
                if is_fresh(entry.written, ttl) {
                    let data = entry.data.clone();
                    drop(mem);
                    if let Ok(mut mem) = self.mem.try_write() {
                        mem.promote(&mkey);
                    }
                    return Ok(Some(data));
                }
            }
            self.read_file(&self.file_name(namespace, key), ttl)?
        };

        match from_disk {
            Some(entry) => {
                let data = entry.data.clone();
                self.mem
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .put(mkey, entry);
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    fn set(&self, namespace: &str, key: &str, data: Bytes) -> Result<(), CacheError> {
        let path = self.file_name(namespace, key);
        let mut mem = self.mem.write().unwrap_or_else(PoisonError::into_inner);

        fs::write(&path, &data)?;
        let written = fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());
        mem.put(mem_key(namespace, key), MemEntry { written, data });
        Ok(())
    }
}
