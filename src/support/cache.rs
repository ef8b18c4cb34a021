//! Process-wide LRU cache of parsed JSON documents.
//!
//! Template and configuration files are shared by many stations; the cache
//! keys parsed documents by content hash so stations started from the same
//! file never parse it twice.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};

const DEFAULT_CAPACITY: usize = 128;

/// A document loaded through the cache: its content hash and parsed form.
#[derive(Debug, Clone)]
pub struct CachedDocument {
    pub hash: String,
    pub document: Arc<Value>,
}

/// LRU cache keyed by content hash.
pub struct FileCache {
    documents: Mutex<LruCache<String, Arc<Value>>>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            documents: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Read `path`, hash its content, and return the parsed document,
    /// reusing the cached parse when the content is unchanged.
    pub fn load(&self, path: &Path) -> std::io::Result<CachedDocument> {
        let content = std::fs::read(path)?;
        let hash = hex::encode(Sha256::digest(&content));

        if let Some(document) = self.documents.lock().unwrap().get(&hash) {
            return Ok(CachedDocument {
                hash,
                document: document.clone(),
            });
        }

        let document: Arc<Value> = Arc::new(serde_json::from_slice(&content).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?);
        self.documents
            .lock()
            .unwrap()
            .put(hash.clone(), document.clone());
        Ok(CachedDocument { hash, document })
    }
}

impl Default for FileCache {
    fn default() -> Self {
        Self::new()
    }
}
