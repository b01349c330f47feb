//! Tool-response cache keyed by tool name and arguments.

use crate::settings::CacheStorage;
use powersearch_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

/// On-disk store: one JSON file per key under `<root>/<k[0..2]>/<k[2..4]>/<k>.json`.
#[derive(Debug, Clone)]
pub struct FsCache {
    root: PathBuf,
}

impl FsCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path(&self, key: &str) -> PathBuf {
        let a = key.get(0..2).unwrap_or("00");
        let b = key.get(2..4).unwrap_or("00");
        self.root.join(a).join(b).join(format!("{key}.json"))
    }

    fn get(&self, key: &str) -> Result<Option<(u64, serde_json::Value)>> {
        let p = self.path(key);
        if !p.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&p).map_err(|e| Error::Cache(e.to_string()))?;
        let v: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| Error::Cache(e.to_string()))?;
        let stored_at = v
            .get("stored_at_epoch_s")
            .and_then(|x| x.as_u64())
            .unwrap_or(0);
        Ok(v.get("payload").cloned().map(|payload| (stored_at, payload)))
    }

    fn put(&self, key: &str, stored_at: u64, payload: &serde_json::Value) -> Result<()> {
        let p = self.path(key);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Cache(e.to_string()))?;
        }
        let doc = serde_json::json!({
            "schema_version": 1,
            "stored_at_epoch_s": stored_at,
            "payload": payload,
        });
        fs::write(
            &p,
            serde_json::to_vec(&doc).map_err(|e| Error::Cache(e.to_string()))?,
        )
        .map_err(|e| Error::Cache(e.to_string()))
    }
}

#[derive(Debug, Clone)]
enum Store {
    Memory(Arc<Mutex<HashMap<String, (u64, serde_json::Value)>>>),
    Disk(FsCache),
    Null,
}

/// Cache for successful tool payloads. A TTL of zero keeps entries forever.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    store: Store,
    ttl_s: u64,
}

impl ResponseCache {
    pub fn new(storage: &CacheStorage, ttl_s: u64) -> Self {
        let store = match storage {
            CacheStorage::Memory => Store::Memory(Arc::new(Mutex::new(HashMap::new()))),
            CacheStorage::Null => Store::Null,
            CacheStorage::File(root) => Store::Disk(FsCache::new(root.clone())),
        };
        Self { store, ttl_s }
    }

    pub fn backend(&self) -> &'static str {
        match self.store {
            Store::Memory(_) => "memory",
            Store::Disk(_) => "file",
            Store::Null => "null",
        }
    }

    /// Deterministic key over the tool name and its (canonicalized) arguments.
    pub fn key_for(tool: &str, args: &serde_json::Value) -> String {
        let mut h = Sha256::new();
        h.update(b"tool:");
        h.update(tool.as_bytes());
        h.update(b"\nargs:");
        // serde_json maps are sorted, so this is stable for equal arguments.
        h.update(args.to_string().as_bytes());
        hex::encode(h.finalize())
    }

    fn fresh(&self, stored_at: u64) -> bool {
        self.ttl_s == 0 || now_epoch_s().saturating_sub(stored_at) <= self.ttl_s
    }

    fn lock_memory<'a>(
        m: &'a Mutex<HashMap<String, (u64, serde_json::Value)>>,
    ) -> Result<std::sync::MutexGuard<'a, HashMap<String, (u64, serde_json::Value)>>> {
        m.lock()
            .map_err(|_| Error::Cache("memory cache lock poisoned".to_string()))
    }

    /// Stale memory entries are evicted when looked up.
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let hit = match &self.store {
            Store::Null => None,
            Store::Memory(m) => {
                let mut guard = Self::lock_memory(m)?;
                let stale = guard
                    .get(key)
                    .is_some_and(|(stored_at, _)| !self.fresh(*stored_at));
                if stale {
                    guard.remove(key);
                    None
                } else {
                    guard.get(key).cloned()
                }
            }
            Store::Disk(fs_cache) => {
                let fs_cache = fs_cache.clone();
                let key = key.to_string();
                tokio::task::spawn_blocking(move || fs_cache.get(&key))
                    .await
                    .map_err(|e| Error::Cache(format!("cache get join failed: {e}")))??
            }
        };
        Ok(hit.and_then(|(stored_at, v)| self.fresh(stored_at).then_some(v)))
    }

    /// Writing to the memory store also prunes every expired entry.
    pub async fn put(&self, key: &str, payload: &serde_json::Value) -> Result<()> {
        let now = now_epoch_s();
        match &self.store {
            Store::Null => Ok(()),
            Store::Memory(m) => {
                let mut guard = Self::lock_memory(m)?;
                guard.retain(|_, (stored_at, _)| self.fresh(*stored_at));
                guard.insert(key.to_string(), (now, payload.clone()));
                Ok(())
            }
            Store::Disk(fs_cache) => {
                let fs_cache = fs_cache.clone();
                let key = key.to_string();
                let payload = payload.clone();
                tokio::task::spawn_blocking(move || fs_cache.put(&key, now, &payload))
                    .await
                    .map_err(|e| Error::Cache(format!("cache put join failed: {e}")))?
            }
        }
    }

    #[cfg(test)]
    fn memory_keys(&self) -> Vec<String> {
        match &self.store {
            Store::Memory(m) => Self::lock_memory(m)
                .map(|g| g.keys().cloned().collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    #[cfg(test)]
    async fn put_at(&self, key: &str, stored_at: u64, payload: &serde_json::Value) -> Result<()> {
        match &self.store {
            Store::Memory(m) => {
                Self::lock_memory(m)?.insert(key.to_string(), (stored_at, payload.clone()));
                Ok(())
            }
            Store::Disk(fs_cache) => fs_cache.put(key, stored_at, payload),
            Store::Null => Ok(()),
        }
    }
}
