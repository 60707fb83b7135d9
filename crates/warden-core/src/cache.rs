//! Advisory cross-policy enumeration cache.
//!
//! Policies in one run frequently enumerate the same resource type; the
//! cache memoizes those results with a TTL so sibling policies skip the
//! repeat API calls. Writes are advisory and readers always tolerate a
//! miss. Keys carry account and region to prevent cross-account pollution.
//! Readers receive a snapshot; nothing hands out references into the map.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;

/// Key for one cached enumeration result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub account: String,
    pub region: String,
    pub resource_type: String,
    /// Stable digest of the enumeration query parameters.
    pub query: String,
}

impl CacheKey {
    pub fn new(
        account: impl Into<String>,
        region: impl Into<String>,
        resource_type: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
            resource_type: resource_type.into(),
            query: query.into(),
        }
    }

    fn as_string(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.account, self.region, self.resource_type, self.query
        )
    }
}

struct Entry {
    stored: Instant,
    value: Vec<Value>,
}

/// In-process TTL cache. Concurrent-safe; all reads are snapshots.
pub struct Cache {
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, Entry>>,
}

impl Cache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// A cache that never hits, for callers that opted out.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Snapshot of the cached value, if present and fresh.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<Value>> {
        if self.ttl.is_zero() {
            return None;
        }
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.stored.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, key: CacheKey, value: Vec<Value>) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.write().insert(
            key,
            Entry {
                stored: Instant::now(),
                value,
            },
        );
    }

    /// Drop entries older than the TTL.
    pub fn sweep(&self) {
        let ttl = self.ttl;
        self.entries
            .write()
            .retain(|_, e| e.stored.elapsed() <= ttl);
    }

    /// Best-effort persistence to a JSON file. Ages are not preserved:
    /// loaded entries restart their TTL, which errs on the fresh side but
    /// keeps the format trivial.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let entries = self.entries.read();
        let doc: HashMap<String, &Vec<Value>> = entries
            .iter()
            .map(|(k, e)| (k.as_string(), &e.value))
            .collect();
        let data = serde_json::to_vec(&doc)?;
        fs::write(path, data)
    }

    /// Best-effort load; unparseable files are ignored.
    pub fn load(&self, path: &Path) {
        let Ok(data) = fs::read(path) else { return };
        let Ok(doc) = serde_json::from_slice::<HashMap<String, Vec<Value>>>(&data) else {
            return;
        };
        let mut entries = self.entries.write();
        for (key, value) in doc {
            let mut parts = key.splitn(4, '/');
            let (Some(account), Some(region), Some(rtype), Some(query)) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            entries.insert(
                CacheKey::new(account, region, rtype, query),
                Entry {
                    stored: Instant::now(),
                    value,
                },
            );
        }
    }
}
