//! The two support interners: tag name → id and content hash → id.
//!
//! Both are thin get-or-create lookups through user-configurable SQL with
//! process-local caches in front, so each distinct key hits the store
//! once. Reverse caches are populated only by reverse lookups.

use crate::confwatch::{ConfWatcher, WatchTarget};
use crate::error::{Error, Result};
use crate::tags::{TagId, TagSource};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use storage::SwapPool;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct InternerQueries {
    pub tag_get_id: String,
    pub tag_get_name: String,
    pub hash_get_id: String,
    pub hash_get_hash: String,
}

impl Default for InternerQueries {
    fn default() -> Self {
        InternerQueries {
            tag_get_id: storage::queries::TAG_GET_ID.into(),
            tag_get_name: storage::queries::TAG_GET_NAME.into(),
            hash_get_id: storage::queries::HASH_GET_ID.into(),
            hash_get_hash: storage::queries::HASH_GET_HASH.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InternerConf {
    pub database: String,
    pub queries: InternerQueries,
}

#[derive(Debug, Default, Deserialize)]
struct RawQueries {
    #[serde(default, rename = "get-tag-id")]
    get_tag_id: String,
    #[serde(default, rename = "get-tag-name")]
    get_tag_name: String,
    #[serde(default, rename = "get-hash-id")]
    get_hash_id: String,
    #[serde(default, rename = "get-hash")]
    get_hash: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawConf {
    #[serde(default)]
    database: String,
    #[serde(default)]
    queries: RawQueries,
}

struct ConfTarget;

#[async_trait]
impl WatchTarget for ConfTarget {
    type Raw = RawConf;
    type Conf = InternerConf;

    async fn convert(&self, raw: RawConf) -> Result<InternerConf> {
        let mut queries = InternerQueries::default();
        if !raw.queries.get_tag_id.is_empty() {
            queries.tag_get_id = raw.queries.get_tag_id;
        }
        if !raw.queries.get_tag_name.is_empty() {
            queries.tag_get_name = raw.queries.get_tag_name;
        }
        if !raw.queries.get_hash_id.is_empty() {
            queries.hash_get_id = raw.queries.get_hash_id;
        }
        if !raw.queries.get_hash.is_empty() {
            queries.hash_get_hash = raw.queries.get_hash;
        }
        Ok(InternerConf {
            database: raw.database,
            queries,
        })
    }

    fn merge(&self, mut acc: InternerConf, next: InternerConf) -> Result<InternerConf> {
        if !next.database.is_empty() {
            acc.database = next.database;
        }
        acc.queries = next.queries;
        Ok(acc)
    }
}

/// Loads the interner configuration from a file or directory of
/// documents; a one-shot read, the interners do not live-reload.
pub async fn load_conf(path: &Path) -> Result<InternerConf> {
    let watcher = ConfWatcher::new(path, Arc::new(ConfTarget));
    watcher.check().await?;
    let conf = watcher
        .get()
        .ok_or_else(|| Error::Config("no interner configuration loaded".into()))?;
    if conf.database.is_empty() {
        return Err(Error::Config("missing database".into()));
    }
    Ok(InternerConf::clone(&conf))
}

/// The tag interner.
pub struct TagManager {
    db: SwapPool,
    get_id_sql: String,
    get_name_sql: String,
    cache: RwLock<HashMap<String, TagId>>,
    ncache: RwLock<HashMap<TagId, String>>,
    closed: AtomicBool,
}

impl TagManager {
    pub async fn connect(conf: &InternerConf) -> Result<Arc<Self>> {
        let pool = storage::connect_with_queries(
            &conf.database,
            vec![conf.queries.tag_get_id.clone(), conf.queries.tag_get_name.clone()],
        )
        .await
        .map_err(|err| Error::Transient(err.to_string()))?;
        Ok(Self::with_pool(pool, &conf.queries))
    }

    /// Builds over an existing pool; tests share one store this way.
    pub fn with_pool(pool: sqlx::SqlitePool, queries: &InternerQueries) -> Arc<Self> {
        let db = SwapPool::new();
        db.set(pool);
        Arc::new(TagManager {
            db,
            get_id_sql: queries.tag_get_id.clone(),
            get_name_sql: queries.tag_get_name.clone(),
            cache: RwLock::new(HashMap::new()),
            ncache: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn pool(&self) -> Result<Arc<sqlx::SqlitePool>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        self.db
            .get()
            .ok_or_else(|| Error::Transient("no pool".into()))
    }
}

#[async_trait]
impl TagSource for TagManager {
    async fn get(&self, name: &str) -> Result<TagId> {
        let folded = name.trim().to_lowercase();
        if folded.is_empty() {
            return Err(Error::Config("empty tag".into()));
        }
        if let Some(id) = self.cache.read().expect("tag cache poisoned").get(&folded) {
            return Ok(*id);
        }
        let pool = self.pool()?;
        let id: i64 = sqlx::query_scalar(&self.get_id_sql)
            .bind(&folded)
            .fetch_one(pool.as_ref())
            .await?;
        debug!(tag = %folded, id, "tag interned");
        self.cache
            .write()
            .expect("tag cache poisoned")
            .insert(folded, id as TagId);
        Ok(id as TagId)
    }

    async fn name(&self, id: TagId) -> Result<String> {
        if id == 0 {
            return Err(Error::Config("empty id".into()));
        }
        if let Some(name) = self.ncache.read().expect("tag cache poisoned").get(&id) {
            return Ok(name.clone());
        }
        let pool = self.pool()?;
        let name: String = sqlx::query_scalar(&self.get_name_sql)
            .bind(id as i64)
            .fetch_one(pool.as_ref())
            .await?;
        self.ncache
            .write()
            .expect("tag cache poisoned")
            .insert(id, name.clone());
        Ok(name)
    }
}

/// Maps content hashes to 64-bit ids and back.
#[async_trait]
pub trait HashSource: Send + Sync {
    async fn get_id(&self, hash: &str) -> Result<u64>;
    async fn get_hash(&self, id: u64) -> Result<String>;
}

/// The hash interner.
pub struct HashManager {
    db: SwapPool,
    get_id_sql: String,
    get_hash_sql: String,
    cache: RwLock<HashMap<String, u64>>,
    hcache: RwLock<HashMap<u64, String>>,
    closed: AtomicBool,
}

impl HashManager {
    pub async fn connect(conf: &InternerConf) -> Result<Arc<Self>> {
        let pool = storage::connect_with_queries(
            &conf.database,
            vec![conf.queries.hash_get_id.clone(), conf.queries.hash_get_hash.clone()],
        )
        .await
        .map_err(|err| Error::Transient(err.to_string()))?;
        Ok(Self::with_pool(pool, &conf.queries))
    }

    pub fn with_pool(pool: sqlx::SqlitePool, queries: &InternerQueries) -> Arc<Self> {
        let db = SwapPool::new();
        db.set(pool);
        Arc::new(HashManager {
            db,
            get_id_sql: queries.hash_get_id.clone(),
            get_hash_sql: queries.hash_get_hash.clone(),
            cache: RwLock::new(HashMap::new()),
            hcache: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn pool(&self) -> Result<Arc<sqlx::SqlitePool>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        self.db
            .get()
            .ok_or_else(|| Error::Transient("no pool".into()))
    }
}

#[async_trait]
impl HashSource for HashManager {
    async fn get_id(&self, hash: &str) -> Result<u64> {
        let folded = hash.trim().to_lowercase();
        if folded.is_empty() {
            return Err(Error::Config("empty hash".into()));
        }
        if let Some(id) = self.cache.read().expect("hash cache poisoned").get(&folded) {
            return Ok(*id);
        }
        let pool = self.pool()?;
        let id: i64 = sqlx::query_scalar(&self.get_id_sql)
            .bind(&folded)
            .fetch_one(pool.as_ref())
            .await?;
        self.cache
            .write()
            .expect("hash cache poisoned")
            .insert(folded, id as u64);
        Ok(id as u64)
    }

    async fn get_hash(&self, id: u64) -> Result<String> {
        if id == 0 {
            return Err(Error::Config("empty id".into()));
        }
        if let Some(hash) = self.hcache.read().expect("hash cache poisoned").get(&id) {
            return Ok(hash.clone());
        }
        let pool = self.pool()?;
        let hash: String = sqlx::query_scalar(&self.get_hash_sql)
            .bind(id as i64)
            .fetch_one(pool.as_ref())
            .await?;
        self.hcache
            .write()
            .expect("hash cache poisoned")
            .insert(id, hash.clone());
        Ok(hash)
    }
}

/// In-memory hash interner for tests.
#[derive(Default)]
pub struct MemHashSource {
    state: std::sync::Mutex<(HashMap<String, u64>, Vec<String>)>,
}

impl MemHashSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HashSource for MemHashSource {
    async fn get_id(&self, hash: &str) -> Result<u64> {
        let folded = hash.trim().to_lowercase();
        if folded.is_empty() {
            return Err(Error::Config("empty hash".into()));
        }
        let mut state = self.state.lock().expect("mem hash source poisoned");
        if let Some(id) = state.0.get(&folded) {
            return Ok(*id);
        }
        state.1.push(folded.clone());
        let id = state.1.len() as u64;
        state.0.insert(folded, id);
        Ok(id)
    }

    async fn get_hash(&self, id: u64) -> Result<String> {
        if id == 0 {
            return Err(Error::Config("empty id".into()));
        }
        let state = self.state.lock().expect("mem hash source poisoned");
        state
            .1
            .get(id as usize - 1)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown hash id {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pool() -> sqlx::SqlitePool {
        let pool = storage::connect("sqlite::memory:").await.unwrap();
        storage::migrate(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn tag_interner_get_or_create() {
        let tm = TagManager::with_pool(pool().await, &InternerQueries::default());
        let a = tm.get(" Sun ").await.unwrap();
        let b = tm.get("sun").await.unwrap();
        let c = tm.get("mountain").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(tm.name(a).await.unwrap(), "sun");
        assert!(tm.get("").await.is_err());
    }

    #[tokio::test]
    async fn tag_interner_shutdown_sentinel() {
        let tm = TagManager::with_pool(pool().await, &InternerQueries::default());
        tm.close();
        assert!(matches!(tm.get("sun").await, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn hash_interner_round_trip() {
        let hm = HashManager::with_pool(pool().await, &InternerQueries::default());
        let id = hm.get_id("ABCDEF").await.unwrap();
        assert_eq!(hm.get_id("abcdef").await.unwrap(), id);
        assert_eq!(hm.get_hash(id).await.unwrap(), "abcdef");
    }
}
