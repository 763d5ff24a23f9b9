//! The merge stage: folds file rows sharing a content hash into one
//! merged record, applies the ordered tag rules, and keeps the merged
//! table eventually consistent through periodic full and poll cycles.

pub mod conf;

pub use conf::{Conf, MergeQueries};

use crate::confwatch::{ConfWatcher, WatchTarget};
use crate::error::{Error, Result};
use crate::tags::{TagSet, TagSource};
use conf::{UC_BLOCK_TAGS, UC_DB_CONN, UC_DB_QUERY, UC_TAG_RULES};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use storage::SwapPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One merged record, keyed by interned hash id.
#[derive(Debug, Default)]
struct MergedRec {
    /// Merged-table row id; 0 until inserted.
    id: i64,
    hid: u64,
    /// Union of contributing file tags plus rule-derived tags.
    tags: TagSet,
    blocked: bool,
    /// Contributing enabled file rows and their current tags.
    files: HashMap<i64, TagSet>,
    disabled: bool,
    changed: bool,
}

#[derive(Default)]
struct MergeCache {
    hashes: HashMap<u64, MergedRec>,
    /// Hash ids touched by the last poll query.
    poll_changed: HashSet<u64>,
}

pub struct Merger {
    inner: Arc<Inner>,
}

struct Inner {
    tm: Arc<dyn TagSource>,
    db: SwapPool,
    conf: RwLock<Option<Arc<Conf>>>,
    cache: tokio::sync::Mutex<MergeCache>,
    closed: AtomicBool,
    cancel: CancellationToken,
    watcher: OnceLock<Arc<ConfWatcher<Target>>>,
}

struct Target {
    inner: Weak<Inner>,
}

#[async_trait::async_trait]
impl WatchTarget for Target {
    type Raw = conf::RawConf;
    type Conf = Conf;

    async fn convert(&self, raw: conf::RawConf) -> Result<Conf> {
        let inner = self.inner.upgrade().ok_or(Error::Shutdown)?;
        conf::convert(raw, inner.tm.as_ref()).await
    }

    fn merge(&self, acc: Conf, next: Conf) -> Result<Conf> {
        conf::merge(acc, next)
    }

    fn changed(&self, prev: &Conf, next: &Conf) -> bool {
        prev != next
    }

    async fn notify(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.notify_conf().await;
        }
    }
}

impl Merger {
    pub async fn new(
        conf_path: impl Into<PathBuf>,
        tm: Arc<dyn TagSource>,
        cancel: CancellationToken,
    ) -> Result<Merger> {
        let inner = Arc::new(Inner {
            tm,
            db: SwapPool::new(),
            conf: RwLock::new(None),
            cache: tokio::sync::Mutex::new(MergeCache::default()),
            closed: AtomicBool::new(false),
            cancel,
            watcher: OnceLock::new(),
        });

        let watcher = Arc::new(ConfWatcher::new(
            conf_path,
            Arc::new(Target {
                inner: Arc::downgrade(&inner),
            }),
        ));
        let _ = inner.watcher.set(Arc::clone(&watcher));

        watcher.check().await?;
        let loaded = watcher
            .get()
            .ok_or_else(|| Error::Config("no configuration loaded".into()))?;
        conf::check(&loaded, None)?;

        let pool = storage::connect_with_queries(&loaded.database, loaded.queries.prepare_list())
            .await
            .map_err(|err| Error::Transient(err.to_string()))?;
        inner.db.set(pool);
        *inner.conf.write().expect("conf cell poisoned") = Some(Arc::clone(&loaded));

        Ok(Merger { inner })
    }

    /// Runs the first full cycle, then starts the watcher and the
    /// poll/full timers.
    pub async fn start(&self) -> Result<()> {
        self.inner.do_full().await?;
        if let Some(watcher) = self.inner.watcher.get() {
            Arc::clone(watcher).start(self.inner.cancel.clone());
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.loopy().await;
        });
        Ok(())
    }

    /// One full cycle, awaited; test and tooling entry point.
    pub async fn run_full(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        self.inner.do_full().await
    }

    /// One poll cycle, awaited; test and tooling entry point.
    pub async fn run_poll(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        self.inner.do_poll().await
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();
    }
}

impl Inner {
    fn get_conf(&self) -> Result<Arc<Conf>> {
        self.conf
            .read()
            .expect("conf cell poisoned")
            .clone()
            .ok_or_else(|| Error::Config("no configuration loaded".into()))
    }

    fn pool(&self) -> Result<Arc<sqlx::SqlitePool>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        self.db
            .get()
            .ok_or_else(|| Error::Transient("no pool".into()))
    }

    async fn notify_conf(self: Arc<Self>) {
        let Some(watcher) = self.watcher.get() else {
            return;
        };
        let Some(co) = watcher.get() else {
            warn!("configuration notify without a loaded value");
            return;
        };
        let prev = self.conf.read().expect("conf cell poisoned").clone();
        let bits = match conf::check(&co, prev.as_deref()) {
            Ok(bits) => bits,
            Err(err) => {
                warn!(%err, "invalid configuration, keeping the previous one");
                return;
            }
        };

        // Any query change reconnects: statements prepare per
        // connection, so rebinding means a fresh pool.
        if bits & (UC_DB_CONN | UC_DB_QUERY) != 0 {
            match storage::connect_with_queries(&co.database, co.queries.prepare_list()).await {
                Ok(pool) => self.db.set(pool),
                Err(err) => {
                    warn!(%err, "reconnect failed, keeping the previous configuration");
                    return;
                }
            }
        }

        *self.conf.write().expect("conf cell poisoned") = Some(Arc::clone(&co));

        // Rules and block tags only affect rows as they change, unless a
        // full re-derives everything; so force one.
        if bits & (UC_DB_CONN | UC_DB_QUERY | UC_TAG_RULES | UC_BLOCK_TAGS) != 0 {
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = inner.do_full().await {
                    warn!(%err, "full after configuration change failed");
                }
            });
        }
        info!("merger configuration updated");
    }

    /// Full cycle: wipe the in-memory fold, seed ids from the merged
    /// table, fold every enabled file row, derive and push.
    async fn do_full(&self) -> Result<()> {
        let co = self.get_conf()?;
        let pool = self.pool()?;
        let mut ca = self.cache.lock().await;

        if !ca.hashes.is_empty() {
            info!("clearing cache for full");
        }
        ca.hashes = HashMap::new();
        ca.poll_changed.clear();

        self.select_merged(&co, &pool, &mut ca).await?;
        self.full_query(&co, &pool, &mut ca).await?;

        let mut tx = pool.begin().await?;
        let mut evict = Vec::new();
        let hids: Vec<u64> = ca.hashes.keys().copied().collect();
        for hid in hids {
            let rec = ca.hashes.get_mut(&hid).expect("hid from map");
            if !Self::derive(rec, &co) {
                // Memory-only garbage; nothing in the store to touch.
                evict.push(hid);
                continue;
            }
            if rec.changed && Self::push_hash(&co, &mut tx, rec).await? {
                evict.push(hid);
            }
        }
        tx.commit().await?;

        // Disables are committed; drop them from memory.
        for hid in evict {
            ca.hashes.remove(&hid);
        }
        for rec in ca.hashes.values_mut() {
            rec.changed = false;
        }
        debug!("full done");
        Ok(())
    }

    /// Poll cycle: fold only rows the poll query reports changed, then
    /// derive and push just those hashes.
    async fn do_poll(&self) -> Result<()> {
        let co = self.get_conf()?;
        let pool = self.pool()?;
        let mut ca = self.cache.lock().await;

        self.poll_query(&co, &pool, &mut ca).await?;
        if ca.poll_changed.is_empty() {
            return Ok(());
        }

        let mut tx = pool.begin().await?;
        let mut evict = Vec::new();
        let changed: Vec<u64> = ca.poll_changed.iter().copied().collect();
        for hid in changed {
            let Some(rec) = ca.hashes.get_mut(&hid) else {
                continue;
            };
            if !Self::derive(rec, &co) {
                evict.push(hid);
                continue;
            }
            if rec.changed && Self::push_hash(&co, &mut tx, rec).await? {
                evict.push(hid);
            }
        }
        tx.commit().await?;

        for hid in evict {
            ca.hashes.remove(&hid);
        }
        for rec in ca.hashes.values_mut() {
            rec.changed = false;
        }
        ca.poll_changed.clear();
        debug!("poll done");
        Ok(())
    }

    /// Seeds merged-table rows (ids, committed tags, blocked flags).
    async fn select_merged(
        &self,
        co: &Conf,
        pool: &sqlx::SqlitePool,
        ca: &mut MergeCache,
    ) -> Result<()> {
        let rows = sqlx::query(&co.queries.select).fetch_all(pool).await?;
        for row in rows {
            let id: i64 = row.try_get(0)?;
            let hid: i64 = row.try_get(1)?;
            let tags: String = row.try_get(2)?;
            let blocked: bool = row.try_get(3)?;
            ca.hashes.insert(
                hid as u64,
                MergedRec {
                    id,
                    hid: hid as u64,
                    tags: TagSet::from(storage::decode_tags(&tags)),
                    blocked,
                    ..Default::default()
                },
            );
        }
        Ok(())
    }

    /// Folds every enabled file row into its hash record.
    async fn full_query(
        &self,
        co: &Conf,
        pool: &sqlx::SqlitePool,
        ca: &mut MergeCache,
    ) -> Result<()> {
        let rows = sqlx::query(&co.queries.full).fetch_all(pool).await?;
        for row in rows {
            let fid: i64 = row.try_get(0)?;
            let hid: i64 = row.try_get(1)?;
            let tags: String = row.try_get(2)?;
            let rec = ca.hashes.entry(hid as u64).or_insert_with(|| MergedRec {
                hid: hid as u64,
                ..Default::default()
            });
            rec.files
                .insert(fid, TagSet::from(storage::decode_tags(&tags)));
        }
        Ok(())
    }

    /// Folds recently-updated file rows, tracking which hashes changed.
    async fn poll_query(
        &self,
        co: &Conf,
        pool: &sqlx::SqlitePool,
        ca: &mut MergeCache,
    ) -> Result<()> {
        let rows = sqlx::query(&co.queries.poll).fetch_all(pool).await?;
        for row in rows {
            let fid: i64 = row.try_get(0)?;
            let hid_raw: i64 = row.try_get(1)?;
            let tags: String = row.try_get(2)?;
            let enabled: bool = row.try_get(3)?;
            let hid = hid_raw as u64;
            let tags = TagSet::from(storage::decode_tags(&tags));

            let Some(rec) = ca.hashes.get_mut(&hid) else {
                if !enabled {
                    continue;
                }
                let mut rec = MergedRec {
                    hid,
                    ..Default::default()
                };
                rec.files.insert(fid, tags);
                ca.hashes.insert(hid, rec);
                ca.poll_changed.insert(hid);
                continue;
            };

            if !enabled {
                if rec.files.remove(&fid).is_some() {
                    ca.poll_changed.insert(hid);
                }
                continue;
            }
            match rec.files.get_mut(&fid) {
                Some(prev) => {
                    if *prev != tags {
                        *prev = tags;
                        ca.poll_changed.insert(hid);
                    }
                }
                None => {
                    rec.files.insert(fid, tags);
                    ca.poll_changed.insert(hid);
                }
            }
        }
        Ok(())
    }

    /// Recomputes a record's derived state: tag union over contributing
    /// files, ordered rule application, block check. Returns false for
    /// a record that has neither files nor a store row.
    fn derive(rec: &mut MergedRec, co: &Conf) -> bool {
        if rec.files.is_empty() {
            if rec.id == 0 {
                // Can only happen through a bookkeeping bug: nothing
                // seeded it and nothing folded into it.
                warn!(hid = rec.hid, "merged record with no files and no id");
                return false;
            }
            // Its last contributing file left the store.
            rec.changed = true;
            rec.disabled = true;
            return true;
        }

        let mut tags = TagSet::new();
        for file_tags in rec.files.values() {
            tags = tags.combine(file_tags);
        }
        tags = co.tag_rules.apply(tags);

        if tags != rec.tags {
            debug!(hid = rec.hid, "merged tags changed");
            rec.changed = true;
            rec.tags = tags;
        }
        let blocked = rec.tags.contains(&co.block_tags);
        if blocked != rec.blocked {
            debug!(hid = rec.hid, blocked, "blocked changed");
            rec.changed = true;
            rec.blocked = blocked;
        }
        true
    }

    /// Writes one changed record. Returns true when the record was
    /// disabled and should leave memory once the transaction commits.
    async fn push_hash(
        co: &Conf,
        tx: &mut Transaction<'_, Sqlite>,
        rec: &mut MergedRec,
    ) -> Result<bool> {
        if rec.disabled {
            if rec.id == 0 {
                return Err(Error::Invariant(format!(
                    "disabling merged record {} with no id",
                    rec.hid
                )));
            }
            sqlx::query(&co.queries.disable)
                .bind(rec.id)
                .execute(&mut **tx)
                .await?;
            info!(hid = rec.hid, "merged record disabled");
            return Ok(true);
        }

        if rec.id != 0 {
            sqlx::query(&co.queries.update)
                .bind(storage::encode_tags(rec.tags.as_slice()))
                .bind(rec.blocked)
                .bind(rec.id)
                .execute(&mut **tx)
                .await?;
            rec.changed = false;
            return Ok(false);
        }

        let mid: i64 = sqlx::query_scalar(&co.queries.insert)
            .bind(rec.hid as i64)
            .bind(storage::encode_tags(rec.tags.as_slice()))
            .bind(rec.blocked)
            .fetch_one(&mut **tx)
            .await?;
        rec.id = mid;
        rec.changed = false;
        Ok(false)
    }

    /// Poll/full timer loop. Poll errors back the next poll off
    /// additively; any success resets the delay. Interval changes from
    /// a reload take effect when the next deadline is armed.
    async fn loopy(self: Arc<Self>) {
        use tokio::time::Instant;

        let mut errors: u32 = 0;
        let Ok(co) = self.get_conf() else { return };
        let mut next_poll = Instant::now() + co.poll_int;
        let mut next_full = Instant::now() + co.full_int;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("merger shutting down");
                    self.db.close().await;
                    return;
                }
                _ = tokio::time::sleep_until(next_poll) => {
                    match self.do_poll().await {
                        Ok(()) => errors = 0,
                        Err(err) => {
                            errors += 1;
                            warn!(%err, errors, "poll failed, backing off");
                        }
                    }
                    if let Ok(co) = self.get_conf() {
                        next_poll = Instant::now() + co.poll_int * (errors + 1);
                    }
                }
                _ = tokio::time::sleep_until(next_full) => {
                    if let Err(err) = self.do_full().await {
                        warn!(%err, "full failed");
                    }
                    if let Ok(co) = self.get_conf() {
                        next_full = Instant::now() + co.full_int;
                    }
                }
            }
        }
    }
}
