//! The weighting and selection stage.
//!
//! Builds one weighted index per profile over the merged table and
//! serves weighted-random draws. Probability is proportional to weight
//! per bucket; images sharing a weight share a flat sub-distribution.
//! Downstream renderers should assume exactly that shape.

pub mod conf;

pub use conf::{Conf, ConfProfile, WeightQueries};

use crate::confwatch::{ConfWatcher, WatchTarget};
use crate::error::{Error, Result};
use crate::tags::{TagSet, TagSource};
use conf::{UC_DB_CONN, UC_DB_QUERY, UC_PROFILES, UC_TAG_RULES};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sqlx::Row;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use storage::SwapPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One image loaded from the merged table.
#[derive(Debug, Clone)]
struct ImageRec {
    id: i64,
    hid: u64,
    tags: TagSet,
    seen: u8,
}

/// All images sharing one computed score.
#[derive(Debug)]
struct Bucket {
    weight: i64,
    start: i64,
    ids: Vec<i64>,
}

/// An immutable per-profile index. Replaced wholesale on rebuild; the
/// `closed` flag tells handed-out handles to re-resolve.
pub struct ProfileIndex {
    buckets: Vec<Bucket>,
    max_roll: i64,
    rng: Mutex<SmallRng>,
    closed: AtomicBool,
}

impl ProfileIndex {
    fn draw(&self) -> Option<i64> {
        if self.max_roll <= 0 || self.buckets.is_empty() {
            return None;
        }
        let mut rng = self.rng.lock().expect("profile rng poisoned");
        let roll = rng.gen_range(0..self.max_roll);
        let idx = self
            .buckets
            .partition_point(|b| b.start + b.weight <= roll);
        let bucket = &self.buckets[idx];
        let pick = rng.gen_range(0..bucket.ids.len());
        Some(bucket.ids[pick])
    }
}

/// A handle to one profile. Cheap to clone around; draws keep working
/// across configuration swaps by re-resolving when the cached index is
/// marked closed.
pub struct WeighterProfile {
    name: String,
    inner: Arc<Inner>,
    cached: Mutex<Arc<ProfileIndex>>,
}

impl WeighterProfile {
    /// Up to `count` weighted-random image ids; independent draws, so
    /// duplicates are possible. Empty when the index has no images.
    pub fn get(&self, count: u8) -> Result<Vec<i64>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let index = self.resolve()?;
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match index.draw() {
                Some(id) => out.push(id),
                None => break,
            }
        }
        Ok(out)
    }

    fn resolve(&self) -> Result<Arc<ProfileIndex>> {
        let mut cached = self.cached.lock().expect("handle cache poisoned");
        if !cached.closed.load(Ordering::Acquire) {
            return Ok(Arc::clone(&cached));
        }
        // Stale after a swap; fetch the replacement index by name.
        let fresh = self.inner.profile_index(&self.name)?;
        *cached = Arc::clone(&fresh);
        Ok(fresh)
    }
}

struct WeightCache {
    images: HashMap<i64, ImageRec>,
    seen: u8,
}

pub struct Weighter {
    inner: Arc<Inner>,
}

struct Inner {
    tm: Arc<dyn TagSource>,
    db: SwapPool,
    conf: RwLock<Option<Arc<Conf>>>,
    images: tokio::sync::Mutex<WeightCache>,
    profiles: RwLock<HashMap<String, Arc<ProfileIndex>>>,
    /// Union of weight-map tags across profiles; images without one of
    /// these can never be drawn and are not retained.
    white: RwLock<TagSet>,
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

impl Weighter {
    pub async fn new(
        conf_path: impl Into<PathBuf>,
        tm: Arc<dyn TagSource>,
        cancel: CancellationToken,
    ) -> Result<Weighter> {
        let inner = Arc::new(Inner {
            tm,
            db: SwapPool::new(),
            conf: RwLock::new(None),
            images: tokio::sync::Mutex::new(WeightCache {
                images: HashMap::new(),
                seen: 0,
            }),
            profiles: RwLock::new(HashMap::new()),
            white: RwLock::new(TagSet::new()),
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

        Ok(Weighter { inner })
    }

    /// Runs the first full build, then starts the watcher and timers.
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

    /// A handle for one named profile.
    pub fn get_profile(&self, name: &str) -> Result<WeighterProfile> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let index = self.inner.profile_index(name)?;
        Ok(WeighterProfile {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
            cached: Mutex::new(index),
        })
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

    /// The interned hash id behind a drawn image id. A renderer turns
    /// this into the cache filename through the hash interner.
    pub async fn hash_id(&self, id: i64) -> Option<u64> {
        self.inner
            .images
            .lock()
            .await
            .images
            .get(&id)
            .map(|img| img.hid)
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

    fn profile_index(&self, name: &str) -> Result<Arc<ProfileIndex>> {
        self.profiles
            .read()
            .expect("profiles poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown profile {name:?}")))
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

        if bits & (UC_DB_CONN | UC_DB_QUERY | UC_TAG_RULES | UC_PROFILES) != 0 {
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = inner.do_full().await {
                    warn!(%err, "full after configuration change failed");
                }
            });
        }
        info!("weighter configuration updated");
    }

    /// Rebuilds the whitelist from the current profiles' weight maps.
    fn make_whitelist(&self, co: &Conf) {
        let mut tags = TagSet::new();
        for prof in co.profiles.values() {
            for tw in prof.weights.iter() {
                tags = tags.add(tw.tag);
            }
        }
        *self.white.write().expect("whitelist poisoned") = tags;
    }

    /// Full cycle: whitelist, re-query every merged row, rebuild and
    /// swap the per-profile indices.
    async fn do_full(&self) -> Result<()> {
        let co = self.get_conf()?;
        self.make_whitelist(&co);

        let mut ca = self.images.lock().await;
        self.full_query(&co, &mut ca).await?;
        self.rebuild_profiles(&co, &ca);
        debug!("full done");
        Ok(())
    }

    /// Poll cycle: sync the image map; rebuild indices only when
    /// anything actually changed.
    async fn do_poll(&self) -> Result<()> {
        let co = self.get_conf()?;
        let mut ca = self.images.lock().await;
        if self.poll_query(&co, &mut ca).await? {
            self.rebuild_profiles(&co, &ca);
        }
        Ok(())
    }

    async fn full_query(&self, co: &Conf, ca: &mut WeightCache) -> Result<()> {
        let pool = self.pool()?;
        let white = self.white.read().expect("whitelist poisoned").clone();
        ca.seen = ca.seen.wrapping_add(1);
        let first = ca.images.is_empty();
        let mut skipped = 0u64;

        let rows = sqlx::query(&co.queries.full).fetch_all(pool.as_ref()).await?;
        for row in rows {
            let id: i64 = row.try_get(0)?;
            let hid: i64 = row.try_get(1)?;
            let tags_raw: String = row.try_get(2)?;
            let mut tags = TagSet::from(storage::decode_tags(&tags_raw));
            tags = co.tag_rules.apply(tags);

            // Nothing whitelisted means the image can never score.
            if !tags.contains(&white) {
                skipped += 1;
                ca.images.remove(&id);
                continue;
            }

            match ca.images.get_mut(&id) {
                None => {
                    ca.images.insert(
                        id,
                        ImageRec {
                            id,
                            hid: hid as u64,
                            tags,
                            seen: ca.seen,
                        },
                    );
                }
                Some(img) => {
                    img.seen = ca.seen;
                    if img.tags != tags {
                        img.tags = tags;
                    }
                }
            }
        }

        if !first {
            let seen = ca.seen;
            ca.images.retain(|_, img| img.seen == seen);
        }
        debug!(images = ca.images.len(), skipped, "full query done");
        Ok(())
    }

    /// Returns true when the poll changed the image map.
    async fn poll_query(&self, co: &Conf, ca: &mut WeightCache) -> Result<bool> {
        let pool = self.pool()?;
        let white = self.white.read().expect("whitelist poisoned").clone();
        let mut changed = false;

        let rows = sqlx::query(&co.queries.poll).fetch_all(pool.as_ref()).await?;
        for row in rows {
            let id: i64 = row.try_get(0)?;
            let hid: i64 = row.try_get(1)?;
            let tags_raw: String = row.try_get(2)?;
            let alive: bool = row.try_get(3)?;
            let mut tags = TagSet::from(storage::decode_tags(&tags_raw));
            tags = co.tag_rules.apply(tags);

            if !alive || !tags.contains(&white) {
                changed |= ca.images.remove(&id).is_some();
                continue;
            }
            match ca.images.get_mut(&id) {
                None => {
                    ca.images.insert(
                        id,
                        ImageRec {
                            id,
                            hid: hid as u64,
                            tags,
                            seen: ca.seen,
                        },
                    );
                    changed = true;
                }
                Some(img) => {
                    if img.tags != tags {
                        img.tags = tags;
                        changed = true;
                    }
                }
            }
        }
        Ok(changed)
    }

    /// Builds fresh indices for every profile, installs them, and marks
    /// every replaced index closed so stale handles re-resolve.
    fn rebuild_profiles(&self, co: &Conf, ca: &WeightCache) {
        // Group images by score per profile; a BTreeMap keeps buckets
        // ordered by weight.
        let mut grouped: HashMap<&str, BTreeMap<i64, Vec<i64>>> = HashMap::new();
        for prof in co.profiles.values() {
            grouped.insert(prof.name.as_str(), BTreeMap::new());
        }
        for img in ca.images.values() {
            for prof in co.profiles.values() {
                if let Some(rule) = &prof.matches {
                    if !rule.fire(&img.tags) {
                        continue;
                    }
                }
                let weight = prof.weights.weight_of(&img.tags);
                if weight < 1 {
                    continue;
                }
                grouped
                    .get_mut(prof.name.as_str())
                    .expect("profile pre-seeded")
                    .entry(weight)
                    .or_default()
                    .push(img.id);
            }
        }

        let mut fresh: HashMap<String, Arc<ProfileIndex>> = HashMap::new();
        for (name, weights) in grouped {
            let mut buckets = Vec::with_capacity(weights.len());
            let mut start = 0i64;
            for (weight, mut ids) in weights {
                ids.sort_unstable();
                buckets.push(Bucket {
                    weight,
                    start,
                    ids,
                });
                start += weight;
            }
            fresh.insert(
                name.to_string(),
                Arc::new(ProfileIndex {
                    buckets,
                    max_roll: start,
                    rng: Mutex::new(SmallRng::from_entropy()),
                    closed: AtomicBool::new(false),
                }),
            );
        }

        let old = {
            let mut profiles = self.profiles.write().expect("profiles poisoned");
            std::mem::replace(&mut *profiles, fresh)
        };
        // Release ordering pairs with the acquire probe in handles.
        for index in old.values() {
            index.closed.store(true, Ordering::Release);
        }
        info!(profiles = co.profiles.len(), "profile indices rebuilt");
    }

    async fn loopy(self: Arc<Self>) {
        use tokio::time::Instant;

        let mut errors: u32 = 0;
        let Ok(co) = self.get_conf() else { return };
        let mut next_poll = Instant::now() + co.poll_int;
        let mut next_full = Instant::now() + co.full_int;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("weighter shutting down");
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
