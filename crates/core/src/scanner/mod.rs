//! The scan/index/canonicalize stage.
//!
//! Maintains an in-memory tree cache per configured base, converges it to
//! the on-disk reality on each base's interval, canonicalizes images into
//! the content-addressed cache and reflects the result into the store.

mod cache;
mod canon;
pub mod conf;
mod db;

pub use conf::{Conf, ConfBase, HashKind, ScanQueries};

use crate::confwatch::{ConfWatcher, WatchTarget};
use crate::error::{Error, Result};
use crate::imaging::CacheFormat;
use crate::interner::HashSource;
use crate::tags::{self, TagSet, TagSource};
use cache::{
    mtime_ms, next_loop, BaseCache, BaseMap, BaseState, FileCache, PathCache, UP_FILE_CT,
    UP_FILE_TS, UP_PATH_FI, UP_PATH_TG, UP_PATH_TS, UP_SIDE_TG, UP_SIDE_TS,
};
use conf::{UC_BASE_CI, UC_DB_CONN, UC_DB_QUERY, UC_MAX_RES};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;
use storage::SwapPool;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a single scan pass needs from the configuration.
struct CheckRun {
    hash: HashKind,
    max_resolution: (u32, u32),
    cache_root: PathBuf,
    format: CacheFormat,
    queries: ScanQueries,
    cb: ConfBase,
}

pub struct Scanner {
    inner: Arc<Inner>,
}

struct CheckInterval {
    next_run: Instant,
    check_int: Duration,
    bases: Vec<i64>,
}

pub(crate) struct Inner {
    tm: Arc<dyn TagSource>,
    hm: Arc<dyn HashSource>,
    pub(crate) db: SwapPool,
    conf: RwLock<Option<Arc<Conf>>>,
    bases: Mutex<BaseMap>,
    uc_bits: AtomicU64,
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

impl Scanner {
    /// Loads configuration, connects to the store and seeds the
    /// in-memory cache. No scanning happens until [`Scanner::start`].
    pub async fn new(
        conf_path: impl Into<PathBuf>,
        tm: Arc<dyn TagSource>,
        hm: Arc<dyn HashSource>,
        cancel: CancellationToken,
    ) -> Result<Scanner> {
        let inner = Arc::new(Inner {
            tm,
            hm,
            db: SwapPool::new(),
            conf: RwLock::new(None),
            bases: Mutex::new(BaseMap::new()),
            uc_bits: AtomicU64::new(0),
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
        let mut co = Conf::clone(&loaded);
        conf::check(&mut co, None)?;

        let pool = storage::connect_with_queries(&co.database, co.queries.prepare_list())
            .await
            .map_err(|err| Error::Transient(err.to_string()))?;
        inner.db.set(pool);
        let co = Arc::new(co);
        *inner.conf.write().expect("conf cell poisoned") = Some(Arc::clone(&co));

        inner.bind_bases(&co).await;
        inner.load_cache().await?;

        // First run after startup always forces a full so an interrupted
        // previous run cannot leave orphaned store rows unexamined.
        for bc in inner.base_list() {
            bc.state.lock().await.force = true;
        }

        Ok(Scanner { inner })
    }

    /// Starts the configuration watcher, the interval scheduler and an
    /// immediate scan of every base.
    pub fn start(&self) {
        if let Some(watcher) = self.inner.watcher.get() {
            Arc::clone(watcher).start(self.inner.cancel.clone());
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Arc::clone(&inner).check_all();
            inner.loopy().await;
        });
    }

    /// Runs one scan pass for a base and waits for it; test and tooling
    /// entry point. Returns without scanning if one is already running.
    pub async fn scan_base(&self, base: i64) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let bc = self
            .inner
            .base(base)
            .ok_or_else(|| Error::Config(format!("unknown base {base}")))?;
        self.inner.check_base(bc).await
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();
    }
}

enum FileType {
    Ignored,
    Image,
    Sidecar(String),
}

/// Classifies a directory entry by extension. A `.txt` is a sidecar only
/// when the stripped name resolves to a supported image extension.
fn file_type(name: &str) -> FileType {
    if name.len() < 5 {
        return FileType::Ignored;
    }
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".jpg")
        || lower.ends_with(".jpeg")
        || lower.ends_with(".gif")
        || lower.ends_with(".png")
    {
        return FileType::Image;
    }
    if let Some(stem) = name.strip_suffix(".txt").or_else(|| name.strip_suffix(".TXT")) {
        if matches!(file_type(stem), FileType::Image) {
            return FileType::Sidecar(stem.to_string());
        }
    }
    FileType::Ignored
}

fn child_key(parent: &str, name: &str) -> String {
    if parent == "." {
        name.to_string()
    } else {
        format!("{parent}/{name}")
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

    fn base(&self, id: i64) -> Option<Arc<BaseCache>> {
        self.bases.lock().expect("base map poisoned").get(&id).cloned()
    }

    fn base_list(&self) -> Vec<Arc<BaseCache>> {
        self.bases
            .lock()
            .expect("base map poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Creates missing base caches and rebinds existing ones to the new
    /// configuration; a path or inherited-tag diff forces a full scan.
    async fn bind_bases(&self, co: &Conf) {
        let mut work = Vec::new();
        {
            let mut bases = self.bases.lock().expect("base map poisoned");
            for cb in co.bases.values() {
                let bc = bases.entry(cb.base).or_insert_with(|| {
                    debug!(base = cb.base, "base cache created");
                    BaseCache::new(
                        cb.base,
                        cb.path.clone(),
                        cb.tags.clone(),
                        cb.tag_file_name(),
                        cb.force_full,
                    )
                });
                work.push((Arc::clone(bc), cb.clone()));
            }
        }
        for (bc, cb) in work {
            let mut state = bc.state.lock().await;
            if state.tags != cb.tags {
                info!(base = cb.base, "base tags updated");
                state.tags = cb.tags.clone();
                state.force = true;
            }
            if state.path != cb.path {
                info!(base = cb.base, path = %cb.path.display(), "base path updated");
                state.path = cb.path.clone();
                state.force = true;
            }
            let tag_file = cb.tag_file_name();
            if state.tag_file != tag_file {
                state.tag_file = tag_file;
                state.force = true;
            }
            state.force_full_always = cb.force_full;
        }
    }

    async fn notify_conf(&self) {
        let Some(watcher) = self.watcher.get() else {
            return;
        };
        let Some(loaded) = watcher.get() else {
            warn!("configuration notify without a loaded value");
            return;
        };
        let mut co = Conf::clone(&loaded);
        let prev = self.conf.read().expect("conf cell poisoned").clone();
        let bits = match conf::check(&mut co, prev.as_deref()) {
            Ok(bits) => bits,
            Err(err) => {
                warn!(%err, "invalid configuration, keeping the previous one");
                return;
            }
        };

        let mut bits = bits;
        if bits & (UC_DB_CONN | UC_DB_QUERY) != 0 {
            match storage::connect_with_queries(&co.database, co.queries.prepare_list()).await {
                Ok(pool) => {
                    // Publishing through the cell defers the old pool's
                    // close to a background task.
                    self.db.set(pool);
                    bits &= !(UC_DB_CONN | UC_DB_QUERY);
                }
                Err(err) => {
                    warn!(%err, "reconnect failed, keeping the previous configuration");
                    return;
                }
            }
        }

        let co = Arc::new(co);
        self.bind_bases(&co).await;
        *self.conf.write().expect("conf cell poisoned") = Some(Arc::clone(&co));
        self.uc_bits.fetch_or(bits, Ordering::SeqCst);
        info!("scanner configuration updated");
    }

    fn check_all(self: Arc<Self>) {
        for bc in self.base_list() {
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = inner.check_base(bc).await {
                    warn!(%err, "base scan failed");
                }
            });
        }
    }

    /// One scan pass over a base. Advisory-locked: a pass that finds
    /// another one running returns immediately rather than queueing.
    async fn check_base(&self, bc: Arc<BaseCache>) -> Result<()> {
        if bc
            .check_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(base = bc.base, "check already running");
            return Ok(());
        }
        let result = self.check_base_locked(&bc).await;
        bc.check_running.store(false, Ordering::Release);
        if let Err(err) = &result {
            warn!(base = bc.base, %err, "scan pass failed");
        }
        result
    }

    async fn check_base_locked(&self, bc: &BaseCache) -> Result<()> {
        let start = std::time::Instant::now();
        let co = self.get_conf()?;
        let Some(cb) = co.bases.get(&bc.base) else {
            debug!(base = bc.base, "base no longer configured");
            return Ok(());
        };
        let cr = CheckRun {
            hash: co.hash,
            max_resolution: co.max_resolution,
            cache_root: co.image_cache.clone(),
            format: co.cache_format,
            queries: co.queries.clone(),
            cb: cb.clone(),
        };

        let mut state = bc.state.lock().await;
        state.loop_n = next_loop(state.loop_n);

        // A cache without the base root means nothing useful is cached.
        if !state.paths.contains_key(".") {
            state.force = true;
        }

        if state.force || state.force_full_always {
            let base_tags = state.tags.clone();
            let meta = std::fs::metadata(&state.path)?;
            self.get_path_cache(&cr, &mut state, ".", Some(&base_tags), &meta)
                .await?;
            self.check_base_path(&cr, &mut state, ".", true).await?;
            state.force = false;
        } else {
            let keys: Vec<String> = state.paths.keys().cloned().collect();
            for key in keys {
                self.check_path_partial(&cr, &mut state, &key).await?;
            }
        }

        self.check_hash_tags_db(&cr, &mut state).await?;
        self.clean_cache(&mut state);

        info!(base = bc.base, took = ?start.elapsed(), "scan pass done");
        Ok(())
    }

    /// Observes one directory: creates the cache entry when new, bumps
    /// its loop, tracks the directory mtime and the inherited tags.
    async fn get_path_cache(
        &self,
        cr: &CheckRun,
        state: &mut BaseState,
        path: &str,
        inherit: Option<&TagSet>,
        meta: &std::fs::Metadata,
    ) -> Result<()> {
        let loop_n = state.loop_n;
        let pc = state.paths.entry(path.to_string()).or_insert_with(|| {
            debug!(path, "path cache created");
            PathCache {
                path: path.to_string(),
                updated: UP_PATH_TG,
                ..Default::default()
            }
        });
        pc.loop_n = loop_n;

        let ptime = mtime_ms(meta);
        if ptime != pc.changed_ts {
            info!(path, "directory mtime changed");
            pc.changed_ts = ptime;
            pc.updated |= UP_PATH_TS;
        }

        // Specifically configured tags take precedence over inheritance.
        let configured = cr.cb.paths.get(path);
        let wanted = match (configured, inherit) {
            (Some(tags), _) if !tags.is_empty() => Some(tags),
            (_, Some(tags)) => Some(tags),
            _ => None,
        };
        if let Some(wanted) = wanted {
            if *wanted != pc.tags {
                info!(path, "path tags changed");
                pc.tags = wanted.clone();
                pc.updated |= UP_PATH_TG;
            }
        }
        Ok(())
    }

    /// Partial-scan check of one known path: if the directory mtime is
    /// unchanged, every cached file (and sidecar) is considered
    /// observed; otherwise the directory is rescanned non-recursively.
    async fn check_path_partial(
        &self,
        cr: &CheckRun,
        state: &mut BaseState,
        path: &str,
    ) -> Result<()> {
        let full_path = state.path.join(path);
        let meta = match std::fs::metadata(&full_path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Gone from disk; leaving it unobserved lets the store
                // sync disable it and the sweep remove it.
                debug!(path, "directory gone");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        self.get_path_cache(cr, state, path, None, &meta).await?;

        let pc = state.paths.get_mut(path).expect("path observed above");
        if pc.updated & (UP_PATH_TG | UP_PATH_TS) == 0 {
            // Unchanged directory mtime covers any child mutation, so
            // mark everything inside as observed.
            let loop_n = pc.loop_n;
            for fc in pc.files.values_mut() {
                fc.loop_f = loop_n;
                if fc.side_ts != 0 {
                    fc.loop_s = loop_n;
                }
            }
            debug!(path, "unchanged");
            return Ok(());
        }

        self.check_base_path(cr, state, path, false).await
    }

    /// Scans one directory's entries. Recurses into every child for a
    /// full scan; for a partial scan only into unknown children.
    fn check_base_path<'a>(
        &'a self,
        cr: &'a CheckRun,
        state: &'a mut BaseState,
        path: &'a str,
        full: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let dir = state.path.join(path);
            let mut entries = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let meta = match entry.metadata() {
                    Ok(meta) => meta,
                    Err(err) => {
                        debug!(path, file = %name, %err, "stat failed, skipping");
                        continue;
                    }
                };
                entries.push((name, meta));
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            self.load_path_tag_file(state, path, &entries).await?;

            let parent_tags = state
                .paths
                .get(path)
                .map(|pc| pc.eff_tags())
                .unwrap_or_default();

            for (name, meta) in entries {
                if meta.is_dir() {
                    let npath = child_key(path, &name);
                    if !full && state.paths.contains_key(&npath) {
                        // Known path; the partial loop handles it.
                        continue;
                    }
                    self.get_path_cache(cr, state, &npath, Some(&parent_tags), &meta)
                        .await?;
                    self.check_base_path(cr, state, &npath, full).await?;
                    continue;
                }
                if name == state.tag_file {
                    continue;
                }
                match file_type(&name) {
                    FileType::Ignored => {}
                    FileType::Image => {
                        let pc = state.paths.get_mut(path).expect("path exists");
                        let loop_n = pc.loop_n;
                        Self::observe_file(pc, &name, Some(mtime_ms(&meta)), loop_n);
                    }
                    FileType::Sidecar(image) => {
                        self.load_side_file(state, path, &name, &image, mtime_ms(&meta))
                            .await?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Handles the per-directory tag file: its tags fold into the path's
    /// effective tags, its mtime is the path's sidecar timestamp.
    async fn load_path_tag_file(
        &self,
        state: &mut BaseState,
        path: &str,
        entries: &[(String, std::fs::Metadata)],
    ) -> Result<()> {
        let tag_file = state.tag_file.clone();
        let found = entries
            .iter()
            .find(|(name, meta)| *name == tag_file && meta.is_file());

        let Some((name, meta)) = found else {
            if let Some(pc) = state.paths.get_mut(path) {
                if pc.side_ts != 0 || !pc.side_tags.is_empty() {
                    info!(path, "tag file removed");
                    pc.side_ts = 0;
                    pc.side_tags = TagSet::new();
                    pc.updated |= UP_PATH_TG | UP_PATH_TS;
                }
            }
            return Ok(());
        };

        let ptime = mtime_ms(meta);
        let needs_load = match state.paths.get(path) {
            Some(pc) => pc.side_ts != ptime,
            None => true,
        };
        if !needs_load {
            return Ok(());
        }

        let file_path = state.path.join(path).join(name);
        let loaded = tags::load_tag_file(&file_path, self.tm.as_ref()).await?;

        let pc = state.paths.get_mut(path).expect("path observed before entries");
        info!(path, "tag file changed");
        pc.side_ts = ptime;
        pc.updated |= UP_PATH_TS;
        if loaded != pc.side_tags {
            pc.side_tags = loaded;
            pc.updated |= UP_PATH_TG;
        }
        Ok(())
    }

    /// Observes one image file. Without an mtime (sidecar-driven) the
    /// entry is created but not marked observed.
    fn observe_file(pc: &mut PathCache, file: &str, mod_ms: Option<i64>, loop_n: u32) {
        let mark_path = {
            let fc = pc.files.entry(file.to_string()).or_insert_with(|| {
                debug!(file, "file cache created");
                FileCache {
                    name: file.to_string(),
                    ..Default::default()
                }
            });
            if fc.loop_f == loop_n {
                return;
            }
            let Some(mod_ms) = mod_ms else {
                return;
            };
            fc.loop_f = loop_n;
            if mod_ms == fc.file_ts {
                false
            } else {
                info!(file, "file mtime changed");
                fc.file_ts = mod_ms;
                fc.updated |= UP_FILE_TS;
                // The mtime moved; whatever error the old bytes caused
                // may be fixed, so look at the file again.
                if fc.file_error {
                    fc.file_error = false;
                }
                true
            }
        };
        if mark_path {
            pc.updated |= UP_PATH_FI;
        }
    }

    /// Ingests one image sidecar. Observation updates only the sidecar
    /// loop; a sidecar without its image never marks the image observed.
    async fn load_side_file(
        &self,
        state: &mut BaseState,
        path: &str,
        file: &str,
        image: &str,
        mod_ms: i64,
    ) -> Result<()> {
        let needs_load = {
            let pc = state.paths.get_mut(path).expect("path exists");
            let loop_n = pc.loop_n;
            Self::observe_file(pc, image, None, loop_n);
            let fc = pc.files.get_mut(image).expect("file observed above");
            fc.loop_s = loop_n;
            fc.side_ts != mod_ms
        };
        if !needs_load {
            return Ok(());
        }

        let file_path = state.path.join(path).join(file);
        let loaded = tags::load_tag_file(&file_path, self.tm.as_ref()).await?;

        let pc = state.paths.get_mut(path).expect("path exists");
        let fc = pc.files.get_mut(image).expect("file observed above");
        info!(file, "sidecar mtime changed");
        fc.side_ts = mod_ms;
        fc.updated |= UP_SIDE_TS;
        pc.updated |= UP_PATH_FI;
        if loaded != fc.side_tags {
            fc.side_tags = loaded;
            fc.updated |= UP_SIDE_TG;
            pc.updated |= UP_PATH_FI;
        }
        Ok(())
    }

    /// Recomputes combined tags, hashes changed files into the image
    /// cache, and pushes every dirty path to the store.
    async fn check_hash_tags_db(&self, cr: &CheckRun, state: &mut BaseState) -> Result<()> {
        let loop_n = state.loop_n;
        let keys: Vec<String> = state.paths.keys().cloned().collect();
        for key in keys {
            let (unseen, path_tags_changed, eff, file_names) = {
                let pc = state.paths.get(&key).expect("key from map");
                (
                    pc.loop_n != loop_n,
                    pc.updated & UP_PATH_TG != 0,
                    pc.eff_tags(),
                    pc.files.keys().cloned().collect::<Vec<String>>(),
                )
            };
            if unseen {
                // Path vanished; the store sync disables it and its
                // files, the sweep removes it later.
                self.update_db_pf(cr, state, &key, loop_n).await?;
                info!(path = key, "path removed");
                continue;
            }
            for name in file_names {
                let pc = state.paths.get_mut(&key).expect("key from map");
                let fc = pc.files.get_mut(&name).expect("name from map");
                if fc.loop_f != loop_n {
                    debug!(file = name, "unobserved, skipped");
                    continue;
                }

                if path_tags_changed || fc.updated & UP_SIDE_TG != 0 || fc.ctags.is_empty() {
                    let ntags = eff.clone().combine(&fc.side_tags);
                    if ntags != fc.ctags {
                        info!(file = name, "combined tags changed");
                        fc.ctags = ntags;
                        fc.updated |= UP_FILE_CT;
                        pc.updated |= UP_PATH_FI;
                    }
                }

                // A file with no tags at all is useless to the pipeline;
                // leave it out of hashing and store updates entirely.
                if fc.ctags.is_empty() {
                    warn!(file = name, "has no tags");
                    continue;
                }

                if fc.updated & UP_FILE_TS != 0 || fc.hash.is_empty() {
                    let src = state.path.join(&key).join(&name);
                    match canon::hash_file(cr.hash, &src) {
                        Ok(hash) => {
                            if hash != fc.hash {
                                fc.hash = hash;
                                fc.updated |= cache::UP_FILE_HS;
                                pc.updated |= UP_PATH_FI;
                                if let Err(err) = canon::cache_image(
                                    &src,
                                    &fc.hash,
                                    &cr.cache_root,
                                    cr.max_resolution,
                                    cr.format,
                                ) {
                                    // One bad file never aborts the scan;
                                    // it sits flagged until its mtime
                                    // changes.
                                    fc.file_error = true;
                                    warn!(file = name, %err, "canonicalize failed");
                                }
                            }
                        }
                        Err(err) => {
                            fc.file_error = true;
                            warn!(file = name, %err, "hash failed");
                        }
                    }
                }
            }

            self.update_db_pf(cr, state, &key, loop_n).await?;
        }
        Ok(())
    }

    /// Sweeps cache entries that were not observed this pass and are
    /// either unknown to the store or already disabled there.
    fn clean_cache(&self, state: &mut BaseState) {
        let loop_n = state.loop_n;
        state.paths.retain(|path, pc| {
            pc.files.retain(|file, fc| {
                if fc.loop_f == loop_n {
                    return true;
                }
                if fc.id != 0 && !fc.disabled {
                    return true;
                }
                info!(path, file, "cleaned");
                false
            });

            if pc.loop_n == loop_n {
                return true;
            }
            // A removed path keeps living while files remain; they have
            // to leave the store first, then the next pass sweeps both.
            if !pc.files.is_empty() {
                return true;
            }
            if pc.id != 0 && !pc.disabled {
                return true;
            }
            info!(path, "cleaned");
            false
        });
    }

    // Scheduling.

    fn make_check_intervals(&self, co: &Conf) -> Vec<CheckInterval> {
        let now = Instant::now();
        let mut checks: Vec<CheckInterval> = Vec::with_capacity(co.bases.len());
        for cb in co.bases.values() {
            let check_int = cb.check_interval();
            match checks.iter_mut().find(|ci| ci.check_int == check_int) {
                Some(ci) => ci.bases.push(cb.base),
                None => checks.push(CheckInterval {
                    next_run: now + check_int,
                    check_int,
                    bases: vec![cb.base],
                }),
            }
        }
        checks.sort_by_key(|ci| ci.next_run);
        checks
    }

    /// Re-arms after the front entry fired. Entries whose deadline
    /// passed while another scan dispatched run almost immediately
    /// instead of being skipped.
    fn rearm_check_intervals(checks: &mut [CheckInterval]) {
        let now = Instant::now();
        if let Some(first) = checks.first_mut() {
            if now >= first.next_run {
                first.next_run = now + first.check_int;
            }
        }
        for ci in checks.iter_mut().skip(1) {
            if now >= ci.next_run {
                ci.next_run = now + Duration::from_millis(1);
            }
        }
        checks.sort_by_key(|ci| ci.next_run);
    }

    async fn loopy(self: Arc<Self>) {
        let mut checks = match self.get_conf() {
            Ok(co) => self.make_check_intervals(&co),
            Err(_) => Vec::new(),
        };

        loop {
            let next = checks
                .first()
                .map(|ci| ci.next_run)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(300));

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("scanner shutting down");
                    self.close_db().await;
                    return;
                }
                _ = tokio::time::sleep_until(next) => {}
            }

            if let Some(front) = checks.first() {
                for id in front.bases.clone() {
                    if let Some(bc) = self.base(id) {
                        let inner = Arc::clone(&self);
                        tokio::spawn(async move {
                            let _ = inner.check_base(bc).await;
                        });
                    }
                }
            }

            // An interval diff from a reload re-derives the whole list.
            if self.uc_bits.swap(0, Ordering::SeqCst) & (UC_BASE_CI | UC_MAX_RES) != 0 {
                if let Ok(co) = self.get_conf() {
                    checks = self.make_check_intervals(&co);
                    continue;
                }
            }
            Self::rearm_check_intervals(&mut checks);
        }
    }

    async fn close_db(&self) {
        self.db.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_types_classify_by_extension() {
        assert!(matches!(file_type("a.jpg"), FileType::Image));
        assert!(matches!(file_type("a.JPEG"), FileType::Image));
        assert!(matches!(file_type("b.png"), FileType::Image));
        assert!(matches!(file_type("b.gif"), FileType::Image));
        assert!(matches!(file_type("x.mp4"), FileType::Ignored));
        assert!(matches!(file_type("t.txt"), FileType::Ignored));
        match file_type("a.jpg.txt") {
            FileType::Sidecar(image) => assert_eq!(image, "a.jpg"),
            _ => panic!("expected sidecar"),
        }
        assert!(matches!(file_type("a.mp4.txt"), FileType::Ignored));
        assert!(matches!(file_type("a.js"), FileType::Ignored));
    }

    #[test]
    fn child_keys_are_base_relative() {
        assert_eq!(child_key(".", "a"), "a");
        assert_eq!(child_key("a", "b"), "a/b");
    }
}
