//! The per-base in-memory tree cache.

use crate::tags::TagSet;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

// Update bits on file entries.
pub(crate) const UP_FILE_TS: u32 = 1 << 0; // file mtime changed
pub(crate) const UP_FILE_CT: u32 = 1 << 1; // combined tags changed
pub(crate) const UP_FILE_HS: u32 = 1 << 2; // content hash changed
pub(crate) const UP_SIDE_TS: u32 = 1 << 3; // sidecar mtime changed
pub(crate) const UP_SIDE_TG: u32 = 1 << 4; // sidecar tags changed

// Update bits on path entries.
pub(crate) const UP_PATH_TG: u32 = 1 << 5; // path tags changed
pub(crate) const UP_PATH_TS: u32 = 1 << 6; // directory mtime changed
pub(crate) const UP_PATH_FI: u32 = 1 << 7; // files within changed

/// Loop numbers live in [10, 5e7] and wrap back to 10. Only equality
/// with the current loop matters; the range just keeps the values away
/// from anything that could be mistaken for an id or a flag.
pub(crate) fn next_loop(old: u32) -> u32 {
    if old < 10 || old > 50_000_000 {
        10
    } else {
        old + 1
    }
}

/// One image file inside a [`PathCache`].
#[derive(Debug, Default)]
pub(crate) struct FileCache {
    pub name: String,
    /// File mtime in unix milliseconds; 0 when never observed.
    pub file_ts: i64,
    /// Sidecar mtime in unix milliseconds; 0 when no sidecar seen.
    pub side_ts: i64,
    pub side_tags: TagSet,
    /// Combined tags: path tags ∪ sidecar tags.
    pub ctags: TagSet,
    /// Hex content hash; empty until first hashed.
    pub hash: String,
    /// Sticky per-file failure. The file stays cached and ignored until
    /// its mtime changes, which clears the flag.
    pub file_error: bool,
    pub updated: u32,
    /// Loop the file itself was last observed on.
    pub loop_f: u32,
    /// Loop the sidecar was last observed on.
    pub loop_s: u32,
    pub disabled: bool,
    /// Store row id; 0 until inserted.
    pub id: i64,
}

/// One directory under a base. The key is base-relative; "." is the
/// base root.
#[derive(Debug, Default)]
pub(crate) struct PathCache {
    pub path: String,
    /// Directory mtime in unix milliseconds.
    pub changed_ts: i64,
    /// Per-directory tag file mtime in unix milliseconds; 0 when absent.
    pub side_ts: i64,
    /// Tags from the per-directory tag file.
    pub side_tags: TagSet,
    /// Inherited/configured tags (without the tag-file contribution).
    pub tags: TagSet,
    pub files: BTreeMap<String, FileCache>,
    pub disabled: bool,
    /// Store row id; 0 until inserted.
    pub id: i64,
    pub updated: u32,
    /// Loop this path was last observed on.
    pub loop_n: u32,
}

impl PathCache {
    /// The tags a file in this directory inherits.
    pub fn eff_tags(&self) -> TagSet {
        self.tags.clone().combine(&self.side_tags)
    }
}

/// Mutable per-base scan state, guarded by [`BaseCache::state`].
#[derive(Debug)]
pub(crate) struct BaseState {
    pub path: PathBuf,
    pub tags: TagSet,
    pub tag_file: String,
    /// Next scan must be a full one.
    pub force: bool,
    /// Every scan is a full one (directory mtimes unreliable).
    pub force_full_always: bool,
    pub loop_n: u32,
    pub paths: BTreeMap<String, PathCache>,
}

/// Per-base cache entry.
///
/// `check_running` is an advisory single-flight flag: a scan that finds
/// it set returns instead of queueing, so slow storage cannot stack up
/// scans behind a blocking lock.
pub(crate) struct BaseCache {
    pub base: i64,
    pub check_running: AtomicBool,
    pub state: tokio::sync::Mutex<BaseState>,
}

impl BaseCache {
    pub fn new(base: i64, path: PathBuf, tags: TagSet, tag_file: String, force_full: bool) -> Arc<Self> {
        Arc::new(BaseCache {
            base,
            check_running: AtomicBool::new(false),
            state: tokio::sync::Mutex::new(BaseState {
                path,
                tags,
                tag_file,
                force: true,
                force_full_always: force_full,
                loop_n: 0,
                paths: BTreeMap::new(),
            }),
        })
    }
}

pub(crate) type BaseMap = HashMap<i64, Arc<BaseCache>>;

/// Millisecond-rounded mtime; the store rounds its timestamps the same
/// way, so comparisons line up after a reload.
pub(crate) fn mtime_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
