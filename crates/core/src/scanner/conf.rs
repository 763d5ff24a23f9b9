//! Scanner configuration: document shapes, conversion, merging and
//! field-granular change detection.

use crate::confwatch::parse_duration;
use crate::error::{Error, Result};
use crate::imaging::CacheFormat;
use crate::tags::{strings_to_tags, TagSet, TagSource};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub(crate) const DEFAULT_CHECK_INT: Duration = Duration::from_secs(300);
pub(crate) const MIN_CHECK_INT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_TAG_FILE: &str = "tags.txt";
pub(crate) const DEFAULT_IMAGE_CACHE: &str = "imgcache";
pub(crate) const MIN_RESOLUTION: u32 = 720;
pub(crate) const DEFAULT_RESOLUTION: u32 = 3840;

// Update bits published after a configuration reload.
pub(crate) const UC_DB_CONN: u64 = 1 << 0;
pub(crate) const UC_DB_QUERY: u64 = 1 << 1;
pub(crate) const UC_MAX_RES: u64 = 1 << 2;
pub(crate) const UC_BASE_CI: u64 = 1 << 3;

/// The content hash used to name canonical cache entries. Not a security
/// boundary; the choice only moves the collision probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashKind {
    Sha1,
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha-1" | "sha1" => Ok(HashKind::Sha1),
            "sha-224" | "sha224" => Ok(HashKind::Sha224),
            "sha-256" | "sha256" => Ok(HashKind::Sha256),
            "sha-384" | "sha384" => Ok(HashKind::Sha384),
            "sha-512" | "sha512" => Ok(HashKind::Sha512),
            other => Err(Error::Config(format!("unknown hash {other:?}"))),
        }
    }

    pub fn hasher(self) -> Box<dyn digest::DynDigest + Send> {
        match self {
            HashKind::Sha1 => Box::new(sha1::Sha1::default()),
            HashKind::Sha224 => Box::new(sha2::Sha224::default()),
            HashKind::Sha256 => Box::new(sha2::Sha256::default()),
            HashKind::Sha384 => Box::new(sha2::Sha384::default()),
            HashKind::Sha512 => Box::new(sha2::Sha512::default()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanQueries {
    pub paths_select: String,
    pub paths_insert: String,
    pub paths_update: String,
    pub paths_disable: String,
    pub files_select: String,
    pub files_insert: String,
    pub files_update: String,
    pub files_disable: String,
}

impl ScanQueries {
    pub(crate) fn prepare_list(&self) -> Vec<String> {
        vec![
            self.paths_select.clone(),
            self.paths_insert.clone(),
            self.paths_update.clone(),
            self.paths_disable.clone(),
            self.files_select.clone(),
            self.files_insert.clone(),
            self.files_update.clone(),
            self.files_disable.clone(),
        ]
    }

    fn merge_from(&mut self, other: &ScanQueries) {
        fn take(dst: &mut String, src: &str) {
            if !src.is_empty() {
                *dst = src.to_string();
            }
        }
        take(&mut self.paths_select, &other.paths_select);
        take(&mut self.paths_insert, &other.paths_insert);
        take(&mut self.paths_update, &other.paths_update);
        take(&mut self.paths_disable, &other.paths_disable);
        take(&mut self.files_select, &other.files_select);
        take(&mut self.files_insert, &other.files_insert);
        take(&mut self.files_update, &other.files_update);
        take(&mut self.files_disable, &other.files_disable);
    }

    fn check(&self) -> Result<()> {
        for (name, sql) in [
            ("paths-select", &self.paths_select),
            ("paths-insert", &self.paths_insert),
            ("paths-update", &self.paths_update),
            ("paths-disable", &self.paths_disable),
            ("files-select", &self.files_select),
            ("files-insert", &self.files_insert),
            ("files-update", &self.files_update),
            ("files-disable", &self.files_disable),
        ] {
            if sql.is_empty() {
                return Err(Error::Config(format!("missing queries.{name}")));
            }
        }
        Ok(())
    }
}

/// One configured base: a filesystem root to index.
///
/// `check_int` and `tag_file` stay `None` until some document sets
/// them, so a later overlay can still override an earlier one even
/// when it picks the default value; readers go through the resolving
/// accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfBase {
    pub base: i64,
    pub path: PathBuf,
    pub tags: TagSet,
    pub check_int: Option<Duration>,
    pub tag_file: Option<String>,
    /// Disables the directory-mtime partial-scan optimization; for
    /// filesystems that do not bump directory mtimes on child changes.
    pub force_full: bool,
    /// Extra tags configured for specific base-relative directories.
    pub paths: HashMap<String, TagSet>,
}

impl ConfBase {
    /// The configured scan interval, or the five-minute default.
    pub fn check_interval(&self) -> Duration {
        self.check_int.unwrap_or(DEFAULT_CHECK_INT)
    }

    /// The per-directory tag file name, `tags.txt` unless configured.
    pub fn tag_file_name(&self) -> String {
        self.tag_file
            .clone()
            .unwrap_or_else(|| DEFAULT_TAG_FILE.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conf {
    pub database: String,
    pub queries: ScanQueries,
    pub max_resolution: (u32, u32),
    pub hash: HashKind,
    pub image_cache: PathBuf,
    pub cache_format: CacheFormat,
    pub bases: HashMap<i64, ConfBase>,
}

// Raw document shapes.

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawQueries {
    #[serde(default, rename = "paths-select")]
    paths_select: String,
    #[serde(default, rename = "paths-insert")]
    paths_insert: String,
    #[serde(default, rename = "paths-update")]
    paths_update: String,
    #[serde(default, rename = "paths-disable")]
    paths_disable: String,
    #[serde(default, rename = "files-select")]
    files_select: String,
    #[serde(default, rename = "files-insert")]
    files_insert: String,
    #[serde(default, rename = "files-update")]
    files_update: String,
    #[serde(default, rename = "files-disable")]
    files_disable: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawBase {
    #[serde(default)]
    base: i64,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    checkinterval: String,
    #[serde(default)]
    tagfile: String,
    #[serde(default)]
    forcefull: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawPath {
    path: String,
    base: i64,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawConf {
    #[serde(default)]
    maxresolution: String,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    database: String,
    #[serde(default)]
    imagecache: String,
    #[serde(default)]
    cacheformat: String,
    #[serde(default)]
    queries: Option<RawQueries>,
    /// Keyed by base path on disk.
    #[serde(default)]
    bases: HashMap<String, RawBase>,
    #[serde(default)]
    paths: Vec<RawPath>,
}

pub(crate) async fn convert(raw: RawConf, tm: &dyn TagSource) -> Result<Conf> {
    let mut out = Conf {
        database: raw.database,
        queries: ScanQueries::default(),
        max_resolution: (0, 0),
        hash: HashKind::default(),
        image_cache: PathBuf::new(),
        cache_format: CacheFormat::default(),
        bases: HashMap::new(),
    };

    if let Some(q) = raw.queries {
        out.queries = ScanQueries {
            paths_select: q.paths_select,
            paths_insert: q.paths_insert,
            paths_update: q.paths_update,
            paths_disable: q.paths_disable,
            files_select: q.files_select,
            files_insert: q.files_insert,
            files_update: q.files_update,
            files_disable: q.files_disable,
        };
    }

    if !raw.maxresolution.is_empty() {
        let (x, y) = raw
            .maxresolution
            .split_once('x')
            .ok_or_else(|| Error::Config(format!("invalid maxresolution {:?}", raw.maxresolution)))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| Error::Config(format!("invalid maxresolution {:?}", raw.maxresolution)))
        };
        out.max_resolution = (parse(x)?, parse(y)?);
    }

    if !raw.hash.is_empty() {
        out.hash = HashKind::from_name(&raw.hash)?;
    }

    if !raw.imagecache.is_empty() {
        out.image_cache = PathBuf::from(raw.imagecache);
    }

    if !raw.cacheformat.is_empty() {
        out.cache_format = CacheFormat::from_name(&raw.cacheformat)?;
    }

    for (path, base) in raw.bases {
        if base.base <= 0 {
            return Err(Error::Config(format!("invalid base id for {path:?}")));
        }
        let check_int = if base.checkinterval.is_empty() {
            None
        } else {
            let int = parse_duration(&base.checkinterval)?;
            if int < MIN_CHECK_INT {
                return Err(Error::Config(format!(
                    "checkinterval below {}s for base {}",
                    MIN_CHECK_INT.as_secs(),
                    base.base
                )));
            }
            Some(int)
        };
        let tag_file = if base.tagfile.is_empty() {
            None
        } else {
            Some(base.tagfile)
        };
        out.bases.insert(
            base.base,
            ConfBase {
                base: base.base,
                path: PathBuf::from(path),
                tags: strings_to_tags(&base.tags, tm).await?,
                check_int,
                tag_file,
                force_full: base.forcefull,
                paths: HashMap::new(),
            },
        );
    }

    for p in raw.paths {
        if p.path.len() < 2 {
            return Err(Error::Config("empty path".into()));
        }
        if p.base <= 0 {
            return Err(Error::Config(format!("invalid base in path {:?}", p.path)));
        }
        // Path keys are base-relative.
        let key = p.path.trim_start_matches('/').to_string();
        let tags = strings_to_tags(&p.tags, tm).await?;
        let base = out.bases.entry(p.base).or_insert_with(|| ConfBase {
            base: p.base,
            path: PathBuf::new(),
            tags: TagSet::new(),
            check_int: None,
            tag_file: None,
            force_full: false,
            paths: HashMap::new(),
        });
        match base.paths.get_mut(&key) {
            Some(existing) => *existing = existing.clone().combine(&tags),
            None => {
                base.paths.insert(key, tags);
            }
        }
    }

    Ok(out)
}

/// Earlier files accumulate into `acc`; `next` is the most recent file
/// and overrides scalars it sets.
pub(crate) fn merge(mut acc: Conf, next: Conf) -> Result<Conf> {
    acc.queries.merge_from(&next.queries);

    if !next.database.is_empty() {
        acc.database = next.database;
    }
    if next.max_resolution.0 > 0 {
        acc.max_resolution.0 = next.max_resolution.0;
    }
    if next.max_resolution.1 > 0 {
        acc.max_resolution.1 = next.max_resolution.1;
    }
    if next.hash != HashKind::default() {
        acc.hash = next.hash;
    }
    if next.cache_format != CacheFormat::default() {
        acc.cache_format = next.cache_format;
    }
    if !next.image_cache.as_os_str().is_empty() {
        acc.image_cache = next.image_cache;
    }

    for (id, base) in next.bases {
        match acc.bases.get_mut(&id) {
            None => {
                acc.bases.insert(id, base);
            }
            Some(existing) => {
                existing.tags = existing.tags.clone().combine(&base.tags);
                if !base.path.as_os_str().is_empty() {
                    existing.path = base.path;
                }
                if base.check_int.is_some() {
                    existing.check_int = base.check_int;
                }
                if base.tag_file.is_some() {
                    existing.tag_file = base.tag_file;
                }
                existing.force_full |= base.force_full;
                for (key, tags) in base.paths {
                    match existing.paths.get_mut(&key) {
                        Some(prev) => *prev = prev.clone().combine(&tags),
                        None => {
                            existing.paths.insert(key, tags);
                        }
                    }
                }
            }
        }
    }

    Ok(acc)
}

/// Validates a merged configuration and, against an optional previous
/// one, reports which update bits apply.
pub(crate) fn check(conf: &mut Conf, prev: Option<&Conf>) -> Result<u64> {
    if conf.bases.is_empty() {
        return Err(Error::Config("no bases loaded".into()));
    }
    for base in conf.bases.values() {
        if base.path.as_os_str().is_empty() {
            return Err(Error::Config(format!("base {} has no path", base.base)));
        }
    }
    conf.queries.check()?;
    if conf.database.is_empty() {
        return Err(Error::Config("missing database".into()));
    }

    // An unset axis takes the default; one set below the floor rejects
    // the whole proposal and the previous configuration keeps serving.
    if conf.max_resolution.0 == 0 {
        conf.max_resolution.0 = DEFAULT_RESOLUTION;
    }
    if conf.max_resolution.1 == 0 {
        conf.max_resolution.1 = DEFAULT_RESOLUTION;
    }
    if conf.max_resolution.0 < MIN_RESOLUTION || conf.max_resolution.1 < MIN_RESOLUTION {
        return Err(Error::Config(format!(
            "maxresolution {}x{} below the {}px floor",
            conf.max_resolution.0, conf.max_resolution.1, MIN_RESOLUTION
        )));
    }
    if conf.image_cache.as_os_str().is_empty() {
        conf.image_cache = PathBuf::from(DEFAULT_IMAGE_CACHE);
    }

    let Some(prev) = prev else {
        return Ok(0);
    };

    let mut bits = 0u64;
    if prev.max_resolution != conf.max_resolution {
        bits |= UC_MAX_RES;
    }
    if prev.database != conf.database {
        bits |= UC_DB_CONN;
    }
    if prev.queries != conf.queries {
        bits |= UC_DB_QUERY;
    }
    for (id, base) in &conf.bases {
        match prev.bases.get(id) {
            Some(old) if old.check_interval() == base.check_interval() => {}
            _ => bits |= UC_BASE_CI,
        }
    }
    if prev.bases.len() != conf.bases.len() {
        bits |= UC_BASE_CI;
    }
    Ok(bits)
}
