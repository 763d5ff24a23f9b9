//! Declarative configuration watching.
//!
//! Watches a file or a directory tree of yaml/json documents. On any
//! mtime advance the watcher re-parses every document, converts each into
//! the target's typed form, merges them in ascending filename order and
//! commits the result only when the target's change predicate says the
//! content actually differs. A failed parse or convert leaves the
//! previously committed value serving.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHECK_EVERY: Duration = Duration::from_secs(60);

/// The hooks a stage hands to its watcher.
#[async_trait::async_trait]
pub trait WatchTarget: Send + Sync + 'static {
    /// Shape one document deserializes into.
    type Raw: DeserializeOwned + Send;
    /// The typed configuration value the stage runs on.
    type Conf: Send + Sync;

    /// Validates and normalizes one document (may intern tags).
    async fn convert(&self, raw: Self::Raw) -> Result<Self::Conf>;

    /// Folds one converted document into the accumulating result.
    /// Called in ascending filename order; `acc` is the earlier files.
    fn merge(&self, acc: Self::Conf, next: Self::Conf) -> Result<Self::Conf>;

    /// Field-granular change detection. The default swaps on every scan.
    fn changed(&self, _prev: &Self::Conf, _next: &Self::Conf) -> bool {
        true
    }

    /// Invoked after a changed configuration commits.
    async fn notify(&self) {}
}

struct Loaded<C> {
    newest: SystemTime,
    conf: Option<Arc<C>>,
}

pub struct ConfWatcher<T: WatchTarget> {
    target: Arc<T>,
    path: PathBuf,
    loaded: RwLock<Loaded<T::Conf>>,
}

impl<T: WatchTarget> ConfWatcher<T> {
    pub fn new(path: impl Into<PathBuf>, target: Arc<T>) -> Self {
        ConfWatcher {
            target,
            path: path.into(),
            loaded: RwLock::new(Loaded {
                newest: SystemTime::UNIX_EPOCH,
                conf: None,
            }),
        }
    }

    /// The most recently committed configuration, if any load succeeded.
    pub fn get(&self) -> Option<Arc<T::Conf>> {
        self.loaded.read().expect("conf cell poisoned").conf.clone()
    }

    /// Synchronous check: re-parse and commit if anything changed.
    /// Called once at construction and by the background loop.
    pub async fn check(&self) -> Result<()> {
        let newest = self.loaded.read().expect("conf cell poisoned").newest;
        if !has_newer(&self.path, newest)? {
            return Ok(());
        }
        self.reload().await
    }

    async fn reload(&self) -> Result<()> {
        let mut newest = SystemTime::now();
        let docs = collect_docs(&self.path, &mut newest)?;
        if docs.is_empty() {
            return Err(Error::Config(format!(
                "no configuration documents under {}",
                self.path.display()
            )));
        }

        let mut acc: Option<T::Conf> = None;
        for doc in docs {
            let raw = parse_doc::<T::Raw>(&doc)?;
            let typed = self.target.convert(raw).await?;
            acc = Some(match acc {
                Some(prev) => self.target.merge(prev, typed)?,
                None => typed,
            });
        }
        let next = acc.expect("at least one document");

        let changed = {
            let guard = self.loaded.read().expect("conf cell poisoned");
            match guard.conf.as_deref() {
                Some(prev) => self.target.changed(prev, &next),
                None => true,
            }
        };

        if !changed {
            // Content is the same; remember the newest mtime anyway so
            // untouched files are not re-parsed every minute.
            debug!(path = %self.path.display(), "configuration unchanged");
            self.loaded.write().expect("conf cell poisoned").newest = newest;
            return Ok(());
        }

        {
            let mut guard = self.loaded.write().expect("conf cell poisoned");
            guard.newest = newest;
            guard.conf = Some(Arc::new(next));
        }
        self.target.notify().await;
        Ok(())
    }

    /// Starts the once-per-minute background check.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        let watcher = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("confwatch shutting down");
                        return;
                    }
                    _ = tokio::time::sleep(CHECK_EVERY) => {
                        if let Err(err) = watcher.check().await {
                            warn!(path = %watcher.path.display(), %err, "configuration check failed");
                        }
                    }
                }
            }
        });
    }
}

fn is_conf(name: &str) -> bool {
    let Some((stem, ext)) = name.rsplit_once('.') else {
        return false;
    };
    if stem.is_empty() {
        return false;
    }
    matches!(ext.to_ascii_lowercase().as_str(), "yaml" | "json")
}

fn parse_doc<R: DeserializeOwned>(path: &Path) -> Result<R> {
    let content = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let parsed = match ext.as_str() {
        "json" => serde_json::from_str(&content)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display()))),
        _ => serde_yaml::from_str(&content)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display()))),
    }?;
    Ok(parsed)
}

/// Collects document paths: a lone file, or a recursive walk where each
/// directory's entries process in ascending filename order. Dot-files
/// are skipped. Tracks the newest mtime seen across directories and
/// documents.
fn collect_docs(path: &Path, newest: &mut SystemTime) -> Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(path)?;
    track(newest, meta.modified().ok());
    if meta.is_file() {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if !is_conf(name) {
            return Err(Error::Config(format!(
                "{} is not a configuration document",
                path.display()
            )));
        }
        return Ok(vec![path.to_path_buf()]);
    }

    let mut out = Vec::new();
    let mut entries: Vec<(String, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        entries.push((name, entry.path()));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, child) in entries {
        if name.is_empty() || name.starts_with('.') {
            continue;
        }
        let meta = std::fs::metadata(&child)?;
        if meta.is_dir() {
            out.extend(collect_docs(&child, newest)?);
            continue;
        }
        if !meta.is_file() || !is_conf(&name) {
            continue;
        }
        track(newest, meta.modified().ok());
        out.push(child);
    }
    Ok(out)
}

/// True if any directory or document under `path` is newer than `newest`.
fn has_newer(path: &Path, newest: SystemTime) -> Result<bool> {
    let meta = std::fs::metadata(path)?;
    if modified_after(&meta, newest) {
        return Ok(true);
    }
    if meta.is_file() {
        return Ok(false);
    }
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.is_empty() || name.starts_with('.') {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.is_dir() {
            if has_newer(&entry.path(), newest)? {
                return Ok(true);
            }
            continue;
        }
        if !meta.is_file() || !is_conf(&name) {
            continue;
        }
        if modified_after(&meta, newest) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn modified_after(meta: &std::fs::Metadata, newest: SystemTime) -> bool {
    meta.modified().map(|m| m > newest).unwrap_or(true)
}

fn track(newest: &mut SystemTime, modified: Option<SystemTime>) {
    if let Some(m) = modified {
        if m > *newest {
            *newest = m;
        }
    }
}

/// Parses a human duration: plain seconds, or `<n>s`, `<n>m`, `<n>h`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::Config("empty duration".into()));
    }
    let (num, unit) = match raw.char_indices().rfind(|(_, c)| c.is_ascii_digit()) {
        Some((idx, _)) => raw.split_at(idx + 1),
        None => return Err(Error::Config(format!("invalid duration {raw:?}"))),
    };
    let value: u64 = num
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration {raw:?}")))?;
    let secs = match unit.trim() {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => {
            return Err(Error::Config(format!(
                "invalid duration unit {other:?} in {raw:?}"
            )))
        }
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default, Deserialize)]
    struct RawDoc {
        #[serde(default)]
        values: Vec<String>,
        #[serde(default)]
        fail: bool,
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Doc {
        values: Vec<String>,
    }

    #[derive(Default)]
    struct Target {
        notified: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl WatchTarget for Target {
        type Raw = RawDoc;
        type Conf = Doc;

        async fn convert(&self, raw: RawDoc) -> Result<Doc> {
            if raw.fail {
                return Err(Error::Config("asked to fail".into()));
            }
            Ok(Doc { values: raw.values })
        }

        fn merge(&self, mut acc: Doc, next: Doc) -> Result<Doc> {
            acc.values.extend(next.values);
            Ok(acc)
        }

        fn changed(&self, prev: &Doc, next: &Doc) -> bool {
            prev != next
        }

        async fn notify(&self) {
            self.notified.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn merges_in_filename_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20-b.yaml"), "values: [two]").unwrap();
        std::fs::write(dir.path().join("10-a.yaml"), "values: [one]").unwrap();
        std::fs::write(dir.path().join("30-c.json"), r#"{"values": ["three"]}"#).unwrap();
        std::fs::write(dir.path().join(".hidden.yaml"), "values: [never]").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let watcher = ConfWatcher::new(dir.path(), Arc::new(Target::default()));
        watcher.check().await.unwrap();
        let doc = watcher.get().unwrap();
        assert_eq!(doc.values, vec!["one", "two", "three"]);
        assert_eq!(watcher.target.notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_convert_keeps_previous() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("conf.yaml");
        std::fs::write(&file, "values: [good]").unwrap();

        let watcher = ConfWatcher::new(dir.path(), Arc::new(Target::default()));
        watcher.check().await.unwrap();
        assert_eq!(watcher.get().unwrap().values, vec!["good"]);

        std::fs::write(&file, "fail: true").unwrap();
        bump_mtime(&file);
        assert!(watcher.check().await.is_err());
        assert_eq!(watcher.get().unwrap().values, vec!["good"]);
    }

    #[tokio::test]
    async fn unchanged_content_suppresses_notify() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("conf.yaml");
        std::fs::write(&file, "values: [same]").unwrap();

        let watcher = ConfWatcher::new(dir.path(), Arc::new(Target::default()));
        watcher.check().await.unwrap();
        assert_eq!(watcher.target.notified.load(Ordering::SeqCst), 1);

        // Touch without changing content: mtime advances, no notify.
        bump_mtime(&file);
        watcher.check().await.unwrap();
        assert_eq!(watcher.target.notified.load(Ordering::SeqCst), 1);

        // And the tracked mtime advanced, so the next check is a no-op
        // that never re-parses (same outcome, exercised for coverage).
        watcher.check().await.unwrap();
        assert_eq!(watcher.target.notified.load(Ordering::SeqCst), 1);
    }

    fn bump_mtime(path: &Path) {
        let content = std::fs::read(path).unwrap();
        // Sleep past coarse filesystem timestamp granularity.
        std::thread::sleep(Duration::from_millis(1100));
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
    }
}
