//! Scanner end-to-end: real directories, a file-backed store, and real
//! (tiny) encoded images.

use sqlx::Row;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tagpipe_core::interner::{HashManager, HashSource, InternerQueries, TagManager};
use tagpipe_core::scanner::Scanner;
use tagpipe_core::tags::TagSource;
use tokio_util::sync::CancellationToken;

struct Env {
    _dir: tempfile::TempDir,
    base: PathBuf,
    cache: PathBuf,
    conf: PathBuf,
    pool: sqlx::SqlitePool,
    tm: Arc<TagManager>,
    hm: Arc<HashManager>,
}

async fn setup() -> Env {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = dir.path().join("t1");
    let cache = dir.path().join("imgcache");
    let conf = dir.path().join("conf");
    std::fs::create_dir_all(&base).unwrap();
    std::fs::create_dir_all(&conf).unwrap();

    let db_path = dir.path().join("store.sqlite").to_string_lossy().into_owned();
    let pool = storage::connect(&db_path).await.expect("connect");
    storage::migrate(&pool).await.expect("migrate");

    let tm = TagManager::with_pool(pool.clone(), &InternerQueries::default());
    let hm = HashManager::with_pool(pool.clone(), &InternerQueries::default());

    let conf_doc = serde_json::json!({
        "database": db_path,
        "imagecache": cache.to_string_lossy(),
        "queries": {
            "paths-select": storage::queries::PATHS_SELECT,
            "paths-insert": storage::queries::PATHS_INSERT,
            "paths-update": storage::queries::PATHS_UPDATE,
            "paths-disable": storage::queries::PATHS_DISABLE,
            "files-select": storage::queries::FILES_SELECT,
            "files-insert": storage::queries::FILES_INSERT,
            "files-update": storage::queries::FILES_UPDATE,
            "files-disable": storage::queries::FILES_DISABLE,
        },
        "bases": {
            base.to_string_lossy().into_owned(): { "base": 1, "checkinterval": "10s" }
        }
    });
    std::fs::write(
        conf.join("scanner.json"),
        serde_json::to_string_pretty(&conf_doc).unwrap(),
    )
    .unwrap();

    Env {
        _dir: dir,
        base,
        cache,
        conf,
        pool,
        tm,
        hm,
    }
}

async fn scanner(env: &Env) -> Scanner {
    Scanner::new(
        env.conf.clone(),
        Arc::clone(&env.tm) as Arc<dyn TagSource>,
        Arc::clone(&env.hm) as Arc<dyn HashSource>,
        CancellationToken::new(),
    )
    .await
    .expect("scanner")
}

fn write_jpeg(path: &Path, w: u32, h: u32, seed: u8) {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_fn(w, h, |x, y| {
        image::Rgb([seed.wrapping_add(x as u8), y as u8, 100])
    }));
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, image::ImageFormat::Jpeg).unwrap();
    std::fs::write(path, bytes.into_inner()).unwrap();
}

fn sha256_hex(path: &Path) -> String {
    use sha2::Digest;
    let bytes = std::fs::read(path).unwrap();
    hex::encode(sha2::Sha256::digest(bytes))
}

async fn path_rows(pool: &sqlx::SqlitePool) -> Vec<(i64, i64, String, String, bool)> {
    sqlx::query("SELECT pid, bid, name, tags, enabled FROM paths ORDER BY pid")
        .fetch_all(pool)
        .await
        .unwrap()
        .into_iter()
        .map(|r| {
            (
                r.get(0),
                r.get(1),
                r.get::<String, _>(2),
                r.get::<String, _>(3),
                r.get::<bool, _>(4),
            )
        })
        .collect()
}

async fn file_rows(pool: &sqlx::SqlitePool) -> Vec<(i64, i64, String, String, bool)> {
    sqlx::query("SELECT fid, pid, name, tags, enabled FROM files ORDER BY fid")
        .fetch_all(pool)
        .await
        .unwrap()
        .into_iter()
        .map(|r| {
            (
                r.get(0),
                r.get(1),
                r.get::<String, _>(2),
                r.get::<String, _>(3),
                r.get::<bool, _>(4),
            )
        })
        .collect()
}

#[tokio::test]
async fn fresh_base_populates_store_and_cache() {
    let env = setup().await;
    let sub = env.base.join("a");
    std::fs::create_dir_all(&sub).unwrap();
    write_jpeg(&sub.join("x.jpg"), 64, 48, 1);
    std::fs::write(sub.join("x.txt"), "sun\n  mountain \n\n").unwrap();

    let scanner = scanner(&env).await;
    scanner.scan_base(1).await.unwrap();

    // Exactly one path row: the base root holds no images.
    let paths = path_rows(&env.pool).await;
    assert_eq!(paths.len(), 1);
    let (pid, bid, name, tags, enabled) = &paths[0];
    assert_eq!((*bid, name.as_str(), tags.as_str(), *enabled), (1, "a", "[]", true));

    let files = file_rows(&env.pool).await;
    assert_eq!(files.len(), 1);
    let (_, fpid, fname, ftags, fenabled) = &files[0];
    assert_eq!((fpid, fname.as_str(), *fenabled), (pid, "x.jpg", true));

    let sun = env.tm.get("sun").await.unwrap();
    let mountain = env.tm.get("mountain").await.unwrap();
    let mut want = vec![sun, mountain];
    want.sort_unstable();
    assert_eq!(storage::decode_tags(ftags), want);

    // Canonical cache entry exists, is sharded, and decodes.
    let hash = sha256_hex(&sub.join("x.jpg"));
    let cached = env
        .cache
        .join(&hash[0..1])
        .join(&hash[1..2])
        .join(format!("{hash}.png"));
    assert!(cached.exists(), "missing {cached:?}");
    image::open(&cached).expect("cache entry decodes");

    // The stored hash id resolves back to the hex digest.
    let hid: i64 = sqlx::query_scalar("SELECT hid FROM files")
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert_eq!(env.hm.get_hash(hid as u64).await.unwrap(), hash);
}

#[tokio::test]
async fn sidecar_orphan_inserts_nothing() {
    let env = setup().await;
    let sub = env.base.join("a");
    std::fs::create_dir_all(&sub).unwrap();
    std::fs::write(sub.join("y.txt"), "ghost\n").unwrap();

    let scanner = scanner(&env).await;
    scanner.scan_base(1).await.unwrap();

    assert!(file_rows(&env.pool).await.is_empty());
    assert!(path_rows(&env.pool).await.is_empty());

    // A later pass stays clean too.
    scanner.scan_base(1).await.unwrap();
    assert!(file_rows(&env.pool).await.is_empty());
}

#[tokio::test]
async fn file_deletion_converges() {
    let env = setup().await;
    let sub = env.base.join("a");
    std::fs::create_dir_all(&sub).unwrap();
    write_jpeg(&sub.join("x.jpg"), 32, 32, 2);
    write_jpeg(&sub.join("keep.jpg"), 32, 32, 3);
    std::fs::write(sub.join("x.txt"), "one\n").unwrap();
    std::fs::write(sub.join("keep.txt"), "two\n").unwrap();

    let scanner = scanner(&env).await;
    scanner.scan_base(1).await.unwrap();
    assert_eq!(file_rows(&env.pool).await.len(), 2);

    std::thread::sleep(std::time::Duration::from_millis(20));
    std::fs::remove_file(sub.join("x.jpg")).unwrap();
    std::fs::remove_file(sub.join("x.txt")).unwrap();
    scanner.scan_base(1).await.unwrap();

    let files = file_rows(&env.pool).await;
    assert_eq!(files.len(), 2);
    for (_, _, name, _, enabled) in &files {
        if name == "x.jpg" {
            assert!(!enabled, "removed file should be disabled");
        } else {
            assert!(enabled);
        }
    }
    // The path keeps living while a file remains.
    let paths = path_rows(&env.pool).await;
    assert_eq!(paths.len(), 1);
    assert!(paths[0].4);

    // Further passes stay converged.
    scanner.scan_base(1).await.unwrap();
    let files = file_rows(&env.pool).await;
    assert_eq!(files.len(), 2);
}

#[tokio::test]
async fn partial_scan_skips_unchanged_directories() {
    let env = setup().await;
    let sub = env.base.join("a");
    std::fs::create_dir_all(&sub).unwrap();
    write_jpeg(&sub.join("x.jpg"), 32, 32, 4);
    std::fs::write(sub.join("x.txt"), "quiet\n").unwrap();

    let scanner = scanner(&env).await;
    scanner.scan_base(1).await.unwrap();

    let before: (String, i64, i64) =
        sqlx::query_as::<_, (String, i64, i64)>("SELECT tags, filets, updated FROM files")
            .fetch_one(&env.pool)
            .await
            .unwrap();
    let hid_before: i64 = sqlx::query_scalar("SELECT hid FROM files")
        .fetch_one(&env.pool)
        .await
        .unwrap();

    // Rewriting file content bumps the file's mtime but not the
    // directory's, so the partial pass must not even look at it.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    write_jpeg(&sub.join("x.jpg"), 32, 32, 99);
    scanner.scan_base(1).await.unwrap();

    let after: (String, i64, i64) =
        sqlx::query_as::<_, (String, i64, i64)>("SELECT tags, filets, updated FROM files")
            .fetch_one(&env.pool)
            .await
            .unwrap();
    let hid_after: i64 = sqlx::query_scalar("SELECT hid FROM files")
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert_eq!(before, after);
    assert_eq!(hid_before, hid_after);
}

#[tokio::test]
async fn directory_tag_file_feeds_path_tags() {
    let env = setup().await;
    let sub = env.base.join("gallery");
    std::fs::create_dir_all(&sub).unwrap();
    write_jpeg(&sub.join("p.jpg"), 24, 24, 6);
    std::fs::write(sub.join("tags.txt"), "wall\nfavorites\n").unwrap();

    let scanner = scanner(&env).await;
    scanner.scan_base(1).await.unwrap();

    let wall = env.tm.get("wall").await.unwrap();
    let favorites = env.tm.get("favorites").await.unwrap();
    let mut want = vec![wall, favorites];
    want.sort_unstable();

    let paths = path_rows(&env.pool).await;
    assert_eq!(paths.len(), 1);
    assert_eq!(storage::decode_tags(&paths[0].3), want);

    // The image has no sidecar; its combined tags are the path's.
    let files = file_rows(&env.pool).await;
    assert_eq!(files.len(), 1);
    assert_eq!(storage::decode_tags(&files[0].3), want);

    // Removing the tag file strips the contribution; the image then has
    // no tags and its row stops updating while the path empties.
    std::thread::sleep(std::time::Duration::from_millis(20));
    std::fs::remove_file(sub.join("tags.txt")).unwrap();
    scanner.scan_base(1).await.unwrap();
    let paths = path_rows(&env.pool).await;
    assert_eq!(storage::decode_tags(&paths[0].3), Vec::<u64>::new());
}

#[tokio::test]
async fn base_tags_inherit_into_every_file() {
    let env = setup().await;
    // Rewrite the configuration with base-level tags before first load.
    let conf_file = env.conf.join("scanner.json");
    let mut doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&conf_file).unwrap()).unwrap();
    let bases = doc["bases"].as_object_mut().unwrap();
    for (_, base) in bases.iter_mut() {
        base["tags"] = serde_json::json!(["archive"]);
    }
    std::fs::write(&conf_file, serde_json::to_string_pretty(&doc).unwrap()).unwrap();

    let deep = env.base.join("y2020").join("summer");
    std::fs::create_dir_all(&deep).unwrap();
    write_jpeg(&deep.join("z.jpg"), 24, 24, 7);

    let scanner = scanner(&env).await;
    scanner.scan_base(1).await.unwrap();

    let archive = env.tm.get("archive").await.unwrap();
    let files = file_rows(&env.pool).await;
    assert_eq!(files.len(), 1);
    assert_eq!(storage::decode_tags(&files[0].3), vec![archive]);
}

#[tokio::test]
async fn restart_reloads_cache_and_stays_stable() {
    let env = setup().await;
    let sub = env.base.join("a");
    std::fs::create_dir_all(&sub).unwrap();
    write_jpeg(&sub.join("x.jpg"), 32, 32, 5);
    std::fs::write(sub.join("x.txt"), "stable\n").unwrap();

    {
        let scanner = scanner(&env).await;
        scanner.scan_base(1).await.unwrap();
    }
    let before = file_rows(&env.pool).await;

    // A second scanner over the same store seeds from it and converges
    // without duplicating rows.
    let scanner = scanner(&env).await;
    scanner.scan_base(1).await.unwrap();
    let after = file_rows(&env.pool).await;
    assert_eq!(before.len(), after.len());
    assert_eq!(before[0].0, after[0].0, "row ids survive restarts");
}
