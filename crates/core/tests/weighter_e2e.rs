//! Weighter end-to-end: index invariants, draw distribution and handle
//! behavior across hot swaps.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tagpipe_core::interner::{InternerQueries, TagManager};
use tagpipe_core::tags::TagSource;
use tagpipe_core::weighter::Weighter;
use tokio_util::sync::CancellationToken;

struct Env {
    _dir: tempfile::TempDir,
    conf: PathBuf,
    pool: sqlx::SqlitePool,
    tm: Arc<TagManager>,
}

async fn setup(profiles: serde_json::Value) -> Env {
    let dir = tempfile::tempdir().expect("tempdir");
    let conf = dir.path().join("conf");
    std::fs::create_dir_all(&conf).unwrap();

    let db_path = dir.path().join("store.sqlite").to_string_lossy().into_owned();
    let pool = storage::connect(&db_path).await.expect("connect");
    storage::migrate(&pool).await.expect("migrate");
    let tm = TagManager::with_pool(pool.clone(), &InternerQueries::default());

    let conf_doc = serde_json::json!({
        "database": db_path,
        "pollinterval": "1s",
        "fullinterval": "1m",
        "profile": profiles,
        "queries": {
            "full": storage::queries::WEIGHT_FULL,
            "poll": "SELECT mid, hid, tags, (enabled AND NOT blocked) FROM merged",
        }
    });
    std::fs::write(
        conf.join("weighter.json"),
        serde_json::to_string_pretty(&conf_doc).unwrap(),
    )
    .unwrap();

    Env {
        _dir: dir,
        conf,
        pool,
        tm,
    }
}

async fn weighter(env: &Env) -> Weighter {
    let we = Weighter::new(
        env.conf.clone(),
        Arc::clone(&env.tm) as Arc<dyn TagSource>,
        CancellationToken::new(),
    )
    .await
    .expect("weighter");
    we.run_full().await.expect("initial full");
    we
}

async fn seed_merged(env: &Env, mid: i64, hid: u64, tags: &[u64]) {
    sqlx::query(
        "INSERT INTO merged (mid, hid, tags) VALUES (?1, ?2, ?3) \
         ON CONFLICT (hid) DO UPDATE SET tags = excluded.tags, enabled = 1",
    )
    .bind(mid)
    .bind(hid as i64)
    .bind(storage::encode_tags(tags))
    .execute(&env.pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn draw_distribution_follows_weights() {
    let env = setup(serde_json::json!({
        "wall": { "weights": { "heavy": 3, "light": 1 } }
    }))
    .await;
    let heavy = env.tm.get("heavy").await.unwrap();
    let light = env.tm.get("light").await.unwrap();
    seed_merged(&env, 1, 1, &[heavy]).await;
    seed_merged(&env, 2, 2, &[light]).await;

    let we = weighter(&env).await;
    let profile = we.get_profile("wall").unwrap();

    let mut counts: HashMap<i64, u64> = HashMap::new();
    for _ in 0..100_000 {
        for id in profile.get(1).unwrap() {
            *counts.entry(id).or_default() += 1;
        }
    }
    let heavy_count = counts[&1];
    assert_eq!(counts.values().sum::<u64>(), 100_000);
    // 95% envelope around the 3:1 expectation.
    assert!(
        (heavy_count as i64 - 75_000).abs() < 1_500,
        "heavy drawn {heavy_count} times"
    );
}

#[tokio::test]
async fn index_only_holds_matching_positive_images() {
    let env = setup(serde_json::json!({
        "wall": {
            "any": ["family"],
            "none": ["private"],
            "weights": { "family": 5, "boring": -10 }
        }
    }))
    .await;
    let family = env.tm.get("family").await.unwrap();
    let private = env.tm.get("private").await.unwrap();
    let boring = env.tm.get("boring").await.unwrap();
    let other = env.tm.get("other").await.unwrap();

    // Eligible; excluded by the match rule; excluded by the whitelist;
    // excluded by a non-positive score.
    seed_merged(&env, 1, 1, &[family]).await;
    seed_merged(&env, 2, 2, &[family, private]).await;
    seed_merged(&env, 3, 3, &[other]).await;
    seed_merged(&env, 4, 4, &[family, boring]).await;

    let we = weighter(&env).await;
    let profile = we.get_profile("wall").unwrap();
    for _ in 0..500 {
        for id in profile.get(4).unwrap() {
            assert_eq!(id, 1, "only the eligible image may be drawn");
        }
    }
}

#[tokio::test]
async fn unknown_profile_is_an_error() {
    let env = setup(serde_json::json!({
        "wall": { "weights": { "x": 1 } }
    }))
    .await;
    let we = weighter(&env).await;
    assert!(we.get_profile("nope").is_err());
}

#[tokio::test]
async fn stale_handles_reresolve_after_swap() {
    let env = setup(serde_json::json!({
        "wall": { "weights": { "art": 2 } }
    }))
    .await;
    let art = env.tm.get("art").await.unwrap();
    seed_merged(&env, 1, 1, &[art]).await;
    seed_merged(&env, 2, 2, &[art]).await;

    let we = weighter(&env).await;
    let profile = we.get_profile("wall").unwrap();
    let seen: std::collections::HashSet<i64> =
        (0..200).flat_map(|_| profile.get(1).unwrap()).collect();
    assert_eq!(seen, [1, 2].into_iter().collect());

    // Image 1 drops out; the rebuild swaps indices and the old handle
    // must follow without being re-created.
    sqlx::query("UPDATE merged SET enabled = 0 WHERE mid = 1")
        .execute(&env.pool)
        .await
        .unwrap();
    we.run_full().await.unwrap();

    for _ in 0..200 {
        for id in profile.get(1).unwrap() {
            assert_eq!(id, 2, "stale handle still drew a removed image");
        }
    }
}

#[tokio::test]
async fn poll_updates_feed_the_index() {
    let env = setup(serde_json::json!({
        "wall": { "weights": { "sky": 1 } }
    }))
    .await;
    let sky = env.tm.get("sky").await.unwrap();

    let we = weighter(&env).await;
    let profile = we.get_profile("wall").unwrap();
    assert!(profile.get(1).unwrap().is_empty(), "no images yet");

    seed_merged(&env, 5, 9, &[sky]).await;
    we.run_poll().await.unwrap();
    assert_eq!(profile.get(1).unwrap(), vec![5]);
    assert_eq!(we.hash_id(5).await, Some(9));
    assert_eq!(we.hash_id(404).await, None);
}
