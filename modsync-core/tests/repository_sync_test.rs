//! Repository aggregation against scripted feeds

mod common;

use common::{init_test_logging, FixedFingerprint, Routes};
use modsync_core::compat::CompatTable;
use modsync_core::config::ModsyncConfig;
use modsync_core::net::{HttpClient, HttpError, HttpResponse};
use modsync_core::repo::{RepositoryAggregator, SourceContext, ALT_REPO_ID, PREMIUM_REPO_ID};
use modsync_core::store::{CacheStore, MemoryStore, PREF_PREMIUM_TOKEN};
use modsync_core::sync::DEBOUNCE_WINDOW;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

const X_URL: &str = "https://x.test/modules.json";
const API: &str = "https://production-api.androidacy.com";

fn settings(dir: &TempDir) -> ModsyncConfig {
    let mut settings = ModsyncConfig::rooted_at(dir.path());
    settings.premium.client_id = "client".to_string();
    settings
}

fn aggregator(
    settings: ModsyncConfig,
    routes: Arc<Routes>,
    store: Arc<MemoryStore>,
) -> RepositoryAggregator {
    let ctx = SourceContext {
        http: HttpClient::new(routes),
        store,
        compat: Arc::new(CompatTable::new()),
        settings: Arc::new(settings),
    };
    RepositoryAggregator::new(ctx, Arc::new(FixedFingerprint("device-1"))).unwrap()
}

fn serve_premium(routes: &Routes, index: serde_json::Value) {
    routes.text(&format!("{API}/ping"), "pong");
    routes.json(&format!("{API}/auth/register"), json!({"token": "tok-1"}));
    routes.json(&format!("{API}/auth/me"), json!({"role": "Guest"}));
    routes.json(&format!("{API}/magisk/repo"), index);
}

fn premium_index() -> serde_json::Value {
    json!({"name": "Y", "data": [{
        "codename": "foo",
        "updated_at": 50,
        "name": "Foo",
        "version": "v1",
        "versionCode": 5,
        "author": "A",
        "description": "d",
        "minApi": 21,
        "maxApi": 0,
        "minMagisk": 20000
    }]})
}

#[tokio::test]
async fn test_premium_entry_wins_over_more_recent_plain_entry() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let routes = Routes::new();
    routes.json(
        X_URL,
        json!({"name": "X", "last_update": 100, "modules": [{
            "id": "foo",
            "last_update": 100,
            "notes_url": "",
            "prop_url": "",
            "zip_url": "https://x/foo.zip",
            "checksum": ""
        }]}),
    );
    serve_premium(&routes, premium_index());

    let store = Arc::new(MemoryStore::default());
    let aggregator = aggregator(settings(&dir), routes.clone(), store.clone());
    aggregator.set_enabled(ALT_REPO_ID, false).await.unwrap();
    aggregator.add_or_get(X_URL, Some("X")).await.unwrap();

    aggregator.scan().await;
    let modules = aggregator.modules().await;

    assert_eq!(modules.len(), 1);
    let foo = &modules["foo"];
    assert_eq!(foo.repo_id, PREMIUM_REPO_ID);
    assert_eq!(foo.meta.version_code, 5);
    assert_eq!(foo.meta.min_magisk, 20000);
    assert_eq!(foo.meta.last_updated, 50_000);
    assert_eq!(store.pref(PREF_PREMIUM_TOKEN).unwrap().as_deref(), Some("tok-1"));
    assert!(aggregator.last_report().is_success());
}

#[tokio::test]
async fn test_premium_wins_even_against_higher_version_with_metadata() {
    let dir = TempDir::new().unwrap();
    let routes = Routes::new();
    routes.json(
        X_URL,
        json!({"name": "X", "last_update": 100, "modules": [{
            "id": "foo",
            "last_update": 100,
            "prop_url": "https://x.test/foo.prop",
            "zip_url": "https://x/foo.zip"
        }]}),
    );
    routes.text(
        "https://x.test/foo.prop",
        "id=foo\nname=Foo from X\nversion=v9\nversionCode=9\nauthor=B\ndescription=Another build\n",
    );
    serve_premium(&routes, premium_index());

    let store = Arc::new(MemoryStore::default());
    let aggregator = aggregator(settings(&dir), routes.clone(), store.clone());
    aggregator.set_enabled(ALT_REPO_ID, false).await.unwrap();
    let x = aggregator.add_or_get(X_URL, Some("X")).await.unwrap();

    aggregator.scan().await;
    assert_eq!(aggregator.modules().await["foo"].repo_id, PREMIUM_REPO_ID);
    // X still cached its own row
    assert_eq!(store.module_rows(&x.id).unwrap()[0].version_code, 9);

    // With the premium source off, the highest versionCode wins
    aggregator.set_enabled(PREMIUM_REPO_ID, false).await.unwrap();
    tokio::time::sleep(DEBOUNCE_WINDOW * 2).await;
    aggregator.scan().await;
    let foo = &aggregator.modules().await["foo"];
    assert_eq!(foo.repo_id, x.id);
    assert_eq!(foo.meta.version_code, 9);
}

#[tokio::test]
async fn test_missing_client_id_skips_premium_fetch() {
    let dir = TempDir::new().unwrap();
    let routes = Routes::new();
    serve_premium(&routes, premium_index());

    let store = Arc::new(MemoryStore::default());
    let aggregator = aggregator(ModsyncConfig::rooted_at(dir.path()), routes.clone(), store);
    aggregator.set_enabled(ALT_REPO_ID, false).await.unwrap();
    aggregator.scan().await;

    assert!(aggregator.modules().await.is_empty());
    assert_eq!(routes.hit_count(API), 0);
}

#[tokio::test]
async fn test_fresh_premium_index_is_rebuilt_from_cache_rows() {
    let dir = TempDir::new().unwrap();
    let routes = Routes::new();
    serve_premium(&routes, premium_index());
    let store = Arc::new(MemoryStore::default());

    let first = aggregator(settings(&dir), routes.clone(), store.clone());
    first.set_enabled(ALT_REPO_ID, false).await.unwrap();
    first.scan().await;
    assert_eq!(store.module_rows(PREMIUM_REPO_ID).unwrap().len(), 1);
    let index_hits = routes.hit_count(&format!("{API}/magisk/repo"));

    // A second process start within the refresh window reads the rows
    let second = aggregator(settings(&dir), routes.clone(), store.clone());
    second.scan().await;
    assert_eq!(routes.hit_count(&format!("{API}/magisk/repo")), index_hits);
    let foo = &second.modules().await["foo"];
    assert_eq!(foo.meta.version_code, 5);
    assert_eq!(foo.meta.name.as_deref(), Some("Foo"));
}

#[tokio::test]
async fn test_cached_premium_entry_keeps_checksum_and_token() {
    let dir = TempDir::new().unwrap();
    let routes = Routes::new();
    let mut index = premium_index();
    index["data"][0]["checksum"] = json!("ab".repeat(32));
    serve_premium(&routes, index);
    let store = Arc::new(MemoryStore::default());

    let first = aggregator(settings(&dir), routes.clone(), store.clone());
    first.set_enabled(ALT_REPO_ID, false).await.unwrap();
    first.scan().await;
    let row = &store.module_rows(PREMIUM_REPO_ID).unwrap()[0];
    assert!(!row.zip_url.contains("token="));

    let second = aggregator(settings(&dir), routes.clone(), store.clone());
    second.scan().await;
    let foo = &second.modules().await["foo"];
    assert_eq!(foo.checksum.as_deref(), Some("ab".repeat(32).as_str()));
    let zip_url = foo.zip_url.as_deref().unwrap();
    assert!(zip_url.starts_with(&format!("{API}/magisk/info/foo")));
    assert_eq!(zip_url.matches("token=tok-1").count(), 1);
}

#[tokio::test]
async fn test_unauthorized_token_is_replaced() {
    let dir = TempDir::new().unwrap();
    let routes = Routes::new();
    serve_premium(&routes, premium_index());
    routes.respond(
        &format!("{API}/auth/me?token=stale"),
        HttpResponse::with_status(401),
    );

    let store = Arc::new(MemoryStore::default());
    store.set_pref(PREF_PREMIUM_TOKEN, Some("stale")).unwrap();
    let aggregator = aggregator(settings(&dir), routes.clone(), store.clone());
    aggregator.set_enabled(ALT_REPO_ID, false).await.unwrap();
    aggregator.scan().await;

    assert_eq!(store.pref(PREF_PREMIUM_TOKEN).unwrap().as_deref(), Some("tok-1"));
    assert_eq!(routes.hit_count(&format!("{API}/auth/register")), 1);
    assert!(routes
        .hits()
        .iter()
        .any(|url| url.starts_with(&format!("{API}/magisk/repo?token=tok-1&"))));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_fetch_gives_up_after_retries() {
    let routes = Routes::new();
    routes.respond("https://limited.test/", HttpResponse::with_status(429));
    let client = HttpClient::new(routes.clone());

    let started = tokio::time::Instant::now();
    let err = client
        .get("https://limited.test/modules.json")
        .await
        .unwrap_err();

    assert!(matches!(err, HttpError::RateLimited { attempts: 6, .. }));
    assert!(err.should_back_off());
    assert_eq!(routes.hit_count("https://limited.test/"), 6);
    // 1s + 2s + 3s + 4s + 5s of back-off
    assert_eq!(started.elapsed().as_secs(), 15);
}
