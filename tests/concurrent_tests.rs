//! Concurrency tests driving [`Core`] from many tasks at once: many
//! sessions and many contexts sharing one pool.

use browser_pool_core::action::ActionRequest;
use browser_pool_core::auth::{ApiKeyStore, UserRecord, UserStore};
use browser_pool_core::browser::pool::BrowserPoolConfig;
use browser_pool_core::config::CoreConfig;
use browser_pool_core::core::Core;
use browser_pool_core::driver::mock::MockDriver;
use browser_pool_core::page::PageManager;
use browser_pool_core::CoreError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

fn demo_users() -> UserStore {
    let mut users = UserStore::new();
    users.register(UserRecord {
        user_id: "u1".into(),
        username: "demo".into(),
        roles: HashSet::from(["user".to_string()]),
        password_digest: browser_pool_core::auth::digest_secret("demo123!"),
    });
    users
}

fn core_with(pool: BrowserPoolConfig) -> Arc<Core> {
    let config = CoreConfig { pool, ..Default::default() };
    Arc::new(Core::new(config, Arc::new(MockDriver::new()), b"ct-hmac-secret", demo_users(), ApiKeyStore::new()))
}

/// Many sessions racing for a small pool: exactly `max_browsers` win, the
/// rest fail with `ResourceExhausted`, and every winner gets its own
/// browser (no two contexts are handed the same one).
#[tokio::test]
async fn concurrent_context_creation_respects_pool_capacity() {
    let core = core_with(BrowserPoolConfig {
        max_browsers: 3,
        acquire_timeout: Duration::from_millis(200),
        ..Default::default()
    });
    core.start().await.unwrap();

    let mut tasks = JoinSet::new();
    for i in 0..8 {
        let core = core.clone();
        tasks.spawn(async move { core.create_context(&format!("session-{i}")).await });
    }

    let mut browser_ids = HashSet::new();
    let mut ok = 0;
    let mut exhausted = 0;
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(ctx) => {
                assert!(browser_ids.insert(ctx.browser_id.clone()), "two contexts shared one browser");
                ok += 1;
            }
            Err(CoreError::ResourceExhausted(_)) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(exhausted, 5);

    core.shutdown(Duration::from_secs(1)).await;
}

/// Many pages created concurrently inside one context all land, each with
/// a distinct page ID, and the context's page list agrees with the count.
#[tokio::test]
async fn concurrent_page_creation_within_one_context_is_race_free() {
    let core = core_with(BrowserPoolConfig { max_browsers: 1, ..Default::default() });
    core.start().await.unwrap();

    let ctx = core.create_context("session-a").await.unwrap();
    let context_id = ctx.context_id.clone();

    let mut tasks = JoinSet::new();
    for _ in 0..25 {
        let core = core.clone();
        let context_id = context_id.clone();
        tasks.spawn(async move {
            core.create_page(&context_id, "session-a", PageManager::default_options()).await
        });
    }

    let mut page_ids = HashSet::new();
    while let Some(result) = tasks.join_next().await {
        let page = result.unwrap().unwrap();
        assert!(page_ids.insert(page.page_id), "duplicate page id handed out under contention");
    }
    assert_eq!(page_ids.len(), 25);

    core.shutdown(Duration::from_secs(1)).await;
}

/// Logging the same user in from many tasks concurrently never hands out
/// the same session ID twice, and every session is independently usable.
#[tokio::test]
async fn concurrent_logins_for_the_same_user_are_isolated() {
    let core = core_with(BrowserPoolConfig::default());

    let mut tasks = JoinSet::new();
    for _ in 0..20 {
        let core = core.clone();
        tasks.spawn(async move { core.create_session("demo", "demo123!", None) });
    }

    let mut session_ids = HashSet::new();
    while let Some(result) = tasks.join_next().await {
        let login = result.unwrap().unwrap();
        assert!(session_ids.insert(login.session_id), "duplicate session id under concurrent login");
    }
    assert_eq!(session_ids.len(), 20);
}

/// Concurrent `ExecuteAction` calls against distinct pages in the same
/// context each see their own page's state, never a sibling's.
#[tokio::test]
async fn concurrent_actions_against_sibling_pages_do_not_cross_wires() {
    let core = core_with(BrowserPoolConfig { max_browsers: 1, ..Default::default() });
    core.start().await.unwrap();

    let ctx = core.create_context("session-a").await.unwrap();
    let mut pages = HashMap::new();
    for i in 0..5 {
        let page = core
            .create_page(&ctx.context_id, "session-a", PageManager::default_options())
            .await
            .unwrap();
        pages.insert(page.page_id.clone(), format!("https://example.com/page-{i}"));
    }

    let mut tasks = JoinSet::new();
    for (page_id, url) in pages.clone() {
        let core = core.clone();
        let context_id = ctx.context_id.clone();
        tasks.spawn(async move {
            let response = core
                .execute_action(
                    &context_id,
                    "session-a",
                    ActionRequest { page_id: page_id.clone(), action: "navigate".into(), args: serde_json::json!({ "url": url }) },
                )
                .unwrap();
            (page_id, response)
        });
    }

    while let Some(result) = tasks.join_next().await {
        let (page_id, response) = result.unwrap();
        assert_eq!(response.result["finalUrl"], pages[&page_id]);
    }

    core.shutdown(Duration::from_secs(1)).await;
}
