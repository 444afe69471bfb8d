//! End-to-end tests driving [`Core`] the way a transport façade would:
//! authenticate, create a context, dispatch actions, tear down.

use browser_pool_core::action::ActionRequest;
use browser_pool_core::auth::{ApiKeyStore, UserRecord, UserStore};
use browser_pool_core::browser::pool::BrowserPoolConfig;
use browser_pool_core::config::CoreConfig;
use browser_pool_core::core::{Core, HealthStatus};
use browser_pool_core::driver::mock::MockDriver;
use browser_pool_core::page::PageManager;
use browser_pool_core::CoreError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

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

fn core_with(pool: BrowserPoolConfig) -> Core {
    let config = CoreConfig { pool, ..Default::default() };
    Core::new(config, Arc::new(MockDriver::new()), b"it-hmac-secret", demo_users(), ApiKeyStore::new())
}

/// Login, create a context, navigate, screenshot, then delete the session
/// and confirm the context no longer answers.
#[tokio::test]
async fn happy_path_through_the_whole_stack() {
    let core = core_with(BrowserPoolConfig { max_browsers: 2, ..Default::default() });
    core.start().await.unwrap();

    let login = core.create_session("demo", "demo123!", Some(Duration::from_secs(3600))).unwrap();
    assert!(!login.access_token.is_empty());
    assert!(!login.refresh_token.is_empty());

    let ctx = core.create_context(&login.session_id).await.unwrap();
    let page = core
        .create_page(&ctx.context_id, &login.session_id, PageManager::default_options())
        .await
        .unwrap();

    let nav = core
        .execute_action(
            &ctx.context_id,
            &login.session_id,
            ActionRequest {
                page_id: page.page_id.clone(),
                action: "navigate".into(),
                args: serde_json::json!({ "url": "https://example.com" }),
            },
        )
        .unwrap();
    assert_eq!(nav.result["ok"], true);
    assert_eq!(nav.result["finalUrl"], "https://example.com");
    assert_eq!(nav.result["title"], "Example Domain");

    let shot = core
        .execute_action(
            &ctx.context_id,
            &login.session_id,
            ActionRequest {
                page_id: page.page_id.clone(),
                action: "screenshot".into(),
                args: serde_json::json!({ "fullPage": true }),
            },
        )
        .unwrap();
    assert!(shot.result.is_array() || shot.result.is_string() || shot.result.is_object());

    core.delete_session(&login.session_id).unwrap();

    let err = core
        .execute_action(
            &ctx.context_id,
            &login.session_id,
            ActionRequest { page_id: page.page_id, action: "metrics".into(), args: serde_json::Value::Null },
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_) | CoreError::Forbidden(_)));

    core.shutdown(Duration::from_secs(1)).await;
}

/// `maxBrowsers = 2`, three concurrent callers each trying to stand up
/// their own context: exactly two succeed, the third fails with
/// `ResourceExhausted` within roughly `acquireTimeout`.
#[tokio::test]
async fn saturated_pool_rejects_the_third_concurrent_caller() {
    let core = Arc::new(core_with(BrowserPoolConfig {
        max_browsers: 2,
        acquire_timeout: Duration::from_millis(200),
        ..Default::default()
    }));
    core.start().await.unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..3 {
        let core = core.clone();
        tasks.spawn(async move { core.create_context(&format!("session-{i}")).await });
    }

    let mut ok = 0;
    let mut exhausted = 0;
    let started = std::time::Instant::now();
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(_) => ok += 1,
            Err(CoreError::ResourceExhausted(_)) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(ok, 2);
    assert_eq!(exhausted, 1);
    assert!(started.elapsed() < Duration::from_secs(1), "the loser should fail quickly, not hang");

    core.shutdown(Duration::from_secs(1)).await;
}

/// One session's context is opaque to another session, and the denied
/// call never reaches the target page.
#[tokio::test]
async fn a_session_cannot_drive_another_sessions_context() {
    let core = core_with(BrowserPoolConfig { max_browsers: 2, ..Default::default() });
    core.start().await.unwrap();

    let ctx = core.create_context("session-a").await.unwrap();
    let page = core
        .create_page(&ctx.context_id, "session-a", PageManager::default_options())
        .await
        .unwrap();

    let err = core
        .execute_action(
            &ctx.context_id,
            "session-b",
            ActionRequest { page_id: page.page_id.clone(), action: "navigate".into(), args: serde_json::json!({ "url": "https://example.com" }) },
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::Forbidden(_)));

    // The rightful owner can still drive the page afterwards.
    let ok = core
        .execute_action(
            &ctx.context_id,
            "session-a",
            ActionRequest { page_id: page.page_id, action: "metrics".into(), args: serde_json::Value::Null },
        )
        .is_ok();
    assert!(ok);

    core.shutdown(Duration::from_secs(1)).await;
}

/// Bad credentials never create a session.
#[tokio::test]
async fn wrong_password_does_not_authenticate() {
    let core = core_with(BrowserPoolConfig::default());
    let err = core.create_session("demo", "not-the-password", None).unwrap_err();
    assert!(matches!(err, CoreError::Unauthenticated(_)));
}

/// `Health()` reflects a freshly warmed, unsaturated pool as healthy, and
/// `Catalog()` lists every action the dispatch table recognizes.
#[tokio::test]
async fn health_and_catalog_reflect_a_quiet_pool() {
    let core = core_with(BrowserPoolConfig { max_browsers: 2, ..Default::default() });
    core.start().await.unwrap();

    let report = core.health();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.issues.is_empty());

    let catalog = core.catalog();
    for action in ["navigate", "evaluate", "click", "type", "screenshot", "pdf", "cookie", "close"] {
        assert!(catalog.actions.contains(&action), "catalog missing '{action}'");
    }
    assert!(catalog.auth_methods.contains(&"bearer"));

    core.shutdown(Duration::from_secs(1)).await;
}
