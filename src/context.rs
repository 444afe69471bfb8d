//! C9: context manager.
//!
//! A context groups a session's pages inside one already-acquired browser,
//! the core's analogue of a browser-profile/incognito
//! context. `ExecuteAction` is the single entry point a caller uses to
//! drive any one page inside a context; it forwards into the action
//! executor (C10) after verifying context ownership here, so every action
//! passes through exactly one ownership check regardless of which action
//! it is.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::action::{ActionExecutor, ActionRequest, ActionResponse};
use crate::browser::pool::BrowserPool;
use crate::clock::{Clock, IdGenerator};
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::page::{PageManager, PageOptions};

/// Public, client-visible snapshot of one context.
#[derive(Debug, Clone)]
pub struct ContextInfo {
    pub context_id: String,
    pub session_id: String,
    pub browser_id: String,
    pub created_at: DateTime<Utc>,
    pub page_ids: Vec<String>,
}

struct ContextEntry {
    session_id: String,
    browser_id: String,
    created_at: DateTime<Utc>,
    page_ids: Mutex<HashSet<String>>,
}

/// `(contextId -> context)` layered over the page manager and the pool.
pub struct ContextManager {
    contexts: DashMap<String, ContextEntry>,
    pool: Arc<BrowserPool>,
    pages: Arc<PageManager>,
    actions: Arc<ActionExecutor>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: EventBus,
}

impl ContextManager {
    pub fn new(
        pool: Arc<BrowserPool>,
        pages: Arc<PageManager>,
        actions: Arc<ActionExecutor>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        events: EventBus,
    ) -> Self {
        Self {
            contexts: DashMap::new(),
            pool,
            pages,
            actions,
            clock,
            ids,
            events,
        }
    }

    fn entry(&self, context_id: &str, session_id: &str) -> Result<dashmap::mapref::one::Ref<'_, String, ContextEntry>> {
        let entry = self
            .contexts
            .get(context_id)
            .ok_or_else(|| CoreError::NotFound(format!("context {context_id} not found")))?;
        if entry.session_id != session_id {
            self.events.publish(CoreEvent::OwnershipViolation {
                resource_id: context_id.to_string(),
                session_id: session_id.to_string(),
            });
            return Err(CoreError::Forbidden(format!(
                "session {session_id} does not own context {context_id}"
            )));
        }
        Ok(entry)
    }

    /// Create a context for `session_id`, acquiring (or reusing, if sticky)
    /// a browser from the pool. Fails with whatever `acquire` fails with,
    /// typically `ResourceExhausted` under saturation.
    pub async fn create_context(&self, session_id: &str) -> Result<ContextInfo> {
        let browser = self.pool.acquire(session_id).await?;
        let context_id = self.ids.new_id();
        let entry = ContextEntry {
            session_id: session_id.to_string(),
            browser_id: browser.id().to_string(),
            created_at: self.clock.now_utc(),
            page_ids: Mutex::new(HashSet::new()),
        };
        let info = self.to_info(&context_id, &entry);
        self.contexts.insert(context_id.clone(), entry);
        self.events.publish(CoreEvent::ContextCreated {
            context_id,
            session_id: session_id.to_string(),
        });
        Ok(info)
    }

    fn to_info(&self, context_id: &str, entry: &ContextEntry) -> ContextInfo {
        ContextInfo {
            context_id: context_id.to_string(),
            session_id: entry.session_id.clone(),
            browser_id: entry.browser_id.clone(),
            created_at: entry.created_at,
            page_ids: entry.page_ids.lock().expect("context page-set lock poisoned").iter().cloned().collect(),
        }
    }

    pub fn info(&self, context_id: &str, session_id: &str) -> Result<ContextInfo> {
        let entry = self.entry(context_id, session_id)?;
        Ok(self.to_info(context_id, &entry))
    }

    pub async fn create_page(&self, context_id: &str, session_id: &str, options: PageOptions) -> Result<crate::page::PageInfo> {
        let browser_id = self.entry(context_id, session_id)?.browser_id.clone();
        let page = self.pages.create(context_id, session_id, &browser_id, options).await?;
        if let Some(entry) = self.contexts.get(context_id) {
            entry
                .page_ids
                .lock()
                .expect("context page-set lock poisoned")
                .insert(page.page_id.clone());
        }
        Ok(page)
    }

    /// Single entry point for driving one page inside a context.
    /// Verifies context ownership before dispatching into the action
    /// executor, which separately re-verifies page ownership.
    pub fn execute_action(&self, context_id: &str, session_id: &str, request: ActionRequest) -> Result<ActionResponse> {
        self.entry(context_id, session_id)?;
        self.actions.execute(session_id, request)
    }

    /// Close every page in the context, then forget the context itself.
    /// Leaves the underlying browser acquired; the caller releases it
    /// (typically when the owning session ends).
    pub fn delete_context(&self, context_id: &str, session_id: &str) -> Result<()> {
        self.entry(context_id, session_id)?;
        self.pages.close_pages_for_context(context_id);
        self.contexts.remove(context_id);
        self.events.publish(CoreEvent::ContextClosed {
            context_id: context_id.to_string(),
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Best-effort: delete every context owned by `session_id`, e.g. when
    /// the session itself is deleted or expires.
    pub fn delete_contexts_for_session(&self, session_id: &str) {
        let ids: Vec<String> = self
            .contexts
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            if let Err(e) = self.delete_context(&id, session_id) {
                log::warn!("failed to close context {id} while closing session {session_id}: {e}");
            }
        }
    }

    pub fn list_for_session(&self, session_id: &str) -> Vec<ContextInfo> {
        self.contexts
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| self.to_info(e.key(), e.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionExecutor;
    use crate::browser::pool::BrowserPoolConfig;
    use crate::circuit::CircuitBreaker;
    use crate::clock::{SystemClock, UuidGenerator};
    use crate::driver::mock::MockDriver;

    async fn manager() -> Arc<ContextManager> {
        let pool = Arc::new(BrowserPool::new(
            BrowserPoolConfig { max_browsers: 2, ..Default::default() },
            Arc::new(MockDriver::new()),
            Arc::new(UuidGenerator),
            Arc::new(CircuitBreaker::new(EventBus::default())),
            EventBus::default(),
        ));
        let pages = Arc::new(PageManager::new(pool.clone(), Arc::new(SystemClock), Arc::new(UuidGenerator), EventBus::default()));
        let actions = Arc::new(ActionExecutor::new(pages.clone()));
        Arc::new(ContextManager::new(
            pool,
            pages,
            actions,
            Arc::new(SystemClock),
            Arc::new(UuidGenerator),
            EventBus::default(),
        ))
    }

    #[tokio::test]
    async fn create_context_then_create_page_tracks_membership() {
        let manager = manager().await;
        let ctx = manager.create_context("s1").await.unwrap();
        let page = manager.create_page(&ctx.context_id, "s1", PageManager::default_options()).await.unwrap();
        let info = manager.info(&ctx.context_id, "s1").unwrap();
        assert_eq!(info.page_ids, vec![page.page_id]);
    }

    #[tokio::test]
    async fn wrong_session_cannot_touch_context() {
        let manager = manager().await;
        let ctx = manager.create_context("s1").await.unwrap();
        let err = manager
            .create_page(&ctx.context_id, "s2", PageManager::default_options())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn delete_context_closes_its_pages() {
        let manager = manager().await;
        let ctx = manager.create_context("s1").await.unwrap();
        let page = manager.create_page(&ctx.context_id, "s1", PageManager::default_options()).await.unwrap();
        manager.delete_context(&ctx.context_id, "s1").unwrap();
        let err = manager.pages.info(&page.page_id, "s1").unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(manager.info(&ctx.context_id, "s1").is_err());
    }

    #[tokio::test]
    async fn deleting_unknown_context_is_not_found() {
        let manager = manager().await;
        let err = manager.delete_context("missing", "s1").unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
