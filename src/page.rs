//! C8: page manager.
//!
//! `(pageId -> PageInfo)` with session ownership enforcement, built on the
//! driver's per-page handle so the mock driver can satisfy every operation
//! deterministically in tests. Every operation here takes a
//! `sessionId` and verifies `page.sessionId == sessionId` before doing
//! anything else; a mismatch is `Forbidden` plus one audit event and never
//! touches the page.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::browser::pool::BrowserPool;
use crate::clock::{Clock, IdGenerator};
use crate::driver::{
    ClipRect, CookieOp, CookieResult, DriverCookie, ImageFormat, NavigateOptions, PageHandle,
    PdfOptions, ScreenshotOptions, WaitUntil,
};
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};

/// Default idle-sweep tick and idle threshold.
pub const DEFAULT_IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(1800);

/// Where a page sits in its own lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Active,
    Navigating,
    Idle,
    Closed,
}

/// Viewport, headers, and feature toggles a caller configures at creation
/// time.
#[derive(Debug, Clone, Default)]
pub struct PageOptions {
    pub viewport: Option<(u32, u32)>,
    pub user_agent: Option<String>,
    pub extra_headers: Vec<(String, String)>,
    pub initial_cookies: Vec<DriverCookie>,
    pub java_script_enabled: bool,
    pub bypass_csp: bool,
    pub offline: bool,
    pub cache_enabled: bool,
}

impl PageOptions {
    fn defaulted() -> Self {
        Self {
            java_script_enabled: true,
            cache_enabled: true,
            ..Default::default()
        }
    }
}

/// Public, client-visible snapshot of one page.
#[derive(Debug, Clone)]
pub struct PageInfo {
    pub page_id: String,
    pub context_id: String,
    pub session_id: String,
    pub browser_id: String,
    pub url: String,
    pub title: String,
    pub state: PageState,
    pub navigation_history: Vec<String>,
    pub error_count: u64,
    pub last_activity_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

struct PageEntry {
    handle: Box<dyn PageHandle>,
    context_id: String,
    session_id: String,
    browser_id: String,
    state: Mutex<PageState>,
    navigation_history: Mutex<Vec<String>>,
    error_count: AtomicU32,
    last_activity_at: Mutex<DateTime<Utc>>,
    metadata: Mutex<serde_json::Value>,
}

/// `(pageId -> page)` with ownership enforcement and lifecycle cleanup.
pub struct PageManager {
    pages: DashMap<String, PageEntry>,
    pool: Arc<BrowserPool>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: EventBus,
}

impl PageManager {
    pub fn new(pool: Arc<BrowserPool>, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>, events: EventBus) -> Self {
        Self {
            pages: DashMap::new(),
            pool,
            clock,
            ids,
            events,
        }
    }

    fn entry(&self, page_id: &str, session_id: &str) -> Result<dashmap::mapref::one::Ref<'_, String, PageEntry>> {
        let entry = self
            .pages
            .get(page_id)
            .ok_or_else(|| CoreError::NotFound(format!("page {page_id} not found")))?;
        if entry.session_id != session_id {
            self.events.publish(CoreEvent::OwnershipViolation {
                resource_id: page_id.to_string(),
                session_id: session_id.to_string(),
            });
            return Err(CoreError::Forbidden(format!(
                "session {session_id} does not own page {page_id}"
            )));
        }
        Ok(entry)
    }

    fn touch(&self, entry: &PageEntry) {
        *entry.last_activity_at.lock().expect("page activity lock poisoned") = self.clock.now_utc();
    }

    pub fn info(&self, page_id: &str, session_id: &str) -> Result<PageInfo> {
        let entry = self.entry(page_id, session_id)?;
        Ok(self.to_info(page_id, &entry))
    }

    fn to_info(&self, page_id: &str, entry: &PageEntry) -> PageInfo {
        PageInfo {
            page_id: page_id.to_string(),
            context_id: entry.context_id.clone(),
            session_id: entry.session_id.clone(),
            browser_id: entry.browser_id.clone(),
            url: entry.handle.current_url(),
            title: entry.handle.title(),
            state: *entry.state.lock().expect("page state lock poisoned"),
            navigation_history: entry.navigation_history.lock().expect("page history lock poisoned").clone(),
            error_count: entry.error_count.load(Ordering::SeqCst) as u64,
            last_activity_at: *entry.last_activity_at.lock().expect("page activity lock poisoned"),
            metadata: entry.metadata.lock().expect("page metadata lock poisoned").clone(),
        }
    }

    /// Create a page inside `browser_id` for `context_id`/`session_id`.
    /// The caller (the context manager) is responsible for verifying
    /// context ownership before reaching this call.
    pub async fn create(
        &self,
        context_id: &str,
        session_id: &str,
        browser_id: &str,
        options: PageOptions,
    ) -> Result<PageInfo> {
        let driver_handle = self.pool.create_page(browser_id, session_id).await?;

        if let Some((w, h)) = options.viewport {
            driver_handle.set_viewport(w, h)?;
        }
        if let Some(ua) = &options.user_agent {
            driver_handle.set_user_agent(ua)?;
        }
        if !options.extra_headers.is_empty() {
            driver_handle.set_extra_headers(&options.extra_headers)?;
        }
        driver_handle.set_js_enabled(options.java_script_enabled)?;
        driver_handle.set_cache_enabled(options.cache_enabled)?;
        driver_handle.set_offline(options.offline)?;
        if !options.initial_cookies.is_empty() {
            driver_handle.cookies(CookieOp::Set(options.initial_cookies.clone()))?;
        }

        let page_id = self.ids.new_id();
        let entry = PageEntry {
            handle: driver_handle,
            context_id: context_id.to_string(),
            session_id: session_id.to_string(),
            browser_id: browser_id.to_string(),
            state: Mutex::new(PageState::Idle),
            navigation_history: Mutex::new(Vec::new()),
            error_count: AtomicU32::new(0),
            last_activity_at: Mutex::new(self.clock.now_utc()),
            metadata: Mutex::new(serde_json::json!({})),
        };
        let info = self.to_info(&page_id, &entry);
        self.pages.insert(page_id.clone(), entry);
        self.events.publish(CoreEvent::PageCreated {
            page_id,
            context_id: context_id.to_string(),
            browser_id: browser_id.to_string(),
        });
        Ok(info)
    }

    pub fn default_options() -> PageOptions {
        PageOptions::defaulted()
    }

    pub fn navigate(
        &self,
        page_id: &str,
        session_id: &str,
        url: &str,
        options: NavigateOptions,
    ) -> Result<crate::driver::NavigateOutcome> {
        let entry = self.entry(page_id, session_id)?;
        *entry.state.lock().expect("page state lock poisoned") = PageState::Navigating;
        let result = entry.handle.navigate(url, &options);
        *entry.state.lock().expect("page state lock poisoned") = PageState::Active;
        match &result {
            Ok(outcome) => {
                entry
                    .navigation_history
                    .lock()
                    .expect("page history lock poisoned")
                    .push(outcome.final_url.clone());
                self.touch(&entry);
                self.events.publish(CoreEvent::PageNavigated {
                    page_id: page_id.to_string(),
                    url: outcome.final_url.clone(),
                    ok: true,
                });
            }
            Err(_) => {
                entry.error_count.fetch_add(1, Ordering::SeqCst);
                self.events.publish(CoreEvent::PageNavigated {
                    page_id: page_id.to_string(),
                    url: url.to_string(),
                    ok: false,
                });
            }
        }
        result
    }

    pub fn evaluate(&self, page_id: &str, session_id: &str, script: &str) -> Result<serde_json::Value> {
        let entry = self.entry(page_id, session_id)?;
        let result = entry.handle.evaluate(script);
        self.finish(&entry, page_id, &result);
        result
    }

    pub fn screenshot(&self, page_id: &str, session_id: &str, options: ScreenshotOptions) -> Result<Vec<u8>> {
        let entry = self.entry(page_id, session_id)?;
        let result = entry.handle.screenshot(&options);
        self.finish(&entry, page_id, &result);
        result
    }

    pub fn get_content(&self, page_id: &str, session_id: &str, selector: Option<&str>) -> Result<String> {
        let entry = self.entry(page_id, session_id)?;
        let result = entry.handle.content(selector);
        self.finish(&entry, page_id, &result);
        result
    }

    pub fn click(&self, page_id: &str, session_id: &str, selector: &str, click_count: u32) -> Result<()> {
        let entry = self.entry(page_id, session_id)?;
        let result = entry.handle.click(selector, click_count);
        self.finish(&entry, page_id, &result);
        result
    }

    pub fn type_text(&self, page_id: &str, session_id: &str, selector: &str, text: &str, delay: Option<Duration>) -> Result<()> {
        let entry = self.entry(page_id, session_id)?;
        let result = entry.handle.type_text(selector, text, delay);
        self.finish(&entry, page_id, &result);
        result
    }

    pub fn wait_for_selector(&self, page_id: &str, session_id: &str, selector: &str, timeout: Duration, visible: bool) -> Result<()> {
        let entry = self.entry(page_id, session_id)?;
        let result = entry.handle.wait_for_selector(selector, timeout, visible);
        self.finish(&entry, page_id, &result);
        result
    }

    pub fn cookies(&self, page_id: &str, session_id: &str, op: CookieOp) -> Result<CookieResult> {
        let entry = self.entry(page_id, session_id)?;
        let result = entry.handle.cookies(op);
        self.finish(&entry, page_id, &result);
        result
    }

    pub fn pdf(&self, page_id: &str, session_id: &str, options: PdfOptions) -> Result<Vec<u8>> {
        let entry = self.entry(page_id, session_id)?;
        let result = entry.handle.pdf(&options);
        self.finish(&entry, page_id, &result);
        result
    }

    /// Opaque driver metrics; the mock driver reports page count
    /// and error count since those are all it can meaningfully track.
    pub fn metrics(&self, page_id: &str, session_id: &str) -> Result<serde_json::Value> {
        let entry = self.entry(page_id, session_id)?;
        self.touch(&entry);
        Ok(serde_json::json!({
            "errorCount": entry.error_count.load(Ordering::SeqCst),
            "navigationCount": entry.navigation_history.lock().expect("page history lock poisoned").len(),
        }))
    }

    fn finish<T>(&self, entry: &PageEntry, page_id: &str, result: &Result<T>) {
        match result {
            Ok(_) => self.touch(entry),
            Err(_) => {
                entry.error_count.fetch_add(1, Ordering::SeqCst);
                log::warn!("driver operation failed on page {page_id}");
            }
        }
    }

    /// Idempotent: a second close returns `NotFound` and leaves pool state
    /// unchanged.
    pub fn close(&self, page_id: &str, session_id: &str) -> Result<()> {
        let (_, entry) = self
            .pages
            .remove_if(page_id, |_, e| e.session_id == session_id)
            .ok_or_else(|| CoreError::NotFound(format!("page {page_id} not found")))?;
        *entry.state.lock().expect("page state lock poisoned") = PageState::Closed;
        let _ = entry.handle.close();
        self.pool.close_page(&entry.browser_id);
        self.events.publish(CoreEvent::PageClosed { page_id: page_id.to_string() });
        Ok(())
    }

    /// Best-effort batch close; individual failures are logged, not fatal.
    pub fn close_pages_for_context(&self, context_id: &str) {
        let ids: Vec<String> = self
            .pages
            .iter()
            .filter(|e| e.context_id == context_id)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            if let Some(session_id) = self.pages.get(&id).map(|e| e.session_id.clone()) {
                if let Err(e) = self.close(&id, &session_id) {
                    log::warn!("failed to close page {id} while closing context {context_id}: {e}");
                }
            }
        }
    }

    pub fn close_pages_for_session(&self, session_id: &str) {
        let ids: Vec<String> = self
            .pages
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            if let Err(e) = self.close(&id, session_id) {
                log::warn!("failed to close page {id} while closing session {session_id}: {e}");
            }
        }
    }

    pub fn list_for_session(&self, session_id: &str) -> Vec<PageInfo> {
        self.pages
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| self.to_info(e.key(), e.value()))
            .collect()
    }

    pub fn list_for_context(&self, context_id: &str) -> Vec<PageInfo> {
        self.pages
            .iter()
            .filter(|e| e.context_id == context_id)
            .map(|e| self.to_info(e.key(), e.value()))
            .collect()
    }

    /// One idle-sweep pass: close any page idle past `idle_threshold`.
    pub fn sweep_idle(&self, idle_threshold: Duration) -> usize {
        let now = self.clock.now_utc();
        let candidates: Vec<(String, String)> = self
            .pages
            .iter()
            .filter(|e| {
                let state = *e.state.lock().expect("page state lock poisoned");
                let last = *e.last_activity_at.lock().expect("page activity lock poisoned");
                state == PageState::Idle
                    && now.signed_duration_since(last).to_std().unwrap_or_default() > idle_threshold
            })
            .map(|e| (e.key().clone(), e.session_id.clone()))
            .collect();
        let closed = candidates.len();
        for (page_id, session_id) in candidates {
            if let Err(e) = self.close(&page_id, &session_id) {
                log::warn!("idle sweep failed to close page {page_id}: {e}");
            }
        }
        closed
    }
}

/// Options a client may ask for `clip` on `screenshot` actions.
pub fn clip_rect(x: f64, y: f64, width: f64, height: f64) -> ClipRect {
    ClipRect { x, y, width, height }
}

pub fn image_format_from_str(s: &str) -> Result<ImageFormat> {
    match s {
        "png" => Ok(ImageFormat::Png),
        "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
        "webp" => Ok(ImageFormat::Webp),
        other => Err(CoreError::InvalidArgument(format!("unknown screenshot type '{other}'"))),
    }
}

pub fn wait_until_from_str(s: &str) -> Result<WaitUntil> {
    match s {
        "load" => Ok(WaitUntil::Load),
        "domcontentloaded" => Ok(WaitUntil::DomContentLoaded),
        "networkidle0" => Ok(WaitUntil::NetworkIdle0),
        "networkidle2" => Ok(WaitUntil::NetworkIdle2),
        other => Err(CoreError::InvalidArgument(format!("unknown waitUntil '{other}'"))),
    }
}

pub fn spawn_idle_sweep_loop(
    manager: Arc<PageManager>,
    interval: Duration,
    idle_threshold: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let closed = manager.sweep_idle(idle_threshold);
                    if closed > 0 {
                        log::debug!("idle sweep closed {closed} page(s)");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::pool::BrowserPoolConfig;
    use crate::circuit::CircuitBreaker;
    use crate::clock::test_support::FixedClock;
    use crate::clock::UuidGenerator;
    use crate::driver::mock::MockDriver;

    async fn manager() -> (Arc<PageManager>, Arc<BrowserPool>, String) {
        let pool = Arc::new(BrowserPool::new(
            BrowserPoolConfig { max_browsers: 2, ..Default::default() },
            Arc::new(MockDriver::new()),
            Arc::new(UuidGenerator),
            Arc::new(CircuitBreaker::new(EventBus::default())),
            EventBus::default(),
        ));
        let browser = pool.acquire("s1").await.unwrap();
        let manager = Arc::new(PageManager::new(
            pool.clone(),
            Arc::new(FixedClock { fixed_utc: Utc::now() }),
            Arc::new(UuidGenerator),
            EventBus::default(),
        ));
        (manager, pool, browser.id().to_string())
    }

    #[tokio::test]
    async fn create_then_navigate_then_get_content_shows_title() {
        let (manager, _pool, browser_id) = manager().await;
        let page = manager
            .create("c1", "s1", &browser_id, PageManager::default_options())
            .await
            .unwrap();
        let outcome = manager
            .navigate(&page.page_id, "s1", "https://example.com", NavigateOptions::default())
            .unwrap();
        assert_eq!(outcome.title, "Example Domain");
        let content = manager.get_content(&page.page_id, "s1", None).unwrap();
        assert!(content.contains("Example Domain"));
    }

    #[tokio::test]
    async fn screenshot_bytes_start_with_png_magic() {
        let (manager, _pool, browser_id) = manager().await;
        let page = manager
            .create("c1", "s1", &browser_id, PageManager::default_options())
            .await
            .unwrap();
        let bytes = manager
            .screenshot(&page.page_id, "s1", ScreenshotOptions { full_page: true, ..Default::default() })
            .unwrap();
        assert!(bytes.len() >= 1024);
        assert_eq!(&bytes[..4], &[0x89, 0x50, 0x4E, 0x47]);
    }

    #[tokio::test]
    async fn ownership_mismatch_is_forbidden_and_leaves_state_untouched() {
        let (manager, _pool, browser_id) = manager().await;
        let page = manager
            .create("c1", "s1", &browser_id, PageManager::default_options())
            .await
            .unwrap();
        let err = manager.evaluate(&page.page_id, "s2", "1+1").unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
        let info = manager.info(&page.page_id, "s1").unwrap();
        assert_eq!(info.error_count, 0);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (manager, _pool, browser_id) = manager().await;
        let page = manager
            .create("c1", "s1", &browser_id, PageManager::default_options())
            .await
            .unwrap();
        manager.close(&page.page_id, "s1").unwrap();
        let err = manager.close(&page.page_id, "s1").unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    /// A clock a test can move forward, for idle-sweep assertions that
    /// need "later" without a real sleep.
    struct AdvancingClock(Mutex<DateTime<Utc>>);

    impl Clock for AdvancingClock {
        fn now_instant(&self) -> std::time::Instant {
            std::time::Instant::now()
        }

        fn now_utc(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    impl AdvancingClock {
        fn advance(&self, by: Duration) {
            let mut guard = self.0.lock().unwrap();
            *guard += chrono::Duration::from_std(by).unwrap();
        }
    }

    #[tokio::test]
    async fn idle_sweep_closes_pages_past_the_threshold() {
        let pool = Arc::new(BrowserPool::new(
            BrowserPoolConfig { max_browsers: 2, ..Default::default() },
            Arc::new(MockDriver::new()),
            Arc::new(UuidGenerator),
            Arc::new(CircuitBreaker::new(EventBus::default())),
            EventBus::default(),
        ));
        let browser = pool.acquire("s1").await.unwrap();
        let clock = Arc::new(AdvancingClock(Mutex::new(Utc::now())));
        let manager = Arc::new(PageManager::new(pool.clone(), clock.clone(), Arc::new(UuidGenerator), EventBus::default()));

        for _ in 0..3 {
            manager.create("c1", "s1", browser.id(), PageManager::default_options()).await.unwrap();
        }
        assert_eq!(manager.list_for_session("s1").len(), 3);

        // Fresh pages start idle and are untouched before the threshold.
        assert_eq!(manager.sweep_idle(Duration::from_secs(1800)), 0);

        clock.advance(Duration::from_secs(1800) + Duration::from_secs(1));
        assert_eq!(manager.sweep_idle(Duration::from_secs(1800)), 3);
        assert!(manager.list_for_session("s1").is_empty());
    }

    #[tokio::test]
    async fn evaluate_exception_bumps_error_count() {
        let (manager, _pool, browser_id) = manager().await;
        let page = manager
            .create("c1", "s1", &browser_id, PageManager::default_options())
            .await
            .unwrap();
        let err = manager.evaluate(&page.page_id, "s1", "throw new Error()").unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));
        let info = manager.info(&page.page_id, "s1").unwrap();
        assert_eq!(info.error_count, 1);
    }
}
