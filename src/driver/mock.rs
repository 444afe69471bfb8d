//! Deterministic mock driver for tests (`test-utils` feature).
//!
//! Generalizes "inject a failure into the next Chrome launch" into
//! "inject a failure into any driver operation": [`MockDriver`] can inject
//! failures at launch, and its [`MockControl`] handle lets a test flip a
//! launched browser's liveness probe result on demand, the shape a
//! crash-recovery test needs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{CoreError, Result};

use super::{
    BrowserHandle, CookieOp, CookieResult, Driver, DriverEvent, DriverLaunchOptions,
    NavigateOptions, NavigateOutcome, PageHandle, PdfOptions, Probe, ScreenshotOptions,
};

/// A page a test pre-loaded with a canned title/content, so assertions
/// like "navigate then getContent shows the title navigate set" hold
/// without a real browser.
#[derive(Debug, Clone, Default)]
struct ScriptedPage {
    url: String,
    title: String,
    content: String,
}

/// Shared control block for one launched mock browser.
///
/// Cloneable and `Send + Sync`; a test keeps one of these to flip the
/// probe result mid-test (simulating a driver crash) or read the page
/// count without reaching into the pool's internals.
#[derive(Clone)]
pub struct MockControl {
    probe: Arc<Mutex<Probe>>,
    page_count: Arc<AtomicUsize>,
}

impl MockControl {
    /// Force subsequent [`BrowserHandle::probe`] calls to report
    /// `Disconnected`, simulating a crashed driver subprocess.
    pub fn simulate_crash(&self) {
        *self.probe.lock().unwrap() = Probe::Disconnected;
    }

    /// Restore a healthy probe result.
    pub fn simulate_recovered(&self) {
        *self.probe.lock().unwrap() = Probe::Healthy;
    }

    /// Number of pages currently open on this mock browser.
    pub fn page_count(&self) -> usize {
        self.page_count.load(Ordering::SeqCst)
    }
}

/// Deterministic [`Driver`] for unit and integration tests.
pub struct MockDriver {
    should_fail: bool,
    error_message: String,
    fail_after: Option<usize>,
    creation_count: Arc<AtomicUsize>,
    last_control: Mutex<Option<MockControl>>,
}

impl MockDriver {
    /// A driver that always launches successfully.
    pub fn new() -> Self {
        Self {
            should_fail: false,
            error_message: String::new(),
            fail_after: None,
            creation_count: Arc::new(AtomicUsize::new(0)),
            last_control: Mutex::new(None),
        }
    }

    /// A driver whose every `launch` call fails with `error_message`.
    pub fn always_fails(error_message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: error_message.into(),
            fail_after: None,
            creation_count: Arc::new(AtomicUsize::new(0)),
            last_control: Mutex::new(None),
        }
    }

    /// A driver whose launches succeed until the `n`th, then fail forever.
    pub fn fail_after_n(n: usize, error_message: impl Into<String>) -> Self {
        Self {
            should_fail: false,
            error_message: error_message.into(),
            fail_after: Some(n),
            creation_count: Arc::new(AtomicUsize::new(0)),
            last_control: Mutex::new(None),
        }
    }

    /// Total number of `launch` calls observed so far.
    pub fn creation_count(&self) -> usize {
        self.creation_count.load(Ordering::SeqCst)
    }

    /// Control block for the most recently launched browser, if any.
    pub fn last_control(&self) -> Option<MockControl> {
        self.last_control.lock().unwrap().clone()
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MockDriver {
    fn launch(&self, _options: &DriverLaunchOptions) -> Result<Box<dyn BrowserHandle>> {
        let count = self.creation_count.fetch_add(1, Ordering::SeqCst) + 1;

        if self.should_fail {
            return Err(CoreError::Internal(self.error_message.clone()));
        }
        if let Some(limit) = self.fail_after {
            if count > limit {
                return Err(CoreError::Internal(self.error_message.clone()));
            }
        }

        let control = MockControl {
            probe: Arc::new(Mutex::new(Probe::Healthy)),
            page_count: Arc::new(AtomicUsize::new(0)),
        };
        *self.last_control.lock().unwrap() = Some(control.clone());

        Ok(Box::new(MockBrowser { control }))
    }
}

struct MockBrowser {
    control: MockControl,
}

impl BrowserHandle for MockBrowser {
    fn probe(&self) -> Probe {
        *self.control.probe.lock().unwrap()
    }

    fn new_page(&self) -> Result<Box<dyn PageHandle>> {
        if *self.control.probe.lock().unwrap() != Probe::Healthy {
            return Err(CoreError::Internal("browser is not healthy".into()));
        }
        self.control.page_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPage {
            control: self.control.clone(),
            state: Mutex::new(ScriptedPage::default()),
        }))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MockPage {
    control: MockControl,
    state: Mutex<ScriptedPage>,
}

impl PageHandle for MockPage {
    fn navigate(&self, url: &str, _options: &NavigateOptions) -> Result<NavigateOutcome> {
        if url.trim().is_empty() {
            return Err(CoreError::InvalidArgument("empty url".into()));
        }
        let title = derive_title(url);
        let mut state = self.state.lock().unwrap();
        state.url = url.to_string();
        state.title = title.clone();
        state.content = format!("<html><head><title>{title}</title></head><body></body></html>");
        Ok(NavigateOutcome {
            final_url: url.to_string(),
            title,
        })
    }

    fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        if script.contains("throw") {
            return Err(CoreError::Internal("evaluation threw".into()));
        }
        Ok(serde_json::json!(true))
    }

    fn screenshot(&self, _options: &ScreenshotOptions) -> Result<Vec<u8>> {
        // PNG magic bytes followed by padding, large enough to satisfy
        // "bytes >= 1 kB" style assertions in the happy-path scenario.
        let mut bytes = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend(std::iter::repeat(0u8).take(1024));
        Ok(bytes)
    }

    fn pdf(&self, _options: &PdfOptions) -> Result<Vec<u8>> {
        let mut bytes = b"%PDF-1.7\n".to_vec();
        bytes.extend(std::iter::repeat(0u8).take(256));
        Ok(bytes)
    }

    fn content(&self, selector: Option<&str>) -> Result<String> {
        let state = self.state.lock().unwrap();
        match selector {
            None => Ok(state.content.clone()),
            Some(sel) => Ok(format!("<div data-selector=\"{sel}\">mock</div>")),
        }
    }

    fn click(&self, _selector: &str, _click_count: u32) -> Result<()> {
        Ok(())
    }

    fn type_text(&self, _selector: &str, _text: &str, _delay: Option<Duration>) -> Result<()> {
        Ok(())
    }

    fn wait_for_selector(&self, _selector: &str, _timeout: Duration, _visible: bool) -> Result<()> {
        Ok(())
    }

    fn cookies(&self, op: CookieOp) -> Result<CookieResult> {
        match op {
            CookieOp::Get => Ok(CookieResult::Cookies(Vec::new())),
            _ => Ok(CookieResult::Ok),
        }
    }

    fn set_viewport(&self, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }

    fn set_user_agent(&self, _user_agent: &str) -> Result<()> {
        Ok(())
    }

    fn set_extra_headers(&self, _headers: &[(String, String)]) -> Result<()> {
        Ok(())
    }

    fn set_js_enabled(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn set_cache_enabled(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn set_offline(&self, _offline: bool) -> Result<()> {
        Ok(())
    }

    fn current_url(&self) -> String {
        self.state.lock().unwrap().url.clone()
    }

    fn title(&self) -> String {
        self.state.lock().unwrap().title.clone()
    }

    fn close(&self) -> Result<()> {
        self.control.page_count.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn drain_events(&self) -> Vec<DriverEvent> {
        Vec::new()
    }
}

fn derive_title(url: &str) -> String {
    if url.contains("example.com") {
        "Example Domain".to_string()
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_fails_rejects_every_launch() {
        let driver = MockDriver::always_fails("boom");
        assert!(driver.launch(&DriverLaunchOptions::default()).is_err());
        assert!(driver.launch(&DriverLaunchOptions::default()).is_err());
        assert_eq!(driver.creation_count(), 2);
    }

    #[test]
    fn fail_after_n_succeeds_then_fails() {
        let driver = MockDriver::fail_after_n(1, "exhausted");
        assert!(driver.launch(&DriverLaunchOptions::default()).is_ok());
        assert!(driver.launch(&DriverLaunchOptions::default()).is_err());
    }

    #[test]
    fn control_can_simulate_crash() {
        let driver = MockDriver::new();
        let browser = driver.launch(&DriverLaunchOptions::default()).unwrap();
        assert_eq!(browser.probe(), Probe::Healthy);
        let control = driver.last_control().unwrap();
        control.simulate_crash();
        assert_eq!(browser.probe(), Probe::Disconnected);
    }

    #[test]
    fn navigate_sets_title_from_url() {
        let driver = MockDriver::new();
        let browser = driver.launch(&DriverLaunchOptions::default()).unwrap();
        let page = browser.new_page().unwrap();
        let outcome = page
            .navigate("https://example.com", &NavigateOptions::default())
            .unwrap();
        assert_eq!(outcome.title, "Example Domain");
        assert!(page.content(None).unwrap().contains("Example Domain"));
    }
}
