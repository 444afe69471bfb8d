//! The browser driver contract.
//!
//! The core treats the actual browser subprocess as a black box reachable
//! only through this contract: launch, liveness probe, page create/close,
//! navigate, evaluate, screenshot, PDF, cookies, and the handful of page
//! setters (viewport, user agent, extra headers, JS enabled, cache
//! enabled, offline). [`driver::chrome`](chrome) implements it against a
//! real headless Chrome/Chromium via `headless_chrome`; [`driver::mock`](mock)
//! implements it deterministically for tests, generalizing "inject a
//! failure into the next Chrome launch" into "inject a failure into any
//! driver operation".
//!
//! All methods here are synchronous, matching `headless_chrome`'s own
//! blocking API; callers above this layer (the pool, the page manager) run
//! driver calls on a blocking thread pool (`tokio::task::spawn_blocking`)
//! so the async runtime is never stalled by driver I/O.

pub mod chrome;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use std::time::Duration;

use crate::error::Result;

/// Options passed to [`Driver::launch`].
#[derive(Debug, Clone, Default)]
pub struct DriverLaunchOptions {
    pub headless: bool,
    pub binary_path: Option<String>,
    pub window_size: Option<(u32, u32)>,
    pub sandbox: bool,
    pub idle_browser_timeout: Option<Duration>,
}

/// Outcome of a liveness probe (health loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Healthy,
    Unresponsive,
    Disconnected,
}

/// `waitUntil` values for [`PageHandle::navigate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitUntil {
    #[default]
    Load,
    DomContentLoaded,
    NetworkIdle0,
    NetworkIdle2,
}

/// Arguments to [`PageHandle::navigate`].
#[derive(Debug, Clone)]
pub struct NavigateOptions {
    pub wait_until: WaitUntil,
    pub timeout: Duration,
    pub referer: Option<String>,
}

impl Default for NavigateOptions {
    fn default() -> Self {
        Self {
            wait_until: WaitUntil::default(),
            timeout: Duration::from_secs(30),
            referer: None,
        }
    }
}

/// Result of a navigation, `navigate` action.
#[derive(Debug, Clone)]
pub struct NavigateOutcome {
    pub final_url: String,
    pub title: String,
}

/// Image format for [`PageHandle::screenshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

/// A pixel rectangle, for clipped screenshots.
#[derive(Debug, Clone, Copy)]
pub struct ClipRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Arguments to [`PageHandle::screenshot`].
#[derive(Debug, Clone, Default)]
pub struct ScreenshotOptions {
    pub full_page: bool,
    pub format: Option<ImageFormat>,
    pub quality: Option<u8>,
    pub selector: Option<String>,
    pub clip: Option<ClipRect>,
    pub omit_background: bool,
}

/// Page margins, in inches, for [`PageHandle::pdf`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfMargin {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
}

/// Arguments to [`PageHandle::pdf`].
#[derive(Debug, Clone, Default)]
pub struct PdfOptions {
    pub format: Option<String>,
    pub landscape: bool,
    pub scale: Option<f64>,
    pub margin: Option<PdfMargin>,
    pub display_header_footer: bool,
    pub print_background: bool,
    pub page_ranges: Option<String>,
}

/// A single browser cookie.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DriverCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
}

/// `cookie` action operations.
#[derive(Debug, Clone)]
pub enum CookieOp {
    Get,
    Set(Vec<DriverCookie>),
    Delete(Vec<String>),
    Clear,
}

/// Result of a [`PageHandle::cookies`] call.
#[derive(Debug, Clone)]
pub enum CookieResult {
    Cookies(Vec<DriverCookie>),
    Ok,
}

/// Driver-level page events the core subscribes to.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    FrameNavigated { url: String },
    PageError { message: String },
    PageScriptError { message: String },
}

/// One live browser subprocess, as the driver sees it.
pub trait BrowserHandle: Send + Sync {
    /// Probe liveness; used by the health loop and C5/C12.
    fn probe(&self) -> Probe;

    /// Open a new page inside this browser.
    fn new_page(&self) -> Result<Box<dyn PageHandle>>;

    /// Terminate the browser subprocess.
    fn close(&self) -> Result<()>;
}

/// One live page inside a driver browser.
pub trait PageHandle: Send + Sync {
    fn navigate(&self, url: &str, options: &NavigateOptions) -> Result<NavigateOutcome>;
    fn evaluate(&self, script: &str) -> Result<serde_json::Value>;
    fn screenshot(&self, options: &ScreenshotOptions) -> Result<Vec<u8>>;
    fn pdf(&self, options: &PdfOptions) -> Result<Vec<u8>>;
    fn content(&self, selector: Option<&str>) -> Result<String>;
    fn click(&self, selector: &str, click_count: u32) -> Result<()>;
    fn type_text(&self, selector: &str, text: &str, delay: Option<Duration>) -> Result<()>;
    fn wait_for_selector(&self, selector: &str, timeout: Duration, visible: bool) -> Result<()>;
    fn cookies(&self, op: CookieOp) -> Result<CookieResult>;
    fn set_viewport(&self, width: u32, height: u32) -> Result<()>;
    fn set_user_agent(&self, user_agent: &str) -> Result<()>;
    fn set_extra_headers(&self, headers: &[(String, String)]) -> Result<()>;
    fn set_js_enabled(&self, enabled: bool) -> Result<()>;
    fn set_cache_enabled(&self, enabled: bool) -> Result<()>;
    fn set_offline(&self, offline: bool) -> Result<()>;
    fn current_url(&self) -> String;
    fn title(&self) -> String;
    fn close(&self) -> Result<()>;
    /// Drain driver events (frame-navigated / page-error / page-script-error)
    /// observed since the last call. Never blocks.
    fn drain_events(&self) -> Vec<DriverEvent>;
}

/// Launches and owns browser subprocesses.
pub trait Driver: Send + Sync {
    fn launch(&self, options: &DriverLaunchOptions) -> Result<Box<dyn BrowserHandle>>;
}
