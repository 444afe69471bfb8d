//! C10: action executor.
//!
//! A fixed dispatch table from action name to {required/optional schema,
//! resolver, handler}. Every request is validated before any
//! driver call is made: an unknown action, a missing required field, or an
//! unrecognized extra field is rejected with `InvalidArgument` and never
//! reaches the page manager. Ownership failures surface verbatim from the
//! page manager as `Forbidden`; driver failures surface as `Internal`
//! (the page manager has already bumped the page's error count by then).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::Value;

use crate::driver::{ClipRect, CookieOp, CookieResult, DriverCookie, NavigateOptions, PdfMargin, PdfOptions, ScreenshotOptions};
use crate::error::{CoreError, Result};
use crate::page::{image_format_from_str, wait_until_from_str, PageManager};

/// One action invocation: which page, which action, and its JSON args.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub page_id: String,
    pub action: String,
    pub args: Value,
}

/// Opaque JSON result of one action invocation.
#[derive(Debug, Clone)]
pub struct ActionResponse {
    pub result: Value,
}

struct Schema {
    required: &'static [&'static str],
    optional: &'static [&'static str],
}

impl Schema {
    fn validate(&self, args: &Value) -> Result<()> {
        let obj = match args {
            Value::Object(map) => map,
            Value::Null => {
                if self.required.is_empty() {
                    return Ok(());
                }
                return Err(CoreError::InvalidArgument("missing required arguments".into()));
            }
            _ => return Err(CoreError::InvalidArgument("action arguments must be a JSON object".into())),
        };
        for field in self.required {
            if !obj.contains_key(*field) {
                return Err(CoreError::InvalidArgument(format!("missing required field '{field}'")));
            }
        }
        let known: HashSet<&str> = self.required.iter().chain(self.optional.iter()).copied().collect();
        for key in obj.keys() {
            if !known.contains(key.as_str()) {
                return Err(CoreError::InvalidArgument(format!("unknown field '{key}'")));
            }
        }
        Ok(())
    }
}

const NAVIGATE: Schema = Schema { required: &["url"], optional: &["waitUntil", "timeout", "referer"] };
const EVALUATE: Schema = Schema { required: &[], optional: &["expression", "code"] };
const CLICK: Schema = Schema { required: &["selector"], optional: &["clickCount"] };
const TYPE: Schema = Schema { required: &["selector", "text"], optional: &["delay"] };
const GET_CONTENT: Schema = Schema { required: &[], optional: &["selector"] };
const WAIT_FOR_SELECTOR: Schema = Schema { required: &["selector"], optional: &["timeout", "visible"] };
const SCREENSHOT: Schema = Schema {
    required: &[],
    optional: &["fullPage", "format", "quality", "selector", "clip", "omitBackground"],
};
const PDF: Schema = Schema {
    required: &[],
    optional: &["format", "landscape", "scale", "margin", "displayHeaderFooter", "printBackground", "pageRanges"],
};
const COOKIE: Schema = Schema { required: &["op"], optional: &["cookies", "names"] };
const CLOSE: Schema = Schema { required: &[], optional: &[] };
const METRICS: Schema = Schema { required: &[], optional: &[] };

/// Every action name the dispatch table recognizes, for `Catalog()`.
pub const ACTION_NAMES: &[&str] = &[
    "navigate", "evaluate", "click", "type", "getContent", "waitForSelector", "screenshot", "pdf", "cookie", "close", "metrics",
];

fn schema_for(action: &str) -> Result<&'static Schema> {
    match action {
        "navigate" => Ok(&NAVIGATE),
        "evaluate" => Ok(&EVALUATE),
        "click" => Ok(&CLICK),
        "type" => Ok(&TYPE),
        "getContent" => Ok(&GET_CONTENT),
        "waitForSelector" => Ok(&WAIT_FOR_SELECTOR),
        "screenshot" => Ok(&SCREENSHOT),
        "pdf" => Ok(&PDF),
        "cookie" => Ok(&COOKIE),
        "close" => Ok(&CLOSE),
        "metrics" => Ok(&METRICS),
        other => Err(CoreError::InvalidArgument(format!("unknown action '{other}'"))),
    }
}

fn str_field(args: &Value, field: &str) -> Result<String> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CoreError::InvalidArgument(format!("field '{field}' must be a string")))
}

fn u32_field(args: &Value, field: &str, default: u32) -> Result<u32> {
    match args.get(field) {
        None => Ok(default),
        Some(v) => v.as_u64().map(|n| n as u32).ok_or_else(|| CoreError::InvalidArgument(format!("field '{field}' must be a non-negative integer"))),
    }
}

fn bool_field(args: &Value, field: &str, default: bool) -> bool {
    args.get(field).and_then(Value::as_bool).unwrap_or(default)
}

/// Dispatches one [`ActionRequest`] against the page manager.
pub struct ActionExecutor {
    pages: Arc<PageManager>,
}

impl ActionExecutor {
    pub fn new(pages: Arc<PageManager>) -> Self {
        Self { pages }
    }

    pub fn execute(&self, session_id: &str, request: ActionRequest) -> Result<ActionResponse> {
        log::debug!("dispatching action '{}' for page {}", request.action, request.page_id);
        let schema = schema_for(&request.action)?;
        schema.validate(&request.args)?;
        let result = match request.action.as_str() {
            "navigate" => self.navigate(session_id, &request)?,
            "evaluate" => self.evaluate(session_id, &request)?,
            "click" => self.click(session_id, &request)?,
            "type" => self.type_text(session_id, &request)?,
            "getContent" => self.get_content(session_id, &request)?,
            "waitForSelector" => self.wait_for_selector(session_id, &request)?,
            "screenshot" => self.screenshot(session_id, &request)?,
            "pdf" => self.pdf(session_id, &request)?,
            "cookie" => self.cookie(session_id, &request)?,
            "close" => {
                self.pages.close(&request.page_id, session_id)?;
                serde_json::json!({ "ok": true })
            }
            "metrics" => self.pages.metrics(&request.page_id, session_id)?,
            other => return Err(CoreError::InvalidArgument(format!("unknown action '{other}'"))),
        };
        Ok(ActionResponse { result })
    }

    fn navigate(&self, session_id: &str, request: &ActionRequest) -> Result<Value> {
        let url = str_field(&request.args, "url")?;
        url::Url::parse(&url).map_err(|e| CoreError::InvalidArgument(format!("invalid url '{url}': {e}")))?;
        let wait_until = match request.args.get("waitUntil").and_then(Value::as_str) {
            Some(s) => wait_until_from_str(s)?,
            None => Default::default(),
        };
        let timeout = Duration::from_millis(u32_field(&request.args, "timeout", 30_000)? as u64);
        let referer = request.args.get("referer").and_then(Value::as_str).map(str::to_string);
        let outcome = self.pages.navigate(
            &request.page_id,
            session_id,
            &url,
            NavigateOptions { wait_until, timeout, referer },
        )?;
        Ok(serde_json::json!({ "ok": true, "finalUrl": outcome.final_url, "title": outcome.title }))
    }

    fn evaluate(&self, session_id: &str, request: &ActionRequest) -> Result<Value> {
        let expression = request
            .args
            .get("expression")
            .or_else(|| request.args.get("code"))
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::InvalidArgument("missing required field 'expression'".into()))?;
        let result = self.pages.evaluate(&request.page_id, session_id, expression)?;
        Ok(serde_json::json!({ "result": result }))
    }

    fn click(&self, session_id: &str, request: &ActionRequest) -> Result<Value> {
        let selector = str_field(&request.args, "selector")?;
        let click_count = u32_field(&request.args, "clickCount", 1)?;
        self.pages.click(&request.page_id, session_id, &selector, click_count)?;
        Ok(serde_json::json!({ "ok": true }))
    }

    fn type_text(&self, session_id: &str, request: &ActionRequest) -> Result<Value> {
        let selector = str_field(&request.args, "selector")?;
        let text = str_field(&request.args, "text")?;
        let delay_ms = u32_field(&request.args, "delay", 0)?;
        let delay = if delay_ms > 0 { Some(Duration::from_millis(delay_ms as u64)) } else { None };
        self.pages.type_text(&request.page_id, session_id, &selector, &text, delay)?;
        Ok(serde_json::json!({ "ok": true }))
    }

    fn get_content(&self, session_id: &str, request: &ActionRequest) -> Result<Value> {
        let selector = request.args.get("selector").and_then(Value::as_str);
        let content = self.pages.get_content(&request.page_id, session_id, selector)?;
        Ok(serde_json::json!({ "content": content }))
    }

    fn wait_for_selector(&self, session_id: &str, request: &ActionRequest) -> Result<Value> {
        let selector = str_field(&request.args, "selector")?;
        let timeout = Duration::from_millis(u32_field(&request.args, "timeout", 30_000)? as u64);
        let visible = bool_field(&request.args, "visible", false);
        self.pages.wait_for_selector(&request.page_id, session_id, &selector, timeout, visible)?;
        Ok(serde_json::json!({ "ok": true }))
    }

    fn screenshot(&self, session_id: &str, request: &ActionRequest) -> Result<Value> {
        let format = match request.args.get("format").and_then(Value::as_str) {
            Some(s) => Some(image_format_from_str(s)?),
            None => None,
        };
        let clip = match request.args.get("clip") {
            Some(Value::Object(map)) => Some(ClipRect {
                x: map.get("x").and_then(Value::as_f64).unwrap_or(0.0),
                y: map.get("y").and_then(Value::as_f64).unwrap_or(0.0),
                width: map.get("width").and_then(Value::as_f64).unwrap_or(0.0),
                height: map.get("height").and_then(Value::as_f64).unwrap_or(0.0),
            }),
            _ => None,
        };
        let options = ScreenshotOptions {
            full_page: bool_field(&request.args, "fullPage", false),
            format,
            quality: request.args.get("quality").and_then(Value::as_u64).map(|q| q as u8),
            selector: request.args.get("selector").and_then(Value::as_str).map(str::to_string),
            clip,
            omit_background: bool_field(&request.args, "omitBackground", false),
        };
        let bytes = self.pages.screenshot(&request.page_id, session_id, options)?;
        let size = bytes.len();
        Ok(serde_json::json!({ "image_base64": base64::engine::general_purpose::STANDARD.encode(&bytes), "size": size }))
    }

    fn pdf(&self, session_id: &str, request: &ActionRequest) -> Result<Value> {
        let margin = request.args.get("margin").and_then(Value::as_object).map(|map| PdfMargin {
            top: map.get("top").and_then(Value::as_f64).unwrap_or(0.0),
            bottom: map.get("bottom").and_then(Value::as_f64).unwrap_or(0.0),
            left: map.get("left").and_then(Value::as_f64).unwrap_or(0.0),
            right: map.get("right").and_then(Value::as_f64).unwrap_or(0.0),
        });
        let options = PdfOptions {
            format: request.args.get("format").and_then(Value::as_str).map(str::to_string),
            landscape: bool_field(&request.args, "landscape", false),
            scale: request.args.get("scale").and_then(Value::as_f64),
            margin,
            display_header_footer: bool_field(&request.args, "displayHeaderFooter", false),
            print_background: bool_field(&request.args, "printBackground", false),
            page_ranges: request.args.get("pageRanges").and_then(Value::as_str).map(str::to_string),
        };
        let bytes = self.pages.pdf(&request.page_id, session_id, options)?;
        let size = bytes.len();
        Ok(serde_json::json!({ "pdf_base64": base64::engine::general_purpose::STANDARD.encode(&bytes), "size": size }))
    }

    fn cookie(&self, session_id: &str, request: &ActionRequest) -> Result<Value> {
        let op_name = str_field(&request.args, "op")?;
        let op = match op_name.as_str() {
            "get" => CookieOp::Get,
            "set" => {
                let cookies = request
                    .args
                    .get("cookies")
                    .and_then(Value::as_array)
                    .ok_or_else(|| CoreError::InvalidArgument("'set' requires a 'cookies' array".into()))?;
                let mut parsed = Vec::with_capacity(cookies.len());
                for c in cookies {
                    parsed.push(DriverCookie {
                        name: str_field(c, "name")?,
                        value: str_field(c, "value")?,
                        domain: c.get("domain").and_then(Value::as_str).map(str::to_string),
                        path: c.get("path").and_then(Value::as_str).map(str::to_string),
                        secure: bool_field(c, "secure", false),
                        http_only: bool_field(c, "httpOnly", false),
                    });
                }
                CookieOp::Set(parsed)
            }
            "delete" => {
                let names = request
                    .args
                    .get("names")
                    .and_then(Value::as_array)
                    .ok_or_else(|| CoreError::InvalidArgument("'delete' requires a 'names' array".into()))?
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                CookieOp::Delete(names)
            }
            "clear" => CookieOp::Clear,
            other => return Err(CoreError::InvalidArgument(format!("unknown cookie op '{other}'"))),
        };
        match self.pages.cookies(&request.page_id, session_id, op)? {
            CookieResult::Cookies(cookies) => Ok(serde_json::to_value(cookies).expect("cookies always serialize")),
            CookieResult::Ok => Ok(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::pool::{BrowserPool, BrowserPoolConfig};
    use crate::circuit::CircuitBreaker;
    use crate::clock::{SystemClock, UuidGenerator};
    use crate::driver::mock::MockDriver;
    use crate::events::EventBus;
    use crate::page::PageManager;

    async fn executor() -> (ActionExecutor, String) {
        let pool = Arc::new(BrowserPool::new(
            BrowserPoolConfig { max_browsers: 1, ..Default::default() },
            Arc::new(MockDriver::new()),
            Arc::new(UuidGenerator),
            Arc::new(CircuitBreaker::new(EventBus::default())),
            EventBus::default(),
        ));
        let browser = pool.acquire("s1").await.unwrap();
        let pages = Arc::new(PageManager::new(pool.clone(), Arc::new(SystemClock), Arc::new(UuidGenerator), EventBus::default()));
        let page = pages.create("c1", "s1", browser.id(), PageManager::default_options()).await.unwrap();
        (ActionExecutor::new(pages), page.page_id)
    }

    #[tokio::test]
    async fn navigate_then_get_content_round_trips() {
        let (executor, page_id) = executor().await;
        let response = executor
            .execute("s1", ActionRequest {
                page_id: page_id.clone(),
                action: "navigate".into(),
                args: serde_json::json!({ "url": "https://example.com" }),
            })
            .unwrap();
        assert_eq!(response.result["ok"], true);
        assert_eq!(response.result["title"], "Example Domain");

        let response = executor
            .execute("s1", ActionRequest { page_id, action: "getContent".into(), args: Value::Null })
            .unwrap();
        assert!(response.result["content"].as_str().unwrap().contains("Example Domain"));
    }

    #[tokio::test]
    async fn unknown_action_is_invalid_argument() {
        let (executor, page_id) = executor().await;
        let err = executor
            .execute("s1", ActionRequest { page_id, action: "teleport".into(), args: Value::Null })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn missing_required_field_is_invalid_argument() {
        let (executor, page_id) = executor().await;
        let err = executor
            .execute("s1", ActionRequest { page_id, action: "navigate".into(), args: serde_json::json!({}) })
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn unknown_field_is_rejected() {
        let (executor, page_id) = executor().await;
        let err = executor
            .execute(
                "s1",
                ActionRequest {
                    page_id,
                    action: "navigate".into(),
                    args: serde_json::json!({ "url": "https://example.com", "bogus": true }),
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn screenshot_action_returns_base64_png() {
        let (executor, page_id) = executor().await;
        let response = executor
            .execute("s1", ActionRequest { page_id, action: "screenshot".into(), args: serde_json::json!({ "fullPage": true }) })
            .unwrap();
        let encoded = response.result["image_base64"].as_str().unwrap();
        assert!(encoded.starts_with("iVBORw0KGgo"));
        assert!(response.result["size"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn wrong_session_is_forbidden_not_invalid_argument() {
        let (executor, page_id) = executor().await;
        let err = executor
            .execute("s2", ActionRequest { page_id, action: "evaluate".into(), args: serde_json::json!({ "expression": "1+1" }) })
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));
    }
}
