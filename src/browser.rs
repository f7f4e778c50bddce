//! Browser session capability over the Chrome DevTools Protocol.
//!
//! Wraps one launched browser and one page. Element work goes through
//! pierced DOM queries so the same selector-based operations reach both the
//! main document and the CAPTCHA iframe's document (which is cross-origin
//! and unreachable from page script). Pointer actions are dispatched at
//! absolute viewport coordinates.

use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::dom::{
    FocusParams, GetAttributesParams, GetDocumentParams, Node, NodeId, QuerySelectorParams,
    ResolveNodeParams,
};
use chromiumoxide::cdp::browser_protocol::input::InsertTextParams;
use chromiumoxide::cdp::browser_protocol::network::{
    Cookie, CookieParam, GetCookiesParams, SetCookiesParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
};
use chromiumoxide::cdp::js_protocol::runtime::CallFunctionOnParams;
use chromiumoxide::layout::Point;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::error::CheckinError;

/// How often element polls re-query the DOM.
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Graceful shutdown budget before the process gets killed.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

const RECT_FN: &str =
    "function() { const r = this.getBoundingClientRect(); return [r.x, r.y, r.width, r.height]; }";
const TEXT_FN: &str = "function() { return this.textContent; }";

/// Typed wait outcome. Expected absence is a value, not an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Found,
    TimedOut,
}

pub struct LaunchOptions {
    pub headless: bool,
    pub user_agent: String,
    pub proxy: Option<String>,
    /// Script injected into every new document before page scripts run.
    pub stealth_script: Option<String>,
}

pub struct Session {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    /// Element id of the iframe whose document scopes selector lookups,
    /// or `None` for the main document.
    frame: Mutex<Option<String>>,
}

impl Session {
    pub async fn launch(opts: LaunchOptions) -> Result<Self, CheckinError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1280, 800)
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-plugins")
            .arg(format!("--user-agent={}", opts.user_agent));
        if opts.headless {
            builder = builder.arg("--disable-gpu");
        } else {
            builder = builder.with_head();
        }
        if let Some(proxy) = &opts.proxy {
            builder = builder.arg(format!("--proxy-server=http://{}", proxy));
        }
        let config = builder
            .build()
            .map_err(|e| CheckinError::Infrastructure(format!("browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CheckinError::Infrastructure(format!("browser launch: {}", e)))?;
        let handler_task = tokio::task::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(CheckinError::unexpected)?;

        if let Some(script) = &opts.stealth_script {
            page.execute(AddScriptToEvaluateOnNewDocumentParams::new(script.clone()))
                .await
                .map_err(CheckinError::unexpected)?;
            debug!("stealth script installed");
        }

        Ok(Self {
            browser,
            page,
            handler_task,
            frame: Mutex::new(None),
        })
    }

    pub async fn navigate(&self, url: &str) -> Result<(), CheckinError> {
        self.exit_frame();
        self.page.goto(url).await.map_err(CheckinError::unexpected)?;
        // Best effort; some navigations commit without a load event.
        let _ = self.page.wait_for_navigation().await;
        Ok(())
    }

    pub async fn current_url(&self) -> Result<String, CheckinError> {
        Ok(self
            .page
            .url()
            .await
            .map_err(CheckinError::unexpected)?
            .unwrap_or_default())
    }

    /// Scope subsequent selector lookups to the document inside the iframe
    /// with the given element id.
    pub fn enter_frame(&self, iframe_id: &str) {
        *self.frame.lock().unwrap() = Some(iframe_id.to_owned());
    }

    pub fn exit_frame(&self) {
        *self.frame.lock().unwrap() = None;
    }

    /// Poll for a selector until it has a non-empty box or the timeout
    /// expires. Absence is an expected outcome here, not an error.
    pub async fn wait_visible(&self, selector: &str, timeout: Duration) -> Result<Wait, CheckinError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(node) = self.locate(selector).await? {
                if let Some((_, _, w, h)) = self.try_rect(node).await {
                    if w > 0.0 && h > 0.0 {
                        return Ok(Wait::Found);
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Wait::TimedOut);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Read an attribute off the first match. `Ok(None)` when the element
    /// lacks the attribute.
    pub async fn attr(&self, selector: &str, name: &str) -> Result<Option<String>, CheckinError> {
        let node = self.resolve(selector).await?;
        let resp = self
            .page
            .execute(GetAttributesParams::new(node))
            .await
            .map_err(CheckinError::unexpected)?;
        let attrs = &resp.result.attributes;
        Ok(attrs
            .chunks(2)
            .find(|pair| pair.len() == 2 && pair[0] == name)
            .map(|pair| pair[1].clone()))
    }

    pub async fn text(&self, selector: &str) -> Result<String, CheckinError> {
        let node = self.resolve(selector).await?;
        match self.call_on_node(node, TEXT_FN).await? {
            Some(serde_json::Value::String(s)) => Ok(s),
            _ => Ok(String::new()),
        }
    }

    /// Click the center of the first match.
    pub async fn click(&self, selector: &str) -> Result<(), CheckinError> {
        self.click_offset(selector, 0.0, 0.0).await
    }

    /// Move to and click a point offset from the element's center.
    pub async fn click_offset(&self, selector: &str, dx: f64, dy: f64) -> Result<(), CheckinError> {
        let node = self.resolve(selector).await?;
        let (x, y, w, h) = self.rect(node, selector).await?;
        let point = Point::new(x + w / 2.0 + dx, y + h / 2.0 + dy);
        self.page
            .move_mouse(point)
            .await
            .map_err(CheckinError::unexpected)?;
        self.page
            .click(point)
            .await
            .map_err(CheckinError::unexpected)?;
        Ok(())
    }

    /// Focus the element and type text into it through the input pipeline.
    pub async fn type_text(&self, selector: &str, text: &str) -> Result<(), CheckinError> {
        let node = self.resolve(selector).await?;
        let mut focus = FocusParams::default();
        focus.node_id = Some(node);
        self.page
            .execute(focus)
            .await
            .map_err(CheckinError::unexpected)?;
        self.page
            .execute(InsertTextParams::new(text))
            .await
            .map_err(CheckinError::unexpected)?;
        Ok(())
    }

    pub async fn screenshot(&self, path: &std::path::Path) -> Result<(), CheckinError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.page
            .save_screenshot(params, path)
            .await
            .map_err(CheckinError::unexpected)?;
        Ok(())
    }

    pub async fn cookies(&self) -> Result<Vec<Cookie>, CheckinError> {
        let resp = self
            .page
            .execute(GetCookiesParams::default())
            .await
            .map_err(CheckinError::unexpected)?;
        Ok(resp.result.cookies.clone())
    }

    pub async fn set_cookies(&self, cookies: Vec<CookieParam>) -> Result<(), CheckinError> {
        if cookies.is_empty() {
            return Ok(());
        }
        self.page
            .execute(SetCookiesParams::new(cookies))
            .await
            .map_err(CheckinError::unexpected)?;
        Ok(())
    }

    /// Close the session. Graceful close first, then a hard kill if the
    /// process does not exit within the grace period.
    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("browser close failed: {}", e);
        }
        match tokio::time::timeout(CLOSE_GRACE, self.browser.wait()).await {
            Ok(_) => info!("browser closed"),
            Err(_) => {
                warn!("browser unresponsive, killing process");
                let _ = self.browser.kill().await;
            }
        }
        self.handler_task.abort();
    }

    /// Find the first match for `selector` in the active scope. `Ok(None)`
    /// covers both "no such element" and "frame not attached yet" so wait
    /// loops can keep polling.
    async fn locate(&self, selector: &str) -> Result<Option<NodeId>, CheckinError> {
        let frame = self.frame.lock().unwrap().clone();
        let doc = self.document().await?;
        let root = match &frame {
            None => doc.node_id,
            Some(id) => match find_frame_document(&doc, id) {
                Some(node) => node,
                None => return Ok(None),
            },
        };
        let resp = self
            .page
            .execute(QuerySelectorParams::new(root, selector))
            .await
            .map_err(CheckinError::unexpected)?;
        let node = resp.result.node_id;
        if *node.inner() == 0 {
            Ok(None)
        } else {
            Ok(Some(node))
        }
    }

    async fn resolve(&self, selector: &str) -> Result<NodeId, CheckinError> {
        self.locate(selector)
            .await?
            .ok_or_else(|| CheckinError::PageTimeout(selector.to_owned()))
    }

    /// Full pierced document tree. Fetched fresh per lookup; node ids go
    /// stale whenever the widget redraws.
    async fn document(&self) -> Result<Node, CheckinError> {
        let mut params = GetDocumentParams::default();
        params.depth = Some(-1);
        params.pierce = Some(true);
        let resp = self
            .page
            .execute(params)
            .await
            .map_err(CheckinError::unexpected)?;
        Ok(resp.result.root.clone())
    }

    /// Bounding rect in main-viewport coordinates. Rects read inside an
    /// iframe document are frame-relative and get shifted by the iframe
    /// element's own origin.
    async fn rect(&self, node: NodeId, selector: &str) -> Result<(f64, f64, f64, f64), CheckinError> {
        let (mut x, mut y, w, h) = self
            .try_rect(node)
            .await
            .ok_or_else(|| CheckinError::PageTimeout(selector.to_owned()))?;
        let frame = self.frame.lock().unwrap().clone();
        if let Some(id) = frame {
            let (fx, fy) = self.frame_origin(&id).await?;
            x += fx;
            y += fy;
        }
        Ok((x, y, w, h))
    }

    async fn try_rect(&self, node: NodeId) -> Option<(f64, f64, f64, f64)> {
        let value = self.call_on_node(node, RECT_FN).await.ok()??;
        let nums: Vec<f64> = value
            .as_array()?
            .iter()
            .filter_map(|v| v.as_f64())
            .collect();
        if nums.len() != 4 {
            return None;
        }
        Some((nums[0], nums[1], nums[2], nums[3]))
    }

    async fn frame_origin(&self, iframe_id: &str) -> Result<(f64, f64), CheckinError> {
        let doc = self.document().await?;
        let resp = self
            .page
            .execute(QuerySelectorParams::new(
                doc.node_id,
                format!("#{}", iframe_id),
            ))
            .await
            .map_err(CheckinError::unexpected)?;
        let node = resp.result.node_id;
        if *node.inner() == 0 {
            return Err(CheckinError::PageTimeout(format!("#{}", iframe_id)));
        }
        let (x, y, _, _) = self
            .try_rect(node)
            .await
            .ok_or_else(|| CheckinError::PageTimeout(format!("#{}", iframe_id)))?;
        Ok((x, y))
    }

    async fn call_on_node(
        &self,
        node: NodeId,
        declaration: &str,
    ) -> Result<Option<serde_json::Value>, CheckinError> {
        let mut resolve = ResolveNodeParams::default();
        resolve.node_id = Some(node);
        let resp = self
            .page
            .execute(resolve)
            .await
            .map_err(CheckinError::unexpected)?;
        let object_id = resp
            .result
            .object
            .object_id
            .clone()
            .ok_or_else(|| CheckinError::Unexpected(anyhow!("node did not resolve to an object")))?;
        let mut call = CallFunctionOnParams::new(declaration);
        call.object_id = Some(object_id);
        call.return_by_value = Some(true);
        let resp = self
            .page
            .execute(call)
            .await
            .map_err(CheckinError::unexpected)?;
        Ok(resp.result.result.value.clone())
    }
}

/// Walk a pierced DOM tree for the content document of the iframe with the
/// given element id.
fn find_frame_document(node: &Node, iframe_id: &str) -> Option<NodeId> {
    if node.node_name.eq_ignore_ascii_case("iframe") {
        let is_target = node
            .attributes
            .as_ref()
            .map(|attrs| {
                attrs
                    .chunks(2)
                    .any(|pair| pair.len() == 2 && pair[0] == "id" && pair[1] == iframe_id)
            })
            .unwrap_or(false);
        if is_target {
            if let Some(doc) = &node.content_document {
                return Some(doc.node_id.clone());
            }
        }
    }
    if let Some(doc) = &node.content_document {
        if let Some(found) = find_frame_document(doc, iframe_id) {
            return Some(found);
        }
    }
    for child in node.children.iter().flatten() {
        if let Some(found) = find_frame_document(child, iframe_id) {
            return Some(found);
        }
    }
    None
}

/// Best-effort cleanup of leftover automation browser processes. Run at
/// startup and after each account so a crashed attempt cannot pile up
/// headless processes.
pub fn cleanup_stray_browsers() {
    if !cfg!(unix) {
        return;
    }
    for pattern in ["chrome.*--headless", "chrome.*--test-type"] {
        let _ = Command::new("pkill")
            .args(["-9", "-f", pattern])
            .status();
    }
}
