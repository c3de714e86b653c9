use std::{ffi::OsStr, fs, path::Path, thread, time::Duration, time::Instant};

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use headless_chrome::protocol::cdp::Network::CookieParam;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::types::Bounds;
use headless_chrome::{browser::default_executable, Browser, LaunchOptions, Tab};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};

use crate::types::{group_cookies_by_domain, PipelineError, StoredCookie};

const VIEWPORT_PADDING_PX: u32 = 100;
const SCROLL_STEP_PX: u32 = 1000;
const SCROLL_STEP_INTERVAL_MS: u64 = 100;

const SETTLE_AFTER_LOAD: Duration = Duration::from_secs(2);
const SETTLE_AFTER_LAYOUT: Duration = Duration::from_secs(1);
const SETTLE_AFTER_RESIZE: Duration = Duration::from_secs(1);

const READY_STATE_POLL_INTERVAL: Duration = Duration::from_millis(500);

// The tab sees no CDP traffic while a screenshot is being uploaded and
// its row written back; with retries that gap can run into minutes, and
// headless_chrome drops the connection once it exceeds this timeout.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(3600);

// Forces scroll height to reflect true content height, un-defers lazy
// images, reveals collapsed sections, and unpins fixed elements so they
// do not repeat down the page once the viewport grows. The tagged
// navigation bar is left alone.
const LAYOUT_NORMALIZATION_JS: &str = r#"
    document.documentElement.style.display = 'table';
    document.documentElement.style.width = '100%';
    document.body.style.display = 'table-row';

    document.querySelectorAll('img[loading="lazy"]').forEach(img => {
        img.loading = 'eager';
        img.src = img.src;
    });

    document.querySelectorAll('.collapse').forEach(el => el.classList.add('show'));
    document.querySelectorAll('*[style*="position: fixed"]').forEach(el => {
        if (!el.classList.contains('navigation-bar')) {
            el.style.position = 'absolute';
        }
    });
"#;

// Browsers disagree on which of these reflects the real content size
// depending on the page's CSS; the maximum across all six per axis is
// the only heuristic that works cross-site.
const DIMENSION_JS: &str = r#"
    (function() {
        return JSON.stringify({
            docScrollWidth: document.documentElement.scrollWidth,
            docOffsetWidth: document.documentElement.offsetWidth,
            docClientWidth: document.documentElement.clientWidth,
            bodyScrollWidth: document.body.scrollWidth,
            bodyOffsetWidth: document.body.offsetWidth,
            bodyClientWidth: document.body.clientWidth,
            docScrollHeight: document.documentElement.scrollHeight,
            docOffsetHeight: document.documentElement.offsetHeight,
            docClientHeight: document.documentElement.clientHeight,
            bodyScrollHeight: document.body.scrollHeight,
            bodyOffsetHeight: document.body.offsetHeight,
            bodyClientHeight: document.body.clientHeight
        });
    })()
"#;

const CANVAS_CAPTURE_JS: &str = r#"
    (function() {
        const canvas = document.createElement('canvas');
        const context = canvas.getContext('2d');
        canvas.width = document.documentElement.scrollWidth;
        canvas.height = document.documentElement.scrollHeight;
        context.fillStyle = 'rgb(255,255,255)';
        context.fillRect(0, 0, canvas.width, canvas.height);
        if (typeof context.drawWindow === 'function') {
            context.drawWindow(window, 0, 0, canvas.width, canvas.height, 'rgb(255,255,255)');
        }
        return canvas.toDataURL('image/png');
    })()
"#;

fn get_scroll_script(height_px: f64) -> String {
    format!(
        r#" new Promise((resolve) => {{
            const height = {height};
            const step = {step};
            let pos = 0;
            const timer = setInterval(() => {{
                pos += step;
                window.scrollTo(0, pos);
                if (pos >= height) {{
                    clearInterval(timer);
                    window.scrollTo(0, 0);
                    resolve("ok");
                }}
            }}, {interval});
        }});"#,
        height = height_px,
        step = SCROLL_STEP_PX,
        interval = SCROLL_STEP_INTERVAL_MS
    )
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomMetrics {
    pub doc_scroll_width: f64,
    pub doc_offset_width: f64,
    pub doc_client_width: f64,
    pub body_scroll_width: f64,
    pub body_offset_width: f64,
    pub body_client_width: f64,
    pub doc_scroll_height: f64,
    pub doc_offset_height: f64,
    pub doc_client_height: f64,
    pub body_scroll_height: f64,
    pub body_offset_height: f64,
    pub body_client_height: f64,
}

impl DomMetrics {
    pub fn max_height(&self) -> f64 {
        [
            self.doc_scroll_height,
            self.doc_offset_height,
            self.doc_client_height,
            self.body_scroll_height,
            self.body_offset_height,
            self.body_client_height,
        ]
        .into_iter()
        .fold(0.0, f64::max)
    }

    fn max_width(&self) -> f64 {
        [
            self.doc_scroll_width,
            self.doc_offset_width,
            self.doc_client_width,
            self.body_scroll_width,
            self.body_offset_width,
            self.body_client_width,
        ]
        .into_iter()
        .fold(0.0, f64::max)
    }
}

/// Target viewport: the per-axis maximum of all six DOM metrics plus a
/// fixed padding.
pub fn viewport_from_metrics(metrics: &DomMetrics) -> (u32, u32) {
    (
        metrics.max_width() as u32 + VIEWPORT_PADDING_PX,
        metrics.max_height() as u32 + VIEWPORT_PADDING_PX,
    )
}

/// Extra wait after the scroll pass: one step interval per increment
/// plus a fixed base second for stragglers.
pub fn scroll_settle_duration(height_px: f64) -> Duration {
    let steps = (height_px / SCROLL_STEP_PX as f64).ceil() as u64 + 1;
    Duration::from_millis(steps * SCROLL_STEP_INTERVAL_MS + 1000)
}

pub fn cookie_param(cookie: &StoredCookie) -> Result<CookieParam> {
    let mut value = json!({
        "name": cookie.name,
        "value": cookie.value,
        "domain": cookie.domain,
        "path": cookie.path.as_deref().unwrap_or("/"),
        "secure": cookie.secure.unwrap_or(false),
        "httpOnly": cookie.http_only.unwrap_or(false),
    });
    if let Some(expiry) = cookie.expiration_date {
        value["expires"] = json!(expiry);
    }
    serde_json::from_value(value).context("could not build cookie parameter")
}

/// One headless Chrome session, reused for every URL in the run. The
/// single tab plays the role of a persistent driver: cookies injected
/// once stay valid for all subsequent navigations.
pub struct BrowserController {
    browser: Browser,
    tab: Arc<Tab>,
    page_load_timeout: Duration,
}

impl BrowserController {
    pub fn new(page_load_timeout_secs: u64) -> Result<Self> {
        let executable = default_executable().map_err(PipelineError::Environment)?;

        let is_docker = std::env::var("IN_DOCKER").is_ok();
        let options = LaunchOptions::default_builder()
            .path(Some(executable))
            .headless(true)
            .window_size(Some((1920, 1080)))
            .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
            // warning only do this if in docker env
            .sandbox(!is_docker)
            .args(vec![
                OsStr::new("--disable-gpu"),
                OsStr::new("--disable-software-rasterizer"),
                OsStr::new("--disable-extensions"),
                OsStr::new("--disable-notifications"),
                OsStr::new("--dns-prefetch-disable"),
                OsStr::new("--disable-background-networking"),
                OsStr::new("--proxy-server='direct://'"),
                OsStr::new("--proxy-bypass-list=*"),
                OsStr::new("--hide-scrollbars"),
            ])
            .build()
            .map_err(|e| PipelineError::Environment(e.to_string()))?;
        let browser = Browser::new(options).context("browser launching error")?;

        let tab = browser.new_tab().context("could not open tab")?;
        tab.set_default_timeout(Duration::from_secs(20));

        Ok(BrowserController {
            browser,
            tab,
            page_load_timeout: Duration::from_secs(page_load_timeout_secs),
        })
    }

    /// Loads the cookie export and applies it through CDP, domain by
    /// domain, without navigating anywhere. A missing file is a warned
    /// no-op; a cookie the browser rejects is skipped.
    pub fn inject_cookies(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            warn!("cookies file not found: {:?}", path);
            return Ok(());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("could not read cookies file {:?}", path))?;
        let cookies: Vec<StoredCookie> =
            serde_json::from_str(&raw).context("invalid cookies format")?;

        let groups = group_cookies_by_domain(cookies);
        for (domain, domain_cookies) in groups {
            debug!("setting up {} cookies for {}", domain_cookies.len(), domain);
            let mut applied = 0;
            for cookie in &domain_cookies {
                let param = match cookie_param(cookie) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("skipping cookie {}: {}", cookie.name, e);
                        continue;
                    }
                };
                match self.tab.set_cookies(vec![param]) {
                    Ok(_) => applied += 1,
                    Err(e) => warn!("error adding cookie {}: {}", cookie.name, e),
                }
            }
            info!("added {} cookies for {}", applied, domain);
        }
        Ok(())
    }

    /// Full-page capture of `url` written to `output_path`. Returns the
    /// page title. Blocking; run it under `spawn_blocking`.
    pub fn capture_full_page(&self, url: &str, output_path: &Path) -> Result<String> {
        let tab = &self.tab;

        info!("navigating to {}", url);
        tab.navigate_to(url)
            .with_context(|| format!("could not navigate to {}", url))?
            .wait_until_navigated()
            .with_context(|| format!("navigation to {} did not settle", url))?;

        self.wait_for_ready_state()?;
        thread::sleep(SETTLE_AFTER_LOAD);

        debug!("normalizing page layout");
        tab.evaluate(LAYOUT_NORMALIZATION_JS, false)
            .map_err(|e| PipelineError::Capture(format!("layout normalization failed: {}", e)))?;
        thread::sleep(SETTLE_AFTER_LAYOUT);

        let metrics = self.dom_metrics()?;
        let (width, height) = viewport_from_metrics(&metrics);
        info!("setting viewport size: {}x{} pixels", width, height);
        tab.set_bounds(Bounds::Normal {
            left: None,
            top: None,
            width: Some(width as f64),
            height: Some(height as f64),
        })
        .map_err(|e| PipelineError::Capture(format!("viewport resize failed: {}", e)))?;
        thread::sleep(SETTLE_AFTER_RESIZE);

        debug!("scrolling to trigger lazy content");
        let content_height = metrics.max_height();
        tab.evaluate(&get_scroll_script(content_height), true)
            .map_err(|e| PipelineError::Capture(format!("scroll pass failed: {}", e)))?;
        thread::sleep(scroll_settle_duration(content_height));

        let png = self.capture_image()?;
        fs::write(output_path, png)
            .with_context(|| format!("could not save screenshot for {}", url))?;

        let title = tab.get_title().unwrap_or_default();
        info!("screenshot captured for {} ({:?})", url, title);
        Ok(title)
    }

    pub fn close(&self) {
        debug!("closing browser session...");
        if !self.kill() {
            warn!("browser process was already gone");
        }
    }

    fn wait_for_ready_state(&self) -> Result<()> {
        let deadline = Instant::now() + self.page_load_timeout;
        loop {
            let state = self
                .tab
                .evaluate("document.readyState", false)
                .ok()
                .and_then(|r| r.value)
                .and_then(|v| v.as_str().map(|s| s.to_string()));
            if state.as_deref() == Some("complete") {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(PipelineError::PageLoadTimeout {
                    url: self.tab.get_url(),
                    title: self.tab.get_title().unwrap_or_default(),
                }));
            }
            thread::sleep(READY_STATE_POLL_INTERVAL);
        }
    }

    fn dom_metrics(&self) -> Result<DomMetrics> {
        let result = self
            .tab
            .evaluate(DIMENSION_JS, false)
            .map_err(|e| PipelineError::Capture(format!("dimension probe failed: {}", e)))?;
        let raw = result
            .value
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .ok_or_else(|| PipelineError::Capture("dimension probe returned nothing".into()))?;
        let metrics: DomMetrics = serde_json::from_str(&raw)
            .map_err(|e| PipelineError::Capture(format!("unreadable dimensions: {}", e)))?;
        Ok(metrics)
    }

    /// Three capture strategies in priority order. The body-element
    /// bitmap frames exact content best; the viewport screenshot and
    /// the in-page canvas encode are progressively cruder fallbacks
    /// for pages where the earlier methods raise.
    fn capture_image(&self) -> Result<Vec<u8>> {
        let tab = &self.tab;

        match tab
            .find_element("body")
            .and_then(|body| body.capture_screenshot(CaptureScreenshotFormatOption::Png))
        {
            Ok(png) => {
                debug!("captured using body element method");
                return Ok(png);
            }
            Err(e) => warn!("body capture failed, using full page method: {}", e),
        }

        match tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true) {
            Ok(png) => {
                debug!("captured using full page method");
                return Ok(png);
            }
            Err(e) => warn!("full page capture failed, using canvas method: {}", e),
        }

        let result = tab
            .evaluate(CANVAS_CAPTURE_JS, false)
            .map_err(|e| PipelineError::Capture(format!("canvas capture failed: {}", e)))?;
        let data_url = result
            .value
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .ok_or_else(|| PipelineError::Capture("canvas capture returned nothing".into()))?;
        let png = decode_data_url(&data_url)?;
        debug!("captured using canvas method");
        Ok(png)
    }

    fn kill(&self) -> bool {
        let pid = match self.browser.get_process_id() {
            Some(pid) => pid,
            None => return false,
        };
        let s = System::new();
        if let Some(process) = s.process(Pid::from_u32(pid)) {
            debug!("killing browser process with id {}", pid);
            process.kill();
            return true;
        }
        false
    }
}

impl Drop for BrowserController {
    fn drop(&mut self) {
        debug!("killing browser process...");
        self.kill();
    }
}

fn decode_data_url(data_url: &str) -> Result<Vec<u8>> {
    let encoded = data_url
        .split_once(',')
        .map(|(_, b64)| b64)
        .ok_or_else(|| PipelineError::Capture("canvas returned an invalid data URL".into()))?;
    BASE64
        .decode(encoded)
        .map_err(|e| anyhow!(PipelineError::Capture(format!("bad base64 image: {}", e))))
}

#[cfg(test)]
mod test {
    use super::*;

    fn metrics(doc: f64, body: f64) -> DomMetrics {
        DomMetrics {
            doc_scroll_width: doc,
            doc_offset_width: doc - 10.0,
            doc_client_width: doc - 20.0,
            body_scroll_width: body,
            body_offset_width: body - 10.0,
            body_client_width: body - 20.0,
            doc_scroll_height: doc * 2.0,
            doc_offset_height: doc * 2.0 - 10.0,
            doc_client_height: doc * 2.0 - 20.0,
            body_scroll_height: body * 2.0,
            body_offset_height: body * 2.0 - 10.0,
            body_client_height: body * 2.0 - 20.0,
        }
    }

    #[test]
    fn viewport_is_max_metric_plus_padding() {
        // body larger than documentElement
        let m = metrics(800.0, 1200.0);
        assert_eq!(viewport_from_metrics(&m), (1300, 2500));

        // documentElement larger than body
        let m = metrics(1500.0, 900.0);
        assert_eq!(viewport_from_metrics(&m), (1600, 3100));
    }

    #[test]
    fn scroll_settle_scales_with_height() {
        assert_eq!(
            scroll_settle_duration(2500.0),
            Duration::from_millis(4 * 100 + 1000)
        );
        assert_eq!(
            scroll_settle_duration(500.0),
            Duration::from_millis(2 * 100 + 1000)
        );
    }

    #[test]
    fn cookie_param_carries_expiry() {
        let cookie = StoredCookie {
            name: "session".into(),
            value: "abc".into(),
            domain: ".example.com".into(),
            path: None,
            secure: Some(true),
            http_only: Some(false),
            expiration_date: Some(1893456000.0),
        };
        let param = cookie_param(&cookie).unwrap();
        assert_eq!(param.name, "session");
        assert_eq!(param.path.as_deref(), Some("/"));
        assert_eq!(param.expires, Some(1893456000.0));
    }

    #[test]
    fn data_url_is_decoded() {
        let png = decode_data_url("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(png, b"hello");

        assert!(decode_data_url("no-comma").is_err());
    }

    #[test]
    fn session_outlives_upload_backoff_between_captures() {
        let backoff: Duration =
            crate::drive::upload_retry_delays(crate::drive::MAX_UPLOAD_ATTEMPTS).sum();
        // generous headroom for the transfers around the waits
        assert!(IDLE_BROWSER_TIMEOUT >= backoff * 10);
    }

    #[test]
    fn scroll_script_embeds_height() {
        let script = get_scroll_script(4200.0);
        assert!(script.contains("const height = 4200"));
        assert!(script.contains("window.scrollTo(0, 0)"));
    }
}
