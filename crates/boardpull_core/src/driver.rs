//! Browser automation over the W3C WebDriver wire protocol. The traversal
//! and extraction code never talk to the driver directly; they go through
//! [`UiActions`], which tests replace with a scripted fake.

use std::fmt;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use reqwest::Method;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::ScrapeConfig;

/// W3C element identifier key in wire payloads.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const DEFAULT_HTTP_TIMEOUT_MS: u64 = 120_000;
const ACCEPT_LANGUAGE: &str = "en-GB";

/// Opaque reference to a located element. Valid until the page it came from
/// navigates or rerenders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle(String);

impl ElementHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

/// Everything the traversal engine and extractor ask of a browser. Lookup
/// methods wait up to the configured bound, polling at the configured
/// interval, and report absence as `None` or an empty list; errors are
/// reserved for the session itself failing.
pub trait UiActions {
    fn goto(&mut self, url: &str) -> Result<()>;
    fn locate(&mut self, xpath: &str) -> Result<Option<ElementHandle>>;
    fn locate_all(&mut self, xpath: &str) -> Result<Vec<ElementHandle>>;
    fn locate_in(&mut self, scope: &ElementHandle, xpath: &str) -> Result<Option<ElementHandle>>;
    fn locate_all_in(&mut self, scope: &ElementHandle, xpath: &str) -> Result<Vec<ElementHandle>>;
    /// Wait for the element and click it, falling back to a script click when
    /// the native click is intercepted. Errors once retries are exhausted.
    fn click(&mut self, xpath: &str) -> Result<()>;
    fn click_in(&mut self, scope: &ElementHandle, xpath: &str) -> Result<()>;
    fn click_element(&mut self, element: &ElementHandle) -> Result<()>;
    fn read_text(&mut self, xpath: &str) -> Result<Option<String>>;
    fn element_text(&mut self, element: &ElementHandle) -> Result<String>;
    fn read_attribute(&mut self, element: &ElementHandle, name: &str) -> Result<Option<String>>;
    fn inner_html(&mut self, element: &ElementHandle) -> Result<String>;
    /// Computed accessibility label, used to tell tab layouts apart.
    fn accessible_name(&mut self, element: &ElementHandle) -> Result<String>;
    fn type_text(&mut self, xpath: &str, text: &str) -> Result<()>;
    /// Synthesize a mouseover so hover-only tooltips render.
    fn hover(&mut self, element: &ElementHandle) -> Result<()>;
    /// Detach a node from the document, used to dismiss tooltips and popups.
    fn remove_node(&mut self, element: &ElementHandle) -> Result<()>;
    fn scroll_to_bottom(&mut self, element: &ElementHandle) -> Result<()>;
    fn window_handles(&mut self) -> Result<Vec<String>>;
    fn current_window(&mut self) -> Result<String>;
    fn focus_window(&mut self, handle: &str) -> Result<()>;
    fn close_window(&mut self) -> Result<()>;
    fn current_url(&mut self) -> Result<String>;
    fn page_title(&mut self) -> Result<String>;
}

/// Wire-level failure reported by the driver, carrying the W3C error code so
/// callers can react to specific conditions like a stale element.
#[derive(Debug)]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "webdriver error [{}]: {}", self.code, self.message)
    }
}

impl std::error::Error for WireError {}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub webdriver_url: String,
    /// Browser downloads land here; doubles as the attachment staging area.
    pub download_dir: PathBuf,
    pub browser_binary: Option<String>,
    pub max_wait: Duration,
    pub poll_interval: Duration,
    pub max_retries: u32,
}

impl SessionOptions {
    pub fn new(webdriver_url: impl Into<String>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            webdriver_url: webdriver_url.into(),
            download_dir: download_dir.into(),
            browser_binary: None,
            max_wait: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            max_retries: 3,
        }
    }

    pub fn with_scrape_config(mut self, config: &ScrapeConfig) -> Self {
        self.max_wait = config.max_wait_time;
        self.poll_interval = config.poll_interval;
        self.max_retries = config.max_retries;
        self
    }
}

/// Capabilities for a fresh browser session: isolated profile, no download
/// prompts, downloads routed into the staging directory.
fn session_capabilities(options: &SessionOptions) -> Value {
    let mut chrome_options = json!({
        "args": ["--start-maximized", "--incognito"],
        "detach": true,
        "prefs": {
            "download.default_directory": options.download_dir.to_string_lossy(),
            "download.prompt_for_download": false,
            "download.directory_upgrade": true,
            "intl.accept_languages": ACCEPT_LANGUAGE,
        },
    });
    if let Some(binary) = &options.browser_binary {
        chrome_options["binary"] = json!(binary);
    }
    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "chrome",
                "acceptInsecureCerts": true,
                "goog:chromeOptions": chrome_options,
            }
        }
    })
}

fn parse_element(value: &Value) -> Option<ElementHandle> {
    value
        .get(ELEMENT_KEY)
        .and_then(Value::as_str)
        .map(ElementHandle::new)
}

fn element_arg(element: &ElementHandle) -> Value {
    json!({ ELEMENT_KEY: element.id() })
}

pub(crate) fn is_stale(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<WireError>()
        .is_some_and(|wire| wire.code == "stale element reference")
}

/// Collapse a stale-element failure into an absent element. Grids redraw
/// whole rows, so a lookup scoped to a stale handle means "gone", not broken.
pub(crate) fn absent_if_stale(
    result: Result<Option<ElementHandle>>,
) -> Result<Option<ElementHandle>> {
    match result {
        Err(error) if is_stale(&error) => Ok(None),
        other => other,
    }
}

fn is_click_blocked(error: &anyhow::Error) -> bool {
    error.downcast_ref::<WireError>().is_some_and(|wire| {
        matches!(
            wire.code.as_str(),
            "element click intercepted" | "element not interactable" | "stale element reference"
        )
    })
}

pub struct WebDriverSession {
    http: Client,
    base_url: String,
    session_id: String,
    max_wait: Duration,
    poll_interval: Duration,
    max_retries: u32,
}

impl WebDriverSession {
    /// Open a browser session against a running WebDriver endpoint.
    pub fn connect(options: &SessionOptions) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS))
            .build()
            .context("failed to build WebDriver HTTP client")?;
        let base_url = options.webdriver_url.trim_end_matches('/').to_string();

        let response = http
            .post(format!("{base_url}/session"))
            .json(&session_capabilities(options))
            .send()
            .with_context(|| format!("failed to reach WebDriver at {base_url}"))?;
        let payload: Value = response
            .json()
            .context("failed to decode WebDriver session response")?;
        let session_id = payload
            .get("value")
            .and_then(|value| value.get("sessionId"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                anyhow::anyhow!("WebDriver refused the session: {payload}")
            })?
            .to_string();
        debug!(%session_id, "browser session started");

        Ok(Self {
            http,
            base_url,
            session_id,
            max_wait: options.max_wait,
            poll_interval: options.poll_interval,
            max_retries: options.max_retries,
        })
    }

    /// End the session and close the browser.
    pub fn quit(self) -> Result<()> {
        let url = format!("{}/session/{}", self.base_url, self.session_id);
        self.http
            .delete(url)
            .send()
            .context("failed to end WebDriver session")?;
        Ok(())
    }

    fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}/session/{}{}", self.base_url, self.session_id, path);
        let mut request = self.http.request(method.clone(), &url);
        if let Some(body) = &body {
            request = request.json(body);
        } else if method == Method::POST {
            request = request.json(&json!({}));
        }
        let response = request
            .send()
            .with_context(|| format!("WebDriver request failed: {method} {path}"))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .with_context(|| format!("failed to decode WebDriver response for {path}"))?;
        if !status.is_success() {
            let code = payload
                .get("value")
                .and_then(|value| value.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            let message = payload
                .get("value")
                .and_then(|value| value.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            return Err(anyhow::Error::new(WireError { code, message }));
        }
        Ok(payload.get("value").cloned().unwrap_or(Value::Null))
    }

    fn execute(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
    }

    /// Single probe without waiting. Absence is an empty list, not an error.
    fn find_all_now(&self, scope: Option<&ElementHandle>, xpath: &str) -> Result<Vec<ElementHandle>> {
        let path = match scope {
            Some(scope) => format!("/element/{}/elements", scope.id()),
            None => "/elements".to_string(),
        };
        let value = self.command(
            Method::POST,
            &path,
            Some(json!({ "using": "xpath", "value": xpath })),
        )?;
        let elements = value
            .as_array()
            .map(|entries| entries.iter().filter_map(parse_element).collect())
            .unwrap_or_default();
        Ok(elements)
    }

    fn displayed(&self, element: &ElementHandle) -> Result<bool> {
        let result = self.command(
            Method::GET,
            &format!("/element/{}/displayed", element.id()),
            None,
        );
        match result {
            Ok(value) => Ok(value.as_bool().unwrap_or(false)),
            // The page rerendered under us; the next poll refetches.
            Err(error) if is_stale(&error) => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn wait_for(
        &self,
        scope: Option<&ElementHandle>,
        xpath: &str,
    ) -> Result<Option<ElementHandle>> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            for element in self.find_all_now(scope, xpath)? {
                if self.displayed(&element)? {
                    return Ok(Some(element));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(self.poll_interval);
        }
    }

    fn wait_for_all(
        &self,
        scope: Option<&ElementHandle>,
        xpath: &str,
    ) -> Result<Vec<ElementHandle>> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            let found = self.find_all_now(scope, xpath)?;
            if !found.is_empty() {
                let mut all_visible = true;
                for element in &found {
                    if !self.displayed(element)? {
                        all_visible = false;
                        break;
                    }
                }
                if all_visible {
                    return Ok(found);
                }
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            sleep(self.poll_interval);
        }
    }

    fn click_with_retry(&self, scope: Option<&ElementHandle>, xpath: &str) -> Result<()> {
        let mut last_error = None::<anyhow::Error>;
        for attempt in 0..self.max_retries {
            let Some(element) = self.wait_for(scope, xpath)? else {
                warn!(xpath, attempt, "element not present yet, retrying click");
                continue;
            };
            match self.command(Method::POST, &format!("/element/{}/click", element.id()), None) {
                Ok(_) => return Ok(()),
                Err(error) if is_click_blocked(&error) => {
                    // Overlays swallow native clicks; a script click does not
                    // need the element to be on top.
                    if self
                        .execute("arguments[0].click();", vec![element_arg(&element)])
                        .is_ok()
                    {
                        return Ok(());
                    }
                    last_error = Some(error);
                }
                Err(error) => last_error = Some(error),
            }
            sleep(self.poll_interval);
        }
        match last_error {
            Some(error) => Err(error.context(format!("failed to click {xpath}"))),
            None => bail!("element never became clickable: {xpath}"),
        }
    }
}

impl UiActions for WebDriverSession {
    fn goto(&mut self, url: &str) -> Result<()> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))?;
        Ok(())
    }

    fn locate(&mut self, xpath: &str) -> Result<Option<ElementHandle>> {
        self.wait_for(None, xpath)
    }

    fn locate_all(&mut self, xpath: &str) -> Result<Vec<ElementHandle>> {
        self.wait_for_all(None, xpath)
    }

    fn locate_in(&mut self, scope: &ElementHandle, xpath: &str) -> Result<Option<ElementHandle>> {
        self.wait_for(Some(scope), xpath)
    }

    fn locate_all_in(&mut self, scope: &ElementHandle, xpath: &str) -> Result<Vec<ElementHandle>> {
        self.wait_for_all(Some(scope), xpath)
    }

    fn click(&mut self, xpath: &str) -> Result<()> {
        self.click_with_retry(None, xpath)
    }

    fn click_in(&mut self, scope: &ElementHandle, xpath: &str) -> Result<()> {
        self.click_with_retry(Some(scope), xpath)
    }

    fn click_element(&mut self, element: &ElementHandle) -> Result<()> {
        let result = self.command(
            Method::POST,
            &format!("/element/{}/click", element.id()),
            None,
        );
        match result {
            Ok(_) => Ok(()),
            Err(error) if is_click_blocked(&error) => {
                self.execute("arguments[0].click();", vec![element_arg(element)])?;
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    fn read_text(&mut self, xpath: &str) -> Result<Option<String>> {
        match self.wait_for(None, xpath)? {
            Some(element) => Ok(Some(self.element_text(&element)?)),
            None => Ok(None),
        }
    }

    fn element_text(&mut self, element: &ElementHandle) -> Result<String> {
        let value = self.command(Method::GET, &format!("/element/{}/text", element.id()), None)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn read_attribute(&mut self, element: &ElementHandle, name: &str) -> Result<Option<String>> {
        let value = self.command(
            Method::GET,
            &format!("/element/{}/attribute/{name}", element.id()),
            None,
        )?;
        if let Some(text) = value.as_str() {
            return Ok(Some(text.to_string()));
        }
        // DOM properties like innerHTML and value are not attributes.
        let value = self.command(
            Method::GET,
            &format!("/element/{}/property/{name}", element.id()),
            None,
        )?;
        Ok(value.as_str().map(ToString::to_string))
    }

    fn inner_html(&mut self, element: &ElementHandle) -> Result<String> {
        Ok(self
            .read_attribute(element, "innerHTML")?
            .unwrap_or_default())
    }

    fn accessible_name(&mut self, element: &ElementHandle) -> Result<String> {
        let value = self.command(
            Method::GET,
            &format!("/element/{}/computedlabel", element.id()),
            None,
        )?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn type_text(&mut self, xpath: &str, text: &str) -> Result<()> {
        let Some(element) = self.wait_for(None, xpath)? else {
            bail!("input field not found: {xpath}");
        };
        self.command(
            Method::POST,
            &format!("/element/{}/value", element.id()),
            Some(json!({ "text": text })),
        )?;
        Ok(())
    }

    fn hover(&mut self, element: &ElementHandle) -> Result<()> {
        self.execute(
            "arguments[0].dispatchEvent(new MouseEvent('mouseover', {'bubbles': true}));",
            vec![element_arg(element)],
        )?;
        Ok(())
    }

    fn remove_node(&mut self, element: &ElementHandle) -> Result<()> {
        self.execute(
            "arguments[0].parentNode.removeChild(arguments[0]);",
            vec![element_arg(element)],
        )?;
        Ok(())
    }

    fn scroll_to_bottom(&mut self, element: &ElementHandle) -> Result<()> {
        self.execute(
            "arguments[0].scrollTop = arguments[0].scrollHeight",
            vec![element_arg(element)],
        )?;
        Ok(())
    }

    fn window_handles(&mut self) -> Result<Vec<String>> {
        let value = self.command(Method::GET, "/window/handles", None)?;
        let handles = value
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(handles)
    }

    fn current_window(&mut self) -> Result<String> {
        let value = self.command(Method::GET, "/window", None)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn focus_window(&mut self, handle: &str) -> Result<()> {
        self.command(Method::POST, "/window", Some(json!({ "handle": handle })))?;
        Ok(())
    }

    fn close_window(&mut self) -> Result<()> {
        self.command(Method::DELETE, "/window", None)?;
        Ok(())
    }

    fn current_url(&mut self) -> Result<String> {
        let value = self.command(Method::GET, "/url", None)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn page_title(&mut self) -> Result<String> {
        let value = self.command(Method::GET, "/title", None)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_route_downloads_to_staging() {
        let options = SessionOptions::new("http://localhost:9515", "/tmp/stage/attachments");
        let caps = session_capabilities(&options);
        let prefs = &caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["prefs"];
        assert_eq!(
            prefs["download.default_directory"],
            json!("/tmp/stage/attachments")
        );
        assert_eq!(prefs["download.prompt_for_download"], json!(false));
        assert_eq!(
            caps["capabilities"]["alwaysMatch"]["acceptInsecureCerts"],
            json!(true)
        );
        assert!(
            caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]
                .get("binary")
                .is_none()
        );
    }

    #[test]
    fn capabilities_include_binary_when_set() {
        let mut options = SessionOptions::new("http://localhost:9515", "/tmp/stage");
        options.browser_binary = Some("/usr/bin/chromium".to_string());
        let caps = session_capabilities(&options);
        assert_eq!(
            caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["binary"],
            json!("/usr/bin/chromium")
        );
    }

    #[test]
    fn parse_element_reads_w3c_reference() {
        let value = json!({ ELEMENT_KEY: "node-7" });
        let element = parse_element(&value).expect("element");
        assert_eq!(element.id(), "node-7");
        assert!(parse_element(&json!({ "other": "x" })).is_none());
    }

    #[test]
    fn wire_error_codes_drive_click_fallback() {
        let intercepted = anyhow::Error::new(WireError {
            code: "element click intercepted".to_string(),
            message: "overlay".to_string(),
        });
        assert!(is_click_blocked(&intercepted));
        assert!(!is_stale(&intercepted));

        let stale = anyhow::Error::new(WireError {
            code: "stale element reference".to_string(),
            message: "gone".to_string(),
        });
        assert!(is_stale(&stale));
        assert!(is_click_blocked(&stale));

        let other = anyhow::Error::new(WireError {
            code: "no such window".to_string(),
            message: "closed".to_string(),
        });
        assert!(!is_click_blocked(&other));
    }
}
