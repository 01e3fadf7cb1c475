use anyhow::Result;
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::dom;
use crate::types::{ActionType, DomElement, ExecutionResult, MicroAction, ScreenState};

#[derive(Debug, Error)]
pub enum HandsError {
    #[error("no active browser session")]
    NotConnected,

    #[error("browser error: {0}")]
    Browser(String),
}

/// The execution collaborator. Runs one action at a time and produces
/// fresh page observations on demand.
#[async_trait]
pub trait Hands: Send + Sync {
    /// Fresh observation of the current page.
    async fn capture(&self) -> Result<ScreenState, HandsError>;

    /// Execute exactly one action. Ordinary action failures are reported
    /// in the result, never as an error.
    async fn execute(&self, action: &MicroAction) -> ExecutionResult;

    /// Whether `text` is visible on the current page.
    async fn check_text_visible(&self, text: &str) -> Result<bool, HandsError>;

    /// Release the underlying session.
    async fn close(&self);
}

/// Persistent Chrome session driven over the DevTools protocol.
/// Attaches to a running Chrome first; launches its own when none is
/// listening.
pub struct ChromeHands {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeHands {
    /// Attach to an existing Chrome at `endpoint`.
    pub fn connect(endpoint: &str) -> Result<Self> {
        let browser = Browser::connect(endpoint.to_string())?;
        let tab = {
            let tabs_lock = browser.get_tabs();
            let tabs = tabs_lock.lock().unwrap();
            match tabs.first() {
                Some(t) => t.clone(),
                None => browser.new_tab()?,
            }
        };
        tracing::info!(endpoint, "attached to running Chrome");
        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    /// Launch a fresh visible Chrome.
    pub fn launch() -> Result<Self> {
        let options = LaunchOptions {
            headless: false,
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
                std::ffi::OsStr::new("--disable-infobars"),
            ],
            idle_browser_timeout: Duration::from_secs(300),
            ..Default::default()
        };

        let browser = Browser::new(options)
            .map_err(|e| anyhow::anyhow!("Browser launch failed: {}", e))?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;
        tracing::info!("launched Chrome");
        Ok(Self {
            _browser: browser,
            tab,
        })
    }

    /// Attach if possible, otherwise launch.
    pub fn connect_or_launch(endpoint: &str) -> Result<Self> {
        match Self::connect(endpoint) {
            Ok(hands) => Ok(hands),
            Err(e) => {
                tracing::warn!(endpoint, error = %e, "could not attach, launching Chrome");
                Self::launch()
            }
        }
    }
}

/// Resolve the page selector for an element-targeted action.
fn target_selector(action: &MicroAction) -> Result<String, String> {
    match action.target_index {
        Some(index) => Ok(format!("[data-eid=\"e{index}\"]")),
        None => Err(format!(
            "{:?} requires a target_index from the DOM snapshot",
            action.action_type
        )),
    }
}

/// Run one action against the tab. Blocking; called under spawn_blocking.
fn execute_on_tab(tab: &Arc<Tab>, action: &MicroAction) -> Result<()> {
    match action.action_type {
        ActionType::Click => {
            let selector = target_selector(action).map_err(anyhow::Error::msg)?;
            let el = tab.find_element(&selector)?;
            el.click()?;
            std::thread::sleep(Duration::from_millis(1000));
        }
        ActionType::Type => {
            let selector = target_selector(action).map_err(anyhow::Error::msg)?;
            let el = tab.find_element(&selector)?;
            el.click()?;
            let js_sel = selector.replace('\'', "\\'");
            tab.evaluate(
                &format!("document.querySelector('{js_sel}').value = ''"),
                false,
            )?;
            tab.type_str(action.value.as_deref().unwrap_or(""))?;
        }
        ActionType::Scroll => {
            let delta: i64 = action
                .value
                .as_deref()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600);
            tab.evaluate(&format!("window.scrollBy(0, {delta})"), false)?;
            std::thread::sleep(Duration::from_millis(500));
        }
        ActionType::Hover => {
            let selector = target_selector(action).map_err(anyhow::Error::msg)?;
            let el = tab.find_element(&selector)?;
            el.move_mouse_over()?;
            std::thread::sleep(Duration::from_millis(500));
        }
        ActionType::SelectOption => {
            let selector = target_selector(action).map_err(anyhow::Error::msg)?;
            let js_sel = selector.replace('\'', "\\'");
            let wanted = serde_json::to_string(action.value.as_deref().unwrap_or(""))?;
            tab.evaluate(
                &format!(
                    "(() => {{
                       const sel = document.querySelector('{js_sel}');
                       const opt = [...sel.options].find(o => o.text.trim() === {wanted} || o.value === {wanted});
                       if (!opt) throw new Error('option not found');
                       sel.value = opt.value;
                       sel.dispatchEvent(new Event('change', {{bubbles: true}}));
                     }})()"
                ),
                false,
            )?;
        }
        ActionType::PressKey => {
            tab.press_key(action.value.as_deref().unwrap_or("Enter"))?;
            std::thread::sleep(Duration::from_millis(1000));
        }
        ActionType::Wait => {
            let ms: u64 = action
                .value
                .as_deref()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000);
            std::thread::sleep(Duration::from_millis(ms));
        }
        ActionType::GoToUrl => {
            let url = action
                .value
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("GO_TO_URL requires a url value"))?;
            tab.navigate_to(url)?;
            tab.wait_for_element("body")?;
            std::thread::sleep(Duration::from_millis(1500));
        }
        ActionType::GoBack => {
            tab.evaluate("history.back()", false)?;
            std::thread::sleep(Duration::from_millis(1000));
        }
        // Terminal markers are handled before dispatch; unreachable here.
        ActionType::Done | ActionType::Stuck => {}
    }
    Ok(())
}

/// Build a ScreenState from the live tab. Blocking.
fn capture_on_tab(tab: &Arc<Tab>) -> Result<ScreenState> {
    let url = dom::get_current_url(tab)?;
    let title = dom::get_page_title(tab)?;
    let elements: Vec<DomElement> = dom::capture_elements(tab)?;
    let screenshot = tab
        .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
        .ok();

    Ok(ScreenState {
        url,
        title,
        elements,
        screenshot,
    })
}

#[async_trait]
impl Hands for ChromeHands {
    async fn capture(&self) -> Result<ScreenState, HandsError> {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || capture_on_tab(&tab))
            .await
            .map_err(|e| HandsError::Browser(format!("capture task panicked: {e}")))?
            .map_err(|e| HandsError::Browser(format!("{e:#}")))
    }

    async fn execute(&self, action: &MicroAction) -> ExecutionResult {
        // Terminal markers never touch the browser.
        match action.action_type {
            ActionType::Done => return ExecutionResult::ok(),
            ActionType::Stuck => {
                return ExecutionResult::failed(
                    action.value.clone().unwrap_or_else(|| "STUCK".to_string()),
                );
            }
            _ => {}
        }

        let tab = self.tab.clone();
        let action = action.clone();
        let outcome = tokio::task::spawn_blocking(move || execute_on_tab(&tab, &action)).await;

        match outcome {
            Ok(Ok(())) => ExecutionResult::ok(),
            Ok(Err(e)) => ExecutionResult::failed(format!("{e:#}")),
            Err(e) => ExecutionResult::failed(format!("execution task panicked: {e}")),
        }
    }

    async fn check_text_visible(&self, text: &str) -> Result<bool, HandsError> {
        let tab = self.tab.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || dom::is_text_visible(&tab, &text))
            .await
            .map_err(|e| HandsError::Browser(format!("visibility task panicked: {e}")))?
            .map_err(|e| HandsError::Browser(format!("{e:#}")))
    }

    async fn close(&self) {
        // Chrome is torn down when the Browser handle drops; attached
        // sessions are left running.
        tracing::info!("browser session closed");
    }
}
