use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFinished, EventResponseReceived, GetResponseBodyParams, RequestId,
    SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, EventDomContentEventFired, EventLoadEventFired,
    NavigateParams,
};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::element::Element;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::BrowserSection;

use super::error::{BrowserError, BrowserResult};
use super::session::{
    Action, BrowsingSession, ObservedResponse, ResponseFilter, ResponseSubscription, SessionTab,
    WaitStrategy,
};

const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ViewportSpec {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOverrides {
    pub headless: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    config: Arc<BrowserSection>,
}

impl ChromiumLauncher {
    pub fn new(config: BrowserSection) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &BrowserSection {
        &self.config
    }

    pub async fn launch(&self) -> BrowserResult<ChromiumSession> {
        self.launch_with_overrides(LaunchOverrides::default()).await
    }

    pub async fn launch_with_overrides(
        &self,
        overrides: LaunchOverrides,
    ) -> BrowserResult<ChromiumSession> {
        let viewport = ViewportSpec {
            width: self.config.viewport[0],
            height: self.config.viewport[1],
        };
        let user_agent = self.select_user_agent();
        let headless = overrides.headless.unwrap_or(self.config.headless);
        let chromium_config = self.build_chromium_config(&viewport, &user_agent, headless)?;
        info!(
            ua = %user_agent,
            width = viewport.width,
            height = viewport.height,
            headless,
            "launching chromium"
        );

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        Ok(ChromiumSession {
            browser,
            handler_task: Some(handler_task),
            config: Arc::clone(&self.config),
            user_agent,
        })
    }

    fn select_user_agent(&self) -> String {
        let mut rng = rand::thread_rng();
        self.config
            .user_agents
            .choose(&mut rng)
            .cloned()
            .unwrap_or_else(|| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko)"
                    .to_string()
            })
    }

    fn build_chromium_config(
        &self,
        viewport: &ViewportSpec,
        user_agent: &str,
        headless: bool,
    ) -> BrowserResult<ChromiumConfig> {
        let mut builder = ChromiumConfig::builder().viewport(ChromiumViewport {
            width: viewport.width,
            height: viewport.height,
            device_scale_factor: None,
            emulating_mobile: false,
            is_landscape: viewport.width >= viewport.height,
            has_touch: false,
        });

        if let Some(path) = &self.config.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !headless {
            builder = builder.with_head();
        }
        if !self.config.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(seconds) = self.config.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(seconds));
        }

        let mut args = vec![
            format!("--user-agent={user_agent}"),
            format!("--window-size={},{}", viewport.width, viewport.height),
            "--no-first-run".to_string(),
            "--password-store=basic".to_string(),
        ];
        if let Some(lang) = &self.config.lang {
            args.push(format!("--lang={lang}"));
        }
        args.extend(self.config.extra_args.iter().cloned());

        builder = builder.args(args);
        builder.build().map_err(BrowserError::Configuration)
    }
}

#[derive(Debug)]
pub struct ChromiumSession {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
    config: Arc<BrowserSection>,
    user_agent: String,
}

impl ChromiumSession {
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub async fn shutdown(mut self) -> BrowserResult<()> {
        info!("shutting down chromium");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        Ok(())
    }

    async fn configure_page(&self, page: &Page) -> BrowserResult<()> {
        page.enable_stealth_mode_with_agent(&self.user_agent).await?;

        let mut params_builder =
            SetUserAgentOverrideParams::builder().user_agent(self.user_agent.clone());
        if let Some(accept) = &self.config.accept_language {
            params_builder = params_builder.accept_language(accept.clone());
        }
        let params = params_builder
            .build()
            .map_err(BrowserError::Configuration)?;
        page.set_user_agent(params).await?;

        if let Some(lang) = &self.config.lang {
            let languages_script = format!(
                "Object.defineProperty(navigator, 'language', {{ get: () => '{lang}' }});\nObject.defineProperty(navigator, 'languages', {{ get: () => ['{lang}', 'en'] }});"
            );
            page.evaluate_on_new_document(
                AddScriptToEvaluateOnNewDocumentParams::builder()
                    .source(languages_script)
                    .build()
                    .map_err(BrowserError::Configuration)?,
            )
            .await?;
        }

        page.execute(EnableParams::default()).await?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl BrowsingSession for ChromiumSession {
    async fn open_tab(&self) -> BrowserResult<Box<dyn SessionTab>> {
        let page = self
            .browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await?;
        self.configure_page(&page).await?;
        Ok(Box::new(ChromiumTab { page }))
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("ChromiumSession dropped without explicit shutdown");
            }
        }
    }
}

#[derive(Debug)]
pub struct ChromiumTab {
    page: Page,
}

impl ChromiumTab {
    pub fn page(&self) -> &Page {
        &self.page
    }

    async fn navigate_inner(&self, url: &str, wait: WaitStrategy) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        let navigation_failed = |reason: String| BrowserError::Navigation {
            url: url.to_string(),
            reason,
        };

        match wait {
            WaitStrategy::Commit => {
                let response = self.page.execute(params).await?;
                if let Some(error) = &response.result.error_text {
                    return Err(navigation_failed(error.clone()));
                }
            }
            WaitStrategy::DomContentLoaded => {
                let mut fired = self.page.event_listener::<EventDomContentEventFired>().await?;
                let response = self.page.execute(params).await?;
                if let Some(error) = &response.result.error_text {
                    return Err(navigation_failed(error.clone()));
                }
                // same-document navigations (fragment changes) carry no loader
                if response.result.loader_id.is_some() && fired.next().await.is_none() {
                    return Err(navigation_failed("event stream closed".into()));
                }
            }
            WaitStrategy::Load => {
                let mut fired = self.page.event_listener::<EventLoadEventFired>().await?;
                let response = self.page.execute(params).await?;
                if let Some(error) = &response.result.error_text {
                    return Err(navigation_failed(error.clone()));
                }
                if response.result.loader_id.is_some() && fired.next().await.is_none() {
                    return Err(navigation_failed("event stream closed".into()));
                }
            }
        }
        Ok(())
    }

    async fn wait_for_element(&self, selector: &str, limit: Duration) -> BrowserResult<Element> {
        let deadline = Instant::now() + limit;
        loop {
            match self.page.find_element(selector).await {
                Ok(element) => return Ok(element),
                Err(err) if Instant::now() >= deadline => {
                    debug!(selector, error = %err, "element lookup gave up");
                    return Err(BrowserError::ElementNotFound(selector.to_string()));
                }
                Err(_) => sleep(ELEMENT_POLL_INTERVAL).await,
            }
        }
    }
}

#[async_trait(?Send)]
impl SessionTab for ChromiumTab {
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitStrategy,
        limit: Duration,
    ) -> BrowserResult<()> {
        timeout(limit, self.navigate_inner(url, wait))
            .await
            .map_err(|_| BrowserError::Timeout(format!("navigation to {url}")))?
    }

    async fn observe_responses(
        &mut self,
        filter: ResponseFilter,
    ) -> BrowserResult<ResponseSubscription> {
        let mut responses = self.page.event_listener::<EventResponseReceived>().await?;
        let mut finished = self.page.event_listener::<EventLoadingFinished>().await?;
        let page = self.page.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        let forwarder = tokio::spawn(async move {
            let mut pending: HashMap<RequestId, (String, u16)> = HashMap::new();
            loop {
                tokio::select! {
                    Some(event) = responses.next() => {
                        if filter.matches(&event.response.url) {
                            debug!(url = %event.response.url, "matched structured response");
                            pending.insert(
                                event.request_id.clone(),
                                (event.response.url.clone(), event.response.status as u16),
                            );
                        }
                    }
                    Some(event) = finished.next() => {
                        let Some((url, status)) = pending.remove(&event.request_id) else {
                            continue;
                        };
                        match fetch_body(&page, event.request_id.clone()).await {
                            Ok(body) => {
                                if tx.send(ObservedResponse { url, status, body }).is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!(url = %url, error = %err, "failed to read response body"),
                        }
                    }
                    else => break,
                }
            }
        });

        Ok(ResponseSubscription::new(rx, Some(forwarder)))
    }

    async fn interact(
        &mut self,
        selector: &str,
        action: Action,
        limit: Duration,
    ) -> BrowserResult<()> {
        let element = self.wait_for_element(selector, limit).await?;
        let failed = |err: chromiumoxide::error::CdpError| {
            BrowserError::Unexpected(format!("{action} on {selector} failed: {err}"))
        };
        match &action {
            Action::Click => {
                element.scroll_into_view().await.map_err(failed)?;
                element.click().await.map_err(failed)?;
            }
            Action::Fill(text) => {
                element.click().await.map_err(failed)?;
                element
                    .call_js_fn("function() { this.value = ''; }", false)
                    .await
                    .map_err(failed)?;
                element.type_str(text).await.map_err(failed)?;
            }
            Action::Press(key) => {
                element.press_key(key).await.map_err(failed)?;
            }
            Action::Select(value) => {
                let literal = serde_json::to_string(value)
                    .map_err(|err| BrowserError::Script(err.to_string()))?;
                let function = format!(
                    "function() {{ this.value = {literal}; this.dispatchEvent(new Event('change', {{ bubbles: true }})); }}"
                );
                element
                    .call_js_fn(function, false)
                    .await
                    .map_err(failed)?;
            }
        }
        Ok(())
    }

    async fn evaluate(&mut self, script: &str) -> BrowserResult<Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|err| BrowserError::Script(err.to_string()))?;
        Ok(result.into_value::<Value>().unwrap_or(Value::Null))
    }

    async fn screenshot(&mut self) -> BrowserResult<Vec<u8>> {
        let bytes = self
            .page
            .screenshot(ScreenshotParams::builder().build())
            .await?;
        Ok(bytes)
    }

    async fn current_url(&mut self) -> BrowserResult<Option<String>> {
        Ok(self.page.url().await?)
    }

    async fn close(self: Box<Self>) -> BrowserResult<()> {
        self.page.close().await?;
        Ok(())
    }
}

async fn fetch_body(page: &Page, request_id: RequestId) -> BrowserResult<String> {
    let response = page.execute(GetResponseBodyParams::new(request_id)).await?;
    if response.result.base64_encoded {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(response.result.body.as_bytes())
            .map_err(|err| BrowserError::Network(format!("invalid base64 body: {err}")))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        Ok(response.result.body.clone())
    }
}
