//! Chromium-based renderer using chromiumoxide.
//!
//! One headless Chromium process serves the whole server. Every session
//! gets its own browser context (cookies, storage, cache) and a single
//! page. Requests issued by the page are paused through the DevTools
//! `Fetch` domain:
//!
//! - main-frame document requests continue untouched;
//! - main-frame document responses are recorded, and redirects are held
//!   back unless the session follows redirects;
//! - everything else is a sub-resource and goes through the session hook.

use super::{
    FilterDecision, NavigationOutcome, RenderSession, Renderer, SessionOptions, SubresourceHook,
    SubresourceRequest, SyntheticResponse,
};
use crate::error::RenderError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{BrowserContextId, CloseParams};
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FulfillRequestParams, HeaderEntry,
    RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::network::{self, ResourceType};
use chromiumoxide::cdp::browser_protocol::page::FrameId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Identification string sent with every request the engine makes.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 Chrome/10.0.613.0 Safari/534.15 PrerenderBot";

/// How long the network must stay quiet before a page counts as settled.
const NETWORK_IDLE: Duration = Duration::from_millis(500);

/// Poll interval while waiting for network idle.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Serializes the document including its doctype.
const DOCUMENT_HTML_JS: &str = "(document.doctype ? new XMLSerializer().serializeToString(document.doctype) : '') + document.documentElement.outerHTML";

/// Launch settings for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Explicit browser binary; searched for when absent.
    pub chromium_path: Option<PathBuf>,
    pub user_agent: String,
    /// Surface engine diagnostics at `warn` instead of `debug`.
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chromium_path: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            verbose: false,
        }
    }
}

/// Find the Chromium binary path.
pub fn find_chromium(explicit: Option<&Path>) -> Option<PathBuf> {
    // 1. Explicit path from configuration
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
    }

    // 2. PRERENDER_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("PRERENDER_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 3. ~/.prerender/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = if cfg!(target_os = "macos") {
            vec![
                home.join(".prerender/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".prerender/chromium/chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".prerender/chromium/chrome"),
            ]
        } else {
            vec![
                home.join(".prerender/chromium/chrome-linux64/chrome"),
                home.join(".prerender/chromium/chrome"),
            ]
        };
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    // 4. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 5. Common macOS location
    if cfg!(target_os = "macos") {
        let common =
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Chromium-based renderer.
pub struct ChromiumRenderer {
    browser: Arc<Browser>,
    handler_task: JoinHandle<()>,
    active_count: Arc<AtomicUsize>,
}

impl ChromiumRenderer {
    /// Launch a headless Chromium instance.
    pub async fn launch(engine: &EngineConfig) -> Result<Self> {
        let chrome_path = find_chromium(engine.chromium_path.as_deref()).context(
            "Chromium not found. Set PRERENDER_CHROMIUM_PATH or pass --chromium-path.",
        )?;
        debug!("using Chromium at {}", chrome_path.display());

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg(format!("--user-agent={}", engine.user_agent))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        let verbose = engine.verbose;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    if verbose {
                        warn!("chromium: {e}");
                    } else {
                        debug!("chromium: {e}");
                    }
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            handler_task,
            active_count: Arc::new(AtomicUsize::new(0)),
        })
    }

    async fn dispose_context(&self, context_id: BrowserContextId) {
        if let Err(e) = self
            .browser
            .execute(DisposeBrowserContextParams::new(context_id))
            .await
        {
            debug!("failed to dispose browser context: {e}");
        }
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn new_session(
        &self,
        options: SessionOptions,
        hook: Arc<dyn SubresourceHook>,
    ) -> Result<Box<dyn RenderSession>, RenderError> {
        let context_id = self
            .browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(|e| RenderError::Session(format!("browser context: {e}")))?
            .result
            .browser_context_id;

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(RenderError::Session)?;

        let page = match self.browser.new_page(target).await {
            Ok(page) => page,
            Err(e) => {
                self.dispose_context(context_id).await;
                return Err(RenderError::Session(format!("new page: {e}")));
            }
        };

        let state = Arc::new(InterceptState::new(options.follow_redirects));
        let tasks = match intercept(&page, Arc::clone(&state), hook).await {
            Ok(tasks) => tasks,
            Err(e) => {
                let _ = page.close().await;
                self.dispose_context(context_id).await;
                return Err(e);
            }
        };

        self.active_count.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(ChromiumSession {
            browser: Arc::clone(&self.browser),
            context_id,
            page: Some(page),
            state,
            tasks,
            options,
            active_count: Arc::clone(&self.active_count),
        }))
    }

    async fn shutdown(&self) -> Result<(), RenderError> {
        let result = self.browser.execute(CloseParams::default()).await;
        self.handler_task.abort();
        result
            .map(|_| ())
            .map_err(|e| RenderError::EngineUnavailable(format!("close failed: {e}")))
    }

    fn active_sessions(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

/// Top-level document response as seen by the interceptor.
#[derive(Debug, Clone)]
struct DocumentResponse {
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
}

/// Network requests seen by a page, keyed by DevTools request id.
///
/// Redirect hops reuse the id of the original request, so a start is
/// idempotent. An end that arrives before its start is remembered and the
/// late start ignored.
#[derive(Debug, Default)]
struct RequestTracker {
    pending: HashSet<String>,
    ended: HashSet<String>,
}

impl RequestTracker {
    fn start(&mut self, id: &str) {
        if !self.ended.contains(id) {
            self.pending.insert(id.to_string());
        }
    }

    fn end(&mut self, id: &str) {
        if !self.pending.remove(id) {
            self.ended.insert(id.to_string());
        }
    }
}

/// Shared between a session and its event listener tasks.
#[derive(Debug)]
struct InterceptState {
    follow_redirects: bool,
    main_frame: Mutex<Option<FrameId>>,
    document: Mutex<Option<DocumentResponse>>,
    requests: Mutex<RequestTracker>,
}

impl InterceptState {
    fn new(follow_redirects: bool) -> Self {
        Self {
            follow_redirects,
            main_frame: Mutex::new(None),
            document: Mutex::new(None),
            requests: Mutex::new(RequestTracker::default()),
        }
    }

    /// The first document request identifies the main frame.
    fn is_main_frame(&self, frame_id: &FrameId) -> bool {
        let Ok(mut guard) = self.main_frame.lock() else {
            return false;
        };
        match guard.as_ref() {
            Some(main) => main == frame_id,
            None => {
                *guard = Some(frame_id.clone());
                true
            }
        }
    }

    fn record_document(&self, response: DocumentResponse) {
        if let Ok(mut guard) = self.document.lock() {
            *guard = Some(response);
        }
    }

    fn document(&self) -> Option<DocumentResponse> {
        self.document.lock().ok().and_then(|guard| guard.clone())
    }

    fn request_started(&self, id: &str) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.start(id);
        }
    }

    fn request_ended(&self, id: &str) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.end(id);
        }
    }

    fn in_flight(&self) -> usize {
        self.requests
            .lock()
            .map(|requests| requests.pending.len())
            .unwrap_or(0)
    }
}

/// Enable interception on `page` and spawn the listener tasks.
async fn intercept(
    page: &Page,
    state: Arc<InterceptState>,
    hook: Arc<dyn SubresourceHook>,
) -> Result<Vec<JoinHandle<()>>, RenderError> {
    page.execute(fetch::EnableParams {
        patterns: Some(vec![
            RequestPattern {
                url_pattern: Some("*".to_string()),
                resource_type: None,
                request_stage: Some(RequestStage::Request),
            },
            RequestPattern {
                url_pattern: Some("*".to_string()),
                resource_type: Some(ResourceType::Document),
                request_stage: Some(RequestStage::Response),
            },
        ]),
        handle_auth_requests: Some(false),
    })
    .await
    .map_err(|e| RenderError::Session(format!("enable fetch interception: {e}")))?;

    page.execute(network::EnableParams::default())
        .await
        .map_err(|e| RenderError::Session(format!("enable network events: {e}")))?;

    let listen_err = |e: chromiumoxide::error::CdpError| {
        RenderError::Session(format!("subscribe to page events: {e}"))
    };
    let mut paused = page
        .event_listener::<EventRequestPaused>()
        .await
        .map_err(listen_err)?;
    let mut will_be_sent = page
        .event_listener::<network::EventRequestWillBeSent>()
        .await
        .map_err(listen_err)?;
    let mut finished = page
        .event_listener::<network::EventLoadingFinished>()
        .await
        .map_err(listen_err)?;
    let mut failed = page
        .event_listener::<network::EventLoadingFailed>()
        .await
        .map_err(listen_err)?;

    let mut tasks = Vec::with_capacity(2);

    let paused_page = page.clone();
    let paused_state = Arc::clone(&state);
    tasks.push(tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            on_request_paused(&paused_page, &paused_state, hook.as_ref(), &event).await;
        }
    }));

    // One task for all network events; starts are drained first so an end
    // never overtakes the start it belongs to.
    tasks.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                Some(event) = will_be_sent.next() => state.request_started(event.request_id.inner()),
                Some(event) = finished.next() => state.request_ended(event.request_id.inner()),
                Some(event) = failed.next() => state.request_ended(event.request_id.inner()),
                else => break,
            }
        }
    }));

    Ok(tasks)
}

async fn on_request_paused(
    page: &Page,
    state: &InterceptState,
    hook: &dyn SubresourceHook,
    event: &EventRequestPaused,
) {
    let is_document = matches!(event.resource_type, ResourceType::Document);
    let is_main_document = is_document && state.is_main_frame(&event.frame_id);

    // Response stage: only documents are paused here.
    if event.response_status_code.is_some() || event.response_error_reason.is_some() {
        if let (true, Some(code)) = (is_main_document, event.response_status_code) {
            let response = DocumentResponse {
                status: u16::try_from(code).unwrap_or(0),
                status_text: event.response_status_text.clone().unwrap_or_default(),
                headers: event
                    .response_headers
                    .as_ref()
                    .map(|headers| {
                        headers
                            .iter()
                            .map(|h| (h.name.clone(), h.value.clone()))
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            let hold = !state.follow_redirects && is_redirect(response.status);
            state.record_document(response.clone());
            if hold {
                debug!(url = %event.request.url, status = response.status, "holding redirect");
                hold_redirect(page, event, &response).await;
                return;
            }
        }
        continue_request(page, event).await;
        return;
    }

    if is_main_document {
        continue_request(page, event).await;
        return;
    }

    let request = SubresourceRequest {
        url: event.request.url.clone(),
        resource_type: resource_type_name(&event.resource_type),
    };
    match hook.on_request(&request) {
        FilterDecision::Allow => continue_request(page, event).await,
        FilterDecision::Skip(synthetic) => fulfill_synthetic(page, event, &synthetic).await,
    }
}

fn is_redirect(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

fn resource_type_name(resource_type: &ResourceType) -> String {
    format!("{resource_type:?}").to_ascii_lowercase()
}

async fn continue_request(page: &Page, event: &EventRequestPaused) {
    if let Err(e) = page
        .execute(ContinueRequestParams::new(event.request_id.clone()))
        .await
    {
        debug!(url = %event.request.url, "continue request failed: {e}");
    }
}

/// Answer a redirect in place so the engine stays on the requested URL.
async fn hold_redirect(page: &Page, event: &EventRequestPaused, response: &DocumentResponse) {
    let headers = response
        .headers
        .iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case("location")
                && !name.eq_ignore_ascii_case("content-length")
                && !name.eq_ignore_ascii_case("content-encoding")
        })
        .map(|(name, value)| HeaderEntry {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();

    let result = page
        .execute(FulfillRequestParams {
            request_id: event.request_id.clone(),
            response_code: i64::from(response.status),
            response_headers: Some(headers),
            binary_response_headers: None,
            body: None,
            response_phrase: (!response.status_text.is_empty())
                .then(|| response.status_text.clone()),
        })
        .await;
    if let Err(e) = result {
        debug!(url = %event.request.url, "holding redirect failed: {e}");
    }
}

async fn fulfill_synthetic(page: &Page, event: &EventRequestPaused, synthetic: &SyntheticResponse) {
    let result = page
        .execute(FulfillRequestParams {
            request_id: event.request_id.clone(),
            response_code: i64::from(synthetic.status),
            response_headers: Some(vec![HeaderEntry {
                name: "Content-Length".to_string(),
                value: "0".to_string(),
            }]),
            binary_response_headers: None,
            body: None,
            response_phrase: None,
        })
        .await;
    if let Err(e) = result {
        debug!(url = %synthetic.url, "synthetic response failed: {e}");
    }
}

/// A single isolated Chromium session.
pub struct ChromiumSession {
    browser: Arc<Browser>,
    context_id: BrowserContextId,
    page: Option<Page>,
    state: Arc<InterceptState>,
    tasks: Vec<JoinHandle<()>>,
    options: SessionOptions,
    active_count: Arc<AtomicUsize>,
}

impl ChromiumSession {
    fn page(&self) -> Result<&Page, RenderError> {
        self.page
            .as_ref()
            .ok_or_else(|| RenderError::Session("session already closed".to_string()))
    }

    /// Wait until no request has been in flight for [`NETWORK_IDLE`], or
    /// until `deadline`. Reaching the deadline still counts as settled.
    async fn wait_for_network_idle(&self, deadline: Instant) {
        let mut idle_since: Option<Instant> = None;
        loop {
            let now = Instant::now();
            if now >= deadline {
                debug!("settle deadline reached with requests in flight");
                return;
            }
            if self.state.in_flight() == 0 {
                let since = *idle_since.get_or_insert(now);
                if now.duration_since(since) >= NETWORK_IDLE {
                    return;
                }
            } else {
                idle_since = None;
            }
            sleep(IDLE_POLL).await;
        }
    }
}

#[async_trait]
impl RenderSession for ChromiumSession {
    async fn visit(&mut self, url: &str) -> Result<NavigationOutcome, RenderError> {
        let max_wait = self.options.max_wait;
        let deadline = Instant::now() + max_wait;

        match tokio::time::timeout_at(deadline, self.page()?.goto(url)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(RenderError::navigation(url, e.to_string())),
            Err(_) => {
                return Err(RenderError::Timeout {
                    url: url.to_string(),
                    after: max_wait,
                })
            }
        }

        self.wait_for_network_idle(deadline).await;

        let page = self.page()?;
        let final_url = page
            .url()
            .await
            .map_err(|e| RenderError::Content(format!("current URL: {e}")))?
            .unwrap_or_else(|| url.to_string());

        let html: String = page
            .evaluate(DOCUMENT_HTML_JS)
            .await
            .map_err(|e| RenderError::Content(format!("serialize document: {e}")))?
            .into_value()
            .map_err(|e| RenderError::Content(format!("serialize document: {e}")))?;

        let document = self.state.document().unwrap_or(DocumentResponse {
            status: 200,
            status_text: "OK".to_string(),
            headers: Vec::new(),
        });

        Ok(NavigationOutcome {
            status: document.status,
            status_text: document.status_text,
            final_url,
            headers: document.headers,
            html,
        })
    }

    async fn destroy(mut self: Box<Self>) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("failed to close page: {e}");
            }
        }
        if let Err(e) = self
            .browser
            .execute(DisposeBrowserContextParams::new(self.context_id.clone()))
            .await
        {
            debug!("failed to dispose browser context: {e}");
        }
        self.active_count.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ResourceCache, ResourceFilter, SkipList};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn filter() -> Arc<dyn SubresourceHook> {
        Arc::new(ResourceFilter::new(
            Arc::new(ResourceCache::new(Duration::from_secs(300))),
            Arc::new(SkipList::default()),
            &["js".to_string(), "css".to_string()],
        ))
    }

    #[test]
    fn test_redirect_statuses() {
        for status in [301, 302, 303, 307, 308] {
            assert!(is_redirect(status));
        }
        assert!(!is_redirect(200));
        assert!(!is_redirect(304));
    }

    #[test]
    fn test_in_flight_tracks_request_ids() {
        let state = InterceptState::new(false);
        state.request_started("1");
        state.request_started("2");
        assert_eq!(state.in_flight(), 2);
        state.request_ended("1");
        assert_eq!(state.in_flight(), 1);
        state.request_ended("2");
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn test_end_before_start_settles() {
        let state = InterceptState::new(false);
        state.request_ended("7");
        state.request_started("7");
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn test_redirect_hops_share_one_request() {
        let state = InterceptState::new(false);
        state.request_started("9");
        state.request_started("9");
        state.request_started("9");
        state.request_ended("9");
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn test_first_document_frame_is_main() {
        let state = InterceptState::new(false);
        let main = FrameId::new("main");
        let child = FrameId::new("child");
        assert!(state.is_main_frame(&main));
        assert!(!state.is_main_frame(&child));
        assert!(state.is_main_frame(&main));
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_renders_script_output_and_skips_trackers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<html><body><script src=\"/analytics.js\"></script>\
                 <script>document.body.insertAdjacentHTML('beforeend', '<p id=\"x\">rendered</p>')</script>\
                 </body></html>",
                "text/html",
            ))
            .mount(&server)
            .await;

        let renderer = ChromiumRenderer::launch(&EngineConfig::default())
            .await
            .expect("failed to launch Chromium");
        let mut session = renderer
            .new_session(SessionOptions::default(), filter())
            .await
            .expect("failed to create session");

        let outcome = session
            .visit(&format!("{}/page", server.uri()))
            .await
            .expect("visit failed");
        session.destroy().await;

        assert_eq!(outcome.status, 200);
        assert!(outcome.html.contains("<p id=\"x\">rendered</p>"));
        assert_eq!(outcome.header("content-type"), Some("text/html"));

        let requests = server.received_requests().await.unwrap_or_default();
        assert!(requests.iter().all(|r| r.url.path() != "/analytics.js"));
        assert_eq!(renderer.active_sessions(), 0);
        renderer.shutdown().await.expect("shutdown failed");
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_holds_redirects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
            .mount(&server)
            .await;

        let renderer = ChromiumRenderer::launch(&EngineConfig::default())
            .await
            .expect("failed to launch Chromium");
        let mut session = renderer
            .new_session(SessionOptions::default(), filter())
            .await
            .expect("failed to create session");

        let outcome = session
            .visit(&format!("{}/old", server.uri()))
            .await
            .expect("visit failed");
        session.destroy().await;

        assert_eq!(outcome.status, 301);
        assert_eq!(outcome.header("location"), Some("/new"));
        assert!(outcome.final_url.ends_with("/old"));
        renderer.shutdown().await.expect("shutdown failed");
    }
}
