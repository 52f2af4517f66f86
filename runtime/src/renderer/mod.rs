//! Renderer abstraction for browser-based page rendering.
//!
//! Defines the `Renderer` and `RenderSession` traits that abstract over
//! the browser engine (currently Chromium via chromiumoxide), plus the
//! sub-resource interception hook every session calls before a page asset
//! is fetched.

pub mod chromium;

use crate::error::RenderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Settled state of a page after "visit and settle".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationOutcome {
    /// HTTP status of the top-level document response.
    pub status: u16,
    /// Status text sent with that response.
    pub status_text: String,
    /// The URL the page ended up on, including client-side navigation.
    pub final_url: String,
    /// Headers of the top-level document response, in received order.
    pub headers: Vec<(String, String)>,
    /// Serialized DOM after scripts ran.
    pub html: String,
}

impl NavigationOutcome {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Options fixed at session creation.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Let the engine follow HTTP redirects of the top-level document.
    pub follow_redirects: bool,
    /// Upper bound for navigation plus settling.
    pub max_wait: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            follow_redirects: false,
            max_wait: Duration::from_secs(30),
        }
    }
}

/// A request issued by a page while it renders.
#[derive(Debug, Clone)]
pub struct SubresourceRequest {
    pub url: String,
    /// Engine resource type (`script`, `stylesheet`, `xhr`, ...), lower-case.
    pub resource_type: String,
}

/// Empty response served in place of a skipped sub-resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticResponse {
    pub url: String,
    pub status: u16,
}

impl SyntheticResponse {
    pub fn not_found(url: &str) -> Self {
        Self {
            url: url.to_string(),
            status: 404,
        }
    }
}

/// What happens to an intercepted sub-resource request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterDecision {
    /// Let the fetch proceed normally.
    Allow,
    /// Answer with the synthetic response; the network is never hit.
    Skip(SyntheticResponse),
}

impl FilterDecision {
    pub fn is_skip(&self) -> bool {
        matches!(self, FilterDecision::Skip(_))
    }
}

/// Interception hook invoked once per sub-resource fetch attempt, before
/// the fetch proceeds.
pub trait SubresourceHook: Send + Sync {
    fn on_request(&self, request: &SubresourceRequest) -> FilterDecision;
}

/// A browser engine that can create isolated rendering sessions.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Create a new isolated session with `hook` intercepting sub-resources.
    async fn new_session(
        &self,
        options: SessionOptions,
        hook: Arc<dyn SubresourceHook>,
    ) -> Result<Box<dyn RenderSession>, RenderError>;
    /// Shut down the browser engine.
    async fn shutdown(&self) -> Result<(), RenderError>;
    /// Number of currently open sessions.
    fn active_sessions(&self) -> usize;
}

/// A single browser session, owned by exactly one inbound request.
#[async_trait]
pub trait RenderSession: Send {
    /// Load `url`, let scripts run until the page settles, and return its state.
    async fn visit(&mut self, url: &str) -> Result<NavigationOutcome, RenderError>;
    /// Release every engine resource held by this session.
    async fn destroy(self: Box<Self>);
}

/// Renderer used when Chromium could not be launched. Every session fails.
pub struct NoopRenderer {
    reason: String,
}

impl NoopRenderer {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Renderer for NoopRenderer {
    async fn new_session(
        &self,
        _options: SessionOptions,
        _hook: Arc<dyn SubresourceHook>,
    ) -> Result<Box<dyn RenderSession>, RenderError> {
        Err(RenderError::EngineUnavailable(self.reason.clone()))
    }
    async fn shutdown(&self) -> Result<(), RenderError> {
        Ok(())
    }
    fn active_sessions(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_ignores_case() {
        let outcome = NavigationOutcome {
            status: 200,
            status_text: "OK".into(),
            final_url: "http://site.test/".into(),
            headers: vec![("content-type".into(), "text/html; charset=utf-8".into())],
            html: String::new(),
        };
        assert_eq!(
            outcome.header("Content-Type"),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(outcome.header("Location"), None);
    }

    #[tokio::test]
    async fn test_noop_renderer_refuses_sessions() {
        struct AllowAll;
        impl SubresourceHook for AllowAll {
            fn on_request(&self, _: &SubresourceRequest) -> FilterDecision {
                FilterDecision::Allow
            }
        }

        let renderer = NoopRenderer::new("Chromium not found");
        let result = renderer
            .new_session(SessionOptions::default(), Arc::new(AllowAll))
            .await;
        assert!(matches!(result, Err(RenderError::EngineUnavailable(_))));
        assert_eq!(renderer.active_sessions(), 0);
    }
}
