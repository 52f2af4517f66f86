//! Sub-resource filtering.
//!
//! Every request a page issues while rendering (scripts, stylesheets,
//! images, XHR) passes through [`ResourceFilter::decide`]. Requests whose
//! URL contains a skip-list substring are answered with a synthetic 404 and
//! never reach the network. Decisions for static assets are memoized in the
//! shared [`ResourceCache`].

use super::cache::ResourceCache;
use crate::renderer::{FilterDecision, SubresourceHook, SubresourceRequest, SyntheticResponse};
use std::sync::Arc;
use tracing::{debug, trace};
use url::Url;

/// Substrings of tracking/monitoring hosts that never need to load during a render.
pub const DEFAULT_SKIP_LIST: &[&str] = &[
    "analytics",
    "mc.yandex.ru",
    "raygun",
    "pingdom",
    "statuscake",
];

/// Extensions (lower-case, without the dot) whose decisions are cached.
pub const DEFAULT_CACHED_EXTENSIONS: &[&str] = &["js", "css"];

/// A rule deciding whether a sub-resource URL should be skipped.
pub trait SkipRule: Send + Sync {
    /// Whether the URL must be answered with a synthetic 404.
    fn matches(&self, url: &str) -> bool;
}

/// Substring skip-list.
#[derive(Debug, Clone)]
pub struct SkipList {
    patterns: Vec<String>,
}

impl SkipList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new(DEFAULT_SKIP_LIST.iter().copied())
    }
}

impl SkipRule for SkipList {
    fn matches(&self, url: &str) -> bool {
        self.patterns.iter().any(|p| url.contains(p.as_str()))
    }
}

/// The interception hook attached to every render session.
pub struct ResourceFilter {
    cache: Arc<ResourceCache<FilterDecision>>,
    skip: Arc<dyn SkipRule>,
    cached_extensions: Vec<String>,
}

impl ResourceFilter {
    /// Create a filter over the shared cache.
    ///
    /// `cached_extensions` are compared case-insensitively and may be given
    /// with or without a leading dot.
    pub fn new(
        cache: Arc<ResourceCache<FilterDecision>>,
        skip: Arc<dyn SkipRule>,
        cached_extensions: &[String],
    ) -> Self {
        Self {
            cache,
            skip,
            cached_extensions: cached_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// Decide whether a sub-resource may be fetched.
    pub fn decide(&self, url: &str) -> FilterDecision {
        if let Some(cached) = self.cache.get(url) {
            trace!(url, "sub-resource decision from cache");
            return cached;
        }

        let decision = if self.skip.matches(url) {
            trace!(url, "sub-resource skipped");
            FilterDecision::Skip(SyntheticResponse::not_found(url))
        } else {
            trace!(url, "sub-resource allowed");
            FilterDecision::Allow
        };

        if self.is_cacheable(url) {
            self.cache.set(url, decision.clone());
        }

        decision
    }

    fn is_cacheable(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        match path_extension(parsed.path()) {
            Some(ext) => self
                .cached_extensions
                .iter()
                .any(|c| c.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

impl SubresourceHook for ResourceFilter {
    fn on_request(&self, request: &SubresourceRequest) -> FilterDecision {
        let decision = self.decide(&request.url);
        if decision.is_skip() {
            debug!(
                url = %request.url,
                resource_type = %request.resource_type,
                "answered sub-resource with a synthetic 404"
            );
        }
        decision
    }
}

/// Extension of the last segment of a URL path, without the dot.
///
/// Names that start with a dot (`.htaccess`) have no extension; a trailing
/// dot (`file.`) yields an empty one.
pub fn path_extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(&name[idx + 1..]),
    }
}
