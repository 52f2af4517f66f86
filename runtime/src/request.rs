//! Inbound request validation and target URL resolution.

use crate::error::ValidationError;
use axum::http::{HeaderMap, Method, Uri};
use url::Url;

/// Header carrying the absolute URL request paths are resolved against.
pub const BASE_URL_HEADER: &str = "base-url";

/// Header carrying the shared secret when one is configured.
pub const API_KEY_HEADER: &str = "api-key";

/// A validated request, ready to be rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub method: Method,
    pub target: Url,
}

impl RenderRequest {
    /// Validate an inbound request. Checks run in a fixed order so the
    /// cheapest rejection wins: method, API key, `Base-Url`, static path.
    pub fn from_parts(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        api_key: Option<&str>,
    ) -> Result<Self, ValidationError> {
        if method != Method::GET {
            return Err(ValidationError::MethodNotAllowed);
        }

        if let Some(expected) = api_key {
            let given = headers
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok());
            if given != Some(expected) {
                return Err(ValidationError::InvalidApiKey);
            }
        }

        let base = match headers.get(BASE_URL_HEADER) {
            None => return Err(ValidationError::MissingBaseUrl),
            Some(v) if v.is_empty() => return Err(ValidationError::MissingBaseUrl),
            Some(v) => v.to_str().map_err(|_| ValidationError::InvalidBaseUrl)?,
        };

        let target = resolve_target(base.trim(), uri)?;
        if has_extension(&target) {
            return Err(ValidationError::StaticResource);
        }

        Ok(Self {
            method: method.clone(),
            target,
        })
    }
}

/// Resolve the request path and query against `base`.
///
/// Absolute paths replace the base path; the origin always stays the base's.
pub fn resolve_target(base: &str, uri: &Uri) -> Result<Url, ValidationError> {
    let base = Url::parse(base).map_err(|_| ValidationError::InvalidBaseUrl)?;
    if !matches!(base.scheme(), "http" | "https") || base.host().is_none() {
        return Err(ValidationError::InvalidBaseUrl);
    }

    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let target = base
        .join(path)
        .map_err(|_| ValidationError::OriginMismatch)?;
    if target.origin() != base.origin() {
        return Err(ValidationError::OriginMismatch);
    }
    Ok(target)
}

/// Whether the last path segment looks like a file name (`app.js`, `robots.txt`).
pub fn has_extension(url: &Url) -> bool {
    url.path()
        .rsplit('/')
        .next()
        .is_some_and(|segment| segment.contains('.'))
}
