//! Translation of a settled browser session into the HTTP response the
//! caller receives.
//!
//! Decision order:
//!
//! 1. the document answered with a redirect → pass it through;
//! 2. the page navigated elsewhere on the client → synthetic 302;
//! 3. otherwise → the rendered markup with the page's own status.

use crate::renderer::NavigationOutcome;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use url::Url;

/// What the proxy answers for a settled render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translation {
    /// The document itself answered with a 3xx.
    Redirect {
        status: u16,
        reason: String,
        location: Option<String>,
    },
    /// Script moved the page to another URL after load.
    LocationChange { location: String },
    /// The rendered page.
    Render {
        status: u16,
        reason: String,
        content_type: Option<String>,
        body: String,
    },
}

impl Translation {
    /// HTTP status code written for this translation.
    pub fn status(&self) -> u16 {
        match self {
            Translation::Redirect { status, .. } | Translation::Render { status, .. } => *status,
            Translation::LocationChange { .. } => 302,
        }
    }

    /// Build the complete response. Headers that cannot be represented are dropped.
    pub fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = Response::builder().status(status);
        let body = match self {
            Translation::Redirect {
                reason, location, ..
            } => {
                builder = with_reason(builder, &reason);
                if let Some(value) = location.as_deref().and_then(header_value) {
                    builder = builder.header(header::LOCATION, value);
                }
                Body::empty()
            }
            Translation::LocationChange { location } => {
                if let Some(value) = header_value(&location) {
                    builder = builder.header(header::LOCATION, value);
                }
                Body::empty()
            }
            Translation::Render {
                reason,
                content_type,
                body,
                ..
            } => {
                builder = with_reason(builder, &reason);
                if let Some(value) = content_type.as_deref().and_then(header_value) {
                    builder = builder.header(header::CONTENT_TYPE, value);
                }
                Body::from(body)
            }
        };
        builder
            .body(body)
            .unwrap_or_else(|_| Response::new(Body::empty()))
    }
}

/// Decide the response for `outcome`, rendered for `requested`.
pub fn translate(requested: &Url, outcome: NavigationOutcome) -> Translation {
    if matches!(outcome.status, 301 | 302 | 303 | 307 | 308) {
        return Translation::Redirect {
            status: outcome.status,
            location: outcome.header("location").map(str::to_string),
            reason: outcome.status_text,
        };
    }

    if comparison_key(&outcome.final_url) != comparison_key(requested.as_str()) {
        return Translation::LocationChange {
            location: relative_location(requested, &outcome.final_url),
        };
    }

    Translation::Render {
        status: outcome.status,
        content_type: outcome.header("content-type").map(str::to_string),
        reason: outcome.status_text,
        body: outcome.html,
    }
}

/// Host + path key of a URL: the full href with its query string removed.
///
/// The fragment is kept. Strings that do not parse as URLs are compared as
/// given, minus anything from `?` up to a `#`.
pub fn comparison_key(href: &str) -> String {
    match Url::parse(href) {
        Ok(mut url) => {
            url.set_query(None);
            url.into()
        }
        Err(_) => {
            let (before_fragment, fragment) = match href.find('#') {
                Some(idx) => href.split_at(idx),
                None => (href, ""),
            };
            let base = before_fragment
                .split_once('?')
                .map_or(before_fragment, |(base, _)| base);
            format!("{base}{fragment}")
        }
    }
}

/// `final_url` made relative to the origin of `requested` when it lives there.
fn relative_location(requested: &Url, final_url: &str) -> String {
    let origin = requested.origin().ascii_serialization();
    match final_url.strip_prefix(origin.as_str()) {
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => final_url.to_string(),
    }
}

fn header_value(value: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(value).ok()
}

/// Mirror the upstream status text as the HTTP/1 reason phrase.
fn with_reason(builder: axum::http::response::Builder, reason: &str) -> axum::http::response::Builder {
    if reason.is_empty() {
        return builder;
    }
    match hyper::ext::ReasonPhrase::try_from(reason.as_bytes().to_vec()) {
        Ok(phrase) => builder.extension(phrase),
        Err(_) => builder,
    }
}
