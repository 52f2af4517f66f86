//! Error types for request validation and rendering.

use axum::http::StatusCode;
use std::time::Duration;

/// A request rejected before any browser session is created.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Method not supported")]
    MethodNotAllowed,

    #[error("Invalid Api-Key")]
    InvalidApiKey,

    #[error("Base-Url is not specified")]
    MissingBaseUrl,

    #[error("Base-Url is not a valid absolute URL")]
    InvalidBaseUrl,

    #[error("Request path must stay on the Base-Url origin")]
    OriginMismatch,

    #[error("Static resources not allowed")]
    StaticResource,
}

impl ValidationError {
    pub fn status(&self) -> StatusCode {
        match self {
            ValidationError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ValidationError::InvalidApiKey
            | ValidationError::MissingBaseUrl
            | ValidationError::InvalidBaseUrl
            | ValidationError::OriginMismatch => StatusCode::BAD_REQUEST,
            ValidationError::StaticResource => StatusCode::FORBIDDEN,
        }
    }
}

/// A failure while driving the browser engine. Always surfaces as a 500.
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("browser engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("failed to create browser session: {0}")]
    Session(String),

    #[error("navigation to {url} failed")]
    Navigation {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("render of {url} timed out after {}ms", .after.as_millis())]
    Timeout { url: String, after: Duration },

    #[error("failed to read rendered page: {0}")]
    Content(String),

    #[error("render task panicked: {0}")]
    Panicked(String),
}

impl RenderError {
    pub fn navigation(
        url: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        RenderError::Navigation {
            url: url.into(),
            source: source.into(),
        }
    }

    /// The error message followed by its cause chain, one cause per line.
    pub fn report(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\n    caused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}
