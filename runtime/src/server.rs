// Copyright 2026 Prerender Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP front end of the rendering proxy.
//!
//! Every path is a render request: the path is resolved against the
//! caller's `Base-Url`, rendered in a fresh browser session, and the
//! settled page is translated into the response. Each render runs in its
//! own task, so the session is destroyed even when the caller hangs up
//! before the page settles.

use crate::config::ServerConfig;
use crate::error::{RenderError, ValidationError};
use crate::outcome;
use crate::renderer::{
    FilterDecision, NavigationOutcome, RenderSession, Renderer, SessionOptions, SubresourceHook,
};
use crate::request::RenderRequest;
use crate::resources::{ResourceCache, ResourceFilter, SkipList};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, info, info_span, Instrument};
use url::Url;

/// Extra time past the session's max wait before the handler gives up.
/// Covers reading the DOM after the settle deadline.
const SETTLE_GRACE: Duration = Duration::from_secs(5);

/// State shared by every request handler.
pub struct AppState {
    renderer: Arc<dyn Renderer>,
    hook: Arc<dyn SubresourceHook>,
    cache: Arc<ResourceCache<FilterDecision>>,
    api_key: Option<String>,
    options: SessionOptions,
}

impl AppState {
    /// Build the shared state: one resource cache and one filter for the
    /// whole process, attached to every session `renderer` creates.
    pub fn new(config: &ServerConfig, renderer: Arc<dyn Renderer>) -> Self {
        let cache = Arc::new(ResourceCache::new(config.cache_ttl));
        let filter = ResourceFilter::new(
            Arc::clone(&cache),
            Arc::new(SkipList::new(config.skip_list.iter().cloned())),
            &config.cache_extensions,
        );
        Self {
            renderer,
            hook: Arc::new(filter),
            cache,
            api_key: config.api_key.clone(),
            options: SessionOptions {
                follow_redirects: false,
                max_wait: config.max_wait,
            },
        }
    }

    pub fn cache(&self) -> &Arc<ResourceCache<FilterDecision>> {
        &self.cache
    }
}

/// Build the axum Router. Every method and path reaches the render handler.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(handle_render)
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

/// Serve on `listener` until `shutdown` resolves, then drain in-flight requests.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn handle_render(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let request =
        match RenderRequest::from_parts(&method, &uri, &headers, state.api_key.as_deref()) {
            Ok(request) => request,
            Err(e) => {
                debug!(%method, %uri, "rejected: {e}");
                return validation_response(&e);
            }
        };

    let span = info_span!("render", id = %uuid::Uuid::new_v4());
    // Detached from the connection: dropping this handler must not drop the
    // session before `destroy` runs.
    match tokio::spawn(render(state, request).instrument(span)).await {
        Ok(response) => response,
        Err(e) if e.is_panic() => panic_response(e.into_panic()),
        Err(e) => {
            error!("render task failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "render task failed").into_response()
        }
    }
}

/// Drive one session for `request` and translate the settled page.
async fn render(state: Arc<AppState>, request: RenderRequest) -> Response {
    let start = Instant::now();
    let url = request.target;
    info!(method = %request.method, url = %url, "{} {}", request.method, url);

    let mut session = match state
        .renderer
        .new_session(state.options, Arc::clone(&state.hook))
        .await
    {
        Ok(session) => session,
        Err(e) => return render_failed(&url, start, &e),
    };

    let result = visit(session.as_mut(), &url, state.options.max_wait + SETTLE_GRACE).await;
    session.destroy().await;

    match result {
        Ok(settled) => {
            let translation = outcome::translate(&url, settled);
            let status = translation.status();
            let elapsed_ms = start.elapsed().as_millis() as u64;
            info!(status, url = %url, elapsed_ms, "{status} {url}, elapsed {elapsed_ms}ms");
            translation.into_response()
        }
        Err(e) => render_failed(&url, start, &e),
    }
}

/// Visit and settle, bounded by `limit`. A panic inside the engine adapter
/// becomes a [`RenderError`] so the caller still owns the session.
async fn visit(
    session: &mut dyn RenderSession,
    url: &Url,
    limit: Duration,
) -> Result<NavigationOutcome, RenderError> {
    let visit = AssertUnwindSafe(session.visit(url.as_str())).catch_unwind();
    match tokio::time::timeout(limit, visit).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(RenderError::Panicked(panic_message(panic.as_ref()))),
        Err(_) => Err(RenderError::Timeout {
            url: url.to_string(),
            after: limit,
        }),
    }
}

fn render_failed(url: &Url, start: Instant, e: &RenderError) -> Response {
    let elapsed_ms = start.elapsed().as_millis() as u64;
    error!(url = %url, elapsed_ms, error = %e, "ERROR {url}, elapsed {elapsed_ms}ms");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        e.report(),
    )
        .into_response()
}

/// Short plain-text rejection; the message doubles as the reason phrase.
fn validation_response(e: &ValidationError) -> Response {
    let message = e.to_string();
    let mut response = (
        e.status(),
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        message.clone(),
    )
        .into_response();
    if let Ok(phrase) = hyper::ext::ReasonPhrase::try_from(message.into_bytes()) {
        response.extensions_mut().insert(phrase);
    }
    if *e == ValidationError::MethodNotAllowed {
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("GET"));
    }
    response
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = panic_message(panic.as_ref());
    error!("handler panicked: {message}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("internal error: {message}"),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn test_validation_response() {
        let response = validation_response(&ValidationError::StaticResource);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert!(response
            .extensions()
            .get::<hyper::ext::ReasonPhrase>()
            .is_some());
        assert!(response.headers().get(header::ALLOW).is_none());
    }

    #[test]
    fn test_method_not_allowed_lists_get() {
        let response = validation_response(&ValidationError::MethodNotAllowed);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET");
    }
}
