//! Start the rendering proxy.

use crate::config::{LogFormat, ServerConfig};
use crate::maintenance;
use crate::renderer::chromium::ChromiumRenderer;
use crate::renderer::{NoopRenderer, Renderer};
use crate::server::{self, AppState};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber. `RUST_LOG` wins over the default.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("prerender_runtime=info,prerender=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = result {
        eprintln!("  tracing already initialized: {e}");
    }
}

/// Launch the browser, bind the listener, and serve until Ctrl-C.
pub async fn run(config: ServerConfig) -> Result<()> {
    init_tracing(config.log_format);

    info!("starting Prerender v{}", env!("CARGO_PKG_VERSION"));
    if let Ok(json) = serde_json::to_string(&config) {
        info!("configuration: {json}");
    }
    if config.api_key.is_some() {
        info!("Api-Key check enabled");
    }

    // Initialize browser renderer
    let renderer: Arc<dyn Renderer> = match ChromiumRenderer::launch(&config.engine()).await {
        Ok(renderer) => {
            info!("Chromium renderer initialized");
            Arc::new(renderer)
        }
        Err(e) => {
            warn!("Failed to initialize Chromium: {e:#}");
            warn!("Every render will fail with 500 until Chromium is available");
            Arc::new(NoopRenderer::new(format!("{e:#}")))
        }
    };

    let state = Arc::new(AppState::new(&config, Arc::clone(&renderer)));

    let shutdown = Arc::new(Notify::new());
    let maintenance = maintenance::spawn(
        Arc::clone(state.cache()),
        maintenance::DEFAULT_TICK,
        Arc::clone(&shutdown),
    );

    info!("Starting server at {}", config.listen);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("Server started at {}", config.listen);

    let result = server::serve(listener, state, async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received shutdown signal"),
            Err(e) => {
                warn!("failed to listen for Ctrl-C, serving until killed: {e}");
                std::future::pending::<()>().await;
            }
        }
    })
    .await;

    // Stop maintenance once in-flight requests have drained
    shutdown.notify_one();
    if let Err(e) = maintenance.await {
        warn!("maintenance loop ended abnormally: {e}");
    }

    if let Err(e) = renderer.shutdown().await {
        warn!("browser shutdown failed: {e}");
    }
    info!("server stopped");

    result
}
