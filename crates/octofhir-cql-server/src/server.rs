use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use octofhir_cql_translator::{CqlCompiler, ElmTranslator, OutputFormat, SessionFactory};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{config::AppConfig, handlers, middleware as app_middleware, translate};

/// Shared router state. Everything in it is immutable.
#[derive(Clone, Debug)]
pub struct AppState {
    pub factory: SessionFactory,
    pub default_format: OutputFormat,
}

impl AppState {
    pub fn new(compiler: Arc<dyn CqlCompiler>, default_format: OutputFormat) -> Self {
        Self {
            factory: SessionFactory::new(compiler),
            default_format,
        }
    }
}

pub struct CqlTranslationServer {
    addr: SocketAddr,
    app: Router,
}

/// Router with the built-in ELM translator.
pub fn build_app(cfg: &AppConfig) -> Result<Router, String> {
    let default_format = cfg.translator.default_format()?;
    let state = AppState::new(Arc::new(ElmTranslator), default_format);
    Ok(build_app_with_state(cfg, state))
}

pub fn build_app_with_state(cfg: &AppConfig, state: AppState) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    Router::new()
        // Health and info endpoints
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/cql/translator", post(translate::translate))
        .with_state(state)
        // Innermost first: body limit -> trace -> cors -> request id
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                        span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(app_middleware::request_id))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    pub fn build(self) -> anyhow::Result<CqlTranslationServer> {
        let app = build_app(&self.config).map_err(anyhow::Error::msg)?;

        Ok(CqlTranslationServer {
            addr: self.addr,
            app,
        })
    }
}

impl CqlTranslationServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
