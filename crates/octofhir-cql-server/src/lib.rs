//! HTTP front end for CQL to ELM translation.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod multipart;
pub mod observability;
pub mod server;
pub mod translate;

pub use config::{AppConfig, LoggingConfig, ServerConfig, TranslatorSettings};
pub use error::ApiError;
pub use observability::init_tracing;
pub use server::{AppState, CqlTranslationServer, ServerBuilder, build_app, build_app_with_state};
