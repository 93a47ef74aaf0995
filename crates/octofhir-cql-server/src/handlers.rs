use axum::{Json, http::StatusCode, response::IntoResponse};
use octofhir_cql_translator::{ELM_JSON_TYPE, ELM_XML_TYPE};
use serde::Serialize;
use serde_json::json;

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn root() -> impl IntoResponse {
    let body = json!({
        "service": "OctoFHIR CQL Translator",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "formats": [ELM_XML_TYPE, ELM_JSON_TYPE],
    });
    (StatusCode::OK, Json(body))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

// Sessions are built per request, so there is nothing to warm up.
pub async fn readyz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ready" }))
}
