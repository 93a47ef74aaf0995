//! The `/cql/translator` route.
//!
//! A `application/cql` body is translated as one unit into the
//! representation selected by `Accept`. A `multipart/form-data` body is a
//! batch: every part is a library that the others may include, and every
//! part is translated into each format listed in `X-TargetFormat`.

use axum::{
    body::Bytes,
    extract::{FromRequest, Multipart, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use octofhir_cql_translator::{
    CQL_TEXT_TYPE, OutputFormat, RequestParams, SourceUnit, TranslatorError, media_type_essence,
    translate_batch, translate_source,
};

use crate::error::ApiError;
use crate::multipart::MultipartResponse;
use crate::server::AppState;

pub const TARGET_FORMAT_HEADER: &str = "x-targetformat";

const MULTIPART_FORM_TYPE: &str = "multipart/form-data";

pub async fn translate(
    State(state): State<AppState>,
    Query(query): Query<Vec<(String, String)>>,
    request: Request,
) -> Result<Response, ApiError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let params: RequestParams = query.into_iter().collect();

    match media_type_essence(&content_type).as_str() {
        CQL_TEXT_TYPE => translate_single(state, params, request).await,
        MULTIPART_FORM_TYPE => translate_multipart(state, params, request).await,
        _ => Err(ApiError::UnsupportedContentType(if content_type.is_empty() {
            "none".to_string()
        } else {
            content_type
        })),
    }
}

async fn translate_single(
    state: AppState,
    params: RequestParams,
    request: Request,
) -> Result<Response, ApiError> {
    let format = negotiate_format(request.headers())?;
    let mut session = state.factory.create_session(&params)?;
    let body = Bytes::from_request(request, &state)
        .await
        .map_err(|_| TranslatorError::UnreadableRequest)?;

    let result = tokio::task::spawn_blocking(move || translate_source(&mut session, &body, format))
        .await
        .map_err(|e| TranslatorError::Internal(e.to_string()))??;

    let status = if result.is_success() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    let output = result
        .into_outputs()
        .into_iter()
        .next()
        .ok_or_else(|| TranslatorError::Internal("no output produced".to_string()))?;

    Ok((
        status,
        [(header::CONTENT_TYPE, output.format.media_type())],
        output.content,
    )
        .into_response())
}

async fn translate_multipart(
    state: AppState,
    params: RequestParams,
    request: Request,
) -> Result<Response, ApiError> {
    let requested = target_formats(request.headers())?;
    let mut session = state.factory.create_session(&params)?;
    let parts = read_parts(request, &state).await?;
    tracing::debug!(parts = parts.len(), "Read multipart request");

    let default_format = state.default_format;
    let results = tokio::task::spawn_blocking(move || {
        translate_batch(&mut session, &parts, &requested, default_format)
    })
    .await
    .map_err(|e| TranslatorError::Internal(e.to_string()))??;

    let mut response = MultipartResponse::new();
    for part in results {
        for output in part.result.into_outputs() {
            response.push(part.name.clone(), output.format.media_type(), output.content);
        }
    }
    Ok(response.into_response())
}

async fn read_parts(request: Request, state: &AppState) -> Result<Vec<SourceUnit>, ApiError> {
    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|_| TranslatorError::UnreadableRequest)?;

    let mut parts = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| TranslatorError::UnreadableRequest)?
    {
        let name = field.name().unwrap_or_default().to_string();
        let source = field
            .bytes()
            .await
            .map_err(|_| TranslatorError::UnreadableRequest)?;
        parts.push(SourceUnit::new(name, source.to_vec()));
    }
    Ok(parts)
}

/// Every `X-TargetFormat` value, in the order received.
fn target_formats(headers: &HeaderMap) -> Result<Vec<String>, ApiError> {
    headers
        .get_all(TARGET_FORMAT_HEADER)
        .iter()
        .map(|value| {
            value.to_str().map(str::to_string).map_err(|_| {
                ApiError::from(TranslatorError::UnsupportedFormat(
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                ))
            })
        })
        .collect()
}

/// Pick the ELM representation for a single-unit response.
///
/// No `Accept` header, `*/*` and `application/*` all select JSON. Among
/// acceptable entries the highest quality wins, earlier entries break ties.
pub fn negotiate_format(headers: &HeaderMap) -> Result<OutputFormat, ApiError> {
    let accept = headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join(",");
    if accept.trim().is_empty() {
        return Ok(OutputFormat::ElmJson);
    }

    let mut best: Option<(OutputFormat, f32)> = None;
    for entry in accept.split(',') {
        let Some(format) = accepted_format(entry) else {
            continue;
        };
        let quality = quality(entry);
        if quality > 0.0 && best.is_none_or(|(_, q)| quality > q) {
            best = Some((format, quality));
        }
    }

    best.map(|(format, _)| format)
        .ok_or_else(|| ApiError::NotAcceptable(accept.trim().to_string()))
}

fn accepted_format(entry: &str) -> Option<OutputFormat> {
    match media_type_essence(entry).as_str() {
        "*/*" | "application/*" => Some(OutputFormat::ElmJson),
        essence => essence.parse().ok(),
    }
}

fn quality(entry: &str) -> f32 {
    entry
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("q"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn accept(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_negotiate_defaults_to_json() {
        assert_eq!(negotiate_format(&HeaderMap::new()).unwrap(), OutputFormat::ElmJson);
        assert_eq!(negotiate_format(&accept("*/*")).unwrap(), OutputFormat::ElmJson);
        assert_eq!(negotiate_format(&accept("application/*")).unwrap(), OutputFormat::ElmJson);
    }

    #[test]
    fn test_negotiate_explicit_types() {
        assert_eq!(
            negotiate_format(&accept("application/elm+xml")).unwrap(),
            OutputFormat::ElmXml
        );
        assert_eq!(
            negotiate_format(&accept("text/html, application/elm+xml;q=0.5, */*;q=0.1")).unwrap(),
            OutputFormat::ElmXml
        );
        assert_eq!(
            negotiate_format(&accept("application/elm+xml;q=0.2, application/elm+json")).unwrap(),
            OutputFormat::ElmJson
        );
    }

    #[test]
    fn test_negotiate_rejects_other_types() {
        let err = negotiate_format(&accept("text/html")).unwrap_err();
        assert!(matches!(err, ApiError::NotAcceptable(ref v) if v == "text/html"));
        assert!(negotiate_format(&accept("application/elm+xml;q=0")).is_err());
    }

    #[test]
    fn test_target_formats_keeps_every_header() {
        let mut headers = HeaderMap::new();
        headers.append(TARGET_FORMAT_HEADER, HeaderValue::from_static("application/elm+xml"));
        headers.append(TARGET_FORMAT_HEADER, HeaderValue::from_static("application/elm+json"));
        assert_eq!(
            target_formats(&headers).unwrap(),
            vec!["application/elm+xml", "application/elm+json"]
        );
    }
}
