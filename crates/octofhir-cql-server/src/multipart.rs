//! `multipart/form-data` response bodies.

use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use uuid::Uuid;

/// One named part of a multipart response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub content_type: &'static str,
    pub body: String,
}

/// A `multipart/form-data` body with a random boundary.
#[derive(Debug, Clone)]
pub struct MultipartResponse {
    boundary: String,
    parts: Vec<FormPart>,
}

impl MultipartResponse {
    pub fn new() -> Self {
        Self {
            boundary: format!("octofhir-{}", Uuid::new_v4().simple()),
            parts: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, content_type: &'static str, body: String) {
        self.parts.push(FormPart {
            name: name.into(),
            content_type,
            body,
        });
    }

    pub fn parts(&self) -> &[FormPart] {
        &self.parts
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn encode(&self) -> String {
        let capacity = self.parts.iter().map(|p| p.body.len() + 128).sum::<usize>();
        let mut out = String::with_capacity(capacity);
        for part in &self.parts {
            out.push_str("--");
            out.push_str(&self.boundary);
            out.push_str("\r\n");
            out.push_str(&format!(
                "Content-Disposition: form-data; name=\"{}\"\r\n",
                escape_field_name(&part.name)
            ));
            out.push_str(&format!("Content-Type: {}\r\n\r\n", part.content_type));
            out.push_str(&part.body);
            out.push_str("\r\n");
        }
        out.push_str("--");
        out.push_str(&self.boundary);
        out.push_str("--\r\n");
        out
    }
}

impl Default for MultipartResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl IntoResponse for MultipartResponse {
    fn into_response(self) -> Response {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, self.content_type())],
            self.encode(),
        )
            .into_response()
    }
}

/// Percent-encode the characters a quoted field name cannot carry.
fn escape_field_name(name: &str) -> String {
    name.replace('"', "%22")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let mut response = MultipartResponse::new();
        response.push("main", "application/elm+json", "{}".to_string());
        response.push("main", "application/elm+xml", "<library/>".to_string());

        let boundary = response.boundary.clone();
        assert_eq!(
            response.content_type(),
            format!("multipart/form-data; boundary={boundary}")
        );
        assert_eq!(
            response.encode(),
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"main\"\r\nContent-Type: application/elm+json\r\n\r\n{{}}\r\n\
                 --{boundary}\r\nContent-Disposition: form-data; name=\"main\"\r\nContent-Type: application/elm+xml\r\n\r\n<library/>\r\n\
                 --{boundary}--\r\n"
            )
        );
    }

    #[test]
    fn test_field_names_are_escaped() {
        assert_eq!(escape_field_name("a\"b\r\nc"), "a%22b%0D%0Ac");
    }

    #[test]
    fn test_boundaries_differ() {
        assert_ne!(MultipartResponse::new().boundary, MultipartResponse::new().boundary);
    }
}
