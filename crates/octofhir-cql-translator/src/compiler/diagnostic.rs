//! Compiler diagnostics.

use std::fmt;

use serde::Serialize;
use serde_json::{Value, json};

use crate::options::Severity;
use crate::source::VersionedIdentifier;

/// Phase of translation that produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Syntax,
    Semantic,
    Include,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Semantic => "semantic",
            Self::Include => "include",
        }
    }
}

/// Source range, 1-based lines and columns, end inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Locator {
    pub start_line: usize,
    pub start_char: usize,
    pub end_line: usize,
    pub end_char: usize,
}

impl Locator {
    pub fn new(start_line: usize, start_char: usize, end_line: usize, end_char: usize) -> Self {
        Self {
            start_line,
            start_char,
            end_line,
            end_char,
        }
    }

    /// Smallest range covering both.
    pub fn to(self, other: Locator) -> Locator {
        Locator {
            start_line: self.start_line,
            start_char: self.start_char,
            end_line: other.end_line,
            end_char: other.end_char,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.start_line, self.start_char, self.end_line, self.end_char
        )
    }
}

/// A message reported while compiling a library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CqlDiagnostic {
    pub message: String,
    pub severity: Severity,
    pub error_type: ErrorType,
    pub locator: Option<Locator>,
    pub library: Option<VersionedIdentifier>,
}

impl CqlDiagnostic {
    pub fn error(error_type: ErrorType, message: impl Into<String>, locator: Option<Locator>) -> Self {
        Self {
            message: message.into(),
            severity: Severity::Error,
            error_type,
            locator,
            library: None,
        }
    }

    pub fn warning(error_type: ErrorType, message: impl Into<String>, locator: Option<Locator>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(error_type, message, locator)
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// ELM `CqlToElmError` annotation for this diagnostic.
    pub fn to_annotation(&self) -> Value {
        let mut annotation = serde_json::Map::new();
        if let Some(library) = &self.library {
            annotation.insert("libraryId".into(), json!(library.id));
            if let Some(version) = &library.version {
                annotation.insert("libraryVersion".into(), json!(version));
            }
        }
        if let Some(locator) = self.locator {
            annotation.insert("startLine".into(), json!(locator.start_line));
            annotation.insert("startChar".into(), json!(locator.start_char));
            annotation.insert("endLine".into(), json!(locator.end_line));
            annotation.insert("endChar".into(), json!(locator.end_char));
        }
        annotation.insert("message".into(), json!(self.message));
        annotation.insert("errorType".into(), json!(self.error_type.as_str()));
        annotation.insert("errorSeverity".into(), json!(self.severity.as_str()));
        annotation.insert("type".into(), json!("CqlToElmError"));
        Value::Object(annotation)
    }
}

impl fmt::Display for CqlDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.locator {
            Some(locator) => write!(f, "[{}] {}: {}", locator, self.severity, self.message),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}
