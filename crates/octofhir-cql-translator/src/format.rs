//! Output representations and media type handling.

use std::fmt;
use std::str::FromStr;

use crate::error::{TranslatorError, TranslatorResult};

pub const CQL_TEXT_TYPE: &str = "application/cql";
pub const ELM_XML_TYPE: &str = "application/elm+xml";
pub const ELM_JSON_TYPE: &str = "application/elm+json";

/// Serialized representation of a compiled library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    ElmXml,
    ElmJson,
}

impl OutputFormat {
    pub fn media_type(&self) -> &'static str {
        match self {
            Self::ElmXml => ELM_XML_TYPE,
            Self::ElmJson => ELM_JSON_TYPE,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.media_type())
    }
}

impl FromStr for OutputFormat {
    type Err = TranslatorError;

    /// Parses a media type, ignoring parameters and case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let essence = media_type_essence(s);
        if essence == ELM_XML_TYPE {
            Ok(Self::ElmXml)
        } else if essence == ELM_JSON_TYPE {
            Ok(Self::ElmJson)
        } else {
            Err(TranslatorError::UnsupportedFormat(s.trim().to_string()))
        }
    }
}

/// `type/subtype` of a media type, lowercased and without parameters.
pub fn media_type_essence(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Expand and validate requested target formats.
///
/// Every value is split on commas, since transports fold repeated headers
/// into one comma-joined value inconsistently. Empty tokens are dropped.
/// The first unsupported token fails the whole list. An empty result falls
/// back to `default`.
pub fn normalize_target_formats<I, S>(values: I, default: OutputFormat) -> TranslatorResult<Vec<OutputFormat>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut formats = Vec::new();
    for value in values {
        for token in value.as_ref().split(',') {
            if token.trim().is_empty() {
                continue;
            }
            formats.push(token.parse()?);
        }
    }

    if formats.is_empty() {
        formats.push(default);
    }
    Ok(formats)
}
