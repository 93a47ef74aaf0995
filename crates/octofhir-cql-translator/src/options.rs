//! Compiler options and their resolution from request parameters.
//!
//! Every translation request carries its compiler configuration as URL query
//! parameters. Recognized keys are boolean toggles (`annotations=true`) or
//! composite toggles (`strict=true`, `debug=true`) that expand to several
//! options at once. The `signatures` key selects a [`SignatureLevel`].
//! Anything else is ignored.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{TranslatorError, TranslatorResult};

/// Query parameter selecting the signature level.
pub const SIGNATURES_PARAM: &str = "signatures";

/// Individual compiler feature toggles.
///
/// Declaration order is the canonical order used when options are listed in
/// translated output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CompilerOption {
    EnableDateRangeOptimization,
    EnableAnnotations,
    EnableLocators,
    EnableResultTypes,
    EnableDetailedErrors,
    DisableListTraversal,
    DisableListDemotion,
    DisableListPromotion,
    EnableIntervalDemotion,
    EnableIntervalPromotion,
    DisableMethodInvocation,
    RequireFromKeyword,
}

impl CompilerOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnableDateRangeOptimization => "EnableDateRangeOptimization",
            Self::EnableAnnotations => "EnableAnnotations",
            Self::EnableLocators => "EnableLocators",
            Self::EnableResultTypes => "EnableResultTypes",
            Self::EnableDetailedErrors => "EnableDetailedErrors",
            Self::DisableListTraversal => "DisableListTraversal",
            Self::DisableListDemotion => "DisableListDemotion",
            Self::DisableListPromotion => "DisableListPromotion",
            Self::EnableIntervalDemotion => "EnableIntervalDemotion",
            Self::EnableIntervalPromotion => "EnableIntervalPromotion",
            Self::DisableMethodInvocation => "DisableMethodInvocation",
            Self::RequireFromKeyword => "RequireFromKeyword",
        }
    }
}

impl fmt::Display for CompilerOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much operator signature detail the compiler emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignatureLevel {
    /// No signatures
    #[default]
    None,
    /// Signatures only where argument types differ from the declared operand types
    Differing,
    /// Signatures only for calls to overloaded functions
    Overloads,
    /// Signatures on every function call
    All,
}

impl SignatureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Differing => "Differing",
            Self::Overloads => "Overloads",
            Self::All => "All",
        }
    }
}

impl FromStr for SignatureLevel {
    type Err = TranslatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(Self::None),
            "Differing" => Ok(Self::Differing),
            "Overloads" => Ok(Self::Overloads),
            "All" => Ok(Self::All),
            other => Err(TranslatorError::InvalidSignatureLevel(other.to_string())),
        }
    }
}

impl fmt::Display for SignatureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved, immutable compiler configuration for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerOptions {
    error_level: Severity,
    signature_level: SignatureLevel,
    options: BTreeSet<CompilerOption>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self::new(SignatureLevel::None, [])
    }
}

impl CompilerOptions {
    /// Build a configuration that reports every diagnostic down to `Info`.
    pub fn new(
        signature_level: SignatureLevel,
        options: impl IntoIterator<Item = CompilerOption>,
    ) -> Self {
        Self {
            error_level: Severity::Info,
            signature_level,
            options: options.into_iter().collect(),
        }
    }

    pub fn error_level(&self) -> Severity {
        self.error_level
    }

    pub fn signature_level(&self) -> SignatureLevel {
        self.signature_level
    }

    pub fn options(&self) -> &BTreeSet<CompilerOption> {
        &self.options
    }

    pub fn has(&self, option: CompilerOption) -> bool {
        self.options.contains(&option)
    }

    /// Enabled options in canonical order, comma separated.
    pub fn options_string(&self) -> String {
        self.options
            .iter()
            .map(CompilerOption::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Parameter name to the options it enables.
static PARAMS_TO_OPTIONS: LazyLock<HashMap<&'static str, Vec<CompilerOption>>> =
    LazyLock::new(|| {
        use CompilerOption::*;
        HashMap::from([
            ("date-range-optimization", vec![EnableDateRangeOptimization]),
            ("annotations", vec![EnableAnnotations]),
            ("locators", vec![EnableLocators]),
            ("result-types", vec![EnableResultTypes]),
            ("detailed-errors", vec![EnableDetailedErrors]),
            ("disable-list-traversal", vec![DisableListTraversal]),
            ("disable-list-demotion", vec![DisableListDemotion]),
            ("disable-list-promotion", vec![DisableListPromotion]),
            ("enable-interval-demotion", vec![EnableIntervalDemotion]),
            ("enable-interval-promotion", vec![EnableIntervalPromotion]),
            ("disable-method-invocation", vec![DisableMethodInvocation]),
            ("require-from-keyword", vec![RequireFromKeyword]),
            (
                "strict",
                vec![
                    DisableListTraversal,
                    DisableListDemotion,
                    DisableListPromotion,
                    DisableMethodInvocation,
                ],
            ),
            ("debug", vec![EnableAnnotations, EnableLocators, EnableResultTypes]),
        ])
    });

/// Options enabled by a recognized parameter name, if any.
pub fn options_for_param(name: &str) -> Option<&'static [CompilerOption]> {
    PARAMS_TO_OPTIONS.get(name).map(Vec::as_slice)
}

/// Multi-valued request parameters, in the order they were received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams(IndexMap<String, Vec<String>>);

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    /// First value received for `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|values| values.first()).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for RequestParams
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (key, value) in iter {
            params.insert(key, value);
        }
        params
    }
}

/// Resolve request parameters into a compiler configuration.
///
/// Only the literal value `"true"` enables a toggle. An unknown `signatures`
/// value is the one failure mode.
pub fn resolve(params: &RequestParams) -> TranslatorResult<CompilerOptions> {
    let mut signature_level = SignatureLevel::None;
    let mut options = BTreeSet::new();

    for key in params.keys() {
        if let Some(enabled) = options_for_param(key) {
            if params.first(key) == Some("true") {
                options.extend(enabled.iter().copied());
            }
        } else if key == SIGNATURES_PARAM {
            signature_level = params.first(key).unwrap_or_default().parse()?;
        }
    }

    tracing::debug!(
        signature_level = %signature_level,
        options = ?options,
        "Resolved compiler options"
    );

    Ok(CompilerOptions {
        error_level: Severity::Info,
        signature_level,
        options,
    })
}
