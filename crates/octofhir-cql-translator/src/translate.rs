//! Single-unit and batch translation over a session.

use crate::compiler::CqlDiagnostic;
use crate::error::TranslatorResult;
use crate::format::{OutputFormat, normalize_target_formats};
use crate::session::TranslationSession;
use crate::source::StringLibrarySourceProvider;

/// One submitted source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Form field name the source arrived under
    pub name: String,
    pub source: Vec<u8>,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, source: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationOutput {
    pub format: OutputFormat,
    pub content: String,
}

/// Serialized outputs of one compiled unit plus its diagnostics.
#[derive(Debug, Clone)]
pub struct TranslationResult {
    outputs: Vec<TranslationOutput>,
    diagnostics: Vec<CqlDiagnostic>,
}

impl TranslationResult {
    pub fn outputs(&self) -> &[TranslationOutput] {
        &self.outputs
    }

    pub fn into_outputs(self) -> Vec<TranslationOutput> {
        self.outputs
    }

    pub fn diagnostics(&self) -> &[CqlDiagnostic] {
        &self.diagnostics
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.is_error()).count()
    }

    /// Success iff no diagnostic has error severity.
    pub fn is_success(&self) -> bool {
        self.error_count() == 0
    }
}

/// A batch result, labeled with the field name of its input part.
#[derive(Debug, Clone)]
pub struct BatchPart {
    pub name: String,
    pub result: TranslationResult,
}

/// Source text of a submitted unit; invalid UTF-8 is an unreadable request.
pub fn decode_source(bytes: &[u8]) -> TranslatorResult<&str> {
    let text = std::str::from_utf8(bytes)?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

fn compile_unit(session: &mut TranslationSession, text: &str, formats: &[OutputFormat]) -> TranslationResult {
    let compiled = session.compile(text);
    let outputs = formats
        .iter()
        .map(|&format| TranslationOutput {
            format,
            content: compiled.serialize(format),
        })
        .collect();
    TranslationResult {
        outputs,
        diagnostics: compiled.diagnostics().to_vec(),
    }
}

/// Translate one source unit into `format`.
///
/// Compilation problems are reported in the result, never as `Err`.
pub fn translate_source(
    session: &mut TranslationSession,
    source: &[u8],
    format: OutputFormat,
) -> TranslatorResult<TranslationResult> {
    let text = decode_source(source)?;
    let result = compile_unit(session, text, &[format]);
    tracing::info!(
        format = %format,
        errors = result.error_count(),
        diagnostics = result.diagnostics().len(),
        "Translated source"
    );
    Ok(result)
}

/// Translate every part of a batch into every requested format.
///
/// Requested formats are validated before any part is compiled, so an
/// unsupported format rejects the whole batch. All parts are registered as
/// library sources first, so parts may include each other in any order.
pub fn translate_batch<S: AsRef<str>>(
    session: &mut TranslationSession,
    parts: &[SourceUnit],
    requested_formats: &[S],
    default_format: OutputFormat,
) -> TranslatorResult<Vec<BatchPart>> {
    let formats = normalize_target_formats(requested_formats, default_format)?;

    let texts = parts
        .iter()
        .map(|part| decode_source(&part.source))
        .collect::<TranslatorResult<Vec<&str>>>()?;
    let provider = StringLibrarySourceProvider::new(texts.iter().copied());
    tracing::debug!(
        parts = parts.len(),
        libraries = provider.len(),
        formats = ?formats,
        "Registered batch sources"
    );
    session.register_provider(provider);

    let results: Vec<BatchPart> = parts
        .iter()
        .zip(texts)
        .map(|(part, text)| BatchPart {
            name: part.name.clone(),
            result: compile_unit(session, text, &formats),
        })
        .collect();

    tracing::info!(
        parts = results.len(),
        failed = results.iter().filter(|p| !p.result.is_success()).count(),
        "Translated batch"
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::compiler::ElmTranslator;
    use crate::error::TranslatorError;
    use crate::options::CompilerOptions;

    fn session() -> TranslationSession {
        TranslationSession::new(CompilerOptions::default(), Arc::new(ElmTranslator))
    }

    #[test]
    fn test_single_source_success_and_failure() {
        let ok = translate_source(&mut session(), b"library A\ndefine X: 1", OutputFormat::ElmJson).unwrap();
        assert!(ok.is_success());
        assert_eq!(ok.outputs().len(), 1);
        let elm: serde_json::Value = serde_json::from_str(&ok.outputs()[0].content).unwrap();
        assert_eq!(elm["library"]["identifier"]["id"], "A");

        let failed = translate_source(&mut session(), b"library A\ndefine X: Nope", OutputFormat::ElmXml).unwrap();
        assert!(!failed.is_success());
        assert!(failed.outputs()[0].content.contains("CqlToElmError"));
    }

    #[test]
    fn test_deeply_nested_source_reports_an_error() {
        let n = 10_000;
        let source = format!("library A\ndefine X: {}1{}", "(".repeat(n), ")".repeat(n));
        for format in [OutputFormat::ElmJson, OutputFormat::ElmXml] {
            let result = translate_source(&mut session(), source.as_bytes(), format).unwrap();
            assert!(!result.is_success());
            assert!(
                result
                    .diagnostics()
                    .iter()
                    .any(|d| d.message == "Expression nesting too deep")
            );
            assert!(result.outputs()[0].content.contains("CqlToElmError"));
        }
    }

    #[test]
    fn test_control_characters_produce_well_formed_xml() {
        let result =
            translate_source(&mut session(), b"library A\ndefine X: 'a\\fb'", OutputFormat::ElmXml).unwrap();
        assert!(result.is_success(), "{:?}", result.diagnostics());
        let xml = &result.outputs()[0].content;
        assert!(!xml.chars().any(|c| c < ' ' && c != '\n'));
        assert!(xml.contains("value=\"a\u{fffd}b\""));
    }

    #[test]
    fn test_string_literals_keep_braced_text() {
        let result = translate_source(
            &mut session(),
            b"library A\ndefine X: '{http://hl7.org/fhir}Patient'",
            OutputFormat::ElmXml,
        )
        .unwrap();
        let xml = &result.outputs()[0].content;
        assert!(xml.contains("value=\"{http://hl7.org/fhir}Patient\""));
        assert!(xml.contains("valueType=\"t:String\""));
    }

    #[test]
    fn test_invalid_utf8_is_unreadable() {
        let err = translate_source(&mut session(), &[0xff, 0xfe, 0x00], OutputFormat::ElmJson).unwrap_err();
        assert!(matches!(err, TranslatorError::UnreadableRequest));
    }

    #[test]
    fn test_byte_order_mark_is_stripped() {
        assert_eq!(decode_source("\u{feff}library A".as_bytes()).unwrap(), "library A");
    }

    #[test]
    fn test_batch_parts_include_each_other() {
        let parts = vec![
            SourceUnit::new("main", "library A\ninclude B\ndefine X: B.Y + 1"),
            SourceUnit::new("dep", "library B\ndefine Y: 41"),
        ];
        let results = translate_batch(
            &mut session(),
            &parts,
            &["application/elm+xml,application/elm+json"],
            OutputFormat::ElmJson,
        )
        .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].name, "main");
        assert_eq!(results[1].name, "dep");
        for part in &results {
            assert!(part.result.is_success(), "{:?}", part.result.diagnostics());
            let formats: Vec<OutputFormat> = part.result.outputs().iter().map(|o| o.format).collect();
            assert_eq!(formats, vec![OutputFormat::ElmXml, OutputFormat::ElmJson]);
        }
    }

    #[test]
    fn test_batch_missing_dependency_fails_only_that_part() {
        let parts = vec![
            SourceUnit::new("main", "library A\ninclude B\ndefine X: B.Y"),
            SourceUnit::new("other", "library C\ndefine Z: 1"),
        ];
        let results = translate_batch(&mut session(), &parts, &[] as &[&str], OutputFormat::ElmJson).unwrap();

        assert!(!results[0].result.is_success());
        assert!(results[0].result.diagnostics()[0].message.contains("library B"));
        assert!(results[1].result.is_success());
        assert_eq!(results[1].result.outputs()[0].format, OutputFormat::ElmJson);
    }

    #[test]
    fn test_batch_unsupported_format_rejects_everything() {
        let parts = vec![SourceUnit::new("main", "library A\ndefine X: 1")];
        let err = translate_batch(
            &mut session(),
            &parts,
            &["application/elm+json", "text/plain"],
            OutputFormat::ElmJson,
        )
        .unwrap_err();
        assert!(matches!(err, TranslatorError::UnsupportedFormat(ref f) if f == "text/plain"));
    }
}
