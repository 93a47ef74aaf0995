//! CQL compilation.
//!
//! [`CqlCompiler`] is the seam between translation sessions and whatever
//! turns CQL text into ELM. [`ElmTranslator`] is the built-in implementation.

pub mod ast;
pub mod diagnostic;
pub mod lexer;
pub mod parser;
pub mod translator;
pub mod types;
pub mod xml;

use std::collections::HashMap;

use serde_json::Value;

pub use ast::AccessLevel;
pub use diagnostic::{CqlDiagnostic, ErrorType, Locator};
pub use translator::ElmTranslator;
pub use types::DataType;

use crate::format::OutputFormat;
use crate::session::TranslationSession;
use crate::source::VersionedIdentifier;

/// Compiles one CQL library.
///
/// Implementations must be stateless: every piece of per-request state
/// (options, models, library sources, already-compiled includes) lives in
/// the session.
pub trait CqlCompiler: Send + Sync {
    fn compile(&self, source: &str, session: &mut TranslationSession) -> CompiledLibrary;
}

/// Kind of a named library-level declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Expression,
    Parameter,
    CodeSystem,
    ValueSet,
    Code,
    Concept,
}

impl SymbolKind {
    /// ELM reference node type for this kind.
    pub fn ref_type(&self) -> &'static str {
        match self {
            Self::Expression => "ExpressionRef",
            Self::Parameter => "ParameterRef",
            Self::CodeSystem => "CodeSystemRef",
            Self::ValueSet => "ValueSetRef",
            Self::Code => "CodeRef",
            Self::Concept => "ConceptRef",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub access: AccessLevel,
    pub result_type: Option<DataType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSignature {
    pub name: String,
    pub access: AccessLevel,
    pub fluent: bool,
    pub operand_types: Vec<DataType>,
    pub result_type: Option<DataType>,
}

/// Declarations a library makes visible to libraries that include it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LibraryExports {
    pub symbols: HashMap<String, Symbol>,
    pub functions: Vec<FunctionSignature>,
}

/// Output of compiling one library.
#[derive(Debug, Clone)]
pub struct CompiledLibrary {
    identifier: Option<VersionedIdentifier>,
    elm: Value,
    diagnostics: Vec<CqlDiagnostic>,
    exports: LibraryExports,
}

impl CompiledLibrary {
    pub fn new(
        identifier: Option<VersionedIdentifier>,
        elm: Value,
        diagnostics: Vec<CqlDiagnostic>,
        exports: LibraryExports,
    ) -> Self {
        Self {
            identifier,
            elm,
            diagnostics,
            exports,
        }
    }

    /// Declared identifier, if the source has a `library` statement.
    pub fn identifier(&self) -> Option<&VersionedIdentifier> {
        self.identifier.as_ref()
    }

    pub fn elm(&self) -> &Value {
        &self.elm
    }

    pub fn diagnostics(&self) -> &[CqlDiagnostic] {
        &self.diagnostics
    }

    pub fn exports(&self) -> &LibraryExports {
        &self.exports
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(CqlDiagnostic::is_error)
    }

    pub fn to_json(&self) -> String {
        format!("{:#}", self.elm)
    }

    pub fn to_xml(&self) -> String {
        xml::to_xml(&self.elm)
    }

    pub fn serialize(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::ElmJson => self.to_json(),
            OutputFormat::ElmXml => self.to_xml(),
        }
    }
}

/// Identifier declared by the `library` statement of `source`, if any.
pub fn library_identifier(source: &str) -> Option<VersionedIdentifier> {
    let (tokens, _) = lexer::tokenize(source);
    parser::library_header(&tokens, source).map(|(id, version)| VersionedIdentifier::new(id, version))
}
