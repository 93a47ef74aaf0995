//! CQL to ELM translation for OctoFHIR.
//!
//! Turns request parameters into an isolated [`TranslationSession`] and runs
//! that session over a single CQL source or a batch of sources that may
//! include each other.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use octofhir_cql_translator::{
//!     ElmTranslator, OutputFormat, RequestParams, SessionFactory, translate_source,
//! };
//!
//! let factory = SessionFactory::new(Arc::new(ElmTranslator));
//! let params: RequestParams = [("annotations", "true")].into_iter().collect();
//! let mut session = factory.create_session(&params)?;
//! let result = translate_source(&mut session, b"library A\ndefine X: 1", OutputFormat::ElmJson)?;
//! assert!(result.is_success());
//! # Ok::<(), octofhir_cql_translator::TranslatorError>(())
//! ```

pub mod compiler;
pub mod error;
pub mod format;
pub mod model;
pub mod options;
pub mod session;
pub mod source;
pub mod translate;

pub use compiler::{CompiledLibrary, CqlCompiler, CqlDiagnostic, ElmTranslator, ErrorType, Locator};
pub use error::{TranslatorError, TranslatorResult};
pub use format::{
    CQL_TEXT_TYPE, ELM_JSON_TYPE, ELM_XML_TYPE, OutputFormat, media_type_essence,
    normalize_target_formats,
};
pub use model::{ModelInfo, ModelManager};
pub use options::{
    CompilerOption, CompilerOptions, RequestParams, SIGNATURES_PARAM, Severity, SignatureLevel,
    resolve as resolve_options,
};
pub use session::{IncludeError, SessionFactory, TranslationSession};
pub use source::{
    FhirLibrarySourceProvider, LibrarySourceLoader, LibrarySourceProvider,
    StringLibrarySourceProvider, VersionedIdentifier,
};
pub use translate::{
    BatchPart, SourceUnit, TranslationOutput, TranslationResult, decode_source, translate_batch,
    translate_source,
};
