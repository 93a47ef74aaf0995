//! Request-scoped translation sessions.
//!
//! A [`TranslationSession`] bundles everything one request's compilation may
//! touch: the resolved options, a model catalog, the library source registry,
//! and the libraries already compiled as include targets. Sessions are built
//! per request and never shared.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::compiler::{CompiledLibrary, CqlCompiler, library_identifier};
use crate::error::TranslatorResult;
use crate::model::ModelManager;
use crate::options::{CompilerOptions, RequestParams, resolve};
use crate::source::{FhirLibrarySourceProvider, LibrarySourceLoader, LibrarySourceProvider, VersionedIdentifier};

/// Why an included library could not be provided.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IncludeError {
    #[error("Could not load source for library {0}.")]
    NotFound(VersionedIdentifier),

    #[error("Circular library reference detected for library {0}.")]
    Circular(VersionedIdentifier),
}

pub struct TranslationSession {
    options: CompilerOptions,
    compiler: Arc<dyn CqlCompiler>,
    models: ModelManager,
    sources: LibrarySourceLoader,
    libraries: Vec<(VersionedIdentifier, Arc<CompiledLibrary>)>,
    /// Libraries currently being compiled, outermost first
    loading: Vec<VersionedIdentifier>,
}

impl TranslationSession {
    /// Fresh session with the FHIR support libraries registered.
    pub fn new(options: CompilerOptions, compiler: Arc<dyn CqlCompiler>) -> Self {
        let mut sources = LibrarySourceLoader::new();
        sources.register_provider(FhirLibrarySourceProvider);

        Self {
            options,
            compiler,
            models: ModelManager::new(),
            sources,
            libraries: Vec::new(),
            loading: Vec::new(),
        }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn models_mut(&mut self) -> &mut ModelManager {
        &mut self.models
    }

    pub fn register_provider(&mut self, provider: impl LibrarySourceProvider + 'static) {
        self.sources.register_provider(provider);
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.sources.provider_names()
    }

    /// Compile a top-level source unit.
    pub fn compile(&mut self, source: &str) -> CompiledLibrary {
        let id = library_identifier(source);
        if let Some(id) = &id {
            self.loading.push(id.clone());
        }
        let compiler = self.compiler.clone();
        let compiled = compiler.compile(source, self);
        if id.is_some() {
            self.loading.pop();
        }
        compiled
    }

    /// Compiled form of an included library, compiling it on first use.
    pub fn resolve_library(&mut self, id: &VersionedIdentifier) -> Result<Arc<CompiledLibrary>, IncludeError> {
        if let Some((_, library)) = self.libraries.iter().find(|(declared, _)| id.is_satisfied_by(declared)) {
            return Ok(library.clone());
        }
        if self.loading.iter().any(|loading| id.is_satisfied_by(loading)) {
            return Err(IncludeError::Circular(id.clone()));
        }

        let source = self
            .sources
            .library_source(id)
            .ok_or_else(|| IncludeError::NotFound(id.clone()))?;

        tracing::debug!(library = %id, "Compiling included library");
        self.loading.push(id.clone());
        let compiler = self.compiler.clone();
        let compiled = Arc::new(compiler.compile(&source, self));
        self.loading.pop();

        let key = compiled.identifier().cloned().unwrap_or_else(|| id.clone());
        self.libraries.push((key, compiled.clone()));
        Ok(compiled)
    }

    /// Number of libraries compiled as include targets so far.
    pub fn compiled_library_count(&self) -> usize {
        self.libraries.len()
    }
}

impl fmt::Debug for TranslationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslationSession")
            .field("options", &self.options)
            .field("models", &self.models)
            .field("sources", &self.sources)
            .field("libraries", &self.libraries.len())
            .finish()
    }
}

/// Builds one fresh session per request around a shared compiler.
#[derive(Clone)]
pub struct SessionFactory {
    compiler: Arc<dyn CqlCompiler>,
}

impl SessionFactory {
    pub fn new(compiler: Arc<dyn CqlCompiler>) -> Self {
        Self { compiler }
    }

    /// Resolve `params` and build a session, failing only on invalid options.
    pub fn create_session(&self, params: &RequestParams) -> TranslatorResult<TranslationSession> {
        let options = resolve(params)?;
        Ok(TranslationSession::new(options, self.compiler.clone()))
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory").finish_non_exhaustive()
    }
}
