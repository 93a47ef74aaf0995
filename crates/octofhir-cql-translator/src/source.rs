//! Library source loading.
//!
//! `include` declarations are resolved through a [`LibrarySourceLoader`],
//! which asks each registered [`LibrarySourceProvider`] in registration order.

use std::fmt;

use serde::Serialize;

use crate::compiler::library_identifier;

/// Library name plus optional version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VersionedIdentifier {
    pub id: String,
    pub version: Option<String>,
}

impl VersionedIdentifier {
    pub fn new(id: impl Into<String>, version: Option<impl Into<String>>) -> Self {
        Self {
            id: id.into(),
            version: version.map(Into::into),
        }
    }

    /// Whether a library declared as `declared` satisfies this request.
    ///
    /// Unversioned requests accept any version; unversioned libraries
    /// satisfy any request.
    pub fn is_satisfied_by(&self, declared: &VersionedIdentifier) -> bool {
        self.id == declared.id
            && match (&self.version, &declared.version) {
                (Some(wanted), Some(have)) => wanted == have,
                _ => true,
            }
    }
}

impl fmt::Display for VersionedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}, version {}", self.id, version),
            None => f.write_str(&self.id),
        }
    }
}

/// Source of CQL library text.
pub trait LibrarySourceProvider: Send + Sync {
    /// Source text of the library identified by `id`, if this provider has it.
    fn library_source(&self, id: &VersionedIdentifier) -> Option<String>;

    fn name(&self) -> &'static str;
}

/// Ordered registry of library source providers.
#[derive(Default)]
pub struct LibrarySourceLoader {
    providers: Vec<Box<dyn LibrarySourceProvider>>,
}

impl LibrarySourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_provider(&mut self, provider: impl LibrarySourceProvider + 'static) {
        tracing::debug!(provider = provider.name(), "Registered library source provider");
        self.providers.push(Box::new(provider));
    }

    /// Source text from the first provider that has the library.
    pub fn library_source(&self, id: &VersionedIdentifier) -> Option<String> {
        self.providers.iter().find_map(|p| p.library_source(id))
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }
}

impl fmt::Debug for LibrarySourceLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibrarySourceLoader")
            .field("providers", &self.provider_names())
            .finish()
    }
}

/// In-memory catalog of library sources, keyed by their declared identifiers.
///
/// Sources without a `library` declaration cannot be included and are skipped.
#[derive(Debug, Default)]
pub struct StringLibrarySourceProvider {
    libraries: Vec<(VersionedIdentifier, String)>,
}

impl StringLibrarySourceProvider {
    pub fn new<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let libraries = sources
            .into_iter()
            .map(Into::into)
            .filter_map(|text| library_identifier(&text).map(|id| (id, text)))
            .collect();
        Self { libraries }
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }
}

impl LibrarySourceProvider for StringLibrarySourceProvider {
    fn library_source(&self, id: &VersionedIdentifier) -> Option<String> {
        self.libraries
            .iter()
            .find(|(declared, _)| id.is_satisfied_by(declared))
            .map(|(_, text)| text.clone())
    }

    fn name(&self) -> &'static str {
        "string"
    }
}

const FHIR_HELPERS_4_0_1: &str = include_str!("../resources/FHIRHelpers-4.0.1.cql");

/// Standard FHIR support libraries.
///
/// Always registered: terminology and FHIR-model libraries include
/// `FHIRHelpers`, other models never ask for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct FhirLibrarySourceProvider;

impl LibrarySourceProvider for FhirLibrarySourceProvider {
    fn library_source(&self, id: &VersionedIdentifier) -> Option<String> {
        match (id.id.as_str(), id.version.as_deref()) {
            ("FHIRHelpers", None | Some("4.0.1")) => Some(FHIR_HELPERS_4_0_1.to_string()),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        "fhir"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_provider_matches_name_and_version() {
        let provider = StringLibrarySourceProvider::new([
            "library A version '1.0.0'\ndefine X: 1",
            "library B\ndefine Y: 2",
            "define Anonymous: 3",
        ]);
        assert_eq!(provider.len(), 2);

        let a = VersionedIdentifier::new("A", Some("1.0.0"));
        assert!(provider.library_source(&a).unwrap().contains("define X"));
        assert!(provider.library_source(&VersionedIdentifier::new("A", Some("2.0.0"))).is_none());
        assert!(provider.library_source(&VersionedIdentifier::new("A", None::<String>)).is_some());
        assert!(provider.library_source(&VersionedIdentifier::new("B", Some("9"))).is_some());
        assert!(provider.library_source(&VersionedIdentifier::new("C", None::<String>)).is_none());
    }

    #[test]
    fn test_loader_asks_providers_in_order() {
        let mut loader = LibrarySourceLoader::new();
        loader.register_provider(FhirLibrarySourceProvider);
        loader.register_provider(StringLibrarySourceProvider::new([
            "library FHIRHelpers version '4.0.1'\ndefine Shadow: 1",
        ]));

        let source = loader
            .library_source(&VersionedIdentifier::new("FHIRHelpers", Some("4.0.1")))
            .unwrap();
        assert!(!source.contains("Shadow"));
        assert_eq!(loader.provider_names(), vec!["fhir", "string"]);
    }

    #[test]
    fn test_fhir_provider_serves_helpers_only() {
        let provider = FhirLibrarySourceProvider;
        assert!(provider
            .library_source(&VersionedIdentifier::new("FHIRHelpers", Some("4.0.1")))
            .is_some());
        assert!(provider
            .library_source(&VersionedIdentifier::new("FHIRHelpers", Some("1.0.2")))
            .is_none());
        assert!(provider
            .library_source(&VersionedIdentifier::new("Other", None::<String>))
            .is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(VersionedIdentifier::new("A", Some("1")).to_string(), "A, version 1");
        assert_eq!(VersionedIdentifier::new("A", None::<String>).to_string(), "A");
    }
}
