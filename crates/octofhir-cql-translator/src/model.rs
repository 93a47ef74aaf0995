//! Data model catalog.
//!
//! Resolves `using` declarations to model descriptions. Each session owns its
//! own [`ModelManager`], so resolved models are never shared between requests.

use std::collections::HashMap;
use std::sync::Arc;

/// Namespace URI of the CQL system model.
pub const SYSTEM_MODEL_URI: &str = "urn:hl7-org:elm-types:r1";

/// A resolved data model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub uri: String,
    pub version: Option<String>,
}

struct KnownModel {
    name: &'static str,
    uri: &'static str,
    versions: &'static [&'static str],
}

const KNOWN_MODELS: &[KnownModel] = &[
    KnownModel {
        name: "System",
        uri: SYSTEM_MODEL_URI,
        versions: &[],
    },
    KnownModel {
        name: "FHIR",
        uri: "http://hl7.org/fhir",
        versions: &["1.0.2", "1.4", "1.6", "1.8", "3.0.0", "3.0.1", "3.2.0", "4.0.0", "4.0.1"],
    },
    KnownModel {
        name: "QDM",
        uri: "urn:healthit-gov:qdm:v5_6",
        versions: &["4.2", "4.3", "5.0", "5.0.1", "5.0.2", "5.3", "5.4", "5.5", "5.6"],
    },
    KnownModel {
        name: "QICore",
        uri: "http://hl7.org/fhir",
        versions: &["4.1.1", "5.0.0", "6.0.0"],
    },
    KnownModel {
        name: "USCore",
        uri: "http://hl7.org/fhir",
        versions: &["3.1.0", "3.1.1", "6.1.0"],
    },
];

/// Per-session model catalog with resolution cache.
#[derive(Debug, Default)]
pub struct ModelManager {
    resolved: HashMap<(String, Option<String>), Arc<ModelInfo>>,
}

impl ModelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a model by name and optional version.
    pub fn resolve(&mut self, name: &str, version: Option<&str>) -> Result<Arc<ModelInfo>, String> {
        let key = (name.to_string(), version.map(str::to_string));
        if let Some(model) = self.resolved.get(&key) {
            return Ok(model.clone());
        }

        let known = KNOWN_MODELS
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| format!("Could not resolve model info provider for model {name}."))?;

        let version = match version {
            Some(v) if !known.versions.is_empty() && !known.versions.contains(&v) => {
                return Err(format!(
                    "Could not resolve model info provider for model {name}, version {v}."
                ));
            }
            Some(v) => Some(v.to_string()),
            None => known.versions.last().map(|v| v.to_string()),
        };

        let model = Arc::new(ModelInfo {
            name: known.name.to_string(),
            uri: known.uri.to_string(),
            version,
        });
        tracing::debug!(model = name, version = ?model.version, "Resolved model");
        self.resolved.insert(key, model.clone());
        Ok(model)
    }

    /// Number of distinct models resolved in this session.
    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }
}
