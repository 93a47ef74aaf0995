//! Result types tracked during translation.

use std::fmt;

use serde_json::{Value, json};

use crate::model::SYSTEM_MODEL_URI;

/// Names the system model defines.
pub const SYSTEM_TYPES: &[&str] = &[
    "Any",
    "Boolean",
    "Integer",
    "Long",
    "Decimal",
    "String",
    "Date",
    "DateTime",
    "Time",
    "Quantity",
    "Ratio",
    "Code",
    "Concept",
    "Vocabulary",
    "CodeSystem",
    "ValueSet",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    /// Model-qualified name, `{uri}Name`
    Named(String),
    List(Box<DataType>),
    Interval(Box<DataType>),
}

impl DataType {
    pub fn system(name: &str) -> Self {
        Self::Named(format!("{{{SYSTEM_MODEL_URI}}}{name}"))
    }

    pub fn model(uri: &str, name: &str) -> Self {
        Self::Named(format!("{{{uri}}}{name}"))
    }

    /// Local name of a system type, `None` for anything else.
    pub fn system_name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => name.strip_prefix(&format!("{{{SYSTEM_MODEL_URI}}}")[..]),
            _ => None,
        }
    }

    pub fn is_system(&self, name: &str) -> bool {
        self.system_name() == Some(name)
    }

    pub fn is_any(&self) -> bool {
        self.is_system("Any")
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.system_name(), Some("Integer" | "Long" | "Decimal" | "Quantity"))
    }

    pub fn is_ordered(&self) -> bool {
        matches!(
            self.system_name(),
            Some("Integer" | "Long" | "Decimal" | "Quantity" | "String" | "Date" | "DateTime" | "Time")
        )
    }

    /// ELM type specifier for this type.
    pub fn to_specifier(&self) -> Value {
        match self {
            Self::Named(name) => json!({ "type": "NamedTypeSpecifier", "name": name }),
            Self::List(element) => json!({
                "type": "ListTypeSpecifier",
                "elementType": element.to_specifier(),
            }),
            Self::Interval(point) => json!({
                "type": "IntervalTypeSpecifier",
                "pointType": point.to_specifier(),
            }),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => match self.system_name() {
                Some(local) => write!(f, "System.{local}"),
                None => f.write_str(name),
            },
            Self::List(element) => write!(f, "List<{element}>"),
            Self::Interval(point) => write!(f, "Interval<{point}>"),
        }
    }
}

/// Implicit conversion from `from` to `to`, if one exists.
///
/// Returns the ELM conversion operator, or `Some(None)` when no conversion
/// is needed.
pub fn implicit_conversion(from: &DataType, to: &DataType) -> Option<Option<&'static str>> {
    if from == to || to.is_any() {
        return Some(None);
    }
    match (from.system_name(), to.system_name()) {
        (Some("Integer"), Some("Decimal")) => Some(Some("ToDecimal")),
        (Some("Integer"), Some("Long")) => Some(Some("ToLong")),
        (Some("Long"), Some("Decimal")) => Some(Some("ToDecimal")),
        (Some("Code"), Some("Concept")) => Some(Some("ToConcept")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_uses_model_prefix_for_system_types() {
        assert_eq!(DataType::system("Integer").to_string(), "System.Integer");
        assert_eq!(
            DataType::List(Box::new(DataType::model("http://hl7.org/fhir", "Coding"))).to_string(),
            "List<{http://hl7.org/fhir}Coding>"
        );
    }

    #[test]
    fn test_specifiers() {
        let spec = DataType::Interval(Box::new(DataType::system("DateTime"))).to_specifier();
        assert_eq!(spec["type"], "IntervalTypeSpecifier");
        assert_eq!(spec["pointType"]["name"], "{urn:hl7-org:elm-types:r1}DateTime");
    }

    #[test]
    fn test_implicit_conversions() {
        let integer = DataType::system("Integer");
        let decimal = DataType::system("Decimal");
        assert_eq!(implicit_conversion(&integer, &decimal), Some(Some("ToDecimal")));
        assert_eq!(implicit_conversion(&decimal, &integer), None);
        assert_eq!(implicit_conversion(&decimal, &decimal), Some(None));
        assert_eq!(implicit_conversion(&decimal, &DataType::system("Any")), Some(None));
    }
}
