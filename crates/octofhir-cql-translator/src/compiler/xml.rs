//! ELM XML rendering.
//!
//! The ELM tree is built once as JSON and rendered to XML on demand: scalar
//! fields become attributes, objects and arrays become child elements, and
//! the `type` discriminator becomes `xsi:type`.

use serde_json::{Map, Value};

use crate::model::SYSTEM_MODEL_URI;

const ELM_NAMESPACE: &str = "urn:hl7-org:elm:r1";
const ANNOTATION_NAMESPACE: &str = "urn:hl7-org:cql-annotations:r1";

/// Namespace prefixes declared on the root element.
const PREFIXES: &[(&str, &str)] = &[
    ("t", SYSTEM_MODEL_URI),
    ("xsi", "http://www.w3.org/2001/XMLSchema-instance"),
    ("xsd", "http://www.w3.org/2001/XMLSchema"),
    ("fhir", "http://hl7.org/fhir"),
    ("qdm43", "urn:healthit-gov:qdm:v4_3"),
    ("qdm53", "urn:healthit-gov:qdm:v5_3"),
    ("qdm", "urn:healthit-gov:qdm:v5_6"),
    ("a", ANNOTATION_NAMESPACE),
];

/// Types that live in the annotation namespace.
const ANNOTATION_TYPES: &[&str] = &["CqlToElmInfo", "CqlToElmError", "Annotation"];

const INDENT: &str = "   ";

/// Render an ELM JSON document (`{"library": {...}}`) as XML.
pub fn to_xml(elm: &Value) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    if let Some(Value::Object(library)) = elm.get("library") {
        let mut root_attributes = format!(" xmlns=\"{ELM_NAMESPACE}\"");
        for (prefix, uri) in PREFIXES {
            root_attributes.push_str(&format!(" xmlns:{prefix}=\"{uri}\""));
        }
        write_element(&mut out, "library", library, &root_attributes, 0, false);
    }
    out
}

fn write_element(
    out: &mut String,
    name: &str,
    fields: &Map<String, Value>,
    extra_attributes: &str,
    depth: usize,
    in_annotation: bool,
) {
    let element_type = fields.get("type").and_then(Value::as_str);
    let is_annotation = element_type.is_some_and(|t| ANNOTATION_TYPES.contains(&t));
    let child_prefix = if in_annotation || is_annotation { "a:" } else { "" };

    indent(out, depth);
    out.push('<');
    out.push_str(name);
    out.push_str(extra_attributes);

    let mut has_children = false;
    for (key, value) in fields {
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => continue,
            Value::Array(_) | Value::Object(_) => {
                has_children = true;
                continue;
            }
        };
        let (attribute, text) = if key == "type" {
            let prefixed = if ANNOTATION_TYPES.contains(&text.as_str()) {
                format!("a:{text}")
            } else {
                text
            };
            ("xsi:type", prefixed)
        } else if is_type_name(key, element_type) {
            (key.as_str(), qualify(&text))
        } else {
            (key.as_str(), text)
        };
        out.push(' ');
        out.push_str(attribute);
        out.push_str("=\"");
        out.push_str(&escape(&text));
        out.push('"');
    }

    if !has_children {
        out.push_str("/>\n");
        return;
    }
    out.push_str(">\n");

    for (key, value) in fields {
        let child_name = format!("{child_prefix}{key}");
        match value {
            Value::Object(child) => {
                write_element(out, &child_name, child, "", depth + 1, in_annotation || is_annotation)
            }
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::Object(child) => write_element(
                            out,
                            &child_name,
                            child,
                            "",
                            depth + 1,
                            in_annotation || is_annotation,
                        ),
                        Value::Null => {}
                        scalar => {
                            let text = match scalar {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            indent(out, depth + 1);
                            out.push_str(&format!("<{child_name}>{}</{child_name}>\n", escape(&text)));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    indent(out, depth);
    out.push_str(&format!("</{name}>\n"));
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
}

/// Attributes holding a `{uri}Name` type reference rather than user data.
fn is_type_name(key: &str, element_type: Option<&str>) -> bool {
    match key {
        "valueType" | "resultTypeName" | "dataType" | "asType" => true,
        "name" => element_type == Some("NamedTypeSpecifier"),
        _ => false,
    }
}

/// `{uri}Name` to `prefix:Name` for namespaces declared on the root.
fn qualify(value: &str) -> String {
    let Some(rest) = value.strip_prefix('{') else {
        return value.to_string();
    };
    let Some((uri, local)) = rest.split_once('}') else {
        return value.to_string();
    };
    match PREFIXES.iter().find(|(_, u)| *u == uri) {
        Some((prefix, _)) => format!("{prefix}:{local}"),
        None => value.to_string(),
    }
}

/// Escape markup and whitespace that attribute normalization would fold.
/// Characters XML 1.0 cannot carry at all become U+FFFD.
fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            '\t' => escaped.push_str("&#x9;"),
            '\n' => escaped.push_str("&#xA;"),
            '\r' => escaped.push_str("&#xD;"),
            '\u{0}'..='\u{1f}' | '\u{fffe}' | '\u{ffff}' => escaped.push('\u{fffd}'),
            other => escaped.push(other),
        }
    }
    escaped
}
