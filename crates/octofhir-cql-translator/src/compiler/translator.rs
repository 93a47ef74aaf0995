//! Built-in CQL to ELM translator.
//!
//! Covers library-level declarations and the scalar expression subset:
//! literals, references, member access, function calls, and the logical,
//! comparison, arithmetic and string operators. Definitions whose bodies
//! use anything else are kept with their expression omitted and a warning.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use super::ast::*;
use super::diagnostic::{CqlDiagnostic, ErrorType, Locator};
use super::lexer::tokenize;
use super::parser::parse;
use super::types::{DataType, SYSTEM_TYPES, implicit_conversion};
use super::{CompiledLibrary, CqlCompiler, FunctionSignature, LibraryExports, Symbol, SymbolKind};
use crate::model::{ModelInfo, SYSTEM_MODEL_URI};
use crate::options::{CompilerOption, CompilerOptions, SignatureLevel};
use crate::session::TranslationSession;
use crate::source::VersionedIdentifier;

const ELM_SCHEMA_ID: &str = "urn:hl7-org:elm";
const ELM_SCHEMA_VERSION: &str = "r1";
const FHIR_MODEL_URI: &str = "http://hl7.org/fhir";

/// Stateless CQL to ELM translator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ElmTranslator;

impl CqlCompiler for ElmTranslator {
    fn compile(&self, source: &str, session: &mut TranslationSession) -> CompiledLibrary {
        let (tokens, mut diagnostics) = tokenize(source);
        let (ast, parse_diagnostics) = parse(&tokens, source);
        diagnostics.extend(parse_diagnostics);

        let mut builder = LibraryBuilder::new(&ast, source, session.options().clone(), diagnostics);
        builder.resolve_usings(session);
        builder.resolve_includes(session);
        builder.build()
    }
}

enum Shape {
    Nullary,
    Unary,
    Nary,
}

enum ResultRule {
    Fixed(&'static str),
    FirstOperand,
}

struct SystemFunction {
    name: &'static str,
    shape: Shape,
    min_args: usize,
    max_args: usize,
    result: ResultRule,
}

const fn system_fn(
    name: &'static str,
    shape: Shape,
    min_args: usize,
    max_args: usize,
    result: ResultRule,
) -> SystemFunction {
    SystemFunction {
        name,
        shape,
        min_args,
        max_args,
        result,
    }
}

const SYSTEM_FUNCTIONS: &[SystemFunction] = &[
    system_fn("ToString", Shape::Unary, 1, 1, ResultRule::Fixed("String")),
    system_fn("ToBoolean", Shape::Unary, 1, 1, ResultRule::Fixed("Boolean")),
    system_fn("ToInteger", Shape::Unary, 1, 1, ResultRule::Fixed("Integer")),
    system_fn("ToLong", Shape::Unary, 1, 1, ResultRule::Fixed("Long")),
    system_fn("ToDecimal", Shape::Unary, 1, 1, ResultRule::Fixed("Decimal")),
    system_fn("ToDate", Shape::Unary, 1, 1, ResultRule::Fixed("Date")),
    system_fn("ToDateTime", Shape::Unary, 1, 1, ResultRule::Fixed("DateTime")),
    system_fn("ToTime", Shape::Unary, 1, 1, ResultRule::Fixed("Time")),
    system_fn("ToQuantity", Shape::Unary, 1, 1, ResultRule::Fixed("Quantity")),
    system_fn("ToConcept", Shape::Unary, 1, 1, ResultRule::Fixed("Concept")),
    system_fn("Abs", Shape::Unary, 1, 1, ResultRule::FirstOperand),
    system_fn("Ceiling", Shape::Unary, 1, 1, ResultRule::Fixed("Integer")),
    system_fn("Floor", Shape::Unary, 1, 1, ResultRule::Fixed("Integer")),
    system_fn("Truncate", Shape::Unary, 1, 1, ResultRule::Fixed("Integer")),
    system_fn("Round", Shape::Unary, 1, 1, ResultRule::Fixed("Decimal")),
    system_fn("Ln", Shape::Unary, 1, 1, ResultRule::Fixed("Decimal")),
    system_fn("Exp", Shape::Unary, 1, 1, ResultRule::Fixed("Decimal")),
    system_fn("Log", Shape::Nary, 2, 2, ResultRule::Fixed("Decimal")),
    system_fn("Length", Shape::Unary, 1, 1, ResultRule::Fixed("Integer")),
    system_fn("Upper", Shape::Unary, 1, 1, ResultRule::Fixed("String")),
    system_fn("Lower", Shape::Unary, 1, 1, ResultRule::Fixed("String")),
    system_fn("StartsWith", Shape::Nary, 2, 2, ResultRule::Fixed("Boolean")),
    system_fn("EndsWith", Shape::Nary, 2, 2, ResultRule::Fixed("Boolean")),
    system_fn("Matches", Shape::Nary, 2, 2, ResultRule::Fixed("Boolean")),
    system_fn("Coalesce", Shape::Nary, 2, 5, ResultRule::FirstOperand),
    system_fn("IsNull", Shape::Unary, 1, 1, ResultRule::Fixed("Boolean")),
    system_fn("IsTrue", Shape::Unary, 1, 1, ResultRule::Fixed("Boolean")),
    system_fn("IsFalse", Shape::Unary, 1, 1, ResultRule::Fixed("Boolean")),
    system_fn("Now", Shape::Nullary, 0, 0, ResultRule::Fixed("DateTime")),
    system_fn("Today", Shape::Nullary, 0, 0, ResultRule::Fixed("Date")),
    system_fn("TimeOfDay", Shape::Nullary, 0, 0, ResultRule::Fixed("Time")),
];

fn system_function(name: &str, arity: usize) -> Option<&'static SystemFunction> {
    SYSTEM_FUNCTIONS
        .iter()
        .find(|f| f.name == name && (f.min_args..=f.max_args).contains(&arity))
}

/// A translated expression and what is known about its type.
struct Typed {
    elm: Value,
    ty: Option<DataType>,
    locator: Locator,
}

enum DefState {
    InProgress,
    Done(Value, Option<DataType>),
}

struct LibraryBuilder<'a> {
    ast: &'a LibraryAst,
    source: &'a str,
    options: CompilerOptions,
    identifier: Option<VersionedIdentifier>,
    diagnostics: Vec<CqlDiagnostic>,
    next_local_id: usize,
    /// Non-system models by local identifier
    models: Vec<(String, Arc<ModelInfo>)>,
    using_defs: Vec<Value>,
    include_defs: Vec<Value>,
    /// `None` marks an include that failed to load
    includes: HashMap<String, Option<Arc<CompiledLibrary>>>,
    symbols: HashMap<String, Symbol>,
    expressions: HashMap<String, DefState>,
    functions: Vec<FunctionSignature>,
    /// Index into `ast.functions` for each entry of `functions`
    function_decls: Vec<usize>,
    accepted_terminology: Vec<usize>,
    accepted_parameters: Vec<usize>,
    accepted_expressions: Vec<usize>,
    context_defs: Vec<(Locator, String)>,
    operands: Vec<(String, DataType)>,
}

impl<'a> LibraryBuilder<'a> {
    fn new(
        ast: &'a LibraryAst,
        source: &'a str,
        options: CompilerOptions,
        diagnostics: Vec<CqlDiagnostic>,
    ) -> Self {
        let identifier = ast
            .library
            .as_ref()
            .map(|l| VersionedIdentifier::new(&l.name, l.version.clone()));

        Self {
            ast,
            source,
            options,
            identifier,
            diagnostics,
            next_local_id: 0,
            models: Vec::new(),
            using_defs: vec![json!({
                "localIdentifier": "System",
                "uri": SYSTEM_MODEL_URI,
            })],
            include_defs: Vec::new(),
            includes: HashMap::new(),
            symbols: HashMap::new(),
            expressions: HashMap::new(),
            functions: Vec::new(),
            function_decls: Vec::new(),
            accepted_terminology: Vec::new(),
            accepted_parameters: Vec::new(),
            accepted_expressions: Vec::new(),
            context_defs: Vec::new(),
            operands: Vec::new(),
        }
    }

    fn error(&mut self, error_type: ErrorType, message: impl Into<String>, locator: Locator) {
        self.diagnostics
            .push(CqlDiagnostic::error(error_type, message, Some(locator)));
    }

    fn warning(&mut self, message: impl Into<String>, locator: Locator) {
        self.diagnostics
            .push(CqlDiagnostic::warning(ErrorType::Semantic, message, Some(locator)));
    }

    fn resolve_usings(&mut self, session: &mut TranslationSession) {
        let ast = self.ast;
        for using in &ast.usings {
            if using.model == "System" {
                continue;
            }
            match session.models_mut().resolve(&using.model, using.version.as_deref()) {
                Ok(model) => {
                    let local = using.alias.clone().unwrap_or_else(|| using.model.clone());
                    let mut def = self.header(None, using.locator, None);
                    def.insert("localIdentifier".into(), json!(local));
                    def.insert("uri".into(), json!(model.uri));
                    if let Some(version) = &model.version {
                        def.insert("version".into(), json!(version));
                    }
                    self.using_defs.push(Value::Object(def));
                    self.models.push((local, model));
                }
                Err(message) => self.error(ErrorType::Semantic, message, using.locator),
            }
        }
    }

    fn resolve_includes(&mut self, session: &mut TranslationSession) {
        let ast = self.ast;
        for include in &ast.includes {
            let id = VersionedIdentifier::new(&include.library, include.version.clone());
            let alias = include.local_name().to_string();

            match session.resolve_library(&id) {
                Ok(library) => {
                    if let Some(first) = library.diagnostics().iter().find(|d| d.is_error()) {
                        self.error(
                            ErrorType::Include,
                            format!("Library {id} loaded, but had errors: {}", first.message),
                            include.locator,
                        );
                    }
                    self.includes.insert(alias.clone(), Some(library));
                }
                Err(err) => {
                    self.error(ErrorType::Include, err.to_string(), include.locator);
                    self.includes.insert(alias.clone(), None);
                }
            }

            let mut def = self.header(None, include.locator, None);
            def.insert("localIdentifier".into(), json!(alias));
            def.insert("path".into(), json!(include.library));
            if let Some(version) = &include.version {
                def.insert("version".into(), json!(version));
            }
            self.include_defs.push(Value::Object(def));
        }
    }

    fn build(mut self) -> CompiledLibrary {
        self.declare_symbols();
        self.declare_functions();

        let code_systems = self.terminology_defs(|k| matches!(k, TerminologyKind::CodeSystem { .. }));
        let value_sets = self.terminology_defs(|k| matches!(k, TerminologyKind::ValueSet { .. }));
        let codes = self.terminology_defs(|k| matches!(k, TerminologyKind::Code { .. }));
        let concepts = self.terminology_defs(|k| matches!(k, TerminologyKind::Concept { .. }));
        let parameters = self.parameter_defs();
        let statements = self.statement_defs();

        let contexts: Vec<Value> = self
            .ast
            .contexts
            .iter()
            .map(|c| json!({ "name": c.name }))
            .collect();

        self.finish_diagnostics();

        let mut library = Map::new();
        library.insert("annotation".into(), Value::Array(self.annotations()));
        if let Some(identifier) = &self.identifier {
            let mut id = Map::new();
            id.insert("id".into(), json!(identifier.id));
            if let Some(version) = &identifier.version {
                id.insert("version".into(), json!(version));
            }
            library.insert("identifier".into(), Value::Object(id));
        }
        library.insert(
            "schemaIdentifier".into(),
            json!({ "id": ELM_SCHEMA_ID, "version": ELM_SCHEMA_VERSION }),
        );
        let sections = [
            ("usings", std::mem::take(&mut self.using_defs)),
            ("includes", std::mem::take(&mut self.include_defs)),
            ("parameters", parameters),
            ("codeSystems", code_systems),
            ("valueSets", value_sets),
            ("codes", codes),
            ("concepts", concepts),
            ("contexts", contexts),
            ("statements", statements),
        ];
        for (name, defs) in sections {
            if !defs.is_empty() {
                library.insert(name.into(), json!({ "def": defs }));
            }
        }

        let exports = self.exports();
        tracing::debug!(
            library = ?self.identifier,
            diagnostics = self.diagnostics.len(),
            "Translated library"
        );
        CompiledLibrary::new(
            self.identifier,
            json!({ "library": library }),
            self.diagnostics,
            exports,
        )
    }

    fn annotations(&self) -> Vec<Value> {
        let mut annotations = vec![json!({
            "type": "CqlToElmInfo",
            "translatorVersion": env!("CARGO_PKG_VERSION"),
            "translatorOptions": self.options.options_string(),
            "signatureLevel": self.options.signature_level().as_str(),
        })];
        annotations.extend(
            self.diagnostics
                .iter()
                .filter(|d| d.severity >= self.options.error_level())
                .map(CqlDiagnostic::to_annotation),
        );
        annotations
    }

    /// Attach the library identifier and, if requested, the offending source.
    fn finish_diagnostics(&mut self) {
        let detailed = self.options.has(CompilerOption::EnableDetailedErrors);
        for diagnostic in &mut self.diagnostics {
            if diagnostic.library.is_none() {
                diagnostic.library = self.identifier.clone();
            }
            if detailed && let Some(locator) = diagnostic.locator {
                let excerpt = excerpt(self.source, locator);
                let first_line = excerpt.lines().next().unwrap_or_default().trim();
                if !first_line.is_empty() {
                    diagnostic.message = format!("{} ({locator}: {first_line})", diagnostic.message);
                }
            }
        }
    }

    fn exports(&self) -> LibraryExports {
        let mut symbols = self.symbols.clone();
        for (name, symbol) in &mut symbols {
            if symbol.kind == SymbolKind::Expression
                && let Some(DefState::Done(_, ty)) = self.expressions.get(name)
            {
                symbol.result_type = ty.clone();
            }
        }
        LibraryExports {
            symbols,
            functions: self.functions.clone(),
        }
    }

    fn next_local_id(&mut self) -> Option<String> {
        if !self.options.has(CompilerOption::EnableAnnotations) {
            return None;
        }
        self.next_local_id += 1;
        Some(self.next_local_id.to_string())
    }

    fn header(&self, local_id: Option<String>, locator: Locator, ty: Option<&DataType>) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(local_id) = local_id {
            map.insert("localId".into(), json!(local_id));
        }
        if self.options.has(CompilerOption::EnableLocators) {
            map.insert("locator".into(), json!(locator.to_string()));
        }
        if self.options.has(CompilerOption::EnableResultTypes) {
            match ty {
                Some(DataType::Named(name)) => {
                    map.insert("resultTypeName".into(), json!(name));
                }
                Some(other) => {
                    map.insert("resultTypeSpecifier".into(), other.to_specifier());
                }
                None => {}
            }
        }
        map
    }

    fn node(
        &mut self,
        elm_type: &str,
        locator: Locator,
        ty: Option<&DataType>,
        fields: Vec<(&str, Value)>,
    ) -> Value {
        let local_id = self.next_local_id();
        let mut map = self.header(local_id, locator, ty);
        for (key, value) in fields {
            map.insert(key.into(), value);
        }
        map.insert("type".into(), json!(elm_type));
        Value::Object(map)
    }

    fn typed(&mut self, elm_type: &str, locator: Locator, ty: Option<DataType>, fields: Vec<(&str, Value)>) -> Typed {
        let elm = self.node(elm_type, locator, ty.as_ref(), fields);
        Typed { elm, ty, locator }
    }

    fn null(&mut self, locator: Locator) -> Typed {
        self.typed("Null", locator, None, Vec::new())
    }

    fn narrative(&self, local_id: &Option<String>, locator: Locator) -> Option<Value> {
        let local_id = local_id.as_ref()?;
        Some(json!([{
            "type": "Annotation",
            "s": { "r": local_id, "s": [{ "value": [excerpt(self.source, locator)] }] },
        }]))
    }

    // Declarations

    fn declare(&mut self, name: &str, symbol: Symbol, locator: Locator) -> bool {
        if self.symbols.contains_key(name) {
            self.error(
                ErrorType::Semantic,
                format!("Identifier {name} is already in use in this library."),
                locator,
            );
            return false;
        }
        self.symbols.insert(name.to_string(), symbol);
        true
    }

    fn declare_symbols(&mut self) {
        let ast = self.ast;

        for (i, decl) in ast.terminology.iter().enumerate() {
            let kind = match decl.kind {
                TerminologyKind::CodeSystem { .. } => SymbolKind::CodeSystem,
                TerminologyKind::ValueSet { .. } => SymbolKind::ValueSet,
                TerminologyKind::Code { .. } => SymbolKind::Code,
                TerminologyKind::Concept { .. } => SymbolKind::Concept,
            };
            let type_name = match kind {
                SymbolKind::CodeSystem => "CodeSystem",
                SymbolKind::ValueSet => "ValueSet",
                SymbolKind::Code => "Code",
                _ => "Concept",
            };
            let symbol = Symbol {
                kind,
                access: decl.access,
                result_type: Some(DataType::system(type_name)),
            };
            if self.declare(&decl.name, symbol, decl.locator) {
                self.accepted_terminology.push(i);
            }
        }

        for (i, decl) in ast.parameters.iter().enumerate() {
            let result_type = decl
                .type_spec
                .as_ref()
                .map(|spec| self.resolve_type(spec, decl.locator));
            let symbol = Symbol {
                kind: SymbolKind::Parameter,
                access: decl.access,
                result_type,
            };
            if self.declare(&decl.name, symbol, decl.locator) {
                self.accepted_parameters.push(i);
            }
        }

        for (i, decl) in ast.expressions.iter().enumerate() {
            let symbol = Symbol {
                kind: SymbolKind::Expression,
                access: decl.access,
                result_type: None,
            };
            if self.declare(&decl.name, symbol, decl.locator) {
                self.accepted_expressions.push(i);
            }
        }

        for context in &ast.contexts {
            self.declare_context(context);
        }
    }

    /// Each model context gets an implicit definition of the context subject.
    fn declare_context(&mut self, context: &ContextDecl) {
        if context.name == "Unfiltered" || self.expressions.contains_key(&context.name) {
            return;
        }
        let Some((_, model)) = self.models.first().cloned() else {
            self.error(
                ErrorType::Semantic,
                format!("Could not resolve context name {} in model System.", context.name),
                context.locator,
            );
            return;
        };
        if self.symbols.contains_key(&context.name) {
            return;
        }

        let ty = DataType::model(&model.uri, &context.name);
        let mut retrieve = Map::new();
        retrieve.insert("dataType".into(), json!(format!("{{{}}}{}", model.uri, context.name)));
        if model.uri == FHIR_MODEL_URI {
            retrieve.insert(
                "templateId".into(),
                json!(format!("{FHIR_MODEL_URI}/StructureDefinition/{}", context.name)),
            );
        }
        retrieve.insert("type".into(), json!("Retrieve"));

        let local_id = self.next_local_id();
        let mut def = self.header(local_id, context.locator, Some(&ty));
        def.insert("name".into(), json!(context.name));
        def.insert("context".into(), json!(context.name));
        def.insert(
            "expression".into(),
            json!({ "type": "SingletonFrom", "operand": Value::Object(retrieve) }),
        );

        self.symbols.insert(
            context.name.clone(),
            Symbol {
                kind: SymbolKind::Expression,
                access: AccessLevel::Public,
                result_type: Some(ty.clone()),
            },
        );
        self.expressions
            .insert(context.name.clone(), DefState::Done(Value::Object(def), Some(ty)));
        self.context_defs.push((context.locator, context.name.clone()));
    }

    fn declare_functions(&mut self) {
        let ast = self.ast;
        for (i, decl) in ast.functions.iter().enumerate() {
            let operand_types: Vec<DataType> = decl
                .operands
                .iter()
                .map(|o| self.resolve_type(&o.type_spec, decl.locator))
                .collect();
            let result_type = decl
                .returns
                .as_ref()
                .map(|spec| self.resolve_type(spec, decl.locator));

            let duplicate = self
                .functions
                .iter()
                .any(|f| f.name == decl.name && f.operand_types == operand_types);
            if duplicate {
                self.error(
                    ErrorType::Semantic,
                    format!(
                        "A function named {} with the same type of arguments is already defined in this library.",
                        decl.name
                    ),
                    decl.locator,
                );
                continue;
            }

            self.functions.push(FunctionSignature {
                name: decl.name.clone(),
                access: decl.access,
                fluent: decl.fluent,
                operand_types,
                result_type,
            });
            self.function_decls.push(i);
        }
    }

    fn resolve_type(&mut self, spec: &TypeSpec, locator: Locator) -> DataType {
        match spec {
            TypeSpec::Named {
                qualifier: None,
                name,
            } => {
                if SYSTEM_TYPES.contains(&name.as_str()) {
                    DataType::system(name)
                } else if let Some((_, model)) = self.models.first() {
                    DataType::model(&model.uri, name)
                } else {
                    self.error(
                        ErrorType::Semantic,
                        format!("Could not resolve type name {name}."),
                        locator,
                    );
                    DataType::system("Any")
                }
            }
            TypeSpec::Named {
                qualifier: Some(qualifier),
                name,
            } => {
                if qualifier == "System" && SYSTEM_TYPES.contains(&name.as_str()) {
                    return DataType::system(name);
                }
                match self.models.iter().find(|(local, _)| local == qualifier) {
                    Some((_, model)) => DataType::model(&model.uri, name),
                    None => {
                        self.error(
                            ErrorType::Semantic,
                            format!("Could not resolve type name {qualifier}.{name}."),
                            locator,
                        );
                        DataType::system("Any")
                    }
                }
            }
            TypeSpec::List(element) => DataType::List(Box::new(self.resolve_type(element, locator))),
            TypeSpec::Interval(point) => DataType::Interval(Box::new(self.resolve_type(point, locator))),
            TypeSpec::Opaque(text) => {
                self.warning(
                    format!("Type specifier {text} is not supported and is treated as System.Any."),
                    locator,
                );
                DataType::system("Any")
            }
        }
    }

    // Definitions

    fn terminology_defs(&mut self, select: impl Fn(&TerminologyKind) -> bool) -> Vec<Value> {
        let ast = self.ast;
        let mut defs = Vec::new();

        for &i in &self.accepted_terminology.clone() {
            let decl = &ast.terminology[i];
            if !select(&decl.kind) {
                continue;
            }
            let local_id = self.next_local_id();
            let mut def = self.header(local_id, decl.locator, None);
            def.insert("name".into(), json!(decl.name));

            match &decl.kind {
                TerminologyKind::CodeSystem { id, version } | TerminologyKind::ValueSet { id, version } => {
                    def.insert("id".into(), json!(id));
                    if let Some(version) = version {
                        def.insert("version".into(), json!(version));
                    }
                    def.insert("accessLevel".into(), json!(decl.access.as_str()));
                }
                TerminologyKind::Code {
                    id,
                    system,
                    display,
                } => {
                    self.expect_symbol(system, SymbolKind::CodeSystem, "code system", decl.locator);
                    def.insert("id".into(), json!(id));
                    if let Some(display) = display {
                        def.insert("display".into(), json!(display));
                    }
                    def.insert("accessLevel".into(), json!(decl.access.as_str()));
                    def.insert("codeSystem".into(), json!({ "name": system }));
                }
                TerminologyKind::Concept { codes, display } => {
                    for code in codes {
                        self.expect_symbol(code, SymbolKind::Code, "code", decl.locator);
                    }
                    if let Some(display) = display {
                        def.insert("display".into(), json!(display));
                    }
                    def.insert("accessLevel".into(), json!(decl.access.as_str()));
                    let refs: Vec<Value> = codes.iter().map(|c| json!({ "name": c })).collect();
                    def.insert("code".into(), Value::Array(refs));
                }
            }
            defs.push(Value::Object(def));
        }
        defs
    }

    fn expect_symbol(&mut self, name: &str, kind: SymbolKind, what: &str, locator: Locator) {
        if self.symbols.get(name).map(|s| s.kind) != Some(kind) {
            self.error(
                ErrorType::Semantic,
                format!("Could not resolve {what} reference {name}."),
                locator,
            );
        }
    }

    fn parameter_defs(&mut self) -> Vec<Value> {
        let ast = self.ast;
        let mut defs = Vec::new();

        for &i in &self.accepted_parameters.clone() {
            let decl = &ast.parameters[i];
            let local_id = self.next_local_id();
            let declared = self.symbols.get(&decl.name).and_then(|s| s.result_type.clone());

            let default = match &decl.default {
                Some(Body::Parsed(expr)) => Some(self.expr(expr)),
                Some(Body::Unsupported { construct, locator }) => {
                    self.unsupported(&decl.name, construct, *locator);
                    None
                }
                None => None,
            };
            let result_type = declared.clone().or_else(|| default.as_ref().and_then(|d| d.ty.clone()));
            if let Some(symbol) = self.symbols.get_mut(&decl.name) {
                symbol.result_type = result_type.clone();
            }

            let mut def = self.header(local_id, decl.locator, result_type.as_ref());
            def.insert("name".into(), json!(decl.name));
            def.insert("accessLevel".into(), json!(decl.access.as_str()));
            if let Some(default) = default {
                def.insert("default".into(), default.elm);
            }
            if let Some(declared) = declared {
                def.insert("parameterTypeSpecifier".into(), declared.to_specifier());
            }
            defs.push(Value::Object(def));
        }
        defs
    }

    fn unsupported(&mut self, name: &str, construct: &str, locator: Locator) {
        self.warning(
            format!(
                "Expression of {name} was omitted: constructs starting at '{construct}' are not supported."
            ),
            locator,
        );
    }

    fn statement_defs(&mut self) -> Vec<Value> {
        let ast = self.ast;
        let mut statements: Vec<(Locator, Value)> = Vec::new();

        for (locator, name) in self.context_defs.clone() {
            if let Some(DefState::Done(def, _)) = self.expressions.get(&name) {
                statements.push((locator, def.clone()));
            }
        }

        for &i in &self.accepted_expressions.clone() {
            let decl = &ast.expressions[i];
            self.expression_result(&decl.name);
            if let Some(DefState::Done(def, _)) = self.expressions.get(&decl.name) {
                statements.push((decl.locator, def.clone()));
            }
        }

        for index in 0..self.functions.len() {
            let decl = &ast.functions[self.function_decls[index]];
            let def = self.function_def(index, decl);
            statements.push((decl.locator, def));
        }

        statements.sort_by_key(|(locator, _)| (locator.start_line, locator.start_char));
        statements.into_iter().map(|(_, def)| def).collect()
    }

    /// Result type of a named expression, translating it on first use.
    fn expression_result(&mut self, name: &str) -> Option<DataType> {
        match self.expressions.get(name) {
            Some(DefState::Done(_, ty)) => return ty.clone(),
            Some(DefState::InProgress) => return None,
            None => {}
        }
        let ast = self.ast;
        let index = self
            .accepted_expressions
            .iter()
            .copied()
            .find(|&i| ast.expressions[i].name == name)?;
        let decl = &ast.expressions[index];

        self.expressions.insert(name.to_string(), DefState::InProgress);
        let outer_operands = std::mem::take(&mut self.operands);

        let local_id = self.next_local_id();
        let body = match &decl.body {
            Body::Parsed(expr) => Some(self.expr(expr)),
            Body::Unsupported { construct, locator } => {
                self.unsupported(&decl.name, construct, *locator);
                None
            }
        };
        self.operands = outer_operands;

        let ty = body.as_ref().and_then(|b| b.ty.clone());
        let narrative = self.narrative(&local_id, decl.locator);
        let mut def = self.header(local_id, decl.locator, ty.as_ref());
        def.insert("name".into(), json!(decl.name));
        def.insert("context".into(), json!(decl.context));
        def.insert("accessLevel".into(), json!(decl.access.as_str()));
        if let Some(narrative) = narrative {
            def.insert("annotation".into(), narrative);
        }
        if let Some(body) = body {
            def.insert("expression".into(), body.elm);
        }

        self.expressions
            .insert(name.to_string(), DefState::Done(Value::Object(def), ty.clone()));
        ty
    }

    fn function_def(&mut self, index: usize, decl: &FunctionDecl) -> Value {
        let signature = self.functions[index].clone();
        let local_id = self.next_local_id();

        self.operands = decl
            .operands
            .iter()
            .zip(&signature.operand_types)
            .map(|(o, ty)| (o.name.clone(), ty.clone()))
            .collect();
        let body = match &decl.body {
            Some(Body::Parsed(expr)) => Some(self.expr(expr)),
            Some(Body::Unsupported { construct, locator }) => {
                self.unsupported(&decl.name, construct, *locator);
                None
            }
            None => None,
        };
        self.operands.clear();

        let ty = signature
            .result_type
            .clone()
            .or_else(|| body.as_ref().and_then(|b| b.ty.clone()));
        self.functions[index].result_type = ty.clone();

        let narrative = self.narrative(&local_id, decl.locator);
        let mut def = self.header(local_id, decl.locator, ty.as_ref());
        def.insert("name".into(), json!(decl.name));
        def.insert("context".into(), json!(decl.context));
        def.insert("accessLevel".into(), json!(decl.access.as_str()));
        if decl.fluent {
            def.insert("fluent".into(), json!(true));
        }
        if decl.body.is_none() {
            def.insert("external".into(), json!(true));
        }
        if let Some(narrative) = narrative {
            def.insert("annotation".into(), narrative);
        }
        let operands: Vec<Value> = decl
            .operands
            .iter()
            .zip(&signature.operand_types)
            .map(|(o, ty)| json!({ "name": o.name, "operandTypeSpecifier": ty.to_specifier() }))
            .collect();
        def.insert("operand".into(), Value::Array(operands));
        if let Some(body) = body {
            def.insert("expression".into(), body.elm);
        }
        def.insert("type".into(), json!("FunctionDef"));
        Value::Object(def)
    }

    // Expressions

    fn expr(&mut self, expr: &Expr) -> Typed {
        let locator = expr.locator;
        match &expr.kind {
            ExprKind::Literal { kind, value } => {
                let ty = DataType::system(kind.type_name());
                let value_type = match &ty {
                    DataType::Named(name) => name.clone(),
                    _ => String::new(),
                };
                self.typed(
                    "Literal",
                    locator,
                    Some(ty),
                    vec![("valueType", json!(value_type)), ("value", json!(value))],
                )
            }
            ExprKind::Null => self.null(locator),
            ExprKind::Identifier(name) => self.identifier(name, locator),
            ExprKind::Member { source, name } => {
                if let ExprKind::Identifier(alias) = &source.kind
                    && self.is_library_alias(alias)
                {
                    return self.qualified_reference(alias, name, locator);
                }
                let source = self.expr(source);
                self.typed(
                    "Property",
                    locator,
                    None,
                    vec![("path", json!(name)), ("source", source.elm)],
                )
            }
            ExprKind::Call {
                source: None,
                name,
                args,
            } => {
                let args = args.iter().map(|a| self.expr(a)).collect();
                self.call(name, args, locator)
            }
            ExprKind::Call {
                source: Some(source),
                name,
                args,
            } => {
                if let ExprKind::Identifier(alias) = &source.kind
                    && self.is_library_alias(alias)
                {
                    return self.library_call(alias, name, args, locator);
                }
                self.method_call(source, name, args, locator)
            }
            ExprKind::Unary { op, operand } => self.unary(*op, operand, locator),
            ExprKind::Binary { op, left, right } => self.binary(*op, left, right, locator),
        }
    }

    fn is_local_name(&self, name: &str) -> bool {
        self.operands.iter().any(|(n, _)| n == name) || self.symbols.contains_key(name)
    }

    fn is_library_alias(&self, name: &str) -> bool {
        self.includes.contains_key(name) && !self.is_local_name(name)
    }

    fn identifier(&mut self, name: &str, locator: Locator) -> Typed {
        if let Some((_, ty)) = self.operands.iter().find(|(n, _)| n == name) {
            let ty = ty.clone();
            return self.typed("OperandRef", locator, Some(ty), vec![("name", json!(name))]);
        }

        if let Some(symbol) = self.symbols.get(name).cloned() {
            let ty = match symbol.kind {
                SymbolKind::Expression => {
                    if matches!(self.expressions.get(name), Some(DefState::InProgress)) {
                        self.error(
                            ErrorType::Semantic,
                            format!("Cycle detected in definition of {name}."),
                            locator,
                        );
                        None
                    } else {
                        self.expression_result(name)
                    }
                }
                _ => symbol.result_type,
            };
            return self.typed(symbol.kind.ref_type(), locator, ty, vec![("name", json!(name))]);
        }

        self.error(
            ErrorType::Semantic,
            format!("Could not resolve identifier {name} in the current library."),
            locator,
        );
        self.null(locator)
    }

    fn included(&self, alias: &str) -> Option<Arc<CompiledLibrary>> {
        self.includes.get(alias).cloned().flatten()
    }

    fn qualified_reference(&mut self, alias: &str, name: &str, locator: Locator) -> Typed {
        // Failed includes were already reported
        let Some(library) = self.included(alias) else {
            return self.null(locator);
        };

        match library.exports().symbols.get(name).cloned() {
            None => {
                self.error(
                    ErrorType::Semantic,
                    format!("Could not resolve identifier {name} in library {alias}."),
                    locator,
                );
                self.null(locator)
            }
            Some(symbol) if symbol.access == AccessLevel::Private => {
                self.private_reference(alias, name, locator);
                self.null(locator)
            }
            Some(symbol) => self.typed(
                symbol.kind.ref_type(),
                locator,
                symbol.result_type,
                vec![("name", json!(name)), ("libraryName", json!(alias))],
            ),
        }
    }

    fn private_reference(&mut self, alias: &str, name: &str, locator: Locator) {
        self.error(
            ErrorType::Semantic,
            format!(
                "Identifier {name} in library {alias} is marked private and cannot be referenced from another library."
            ),
            locator,
        );
    }

    fn signature_error(&mut self, name: &str, operands: &[&Typed], locator: Locator) {
        let types: Vec<String> = operands
            .iter()
            .map(|o| o.ty.as_ref().map_or_else(|| "System.Any".to_string(), DataType::to_string))
            .collect();
        self.error(
            ErrorType::Semantic,
            format!(
                "Could not resolve call to operator {name} with signature ({}).",
                types.join(",")
            ),
            locator,
        );
    }

    /// Signature for a system operator call, if the signature level asks for one.
    fn operator_signature(&self, operands: &[&Typed], converted: bool) -> Option<Value> {
        let emit = match self.options.signature_level() {
            SignatureLevel::All | SignatureLevel::Overloads => true,
            SignatureLevel::Differing => converted,
            SignatureLevel::None => false,
        };
        if !emit {
            return None;
        }
        operands
            .iter()
            .map(|o| o.ty.as_ref().map(DataType::to_specifier))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array)
    }

    fn convert(&mut self, operand: Typed, operator: &str, target: &DataType) -> Typed {
        let locator = operand.locator;
        self.typed(
            operator,
            locator,
            Some(target.clone()),
            vec![("operand", operand.elm)],
        )
    }

    fn system_unary(&mut self, name: &str, operand: Typed, locator: Locator, ty: Option<DataType>) -> Typed {
        let mut fields = Vec::new();
        if let Some(signature) = self.operator_signature(&[&operand], false) {
            fields.push(("signature", signature));
        }
        fields.push(("operand", operand.elm));
        self.typed(name, locator, ty, fields)
    }

    fn system_nary(
        &mut self,
        name: &str,
        operands: Vec<Typed>,
        locator: Locator,
        ty: Option<DataType>,
        converted: bool,
    ) -> Typed {
        let mut fields = Vec::new();
        let refs: Vec<&Typed> = operands.iter().collect();
        if let Some(signature) = self.operator_signature(&refs, converted) {
            fields.push(("signature", signature));
        }
        let elms: Vec<Value> = operands.into_iter().map(|o| o.elm).collect();
        fields.push(("operand", Value::Array(elms)));
        self.typed(name, locator, ty, fields)
    }

    fn unary(&mut self, op: UnaryOp, operand: &Expr, locator: Locator) -> Typed {
        let operand = self.expr(operand);
        let boolean = Some(DataType::system("Boolean"));

        match op {
            UnaryOp::Not => {
                if operand.ty.as_ref().is_some_and(|t| !t.is_system("Boolean")) {
                    self.signature_error("Not", &[&operand], locator);
                }
                self.system_unary("Not", operand, locator, boolean)
            }
            UnaryOp::Exists => self.system_unary("Exists", operand, locator, boolean),
            UnaryOp::Negate => {
                if operand.ty.as_ref().is_some_and(|t| !t.is_numeric()) {
                    self.signature_error("Negate", &[&operand], locator);
                }
                let ty = operand.ty.clone();
                self.system_unary("Negate", operand, locator, ty)
            }
            UnaryOp::IsNull => self.system_unary("IsNull", operand, locator, boolean),
            UnaryOp::IsTrue => self.system_unary("IsTrue", operand, locator, boolean),
            UnaryOp::IsFalse => self.system_unary("IsFalse", operand, locator, boolean),
            UnaryOp::IsNotNull => {
                let is_null = self.system_unary("IsNull", operand, locator, boolean.clone());
                self.system_unary("Not", is_null, locator, boolean)
            }
        }
    }

    /// Bring both operands to a common type, inserting implicit conversions.
    ///
    /// Returns the operands, the common type if known, and whether a
    /// conversion was inserted; `Err` when no common type exists.
    fn unify(&mut self, left: Typed, right: Typed) -> Result<(Typed, Typed, Option<DataType>, bool), (Typed, Typed)> {
        match (left.ty.clone(), right.ty.clone()) {
            (Some(l), Some(r)) if l == r => Ok((left, right, Some(l), false)),
            (Some(l), Some(r)) => {
                if let Some(conversion) = implicit_conversion(&l, &r) {
                    let left = match conversion {
                        Some(operator) => self.convert(left, operator, &r),
                        None => left,
                    };
                    Ok((left, right, Some(r), conversion.is_some()))
                } else if let Some(conversion) = implicit_conversion(&r, &l) {
                    let right = match conversion {
                        Some(operator) => self.convert(right, operator, &l),
                        None => right,
                    };
                    Ok((left, right, Some(l), conversion.is_some()))
                } else {
                    Err((left, right))
                }
            }
            (Some(t), None) | (None, Some(t)) => Ok((left, right, Some(t), false)),
            (None, None) => Ok((left, right, None, false)),
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, locator: Locator) -> Typed {
        let left = self.expr(left);
        let right = self.expr(right);
        let boolean = Some(DataType::system("Boolean"));
        let is = |t: &Typed, name: &str| t.ty.as_ref().is_none_or(|ty| ty.is_system(name));

        match op {
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor | BinaryOp::Implies => {
                let name = match op {
                    BinaryOp::And => "And",
                    BinaryOp::Or => "Or",
                    BinaryOp::Xor => "Xor",
                    _ => "Implies",
                };
                if !is(&left, "Boolean") || !is(&right, "Boolean") {
                    self.signature_error(name, &[&left, &right], locator);
                }
                self.system_nary(name, vec![left, right], locator, boolean, false)
            }
            BinaryOp::Equal | BinaryOp::NotEqual | BinaryOp::Equivalent | BinaryOp::NotEquivalent => {
                let name = match op {
                    BinaryOp::Equal | BinaryOp::NotEqual => "Equal",
                    _ => "Equivalent",
                };
                let comparison = match self.unify(left, right) {
                    Ok((l, r, _, converted)) => self.system_nary(name, vec![l, r], locator, boolean.clone(), converted),
                    Err((l, r)) => {
                        self.signature_error(name, &[&l, &r], locator);
                        self.system_nary(name, vec![l, r], locator, boolean.clone(), false)
                    }
                };
                if matches!(op, BinaryOp::NotEqual | BinaryOp::NotEquivalent) {
                    self.system_unary("Not", comparison, locator, boolean)
                } else {
                    comparison
                }
            }
            BinaryOp::Less | BinaryOp::LessOrEqual | BinaryOp::Greater | BinaryOp::GreaterOrEqual => {
                let name = match op {
                    BinaryOp::Less => "Less",
                    BinaryOp::LessOrEqual => "LessOrEqual",
                    BinaryOp::Greater => "Greater",
                    _ => "GreaterOrEqual",
                };
                match self.unify(left, right) {
                    Ok((l, r, ty, converted)) => {
                        if ty.as_ref().is_some_and(|t| !t.is_ordered()) {
                            self.signature_error(name, &[&l, &r], locator);
                        }
                        self.system_nary(name, vec![l, r], locator, boolean, converted)
                    }
                    Err((l, r)) => {
                        self.signature_error(name, &[&l, &r], locator);
                        self.system_nary(name, vec![l, r], locator, boolean, false)
                    }
                }
            }
            BinaryOp::Add if left.ty.is_some() && is(&left, "String") && is(&right, "String") => {
                let string = Some(DataType::system("String"));
                self.system_nary("Concatenate", vec![left, right], locator, string, false)
            }
            BinaryOp::Concatenate => {
                if !is(&left, "String") || !is(&right, "String") {
                    self.signature_error("Concatenate", &[&left, &right], locator);
                }
                let string = Some(DataType::system("String"));
                self.system_nary("Concatenate", vec![left, right], locator, string, false)
            }
            BinaryOp::Divide => {
                let decimal = DataType::system("Decimal");
                if !left.ty.as_ref().is_none_or(DataType::is_numeric)
                    || !right.ty.as_ref().is_none_or(DataType::is_numeric)
                {
                    self.signature_error("Divide", &[&left, &right], locator);
                    return self.system_nary("Divide", vec![left, right], locator, None, false);
                }
                let mut converted = false;
                let mut operands = Vec::new();
                for operand in [left, right] {
                    match operand.ty.as_ref().and_then(|t| implicit_conversion(t, &decimal)) {
                        Some(Some(operator)) => {
                            converted = true;
                            operands.push(self.convert(operand, operator, &decimal));
                        }
                        _ => operands.push(operand),
                    }
                }
                self.system_nary("Divide", operands, locator, Some(decimal), converted)
            }
            _ => {
                let name = match op {
                    BinaryOp::Add => "Add",
                    BinaryOp::Subtract => "Subtract",
                    BinaryOp::Multiply => "Multiply",
                    BinaryOp::TruncatedDivide => "TruncatedDivide",
                    BinaryOp::Modulo => "Modulo",
                    _ => "Power",
                };
                match self.unify(left, right) {
                    Ok((l, r, ty, converted)) => {
                        if ty.as_ref().is_some_and(|t| !t.is_numeric()) {
                            self.signature_error(name, &[&l, &r], locator);
                        }
                        self.system_nary(name, vec![l, r], locator, ty, converted)
                    }
                    Err((l, r)) => {
                        self.signature_error(name, &[&l, &r], locator);
                        self.system_nary(name, vec![l, r], locator, None, false)
                    }
                }
            }
        }
    }

    fn call(&mut self, name: &str, args: Vec<Typed>, locator: Locator) -> Typed {
        let candidates: Vec<FunctionSignature> = self
            .functions
            .iter()
            .filter(|f| f.name == name)
            .cloned()
            .collect();
        if let Some(function) = select_overload(&candidates, &args) {
            return self.function_ref(None, &function, candidates.len() > 1, args, locator);
        }

        if let Some(function) = system_function(name, args.len()) {
            return self.system_call(function, args, locator);
        }

        let refs: Vec<&Typed> = args.iter().collect();
        self.signature_error(name, &refs, locator);
        self.null(locator)
    }

    fn method_call(&mut self, source: &Expr, name: &str, args: &[Expr], locator: Locator) -> Typed {
        let mut operands = vec![self.expr(source)];
        for arg in args {
            operands.push(self.expr(arg));
        }

        let fluent: Vec<FunctionSignature> = self
            .functions
            .iter()
            .filter(|f| f.fluent && f.name == name)
            .cloned()
            .collect();
        if let Some(function) = select_overload(&fluent, &operands) {
            let overloaded = self.functions.iter().filter(|f| f.name == name).count() > 1;
            return self.function_ref(None, &function, overloaded, operands, locator);
        }

        if self.options.has(CompilerOption::DisableMethodInvocation) {
            self.error(
                ErrorType::Semantic,
                format!("Could not resolve method {name}: method invocation is disabled."),
                locator,
            );
            return self.null(locator);
        }
        self.call(name, operands, locator)
    }

    fn library_call(&mut self, alias: &str, name: &str, args: &[Expr], locator: Locator) -> Typed {
        let args: Vec<Typed> = args.iter().map(|a| self.expr(a)).collect();
        let Some(library) = self.included(alias) else {
            return self.null(locator);
        };

        let candidates: Vec<FunctionSignature> = library
            .exports()
            .functions
            .iter()
            .filter(|f| f.name == name)
            .cloned()
            .collect();
        match select_overload(&candidates, &args) {
            Some(function) if function.access == AccessLevel::Private => {
                self.private_reference(alias, name, locator);
                self.null(locator)
            }
            Some(function) => self.function_ref(Some(alias), &function, candidates.len() > 1, args, locator),
            None => {
                let refs: Vec<&Typed> = args.iter().collect();
                self.signature_error(&format!("{alias}.{name}"), &refs, locator);
                self.null(locator)
            }
        }
    }

    fn function_ref(
        &mut self,
        library: Option<&str>,
        function: &FunctionSignature,
        overloaded: bool,
        args: Vec<Typed>,
        locator: Locator,
    ) -> Typed {
        let mut differing = false;
        let mut operands = Vec::with_capacity(args.len());
        for (arg, declared) in args.into_iter().zip(&function.operand_types) {
            let conversion = match arg.ty.as_ref() {
                Some(actual) if actual != declared => {
                    differing = true;
                    implicit_conversion(actual, declared).flatten()
                }
                _ => None,
            };
            match conversion {
                Some(operator) => operands.push(self.convert(arg, operator, declared).elm),
                None => operands.push(arg.elm),
            }
        }

        let emit_signature = match self.options.signature_level() {
            SignatureLevel::All => true,
            SignatureLevel::Overloads => overloaded,
            SignatureLevel::Differing => differing,
            SignatureLevel::None => false,
        };

        let mut fields = vec![("name", json!(function.name))];
        if let Some(library) = library {
            fields.push(("libraryName", json!(library)));
        }
        if emit_signature {
            let signature: Vec<Value> = function.operand_types.iter().map(DataType::to_specifier).collect();
            fields.push(("signature", Value::Array(signature)));
        }
        fields.push(("operand", Value::Array(operands)));
        self.typed("FunctionRef", locator, function.result_type.clone(), fields)
    }

    fn system_call(&mut self, function: &SystemFunction, args: Vec<Typed>, locator: Locator) -> Typed {
        let ty = match function.result {
            ResultRule::Fixed(name) => Some(DataType::system(name)),
            ResultRule::FirstOperand => args.first().and_then(|a| a.ty.clone()),
        };
        match function.shape {
            Shape::Nullary => self.typed(function.name, locator, ty, Vec::new()),
            Shape::Unary => match args.into_iter().next() {
                Some(operand) => self.system_unary(function.name, operand, locator, ty),
                None => self.null(locator),
            },
            Shape::Nary => self.system_nary(function.name, args, locator, ty, false),
        }
    }
}

/// Best matching overload for the given arguments.
///
/// Exact matches beat unknown argument types, which beat implicit
/// conversions; ties go to the earliest declaration.
fn select_overload(candidates: &[FunctionSignature], args: &[Typed]) -> Option<FunctionSignature> {
    candidates
        .iter()
        .filter(|f| f.operand_types.len() == args.len())
        .filter_map(|f| {
            let mut cost = 0u32;
            for (arg, declared) in args.iter().zip(&f.operand_types) {
                cost += match &arg.ty {
                    None => 1,
                    Some(actual) if actual == declared => 0,
                    Some(actual) => match implicit_conversion(actual, declared) {
                        Some(Some(_)) => 2,
                        Some(None) => 3,
                        None => return None,
                    },
                };
            }
            Some((cost, f))
        })
        .min_by_key(|(cost, _)| *cost)
        .map(|(_, f)| f.clone())
}

/// Source text covered by `locator`.
fn excerpt(source: &str, locator: Locator) -> String {
    let mut lines = Vec::new();
    for (i, line) in source.lines().enumerate() {
        let number = i + 1;
        if number < locator.start_line || number > locator.end_line {
            continue;
        }
        let chars: Vec<char> = line.chars().collect();
        let to = if number == locator.end_line {
            locator.end_char.min(chars.len())
        } else {
            chars.len()
        };
        let from = if number == locator.start_line {
            locator.start_char.saturating_sub(1).min(to)
        } else {
            0
        };
        lines.push(chars[from..to].iter().collect::<String>());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{CompilerOptions, RequestParams, resolve};
    use crate::source::StringLibrarySourceProvider;

    fn session_with(params: &[(&str, &str)]) -> TranslationSession {
        let params: RequestParams = params.iter().copied().collect();
        TranslationSession::new(resolve(&params).unwrap(), Arc::new(ElmTranslator))
    }

    fn compile(source: &str) -> CompiledLibrary {
        let mut session = TranslationSession::new(CompilerOptions::default(), Arc::new(ElmTranslator));
        ElmTranslator.compile(source, &mut session)
    }

    fn statement<'v>(library: &'v CompiledLibrary, name: &str) -> &'v Value {
        library.elm()["library"]["statements"]["def"]
            .as_array()
            .and_then(|defs| defs.iter().find(|d| d["name"] == name))
            .unwrap_or_else(|| panic!("no statement {name}"))
    }

    fn error_messages(library: &CompiledLibrary) -> Vec<String> {
        library
            .diagnostics()
            .iter()
            .filter(|d| d.is_error())
            .map(|d| d.message.clone())
            .collect()
    }

    #[test]
    fn test_library_header_and_usings() {
        let library = compile(
            "library Example version '1.0.0'\n\
             using FHIR version '4.0.1'\n\
             context Patient\n\
             define \"Is Adult\": true\n",
        );
        assert!(!library.has_errors(), "{:?}", library.diagnostics());

        let elm = &library.elm()["library"];
        assert_eq!(elm["identifier"]["id"], "Example");
        assert_eq!(elm["identifier"]["version"], "1.0.0");
        assert_eq!(elm["schemaIdentifier"]["id"], "urn:hl7-org:elm");
        assert_eq!(elm["usings"]["def"][0]["localIdentifier"], "System");
        assert_eq!(elm["usings"]["def"][1]["uri"], "http://hl7.org/fhir");

        let patient = statement(&library, "Patient");
        assert_eq!(patient["expression"]["type"], "SingletonFrom");
        assert_eq!(patient["expression"]["operand"]["dataType"], "{http://hl7.org/fhir}Patient");

        let adult = statement(&library, "Is Adult");
        assert_eq!(adult["context"], "Patient");
        assert_eq!(adult["expression"]["type"], "Literal");
        assert_eq!(adult["expression"]["valueType"], "{urn:hl7-org:elm-types:r1}Boolean");
    }

    #[test]
    fn test_translator_info_annotation() {
        let mut session = session_with(&[("locators", "true"), ("signatures", "All")]);
        let library = ElmTranslator.compile("library A\ndefine X: 1", &mut session);
        let info = &library.elm()["library"]["annotation"][0];
        assert_eq!(info["type"], "CqlToElmInfo");
        assert_eq!(info["translatorOptions"], "EnableLocators");
        assert_eq!(info["signatureLevel"], "All");
    }

    #[test]
    fn test_unresolved_identifier_is_an_error_annotation() {
        let library = compile("library A\ndefine X: Y + 1");
        assert_eq!(
            error_messages(&library),
            vec!["Could not resolve identifier Y in the current library."]
        );
        let annotation = &library.elm()["library"]["annotation"][1];
        assert_eq!(annotation["type"], "CqlToElmError");
        assert_eq!(annotation["libraryId"], "A");
        assert_eq!(annotation["startLine"], 2);
        assert_eq!(annotation["errorType"], "semantic");
    }

    #[test]
    fn test_forward_references_and_result_types() {
        let mut session = session_with(&[("result-types", "true")]);
        let library = ElmTranslator.compile("define A: B * 2\ndefine B: 1.5", &mut session);
        assert!(!library.has_errors());

        let a = statement(&library, "A");
        assert_eq!(a["resultTypeName"], "{urn:hl7-org:elm-types:r1}Decimal");
        // integer operand promoted to decimal
        assert_eq!(a["expression"]["operand"][1]["type"], "ToDecimal");
        assert_eq!(a["expression"]["operand"][0]["type"], "ExpressionRef");
    }

    #[test]
    fn test_operator_type_mismatch() {
        let library = compile("define X: 1 + 'a'");
        assert_eq!(
            error_messages(&library),
            vec!["Could not resolve call to operator Add with signature (System.Integer,System.String)."]
        );
    }

    #[test]
    fn test_string_addition_is_concatenation() {
        let library = compile("define X: 'a' + 'b'\ndefine Y: 'a' & 'b'");
        assert!(!library.has_errors());
        assert_eq!(statement(&library, "X")["expression"]["type"], "Concatenate");
        assert_eq!(statement(&library, "Y")["expression"]["type"], "Concatenate");
    }

    #[test]
    fn test_not_equal_wraps_equal() {
        let library = compile("define X: 1 != 2");
        let expression = &statement(&library, "X")["expression"];
        assert_eq!(expression["type"], "Not");
        assert_eq!(expression["operand"]["type"], "Equal");
    }

    #[test]
    fn test_unsupported_body_is_a_warning() {
        let library = compile("library A\nusing FHIR version '4.0.1'\ndefine E: [Encounter]");
        assert!(!library.has_errors());
        assert_eq!(library.diagnostics().len(), 1);
        assert!(statement(&library, "E").get("expression").is_none());
    }

    #[test]
    fn test_duplicate_identifier() {
        let library = compile("define X: 1\ndefine X: 2");
        assert_eq!(
            error_messages(&library),
            vec!["Identifier X is already in use in this library."]
        );
        assert_eq!(library.elm()["library"]["statements"]["def"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_functions_and_overloads() {
        let mut session = session_with(&[("signatures", "Overloads")]);
        let library = ElmTranslator.compile(
            "define function F(x Integer): x + 1\n\
             define function F(x String): x\n\
             define function G(x Integer): x\n\
             define A: F(1)\n\
             define B: G(2)\n",
            &mut session,
        );
        assert!(!library.has_errors(), "{:?}", library.diagnostics());

        let a = &statement(&library, "A")["expression"];
        assert_eq!(a["type"], "FunctionRef");
        assert_eq!(a["signature"][0]["name"], "{urn:hl7-org:elm-types:r1}Integer");
        let b = &statement(&library, "B")["expression"];
        assert!(b.get("signature").is_none());

        let f = statement(&library, "F");
        assert_eq!(f["type"], "FunctionDef");
        assert_eq!(f["operand"][0]["name"], "x");
    }

    #[test]
    fn test_signature_levels() {
        let source = "define function F(x Decimal): x\ndefine A: F(1)\ndefine B: F(1.0)";

        let mut session = session_with(&[("signatures", "Differing")]);
        let library = ElmTranslator.compile(source, &mut session);
        assert!(statement(&library, "A")["expression"].get("signature").is_some());
        assert!(statement(&library, "B")["expression"].get("signature").is_none());

        let mut session = session_with(&[("signatures", "All")]);
        let library = ElmTranslator.compile(source, &mut session);
        assert!(statement(&library, "B")["expression"].get("signature").is_some());

        let mut session = session_with(&[]);
        let library = ElmTranslator.compile(source, &mut session);
        assert!(statement(&library, "A")["expression"].get("signature").is_none());
    }

    #[test]
    fn test_method_invocation() {
        let source = "define function Double(x Integer): x * 2\n\
                      define fluent function Triple(x Integer): x * 3\n\
                      define A: 2.Double()\n\
                      define B: 2.Triple()\n";

        let library = compile(source);
        assert!(!library.has_errors(), "{:?}", library.diagnostics());

        let mut session = session_with(&[("disable-method-invocation", "true")]);
        let library = ElmTranslator.compile(source, &mut session);
        assert_eq!(
            error_messages(&library),
            vec!["Could not resolve method Double: method invocation is disabled."]
        );
    }

    #[test]
    fn test_annotations_and_locators() {
        let mut session = session_with(&[("debug", "true")]);
        let library = ElmTranslator.compile("library A\ndefine X: 1 + 2", &mut session);
        let x = statement(&library, "X");
        assert_eq!(x["locator"], "2:1-2:15");
        assert!(x["localId"].is_string());
        assert_eq!(x["annotation"][0]["s"]["s"][0]["value"][0], "define X: 1 + 2");
        assert_eq!(x["expression"]["locator"], "2:11-2:15");
    }

    #[test]
    fn test_detailed_errors_include_source() {
        let mut session = session_with(&[("detailed-errors", "true")]);
        let library = ElmTranslator.compile("define X: Missing", &mut session);
        assert_eq!(
            error_messages(&library),
            vec!["Could not resolve identifier Missing in the current library. (1:11-1:17: Missing)"]
        );
    }

    #[test]
    fn test_include_resolution() {
        let mut session = session_with(&[]);
        session.register_provider(StringLibrarySourceProvider::new([
            "library Common version '1.0.0'\n\
             define Shared: 42\n\
             private define Hidden: 1\n\
             define function Inc(x Integer): x + 1\n",
        ]));

        let library = ElmTranslator.compile(
            "library Main\n\
             include Common version '1.0.0' called C\n\
             define A: C.Shared\n\
             define B: C.Inc(1)\n\
             define D: C.Hidden\n",
            &mut session,
        );
        assert_eq!(
            error_messages(&library),
            vec!["Identifier Hidden in library C is marked private and cannot be referenced from another library."]
        );

        let a = &statement(&library, "A")["expression"];
        assert_eq!(a["type"], "ExpressionRef");
        assert_eq!(a["libraryName"], "C");
        assert_eq!(statement(&library, "B")["expression"]["type"], "FunctionRef");
        assert_eq!(library.elm()["library"]["includes"]["def"][0]["path"], "Common");
    }

    #[test]
    fn test_missing_include() {
        let library = compile("library Main\ninclude Missing version '2.0.0'\ndefine A: Missing.X");
        assert_eq!(
            error_messages(&library),
            vec!["Could not load source for library Missing, version 2.0.0."]
        );
        assert_eq!(library.diagnostics()[0].error_type, ErrorType::Include);
    }

    #[test]
    fn test_fhir_helpers_is_always_available() {
        let library = compile(
            "library A\nusing FHIR version '4.0.1'\ninclude FHIRHelpers version '4.0.1'\ncontext Patient\n\
             define G: FHIRHelpers.ToString(Patient.gender)",
        );
        assert!(!library.has_errors(), "{:?}", library.diagnostics());
    }

    #[test]
    fn test_terminology_definitions() {
        let library = compile(
            "codesystem \"LOINC\": 'http://loinc.org'\n\
             code \"HbA1c\": '4548-4' from \"LOINC\" display 'Hemoglobin A1c'\n\
             code \"Bad\": '1' from \"Nowhere\"\n\
             concept \"C\": { \"HbA1c\" }\n\
             define X: \"HbA1c\"\n",
        );
        assert_eq!(
            error_messages(&library),
            vec!["Could not resolve code system reference Nowhere."]
        );
        let elm = &library.elm()["library"];
        assert_eq!(elm["codes"]["def"][0]["codeSystem"]["name"], "LOINC");
        assert_eq!(elm["concepts"]["def"][0]["code"][0]["name"], "HbA1c");
        assert_eq!(statement(&library, "X")["expression"]["type"], "CodeRef");
    }

    #[test]
    fn test_excerpt() {
        let source = "line one\ndefine X:\n  1 + 2\n";
        assert_eq!(excerpt(source, Locator::new(2, 1, 3, 7)), "define X:\n  1 + 2");
        assert_eq!(excerpt(source, Locator::new(1, 6, 1, 8)), "one");
    }
}
