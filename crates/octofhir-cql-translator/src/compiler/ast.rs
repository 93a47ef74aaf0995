//! Syntax tree for the supported CQL subset.

use super::diagnostic::Locator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessLevel {
    #[default]
    Public,
    Private,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "Public",
            Self::Private => "Private",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpec {
    Named {
        qualifier: Option<String>,
        name: String,
    },
    List(Box<TypeSpec>),
    Interval(Box<TypeSpec>),
    /// Tuple and choice types are carried through as source text
    Opaque(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LibraryDecl {
    pub name: String,
    pub version: Option<String>,
    pub locator: Locator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsingDecl {
    pub model: String,
    pub version: Option<String>,
    pub alias: Option<String>,
    pub locator: Locator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncludeDecl {
    pub library: String,
    pub version: Option<String>,
    pub alias: Option<String>,
    pub locator: Locator,
}

impl IncludeDecl {
    pub fn local_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.library)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminologyKind {
    CodeSystem { id: String, version: Option<String> },
    ValueSet { id: String, version: Option<String> },
    Code { id: String, system: String, display: Option<String> },
    Concept { codes: Vec<String>, display: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerminologyDecl {
    pub name: String,
    pub access: AccessLevel,
    pub kind: TerminologyKind,
    pub locator: Locator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDecl {
    pub name: String,
    pub access: AccessLevel,
    pub type_spec: Option<TypeSpec>,
    pub default: Option<Body>,
    pub locator: Locator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub name: String,
    pub type_spec: TypeSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub access: AccessLevel,
    pub fluent: bool,
    pub operands: Vec<Operand>,
    pub returns: Option<TypeSpec>,
    /// `None` for `external` functions
    pub body: Option<Body>,
    pub context: String,
    pub locator: Locator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionDecl {
    pub name: String,
    pub access: AccessLevel,
    pub body: Body,
    pub context: String,
    pub locator: Locator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextDecl {
    pub name: String,
    pub locator: Locator,
}

/// Expression text of a definition, parsed if it stays within the subset.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Parsed(Expr),
    Unsupported { construct: String, locator: Locator },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LibraryAst {
    pub library: Option<LibraryDecl>,
    pub usings: Vec<UsingDecl>,
    pub includes: Vec<IncludeDecl>,
    pub terminology: Vec<TerminologyDecl>,
    pub parameters: Vec<ParameterDecl>,
    pub contexts: Vec<ContextDecl>,
    pub expressions: Vec<ExpressionDecl>,
    pub functions: Vec<FunctionDecl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralKind {
    Boolean,
    Integer,
    Decimal,
    String,
}

impl LiteralKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Boolean => "Boolean",
            Self::Integer => "Integer",
            Self::Decimal => "Decimal",
            Self::String => "String",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Exists,
    Negate,
    IsNull,
    IsNotNull,
    IsTrue,
    IsFalse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Implies,
    Or,
    Xor,
    And,
    Equal,
    NotEqual,
    Equivalent,
    NotEquivalent,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Add,
    Subtract,
    Concatenate,
    Multiply,
    Divide,
    TruncatedDivide,
    Modulo,
    Power,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal { kind: LiteralKind, value: String },
    Null,
    Identifier(String),
    Member { source: Box<Expr>, name: String },
    Call {
        source: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub locator: Locator,
    /// Byte range in the source text
    pub span: (usize, usize),
}
