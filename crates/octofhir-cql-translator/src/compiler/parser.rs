//! Statement and expression parser for the supported CQL subset.
//!
//! The token stream is first cut into top-level statements, then each
//! statement is parsed on its own so that one malformed definition does not
//! hide diagnostics in the rest of the library.

use super::ast::*;
use super::diagnostic::{CqlDiagnostic, ErrorType, Locator};
use super::lexer::{Token, TokenKind};

const STATEMENT_KEYWORDS: &[&str] = &[
    "library",
    "using",
    "include",
    "public",
    "private",
    "codesystem",
    "valueset",
    "code",
    "concept",
    "parameter",
    "context",
    "define",
];

const RESERVED_WORDS: &[&str] = &[
    "and", "or", "xor", "implies", "not", "exists", "is", "null", "true", "false", "div", "mod",
];

/// Deepest expression or type nesting accepted. Bounds the recursion of every
/// later pass over the tree.
pub const MAX_NESTING_DEPTH: usize = 256;

const NESTING_TOO_DEEP: &str = "Expression nesting too deep";

const SUBEXPRESSION_COST: usize = 4;

/// Words that open constructs this parser does not translate.
const UNSUPPORTED_WORDS: &[&str] = &[
    "where", "such", "that", "with", "without", "return", "let", "sort", "aggregate", "if",
    "case", "from", "in", "contains", "during", "properly", "included", "includes", "starts",
    "ends", "occurs", "overlaps", "meets", "before", "after", "same", "as", "cast", "convert",
    "between", "union", "intersect", "except", "Interval", "Tuple", "List", "Code", "Concept",
    "singleton", "distinct", "flatten", "expand", "collapse", "width", "successor",
    "predecessor", "minimum", "maximum", "start", "end", "difference", "duration", "date",
    "time", "timezoneoffset", "year", "month", "day", "hour", "minute", "second",
    "millisecond",
];

type ParseResult<T> = Result<T, CqlDiagnostic>;

/// Parse a token stream into a library syntax tree.
pub fn parse(tokens: &[Token], source: &str) -> (LibraryAst, Vec<CqlDiagnostic>) {
    let mut ast = LibraryAst::default();
    let mut diagnostics = Vec::new();
    let mut context = String::from("Unfiltered");
    let mut seen_statement = false;

    for statement in split_statements(tokens) {
        let mut parser = StatementParser {
            tokens: statement,
            pos: 0,
            source,
        };
        let result = parser.statement(&mut ast, &mut context, seen_statement);
        seen_statement = true;
        if let Err(diagnostic) = result {
            diagnostics.push(diagnostic);
        }
    }

    (ast, diagnostics)
}

/// Cut the token stream at top-level statement keywords.
fn split_statements(tokens: &[Token]) -> Vec<&[Token]> {
    let mut statements = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, token) in tokens.iter().enumerate() {
        if i > 0 && depth == 0 && starts_statement(token, &tokens[i - 1]) {
            statements.push(&tokens[start..i]);
            start = i;
        }
        match &token.kind {
            TokenKind::Punct("(" | "[" | "{") => depth += 1,
            TokenKind::Punct(")" | "]" | "}") => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    if start < tokens.len() {
        statements.push(&tokens[start..]);
    }
    statements
}

fn starts_statement(token: &Token, previous: &Token) -> bool {
    let TokenKind::Identifier(word) = &token.kind else {
        return false;
    };
    if !STATEMENT_KEYWORDS.contains(&word.as_str()) {
        return false;
    }
    if previous.is_punct(".") || previous.is_keyword("public") || previous.is_keyword("private") {
        return false;
    }
    // `code` is also an ordinary element name, only trust it at line start
    word != "code" || token.line_start
}

fn syntax_error(message: impl Into<String>, locator: Locator) -> CqlDiagnostic {
    CqlDiagnostic::error(ErrorType::Syntax, message, Some(locator))
}

struct StatementParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    source: &'a str,
}

impl<'a> StatementParser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(keyword))
    }

    fn at_punct(&self, punct: &str) -> bool {
        self.peek().is_some_and(|t| t.is_punct(punct))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.at_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn locator(&self) -> Locator {
        let first = self.tokens.first().map(|t| t.locator).unwrap_or_default();
        let last = self.tokens.last().map(|t| t.locator).unwrap_or_default();
        first.to(last)
    }

    fn error_here(&self, expected: &str) -> CqlDiagnostic {
        match self.peek() {
            Some(token) => syntax_error(
                format!(
                    "Syntax error at {}: expected {expected}",
                    token.text(self.source)
                ),
                token.locator,
            ),
            None => syntax_error(
                format!("Syntax error at <EOF>: expected {expected}"),
                self.locator(),
            ),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> ParseResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error_here(&format!("'{keyword}'")))
        }
    }

    fn expect_punct(&mut self, punct: &str) -> ParseResult<()> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.error_here(&format!("'{punct}'")))
        }
    }

    fn identifier(&mut self) -> ParseResult<String> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Identifier(name)) if !RESERVED_WORDS.contains(&name.as_str()) => {
                self.pos += 1;
                Ok(name.clone())
            }
            Some(TokenKind::QuotedIdentifier(name)) => {
                self.pos += 1;
                Ok(name.clone())
            }
            _ => Err(self.error_here("an identifier")),
        }
    }

    fn qualified_identifier(&mut self) -> ParseResult<String> {
        let mut name = self.identifier()?;
        while self.eat_punct(".") {
            name.push('.');
            name.push_str(&self.identifier()?);
        }
        Ok(name)
    }

    fn string(&mut self) -> ParseResult<String> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::String(value)) => {
                self.pos += 1;
                Ok(value.clone())
            }
            _ => Err(self.error_here("a string literal")),
        }
    }

    fn optional_version(&mut self) -> ParseResult<Option<String>> {
        if self.eat_keyword("version") {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }

    fn expect_end(&self) -> ParseResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(syntax_error(
                format!("Syntax error at {}: extraneous input", token.text(self.source)),
                token.locator,
            )),
        }
    }

    fn statement(
        &mut self,
        ast: &mut LibraryAst,
        context: &mut String,
        seen_statement: bool,
    ) -> ParseResult<()> {
        let locator = self.locator();

        if self.eat_keyword("library") {
            if seen_statement || ast.library.is_some() {
                return Err(syntax_error(
                    "The library declaration must be the first statement",
                    locator,
                ));
            }
            let name = self.qualified_identifier()?;
            let version = self.optional_version()?;
            self.expect_end()?;
            ast.library = Some(LibraryDecl {
                name,
                version,
                locator,
            });
            return Ok(());
        }

        if self.eat_keyword("using") {
            let model = self.identifier()?;
            let version = self.optional_version()?;
            let alias = if self.eat_keyword("called") {
                Some(self.identifier()?)
            } else {
                None
            };
            self.expect_end()?;
            ast.usings.push(UsingDecl {
                model,
                version,
                alias,
                locator,
            });
            return Ok(());
        }

        if self.eat_keyword("include") {
            let library = self.qualified_identifier()?;
            let version = self.optional_version()?;
            let alias = if self.eat_keyword("called") {
                Some(self.identifier()?)
            } else {
                None
            };
            self.expect_end()?;
            ast.includes.push(IncludeDecl {
                library,
                version,
                alias,
                locator,
            });
            return Ok(());
        }

        if self.eat_keyword("context") {
            let mut name = self.identifier()?;
            // `context FHIR.Patient`
            if self.eat_punct(".") {
                name = self.identifier()?;
            }
            self.expect_end()?;
            *context = name.clone();
            ast.contexts.push(ContextDecl { name, locator });
            return Ok(());
        }

        let access = if self.eat_keyword("private") {
            AccessLevel::Private
        } else {
            self.eat_keyword("public");
            AccessLevel::Public
        };

        if self.eat_keyword("codesystem") {
            let name = self.identifier()?;
            self.expect_punct(":")?;
            let id = self.string()?;
            let version = self.optional_version()?;
            self.expect_end()?;
            ast.terminology.push(TerminologyDecl {
                name,
                access,
                kind: TerminologyKind::CodeSystem { id, version },
                locator,
            });
        } else if self.eat_keyword("valueset") {
            let name = self.identifier()?;
            self.expect_punct(":")?;
            let id = self.string()?;
            let version = self.optional_version()?;
            if self.eat_keyword("codesystems") {
                self.skip_braces()?;
            }
            self.expect_end()?;
            ast.terminology.push(TerminologyDecl {
                name,
                access,
                kind: TerminologyKind::ValueSet { id, version },
                locator,
            });
        } else if self.eat_keyword("code") {
            let name = self.identifier()?;
            self.expect_punct(":")?;
            let id = self.string()?;
            self.expect_keyword("from")?;
            let system = self.identifier()?;
            let display = self.optional_display()?;
            self.expect_end()?;
            ast.terminology.push(TerminologyDecl {
                name,
                access,
                kind: TerminologyKind::Code {
                    id,
                    system,
                    display,
                },
                locator,
            });
        } else if self.eat_keyword("concept") {
            let name = self.identifier()?;
            self.expect_punct(":")?;
            self.expect_punct("{")?;
            let mut codes = vec![self.identifier()?];
            while self.eat_punct(",") {
                codes.push(self.identifier()?);
            }
            self.expect_punct("}")?;
            let display = self.optional_display()?;
            self.expect_end()?;
            ast.terminology.push(TerminologyDecl {
                name,
                access,
                kind: TerminologyKind::Concept { codes, display },
                locator,
            });
        } else if self.eat_keyword("parameter") {
            let name = self.identifier()?;
            let type_spec = if self.peek().is_some() && !self.at_keyword("default") {
                Some(self.type_spec()?)
            } else {
                None
            };
            let default = if self.eat_keyword("default") {
                Some(self.body()?)
            } else {
                self.expect_end()?;
                None
            };
            ast.parameters.push(ParameterDecl {
                name,
                access,
                type_spec,
                default,
                locator,
            });
        } else if self.eat_keyword("define") {
            let fluent = self.eat_keyword("fluent");
            if fluent || self.at_keyword("function") {
                self.expect_keyword("function")?;
                let function = self.function(access, fluent, context, locator)?;
                ast.functions.push(function);
            } else {
                let name = self.identifier()?;
                self.expect_punct(":")?;
                let body = self.body()?;
                ast.expressions.push(ExpressionDecl {
                    name,
                    access,
                    body,
                    context: context.clone(),
                    locator,
                });
            }
        } else {
            return Err(self.error_here("a library statement"));
        }

        Ok(())
    }

    fn optional_display(&mut self) -> ParseResult<Option<String>> {
        if self.eat_keyword("display") {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }

    fn skip_braces(&mut self) -> ParseResult<()> {
        self.expect_punct("{")?;
        let mut depth = 1;
        while depth > 0 {
            match self.next() {
                Some(t) if t.is_punct("{") => depth += 1,
                Some(t) if t.is_punct("}") => depth -= 1,
                Some(_) => {}
                None => return Err(self.error_here("'}'")),
            }
        }
        Ok(())
    }

    fn function(
        &mut self,
        access: AccessLevel,
        fluent: bool,
        context: &str,
        locator: Locator,
    ) -> ParseResult<FunctionDecl> {
        let name = self.identifier()?;
        self.expect_punct("(")?;
        let mut operands = Vec::new();
        if !self.at_punct(")") {
            loop {
                let operand = self.identifier()?;
                let type_spec = self.type_spec()?;
                operands.push(Operand {
                    name: operand,
                    type_spec,
                });
                if !self.eat_punct(",") {
                    break;
                }
            }
        }
        self.expect_punct(")")?;
        let returns = if self.eat_keyword("returns") {
            Some(self.type_spec()?)
        } else {
            None
        };
        self.expect_punct(":")?;
        let body = if self.eat_keyword("external") {
            self.expect_end()?;
            None
        } else {
            Some(self.body()?)
        };

        Ok(FunctionDecl {
            name,
            access,
            fluent,
            operands,
            returns,
            body,
            context: context.to_string(),
            locator,
        })
    }

    fn type_spec(&mut self) -> ParseResult<TypeSpec> {
        self.nested_type_spec(0)
    }

    fn nested_type_spec(&mut self, depth: usize) -> ParseResult<TypeSpec> {
        if depth > MAX_NESTING_DEPTH {
            let locator = self.peek().or(self.tokens.last()).map(|t| t.locator).unwrap_or_default();
            return Err(syntax_error(NESTING_TOO_DEEP, locator));
        }
        let start = self.pos;
        let name = self.identifier()?;

        match name.as_str() {
            "List" | "Interval" if self.at_punct("<") => {
                self.pos += 1;
                let inner = Box::new(self.nested_type_spec(depth + 1)?);
                self.expect_punct(">")?;
                Ok(if name == "List" {
                    TypeSpec::List(inner)
                } else {
                    TypeSpec::Interval(inner)
                })
            }
            "Tuple" | "Choice" => {
                let (open, close) = if name == "Tuple" { ("{", "}") } else { ("<", ">") };
                self.expect_punct(open)?;
                let mut depth = 1;
                while depth > 0 {
                    match self.next() {
                        Some(t) if t.is_punct(open) => depth += 1,
                        Some(t) if t.is_punct(close) => depth -= 1,
                        Some(_) => {}
                        None => return Err(self.error_here(&format!("'{close}'"))),
                    }
                }
                let first = &self.tokens[start];
                let last = &self.tokens[self.pos - 1];
                Ok(TypeSpec::Opaque(self.source[first.start..last.end].to_string()))
            }
            _ if self.eat_punct(".") => Ok(TypeSpec::Named {
                qualifier: Some(name),
                name: self.identifier()?,
            }),
            _ => Ok(TypeSpec::Named {
                qualifier: None,
                name,
            }),
        }
    }

    /// Remaining tokens of the statement as a definition body.
    fn body(&mut self) -> ParseResult<Body> {
        let tokens = &self.tokens[self.pos..];
        self.pos = self.tokens.len();

        let Some(first) = tokens.first() else {
            return Err(self.error_here("an expression"));
        };
        let locator = first.locator.to(tokens[tokens.len() - 1].locator);

        if let Some(construct) = unsupported_construct(tokens, self.source) {
            return Ok(Body::Unsupported { construct, locator });
        }

        let mut parser = ExprParser {
            tokens,
            pos: 0,
            depth: 0,
            source: self.source,
        };
        let expr = parser.expression()?;
        if let Some(token) = parser.peek() {
            return Err(syntax_error(
                format!("Syntax error at {}: extraneous input", token.text(self.source)),
                token.locator,
            ));
        }
        Ok(Body::Parsed(expr))
    }
}

/// First token of a construct outside the supported expression subset.
fn unsupported_construct(tokens: &[Token], source: &str) -> Option<String> {
    for (i, token) in tokens.iter().enumerate() {
        let unsupported = match &token.kind {
            TokenKind::Punct("[" | "{" | "|" | "->") => true,
            TokenKind::Temporal(_) => true,
            TokenKind::Identifier(word) => UNSUPPORTED_WORDS.contains(&word.as_str()),
            // Quantity literals: `5 'mg'`, `3 days`
            TokenKind::Integer(_) | TokenKind::Decimal(_) => matches!(
                tokens.get(i + 1).map(|t| &t.kind),
                Some(TokenKind::String(_)) | Some(TokenKind::Identifier(_))
                    if !tokens[i + 1].is_keyword("and")
                        && !tokens[i + 1].is_keyword("or")
                        && !tokens[i + 1].is_keyword("xor")
                        && !tokens[i + 1].is_keyword("implies")
                        && !tokens[i + 1].is_keyword("div")
                        && !tokens[i + 1].is_keyword("mod")
                        && !tokens[i + 1].is_keyword("is")
            ),
            _ => false,
        };
        if unsupported {
            return Some(token.text(source).to_string());
        }
    }
    None
}

/// Precedence-climbing expression parser.
///
/// `depth` grows with every recursive descent and every operator folded into
/// a chain, so it bounds the height of the tree being built.
struct ExprParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    source: &'a str,
}

impl<'a> ExprParser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(keyword))
    }

    fn at_punct(&self, punct: &str) -> bool {
        self.peek().is_some_and(|t| t.is_punct(punct))
    }

    fn error_here(&self, expected: &str) -> CqlDiagnostic {
        match self.peek() {
            Some(token) => syntax_error(
                format!(
                    "Syntax error at {}: expected {expected}",
                    token.text(self.source)
                ),
                token.locator,
            ),
            None => {
                let locator = self.tokens.last().map(|t| t.locator).unwrap_or_default();
                syntax_error(format!("Syntax error at <EOF>: expected {expected}"), locator)
            }
        }
    }

    fn descend(&mut self) -> ParseResult<()> {
        self.descend_by(1)
    }

    fn descend_by(&mut self, levels: usize) -> ParseResult<()> {
        self.depth += levels;
        if self.depth > MAX_NESTING_DEPTH {
            let locator = self
                .peek()
                .or(self.tokens.last())
                .map(|t| t.locator)
                .unwrap_or_default();
            return Err(syntax_error(NESTING_TOO_DEEP, locator));
        }
        Ok(())
    }

    /// Parse with `parse` one level deeper.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ParseResult<T>) -> ParseResult<T> {
        self.descend()?;
        let result = parse(self)?;
        self.depth -= 1;
        Ok(result)
    }

    /// A parenthesized expression or call argument. It re-enters the whole
    /// precedence ladder, so it is charged more than one operator.
    fn subexpression(&mut self) -> ParseResult<Expr> {
        self.descend_by(SUBEXPRESSION_COST)?;
        let result = self.expression()?;
        self.depth -= SUBEXPRESSION_COST;
        Ok(result)
    }

    fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
        Expr {
            locator: left.locator.to(right.locator),
            span: (left.span.0, right.span.1),
            kind: ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        }
    }

    fn unary(op: UnaryOp, operand: Expr, start: &Token) -> Expr {
        Expr {
            locator: start.locator.to(operand.locator),
            span: (start.start, operand.span.1),
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        }
    }

    fn expression(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.or_expression()?;
        while self.at_keyword("implies") {
            self.descend()?;
            self.pos += 1;
            let right = self.or_expression()?;
            left = Self::binary(left, BinaryOp::Implies, right);
        }
        self.depth = base;
        Ok(left)
    }

    fn or_expression(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.and_expression()?;
        loop {
            let op = if self.at_keyword("or") {
                BinaryOp::Or
            } else if self.at_keyword("xor") {
                BinaryOp::Xor
            } else {
                break;
            };
            self.descend()?;
            self.pos += 1;
            let right = self.and_expression()?;
            left = Self::binary(left, op, right);
        }
        self.depth = base;
        Ok(left)
    }

    fn and_expression(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.not_expression()?;
        while self.at_keyword("and") {
            self.descend()?;
            self.pos += 1;
            let right = self.not_expression()?;
            left = Self::binary(left, BinaryOp::And, right);
        }
        self.depth = base;
        Ok(left)
    }

    fn not_expression(&mut self) -> ParseResult<Expr> {
        let op = if self.at_keyword("not") {
            UnaryOp::Not
        } else if self.at_keyword("exists") {
            UnaryOp::Exists
        } else {
            return self.equality();
        };
        let start = &self.tokens[self.pos];
        self.pos += 1;
        let operand = self.nested(Self::not_expression)?;
        Ok(Self::unary(op, operand, start))
    }

    fn equality(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Punct("=")) => BinaryOp::Equal,
                Some(TokenKind::Punct("!=")) => BinaryOp::NotEqual,
                Some(TokenKind::Punct("~")) => BinaryOp::Equivalent,
                Some(TokenKind::Punct("!~")) => BinaryOp::NotEquivalent,
                _ => break,
            };
            self.descend()?;
            self.pos += 1;
            let right = self.comparison()?;
            left = Self::binary(left, op, right);
        }
        self.depth = base;
        Ok(left)
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.is_expression()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Punct("<")) => BinaryOp::Less,
                Some(TokenKind::Punct("<=")) => BinaryOp::LessOrEqual,
                Some(TokenKind::Punct(">")) => BinaryOp::Greater,
                Some(TokenKind::Punct(">=")) => BinaryOp::GreaterOrEqual,
                _ => break,
            };
            self.descend()?;
            self.pos += 1;
            let right = self.is_expression()?;
            left = Self::binary(left, op, right);
        }
        self.depth = base;
        Ok(left)
    }

    fn is_expression(&mut self) -> ParseResult<Expr> {
        let operand = self.additive()?;
        if !self.at_keyword("is") {
            return Ok(operand);
        }
        self.pos += 1;
        let negated = self.at_keyword("not");
        if negated {
            self.pos += 1;
        }
        let op = match self.peek() {
            Some(t) if t.is_keyword("null") => {
                if negated {
                    UnaryOp::IsNotNull
                } else {
                    UnaryOp::IsNull
                }
            }
            Some(t) if t.is_keyword("true") && !negated => UnaryOp::IsTrue,
            Some(t) if t.is_keyword("false") && !negated => UnaryOp::IsFalse,
            _ => return Err(self.error_here("'null', 'true' or 'false'")),
        };
        let end = &self.tokens[self.pos];
        self.pos += 1;
        Ok(Expr {
            locator: operand.locator.to(end.locator),
            span: (operand.span.0, end.end),
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        })
    }

    fn additive(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Punct("+")) => BinaryOp::Add,
                Some(TokenKind::Punct("-")) => BinaryOp::Subtract,
                Some(TokenKind::Punct("&")) => BinaryOp::Concatenate,
                _ => break,
            };
            self.descend()?;
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Self::binary(left, op, right);
        }
        self.depth = base;
        Ok(left)
    }

    fn multiplicative(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut left = self.power()?;
        loop {
            let op = match self.peek() {
                Some(t) if t.is_punct("*") => BinaryOp::Multiply,
                Some(t) if t.is_punct("/") => BinaryOp::Divide,
                Some(t) if t.is_keyword("div") => BinaryOp::TruncatedDivide,
                Some(t) if t.is_keyword("mod") => BinaryOp::Modulo,
                _ => break,
            };
            self.descend()?;
            self.pos += 1;
            let right = self.power()?;
            left = Self::binary(left, op, right);
        }
        self.depth = base;
        Ok(left)
    }

    fn power(&mut self) -> ParseResult<Expr> {
        let base = self.unary_expression()?;
        if self.at_punct("^") {
            self.pos += 1;
            let exponent = self.nested(Self::power)?;
            return Ok(Self::binary(base, BinaryOp::Power, exponent));
        }
        Ok(base)
    }

    fn unary_expression(&mut self) -> ParseResult<Expr> {
        if self.at_punct("-") {
            let start = &self.tokens[self.pos];
            self.pos += 1;
            let operand = self.nested(Self::unary_expression)?;
            return Ok(Self::unary(UnaryOp::Negate, operand, start));
        }
        if self.at_punct("+") {
            self.pos += 1;
            return self.nested(Self::unary_expression);
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let base = self.depth;
        let mut expr = self.primary()?;
        while self.at_punct(".") {
            self.descend()?;
            self.pos += 1;
            let name = self.member_name()?;
            let name_token = &self.tokens[self.pos - 1];
            if self.at_punct("(") {
                let (args, close) = self.arguments()?;
                expr = Expr {
                    locator: expr.locator.to(close.locator),
                    span: (expr.span.0, close.end),
                    kind: ExprKind::Call {
                        source: Some(Box::new(expr)),
                        name,
                        args,
                    },
                };
            } else {
                expr = Expr {
                    locator: expr.locator.to(name_token.locator),
                    span: (expr.span.0, name_token.end),
                    kind: ExprKind::Member {
                        source: Box::new(expr),
                        name,
                    },
                };
            }
        }
        self.depth = base;
        Ok(expr)
    }

    fn member_name(&mut self) -> ParseResult<String> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Identifier(name)) | Some(TokenKind::QuotedIdentifier(name)) => {
                self.pos += 1;
                Ok(name.clone())
            }
            _ => Err(self.error_here("a member name")),
        }
    }

    /// Parenthesized argument list; returns the closing token.
    fn arguments(&mut self) -> ParseResult<(Vec<Expr>, &'a Token)> {
        self.pos += 1;
        let mut args = Vec::new();
        if !self.at_punct(")") {
            loop {
                args.push(self.subexpression()?);
                if self.at_punct(",") {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        if !self.at_punct(")") {
            return Err(self.error_here("')'"));
        }
        let close = &self.tokens[self.pos];
        self.pos += 1;
        Ok((args, close))
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let Some(token) = self.peek() else {
            return Err(self.error_here("an expression"));
        };
        let leaf = |kind| Expr {
            kind,
            locator: token.locator,
            span: (token.start, token.end),
        };

        match &token.kind {
            TokenKind::Integer(value) => {
                self.pos += 1;
                Ok(leaf(ExprKind::Literal {
                    kind: LiteralKind::Integer,
                    value: value.clone(),
                }))
            }
            TokenKind::Decimal(value) => {
                self.pos += 1;
                Ok(leaf(ExprKind::Literal {
                    kind: LiteralKind::Decimal,
                    value: value.clone(),
                }))
            }
            TokenKind::String(value) => {
                self.pos += 1;
                Ok(leaf(ExprKind::Literal {
                    kind: LiteralKind::String,
                    value: value.clone(),
                }))
            }
            TokenKind::Identifier(word) if word == "true" || word == "false" => {
                self.pos += 1;
                Ok(leaf(ExprKind::Literal {
                    kind: LiteralKind::Boolean,
                    value: word.clone(),
                }))
            }
            TokenKind::Identifier(word) if word == "null" => {
                self.pos += 1;
                Ok(leaf(ExprKind::Null))
            }
            TokenKind::Identifier(word) if RESERVED_WORDS.contains(&word.as_str()) => {
                Err(self.error_here("an expression"))
            }
            TokenKind::Identifier(name) | TokenKind::QuotedIdentifier(name) => {
                self.pos += 1;
                if self.at_punct("(") {
                    let (args, close) = self.arguments()?;
                    return Ok(Expr {
                        locator: token.locator.to(close.locator),
                        span: (token.start, close.end),
                        kind: ExprKind::Call {
                            source: None,
                            name: name.clone(),
                            args,
                        },
                    });
                }
                Ok(leaf(ExprKind::Identifier(name.clone())))
            }
            TokenKind::Punct("(") => {
                self.pos += 1;
                let inner = self.subexpression()?;
                if !self.at_punct(")") {
                    return Err(self.error_here("')'"));
                }
                let close = &self.tokens[self.pos];
                self.pos += 1;
                Ok(Expr {
                    locator: token.locator.to(close.locator),
                    span: (token.start, close.end),
                    kind: inner.kind,
                })
            }
            _ => Err(self.error_here("an expression")),
        }
    }
}

/// Declared identifier of a library, read from its header.
pub fn library_header(tokens: &[Token], source: &str) -> Option<(String, Option<String>)> {
    if !tokens.first()?.is_keyword("library") {
        return None;
    }
    let mut parser = StatementParser {
        tokens: &tokens[1..],
        pos: 0,
        source,
    };
    let name = parser.qualified_identifier().ok()?;
    let version = parser.optional_version().ok().flatten();
    Some((name, version))
}
