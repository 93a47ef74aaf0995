//! CQL tokenizer.

use std::ops::Range;

use logos::Logos;

use super::diagnostic::{CqlDiagnostic, ErrorType, Locator};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Bare identifier or keyword
    Identifier(String),
    /// `"quoted"` or `` `delimited` `` identifier
    QuotedIdentifier(String),
    /// `'string'` literal, escapes already applied
    String(String),
    Integer(String),
    Decimal(String),
    /// `@2020-01-01` style date/time literal
    Temporal(String),
    Punct(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub locator: Locator,
    /// Byte range in the source text
    pub start: usize,
    pub end: usize,
    /// First token on its line
    pub line_start: bool,
}

impl Token {
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.kind, TokenKind::Identifier(name) if name == keyword)
    }

    pub fn is_punct(&self, punct: &str) -> bool {
        matches!(self.kind, TokenKind::Punct(p) if p == punct)
    }

    /// Source spelling, for error messages.
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

const PUNCTUATION: &[&str] = &[
    "!=", "!~", "<=", ">=", "->", "(", ")", "[", "]", "{", "}", ",", ".", ":", "+", "-", "*", "/",
    "^", "=", "~", "<", ">", "&", "|",
];

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[\s\u{feff}]+")]
#[logos(skip r"//[^\n]*")]
enum RawToken {
    /// `true` when the closing `*/` was found
    #[token("/*", block_comment)]
    BlockComment(bool),

    #[regex(r"'([^'\\]|\\[^\n])*'")]
    String,
    #[regex(r"'([^'\\]|\\[^\n])*")]
    UnterminatedString,
    #[regex(r#""([^"\\]|\\[^\n])*""#)]
    #[regex(r"`([^`\\]|\\[^\n])*`")]
    QuotedIdentifier,
    #[regex(r#""([^"\\]|\\[^\n])*"#)]
    #[regex(r"`([^`\\]|\\[^\n])*")]
    UnterminatedIdentifier,

    #[regex(r"@[0-9A-Za-z:.+\-]*")]
    Temporal,
    #[regex(r"[0-9]+")]
    Integer,
    #[regex(r"[0-9]+\.[0-9]+")]
    Decimal,
    #[regex(r"[\p{L}_][\p{L}\p{N}_]*")]
    Identifier,

    #[token("!=")]
    #[token("!~")]
    #[token("<=")]
    #[token(">=")]
    #[token("->")]
    #[token("(")]
    #[token(")")]
    #[token("[")]
    #[token("]")]
    #[token("{")]
    #[token("}")]
    #[token(",")]
    #[token(".")]
    #[token(":")]
    #[token("+")]
    #[token("-")]
    #[token("*")]
    #[token("/")]
    #[token("^")]
    #[token("=")]
    #[token("~")]
    #[token("<")]
    #[token(">")]
    #[token("&")]
    #[token("|")]
    Punct,
}

fn block_comment(lex: &mut logos::Lexer<RawToken>) -> Option<bool> {
    match lex.remainder().find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            Some(true)
        }
        None => {
            lex.bump(lex.remainder().len());
            Some(false)
        }
    }
}

/// Byte offset to 1-based line and character positions.
struct LineIndex<'a> {
    source: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    fn new(source: &'a str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self { source, line_starts }
    }

    fn position(&self, offset: usize) -> (usize, usize) {
        let line = self.line_starts.partition_point(|&start| start <= offset);
        let line_start = self.line_starts[line - 1];
        let col = self.source[line_start..offset].chars().count() + 1;
        (line, col)
    }

    fn locator(&self, span: &Range<usize>) -> Locator {
        let (start_line, start_char) = self.position(span.start);
        let (end_line, end_char) = self.position(span.end);
        Locator::new(start_line, start_char, end_line, end_char)
    }
}

/// Tokenize `source`, reporting malformed input as syntax diagnostics.
pub fn tokenize(source: &str) -> (Vec<Token>, Vec<CqlDiagnostic>) {
    let lines = LineIndex::new(source);
    let mut lexer = RawToken::lexer(source);
    let mut tokens = Vec::new();
    let mut diagnostics = Vec::new();
    let mut last_line = 0;

    while let Some(raw) = lexer.next() {
        let span = lexer.span();
        let text = lexer.slice();
        let kind = match raw {
            Ok(RawToken::BlockComment(true)) => continue,
            Ok(RawToken::BlockComment(false)) => {
                diagnostics.push(CqlDiagnostic::error(
                    ErrorType::Syntax,
                    "Unterminated block comment",
                    Some(lines.locator(&span)),
                ));
                continue;
            }
            Ok(RawToken::UnterminatedString | RawToken::UnterminatedIdentifier) => {
                let delimiter = text.chars().next().unwrap_or('\'');
                let (line, _) = lines.position(span.start);
                diagnostics.push(CqlDiagnostic::error(
                    ErrorType::Syntax,
                    format!("Unterminated {} starting at line {line}", delimited_name(delimiter)),
                    Some(lines.locator(&span)),
                ));
                continue;
            }
            Ok(RawToken::String) => {
                TokenKind::String(delimited_body(text, &span, &lines, &mut diagnostics))
            }
            Ok(RawToken::QuotedIdentifier) => {
                TokenKind::QuotedIdentifier(delimited_body(text, &span, &lines, &mut diagnostics))
            }
            Ok(RawToken::Temporal) => TokenKind::Temporal(text[1..].to_string()),
            Ok(RawToken::Integer) => TokenKind::Integer(text.to_string()),
            Ok(RawToken::Decimal) => TokenKind::Decimal(text.to_string()),
            Ok(RawToken::Identifier) => TokenKind::Identifier(text.to_string()),
            Ok(RawToken::Punct) => match PUNCTUATION.iter().find(|p| **p == text) {
                Some(punct) => TokenKind::Punct(punct),
                None => continue,
            },
            Err(()) => {
                let (line, col) = lines.position(span.start);
                diagnostics.push(CqlDiagnostic::error(
                    ErrorType::Syntax,
                    format!("Syntax error at {text}"),
                    Some(Locator::new(line, col, line, col)),
                ));
                continue;
            }
        };

        let (line, col) = lines.position(span.start);
        let (end_line, end_col) = lines.position(span.end);
        tokens.push(Token {
            kind,
            locator: Locator::new(line, col, end_line, end_col.saturating_sub(1).max(1)),
            start: span.start,
            end: span.end,
            line_start: line != last_line,
        });
        last_line = line;
    }

    (tokens, diagnostics)
}

fn delimited_name(delimiter: char) -> &'static str {
    match delimiter {
        '\'' => "string literal",
        _ => "quoted identifier",
    }
}

/// Unescaped body of a string or quoted identifier. A malformed escape is
/// reported and the raw body kept so parsing can go on.
fn delimited_body(
    text: &str,
    span: &Range<usize>,
    lines: &LineIndex<'_>,
    diagnostics: &mut Vec<CqlDiagnostic>,
) -> String {
    let body = &text[1..text.len() - 1];
    unescape(body).unwrap_or_else(|sequence| {
        diagnostics.push(CqlDiagnostic::error(
            ErrorType::Syntax,
            format!("Invalid escape sequence {sequence}"),
            Some(lines.locator(span)),
        ));
        body.to_string()
    })
}

/// Apply escapes to a delimited body. `Err` carries the malformed sequence.
fn unescape(body: &str) -> Result<String, String> {
    let mut text = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            text.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => text.push('\n'),
            Some('t') => text.push('\t'),
            Some('r') => text.push('\r'),
            Some('f') => text.push('\u{c}'),
            Some('u') => text.push(unicode_escape(&mut chars)?),
            Some(other) => text.push(other),
            None => {}
        }
    }
    Ok(text)
}

/// The character after `\u`, joining UTF-16 surrogate pairs.
fn unicode_escape(chars: &mut std::str::Chars<'_>) -> Result<char, String> {
    let high = hex_unit(chars)?;
    if !(0xD800..0xDC00).contains(&high) {
        return char::from_u32(high).ok_or_else(|| format!("\\u{high:04X}"));
    }
    let unpaired = || format!("\\u{high:04X}");
    if chars.next() != Some('\\') || chars.next() != Some('u') {
        return Err(unpaired());
    }
    let low = hex_unit(chars)?;
    if !(0xDC00..0xE000).contains(&low) {
        return Err(unpaired());
    }
    char::from_u32(0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00)).ok_or_else(unpaired)
}

fn hex_unit(chars: &mut std::str::Chars<'_>) -> Result<u32, String> {
    let digits: String = chars.by_ref().take(4).collect();
    if digits.len() == 4 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
        u32::from_str_radix(&digits, 16).map_err(|_| format!("\\u{digits}"))
    } else {
        Err(format!("\\u{digits}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, diagnostics) = tokenize(source);
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_basic_tokens() {
        assert_eq!(
            kinds(r#"define "X": 1 + 2.5 != 'a\'b'"#),
            vec![
                TokenKind::Identifier("define".into()),
                TokenKind::QuotedIdentifier("X".into()),
                TokenKind::Punct(":"),
                TokenKind::Integer("1".into()),
                TokenKind::Punct("+"),
                TokenKind::Decimal("2.5".into()),
                TokenKind::Punct("!="),
                TokenKind::String("a'b".into()),
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("// line\n/* block\n comment */ X"),
            vec![TokenKind::Identifier("X".into())]
        );
    }

    #[test]
    fn test_member_access_is_not_decimal() {
        assert_eq!(
            kinds("A.B 1.x"),
            vec![
                TokenKind::Identifier("A".into()),
                TokenKind::Punct("."),
                TokenKind::Identifier("B".into()),
                TokenKind::Integer("1".into()),
                TokenKind::Punct("."),
                TokenKind::Identifier("x".into()),
            ]
        );
    }

    #[test]
    fn test_positions_and_line_start() {
        let (tokens, _) = tokenize("library A\n  define X: 1");
        assert!(tokens[0].line_start);
        assert!(!tokens[1].line_start);
        assert!(tokens[2].line_start);
        assert_eq!(tokens[2].locator, Locator::new(2, 3, 2, 8));
    }

    #[test]
    fn test_unterminated_string_is_reported() {
        let (_, diagnostics) = tokenize("define X: 'abc");
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("Unterminated string literal"));
    }

    #[test]
    fn test_escape_sequences() {
        let kinds = kinds(r"'a\tb\'c' '\u0041\u00e9' '\uD83D\uDE00' `x\u0042`");
        assert_eq!(
            kinds,
            vec![
                TokenKind::String("a\tb'c".to_string()),
                TokenKind::String("A\u{e9}".to_string()),
                TokenKind::String("\u{1F600}".to_string()),
                TokenKind::QuotedIdentifier("xB".to_string()),
            ]
        );
    }

    #[test]
    fn test_malformed_unicode_escape_is_reported() {
        for source in [r"'\u00G1'", r"'\u12'", r"'\uD83D'", r"'\uDE00x'"] {
            let (tokens, diagnostics) = tokenize(source);
            assert_eq!(diagnostics.len(), 1, "{source}");
            assert_eq!(diagnostics[0].error_type, ErrorType::Syntax);
            assert!(diagnostics[0].message.starts_with("Invalid escape sequence \\u"));
            assert_eq!(tokens.len(), 1);
        }
    }

    #[test]
    fn test_unknown_character_is_reported() {
        let (tokens, diagnostics) = tokenize("define X: 1 # 2");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(tokens.len(), 5);
    }
}
