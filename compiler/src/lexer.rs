// Lexer for NMODL statement blocks.
//
// Tokenizes the bodies of INITIAL, BREAKPOINT, NET_RECEIVE, FUNCTION and the
// other model blocks carried by a model file. Uses the `logos` crate for
// DFA-based lexing.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters and unterminated VERBATIM blocks
//                produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// NMODL statement token types.
///
/// Identifiers and real literals carry no value: the parser slices the
/// source with the span so that literals are re-emitted exactly as written.
/// Newlines are insignificant inside statement blocks.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+|:[^\n]*|\?[^\n]*")]
pub enum Token {
    // ── Keywords ──
    #[token("LOCAL")]
    Local,
    #[token("IF")]
    If,
    #[token("ELSE")]
    Else,
    #[token("WHILE")]
    While,
    #[token("FROM")]
    From,
    #[token("TO")]
    To,
    #[token("BY")]
    By,
    #[token("WATCH")]
    Watch,
    #[token("FOR_NETCON")]
    ForNetcon,
    #[token("INITIAL")]
    Initial,
    #[token("DERIVIMPLICIT")]
    DerivImplicit,

    /// `VERBATIM ... ENDVERBATIM`, carrying the raw text between the markers.
    #[token("VERBATIM", lex_verbatim)]
    Verbatim(String),

    // ── Operators ──
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("^")]
    Caret,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,
    #[token("=")]
    Equals,

    // ── Delimiters ──
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,

    // ── Literals ──
    //
    // logos picks the longest match, so `1.5` is Real and `15` is Integer.
    /// Real literal (`1.5`, `1.`, `.5`, `1e-3`, `2.5E+2`).
    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?")]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?")]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+")]
    Real,

    /// Integer literal.
    #[regex(r"[0-9]+", parse_integer)]
    Integer(i64),

    /// String literal (used by `printf` calls); no escape processing.
    #[regex(r#""[^"]*""#, parse_string)]
    StringLit(String),

    // ── Identifier ──
    /// Identifier: `[a-zA-Z_][a-zA-Z0-9_]*`
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Local => write!(f, "LOCAL"),
            Token::If => write!(f, "IF"),
            Token::Else => write!(f, "ELSE"),
            Token::While => write!(f, "WHILE"),
            Token::From => write!(f, "FROM"),
            Token::To => write!(f, "TO"),
            Token::By => write!(f, "BY"),
            Token::Watch => write!(f, "WATCH"),
            Token::ForNetcon => write!(f, "FOR_NETCON"),
            Token::Initial => write!(f, "INITIAL"),
            Token::DerivImplicit => write!(f, "DERIVIMPLICIT"),
            Token::Verbatim(_) => write!(f, "VERBATIM"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Caret => write!(f, "^"),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Le => write!(f, "<="),
            Token::Ge => write!(f, ">="),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::AndAnd => write!(f, "&&"),
            Token::OrOr => write!(f, "||"),
            Token::Bang => write!(f, "!"),
            Token::Equals => write!(f, "="),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Real => write!(f, "<real>"),
            Token::Integer(v) => write!(f, "{v}"),
            Token::StringLit(s) => write!(f, "\"{s}\""),
            Token::Ident => write!(f, "<ident>"),
        }
    }
}

// ── Callbacks ──

const END_VERBATIM: &str = "ENDVERBATIM";

fn lex_verbatim(lex: &mut logos::Lexer<'_, Token>) -> Option<String> {
    let rest = lex.remainder();
    let end = rest.find(END_VERBATIM)?;
    let text = rest[..end].to_string();
    lex.bump(end + END_VERBATIM.len());
    Some(text)
}

fn parse_integer(lex: &mut logos::Lexer<'_, Token>) -> Option<i64> {
    lex.slice().parse().ok()
}

fn parse_string(lex: &mut logos::Lexer<'_, Token>) -> Option<String> {
    let slice = lex.slice();
    Some(slice[1..slice.len() - 1].to_string())
}

// ── Public API ──

/// Lex an NMODL statement block into tokens.
///
/// Returns all successfully parsed tokens together with any errors for
/// unrecognised characters. Lexing is non-fatal: errors are collected and
/// the lexer continues past bad characters.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                let text = &source[span.start..span.end];
                let message = if text.starts_with("VERBATIM") {
                    "VERBATIM block without ENDVERBATIM".to_string()
                } else {
                    format!("unexpected character: {:?}", text)
                };
                errors.push(LexError { span, message });
            }
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: lex and assert no errors, return token list.
    fn lex_ok(source: &str) -> Vec<Token> {
        let result = lex(source);
        assert!(
            result.errors.is_empty(),
            "unexpected lex errors: {:?}",
            result.errors
        );
        result.tokens.into_iter().map(|(t, _)| t).collect()
    }

    /// Helper: lex and return (tokens, errors).
    fn lex_all(source: &str) -> (Vec<Token>, Vec<LexError>) {
        let result = lex(source);
        let tokens = result.tokens.into_iter().map(|(t, _)| t).collect();
        (tokens, result.errors)
    }

    #[test]
    fn keywords() {
        let tokens =
            lex_ok("LOCAL IF ELSE WHILE FROM TO BY WATCH FOR_NETCON INITIAL DERIVIMPLICIT");
        assert_eq!(
            tokens,
            vec![
                Token::Local,
                Token::If,
                Token::Else,
                Token::While,
                Token::From,
                Token::To,
                Token::By,
                Token::Watch,
                Token::ForNetcon,
                Token::Initial,
                Token::DerivImplicit,
            ]
        );
    }

    #[test]
    fn keyword_vs_ident() {
        // keywords are upper case only, and `IFx` is a single identifier
        let tokens = lex_ok("IFx local");
        assert_eq!(tokens, vec![Token::Ident, Token::Ident]);
    }

    #[test]
    fn operators() {
        let tokens = lex_ok("+ - * / ^ < > <= >= == != && || ! =");
        assert_eq!(
            tokens,
            vec![
                Token::Plus,
                Token::Minus,
                Token::Star,
                Token::Slash,
                Token::Caret,
                Token::Lt,
                Token::Gt,
                Token::Le,
                Token::Ge,
                Token::EqEq,
                Token::NotEq,
                Token::AndAnd,
                Token::OrOr,
                Token::Bang,
                Token::Equals,
            ]
        );
    }

    #[test]
    fn integer_and_real_literals() {
        let tokens = lex_ok("15 1.5 1. .5 1e-3 2.5E+2");
        assert_eq!(
            tokens,
            vec![
                Token::Integer(15),
                Token::Real,
                Token::Real,
                Token::Real,
                Token::Real,
                Token::Real,
            ]
        );
    }

    #[test]
    fn real_lexeme_is_recoverable_from_span() {
        let source = "x = 1e-3";
        let result = lex(source);
        let (_, span) = result.tokens[2].clone();
        assert_eq!(&source[span.start..span.end], "1e-3");
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = lex_ok("a = 1 : trailing comment\n? another\nb");
        assert_eq!(
            tokens,
            vec![Token::Ident, Token::Equals, Token::Integer(1), Token::Ident]
        );
    }

    #[test]
    fn string_literal() {
        let tokens = lex_ok(r#"printf("v = %g\n", v)"#);
        assert_eq!(tokens[2], Token::StringLit("v = %g\\n".to_string()));
    }

    #[test]
    fn verbatim_block_keeps_raw_text() {
        let tokens = lex_ok("VERBATIM\n  return 0; /* : not a comment */\nENDVERBATIM x");
        assert_eq!(
            tokens,
            vec![
                Token::Verbatim("\n  return 0; /* : not a comment */\n".to_string()),
                Token::Ident,
            ]
        );
    }

    #[test]
    fn unterminated_verbatim_is_an_error() {
        let (_, errors) = lex_all("VERBATIM int x;");
        assert!(!errors.is_empty());
        assert!(errors[0].message.contains("ENDVERBATIM"));
    }

    #[test]
    fn unexpected_character() {
        let (tokens, errors) = lex_all("a = 1 @ b");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].span, Span { start: 6, end: 7 });
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn spans_are_byte_offsets() {
        let result = lex("  gna");
        assert_eq!(result.tokens[0].1, Span { start: 2, end: 5 });
    }
}
