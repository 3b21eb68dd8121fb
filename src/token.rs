// Token: lexical tokens of PhySL
//
// PhySL is expression-only: every construct, including control flow and
// definitions, is a function call. The token set is therefore small:
//
//   1. Literals     integers, floats, strings, true/false/nil
//   2. Identifiers  names, including `_1`/`__1` placeholder spellings
//   3. Operators    + - * / % == != < <= > >= && || !
//   4. Punctuation  ( ) [ ] ,
//
// Offset and length of a span are in bytes. Line and column are 1-based and
// count characters, so a column after non-ASCII text is still what an
// editor shows.

use std::fmt;

/// Location of a token or node in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
    pub line: usize,
    pub col: usize,
}

impl Span {
    pub fn new(offset: usize, len: usize, line: usize, col: usize) -> Self {
        Span { offset, len, line, col }
    }

    /// Byte offset one past the end.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// From the start of `self` to the end of `other`.
    pub fn to(self, other: Span) -> Span {
        Span {
            len: other.end().saturating_sub(self.offset),
            ..self
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Token { kind, span }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    IntLit(i64),
    FloatLit(f64),
    StringLit(String),
    True,
    False,
    Nil,
    Ident(String),

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    BangEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    AmpAmp,
    PipePipe,
    Bang,

    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,

    Eof,
}

/// Operator and punctuation spellings. Two-byte spellings come first so the
/// lexer can take the first prefix match.
pub static SYMBOLS: [(&str, TokenKind); 19] = [
    ("==", TokenKind::EqEq),
    ("!=", TokenKind::BangEq),
    ("<=", TokenKind::LtEq),
    (">=", TokenKind::GtEq),
    ("&&", TokenKind::AmpAmp),
    ("||", TokenKind::PipePipe),
    ("+", TokenKind::Plus),
    ("-", TokenKind::Minus),
    ("*", TokenKind::Star),
    ("/", TokenKind::Slash),
    ("%", TokenKind::Percent),
    ("<", TokenKind::Lt),
    (">", TokenKind::Gt),
    ("!", TokenKind::Bang),
    ("(", TokenKind::LParen),
    (")", TokenKind::RParen),
    ("[", TokenKind::LBracket),
    ("]", TokenKind::RBracket),
    (",", TokenKind::Comma),
];

impl TokenKind {
    /// Source spelling of an operator or punctuation token.
    pub fn symbol(&self) -> Option<&'static str> {
        SYMBOLS.iter().find(|(_, kind)| kind == self).map(|(text, _)| *text)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(text) = self.symbol() {
            return write!(f, "'{text}'");
        }
        match self {
            TokenKind::IntLit(n) => write!(f, "{n}"),
            TokenKind::FloatLit(x) => write!(f, "{x:?}"),
            TokenKind::StringLit(s) => write!(f, "{s:?}"),
            TokenKind::Ident(name) => f.write_str(name),
            TokenKind::True => f.write_str("true"),
            TokenKind::False => f.write_str("false"),
            TokenKind::Nil => f.write_str("nil"),
            TokenKind::Eof => f.write_str("end of input"),
            _ => f.write_str("?"),
        }
    }
}

/// The literal keywords. PhySL has no reserved words for control flow, so
/// everything else is a plain identifier.
pub fn keyword_lookup(word: &str) -> Option<TokenKind> {
    Some(match word {
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "nil" => TokenKind::Nil,
        _ => return None,
    })
}
