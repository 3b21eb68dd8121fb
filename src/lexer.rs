// Lexer: converts PhySL source text into a stream of Tokens
//
// Hand-written byte scanner, one token per call.
//
// DESIGN DECISIONS:
//
//   1. Identifiers may start with `_`, so placeholder spellings (`_1`, `__2`)
//      lex as ordinary identifiers. Only the pattern parser gives them a
//      special meaning.
//
//   2. Numbers: integers and floats (with optional exponent). A leading `-`
//      is never part of the literal; it is the unary minus operator.
//
//   3. Strings use double quotes and support \n \t \\ \" escapes. Any other
//      escape is kept verbatim, backslash included.
//
//   4. Comments: // line comments and /* block comments */ (no nesting).

use crate::error::{ParseError, ParseErrorKind};
use crate::token::{keyword_lookup, Span, Token, TokenKind, SYMBOLS};

type Result<T> = std::result::Result<T, ParseError>;

/// Where a token started.
#[derive(Clone, Copy)]
struct Mark {
    pos: usize,
    line: usize,
    col: usize,
}

pub struct Lexer<'src> {
    src: &'src str,
    pos: usize,
    line: usize,
    col: usize,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str) -> Self {
        Lexer {
            src,
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    /// Every token of the source, ending with Eof.
    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = matches!(token.kind, TokenKind::Eof);
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_trivia()?;
        let mark = self.mark();
        let Some(c) = self.peek() else {
            return Ok(Token::new(TokenKind::Eof, self.span_from(mark)));
        };
        let kind = match c {
            '"' => self.string(mark)?,
            '0'..='9' => self.number(mark)?,
            c if c == '_' || c.is_ascii_alphabetic() => self.word(),
            _ => self.symbol(mark, c)?,
        };
        Ok(Token::new(kind, self.span_from(mark)))
    }

    // Cursor

    fn rest(&self) -> &'src str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_at(&self, ahead: usize) -> Option<u8> {
        self.src.as_bytes().get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn bump_while(&mut self, keep: impl Fn(char) -> bool) {
        while self.peek().is_some_and(&keep) {
            self.bump();
        }
    }

    fn mark(&self) -> Mark {
        Mark {
            pos: self.pos,
            line: self.line,
            col: self.col,
        }
    }

    fn span_from(&self, mark: Mark) -> Span {
        Span::new(mark.pos, self.pos - mark.pos, mark.line, mark.col)
    }

    fn error(&self, kind: ParseErrorKind, mark: Mark) -> ParseError {
        ParseError::new(kind, self.span_from(mark))
    }

    // Scanners

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            self.bump_while(char::is_whitespace);
            if self.rest().starts_with("//") {
                self.bump_while(|c| c != '\n');
            } else if self.rest().starts_with("/*") {
                let mark = self.mark();
                self.bump();
                self.bump();
                while !self.rest().starts_with("*/") {
                    if self.bump().is_none() {
                        return Err(self.error(ParseErrorKind::UnterminatedComment, mark));
                    }
                }
                self.bump();
                self.bump();
            } else {
                return Ok(());
            }
        }
    }

    fn symbol(&mut self, mark: Mark, c: char) -> Result<TokenKind> {
        let Some((text, kind)) = SYMBOLS.iter().find(|(text, _)| self.rest().starts_with(text)) else {
            self.bump();
            return Err(self.error(ParseErrorKind::UnexpectedChar(c), mark));
        };
        for _ in text.chars() {
            self.bump();
        }
        Ok(kind.clone())
    }

    fn string(&mut self, mark: Mark) -> Result<TokenKind> {
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(ParseErrorKind::UnterminatedString, mark)),
                Some('"') => return Ok(TokenKind::StringLit(value)),
                Some('\\') => match self.bump() {
                    None => return Err(self.error(ParseErrorKind::UnterminatedString, mark)),
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(c @ ('\\' | '"')) => value.push(c),
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                },
                Some(c) => value.push(c),
            }
        }
    }

    fn number(&mut self, mark: Mark) -> Result<TokenKind> {
        let digits = |c: char| c.is_ascii_digit();
        self.bump_while(digits);
        let mut float = false;
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            float = true;
            self.bump();
            self.bump_while(digits);
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            float = true;
            self.bump();
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            if !self.peek().is_some_and(digits) {
                let raw = self.src[mark.pos..self.pos].to_string();
                return Err(self.error(ParseErrorKind::InvalidNumber(raw), mark));
            }
            self.bump_while(digits);
        }

        let raw = &self.src[mark.pos..self.pos];
        let parsed = if float {
            // 1e400 would read as infinity, which has no literal spelling
            raw.parse::<f64>().ok().filter(|x| x.is_finite()).map(TokenKind::FloatLit)
        } else {
            raw.parse().map(TokenKind::IntLit).ok()
        };
        parsed.ok_or_else(|| self.error(ParseErrorKind::InvalidNumber(raw.to_string()), mark))
    }

    fn word(&mut self) -> TokenKind {
        let start = self.pos;
        self.bump_while(|c| c == '_' || c.is_ascii_alphanumeric());
        let word = &self.src[start..self.pos];
        keyword_lookup(word).unwrap_or_else(|| TokenKind::Ident(word.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TokenKind::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn error(src: &str) -> ParseError {
        Lexer::new(src).tokenize().unwrap_err()
    }

    fn ident(name: &str) -> TokenKind {
        Ident(name.to_string())
    }

    #[test]
    fn call_tokens() {
        assert_eq!(
            kinds("define(f, x, 1)"),
            [ident("define"), LParen, ident("f"), Comma, ident("x"), Comma, IntLit(1), RParen, Eof]
        );
    }

    #[test]
    fn number_literals() {
        assert_eq!(
            kinds("42 3.25 1e-4 2E3"),
            [IntLit(42), FloatLit(3.25), FloatLit(1e-4), FloatLit(2e3), Eof]
        );
        // no trailing-dot floats
        assert_eq!(error("7.").kind, ParseErrorKind::UnexpectedChar('.'));
    }

    #[test]
    fn malformed_numbers() {
        assert_eq!(error("1e+").kind, ParseErrorKind::InvalidNumber("1e+".into()));
        assert!(matches!(error("99999999999999999999").kind, ParseErrorKind::InvalidNumber(_)));
        assert_eq!(error("1e400").kind, ParseErrorKind::InvalidNumber("1e400".into()));
        assert_eq!(kinds("1e308"), [FloatLit(1e308), Eof]);
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(kinds(r#""line\none \"q\" \d""#), [StringLit("line\none \"q\" \\d".into()), Eof]);
        assert_eq!(kinds("\"héllo\""), [StringLit("héllo".into()), Eof]);
        assert_eq!(error("\"abc").kind, ParseErrorKind::UnterminatedString);
        assert_eq!(error("\"abc\\").kind, ParseErrorKind::UnterminatedString);
    }

    #[test]
    fn operators_take_the_longest_spelling() {
        assert_eq!(
            kinds("+-*/% == != < <= > >= && || !x"),
            [
                Plus, Minus, Star, Slash, Percent, EqEq, BangEq, Lt, LtEq, Gt, GtEq, AmpAmp, PipePipe, Bang,
                ident("x"), Eof
            ]
        );
    }

    #[test]
    fn lone_ampersand_rejected() {
        let err = error("a & b");
        assert_eq!(err.kind, ParseErrorKind::UnexpectedChar('&'));
        assert_eq!(err.column(), Some(3));
        assert_eq!(error("a = b").kind, ParseErrorKind::UnexpectedChar('='));
    }

    #[test]
    fn placeholders_and_keywords() {
        assert_eq!(
            kinds("_1 __2 _x true false nil"),
            [ident("_1"), ident("__2"), ident("_x"), True, False, Nil, Eof]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(kinds("a // trailing\n/* block\n comment */ b"), [ident("a"), ident("b"), Eof]);
        assert_eq!(error("a /* never closed").kind, ParseErrorKind::UnterminatedComment);
    }

    #[test]
    fn spans_track_lines_and_columns() {
        let tokens = Lexer::new("ab\n  cd <=").tokenize().unwrap();
        let at: Vec<_> = tokens.iter().map(|t| (t.span.line, t.span.col, t.span.len)).collect();
        assert_eq!(at, [(1, 1, 2), (2, 3, 2), (2, 6, 2), (2, 8, 0)]);
    }

    #[test]
    fn columns_count_characters_not_bytes() {
        let err = error("\"héllo\" $");
        assert_eq!(err.kind, ParseErrorKind::UnexpectedChar('$'));
        assert_eq!(err.column(), Some(9));
        let tokens = Lexer::new("\"ü\" + 1").tokenize().unwrap();
        let cols: Vec<_> = tokens.iter().map(|t| t.span.col).collect();
        assert_eq!(cols, [1, 5, 7, 8]);
    }
}
