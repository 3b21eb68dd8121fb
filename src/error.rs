// Error types for physl
//
// Three layers, one per pipeline stage:
//
//   ParseError    malformed source text, always positioned
//   CompileError  structural resolution problems (unbound names, arity, ...)
//   EvalError     runtime failures carried through failed futures
//
// Parse and compile errors abort a whole compilation unit. Evaluation errors
// are cloneable because a failed future hands the same error to every
// continuation waiting on it.

use std::fmt;

use thiserror::Error;

use crate::token::Span;

/// Result type for the crate's public entry points.
pub type Result<T> = std::result::Result<T, Error>;

/// Umbrella error for the parse → compile → evaluate pipeline.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("configuration error: {0}")]
    Config(String),
}

// Parse errors

/// Malformed source text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub span: Option<Span>,
    pub source_line: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseErrorKind {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated block comment")]
    UnterminatedComment,
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("expected {expected}, got {got}")]
    UnexpectedToken { expected: String, got: String },
    #[error("unexpected end of input")]
    UnexpectedEof,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, span: Span) -> Self {
        Self {
            kind,
            span: Some(span),
            source_line: None,
        }
    }

    /// Attach the text of the offending line, looked up in `source`.
    pub fn with_source(mut self, source: &str) -> Self {
        if let Some(span) = self.span {
            self.source_line = source
                .lines()
                .nth(span.line.saturating_sub(1))
                .map(str::to_string);
        }
        self
    }

    /// 1-based line of the error, if known.
    pub fn line(&self) -> Option<usize> {
        self.span.map(|s| s.line)
    }

    /// 1-based column of the error, if known.
    pub fn column(&self) -> Option<usize> {
        self.span.map(|s| s.col)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(span) = &self.span {
            write!(f, "[{}:{}] ", span.line, span.col)?;
        }
        write!(f, "{}", self.kind)?;
        if let Some(line) = &self.source_line {
            write!(f, "\n  | {line}")?;
            if let Some(span) = &self.span {
                write!(f, "\n  | {}^", " ".repeat(span.col.saturating_sub(1)))?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

// Compile errors

/// A structural problem found while building the execution tree.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub span: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileErrorKind {
    #[error("unbound name '{0}'")]
    UnboundName(String),
    #[error("'{name}' expects {expected} argument(s), got {got}")]
    ArityMismatch {
        name: String,
        expected: String,
        got: usize,
    },
    #[error("duplicate pattern '{pattern}' for primitive '{name}'")]
    DuplicatePattern { name: String, pattern: String },
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("invalid operand for '{name}': {reason}")]
    InvalidOperand { name: String, reason: String },
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, span: Option<Span>) -> Self {
        Self { kind, span }
    }

    pub fn unbound(name: impl Into<String>, span: Option<Span>) -> Self {
        Self::new(CompileErrorKind::UnboundName(name.into()), span)
    }

    pub fn arity(
        name: impl Into<String>,
        expected: impl Into<String>,
        got: usize,
        span: Option<Span>,
    ) -> Self {
        Self::new(
            CompileErrorKind::ArityMismatch {
                name: name.into(),
                expected: expected.into(),
                got,
            },
            span,
        )
    }

    pub fn invalid_operand(
        name: impl Into<String>,
        reason: impl Into<String>,
        span: Option<Span>,
    ) -> Self {
        Self::new(
            CompileErrorKind::InvalidOperand {
                name: name.into(),
                reason: reason.into(),
            },
            span,
        )
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(span) = &self.span {
            write!(f, "[{}:{}] ", span.line, span.col)?;
        }
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for CompileError {}

// Evaluation errors

/// A runtime failure. Travels through failed futures.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    pub kind: EvalErrorKind,
    /// Fully-qualified name of the primitive that raised the error.
    pub primitive: Option<String>,
    /// Source position of that primitive.
    pub span: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalErrorKind {
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("distribution invariant violated: {0}")]
    DistributionInvariantViolation(String),
    #[error("assertion failed: {0}")]
    AssertionFailure(String),
    #[error("function expects {expected} argument(s), got {got}")]
    ArityMismatch { expected: usize, got: usize },
    #[error("communication failure: {0}")]
    Communication(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl EvalError {
    pub fn new(kind: EvalErrorKind) -> Self {
        Self {
            kind,
            primitive: None,
            span: None,
        }
    }

    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::TypeMismatch(msg.into()))
    }

    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::ShapeMismatch(msg.into()))
    }

    pub fn distribution(msg: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::DistributionInvariantViolation(msg.into()))
    }

    pub fn assertion(msg: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::AssertionFailure(msg.into()))
    }

    pub fn communication(msg: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::Communication(msg.into()))
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(EvalErrorKind::InvalidArgument(msg.into()))
    }

    /// Record where the error happened. The innermost primitive wins: once a
    /// location is attached, enclosing nodes leave it alone.
    pub fn at(mut self, primitive: &str, span: Option<Span>) -> Self {
        if self.primitive.is_none() {
            self.primitive = Some(primitive.to_string());
            self.span = span;
        }
        self
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(span) = &self.span {
            write!(f, "[{}:{}] ", span.line, span.col)?;
        }
        if let Some(name) = &self.primitive {
            write!(f, "{name}: ")?;
        }
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for EvalError {}
