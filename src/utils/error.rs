//! Error handling for the pasc compiler

use crate::utils::Span;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Compiler error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // ==================== Lexer Errors ====================

    #[error("Illegal character '{ch}'")]
    IllegalCharacter { ch: char, span: Span },

    #[error("Unterminated string constant")]
    UnterminatedString { span: Span },

    #[error("Unterminated comment")]
    UnterminatedComment { span: Span },

    #[error("Invalid number literal \"{text}\"")]
    InvalidNumber { text: String, span: Span },

    // ==================== Parser Errors ====================

    #[error("Expected \"{expected}\" but found \"{got}\"")]
    UnexpectedToken {
        expected: String,
        got: String,
        span: Span,
    },

    #[error("Expected {0}")]
    Expected(String, Span),

    #[error("Expected identifier")]
    ExpectedIdent { span: Span },

    #[error("Expected type")]
    ExpectedType { span: Span },

    #[error("Illegal expression: {got}")]
    ExpectedExpr { got: String, span: Span },

    #[error("\"{keyword}\" outside of a loop")]
    OutsideLoop { keyword: String, span: Span },

    #[error("Type \"{ty}\" is too large")]
    TypeTooLarge { ty: String, span: Span },

    // ==================== Semantic Errors ====================

    #[error("Not defined \"{name}\"")]
    NotDefined { name: String, span: Span },

    #[error("Already defined \"{name}\"")]
    AlreadyDefined { name: String, span: Span },

    #[error("Forward declaration \"{name}\" is not resolved")]
    ForwardUnresolved { name: String, span: Span },

    #[error("Operation {op} not valid for types \"{left}\" and \"{right}\"")]
    InvalidOperation {
        op: String,
        left: String,
        right: String,
        span: Span,
    },

    #[error("Operation {op} not valid for type \"{ty}\"")]
    InvalidOperand { op: String, ty: String, span: Span },

    #[error("Expected {expected}, but found \"{actual}\"")]
    InvalidArgument {
        expected: String,
        actual: String,
        span: Span,
    },

    #[error("Cannot cast expression of type \"{from}\" to type \"{to}\"")]
    InvalidCast { from: String, to: String, span: Span },

    #[error("Expected lvalue")]
    ExpectedLvalue { span: Span },

    #[error("Argument count mismatch: expected {expected}, got {got}")]
    ArgCountMismatch {
        expected: usize,
        got: usize,
        span: Span,
    },

    #[error("Expression is not callable")]
    NotCallable { span: Span },

    // ==================== Backend Errors ====================

    #[error("Unsupported: {what}")]
    Unsupported { what: String, span: Span },

    #[error("Internal compiler error: {0}")]
    InternalInvariant(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl Error {
    /// Get the span associated with this error
    pub fn span(&self) -> Option<Span> {
        match self {
            Self::IllegalCharacter { span, .. } => Some(*span),
            Self::UnterminatedString { span } => Some(*span),
            Self::UnterminatedComment { span } => Some(*span),
            Self::InvalidNumber { span, .. } => Some(*span),
            Self::UnexpectedToken { span, .. } => Some(*span),
            Self::Expected(_, span) => Some(*span),
            Self::ExpectedIdent { span } => Some(*span),
            Self::ExpectedType { span } => Some(*span),
            Self::ExpectedExpr { span, .. } => Some(*span),
            Self::OutsideLoop { span, .. } => Some(*span),
            Self::TypeTooLarge { span, .. } => Some(*span),
            Self::NotDefined { span, .. } => Some(*span),
            Self::AlreadyDefined { span, .. } => Some(*span),
            Self::ForwardUnresolved { span, .. } => Some(*span),
            Self::InvalidOperation { span, .. } => Some(*span),
            Self::InvalidOperand { span, .. } => Some(*span),
            Self::InvalidArgument { span, .. } => Some(*span),
            Self::InvalidCast { span, .. } => Some(*span),
            Self::ExpectedLvalue { span } => Some(*span),
            Self::ArgCountMismatch { span, .. } => Some(*span),
            Self::NotCallable { span } => Some(*span),
            Self::Unsupported { span, .. } => Some(*span),
            Self::InternalInvariant(_) | Self::Io(_) => None,
        }
    }

    /// Defects in the compiler itself, as opposed to errors in the program being compiled
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::InternalInvariant(_))
    }

    /// Stable diagnostic code used in structured reports
    pub fn code(&self) -> &'static str {
        match self {
            Self::IllegalCharacter { .. } => "L0001",
            Self::UnterminatedString { .. } => "L0002",
            Self::UnterminatedComment { .. } => "L0003",
            Self::InvalidNumber { .. } => "L0004",
            Self::UnexpectedToken { .. } => "P0001",
            Self::Expected(..) => "P0002",
            Self::ExpectedIdent { .. } => "P0003",
            Self::ExpectedType { .. } => "P0004",
            Self::ExpectedExpr { .. } => "P0005",
            Self::OutsideLoop { .. } => "P0006",
            Self::TypeTooLarge { .. } => "P0007",
            Self::NotDefined { .. } => "E0001",
            Self::AlreadyDefined { .. } => "E0002",
            Self::ForwardUnresolved { .. } => "E0003",
            Self::InvalidOperation { .. } => "E0004",
            Self::InvalidOperand { .. } => "E0005",
            Self::InvalidArgument { .. } => "E0006",
            Self::InvalidCast { .. } => "E0007",
            Self::ExpectedLvalue { .. } => "E0008",
            Self::ArgCountMismatch { .. } => "E0009",
            Self::NotCallable { .. } => "E0010",
            Self::Unsupported { .. } => "G0001",
            Self::InternalInvariant(_) => "ICE",
            Self::Io(_) => "IO",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_messages_name_the_symbol() {
        let err = Error::NotDefined { name: "x".to_string(), span: Span::new(0, 1, 3, 7) };
        assert_eq!(err.to_string(), "Not defined \"x\"");
        assert_eq!(err.span().map(|s| (s.line, s.column)), Some((3, 7)));
    }

    #[test]
    fn test_internal_errors_are_distinguished() {
        assert!(Error::InternalInvariant("Index arity exceeds rank".into()).is_internal());
        assert!(!Error::ExpectedLvalue { span: Span::dummy() }.is_internal());
    }
}
