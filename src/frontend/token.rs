//! Token definitions for the Pascal-like source language

use std::fmt;

use serde::Serialize;

use crate::utils::Span;

/// A token produced by the lexer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    /// Source text as written (before lowercasing)
    pub text: String,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span, text: String) -> Self {
        Self { kind, span, text }
    }

    pub fn eof(span: Span) -> Self {
        Self { kind: TokenKind::Eof, span, text: String::new() }
    }
}

/// Token kinds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TokenKind {
    // ============ Literals ============
    /// Integer literal (decimal, `$` hex, `%` binary, `&` octal)
    IntLit(i64),
    /// Floating point literal
    DoubleLit(f64),
    /// Quoted string, possibly combined with `#nn` character codes
    StringLit(String),
    /// Identifier, lowercased
    Ident(String),

    // ============ Keywords ============
    And,
    Array,
    Begin,
    Break,
    Const,
    Continue,
    Div,
    Do,
    Downto,
    Else,
    End,
    False,
    For,
    Function,
    Goto,
    If,
    Label,
    Mod,
    Nil,
    Not,
    Of,
    Or,
    Out,
    Procedure,
    Program,
    Record,
    Repeat,
    Shl,
    Shr,
    Then,
    To,
    True,
    Type,
    Until,
    Var,
    While,
    With,
    Xor,

    // ============ Operators ============
    /// +
    Plus,
    /// -
    Minus,
    /// *
    Star,
    /// /
    Slash,
    /// **
    StarStar,
    /// @
    At,
    /// ^
    Caret,
    /// <<
    ShiftLeft,
    /// >>
    ShiftRight,
    /// ><
    SymmetricDiff,
    /// :=
    Assign,
    /// +=
    PlusAssign,
    /// -=
    MinusAssign,
    /// *=
    StarAssign,
    /// /=
    SlashAssign,
    /// =
    Eq,
    /// <
    Lt,
    /// <=
    Le,
    /// <>
    Ne,
    /// >
    Gt,
    /// >=
    Ge,

    // ============ Punctuation ============
    Colon,
    Comma,
    Dot,
    DotDot,
    Semicolon,
    LParen,
    RParen,
    LBracket,
    RBracket,

    Eof,
}

impl TokenKind {
    /// Try to convert a lowercased identifier to a keyword
    pub fn keyword_from_str(s: &str) -> Option<TokenKind> {
        let kind = match s {
            "and" => TokenKind::And,
            "array" => TokenKind::Array,
            "begin" => TokenKind::Begin,
            "break" => TokenKind::Break,
            "const" => TokenKind::Const,
            "continue" => TokenKind::Continue,
            "div" => TokenKind::Div,
            "do" => TokenKind::Do,
            "downto" => TokenKind::Downto,
            "else" => TokenKind::Else,
            "end" => TokenKind::End,
            "false" => TokenKind::False,
            "for" => TokenKind::For,
            "function" => TokenKind::Function,
            "goto" => TokenKind::Goto,
            "if" => TokenKind::If,
            "label" => TokenKind::Label,
            "mod" => TokenKind::Mod,
            "nil" => TokenKind::Nil,
            "not" => TokenKind::Not,
            "of" => TokenKind::Of,
            "or" => TokenKind::Or,
            "out" => TokenKind::Out,
            "procedure" => TokenKind::Procedure,
            "program" => TokenKind::Program,
            "record" => TokenKind::Record,
            "repeat" => TokenKind::Repeat,
            "shl" => TokenKind::Shl,
            "shr" => TokenKind::Shr,
            "then" => TokenKind::Then,
            "to" => TokenKind::To,
            "true" => TokenKind::True,
            "type" => TokenKind::Type,
            "until" => TokenKind::Until,
            "var" => TokenKind::Var,
            "while" => TokenKind::While,
            "with" => TokenKind::With,
            "xor" => TokenKind::Xor,
            _ => return None,
        };
        Some(kind)
    }

    pub fn is_keyword(&self) -> bool {
        self.group() == "Keyword"
    }

    /// Token group as printed by the token dump
    pub fn group(&self) -> &'static str {
        match self {
            TokenKind::IntLit(_) => "Int",
            TokenKind::DoubleLit(_) => "Double",
            TokenKind::StringLit(_) => "String",
            TokenKind::Ident(_) => "Id",
            TokenKind::Eof => "EOF",
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::StarStar
            | TokenKind::At
            | TokenKind::Caret
            | TokenKind::ShiftLeft
            | TokenKind::ShiftRight
            | TokenKind::SymmetricDiff
            | TokenKind::Assign
            | TokenKind::PlusAssign
            | TokenKind::MinusAssign
            | TokenKind::StarAssign
            | TokenKind::SlashAssign
            | TokenKind::Eq
            | TokenKind::Lt
            | TokenKind::Le
            | TokenKind::Ne
            | TokenKind::Gt
            | TokenKind::Ge => "Operator",
            TokenKind::Colon
            | TokenKind::Comma
            | TokenKind::Dot
            | TokenKind::DotDot
            | TokenKind::Semicolon
            | TokenKind::LParen
            | TokenKind::RParen
            | TokenKind::LBracket
            | TokenKind::RBracket => "Separator",
            _ => "Keyword",
        }
    }

    /// Precedence level of a binary operator, lowest first.
    /// Returns None if not a binary operator.
    pub fn binary_precedence(&self) -> Option<u8> {
        match self {
            // Relational
            TokenKind::Eq
            | TokenKind::Ne
            | TokenKind::Lt
            | TokenKind::Le
            | TokenKind::Gt
            | TokenKind::Ge => Some(0),

            // Additive
            TokenKind::Plus | TokenKind::Minus | TokenKind::Or | TokenKind::Xor => Some(1),

            // Multiplicative
            TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Div
            | TokenKind::Mod
            | TokenKind::And
            | TokenKind::Shl
            | TokenKind::Shr
            | TokenKind::ShiftLeft
            | TokenKind::ShiftRight => Some(2),

            _ => None,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            TokenKind::IntLit(n) => return write!(f, "{}", n),
            TokenKind::DoubleLit(n) => return write!(f, "{}", n),
            TokenKind::StringLit(s) => return write!(f, "'{}'", s),
            TokenKind::Ident(name) => return f.write_str(name),
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::StarStar => "**",
            TokenKind::At => "@",
            TokenKind::Caret => "^",
            TokenKind::ShiftLeft => "<<",
            TokenKind::ShiftRight => ">>",
            TokenKind::SymmetricDiff => "><",
            TokenKind::Assign => ":=",
            TokenKind::PlusAssign => "+=",
            TokenKind::MinusAssign => "-=",
            TokenKind::StarAssign => "*=",
            TokenKind::SlashAssign => "/=",
            TokenKind::Eq => "=",
            TokenKind::Lt => "<",
            TokenKind::Le => "<=",
            TokenKind::Ne => "<>",
            TokenKind::Gt => ">",
            TokenKind::Ge => ">=",
            TokenKind::Colon => ":",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
            TokenKind::DotDot => "..",
            TokenKind::Semicolon => ";",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::Eof => "end of file",
            keyword => return write!(f, "{}", format!("{:?}", keyword).to_lowercase()),
        };
        f.write_str(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_keyword_lookup() {
        assert_eq!(TokenKind::keyword_from_str("downto"), Some(TokenKind::Downto));
        assert_eq!(TokenKind::keyword_from_str("forward"), None);
        assert!(TokenKind::Begin.is_keyword());
        assert!(!TokenKind::Ident("x".into()).is_keyword());
    }

    #[test]
    fn test_precedence_levels() {
        assert!(TokenKind::Eq.binary_precedence() < TokenKind::Plus.binary_precedence());
        assert!(TokenKind::Or.binary_precedence() < TokenKind::And.binary_precedence());
        assert_eq!(TokenKind::Caret.binary_precedence(), None);
    }

    #[test]
    fn test_display_matches_source_text() {
        assert_eq!(TokenKind::Downto.to_string(), "downto");
        assert_eq!(TokenKind::PlusAssign.to_string(), "+=");
        assert_eq!(TokenKind::Ident("foo".into()).to_string(), "foo");
    }
}
