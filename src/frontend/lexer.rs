//! Lexer for the Pascal-like source language
//!
//! Converts source code into a stream of tokens. Identifiers and keywords are
//! case-insensitive; identifiers are lowercased here so later passes can compare
//! names directly.

use log::trace;

use crate::frontend::token::{Token, TokenKind};
use crate::utils::{Error, Result, Span};

/// The lexer state
pub struct Lexer {
    /// Source code as characters
    source: Vec<char>,
    /// Current position in source
    pos: usize,
    /// Start position of current token
    start: usize,
    line: u32,
    column: u32,
    start_line: u32,
    start_column: u32,
}

impl Lexer {
    /// Create a new lexer for the given source code
    pub fn new(source: &str) -> Self {
        Self {
            source: source.chars().collect(),
            pos: 0,
            start: 0,
            line: 1,
            column: 1,
            start_line: 1,
            start_column: 1,
        }
    }

    /// Get the current character without advancing
    fn peek(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    /// Get the next character without advancing
    fn peek_next(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    /// Advance to the next character, tracking line and column
    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    /// Advance past `expected` if it is the current character
    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Create a span from token start to current position
    fn make_span(&self) -> Span {
        Span::new(self.start, self.pos, self.start_line, self.start_column)
    }

    fn text(&self) -> String {
        self.source[self.start..self.pos].iter().collect()
    }

    /// Create a token with the current span
    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.make_span(), self.text())
    }

    /// Skip whitespace and the three comment forms
    fn skip_whitespace(&mut self) -> Result<()> {
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance();
                }
                '/' if self.peek_next() == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                '{' => {
                    let span = self.here();
                    self.advance();
                    loop {
                        match self.advance() {
                            Some('}') => break,
                            Some(_) => {}
                            None => return Err(Error::UnterminatedComment { span }),
                        }
                    }
                }
                '(' if self.peek_next() == Some('*') => {
                    let span = self.here();
                    self.advance();
                    self.advance();
                    loop {
                        match (self.peek(), self.peek_next()) {
                            (Some('*'), Some(')')) => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            (Some(_), _) => {
                                self.advance();
                            }
                            (None, _) => return Err(Error::UnterminatedComment { span }),
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Single-character span at the current position
    fn here(&self) -> Span {
        Span::new(self.pos, self.pos + 1, self.line, self.column)
    }

    /// Read an identifier or keyword
    fn read_identifier(&mut self) -> Token {
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }

        let name = self.text().to_lowercase();
        let kind = TokenKind::keyword_from_str(&name).unwrap_or(TokenKind::Ident(name));
        self.make_token(kind)
    }

    fn skip_digits(&mut self, radix: u32) {
        while let Some(c) = self.peek() {
            if c.is_digit(radix) {
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Read a decimal integer or a double literal
    fn read_number(&mut self) -> Result<Token> {
        let mut is_double = false;
        self.skip_digits(10);

        // `1..5` is a range, not a double
        if self.peek() == Some('.') && self.peek_next().map_or(false, |c| c.is_ascii_digit()) {
            is_double = true;
            self.advance();
            self.skip_digits(10);
        }

        if matches!(self.peek(), Some('e') | Some('E')) {
            let signed = matches!(self.peek_next(), Some('+') | Some('-'));
            let digit_at = if signed { self.pos + 2 } else { self.pos + 1 };
            if self.source.get(digit_at).map_or(false, |c| c.is_ascii_digit()) {
                is_double = true;
                self.advance();
                if signed {
                    self.advance();
                }
                self.skip_digits(10);
            }
        }

        let text = self.text();
        let invalid = || Error::InvalidNumber { text: text.clone(), span: self.make_span() };
        let kind = if is_double {
            TokenKind::DoubleLit(text.parse().map_err(|_| invalid())?)
        } else {
            TokenKind::IntLit(text.parse().map_err(|_| invalid())?)
        };
        Ok(self.make_token(kind))
    }

    /// Read `$ff`, `%1010` or `&17`
    fn read_radix_number(&mut self, radix: u32) -> Result<Token> {
        self.advance(); // prefix
        self.skip_digits(radix);
        let text = self.text();
        let value = i64::from_str_radix(&text[1..], radix).map_err(|_| Error::InvalidNumber {
            text: text.clone(),
            span: self.make_span(),
        })?;
        Ok(self.make_token(TokenKind::IntLit(value)))
    }

    /// Read a string made of quoted runs and `#nn` character codes
    fn read_string(&mut self) -> Result<Token> {
        let mut value = String::new();

        loop {
            match self.peek() {
                Some('\'') => {
                    self.advance();
                    loop {
                        match self.peek() {
                            None | Some('\n') => {
                                return Err(Error::UnterminatedString { span: self.make_span() })
                            }
                            Some('\'') => {
                                self.advance();
                                if self.eat('\'') {
                                    value.push('\'');
                                } else {
                                    break;
                                }
                            }
                            Some(c) => {
                                value.push(c);
                                self.advance();
                            }
                        }
                    }
                }
                Some('#') => {
                    let span = self.here();
                    self.advance();
                    let digits_start = self.pos;
                    let radix = if self.eat('$') { 16 } else { 10 };
                    let code_start = self.pos;
                    self.skip_digits(radix);
                    let code: String = self.source[code_start..self.pos].iter().collect();
                    let ch = u32::from_str_radix(&code, radix)
                        .ok()
                        .and_then(char::from_u32)
                        .ok_or_else(|| Error::InvalidNumber {
                            text: self.source[digits_start - 1..self.pos].iter().collect(),
                            span,
                        })?;
                    value.push(ch);
                }
                _ => break,
            }
        }

        Ok(self.make_token(TokenKind::StringLit(value)))
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace()?;
        self.start = self.pos;
        self.start_line = self.line;
        self.start_column = self.column;

        let Some(c) = self.peek() else {
            return Ok(Token::eof(self.make_span()));
        };

        if c.is_ascii_alphabetic() || c == '_' {
            return Ok(self.read_identifier());
        }
        if c.is_ascii_digit() {
            return self.read_number();
        }
        if c == '\'' || c == '#' {
            return self.read_string();
        }
        let radix = match c {
            '$' => Some(16),
            '%' => Some(2),
            '&' => Some(8),
            _ => None,
        };
        if let Some(radix) = radix {
            if self.peek_next().map_or(false, |d| d.is_digit(radix)) {
                return self.read_radix_number(radix);
            }
        }

        self.advance();
        let kind = match c {
            '+' => {
                if self.eat('=') {
                    TokenKind::PlusAssign
                } else {
                    TokenKind::Plus
                }
            }
            '-' => {
                if self.eat('=') {
                    TokenKind::MinusAssign
                } else {
                    TokenKind::Minus
                }
            }
            '*' => {
                if self.eat('*') {
                    TokenKind::StarStar
                } else if self.eat('=') {
                    TokenKind::StarAssign
                } else {
                    TokenKind::Star
                }
            }
            '/' => {
                if self.eat('=') {
                    TokenKind::SlashAssign
                } else {
                    TokenKind::Slash
                }
            }
            '<' => {
                if self.eat('<') {
                    TokenKind::ShiftLeft
                } else if self.eat('=') {
                    TokenKind::Le
                } else if self.eat('>') {
                    TokenKind::Ne
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.eat('>') {
                    TokenKind::ShiftRight
                } else if self.eat('=') {
                    TokenKind::Ge
                } else if self.eat('<') {
                    TokenKind::SymmetricDiff
                } else {
                    TokenKind::Gt
                }
            }
            ':' => {
                if self.eat('=') {
                    TokenKind::Assign
                } else {
                    TokenKind::Colon
                }
            }
            '.' => {
                if self.eat('.') {
                    TokenKind::DotDot
                } else {
                    TokenKind::Dot
                }
            }
            '=' => TokenKind::Eq,
            '@' => TokenKind::At,
            '^' => TokenKind::Caret,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            _ => return Err(Error::IllegalCharacter { ch: c, span: self.make_span() }),
        };

        Ok(self.make_token(kind))
    }

    /// Tokenize the entire source and return all tokens, ending with `Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            trace!("token {:?} at {}", token.kind, token.span);
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_simple_program() {
        let tokens = kinds("Program P; BEGIN end.");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Program,
                TokenKind::Ident("p".into()),
                TokenKind::Semicolon,
                TokenKind::Begin,
                TokenKind::End,
                TokenKind::Dot,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = kinds("42 3.5 $FF %101 &17 1e3 2.5E-1");
        assert!(matches!(tokens[0], TokenKind::IntLit(42)));
        assert!(matches!(tokens[1], TokenKind::DoubleLit(f) if (f - 3.5).abs() < 1e-9));
        assert!(matches!(tokens[2], TokenKind::IntLit(255)));
        assert!(matches!(tokens[3], TokenKind::IntLit(5)));
        assert!(matches!(tokens[4], TokenKind::IntLit(15)));
        assert!(matches!(tokens[5], TokenKind::DoubleLit(f) if (f - 1000.0).abs() < 1e-9));
        assert!(matches!(tokens[6], TokenKind::DoubleLit(f) if (f - 0.25).abs() < 1e-9));
    }

    #[test]
    fn test_range_is_not_a_double() {
        let tokens = kinds("1..10");
        assert_eq!(
            tokens,
            vec![TokenKind::IntLit(1), TokenKind::DotDot, TokenKind::IntLit(10), TokenKind::Eof]
        );
    }

    #[test]
    fn test_strings() {
        let tokens = kinds("'it''s' 'a'#10'b' #65");
        assert_eq!(tokens[0], TokenKind::StringLit("it's".into()));
        assert_eq!(tokens[1], TokenKind::StringLit("a\nb".into()));
        assert_eq!(tokens[2], TokenKind::StringLit("A".into()));
    }

    #[test]
    fn test_operators() {
        let tokens = kinds(":= += -= *= /= <> <= >= << >> >< ** ..");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Assign,
                TokenKind::PlusAssign,
                TokenKind::MinusAssign,
                TokenKind::StarAssign,
                TokenKind::SlashAssign,
                TokenKind::Ne,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::ShiftLeft,
                TokenKind::ShiftRight,
                TokenKind::SymmetricDiff,
                TokenKind::StarStar,
                TokenKind::DotDot,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_and_positions() {
        let mut lexer = Lexer::new("{ a }\n(* b *) // c\n  x");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Ident("x".into()));
        assert_eq!((tokens[0].span.line, tokens[0].span.column), (3, 3));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            Lexer::new("x ? y").tokenize(),
            Err(Error::IllegalCharacter { ch: '?', .. })
        ));
        assert!(matches!(
            Lexer::new("'abc").tokenize(),
            Err(Error::UnterminatedString { .. })
        ));
        assert!(matches!(
            Lexer::new("{ never closed").tokenize(),
            Err(Error::UnterminatedComment { .. })
        ));
        assert!(matches!(
            Lexer::new("99999999999999999999").tokenize(),
            Err(Error::InvalidNumber { .. })
        ));
    }
}
