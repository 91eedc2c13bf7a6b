//! Frontend module - Lexer, Parser, Scopes, Semantic Analysis, Tree Printer

pub mod token;
pub mod lexer;
pub mod ast;
pub mod scope;
pub mod parser;
pub mod semantic;
pub mod printer;
