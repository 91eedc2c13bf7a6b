//! Backend module - Code generation

pub mod codegen;

// NASM x86-64 backend
pub mod asm;

pub use asm::NasmCodeGen;
pub use codegen::CodeGen;
