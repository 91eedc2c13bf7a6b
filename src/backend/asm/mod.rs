//! NASM Backend - Generate x86-64 assembly from the analyzed tree
//!
//! The output is assembled with `nasm -f elf64` and linked against the C
//! runtime, which provides `printf` and `scanf`.

mod nasm_codegen;

pub use nasm_codegen::NasmCodeGen;
