//! Compilation pipeline shared by the CLI subcommands
//!
//! source -> tokens -> parsed program -> analyzed program -> NASM text

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context};
use log::debug;

use crate::backend::{CodeGen, NasmCodeGen};
use crate::feedback::CompilationStats;
use crate::frontend::ast::Program;
use crate::frontend::lexer::Lexer;
use crate::frontend::parser::Parser;
use crate::frontend::printer::print_program;
use crate::frontend::semantic::analyze;
use crate::frontend::token::Token;
use crate::utils::Result;

/// Tokenize a source file
pub fn tokenize_source(source: &str) -> Result<Vec<Token>> {
    Lexer::new(source).tokenize()
}

/// Run the lexer, parser and semantic analyzer
pub fn check_source(source: &str) -> Result<Program> {
    let mut program = Parser::new(source)?.parse_program()?;
    debug!("parsed {} routines", program.routines.len());
    analyze(&mut program)?;
    debug!("semantic analysis passed");
    Ok(program)
}

/// Analyze a source file and render the decorated tree with its scopes
pub fn dump_tree(source: &str) -> Result<String> {
    check_source(source).map(|program| print_program(&program))
}

/// Compile a source file to NASM assembly
pub fn compile_source(source: &str) -> Result<String> {
    compile_with_stats(source).map(|(asm, _)| asm)
}

/// Compile a source file, also reporting statistics about the unit
pub fn compile_with_stats(source: &str) -> Result<(String, CompilationStats)> {
    let program = check_source(source)?;
    let mut codegen = NasmCodeGen::new();
    debug!("generating code with the {} backend for {}", codegen.name(), codegen.target_triple());
    let asm = codegen.generate(&program)?;
    let stats = CompilationStats {
        routine_count: program.routines.len(),
        type_count: program.types.len(),
        loc: source.lines().count(),
        asm_lines: asm.lines().count(),
    };
    Ok((asm, stats))
}

/// Assemble with nasm and link against the C runtime
pub fn link(asm_path: &Path, exe_path: &Path) -> anyhow::Result<()> {
    let obj_path = asm_path.with_extension("o");
    run_tool(
        Command::new("nasm")
            .args(["-f", "elf64", "-o"])
            .arg(&obj_path)
            .arg(asm_path),
    )?;
    run_tool(
        Command::new("gcc")
            .arg("-no-pie")
            .arg("-o")
            .arg(exe_path)
            .arg(&obj_path),
    )?;
    let _ = fs::remove_file(&obj_path);
    Ok(())
}

fn run_tool(command: &mut Command) -> anyhow::Result<()> {
    let program = command.get_program().to_string_lossy().into_owned();
    debug!("running {:?}", command);
    let output = command
        .output()
        .with_context(|| format!("could not run {}", program))?;
    if !output.status.success() {
        bail!(
            "{} failed: {}",
            program,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::{ExprKind, Stmt};
    use crate::frontend::token::TokenKind;
    use crate::types::TypeId;
    use crate::utils::Error;
    use pretty_assertions::assert_eq;

    fn text_lines(asm: &str) -> Vec<String> {
        asm.split("section .text")
            .nth(1)
            .unwrap()
            .lines()
            .map(|line| line.trim().to_string())
            .collect()
    }

    #[test]
    fn test_scenario_integer_write() {
        let source = "var x: integer; begin x := 2 + 3; write(x) end.";
        let program = check_source(source).unwrap();
        let Stmt::Assign { target, value, .. } = &program.body[0] else {
            panic!("expected assignment");
        };
        assert_eq!(target.ty, Some(TypeId::INT));
        assert!(!matches!(value.kind, ExprKind::Cast { .. }));

        let asm = compile_source(source).unwrap();
        let lines = text_lines(&asm);
        assert_eq!(lines.iter().filter(|l| *l == "call printf").count(), 1);
        assert!(lines.iter().any(|l| l == "lea rdi, [rel fmt_int]"));
        assert!(!lines.iter().any(|l| l.contains("xmm")));
    }

    #[test]
    fn test_scenario_double_addition() {
        let source = "var y: double; begin y := 1 + 2.5 end.";
        let program = check_source(source).unwrap();
        let Stmt::Assign { value, .. } = &program.body[0] else {
            panic!("expected assignment");
        };
        let ExprKind::Binary { left, .. } = &value.kind else {
            panic!("expected binary");
        };
        assert!(matches!(left.kind, ExprKind::Cast { target: TypeId::DOUBLE, .. }));

        let lines = text_lines(&compile_source(source).unwrap());
        assert!(lines.iter().any(|l| l == "addsd xmm0, xmm1"));
        assert!(!lines.iter().any(|l| l == "add rax, rcx"));
    }

    #[test]
    fn test_scenario_high_of_integer() {
        let err = check_source("var x: integer; begin writeln(high(x)) end.").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { ref expected, .. } if expected == "array type"));
    }

    #[test]
    fn test_scenario_pointer_arithmetic() {
        let source = "var p: ^integer; begin p := p + 1 end.";
        let program = check_source(source).unwrap();
        let Stmt::Assign { value, .. } = &program.body[0] else {
            panic!("expected assignment");
        };
        assert_eq!(program.types.name(value.ty.unwrap()), "^integer");
        assert!(compile_source(source).is_ok());
    }

    #[test]
    fn test_scenario_for_break() {
        let lines = text_lines(&compile_source("var i: integer; begin for i := 1 to 10 do break end.").unwrap());
        let end = lines.iter().find_map(|l| l.strip_prefix("jg ")).unwrap().to_string();
        let jump = lines.iter().position(|l| *l == format!("jmp {}", end)).unwrap();
        let target = lines.iter().position(|l| *l == format!("{}:", end)).unwrap();
        // Only the step and the back edge sit between the jump and the loop end
        let between: Vec<&String> = lines[jump + 1..target].iter().collect();
        assert!(between.iter().all(|l| !l.starts_with("call")));
        assert_eq!(between.last().map(|l| l.starts_with("jmp label_")), Some(true));
    }

    #[test]
    fn test_full_program() {
        let source = "
            program demo;
            type
              vec = array[0..3] of integer;
              node = record value: integer; next: ^node end;
            const limit = 3;
            var v: vec; i, total: integer; n: node;

            function sum(a: array of integer): integer;
            var k: integer;
            begin
              sum := 0;
              for k := 0 to high(a) do sum += a[k]
            end;

            begin
              for i := 0 to limit do v[i] := i * i;
              total := sum(v);
              n.value := total;
              if (total > 10) and (n.next = nil) then writeln('big ', total)
              else writeln('small')
            end.";
        let (asm, stats) = compile_with_stats(source).unwrap();
        assert_eq!(stats.routine_count, 1);
        assert!(asm.contains("___sum:"));
        assert!(asm.contains("___total: resb 8"));
        assert!(asm.contains("___n: resb 16"));
    }

    #[test]
    fn test_errors_carry_locations() {
        let err = check_source("var x: integer;\nbegin\n  x := y\nend.").unwrap_err();
        let span = err.span().unwrap();
        assert_eq!((span.line, span.column), (3, 8));
        assert!(!err.is_internal());
    }

    #[test]
    fn test_tree_shows_routines_and_main() {
        let tree = dump_tree(
            "procedure show(d: double); begin writeln(d) end;
             var i: integer;
             begin for i := 3 downto 1 do show(i) end.",
        )
        .unwrap();
        let lines: Vec<&str> = tree.lines().collect();
        assert_eq!(lines[0], "program");
        assert!(lines.contains(&"routine show: procedure(double)"));
        let main_at = lines.iter().position(|line| *line == "main").unwrap();
        assert_eq!(lines[main_at + 1], "  for downto");
        // The integer argument is converted for the double parameter
        assert!(lines[main_at..].contains(&"      cast: double"));
        assert!(dump_tree("begin x := 1 end.").is_err());
    }

    #[test]
    fn test_tokens_end_with_eof() {
        let tokens = tokenize_source("begin end.").unwrap();
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens.last().map(|t| t.kind.clone()), Some(TokenKind::Eof));
    }
}
