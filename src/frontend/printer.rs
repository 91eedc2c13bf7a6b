//! Tree Printer - Pretty print an analyzed program
//!
//! Outputs the declaration tables of every scope and the decorated statement
//! tree, one node per line with its resolved type. Inserted conversions show
//! up as `cast` nodes.

use std::fmt::Write;

use crate::frontend::ast::*;
use crate::frontend::scope::{ConstValue, Scope, ScopeId, ScopeStack, Storage, VarKind};
use crate::types::{TypeArena, TypeId};

/// Types registered in the root scope before parsing starts
const PREDEFINED: [(&str, TypeId); 5] = [
    ("integer", TypeId::INT),
    ("double", TypeId::DOUBLE),
    ("char", TypeId::CHAR),
    ("boolean", TypeId::BOOLEAN),
    ("pointer", TypeId::PURE_POINTER),
];

/// Print a program to string
pub fn print_program(program: &Program) -> String {
    TreePrinter::new(&program.types, &program.scopes).print_program(program)
}

/// Pretty printer for analyzed programs
pub struct TreePrinter<'a> {
    types: &'a TypeArena,
    scopes: &'a ScopeStack,
    output: String,
    indent: usize,
}

impl<'a> TreePrinter<'a> {
    pub fn new(types: &'a TypeArena, scopes: &'a ScopeStack) -> Self {
        Self {
            types,
            scopes,
            output: String::new(),
            indent: 0,
        }
    }

    pub fn print_program(mut self, program: &Program) -> String {
        match &program.name {
            Some(name) => self.line(&format!("program {}", name)),
            None => self.line("program"),
        }
        self.nested(|p| p.print_scope(ScopeId::ROOT));

        for routine in &program.routines {
            self.line(&format!(
                "routine {}: {}",
                routine.name,
                self.types.name(routine.signature)
            ));
            self.nested(|p| {
                p.print_scope(routine.scope);
                p.line("body");
                p.nested(|p| p.print_block(&routine.body));
            });
        }

        self.line("main");
        self.nested(|p| p.print_block(&program.body));
        self.output
    }

    fn line(&mut self, text: &str) {
        let _ = writeln!(self.output, "{}{}", "  ".repeat(self.indent), text);
    }

    fn nested(&mut self, body: impl FnOnce(&mut Self)) {
        self.indent += 1;
        body(self);
        self.indent -= 1;
    }

    // ==================== Declarations ====================

    fn print_scope(&mut self, id: ScopeId) {
        let scopes = self.scopes;
        let types = self.types;
        let scope: &Scope = scopes.scope(id);

        let mut entries: Vec<String> = scope
            .types
            .iter()
            .filter(|(name, ty)| !PREDEFINED.contains(&(name.as_str(), **ty)))
            .map(|(name, ty)| format!("{} = {}", name, types.name(*ty)))
            .collect();
        self.print_table("types", entries);

        entries = scope
            .constants
            .values()
            .map(|c| {
                format!(
                    "{}: {} = {} ({})",
                    c.name,
                    types.name(c.ty),
                    const_text(&c.value),
                    c.label
                )
            })
            .collect();
        self.print_table("constants", entries);

        entries = scope
            .variables
            .values()
            .map(|v| {
                let kind = match v.kind {
                    VarKind::Global => "global".to_string(),
                    VarKind::Local => "local".to_string(),
                    VarKind::Parameter(spec) => format!("{:?} parameter", spec).to_lowercase(),
                    VarKind::Result => "result".to_string(),
                };
                let at = match &v.storage {
                    Storage::Label(label) => label.clone(),
                    Storage::Frame(offset) => format!("rbp{:+}", offset),
                };
                format!("{}: {}, {} {}", v.name, types.name(v.ty), kind, at)
            })
            .collect();
        self.print_table("variables", entries);

        entries = scope
            .functions
            .values()
            .filter(|f| f.builtin.is_none())
            .map(|f| {
                let signature = f.signature.map_or_else(String::new, |sig| types.name(sig));
                if f.is_forward {
                    format!("{}: {} (forward)", f.name, signature)
                } else {
                    format!("{}: {}", f.name, signature)
                }
            })
            .collect();
        self.print_table("functions", entries);
    }

    /// Print a table sorted by entry; empty tables are skipped
    fn print_table(&mut self, title: &str, mut entries: Vec<String>) {
        if entries.is_empty() {
            return;
        }
        entries.sort();
        self.line(title);
        self.nested(|p| {
            for entry in &entries {
                p.line(entry);
            }
        });
    }

    // ==================== Statements ====================

    fn print_block(&mut self, block: &Block) {
        for stmt in block {
            self.print_stmt(stmt);
        }
    }

    fn print_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Assign { op, target, value, .. } => {
                self.line(&format!("assign {}", op.symbol()));
                self.nested(|p| {
                    p.print_expr(target);
                    p.print_expr(value);
                });
            }
            Stmt::Expr { expr, .. } => self.print_expr(expr),
            Stmt::Block { stmts, .. } => {
                self.line("block");
                self.nested(|p| p.print_block(stmts));
            }
            Stmt::If { cond, then_branch, else_branch, .. } => {
                self.line("if");
                self.nested(|p| {
                    p.print_expr(cond);
                    p.print_stmt(then_branch);
                    if let Some(else_branch) = else_branch {
                        p.line("else");
                        p.nested(|p| p.print_stmt(else_branch));
                    }
                });
            }
            Stmt::While { cond, body, .. } => {
                self.line("while");
                self.nested(|p| {
                    p.print_expr(cond);
                    p.print_stmt(body);
                });
            }
            Stmt::For { var, from, to, downto, body, .. } => {
                self.line(if *downto { "for downto" } else { "for to" });
                self.nested(|p| {
                    p.print_expr(var);
                    p.print_expr(from);
                    p.print_expr(to);
                    p.print_stmt(body);
                });
            }
            Stmt::Break { .. } => self.line("break"),
            Stmt::Continue { .. } => self.line("continue"),
        }
    }

    // ==================== Expressions ====================

    fn print_expr(&mut self, expr: &Expr) {
        let ty = match expr.ty {
            Some(ty) => self.types.name(ty),
            None => "built-in".to_string(),
        };
        match &expr.kind {
            ExprKind::Literal(lit) => self.line(&format!("literal {}: {}", literal_text(lit), ty)),
            ExprKind::Variable { name, .. } => self.line(&format!("name {}: {}", name, ty)),
            ExprKind::Binary { op, left, right } => {
                self.line(&format!("binary {}: {}", op.symbol(), ty));
                self.nested(|p| {
                    p.print_expr(left);
                    p.print_expr(right);
                });
            }
            ExprKind::Unary { op, operand } => {
                self.line(&format!("unary {}: {}", op.symbol(), ty));
                self.nested(|p| p.print_expr(operand));
            }
            ExprKind::Index { base, indices } => {
                self.line(&format!("index: {}", ty));
                self.nested(|p| {
                    p.print_expr(base);
                    for index in indices {
                        p.print_expr(index);
                    }
                });
            }
            ExprKind::Field { base, field } => {
                self.line(&format!("field {}: {}", field, ty));
                self.nested(|p| p.print_expr(base));
            }
            ExprKind::Call { callee, args } => {
                self.line(&format!("call: {}", ty));
                self.nested(|p| {
                    p.print_expr(callee);
                    for arg in args {
                        p.print_expr(arg);
                    }
                });
            }
            ExprKind::Cast { expr: inner, .. } => {
                self.line(&format!("cast: {}", ty));
                self.nested(|p| p.print_expr(inner));
            }
        }
    }
}

fn literal_text(lit: &Literal) -> String {
    match lit {
        Literal::Int(n) => n.to_string(),
        Literal::Double(d) => d.to_string(),
        Literal::Str(s) => format!("'{}'", s),
        Literal::Bool(b) => b.to_string(),
        Literal::Nil => "nil".to_string(),
    }
}

fn const_text(value: &ConstValue) -> String {
    match value {
        ConstValue::Int(n) => n.to_string(),
        ConstValue::Double(d) => d.to_string(),
        ConstValue::Str(s) => format!("'{}'", s),
        ConstValue::Bool(b) => b.to_string(),
        ConstValue::Nil => "nil".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parser::Parser;
    use crate::frontend::semantic::analyze;
    use pretty_assertions::assert_eq;

    fn print(source: &str) -> String {
        let mut program = Parser::new(source).unwrap().parse_program().unwrap();
        analyze(&mut program).unwrap();
        print_program(&program)
    }

    #[test]
    fn test_inserted_cast_is_printed() {
        let tree = print("var y: double; begin y := 1 + 2.5 end.");
        let expected = "\
program
  variables
    y: double, global ___y
main
  assign :=
    name y: double
    binary +: double
      cast: double
        literal 1: integer
      literal 2.5: double
";
        assert_eq!(tree, expected);
    }

    #[test]
    fn test_routine_tables() {
        let tree = print(
            "program demo;
             const limit = 3;
             function twice(var x: integer): integer; begin twice := x * 2 end;
             var n: integer;
             begin n := twice(n) end.",
        );
        assert!(tree.starts_with("program demo\n"));
        assert!(tree.contains("  constants\n    limit: integer = 3 (const_0)\n"));
        assert!(tree.contains("  functions\n    twice: function(integer): integer\n"));
        assert!(tree.contains("routine twice: function(integer): integer\n"));
        assert!(tree.contains("    x: integer, var parameter rbp+16\n"));
        assert!(tree.contains("    twice: integer, result rbp+24\n"));
        assert!(tree.contains("  body\n    assign :=\n      name twice: integer\n"));
        assert!(tree.contains("    call: integer\n"));
    }
}
