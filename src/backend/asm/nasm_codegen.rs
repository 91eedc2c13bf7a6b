//! NASM Code Generator
//!
//! Walks the analyzed tree and emits x86-64 assembly for a stack machine:
//! every expression leaves its value on the hardware stack, one 8-byte slot
//! per scalar and the full block for records and static arrays. `rax`, `rcx`,
//! `rdx`, `rsi`, `rdi`, `xmm0` and `xmm1` are scratch; `rbx` holds `rsp`
//! around C calls.

use std::collections::HashMap;

use log::{debug, trace};

use crate::backend::codegen::CodeGen;
use crate::frontend::ast::*;
use crate::frontend::scope::{Builtin, Constant, ConstValue, ScopeId, ScopeStack, Storage, VarKind, Variable};
use crate::types::{Bound, Type, TypeArena, TypeId};
use crate::utils::{Error, Result, Span};

/// Format strings shared by every program
const FORMATS: [(&str, &str); 7] = [
    ("fmt_int", "\"%Ld\", 0"),
    ("fmt_double", "\"%lf\", 0"),
    ("fmt_char", "\"%c\", 0"),
    ("fmt_string", "\"%s\", 0"),
    ("fmt_new_line", "10, 0"),
    ("fmt_skip_line", "\"%*[^\", 10, \"]\", 0"),
    ("fmt_skip_char", "\"%*c\", 0"),
];

/// NASM code generator
pub struct NasmCodeGen {
    target_triple: String,
    output: String,
}

impl NasmCodeGen {
    pub fn new() -> Self {
        Self {
            target_triple: "x86_64-unknown-linux-gnu".to_string(),
            output: String::new(),
        }
    }

    /// Generate the complete assembly file
    pub fn generate_source(&mut self, program: &Program) -> Result<String> {
        let mut emitter = Emitter::new(&program.types, &program.scopes);
        for routine in &program.routines {
            emitter.gen_routine(routine)?;
        }
        emitter.gen_main(&program.body)?;
        self.output = emitter.finish();
        Ok(self.output.clone())
    }
}

impl Default for NasmCodeGen {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGen for NasmCodeGen {
    fn generate(&mut self, program: &Program) -> Result<String> {
        self.generate_source(program)
    }

    fn target_triple(&self) -> &str {
        &self.target_triple
    }

    fn name(&self) -> &str {
        "NASM"
    }
}

/// Per-program emission state
struct Emitter<'a> {
    types: &'a TypeArena,
    scopes: &'a ScopeStack,
    /// Scope of the routine being generated; None in the main block
    local: Option<ScopeId>,
    /// Frame offset and type of the current function's result variable
    result: Option<(i64, TypeId)>,
    /// Target of `exit` in the current routine
    exit_label: String,
    text: String,
    strings: String,
    /// Interned string literals by contents
    string_labels: HashMap<String, String>,
    label_count: usize,
    /// Continue and break targets of the enclosing loops, innermost last
    loops: Vec<(String, String)>,
    /// Bytes currently on the operand stack
    depth: i64,
}

impl<'a> Emitter<'a> {
    fn new(types: &'a TypeArena, scopes: &'a ScopeStack) -> Self {
        Self {
            types,
            scopes,
            local: None,
            result: None,
            exit_label: String::new(),
            text: String::new(),
            strings: String::new(),
            string_labels: HashMap::new(),
            label_count: 0,
            loops: Vec::new(),
            depth: 0,
        }
    }

    // ==================== Output ====================

    fn emit(&mut self, line: &str) {
        trace!("    {}", line);
        self.text.push_str("    ");
        self.text.push_str(line);
        self.text.push('\n');
    }

    fn place(&mut self, label: &str) {
        self.text.push_str(label);
        self.text.push_str(":\n");
    }

    fn new_label(&mut self) -> String {
        let label = format!("label_{}", self.label_count);
        self.label_count += 1;
        label
    }

    fn push(&mut self, operand: &str) {
        self.emit(&format!("push {}", operand));
        self.depth += 8;
    }

    fn pop(&mut self, register: &str) {
        self.emit(&format!("pop {}", register));
        self.depth -= 8;
    }

    fn reserve(&mut self, bytes: i64) {
        self.emit(&format!("sub rsp, {}", bytes));
        self.depth += bytes;
    }

    fn release(&mut self, bytes: i64) {
        self.emit(&format!("add rsp, {}", bytes));
        self.depth -= bytes;
    }

    /// Call a C function with the stack aligned to 16 bytes
    fn call_c(&mut self, function: &str) {
        self.emit("mov rbx, rsp");
        self.emit("and rsp, -16");
        self.emit(&format!("call {}", function));
        self.emit("mov rsp, rbx");
    }

    fn intern_string(&mut self, value: &str) -> String {
        if let Some(label) = self.string_labels.get(value) {
            return label.clone();
        }
        let label = format!("str_{}", self.string_labels.len());
        self.strings.push_str(&format!("{}: db {}\n", label, data_bytes(value)));
        self.string_labels.insert(value.to_string(), label.clone());
        label
    }

    /// Assemble the sections around the generated text
    fn finish(self) -> String {
        let mut out = String::from("global main\nextern printf\nextern scanf\n\n");

        out.push_str("section .bss\n");
        let mut globals: Vec<&Variable> = self
            .scopes
            .scope(ScopeId::ROOT)
            .variables
            .values()
            .collect();
        globals.sort_by(|a, b| a.name.cmp(&b.name));
        for var in globals {
            if let Storage::Label(label) = &var.storage {
                out.push_str(&format!("{}: resb {}\n", label, self.types.size(var.ty).max(8)));
            }
        }

        out.push_str("\nsection .data\n");
        for (label, bytes) in FORMATS {
            out.push_str(&format!("{}: db {}\n", label, bytes));
        }
        for constant in self.scopes.all_constants() {
            out.push_str(&constant_data(constant));
        }
        out.push_str(&self.strings);

        out.push_str("\nsection .text\n");
        out.push_str(&self.text);
        out
    }

    // ==================== Routines ====================

    fn gen_routine(&mut self, routine: &Routine) -> Result<()> {
        debug!("generating routine {} ({})", routine.name, routine.span);
        let scopes = self.scopes;
        let scope = scopes.scope(routine.scope);
        self.local = Some(routine.scope);
        self.result = scope
            .variables
            .get(&routine.name)
            .filter(|var| var.kind == VarKind::Result)
            .and_then(|var| match var.storage {
                Storage::Frame(offset) => Some((offset, var.ty)),
                Storage::Label(_) => None,
            });
        self.exit_label = self.new_label();
        self.depth = 0;

        self.place(&format!("___{}", routine.name));
        self.emit("push rbp");
        self.emit("mov rbp, rsp");
        if scope.frame_size > 0 {
            self.emit(&format!("sub rsp, {}", scope.frame_size));
        }
        self.gen_block(&routine.body)?;

        let exit_label = self.exit_label.clone();
        self.place(&exit_label);
        self.emit("mov rsp, rbp");
        self.emit("pop rbp");
        if routine.params_size > 0 {
            self.emit(&format!("ret {}", routine.params_size));
        } else {
            self.emit("ret");
        }
        self.local = None;
        self.result = None;
        Ok(())
    }

    fn gen_main(&mut self, body: &Block) -> Result<()> {
        debug!("generating main block");
        self.exit_label = self.new_label();
        self.depth = 0;

        self.place("main");
        self.emit("push rbp");
        self.emit("mov rbp, rsp");
        self.emit("push rbx");
        self.gen_block(body)?;

        let exit_label = self.exit_label.clone();
        self.place(&exit_label);
        self.emit("mov rbx, [rbp - 8]");
        self.emit("mov rsp, rbp");
        self.emit("pop rbp");
        self.emit("xor rax, rax");
        self.emit("ret");
        Ok(())
    }

    // ==================== Statements ====================

    fn gen_block(&mut self, block: &Block) -> Result<()> {
        for stmt in block {
            self.gen_stmt(stmt)?;
        }
        Ok(())
    }

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let depth = self.depth;
        match stmt {
            Stmt::Assign { op, target, value, .. } => self.gen_assign(*op, target, value)?,
            Stmt::Expr { expr, .. } => {
                self.gen_expr(expr, false)?;
                let size = expr.ty.map_or(0, |ty| self.types.slot_size(ty));
                if size > 0 {
                    self.release(size);
                }
            }
            Stmt::Block { stmts, .. } => self.gen_block(stmts)?,
            Stmt::If { cond, then_branch, else_branch, .. } => {
                let else_label = self.new_label();
                self.gen_condition(cond, &else_label)?;
                self.gen_stmt(then_branch)?;
                match else_branch {
                    Some(else_branch) => {
                        let end_label = self.new_label();
                        self.emit(&format!("jmp {}", end_label));
                        self.place(&else_label);
                        self.gen_stmt(else_branch)?;
                        self.place(&end_label);
                    }
                    None => self.place(&else_label),
                }
            }
            Stmt::While { cond, body, .. } => {
                let start = self.new_label();
                let end = self.new_label();
                self.place(&start);
                self.gen_condition(cond, &end)?;
                self.loops.push((start.clone(), end.clone()));
                let result = self.gen_stmt(body);
                self.loops.pop();
                result?;
                self.emit(&format!("jmp {}", start));
                self.place(&end);
            }
            Stmt::For { var, from, to, downto, body, .. } => self.gen_for(var, from, to, *downto, body)?,
            Stmt::Break { span } => {
                let (_, end) = self.innermost_loop("break", *span)?;
                self.emit(&format!("jmp {}", end));
            }
            Stmt::Continue { span } => {
                let (next, _) = self.innermost_loop("continue", *span)?;
                self.emit(&format!("jmp {}", next));
            }
        }
        if self.depth != depth {
            return Err(Error::InternalInvariant(format!(
                "operand stack changed by {} bytes across the statement at {}",
                self.depth - depth,
                stmt.span()
            )));
        }
        Ok(())
    }

    fn innermost_loop(&self, keyword: &str, span: Span) -> Result<(String, String)> {
        self.loops.last().cloned().ok_or_else(|| Error::OutsideLoop {
            keyword: keyword.to_string(),
            span,
        })
    }

    /// Jump to `false_label` when the condition is zero
    fn gen_condition(&mut self, cond: &Expr, false_label: &str) -> Result<()> {
        self.gen_expr(cond, false)?;
        self.pop("rax");
        self.emit("test rax, rax");
        self.emit(&format!("jz {}", false_label));
        Ok(())
    }

    /// The variable's address and the final bound stay on the stack for the
    /// whole loop: `[rsp + 8]` is the address, `[rsp]` the bound.
    fn gen_for(&mut self, var: &Expr, from: &Expr, to: &Expr, downto: bool, body: &Stmt) -> Result<()> {
        self.gen_expr(var, true)?;
        self.gen_expr(from, false)?;
        self.pop("rax");
        self.emit("mov rcx, [rsp]");
        self.emit("mov [rcx], rax");
        self.gen_expr(to, false)?;

        let start = self.new_label();
        let next = self.new_label();
        let end = self.new_label();
        let (exit_jump, step) = if downto { ("jl", "dec") } else { ("jg", "inc") };

        self.place(&start);
        self.emit("mov rcx, [rsp + 8]");
        self.emit("mov rax, [rcx]");
        self.emit("cmp rax, [rsp]");
        self.emit(&format!("{} {}", exit_jump, end));

        self.loops.push((next.clone(), end.clone()));
        let result = self.gen_stmt(body);
        self.loops.pop();
        result?;

        self.place(&next);
        self.emit("mov rcx, [rsp + 8]");
        self.emit(&format!("{} qword [rcx]", step));
        self.emit(&format!("jmp {}", start));
        self.place(&end);
        self.release(16);
        Ok(())
    }

    fn gen_assign(&mut self, op: AssignOp, target: &Expr, value: &Expr) -> Result<()> {
        let ty = expr_type(target)?;
        self.gen_expr(value, false)?;
        self.gen_expr(target, true)?;
        match op.binop() {
            None => {
                self.pop("rdi");
                self.store(ty);
            }
            Some(binop) => {
                self.pop("rdi");
                self.pop("rcx");
                self.push("rdi");
                self.push("qword [rdi]");
                self.push("rcx");
                self.gen_arith(binop, ty)?;
                self.pop("rax");
                self.pop("rdi");
                self.emit("mov [rdi], rax");
            }
        }
        Ok(())
    }

    /// Move the value on top of the stack to the address in `rdi`
    fn store(&mut self, ty: TypeId) {
        if self.types.is_aggregate(ty) {
            let size = self.types.size(ty);
            self.emit("mov rsi, rsp");
            self.emit(&format!("mov rcx, {}", size / 8));
            self.emit("rep movsq");
            self.release(size);
        } else {
            self.pop("rax");
            self.emit("mov [rdi], rax");
        }
    }

    /// Push the value stored at the address in `rax`
    fn load(&mut self, ty: TypeId) {
        if self.types.is_aggregate(ty) {
            let size = self.types.size(ty);
            self.reserve(size);
            self.emit("mov rsi, rax");
            self.emit("mov rdi, rsp");
            self.emit(&format!("mov rcx, {}", size / 8));
            self.emit("rep movsq");
        } else if self.types.is_open_array(ty) {
            self.push("rax");
        } else {
            self.push("qword [rax]");
        }
    }

    // ==================== Expressions ====================

    /// Push the value of `expr`, or its address when `lvalue` is set
    fn gen_expr(&mut self, expr: &Expr, lvalue: bool) -> Result<()> {
        let ty = expr_type(expr);
        match &expr.kind {
            ExprKind::Variable { name, binding } => self.gen_name(name, *binding, lvalue, expr.span),
            ExprKind::Index { base, indices } => self.gen_index(base, indices, ty?, lvalue),
            ExprKind::Field { base, field } => self.gen_field(base, field, lvalue),
            ExprKind::Unary { op: UnaryOp::Deref, operand } => {
                self.gen_expr(operand, false)?;
                if !lvalue {
                    self.pop("rax");
                    self.load(ty?);
                }
                Ok(())
            }
            ExprKind::Cast { target, expr: inner } if lvalue => {
                if !is_addressable(inner) {
                    return Err(Error::Unsupported {
                        what: format!("address of a value converted to {}", self.types.name(*target)),
                        span: expr.span,
                    });
                }
                self.gen_expr(inner, true)
            }
            _ if lvalue => Err(Error::InternalInvariant(format!(
                "expression at {} is not addressable",
                expr.span
            ))),
            ExprKind::Literal(lit) => self.gen_literal(lit, ty?),
            ExprKind::Binary { op, left, right } => self.gen_binary(*op, left, right),
            ExprKind::Unary { op, operand } => self.gen_unary(*op, operand),
            ExprKind::Call { callee, args } => self.gen_call(callee, args),
            ExprKind::Cast { target, expr: inner } => self.gen_cast(*target, inner),
        }
    }

    fn gen_literal(&mut self, lit: &Literal, ty: TypeId) -> Result<()> {
        let value = match lit {
            Literal::Int(n) => n.to_string(),
            Literal::Double(d) => format!("0x{:016x}", d.to_bits()),
            Literal::Str(s) if self.types.is_char(ty) => s.chars().next().map_or(0, |c| c as i64).to_string(),
            Literal::Str(s) => {
                let label = self.intern_string(s);
                self.emit(&format!("lea rax, [rel {}]", label));
                self.push("rax");
                return Ok(());
            }
            Literal::Bool(b) => (*b as i64).to_string(),
            Literal::Nil => "0".to_string(),
        };
        self.emit(&format!("mov rax, {}", value));
        self.push("rax");
        Ok(())
    }

    fn gen_name(&mut self, name: &str, binding: Option<Binding>, lvalue: bool, span: Span) -> Result<()> {
        match binding {
            Some(Binding::Variable) => {
                let var = self.variable(name)?;
                self.variable_address(var);
                if lvalue {
                    self.push("rax");
                } else {
                    self.load(var.ty);
                }
            }
            Some(Binding::Constant) => {
                let constant = self.constant(name)?;
                self.emit(&format!("lea rax, [rel {}]", constant.label));
                if lvalue || self.types.is_string(constant.ty) {
                    self.push("rax");
                } else {
                    self.push("qword [rax]");
                }
            }
            Some(Binding::Function) => {
                self.emit(&format!("lea rax, [rel ___{}]", name));
                self.push("rax");
            }
            Some(Binding::Builtin(builtin)) => {
                return Err(Error::Unsupported {
                    what: format!("built-in {} used as a value", builtin.name()),
                    span,
                })
            }
            None => return Err(Error::InternalInvariant(format!("unresolved name {}", name))),
        }
        Ok(())
    }

    /// Load the address of a variable into `rax`
    fn variable_address(&mut self, var: &Variable) {
        match &var.storage {
            Storage::Label(label) => self.emit(&format!("lea rax, [rel {}]", label)),
            Storage::Frame(offset) => {
                let indirect = matches!(var.kind, VarKind::Parameter(spec) if spec.by_reference())
                    || self.types.is_open_array(var.ty);
                let op = if indirect { "mov" } else { "lea" };
                self.emit(&format!("{} rax, {}", op, frame_slot(*offset)));
            }
        }
    }

    fn variable(&self, name: &str) -> Result<&'a Variable> {
        let scopes = self.scopes;
        self.local
            .and_then(|id| scopes.scope(id).variables.get(name))
            .or_else(|| scopes.scope(ScopeId::ROOT).variables.get(name))
            .ok_or_else(|| Error::InternalInvariant(format!("no storage for variable {}", name)))
    }

    fn constant(&self, name: &str) -> Result<&'a Constant> {
        let scopes = self.scopes;
        self.local
            .and_then(|id| scopes.scope(id).constants.get(name))
            .or_else(|| scopes.scope(ScopeId::ROOT).constants.get(name))
            .ok_or_else(|| Error::InternalInvariant(format!("no storage for constant {}", name)))
    }

    fn gen_index(&mut self, base: &Expr, indices: &[Expr], ty: TypeId, lvalue: bool) -> Result<()> {
        let types = self.types;
        self.gen_expr(base, true)?;
        let mut current = expr_type(base)?;
        let mut rest = indices;
        while !rest.is_empty() {
            match types.kind(current) {
                Type::TypedPointer(inner) => {
                    self.pop("rax");
                    self.push("qword [rax]");
                    self.offset_by(&rest[0], 0, types.size(*inner))?;
                    current = *inner;
                    rest = &rest[1..];
                }
                Type::OpenArray(inner) => {
                    if types.is_open_array(*inner) {
                        return Err(Error::Unsupported {
                            what: "indexing nested open arrays".to_string(),
                            span: base.span,
                        });
                    }
                    self.offset_by(&rest[0], 0, types.size(*inner))?;
                    current = *inner;
                    rest = &rest[1..];
                }
                Type::StaticArray { elem, bounds } => {
                    let count = rest.len().min(bounds.len());
                    for (dim, index) in rest[..count].iter().enumerate() {
                        let stride = types.size(*elem) * bounds[dim + 1..].iter().map(Bound::span).product::<i64>();
                        self.offset_by(index, bounds[dim].low, stride)?;
                    }
                    current = *elem;
                    rest = &rest[count..];
                }
                _ => return Err(Error::InternalInvariant("Index arity exceeds rank".to_string())),
            }
        }
        if !lvalue {
            self.pop("rax");
            self.load(ty);
        }
        Ok(())
    }

    /// Advance the address on top of the stack by `(index - low) * stride`
    fn offset_by(&mut self, index: &Expr, low: i64, stride: i64) -> Result<()> {
        self.gen_expr(index, false)?;
        self.pop("rcx");
        if low != 0 {
            self.emit(&format!("sub rcx, {}", low));
        }
        self.emit(&format!("imul rcx, rcx, {}", stride));
        self.pop("rax");
        self.emit("add rax, rcx");
        self.push("rax");
        Ok(())
    }

    fn gen_field(&mut self, base: &Expr, field: &str, lvalue: bool) -> Result<()> {
        self.gen_expr(base, true)?;
        let (ty, offset) = self
            .types
            .field(expr_type(base)?, field)
            .ok_or_else(|| Error::InternalInvariant(format!("unknown field {}", field)))?;
        if offset != 0 || !lvalue {
            self.pop("rax");
            if offset != 0 {
                self.emit(&format!("add rax, {}", offset));
            }
            if lvalue {
                self.push("rax");
            } else {
                self.load(ty);
            }
        }
        Ok(())
    }

    fn gen_binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> Result<()> {
        let operand_ty = expr_type(left)?;
        if matches!(op, BinOp::And | BinOp::Or) && self.types.is_bool(operand_ty) {
            return self.gen_short_circuit(op, left, right);
        }
        self.gen_expr(left, false)?;
        self.gen_expr(right, false)?;
        self.gen_arith(op, operand_ty)
    }

    /// Combine the two values on top of the stack
    fn gen_arith(&mut self, op: BinOp, operand_ty: TypeId) -> Result<()> {
        if self.types.is_double(operand_ty) {
            self.pop("rax");
            self.emit("movq xmm1, rax");
            self.pop("rax");
            self.emit("movq xmm0, rax");
            if op.is_comparison() {
                self.emit("comisd xmm0, xmm1");
                self.emit(&format!("{} al", float_condition(op)));
                self.emit("movzx rax, al");
            } else {
                let instruction = match op {
                    BinOp::Add => "addsd",
                    BinOp::Sub => "subsd",
                    BinOp::Mul => "mulsd",
                    BinOp::Div => "divsd",
                    other => {
                        return Err(Error::InternalInvariant(format!(
                            "operator {} on double operands",
                            other.symbol()
                        )))
                    }
                };
                self.emit(&format!("{} xmm0, xmm1", instruction));
                self.emit("movq rax, xmm0");
            }
            self.push("rax");
            return Ok(());
        }

        self.pop("rcx");
        self.pop("rax");
        match op {
            BinOp::Add => self.emit("add rax, rcx"),
            BinOp::Sub => self.emit("sub rax, rcx"),
            BinOp::Mul => self.emit("imul rax, rcx"),
            BinOp::IntDiv | BinOp::Mod => {
                self.emit("cqo");
                self.emit("idiv rcx");
                if op == BinOp::Mod {
                    self.emit("mov rax, rdx");
                }
            }
            BinOp::And => self.emit("and rax, rcx"),
            BinOp::Or => self.emit("or rax, rcx"),
            BinOp::Xor => self.emit("xor rax, rcx"),
            BinOp::Shl => self.emit("shl rax, cl"),
            BinOp::Shr => self.emit("shr rax, cl"),
            BinOp::Div => {
                return Err(Error::InternalInvariant(
                    "floating division with integer operands".to_string(),
                ))
            }
            comparison => {
                self.emit("cmp rax, rcx");
                self.emit(&format!("{} al", int_condition(comparison)));
                self.emit("movzx rax, al");
            }
        }
        self.push("rax");
        Ok(())
    }

    fn gen_short_circuit(&mut self, op: BinOp, left: &Expr, right: &Expr) -> Result<()> {
        let skip = self.new_label();
        let end = self.new_label();
        let (jump, skipped, evaluated) = if op == BinOp::And { ("jz", 0, 1) } else { ("jnz", 1, 0) };
        for operand in [left, right] {
            self.gen_expr(operand, false)?;
            self.pop("rax");
            self.emit("test rax, rax");
            self.emit(&format!("{} {}", jump, skip));
        }
        // Both paths push exactly one slot
        self.emit(&format!("push {}", evaluated));
        self.emit(&format!("jmp {}", end));
        self.place(&skip);
        self.push(&skipped.to_string());
        self.place(&end);
        Ok(())
    }

    fn gen_unary(&mut self, op: UnaryOp, operand: &Expr) -> Result<()> {
        let ty = expr_type(operand)?;
        match op {
            UnaryOp::AddrOf => {
                let is_routine = matches!(
                    operand.kind,
                    ExprKind::Variable { binding: Some(Binding::Function), .. }
                );
                return self.gen_expr(operand, !is_routine);
            }
            UnaryOp::Deref => return self.gen_expr(operand, false),
            UnaryOp::Plus => return self.gen_expr(operand, false),
            UnaryOp::Neg | UnaryOp::Not => {}
        }

        self.gen_expr(operand, false)?;
        self.pop("rax");
        match op {
            UnaryOp::Neg if self.types.is_double(ty) => {
                self.emit("movq xmm1, rax");
                self.emit("xorpd xmm0, xmm0");
                self.emit("subsd xmm0, xmm1");
                self.emit("movq rax, xmm0");
            }
            UnaryOp::Neg => self.emit("neg rax"),
            _ if self.types.is_bool(ty) => self.emit("xor rax, 1"),
            _ => self.emit("not rax"),
        }
        self.push("rax");
        Ok(())
    }

    fn gen_cast(&mut self, target: TypeId, inner: &Expr) -> Result<()> {
        let from = expr_type(inner)?;
        self.gen_expr(inner, false)?;
        let types = self.types;
        if types.is_double(target) && types.is_int(from) {
            self.pop("rax");
            self.emit("cvtsi2sd xmm0, rax");
            self.emit("movq rax, xmm0");
            self.push("rax");
        } else if types.is_int(target) && types.is_double(from) {
            self.pop("rax");
            self.emit("movq xmm0, rax");
            self.emit("cvttsd2si rax, xmm0");
            self.push("rax");
        } else if types.is_bool(target) && types.is_int(from) {
            self.pop("rax");
            self.emit("test rax, rax");
            self.emit("setne al");
            self.emit("movzx rax, al");
            self.push("rax");
        }
        Ok(())
    }

    // ==================== Calls ====================

    fn gen_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<()> {
        if let ExprKind::Variable { binding: Some(Binding::Builtin(builtin)), .. } = callee.kind {
            return self.gen_builtin(builtin, args, callee.span);
        }
        let types = self.types;
        let (params, ret) = types
            .signature(expr_type(callee)?)
            .ok_or_else(|| Error::InternalInvariant("call through a non-routine value".to_string()))?;

        let ret_size = types.slot_size(ret);
        if ret_size > 0 {
            self.reserve(ret_size);
        }
        let depth = self.depth;
        for (param, arg) in params.iter().zip(args) {
            if types.is_open_array(param.ty) {
                self.gen_open_array_arg(arg)?;
            } else if param.spec.by_reference() {
                self.gen_expr(arg, true)?;
            } else {
                self.gen_expr(arg, false)?;
            }
        }
        self.gen_expr(callee, false)?;
        self.pop("rax");
        self.emit("call rax");
        // The callee pops its arguments
        self.depth = depth;
        Ok(())
    }

    /// Push the high index, then the base address
    fn gen_open_array_arg(&mut self, arg: &Expr) -> Result<()> {
        let types = self.types;
        let ty = expr_type(arg)?;
        match types.kind(ty) {
            Type::StaticArray { bounds, .. } => {
                let high = bounds.first().map_or(0, |b| b.span() - 1);
                self.emit(&format!("mov rax, {}", high));
                self.push("rax");
            }
            Type::OpenArray(_) => {
                let high = self.open_array_high(arg)?;
                self.emit(&format!("mov rax, {}", high));
                self.push("rax");
            }
            _ => {
                return Err(Error::InternalInvariant(format!(
                    "{} passed as an open array",
                    types.name(ty)
                )))
            }
        }
        self.gen_expr(arg, true)
    }

    /// Frame slot holding the high index of an open array parameter
    fn open_array_high(&self, arg: &Expr) -> Result<String> {
        if let ExprKind::Variable { name, binding: Some(Binding::Variable) } = &arg.kind {
            if let Storage::Frame(offset) = self.variable(name)?.storage {
                return Ok(frame_slot(offset + 8));
            }
        }
        Err(Error::Unsupported {
            what: "open array argument that is not a parameter".to_string(),
            span: arg.span,
        })
    }

    fn gen_builtin(&mut self, builtin: Builtin, args: &[Expr], span: Span) -> Result<()> {
        match builtin {
            Builtin::Write | Builtin::Writeln => {
                for arg in args {
                    self.gen_write(arg)?;
                }
                if builtin == Builtin::Writeln {
                    self.emit("lea rdi, [rel fmt_new_line]");
                    self.emit("xor eax, eax");
                    self.call_c("printf");
                }
            }
            Builtin::Read | Builtin::Readln => {
                for arg in args {
                    let ty = expr_type(arg)?;
                    self.gen_expr(arg, true)?;
                    self.pop("rsi");
                    if self.types.is_char(ty) {
                        self.emit("mov qword [rsi], 0");
                    }
                    self.emit(&format!("lea rdi, [rel {}]", self.format_label(ty)));
                    self.emit("xor eax, eax");
                    self.call_c("scanf");
                }
                if builtin == Builtin::Readln {
                    for format in ["fmt_skip_line", "fmt_skip_char"] {
                        self.emit(&format!("lea rdi, [rel {}]", format));
                        self.emit("xor eax, eax");
                        self.call_c("scanf");
                    }
                }
            }
            Builtin::Trunc | Builtin::Round => {
                self.gen_args(args, 1, span)?;
                let mode = if builtin == Builtin::Trunc { 11 } else { 8 };
                self.pop("rax");
                self.emit("movq xmm0, rax");
                self.emit(&format!("roundsd xmm0, xmm0, {}", mode));
                self.emit("cvtsd2si rax, xmm0");
                self.push("rax");
            }
            Builtin::Succ | Builtin::Prev => {
                self.gen_args(args, 1, span)?;
                self.pop("rax");
                self.emit(if builtin == Builtin::Succ { "inc rax" } else { "dec rax" });
                self.push("rax");
            }
            // Chars and integers share the slot representation
            Builtin::Chr | Builtin::Ord => self.gen_args(args, 1, span)?,
            Builtin::High | Builtin::Low => {
                let arg = args.first().ok_or_else(|| Error::ArgCountMismatch { expected: 1, got: 0, span })?;
                let ty = expr_type(arg)?;
                let types = self.types;
                let value = match types.kind(ty) {
                    Type::StaticArray { bounds, .. } => {
                        let bound = bounds.first().copied().unwrap_or(Bound::new(0, -1));
                        let value = if builtin == Builtin::High { bound.high } else { bound.low };
                        value.to_string()
                    }
                    Type::OpenArray(_) if builtin == Builtin::High => self.open_array_high(arg)?,
                    _ => "0".to_string(),
                };
                self.emit(&format!("mov rax, {}", value));
                self.push("rax");
            }
            Builtin::Exit => {
                if let Some(arg) = args.first() {
                    let (offset, ty) = self
                        .result
                        .ok_or_else(|| Error::InternalInvariant("exit value outside a function".to_string()))?;
                    self.gen_expr(arg, false)?;
                    self.emit(&format!("lea rdi, {}", frame_slot(offset)));
                    self.store(ty);
                }
                let exit_label = self.exit_label.clone();
                self.emit(&format!("jmp {}", exit_label));
            }
        }
        Ok(())
    }

    fn gen_args(&mut self, args: &[Expr], expected: usize, span: Span) -> Result<()> {
        if args.len() != expected {
            return Err(Error::ArgCountMismatch { expected, got: args.len(), span });
        }
        for arg in args {
            self.gen_expr(arg, false)?;
        }
        Ok(())
    }

    /// One printf call per argument
    fn gen_write(&mut self, arg: &Expr) -> Result<()> {
        let ty = expr_type(arg)?;
        self.gen_expr(arg, false)?;
        self.emit(&format!("lea rdi, [rel {}]", self.format_label(ty)));
        if self.types.is_double(ty) {
            self.pop("rax");
            self.emit("movq xmm0, rax");
            self.emit("mov eax, 1");
        } else {
            self.pop("rsi");
            self.emit("xor eax, eax");
        }
        self.call_c("printf");
        Ok(())
    }

    fn format_label(&self, ty: TypeId) -> &'static str {
        if self.types.is_double(ty) {
            "fmt_double"
        } else if self.types.is_char(ty) {
            "fmt_char"
        } else if self.types.is_string(ty) {
            "fmt_string"
        } else {
            "fmt_int"
        }
    }
}

fn expr_type(expr: &Expr) -> Result<TypeId> {
    expr.ty
        .ok_or_else(|| Error::InternalInvariant(format!("untyped expression at {}", expr.span)))
}

/// Expressions with a storage location the generator can push
fn is_addressable(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Variable { .. } | ExprKind::Index { .. } | ExprKind::Field { .. } => true,
        ExprKind::Unary { op, .. } => *op == UnaryOp::Deref,
        ExprKind::Cast { expr, .. } => is_addressable(expr),
        _ => false,
    }
}

fn frame_slot(offset: i64) -> String {
    if offset < 0 {
        format!("[rbp - {}]", -offset)
    } else {
        format!("[rbp + {}]", offset)
    }
}

fn int_condition(op: BinOp) -> &'static str {
    match op {
        BinOp::Eq => "sete",
        BinOp::Ne => "setne",
        BinOp::Lt => "setl",
        BinOp::Le => "setle",
        BinOp::Gt => "setg",
        _ => "setge",
    }
}

fn float_condition(op: BinOp) -> &'static str {
    match op {
        BinOp::Eq => "sete",
        BinOp::Ne => "setne",
        BinOp::Lt => "setb",
        BinOp::Le => "setbe",
        BinOp::Gt => "seta",
        _ => "setae",
    }
}

/// NUL-terminated byte list for a `db` directive
fn data_bytes(value: &str) -> String {
    let mut bytes: Vec<String> = value.bytes().map(|b| b.to_string()).collect();
    bytes.push("0".to_string());
    bytes.join(", ")
}

fn constant_data(constant: &Constant) -> String {
    let value = match &constant.value {
        ConstValue::Int(n) => format!("dq {}", n),
        ConstValue::Double(d) => format!("dq 0x{:016x}", d.to_bits()),
        ConstValue::Str(s) if s.chars().count() == 1 => {
            format!("dq {}", s.chars().next().map_or(0, |c| c as i64))
        }
        ConstValue::Str(s) => format!("db {}", data_bytes(s)),
        ConstValue::Bool(b) => format!("dq {}", *b as i64),
        ConstValue::Nil => "dq 0".to_string(),
    };
    format!("{}: {}\n", constant.label, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parser::Parser;
    use crate::frontend::semantic::analyze;
    use pretty_assertions::assert_eq;

    fn analyzed(source: &str) -> Program {
        let mut program = Parser::new(source).unwrap().parse_program().unwrap();
        analyze(&mut program).unwrap();
        program
    }

    fn generate(source: &str) -> String {
        NasmCodeGen::new().generate(&analyzed(source)).unwrap()
    }

    fn text_section(asm: &str) -> &str {
        asm.split("section .text").nth(1).unwrap()
    }

    #[test]
    fn test_integer_write_uses_one_printf() {
        let asm = generate("var x: integer; begin x := 2 + 3; write(x) end.");
        let text = text_section(&asm);
        assert_eq!(text.matches("call printf").count(), 1);
        assert!(text.contains("lea rdi, [rel fmt_int]"));
        assert!(text.contains("add rax, rcx"));
        assert!(!text.contains("xmm"));
        assert!(asm.contains("___x: resb 8"));
    }

    #[test]
    fn test_mixed_addition_uses_sse() {
        let asm = generate("var y: double; begin y := 1 + 2.5 end.");
        let text = text_section(&asm);
        assert!(text.contains("cvtsi2sd xmm0, rax"));
        assert!(text.contains("addsd xmm0, xmm1"));
        assert!(!text.contains("add rax, rcx"));
        assert!(text.contains(&format!("mov rax, 0x{:016x}", 2.5f64.to_bits())));
    }

    #[test]
    fn test_pointer_offset_scaled_by_pointee() {
        let asm = generate("var p: ^integer; begin p := p + 1 end.");
        let text = text_section(&asm);
        assert!(text.contains("mov rax, 8"));
        assert!(text.contains("imul rax, rcx"));
    }

    #[test]
    fn test_break_targets_loop_end() {
        let asm = generate("var i: integer; begin for i := 1 to 10 do break end.");
        let text = text_section(&asm);
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        let end = lines
            .iter()
            .find_map(|line| line.strip_prefix("jg "))
            .unwrap();
        let break_jump = format!("jmp {}", end);
        let jump_at = lines.iter().position(|line| *line == break_jump).unwrap();
        let end_at = lines.iter().position(|line| *line == format!("{}:", end)).unwrap();
        assert!(jump_at < end_at);
        assert_eq!(lines[end_at + 1], "add rsp, 16");
    }

    #[test]
    fn test_operand_stack_balance() {
        let program = analyzed("var x: integer; begin x := 5 + 5 end.");
        let mut emitter = Emitter::new(&program.types, &program.scopes);
        let Stmt::Assign { value, .. } = &program.body[0] else {
            panic!("expected assignment");
        };
        emitter.gen_expr(value, false).unwrap();
        assert_eq!(emitter.depth, 8);
        emitter.pop("rax");
        emitter.gen_stmt(&program.body[0]).unwrap();
        assert_eq!(emitter.depth, 0);
    }

    #[test]
    fn test_routine_frame_and_call() {
        let asm = generate(
            "function add(a, b: integer): integer; begin add := a + b end;
             begin writeln(add(1, 2)) end.",
        );
        let text = text_section(&asm);
        assert!(text.contains("___add:"));
        assert!(text.contains("lea rax, [rbp + 24]"));
        assert!(text.contains("lea rax, [rbp + 16]"));
        assert!(text.contains("lea rax, [rbp + 32]"));
        assert!(text.contains("ret 16"));
        assert!(text.contains("sub rsp, 8"));
        assert!(text.contains("lea rax, [rel ___add]"));
        assert!(text.contains("call rax"));
        assert!(text.contains("lea rdi, [rel fmt_new_line]"));
    }

    #[test]
    fn test_var_parameter_is_indirect() {
        let asm = generate(
            "procedure bump(var x: integer); begin x += 1 end;
             var n: integer;
             begin bump(n) end.",
        );
        let text = text_section(&asm);
        assert!(text.contains("mov rax, [rbp + 16]"));
        assert!(text.contains("ret 8"));
        assert!(text.contains("lea rax, [rel ___n]"));
    }

    #[test]
    fn test_open_array_passes_high_and_address() {
        let asm = generate(
            "procedure p(a: array of integer); begin writeln(high(a), low(a)) end;
             var v: array[1..5] of integer;
             begin p(v) end.",
        );
        let text = text_section(&asm);
        assert!(text.contains("mov rax, 4"));
        assert!(text.contains("mov rax, [rbp + 24]"));
        assert!(text.contains("ret 16"));
        assert!(asm.contains("___v: resb 40"));
    }

    #[test]
    fn test_var_open_array_passes_high_and_address() {
        let asm = generate(
            "procedure p(var a: array of integer); begin writeln(high(a)); a[0] := 1 end;
             var v: array[1..5] of integer;
             begin p(v) end.",
        );
        let lines: Vec<&str> = text_section(&asm).lines().map(str::trim).collect();
        assert!(lines.contains(&"ret 16"));
        assert!(lines.contains(&"mov rax, [rbp + 24]"));
        assert!(lines.contains(&"mov rax, [rbp + 16]"));
        let high_at = lines.iter().position(|line| *line == "mov rax, 4").unwrap();
        assert_eq!(lines[high_at + 1], "push rax");
        assert_eq!(lines[high_at + 2], "lea rax, [rel ___v]");
    }

    #[test]
    fn test_static_array_strides() {
        let asm = generate("var m: array[1..2, 1..3] of integer; begin m[2, 3] := 1 end.");
        let text = text_section(&asm);
        assert!(text.contains("sub rcx, 1"));
        assert!(text.contains("imul rcx, rcx, 24"));
        assert!(text.contains("imul rcx, rcx, 8"));
    }

    #[test]
    fn test_records_copy_as_blocks() {
        let asm = generate(
            "type pt = record x, y: integer end;
             var p, q: pt;
             begin p.y := 1; q := p end.",
        );
        let text = text_section(&asm);
        assert!(text.contains("add rax, 8"));
        assert!(text.contains("rep movsq"));
        assert!(text.contains("mov rcx, 2"));
    }

    #[test]
    fn test_strings_are_interned_once() {
        let asm = generate("begin write('hello'); write('hello') end.");
        assert_eq!(asm.matches("str_0:").count(), 1);
        assert!(!asm.contains("str_1"));
        assert!(asm.contains("str_0: db 104, 101, 108, 108, 111, 0"));
        assert!(text_section(&asm).contains("lea rdi, [rel fmt_string]"));
    }

    #[test]
    fn test_rounding_builtins() {
        let asm = generate("var d: double; i: integer; begin i := trunc(d); i := round(d) end.");
        let text = text_section(&asm);
        assert!(text.contains("roundsd xmm0, xmm0, 11"));
        assert!(text.contains("roundsd xmm0, xmm0, 8"));
        assert!(text.contains("cvtsd2si rax, xmm0"));
    }

    #[test]
    fn test_readln_skips_rest_of_line() {
        let asm = generate("var c: char; begin readln(c) end.");
        let text = text_section(&asm);
        assert_eq!(text.matches("call scanf").count(), 3);
        assert!(text.contains("mov qword [rsi], 0"));
        assert!(text.contains("lea rdi, [rel fmt_skip_line]"));
    }

    #[test]
    fn test_boolean_and_short_circuits() {
        let asm = generate("var a, b: boolean; begin if a and b then writeln end.");
        let text = text_section(&asm);
        assert!(!text.contains("and rax, rcx"));
        assert!(text.contains("push 1"));

        let asm = generate("var i: integer; begin i := i and 3 end.");
        assert!(text_section(&asm).contains("and rax, rcx"));
    }

    #[test]
    fn test_division_and_modulo() {
        let asm = generate("var i: integer; begin i := 7 div 2; i := 7 mod 2 end.");
        let text = text_section(&asm);
        assert!(text.contains("cqo"));
        assert!(text.contains("idiv rcx"));
        assert!(text.contains("mov rax, rdx"));
    }

    #[test]
    fn test_double_comparison_is_unsigned_style() {
        let asm = generate("var d: double; begin if d < 1.5 then writeln end.");
        let text = text_section(&asm);
        assert!(text.contains("comisd xmm0, xmm1"));
        assert!(text.contains("setb al"));
    }

    #[test]
    fn test_exit_in_main_runs_epilogue() {
        let asm = generate("begin exit; writeln end.");
        let lines: Vec<&str> = text_section(&asm).lines().map(str::trim).collect();
        let target = lines.iter().find_map(|line| line.strip_prefix("jmp ")).unwrap();
        let at = lines.iter().position(|line| *line == format!("{}:", target)).unwrap();
        assert_eq!(lines[at + 1], "mov rbx, [rbp - 8]");
    }

    #[test]
    fn test_exit_stores_result() {
        let asm = generate("function f: integer; begin exit(3) end; begin writeln(f) end.");
        let text = text_section(&asm);
        assert!(text.contains("lea rdi, [rbp + 16]"));
        assert!(text.contains("mov [rdi], rax"));
    }

    #[test]
    fn test_constants_live_in_data() {
        let asm = generate("const n = 5; s = 'hi'; var i: integer; begin i := n; writeln(s) end.");
        assert!(asm.contains("const_0: dq 5"));
        assert!(asm.contains("const_1: db 104, 105, 0"));
        assert!(asm.contains("fmt_int: db \"%Ld\", 0"));
    }

    fn lines_of(asm: &str) -> Vec<String> {
        text_section(asm).lines().map(|line| line.trim().to_string()).collect()
    }

    #[test]
    fn test_continue_targets_for_step() {
        let asm = generate(
            "var i, s: integer;
             begin for i := 1 to 10 do begin if i = 3 then continue; s += i end end.",
        );
        let lines = lines_of(&asm);
        let step_at = lines.iter().position(|line| line == "inc qword [rcx]").unwrap();
        assert_eq!(lines[step_at - 1], "mov rcx, [rsp + 8]");
        let step = lines[step_at - 2].strip_suffix(':').unwrap();
        assert!(lines.contains(&format!("jmp {}", step)));
    }

    #[test]
    fn test_downto_counts_down() {
        let asm = generate("var i: integer; begin for i := 10 downto 1 do writeln(i) end.");
        let lines = lines_of(&asm);
        assert!(lines.iter().any(|line| line.starts_with("jl label_")));
        assert!(lines.contains(&"dec qword [rcx]".to_string()));
        assert!(!lines.iter().any(|line| line.starts_with("jg ")));
        assert!(!lines.contains(&"inc qword [rcx]".to_string()));
    }

    #[test]
    fn test_while_loop_and_continue() {
        let asm = generate(
            "var i: integer;
             begin while i < 10 do begin i += 1; if i = 5 then continue end end.",
        );
        let lines = lines_of(&asm);
        let start_at = lines.iter().position(|line| line.starts_with("label_")).unwrap();
        let start = lines[start_at].strip_suffix(':').unwrap();
        let end = lines[start_at..]
            .iter()
            .find_map(|line| line.strip_prefix("jz "))
            .unwrap();
        // The continue and the back edge both return to the condition
        assert_eq!(lines.iter().filter(|line| **line == format!("jmp {}", start)).count(), 2);
        let end_at = lines.iter().position(|line| *line == format!("{}:", end)).unwrap();
        assert_eq!(lines[end_at - 1], format!("jmp {}", start));
    }

    #[test]
    fn test_break_in_nested_loop_leaves_inner_loop() {
        let asm = generate("var i, j: integer; begin for i := 1 to 3 do for j := 1 to 3 do break end.");
        let lines = lines_of(&asm);
        let ends: Vec<&str> = lines.iter().filter_map(|line| line.strip_prefix("jg ")).collect();
        assert_eq!(ends.len(), 2);
        let (outer, inner) = (ends[0], ends[1]);
        assert!(lines.contains(&format!("jmp {}", inner)));
        assert!(!lines.contains(&format!("jmp {}", outer)));
    }

    #[test]
    fn test_boolean_or_short_circuits() {
        let asm = generate("var a, b: boolean; begin if a or b then writeln end.");
        let lines = lines_of(&asm);
        assert_eq!(lines.iter().filter(|line| line.starts_with("jnz label_")).count(), 2);
        let skip = lines.iter().find_map(|line| line.strip_prefix("jnz ")).unwrap();
        let skip_at = lines.iter().position(|line| *line == format!("{}:", skip)).unwrap();
        assert_eq!(lines[skip_at + 1], "push 1");
        assert_eq!(lines[skip_at - 2], "push 0");
        assert!(!lines.contains(&"or rax, rcx".to_string()));
    }
}
