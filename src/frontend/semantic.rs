//! Semantic Analysis
//!
//! Performs:
//! - Name resolution against the scope tree built by the parser
//! - Type checking of every expression and statement
//! - Tree rewriting: implicit conversions become `Cast` nodes, pointer
//!   offsets are scaled by the pointee size, parameterless routine
//!   references in value position become calls
//!
//! The analyzer never declares symbols; the parser already did.

use std::cmp::Ordering;

use log::debug;

use crate::frontend::ast::*;
use crate::frontend::scope::{Builtin, ScopeStack, Symbol, VarKind};
use crate::types::{Type, TypeArena, TypeId};
use crate::utils::{Error, Result, Span};

/// Analyze every routine body and then the main block
pub fn analyze(program: &mut Program) -> Result<()> {
    let Program { types, scopes, routines, body, .. } = program;
    let mut analyzer = SemanticAnalyzer::new(types, scopes);
    for routine in routines.iter_mut() {
        analyzer.analyze_routine(routine)?;
    }
    analyzer.analyze_main(body)
}

/// Semantic analyzer over one compilation unit
pub struct SemanticAnalyzer<'a> {
    types: &'a mut TypeArena,
    scopes: &'a mut ScopeStack,
    /// Return type of the routine being analyzed; void in the main block
    ret: TypeId,
}

impl<'a> SemanticAnalyzer<'a> {
    pub fn new(types: &'a mut TypeArena, scopes: &'a mut ScopeStack) -> Self {
        Self { types, scopes, ret: TypeId::VOID }
    }

    pub fn analyze_routine(&mut self, routine: &mut Routine) -> Result<()> {
        debug!("analyzing routine {}", routine.name);
        self.ret = self
            .types
            .signature(routine.signature)
            .map_or(TypeId::VOID, |(_, ret)| ret);
        self.scopes.enter(routine.scope);
        let result = self.analyze_block(&mut routine.body);
        self.scopes.exit();
        self.ret = TypeId::VOID;
        result
    }

    pub fn analyze_main(&mut self, body: &mut Block) -> Result<()> {
        debug!("analyzing main block");
        self.ret = TypeId::VOID;
        self.analyze_block(body)
    }

    // ==================== Statements ====================

    fn analyze_block(&mut self, block: &mut Block) -> Result<()> {
        for stmt in block.iter_mut() {
            self.analyze_stmt(stmt)?;
        }
        Ok(())
    }

    fn analyze_stmt(&mut self, stmt: &mut Stmt) -> Result<()> {
        match stmt {
            Stmt::Assign { op, target, value, span } => self.analyze_assign(*op, target, value, *span),
            Stmt::Expr { expr, .. } => self.analyze_call_stmt(expr),
            Stmt::Block { stmts, .. } => self.analyze_block(stmts),
            Stmt::If { cond, then_branch, else_branch, .. } => {
                self.analyze_condition(cond)?;
                self.analyze_stmt(then_branch)?;
                if let Some(else_branch) = else_branch {
                    self.analyze_stmt(else_branch)?;
                }
                Ok(())
            }
            Stmt::While { cond, body, .. } => {
                self.analyze_condition(cond)?;
                self.analyze_stmt(body)
            }
            Stmt::For { var, from, to, body, .. } => {
                self.analyze_expr(var)?;
                if !self.is_lvalue(var) {
                    return Err(Error::ExpectedLvalue { span: var.span });
                }
                self.rvalue(from)?;
                self.rvalue(to)?;
                for bound in [&*var, &*from, &*to] {
                    self.expect_int(bound)?;
                }
                self.analyze_stmt(body)
            }
            Stmt::Break { .. } | Stmt::Continue { .. } => Ok(()),
        }
    }

    fn analyze_assign(&mut self, op: AssignOp, target: &mut Expr, value: &mut Expr, span: Span) -> Result<()> {
        self.analyze_expr(target)?;
        if !self.is_lvalue(target) {
            return Err(Error::ExpectedLvalue { span: target.span });
        }
        let left = self.value_type(target)?;
        // A routine assigned to a procedural variable is not called
        let right = if self.types.is_procedure_type(left) {
            self.analyze_expr(value)?;
            self.value_type(value)?
        } else {
            self.rvalue(value)?
        };

        let invalid = Error::InvalidOperation {
            op: op.symbol().to_string(),
            left: self.types.name(left),
            right: self.types.name(right),
            span,
        };
        let right = match op.binop() {
            None => right,
            Some(binop) => match self.check_binary(binop, target, value, true) {
                Some(result) => result,
                None => return Err(invalid),
            },
        };

        if self.is_implicit(left, right) {
            value.cast_to(left);
            return Ok(());
        }
        if !self.types.equals(right, left) {
            return Err(invalid);
        }
        Ok(())
    }

    /// A statement-level expression must be a call; a bare routine reference is called
    fn analyze_call_stmt(&mut self, expr: &mut Expr) -> Result<()> {
        match &expr.kind {
            ExprKind::Call { .. } => {}
            ExprKind::Variable { name, .. } => {
                let (binding, ty) = self.resolve_name(name, expr.span, true)?;
                let callable = matches!(binding, Binding::Function | Binding::Builtin(_))
                    || ty.map_or(false, |ty| self.types.is_procedure_type(ty));
                if !callable {
                    return Err(Error::Expected("function call".to_string(), expr.span));
                }
                expr.make_call();
            }
            _ => return Err(Error::Expected("function call".to_string(), expr.span)),
        }
        self.analyze_expr(expr)
    }

    fn analyze_condition(&mut self, cond: &mut Expr) -> Result<()> {
        let ty = self.rvalue(cond)?;
        if self.types.is_int(ty) {
            cond.cast_to(TypeId::BOOLEAN);
        } else if !self.types.is_bool(ty) {
            return Err(Error::InvalidArgument {
                expected: "boolean".to_string(),
                actual: self.types.name(ty),
                span: cond.span,
            });
        }
        Ok(())
    }

    // ==================== Expressions ====================

    fn analyze_expr(&mut self, expr: &mut Expr) -> Result<()> {
        let span = expr.span;
        let ty = match &mut expr.kind {
            ExprKind::Literal(lit) => Some(Self::literal_type(lit)),
            ExprKind::Variable { name, binding } => {
                let (resolved, ty) = self.resolve_name(name, span, false)?;
                *binding = Some(resolved);
                ty
            }
            ExprKind::Binary { op, left, right } => Some(self.analyze_binary(*op, left, right, span)?),
            ExprKind::Unary { op, operand } => Some(self.analyze_unary(*op, operand, span)?),
            ExprKind::Index { base, indices } => Some(self.analyze_index(base, indices)?),
            ExprKind::Field { base, field } => Some(self.analyze_field(base, field, span)?),
            ExprKind::Call { callee, args } => Some(self.analyze_call(callee, args, span)?),
            ExprKind::Cast { target, expr: inner } => Some(self.analyze_cast(*target, inner, span)?),
        };
        expr.ty = ty;
        Ok(())
    }

    /// Analyze an expression whose value is needed, calling a parameterless
    /// routine reference
    fn rvalue(&mut self, expr: &mut Expr) -> Result<TypeId> {
        self.analyze_expr(expr)?;
        if self.is_parameterless_routine(expr) {
            expr.make_call();
            self.analyze_expr(expr)?;
        }
        self.value_type(expr)
    }

    fn value_type(&self, expr: &Expr) -> Result<TypeId> {
        expr.ty.ok_or_else(|| Error::Expected("value".to_string(), expr.span))
    }

    fn is_parameterless_routine(&self, expr: &Expr) -> bool {
        matches!(
            expr.kind,
            ExprKind::Variable { binding: Some(Binding::Function | Binding::Builtin(_)), .. }
        ) && expr.ty.map_or(true, |ty| {
            self.types.signature(ty).map_or(false, |(params, _)| params.is_empty())
        })
    }

    fn literal_type(lit: &Literal) -> TypeId {
        match lit {
            Literal::Int(_) => TypeId::INT,
            Literal::Double(_) => TypeId::DOUBLE,
            Literal::Str(s) if s.chars().count() == 1 => TypeId::CHAR,
            Literal::Str(_) => TypeId::STRING,
            Literal::Bool(_) => TypeId::BOOLEAN,
            Literal::Nil => TypeId::PURE_POINTER,
        }
    }

    /// Resolve a name. In call position a function's result variable yields
    /// to the function itself.
    fn resolve_name(&self, name: &str, span: Span, call_position: bool) -> Result<(Binding, Option<TypeId>)> {
        let not_defined = || Error::NotDefined { name: name.to_string(), span };
        match self.scopes.lookup(name).ok_or_else(not_defined)? {
            Symbol::Variable(var) if call_position && var.kind == VarKind::Result => {
                let function = self.scopes.lookup_function(name).ok_or_else(not_defined)?;
                Ok((Binding::Function, function.signature))
            }
            Symbol::Variable(var) => Ok((Binding::Variable, Some(var.ty))),
            Symbol::Constant(constant) => Ok((Binding::Constant, Some(constant.ty))),
            Symbol::Function(function) => {
                let binding = function.builtin.map_or(Binding::Function, Binding::Builtin);
                Ok((binding, function.signature))
            }
            Symbol::Type(_) => Err(Error::ExpectedExpr { got: name.to_string(), span }),
        }
    }

    fn analyze_binary(&mut self, op: BinOp, left: &mut Expr, right: &mut Expr, span: Span) -> Result<TypeId> {
        let lt = self.rvalue(left)?;
        let rt = self.rvalue(right)?;
        self.check_binary(op, left, right, false)
            .ok_or_else(|| Error::InvalidOperation {
                op: op.symbol().to_string(),
                left: self.types.name(lt),
                right: self.types.name(rt),
                span,
            })
    }

    fn analyze_unary(&mut self, op: UnaryOp, operand: &mut Expr, span: Span) -> Result<TypeId> {
        if op == UnaryOp::AddrOf {
            self.analyze_expr(operand)?;
            // A routine's address is the routine value itself
            if matches!(operand.kind, ExprKind::Variable { binding: Some(Binding::Function), .. }) {
                return self.value_type(operand);
            }
            if !self.is_lvalue(operand) {
                return Err(Error::ExpectedLvalue { span: operand.span });
            }
            let ty = self.value_type(operand)?;
            return Ok(self.types.alloc(Type::TypedPointer(ty)));
        }

        let ty = self.rvalue(operand)?;
        let result = match op {
            UnaryOp::Plus | UnaryOp::Neg if self.types.is_int(ty) || self.types.is_double(ty) => Some(ty),
            UnaryOp::Not if self.types.is_int(ty) || self.types.is_bool(ty) => Some(ty),
            UnaryOp::Deref => self.types.pointee(ty),
            _ => None,
        };
        result.ok_or_else(|| Error::InvalidOperand {
            op: op.symbol().to_string(),
            ty: self.types.name(ty),
            span,
        })
    }

    fn analyze_index(&mut self, base: &mut Expr, indices: &mut [Expr]) -> Result<TypeId> {
        self.analyze_expr(base)?;
        if !self.is_lvalue(base) {
            return Err(Error::ExpectedLvalue { span: base.span });
        }
        let base_ty = self.value_type(base)?;
        for index in indices.iter_mut() {
            self.rvalue(index)?;
            self.expect_int(index)?;
        }
        if !matches!(
            self.types.kind(base_ty),
            Type::TypedPointer(_) | Type::StaticArray { .. } | Type::OpenArray(_)
        ) {
            return Err(Error::InvalidOperand {
                op: "[]".to_string(),
                ty: self.types.name(base_ty),
                span: base.span,
            });
        }
        self.index_type(base_ty, indices.len())
    }

    /// Type reached after consuming `count` dimensions of `ty`
    fn index_type(&mut self, mut ty: TypeId, mut count: usize) -> Result<TypeId> {
        loop {
            match self.types.kind(ty).clone() {
                Type::TypedPointer(inner) | Type::OpenArray(inner) => {
                    if count == 1 {
                        return Ok(inner);
                    }
                    count -= 1;
                    ty = inner;
                }
                Type::StaticArray { elem, bounds } => match count.cmp(&bounds.len()) {
                    Ordering::Equal => return Ok(elem),
                    Ordering::Less => {
                        return Ok(self.types.alloc(Type::StaticArray {
                            elem,
                            bounds: bounds[count..].to_vec(),
                        }));
                    }
                    Ordering::Greater => {
                        count -= bounds.len();
                        ty = elem;
                    }
                },
                _ => return Err(Error::InternalInvariant("Index arity exceeds rank".to_string())),
            }
        }
    }

    fn analyze_field(&mut self, base: &mut Expr, field: &str, span: Span) -> Result<TypeId> {
        self.analyze_expr(base)?;
        if !self.is_lvalue(base) {
            return Err(Error::ExpectedLvalue { span: base.span });
        }
        let ty = self.value_type(base)?;
        if !self.types.is_record(ty) {
            return Err(Error::InvalidOperand {
                op: ".".to_string(),
                ty: self.types.name(ty),
                span: base.span,
            });
        }
        self.types
            .field(ty, field)
            .map(|(field_ty, _)| field_ty)
            .ok_or_else(|| Error::NotDefined { name: field.to_string(), span })
    }

    fn analyze_cast(&mut self, target: TypeId, inner: &mut Expr, span: Span) -> Result<TypeId> {
        let from = self.rvalue(inner)?;
        let t = &*self.types;
        let legal = (t.is_int(target) && (t.is_int(from) || t.is_double(from) || t.is_bool(from)))
            || (t.is_double(target) && (t.is_int(from) || t.is_double(from)))
            || (t.is_pure_pointer(target) && t.is_pointer(from))
            || (t.is_typed_pointer(target) && (t.is_pure_pointer(from) || t.equals(from, target)));
        if !legal {
            return Err(Error::InvalidCast {
                from: t.name(from),
                to: t.name(target),
                span,
            });
        }
        Ok(target)
    }

    // ==================== Calls ====================

    fn analyze_call(&mut self, callee: &mut Expr, args: &mut [Expr], span: Span) -> Result<TypeId> {
        match &mut callee.kind {
            ExprKind::Variable { name, binding } => {
                let (resolved, ty) = self.resolve_name(name, callee.span, true)?;
                *binding = Some(resolved);
                callee.ty = ty;
                if let (Binding::Builtin(builtin), None) = (resolved, ty) {
                    return self.analyze_builtin(builtin, args, span);
                }
            }
            ExprKind::Index { .. }
            | ExprKind::Field { .. }
            | ExprKind::Unary { op: UnaryOp::Deref, .. } => self.analyze_expr(callee)?,
            _ => return Err(Error::NotCallable { span: callee.span }),
        }

        match callee.ty {
            Some(signature) if self.types.is_procedure_type(signature) => {
                self.check_arguments(signature, args, span)
            }
            _ => Err(Error::NotCallable { span: callee.span }),
        }
    }

    fn check_arguments(&mut self, signature: TypeId, args: &mut [Expr], span: Span) -> Result<TypeId> {
        let Some((params, ret)) = self
            .types
            .signature(signature)
            .map(|(params, ret)| (params.to_vec(), ret))
        else {
            return Err(Error::NotCallable { span });
        };
        if params.len() != args.len() {
            return Err(Error::ArgCountMismatch {
                expected: params.len(),
                got: args.len(),
                span,
            });
        }

        for (param, arg) in params.iter().zip(args.iter_mut()) {
            let actual = if self.types.is_procedure_type(param.ty) {
                self.analyze_expr(arg)?;
                self.value_type(arg)?
            } else {
                self.rvalue(arg)?
            };
            let by_reference = param.spec.by_reference();
            if by_reference && !self.is_lvalue(arg) {
                return Err(Error::ExpectedLvalue { span: arg.span });
            }
            if self.types.equals_for_argument(param.ty, actual) {
                continue;
            }
            // A by-reference slot can only be reinterpreted, never converted
            if self.is_implicit(param.ty, actual) && (!by_reference || self.types.is_pointer(param.ty)) {
                arg.cast_to(param.ty);
                continue;
            }
            return Err(Error::InvalidArgument {
                expected: self.types.name(param.ty),
                actual: self.types.name(actual),
                span: arg.span,
            });
        }
        Ok(ret)
    }

    fn analyze_builtin(&mut self, builtin: Builtin, args: &mut [Expr], span: Span) -> Result<TypeId> {
        match builtin {
            Builtin::Write | Builtin::Writeln => {
                for arg in args.iter_mut() {
                    let ty = self.rvalue(arg)?;
                    let t = &*self.types;
                    if !(t.is_int(ty) || t.is_double(ty) || t.is_char(ty) || t.is_string(ty) || t.is_pointer(ty)) {
                        return Err(Error::InvalidArgument {
                            expected: "printable type".to_string(),
                            actual: t.name(ty),
                            span: arg.span,
                        });
                    }
                }
                Ok(TypeId::VOID)
            }
            Builtin::Read | Builtin::Readln => {
                for arg in args.iter_mut() {
                    self.analyze_expr(arg)?;
                    if !self.is_lvalue(arg) {
                        return Err(Error::ExpectedLvalue { span: arg.span });
                    }
                    let ty = self.value_type(arg)?;
                    let t = &*self.types;
                    if !(t.is_int(ty) || t.is_double(ty) || t.is_char(ty)) {
                        return Err(Error::InvalidArgument {
                            expected: "readable type".to_string(),
                            actual: t.name(ty),
                            span: arg.span,
                        });
                    }
                }
                Ok(TypeId::VOID)
            }
            Builtin::High | Builtin::Low => {
                if args.len() != 1 {
                    return Err(Error::ArgCountMismatch { expected: 1, got: args.len(), span });
                }
                let arg = &mut args[0];
                self.analyze_expr(arg)?;
                let ty = self.value_type(arg)?;
                if !(self.types.is_static_array(ty) || self.types.is_open_array(ty)) {
                    return Err(Error::InvalidArgument {
                        expected: "array type".to_string(),
                        actual: self.types.name(ty),
                        span: arg.span,
                    });
                }
                Ok(TypeId::INT)
            }
            Builtin::Exit => {
                let ret = self.ret;
                let allowed = if self.types.is_void(ret) { 0 } else { 1 };
                if args.len() > allowed {
                    return Err(Error::ArgCountMismatch { expected: allowed, got: args.len(), span });
                }
                if let Some(arg) = args.first_mut() {
                    let actual = self.rvalue(arg)?;
                    if self.is_implicit(ret, actual) {
                        arg.cast_to(ret);
                    } else if !self.types.equals_for_argument(ret, actual) {
                        return Err(Error::InvalidArgument {
                            expected: self.types.name(ret),
                            actual: self.types.name(actual),
                            span: arg.span,
                        });
                    }
                }
                Ok(TypeId::VOID)
            }
            other => Err(Error::InternalInvariant(format!(
                "built-in {} has a fixed signature",
                other.name()
            ))),
        }
    }

    // ==================== Type Rules ====================

    /// Conversions inserted without an explicit cast: `src` widens to `target`
    fn is_implicit(&self, target: TypeId, src: TypeId) -> bool {
        (self.types.is_double(target) && self.types.is_int(src))
            || (self.types.is_pure_pointer(target) && self.types.is_typed_pointer(src))
    }

    /// Insert an implicit conversion on one side. In an assignment only the
    /// right side can change.
    fn set_cast(&self, left: &mut Expr, right: &mut Expr, assignment: bool) -> bool {
        let (Some(lt), Some(rt)) = (left.ty, right.ty) else {
            return false;
        };
        if self.is_implicit(lt, rt) {
            right.cast_to(lt);
            true
        } else if !assignment && self.is_implicit(rt, lt) {
            left.cast_to(rt);
            true
        } else {
            false
        }
    }

    /// Type of `left op right`, or None when the operation is invalid.
    /// Both operands must already be analyzed.
    fn check_binary(&self, op: BinOp, left: &mut Expr, right: &mut Expr, assignment: bool) -> Option<TypeId> {
        let t = &*self.types;
        match op {
            BinOp::Add | BinOp::Sub => self.check_additive(op, left, right, assignment),
            BinOp::Mul | BinOp::Div => {
                self.set_cast(left, right, assignment);
                let (lt, rt) = (left.ty?, right.ty?);
                let mut pass = (t.is_double(lt) || t.is_int(lt)) && t.equals(lt, rt);
                let mut result = lt;
                if op == BinOp::Div {
                    if t.is_int(lt) && t.is_int(rt) {
                        if assignment {
                            return None;
                        }
                        left.cast_to(TypeId::DOUBLE);
                        right.cast_to(TypeId::DOUBLE);
                        pass = true;
                    }
                    result = TypeId::DOUBLE;
                }
                pass.then_some(result)
            }
            BinOp::IntDiv | BinOp::Mod | BinOp::Shl | BinOp::Shr => {
                let (lt, rt) = (left.ty?, right.ty?);
                (t.is_int(lt) && t.is_int(rt)).then_some(lt)
            }
            BinOp::And | BinOp::Or | BinOp::Xor => {
                let (lt, rt) = (left.ty?, right.ty?);
                ((t.is_int(lt) || t.is_bool(lt)) && t.equals(lt, rt)).then_some(lt)
            }
            BinOp::Eq | BinOp::Ne => {
                let (lt, rt) = (left.ty?, right.ty?);
                let pass = if t.is_pointer(lt) && t.is_pointer(rt) {
                    self.set_cast(left, right, false) || t.equals(lt, rt)
                } else if t.is_string(lt) || t.is_string(rt) {
                    false
                } else {
                    let scalar = t.is_int(lt) || t.is_double(lt) || t.is_char(lt) || t.is_bool(lt);
                    (scalar && t.equals(lt, rt)) || self.set_cast(left, right, false)
                };
                pass.then_some(TypeId::BOOLEAN)
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let (lt, rt) = (left.ty?, right.ty?);
                let ordered = t.is_int(lt) || t.is_double(lt) || t.is_char(lt);
                let pass = (ordered && t.equals(lt, rt)) || self.set_cast(left, right, false);
                pass.then_some(TypeId::BOOLEAN)
            }
        }
    }

    fn check_additive(&self, op: BinOp, left: &mut Expr, right: &mut Expr, assignment: bool) -> Option<TypeId> {
        let t = &*self.types;
        let valid = |ty: TypeId| t.is_int(ty) || t.is_double(ty) || t.is_pointer(ty);
        if !valid(left.ty?) || !valid(right.ty?) {
            return None;
        }
        self.set_cast(left, right, assignment);
        let (lt, rt) = (left.ty?, right.ty?);

        if t.is_pointer(lt) && t.is_pointer(rt) {
            return (op == BinOp::Sub).then_some(TypeId::INT);
        }
        if t.equals(lt, rt) {
            return Some(lt);
        }
        if let (Some(base), true) = (t.pointee(lt), t.is_int(rt)) {
            scale(right, t.size(base));
            return Some(lt);
        }
        if let (true, Some(base)) = (t.is_int(lt), t.pointee(rt)) {
            if op == BinOp::Add && !assignment {
                scale(left, t.size(base));
                return Some(rt);
            }
        }
        None
    }

    fn expect_int(&self, expr: &Expr) -> Result<()> {
        match expr.ty {
            Some(ty) if self.types.is_int(ty) => Ok(()),
            ty => Err(Error::InvalidArgument {
                expected: "integer".to_string(),
                actual: ty.map_or_else(|| "built-in routine".to_string(), |ty| self.types.name(ty)),
                span: expr.span,
            }),
        }
    }

    /// Whether the expression denotes a storage location
    fn is_lvalue(&self, expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Variable { binding, .. } => {
                matches!(binding, Some(Binding::Variable | Binding::Constant))
            }
            ExprKind::Index { base, .. } | ExprKind::Field { base, .. } => self.is_lvalue(base),
            ExprKind::Unary { op, .. } => *op == UnaryOp::Deref,
            ExprKind::Cast { target, expr: inner } => {
                self.types.is_pointer(*target)
                    || (self.is_lvalue(inner)
                        && inner.ty.map_or(false, |ty| self.types.equals(ty, *target)))
            }
            _ => false,
        }
    }
}

/// Rewrite an integer offset into `offset * size`
fn scale(offset: &mut Expr, size: i64) {
    let span = offset.span;
    offset.wrap(TypeId::INT, |inner| ExprKind::Binary {
        op: BinOp::Mul,
        left: Box::new(inner),
        right: Box::new(Expr::typed(ExprKind::Literal(Literal::Int(size)), TypeId::INT, span)),
    });
}
