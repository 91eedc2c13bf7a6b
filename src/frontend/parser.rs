//! Parser for the Pascal-like source language
//!
//! Recursive descent over declarations and statements, precedence climbing
//! for expressions. Declarations go straight into the scope tree: types are
//! built in the arena, variables get their storage, constants are folded.
//! The statement tree is left unchecked for the semantic analyzer.

use std::cmp::Ordering;

use log::{debug, trace};

use crate::frontend::ast::*;
use crate::frontend::lexer::Lexer;
use crate::frontend::scope::{
    ConstValue, Constant, Function, ScopeId, ScopeStack, Storage, Symbol, VarKind, Variable,
};
use crate::frontend::token::{Token, TokenKind};
use crate::types::{Bound, Field, Param, PassSpec, Type, TypeArena, TypeId};
use crate::utils::{Error, Result, Span};

/// Offset of the first parameter above the frame pointer
const PARAMS_BASE: i64 = 16;

/// The parser
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    types: TypeArena,
    scopes: ScopeStack,
    routines: Vec<Routine>,
    /// Initializers of the declaration section being parsed
    inits: Vec<Stmt>,
    loop_depth: usize,
    const_count: usize,
    in_routine: bool,
    in_type_section: bool,
}

impl Parser {
    /// Tokenize `source` and create a parser over it
    pub fn new(source: &str) -> Result<Self> {
        let tokens = Lexer::new(source).tokenize()?;
        Ok(Self::from_tokens(tokens))
    }

    /// Create a parser from pre-tokenized input
    pub fn from_tokens(mut tokens: Vec<Token>) -> Self {
        if !matches!(tokens.last(), Some(Token { kind: TokenKind::Eof, .. })) {
            let span = tokens.last().map(|t| t.span).unwrap_or_default();
            tokens.push(Token::eof(span));
        }
        let mut types = TypeArena::new();
        let scopes = ScopeStack::with_globals(&mut types);
        Self {
            tokens,
            pos: 0,
            types,
            scopes,
            routines: Vec::new(),
            inits: Vec::new(),
            loop_depth: 0,
            const_count: 0,
            in_routine: false,
            in_type_section: false,
        }
    }

    // ==================== Helper Methods ====================

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn current_kind(&self) -> &TokenKind {
        &self.current().kind
    }

    fn prev_span(&self) -> Span {
        self.tokens[self.pos.saturating_sub(1)].span
    }

    fn advance(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.current_kind()) == std::mem::discriminant(kind)
    }

    fn expect(&mut self, expected: TokenKind) -> Result<Token> {
        if self.check(&expected) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&expected.to_string()))
        }
    }

    fn consume(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &str) -> Error {
        Error::UnexpectedToken {
            expected: expected.to_string(),
            got: self.current_kind().to_string(),
            span: self.current().span,
        }
    }

    fn parse_ident(&mut self) -> Result<(String, Span)> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Ident(name) => {
                self.advance();
                Ok((name, token.span))
            }
            _ => Err(Error::ExpectedIdent { span: token.span }),
        }
    }

    fn parse_ident_list(&mut self) -> Result<Vec<(String, Span)>> {
        let mut names = vec![self.parse_ident()?];
        while self.consume(&TokenKind::Comma) {
            names.push(self.parse_ident()?);
        }
        Ok(names)
    }

    // ==================== Program ====================

    /// Parse a complete program
    pub fn parse_program(mut self) -> Result<Program> {
        let name = if self.consume(&TokenKind::Program) {
            let (name, _) = self.parse_ident()?;
            self.expect(TokenKind::Semicolon)?;
            Some(name)
        } else {
            None
        };

        self.parse_declarations()?;
        self.scopes.finish_routines()?;

        let (stmts, _) = self.parse_compound()?;
        self.expect(TokenKind::Dot)?;
        if !self.check(&TokenKind::Eof) {
            return Err(self.unexpected("end of file"));
        }

        let mut body = std::mem::take(&mut self.inits);
        body.extend(stmts);
        debug!(
            "parsed program {:?}: {} routines, {} types",
            name,
            self.routines.len(),
            self.types.len()
        );

        Ok(Program {
            name,
            types: self.types,
            scopes: self.scopes,
            routines: self.routines,
            body,
        })
    }

    fn parse_declarations(&mut self) -> Result<()> {
        loop {
            match self.current_kind() {
                TokenKind::Var => self.parse_var_section()?,
                TokenKind::Const => self.parse_const_section()?,
                TokenKind::Type => self.parse_type_section()?,
                TokenKind::Function | TokenKind::Procedure => {
                    if self.in_routine {
                        return Err(Error::Unsupported {
                            what: "nested routine declarations".to_string(),
                            span: self.current().span,
                        });
                    }
                    self.parse_routine()?;
                }
                _ => return Ok(()),
            }
        }
    }

    // ==================== Declarations ====================

    fn parse_var_section(&mut self) -> Result<()> {
        self.expect(TokenKind::Var)?;
        while matches!(self.current_kind(), TokenKind::Ident(_)) {
            let names = self.parse_ident_list()?;
            self.expect(TokenKind::Colon)?;
            let ty = self.parse_type(false)?;

            let init = if self.check(&TokenKind::Eq) {
                if names.len() != 1 {
                    return Err(self.unexpected(";"));
                }
                self.advance();
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect(TokenKind::Semicolon)?;

            for (name, span) in &names {
                self.declare_variable(name, ty, *span)?;
            }
            if let Some(value) = init {
                let (name, span) = &names[0];
                let stmt_span = span.merge(&value.span);
                self.inits.push(Stmt::Assign {
                    op: AssignOp::Assign,
                    target: Expr::variable(name, *span),
                    value,
                    span: stmt_span,
                });
            }
        }
        Ok(())
    }

    fn declare_variable(&mut self, name: &str, ty: TypeId, span: Span) -> Result<()> {
        let (kind, storage) = if self.in_routine {
            let offset = self.scopes.allocate_local(self.types.size(ty));
            (VarKind::Local, Storage::Frame(offset))
        } else {
            (VarKind::Global, Storage::Label(format!("___{}", name)))
        };
        trace!("variable {}: {} at {:?}", name, self.types.name(ty), storage);
        self.scopes.declare_variable(Variable {
            name: name.to_string(),
            ty,
            kind,
            storage,
            span,
        })
    }

    fn parse_const_section(&mut self) -> Result<()> {
        self.expect(TokenKind::Const)?;
        while matches!(self.current_kind(), TokenKind::Ident(_)) {
            let (name, span) = self.parse_ident()?;
            self.expect(TokenKind::Eq)?;
            let expr = self.parse_expr()?;
            self.expect(TokenKind::Semicolon)?;

            let value = self.fold(&expr)?;
            let label = format!("const_{}", self.const_count);
            self.const_count += 1;
            self.scopes.declare_constant(Constant {
                name,
                ty: value.ty(),
                value,
                label,
                span,
            })?;
        }
        Ok(())
    }

    fn parse_type_section(&mut self) -> Result<()> {
        self.expect(TokenKind::Type)?;
        self.in_type_section = true;
        let result = self.parse_type_decls();
        self.in_type_section = false;
        result?;
        self.scopes.finish_type_section(&self.types)
    }

    fn parse_type_decls(&mut self) -> Result<()> {
        while matches!(self.current_kind(), TokenKind::Ident(_)) {
            let (name, span) = self.parse_ident()?;
            self.expect(TokenKind::Eq)?;
            let ty = if self.check(&TokenKind::Record) {
                self.parse_record_type(Some(name.clone()))?
            } else {
                let target = self.parse_type(false)?;
                self.types.alloc(Type::Alias { name: name.clone(), target })
            };
            self.expect(TokenKind::Semicolon)?;
            self.scopes.declare_type(&mut self.types, &name, ty, span)?;
        }
        Ok(())
    }

    // ==================== Types ====================

    /// Parse a type denoter; `open` allows `array of T` (parameter position)
    fn parse_type(&mut self, open: bool) -> Result<TypeId> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Ident(name) => {
                self.advance();
                self.named_type(&name, token.span)
            }
            TokenKind::Caret => {
                self.advance();
                let (name, span) = self.parse_ident()?;
                self.pointer_type(&name, span)
            }
            TokenKind::Array => self.parse_array_type(open),
            TokenKind::Record => self.parse_record_type(None),
            TokenKind::Function | TokenKind::Procedure => self.parse_procedural_type(),
            _ => Err(Error::ExpectedType { span: token.span }),
        }
    }

    fn named_type(&self, name: &str, span: Span) -> Result<TypeId> {
        match self.scopes.lookup(name) {
            Some(Symbol::Type(ty)) => Ok(ty),
            Some(_) => Err(Error::ExpectedType { span }),
            None => Err(Error::NotDefined { name: name.to_string(), span }),
        }
    }

    /// `^Name`; inside a type section an unknown name becomes a forward type
    fn pointer_type(&mut self, name: &str, span: Span) -> Result<TypeId> {
        let base = match self.scopes.lookup(name) {
            Some(Symbol::Type(ty)) => ty,
            Some(_) => return Err(Error::ExpectedType { span }),
            None if self.in_type_section => {
                self.scopes.declare_forward_type(&mut self.types, name, span)?
            }
            None => return Err(Error::NotDefined { name: name.to_string(), span }),
        };
        Ok(self.types.alloc(Type::TypedPointer(base)))
    }

    fn parse_array_type(&mut self, open: bool) -> Result<TypeId> {
        let start = self.expect(TokenKind::Array)?.span;
        if self.consume(&TokenKind::LBracket) {
            let mut bounds = Vec::new();
            loop {
                let low = self.parse_const_int()?;
                self.expect(TokenKind::DotDot)?;
                let high_span = self.current().span;
                let high = self.parse_const_int()?;
                if high < low {
                    return Err(Error::Expected(format!("upper bound of at least {}", low), high_span));
                }
                bounds.push(Bound::new(low, high));
                if !self.consume(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RBracket)?;
            self.expect(TokenKind::Of)?;
            let elem = self.parse_type(false)?;
            let array = self.types.alloc(Type::StaticArray { elem, bounds });
            return self.check_size(array, start.merge(&self.prev_span()));
        }

        if !open {
            return Err(Error::Expected("array bounds".to_string(), self.current().span));
        }
        self.expect(TokenKind::Of)?;
        let elem = self.parse_type(true)?;
        Ok(self.types.alloc(Type::OpenArray(elem)))
    }

    fn parse_record_type(&mut self, name: Option<String>) -> Result<TypeId> {
        let start = self.expect(TokenKind::Record)?.span;
        let mut fields: Vec<Field> = Vec::new();
        while !self.check(&TokenKind::End) {
            let names = self.parse_ident_list()?;
            self.expect(TokenKind::Colon)?;
            let ty = self.parse_type(false)?;
            for (field, span) in names {
                if fields.iter().any(|f| f.name == field) {
                    return Err(Error::AlreadyDefined { name: field, span });
                }
                fields.push(Field { name: field, ty });
            }
            if !self.consume(&TokenKind::Semicolon) {
                break;
            }
        }
        let end = self.expect(TokenKind::End)?.span;
        let record = self.types.alloc(Type::Record { name, fields });
        self.check_size(record, start.merge(&end))
    }

    /// Reject types whose byte size overflows
    fn check_size(&self, ty: TypeId, span: Span) -> Result<TypeId> {
        match self.types.checked_size(ty) {
            Some(_) => Ok(ty),
            None => Err(Error::TypeTooLarge { ty: self.types.name(ty), span }),
        }
    }

    /// `function(params): T` or `procedure(params)`
    fn parse_procedural_type(&mut self) -> Result<TypeId> {
        let is_function = self.check(&TokenKind::Function);
        self.advance();
        let params = if self.check(&TokenKind::LParen) {
            self.parse_params()?
        } else {
            Vec::new()
        };
        let ret = if is_function {
            self.expect(TokenKind::Colon)?;
            self.parse_type(false)?
        } else {
            TypeId::VOID
        };
        Ok(self.types.alloc(Type::FunctionSignature {
            params: params.into_iter().map(|(p, _)| p).collect(),
            ret,
        }))
    }

    fn parse_params(&mut self) -> Result<Vec<(Param, Span)>> {
        self.expect(TokenKind::LParen)?;
        let mut params: Vec<(Param, Span)> = Vec::new();
        while !self.check(&TokenKind::RParen) {
            let spec = match self.current_kind() {
                TokenKind::Var => PassSpec::Var,
                TokenKind::Const => PassSpec::Const,
                TokenKind::Out => PassSpec::Out,
                _ => PassSpec::Value,
            };
            if spec != PassSpec::Value {
                self.advance();
            }
            let names = self.parse_ident_list()?;
            self.expect(TokenKind::Colon)?;
            let ty = self.parse_type(true)?;
            for (name, span) in names {
                if params.iter().any(|(p, _)| p.name == name) {
                    return Err(Error::AlreadyDefined { name, span });
                }
                params.push((Param { name, ty, spec }, span));
            }
            if !self.consume(&TokenKind::Semicolon) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(params)
    }

    // ==================== Routines ====================

    fn parse_routine(&mut self) -> Result<()> {
        let is_function = self.check(&TokenKind::Function);
        self.advance();
        let (name, span) = self.parse_ident()?;
        let params = if self.check(&TokenKind::LParen) {
            self.parse_params()?
        } else {
            Vec::new()
        };
        let ret = if is_function {
            self.expect(TokenKind::Colon)?;
            self.parse_type(false)?
        } else {
            TypeId::VOID
        };
        self.expect(TokenKind::Semicolon)?;

        let signature = self.types.alloc(Type::FunctionSignature {
            params: params.iter().map(|(p, _)| p.clone()).collect(),
            ret,
        });
        let is_forward = matches!(self.current_kind(), TokenKind::Ident(word) if word == "forward");
        self.scopes.declare_function(
            &self.types,
            Function {
                name: name.clone(),
                signature: Some(signature),
                builtin: None,
                is_forward,
                scope: None,
                routine: None,
                span,
            },
        )?;
        if is_forward {
            self.advance();
            self.expect(TokenKind::Semicolon)?;
            return Ok(());
        }

        debug!("parsing routine {}", name);
        let outer_inits = std::mem::take(&mut self.inits);
        let scope = self.scopes.create_scope();
        self.scopes.enter(scope);
        self.in_routine = true;
        let result = self.parse_routine_body(&name, signature, &params, ret, span, scope);
        self.in_routine = false;
        self.scopes.exit();
        self.inits = outer_inits;

        let routine = result?;
        self.scopes.set_routine(&name, scope, self.routines.len());
        self.routines.push(routine);
        Ok(())
    }

    fn parse_routine_body(
        &mut self,
        name: &str,
        signature: TypeId,
        params: &[(Param, Span)],
        ret: TypeId,
        span: Span,
        scope: ScopeId,
    ) -> Result<Routine> {
        // The last argument is pushed last, so it sits closest to the frame pointer
        let mut offset = PARAMS_BASE;
        for (param, param_span) in params.iter().rev() {
            let slot = if self.types.is_open_array(param.ty) {
                16
            } else if param.spec.by_reference() {
                8
            } else {
                self.types.slot_size(param.ty)
            };
            self.scopes.declare_variable(Variable {
                name: param.name.clone(),
                ty: param.ty,
                kind: VarKind::Parameter(param.spec),
                storage: Storage::Frame(offset),
                span: *param_span,
            })?;
            offset += slot;
        }
        let params_size = offset - PARAMS_BASE;

        if !self.types.is_void(ret) {
            self.scopes.declare_variable(Variable {
                name: name.to_string(),
                ty: ret,
                kind: VarKind::Result,
                storage: Storage::Frame(offset),
                span,
            })?;
        }

        self.parse_declarations()?;
        let (stmts, end_span) = self.parse_compound()?;
        self.expect(TokenKind::Semicolon)?;

        let mut body = std::mem::take(&mut self.inits);
        body.extend(stmts);
        Ok(Routine {
            name: name.to_string(),
            signature,
            scope,
            body,
            params_size,
            span: span.merge(&end_span),
        })
    }

    // ==================== Statements ====================

    fn parse_compound(&mut self) -> Result<(Block, Span)> {
        let start = self.expect(TokenKind::Begin)?.span;
        let mut stmts = Vec::new();
        loop {
            if self.check(&TokenKind::End) {
                break;
            }
            if self.consume(&TokenKind::Semicolon) {
                continue;
            }
            stmts.push(self.parse_stmt()?);
            if !self.consume(&TokenKind::Semicolon) {
                break;
            }
        }
        let end = self.expect(TokenKind::End)?.span;
        Ok((stmts, start.merge(&end)))
    }

    fn parse_stmt(&mut self) -> Result<Stmt> {
        let token = self.current().clone();
        match token.kind {
            TokenKind::Begin => {
                let (stmts, span) = self.parse_compound()?;
                Ok(Stmt::Block { stmts, span })
            }
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Break | TokenKind::Continue => {
                self.advance();
                if self.loop_depth == 0 {
                    return Err(Error::OutsideLoop {
                        keyword: token.kind.to_string(),
                        span: token.span,
                    });
                }
                Ok(match token.kind {
                    TokenKind::Break => Stmt::Break { span: token.span },
                    _ => Stmt::Continue { span: token.span },
                })
            }
            TokenKind::Repeat | TokenKind::Goto | TokenKind::With | TokenKind::Label => {
                Err(Error::Unsupported {
                    what: format!("\"{}\" statements", token.kind),
                    span: token.span,
                })
            }
            _ => self.parse_simple_stmt(),
        }
    }

    /// A statement that may be empty, as in `if c then else x := 1`
    fn parse_branch(&mut self) -> Result<Stmt> {
        if matches!(
            self.current_kind(),
            TokenKind::Semicolon | TokenKind::End | TokenKind::Else
        ) {
            return Ok(Stmt::Block { stmts: Vec::new(), span: self.current().span });
        }
        self.parse_stmt()
    }

    fn parse_loop_body(&mut self) -> Result<Stmt> {
        self.loop_depth += 1;
        let body = self.parse_branch();
        self.loop_depth -= 1;
        body
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        let start = self.expect(TokenKind::If)?.span;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Then)?;
        let then_branch = Box::new(self.parse_branch()?);
        let else_branch = if self.consume(&TokenKind::Else) {
            Some(Box::new(self.parse_branch()?))
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
            span: start.merge(&self.prev_span()),
        })
    }

    fn parse_while(&mut self) -> Result<Stmt> {
        let start = self.expect(TokenKind::While)?.span;
        let cond = self.parse_expr()?;
        self.expect(TokenKind::Do)?;
        let body = Box::new(self.parse_loop_body()?);
        Ok(Stmt::While { cond, body, span: start.merge(&self.prev_span()) })
    }

    fn parse_for(&mut self) -> Result<Stmt> {
        let start = self.expect(TokenKind::For)?.span;
        let (name, var_span) = self.parse_ident()?;
        self.expect(TokenKind::Assign)?;
        let from = self.parse_expr()?;
        let downto = match self.current_kind() {
            TokenKind::To => false,
            TokenKind::Downto => true,
            _ => return Err(self.unexpected("to")),
        };
        self.advance();
        let to = self.parse_expr()?;
        self.expect(TokenKind::Do)?;
        let body = Box::new(self.parse_loop_body()?);
        Ok(Stmt::For {
            var: Expr::variable(&name, var_span),
            from,
            to,
            downto,
            body,
            span: start.merge(&self.prev_span()),
        })
    }

    /// An expression, optionally followed by an assignment operator and a value
    fn parse_simple_stmt(&mut self) -> Result<Stmt> {
        let target = self.parse_expr()?;
        let op = match self.current_kind() {
            TokenKind::Assign => AssignOp::Assign,
            TokenKind::PlusAssign => AssignOp::Add,
            TokenKind::MinusAssign => AssignOp::Sub,
            TokenKind::StarAssign => AssignOp::Mul,
            TokenKind::SlashAssign => AssignOp::Div,
            _ => {
                let span = target.span;
                return Ok(Stmt::Expr { expr: target, span });
            }
        };
        self.advance();
        let value = self.parse_expr()?;
        let span = target.span.merge(&value.span);
        Ok(Stmt::Assign { op, target, value, span })
    }

    // ==================== Expressions ====================

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_expr_prec(0)
    }

    /// Precedence climbing; every binary level is left associative
    fn parse_expr_prec(&mut self, min_prec: u8) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let Some(prec) = self.current_kind().binary_precedence() else {
                break;
            };
            if prec < min_prec {
                break;
            }
            let op_token = self.advance();
            let op = Self::token_to_binop(&op_token)?;
            let right = self.parse_expr_prec(prec + 1)?;
            let span = left.span.merge(&right.span);
            left = Expr::new(
                ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) },
                span,
            );
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let token = self.current().clone();
        let op = match token.kind {
            TokenKind::Not => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Plus,
            TokenKind::At => UnaryOp::AddrOf,
            _ => return self.parse_primary(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        let span = token.span.merge(&operand.span);
        Ok(Expr::new(ExprKind::Unary { op, operand: Box::new(operand) }, span))
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.current().clone();
        let span = token.span;
        let expr = match token.kind {
            TokenKind::IntLit(n) => {
                self.advance();
                Expr::new(ExprKind::Literal(Literal::Int(n)), span)
            }
            TokenKind::DoubleLit(n) => {
                self.advance();
                Expr::new(ExprKind::Literal(Literal::Double(n)), span)
            }
            TokenKind::StringLit(s) => {
                self.advance();
                Expr::new(ExprKind::Literal(Literal::Str(s)), span)
            }
            TokenKind::True => {
                self.advance();
                Expr::new(ExprKind::Literal(Literal::Bool(true)), span)
            }
            TokenKind::False => {
                self.advance();
                Expr::new(ExprKind::Literal(Literal::Bool(false)), span)
            }
            TokenKind::Nil => {
                self.advance();
                Expr::new(ExprKind::Literal(Literal::Nil), span)
            }
            TokenKind::Ident(name) => {
                self.advance();
                match self.scopes.lookup(&name) {
                    // `TypeName(expr)` is a conversion
                    Some(Symbol::Type(target)) if self.check(&TokenKind::LParen) => {
                        self.advance();
                        let inner = self.parse_expr()?;
                        let end = self.expect(TokenKind::RParen)?.span;
                        Expr::new(ExprKind::Cast { target, expr: Box::new(inner) }, span.merge(&end))
                    }
                    _ => Expr::variable(&name, span),
                }
            }
            TokenKind::LParen => {
                self.advance();
                let mut inner = self.parse_expr()?;
                let end = self.expect(TokenKind::RParen)?.span;
                inner.span = span.merge(&end);
                inner
            }
            other => {
                return Err(Error::ExpectedExpr { got: other.to_string(), span });
            }
        };
        self.parse_postfix(expr)
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr> {
        loop {
            match self.current_kind() {
                TokenKind::Caret => {
                    let end = self.advance().span;
                    let span = expr.span.merge(&end);
                    expr = Expr::new(
                        ExprKind::Unary { op: UnaryOp::Deref, operand: Box::new(expr) },
                        span,
                    );
                }
                TokenKind::Dot => {
                    self.advance();
                    let (field, end) = self.parse_ident()?;
                    let span = expr.span.merge(&end);
                    expr = Expr::new(ExprKind::Field { base: Box::new(expr), field }, span);
                }
                TokenKind::LBracket => {
                    self.advance();
                    let mut indices = vec![self.parse_expr()?];
                    while self.consume(&TokenKind::Comma) {
                        indices.push(self.parse_expr()?);
                    }
                    let end = self.expect(TokenKind::RBracket)?.span;
                    let span = expr.span.merge(&end);
                    expr = Expr::new(ExprKind::Index { base: Box::new(expr), indices }, span);
                }
                TokenKind::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    while !self.check(&TokenKind::RParen) {
                        args.push(self.parse_expr()?);
                        if !self.consume(&TokenKind::Comma) {
                            break;
                        }
                    }
                    let end = self.expect(TokenKind::RParen)?.span;
                    let span = expr.span.merge(&end);
                    expr = Expr::new(ExprKind::Call { callee: Box::new(expr), args }, span);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn token_to_binop(token: &Token) -> Result<BinOp> {
        let op = match token.kind {
            TokenKind::Plus => BinOp::Add,
            TokenKind::Minus => BinOp::Sub,
            TokenKind::Star => BinOp::Mul,
            TokenKind::Slash => BinOp::Div,
            TokenKind::Div => BinOp::IntDiv,
            TokenKind::Mod => BinOp::Mod,
            TokenKind::And => BinOp::And,
            TokenKind::Or => BinOp::Or,
            TokenKind::Xor => BinOp::Xor,
            TokenKind::Shl | TokenKind::ShiftLeft => BinOp::Shl,
            TokenKind::Shr | TokenKind::ShiftRight => BinOp::Shr,
            TokenKind::Eq => BinOp::Eq,
            TokenKind::Ne => BinOp::Ne,
            TokenKind::Lt => BinOp::Lt,
            TokenKind::Le => BinOp::Le,
            TokenKind::Gt => BinOp::Gt,
            TokenKind::Ge => BinOp::Ge,
            _ => {
                return Err(Error::UnexpectedToken {
                    expected: "operator".to_string(),
                    got: token.kind.to_string(),
                    span: token.span,
                })
            }
        };
        Ok(op)
    }

    // ==================== Constant Folding ====================

    fn parse_const_int(&mut self) -> Result<i64> {
        let expr = self.parse_expr()?;
        match self.fold(&expr)? {
            ConstValue::Int(n) => Ok(n),
            ConstValue::Str(s) if s.chars().count() == 1 => Ok(s.chars().next().map_or(0, |c| c as i64)),
            _ => Err(Error::Expected("integer constant".to_string(), expr.span)),
        }
    }

    /// Evaluate a constant expression
    fn fold(&self, expr: &Expr) -> Result<ConstValue> {
        match &expr.kind {
            ExprKind::Literal(lit) => Ok(match lit {
                Literal::Int(n) => ConstValue::Int(*n),
                Literal::Double(n) => ConstValue::Double(*n),
                Literal::Str(s) => ConstValue::Str(s.clone()),
                Literal::Bool(b) => ConstValue::Bool(*b),
                Literal::Nil => ConstValue::Nil,
            }),
            ExprKind::Variable { name, .. } => match self.scopes.lookup_constant(name) {
                Some(constant) => Ok(constant.value.clone()),
                None if self.scopes.lookup(name).is_some() => {
                    Err(Error::Expected("constant expression".to_string(), expr.span))
                }
                None => Err(Error::NotDefined { name: name.clone(), span: expr.span }),
            },
            ExprKind::Unary { op, operand } => {
                let value = self.fold(operand)?;
                match (op, value) {
                    (UnaryOp::Neg, ConstValue::Int(n)) => Ok(ConstValue::Int(n.wrapping_neg())),
                    (UnaryOp::Neg, ConstValue::Double(n)) => Ok(ConstValue::Double(-n)),
                    (UnaryOp::Plus, value @ (ConstValue::Int(_) | ConstValue::Double(_))) => Ok(value),
                    (UnaryOp::Not, ConstValue::Bool(b)) => Ok(ConstValue::Bool(!b)),
                    (UnaryOp::Not, ConstValue::Int(n)) => Ok(ConstValue::Int(!n)),
                    (op, value) => Err(Error::InvalidOperand {
                        op: op.symbol().to_string(),
                        ty: self.types.name(value.ty()),
                        span: expr.span,
                    }),
                }
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.fold(left)?;
                let right = self.fold(right)?;
                self.fold_binary(*op, left, right, expr.span)
            }
            ExprKind::Cast { target, expr: inner } => {
                let value = self.fold(inner)?;
                match (self.types.kind(*target), &value) {
                    (Type::Int, ConstValue::Int(n)) => Ok(ConstValue::Int(*n)),
                    (Type::Int, ConstValue::Double(n)) => Ok(ConstValue::Int(n.trunc() as i64)),
                    (Type::Int, ConstValue::Bool(b)) => Ok(ConstValue::Int(i64::from(*b))),
                    (Type::Double, ConstValue::Int(n)) => Ok(ConstValue::Double(*n as f64)),
                    (Type::Double, ConstValue::Double(n)) => Ok(ConstValue::Double(*n)),
                    _ => Err(Error::InvalidCast {
                        from: self.types.name(value.ty()),
                        to: self.types.name(*target),
                        span: expr.span,
                    }),
                }
            }
            _ => Err(Error::Expected("constant expression".to_string(), expr.span)),
        }
    }

    fn fold_binary(&self, op: BinOp, left: ConstValue, right: ConstValue, span: Span) -> Result<ConstValue> {
        use ConstValue::{Bool, Int, Str};

        let invalid = || Error::InvalidOperation {
            op: op.symbol().to_string(),
            left: self.types.name(left.ty()),
            right: self.types.name(right.ty()),
            span,
        };

        if op.is_comparison() {
            let ordering = compare(&left, &right).ok_or_else(invalid)?;
            let result = match op {
                BinOp::Eq => ordering == Ordering::Equal,
                BinOp::Ne => ordering != Ordering::Equal,
                BinOp::Lt => ordering == Ordering::Less,
                BinOp::Le => ordering != Ordering::Greater,
                BinOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            return Ok(Bool(result));
        }

        let value = match (op, &left, &right) {
            (BinOp::IntDiv | BinOp::Mod, Int(_), Int(0)) => {
                return Err(Error::Expected("non-zero divisor".to_string(), span));
            }
            (BinOp::Add, Int(a), Int(b)) => Int(a.wrapping_add(*b)),
            (BinOp::Sub, Int(a), Int(b)) => Int(a.wrapping_sub(*b)),
            (BinOp::Mul, Int(a), Int(b)) => Int(a.wrapping_mul(*b)),
            (BinOp::IntDiv, Int(a), Int(b)) => Int(a.wrapping_div(*b)),
            (BinOp::Mod, Int(a), Int(b)) => Int(a.wrapping_rem(*b)),
            (BinOp::And, Int(a), Int(b)) => Int(a & b),
            (BinOp::Or, Int(a), Int(b)) => Int(a | b),
            (BinOp::Xor, Int(a), Int(b)) => Int(a ^ b),
            (BinOp::Shl, Int(a), Int(b)) => Int(a.wrapping_shl(*b as u32)),
            (BinOp::Shr, Int(a), Int(b)) => Int((*a as u64).wrapping_shr(*b as u32) as i64),
            (BinOp::And, Bool(a), Bool(b)) => Bool(*a && *b),
            (BinOp::Or, Bool(a), Bool(b)) => Bool(*a || *b),
            (BinOp::Xor, Bool(a), Bool(b)) => Bool(a != b),
            (BinOp::Add, Str(a), Str(b)) => Str(format!("{}{}", a, b)),
            (BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div, _, _) => {
                match (as_number(&left), as_number(&right)) {
                    (Some(a), Some(b)) => ConstValue::Double(match op {
                        BinOp::Add => a + b,
                        BinOp::Sub => a - b,
                        BinOp::Mul => a * b,
                        _ => a / b,
                    }),
                    _ => return Err(invalid()),
                }
            }
            _ => return Err(invalid()),
        };
        Ok(value)
    }
}

fn as_number(value: &ConstValue) -> Option<f64> {
    match value {
        ConstValue::Int(n) => Some(*n as f64),
        ConstValue::Double(n) => Some(*n),
        _ => None,
    }
}

fn compare(left: &ConstValue, right: &ConstValue) -> Option<Ordering> {
    match (left, right) {
        (ConstValue::Int(a), ConstValue::Int(b)) => Some(a.cmp(b)),
        (ConstValue::Str(a), ConstValue::Str(b)) => Some(a.cmp(b)),
        (ConstValue::Bool(a), ConstValue::Bool(b)) => Some(a.cmp(b)),
        (ConstValue::Nil, ConstValue::Nil) => Some(Ordering::Equal),
        _ => as_number(left)?.partial_cmp(&as_number(right)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(source: &str) -> Result<Program> {
        Parser::new(source)?.parse_program()
    }

    fn routine_var<'a>(program: &'a Program, routine: &Routine, name: &str) -> &'a Variable {
        program.scopes.scope(routine.scope).variables.get(name).unwrap()
    }

    #[test]
    fn test_minimal_program() {
        let program = parse("program hello; begin writeln('hi') end.").unwrap();
        assert_eq!(program.name.as_deref(), Some("hello"));
        assert_eq!(program.body.len(), 1);
        assert!(matches!(program.body[0], Stmt::Expr { .. }));
    }

    #[test]
    fn test_global_variables_get_labels() {
        let program = parse("var x, y: integer; begin x := 1 end.").unwrap();
        let y = program.scopes.lookup_variable("y").unwrap();
        assert_eq!(y.kind, VarKind::Global);
        assert_eq!(y.storage, Storage::Label("___y".to_string()));
        assert_eq!(y.ty, TypeId::INT);
    }

    #[test]
    fn test_precedence() {
        let program = parse("var x: integer; begin x := 1 + 2 * 3 end.").unwrap();
        let Stmt::Assign { value, .. } = &program.body[0] else {
            panic!("expected assignment");
        };
        match &value.kind {
            ExprKind::Binary { op: BinOp::Add, right, .. } => {
                assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_constant_folding_in_bounds() {
        let source = "const n = 2 * 5; m = n div 3; half = n / 4;
                      var a: array[1..n, 0..m] of integer;
                      begin end.";
        let program = parse(source).unwrap();
        assert_eq!(program.scopes.lookup_constant("m").unwrap().value, ConstValue::Int(3));
        assert_eq!(program.scopes.lookup_constant("half").unwrap().value, ConstValue::Double(2.5));

        let a = program.scopes.lookup_variable("a").unwrap();
        match program.types.kind(a.ty) {
            Type::StaticArray { bounds, .. } => {
                assert_eq!(bounds, &vec![Bound::new(1, 10), Bound::new(0, 3)]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(program.types.size(a.ty), 10 * 4 * 8);
    }

    #[test]
    fn test_forward_pointer_types() {
        let source = "type plist = ^node;
                           node = record value: integer; next: plist end;
                      var head: plist;
                      begin end.";
        let program = parse(source).unwrap();
        let head = program.scopes.lookup_variable("head").unwrap();
        let node = program.types.pointee(head.ty).unwrap();
        assert!(program.types.is_record(node));
        assert_eq!(program.types.field(node, "next").map(|(_, off)| off), Some(8));
    }

    #[test]
    fn test_unresolved_forward_type() {
        let err = parse("type p = ^missing; begin end.").unwrap_err();
        assert!(matches!(err, Error::ForwardUnresolved { ref name, .. } if name == "missing"));
    }

    #[test]
    fn test_routine_frame_layout() {
        let source = "function f(a: integer; var b: double; c: array of integer): integer;
                      var t: array[1..2] of integer; u: integer;
                      begin f := a end;
                      begin end.";
        let program = parse(source).unwrap();
        let routine = &program.routines[0];
        assert_eq!(routine.params_size, 32);
        assert_eq!(routine_var(&program, routine, "c").storage, Storage::Frame(16));
        assert_eq!(routine_var(&program, routine, "b").storage, Storage::Frame(32));
        assert_eq!(routine_var(&program, routine, "a").storage, Storage::Frame(40));
        assert_eq!(routine_var(&program, routine, "f").storage, Storage::Frame(48));
        assert_eq!(routine_var(&program, routine, "f").kind, VarKind::Result);
        assert_eq!(routine_var(&program, routine, "t").storage, Storage::Frame(-16));
        assert_eq!(routine_var(&program, routine, "u").storage, Storage::Frame(-24));
        assert_eq!(program.scopes.scope(routine.scope).frame_size, 24);

        let f = program.scopes.lookup_function("f").unwrap();
        assert_eq!(f.routine, Some(0));
        assert_eq!(f.scope, Some(routine.scope));
    }

    #[test]
    fn test_initializer_becomes_assignment() {
        let program = parse("var x: integer = 4; begin writeln(x) end.").unwrap();
        assert_eq!(program.body.len(), 2);
        assert!(matches!(
            &program.body[0],
            Stmt::Assign { op: AssignOp::Assign, value: Expr { kind: ExprKind::Literal(Literal::Int(4)), .. }, .. }
        ));
    }

    #[test]
    fn test_forward_routine() {
        let source = "procedure p(x: integer); forward;
                      procedure q; begin p(1) end;
                      procedure p(x: integer); begin q end;
                      begin end.";
        let program = parse(source).unwrap();
        assert_eq!(program.routines.len(), 2);
        assert!(!program.scopes.lookup_function("p").unwrap().is_forward);
    }

    #[test]
    fn test_forward_routine_without_body() {
        let err = parse("procedure p; forward; begin end.").unwrap_err();
        assert!(matches!(err, Error::ForwardUnresolved { .. }));
    }

    #[test]
    fn test_break_outside_loop() {
        let err = parse("begin break end.").unwrap_err();
        assert!(matches!(err, Error::OutsideLoop { ref keyword, .. } if keyword == "break"));
        assert!(parse("var i: integer; begin for i := 1 to 3 do break end.").is_ok());
    }

    #[test]
    fn test_nested_routines_rejected() {
        let source = "procedure outer; procedure inner; begin end; begin end; begin end.";
        assert!(matches!(parse(source), Err(Error::Unsupported { .. })));
    }

    #[test]
    fn test_type_name_call_is_cast() {
        let program = parse("var x: integer; begin x := integer(2.5) end.").unwrap();
        let Stmt::Assign { value, .. } = &program.body[0] else {
            panic!("expected assignment");
        };
        assert!(matches!(value.kind, ExprKind::Cast { target: TypeId::INT, .. }));
    }

    #[test]
    fn test_open_array_only_in_parameters() {
        let err = parse("var a: array of integer; begin end.").unwrap_err();
        assert!(matches!(err, Error::Expected(..)));
    }

    #[test]
    fn test_missing_semicolon() {
        let err = parse("var x: integer; begin x := 1 x := 2 end.").unwrap_err();
        assert!(matches!(err, Error::UnexpectedToken { ref expected, .. } if expected == "end"));
    }

    #[test]
    fn test_oversized_arrays_rejected() {
        let err = parse("var a: array[-9223372036854775807..9223372036854775807] of integer; begin end.")
            .unwrap_err();
        assert!(matches!(err, Error::TypeTooLarge { .. }));

        let err = parse("var a: array[1..4611686018427387904, 1..4] of integer; begin end.").unwrap_err();
        assert!(matches!(err, Error::TypeTooLarge { ref ty, .. } if ty.starts_with("array[")));
        assert_eq!(err.span().map(|span| span.line), Some(1));
    }

    #[test]
    fn test_oversized_records_rejected() {
        let source = "type big = array[1..1152921504606846975] of integer;
                      pair = record a, b: big end;
                      begin end.";
        let err = parse(source).unwrap_err();
        assert!(matches!(err, Error::TypeTooLarge { ref ty, .. } if ty == "pair"));
    }

    #[test]
    fn test_shr_folds_as_logical_shift() {
        let program = parse("const a = -8 shr 1; b = 16 shr 2; begin end.").unwrap();
        assert_eq!(program.scopes.lookup_constant("a").unwrap().value, ConstValue::Int(i64::MAX - 3));
        assert_eq!(program.scopes.lookup_constant("b").unwrap().value, ConstValue::Int(4));
    }

    #[test]
    fn test_var_open_array_parameter_takes_two_slots() {
        let source = "procedure p(var a: array of integer; n: integer); begin end;
                      begin end.";
        let program = parse(source).unwrap();
        let routine = &program.routines[0];
        assert_eq!(routine.params_size, 24);
        assert_eq!(routine_var(&program, routine, "n").storage, Storage::Frame(16));
        assert_eq!(routine_var(&program, routine, "a").storage, Storage::Frame(24));
    }
}
