//! Abstract Syntax Tree definitions
//!
//! The parser produces the raw tree; the semantic analyzer decorates every
//! expression with its resolved type and rewrites nodes in place (inserted
//! casts, scaled pointer offsets, implicit calls).

use crate::frontend::scope::{Builtin, ScopeId, ScopeStack};
use crate::types::{TypeArena, TypeId};
use crate::utils::Span;

/// A parsed compilation unit: the statement tree plus the populated scope tree
#[derive(Debug)]
pub struct Program {
    pub name: Option<String>,
    pub types: TypeArena,
    pub scopes: ScopeStack,
    pub routines: Vec<Routine>,
    /// Statements of the main block
    pub body: Block,
}

/// Definition of a user function or procedure
#[derive(Debug, Clone)]
pub struct Routine {
    pub name: String,
    pub signature: TypeId,
    /// Scope holding parameters, the result variable and locals
    pub scope: ScopeId,
    pub body: Block,
    /// Bytes of arguments the callee pops on return
    pub params_size: i64,
    pub span: Span,
}

/// A sequence of statements
pub type Block = Vec<Stmt>;

/// Statements
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `target op value`
    Assign {
        op: AssignOp,
        target: Expr,
        value: Expr,
        span: Span,
    },
    /// Statement-level call
    Expr { expr: Expr, span: Span },
    /// `begin ... end`
    Block { stmts: Block, span: Span },
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
        span: Span,
    },
    While { cond: Expr, body: Box<Stmt>, span: Span },
    For {
        var: Expr,
        from: Expr,
        to: Expr,
        downto: bool,
        body: Box<Stmt>,
        span: Span,
    },
    Break { span: Span },
    Continue { span: Span },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Assign { span, .. }
            | Stmt::Expr { span, .. }
            | Stmt::Block { span, .. }
            | Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::For { span, .. }
            | Stmt::Break { span }
            | Stmt::Continue { span } => *span,
        }
    }
}

/// An expression node together with its analyzed type
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    /// Written once by the semantic analyzer; `None` before analysis and for
    /// bare references to built-in functions
    pub ty: Option<TypeId>,
    pub span: Span,
}

/// Expression kinds
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    /// A name, resolved against the scope stack during analysis
    Variable { name: String, binding: Option<Binding> },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    /// `base[i, j, ...]`
    Index { base: Box<Expr>, indices: Vec<Expr> },
    /// `base.field`
    Field { base: Box<Expr>, field: String },
    Call { callee: Box<Expr>, args: Vec<Expr> },
    /// Explicit `T(expr)` or a conversion inserted by the analyzer
    Cast { target: TypeId, expr: Box<Expr> },
}

/// What a name was resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Variable,
    Constant,
    Function,
    Builtin(Builtin),
}

/// Literal values
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Double(f64),
    /// Single-character strings are typed as `char`
    Str(String),
    Bool(bool),
    Nil,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// `/`, always floating point
    Div,
    /// `div`
    IntDiv,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::IntDiv => "div",
            BinOp::Mod => "mod",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::Shr => "shr",
            BinOp::Eq => "=",
            BinOp::Ne => "<>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Neg,
    Not,
    /// `@x`
    AddrOf,
    /// `p^`
    Deref,
}

impl UnaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Neg => "-",
            UnaryOp::Not => "not",
            UnaryOp::AddrOf => "@",
            UnaryOp::Deref => "^",
        }
    }
}

/// Assignment operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
}

impl AssignOp {
    /// The arithmetic a compound assignment performs
    pub fn binop(&self) -> Option<BinOp> {
        match self {
            AssignOp::Assign => None,
            AssignOp::Add => Some(BinOp::Add),
            AssignOp::Sub => Some(BinOp::Sub),
            AssignOp::Mul => Some(BinOp::Mul),
            AssignOp::Div => Some(BinOp::Div),
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            AssignOp::Assign => ":=",
            AssignOp::Add => "+=",
            AssignOp::Sub => "-=",
            AssignOp::Mul => "*=",
            AssignOp::Div => "/=",
        }
    }
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, ty: None, span }
    }

    /// A node that is already typed, used for analyzer-built subtrees
    pub fn typed(kind: ExprKind, ty: TypeId, span: Span) -> Self {
        Self { kind, ty: Some(ty), span }
    }

    pub fn variable(name: &str, span: Span) -> Self {
        Self::new(ExprKind::Variable { name: name.to_string(), binding: None }, span)
    }

    /// Replace this node by the node built from it, keeping the span
    pub fn wrap(&mut self, ty: TypeId, build: impl FnOnce(Expr) -> ExprKind) {
        let span = self.span;
        let inner = std::mem::replace(self, Expr::new(ExprKind::Literal(Literal::Nil), span));
        *self = Expr::typed(build(inner), ty, span);
    }

    /// Wrap this node into a conversion to `target`
    pub fn cast_to(&mut self, target: TypeId) {
        self.wrap(target, |inner| ExprKind::Cast { target, expr: Box::new(inner) });
    }

    /// Turn a routine reference into a call without arguments. The new node
    /// is untyped until analyzed.
    pub fn make_call(&mut self) {
        let span = self.span;
        let callee = std::mem::replace(self, Expr::new(ExprKind::Literal(Literal::Nil), span));
        *self = Expr::new(ExprKind::Call { callee: Box::new(callee), args: Vec::new() }, span);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cast_to_wraps_in_place() {
        let span = Span::new(0, 1, 1, 1);
        let mut expr = Expr::typed(ExprKind::Literal(Literal::Int(1)), TypeId::INT, span);
        expr.cast_to(TypeId::DOUBLE);

        assert_eq!(expr.ty, Some(TypeId::DOUBLE));
        assert_eq!(expr.span, span);
        match expr.kind {
            ExprKind::Cast { target, expr: inner } => {
                assert_eq!(target, TypeId::DOUBLE);
                assert_eq!(inner.kind, ExprKind::Literal(Literal::Int(1)));
                assert_eq!(inner.ty, Some(TypeId::INT));
            }
            other => panic!("expected cast, got {:?}", other),
        }
    }
}
