//! Scope Stack
//!
//! Scopes live in an index-stable arena owned by the compilation unit; the
//! stack holds the ids of the scopes currently visible, innermost last.
//! Each scope keeps four independent namespaces: types, variables,
//! constants and functions.

use std::collections::HashMap;

use crate::types::{Param, PassSpec, Type, TypeArena, TypeId};
use crate::utils::{Error, Result, Span};

// ==================== Symbols ====================

/// Unique identifier for a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

impl ScopeId {
    /// The program-level scope
    pub const ROOT: ScopeId = ScopeId(0);
}

/// Where a variable is declared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Global,
    Local,
    Parameter(PassSpec),
    /// A function's result, named like the function
    Result,
}

/// Storage location of a variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    /// A `.bss` label
    Label(String),
    /// Offset from the frame pointer
    Frame(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub ty: TypeId,
    pub kind: VarKind,
    pub storage: Storage,
    pub span: Span,
}

/// Value of a folded constant expression
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Double(f64),
    Str(String),
    Bool(bool),
    Nil,
}

impl ConstValue {
    /// Type of the value; single-character strings are chars
    pub fn ty(&self) -> TypeId {
        match self {
            ConstValue::Int(_) => TypeId::INT,
            ConstValue::Double(_) => TypeId::DOUBLE,
            ConstValue::Str(s) if s.chars().count() == 1 => TypeId::CHAR,
            ConstValue::Str(_) => TypeId::STRING,
            ConstValue::Bool(_) => TypeId::BOOLEAN,
            ConstValue::Nil => TypeId::PURE_POINTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    pub name: String,
    pub value: ConstValue,
    pub ty: TypeId,
    /// `.data` label holding the value
    pub label: String,
    pub span: Span,
}

/// Built-in routines with bespoke argument rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Write,
    Writeln,
    Read,
    Readln,
    Trunc,
    Round,
    Succ,
    Prev,
    Chr,
    Ord,
    High,
    Low,
    Exit,
}

impl Builtin {
    pub const ALL: [Builtin; 13] = [
        Builtin::Write,
        Builtin::Writeln,
        Builtin::Read,
        Builtin::Readln,
        Builtin::Trunc,
        Builtin::Round,
        Builtin::Succ,
        Builtin::Prev,
        Builtin::Chr,
        Builtin::Ord,
        Builtin::High,
        Builtin::Low,
        Builtin::Exit,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::Write => "write",
            Builtin::Writeln => "writeln",
            Builtin::Read => "read",
            Builtin::Readln => "readln",
            Builtin::Trunc => "trunc",
            Builtin::Round => "round",
            Builtin::Succ => "succ",
            Builtin::Prev => "prev",
            Builtin::Chr => "chr",
            Builtin::Ord => "ord",
            Builtin::High => "high",
            Builtin::Low => "low",
            Builtin::Exit => "exit",
        }
    }

    /// Fixed signature for the built-ins that follow ordinary argument rules
    fn fixed_signature(&self) -> Option<(TypeId, TypeId)> {
        match self {
            Builtin::Trunc | Builtin::Round => Some((TypeId::DOUBLE, TypeId::INT)),
            Builtin::Succ | Builtin::Prev => Some((TypeId::INT, TypeId::INT)),
            Builtin::Chr => Some((TypeId::INT, TypeId::CHAR)),
            Builtin::Ord => Some((TypeId::CHAR, TypeId::INT)),
            _ => None,
        }
    }
}

/// A function or procedure symbol
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    /// `FunctionSignature` type; None for built-ins checked by bespoke rules
    pub signature: Option<TypeId>,
    pub builtin: Option<Builtin>,
    pub is_forward: bool,
    /// Scope of parameters and locals, once the body has been seen
    pub scope: Option<ScopeId>,
    /// Index of the body in `Program::routines`
    pub routine: Option<usize>,
    pub span: Span,
}

/// A symbol found by a lookup across all namespaces
#[derive(Debug, Clone, Copy)]
pub enum Symbol<'a> {
    Type(TypeId),
    Variable(&'a Variable),
    Constant(&'a Constant),
    Function(&'a Function),
}

/// A scope containing symbols
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub types: HashMap<String, TypeId>,
    pub variables: HashMap<String, Variable>,
    pub constants: HashMap<String, Constant>,
    pub functions: HashMap<String, Function>,
    /// Forward types declared here and not yet checked
    pending_forwards: Vec<(String, TypeId, Span)>,
    /// Bytes of locals allocated below the frame pointer
    pub frame_size: i64,
}

impl Scope {
    fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
            || self.variables.contains_key(name)
            || self.constants.contains_key(name)
            || self.functions.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<Symbol<'_>> {
        if let Some(f) = self.functions.get(name) {
            return Some(Symbol::Function(f));
        }
        if let Some(v) = self.variables.get(name) {
            return Some(Symbol::Variable(v));
        }
        if let Some(c) = self.constants.get(name) {
            return Some(Symbol::Constant(c));
        }
        self.types.get(name).map(|t| Symbol::Type(*t))
    }
}

// ==================== Scope Stack ====================

/// Stack of nested scopes with shadowing lookup
#[derive(Debug, Clone)]
pub struct ScopeStack {
    scopes: Vec<Scope>,
    frames: Vec<ScopeId>,
}

impl ScopeStack {
    /// Create a stack with an empty root scope entered
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::default()],
            frames: vec![ScopeId::ROOT],
        }
    }

    /// Create a stack whose root scope holds the predefined types and built-ins
    pub fn with_globals(types: &mut TypeArena) -> Self {
        let mut stack = Self::new();
        let root = stack.innermost_mut();
        for (name, ty) in [
            ("integer", TypeId::INT),
            ("double", TypeId::DOUBLE),
            ("char", TypeId::CHAR),
            ("boolean", TypeId::BOOLEAN),
            ("pointer", TypeId::PURE_POINTER),
        ] {
            root.types.insert(name.to_string(), ty);
        }
        for builtin in Builtin::ALL {
            let signature = builtin.fixed_signature().map(|(param, ret)| {
                types.alloc(Type::FunctionSignature {
                    params: vec![Param { name: "x".into(), ty: param, spec: PassSpec::Value }],
                    ret,
                })
            });
            root.functions.insert(
                builtin.name().to_string(),
                Function {
                    name: builtin.name().to_string(),
                    signature,
                    builtin: Some(builtin),
                    is_forward: false,
                    scope: None,
                    routine: None,
                    span: Span::dummy(),
                },
            );
        }
        stack
    }

    /// Allocate a new empty scope without entering it
    pub fn create_scope(&mut self) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope::default());
        id
    }

    /// Make `id` the innermost visible scope
    pub fn enter(&mut self, id: ScopeId) {
        self.frames.push(id);
    }

    /// Leave the innermost scope
    pub fn exit(&mut self) -> Option<ScopeId> {
        self.frames.pop()
    }

    /// Innermost visible scope
    pub fn current(&self) -> ScopeId {
        self.frames.last().copied().unwrap_or(ScopeId::ROOT)
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    fn innermost_mut(&mut self) -> &mut Scope {
        let id = self.current();
        &mut self.scopes[id.0]
    }

    fn innermost(&self) -> &Scope {
        self.scope(self.current())
    }

    /// Reserve `size` bytes of locals in the innermost scope and return the frame offset
    pub fn allocate_local(&mut self, size: i64) -> i64 {
        let scope = self.innermost_mut();
        scope.frame_size += size.max(8);
        -scope.frame_size
    }

    // ==================== Declarations ====================

    fn already_defined(name: &str, span: Span) -> Error {
        Error::AlreadyDefined { name: name.to_string(), span }
    }

    /// Declare a named type; a pending forward type of the same name is resolved to it
    pub fn declare_type(&mut self, types: &mut TypeArena, name: &str, ty: TypeId, span: Span) -> Result<()> {
        let scope = self.innermost_mut();
        if let Some(&existing) = scope.types.get(name) {
            if !matches!(types.get(existing), Type::ForwardType { .. }) {
                return Err(Self::already_defined(name, span));
            }
            types.resolve_forward(existing, ty, span)?;
            scope.types.insert(name.to_string(), ty);
            return Ok(());
        }
        if scope.contains(name) {
            return Err(Self::already_defined(name, span));
        }
        scope.types.insert(name.to_string(), ty);
        Ok(())
    }

    /// Declare a placeholder for a type referenced before its definition
    pub fn declare_forward_type(&mut self, types: &mut TypeArena, name: &str, span: Span) -> Result<TypeId> {
        let scope = self.innermost_mut();
        if scope.contains(name) {
            return Err(Self::already_defined(name, span));
        }
        let id = types.alloc(Type::ForwardType { name: name.to_string(), target: None });
        scope.types.insert(name.to_string(), id);
        scope.pending_forwards.push((name.to_string(), id, span));
        Ok(id)
    }

    /// Check that every forward type declared in the innermost scope has been resolved
    pub fn finish_type_section(&mut self, types: &TypeArena) -> Result<()> {
        let pending = std::mem::take(&mut self.innermost_mut().pending_forwards);
        for (name, id, span) in pending {
            if types.is_unresolved_forward(id) {
                return Err(Error::ForwardUnresolved { name, span });
            }
        }
        Ok(())
    }

    pub fn declare_variable(&mut self, var: Variable) -> Result<()> {
        let scope = self.innermost_mut();
        if scope.contains(&var.name) {
            return Err(Self::already_defined(&var.name, var.span));
        }
        scope.variables.insert(var.name.clone(), var);
        Ok(())
    }

    pub fn declare_constant(&mut self, constant: Constant) -> Result<()> {
        let scope = self.innermost_mut();
        if scope.contains(&constant.name) {
            return Err(Self::already_defined(&constant.name, constant.span));
        }
        scope.constants.insert(constant.name.clone(), constant);
        Ok(())
    }

    /// Declare a routine. A definition replaces a forward declaration with an
    /// equal signature.
    pub fn declare_function(&mut self, types: &TypeArena, function: Function) -> Result<()> {
        let scope = self.innermost_mut();
        if let Some(existing) = scope.functions.get(&function.name) {
            if !existing.is_forward || function.is_forward {
                return Err(Self::already_defined(&function.name, function.span));
            }
            let same = match (existing.signature, function.signature) {
                (Some(a), Some(b)) => types.equals(a, b),
                _ => false,
            };
            if !same {
                return Err(Error::ForwardUnresolved {
                    name: function.name.clone(),
                    span: function.span,
                });
            }
        } else if scope.contains(&function.name) {
            return Err(Self::already_defined(&function.name, function.span));
        }
        scope.functions.insert(function.name.clone(), function);
        Ok(())
    }

    /// Attach a parsed body to a declared routine
    pub fn set_routine(&mut self, name: &str, scope: ScopeId, routine: usize) {
        if let Some(function) = self.innermost_mut().functions.get_mut(name) {
            function.scope = Some(scope);
            function.routine = Some(routine);
        }
    }

    /// Check that every forward routine in the innermost scope received a body
    pub fn finish_routines(&self) -> Result<()> {
        let mut pending: Vec<&Function> = self
            .innermost()
            .functions
            .values()
            .filter(|f| f.is_forward)
            .collect();
        pending.sort_by_key(|f| f.span.start);
        match pending.first() {
            Some(f) => Err(Error::ForwardUnresolved { name: f.name.clone(), span: f.span }),
            None => Ok(()),
        }
    }

    // ==================== Lookup ====================

    /// Find a symbol in any namespace, innermost scope first
    pub fn lookup(&self, name: &str) -> Option<Symbol<'_>> {
        self.frames.iter().rev().find_map(|id| self.scope(*id).get(name))
    }

    pub fn lookup_type(&self, name: &str) -> Option<TypeId> {
        self.frames
            .iter()
            .rev()
            .find_map(|id| self.scope(*id).types.get(name).copied())
    }

    pub fn lookup_variable(&self, name: &str) -> Option<&Variable> {
        self.frames
            .iter()
            .rev()
            .find_map(|id| self.scope(*id).variables.get(name))
    }

    pub fn lookup_constant(&self, name: &str) -> Option<&Constant> {
        self.frames
            .iter()
            .rev()
            .find_map(|id| self.scope(*id).constants.get(name))
    }

    pub fn lookup_function(&self, name: &str) -> Option<&Function> {
        self.frames
            .iter()
            .rev()
            .find_map(|id| self.scope(*id).functions.get(name))
    }

    /// Every constant in every scope, ordered by label
    pub fn all_constants(&self) -> Vec<&Constant> {
        let mut constants: Vec<&Constant> =
            self.scopes.iter().flat_map(|s| s.constants.values()).collect();
        constants.sort_by(|a, b| a.label.cmp(&b.label));
        constants
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn var(name: &str, ty: TypeId, kind: VarKind) -> Variable {
        Variable {
            name: name.to_string(),
            ty,
            kind,
            storage: Storage::Frame(-8),
            span: Span::dummy(),
        }
    }

    fn function(types: &mut TypeArena, name: &str, ret: TypeId, is_forward: bool) -> Function {
        let signature = types.alloc(Type::FunctionSignature { params: vec![], ret });
        Function {
            name: name.to_string(),
            signature: Some(signature),
            builtin: None,
            is_forward,
            scope: None,
            routine: None,
            span: Span::dummy(),
        }
    }

    #[test]
    fn test_shadowing_lookup() {
        let mut types = TypeArena::new();
        let mut stack = ScopeStack::with_globals(&mut types);
        stack.declare_variable(var("x", TypeId::INT, VarKind::Global)).unwrap();

        let inner = stack.create_scope();
        stack.enter(inner);
        stack.declare_variable(var("x", TypeId::DOUBLE, VarKind::Local)).unwrap();
        assert_eq!(stack.lookup_variable("x").map(|v| v.ty), Some(TypeId::DOUBLE));
        assert_eq!(stack.lookup_type("integer"), Some(TypeId::INT));

        stack.exit();
        assert_eq!(stack.lookup_variable("x").map(|v| v.ty), Some(TypeId::INT));
    }

    #[test]
    fn test_duplicate_declaration() {
        let mut types = TypeArena::new();
        let mut stack = ScopeStack::with_globals(&mut types);
        stack.declare_variable(var("x", TypeId::INT, VarKind::Global)).unwrap();
        let err = stack.declare_variable(var("x", TypeId::INT, VarKind::Global));
        assert!(matches!(err, Err(Error::AlreadyDefined { .. })));
        let err = stack.declare_type(&mut types, "x", TypeId::INT, Span::dummy());
        assert!(matches!(err, Err(Error::AlreadyDefined { .. })));
    }

    #[test]
    fn test_forward_type_resolution() {
        let mut types = TypeArena::new();
        let mut stack = ScopeStack::with_globals(&mut types);
        let fwd = stack.declare_forward_type(&mut types, "node", Span::dummy()).unwrap();
        let record = types.alloc(Type::Record { name: Some("node".into()), fields: vec![] });

        stack.declare_type(&mut types, "node", record, Span::dummy()).unwrap();
        stack.finish_type_section(&types).unwrap();
        assert!(types.is_record(fwd));
        assert_eq!(stack.lookup_type("node"), Some(record));

        let again = stack.declare_type(&mut types, "node", record, Span::dummy());
        assert!(matches!(again, Err(Error::AlreadyDefined { .. })));
    }

    #[test]
    fn test_unresolved_forward_type() {
        let mut types = TypeArena::new();
        let mut stack = ScopeStack::with_globals(&mut types);
        stack.declare_forward_type(&mut types, "ghost", Span::dummy()).unwrap();
        let err = stack.finish_type_section(&types);
        assert!(matches!(err, Err(Error::ForwardUnresolved { ref name, .. }) if name == "ghost"));
    }

    #[test]
    fn test_forward_function() {
        let mut types = TypeArena::new();
        let mut stack = ScopeStack::with_globals(&mut types);
        let forward = function(&mut types, "f", TypeId::INT, true);
        stack.declare_function(&types, forward).unwrap();
        assert!(stack.finish_routines().is_err());

        let mismatched = function(&mut types, "f", TypeId::DOUBLE, false);
        let err = stack.declare_function(&types, mismatched);
        assert!(matches!(err, Err(Error::ForwardUnresolved { .. })));

        let definition = function(&mut types, "f", TypeId::INT, false);
        stack.declare_function(&types, definition).unwrap();
        assert!(stack.finish_routines().is_ok());

        let twice = function(&mut types, "f", TypeId::INT, false);
        assert!(matches!(
            stack.declare_function(&types, twice),
            Err(Error::AlreadyDefined { .. })
        ));
    }

    #[test]
    fn test_builtins_registered() {
        let mut types = TypeArena::new();
        let stack = ScopeStack::with_globals(&mut types);
        let chr = stack.lookup_function("chr").unwrap();
        assert_eq!(chr.builtin, Some(Builtin::Chr));
        let (params, ret) = types.signature(chr.signature.unwrap()).unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(ret, TypeId::CHAR);
        assert_eq!(stack.lookup_function("writeln").and_then(|f| f.signature), None);
    }

    #[test]
    fn test_local_allocation() {
        let mut stack = ScopeStack::new();
        let inner = stack.create_scope();
        stack.enter(inner);
        assert_eq!(stack.allocate_local(8), -8);
        assert_eq!(stack.allocate_local(80), -88);
        assert_eq!(stack.scope(inner).frame_size, 88);
    }
}
