//! Type System
//!
//! Every type lives in a [`TypeArena`] and is referred to by a [`TypeId`].
//! Syntax tree nodes and symbols only hold ids, so mutually referential
//! declarations (`^Node` inside `Node`) never form ownership cycles.

use std::fmt::Write;

use crate::utils::{Error, Result, Span};

/// Index of a type inside the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(usize);

impl TypeId {
    pub const VOID: TypeId = TypeId(0);
    pub const INT: TypeId = TypeId(1);
    pub const DOUBLE: TypeId = TypeId(2);
    pub const CHAR: TypeId = TypeId(3);
    pub const BOOLEAN: TypeId = TypeId(4);
    pub const STRING: TypeId = TypeId(5);
    pub const PURE_POINTER: TypeId = TypeId(6);
}

/// Inclusive index range of one array dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bound {
    pub low: i64,
    pub high: i64,
}

impl Bound {
    pub fn new(low: i64, high: i64) -> Self {
        Self { low, high }
    }

    /// Number of elements in this dimension
    pub fn span(&self) -> i64 {
        self.checked_span().unwrap_or(i64::MAX)
    }

    /// `None` when the element count does not fit in an i64
    pub fn checked_span(&self) -> Option<i64> {
        Some(self.high.checked_sub(self.low)?.checked_add(1)?.max(0))
    }
}

/// How an argument is bound to a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassSpec {
    Value,
    Var,
    Const,
    Out,
}

impl PassSpec {
    /// Whether the caller passes the argument's address
    pub fn by_reference(&self) -> bool {
        matches!(self, PassSpec::Var | PassSpec::Out)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: TypeId,
    pub spec: PassSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: TypeId,
}

/// The closed set of type variants
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Void,
    Int,
    Double,
    Char,
    Boolean,
    String,
    PurePointer,
    TypedPointer(TypeId),
    StaticArray { elem: TypeId, bounds: Vec<Bound> },
    OpenArray(TypeId),
    /// Fields in declaration order; `name` is None for anonymous records
    Record { name: Option<String>, fields: Vec<Field> },
    FunctionSignature { params: Vec<Param>, ret: TypeId },
    Alias { name: String, target: TypeId },
    ForwardType { name: String, target: Option<TypeId> },
}

/// Owner of every type in a compilation unit
#[derive(Debug, Clone)]
pub struct TypeArena {
    types: Vec<Type>,
}

impl TypeArena {
    /// Create an arena holding the predefined types at their fixed ids
    pub fn new() -> Self {
        Self {
            types: vec![
                Type::Void,
                Type::Int,
                Type::Double,
                Type::Char,
                Type::Boolean,
                Type::String,
                Type::PurePointer,
            ],
        }
    }

    pub fn alloc(&mut self, ty: Type) -> TypeId {
        let id = TypeId(self.types.len());
        self.types.push(ty);
        id
    }

    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id.0]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Follow aliases and resolved forward types to the underlying type.
    /// An unresolved forward type resolves to itself.
    pub fn resolve(&self, mut id: TypeId) -> TypeId {
        loop {
            match self.get(id) {
                Type::Alias { target, .. } => id = *target,
                Type::ForwardType { target: Some(target), .. } => id = *target,
                _ => return id,
            }
        }
    }

    /// The underlying type variant, looking through aliases
    pub fn kind(&self, id: TypeId) -> &Type {
        self.get(self.resolve(id))
    }

    /// Link a forward type to its definition. A forward type can only be resolved once.
    pub fn resolve_forward(&mut self, forward: TypeId, definition: TypeId, span: Span) -> Result<()> {
        let resolved_def = self.resolve(definition);
        let def_is_forward = matches!(self.get(resolved_def), Type::ForwardType { .. });
        match &mut self.types[forward.0] {
            Type::ForwardType { name, target: Some(_) } => Err(Error::AlreadyDefined {
                name: name.clone(),
                span,
            }),
            Type::ForwardType { name, .. } if def_is_forward || resolved_def == forward => {
                Err(Error::ForwardUnresolved { name: name.clone(), span })
            }
            Type::ForwardType { target, .. } => {
                *target = Some(definition);
                Ok(())
            }
            other => Err(Error::InternalInvariant(format!(
                "resolving a non-forward type {:?}",
                other
            ))),
        }
    }

    /// Whether `id` is a forward type that has not been linked yet
    pub fn is_unresolved_forward(&self, id: TypeId) -> bool {
        matches!(self.get(self.resolve(id)), Type::ForwardType { target: None, .. })
    }

    // ==================== Predicates ====================

    pub fn is_int(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::Int)
    }

    pub fn is_double(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::Double)
    }

    pub fn is_char(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::Char)
    }

    pub fn is_bool(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::Boolean)
    }

    pub fn is_string(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::String)
    }

    pub fn is_void(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::Void)
    }

    /// Either pointer flavour
    pub fn is_pointer(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::PurePointer | Type::TypedPointer(_))
    }

    pub fn is_pure_pointer(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::PurePointer)
    }

    pub fn is_typed_pointer(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::TypedPointer(_))
    }

    pub fn is_procedure_type(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::FunctionSignature { .. })
    }

    pub fn is_static_array(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::StaticArray { .. })
    }

    pub fn is_open_array(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::OpenArray(_))
    }

    pub fn is_record(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::Record { .. })
    }

    /// Values that do not fit a single 8-byte slot
    pub fn is_aggregate(&self, id: TypeId) -> bool {
        matches!(self.kind(id), Type::StaticArray { .. } | Type::Record { .. })
    }

    /// Pointee of a typed pointer
    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        match self.kind(id) {
            Type::TypedPointer(base) => Some(*base),
            _ => None,
        }
    }

    /// Parameter list and return type of a procedural type
    pub fn signature(&self, id: TypeId) -> Option<(&[Param], TypeId)> {
        match self.kind(id) {
            Type::FunctionSignature { params, ret } => Some((params.as_slice(), *ret)),
            _ => None,
        }
    }

    /// Look up a record field, returning its type and byte offset
    pub fn field(&self, record: TypeId, name: &str) -> Option<(TypeId, i64)> {
        let Type::Record { fields, .. } = self.kind(record) else {
            return None;
        };
        let mut offset = 0;
        for field in fields {
            if field.name == name {
                return Some((field.ty, offset));
            }
            offset += self.size(field.ty);
        }
        None
    }

    // ==================== Equality ====================

    /// Type equality with alias and forward transparency on both sides.
    /// Records compare by declared name, anonymous records by identity.
    pub fn equals(&self, a: TypeId, b: TypeId) -> bool {
        let a = self.resolve(a);
        let b = self.resolve(b);
        if a == b {
            return true;
        }
        match (self.get(a), self.get(b)) {
            (Type::Void, Type::Void)
            | (Type::Int, Type::Int)
            | (Type::Double, Type::Double)
            | (Type::Char, Type::Char)
            | (Type::Boolean, Type::Boolean)
            | (Type::String, Type::String)
            | (Type::PurePointer, Type::PurePointer) => true,
            (Type::TypedPointer(x), Type::TypedPointer(y)) => self.equals(*x, *y),
            (
                Type::StaticArray { elem: ea, bounds: ba },
                Type::StaticArray { elem: eb, bounds: bb },
            ) => ba == bb && self.equals(*ea, *eb),
            (Type::OpenArray(x), Type::OpenArray(y)) => self.equals(*x, *y),
            (Type::Record { name: Some(x), .. }, Type::Record { name: Some(y), .. }) => x == y,
            (
                Type::FunctionSignature { params: pa, ret: ra },
                Type::FunctionSignature { params: pb, ret: rb },
            ) => {
                pa.len() == pb.len()
                    && pa
                        .iter()
                        .zip(pb)
                        .all(|(x, y)| x.spec == y.spec && self.equals(x.ty, y.ty))
                    && self.equals(*ra, *rb)
            }
            _ => false,
        }
    }

    /// `equals`, relaxed so that an open array parameter accepts a static array
    /// of matching rank and element type
    pub fn equals_for_argument(&self, param: TypeId, arg: TypeId) -> bool {
        match (self.kind(param), self.kind(arg)) {
            (Type::OpenArray(pe), Type::StaticArray { elem, bounds }) => {
                self.open_array_accepts(*pe, *elem, &bounds[1..])
            }
            (Type::OpenArray(pe), Type::OpenArray(ae)) => self.equals_for_argument(*pe, *ae),
            _ => self.equals(param, arg),
        }
    }

    /// Match what remains of an open array parameter against a static array
    /// with some bound levels already stripped
    fn open_array_accepts(&self, param: TypeId, elem: TypeId, bounds: &[Bound]) -> bool {
        if bounds.is_empty() {
            return self.equals_for_argument(param, elem);
        }
        match self.kind(param) {
            Type::OpenArray(inner) => self.open_array_accepts(*inner, elem, &bounds[1..]),
            Type::StaticArray { elem: pe, bounds: pb } => {
                pb.as_slice() == bounds && self.equals(*pe, elem)
            }
            _ => false,
        }
    }

    // ==================== Layout ====================

    /// Byte size used for memory layout. Types are checked with
    /// [`TypeArena::checked_size`] when declared, so this never saturates in practice.
    pub fn size(&self, id: TypeId) -> i64 {
        self.checked_size(id).unwrap_or(i64::MAX)
    }

    /// Byte size, or `None` when it overflows an i64
    pub fn checked_size(&self, id: TypeId) -> Option<i64> {
        match self.kind(id) {
            Type::Void | Type::String | Type::OpenArray(_) => Some(0),
            Type::ForwardType { .. } => Some(0),
            Type::Int
            | Type::Double
            | Type::Char
            | Type::Boolean
            | Type::PurePointer
            | Type::TypedPointer(_)
            | Type::FunctionSignature { .. } => Some(8),
            Type::StaticArray { elem, bounds } => bounds
                .iter()
                .try_fold(self.checked_size(*elem)?, |size, bound| {
                    size.checked_mul(bound.checked_span()?)
                }),
            Type::Record { fields, .. } => fields
                .iter()
                .try_fold(0i64, |size, f| size.checked_add(self.checked_size(f.ty)?)),
            Type::Alias { .. } => Some(0),
        }
    }

    /// Bytes a value of this type occupies on the operand stack
    pub fn slot_size(&self, id: TypeId) -> i64 {
        if self.is_aggregate(id) {
            self.size(id)
        } else if self.is_void(id) {
            0
        } else {
            8
        }
    }

    // ==================== Display ====================

    /// Human-readable type name used in diagnostics
    pub fn name(&self, id: TypeId) -> String {
        match self.get(id) {
            Type::Void => "void".to_string(),
            Type::Int => "integer".to_string(),
            Type::Double => "double".to_string(),
            Type::Char => "char".to_string(),
            Type::Boolean => "boolean".to_string(),
            Type::String => "string".to_string(),
            Type::PurePointer => "pointer".to_string(),
            Type::TypedPointer(base) => format!("^{}", self.name(*base)),
            Type::StaticArray { elem, bounds } => {
                let mut out = String::from("array[");
                for (i, b) in bounds.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{}..{}", b.low, b.high);
                }
                let _ = write!(out, "] of {}", self.name(*elem));
                out
            }
            Type::OpenArray(elem) => format!("array of {}", self.name(*elem)),
            Type::Record { name: Some(name), .. } => name.clone(),
            Type::Record { name: None, .. } => "record".to_string(),
            Type::FunctionSignature { params, ret } => {
                let params: Vec<String> = params.iter().map(|p| self.name(p.ty)).collect();
                if matches!(self.kind(*ret), Type::Void) {
                    format!("procedure({})", params.join(", "))
                } else {
                    format!("function({}): {}", params.join(", "), self.name(*ret))
                }
            }
            Type::Alias { name, .. } | Type::ForwardType { name, .. } => name.clone(),
        }
    }
}

impl Default for TypeArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn int_array(arena: &mut TypeArena, bounds: Vec<Bound>) -> TypeId {
        arena.alloc(Type::StaticArray { elem: TypeId::INT, bounds })
    }

    #[test]
    fn test_alias_transparency() {
        let mut arena = TypeArena::new();
        let alias = arena.alloc(Type::Alias { name: "t".into(), target: TypeId::INT });
        assert!(arena.equals(alias, TypeId::INT));
        assert!(arena.equals(TypeId::INT, alias));
        assert!(arena.is_int(alias));
        assert!(!arena.equals(alias, TypeId::DOUBLE));
    }

    #[test]
    fn test_static_array_equality_needs_equal_bounds() {
        let mut arena = TypeArena::new();
        let a = int_array(&mut arena, vec![Bound::new(1, 10)]);
        let b = int_array(&mut arena, vec![Bound::new(1, 10)]);
        let c = int_array(&mut arena, vec![Bound::new(0, 9)]);
        assert!(arena.equals(a, b));
        assert!(!arena.equals(a, c));
    }

    #[test]
    fn test_record_equality() {
        let mut arena = TypeArena::new();
        let fields = vec![Field { name: "x".into(), ty: TypeId::INT }];
        let named_a = arena.alloc(Type::Record { name: Some("p".into()), fields: fields.clone() });
        let named_b = arena.alloc(Type::Record { name: Some("p".into()), fields: fields.clone() });
        let anon_a = arena.alloc(Type::Record { name: None, fields: fields.clone() });
        let anon_b = arena.alloc(Type::Record { name: None, fields });
        assert!(arena.equals(named_a, named_b));
        assert!(arena.equals(anon_a, anon_a));
        assert!(!arena.equals(anon_a, anon_b));
    }

    #[test]
    fn test_sizes() {
        let mut arena = TypeArena::new();
        let matrix = int_array(&mut arena, vec![Bound::new(1, 3), Bound::new(0, 4)]);
        let record = arena.alloc(Type::Record {
            name: None,
            fields: vec![
                Field { name: "a".into(), ty: TypeId::CHAR },
                Field { name: "m".into(), ty: matrix },
            ],
        });
        let open = arena.alloc(Type::OpenArray(TypeId::INT));
        assert_eq!(arena.size(TypeId::VOID), 0);
        assert_eq!(arena.size(TypeId::DOUBLE), 8);
        assert_eq!(arena.size(matrix), 3 * 5 * 8);
        assert_eq!(arena.size(record), 8 + 120);
        assert_eq!(arena.size(open), 0);
        assert_eq!(arena.field(record, "m"), Some((matrix, 8)));
    }

    #[test]
    fn test_open_array_accepts_static_array() {
        let mut arena = TypeArena::new();
        let vector = int_array(&mut arena, vec![Bound::new(1, 5)]);
        let matrix = int_array(&mut arena, vec![Bound::new(1, 2), Bound::new(1, 3)]);
        let open = arena.alloc(Type::OpenArray(TypeId::INT));
        let open2 = arena.alloc(Type::OpenArray(open));
        let open_double = arena.alloc(Type::OpenArray(TypeId::DOUBLE));

        assert!(arena.equals_for_argument(open, vector));
        assert!(arena.equals_for_argument(open2, matrix));
        assert!(!arena.equals_for_argument(open, matrix));
        assert!(!arena.equals_for_argument(open_double, vector));
        assert!(!arena.equals(open, vector));
    }

    #[test]
    fn test_forward_resolution_is_single_shot() {
        let mut arena = TypeArena::new();
        let fwd = arena.alloc(Type::ForwardType { name: "node".into(), target: None });
        let ptr = arena.alloc(Type::TypedPointer(fwd));
        assert!(arena.is_unresolved_forward(fwd));

        let record = arena.alloc(Type::Record {
            name: Some("node".into()),
            fields: vec![Field { name: "next".into(), ty: ptr }],
        });
        arena.resolve_forward(fwd, record, Span::dummy()).unwrap();
        assert!(arena.is_record(fwd));
        assert_eq!(arena.size(record), 8);

        let again = arena.resolve_forward(fwd, record, Span::dummy());
        assert!(matches!(again, Err(Error::AlreadyDefined { ref name, .. }) if name == "node"));
    }

    #[test]
    fn test_names() {
        let mut arena = TypeArena::new();
        let ptr = arena.alloc(Type::TypedPointer(TypeId::INT));
        let arr = int_array(&mut arena, vec![Bound::new(1, 10)]);
        assert_eq!(arena.name(ptr), "^integer");
        assert_eq!(arena.name(arr), "array[1..10] of integer");
    }
}
