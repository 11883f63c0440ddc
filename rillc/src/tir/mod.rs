//! Typed input tree (TIR)
//!
//! The contract between the front-end and the MIR builder. By the time a
//! module reaches this crate it has been type-checked, desugared,
//! trait-resolved, and monomorphized:
//!
//! - every expression carries a resolved type ([`Ty`]) and a source span;
//! - every method call names the concrete receiver type and method;
//! - every field access carries a resolved field index;
//! - every closure carries an explicit capture list with capture modes;
//! - every pattern has been checked for exhaustiveness where required.
//!
//! The tree round-trips through serde so the front-end can hand modules
//! over as JSON (this is also what the `rillc` driver reads).

use serde::{Deserialize, Serialize};

/// Byte span into the original source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Resolved type as the front-end reports it.
///
/// Structurally mirrors the MIR type model; the builder interns these into
/// shared [`crate::mir::types::TypeRef`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ty {
    Unit,
    Bool,
    I8,
    I16,
    I32,
    I64,
    I128,
    U8,
    U16,
    U32,
    U64,
    U128,
    F32,
    F64,
    /// Untyped pointer-sized value (FFI handles)
    Ptr,
    Str,
    Pointer {
        pointee: Box<Ty>,
        is_mut: bool,
    },
    Array {
        element: Box<Ty>,
        size: u64,
    },
    Slice {
        element: Box<Ty>,
    },
    Tuple(Vec<Ty>),
    Struct {
        name: String,
        type_args: Vec<Ty>,
    },
    Enum {
        name: String,
        type_args: Vec<Ty>,
    },
    Function {
        params: Vec<Ty>,
        ret: Box<Ty>,
    },
}

/// Binary operators (logical `And`/`Or` are short-circuiting and lowered
/// through control flow, not a single instruction)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

/// A typed module as produced by the front-end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub structs: Vec<StructDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enums: Vec<EnumDef>,
    pub functions: Vec<Function>,
}

/// Struct layout as resolved by the front-end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<Field>,
    /// True when the type defines a destructor (`<name>_drop`); the builder
    /// registers values of this type with the scope manager.
    #[serde(default)]
    pub has_drop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: Ty,
}

/// Enum layout: discriminant at slot 0, payload at slots 1..N
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumDef {
    pub name: String,
    pub variants: Vec<Variant>,
    #[serde(default)]
    pub has_drop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<Ty>,
}

/// A typed function definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub ret_ty: Ty,
    pub body: Block,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Ty,
    /// Mutable parameters get a stack slot in the prologue.
    #[serde(default)]
    pub mutable: bool,
}

/// A block of statements with an optional tail expression (the block's value)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stmts: Vec<Stmt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail: Option<Box<Expr>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Stmt {
    /// `let pattern = init` - immutable bindings stay pure SSA; `mutable`
    /// bindings get an alloca slot; `volatile` forces loads/stores to be
    /// marked volatile.
    Let {
        pattern: Pattern,
        init: Expr,
        #[serde(default)]
        mutable: bool,
        #[serde(default)]
        volatile: bool,
    },
    /// Assignment to a mutable binding, field, or index place
    Assign { target: Expr, value: Expr },
    /// Expression evaluated for effect
    Expr(Expr),
}

/// A typed expression: kind + resolved type + span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Ty,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExprKind {
    IntLit(i128),
    FloatLit(f64),
    BoolLit(bool),
    StrLit(String),
    UnitLit,
    /// Reference to a binding or parameter
    Var(String),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    /// Direct call to a resolved function; an empty callee name means an
    /// indirect call through the first argument.
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    /// Method call with the concrete receiver type resolved by the front-end
    MethodCall {
        receiver: Box<Expr>,
        type_name: String,
        method: String,
        args: Vec<Expr>,
    },
    /// Field access with resolved field index
    Field {
        base: Box<Expr>,
        index: u32,
    },
    /// Array/slice indexing (bounds-checked unless a pass proves it safe)
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    /// Struct literal with fields in declaration order
    StructLit {
        name: String,
        fields: Vec<Expr>,
    },
    TupleLit(Vec<Expr>),
    ArrayLit(Vec<Expr>),
    EnumLit {
        name: String,
        variant_index: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        payload: Vec<Expr>,
    },
    If {
        cond: Box<Expr>,
        then_block: Block,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        else_block: Option<Block>,
    },
    /// Pattern match; the front-end guarantees exhaustiveness
    When {
        scrutinee: Box<Expr>,
        arms: Vec<Arm>,
    },
    Loop {
        body: Block,
    },
    While {
        cond: Box<Expr>,
        body: Block,
    },
    /// `for pattern in iterable { body }` over arrays and slices
    For {
        pattern: Pattern,
        iterable: Box<Expr>,
        body: Block,
    },
    Break {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Box<Expr>>,
    },
    Continue,
    Return {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Box<Expr>>,
    },
    /// Explicit coercion; the cast kind is derived from source/target types
    Cast {
        operand: Box<Expr>,
    },
    /// Closure with explicit captures resolved by the front-end
    Closure {
        func_name: String,
        captures: Vec<Capture>,
    },
    /// `await e` where `e` evaluates to `Poll[T]`
    Await {
        operand: Box<Expr>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    pub name: String,
    #[serde(default)]
    pub by_ref: bool,
}

/// A match arm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arm {
    pub pattern: Pattern,
    pub body: Block,
}

/// Patterns; the front-end guarantees all alternatives of an or-pattern
/// bind the same names at the same types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Pattern {
    Wildcard,
    Binding(String),
    IntLit(i128),
    BoolLit(bool),
    Tuple(Vec<Pattern>),
    Struct {
        name: String,
        /// (resolved field index, sub-pattern)
        fields: Vec<(u32, Pattern)>,
    },
    Enum {
        name: String,
        variant_index: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        payload: Vec<Pattern>,
    },
    Or(Vec<Pattern>),
}

impl Pattern {
    /// True when matching this pattern never needs a runtime test
    pub fn is_irrefutable(&self) -> bool {
        match self {
            Pattern::Wildcard | Pattern::Binding(_) => true,
            Pattern::Tuple(elems) => elems.iter().all(Pattern::is_irrefutable),
            Pattern::Struct { fields, .. } => fields.iter().all(|(_, p)| p.is_irrefutable()),
            Pattern::IntLit(_) | Pattern::BoolLit(_) | Pattern::Enum { .. } => false,
            Pattern::Or(alts) => alts.iter().any(Pattern::is_irrefutable),
        }
    }
}

impl Expr {
    pub fn new(kind: ExprKind, ty: Ty, span: Span) -> Self {
        Self { kind, ty, span }
    }
}
