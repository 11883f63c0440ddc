//! Mid-level Intermediate Representation (MIR)
//!
//! MIR is an SSA-form, CFG-based representation that sits between the typed
//! input tree and LLVM IR. Control flow is explicit: functions are lists of
//! basic blocks, each ending in exactly one terminator.
//!
//! # Structure
//!
//! - [`Module`]: functions plus struct/enum layout tables
//! - [`Function`]: basic blocks in CFG form, entry block first
//! - [`BasicBlock`]: instructions ending in a [`Terminator`]; a block is
//!   sealed once its terminator is set
//! - [`InstructionRecord`]: one [`Inst`] with its optional result value and
//!   source span
//!
//! # Value system
//!
//! Every SSA value is a `(id, type)` pair ([`Value`]); ids are unique within
//! their function and assigned in creation order, with id 0 reserved as
//! invalid. Each value is bound by exactly one definition; merge points use
//! phi instructions.
//!
//! Predecessors, reverse post-order, and the dominator tree are computed
//! lazily and cached under a version counter that mutating operations bump.

pub mod async_lowering;
pub mod bce;
pub mod checks;
pub mod escape;
pub mod ipo;
pub mod loops;
mod lower;
pub mod optimize;
mod printer;
pub mod rvo;
pub mod types;
pub mod vectorize;

pub use lower::Builder;
pub use optimize::{FunctionPass, ModulePass, OptLevel, OptimizationStats, PassManager};
pub use printer::print_module;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;

use crate::tir::Span;
use types::{Type, TypeRef};

/// SSA value identifier, unique within its defining function
pub type ValueId = u32;

/// Basic block identifier, unique within its function
pub type BlockId = u32;

/// Reserved invalid value id
pub const INVALID_VALUE: ValueId = 0;

/// An SSA value: id plus its type
#[derive(Debug, Clone)]
pub struct Value {
    pub id: ValueId,
    pub ty: TypeRef,
}

impl Value {
    pub fn new(id: ValueId, ty: TypeRef) -> Self {
        Self { id, ty }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Value {}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

/// Cast kinds, resolved from source/target types at lowering time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastKind {
    SignExtend,
    ZeroExtend,
    Truncate,
    FloatExtend,
    FloatTruncate,
    FloatToInt,
    IntToFloat,
    IntToPtr,
    PtrToInt,
    Bitcast,
}

/// Atomic memory orderings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOrdering {
    Monotonic,
    Acquire,
    Release,
    AcqRel,
    SeqCst,
}

/// Atomic read-modify-write operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RmwOp {
    Xchg,
    Add,
    Sub,
    And,
    Nand,
    Or,
    Xor,
    Max,
    Min,
    UMax,
    UMin,
}

/// Bounds information attached to element-pointer computations.
///
/// Index GEPs start with `needs_check = true`; bounds-check elimination
/// clears the flag when the index range is provably in bounds and sets
/// `assume_in_range` so the back-end can emit an assume predicate.
#[derive(Debug, Clone, Default)]
pub struct BoundsInfo {
    pub needs_check: bool,
    /// Static element count of the indexed array, when known
    pub known_size: Option<u64>,
    pub assume_in_range: bool,
}

impl BoundsInfo {
    pub fn checked(known_size: Option<u64>) -> Self {
        Self {
            needs_check: true,
            known_size,
            assume_in_range: false,
        }
    }

    /// For field projections with a constant, type-verified index
    pub fn unchecked() -> Self {
        Self::default()
    }
}

/// MIR instruction (non-terminating)
#[derive(Debug, Clone)]
pub enum Inst {
    Binary {
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    Unary {
        op: UnaryOp,
        operand: Value,
    },
    /// Stack allocation; yields a pointer to `ty`
    Alloca {
        ty: TypeRef,
        name: String,
    },
    Load {
        ptr: Value,
        volatile: bool,
    },
    Store {
        ptr: Value,
        value: Value,
        volatile: bool,
    },
    /// Element pointer computation with attached bounds info
    GetElementPtr {
        base: Value,
        indices: SmallVec<[Value; 2]>,
        bounds: BoundsInfo,
    },
    ExtractValue {
        agg: Value,
        indices: SmallVec<[u32; 2]>,
    },
    InsertValue {
        agg: Value,
        value: Value,
        indices: SmallVec<[u32; 2]>,
    },
    /// Struct value with fields in declaration order
    StructInit {
        name: String,
        fields: Vec<Value>,
    },
    TupleInit {
        elems: Vec<Value>,
    },
    ArrayInit {
        element_ty: TypeRef,
        elems: Vec<Value>,
    },
    /// Enum value: discriminant slot 0, payload slots 1..N
    EnumInit {
        name: String,
        variant: u32,
        payload: Vec<Value>,
    },
    /// Direct call; an empty callee name is an indirect call through the
    /// first argument
    Call {
        callee: String,
        args: Vec<Value>,
    },
    /// Method call carrying the concrete receiver type name
    MethodCall {
        receiver: Value,
        type_name: String,
        method: String,
        args: Vec<Value>,
    },
    Select {
        cond: Value,
        then_value: Value,
        else_value: Value,
    },
    Cast {
        kind: CastKind,
        operand: Value,
        target: TypeRef,
    },
    /// SSA merge: incoming value per predecessor block
    Phi {
        incomings: SmallVec<[(Value, BlockId); 2]>,
    },
    ConstInt {
        value: i128,
        bits: u8,
        signed: bool,
    },
    ConstFloat {
        value: f64,
        is_f64: bool,
    },
    ConstBool {
        value: bool,
    },
    ConstString {
        value: String,
    },
    ConstUnit,
    AtomicLoad {
        ptr: Value,
        ordering: AtomicOrdering,
    },
    AtomicStore {
        ptr: Value,
        value: Value,
        ordering: AtomicOrdering,
    },
    AtomicRmw {
        op: RmwOp,
        ptr: Value,
        value: Value,
        ordering: AtomicOrdering,
    },
    AtomicCmpXchg {
        ptr: Value,
        expected: Value,
        new: Value,
        ordering: AtomicOrdering,
    },
    Fence {
        ordering: AtomicOrdering,
    },
    /// Suspension marker; `poll_value` has type `Poll[T]`. Turned into
    /// state-machine control flow by async lowering.
    Await {
        poll_value: Value,
        suspension_id: u32,
    },
    ClosureInit {
        func_name: String,
        captures: Vec<Value>,
    },
}

impl Inst {
    /// Stable variant discriminator used by fingerprinting
    pub fn discriminant(&self) -> u32 {
        match self {
            Inst::Binary { .. } => 0,
            Inst::Unary { .. } => 1,
            Inst::Alloca { .. } => 2,
            Inst::Load { .. } => 3,
            Inst::Store { .. } => 4,
            Inst::GetElementPtr { .. } => 5,
            Inst::ExtractValue { .. } => 6,
            Inst::InsertValue { .. } => 7,
            Inst::StructInit { .. } => 8,
            Inst::TupleInit { .. } => 9,
            Inst::ArrayInit { .. } => 10,
            Inst::EnumInit { .. } => 11,
            Inst::Call { .. } => 12,
            Inst::MethodCall { .. } => 13,
            Inst::Select { .. } => 14,
            Inst::Cast { .. } => 15,
            Inst::Phi { .. } => 16,
            Inst::ConstInt { .. } => 17,
            Inst::ConstFloat { .. } => 18,
            Inst::ConstBool { .. } => 19,
            Inst::ConstString { .. } => 20,
            Inst::ConstUnit => 21,
            Inst::AtomicLoad { .. } => 22,
            Inst::AtomicStore { .. } => 23,
            Inst::AtomicRmw { .. } => 24,
            Inst::AtomicCmpXchg { .. } => 25,
            Inst::Fence { .. } => 26,
            Inst::Await { .. } => 27,
            Inst::ClosureInit { .. } => 28,
        }
    }

    /// Visit every value operand
    pub fn for_each_operand(&self, mut f: impl FnMut(&Value)) {
        match self {
            Inst::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Inst::Unary { operand, .. } => f(operand),
            Inst::Alloca { .. } => {}
            Inst::Load { ptr, .. } => f(ptr),
            Inst::Store { ptr, value, .. } => {
                f(ptr);
                f(value);
            }
            Inst::GetElementPtr { base, indices, .. } => {
                f(base);
                for idx in indices {
                    f(idx);
                }
            }
            Inst::ExtractValue { agg, .. } => f(agg),
            Inst::InsertValue { agg, value, .. } => {
                f(agg);
                f(value);
            }
            Inst::StructInit { fields, .. } => {
                for field in fields {
                    f(field);
                }
            }
            Inst::TupleInit { elems } | Inst::ArrayInit { elems, .. } => {
                for elem in elems {
                    f(elem);
                }
            }
            Inst::EnumInit { payload, .. } => {
                for value in payload {
                    f(value);
                }
            }
            Inst::Call { args, .. } => {
                for arg in args {
                    f(arg);
                }
            }
            Inst::MethodCall { receiver, args, .. } => {
                f(receiver);
                for arg in args {
                    f(arg);
                }
            }
            Inst::Select {
                cond,
                then_value,
                else_value,
            } => {
                f(cond);
                f(then_value);
                f(else_value);
            }
            Inst::Cast { operand, .. } => f(operand),
            Inst::Phi { incomings } => {
                for (value, _) in incomings {
                    f(value);
                }
            }
            Inst::ConstInt { .. }
            | Inst::ConstFloat { .. }
            | Inst::ConstBool { .. }
            | Inst::ConstString { .. }
            | Inst::ConstUnit
            | Inst::Fence { .. } => {}
            Inst::AtomicLoad { ptr, .. } => f(ptr),
            Inst::AtomicStore { ptr, value, .. } | Inst::AtomicRmw { ptr, value, .. } => {
                f(ptr);
                f(value);
            }
            Inst::AtomicCmpXchg {
                ptr,
                expected,
                new,
                ..
            } => {
                f(ptr);
                f(expected);
                f(new);
            }
            Inst::Await { poll_value, .. } => f(poll_value),
            Inst::ClosureInit { captures, .. } => {
                for capture in captures {
                    f(capture);
                }
            }
        }
    }

    /// Visit every value operand mutably (used by rewriting passes)
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Inst::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Inst::Unary { operand, .. } => f(operand),
            Inst::Alloca { .. } => {}
            Inst::Load { ptr, .. } => f(ptr),
            Inst::Store { ptr, value, .. } => {
                f(ptr);
                f(value);
            }
            Inst::GetElementPtr { base, indices, .. } => {
                f(base);
                for idx in indices {
                    f(idx);
                }
            }
            Inst::ExtractValue { agg, .. } => f(agg),
            Inst::InsertValue { agg, value, .. } => {
                f(agg);
                f(value);
            }
            Inst::StructInit { fields, .. } => {
                for field in fields {
                    f(field);
                }
            }
            Inst::TupleInit { elems } | Inst::ArrayInit { elems, .. } => {
                for elem in elems {
                    f(elem);
                }
            }
            Inst::EnumInit { payload, .. } => {
                for value in payload {
                    f(value);
                }
            }
            Inst::Call { args, .. } => {
                for arg in args {
                    f(arg);
                }
            }
            Inst::MethodCall { receiver, args, .. } => {
                f(receiver);
                for arg in args {
                    f(arg);
                }
            }
            Inst::Select {
                cond,
                then_value,
                else_value,
            } => {
                f(cond);
                f(then_value);
                f(else_value);
            }
            Inst::Cast { operand, .. } => f(operand),
            Inst::Phi { incomings } => {
                for (value, _) in incomings {
                    f(value);
                }
            }
            Inst::ConstInt { .. }
            | Inst::ConstFloat { .. }
            | Inst::ConstBool { .. }
            | Inst::ConstString { .. }
            | Inst::ConstUnit
            | Inst::Fence { .. } => {}
            Inst::AtomicLoad { ptr, .. } => f(ptr),
            Inst::AtomicStore { ptr, value, .. } | Inst::AtomicRmw { ptr, value, .. } => {
                f(ptr);
                f(value);
            }
            Inst::AtomicCmpXchg {
                ptr,
                expected,
                new,
                ..
            } => {
                f(ptr);
                f(expected);
                f(new);
            }
            Inst::Await { poll_value, .. } => f(poll_value),
            Inst::ClosureInit { captures, .. } => {
                for capture in captures {
                    f(capture);
                }
            }
        }
    }

    /// True when removing an unused result would change program behavior
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Inst::Store { .. }
                | Inst::Call { .. }
                | Inst::MethodCall { .. }
                | Inst::AtomicLoad { .. }
                | Inst::AtomicStore { .. }
                | Inst::AtomicRmw { .. }
                | Inst::AtomicCmpXchg { .. }
                | Inst::Fence { .. }
                | Inst::Await { .. }
        ) || matches!(self, Inst::Load { volatile: true, .. })
    }

    /// Callee name for direct calls
    pub fn callee(&self) -> Option<&str> {
        match self {
            Inst::Call { callee, .. } if !callee.is_empty() => Some(callee),
            _ => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(
            self,
            Inst::ConstInt { .. }
                | Inst::ConstFloat { .. }
                | Inst::ConstBool { .. }
                | Inst::ConstString { .. }
                | Inst::ConstUnit
        )
    }
}

/// One instruction with its optional result and source span
#[derive(Debug, Clone)]
pub struct InstructionRecord {
    pub inst: Inst,
    pub result: Option<Value>,
    pub span: Span,
}

impl InstructionRecord {
    pub fn new(inst: Inst, result: Option<Value>, span: Span) -> Self {
        Self { inst, result, span }
    }

    pub fn result_id(&self) -> Option<ValueId> {
        self.result.as_ref().map(|v| v.id)
    }
}

/// Block terminator (control flow)
#[derive(Debug, Clone)]
pub enum Terminator {
    Return(Option<Value>),
    Branch(BlockId),
    CondBranch {
        cond: Value,
        then_block: BlockId,
        else_block: BlockId,
    },
    Switch {
        disc: Value,
        cases: Vec<(i64, BlockId)>,
        default: BlockId,
    },
    Unreachable,
}

impl Terminator {
    /// Stable variant discriminator used by fingerprinting
    pub fn discriminant(&self) -> u32 {
        match self {
            Terminator::Return(_) => 0,
            Terminator::Branch(_) => 1,
            Terminator::CondBranch { .. } => 2,
            Terminator::Switch { .. } => 3,
            Terminator::Unreachable => 4,
        }
    }

    /// Successor block ids in case order
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            Terminator::Return(_) | Terminator::Unreachable => SmallVec::new(),
            Terminator::Branch(target) => SmallVec::from_slice(&[*target]),
            Terminator::CondBranch {
                then_block,
                else_block,
                ..
            } => SmallVec::from_slice(&[*then_block, *else_block]),
            Terminator::Switch { cases, default, .. } => {
                let mut succs: SmallVec<[BlockId; 2]> =
                    cases.iter().map(|(_, block)| *block).collect();
                succs.push(*default);
                succs
            }
        }
    }

    pub fn for_each_operand(&self, mut f: impl FnMut(&Value)) {
        match self {
            Terminator::Return(Some(value)) => f(value),
            Terminator::CondBranch { cond, .. } => f(cond),
            Terminator::Switch { disc, .. } => f(disc),
            _ => {}
        }
    }

    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Terminator::Return(Some(value)) => f(value),
            Terminator::CondBranch { cond, .. } => f(cond),
            Terminator::Switch { disc, .. } => f(disc),
            _ => {}
        }
    }
}

/// A basic block: instructions ending in exactly one terminator.
///
/// A block is sealed once its terminator is set; appending to a sealed
/// block is a programmer error.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub name: String,
    pub instructions: Vec<InstructionRecord>,
    pub terminator: Option<Terminator>,
}

impl BasicBlock {
    pub fn new(id: BlockId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            instructions: Vec::new(),
            terminator: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.terminator.is_some()
    }

    pub fn push(&mut self, record: InstructionRecord) {
        debug_assert!(
            !self.is_sealed(),
            "appending to sealed block {} ({})",
            self.id,
            self.name
        );
        if self.is_sealed() {
            return;
        }
        self.instructions.push(record);
    }
}

/// Inferred function attributes (see interprocedural attribute inference)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FnAttributes {
    pub pure: bool,
    pub nothrow: bool,
    pub readonly: bool,
    pub norecurse: bool,
    pub willreturn: bool,
    pub speculatable: bool,
    pub always_inline: bool,
}

impl FnAttributes {
    /// Bitmask encoding, stable across builds (fingerprint input)
    pub fn bits(&self) -> u32 {
        (self.pure as u32)
            | (self.nothrow as u32) << 1
            | (self.readonly as u32) << 2
            | (self.norecurse as u32) << 3
            | (self.willreturn as u32) << 4
            | (self.speculatable as u32) << 5
            | (self.always_inline as u32) << 6
    }

    /// Attribute names in declaration order, for IR emission and printing
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.pure {
            names.push("pure");
        }
        if self.nothrow {
            names.push("nothrow");
        }
        if self.readonly {
            names.push("readonly");
        }
        if self.norecurse {
            names.push("norecurse");
        }
        if self.willreturn {
            names.push("willreturn");
        }
        if self.speculatable {
            names.push("speculatable");
        }
        if self.always_inline {
            names.push("alwaysinline");
        }
        names
    }
}

/// A function parameter with its pre-assigned SSA value id
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: TypeRef,
    pub value_id: ValueId,
}

/// Cached CFG analyses, keyed by the function version that computed them
#[derive(Debug, Default)]
struct AnalysisCache {
    version: u64,
    preds: HashMap<BlockId, Vec<BlockId>>,
    rpo: Vec<BlockId>,
    /// Immediate dominator per reachable block (entry maps to itself)
    idom: HashMap<BlockId, BlockId>,
}

/// A MIR function in CFG form; the first block is the entry block
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub ret_ty: TypeRef,
    /// Pre-sret return type, preserved so the back-end can emit the proper
    /// attribute after conversion
    pub original_ret_ty: Option<TypeRef>,
    pub blocks: Vec<BasicBlock>,
    pub attributes: FnAttributes,
    pub is_public: bool,
    pub is_async: bool,
    pub uses_sret: bool,
    /// Local earmarked by RVO as the named return value
    pub return_slot: Option<ValueId>,
    pub span: Span,
    next_value_id: ValueId,
    next_block_id: BlockId,
    version: Cell<u64>,
    cache: RefCell<AnalysisCache>,
}

impl Clone for Function {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            params: self.params.clone(),
            ret_ty: self.ret_ty.clone(),
            original_ret_ty: self.original_ret_ty.clone(),
            blocks: self.blocks.clone(),
            attributes: self.attributes,
            is_public: self.is_public,
            is_async: self.is_async,
            uses_sret: self.uses_sret,
            return_slot: self.return_slot,
            span: self.span,
            next_value_id: self.next_value_id,
            next_block_id: self.next_block_id,
            version: Cell::new(0),
            cache: RefCell::new(AnalysisCache::default()),
        }
    }
}

impl Function {
    /// Create a function; parameters receive value ids 1..=N
    pub fn new(
        name: impl Into<String>,
        params: Vec<(String, TypeRef)>,
        ret_ty: TypeRef,
        span: Span,
    ) -> Self {
        let mut next_value_id: ValueId = 1;
        let params = params
            .into_iter()
            .map(|(name, ty)| {
                let value_id = next_value_id;
                next_value_id += 1;
                Param {
                    name,
                    ty,
                    value_id,
                }
            })
            .collect();

        Self {
            name: name.into(),
            params,
            ret_ty,
            original_ret_ty: None,
            blocks: Vec::new(),
            attributes: FnAttributes::default(),
            is_public: false,
            is_async: false,
            uses_sret: false,
            return_slot: None,
            span,
            next_value_id,
            next_block_id: 0,
            version: Cell::new(1),
            cache: RefCell::new(AnalysisCache::default()),
        }
    }

    /// Allocate a fresh SSA value of the given type
    pub fn fresh_value(&mut self, ty: TypeRef) -> Value {
        let id = self.next_value_id;
        self.next_value_id += 1;
        Value::new(id, ty)
    }

    pub fn next_value_id(&self) -> ValueId {
        self.next_value_id
    }

    /// Create a new (unsealed) block and return its id
    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = self.next_block_id;
        self.next_block_id += 1;
        self.blocks.push(BasicBlock::new(id, name));
        self.invalidate_analyses();
        id
    }

    pub fn entry_block(&self) -> Option<&BasicBlock> {
        self.blocks.first()
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.invalidate_analyses();
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    pub fn param_value(&self, index: usize) -> Option<Value> {
        self.params
            .get(index)
            .map(|p| Value::new(p.value_id, p.ty.clone()))
    }

    pub fn is_param(&self, id: ValueId) -> bool {
        self.params.iter().any(|p| p.value_id == id)
    }

    /// Append an instruction to a block; the block must not be sealed
    pub fn push_inst(&mut self, block: BlockId, record: InstructionRecord) {
        if let Some(b) = self.block_mut(block) {
            b.push(record);
        } else {
            debug_assert!(false, "unknown block {block}");
        }
    }

    /// Seal a block with its terminator
    pub fn set_terminator(&mut self, block: BlockId, term: Terminator) {
        if let Some(b) = self.block_mut(block) {
            debug_assert!(!b.is_sealed(), "block {} terminated twice", b.name);
            if !b.is_sealed() {
                b.terminator = Some(term);
            }
        } else {
            debug_assert!(false, "unknown block {block}");
        }
    }

    /// Must be called by passes that mutate blocks through direct field
    /// access rather than the mutating methods here
    pub fn invalidate_analyses(&self) {
        self.version.set(self.version.get() + 1);
    }

    fn ensure_cache(&self) {
        let mut cache = self.cache.borrow_mut();
        if cache.version == self.version.get() && !cache.rpo.is_empty() {
            return;
        }

        let mut preds: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for block in &self.blocks {
            if let Some(term) = &block.terminator {
                for succ in term.successors() {
                    let entry = preds.entry(succ).or_default();
                    if !entry.contains(&block.id) {
                        entry.push(block.id);
                    }
                }
            }
        }

        // Reverse post-order from the entry block
        let mut rpo = Vec::new();
        if let Some(entry) = self.blocks.first() {
            let mut visited = HashSet::new();
            let mut post = Vec::new();
            // Iterative DFS carrying an explicit successor cursor
            let mut stack: Vec<(BlockId, usize)> = vec![(entry.id, 0)];
            visited.insert(entry.id);
            while let Some((id, cursor)) = stack.pop() {
                let succs = self
                    .block(id)
                    .and_then(|b| b.terminator.as_ref())
                    .map(|t| t.successors())
                    .unwrap_or_default();
                if cursor < succs.len() {
                    stack.push((id, cursor + 1));
                    let next = succs[cursor];
                    if visited.insert(next) {
                        stack.push((next, 0));
                    }
                } else {
                    post.push(id);
                }
            }
            rpo = post.into_iter().rev().collect();
        }

        // Iterative dominator computation over RPO (Cooper-Harvey-Kennedy)
        let rpo_index: HashMap<BlockId, usize> =
            rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
        if let Some(&entry) = rpo.first() {
            idom.insert(entry, entry);
            let mut changed = true;
            while changed {
                changed = false;
                for &block in rpo.iter().skip(1) {
                    let block_preds = preds.get(&block).cloned().unwrap_or_default();
                    let mut new_idom: Option<BlockId> = None;
                    for &pred in &block_preds {
                        if !idom.contains_key(&pred) {
                            continue; // unreachable or not yet processed
                        }
                        new_idom = Some(match new_idom {
                            None => pred,
                            Some(current) => {
                                Self::intersect(pred, current, &idom, &rpo_index)
                            }
                        });
                    }
                    if let Some(new_idom) = new_idom
                        && idom.get(&block) != Some(&new_idom)
                    {
                        idom.insert(block, new_idom);
                        changed = true;
                    }
                }
            }
        }

        *cache = AnalysisCache {
            version: self.version.get(),
            preds,
            rpo,
            idom,
        };
    }

    fn intersect(
        a: BlockId,
        b: BlockId,
        idom: &HashMap<BlockId, BlockId>,
        rpo_index: &HashMap<BlockId, usize>,
    ) -> BlockId {
        let mut finger_a = a;
        let mut finger_b = b;
        while finger_a != finger_b {
            while rpo_index[&finger_a] > rpo_index[&finger_b] {
                finger_a = idom[&finger_a];
            }
            while rpo_index[&finger_b] > rpo_index[&finger_a] {
                finger_b = idom[&finger_b];
            }
        }
        finger_a
    }

    /// Predecessor blocks, computed lazily from terminators
    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        self.ensure_cache();
        self.cache
            .borrow()
            .preds
            .get(&block)
            .cloned()
            .unwrap_or_default()
    }

    /// Blocks in reverse post-order from the entry
    pub fn reverse_post_order(&self) -> Vec<BlockId> {
        self.ensure_cache();
        self.cache.borrow().rpo.clone()
    }

    /// Block ids reachable from the entry block
    pub fn reachable_blocks(&self) -> HashSet<BlockId> {
        self.reverse_post_order().into_iter().collect()
    }

    pub fn immediate_dominator(&self, block: BlockId) -> Option<BlockId> {
        self.ensure_cache();
        let cache = self.cache.borrow();
        let idom = *cache.idom.get(&block)?;
        if idom == block { None } else { Some(idom) }
    }

    /// True when `a` dominates `b` (every path from entry to `b` passes
    /// through `a`); a block dominates itself
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        self.ensure_cache();
        let cache = self.cache.borrow();
        let mut current = b;
        loop {
            match cache.idom.get(&current) {
                Some(&idom) if idom == current => return false, // reached entry
                Some(&idom) => {
                    if idom == a {
                        return true;
                    }
                    current = idom;
                }
                None => return false,
            }
        }
    }

    /// Defining block and instruction index for each value id
    pub fn definitions(&self) -> HashMap<ValueId, (BlockId, usize)> {
        let mut defs = HashMap::new();
        for block in &self.blocks {
            for (i, record) in block.instructions.iter().enumerate() {
                if let Some(id) = record.result_id() {
                    defs.insert(id, (block.id, i));
                }
            }
        }
        defs
    }

    /// Check the structural invariants; returns a description of the first
    /// violation found
    pub fn verify(&self) -> std::result::Result<(), String> {
        let reachable = self.reachable_blocks();

        // Every reachable block is terminated exactly once
        for block in &self.blocks {
            if reachable.contains(&block.id) && block.terminator.is_none() {
                return Err(format!(
                    "{}: reachable block `{}` has no terminator",
                    self.name, block.name
                ));
            }
        }

        // Single definition per value
        let mut defined: HashSet<ValueId> = self.params.iter().map(|p| p.value_id).collect();
        for block in &self.blocks {
            for record in &block.instructions {
                if let Some(id) = record.result_id() {
                    if id == INVALID_VALUE {
                        return Err(format!("{}: instruction defines value id 0", self.name));
                    }
                    if !defined.insert(id) {
                        return Err(format!("{}: value %{} defined twice", self.name, id));
                    }
                }
            }
        }

        // All uses refer to defined values
        let mut use_error = None;
        for block in &self.blocks {
            if !reachable.contains(&block.id) {
                continue;
            }
            let mut check = |value: &Value| {
                if !defined.contains(&value.id) && use_error.is_none() {
                    use_error = Some(format!(
                        "{}: block `{}` uses undefined value %{}",
                        self.name, block.name, value.id
                    ));
                }
            };
            for record in &block.instructions {
                record.inst.for_each_operand(&mut check);
            }
            if let Some(term) = &block.terminator {
                term.for_each_operand(&mut check);
            }
        }
        if let Some(err) = use_error {
            return Err(err);
        }

        // Phi discipline: incoming blocks equal the block's predecessors
        for block in &self.blocks {
            if !reachable.contains(&block.id) {
                continue;
            }
            let preds: HashSet<BlockId> = self.predecessors(block.id).into_iter().collect();
            for record in &block.instructions {
                if let Inst::Phi { incomings } = &record.inst {
                    let incoming_blocks: HashSet<BlockId> =
                        incomings.iter().map(|(_, b)| *b).collect();
                    if incoming_blocks != preds {
                        return Err(format!(
                            "{}: phi in `{}` has incoming blocks {:?}, predecessors are {:?}",
                            self.name, block.name, incoming_blocks, preds
                        ));
                    }
                    if let Some(result) = &record.result {
                        for (value, _) in incomings {
                            if value.ty != result.ty {
                                return Err(format!(
                                    "{}: phi in `{}` mixes types {} and {}",
                                    self.name, block.name, value.ty, result.ty
                                ));
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Struct layout as carried by the module
#[derive(Debug, Clone)]
pub struct StructLayout {
    pub name: String,
    pub fields: Vec<(String, TypeRef)>,
    pub has_drop: bool,
}

/// Enum layout: variant name plus payload types
#[derive(Debug, Clone)]
pub struct EnumLayout {
    pub name: String,
    pub variants: Vec<(String, Vec<TypeRef>)>,
    pub has_drop: bool,
}

/// A MIR module: functions plus the layouts the back-end needs
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub structs: Vec<StructLayout>,
    pub enums: Vec<EnumLayout>,
}

impl Default for Function {
    fn default() -> Self {
        Function::new("", Vec::new(), std::rc::Rc::new(Type::Unit), Span::default())
    }
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            structs: Vec::new(),
            enums: Vec::new(),
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.name == name)
    }

    pub fn struct_def(&self, name: &str) -> Option<&StructLayout> {
        self.structs.iter().find(|s| s.name == name)
    }

    pub fn enum_def(&self, name: &str) -> Option<&EnumLayout> {
        self.enums.iter().find(|e| e.name == name)
    }

    /// Size in bytes of a type, resolving nominal layouts through this
    /// module's tables. Enums are a u64 discriminant plus the largest
    /// variant payload (minimum 8 bytes).
    pub fn size_of_type(&self, ty: &Type) -> u64 {
        match ty {
            Type::Struct { name, .. } => match self.struct_def(name) {
                Some(def) => {
                    let mut offset = 0u64;
                    for (_, field_ty) in &def.fields {
                        let align = field_ty.align_of();
                        offset = offset.next_multiple_of(align);
                        offset += self.size_of_type(field_ty);
                    }
                    offset.next_multiple_of(8).max(8)
                }
                None => ty.size_of(),
            },
            Type::Enum { name, .. } => match self.enum_def(name) {
                Some(def) => {
                    let payload = def
                        .variants
                        .iter()
                        .map(|(_, tys)| tys.iter().map(|t| self.size_of_type(t)).sum::<u64>())
                        .max()
                        .unwrap_or(0);
                    8 + payload.next_multiple_of(8).max(8)
                }
                None => ty.size_of(),
            },
            Type::Array { element, size } => self.size_of_type(element) * size,
            Type::Tuple(elems) => {
                let mut offset = 0u64;
                for elem in elems {
                    let align = elem.align_of();
                    offset = offset.next_multiple_of(align);
                    offset += self.size_of_type(elem);
                }
                offset.next_multiple_of(ty.align_of().max(1))
            }
            _ => ty.size_of(),
        }
    }

    /// Verify every function's structural invariants
    pub fn verify(&self) -> std::result::Result<(), String> {
        for func in &self.functions {
            func.verify()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn i64_ty() -> TypeRef {
        Rc::new(Type::I64)
    }

    fn bool_ty() -> TypeRef {
        Rc::new(Type::Bool)
    }

    /// entry -> (then | else) -> merge, with a phi at merge
    fn diamond() -> Function {
        let mut f = Function::new(
            "diamond",
            vec![("flag".to_string(), bool_ty())],
            i64_ty(),
            Span::default(),
        );
        let entry = f.add_block("entry");
        let then_b = f.add_block("then");
        let else_b = f.add_block("else");
        let merge = f.add_block("merge");

        let cond = f.param_value(0).unwrap();
        f.set_terminator(
            entry,
            Terminator::CondBranch {
                cond,
                then_block: then_b,
                else_block: else_b,
            },
        );

        let one = f.fresh_value(i64_ty());
        f.push_inst(
            then_b,
            InstructionRecord::new(
                Inst::ConstInt {
                    value: 1,
                    bits: 64,
                    signed: true,
                },
                Some(one.clone()),
                Span::default(),
            ),
        );
        f.set_terminator(then_b, Terminator::Branch(merge));

        let two = f.fresh_value(i64_ty());
        f.push_inst(
            else_b,
            InstructionRecord::new(
                Inst::ConstInt {
                    value: 2,
                    bits: 64,
                    signed: true,
                },
                Some(two.clone()),
                Span::default(),
            ),
        );
        f.set_terminator(else_b, Terminator::Branch(merge));

        let phi = f.fresh_value(i64_ty());
        f.push_inst(
            merge,
            InstructionRecord::new(
                Inst::Phi {
                    incomings: smallvec::smallvec![(one, then_b), (two, else_b)],
                },
                Some(phi.clone()),
                Span::default(),
            ),
        );
        f.set_terminator(merge, Terminator::Return(Some(phi)));
        f
    }

    #[test]
    fn test_diamond_verifies() {
        let f = diamond();
        assert!(f.verify().is_ok(), "{:?}", f.verify());
    }

    #[test]
    fn test_predecessors() {
        let f = diamond();
        let mut preds = f.predecessors(3);
        preds.sort_unstable();
        assert_eq!(preds, vec![1, 2]);
        assert!(f.predecessors(0).is_empty());
    }

    #[test]
    fn test_dominators() {
        let f = diamond();
        // entry dominates everything
        assert!(f.dominates(0, 1));
        assert!(f.dominates(0, 2));
        assert!(f.dominates(0, 3));
        // neither arm dominates the merge
        assert!(!f.dominates(1, 3));
        assert!(!f.dominates(2, 3));
        assert_eq!(f.immediate_dominator(3), Some(0));
    }

    #[test]
    fn test_reverse_post_order_starts_at_entry() {
        let f = diamond();
        let rpo = f.reverse_post_order();
        assert_eq!(rpo.first(), Some(&0));
        assert_eq!(rpo.last(), Some(&3));
        assert_eq!(rpo.len(), 4);
    }

    #[test]
    fn test_unterminated_reachable_block_fails_verify() {
        let mut f = Function::new("broken", vec![], i64_ty(), Span::default());
        let entry = f.add_block("entry");
        let next = f.add_block("next");
        f.set_terminator(entry, Terminator::Branch(next));
        // `next` never sealed
        assert!(f.verify().is_err());
    }

    #[test]
    fn test_phi_predecessor_mismatch_fails_verify() {
        let mut f = diamond();
        // Corrupt the phi: drop one incoming
        let merge = f.block_mut(3).unwrap();
        if let Inst::Phi { incomings } = &mut merge.instructions[0].inst {
            incomings.pop();
        }
        assert!(f.verify().is_err());
    }

    #[test]
    fn test_double_definition_fails_verify() {
        let mut f = Function::new("dup", vec![], i64_ty(), Span::default());
        let entry = f.add_block("entry");
        let v = f.fresh_value(i64_ty());
        for _ in 0..2 {
            f.push_inst(
                entry,
                InstructionRecord::new(
                    Inst::ConstInt {
                        value: 7,
                        bits: 64,
                        signed: true,
                    },
                    Some(v.clone()),
                    Span::default(),
                ),
            );
        }
        f.set_terminator(entry, Terminator::Return(Some(v)));
        assert!(f.verify().is_err());
    }

    #[test]
    fn test_module_enum_size() {
        let mut module = Module::new("test");
        module.enums.push(EnumLayout {
            name: "Maybe".to_string(),
            variants: vec![
                ("None".to_string(), vec![]),
                ("Some".to_string(), vec![i64_ty()]),
            ],
            has_drop: false,
        });
        let ty = Type::Enum {
            name: "Maybe".to_string(),
            type_args: vec![i64_ty()],
        };
        // 8-byte discriminant + 8-byte payload
        assert_eq!(module.size_of_type(&ty), 16);
    }
}
