//! Bounds-check elimination
//!
//! Removes array bounds checks that interval analysis proves redundant.
//!
//! # Range sources
//!
//! 1. Literal constants
//! 2. Integer type bounds (an unsigned index is never negative)
//! 3. Loop induction variables: the indexed `for` shape gives `[start, bound-1]`
//! 4. Dominating comparisons: `if i < n { arr[i] }` narrows `i` on the true edge
//! 5. Phi joins, widened after a couple of refinements to guarantee termination
//!
//! Each eliminated check records which justification proved it; proven-safe
//! accesses additionally get an assume hint for the back-end.

use std::collections::HashMap;

use super::optimize::FunctionPass;
use super::{BinOp, BlockId, Function, Inst, Terminator, ValueId};

/// A conservative integer interval `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRange {
    pub min: i64,
    pub max: i64,
}

impl ValueRange {
    pub fn constant(value: i64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            min: i64::MIN,
            max: i64::MAX,
        }
    }

    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn is_constant(&self) -> bool {
        self.min == self.max
    }

    pub fn is_bounded(&self) -> bool {
        self.min != i64::MIN && self.max != i64::MAX
    }

    pub fn is_non_negative(&self) -> bool {
        self.min >= 0
    }

    /// Valid for indexing an array of `size` elements
    pub fn is_valid_index_for(&self, size: i64) -> bool {
        self.min >= 0 && self.max < size
    }

    pub fn intersect(&self, other: &ValueRange) -> ValueRange {
        ValueRange {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    pub fn union_with(&self, other: &ValueRange) -> ValueRange {
        ValueRange {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Statistics, split by the justification that proved each elimination
#[derive(Debug, Default, Clone)]
pub struct BceStats {
    pub total_accesses: usize,
    pub eliminated_checks: usize,
    pub loop_bounded: usize,
    pub constant_index: usize,
    pub dominated_check: usize,
    pub range_analysis: usize,
}

/// Loop bound of an induction variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundSource {
    Const(i64),
    /// Bounded by a runtime value (typically a `len` result)
    Value(ValueId),
}

/// An induction variable load bounded by the enclosing loop.
/// The bound only holds in blocks dominated by the guard's true edge.
#[derive(Debug, Clone)]
struct InductionRange {
    start: i64,
    bound: BoundSource,
    guard: BlockId,
}

/// Bounds-check elimination pass
pub struct BoundsCheckEliminationPass {
    stats: BceStats,
    ranges: HashMap<ValueId, ValueRange>,
    /// Loads of induction slots inside their guarded loop body
    induction: HashMap<ValueId, InductionRange>,
    /// `len` results (and slice length extracts) keyed by the value whose
    /// length they measure
    len_of: HashMap<ValueId, ValueId>,
    /// Defining block per value id
    def_block: HashMap<ValueId, BlockId>,
}

impl BoundsCheckEliminationPass {
    pub fn new() -> Self {
        Self {
            stats: BceStats::default(),
            ranges: HashMap::new(),
            induction: HashMap::new(),
            len_of: HashMap::new(),
            def_block: HashMap::new(),
        }
    }

    pub fn stats(&self) -> &BceStats {
        &self.stats
    }

    fn get_range(&self, func: &Function, value: ValueId) -> ValueRange {
        if let Some(range) = self.ranges.get(&value) {
            return *range;
        }
        // Fall back to the value's type bounds
        for block in &func.blocks {
            for record in &block.instructions {
                if record.result_id() == Some(value) {
                    if let Some(result) = &record.result
                        && let Some((min, max)) = result.ty.integer_bounds()
                    {
                        return ValueRange::new(min, max);
                    }
                    return ValueRange::unbounded();
                }
            }
        }
        for param in &func.params {
            if param.value_id == value {
                if let Some((min, max)) = param.ty.integer_bounds() {
                    return ValueRange::new(min, max);
                }
            }
        }
        ValueRange::unbounded()
    }

    // ============ Range Computation ============

    fn compute_value_ranges(&mut self, func: &Function) {
        self.ranges.clear();
        self.def_block.clear();

        for param in &func.params {
            if let Some((min, max)) = param.ty.integer_bounds() {
                self.ranges.insert(param.value_id, ValueRange::new(min, max));
            }
        }
        for block in &func.blocks {
            for record in &block.instructions {
                if let Some(id) = record.result_id() {
                    self.def_block.insert(id, block.id);
                }
            }
        }

        let rpo = func.reverse_post_order();
        let mut phi_visits: HashMap<ValueId, usize> = HashMap::new();

        for _ in 0..4 {
            let mut changed = false;
            for &block_id in &rpo {
                let Some(block) = func.block(block_id) else {
                    continue;
                };
                for record in &block.instructions {
                    let Some(result) = &record.result else {
                        continue;
                    };
                    let new_range = match &record.inst {
                        Inst::ConstInt { value, .. } => {
                            let clamped =
                                i64::try_from(*value).unwrap_or(if *value > 0 {
                                    i64::MAX
                                } else {
                                    i64::MIN
                                });
                            Some(ValueRange::constant(clamped))
                        }
                        Inst::Binary { op, lhs, rhs } if result.ty.is_integer() => {
                            let left = self.get_range(func, lhs.id);
                            let right = self.get_range(func, rhs.id);
                            compute_binary_range(*op, &left, &right)
                        }
                        Inst::Cast { operand, target, .. } if target.is_integer() => {
                            let operand_range = self.get_range(func, operand.id);
                            target.integer_bounds().map(|(min, max)| {
                                operand_range.intersect(&ValueRange::new(min, max))
                            })
                        }
                        Inst::Phi { incomings } if result.ty.is_integer() => {
                            let mut joined: Option<ValueRange> = None;
                            for (value, _) in incomings {
                                let incoming = self.get_range(func, value.id);
                                joined = Some(match joined {
                                    None => incoming,
                                    Some(range) => range.union_with(&incoming),
                                });
                            }
                            // Widen after repeated refinement so loop-carried
                            // phis terminate
                            let visits = phi_visits.entry(result.id).or_insert(0);
                            *visits += 1;
                            if *visits > 2 {
                                joined = result
                                    .ty
                                    .integer_bounds()
                                    .map(|(min, max)| ValueRange::new(min, max));
                            }
                            joined
                        }
                        _ => None,
                    };

                    if let Some(range) = new_range
                        && self.ranges.get(&result.id) != Some(&range)
                    {
                        self.ranges.insert(result.id, range);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    // ============ Induction Variables ============

    /// Recognize the indexed loop shape the builder emits: an alloca slot
    /// initialized to a constant, incremented by a positive constant, and
    /// guarded by `load < bound` at the loop header.
    fn detect_induction(&mut self, func: &Function) {
        self.induction.clear();

        // Stores per alloca slot
        let mut stores: HashMap<ValueId, Vec<ValueId>> = HashMap::new();
        let mut allocas: Vec<ValueId> = Vec::new();
        for block in &func.blocks {
            for record in &block.instructions {
                match &record.inst {
                    Inst::Alloca { .. } => {
                        if let Some(id) = record.result_id() {
                            allocas.push(id);
                        }
                    }
                    Inst::Store { ptr, value, .. } => {
                        stores.entry(ptr.id).or_default().push(value.id);
                    }
                    _ => {}
                }
            }
        }

        for slot in allocas {
            let Some(slot_stores) = stores.get(&slot) else {
                continue;
            };
            if slot_stores.len() != 2 {
                continue;
            }

            // Classify the two stores: constant init + increment of a load
            let mut init: Option<i64> = None;
            let mut step_ok = false;
            for &stored in slot_stores {
                match self.find_inst(func, stored) {
                    Some(Inst::ConstInt { value, .. }) => {
                        init = i64::try_from(*value).ok();
                    }
                    Some(Inst::Binary {
                        op: BinOp::Add,
                        lhs,
                        rhs,
                    }) => {
                        let lhs_is_load = self.is_load_of(func, lhs.id, slot);
                        let rhs_is_load = self.is_load_of(func, rhs.id, slot);
                        let lhs_const = self.const_value(func, lhs.id);
                        let rhs_const = self.const_value(func, rhs.id);
                        step_ok = (lhs_is_load && rhs_const.is_some_and(|c| c > 0))
                            || (rhs_is_load && lhs_const.is_some_and(|c| c > 0));
                    }
                    _ => {}
                }
            }
            let Some(start) = init else { continue };
            if !step_ok {
                continue;
            }

            // Guarding comparison: condbr on `load(slot) < bound`
            for block in &func.blocks {
                let Some(Terminator::CondBranch {
                    cond, then_block, ..
                }) = &block.terminator
                else {
                    continue;
                };
                let Some(Inst::Binary {
                    op: BinOp::Lt,
                    lhs,
                    rhs,
                }) = self.find_inst(func, cond.id)
                else {
                    continue;
                };
                if !self.is_load_of(func, lhs.id, slot) {
                    continue;
                }
                let bound = match self.const_value(func, rhs.id) {
                    Some(c) => BoundSource::Const(c),
                    None => BoundSource::Value(rhs.id),
                };

                // The guard's own load, and any load of the slot in the
                // guarded body, carry the bound on the true edge
                self.induction.insert(
                    lhs.id,
                    InductionRange {
                        start,
                        bound,
                        guard: *then_block,
                    },
                );
                for body_block in &func.blocks {
                    if !func.dominates(*then_block, body_block.id) {
                        continue;
                    }
                    for record in &body_block.instructions {
                        if let Inst::Load { ptr, .. } = &record.inst
                            && ptr.id == slot
                            && let Some(id) = record.result_id()
                        {
                            self.induction.insert(
                                id,
                                InductionRange {
                                    start,
                                    bound,
                                    guard: *then_block,
                                },
                            );
                        }
                    }
                }
            }
        }
    }

    // ============ Length Tracking ============

    fn collect_len_values(&mut self, func: &Function) {
        self.len_of.clear();
        for block in &func.blocks {
            for record in &block.instructions {
                let Some(result) = record.result_id() else {
                    continue;
                };
                match &record.inst {
                    Inst::Call { callee, args } if callee == "len" && args.len() == 1 => {
                        self.len_of.insert(result, args[0].id);
                    }
                    Inst::ExtractValue { agg, indices }
                        if indices.as_slice() == [1]
                            && matches!(*agg.ty, super::types::Type::Slice { .. }) =>
                    {
                        self.len_of.insert(result, agg.id);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Follow gep/cast chains to the underlying base value
    fn base_root(&self, func: &Function, mut value: ValueId) -> ValueId {
        for _ in 0..64 {
            match self.find_inst(func, value) {
                Some(Inst::GetElementPtr { base, .. }) | Some(Inst::Cast { operand: base, .. }) => {
                    value = base.id;
                }
                _ => return value,
            }
        }
        value
    }

    // ============ Dominating Comparisons ============

    /// Narrow an index range using comparisons that dominate the access
    /// block along their true edge. Returns the refined range and whether
    /// a length check against `base_root` was found.
    fn refine_by_dominating_checks(
        &self,
        func: &Function,
        index: ValueId,
        access_block: BlockId,
        base_root: ValueId,
    ) -> (ValueRange, bool) {
        let mut range = self.get_range(func, index);
        let mut len_checked = false;

        for block in &func.blocks {
            let Some(Terminator::CondBranch {
                cond,
                then_block,
                else_block,
            }) = &block.terminator
            else {
                continue;
            };
            // True edge must dominate the access without the false edge
            // also reaching it through this branch
            if then_block == else_block
                || !func.dominates(*then_block, access_block)
                || func.dominates(*else_block, access_block)
            {
                continue;
            }
            let Some(Inst::Binary { op, lhs, rhs }) = self.find_inst(func, cond.id) else {
                continue;
            };

            if lhs.id == index {
                match (op, self.const_value(func, rhs.id)) {
                    (BinOp::Lt, Some(c)) => {
                        range = range.intersect(&ValueRange::new(i64::MIN, c - 1));
                    }
                    (BinOp::Le, Some(c)) => {
                        range = range.intersect(&ValueRange::new(i64::MIN, c));
                    }
                    (BinOp::Ge, Some(c)) => {
                        range = range.intersect(&ValueRange::new(c, i64::MAX));
                    }
                    (BinOp::Gt, Some(c)) => {
                        range = range.intersect(&ValueRange::new(c + 1, i64::MAX));
                    }
                    (BinOp::Lt, None) => {
                        // `i < len(arr)` proves the access into the same array
                        if self
                            .len_of
                            .get(&rhs.id)
                            .is_some_and(|&measured| {
                                self.base_root(func, measured) == base_root
                            })
                        {
                            len_checked = true;
                        }
                    }
                    _ => {}
                }
            } else if rhs.id == index {
                if let (BinOp::Gt, Some(c)) = (op, self.const_value(func, lhs.id)) {
                    // c > i
                    range = range.intersect(&ValueRange::new(i64::MIN, c - 1));
                }
            }
        }

        (range, len_checked)
    }

    // ============ Helpers ============

    fn find_inst<'f>(&self, func: &'f Function, value: ValueId) -> Option<&'f Inst> {
        let block_id = *self.def_block.get(&value)?;
        func.block(block_id)?
            .instructions
            .iter()
            .find(|r| r.result_id() == Some(value))
            .map(|r| &r.inst)
    }

    fn const_value(&self, func: &Function, value: ValueId) -> Option<i64> {
        match self.find_inst(func, value) {
            Some(Inst::ConstInt { value, .. }) => i64::try_from(*value).ok(),
            _ => None,
        }
    }

    fn is_load_of(&self, func: &Function, value: ValueId, slot: ValueId) -> bool {
        matches!(
            self.find_inst(func, value),
            Some(Inst::Load { ptr, .. }) if ptr.id == slot
        )
    }
}

fn compute_binary_range(op: BinOp, left: &ValueRange, right: &ValueRange) -> Option<ValueRange> {
    match op {
        BinOp::Add => Some(ValueRange::new(
            left.min.saturating_add(right.min),
            left.max.saturating_add(right.max),
        )),
        BinOp::Sub => Some(ValueRange::new(
            left.min.saturating_sub(right.max),
            left.max.saturating_sub(right.min),
        )),
        BinOp::Mul => {
            let candidates = [
                left.min.saturating_mul(right.min),
                left.min.saturating_mul(right.max),
                left.max.saturating_mul(right.min),
                left.max.saturating_mul(right.max),
            ];
            Some(ValueRange::new(
                *candidates.iter().min().unwrap(),
                *candidates.iter().max().unwrap(),
            ))
        }
        BinOp::Mod => {
            if left.is_non_negative() && right.min > 0 {
                Some(ValueRange::new(0, right.max - 1))
            } else {
                None
            }
        }
        _ => None,
    }
}

impl Default for BoundsCheckEliminationPass {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionPass for BoundsCheckEliminationPass {
    fn name(&self) -> &'static str {
        "bounds_check_elimination"
    }

    fn run_on_function(&mut self, func: &mut Function) -> bool {
        self.stats = BceStats::default();
        self.compute_value_ranges(func);
        self.detect_induction(func);
        self.collect_len_values(func);

        // Gather checked accesses first; mutation happens after analysis
        struct Access {
            block: BlockId,
            inst_index: usize,
            index_value: ValueId,
            known_size: Option<u64>,
            base_root: ValueId,
        }
        let mut accesses: Vec<Access> = Vec::new();
        for block in &func.blocks {
            for (inst_index, record) in block.instructions.iter().enumerate() {
                if let Inst::GetElementPtr {
                    base,
                    indices,
                    bounds,
                } = &record.inst
                    && bounds.needs_check
                    && indices.len() == 1
                {
                    accesses.push(Access {
                        block: block.id,
                        inst_index,
                        index_value: indices[0].id,
                        known_size: bounds.known_size,
                        base_root: self.base_root(func, base.id),
                    });
                }
            }
        }
        self.stats.total_accesses = accesses.len();

        let mut eliminations: Vec<(BlockId, usize, &'static str)> = Vec::new();
        for access in &accesses {
            let base_range = self.get_range(func, access.index_value);
            let induction = self.induction.get(&access.index_value).cloned();

            let justification: Option<&'static str> = if base_range.is_constant()
                && access
                    .known_size
                    .is_some_and(|n| base_range.is_valid_index_for(n as i64))
            {
                Some("constant")
            } else if let Some(ind) = induction
                .as_ref()
                .filter(|ind| func.dominates(ind.guard, access.block))
            {
                match (ind.bound, access.known_size) {
                    (BoundSource::Const(bound), Some(n)) => {
                        (ind.start >= 0 && bound <= n as i64).then_some("loop")
                    }
                    (BoundSource::Value(bound_id), _) => {
                        // `idx < len(arr)` where arr is the accessed base
                        (ind.start >= 0
                            && self.len_of.get(&bound_id).is_some_and(|&measured| {
                                self.base_root(func, measured) == access.base_root
                            }))
                        .then_some("loop")
                    }
                    _ => None,
                }
            } else {
                let (refined, len_checked) = self.refine_by_dominating_checks(
                    func,
                    access.index_value,
                    access.block,
                    access.base_root,
                );
                if len_checked && refined.is_non_negative() {
                    Some("dominated")
                } else if access
                    .known_size
                    .is_some_and(|n| refined.is_valid_index_for(n as i64))
                {
                    if refined != base_range {
                        Some("dominated")
                    } else {
                        Some("range")
                    }
                } else {
                    None
                }
            };

            if let Some(kind) = justification {
                eliminations.push((access.block, access.inst_index, kind));
            }
        }

        let changed = !eliminations.is_empty();
        for (block_id, inst_index, kind) in eliminations {
            if let Some(block) = func.blocks.iter_mut().find(|b| b.id == block_id)
                && let Some(record) = block.instructions.get_mut(inst_index)
                && let Inst::GetElementPtr { bounds, .. } = &mut record.inst
            {
                bounds.needs_check = false;
                bounds.assume_in_range = true;
                self.stats.eliminated_checks += 1;
                match kind {
                    "constant" => self.stats.constant_index += 1,
                    "loop" => self.stats.loop_bounded += 1,
                    "dominated" => self.stats.dominated_check += 1,
                    _ => self.stats.range_analysis += 1,
                }
            }
        }

        if changed {
            func.invalidate_analyses();
            tracing::debug!(
                function = func.name.as_str(),
                eliminated = self.stats.eliminated_checks,
                "bounds checks eliminated"
            );
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::Builder;
    use crate::tir::{self, Block, ExprKind, Pattern, Span, Ty};

    fn expr(kind: ExprKind, ty: Ty) -> tir::Expr {
        tir::Expr::new(kind, ty, Span::default())
    }

    fn int(value: i128) -> tir::Expr {
        expr(ExprKind::IntLit(value), Ty::I64)
    }

    /// fn sum() -> i64 { let arr = [..4]; let mut s = 0;
    ///                   for x in arr { s = s + x }; s }
    fn for_loop_module() -> tir::Module {
        let arr_ty = Ty::Array {
            element: Box::new(Ty::I64),
            size: 4,
        };
        tir::Module {
            name: "bce_test".to_string(),
            structs: vec![],
            enums: vec![],
            functions: vec![tir::Function {
                name: "sum".to_string(),
                params: vec![],
                ret_ty: Ty::I64,
                body: Block {
                    stmts: vec![
                        tir::Stmt::Let {
                            pattern: Pattern::Binding("arr".to_string()),
                            init: expr(
                                ExprKind::ArrayLit(vec![int(1), int(2), int(3), int(4)]),
                                arr_ty.clone(),
                            ),
                            mutable: false,
                            volatile: false,
                        },
                        tir::Stmt::Let {
                            pattern: Pattern::Binding("s".to_string()),
                            init: int(0),
                            mutable: true,
                            volatile: false,
                        },
                        tir::Stmt::Expr(expr(
                            ExprKind::For {
                                pattern: Pattern::Binding("x".to_string()),
                                iterable: Box::new(expr(
                                    ExprKind::Var("arr".to_string()),
                                    arr_ty,
                                )),
                                body: Block {
                                    stmts: vec![tir::Stmt::Assign {
                                        target: expr(ExprKind::Var("s".to_string()), Ty::I64),
                                        value: expr(
                                            ExprKind::Binary {
                                                op: tir::BinOp::Add,
                                                lhs: Box::new(expr(
                                                    ExprKind::Var("s".to_string()),
                                                    Ty::I64,
                                                )),
                                                rhs: Box::new(expr(
                                                    ExprKind::Var("x".to_string()),
                                                    Ty::I64,
                                                )),
                                            },
                                            Ty::I64,
                                        ),
                                    }],
                                    tail: None,
                                },
                            },
                            Ty::Unit,
                        )),
                    ],
                    tail: Some(Box::new(expr(ExprKind::Var("s".to_string()), Ty::I64))),
                },
                is_public: false,
                is_async: false,
                span: Span::default(),
            }],
        }
    }

    #[test]
    fn test_for_loop_accesses_eliminated() {
        let module = Builder::new().build(&for_loop_module()).unwrap();
        let mut func = module.functions.into_iter().next().unwrap();

        let mut pass = BoundsCheckEliminationPass::new();
        assert!(pass.run_on_function(&mut func));

        assert_eq!(pass.stats().total_accesses, 1);
        assert_eq!(pass.stats().eliminated_checks, 1);
        assert_eq!(pass.stats().loop_bounded, 1);

        // The gep is now check-free and carries the assume hint
        let gep_checked: Vec<(bool, bool)> = func
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .filter_map(|r| match &r.inst {
                Inst::GetElementPtr { bounds, .. } => {
                    Some((bounds.needs_check, bounds.assume_in_range))
                }
                _ => None,
            })
            .collect();
        assert_eq!(gep_checked, vec![(false, true)]);
    }

    #[test]
    fn test_bce_idempotent() {
        let module = Builder::new().build(&for_loop_module()).unwrap();
        let mut func = module.functions.into_iter().next().unwrap();

        let mut pass = BoundsCheckEliminationPass::new();
        assert!(pass.run_on_function(&mut func));
        let mut second = BoundsCheckEliminationPass::new();
        assert!(!second.run_on_function(&mut func));
    }

    #[test]
    fn test_constant_index_eliminated() {
        let arr_ty = Ty::Array {
            element: Box::new(Ty::I64),
            size: 4,
        };
        let module = tir::Module {
            name: "ci".to_string(),
            structs: vec![],
            enums: vec![],
            functions: vec![tir::Function {
                name: "first".to_string(),
                params: vec![],
                ret_ty: Ty::I64,
                body: Block {
                    stmts: vec![tir::Stmt::Let {
                        pattern: Pattern::Binding("arr".to_string()),
                        init: expr(
                            ExprKind::ArrayLit(vec![int(9), int(8), int(7), int(6)]),
                            arr_ty.clone(),
                        ),
                        mutable: false,
                        volatile: false,
                    }],
                    tail: Some(Box::new(expr(
                        ExprKind::Index {
                            base: Box::new(expr(ExprKind::Var("arr".to_string()), arr_ty)),
                            index: Box::new(int(2)),
                        },
                        Ty::I64,
                    ))),
                },
                is_public: false,
                is_async: false,
                span: Span::default(),
            }],
        };

        let mir = Builder::new().build(&module).unwrap();
        let mut func = mir.functions.into_iter().next().unwrap();
        let mut pass = BoundsCheckEliminationPass::new();
        assert!(pass.run_on_function(&mut func));
        assert_eq!(pass.stats().constant_index, 1);
    }

    #[test]
    fn test_dominating_check_eliminates() {
        let arr_ty = Ty::Array {
            element: Box::new(Ty::I64),
            size: 4,
        };
        // fn get(arr: [i64;4]-local, i: u32) -> i64 { if i < 4 { arr[i] } else { 0 } }
        let module = tir::Module {
            name: "dom".to_string(),
            structs: vec![],
            enums: vec![],
            functions: vec![tir::Function {
                name: "get".to_string(),
                params: vec![tir::Param {
                    name: "i".to_string(),
                    ty: Ty::U32,
                    mutable: false,
                }],
                ret_ty: Ty::I64,
                body: Block {
                    stmts: vec![tir::Stmt::Let {
                        pattern: Pattern::Binding("arr".to_string()),
                        init: expr(
                            ExprKind::ArrayLit(vec![int(1), int(2), int(3), int(4)]),
                            arr_ty.clone(),
                        ),
                        mutable: false,
                        volatile: false,
                    }],
                    tail: Some(Box::new(expr(
                        ExprKind::If {
                            cond: Box::new(expr(
                                ExprKind::Binary {
                                    op: tir::BinOp::Lt,
                                    lhs: Box::new(expr(
                                        ExprKind::Var("i".to_string()),
                                        Ty::U32,
                                    )),
                                    rhs: Box::new(expr(ExprKind::IntLit(4), Ty::U32)),
                                },
                                Ty::Bool,
                            )),
                            then_block: Block {
                                stmts: vec![],
                                tail: Some(Box::new(expr(
                                    ExprKind::Index {
                                        base: Box::new(expr(
                                            ExprKind::Var("arr".to_string()),
                                            arr_ty,
                                        )),
                                        index: Box::new(expr(
                                            ExprKind::Var("i".to_string()),
                                            Ty::U32,
                                        )),
                                    },
                                    Ty::I64,
                                ))),
                            },
                            else_block: Some(Block {
                                stmts: vec![],
                                tail: Some(Box::new(int(0))),
                            }),
                        },
                        Ty::I64,
                    ))),
                },
                is_public: false,
                is_async: false,
                span: Span::default(),
            }],
        };

        let mir = Builder::new().build(&module).unwrap();
        let mut func = mir.functions.into_iter().next().unwrap();
        let mut pass = BoundsCheckEliminationPass::new();
        assert!(pass.run_on_function(&mut func));
        assert_eq!(pass.stats().eliminated_checks, 1);
        assert_eq!(pass.stats().dominated_check, 1);
    }

    #[test]
    fn test_unprovable_access_keeps_check() {
        let arr_ty = Ty::Array {
            element: Box::new(Ty::I64),
            size: 4,
        };
        // Unconstrained i64 index: the check stays
        let module = tir::Module {
            name: "keep".to_string(),
            structs: vec![],
            enums: vec![],
            functions: vec![tir::Function {
                name: "get".to_string(),
                params: vec![tir::Param {
                    name: "i".to_string(),
                    ty: Ty::I64,
                    mutable: false,
                }],
                ret_ty: Ty::I64,
                body: Block {
                    stmts: vec![tir::Stmt::Let {
                        pattern: Pattern::Binding("arr".to_string()),
                        init: expr(
                            ExprKind::ArrayLit(vec![int(1), int(2), int(3), int(4)]),
                            arr_ty.clone(),
                        ),
                        mutable: false,
                        volatile: false,
                    }],
                    tail: Some(Box::new(expr(
                        ExprKind::Index {
                            base: Box::new(expr(ExprKind::Var("arr".to_string()), arr_ty)),
                            index: Box::new(expr(ExprKind::Var("i".to_string()), Ty::I64)),
                        },
                        Ty::I64,
                    ))),
                },
                is_public: false,
                is_async: false,
                span: Span::default(),
            }],
        };

        let mir = Builder::new().build(&module).unwrap();
        let mut func = mir.functions.into_iter().next().unwrap();
        let mut pass = BoundsCheckEliminationPass::new();
        assert!(!pass.run_on_function(&mut func));
        assert_eq!(pass.stats().eliminated_checks, 0);
        assert_eq!(pass.stats().total_accesses, 1);
    }

    #[test]
    fn test_value_range_operations() {
        let a = ValueRange::new(0, 10);
        let b = ValueRange::new(5, 20);
        assert_eq!(a.intersect(&b), ValueRange::new(5, 10));
        assert_eq!(a.union_with(&b), ValueRange::new(0, 20));
        assert!(ValueRange::constant(3).is_valid_index_for(4));
        assert!(!ValueRange::new(0, 4).is_valid_index_for(4));
        assert!(!ValueRange::new(-1, 2).is_valid_index_for(4));
    }
}
