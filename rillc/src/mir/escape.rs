//! Escape analysis and stack promotion
//!
//! Determines whether heap-allocated values escape their defining function.
//! Values that never escape can live in an `alloca` instead, avoiding
//! allocator traffic and enabling further optimization.
//!
//! # Escape categories
//!
//! - `NoEscape`: never leaves the function - stack-promotion candidate
//! - `ArgEscape`: passed to a called function
//! - `ReturnEscape`: returned from the function
//! - `GlobalEscape`: stored through a pointer that may alias global state
//! - `Unknown`: cannot be determined
//!
//! Escapes propagate through derived pointers (`gep`, `cast`, `select`,
//! `phi`) back to the underlying allocation, iterated to a fixed point.
//! Class instances (constructor naming convention `Type_new`) are tracked
//! separately with their own statistics.

use std::collections::HashMap;

use super::optimize::FunctionPass;
use super::types::Type;
use super::{Function, Inst, Terminator, Value, ValueId};

/// Escape state for a value, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscapeState {
    NoEscape,
    ArgEscape,
    ReturnEscape,
    GlobalEscape,
    Unknown,
}

/// Escape information for a single value
#[derive(Debug, Clone)]
pub struct EscapeInfo {
    pub state: EscapeState,
    pub is_class_instance: bool,
    pub class_name: Option<String>,
}

impl EscapeInfo {
    pub fn escapes(&self) -> bool {
        self.state != EscapeState::NoEscape
    }
}

/// Statistics from escape analysis
#[derive(Debug, Default, Clone)]
pub struct EscapeStats {
    pub total_allocations: usize,
    pub no_escape: usize,
    pub arg_escape: usize,
    pub return_escape: usize,
    pub global_escape: usize,
    pub stack_promotable: usize,
    pub class_instances: usize,
    pub class_instances_no_escape: usize,
    pub method_call_escapes: usize,
    pub field_store_escapes: usize,
}

/// Callees whose arguments are known not to retain their operands
fn is_known_pure(callee: &str) -> bool {
    if callee == "len" {
        return true;
    }
    // Overflow intrinsics: `<int>_checked_add` and friends
    matches!(
        callee.split_once('_').map(|(_, m)| m),
        Some(
            "checked_add"
                | "checked_sub"
                | "checked_mul"
                | "saturating_add"
                | "saturating_sub"
                | "saturating_mul"
                | "wrapping_add"
                | "wrapping_sub"
                | "wrapping_mul"
        )
    )
}

fn is_allocation_callee(callee: &str) -> bool {
    callee == "alloc"
        || callee == "malloc"
        || callee.ends_with("_new")
        || callee.ends_with("_create")
}

fn is_constructor_call(callee: &str) -> bool {
    callee.ends_with("_new")
        && callee
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_uppercase())
}

fn constructor_class_name(callee: &str) -> Option<&str> {
    callee.strip_suffix("_new")
}

/// Escape analysis over one function.
///
/// Results are queried by [`StackPromotionPass`]; the analysis itself
/// never mutates IR.
#[derive(Debug, Default)]
pub struct EscapeAnalysis {
    escape_info: HashMap<ValueId, EscapeInfo>,
    /// Derived pointer -> the values it was derived from
    derived_from: HashMap<ValueId, Vec<ValueId>>,
    stats: EscapeStats,
}

impl EscapeAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_escape_info(&self, value: ValueId) -> Option<&EscapeInfo> {
        self.escape_info.get(&value)
    }

    pub fn can_stack_promote(&self, value: ValueId) -> bool {
        self.escape_info
            .get(&value)
            .is_some_and(|info| !info.escapes())
    }

    /// Value ids eligible for stack promotion, in discovery order
    pub fn stack_promotable(&self) -> Vec<ValueId> {
        let mut ids: Vec<ValueId> = self
            .escape_info
            .iter()
            .filter(|(_, info)| !info.escapes())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn stats(&self) -> &EscapeStats {
        &self.stats
    }

    pub fn analyze(&mut self, func: &Function) {
        self.escape_info.clear();
        self.derived_from.clear();
        self.stats = EscapeStats::default();

        // Pass 1: find allocations and derived-pointer edges
        for block in &func.blocks {
            for record in &block.instructions {
                let Some(result) = record.result_id() else {
                    // Stores and other void instructions handled in pass 2
                    continue;
                };
                match &record.inst {
                    Inst::Call { callee, .. } if is_allocation_callee(callee) => {
                        let is_class = is_constructor_call(callee);
                        self.escape_info.insert(
                            result,
                            EscapeInfo {
                                state: EscapeState::NoEscape,
                                is_class_instance: is_class,
                                class_name: constructor_class_name(callee)
                                    .filter(|_| is_class)
                                    .map(str::to_string),
                            },
                        );
                        self.stats.total_allocations += 1;
                        if is_class {
                            self.stats.class_instances += 1;
                        }
                    }
                    Inst::GetElementPtr { base, .. } | Inst::Cast { operand: base, .. } => {
                        self.derived_from.entry(result).or_default().push(base.id);
                    }
                    Inst::Select {
                        then_value,
                        else_value,
                        ..
                    } => {
                        let entry = self.derived_from.entry(result).or_default();
                        entry.push(then_value.id);
                        entry.push(else_value.id);
                    }
                    Inst::Phi { incomings } => {
                        let entry = self.derived_from.entry(result).or_default();
                        for (value, _) in incomings {
                            entry.push(value.id);
                        }
                    }
                    _ => {}
                }
            }
        }

        // Pass 2: direct escape events
        for block in &func.blocks {
            for record in &block.instructions {
                match &record.inst {
                    Inst::Store { ptr, value, .. } => {
                        // A store through a pointer we did not allocate may
                        // reach global state
                        if !self.rooted_in_local(func, ptr.id) {
                            if self.tracks(value.id) && self.is_class_value(value.id) {
                                self.stats.field_store_escapes += 1;
                            }
                            self.mark_escape(value.id, EscapeState::GlobalEscape);
                        }
                    }
                    Inst::Call { callee, args } => {
                        if is_known_pure(callee) {
                            continue;
                        }
                        for arg in args {
                            self.mark_escape(arg.id, EscapeState::ArgEscape);
                        }
                    }
                    Inst::MethodCall { receiver, args, .. } => {
                        if self.tracks(receiver.id) && self.is_class_value(receiver.id) {
                            self.stats.method_call_escapes += 1;
                        }
                        self.mark_escape(receiver.id, EscapeState::ArgEscape);
                        for arg in args {
                            self.mark_escape(arg.id, EscapeState::ArgEscape);
                        }
                    }
                    Inst::ClosureInit { captures, .. } => {
                        for capture in captures {
                            self.mark_escape(capture.id, EscapeState::ArgEscape);
                        }
                    }
                    Inst::AtomicStore { value, .. } | Inst::AtomicRmw { value, .. } => {
                        self.mark_escape(value.id, EscapeState::GlobalEscape);
                    }
                    _ => {}
                }
            }
            if let Some(Terminator::Return(Some(value))) = &block.terminator {
                self.mark_escape(value.id, EscapeState::ReturnEscape);
            }
        }

        // Tally
        for info in self.escape_info.values() {
            match info.state {
                EscapeState::NoEscape => self.stats.no_escape += 1,
                EscapeState::ArgEscape => self.stats.arg_escape += 1,
                EscapeState::ReturnEscape => self.stats.return_escape += 1,
                EscapeState::GlobalEscape => self.stats.global_escape += 1,
                EscapeState::Unknown => {}
            }
            if info.is_class_instance && !info.escapes() {
                self.stats.class_instances_no_escape += 1;
            }
        }
        self.stats.stack_promotable = self.stats.no_escape;
    }

    fn tracks(&self, value: ValueId) -> bool {
        self.escape_info.contains_key(&value)
    }

    fn is_class_value(&self, value: ValueId) -> bool {
        self.escape_info
            .get(&value)
            .is_some_and(|info| info.is_class_instance)
    }

    /// Mark an escape, propagating through derived-pointer chains down to
    /// the allocations they were derived from
    fn mark_escape(&mut self, value: ValueId, state: EscapeState) {
        let mut worklist = vec![value];
        let mut guard = 0usize;
        while let Some(id) = worklist.pop() {
            guard += 1;
            if guard > 100_000 {
                break;
            }
            if let Some(info) = self.escape_info.get_mut(&id)
                && state > info.state
            {
                info.state = state;
            }
            if let Some(bases) = self.derived_from.get(&id) {
                worklist.extend(bases.iter().copied());
            }
        }
    }

    /// True when a pointer provably points into function-local memory
    /// (an alloca or a tracked allocation), following derivation chains
    fn rooted_in_local(&self, func: &Function, ptr: ValueId) -> bool {
        let mut current = ptr;
        for _ in 0..64 {
            if self.escape_info.contains_key(&current) {
                return true;
            }
            if let Some((block, index)) = self.find_def(func, current) {
                match &func.blocks[block].instructions[index].inst {
                    Inst::Alloca { .. } => return true,
                    Inst::GetElementPtr { base, .. } | Inst::Cast { operand: base, .. } => {
                        current = base.id;
                        continue;
                    }
                    _ => return false,
                }
            }
            return false;
        }
        false
    }

    fn find_def(&self, func: &Function, value: ValueId) -> Option<(usize, usize)> {
        for (bi, block) in func.blocks.iter().enumerate() {
            for (ii, record) in block.instructions.iter().enumerate() {
                if record.result_id() == Some(value) {
                    return Some((bi, ii));
                }
            }
        }
        None
    }
}

/// Statistics from stack promotion
#[derive(Debug, Default, Clone)]
pub struct StackPromotionStats {
    pub allocations_promoted: usize,
    pub bytes_saved: u64,
}

/// Converts non-escaping heap allocations to stack allocations.
///
/// Runs escape analysis, then rewrites `call alloc(..)` style instructions
/// whose results never escape into `alloca` of equivalent layout.
pub struct StackPromotionPass {
    stats: StackPromotionStats,
    escape_stats: EscapeStats,
}

impl StackPromotionPass {
    pub fn new() -> Self {
        Self {
            stats: StackPromotionStats::default(),
            escape_stats: EscapeStats::default(),
        }
    }

    pub fn stats(&self) -> &StackPromotionStats {
        &self.stats
    }

    pub fn escape_stats(&self) -> &EscapeStats {
        &self.escape_stats
    }

    /// Alloca type of equivalent layout for a promotable allocation
    fn promoted_type(result: &Value, args: &[Value], func: &Function) -> Option<Type> {
        if let Some(pointee) = result.ty.pointee() {
            return Some((**pointee).clone());
        }
        if matches!(*result.ty, Type::Ptr) {
            // Untyped allocation: promote to a byte array of the constant
            // requested size
            let size_arg = args.first()?;
            let size = find_const_int(func, size_arg.id)?;
            let size = u64::try_from(size).ok()?;
            return Some(Type::Array {
                element: std::rc::Rc::new(Type::U8),
                size,
            });
        }
        None
    }
}

fn find_const_int(func: &Function, value: ValueId) -> Option<i128> {
    for block in &func.blocks {
        for record in &block.instructions {
            if record.result_id() == Some(value)
                && let Inst::ConstInt { value, .. } = &record.inst
            {
                return Some(*value);
            }
        }
    }
    None
}

impl Default for StackPromotionPass {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionPass for StackPromotionPass {
    fn name(&self) -> &'static str {
        "stack_promotion"
    }

    fn run_on_function(&mut self, func: &mut Function) -> bool {
        let mut analysis = EscapeAnalysis::new();
        analysis.analyze(func);
        self.escape_stats = analysis.stats().clone();
        if analysis.stats().no_escape == 0 {
            return false;
        }

        let mut changed = false;
        for block_index in 0..func.blocks.len() {
            for inst_index in 0..func.blocks[block_index].instructions.len() {
                let (promotable, replacement) = {
                    let record = &func.blocks[block_index].instructions[inst_index];
                    let Some(result) = &record.result else {
                        continue;
                    };
                    if !analysis.can_stack_promote(result.id) {
                        continue;
                    }
                    let Inst::Call { callee, args } = &record.inst else {
                        continue;
                    };
                    if !is_allocation_callee(callee) || is_constructor_call(callee) {
                        // Constructors build the instance; only raw
                        // allocations are rewritten in place
                        continue;
                    }
                    match Self::promoted_type(result, args, func) {
                        Some(ty) => {
                            let size = ty.size_of();
                            (
                                size,
                                Inst::Alloca {
                                    ty: std::rc::Rc::new(ty),
                                    name: format!("promoted{}", result.id),
                                },
                            )
                        }
                        None => continue,
                    }
                };

                func.blocks[block_index].instructions[inst_index].inst = replacement;
                self.stats.allocations_promoted += 1;
                self.stats.bytes_saved += promotable;
                changed = true;
            }
        }

        if changed {
            func.invalidate_analyses();
            tracing::debug!(
                function = func.name.as_str(),
                promoted = self.stats.allocations_promoted,
                "stack promotion applied"
            );
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::TypeRef;
    use super::*;
    use crate::tir::Span;
    use super::super::InstructionRecord;
    use std::rc::Rc;

    fn i32_ty() -> TypeRef {
        Rc::new(Type::I32)
    }

    fn ptr_to(ty: TypeRef) -> TypeRef {
        Rc::new(Type::Pointer {
            pointee: ty,
            is_mut: true,
        })
    }

    fn record(inst: Inst, result: Option<Value>) -> InstructionRecord {
        InstructionRecord::new(inst, result, Span::default())
    }

    /// %p = call alloc(16); store 42 -> %p; %v = load %p; ret %v
    fn local_alloc_function() -> Function {
        let mut f = Function::new("local", vec![], i32_ty(), Span::default());
        let entry = f.add_block("entry");

        let size = f.fresh_value(Rc::new(Type::I64));
        f.push_inst(
            entry,
            record(
                Inst::ConstInt {
                    value: 16,
                    bits: 64,
                    signed: true,
                },
                Some(size.clone()),
            ),
        );
        let ptr = f.fresh_value(ptr_to(i32_ty()));
        f.push_inst(
            entry,
            record(
                Inst::Call {
                    callee: "alloc".to_string(),
                    args: vec![size],
                },
                Some(ptr.clone()),
            ),
        );
        let forty_two = f.fresh_value(i32_ty());
        f.push_inst(
            entry,
            record(
                Inst::ConstInt {
                    value: 42,
                    bits: 32,
                    signed: true,
                },
                Some(forty_two.clone()),
            ),
        );
        f.push_inst(
            entry,
            record(
                Inst::Store {
                    ptr: ptr.clone(),
                    value: forty_two,
                    volatile: false,
                },
                None,
            ),
        );
        let loaded = f.fresh_value(i32_ty());
        f.push_inst(
            entry,
            record(
                Inst::Load {
                    ptr,
                    volatile: false,
                },
                Some(loaded.clone()),
            ),
        );
        f.set_terminator(entry, Terminator::Return(Some(loaded)));
        f
    }

    #[test]
    fn test_local_allocation_is_no_escape() {
        let f = local_alloc_function();
        let mut analysis = EscapeAnalysis::new();
        analysis.analyze(&f);

        assert_eq!(analysis.stats().total_allocations, 1);
        assert_eq!(analysis.stats().no_escape, 1);
        assert_eq!(analysis.stack_promotable().len(), 1);
    }

    #[test]
    fn test_returned_pointer_escapes() {
        let mut f = Function::new("leaky", vec![], ptr_to(i32_ty()), Span::default());
        let entry = f.add_block("entry");
        let size = f.fresh_value(Rc::new(Type::I64));
        f.push_inst(
            entry,
            record(
                Inst::ConstInt {
                    value: 8,
                    bits: 64,
                    signed: true,
                },
                Some(size.clone()),
            ),
        );
        let ptr = f.fresh_value(ptr_to(i32_ty()));
        f.push_inst(
            entry,
            record(
                Inst::Call {
                    callee: "alloc".to_string(),
                    args: vec![size],
                },
                Some(ptr.clone()),
            ),
        );
        f.set_terminator(entry, Terminator::Return(Some(ptr)));

        let mut analysis = EscapeAnalysis::new();
        analysis.analyze(&f);
        assert_eq!(analysis.stats().return_escape, 1);
        assert!(analysis.stack_promotable().is_empty());
    }

    #[test]
    fn test_arg_passed_pointer_escapes() {
        let unit_ty: TypeRef = Rc::new(Type::Unit);
        let mut f = Function::new("passes", vec![], unit_ty.clone(), Span::default());
        let entry = f.add_block("entry");
        let size = f.fresh_value(Rc::new(Type::I64));
        f.push_inst(
            entry,
            record(
                Inst::ConstInt {
                    value: 8,
                    bits: 64,
                    signed: true,
                },
                Some(size.clone()),
            ),
        );
        let ptr = f.fresh_value(ptr_to(i32_ty()));
        f.push_inst(
            entry,
            record(
                Inst::Call {
                    callee: "alloc".to_string(),
                    args: vec![size],
                },
                Some(ptr.clone()),
            ),
        );
        let sink = f.fresh_value(unit_ty);
        f.push_inst(
            entry,
            record(
                Inst::Call {
                    callee: "consume".to_string(),
                    args: vec![ptr],
                },
                Some(sink),
            ),
        );
        f.set_terminator(entry, Terminator::Return(None));

        let mut analysis = EscapeAnalysis::new();
        analysis.analyze(&f);
        assert_eq!(analysis.stats().arg_escape, 1);
    }

    #[test]
    fn test_escape_through_gep_chain() {
        let unit_ty: TypeRef = Rc::new(Type::Unit);
        let mut f = Function::new("derived", vec![], unit_ty.clone(), Span::default());
        let entry = f.add_block("entry");
        let size = f.fresh_value(Rc::new(Type::I64));
        f.push_inst(
            entry,
            record(
                Inst::ConstInt {
                    value: 16,
                    bits: 64,
                    signed: true,
                },
                Some(size.clone()),
            ),
        );
        let ptr = f.fresh_value(ptr_to(i32_ty()));
        f.push_inst(
            entry,
            record(
                Inst::Call {
                    callee: "alloc".to_string(),
                    args: vec![size.clone()],
                },
                Some(ptr.clone()),
            ),
        );
        let derived = f.fresh_value(ptr_to(i32_ty()));
        f.push_inst(
            entry,
            record(
                Inst::GetElementPtr {
                    base: ptr,
                    indices: smallvec::smallvec![size],
                    bounds: super::super::BoundsInfo::unchecked(),
                },
                Some(derived.clone()),
            ),
        );
        let sink = f.fresh_value(unit_ty);
        f.push_inst(
            entry,
            record(
                Inst::Call {
                    callee: "consume".to_string(),
                    args: vec![derived],
                },
                Some(sink),
            ),
        );
        f.set_terminator(entry, Terminator::Return(None));

        let mut analysis = EscapeAnalysis::new();
        analysis.analyze(&f);
        // The escape flows through the gep back to the allocation
        assert_eq!(analysis.stats().arg_escape, 1);
        assert_eq!(analysis.stats().no_escape, 0);
    }

    #[test]
    fn test_stack_promotion_rewrites_alloc() {
        let mut f = local_alloc_function();
        let mut pass = StackPromotionPass::new();
        assert!(pass.run_on_function(&mut f));
        assert_eq!(pass.stats().allocations_promoted, 1);

        let has_alloc_call = f
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .any(|r| matches!(&r.inst, Inst::Call { callee, .. } if callee == "alloc"));
        assert!(!has_alloc_call);
        let has_alloca = f
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .any(|r| matches!(r.inst, Inst::Alloca { .. }));
        assert!(has_alloca);
        assert!(f.verify().is_ok());
    }

    #[test]
    fn test_stack_promotion_idempotent() {
        let mut f = local_alloc_function();
        let mut pass = StackPromotionPass::new();
        assert!(pass.run_on_function(&mut f));
        let mut second = StackPromotionPass::new();
        assert!(!second.run_on_function(&mut f));
    }
}
