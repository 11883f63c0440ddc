//! SIMD vectorization
//!
//! Vector operations are expressed as calls to backend intrinsics
//! (`simd.add.i64x4`, `simd.reduce_add.i64`, ...) that the code emitter
//! maps onto LLVM vector instructions. Two styles:
//!
//! - **Loop vectorization** ([`LoopVectorizePass`]): counted loops over
//!   contiguous memory. Elementwise maps run the main loop at vector
//!   stride with a scalar remainder tail; sum/product reductions collapse
//!   into a single reduce intrinsic.
//! - **SLP** ([`SlpVectorizePass`]): straight-line runs of isomorphic
//!   operations on adjacent constant indices bundle into one vector call.
//!
//! Legality is conservative: the destination array must be distinct from
//! every source array (no write-read crossing between lanes), and the
//! operation kind must be uniform across the bundle.

use std::collections::HashMap;

use crate::tir::Span;

use super::loops::{find_canonical_loops, CanonicalLoop};
use super::optimize::FunctionPass;
use super::types::TypeRef;
use super::{
    BinOp, BlockId, Function, Inst, InstructionRecord, Terminator, Value, ValueId,
};

/// Lanes per vector operation
const VECTOR_WIDTH: i64 = 4;

/// Statistics for the vectorization passes
#[derive(Debug, Default, Clone)]
pub struct VectorizeStats {
    pub loops_analyzed: usize,
    pub loops_vectorized: usize,
    pub reductions_vectorized: usize,
    pub slp_bundles: usize,
}

fn intrinsic_op_name(op: BinOp) -> Option<&'static str> {
    match op {
        BinOp::Add => Some("add"),
        BinOp::Sub => Some("sub"),
        BinOp::Mul => Some("mul"),
        BinOp::Div => Some("div"),
        _ => None,
    }
}

fn find_record<'f>(func: &'f Function, value: ValueId) -> Option<&'f InstructionRecord> {
    func.blocks
        .iter()
        .flat_map(|b| b.instructions.iter())
        .find(|r| r.result_id() == Some(value))
}

fn def_block(func: &Function, value: ValueId) -> Option<BlockId> {
    for block in &func.blocks {
        for record in &block.instructions {
            if record.result_id() == Some(value) {
                return Some(block.id);
            }
        }
    }
    None
}

fn is_slot_load(func: &Function, value: ValueId, slot: ValueId) -> bool {
    matches!(
        find_record(func, value).map(|r| &r.inst),
        Some(Inst::Load { ptr, .. }) if ptr.id == slot
    )
}

/// GEP with a single index that reads the loop's induction slot (either the
/// guard's load or a body reload). Returns (base id, gep value, elem type).
fn gep_on_induction(
    func: &Function,
    gep: ValueId,
    loop_info: &CanonicalLoop,
) -> Option<(ValueId, Value, TypeRef)> {
    let record = find_record(func, gep)?;
    let Inst::GetElementPtr {
        ref base,
        ref indices,
        ..
    } = record.inst
    else {
        return None;
    };
    if indices.len() != 1 {
        return None;
    }
    let index = indices[0].id;
    if index != loop_info.guard_load && !is_slot_load(func, index, loop_info.slot) {
        return None;
    }
    let elem = record.result.as_ref()?.ty.pointee().cloned()?;
    Some((base.id, record.result.clone()?, elem))
}

// ============================================================================
// Loop Vectorization
// ============================================================================

/// The elementwise map shape: `dst[i] = a[i] op b[i]` in a self-contained
/// while-style body that also increments the induction slot
struct MapPattern {
    op: BinOp,
    elem_ty: TypeRef,
    dst_gep: Value,
    src_geps: Vec<Value>,
    /// Result ids of the two source loads and the binop, all replaced by
    /// the vector call
    replaced_ids: Vec<ValueId>,
}

/// The reduction shape: `acc = acc op src[i]` through an accumulator slot
struct ReductionPattern {
    op: BinOp,
    elem_ty: TypeRef,
    src_base: Value,
    acc_slot: Value,
}

/// Loop vectorizer: maps at vector stride with a scalar tail, reductions
/// through a reduce intrinsic
pub struct LoopVectorizePass {
    stats: VectorizeStats,
}

impl LoopVectorizePass {
    pub fn new() -> Self {
        Self {
            stats: VectorizeStats::default(),
        }
    }

    pub fn stats(&self) -> &VectorizeStats {
        &self.stats
    }

    /// Recognize the while-style map shape: the body block is also the
    /// latch, stores once through a gep on the induction value, and its
    /// only other store is the induction increment
    fn match_map(func: &Function, loop_info: &CanonicalLoop) -> Option<MapPattern> {
        if loop_info.body_entry != loop_info.latch {
            return None;
        }
        let body = func.block(loop_info.body_entry)?;
        if !matches!(body.terminator, Some(Terminator::Branch(t)) if t == loop_info.header) {
            return None;
        }

        let mut map_store: Option<(&Value, &Value)> = None;
        for record in &body.instructions {
            match &record.inst {
                Inst::Store { ptr, value, .. } => {
                    if ptr.id == loop_info.slot {
                        continue; // induction increment
                    }
                    if map_store.is_some() {
                        return None;
                    }
                    map_store = Some((ptr, value));
                }
                Inst::Load { .. }
                | Inst::GetElementPtr { .. }
                | Inst::Binary { .. }
                | Inst::ConstInt { .. } => {}
                _ => return None,
            }
        }
        let (dst_ptr, stored) = map_store?;

        let (dst_base, dst_gep, elem_ty) = gep_on_induction(func, dst_ptr.id, loop_info)?;
        let Inst::Binary { op, lhs, rhs } = &find_record(func, stored.id)?.inst else {
            return None;
        };
        intrinsic_op_name(*op)?;

        let mut src_geps = Vec::new();
        let mut src_bases = Vec::new();
        let mut replaced_ids = vec![stored.id];
        for operand in [lhs, rhs] {
            let Inst::Load { ptr, .. } = &find_record(func, operand.id)?.inst else {
                return None;
            };
            let (src_base, src_gep, _) = gep_on_induction(func, ptr.id, loop_info)?;
            src_bases.push(src_base);
            src_geps.push(src_gep);
            replaced_ids.push(operand.id);
        }

        if src_bases.contains(&dst_base) {
            return None;
        }

        Some(MapPattern {
            op: *op,
            elem_ty,
            dst_gep,
            src_geps,
            replaced_ids,
        })
    }

    /// Recognize the accumulator reduction shape in a three-block counted
    /// loop (separate body and latch)
    fn match_reduction(func: &Function, loop_info: &CanonicalLoop) -> Option<ReductionPattern> {
        let body = func.block(loop_info.body_entry)?;
        if !matches!(body.terminator, Some(Terminator::Branch(t)) if t == loop_info.latch) {
            return None;
        }

        let mut stores = body
            .instructions
            .iter()
            .filter_map(|r| match &r.inst {
                Inst::Store { ptr, value, .. } => Some((ptr, value)),
                _ => None,
            });
        let (acc_ptr, stored) = stores.next()?;
        if stores.next().is_some() {
            return None;
        }
        if !matches!(find_record(func, acc_ptr.id)?.inst, Inst::Alloca { .. }) {
            return None;
        }

        let Inst::Binary { op, lhs, rhs } = &find_record(func, stored.id)?.inst else {
            return None;
        };
        if !matches!(op, BinOp::Add | BinOp::Mul) {
            return None;
        }

        // One side reloads the accumulator, the other loads src[i]
        let classify = |value: &Value| -> Option<(bool, Option<(ValueId, Value, TypeRef)>)> {
            let Inst::Load { ptr, .. } = &find_record(func, value.id)?.inst else {
                return None;
            };
            if ptr.id == acc_ptr.id {
                return Some((true, None));
            }
            Some((false, gep_on_induction(func, ptr.id, loop_info)))
        };
        let (lhs_acc, lhs_src) = classify(lhs)?;
        let (rhs_acc, rhs_src) = classify(rhs)?;
        let (src_base_id, _, src_elem) = match (lhs_acc, rhs_acc) {
            (true, false) => rhs_src?,
            (false, true) => lhs_src?,
            _ => return None,
        };

        for record in &body.instructions {
            match &record.inst {
                Inst::Load { .. }
                | Inst::Store { .. }
                | Inst::Binary { .. }
                | Inst::GetElementPtr { .. }
                | Inst::ConstInt { .. } => {}
                _ => return None,
            }
        }

        // The source pointer must be available before the loop
        let src_base = find_record(func, src_base_id)?.result.clone()?;
        let base_block = def_block(func, src_base_id)?;
        if !func.dominates(base_block, loop_info.preheader) {
            return None;
        }

        Some(ReductionPattern {
            op: *op,
            elem_ty: src_elem,
            src_base,
            acc_slot: find_record(func, acc_ptr.id)?.result.clone()?,
        })
    }

    fn vectorize_reduction(
        func: &mut Function,
        loop_info: &CanonicalLoop,
        pattern: &ReductionPattern,
        trip_count: i64,
    ) {
        let span = Span::default();
        let op_name = match pattern.op {
            BinOp::Mul => "reduce_mul",
            _ => "reduce_add",
        };
        let callee = format!("simd.{}.{}", op_name, pattern.elem_ty);

        let len = func.fresh_value(std::rc::Rc::new(super::types::Type::I64));
        let partial = func.fresh_value(pattern.elem_ty.clone());
        let acc_in = func.fresh_value(pattern.elem_ty.clone());
        let combined = func.fresh_value(pattern.elem_ty.clone());

        let preheader = func
            .blocks
            .iter_mut()
            .find(|b| b.id == loop_info.preheader)
            .expect("preheader exists");
        preheader.instructions.push(InstructionRecord::new(
            Inst::ConstInt {
                value: trip_count as i128,
                bits: 64,
                signed: true,
            },
            Some(len.clone()),
            span,
        ));
        preheader.instructions.push(InstructionRecord::new(
            Inst::Call {
                callee,
                args: vec![pattern.src_base.clone(), len],
            },
            Some(partial.clone()),
            span,
        ));
        preheader.instructions.push(InstructionRecord::new(
            Inst::Load {
                ptr: pattern.acc_slot.clone(),
                volatile: false,
            },
            Some(acc_in.clone()),
            span,
        ));
        preheader.instructions.push(InstructionRecord::new(
            Inst::Binary {
                op: pattern.op,
                lhs: acc_in,
                rhs: partial,
            },
            Some(combined.clone()),
            span,
        ));
        preheader.instructions.push(InstructionRecord::new(
            Inst::Store {
                ptr: pattern.acc_slot.clone(),
                value: combined,
                volatile: false,
            },
            None,
            span,
        ));
        // The scalar loop is bypassed entirely
        preheader.terminator = Some(Terminator::Branch(loop_info.exit));
        func.invalidate_analyses();
    }

    fn vectorize_map(
        func: &mut Function,
        loop_info: &CanonicalLoop,
        pattern: &MapPattern,
        trip_count: i64,
    ) {
        let span = Span::default();
        let main_bound = trip_count - trip_count % VECTOR_WIDTH;
        let op_name = intrinsic_op_name(pattern.op).expect("gated earlier");
        let callee = format!("simd.{}.{}x{}", op_name, pattern.elem_ty, VECTOR_WIDTH);

        // Scalar template for the remainder tail, captured before rewriting
        let template: Vec<InstructionRecord> = func
            .block(loop_info.body_entry)
            .expect("body exists")
            .instructions
            .clone();

        // Main loop guard counts to the vector-aligned bound
        if main_bound != trip_count {
            let idx_ty = find_record(func, loop_info.guard_load)
                .and_then(|r| r.result.as_ref())
                .map(|v| v.ty.clone())
                .expect("guard load has a type");
            let aligned = func.fresh_value(idx_ty);
            let header = func
                .blocks
                .iter_mut()
                .find(|b| b.id == loop_info.header)
                .expect("header exists");
            let compare_at = header
                .instructions
                .iter()
                .position(|r| {
                    matches!(
                        &r.inst,
                        Inst::Binary { op: BinOp::Lt, lhs, .. } if lhs.id == loop_info.guard_load
                    )
                })
                .expect("canonical guard");
            header.instructions.insert(
                compare_at,
                InstructionRecord::new(
                    Inst::ConstInt {
                        value: main_bound as i128,
                        bits: 64,
                        signed: true,
                    },
                    Some(aligned.clone()),
                    span,
                ),
            );
            if let Inst::Binary { rhs, .. } = &mut header.instructions[compare_at + 1].inst {
                *rhs = aligned;
            }
        }

        // The induction increment strides by the vector width. Identify it
        // first: the add whose result is stored back into the slot.
        let increment_id = {
            let body = func.block(loop_info.body_entry).expect("body exists");
            body.instructions
                .iter()
                .find_map(|r| match &r.inst {
                    Inst::Store { ptr, value, .. } if ptr.id == loop_info.slot => Some(value.id),
                    _ => None,
                })
                .expect("canonical increment store")
        };
        let increment_lhs_is_reload = match find_record(func, increment_id).map(|r| &r.inst) {
            Some(Inst::Binary { lhs, .. }) => is_slot_load(func, lhs.id, loop_info.slot),
            _ => true,
        };
        {
            let step_width = func.fresh_value(std::rc::Rc::new(super::types::Type::I64));
            let body = func
                .blocks
                .iter_mut()
                .find(|b| b.id == loop_info.body_entry)
                .expect("body exists");
            let add_at = body
                .instructions
                .iter()
                .position(|r| r.result_id() == Some(increment_id))
                .expect("increment add exists");
            body.instructions.insert(
                add_at,
                InstructionRecord::new(
                    Inst::ConstInt {
                        value: VECTOR_WIDTH as i128,
                        bits: 64,
                        signed: true,
                    },
                    Some(step_width.clone()),
                    span,
                ),
            );
            if let Inst::Binary { lhs, rhs, .. } = &mut body.instructions[add_at + 1].inst {
                if increment_lhs_is_reload {
                    *rhs = step_width;
                } else {
                    *lhs = step_width;
                }
            }
        }

        // Body: the scalar loads, the op, and the store collapse into one
        // vector call at the store's position (geps stay as lane bases)
        {
            let args = {
                let mut args = vec![pattern.dst_gep.clone()];
                args.extend(pattern.src_geps.iter().cloned());
                args
            };
            let body = func
                .blocks
                .iter_mut()
                .find(|b| b.id == loop_info.body_entry)
                .expect("body exists");
            let mut kept: Vec<InstructionRecord> = Vec::new();
            for record in body.instructions.drain(..) {
                if let Inst::Store { ptr, .. } = &record.inst
                    && ptr.id == pattern.dst_gep.id
                {
                    // The vector call takes the scalar store's place
                    kept.push(InstructionRecord::new(
                        Inst::Call {
                            callee: callee.clone(),
                            args: args.clone(),
                        },
                        None,
                        span,
                    ));
                    continue;
                }
                if record
                    .result_id()
                    .is_some_and(|id| pattern.replaced_ids.contains(&id))
                {
                    continue; // drop the scalar loads and the op
                }
                kept.push(record);
            }
            body.instructions = kept;
        }

        // Remainder tail: a self-incrementing scalar clone of the original
        // body running main_bound..trip_count
        if main_bound != trip_count {
            let tail_entry = build_scalar_tail(func, loop_info, &template, main_bound, loop_info.exit);
            let header = func
                .blocks
                .iter_mut()
                .find(|b| b.id == loop_info.header)
                .expect("header exists");
            if let Some(Terminator::CondBranch { else_block, .. }) = &mut header.terminator {
                *else_block = tail_entry;
            }
        }

        func.invalidate_analyses();
    }
}

/// Build a scalar while-style loop from `start` to the loop's original
/// bound whose body is a remapped clone of `template` (which increments
/// the induction slot itself). Returns the init block id.
fn build_scalar_tail(
    func: &mut Function,
    loop_info: &CanonicalLoop,
    template: &[InstructionRecord],
    start: i64,
    exit: BlockId,
) -> BlockId {
    let span = Span::default();
    let bound = loop_info.bound_const.expect("counted loop");
    let slot_ty = find_record(func, loop_info.slot)
        .and_then(|r| r.result.as_ref())
        .map(|v| v.ty.clone())
        .expect("slot has a type");
    let idx_ty = find_record(func, loop_info.guard_load)
        .and_then(|r| r.result.as_ref())
        .map(|v| v.ty.clone())
        .expect("guard load has a type");

    let init_b = func.add_block("tail_init");
    let header_b = func.add_block("tail_header");
    let body_b = func.add_block("tail_body");

    let slot = func.fresh_value(slot_ty);
    let start_v = func.fresh_value(idx_ty.clone());
    {
        let block = func.blocks.iter_mut().find(|b| b.id == init_b).unwrap();
        block.instructions.push(InstructionRecord::new(
            Inst::Alloca {
                ty: idx_ty.clone(),
                name: "tail_idx".to_string(),
            },
            Some(slot.clone()),
            span,
        ));
        block.instructions.push(InstructionRecord::new(
            Inst::ConstInt {
                value: start as i128,
                bits: 64,
                signed: true,
            },
            Some(start_v.clone()),
            span,
        ));
        block.instructions.push(InstructionRecord::new(
            Inst::Store {
                ptr: slot.clone(),
                value: start_v,
                volatile: false,
            },
            None,
            span,
        ));
        block.terminator = Some(Terminator::Branch(header_b));
    }

    let idx = func.fresh_value(idx_ty.clone());
    let bound_v = func.fresh_value(idx_ty.clone());
    let cond = func.fresh_value(std::rc::Rc::new(super::types::Type::Bool));
    {
        let block = func.blocks.iter_mut().find(|b| b.id == header_b).unwrap();
        block.instructions.push(InstructionRecord::new(
            Inst::Load {
                ptr: slot.clone(),
                volatile: false,
            },
            Some(idx.clone()),
            span,
        ));
        block.instructions.push(InstructionRecord::new(
            Inst::ConstInt {
                value: bound as i128,
                bits: 64,
                signed: true,
            },
            Some(bound_v.clone()),
            span,
        ));
        block.instructions.push(InstructionRecord::new(
            Inst::Binary {
                op: BinOp::Lt,
                lhs: idx,
                rhs: bound_v,
            },
            Some(cond.clone()),
            span,
        ));
        block.terminator = Some(Terminator::CondBranch {
            cond,
            then_block: body_b,
            else_block: exit,
        });
    }

    {
        let mut value_map: HashMap<ValueId, Value> = HashMap::new();
        let body_idx = func.fresh_value(idx_ty);
        value_map.insert(loop_info.guard_load, body_idx.clone());

        let mut remapped = Vec::with_capacity(template.len() + 1);
        remapped.push(InstructionRecord::new(
            Inst::Load {
                ptr: slot.clone(),
                volatile: false,
            },
            Some(body_idx),
            span,
        ));
        for record in template {
            let mut inst = record.inst.clone();
            inst.for_each_operand_mut(|v| {
                if let Some(mapped) = value_map.get(&v.id) {
                    *v = mapped.clone();
                }
            });
            match &mut inst {
                Inst::Load { ptr, .. } if ptr.id == loop_info.slot => ptr.id = slot.id,
                Inst::Store { ptr, .. } if ptr.id == loop_info.slot => ptr.id = slot.id,
                _ => {}
            }
            let result = record.result.as_ref().map(|r| {
                let fresh = func.fresh_value(r.ty.clone());
                value_map.insert(r.id, fresh.clone());
                fresh
            });
            remapped.push(InstructionRecord::new(inst, result, record.span));
        }
        let block = func.blocks.iter_mut().find(|b| b.id == body_b).unwrap();
        block.instructions = remapped;
        // The template body increments the slot itself
        block.terminator = Some(Terminator::Branch(header_b));
    }

    init_b
}

impl Default for LoopVectorizePass {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionPass for LoopVectorizePass {
    fn name(&self) -> &'static str {
        "loop_vectorize"
    }

    fn run_on_function(&mut self, func: &mut Function) -> bool {
        let canonical = find_canonical_loops(func);
        self.stats.loops_analyzed += canonical.len();
        let mut changed = false;

        for loop_info in &canonical {
            let Some(trip_count) = loop_info.bound_const else {
                continue;
            };
            if loop_info.start != 0 || loop_info.step != 1 || trip_count < VECTOR_WIDTH * 2 {
                continue;
            }

            if loop_info.blocks.len() == 3
                && let Some(pattern) = Self::match_reduction(func, loop_info)
            {
                Self::vectorize_reduction(func, loop_info, &pattern, trip_count);
                self.stats.reductions_vectorized += 1;
                self.stats.loops_vectorized += 1;
                changed = true;
                // Block structure shifted; re-discover on the next run
                break;
            }
            if loop_info.blocks.len() == 2
                && let Some(pattern) = Self::match_map(func, loop_info)
            {
                Self::vectorize_map(func, loop_info, &pattern, trip_count);
                self.stats.loops_vectorized += 1;
                changed = true;
                break;
            }
        }

        if changed {
            tracing::debug!(
                function = func.name.as_str(),
                vectorized = self.stats.loops_vectorized,
                "loop vectorization applied"
            );
        }
        changed
    }
}

// ============================================================================
// SLP Vectorization
// ============================================================================

/// One lane of a potential SLP bundle
struct Lane {
    store_index: usize,
    array_index: i64,
    op: BinOp,
    dst_root: ValueId,
    src_roots: Vec<ValueId>,
    dst_gep: Value,
    src_geps: Vec<Value>,
    elem_ty: TypeRef,
}

/// Bundles isomorphic adjacent scalar operations into vector intrinsics
pub struct SlpVectorizePass {
    stats: VectorizeStats,
}

impl SlpVectorizePass {
    pub fn new() -> Self {
        Self {
            stats: VectorizeStats::default(),
        }
    }

    pub fn stats(&self) -> &VectorizeStats {
        &self.stats
    }

    /// `a[k] = b[k] op c[k]` with constant k
    fn match_lane(func: &Function, store_index: usize, ptr: &Value, stored: &Value) -> Option<Lane> {
        let gep_const_index = |gep: ValueId| -> Option<(ValueId, i64, Value, TypeRef)> {
            let record = find_record(func, gep)?;
            let Inst::GetElementPtr {
                ref base,
                ref indices,
                ..
            } = record.inst
            else {
                return None;
            };
            if indices.len() != 1 {
                return None;
            }
            let Inst::ConstInt { value, .. } = find_record(func, indices[0].id)?.inst else {
                return None;
            };
            let elem = record.result.as_ref()?.ty.pointee().cloned()?;
            Some((
                base.id,
                i64::try_from(value).ok()?,
                record.result.clone()?,
                elem,
            ))
        };

        let (dst_root, array_index, dst_gep, elem_ty) = gep_const_index(ptr.id)?;
        let Inst::Binary { op, lhs, rhs } = &find_record(func, stored.id)?.inst else {
            return None;
        };
        intrinsic_op_name(*op)?;

        let mut src_roots = Vec::new();
        let mut src_geps = Vec::new();
        for operand in [lhs, rhs] {
            let Inst::Load { ptr, .. } = &find_record(func, operand.id)?.inst else {
                return None;
            };
            let (root, index, gep, _) = gep_const_index(ptr.id)?;
            if index != array_index {
                return None;
            }
            src_roots.push(root);
            src_geps.push(gep);
        }
        if src_roots.contains(&dst_root) {
            return None;
        }

        Some(Lane {
            store_index,
            array_index,
            op: *op,
            dst_root,
            src_roots,
            dst_gep,
            src_geps,
            elem_ty,
        })
    }
}

impl Default for SlpVectorizePass {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionPass for SlpVectorizePass {
    fn name(&self) -> &'static str {
        "slp_vectorize"
    }

    fn run_on_function(&mut self, func: &mut Function) -> bool {
        let mut changed = false;
        let block_ids: Vec<BlockId> = func.blocks.iter().map(|b| b.id).collect();

        for block_id in block_ids {
            // Collect candidate lanes in instruction order
            let lanes: Vec<Lane> = {
                let Some(block) = func.block(block_id) else {
                    continue;
                };
                block
                    .instructions
                    .iter()
                    .enumerate()
                    .filter_map(|(i, record)| match &record.inst {
                        Inst::Store { ptr, value, .. } => {
                            Self::match_lane(func, i, ptr, value)
                        }
                        _ => None,
                    })
                    .collect()
            };
            if lanes.len() < 2 {
                continue;
            }

            // A bundle is a run of lanes with uniform op/arrays and
            // consecutive array indices
            let mut bundle: Vec<&Lane> = vec![&lanes[0]];
            for lane in &lanes[1..] {
                let prev = bundle.last().expect("non-empty");
                let isomorphic = lane.op == prev.op
                    && lane.dst_root == prev.dst_root
                    && lane.src_roots == prev.src_roots
                    && lane.array_index == prev.array_index + 1;
                if isomorphic {
                    bundle.push(lane);
                } else if bundle.len() >= 2 {
                    break;
                } else {
                    bundle = vec![lane];
                }
            }
            if bundle.len() < 2 {
                continue;
            }

            let width = bundle.len();
            let first = bundle[0];
            let callee = format!(
                "simd.{}.{}x{}",
                intrinsic_op_name(first.op).expect("gated in match_lane"),
                first.elem_ty,
                width
            );
            let mut args = vec![first.dst_gep.clone()];
            args.extend(first.src_geps.iter().cloned());
            let insert_at = first.store_index;
            let removed: Vec<usize> = bundle.iter().map(|l| l.store_index).collect();

            let Some(block) = func.blocks.iter_mut().find(|b| b.id == block_id) else {
                continue;
            };
            let mut kept: Vec<InstructionRecord> = Vec::new();
            for (i, record) in block.instructions.drain(..).enumerate() {
                if i == insert_at {
                    kept.push(InstructionRecord::new(
                        Inst::Call {
                            callee: callee.clone(),
                            args: args.clone(),
                        },
                        None,
                        Span::default(),
                    ));
                }
                if !removed.contains(&i) {
                    kept.push(record);
                }
            }
            block.instructions = kept;
            self.stats.slp_bundles += 1;
            changed = true;
        }

        if changed {
            func.invalidate_analyses();
            tracing::debug!(
                function = func.name.as_str(),
                bundles = self.stats.slp_bundles,
                "slp bundles formed"
            );
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::Builder;
    use crate::tir::{self, Block, ExprKind, Pattern, Ty};

    fn expr(kind: ExprKind, ty: Ty) -> tir::Expr {
        tir::Expr::new(kind, ty, Span::default())
    }

    fn int(value: i128) -> tir::Expr {
        expr(ExprKind::IntLit(value), Ty::I64)
    }

    fn var(name: &str, ty: Ty) -> tir::Expr {
        expr(ExprKind::Var(name.to_string()), ty)
    }

    fn arr_ty(size: u64) -> Ty {
        Ty::Array {
            element: Box::new(Ty::I64),
            size,
        }
    }

    fn index_expr(arr: &str, size: u64, index: tir::Expr) -> tir::Expr {
        expr(
            ExprKind::Index {
                base: Box::new(var(arr, arr_ty(size))),
                index: Box::new(index),
            },
            Ty::I64,
        )
    }

    fn let_arr(name: &str, size: u64) -> tir::Stmt {
        tir::Stmt::Let {
            pattern: Pattern::Binding(name.to_string()),
            init: expr(
                ExprKind::ArrayLit((0..size).map(|i| int(i as i128)).collect()),
                arr_ty(size),
            ),
            mutable: true,
            volatile: false,
        }
    }

    fn build_fn(stmts: Vec<tir::Stmt>, tail: Option<tir::Expr>) -> Function {
        let module = tir::Module {
            name: "vec".to_string(),
            structs: vec![],
            enums: vec![],
            functions: vec![tir::Function {
                name: "f".to_string(),
                params: vec![],
                ret_ty: tail.as_ref().map(|t| t.ty.clone()).unwrap_or(Ty::Unit),
                body: Block {
                    stmts,
                    tail: tail.map(Box::new),
                },
                is_public: false,
                is_async: false,
                span: Span::default(),
            }],
        };
        Builder::new()
            .build(&module)
            .unwrap()
            .functions
            .into_iter()
            .next()
            .unwrap()
    }

    #[test]
    fn test_reduction_vectorized_to_intrinsic() {
        // let mut s = 0; for x in a { s = s + x }; s
        let body = Block {
            stmts: vec![tir::Stmt::Assign {
                target: var("s", Ty::I64),
                value: expr(
                    ExprKind::Binary {
                        op: tir::BinOp::Add,
                        lhs: Box::new(var("s", Ty::I64)),
                        rhs: Box::new(var("x", Ty::I64)),
                    },
                    Ty::I64,
                ),
            }],
            tail: None,
        };
        let mut func = build_fn(
            vec![
                let_arr("a", 16),
                tir::Stmt::Let {
                    pattern: Pattern::Binding("s".to_string()),
                    init: int(0),
                    mutable: true,
                    volatile: false,
                },
                tir::Stmt::Expr(expr(
                    ExprKind::For {
                        pattern: Pattern::Binding("x".to_string()),
                        iterable: Box::new(var("a", arr_ty(16))),
                        body,
                    },
                    Ty::Unit,
                )),
            ],
            Some(var("s", Ty::I64)),
        );

        let mut pass = LoopVectorizePass::new();
        assert!(pass.run_on_function(&mut func));
        assert_eq!(pass.stats().reductions_vectorized, 1);

        let has_reduce = func
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .any(|r| matches!(&r.inst, Inst::Call { callee, .. } if callee == "simd.reduce_add.i64"));
        assert!(has_reduce);
        assert!(func.verify().is_ok(), "{:?}", func.verify());
    }

    #[test]
    fn test_map_while_loop_vectorized_with_tail() {
        // let mut i = 0; while i < 10 { d[i] = a[i] + b[i]; i = i + 1 }
        let while_body = Block {
            stmts: vec![
                tir::Stmt::Assign {
                    target: index_expr("d", 10, var("i", Ty::I64)),
                    value: expr(
                        ExprKind::Binary {
                            op: tir::BinOp::Add,
                            lhs: Box::new(index_expr("a", 10, var("i", Ty::I64))),
                            rhs: Box::new(index_expr("b", 10, var("i", Ty::I64))),
                        },
                        Ty::I64,
                    ),
                },
                tir::Stmt::Assign {
                    target: var("i", Ty::I64),
                    value: expr(
                        ExprKind::Binary {
                            op: tir::BinOp::Add,
                            lhs: Box::new(var("i", Ty::I64)),
                            rhs: Box::new(int(1)),
                        },
                        Ty::I64,
                    ),
                },
            ],
            tail: None,
        };
        let mut func = build_fn(
            vec![
                let_arr("d", 10),
                let_arr("a", 10),
                let_arr("b", 10),
                tir::Stmt::Let {
                    pattern: Pattern::Binding("i".to_string()),
                    init: int(0),
                    mutable: true,
                    volatile: false,
                },
                tir::Stmt::Expr(expr(
                    ExprKind::While {
                        cond: Box::new(expr(
                            ExprKind::Binary {
                                op: tir::BinOp::Lt,
                                lhs: Box::new(var("i", Ty::I64)),
                                rhs: Box::new(int(10)),
                            },
                            Ty::Bool,
                        )),
                        body: while_body,
                    },
                    Ty::Unit,
                )),
            ],
            None,
        );

        let mut pass = LoopVectorizePass::new();
        assert!(pass.run_on_function(&mut func));
        assert_eq!(pass.stats().loops_vectorized, 1);

        // Main loop calls the 4-lane intrinsic; the scalar tail survives
        let has_vector_call = func
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .any(|r| matches!(&r.inst, Inst::Call { callee, .. } if callee == "simd.add.i64x4"));
        assert!(has_vector_call);
        assert!(func.blocks.iter().any(|b| b.name == "tail_header"));
        assert!(func.verify().is_ok(), "{:?}", func.verify());
    }

    #[test]
    fn test_slp_bundles_adjacent_stores() {
        // a[0] = b[0] + c[0]; ... a[3] = b[3] + c[3]
        let mut stmts = vec![let_arr("a", 4), let_arr("b", 4), let_arr("c", 4)];
        for k in 0..4i128 {
            stmts.push(tir::Stmt::Assign {
                target: index_expr("a", 4, int(k)),
                value: expr(
                    ExprKind::Binary {
                        op: tir::BinOp::Add,
                        lhs: Box::new(index_expr("b", 4, int(k))),
                        rhs: Box::new(index_expr("c", 4, int(k))),
                    },
                    Ty::I64,
                ),
            });
        }
        let mut func = build_fn(stmts, None);

        let mut pass = SlpVectorizePass::new();
        assert!(pass.run_on_function(&mut func));
        assert_eq!(pass.stats().slp_bundles, 1);

        let vector_calls: Vec<String> = func
            .blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .filter_map(|r| match &r.inst {
                Inst::Call { callee, .. } if callee.starts_with("simd.") => {
                    Some(callee.clone())
                }
                _ => None,
            })
            .collect();
        assert_eq!(vector_calls, vec!["simd.add.i64x4".to_string()]);
        assert!(func.verify().is_ok());
    }

    #[test]
    fn test_slp_rejects_aliasing_destination() {
        // a[k] = a[k] + c[k]: destination aliases a source
        let mut stmts = vec![let_arr("a", 4), let_arr("c", 4)];
        for k in 0..4i128 {
            stmts.push(tir::Stmt::Assign {
                target: index_expr("a", 4, int(k)),
                value: expr(
                    ExprKind::Binary {
                        op: tir::BinOp::Add,
                        lhs: Box::new(index_expr("a", 4, int(k))),
                        rhs: Box::new(index_expr("c", 4, int(k))),
                    },
                    Ty::I64,
                ),
            });
        }
        let mut func = build_fn(stmts, None);

        let mut pass = SlpVectorizePass::new();
        assert!(!pass.run_on_function(&mut func));
        assert_eq!(pass.stats().slp_bundles, 0);
    }
}
