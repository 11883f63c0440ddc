//! Async state-machine lowering
//!
//! Turns every async function (or any function containing an `await`
//! marker) into a poll function:
//!
//! 1. Await sites get state indices; state 0 is the entry state.
//! 2. Values live across a suspension point - parameters included - are
//!    demoted to fields of a synthesized `{name}_state` struct; defs store
//!    into the state, uses load from it.
//! 3. The function's parameters are replaced by a single pointer to the
//!    state struct and its return type becomes `Poll[T]`.
//! 4. Each await becomes: re-poll the awaited future, branch on its
//!    discriminant; when pending, record the state index and return
//!    `Pending`; when ready, extract the payload and continue.
//! 5. A dispatch block at the entry switches on `state.state` and resumes
//!    at the matching re-poll block.
//!
//! Runs late in the pipeline so earlier optimizations see the
//! pre-transformed form.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::tir::Span;

use super::optimize::ModulePass;
use super::types::{Type, TypeRef};
use super::{
    BinOp, BlockId, EnumLayout, Function, Inst, InstructionRecord, Module, StructLayout,
    Terminator, Value, ValueId,
};

/// Discriminants of the `Poll` sum type
const POLL_PENDING: u32 = 0;
const POLL_READY: u32 = 1;

/// Statistics for async lowering
#[derive(Debug, Default, Clone)]
pub struct AsyncLoweringStats {
    pub functions_lowered: usize,
    pub suspension_points: usize,
    pub state_fields: usize,
}

/// One await site before transformation
#[derive(Debug, Clone)]
struct AwaitSite {
    block: BlockId,
    inst_index: usize,
    suspension_id: u32,
    poll_value: Value,
    result: Option<Value>,
}

pub struct AsyncLoweringPass {
    stats: AsyncLoweringStats,
}

impl AsyncLoweringPass {
    pub fn new() -> Self {
        Self {
            stats: AsyncLoweringStats::default(),
        }
    }

    pub fn stats(&self) -> &AsyncLoweringStats {
        &self.stats
    }

    fn collect_awaits(func: &Function) -> Vec<AwaitSite> {
        let mut sites = Vec::new();
        for block in &func.blocks {
            for (inst_index, record) in block.instructions.iter().enumerate() {
                if let Inst::Await {
                    poll_value,
                    suspension_id,
                } = &record.inst
                {
                    sites.push(AwaitSite {
                        block: block.id,
                        inst_index,
                        suspension_id: *suspension_id,
                        poll_value: poll_value.clone(),
                        result: record.result.clone(),
                    });
                }
            }
        }
        sites.sort_by_key(|s| s.suspension_id);
        sites
    }

    /// Conservative live-across set: parameters, every value used in a
    /// block other than its defining one, values whose definition and use
    /// straddle an await within one block, and await operands whose
    /// definition sits in another block
    fn live_across(func: &Function, awaits: &[AwaitSite]) -> Vec<(ValueId, TypeRef)> {
        let mut def_block: HashMap<ValueId, BlockId> = HashMap::new();
        let mut types: HashMap<ValueId, TypeRef> = HashMap::new();
        for param in &func.params {
            types.insert(param.value_id, param.ty.clone());
        }
        for block in &func.blocks {
            for record in &block.instructions {
                if let Some(result) = &record.result {
                    def_block.insert(result.id, block.id);
                    types.insert(result.id, result.ty.clone());
                }
            }
        }

        let mut live: HashSet<ValueId> = func.params.iter().map(|p| p.value_id).collect();
        let mut note_use = |value: &Value, user_block: BlockId| {
            match def_block.get(&value.id) {
                Some(&def) if def != user_block => {
                    live.insert(value.id);
                }
                None => {
                    // Parameters, already included
                }
                _ => {}
            }
        };
        for block in &func.blocks {
            for record in &block.instructions {
                record.inst.for_each_operand(|v| note_use(v, block.id));
            }
            if let Some(term) = &block.terminator {
                term.for_each_operand(|v| note_use(v, block.id));
            }
        }
        for site in awaits {
            if def_block.get(&site.poll_value.id).copied() != Some(site.block) {
                live.insert(site.poll_value.id);
            }
        }

        // Same-block crossings: def at i, use at j, an await strictly
        // between them (the await's own result crosses a *later* await)
        for block in &func.blocks {
            let await_positions: Vec<usize> = block
                .instructions
                .iter()
                .enumerate()
                .filter(|(_, r)| matches!(r.inst, Inst::Await { .. }))
                .map(|(i, _)| i)
                .collect();
            if await_positions.is_empty() {
                continue;
            }
            let def_index: HashMap<ValueId, usize> = block
                .instructions
                .iter()
                .enumerate()
                .filter_map(|(i, r)| r.result_id().map(|id| (id, i)))
                .collect();
            let crosses = |def: usize, use_at: usize| {
                await_positions.iter().any(|&p| def < p && p < use_at)
            };
            for (j, record) in block.instructions.iter().enumerate() {
                record.inst.for_each_operand(|v| {
                    if let Some(&i) = def_index.get(&v.id)
                        && crosses(i, j)
                    {
                        live.insert(v.id);
                    }
                });
            }
            let end = block.instructions.len();
            if let Some(term) = &block.terminator {
                term.for_each_operand(|v| {
                    if let Some(&i) = def_index.get(&v.id)
                        && crosses(i, end)
                    {
                        live.insert(v.id);
                    }
                });
            }
        }

        let mut ordered: Vec<(ValueId, TypeRef)> = live
            .into_iter()
            .filter_map(|id| types.get(&id).map(|ty| (id, ty.clone())))
            .collect();
        ordered.sort_by_key(|(id, _)| *id);
        ordered
    }

    /// Lower one function in place; returns the synthesized state layout
    fn lower_function(func: &mut Function, ret_payload: TypeRef) -> StructLayout {
        let span = Span::default();
        let awaits = Self::collect_awaits(func);
        let lives = Self::live_across(func, &awaits);

        // ---- State struct layout: state index at slot 0, lives after ----
        let state_name = format!("{}_state", func.name);
        let mut fields: Vec<(String, TypeRef)> =
            vec![("state".to_string(), Rc::new(Type::I32))];
        let mut field_of: HashMap<ValueId, u32> = HashMap::new();
        for (id, ty) in &lives {
            field_of.insert(*id, fields.len() as u32);
            fields.push((format!("v{id}"), ty.clone()));
        }
        let layout = StructLayout {
            name: state_name.clone(),
            fields,
            has_drop: false,
        };

        let state_struct_ty: TypeRef = Rc::new(Type::Struct {
            name: state_name,
            type_args: vec![],
        });
        let state_ptr_ty: TypeRef = Rc::new(Type::Pointer {
            pointee: state_struct_ty,
            is_mut: true,
        });
        let poll_ty: TypeRef = Rc::new(Type::Enum {
            name: "Poll".to_string(),
            type_args: vec![ret_payload.clone()],
        });

        let state_param = func.fresh_value(state_ptr_ty.clone());

        // Helper: emit `gep state[field]` + the access instruction
        let field_ptr = |func: &mut Function,
                         out: &mut Vec<InstructionRecord>,
                         field: u32,
                         field_ty: TypeRef|
         -> Value {
            let index = func.fresh_value(Rc::new(Type::I64));
            out.push(InstructionRecord::new(
                Inst::ConstInt {
                    value: field as i128,
                    bits: 64,
                    signed: true,
                },
                Some(index.clone()),
                span,
            ));
            let ptr = func.fresh_value(Rc::new(Type::Pointer {
                pointee: field_ty,
                is_mut: true,
            }));
            out.push(InstructionRecord::new(
                Inst::GetElementPtr {
                    base: state_param.clone(),
                    indices: smallvec::smallvec![index],
                    bounds: super::BoundsInfo::unchecked(),
                },
                Some(ptr.clone()),
                span,
            ));
            ptr
        };

        // ---- Demote live values to state-field memory ----
        // Defs store into their field; every use loads it back first.
        let live_types: HashMap<ValueId, TypeRef> = lives.iter().cloned().collect();
        let block_ids: Vec<BlockId> = func.blocks.iter().map(|b| b.id).collect();
        for block_id in &block_ids {
            let count = func
                .block(*block_id)
                .map(|b| b.instructions.len())
                .unwrap_or(0);
            let mut rebuilt: Vec<InstructionRecord> = Vec::with_capacity(count);
            let old: Vec<InstructionRecord> = {
                let block = func
                    .blocks
                    .iter_mut()
                    .find(|b| b.id == *block_id)
                    .expect("block exists");
                std::mem::take(&mut block.instructions)
            };

            for mut record in old {
                // Phis keep their operands; predecessors patch them below
                if !matches!(record.inst, Inst::Phi { .. }) {
                    let mut needed: Vec<ValueId> = Vec::new();
                    record.inst.for_each_operand(|v| {
                        if field_of.contains_key(&v.id) && !needed.contains(&v.id) {
                            needed.push(v.id);
                        }
                    });
                    let mut loaded: HashMap<ValueId, Value> = HashMap::new();
                    for id in needed {
                        let ty = live_types.get(&id).expect("live value typed").clone();
                        let ptr = field_ptr(func, &mut rebuilt, field_of[&id], ty.clone());
                        let value = func.fresh_value(ty);
                        rebuilt.push(InstructionRecord::new(
                            Inst::Load {
                                ptr,
                                volatile: false,
                            },
                            Some(value.clone()),
                            span,
                        ));
                        loaded.insert(id, value);
                    }
                    record.inst.for_each_operand_mut(|v| {
                        if let Some(replacement) = loaded.get(&v.id) {
                            *v = replacement.clone();
                        }
                    });
                }

                let stores_after = record
                    .result
                    .as_ref()
                    .filter(|r| field_of.contains_key(&r.id))
                    .cloned();
                rebuilt.push(record);
                if let Some(defined) = stores_after {
                    let ptr =
                        field_ptr(func, &mut rebuilt, field_of[&defined.id], defined.ty.clone());
                    rebuilt.push(InstructionRecord::new(
                        Inst::Store {
                            ptr,
                            value: defined,
                            volatile: false,
                        },
                        None,
                        span,
                    ));
                }
            }

            // Terminator operands load too
            let term_loads = {
                let block = func.block(*block_id).expect("block exists");
                let mut needed: Vec<ValueId> = Vec::new();
                if let Some(term) = &block.terminator {
                    term.for_each_operand(|v| {
                        if field_of.contains_key(&v.id) && !needed.contains(&v.id) {
                            needed.push(v.id);
                        }
                    });
                }
                needed
            };
            let mut term_map: HashMap<ValueId, Value> = HashMap::new();
            for id in term_loads {
                let ty = live_types.get(&id).expect("live value typed").clone();
                let ptr = field_ptr(func, &mut rebuilt, field_of[&id], ty.clone());
                let value = func.fresh_value(ty);
                rebuilt.push(InstructionRecord::new(
                    Inst::Load {
                        ptr,
                        volatile: false,
                    },
                    Some(value.clone()),
                    span,
                ));
                term_map.insert(id, value);
            }

            let block = func
                .blocks
                .iter_mut()
                .find(|b| b.id == *block_id)
                .expect("block exists");
            block.instructions = rebuilt;
            if let Some(term) = &mut block.terminator {
                term.for_each_operand_mut(|v| {
                    if let Some(replacement) = term_map.get(&v.id) {
                        *v = replacement.clone();
                    }
                });
            }
        }

        // Phi incomings of live values load in the predecessor
        let phi_fixups: Vec<(BlockId, ValueId)> = {
            let mut fixups = Vec::new();
            for block in &func.blocks {
                for record in &block.instructions {
                    if let Inst::Phi { incomings } = &record.inst {
                        for (value, pred) in incomings {
                            if field_of.contains_key(&value.id) {
                                fixups.push((*pred, value.id));
                            }
                        }
                    }
                }
            }
            fixups
        };
        let mut pred_loads: HashMap<(BlockId, ValueId), Value> = HashMap::new();
        for (pred, id) in phi_fixups {
            if pred_loads.contains_key(&(pred, id)) {
                continue;
            }
            let ty = live_types.get(&id).expect("live value typed").clone();
            let mut tail: Vec<InstructionRecord> = Vec::new();
            let ptr = field_ptr(func, &mut tail, field_of[&id], ty.clone());
            let value = func.fresh_value(ty);
            tail.push(InstructionRecord::new(
                Inst::Load {
                    ptr,
                    volatile: false,
                },
                Some(value.clone()),
                span,
            ));
            let block = func
                .blocks
                .iter_mut()
                .find(|b| b.id == pred)
                .expect("predecessor exists");
            block.instructions.extend(tail);
            pred_loads.insert((pred, id), value);
        }
        for block in &mut func.blocks {
            for record in &mut block.instructions {
                if let Inst::Phi { incomings } = &mut record.inst {
                    for (value, pred) in incomings.iter_mut() {
                        if let Some(loaded) = pred_loads.get(&(*pred, value.id)) {
                            *value = loaded.clone();
                        }
                    }
                }
            }
        }

        // ---- Split each await into re-poll / pending / ready ----
        let mut resume_blocks: Vec<(u32, BlockId)> = Vec::new();
        loop {
            // One site at a time; the split shifts positions
            let site = {
                let mut found: Option<AwaitSite> = None;
                'outer: for block in &func.blocks {
                    for (inst_index, record) in block.instructions.iter().enumerate() {
                        if let Inst::Await {
                            poll_value,
                            suspension_id,
                        } = &record.inst
                        {
                            found = Some(AwaitSite {
                                block: block.id,
                                inst_index,
                                suspension_id: *suspension_id,
                                poll_value: poll_value.clone(),
                                result: record.result.clone(),
                            });
                            break 'outer;
                        }
                    }
                }
                match found {
                    Some(site) => site,
                    None => break,
                }
            };
            let state_index = site.suspension_id + 1;

            // The re-poll region starts at the poll value's definition when
            // it sits in the same block (re-polling re-evaluates the future)
            let split_at = {
                let block = func.block(site.block).expect("await block exists");
                block
                    .instructions
                    .iter()
                    .position(|r| r.result_id() == Some(site.poll_value.id))
                    .unwrap_or(site.inst_index)
            };

            let poll_b = func.add_block(format!("async_poll{state_index}"));
            let ready_b = func.add_block(format!("async_ready{state_index}"));
            let pending_b = func.add_block(format!("async_pending{state_index}"));
            resume_blocks.push((state_index, poll_b));

            // Carve up the original block
            let (mut repoll_insts, mut suffix_insts, old_term) = {
                let block = func
                    .blocks
                    .iter_mut()
                    .find(|b| b.id == site.block)
                    .expect("await block exists");
                let mut rest = block.instructions.split_off(split_at);
                let await_local = rest
                    .iter()
                    .position(|r| matches!(r.inst, Inst::Await { .. }))
                    .expect("await is in the suffix");
                let suffix = rest.split_off(await_local + 1);
                rest.pop(); // the await marker itself
                let term = block.terminator.take();
                block.terminator = Some(Terminator::Branch(poll_b));
                (rest, suffix, term)
            };

            // poll block: re-evaluate the future, test the discriminant
            let disc = func.fresh_value(Rc::new(Type::I64));
            let ready_tag = func.fresh_value(Rc::new(Type::I64));
            let is_ready = func.fresh_value(Rc::new(Type::Bool));
            repoll_insts.push(InstructionRecord::new(
                Inst::ExtractValue {
                    agg: site.poll_value.clone(),
                    indices: smallvec::smallvec![0u32],
                },
                Some(disc.clone()),
                span,
            ));
            repoll_insts.push(InstructionRecord::new(
                Inst::ConstInt {
                    value: POLL_READY as i128,
                    bits: 64,
                    signed: true,
                },
                Some(ready_tag.clone()),
                span,
            ));
            repoll_insts.push(InstructionRecord::new(
                Inst::Binary {
                    op: BinOp::Eq,
                    lhs: disc,
                    rhs: ready_tag,
                },
                Some(is_ready.clone()),
                span,
            ));
            {
                let block = func
                    .blocks
                    .iter_mut()
                    .find(|b| b.id == poll_b)
                    .expect("poll block exists");
                block.instructions = repoll_insts;
                block.terminator = Some(Terminator::CondBranch {
                    cond: is_ready,
                    then_block: ready_b,
                    else_block: pending_b,
                });
            }

            // ready block: unwrap the payload under the await's result id,
            // then the original continuation
            {
                let mut insts = Vec::new();
                if let Some(result) = &site.result {
                    insts.push(InstructionRecord::new(
                        Inst::ExtractValue {
                            agg: site.poll_value.clone(),
                            indices: smallvec::smallvec![1u32],
                        },
                        Some(result.clone()),
                        span,
                    ));
                }
                insts.append(&mut suffix_insts);
                let block = func
                    .blocks
                    .iter_mut()
                    .find(|b| b.id == ready_b)
                    .expect("ready block exists");
                block.instructions = insts;
                block.terminator = old_term;
            }

            // pending block: record the resume state, return Pending
            {
                let mut insts = Vec::new();
                let state_field =
                    field_ptr(func, &mut insts, 0, Rc::new(Type::I32));
                let state_value = func.fresh_value(Rc::new(Type::I32));
                insts.push(InstructionRecord::new(
                    Inst::ConstInt {
                        value: state_index as i128,
                        bits: 32,
                        signed: true,
                    },
                    Some(state_value.clone()),
                    span,
                ));
                insts.push(InstructionRecord::new(
                    Inst::Store {
                        ptr: state_field,
                        value: state_value,
                        volatile: false,
                    },
                    None,
                    span,
                ));
                let pending = func.fresh_value(poll_ty.clone());
                insts.push(InstructionRecord::new(
                    Inst::EnumInit {
                        name: "Poll".to_string(),
                        variant: POLL_PENDING,
                        payload: vec![],
                    },
                    Some(pending.clone()),
                    span,
                ));
                let block = func
                    .blocks
                    .iter_mut()
                    .find(|b| b.id == pending_b)
                    .expect("pending block exists");
                block.instructions = insts;
                block.terminator = Some(Terminator::Return(Some(pending)));
            }
        }

        // ---- Returns wrap their value in Ready ----
        let return_blocks: Vec<BlockId> = func
            .blocks
            .iter()
            .filter(|b| {
                matches!(&b.terminator, Some(Terminator::Return(v))
                    if v.as_ref().map(|value| value.ty != poll_ty).unwrap_or(true))
            })
            .map(|b| b.id)
            .collect();
        for block_id in return_blocks {
            let value = {
                let block = func.block(block_id).expect("block exists");
                match &block.terminator {
                    Some(Terminator::Return(v)) => v.clone(),
                    _ => continue,
                }
            };
            let ready = func.fresh_value(poll_ty.clone());
            let payload = value.into_iter().collect::<Vec<_>>();
            let block = func
                .blocks
                .iter_mut()
                .find(|b| b.id == block_id)
                .expect("block exists");
            block.instructions.push(InstructionRecord::new(
                Inst::EnumInit {
                    name: "Poll".to_string(),
                    variant: POLL_READY,
                    payload,
                },
                Some(ready.clone()),
                span,
            ));
            block.terminator = Some(Terminator::Return(Some(ready)));
        }

        // ---- Dispatch entry: switch on state.state ----
        let old_entry = func.blocks.first().map(|b| b.id).expect("entry exists");
        let dispatch = func.add_block("poll_entry");
        {
            let mut insts = Vec::new();
            let state_field = field_ptr(func, &mut insts, 0, Rc::new(Type::I32));
            let state_value = func.fresh_value(Rc::new(Type::I32));
            insts.push(InstructionRecord::new(
                Inst::Load {
                    ptr: state_field,
                    volatile: false,
                },
                Some(state_value.clone()),
                span,
            ));
            let term = if resume_blocks.is_empty() {
                Terminator::Branch(old_entry)
            } else {
                let mut cases: Vec<(i64, BlockId)> = vec![(0, old_entry)];
                for (state_index, target) in &resume_blocks {
                    cases.push((*state_index as i64, *target));
                }
                let trap = func.add_block("poll_bad_state");
                func.set_terminator(trap, Terminator::Unreachable);
                Terminator::Switch {
                    disc: state_value,
                    cases,
                    default: trap,
                }
            };
            let block = func
                .blocks
                .iter_mut()
                .find(|b| b.id == dispatch)
                .expect("dispatch exists");
            block.instructions = insts;
            block.terminator = Some(term);
        }
        // The dispatch block becomes the entry block
        let dispatch_index = func
            .blocks
            .iter()
            .position(|b| b.id == dispatch)
            .expect("dispatch exists");
        let dispatch_block = func.blocks.remove(dispatch_index);
        func.blocks.insert(0, dispatch_block);

        // ---- New signature: (state ptr) -> Poll[T] ----
        func.params = vec![super::Param {
            name: "state".to_string(),
            ty: state_ptr_ty,
            value_id: state_param.id,
        }];
        func.ret_ty = poll_ty;
        func.invalidate_analyses();

        layout
    }
}

impl Default for AsyncLoweringPass {
    fn default() -> Self {
        Self::new()
    }
}

impl ModulePass for AsyncLoweringPass {
    fn name(&self) -> &'static str {
        "async_lowering"
    }

    fn run(&mut self, module: &mut Module) -> bool {
        self.stats = AsyncLoweringStats::default();

        let targets: Vec<usize> = module
            .functions
            .iter()
            .enumerate()
            .filter(|(_, f)| {
                f.is_async
                    || f.blocks
                        .iter()
                        .flat_map(|b| &b.instructions)
                        .any(|r| matches!(r.inst, Inst::Await { .. }))
            })
            .filter(|(_, f)| {
                // Already-lowered poll functions take only the state pointer
                !(f.params.len() == 1
                    && f.params[0].name == "state"
                    && matches!(&*f.ret_ty, Type::Enum { name, .. } if name == "Poll"))
            })
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            return false;
        }

        let mut new_layouts = Vec::new();
        let mut poll_payloads = Vec::new();
        for index in targets {
            let func = &mut module.functions[index];
            let awaits = Self::collect_awaits(func);
            self.stats.suspension_points += awaits.len();

            let ret_payload = func.ret_ty.clone();
            let layout = Self::lower_function(func, ret_payload.clone());
            self.stats.state_fields += layout.fields.len();
            self.stats.functions_lowered += 1;
            new_layouts.push(layout);
            poll_payloads.push(ret_payload);
        }

        for layout in new_layouts {
            if module.struct_def(&layout.name).is_none() {
                module.structs.push(layout);
            }
        }
        if module.enum_def("Poll").is_none()
            && let Some(payload) = poll_payloads.into_iter().next()
        {
            module.enums.push(EnumLayout {
                name: "Poll".to_string(),
                variants: vec![
                    ("Pending".to_string(), vec![]),
                    ("Ready".to_string(), vec![payload]),
                ],
                has_drop: false,
            });
        }

        tracing::debug!(
            lowered = self.stats.functions_lowered,
            suspensions = self.stats.suspension_points,
            "async lowering finished"
        );
        true
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

    /// async fn fetch() -> i64 { let a = await service1();
    ///                           let b = await service2(); a + b }
    fn fetch_module() -> tir::Module {
        let poll_ty = Ty::Enum {
            name: "Poll".to_string(),
            type_args: vec![Ty::I64],
        };
        let await_expr = |callee: &str| {
            expr(
                ExprKind::Await {
                    operand: Box::new(expr(
                        ExprKind::Call {
                            callee: callee.to_string(),
                            args: vec![],
                        },
                        poll_ty.clone(),
                    )),
                },
                Ty::I64,
            )
        };
        tir::Module {
            name: "async_test".to_string(),
            structs: vec![],
            enums: vec![],
            functions: vec![tir::Function {
                name: "fetch".to_string(),
                params: vec![],
                ret_ty: Ty::I64,
                body: Block {
                    stmts: vec![
                        tir::Stmt::Let {
                            pattern: Pattern::Binding("a".to_string()),
                            init: await_expr("service1"),
                            mutable: false,
                            volatile: false,
                        },
                        tir::Stmt::Let {
                            pattern: Pattern::Binding("b".to_string()),
                            init: await_expr("service2"),
                            mutable: false,
                            volatile: false,
                        },
                    ],
                    tail: Some(Box::new(expr(
                        ExprKind::Binary {
                            op: tir::BinOp::Add,
                            lhs: Box::new(expr(ExprKind::Var("a".to_string()), Ty::I64)),
                            rhs: Box::new(expr(ExprKind::Var("b".to_string()), Ty::I64)),
                        },
                        Ty::I64,
                    ))),
                },
                is_public: false,
                is_async: true,
                span: Span::default(),
            }],
        }
    }

    fn lowered_fetch() -> (Module, AsyncLoweringStats) {
        let mut module = Builder::new().build(&fetch_module()).unwrap();
        let mut pass = AsyncLoweringPass::new();
        assert!(pass.run(&mut module));
        let stats = pass.stats().clone();
        (module, stats)
    }

    #[test]
    fn test_two_awaits_become_three_states() {
        let (module, stats) = lowered_fetch();
        assert_eq!(stats.functions_lowered, 1);
        assert_eq!(stats.suspension_points, 2);

        let func = module.function("fetch").unwrap();
        // Entry dispatches on state.state with cases 0, 1, 2
        let entry = func.entry_block().unwrap();
        let Some(Terminator::Switch { cases, .. }) = &entry.terminator else {
            panic!("dispatch switch expected, got {:?}", entry.terminator);
        };
        let mut state_indices: Vec<i64> = cases.iter().map(|(v, _)| *v).collect();
        state_indices.sort_unstable();
        assert_eq!(state_indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_signature_becomes_poll_function() {
        let (module, _) = lowered_fetch();
        let func = module.function("fetch").unwrap();

        assert_eq!(func.params.len(), 1);
        assert!(matches!(&*func.params[0].ty, Type::Pointer { .. }));
        assert!(
            matches!(&*func.ret_ty, Type::Enum { name, .. } if name == "Poll")
        );

        // State struct carries the state index plus the saved locals
        let layout = module.struct_def("fetch_state").unwrap();
        assert_eq!(layout.fields[0].0, "state");
        assert!(layout.fields.len() >= 2);
        assert!(module.enum_def("Poll").is_some());
    }

    #[test]
    fn test_pending_paths_return_immediately() {
        let (module, _) = lowered_fetch();
        let func = module.function("fetch").unwrap();

        let pending_blocks: Vec<_> = func
            .blocks
            .iter()
            .filter(|b| b.name.starts_with("async_pending"))
            .collect();
        assert_eq!(pending_blocks.len(), 2);
        for block in pending_blocks {
            // Pending blocks store the resume state and return
            assert!(matches!(block.terminator, Some(Terminator::Return(Some(_)))));
            let constructs_pending = block.instructions.iter().any(|r| {
                matches!(&r.inst, Inst::EnumInit { name, variant, .. }
                    if name == "Poll" && *variant == POLL_PENDING)
            });
            assert!(constructs_pending);
            // No continuation code runs after a pending first await
            assert!(block.instructions.len() <= 6);
        }
    }

    #[test]
    fn test_ready_path_unwraps_payload() {
        let (module, _) = lowered_fetch();
        let func = module.function("fetch").unwrap();
        assert!(func.verify().is_ok(), "{:?}", func.verify());

        let ready_blocks: Vec<_> = func
            .blocks
            .iter()
            .filter(|b| b.name.starts_with("async_ready"))
            .collect();
        assert_eq!(ready_blocks.len(), 2);
        for block in ready_blocks {
            assert!(matches!(
                block.instructions.first().map(|r| &r.inst),
                Some(Inst::ExtractValue { .. })
            ));
        }

        // The final return wraps the sum in Ready
        let wraps_ready = func.blocks.iter().flat_map(|b| &b.instructions).any(|r| {
            matches!(&r.inst, Inst::EnumInit { name, variant, .. }
                if name == "Poll" && *variant == POLL_READY)
        });
        assert!(wraps_ready);
    }

    #[test]
    fn test_lowering_is_idempotent() {
        let (mut module, _) = lowered_fetch();
        let mut pass = AsyncLoweringPass::new();
        assert!(!pass.run(&mut module));
    }
}
