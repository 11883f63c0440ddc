//! Interprocedural optimization
//!
//! Three module-level passes that look across function boundaries:
//!
//! - [`IpcpPass`]: when every call site passes the same constant for a
//!   parameter, the constant is substituted into the callee.
//! - [`ArgPromotionPass`]: small by-reference parameters whose address is
//!   only ever loaded become by-value parameters; call sites are rewritten
//!   to load before the call.
//! - [`AttrInferencePass`]: deduces `pure`, `nothrow`, `readonly`,
//!   `norecurse`, `willreturn`, and `speculatable` from function bodies,
//!   propagating through the call graph for a bounded number of rounds.
//!   Recursive edges and unknown callees get the conservative answer.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::tir::Span;

use super::optimize::{rewrite_uses, ModulePass};
use super::types::Type;
use super::{FnAttributes, Function, Inst, InstructionRecord, Module, Value, ValueId};

/// Statistics for the interprocedural passes
#[derive(Debug, Default, Clone)]
pub struct IpoStats {
    pub constants_propagated: usize,
    pub args_promoted: usize,
    pub pure_functions_found: usize,
    pub nothrow_functions_found: usize,
    pub readonly_functions_found: usize,
}

/// A constant observed at a call site
#[derive(Debug, Clone, PartialEq)]
enum ConstArg {
    Int { value: i128, bits: u8, signed: bool },
    Float { value: f64, is_f64: bool },
    Bool(bool),
}

fn const_arg_of(func: &Function, value: ValueId) -> Option<ConstArg> {
    for block in &func.blocks {
        for record in &block.instructions {
            if record.result_id() == Some(value) {
                return match &record.inst {
                    Inst::ConstInt {
                        value,
                        bits,
                        signed,
                    } => Some(ConstArg::Int {
                        value: *value,
                        bits: *bits,
                        signed: *signed,
                    }),
                    Inst::ConstFloat { value, is_f64 } => Some(ConstArg::Float {
                        value: *value,
                        is_f64: *is_f64,
                    }),
                    Inst::ConstBool { value } => Some(ConstArg::Bool(*value)),
                    _ => None,
                };
            }
        }
    }
    None
}

// ============================================================================
// Interprocedural Constant Propagation
// ============================================================================

/// Substitute parameters that receive the same constant at every call site
pub struct IpcpPass {
    stats: IpoStats,
}

impl IpcpPass {
    pub fn new() -> Self {
        Self {
            stats: IpoStats::default(),
        }
    }

    pub fn stats(&self) -> &IpoStats {
        &self.stats
    }
}

impl Default for IpcpPass {
    fn default() -> Self {
        Self::new()
    }
}

impl ModulePass for IpcpPass {
    fn name(&self) -> &'static str {
        "ipcp"
    }

    fn run(&mut self, module: &mut Module) -> bool {
        self.stats = IpoStats::default();

        // (callee, param index) -> observed constant; None marks a conflict
        // or a non-constant argument
        let mut observed: IndexMap<(String, usize), Option<ConstArg>> = IndexMap::new();
        // Call sites outside the callee itself; specializing on purely
        // recursive edges is not sound
        let mut external_sites: HashSet<String> = HashSet::new();

        for func in &module.functions {
            for block in &func.blocks {
                for record in &block.instructions {
                    let Inst::Call { callee, args } = &record.inst else {
                        continue;
                    };
                    if callee.is_empty() || module.function(callee).is_none() {
                        continue;
                    }
                    if func.name != *callee {
                        external_sites.insert(callee.clone());
                    }
                    for (index, arg) in args.iter().enumerate() {
                        let constant = const_arg_of(func, arg.id);
                        match observed.entry((callee.clone(), index)) {
                            indexmap::map::Entry::Vacant(entry) => {
                                entry.insert(constant);
                            }
                            indexmap::map::Entry::Occupied(mut entry) => {
                                let same = matches!(
                                    (entry.get(), &constant),
                                    (Some(a), Some(b)) if a == b
                                );
                                if !same {
                                    *entry.get_mut() = None;
                                }
                            }
                        }
                    }
                }
            }
        }

        let mut changed = false;
        for ((callee, index), constant) in observed {
            let Some(constant) = constant else { continue };
            if !external_sites.contains(&callee) {
                continue;
            }
            let Some(func) = module.function_mut(&callee) else {
                continue;
            };
            let Some(param) = func.params.get(index) else {
                continue;
            };
            let param_id = param.value_id;
            let param_ty = param.ty.clone();

            // Materialize the constant at the top of the entry block and
            // redirect every use of the parameter to it
            let const_value = func.fresh_value(param_ty);
            let inst = match constant {
                ConstArg::Int {
                    value,
                    bits,
                    signed,
                } => Inst::ConstInt {
                    value,
                    bits,
                    signed,
                },
                ConstArg::Float { value, is_f64 } => Inst::ConstFloat { value, is_f64 },
                ConstArg::Bool(value) => Inst::ConstBool { value },
            };
            let Some(entry) = func.blocks.first_mut() else {
                continue;
            };
            entry.instructions.insert(
                0,
                InstructionRecord::new(inst, Some(const_value.clone()), Span::default()),
            );

            let mut replacements = HashMap::new();
            replacements.insert(param_id, const_value);
            rewrite_uses(func, &replacements);

            self.stats.constants_propagated += 1;
            changed = true;
            tracing::debug!(
                function = callee.as_str(),
                param = index,
                "constant propagated into callee"
            );
        }

        changed
    }
}

// ============================================================================
// Argument Promotion
// ============================================================================

/// Convert small by-reference parameters to by-value parameters
pub struct ArgPromotionPass {
    /// Promote references to types of at most this many bytes
    size_threshold: u64,
    stats: IpoStats,
}

impl ArgPromotionPass {
    pub fn new() -> Self {
        Self {
            size_threshold: 16,
            stats: IpoStats::default(),
        }
    }

    pub fn set_size_threshold(&mut self, bytes: u64) {
        self.size_threshold = bytes;
    }

    pub fn stats(&self) -> &IpoStats {
        &self.stats
    }

    /// A parameter is promotable when its pointee is small and the only
    /// thing the function ever does with the pointer is load through it
    fn can_promote(&self, module: &Module, func: &Function, index: usize) -> bool {
        let Some(param) = func.params.get(index) else {
            return false;
        };
        let Some(pointee) = param.ty.pointee() else {
            return false;
        };
        if module.size_of_type(pointee) > self.size_threshold {
            return false;
        }

        let param_id = param.value_id;
        for block in &func.blocks {
            for record in &block.instructions {
                let mut escapes = false;
                match &record.inst {
                    Inst::Load { ptr, .. } if ptr.id == param_id => continue,
                    inst => inst.for_each_operand(|v| {
                        if v.id == param_id {
                            escapes = true;
                        }
                    }),
                }
                if escapes {
                    return false;
                }
            }
            if let Some(term) = &block.terminator {
                let mut used = false;
                term.for_each_operand(|v| {
                    if v.id == param_id {
                        used = true;
                    }
                });
                if used {
                    return false;
                }
            }
        }
        true
    }

    /// Rewrite the callee: the parameter becomes the pointee value and
    /// loads through it collapse to the parameter itself
    fn promote_param(func: &mut Function, index: usize) {
        let pointee = func.params[index]
            .ty
            .pointee()
            .cloned()
            .expect("checked by can_promote");
        func.params[index].ty = pointee.clone();
        let param_id = func.params[index].value_id;
        let param_value = Value::new(param_id, pointee);

        let mut replacements: HashMap<ValueId, Value> = HashMap::new();
        for block in &mut func.blocks {
            block.instructions.retain(|record| {
                if let Inst::Load { ptr, .. } = &record.inst
                    && ptr.id == param_id
                    && let Some(result) = record.result_id()
                {
                    replacements.insert(result, param_value.clone());
                    return false;
                }
                true
            });
        }
        rewrite_uses(func, &replacements);
        func.invalidate_analyses();
    }

    /// Rewrite call sites to load the pointee and pass it by value
    fn rewrite_call_sites(func: &mut Function, callee: &str, index: usize) {
        for block_index in 0..func.blocks.len() {
            let mut inst_index = 0;
            while inst_index < func.blocks[block_index].instructions.len() {
                let needs_rewrite = {
                    let record = &func.blocks[block_index].instructions[inst_index];
                    matches!(&record.inst, Inst::Call { callee: c, args } if c == callee && index < args.len())
                };
                if !needs_rewrite {
                    inst_index += 1;
                    continue;
                }

                let span = func.blocks[block_index].instructions[inst_index].span;
                let ptr_arg = {
                    let Inst::Call { args, .. } =
                        &func.blocks[block_index].instructions[inst_index].inst
                    else {
                        unreachable!()
                    };
                    args[index].clone()
                };
                let Some(pointee) = ptr_arg.ty.pointee().cloned() else {
                    inst_index += 1;
                    continue;
                };

                let loaded = func.fresh_value(pointee);
                let load = InstructionRecord::new(
                    Inst::Load {
                        ptr: ptr_arg,
                        volatile: false,
                    },
                    Some(loaded.clone()),
                    span,
                );
                let block = &mut func.blocks[block_index];
                if let Inst::Call { args, .. } = &mut block.instructions[inst_index].inst {
                    args[index] = loaded;
                }
                block.instructions.insert(inst_index, load);
                inst_index += 2;
            }
        }
        func.invalidate_analyses();
    }
}

impl Default for ArgPromotionPass {
    fn default() -> Self {
        Self::new()
    }
}

impl ModulePass for ArgPromotionPass {
    fn name(&self) -> &'static str {
        "arg_promotion"
    }

    fn run(&mut self, module: &mut Module) -> bool {
        self.stats = IpoStats::default();

        let mut promotions: Vec<(String, usize)> = Vec::new();
        for func in &module.functions {
            if func.is_public || func.uses_sret {
                continue;
            }
            for index in 0..func.params.len() {
                if self.can_promote(module, func, index) {
                    promotions.push((func.name.clone(), index));
                }
            }
        }
        if promotions.is_empty() {
            return false;
        }

        for (name, index) in &promotions {
            if let Some(func) = module.function_mut(name) {
                Self::promote_param(func, *index);
                self.stats.args_promoted += 1;
            }
        }
        for func in &mut module.functions {
            for (name, index) in &promotions {
                Self::rewrite_call_sites(func, name, *index);
            }
        }

        tracing::debug!(promoted = self.stats.args_promoted, "argument promotion finished");
        true
    }
}

// ============================================================================
// Attribute Inference
// ============================================================================

/// Deduce function attributes from bodies, with bounded call-graph rounds
pub struct AttrInferencePass {
    stats: IpoStats,
}

impl AttrInferencePass {
    pub fn new() -> Self {
        Self {
            stats: IpoStats::default(),
        }
    }

    pub fn stats(&self) -> &IpoStats {
        &self.stats
    }

    fn has_back_edge(func: &Function) -> bool {
        let rpo = func.reverse_post_order();
        let order: HashMap<u32, usize> = rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        for block in &func.blocks {
            let Some(position) = order.get(&block.id) else {
                continue;
            };
            if let Some(term) = &block.terminator {
                for succ in term.successors() {
                    if order.get(&succ).is_some_and(|target| target <= position) {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn can_panic_locally(func: &Function) -> bool {
        for block in &func.blocks {
            for record in &block.instructions {
                match &record.inst {
                    // A pending bounds check can abort at runtime
                    Inst::GetElementPtr { bounds, .. } if bounds.needs_check => return true,
                    Inst::Call { callee, .. }
                        if callee == "panic" || callee == "abort" || callee == "unreachable" =>
                    {
                        return true;
                    }
                    _ => {}
                }
            }
        }
        false
    }

    fn analyze(
        func: &Function,
        known: &IndexMap<String, FnAttributes>,
        defined: &HashSet<String>,
    ) -> FnAttributes {
        let mut writes = false;
        let mut reads = false;
        let mut self_call = false;
        let mut callees_pure = true;
        let mut callees_readonly = true;
        let mut callees_nothrow = true;
        let mut callees_norecurse = true;
        let mut callees_willreturn = true;
        let mut has_unknown_effects = false;

        for block in &func.blocks {
            for record in &block.instructions {
                match &record.inst {
                    Inst::Store { .. }
                    | Inst::AtomicStore { .. }
                    | Inst::AtomicRmw { .. }
                    | Inst::AtomicCmpXchg { .. }
                    | Inst::Fence { .. } => writes = true,
                    Inst::Load { .. } | Inst::AtomicLoad { .. } => reads = true,
                    Inst::Await { .. } => has_unknown_effects = true,
                    Inst::MethodCall { .. } => has_unknown_effects = true,
                    Inst::Call { callee, .. } => {
                        if callee == &func.name {
                            self_call = true;
                        }
                        if callee.is_empty() || !defined.contains(callee) {
                            has_unknown_effects = true;
                            callees_norecurse = false;
                            callees_willreturn = false;
                            continue;
                        }
                        let attrs = known.get(callee).copied().unwrap_or_default();
                        callees_pure &= attrs.pure;
                        callees_readonly &= attrs.readonly;
                        callees_nothrow &= attrs.nothrow;
                        callees_norecurse &= attrs.norecurse;
                        callees_willreturn &= attrs.willreturn;
                    }
                    _ => {}
                }
            }
        }

        let loops = Self::has_back_edge(func);
        let panics = Self::can_panic_locally(func);

        let readonly = !writes && !has_unknown_effects && callees_readonly;
        let pure = readonly && !reads && callees_pure;
        let nothrow = !panics && !has_unknown_effects && callees_nothrow;
        let norecurse = !self_call && !has_unknown_effects && callees_norecurse;
        let willreturn = !loops && !self_call && !has_unknown_effects && callees_willreturn;

        FnAttributes {
            pure,
            nothrow,
            readonly,
            norecurse,
            willreturn,
            speculatable: pure && nothrow && willreturn,
            always_inline: func.attributes.always_inline,
        }
    }
}

impl Default for AttrInferencePass {
    fn default() -> Self {
        Self::new()
    }
}

impl ModulePass for AttrInferencePass {
    fn name(&self) -> &'static str {
        "attr_inference"
    }

    fn run(&mut self, module: &mut Module) -> bool {
        self.stats = IpoStats::default();

        let defined: HashSet<String> = module.functions.iter().map(|f| f.name.clone()).collect();

        // Start from the conservative bottom and re-analyze a few rounds;
        // facts only become true when the whole callee chain supports them,
        // so recursive cycles settle at the conservative answer
        let mut known: IndexMap<String, FnAttributes> = module
            .functions
            .iter()
            .map(|f| (f.name.clone(), FnAttributes::default()))
            .collect();

        for _ in 0..3 {
            let mut any_update = false;
            for func in &module.functions {
                let attrs = Self::analyze(func, &known, &defined);
                let slot = known.get_mut(&func.name).expect("seeded above");
                if *slot != attrs {
                    *slot = attrs;
                    any_update = true;
                }
            }
            if !any_update {
                break;
            }
        }

        let mut changed = false;
        for func in &mut module.functions {
            let attrs = known.get(&func.name).copied().unwrap_or_default();
            if func.attributes != attrs {
                func.attributes = attrs;
                changed = true;
            }
            if attrs.pure {
                self.stats.pure_functions_found += 1;
            }
            if attrs.nothrow {
                self.stats.nothrow_functions_found += 1;
            }
            if attrs.readonly {
                self.stats.readonly_functions_found += 1;
            }
        }

        tracing::debug!(
            pure = self.stats.pure_functions_found,
            readonly = self.stats.readonly_functions_found,
            "attribute inference finished"
        );
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::TypeRef;
    use super::super::{StructLayout, Terminator};
    use super::*;
    use std::rc::Rc;

    fn i64_ty() -> TypeRef {
        Rc::new(Type::I64)
    }

    fn record(inst: Inst, result: Option<Value>) -> InstructionRecord {
        InstructionRecord::new(inst, result, Span::default())
    }

    /// fn add_one(x: i64) -> i64 { x + 1 }
    fn add_one() -> Function {
        let mut f = Function::new(
            "add_one",
            vec![("x".to_string(), i64_ty())],
            i64_ty(),
            Span::default(),
        );
        let entry = f.add_block("entry");
        let x = f.param_value(0).unwrap();
        let one = f.fresh_value(i64_ty());
        f.push_inst(
            entry,
            record(
                Inst::ConstInt {
                    value: 1,
                    bits: 64,
                    signed: true,
                },
                Some(one.clone()),
            ),
        );
        let sum = f.fresh_value(i64_ty());
        f.push_inst(
            entry,
            record(
                Inst::Binary {
                    op: super::super::BinOp::Add,
                    lhs: x,
                    rhs: one,
                },
                Some(sum.clone()),
            ),
        );
        f.set_terminator(entry, Terminator::Return(Some(sum)));
        f
    }

    fn caller_passing_const(callee: &str, value: i128) -> Function {
        let mut f = Function::new("main", vec![], i64_ty(), Span::default());
        let entry = f.add_block("entry");
        let c = f.fresh_value(i64_ty());
        f.push_inst(
            entry,
            record(
                Inst::ConstInt {
                    value,
                    bits: 64,
                    signed: true,
                },
                Some(c.clone()),
            ),
        );
        let r = f.fresh_value(i64_ty());
        f.push_inst(
            entry,
            record(
                Inst::Call {
                    callee: callee.to_string(),
                    args: vec![c],
                },
                Some(r.clone()),
            ),
        );
        f.set_terminator(entry, Terminator::Return(Some(r)));
        f
    }

    #[test]
    fn test_ipcp_substitutes_uniform_constant() {
        let mut module = Module::new("test");
        module.functions.push(add_one());
        module.functions.push(caller_passing_const("add_one", 5));

        let mut pass = IpcpPass::new();
        assert!(pass.run(&mut module));
        assert_eq!(pass.stats().constants_propagated, 1);

        // The parameter's uses now read the materialized constant
        let callee = module.function("add_one").unwrap();
        let param_id = callee.params[0].value_id;
        let mut param_used = false;
        for block in &callee.blocks {
            for rec in &block.instructions {
                rec.inst.for_each_operand(|v| {
                    if v.id == param_id {
                        param_used = true;
                    }
                });
            }
        }
        assert!(!param_used);
        assert!(callee.verify().is_ok());
    }

    #[test]
    fn test_ipcp_skips_conflicting_constants() {
        let mut module = Module::new("test");
        module.functions.push(add_one());
        module.functions.push(caller_passing_const("add_one", 5));
        let mut second = caller_passing_const("add_one", 6);
        second.name = "other".to_string();
        module.functions.push(second);

        let mut pass = IpcpPass::new();
        assert!(!pass.run(&mut module));
        assert_eq!(pass.stats().constants_propagated, 0);
    }

    #[test]
    fn test_arg_promotion_small_ref_param() {
        let mut module = Module::new("test");
        module.structs.push(StructLayout {
            name: "Small".to_string(),
            fields: vec![("v".to_string(), i64_ty())],
            has_drop: false,
        });
        let small_ty: TypeRef = Rc::new(Type::Struct {
            name: "Small".to_string(),
            type_args: vec![],
        });
        let ref_ty: TypeRef = Rc::new(Type::Pointer {
            pointee: small_ty.clone(),
            is_mut: false,
        });

        // fn get(r: ref Small) -> Small { *r }
        let mut callee = Function::new(
            "get",
            vec![("r".to_string(), ref_ty.clone())],
            small_ty.clone(),
            Span::default(),
        );
        let entry = callee.add_block("entry");
        let r = callee.param_value(0).unwrap();
        let loaded = callee.fresh_value(small_ty.clone());
        callee.push_inst(
            entry,
            record(
                Inst::Load {
                    ptr: r,
                    volatile: false,
                },
                Some(loaded.clone()),
            ),
        );
        callee.set_terminator(entry, Terminator::Return(Some(loaded)));
        module.functions.push(callee);

        // caller: %p = alloca Small; call get(%p)
        let mut caller = Function::new("main", vec![], small_ty.clone(), Span::default());
        let entry = caller.add_block("entry");
        let slot = caller.fresh_value(ref_ty);
        caller.push_inst(
            entry,
            record(
                Inst::Alloca {
                    ty: small_ty.clone(),
                    name: "s".to_string(),
                },
                Some(slot.clone()),
            ),
        );
        let result = caller.fresh_value(small_ty);
        caller.push_inst(
            entry,
            record(
                Inst::Call {
                    callee: "get".to_string(),
                    args: vec![slot],
                },
                Some(result.clone()),
            ),
        );
        caller.set_terminator(entry, Terminator::Return(Some(result)));
        module.functions.push(caller);

        let mut pass = ArgPromotionPass::new();
        assert!(pass.run(&mut module));
        assert_eq!(pass.stats().args_promoted, 1);

        let callee = module.function("get").unwrap();
        assert!(matches!(&*callee.params[0].ty, Type::Struct { .. }));
        // The load through the parameter is gone
        assert!(callee.blocks[0].instructions.is_empty());

        // The caller loads before the call
        let caller = module.function("main").unwrap();
        let insts = &caller.blocks[0].instructions;
        assert!(matches!(insts[1].inst, Inst::Load { .. }));
        assert!(matches!(&insts[2].inst, Inst::Call { args, .. } if args.len() == 1));
        assert!(caller.verify().is_ok());
    }

    #[test]
    fn test_attr_inference_marks_pure_function() {
        let mut module = Module::new("test");
        module.functions.push(add_one());

        let mut pass = AttrInferencePass::new();
        assert!(pass.run(&mut module));

        let attrs = module.function("add_one").unwrap().attributes;
        assert!(attrs.pure);
        assert!(attrs.readonly);
        assert!(attrs.nothrow);
        assert!(attrs.norecurse);
        assert!(attrs.willreturn);
        assert!(attrs.speculatable);
    }

    #[test]
    fn test_attr_inference_conservative_on_recursion() {
        // fn spin(x: i64) -> i64 { spin(x) }
        let mut module = Module::new("test");
        let mut f = Function::new(
            "spin",
            vec![("x".to_string(), i64_ty())],
            i64_ty(),
            Span::default(),
        );
        let entry = f.add_block("entry");
        let x = f.param_value(0).unwrap();
        let r = f.fresh_value(i64_ty());
        f.push_inst(
            entry,
            record(
                Inst::Call {
                    callee: "spin".to_string(),
                    args: vec![x],
                },
                Some(r.clone()),
            ),
        );
        f.set_terminator(entry, Terminator::Return(Some(r)));
        module.functions.push(f);

        let mut pass = AttrInferencePass::new();
        pass.run(&mut module);

        let attrs = module.function("spin").unwrap().attributes;
        assert!(!attrs.norecurse);
        assert!(!attrs.willreturn);
        assert!(!attrs.speculatable);
    }

    #[test]
    fn test_attr_inference_store_blocks_readonly() {
        let mut module = Module::new("test");
        let ptr_ty: TypeRef = Rc::new(Type::Pointer {
            pointee: i64_ty(),
            is_mut: true,
        });
        let mut f = Function::new(
            "write",
            vec![("p".to_string(), ptr_ty)],
            Rc::new(Type::Unit),
            Span::default(),
        );
        let entry = f.add_block("entry");
        let p = f.param_value(0).unwrap();
        let v = f.fresh_value(i64_ty());
        f.push_inst(
            entry,
            record(
                Inst::ConstInt {
                    value: 1,
                    bits: 64,
                    signed: true,
                },
                Some(v.clone()),
            ),
        );
        f.push_inst(
            entry,
            record(
                Inst::Store {
                    ptr: p,
                    value: v,
                    volatile: false,
                },
                None,
            ),
        );
        f.set_terminator(entry, Terminator::Return(None));
        module.functions.push(f);

        let mut pass = AttrInferencePass::new();
        pass.run(&mut module);
        let attrs = module.function("write").unwrap().attributes;
        assert!(!attrs.readonly);
        assert!(!attrs.pure);
        // Writing through a pointer still cannot panic here
        assert!(attrs.nothrow);
    }
}
