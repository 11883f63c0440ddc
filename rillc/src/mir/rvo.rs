//! Return-value optimization and sret conversion
//!
//! Two cooperating passes:
//!
//! - [`RvoPass`] (per function): when every return site returns the same
//!   non-parameter local, that local is earmarked as the named return value
//!   (`return_slot`). The back-end then constructs it directly in the
//!   caller's return storage.
//! - [`SretConversionPass`] (whole module, runs after all inlining): large
//!   returns switch to the sret calling convention - a hidden first
//!   parameter pointing at caller-allocated storage. The original return
//!   type is preserved on the function so the back-end can emit the
//!   `sret` attribute, and every call site is rewritten to allocate a
//!   temporary, pass its address, and load the result back.

use std::rc::Rc;

use crate::tir::Span;

use super::optimize::{FunctionPass, ModulePass};
use super::types::Type;
use super::{Function, Inst, InstructionRecord, Module, Terminator, Value};

/// A return site in a function
#[derive(Debug, Clone)]
struct ReturnInfo {
    value: Value,
}

/// Statistics for return-value optimization
#[derive(Debug, Default, Clone)]
pub struct RvoStats {
    pub functions_analyzed: usize,
    pub nrvo_applied: usize,
    pub sret_conversions: usize,
    pub multiple_returns_unified: usize,
}

/// Named return-value optimization: earmark the single returned local
pub struct RvoPass {
    stats: RvoStats,
}

impl RvoPass {
    pub fn new() -> Self {
        Self {
            stats: RvoStats::default(),
        }
    }

    pub fn stats(&self) -> &RvoStats {
        &self.stats
    }

    fn find_returns(func: &Function) -> Vec<ReturnInfo> {
        let mut returns = Vec::new();
        for block in &func.blocks {
            if let Some(Terminator::Return(Some(value))) = &block.terminator {
                returns.push(ReturnInfo {
                    value: value.clone(),
                });
            }
        }
        returns
    }

    /// All returns name the same non-parameter local
    fn all_returns_same_local(func: &Function, returns: &[ReturnInfo]) -> Option<Value> {
        let first = returns.first()?;
        if func.is_param(first.value.id) {
            return None;
        }
        returns
            .iter()
            .all(|r| r.value.id == first.value.id)
            .then(|| first.value.clone())
    }
}

impl Default for RvoPass {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionPass for RvoPass {
    fn name(&self) -> &'static str {
        "rvo"
    }

    fn run_on_function(&mut self, func: &mut Function) -> bool {
        self.stats.functions_analyzed += 1;

        // Only aggregate returns benefit from a named return slot
        if !matches!(
            &*func.ret_ty,
            Type::Struct { .. } | Type::Enum { .. } | Type::Tuple(_) | Type::Array { .. }
        ) {
            return false;
        }

        let returns = Self::find_returns(func);
        if returns.is_empty() {
            return false;
        }
        let Some(local) = Self::all_returns_same_local(func, &returns) else {
            return false;
        };
        if func.return_slot == Some(local.id) {
            return false;
        }

        func.return_slot = Some(local.id);
        self.stats.nrvo_applied += 1;
        if returns.len() > 1 {
            self.stats.multiple_returns_unified += 1;
        }
        tracing::debug!(
            function = func.name.as_str(),
            local = local.id,
            "named return value earmarked"
        );
        true
    }
}

/// Sret conversion: hidden return-pointer parameter for large returns.
///
/// Must run after all inlining; inlined bodies of converted functions
/// would otherwise reference the hidden parameter of the wrong frame.
pub struct SretConversionPass {
    /// Returns larger than this many bytes use the hidden pointer
    threshold: u64,
    conversions: usize,
}

impl SretConversionPass {
    pub fn new() -> Self {
        Self {
            threshold: 8,
            conversions: 0,
        }
    }

    pub fn with_threshold(threshold: u64) -> Self {
        Self {
            threshold,
            conversions: 0,
        }
    }

    pub fn conversions(&self) -> usize {
        self.conversions
    }

    fn should_convert(&self, module: &Module, func: &Function) -> bool {
        if func.uses_sret || func.ret_ty.is_unit() {
            return false;
        }
        module.size_of_type(&func.ret_ty) > self.threshold
    }

    /// Rewrite the function itself: unit return type, hidden pointer
    /// parameter first, stores into it at every return site
    fn convert_function(func: &mut Function) {
        let original_ret = func.ret_ty.clone();
        let sret_ptr_ty = Rc::new(Type::Pointer {
            pointee: original_ret.clone(),
            is_mut: true,
        });
        let sret_value = func.fresh_value(sret_ptr_ty.clone());

        func.params.insert(
            0,
            super::Param {
                name: "sret.ret".to_string(),
                ty: sret_ptr_ty,
                value_id: sret_value.id,
            },
        );

        for block in &mut func.blocks {
            if let Some(Terminator::Return(Some(value))) = block.terminator.clone() {
                block.instructions.push(InstructionRecord::new(
                    Inst::Store {
                        ptr: sret_value.clone(),
                        value,
                        volatile: false,
                    },
                    None,
                    Span::default(),
                ));
                block.terminator = Some(Terminator::Return(None));
            }
        }

        func.original_ret_ty = Some(original_ret);
        func.ret_ty = Rc::new(Type::Unit);
        func.uses_sret = true;
        func.invalidate_analyses();
    }

    /// Rewrite call sites: allocate a temporary, pass its address first,
    /// and reload the value under the call's original result id
    fn rewrite_call_sites(func: &mut Function, callee: &str, result_ty_of_callee: &Type) {
        for block_index in 0..func.blocks.len() {
            let mut inst_index = 0;
            while inst_index < func.blocks[block_index].instructions.len() {
                let matched = {
                    let record = &func.blocks[block_index].instructions[inst_index];
                    matches!(
                        &record.inst,
                        Inst::Call { callee: c, .. } if c == callee
                    ) && record.result.is_some()
                };
                if !matched {
                    inst_index += 1;
                    continue;
                }

                let record = func.blocks[block_index].instructions[inst_index].clone();
                let Inst::Call { callee, args } = record.inst else {
                    unreachable!()
                };
                let result = record.result.expect("checked above");

                let ret_ty: Rc<Type> = Rc::new(result_ty_of_callee.clone());
                let tmp_ptr_ty = Rc::new(Type::Pointer {
                    pointee: ret_ty.clone(),
                    is_mut: true,
                });
                let tmp = func.fresh_value(tmp_ptr_ty);

                let mut new_args = Vec::with_capacity(args.len() + 1);
                new_args.push(tmp.clone());
                new_args.extend(args);

                let replacement = [
                    InstructionRecord::new(
                        Inst::Alloca {
                            ty: ret_ty,
                            name: format!("sret.tmp{}", tmp.id),
                        },
                        Some(tmp.clone()),
                        record.span,
                    ),
                    InstructionRecord::new(
                        Inst::Call {
                            callee,
                            args: new_args,
                        },
                        None,
                        record.span,
                    ),
                    // Same result id: downstream uses stay valid
                    InstructionRecord::new(
                        Inst::Load {
                            ptr: tmp,
                            volatile: false,
                        },
                        Some(result),
                        record.span,
                    ),
                ];

                let block = &mut func.blocks[block_index];
                block.instructions.remove(inst_index);
                for (offset, rec) in replacement.into_iter().enumerate() {
                    block.instructions.insert(inst_index + offset, rec);
                }
                inst_index += 3;
            }
        }
        func.invalidate_analyses();
    }
}

impl Default for SretConversionPass {
    fn default() -> Self {
        Self::new()
    }
}

impl ModulePass for SretConversionPass {
    fn name(&self) -> &'static str {
        "sret_conversion"
    }

    fn run(&mut self, module: &mut Module) -> bool {
        self.conversions = 0;

        let convert: Vec<(String, Type)> = module
            .functions
            .iter()
            .filter(|f| self.should_convert(module, f))
            .map(|f| (f.name.clone(), (*f.ret_ty).clone()))
            .collect();
        if convert.is_empty() {
            return false;
        }

        for (name, _) in &convert {
            if let Some(func) = module.function_mut(name) {
                Self::convert_function(func);
                self.conversions += 1;
            }
        }
        for func in &mut module.functions {
            for (name, ret_ty) in &convert {
                Self::rewrite_call_sites(func, name, ret_ty);
            }
        }

        tracing::debug!(conversions = self.conversions, "sret conversion finished");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::TypeRef;
    use super::super::StructLayout;
    use super::*;
    use std::rc::Rc;

    fn i64_ty() -> TypeRef {
        Rc::new(Type::I64)
    }

    fn pair_ty() -> TypeRef {
        Rc::new(Type::Struct {
            name: "Pair".to_string(),
            type_args: vec![],
        })
    }

    fn pair_module_layout(module: &mut Module) {
        module.structs.push(StructLayout {
            name: "Pair".to_string(),
            fields: vec![
                ("x".to_string(), i64_ty()),
                ("y".to_string(), i64_ty()),
            ],
            has_drop: false,
        });
    }

    /// fn make_pair(flag: bool) -> Pair with two returns of the same local
    fn make_pair() -> Function {
        let mut f = Function::new(
            "make_pair",
            vec![("flag".to_string(), Rc::new(Type::Bool))],
            pair_ty(),
            Span::default(),
        );
        let entry = f.add_block("entry");
        let then_b = f.add_block("then");
        let else_b = f.add_block("else");

        let x = f.fresh_value(i64_ty());
        f.push_inst(
            entry,
            InstructionRecord::new(
                Inst::ConstInt {
                    value: 1,
                    bits: 64,
                    signed: true,
                },
                Some(x.clone()),
                Span::default(),
            ),
        );
        let y = f.fresh_value(i64_ty());
        f.push_inst(
            entry,
            InstructionRecord::new(
                Inst::ConstInt {
                    value: 2,
                    bits: 64,
                    signed: true,
                },
                Some(y.clone()),
                Span::default(),
            ),
        );
        let pair = f.fresh_value(pair_ty());
        f.push_inst(
            entry,
            InstructionRecord::new(
                Inst::StructInit {
                    name: "Pair".to_string(),
                    fields: vec![x, y],
                },
                Some(pair.clone()),
                Span::default(),
            ),
        );
        let flag = f.param_value(0).unwrap();
        f.set_terminator(
            entry,
            Terminator::CondBranch {
                cond: flag,
                then_block: then_b,
                else_block: else_b,
            },
        );
        f.set_terminator(then_b, Terminator::Return(Some(pair.clone())));
        f.set_terminator(else_b, Terminator::Return(Some(pair)));
        f
    }

    #[test]
    fn test_rvo_earmarks_common_local() {
        let mut f = make_pair();
        let mut pass = RvoPass::new();
        assert!(pass.run_on_function(&mut f));
        assert!(f.return_slot.is_some());
        assert_eq!(pass.stats().nrvo_applied, 1);
        assert_eq!(pass.stats().multiple_returns_unified, 1);

        // Second run: already earmarked
        let mut second = RvoPass::new();
        assert!(!second.run_on_function(&mut f));
    }

    #[test]
    fn test_rvo_rejects_parameter_return() {
        let mut f = Function::new(
            "identity",
            vec![("p".to_string(), pair_ty())],
            pair_ty(),
            Span::default(),
        );
        let entry = f.add_block("entry");
        let p = f.param_value(0).unwrap();
        f.set_terminator(entry, Terminator::Return(Some(p)));

        let mut pass = RvoPass::new();
        assert!(!pass.run_on_function(&mut f));
        assert!(f.return_slot.is_none());
    }

    #[test]
    fn test_sret_converts_large_return() {
        let mut module = Module::new("test");
        pair_module_layout(&mut module);
        module.functions.push(make_pair());

        // caller: %r = call make_pair(%flag)
        let mut caller = Function::new(
            "use_pair",
            vec![("flag".to_string(), Rc::new(Type::Bool))],
            Rc::new(Type::Unit),
            Span::default(),
        );
        let entry = caller.add_block("entry");
        let flag = caller.param_value(0).unwrap();
        let result = caller.fresh_value(pair_ty());
        caller.push_inst(
            entry,
            InstructionRecord::new(
                Inst::Call {
                    callee: "make_pair".to_string(),
                    args: vec![flag],
                },
                Some(result.clone()),
                Span::default(),
            ),
        );
        caller.set_terminator(entry, Terminator::Return(None));
        module.functions.push(caller);

        let mut pass = SretConversionPass::new();
        assert!(pass.run(&mut module));
        assert_eq!(pass.conversions(), 1);

        let converted = module.function("make_pair").unwrap();
        assert!(converted.uses_sret);
        assert!(converted.ret_ty.is_unit());
        assert_eq!(
            converted.original_ret_ty.as_deref(),
            Some(&*pair_ty())
        );
        // Hidden pointer parameter comes first
        assert!(matches!(
            &*converted.params[0].ty,
            Type::Pointer { .. }
        ));
        // Every return is now `ret` preceded by a store
        for block in &converted.blocks {
            if let Some(Terminator::Return(v)) = &block.terminator {
                assert!(v.is_none());
                assert!(block
                    .instructions
                    .last()
                    .is_some_and(|r| matches!(r.inst, Inst::Store { .. })));
            }
        }

        // Caller passes a temporary pointer and loads the result back
        let caller = module.function("use_pair").unwrap();
        let insts = &caller.blocks[0].instructions;
        assert!(matches!(insts[0].inst, Inst::Alloca { .. }));
        assert!(
            matches!(&insts[1].inst, Inst::Call { callee, args } if callee == "make_pair" && args.len() == 2)
        );
        assert!(matches!(insts[2].inst, Inst::Load { .. }));
        assert!(caller.verify().is_ok());

        // Second run: nothing left to convert
        let mut second = SretConversionPass::new();
        assert!(!second.run(&mut module));
    }

    #[test]
    fn test_sret_skips_small_return() {
        let mut module = Module::new("test");
        let mut f = Function::new("small", vec![], i64_ty(), Span::default());
        let entry = f.add_block("entry");
        let v = f.fresh_value(i64_ty());
        f.push_inst(
            entry,
            InstructionRecord::new(
                Inst::ConstInt {
                    value: 3,
                    bits: 64,
                    signed: true,
                },
                Some(v.clone()),
                Span::default(),
            ),
        );
        f.set_terminator(entry, Terminator::Return(Some(v)));
        module.functions.push(f);

        let mut pass = SretConversionPass::new();
        assert!(!pass.run(&mut module));
        assert!(!module.function("small").unwrap().uses_sret);
    }
}
