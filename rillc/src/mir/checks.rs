//! Static analysis checks
//!
//! Two diagnostic passes that never transform IR:
//!
//! - [`MemoryLeakCheckPass`]: heap allocations that are neither freed,
//!   returned, stored, nor handed to an ownership-consuming function are
//!   reported as errors. Arena-scoped allocations are exempt.
//! - [`InfiniteLoopCheckPass`]: loops reachable from the entry with no
//!   exit edge and no return in their body are reported as errors.
//!
//! Both report through [`Diagnostic`]s; error severity is fatal to the
//! build (the driver aborts after `run()`).

use std::collections::{HashMap, HashSet};

use crate::error::Diagnostic;

use super::loops::find_loops;
use super::optimize::ModulePass;
use super::{Function, Inst, Module, Terminator, ValueId};

/// How an allocation's ownership left the function, if it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Leaked,
    Freed,
    Returned,
    Stored,
    Consumed,
}

fn is_heap_allocation(callee: &str) -> bool {
    callee == "malloc"
        || callee == "alloc"
        || callee.ends_with("_new")
        || callee.ends_with("_create")
}

fn is_arena_allocation(callee: &str) -> bool {
    callee.starts_with("arena_") || callee.contains("_arena_")
}

fn is_free_call(callee: &str) -> bool {
    callee == "free"
        || callee == "destroy"
        || callee == "drop"
        || callee.ends_with("_free")
        || callee.ends_with("_destroy")
        || callee.ends_with("_drop")
}

/// Callee names that take ownership of their arguments
fn consumes_ownership(callee: &str) -> bool {
    const PATTERNS: [&str; 7] = ["push", "add", "insert", "set_", "store", "take", "consume"];
    PATTERNS.iter().any(|p| callee.contains(p))
}

/// Memory-leak detection. Purely diagnostic; `run()` never reports a
/// change.
pub struct MemoryLeakCheckPass {
    diagnostics: Vec<Diagnostic>,
}

impl MemoryLeakCheckPass {
    pub fn new() -> Self {
        Self {
            diagnostics: Vec::new(),
        }
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.is_error())
    }

    fn analyze_function(&mut self, func: &Function) {
        // Allocation sites: value id -> (block name, callee)
        let mut allocations: HashMap<ValueId, (String, String)> = HashMap::new();
        for block in &func.blocks {
            for record in &block.instructions {
                if let Inst::Call { callee, .. } = &record.inst
                    && is_heap_allocation(callee)
                    && !is_arena_allocation(callee)
                    && let Some(result) = record.result_id()
                {
                    allocations.insert(result, (block.name.clone(), callee.clone()));
                }
            }
        }
        if allocations.is_empty() {
            return;
        }

        // Derived pointers inherit their base's ownership tracking
        let mut root_of: HashMap<ValueId, ValueId> = HashMap::new();
        for block in &func.blocks {
            for record in &block.instructions {
                if let Some(result) = record.result_id() {
                    match &record.inst {
                        Inst::GetElementPtr { base, .. } | Inst::Cast { operand: base, .. } => {
                            let root = root_of.get(&base.id).copied().unwrap_or(base.id);
                            root_of.insert(result, root);
                        }
                        _ => {}
                    }
                }
            }
        }
        fn root(map: &HashMap<ValueId, ValueId>, id: ValueId) -> ValueId {
            map.get(&id).copied().unwrap_or(id)
        }

        let mut ownership: HashMap<ValueId, Ownership> = allocations
            .keys()
            .map(|&id| (id, Ownership::Leaked))
            .collect();
        let mut settle = |id: ValueId, how: Ownership, ownership: &mut HashMap<ValueId, Ownership>| {
            if let Some(state) = ownership.get_mut(&id)
                && *state == Ownership::Leaked
            {
                *state = how;
            }
        };

        // Allocations dereferenced locally degrade to warnings; the
        // pointer's contents were at least used before being lost
        let mut dereferenced: HashSet<ValueId> = HashSet::new();

        for block in &func.blocks {
            for record in &block.instructions {
                match &record.inst {
                    Inst::Call { callee, args } => {
                        if is_free_call(callee) {
                            for arg in args {
                                settle(root(&root_of, arg.id), Ownership::Freed, &mut ownership);
                            }
                        } else if consumes_ownership(callee) {
                            for arg in args {
                                settle(root(&root_of, arg.id), Ownership::Consumed, &mut ownership);
                            }
                        }
                    }
                    Inst::MethodCall { method, receiver, args, .. } => {
                        if is_free_call(method) {
                            settle(root(&root_of, receiver.id), Ownership::Freed, &mut ownership);
                        } else if consumes_ownership(method) {
                            for arg in args {
                                settle(root(&root_of, arg.id), Ownership::Consumed, &mut ownership);
                            }
                        }
                    }
                    // Storing the pointer transfers it to the pointee's owner;
                    // storing *through* it only counts as a use
                    Inst::Store { ptr, value, .. } => {
                        settle(root(&root_of, value.id), Ownership::Stored, &mut ownership);
                        dereferenced.insert(root(&root_of, ptr.id));
                    }
                    Inst::Load { ptr, .. } => {
                        dereferenced.insert(root(&root_of, ptr.id));
                    }
                    Inst::StructInit { fields, .. } => {
                        for field in fields {
                            settle(root(&root_of, field.id), Ownership::Stored, &mut ownership);
                        }
                    }
                    Inst::InsertValue { value, .. } => {
                        settle(root(&root_of, value.id), Ownership::Stored, &mut ownership);
                    }
                    Inst::Phi { incomings } => {
                        // A phi forwards ownership to its result
                        if let Some(result) = record.result_id() {
                            let forwarded: Vec<ValueId> = incomings
                                .iter()
                                .map(|(value, _)| root(&root_of, value.id))
                                .filter(|id| ownership.contains_key(id))
                                .collect();
                            if let Some(source) = forwarded.first() {
                                root_of.insert(result, *source);
                            }
                        }
                    }
                    _ => {}
                }
            }
            if let Some(Terminator::Return(Some(value))) = &block.terminator {
                settle(root(&root_of, value.id), Ownership::Returned, &mut ownership);
            }
        }

        let mut leaks: Vec<ValueId> = ownership
            .iter()
            .filter(|(_, state)| **state == Ownership::Leaked)
            .map(|(id, _)| *id)
            .collect();
        leaks.sort_unstable();
        for id in leaks {
            let (block_name, callee) = &allocations[&id];
            let message = format!(
                "allocation `%{id}` from `{callee}` is never freed, returned, stored, or consumed"
            );
            if dereferenced.contains(&id) {
                self.diagnostics.push(Diagnostic::warning(
                    "memory-leak-check",
                    &func.name,
                    block_name,
                    message,
                ));
            } else {
                self.diagnostics.push(Diagnostic::error(
                    "memory-leak-check",
                    &func.name,
                    block_name,
                    message,
                ));
            }
        }
    }
}

impl Default for MemoryLeakCheckPass {
    fn default() -> Self {
        Self::new()
    }
}

impl ModulePass for MemoryLeakCheckPass {
    fn name(&self) -> &'static str {
        "memory-leak-check"
    }

    fn run(&mut self, module: &mut Module) -> bool {
        self.diagnostics.clear();
        for func in &module.functions {
            self.analyze_function(func);
        }
        false
    }

    fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.clone()
    }
}

/// Infinite-loop detection
pub struct InfiniteLoopCheckPass {
    diagnostics: Vec<Diagnostic>,
}

impl InfiniteLoopCheckPass {
    pub fn new() -> Self {
        Self {
            diagnostics: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.is_error())
    }

    /// Successors that can actually be taken: a conditional branch on a
    /// constant only ever goes one way
    fn effective_successors(func: &Function, term: &Terminator) -> Vec<u32> {
        if let Terminator::CondBranch {
            cond,
            then_block,
            else_block,
        } = term
        {
            let cond_const = func.blocks.iter().flat_map(|b| &b.instructions).find_map(|r| {
                if r.result_id() == Some(cond.id) {
                    match &r.inst {
                        Inst::ConstBool { value } => Some(*value),
                        _ => None,
                    }
                } else {
                    None
                }
            });
            match cond_const {
                Some(true) => return vec![*then_block],
                Some(false) => return vec![*else_block],
                None => {}
            }
        }
        term.successors().to_vec()
    }

    fn analyze_function(&mut self, func: &Function) {
        let reachable = func.reachable_blocks();
        for loop_info in find_loops(func) {
            if !reachable.contains(&loop_info.header) {
                continue;
            }

            let mut has_exit = false;
            for block in &func.blocks {
                if !loop_info.body_blocks.contains(&block.id) {
                    continue;
                }
                let Some(term) = &block.terminator else {
                    continue;
                };
                if matches!(term, Terminator::Return(_)) {
                    has_exit = true;
                    break;
                }
                for succ in Self::effective_successors(func, term) {
                    if !loop_info.body_blocks.contains(&succ) {
                        has_exit = true;
                        break;
                    }
                }
                if has_exit {
                    break;
                }
            }

            if !has_exit {
                let header_name = func
                    .block(loop_info.header)
                    .map(|b| b.name.clone())
                    .unwrap_or_default();
                self.diagnostics.push(Diagnostic::error(
                    "infinite-loop-check",
                    &func.name,
                    &header_name,
                    "loop has no reachable exit; it can never terminate",
                ));
            }
        }
    }
}

impl Default for InfiniteLoopCheckPass {
    fn default() -> Self {
        Self::new()
    }
}

impl ModulePass for InfiniteLoopCheckPass {
    fn name(&self) -> &'static str {
        "infinite-loop-check"
    }

    fn run(&mut self, module: &mut Module) -> bool {
        self.diagnostics.clear();
        for func in &module.functions {
            self.analyze_function(func);
        }
        false
    }

    fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{Type, TypeRef};
    use super::super::{InstructionRecord, Value};
    use super::*;
    use crate::tir::Span;
    use std::rc::Rc;

    fn ptr_ty() -> TypeRef {
        Rc::new(Type::Ptr)
    }

    fn record(inst: Inst, result: Option<Value>) -> InstructionRecord {
        InstructionRecord::new(inst, result, Span::default())
    }

    fn alloc_into(func: &mut Function, block: u32) -> Value {
        let size = func.fresh_value(Rc::new(Type::I64));
        func.push_inst(
            block,
            record(
                Inst::ConstInt {
                    value: 16,
                    bits: 64,
                    signed: true,
                },
                Some(size.clone()),
            ),
        );
        let ptr = func.fresh_value(ptr_ty());
        func.push_inst(
            block,
            record(
                Inst::Call {
                    callee: "alloc".to_string(),
                    args: vec![size],
                },
                Some(ptr.clone()),
            ),
        );
        ptr
    }

    #[test]
    fn test_leak_reported_with_location() {
        let mut module = Module::new("test");
        let mut f = Function::new("leaky", vec![], Rc::new(Type::Unit), Span::default());
        let entry = f.add_block("entry");
        let _ptr = alloc_into(&mut f, entry);
        f.set_terminator(entry, Terminator::Return(None));
        module.functions.push(f);

        let mut pass = MemoryLeakCheckPass::new();
        pass.run(&mut module);
        assert!(pass.has_errors());
        let diags = pass.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].function, "leaky");
        assert_eq!(diags[0].block, "entry");
    }

    #[test]
    fn test_dereferenced_leak_is_warning_only() {
        let mut module = Module::new("test");
        let mut f = Function::new("uses_it", vec![], Rc::new(Type::I64), Span::default());
        let entry = f.add_block("entry");
        let ptr = alloc_into(&mut f, entry);
        let loaded = f.fresh_value(Rc::new(Type::I64));
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
        module.functions.push(f);

        let mut pass = MemoryLeakCheckPass::new();
        pass.run(&mut module);
        assert!(!pass.has_errors());
        assert_eq!(pass.diagnostics().len(), 1);
        assert!(!pass.diagnostics()[0].is_error());
    }

    #[test]
    fn test_freed_allocation_is_clean() {
        let mut module = Module::new("test");
        let mut f = Function::new("tidy", vec![], Rc::new(Type::Unit), Span::default());
        let entry = f.add_block("entry");
        let ptr = alloc_into(&mut f, entry);
        let unit = f.fresh_value(Rc::new(Type::Unit));
        f.push_inst(
            entry,
            record(
                Inst::Call {
                    callee: "free".to_string(),
                    args: vec![ptr],
                },
                Some(unit),
            ),
        );
        f.set_terminator(entry, Terminator::Return(None));
        module.functions.push(f);

        let mut pass = MemoryLeakCheckPass::new();
        pass.run(&mut module);
        assert!(!pass.has_errors());
    }

    #[test]
    fn test_returned_allocation_is_clean() {
        let mut module = Module::new("test");
        let mut f = Function::new("giver", vec![], ptr_ty(), Span::default());
        let entry = f.add_block("entry");
        let ptr = alloc_into(&mut f, entry);
        f.set_terminator(entry, Terminator::Return(Some(ptr)));
        module.functions.push(f);

        let mut pass = MemoryLeakCheckPass::new();
        pass.run(&mut module);
        assert!(!pass.has_errors());
    }

    #[test]
    fn test_consumed_allocation_is_clean() {
        let mut module = Module::new("test");
        let mut f = Function::new("feeder", vec![], Rc::new(Type::Unit), Span::default());
        let entry = f.add_block("entry");
        let ptr = alloc_into(&mut f, entry);
        let unit = f.fresh_value(Rc::new(Type::Unit));
        f.push_inst(
            entry,
            record(
                Inst::Call {
                    callee: "list_push".to_string(),
                    args: vec![ptr],
                },
                Some(unit),
            ),
        );
        f.set_terminator(entry, Terminator::Return(None));
        module.functions.push(f);

        let mut pass = MemoryLeakCheckPass::new();
        pass.run(&mut module);
        assert!(!pass.has_errors());
    }

    #[test]
    fn test_arena_allocation_is_exempt() {
        let mut module = Module::new("test");
        let mut f = Function::new("scoped", vec![], Rc::new(Type::Unit), Span::default());
        let entry = f.add_block("entry");
        let ptr = f.fresh_value(ptr_ty());
        f.push_inst(
            entry,
            record(
                Inst::Call {
                    callee: "arena_alloc".to_string(),
                    args: vec![],
                },
                Some(ptr),
            ),
        );
        f.set_terminator(entry, Terminator::Return(None));
        module.functions.push(f);

        let mut pass = MemoryLeakCheckPass::new();
        pass.run(&mut module);
        assert!(!pass.has_errors());
    }

    #[test]
    fn test_infinite_loop_flagged() {
        // entry -> header; header -> body; body -> header (no exit)
        let mut module = Module::new("test");
        let mut f = Function::new("spin", vec![], Rc::new(Type::Unit), Span::default());
        let entry = f.add_block("entry");
        let header = f.add_block("loop_header");
        let body = f.add_block("loop_body");
        f.set_terminator(entry, Terminator::Branch(header));
        f.set_terminator(header, Terminator::Branch(body));
        f.set_terminator(body, Terminator::Branch(header));
        module.functions.push(f);

        let mut pass = InfiniteLoopCheckPass::new();
        pass.run(&mut module);
        assert!(pass.has_errors());
        let diags = pass.diagnostics();
        assert_eq!(diags[0].function, "spin");
        assert_eq!(diags[0].block, "loop_header");
    }

    #[test]
    fn test_loop_with_exit_not_flagged() {
        let mut module = Module::new("test");
        let mut f = Function::new(
            "bounded",
            vec![("go".to_string(), Rc::new(Type::Bool))],
            Rc::new(Type::Unit),
            Span::default(),
        );
        let entry = f.add_block("entry");
        let header = f.add_block("header");
        let exit = f.add_block("exit");
        let cond = f.param_value(0).unwrap();
        f.set_terminator(entry, Terminator::Branch(header));
        f.set_terminator(
            header,
            Terminator::CondBranch {
                cond,
                then_block: header,
                else_block: exit,
            },
        );
        f.set_terminator(exit, Terminator::Return(None));
        module.functions.push(f);

        let mut pass = InfiniteLoopCheckPass::new();
        pass.run(&mut module);
        assert!(!pass.has_errors());
    }

    #[test]
    fn test_const_true_guard_is_infinite() {
        // while true {} with no break
        let mut module = Module::new("test");
        let mut f = Function::new("forever", vec![], Rc::new(Type::Unit), Span::default());
        let entry = f.add_block("entry");
        let header = f.add_block("header");
        let exit = f.add_block("exit");
        let cond = f.fresh_value(Rc::new(Type::Bool));
        f.push_inst(
            entry,
            record(Inst::ConstBool { value: true }, Some(cond.clone())),
        );
        f.set_terminator(entry, Terminator::Branch(header));
        f.set_terminator(
            header,
            Terminator::CondBranch {
                cond,
                then_block: header,
                else_block: exit,
            },
        );
        f.set_terminator(exit, Terminator::Return(None));
        module.functions.push(f);

        let mut pass = InfiniteLoopCheckPass::new();
        pass.run(&mut module);
        assert!(pass.has_errors());
    }
}
