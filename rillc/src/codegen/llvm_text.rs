//! Text-based LLVM IR generation
//!
//! Generates LLVM IR as text (`.ll`) that can be compiled with clang or
//! llc, without linking against the LLVM API. Used by the partitioner:
//! each codegen unit gets full `define`s for its own functions and
//! `declare` stubs for everything else, plus the struct/enum type
//! declarations and string-literal globals the unit references.
//!
//! Constants are inlined into operands; checked element accesses emit an
//! explicit bounds test branching to a shared panic label, and accesses
//! proven safe emit an `llvm.assume` predicate instead.

use std::fmt::Write;

use indexmap::IndexMap;
use thiserror::Error;

use crate::mir::types::Type;
use crate::mir::{
    AtomicOrdering, BasicBlock, BinOp, CastKind, Function, Inst, InstructionRecord, Module,
    RmwOp, Terminator, UnaryOp, Value, ValueId,
};

/// Text code generation error
#[derive(Debug, Error)]
pub enum TextCodeGenError {
    #[error("Formatting error: {0}")]
    Format(#[from] std::fmt::Error),
}

pub type TextCodeGenResult<T> = Result<T, TextCodeGenError>;

/// Text-based LLVM IR generator
pub struct TextCodeGen {
    target_triple: String,
}

impl TextCodeGen {
    pub fn new() -> Self {
        Self {
            target_triple: Self::default_target_triple().to_string(),
        }
    }

    pub fn with_target(target: impl Into<String>) -> Self {
        Self {
            target_triple: target.into(),
        }
    }

    fn default_target_triple() -> &'static str {
        #[cfg(target_os = "windows")]
        {
            "x86_64-pc-windows-msvc"
        }
        #[cfg(target_os = "macos")]
        {
            "x86_64-apple-darwin"
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            "x86_64-unknown-linux-gnu"
        }
    }

    /// Generate IR for the whole module (the monolithic single-CGU path)
    pub fn generate(&self, module: &Module) -> TextCodeGenResult<String> {
        let indices: Vec<usize> = (0..module.functions.len()).collect();
        self.generate_cgu(module, &indices)
    }

    /// Generate IR for one codegen unit: definitions for the listed
    /// functions, declarations for every other callee
    pub fn generate_cgu(&self, module: &Module, func_indices: &[usize]) -> TextCodeGenResult<String> {
        let mut out = String::new();
        writeln!(out, "; ModuleID = '{}'", module.name)?;
        writeln!(out, "target triple = \"{}\"", self.target_triple)?;
        writeln!(out)?;

        self.emit_type_declarations(&mut out, module)?;

        let string_table = collect_strings(module, func_indices);
        self.emit_string_globals(&mut out, &string_table)?;

        self.emit_declarations(&mut out, module, func_indices)?;

        for &index in func_indices {
            let func = &module.functions[index];
            self.emit_function(&mut out, module, func, &string_table)?;
            writeln!(out)?;
        }

        Ok(out)
    }

    fn emit_type_declarations(&self, out: &mut String, module: &Module) -> TextCodeGenResult<()> {
        for def in &module.structs {
            let fields: Vec<String> = def
                .fields
                .iter()
                .map(|(_, ty)| llvm_type(ty))
                .collect();
            writeln!(out, "%struct.{} = type {{ {} }}", def.name, fields.join(", "))?;
        }
        // Enums lower as a discriminant plus one payload slot
        for def in &module.enums {
            writeln!(out, "%struct.{} = type {{ i64, i64 }}", def.name)?;
        }
        if !module.structs.is_empty() || !module.enums.is_empty() {
            writeln!(out)?;
        }
        Ok(())
    }

    fn emit_string_globals(
        &self,
        out: &mut String,
        table: &IndexMap<String, usize>,
    ) -> TextCodeGenResult<()> {
        for (text, index) in table {
            let escaped = escape_string(text);
            writeln!(
                out,
                "@.str.{} = private unnamed_addr constant [{} x i8] c\"{}\\00\"",
                index,
                text.len() + 1,
                escaped
            )?;
        }
        if !table.is_empty() {
            writeln!(out)?;
        }
        Ok(())
    }

    /// Declare every callee not defined in this unit, with the signature
    /// observed at its call sites
    fn emit_declarations(
        &self,
        out: &mut String,
        module: &Module,
        func_indices: &[usize],
    ) -> TextCodeGenResult<()> {
        let defined: Vec<&str> = func_indices
            .iter()
            .map(|&i| module.functions[i].name.as_str())
            .collect();

        let mut declares: IndexMap<String, String> = IndexMap::new();
        for &index in func_indices {
            let func = &module.functions[index];
            let mut note = |name: &str, ret: &str, args: Vec<String>| {
                if name.is_empty() || defined.contains(&name) || declares.contains_key(name) {
                    return;
                }
                declares.insert(
                    name.to_string(),
                    format!("declare {} @{}({})", ret, sanitize(name), args.join(", ")),
                );
            };
            for block in &func.blocks {
                for record in &block.instructions {
                    match &record.inst {
                        Inst::Call { callee, args } => {
                            // Calls into sret-converted functions keep the
                            // attribute on the hidden parameter
                            let (ret, arg_tys) =
                                if let Some(target) = module.function(callee) {
                                    let mut tys: Vec<String> = Vec::new();
                                    for (i, param) in target.params.iter().enumerate() {
                                        if i == 0 && target.uses_sret {
                                            let original = target
                                                .original_ret_ty
                                                .as_ref()
                                                .map(|t| llvm_type(t))
                                                .unwrap_or_else(|| "i8".to_string());
                                            tys.push(format!("ptr sret({original})"));
                                        } else {
                                            tys.push(llvm_type(&param.ty));
                                        }
                                    }
                                    (llvm_type(&target.ret_ty), tys)
                                } else {
                                    let ret = record
                                        .result
                                        .as_ref()
                                        .map(|r| llvm_type(&r.ty))
                                        .unwrap_or_else(|| "void".to_string());
                                    (ret, args.iter().map(|a| llvm_type(&a.ty)).collect())
                                };
                            note(callee, &ret, arg_tys);
                        }
                        Inst::MethodCall {
                            receiver,
                            type_name,
                            method,
                            args,
                        } => {
                            let name = format!("{type_name}_{method}");
                            let ret = record
                                .result
                                .as_ref()
                                .map(|r| llvm_type(&r.ty))
                                .unwrap_or_else(|| "void".to_string());
                            let mut tys = vec![llvm_type(&receiver.ty)];
                            tys.extend(args.iter().map(|a| llvm_type(&a.ty)));
                            note(&name, &ret, tys);
                        }
                        Inst::ClosureInit { func_name, .. } => {
                            note(func_name, "void", vec!["ptr".to_string()]);
                        }
                        _ => {}
                    }
                }
            }
        }

        writeln!(out, "declare void @rill_panic_bounds()")?;
        writeln!(out, "declare void @llvm.assume(i1)")?;
        for (_, decl) in &declares {
            writeln!(out, "{decl}")?;
        }
        writeln!(out)?;
        Ok(())
    }

    fn emit_function(
        &self,
        out: &mut String,
        module: &Module,
        func: &Function,
        strings: &IndexMap<String, usize>,
    ) -> TextCodeGenResult<()> {
        let consts = collect_consts(func, strings);
        let operand = |v: &Value| -> String {
            match consts.get(&v.id) {
                Some(text) => text.clone(),
                None => format!("%v{}", v.id),
            }
        };

        // Header
        let params: Vec<String> = func
            .params
            .iter()
            .enumerate()
            .map(|(i, p)| {
                if i == 0 && func.uses_sret {
                    let original = func
                        .original_ret_ty
                        .as_ref()
                        .map(|t| llvm_type(t))
                        .unwrap_or_else(|| "i8".to_string());
                    format!("ptr sret({}) %v{}", original, p.value_id)
                } else {
                    format!("{} %v{}", llvm_type(&p.ty), p.value_id)
                }
            })
            .collect();
        let linkage = if func.is_public { "" } else { "internal " };
        let mut attrs = String::new();
        if func.attributes.nothrow {
            attrs.push_str(" nounwind");
        }
        if func.attributes.pure {
            attrs.push_str(" memory(none)");
        } else if func.attributes.readonly {
            attrs.push_str(" memory(read)");
        }
        if func.attributes.willreturn {
            attrs.push_str(" willreturn");
        }
        if func.attributes.norecurse {
            attrs.push_str(" norecurse");
        }
        if func.attributes.always_inline {
            attrs.push_str(" alwaysinline");
        }
        writeln!(
            out,
            "define {}{} @{}({}){} {{",
            linkage,
            llvm_type(&func.ret_ty),
            sanitize(&func.name),
            params.join(", "),
            attrs
        )?;

        let mut needs_panic_block = false;
        for block in &func.blocks {
            self.emit_block(out, module, block, &operand, &mut needs_panic_block)?;
        }
        if needs_panic_block {
            writeln!(out, "bpanic:")?;
            writeln!(out, "  call void @rill_panic_bounds()")?;
            writeln!(out, "  unreachable")?;
        }
        writeln!(out, "}}")?;
        Ok(())
    }

    fn emit_block(
        &self,
        out: &mut String,
        module: &Module,
        block: &BasicBlock,
        operand: &dyn Fn(&Value) -> String,
        needs_panic_block: &mut bool,
    ) -> TextCodeGenResult<()> {
        writeln!(out, "bb{}:", block.id)?;
        for record in &block.instructions {
            self.emit_instruction(out, module, block, record, operand, needs_panic_block)?;
        }
        match &block.terminator {
            Some(term) => self.emit_terminator(out, term, operand)?,
            None => writeln!(out, "  unreachable")?,
        }
        Ok(())
    }

    fn emit_instruction(
        &self,
        out: &mut String,
        module: &Module,
        block: &BasicBlock,
        record: &InstructionRecord,
        operand: &dyn Fn(&Value) -> String,
        needs_panic_block: &mut bool,
    ) -> TextCodeGenResult<()> {
        // Constants were inlined into their uses
        if record.inst.is_const() {
            return Ok(());
        }
        let result = record
            .result
            .as_ref()
            .map(|r| format!("%v{}", r.id))
            .unwrap_or_default();

        match &record.inst {
            Inst::Binary { op, lhs, rhs } => {
                let ty = llvm_type(&lhs.ty);
                let text = binary_text(*op, &lhs.ty);
                writeln!(out, "  {result} = {text} {ty} {}, {}", operand(lhs), operand(rhs))?;
            }
            Inst::Unary { op, operand: src } => {
                let ty = llvm_type(&src.ty);
                match op {
                    UnaryOp::Neg if src.ty.is_float() => {
                        writeln!(out, "  {result} = fneg {ty} {}", operand(src))?;
                    }
                    UnaryOp::Neg => {
                        writeln!(out, "  {result} = sub {ty} 0, {}", operand(src))?;
                    }
                    UnaryOp::Not => {
                        writeln!(out, "  {result} = xor {ty} {}, true", operand(src))?;
                    }
                    UnaryOp::BitNot => {
                        writeln!(out, "  {result} = xor {ty} {}, -1", operand(src))?;
                    }
                }
            }
            Inst::Alloca { ty, .. } => {
                writeln!(
                    out,
                    "  {result} = alloca {}, align {}",
                    llvm_type(ty),
                    ty.align_of()
                )?;
            }
            Inst::Load { ptr, volatile } => {
                let ty = record
                    .result
                    .as_ref()
                    .map(|r| llvm_type(&r.ty))
                    .unwrap_or_else(|| "i64".to_string());
                let vol = if *volatile { "volatile " } else { "" };
                writeln!(out, "  {result} = load {vol}{ty}, ptr {}", operand(ptr))?;
            }
            Inst::Store {
                ptr,
                value,
                volatile,
            } => {
                let vol = if *volatile { "volatile " } else { "" };
                writeln!(
                    out,
                    "  store {vol}{} {}, ptr {}",
                    llvm_type(&value.ty),
                    operand(value),
                    operand(ptr)
                )?;
            }
            Inst::GetElementPtr {
                base,
                indices,
                bounds,
            } => {
                let elem = record
                    .result
                    .as_ref()
                    .and_then(|r| r.ty.pointee().cloned())
                    .map(|t| llvm_type(&t))
                    .unwrap_or_else(|| "i8".to_string());
                if bounds.needs_check
                    && let Some(size) = bounds.known_size
                    && let Some(index) = indices.first()
                {
                    // Runtime bounds test against the static length
                    let check = format!("%bc{}", record.result_id().unwrap_or(0));
                    let ok = format!("bok{}", record.result_id().unwrap_or(0));
                    writeln!(
                        out,
                        "  {check} = icmp ult i64 {}, {size}",
                        operand(index)
                    )?;
                    writeln!(out, "  br i1 {check}, label %{ok}, label %bpanic")?;
                    writeln!(out, "{ok}:")?;
                    *needs_panic_block = true;
                } else if bounds.assume_in_range
                    && let Some(size) = bounds.known_size
                    && let Some(index) = indices.first()
                {
                    let hint = format!("%as{}", record.result_id().unwrap_or(0));
                    writeln!(out, "  {hint} = icmp ult i64 {}, {size}", operand(index))?;
                    writeln!(out, "  call void @llvm.assume(i1 {hint})")?;
                }
                let idx: Vec<String> = indices
                    .iter()
                    .map(|i| format!("{} {}", llvm_type(&i.ty), operand(i)))
                    .collect();
                writeln!(
                    out,
                    "  {result} = getelementptr {elem}, ptr {}, {}",
                    operand(base),
                    idx.join(", ")
                )?;
            }
            Inst::ExtractValue { agg, indices } => {
                let idx: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
                writeln!(
                    out,
                    "  {result} = extractvalue {} {}, {}",
                    llvm_type(&agg.ty),
                    operand(agg),
                    idx.join(", ")
                )?;
            }
            Inst::InsertValue {
                agg,
                value,
                indices,
            } => {
                let idx: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
                writeln!(
                    out,
                    "  {result} = insertvalue {} {}, {} {}, {}",
                    llvm_type(&agg.ty),
                    operand(agg),
                    llvm_type(&value.ty),
                    operand(value),
                    idx.join(", ")
                )?;
            }
            Inst::StructInit { name, fields } => {
                emit_aggregate_init(
                    out,
                    &result,
                    &format!("%struct.{name}"),
                    fields,
                    operand,
                )?;
            }
            Inst::TupleInit { elems } => {
                let ty = record
                    .result
                    .as_ref()
                    .map(|r| llvm_type(&r.ty))
                    .unwrap_or_else(|| "{}".to_string());
                emit_aggregate_init(out, &result, &ty, elems, operand)?;
            }
            Inst::ArrayInit { elems, .. } => {
                let ty = record
                    .result
                    .as_ref()
                    .map(|r| llvm_type(&r.ty))
                    .unwrap_or_else(|| "{}".to_string());
                emit_aggregate_init(out, &result, &ty, elems, operand)?;
            }
            Inst::EnumInit {
                name,
                variant,
                payload,
            } => {
                let enum_ty = record
                    .result
                    .as_ref()
                    .map(|r| llvm_type(&r.ty))
                    .unwrap_or_else(|| format!("%struct.{name}"));
                match payload.first() {
                    Some(first) => {
                        writeln!(
                            out,
                            "  {result}.d = insertvalue {enum_ty} undef, i64 {variant}, 0"
                        )?;
                        writeln!(
                            out,
                            "  {result} = insertvalue {enum_ty} {result}.d, {} {}, 1",
                            llvm_type(&first.ty),
                            operand(first)
                        )?;
                    }
                    None => {
                        writeln!(
                            out,
                            "  {result} = insertvalue {enum_ty} undef, i64 {variant}, 0"
                        )?;
                    }
                }
            }
            Inst::Call { callee, args } => {
                let arg_list: Vec<String> = args
                    .iter()
                    .map(|a| format!("{} {}", llvm_type(&a.ty), operand(a)))
                    .collect();
                let ret = record
                    .result
                    .as_ref()
                    .map(|r| llvm_type(&r.ty))
                    .unwrap_or_else(|| "void".to_string());
                let target = if callee.is_empty() {
                    args.first().map(operand).unwrap_or_default()
                } else {
                    format!("@{}", sanitize(callee))
                };
                // Indirect calls go through the first argument
                let arg_list = if callee.is_empty() {
                    arg_list.into_iter().skip(1).collect::<Vec<_>>()
                } else {
                    arg_list
                };
                // The sret hidden parameter keeps its attribute at the site
                let arg_list = if let Some(target_fn) = module.function(callee)
                    && target_fn.uses_sret
                    && !arg_list.is_empty()
                {
                    let original = target_fn
                        .original_ret_ty
                        .as_ref()
                        .map(|t| llvm_type(t))
                        .unwrap_or_else(|| "i8".to_string());
                    let mut rewritten = arg_list;
                    if let Some(first_arg) = args.first() {
                        rewritten[0] = format!("ptr sret({}) {}", original, operand(first_arg));
                    }
                    rewritten
                } else {
                    arg_list
                };
                if ret == "void" {
                    writeln!(out, "  call void {target}({})", arg_list.join(", "))?;
                } else {
                    writeln!(out, "  {result} = call {ret} {target}({})", arg_list.join(", "))?;
                }
            }
            Inst::MethodCall {
                receiver,
                type_name,
                method,
                args,
            } => {
                let mut arg_list = vec![format!(
                    "{} {}",
                    llvm_type(&receiver.ty),
                    operand(receiver)
                )];
                arg_list.extend(
                    args.iter()
                        .map(|a| format!("{} {}", llvm_type(&a.ty), operand(a))),
                );
                let ret = record
                    .result
                    .as_ref()
                    .map(|r| llvm_type(&r.ty))
                    .unwrap_or_else(|| "void".to_string());
                let name = sanitize(&format!("{type_name}_{method}"));
                if ret == "void" {
                    writeln!(out, "  call void @{name}({})", arg_list.join(", "))?;
                } else {
                    writeln!(out, "  {result} = call {ret} @{name}({})", arg_list.join(", "))?;
                }
            }
            Inst::Select {
                cond,
                then_value,
                else_value,
            } => {
                let ty = llvm_type(&then_value.ty);
                writeln!(
                    out,
                    "  {result} = select i1 {}, {ty} {}, {ty} {}",
                    operand(cond),
                    operand(then_value),
                    operand(else_value)
                )?;
            }
            Inst::Cast {
                kind,
                operand: src,
                target,
            } => {
                let op_name = match kind {
                    CastKind::SignExtend => "sext",
                    CastKind::ZeroExtend => "zext",
                    CastKind::Truncate => "trunc",
                    CastKind::FloatExtend => "fpext",
                    CastKind::FloatTruncate => "fptrunc",
                    CastKind::FloatToInt => "fptosi",
                    CastKind::IntToFloat => "sitofp",
                    CastKind::IntToPtr => "inttoptr",
                    CastKind::PtrToInt => "ptrtoint",
                    CastKind::Bitcast => "bitcast",
                };
                writeln!(
                    out,
                    "  {result} = {op_name} {} {} to {}",
                    llvm_type(&src.ty),
                    operand(src),
                    llvm_type(target)
                )?;
            }
            Inst::Phi { incomings } => {
                let ty = record
                    .result
                    .as_ref()
                    .map(|r| llvm_type(&r.ty))
                    .unwrap_or_else(|| "i64".to_string());
                let inputs: Vec<String> = incomings
                    .iter()
                    .map(|(value, pred)| format!("[ {}, %bb{} ]", operand(value), pred))
                    .collect();
                writeln!(out, "  {result} = phi {ty} {}", inputs.join(", "))?;
            }
            Inst::AtomicLoad { ptr, ordering } => {
                let ty = record
                    .result
                    .as_ref()
                    .map(|r| llvm_type(&r.ty))
                    .unwrap_or_else(|| "i64".to_string());
                writeln!(
                    out,
                    "  {result} = load atomic {ty}, ptr {} {}, align 8",
                    operand(ptr),
                    ordering_text(*ordering)
                )?;
            }
            Inst::AtomicStore {
                ptr,
                value,
                ordering,
            } => {
                writeln!(
                    out,
                    "  store atomic {} {}, ptr {} {}, align 8",
                    llvm_type(&value.ty),
                    operand(value),
                    operand(ptr),
                    ordering_text(*ordering)
                )?;
            }
            Inst::AtomicRmw {
                op,
                ptr,
                value,
                ordering,
            } => {
                let op_name = match op {
                    RmwOp::Xchg => "xchg",
                    RmwOp::Add => "add",
                    RmwOp::Sub => "sub",
                    RmwOp::And => "and",
                    RmwOp::Nand => "nand",
                    RmwOp::Or => "or",
                    RmwOp::Xor => "xor",
                    RmwOp::Max => "max",
                    RmwOp::Min => "min",
                    RmwOp::UMax => "umax",
                    RmwOp::UMin => "umin",
                };
                writeln!(
                    out,
                    "  {result} = atomicrmw {op_name} ptr {}, {} {} {}",
                    operand(ptr),
                    llvm_type(&value.ty),
                    operand(value),
                    ordering_text(*ordering)
                )?;
            }
            Inst::AtomicCmpXchg {
                ptr,
                expected,
                new,
                ordering,
            } => {
                let ord = ordering_text(*ordering);
                writeln!(
                    out,
                    "  {result} = cmpxchg ptr {}, {} {}, {} {} {ord} {ord}",
                    operand(ptr),
                    llvm_type(&expected.ty),
                    operand(expected),
                    llvm_type(&new.ty),
                    operand(new)
                )?;
            }
            Inst::Fence { ordering } => {
                writeln!(out, "  fence {}", ordering_text(*ordering))?;
            }
            Inst::Await { .. } => {
                // Async lowering replaces awaits before emission
                writeln!(out, "  ; unlowered await in bb{}", block.id)?;
            }
            Inst::ClosureInit { func_name, captures } => {
                let env = captures
                    .first()
                    .map(operand)
                    .unwrap_or_else(|| "null".to_string());
                writeln!(
                    out,
                    "  {result}.f = insertvalue {{ ptr, ptr }} undef, ptr @{}, 0",
                    sanitize(func_name)
                )?;
                writeln!(
                    out,
                    "  {result} = insertvalue {{ ptr, ptr }} {result}.f, ptr {env}, 1"
                )?;
            }
            Inst::ConstInt { .. }
            | Inst::ConstFloat { .. }
            | Inst::ConstBool { .. }
            | Inst::ConstString { .. }
            | Inst::ConstUnit => unreachable!("handled above"),
        }
        Ok(())
    }

    fn emit_terminator(
        &self,
        out: &mut String,
        term: &Terminator,
        operand: &dyn Fn(&Value) -> String,
    ) -> TextCodeGenResult<()> {
        match term {
            Terminator::Return(Some(value)) => {
                writeln!(out, "  ret {} {}", llvm_type(&value.ty), operand(value))?;
            }
            Terminator::Return(None) => writeln!(out, "  ret void")?,
            Terminator::Branch(target) => writeln!(out, "  br label %bb{target}")?,
            Terminator::CondBranch {
                cond,
                then_block,
                else_block,
            } => {
                writeln!(
                    out,
                    "  br i1 {}, label %bb{then_block}, label %bb{else_block}",
                    operand(cond)
                )?;
            }
            Terminator::Switch {
                disc,
                cases,
                default,
            } => {
                let arms: Vec<String> = cases
                    .iter()
                    .map(|(value, target)| format!("i64 {value}, label %bb{target}"))
                    .collect();
                writeln!(
                    out,
                    "  switch i64 {}, label %bb{default} [ {} ]",
                    operand(disc),
                    arms.join(" ")
                )?;
            }
            Terminator::Unreachable => writeln!(out, "  unreachable")?,
        }
        Ok(())
    }
}

impl Default for TextCodeGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an aggregate value through an insertvalue chain
fn emit_aggregate_init(
    out: &mut String,
    result: &str,
    ty: &str,
    values: &[Value],
    operand: &dyn Fn(&Value) -> String,
) -> TextCodeGenResult<()> {
    if values.is_empty() {
        writeln!(out, "  {result} = bitcast {ty} undef to {ty}")?;
        return Ok(());
    }
    let mut previous = "undef".to_string();
    for (i, value) in values.iter().enumerate() {
        let name = if i + 1 == values.len() {
            result.to_string()
        } else {
            format!("{result}.f{i}")
        };
        writeln!(
            out,
            "  {name} = insertvalue {ty} {previous}, {} {}, {i}",
            llvm_type(&value.ty),
            operand(value)
        )?;
        previous = name;
    }
    Ok(())
}

/// LLVM type string for a MIR type
fn llvm_type(ty: &Type) -> String {
    match ty {
        Type::Unit => "void".to_string(),
        Type::Bool => "i1".to_string(),
        Type::I8 | Type::U8 => "i8".to_string(),
        Type::I16 | Type::U16 => "i16".to_string(),
        Type::I32 | Type::U32 => "i32".to_string(),
        Type::I64 | Type::U64 => "i64".to_string(),
        Type::I128 | Type::U128 => "i128".to_string(),
        Type::F32 => "float".to_string(),
        Type::F64 => "double".to_string(),
        Type::Ptr | Type::Str | Type::Pointer { .. } => "ptr".to_string(),
        Type::Array { element, size } => format!("[{} x {}]", size, llvm_type(element)),
        Type::Slice { .. } => "{ ptr, i64 }".to_string(),
        Type::Tuple(elems) => {
            let fields: Vec<String> = elems.iter().map(|e| llvm_type(e)).collect();
            format!("{{ {} }}", fields.join(", "))
        }
        Type::Struct { .. } | Type::Enum { .. } => {
            format!("%struct.{}", ty.mangle())
        }
        Type::Function { .. } => "{ ptr, ptr }".to_string(),
    }
}

fn binary_text(op: BinOp, operand_ty: &Type) -> String {
    let float = operand_ty.is_float();
    let signed = operand_ty.is_signed() || !operand_ty.is_integer();
    match op {
        BinOp::Add => if float { "fadd" } else { "add" }.to_string(),
        BinOp::Sub => if float { "fsub" } else { "sub" }.to_string(),
        BinOp::Mul => if float { "fmul" } else { "mul" }.to_string(),
        BinOp::Div => {
            if float {
                "fdiv".to_string()
            } else if signed {
                "sdiv".to_string()
            } else {
                "udiv".to_string()
            }
        }
        BinOp::Mod => {
            if float {
                "frem".to_string()
            } else if signed {
                "srem".to_string()
            } else {
                "urem".to_string()
            }
        }
        BinOp::Eq => if float { "fcmp oeq" } else { "icmp eq" }.to_string(),
        BinOp::Ne => if float { "fcmp one" } else { "icmp ne" }.to_string(),
        BinOp::Lt => {
            if float {
                "fcmp olt".to_string()
            } else if signed {
                "icmp slt".to_string()
            } else {
                "icmp ult".to_string()
            }
        }
        BinOp::Le => {
            if float {
                "fcmp ole".to_string()
            } else if signed {
                "icmp sle".to_string()
            } else {
                "icmp ule".to_string()
            }
        }
        BinOp::Gt => {
            if float {
                "fcmp ogt".to_string()
            } else if signed {
                "icmp sgt".to_string()
            } else {
                "icmp ugt".to_string()
            }
        }
        BinOp::Ge => {
            if float {
                "fcmp oge".to_string()
            } else if signed {
                "icmp sge".to_string()
            } else {
                "icmp uge".to_string()
            }
        }
        BinOp::And | BinOp::BitAnd => "and".to_string(),
        BinOp::Or | BinOp::BitOr => "or".to_string(),
        BinOp::BitXor => "xor".to_string(),
        BinOp::Shl => "shl".to_string(),
        BinOp::Shr => {
            if signed {
                "ashr".to_string()
            } else {
                "lshr".to_string()
            }
        }
    }
}

fn ordering_text(ordering: AtomicOrdering) -> &'static str {
    match ordering {
        AtomicOrdering::Monotonic => "monotonic",
        AtomicOrdering::Acquire => "acquire",
        AtomicOrdering::Release => "release",
        AtomicOrdering::AcqRel => "acq_rel",
        AtomicOrdering::SeqCst => "seq_cst",
    }
}

/// String literals used by the unit's functions, in first-use order
fn collect_strings(module: &Module, func_indices: &[usize]) -> IndexMap<String, usize> {
    let mut table = IndexMap::new();
    for &index in func_indices {
        for block in &module.functions[index].blocks {
            for record in &block.instructions {
                if let Inst::ConstString { value } = &record.inst {
                    let next = table.len();
                    table.entry(value.clone()).or_insert(next);
                }
            }
        }
    }
    table
}

/// Inlined operand text per constant-producing value id
fn collect_consts(func: &Function, strings: &IndexMap<String, usize>) -> IndexMap<ValueId, String> {
    let mut consts = IndexMap::new();
    for block in &func.blocks {
        for record in &block.instructions {
            let Some(id) = record.result_id() else { continue };
            let text = match &record.inst {
                Inst::ConstInt { value, .. } => value.to_string(),
                Inst::ConstFloat { value, .. } => {
                    if value.fract() == 0.0 && value.is_finite() {
                        format!("{value:.1}")
                    } else {
                        format!("{value}")
                    }
                }
                Inst::ConstBool { value } => value.to_string(),
                Inst::ConstString { value } => match strings.get(value) {
                    Some(index) => format!("@.str.{index}"),
                    None => "null".to_string(),
                },
                Inst::ConstUnit => "0".to_string(),
                _ => continue,
            };
            consts.insert(id, text);
        }
    }
    consts
}

fn escape_string(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'"' | b'\\' => {
                let _ = write!(escaped, "\\{byte:02X}");
            }
            0x20..=0x7e => escaped.push(byte as char),
            _ => {
                let _ = write!(escaped, "\\{byte:02X}");
            }
        }
    }
    escaped
}

/// Symbol names keep to the safe identifier charset
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                c
            } else {
                '.'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::types::TypeRef;
    use crate::tir::Span;
    use std::rc::Rc;

    fn i64_ty() -> TypeRef {
        Rc::new(Type::I64)
    }

    fn add_function() -> Function {
        let mut f = Function::new(
            "add",
            vec![
                ("a".to_string(), i64_ty()),
                ("b".to_string(), i64_ty()),
            ],
            i64_ty(),
            Span::default(),
        );
        f.is_public = true;
        let entry = f.add_block("entry");
        let a = f.param_value(0).unwrap();
        let b = f.param_value(1).unwrap();
        let sum = f.fresh_value(i64_ty());
        f.push_inst(
            entry,
            InstructionRecord::new(
                Inst::Binary {
                    op: BinOp::Add,
                    lhs: a,
                    rhs: b,
                },
                Some(sum.clone()),
                Span::default(),
            ),
        );
        f.set_terminator(entry, Terminator::Return(Some(sum)));
        f
    }

    #[test]
    fn test_emit_simple_function() {
        let mut module = Module::new("test");
        module.functions.push(add_function());

        let text = TextCodeGen::with_target("x86_64-unknown-linux-gnu")
            .generate(&module)
            .unwrap();
        assert!(text.contains("target triple = \"x86_64-unknown-linux-gnu\""));
        assert!(text.contains("define i64 @add(i64 %v1, i64 %v2)"));
        assert!(text.contains("%v3 = add i64 %v1, %v2"));
        assert!(text.contains("ret i64 %v3"));
    }

    #[test]
    fn test_emission_is_deterministic() {
        let mut module = Module::new("test");
        module.functions.push(add_function());
        let generator = TextCodeGen::with_target("x86_64-unknown-linux-gnu");
        assert_eq!(
            generator.generate(&module).unwrap(),
            generator.generate(&module).unwrap()
        );
    }

    #[test]
    fn test_cgu_declares_external_functions() {
        let mut module = Module::new("test");
        module.functions.push(add_function());

        // caller in a different unit: calls add
        let mut caller = Function::new("main", vec![], i64_ty(), Span::default());
        caller.is_public = true;
        let entry = caller.add_block("entry");
        let one = caller.fresh_value(i64_ty());
        caller.push_inst(
            entry,
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
        let result = caller.fresh_value(i64_ty());
        caller.push_inst(
            entry,
            InstructionRecord::new(
                Inst::Call {
                    callee: "add".to_string(),
                    args: vec![one.clone(), one],
                },
                Some(result.clone()),
                Span::default(),
            ),
        );
        caller.set_terminator(entry, Terminator::Return(Some(result)));
        module.functions.push(caller);

        // Unit containing only `main`: `add` is declared, not defined
        let text = TextCodeGen::with_target("x86_64-unknown-linux-gnu")
            .generate_cgu(&module, &[1])
            .unwrap();
        assert!(text.contains("declare i64 @add(i64, i64)"));
        assert!(text.contains("define i64 @main()"));
        assert!(!text.contains("define i64 @add"));
        // Constants are inlined
        assert!(text.contains("call i64 @add(i64 1, i64 1)"));
    }

    #[test]
    fn test_checked_gep_emits_bounds_test() {
        let mut module = Module::new("test");
        let arr_ty: TypeRef = Rc::new(Type::Array {
            element: i64_ty(),
            size: 4,
        });
        let ptr_ty: TypeRef = Rc::new(Type::Pointer {
            pointee: arr_ty.clone(),
            is_mut: false,
        });
        let elem_ptr: TypeRef = Rc::new(Type::Pointer {
            pointee: i64_ty(),
            is_mut: false,
        });

        let mut f = Function::new(
            "get",
            vec![("arr".to_string(), ptr_ty), ("i".to_string(), i64_ty())],
            i64_ty(),
            Span::default(),
        );
        let entry = f.add_block("entry");
        let arr = f.param_value(0).unwrap();
        let i = f.param_value(1).unwrap();
        let gep = f.fresh_value(elem_ptr);
        f.push_inst(
            entry,
            InstructionRecord::new(
                Inst::GetElementPtr {
                    base: arr,
                    indices: smallvec::smallvec![i],
                    bounds: crate::mir::BoundsInfo::checked(Some(4)),
                },
                Some(gep.clone()),
                Span::default(),
            ),
        );
        let value = f.fresh_value(i64_ty());
        f.push_inst(
            entry,
            InstructionRecord::new(
                Inst::Load {
                    ptr: gep,
                    volatile: false,
                },
                Some(value.clone()),
                Span::default(),
            ),
        );
        f.set_terminator(entry, Terminator::Return(Some(value)));
        module.functions.push(f);

        let text = TextCodeGen::with_target("x86_64-unknown-linux-gnu")
            .generate(&module)
            .unwrap();
        assert!(text.contains("icmp ult i64 %v2, 4"));
        assert!(text.contains("label %bpanic"));
        assert!(text.contains("bpanic:"));
        assert!(text.contains("call void @rill_panic_bounds()"));
    }

    #[test]
    fn test_assume_hint_for_proven_access() {
        let mut module = Module::new("test");
        let elem_ptr: TypeRef = Rc::new(Type::Pointer {
            pointee: i64_ty(),
            is_mut: false,
        });
        let ptr_ty: TypeRef = Rc::new(Type::Ptr);

        let mut f = Function::new(
            "get",
            vec![("arr".to_string(), ptr_ty), ("i".to_string(), i64_ty())],
            i64_ty(),
            Span::default(),
        );
        let entry = f.add_block("entry");
        let arr = f.param_value(0).unwrap();
        let i = f.param_value(1).unwrap();
        let mut bounds = crate::mir::BoundsInfo::checked(Some(4));
        bounds.needs_check = false;
        bounds.assume_in_range = true;
        let gep = f.fresh_value(elem_ptr);
        f.push_inst(
            entry,
            InstructionRecord::new(
                Inst::GetElementPtr {
                    base: arr,
                    indices: smallvec::smallvec![i],
                    bounds,
                },
                Some(gep.clone()),
                Span::default(),
            ),
        );
        let value = f.fresh_value(i64_ty());
        f.push_inst(
            entry,
            InstructionRecord::new(
                Inst::Load {
                    ptr: gep,
                    volatile: false,
                },
                Some(value.clone()),
                Span::default(),
            ),
        );
        f.set_terminator(entry, Terminator::Return(Some(value)));
        module.functions.push(f);

        let text = TextCodeGen::with_target("x86_64-unknown-linux-gnu")
            .generate(&module)
            .unwrap();
        assert!(text.contains("call void @llvm.assume"));
        assert!(!text.contains("bpanic:"));
    }

    #[test]
    fn test_sret_function_attribute() {
        let mut module = Module::new("test");
        module.structs.push(crate::mir::StructLayout {
            name: "Pair".to_string(),
            fields: vec![
                ("x".to_string(), i64_ty()),
                ("y".to_string(), i64_ty()),
            ],
            has_drop: false,
        });
        let pair_ty: TypeRef = Rc::new(Type::Struct {
            name: "Pair".to_string(),
            type_args: vec![],
        });

        let mut f = Function::new("make_pair", vec![], pair_ty.clone(), Span::default());
        f.is_public = true;
        let entry = f.add_block("entry");
        let pair = f.fresh_value(pair_ty.clone());
        f.push_inst(
            entry,
            InstructionRecord::new(
                Inst::StructInit {
                    name: "Pair".to_string(),
                    fields: vec![],
                },
                Some(pair.clone()),
                Span::default(),
            ),
        );
        f.set_terminator(entry, Terminator::Return(Some(pair)));
        module.functions.push(f);

        let mut sret = crate::mir::rvo::SretConversionPass::new();
        use crate::mir::ModulePass;
        assert!(sret.run(&mut module));

        let text = TextCodeGen::with_target("x86_64-unknown-linux-gnu")
            .generate(&module)
            .unwrap();
        assert!(text.contains("define void @make_pair(ptr sret(%struct.Pair)"));
    }
}
