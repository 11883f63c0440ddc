//! Human-readable MIR printing
//!
//! Deterministic textual dump of modules and functions, used by
//! `rillc opt --print-mir`, by tests, and when debugging pass pipelines.
//! Output is insertion-ordered everywhere, so identical input produces
//! byte-identical text.

use std::fmt::Write;

use super::{BasicBlock, Function, Inst, InstructionRecord, Module, Terminator, Value};

/// Print a whole module
pub fn print_module(module: &Module) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "module {}", module.name);

    for def in &module.structs {
        let fields: Vec<String> = def
            .fields
            .iter()
            .map(|(name, ty)| format!("{name}: {ty}"))
            .collect();
        let _ = writeln!(out, "struct {} {{ {} }}", def.name, fields.join(", "));
    }
    for def in &module.enums {
        let variants: Vec<String> = def
            .variants
            .iter()
            .map(|(name, payload)| {
                if payload.is_empty() {
                    name.clone()
                } else {
                    let tys: Vec<String> = payload.iter().map(|t| t.to_string()).collect();
                    format!("{}({})", name, tys.join(", "))
                }
            })
            .collect();
        let _ = writeln!(out, "enum {} {{ {} }}", def.name, variants.join(", "));
    }

    for func in &module.functions {
        out.push('\n');
        out.push_str(&print_function(func));
    }
    out
}

/// Print a single function
pub fn print_function(func: &Function) -> String {
    let mut out = String::new();

    let params: Vec<String> = func
        .params
        .iter()
        .map(|p| format!("%{}: {}", p.value_id, p.ty))
        .collect();
    let _ = write!(out, "fn {}({}) -> {}", func.name, params.join(", "), func.ret_ty);

    let mut markers = func.attributes.names();
    if func.is_public {
        markers.insert(0, "pub");
    }
    if func.is_async {
        markers.push("async");
    }
    if func.uses_sret {
        markers.push("sret");
    }
    if !markers.is_empty() {
        let _ = write!(out, " [{}]", markers.join(" "));
    }
    let _ = writeln!(out, " {{");

    for block in &func.blocks {
        print_block(&mut out, block);
    }
    out.push_str("}\n");
    out
}

fn print_block(out: &mut String, block: &BasicBlock) {
    let _ = writeln!(out, "bb{}: ; {}", block.id, block.name);
    for record in &block.instructions {
        let _ = writeln!(out, "  {}", format_instruction(record));
    }
    match &block.terminator {
        Some(term) => {
            let _ = writeln!(out, "  {}", format_terminator(term));
        }
        None => {
            let _ = writeln!(out, "  <unterminated>");
        }
    }
}

fn v(value: &Value) -> String {
    format!("%{}", value.id)
}

fn list(values: &[Value]) -> String {
    values.iter().map(v).collect::<Vec<_>>().join(", ")
}

fn format_instruction(record: &InstructionRecord) -> String {
    let body = match &record.inst {
        Inst::Binary { op, lhs, rhs } => {
            let name = match op {
                super::BinOp::Add => "add",
                super::BinOp::Sub => "sub",
                super::BinOp::Mul => "mul",
                super::BinOp::Div => "div",
                super::BinOp::Mod => "mod",
                super::BinOp::Eq => "eq",
                super::BinOp::Ne => "ne",
                super::BinOp::Lt => "lt",
                super::BinOp::Le => "le",
                super::BinOp::Gt => "gt",
                super::BinOp::Ge => "ge",
                super::BinOp::And => "and",
                super::BinOp::Or => "or",
                super::BinOp::BitAnd => "band",
                super::BinOp::BitOr => "bor",
                super::BinOp::BitXor => "bxor",
                super::BinOp::Shl => "shl",
                super::BinOp::Shr => "shr",
            };
            format!("{name} {}, {}", v(lhs), v(rhs))
        }
        Inst::Unary { op, operand } => {
            let name = match op {
                super::UnaryOp::Neg => "neg",
                super::UnaryOp::Not => "not",
                super::UnaryOp::BitNot => "bnot",
            };
            format!("{name} {}", v(operand))
        }
        Inst::Alloca { ty, name } => format!("alloca {ty} ; {name}"),
        Inst::Load { ptr, volatile } => {
            format!("load{} {}", if *volatile { " volatile" } else { "" }, v(ptr))
        }
        Inst::Store {
            ptr,
            value,
            volatile,
        } => {
            return format!(
                "store{} {} -> {}",
                if *volatile { " volatile" } else { "" },
                v(value),
                v(ptr)
            );
        }
        Inst::GetElementPtr {
            base,
            indices,
            bounds,
        } => {
            let idx: Vec<String> = indices.iter().map(v).collect();
            let mut text = format!("gep {}[{}]", v(base), idx.join(", "));
            if !bounds.needs_check {
                text.push_str(" !nocheck");
            }
            if bounds.assume_in_range {
                text.push_str(" !assume");
            }
            text
        }
        Inst::ExtractValue { agg, indices } => {
            let idx: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
            format!("extract {}.{}", v(agg), idx.join("."))
        }
        Inst::InsertValue {
            agg,
            value,
            indices,
        } => {
            let idx: Vec<String> = indices.iter().map(|i| i.to_string()).collect();
            format!("insert {}.{} <- {}", v(agg), idx.join("."), v(value))
        }
        Inst::StructInit { name, fields } => format!("struct {name} {{ {} }}", list(fields)),
        Inst::TupleInit { elems } => format!("tuple ({})", list(elems)),
        Inst::ArrayInit { element_ty, elems } => {
            format!("array {element_ty} [{}]", list(elems))
        }
        Inst::EnumInit {
            name,
            variant,
            payload,
        } => format!("enum {name}#{variant} ({})", list(payload)),
        Inst::Call { callee, args } => {
            if callee.is_empty() {
                format!("call <indirect> ({})", list(args))
            } else {
                format!("call {callee}({})", list(args))
            }
        }
        Inst::MethodCall {
            receiver,
            type_name,
            method,
            args,
        } => format!("call {type_name}::{method}({}; {})", v(receiver), list(args)),
        Inst::Select {
            cond,
            then_value,
            else_value,
        } => format!("select {} ? {} : {}", v(cond), v(then_value), v(else_value)),
        Inst::Cast {
            kind,
            operand,
            target,
        } => {
            let name = match kind {
                super::CastKind::SignExtend => "sext",
                super::CastKind::ZeroExtend => "zext",
                super::CastKind::Truncate => "trunc",
                super::CastKind::FloatExtend => "fpext",
                super::CastKind::FloatTruncate => "fptrunc",
                super::CastKind::FloatToInt => "fptoint",
                super::CastKind::IntToFloat => "inttofp",
                super::CastKind::IntToPtr => "inttoptr",
                super::CastKind::PtrToInt => "ptrtoint",
                super::CastKind::Bitcast => "bitcast",
            };
            format!("cast.{name} {} to {target}", v(operand))
        }
        Inst::Phi { incomings } => {
            let inc: Vec<String> = incomings
                .iter()
                .map(|(value, block)| format!("[{}: bb{}]", v(value), block))
                .collect();
            format!("phi {}", inc.join(", "))
        }
        Inst::ConstInt {
            value,
            bits,
            signed,
        } => format!("const {value}_{}{}", if *signed { "i" } else { "u" }, bits),
        Inst::ConstFloat { value, is_f64 } => {
            format!("const {value}_{}", if *is_f64 { "f64" } else { "f32" })
        }
        Inst::ConstBool { value } => format!("const {value}"),
        Inst::ConstString { value } => format!("const {value:?}"),
        Inst::ConstUnit => "const unit".to_string(),
        Inst::AtomicLoad { ptr, ordering } => {
            format!("atomic.load {} {}", v(ptr), ordering_name(*ordering))
        }
        Inst::AtomicStore {
            ptr,
            value,
            ordering,
        } => {
            return format!(
                "atomic.store {} -> {} {}",
                v(value),
                v(ptr),
                ordering_name(*ordering)
            );
        }
        Inst::AtomicRmw {
            op,
            ptr,
            value,
            ordering,
        } => {
            let name = match op {
                super::RmwOp::Xchg => "xchg",
                super::RmwOp::Add => "add",
                super::RmwOp::Sub => "sub",
                super::RmwOp::And => "and",
                super::RmwOp::Nand => "nand",
                super::RmwOp::Or => "or",
                super::RmwOp::Xor => "xor",
                super::RmwOp::Max => "max",
                super::RmwOp::Min => "min",
                super::RmwOp::UMax => "umax",
                super::RmwOp::UMin => "umin",
            };
            format!(
                "atomic.rmw.{name} {}, {} {}",
                v(ptr),
                v(value),
                ordering_name(*ordering)
            )
        }
        Inst::AtomicCmpXchg {
            ptr,
            expected,
            new,
            ordering,
        } => format!(
            "atomic.cmpxchg {}, {}, {} {}",
            v(ptr),
            v(expected),
            v(new),
            ordering_name(*ordering)
        ),
        Inst::Fence { ordering } => return format!("fence {}", ordering_name(*ordering)),
        Inst::Await {
            poll_value,
            suspension_id,
        } => format!("await {} #{suspension_id}", v(poll_value)),
        Inst::ClosureInit { func_name, captures } => {
            format!("closure {func_name} [{}]", list(captures))
        }
    };

    match &record.result {
        Some(result) => format!("%{} = {}", result.id, body),
        None => body,
    }
}

fn ordering_name(ordering: super::AtomicOrdering) -> &'static str {
    match ordering {
        super::AtomicOrdering::Monotonic => "monotonic",
        super::AtomicOrdering::Acquire => "acquire",
        super::AtomicOrdering::Release => "release",
        super::AtomicOrdering::AcqRel => "acq_rel",
        super::AtomicOrdering::SeqCst => "seq_cst",
    }
}

fn format_terminator(term: &Terminator) -> String {
    match term {
        Terminator::Return(Some(value)) => format!("ret {}", v(value)),
        Terminator::Return(None) => "ret".to_string(),
        Terminator::Branch(target) => format!("br bb{target}"),
        Terminator::CondBranch {
            cond,
            then_block,
            else_block,
        } => format!("condbr {}, bb{then_block}, bb{else_block}", v(cond)),
        Terminator::Switch {
            disc,
            cases,
            default,
        } => {
            let arms: Vec<String> = cases
                .iter()
                .map(|(value, block)| format!("{value} -> bb{block}"))
                .collect();
            format!(
                "switch {} [{}], default bb{default}",
                v(disc),
                arms.join(", ")
            )
        }
        Terminator::Unreachable => "unreachable".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Function, Inst, InstructionRecord, Terminator, types::Type};
    use super::*;
    use crate::tir::Span;
    use std::rc::Rc;

    #[test]
    fn test_print_simple_function() {
        let i64_ty = Rc::new(Type::I64);
        let mut f = Function::new(
            "add",
            vec![
                ("a".to_string(), Rc::clone(&i64_ty)),
                ("b".to_string(), Rc::clone(&i64_ty)),
            ],
            Rc::clone(&i64_ty),
            Span::default(),
        );
        let entry = f.add_block("entry");
        let a = f.param_value(0).unwrap();
        let b = f.param_value(1).unwrap();
        let sum = f.fresh_value(i64_ty);
        f.push_inst(
            entry,
            InstructionRecord::new(
                Inst::Binary {
                    op: super::super::BinOp::Add,
                    lhs: a,
                    rhs: b,
                },
                Some(sum.clone()),
                Span::default(),
            ),
        );
        f.set_terminator(entry, Terminator::Return(Some(sum)));

        let text = print_function(&f);
        assert_eq!(
            text,
            "fn add(%1: i64, %2: i64) -> i64 {\nbb0: ; entry\n  %3 = add %1, %2\n  ret %3\n}\n"
        );
    }

    #[test]
    fn test_print_is_deterministic() {
        let i64_ty: super::super::types::TypeRef = Rc::new(Type::I64);
        let mut f = Function::new("f", vec![], i64_ty.clone(), Span::default());
        let entry = f.add_block("entry");
        let c = f.fresh_value(i64_ty);
        f.push_inst(
            entry,
            InstructionRecord::new(
                Inst::ConstInt {
                    value: 9,
                    bits: 64,
                    signed: true,
                },
                Some(c.clone()),
                Span::default(),
            ),
        );
        f.set_terminator(entry, Terminator::Return(Some(c)));
        assert_eq!(print_function(&f), print_function(&f));
    }
}
