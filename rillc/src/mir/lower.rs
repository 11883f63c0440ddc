//! TIR to MIR lowering
//!
//! Converts the typed input tree into SSA MIR by:
//! - flattening nested expressions into sequences of instructions
//! - making control flow explicit through basic blocks and terminators
//! - inserting phi nodes at merge points
//! - tracking drop scopes and emitting destructor calls on scope exit
//!
//! Immutable bindings stay pure SSA values; mutable and volatile bindings
//! get an alloca slot with explicit loads and stores. Diverging expressions
//! (`return`, `break`, `continue`) seal the current block; lowering then
//! continues into a detached block that is finally sealed `unreachable`.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::error::Result;
use crate::tir::{self, Span};

use super::types::{Type, TypeInterner, TypeRef};
use super::{
    BinOp, BlockId, BoundsInfo, CastKind, EnumLayout, Function, Inst, InstructionRecord, Module,
    StructLayout, Terminator, UnaryOp, Value,
};

const STACK_RED_ZONE: usize = 128 * 1024; // 128KB remaining triggers growth
const STACK_GROW_SIZE: usize = 4 * 1024 * 1024; // Grow by 4MB each time

/// How a name is currently bound
#[derive(Debug, Clone)]
enum Binding {
    /// Immutable binding: the SSA value itself
    Ssa(Value),
    /// Mutable or volatile binding: pointer to a stack slot
    Slot {
        ptr: Value,
        elem_ty: TypeRef,
        volatile: bool,
    },
}

/// Loop context for break/continue lowering
#[derive(Debug)]
struct LoopContext {
    /// Target of `continue` (the header, or the step block of a `for`)
    continue_target: BlockId,
    exit_block: BlockId,
    /// Drop-scope depth at loop entry; break/continue unwind deeper scopes
    drop_depth: usize,
    /// (predecessor block, break value) pairs feeding the exit phi
    break_sources: Vec<(BlockId, Value)>,
}

/// Drop obligation registered with the scope manager
#[derive(Debug, Clone)]
struct DropInfo {
    var_name: String,
    type_name: String,
    moved: bool,
    dropped: bool,
}

/// Mutable state while building one function's MIR
struct BuildContext {
    func: Function,
    current_block: BlockId,
    variables: IndexMap<String, Binding>,
    volatile_vars: HashSet<String>,
    loop_stack: Vec<LoopContext>,
    in_async_func: bool,
    next_suspension_id: u32,
    drop_scopes: Vec<Vec<DropInfo>>,
}

impl BuildContext {
    fn new(func: Function) -> Self {
        Self {
            func,
            current_block: 0,
            variables: IndexMap::new(),
            volatile_vars: HashSet::new(),
            loop_stack: Vec::new(),
            in_async_func: false,
            next_suspension_id: 0,
            drop_scopes: Vec::new(),
        }
    }

    fn is_terminated(&self) -> bool {
        self.func
            .block(self.current_block)
            .is_none_or(|b| b.is_sealed())
    }

    fn switch_to(&mut self, block: BlockId) {
        self.current_block = block;
    }

    fn emit(&mut self, inst: Inst, ty: TypeRef, span: Span) -> Value {
        let result = self.func.fresh_value(ty);
        self.func.push_inst(
            self.current_block,
            InstructionRecord::new(inst, Some(result.clone()), span),
        );
        result
    }

    fn emit_void(&mut self, inst: Inst, span: Span) {
        self.func
            .push_inst(self.current_block, InstructionRecord::new(inst, None, span));
    }

    /// Seal the current block and continue lowering into a detached block
    fn terminate(&mut self, term: Terminator) {
        self.func.set_terminator(self.current_block, term);
        let dead = self.func.add_block("dead");
        self.current_block = dead;
    }

    fn push_drop_scope(&mut self) {
        self.drop_scopes.push(Vec::new());
    }

    fn pop_drop_scope(&mut self) {
        self.drop_scopes.pop();
    }

    fn register_for_drop(&mut self, var_name: &str, type_name: &str) {
        if let Some(scope) = self.drop_scopes.last_mut() {
            scope.push(DropInfo {
                var_name: var_name.to_string(),
                type_name: type_name.to_string(),
                moved: false,
                dropped: false,
            });
        }
    }

    fn mark_moved(&mut self, var_name: &str) {
        for scope in &mut self.drop_scopes {
            for info in scope {
                if info.var_name == var_name {
                    info.moved = true;
                    return;
                }
            }
        }
    }
}

/// Lowers typed modules into MIR
pub struct Builder {
    interner: TypeInterner,
    module: Module,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            interner: TypeInterner::new(),
            module: Module::default(),
        }
    }

    /// Build a MIR module from a typed input module
    pub fn build(mut self, input: &tir::Module) -> Result<Module> {
        self.module.name = input.name.clone();

        for def in &input.structs {
            let fields = def
                .fields
                .iter()
                .map(|f| (f.name.clone(), self.convert_ty(&f.ty)))
                .collect();
            self.module.structs.push(StructLayout {
                name: def.name.clone(),
                fields,
                has_drop: def.has_drop,
            });
        }
        for def in &input.enums {
            let variants = def
                .variants
                .iter()
                .map(|v| {
                    let payload = v.payload.iter().map(|t| self.convert_ty(t)).collect();
                    (v.name.clone(), payload)
                })
                .collect();
            self.module.enums.push(EnumLayout {
                name: def.name.clone(),
                variants,
                has_drop: def.has_drop,
            });
        }

        for func in &input.functions {
            let built = self.build_function(func)?;
            debug_assert!(built.verify().is_ok(), "{:?}", built.verify());
            self.module.functions.push(built);
        }

        Ok(self.module)
    }

    // ============ Type Conversion ============

    fn convert_ty(&mut self, ty: &tir::Ty) -> TypeRef {
        match ty {
            tir::Ty::Unit => self.interner.intern(Type::Unit),
            tir::Ty::Bool => self.interner.intern(Type::Bool),
            tir::Ty::I8 => self.interner.intern(Type::I8),
            tir::Ty::I16 => self.interner.intern(Type::I16),
            tir::Ty::I32 => self.interner.intern(Type::I32),
            tir::Ty::I64 => self.interner.intern(Type::I64),
            tir::Ty::I128 => self.interner.intern(Type::I128),
            tir::Ty::U8 => self.interner.intern(Type::U8),
            tir::Ty::U16 => self.interner.intern(Type::U16),
            tir::Ty::U32 => self.interner.intern(Type::U32),
            tir::Ty::U64 => self.interner.intern(Type::U64),
            tir::Ty::U128 => self.interner.intern(Type::U128),
            tir::Ty::F32 => self.interner.intern(Type::F32),
            tir::Ty::F64 => self.interner.intern(Type::F64),
            tir::Ty::Ptr => self.interner.intern(Type::Ptr),
            tir::Ty::Str => self.interner.intern(Type::Str),
            tir::Ty::Pointer { pointee, is_mut } => {
                let pointee = self.convert_ty(pointee);
                self.interner.pointer(pointee, *is_mut)
            }
            tir::Ty::Array { element, size } => {
                let element = self.convert_ty(element);
                self.interner.array(element, *size)
            }
            tir::Ty::Slice { element } => {
                let element = self.convert_ty(element);
                self.interner.slice(element)
            }
            tir::Ty::Tuple(elems) => {
                let elems = elems.iter().map(|t| self.convert_ty(t)).collect();
                self.interner.tuple(elems)
            }
            tir::Ty::Struct { name, type_args } => {
                let args = type_args.iter().map(|t| self.convert_ty(t)).collect();
                self.interner.struct_(name.clone(), args)
            }
            tir::Ty::Enum { name, type_args } => {
                let args = type_args.iter().map(|t| self.convert_ty(t)).collect();
                self.interner.enum_(name.clone(), args)
            }
            tir::Ty::Function { params, ret } => {
                let params = params.iter().map(|t| self.convert_ty(t)).collect();
                let ret = self.convert_ty(ret);
                self.interner.intern(Type::Function { params, ret })
            }
        }
    }

    /// Name used to resolve a type's drop function, when it has one
    fn droppable_type_name(&self, ty: &Type) -> Option<String> {
        match ty {
            Type::Struct { name, .. } => self
                .module
                .struct_def(name)
                .filter(|d| d.has_drop)
                .map(|d| d.name.clone()),
            Type::Enum { name, .. } => self
                .module
                .enum_def(name)
                .filter(|d| d.has_drop)
                .map(|d| d.name.clone()),
            _ => None,
        }
    }

    // ============ Function Building ============

    fn build_function(&mut self, input: &tir::Function) -> Result<Function> {
        let params: Vec<(String, TypeRef)> = input
            .params
            .iter()
            .map(|p| (p.name.clone(), self.convert_ty(&p.ty)))
            .collect();
        let ret_ty = self.convert_ty(&input.ret_ty);
        let ret_is_unit = ret_ty.is_unit();

        let mut func = Function::new(&input.name, params, ret_ty, input.span);
        func.is_public = input.is_public;
        func.is_async = input.is_async;

        let entry = func.add_block("entry");
        let mut ctx = BuildContext::new(func);
        ctx.switch_to(entry);
        ctx.in_async_func = input.is_async;

        // Bind parameters; mutable ones get a stack slot in the prologue
        for (i, param) in input.params.iter().enumerate() {
            let value = ctx.func.param_value(i).expect("param value");
            if param.mutable {
                let elem_ty = value.ty.clone();
                let ptr_ty = self.interner.pointer(elem_ty.clone(), true);
                let ptr = ctx.emit(
                    Inst::Alloca {
                        ty: elem_ty.clone(),
                        name: param.name.clone(),
                    },
                    ptr_ty,
                    input.span,
                );
                ctx.emit_void(
                    Inst::Store {
                        ptr: ptr.clone(),
                        value,
                        volatile: false,
                    },
                    input.span,
                );
                ctx.variables.insert(
                    param.name.clone(),
                    Binding::Slot {
                        ptr,
                        elem_ty,
                        volatile: false,
                    },
                );
            } else {
                ctx.variables.insert(param.name.clone(), Binding::Ssa(value));
            }
        }

        // The function body manages its own scope so the tail value can be
        // marked moved before the scope's drops are emitted
        ctx.push_drop_scope();
        for stmt in &input.body.stmts {
            self.lower_stmt(&mut ctx, stmt)?;
        }
        let body_value = match &input.body.tail {
            Some(tail) => Some(self.lower_expr(&mut ctx, tail)?),
            None => None,
        };

        if !ctx.is_terminated() {
            if !ret_is_unit
                && let Some(tail) = &input.body.tail
                && let tir::ExprKind::Var(name) = &tail.kind
            {
                ctx.mark_moved(name);
            }
            self.emit_all_drops(&mut ctx);
            let return_value = if ret_is_unit { None } else { body_value };
            ctx.terminate(Terminator::Return(return_value));
        }
        ctx.pop_drop_scope();

        // Seal any detached dead-code blocks
        for block in &mut ctx.func.blocks {
            if block.terminator.is_none() {
                block.terminator = Some(Terminator::Unreachable);
            }
        }
        ctx.func.invalidate_analyses();

        Ok(ctx.func)
    }

    // ============ Statement and Block Lowering ============

    fn lower_block(&mut self, ctx: &mut BuildContext, block: &tir::Block) -> Result<Value> {
        let saved_vars = ctx.variables.clone();
        ctx.push_drop_scope();

        for stmt in &block.stmts {
            self.lower_stmt(ctx, stmt)?;
        }

        let value = match &block.tail {
            Some(tail) => self.lower_expr(ctx, tail)?,
            None => self.unit_value(ctx, Span::default()),
        };

        if !ctx.is_terminated() {
            self.emit_scope_exit_drops(ctx);
        }
        ctx.pop_drop_scope();
        ctx.variables = saved_vars;

        Ok(value)
    }

    fn lower_stmt(&mut self, ctx: &mut BuildContext, stmt: &tir::Stmt) -> Result<()> {
        match stmt {
            tir::Stmt::Let {
                pattern,
                init,
                mutable,
                volatile,
            } => {
                let value = self.lower_expr(ctx, init)?;

                if let tir::Pattern::Binding(name) = pattern {
                    if *mutable || *volatile {
                        let elem_ty = value.ty.clone();
                        let ptr_ty = self.interner.pointer(elem_ty.clone(), true);
                        let ptr = ctx.emit(
                            Inst::Alloca {
                                ty: elem_ty.clone(),
                                name: name.clone(),
                            },
                            ptr_ty,
                            init.span,
                        );
                        ctx.emit_void(
                            Inst::Store {
                                ptr: ptr.clone(),
                                value: value.clone(),
                                volatile: *volatile,
                            },
                            init.span,
                        );
                        if *volatile {
                            ctx.volatile_vars.insert(name.clone());
                        }
                        ctx.variables.insert(
                            name.clone(),
                            Binding::Slot {
                                ptr,
                                elem_ty,
                                volatile: *volatile,
                            },
                        );
                    } else {
                        ctx.variables
                            .insert(name.clone(), Binding::Ssa(value.clone()));
                    }
                    if let Some(type_name) = self.droppable_type_name(&value.ty) {
                        ctx.register_for_drop(name, &type_name);
                    }
                } else {
                    self.bind_pattern(ctx, pattern, value, init.span)?;
                }
                Ok(())
            }
            tir::Stmt::Assign { target, value } => {
                let new_value = self.lower_expr(ctx, value)?;
                let place = self.lower_place(ctx, target)?;
                match place {
                    Some((ptr, volatile)) => {
                        ctx.emit_void(
                            Inst::Store {
                                ptr,
                                value: new_value,
                                volatile,
                            },
                            target.span,
                        );
                    }
                    None => {
                        debug_assert!(false, "assignment to immutable place");
                    }
                }
                Ok(())
            }
            tir::Stmt::Expr(expr) => {
                self.lower_expr(ctx, expr)?;
                Ok(())
            }
        }
    }

    // ============ Expression Lowering ============

    fn lower_expr(&mut self, ctx: &mut BuildContext, expr: &tir::Expr) -> Result<Value> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            self.lower_expr_inner(ctx, expr)
        })
    }

    fn lower_expr_inner(&mut self, ctx: &mut BuildContext, expr: &tir::Expr) -> Result<Value> {
        let ty = self.convert_ty(&expr.ty);
        let span = expr.span;

        match &expr.kind {
            tir::ExprKind::IntLit(value) => Ok(ctx.emit(
                Inst::ConstInt {
                    value: *value,
                    bits: ty.bit_width().min(128) as u8,
                    signed: ty.is_signed(),
                },
                ty,
                span,
            )),
            tir::ExprKind::FloatLit(value) => Ok(ctx.emit(
                Inst::ConstFloat {
                    value: *value,
                    is_f64: matches!(*ty, Type::F64),
                },
                ty,
                span,
            )),
            tir::ExprKind::BoolLit(value) => {
                Ok(ctx.emit(Inst::ConstBool { value: *value }, ty, span))
            }
            tir::ExprKind::StrLit(value) => Ok(ctx.emit(
                Inst::ConstString {
                    value: value.clone(),
                },
                ty,
                span,
            )),
            tir::ExprKind::UnitLit => Ok(ctx.emit(Inst::ConstUnit, ty, span)),
            tir::ExprKind::Var(name) => Ok(self.read_var(ctx, name, span)),

            tir::ExprKind::Binary { op, lhs, rhs } => {
                if matches!(op, tir::BinOp::And | tir::BinOp::Or) {
                    return self.lower_short_circuit(ctx, *op, lhs, rhs, ty, span);
                }
                let lhs_v = self.lower_expr(ctx, lhs)?;
                let rhs_v = self.lower_expr(ctx, rhs)?;
                Ok(ctx.emit(
                    Inst::Binary {
                        op: convert_binop(*op),
                        lhs: lhs_v,
                        rhs: rhs_v,
                    },
                    ty,
                    span,
                ))
            }
            tir::ExprKind::Unary { op, operand } => {
                let operand_v = self.lower_expr(ctx, operand)?;
                let op = match op {
                    tir::UnOp::Neg => UnaryOp::Neg,
                    tir::UnOp::Not => UnaryOp::Not,
                    tir::UnOp::BitNot => UnaryOp::BitNot,
                };
                Ok(ctx.emit(
                    Inst::Unary {
                        op,
                        operand: operand_v,
                    },
                    ty,
                    span,
                ))
            }

            tir::ExprKind::Call { callee, args } => {
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    let value = self.lower_expr(ctx, arg)?;
                    // Passing a droppable binding by value transfers ownership
                    if let tir::ExprKind::Var(name) = &arg.kind
                        && self.droppable_type_name(&value.ty).is_some()
                    {
                        ctx.mark_moved(name);
                    }
                    arg_values.push(value);
                }
                Ok(ctx.emit(
                    Inst::Call {
                        callee: callee.clone(),
                        args: arg_values,
                    },
                    ty,
                    span,
                ))
            }
            tir::ExprKind::MethodCall {
                receiver,
                type_name,
                method,
                args,
            } => {
                let receiver_v = self.lower_expr(ctx, receiver)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.lower_expr(ctx, arg)?);
                }

                // Overflow-checked arithmetic methods on integers lower to
                // runtime intrinsics (folded when the arguments are constant)
                if receiver_v.ty.is_integer() && is_overflow_method(method) {
                    let callee = format!("{}_{}", receiver_v.ty, method);
                    let mut call_args = vec![receiver_v];
                    call_args.extend(arg_values);
                    return Ok(ctx.emit(
                        Inst::Call {
                            callee,
                            args: call_args,
                        },
                        ty,
                        span,
                    ));
                }

                Ok(ctx.emit(
                    Inst::MethodCall {
                        receiver: receiver_v,
                        type_name: type_name.clone(),
                        method: method.clone(),
                        args: arg_values,
                    },
                    ty,
                    span,
                ))
            }

            tir::ExprKind::Field { base, index } => {
                let base_v = self.lower_expr(ctx, base)?;
                Ok(ctx.emit(
                    Inst::ExtractValue {
                        agg: base_v,
                        indices: smallvec::smallvec![*index],
                    },
                    ty,
                    span,
                ))
            }
            tir::ExprKind::Index { base, index } => {
                let index_v = self.lower_expr(ctx, index)?;
                let (base_ptr, known_size) = self.lower_index_base(ctx, base)?;
                let elem_ptr_ty = self.interner.pointer(ty.clone(), false);
                let ptr = ctx.emit(
                    Inst::GetElementPtr {
                        base: base_ptr,
                        indices: smallvec::smallvec![index_v],
                        bounds: BoundsInfo::checked(known_size),
                    },
                    elem_ptr_ty,
                    span,
                );
                Ok(ctx.emit(
                    Inst::Load {
                        ptr,
                        volatile: false,
                    },
                    ty,
                    span,
                ))
            }

            tir::ExprKind::StructLit { name, fields } => {
                let mut field_values = Vec::with_capacity(fields.len());
                for field in fields {
                    field_values.push(self.lower_expr(ctx, field)?);
                }
                Ok(ctx.emit(
                    Inst::StructInit {
                        name: name.clone(),
                        fields: field_values,
                    },
                    ty,
                    span,
                ))
            }
            tir::ExprKind::TupleLit(elems) => {
                let mut elem_values = Vec::with_capacity(elems.len());
                for elem in elems {
                    elem_values.push(self.lower_expr(ctx, elem)?);
                }
                Ok(ctx.emit(Inst::TupleInit { elems: elem_values }, ty, span))
            }
            tir::ExprKind::ArrayLit(elems) => {
                let element_ty = ty
                    .element()
                    .cloned()
                    .unwrap_or_else(|| self.interner.unit());
                let mut elem_values = Vec::with_capacity(elems.len());
                for elem in elems {
                    elem_values.push(self.lower_expr(ctx, elem)?);
                }
                Ok(ctx.emit(
                    Inst::ArrayInit {
                        element_ty,
                        elems: elem_values,
                    },
                    ty,
                    span,
                ))
            }
            tir::ExprKind::EnumLit {
                name,
                variant_index,
                payload,
            } => {
                let mut payload_values = Vec::with_capacity(payload.len());
                for value in payload {
                    payload_values.push(self.lower_expr(ctx, value)?);
                }
                Ok(ctx.emit(
                    Inst::EnumInit {
                        name: name.clone(),
                        variant: *variant_index,
                        payload: payload_values,
                    },
                    ty,
                    span,
                ))
            }

            tir::ExprKind::If {
                cond,
                then_block,
                else_block,
            } => self.lower_if(ctx, cond, then_block, else_block.as_ref(), ty, span),
            tir::ExprKind::When { scrutinee, arms } => {
                self.lower_when(ctx, scrutinee, arms, ty, span)
            }
            tir::ExprKind::Loop { body } => self.lower_loop(ctx, body, ty, span),
            tir::ExprKind::While { cond, body } => self.lower_while(ctx, cond, body, span),
            tir::ExprKind::For {
                pattern,
                iterable,
                body,
            } => self.lower_for(ctx, pattern, iterable, body, span),

            tir::ExprKind::Break { value } => {
                let break_value = match value {
                    Some(expr) => Some(self.lower_expr(ctx, expr)?),
                    None => None,
                };
                let Some(depth) = ctx.loop_stack.len().checked_sub(1) else {
                    debug_assert!(false, "break outside of loop");
                    return Ok(self.unit_value(ctx, span));
                };
                let drop_depth = ctx.loop_stack[depth].drop_depth;
                self.emit_unwind_drops(ctx, drop_depth);

                let loop_ctx = &mut ctx.loop_stack[depth];
                let exit = loop_ctx.exit_block;
                if let Some(value) = break_value {
                    loop_ctx.break_sources.push((ctx.current_block, value));
                }
                ctx.terminate(Terminator::Branch(exit));
                Ok(self.unit_value(ctx, span))
            }
            tir::ExprKind::Continue => {
                let Some(depth) = ctx.loop_stack.len().checked_sub(1) else {
                    debug_assert!(false, "continue outside of loop");
                    return Ok(self.unit_value(ctx, span));
                };
                let drop_depth = ctx.loop_stack[depth].drop_depth;
                self.emit_unwind_drops(ctx, drop_depth);
                let target = ctx.loop_stack[depth].continue_target;
                ctx.terminate(Terminator::Branch(target));
                Ok(self.unit_value(ctx, span))
            }
            tir::ExprKind::Return { value } => {
                let return_value = match value {
                    Some(expr) => {
                        let v = self.lower_expr(ctx, expr)?;
                        if let tir::ExprKind::Var(name) = &expr.kind {
                            ctx.mark_moved(name);
                        }
                        Some(v)
                    }
                    None => None,
                };
                self.emit_all_drops(ctx);
                let return_value = return_value.filter(|v| !v.ty.is_unit());
                ctx.terminate(Terminator::Return(return_value));
                Ok(self.unit_value(ctx, span))
            }

            tir::ExprKind::Cast { operand } => {
                let operand_v = self.lower_expr(ctx, operand)?;
                let kind = cast_kind(&operand_v.ty, &ty);
                Ok(ctx.emit(
                    Inst::Cast {
                        kind,
                        operand: operand_v,
                        target: ty.clone(),
                    },
                    ty,
                    span,
                ))
            }
            tir::ExprKind::Closure { func_name, captures } => {
                let mut capture_values = Vec::with_capacity(captures.len());
                for capture in captures {
                    capture_values.push(self.read_var(ctx, &capture.name, span));
                }
                Ok(ctx.emit(
                    Inst::ClosureInit {
                        func_name: func_name.clone(),
                        captures: capture_values,
                    },
                    ty,
                    span,
                ))
            }
            tir::ExprKind::Await { operand } => {
                debug_assert!(ctx.in_async_func, "await outside async function");
                let poll_value = self.lower_expr(ctx, operand)?;
                let suspension_id = ctx.next_suspension_id;
                ctx.next_suspension_id += 1;
                Ok(ctx.emit(
                    Inst::Await {
                        poll_value,
                        suspension_id,
                    },
                    ty,
                    span,
                ))
            }
        }
    }

    // ============ Control Flow ============

    fn lower_short_circuit(
        &mut self,
        ctx: &mut BuildContext,
        op: tir::BinOp,
        lhs: &tir::Expr,
        rhs: &tir::Expr,
        ty: TypeRef,
        span: Span,
    ) -> Result<Value> {
        let lhs_v = self.lower_expr(ctx, lhs)?;
        // Literal short-circuit value taken when the rhs is skipped
        let short_value = ctx.emit(
            Inst::ConstBool {
                value: matches!(op, tir::BinOp::Or),
            },
            ty.clone(),
            span,
        );
        let lhs_end = ctx.current_block;

        let rhs_block = ctx.func.add_block(if matches!(op, tir::BinOp::And) {
            "and_rhs"
        } else {
            "or_rhs"
        });
        let merge = ctx.func.add_block("sc_merge");

        let term = match op {
            tir::BinOp::And => Terminator::CondBranch {
                cond: lhs_v,
                then_block: rhs_block,
                else_block: merge,
            },
            _ => Terminator::CondBranch {
                cond: lhs_v,
                then_block: merge,
                else_block: rhs_block,
            },
        };
        ctx.func.set_terminator(lhs_end, term);

        ctx.switch_to(rhs_block);
        let rhs_v = self.lower_expr(ctx, rhs)?;
        let rhs_end = ctx.current_block;
        let rhs_reaches = !ctx.is_terminated();
        if rhs_reaches {
            ctx.func.set_terminator(rhs_end, Terminator::Branch(merge));
        }

        ctx.switch_to(merge);
        let mut incomings = smallvec::smallvec![(short_value, lhs_end)];
        if rhs_reaches {
            incomings.push((rhs_v, rhs_end));
        }
        Ok(ctx.emit(Inst::Phi { incomings }, ty, span))
    }

    fn lower_if(
        &mut self,
        ctx: &mut BuildContext,
        cond: &tir::Expr,
        then_block: &tir::Block,
        else_block: Option<&tir::Block>,
        ty: TypeRef,
        span: Span,
    ) -> Result<Value> {
        let cond_v = self.lower_expr(ctx, cond)?;

        let then_b = ctx.func.add_block("then");
        let merge = ctx.func.add_block("merge");
        let else_b = match else_block {
            Some(_) => ctx.func.add_block("else"),
            None => merge,
        };

        ctx.func.set_terminator(
            ctx.current_block,
            Terminator::CondBranch {
                cond: cond_v,
                then_block: then_b,
                else_block: else_b,
            },
        );

        let mut arm_ends: Vec<(BlockId, Value)> = Vec::new();

        ctx.switch_to(then_b);
        let then_v = self.lower_block(ctx, then_block)?;
        if !ctx.is_terminated() {
            arm_ends.push((ctx.current_block, then_v));
            ctx.func
                .set_terminator(ctx.current_block, Terminator::Branch(merge));
        }

        if let Some(else_block) = else_block {
            ctx.switch_to(else_b);
            let else_v = self.lower_block(ctx, else_block)?;
            if !ctx.is_terminated() {
                arm_ends.push((ctx.current_block, else_v));
                ctx.func
                    .set_terminator(ctx.current_block, Terminator::Branch(merge));
            }
        }

        ctx.switch_to(merge);
        self.merge_value(ctx, arm_ends, else_block.is_some(), ty, span)
    }

    /// Join arm values at a merge block: a phi when several arms reach it
    /// with a non-unit value, the single value when only one does
    fn merge_value(
        &mut self,
        ctx: &mut BuildContext,
        arm_ends: Vec<(BlockId, Value)>,
        all_arms_present: bool,
        ty: TypeRef,
        span: Span,
    ) -> Result<Value> {
        if ty.is_unit() || !all_arms_present {
            return Ok(self.unit_value(ctx, span));
        }
        match arm_ends.len() {
            0 => Ok(self.unit_value(ctx, span)),
            1 => Ok(arm_ends.into_iter().next().unwrap().1),
            _ => {
                let incomings = arm_ends
                    .into_iter()
                    .map(|(block, value)| (value, block))
                    .collect();
                Ok(ctx.emit(Inst::Phi { incomings }, ty, span))
            }
        }
    }

    fn lower_when(
        &mut self,
        ctx: &mut BuildContext,
        scrutinee: &tir::Expr,
        arms: &[tir::Arm],
        ty: TypeRef,
        span: Span,
    ) -> Result<Value> {
        let scrut = self.lower_expr(ctx, scrutinee)?;

        if arms.is_empty() {
            return Ok(self.unit_value(ctx, span));
        }

        let test_blocks: Vec<BlockId> = (0..arms.len())
            .map(|i| ctx.func.add_block(format!("when_test{i}")))
            .collect();
        let body_blocks: Vec<BlockId> = (0..arms.len())
            .map(|i| ctx.func.add_block(format!("when_body{i}")))
            .collect();
        let merge = ctx.func.add_block("when_merge");

        ctx.func
            .set_terminator(ctx.current_block, Terminator::Branch(test_blocks[0]));

        let mut trap_block: Option<BlockId> = None;
        let mut arm_ends: Vec<(BlockId, Value)> = Vec::new();

        for (i, arm) in arms.iter().enumerate() {
            ctx.switch_to(test_blocks[i]);
            let test = self.lower_pattern_test(ctx, &arm.pattern, &scrut, span)?;
            match test {
                None => {
                    ctx.func
                        .set_terminator(ctx.current_block, Terminator::Branch(body_blocks[i]));
                }
                Some(cond) => {
                    // The type checker guarantees exhaustiveness; a failing
                    // last test is unreachable
                    let fallthrough = if i + 1 < arms.len() {
                        test_blocks[i + 1]
                    } else {
                        *trap_block.get_or_insert_with(|| {
                            let b = ctx.func.add_block("when_unreachable");
                            ctx.func.set_terminator(b, Terminator::Unreachable);
                            b
                        })
                    };
                    ctx.func.set_terminator(
                        ctx.current_block,
                        Terminator::CondBranch {
                            cond,
                            then_block: body_blocks[i],
                            else_block: fallthrough,
                        },
                    );
                }
            }

            ctx.switch_to(body_blocks[i]);
            let saved_vars = ctx.variables.clone();
            self.bind_pattern(ctx, &arm.pattern, scrut.clone(), span)?;
            let value = self.lower_block(ctx, &arm.body)?;
            if !ctx.is_terminated() {
                arm_ends.push((ctx.current_block, value));
                ctx.func
                    .set_terminator(ctx.current_block, Terminator::Branch(merge));
            }
            ctx.variables = saved_vars;
        }

        ctx.switch_to(merge);
        self.merge_value(ctx, arm_ends, true, ty, span)
    }

    /// Runtime test for a pattern; `None` means the pattern always matches
    fn lower_pattern_test(
        &mut self,
        ctx: &mut BuildContext,
        pattern: &tir::Pattern,
        value: &Value,
        span: Span,
    ) -> Result<Option<Value>> {
        let bool_ty = self.interner.bool_();
        match pattern {
            tir::Pattern::Wildcard | tir::Pattern::Binding(_) => Ok(None),
            tir::Pattern::IntLit(expected) => {
                let expected_v = ctx.emit(
                    Inst::ConstInt {
                        value: *expected,
                        bits: value.ty.bit_width().min(128) as u8,
                        signed: value.ty.is_signed(),
                    },
                    value.ty.clone(),
                    span,
                );
                Ok(Some(ctx.emit(
                    Inst::Binary {
                        op: BinOp::Eq,
                        lhs: value.clone(),
                        rhs: expected_v,
                    },
                    bool_ty,
                    span,
                )))
            }
            tir::Pattern::BoolLit(expected) => {
                let expected_v = ctx.emit(
                    Inst::ConstBool { value: *expected },
                    value.ty.clone(),
                    span,
                );
                Ok(Some(ctx.emit(
                    Inst::Binary {
                        op: BinOp::Eq,
                        lhs: value.clone(),
                        rhs: expected_v,
                    },
                    bool_ty,
                    span,
                )))
            }
            tir::Pattern::Tuple(elems) => {
                let mut combined: Option<Value> = None;
                for (i, sub) in elems.iter().enumerate() {
                    let elem_ty = self.tuple_elem_ty(&value.ty, i);
                    let elem = ctx.emit(
                        Inst::ExtractValue {
                            agg: value.clone(),
                            indices: smallvec::smallvec![i as u32],
                        },
                        elem_ty,
                        span,
                    );
                    if let Some(test) = self.lower_pattern_test(ctx, sub, &elem, span)? {
                        combined = Some(self.and_tests(ctx, combined, test, span));
                    }
                }
                Ok(combined)
            }
            tir::Pattern::Struct { name, fields } => {
                let mut combined: Option<Value> = None;
                for (index, sub) in fields {
                    let field_ty = self.struct_field_ty(name, *index);
                    let field = ctx.emit(
                        Inst::ExtractValue {
                            agg: value.clone(),
                            indices: smallvec::smallvec![*index],
                        },
                        field_ty,
                        span,
                    );
                    if let Some(test) = self.lower_pattern_test(ctx, sub, &field, span)? {
                        combined = Some(self.and_tests(ctx, combined, test, span));
                    }
                }
                Ok(combined)
            }
            tir::Pattern::Enum {
                name,
                variant_index,
                payload,
            } => {
                let i64_ty = self.interner.i64_();
                let disc = ctx.emit(
                    Inst::ExtractValue {
                        agg: value.clone(),
                        indices: smallvec::smallvec![0u32],
                    },
                    i64_ty.clone(),
                    span,
                );
                let expected = ctx.emit(
                    Inst::ConstInt {
                        value: *variant_index as i128,
                        bits: 64,
                        signed: true,
                    },
                    i64_ty,
                    span,
                );
                let mut combined = ctx.emit(
                    Inst::Binary {
                        op: BinOp::Eq,
                        lhs: disc,
                        rhs: expected,
                    },
                    bool_ty,
                    span,
                );
                for (j, sub) in payload.iter().enumerate() {
                    if sub.is_irrefutable() {
                        continue;
                    }
                    let payload_ty = self.enum_payload_ty(name, *variant_index, j);
                    let slot = ctx.emit(
                        Inst::ExtractValue {
                            agg: value.clone(),
                            indices: smallvec::smallvec![1 + j as u32],
                        },
                        payload_ty,
                        span,
                    );
                    if let Some(test) = self.lower_pattern_test(ctx, sub, &slot, span)? {
                        combined = self.and_tests(ctx, Some(combined), test, span);
                    }
                }
                Ok(Some(combined))
            }
            tir::Pattern::Or(alts) => {
                let mut combined: Option<Value> = None;
                let mut any_refutable = false;
                for alt in alts {
                    match self.lower_pattern_test(ctx, alt, value, span)? {
                        None => return Ok(None), // one alternative always matches
                        Some(test) => {
                            any_refutable = true;
                            combined = Some(match combined {
                                None => test,
                                Some(prev) => {
                                    let bool_ty = self.interner.bool_();
                                    ctx.emit(
                                        Inst::Binary {
                                            op: BinOp::Or,
                                            lhs: prev,
                                            rhs: test,
                                        },
                                        bool_ty,
                                        span,
                                    )
                                }
                            });
                        }
                    }
                }
                Ok(if any_refutable { combined } else { None })
            }
        }
    }

    fn and_tests(
        &mut self,
        ctx: &mut BuildContext,
        combined: Option<Value>,
        test: Value,
        span: Span,
    ) -> Value {
        match combined {
            None => test,
            Some(prev) => {
                let bool_ty = self.interner.bool_();
                ctx.emit(
                    Inst::Binary {
                        op: BinOp::And,
                        lhs: prev,
                        rhs: test,
                    },
                    bool_ty,
                    span,
                )
            }
        }
    }

    fn lower_loop(
        &mut self,
        ctx: &mut BuildContext,
        body: &tir::Block,
        ty: TypeRef,
        span: Span,
    ) -> Result<Value> {
        let header = ctx.func.add_block("loop_header");
        let body_b = ctx.func.add_block("loop_body");
        let exit = ctx.func.add_block("loop_exit");

        ctx.func
            .set_terminator(ctx.current_block, Terminator::Branch(header));
        ctx.func.set_terminator(header, Terminator::Branch(body_b));

        ctx.loop_stack.push(LoopContext {
            continue_target: header,
            exit_block: exit,
            drop_depth: ctx.drop_scopes.len(),
            break_sources: Vec::new(),
        });

        ctx.switch_to(body_b);
        self.lower_block(ctx, body)?;
        if !ctx.is_terminated() {
            ctx.func
                .set_terminator(ctx.current_block, Terminator::Branch(header));
        }

        let loop_ctx = ctx.loop_stack.pop().expect("loop context");
        ctx.switch_to(exit);

        if !ty.is_unit() && !loop_ctx.break_sources.is_empty() {
            if loop_ctx.break_sources.len() == 1 {
                return Ok(loop_ctx.break_sources.into_iter().next().unwrap().1);
            }
            let incomings = loop_ctx
                .break_sources
                .into_iter()
                .map(|(block, value)| (value, block))
                .collect();
            return Ok(ctx.emit(Inst::Phi { incomings }, ty, span));
        }
        Ok(self.unit_value(ctx, span))
    }

    fn lower_while(
        &mut self,
        ctx: &mut BuildContext,
        cond: &tir::Expr,
        body: &tir::Block,
        span: Span,
    ) -> Result<Value> {
        let header = ctx.func.add_block("while_header");
        let body_b = ctx.func.add_block("while_body");
        let exit = ctx.func.add_block("while_exit");

        ctx.func
            .set_terminator(ctx.current_block, Terminator::Branch(header));

        ctx.switch_to(header);
        let cond_v = self.lower_expr(ctx, cond)?;
        ctx.func.set_terminator(
            ctx.current_block,
            Terminator::CondBranch {
                cond: cond_v,
                then_block: body_b,
                else_block: exit,
            },
        );

        ctx.loop_stack.push(LoopContext {
            continue_target: header,
            exit_block: exit,
            drop_depth: ctx.drop_scopes.len(),
            break_sources: Vec::new(),
        });

        ctx.switch_to(body_b);
        self.lower_block(ctx, body)?;
        if !ctx.is_terminated() {
            ctx.func
                .set_terminator(ctx.current_block, Terminator::Branch(header));
        }
        ctx.loop_stack.pop();

        ctx.switch_to(exit);
        Ok(self.unit_value(ctx, span))
    }

    /// `for pattern in iterable { body }` lowers to the indexed form:
    /// `idx = 0; while idx < len { bind pattern = iterable[idx]; body; idx += 1 }`
    fn lower_for(
        &mut self,
        ctx: &mut BuildContext,
        pattern: &tir::Pattern,
        iterable: &tir::Expr,
        body: &tir::Block,
        span: Span,
    ) -> Result<Value> {
        let i64_ty = self.interner.i64_();

        let (base_ptr, known_size) = self.lower_index_base(ctx, iterable)?;
        let elem_ty = base_ptr
            .ty
            .pointee()
            .and_then(|p| p.element().cloned())
            .or_else(|| base_ptr.ty.element().cloned())
            .unwrap_or_else(|| self.interner.unit());

        // Length: static for arrays, len() call otherwise
        let len = match known_size {
            Some(size) => ctx.emit(
                Inst::ConstInt {
                    value: size as i128,
                    bits: 64,
                    signed: true,
                },
                i64_ty.clone(),
                span,
            ),
            None => ctx.emit(
                Inst::Call {
                    callee: "len".to_string(),
                    args: vec![base_ptr.clone()],
                },
                i64_ty.clone(),
                span,
            ),
        };

        // Index slot
        let idx_ptr_ty = self.interner.pointer(i64_ty.clone(), true);
        let idx_ptr = ctx.emit(
            Inst::Alloca {
                ty: i64_ty.clone(),
                name: "for_idx".to_string(),
            },
            idx_ptr_ty,
            span,
        );
        let zero = ctx.emit(
            Inst::ConstInt {
                value: 0,
                bits: 64,
                signed: true,
            },
            i64_ty.clone(),
            span,
        );
        ctx.emit_void(
            Inst::Store {
                ptr: idx_ptr.clone(),
                value: zero,
                volatile: false,
            },
            span,
        );

        let header = ctx.func.add_block("for_header");
        let body_b = ctx.func.add_block("for_body");
        let step = ctx.func.add_block("for_step");
        let exit = ctx.func.add_block("for_exit");

        ctx.func
            .set_terminator(ctx.current_block, Terminator::Branch(header));

        // Header: idx < len
        ctx.switch_to(header);
        let idx = ctx.emit(
            Inst::Load {
                ptr: idx_ptr.clone(),
                volatile: false,
            },
            i64_ty.clone(),
            span,
        );
        let bool_ty = self.interner.bool_();
        let cond = ctx.emit(
            Inst::Binary {
                op: BinOp::Lt,
                lhs: idx.clone(),
                rhs: len,
            },
            bool_ty,
            span,
        );
        ctx.func.set_terminator(
            header,
            Terminator::CondBranch {
                cond,
                then_block: body_b,
                else_block: exit,
            },
        );

        ctx.loop_stack.push(LoopContext {
            continue_target: step,
            exit_block: exit,
            drop_depth: ctx.drop_scopes.len(),
            break_sources: Vec::new(),
        });

        // Body: bind the element and lower the block
        ctx.switch_to(body_b);
        let elem_ptr_ty = self.interner.pointer(elem_ty.clone(), false);
        let elem_ptr = ctx.emit(
            Inst::GetElementPtr {
                base: base_ptr,
                indices: smallvec::smallvec![idx],
                bounds: BoundsInfo::checked(known_size),
            },
            elem_ptr_ty,
            span,
        );
        let elem = ctx.emit(
            Inst::Load {
                ptr: elem_ptr,
                volatile: false,
            },
            elem_ty,
            span,
        );
        let saved_vars = ctx.variables.clone();
        self.bind_pattern(ctx, pattern, elem, span)?;
        self.lower_block(ctx, body)?;
        if !ctx.is_terminated() {
            ctx.func
                .set_terminator(ctx.current_block, Terminator::Branch(step));
        }
        ctx.variables = saved_vars;
        ctx.loop_stack.pop();

        // Step: idx += 1
        ctx.switch_to(step);
        let idx2 = ctx.emit(
            Inst::Load {
                ptr: idx_ptr.clone(),
                volatile: false,
            },
            i64_ty.clone(),
            span,
        );
        let one = ctx.emit(
            Inst::ConstInt {
                value: 1,
                bits: 64,
                signed: true,
            },
            i64_ty.clone(),
            span,
        );
        let next = ctx.emit(
            Inst::Binary {
                op: BinOp::Add,
                lhs: idx2,
                rhs: one,
            },
            i64_ty,
            span,
        );
        ctx.emit_void(
            Inst::Store {
                ptr: idx_ptr,
                value: next,
                volatile: false,
            },
            span,
        );
        ctx.func.set_terminator(step, Terminator::Branch(header));

        ctx.switch_to(exit);
        Ok(self.unit_value(ctx, span))
    }

    // ============ Places ============

    /// Lower an expression as an assignable place, returning its pointer
    /// and volatility. `None` when the expression is an immutable SSA name.
    fn lower_place(
        &mut self,
        ctx: &mut BuildContext,
        expr: &tir::Expr,
    ) -> Result<Option<(Value, bool)>> {
        match &expr.kind {
            tir::ExprKind::Var(name) => match ctx.variables.get(name) {
                Some(Binding::Slot { ptr, volatile, .. }) => {
                    Ok(Some((ptr.clone(), *volatile)))
                }
                _ => Ok(None),
            },
            tir::ExprKind::Index { base, index } => {
                let index_v = self.lower_expr(ctx, index)?;
                let (base_ptr, known_size) = self.lower_index_base(ctx, base)?;
                let elem_ty = self.convert_ty(&expr.ty);
                let ptr_ty = self.interner.pointer(elem_ty, true);
                let ptr = ctx.emit(
                    Inst::GetElementPtr {
                        base: base_ptr,
                        indices: smallvec::smallvec![index_v],
                        bounds: BoundsInfo::checked(known_size),
                    },
                    ptr_ty,
                    expr.span,
                );
                Ok(Some((ptr, false)))
            }
            tir::ExprKind::Field { base, index } => {
                let place = self.lower_place(ctx, base)?;
                let (base_ptr, volatile) = match place {
                    Some(p) => p,
                    None => {
                        let value = self.lower_expr(ctx, base)?;
                        (self.spill(ctx, value, expr.span), false)
                    }
                };
                let i64_ty = self.interner.i64_();
                let index_v = ctx.emit(
                    Inst::ConstInt {
                        value: *index as i128,
                        bits: 64,
                        signed: true,
                    },
                    i64_ty,
                    expr.span,
                );
                let field_ty = self.convert_ty(&expr.ty);
                let ptr_ty = self.interner.pointer(field_ty, true);
                let ptr = ctx.emit(
                    Inst::GetElementPtr {
                        base: base_ptr,
                        indices: smallvec::smallvec![index_v],
                        bounds: BoundsInfo::unchecked(),
                    },
                    ptr_ty,
                    expr.span,
                );
                Ok(Some((ptr, volatile)))
            }
            _ => Ok(None),
        }
    }

    /// Base pointer (plus static size, when known) for indexing.
    /// Arrays are indexed through a pointer - an existing slot when the
    /// base names one, otherwise a spill; slice values are their own handle.
    fn lower_index_base(
        &mut self,
        ctx: &mut BuildContext,
        base: &tir::Expr,
    ) -> Result<(Value, Option<u64>)> {
        let base_ty = self.convert_ty(&base.ty);
        let known_size = base_ty.array_size();

        if matches!(*base_ty, Type::Slice { .. }) {
            let value = self.lower_expr(ctx, base)?;
            return Ok((value, None));
        }

        if let Some(place) = self.lower_place(ctx, base)? {
            return Ok((place.0, known_size));
        }
        let value = self.lower_expr(ctx, base)?;
        Ok((self.spill(ctx, value, base.span), known_size))
    }

    /// Copy an SSA value into a fresh stack slot and return the pointer
    fn spill(&mut self, ctx: &mut BuildContext, value: Value, span: Span) -> Value {
        let elem_ty = value.ty.clone();
        let ptr_ty = self.interner.pointer(elem_ty.clone(), false);
        let ptr = ctx.emit(
            Inst::Alloca {
                ty: elem_ty,
                name: "spill".to_string(),
            },
            ptr_ty,
            span,
        );
        ctx.emit_void(
            Inst::Store {
                ptr: ptr.clone(),
                value,
                volatile: false,
            },
            span,
        );
        ptr
    }

    // ============ Bindings and Drops ============

    fn read_var(&mut self, ctx: &mut BuildContext, name: &str, span: Span) -> Value {
        match ctx.variables.get(name).cloned() {
            Some(Binding::Ssa(value)) => value,
            Some(Binding::Slot {
                ptr,
                elem_ty,
                volatile,
            }) => ctx.emit(Inst::Load { ptr, volatile }, elem_ty, span),
            None => {
                debug_assert!(false, "unknown variable `{name}`");
                self.unit_value(ctx, span)
            }
        }
    }

    /// Destructure `value` according to `pattern`, binding names as SSA
    /// values. Or-patterns bind from their first alternative.
    fn bind_pattern(
        &mut self,
        ctx: &mut BuildContext,
        pattern: &tir::Pattern,
        value: Value,
        span: Span,
    ) -> Result<()> {
        match pattern {
            tir::Pattern::Wildcard | tir::Pattern::IntLit(_) | tir::Pattern::BoolLit(_) => Ok(()),
            tir::Pattern::Binding(name) => {
                ctx.variables.insert(name.clone(), Binding::Ssa(value));
                Ok(())
            }
            tir::Pattern::Tuple(elems) => {
                for (i, sub) in elems.iter().enumerate() {
                    if matches!(sub, tir::Pattern::Wildcard) {
                        continue;
                    }
                    let elem_ty = self.tuple_elem_ty(&value.ty, i);
                    let elem = ctx.emit(
                        Inst::ExtractValue {
                            agg: value.clone(),
                            indices: smallvec::smallvec![i as u32],
                        },
                        elem_ty,
                        span,
                    );
                    self.bind_pattern(ctx, sub, elem, span)?;
                }
                Ok(())
            }
            tir::Pattern::Struct { name, fields } => {
                for (index, sub) in fields {
                    if matches!(sub, tir::Pattern::Wildcard) {
                        continue;
                    }
                    let field_ty = self.struct_field_ty(name, *index);
                    let field = ctx.emit(
                        Inst::ExtractValue {
                            agg: value.clone(),
                            indices: smallvec::smallvec![*index],
                        },
                        field_ty,
                        span,
                    );
                    self.bind_pattern(ctx, sub, field, span)?;
                }
                Ok(())
            }
            tir::Pattern::Enum {
                name,
                variant_index,
                payload,
            } => {
                for (j, sub) in payload.iter().enumerate() {
                    if matches!(sub, tir::Pattern::Wildcard) {
                        continue;
                    }
                    let payload_ty = self.enum_payload_ty(name, *variant_index, j);
                    let slot = ctx.emit(
                        Inst::ExtractValue {
                            agg: value.clone(),
                            indices: smallvec::smallvec![1 + j as u32],
                        },
                        payload_ty,
                        span,
                    );
                    self.bind_pattern(ctx, sub, slot, span)?;
                }
                Ok(())
            }
            tir::Pattern::Or(alts) => match alts.first() {
                Some(first) => self.bind_pattern(ctx, first, value, span),
                None => Ok(()),
            },
        }
    }

    /// Emit drop calls for the current (innermost) scope, LIFO
    fn emit_scope_exit_drops(&mut self, ctx: &mut BuildContext) {
        let Some(scope) = ctx.drop_scopes.last() else {
            return;
        };
        let drops: Vec<DropInfo> = scope
            .iter()
            .rev()
            .filter(|d| !d.moved && !d.dropped)
            .cloned()
            .collect();
        self.emit_drop_calls(ctx, &drops);
    }

    /// Emit drops for every scope (return paths), innermost first
    fn emit_all_drops(&mut self, ctx: &mut BuildContext) {
        let drops: Vec<DropInfo> = ctx
            .drop_scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .filter(|d| !d.moved && !d.dropped)
            .cloned()
            .collect();
        self.emit_drop_calls(ctx, &drops);
    }

    /// Emit drops for scopes deeper than `target_depth` (break/continue),
    /// marking them dropped so the normal exit does not drop them again
    fn emit_unwind_drops(&mut self, ctx: &mut BuildContext, target_depth: usize) {
        let drops: Vec<DropInfo> = ctx
            .drop_scopes
            .iter()
            .skip(target_depth)
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .filter(|d| !d.moved && !d.dropped)
            .cloned()
            .collect();
        self.emit_drop_calls(ctx, &drops);
        for scope in ctx.drop_scopes.iter_mut().skip(target_depth) {
            for info in scope {
                info.dropped = true;
            }
        }
    }

    fn emit_drop_calls(&mut self, ctx: &mut BuildContext, drops: &[DropInfo]) {
        for info in drops {
            let value = self.read_var(ctx, &info.var_name, Span::default());
            let unit = self.interner.unit();
            let _ = ctx.emit(
                Inst::Call {
                    callee: format!("{}_drop", info.type_name),
                    args: vec![value],
                },
                unit,
                Span::default(),
            );
        }
    }

    // ============ Layout Lookups ============

    fn tuple_elem_ty(&mut self, tuple_ty: &Type, index: usize) -> TypeRef {
        match tuple_ty {
            Type::Tuple(elems) => elems
                .get(index)
                .cloned()
                .unwrap_or_else(|| self.interner.unit()),
            _ => self.interner.unit(),
        }
    }

    fn struct_field_ty(&mut self, name: &str, index: u32) -> TypeRef {
        self.module
            .struct_def(name)
            .and_then(|def| def.fields.get(index as usize))
            .map(|(_, ty)| ty.clone())
            .unwrap_or_else(|| self.interner.unit())
    }

    fn enum_payload_ty(&mut self, name: &str, variant: u32, slot: usize) -> TypeRef {
        self.module
            .enum_def(name)
            .and_then(|def| def.variants.get(variant as usize))
            .and_then(|(_, payload)| payload.get(slot))
            .cloned()
            .unwrap_or_else(|| self.interner.unit())
    }

    fn unit_value(&mut self, ctx: &mut BuildContext, span: Span) -> Value {
        let unit = self.interner.unit();
        ctx.emit(Inst::ConstUnit, unit, span)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn convert_binop(op: tir::BinOp) -> BinOp {
    match op {
        tir::BinOp::Add => BinOp::Add,
        tir::BinOp::Sub => BinOp::Sub,
        tir::BinOp::Mul => BinOp::Mul,
        tir::BinOp::Div => BinOp::Div,
        tir::BinOp::Mod => BinOp::Mod,
        tir::BinOp::Eq => BinOp::Eq,
        tir::BinOp::Ne => BinOp::Ne,
        tir::BinOp::Lt => BinOp::Lt,
        tir::BinOp::Le => BinOp::Le,
        tir::BinOp::Gt => BinOp::Gt,
        tir::BinOp::Ge => BinOp::Ge,
        tir::BinOp::And => BinOp::And,
        tir::BinOp::Or => BinOp::Or,
        tir::BinOp::BitAnd => BinOp::BitAnd,
        tir::BinOp::BitOr => BinOp::BitOr,
        tir::BinOp::BitXor => BinOp::BitXor,
        tir::BinOp::Shl => BinOp::Shl,
        tir::BinOp::Shr => BinOp::Shr,
    }
}

fn is_overflow_method(method: &str) -> bool {
    matches!(
        method,
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
}

/// Cast kind for an `operand as target` coercion
fn cast_kind(from: &Type, to: &Type) -> CastKind {
    if from.is_integer() && to.is_integer() {
        let from_bits = from.bit_width();
        let to_bits = to.bit_width();
        if to_bits > from_bits {
            if from.is_signed() {
                CastKind::SignExtend
            } else {
                CastKind::ZeroExtend
            }
        } else if to_bits < from_bits {
            CastKind::Truncate
        } else {
            CastKind::Bitcast
        }
    } else if from.is_float() && to.is_float() {
        if to.bit_width() > from.bit_width() {
            CastKind::FloatExtend
        } else {
            CastKind::FloatTruncate
        }
    } else if from.is_float() && to.is_integer() {
        CastKind::FloatToInt
    } else if from.is_integer() && to.is_float() {
        CastKind::IntToFloat
    } else if from.is_integer() && to.is_pointer() {
        CastKind::IntToPtr
    } else if from.is_pointer() && to.is_integer() {
        CastKind::PtrToInt
    } else {
        CastKind::Bitcast
    }
}
