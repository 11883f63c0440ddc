//! MIR optimization framework
//!
//! Passes come in two shapes: [`FunctionPass`] (one function at a time) and
//! [`ModulePass`] (whole module). Both return whether they changed IR. The
//! [`PassManager`] owns an ordered pipeline per optimization level:
//!
//! - **O0**: essential passes only (memory-leak check, infinite-loop
//!   detection, async lowering, sret conversion)
//! - **O1**: adds constant folding, dead-code elimination, simple CSE,
//!   branch simplification, and simple inlining
//! - **O2**: adds escape analysis + stack promotion, bounds-check
//!   elimination, RVO, interprocedural constant propagation, argument
//!   promotion, attribute inference, and loop-invariant code motion
//! - **O3**: adds advanced loop optimizations, SIMD vectorization, and
//!   aggressive inlining (profile-guided when profile data is attached)
//!
//! The simple-pass subset is re-run per function until it reports no
//! change, with a hard iteration cap. Execution is single-threaded and all
//! statistics iterate in insertion order, so output is deterministic.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::Diagnostic;

use super::async_lowering::AsyncLoweringPass;
use super::bce::BoundsCheckEliminationPass;
use super::checks::{InfiniteLoopCheckPass, MemoryLeakCheckPass};
use super::escape::StackPromotionPass;
use super::ipo::{ArgPromotionPass, AttrInferencePass, IpcpPass};
use super::loops::{
    LoopDistributionPass, LoopFusionPass, LoopInterchangePass, LoopInvariantCodeMotion,
    LoopTilingPass,
};
use super::rvo::{RvoPass, SretConversionPass};
use super::types::Type;
use super::vectorize::{LoopVectorizePass, SlpVectorizePass};
use super::{BinOp, Function, Inst, InstructionRecord, Module, Terminator, UnaryOp, Value, ValueId};

/// A pass over one function at a time
pub trait FunctionPass {
    /// Pass name for logging and statistics
    fn name(&self) -> &'static str;

    /// Run on a function; returns true if any IR changed
    fn run_on_function(&mut self, func: &mut Function) -> bool;
}

/// A pass over the whole module
pub trait ModulePass {
    /// Pass name for logging and statistics
    fn name(&self) -> &'static str;

    /// Run on the module; returns true if any IR changed
    fn run(&mut self, module: &mut Module) -> bool;

    /// Diagnostics collected during the last `run()`
    fn diagnostics(&self) -> Vec<Diagnostic> {
        Vec::new()
    }
}

/// Optimization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum OptLevel {
    O0,
    #[default]
    O1,
    O2,
    O3,
}

impl OptLevel {
    pub fn from_number(n: u8) -> Self {
        match n {
            0 => OptLevel::O0,
            1 => OptLevel::O1,
            2 => OptLevel::O2,
            _ => OptLevel::O3,
        }
    }
}

/// Profile-guided optimization data, loaded from a JSON document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileData {
    /// Dynamic call counts per function name
    #[serde(default)]
    pub call_counts: IndexMap<String, u64>,
    /// Hot block ids per function, most frequent first
    #[serde(default)]
    pub hot_blocks: IndexMap<String, Vec<u32>>,
}

impl ProfileData {
    pub fn is_hot(&self, func_name: &str) -> bool {
        self.call_counts.get(func_name).copied().unwrap_or(0) >= 1000
    }
}

/// Statistics from a pipeline run
#[derive(Debug, Default)]
pub struct OptimizationStats {
    /// Fixed-point iterations used (max over functions)
    pub iterations: usize,
    /// Change-reporting runs per pass, in first-run order
    pub pass_counts: IndexMap<String, usize>,
}

impl OptimizationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pass(&mut self, name: &str) {
        *self.pass_counts.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &OptimizationStats) {
        self.iterations = self.iterations.max(other.iterations);
        for (name, count) in &other.pass_counts {
            *self.pass_counts.entry(name.clone()).or_insert(0) += count;
        }
    }
}

enum PassEntry {
    Function(Box<dyn FunctionPass>),
    Module(Box<dyn ModulePass>),
}

/// Owns the pass pipeline for one optimization level.
///
/// Pass instances are constructed per `run()` so their fields never leak
/// state between invocations; profile data attached beforehand is handed
/// to the passes that consume it (inliner, block layout).
pub struct PassManager {
    level: OptLevel,
    max_iterations: usize,
    profile: Option<ProfileData>,
    diagnostics: Vec<Diagnostic>,
}

impl PassManager {
    /// Create a manager for an optimization level
    pub fn for_level(level: OptLevel) -> Self {
        Self {
            level,
            max_iterations: 10,
            profile: None,
            diagnostics: Vec::new(),
        }
    }

    pub fn level(&self) -> OptLevel {
        self.level
    }

    /// Attach profile-guided data consumed by the inliner and block layout
    pub fn set_profile_data(&mut self, profile: ProfileData) {
        self.profile = Some(profile);
    }

    pub fn set_max_iterations(&mut self, n: usize) {
        self.max_iterations = n;
    }

    /// Diagnostics collected from analysis passes during the last run
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.is_error())
    }

    /// Analysis checks run first; their error diagnostics fail the build
    fn build_checks() -> Vec<Box<dyn ModulePass>> {
        vec![
            Box::new(MemoryLeakCheckPass::new()),
            Box::new(InfiniteLoopCheckPass::new()),
        ]
    }

    /// Simple passes iterated to a fixed point per function
    fn build_simple(&self) -> Vec<Box<dyn FunctionPass>> {
        let mut passes: Vec<Box<dyn FunctionPass>> = Vec::new();
        if self.level >= OptLevel::O1 {
            passes.push(Box::new(ConstantFolding::new()));
            passes.push(Box::new(DeadCodeElimination::new()));
            passes.push(Box::new(SimpleCse::new()));
            passes.push(Box::new(SimplifyBranches::new()));
        }
        passes
    }

    /// Remaining pipeline, in order
    fn build_late(&self) -> Vec<PassEntry> {
        let mut late: Vec<PassEntry> = Vec::new();

        if self.level >= OptLevel::O2 {
            late.push(PassEntry::Function(Box::new(StackPromotionPass::new())));
            late.push(PassEntry::Function(Box::new(
                BoundsCheckEliminationPass::new(),
            )));
            late.push(PassEntry::Function(Box::new(RvoPass::new())));
        }

        if self.level >= OptLevel::O1 {
            let mut inliner = InlinePass::new(self.level >= OptLevel::O3);
            if let Some(profile) = &self.profile {
                inliner.set_profile(profile.clone());
            }
            late.push(PassEntry::Module(Box::new(inliner)));
        }

        if self.level >= OptLevel::O2 {
            late.push(PassEntry::Module(Box::new(IpcpPass::new())));
            late.push(PassEntry::Module(Box::new(ArgPromotionPass::new())));
            late.push(PassEntry::Module(Box::new(AttrInferencePass::new())));
            late.push(PassEntry::Function(Box::new(LoopInvariantCodeMotion::new())));
        }

        if self.level >= OptLevel::O3 {
            late.push(PassEntry::Function(Box::new(LoopInterchangePass::new())));
            late.push(PassEntry::Function(Box::new(LoopTilingPass::new(32))));
            late.push(PassEntry::Function(Box::new(LoopFusionPass::new())));
            late.push(PassEntry::Function(Box::new(LoopDistributionPass::new())));
            late.push(PassEntry::Function(Box::new(LoopVectorizePass::new())));
            late.push(PassEntry::Function(Box::new(SlpVectorizePass::new())));
        }

        // State machines late so prior passes see the pre-transformed form;
        // sret conversion last, after all inlining
        late.push(PassEntry::Module(Box::new(AsyncLoweringPass::new())));
        late.push(PassEntry::Module(Box::new(SretConversionPass::new())));

        if let Some(profile) = &self.profile {
            let mut layout = BlockLayoutPass::new();
            layout.set_profile(profile.clone());
            late.push(PassEntry::Module(Box::new(layout)));
        }

        late
    }

    /// Run the full pipeline on a module
    pub fn run(&mut self, module: &mut Module) -> OptimizationStats {
        let mut stats = OptimizationStats::new();
        self.diagnostics.clear();

        for mut check in Self::build_checks() {
            let changed = check.run(module);
            if changed {
                stats.record_pass(check.name());
            }
            self.diagnostics.extend(check.diagnostics());
        }
        if self.diagnostics.iter().any(|d| d.is_error()) {
            // Analysis errors are fatal; skip the transforming pipeline
            return stats;
        }

        // Fixed-point loop over the simple subset, per function
        let mut simple = self.build_simple();
        if !simple.is_empty() {
            for func in &mut module.functions {
                let mut iteration = 0;
                loop {
                    let mut changed = false;
                    iteration += 1;
                    for pass in &mut simple {
                        if pass.run_on_function(func) {
                            changed = true;
                            stats.record_pass(pass.name());
                        }
                    }
                    if !changed || iteration >= self.max_iterations {
                        break;
                    }
                }
                stats.iterations = stats.iterations.max(iteration);
            }
        }

        for entry in &mut self.build_late() {
            match entry {
                PassEntry::Function(pass) => {
                    let mut changed = false;
                    for func in &mut module.functions {
                        if pass.run_on_function(func) {
                            changed = true;
                        }
                    }
                    if changed {
                        stats.record_pass(pass.name());
                    }
                    tracing::debug!(pass = pass.name(), changed, "function pass done");
                }
                PassEntry::Module(pass) => {
                    let changed = pass.run(module);
                    if changed {
                        stats.record_pass(pass.name());
                    }
                    self.diagnostics.extend(pass.diagnostics());
                    tracing::debug!(pass = pass.name(), changed, "module pass done");
                }
            }
        }

        stats
    }
}

// ============================================================================
// Constant Folding
// ============================================================================

/// Constant value tracked during folding
#[derive(Debug, Clone, PartialEq)]
enum Const {
    Int { value: i128, bits: u8, signed: bool },
    Float { value: f64, is_f64: bool },
    Bool(bool),
    Unit,
}

/// Constant folding: evaluate constant expressions at compile time.
///
/// Also folds the overflow-checked arithmetic intrinsics: `checked_*`
/// produces a `Maybe` enum value, `saturating_*` clamps to the type
/// bounds, `wrapping_*` wraps modulo the bit width.
pub struct ConstantFolding {
    constants: HashMap<ValueId, Const>,
}

impl ConstantFolding {
    pub fn new() -> Self {
        Self {
            constants: HashMap::new(),
        }
    }

    fn record(&mut self, record: &InstructionRecord) {
        let Some(id) = record.result_id() else { return };
        let constant = match &record.inst {
            Inst::ConstInt {
                value,
                bits,
                signed,
            } => Const::Int {
                value: *value,
                bits: *bits,
                signed: *signed,
            },
            Inst::ConstFloat { value, is_f64 } => Const::Float {
                value: *value,
                is_f64: *is_f64,
            },
            Inst::ConstBool { value } => Const::Bool(*value),
            Inst::ConstUnit => Const::Unit,
            _ => return,
        };
        self.constants.insert(id, constant);
    }

    fn lookup(&self, value: &Value) -> Option<&Const> {
        self.constants.get(&value.id)
    }
}

impl Default for ConstantFolding {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionPass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant_folding"
    }

    fn run_on_function(&mut self, func: &mut Function) -> bool {
        self.constants.clear();
        let mut changed = false;

        // SSA makes a single forward sweep in block order sufficient for
        // collecting constants; folds happen in place
        for block_index in 0..func.blocks.len() {
            for inst_index in 0..func.blocks[block_index].instructions.len() {
                self.record(&func.blocks[block_index].instructions[inst_index]);

                let record = &func.blocks[block_index].instructions[inst_index];
                let folded: Option<Inst> = match &record.inst {
                    Inst::Binary { op, lhs, rhs } => {
                        match (self.lookup(lhs), self.lookup(rhs)) {
                            (Some(a), Some(b)) => fold_binary(*op, a, b),
                            _ => None,
                        }
                    }
                    Inst::Unary { op, operand } => {
                        self.lookup(operand).and_then(|c| fold_unary(*op, c))
                    }
                    Inst::Cast { kind: _, operand, target } => {
                        self.lookup(operand).and_then(|c| fold_cast(c, target))
                    }
                    Inst::Call { callee, args } => {
                        let consts: Option<Vec<&Const>> =
                            args.iter().map(|a| self.lookup(a)).collect();
                        match consts {
                            Some(consts) => fold_intrinsic_scalar(callee, &consts),
                            None => None,
                        }
                    }
                    _ => None,
                };

                if let Some(inst) = folded {
                    let block = &mut func.blocks[block_index];
                    block.instructions[inst_index].inst = inst;
                    changed = true;
                    func.invalidate_analyses();
                    self.record(&func.blocks[block_index].instructions[inst_index]);
                }
            }
        }

        // Select with a constant condition forwards one of its operands
        let mut replacements: HashMap<ValueId, Value> = HashMap::new();
        for block in &mut func.blocks {
            block.instructions.retain(|record| {
                if let Inst::Select {
                    cond,
                    then_value,
                    else_value,
                } = &record.inst
                    && let Some(Const::Bool(flag)) = self.constants.get(&cond.id)
                    && let Some(result) = record.result_id()
                {
                    let chosen = if *flag { then_value } else { else_value };
                    replacements.insert(result, chosen.clone());
                    return false;
                }
                true
            });
        }
        if !replacements.is_empty() {
            rewrite_uses(func, &replacements);
            changed = true;
        }

        if changed {
            func.invalidate_analyses();
        }
        changed
    }
}

fn wrap_to_width(value: i128, bits: u8, signed: bool) -> i128 {
    if bits == 0 || bits >= 128 {
        return value;
    }
    let mask: i128 = (1i128 << bits) - 1;
    let wrapped = value & mask;
    if signed {
        let sign_bit = 1i128 << (bits - 1);
        if wrapped & sign_bit != 0 {
            wrapped - (1i128 << bits)
        } else {
            wrapped
        }
    } else {
        wrapped
    }
}

fn int_bounds(bits: u8, signed: bool) -> (i128, i128) {
    if signed {
        let max = (1i128 << (bits - 1)) - 1;
        (-max - 1, max)
    } else if bits >= 127 {
        (0, i128::MAX)
    } else {
        (0, (1i128 << bits) - 1)
    }
}

fn fold_binary(op: BinOp, a: &Const, b: &Const) -> Option<Inst> {
    match (a, b) {
        (
            Const::Int {
                value: x,
                bits,
                signed,
            },
            Const::Int { value: y, .. },
        ) => {
            let (bits, signed) = (*bits, *signed);
            let (x, y) = (*x, *y);
            let int = |v: i128| {
                Some(Inst::ConstInt {
                    value: wrap_to_width(v, bits, signed),
                    bits,
                    signed,
                })
            };
            let boolean = |v: bool| Some(Inst::ConstBool { value: v });
            match op {
                BinOp::Add => int(x.checked_add(y)?),
                BinOp::Sub => int(x.checked_sub(y)?),
                BinOp::Mul => int(x.checked_mul(y)?),
                BinOp::Div => {
                    if y == 0 {
                        None
                    } else {
                        int(x / y)
                    }
                }
                BinOp::Mod => {
                    if y == 0 {
                        None
                    } else {
                        int(x % y)
                    }
                }
                BinOp::Eq => boolean(x == y),
                BinOp::Ne => boolean(x != y),
                BinOp::Lt => boolean(x < y),
                BinOp::Le => boolean(x <= y),
                BinOp::Gt => boolean(x > y),
                BinOp::Ge => boolean(x >= y),
                BinOp::BitAnd => int(x & y),
                BinOp::BitOr => int(x | y),
                BinOp::BitXor => int(x ^ y),
                BinOp::Shl => int(x.checked_shl(u32::try_from(y).ok()?)?),
                BinOp::Shr => int(x.checked_shr(u32::try_from(y).ok()?)?),
                BinOp::And | BinOp::Or => None,
            }
        }
        (Const::Float { value: x, is_f64 }, Const::Float { value: y, .. }) => {
            let is_f64 = *is_f64;
            let (x, y) = (*x, *y);
            let float = |v: f64| {
                Some(Inst::ConstFloat {
                    value: v,
                    is_f64,
                })
            };
            let boolean = |v: bool| Some(Inst::ConstBool { value: v });
            match op {
                BinOp::Add => float(x + y),
                BinOp::Sub => float(x - y),
                BinOp::Mul => float(x * y),
                BinOp::Div => float(x / y),
                BinOp::Eq => boolean(x == y),
                BinOp::Ne => boolean(x != y),
                BinOp::Lt => boolean(x < y),
                BinOp::Le => boolean(x <= y),
                BinOp::Gt => boolean(x > y),
                BinOp::Ge => boolean(x >= y),
                _ => None,
            }
        }
        (Const::Bool(x), Const::Bool(y)) => {
            let boolean = |v: bool| Some(Inst::ConstBool { value: v });
            match op {
                BinOp::And => boolean(*x && *y),
                BinOp::Or => boolean(*x || *y),
                BinOp::Eq => boolean(x == y),
                BinOp::Ne => boolean(x != y),
                _ => None,
            }
        }
        _ => None,
    }
}

fn fold_unary(op: UnaryOp, operand: &Const) -> Option<Inst> {
    match (op, operand) {
        (
            UnaryOp::Neg,
            Const::Int {
                value,
                bits,
                signed,
            },
        ) => Some(Inst::ConstInt {
            value: wrap_to_width(-value, *bits, *signed),
            bits: *bits,
            signed: *signed,
        }),
        (UnaryOp::Neg, Const::Float { value, is_f64 }) => Some(Inst::ConstFloat {
            value: -value,
            is_f64: *is_f64,
        }),
        (UnaryOp::Not, Const::Bool(value)) => Some(Inst::ConstBool { value: !value }),
        (
            UnaryOp::BitNot,
            Const::Int {
                value,
                bits,
                signed,
            },
        ) => Some(Inst::ConstInt {
            value: wrap_to_width(!value, *bits, *signed),
            bits: *bits,
            signed: *signed,
        }),
        _ => None,
    }
}

fn fold_cast(operand: &Const, target: &Type) -> Option<Inst> {
    match operand {
        Const::Int { value, .. } if target.is_integer() => {
            let bits = target.bit_width().min(128) as u8;
            let signed = target.is_signed();
            Some(Inst::ConstInt {
                value: wrap_to_width(*value, bits, signed),
                bits,
                signed,
            })
        }
        Const::Int { value, .. } if target.is_float() => Some(Inst::ConstFloat {
            value: *value as f64,
            is_f64: matches!(target, Type::F64),
        }),
        Const::Float { value, .. } if target.is_integer() => {
            let bits = target.bit_width().min(128) as u8;
            let signed = target.is_signed();
            Some(Inst::ConstInt {
                value: wrap_to_width(*value as i128, bits, signed),
                bits,
                signed,
            })
        }
        Const::Float { value, .. } if target.is_float() => Some(Inst::ConstFloat {
            value: *value,
            is_f64: matches!(target, Type::F64),
        }),
        _ => None,
    }
}

/// Fold `saturating_*` and `wrapping_*` intrinsics with constant
/// arguments; `checked_*` needs an enum result and is left to runtime.
fn fold_intrinsic_scalar(callee: &str, args: &[&Const]) -> Option<Inst> {
    let (_, method) = callee.split_once('_')?;
    if args.len() != 2 {
        return None;
    }
    let (
        Const::Int {
            value: x,
            bits,
            signed,
        },
        Const::Int { value: y, .. },
    ) = (args[0], args[1])
    else {
        return None;
    };
    let (bits, signed) = (*bits, *signed);
    let raw = match method {
        "saturating_add" | "wrapping_add" => x.checked_add(*y)?,
        "saturating_sub" | "wrapping_sub" => x.checked_sub(*y)?,
        "saturating_mul" | "wrapping_mul" => x.checked_mul(*y)?,
        _ => return None,
    };
    let value = if method.starts_with("saturating") {
        let (min, max) = int_bounds(bits, signed);
        raw.clamp(min, max)
    } else {
        wrap_to_width(raw, bits, signed)
    };
    Some(Inst::ConstInt {
        value,
        bits,
        signed,
    })
}

/// Rewrite all operand uses according to a replacement map
pub(crate) fn rewrite_uses(func: &mut Function, replacements: &HashMap<ValueId, Value>) {
    if replacements.is_empty() {
        return;
    }
    let apply = |value: &mut Value| {
        let mut guard = 0;
        while let Some(replacement) = replacements.get(&value.id) {
            *value = replacement.clone();
            guard += 1;
            if guard > 64 {
                break;
            }
        }
    };
    for block in &mut func.blocks {
        for record in &mut block.instructions {
            record.inst.for_each_operand_mut(apply);
        }
        if let Some(term) = &mut block.terminator {
            term.for_each_operand_mut(apply);
        }
    }
    func.invalidate_analyses();
}

// ============================================================================
// Dead Code Elimination
// ============================================================================

/// Dead-code elimination: removes unreachable blocks, prunes phi inputs
/// from removed predecessors, folds single-input phis, and deletes
/// side-effect-free instructions whose results are never used.
pub struct DeadCodeElimination;

impl DeadCodeElimination {
    pub fn new() -> Self {
        Self
    }

    fn remove_unreachable_blocks(func: &mut Function) -> bool {
        let reachable = func.reachable_blocks();
        let before = func.blocks.len();
        func.blocks.retain(|b| reachable.contains(&b.id));
        let changed = func.blocks.len() != before;
        if changed {
            func.invalidate_analyses();
        }
        changed
    }

    fn prune_phis(func: &mut Function) -> bool {
        let mut changed = false;
        let mut replacements: HashMap<ValueId, Value> = HashMap::new();

        let block_ids: Vec<_> = func.blocks.iter().map(|b| b.id).collect();
        for id in block_ids {
            let preds = func.predecessors(id);
            let Some(block) = func.blocks.iter_mut().find(|b| b.id == id) else {
                continue;
            };
            block.instructions.retain_mut(|record| {
                let result_id = record.result_id();
                if let Inst::Phi { incomings } = &mut record.inst {
                    let before = incomings.len();
                    incomings.retain(|(_, b)| preds.contains(b));
                    if incomings.len() != before {
                        changed = true;
                    }
                    if incomings.len() == 1
                        && let Some(result) = result_id
                    {
                        replacements.insert(result, incomings[0].0.clone());
                        changed = true;
                        return false;
                    }
                }
                true
            });
        }

        if !replacements.is_empty() {
            rewrite_uses(func, &replacements);
        }
        if changed {
            func.invalidate_analyses();
        }
        changed
    }

    fn sweep_dead_instructions(func: &mut Function) -> bool {
        let mut changed = false;
        loop {
            let mut used: std::collections::HashSet<ValueId> = std::collections::HashSet::new();
            for block in &func.blocks {
                for record in &block.instructions {
                    record.inst.for_each_operand(|v| {
                        used.insert(v.id);
                    });
                }
                if let Some(term) = &block.terminator {
                    term.for_each_operand(|v| {
                        used.insert(v.id);
                    });
                }
            }

            let mut removed = false;
            for block in &mut func.blocks {
                let before = block.instructions.len();
                block.instructions.retain(|record| {
                    if record.inst.has_side_effects() {
                        return true;
                    }
                    match record.result_id() {
                        Some(id) => used.contains(&id),
                        None => true,
                    }
                });
                if block.instructions.len() != before {
                    removed = true;
                }
            }
            if !removed {
                break;
            }
            changed = true;
        }
        if changed {
            func.invalidate_analyses();
        }
        changed
    }
}

impl Default for DeadCodeElimination {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead_code_elimination"
    }

    fn run_on_function(&mut self, func: &mut Function) -> bool {
        let mut changed = false;
        changed |= Self::remove_unreachable_blocks(func);
        changed |= Self::prune_phis(func);
        changed |= Self::sweep_dead_instructions(func);
        changed
    }
}

// ============================================================================
// Simple Common Subexpression Elimination
// ============================================================================

/// Block-local CSE over pure instructions: two structurally identical
/// computations of the same operands collapse to the first
pub struct SimpleCse;

impl SimpleCse {
    pub fn new() -> Self {
        Self
    }

    /// Structural key for a pure instruction, or None if not eligible
    fn key(inst: &Inst) -> Option<String> {
        let eligible = matches!(
            inst,
            Inst::Binary { .. }
                | Inst::Unary { .. }
                | Inst::ExtractValue { .. }
                | Inst::GetElementPtr { .. }
                | Inst::Cast { .. }
                | Inst::Select { .. }
        );
        if !eligible {
            return None;
        }
        let mut key = format!("{}", inst.discriminant());
        match inst {
            Inst::Binary { op, .. } => key.push_str(&format!(":{op:?}")),
            Inst::Unary { op, .. } => key.push_str(&format!(":{op:?}")),
            Inst::Cast { kind, target, .. } => {
                key.push_str(&format!(":{kind:?}:{}", target.mangle()))
            }
            Inst::ExtractValue { indices, .. } => key.push_str(&format!(":{indices:?}")),
            _ => {}
        }
        inst.for_each_operand(|v| key.push_str(&format!(":%{}", v.id)));
        Some(key)
    }
}

impl Default for SimpleCse {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionPass for SimpleCse {
    fn name(&self) -> &'static str {
        "simple_cse"
    }

    fn run_on_function(&mut self, func: &mut Function) -> bool {
        let mut replacements: HashMap<ValueId, Value> = HashMap::new();

        for block in &mut func.blocks {
            let mut available: HashMap<String, Value> = HashMap::new();
            block.instructions.retain(|record| {
                let Some(key) = Self::key(&record.inst) else {
                    return true;
                };
                let Some(result) = &record.result else {
                    return true;
                };
                match available.get(&key) {
                    Some(existing) => {
                        replacements.insert(result.id, existing.clone());
                        false
                    }
                    None => {
                        available.insert(key, result.clone());
                        true
                    }
                }
            });
        }

        let changed = !replacements.is_empty();
        rewrite_uses(func, &replacements);
        changed
    }
}

// ============================================================================
// Branch Simplification
// ============================================================================

/// Replace conditional branches on constants and switches on constants
/// with direct branches
pub struct SimplifyBranches;

impl SimplifyBranches {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SimplifyBranches {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionPass for SimplifyBranches {
    fn name(&self) -> &'static str {
        "simplify_branches"
    }

    fn run_on_function(&mut self, func: &mut Function) -> bool {
        // Collect constants defined in the function
        let mut const_bools: HashMap<ValueId, bool> = HashMap::new();
        let mut const_ints: HashMap<ValueId, i128> = HashMap::new();
        for block in &func.blocks {
            for record in &block.instructions {
                if let Some(id) = record.result_id() {
                    match &record.inst {
                        Inst::ConstBool { value } => {
                            const_bools.insert(id, *value);
                        }
                        Inst::ConstInt { value, .. } => {
                            const_ints.insert(id, *value);
                        }
                        _ => {}
                    }
                }
            }
        }

        let mut changed = false;
        for block in &mut func.blocks {
            let new_term = match &block.terminator {
                Some(Terminator::CondBranch {
                    cond,
                    then_block,
                    else_block,
                }) => const_bools.get(&cond.id).map(|flag| {
                    Terminator::Branch(if *flag { *then_block } else { *else_block })
                }),
                Some(Terminator::Switch {
                    disc,
                    cases,
                    default,
                }) => const_ints.get(&disc.id).map(|value| {
                    let target = cases
                        .iter()
                        .find(|(case, _)| i128::from(*case) == *value)
                        .map(|(_, block)| *block)
                        .unwrap_or(*default);
                    Terminator::Branch(target)
                }),
                _ => None,
            };
            if let Some(term) = new_term {
                block.terminator = Some(term);
                changed = true;
            }
        }

        if changed {
            func.invalidate_analyses();
            // Dead edges may have invalidated phi inputs
            DeadCodeElimination::prune_phis(func);
        }
        changed
    }
}

// ============================================================================
// Inlining
// ============================================================================

/// Inlines small single-block functions at direct call sites.
///
/// Aggressive mode raises the size threshold; attached profile data raises
/// it further for hot callees.
pub struct InlinePass {
    aggressive: bool,
    profile: Option<ProfileData>,
    inlined: usize,
}

impl InlinePass {
    pub fn new(aggressive: bool) -> Self {
        Self {
            aggressive,
            profile: None,
            inlined: 0,
        }
    }

    pub fn set_profile(&mut self, profile: ProfileData) {
        self.profile = Some(profile);
    }

    pub fn inlined(&self) -> usize {
        self.inlined
    }

    fn threshold_for(&self, callee: &str) -> usize {
        let base = if self.aggressive { 32 } else { 8 };
        match &self.profile {
            Some(profile) if profile.is_hot(callee) => base * 2,
            _ => base,
        }
    }

    /// A callee is inlinable when it is a single returning block with no
    /// calls back into itself and no calling-convention surprises
    fn inlinable(func: &Function) -> bool {
        if func.is_async || func.uses_sret || func.blocks.len() != 1 {
            return false;
        }
        let entry = &func.blocks[0];
        if !matches!(entry.terminator, Some(Terminator::Return(_))) {
            return false;
        }
        !entry
            .instructions
            .iter()
            .any(|r| r.inst.callee() == Some(func.name.as_str()))
    }
}

impl ModulePass for InlinePass {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn run(&mut self, module: &mut Module) -> bool {
        self.inlined = 0;

        // Snapshot inlinable callees (instructions + return operand)
        let mut candidates: HashMap<String, (Vec<InstructionRecord>, Option<Value>, Vec<ValueId>)> =
            HashMap::new();
        for func in &module.functions {
            if Self::inlinable(func) {
                let entry = &func.blocks[0];
                let ret = match &entry.terminator {
                    Some(Terminator::Return(v)) => v.clone(),
                    _ => None,
                };
                let param_ids = func.params.iter().map(|p| p.value_id).collect();
                candidates.insert(
                    func.name.clone(),
                    (entry.instructions.clone(), ret, param_ids),
                );
            }
        }
        if candidates.is_empty() {
            return false;
        }

        let mut changed = false;
        for func in &mut module.functions {
            let mut replacements: HashMap<ValueId, Value> = HashMap::new();
            for block_index in 0..func.blocks.len() {
                let mut inst_index = 0;
                while inst_index < func.blocks[block_index].instructions.len() {
                    let (callee_name, args, result) = {
                        let record = &func.blocks[block_index].instructions[inst_index];
                        match (&record.inst, &record.result) {
                            (Inst::Call { callee, args }, result) => {
                                (callee.clone(), args.clone(), result.clone())
                            }
                            _ => {
                                inst_index += 1;
                                continue;
                            }
                        }
                    };

                    let Some((body, ret, param_ids)) = candidates.get(&callee_name) else {
                        inst_index += 1;
                        continue;
                    };
                    if callee_name == func.name || body.len() > self.threshold_for(&callee_name) {
                        inst_index += 1;
                        continue;
                    }
                    if param_ids.len() != args.len() {
                        inst_index += 1;
                        continue;
                    }

                    // Remap callee values into the caller's value space
                    let mut value_map: HashMap<ValueId, Value> = param_ids
                        .iter()
                        .zip(args.iter())
                        .map(|(id, arg)| (*id, arg.clone()))
                        .collect();
                    let mut remapped: Vec<InstructionRecord> = Vec::with_capacity(body.len());
                    for record in body {
                        let mut inst = record.inst.clone();
                        inst.for_each_operand_mut(|v| {
                            if let Some(mapped) = value_map.get(&v.id) {
                                *v = mapped.clone();
                            }
                        });
                        let new_result = record.result.as_ref().map(|r| {
                            let fresh = func.fresh_value(r.ty.clone());
                            value_map.insert(r.id, fresh.clone());
                            fresh
                        });
                        remapped.push(InstructionRecord::new(inst, new_result, record.span));
                    }

                    // The call result becomes the callee's mapped return value
                    if let (Some(call_result), Some(ret_value)) = (&result, ret) {
                        let mapped = value_map
                            .get(&ret_value.id)
                            .cloned()
                            .unwrap_or_else(|| ret_value.clone());
                        replacements.insert(call_result.id, mapped);
                    }

                    let inlined_len = remapped.len();
                    let block = &mut func.blocks[block_index];
                    block.instructions.remove(inst_index);
                    for (offset, record) in remapped.into_iter().enumerate() {
                        block.instructions.insert(inst_index + offset, record);
                    }

                    self.inlined += 1;
                    changed = true;
                    // Skip over the inlined body; nested inlining happens on
                    // a later run of the pass
                    inst_index += inlined_len;
                }
            }
            rewrite_uses(func, &replacements);
        }

        tracing::debug!(inlined = self.inlined, "inline pass finished");
        changed
    }
}

// ============================================================================
// Profile-Guided Block Layout
// ============================================================================

/// Reorders blocks so profile-hot blocks sit close to the entry, giving
/// the back-end a fall-through-friendly layout. No-op without profile data.
pub struct BlockLayoutPass {
    profile: Option<ProfileData>,
    reordered: usize,
}

impl BlockLayoutPass {
    pub fn new() -> Self {
        Self {
            profile: None,
            reordered: 0,
        }
    }

    pub fn set_profile(&mut self, profile: ProfileData) {
        self.profile = Some(profile);
    }
}

impl Default for BlockLayoutPass {
    fn default() -> Self {
        Self::new()
    }
}

impl ModulePass for BlockLayoutPass {
    fn name(&self) -> &'static str {
        "block_layout"
    }

    fn run(&mut self, module: &mut Module) -> bool {
        let Some(profile) = &self.profile else {
            return false;
        };
        self.reordered = 0;

        for func in &mut module.functions {
            let Some(hot) = profile.hot_blocks.get(&func.name) else {
                continue;
            };
            if func.blocks.len() < 3 {
                continue;
            }
            let rank = |id: u32| hot.iter().position(|&h| h == id).unwrap_or(usize::MAX);
            // Entry stays first; hot blocks bubble up behind it
            let before: Vec<u32> = func.blocks.iter().map(|b| b.id).collect();
            let entry = func.blocks[0].id;
            func.blocks[1..].sort_by_key(|b| rank(b.id));
            debug_assert_eq!(func.blocks[0].id, entry);
            let after: Vec<u32> = func.blocks.iter().map(|b| b.id).collect();
            if before != after {
                self.reordered += 1;
                func.invalidate_analyses();
            }
        }
        self.reordered > 0
    }
}
